#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Engine scenarios: duplicate-name collisions, idempotent reconfigures,
//! rollback on cycles, and weak-dependency passes.

use tracing_test::traced_test;

use rigkit::graph::NodeState;
use rigkit::test_support::{TestFixture, component, config_of, module, service};
use rigkit::{Config, ResourceError};

fn two_arm_config() -> Config {
    config_of(
        vec![],
        vec![],
        vec![
            component("base1", "base", "fake", &[]),
            component("arm1", "arm", "fake", &["base1"]),
        ],
        vec![],
    )
}

#[tokio::test]
#[traced_test]
async fn duplicate_local_names_are_dropped_with_one_collision_log() {
    let fx = TestFixture::new();
    let config = config_of(
        vec![],
        vec![],
        vec![
            component("fooArm", "arm", "fake", &[]),
            component("fooArm", "arm", "fake", &[]),
            component("other", "arm", "fake", &[]),
        ],
        vec![],
    );
    fx.manager.reconfigure(config.clone()).await.unwrap();

    assert!(!fx.has_resource("fooArm"));
    assert!(fx.has_resource("other"));
    assert!(matches!(
        fx.manager.resource("fooArm"),
        Err(ResourceError::NotFound(_))
    ));

    // Submitting the identical config again must not log again.
    fx.manager.reconfigure(config).await.unwrap();
    logs_assert(|lines: &[&str]| {
        let count = lines.iter().filter(|l| l.contains("collision")).count();
        if count == 1 {
            Ok(())
        } else {
            Err(format!("expected exactly one collision log, got {count}"))
        }
    });
}

#[tokio::test]
async fn reconfigure_with_identical_config_is_a_noop() {
    let fx = TestFixture::new();
    let config = two_arm_config();
    fx.manager.reconfigure(config.clone()).await.unwrap();

    let arm1 = fx.manager.resource("arm1").unwrap();
    let before = arm1
        .do_command(serde_json::json!("get_num_reconfigurations"))
        .await
        .unwrap();

    fx.manager.reconfigure(config).await.unwrap();

    let after = arm1
        .do_command(serde_json::json!("get_num_reconfigurations"))
        .await
        .unwrap();
    assert_eq!(before, after, "no constructor or reconfigure may run");
    // And a retry pass over a healthy graph reports no change.
    assert!(!fx.manager.update_remotes_and_retry_resource_configure().await);
}

#[tokio::test]
async fn reconfigure_back_and_forth_restores_the_name_set() {
    let fx = TestFixture::new();
    let config_a = two_arm_config();
    let config_b = config_of(
        vec![],
        vec![],
        vec![component("camera1", "camera", "fake", &[])],
        vec![],
    );

    fx.manager.reconfigure(config_a.clone()).await.unwrap();
    let names_a = fx.short_names();

    fx.manager.reconfigure(config_b).await.unwrap();
    assert_eq!(
        fx.short_names(),
        ["camera1".to_owned()].into_iter().collect()
    );

    fx.manager.reconfigure(config_a).await.unwrap();
    assert_eq!(fx.short_names(), names_a);
}

#[tokio::test]
#[traced_test]
async fn cycle_rolls_back_the_whole_commit() {
    let fx = TestFixture::new();
    fx.manager.reconfigure(two_arm_config()).await.unwrap();
    let names_before = fx.short_names();

    let r1 = component("r1", "arm", "fake", &["r2"]);
    let r2 = component("r2", "arm", "fake", &["r1"]);
    let bad = config_of(
        vec![],
        vec![],
        vec![
            component("base1", "base", "fake", &[]),
            component("arm1", "arm", "fake", &["base1"]),
            r1,
            r2,
        ],
        vec![],
    );

    let err = fx.manager.reconfigure(bad).await.unwrap_err();
    assert!(matches!(err, ResourceError::Cycle(_)), "got: {err:?}");
    assert!(logs_contain("rolling back draft changes due to error"));

    // The old graph is preserved untouched.
    assert_eq!(fx.short_names(), names_before);
    for status in fx.manager.resource_statuses() {
        assert_eq!(status.state, NodeState::Ready);
    }
}

#[tokio::test]
async fn ready_nodes_only_ever_depend_on_ready_nodes() {
    let fx = TestFixture::new();
    fx.modules.register_binary("/opt/testmod1", &["mod:helper"]);

    // A chain across a module that fails its first construction: the
    // committed graph must never show a ready dependent of a non-ready node.
    let config = config_of(
        vec![rigkit::test_support::module_with_env(
            "mod",
            "/opt/testmod1",
            &[("VIAM_TESTMODULE_FAIL_ON_FIRST", "1")],
        )],
        vec![],
        vec![
            component("h", "generic", "mod:helper", &[]),
            component("mid", "generic", "fake", &["h"]),
            component("top", "generic", "fake", &["mid"]),
        ],
        vec![],
    );
    fx.manager.reconfigure(config).await.unwrap();

    let check = |fx: &TestFixture| {
        for status in fx.manager.resource_statuses() {
            if status.state == NodeState::Ready {
                for dep in fx.manager.dependencies_of(&status.name) {
                    let dep_status = fx
                        .manager
                        .resource_statuses()
                        .into_iter()
                        .find(|s| s.name == dep)
                        .unwrap();
                    assert_eq!(
                        dep_status.state,
                        NodeState::Ready,
                        "{} is ready but its dependency {} is not",
                        status.name,
                        dep
                    );
                }
            }
        }
    };
    check(&fx);

    let _ = fx.manager.update_remotes_and_retry_resource_configure().await;
    check(&fx);
}

#[tokio::test]
async fn weak_dependents_reconfigure_exactly_once_per_commit() {
    let fx = TestFixture::new();
    let config = config_of(
        vec![],
        vec![],
        vec![
            component("base1", "base", "fake", &[]),
            component("base2", "base", "fake", &[]),
        ],
        vec![service("collector", "datasync", "collector", &[])],
    );
    fx.manager.reconfigure(config).await.unwrap();

    let collector = fx.manager.resource("collector").unwrap();
    let reply = collector
        .do_command(serde_json::json!("get_num_reconfigurations"))
        .await
        .unwrap();
    assert_eq!(
        reply["num_reconfigurations"], 2,
        "initial construction plus one post-commit weak pass"
    );
    let observed = collector
        .do_command(serde_json::json!("get_observed"))
        .await
        .unwrap();
    assert_eq!(observed["observed"].as_array().unwrap().len(), 2);

    // Touch only base1: the weak dependent reconfigures once more.
    let mut base1 = component("base1", "base", "fake", &[]);
    base1.attributes = serde_json::json!({"speed": 2});
    let config = config_of(
        vec![],
        vec![],
        vec![base1, component("base2", "base", "fake", &[])],
        vec![service("collector", "datasync", "collector", &[])],
    );
    fx.manager.reconfigure(config).await.unwrap();

    let reply = collector
        .do_command(serde_json::json!("get_num_reconfigurations"))
        .await
        .unwrap();
    assert_eq!(reply["num_reconfigurations"], 3);
}

#[tokio::test]
async fn removed_resources_are_torn_down_and_dependents_reevaluated() {
    let fx = TestFixture::new();
    fx.manager.reconfigure(two_arm_config()).await.unwrap();
    assert!(fx.has_resource("arm1"));

    // Dropping base1 while keeping arm1 leaves arm1 unresolvable.
    let config = config_of(
        vec![],
        vec![],
        vec![component("arm1", "arm", "fake", &["base1"])],
        vec![],
    );
    fx.manager.reconfigure(config).await.unwrap();
    assert!(!fx.has_resource("base1"));
    assert!(!fx.has_resource("arm1"), "arm1 cannot build without base1");

    // Restoring base1 brings both back through the retry pass.
    fx.manager.reconfigure(two_arm_config()).await.unwrap();
    assert!(fx.has_resource("base1"));
    assert!(fx.has_resource("arm1"));
}

#[tokio::test]
async fn modified_module_marks_descendants_for_reconfigure() {
    let fx = TestFixture::new();
    fx.modules.register_binary("/opt/testmod1", &["mod:helper"]);
    fx.modules.register_binary("/opt/testmod2", &["mod:helper"]);

    let config = config_of(
        vec![module("mod", "/opt/testmod1")],
        vec![],
        vec![
            component("h", "generic", "mod:helper", &[]),
            component("h3", "generic", "fake", &["h"]),
        ],
        vec![],
    );
    fx.manager.reconfigure(config).await.unwrap();
    let h3 = fx.manager.resource("h3").unwrap();
    let before = h3
        .do_command(serde_json::json!("get_num_reconfigurations"))
        .await
        .unwrap()["num_reconfigurations"]
        .as_u64()
        .unwrap();

    // Swap the module binary: the module restarts, h is rebuilt, and h3
    // observes the rebuild.
    let config = config_of(
        vec![module("mod", "/opt/testmod2")],
        vec![],
        vec![
            component("h", "generic", "mod:helper", &[]),
            component("h3", "generic", "fake", &["h"]),
        ],
        vec![],
    );
    fx.manager.reconfigure(config).await.unwrap();
    assert_eq!(fx.modules.spawn_count("/opt/testmod2"), 1);

    let after = h3
        .do_command(serde_json::json!("get_num_reconfigurations"))
        .await
        .unwrap()["num_reconfigurations"]
        .as_u64()
        .unwrap();
    assert_eq!(after, before + 1, "h3 must observe its parent's rebuild");
    for status in fx.manager.resource_statuses() {
        assert_eq!(status.state, NodeState::Ready, "{} not ready", status.name);
    }
}
