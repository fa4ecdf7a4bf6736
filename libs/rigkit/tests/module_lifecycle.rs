#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Module supervisor scenarios: rename without restart, fail-on-first
//! recovery, crash handling, and start-failure bookkeeping.

use std::time::Duration;
use tracing_test::traced_test;

use rigkit::graph::NodeState;
use rigkit::module::ModuleRunState;
use rigkit::test_support::{
    TestFixture, component, config_of, module, module_with_env, wait_until,
};

const TESTMOD1: &str = "/opt/testmod1";
const TESTMOD2: &str = "/opt/testmod2";

fn fixture_with_helper_modules() -> TestFixture {
    let fx = TestFixture::new();
    fx.modules.register_binary(TESTMOD1, &["mod:helper"]);
    fx.modules.register_binary(TESTMOD2, &["mod2:helper2"]);
    fx
}

/// The three-component arrangement used across the module scenarios:
/// `h` on module `mod`, `h2` on `mod2` depending on `h`, `h3` builtin
/// depending on `h`.
fn helper_components() -> Vec<rigkit::ResourceConfig> {
    vec![
        component("h", "generic", "mod:helper", &[]),
        component("h2", "generic", "mod2:helper2", &["h"]),
        component("h3", "generic", "fake", &["h"]),
    ]
}

fn states(fx: &TestFixture) -> std::collections::BTreeMap<String, NodeState> {
    fx.manager
        .resource_statuses()
        .into_iter()
        .map(|s| (s.name.short_string(), s.state))
        .collect()
}

#[tokio::test]
async fn module_rename_preserves_dependents() {
    let fx = fixture_with_helper_modules();

    let config = config_of(
        vec![module("mod", TESTMOD1), module("mod2", TESTMOD2)],
        vec![],
        helper_components(),
        vec![],
    );
    fx.manager.reconfigure(config).await.unwrap();

    let states = states(&fx);
    for name in ["h", "h2", "h3"] {
        assert_eq!(states[name], NodeState::Ready, "{name} should be ready");
    }

    // Rename `mod` to `mod1`, changing nothing else.
    let renamed = config_of(
        vec![module("mod1", TESTMOD1), module("mod2", TESTMOD2)],
        vec![],
        helper_components(),
        vec![],
    );
    fx.manager.reconfigure(renamed).await.unwrap();

    let after = self::states(&fx);
    for name in ["h", "h2", "h3"] {
        assert_eq!(after[name], NodeState::Ready, "{name} should survive the rename");
    }
    // The module was not restarted for the rename.
    assert_eq!(fx.modules.spawn_count(TESTMOD1), 1);
    assert_eq!(
        fx.manager.modules().module_state("mod1"),
        Some(ModuleRunState::Running)
    );

    let h = fx.manager.resource("h").unwrap();
    let reply = h
        .do_command(serde_json::json!("get_num_reconfigurations"))
        .await
        .unwrap();
    assert!(reply["num_reconfigurations"].is_u64());

    let h2 = fx.manager.resource("h2").unwrap();
    let echoed = h2.do_command(serde_json::json!("echo_dep")).await.unwrap();
    assert_eq!(echoed, serde_json::json!({"command": "echo"}));
}

#[tokio::test]
async fn fail_on_first_construction_recovers_on_retry() {
    let fx = fixture_with_helper_modules();

    let config = config_of(
        vec![
            module_with_env("mod", TESTMOD1, &[("VIAM_TESTMODULE_FAIL_ON_FIRST", "1")]),
            module("mod2", TESTMOD2),
        ],
        vec![],
        helper_components(),
        vec![],
    );
    fx.manager.reconfigure(config).await.unwrap();

    let erred = states(&fx);
    for name in ["h", "h2", "h3"] {
        assert_eq!(erred[name], NodeState::Erred, "{name} should have erred");
    }

    // One retry pass heals the whole chain: `h` succeeds on its second
    // construction, and its dependents follow in the same pass.
    let changed = fx.manager.update_remotes_and_retry_resource_configure().await;
    assert!(changed);

    let healed = states(&fx);
    for name in ["h", "h2", "h3"] {
        assert_eq!(healed[name], NodeState::Ready, "{name} should have recovered");
    }
    let h2 = fx.manager.resource("h2").unwrap();
    let echoed = h2.do_command(serde_json::json!("echo_dep")).await.unwrap();
    assert_eq!(echoed, serde_json::json!({"command": "echo"}));
}

#[tokio::test]
#[traced_test]
async fn module_crash_preserves_nodes_and_recovers() {
    let mut fx = fixture_with_helper_modules();

    let config = config_of(
        vec![module("mod", TESTMOD1), module("mod2", TESTMOD2)],
        vec![],
        helper_components(),
        vec![],
    );
    fx.manager.reconfigure(config).await.unwrap();
    let _worker = fx.start_worker(Duration::from_millis(100));

    // Disable the binary first so restart attempts fail, then kill.
    fx.modules.set_disabled(TESTMOD1, true);
    let h = fx.manager.resource("h").unwrap();
    let reply = h
        .do_command(serde_json::json!({"command": "kill_module"}))
        .await
        .unwrap();
    assert_eq!(reply["killed"], true);

    assert!(
        wait_until(Duration::from_secs(5), || {
            fx.manager.failed_modules() == vec!["mod".to_owned()]
        })
        .await,
        "module should be reported as failed after the crash"
    );
    assert!(logs_contain("Module has unexpectedly exited."));

    // Nodes are preserved; operations fail with a transport error.
    assert!(fx.has_resource("h"));
    let err = h.do_command(serde_json::json!("echo")).await.unwrap_err();
    assert!(err.to_string().contains("rpc error"), "got: {err}");
    let h2 = fx.manager.resource("h2").unwrap();
    let err = h2.do_command(serde_json::json!("echo_dep")).await.unwrap_err();
    assert!(err.to_string().contains("rpc error"), "got: {err}");
    assert!(fx.manager.resource("h3").is_ok());

    assert!(
        wait_until(Duration::from_secs(10), || {
            logs_contain("Error while restarting crashed module")
        })
        .await,
        "restart attempts against the disabled binary should be logged"
    );

    // Restore the binary: within the deadline the module restarts and its
    // resources are re-added.
    fx.modules.set_disabled(TESTMOD1, false);
    assert!(
        wait_until(Duration::from_secs(20), || {
            logs_contain("Module resources successfully re-added after module restart")
        })
        .await,
        "module resources should be re-added after the binary returns"
    );
    assert!(
        wait_until(Duration::from_secs(5), || fx.manager.failed_modules().is_empty()).await
    );

    let reply = h.do_command(serde_json::json!("echo")).await.unwrap();
    assert_eq!(reply, serde_json::json!("echo"));
    let echoed = h2.do_command(serde_json::json!("echo_dep")).await.unwrap();
    assert_eq!(echoed, serde_json::json!({"command": "echo"}));

    fx.cancel.cancel();
}

#[tokio::test]
async fn bad_exec_paths_accumulate_in_failed_modules() {
    let fx = TestFixture::new();
    fx.modules.register_binary(TESTMOD1, &["mod4:gizmo"]);

    // mod3 points at a binary that does not exist.
    let config = config_of(
        vec![module("mod3", "/nonexistent/path/to/module1")],
        vec![],
        vec![],
        vec![],
    );
    fx.manager.reconfigure(config).await.unwrap();
    assert_eq!(fx.manager.failed_modules(), vec!["mod3".to_owned()]);
    assert_eq!(
        fx.manager.modules().module_state("mod3"),
        Some(ModuleRunState::Failed)
    );

    // mod4 has a valid path but panics at startup.
    let config = config_of(
        vec![
            module("mod3", "/nonexistent/path/to/module1"),
            module_with_env("mod4", TESTMOD1, &[("VIAM_TESTMODULE_PANIC", "1")]),
        ],
        vec![],
        vec![],
        vec![],
    );
    fx.manager.reconfigure(config).await.unwrap();
    assert_eq!(
        fx.manager.failed_modules(),
        vec!["mod3".to_owned(), "mod4".to_owned()]
    );

    // Fixing mod4's environment clears it; mod3 stays until its config
    // changes too.
    let config = config_of(
        vec![
            module("mod3", "/nonexistent/path/to/module1"),
            module("mod4", TESTMOD1),
        ],
        vec![],
        vec![],
        vec![],
    );
    fx.manager.reconfigure(config).await.unwrap();
    assert_eq!(fx.manager.failed_modules(), vec!["mod3".to_owned()]);

    let config = config_of(
        vec![module("mod3", TESTMOD1), module("mod4", TESTMOD1)],
        vec![],
        vec![],
        vec![],
    );
    fx.manager.reconfigure(config).await.unwrap();
    assert_eq!(fx.manager.failed_modules(), Vec::<String>::new());
}

#[tokio::test]
async fn renaming_a_failed_module_clears_failed_through_a_fresh_start() {
    let fx = TestFixture::new();

    // mod3's binary does not exist; the module fails to start and its
    // resource node errs but stays in the graph.
    let config = config_of(
        vec![module("mod3", "/opt/testmod3")],
        vec![],
        vec![component("h", "generic", "mod3:helper", &[])],
        vec![],
    );
    fx.manager.reconfigure(config).await.unwrap();
    assert_eq!(fx.manager.failed_modules(), vec!["mod3".to_owned()]);
    assert_eq!(states(&fx)["h"], NodeState::Erred);

    // A rename with the exec path still broken re-attempts the start: the
    // module fails again, but under its new name, not as a stale leftover.
    let renamed = config_of(
        vec![module("mod3a", "/opt/testmod3")],
        vec![],
        vec![component("h", "generic", "mod3:helper", &[])],
        vec![],
    );
    fx.manager.reconfigure(renamed).await.unwrap();
    assert_eq!(fx.manager.failed_modules(), vec!["mod3a".to_owned()]);
    assert_eq!(
        fx.manager.modules().module_state("mod3a"),
        Some(ModuleRunState::Failed)
    );

    // The binary appears on disk. The next config change is only a name
    // change, which is enough to clear `Failed`; the module comes up and its
    // resource is rebuilt in the same commit.
    fx.modules.register_binary("/opt/testmod3", &["mod3:helper"]);
    let renamed_again = config_of(
        vec![module("mod3b", "/opt/testmod3")],
        vec![],
        vec![component("h", "generic", "mod3:helper", &[])],
        vec![],
    );
    fx.manager.reconfigure(renamed_again).await.unwrap();
    assert_eq!(fx.manager.failed_modules(), Vec::<String>::new());
    assert_eq!(
        fx.manager.modules().module_state("mod3b"),
        Some(ModuleRunState::Running)
    );
    assert_eq!(fx.modules.spawn_count("/opt/testmod3"), 1);
    assert_eq!(states(&fx)["h"], NodeState::Ready);

    let h = fx.manager.resource("h").unwrap();
    let reply = h.do_command(serde_json::json!("echo")).await.unwrap();
    assert_eq!(reply, serde_json::json!("echo"));
}

#[tokio::test]
async fn failed_module_keeps_its_resource_nodes() {
    let fx = TestFixture::new();
    // Not registered in the control: every spawn fails.
    let config = config_of(
        vec![module("mod", TESTMOD1)],
        vec![],
        vec![component("h", "generic", "mod:helper", &[])],
        vec![],
    );
    fx.manager.reconfigure(config).await.unwrap();

    assert_eq!(fx.manager.failed_modules(), vec!["mod".to_owned()]);
    // The node exists and is looked up; only its operations fail.
    assert!(fx.has_resource("h"));
    let h = fx.manager.resource("h").unwrap();
    let err = h.do_command(serde_json::json!("echo")).await.unwrap_err();
    assert!(err.to_string().contains("rpc error"), "got: {err}");
}
