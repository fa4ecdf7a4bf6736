#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Remote mirroring scenarios: remotes coming and going, and short-name
//! collisions between remotes.

use tracing_test::traced_test;

use rigkit::remote::RemoteSessionState;
use rigkit::test_support::{
    TestFixture, arm_name, component, config_of, remote, remote_with_prefix,
};

const ADDR1: &str = "remote1.local:8080";
const ADDR2: &str = "remote2.local:8080";

#[tokio::test]
async fn remotes_come_and_go() {
    let fx = TestFixture::new();
    fx.network.start(ADDR1, vec![arm_name("remoteArm")]);

    let config = config_of(
        vec![],
        vec![remote("foo", ADDR1), remote("bar", ADDR2)],
        vec![
            component("arm1", "arm", "fake", &["foo:remoteArm"]),
            component("arm2", "arm", "fake", &["bar:remoteArm"]),
        ],
        vec![],
    );
    fx.manager.reconfigure(config).await.unwrap();

    // Only remote1 is up: arm1 and its mirror exist, arm2 does not.
    assert!(fx.has_resource("arm1"));
    assert!(fx.has_resource("foo:remoteArm"));
    assert!(!fx.has_resource("arm2"));
    assert!(!fx.has_resource("bar:remoteArm"));
    assert_eq!(
        fx.manager.remotes().session_state("bar"),
        Some(RemoteSessionState::Dialing)
    );

    // remote2 comes up; a retry pass mirrors it and builds arm2.
    fx.network.start(ADDR2, vec![arm_name("remoteArm")]);
    assert!(fx.manager.update_remotes_and_retry_resource_configure().await);
    for name in ["arm1", "foo:remoteArm", "arm2", "bar:remoteArm"] {
        assert!(fx.has_resource(name), "{name} should be present");
    }

    // remote2 goes down; its mirror and the dependent arm2 disappear.
    fx.network.stop(ADDR2);
    assert!(fx.manager.update_remotes_and_retry_resource_configure().await);
    assert!(!fx.has_resource("arm2"));
    assert!(!fx.has_resource("bar:remoteArm"));
    assert!(fx.has_resource("arm1"));

    // A fresh robot appears on remote2's address; the full set is restored.
    fx.network.start(ADDR2, vec![arm_name("remoteArm")]);
    assert!(fx.manager.update_remotes_and_retry_resource_configure().await);
    for name in ["arm1", "foo:remoteArm", "arm2", "bar:remoteArm"] {
        assert!(fx.has_resource(name), "{name} should be restored");
    }
}

#[tokio::test]
#[traced_test]
async fn ambiguous_short_name_dependency_is_not_built() {
    let fx = TestFixture::new();
    fx.network.start(ADDR1, vec![arm_name("pieceArm")]);
    fx.network.start(ADDR2, vec![arm_name("pieceArm")]);

    let config = config_of(
        vec![],
        vec![remote("foo", ADDR1), remote("bar", ADDR2)],
        vec![component("arm1", "arm", "fake", &["pieceArm"])],
        vec![],
    );
    fx.manager.reconfigure(config).await.unwrap();

    // Both remotes expose the same short name: both mirrors are dropped and
    // the dependent cannot resolve.
    assert!(!fx.has_resource("arm1"));
    assert!(!fx.has_resource("foo:pieceArm"));
    assert!(!fx.has_resource("bar:pieceArm"));
    assert!(logs_contain("collision"));

    // Prefixing one remote disambiguates everything.
    let config = config_of(
        vec![],
        vec![remote("foo", ADDR1), remote_with_prefix("bar", ADDR2, "bar")],
        vec![component("arm1", "arm", "fake", &["pieceArm"])],
        vec![],
    );
    fx.manager.reconfigure(config).await.unwrap();

    for name in ["foo:pieceArm", "bar:barpieceArm", "arm1"] {
        assert!(fx.has_resource(name), "{name} should be present");
    }
    // arm1 resolved its bare dependency to the unique remaining mirror.
    let arm1 = fx.manager.resource("arm1").unwrap();
    assert!(
        arm1.do_command(serde_json::json!("echo")).await.is_ok(),
        "arm1 should be operational"
    );
}

#[tokio::test]
#[traced_test]
async fn local_resource_wins_name_collision_with_remote() {
    let fx = TestFixture::new();
    fx.network.start(ADDR1, vec![arm_name("arm1")]);

    let config = config_of(
        vec![],
        vec![remote("foo", ADDR1)],
        vec![component("arm1", "arm", "fake", &[])],
        vec![],
    );
    fx.manager.reconfigure(config).await.unwrap();

    // The local arm1 exists; the colliding mirror was dropped with a log.
    assert!(fx.has_resource("arm1"));
    assert!(!fx.has_resource("foo:arm1"));
    assert!(logs_contain("collision"));

    // The collision is reported once, not once per reconcile tick.
    let _ = fx.manager.update_remotes_and_retry_resource_configure().await;
    let _ = fx.manager.update_remotes_and_retry_resource_configure().await;
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
async fn remote_removal_tears_down_its_mirrors() {
    let fx = TestFixture::new();
    fx.network.start(ADDR1, vec![arm_name("remoteArm")]);

    let config = config_of(
        vec![],
        vec![remote("foo", ADDR1)],
        vec![],
        vec![],
    );
    fx.manager.reconfigure(config).await.unwrap();
    assert!(fx.has_resource("foo:remoteArm"));

    fx.manager
        .reconfigure(config_of(vec![], vec![], vec![], vec![]))
        .await
        .unwrap();
    assert!(!fx.has_resource("foo:remoteArm"));
    assert_eq!(fx.manager.remotes().session_state("foo"), None);
}
