//! (e) Crash recovery: sessions left `running` or `starting` in their
//! manifest when the server stops are promoted to `exited(code=-1)` on
//! restart, and their directories survive until an explicit cleanup.
//!
//! This only exercises the manifest/restore path (`SessionManager`), not
//! the router — the router scenarios live in `router_scenarios.rs`.

use tunnelforge::events::EventBus;
use tunnelforge::recording::{self, Manifest};
use tunnelforge::sessions::session::SessionStatus;
use tunnelforge::sessions::SessionManager;

fn manifest(id: &str, status: &str) -> Manifest {
    Manifest {
        id: id.to_string(),
        command: vec!["/bin/sh".to_string()],
        working_dir: "/".to_string(),
        name: None,
        status: status.to_string(),
        cols: 80,
        rows: 24,
        pid: Some(4242),
        created_at: 0,
        exit_code: None,
    }
}

#[tokio::test]
async fn running_and_starting_sessions_are_promoted_to_exited_on_restart() {
    let root = tempfile::tempdir().expect("tempdir");

    let running_dir = root.path().join("running0000001");
    tokio::fs::create_dir_all(&running_dir).await.expect("mkdir");
    recording::write_manifest(&running_dir, &manifest("running0000001", "running"))
        .await
        .expect("write manifest");

    let starting_dir = root.path().join("starting0000002");
    tokio::fs::create_dir_all(&starting_dir).await.expect("mkdir");
    recording::write_manifest(&starting_dir, &manifest("starting0000002", "starting"))
        .await
        .expect("write manifest");

    let manager = SessionManager::new(root.path().to_path_buf(), EventBus::new(), 64, 4096, 0o600);
    manager.restore_on_startup().await;

    for id in ["running0000001", "starting0000002"] {
        let restored = manager.get(id).await.unwrap_or_else(|| panic!("{id} restored from disk"));
        assert_eq!(restored.status().await, SessionStatus::Exited);
        let record = restored.snapshot().await;
        assert_eq!(record.exit_code, Some(-1));
        assert!(record.pid.is_none(), "a recovered session has no live pid");
    }

    // Directories survive restart — only an explicit cleanup removes them,
    // and only once they've outlived the grace period.
    assert!(running_dir.exists());
    assert!(starting_dir.exists());
    let removed = manager.cleanup_exited().await;
    assert!(removed.is_empty(), "freshly restored sessions haven't outlived the cleanup grace period");
    assert!(running_dir.exists());
    assert!(starting_dir.exists());

    // The on-disk manifest itself was rewritten to reflect the promotion.
    let persisted = recording::read_manifest(&running_dir).await.expect("read manifest");
    assert_eq!(persisted.status, "exited");
    assert_eq!(persisted.exit_code, Some(-1));
}

#[tokio::test]
async fn already_exited_sessions_are_left_untouched() {
    let root = tempfile::tempdir().expect("tempdir");
    let dir = root.path().join("exited00000003");
    tokio::fs::create_dir_all(&dir).await.expect("mkdir");
    let mut m = manifest("exited00000003", "exited");
    m.exit_code = Some(7);
    recording::write_manifest(&dir, &m).await.expect("write manifest");

    let manager = SessionManager::new(root.path().to_path_buf(), EventBus::new(), 64, 4096, 0o600);
    manager.restore_on_startup().await;

    let restored = manager.get("exited00000003").await.expect("restored");
    let record = restored.snapshot().await;
    assert_eq!(record.exit_code, Some(7), "a session already marked exited keeps its real exit code");
}
