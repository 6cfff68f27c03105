use std::path::PathBuf;
use std::time::Duration;

use rulewatch_core::config::Layout;
use rulewatch_core::tenant::TenantScope;
use rulewatch_daemon::lifecycle::{
    ChildCommand, ChildExit, ChildPids, ROOT_EXCLUDE_ENV, spawn_tenants, supervise, tenant_scope,
};
use tokio_util::sync::CancellationToken;

fn shell(script: &str) -> ChildCommand {
    ChildCommand {
        program: PathBuf::from("/bin/sh"),
        base_args: vec!["-c".to_string(), script.to_string()],
    }
}

fn tenants(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| name.to_string()).collect()
}

#[tokio::test]
async fn sigint_is_forwarded_on_shutdown() {
    let pids = ChildPids::default();
    let processes = spawn_tenants(&shell("exec sleep 30"), &tenants(&["alpha", "."]), &pids);
    assert_eq!(processes.len(), 2);
    assert_eq!(pids.len(), 2);

    let cancel = CancellationToken::new();
    let supervisor = tokio::spawn(supervise(
        processes,
        cancel.clone(),
        Duration::from_secs(10),
        pids.clone(),
    ));
    tokio::time::sleep(Duration::from_millis(200)).await;
    cancel.cancel();

    let exits = tokio::time::timeout(Duration::from_secs(5), supervisor)
        .await
        .expect("children stop within grace")
        .unwrap();
    assert_eq!(exits.len(), 2);
    for (_, exit) in exits {
        assert_eq!(exit, ChildExit::Signalled(2));
    }
    assert!(pids.is_empty());
}

#[tokio::test]
async fn children_ignoring_sigint_are_killed_after_grace() {
    let pids = ChildPids::default();
    let processes = spawn_tenants(&shell("trap '' INT; exec sleep 5"), &tenants(&["stubborn"]), &pids);

    let cancel = CancellationToken::new();
    let supervisor = tokio::spawn(supervise(
        processes,
        cancel.clone(),
        Duration::from_millis(300),
        pids.clone(),
    ));
    tokio::time::sleep(Duration::from_millis(200)).await;
    cancel.cancel();

    let exits = tokio::time::timeout(Duration::from_secs(4), supervisor)
        .await
        .expect("stubborn child killed")
        .unwrap();
    assert_eq!(exits, vec![("stubborn".to_string(), ChildExit::Killed)]);
}

#[tokio::test]
async fn early_exit_is_reported_without_restart() {
    let pids = ChildPids::default();
    let processes = spawn_tenants(&shell("exit 3"), &tenants(&["broken"]), &pids);

    let exits = supervise(processes, CancellationToken::new(), Duration::from_secs(1), pids.clone()).await;
    assert_eq!(exits, vec![("broken".to_string(), ChildExit::Exited(3))]);
    assert!(pids.is_empty());
}

#[tokio::test]
async fn tenant_name_is_passed_to_the_child() {
    let tmp = tempfile::tempdir().unwrap();
    let out = tmp.path().join("argv");
    let script = format!("printf '%s %s' \"$0\" \"$1\" > '{}'", out.display());
    let pids = ChildPids::default();
    let processes = spawn_tenants(&shell(&script), &tenants(&["alpha"]), &pids);

    let exits = supervise(processes, CancellationToken::new(), Duration::from_secs(1), pids).await;
    assert_eq!(exits[0].1, ChildExit::Exited(0));
    assert_eq!(std::fs::read_to_string(out).unwrap(), "tenant alpha");
}

#[tokio::test]
async fn root_tenant_receives_the_parent_roster() {
    let tmp = tempfile::tempdir().unwrap();
    let script = format!(
        "printf '%s' \"${{{ROOT_EXCLUDE_ENV}:-unset}}\" > '{}/out-'\"$1\"",
        tmp.path().display()
    );
    let pids = ChildPids::default();
    let processes = spawn_tenants(&shell(&script), &tenants(&["alpha", "beta", "."]), &pids);

    let exits = supervise(processes, CancellationToken::new(), Duration::from_secs(1), pids).await;
    assert!(exits.iter().all(|(_, exit)| *exit == ChildExit::Exited(0)));

    let root = std::fs::read_to_string(tmp.path().join("out-.")).unwrap();
    assert_eq!(root, r#"["alpha","beta"]"#);
    let layout = Layout::new(tmp.path().join("meta"), tmp.path().join("files"));
    let scope = tenant_scope(&layout, ".", Some(&root)).unwrap();
    assert!(!scope.covers("alpha"));
    assert!(scope.covers("gamma"));
}

#[test]
fn root_scope_without_roster_excludes_present_tenants() {
    let tmp = tempfile::tempdir().unwrap();
    let meta = tmp.path().join("meta");
    std::fs::create_dir_all(meta.join("alpha")).unwrap();
    let layout = Layout::new(&meta, tmp.path().join("files"));

    let scope = tenant_scope(&layout, ".", None).unwrap();
    assert!(!scope.covers("alpha"));
    assert!(scope.covers("late"));
    assert_eq!(
        tenant_scope(&layout, "alpha", Some("[]")).unwrap(),
        TenantScope::Concrete("alpha".into())
    );
    assert!(tenant_scope(&layout, ".", Some("not json")).is_err());
}
