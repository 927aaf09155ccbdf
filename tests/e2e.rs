//! End-to-end scenarios against real git repositories, and against a real
//! tmux server where one is available. tmux-dependent cases skip themselves
//! on hosts without tmux.

use std::path::Path;
use std::time::{Duration, Instant};

use claude_squad::app::Controller;
use claude_squad::domains::instance::Status;
use claude_squad::domains::repo;
use claude_squad::domains::storage::{InstanceStorage, State};
use claude_squad::domains::tmux;
use git2::{BranchType, Repository, Signature};
use tempfile::TempDir;

fn init_repo(path: &Path) {
    let mut opts = git2::RepositoryInitOptions::new();
    opts.initial_head("main");
    let repo = Repository::init_opts(path, &opts).unwrap();

    std::fs::write(path.join("README.md"), "# e2e\n").unwrap();
    let mut index = repo.index().unwrap();
    index.add_path(Path::new("README.md")).unwrap();
    index.write().unwrap();
    let tree_id = index.write_tree().unwrap();
    let tree = repo.find_tree(tree_id).unwrap();
    let sig = Signature::now("Test", "test@example.com").unwrap();
    repo.commit(Some("HEAD"), &sig, &sig, "initial commit", &tree, &[])
        .unwrap();

    // Commit operations need an identity inside worktrees too.
    let mut config = repo.config().unwrap();
    config.set_str("user.name", "Test").unwrap();
    config.set_str("user.email", "test@example.com").unwrap();
}

fn tmux_available() -> bool {
    std::process::Command::new("tmux")
        .arg("-V")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

#[tokio::test]
async fn corruption_recovery_restores_backup_and_quarantines_primary() {
    let tmp = TempDir::new().unwrap();
    init_repo(tmp.path());

    // Two saves so both primary and backup hold the same good document.
    let mut state = State::load(tmp.path());
    state
        .save_instances(serde_json::json!([{
            "title": "survivor", "program": "claude", "branch": "s/survivor",
            "worktree_path": "", "base_commit": "", "session_name": "claudesquad_00000000_survivor",
            "status": "paused", "auto_yes": false,
            "repo_path": tmp.path(),
            "created_at": "2026-01-01T00:00:00Z", "updated_at": "2026-01-01T00:00:00Z"
        }]))
        .unwrap();
    state.save().unwrap();

    let state_file = tmp.path().join(".claude-squad").join("state.json");
    std::fs::write(&state_file, "{").unwrap();

    let recovered = State::load(tmp.path());
    assert_eq!(recovered.get_instances()[0]["title"], "survivor");

    let quarantined: Vec<_> = std::fs::read_dir(tmp.path().join(".claude-squad"))
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.file_name()
                .to_string_lossy()
                .starts_with("state.json.corrupted.")
        })
        .collect();
    assert_eq!(quarantined.len(), 1);
    assert_eq!(std::fs::read_to_string(quarantined[0].path()).unwrap(), "{");
    // Primary is re-established from the backup.
    assert!(std::fs::read_to_string(&state_file)
        .unwrap()
        .contains("survivor"));
}

#[cfg(unix)]
#[tokio::test]
async fn symlink_and_real_path_share_hash_and_state() {
    let tmp = TempDir::new().unwrap();
    let real = tmp.path().join("real-repo");
    let link = tmp.path().join("link");
    std::fs::create_dir(&real).unwrap();
    init_repo(&real);
    std::os::unix::fs::symlink(&real, &link).unwrap();

    assert_eq!(
        repo::repo_hash(&link).unwrap(),
        repo::repo_hash(&real).unwrap()
    );

    // State written through the link is observed through the real path.
    let mut through_link = State::load(&link);
    through_link
        .save_instances(serde_json::json!(["via-link"]))
        .unwrap();
    let through_real = State::load(&real);
    assert_eq!(through_real.get_instances()[0], "via-link");
}

#[cfg(unix)]
#[tokio::test]
async fn second_controller_process_is_locked_out() {
    let tmp = TempDir::new().unwrap();
    init_repo(tmp.path());

    // Controller A: the real binary, parked in its idle loop.
    let mut child = std::process::Command::new(env!("CARGO_BIN_EXE_cs"))
        .current_dir(tmp.path())
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .unwrap();

    // The PID lands in the lock file only after the lock is held.
    let lock_path = tmp.path().join(".claude-squad").join("cs.lock");
    let deadline = Instant::now() + Duration::from_secs(10);
    let holder_pid = loop {
        if let Ok(contents) = std::fs::read_to_string(&lock_path) {
            if let Ok(pid) = contents.trim().parse::<u32>() {
                break pid;
            }
        }
        if Instant::now() > deadline {
            let _ = child.kill();
            panic!("controller A never acquired the lock");
        }
        std::thread::sleep(Duration::from_millis(50));
    };
    assert_eq!(holder_pid, child.id());

    // Controller B: in-process acquire must fail with the holder's PID.
    let err = claude_squad::domains::lock::ProcessLock::acquire(tmp.path())
        .err()
        .expect("lock must be held by controller A");
    let msg = err.to_string();
    assert!(msg.contains("another cs instance is running in this repo"));
    assert!(msg.contains(&child.id().to_string()));

    // Killing A releases the kernel lock with no cleanup logic involved.
    child.kill().unwrap();
    child.wait().unwrap();
    claude_squad::domains::lock::ProcessLock::acquire(tmp.path()).unwrap();
}

#[tokio::test]
async fn create_start_kill_lifecycle() {
    if !tmux_available() {
        eprintln!("skipping: tmux not available");
        return;
    }
    let tmp = TempDir::new().unwrap();
    init_repo(tmp.path());

    let mut controller = Controller::new(tmp.path(), Some("sleep 100".into()), false)
        .await
        .unwrap();
    controller.create_instance("t1").await.unwrap();

    let instance = &controller.instances()[0];
    let session_name = instance.session_name.clone();
    let worktree_path = instance.worktree_path.clone();
    assert!(tmux::has_session(&session_name).await.unwrap());
    assert!(worktree_path.starts_with(tmp.path().join(".claude-squad").join("worktrees")));
    assert!(worktree_path.exists());
    assert!(matches!(instance.status, Status::Running | Status::Ready));

    let stored = State::load(tmp.path()).get_instances();
    assert_eq!(stored.as_array().unwrap().len(), 1);
    assert_eq!(stored[0]["title"], "t1");

    controller.kill_instance("t1").await.unwrap();
    assert!(!tmux::has_session(&session_name).await.unwrap());
    assert!(!worktree_path.exists());
    assert_eq!(
        State::load(tmp.path()).get_instances().as_array().unwrap().len(),
        0
    );
}

#[tokio::test]
async fn pause_resume_round_trip_preserves_work() {
    if !tmux_available() {
        eprintln!("skipping: tmux not available");
        return;
    }
    let tmp = TempDir::new().unwrap();
    init_repo(tmp.path());

    let mut controller = Controller::new(tmp.path(), Some("sleep 100".into()), false)
        .await
        .unwrap();
    controller.create_instance("t2").await.unwrap();

    let instance = &controller.instances()[0];
    let branch = instance.branch.clone();
    let base_commit = instance.base_commit.clone();
    let session_name = instance.session_name.clone();
    let old_worktree = instance.worktree_path.clone();

    std::fs::write(old_worktree.join("progress.txt"), "work in flight\n").unwrap();
    controller.pause_instance("t2").await.unwrap();

    // Work is committed on the branch; worktree and session are gone.
    let repo = Repository::open(tmp.path()).unwrap();
    let branch_ref = repo.find_branch(&branch, BranchType::Local).unwrap();
    let tree = branch_ref.get().peel_to_commit().unwrap().tree().unwrap();
    assert!(tree.get_name("progress.txt").is_some());
    assert!(!old_worktree.exists());
    assert!(!tmux::has_session(&session_name).await.unwrap());
    assert_eq!(controller.instances()[0].status, Status::Paused);

    controller.resume_instance("t2").await.unwrap();
    let resumed = &controller.instances()[0];
    assert_eq!(resumed.status, Status::Running);
    assert_eq!(resumed.branch, branch);
    assert_eq!(resumed.base_commit, base_commit);
    assert!(resumed.worktree_path.exists());
    assert_eq!(
        std::fs::read_to_string(resumed.worktree_path.join("progress.txt")).unwrap(),
        "work in flight\n"
    );
    assert!(tmux::has_session(&session_name).await.unwrap());

    controller.kill_instance("t2").await.unwrap();
}

#[tokio::test]
async fn orphaned_sessions_are_classified_and_killable() {
    if !tmux_available() {
        eprintln!("skipping: tmux not available");
        return;
    }
    let parent = TempDir::new().unwrap();
    let repo_dir = parent.path().join("doomed-repo");
    std::fs::create_dir(&repo_dir).unwrap();
    init_repo(&repo_dir);

    let session = tmux::TmuxSession::new("t3", "sleep 100", &repo_dir).unwrap();
    session.start(&repo_dir).await.unwrap();
    let name = session.name().to_string();

    // Delete the repository out from under the session.
    std::fs::remove_dir_all(&repo_dir).unwrap();

    let infos = claude_squad::cleanup::survey_sessions().await.unwrap();
    let ours = infos
        .iter()
        .find(|i| i.name == name)
        .expect("session should be surveyed");
    assert_eq!(ours.kind, claude_squad::cleanup::SessionKind::Orphaned);

    tmux::kill_session(&name).await.unwrap();
    assert!(!tmux::has_session(&name).await.unwrap());
}

#[tokio::test]
async fn reset_clears_sessions_worktrees_and_store() {
    if !tmux_available() {
        eprintln!("skipping: tmux not available");
        return;
    }
    let tmp = TempDir::new().unwrap();
    init_repo(tmp.path());

    {
        let mut controller = Controller::new(tmp.path(), Some("sleep 100".into()), false)
            .await
            .unwrap();
        controller.create_instance("t4").await.unwrap();
        controller.shutdown().unwrap();
    }

    claude_squad::app::reset(tmp.path()).await.unwrap();

    let hash = repo::repo_hash(tmp.path()).unwrap();
    let survivors: Vec<_> = tmux::list_sessions()
        .await
        .unwrap()
        .into_iter()
        .filter(|n| n.starts_with(&format!("claudesquad_{hash}")))
        .collect();
    assert!(survivors.is_empty());
    assert!(!tmp.path().join(".claude-squad").join("worktrees").exists());
    assert_eq!(
        State::load(tmp.path()).get_instances().as_array().unwrap().len(),
        0
    );
}
