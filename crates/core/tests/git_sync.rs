//! Integration tests for the Git synchronization controller.
//!
//! Every test builds a local bare repository as `origin` and drives a
//! `GitSyncController` against it. No network I/O: remotes are plain paths.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use git2::{Repository, RepositoryInitOptions};
use serde_json::json;
use tempfile::TempDir;

use helmform_core::config::{AppConfig, AuthMethod};
use helmform_core::errors::DocumentError;
use helmform_core::git::client::Transport;
use helmform_core::git::{Credentials, GitClient, GitSyncController, RepoState, SyncOutcome};
use helmform_core::policy::RuleSet;
use helmform_core::value::ValueNode;

// ===========================================================================
// Helper functions
// ===========================================================================

const SEED: &str = "image:\n  repository: nginx\n  tag: \"1.0\"\nreplicas: 2\n";

fn transport() -> Transport {
    Transport::new(Credentials::None, Duration::from_secs(30))
}

/// Create a bare `origin` with one commit on `main` holding `values.yaml`.
fn setup_origin(root: &Path) -> PathBuf {
    let bare = root.join("origin.git");
    let mut opts = RepositoryInitOptions::new();
    opts.bare(true).initial_head("main");
    Repository::init_opts(&bare, &opts).expect("failed to init bare repo");

    let seed = root.join("seed");
    let mut opts = RepositoryInitOptions::new();
    opts.initial_head("main");
    let repo = Repository::init_opts(&seed, &opts).expect("failed to init seed repo");
    repo.remote("origin", bare.to_str().unwrap())
        .expect("failed to add origin remote");

    std::fs::write(seed.join("values.yaml"), SEED).unwrap();
    std::fs::write(seed.join("README.md"), "chart values\n").unwrap();
    let client = GitClient::open(&seed).unwrap();
    client
        .commit_file(Path::new("values.yaml"), "initial values", "Seed", "seed@example.com")
        .unwrap()
        .expect("initial commit");
    client.push("main", &transport()).expect("failed to push seed");
    bare
}

fn config_for(root: &Path, origin: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.git.enabled = true;
    config.git.repo_url = origin.to_str().unwrap().to_string();
    config.git.local_path = root.join("work");
    config.git.auth.method = AuthMethod::None;
    config.git.timeout_secs = 30;
    config
}

/// Push a change to origin from an independent clone, as another user would.
fn push_from_elsewhere(root: &Path, origin: &Path, name: &str, content: &str) {
    let path = root.join(name);
    let client = GitClient::clone_repo(origin.to_str().unwrap(), "main", &path, &transport())
        .expect("failed to clone");
    std::fs::write(path.join("values.yaml"), content).unwrap();
    client
        .commit_file(Path::new("values.yaml"), "external edit", "Other", "other@example.com")
        .unwrap();
    client.push("main", &transport()).expect("failed to push external edit");
}

/// Contents of `values.yaml` at the tip of origin's `main`.
fn origin_values(origin: &Path) -> String {
    let repo = Repository::open_bare(origin).unwrap();
    let commit = repo
        .find_reference("refs/heads/main")
        .unwrap()
        .peel_to_commit()
        .unwrap();
    let entry = commit.tree().unwrap().get_path(Path::new("values.yaml")).unwrap();
    let blob = repo.find_blob(entry.id()).unwrap();
    String::from_utf8(blob.content().to_vec()).unwrap()
}

fn origin_head_message(origin: &Path) -> String {
    let repo = Repository::open_bare(origin).unwrap();
    let commit = repo
        .find_reference("refs/heads/main")
        .unwrap()
        .peel_to_commit()
        .unwrap();
    commit.message().unwrap_or("").to_string()
}

fn tree(value: serde_json::Value) -> ValueNode {
    ValueNode::from(value)
}

fn rules(src: &str) -> RuleSet {
    RuleSet::from_yaml_str(src, "test").unwrap()
}

async fn started(config: &AppConfig) -> GitSyncController {
    let controller = GitSyncController::new(config);
    controller.initialize().await.expect("initialize failed");
    controller
}

// ===========================================================================
// Startup
// ===========================================================================

#[tokio::test]
async fn test_clone_on_start_and_read() {
    let tmp = TempDir::new().unwrap();
    let origin = setup_origin(tmp.path());
    let config = config_for(tmp.path(), &origin);

    let controller = started(&config).await;
    assert_eq!(controller.state(), RepoState::Clean);

    let status = controller.status();
    assert!(status.enabled);
    assert_eq!(status.branch, "main");
    assert_eq!(status.auth_method, "none");
    assert!(status.last_commit.is_some());

    let values = controller.read_document().await.unwrap().expect("document");
    assert_eq!(
        values,
        tree(json!({"image": {"repository": "nginx", "tag": "1.0"}, "replicas": 2}))
    );
}

#[tokio::test]
async fn test_existing_checkout_is_reused() {
    let tmp = TempDir::new().unwrap();
    let origin = setup_origin(tmp.path());
    let config = config_for(tmp.path(), &origin);

    started(&config).await;
    push_from_elsewhere(tmp.path(), &origin, "other", "replicas: 7\n");

    // A second process start opens the checkout and pulls on start.
    let controller = started(&config).await;
    assert_eq!(controller.state(), RepoState::Clean);
    let on_disk = std::fs::read_to_string(config.values_file()).unwrap();
    assert_eq!(on_disk, "replicas: 7\n");
}

#[tokio::test]
async fn test_clone_failure_sets_error_and_reports_no_data() {
    let tmp = TempDir::new().unwrap();
    let config = config_for(tmp.path(), &tmp.path().join("does-not-exist.git"));

    let controller = GitSyncController::new(&config);
    assert!(controller.initialize().await.is_err());
    assert_eq!(controller.state(), RepoState::Error);
    assert!(controller.status().last_error.is_some());
    assert!(!config.git.local_path.exists(), "partial clone left behind");

    assert!(controller.read_document().await.unwrap().is_none());
}

#[tokio::test]
async fn test_write_without_working_copy_is_refused() {
    let tmp = TempDir::new().unwrap();
    let origin = tmp.path().join("origin.git");
    let config = config_for(tmp.path(), &origin);

    let controller = GitSyncController::new(&config);
    assert!(controller.initialize().await.is_err());
    let err = controller
        .write_document(&tree(json!({"replicas": 1})), &RuleSet::default())
        .await
        .unwrap_err();
    assert!(matches!(err, DocumentError::Unavailable(_)));
    assert!(!config.git.local_path.exists(), "write created the working copy directory");

    // Once the remote is reachable, the next start clones normally.
    let origin = setup_origin(tmp.path());
    let config = config_for(tmp.path(), &origin);
    let controller = started(&config).await;
    assert_eq!(controller.state(), RepoState::Clean);
    let values = controller.read_document().await.unwrap().expect("cloned values");
    assert_eq!(values.get("replicas"), Some(&tree(json!(2))));
}

#[tokio::test]
async fn test_existing_non_repository_directory_is_error() {
    let tmp = TempDir::new().unwrap();
    let origin = setup_origin(tmp.path());
    let config = config_for(tmp.path(), &origin);
    std::fs::create_dir_all(&config.git.local_path).unwrap();
    std::fs::write(config.values_file(), "replicas: 1\n").unwrap();

    let controller = GitSyncController::new(&config);
    assert!(controller.initialize().await.is_err());
    assert_eq!(controller.state(), RepoState::Error);

    // Nothing is deleted and the local file is still served.
    assert!(config.values_file().exists());
    let values = controller.read_document().await.unwrap().expect("local copy");
    assert_eq!(values, tree(json!({"replicas": 1})));
}

// ===========================================================================
// Reads
// ===========================================================================

#[tokio::test]
async fn test_read_pulls_remote_changes() {
    let tmp = TempDir::new().unwrap();
    let origin = setup_origin(tmp.path());
    let controller = started(&config_for(tmp.path(), &origin)).await;

    push_from_elsewhere(tmp.path(), &origin, "other", "replicas: 5\nextra: true\n");

    let values = controller.read_document().await.unwrap().expect("document");
    assert_eq!(values, tree(json!({"replicas": 5, "extra": true})));
    assert_eq!(controller.state(), RepoState::Clean);
}

#[tokio::test]
async fn test_pull_failure_serves_last_known_copy() {
    let tmp = TempDir::new().unwrap();
    let origin = setup_origin(tmp.path());
    let controller = started(&config_for(tmp.path(), &origin)).await;

    std::fs::remove_dir_all(&origin).unwrap();

    let values = controller.read_document().await.unwrap().expect("stale copy");
    assert_eq!(values.get("replicas"), Some(&tree(json!(2))));
    assert_eq!(controller.state(), RepoState::Error);
}

// ===========================================================================
// Writes
// ===========================================================================

#[tokio::test]
async fn test_write_commits_and_pushes() {
    let tmp = TempDir::new().unwrap();
    let origin = setup_origin(tmp.path());
    let controller = started(&config_for(tmp.path(), &origin)).await;

    let submitted = tree(json!({"image": {"repository": "evil", "tag": "2.0"}, "replicas": 3}));
    let outcome = controller
        .write_document(&submitted, &rules("readonly_fields: [image.repository]\n"))
        .await
        .unwrap();

    assert_eq!(outcome.merge.rejections.len(), 1);
    assert_eq!(outcome.merge.rejections[0].path.to_string(), "image.repository");
    let SyncOutcome::Synced { commit } = &outcome.sync else {
        panic!("expected synced, got {:?}", outcome.sync);
    };
    assert_eq!(controller.status().last_commit.as_deref(), Some(commit.as_str()));
    assert_eq!(controller.state(), RepoState::Clean);

    let pushed = origin_values(&origin);
    assert!(pushed.contains("repository: nginx"));
    assert!(pushed.contains("tag: '2.0'") || pushed.contains("tag: \"2.0\""));
    assert!(pushed.contains("replicas: 3"));
    assert!(origin_head_message(&origin).starts_with("Update values via Helm UI"));
}

#[tokio::test]
async fn test_unchanged_submission_is_a_no_op() {
    let tmp = TempDir::new().unwrap();
    let origin = setup_origin(tmp.path());
    let controller = started(&config_for(tmp.path(), &origin)).await;
    let head_before = controller.status().last_commit;

    let current = controller.read_document().await.unwrap().unwrap();
    let outcome = controller
        .write_document(&current, &RuleSet::default())
        .await
        .unwrap();
    assert_eq!(outcome.sync, SyncOutcome::NoChanges);
    assert!(outcome.merge.rejections.is_empty());
    assert_eq!(controller.status().last_commit, head_before);
}

#[tokio::test]
async fn test_auto_push_disabled_leaves_dirty() {
    let tmp = TempDir::new().unwrap();
    let origin = setup_origin(tmp.path());
    let mut config = config_for(tmp.path(), &origin);
    config.git.auto_push_on_update = false;
    let controller = started(&config).await;

    let outcome = controller
        .write_document(&tree(json!({"replicas": 9})), &RuleSet::default())
        .await
        .unwrap();
    assert_eq!(outcome.sync, SyncOutcome::LocalOnly);
    assert_eq!(controller.state(), RepoState::Dirty);

    // Reads skip the pull while dirty and serve the local edit.
    let values = controller.read_document().await.unwrap().unwrap();
    assert_eq!(values.get("replicas"), Some(&tree(json!(9))));
    assert_eq!(controller.state(), RepoState::Dirty);
    assert!(origin_values(&origin).contains("replicas: 2"));
}

#[tokio::test]
async fn test_push_failure_keeps_local_data() {
    let tmp = TempDir::new().unwrap();
    let origin = setup_origin(tmp.path());
    let config = config_for(tmp.path(), &origin);
    let controller = started(&config).await;

    std::fs::remove_dir_all(&origin).unwrap();

    let outcome = controller
        .write_document(&tree(json!({"replicas": 4})), &RuleSet::default())
        .await
        .unwrap();
    assert!(outcome.sync.is_failed(), "expected failure, got {:?}", outcome.sync);
    assert_eq!(controller.state(), RepoState::Error);

    // Saved and committed locally.
    let on_disk = std::fs::read_to_string(config.values_file()).unwrap();
    assert!(on_disk.contains("replicas: 4"));
    let work = GitClient::open(&config.git.local_path).unwrap();
    let head = work.repo().head().unwrap().peel_to_commit().unwrap();
    assert!(head.message().unwrap_or("").starts_with("Update values via Helm UI"));
}

#[tokio::test]
async fn test_push_rejected_when_remote_moved() {
    let tmp = TempDir::new().unwrap();
    let origin = setup_origin(tmp.path());
    let mut config = config_for(tmp.path(), &origin);
    config.git.auto_pull_on_read = false;
    let controller = started(&config).await;

    push_from_elsewhere(tmp.path(), &origin, "other", "replicas: 8\n");

    let outcome = controller
        .write_document(&tree(json!({"replicas": 3})), &RuleSet::default())
        .await
        .unwrap();
    match &outcome.sync {
        SyncOutcome::Failed { kind, message } => {
            assert_eq!(kind, "conflict", "unexpected failure: {message}");
        }
        other => panic!("expected conflict, got {other:?}"),
    }
    assert_eq!(controller.state(), RepoState::Error);
    assert!(origin_values(&origin).contains("replicas: 8"));
}

// ===========================================================================
// Concurrency
// ===========================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writes_and_pulls_never_tear() {
    let tmp = TempDir::new().unwrap();
    let origin = setup_origin(tmp.path());
    let config = config_for(tmp.path(), &origin);
    let controller = Arc::new(started(&config).await);
    let rules = Arc::new(RuleSet::default());

    let mut handles = Vec::new();
    for i in 0..8 {
        let controller = Arc::clone(&controller);
        let rules = Arc::clone(&rules);
        handles.push(tokio::spawn(async move {
            if i % 2 == 0 {
                let submitted = ValueNode::Map(vec![(format!("key_{i}"), tree(json!(i)))]);
                let outcome = controller.write_document(&submitted, &rules).await.unwrap();
                assert!(
                    matches!(outcome.sync, SyncOutcome::Synced { .. }),
                    "write {i} did not sync: {:?}",
                    outcome.sync
                );
            } else {
                let values = controller.read_document().await.unwrap().expect("document");
                assert!(values.get("replicas").is_some(), "torn read: {values:?}");
            }
        }));
    }
    for handle in handles {
        handle.await.expect("task panicked");
    }

    // Every write landed completely; nothing was lost or interleaved.
    let values = controller.read_document().await.unwrap().unwrap();
    for i in (0..8).step_by(2) {
        assert_eq!(values.get(&format!("key_{i}")), Some(&tree(json!(i))));
    }
    assert_eq!(controller.state(), RepoState::Clean);
    let pushed = helmform_core::document::parse_yaml(&origin_values(&origin)).unwrap();
    assert_eq!(pushed, values);
}
