//! A remote that accepts connections and then never answers must not wedge
//! the controller.
//!
//! This lives in its own test binary because libgit2's network timeouts are
//! process-wide and must be set before any thread touches `git2`.

use std::net::TcpListener;
use std::path::Path;
use std::time::{Duration, Instant};

use git2::{Repository, RepositoryInitOptions};
use tempfile::TempDir;

use helmform_core::config::{AppConfig, AuthMethod};
use helmform_core::git::{set_network_timeouts, GitClient, GitSyncController, RepoState};

/// Accept connections and hold them open without ever replying.
fn silent_remote() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    std::thread::spawn(move || {
        let mut held = Vec::new();
        for stream in listener.incoming().flatten() {
            held.push(stream);
        }
    });
    format!("http://{addr}/values.git")
}

/// A working copy on `main` with one commit, whose `origin` is `url`.
fn working_copy(path: &Path, url: &str) {
    let mut opts = RepositoryInitOptions::new();
    opts.initial_head("main");
    let repo = Repository::init_opts(path, &opts).expect("failed to init working copy");
    repo.remote("origin", url).expect("failed to add origin remote");
    std::fs::write(path.join("values.yaml"), "replicas: 2\n").unwrap();
    GitClient::open(path)
        .unwrap()
        .commit_file(Path::new("values.yaml"), "initial values", "Seed", "seed@example.com")
        .unwrap()
        .expect("initial commit");
}

#[test]
fn test_silent_remote_does_not_block_reads() {
    // SAFETY: the only test in this binary, and no git2 work has started.
    unsafe { set_network_timeouts(Duration::from_secs(1)) }.unwrap();

    let tmp = TempDir::new().unwrap();
    let work = tmp.path().join("work");
    let url = silent_remote();
    working_copy(&work, &url);

    let mut config = AppConfig::default();
    config.git.enabled = true;
    config.git.repo_url = url;
    config.git.local_path = work;
    config.git.auth.method = AuthMethod::None;
    config.git.auto_pull_on_start = false;
    config.git.timeout_secs = 1;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();
    runtime.block_on(async {
        let controller = GitSyncController::new(&config);
        controller.initialize().await.expect("initialize failed");
        assert_eq!(controller.state(), RepoState::Clean);

        // The second read may queue behind the first, abandoned pull; libgit2
        // gives up on the silent socket, so it still finishes promptly.
        for _ in 0..2 {
            let started = Instant::now();
            let values = tokio::time::timeout(Duration::from_secs(5), controller.read_document())
                .await
                .expect("read blocked behind a stalled pull")
                .unwrap()
                .expect("last known local copy");
            assert!(values.get("replicas").is_some());
            assert!(started.elapsed() < Duration::from_secs(5));
            assert_eq!(controller.state(), RepoState::Error);
        }
    });

    // Dropping the runtime joins the blocking pool, which only returns once
    // the stalled fetch has timed out inside libgit2.
    let started = Instant::now();
    drop(runtime);
    assert!(started.elapsed() < Duration::from_secs(10));
}
