//! Config publishing against a real local bare remote

use std::path::{Path, PathBuf};

use git2::{Repository, RepositoryInitOptions};
use trellis_cli::git::{Git2Repo, GitRepo};
use trellis_cli::publish::{ConfigPublisher, PublishOutcome};
use trellis_cli::render::{RenderedConfig, RenderedFile};
use trellis_common::config::GitConfig;

struct Fixture {
    root: tempfile::TempDir,
    remote: PathBuf,
    work: PathBuf,
}

fn git_config(path: &Path) -> GitConfig {
    serde_yaml::from_str(&format!(
        "path: {}\nurl: https://git.example.com/platform-config.git\n",
        path.display()
    ))
    .unwrap()
}

/// Bare remote with one commit on main, and a working tree tracking it
fn fixture() -> Fixture {
    let root = tempfile::tempdir().unwrap();
    let remote = root.path().join("remote.git");
    let work = root.path().join("work");

    let mut bare = RepositoryInitOptions::new();
    bare.bare(true).initial_head("main");
    Repository::init_opts(&remote, &bare).unwrap();

    let mut opts = RepositoryInitOptions::new();
    opts.initial_head("main");
    let repo = Repository::init_opts(&work, &opts).unwrap();
    repo.remote("origin", remote.to_str().unwrap()).unwrap();

    std::fs::write(work.join("README.md"), "platform config\n").unwrap();
    let seed = Git2Repo::open(&git_config(&work), None).unwrap();
    seed.commit(&[PathBuf::from("README.md")], "initial").unwrap();
    seed.push().unwrap();

    Fixture {
        root,
        remote,
        work,
    }
}

fn rendered(dns_suffix: &str, ingress_ip: &str) -> RenderedConfig {
    RenderedConfig {
        files: vec![RenderedFile {
            path: PathBuf::from("clusters/dev/cluster-values.yaml"),
            content: format!("dnsSuffix: {}\ningressIP: {}\n", dns_suffix, ingress_ip),
        }],
    }
}

fn remote_commit_count(remote: &Path) -> usize {
    let repo = Repository::open_bare(remote).unwrap();
    let mut walk = repo.revwalk().unwrap();
    walk.push_ref("refs/heads/main").unwrap();
    walk.count()
}

fn remote_has_file(remote: &Path, path: &str) -> bool {
    let repo = Repository::open_bare(remote).unwrap();
    let tree = repo
        .find_reference("refs/heads/main")
        .unwrap()
        .peel_to_tree()
        .unwrap();
    tree.get_path(Path::new(path)).is_ok()
}

#[test]
fn publishing_same_config_twice_is_a_no_op() {
    let fx = fixture();
    let repo = Git2Repo::open(&git_config(&fx.work), None).unwrap();
    let publisher = ConfigPublisher::new(&repo);

    let first = publisher
        .publish(&rendered("test.local", "10.0.0.5"), "publish")
        .unwrap();
    assert!(matches!(first, PublishOutcome::Committed { .. }));
    assert_eq!(remote_commit_count(&fx.remote), 2);

    let second = publisher
        .publish(&rendered("test.local", "10.0.0.5"), "publish")
        .unwrap();
    assert_eq!(second, PublishOutcome::NoOpUnchanged);
    assert_eq!(remote_commit_count(&fx.remote), 2);
    assert!(remote_has_file(&fx.remote, "clusters/dev/cluster-values.yaml"));
}

#[test]
fn changed_address_produces_a_new_commit() {
    let fx = fixture();
    let repo = Git2Repo::open(&git_config(&fx.work), None).unwrap();
    let publisher = ConfigPublisher::new(&repo);

    publisher
        .publish(&rendered("test.local", "10.0.0.5"), "publish")
        .unwrap();
    let outcome = publisher
        .publish(&rendered("test.local", "10.0.0.9"), "publish")
        .unwrap();

    assert!(matches!(outcome, PublishOutcome::Committed { .. }));
    assert_eq!(remote_commit_count(&fx.remote), 3);
}

#[test]
fn rebases_onto_commits_pushed_by_someone_else() {
    let fx = fixture();

    let other_path = fx.root.path().join("other");
    Repository::clone(fx.remote.to_str().unwrap(), &other_path).unwrap();
    std::fs::write(other_path.join("NOTES.md"), "unrelated change\n").unwrap();
    let other = Git2Repo::open(&git_config(&other_path), None).unwrap();
    other
        .commit(&[PathBuf::from("NOTES.md")], "someone else")
        .unwrap();
    other.push().unwrap();

    let repo = Git2Repo::open(&git_config(&fx.work), None).unwrap();
    let outcome = ConfigPublisher::new(&repo)
        .publish(&rendered("test.local", "10.0.0.5"), "publish")
        .unwrap();

    assert!(matches!(outcome, PublishOutcome::Committed { .. }));
    assert_eq!(remote_commit_count(&fx.remote), 3);
    assert!(remote_has_file(&fx.remote, "NOTES.md"));
    assert!(remote_has_file(&fx.remote, "clusters/dev/cluster-values.yaml"));
}

#[test]
fn rerun_pushes_commit_left_behind_by_failed_push() {
    let fx = fixture();
    let config = rendered("test.local", "10.0.0.5");
    let repo = Git2Repo::open(&git_config(&fx.work), None).unwrap();

    // an earlier run committed, then lost its push
    config.write_to(&fx.work).unwrap();
    repo.commit(&config.paths(), "publish").unwrap();
    assert!(!remote_has_file(&fx.remote, "clusters/dev/cluster-values.yaml"));

    let publisher = ConfigPublisher::new(&repo);
    let outcome = publisher.publish(&config, "publish").unwrap();
    assert!(matches!(outcome, PublishOutcome::Committed { .. }));
    assert!(remote_has_file(&fx.remote, "clusters/dev/cluster-values.yaml"));
    assert_eq!(remote_commit_count(&fx.remote), 2);

    let again = publisher.publish(&config, "publish").unwrap();
    assert_eq!(again, PublishOutcome::NoOpUnchanged);
}
