//! Commit rendered config to the repository the controller reconciles from

use tracing::{info, warn};

use crate::git::GitRepo;
use crate::render::RenderedConfig;
use crate::{Error, Result};

/// What [`ConfigPublisher::publish`] did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// A commit was pushed
    Committed {
        /// Local commit id before any rebase
        commit: String,
    },
    /// Rendered output matched the repository; nothing committed
    NoOpUnchanged,
}

/// Writes rendered config into the working tree, commits and pushes
pub struct ConfigPublisher<'a> {
    repo: &'a dyn GitRepo,
}

impl<'a> ConfigPublisher<'a> {
    /// Create a publisher over a working tree
    pub fn new(repo: &'a dyn GitRepo) -> Self {
        Self { repo }
    }

    /// Publish `rendered`. A push rejected because the remote moved is
    /// retried once after a pull-rebase; a second rejection is fatal.
    ///
    /// A clean tree still pushes when the branch holds commits an earlier run
    /// failed to push.
    pub fn publish(&self, rendered: &RenderedConfig, message: &str) -> Result<PublishOutcome> {
        let written = rendered.write_to(&self.repo.workdir())?;
        let paths = rendered.paths();
        if self.repo.is_clean(&paths)? {
            let Some(commit) = self.repo.unpushed_head()? else {
                info!(files = paths.len(), "Rendered config unchanged, nothing to commit");
                return Ok(PublishOutcome::NoOpUnchanged);
            };
            warn!(commit = %commit, "Rendered config already committed but never pushed");
            self.push()?;
            return Ok(PublishOutcome::Committed { commit });
        }

        let commit = self.repo.commit(&paths, message)?;
        info!(commit = %commit, files_written = written, "Committed rendered config");
        self.push()?;
        Ok(PublishOutcome::Committed { commit })
    }

    fn push(&self) -> Result<()> {
        self.repo.pull_rebase()?;
        match self.repo.push() {
            Ok(()) => Ok(()),
            Err(e) if e.is_git_conflict() => {
                warn!(error = %e, "Push rejected, rebasing onto remote and retrying once");
                self.repo.pull_rebase()?;
                self.repo.push().map_err(|e| {
                    if e.is_git_conflict() {
                        Error::Common(trellis_common::Error::fatal("git push", e.to_string()))
                    } else {
                        e
                    }
                })
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::MockGitRepo;
    use crate::render::RenderedFile;
    use mockall::Sequence;
    use std::path::PathBuf;

    fn rendered() -> RenderedConfig {
        RenderedConfig {
            files: vec![RenderedFile {
                path: PathBuf::from("clusters/dev/cluster-values.yaml"),
                content: "data:\n  ingressIP: 10.0.0.5\n".to_string(),
            }],
        }
    }

    fn repo_at(dir: &tempfile::TempDir) -> MockGitRepo {
        let mut repo = MockGitRepo::new();
        let root = dir.path().to_path_buf();
        repo.expect_workdir().returning(move || root.clone());
        repo
    }

    #[test]
    fn unchanged_config_commits_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut repo = repo_at(&dir);
        repo.expect_is_clean().returning(|_| Ok(true));
        repo.expect_unpushed_head().times(1).returning(|| Ok(None));
        repo.expect_commit().times(0);
        repo.expect_push().times(0);

        let outcome = ConfigPublisher::new(&repo)
            .publish(&rendered(), "update")
            .unwrap();
        assert_eq!(outcome, PublishOutcome::NoOpUnchanged);
        assert!(dir.path().join("clusters/dev/cluster-values.yaml").exists());
    }

    #[test]
    fn clean_tree_pushes_commit_left_by_failed_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut repo = repo_at(&dir);
        let mut seq = Sequence::new();
        repo.expect_is_clean().returning(|_| Ok(true));
        repo.expect_unpushed_head()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(Some("def456".to_string())));
        repo.expect_commit().times(0);
        repo.expect_pull_rebase()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));
        repo.expect_push()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));

        let outcome = ConfigPublisher::new(&repo)
            .publish(&rendered(), "update")
            .unwrap();
        assert_eq!(
            outcome,
            PublishOutcome::Committed {
                commit: "def456".to_string()
            }
        );
    }

    #[test]
    fn changed_config_commits_rebases_and_pushes() {
        let dir = tempfile::tempdir().unwrap();
        let mut repo = repo_at(&dir);
        let mut seq = Sequence::new();
        repo.expect_is_clean()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(false));
        repo.expect_commit()
            .withf(|paths, message| paths.len() == 1 && message == "update")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok("abc123".to_string()));
        repo.expect_pull_rebase()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));
        repo.expect_push()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));

        let outcome = ConfigPublisher::new(&repo)
            .publish(&rendered(), "update")
            .unwrap();
        assert_eq!(
            outcome,
            PublishOutcome::Committed {
                commit: "abc123".to_string()
            }
        );
    }

    #[test]
    fn rejected_push_retries_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut repo = repo_at(&dir);
        repo.expect_is_clean().returning(|_| Ok(false));
        repo.expect_commit()
            .returning(|_, _| Ok("abc123".to_string()));
        repo.expect_pull_rebase().times(2).returning(|| Ok(()));
        let mut pushes = 0;
        repo.expect_push().times(2).returning(move || {
            pushes += 1;
            if pushes == 1 {
                Err(trellis_common::Error::git_conflict("fetch first").into())
            } else {
                Ok(())
            }
        });

        let outcome = ConfigPublisher::new(&repo).publish(&rendered(), "update");
        assert!(matches!(outcome, Ok(PublishOutcome::Committed { .. })));
    }

    #[test]
    fn second_rejection_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut repo = repo_at(&dir);
        repo.expect_is_clean().returning(|_| Ok(false));
        repo.expect_commit()
            .returning(|_, _| Ok("abc123".to_string()));
        repo.expect_pull_rebase().times(2).returning(|| Ok(()));
        repo.expect_push()
            .times(2)
            .returning(|| Err(trellis_common::Error::git_conflict("fetch first").into()));

        let err = ConfigPublisher::new(&repo)
            .publish(&rendered(), "update")
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Common(trellis_common::Error::Fatal { .. })
        ));
    }
}
