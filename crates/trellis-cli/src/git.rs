//! Git operations on the config repository working tree

use std::cell::RefCell;
use std::path::{Path, PathBuf};

use git2::build::CheckoutBuilder;
use git2::{
    Cred, Direction, ErrorCode, FetchOptions, IndexAddOption, PushOptions, RemoteCallbacks, Repository,
    Signature, StatusOptions,
};
#[cfg(any(test, feature = "mock"))]
use mockall::automock;
use tracing::{debug, info, warn};
use trellis_common::config::GitConfig;
use trellis_gitops::GitCredentials;

use crate::{Error, Result};

/// Read-modify-commit-push access to the config repository
#[cfg_attr(any(test, feature = "mock"), automock)]
pub trait GitRepo {
    /// Working tree root
    fn workdir(&self) -> PathBuf;

    /// Whether `paths` (relative to the working tree) match HEAD exactly
    fn is_clean(&self, paths: &[PathBuf]) -> Result<bool>;

    /// Stage `paths` and commit them, returning the commit id
    fn commit(&self, paths: &[PathBuf], message: &str) -> Result<String>;

    /// Fetch the tracked branch and return the local head commit if it has
    /// commits the remote branch does not
    fn unpushed_head(&self) -> Result<Option<String>>;

    /// Fetch the tracked branch and rebase local commits onto it
    fn pull_rebase(&self) -> Result<()>;

    /// Push the tracked branch. A rejected push is [`trellis_common::Error::GitConflict`].
    fn push(&self) -> Result<()>;
}

/// [`GitRepo`] over libgit2
pub struct Git2Repo {
    repo: Repository,
    remote: String,
    branch: String,
    author_name: String,
    author_email: String,
    credentials: Option<GitCredentials>,
}

impl Git2Repo {
    /// Open the configured working tree
    pub fn open(config: &GitConfig, credentials: Option<GitCredentials>) -> Result<Self> {
        let repo = Repository::open(&config.path).map_err(|_| Error::NotARepository {
            path: config.path.clone(),
        })?;
        if repo.is_bare() {
            return Err(Error::NotARepository {
                path: config.path.clone(),
            });
        }
        Ok(Self {
            repo,
            remote: config.remote.clone(),
            branch: config.branch.clone(),
            author_name: config.author_name.clone(),
            author_email: config.author_email.clone(),
            credentials,
        })
    }

    fn signature(&self) -> Result<Signature<'static>> {
        Ok(Signature::now(&self.author_name, &self.author_email)?)
    }

    fn branch_ref(&self) -> String {
        format!("refs/heads/{}", self.branch)
    }

    fn callbacks(&self) -> RemoteCallbacks<'_> {
        let credentials = self.credentials.as_ref();
        let mut callbacks = RemoteCallbacks::new();
        callbacks.credentials(move |_url, username_from_url, allowed_types| {
            let user = username_from_url.unwrap_or("git");
            match credentials {
                Some(GitCredentials::SshKey { path, .. })
                    if allowed_types.contains(git2::CredentialType::SSH_KEY) =>
                {
                    Cred::ssh_key(user, None, path, None)
                }
                Some(GitCredentials::Token { username, token })
                    if allowed_types.contains(git2::CredentialType::USER_PASS_PLAINTEXT) =>
                {
                    Cred::userpass_plaintext(username, token)
                }
                None if allowed_types.contains(git2::CredentialType::SSH_KEY) => {
                    Cred::ssh_key_from_agent(user)
                }
                _ => Cred::default(),
            }
        });
        callbacks
    }

    /// Fetch the tracked branch into its remote-tracking ref. `None` when the
    /// branch does not exist on the remote yet.
    fn fetch_upstream(&self) -> Result<Option<git2::Oid>> {
        let tracking = format!("refs/remotes/{}/{}", self.remote, self.branch);
        let branch_ref = self.branch_ref();
        let refspec = format!("+{}:{}", branch_ref, tracking);

        let mut remote = self.repo.find_remote(&self.remote)?;
        let on_remote = {
            let connection = remote.connect_auth(Direction::Fetch, Some(self.callbacks()), None)?;
            connection.list()?.iter().any(|head| head.name() == branch_ref)
        };
        if !on_remote {
            debug!(branch = %self.branch, "Remote branch does not exist yet");
            return Ok(None);
        }

        let mut fetch_options = FetchOptions::new();
        fetch_options.remote_callbacks(self.callbacks());
        remote.fetch(&[refspec.as_str()], Some(&mut fetch_options), None)?;

        match self.repo.refname_to_id(&tracking) {
            Ok(oid) => Ok(Some(oid)),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn local_head(&self) -> Result<Option<git2::Oid>> {
        match self.repo.refname_to_id(&self.branch_ref()) {
            Ok(oid) => Ok(Some(oid)),
            Err(e) if e.code() == ErrorCode::NotFound || e.code() == ErrorCode::UnbornBranch => {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl GitRepo for Git2Repo {
    fn workdir(&self) -> PathBuf {
        self.repo
            .workdir()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.repo.path().to_path_buf())
    }

    fn is_clean(&self, paths: &[PathBuf]) -> Result<bool> {
        let mut options = StatusOptions::new();
        options
            .include_untracked(true)
            .recurse_untracked_dirs(true)
            .include_ignored(false);
        for path in paths {
            options.pathspec(path.as_path());
        }
        let statuses = self.repo.statuses(Some(&mut options))?;
        debug!(changed = statuses.len(), "Working tree status");
        Ok(statuses.is_empty())
    }

    fn commit(&self, paths: &[PathBuf], message: &str) -> Result<String> {
        let mut index = self.repo.index()?;
        index.add_all(paths.iter().map(PathBuf::as_path), IndexAddOption::DEFAULT, None)?;
        index.update_all(paths.iter().map(PathBuf::as_path), None)?;
        index.write()?;

        let tree = self.repo.find_tree(index.write_tree()?)?;
        let signature = self.signature()?;
        let parent = match self.repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(e) if e.code() == ErrorCode::UnbornBranch || e.code() == ErrorCode::NotFound => {
                None
            }
            Err(e) => return Err(e.into()),
        };
        let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();

        let oid = self.repo.commit(
            Some("HEAD"),
            &signature,
            &signature,
            message,
            &tree,
            &parents,
        )?;
        info!(commit = %oid, "Committed rendered config");
        Ok(oid.to_string())
    }

    fn unpushed_head(&self) -> Result<Option<String>> {
        let Some(local) = self.local_head()? else {
            return Ok(None);
        };
        let ahead = match self.fetch_upstream()? {
            Some(upstream) => self.repo.graph_ahead_behind(local, upstream)?.0,
            // nothing of the branch has reached the remote yet
            None => 1,
        };
        if ahead == 0 {
            return Ok(None);
        }
        debug!(branch = %self.branch, ahead, "Local branch ahead of remote");
        Ok(Some(local.to_string()))
    }

    fn pull_rebase(&self) -> Result<()> {
        let Some(upstream_id) = self.fetch_upstream()? else {
            return Ok(());
        };
        let upstream = self.repo.find_annotated_commit(upstream_id)?;
        let branch_ref = self.branch_ref();

        let (analysis, _) = self.repo.merge_analysis(&[&upstream])?;
        if analysis.is_up_to_date() {
            return Ok(());
        }
        if analysis.is_unborn() || analysis.is_fast_forward() {
            match self.repo.find_reference(&branch_ref) {
                Ok(mut reference) => {
                    reference.set_target(upstream.id(), "trellis: fast-forward")?;
                }
                Err(_) => {
                    self.repo
                        .reference(&branch_ref, upstream.id(), true, "trellis: fast-forward")?;
                }
            }
            self.repo.set_head(&branch_ref)?;
            self.repo
                .checkout_head(Some(CheckoutBuilder::default().force()))?;
            debug!(branch = %self.branch, "Fast-forwarded to remote");
            return Ok(());
        }

        let head = self.repo.head()?;
        let local = self.repo.reference_to_annotated_commit(&head)?;
        let signature = self.signature()?;
        let mut rebase = self.repo.rebase(Some(&local), Some(&upstream), None, None)?;
        while let Some(operation) = rebase.next() {
            operation?;
            if self.repo.index()?.has_conflicts() {
                rebase.abort()?;
                return Err(trellis_common::Error::git_conflict(format!(
                    "rebase onto {}/{} conflicts with local changes",
                    self.remote, self.branch
                ))
                .into());
            }
            match rebase.commit(None, &signature, None) {
                Ok(_) => {}
                Err(e) if e.code() == ErrorCode::Applied => {}
                Err(e) => return Err(e.into()),
            }
        }
        rebase.finish(Some(&signature))?;
        info!(branch = %self.branch, "Rebased onto remote");
        Ok(())
    }

    fn push(&self) -> Result<()> {
        let rejection: RefCell<Option<String>> = RefCell::new(None);
        let mut callbacks = self.callbacks();
        callbacks.push_update_reference(|refname, status| {
            if let Some(message) = status {
                *rejection.borrow_mut() = Some(format!("{}: {}", refname, message));
            }
            Ok(())
        });

        let mut push_options = PushOptions::new();
        push_options.remote_callbacks(callbacks);
        let refspec = format!("{}:{}", self.branch_ref(), self.branch_ref());
        let mut remote = self.repo.find_remote(&self.remote)?;

        match remote.push(&[refspec.as_str()], Some(&mut push_options)) {
            Ok(()) => {}
            Err(e) if e.code() == ErrorCode::NotFastForward => {
                return Err(trellis_common::Error::git_conflict(e.message().to_string()).into());
            }
            Err(e) => return Err(e.into()),
        }
        drop(push_options);

        if let Some(message) = rejection.into_inner() {
            warn!(remote = %self.remote, "Push rejected: {}", message);
            return Err(trellis_common::Error::git_conflict(message).into());
        }
        info!(remote = %self.remote, branch = %self.branch, "Pushed");
        Ok(())
    }
}
