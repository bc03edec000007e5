//! Error types for the CLI

use std::path::PathBuf;

/// CLI Result type
pub type Result<T> = std::result::Result<T, Error>;

/// CLI errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Common(#[from] trellis_common::Error),

    #[error(transparent)]
    Secrets(#[from] trellis_secrets::Error),

    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    #[error("template error: {0}")]
    Template(#[from] minijinja::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("not a git working tree: {path}")]
    NotARepository { path: PathBuf },

    #[error("stage {stage} failed: {source}")]
    Stage {
        stage: &'static str,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn stage(stage: &'static str, source: impl Into<Error>) -> Self {
        Error::Stage {
            stage,
            source: Box::new(source.into()),
        }
    }

    /// Whether the remote rejected a push because it moved
    pub fn is_git_conflict(&self) -> bool {
        matches!(self, Error::Common(trellis_common::Error::GitConflict { .. }))
    }
}
