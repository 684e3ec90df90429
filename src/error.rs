use std::sync::Arc;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::node::NodeId;

/// An error returned by a user-supplied transformer.
///
/// Wrapped in an `Arc` so the failure can be handed to every requester that
/// awaited the same node computation.
#[derive(Debug, Error, Clone)]
#[error("{0:#}")]
pub struct TransformerError(pub(crate) Arc<anyhow::Error>);

impl TransformerError {
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        Self(Arc::new(err.into()))
    }
}

impl From<anyhow::Error> for TransformerError {
    fn from(e: anyhow::Error) -> Self {
        TransformerError(Arc::new(e))
    }
}

#[derive(Debug, Error)]
pub enum BlueprintError {
    #[error("Passed reference is not a pipeline node: {0}")]
    InvalidPipelineReference(String),

    #[error("Root is not a pipeline: {0}")]
    NotAPipeline(String),

    #[error("Couldn't compile glob pattern.\n{0}")]
    Pattern(#[from] glob::PatternError),
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("[{pattern}] Query error. File {path} not found.")]
    NotFound { pattern: String, path: Utf8PathBuf },

    #[error("Couldn't walk the query base directory.\n{0}")]
    Walk(#[from] walkdir::Error),

    #[error("Couldn't convert path to UTF-8.\n{0}")]
    PathFormat(#[from] camino::FromPathBufError),

    #[error("Query task failed to complete.\n{0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Failure while computing node results. Cloned into every waiter of a shared
/// node computation.
#[derive(Debug, Error, Clone)]
pub enum EvalError {
    #[error("Evaluation cancelled")]
    Cancelled,

    #[error("Transformer in node {0} failed:\n{1}")]
    Transformer(NodeId, TransformerError),
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Couldn't encode cache table.\n{0}")]
    Encode(#[from] ciborium::ser::Error<std::io::Error>),

    #[error("Couldn't decode cache table.\n{0}")]
    Decode(#[from] ciborium::de::Error<std::io::Error>),
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("Error while resolving queries:\n{0}")]
    Query(#[from] QueryError),

    #[error("Error while computing results:\n{0}")]
    Eval(#[from] EvalError),

    #[error("Error while saving the cache:\n{0}")]
    Cache(#[from] CacheError),

    #[error("Fingerprinting task failed to complete.\n{0}")]
    Fingerprint(#[from] tokio::task::JoinError),
}

impl RunError {
    /// Cancellation is an expected outcome when a run is superseded.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RunError::Eval(EvalError::Cancelled))
    }
}

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("Couldn't write {path}:\n{source}")]
    Write {
        path: Utf8PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum AssetpipeError {
    #[error("Couldn't load the pipeline definition:\n{0}")]
    Source(anyhow::Error),

    #[error("Error while loading the cache:\n{0}")]
    Cache(#[from] CacheError),

    #[error("Error while running the pipeline:\n{0}")]
    Run(#[from] RunError),

    #[error("Error while writing the output:\n{0}")]
    Output(#[from] OutputError),

    #[error("Build was cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(feature = "live")]
#[derive(Debug, Error)]
pub enum WatchError {
    #[error(transparent)]
    Setup(#[from] AssetpipeError),

    #[error(transparent)]
    Notify(#[from] notify::Error),

    #[error("Pipeline run task failed to complete.\n{0}")]
    Join(#[from] tokio::task::JoinError),
}
