use thiserror::Error;

use crate::config::ConfigError;
use crate::core::CoreError;
use crate::daemon::session::{FrameError, SessionError};
use crate::daemon::{GraphError, StoreError, WorkerError};

/// Whether retrying this operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry may help (transient contention/outage).
    Retryable,
    /// Unknown if retry will help.
    Unknown,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// What we know about side effects when an error is returned.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Effect {
    /// Definitely no side effects occurred.
    None,
    /// Side effects definitely occurred (locally or remotely).
    Some,
    /// We don't know if side effects occurred.
    Unknown,
}

impl Effect {
    pub fn as_str(self) -> &'static str {
        match self {
            Effect::None => "none",
            Effect::Some => "some",
            Effect::Unknown => "unknown",
        }
    }
}

/// Crate-level convenience error.
///
/// A thin wrapper over the per-capability errors; each variant keeps its own
/// code, transience and effect.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            Error::Core(e) => e.transience(),
            Error::Config(_) => Transience::Permanent,
            Error::Store(e) => e.transience(),
            Error::Graph(e) => e.transience(),
            Error::Worker(e) => e.transience(),
            Error::Session(e) => e.transience(),
            Error::Frame(_) => Transience::Unknown,
            Error::Io(_) => Transience::Unknown,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            Error::Core(e) => e.effect(),
            Error::Config(_) => Effect::None,
            Error::Store(e) => e.effect(),
            Error::Graph(e) => e.effect(),
            Error::Worker(e) => e.effect(),
            Error::Session(e) => e.effect(),
            Error::Frame(_) => Effect::Unknown,
            Error::Io(_) => Effect::Unknown,
        }
    }
}
