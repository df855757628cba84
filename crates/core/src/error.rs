use thiserror::Error;

use crate::ResourceId;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the reconciler and its collaborators.
///
/// `NotFound` is an ordinary state for most callers (uninstalled, not yet
/// observed, already deleted) and is matched on with [`Error::is_not_found`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The addressed object does not exist
    #[error("{0} not found")]
    NotFound(ResourceId),

    /// Write rejected because the caller's copy is stale
    #[error("conflict writing {id}: {message}")]
    Conflict { id: ResourceId, message: String },

    /// Transport or server-side failure
    #[error("api error on {id}: {message}")]
    Api { id: ResourceId, message: String },

    /// Malformed template or resource
    #[error("manifest error: {0}")]
    Manifest(String),

    /// A transformer refused a resource
    #[error("transform error: {0}")]
    Transform(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    pub fn api(id: &ResourceId, msg: impl Into<String>) -> Self {
        Self::Api { id: id.clone(), message: msg.into() }
    }

    pub fn conflict(id: &ResourceId, msg: impl Into<String>) -> Self {
        Self::Conflict { id: id.clone(), message: msg.into() }
    }

    pub fn manifest(msg: impl Into<String>) -> Self {
        Self::Manifest(msg.into())
    }

    pub fn transform(msg: impl Into<String>) -> Self {
        Self::Transform(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
