use talemu_resource::ResourceRef;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("resource not found: {0}")]
    NotFound(ResourceRef),

    #[error("resource already exists: {0}")]
    AlreadyExists(ResourceRef),

    #[error("version conflict on {reference}: expected {expected}, found {found}")]
    Conflict {
        reference: ResourceRef,
        expected: u64,
        found: u64,
    },

    #[error("phase conflict on {0}: resource is tearing down")]
    PhaseConflict(ResourceRef),

    #[error("owner mismatch on {reference}: held by {held:?}, requested by {requested:?}")]
    Permission {
        reference: ResourceRef,
        held: Option<String>,
        requested: Option<String>,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("store failed: {0}")]
    Failed(String),

    #[error("journal {0}: {1}")]
    Journal(String, #[source] std::io::Error),

    #[error(transparent)]
    Encoding(#[from] talemu_resource::Error),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    pub fn is_phase_conflict(&self) -> bool {
        matches!(self, Error::PhaseConflict(_))
    }

    /// Journal and store failures are fatal: the caller cannot make progress
    /// by retrying the same operation.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Journal(_, _) | Error::Failed(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
