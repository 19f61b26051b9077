use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    State(#[from] talemu_state::Error),

    #[error(transparent)]
    Encoding(#[from] talemu_resource::Error),

    #[error("controller {controller} wrote undeclared output kind {kind}")]
    UndeclaredOutput {
        controller: &'static str,
        kind: &'static str,
    },

    #[error("controller {controller} read undeclared kind {kind}")]
    UndeclaredInput {
        controller: &'static str,
        kind: &'static str,
    },

    #[error("duplicate controller name {0}")]
    DuplicateController(&'static str),

    #[error("exclusive output {kind} already claimed by {claimed_by}, rejected for {controller}")]
    OutputClaimed {
        kind: String,
        claimed_by: &'static str,
        controller: &'static str,
    },

    #[error("{0}: {1}")]
    Controller(String, #[source] Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wrap a domain error with reconcile context.
    pub fn controller(
        context: impl Into<String>,
        error: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Error::Controller(context.into(), Box::new(error))
    }

    /// Required-input-missing and transient write races are "wait" signals,
    /// not failures: the reconcile pass gives up and retries on the next
    /// wakeup.
    pub fn is_wait(&self) -> bool {
        match self {
            Error::State(e) => e.is_not_found() || e.is_phase_conflict(),
            _ => false,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
