//! Store-to-gRPC error translation.

use talemu_state::Error;
use tonic::Status;

/// Map a store error onto the matching gRPC status code.
pub fn to_status(error: Error) -> Status {
    match &error {
        Error::NotFound(_) => Status::not_found(error.to_string()),
        Error::AlreadyExists(_) => Status::already_exists(error.to_string()),
        Error::Conflict { .. } => Status::aborted(error.to_string()),
        Error::PhaseConflict(_) => Status::failed_precondition(error.to_string()),
        Error::Permission { .. } => Status::permission_denied(error.to_string()),
        Error::InvalidArgument(_) => Status::invalid_argument(error.to_string()),
        Error::Unavailable(_) => Status::unavailable(error.to_string()),
        Error::Journal(_, _) | Error::Failed(_) | Error::Encoding(_) => {
            Status::internal(error.to_string())
        }
    }
}

/// Missing prerequisite configuration surfaces as invalid-argument at the
/// RPC edge.
pub fn config_missing(what: &str) -> Status {
    Status::invalid_argument(format!("{what}: machine is not configured"))
}
