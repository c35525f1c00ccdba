//! `DriverError` → `tonic::Status` (design spec §7). The only place in the
//! binary allowed to know about gRPC status codes.

use bsu_common::error::DriverError;
use tonic::Status;

#[must_use]
pub fn to_status(err: DriverError) -> Status {
    match err {
        DriverError::InvalidArgument(m) => Status::invalid_argument(m),
        DriverError::NotFound(m) => Status::not_found(m),
        DriverError::AlreadyExists(m) => Status::already_exists(m),
        DriverError::FailedPrecondition(m) => Status::failed_precondition(m),
        DriverError::ResourceExhausted(m) => Status::resource_exhausted(m),
        DriverError::Aborted(m) => Status::aborted(m),
        DriverError::DeadlineExceeded(m) => Status::deadline_exceeded(m),
        DriverError::Internal(m) => Status::internal(m),
        DriverError::Unavailable(m) => Status::unavailable(m),
    }
}
