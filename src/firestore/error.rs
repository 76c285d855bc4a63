use std::error::Error;
use std::fmt::{Display, Formatter};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FirestoreErrorCode {
    InvalidArgument,
    Internal,
    NotFound,
    /// The operation was rejected because the system is not in a state required for it.
    FailedPrecondition,
    /// A `ReadWritePrimary` transaction ran in a process that does not hold the primary lease.
    PrimaryLeaseLost,
    /// Transient storage failure, typically a conflicting transaction.
    Aborted,
    Unavailable,
    DataLoss,
}

impl FirestoreErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FirestoreErrorCode::InvalidArgument => "firestore/invalid-argument",
            FirestoreErrorCode::Internal => "firestore/internal",
            FirestoreErrorCode::NotFound => "firestore/not-found",
            FirestoreErrorCode::FailedPrecondition => "firestore/failed-precondition",
            FirestoreErrorCode::PrimaryLeaseLost => "firestore/primary-lease-lost",
            FirestoreErrorCode::Aborted => "firestore/aborted",
            FirestoreErrorCode::Unavailable => "firestore/unavailable",
            FirestoreErrorCode::DataLoss => "firestore/data-loss",
        }
    }
}

#[derive(Clone, Debug)]
pub struct FirestoreError {
    pub code: FirestoreErrorCode,
    message: String,
}

impl FirestoreError {
    pub fn new(code: FirestoreErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code.as_str()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns `true` when the error signals that the primary lease is held elsewhere.
    ///
    /// Callers usually present this as "another process is in control" instead of a hard
    /// failure and stop issuing primary-only operations until the lease state changes.
    pub fn is_primary_lease_lost(&self) -> bool {
        self.code == FirestoreErrorCode::PrimaryLeaseLost
    }

    /// Lease loss is a specialised precondition failure.
    pub fn is_failed_precondition(&self) -> bool {
        matches!(
            self.code,
            FirestoreErrorCode::FailedPrecondition | FirestoreErrorCode::PrimaryLeaseLost
        )
    }

    pub fn is_transient(&self) -> bool {
        self.code == FirestoreErrorCode::Aborted
    }
}

impl Display for FirestoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code_str())
    }
}

impl Error for FirestoreError {}

pub type FirestoreResult<T> = Result<T, FirestoreError>;

pub(crate) const PRIMARY_LEASE_LOST_ERROR_MSG: &str =
    "The current process is no longer the primary process. This can happen if persistence \
     is shared between processes and another one took over the primary lease.";

pub(crate) const PRIMARY_LEASE_EXCLUSIVE_ERROR_MSG: &str =
    "Another process holds an exclusive primary lease. Enable tab synchronization in every \
     process sharing the same persistence directory to access it concurrently.";

pub fn invalid_argument(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::InvalidArgument, message)
}

pub fn internal_error(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Internal, message)
}

pub fn not_found(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::NotFound, message)
}

pub fn failed_precondition(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::FailedPrecondition, message)
}

pub fn primary_lease_lost() -> FirestoreError {
    FirestoreError::new(
        FirestoreErrorCode::PrimaryLeaseLost,
        PRIMARY_LEASE_LOST_ERROR_MSG,
    )
}

pub fn primary_lease_exclusive() -> FirestoreError {
    failed_precondition(PRIMARY_LEASE_EXCLUSIVE_ERROR_MSG)
}

pub fn aborted(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Aborted, message)
}

pub fn unavailable(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Unavailable, message)
}

pub fn data_loss(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::DataLoss, message)
}
