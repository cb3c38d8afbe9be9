//! Unit-level failure carrier.
//!
//! Everything that can go wrong while executing one unit funnels into
//! [`UnitError`]; the retry policy classifies it, the executor materializes
//! it as `error_message` on the unit row. The worker process stays up.

use crate::store::{SourceError, StoreError};

#[derive(Debug)]
pub enum UnitError {
    /// A store call failed mid-execution.
    Store(StoreError),
    /// The export procedure or its row stream failed.
    Source(SourceError),
    /// Object-storage upload failed.
    Storage(object_store::Error),
    /// A guarded mutation affected zero rows: the work was taken over.
    /// Exit without further mutation.
    LeaseLost,
}

impl std::fmt::Display for UnitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnitError::Store(e) => write!(f, "store: {e}"),
            UnitError::Source(e) => write!(f, "export source: {e}"),
            UnitError::Storage(e) => write!(f, "object storage: {e}"),
            UnitError::LeaseLost => f.write_str("lease lost"),
        }
    }
}

impl std::error::Error for UnitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            UnitError::Store(e) => Some(e),
            UnitError::Source(e) => Some(e),
            UnitError::Storage(e) => Some(e),
            UnitError::LeaseLost => None,
        }
    }
}

impl From<StoreError> for UnitError {
    fn from(value: StoreError) -> Self {
        UnitError::Store(value)
    }
}

impl From<SourceError> for UnitError {
    fn from(value: SourceError) -> Self {
        UnitError::Source(value)
    }
}

impl From<object_store::Error> for UnitError {
    fn from(value: object_store::Error) -> Self {
        UnitError::Storage(value)
    }
}
