use thiserror::Error;

use labgate_core::backplane::BackplaneError;
use labgate_core::domain::lifecycle::UnknownLifecycleState;
use labgate_core::domain::policy::UnknownSeverity;

pub mod governance;
pub mod memory;

pub use governance::SqlGovernanceBackplane;
pub use memory::InMemoryBackplane;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("decode error: {0}")]
    State(#[from] UnknownLifecycleState),
    #[error("decode error: {0}")]
    Severity(#[from] UnknownSeverity),
}

impl From<RepositoryError> for BackplaneError {
    fn from(value: RepositoryError) -> Self {
        BackplaneError::Storage(value.to_string())
    }
}
