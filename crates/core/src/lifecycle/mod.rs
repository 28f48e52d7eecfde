pub mod manager;
pub mod table;

pub use manager::{ExperimentStateLookup, LifecycleManager, TransitionStore};
pub use table::{TransitionTable, TransitionTableError};
