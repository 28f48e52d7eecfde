pub mod diff;
pub mod manager;

pub use diff::{content_hash, diff_payloads};
pub use manager::{IntegrityReport, VersionManager, VersionStore};
