pub mod approval;
pub mod experiment;
pub mod lifecycle;
pub mod policy;
pub mod version;
