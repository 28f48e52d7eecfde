pub mod approvals;
pub mod audit;
pub mod backplane;
pub mod config;
pub mod domain;
pub mod errors;
pub mod governor;
pub mod lifecycle;
pub mod policies;
pub mod versions;

mod locking;

pub use approvals::{
    ApprovalGate, ApprovalManager, ExternalApprover, ExternalVerdict, GateError, GateKind,
    ManualApprovalStore,
};
pub use audit::{
    AuditDispatcher, AuditError, AuditEvent, AuditEventType, AuditPolicy, AuditSink,
    InMemoryAuditSink, TracingAuditSink,
};
pub use backplane::{BackplaneError, GovernanceBackplane, PersistedState};
pub use domain::approval::{ApprovalContext, ApprovalRecord, ApprovalResult};
pub use domain::experiment::ExperimentName;
pub use domain::lifecycle::{LifecycleState, StateTransition, TransitionRequest};
pub use domain::policy::{
    PolicyContext, PolicyEvaluationRecord, PolicyEvaluationResult, Severity, TelemetryValue,
};
pub use domain::version::{
    ChangeKind, ConfigurationVersion, DiffEntry, DiffSummary, VersionDiff, VersionRequest,
};
pub use errors::{GovernanceError, InterfaceError};
pub use governor::{ExperimentSnapshot, GovernanceOutcome, GovernanceRequest, Governor};
pub use lifecycle::{ExperimentStateLookup, LifecycleManager, TransitionStore, TransitionTable};
pub use policies::{Policy, PolicyError, PolicyEvaluator};
pub use versions::{IntegrityReport, VersionManager, VersionStore};
