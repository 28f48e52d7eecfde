pub mod gate;
pub mod manager;

pub use gate::{
    ApprovalGate, ExternalApprover, ExternalVerdict, GateBuilder, GateError, GateKind,
    ManualApprovalStore,
};
pub use manager::ApprovalManager;
