pub mod builtin;
pub mod evaluator;

pub use builtin::{
    ConflictPreventionPolicy, ErrorRatePolicy, TimeWindowPolicy, TrafficLimitPolicy,
};
pub use evaluator::{Policy, PolicyError, PolicyEvaluator};
