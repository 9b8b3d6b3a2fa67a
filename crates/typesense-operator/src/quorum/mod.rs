pub mod actuator;
pub mod classify;
pub mod probe;
pub mod readiness;
pub mod types;
