/// Shared types for JM Bot: gateway wire protocol, error taxonomy,
/// group state and the fetch job model.
pub mod errors;
pub mod gateway_protocol;
pub mod group_state;
pub mod job;
