/// Domain events
pub mod events;

/// Runtime flow aggregate
pub mod flow;

/// Flow definition
pub mod flow_definition;

/// Step payloads
pub mod payload;

/// Repository interfaces
pub mod repository;

/// Durable signals
pub mod signals;
