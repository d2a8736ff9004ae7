/// Shared scheduler context
pub mod context;

/// Readiness of steps
pub mod dependency_resolver;

/// Durable signals between actions and the outside world
pub mod external_io;

/// Runtime step instantiation
pub mod initializer;

/// Output wiring
pub mod output_propagator;

/// Validated, indexed definitions
pub mod plan;

/// The round loop
pub mod scheduler;

/// Step execution
pub mod step_processor;
