//! Forwarding recovered codes to the Automation Worker Endpoint.

pub mod dead_letter;
pub mod forwarder;

pub use dead_letter::{
    DeadLetterPayload, DeadLetterRecord, DeadLetterSink, JsonlDeadLetterSink,
    MemoryDeadLetterSink, TracingDeadLetterSink,
};
pub use forwarder::{RelayAttempt, RelayForwarder, RelayOutcome};
