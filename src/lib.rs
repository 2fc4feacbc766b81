//! Code Relay: recovers one-time verification codes and hands them to an
//! automation worker.

pub mod clock;
pub mod code;
pub mod config;
pub mod error;
pub mod mailbox;
pub mod orchestrator;
pub mod relay;
pub mod server;
pub mod session;
