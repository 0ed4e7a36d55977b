//! Device protocol: link state machine, reconnect backoff, command channel,
//! and the engine that owns the transport.

pub mod backoff;
pub mod commands;
pub mod engine;
pub mod state;

pub use backoff::ReconnectPolicy;
pub use commands::{CommandChannel, CommandEnvelope, CommandExecutor, CommandRequest};
pub use engine::{EngineReport, EngineSettings, EngineStatus, ProtocolEngine};
pub use state::{EngineState, StateMachine};
