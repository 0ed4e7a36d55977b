//! # DAQ Capture Core
//!
//! Crash-resistant acquisition core for a single serial-attached laboratory
//! instrument. The library owns the instrument link, turns raw frames into
//! ordered measurements, makes every measurement durable before it reaches the
//! relational store, and keeps the link healthy with a watchdog and a command
//! scheduler.
//!
//! ## Crate Structure
//!
//! - **`config`**: figment-backed station configuration (`CaptureConfig`).
//! - **`error`**: the `CaptureError` taxonomy and `AppResult` alias.
//! - **`logging`**: tracing-subscriber setup.
//! - **`profile`**: declarative protocol profiles and their TOML registry.
//! - **`transport`**: the `Transport` trait plus serial, simulated, and mock links.
//! - **`protocol`**: the engine state machine, reconnect backoff, and command channel.
//! - **`ingest`**: framing, decoding, compensation, and the ingestion pipeline.
//! - **`buffer`**: the per-session append-only log and startup recovery.
//! - **`store`**: the `MeasurementStore` boundary with SQLite and in-memory stores.
//! - **`watchdog`**: link staleness detection and scheduled commands.
//! - **`events`**: structured lifecycle events and the audit trail.
//! - **`runtime`**: `CaptureRuntime`, which wires everything together.

pub mod buffer;
pub mod config;
pub mod error;
pub mod events;
pub mod ingest;
pub mod logging;
pub mod profile;
pub mod protocol;
pub mod runtime;
pub mod store;
pub mod transport;
pub mod watchdog;

pub use config::CaptureConfig;
pub use error::{AppResult, CaptureError};
pub use events::{CoreEvent, EventSink};
pub use profile::{Profile, ProfileRegistry};
pub use protocol::{EngineState, ProtocolEngine};
pub use runtime::{CaptureRuntime, ShutdownReport};
pub use store::{MeasurementStore, MemoryStore, SqliteStore};
