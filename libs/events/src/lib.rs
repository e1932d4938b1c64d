//! # tfop-events
//!
//! Human-readable event records emitted by the controller about the objects
//! it manages (jobs, units, discovery records).
//!
//! ## Design Principles
//!
//! - Events are best-effort: recording never fails and never gates
//!   reconciliation
//! - Every event names exactly one involved object
//! - Reasons are short CamelCase tokens; messages are free text
//!
//! ## Recorders
//!
//! - [`LogRecorder`] forwards events to `tracing`
//! - [`MemoryRecorder`] keeps them in memory for inspection in tests

mod record;
mod recorder;

pub use record::*;
pub use recorder::*;
