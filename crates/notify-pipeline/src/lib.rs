//! The core event-processing pipeline: ingestion validates and enriches an
//! incoming event, the preference stage filters it down to allowed
//! channels, the renderer/router stage fills in templates per channel, and
//! the delivery stage hands rendered notifications to per-channel
//! transports with retry and circuit breaking. Analytics reads the
//! resulting audit log back out. Every stage is a pure-ish function over
//! injected `notify-store`/`notify-cache` trait objects so it can be
//! exercised without a broker in tests; the `bin/*-worker` processes wire
//! these functions to `notify-queue` poll loops.

pub mod analytics;
pub mod delivery;
pub mod ingestion;
pub mod preferences;
pub mod renderer;

pub use notify_common::{NotifyError, Result};
