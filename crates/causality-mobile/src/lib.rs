// causality-mobile: offline-tolerant mobile analytics core.
//
// Events flow Track -> persistent queue -> batcher -> HTTP transport.  The
// queue is a WAL-journaled SQLite FIFO so nothing is lost to process death;
// the batcher drains it on count and time triggers; the transport retries
// with capped exponential backoff.  Session, device, and user identity are
// injected into every event as metadata.
//
// Native wrappers talk to `bridge`; Rust hosts and tests use `Sdk` directly.

pub mod backoff;
pub mod batcher;
pub mod bridge;
pub mod config;
pub mod context;
pub mod device;
pub mod error;
pub mod identity;
pub mod queue;
pub mod sdk;
pub mod session;
pub mod transport;

pub use config::SdkConfig;
pub use error::{SdkError, Severity};
pub use sdk::Sdk;
