//! Resilience primitives
//!
//! - **RetryPolicy**: retry-with-backoff shared by broker connection and
//!   model acquisition
//! - **Shutdown**: process-wide cancellation signal observed by every loop

pub mod retry;
pub mod shutdown;

pub use retry::{Backoff, RetryError, RetryPolicy};
pub use shutdown::{shutdown_channel, Shutdown, ShutdownTrigger};
