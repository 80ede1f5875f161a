#![doc = include_str!("../README.md")]
#![deny(missing_docs)]
#![cfg_attr(test, deny(warnings))]

/// Implements an opinionated version of the exponential backoff.
mod backoff {
    pub mod config;
    pub mod wrapper;
}
pub use self::backoff::{config::BackoffConfig, wrapper::Backoff};

/// Implements bounded retrying of fallible asynchronous operations.
mod retry;
pub use self::retry::{RetryError, retry};

/// Implements deadline-bounding of arbitrary futures.
mod timeout;
pub use self::timeout::{TimeoutError, within};
