//! # Raffle Core
//!
//! Domain types and contracts for the raffle ticket engine.
//!
//! This crate contains no I/O. It defines:
//!
//! - [`types`]: raffles, tickets, sales, customers and ticket numbers
//! - [`error`]: the [`EngineError`] taxonomy shared by every layer
//! - [`store`]: the transactional storage contract ([`RaffleStore`] / [`RaffleTx`])
//! - [`environment`]: injectable dependencies such as the [`Clock`](environment::Clock)
//!
//! ## Invariants
//!
//! - A ticket is identified by `(raffle_id, number)`; a reset always creates a
//!   new raffle id, so recovery never crosses raffle generations.
//! - `Sale::requested_numbers` is written once at creation and is the source
//!   of truth for recovery.
//! - A PAID sale always carries a non-empty `ticket_numbers` snapshot equal to
//!   the set of SOLD tickets linked to it.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod store;
pub mod types;

pub use error::{EngineError, Result};
pub use store::{RaffleStore, RaffleTx};
pub use types::*;

/// Environment traits for dependency injection.
///
/// All time-dependent logic (hold expiry, breaker windows, sweeps) reads the
/// current time through [`Clock`](environment::Clock) so tests can pin or
/// advance it deterministically.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use raffle_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let now = clock.now();
    /// assert!(now.timestamp() > 0);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
