//! # Raffle Testing
//!
//! Test utilities for the raffle engine.
//!
//! - [`mocks`]: deterministic clocks
//! - [`memory`]: an in-memory implementation of the storage contract with
//!   crash-simulation helpers
//! - [`properties`]: proptest strategies for domain values
//!
//! ## Example
//!
//! ```
//! use raffle_testing::{InMemoryRaffleStore, ManualClock};
//! use raffle_core::environment::Clock;
//! use std::time::Duration;
//!
//! let store = InMemoryRaffleStore::new();
//! let clock = ManualClock::new();
//! let start = clock.now();
//! clock.advance(Duration::from_secs(600));
//! assert_eq!((clock.now() - start).num_minutes(), 10);
//! # drop(store);
//! ```

use chrono::{DateTime, Utc};
use raffle_core::environment::Clock;

pub mod memory;

/// Mock implementations of environment traits.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use raffle_testing::mocks::FixedClock;
    /// use raffle_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that only moves when told to.
    ///
    /// Starts at [`test_epoch`]. Used to walk holds past their expiry and
    /// breakers past their cooldown without sleeping.
    #[derive(Debug)]
    pub struct ManualClock {
        time: Mutex<DateTime<Utc>>,
    }

    impl ManualClock {
        /// A clock starting at [`test_epoch`]
        #[must_use]
        pub fn new() -> Self {
            Self::starting_at(test_epoch())
        }

        /// A clock starting at `time`
        #[must_use]
        pub const fn starting_at(time: DateTime<Utc>) -> Self {
            Self {
                time: Mutex::new(time),
            }
        }

        /// Move the clock forward.
        pub fn advance(&self, by: Duration) {
            let by = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::MAX);
            let mut time = self.time.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            *time = time.checked_add_signed(by).unwrap_or(DateTime::<Utc>::MAX_UTC);
        }

        /// Jump to an exact instant.
        pub fn set(&self, to: DateTime<Utc>) {
            let mut time = self.time.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            *time = to;
        }
    }

    impl Default for ManualClock {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
        }
    }

    /// 2025-01-01 00:00:00 UTC
    #[must_use]
    pub fn test_epoch() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_735_689_600, 0).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(test_epoch())
    }
}

/// Property-based testing strategies.
pub mod properties {
    use proptest::prelude::*;
    use raffle_core::{MAX_TICKET_NUMBER, TicketNumber};

    /// Any valid ticket number up to `max`.
    pub fn ticket_number(max: u16) -> impl Strategy<Value = TicketNumber> {
        let max = max.clamp(1, MAX_TICKET_NUMBER);
        (1..=max).prop_filter_map("valid ticket number", |n| TicketNumber::new(u32::from(n)).ok())
    }

    /// A non-empty, duplicate-free selection of up to `len` numbers.
    pub fn ticket_selection(max: u16, len: usize) -> impl Strategy<Value = Vec<TicketNumber>> {
        proptest::collection::btree_set(ticket_number(max), 1..=len.max(1))
            .prop_map(|set| set.into_iter().collect())
    }
}

pub use memory::InMemoryRaffleStore;
pub use mocks::{FixedClock, ManualClock, test_clock};
