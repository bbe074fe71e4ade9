//! Property tests: arbitrary reserve/release interleavings against a model.
//!
//! The model is a map from ticket number to the session holding it. After
//! every step the engine must agree with it, and no number is ever held by
//! two sessions.
//!
//! Run with: `cargo test --test reservation_properties_test`

#![allow(clippy::unwrap_used)]

mod common;

use common::{TestRaffle, session};
use proptest::prelude::*;
use raffle_core::{EngineError, TicketNumber, TicketStatus};
use raffle_testing::properties::ticket_selection;
use std::collections::BTreeMap;

const MAX: u16 = 12;
const SESSIONS: [&str; 3] = ["S0", "S1", "S2"];

#[derive(Debug, Clone)]
enum Step {
    Reserve { who: usize, numbers: Vec<TicketNumber> },
    Release { who: usize, numbers: Vec<TicketNumber> },
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        (0..SESSIONS.len(), ticket_selection(MAX, 4)).prop_map(|(who, numbers)| Step::Reserve { who, numbers }),
        (0..SESSIONS.len(), ticket_selection(MAX, 4)).prop_map(|(who, numbers)| Step::Release { who, numbers }),
    ]
}

async fn run(steps: Vec<Step>) {
    let raffle = TestRaffle::with_max(MAX).await;
    let mut model: BTreeMap<TicketNumber, usize> = BTreeMap::new();

    for step in steps {
        match step {
            Step::Reserve { who, numbers } => {
                let mut taken: Vec<TicketNumber> = numbers
                    .iter()
                    .filter(|n| model.get(n).is_some_and(|holder| *holder != who))
                    .copied()
                    .collect();
                taken.sort_unstable();

                let result = raffle.engine.reserve_numbers(&numbers, &session(SESSIONS[who])).await;
                if taken.is_empty() {
                    let held = result.unwrap();
                    assert_eq!(held.numbers.len(), numbers.len());
                    for number in numbers {
                        model.insert(number, who);
                    }
                } else {
                    assert_eq!(result.unwrap_err(), EngineError::AvailabilityConflict { numbers: taken });
                }
            }
            Step::Release { who, numbers } => {
                let report = raffle.engine.release(&numbers, &session(SESSIONS[who])).await.unwrap();
                for number in &report.released {
                    assert_eq!(model.remove(number), Some(who));
                }
                for number in &report.skipped {
                    assert_ne!(model.get(number), Some(&who));
                }
            }
        }

        let raffle_id = raffle.engine.ensure_active_raffle().await.unwrap().id;
        for ticket in raffle.store.tickets(raffle_id).await {
            match model.get(&ticket.number) {
                Some(holder) => {
                    assert_eq!(ticket.status, TicketStatus::Reserved);
                    assert_eq!(ticket.session_id, Some(session(SESSIONS[*holder])));
                }
                None => assert_eq!(ticket.status, TicketStatus::Available),
            }
        }
    }

    let summary = raffle.engine.availability().await.unwrap();
    assert_eq!(summary.reserved, u64::try_from(model.len()).unwrap());
    assert_eq!(summary.available + summary.reserved + summary.sold, u64::from(MAX));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn reserve_release_interleavings_match_the_model(steps in proptest::collection::vec(step(), 1..24)) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        runtime.block_on(run(steps));
    }
}
