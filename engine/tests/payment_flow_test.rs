//! Sale lifecycle integration tests.
//!
//! Walks sales from creation through Prepare and Confirm, including late
//! approvals, gateway cancellation, the expiry sweeper and the stale
//! reconcile batch.
//!
//! Run with: `cargo test --test payment_flow_test`

#![allow(clippy::unwrap_used)]

mod common;

use common::{TestRaffle, buyer, n, numbers, session};
use raffle_core::{EngineError, Sale, SaleStatus, TicketStatus};
use raffle_engine::{ConfirmCallback, ConfirmOutcome, CreateSaleRequest, TicketSelection};
use std::time::Duration;

async fn prepared_sale(raffle: &TestRaffle, who: &str, picks: &[u32]) -> (Sale, ConfirmCallback) {
    let sale = raffle
        .engine
        .create_sale(CreateSaleRequest {
            customer: buyer(who),
            session_id: session(&format!("session-{who}")),
            selection: TicketSelection::Explicit(numbers(picks)),
        })
        .await
        .unwrap();
    let prepared = raffle.engine.prepare_payment(sale.id).await.unwrap();
    let callback = ConfirmCallback {
        payment_id: prepared.payment_id,
        client_transaction_id: sale.client_transaction_id.clone(),
    };
    (sale, callback)
}

#[tokio::test]
async fn test_approved_payment_sells_the_tickets_and_emails_them() {
    let raffle = TestRaffle::with_max(20).await;
    let (sale, callback) = prepared_sale(&raffle, "100", &[5, 6]).await;
    raffle.gateway.approve(&callback.payment_id, "AUTH-1");

    let outcome = raffle.engine.confirm_payment(callback).await.unwrap();

    assert_eq!(
        outcome,
        ConfirmOutcome::Paid {
            sale_id: sale.id,
            ticket_numbers: vec!["0005".into(), "0006".into()],
            replayed: false,
            email_sent: true,
        }
    );
    let paid = raffle.engine.get_sale(sale.id).await.unwrap();
    assert_eq!(paid.status, SaleStatus::Paid);
    assert_eq!(paid.authorization_code.as_deref(), Some("AUTH-1"));
    assert!(paid.confirmed_at.is_some());
    assert!(paid.last_email_sent_at.is_some());

    for ticket in raffle.engine.find_by_numbers(&numbers(&[5, 6])).await.unwrap() {
        assert_eq!(ticket.status, TicketStatus::Sold);
        assert_eq!(ticket.sale_id, Some(sale.id));
    }
    assert_eq!(raffle.census().await, (18, 0, 2));

    let sent = raffle.mailer.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "buyer100@example.com");
    assert_eq!(sent[0].tickets, vec!["0005".to_string(), "0006".to_string()]);
    assert_eq!(sent[0].total, 200);
}

#[tokio::test]
async fn test_replayed_callback_answers_without_side_effects() {
    let raffle = TestRaffle::with_max(20).await;
    let (sale, callback) = prepared_sale(&raffle, "100", &[5, 6]).await;
    raffle.gateway.approve(&callback.payment_id, "AUTH-1");
    raffle.engine.confirm_payment(callback.clone()).await.unwrap();
    let confirms = raffle.gateway.confirm_calls();
    let before = raffle.store.sale(sale.id).await.unwrap();

    let replay = raffle.engine.confirm_payment(callback).await.unwrap();

    let ConfirmOutcome::Paid { ticket_numbers, replayed, email_sent, .. } = replay else {
        unreachable!("replay should report PAID, got {replay:?}");
    };
    assert_eq!(ticket_numbers, vec!["0005".to_string(), "0006".to_string()]);
    assert!(replayed);
    assert!(!email_sent);
    assert_eq!(raffle.gateway.confirm_calls(), confirms);
    assert_eq!(raffle.mailer.sent().len(), 1);
    assert_eq!(raffle.store.sale(sale.id).await.unwrap(), before);
}

#[tokio::test]
async fn test_late_approval_of_an_expired_sale_still_sells_the_tickets() {
    let raffle = TestRaffle::with_max(20).await;
    let (sale, callback) = prepared_sale(&raffle, "100", &[5, 6]).await;

    raffle.clock.advance(Duration::from_secs(11 * 60));
    let swept = raffle.engine.sweep_expired().await.unwrap();
    assert_eq!(swept.expired_sales, 1);
    assert_eq!(raffle.engine.get_sale(sale.id).await.unwrap().status, SaleStatus::Expired);
    assert_eq!(raffle.census().await, (20, 0, 0));

    raffle.gateway.approve(&callback.payment_id, "AUTH-LATE");
    let outcome = raffle.engine.confirm_payment(callback).await.unwrap();

    assert!(matches!(outcome, ConfirmOutcome::Paid { replayed: false, .. }));
    let paid = raffle.engine.get_sale(sale.id).await.unwrap();
    assert_eq!(paid.status, SaleStatus::Paid);
    assert_eq!(paid.ticket_numbers, vec!["0005".to_string(), "0006".to_string()]);
    assert_eq!(raffle.census().await, (18, 0, 2));
}

#[tokio::test]
async fn test_late_approval_for_numbers_sold_elsewhere_is_a_ghost_sale() {
    let raffle = TestRaffle::with_max(20).await;
    let (late, late_callback) = prepared_sale(&raffle, "100", &[5, 6]).await;
    raffle.clock.advance(Duration::from_secs(11 * 60));
    raffle.engine.sweep_expired().await.unwrap();

    // Someone else buys 6 in the meantime
    let (_, other_callback) = prepared_sale(&raffle, "200", &[6]).await;
    raffle.gateway.approve(&other_callback.payment_id, "AUTH-2");
    raffle.engine.confirm_payment(other_callback).await.unwrap();

    raffle.gateway.approve(&late_callback.payment_id, "AUTH-1");
    let err = raffle.engine.confirm_payment(late_callback).await.unwrap_err();

    assert_eq!(err.code(), "GHOST_SALE");
    let stored = raffle.engine.get_sale(late.id).await.unwrap();
    assert_eq!(stored.status, SaleStatus::Expired);
    assert!(stored.last_error.unwrap().contains("Ghost sale"));
    // Ticket 5 was not half-sold by the failed finalization
    let five = raffle.engine.find_by_numbers(&[n(5)]).await.unwrap();
    assert_eq!(five[0].status, TicketStatus::Available);
}

#[tokio::test]
async fn test_gateway_cancellation_releases_the_holds() {
    let raffle = TestRaffle::with_max(20).await;
    let (sale, callback) = prepared_sale(&raffle, "100", &[5, 6]).await;
    raffle.gateway.cancel(&callback.payment_id);

    let outcome = raffle.engine.confirm_payment(callback.clone()).await.unwrap();

    assert_eq!(outcome, ConfirmOutcome::Canceled { sale_id: sale.id });
    assert_eq!(raffle.census().await, (20, 0, 0));

    // A later approval cannot resurrect it
    raffle.gateway.approve(&callback.payment_id, "AUTH-1");
    let again = raffle.engine.confirm_payment(callback).await.unwrap();
    assert_eq!(
        again,
        ConfirmOutcome::AlreadyClosed {
            sale_id: sale.id,
            status: SaleStatus::Canceled
        }
    );
    assert_eq!(raffle.census().await, (20, 0, 0));
}

#[tokio::test]
async fn test_sweeper_never_touches_paid_tickets() {
    let raffle = TestRaffle::with_max(20).await;
    let (paid, callback) = prepared_sale(&raffle, "100", &[1, 2]).await;
    raffle.gateway.approve(&callback.payment_id, "AUTH-1");
    raffle.engine.confirm_payment(callback).await.unwrap();
    let (abandoned, _) = prepared_sale(&raffle, "200", &[3]).await;

    raffle.clock.advance(Duration::from_secs(60 * 60));
    let report = raffle.engine.sweep_expired().await.unwrap();

    assert_eq!(report.released_tickets, 1);
    assert_eq!(report.expired_sales, 1);
    assert_eq!(raffle.engine.get_sale(paid.id).await.unwrap().status, SaleStatus::Paid);
    assert_eq!(raffle.engine.get_sale(abandoned.id).await.unwrap().status, SaleStatus::Expired);
    assert_eq!(raffle.census().await, (18, 0, 2));
}

#[tokio::test]
async fn test_stale_reconcile_settles_what_the_gateway_knows() {
    let raffle = TestRaffle::with_max(30).await;
    let (approved, approved_cb) = prepared_sale(&raffle, "100", &[1]).await;
    let (canceled, canceled_cb) = prepared_sale(&raffle, "200", &[2]).await;
    let (_, _) = prepared_sale(&raffle, "300", &[3]).await;
    raffle
        .engine
        .create_sale(CreateSaleRequest {
            customer: buyer("400"),
            session_id: session("session-400"),
            selection: TicketSelection::Random { count: 2 },
        })
        .await
        .unwrap();
    raffle.gateway.approve(&approved_cb.payment_id, "AUTH-1");
    raffle.gateway.cancel(&canceled_cb.payment_id);

    raffle.clock.advance(Duration::from_secs(3 * 60 * 60));
    let report = raffle
        .engine
        .reconcile_stale(Duration::from_secs(2 * 60 * 60))
        .await
        .unwrap();

    assert_eq!(report.checked, 4);
    assert_eq!(report.paid, 1);
    assert_eq!(report.canceled, 1);
    assert_eq!(report.still_pending, 1);
    assert_eq!(report.unprepared, 1);
    assert!(report.failed.is_empty());
    assert_eq!(raffle.engine.get_sale(approved.id).await.unwrap().status, SaleStatus::Paid);
    assert_eq!(raffle.engine.get_sale(canceled.id).await.unwrap().status, SaleStatus::Canceled);
}

#[tokio::test]
async fn test_confirm_with_unknown_transaction_is_not_found() {
    let raffle = TestRaffle::with_max(10).await;

    let err = raffle
        .engine
        .confirm_payment(ConfirmCallback {
            payment_id: "pay-404".into(),
            client_transaction_id: "nope".into(),
        })
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::NotFound { .. }));
    assert_eq!(raffle.gateway.confirm_calls(), 0);
}
