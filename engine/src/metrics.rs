//! Business metrics for the raffle engine.
//!
//! # Metrics
//!
//! ## Reservations
//! - `raffle_reservations_total{kind}` - holds placed (`random` or `explicit`)
//! - `raffle_releases_total` - tickets released by a buyer
//!
//! ## Sales
//! - `raffle_sales_total{status}` - sale transitions (`created`, `paid`, `canceled`, `expired`)
//! - `raffle_tickets_sold_total` - tickets promoted to SOLD
//! - `raffle_revenue_minor_total` - paid amounts in minor units
//!
//! ## Recovery
//! - `raffle_ghost_sales_total` - sales no recovery tier could resolve
//! - `raffle_recoveries_total{tier}` - which tier resolved a sale
//!
//! ## Gateway
//! - `raffle_gateway_calls_total{op, outcome}` - gateway calls after retries
//! - `raffle_gateway_duration_seconds{op}` - gateway latency including retries
//! - `raffle_circuit_breaker_open_total{breaker}` - breaker trips (see `raffle-runtime`)
//!
//! ## Inventory
//! - `raffle_sweeper_released_total` - tickets reclaimed by the expiry sweep
//! - `raffle_tickets_available` - AVAILABLE tickets in the active raffle

use metrics::{describe_counter, describe_gauge, describe_histogram};

/// Register all business metrics with descriptions.
///
/// Call once at startup, after the metrics recorder is installed.
pub fn register_business_metrics() {
    describe_counter!(
        "raffle_reservations_total",
        "Reservation holds placed, labeled by kind (random, explicit)"
    );
    describe_counter!("raffle_releases_total", "Tickets released by their holding session");
    describe_counter!(
        "raffle_sales_total",
        "Sale transitions, labeled by status (created, paid, canceled, expired)"
    );
    describe_counter!("raffle_tickets_sold_total", "Tickets promoted to SOLD");
    describe_counter!(
        "raffle_revenue_minor_total",
        "Revenue from paid sales in minor currency units"
    );
    describe_counter!(
        "raffle_ghost_sales_total",
        "Sales that no recovery tier could resolve to ticket numbers"
    );
    describe_counter!(
        "raffle_recoveries_total",
        "Sales resolved by the recovery chain, labeled by tier"
    );
    describe_counter!(
        "raffle_gateway_calls_total",
        "Payment gateway calls, labeled by operation and outcome"
    );
    describe_histogram!(
        "raffle_gateway_duration_seconds",
        "Payment gateway call latency including retries"
    );
    describe_counter!(
        "raffle_sweeper_released_total",
        "Expired reservations released by the sweeper"
    );
    describe_gauge!(
        "raffle_tickets_available",
        "AVAILABLE tickets in the active raffle"
    );

    tracing::info!("Business metrics registered");
}

/// Record a reservation hold.
pub fn record_reservation(kind: &'static str, quantity: usize) {
    metrics::counter!("raffle_reservations_total", "kind" => kind).increment(1);
    tracing::debug!(kind, quantity, "Recorded reservation metric");
}

/// Record tickets released by their session.
pub fn record_release(quantity: usize) {
    metrics::counter!("raffle_releases_total").increment(quantity as u64);
}

/// Record a sale transition.
pub fn record_sale(status: &'static str) {
    metrics::counter!("raffle_sales_total", "status" => status).increment(1);
}

/// Record a sale becoming PAID.
///
/// # Arguments
///
/// * `tickets` - Number of tickets promoted to SOLD
/// * `amount_minor` - Sale amount in minor currency units
pub fn record_sale_paid(tickets: usize, amount_minor: i64) {
    record_sale("paid");
    metrics::counter!("raffle_tickets_sold_total").increment(tickets as u64);
    metrics::counter!("raffle_revenue_minor_total")
        .increment(u64::try_from(amount_minor).unwrap_or(0));
    tracing::debug!(tickets, amount_minor, "Recorded sale_paid metric");
}

/// Record which recovery tier resolved a sale.
pub fn record_recovery(tier: &'static str) {
    metrics::counter!("raffle_recoveries_total", "tier" => tier).increment(1);
}

/// Record a sale that no recovery tier could resolve.
pub fn record_ghost_sale() {
    metrics::counter!("raffle_ghost_sales_total").increment(1);
}

/// Record one gateway call.
///
/// # Arguments
///
/// * `op` - `prepare` or `confirm`
/// * `outcome` - `ok`, `rejected`, `transient` or `circuit_open`
/// * `duration_secs` - Latency including retries
pub fn record_gateway_call(op: &'static str, outcome: &'static str, duration_secs: f64) {
    metrics::counter!("raffle_gateway_calls_total", "op" => op, "outcome" => outcome).increment(1);
    metrics::histogram!("raffle_gateway_duration_seconds", "op" => op).record(duration_secs);
}

/// Record tickets reclaimed by the expiry sweep.
pub fn record_sweeper_released(tickets: u64) {
    metrics::counter!("raffle_sweeper_released_total").increment(tickets);
}

/// Update the AVAILABLE tickets gauge.
#[allow(clippy::cast_precision_loss)]
pub fn update_tickets_available(available: u64) {
    metrics::gauge!("raffle_tickets_available").set(available as f64);
}
