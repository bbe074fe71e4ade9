//! Payment initiation (gateway Prepare).
//!
//! No transaction is held open across the gateway call: the sale is checked
//! in one short unit of work, the provider is called, and the outcome is
//! written back in a second one.

use crate::engine::{RaffleEngine, settle};
use crate::gateway::PrepareRequest;
use crate::sale::load_sale_in;
use raffle_core::{EngineError, Result, Sale, SaleId, SaleStatus};
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use uuid::Uuid;

/// A payment the buyer can now be redirected to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreparedPayment {
    /// Sale being paid
    pub sale_id: SaleId,
    /// Provider payment id
    pub payment_id: String,
    /// Provider checkout URL
    pub redirect_url: String,
}

impl RaffleEngine {
    /// Start a gateway payment for a PENDING sale.
    ///
    /// Records `payment_id` and `prepared_at` on success. A failure is
    /// recorded in `last_error` and returned.
    ///
    /// # Errors
    ///
    /// - [`EngineError::InvalidTransition`] unless the sale is PENDING
    /// - [`EngineError::GatewayCircuitOpen`], [`EngineError::GatewayTransient`]
    ///   or [`EngineError::GatewayRejected`] from the provider
    /// - [`EngineError::NotFound`], storage errors, timeouts
    #[tracing::instrument(skip(self))]
    pub async fn prepare_payment(&self, sale_id: SaleId) -> Result<PreparedPayment> {
        let sale = self.pending_sale(sale_id, "prepare").await?;
        if let Some(previous) = &sale.payment_id {
            tracing::info!(%previous, "Sale was already prepared, starting a new payment");
        }

        let correlation_id = Uuid::new_v4().to_string();
        let request = PrepareRequest {
            amount: sale.amount,
            currency: sale.currency.clone(),
            client_transaction_id: sale.client_transaction_id.clone(),
            reference: format!("Raffle tickets {}", sale.requested_numbers.join(", ")),
            correlation_id: correlation_id.clone(),
        };

        let response = match self.gateway.prepare(&request).await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(%correlation_id, error = %err, "Prepare failed");
                self.record_sale_error(sale_id, format!("prepare failed: {err}")).await;
                return Err(EngineError::from(err));
            }
        };

        let payment_id = response.payment_id.clone();
        let payment_id = &payment_id;
        self.with_conflict_retry("prepare_payment", move || async move {
            let mut tx = self.store.begin().await?;
            let now = self.clock.now();
            let outcome = timeout(self.settings.tx_timeout, async {
                let mut sale = load_sale_in(tx.as_mut(), sale_id, true).await?;
                ensure_pending(&sale, "prepare")?;
                sale.payment_id = Some(payment_id.clone());
                sale.prepared_at = Some(now);
                sale.updated_at = now;
                tx.update_sale(&sale).await
            })
            .await;
            settle(tx, outcome, "prepare_payment").await
        })
        .await?;

        tracing::info!(%payment_id, %correlation_id, "Payment prepared");
        Ok(PreparedPayment {
            sale_id,
            payment_id: response.payment_id,
            redirect_url: response.redirect_url,
        })
    }

    /// Load a sale and require it to be PENDING.
    async fn pending_sale(&self, sale_id: SaleId, action: &'static str) -> Result<Sale> {
        let sale = self.get_sale(sale_id).await?;
        ensure_pending(&sale, action)?;
        Ok(sale)
    }

    /// Write `last_error` in its own transaction. Failures are logged only,
    /// the caller is already reporting a more useful error.
    pub(crate) async fn record_sale_error(&self, sale_id: SaleId, message: String) {
        let message = &message;
        let result = async {
            let mut tx = self.store.begin().await?;
            let now = self.clock.now();
            let outcome = timeout(self.settings.tx_timeout, async {
                let mut sale = load_sale_in(tx.as_mut(), sale_id, true).await?;
                sale.record_error(message.clone(), now);
                tx.update_sale(&sale).await
            })
            .await;
            settle(tx, outcome, "record_sale_error").await
        }
        .await;

        if let Err(err) = result {
            tracing::warn!(%sale_id, error = %err, "Could not record sale error");
        }
    }
}

pub(crate) fn ensure_pending(sale: &Sale, action: &'static str) -> Result<()> {
    if sale.status == SaleStatus::Pending {
        Ok(())
    } else {
        Err(EngineError::InvalidTransition {
            sale_id: sale.id,
            from: sale.status,
            action,
        })
    }
}
