//! Row shapes returned by queries and their conversion into domain types.

use chrono::{DateTime, Utc};
use raffle_core::{
    Customer, CustomerId, EngineError, Raffle, RaffleId, RaffleStatus, Sale, SaleId, SaleStatus,
    SessionId, Ticket, TicketNumber, TicketStatus,
};
use uuid::Uuid;

#[derive(sqlx::FromRow)]
pub(crate) struct RaffleRow {
    id: Uuid,
    name: String,
    status: String,
    max_number: i32,
    unit_price: i64,
    currency: String,
    created_at: DateTime<Utc>,
    closed_at: Option<DateTime<Utc>>,
}

impl TryFrom<RaffleRow> for Raffle {
    type Error = EngineError;

    fn try_from(row: RaffleRow) -> Result<Self, Self::Error> {
        let max_number = u16::try_from(row.max_number)
            .map_err(|_| EngineError::Storage(format!("Invalid max_number: {}", row.max_number)))?;
        Ok(Self {
            id: RaffleId::from_uuid(row.id),
            name: row.name,
            status: RaffleStatus::parse(&row.status)?,
            max_number,
            unit_price: row.unit_price,
            currency: row.currency,
            created_at: row.created_at,
            closed_at: row.closed_at,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct TicketRow {
    raffle_id: Uuid,
    number: i32,
    status: String,
    sale_id: Option<Uuid>,
    session_id: Option<String>,
    reserved_until: Option<DateTime<Utc>>,
    sold_at: Option<DateTime<Utc>>,
}

impl TryFrom<TicketRow> for Ticket {
    type Error = EngineError;

    fn try_from(row: TicketRow) -> Result<Self, Self::Error> {
        let number = u32::try_from(row.number)
            .map_err(|_| EngineError::Storage(format!("Invalid ticket number: {}", row.number)))
            .and_then(|n| {
                TicketNumber::new(n).map_err(|e| EngineError::Storage(e.to_string()))
            })?;
        Ok(Self {
            raffle_id: RaffleId::from_uuid(row.raffle_id),
            number,
            status: TicketStatus::parse(&row.status)?,
            sale_id: row.sale_id.map(SaleId::from_uuid),
            session_id: row.session_id.map(SessionId::new),
            reserved_until: row.reserved_until,
            sold_at: row.sold_at,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct SaleRow {
    id: Uuid,
    raffle_id: Uuid,
    customer_id: Uuid,
    status: String,
    amount: i64,
    currency: String,
    payment_id: Option<String>,
    client_transaction_id: String,
    authorization_code: Option<String>,
    requested_numbers: Vec<String>,
    ticket_numbers: Vec<String>,
    created_at: DateTime<Utc>,
    prepared_at: Option<DateTime<Utc>>,
    confirmed_at: Option<DateTime<Utc>>,
    last_email_sent_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    last_error_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SaleRow> for Sale {
    type Error = EngineError;

    fn try_from(row: SaleRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: SaleId::from_uuid(row.id),
            raffle_id: RaffleId::from_uuid(row.raffle_id),
            customer_id: CustomerId::from_uuid(row.customer_id),
            status: SaleStatus::parse(&row.status)?,
            amount: row.amount,
            currency: row.currency,
            payment_id: row.payment_id,
            client_transaction_id: row.client_transaction_id,
            authorization_code: row.authorization_code,
            requested_numbers: row.requested_numbers,
            ticket_numbers: row.ticket_numbers,
            created_at: row.created_at,
            prepared_at: row.prepared_at,
            confirmed_at: row.confirmed_at,
            last_email_sent_at: row.last_email_sent_at,
            last_error: row.last_error,
            last_error_at: row.last_error_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct CustomerRow {
    id: Uuid,
    id_number: String,
    full_name: String,
    email: String,
    phone: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<CustomerRow> for Customer {
    fn from(row: CustomerRow) -> Self {
        Self {
            id: CustomerId::from_uuid(row.id),
            id_number: row.id_number,
            full_name: row.full_name,
            email: row.email,
            phone: row.phone,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}
