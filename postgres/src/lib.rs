//! `PostgreSQL` storage for the raffle engine.
//!
//! [`PostgresRaffleStore`] implements the [`RaffleStore`] contract from
//! `raffle-core` on top of a sqlx connection pool. Each [`RaffleTx`] is one
//! database transaction; row locks taken inside it (`FOR UPDATE`,
//! `FOR UPDATE SKIP LOCKED`) are what keep concurrent reservations apart.
//!
//! # Example
//!
//! ```no_run
//! use raffle_postgres::PostgresRaffleStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = PostgresRaffleStore::new("postgres://localhost/raffle").await?;
//! store.migrate().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod rows;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use raffle_core::{
    Customer, CustomerId, EngineError, NewCustomer, Raffle, RaffleId, RaffleStore, RaffleTx, Result, Sale,
    SaleId, SaleStatus, Ticket, TicketNumber, TicketStatus,
};
use rows::{CustomerRow, RaffleRow, SaleRow, TicketRow};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

const TICKET_COLUMNS: &str =
    "raffle_id, number, status, sale_id, session_id, reserved_until, sold_at";

const SALE_COLUMNS: &str = "id, raffle_id, customer_id, status, amount, currency, payment_id, \
     client_transaction_id, authorization_code, requested_numbers, ticket_numbers, created_at, \
     prepared_at, confirmed_at, last_email_sent_at, last_error, last_error_at, updated_at";

/// Map a sqlx error, turning serialization failures and deadlocks into
/// [`EngineError::ConcurrencyConflict`].
fn db_error(context: &'static str) -> impl FnOnce(sqlx::Error) -> EngineError {
    move |e| {
        let code = e
            .as_database_error()
            .and_then(|db| db.code())
            .map(|c| c.into_owned());
        match code.as_deref() {
            // serialization_failure, deadlock_detected, lock_not_available
            Some("40001" | "40P01" | "55P03") => {
                tracing::debug!(context, error = %e, "Database concurrency conflict");
                EngineError::ConcurrencyConflict
            }
            _ => EngineError::Storage(format!("Failed to {context}: {e}")),
        }
    }
}

fn numbers_param(numbers: &[TicketNumber]) -> Vec<i32> {
    numbers.iter().map(|n| i32::from(n.value())).collect()
}

fn limit_param(limit: u32) -> i64 {
    i64::from(limit)
}

/// `PostgreSQL`-backed raffle store.
#[derive(Clone, Debug)]
pub struct PostgresRaffleStore {
    pool: PgPool,
}

impl PostgresRaffleStore {
    /// Connect with default pool settings.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Storage`] if the connection fails.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| EngineError::Storage(format!("Failed to connect to database: {e}")))?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Storage`] if migrations fail.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| EngineError::Storage(format!("Migration failed: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl RaffleStore for PostgresRaffleStore {
    async fn begin(&self) -> Result<Box<dyn RaffleTx>> {
        let tx = self.pool.begin().await.map_err(db_error("begin transaction"))?;
        Ok(Box::new(PgRaffleTx { tx }))
    }
}

/// One `PostgreSQL` transaction.
pub struct PgRaffleTx {
    tx: Transaction<'static, Postgres>,
}

impl PgRaffleTx {
    async fn fetch_tickets(&mut self, sql: &str, raffle_id: RaffleId, numbers: &[TicketNumber]) -> Result<Vec<Ticket>> {
        let rows: Vec<TicketRow> = sqlx::query_as(sql)
            .bind(raffle_id.as_uuid())
            .bind(numbers_param(numbers))
            .fetch_all(&mut *self.tx)
            .await
            .map_err(db_error("load tickets"))?;
        rows.into_iter().map(Ticket::try_from).collect()
    }
}

#[async_trait]
impl RaffleTx for PgRaffleTx {
    async fn active_raffle(&mut self) -> Result<Option<Raffle>> {
        let row: Option<RaffleRow> = sqlx::query_as(
            "SELECT id, name, status, max_number, unit_price, currency, created_at, closed_at \
             FROM raffles WHERE status = 'ACTIVE' LIMIT 1",
        )
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_error("load active raffle"))?;
        row.map(Raffle::try_from).transpose()
    }

    async fn insert_raffle(&mut self, raffle: &Raffle) -> Result<()> {
        sqlx::query(
            "INSERT INTO raffles (id, name, status, max_number, unit_price, currency, created_at, closed_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(raffle.id.as_uuid())
        .bind(&raffle.name)
        .bind(raffle.status.as_str())
        .bind(i32::from(raffle.max_number))
        .bind(raffle.unit_price)
        .bind(&raffle.currency)
        .bind(raffle.created_at)
        .bind(raffle.closed_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_error("insert raffle"))?;
        Ok(())
    }

    async fn close_raffle(&mut self, raffle_id: RaffleId, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE raffles SET status = 'CLOSED', closed_at = $2 WHERE id = $1")
            .bind(raffle_id.as_uuid())
            .bind(at)
            .execute(&mut *self.tx)
            .await
            .map_err(db_error("close raffle"))?;
        Ok(())
    }

    async fn seed_missing_tickets(&mut self, raffle_id: RaffleId, max_number: u16) -> Result<u64> {
        let result = sqlx::query(
            "INSERT INTO tickets (raffle_id, number, status) \
             SELECT $1, n, 'AVAILABLE' FROM generate_series(1, $2) AS n \
             ON CONFLICT (raffle_id, number) DO NOTHING",
        )
        .bind(raffle_id.as_uuid())
        .bind(i32::from(max_number))
        .execute(&mut *self.tx)
        .await
        .map_err(db_error("seed tickets"))?;
        Ok(result.rows_affected())
    }

    async fn find_tickets(
        &mut self,
        raffle_id: RaffleId,
        numbers: &[TicketNumber],
    ) -> Result<Vec<Ticket>> {
        let sql = format!(
            "SELECT {TICKET_COLUMNS} FROM tickets \
             WHERE raffle_id = $1 AND number = ANY($2) ORDER BY number"
        );
        self.fetch_tickets(&sql, raffle_id, numbers).await
    }

    async fn lock_numbers(
        &mut self,
        raffle_id: RaffleId,
        numbers: &[TicketNumber],
    ) -> Result<Vec<Ticket>> {
        sqlx::query(
            "INSERT INTO tickets (raffle_id, number, status) \
             SELECT $1, n, 'AVAILABLE' FROM UNNEST($2::int[]) AS n \
             ON CONFLICT (raffle_id, number) DO NOTHING",
        )
        .bind(raffle_id.as_uuid())
        .bind(numbers_param(numbers))
        .execute(&mut *self.tx)
        .await
        .map_err(db_error("create missing tickets"))?;

        // Locks are taken in number order so two lockers cannot deadlock
        let sql = format!(
            "SELECT {TICKET_COLUMNS} FROM tickets \
             WHERE raffle_id = $1 AND number = ANY($2) ORDER BY number FOR UPDATE"
        );
        self.fetch_tickets(&sql, raffle_id, numbers).await
    }

    async fn claim_available(&mut self, raffle_id: RaffleId, count: u32) -> Result<Vec<Ticket>> {
        let sql = format!(
            "SELECT {TICKET_COLUMNS} FROM tickets \
             WHERE raffle_id = $1 AND status = 'AVAILABLE' \
             ORDER BY random() LIMIT $2 FOR UPDATE SKIP LOCKED"
        );
        let rows: Vec<TicketRow> = sqlx::query_as(&sql)
            .bind(raffle_id.as_uuid())
            .bind(limit_param(count))
            .fetch_all(&mut *self.tx)
            .await
            .map_err(db_error("claim available tickets"))?;
        rows.into_iter().map(Ticket::try_from).collect()
    }

    async fn count_by_status(&mut self, raffle_id: RaffleId, status: TicketStatus) -> Result<u64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM tickets WHERE raffle_id = $1 AND status = $2")
                .bind(raffle_id.as_uuid())
                .bind(status.as_str())
                .fetch_one(&mut *self.tx)
                .await
                .map_err(db_error("count tickets"))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn tickets_for_sale(
        &mut self,
        sale_id: SaleId,
        statuses: &[TicketStatus],
    ) -> Result<Vec<Ticket>> {
        let statuses: Vec<&str> = statuses.iter().map(TicketStatus::as_str).collect();
        let sql = format!(
            "SELECT {TICKET_COLUMNS} FROM tickets \
             WHERE sale_id = $1 AND status = ANY($2) ORDER BY raffle_id, number FOR UPDATE"
        );
        let rows: Vec<TicketRow> = sqlx::query_as(&sql)
            .bind(sale_id.as_uuid())
            .bind(statuses)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(db_error("load sale tickets"))?;
        rows.into_iter().map(Ticket::try_from).collect()
    }

    async fn expired_reservations(
        &mut self,
        now: DateTime<Utc>,
        exclude: &[SaleId],
        limit: u32,
    ) -> Result<Vec<Ticket>> {
        let sql = format!(
            "SELECT {TICKET_COLUMNS} FROM tickets \
             WHERE status = 'RESERVED' AND (reserved_until IS NULL OR reserved_until <= $1) \
             AND (sale_id IS NULL OR NOT (sale_id = ANY($2))) \
             ORDER BY reserved_until NULLS FIRST, number LIMIT $3 FOR UPDATE SKIP LOCKED"
        );
        let excluded: Vec<Uuid> = exclude.iter().map(|id| *id.as_uuid()).collect();
        let rows: Vec<TicketRow> = sqlx::query_as(&sql)
            .bind(now)
            .bind(excluded)
            .bind(limit_param(limit))
            .fetch_all(&mut *self.tx)
            .await
            .map_err(db_error("load expired reservations"))?;
        rows.into_iter().map(Ticket::try_from).collect()
    }

    async fn save_tickets(&mut self, tickets: &[Ticket]) -> Result<()> {
        if tickets.is_empty() {
            return Ok(());
        }
        let raffle_ids: Vec<Uuid> = tickets.iter().map(|t| *t.raffle_id.as_uuid()).collect();
        let numbers: Vec<i32> = tickets.iter().map(|t| i32::from(t.number.value())).collect();
        let statuses: Vec<&str> = tickets.iter().map(|t| t.status.as_str()).collect();
        let sale_ids: Vec<Option<Uuid>> =
            tickets.iter().map(|t| t.sale_id.map(|s| *s.as_uuid())).collect();
        let sessions: Vec<Option<String>> = tickets
            .iter()
            .map(|t| t.session_id.as_ref().map(|s| s.as_str().to_string()))
            .collect();
        let reserved_until: Vec<Option<DateTime<Utc>>> =
            tickets.iter().map(|t| t.reserved_until).collect();
        let sold_at: Vec<Option<DateTime<Utc>>> = tickets.iter().map(|t| t.sold_at).collect();

        sqlx::query(
            "INSERT INTO tickets (raffle_id, number, status, sale_id, session_id, reserved_until, sold_at) \
             SELECT * FROM UNNEST($1::uuid[], $2::int[], $3::text[], $4::uuid[], $5::text[], \
                                  $6::timestamptz[], $7::timestamptz[]) \
             ON CONFLICT (raffle_id, number) DO UPDATE SET \
                 status = EXCLUDED.status, \
                 sale_id = EXCLUDED.sale_id, \
                 session_id = EXCLUDED.session_id, \
                 reserved_until = EXCLUDED.reserved_until, \
                 sold_at = EXCLUDED.sold_at",
        )
        .bind(raffle_ids)
        .bind(numbers)
        .bind(statuses)
        .bind(sale_ids)
        .bind(sessions)
        .bind(reserved_until)
        .bind(sold_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_error("save tickets"))?;
        Ok(())
    }

    async fn insert_sale(&mut self, sale: &Sale) -> Result<()> {
        sqlx::query(
            "INSERT INTO sales (id, raffle_id, customer_id, status, amount, currency, payment_id, \
                 client_transaction_id, authorization_code, requested_numbers, ticket_numbers, \
                 created_at, prepared_at, confirmed_at, last_email_sent_at, last_error, \
                 last_error_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)",
        )
        .bind(sale.id.as_uuid())
        .bind(sale.raffle_id.as_uuid())
        .bind(sale.customer_id.as_uuid())
        .bind(sale.status.as_str())
        .bind(sale.amount)
        .bind(&sale.currency)
        .bind(&sale.payment_id)
        .bind(&sale.client_transaction_id)
        .bind(&sale.authorization_code)
        .bind(&sale.requested_numbers)
        .bind(&sale.ticket_numbers)
        .bind(sale.created_at)
        .bind(sale.prepared_at)
        .bind(sale.confirmed_at)
        .bind(sale.last_email_sent_at)
        .bind(&sale.last_error)
        .bind(sale.last_error_at)
        .bind(sale.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_error("insert sale"))?;
        Ok(())
    }

    async fn get_sale(&mut self, sale_id: SaleId, lock: bool) -> Result<Option<Sale>> {
        let suffix = if lock { " FOR UPDATE" } else { "" };
        let sql = format!("SELECT {SALE_COLUMNS} FROM sales WHERE id = $1{suffix}");
        let row: Option<SaleRow> = sqlx::query_as(&sql)
            .bind(sale_id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(db_error("load sale"))?;
        row.map(Sale::try_from).transpose()
    }

    async fn find_sale_by_client_tx(&mut self, client_transaction_id: &str) -> Result<Option<Sale>> {
        let sql = format!("SELECT {SALE_COLUMNS} FROM sales WHERE client_transaction_id = $1");
        let row: Option<SaleRow> = sqlx::query_as(&sql)
            .bind(client_transaction_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(db_error("find sale by transaction id"))?;
        row.map(Sale::try_from).transpose()
    }

    async fn update_sale(&mut self, sale: &Sale) -> Result<()> {
        let result = sqlx::query(
            "UPDATE sales SET status = $2, amount = $3, payment_id = $4, authorization_code = $5, \
                 ticket_numbers = $6, prepared_at = $7, confirmed_at = $8, last_email_sent_at = $9, \
                 last_error = $10, last_error_at = $11, updated_at = $12 \
             WHERE id = $1",
        )
        .bind(sale.id.as_uuid())
        .bind(sale.status.as_str())
        .bind(sale.amount)
        .bind(&sale.payment_id)
        .bind(&sale.authorization_code)
        .bind(&sale.ticket_numbers)
        .bind(sale.prepared_at)
        .bind(sale.confirmed_at)
        .bind(sale.last_email_sent_at)
        .bind(&sale.last_error)
        .bind(sale.last_error_at)
        .bind(sale.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_error("update sale"))?;

        if result.rows_affected() == 0 {
            return Err(EngineError::not_found("sale", sale.id));
        }
        Ok(())
    }

    async fn stale_pending_sales(
        &mut self,
        created_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Sale>> {
        let sql = format!(
            "SELECT {SALE_COLUMNS} FROM sales \
             WHERE status = 'PENDING' AND created_at < $1 ORDER BY created_at LIMIT $2"
        );
        let rows: Vec<SaleRow> = sqlx::query_as(&sql)
            .bind(created_before)
            .bind(limit_param(limit))
            .fetch_all(&mut *self.tx)
            .await
            .map_err(db_error("load stale pending sales"))?;
        rows.into_iter().map(Sale::try_from).collect()
    }

    async fn sales_by_status(&mut self, raffle_id: RaffleId, status: SaleStatus) -> Result<Vec<Sale>> {
        let sql = format!(
            "SELECT {SALE_COLUMNS} FROM sales \
             WHERE raffle_id = $1 AND status = $2 ORDER BY created_at"
        );
        let rows: Vec<SaleRow> = sqlx::query_as(&sql)
            .bind(raffle_id.as_uuid())
            .bind(status.as_str())
            .fetch_all(&mut *self.tx)
            .await
            .map_err(db_error("load sales by status"))?;
        rows.into_iter().map(Sale::try_from).collect()
    }

    async fn upsert_customer(&mut self, customer: &NewCustomer, now: DateTime<Utc>) -> Result<Customer> {
        let row: CustomerRow = sqlx::query_as(
            "INSERT INTO customers (id, id_number, full_name, email, phone, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $6) \
             ON CONFLICT (id_number) DO UPDATE SET \
                 full_name = EXCLUDED.full_name, \
                 email = EXCLUDED.email, \
                 phone = EXCLUDED.phone, \
                 updated_at = EXCLUDED.updated_at \
             RETURNING id, id_number, full_name, email, phone, created_at, updated_at",
        )
        .bind(Uuid::new_v4())
        .bind(&customer.id_number)
        .bind(&customer.full_name)
        .bind(&customer.email)
        .bind(&customer.phone)
        .bind(now)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(db_error("upsert customer"))?;
        Ok(row.into())
    }

    async fn get_customer(&mut self, customer_id: CustomerId) -> Result<Option<Customer>> {
        let row: Option<CustomerRow> = sqlx::query_as(
            "SELECT id, id_number, full_name, email, phone, created_at, updated_at \
             FROM customers WHERE id = $1",
        )
        .bind(customer_id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_error("load customer"))?;
        Ok(row.map(Customer::from))
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await.map_err(db_error("commit transaction"))
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await.map_err(db_error("roll back transaction"))
    }
}
