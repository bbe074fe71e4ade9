//! Domain types for the raffle ticket engine.
//!
//! Ticket numbers are stored as integers and only zero-padded to
//! [`TICKET_NUMBER_WIDTH`] digits at presentation and snapshot boundaries
//! (`Sale::requested_numbers`, `Sale::ticket_numbers`).

use crate::error::EngineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Highest ticket number any raffle may issue.
pub const MAX_TICKET_NUMBER: u16 = 9999;

/// Width of a padded ticket number (`7` becomes `"0007"`).
pub const TICKET_NUMBER_WIDTH: usize = 4;

// ============================================================================
// Identifiers
// ============================================================================

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            #[doc = concat!("Creates a new random `", stringify!($name), "`")]
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            #[doc = concat!("Create a `", stringify!($name), "` from a `Uuid`")]
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Get the inner UUID
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for a raffle generation
    RaffleId
);
uuid_id!(
    /// Unique identifier for a sale (one purchase attempt)
    SaleId
);
uuid_id!(
    /// Unique identifier for a customer record
    CustomerId
);

/// Buyer session that owns a reservation hold.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Creates a new `SessionId`
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the session id as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Ticket numbers
// ============================================================================

/// A ticket number in `[1, MAX_TICKET_NUMBER]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct TicketNumber(u16);

impl TicketNumber {
    /// Lowest ticket number
    pub const MIN: Self = Self(1);

    /// Highest ticket number
    pub const MAX: Self = Self(MAX_TICKET_NUMBER);

    /// Creates a ticket number, rejecting anything outside `[1, MAX_TICKET_NUMBER]`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Validation`] for out-of-range values.
    pub fn new(value: u32) -> Result<Self, EngineError> {
        match u16::try_from(value) {
            Ok(n) if (1..=MAX_TICKET_NUMBER).contains(&n) => Ok(Self(n)),
            _ => Err(EngineError::Validation(format!(
                "ticket number {value} is outside 1..={MAX_TICKET_NUMBER}"
            ))),
        }
    }

    /// Parses a padded (`"0042"`) or plain (`"42"`) ticket number.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Validation`] if the text is not a number in range.
    pub fn parse(text: &str) -> Result<Self, EngineError> {
        let trimmed = text.trim();
        let value: u32 = trimmed
            .parse()
            .map_err(|_| EngineError::Validation(format!("'{trimmed}' is not a ticket number")))?;
        Self::new(value)
    }

    /// Returns the numeric value
    #[must_use]
    pub const fn value(self) -> u16 {
        self.0
    }

    /// Returns the zero-padded representation used in snapshots.
    #[must_use]
    pub fn padded(self) -> String {
        format!("{:0width$}", self.0, width = TICKET_NUMBER_WIDTH)
    }
}

impl TryFrom<u16> for TicketNumber {
    type Error = EngineError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Self::new(u32::from(value))
    }
}

impl From<TicketNumber> for u16 {
    fn from(number: TicketNumber) -> Self {
        number.0
    }
}

impl fmt::Display for TicketNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:0width$}", self.0, width = TICKET_NUMBER_WIDTH)
    }
}

/// Builds a snapshot: sorted, de-duplicated, zero-padded numbers.
#[must_use]
pub fn snapshot_of(numbers: &[TicketNumber]) -> Vec<String> {
    let mut sorted = numbers.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    sorted.into_iter().map(TicketNumber::padded).collect()
}

/// Parses a stored snapshot back into ticket numbers.
///
/// # Errors
///
/// Returns [`EngineError::Validation`] if any entry is not a valid number.
pub fn parse_snapshot(snapshot: &[String]) -> Result<Vec<TicketNumber>, EngineError> {
    snapshot.iter().map(|s| TicketNumber::parse(s)).collect()
}

// ============================================================================
// Statuses
// ============================================================================

/// Raffle lifecycle status. Exactly one raffle is `Active` at a time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RaffleStatus {
    /// Currently selling
    Active,
    /// Superseded by a newer raffle
    Closed,
}

impl RaffleStatus {
    /// Database representation
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Closed => "CLOSED",
        }
    }

    /// Parse from the database representation.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Storage`] for unknown values.
    pub fn parse(s: &str) -> Result<Self, EngineError> {
        match s {
            "ACTIVE" => Ok(Self::Active),
            "CLOSED" => Ok(Self::Closed),
            _ => Err(EngineError::Storage(format!("Invalid raffle status: {s}"))),
        }
    }
}

/// Ticket status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TicketStatus {
    /// Free to be claimed
    Available,
    /// Held by a session and/or a pending sale until `reserved_until`
    Reserved,
    /// Paid for and linked to a sale
    Sold,
}

impl TicketStatus {
    /// Database representation
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "AVAILABLE",
            Self::Reserved => "RESERVED",
            Self::Sold => "SOLD",
        }
    }

    /// Parse from the database representation.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Storage`] for unknown values.
    pub fn parse(s: &str) -> Result<Self, EngineError> {
        match s {
            "AVAILABLE" => Ok(Self::Available),
            "RESERVED" => Ok(Self::Reserved),
            "SOLD" => Ok(Self::Sold),
            _ => Err(EngineError::Storage(format!("Invalid ticket status: {s}"))),
        }
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sale status. `Pending` is the only non-terminal state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SaleStatus {
    /// Reservation in flight, payment not settled
    Pending,
    /// Payment approved, tickets sold
    Paid,
    /// Canceled by buyer, gateway or admin
    Canceled,
    /// Hold lapsed before payment
    Expired,
}

impl SaleStatus {
    /// Database representation
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Paid => "PAID",
            Self::Canceled => "CANCELED",
            Self::Expired => "EXPIRED",
        }
    }

    /// Parse from the database representation.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Storage`] for unknown values.
    pub fn parse(s: &str) -> Result<Self, EngineError> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "PAID" => Ok(Self::Paid),
            "CANCELED" => Ok(Self::Canceled),
            "EXPIRED" => Ok(Self::Expired),
            _ => Err(EngineError::Storage(format!("Invalid sale status: {s}"))),
        }
    }

    /// Whether no further transition is allowed
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for SaleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Entities
// ============================================================================

/// One raffle generation. Tickets are scoped by `(raffle_id, number)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Raffle {
    /// Raffle identifier (new for every reset)
    pub id: RaffleId,
    /// Display name
    pub name: String,
    /// Lifecycle status
    pub status: RaffleStatus,
    /// Highest ticket number in this raffle
    pub max_number: u16,
    /// Price of one ticket in minor currency units
    pub unit_price: i64,
    /// ISO currency code
    pub currency: String,
    /// When the raffle was created
    pub created_at: DateTime<Utc>,
    /// When the raffle was superseded
    pub closed_at: Option<DateTime<Utc>>,
}

impl Raffle {
    /// Creates a new active raffle
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        max_number: u16,
        unit_price: i64,
        currency: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: RaffleId::new(),
            name: name.into(),
            status: RaffleStatus::Active,
            max_number,
            unit_price,
            currency: currency.into(),
            created_at,
            closed_at: None,
        }
    }

    /// Checks that every number belongs to this raffle's range.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Validation`] naming the first offending number.
    pub fn check_range(&self, numbers: &[TicketNumber]) -> Result<(), EngineError> {
        match numbers.iter().find(|n| n.value() > self.max_number) {
            Some(n) => Err(EngineError::Validation(format!(
                "ticket number {n} is above this raffle's maximum {}",
                self.max_number
            ))),
            None => Ok(()),
        }
    }
}

/// A ticket record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    /// Owning raffle
    pub raffle_id: RaffleId,
    /// Ticket number
    pub number: TicketNumber,
    /// Current status
    pub status: TicketStatus,
    /// Sale this ticket is linked to
    pub sale_id: Option<SaleId>,
    /// Session holding a reservation
    pub session_id: Option<SessionId>,
    /// Hold expiry (RESERVED only)
    pub reserved_until: Option<DateTime<Utc>>,
    /// When the ticket was sold
    pub sold_at: Option<DateTime<Utc>>,
}

impl Ticket {
    /// Creates an empty AVAILABLE ticket
    #[must_use]
    pub const fn available(raffle_id: RaffleId, number: TicketNumber) -> Self {
        Self {
            raffle_id,
            number,
            status: TicketStatus::Available,
            sale_id: None,
            session_id: None,
            reserved_until: None,
            sold_at: None,
        }
    }

    /// A RESERVED ticket whose hold has not lapsed yet.
    #[must_use]
    pub fn is_live_hold(&self, now: DateTime<Utc>) -> bool {
        self.status == TicketStatus::Reserved && self.reserved_until.is_some_and(|until| until > now)
    }

    /// A RESERVED ticket whose hold has lapsed.
    #[must_use]
    pub fn is_expired_hold(&self, now: DateTime<Utc>) -> bool {
        self.status == TicketStatus::Reserved && !self.is_live_hold(now)
    }

    /// Whether the ticket is reserved by exactly this session.
    #[must_use]
    pub fn is_reserved_by(&self, session: &SessionId) -> bool {
        self.status == TicketStatus::Reserved && self.session_id.as_ref() == Some(session)
    }

    /// Back to an empty AVAILABLE ticket.
    pub fn release(&mut self) {
        self.status = TicketStatus::Available;
        self.sale_id = None;
        self.session_id = None;
        self.reserved_until = None;
        self.sold_at = None;
    }

    /// Places a hold on the ticket.
    pub fn reserve(
        &mut self,
        session_id: Option<SessionId>,
        sale_id: Option<SaleId>,
        until: DateTime<Utc>,
    ) {
        self.status = TicketStatus::Reserved;
        self.session_id = session_id;
        self.sale_id = sale_id;
        self.reserved_until = Some(until);
        self.sold_at = None;
    }

    /// Promotes the ticket to SOLD for `sale_id`.
    pub fn sell(&mut self, sale_id: SaleId, at: DateTime<Utc>) {
        self.status = TicketStatus::Sold;
        self.sale_id = Some(sale_id);
        self.session_id = None;
        self.reserved_until = None;
        self.sold_at = Some(at);
    }
}

/// A purchase attempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sale {
    /// Sale identifier
    pub id: SaleId,
    /// Raffle the tickets belong to
    pub raffle_id: RaffleId,
    /// Buyer
    pub customer_id: CustomerId,
    /// Lifecycle status
    pub status: SaleStatus,
    /// Total in minor currency units (`ticket_count * unit_price`)
    pub amount: i64,
    /// ISO currency code
    pub currency: String,
    /// Provider payment id, set by Prepare
    pub payment_id: Option<String>,
    /// Our transaction id sent to the provider
    pub client_transaction_id: String,
    /// Provider authorization code once approved
    pub authorization_code: Option<String>,
    /// Padded numbers reserved at creation. Written once, never mutated.
    pub requested_numbers: Vec<String>,
    /// Definitive padded, sorted numbers once finalized
    pub ticket_numbers: Vec<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// When Prepare succeeded
    pub prepared_at: Option<DateTime<Utc>>,
    /// When the sale became PAID
    pub confirmed_at: Option<DateTime<Utc>>,
    /// Last successful tickets email
    pub last_email_sent_at: Option<DateTime<Utc>>,
    /// Last recorded failure
    pub last_error: Option<String>,
    /// When `last_error` was recorded
    pub last_error_at: Option<DateTime<Utc>>,
    /// Last modification
    pub updated_at: DateTime<Utc>,
}

impl Sale {
    /// Creates a PENDING sale with its immutable requested-numbers snapshot.
    ///
    /// The id is chosen by the caller so tickets can be linked to the sale in
    /// the same transaction before the sale row is written.
    #[must_use]
    pub fn pending(
        id: SaleId,
        raffle: &Raffle,
        customer_id: CustomerId,
        numbers: &[TicketNumber],
        now: DateTime<Utc>,
    ) -> Self {
        let requested_numbers = snapshot_of(numbers);
        let count = i64::try_from(requested_numbers.len()).unwrap_or(i64::MAX);
        Self {
            id,
            raffle_id: raffle.id,
            customer_id,
            status: SaleStatus::Pending,
            amount: count.saturating_mul(raffle.unit_price),
            currency: raffle.currency.clone(),
            payment_id: None,
            client_transaction_id: id.as_uuid().simple().to_string(),
            authorization_code: None,
            requested_numbers,
            ticket_numbers: Vec::new(),
            created_at: now,
            prepared_at: None,
            confirmed_at: None,
            last_email_sent_at: None,
            last_error: None,
            last_error_at: None,
            updated_at: now,
        }
    }

    /// Parses `requested_numbers`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Validation`] if the stored snapshot is corrupt.
    pub fn requested(&self) -> Result<Vec<TicketNumber>, EngineError> {
        parse_snapshot(&self.requested_numbers)
    }

    /// Records a failure on the sale for admin tooling.
    pub fn record_error(&mut self, message: impl Into<String>, now: DateTime<Utc>) {
        self.last_error = Some(message.into());
        self.last_error_at = Some(now);
        self.updated_at = now;
    }
}

/// A buyer, keyed by an external identity number.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    /// Internal identifier
    pub id: CustomerId,
    /// Unique external ID (e.g. national ID)
    pub id_number: String,
    /// Full name
    pub full_name: String,
    /// Email for ticket delivery
    pub email: String,
    /// Optional phone
    pub phone: Option<String>,
    /// First seen
    pub created_at: DateTime<Utc>,
    /// Last upsert
    pub updated_at: DateTime<Utc>,
}

/// Customer details supplied at sale creation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewCustomer {
    /// Unique external ID
    pub id_number: String,
    /// Full name
    pub full_name: String,
    /// Email for ticket delivery
    pub email: String,
    /// Optional phone
    pub phone: Option<String>,
}

impl NewCustomer {
    /// Rejects blank identity fields and malformed emails.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Validation`] describing the first problem found.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.id_number.trim().is_empty() {
            return Err(EngineError::Validation("customer id number is required".into()));
        }
        if self.full_name.trim().is_empty() {
            return Err(EngineError::Validation("customer name is required".into()));
        }
        let email = self.email.trim();
        let well_formed = email
            .split_once('@')
            .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.'));
        if !well_formed {
            return Err(EngineError::Validation(format!("'{email}' is not a valid email")));
        }
        Ok(())
    }
}
