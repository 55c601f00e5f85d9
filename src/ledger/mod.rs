mod local;
mod remote;

use std::fmt;
use std::io;

use crate::wire::codec::CodecError;
use crate::wire::handshake::HandshakeError;
use crate::wire::mux::MuxError;
use crate::wire::payload::PayloadError;

pub use local::LocalLedger;
pub use remote::{RemoteLedger, RemoteLedgerConfig};

/// Client-visible failures of a ledger operation.
#[derive(Debug)]
pub enum LedgerError {
    /// Malformed frame or payload.
    Protocol(String),
    /// Transport failure, including a connection closed mid-request.
    Io(String),
    /// A privileged operation was refused because the session has not
    /// logged in.
    Auth(String),
    /// The server rejected the connection because every slot was taken.
    Capacity,
    Server(String),
    TimedOut { tag: u32, after_ms: u128 },
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol(message) => write!(f, "protocol error: {message}"),
            Self::Io(message) => write!(f, "io error: {message}"),
            Self::Auth(message) => write!(f, "authentication required: {message}"),
            Self::Capacity => write!(f, "server is full, connection rejected"),
            Self::Server(message) => write!(f, "server error: {message}"),
            Self::TimedOut { tag, after_ms } => {
                write!(f, "request {tag} timed out after {after_ms} ms")
            }
        }
    }
}

impl std::error::Error for LedgerError {}

impl From<io::Error> for LedgerError {
    fn from(value: io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<PayloadError> for LedgerError {
    fn from(value: PayloadError) -> Self {
        Self::Protocol(value.to_string())
    }
}

impl From<CodecError> for LedgerError {
    fn from(value: CodecError) -> Self {
        if value.is_protocol_error() {
            Self::Protocol(value.to_string())
        } else {
            Self::Io(value.to_string())
        }
    }
}

impl From<HandshakeError> for LedgerError {
    fn from(value: HandshakeError) -> Self {
        match value {
            HandshakeError::Codec(source) => source.into(),
            other => Self::Protocol(other.to_string()),
        }
    }
}

impl From<MuxError> for LedgerError {
    fn from(value: MuxError) -> Self {
        match value {
            MuxError::TimedOut { tag, after } => Self::TimedOut {
                tag,
                after_ms: after.as_millis(),
            },
            MuxError::Codec(source) => source.into(),
            other => Self::Io(other.to_string()),
        }
    }
}

/// Result of closing the day. `persisted` is false when the rotation
/// happened in memory but could not be written.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndDayReport {
    pub persisted: bool,
    pub message: String,
}

impl EndDayReport {
    pub fn new(persisted: bool) -> Self {
        let message = if persisted {
            "Day ended successfully."
        } else {
            "Failed to end day."
        };
        Self {
            persisted,
            message: message.to_owned(),
        }
    }
}

/// One sale as reported by a FilterEvents query.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SaleEvent {
    pub quantity: i32,
    pub price: f64,
}

/// Sales of each requested product on one closed day, in request order.
/// Products without sales that day are left out.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FilteredEvents {
    pub products: Vec<(String, Vec<SaleEvent>)>,
}

impl FilteredEvents {
    pub fn events_of(&self, product: &str) -> &[SaleEvent] {
        self.products
            .iter()
            .find(|(name, _)| name == product)
            .map(|(_, events)| events.as_slice())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }
}

/// The ledger operations, implemented in-process by [`LocalLedger`] and
/// over a multiplexed connection by [`RemoteLedger`].
pub trait SalesLedger: Send + Sync {
    /// `false` for unknown users or wrong passwords.
    fn login(&self, username: &str, password: &str) -> Result<bool, LedgerError>;

    /// `false` if the username is taken.
    fn register(&self, username: &str, password: &str) -> Result<bool, LedgerError>;

    fn add_sale(&self, product: &str, quantity: i32, price: f64) -> Result<bool, LedgerError>;

    /// Units sold over the `days` closed days before the current one.
    fn sales_quantity(&self, product: &str, days: i32) -> Result<i64, LedgerError>;

    fn sales_volume(&self, product: &str, days: i32) -> Result<f64, LedgerError>;

    fn sales_average_price(&self, product: &str, days: i32) -> Result<f64, LedgerError>;

    fn sales_max_price(&self, product: &str, days: i32) -> Result<f64, LedgerError>;

    fn end_day(&self) -> Result<EndDayReport, LedgerError>;

    /// Blocks until both products sold in the current day (`true`) or the
    /// day ends (`false`).
    fn wait_simultaneous_sales(&self, first: &str, second: &str) -> Result<bool, LedgerError>;

    /// Blocks until some product sold `threshold` times in a row and returns
    /// its name, or `None` when the day ends first.
    fn wait_consecutive_sales(&self, threshold: i32) -> Result<Option<String>, LedgerError>;

    /// Sales of `products` on the closed day `days` ago.
    fn filter_events(&self, products: &[String], days: i32) -> Result<FilteredEvents, LedgerError>;

    /// Persists everything and returns the acknowledgement message.
    fn shutdown(&self) -> Result<String, LedgerError>;

    fn disconnect(&self) -> Result<String, LedgerError>;
}

pub const DISCONNECT_ACK: &str = "Disconnect acknowledged";

pub fn shutdown_ack(last_day: i32) -> String {
    format!("Server shutdown. Last day saved: {last_day}")
}
