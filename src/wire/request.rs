use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestType {
    Login,
    Register,
    AddSale,
    SalesQuantity,
    SalesVolume,
    SalesAveragePrice,
    SalesMaxPrice,
    Disconnect,
    EndDay,
    Shutdown,
    SimultaneousSales,
    ConsecutiveSales,
    FilterEvents,
    /// Server-to-client only: rejection of a request the router refused.
    Error,
    /// Server-to-client only: admission handshake.
    Confirmation,
}

impl RequestType {
    pub const ALL: [RequestType; 15] = [
        Self::Login,
        Self::Register,
        Self::AddSale,
        Self::SalesQuantity,
        Self::SalesVolume,
        Self::SalesAveragePrice,
        Self::SalesMaxPrice,
        Self::Disconnect,
        Self::EndDay,
        Self::Shutdown,
        Self::SimultaneousSales,
        Self::ConsecutiveSales,
        Self::FilterEvents,
        Self::Error,
        Self::Confirmation,
    ];

    pub fn code(self) -> u16 {
        match self {
            Self::Login => 0,
            Self::Register => 1,
            Self::AddSale => 2,
            Self::SalesQuantity => 3,
            Self::SalesVolume => 4,
            Self::SalesAveragePrice => 5,
            Self::SalesMaxPrice => 6,
            Self::Disconnect => 7,
            Self::EndDay => 8,
            Self::Shutdown => 9,
            Self::SimultaneousSales => 10,
            Self::ConsecutiveSales => 11,
            Self::FilterEvents => 12,
            Self::Error => 98,
            Self::Confirmation => 99,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.code() == code)
    }

    /// Operations allowed before the connection has logged in.
    pub fn is_public(self) -> bool {
        matches!(self, Self::Login | Self::Register | Self::Disconnect)
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}
