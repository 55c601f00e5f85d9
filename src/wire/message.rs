//! Typed request and response bodies carried in [`Frame`](super::codec::Frame)
//! payloads.

use crate::store::{ProductId, Sale};
use crate::wire::payload::{PayloadError, PayloadReader, PayloadWriter};
use crate::wire::request::RequestType;

#[derive(Clone, Debug, PartialEq)]
pub enum Request {
    Login { username: String, password: String },
    Register { username: String, password: String },
    AddSale { product: String, quantity: i32, price: f64 },
    SalesQuantity { product: String, days: i32 },
    SalesVolume { product: String, days: i32 },
    SalesAveragePrice { product: String, days: i32 },
    SalesMaxPrice { product: String, days: i32 },
    Disconnect,
    EndDay,
    Shutdown,
    SimultaneousSales { first: String, second: String },
    ConsecutiveSales { threshold: i32 },
    FilterEvents { products: Vec<String>, days: i32 },
}

impl Request {
    pub fn request_type(&self) -> RequestType {
        match self {
            Self::Login { .. } => RequestType::Login,
            Self::Register { .. } => RequestType::Register,
            Self::AddSale { .. } => RequestType::AddSale,
            Self::SalesQuantity { .. } => RequestType::SalesQuantity,
            Self::SalesVolume { .. } => RequestType::SalesVolume,
            Self::SalesAveragePrice { .. } => RequestType::SalesAveragePrice,
            Self::SalesMaxPrice { .. } => RequestType::SalesMaxPrice,
            Self::Disconnect => RequestType::Disconnect,
            Self::EndDay => RequestType::EndDay,
            Self::Shutdown => RequestType::Shutdown,
            Self::SimultaneousSales { .. } => RequestType::SimultaneousSales,
            Self::ConsecutiveSales { .. } => RequestType::ConsecutiveSales,
            Self::FilterEvents { .. } => RequestType::FilterEvents,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, PayloadError> {
        let mut writer = PayloadWriter::new();
        match self {
            Self::Login { username, password } | Self::Register { username, password } => {
                writer.put_str(username)?.put_str(password)?;
            }
            Self::AddSale {
                product,
                quantity,
                price,
            } => {
                writer.put_str(product)?.put_i32(*quantity).put_f64(*price);
            }
            Self::SalesQuantity { product, days }
            | Self::SalesVolume { product, days }
            | Self::SalesAveragePrice { product, days }
            | Self::SalesMaxPrice { product, days } => {
                writer.put_str(product)?.put_i32(*days);
            }
            Self::Disconnect | Self::EndDay | Self::Shutdown => {}
            Self::SimultaneousSales { first, second } => {
                writer.put_str(first)?.put_str(second)?;
            }
            Self::ConsecutiveSales { threshold } => {
                writer.put_i32(*threshold);
            }
            Self::FilterEvents { products, days } => {
                writer.put_count(products.len());
                for product in products {
                    writer.put_str(product)?;
                }
                writer.put_i32(*days);
            }
        }
        Ok(writer.into_bytes())
    }

    /// `None` for the server-to-client types, which are never requests.
    pub fn decode(request_type: RequestType, payload: &[u8]) -> Result<Option<Self>, PayloadError> {
        let mut reader = PayloadReader::new(payload);
        let request = match request_type {
            RequestType::Login => Self::Login {
                username: reader.string()?,
                password: reader.string()?,
            },
            RequestType::Register => Self::Register {
                username: reader.string()?,
                password: reader.string()?,
            },
            RequestType::AddSale => Self::AddSale {
                product: reader.string()?,
                quantity: reader.i32()?,
                price: reader.f64()?,
            },
            RequestType::SalesQuantity => Self::SalesQuantity {
                product: reader.string()?,
                days: reader.i32()?,
            },
            RequestType::SalesVolume => Self::SalesVolume {
                product: reader.string()?,
                days: reader.i32()?,
            },
            RequestType::SalesAveragePrice => Self::SalesAveragePrice {
                product: reader.string()?,
                days: reader.i32()?,
            },
            RequestType::SalesMaxPrice => Self::SalesMaxPrice {
                product: reader.string()?,
                days: reader.i32()?,
            },
            RequestType::Disconnect => Self::Disconnect,
            RequestType::EndDay => Self::EndDay,
            RequestType::Shutdown => Self::Shutdown,
            RequestType::SimultaneousSales => Self::SimultaneousSales {
                first: reader.string()?,
                second: reader.string()?,
            },
            RequestType::ConsecutiveSales => Self::ConsecutiveSales {
                threshold: reader.i32()?,
            },
            RequestType::FilterEvents => {
                let count = reader.count()?;
                let mut products = Vec::with_capacity(count.min(reader.remaining()));
                for _ in 0..count {
                    products.push(reader.string()?);
                }
                Self::FilterEvents {
                    products,
                    days: reader.i32()?,
                }
            }
            RequestType::Error | RequestType::Confirmation => return Ok(None),
        };
        reader.finish()?;
        Ok(Some(request))
    }
}

/// Response bodies. Which variant answers which request is fixed by the
/// request type echoed in the frame.
#[derive(Clone, Debug, PartialEq)]
pub enum Response {
    Flag(bool),
    Int(i32),
    Double(f64),
    Text(String),
    /// End-of-day result.
    FlagWithText(bool, String),
    /// Consecutive-sales result: the product, if the streak was reached.
    Streak(Option<String>),
    Events(EventsPayload),
}

impl Response {
    pub fn encode(&self) -> Result<Vec<u8>, PayloadError> {
        let mut writer = PayloadWriter::new();
        match self {
            Self::Flag(value) => {
                writer.put_bool(*value);
            }
            Self::Int(value) => {
                writer.put_i32(*value);
            }
            Self::Double(value) => {
                writer.put_f64(*value);
            }
            Self::Text(message) => {
                writer.put_str(message)?;
            }
            Self::FlagWithText(value, message) => {
                writer.put_bool(*value).put_str(message)?;
            }
            Self::Streak(product) => match product {
                Some(name) => {
                    writer.put_bool(true).put_str(name)?;
                }
                None => {
                    writer.put_bool(false);
                }
            },
            Self::Events(events) => events.write_to(&mut writer)?,
        }
        Ok(writer.into_bytes())
    }

    pub fn decode_flag(payload: &[u8]) -> Result<bool, PayloadError> {
        let mut reader = PayloadReader::new(payload);
        let value = reader.bool()?;
        reader.finish()?;
        Ok(value)
    }

    pub fn decode_int(payload: &[u8]) -> Result<i32, PayloadError> {
        let mut reader = PayloadReader::new(payload);
        let value = reader.i32()?;
        reader.finish()?;
        Ok(value)
    }

    pub fn decode_double(payload: &[u8]) -> Result<f64, PayloadError> {
        let mut reader = PayloadReader::new(payload);
        let value = reader.f64()?;
        reader.finish()?;
        Ok(value)
    }

    pub fn decode_text(payload: &[u8]) -> Result<String, PayloadError> {
        let mut reader = PayloadReader::new(payload);
        let value = reader.string()?;
        reader.finish()?;
        Ok(value)
    }

    pub fn decode_flag_with_text(payload: &[u8]) -> Result<(bool, String), PayloadError> {
        let mut reader = PayloadReader::new(payload);
        let value = reader.bool()?;
        let message = reader.string()?;
        reader.finish()?;
        Ok((value, message))
    }

    pub fn decode_streak(payload: &[u8]) -> Result<Option<String>, PayloadError> {
        let mut reader = PayloadReader::new(payload);
        let product = if reader.bool()? {
            Some(reader.string()?)
        } else {
            None
        };
        reader.finish()?;
        Ok(product)
    }
}

/// Body of a FilterEvents response: names for ids the connection has not
/// seen yet, then the sales of each product that had any.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EventsPayload {
    pub dictionary_update: Vec<(ProductId, String)>,
    pub products: Vec<(ProductId, Vec<Sale>)>,
}

impl EventsPayload {
    fn write_to(&self, writer: &mut PayloadWriter) -> Result<(), PayloadError> {
        writer.put_bool(!self.dictionary_update.is_empty());
        if !self.dictionary_update.is_empty() {
            writer.put_count(self.dictionary_update.len());
            for (id, name) in &self.dictionary_update {
                writer.put_i32(*id).put_str(name)?;
            }
        }

        writer.put_count(self.products.len());
        for (id, sales) in &self.products {
            writer.put_i32(*id).put_count(sales.len());
            for sale in sales {
                writer.put_i32(sale.quantity).put_f64(sale.price);
            }
        }
        Ok(())
    }

    pub fn decode(payload: &[u8]) -> Result<Self, PayloadError> {
        let mut reader = PayloadReader::new(payload);
        let mut events = Self::default();

        if reader.bool()? {
            let count = reader.count()?;
            for _ in 0..count {
                let id = reader.i32()?;
                events.dictionary_update.push((id, reader.string()?));
            }
        }

        let product_count = reader.count()?;
        for _ in 0..product_count {
            let id = reader.i32()?;
            let sale_count = reader.count()?;
            let mut sales = Vec::with_capacity(sale_count.min(reader.remaining()));
            for _ in 0..sale_count {
                let quantity = reader.i32()?;
                sales.push(Sale::new(id, quantity, reader.f64()?));
            }
            events.products.push((id, sales));
        }
        reader.finish()?;
        Ok(events)
    }
}
