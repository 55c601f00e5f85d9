use std::collections::HashMap;
use std::net::ToSocketAddrs;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::store::ProductId;
use crate::wire::codec::{Frame, WireCodec};
use crate::wire::connection::TaggedConnection;
use crate::wire::handshake::{evaluate_admission_frame, Admission};
use crate::wire::message::{EventsPayload, Request, Response};
use crate::wire::mux::Multiplexer;
use crate::wire::request::RequestType;

use super::{EndDayReport, FilteredEvents, LedgerError, SaleEvent, SalesLedger};

#[derive(Clone, Copy, Debug, Default)]
pub struct RemoteLedgerConfig {
    pub codec: WireCodec,
    /// Per-request limit. `None` waits for as long as the connection lives,
    /// which is what the blocking notification calls usually want.
    pub request_timeout: Option<Duration>,
}

/// Client side of the ledger: every call is one tagged request on a shared
/// multiplexed connection, so any number of threads may call concurrently.
pub struct RemoteLedger {
    mux: Multiplexer,
    next_tag: AtomicU32,
    request_timeout: Option<Duration>,
    /// Product names learned from FilterEvents responses.
    names: Mutex<HashMap<ProductId, String>>,
}

impl RemoteLedger {
    /// Connects and waits for the admission frame. A full server yields
    /// [`LedgerError::Capacity`].
    pub fn connect<A: ToSocketAddrs>(
        address: A,
        config: RemoteLedgerConfig,
    ) -> Result<Self, LedgerError> {
        let connection = TaggedConnection::connect(address, config.codec)?;
        let admission = evaluate_admission_frame(&connection.receive()?)?;
        if admission == Admission::Rejected {
            let _ = connection.shutdown();
            return Err(LedgerError::Capacity);
        }

        let mux = Multiplexer::new(connection);
        mux.start()?;
        Ok(Self {
            mux,
            next_tag: AtomicU32::new(1),
            request_timeout: config.request_timeout,
            names: Mutex::new(HashMap::new()),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.mux.is_closed()
    }

    /// Drops the connection without telling the server.
    pub fn close(&self) {
        self.mux.close();
    }

    fn call(&self, request: &Request) -> Result<Frame, LedgerError> {
        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
        let request_type = request.request_type();
        self.mux.send(tag, request_type.code(), request.encode()?)?;

        let frame = match self.request_timeout {
            Some(timeout) => self.mux.receive_timeout(tag, timeout)?,
            None => self.mux.receive(tag)?,
        };
        if frame.request_type == RequestType::Error.code() {
            return Err(LedgerError::Auth(Response::decode_text(&frame.payload)?));
        }
        if frame.request_type != request_type.code() {
            return Err(LedgerError::Protocol(format!(
                "response to {request_type} request {tag} came back as type {}",
                frame.request_type
            )));
        }
        Ok(frame)
    }

    fn call_flag(&self, request: &Request) -> Result<bool, LedgerError> {
        Ok(Response::decode_flag(&self.call(request)?.payload)?)
    }

    fn call_double(&self, request: &Request) -> Result<f64, LedgerError> {
        Ok(Response::decode_double(&self.call(request)?.payload)?)
    }

    fn call_text(&self, request: &Request) -> Result<String, LedgerError> {
        Ok(Response::decode_text(&self.call(request)?.payload)?)
    }
}

impl SalesLedger for RemoteLedger {
    fn login(&self, username: &str, password: &str) -> Result<bool, LedgerError> {
        self.call_flag(&Request::Login {
            username: username.to_owned(),
            password: password.to_owned(),
        })
    }

    fn register(&self, username: &str, password: &str) -> Result<bool, LedgerError> {
        self.call_flag(&Request::Register {
            username: username.to_owned(),
            password: password.to_owned(),
        })
    }

    fn add_sale(&self, product: &str, quantity: i32, price: f64) -> Result<bool, LedgerError> {
        self.call_flag(&Request::AddSale {
            product: product.to_owned(),
            quantity,
            price,
        })
    }

    fn sales_quantity(&self, product: &str, days: i32) -> Result<i64, LedgerError> {
        let frame = self.call(&Request::SalesQuantity {
            product: product.to_owned(),
            days,
        })?;
        Ok(i64::from(Response::decode_int(&frame.payload)?))
    }

    fn sales_volume(&self, product: &str, days: i32) -> Result<f64, LedgerError> {
        self.call_double(&Request::SalesVolume {
            product: product.to_owned(),
            days,
        })
    }

    fn sales_average_price(&self, product: &str, days: i32) -> Result<f64, LedgerError> {
        self.call_double(&Request::SalesAveragePrice {
            product: product.to_owned(),
            days,
        })
    }

    fn sales_max_price(&self, product: &str, days: i32) -> Result<f64, LedgerError> {
        self.call_double(&Request::SalesMaxPrice {
            product: product.to_owned(),
            days,
        })
    }

    fn end_day(&self) -> Result<EndDayReport, LedgerError> {
        let frame = self.call(&Request::EndDay)?;
        let (persisted, message) = Response::decode_flag_with_text(&frame.payload)?;
        Ok(EndDayReport { persisted, message })
    }

    fn wait_simultaneous_sales(&self, first: &str, second: &str) -> Result<bool, LedgerError> {
        self.call_flag(&Request::SimultaneousSales {
            first: first.to_owned(),
            second: second.to_owned(),
        })
    }

    fn wait_consecutive_sales(&self, threshold: i32) -> Result<Option<String>, LedgerError> {
        let frame = self.call(&Request::ConsecutiveSales { threshold })?;
        Ok(Response::decode_streak(&frame.payload)?)
    }

    fn filter_events(&self, products: &[String], days: i32) -> Result<FilteredEvents, LedgerError> {
        let frame = self.call(&Request::FilterEvents {
            products: products.to_vec(),
            days,
        })?;
        let payload = EventsPayload::decode(&frame.payload)?;

        let mut names = self.names.lock().expect("remote ledger names lock poisoned");
        names.extend(payload.dictionary_update);
        let mut events = FilteredEvents::default();
        for (id, sales) in payload.products {
            let name = names.get(&id).cloned().ok_or_else(|| {
                LedgerError::Protocol(format!("events for product id {id} arrived without a name"))
            })?;
            let sales = sales
                .into_iter()
                .map(|sale| SaleEvent {
                    quantity: sale.quantity,
                    price: sale.price,
                })
                .collect();
            events.products.push((name, sales));
        }
        Ok(events)
    }

    fn shutdown(&self) -> Result<String, LedgerError> {
        self.call_text(&Request::Shutdown)
    }

    /// Asks the server to drop the session, then closes the connection
    /// whatever the outcome.
    fn disconnect(&self) -> Result<String, LedgerError> {
        let acknowledgement = self.call_text(&Request::Disconnect);
        self.mux.close();
        acknowledgement
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::thread;
    use std::time::Duration;

    use crate::ledger::{LedgerError, SalesLedger};
    use crate::wire::codec::{Frame, WireCodec};
    use crate::wire::connection::TaggedConnection;
    use crate::wire::handshake::{build_admission_frame, Admission};
    use crate::wire::message::Response;
    use crate::wire::request::RequestType;

    use super::{RemoteLedger, RemoteLedgerConfig};

    /// Accepts one client, sends `admission`, then hands each request frame
    /// to `reply` and writes back whatever it returns.
    fn scripted_server<F>(admission: Admission, reply: F) -> std::net::SocketAddr
    where
        F: Fn(Frame) -> Option<Frame> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").expect("listener should bind");
        let address = listener.local_addr().expect("listener should have address");
        thread::spawn(move || {
            let (stream, _) = listener.accept().expect("client should connect");
            let connection =
                TaggedConnection::from_stream(stream, WireCodec::default()).expect("wrap stream");
            connection
                .send(&build_admission_frame(admission))
                .expect("admission should send");
            while let Ok(frame) = connection.receive() {
                if let Some(response) = reply(frame) {
                    if connection.send(&response).is_err() {
                        break;
                    }
                }
            }
        });
        address
    }

    #[test]
    fn rejected_admission_is_a_capacity_error() {
        let address = scripted_server(Admission::Rejected, |_| None);

        let result = RemoteLedger::connect(address, RemoteLedgerConfig::default());
        assert!(matches!(result, Err(LedgerError::Capacity)));
    }

    #[test]
    fn error_frame_maps_to_auth_error() {
        let address = scripted_server(Admission::Accepted, |frame| {
            let payload = Response::Text("login first".to_owned())
                .encode()
                .expect("text should encode");
            Some(Frame::new(frame.tag, RequestType::Error.code(), payload))
        });
        let ledger =
            RemoteLedger::connect(address, RemoteLedgerConfig::default()).expect("connect");

        match ledger.add_sale("tea", 1, 1.0) {
            Err(LedgerError::Auth(message)) => assert_eq!(message, "login first"),
            other => panic!("expected auth error, got {other:?}"),
        }
    }

    #[test]
    fn unanswered_request_times_out() {
        let address = scripted_server(Admission::Accepted, |_| None);
        let ledger = RemoteLedger::connect(
            address,
            RemoteLedgerConfig {
                codec: WireCodec::default(),
                request_timeout: Some(Duration::from_millis(50)),
            },
        )
        .expect("connect");

        assert!(matches!(
            ledger.sales_quantity("tea", 1),
            Err(LedgerError::TimedOut { .. })
        ));
        assert!(!ledger.is_closed());
    }

    #[test]
    fn server_going_away_fails_pending_calls() {
        let address = scripted_server(Admission::Accepted, |_| None);
        let ledger = std::sync::Arc::new(
            RemoteLedger::connect(address, RemoteLedgerConfig::default()).expect("connect"),
        );
        let caller = {
            let ledger = std::sync::Arc::clone(&ledger);
            thread::spawn(move || ledger.wait_consecutive_sales(2))
        };
        thread::sleep(Duration::from_millis(30));
        ledger.close();

        assert!(matches!(
            caller.join().expect("caller should finish"),
            Err(LedgerError::Io(_))
        ));
    }
}
