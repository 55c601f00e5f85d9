use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::thread;

use serde_json::json;
use uuid::Uuid;

use crate::ledger::{LedgerError, LocalLedger, SalesLedger};
use crate::logging::{LogLevel, Logger};
use crate::pools::WorkerPool;
use crate::shutdown::ShutdownSignal;
use crate::store::ProductId;
use crate::wire::codec::CodecError;
use crate::wire::connection::TaggedConnection;
use crate::wire::message::{EventsPayload, Request, Response};
use crate::wire::request::RequestType;

/// What every connection handler shares.
pub struct RouterContext {
    pub ledger: LocalLedger,
    pub pool: Arc<WorkerPool>,
    pub shutdown: ShutdownSignal,
    pub logger: Arc<Logger>,
}

/// Per-connection state. Product ids whose names were already sent in a
/// FilterEvents response are remembered so each name travels once.
struct Session {
    connection_id: u64,
    session_id: Option<Uuid>,
    username: Option<String>,
    known_products: Arc<Mutex<HashSet<ProductId>>>,
}

impl Session {
    fn new(connection_id: u64) -> Self {
        Self {
            connection_id,
            session_id: None,
            username: None,
            known_products: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn is_authenticated(&self) -> bool {
        self.session_id.is_some()
    }

    fn authenticate(&mut self, username: &str) -> Uuid {
        let session_id = Uuid::new_v4();
        self.session_id = Some(session_id);
        self.username = Some(username.to_owned());
        session_id
    }

    fn log_payload(&self) -> serde_json::Value {
        json!({
            "connection_id": self.connection_id,
            "session_id": self.session_id.map(|id| id.to_string()),
            "username": self.username,
        })
    }
}

enum Flow {
    Continue,
    Stop,
}

/// Reads frames off one connection until it closes, a Disconnect arrives or
/// a frame cannot be parsed. Frames are read strictly one after another.
pub fn serve_connection(
    connection: Arc<TaggedConnection>,
    connection_id: u64,
    context: Arc<RouterContext>,
) {
    let mut session = Session::new(connection_id);
    loop {
        let frame = match connection.receive() {
            Ok(frame) => frame,
            Err(CodecError::ConnectionClosed) => {
                context.logger.log(
                    LogLevel::Debug,
                    Some("server::router"),
                    "Peer closed connection",
                    Some(session.log_payload()),
                );
                break;
            }
            Err(error) => {
                context.logger.log(
                    LogLevel::Warn,
                    Some("server::router"),
                    "Connection read failed; closing",
                    Some(json!({
                        "connection_id": connection_id,
                        "protocol_error": error.is_protocol_error(),
                        "error": error.to_string(),
                    })),
                );
                break;
            }
        };

        let Some(request_type) = RequestType::from_code(frame.request_type) else {
            log_ignored(&context.logger, connection_id, frame.tag, frame.request_type);
            continue;
        };
        let request = match Request::decode(request_type, &frame.payload) {
            Ok(Some(request)) => request,
            Ok(None) => {
                log_ignored(&context.logger, connection_id, frame.tag, frame.request_type);
                continue;
            }
            Err(error) => {
                context.logger.log(
                    LogLevel::Warn,
                    Some("server::router"),
                    "Malformed request payload; closing",
                    Some(json!({
                        "connection_id": connection_id,
                        "tag": frame.tag,
                        "request_type": request_type.to_string(),
                        "error": error.to_string(),
                    })),
                );
                break;
            }
        };

        if !request_type.is_public() && !session.is_authenticated() {
            reject_unauthenticated(&connection, &context.logger, frame.tag, request_type);
            continue;
        }

        match dispatch(&connection, &mut session, &context, frame.tag, request) {
            Flow::Continue => {}
            Flow::Stop => break,
        }
    }

    let _ = connection.shutdown();
    context.logger.log(
        LogLevel::Info,
        Some("server::router"),
        "Connection handler finished",
        Some(session.log_payload()),
    );
}

fn dispatch(
    connection: &Arc<TaggedConnection>,
    session: &mut Session,
    context: &RouterContext,
    tag: u32,
    request: Request,
) -> Flow {
    let request_type = request.request_type();
    let ledger = &context.ledger;
    let logger = &context.logger;

    match request {
        Request::Login { username, password } => {
            let accepted = ledger.login(&username, &password).unwrap_or(false);
            if accepted {
                session.authenticate(&username);
                logger.log(
                    LogLevel::Info,
                    Some("server::router"),
                    "Session authenticated",
                    Some(session.log_payload()),
                );
            }
            respond(connection, logger, tag, request_type, &Response::Flag(accepted));
        }
        Request::Register { username, password } => {
            let created = ledger.register(&username, &password).unwrap_or(false);
            if created {
                session.authenticate(&username);
                logger.log(
                    LogLevel::Info,
                    Some("server::router"),
                    "User registered",
                    Some(session.log_payload()),
                );
            }
            respond(connection, logger, tag, request_type, &Response::Flag(created));
        }
        Request::Disconnect => {
            let message = ledger
                .disconnect()
                .unwrap_or_else(|error| error.to_string());
            respond(connection, logger, tag, request_type, &Response::Text(message));
            return Flow::Stop;
        }
        Request::Shutdown => {
            logger.log(
                LogLevel::Info,
                Some("server::router"),
                "Shutdown requested by client",
                Some(session.log_payload()),
            );
            context.pool.shutdown();
            context.shutdown.trigger();
            let message = ledger
                .shutdown()
                .unwrap_or_else(|error| format!("Server shutdown failed: {error}"));
            respond(connection, logger, tag, request_type, &Response::Text(message));
        }
        Request::AddSale {
            product,
            quantity,
            price,
        } => {
            let ledger = ledger.clone();
            offload(connection, context, tag, request_type, move || {
                ledger
                    .add_sale(&product, quantity, price)
                    .map(Response::Flag)
            });
        }
        Request::SalesQuantity { product, days } => {
            let ledger = ledger.clone();
            offload(connection, context, tag, request_type, move || {
                ledger
                    .sales_quantity(&product, days)
                    .map(|quantity| Response::Int(saturate_i32(quantity)))
            });
        }
        Request::SalesVolume { product, days } => {
            let ledger = ledger.clone();
            offload(connection, context, tag, request_type, move || {
                ledger.sales_volume(&product, days).map(Response::Double)
            });
        }
        Request::SalesAveragePrice { product, days } => {
            let ledger = ledger.clone();
            offload(connection, context, tag, request_type, move || {
                ledger
                    .sales_average_price(&product, days)
                    .map(Response::Double)
            });
        }
        Request::SalesMaxPrice { product, days } => {
            let ledger = ledger.clone();
            offload(connection, context, tag, request_type, move || {
                ledger.sales_max_price(&product, days).map(Response::Double)
            });
        }
        Request::EndDay => {
            let ledger = ledger.clone();
            offload(connection, context, tag, request_type, move || {
                ledger
                    .end_day()
                    .map(|report| Response::FlagWithText(report.persisted, report.message))
            });
        }
        Request::FilterEvents { products, days } => {
            let ledger = ledger.clone();
            let known_products = Arc::clone(&session.known_products);
            offload(connection, context, tag, request_type, move || {
                filtered_events(&ledger, &known_products, &products, days).map(Response::Events)
            });
        }
        Request::SimultaneousSales { first, second } => {
            let ledger = ledger.clone();
            wait_in_background(connection, logger, tag, request_type, move || {
                ledger
                    .wait_simultaneous_sales(&first, &second)
                    .map(Response::Flag)
            });
        }
        Request::ConsecutiveSales { threshold } => {
            let ledger = ledger.clone();
            wait_in_background(connection, logger, tag, request_type, move || {
                ledger
                    .wait_consecutive_sales(threshold)
                    .map(Response::Streak)
            });
        }
    }
    Flow::Continue
}

/// Runs `task` on the worker pool; the response is written only if it
/// succeeds.
fn offload<F>(
    connection: &Arc<TaggedConnection>,
    context: &RouterContext,
    tag: u32,
    request_type: RequestType,
    task: F,
) where
    F: FnOnce() -> Result<Response, LedgerError> + Send + 'static,
{
    let connection = Arc::clone(connection);
    let logger = Arc::clone(&context.logger);
    let label = format!("{request_type}#{tag}");
    context.pool.submit(&label, task, move |response| {
        respond(&connection, &logger, tag, request_type, &response);
    });
}

/// Notification waits can block until the day ends, so each gets its own
/// thread instead of a pool worker.
fn wait_in_background<F>(
    connection: &Arc<TaggedConnection>,
    logger: &Arc<Logger>,
    tag: u32,
    request_type: RequestType,
    wait: F,
) where
    F: FnOnce() -> Result<Response, LedgerError> + Send + 'static,
{
    let connection = Arc::clone(connection);
    let thread_logger = Arc::clone(logger);
    let spawned = thread::Builder::new()
        .name(format!("wait-{tag}"))
        .spawn(move || match wait() {
            Ok(response) => respond(&connection, &thread_logger, tag, request_type, &response),
            Err(error) => thread_logger.log(
                LogLevel::Warn,
                Some("server::router"),
                "Notification wait failed; response skipped",
                Some(json!({"tag": tag, "error": error.to_string()})),
            ),
        });
    if let Err(error) = spawned {
        logger.log(
            LogLevel::Error,
            Some("server::router"),
            "Failed to spawn notification waiter",
            Some(json!({
                "tag": tag,
                "request_type": request_type.to_string(),
                "error": error.to_string(),
            })),
        );
    }
}

fn filtered_events(
    ledger: &LocalLedger,
    known_products: &Mutex<HashSet<ProductId>>,
    products: &[String],
    days: i32,
) -> Result<EventsPayload, LedgerError> {
    let store = ledger.store();
    let products = store.filter_events(products, days)?;

    let mut known = known_products
        .lock()
        .expect("session known products lock poisoned");
    let dictionary_update = products
        .iter()
        .filter(|(id, _)| known.insert(*id))
        .filter_map(|(id, _)| store.dictionary().name_of(*id).map(|name| (*id, name)))
        .collect();
    Ok(EventsPayload {
        dictionary_update,
        products,
    })
}

fn respond(
    connection: &TaggedConnection,
    logger: &Logger,
    tag: u32,
    request_type: RequestType,
    response: &Response,
) {
    let result = response
        .encode()
        .map_err(|error| error.to_string())
        .and_then(|payload| {
            connection
                .send_parts(tag, request_type.code(), payload)
                .map_err(|error| error.to_string())
        });
    if let Err(error) = result {
        logger.log(
            LogLevel::Warn,
            Some("server::router"),
            "Failed to write response",
            Some(json!({
                "peer_addr": connection.peer_addr().to_string(),
                "tag": tag,
                "request_type": request_type.to_string(),
                "error": error,
            })),
        );
    }
}

fn reject_unauthenticated(
    connection: &TaggedConnection,
    logger: &Logger,
    tag: u32,
    request_type: RequestType,
) {
    logger.log(
        LogLevel::Debug,
        Some("server::router"),
        "Rejected request from unauthenticated session",
        Some(json!({"tag": tag, "request_type": request_type.to_string()})),
    );
    let message = AuthRequired(request_type).to_string();
    // Echo the tag so the client's waiter for it is released.
    match Response::Text(message).encode() {
        Ok(payload) => {
            if let Err(error) = connection.send_parts(tag, RequestType::Error.code(), payload) {
                logger.warn(
                    Some("server::router"),
                    &format!("failed to write authentication error for tag {tag}: {error}"),
                );
            }
        }
        Err(error) => logger.warn(
            Some("server::router"),
            &format!("failed to encode authentication error: {error}"),
        ),
    }
}

fn log_ignored(logger: &Logger, connection_id: u64, tag: u32, request_type: u16) {
    logger.log(
        LogLevel::Warn,
        Some("server::router"),
        "Unknown request type ignored",
        Some(json!({
            "connection_id": connection_id,
            "tag": tag,
            "request_type": request_type,
        })),
    );
}

struct AuthRequired(RequestType);

impl fmt::Display for AuthRequired {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} requires an authenticated session", self.0)
    }
}

fn saturate_i32(value: i64) -> i32 {
    i32::try_from(value).unwrap_or(if value < 0 { i32::MIN } else { i32::MAX })
}
