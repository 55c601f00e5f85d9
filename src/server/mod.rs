mod router;

use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde_json::json;

use crate::config;
use crate::logging::{LogLevel, Logger};
use crate::wire::codec::{CodecError, WireCodec};
use crate::wire::connection::TaggedConnection;
use crate::wire::handshake::{build_admission_frame, Admission};

pub use router::RouterContext;

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 12345;
pub const DEFAULT_MAX_CLIENTS: usize = 100;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_clients: usize,
    pub accept_poll_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_owned(),
            port: DEFAULT_PORT,
            max_clients: DEFAULT_MAX_CLIENTS,
            accept_poll_interval: Duration::from_millis(100),
        }
    }
}

impl From<config::ServerConfig> for ServerConfig {
    fn from(value: config::ServerConfig) -> Self {
        Self {
            host: value.host,
            port: value.port,
            max_clients: value.max_clients,
            accept_poll_interval: Duration::from_millis(value.accept_poll_interval_ms),
        }
    }
}

#[derive(Debug)]
pub enum ServerError {
    Bind {
        address: String,
        source: io::Error,
    },
    SetNonBlocking {
        source: io::Error,
    },
    Accept {
        source: io::Error,
    },
    ConfigureAcceptedStream {
        peer_addr: SocketAddr,
        source: io::Error,
    },
    Admission {
        peer_addr: SocketAddr,
        source: CodecError,
    },
    SpawnHandler {
        source: io::Error,
    },
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind { address, source } => {
                write!(f, "failed to bind TCP server on {address}: {source}")
            }
            Self::SetNonBlocking { source } => {
                write!(f, "failed to set TCP server to non-blocking mode: {source}")
            }
            Self::Accept { source } => write!(f, "failed to accept TCP connection: {source}"),
            Self::ConfigureAcceptedStream { peer_addr, source } => {
                write!(f, "failed to configure accepted stream from {peer_addr}: {source}")
            }
            Self::Admission { peer_addr, source } => {
                write!(f, "failed to send admission frame to {peer_addr}: {source}")
            }
            Self::SpawnHandler { source } => {
                write!(f, "failed to spawn connection handler: {source}")
            }
        }
    }
}

impl std::error::Error for ServerError {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcceptOutcome {
    Accepted {
        connection_id: u64,
        slot: usize,
        peer_addr: SocketAddr,
    },
    /// Every slot was taken; the peer got a rejection frame and was closed.
    Rejected { peer_addr: SocketAddr },
}

struct Slot {
    connection_id: u64,
    connection: Arc<TaggedConnection>,
}

type SlotTable = Arc<Mutex<Vec<Option<Slot>>>>;

/// Frees its slot when the handler thread ends, panics included.
struct SlotRelease {
    slots: SlotTable,
    index: usize,
}

impl Drop for SlotRelease {
    fn drop(&mut self) {
        if let Ok(mut slots) = self.slots.lock() {
            slots[self.index] = None;
        }
    }
}

/// Non-blocking acceptor with a fixed table of `max_clients` connection
/// slots. Each admitted connection is served by its own handler thread.
pub struct TcpServer {
    listener: TcpListener,
    codec: WireCodec,
    accept_poll_interval: Duration,
    next_connection_id: AtomicU64,
    slots: SlotTable,
    handlers: Mutex<Vec<JoinHandle<()>>>,
}

impl TcpServer {
    pub fn bind(config: &ServerConfig, codec: WireCodec) -> Result<Self, ServerError> {
        let address = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&address).map_err(|source| ServerError::Bind {
            address,
            source,
        })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| ServerError::SetNonBlocking { source })?;

        let slots = (0..config.max_clients.max(1)).map(|_| None).collect();
        Ok(Self {
            listener,
            codec,
            accept_poll_interval: config.accept_poll_interval,
            next_connection_id: AtomicU64::new(1),
            slots: Arc::new(Mutex::new(slots)),
            handlers: Mutex::new(Vec::new()),
        })
    }

    pub fn from_app_config(app_config: &config::AppConfig) -> Result<Self, ServerError> {
        let cfg = ServerConfig::from(app_config.server.clone());
        Self::bind(&cfg, WireCodec::from_app_config(app_config))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn max_clients(&self) -> usize {
        self.lock_slots().len()
    }

    pub fn connection_count(&self) -> usize {
        self.lock_slots().iter().filter(|slot| slot.is_some()).count()
    }

    /// Takes at most one pending connection. `Ok(None)` when nobody is
    /// waiting.
    pub fn try_accept(
        &self,
        context: &Arc<RouterContext>,
    ) -> Result<Option<AcceptOutcome>, ServerError> {
        let (stream, peer_addr) = match self.listener.accept() {
            Ok(accepted) => accepted,
            Err(source) if source.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(source) => return Err(ServerError::Accept { source }),
        };
        let connection = Arc::new(
            TaggedConnection::from_stream(stream, self.codec)
                .map_err(|source| ServerError::ConfigureAcceptedStream { peer_addr, source })?,
        );
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);

        let Some(slot) = self.claim_slot(connection_id, &connection) else {
            let sent = connection.send(&build_admission_frame(Admission::Rejected));
            let _ = connection.shutdown();
            sent.map_err(|source| ServerError::Admission { peer_addr, source })?;
            return Ok(Some(AcceptOutcome::Rejected { peer_addr }));
        };
        let release = SlotRelease {
            slots: Arc::clone(&self.slots),
            index: slot,
        };

        if let Err(source) = connection.send(&build_admission_frame(Admission::Accepted)) {
            let _ = connection.shutdown();
            return Err(ServerError::Admission { peer_addr, source });
        }

        let context = Arc::clone(context);
        let handler = thread::Builder::new()
            .name(format!("conn-{connection_id}"))
            .spawn(move || {
                let _release = release;
                router::serve_connection(connection, connection_id, context);
            })
            .map_err(|source| ServerError::SpawnHandler { source })?;

        let mut handlers = self.handlers.lock().expect("connection handlers lock poisoned");
        handlers.retain(|handle| !handle.is_finished());
        handlers.push(handler);

        Ok(Some(AcceptOutcome::Accepted {
            connection_id,
            slot,
            peer_addr,
        }))
    }

    /// Accepts until the context's shutdown signal is set, sleeping
    /// `accept_poll_interval` whenever nobody is waiting.
    pub fn serve_until_shutdown(&self, context: &Arc<RouterContext>) {
        let logger = &context.logger;
        while !context.shutdown.is_triggered() {
            match self.try_accept(context) {
                Ok(Some(outcome)) => log_accept(logger, outcome, self.connection_count()),
                Ok(None) => thread::sleep(self.accept_poll_interval),
                Err(error) => {
                    logger.log(
                        LogLevel::Warn,
                        Some("server::accept"),
                        "Connection setup failed",
                        Some(json!({"error": error.to_string()})),
                    );
                }
            }
        }
    }

    /// Closes every live connection and waits for their handlers to end.
    pub fn shutdown_all_connections(&self) {
        {
            let slots = self.lock_slots();
            for slot in slots.iter().flatten() {
                let _ = slot.connection.shutdown();
            }
        }

        let handlers: Vec<JoinHandle<()>> = self
            .handlers
            .lock()
            .expect("connection handlers lock poisoned")
            .drain(..)
            .collect();
        for handler in handlers {
            let _ = handler.join();
        }
    }

    fn claim_slot(&self, connection_id: u64, connection: &Arc<TaggedConnection>) -> Option<usize> {
        let mut slots = self.lock_slots();
        let index = slots.iter().position(Option::is_none)?;
        slots[index] = Some(Slot {
            connection_id,
            connection: Arc::clone(connection),
        });
        Some(index)
    }

    /// Connection ids currently holding a slot, by slot index.
    pub fn live_connections(&self) -> Vec<(usize, u64)> {
        self.lock_slots()
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|slot| (index, slot.connection_id)))
            .collect()
    }

    fn lock_slots(&self) -> std::sync::MutexGuard<'_, Vec<Option<Slot>>> {
        self.slots.lock().expect("connection slots lock poisoned")
    }
}

fn log_accept(logger: &Logger, outcome: AcceptOutcome, live: usize) {
    match outcome {
        AcceptOutcome::Accepted {
            connection_id,
            slot,
            peer_addr,
        } => logger.log(
            LogLevel::Info,
            Some("server::accept"),
            "Accepted connection",
            Some(json!({
                "connection_id": connection_id,
                "slot": slot,
                "peer_addr": peer_addr.to_string(),
                "live_connections": live,
            })),
        ),
        AcceptOutcome::Rejected { peer_addr } => logger.log(
            LogLevel::Warn,
            Some("server::accept"),
            "Rejected connection; all slots taken",
            Some(json!({"peer_addr": peer_addr.to_string(), "live_connections": live})),
        ),
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::thread::{self, JoinHandle};
    use std::time::{Duration, Instant};

    use crate::config::AppConfig;
    use crate::ledger::{LedgerError, LocalLedger, RemoteLedger, RemoteLedgerConfig, SalesLedger};
    use crate::logging::Logger;
    use crate::pools::WorkerPool;
    use crate::shutdown::ShutdownSignal;
    use crate::storage::memory::MemoryStorage;
    use crate::store::{SalesStore, StoreSettings};
    use crate::wire::codec::{Frame, WireCodec};
    use crate::wire::connection::TaggedConnection;
    use crate::wire::message::{Request, Response};
    use crate::wire::request::RequestType;

    use super::{RouterContext, ServerConfig, TcpServer};

    struct Harness {
        address: SocketAddr,
        server: Arc<TcpServer>,
        context: Arc<RouterContext>,
        storage: Arc<MemoryStorage>,
        acceptor: Option<JoinHandle<()>>,
    }

    impl Harness {
        fn start(max_clients: usize) -> Self {
            let logger = Arc::new(Logger::silent());
            let storage = Arc::new(MemoryStorage::default());
            let store = SalesStore::open(
                StoreSettings {
                    days_in_memory: 2,
                    cache_capacity: 32,
                },
                Box::new(Arc::clone(&storage)),
                Arc::clone(&logger),
            )
            .expect("store should open");
            let context = Arc::new(RouterContext {
                ledger: LocalLedger::new(Arc::new(store)),
                pool: Arc::new(WorkerPool::new(4, Arc::clone(&logger)).expect("pool should start")),
                shutdown: ShutdownSignal::new(),
                logger,
            });
            let server = Arc::new(
                TcpServer::bind(
                    &ServerConfig {
                        host: "127.0.0.1".to_owned(),
                        port: 0,
                        max_clients,
                        accept_poll_interval: Duration::from_millis(5),
                    },
                    WireCodec::default(),
                )
                .expect("server should bind"),
            );
            let address = server.local_addr().expect("server should have address");
            let acceptor = {
                let server = Arc::clone(&server);
                let context = Arc::clone(&context);
                thread::spawn(move || server.serve_until_shutdown(&context))
            };

            Self {
                address,
                server,
                context,
                storage,
                acceptor: Some(acceptor),
            }
        }

        fn connect(&self) -> RemoteLedger {
            RemoteLedger::connect(self.address, RemoteLedgerConfig::default())
                .expect("client should connect")
        }

        fn logged_in(&self, username: &str) -> RemoteLedger {
            let client = self.connect();
            if !client.login(username, "pw").expect("login") {
                assert!(client.register(username, "pw").expect("register"));
            }
            client
        }

        fn stop(&mut self) {
            self.context.shutdown.trigger();
            if let Some(acceptor) = self.acceptor.take() {
                acceptor.join().expect("acceptor should stop");
            }
            self.server.shutdown_all_connections();
            self.context.pool.shutdown();
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.stop();
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not met within 5s");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn builds_server_from_app_config() {
        let mut app_config = AppConfig::default();
        app_config.server.host = "127.0.0.1".to_owned();
        app_config.server.port = 0;
        app_config.server.max_clients = 7;

        let server = TcpServer::from_app_config(&app_config).expect("server should build");
        let bound = server.local_addr().expect("bound address should be present");
        assert_eq!(bound.ip().to_string(), "127.0.0.1");
        assert_eq!(server.max_clients(), 7);
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn privileged_requests_need_a_login() {
        let harness = Harness::start(4);
        let client = harness.connect();

        assert!(matches!(
            client.add_sale("tea", 1, 1.0),
            Err(LedgerError::Auth(_))
        ));
        assert!(!client.login("ana", "pw").expect("login"));
        assert!(client.register("ana", "pw").expect("register"));
        assert!(!client.register("ana", "other").expect("register"));
        assert!(client.add_sale("tea", 1, 1.0).expect("sale"));
    }

    #[test]
    fn sales_and_queries_round_trip_over_the_wire() {
        let harness = Harness::start(4);
        let client = harness.logged_in("ana");

        client.add_sale("tea", 4, 8.0).expect("sale");
        client.add_sale("tea", 1, 5.0).expect("sale");
        let report = client.end_day().expect("end day");
        assert!(report.persisted);
        assert_eq!(report.message, "Day ended successfully.");
        client.add_sale("tea", 100, 100.0).expect("sale");

        assert_eq!(client.sales_quantity("tea", 1).expect("query"), 5);
        assert_eq!(client.sales_volume("tea", 1).expect("query"), 13.0);
        assert_eq!(client.sales_average_price("tea", 1).expect("query"), 2.6);
        assert_eq!(client.sales_max_price("tea", 1).expect("query"), 5.0);
        assert_eq!(client.sales_quantity("tea", 5).expect("query"), 5);
    }

    #[test]
    fn one_connection_carries_many_concurrent_requests() {
        let harness = Harness::start(4);
        let client = Arc::new(harness.logged_in("ana"));

        let sellers: Vec<_> = (0..8)
            .map(|n| {
                let client = Arc::clone(&client);
                thread::spawn(move || {
                    let product = format!("p{}", n % 2);
                    for _ in 0..25 {
                        assert!(client.add_sale(&product, 1, 2.0).expect("sale"));
                    }
                })
            })
            .collect();
        for seller in sellers {
            seller.join().expect("seller should finish");
        }
        client.end_day().expect("end day");

        assert_eq!(client.sales_quantity("p0", 1).expect("query"), 100);
        assert_eq!(client.sales_quantity("p1", 1).expect("query"), 100);
    }

    #[test]
    fn full_slot_table_rejects_until_a_slot_frees() {
        let harness = Harness::start(1);
        let first = harness.connect();

        assert!(matches!(
            RemoteLedger::connect(harness.address, RemoteLedgerConfig::default()),
            Err(LedgerError::Capacity)
        ));

        assert_eq!(
            first.disconnect().expect("disconnect"),
            "Disconnect acknowledged"
        );
        wait_until(|| harness.server.connection_count() == 0);
        let second = harness.connect();
        assert!(!second.is_closed());
    }

    #[test]
    fn waiters_are_woken_by_sales_on_other_connections() {
        let harness = Harness::start(4);
        let watcher = Arc::new(harness.logged_in("ana"));
        let seller = harness.logged_in("rui");

        let simultaneous = {
            let watcher = Arc::clone(&watcher);
            thread::spawn(move || watcher.wait_simultaneous_sales("tea", "jam"))
        };
        let consecutive = {
            let watcher = Arc::clone(&watcher);
            thread::spawn(move || watcher.wait_consecutive_sales(2))
        };
        let notifications = Arc::clone(harness.context.ledger.store().notifications());
        wait_until(|| notifications.waiting_count() == 2);

        seller.add_sale("tea", 1, 1.0).expect("sale");
        seller.add_sale("jam", 1, 1.0).expect("sale");
        seller.add_sale("jam", 1, 1.0).expect("sale");

        assert!(simultaneous
            .join()
            .expect("waiter should finish")
            .expect("wait should succeed"));
        assert_eq!(
            consecutive
                .join()
                .expect("waiter should finish")
                .expect("wait should succeed")
                .as_deref(),
            Some("jam")
        );
    }

    #[test]
    fn end_day_releases_unmet_waiters() {
        let harness = Harness::start(4);
        let watcher = Arc::new(harness.logged_in("ana"));
        let admin = harness.logged_in("rui");

        let consecutive = {
            let watcher = Arc::clone(&watcher);
            thread::spawn(move || watcher.wait_consecutive_sales(5))
        };
        let notifications = Arc::clone(harness.context.ledger.store().notifications());
        wait_until(|| notifications.waiting_count() == 1);
        admin.end_day().expect("end day");

        assert_eq!(
            consecutive
                .join()
                .expect("waiter should finish")
                .expect("wait should succeed"),
            None
        );
    }

    #[test]
    fn filter_events_sends_each_name_once_per_connection() {
        let harness = Harness::start(4);
        let client = harness.logged_in("ana");
        client.add_sale("tea", 2, 3.0).expect("sale");
        client.add_sale("jam", 1, 0.5).expect("sale");
        client.end_day().expect("end day");

        let products = vec!["tea".to_owned(), "jam".to_owned()];
        let first = client.filter_events(&products, 1).expect("filter");
        let second = client.filter_events(&products, 1).expect("filter");
        assert_eq!(first, second);
        assert_eq!(first.products.len(), 2);
        assert_eq!(first.events_of("tea")[0].quantity, 2);
        assert!(client.filter_events(&products, 0).expect("filter").is_empty());

        // A raw connection sees the name block only on its first request.
        let raw = TaggedConnection::connect(harness.address, WireCodec::default())
            .expect("raw client should connect");
        raw.receive().expect("admission should arrive");
        let login = Request::Register {
            username: "raw".to_owned(),
            password: "pw".to_owned(),
        };
        raw.send(&Frame::new(1, RequestType::Register.code(), login.encode().expect("encode")))
            .expect("register should send");
        raw.receive().expect("register response");
        let filter = Request::FilterEvents {
            products: vec!["jam".to_owned()],
            days: 1,
        }
        .encode()
        .expect("encode");
        for (tag, expect_names) in [(2, true), (3, false)] {
            raw.send(&Frame::new(tag, RequestType::FilterEvents.code(), filter.clone()))
                .expect("filter should send");
            let frame = raw.receive().expect("filter response");
            assert_eq!(frame.tag, tag);
            assert_eq!(frame.payload[0] == 1, expect_names);
        }
    }

    #[test]
    fn unknown_request_types_get_no_response() {
        let harness = Harness::start(4);
        let raw = TaggedConnection::connect(harness.address, WireCodec::default())
            .expect("raw client should connect");
        raw.receive().expect("admission should arrive");

        raw.send(&Frame::new(7, 77, vec![1, 2, 3]))
            .expect("unknown frame should send");
        let login = Request::Login {
            username: "ghost".to_owned(),
            password: "pw".to_owned(),
        };
        raw.send(&Frame::new(8, RequestType::Login.code(), login.encode().expect("encode")))
            .expect("login should send");

        let frame = raw.receive().expect("login response");
        assert_eq!(frame.tag, 8);
        assert_eq!(Response::decode_flag(&frame.payload), Ok(false));
    }

    #[test]
    fn shutdown_request_persists_and_stops_the_acceptor() {
        let mut harness = Harness::start(4);
        let client = harness.logged_in("ana");
        client.add_sale("tea", 1, 1.0).expect("sale");
        client.end_day().expect("end day");
        client.add_sale("tea", 3, 1.0).expect("sale");

        assert_eq!(
            client.shutdown().expect("shutdown"),
            "Server shutdown. Last day saved: 1"
        );
        assert!(harness.context.shutdown.is_triggered());
        if let Some(acceptor) = harness.acceptor.take() {
            acceptor.join().expect("acceptor should stop");
        }

        assert_eq!(harness.storage.stored_current_day(), 1);
        assert!(harness.storage.stored_users().contains_key("ana"));
        let open_day = harness.storage.stored_day(1).expect("open day should be saved");
        assert_eq!(open_day.sale_count(), 1);

        harness.server.shutdown_all_connections();
        wait_until(|| client.is_closed());
    }
}
