use std::process;
use std::sync::Arc;

use serde_json::json;

use salesledger::config::AppConfig;
use salesledger::ledger::LocalLedger;
use salesledger::logging::{LogLevel, Logger, LoggerConfig};
use salesledger::pools::WorkerPool;
use salesledger::server::{RouterContext, TcpServer};
use salesledger::shutdown::{ShutdownHooks, ShutdownSignal};
use salesledger::storage::StorageFacade;
use salesledger::store::{SalesStore, StoreSettings};
use salesledger::utils::runtime::ensure_posix_or_exit;
use salesledger::utils::startup_banner::print_startup_banner;

fn main() {
    ensure_posix_or_exit();
    print_startup_banner();

    let app_config = load_config_or_exit();
    let log_level =
        LogLevel::from_config_value(&app_config.logging.level).unwrap_or_else(|| {
            eprintln!(
                "invalid logging.level '{}'. Allowed values: error, warn, info, debug, verbose",
                app_config.logging.level
            );
            process::exit(2);
        });
    let logger = Arc::new(Logger::new(LoggerConfig {
        min_level: log_level,
        human_friendly: app_config.logging.human_friendly,
    }));

    let storage = StorageFacade::initialize(&app_config, &logger).unwrap_or_else(|error| {
        eprintln!("storage initialization error: {error}");
        process::exit(2);
    });
    let store = SalesStore::open(
        StoreSettings::from(&app_config.store),
        Box::new(storage),
        Arc::clone(&logger),
    )
    .unwrap_or_else(|error| {
        eprintln!("failed to load persisted state: {error}");
        process::exit(2);
    });
    let ledger = LocalLedger::new(Arc::new(store));

    let pool = WorkerPool::new(app_config.workers.pool_size, Arc::clone(&logger))
        .unwrap_or_else(|error| {
            eprintln!("worker pool startup error: {error}");
            process::exit(2);
        });
    logger.log(
        LogLevel::Info,
        Some("main::pools"),
        "Worker pool started",
        Some(json!({"workers": pool.size()})),
    );

    let server = TcpServer::from_app_config(&app_config).unwrap_or_else(|error| {
        eprintln!("server startup error: {error}");
        process::exit(2);
    });
    let bound_addr = server.local_addr().unwrap_or_else(|error| {
        eprintln!("server startup error: failed to read local address: {error}");
        process::exit(2);
    });
    logger.log(
        LogLevel::Info,
        Some("main::server"),
        &format!(
            "{} v{} listening",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        ),
        Some(json!({
            "bind_address": bound_addr.to_string(),
            "max_clients": server.max_clients(),
            "max_payload_size_bytes": app_config.wire.max_payload_size_bytes,
            "current_day": ledger.store().current_day(),
        })),
    );

    let shutdown_hooks = ShutdownHooks::install(ShutdownSignal::new()).unwrap_or_else(|error| {
        eprintln!("failed to install shutdown hooks: {error}");
        process::exit(2);
    });
    logger.info(
        Some("main::shutdown"),
        "Shutdown hooks installed for SIGINT/SIGTERM",
    );

    let context = Arc::new(RouterContext {
        ledger,
        pool: Arc::new(pool),
        shutdown: shutdown_hooks.signal().clone(),
        logger: Arc::clone(&logger),
    });
    server.serve_until_shutdown(&context);

    logger.info(
        Some("main::shutdown"),
        "Shutdown signal received, starting graceful shutdown",
    );
    context.pool.shutdown();
    match context.ledger.store().shutdown() {
        Ok(last_day) => logger.log(
            LogLevel::Info,
            Some("main::shutdown"),
            "State persisted",
            Some(json!({"last_day": last_day})),
        ),
        Err(error) => logger.log(
            LogLevel::Error,
            Some("main::shutdown"),
            "State could not be fully persisted",
            Some(json!({"error": error.to_string()})),
        ),
    }
    server.shutdown_all_connections();

    drop(server);
    logger.info(
        Some("main::shutdown"),
        "TCP server stopped and shutdown completed",
    );
}

fn load_config_or_exit() -> AppConfig {
    match AppConfig::load_with_discovery(std::env::args().skip(1)) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("configuration error: {error}");
            process::exit(2);
        }
    }
}
