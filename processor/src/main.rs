use common::config::Config;
use common::logger::init_logger;
use db::{MemStore, Store};
use processor::server::{Server, max_procs};
use processor::tool::{DefaultProvider, ToolProvider};
use processor::{monitor, mq};
use std::process;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    let cfg = Config::init(".env");
    init_logger(&cfg.log_level, &cfg.log_file);

    let procs = if cfg.max_procs == 0 {
        max_procs()
    } else {
        cfg.max_procs
    };
    log::info!(
        "starting {} with {} processing slots on {}",
        cfg.project_name,
        procs,
        cfg.broker_uri
    );

    let monitor = match monitor::start(&cfg.broker_uri) {
        Ok(m) => m,
        Err(e) => {
            log::error!("cannot reach broker at {}: {}", cfg.broker_uri, e);
            process::exit(1);
        }
    };

    let store: Arc<dyn Store> = Arc::new(MemStore::new());
    let provider: Arc<dyn ToolProvider> = Arc::new(DefaultProvider);
    let server = match Server::new(&cfg.broker_uri, procs, store, provider) {
        Ok(s) => s,
        Err(e) => {
            log::error!("cannot start processing server: {}", e);
            process::exit(1);
        }
    };
    let handle = server.serve();

    tokio::signal::ctrl_c()
        .await
        .expect("cannot listen for shutdown signal");
    log::info!("draining in-flight submissions");
    if let Err(e) = mq::wait_idle(&cfg.broker_uri).await {
        log::error!("idle wait failed: {}", e);
    }
    if let Err(e) = handle.shutdown().await {
        log::error!("server shutdown failed: {}", e);
    }
    if let Err(e) = mq::stop_producers() {
        log::error!("producer shutdown failed: {}", e);
    }
    if let Err(e) = monitor.shutdown().await {
        log::error!("monitor shutdown failed: {}", e);
    }
}
