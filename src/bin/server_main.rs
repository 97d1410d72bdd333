use llmrelay::{config, logger, metrics, server, store, tasks};

#[tokio::main]
async fn main() {
    // Log panics before they take the process down.
    std::panic::set_hook(Box::new(|panic_info| {
        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "Unknown panic payload".to_string()
        };
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "Unknown location".to_string());
        eprintln!("FATAL PANIC: {} at {}", message, location);
    }));

    let bootstrap = config::bootstrap();

    if let Err(e) = store::init() {
        eprintln!("Failed to initialize store: {}", e);
        std::process::exit(1);
    }
    logger::init(
        logger::LogLevel::from_str(&bootstrap.log_level).unwrap_or(logger::LogLevel::Info),
    );
    logger::info("app", "Starting llmrelay");

    // Routing state must be warm before the listener accepts requests.
    if let Err(e) = tasks::warm_cache() {
        logger::error("app", &format!("Cache warmup failed: {}", e));
        std::process::exit(1);
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    metrics::init(shutdown_rx.clone());
    tasks::spawn_all(shutdown_rx.clone());

    // Ctrl-C flips the shutdown signal; loops exit within one iteration and
    // the metrics writer drains.
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            logger::info("app", "Shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    if let Err(e) = server::serve(&bootstrap.bind_addr, shutdown_rx).await {
        logger::error("app", &format!("Server error: {}", e));
        std::process::exit(1);
    }

    // Give the metrics writer a moment to drain its queue.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    logger::info("app", "Stopped");
}
