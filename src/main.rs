use std::net::SocketAddr;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use snowglobe::config::Config;
use snowglobe::logsink::LogSink;
use snowglobe::wire;

fn main() -> ExitCode {
    let config = Config::parse();
    if let Err(e) = config.validate() {
        eprintln!("configuration error: {e}");
        return ExitCode::from(2);
    }

    let logs = LogSink::default();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.log_level.clone()))
        .with(tracing_subscriber::fmt::layer())
        .with(logs.layer())
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!("cannot start runtime: {e}");
            return ExitCode::from(1);
        }
    };
    runtime.block_on(run(config, logs))
}

async fn run(config: Config, logs: LogSink) -> ExitCode {
    let state = match wire::build_state(&config, logs).await {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("startup failed: {e}");
            return ExitCode::from(1);
        }
    };
    let app = wire::router(state.clone());

    let tls_config = if config.enable_https {
        let (cert, key) = (
            config.cert_path.clone().unwrap_or_default(),
            config.key_path.clone().unwrap_or_default(),
        );
        match axum_server::tls_rustls::RustlsConfig::from_pem_file(&cert, &key).await {
            Ok(tls) => Some(tls),
            Err(e) => {
                tracing::error!("cannot load certificate from {}: {e}", cert.display());
                return ExitCode::from(3);
            }
        }
    } else {
        None
    };

    let handle = axum_server::Handle::new();
    let plain_addr: SocketAddr = match format!("{}:{}", config.host, config.port).parse() {
        Ok(a) => a,
        Err(e) => {
            tracing::error!("invalid bind address: {e}");
            return ExitCode::from(2);
        }
    };

    let plain = axum_server::bind(plain_addr)
        .handle(handle.clone())
        .serve(app.clone().into_make_service());
    tracing::info!("listening on http://{plain_addr}");

    let secure = tls_config.map(|tls| {
        let addr: SocketAddr = format!("{}:{}", config.host, config.https_port)
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], config.https_port)));
        tracing::info!("listening on https://{addr}");
        axum_server::bind_rustls(addr, tls)
            .handle(handle.clone())
            .serve(app.into_make_service())
    });

    // Signal watcher: a termination signal stops accepting connections and
    // drains in-flight requests up to the grace deadline, after which the
    // server futures below resolve.
    tokio::spawn({
        let handle = handle.clone();
        let grace = config.shutdown_grace_seconds;
        async move {
            wait_for_signal().await;
            tracing::info!("shutting down, draining in-flight requests (grace {grace}s)");
            handle.graceful_shutdown(Some(Duration::from_secs(grace)));
        }
    });
    tokio::spawn(session_sweeper(
        state.clone(),
        config.session_idle_timeout_seconds,
    ));

    let result = match secure {
        Some(secure) => tokio::try_join!(plain, secure).map(|_| ()),
        None => plain.await,
    };

    // Final catalog snapshot before exit.
    if let Err(e) = state.dispatcher.catalog.read().await.flush() {
        tracing::error!("final catalog persist failed: {e}");
    }

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("server error: {e}");
            ExitCode::from(1)
        }
    }
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!("cannot install SIGTERM handler: {e}");
                let _ = ctrl_c.await;
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

/// Periodically close idle sessions; never resolves.
async fn session_sweeper(state: wire::AppState, idle_seconds: u64) {
    if idle_seconds == 0 {
        std::future::pending::<()>().await;
    }
    let mut tick = tokio::time::interval(Duration::from_secs(idle_seconds.clamp(1, 60)));
    loop {
        tick.tick().await;
        let closed = state.sessions.expire_idle(idle_seconds);
        if closed > 0 {
            tracing::info!("closed {closed} idle sessions");
        }
    }
}
