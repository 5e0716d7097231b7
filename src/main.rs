use std::{future::IntoFuture, process, sync::Arc, time::Duration};

use cachet::{
    application::{error::AppError, proxy::CacheProxy},
    cache::{CacheConfig, PolicyConfig},
    config,
    infra::{error::InfraError, http, origin::ReqwestOrigin, telemetry},
};
use tokio::{signal, sync::watch, try_join};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::CheckConfig(_) => {
            info!(target: "cachet::config", "Configuration is valid");
            println!("{settings:#?}");
            Ok(())
        }
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let origin = ReqwestOrigin::new(&settings.origin)?;
    info!(
        target: "cachet::serve",
        origin = %origin.base(),
        proxy_addr = %settings.server.addr,
        admin_addr = %settings.server.admin_addr,
        "Starting cachet"
    );

    let (proxy, refresh_worker) = CacheProxy::new(
        &PolicyConfig::from(&settings.policy),
        &CacheConfig::from(&settings.cache),
        settings.server.max_request_body_bytes.get(),
        Arc::new(origin),
    );
    let proxy = Arc::new(proxy);

    let refresh_handle = tokio::spawn(refresh_worker.run());

    let sweeper = Arc::clone(&proxy);
    let sweep_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweeper.sweep_interval());
        interval.tick().await; // Skip the first immediate tick
        loop {
            interval.tick().await;
            let purged = sweeper.sweep();
            if purged > 0 {
                info!(target: "cachet::sweeper", purged, "Purged expired entries");
            }
        }
    });

    let result = serve_http(&settings, proxy).await;

    sweep_handle.abort();
    let _ = sweep_handle.await;
    refresh_handle.abort();
    let _ = refresh_handle.await;

    result
}

async fn serve_http(settings: &config::Settings, proxy: Arc<CacheProxy>) -> Result<(), AppError> {
    let proxy_router = http::build_proxy_router(Arc::clone(&proxy));
    let admin_router = http::build_admin_router(proxy);

    let proxy_listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    let admin_listener = tokio::net::TcpListener::bind(settings.server.admin_addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!(target: "cachet::serve", "Shutdown signal received");
                let _ = shutdown_tx.send(true);
            }
            Err(err) => {
                warn!(target: "cachet::serve", error = %err, "Cannot listen for shutdown signal");
                // Keep the sender alive so the servers never see a shutdown.
                std::future::pending::<()>().await;
            }
        }
    });

    let proxy_server = axum::serve(proxy_listener, proxy_router.into_make_service())
        .with_graceful_shutdown(shutdown_requested(shutdown_rx.clone()))
        .into_future();
    let admin_server = axum::serve(admin_listener, admin_router.into_make_service())
        .with_graceful_shutdown(shutdown_requested(shutdown_rx.clone()))
        .into_future();

    let drain_deadline = drain_deadline(shutdown_rx, settings.server.graceful_shutdown);

    tokio::select! {
        result = async move { try_join!(proxy_server, admin_server) } => {
            result.map_err(|err| AppError::unexpected(format!("server error: {err}")))?;
        }
        () = drain_deadline => {
            warn!(target: "cachet::serve", "Graceful shutdown timed out, closing open connections");
        }
    }

    info!(target: "cachet::serve", "Stopped");
    Ok(())
}

async fn shutdown_requested(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn drain_deadline(shutdown: watch::Receiver<bool>, grace: Duration) {
    shutdown_requested(shutdown).await;
    tokio::time::sleep(grace).await;
}
