use anyhow::Result;
use tokio::signal;

use pusher_connector::telemetry::{init_tracing, LogFormat};
use pusher_connector::{Client, Listener, Settings};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    init_tracing(LogFormat::from_env());

    // Load configuration
    let settings = Settings::new()?;
    tracing::info!(cluster = %settings.client.cluster, "Configuration loaded");

    let client = Client::builder(settings.client.clone())
        .on_error(|e| tracing::warn!(kind = e.kind(), error = %e, "Client error"))
        .build();

    client.bind(
        "connected",
        &Listener::new(|data| tracing::info!(data = %data, "Connected")),
    );

    for name in &settings.channels {
        let channel = client.subscribe(name);
        let channel_name = name.clone();
        channel.bind(
            "pusher:subscription_succeeded",
            &Listener::new(move |_| tracing::info!(channel = %channel_name, "Subscription succeeded")),
        );
    }

    // Every inbound frame, whatever channel it belongs to
    pusher_connector::client::set_log_hook(|raw| tracing::info!(frame = %raw, "Inbound"));

    shutdown_signal().await;

    tracing::info!("Disconnecting");
    client.disconnect();

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, shutting down");
        }
    }
}
