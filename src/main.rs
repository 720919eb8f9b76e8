use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use wsphone::config::Config;
use wsphone::domain::RegistrationState;
use wsphone::infrastructure::protocols::sip::WsConnector;
use wsphone::infrastructure::protocols::webrtc::WebRtcMediaFactory;
use wsphone::PhoneEngine;

/// Usage: `wsphone [config.toml] [number-to-call]`
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting WsPhone {}", env!("CARGO_PKG_VERSION"));

    let mut args = std::env::args().skip(1);
    let config_path = args.next();
    let dial = args.next();

    // Load configuration
    let config = Config::load(config_path.as_deref())?;
    config.account.validate()?;
    info!(
        "Account {}@{} via {}",
        config.account.sip_username(),
        config.account.effective_realm(),
        config.account.effective_ws_url()
    );

    let connector = Arc::new(WsConnector::new(
        config.engine.connect_timeout(),
        config.engine.ws_ping_interval(),
    ));
    let engine = PhoneEngine::spawn(
        connector,
        Arc::new(WebRtcMediaFactory::new()),
        config.engine.clone(),
    );

    // Print every event as one JSON line
    let mut events = engine.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => println!("{}", json),
                    Err(e) => warn!("Failed to serialize event: {}", e),
                },
                Err(RecvError::Lagged(skipped)) => warn!("Skipped {} events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    engine.initialize(config.account.clone());
    engine.register();

    if let Some(number) = dial {
        let mut registration = engine.registration_state();
        let registered = registration
            .wait_for(|state| {
                matches!(state, RegistrationState::Registered | RegistrationState::Failed)
            })
            .await
            .map(|state| *state == RegistrationState::Registered)
            .unwrap_or(false);
        if registered {
            info!("Dialing {}", number);
            engine.make_call(number);
        } else {
            error!("Registration failed, not dialing");
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    engine.shutdown().await;

    Ok(())
}
