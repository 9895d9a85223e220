//! mailroom - email backend server

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

use mailroom::Config;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Config::load()?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        bind = %config.server.bind,
        relay = config.relay.enabled,
        inbound = config.inbound.enabled,
        "starting mailroom"
    );
    mailroom::app::run(config).await
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "mailroom=info,mailroom_core=info,mailroom_queue=info,mailroom_smtp=info".into()
    });
    let json = std::env::var("MAILROOM_LOG_JSON")
        .is_ok_and(|v| matches!(v.trim(), "1" | "true" | "yes"));
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }
}
