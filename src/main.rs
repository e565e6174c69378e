use anyhow::Context;
use pipeconsole::{api, config, jobs::JobRegistry, logging, supervisor::Supervisor};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::net::TcpListener;

const PORT_RANGE: std::ops::RangeInclusive<u16> = 4200..=4299;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = config::init_config().context("failed to load configuration")?;
    logging::init_tracing();
    let config = Arc::new(config.clone());
    let runner = Arc::new(Supervisor::new(config.ingest_debug));
    let port = config.server_port;
    let app = api::create_router(Arc::new(JobRegistry::new(config, runner)));

    let (listener, port) = bind_listener(port).await?;
    tracing::info!(port, "Listening on http://0.0.0.0:{port}");
    axum::serve(listener, app)
        .await
        .context("server terminated")
}

/// Bind the configured port, or the first free port of [`PORT_RANGE`] when none is set.
async fn bind_listener(configured: Option<u16>) -> anyhow::Result<(TcpListener, u16)> {
    if let Some(port) = configured {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
            .await
            .with_context(|| format!("failed to bind SERVER_PORT {port}"))?;
        return Ok((listener, port));
    }

    for port in PORT_RANGE {
        match TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await {
            Ok(listener) => return Ok((listener, port)),
            Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
                tracing::debug!(port, "Port already in use; trying next");
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed to bind port {port}"));
            }
        }
    }

    anyhow::bail!(
        "no free port in {}-{}",
        PORT_RANGE.start(),
        PORT_RANGE.end()
    )
}
