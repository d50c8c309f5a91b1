//! Binary entry-point for the HTTP forward proxy.

mod config;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use hallway_proxy::{CertResolver, FileCertResolver, LoggingMitmErrorHook, MitmConfig, ProxyBuilder, RcgenCertResolver};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{filter::LevelFilter, fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let (cli, cfg) = config::load_config()?;

    let log_level = cli.log_level.parse::<LevelFilter>().unwrap_or(LevelFilter::INFO);
    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    info!("configuration loaded from {:?}", cli.config);
    info!("listen: {}", cfg.listen);

    let mut builder = ProxyBuilder::new().idle_timeout(Duration::from_secs(cfg.idle_timeout_secs));

    if let Some(proxy_url) = &cfg.downstream_proxy {
        let url = url::Url::parse(proxy_url)?;
        info!(downstream_proxy = %url, "pinning all outbound dials to downstream proxy");
        builder = builder.downstream_proxy(url);
    }

    if let Some(mitm) = &cfg.mitm {
        let resolver: Arc<dyn CertResolver> = match (&mitm.ca_cert, &mitm.ca_key) {
            (Some(cert), Some(key)) => {
                info!(ca_cert = %cert, "MITM enabled with CA loaded from disk");
                Arc::new(FileCertResolver::load(cert, key)?)
            }
            _ => {
                info!("MITM enabled with a throwaway in-memory CA (no ca_cert/ca_key configured)");
                Arc::new(RcgenCertResolver::generate()?)
            }
        };
        builder = builder.mitm(MitmConfig {
            cert_resolver: resolver,
            error_hook: Arc::new(LoggingMitmErrorHook),
        });
    }

    let proxy = builder.build();
    let listener = TcpListener::bind(&cfg.listen).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received shutdown signal");
            let _ = shutdown_tx.send(true);
        }
    });

    if let Err(e) = proxy.serve(listener, shutdown_rx).await {
        error!(error = %e, "proxy exited with error");
    }

    Ok(())
}
