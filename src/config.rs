//! CLI flags and YAML configuration for the proxy binary.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;

#[derive(Parser, Debug)]
#[command(name = "hallway-proxy", version, about = "HTTP forward proxy with optional MITM TLS interception")]
pub struct Cli {
    #[arg(long, default_value = "proxy.yaml")]
    pub config: PathBuf,

    #[arg(long, default_value = "info")]
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub listen: String,

    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    #[serde(default)]
    pub downstream_proxy: Option<String>,

    #[serde(default)]
    pub mitm: Option<MitmSettings>,
}

fn default_idle_timeout_secs() -> u64 {
    300
}

/// When present, requests are MITM'd instead of blind-tunneled on `CONNECT`.
/// `ca_cert`/`ca_key` select [`crate::tls::FileCertResolver`]; omitting both
/// falls back to a fresh in-memory [`crate::mitm::RcgenCertResolver`] root,
/// useful for local development without provisioning a CA.
#[derive(Debug, Deserialize, Clone)]
pub struct MitmSettings {
    #[serde(default)]
    pub ca_cert: Option<String>,
    #[serde(default)]
    pub ca_key: Option<String>,
}

pub fn load_config() -> Result<(Cli, Config)> {
    let cli = Cli::parse();

    let yaml = fs::read_to_string(&cli.config)
        .with_context(|| format!("failed to read {}", cli.config.display()))?;

    let cfg: Config = serde_yaml::from_str(&yaml).context("failed to parse YAML config")?;
    Ok((cli, cfg))
}
