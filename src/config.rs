use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;

#[cfg(feature = "metrics")]
use crate::metrics::MetricsServer;
use crate::relay::DEFAULT_BUFFER_SIZE;

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub io_params: IoParams,
    pub forwards: Vec<Forward>,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,
    #[cfg(feature = "metrics")]
    pub metrics: Option<MetricsServer>,
}

impl Config {
    pub async fn load(path: &str) -> Result<Self> {
        let s = tokio::fs::read(path)
            .await
            .with_context(|| format!("read file {}", path))?;
        let s = String::from_utf8(s).context("parse utf8")?;
        Self::from_yaml(&s)
    }

    pub fn from_yaml(s: &str) -> Result<Self> {
        let cfg: Config = serde_yaml_ng::from_str(s).context("parse yaml")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.io_params.buffer_size == 0 {
            bail!("ioParams.bufferSize must be greater than zero");
        }
        if self.forwards.is_empty() {
            bail!("no forwards configured");
        }
        let mut names = HashSet::new();
        for f in &self.forwards {
            if !names.insert(f.name.as_str()) {
                bail!("duplicate forward name: {}", f.name);
            }
            if f.target.is_empty() {
                bail!("forward {} has an empty target", f.name);
            }
        }
        Ok(())
    }
}

fn default_shutdown_timeout() -> u64 {
    5
}

/// Knobs handed to every relay session.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IoParams {
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_use_splice")]
    pub use_splice: bool,
}

impl Default for IoParams {
    fn default() -> Self {
        IoParams {
            buffer_size: default_buffer_size(),
            use_splice: default_use_splice(),
        }
    }
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_use_splice() -> bool {
    true
}

/// One listening socket whose connections are relayed to `target`.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Forward {
    pub name: String,
    pub bind: SocketAddr,
    /// `host:port`, resolved on every connection.
    pub target: String,
}
