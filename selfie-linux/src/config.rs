//! Load config from file and environment.

use std::path::{Path, PathBuf};

use anyhow::Context;
use selfie_core::SessionConfig;
use serde::Deserialize;

/// Daemon configuration. File: ~/.config/selfie-share/config.toml or /etc/selfie-share/config.toml.
/// Env overrides: SELFIE_DISCOVERY_PORT, SELFIE_TRANSPORT_PORT, SELFIE_DISPLAY_NAME, SELFIE_SERVICE_TYPE.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Discovery UDP port (default 45690).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Peer link TCP port (default 45691).
    #[serde(default = "default_transport_port")]
    pub transport_port: u16,
    #[serde(default)]
    pub session: SessionConfig,
}

fn default_discovery_port() -> u16 {
    45690
}
fn default_transport_port() -> u16 {
    45691
}

impl Default for Config {
    fn default() -> Self {
        Self {
            discovery_port: default_discovery_port(),
            transport_port: default_transport_port(),
            session: SessionConfig::default(),
        }
    }
}

/// Load config: default, then the first config file found, then env vars. A file that
/// exists but does not parse is an error rather than a silent fallback.
pub fn load() -> anyhow::Result<Config> {
    let mut c = match config_paths().into_iter().find(|p| p.exists()) {
        Some(path) => load_file(&path)?,
        None => Config::default(),
    };
    apply_env(&mut c, |k| std::env::var(k).ok());
    c.session.validate()?;
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/selfie-share/config.toml"));
    }
    out.push(PathBuf::from("/etc/selfie-share/config.toml"));
    out
}

fn load_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    parse(&s).with_context(|| format!("parsing {}", path.display()))
}

pub fn parse(s: &str) -> anyhow::Result<Config> {
    Ok(toml::from_str::<Config>(s)?)
}

/// Unparseable port values are ignored, as if unset.
fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(p) = var("SELFIE_DISCOVERY_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.discovery_port = p;
    }
    if let Some(p) = var("SELFIE_TRANSPORT_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.transport_port = p;
    }
    if let Some(name) = var("SELFIE_DISPLAY_NAME").filter(|s| !s.trim().is_empty()) {
        c.session.display_name = name;
    }
    if let Some(service) = var("SELFIE_SERVICE_TYPE") {
        c.session.service_type = service;
    }
}
