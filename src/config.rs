use std::collections::BTreeMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use serde::Deserialize;
use serde_yaml::Value;

use crate::event::BackendKind;

/// Environment variable consulted when no path is given on the command line.
pub const CONFIG_ENV: &str = "PORTICO_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "portico.yaml";

/// Directive name to value list. Scalars become one-element lists.
pub type Directives = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub event_backend: BackendKind,
    pub timeouts: Timeouts,
    pub servers: Vec<ServerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub client_idle_secs: u64,
    pub client_linger_secs: u64,
    pub cgi_secs: u64,
    pub zombie_grace_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            client_idle_secs: 15,
            client_linger_secs: 15,
            cgi_secs: 10,
            zombie_grace_secs: 10,
            poll_interval_ms: 1000,
        }
    }
}

impl Timeouts {
    pub fn client_idle(&self) -> Duration {
        Duration::from_secs(self.client_idle_secs)
    }

    pub fn client_linger(&self) -> Duration {
        Duration::from_secs(self.client_linger_secs)
    }

    pub fn cgi(&self) -> Duration {
        Duration::from_secs(self.cgi_secs)
    }

    pub fn zombie_grace(&self) -> Duration {
        Duration::from_secs(self.zombie_grace_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: Vec<SocketAddr>,
    pub server_name: Vec<String>,
    pub directives: Directives,
    /// In declaration order; regex locations depend on it.
    pub locations: Vec<LocationConfig>,
}

#[derive(Debug, Clone)]
pub struct LocationConfig {
    /// `= /exact`, `^~ /prefix`, `~ regex`, `~* regex` or a plain prefix.
    pub pattern: String,
    pub directives: Directives,
}

#[derive(Deserialize)]
struct RawConfig {
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default)]
    event_backend: BackendKind,
    #[serde(default)]
    timeouts: Timeouts,
    #[serde(default)]
    servers: Vec<RawServer>,
}

#[derive(Deserialize)]
struct RawServer {
    #[serde(default)]
    listen: Value,
    #[serde(default)]
    server_name: Value,
    #[serde(default)]
    locations: serde_yaml::Mapping,
    #[serde(flatten)]
    directives: BTreeMap<String, Value>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Picks the configuration path: explicit argument, then
    /// `PORTICO_CONFIG`, then `portico.yaml`.
    pub fn resolve_path(arg: Option<String>) -> PathBuf {
        arg.or_else(|| std::env::var(CONFIG_ENV).ok())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading config {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> anyhow::Result<Self> {
        let raw: RawConfig = serde_yaml::from_str(text).context("parsing yaml")?;

        if !matches!(
            raw.log_level.to_ascii_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            bail!("unknown log_level `{}`", raw.log_level);
        }
        if raw.servers.is_empty() {
            bail!("no servers configured");
        }

        let mut servers = Vec::with_capacity(raw.servers.len());
        for (i, server) in raw.servers.into_iter().enumerate() {
            servers.push(server.into_config().with_context(|| format!("server #{}", i + 1))?);
        }

        Ok(Self {
            log_level: raw.log_level,
            event_backend: raw.event_backend,
            timeouts: raw.timeouts,
            servers,
        })
    }

    /// Every distinct listen address, in first-seen order.
    pub fn listen_addrs(&self) -> Vec<SocketAddr> {
        let mut addrs: Vec<SocketAddr> = Vec::new();
        for addr in self.servers.iter().flat_map(|s| s.listen.iter()) {
            if !addrs.contains(addr) {
                addrs.push(*addr);
            }
        }
        addrs
    }
}

impl RawServer {
    fn into_config(self) -> anyhow::Result<ServerConfig> {
        let listen_values = string_list(&self.listen).context("listen")?;
        if listen_values.is_empty() {
            bail!("missing listen");
        }
        let listen = listen_values
            .iter()
            .map(|v| parse_listen(v))
            .collect::<anyhow::Result<Vec<_>>>()?;

        let server_name = string_list(&self.server_name)
            .context("server_name")?
            .into_iter()
            .map(|n| n.to_ascii_lowercase())
            .collect();

        let directives = directives_from(self.directives.iter())?;

        let mut locations = Vec::with_capacity(self.locations.len());
        for (key, value) in &self.locations {
            let Some(pattern) = key.as_str() else {
                bail!("location keys must be strings");
            };
            let directives = match value {
                Value::Mapping(map) => {
                    let entries = map
                        .iter()
                        .map(|(k, v)| match k.as_str() {
                            Some(name) => Ok((name.to_string(), v.clone())),
                            None => Err(anyhow::anyhow!("directive names must be strings")),
                        })
                        .collect::<anyhow::Result<Vec<_>>>()?;
                    directives_from(entries.iter().map(|(k, v)| (k, v)))?
                }
                Value::Null => Directives::new(),
                _ => bail!("location `{pattern}` must be a mapping"),
            };
            locations.push(LocationConfig {
                pattern: pattern.trim().to_string(),
                directives,
            });
        }

        Ok(ServerConfig {
            listen,
            server_name,
            directives,
            locations,
        })
    }
}

fn directives_from<'a>(
    entries: impl Iterator<Item = (&'a String, &'a Value)>,
) -> anyhow::Result<Directives> {
    let mut directives = Directives::new();
    for (name, value) in entries {
        let values = string_list(value).with_context(|| format!("directive `{name}`"))?;
        directives.insert(name.clone(), values);
    }
    Ok(directives)
}

/// Scalar or sequence of scalars to a list of strings.
fn string_list(value: &Value) -> anyhow::Result<Vec<String>> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Sequence(items) => items.iter().map(scalar).collect(),
        other => Ok(vec![scalar(other)?]),
    }
}

fn scalar(value: &Value) -> anyhow::Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(true) => Ok("on".to_string()),
        Value::Bool(false) => Ok("off".to_string()),
        _ => bail!("expected a scalar value"),
    }
}

/// `port`, `ip:port` or `host:port`.
pub fn parse_listen(value: &str) -> anyhow::Result<SocketAddr> {
    let value = value.trim();
    if let Ok(port) = value.parse::<u16>() {
        return Ok(SocketAddr::from(([0, 0, 0, 0], port)));
    }
    if let Ok(addr) = value.parse::<SocketAddr>() {
        return Ok(addr);
    }
    value
        .to_socket_addrs()
        .with_context(|| format!("invalid listen value `{value}`"))?
        .next()
        .with_context(|| format!("listen value `{value}` resolved to nothing"))
}
