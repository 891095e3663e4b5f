use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use irclog_sdk::{ChannelSpec, ClientConfig, ServerEndpoint};

/// IRC channel logger.
#[derive(Parser, Debug, Clone)]
#[command(name = "irclog", version, about)]
pub struct Cli {
    /// Path to the config file.
    pub config: PathBuf,

    /// Accept self-signed TLS certificates.
    #[arg(long)]
    pub tls_insecure: bool,

    /// Seconds between automatic log flushes (at most one day).
    #[arg(long, default_value = "60", value_parser = clap::value_parser!(u64).range(1..=86400))]
    pub flush_secs: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("missing config key: {0}")]
    MissingKey(&'static str),

    #[error("invalid server `{0}`, expected host:port")]
    BadServer(String),
}

/// A config entry: a bare key is a flag, `key: a b c` is a list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Flag,
    List(Vec<String>),
}

/// Parse the `key: value value` file format.
///
/// `#` lines and blank lines are skipped. Repeated list keys accumulate;
/// a list entry replaces an earlier flag with the same key.
pub fn parse_entries(text: &str) -> HashMap<String, Value> {
    let mut entries = HashMap::new();
    for line in text.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, values)) = line.split_once(':') else {
            entries.insert(line.to_string(), Value::Flag);
            continue;
        };
        let entry = entries
            .entry(key.trim().to_string())
            .or_insert_with(|| Value::List(Vec::new()));
        if *entry == Value::Flag {
            *entry = Value::List(Vec::new());
        }
        if let Value::List(list) = entry {
            list.extend(values.split_whitespace().map(str::to_string));
        }
    }
    entries
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotConfig {
    pub username: String,
    pub realname: String,
    pub nicks: Vec<String>,
    pub channels: Vec<ChannelSpec>,
    pub servers: Vec<ServerEndpoint>,
    pub use_tls: bool,
    pub log_path: String,
    pub silenced: bool,
}

impl BotConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_entries(&parse_entries(&text))
    }

    pub fn from_entries(entries: &HashMap<String, Value>) -> Result<Self, ConfigError> {
        let use_tls = entries.contains_key("use ssl");

        let channels = list(entries, "channel")?
            .iter()
            .map(|spec| match spec.rsplit_once(':') {
                Some((name, key)) => ChannelSpec {
                    name: name.to_string(),
                    key: Some(key.to_string()),
                },
                None => ChannelSpec {
                    name: spec.clone(),
                    key: None,
                },
            })
            .collect();

        let servers = list(entries, "server")?
            .iter()
            .map(|spec| -> Result<ServerEndpoint, ConfigError> {
                let (host, port) = spec
                    .rsplit_once(':')
                    .ok_or_else(|| ConfigError::BadServer(spec.clone()))?;
                let port = port
                    .parse()
                    .map_err(|_| ConfigError::BadServer(spec.clone()))?;
                Ok(ServerEndpoint {
                    host: host.to_string(),
                    port,
                    tls: use_tls,
                })
            })
            .collect::<Result<_, ConfigError>>()?;

        Ok(Self {
            username: first(entries, "username")?,
            realname: first(entries, "realname")?,
            nicks: list(entries, "nick")?.to_vec(),
            channels,
            servers,
            use_tls,
            log_path: first(entries, "log path")?,
            silenced: entries.contains_key("silenced") || entries.contains_key("quiet"),
        })
    }

    pub fn client_config(&self, cli: &Cli) -> ClientConfig {
        ClientConfig {
            nicknames: self.nicks.clone(),
            username: self.username.clone(),
            realname: self.realname.clone(),
            servers: self.servers.clone(),
            channels: self.channels.clone(),
            tls_insecure: cli.tls_insecure,
            flush_period: Duration::from_secs(cli.flush_secs),
            ..ClientConfig::default()
        }
    }
}

fn list<'a>(
    entries: &'a HashMap<String, Value>,
    key: &'static str,
) -> Result<&'a [String], ConfigError> {
    match entries.get(key) {
        Some(Value::List(values)) => Ok(values),
        _ => Err(ConfigError::MissingKey(key)),
    }
}

fn first(entries: &HashMap<String, Value>, key: &'static str) -> Result<String, ConfigError> {
    list(entries, key)?
        .first()
        .cloned()
        .ok_or(ConfigError::MissingKey(key))
}
