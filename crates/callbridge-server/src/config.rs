use anyhow::{Context, bail};
use callbridge::MAX_FRAME_BYTES;
use callbridge_daemon::BridgeConfig;
use callbridge_daemon::correlator::DEFAULT_NAMESERVER;
use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    /// Browser origins allowed to connect. `"*"` allows any.
    pub allow_origins: Vec<String>,
    pub nameserver: String,
    /// Upper bound on correlated daemon requests. Unset waits forever.
    pub request_timeout_secs: Option<u64>,
    pub ping_interval_secs: u64,
    pub max_message_bytes: usize,
    /// Frames buffered per socket before new ones are dropped.
    pub outbound_queue: usize,
    /// Aliases of accounts created at startup.
    pub accounts: Vec<String>,
}

impl ServerConfig {
    /// Read `path`, or the default config file when it exists.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let config = match path {
            Some(path) => Self::read(path)?,
            None => {
                let default = Self::config_path();
                if default.exists() {
                    Self::read(&default)?
                } else {
                    Self::default()
                }
            }
        };
        config.validate()?;
        Ok(config)
    }

    fn read(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn config_path() -> PathBuf {
        dirs_path().join("config.toml")
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_message_bytes == 0 {
            bail!("max_message_bytes must be positive");
        }
        if self.outbound_queue == 0 {
            bail!("outbound_queue must be positive");
        }
        if self.ping_interval_secs == 0 {
            bail!("ping_interval_secs must be positive");
        }
        if self.nameserver.trim().is_empty() {
            bail!("nameserver must not be empty");
        }
        Ok(())
    }

    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            request_timeout: self.request_timeout_secs.map(Duration::from_secs),
            nameserver: self.nameserver.clone(),
        }
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8787)),
            allow_origins: vec!["http://localhost:3000".to_string()],
            nameserver: DEFAULT_NAMESERVER.to_string(),
            request_timeout_secs: None,
            ping_interval_secs: 30,
            max_message_bytes: MAX_FRAME_BYTES,
            outbound_queue: 256,
            accounts: Vec::new(),
        }
    }
}

fn dirs_path() -> PathBuf {
    if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(config_dir).join("callbridge")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".config").join("callbridge")
    } else {
        PathBuf::from("/tmp/callbridge")
    }
}

#[derive(Parser, Debug, Default)]
#[command(author, version, about = "callbridge signaling server")]
pub struct Cli {
    /// Config file (defaults to $XDG_CONFIG_HOME/callbridge/config.toml).
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[arg(long)]
    pub listen: Option<SocketAddr>,
    /// Allowed browser origin; repeat for several.
    #[arg(long = "allow-origin")]
    pub allow_origins: Vec<String>,
    #[arg(long)]
    pub nameserver: Option<String>,
    #[arg(long)]
    pub request_timeout_secs: Option<u64>,
    /// Create an account with this alias at startup; repeatable.
    #[arg(long = "account")]
    pub accounts: Vec<String>,
}

impl Cli {
    /// Load the config file and apply command-line overrides on top.
    pub fn resolve(&self) -> anyhow::Result<ServerConfig> {
        let mut config = ServerConfig::load(self.config.as_deref())?;
        self.apply(&mut config);
        config.validate()?;
        Ok(config)
    }

    pub fn apply(&self, config: &mut ServerConfig) {
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if !self.allow_origins.is_empty() {
            config.allow_origins = self.allow_origins.clone();
        }
        if let Some(nameserver) = &self.nameserver {
            config.nameserver = nameserver.clone();
        }
        if self.request_timeout_secs.is_some() {
            config.request_timeout_secs = self.request_timeout_secs;
        }
        config.accounts.extend(self.accounts.iter().cloned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_fields_take_defaults() {
        let config: ServerConfig = toml::from_str("listen = \"0.0.0.0:9000\"").unwrap();
        assert_eq!(config.listen, "0.0.0.0:9000".parse().unwrap());
        assert_eq!(config.max_message_bytes, 64 * 1024);
        assert_eq!(config.outbound_queue, 256);
        assert_eq!(config.request_timeout_secs, None);
        assert_eq!(config.bridge_config().request_timeout, None);
    }

    #[test]
    fn load_reads_explicit_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "allow_origins = [\"*\"]\nrequest_timeout_secs = 5\naccounts = [\"alice\", \"bob\"]"
        )
        .unwrap();

        let config = ServerConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.allow_origins, vec!["*"]);
        assert_eq!(config.accounts, vec!["alice", "bob"]);
        assert_eq!(
            config.bridge_config().request_timeout,
            Some(Duration::from_secs(5))
        );
    }

    #[test]
    fn load_rejects_bad_files() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ServerConfig::load(Some(&dir.path().join("absent.toml"))).is_err());

        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "outbound_queue = 0").unwrap();
        assert!(ServerConfig::load(Some(&path)).is_err());

        std::fs::write(&path, "listen_on = \"x\"").unwrap();
        assert!(ServerConfig::load(Some(&path)).is_err());
    }

    #[test]
    fn cli_overrides_file() {
        let cli = Cli::parse_from([
            "callbridge-server",
            "--listen",
            "127.0.0.1:0",
            "--allow-origin",
            "https://app.example",
            "--account",
            "carol",
        ]);
        let mut config = ServerConfig {
            accounts: vec!["alice".to_string()],
            ..ServerConfig::default()
        };
        cli.apply(&mut config);

        assert_eq!(config.listen.port(), 0);
        assert_eq!(config.allow_origins, vec!["https://app.example"]);
        assert_eq!(config.accounts, vec!["alice", "carol"]);
        assert_eq!(config.nameserver, DEFAULT_NAMESERVER);
    }
}
