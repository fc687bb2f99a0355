//! Layered hub configuration.
//!
//! Precedence, lowest first:
//! 1. Built-in defaults
//! 2. `config.toml` (explicit path, or `<config dir>/nova-hub/config.toml`)
//! 3. `NOVA_HUB_*` environment overrides
//!
//! ```toml
//! [hub]
//! bbs_name = "Nova Hub"
//! bbs_index = "01"
//!
//! [engine]
//! program = "/usr/bin/dosemu"
//! args = ["-dumb", "-E", "BRE.BAT {league}"]
//! timeout_secs = 300
//!
//! [[leagues]]
//! id = "555B"
//!
//! [[clients]]
//! id = "starport"
//! name = "Starport BBS"
//! token_sha256 = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08"
//! memberships = [{ league = "555B", bbs_index = "02" }]
//! ```

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::ledger::DEFAULT_REORDER_WINDOW;
use crate::ledger::GapPolicy;
use crate::ledger::MAX_REORDER_WINDOW;
use crate::packet::BbsIndex;
use crate::packet::LeagueId;
use crate::store::DEFAULT_POOL_SIZE;

pub const ENV_PREFIX: &str = "NOVA_HUB";
pub const CONFIG_FILENAME: &str = "config.toml";
const APP_DIR: &str = "nova-hub";
const SOCKET_FILENAME: &str = "nova-hub.sock";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value {value:?} for {var}: expected {expected}")]
    InvalidEnv {
        var: String,
        value: String,
        expected: &'static str,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Identity and location of a node, as listed in the generated nodelist.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeLocation {
    pub fidonet: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub data_dir: PathBuf,
    pub socket_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            data_dir: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(APP_DIR),
            socket_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubSection {
    pub bbs_name: String,
    pub bbs_index: BbsIndex,
    #[serde(flatten)]
    pub location: NodeLocation,
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            bbs_name: "Nova Hub".to_string(),
            bbs_index: BbsIndex(0x01),
            location: NodeLocation::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Defaults to `<data_dir>/nova-hub.db`.
    pub path: Option<PathBuf>,
    pub pool_size: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            pool_size: DEFAULT_POOL_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Seconds between scheduled runs; 0 disables the scheduler.
    pub poll_interval_secs: u64,
    pub reorder_window: u16,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 0,
            reorder_window: DEFAULT_REORDER_WINDOW,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub program: String,
    /// Supports `{league}`, `{number}`, `{game}`, `{workdir}`, `{inbound}`
    /// and `{outbound}` placeholders.
    pub args: Vec<String>,
    pub timeout_secs: u64,
    /// Per-league work directories live under here unless overridden.
    /// Defaults to `<data_dir>/leagues`.
    pub work_root: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    /// Extra report commands run after a successful engine pass; their
    /// failures are logged and otherwise ignored.
    pub report_commands: Vec<Vec<String>>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            program: "dosemu".to_string(),
            args: Vec::new(),
            timeout_secs: 300,
            work_root: None,
            env: BTreeMap::new(),
            report_commands: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeagueConfig {
    pub id: LeagueId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipConfig {
    pub league: LeagueId,
    pub bbs_index: BbsIndex,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub id: String,
    pub name: String,
    /// Hex SHA-256 of the client's bearer token.
    pub token_sha256: String,
    #[serde(default)]
    pub memberships: Vec<MembershipConfig>,
    #[serde(flatten)]
    pub location: NodeLocation,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub server: ServerConfig,
    pub hub: HubSection,
    pub database: DatabaseConfig,
    pub processing: ProcessingConfig,
    pub engine: EngineConfig,
    pub logging: LoggingConfig,
    pub leagues: Vec<LeagueConfig>,
    pub clients: Vec<ClientConfig>,
}

impl HubConfig {
    /// `<config dir>/nova-hub/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_DIR).join(CONFIG_FILENAME))
    }

    /// Load all three layers. An explicitly named file must exist; the
    /// default location is optional.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                Some(path) => {
                    tracing::info!("config.toml not found at {path:?}, using defaults");
                    Self::default()
                }
                None => Self::default(),
            },
        };
        config.apply_env_overrides(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Apply `NOVA_HUB_*` overrides looked up through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |suffix: &str| format!("{ENV_PREFIX}_{suffix}");
        let get = |suffix: &str| {
            let name = var(suffix);
            lookup(&name).map(|value| {
                tracing::debug!("Applying env override: {name}={value}");
                (name, value)
            })
        };

        if let Some((_, value)) = get("DATA_DIR") {
            self.server.data_dir = PathBuf::from(value);
        }
        if let Some((_, value)) = get("SOCKET") {
            self.server.socket_path = Some(PathBuf::from(value));
        }
        if let Some((_, value)) = get("DB_PATH") {
            self.database.path = Some(PathBuf::from(value));
        }
        if let Some((_, value)) = get("ENGINE_PROGRAM") {
            self.engine.program = value;
        }
        if let Some((name, value)) = get("ENGINE_TIMEOUT_SECS") {
            self.engine.timeout_secs = parse_env(name, value, "a number of seconds")?;
        }
        if let Some((name, value)) = get("POLL_INTERVAL_SECS") {
            self.processing.poll_interval_secs = parse_env(name, value, "a number of seconds")?;
        }
        if let Some((name, value)) = get("REORDER_WINDOW") {
            self.processing.reorder_window = parse_env(name, value, "an integer 0-499")?;
        }
        if let Some((_, value)) = get("LOG_LEVEL") {
            self.logging.level = value;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "engine.timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.processing.reorder_window > MAX_REORDER_WINDOW {
            return Err(ConfigError::Invalid(format!(
                "processing.reorder_window must be at most {MAX_REORDER_WINDOW}"
            )));
        }

        let mut leagues = HashSet::new();
        for league in &self.leagues {
            if !leagues.insert(league.id) {
                return Err(ConfigError::Invalid(format!(
                    "league {} configured twice",
                    league.id
                )));
            }
        }

        let mut client_ids = HashSet::new();
        let mut seats = HashSet::new();
        for client in &self.clients {
            if !client_ids.insert(client.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "client {} configured twice",
                    client.id
                )));
            }
            let digest = &client.token_sha256;
            if digest.len() != 64 || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(ConfigError::Invalid(format!(
                    "client {}: token_sha256 must be 64 hex digits",
                    client.id
                )));
            }
            for membership in &client.memberships {
                if membership.bbs_index == self.hub.bbs_index {
                    return Err(ConfigError::Invalid(format!(
                        "client {} uses the hub's own index {} in {}",
                        client.id, membership.bbs_index, membership.league
                    )));
                }
                if !seats.insert((membership.league, membership.bbs_index)) {
                    return Err(ConfigError::Invalid(format!(
                        "index {} in {} is assigned to more than one client",
                        membership.bbs_index, membership.league
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.database
            .path
            .clone()
            .unwrap_or_else(|| self.server.data_dir.join("nova-hub.db"))
    }

    /// Defaults to `<data_dir>/nova-hub.sock`, beside the database it serves.
    pub fn socket_path(&self) -> PathBuf {
        self.server
            .socket_path
            .clone()
            .unwrap_or_else(|| self.server.data_dir.join(SOCKET_FILENAME))
    }

    pub fn work_root(&self) -> PathBuf {
        self.engine
            .work_root
            .clone()
            .unwrap_or_else(|| self.server.data_dir.join("leagues"))
    }

    /// Engine work directory for a league.
    pub fn league_work_dir(&self, league: &LeagueConfig) -> PathBuf {
        league
            .work_dir
            .clone()
            .unwrap_or_else(|| self.work_root().join(league.id.to_string()))
    }

    pub fn gap_policy(&self) -> GapPolicy {
        GapPolicy::new(self.processing.reorder_window)
    }

    pub fn engine_timeout(&self) -> Duration {
        Duration::from_secs(self.engine.timeout_secs)
    }

    /// `None` when the scheduler is disabled.
    pub fn poll_interval(&self) -> Option<Duration> {
        (self.processing.poll_interval_secs > 0)
            .then(|| Duration::from_secs(self.processing.poll_interval_secs))
    }
}

fn parse_env<T: std::str::FromStr>(
    var: String,
    value: String,
    expected: &'static str,
) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        var,
        value,
        expected,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    const DIGEST: &str = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

    fn sample() -> HubConfig {
        HubConfig::from_toml_str(&format!(
            r#"
            [server]
            data_dir = "/var/lib/nova"

            [hub]
            bbs_name = "Nova Hub"
            bbs_index = "01"
            city = "Portland"

            [engine]
            program = "/usr/bin/dosemu"
            args = ["-dumb", "BRE.BAT {{league}}"]
            timeout_secs = 120

            [[leagues]]
            id = "555B"

            [[leagues]]
            id = "555F"
            work_dir = "/srv/fe"

            [[clients]]
            id = "starport"
            name = "Starport BBS"
            token_sha256 = "{DIGEST}"
            memberships = [{{ league = "555B", bbs_index = "02" }}]
            "#
        ))
        .unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = HubConfig::default();
        assert_eq!(config.hub.bbs_index, BbsIndex(1));
        assert_eq!(config.engine.timeout_secs, 300);
        assert_eq!(config.processing.reorder_window, DEFAULT_REORDER_WINDOW);
        assert_eq!(config.poll_interval(), None);
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_file_layer() {
        let config = sample();
        assert_eq!(config.hub.location.city.as_deref(), Some("Portland"));
        assert_eq!(config.engine_timeout(), Duration::from_secs(120));
        assert_eq!(config.database_path(), PathBuf::from("/var/lib/nova/nova-hub.db"));
        assert_eq!(config.socket_path(), PathBuf::from("/var/lib/nova/nova-hub.sock"));
        assert_eq!(
            config.league_work_dir(&config.leagues[0]),
            PathBuf::from("/var/lib/nova/leagues/555B")
        );
        assert_eq!(
            config.league_work_dir(&config.leagues[1]),
            PathBuf::from("/srv/fe")
        );
        assert_eq!(config.clients[0].memberships[0].bbs_index, BbsIndex(2));
        config.validate().unwrap();
    }

    #[test]
    fn test_apply_env_overrides() {
        let mut config = sample();
        let env: HashMap<&str, &str> = HashMap::from([
            ("NOVA_HUB_ENGINE_TIMEOUT_SECS", "45"),
            ("NOVA_HUB_REORDER_WINDOW", "20"),
            ("NOVA_HUB_DB_PATH", "/tmp/hub.db"),
            ("NOVA_HUB_LOG_LEVEL", "debug"),
        ]);
        config
            .apply_env_overrides(|var| env.get(var).map(|v| (*v).to_string()))
            .unwrap();
        assert_eq!(config.engine.timeout_secs, 45);
        assert_eq!(config.gap_policy().reorder_window(), 20);
        assert_eq!(config.database_path(), PathBuf::from("/tmp/hub.db"));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_apply_env_overrides_invalid_number() {
        let mut config = HubConfig::default();
        let result = config.apply_env_overrides(|var| {
            (var == "NOVA_HUB_POLL_INTERVAL_SECS").then(|| "soon".to_string())
        });
        match result {
            Err(ConfigError::InvalidEnv { var, value, .. }) => {
                assert_eq!(var, "NOVA_HUB_POLL_INTERVAL_SECS");
                assert_eq!(value, "soon");
            }
            other => panic!("expected InvalidEnv, got {other:?}"),
        }
    }

    #[test]
    fn test_validation_rejects_shared_seat() {
        let mut config = sample();
        let mut twin = config.clients[0].clone();
        twin.id = "twin".to_string();
        config.clients.push(twin);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validation_rejects_hub_index() {
        let mut config = sample();
        config.clients[0].memberships[0].bbs_index = BbsIndex(1);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = HubConfig::load(Some(&dir.path().join("absent.toml")));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }
}
