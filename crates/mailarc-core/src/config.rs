//! Configuration management for mailarc

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Archive sync settings
    #[serde(default)]
    pub sync: SyncConfig,

    /// Indexing pipeline settings
    #[serde(default)]
    pub index: IndexConfig,

    /// Search settings
    #[serde(default)]
    pub search: SearchConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Also write a daily rolling log under `<data_dir>/logs`
    #[serde(default)]
    pub log_to_file: bool,

    /// Archive root used when no directory is given on the command line
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_to_file: false,
            data_dir: default_data_dir(),
        }
    }
}

/// Archive sync settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// IMAP commands per second
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_second: u32,

    /// Connection attempts before giving up (authentication is never retried)
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,

    /// Timeout for TCP/TLS connect and login (seconds)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            rate_limit_per_second: default_rate_limit(),
            connect_attempts: default_connect_attempts(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

/// Indexing pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Parallel parse workers (0 = one per CPU)
    #[serde(default)]
    pub workers: usize,

    /// Capacity of the candidate queue (0 = same as workers)
    #[serde(default)]
    pub queue_capacity: usize,

    /// Memory budget of the index writer in bytes
    #[serde(default = "default_writer_memory")]
    pub writer_memory_bytes: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            queue_capacity: 0,
            writer_memory_bytes: default_writer_memory(),
        }
    }
}

impl IndexConfig {
    /// Effective worker count
    pub fn worker_count(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get().max(1)
        } else {
            self.workers
        }
    }

    /// Effective queue capacity
    pub fn queue_capacity(&self) -> usize {
        if self.queue_capacity == 0 {
            self.worker_count()
        } else {
            self.queue_capacity
        }
    }
}

/// Search settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Maximum ranked hits returned per query
    #[serde(default = "default_max_hits")]
    pub max_hits: usize,

    /// Body preview length in characters
    #[serde(default = "default_preview_chars")]
    pub preview_chars: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_hits: default_max_hits(),
            preview_chars: default_preview_chars(),
        }
    }
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_data_dir() -> PathBuf {
    get_data_dir()
}

fn default_rate_limit() -> u32 {
    20
}

fn default_connect_attempts() -> u32 {
    3
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_writer_memory() -> usize {
    50_000_000
}

fn default_max_hits() -> usize {
    1000
}

fn default_preview_chars() -> usize {
    200
}

fn default_port() -> u16 {
    993
}

/// Get the data directory (XDG: ~/.local/share/mailarc)
fn get_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".local")
        .join("share")
        .join(crate::APP_NAME)
}

/// Get the config directory (XDG: ~/.config/mailarc)
fn get_config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join(crate::APP_NAME)
}

impl Config {
    /// Default config file location
    pub fn default_path() -> PathBuf {
        get_config_dir().join("config.toml")
    }

    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path())
    }

    /// Load configuration from a specific path; a missing file yields the
    /// defaults, an unreadable or malformed one is an error
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).map_err(|e| Error::ConfigRead {
                path: path.to_path_buf(),
                source: e,
            })?;
            let config: Config = toml::from_str(&contents).map_err(|e| Error::ConfigParse {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
            info!("Loaded configuration from {:?}", path);
            Ok(config)
        } else {
            info!("No config file found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Directory for rolling log files
    pub fn logs_dir(&self) -> PathBuf {
        self.general.data_dir.join("logs")
    }
}

/// Credentials and endpoint of one mail account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Account name; names the account's directory in batch mode
    #[serde(default)]
    pub name: String,

    pub server: String,

    #[serde(default = "default_port")]
    pub port: u16,

    pub login: String,

    #[serde(default)]
    pub password: String,

    /// Connect with implicit TLS
    #[serde(default)]
    pub tls: bool,
}

impl AccountConfig {
    /// Check the fields needed to connect
    pub fn validate(&self) -> Result<()> {
        if self.server.trim().is_empty() {
            return Err(Error::Config("server must not be empty".to_string()));
        }
        if self.login.trim().is_empty() {
            return Err(Error::Config("login must not be empty".to_string()));
        }
        if self.port == 0 {
            return Err(Error::Config("port must not be 0".to_string()));
        }
        Ok(())
    }
}

/// Batch of accounts archived one after another, read from JSON:
///
/// ```json
/// { "dir": ".", "accounts": [ { "name": "work", "server": "imap.example.com",
///   "port": 993, "login": "me", "password": "secret", "tls": true } ] }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountList {
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,

    /// Archive root; `"."` means the directory containing the JSON file
    pub dir: PathBuf,
}

impl AccountList {
    /// Read and decode a batch file, resolving `dir == "."`
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| Error::ConfigRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        let mut list: AccountList =
            serde_json::from_str(&contents).map_err(|e| Error::ConfigParse {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        if list.dir == Path::new(".") {
            list.dir = path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
        }
        info!(
            "Loaded {} accounts from {:?}, archiving into {:?}",
            list.accounts.len(),
            path,
            list.dir
        );
        Ok(list)
    }

    /// Archive directory of one account
    pub fn account_dir(&self, account: &AccountConfig) -> PathBuf {
        self.dir.join(&account.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.search.max_hits, 1000);
        assert_eq!(config.search.preview_chars, 200);
        assert!(config.index.worker_count() >= 1);
        assert_eq!(config.index.queue_capacity(), config.index.worker_count());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [index]
            workers = 3

            [search]
            max_hits = 50
            "#,
        )
        .unwrap();
        assert_eq!(config.index.worker_count(), 3);
        assert_eq!(config.index.queue_capacity(), 3);
        assert_eq!(config.search.max_hits, 50);
        assert_eq!(config.search.preview_chars, 200);
        assert_eq!(config.sync.connect_attempts, 3);
    }

    #[test]
    fn test_config_file_errors_are_not_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        assert_eq!(Config::load_from(&missing).unwrap().search.max_hits, 1000);

        let broken = dir.path().join("broken.toml");
        std::fs::write(&broken, "[search\nmax_hits = ").unwrap();
        assert!(matches!(
            Config::load_from(&broken),
            Err(Error::ConfigParse { .. })
        ));

        // A directory exists but cannot be read as a file
        assert!(matches!(
            Config::load_from(dir.path()),
            Err(Error::ConfigRead { .. })
        ));
    }

    #[test]
    fn test_account_list_resolves_dot_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.json");
        std::fs::write(
            &path,
            r#"{"dir": ".", "accounts": [{"name": "work", "server": "imap.example.com", "login": "me"}]}"#,
        )
        .unwrap();

        let list = AccountList::load(&path).unwrap();
        assert_eq!(list.dir, dir.path());
        assert_eq!(list.accounts[0].port, 993);
        assert!(!list.accounts[0].tls);
        assert_eq!(list.account_dir(&list.accounts[0]), dir.path().join("work"));
    }

    #[test]
    fn test_account_list_errors_are_distinct() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        assert!(matches!(
            AccountList::load(&missing),
            Err(Error::ConfigRead { .. })
        ));

        let broken = dir.path().join("broken.json");
        std::fs::write(&broken, "{ not json").unwrap();
        assert!(matches!(
            AccountList::load(&broken),
            Err(Error::ConfigParse { .. })
        ));
    }

    #[test]
    fn test_account_validation() {
        let mut account = AccountConfig {
            name: "a".into(),
            server: "imap.example.com".into(),
            port: 993,
            login: "me".into(),
            password: String::new(),
            tls: true,
        };
        assert!(account.validate().is_ok());
        account.server.clear();
        assert!(account.validate().is_err());
    }
}
