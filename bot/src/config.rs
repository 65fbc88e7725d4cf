/// Runtime configuration, read once at startup from the environment.
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use jm_shared::errors::BotError;
use jm_shared::job::OutputMode;

use crate::gateway::connection::{GatewaySettings, RetryPolicy};
use crate::workers::fetcher::FetcherConfig;

/// Literal phrases of the command grammar.
#[derive(Debug, Clone)]
pub struct GrammarConfig {
    pub enable_phrase: String,
    pub disable_phrase: String,
    pub help_phrase: String,
    pub fetch_prefix: String,
}

impl Default for GrammarConfig {
    fn default() -> Self {
        Self {
            enable_phrase: "/启用jm".to_string(),
            disable_phrase: "/禁用jm".to_string(),
            help_phrase: "/帮助".to_string(),
            fetch_prefix: "/jm".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BotConfig {
    pub admins: HashSet<i64>,
    pub max_file_bytes: u64,
    pub cleanup_interval: Duration,
    pub archive_password: String,
    pub cooldown: Duration,
    pub output_mode: OutputMode,
    pub fetcher: FetcherConfig,
    pub gateway: GatewaySettings,
    pub server_host: String,
    pub server_port: u16,
    pub data_dir: PathBuf,
    pub grammar: GrammarConfig,
}

impl BotConfig {
    /// Read configuration from process environment variables.
    pub fn from_env() -> Result<Self, BotError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, BotError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str, default: &str| -> String {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        let admins = parse_id_list(&get("ADMIN_IDS", ""))?;
        let max_file_mb: u64 = parse_num("MAX_FILE_SIZE_MB", &get("MAX_FILE_SIZE_MB", "100"))?;
        let max_file_bytes = max_file_mb
            .checked_mul(1024 * 1024)
            .ok_or_else(|| BotError::Config(format!("MAX_FILE_SIZE_MB is too large: {}", max_file_mb)))?;
        let cleanup_secs: u64 = parse_num("CLEANUP_INTERVAL_SECS", &get("CLEANUP_INTERVAL_SECS", "3600"))?;
        let cooldown_secs: u64 = parse_num("COOLDOWN_SECS", &get("COOLDOWN_SECS", "60"))?;
        let output_mode: OutputMode = get("OUTPUT_MODE", "archive")
            .parse()
            .map_err(|e: String| BotError::Config(format!("OUTPUT_MODE: {}", e)))?;

        // The fetcher runs inside job directories, so every path handed to it
        // must be absolute.
        let data_dir = absolute(Path::new(&get("DATA_DIR", ".")))?;
        let option_file = PathBuf::from(get("FETCHER_OPTION_FILE", "jm-option.yml"));
        let option_file = if option_file.is_relative() {
            data_dir.join(option_file)
        } else {
            option_file
        };
        let fetcher = FetcherConfig {
            program: get("FETCHER_BIN", "jmcomic"),
            args: get("FETCHER_ARGS", "{id} --option={option}")
                .split_whitespace()
                .map(String::from)
                .collect(),
            option_file,
        };

        let gateway = GatewaySettings {
            host: get("ONEBOT_HOST", "127.0.0.1"),
            port: parse_num("ONEBOT_PORT", &get("ONEBOT_PORT", "5700"))?,
            access_token: lookup("ONEBOT_ACCESS_TOKEN")
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty()),
            reconnect_delay: Duration::from_secs(5),
            response_timeout: Duration::from_secs(parse_num(
                "API_TIMEOUT_SECS",
                &get("API_TIMEOUT_SECS", "60"),
            )?),
            retry: RetryPolicy::default(),
        };

        let defaults = GrammarConfig::default();
        let grammar = GrammarConfig {
            enable_phrase: get("CMD_ENABLE", &defaults.enable_phrase),
            disable_phrase: get("CMD_DISABLE", &defaults.disable_phrase),
            help_phrase: get("CMD_HELP", &defaults.help_phrase),
            fetch_prefix: get("CMD_FETCH_PREFIX", &defaults.fetch_prefix),
        };

        Ok(Self {
            admins,
            max_file_bytes,
            cleanup_interval: Duration::from_secs(cleanup_secs),
            archive_password: get("ARCHIVE_PASSWORD", "123456"),
            cooldown: Duration::from_secs(cooldown_secs),
            output_mode,
            fetcher,
            gateway,
            server_host: get("SERVER_HOST", "127.0.0.1"),
            server_port: parse_num("SERVER_PORT", &get("SERVER_PORT", "8080"))?,
            data_dir,
            grammar,
        })
    }

    pub fn download_dir(&self) -> PathBuf {
        self.data_dir.join("downloads")
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.data_dir.join("zips")
    }

    pub fn document_dir(&self) -> PathBuf {
        self.data_dir.join("pdf")
    }

    pub fn groups_file(&self) -> PathBuf {
        self.data_dir.join("enabled_groups.json")
    }

    /// Directories holding per-job scratch data.
    pub fn scratch_dirs(&self) -> Vec<PathBuf> {
        vec![self.download_dir(), self.archive_dir(), self.document_dir()]
    }
}

/// `path` joined onto the process working directory when relative, with `.`
/// components dropped.
fn absolute(path: &Path) -> Result<PathBuf, BotError> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    Ok(joined
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect())
}

fn parse_num<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, BotError> {
    raw.parse::<T>()
        .map_err(|_| BotError::Config(format!("{} must be a number, got '{}'", key, raw)))
}

fn parse_id_list(raw: &str) -> Result<HashSet<i64>, BotError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| parse_num::<i64>("ADMIN_IDS", s))
        .collect()
}

/// Config from a fixed map, for tests.
#[cfg(test)]
pub fn config_from_pairs(pairs: &[(&str, &str)]) -> BotConfig {
    let map: std::collections::HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    BotConfig::from_lookup(|key| map.get(key).cloned()).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = config_from_pairs(&[]);
        assert!(config.admins.is_empty());
        assert_eq!(config.max_file_bytes, 100 * 1024 * 1024);
        assert_eq!(config.cleanup_interval, Duration::from_secs(3600));
        assert_eq!(config.cooldown, Duration::from_secs(60));
        assert_eq!(config.output_mode, OutputMode::Archive);
        assert_eq!(config.archive_password, "123456");
        assert_eq!(config.gateway.port, 5700);
        assert!(config.gateway.access_token.is_none());
        assert_eq!(config.grammar.fetch_prefix, "/jm");
        assert_eq!(config.fetcher.args, vec!["{id}", "--option={option}"]);
        let cwd = std::env::current_dir().unwrap();
        assert_eq!(config.data_dir, cwd);
        assert_eq!(config.fetcher.option_file, cwd.join("jm-option.yml"));
        assert_eq!(config.download_dir(), cwd.join("downloads"));
    }

    #[test]
    fn test_relative_data_dir_is_made_absolute() {
        let config = config_from_pairs(&[("DATA_DIR", "./state"), ("FETCHER_OPTION_FILE", "opts/jm.yml")]);
        let cwd = std::env::current_dir().unwrap();
        assert!(config.data_dir.is_absolute());
        assert_eq!(config.data_dir, cwd.join("state"));
        assert_eq!(config.fetcher.option_file, cwd.join("state/opts/jm.yml"));
        assert!(config.scratch_dirs().iter().all(|d| d.is_absolute()));
    }

    #[test]
    fn test_huge_file_size_rejected() {
        let result = BotConfig::from_lookup(|key| match key {
            "MAX_FILE_SIZE_MB" => Some(u64::MAX.to_string()),
            _ => None,
        });
        assert!(matches!(result, Err(BotError::Config(_))));
    }

    #[test]
    fn test_overrides() {
        let config = config_from_pairs(&[
            ("ADMIN_IDS", "10001, 10002"),
            ("OUTPUT_MODE", "pdf"),
            ("COOLDOWN_SECS", "3661"),
            ("ONEBOT_ACCESS_TOKEN", "secret"),
            ("DATA_DIR", "/srv/jm"),
            ("CMD_FETCH_PREFIX", "/album"),
        ]);
        assert!(config.admins.contains(&10001));
        assert!(config.admins.contains(&10002));
        assert_eq!(config.output_mode, OutputMode::Document);
        assert_eq!(config.cooldown, Duration::from_secs(3661));
        assert_eq!(config.gateway.access_token.as_deref(), Some("secret"));
        assert_eq!(config.download_dir(), PathBuf::from("/srv/jm/downloads"));
        assert_eq!(config.groups_file(), PathBuf::from("/srv/jm/enabled_groups.json"));
        assert_eq!(config.grammar.fetch_prefix, "/album");
    }

    #[test]
    fn test_bad_number_rejected() {
        let result = BotConfig::from_lookup(|key| match key {
            "COOLDOWN_SECS" => Some("soon".to_string()),
            _ => None,
        });
        assert!(matches!(result, Err(BotError::Config(_))));
    }

    #[test]
    fn test_bad_admin_id_rejected() {
        let result = BotConfig::from_lookup(|key| match key {
            "ADMIN_IDS" => Some("1,abc".to_string()),
            _ => None,
        });
        assert!(result.is_err());
    }
}
