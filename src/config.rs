//! Runtime configuration sourced from the environment.

use std::collections::HashMap;
use std::path::PathBuf;

/// Service-wide configuration. Built once at startup from environment
/// variables; all components receive it by clone.
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub log_level: String,
    pub service_name: String,
    pub enable_runtime_endpoint: bool,
    /// Root directory engine subprocesses are confined to. `/` disables
    /// the containment check.
    pub workspace_root: PathBuf,
    /// Global cap on concurrently running executions.
    pub max_concurrent: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/bitk.db"),
            log_level: "info".to_string(),
            service_name: "bitk".to_string(),
            enable_runtime_endpoint: false,
            workspace_root: PathBuf::from("/"),
            max_concurrent: 4,
        }
    }
}

impl Config {
    /// Read configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars().collect())
    }

    /// Build configuration from an explicit variable map. Split out so
    /// tests don't mutate the process environment.
    pub fn from_vars(vars: HashMap<String, String>) -> Self {
        let defaults = Self::default();
        Self {
            db_path: vars
                .get("DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            log_level: vars
                .get("LOG_LEVEL")
                .cloned()
                .unwrap_or(defaults.log_level),
            service_name: vars
                .get("SERVICE_NAME")
                .cloned()
                .unwrap_or(defaults.service_name),
            enable_runtime_endpoint: vars
                .get("ENABLE_RUNTIME_ENDPOINT")
                .map(|v| parse_bool(v))
                .unwrap_or(defaults.enable_runtime_endpoint),
            workspace_root: vars
                .get("BITK_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
            max_concurrent: vars
                .get("BITK_MAX_CONCURRENT")
                .and_then(|v| v.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_concurrent),
        }
    }

    /// Sibling files SQLite may have created next to the database.
    pub fn db_sidecar_paths(&self) -> Vec<PathBuf> {
        ["-wal", "-shm", "-journal"]
            .iter()
            .map(|suffix| {
                let mut s = self.db_path.as_os_str().to_os_string();
                s.push(suffix);
                PathBuf::from(s)
            })
            .collect()
    }
}

fn parse_bool(v: &str) -> bool {
    matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::from_vars(HashMap::new());
        assert_eq!(config.db_path, PathBuf::from("data/bitk.db"));
        assert_eq!(config.log_level, "info");
        assert_eq!(config.service_name, "bitk");
        assert!(!config.enable_runtime_endpoint);
        assert_eq!(config.max_concurrent, 4);
    }

    #[test]
    fn env_overrides_apply() {
        let mut vars = HashMap::new();
        vars.insert("DB_PATH".to_string(), "/tmp/x.db".to_string());
        vars.insert("LOG_LEVEL".to_string(), "debug".to_string());
        vars.insert("ENABLE_RUNTIME_ENDPOINT".to_string(), "true".to_string());
        vars.insert("BITK_MAX_CONCURRENT".to_string(), "8".to_string());
        let config = Config::from_vars(vars);
        assert_eq!(config.db_path, PathBuf::from("/tmp/x.db"));
        assert_eq!(config.log_level, "debug");
        assert!(config.enable_runtime_endpoint);
        assert_eq!(config.max_concurrent, 8);
    }

    #[test]
    fn zero_concurrency_falls_back_to_default() {
        let mut vars = HashMap::new();
        vars.insert("BITK_MAX_CONCURRENT".to_string(), "0".to_string());
        assert_eq!(Config::from_vars(vars).max_concurrent, 4);
    }

    #[test]
    fn sidecar_paths_cover_wal_shm_journal() {
        let mut vars = HashMap::new();
        vars.insert("DB_PATH".to_string(), "/data/app.db".to_string());
        let config = Config::from_vars(vars);
        let paths = config.db_sidecar_paths();
        assert_eq!(paths.len(), 3);
        assert!(paths.contains(&PathBuf::from("/data/app.db-wal")));
        assert!(paths.contains(&PathBuf::from("/data/app.db-shm")));
        assert!(paths.contains(&PathBuf::from("/data/app.db-journal")));
    }

    #[test]
    fn bool_parsing_accepts_common_forms() {
        assert!(parse_bool("1"));
        assert!(parse_bool("TRUE"));
        assert!(parse_bool("yes"));
        assert!(!parse_bool("0"));
        assert!(!parse_bool("off"));
    }
}
