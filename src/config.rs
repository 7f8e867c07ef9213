use anyhow::Context;
use std::env;
use std::path::PathBuf;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://flashdeck.db?mode=rwc";
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8080";

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: String,
    pub assets_dir: PathBuf,
    /// Empty means anyone may sign in.
    pub allowed_users: Vec<String>,
    pub default_batch_size: usize,
    pub max_batch_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            assets_dir: PathBuf::from("assets"),
            allowed_users: Vec::new(),
            default_batch_size: 5,
            max_batch_size: 50,
        }
    }
}

impl Config {
    /// Reads settings from the process environment. Call after `dotenvy::dotenv()`.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Config::default();

        let default_batch_size = match lookup("DEFAULT_BATCH_SIZE") {
            Some(v) => v
                .trim()
                .parse()
                .with_context(|| format!("DEFAULT_BATCH_SIZE is not a number: {:?}", v))?,
            None => defaults.default_batch_size,
        };
        let max_batch_size = match lookup("MAX_BATCH_SIZE") {
            Some(v) => v
                .trim()
                .parse()
                .with_context(|| format!("MAX_BATCH_SIZE is not a number: {:?}", v))?,
            None => defaults.max_batch_size,
        };

        Ok(Self {
            database_url: lookup("DATABASE_URL").unwrap_or(defaults.database_url),
            bind_addr: lookup("BIND_ADDR").unwrap_or(defaults.bind_addr),
            assets_dir: lookup("ASSETS_DIR").map(PathBuf::from).unwrap_or(defaults.assets_dir),
            allowed_users: parse_allowed_users(&lookup("ALLOWED_USERS").unwrap_or_default()),
            default_batch_size,
            max_batch_size,
        })
    }

    /// Resolves a client-requested batch size against the configured default and cap.
    pub fn batch_size(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_batch_size)
            .min(self.max_batch_size)
    }
}

fn parse_allowed_users(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|email| !email.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = Config::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(config.bind_addr, DEFAULT_BIND_ADDR);
        assert!(config.allowed_users.is_empty());
        assert_eq!(config.default_batch_size, 5);
    }

    #[test]
    fn test_allowed_users_are_trimmed() {
        let config = Config::from_lookup(lookup_from(&[(
            "ALLOWED_USERS",
            " a@example.com, ,b@example.com ",
        )]))
        .unwrap();
        assert_eq!(config.allowed_users, vec!["a@example.com", "b@example.com"]);
    }

    #[test]
    fn test_bad_number_fails() {
        let err = Config::from_lookup(lookup_from(&[("MAX_BATCH_SIZE", "lots")])).unwrap_err();
        assert!(err.to_string().contains("MAX_BATCH_SIZE"));
    }

    #[test]
    fn test_batch_size_is_clamped() {
        let config = Config::default();
        assert_eq!(config.batch_size(None), 5);
        assert_eq!(config.batch_size(Some(7)), 7);
        assert_eq!(config.batch_size(Some(1_000)), 50);
    }
}
