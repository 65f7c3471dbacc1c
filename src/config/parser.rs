use crate::config::types::Config;
use crate::config::validation::validate;
use crate::ConfigError;
use reqwest::header::HeaderValue;
use sha2::{Digest, Sha256};
use std::path::Path;

/// Loads and parses a configuration file from the given path
///
/// # Arguments
///
/// * `path` - Path to the TOML configuration file
///
/// # Returns
///
/// * `Ok(Config)` - Successfully loaded and validated configuration
/// * `Err(ConfigError)` - Failed to load, parse, or validate the configuration
///
/// # Example
///
/// ```no_run
/// use std::path::Path;
/// use social_crawler::config::load_config;
///
/// let config = load_config(Path::new("crawler.toml")).unwrap();
/// println!("Seeds: {}", config.seeds.len());
/// ```
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    parse_config(&content)
}

/// Parses and validates configuration text
///
/// Besides the field rules, the assembled `User-Agent` must be sendable as
/// an HTTP header, so a bad version string fails here rather than on the
/// first request.
pub fn parse_config(content: &str) -> Result<Config, ConfigError> {
    let config: Config = toml::from_str(content)?;
    validate(&config)?;
    check_user_agent_header(&config)?;
    Ok(config)
}

fn check_user_agent_header(config: &Config) -> Result<(), ConfigError> {
    let value = config.user_agent.header_value();
    HeaderValue::from_str(&value).map_err(|_| {
        ConfigError::Validation(format!(
            "user-agent {:?} is not a valid HTTP header value",
            value
        ))
    })?;
    Ok(())
}

fn content_hash(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

/// Computes a SHA-256 hash of the configuration file content
///
/// The runner logs it so that crawl logs can be matched to the exact
/// configuration they ran with.
pub fn compute_config_hash(path: &Path) -> Result<String, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    Ok(content_hash(&content))
}

/// Loads a configuration and returns both the config and its hash
///
/// The file is read once, so the hash always describes the text that was
/// parsed even if the file changes underneath.
pub fn load_config_with_hash(path: &Path) -> Result<(Config, String), ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let config = parse_config(&content)?;
    Ok((config, content_hash(&content)))
}
