use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::Context as _;
use serde::Deserialize;

const DEFAULT_MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub proxy: ProxyConfig,
    pub stubs: StubsConfig,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

impl Config {
    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let toml =
            fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml_str(&toml)
    }

    pub fn from_toml_str(toml: &str) -> anyhow::Result<Self> {
        toml.parse()
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s).context("parse config TOML")
    }
}

#[derive(Debug, Deserialize)]
pub struct ProxyConfig {
    pub listen: SocketAddr,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

#[derive(Debug, Deserialize)]
pub struct StubsConfig {
    pub responses_dir: PathBuf,
    pub matchers_file: PathBuf,
    /// Base URL of the live upstream. Absent means replay-only mode: an
    /// unmatched request is an error instead of a recording trigger.
    #[serde(default)]
    pub live_site: Option<String>,
}

impl StubsConfig {
    /// Live site base with any trailing slash removed, ready to prepend to an
    /// origin-form request target.
    pub fn live_site_base(&self) -> Option<&str> {
        self.live_site
            .as_deref()
            .map(|base| base.trim_end_matches('/'))
    }
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub format: Option<LogFormat>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

fn default_max_body_bytes() -> usize {
    DEFAULT_MAX_BODY_BYTES
}

#[cfg(test)]
mod tests {
    use super::Config;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let config = Config::from_toml_str(
            r#"
[proxy]
listen = "127.0.0.1:0"

[stubs]
responses_dir = "data/responses"
matchers_file = "data/matchers.json"
"#,
        )
        .unwrap();

        assert_eq!(config.proxy.max_body_bytes, 8 * 1024 * 1024);
        assert!(config.stubs.live_site.is_none());
        assert!(config.logging.is_none());
    }

    #[test]
    fn live_site_base_strips_trailing_slash() {
        let config = Config::from_toml_str(
            r#"
[proxy]
listen = "127.0.0.1:0"

[stubs]
responses_dir = "responses"
matchers_file = "matchers.json"
live_site = "https://api.example.com/"
"#,
        )
        .unwrap();

        assert_eq!(
            config.stubs.live_site_base(),
            Some("https://api.example.com")
        );
    }

    #[test]
    fn missing_stubs_section_is_an_error() {
        let err = Config::from_toml_str(
            r#"
[proxy]
listen = "127.0.0.1:0"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("parse config TOML"), "{err}");
    }

    #[test]
    fn invalid_listen_addr_is_an_error() {
        let result = Config::from_toml_str(
            r#"
[proxy]
listen = "not-an-addr"

[stubs]
responses_dir = "responses"
matchers_file = "matchers.json"
"#,
        );
        assert!(result.is_err());
    }
}
