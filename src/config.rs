use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::providers::appveyor::AppVeyorClient;
use crate::providers::azure::AzurePipelinesClient;
use crate::providers::circleci::CircleCiClient;
use crate::providers::github::GitHubClient;
use crate::providers::gitlab::GitLabClient;
use crate::providers::travis::TravisClient;
use crate::providers::{CiProvider, SourceProvider};
use crate::ratelimit::RateLimiter;

const CONFIG_DIR: &str = "ciwatch";
const CONFIG_FILENAME: &str = "ciwatch.toml";

const DEFAULT_RPS: f64 = 10.0;
const TRAVIS_DEFAULT_RPS: f64 = 20.0;

/// Configuration file structure for ciwatch.
///
/// One `[[providers.<vendor>]]` array entry per provider instance, so a
/// user can watch e.g. both travis-ci.org and travis-ci.com.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub providers: ProvidersConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub github: Vec<GitHubConfig>,
    #[serde(default)]
    pub gitlab: Vec<GitLabConfig>,
    #[serde(default)]
    pub travis: Vec<TravisConfig>,
    #[serde(default)]
    pub circleci: Vec<TokenConfig>,
    #[serde(default)]
    pub appveyor: Vec<TokenConfig>,
    #[serde(default)]
    pub azure: Vec<TokenConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GitHubConfig {
    pub name: Option<String>,
    pub token: Option<String>,
    pub max_requests_per_second: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GitLabConfig {
    pub name: Option<String>,
    /// Base URL of the instance; defaults to https://gitlab.com.
    pub url: Option<String>,
    pub token: Option<String>,
    pub max_requests_per_second: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TravisConfig {
    pub name: Option<String>,
    /// `"org"`, `"com"`, or a full API URL.
    pub url: Option<String>,
    pub token: Option<String>,
    pub max_requests_per_second: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenConfig {
    pub name: Option<String>,
    pub token: Option<String>,
    pub max_requests_per_second: Option<f64>,
}

impl Default for Config {
    fn default() -> Self {
        // Every vendor enabled, unauthenticated: the out-of-the-box
        // behavior when no configuration file exists.
        Self {
            providers: ProvidersConfig {
                github: vec![GitHubConfig::default()],
                gitlab: vec![GitLabConfig::default()],
                travis: vec![
                    TravisConfig {
                        url: Some("org".to_string()),
                        ..TravisConfig::default()
                    },
                    TravisConfig {
                        url: Some("com".to_string()),
                        ..TravisConfig::default()
                    },
                ],
                circleci: vec![TokenConfig::default()],
                appveyor: vec![TokenConfig::default()],
                azure: vec![TokenConfig::default()],
            },
        }
    }
}

impl Config {
    /// XDG location of the configuration file.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILENAME))
    }

    /// Load configuration from the XDG location, or from `path` when set.
    ///
    /// A missing file yields `(defaults, false)`; the caller warns about
    /// running unauthenticated.
    pub fn load(path: Option<&Path>) -> Result<(Self, bool)> {
        let candidate = match path {
            Some(p) => Some(p.to_path_buf()),
            None => Self::default_path(),
        };

        match candidate {
            Some(p) if p.exists() => Ok((Self::load_from_path(&p)?, true)),
            _ => Ok((Self::default(), false)),
        }
    }

    fn load_from_path(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML config: {}", path.display()))
    }

    /// True when some GitLab entry has no API token; job listings on
    /// GitLab are unavailable without one.
    pub fn gitlab_missing_token(&self) -> bool {
        self.providers
            .gitlab
            .iter()
            .any(|g| g.token.as_deref().unwrap_or_default().is_empty())
    }
}

impl ProvidersConfig {
    /// Instantiates every configured provider. Ids are `<vendor>-<index>`
    /// so that two instances of the same vendor stay distinct.
    pub fn build(
        &self,
    ) -> Result<(Vec<Arc<dyn SourceProvider>>, Vec<Arc<dyn CiProvider>>)> {
        let mut source: Vec<Arc<dyn SourceProvider>> = Vec::new();
        let mut ci: Vec<Arc<dyn CiProvider>> = Vec::new();

        for (i, conf) in self.github.iter().enumerate() {
            let client = Arc::new(GitHubClient::new(
                format!("github-{i}"),
                conf.name.clone().unwrap_or_else(|| "github".to_string()),
                conf.token.clone(),
                RateLimiter::per_second(conf.max_requests_per_second, DEFAULT_RPS),
            )?);
            source.push(client.clone());
            ci.push(client);
        }

        for (i, conf) in self.gitlab.iter().enumerate() {
            let client = Arc::new(GitLabClient::new(
                format!("gitlab-{i}"),
                conf.name.clone().unwrap_or_else(|| "gitlab".to_string()),
                conf.url.as_deref(),
                conf.token.clone(),
                RateLimiter::per_second(conf.max_requests_per_second, DEFAULT_RPS),
            )?);
            source.push(client.clone());
            ci.push(client);
        }

        for (i, conf) in self.travis.iter().enumerate() {
            ci.push(Arc::new(TravisClient::new(
                format!("travis-{i}"),
                conf.name.clone().unwrap_or_else(|| "travis".to_string()),
                conf.url.as_deref().unwrap_or("org"),
                conf.token.clone(),
                RateLimiter::per_second(conf.max_requests_per_second, TRAVIS_DEFAULT_RPS),
            )?));
        }

        for (i, conf) in self.circleci.iter().enumerate() {
            ci.push(Arc::new(CircleCiClient::new(
                format!("circleci-{i}"),
                conf.name.clone().unwrap_or_else(|| "circleci".to_string()),
                conf.token.clone(),
                RateLimiter::per_second(conf.max_requests_per_second, DEFAULT_RPS),
            )?));
        }

        for (i, conf) in self.appveyor.iter().enumerate() {
            ci.push(Arc::new(AppVeyorClient::new(
                format!("appveyor-{i}"),
                conf.name.clone().unwrap_or_else(|| "appveyor".to_string()),
                conf.token.clone(),
                RateLimiter::per_second(conf.max_requests_per_second, DEFAULT_RPS),
            )?));
        }

        for (i, conf) in self.azure.iter().enumerate() {
            ci.push(Arc::new(AzurePipelinesClient::new(
                format!("azure-{i}"),
                conf.name.clone().unwrap_or_else(|| "azure".to_string()),
                conf.token.clone(),
                RateLimiter::per_second(conf.max_requests_per_second, DEFAULT_RPS),
            )?));
        }

        Ok((source, ci))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_default_config_enables_every_vendor() {
        let config = Config::default();
        let (source, ci) = config.providers.build().unwrap();
        // github + gitlab resolve refs; six CI instances (travis twice).
        assert_eq!(source.len(), 2);
        assert_eq!(ci.len(), 7);
        assert!(config.gitlab_missing_token());
    }

    #[tokio::test]
    async fn test_load_toml_config() {
        let mut temp_file = NamedTempFile::new().unwrap();
        let toml_content = r#"
[[providers.gitlab]]
name = "work gitlab"
url = "https://gitlab.example.com"
token = "glpat-test-token"
max_requests_per_second = 2.5

[[providers.travis]]
url = "com"
token = "travis-token"

[[providers.github]]
token = "ghp-token"
"#;
        write!(temp_file, "{toml_content}").unwrap();

        let (config, found) = Config::load(Some(temp_file.path())).unwrap();
        assert!(found);
        assert_eq!(config.providers.gitlab.len(), 1);
        assert_eq!(
            config.providers.gitlab[0].name.as_deref(),
            Some("work gitlab")
        );
        assert_eq!(
            config.providers.gitlab[0].url.as_deref(),
            Some("https://gitlab.example.com")
        );
        assert_eq!(config.providers.gitlab[0].max_requests_per_second, Some(2.5));
        assert_eq!(config.providers.travis[0].url.as_deref(), Some("com"));
        assert!(!config.gitlab_missing_token());

        let (source, ci) = config.providers.build().unwrap();
        assert_eq!(source.len(), 2);
        assert_eq!(ci.len(), 3);
    }

    #[test]
    fn test_load_missing_file_falls_back_to_defaults() {
        let (config, found) = Config::load(Some(Path::new("/nonexistent/ciwatch.toml"))).unwrap();
        assert!(!found);
        assert_eq!(config.providers.github.len(), 1);
        assert_eq!(config.providers.travis.len(), 2);
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        let mut temp_file = NamedTempFile::new().unwrap();
        write!(temp_file, "providers = 3").unwrap();
        assert!(Config::load(Some(temp_file.path())).is_err());
    }

    #[tokio::test]
    async fn test_provider_ids_are_indexed_per_vendor() {
        let mut config = Config::default();
        config.providers.gitlab.push(GitLabConfig::default());
        let (_, ci) = config.providers.build().unwrap();
        let ids: Vec<&str> = ci.iter().map(|p| p.id()).collect();
        assert!(ids.contains(&"gitlab-0"));
        assert!(ids.contains(&"gitlab-1"));
        assert!(ids.contains(&"travis-1"));
    }
}
