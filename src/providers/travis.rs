use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::Deserialize;
use url::Url;

use crate::error::{CiwatchError, Result};
use crate::models::{Pipeline, PipelineKey, State, Step};
use crate::ratelimit::RateLimiter;

use super::{send_with_retry, slug_for_host, CiProvider};

pub const ORG_URL: &str = "https://api.travis-ci.org";
pub const COM_URL: &str = "https://api.travis-ci.com";

/// Travis CI client against the v3 API (travis-ci.org, travis-ci.com or
/// an enterprise instance).
pub struct TravisClient {
    id: String,
    name: String,
    client: reqwest::Client,
    api_url: Url,
    limiter: RateLimiter,
}

impl TravisClient {
    /// `endpoint` accepts the shorthands `"org"` and `"com"` as well as a
    /// full API URL.
    pub fn new(
        id: String,
        name: String,
        endpoint: &str,
        token: Option<String>,
        limiter: RateLimiter,
    ) -> Result<Self> {
        let api = match endpoint.to_lowercase().as_str() {
            "org" | "" => ORG_URL,
            "com" => COM_URL,
            _ => endpoint,
        };
        let mut api_url = Url::parse(api)
            .map_err(|e| CiwatchError::Config(format!("Invalid Travis URL '{endpoint}': {e}")))?;
        // Endpoints are joined by formatting, so the path must end in '/'.
        if !api_url.path().ends_with('/') {
            let path = format!("{}/", api_url.path());
            api_url.set_path(&path);
        }

        let mut headers = HeaderMap::new();
        headers.insert("Travis-API-Version", HeaderValue::from_static("3"));
        if let Some(token) = token.filter(|t| !t.is_empty()) {
            let value = HeaderValue::from_str(&format!("token {token}"))
                .map_err(|e| CiwatchError::Config(format!("invalid travis token: {e}")))?;
            headers.insert(AUTHORIZATION, value);
        }

        let client = reqwest::Client::builder()
            .user_agent(concat!("ciwatch/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| CiwatchError::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            id,
            name,
            client,
            api_url,
            limiter,
        })
    }

    /// Web host, e.g. `travis-ci.org` for `api.travis-ci.org`.
    fn web_host(&self) -> String {
        let host = self.api_url.host_str().unwrap_or("travis-ci.org");
        host.strip_prefix("api.").unwrap_or(host).to_string()
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = send_with_retry(&self.name, &self.limiter, self.client.get(url)).await?;
        Ok(response.json().await?)
    }

    fn translate_build(&self, build: TravisBuild, slug: &str) -> Pipeline {
        let children = build
            .jobs
            .into_iter()
            .map(|job| Step {
                id: job.id.to_string(),
                // Travis jobs carry no names, only numbers like "42.1".
                name: job.number.unwrap_or_else(|| job.id.to_string()),
                state: build_state(&job.state.unwrap_or_default()),
                allow_failure: job.allow_failure.unwrap_or(false),
                started_at: job.started_at,
                finished_at: job.finished_at,
                web_url: Some(format!(
                    "https://{}/{}/jobs/{}",
                    self.web_host(),
                    slug,
                    job.id
                )),
                children: Vec::new(),
                ..Step::default()
            })
            .collect();

        Pipeline {
            key: PipelineKey::new(self.id.clone(), build.id.to_string()),
            provider_name: self.name.clone(),
            git_ref: build.branch.map(|b| b.name).unwrap_or_default(),
            commit_sha: build.commit.as_ref().map(|c| c.sha.clone()).unwrap_or_default(),
            number: build.number.clone().unwrap_or_default(),
            updated_at: build.updated_at.unwrap_or_else(Utc::now),
            step: Step {
                id: build.id.to_string(),
                name: build
                    .commit
                    .and_then(|c| c.message)
                    .and_then(|m| m.lines().next().map(str::to_string))
                    .unwrap_or_else(|| format!("#{}", build.number.unwrap_or_default())),
                state: build_state(&build.state.unwrap_or_default()),
                started_at: build.started_at,
                finished_at: build.finished_at,
                web_url: Some(format!(
                    "https://{}/{}/builds/{}",
                    self.web_host(),
                    slug,
                    build.id
                )),
                children,
                ..Step::default()
            },
        }
    }

    /// `https://travis-ci.{org,com}/{owner}/{repo}/builds/{id}` → (slug, id)
    fn parse_build_url(&self, url: &str) -> Option<(String, u64)> {
        let parsed = Url::parse(url).ok()?;
        if parsed.host_str()? != self.web_host() {
            return None;
        }
        let segments: Vec<&str> = parsed.path_segments()?.collect();
        match segments.as_slice() {
            [owner, repo, "builds", id] => Some((format!("{owner}/{repo}"), id.parse().ok()?)),
            _ => None,
        }
    }
}

#[async_trait]
impl CiProvider for TravisClient {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn host(&self) -> &str {
        self.api_url.host_str().unwrap_or("travis-ci.org")
    }

    async fn build_from_url(&self, url: &str) -> Result<Pipeline> {
        let (slug, id) = self
            .parse_build_url(url)
            .ok_or_else(|| CiwatchError::UnknownUrl(url.to_string()))?;
        let build: TravisBuild = self
            .get_json(&format!("{}build/{id}?include=build.jobs", self.api_url))
            .await?;
        Ok(self.translate_build(build, &slug))
    }

    async fn pipelines(&self, repository_url: &str, sha: &str) -> Result<Vec<Pipeline>> {
        // Travis builds are hosted for GitHub repositories.
        let slug = slug_for_host(repository_url, "github.com")?;
        let url = format!(
            "{}repo/{}/builds?include=build.jobs&limit=100&sort_by=id:desc",
            self.api_url,
            slug.replace('/', "%2F")
        );
        let response: BuildsResponse = self.get_json(&url).await?;

        let pipelines: Vec<Pipeline> = response
            .builds
            .into_iter()
            .filter(|b| b.commit.as_ref().is_some_and(|c| c.sha == sha))
            .map(|b| self.translate_build(b, &slug))
            .collect();
        debug!(
            "{}: {} build(s) for sha {}",
            self.name,
            pipelines.len(),
            &sha[..sha.len().min(8)]
        );
        Ok(pipelines)
    }

    async fn log(&self, _key: &PipelineKey, step_path: &[String]) -> Result<String> {
        let [job_id] = step_path else {
            return Err(CiwatchError::NoLogHere);
        };
        let url = format!("{}job/{job_id}/log.txt", self.api_url);
        let response = send_with_retry(&self.name, &self.limiter, self.client.get(&url)).await?;
        Ok(response.text().await?)
    }
}

fn build_state(state: &str) -> State {
    match state {
        "created" | "queued" | "received" => State::Pending,
        "started" => State::Running,
        "passed" => State::Passed,
        "failed" | "errored" => State::Failed,
        "canceled" => State::Canceled,
        _ => State::Unknown,
    }
}

#[derive(Debug, Deserialize)]
struct BuildsResponse {
    builds: Vec<TravisBuild>,
}

#[derive(Debug, Deserialize)]
struct TravisBuild {
    id: u64,
    number: Option<String>,
    state: Option<String>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    branch: Option<TravisBranch>,
    commit: Option<TravisCommit>,
    #[serde(default)]
    jobs: Vec<TravisJob>,
}

#[derive(Debug, Deserialize)]
struct TravisBranch {
    name: String,
}

#[derive(Debug, Deserialize)]
struct TravisCommit {
    sha: String,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TravisJob {
    id: u64,
    number: Option<String>,
    state: Option<String>,
    #[serde(default)]
    allow_failure: Option<bool>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}
