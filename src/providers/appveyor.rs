use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use serde::Deserialize;
use url::Url;

use crate::error::{CiwatchError, Result};
use crate::models::{Pipeline, PipelineKey, State, Step};
use crate::ratelimit::RateLimiter;

use super::{http_client, send_with_retry, slug_for_host, CiProvider};

const API_URL: &str = "https://ci.appveyor.com/api";
const HOST: &str = "ci.appveyor.com";

/// AppVeyor client for GitHub-hosted repositories. The AppVeyor account
/// and project names are assumed to match the repository slug.
pub struct AppVeyorClient {
    id: String,
    name: String,
    client: reqwest::Client,
    token: Option<String>,
    limiter: RateLimiter,
}

impl AppVeyorClient {
    pub fn new(id: String, name: String, token: Option<String>, limiter: RateLimiter) -> Result<Self> {
        Ok(Self {
            id,
            name,
            client: http_client()?,
            token: token.filter(|t| !t.is_empty()),
            limiter,
        })
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let mut request = self.client.get(url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = send_with_retry(&self.name, &self.limiter, request).await?;
        Ok(response.json().await?)
    }

    async fn fetch_build(&self, slug: &str, version: &str) -> Result<Pipeline> {
        let detail: ProjectBuildResponse = self
            .get(&format!("{API_URL}/projects/{slug}/build/{version}"))
            .await?;
        Ok(self.translate_build(detail.build, slug))
    }

    fn translate_build(&self, build: AppVeyorBuild, slug: &str) -> Pipeline {
        let children = build
            .jobs
            .iter()
            .map(|job| Step {
                id: job.job_id.clone(),
                name: if job.name.is_empty() {
                    job.job_id.clone()
                } else {
                    job.name.clone()
                },
                state: build_state(&job.status),
                allow_failure: job.allow_failure,
                created_at: job.created,
                started_at: job.started,
                finished_at: job.finished,
                ..Step::default()
            })
            .collect();

        let updated_at = build
            .updated
            .or(build.finished)
            .or(build.started)
            .or(build.created)
            .unwrap_or_else(Utc::now);

        Pipeline {
            key: PipelineKey::new(self.id.clone(), build.build_id.to_string()),
            provider_name: self.name.clone(),
            git_ref: build.branch.clone().unwrap_or_default(),
            commit_sha: build.commit_id.clone().unwrap_or_default(),
            number: build.build_number.map(|n| n.to_string()).unwrap_or_default(),
            updated_at,
            step: Step {
                id: build.build_id.to_string(),
                name: build.message.unwrap_or_else(|| build.version.clone()),
                state: build_state(&build.status),
                created_at: build.created,
                started_at: build.started,
                finished_at: build.finished,
                web_url: Some(format!(
                    "https://{HOST}/project/{slug}/builds/{}",
                    build.build_id
                )),
                children,
                ..Step::default()
            },
        }
    }
}

#[async_trait]
impl CiProvider for AppVeyorClient {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn host(&self) -> &str {
        HOST
    }

    async fn build_from_url(&self, url: &str) -> Result<Pipeline> {
        let (slug, build_id) =
            parse_build_url(url).ok_or_else(|| CiwatchError::UnknownUrl(url.to_string()))?;
        // The API addresses builds by version, so resolve through history.
        let history: HistoryResponse = self
            .get(&format!(
                "{API_URL}/projects/{slug}/history?recordsNumber=100"
            ))
            .await?;
        let version = history
            .builds
            .into_iter()
            .find(|b| b.build_id == build_id)
            .map(|b| b.version)
            .ok_or_else(|| CiwatchError::UnknownUrl(url.to_string()))?;
        self.fetch_build(&slug, &version).await
    }

    async fn pipelines(&self, repository_url: &str, sha: &str) -> Result<Vec<Pipeline>> {
        let slug = slug_for_host(repository_url, "github.com")?;
        let history: HistoryResponse = self
            .get(&format!(
                "{API_URL}/projects/{slug}/history?recordsNumber=100"
            ))
            .await?;

        let matching: Vec<String> = history
            .builds
            .into_iter()
            .filter(|b| b.commit_id.as_deref() == Some(sha))
            .map(|b| b.version)
            .collect();
        debug!(
            "{}: {} build(s) for sha {}",
            self.name,
            matching.len(),
            &sha[..sha.len().min(8)]
        );

        let mut pipelines = Vec::with_capacity(matching.len());
        for version in matching {
            pipelines.push(self.fetch_build(&slug, &version).await?);
        }
        Ok(pipelines)
    }

    async fn log(&self, _key: &PipelineKey, step_path: &[String]) -> Result<String> {
        let [job_id] = step_path else {
            return Err(CiwatchError::NoLogHere);
        };
        let url = format!("{API_URL}/buildjobs/{job_id}/log");
        let mut request = self.client.get(&url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = send_with_retry(&self.name, &self.limiter, request).await?;
        Ok(response.text().await?)
    }
}

fn build_state(status: &str) -> State {
    match status {
        "queued" | "starting" => State::Pending,
        "running" => State::Running,
        "success" => State::Passed,
        "failed" => State::Failed,
        "cancelled" | "cancelling" => State::Canceled,
        _ => State::Unknown,
    }
}

/// `https://ci.appveyor.com/project/{account}/{slug}/builds/{id}` → (slug, id)
fn parse_build_url(url: &str) -> Option<(String, u64)> {
    let parsed = Url::parse(url).ok()?;
    if parsed.host_str()? != HOST {
        return None;
    }
    let segments: Vec<&str> = parsed.path_segments()?.collect();
    match segments.as_slice() {
        ["project", account, project, "builds", id] => {
            Some((format!("{account}/{project}"), id.parse().ok()?))
        }
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    builds: Vec<AppVeyorBuild>,
}

#[derive(Debug, Deserialize)]
struct ProjectBuildResponse {
    build: AppVeyorBuild,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppVeyorBuild {
    build_id: u64,
    build_number: Option<u64>,
    version: String,
    message: Option<String>,
    branch: Option<String>,
    commit_id: Option<String>,
    status: String,
    created: Option<DateTime<Utc>>,
    started: Option<DateTime<Utc>>,
    finished: Option<DateTime<Utc>>,
    updated: Option<DateTime<Utc>>,
    #[serde(default)]
    jobs: Vec<AppVeyorJob>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppVeyorJob {
    job_id: String,
    #[serde(default)]
    name: String,
    status: String,
    #[serde(default)]
    allow_failure: bool,
    created: Option<DateTime<Utc>>,
    started: Option<DateTime<Utc>>,
    finished: Option<DateTime<Utc>>,
}
