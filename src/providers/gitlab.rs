use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use serde::Deserialize;
use url::Url;

use crate::error::{CiwatchError, Result};
use crate::models::{Commit, Pipeline, PipelineKey, State, Step};
use crate::ratelimit::RateLimiter;

use super::{http_client, send_with_retry, slug_for_host, CiProvider, SourceProvider};

/// GitLab client: source provider and CI provider against the REST API
/// of one GitLab instance (gitlab.com or self-hosted).
pub struct GitLabClient {
    id: String,
    name: String,
    client: reqwest::Client,
    base_url: Url,
    token: Option<String>,
    limiter: RateLimiter,
    /// Pipeline id → URL-encoded project slug, for job trace endpoints.
    projects: Mutex<HashMap<String, String>>,
}

impl GitLabClient {
    pub fn new(
        id: String,
        name: String,
        base_url: Option<&str>,
        token: Option<String>,
        limiter: RateLimiter,
    ) -> Result<Self> {
        let base = base_url.filter(|u| !u.is_empty()).unwrap_or("https://gitlab.com");
        let mut base_url = Url::parse(base)
            .map_err(|e| CiwatchError::Config(format!("Invalid GitLab base URL: {e}")))?;
        // API paths are joined by formatting, so the path must end in '/'.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Ok(Self {
            id,
            name,
            client: http_client()?,
            base_url,
            token: token.filter(|t| !t.is_empty()),
            limiter,
            projects: Mutex::new(HashMap::new()),
        })
    }

    fn host(&self) -> &str {
        self.base_url.host_str().unwrap_or("gitlab.com")
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}api/v4/{path}", self.base_url)
    }

    fn auth_request(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(token) = &self.token {
            request.header("PRIVATE-TOKEN", token)
        } else {
            request
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let request = self.auth_request(self.client.get(url));
        let response = send_with_retry(&self.name, &self.limiter, request).await?;
        Ok(response.json().await?)
    }

    fn encoded_slug(&self, repository_url: &str) -> Result<String> {
        let slug = slug_for_host(repository_url, self.host())?;
        Ok(slug.replace('/', "%2F"))
    }

    async fn fetch_pipeline(&self, project: &str, id: u64) -> Result<Pipeline> {
        let detail: GitLabPipelineDetail = self
            .get_json(&self.api_url(&format!("projects/{project}/pipelines/{id}")))
            .await?;
        let jobs: Vec<GitLabJob> = self
            .get_json(&self.api_url(&format!(
                "projects/{project}/pipelines/{id}/jobs?per_page=100"
            )))
            .await?;

        self.projects
            .lock()
            .expect("project map poisoned")
            .insert(id.to_string(), project.to_string());

        Ok(self.translate_pipeline(detail, jobs))
    }

    fn translate_pipeline(&self, detail: GitLabPipelineDetail, jobs: Vec<GitLabJob>) -> Pipeline {
        // Jobs arrive flat; the stage field groups them, in job order.
        let mut stages: Vec<Step> = Vec::new();
        for job in jobs {
            let step = Step {
                id: job.id.to_string(),
                name: job.name,
                state: job_state(&job.status),
                allow_failure: job.allow_failure,
                created_at: job.created_at,
                started_at: job.started_at,
                finished_at: job.finished_at,
                web_url: job.web_url,
                children: Vec::new(),
            };
            match stages.iter_mut().find(|s| s.id == job.stage) {
                Some(stage) => stage.children.push(step),
                None => stages.push(Step {
                    id: job.stage.clone(),
                    name: job.stage,
                    children: vec![step],
                    ..Step::default()
                }),
            }
        }
        for stage in &mut stages {
            stage.normalize();
        }

        Pipeline {
            key: PipelineKey::new(self.id.clone(), detail.id.to_string()),
            provider_name: self.name.clone(),
            git_ref: detail.ref_name.unwrap_or_default(),
            commit_sha: detail.sha,
            number: detail.iid.map(|iid| iid.to_string()).unwrap_or_default(),
            updated_at: detail.updated_at,
            step: Step {
                id: detail.id.to_string(),
                name: format!("#{}", detail.id),
                state: job_state(&detail.status),
                created_at: detail.created_at,
                started_at: detail.started_at,
                finished_at: detail.finished_at,
                web_url: detail.web_url,
                children: stages,
                ..Step::default()
            },
        }
    }
}

#[async_trait]
impl SourceProvider for GitLabClient {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn commit(&self, repository_url: &str, reference: &str) -> Result<Commit> {
        let project = self.encoded_slug(repository_url)?;
        let url = self.api_url(&format!("projects/{project}/repository/commits/{reference}"));
        let commit: GitLabCommit = match self.get_json(&url).await {
            Ok(commit) => commit,
            Err(CiwatchError::Api { status: 404, .. }) => {
                return Err(CiwatchError::UnknownRef(reference.to_string()));
            }
            Err(err) => return Err(err),
        };

        Ok(Commit {
            sha: commit.id,
            message: commit.message,
            author_date: commit.authored_date,
            committed_date: commit.committed_date,
            branches: Vec::new(),
            tags: Vec::new(),
        })
    }

    async fn references(&self, repository_url: &str) -> Result<Vec<String>> {
        let project = self.encoded_slug(repository_url)?;
        let branches: Vec<NamedRef> = self
            .get_json(&self.api_url(&format!(
                "projects/{project}/repository/branches?per_page=100"
            )))
            .await?;
        let tags: Vec<NamedRef> = self
            .get_json(&self.api_url(&format!(
                "projects/{project}/repository/tags?per_page=100"
            )))
            .await?;

        Ok(branches.into_iter().chain(tags).map(|r| r.name).collect())
    }
}

#[async_trait]
impl CiProvider for GitLabClient {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn host(&self) -> &str {
        GitLabClient::host(self)
    }

    async fn build_from_url(&self, url: &str) -> Result<Pipeline> {
        let (slug, id) = self
            .parse_pipeline_url(url)
            .ok_or_else(|| CiwatchError::UnknownUrl(url.to_string()))?;
        self.fetch_pipeline(&slug.replace('/', "%2F"), id).await
    }

    async fn pipelines(&self, repository_url: &str, sha: &str) -> Result<Vec<Pipeline>> {
        let project = self.encoded_slug(repository_url)?;
        let url = self.api_url(&format!("projects/{project}/pipelines?sha={sha}&per_page=100"));
        let summaries: Vec<GitLabPipelineSummary> = self.get_json(&url).await?;
        debug!(
            "{}: {} pipeline(s) for sha {}",
            self.name,
            summaries.len(),
            &sha[..sha.len().min(8)]
        );

        let mut pipelines = Vec::with_capacity(summaries.len());
        for summary in summaries {
            pipelines.push(self.fetch_pipeline(&project, summary.id).await?);
        }
        Ok(pipelines)
    }

    async fn log(&self, key: &PipelineKey, step_path: &[String]) -> Result<String> {
        // Traces exist per job; a path of [stage, job] addresses one.
        let [_stage, job_id] = step_path else {
            return Err(CiwatchError::NoLogHere);
        };
        let project = self
            .projects
            .lock()
            .expect("project map poisoned")
            .get(&key.id)
            .cloned()
            .ok_or(CiwatchError::NoLogHere)?;
        let url = self.api_url(&format!("projects/{project}/jobs/{job_id}/trace"));
        let request = self.auth_request(self.client.get(&url));
        let response = send_with_retry(&self.name, &self.limiter, request).await?;
        Ok(response.text().await?)
    }
}

impl GitLabClient {
    /// `https://{host}/{group}/{project}/-/pipelines/{id}` → (slug, id)
    fn parse_pipeline_url(&self, url: &str) -> Option<(String, u64)> {
        let parsed = Url::parse(url).ok()?;
        if parsed.host_str()? != self.host() {
            return None;
        }
        let segments: Vec<&str> = parsed.path_segments()?.collect();
        let dash = segments.iter().position(|s| *s == "-")?;
        if segments.get(dash + 1) != Some(&"pipelines") {
            return None;
        }
        let id: u64 = segments.get(dash + 2)?.parse().ok()?;
        Some((segments[..dash].join("/"), id))
    }
}

fn job_state(status: &str) -> State {
    match status {
        "created" | "pending" | "preparing" | "waiting_for_resource" | "scheduled" => {
            State::Pending
        }
        "running" => State::Running,
        "success" => State::Passed,
        "failed" => State::Failed,
        "canceled" => State::Canceled,
        "skipped" => State::Skipped,
        "manual" => State::Manual,
        _ => State::Unknown,
    }
}

#[derive(Debug, Deserialize)]
struct GitLabCommit {
    id: String,
    message: String,
    authored_date: Option<DateTime<Utc>>,
    committed_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct NamedRef {
    name: String,
}

#[derive(Debug, Deserialize)]
struct GitLabPipelineSummary {
    id: u64,
}

#[derive(Debug, Deserialize)]
struct GitLabPipelineDetail {
    id: u64,
    iid: Option<u64>,
    #[serde(rename = "ref")]
    ref_name: Option<String>,
    sha: String,
    status: String,
    created_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
    web_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GitLabJob {
    id: u64,
    name: String,
    stage: String,
    status: String,
    #[serde(default)]
    allow_failure: bool,
    created_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    web_url: Option<String>,
}
