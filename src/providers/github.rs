use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use serde::Deserialize;

use crate::error::{CiwatchError, Result};
use crate::models::{Commit, Pipeline, PipelineKey, State, Step};
use crate::ratelimit::RateLimiter;

use super::{send_with_retry, slug_for_host, CiProvider, SourceProvider};

const API_URL: &str = "https://api.github.com";
const HOST: &str = "github.com";

/// GitHub client: source provider (commit resolution) and CI provider
/// for GitHub Actions workflow runs.
pub struct GitHubClient {
    id: String,
    name: String,
    client: reqwest::Client,
    limiter: RateLimiter,
    /// Pipeline id → repository slug, needed to address job log endpoints.
    repositories: Mutex<HashMap<String, String>>,
}

impl GitHubClient {
    pub fn new(id: String, name: String, token: Option<String>, limiter: RateLimiter) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
        if let Some(token) = token.filter(|t| !t.is_empty()) {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| CiwatchError::Config(format!("invalid github token: {e}")))?;
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
            limiter,
            repositories: Mutex::new(HashMap::new()),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = send_with_retry(&self.name, &self.limiter, self.client.get(url)).await?;
        Ok(response.json().await?)
    }

    async fn fetch_run_jobs(&self, slug: &str, run_id: u64) -> Result<Vec<GitHubJob>> {
        let url = format!("{API_URL}/repos/{slug}/actions/runs/{run_id}/jobs?per_page=100");
        let response: JobsResponse = self.get_json(&url).await?;
        Ok(response.jobs)
    }

    fn translate_run(&self, run: GitHubWorkflowRun, jobs: Vec<GitHubJob>) -> Pipeline {
        let children = jobs
            .into_iter()
            .map(|job| {
                let steps = job
                    .steps
                    .into_iter()
                    .map(|step| Step {
                        id: step.number.to_string(),
                        name: step.name,
                        state: run_state(&step.status, step.conclusion.as_deref()),
                        started_at: step.started_at,
                        finished_at: step.completed_at,
                        ..Step::default()
                    })
                    .collect();
                Step {
                    id: job.id.to_string(),
                    name: job.name,
                    state: run_state(&job.status, job.conclusion.as_deref()),
                    started_at: job.started_at,
                    finished_at: job.completed_at,
                    web_url: job.html_url,
                    children: steps,
                    ..Step::default()
                }
            })
            .collect();

        Pipeline {
            key: PipelineKey::new(self.id.clone(), run.id.to_string()),
            provider_name: self.name.clone(),
            git_ref: run.head_branch.unwrap_or_default(),
            commit_sha: run.head_sha,
            number: run.run_number.to_string(),
            updated_at: run.updated_at,
            step: Step {
                id: run.id.to_string(),
                name: run.name.unwrap_or_else(|| "workflow".to_string()),
                state: run_state(&run.status, run.conclusion.as_deref()),
                created_at: Some(run.created_at),
                started_at: run.run_started_at,
                finished_at: run.conclusion.is_some().then_some(run.updated_at),
                web_url: Some(run.html_url),
                children,
                ..Step::default()
            },
        }
    }

    fn remember_repository(&self, pipeline_id: &str, slug: &str) {
        self.repositories
            .lock()
            .expect("repository map poisoned")
            .insert(pipeline_id.to_string(), slug.to_string());
    }

    fn repository_of(&self, pipeline_id: &str) -> Option<String> {
        self.repositories
            .lock()
            .expect("repository map poisoned")
            .get(pipeline_id)
            .cloned()
    }
}

#[async_trait]
impl SourceProvider for GitHubClient {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn commit(&self, repository_url: &str, reference: &str) -> Result<Commit> {
        let slug = slug_for_host(repository_url, HOST)?;
        let url = format!("{API_URL}/repos/{slug}/commits/{reference}");
        let commit: GitHubCommit = match self.get_json(&url).await {
            Ok(commit) => commit,
            Err(CiwatchError::Api { status, .. }) if status == 404 || status == 422 => {
                return Err(CiwatchError::UnknownRef(reference.to_string()));
            }
            Err(err) => return Err(err),
        };

        Ok(Commit {
            sha: commit.sha,
            message: commit.commit.message,
            author_date: commit.commit.author.and_then(|a| a.date),
            committed_date: commit.commit.committer.and_then(|c| c.date),
            branches: Vec::new(),
            tags: Vec::new(),
        })
    }

    async fn references(&self, repository_url: &str) -> Result<Vec<String>> {
        let slug = slug_for_host(repository_url, HOST)?;
        let branches: Vec<NamedRef> = self
            .get_json(&format!("{API_URL}/repos/{slug}/branches?per_page=100"))
            .await?;
        let tags: Vec<NamedRef> = self
            .get_json(&format!("{API_URL}/repos/{slug}/tags?per_page=100"))
            .await?;

        Ok(branches
            .into_iter()
            .chain(tags)
            .map(|r| r.name)
            .collect())
    }
}

#[async_trait]
impl CiProvider for GitHubClient {
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
        let (slug, run_id) =
            parse_run_url(url).ok_or_else(|| CiwatchError::UnknownUrl(url.to_string()))?;
        let run: GitHubWorkflowRun = self
            .get_json(&format!("{API_URL}/repos/{slug}/actions/runs/{run_id}"))
            .await?;
        let jobs = self.fetch_run_jobs(&slug, run.id).await?;
        self.remember_repository(&run.id.to_string(), &slug);
        Ok(self.translate_run(run, jobs))
    }

    async fn pipelines(&self, repository_url: &str, sha: &str) -> Result<Vec<Pipeline>> {
        let slug = slug_for_host(repository_url, HOST)?;
        let url = format!("{API_URL}/repos/{slug}/actions/runs?head_sha={sha}&per_page=100");
        let response: WorkflowRunsResponse = self.get_json(&url).await?;
        debug!(
            "{}: {} workflow run(s) for {}@{}",
            self.name,
            response.workflow_runs.len(),
            slug,
            &sha[..sha.len().min(8)]
        );

        let mut pipelines = Vec::with_capacity(response.workflow_runs.len());
        for run in response.workflow_runs {
            let jobs = self.fetch_run_jobs(&slug, run.id).await?;
            self.remember_repository(&run.id.to_string(), &slug);
            pipelines.push(self.translate_run(run, jobs));
        }

        Ok(pipelines)
    }

    async fn log(&self, key: &PipelineKey, step_path: &[String]) -> Result<String> {
        // The Actions API exposes logs at job granularity only.
        let [job_id] = step_path else {
            return Err(CiwatchError::NoLogHere);
        };
        let slug = self
            .repository_of(&key.id)
            .ok_or(CiwatchError::NoLogHere)?;
        let url = format!("{API_URL}/repos/{slug}/actions/jobs/{job_id}/logs");
        let response = send_with_retry(&self.name, &self.limiter, self.client.get(&url)).await?;
        Ok(response.text().await?)
    }
}

fn run_state(status: &str, conclusion: Option<&str>) -> State {
    match status {
        "completed" => match conclusion.unwrap_or_default() {
            "success" | "neutral" => State::Passed,
            "failure" | "timed_out" | "startup_failure" => State::Failed,
            "cancelled" => State::Canceled,
            "skipped" | "stale" => State::Skipped,
            "action_required" => State::Manual,
            _ => State::Unknown,
        },
        "in_progress" => State::Running,
        "queued" | "requested" | "waiting" | "pending" => State::Pending,
        _ => State::Unknown,
    }
}

/// `https://github.com/{owner}/{repo}/actions/runs/{id}` → (slug, id)
fn parse_run_url(url: &str) -> Option<(String, u64)> {
    let parsed = url::Url::parse(url).ok()?;
    if parsed.host_str()? != HOST {
        return None;
    }
    let segments: Vec<&str> = parsed.path_segments()?.collect();
    match segments.as_slice() {
        [owner, repo, "actions", "runs", id, ..] => {
            Some((format!("{owner}/{repo}"), id.parse().ok()?))
        }
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct WorkflowRunsResponse {
    workflow_runs: Vec<GitHubWorkflowRun>,
}

#[derive(Debug, Deserialize)]
struct GitHubWorkflowRun {
    id: u64,
    name: Option<String>,
    run_number: u64,
    head_branch: Option<String>,
    head_sha: String,
    status: String,
    conclusion: Option<String>,
    created_at: DateTime<Utc>,
    run_started_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
    html_url: String,
}

#[derive(Debug, Deserialize)]
struct JobsResponse {
    jobs: Vec<GitHubJob>,
}

#[derive(Debug, Deserialize)]
struct GitHubJob {
    id: u64,
    name: String,
    status: String,
    conclusion: Option<String>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    html_url: Option<String>,
    #[serde(default)]
    steps: Vec<GitHubStep>,
}

#[derive(Debug, Deserialize)]
struct GitHubCommit {
    sha: String,
    commit: GitHubCommitDetail,
}

#[derive(Debug, Deserialize)]
struct GitHubCommitDetail {
    message: String,
    author: Option<GitHubCommitUser>,
    committer: Option<GitHubCommitUser>,
}

#[derive(Debug, Deserialize)]
struct GitHubCommitUser {
    date: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct NamedRef {
    name: String,
}

#[derive(Debug, Deserialize)]
struct GitHubStep {
    name: String,
    number: u64,
    status: String,
    conclusion: Option<String>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn client() -> GitHubClient {
        GitHubClient::new(
            "github-0".to_string(),
            "github".to_string(),
            None,
            RateLimiter::per_second(None, 10.0),
        )
        .unwrap()
    }

    fn sample_run() -> GitHubWorkflowRun {
        GitHubWorkflowRun {
            id: 42,
            name: Some("CI".to_string()),
            run_number: 7,
            head_branch: Some("main".to_string()),
            head_sha: "a1b2c3".to_string(),
            status: "completed".to_string(),
            conclusion: Some("success".to_string()),
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            run_started_at: Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 5).unwrap()),
            updated_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 3, 0).unwrap(),
            html_url: "https://github.com/o/r/actions/runs/42".to_string(),
        }
    }

    #[test]
    fn test_run_state_mapping() {
        assert_eq!(run_state("completed", Some("success")), State::Passed);
        assert_eq!(run_state("completed", Some("failure")), State::Failed);
        assert_eq!(run_state("completed", Some("timed_out")), State::Failed);
        assert_eq!(run_state("completed", Some("cancelled")), State::Canceled);
        assert_eq!(run_state("completed", Some("skipped")), State::Skipped);
        assert_eq!(run_state("completed", Some("action_required")), State::Manual);
        assert_eq!(run_state("in_progress", None), State::Running);
        assert_eq!(run_state("queued", None), State::Pending);
        assert_eq!(run_state("mystery", None), State::Unknown);
    }

    #[tokio::test]
    async fn test_translate_run_builds_tree() {
        let jobs = vec![GitHubJob {
            id: 100,
            name: "build".to_string(),
            status: "completed".to_string(),
            conclusion: Some("success".to_string()),
            started_at: None,
            completed_at: None,
            html_url: None,
            steps: vec![GitHubStep {
                name: "checkout".to_string(),
                number: 1,
                status: "completed".to_string(),
                conclusion: Some("success".to_string()),
                started_at: None,
                completed_at: None,
            }],
        }];

        let pipeline = client().translate_run(sample_run(), jobs);
        assert_eq!(pipeline.key, PipelineKey::new("github-0", "42"));
        assert_eq!(pipeline.number, "7");
        assert_eq!(pipeline.git_ref, "main");
        assert_eq!(pipeline.step.children.len(), 1);
        assert_eq!(pipeline.step.children[0].id, "100");
        assert_eq!(pipeline.step.children[0].children[0].id, "1");
        assert_eq!(pipeline.state(), State::Passed);
    }

    #[tokio::test]
    async fn test_parse_run_url_round_trip() {
        let pipeline = client().translate_run(sample_run(), Vec::new());
        let url = pipeline.step.web_url.as_deref().unwrap();
        let (slug, id) = parse_run_url(url).unwrap();
        assert_eq!(slug, "o/r");
        assert_eq!(id.to_string(), pipeline.key.id);
    }

    #[test]
    fn test_parse_run_url_rejects_foreign_urls() {
        assert!(parse_run_url("https://gitlab.com/o/r/-/pipelines/1").is_none());
        assert!(parse_run_url("https://github.com/o/r/pull/5").is_none());
        assert!(parse_run_url("not a url").is_none());
    }
}
