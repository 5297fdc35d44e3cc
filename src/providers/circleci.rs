use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use serde::Deserialize;
use url::Url;

use crate::error::{CiwatchError, Result};
use crate::models::{Pipeline, PipelineKey, State, Step};
use crate::ratelimit::RateLimiter;

use super::{http_client, send_with_retry, slug_for_host, CiProvider};

const API_URL: &str = "https://circleci.com/api/v1.1";
const HOST: &str = "circleci.com";

/// CircleCI client against the v1.1 API, for GitHub-hosted repositories.
pub struct CircleCiClient {
    id: String,
    name: String,
    client: reqwest::Client,
    token: Option<String>,
    limiter: RateLimiter,
    /// Pipeline id → repository slug, for re-addressing build details.
    repositories: Mutex<HashMap<String, String>>,
}

impl CircleCiClient {
    pub fn new(id: String, name: String, token: Option<String>, limiter: RateLimiter) -> Result<Self> {
        Ok(Self {
            id,
            name,
            client: http_client()?,
            token: token.filter(|t| !t.is_empty()),
            limiter,
            repositories: Mutex::new(HashMap::new()),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let mut request = self.client.get(url);
        if let Some(token) = &self.token {
            request = request.header("Circle-Token", token);
        }
        let response = send_with_retry(&self.name, &self.limiter, request).await?;
        Ok(response.json().await?)
    }

    async fn fetch_build(&self, slug: &str, build_num: u64) -> Result<CircleBuild> {
        self.get_json(&format!("{API_URL}/project/github/{slug}/{build_num}"))
            .await
    }

    fn translate_build(&self, build: CircleBuild) -> Pipeline {
        let children = build
            .steps
            .iter()
            .flat_map(|step| {
                step.actions.iter().map(|action| Step {
                    id: format!("{}.{}", action.step, action.index),
                    name: action.name.clone(),
                    state: build_state(&action.status),
                    started_at: action.start_time,
                    finished_at: action.end_time,
                    ..Step::default()
                })
            })
            .collect();

        let updated_at = build
            .stop_time
            .or(build.start_time)
            .or(build.queued_at)
            .unwrap_or_else(Utc::now);

        Pipeline {
            key: PipelineKey::new(self.id.clone(), build.build_num.to_string()),
            provider_name: self.name.clone(),
            git_ref: build.branch.unwrap_or_default(),
            commit_sha: build.vcs_revision,
            number: build.build_num.to_string(),
            updated_at,
            step: Step {
                id: build.build_num.to_string(),
                name: build.subject.unwrap_or_else(|| format!("#{}", build.build_num)),
                state: build_state(&build.status),
                created_at: build.queued_at,
                started_at: build.start_time,
                finished_at: build.stop_time,
                web_url: build.build_url,
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
}

#[async_trait]
impl CiProvider for CircleCiClient {
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
        let (slug, build_num) =
            parse_build_url(url).ok_or_else(|| CiwatchError::UnknownUrl(url.to_string()))?;
        let build = self.fetch_build(&slug, build_num).await?;
        self.remember_repository(&build.build_num.to_string(), &slug);
        Ok(self.translate_build(build))
    }

    async fn pipelines(&self, repository_url: &str, sha: &str) -> Result<Vec<Pipeline>> {
        let slug = slug_for_host(repository_url, "github.com")?;
        let recent: Vec<CircleBuildSummary> = self
            .get_json(&format!("{API_URL}/project/github/{slug}?limit=100&shallow=true"))
            .await?;

        let matching: Vec<u64> = recent
            .into_iter()
            .filter(|b| b.vcs_revision == sha)
            .map(|b| b.build_num)
            .collect();
        debug!(
            "{}: {} build(s) for sha {}",
            self.name,
            matching.len(),
            &sha[..sha.len().min(8)]
        );

        let mut pipelines = Vec::with_capacity(matching.len());
        for build_num in matching {
            let build = self.fetch_build(&slug, build_num).await?;
            self.remember_repository(&build.build_num.to_string(), &slug);
            pipelines.push(self.translate_build(build));
        }
        Ok(pipelines)
    }

    async fn log(&self, key: &PipelineKey, step_path: &[String]) -> Result<String> {
        let [action_id] = step_path else {
            return Err(CiwatchError::NoLogHere);
        };
        let slug = self
            .repositories
            .lock()
            .expect("repository map poisoned")
            .get(&key.id)
            .cloned()
            .ok_or(CiwatchError::NoLogHere)?;
        let build_num: u64 = key.id.parse().map_err(|_| CiwatchError::NoLogHere)?;

        let build = self.fetch_build(&slug, build_num).await?;
        let output_url = build
            .steps
            .iter()
            .flat_map(|s| s.actions.iter())
            .find(|a| format!("{}.{}", a.step, a.index) == *action_id)
            .and_then(|a| a.output_url.clone())
            .ok_or(CiwatchError::NoLogHere)?;

        // Output is a JSON array of {message} chunks on a presigned URL.
        let response =
            send_with_retry(&self.name, &self.limiter, self.client.get(&output_url)).await?;
        let chunks: Vec<OutputChunk> = response.json().await?;
        Ok(chunks.into_iter().map(|c| c.message).collect())
    }
}

fn build_state(status: &str) -> State {
    match status {
        "queued" | "scheduled" | "not_running" => State::Pending,
        "running" => State::Running,
        "success" | "fixed" | "no_tests" => State::Passed,
        "failed" | "infrastructure_fail" | "timedout" => State::Failed,
        "canceled" => State::Canceled,
        "not_run" | "retried" | "skipped" => State::Skipped,
        _ => State::Unknown,
    }
}

/// `https://circleci.com/gh/{owner}/{repo}/{build_num}` → (slug, num)
fn parse_build_url(url: &str) -> Option<(String, u64)> {
    let parsed = Url::parse(url).ok()?;
    if parsed.host_str()? != HOST {
        return None;
    }
    let segments: Vec<&str> = parsed.path_segments()?.collect();
    match segments.as_slice() {
        ["gh", owner, repo, num] => Some((format!("{owner}/{repo}"), num.parse().ok()?)),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct CircleBuildSummary {
    build_num: u64,
    #[serde(default)]
    vcs_revision: String,
}

#[derive(Debug, Deserialize)]
struct CircleBuild {
    build_num: u64,
    #[serde(default)]
    vcs_revision: String,
    branch: Option<String>,
    subject: Option<String>,
    status: String,
    queued_at: Option<DateTime<Utc>>,
    start_time: Option<DateTime<Utc>>,
    stop_time: Option<DateTime<Utc>>,
    build_url: Option<String>,
    #[serde(default)]
    steps: Vec<CircleStep>,
}

#[derive(Debug, Deserialize)]
struct CircleStep {
    #[serde(default)]
    actions: Vec<CircleAction>,
}

#[derive(Debug, Deserialize)]
struct CircleAction {
    name: String,
    status: String,
    step: u64,
    index: u64,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    output_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OutputChunk {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> CircleCiClient {
        CircleCiClient::new(
            "circleci-0".to_string(),
            "circleci".to_string(),
            None,
            RateLimiter::per_second(None, 10.0),
        )
        .unwrap()
    }

    fn sample_build() -> CircleBuild {
        CircleBuild {
            build_num: 33,
            vcs_revision: "a1b2c3".to_string(),
            branch: Some("main".to_string()),
            subject: Some("add feature".to_string()),
            status: "success".to_string(),
            queued_at: None,
            start_time: None,
            stop_time: None,
            build_url: Some("https://circleci.com/gh/owner/repo/33".to_string()),
            steps: vec![CircleStep {
                actions: vec![CircleAction {
                    name: "run tests".to_string(),
                    status: "success".to_string(),
                    step: 101,
                    index: 0,
                    start_time: None,
                    end_time: None,
                    output_url: None,
                }],
            }],
        }
    }

    #[test]
    fn test_build_state_mapping() {
        assert_eq!(build_state("success"), State::Passed);
        assert_eq!(build_state("fixed"), State::Passed);
        assert_eq!(build_state("failed"), State::Failed);
        assert_eq!(build_state("timedout"), State::Failed);
        assert_eq!(build_state("running"), State::Running);
        assert_eq!(build_state("not_run"), State::Skipped);
        assert_eq!(build_state("canceled"), State::Canceled);
    }

    #[tokio::test]
    async fn test_translate_build_flattens_actions() {
        let pipeline = client().translate_build(sample_build());
        assert_eq!(pipeline.key, PipelineKey::new("circleci-0", "33"));
        assert_eq!(pipeline.step.children.len(), 1);
        assert_eq!(pipeline.step.children[0].id, "101.0");
        assert_eq!(pipeline.step.children[0].name, "run tests");
    }

    #[tokio::test]
    async fn test_parse_build_url_round_trip() {
        let pipeline = client().translate_build(sample_build());
        let url = pipeline.step.web_url.as_deref().unwrap();
        let (slug, num) = parse_build_url(url).unwrap();
        assert_eq!(slug, "owner/repo");
        assert_eq!(num.to_string(), pipeline.key.id);
    }
}
