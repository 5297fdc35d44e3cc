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

const API_VERSION: &str = "5.1";
const HOST: &str = "dev.azure.com";

/// Azure Pipelines client. For GitHub-hosted repositories the Azure
/// organization and project are assumed to match the repository slug.
pub struct AzurePipelinesClient {
    id: String,
    name: String,
    client: reqwest::Client,
    token: Option<String>,
    limiter: RateLimiter,
    /// Pipeline id → "org/project", for timeline lookups at log time.
    projects: Mutex<HashMap<String, String>>,
}

impl AzurePipelinesClient {
    pub fn new(id: String, name: String, token: Option<String>, limiter: RateLimiter) -> Result<Self> {
        Ok(Self {
            id,
            name,
            client: http_client()?,
            token: token.filter(|t| !t.is_empty()),
            limiter,
            projects: Mutex::new(HashMap::new()),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let mut request = self.client.get(url);
        if let Some(token) = &self.token {
            // Azure personal access tokens use basic auth with empty user.
            request = request.basic_auth("", Some(token));
        }
        let response = send_with_retry(&self.name, &self.limiter, request).await?;
        Ok(response.json().await?)
    }

    async fn fetch_build(&self, project: &str, build: AzureBuild) -> Result<Pipeline> {
        let timeline: TimelineResponse = self
            .get_json(&format!(
                "https://{HOST}/{project}/_apis/build/builds/{}/timeline?api-version={API_VERSION}",
                build.id
            ))
            .await?;

        self.projects
            .lock()
            .expect("project map poisoned")
            .insert(build.id.to_string(), project.to_string());

        Ok(self.translate_build(build, timeline.records))
    }

    fn translate_build(&self, build: AzureBuild, records: Vec<TimelineRecord>) -> Pipeline {
        Pipeline {
            key: PipelineKey::new(self.id.clone(), build.id.to_string()),
            provider_name: self.name.clone(),
            git_ref: build
                .source_branch
                .as_deref()
                .map(strip_ref_prefix)
                .unwrap_or_default(),
            commit_sha: build.source_version.clone().unwrap_or_default(),
            number: build.build_number.clone().unwrap_or_default(),
            updated_at: build.last_changed_date.unwrap_or_else(Utc::now),
            step: Step {
                id: build.id.to_string(),
                name: build.build_number.clone().unwrap_or_else(|| build.id.to_string()),
                state: build_state(&build.status, build.result.as_deref()),
                created_at: build.queue_time,
                started_at: build.start_time,
                finished_at: build.finish_time,
                web_url: build.links.as_ref().and_then(|l| l.web.as_ref()).map(|w| w.href.clone()),
                children: assemble_tree(records),
                ..Step::default()
            },
        }
    }
}

/// Timeline records arrive flat with parent links; stages own jobs own
/// tasks. Phase records are wrappers and are spliced out.
fn assemble_tree(mut records: Vec<TimelineRecord>) -> Vec<Step> {
    records.sort_by_key(|r| r.order.unwrap_or(u64::MAX));

    // Reparent children of phases to the phase's own parent.
    let phase_parents: HashMap<String, Option<String>> = records
        .iter()
        .filter(|r| r.record_type == "Phase")
        .map(|r| (r.id.clone(), r.parent_id.clone()))
        .collect();
    for record in &mut records {
        while let Some(parent) = record.parent_id.clone() {
            match phase_parents.get(&parent) {
                Some(grandparent) => record.parent_id = grandparent.clone(),
                None => break,
            }
        }
    }

    fn children_of(records: &[TimelineRecord], parent: Option<&str>) -> Vec<Step> {
        records
            .iter()
            .filter(|r| r.record_type != "Phase")
            .filter(|r| r.parent_id.as_deref() == parent)
            .map(|r| Step {
                id: r.id.clone(),
                name: r.name.clone().unwrap_or_else(|| r.record_type.clone()),
                state: record_state(r.state.as_deref(), r.result.as_deref()),
                started_at: r.start_time,
                finished_at: r.finish_time,
                children: children_of(records, Some(&r.id)),
                ..Step::default()
            })
            .collect()
    }

    children_of(&records, None)
}

#[async_trait]
impl CiProvider for AzurePipelinesClient {
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
        let (project, build_id) =
            parse_results_url(url).ok_or_else(|| CiwatchError::UnknownUrl(url.to_string()))?;
        let build: AzureBuild = self
            .get_json(&format!(
                "https://{HOST}/{project}/_apis/build/builds/{build_id}?api-version={API_VERSION}"
            ))
            .await?;
        self.fetch_build(&project, build).await
    }

    async fn pipelines(&self, repository_url: &str, sha: &str) -> Result<Vec<Pipeline>> {
        let slug = slug_for_host(repository_url, "github.com")?;
        let response: BuildsResponse = self
            .get_json(&format!(
                "https://{HOST}/{slug}/_apis/build/builds?api-version={API_VERSION}&queryOrder=queueTimeDescending&$top=50"
            ))
            .await?;

        let matching: Vec<AzureBuild> = response
            .value
            .into_iter()
            .filter(|b| b.source_version.as_deref() == Some(sha))
            .collect();
        debug!(
            "{}: {} build(s) for sha {}",
            self.name,
            matching.len(),
            &sha[..sha.len().min(8)]
        );

        let mut pipelines = Vec::with_capacity(matching.len());
        for build in matching {
            pipelines.push(self.fetch_build(&slug, build).await?);
        }
        Ok(pipelines)
    }

    async fn log(&self, key: &PipelineKey, step_path: &[String]) -> Result<String> {
        let Some(record_id) = step_path.last() else {
            return Err(CiwatchError::NoLogHere);
        };
        let project = self
            .projects
            .lock()
            .expect("project map poisoned")
            .get(&key.id)
            .cloned()
            .ok_or(CiwatchError::NoLogHere)?;

        let timeline: TimelineResponse = self
            .get_json(&format!(
                "https://{HOST}/{project}/_apis/build/builds/{}/timeline?api-version={API_VERSION}",
                key.id
            ))
            .await?;
        let log_url = timeline
            .records
            .into_iter()
            .find(|r| r.id == *record_id)
            .and_then(|r| r.log)
            .map(|l| l.url)
            .ok_or(CiwatchError::NoLogHere)?;

        let mut request = self.client.get(&log_url);
        if let Some(token) = &self.token {
            request = request.basic_auth("", Some(token));
        }
        let response = send_with_retry(&self.name, &self.limiter, request).await?;
        Ok(response.text().await?)
    }
}

fn strip_ref_prefix(branch: &str) -> String {
    branch
        .strip_prefix("refs/heads/")
        .or_else(|| branch.strip_prefix("refs/tags/"))
        .unwrap_or(branch)
        .to_string()
}

fn build_state(status: &str, result: Option<&str>) -> State {
    match status {
        "notStarted" | "postponed" | "none" => State::Pending,
        "inProgress" | "cancelling" => State::Running,
        "completed" => match result.unwrap_or_default() {
            "succeeded" => State::Passed,
            "failed" | "partiallySucceeded" => State::Failed,
            "canceled" => State::Canceled,
            "skipped" => State::Skipped,
            _ => State::Unknown,
        },
        _ => State::Unknown,
    }
}

fn record_state(state: Option<&str>, result: Option<&str>) -> State {
    match state.unwrap_or_default() {
        "pending" => State::Pending,
        "inProgress" => State::Running,
        "completed" => match result.unwrap_or_default() {
            "succeeded" | "succeededWithIssues" => State::Passed,
            "failed" => State::Failed,
            "canceled" | "abandoned" => State::Canceled,
            "skipped" => State::Skipped,
            _ => State::Unknown,
        },
        _ => State::Unknown,
    }
}

/// `https://dev.azure.com/{org}/{project}/_build/results?buildId={id}`
fn parse_results_url(url: &str) -> Option<(String, u64)> {
    let parsed = Url::parse(url).ok()?;
    if parsed.host_str()? != HOST {
        return None;
    }
    let segments: Vec<&str> = parsed.path_segments()?.collect();
    let (org, project) = match segments.as_slice() {
        [org, project, "_build", "results"] => (org, project),
        _ => return None,
    };
    let build_id: u64 = parsed
        .query_pairs()
        .find(|(k, _)| k == "buildId")
        .and_then(|(_, v)| v.parse().ok())?;
    Some((format!("{org}/{project}"), build_id))
}

#[derive(Debug, Deserialize)]
struct BuildsResponse {
    value: Vec<AzureBuild>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AzureBuild {
    id: u64,
    build_number: Option<String>,
    status: String,
    result: Option<String>,
    source_branch: Option<String>,
    source_version: Option<String>,
    queue_time: Option<DateTime<Utc>>,
    start_time: Option<DateTime<Utc>>,
    finish_time: Option<DateTime<Utc>>,
    last_changed_date: Option<DateTime<Utc>>,
    #[serde(rename = "_links")]
    links: Option<Links>,
}

#[derive(Debug, Deserialize)]
struct Links {
    web: Option<Link>,
}

#[derive(Debug, Deserialize)]
struct Link {
    href: String,
}

#[derive(Debug, Deserialize)]
struct TimelineResponse {
    records: Vec<TimelineRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TimelineRecord {
    id: String,
    parent_id: Option<String>,
    #[serde(rename = "type")]
    record_type: String,
    name: Option<String>,
    state: Option<String>,
    result: Option<String>,
    start_time: Option<DateTime<Utc>>,
    finish_time: Option<DateTime<Utc>>,
    order: Option<u64>,
    log: Option<RecordLog>,
}

#[derive(Debug, Deserialize)]
struct RecordLog {
    url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, parent: Option<&str>, kind: &str, name: &str) -> TimelineRecord {
        TimelineRecord {
            id: id.to_string(),
            parent_id: parent.map(str::to_string),
            record_type: kind.to_string(),
            name: Some(name.to_string()),
            state: Some("completed".to_string()),
            result: Some("succeeded".to_string()),
            start_time: None,
            finish_time: None,
            order: None,
            log: None,
        }
    }

    #[test]
    fn test_build_state_mapping() {
        assert_eq!(build_state("completed", Some("succeeded")), State::Passed);
        assert_eq!(build_state("completed", Some("failed")), State::Failed);
        assert_eq!(build_state("completed", Some("canceled")), State::Canceled);
        assert_eq!(build_state("inProgress", None), State::Running);
        assert_eq!(build_state("notStarted", None), State::Pending);
    }

    #[test]
    fn test_assemble_tree_splices_out_phases() {
        let records = vec![
            record("stage", None, "Stage", "Build"),
            record("phase", Some("stage"), "Phase", "__default"),
            record("job", Some("phase"), "Job", "Agent job"),
            record("task", Some("job"), "Task", "cargo test"),
        ];
        let tree = assemble_tree(records);
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].name, "Build");
        assert_eq!(tree[0].children.len(), 1);
        assert_eq!(tree[0].children[0].name, "Agent job");
        assert_eq!(tree[0].children[0].children[0].name, "cargo test");
    }

    #[test]
    fn test_strip_ref_prefix() {
        assert_eq!(strip_ref_prefix("refs/heads/main"), "main");
        assert_eq!(strip_ref_prefix("refs/tags/v1"), "v1");
        assert_eq!(strip_ref_prefix("main"), "main");
    }

    #[test]
    fn test_parse_results_url() {
        let (project, id) =
            parse_results_url("https://dev.azure.com/org/proj/_build/results?buildId=77").unwrap();
        assert_eq!(project, "org/proj");
        assert_eq!(id, 77);
        assert!(parse_results_url("https://dev.azure.com/org/proj/_build/results").is_none());
    }
}
