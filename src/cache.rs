use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use log::{debug, warn};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::error::{CiwatchError, Result};
use crate::models::{Commit, GitRef, Pipeline, PipelineKey, Step};
use crate::providers::{CiProvider, SourceProvider};
use crate::utils;

/// The single source of truth consumed by the UI.
///
/// Owns the merged pipeline graph keyed by `(provider, pipeline id)`,
/// serializes writes from the monitor tasks against reader snapshots, and
/// dispatches log requests to the owning provider. Cheap to clone.
#[derive(Clone)]
pub struct Cache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    state: RwLock<CacheState>,
    source_providers: Vec<Arc<dyn SourceProvider>>,
    ci_providers: Vec<Arc<dyn CiProvider>>,
}

#[derive(Default)]
struct CacheState {
    pipelines: BTreeMap<PipelineKey, Pipeline>,
    /// Ref name → resolved commit, cached for the process lifetime.
    commits: HashMap<String, Commit>,
}

impl Cache {
    pub fn new(
        source_providers: Vec<Arc<dyn SourceProvider>>,
        ci_providers: Vec<Arc<dyn CiProvider>>,
    ) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                state: RwLock::new(CacheState::default()),
                source_providers,
                ci_providers,
            }),
        }
    }

    /// Merges a pipeline observation into the store.
    ///
    /// Returns `true` iff any observable field changed. A provider may only
    /// overwrite pipelines it owns; writes whose `updated_at` is older than
    /// the cached value are silently dropped. Child sets are replaced
    /// wholesale: providers emit complete trees per refresh.
    pub fn save_pipeline(&self, provider_id: &str, mut pipeline: Pipeline) -> bool {
        if pipeline.key.provider_id != provider_id {
            warn!(
                "rejecting write of {:?} by provider {provider_id}",
                pipeline.key
            );
            return false;
        }
        pipeline.step.normalize();

        let mut state = self.inner.state.write().expect("cache lock poisoned");
        match state.pipelines.get(&pipeline.key) {
            Some(cached) if pipeline.updated_at < cached.updated_at => false,
            Some(cached) => {
                let changed = *cached != pipeline;
                if changed {
                    state.pipelines.insert(pipeline.key.clone(), pipeline);
                }
                changed
            }
            None => {
                state.pipelines.insert(pipeline.key.clone(), pipeline);
                true
            }
        }
    }

    /// Snapshot of all pipelines whose commit matches the ref's resolved
    /// SHA, in key order. The copy is consistent: writers proceed only
    /// after the snapshot is taken.
    pub fn pipelines(&self, git_ref: &GitRef) -> Vec<Pipeline> {
        let state = self.inner.state.read().expect("cache lock poisoned");
        let Some(sha) = git_ref
            .sha()
            .map(str::to_string)
            .or_else(|| state.commits.get(&git_ref.name).map(|c| c.sha.clone()))
        else {
            return Vec::new();
        };
        state
            .pipelines
            .values()
            .filter(|p| p.commit_sha == sha)
            .cloned()
            .collect()
    }

    /// Last observed commit metadata for the ref.
    pub fn commit(&self, ref_name: &str) -> Option<Commit> {
        let state = self.inner.state.read().expect("cache lock poisoned");
        state.commits.get(ref_name).cloned()
    }

    pub(crate) fn save_commit(&self, ref_name: &str, commit: Commit) {
        let mut state = self.inner.state.write().expect("cache lock poisoned");
        state.commits.insert(ref_name.to_string(), commit);
    }

    /// Looks up a nested step without copying its siblings.
    pub fn step(&self, key: &PipelineKey, step_path: &[String]) -> Option<Step> {
        let state = self.inner.state.read().expect("cache lock poisoned");
        let pipeline = state.pipelines.get(key)?;
        if step_path.is_empty() {
            return Some(Step {
                children: Vec::new(),
                ..pipeline.step.clone()
            });
        }
        pipeline.step.find(step_path).cloned()
    }

    /// Fetches and post-processes the log of the addressed step.
    pub async fn log(&self, key: &PipelineKey, step_path: &[String]) -> Result<String> {
        let provider = self
            .inner
            .ci_providers
            .iter()
            .find(|p| p.id() == key.provider_id)
            .ok_or(CiwatchError::NoLogHere)?
            .clone();
        let raw = provider.log(key, step_path).await?;
        Ok(utils::postprocess_log(&raw))
    }

    /// Keeps the cache current for `ref_name`: resolves the commit through
    /// the source providers, then polls every CI provider until the task
    /// is cancelled.
    ///
    /// Every tick sent on `updates` corresponds to at least one change
    /// already visible through a subsequent `pipelines` snapshot. Ticks
    /// are sent with `try_send`: a missed tick is harmless because the
    /// next snapshot is always fresh. Individual provider failures go to
    /// `errors` without stopping the remaining providers.
    pub async fn monitor_pipelines(
        &self,
        repository_urls: Vec<String>,
        ref_name: String,
        local_commit: Option<Commit>,
        updates: mpsc::Sender<Instant>,
        errors: mpsc::UnboundedSender<CiwatchError>,
    ) -> Result<()> {
        let commit = self
            .resolve_commit(&repository_urls, &ref_name, local_commit)
            .await?;
        let sha = commit.sha.clone();
        self.save_commit(&ref_name, commit);
        // The header is displayable before the first pipeline arrives.
        let _ = updates.try_send(Instant::now());

        let mut tasks: JoinSet<()> = JoinSet::new();
        for provider in &self.inner.ci_providers {
            let provider = provider.clone();
            let cache = self.clone();
            let urls = repository_urls.clone();
            let sha = sha.clone();
            let updates = updates.clone();
            let errors = errors.clone();
            tasks.spawn(async move {
                cache.poll_provider(provider, urls, sha, updates, errors).await;
            });
        }

        while tasks.join_next().await.is_some() {}
        Ok(())
    }

    /// One resolution per monitor invocation: the local repository answer
    /// wins (it knows branch/tag decorations); otherwise the first source
    /// provider that recognises the ref. All providers answering
    /// `UnknownRef` means the reference does not exist anywhere.
    async fn resolve_commit(
        &self,
        repository_urls: &[String],
        ref_name: &str,
        local_commit: Option<Commit>,
    ) -> Result<Commit> {
        if let Some(commit) = local_commit {
            return Ok(commit);
        }

        for provider in &self.inner.source_providers {
            for url in repository_urls {
                match provider.commit(url, ref_name).await {
                    Ok(commit) => {
                        debug!("{}: resolved {ref_name} to {}", provider.name(), commit.sha);
                        return Ok(commit);
                    }
                    Err(
                        CiwatchError::UnknownRef(_) | CiwatchError::UnknownRepositoryUrl(_),
                    ) => continue,
                    Err(err) => {
                        warn!("{}: commit resolution failed: {err}", provider.name());
                        continue;
                    }
                }
            }
        }

        Err(CiwatchError::UnknownGitReference)
    }

    /// Long-running polling loop for one CI provider. The provider's rate
    /// limiter alone paces the loop; there is no upper polling interval.
    async fn poll_provider(
        &self,
        provider: Arc<dyn CiProvider>,
        mut urls: Vec<String>,
        sha: String,
        updates: mpsc::Sender<Instant>,
        errors: mpsc::UnboundedSender<CiwatchError>,
    ) {
        while !urls.is_empty() {
            let mut changed = false;
            let mut failed = false;

            let mut index = 0;
            while index < urls.len() {
                match provider.pipelines(&urls[index], &sha).await {
                    Ok(pipelines) => {
                        for pipeline in pipelines {
                            changed |= self.save_pipeline(provider.id(), pipeline);
                        }
                        index += 1;
                    }
                    Err(CiwatchError::UnknownRepositoryUrl(_)) => {
                        // Not this provider's repository; stop asking.
                        urls.remove(index);
                    }
                    Err(err) => {
                        warn!("{}: polling failed: {err}", provider.name());
                        let _ = errors.send(err);
                        failed = true;
                        break;
                    }
                }
            }

            if changed {
                let _ = updates.try_send(Instant::now());
            }
            if failed {
                // Degraded for the remainder of the run; the other
                // providers keep polling.
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::models::{State, Step};

    fn sample_pipeline(provider_id: &str, id: &str, sha: &str, minute: u32) -> Pipeline {
        Pipeline {
            key: PipelineKey::new(provider_id, id),
            provider_name: provider_id.to_string(),
            git_ref: "main".to_string(),
            commit_sha: sha.to_string(),
            number: id.to_string(),
            updated_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, minute, 0).unwrap(),
            step: Step {
                id: id.to_string(),
                name: format!("pipeline {id}"),
                state: State::Passed,
                children: vec![
                    Step {
                        id: "build".to_string(),
                        name: "build".to_string(),
                        state: State::Passed,
                        ..Step::default()
                    },
                    Step {
                        id: "test".to_string(),
                        name: "test".to_string(),
                        state: State::Passed,
                        ..Step::default()
                    },
                ],
                ..Step::default()
            },
        }
    }

    fn resolved_ref(sha: &str) -> GitRef {
        GitRef {
            name: "main".to_string(),
            commit: Some(Commit {
                sha: sha.to_string(),
                ..Commit::default()
            }),
        }
    }

    struct StubCi {
        id: String,
        pipelines: std::sync::Mutex<Vec<Pipeline>>,
        calls: AtomicUsize,
        fail_after: Option<usize>,
    }

    impl StubCi {
        /// `fail_after` bounds the polling loop in tests: after that many
        /// successful calls the stub reports a permanent error, which
        /// degrades the provider and lets the monitor task finish.
        fn new(id: &str, pipelines: Vec<Pipeline>, fail_after: usize) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                pipelines: std::sync::Mutex::new(pipelines),
                calls: AtomicUsize::new(0),
                fail_after: Some(fail_after),
            })
        }
    }

    #[async_trait]
    impl CiProvider for StubCi {
        fn id(&self) -> &str {
            &self.id
        }
        fn name(&self) -> &str {
            &self.id
        }
        fn host(&self) -> &str {
            "example.com"
        }
        async fn build_from_url(&self, url: &str) -> Result<Pipeline> {
            Err(CiwatchError::UnknownUrl(url.to_string()))
        }
        async fn pipelines(&self, _url: &str, _sha: &str) -> Result<Vec<Pipeline>> {
            tokio::task::yield_now().await;
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_after.is_some_and(|n| call >= n) {
                return Err(CiwatchError::Api {
                    provider: self.id.clone(),
                    status: 403,
                    message: "bad credentials".to_string(),
                });
            }
            Ok(self.pipelines.lock().unwrap().clone())
        }
        async fn log(&self, _key: &PipelineKey, step_path: &[String]) -> Result<String> {
            if step_path.is_empty() {
                return Err(CiwatchError::NoLogHere);
            }
            Ok("foo\rbar\rbaz\n\x1b[31mred".to_string())
        }
    }

    struct StubSource {
        known: Option<Commit>,
    }

    #[async_trait]
    impl SourceProvider for StubSource {
        fn id(&self) -> &str {
            "source-0"
        }
        fn name(&self) -> &str {
            "source"
        }
        async fn commit(&self, _url: &str, reference: &str) -> Result<Commit> {
            self.known
                .clone()
                .ok_or_else(|| CiwatchError::UnknownRef(reference.to_string()))
        }
        async fn references(&self, _url: &str) -> Result<Vec<String>> {
            Ok(vec!["main".to_string()])
        }
    }

    #[test]
    fn test_save_pipeline_reports_changes() {
        let cache = Cache::new(Vec::new(), Vec::new());
        let p = sample_pipeline("ci-0", "1", "sha1", 0);

        assert!(cache.save_pipeline("ci-0", p.clone()));
        // Identical write at the same updated_at: no observable change.
        assert!(!cache.save_pipeline("ci-0", p.clone()));

        let mut newer = sample_pipeline("ci-0", "1", "sha1", 5);
        newer.step.children[1].state = State::Failed;
        assert!(cache.save_pipeline("ci-0", newer));
    }

    #[test]
    fn test_save_pipeline_drops_stale_writes() {
        let cache = Cache::new(Vec::new(), Vec::new());
        let newer = sample_pipeline("ci-0", "1", "sha1", 10);
        assert!(cache.save_pipeline("ci-0", newer.clone()));
        let before = cache.pipelines(&resolved_ref("sha1"));

        let mut stale = sample_pipeline("ci-0", "1", "sha1", 2);
        stale.step.children[0].state = State::Failed;
        assert!(!cache.save_pipeline("ci-0", stale));

        // Snapshot is byte-equivalent after the stale write.
        assert_eq!(cache.pipelines(&resolved_ref("sha1")), before);
    }

    #[test]
    fn test_save_pipeline_rejects_foreign_providers() {
        let cache = Cache::new(Vec::new(), Vec::new());
        let p = sample_pipeline("ci-0", "1", "sha1", 0);
        assert!(!cache.save_pipeline("ci-1", p));
        assert!(cache.pipelines(&resolved_ref("sha1")).is_empty());
    }

    #[test]
    fn test_save_pipeline_reduces_state_from_leaves() {
        let cache = Cache::new(Vec::new(), Vec::new());
        let mut p = sample_pipeline("ci-0", "1", "sha1", 0);
        p.step.children[0].state = State::Failed;
        p.step.state = State::Passed;
        cache.save_pipeline("ci-0", p);

        let snapshot = cache.pipelines(&resolved_ref("sha1"));
        assert_eq!(snapshot[0].state(), State::Failed);
    }

    #[test]
    fn test_snapshot_filters_by_sha_and_sorts_by_key() {
        let cache = Cache::new(Vec::new(), Vec::new());
        cache.save_pipeline("ci-b", sample_pipeline("ci-b", "2", "sha1", 0));
        cache.save_pipeline("ci-a", sample_pipeline("ci-a", "9", "sha1", 0));
        cache.save_pipeline("ci-a", sample_pipeline("ci-a", "1", "other", 0));

        let snapshot = cache.pipelines(&resolved_ref("sha1"));
        let keys: Vec<&PipelineKey> = snapshot.iter().map(|p| &p.key).collect();
        assert_eq!(
            keys,
            vec![
                &PipelineKey::new("ci-a", "9"),
                &PipelineKey::new("ci-b", "2")
            ]
        );
    }

    #[test]
    fn test_same_pipeline_id_from_two_providers_stays_distinct() {
        let cache = Cache::new(Vec::new(), Vec::new());
        cache.save_pipeline("ci-a", sample_pipeline("ci-a", "1", "sha1", 0));
        cache.save_pipeline("ci-b", sample_pipeline("ci-b", "1", "sha1", 0));
        assert_eq!(cache.pipelines(&resolved_ref("sha1")).len(), 2);
    }

    #[test]
    fn test_step_lookup_without_siblings() {
        let cache = Cache::new(Vec::new(), Vec::new());
        cache.save_pipeline("ci-0", sample_pipeline("ci-0", "1", "sha1", 0));

        let key = PipelineKey::new("ci-0", "1");
        let step = cache.step(&key, &["test".to_string()]).unwrap();
        assert_eq!(step.id, "test");
        let root = cache.step(&key, &[]).unwrap();
        assert!(root.children.is_empty());
        assert!(cache.step(&key, &["nope".to_string()]).is_none());
    }

    #[tokio::test]
    async fn test_log_dispatches_and_postprocesses() {
        let ci = StubCi::new("ci-0", Vec::new(), 0);
        let cache = Cache::new(Vec::new(), vec![ci]);
        let key = PipelineKey::new("ci-0", "1");

        let log = cache.log(&key, &["job".to_string()]).await.unwrap();
        assert_eq!(log, "baz\nred");

        let err = cache.log(&key, &[]).await.unwrap_err();
        assert!(matches!(err, CiwatchError::NoLogHere));

        let unknown = PipelineKey::new("ci-9", "1");
        assert!(matches!(
            cache.log(&unknown, &[]).await.unwrap_err(),
            CiwatchError::NoLogHere
        ));
    }

    #[tokio::test]
    async fn test_monitor_fails_when_no_provider_knows_the_ref() {
        let source = Arc::new(StubSource { known: None });
        let cache = Cache::new(vec![source], Vec::new());
        let (updates, _rx) = mpsc::channel(1);
        let (errors, _erx) = mpsc::unbounded_channel();

        let err = cache
            .monitor_pipelines(
                vec!["https://example.com/o/r".to_string()],
                "ghost".to_string(),
                None,
                updates,
                errors,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CiwatchError::UnknownGitReference));
    }

    #[tokio::test]
    async fn test_monitor_saves_pipelines_and_ticks() {
        let commit = Commit {
            sha: "sha1".to_string(),
            ..Commit::default()
        };
        let source = Arc::new(StubSource {
            known: Some(commit),
        });
        let ci = StubCi::new("ci-0", vec![sample_pipeline("ci-0", "1", "sha1", 0)], 5);
        let cache = Cache::new(vec![source], vec![ci]);

        let (updates, mut updates_rx) = mpsc::channel(1);
        let (errors, _erx) = mpsc::unbounded_channel();

        let monitor = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .monitor_pipelines(
                        vec!["https://example.com/o/r".to_string()],
                        "main".to_string(),
                        None,
                        updates,
                        errors,
                    )
                    .await
            })
        };

        // A tick arrives, after which the snapshot contains the pipeline.
        updates_rx.recv().await.expect("update tick");
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                if !cache.pipelines(&resolved_ref("sha1")).is_empty() {
                    break;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("pipeline visible after tick");

        assert!(cache.commit("main").is_some());
        monitor.abort();
    }

    #[tokio::test]
    async fn test_monitor_reports_provider_errors_and_keeps_going() {
        let source = Arc::new(StubSource {
            known: Some(Commit {
                sha: "sha1".to_string(),
                ..Commit::default()
            }),
        });
        let failing = Arc::new(StubCi {
            id: "ci-bad".to_string(),
            pipelines: std::sync::Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            fail_after: Some(0),
        });
        let cache = Cache::new(vec![source], vec![failing]);

        let (updates, _updates_rx) = mpsc::channel(1);
        let (errors, mut errors_rx) = mpsc::unbounded_channel();

        let monitor = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .monitor_pipelines(
                        vec!["https://example.com/o/r".to_string()],
                        "main".to_string(),
                        None,
                        updates,
                        errors,
                    )
                    .await
            })
        };

        let err = errors_rx.recv().await.expect("error forwarded");
        assert!(matches!(err, CiwatchError::Api { status: 403, .. }));
        // The sole (degraded) task exits, so the monitor completes.
        assert!(monitor.await.unwrap().is_ok());
    }
}
