use chrono::{DateTime, Utc};

use crate::tui::table::{ColumnId, NodeId, TableNode};
use crate::tui::text::{Class, StyledString};
use crate::utils;

/// Maximum nesting of the execution tree (pipeline → stage → job → step).
pub const MAX_STEP_DEPTH: usize = 10;

/// Globally unique identity of one pipeline.
///
/// Ordered lexicographically so that snapshots render deterministically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PipelineKey {
    pub provider_id: String,
    pub id: String,
}

impl PipelineKey {
    pub fn new(provider_id: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            id: id.into(),
        }
    }
}

/// Commit metadata as resolved from a source provider or the local repository.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Commit {
    pub sha: String,
    pub message: String,
    pub author_date: Option<DateTime<Utc>>,
    pub committed_date: Option<DateTime<Utc>>,
    pub branches: Vec<String>,
    pub tags: Vec<String>,
}

impl Commit {
    /// Header lines shown above the pipeline table.
    pub fn styled_lines(&self) -> Vec<StyledString> {
        let mut lines = Vec::new();

        let mut title = StyledString::styled("commit ", Class::Emphasis);
        title.append_styled(&self.sha, Class::Emphasis);
        if !self.branches.is_empty() || !self.tags.is_empty() {
            let mut decorations: Vec<StyledString> = Vec::new();
            for branch in &self.branches {
                decorations.push(StyledString::styled(branch, Class::GitRef));
            }
            for tag in &self.tags {
                let mut s = StyledString::styled("tag: ", Class::GitRef);
                s.append_styled(tag, Class::GitRef);
                decorations.push(s);
            }
            title.append(" (");
            title.append_string(StyledString::join(decorations, StyledString::new(", ")));
            title.append(")");
        }
        lines.push(title);

        if let Some(date) = self.author_date {
            lines.push(StyledString::new(format!(
                "Date: {}",
                date.with_timezone(&chrono::Local).format("%a %b %e %T %Y %z")
            )));
        }

        if let Some(summary) = self.message.lines().next() {
            lines.push(StyledString::default());
            lines.push(StyledString::new(format!("    {summary}")));
        }

        lines
    }
}

/// User-facing git reference selector. Several refs may share a commit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GitRef {
    pub name: String,
    pub commit: Option<Commit>,
}

impl GitRef {
    pub fn sha(&self) -> Option<&str> {
        self.commit.as_ref().map(|c| c.sha.as_str())
    }
}

/// Execution state of a pipeline, stage, job or step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum State {
    #[default]
    Unknown,
    Pending,
    Running,
    Passed,
    Failed,
    Canceled,
    Skipped,
    Manual,
}

impl State {
    /// Precedence used when reducing children into a parent state.
    fn precedence(self) -> u8 {
        match self {
            State::Failed => 7,
            State::Running => 6,
            State::Canceled => 5,
            State::Pending => 4,
            State::Manual => 3,
            State::Passed => 2,
            State::Skipped => 1,
            State::Unknown => 0,
        }
    }

    /// Reduces a set of leaf states into the state of their parent.
    pub fn reduce<I: IntoIterator<Item = State>>(states: I) -> State {
        states
            .into_iter()
            .max_by_key(|s| s.precedence())
            .unwrap_or(State::Unknown)
    }

    pub fn display(self) -> &'static str {
        match self {
            State::Unknown => "unknown",
            State::Pending => "pending",
            State::Running => "running",
            State::Passed => "passed",
            State::Failed => "failed",
            State::Canceled => "canceled",
            State::Skipped => "skipped",
            State::Manual => "manual",
        }
    }

    fn class(self) -> Class {
        match self {
            State::Passed => Class::StatePassed,
            State::Failed => Class::StateFailed,
            State::Running => Class::StateRunning,
            State::Canceled => Class::StateCanceled,
            State::Pending | State::Manual => Class::StatePending,
            State::Skipped | State::Unknown => Class::StateMuted,
        }
    }
}

/// A node of the execution tree. Pipelines, stages, jobs and steps all
/// share this shape; rows in the table are steps.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Step {
    pub id: String,
    pub name: String,
    pub state: State,
    pub allow_failure: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub web_url: Option<String>,
    pub children: Vec<Step>,
}

impl Step {
    /// Duration of this node: `finished - started` when both are set,
    /// otherwise the accumulated duration of its children.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => {
                let mut total: Option<chrono::Duration> = None;
                for child in &self.children {
                    if let Some(d) = child.duration() {
                        total = Some(total.unwrap_or_else(chrono::Duration::zero) + d);
                    }
                }
                total
            }
        }
    }

    /// Recomputes the state of every non-leaf node from its leaves.
    /// Leaves flagged `allow_failure` count as skipped for the reduction.
    pub fn normalize(&mut self) {
        if self.children.is_empty() {
            return;
        }
        for child in &mut self.children {
            child.normalize();
        }
        self.state = State::reduce(self.children.iter().map(|c| {
            if c.allow_failure && c.state == State::Failed {
                State::Skipped
            } else {
                c.state
            }
        }));
    }

    /// Looks up a nested step by its id path, without touching siblings.
    pub fn find(&self, path: &[String]) -> Option<&Step> {
        match path.split_first() {
            None => Some(self),
            Some((id, rest)) => self
                .children
                .iter()
                .find(|c| c.id == *id)
                .and_then(|c| c.find(rest)),
        }
    }
}

/// One execution of a CI workflow for a commit, on one provider.
///
/// The root `step` carries the pipeline's own name, state and timestamps;
/// its children are the stages or jobs reported by the provider.
#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    pub key: PipelineKey,
    /// Display name of the provider instance that owns this pipeline.
    pub provider_name: String,
    pub git_ref: String,
    pub commit_sha: String,
    /// Repository-scoped build number, when the vendor has one.
    pub number: String,
    /// Monotonic per provider; stale values are dropped by the cache.
    pub updated_at: DateTime<Utc>,
    pub step: Step,
}

impl Pipeline {
    pub fn state(&self) -> State {
        self.step.state
    }

    fn display_number(&self) -> String {
        if self.number.is_empty() {
            format!("#{}", self.key.id)
        } else {
            format!("#{}", self.number)
        }
    }
}

const STEP_INHERITED: [ColumnId; 2] = [ColumnId::Type, ColumnId::Ref];

fn common_values(step: &Step, title: StyledString) -> std::collections::HashMap<ColumnId, StyledString> {
    let mut values = std::collections::HashMap::new();
    values.insert(ColumnId::Pipeline, title);
    values.insert(
        ColumnId::State,
        StyledString::styled(step.state.display(), step.state.class()),
    );
    if let Some(started) = step.started_at {
        values.insert(
            ColumnId::Started,
            StyledString::new(
                started
                    .with_timezone(&chrono::Local)
                    .format("%b %d %H:%M")
                    .to_string(),
            ),
        );
    }
    if let Some(finished) = step.finished_at {
        values.insert(
            ColumnId::Finished,
            StyledString::new(
                finished
                    .with_timezone(&chrono::Local)
                    .format("%b %d %H:%M")
                    .to_string(),
            ),
        );
    }
    if let Some(duration) = step.duration() {
        values.insert(
            ColumnId::Duration,
            StyledString::new(utils::format_duration(duration.num_seconds())),
        );
    }
    values
}

impl TableNode for Step {
    fn node_id(&self) -> NodeId {
        NodeId::Id(self.id.clone())
    }

    fn node_children(&self) -> Vec<&dyn TableNode> {
        self.children.iter().map(|c| c as &dyn TableNode).collect()
    }

    fn values(&self) -> std::collections::HashMap<ColumnId, StyledString> {
        common_values(self, StyledString::new(&self.name))
    }

    fn inherited_columns(&self) -> &[ColumnId] {
        &STEP_INHERITED
    }
}

impl TableNode for Pipeline {
    fn node_id(&self) -> NodeId {
        NodeId::Key(self.key.clone())
    }

    fn node_children(&self) -> Vec<&dyn TableNode> {
        self.step
            .children
            .iter()
            .map(|c| c as &dyn TableNode)
            .collect()
    }

    fn values(&self) -> std::collections::HashMap<ColumnId, StyledString> {
        let mut values = common_values(&self.step, StyledString::new(self.display_number()));
        values.insert(
            ColumnId::Type,
            StyledString::styled(&self.provider_name, Class::Provider),
        );
        values.insert(
            ColumnId::Ref,
            StyledString::styled(&self.git_ref, Class::GitRef),
        );
        values
    }

    fn inherited_columns(&self) -> &[ColumnId] {
        &[]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn leaf(id: &str, state: State) -> Step {
        Step {
            id: id.to_string(),
            name: id.to_string(),
            state,
            ..Step::default()
        }
    }

    #[test]
    fn test_key_ordering_is_lexicographic() {
        let a = PipelineKey::new("gitlab-0", "12");
        let b = PipelineKey::new("gitlab-0", "13");
        let c = PipelineKey::new("travis-0", "1");
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_reduce_priority_table() {
        use State::*;
        assert_eq!(State::reduce([Passed, Failed, Running]), Failed);
        assert_eq!(State::reduce([Passed, Running, Pending]), Running);
        assert_eq!(State::reduce([Passed, Canceled]), Canceled);
        assert_eq!(State::reduce([Skipped, Passed]), Passed);
        assert_eq!(State::reduce([Skipped, Unknown]), Skipped);
        assert_eq!(State::reduce(std::iter::empty()), Unknown);
    }

    #[test]
    fn test_normalize_recomputes_parents_from_leaves() {
        let mut root = Step {
            id: "p".to_string(),
            state: State::Passed,
            children: vec![
                Step {
                    id: "stage".to_string(),
                    state: State::Passed,
                    children: vec![leaf("a", State::Passed), leaf("b", State::Failed)],
                    ..Step::default()
                },
                leaf("c", State::Passed),
            ],
            ..Step::default()
        };
        root.normalize();
        assert_eq!(root.children[0].state, State::Failed);
        assert_eq!(root.state, State::Failed);
    }

    #[test]
    fn test_normalize_demotes_allowed_failures() {
        let mut failed_but_allowed = leaf("lint", State::Failed);
        failed_but_allowed.allow_failure = true;
        let mut root = Step {
            id: "p".to_string(),
            children: vec![failed_but_allowed, leaf("build", State::Passed)],
            ..Step::default()
        };
        root.normalize();
        assert_eq!(root.state, State::Passed);
    }

    #[test]
    fn test_duration_prefers_own_timestamps() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let step = Step {
            id: "j".to_string(),
            started_at: Some(start),
            finished_at: Some(start + chrono::Duration::seconds(90)),
            children: vec![leaf("x", State::Passed)],
            ..Step::default()
        };
        assert_eq!(step.duration(), Some(chrono::Duration::seconds(90)));
    }

    #[test]
    fn test_duration_accumulates_from_children() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let timed = |secs: i64| Step {
            id: format!("{secs}"),
            started_at: Some(start),
            finished_at: Some(start + chrono::Duration::seconds(secs)),
            ..Step::default()
        };
        let parent = Step {
            id: "stage".to_string(),
            children: vec![timed(10), timed(25), leaf("untimed", State::Pending)],
            ..Step::default()
        };
        assert_eq!(parent.duration(), Some(chrono::Duration::seconds(35)));
    }

    #[test]
    fn test_find_walks_the_id_path() {
        let root = Step {
            id: "p".to_string(),
            children: vec![Step {
                id: "stage".to_string(),
                children: vec![leaf("job", State::Passed)],
                ..Step::default()
            }],
            ..Step::default()
        };
        let path = ["stage".to_string(), "job".to_string()];
        assert_eq!(root.find(&path).map(|s| s.id.as_str()), Some("job"));
        assert!(root.find(&["stage".to_string(), "nope".to_string()]).is_none());
        assert_eq!(root.find(&[]).map(|s| s.id.as_str()), Some("p"));
    }
}
