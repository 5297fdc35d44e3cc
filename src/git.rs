use std::path::Path;

use chrono::{DateTime, Utc};
use log::debug;
use tokio::process::Command;

use crate::error::{CiwatchError, Result};
use crate::models::Commit;

async fn git_output(repository: &str, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .arg("-C")
        .arg(repository)
        .args(args)
        .output()
        .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(CiwatchError::Git(stderr.trim().to_string()));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Returns true when `repository` is (inside) a local git repository.
async fn is_repository(repository: &str) -> bool {
    Path::new(repository).is_dir()
        && git_output(repository, &["rev-parse", "--git-dir"]).await.is_ok()
}

/// Lists the fetch URLs of every remote known to the repository.
///
/// Fails with `UnknownRepositoryUrl` when the path is not a git repository,
/// which callers use to fall back to treating the input as a remote URL.
pub async fn remote_urls(repository: &str) -> Result<Vec<String>> {
    if !is_repository(repository).await {
        return Err(CiwatchError::UnknownRepositoryUrl(repository.to_string()));
    }

    let stdout = git_output(repository, &["remote", "--verbose"]).await?;
    let mut urls = Vec::new();
    for line in stdout.lines() {
        // "<name>\t<url> (fetch)"
        let mut fields = line.split_whitespace();
        let (Some(_name), Some(url), Some(direction)) =
            (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if direction == "(fetch)" && !urls.iter().any(|u| u == url) {
            urls.push(url.to_string());
        }
    }

    debug!("repository {repository}: {} remote url(s)", urls.len());
    Ok(urls)
}

/// Resolves a reference to full commit metadata using the local repository.
///
/// Branch/tag decorations are discovered with `--points-at`, matching what
/// the remote providers cannot tell us.
pub async fn resolve_commit(repository: &str, reference: &str) -> Result<Commit> {
    let spec = format!("{reference}^{{commit}}");
    let sha = git_output(repository, &["rev-parse", &spec])
        .await
        .map_err(|_| CiwatchError::UnknownRef(reference.to_string()))?
        .trim()
        .to_string();

    let raw = git_output(
        repository,
        &["show", "--quiet", "--format=%H%x00%aI%x00%cI%x00%B", &sha],
    )
    .await?;
    let mut fields = raw.splitn(4, '\0');
    let sha = fields.next().unwrap_or_default().trim().to_string();
    let author_date = fields.next().and_then(parse_iso_date);
    let committed_date = fields.next().and_then(parse_iso_date);
    let message = fields.next().unwrap_or_default().trim_end().to_string();

    let branches = points_at(repository, "branch", &sha).await;
    let tags = points_at(repository, "tag", &sha).await;

    Ok(Commit {
        sha,
        message,
        author_date,
        committed_date,
        branches,
        tags,
    })
}

async fn points_at(repository: &str, kind: &str, sha: &str) -> Vec<String> {
    let args = [kind, "--points-at", sha, "--format=%(refname:short)"];
    match git_output(repository, &args).await {
        Ok(stdout) => stdout
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect(),
        Err(_) => Vec::new(),
    }
}

fn parse_iso_date(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s.trim())
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

/// Branch and tag names offered as completions in the ref prompt.
pub async fn references(repository: &str) -> Result<Vec<String>> {
    let stdout = git_output(
        repository,
        &["for-each-ref", "--format=%(refname:short)", "refs/heads", "refs/tags"],
    )
    .await?;

    let mut refs = vec!["HEAD".to_string()];
    refs.extend(
        stdout
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty()),
    );
    refs.dedup();
    Ok(refs)
}
