use std::sync::OnceLock;

use regex::Regex;

use crate::error::{CiwatchError, Result};

/// ANSI escape sequences: `ESC <intermediate bytes> <final byte>`.
fn ansi_escape() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\x1b[@-_][0-?]*[ -/]*[@-~]").expect("valid regex"))
}

/// Turn `aaa\rbbb\rccc\r\n` into `ccc\r\n`. Travis logs hide progress
/// metadata behind carriage returns.
fn until_carriage_return() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r".*\r([^\r\n])").expect("valid regex"))
}

/// Cleans a raw job log for display: strips ANSI escape sequences, then
/// collapses carriage-return rewrites to the text after the last `\r`.
///
/// Applies to complete buffers only; partial reads would split escape
/// sequences and carriage-return runs at arbitrary points.
pub fn postprocess_log(log: &str) -> String {
    let stripped = ansi_escape().replace_all(log, "");
    until_carriage_return()
        .replace_all(&stripped, "$1")
        .into_owned()
}

/// Format a duration in seconds into a human-readable string (e.g. "2m 5s").
pub fn format_duration(secs: i64) -> String {
    let secs = secs.max(0);
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}

/// Clamp `a` into `[lower, upper]`.
pub fn bounded(a: isize, lower: isize, upper: isize) -> isize {
    a.max(lower).min(upper)
}

/// Euclidean remainder, always in `[0, b)`.
pub fn modulo(a: isize, b: isize) -> isize {
    a.rem_euclid(b)
}

/// Extracts the `owner/repository` slug from a repository URL.
///
/// Accepts https URLs and `git@host:owner/repo.git` scp-like syntax.
pub fn repository_slug(repository_url: &str) -> Result<String> {
    let mut normalized = repository_url.to_string();
    if let Some(rest) = normalized.strip_prefix("git@") {
        normalized = format!("https://{}", rest.replacen(':', "/", 1));
    }
    let normalized = normalized.trim_end_matches(".git");

    let url = url::Url::parse(normalized)
        .map_err(|_| CiwatchError::UnknownRepositoryUrl(repository_url.to_string()))?;

    let components: Vec<&str> = url
        .path()
        .split('/')
        .filter(|c| !c.is_empty())
        .collect();
    if components.len() < 2 {
        return Err(CiwatchError::UnknownRepositoryUrl(repository_url.to_string()));
    }

    Ok(format!("{}/{}", components[0], components[1]))
}

/// Host of a repository URL, used by clients to skip foreign remotes.
pub fn repository_host(repository_url: &str) -> Option<String> {
    let mut normalized = repository_url.to_string();
    if let Some(rest) = normalized.strip_prefix("git@") {
        normalized = format!("https://{}", rest.replacen(':', "/", 1));
    }
    url::Url::parse(&normalized)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_postprocess_strips_ansi_sequences() {
        assert_eq!(postprocess_log("\x1b[31mred\x1b[0m"), "red");
        assert_eq!(postprocess_log("plain text"), "plain text");
    }

    #[test]
    fn test_postprocess_collapses_carriage_returns() {
        assert_eq!(postprocess_log("aaa\rbbb\rccc\r\n"), "ccc\r\n");
        assert_eq!(postprocess_log("foo\rbar\rbaz\n"), "baz\n");
    }

    #[test]
    fn test_postprocess_combined() {
        assert_eq!(
            postprocess_log("foo\rbar\rbaz\n\x1b[31mred"),
            "baz\nred"
        );
    }

    #[test]
    fn test_postprocess_is_idempotent() {
        let cases = [
            "foo\rbar\rbaz\n\x1b[31mred",
            "download  1%\rdownload 99%\rdownload 100%\r\ndone\n",
            "",
            "no rewrites here\n",
        ];
        for case in cases {
            let once = postprocess_log(case);
            assert_eq!(postprocess_log(&once), once, "input {case:?}");
        }
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0), "0s");
        assert_eq!(format_duration(59), "59s");
        assert_eq!(format_duration(125), "2m 5s");
        assert_eq!(format_duration(3720), "1h 2m");
        assert_eq!(format_duration(-5), "0s");
    }

    #[test]
    fn test_bounded_and_modulo() {
        assert_eq!(bounded(5, 0, 3), 3);
        assert_eq!(bounded(-1, 0, 3), 0);
        assert_eq!(bounded(2, 0, 3), 2);
        assert_eq!(modulo(-1, 4), 3);
        assert_eq!(modulo(5, 4), 1);
    }

    #[test]
    fn test_repository_slug() {
        assert_eq!(
            repository_slug("https://github.com/owner/repo.git").unwrap(),
            "owner/repo"
        );
        assert_eq!(
            repository_slug("git@gitlab.com:group/project.git").unwrap(),
            "group/project"
        );
        assert_eq!(
            repository_slug("https://gitlab.com/group/project/extra").unwrap(),
            "group/project"
        );
        assert!(repository_slug("https://example.com/onlyone").is_err());
    }

    #[test]
    fn test_repository_host() {
        assert_eq!(
            repository_host("git@github.com:o/r.git").as_deref(),
            Some("github.com")
        );
        assert_eq!(
            repository_host("https://gitlab.example.com/o/r").as_deref(),
            Some("gitlab.example.com")
        );
    }
}
