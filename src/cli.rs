use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use crate::cache::Cache;
use crate::config::Config;
use crate::tui;
use crate::tui::controller::Controller;

/// Monitor CI pipelines associated with a commit of a git repository.
#[derive(Parser)]
#[command(name = "ciwatch")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Git repository to monitor. A path is interpreted as a local
    /// repository and all of its remotes are watched; anything else is
    /// treated as the URL of an online repository. Defaults to the
    /// current directory.
    #[arg(short, long)]
    repository: Option<String>,

    /// Commit to monitor: a SHA, tag or branch name. Defaults to HEAD.
    commit: Option<String>,
}

impl Cli {
    pub async fn execute(self) -> Result<()> {
        let repository = match self.repository {
            Some(repository) => repository,
            None => std::env::current_dir()
                .context("Failed to determine the current directory")?
                .to_string_lossy()
                .into_owned(),
        };
        let commit = self.commit.unwrap_or_else(|| "HEAD".to_string());

        let (config, found) = Config::load(None)?;
        if !found {
            let location = Config::default_path()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "the XDG configuration directory".to_string());
            eprintln!(
                "warning: no configuration file found at {location}, using default configuration without credentials.\n\
                 Please note that:\n\
                 \x20   - ciwatch will likely reach the rate limit of the GitHub API for unauthenticated clients in a few minutes\n\
                 \x20   - ciwatch will not be able to access pipeline jobs on GitLab without an API access token"
            );
        } else if config.gitlab_missing_token() {
            eprintln!(
                "warning: ciwatch will not be able to access pipeline jobs on GitLab without an API access token"
            );
        }

        let (source_providers, ci_providers) = config.providers.build()?;
        info!(
            "monitoring {repository}@{commit} with {} CI provider(s)",
            ci_providers.len()
        );
        let cache = Cache::new(source_providers, ci_providers);

        let mut terminal = tui::setup_terminal()?;
        let mut events = tui::InputEvents::start();
        let size = terminal.size()?;
        let controller = Controller::new(
            cache,
            repository,
            commit,
            size.width as usize,
            size.height as usize,
        );

        let outcome = controller.run(&mut terminal, &mut events).await;
        tui::restore_terminal(&mut terminal)?;
        match outcome {
            // Cooperative cancellation is a normal way out.
            Ok(()) | Err(crate::error::CiwatchError::Canceled) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
