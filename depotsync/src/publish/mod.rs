//! Publishing of a synchronized content tree.
//!
//! [`GitPublisher`] stages, commits and pushes a repository with the `git`
//! CLI. An empty commit is not an error and a failed push is only logged:
//! publishing never invalidates a synchronization that already succeeded.

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};

use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::session::BoxFuture;

/// Result type for publishing.
pub type PublishResult<T> = Result<T, PublishError>;

/// Errors from publishing.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to run git: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("git {step} failed with {code:?}: {stderr}")]
    Git {
        step: &'static str,
        code: Option<i32>,
        stderr: String,
    },
}

/// Hands a finalized directory to version control.
pub trait Publisher: Send + Sync {
    /// Publish everything under `dir` with `message`.
    fn publish<'a>(&'a self, dir: &'a Path, message: &'a str) -> BoxFuture<'a, PublishResult<()>>;
}

/// Publisher that does nothing. Used when publishing is disabled.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopPublisher;

impl Publisher for NoopPublisher {
    fn publish<'a>(&'a self, dir: &'a Path, message: &'a str) -> BoxFuture<'a, PublishResult<()>> {
        Box::pin(async move {
            debug!(dir = %dir.display(), commit_message = message, "Publishing disabled, skipping");
            Ok(())
        })
    }
}

/// Git CLI settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GitConfig {
    pub remote: String,
    pub branch: String,
    pub author_name: Option<String>,
    pub author_email: Option<String>,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            remote: "origin".to_string(),
            branch: "main".to_string(),
            author_name: None,
            author_email: None,
        }
    }
}

/// Publishes through the `git` command line.
#[derive(Clone, Debug)]
pub struct GitPublisher {
    program: PathBuf,
    config: GitConfig,
}

impl GitPublisher {
    pub fn new(config: GitConfig) -> Self {
        Self {
            program: PathBuf::from("git"),
            config,
        }
    }

    async fn git(&self, dir: &Path, args: &[&str]) -> PublishResult<Output> {
        let mut command = Command::new(&self.program);
        if let Some(name) = &self.config.author_name {
            command.arg("-c").arg(format!("user.name={}", name));
        }
        if let Some(email) = &self.config.author_email {
            command.arg("-c").arg(format!("user.email={}", email));
        }
        command
            .args(args)
            .current_dir(dir)
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(PublishError::Spawn)
    }

    fn failure(step: &'static str, output: &Output) -> PublishError {
        PublishError::Git {
            step,
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
    }

    async fn run(&self, dir: &Path, message: &str) -> PublishResult<()> {
        let add = self.git(dir, &["add", "-A"]).await?;
        if !add.status.success() {
            return Err(Self::failure("add", &add));
        }

        let commit = self.git(dir, &["commit", "-m", message]).await?;
        if commit.status.success() {
            info!(commit_message = message, "Committed");
        } else {
            let stdout = String::from_utf8_lossy(&commit.stdout);
            if stdout.contains("nothing to commit") || stdout.contains("nothing added to commit") {
                info!("Nothing to commit");
            } else {
                return Err(Self::failure("commit", &commit));
            }
        }

        let remotes = self.git(dir, &["remote"]).await?;
        let has_remote = String::from_utf8_lossy(&remotes.stdout)
            .lines()
            .any(|r| r.trim() == self.config.remote);
        if !has_remote {
            debug!(remote = %self.config.remote, "Remote not configured, not pushing");
            return Ok(());
        }

        match self
            .git(dir, &["push", self.config.remote.as_str(), self.config.branch.as_str()])
            .await
        {
            Ok(push) if push.status.success() => {
                info!(remote = %self.config.remote, branch = %self.config.branch, "Pushed");
            }
            Ok(push) => {
                warn!(error = %Self::failure("push", &push), "Push failed");
            }
            Err(e) => {
                warn!(error = %e, "Push failed");
            }
        }
        Ok(())
    }
}

impl Publisher for GitPublisher {
    fn publish<'a>(&'a self, dir: &'a Path, message: &'a str) -> BoxFuture<'a, PublishResult<()>> {
        Box::pin(self.run(dir, message))
    }
}
