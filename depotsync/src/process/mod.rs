//! Post-processing of a downloaded content tree.
//!
//! A [`PostProcessor`] turns the raw download directory into the directory
//! that gets published. [`CommandProcessor`] runs a configured executable
//! with `<fixed args...> <input> <output>`; [`MirrorProcessor`] copies the
//! input unchanged and is used when no command is configured.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

use crate::session::BoxFuture;

/// Result type for post-processing.
pub type ProcessResult<T> = Result<T, ProcessError>;

/// Errors from post-processing.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The processor ran but reported failure.
    #[error("'{program}' exited with {code:?}: {stderr}")]
    ExitStatus {
        program: PathBuf,
        code: Option<i32>,
        stderr: String,
    },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("blocking task failed: {0}")]
    Task(String),
}

/// Transforms an input tree into an output tree.
pub trait PostProcessor: Send + Sync {
    /// Process `input` into `output`. `output` exists and is empty.
    fn process<'a>(&'a self, input: &'a Path, output: &'a Path) -> BoxFuture<'a, ProcessResult<()>>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Runs an external executable.
#[derive(Clone, Debug)]
pub struct CommandProcessor {
    program: PathBuf,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl CommandProcessor {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    /// Fixed arguments placed before the input and output directories.
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    async fn run(&self, input: &Path, output: &Path) -> ProcessResult<()> {
        let input = absolute(input).await?;
        let output = absolute(output).await?;

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(&input)
            .arg(&output)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        info!(
            program = %self.program.display(),
            input = %input.display(),
            output = %output.display(),
            "Running post-processor"
        );

        let result = command.output().await.map_err(|source| ProcessError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        let stdout = String::from_utf8_lossy(&result.stdout);
        for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
            debug!(target: "depotsync::process::output", "{}", line);
        }

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(ProcessError::ExitStatus {
                program: self.program.clone(),
                code: result.status.code(),
                stderr: stderr.trim().to_string(),
            });
        }
        Ok(())
    }
}

impl PostProcessor for CommandProcessor {
    fn process<'a>(&'a self, input: &'a Path, output: &'a Path) -> BoxFuture<'a, ProcessResult<()>> {
        Box::pin(self.run(input, output))
    }

    fn name(&self) -> &'static str {
        "command"
    }
}

async fn absolute(path: &Path) -> ProcessResult<PathBuf> {
    tokio::fs::canonicalize(path)
        .await
        .map_err(|source| ProcessError::Io {
            path: path.to_path_buf(),
            source,
        })
}

/// Copies the input tree to the output unchanged.
#[derive(Clone, Copy, Debug, Default)]
pub struct MirrorProcessor;

impl PostProcessor for MirrorProcessor {
    fn process<'a>(&'a self, input: &'a Path, output: &'a Path) -> BoxFuture<'a, ProcessResult<()>> {
        let input = input.to_path_buf();
        let output = output.to_path_buf();
        Box::pin(async move {
            let count = tokio::task::spawn_blocking(move || copy_tree(&input, &output))
                .await
                .map_err(|e| ProcessError::Task(e.to_string()))??;
            debug!(files = count, "Mirrored content tree");
            Ok(())
        })
    }

    fn name(&self) -> &'static str {
        "mirror"
    }
}

/// Copy every file and directory under `src` into `dest`.
///
/// Returns the number of files copied.
pub fn copy_tree(src: &Path, dest: &Path) -> ProcessResult<usize> {
    fs::create_dir_all(dest).map_err(io_error(dest))?;

    let mut count = 0;
    for entry in fs::read_dir(src).map_err(io_error(src))? {
        let entry = entry.map_err(io_error(src))?;
        let from = entry.path();
        let to = dest.join(entry.file_name());
        let file_type = entry.file_type().map_err(io_error(&from))?;

        if file_type.is_dir() {
            count += copy_tree(&from, &to)?;
        } else {
            fs::copy(&from, &to).map_err(io_error(&to))?;
            count += 1;
        }
    }
    Ok(count)
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ProcessError {
    let path = path.to_path_buf();
    move |source| ProcessError::Io { path, source }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_tree(root: &Path) {
        fs::create_dir_all(root.join("maps/empty")).unwrap();
        fs::write(root.join("readme.txt"), b"hi").unwrap();
        fs::write(root.join("maps/level1.bsp"), b"bsp").unwrap();
    }

    #[test]
    fn test_copy_tree_counts_files() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        let dest = temp.path().join("dest");
        sample_tree(&src);

        assert_eq!(copy_tree(&src, &dest).unwrap(), 2);
        assert_eq!(fs::read(dest.join("maps/level1.bsp")).unwrap(), b"bsp");
        assert!(dest.join("maps/empty").is_dir());
    }

    #[tokio::test]
    async fn test_mirror_processor() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        let dest = temp.path().join("dest");
        sample_tree(&src);
        fs::create_dir_all(&dest).unwrap();

        MirrorProcessor.process(&src, &dest).await.unwrap();
        assert_eq!(fs::read(dest.join("readme.txt")).unwrap(), b"hi");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_processor_receives_dirs_after_fixed_args() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        let dest = temp.path().join("dest");
        sample_tree(&src);
        fs::create_dir_all(&dest).unwrap();

        let processor = CommandProcessor::new("sh").with_args(vec![
            "-c".to_string(),
            "cp -R \"$0\"/. \"$1\"".to_string(),
        ]);
        processor.process(&src, &dest).await.unwrap();

        assert_eq!(fs::read(dest.join("maps/level1.bsp")).unwrap(), b"bsp");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_processor_nonzero_exit_is_error() {
        let temp = TempDir::new().unwrap();
        let processor = CommandProcessor::new("sh").with_args(vec![
            "-c".to_string(),
            "echo broken >&2; exit 3".to_string(),
        ]);

        let err = processor
            .process(temp.path(), temp.path())
            .await
            .unwrap_err();
        match err {
            ProcessError::ExitStatus { code, stderr, .. } => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "broken");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let temp = TempDir::new().unwrap();
        let processor = CommandProcessor::new("/nonexistent/depotsync-processor");
        let err = processor
            .process(temp.path(), temp.path())
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { .. }));
    }
}
