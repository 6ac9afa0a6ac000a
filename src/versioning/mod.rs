//! Version history through an external version-control tool

pub mod log;

use std::path::Path;

pub use log::{parse_log, CommitRecord};

use crate::error::{FolioError, Result};
use crate::process::{CommandRunner, ProcessRunner};

/// Default version-control program
pub const DEFAULT_PROGRAM: &str = "git";

/// Issues version-control commands against a working directory
#[derive(Debug, Clone)]
pub struct VersioningClient<R = ProcessRunner> {
    runner: R,
    program: String,
}

impl Default for VersioningClient<ProcessRunner> {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRAM)
    }
}

impl VersioningClient<ProcessRunner> {
    /// Create a client that spawns `program` as a real subprocess
    pub fn new(program: impl Into<String>) -> Self {
        Self::with_runner(ProcessRunner::new(), program)
    }
}

impl<R: CommandRunner> VersioningClient<R> {
    /// Create a client on top of an arbitrary runner
    pub fn with_runner(runner: R, program: impl Into<String>) -> Self {
        Self {
            runner,
            program: program.into(),
        }
    }

    /// Initialize a repository in `directory`; safe on an existing repository
    pub async fn init_repository(&self, directory: &Path) -> Result<String> {
        let output = self.git(directory, &["init"]).await?;
        tracing::info!(dir = %directory.display(), "Initialized repository");
        Ok(output)
    }

    /// Stage everything in `directory` and record a commit with `message`
    pub async fn commit(&self, message: &str, directory: &Path) -> Result<String> {
        if message.trim().is_empty() {
            return Err(FolioError::EmptyCommitMessage);
        }

        self.git(directory, &["add", "-A"]).await?;
        let output = self.git(directory, &["commit", "-m", message]).await?;
        tracing::info!(dir = %directory.display(), "Recorded version");
        Ok(output)
    }

    /// History of `file`, most recent first; empty when nothing was committed yet
    pub async fn log(&self, file: &Path, directory: &Path) -> Result<Vec<CommitRecord>> {
        // Not a repository (or an unreadable one) is the caller's problem.
        self.git(directory, &["rev-parse", "--git-dir"]).await?;

        // Inside a repository, only an unborn HEAD makes this fail.
        match self
            .git(directory, &["rev-parse", "--verify", "--quiet", "HEAD"])
            .await
        {
            Ok(_) => {}
            Err(FolioError::ToolFailure { .. }) => {
                tracing::debug!(dir = %directory.display(), "No commits yet");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        }

        let file = file.to_string_lossy();
        let output = self
            .git(directory, &["log", log::LOG_FORMAT, "--", &*file])
            .await?;
        Ok(parse_log(&output))
    }

    /// Short-form status text of `directory`
    pub async fn status(&self, directory: &Path) -> Result<String> {
        self.git(directory, &["status", "--short"]).await
    }

    /// Whether `directory` has anything to commit; any failure reads as "no"
    pub async fn has_changes(&self, directory: &Path) -> bool {
        match self.status(directory).await {
            Ok(status) => !status.trim().is_empty(),
            Err(e) => {
                tracing::debug!(dir = %directory.display(), error = %e, "Status failed, reporting no changes");
                false
            }
        }
    }

    async fn git(&self, directory: &Path, args: &[&str]) -> Result<String> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        self.runner.run(&self.program, &args, Some(directory)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Invocation {
        program: String,
        args: Vec<String>,
        cwd: Option<PathBuf>,
    }

    #[derive(Clone, Default)]
    struct RecordingRunner {
        calls: Arc<Mutex<Vec<Invocation>>>,
        responses: Arc<Mutex<VecDeque<Result<String>>>>,
    }

    impl RecordingRunner {
        fn new(responses: Vec<Result<String>>) -> Self {
            Self {
                calls: Arc::default(),
                responses: Arc::new(Mutex::new(VecDeque::from(responses))),
            }
        }

        fn calls(&self) -> Vec<Invocation> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl CommandRunner for RecordingRunner {
        async fn run(&self, program: &str, args: &[String], cwd: Option<&Path>) -> Result<String> {
            self.calls.lock().unwrap().push(Invocation {
                program: program.to_string(),
                args: args.to_vec(),
                cwd: cwd.map(Path::to_path_buf),
            });
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .expect("missing canned response")
        }
    }

    fn failure(output: &str) -> Result<String> {
        Err(FolioError::ToolFailure {
            command: "git".to_string(),
            code: Some(1),
            output: output.to_string(),
        })
    }

    fn client(runner: &RecordingRunner) -> VersioningClient<RecordingRunner> {
        VersioningClient::with_runner(runner.clone(), "git")
    }

    #[tokio::test]
    async fn test_empty_message_runs_nothing() {
        let runner = RecordingRunner::new(vec![]);
        let err = client(&runner)
            .commit("   ", Path::new("/docs"))
            .await
            .unwrap_err();
        assert!(matches!(err, FolioError::EmptyCommitMessage));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_commit_stages_then_commits() {
        let runner = RecordingRunner::new(vec![
            Ok(String::new()),
            Ok("[main 1a2b3c4] notes".to_string()),
        ]);
        let output = client(&runner)
            .commit("notes", Path::new("/docs"))
            .await
            .unwrap();
        assert_eq!(output, "[main 1a2b3c4] notes");

        let calls = runner.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].args, ["add", "-A"]);
        assert_eq!(calls[1].args, ["commit", "-m", "notes"]);
        assert_eq!(calls[1].cwd.as_deref(), Some(Path::new("/docs")));
        assert_eq!(calls[1].program, "git");
    }

    #[tokio::test]
    async fn test_commit_failure_keeps_diagnostic() {
        let runner = RecordingRunner::new(vec![
            Ok(String::new()),
            failure("nothing to commit, working tree clean"),
        ]);
        let err = client(&runner)
            .commit("notes", Path::new("/docs"))
            .await
            .unwrap_err();
        match err {
            FolioError::ToolFailure { output, .. } => {
                assert_eq!(output, "nothing to commit, working tree clean")
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_log_without_commits_is_empty() {
        let runner = RecordingRunner::new(vec![Ok(".git".to_string()), failure("")]);
        let records = client(&runner)
            .log(Path::new("a.md"), Path::new("/docs"))
            .await
            .unwrap();
        assert!(records.is_empty());
        assert_eq!(runner.calls().len(), 2);
        assert_eq!(runner.calls()[0].args, ["rev-parse", "--git-dir"]);
    }

    #[tokio::test]
    async fn test_log_outside_repository_is_an_error() {
        let runner = RecordingRunner::new(vec![failure(
            "fatal: not a git repository (or any of the parent directories): .git",
        )]);
        let err = client(&runner)
            .log(Path::new("a.md"), Path::new("/docs"))
            .await
            .unwrap_err();
        match err {
            FolioError::ToolFailure { output, .. } => {
                assert!(output.starts_with("fatal: not a git repository"))
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_log_restricts_to_file() {
        let runner = RecordingRunner::new(vec![
            Ok(".git".to_string()),
            Ok("abc1234".to_string()),
            Ok("b2\u{1f}second\u{1f}2024-03-02T10:00:00Z\na1\u{1f}first\u{1f}2024-03-01T10:00:00Z"
                .to_string()),
        ]);
        let records = client(&runner)
            .log(Path::new("notes/a.md"), Path::new("/docs"))
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].message, "second");

        let calls = runner.calls();
        assert_eq!(calls[2].args[0], "log");
        assert_eq!(calls[2].args[1], log::LOG_FORMAT);
        assert_eq!(&calls[2].args[3..], ["notes/a.md"]);
        assert_eq!(calls[2].args[2], "--");
    }

    #[tokio::test]
    async fn test_log_for_uncommitted_file_is_empty() {
        let runner = RecordingRunner::new(vec![
            Ok(".git".to_string()),
            Ok("abc1234".to_string()),
            Ok(String::new()),
        ]);
        let records = client(&runner)
            .log(Path::new("new.md"), Path::new("/docs"))
            .await
            .unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_has_changes() {
        let runner = RecordingRunner::new(vec![
            Ok(" M a.md".to_string()),
            Ok(String::new()),
            failure("fatal: not a git repository"),
        ]);
        let client = client(&runner);
        let dir = Path::new("/docs");
        assert!(client.has_changes(dir).await);
        assert!(!client.has_changes(dir).await);
        assert!(!client.has_changes(dir).await);
    }

    #[tokio::test]
    async fn test_init_runs_init() {
        let runner = RecordingRunner::new(vec![Ok("Initialized empty Git repository".to_string())]);
        client(&runner).init_repository(Path::new("/docs")).await.unwrap();
        assert_eq!(runner.calls()[0].args, ["init"]);
    }
}
