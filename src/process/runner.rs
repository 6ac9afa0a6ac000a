//! Runs external tools with a discrete argument vector and captures their output

use std::future::Future;
use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;

use crate::error::{FolioError, Result};

/// Something that can run a program and hand back its merged, trimmed output.
///
/// The versioning client is generic over this so tests can substitute a
/// recording runner for the real process spawner.
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args` in `cwd` (or the current directory) and return
    /// stdout followed by stderr, trailing newlines removed
    fn run(
        &self,
        program: &str,
        args: &[String],
        cwd: Option<&Path>,
    ) -> impl Future<Output = Result<String>> + Send;
}

/// Spawns real processes through `tokio::process`
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

impl ProcessRunner {
    /// Create a new runner
    pub fn new() -> Self {
        Self
    }
}

impl CommandRunner for ProcessRunner {
    async fn run(&self, program: &str, args: &[String], cwd: Option<&Path>) -> Result<String> {
        let command_line = describe(program, args);

        // Arguments go straight to the program; nothing is handed to a shell.
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = cwd {
            command.current_dir(dir);
        }

        tracing::debug!(command = %command_line, cwd = ?cwd, "Running subprocess");

        let output = command.output().await.map_err(|source| FolioError::Spawn {
            command: command_line.clone(),
            source,
        })?;

        let mut merged = output.stdout;
        merged.extend_from_slice(&output.stderr);
        let text = String::from_utf8(merged).map_err(|_| FolioError::Decode {
            command: command_line.clone(),
        })?;
        let text = text.trim_end_matches(['\n', '\r']).to_string();

        if !output.status.success() {
            tracing::debug!(
                command = %command_line,
                code = ?output.status.code(),
                "Subprocess exited unsuccessfully"
            );
            return Err(FolioError::ToolFailure {
                command: command_line,
                code: output.status.code(),
                output: text,
            });
        }

        Ok(text)
    }
}

/// Human-readable form of a command for logs and error messages
fn describe(program: &str, args: &[String]) -> String {
    if args.is_empty() {
        program.to_string()
    } else {
        format!("{} {}", program, args.join(" "))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_run_captures_and_trims_output() {
        let output = ProcessRunner::new()
            .run("echo", &args(&["hello"]), None)
            .await
            .unwrap();
        assert_eq!(output, "hello");
    }

    #[tokio::test]
    async fn test_run_passes_arguments_without_shell() {
        let output = ProcessRunner::new()
            .run("echo", &args(&["a; rm -rf nothing", "$HOME"]), None)
            .await
            .unwrap();
        assert_eq!(output, "a; rm -rf nothing $HOME");
    }

    #[tokio::test]
    async fn test_run_uses_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let output = ProcessRunner::new()
            .run("pwd", &[], Some(dir.path()))
            .await
            .unwrap();
        let expected = dir.path().canonicalize().unwrap();
        assert_eq!(Path::new(&output).canonicalize().unwrap(), expected);
    }

    #[tokio::test]
    async fn test_nonzero_exit_carries_merged_output() {
        let err = ProcessRunner::new()
            .run("sh", &args(&["-c", "echo out; echo err >&2; exit 3"]), None)
            .await
            .unwrap_err();
        match err {
            FolioError::ToolFailure { code, output, .. } => {
                assert_eq!(code, Some(3));
                assert_eq!(output, "out\nerr");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_a_decode_error() {
        let err = ProcessRunner::new()
            .run("printf", &args(&["\\377\\376"]), None)
            .await
            .unwrap_err();
        assert!(matches!(err, FolioError::Decode { .. }));
    }

    #[tokio::test]
    async fn test_missing_program_is_a_spawn_error() {
        let err = ProcessRunner::new()
            .run("folio-no-such-program", &[], None)
            .await
            .unwrap_err();
        assert!(matches!(err, FolioError::Spawn { .. }));
    }
}
