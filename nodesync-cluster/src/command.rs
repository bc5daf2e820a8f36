//! Bounded external command execution for CLI-backed adapters
//!
//! Exit codes and raw output stay inside the adapters that call this; they
//! translate [`CommandOutput`] into typed results.

use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use nodesync_core::resilience::timeout;
use nodesync_core::{Error, Result};

/// Captured result of a finished command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Run `program` with `args`, optionally feeding `stdin`, within `limit`
///
/// The child is killed if the deadline passes. A missing binary is a
/// permanent failure; other spawn errors are classified by I/O kind.
pub async fn run(
    program: &str,
    args: &[String],
    stdin: Option<&[u8]>,
    limit: Duration,
    operation: &str,
) -> Result<CommandOutput> {
    timeout::bounded(limit, operation, async {
        let mut child = Command::new(program)
            .args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error(program, &e))?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input)
                .await
                .map_err(|e| Error::from_io(&format!("{operation}: writing stdin"), &e))?;
            // closing stdin signals end of input
            drop(pipe);
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Error::from_io(operation, &e))?;

        Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    })
    .await
}

fn spawn_error(program: &str, err: &std::io::Error) -> Error {
    match err.kind() {
        std::io::ErrorKind::NotFound => Error::Permanent(format!("{program}: executable not found")),
        std::io::ErrorKind::PermissionDenied => {
            Error::Permanent(format!("{program}: permission denied"))
        }
        _ => Error::from_io(&format!("spawning {program}"), err),
    }
}
