//! Child-process plumbing shared by the tool adapters.

use std::process::{ExitStatus, Output, Stdio};

use tokio::process::Command;
use tracing::debug;

use crate::runtime::types::StageFailure;

/// Lines of stderr kept in a failure message.
const STDERR_TAIL_LINES: usize = 12;

/// Spawn `command` and collect its output without judging the exit status.
///
/// The child is killed if the returned future is dropped, which is what
/// happens when a stage times out.
pub(crate) async fn output(mut command: Command, description: &str) -> Result<Output, StageFailure> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    debug!(command = ?command.as_std(), "running {description}");

    command
        .output()
        .await
        .map_err(|e| StageFailure::collaborator(format!("{description}: failed to start: {e}")))
}

/// Like [`output`] but a non-zero exit is a collaborator failure carrying the
/// tail of stderr.
pub(crate) async fn run(command: Command, description: &str) -> Result<Output, StageFailure> {
    let output = output(command, description).await?;
    if !output.status.success() {
        return Err(exit_failure(description, &output));
    }
    Ok(output)
}

/// Whether `program` can be started at all.
pub(crate) async fn available(program: &std::path::Path) -> bool {
    let mut command = Command::new(program);
    command.arg("--version");
    output(command, "availability check").await.is_ok()
}

pub(crate) fn exit_failure(description: &str, output: &Output) -> StageFailure {
    let stderr = stderr_tail(&output.stderr);
    let status = exit_label(output.status);
    if stderr.is_empty() {
        StageFailure::collaborator(format!("{description} failed ({status})"))
    } else {
        StageFailure::collaborator(format!("{description} failed ({status}): {stderr}"))
    }
}

fn exit_label(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit {code}"),
        None => "terminated by signal".to_owned(),
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim_end)
        .filter(|l| !l.is_empty())
        .collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn stderr_tail_keeps_last_lines() {
        let text: String = (0..30).map(|n| format!("line {n}\n")).collect();
        let tail = stderr_tail(text.as_bytes());
        assert!(tail.starts_with("line 18"));
        assert!(tail.ends_with("line 29"));
        assert_eq!(tail.lines().count(), STDERR_TAIL_LINES);
    }

    #[test]
    fn stderr_tail_skips_blank_lines() {
        assert_eq!(stderr_tail(b"\n\nboom\n\n"), "boom");
        assert_eq!(stderr_tail(b""), "");
    }

    #[tokio::test]
    async fn missing_binary_is_a_collaborator_failure() {
        let command = Command::new("/nonexistent/lipsync-tool");
        let err = run(command, "fake tool").await.unwrap_err();
        assert_eq!(err.kind, crate::runtime::types::FailureKind::Collaborator);
        assert!(err.message.starts_with("fake tool: failed to start"));
        assert!(!available(std::path::Path::new("/nonexistent/lipsync-tool")).await);
    }
}
