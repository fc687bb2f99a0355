//! External batch engine invocation.
//!
//! The game engine is a DOS-era batch program run under an emulator. The
//! hub prepares a per-league work directory, runs the engine with a hard
//! time limit, and reads whatever it left behind. The child is killed on
//! timeout, on cancellation, and whenever the future is dropped.

use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::packet::LeagueId;

/// One league's engine pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineJob {
    pub league: LeagueId,
    pub work_dir: PathBuf,
    pub inbound_dir: PathBuf,
    pub outbound_dir: PathBuf,
    pub timeout: Duration,
}

impl EngineJob {
    /// Standard layout: `inbound/` and `outbound/` under the work directory.
    pub fn new(league: LeagueId, work_dir: PathBuf, timeout: Duration) -> Self {
        Self {
            league,
            inbound_dir: work_dir.join("inbound"),
            outbound_dir: work_dir.join("outbound"),
            work_dir,
            timeout,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub duration: Duration,
    /// Report commands that failed; informational only.
    pub warnings: Vec<String>,
}

impl EngineOutput {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine command not found: {0}")]
    CommandNotFound(String),

    #[error("engine timed out after {0}s")]
    Timeout(u64),

    #[error("engine run cancelled")]
    Cancelled,

    #[error("engine I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("engine output capture failed: {0}")]
    OutputCaptureFailed(String),
}

#[async_trait]
pub trait Engine: Send + Sync {
    async fn run(
        &self,
        job: &EngineJob,
        cancel: &CancellationToken,
    ) -> Result<EngineOutput, EngineError>;
}

/// Runs a configured program. Arguments may use `{league}`, `{number}`,
/// `{game}`, `{workdir}`, `{inbound}` and `{outbound}` placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEngine {
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    report_commands: Vec<Vec<String>>,
}

impl ProcessEngine {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            env: BTreeMap::new(),
            report_commands: Vec::new(),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            env: config.env.clone(),
            report_commands: config.report_commands.clone(),
        }
    }

    pub fn with_report_command(mut self, command: Vec<String>) -> Self {
        self.report_commands.push(command);
        self
    }

    fn command(&self, program: &str, args: &[String], job: &EngineJob) -> Command {
        let mut command = Command::new(expand(program, job));
        command
            .args(args.iter().map(|arg| expand(arg, job)))
            .envs(&self.env)
            .env("NOVA_LEAGUE", job.league.to_string())
            .env("NOVA_WORKDIR", &job.work_dir)
            .env("NOVA_INBOUND", &job.inbound_dir)
            .env("NOVA_OUTBOUND", &job.outbound_dir)
            .current_dir(&job.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

fn expand(template: &str, job: &EngineJob) -> String {
    template
        .replace("{league}", &job.league.to_string())
        .replace("{number}", &job.league.number_str())
        .replace("{game}", &job.league.game().to_string())
        .replace("{workdir}", &path_str(&job.work_dir))
        .replace("{inbound}", &path_str(&job.inbound_dir))
        .replace("{outbound}", &path_str(&job.outbound_dir))
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[async_trait]
impl Engine for ProcessEngine {
    async fn run(
        &self,
        job: &EngineJob,
        cancel: &CancellationToken,
    ) -> Result<EngineOutput, EngineError> {
        let mut command = self.command(&self.program, &self.args, job);
        let mut output = run_bounded(&mut command, &self.program, job.timeout, cancel).await?;
        if !output.succeeded() {
            return Ok(output);
        }

        for report in &self.report_commands {
            let Some((program, args)) = report.split_first() else {
                continue;
            };
            let mut command = self.command(program, args, job);
            let label = report.join(" ");
            match run_bounded(&mut command, program, job.timeout, cancel).await {
                Ok(result) if result.succeeded() => {}
                Ok(result) => {
                    tracing::warn!(
                        league = %job.league,
                        command = %label,
                        exit_code = ?result.exit_code,
                        "report command failed"
                    );
                    output.warnings.push(format!(
                        "{label}: exited with {:?}: {}",
                        result.exit_code,
                        result.stderr.trim()
                    ));
                }
                Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
                Err(err) => {
                    tracing::warn!(league = %job.league, command = %label, "report command failed: {err}");
                    output.warnings.push(format!("{label}: {err}"));
                }
            }
        }
        Ok(output)
    }
}

async fn run_bounded(
    command: &mut Command,
    program: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<EngineOutput, EngineError> {
    let start = Instant::now();
    let mut child = command.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            EngineError::CommandNotFound(program.to_string())
        } else {
            EngineError::Io(e)
        }
    })?;

    let stdout_handle = tokio::spawn({
        let stdout = child.stdout.take().ok_or_else(|| {
            EngineError::OutputCaptureFailed("stdout pipe unavailable".to_string())
        })?;
        async move {
            let mut reader = BufReader::new(stdout);
            let mut output = Vec::new();
            reader.read_to_end(&mut output).await?;
            Ok::<Vec<u8>, std::io::Error>(output)
        }
    });
    let stderr_handle = tokio::spawn({
        let stderr = child.stderr.take().ok_or_else(|| {
            EngineError::OutputCaptureFailed("stderr pipe unavailable".to_string())
        })?;
        async move {
            let mut reader = BufReader::new(stderr);
            let mut output = Vec::new();
            reader.read_to_end(&mut output).await?;
            Ok::<Vec<u8>, std::io::Error>(output)
        }
    });

    let status = tokio::select! {
        waited = tokio::time::timeout(timeout, child.wait()) => match waited {
            Ok(status) => status?,
            Err(_) => {
                terminate(&mut child).await;
                return Err(EngineError::Timeout(timeout.as_secs()));
            }
        },
        _ = cancel.cancelled() => {
            terminate(&mut child).await;
            return Err(EngineError::Cancelled);
        }
    };

    let stdout = collect(stdout_handle, "stdout").await?;
    let stderr = collect(stderr_handle, "stderr").await?;

    Ok(EngineOutput {
        stdout,
        stderr,
        exit_code: status.code(),
        duration: start.elapsed(),
        warnings: Vec::new(),
    })
}

async fn terminate(child: &mut Child) {
    if let Err(err) = child.kill().await {
        tracing::warn!("failed to kill engine process: {err}");
    }
}

async fn collect(
    handle: tokio::task::JoinHandle<std::io::Result<Vec<u8>>>,
    stream: &str,
) -> Result<String, EngineError> {
    let bytes = handle
        .await
        .map_err(|e| EngineError::OutputCaptureFailed(format!("{stream} task join error: {e}")))??;
    // Emulator consoles emit ANSI; keep logs readable.
    let stripped = strip_ansi_escapes::strip(&bytes);
    Ok(String::from_utf8_lossy(&stripped).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn job(dir: &Path, timeout: Duration) -> EngineJob {
        EngineJob::new("555B".parse().unwrap(), dir.to_path_buf(), timeout)
    }

    fn sh(script: &str) -> ProcessEngine {
        ProcessEngine::new("sh", vec!["-c".to_string(), script.to_string()])
    }

    #[tokio::test]
    async fn expands_placeholders_and_captures_output() {
        let dir = tempfile::tempdir().unwrap();
        let engine = sh("echo {league} {number} {game} $NOVA_LEAGUE");
        let output = engine
            .run(&job(dir.path(), Duration::from_secs(10)), &CancellationToken::new())
            .await
            .unwrap();
        assert!(output.succeeded());
        assert_eq!(output.stdout.trim(), "555B 555 B 555B");
    }

    #[tokio::test]
    async fn runs_in_work_dir() {
        let dir = tempfile::tempdir().unwrap();
        let engine = sh("touch marker.txt");
        engine
            .run(&job(dir.path(), Duration::from_secs(10)), &CancellationToken::new())
            .await
            .unwrap();
        assert!(dir.path().join("marker.txt").exists());
    }

    #[tokio::test]
    async fn non_zero_exit_is_reported_not_raised() {
        let dir = tempfile::tempdir().unwrap();
        let output = sh("echo boom >&2; exit 3")
            .run(&job(dir.path(), Duration::from_secs(10)), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(output.exit_code, Some(3));
        assert_eq!(output.stderr.trim(), "boom");
    }

    #[tokio::test]
    async fn timeout_kills_the_process() {
        let dir = tempfile::tempdir().unwrap();
        let started = Instant::now();
        let result = sh("sleep 30")
            .run(&job(dir.path(), Duration::from_millis(200)), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(EngineError::Timeout(_))));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn cancellation_kills_the_process() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let result = sh("sleep 30")
            .run(&job(dir.path(), Duration::from_secs(30)), &cancel)
            .await;
        assert!(matches!(result, Err(EngineError::Cancelled)));
    }

    #[tokio::test]
    async fn missing_program_is_command_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let result = ProcessEngine::new("nonexistent_engine_xyz_12345", Vec::new())
            .run(&job(dir.path(), Duration::from_secs(5)), &CancellationToken::new())
            .await;
        match result {
            Err(EngineError::CommandNotFound(cmd)) => {
                assert_eq!(cmd, "nonexistent_engine_xyz_12345")
            }
            other => panic!("expected CommandNotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn failing_report_command_is_a_warning() {
        let dir = tempfile::tempdir().unwrap();
        let engine = sh("true").with_report_command(vec![
            "sh".to_string(),
            "-c".to_string(),
            "exit 9".to_string(),
        ]);
        let output = engine
            .run(&job(dir.path(), Duration::from_secs(10)), &CancellationToken::new())
            .await
            .unwrap();
        assert!(output.succeeded());
        assert_eq!(output.warnings.len(), 1);
        assert!(output.warnings[0].contains("Some(9)"));
    }
}
