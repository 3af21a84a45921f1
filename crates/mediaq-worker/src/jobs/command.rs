//! Handler that runs an external command (a downloader, an encoder) as
//! one job attempt.
//!
//! Payload:
//!
//! ```json
//! {
//!   "program": "yt-dlp",
//!   "args": ["--newline", "https://example.com/v/1"],
//!   "working_dir": "/srv/media",
//!   "env": { "LANG": "C" },
//!   "permanent_exit_codes": [2]
//! }
//! ```
//!
//! Percentages printed on stdout (`42.5%`) become progress events, and
//! post-processor lines switch the job to its post-processing phase. A
//! non-zero exit is transient unless listed in `permanent_exit_codes`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use mediaq_entity::job::Job;

use crate::executor::{DEFAULT_DEPENDENCY, JobExecutionError, JobHandler, Operation};
use crate::progress::ProgressReporter;

/// Line prefixes that mark the start of post-processing.
const POST_PROCESS_MARKERS: [&str; 4] = ["[Merger]", "[ExtractAudio]", "[FixupM3u8]", "[post]"];

/// Characters of stderr kept for error messages.
const STDERR_TAIL: usize = 2000;

/// Parsed `command` job payload.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandPayload {
    /// Program to execute.
    pub program: String,
    /// Arguments passed verbatim.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory for the child process.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Extra environment variables.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Exit codes that mean the request can never succeed.
    #[serde(default)]
    pub permanent_exit_codes: Vec<i32>,
}

impl CommandPayload {
    fn parse(payload: &Value) -> Result<Self, String> {
        let parsed: Self = serde_json::from_value(payload.clone()).map_err(|e| e.to_string())?;
        if parsed.program.trim().is_empty() {
            return Err("program must not be empty".to_string());
        }
        Ok(parsed)
    }
}

/// Runs external commands for jobs of type `"command"`.
#[derive(Debug, Clone)]
pub struct CommandJobHandler {
    dependency: String,
}

impl CommandJobHandler {
    /// Create a handler guarded by the default dependency breaker.
    pub fn new() -> Self {
        Self {
            dependency: DEFAULT_DEPENDENCY.to_string(),
        }
    }

    /// Guard the handler with a different breaker.
    pub fn with_dependency(mut self, dependency: impl Into<String>) -> Self {
        self.dependency = dependency.into();
        self
    }
}

impl Default for CommandJobHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl JobHandler for CommandJobHandler {
    fn job_type(&self) -> &str {
        "command"
    }

    fn dependency(&self) -> &str {
        &self.dependency
    }

    fn validate(&self, payload: &Value) -> Result<(), String> {
        CommandPayload::parse(payload).map(|_| ())
    }

    fn create(
        &self,
        job: &Job,
        progress: ProgressReporter,
    ) -> Result<Box<dyn Operation>, JobExecutionError> {
        let payload = CommandPayload::parse(&job.payload).map_err(JobExecutionError::Permanent)?;
        Ok(Box::new(CommandOperation {
            payload,
            progress,
            child: None,
        }))
    }
}

struct CommandOperation {
    payload: CommandPayload,
    progress: ProgressReporter,
    child: Option<Child>,
}

#[async_trait]
impl Operation for CommandOperation {
    async fn run(&mut self, _deadline: Instant) -> Result<Option<Value>, JobExecutionError> {
        let started = Instant::now();
        let payload = &self.payload;
        tracing::debug!(
            "Running command for job {}: program='{}', args={:?}",
            self.progress.job_id(),
            payload.program,
            payload.args
        );

        let mut cmd = Command::new(&payload.program);
        cmd.args(&payload.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &payload.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &payload.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                JobExecutionError::Permanent(format!("Cannot run '{}': {e}", payload.program))
            }
            _ => JobExecutionError::Transient(format!("Failed to spawn '{}': {e}", payload.program)),
        })?;
        let stdout = child.stdout.take();
        let stderr: Option<JoinHandle<String>> = child.stderr.take().map(|s| tokio::spawn(read_tail(s)));
        self.child = Some(child);

        let mut lines_seen = 0u64;
        if let Some(stdout) = stdout {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines
                .next_line()
                .await
                .map_err(|e| JobExecutionError::Transient(format!("Failed to read output: {e}")))?
            {
                lines_seen += 1;
                if let Some(marker) = POST_PROCESS_MARKERS.iter().find(|m| line.starts_with(**m)) {
                    self.progress.post_processing(marker.trim_matches(&['[', ']'][..]));
                } else if let Some(percentage) = parse_percentage(&line) {
                    self.progress.percentage(percentage);
                }
            }
        }

        let status = match self.child.as_mut() {
            Some(child) => child.wait().await.map_err(|e| {
                JobExecutionError::Transient(format!("Failed to wait for command: {e}"))
            })?,
            None => return Err(JobExecutionError::Transient("command was not started".into())),
        };
        self.child = None;
        let stderr_tail = match stderr {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };

        match status.code() {
            Some(0) => Ok(Some(json!({
                "exit_code": 0,
                "output_lines": lines_seen,
                "duration_ms": u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            }))),
            Some(code) if self.payload.permanent_exit_codes.contains(&code) => {
                Err(JobExecutionError::Permanent(format!(
                    "'{}' exited with code {code}: {}",
                    self.payload.program,
                    stderr_tail.trim()
                )))
            }
            Some(code) => Err(JobExecutionError::Transient(format!(
                "'{}' exited with code {code}: {}",
                self.payload.program,
                stderr_tail.trim()
            ))),
            None => Err(JobExecutionError::Transient(format!(
                "'{}' was terminated by a signal",
                self.payload.program
            ))),
        }
    }

    async fn cancel(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.start_kill() {
                tracing::debug!("Command already exited: {}", e);
            }
            let _ = child.wait().await;
        }
    }
}

/// Read a stream to the end, keeping only its last `STDERR_TAIL` chars.
async fn read_tail<R: AsyncRead + Unpin>(mut reader: R) -> String {
    let mut buf = Vec::new();
    if reader.read_to_end(&mut buf).await.is_err() {
        return String::new();
    }
    let text = String::from_utf8_lossy(&buf);
    let skip = text.chars().count().saturating_sub(STDERR_TAIL);
    text.chars().skip(skip).collect()
}

/// Extract a percentage such as `42.5%` from a progress line.
pub fn parse_percentage(line: &str) -> Option<f64> {
    let end = line.find('%')?;
    let head = &line[..end];
    let digits = head
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .count();
    head[head.len() - digits..].parse::<f64>().ok().filter(|p| p.is_finite())
}
