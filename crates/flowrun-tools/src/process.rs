use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use flowrun_core::config::CodeRunnerConfig;
use flowrun_core::error::{FlowError, Result};
use flowrun_core::traits::CodeRunner;
use flowrun_core::types::{CodeOutput, CodeRequest};

/// Runs code nodes as local subprocesses.
///
/// The node's input snapshot is passed as JSON both in the `FLOWRUN_INPUT`
/// environment variable and on stdin. The child is killed when the timeout
/// expires, when the node is cancelled, or when the run is dropped.
pub struct ProcessRunner {
    config: CodeRunnerConfig,
}

impl ProcessRunner {
    pub fn new(config: CodeRunnerConfig) -> Self {
        Self { config }
    }

    /// Interpreter and flag that evaluates inline source for a language.
    fn interpreter(&self, language: &str) -> Result<(String, &'static str)> {
        match language.to_ascii_lowercase().as_str() {
            "python" | "python3" | "py" => Ok((self.config.python.clone(), "-c")),
            "javascript" | "js" | "node" => Ok((self.config.node.clone(), "-e")),
            "bash" | "sh" | "shell" => Ok((self.config.shell.clone(), "-c")),
            other => Err(FlowError::CodeExecution(format!("unsupported language: {}", other))),
        }
    }

    async fn spawn_and_wait(&self, request: CodeRequest) -> Result<CodeOutput> {
        let (program, flag) = self.interpreter(&request.language)?;
        let input = request.input.to_string();

        let mut cmd = Command::new(&program);
        cmd.arg(flag)
            .arg(&request.code)
            .env("FLOWRUN_INPUT", &input)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(PathBuf::from(dir));
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| FlowError::CodeExecution(format!("failed to start {}: {}", program, e)))?;

        // Feed stdin while the output pipes drain, so neither side blocks on
        // a full pipe.
        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                // A script that never reads stdin closes the pipe early.
                if let Err(e) = stdin.write_all(input.as_bytes()).await {
                    debug!(error = %e, "Child closed stdin");
                }
            });
        }

        let output = child.wait_with_output().await?;
        let max = self.config.max_output_chars;
        Ok(CodeOutput {
            stdout: truncate_output(&String::from_utf8_lossy(&output.stdout), max),
            stderr: truncate_output(&String::from_utf8_lossy(&output.stderr), max),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}

fn truncate_output(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}\n... (output truncated)", &text[..cut]),
        None => text.to_string(),
    }
}

impl CodeRunner for ProcessRunner {
    fn run(&self, request: CodeRequest, cancel: CancellationToken) -> BoxFuture<'_, Result<CodeOutput>> {
        Box::pin(async move {
            let timeout_secs = self.config.timeout_secs;
            let language = request.language.clone();
            debug!(language = %language, timeout_secs, "Running code");

            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(FlowError::Cancelled),
                result = tokio::time::timeout(Duration::from_secs(timeout_secs), self.spawn_and_wait(request)) => {
                    result.unwrap_or_else(|_| {
                        warn!(language = %language, timeout_secs, "Code execution timed out");
                        Err(FlowError::Timeout {
                            what: format!("{} code", language),
                            timeout_secs,
                        })
                    })
                }
            }
        })
    }
}
