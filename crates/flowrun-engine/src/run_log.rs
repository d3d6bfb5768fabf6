use std::path::PathBuf;

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use flowrun_core::event::{EventKind, ExecutionEvent};

/// JSONL run logger.
///
/// Consumes a run's events and writes one JSON object per line to
/// `{log_dir}/{workflow_id}/{run_id}.jsonl`. Append-only: if the process
/// dies mid-run, every line written so far is intact.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

/// A single line of the log.
#[derive(Serialize)]
struct LogEntry<'a> {
    timestamp: String,
    run_id: &'a str,
    seq: u64,
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    node_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    /// `level` controls verbosity: 1 = workflow events, 2 = + node
    /// lifecycle, 3 = + streamed node output.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Write events until the channel closes (after `WORKFLOW_END`).
    pub async fn run(
        self,
        mut events: mpsc::UnboundedReceiver<ExecutionEvent>,
        workflow_id: String,
        run_id: String,
    ) {
        let run_dir = self.log_dir.join(path_component(&workflow_id, "default"));
        if let Err(e) = tokio::fs::create_dir_all(&run_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }

        let log_path = run_dir.join(format!("{}.jsonl", path_component(&run_id, "run")));
        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return;
            }
        };

        info!(path = %log_path.display(), "RunLogger started");
        let mut writer = tokio::io::BufWriter::new(file);

        while let Some(event) = events.recv().await {
            let Some(entry) = self.event_to_entry(&event) else {
                continue;
            };
            if let Ok(json) = serde_json::to_string(&entry) {
                let line = format!("{}\n", json);
                if let Err(e) = writer.write_all(line.as_bytes()).await {
                    error!(error = %e, "Failed to write log entry");
                    break;
                }
                if let Err(e) = writer.flush().await {
                    error!(error = %e, "Failed to flush log");
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "RunLogger finished");
    }

    /// Convert an event to a log entry (None if filtered by level).
    fn event_to_entry<'a>(&self, event: &'a ExecutionEvent) -> Option<LogEntry<'a>> {
        let detail = match &event.kind {
            // L1: always logged
            EventKind::WorkflowStart { workflow_id } => Some(serde_json::json!({ "workflow_id": workflow_id })),
            EventKind::WorkflowEnd {
                status,
                error,
                elapsed_ms,
                ..
            } => Some(serde_json::json!({
                "status": status,
                "error": error,
                "elapsed_ms": elapsed_ms,
            })),

            // L2: node lifecycle
            EventKind::NodeStart { node_type, .. } if self.level >= 2 => {
                Some(serde_json::json!({ "node_type": node_type }))
            }
            EventKind::NodeEnd { output, elapsed_ms, .. } if self.level >= 2 => Some(serde_json::json!({
                "elapsed_ms": elapsed_ms,
                "output": truncate_json(output, 500),
            })),
            EventKind::NodeError { error, .. } if self.level >= 2 => Some(serde_json::json!({
                "kind": error.kind,
                "message": error.message,
            })),

            // L3: streamed output
            EventKind::NodeOutput { data, .. } if self.level >= 3 => Some(data.clone()),

            _ => return None,
        };

        Some(LogEntry {
            timestamp: event.timestamp.to_rfc3339(),
            run_id: &event.run_id,
            seq: event.seq,
            event_type: event.type_name(),
            node_id: event.node_id(),
            detail,
        })
    }
}

/// Caller-supplied ids as a single file name: anything outside
/// `[A-Za-z0-9_-]` becomes `_`, so the result never leaves `log_dir`.
fn path_component(id: &str, fallback: &str) -> String {
    if id.is_empty() {
        return fallback.to_string();
    }
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

/// Truncate a JSON value for logging.
fn truncate_json(value: &serde_json::Value, max_len: usize) -> String {
    let s = value.to_string();
    if s.len() <= max_len {
        return s;
    }
    let mut cut = max_len;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &s[..cut])
}
