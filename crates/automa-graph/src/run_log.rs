use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use automa_core::config::AutomaConfig;
use automa_core::event::EventBus;
use automa_core::types::AutomaEvent;

/// JSONL run logger.
///
/// Subscribes to the EventBus and writes one JSON object per line. Events
/// from nested automas arrive on the same bus and are logged alongside the
/// top-level ones.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

/// A single log entry written to the JSONL file.
#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    automa: String,
    event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    worker: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    step: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl LogEntry {
    fn new(automa: &str, event_type: &str) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            automa: automa.to_string(),
            event_type: event_type.to_string(),
            worker: None,
            step: None,
            detail: None,
        }
    }

    fn worker(mut self, worker: &str) -> Self {
        self.worker = Some(worker.to_string());
        self
    }

    fn step(mut self, step: usize) -> Self {
        self.step = Some(step);
        self
    }

    fn detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

impl RunLogger {
    /// `log_dir` is the base directory; logs go to
    /// `{log_dir}/{automa}/{timestamp}.jsonl`.
    /// `level`: 1=run summary, 2=steps and suspension, 3=per worker.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Logger described by the `[log]` section, or `None` if the section is
    /// absent or disabled.
    pub fn from_config(config: &AutomaConfig) -> Option<Self> {
        let log = config.log.as_ref()?;
        if !log.enabled {
            debug!("Run logging disabled by config");
            return None;
        }
        Some(Self::new(config.log_dir(), log.level))
    }

    /// Run the logger as a background task.
    ///
    /// Writes until cancellation or until `automa` completes or fails.
    pub async fn run(self, event_bus: Arc<EventBus>, automa: String, cancel: CancellationToken) {
        let automa_dir = self.log_dir.join(&automa);
        if let Err(e) = tokio::fs::create_dir_all(&automa_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_path = automa_dir.join(format!("{}.jsonl", timestamp));

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

        info!(path = %log_path.display(), automa = %automa, "RunLogger started");

        let mut writer = tokio::io::BufWriter::new(file);
        let mut rx = event_bus.subscribe();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            if let Some(entry) = self.event_to_entry(&event) {
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

                            if is_terminal(&event, &automa) {
                                break;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "RunLogger finished");
    }

    /// Convert an event to a log entry (None if filtered by level).
    fn event_to_entry(&self, event: &AutomaEvent) -> Option<LogEntry> {
        match event {
            // L1: run summary
            AutomaEvent::RunStarted { automa, top_level } => Some(
                LogEntry::new(automa, "run_started")
                    .detail(serde_json::json!({ "top_level": top_level })),
            ),
            AutomaEvent::RunComplete {
                automa,
                steps,
                elapsed_ms,
            } => Some(LogEntry::new(automa, "run_complete").detail(serde_json::json!({
                "steps": steps,
                "elapsed_ms": elapsed_ms,
            }))),
            AutomaEvent::RunError { automa, error } => Some(
                LogEntry::new(automa, "run_error").detail(serde_json::json!({ "error": error })),
            ),

            // L2: steps, topology, suspension
            AutomaEvent::StepStarted {
                automa,
                step,
                workers,
            } if self.level >= 2 => Some(
                LogEntry::new(automa, "step_started")
                    .step(*step)
                    .detail(serde_json::json!({ "workers": workers })),
            ),
            AutomaEvent::TopologyChanged {
                automa,
                step,
                mutations,
            } if self.level >= 2 => Some(
                LogEntry::new(automa, "topology_changed")
                    .step(*step)
                    .detail(serde_json::json!({ "mutations": mutations })),
            ),
            AutomaEvent::Suspended { automa, pending } if self.level >= 2 => Some(
                LogEntry::new(automa, "suspended")
                    .detail(serde_json::json!({ "pending": pending })),
            ),
            AutomaEvent::Resumed { automa } if self.level >= 2 => {
                Some(LogEntry::new(automa, "resumed"))
            }
            AutomaEvent::InteractionRequested { interaction } if self.level >= 2 => Some(
                LogEntry::new(&interaction.automa, "interaction_requested")
                    .worker(&interaction.worker_key)
                    .detail(serde_json::json!({
                        "interaction_id": interaction.interaction_id,
                        "event_type": interaction.event.event_type,
                    })),
            ),

            // L3: per worker
            AutomaEvent::WorkerStarted { automa, worker } if self.level >= 3 => {
                Some(LogEntry::new(automa, "worker_started").worker(worker))
            }
            AutomaEvent::WorkerCompleted {
                automa,
                worker,
                elapsed_ms,
            } if self.level >= 3 => Some(
                LogEntry::new(automa, "worker_completed")
                    .worker(worker)
                    .detail(serde_json::json!({ "elapsed_ms": elapsed_ms })),
            ),
            AutomaEvent::WorkerFailed {
                automa,
                worker,
                error,
                suppressed,
            } if self.level >= 3 => Some(
                LogEntry::new(automa, "worker_failed")
                    .worker(worker)
                    .detail(serde_json::json!({
                        "error": truncate_str(error, 500),
                        "suppressed": suppressed,
                    })),
            ),
            AutomaEvent::Ferried { automa, from, to } if self.level >= 3 => Some(
                LogEntry::new(automa, "ferried")
                    .worker(from)
                    .detail(serde_json::json!({ "to": to })),
            ),
            AutomaEvent::EventPosted {
                automa,
                worker,
                event,
            } if self.level >= 3 => Some(
                LogEntry::new(automa, "event_posted")
                    .worker(worker)
                    .detail(serde_json::json!({
                        "event_type": event.event_type,
                        "data": truncate_json(&event.data, 500),
                    })),
            ),

            _ => None,
        }
    }
}

fn is_terminal(event: &AutomaEvent, automa: &str) -> bool {
    match event {
        AutomaEvent::RunComplete { automa: name, .. } | AutomaEvent::RunError { automa: name, .. } => {
            name == automa
        }
        _ => false,
    }
}

/// Truncate a JSON value for logging.
fn truncate_json(value: &serde_json::Value, max_len: usize) -> String {
    let s = value.to_string();
    if s.len() <= max_len {
        s
    } else {
        format!("{}...", truncate_str(&s, max_len))
    }
}

fn truncate_str(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
