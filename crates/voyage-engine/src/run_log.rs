use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use voyage_core::types::{RunEvent, RunId};

/// JSONL audit log for a single run.
///
/// Consumes [`RunEvent`]s for one run and appends one JSON object per line
/// to `{log_dir}/{run_id}/{timestamp}.jsonl`. Lines are flushed as they are
/// written, so a crash leaves every earlier line intact.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

#[derive(Debug, Serialize)]
struct LogEntry {
    timestamp: String,
    run_id: String,
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    /// `level` controls verbosity: 1=run summary, 2=+node transitions, 3=+retries.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Write events for `run_id` until the run finishes, the bus closes, or
    /// `cancel` fires. Subscribe `rx` before the run starts so no event is missed.
    pub async fn run(
        self,
        mut rx: broadcast::Receiver<RunEvent>,
        run_id: RunId,
        cancel: CancellationToken,
    ) -> Option<PathBuf> {
        let run_dir = self.log_dir.join(run_id.as_str());
        if let Err(e) = tokio::fs::create_dir_all(&run_dir).await {
            error!(error = %e, "Failed to create log directory");
            return None;
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_path = run_dir.join(format!("{}.jsonl", timestamp));

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return None;
            }
        };

        info!(path = %log_path.display(), "RunLogger started");
        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            if event.run_id() != &run_id {
                                continue;
                            }
                            let finished = matches!(
                                event,
                                RunEvent::RunCompleted { .. } | RunEvent::RunFailed { .. }
                            );

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

                            if finished {
                                break;
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "RunLogger finished");
        Some(log_path)
    }

    /// Map an event to a log line, or `None` when the level filters it out.
    fn event_to_entry(&self, event: &RunEvent) -> Option<LogEntry> {
        let entry = |event_type, node_id: Option<&str>, detail| LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            run_id: event.run_id().to_string(),
            event_type,
            node_id: node_id.map(str::to_string),
            detail,
        };

        match event {
            RunEvent::RunStarted { graph, .. } => Some(entry(
                "run_started",
                None,
                Some(serde_json::json!({ "graph": graph })),
            )),
            RunEvent::RunCompleted { steps, .. } => Some(entry(
                "run_completed",
                None,
                Some(serde_json::json!({ "steps": steps })),
            )),
            RunEvent::RunFailed { error, .. } => Some(entry(
                "run_failed",
                Some(error.node_id.as_str()),
                Some(serde_json::json!({
                    "kind": error.kind,
                    "message": error.message,
                    "retry_count": error.retry_count,
                })),
            )),

            RunEvent::NodeStarted { node_id, attempt, .. } if self.level >= 2 => Some(entry(
                "node_started",
                Some(node_id.as_str()),
                Some(serde_json::json!({ "attempt": attempt })),
            )),
            RunEvent::NodeAdvanced { from, to, .. } if self.level >= 2 => Some(entry(
                "node_advanced",
                Some(from.as_str()),
                Some(serde_json::json!({ "to": to })),
            )),

            RunEvent::NodeRetrying {
                node_id,
                retry,
                backoff_ms,
                reason,
                ..
            } if self.level >= 3 => Some(entry(
                "node_retrying",
                Some(node_id.as_str()),
                Some(serde_json::json!({
                    "retry": retry,
                    "backoff_ms": backoff_ms,
                    "reason": truncate_str(reason, 200),
                })),
            )),

            _ => None,
        }
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

#[cfg(test)]
mod tests {
    use super::*;
    use voyage_core::event::EventBus;
    use voyage_core::types::{ErrorInfo, ErrorKind};

    fn started(run_id: &RunId) -> RunEvent {
        RunEvent::RunStarted {
            run_id: run_id.clone(),
            graph: "booking".into(),
        }
    }

    fn retrying(run_id: &RunId) -> RunEvent {
        RunEvent::NodeRetrying {
            run_id: run_id.clone(),
            node_id: "search".into(),
            retry: 1,
            backoff_ms: 500,
            reason: "timed out".into(),
        }
    }

    fn advanced(run_id: &RunId) -> RunEvent {
        RunEvent::NodeAdvanced {
            run_id: run_id.clone(),
            from: "search".into(),
            to: "select".into(),
        }
    }

    #[test]
    fn test_entry_skips_empty_fields() {
        let logger = RunLogger::new(PathBuf::from("/tmp"), 1);
        let run_id = RunId::from_str("run-1");
        let entry = logger
            .event_to_entry(&RunEvent::RunCompleted {
                run_id,
                steps: 4,
            })
            .unwrap();
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"event_type\":\"run_completed\""));
        assert!(json.contains("\"steps\":4"));
        assert!(!json.contains("node_id"));
    }

    #[test]
    fn test_event_level_filtering() {
        let run_id = RunId::from_str("run-1");

        let logger = RunLogger::new(PathBuf::from("/tmp"), 1);
        assert!(logger.event_to_entry(&started(&run_id)).is_some());
        assert!(logger.event_to_entry(&advanced(&run_id)).is_none());
        assert!(logger.event_to_entry(&retrying(&run_id)).is_none());

        let logger2 = RunLogger::new(PathBuf::from("/tmp"), 2);
        assert!(logger2.event_to_entry(&advanced(&run_id)).is_some());
        assert!(logger2.event_to_entry(&retrying(&run_id)).is_none());

        let logger3 = RunLogger::new(PathBuf::from("/tmp"), 3);
        assert!(logger3.event_to_entry(&retrying(&run_id)).is_some());
    }

    #[test]
    fn test_truncate_respects_char_boundary() {
        assert_eq!(truncate_str("short", 10), "short");
        assert_eq!(truncate_str("héllo", 2), "h");
    }

    #[tokio::test]
    async fn test_writes_jsonl_until_run_finishes() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::default();
        let run_id = RunId::from_str("run-42");
        let other = RunId::from_str("run-other");

        let logger = RunLogger::new(dir.path().to_path_buf(), 3);
        let rx = bus.subscribe();
        let handle = tokio::spawn(logger.run(rx, run_id.clone(), CancellationToken::new()));

        bus.publish(started(&run_id));
        bus.publish(started(&other));
        bus.publish(retrying(&run_id));
        bus.publish(RunEvent::RunFailed {
            run_id: run_id.clone(),
            error: ErrorInfo {
                node_id: "pay".into(),
                kind: ErrorKind::RetryLimitExceeded,
                message: "gave up".into(),
                retry_count: 2,
            },
        });

        let path = handle.await.unwrap().unwrap();
        assert!(path.starts_with(dir.path().join("run-42")));

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["event_type"], "run_started");
        assert_eq!(lines[1]["event_type"], "node_retrying");
        assert_eq!(lines[1]["detail"]["backoff_ms"], 500);
        assert_eq!(lines[2]["event_type"], "run_failed");
        assert_eq!(lines[2]["detail"]["kind"], "retry_limit_exceeded");
        assert_eq!(lines[2]["detail"]["retry_count"], 2);
    }
}
