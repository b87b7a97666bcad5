//! Access log emitter.
//!
//! Request workers hand completed records to a bounded in-memory queue and
//! move on; a single writer task drains the queue to the configured sinks.
//! When the queue is full the oldest undrained record is dropped and
//! counted; request latency is never spent on log I/O.

use chrono::{DateTime, Utc};
use metrics::counter;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;
use tracing::{error, info};

use crate::config::AccessLogConfig;

pub const ACCESS_LOG_DROPPED_TOTAL: &str = "router_access_log_dropped_total";

/// One request's worth of telemetry, captured at request start and
/// finalized when the response body completes.
#[derive(Debug, Clone, Default)]
pub struct AccessLogRecord {
    pub started_at: Option<DateTime<Utc>>,
    pub host: String,
    pub method: String,
    /// Path plus query, as requested.
    pub path: String,
    pub http_version: String,
    pub status: u16,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub referer: String,
    pub user_agent: String,
    pub client_addr: String,
    pub backend_addr: String,
    pub x_forwarded_for: String,
    pub x_forwarded_proto: String,
    pub vcap_request_id: String,
    pub response_time_secs: f64,
    pub app_id: String,
    pub app_index: String,
    /// `(header name, value)` pairs copied per `extra_headers_to_log`.
    pub extra_headers: Vec<(String, String)>,
}

fn quoted(value: &str) -> String {
    if value.is_empty() {
        "\"-\"".to_string()
    } else {
        format!("{:?}", value)
    }
}

fn dash_if_empty(value: &str) -> &str {
    if value.is_empty() {
        "-"
    } else {
        value
    }
}

impl AccessLogRecord {
    /// Render the single-line schema. Field order is part of the contract
    /// with downstream log consumers.
    pub fn format_line(&self) -> String {
        let timestamp = self
            .started_at
            .map(|t| t.format("%d/%m/%Y:%H:%M:%S%.3f %z").to_string())
            .unwrap_or_else(|| "-".to_string());

        let mut line = format!(
            "{} - [{}] \"{} {} {}\" {} {} {} {} {} {} {} x_forwarded_for:{} x_forwarded_proto:{} vcap_request_id:{} response_time:{:.9} app_id:{} app_index:{}",
            dash_if_empty(&self.host),
            timestamp,
            dash_if_empty(&self.method),
            dash_if_empty(&self.path),
            dash_if_empty(&self.http_version),
            self.status,
            self.bytes_read,
            self.bytes_written,
            quoted(&self.referer),
            quoted(&self.user_agent),
            quoted(&self.client_addr),
            quoted(&self.backend_addr),
            quoted(&self.x_forwarded_for),
            quoted(&self.x_forwarded_proto),
            quoted(&self.vcap_request_id),
            self.response_time_secs,
            quoted(&self.app_id),
            quoted(&self.app_index),
        );
        for (name, value) in &self.extra_headers {
            line.push(' ');
            line.push_str(name);
            line.push(':');
            line.push_str(&quoted(value));
        }
        line
    }
}

struct Queue {
    records: Mutex<VecDeque<AccessLogRecord>>,
    capacity: usize,
    dropped: AtomicU64,
    closed: AtomicBool,
    notify: Notify,
}

/// Cheap handle request workers clone into their connections.
#[derive(Clone)]
pub struct AccessLogger {
    queue: Option<Arc<Queue>>,
}

impl AccessLogger {
    /// No sinks configured: Log() is a no-op and no writer task exists.
    pub fn disabled() -> Self {
        Self { queue: None }
    }

    /// Open the configured sinks and start the writer task. Failing to open
    /// the log file is a startup error, not a silent downgrade.
    pub async fn spawn(
        config: &AccessLogConfig,
    ) -> anyhow::Result<(Self, Option<tokio::task::JoinHandle<()>>)> {
        let mut file = None;
        if let Some(path) = &config.file {
            let opened = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to open access log {}: {}", path.display(), e))?;
            file = Some(opened);
        }

        if file.is_none() && !config.stdout {
            info!("Access logging disabled (no sinks configured)");
            return Ok((Self::disabled(), None));
        }

        let queue = Arc::new(Queue {
            records: Mutex::new(VecDeque::with_capacity(config.queue_depth)),
            capacity: config.queue_depth.max(1),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        });

        let writer_queue = Arc::clone(&queue);
        let stdout_sink = config.stdout;
        let handle = tokio::spawn(async move {
            let mut stdout = tokio::io::stdout();
            loop {
                let record = {
                    let mut records = writer_queue.records.lock().unwrap();
                    records.pop_front()
                };
                match record {
                    Some(record) => {
                        let mut line = record.format_line();
                        line.push('\n');
                        if let Some(f) = file.as_mut() {
                            if let Err(e) = f.write_all(line.as_bytes()).await {
                                error!(error = %e, "Failed to write access log line");
                            }
                        }
                        if stdout_sink {
                            let _ = stdout.write_all(line.as_bytes()).await;
                        }
                    }
                    None => {
                        if writer_queue.closed.load(Ordering::Acquire) {
                            if let Some(f) = file.as_mut() {
                                let _ = f.flush().await;
                            }
                            break;
                        }
                        writer_queue.notify.notified().await;
                    }
                }
            }
        });

        Ok((Self { queue: Some(queue) }, Some(handle)))
    }

    /// Enqueue one completed record. Never blocks; under overload the
    /// oldest queued record makes room.
    pub fn log(&self, record: AccessLogRecord) {
        let Some(queue) = &self.queue else {
            return;
        };
        if queue.closed.load(Ordering::Acquire) {
            return;
        }
        {
            let mut records = queue.records.lock().unwrap();
            if records.len() >= queue.capacity {
                records.pop_front();
                queue.dropped.fetch_add(1, Ordering::Relaxed);
                counter!(ACCESS_LOG_DROPPED_TOTAL).increment(1);
            }
            records.push_back(record);
        }
        queue.notify.notify_one();
    }

    /// Records discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.queue
            .as_ref()
            .map(|q| q.dropped.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Ask the writer to drain what is queued and exit.
    pub fn stop(&self) {
        if let Some(queue) = &self.queue {
            queue.closed.store(true, Ordering::Release);
            queue.notify.notify_one();
        }
    }
}
