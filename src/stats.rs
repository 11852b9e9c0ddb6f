//! System statistics and the in-memory log buffer backing the
//! diagnostics endpoints.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use sysinfo::System;
use tracing::Level;
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;

use crate::error::{Error, Result};

/// System stats snapshot for the control surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SystemStatsDto {
    pub cpu_percent: f32,
    pub ram_used_mb: u64,
    pub ram_total_mb: u64,
    pub disk_percent: f32,
    pub thread_count: usize,
    pub app_uptime_s: u64,
    pub system_uptime_s: u64,
    pub engine_state: String,
    pub temperature_c: Option<f32>,
}

/// Collects system stats. Refreshes are throttled by the caller (the
/// endpoint); sysinfo reads are cheap but not free.
pub struct SystemMonitor {
    system: Mutex<System>,
    started: Instant,
}

impl SystemMonitor {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new_all()),
            started: Instant::now(),
        }
    }

    pub fn stats(&self, engine_state: &str) -> SystemStatsDto {
        let mut system = self.system.lock();
        system.refresh_cpu_usage();
        system.refresh_memory();

        let disks = sysinfo::Disks::new_with_refreshed_list();
        let (disk_total, disk_available) = disks
            .iter()
            .fold((0u64, 0u64), |(total, available), disk| {
                (total + disk.total_space(), available + disk.available_space())
            });
        let disk_percent = if disk_total > 0 {
            100.0 * (disk_total - disk_available) as f32 / disk_total as f32
        } else {
            0.0
        };

        let temperature_c = sysinfo::Components::new_with_refreshed_list()
            .iter()
            .map(|c| c.temperature())
            .fold(None, |max: Option<f32>, t| {
                Some(max.map_or(t, |m| m.max(t)))
            });

        let thread_count = sysinfo::get_current_pid()
            .ok()
            .and_then(|pid| {
                system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]));
                system
                    .process(pid)
                    .and_then(|p| p.tasks().map(|t| t.len()))
            })
            .unwrap_or(1);

        SystemStatsDto {
            cpu_percent: system.global_cpu_usage(),
            ram_used_mb: system.used_memory() / (1024 * 1024),
            ram_total_mb: system.total_memory() / (1024 * 1024),
            disk_percent,
            thread_count,
            app_uptime_s: self.started.elapsed().as_secs(),
            system_uptime_s: System::uptime(),
            engine_state: engine_state.to_string(),
            temperature_c,
        }
    }
}

impl Default for SystemMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// One captured log record.
#[derive(Debug, Clone, serde::Serialize)]
pub struct LogRecord {
    pub level: String,
    pub target: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Logs response.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SystemLogsDto {
    pub records: Vec<LogRecord>,
    pub total_buffered: usize,
}

const LOG_CAPACITY: usize = 10_000;

/// Bounded ring of recent log records, filled by a tracing layer.
#[derive(Default)]
pub struct LogBuffer {
    records: Mutex<VecDeque<LogRecord>>,
}

impl LogBuffer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, record: LogRecord) {
        let mut records = self.records.lock();
        if records.len() == LOG_CAPACITY {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Query buffered records, newest first.
    ///
    /// `level` filters at-or-above severity: "error" < "warning" < "info".
    pub fn query(
        &self,
        level: &str,
        limit: usize,
        max_age_minutes: Option<i64>,
    ) -> Result<SystemLogsDto> {
        if !(1..=10_000).contains(&limit) {
            return Err(Error::invalid_argument("limit must be 1-10000"));
        }
        let min_severity = match level.to_ascii_lowercase().as_str() {
            "info" => 2,
            "warning" => 1,
            "error" => 0,
            other => {
                return Err(Error::invalid_argument(format!("unknown log level: {other}")));
            }
        };
        let cutoff = max_age_minutes.map(|minutes| Utc::now() - ChronoDuration::minutes(minutes));

        let records = self.records.lock();
        let selected: Vec<LogRecord> = records
            .iter()
            .rev()
            .filter(|r| severity(&r.level) <= min_severity)
            .filter(|r| cutoff.is_none_or(|c| r.timestamp >= c))
            .take(limit)
            .cloned()
            .collect();

        Ok(SystemLogsDto {
            total_buffered: records.len(),
            records: selected,
        })
    }
}

fn severity(level: &str) -> u8 {
    match level {
        "ERROR" => 0,
        "WARN" => 1,
        _ => 2,
    }
}

/// Tracing layer that copies events into a [`LogBuffer`].
pub struct BufferLayer {
    buffer: Arc<LogBuffer>,
}

impl BufferLayer {
    pub fn new(buffer: Arc<LogBuffer>) -> Self {
        Self { buffer }
    }
}

impl<S> tracing_subscriber::Layer<S> for BufferLayer
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        // Only keep info and above; debug/trace stay on stderr only
        let level = *event.metadata().level();
        if level > Level::INFO {
            return;
        }

        struct MessageVisitor(String);
        impl tracing::field::Visit for MessageVisitor {
            fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
                if field.name() == "message" {
                    self.0 = format!("{value:?}");
                } else {
                    use std::fmt::Write;
                    let _ = write!(self.0, " {}={value:?}", field.name());
                }
            }
        }

        let mut visitor = MessageVisitor(String::new());
        event.record(&mut visitor);

        self.buffer.push(LogRecord {
            level: level.to_string(),
            target: event.metadata().target().to_string(),
            message: visitor.0.trim_start().to_string(),
            timestamp: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(level: &str, message: &str, age_minutes: i64) -> LogRecord {
        LogRecord {
            level: level.to_string(),
            target: "test".to_string(),
            message: message.to_string(),
            timestamp: Utc::now() - ChronoDuration::minutes(age_minutes),
        }
    }

    #[test]
    fn test_log_query_level_filter() {
        let buffer = LogBuffer::new();
        buffer.push(record("INFO", "started", 0));
        buffer.push(record("WARN", "slow", 0));
        buffer.push(record("ERROR", "broken", 0));

        assert_eq!(buffer.query("info", 100, None).unwrap().records.len(), 3);
        assert_eq!(buffer.query("warning", 100, None).unwrap().records.len(), 2);
        let errors = buffer.query("error", 100, None).unwrap();
        assert_eq!(errors.records.len(), 1);
        assert_eq!(errors.records[0].message, "broken");
    }

    #[test]
    fn test_log_query_validation() {
        let buffer = LogBuffer::new();
        assert!(buffer.query("info", 0, None).is_err());
        assert!(buffer.query("info", 10_001, None).is_err());
        assert!(buffer.query("verbose", 10, None).is_err());
    }

    #[test]
    fn test_log_query_max_age() {
        let buffer = LogBuffer::new();
        buffer.push(record("INFO", "old", 120));
        buffer.push(record("INFO", "fresh", 1));

        let recent = buffer.query("info", 100, Some(10)).unwrap();
        assert_eq!(recent.records.len(), 1);
        assert_eq!(recent.records[0].message, "fresh");
    }

    #[test]
    fn test_log_ring_bounded() {
        let buffer = LogBuffer::new();
        for i in 0..(LOG_CAPACITY + 50) {
            buffer.push(record("INFO", &format!("m{i}"), 0));
        }
        let all = buffer.query("info", 10_000, None).unwrap();
        assert_eq!(all.total_buffered, LOG_CAPACITY);
        // Newest first
        assert_eq!(all.records[0].message, format!("m{}", LOG_CAPACITY + 49));
    }

    #[test]
    fn test_monitor_produces_sane_numbers() {
        let monitor = SystemMonitor::new();
        let stats = monitor.stats("Running");
        assert!(stats.ram_total_mb > 0);
        assert!(stats.ram_used_mb <= stats.ram_total_mb);
        assert!((0.0..=100.0).contains(&stats.disk_percent));
        assert_eq!(stats.engine_state, "Running");
        assert!(stats.thread_count >= 1);
    }
}
