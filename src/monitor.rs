//! Process-wide automation state: counters, last sweep, and a bounded log.
//!
//! One `MonitorState` is created at startup and shared behind an `Arc`.
//! Every mutation goes through [`MonitorState::record`], which also mirrors
//! the event to `tracing`.

use crate::models::Outcome;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{collections::VecDeque, sync::Mutex};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone)]
pub enum MonitorEvent {
    SweepStarted,
    RowProcessed {
        row: usize,
        code: Option<String>,
        outcome: Outcome,
        published: usize,
        detail: String,
    },
    SweepFinished {
        pending: usize,
        processed: usize,
    },
    SweepFailed {
        error: String,
    },
    Note {
        level: LogLevel,
        message: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MonitorSnapshot {
    pub started_at: Option<DateTime<Utc>>,
    pub sweep_running: bool,
    pub sweeps_run: u64,
    pub rows_processed: u64,
    pub artifacts_published: u64,
    pub partial_results: u64,
    pub failures: u64,
    pub last_sweep_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug)]
struct Inner {
    snapshot: MonitorSnapshot,
    logs: VecDeque<LogEntry>,
}

#[derive(Debug)]
pub struct MonitorState {
    inner: Mutex<Inner>,
    max_lines: usize,
}

impl MonitorState {
    pub fn new(max_lines: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                snapshot: MonitorSnapshot {
                    started_at: Some(Utc::now()),
                    ..MonitorSnapshot::default()
                },
                logs: VecDeque::new(),
            }),
            max_lines: max_lines.max(1),
        }
    }

    pub fn record(&self, event: MonitorEvent) {
        let (level, message) = describe(&event);
        match level {
            LogLevel::Info => info!(target = "sorteio.monitor", "{message}"),
            LogLevel::Warn => warn!(target = "sorteio.monitor", "{message}"),
            LogLevel::Error => error!(target = "sorteio.monitor", "{message}"),
        }

        // A poisoned lock only means a panic mid-update; counters are still usable.
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let snapshot = &mut inner.snapshot;
        match event {
            MonitorEvent::SweepStarted => {
                snapshot.sweep_running = true;
            }
            MonitorEvent::RowProcessed {
                outcome,
                published,
                detail,
                ..
            } => {
                snapshot.rows_processed += 1;
                snapshot.artifacts_published += published as u64;
                match outcome {
                    Outcome::Success => {}
                    Outcome::Partial => snapshot.partial_results += 1,
                    Outcome::Failed => {
                        snapshot.failures += 1;
                        snapshot.last_error = Some(detail);
                    }
                }
            }
            MonitorEvent::SweepFinished { .. } => {
                snapshot.sweep_running = false;
                snapshot.sweeps_run += 1;
                snapshot.last_sweep_at = Some(Utc::now());
            }
            MonitorEvent::SweepFailed { error } => {
                snapshot.sweep_running = false;
                snapshot.sweeps_run += 1;
                snapshot.last_sweep_at = Some(Utc::now());
                snapshot.last_error = Some(error);
            }
            MonitorEvent::Note { .. } => {}
        }

        inner.logs.push_back(LogEntry {
            timestamp: Utc::now(),
            level,
            message,
        });
        while inner.logs.len() > self.max_lines {
            inner.logs.pop_front();
        }
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.snapshot.clone()
    }

    /// Last `limit` entries, oldest first.
    pub fn recent_logs(&self, limit: usize) -> Vec<LogEntry> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let skip = inner.logs.len().saturating_sub(limit);
        inner.logs.iter().skip(skip).cloned().collect()
    }
}

fn describe(event: &MonitorEvent) -> (LogLevel, String) {
    match event {
        MonitorEvent::SweepStarted => (LogLevel::Info, "sweep started".to_string()),
        MonitorEvent::RowProcessed {
            row,
            code,
            outcome,
            detail,
            ..
        } => {
            let code = code.as_deref().unwrap_or("?");
            match outcome {
                Outcome::Success => (LogLevel::Info, format!("row {row} ({code}): {detail}")),
                Outcome::Partial => (LogLevel::Warn, format!("row {row} ({code}) partial: {detail}")),
                Outcome::Failed => (LogLevel::Error, format!("row {row} ({code}) failed: {detail}")),
            }
        }
        MonitorEvent::SweepFinished { pending, processed } => (
            LogLevel::Info,
            format!("sweep finished: {processed}/{pending} rows processed"),
        ),
        MonitorEvent::SweepFailed { error } => (LogLevel::Error, format!("sweep failed: {error}")),
        MonitorEvent::Note { level, message } => (*level, message.clone()),
    }
}
