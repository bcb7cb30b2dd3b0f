use crate::{
    config::PollSettings,
    models::{Outcome, ProcessRequest},
    monitor::{LogLevel, MonitorEvent, MonitorState},
    pipeline::Pipeline,
    sheets::{ProductSheet, SheetError},
};
use rand::Rng;
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{
    sync::{Mutex, watch},
    time::{MissedTickBehavior, sleep},
};
use tracing::{debug, info, warn};

const MAX_JITTER: f64 = 0.20;

#[derive(Debug, Error)]
pub enum SweepError {
    #[error("a sweep is already running")]
    AlreadyRunning,
    #[error(transparent)]
    Sheet(#[from] SheetError),
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct SweepSummary {
    pub pending: usize,
    pub processed: usize,
    pub updated: usize,
    pub partial: usize,
    pub failed: usize,
}

#[derive(Debug, Clone)]
pub struct OutputColumns {
    pub image: String,
    pub vertical: String,
}

/// Walks the sheet's pending rows and writes artifact URLs back.
pub struct SheetPoller<S> {
    pipeline: Pipeline,
    sheet: Arc<S>,
    monitor: Arc<MonitorState>,
    poll: PollSettings,
    columns: OutputColumns,
    running: Mutex<()>,
}

impl<S: ProductSheet> SheetPoller<S> {
    pub fn new(
        pipeline: Pipeline,
        sheet: Arc<S>,
        monitor: Arc<MonitorState>,
        poll: PollSettings,
        columns: OutputColumns,
    ) -> Self {
        Self {
            pipeline,
            sheet,
            monitor,
            poll,
            columns,
            running: Mutex::new(()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.try_lock().is_err()
    }

    pub async fn sweep(&self) -> Result<SweepSummary, SweepError> {
        let Ok(_guard) = self.running.try_lock() else {
            return Err(SweepError::AlreadyRunning);
        };
        self.monitor.record(MonitorEvent::SweepStarted);

        let rows = match self.sheet.pending_rows().await {
            Ok(rows) => rows,
            Err(err) => {
                self.monitor.record(MonitorEvent::SweepFailed {
                    error: err.to_string(),
                });
                return Err(err.into());
            }
        };

        let mut summary = SweepSummary {
            pending: rows.len(),
            ..SweepSummary::default()
        };
        for (idx, row) in rows.iter().enumerate() {
            if idx > 0 {
                sleep(self.jittered_delay()).await;
            }
            let result = self
                .pipeline
                .process_product(ProcessRequest::new(row.link.clone()))
                .await;
            summary.processed += 1;

            let mut published = 0;
            let mut detail = result.message.clone();
            match result.outcome {
                // Left untouched so the next sweep retries it.
                Outcome::Failed => summary.failed += 1,
                Outcome::Success | Outcome::Partial => {
                    if result.outcome == Outcome::Partial {
                        summary.partial += 1;
                    }
                    let mut updates = Vec::new();
                    if let Some(url) = &result.primary_url {
                        updates.push((self.columns.image.clone(), url.clone()));
                    }
                    if let Some(url) = &result.secondary_url
                        && self.sheet.has_column(&self.columns.vertical)
                    {
                        updates.push((self.columns.vertical.clone(), url.clone()));
                    }
                    published = updates.len();
                    if !updates.is_empty() {
                        match self.sheet.update_row(row.row, &updates).await {
                            Ok(()) => summary.updated += 1,
                            Err(err) => {
                                summary.failed += 1;
                                detail = format!("artifacts published but sheet write failed: {err}");
                                self.monitor.record(MonitorEvent::Note {
                                    level: LogLevel::Error,
                                    message: format!("row {}: {detail}", row.row),
                                });
                            }
                        }
                    }
                }
            }

            self.monitor.record(MonitorEvent::RowProcessed {
                row: row.row,
                code: result.product_code.clone(),
                outcome: result.outcome,
                published,
                detail,
            });
        }

        self.monitor.record(MonitorEvent::SweepFinished {
            pending: summary.pending,
            processed: summary.processed,
        });
        info!(
            target = "sorteio.poller",
            pending = summary.pending,
            updated = summary.updated,
            failed = summary.failed,
            "sweep complete"
        );
        Ok(summary)
    }

    /// Sweeps on a fixed interval until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.poll.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(target = "sorteio.poller", interval_secs = self.poll.interval.as_secs(), "poller started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sweep().await {
                        Ok(_) => {}
                        Err(SweepError::AlreadyRunning) => {
                            debug!(target = "sorteio.poller", "tick skipped; sweep in progress");
                        }
                        Err(err) => {
                            warn!(target = "sorteio.poller", error = %err, "sweep failed");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!(target = "sorteio.poller", "poller stopped");
    }

    fn jittered_delay(&self) -> Duration {
        let base = self.poll.item_delay;
        if base.is_zero() {
            return base;
        }
        let factor = rand::rng().random_range(0.0..=MAX_JITTER);
        base.mul_f64(1.0 + factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Branding, PipelineSettings};
    use crate::sheets::SheetRow;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct MemorySheet {
        rows: StdMutex<Vec<SheetRow>>,
        writes: StdMutex<Vec<(usize, Vec<(String, String)>)>>,
        fail_read: bool,
    }

    impl ProductSheet for MemorySheet {
        async fn pending_rows(&self) -> Result<Vec<SheetRow>, SheetError> {
            if self.fail_read {
                return Err(SheetError::Status {
                    status: 503,
                    body: "unavailable".into(),
                });
            }
            Ok(self.rows.lock().unwrap().clone())
        }

        async fn update_row(&self, row: usize, values: &[(String, String)]) -> Result<(), SheetError> {
            self.writes.lock().unwrap().push((row, values.to_vec()));
            Ok(())
        }

        fn has_column(&self, name: &str) -> bool {
            name == "Imagem" || name == "Imagem Vertical"
        }
    }

    fn poller(sheet: Arc<MemorySheet>, monitor: Arc<MonitorState>) -> SheetPoller<MemorySheet> {
        let pipeline =
            Pipeline::new(PipelineSettings::default(), &Branding::default()).expect("pipeline");
        SheetPoller::new(
            pipeline,
            sheet,
            monitor,
            PollSettings {
                interval: Duration::from_secs(60),
                item_delay: Duration::ZERO,
            },
            OutputColumns {
                image: "Imagem".into(),
                vertical: "Imagem Vertical".into(),
            },
        )
    }

    #[tokio::test]
    async fn failed_rows_are_not_written() {
        let sheet = Arc::new(MemorySheet {
            rows: StdMutex::new(vec![
                SheetRow {
                    row: 2,
                    link: "https://loja.test/sem-codigo".into(),
                },
                SheetRow {
                    row: 3,
                    link: "nada".into(),
                },
            ]),
            ..MemorySheet::default()
        });
        let monitor = Arc::new(MonitorState::new(50));
        let summary = poller(sheet.clone(), monitor.clone())
            .sweep()
            .await
            .expect("sweep");

        assert_eq!(
            summary,
            SweepSummary {
                pending: 2,
                processed: 2,
                updated: 0,
                partial: 0,
                failed: 2,
            }
        );
        assert!(sheet.writes.lock().unwrap().is_empty());
        let snap = monitor.snapshot();
        assert_eq!(snap.sweeps_run, 1);
        assert_eq!(snap.failures, 2);
        assert!(!snap.sweep_running);
    }

    #[tokio::test]
    async fn unreadable_sheet_fails_the_sweep() {
        let sheet = Arc::new(MemorySheet {
            fail_read: true,
            ..MemorySheet::default()
        });
        let monitor = Arc::new(MonitorState::new(50));
        let err = poller(sheet, monitor.clone()).sweep().await.unwrap_err();
        assert!(matches!(err, SweepError::Sheet(_)));
        assert!(monitor.snapshot().last_error.is_some());
    }

    #[tokio::test]
    async fn overlapping_sweep_is_rejected() {
        let poller = poller(Arc::new(MemorySheet::default()), Arc::new(MonitorState::new(10)));
        let _held = poller.running.lock().await;
        assert!(poller.is_running());
        assert!(matches!(poller.sweep().await, Err(SweepError::AlreadyRunning)));
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let poller = Arc::new(poller(
            Arc::new(MemorySheet::default()),
            Arc::new(MonitorState::new(10)),
        ));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(poller.clone().run(rx));
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).expect("send");
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("poller stopped")
            .expect("join");
        // The first tick fires immediately.
        assert_eq!(poller.monitor.snapshot().sweeps_run, 1);
    }

    #[test]
    fn jitter_stays_within_twenty_percent() {
        let mut p = poller(Arc::new(MemorySheet::default()), Arc::new(MonitorState::new(10)));
        p.poll.item_delay = Duration::from_millis(1000);
        for _ in 0..50 {
            let delay = p.jittered_delay();
            assert!(delay >= Duration::from_millis(1000));
            assert!(delay <= Duration::from_millis(1200));
        }
    }
}
