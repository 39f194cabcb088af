//! Terminal progress bars for streamed transfers.

use bucketsync_replication::{ReplicationEvent, ReplicationObserver, TransferStrategy};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use parking_lot::Mutex;
use std::collections::HashMap;

const BYTES_TEMPLATE: &str =
    "{msg:40!} [{bar:30.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})";
const UNKNOWN_SIZE_TEMPLATE: &str = "{spinner:.green} {msg:40!} {bytes} ({bytes_per_sec})";
const RUN_TEMPLATE: &str = "{spinner:.green} [{elapsed_precise}] {msg}";

/// One byte-level bar per in-flight streamed object, plus a run-wide
/// object counter.
pub struct ProgressBarObserver {
    multi: MultiProgress,
    run: ProgressBar,
    bars: Mutex<HashMap<String, ProgressBar>>,
    counts: Mutex<(u64, u64)>,
}

impl ProgressBarObserver {
    pub fn new() -> Self {
        let multi = MultiProgress::new();
        let run = multi.add(ProgressBar::new_spinner());
        if let Ok(style) = ProgressStyle::with_template(RUN_TEMPLATE) {
            run.set_style(style);
        }
        run.set_message("Listing source bucket...");

        Self {
            multi,
            run,
            bars: Mutex::new(HashMap::new()),
            counts: Mutex::new((0, 0)),
        }
    }

    fn object_bar(&self, key: &str, size: Option<u64>) -> ProgressBar {
        let (bar, template) = match size {
            Some(size) => (ProgressBar::new(size), BYTES_TEMPLATE),
            None => (ProgressBar::new_spinner(), UNKNOWN_SIZE_TEMPLATE),
        };
        if let Ok(style) = ProgressStyle::with_template(template) {
            bar.set_style(style.progress_chars("=> "));
        }
        bar.set_message(key.to_string());
        self.multi.add(bar)
    }

    fn object_done(&self, key: &str, succeeded: bool) {
        if let Some(bar) = self.bars.lock().remove(key) {
            bar.finish_and_clear();
        }

        let mut counts = self.counts.lock();
        if succeeded {
            counts.0 += 1;
        } else {
            counts.1 += 1;
        }
        self.run.set_message(format!(
            "{} replicated, {} failed",
            counts.0, counts.1
        ));
        self.run.tick();
    }
}

impl Default for ProgressBarObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicationObserver for ProgressBarObserver {
    fn on_event(&self, event: &ReplicationEvent) {
        match event {
            ReplicationEvent::RunStarted {
                source_bucket,
                destination_bucket,
                ..
            } => {
                self.run
                    .set_message(format!("{} -> {}", source_bucket, destination_bucket));
            }
            ReplicationEvent::ObjectStarted { plan } => {
                if plan.strategy == TransferStrategy::Streamed {
                    let bar = self.object_bar(&plan.source_key, plan.size);
                    self.bars.lock().insert(plan.source_key.clone(), bar);
                }
            }
            ReplicationEvent::Progress {
                key,
                transferred,
                total,
            } => {
                if let Some(bar) = self.bars.lock().get(key) {
                    if let Some(total) = total {
                        if bar.length() != Some(*total) {
                            bar.set_length(*total);
                        }
                    }
                    bar.set_position(*transferred);
                }
            }
            ReplicationEvent::ObjectSucceeded { source_key, .. } => {
                self.object_done(source_key, true)
            }
            ReplicationEvent::ObjectFailed { source_key, .. } => {
                self.object_done(source_key, false)
            }
            ReplicationEvent::KeyCollision {
                destination_key, ..
            } => {
                let _ = self
                    .multi
                    .println(format!("warning: destination key collision on {}", destination_key));
            }
            ReplicationEvent::RunFinished { summary } => {
                for (_, bar) in self.bars.lock().drain() {
                    bar.finish_and_clear();
                }
                self.run.finish_with_message(format!(
                    "{} replicated, {} failed",
                    summary.succeeded, summary.failed
                ));
            }
            ReplicationEvent::PageListed { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bucketsync_replication::{RunSummary, TransferPlan};

    fn started(key: &str, strategy: TransferStrategy) -> ReplicationEvent {
        ReplicationEvent::ObjectStarted {
            plan: TransferPlan {
                source_key: key.to_string(),
                destination_key: key.to_string(),
                size: Some(10),
                strategy,
            },
        }
    }

    fn succeeded(key: &str) -> ReplicationEvent {
        ReplicationEvent::ObjectSucceeded {
            source_key: key.to_string(),
            destination_key: key.to_string(),
            strategy: TransferStrategy::Streamed,
            bytes: 10,
        }
    }

    #[test]
    fn test_bars_follow_object_lifecycle() {
        let observer = ProgressBarObserver::new();

        observer.on_event(&started("a", TransferStrategy::Streamed));
        observer.on_event(&started("b", TransferStrategy::ServerSideCopy));
        assert_eq!(observer.bars.lock().len(), 1);

        observer.on_event(&ReplicationEvent::Progress {
            key: "a".to_string(),
            transferred: 4,
            total: Some(10),
        });
        assert_eq!(observer.bars.lock().get("a").map(|b| b.position()), Some(4));

        observer.on_event(&succeeded("a"));
        observer.on_event(&succeeded("b"));
        assert!(observer.bars.lock().is_empty());
        assert_eq!(*observer.counts.lock(), (2, 0));
    }

    #[test]
    fn test_final_progress_extends_length() {
        let observer = ProgressBarObserver::new();
        observer.on_event(&started("a", TransferStrategy::Streamed));

        observer.on_event(&ReplicationEvent::Progress {
            key: "a".to_string(),
            transferred: 25,
            total: Some(25),
        });
        assert_eq!(observer.bars.lock().get("a").and_then(|b| b.length()), Some(25));

        observer.on_event(&ReplicationEvent::RunFinished {
            summary: RunSummary::start(false),
        });
        assert!(observer.bars.lock().is_empty());
    }
}
