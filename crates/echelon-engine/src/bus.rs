use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use echelon_core::events::{EventAction, EventCategory, EventSource, RunEvent};
use echelon_core::ids::{EventId, RunId};
use echelon_store::events::EventRepo;
use echelon_store::Database;

/// Events older than this are swept from the durable sink.
pub const EVENT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);
/// Per-run durable event cap; oldest events beyond it are trimmed.
pub const EVENT_CAP: u64 = 10_000;

const BROADCAST_CAPACITY: usize = 256;
const REPLAY_BATCH: u32 = 256;

struct RunChannel {
    next_seq: Mutex<u64>,
    tx: broadcast::Sender<RunEvent>,
}

/// Per-run event fan-out with a durable SQLite sink.
///
/// The bus owns sequence assignment: every published event gets the
/// next per-run sequence, contiguous from 0, regardless of sink
/// health. Persistence failures are logged and absorbed so publishing
/// can never fail the run.
pub struct EventBus {
    db: Database,
    repo: EventRepo,
    channels: DashMap<RunId, Arc<RunChannel>>,
}

impl EventBus {
    pub fn new(db: Database) -> Self {
        Self {
            repo: EventRepo::new(db.clone()),
            db,
            channels: DashMap::new(),
        }
    }

    fn channel(&self, run_id: &RunId) -> Arc<RunChannel> {
        self.channels
            .entry(run_id.clone())
            .or_insert_with(|| {
                let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
                Arc::new(RunChannel { next_seq: Mutex::new(0), tx })
            })
            .clone()
    }

    /// Publish one event. Infallible by contract: the sequence is
    /// assigned and live subscribers notified even when the durable
    /// insert fails.
    pub fn publish(
        &self,
        run_id: &RunId,
        source: EventSource,
        category: EventCategory,
        action: EventAction,
        data: serde_json::Value,
    ) -> RunEvent {
        let channel = self.channel(run_id);

        // The insert and the broadcast stay under the sequence lock:
        // sequence n must be durable and sent before n+1 exists, or a
        // subscriber backfilling from the store would skip past n.
        let mut next = channel.next_seq.lock();
        let event = RunEvent {
            id: EventId::new(),
            run_id: run_id.clone(),
            sequence: *next,
            timestamp: Utc::now(),
            source,
            category,
            action,
            data,
        };
        *next += 1;

        if let Err(e) = self.repo.insert(&event) {
            warn!(
                run_id = %run_id,
                sequence = event.sequence,
                error = %e,
                "failed to persist event, live stream continues"
            );
        }

        // Send fails only when no subscriber is listening.
        let _ = channel.tx.send(event.clone());
        drop(next);
        event
    }

    /// Number of events published for a run by this process.
    pub fn published_count(&self, run_id: &RunId) -> u64 {
        self.channels
            .get(run_id)
            .map(|c| *c.next_seq.lock())
            .unwrap_or(0)
    }

    /// Drop the live channel for a finished run. Durable events remain
    /// until the retention sweep removes them.
    pub fn close_run(&self, run_id: &RunId) {
        self.channels.remove(run_id);
    }

    /// Stream events for a run starting at `from`, replaying persisted
    /// events before bridging to the live feed. The stream ends after
    /// the run-level terminal event, or immediately after replay when
    /// the run already finished.
    pub fn subscribe(&self, run_id: &RunId, from: u64) -> ReceiverStream<RunEvent> {
        let (tx, rx) = mpsc::channel(BROADCAST_CAPACITY);

        // Subscribe before replay so no event falls between the two.
        let live = self.channels.get(run_id).map(|c| c.tx.subscribe());
        let repo = EventRepo::new(self.db.clone());
        let run_id = run_id.clone();

        tokio::spawn(async move {
            forward_events(repo, run_id, from, live, tx).await;
        });

        ReceiverStream::new(rx)
    }
}

/// Replays persisted events from `from`, then follows the live feed.
/// Deduplicates on sequence and backfills from the store whenever the
/// live feed skips ahead or lags.
async fn forward_events(
    repo: EventRepo,
    run_id: RunId,
    from: u64,
    live: Option<broadcast::Receiver<RunEvent>>,
    tx: mpsc::Sender<RunEvent>,
) {
    let mut next = from;

    match drain_store(&repo, &run_id, &mut next, &tx).await {
        Ok(true) => return,
        Ok(false) => {}
        Err(()) => return,
    }

    let Some(mut live) = live else {
        // No live channel: the run already finished, replay is complete.
        return;
    };

    loop {
        match live.recv().await {
            Ok(event) => {
                if event.sequence < next {
                    continue;
                }
                if event.sequence > next {
                    // Missed events were persisted before this one; recover them.
                    match drain_store(&repo, &run_id, &mut next, &tx).await {
                        Ok(true) | Err(()) => return,
                        Ok(false) => {}
                    }
                    if event.sequence < next {
                        continue;
                    }
                }
                let terminal = event.is_run_terminal();
                next = event.sequence + 1;
                if tx.send(event).await.is_err() {
                    return;
                }
                if terminal {
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(run_id = %run_id, skipped, "subscriber lagged, backfilling from store");
                match drain_store(&repo, &run_id, &mut next, &tx).await {
                    Ok(true) | Err(()) => return,
                    Ok(false) => {}
                }
            }
            Err(broadcast::error::RecvError::Closed) => {
                // Publisher gone; flush whatever was persisted after our cursor.
                let _ = drain_store(&repo, &run_id, &mut next, &tx).await;
                return;
            }
        }
    }
}

/// Forward persisted events from the cursor onward. Returns Ok(true)
/// when a terminal event was sent, Err(()) when the receiver is gone.
async fn drain_store(
    repo: &EventRepo,
    run_id: &RunId,
    next: &mut u64,
    tx: &mpsc::Sender<RunEvent>,
) -> Result<bool, ()> {
    loop {
        let batch = match repo.list_from(run_id, *next, REPLAY_BATCH) {
            Ok(batch) => batch,
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "event replay read failed");
                return Ok(false);
            }
        };
        if batch.is_empty() {
            return Ok(false);
        }
        let exhausted = batch.len() < REPLAY_BATCH as usize;
        for event in batch {
            *next = event.sequence + 1;
            let terminal = event.is_run_terminal();
            if tx.send(event).await.is_err() {
                return Err(());
            }
            if terminal {
                return Ok(true);
            }
        }
        if exhausted {
            return Ok(false);
        }
    }
}

/// Periodic durable-sink sweep: drops events past the retention window
/// and trims each run to the per-run cap.
pub fn spawn_retention_sweeper(
    bus: Arc<EventBus>,
    every: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let cutoff = Utc::now()
                - chrono::Duration::from_std(EVENT_RETENTION).unwrap_or(chrono::Duration::hours(24));
            match bus.repo.prune_older_than(cutoff) {
                Ok(n) if n > 0 => debug!(removed = n, "pruned expired events"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "event retention prune failed"),
            }
            match bus.repo.trim_to_cap(EVENT_CAP) {
                Ok(n) if n > 0 => debug!(removed = n, "trimmed over-cap events"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "event cap trim failed"),
            }
        }
    })
}
