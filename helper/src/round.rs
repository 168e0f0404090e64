//! One Berkeley synchronization round: request, bounded collection, averaging,
//! distribution.
//!
//! The coordinator counts as a voter with an implicit offset of zero, so the average is
//! `sum(offsets) / (responders + 1)` with `i64` division (truncation toward zero).

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{self, Instant};
use tracing::{debug, warn};

use crate::clock::ClockTime;
use crate::proto::Frame;
use crate::registry::{send_each, Session};

/// Default collection window.
pub const DEFAULT_ROUND_WINDOW: Duration = Duration::from_secs(5);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RoundStatus {
    Collecting,
    TimedOut,
    Aggregated,
    Distributing,
    Distributed,
}

/// How collection ended.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CollectEnd {
    /// Every voter answered before the deadline.
    Quorum,
    /// The deadline elapsed first.
    Deadline,
}

/// Result of draining the collected offsets.
#[derive(Clone, Debug)]
pub struct Aggregate {
    pub average: i64,
    /// Responders in join order with the offset each reported.
    pub offsets: Vec<(Arc<Session>, i64)>,
}

/// Average over the reported offsets plus the coordinator's own zero.
pub fn average_offset(offsets: &[i64]) -> i64 {
    let sum = offsets.iter().fold(0_i64, |acc, &o| acc.saturating_add(o));
    sum / (offsets.len() as i64 + 1)
}

#[derive(Debug)]
struct RoundState {
    status: RoundStatus,
    collected: HashMap<String, i64>,
}

#[derive(Debug)]
pub struct SyncRound {
    id: u64,
    requested_at: Instant,
    deadline: Instant,
    coordinator_time: ClockTime,
    voters: Vec<Arc<Session>>,
    state: Mutex<RoundState>,
    notify: Notify,
}

impl SyncRound {
    /// `voters` is the registry snapshot at round start; its size is the quorum.
    pub fn new(id: u64, coordinator_time: ClockTime, voters: Vec<Arc<Session>>, window: Duration) -> Self {
        let requested_at = Instant::now();
        Self {
            id,
            requested_at,
            deadline: requested_at + window,
            coordinator_time,
            voters,
            state: Mutex::new(RoundState { status: RoundStatus::Collecting, collected: HashMap::new() }),
            notify: Notify::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn requested_at(&self) -> Instant {
        self.requested_at
    }

    pub fn coordinator_time(&self) -> ClockTime {
        self.coordinator_time
    }

    pub fn expected_count(&self) -> usize {
        self.voters.len()
    }

    pub fn status(&self) -> RoundStatus {
        self.state().status
    }

    pub fn collected_count(&self) -> usize {
        self.state().collected.len()
    }

    /// Send `OFFSET_REQUEST` to every voter. Returns how many were queued.
    pub fn request(&self) -> usize {
        send_each(&self.voters, &Frame::OffsetRequest(self.coordinator_time).encode())
    }

    /// Record a voter's offset. Last write wins per identity. Rejected once collection
    /// has closed or when `identity` was not registered at round start.
    pub fn record(&self, identity: &str, offset: i64) -> bool {
        let Some(voter) = self.voters.iter().find(|s| s.identity() == identity) else {
            debug!(round = self.id, identity, "offset from non-voter ignored");
            return false;
        };
        let complete = {
            let mut state = self.state();
            if state.status != RoundStatus::Collecting {
                debug!(round = self.id, identity, "offset after collection closed ignored");
                return false;
            }
            state.collected.insert(identity.to_string(), offset);
            // session writes stay inside the Collecting window
            voter.set_reported_offset(Some(offset));
            voter.set_last_known_time(self.coordinator_time.add_minutes(offset));
            state.collected.len() >= self.voters.len()
        };
        debug!(round = self.id, identity, offset, complete, "offset recorded");
        self.notify.notify_one();
        true
    }

    fn is_complete(&self) -> bool {
        self.state().collected.len() >= self.voters.len()
    }

    /// Wait until every voter answered or the deadline passes, whichever is first.
    pub async fn collect(&self) -> CollectEnd {
        loop {
            if self.is_complete() {
                return CollectEnd::Quorum;
            }
            if time::timeout_at(self.deadline, self.notify.notified()).await.is_err() {
                return if self.is_complete() { CollectEnd::Quorum } else { CollectEnd::Deadline };
            }
        }
    }

    /// Close collection and drain the offsets. `None` when nothing was collected (the
    /// round is then `TimedOut`) or when the round was already aggregated.
    pub fn aggregate(&self) -> Option<Aggregate> {
        let collected = {
            let mut state = self.state();
            if state.status != RoundStatus::Collecting {
                return None;
            }
            let collected = std::mem::take(&mut state.collected);
            state.status = if collected.is_empty() { RoundStatus::TimedOut } else { RoundStatus::Aggregated };
            collected
        };
        if collected.is_empty() {
            self.clear_reported();
            return None;
        }
        let offsets: Vec<(Arc<Session>, i64)> = self
            .voters
            .iter()
            .filter_map(|s| collected.get(s.identity()).map(|&o| (s.clone(), o)))
            .collect();
        let values: Vec<i64> = offsets.iter().map(|(_, o)| *o).collect();
        Some(Aggregate { average: average_offset(&values), offsets })
    }

    /// Send each responder `ADJUST:<average - offset>`. Non-responders get nothing.
    /// Returns the adjustments that were queued.
    pub fn distribute(&self, aggregate: &Aggregate) -> Vec<(String, i64)> {
        self.state().status = RoundStatus::Distributing;
        let mut sent = Vec::with_capacity(aggregate.offsets.len());
        for (session, offset) in &aggregate.offsets {
            let delta = aggregate.average.saturating_sub(*offset);
            match session.send(Frame::Adjust(delta).encode()) {
                Ok(()) => {
                    session.set_last_known_time(session.last_known_time().add_minutes(delta));
                    sent.push((session.identity().to_string(), delta));
                }
                Err(e) => warn!(round = self.id, identity = %session.identity(), error = %e, "adjust not delivered"),
            }
        }
        self.clear_reported();
        self.state().status = RoundStatus::Distributed;
        sent
    }

    fn clear_reported(&self) {
        for s in &self.voters {
            s.set_reported_offset(None);
        }
    }

    fn state(&self) -> MutexGuard<'_, RoundState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Holds at most one active round coordinator-wide.
#[derive(Debug, Default)]
pub struct RoundSlot {
    active: Mutex<Option<Arc<SyncRound>>>,
    next_id: AtomicU64,
}

impl RoundSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a round unless one is already running. `build` runs under the slot lock
    /// and receives the new round id.
    pub fn begin(&self, build: impl FnOnce(u64) -> SyncRound) -> Option<ActiveRound<'_>> {
        let mut active = self.lock();
        if active.is_some() {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::AcqRel) + 1;
        let round = Arc::new(build(id));
        *active = Some(round.clone());
        Some(ActiveRound { slot: self, round })
    }

    pub fn current(&self) -> Option<Arc<SyncRound>> {
        self.lock().clone()
    }

    pub fn is_active(&self) -> bool {
        self.lock().is_some()
    }

    /// Forward an offset to the active round, if any.
    pub fn record(&self, identity: &str, offset: i64) -> bool {
        match self.current() {
            Some(round) => round.record(identity, offset),
            None => {
                debug!(identity, offset, "offset with no active round ignored");
                false
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Arc<SyncRound>>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The running round; frees the slot when dropped.
#[derive(Debug)]
pub struct ActiveRound<'a> {
    slot: &'a RoundSlot,
    round: Arc<SyncRound>,
}

impl Deref for ActiveRound<'_> {
    type Target = SyncRound;

    fn deref(&self) -> &SyncRound {
        &self.round
    }
}

impl Drop for ActiveRound<'_> {
    fn drop(&mut self) {
        *self.slot.lock() = None;
    }
}
