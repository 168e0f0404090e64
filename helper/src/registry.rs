//! Coordinator-side sessions and the registry that owns them.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

use crate::clock::{ClockCell, ClockHolder, ClockTime};
use crate::error::{Result, SyncError};
use crate::net::{queue_line, LineSender};

/// The coordinator's handle to one connected participant.
#[derive(Debug)]
pub struct Session {
    identity: String,
    channel: LineSender,
    last_known: ClockCell,
    last_offset: Mutex<Option<i64>>,
}

impl Session {
    pub fn new(identity: impl Into<String>, channel: LineSender, time: ClockTime) -> Self {
        Self {
            identity: identity.into(),
            channel,
            last_known: ClockCell::new(time),
            last_offset: Mutex::new(None),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Queue one line for this participant.
    pub fn send(&self, line: impl Into<String>) -> Result<()> {
        queue_line(&self.channel, line.into(), &self.identity)
    }

    pub fn last_known_time(&self) -> ClockTime {
        self.last_known.time()
    }

    pub fn set_last_known_time(&self, time: ClockTime) {
        self.last_known.set_time(time)
    }

    /// Offset reported in the round currently collecting, if any.
    pub fn last_reported_offset(&self) -> Option<i64> {
        *lock(&self.last_offset)
    }

    pub(crate) fn set_reported_offset(&self, offset: Option<i64>) {
        *lock(&self.last_offset) = offset;
    }
}

/// Live sessions in join order, behind a single lock.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<Vec<Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session. Identities are unique among live sessions.
    pub fn add(&self, session: Arc<Session>) -> Result<()> {
        if session.identity().is_empty() {
            return Err(SyncError::EmptyIdentity);
        }
        let mut sessions = lock(&self.sessions);
        if sessions.iter().any(|s| s.identity == session.identity) {
            return Err(SyncError::DuplicateIdentity(session.identity.clone()));
        }
        sessions.push(session);
        Ok(())
    }

    /// Remove by identity; absent identities are not an error.
    pub fn remove(&self, identity: &str) -> Option<Arc<Session>> {
        let mut sessions = lock(&self.sessions);
        let idx = sessions.iter().position(|s| s.identity == identity)?;
        Some(sessions.remove(idx))
    }

    pub fn contains(&self, identity: &str) -> bool {
        lock(&self.sessions).iter().any(|s| s.identity == identity)
    }

    pub fn get(&self, identity: &str) -> Option<Arc<Session>> {
        lock(&self.sessions)
            .iter()
            .find(|s| s.identity == identity)
            .cloned()
    }

    /// Point-in-time copy, safe to iterate without holding the lock.
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        lock(&self.sessions).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.sessions).is_empty()
    }

    /// Send `message` to every live session; returns how many accepted it.
    pub fn broadcast(&self, message: &str) -> usize {
        send_each(&self.snapshot(), message)
    }
}

/// Fan `line` out to `sessions`. A closed or full queue is logged and skipped.
pub fn send_each(sessions: &[Arc<Session>], line: &str) -> usize {
    let mut delivered = 0;
    for session in sessions {
        match session.send(line) {
            Ok(()) => delivered += 1,
            Err(e) => warn!(identity = %session.identity(), error = %e, "send failed"),
        }
    }
    debug!(delivered, total = sessions.len(), "fan-out");
    delivered
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn session(id: &str) -> (Arc<Session>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(8);
        (Arc::new(Session::new(id, tx, ClockTime::MIDNIGHT)), rx)
    }

    #[test]
    fn add_rejects_duplicates_and_empty() {
        let reg = SessionRegistry::new();
        let (a, _rx_a) = session("alice");
        let (a2, _rx_a2) = session("alice");
        let (empty, _rx_e) = session("");
        reg.add(a).unwrap();
        assert!(matches!(reg.add(a2), Err(SyncError::DuplicateIdentity(id)) if id == "alice"));
        assert!(matches!(reg.add(empty), Err(SyncError::EmptyIdentity)));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn remove_is_idempotent() {
        let reg = SessionRegistry::new();
        let (a, _rx) = session("alice");
        reg.add(a).unwrap();
        assert!(reg.remove("alice").is_some());
        assert!(reg.remove("alice").is_none());
        assert!(reg.is_empty());
    }

    #[test]
    fn snapshot_keeps_join_order_and_is_detached() {
        let reg = SessionRegistry::new();
        let mut rxs = Vec::new();
        for id in ["c", "a", "b"] {
            let (s, rx) = session(id);
            reg.add(s).unwrap();
            rxs.push(rx);
        }
        let snap = reg.snapshot();
        reg.remove("a");
        let ids: Vec<_> = snap.iter().map(|s| s.identity()).collect();
        assert_eq!(ids, ["c", "a", "b"]);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn broadcast_survives_a_dead_recipient() {
        let reg = SessionRegistry::new();
        let (a, mut rx_a) = session("a");
        let (b, rx_b) = session("b");
        let (c, mut rx_c) = session("c");
        for s in [a, b, c] {
            reg.add(s).unwrap();
        }
        drop(rx_b);
        assert_eq!(reg.broadcast("hello"), 2);
        assert_eq!(rx_a.try_recv().unwrap(), "hello");
        assert_eq!(rx_c.try_recv().unwrap(), "hello");
    }

    #[test]
    fn stalled_reader_is_skipped_not_buffered() {
        let reg = SessionRegistry::new();
        let (tx, mut rx_slow) = mpsc::channel(2);
        reg.add(Arc::new(Session::new("slow", tx, ClockTime::MIDNIGHT))).unwrap();
        let (fast, mut rx_fast) = session("fast");
        reg.add(fast).unwrap();

        assert_eq!(reg.broadcast("one"), 2);
        assert_eq!(reg.broadcast("two"), 2);
        assert_eq!(reg.broadcast("three"), 1);
        assert!(matches!(
            reg.get("slow").unwrap().send("four"),
            Err(SyncError::QueueFull(id)) if id == "slow"
        ));
        assert_eq!(rx_slow.try_recv().unwrap(), "one");
        assert_eq!(rx_slow.try_recv().unwrap(), "two");
        assert!(rx_slow.try_recv().is_err());
        for expected in ["one", "two", "three"] {
            assert_eq!(rx_fast.try_recv().unwrap(), expected);
        }
    }
}
