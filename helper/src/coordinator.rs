//! Coordinator: accepts participants, routes their lines and drives sync rounds.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::clock::{ClockCell, ClockHolder, ClockTime};
use crate::error::{Result, SyncError};
use crate::net::{queue_line, spawn_line_writer, LineSender};
use crate::proto::Frame;
use crate::registry::{Session, SessionRegistry};
use crate::round::{CollectEnd, RoundSlot, SyncRound, DEFAULT_ROUND_WINDOW};

pub const DEFAULT_PORT: u16 = 8080;

#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    pub listen: SocketAddr,
    /// How long a round waits for offsets.
    pub round_window: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            round_window: DEFAULT_ROUND_WINDOW,
        }
    }
}

/// Operator commands fed into the accept loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Time,
    Sync,
    Quit,
}

/// Summary of a finished round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundReport {
    pub round: u64,
    pub expected: usize,
    pub collect_end: CollectEnd,
    pub average: i64,
    /// Coordinator clock after applying the average.
    pub coordinator_time: ClockTime,
    /// `(identity, delta)` for every `ADJUST` queued.
    pub adjustments: Vec<(String, i64)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundOutcome {
    /// Another round was running; nothing happened.
    Busy,
    /// Nobody answered before the deadline; no clock was touched.
    NoOffsets { round: u64, expected: usize },
    Completed(RoundReport),
}

#[derive(Debug)]
pub struct Coordinator {
    config: CoordinatorConfig,
    clock: ClockCell,
    registry: SessionRegistry,
    rounds: RoundSlot,
}

impl Coordinator {
    /// A coordinator whose clock starts at a random minute.
    pub fn new(config: CoordinatorConfig) -> Self {
        Self::with_time(config, ClockTime::random())
    }

    pub fn with_time(config: CoordinatorConfig, time: ClockTime) -> Self {
        Self { config, clock: ClockCell::new(time), registry: SessionRegistry::new(), rounds: RoundSlot::new() }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn rounds(&self) -> &RoundSlot {
        &self.rounds
    }

    pub async fn bind(&self) -> io::Result<TcpListener> {
        TcpListener::bind(self.config.listen).await
    }

    /// Accept connections until `Control::Quit` arrives. A closed control channel
    /// leaves the accept loop running.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, mut ctrl_rx: mpsc::Receiver<Control>) -> io::Result<()> {
        info!(addr = %listener.local_addr()?, time = %self.time(), "coordinator listening");
        loop {
            tokio::select! {
                res = listener.accept() => {
                    let (stream, addr) = match res {
                        Ok(v) => v,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    tokio::spawn(self.clone().handle_connection(stream, addr));
                }
                Some(ctrl) = ctrl_rx.recv() => match ctrl {
                    Control::Time => self.broadcast_time_report(),
                    Control::Sync => self.trigger_sync(),
                    Control::Quit => {
                        self.announce("Coordinator shutting down.");
                        break;
                    }
                },
            }
        }
        Ok(())
    }

    /// Log `message` and send it to every live session.
    pub fn announce(&self, message: &str) -> usize {
        info!("{message}");
        self.registry.broadcast(message)
    }

    pub fn time_report(&self) -> String {
        let mut report = String::from("=== TIME REPORT ===\n");
        report.push_str(&format!("server: {}\n", self.time()));
        for session in self.registry.snapshot() {
            report.push_str(&format!("{}: {}\n", session.identity(), session.last_known_time()));
        }
        report.push_str("====================");
        report
    }

    pub fn broadcast_time_report(&self) {
        self.announce(&self.time_report());
    }

    /// Run a round in the background unless one is already active.
    pub fn trigger_sync(self: &Arc<Self>) {
        if self.rounds.is_active() {
            info!("sync already in progress, ignored");
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            this.sync().await;
        });
    }

    /// Execute one full round: request, collect, average, distribute.
    pub async fn sync(&self) -> RoundOutcome {
        let Some(round) = self.rounds.begin(|id| {
            SyncRound::new(id, self.time(), self.registry.snapshot(), self.config.round_window)
        }) else {
            info!("sync already in progress, ignored");
            return RoundOutcome::Busy;
        };
        info!(
            round = round.id(),
            time = %round.coordinator_time(),
            expected = round.expected_count(),
            "sync round started"
        );
        round.request();
        let collect_end = round.collect().await;
        debug!(
            round = round.id(),
            ?collect_end,
            collected = round.collected_count(),
            elapsed_ms = round.requested_at().elapsed().as_millis() as u64,
            "collection closed"
        );

        let Some(aggregate) = round.aggregate() else {
            warn!(round = round.id(), "no offsets received");
            return RoundOutcome::NoOffsets { round: round.id(), expected: round.expected_count() };
        };
        let coordinator_time = self.adjust(aggregate.average);
        info!(
            round = round.id(),
            responders = aggregate.offsets.len(),
            average = aggregate.average,
            time = %coordinator_time,
            "average offset applied"
        );
        let adjustments = round.distribute(&aggregate);
        RoundOutcome::Completed(RoundReport {
            round: round.id(),
            expected: round.expected_count(),
            collect_end,
            average: aggregate.average,
            coordinator_time,
            adjustments,
        })
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let (read, write) = stream.into_split();
        let tx = spawn_line_writer(write, addr.to_string());
        let mut lines = BufReader::new(read).lines();

        let session = match self.handshake(&mut lines, tx.clone()).await {
            Ok(session) => session,
            Err(e) => {
                warn!(%addr, error = %e, "connection rejected");
                let _ = queue_line(&tx, format!("ERROR: {e}"), &addr.to_string());
                return;
            }
        };
        drop(tx);
        let registration = Registration { coordinator: &self, session };
        self.announce(&format!("User '{}' connected.", registration.session.identity()));

        loop {
            match lines.next_line().await {
                Ok(Some(line)) => self.handle_line(&registration.session, &line),
                Ok(None) => break,
                Err(e) => {
                    debug!(identity = %registration.session.identity(), error = %e, "read failed");
                    break;
                }
            }
        }
    }

    /// Read identity then `HH:mm`, and register the session. Both lines are consumed
    /// before either is validated so a rejection never leaves unread input behind.
    async fn handshake(&self, lines: &mut Lines<BufReader<OwnedReadHalf>>, tx: LineSender) -> Result<Arc<Session>> {
        let identity = lines
            .next_line()
            .await?
            .ok_or_else(|| SyncError::Handshake("closed before identity".into()))?
            .trim()
            .to_string();
        let raw_time = lines.next_line().await?;
        if identity.is_empty() {
            return Err(SyncError::EmptyIdentity);
        }
        let raw_time = raw_time.ok_or_else(|| SyncError::Handshake("closed before initial time".into()))?;
        let time: ClockTime = raw_time.parse()?;
        let session = Arc::new(Session::new(identity, tx, time));
        self.registry.add(session.clone())?;
        Ok(session)
    }

    fn handle_line(self: &Arc<Self>, session: &Session, line: &str) {
        match Frame::parse(line) {
            Ok(Frame::Time) => self.broadcast_time_report(),
            Ok(Frame::Sync) => self.trigger_sync(),
            Ok(Frame::Offset(offset)) => {
                self.rounds.record(session.identity(), offset);
            }
            Ok(Frame::Text(text)) => {
                self.announce(&format!("[{}]: {}", session.identity(), text));
            }
            Ok(frame @ (Frame::OffsetRequest(_) | Frame::Adjust(_))) => {
                warn!(identity = %session.identity(), %frame, "coordinator-only frame from participant dropped")
            }
            Err(e) => warn!(identity = %session.identity(), error = %e, "discarding frame"),
        }
    }
}

/// A registered session. Dropping it, on any exit path of the connection task,
/// removes the session and tells everyone else.
struct Registration<'a> {
    coordinator: &'a Coordinator,
    session: Arc<Session>,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        let identity = self.session.identity();
        self.coordinator.registry.remove(identity);
        self.coordinator.announce(&format!("User '{identity}' disconnected."));
    }
}

impl ClockHolder for Coordinator {
    fn time(&self) -> ClockTime {
        self.clock.time()
    }

    fn set_time(&self, time: ClockTime) {
        self.clock.set_time(time)
    }
}
