//! Participant: owns a clock, answers offset requests and applies adjustments.

use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::{ClockCell, ClockHolder, ClockTime};
use crate::error::{Result, SyncError};
use crate::net::{queue_line, spawn_line_writer, LineSender};
use crate::proto::{Frame, ProtoError, SYNC_COMMAND, TIME_COMMAND};

/// What the listener did with one inbound line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inbound {
    /// Answered an offset request; `offset` was sent back.
    Replied { coordinator_time: ClockTime, offset: i64 },
    /// Applied an adjustment; `time` is the new local clock.
    Adjusted { delta: i64, time: ClockTime },
    /// Chat or report text for the user.
    Display(String),
    /// The coordinator closed the connection.
    Closed,
}

impl Inbound {
    /// Frame to send back to the coordinator, if any.
    pub fn reply(&self) -> Option<Frame> {
        match self {
            Inbound::Replied { offset, .. } => Some(Frame::Offset(*offset)),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct Participant {
    identity: String,
    clock: ClockCell,
}

impl Participant {
    pub fn new(identity: impl Into<String>, time: ClockTime) -> Self {
        Self { identity: identity.into(), clock: ClockCell::new(time) }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Interpret one line from the coordinator. Offset requests never touch the clock.
    pub fn handle_line(&self, line: &str) -> Result<Inbound, ProtoError> {
        Ok(match Frame::parse(line)? {
            Frame::OffsetRequest(coordinator_time) => Inbound::Replied {
                coordinator_time,
                offset: self.time().offset_from(coordinator_time),
            },
            Frame::Adjust(delta) => Inbound::Adjusted { delta, time: self.adjust(delta) },
            _ => Inbound::Display(line.to_string()),
        })
    }

    /// Turn user input into an outbound line: `time`/`sync` go out lower-cased as
    /// commands, anything else is wrapped as chat. Blank input sends nothing.
    pub fn outbound(&self, input: &str) -> Option<String> {
        let input = input.trim();
        if input.is_empty() {
            return None;
        }
        let lower = input.to_lowercase();
        if lower == TIME_COMMAND || lower == SYNC_COMMAND {
            Some(lower)
        } else {
            Some(format!("[{}] {}", self.identity, input))
        }
    }

    /// Connect, perform the identity/time handshake and start the listener task.
    pub async fn connect(self: Arc<Self>, addr: impl ToSocketAddrs) -> Result<Link> {
        let stream = TcpStream::connect(addr).await?;
        let peer = stream.peer_addr()?.to_string();
        let (read, write) = stream.into_split();
        let outbound = spawn_line_writer(write, peer.clone());

        for line in [self.identity.clone(), self.time().to_string()] {
            queue_line(&outbound, line, &peer)?;
        }
        info!(identity = %self.identity, time = %self.time(), %peer, "connected");

        let (events_tx, events) = mpsc::unbounded_channel();
        let lines = BufReader::new(read).lines();
        let listener = tokio::spawn(self.listen(lines, outbound.clone(), events_tx));
        Ok(Link { peer, outbound, events, listener })
    }

    async fn listen(
        self: Arc<Self>,
        mut lines: Lines<BufReader<OwnedReadHalf>>,
        outbound: LineSender,
        events: mpsc::UnboundedSender<Inbound>,
    ) {
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "read failed");
                    break;
                }
            };
            let event = match self.handle_line(&line) {
                Ok(event) => event,
                Err(e) => {
                    warn!(error = %e, "discarding frame");
                    continue;
                }
            };
            match &event {
                Inbound::Replied { coordinator_time, offset } => {
                    debug!(%coordinator_time, offset, "offset requested")
                }
                Inbound::Adjusted { delta, time } => info!(delta, %time, "clock adjusted"),
                _ => {}
            }
            if let Some(reply) = event.reply() {
                if let Err(e) = queue_line(&outbound, reply.encode(), "coordinator") {
                    warn!(error = %e, "reply not sent");
                    if matches!(e, SyncError::ChannelClosed(_)) {
                        break;
                    }
                }
            }
            // Nobody watching is fine; keep answering the protocol.
            let _ = events.send(event);
        }
        let _ = events.send(Inbound::Closed);
    }
}

impl ClockHolder for Participant {
    fn time(&self) -> ClockTime {
        self.clock.time()
    }

    fn set_time(&self, time: ClockTime) {
        self.clock.set_time(time)
    }
}

/// A live connection to the coordinator.
#[derive(Debug)]
pub struct Link {
    peer: String,
    outbound: LineSender,
    events: mpsc::UnboundedReceiver<Inbound>,
    listener: JoinHandle<()>,
}

impl Link {
    pub fn send(&self, line: impl Into<String>) -> Result<()> {
        queue_line(&self.outbound, line.into(), &self.peer)
    }

    /// Next listener event; `None` once the listener is gone.
    pub async fn next_event(&mut self) -> Option<Inbound> {
        self.events.recv().await
    }

    /// Stop listening and close the write side; the coordinator sees end of stream.
    pub fn close(self) {
        self.listener.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(s: &str) -> ClockTime {
        s.parse().unwrap()
    }

    #[test]
    fn offset_request_does_not_move_the_clock() {
        let p = Participant::new("bob", t("10:20"));
        let ev = p.handle_line("OFFSET_REQUEST:10:00").unwrap();
        assert_eq!(ev, Inbound::Replied { coordinator_time: t("10:00"), offset: 20 });
        assert_eq!(ev.reply(), Some(Frame::Offset(20)));
        assert_eq!(p.time(), t("10:20"));

        let ev = p.handle_line("OFFSET_REQUEST:11:00").unwrap();
        assert_eq!(ev.reply(), Some(Frame::Offset(-40)));
    }

    #[test]
    fn adjust_wraps_around_midnight() {
        let p = Participant::new("bob", t("00:30"));
        assert_eq!(
            p.handle_line("ADJUST:-90").unwrap(),
            Inbound::Adjusted { delta: -90, time: t("23:00") }
        );
        p.handle_line("ADJUST:90").unwrap();
        assert_eq!(p.time(), t("00:30"));
    }

    #[test]
    fn other_lines_are_display_only() {
        let p = Participant::new("bob", t("12:00"));
        for line in ["[alice]: [alice] hi", "=== TIME REPORT ===", "server: 12:00", "sync"] {
            assert_eq!(p.handle_line(line).unwrap(), Inbound::Display(line.into()));
        }
        assert!(p.handle_line("ADJUST:lots").is_err());
        assert_eq!(p.time(), t("12:00"));
    }

    #[test]
    fn oversized_adjust_is_rejected() {
        let p = Participant::new("bob", t("12:00"));
        for line in ["ADJUST:9223372036854775807", "ADJUST:-9223372036854775808", "ADJUST:2880"] {
            assert!(matches!(p.handle_line(line), Err(ProtoError::MalformedAdjust(_))));
        }
        assert_eq!(p.time(), t("12:00"));
    }

    #[test]
    fn outbound_commands_and_chat() {
        let p = Participant::new("bob", t("12:00"));
        assert_eq!(p.outbound("SYNC").as_deref(), Some("sync"));
        assert_eq!(p.outbound(" Time ").as_deref(), Some("time"));
        assert_eq!(p.outbound("hello there").as_deref(), Some("[bob] hello there"));
        assert_eq!(p.outbound("   "), None);
    }
}
