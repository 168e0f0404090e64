//! Berkeley-style clock synchronization over line-oriented TCP.
//! Provides:
//! - `ClockTime` / `ClockHolder`: minute-precision clocks that wrap at midnight
//! - `Frame`: the text protocol shared by coordinator and participants
//! - `SessionRegistry` and `SyncRound`: the coordinator's session and round machinery
//! - `Coordinator` and `Participant`: the two ends of a connection

pub mod clock;
pub mod coordinator;
pub mod error;
pub mod logging;
pub mod net;
pub mod participant;
pub mod proto;
pub mod registry;
pub mod round;

pub use clock::{ClockCell, ClockHolder, ClockTime};
pub use coordinator::{Control, Coordinator, CoordinatorConfig, RoundOutcome, RoundReport, DEFAULT_PORT};
pub use error::SyncError;
pub use participant::{Inbound, Link, Participant};
pub use proto::{Frame, ProtoError};
pub use registry::{Session, SessionRegistry};
pub use round::{RoundSlot, RoundStatus, SyncRound};
