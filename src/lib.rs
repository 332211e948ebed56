//! vncd: a multi-user front-end proxy for remote desktop (VNC) access.
//!
//! For each member of a configured UNIX group the daemon listens on a
//! distinct TCP port, accepts at most one active client at a time, launches a
//! private per-user back-end VNC server and X session under that user's real
//! UID/GID, and relays bytes between the remote client and the back-end
//! through kernel splice pipes. Group membership is re-scanned periodically
//! so listeners appear and disappear as users join or leave the group.
//!
//! # Architecture
//!
//! Everything runs on one thread. A single epoll instance watches listening
//! sockets, relay sockets, and an internal notify pipe; a min-heap of timed
//! tasks shares the same wait. Parallelism comes from the kernel (splice)
//! and from the forked per-user child processes.
//!
//! # Module Structure
//!
//! - [`error`]: Error kinds and the crate-wide `Result`
//! - [`time`]: Nanosecond time values and pluggable clocks
//! - [`port`]: Validated TCP port numbers
//! - [`user`]: User records and group-membership lookup
//! - [`task`]: Timed tasks and the scheduling queue
//! - [`poller`]: Readiness poller (epoll plus notify pipe)
//! - [`connection`]: The five-state connection lifecycle
//! - [`session`]: Per-user bridge: child processes, pipes, splice relay
//! - [`listener`]: Per-user accepting socket
//! - [`remote`]: The accepted remote half of a session
//! - [`local`]: The back-end half of a session and its delayed-connect task
//! - [`reconcile`]: Periodic group-membership reconciliation
//! - [`server`]: The event loop and task scheduler
//! - [`config`]: Daemon configuration

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]

pub mod config;
pub mod connection;
pub mod error;
pub mod listener;
pub mod local;
pub mod poller;
pub mod port;
pub mod reconcile;
pub mod remote;
pub mod server;
pub mod session;
pub mod task;
pub mod time;
pub mod user;

pub use config::Config;
pub use connection::{Connection, State};
pub use error::{Error, ErrorKind, Result, ResultExt};
pub use poller::{Event, Interest, Poller};
pub use port::Port;
pub use server::{Server, ServerCtx};
pub use session::Session;
pub use task::{Schedule, Task, TaskQueue};
pub use time::{Time, TimeSource, VirtualClock, WallClock};
pub use user::{User, UserDirectory};
