//! The five-state lifecycle shared by all pollable endpoints.
//!
//! Every endpoint the server polls (listeners, accepted remote sockets, the
//! back-end connections) moves through `Initial → Starting → Started →
//! Stopping → Stopped`. The shared prologue lives in the provided
//! [`Connection::process`]; concrete kinds add behavior through the `on_*`
//! hooks.

use crate::error::{Error, Result};
use crate::poller::Event;
use crate::port::Port;
use crate::server::ServerCtx;
use std::os::fd::RawFd;

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Constructed, not yet registered.
    Initial,
    /// Registered with the poller, waiting for first readiness.
    Starting,
    /// Live.
    Started,
    /// Stop requested; cleanup pending.
    Stopping,
    /// Dead; the server destroys the connection.
    Stopped,
}

impl State {
    /// Whether this is `Initial`.
    #[must_use]
    pub const fn is_initial(self) -> bool {
        matches!(self, Self::Initial)
    }

    /// Whether this is `Starting`.
    #[must_use]
    pub const fn is_starting(self) -> bool {
        matches!(self, Self::Starting)
    }

    /// Whether this is `Started`.
    #[must_use]
    pub const fn is_started(self) -> bool {
        matches!(self, Self::Started)
    }

    /// Whether this is `Stopping`.
    #[must_use]
    pub const fn is_stopping(self) -> bool {
        matches!(self, Self::Stopping)
    }

    /// Whether this is `Stopped`.
    #[must_use]
    pub const fn is_stopped(self) -> bool {
        matches!(self, Self::Stopped)
    }
}

/// A pollable endpoint owned by the server.
///
/// The fd is stable for the life of the object; the bind port is whatever
/// the socket's local address reported at construction.
pub trait Connection {
    /// The file descriptor registered with the poller.
    fn fd(&self) -> RawFd;

    /// The local bind port, used by [`crate::Server::remove`].
    fn port(&self) -> Option<Port>;

    /// Current lifecycle state.
    fn state(&self) -> State;

    /// Replaces the lifecycle state.
    fn set_state(&mut self, state: State);

    /// Hook: ran once on the `Starting → Started` transition.
    fn on_start(&mut self, event: &Event, ctx: &mut ServerCtx) -> Result<()> {
        let _ = (event, ctx);
        Ok(())
    }

    /// Hook: ran on every event while `Started`.
    fn on_ready(&mut self, event: &Event, ctx: &mut ServerCtx) -> Result<()> {
        let _ = (event, ctx);
        Ok(())
    }

    /// Hook: ran when a bad event stops a `Started` connection.
    fn on_stop(&mut self, ctx: &mut ServerCtx) {
        let _ = ctx;
    }

    /// Hook: ran when a bad event kills a connection that never started
    /// (a failed non-blocking connect, an aborted accept).
    fn on_abort(&mut self, ctx: &mut ServerCtx) {
        let _ = ctx;
    }

    /// Registration transition; the server calls this from `add`.
    fn activate(&mut self) -> Result<()> {
        if !self.state().is_initial() {
            return Err(Error::bad_state("activate on a registered connection"));
        }
        self.set_state(State::Starting);
        Ok(())
    }

    /// Drives the lifecycle for one readiness event.
    ///
    /// The steps are sequential, not exclusive: a bad event takes a
    /// `Started` connection through `Stopping` to `Stopped` within this one
    /// call, and the server destroys it in the same pass.
    fn process(&mut self, event: &Event, ctx: &mut ServerCtx) -> Result<()> {
        if self.state().is_initial() {
            return Err(Error::bad_state("process on an unregistered connection"));
        }
        if self.state().is_starting() {
            if event.bad() {
                self.on_abort(ctx);
                self.set_state(State::Stopped);
                return Ok(());
            }
            self.set_state(State::Started);
            self.on_start(event, ctx)?;
        }
        if self.state().is_started() && event.bad() {
            self.on_stop(ctx);
            self.set_state(State::Stopping);
        }
        if self.state().is_started() {
            self.on_ready(event, ctx)?;
        }
        if self.state().is_stopping() {
            self.set_state(State::Stopped);
        }
        Ok(())
    }
}
