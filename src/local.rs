//! The back-end half of a session and its delayed-connect task.
//!
//! The back-end VNC server needs a moment to come up after `vnc_start`, so
//! the connect attempt is not made inline: [`LocalClientTask`] fires after a
//! short delay and creates the [`LocalClient`], which performs a
//! non-blocking connect to `127.0.0.1:vnc_port`. The first writable
//! readiness completes the connect, wires the socket into the session,
//! flushes any bytes that raced in, and launches the X session.

use crate::connection::{Connection, State};
use crate::error::{Error, Result, ResultExt};
use crate::poller::{Event, Interest};
use crate::port::Port;
use crate::server::ServerCtx;
use crate::session::Session;
use crate::task::{Schedule, Task};
use crate::time::Time;
use socket2::{Domain, Protocol, Socket, Type};
use std::cell::RefCell;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;
use std::time::Duration;
use tracing::{debug, warn};

/// Delay before the back-end connect attempt.
const CONNECT_DELAY: Duration = Duration::from_secs(1);

/// Connect attempts before giving up on the back-end.
const CONNECT_ATTEMPTS: i32 = 1;

/// The relay endpoint facing the per-user back-end.
pub struct LocalClient {
    state: State,
    fd: RawFd,
    // Held until the connect completes, then moved into the session.
    socket: Option<Socket>,
    session: Rc<RefCell<Session>>,
}

impl LocalClient {
    /// Binds a fresh ephemeral socket on the loopback and starts a
    /// non-blocking connect to the session's back-end port.
    pub fn new(session: Rc<RefCell<Session>>) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
            .context("creating back-end socket")?;
        socket.set_nonblocking(true).context("O_NONBLOCK")?;
        let loopback = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0));
        socket.bind(&loopback.into()).context("binding loopback")?;
        let port = session.borrow().vnc_port();
        let target = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port.get()));
        match socket.connect(&target.into()) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(nix::libc::EINPROGRESS) => {}
            Err(e) => {
                return Err(Error::from(e).with_context(format!("connecting to {target}")))
            }
        }
        Ok(Self {
            state: State::Initial,
            fd: socket.as_raw_fd(),
            socket: Some(socket),
            session,
        })
    }
}

impl Connection for LocalClient {
    fn fd(&self) -> RawFd {
        self.fd
    }

    fn port(&self) -> Option<Port> {
        // Ephemeral bind; never the subject of a remove-by-port.
        None
    }

    fn state(&self) -> State {
        self.state
    }

    fn set_state(&mut self, state: State) {
        self.state = state;
    }

    fn on_start(&mut self, _event: &Event, _ctx: &mut ServerCtx) -> Result<()> {
        let Some(socket) = self.socket.take() else {
            return Ok(());
        };
        let mut session = self.session.borrow_mut();
        session.set_local(socket);
        session.flush()?;
        if let Err(error) = session.x_session_start() {
            warn!(user = %session.user().name(), %error, "failed to start X session");
        }
        Ok(())
    }

    fn on_ready(&mut self, event: &Event, _ctx: &mut ServerCtx) -> Result<()> {
        let mut session = self.session.borrow_mut();
        if event.readable() {
            session.pull_local()?;
            session.push_remote()?;
        }
        if event.writable() {
            session.push_local()?;
            session.pull_remote()?;
        }
        Ok(())
    }

    fn on_stop(&mut self, ctx: &mut ServerCtx) {
        let mut session = self.session.borrow_mut();
        ctx.retire(session.relay_fds());
        session.terminate();
    }

    fn on_abort(&mut self, _ctx: &mut ServerCtx) {
        // The back-end refused the connect. The session keeps its remote
        // half; a later error on that side tears it down.
        let session = self.session.borrow();
        debug!(
            user = %session.user().name(),
            port = %session.vnc_port(),
            "back-end connect failed"
        );
    }
}

/// Creates the [`LocalClient`] after [`CONNECT_DELAY`].
pub struct LocalClientTask {
    schedule: Schedule,
    session: Rc<RefCell<Session>>,
}

impl LocalClientTask {
    /// Schedules the back-end connect for `now + CONNECT_DELAY`.
    #[must_use]
    pub fn new(session: Rc<RefCell<Session>>, now: Time) -> Self {
        Self {
            schedule: Schedule::repeating(now + CONNECT_DELAY, CONNECT_DELAY, CONNECT_ATTEMPTS),
            session,
        }
    }
}

impl Task for LocalClientTask {
    fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    fn schedule_mut(&mut self) -> &mut Schedule {
        &mut self.schedule
    }

    fn run(&mut self, ctx: &mut ServerCtx) -> Result<()> {
        if self.session.borrow().terminated() {
            // The remote side died before the back-end came up.
            return Ok(());
        }
        let client = LocalClient::new(Rc::clone(&self.session))?;
        ctx.add(Box::new(client), Interest::duplex())
    }
}
