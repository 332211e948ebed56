//! Per-user accepting socket.
//!
//! One `LocalServer` exists per eligible group member, bound to
//! `<address>:listen_base + uid`. It enforces the single-session policy: as
//! long as the current session is alive, further clients are accepted and
//! immediately dropped so the backlog stays clear and the listener stays
//! level-triggered-clean.

use crate::connection::{Connection, State};
use crate::error::{Result, ResultExt};
use crate::local::LocalClientTask;
use crate::poller::{Event, Interest};
use crate::port::Port;
use crate::remote::RemoteClient;
use crate::server::ServerCtx;
use crate::session::Session;
use crate::user::User;
use socket2::{Domain, Protocol, Socket, Type};
use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;
use tracing::{debug, info, warn};

/// The accepting socket for one user, plus the session slot.
pub struct LocalServer {
    state: State,
    socket: Socket,
    port: Port,
    vnc_port: Port,
    user: User,
    session: Option<Rc<RefCell<Session>>>,
    verbose: bool,
}

impl LocalServer {
    /// Binds and listens on `address` for `user`.
    pub fn new(address: SocketAddr, vnc_port: Port, user: User, verbose: bool) -> Result<Self> {
        let domain = Domain::for_address(address);
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
            .context("creating listener socket")?;
        socket.set_reuse_address(true).context("SO_REUSEADDR")?;
        socket.set_nonblocking(true).context("O_NONBLOCK")?;
        socket
            .bind(&address.into())
            .with_context(|| format!("binding {address}"))?;
        socket.listen(128).context("listen")?;
        let port = Port::new(address.port())?;
        Ok(Self {
            state: State::Initial,
            socket,
            port,
            vnc_port,
            user,
            session: None,
            verbose,
        })
    }

    /// The user this listener serves.
    #[must_use]
    pub fn user(&self) -> &User {
        &self.user
    }

    /// Whether a live session currently occupies the slot.
    fn busy(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| !session.borrow().terminated())
    }

    /// Starts a session around the first accepted socket.
    fn open_session(&mut self, socket: Socket, ctx: &mut ServerCtx) -> Result<()> {
        socket.set_nonblocking(true).context("accepted socket")?;
        let session = Session::new(
            self.user.clone(),
            self.port,
            self.vnc_port,
            self.verbose,
        )?;
        let session = Rc::new(RefCell::new(session));
        self.session = Some(Rc::clone(&session));
        let client = RemoteClient::new(socket, Rc::clone(&session));
        ctx.add(Box::new(client), Interest::duplex())?;
        ctx.submit(Box::new(LocalClientTask::new(session, ctx.now())));
        Ok(())
    }
}

impl Connection for LocalServer {
    fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    fn port(&self) -> Option<Port> {
        Some(self.port)
    }

    fn state(&self) -> State {
        self.state
    }

    fn set_state(&mut self, state: State) {
        self.state = state;
    }

    fn on_ready(&mut self, event: &Event, ctx: &mut ServerCtx) -> Result<()> {
        if !event.readable() {
            return Ok(());
        }
        loop {
            match self.socket.accept() {
                Ok((socket, peer)) => {
                    let peer = peer.as_socket();
                    if self.busy() {
                        debug!(
                            user = %self.user.name(),
                            peer = ?peer,
                            "session slot busy, refusing client"
                        );
                        drop(socket);
                        continue;
                    }
                    info!(user = %self.user.name(), peer = ?peer, "client connected");
                    if let Err(error) = self.open_session(socket, ctx) {
                        warn!(user = %self.user.name(), %error, "failed to open session");
                        // A half-wired session must not occupy the slot.
                        if let Some(session) = &self.session {
                            session.borrow_mut().terminate();
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                // The peer gave up between SYN and accept; keep draining.
                Err(e) if e.raw_os_error() == Some(nix::libc::ECONNABORTED) => {}
                Err(e) => return Err(crate::error::Error::from(e).with_context("accept")),
            }
        }
        Ok(())
    }
}
