//! The accepted remote half of a session.
//!
//! Wraps the socket a remote VNC client was accepted on. Construction hands
//! the socket to the session and launches the back-end VNC server; while
//! started, readiness events drive the remote-side splice directions.

use crate::connection::{Connection, State};
use crate::error::Result;
use crate::poller::Event;
use crate::port::Port;
use crate::server::ServerCtx;
use crate::session::Session;
use socket2::Socket;
use std::cell::RefCell;
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;
use tracing::warn;

/// The relay endpoint facing the remote client.
pub struct RemoteClient {
    state: State,
    fd: RawFd,
    port: Port,
    session: Rc<RefCell<Session>>,
}

impl RemoteClient {
    /// Stores `socket` as the session's remote side and launches the
    /// back-end VNC server.
    ///
    /// A launch failure is logged, not fatal: the relay stays up and the
    /// back-end connect attempt will surface the problem.
    pub fn new(socket: Socket, session: Rc<RefCell<Session>>) -> Self {
        let fd = socket.as_raw_fd();
        let port = session.borrow().listen_port();
        {
            let mut session = session.borrow_mut();
            session.set_remote(socket);
            if let Err(error) = session.vnc_start() {
                warn!(user = %session.user().name(), %error, "failed to start VNC server");
            }
        }
        Self {
            state: State::Initial,
            fd,
            port,
            session,
        }
    }

    fn terminate(&mut self, ctx: &mut ServerCtx) {
        let mut session = self.session.borrow_mut();
        ctx.retire(session.relay_fds());
        session.terminate();
    }
}

impl Connection for RemoteClient {
    fn fd(&self) -> RawFd {
        self.fd
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

    fn on_ready(&mut self, event: &Event, _ctx: &mut ServerCtx) -> Result<()> {
        let mut session = self.session.borrow_mut();
        if event.readable() {
            session.pull_remote()?;
            session.push_local()?;
        }
        if event.writable() {
            session.push_remote()?;
            session.pull_local()?;
        }
        Ok(())
    }

    fn on_stop(&mut self, ctx: &mut ServerCtx) {
        self.terminate(ctx);
    }

    fn on_abort(&mut self, ctx: &mut ServerCtx) {
        // The client vanished before the relay started; without it the
        // session can never be used, so free the slot.
        self.terminate(ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poller::test_support::{bad_event, readable_event};
    use crate::server::test_support::ctx;
    use crate::user::User;
    use nix::unistd::{Gid, Uid};
    use std::net::{TcpListener, TcpStream};
    use std::path::PathBuf;

    fn test_session() -> Rc<RefCell<Session>> {
        let user = User::new(
            Uid::effective().as_raw(),
            Gid::effective().as_raw(),
            "tester",
            PathBuf::from("/"),
            PathBuf::from("/bin/sh"),
        );
        Rc::new(RefCell::new(
            Session::new(
                user,
                Port::new(50_001).unwrap(),
                Port::new(40_001).unwrap(),
                false,
            )
            .unwrap(),
        ))
    }

    fn accepted_socket() -> Socket {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let _client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (near, _) = listener.accept().unwrap();
        near.set_nonblocking(true).unwrap();
        Socket::from(near)
    }

    #[test]
    fn reports_the_listen_port_of_its_session() {
        let session = test_session();
        let client = RemoteClient::new(accepted_socket(), session);
        assert_eq!(client.port(), Some(Port::new(50_001).unwrap()));
        assert_eq!(client.state(), State::Initial);
    }

    #[test]
    fn bad_event_terminates_the_session() {
        let session = test_session();
        let mut client = RemoteClient::new(accepted_socket(), Rc::clone(&session));
        let mut ctx = ctx();
        client.activate().unwrap();
        client.process(&readable_event(client.fd()), &mut ctx).unwrap();
        assert_eq!(client.state(), State::Started);

        client.process(&bad_event(client.fd()), &mut ctx).unwrap();
        assert_eq!(client.state(), State::Stopped);
        assert!(session.borrow().terminated());
    }

    #[test]
    fn abort_before_start_also_frees_the_slot() {
        let session = test_session();
        let mut client = RemoteClient::new(accepted_socket(), Rc::clone(&session));
        let mut ctx = ctx();
        client.activate().unwrap();
        client.process(&bad_event(client.fd()), &mut ctx).unwrap();
        assert_eq!(client.state(), State::Stopped);
        assert!(session.borrow().terminated());
    }
}
