//! The event loop and task scheduler.
//!
//! One `Server` owns every pollable connection and every timed task. Its
//! run loop waits on the poller for at most the time until the earliest
//! task is due, then dispatches either ready events or due tasks. All of it
//! happens on one thread; connections and tasks receive a [`ServerCtx`] to
//! submit new work while the connection table itself stays with the server.

use crate::connection::Connection;
use crate::error::{Error, ErrorKind, Result, ResultExt};
use crate::poller::{Event, Interest, Poller};
use crate::port::Port;
use crate::task::{Task, TaskQueue};
use crate::time::{Time, TimeSource, WallClock};
use std::collections::HashMap;
use std::os::fd::{BorrowedFd, RawFd};
use std::rc::Rc;
use std::time::Duration;
use tracing::warn;

/// Default TCP user-timeout applied to added connections.
const DEFAULT_USER_TIMEOUT: Duration = Duration::from_secs(60);

/// The scheduler surface handed to connections and tasks.
///
/// Everything here can be used while the server is dispatching: poller
/// registration happens immediately, while table mutations (newly added
/// connections, retired fds, removed ports) are queued and applied by the
/// server's sweep at the top of the next iteration.
pub struct ServerCtx {
    poller: Poller,
    tasks: TaskQueue,
    clock: Rc<dyn TimeSource>,
    user_timeout: Duration,
    pending: Vec<Box<dyn Connection>>,
    retired: Vec<RawFd>,
    removed_ports: Vec<Port>,
}

impl ServerCtx {
    fn new(clock: Rc<dyn TimeSource>) -> Result<Self> {
        Ok(Self {
            poller: Poller::new()?,
            tasks: TaskQueue::new(),
            clock,
            user_timeout: DEFAULT_USER_TIMEOUT,
            pending: Vec::new(),
            retired: Vec::new(),
            removed_ports: Vec::new(),
        })
    }

    /// The current time on the server's clock.
    #[must_use]
    pub fn now(&self) -> Time {
        self.clock.now()
    }

    /// Takes ownership of a connection: applies the TCP user-timeout,
    /// registers the fd for `interest`, and moves the connection to
    /// `Starting`. The table insertion lands at the next sweep.
    pub fn add(&mut self, mut connection: Box<dyn Connection>, interest: Interest) -> Result<()> {
        let fd = connection.fd();
        if fd < 0 {
            return Err(Error::new(ErrorKind::BadArgument).with_context("connection without an fd"));
        }
        self.apply_user_timeout(fd)?;
        connection.activate()?;
        // SAFETY: the fd belongs to the connection we are taking ownership
        // of and stays open at least until the registration is dropped.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        self.poller.add(borrowed, interest)?;
        self.pending.push(connection);
        Ok(())
    }

    /// Queues a task and wakes the poller so the new deadline is seen.
    pub fn submit(&mut self, task: Box<dyn Task>) {
        self.tasks.push(task);
        self.poller.notify();
    }

    /// Schedules every connection bound to `port` for destruction.
    pub fn remove(&mut self, port: Port) {
        self.removed_ports.push(port);
    }

    /// Schedules stale connection-table entries for destruction.
    ///
    /// Used when a session is terminated: its sockets close, and a closed
    /// fd never produces the poll event that would otherwise clean up the
    /// sibling relay half.
    pub fn retire(&mut self, fds: Vec<RawFd>) {
        self.retired.extend(fds);
    }

    fn apply_user_timeout(&self, fd: RawFd) -> Result<()> {
        if self.user_timeout.is_zero() {
            return Ok(());
        }
        // SAFETY: the fd is open; the borrow lives only for the setsockopt.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let socket = socket2::SockRef::from(&borrowed);
        socket
            .set_tcp_user_timeout(Some(self.user_timeout))
            .context("TCP_USER_TIMEOUT")?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn pending_connections(&self) -> usize {
        self.pending.len()
    }
}

/// The single-threaded scheduler and poller loop.
pub struct Server {
    connections: HashMap<RawFd, Box<dyn Connection>>,
    ctx: ServerCtx,
    events: Vec<Event>,
}

impl Server {
    /// Creates a server on the wall clock.
    pub fn new() -> Result<Self> {
        Self::with_clock(Rc::new(WallClock::new()))
    }

    /// Creates a server on an explicit clock (virtual time in tests).
    pub fn with_clock(clock: Rc<dyn TimeSource>) -> Result<Self> {
        Ok(Self {
            connections: HashMap::new(),
            ctx: ServerCtx::new(clock)?,
            events: Vec::new(),
        })
    }

    /// Default TCP user-timeout for every subsequently added connection.
    pub fn set_user_timeout(&mut self, timeout: Duration) {
        self.ctx.user_timeout = timeout;
    }

    /// The current time on the server's clock.
    #[must_use]
    pub fn now(&self) -> Time {
        self.ctx.now()
    }

    /// Registers a connection; see [`ServerCtx::add`].
    pub fn add(&mut self, connection: Box<dyn Connection>, interest: Interest) -> Result<()> {
        self.ctx.add(connection, interest)?;
        self.absorb_pending();
        Ok(())
    }

    /// Queues a task.
    pub fn submit(&mut self, task: Box<dyn Task>) {
        self.ctx.submit(task);
    }

    /// Removes and destroys every connection bound to `port`.
    pub fn remove(&mut self, port: Port) {
        self.ctx.remove(port);
        self.sweep();
    }

    /// The number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// The bind ports of all live connections that have one.
    #[must_use]
    pub fn bound_ports(&self) -> Vec<Port> {
        let mut ports: Vec<Port> = self
            .connections
            .values()
            .filter_map(|c| c.port())
            .collect();
        ports.sort_unstable();
        ports
    }

    /// Enters the main loop. Does not return under normal operation.
    pub fn run(&mut self) -> Result<()> {
        loop {
            self.turn()?;
        }
    }

    /// Runs one scheduler iteration: sweep, wait, dispatch.
    ///
    /// `run` calls this forever; tests step the loop with it.
    pub fn turn(&mut self) -> Result<()> {
        self.sweep();
        let timeout = self
            .ctx
            .tasks
            .next_deadline()
            .map(|at| at.saturating_since(self.ctx.now()));
        let mut events = std::mem::take(&mut self.events);
        let ready = self.ctx.poller.wait(&mut events, timeout)?;
        if ready == 0 {
            self.process_tasks();
        } else {
            self.process_events(&events);
        }
        self.events = events;
        Ok(())
    }

    /// Dispatches one batch of readiness events.
    fn process_events(&mut self, events: &[Event]) {
        for event in events {
            if self.ctx.poller.is_notify(event.fd()) {
                self.ctx.poller.drain_notify();
                continue;
            }
            let Some(mut connection) = self.connections.remove(&event.fd()) else {
                warn!(fd = event.fd(), "event for unknown fd");
                continue;
            };
            if let Err(error) = connection.process(event, &mut self.ctx) {
                warn!(%error, "session error");
            }
            if connection.state().is_stopped() {
                let _ = self.ctx.poller.delete(connection.fd());
            } else {
                self.connections.insert(connection.fd(), connection);
            }
        }
    }

    /// Runs every task whose fire time has passed, requeueing periodic ones.
    fn process_tasks(&mut self) {
        let now = self.ctx.now();
        while let Some(mut task) = self.ctx.tasks.pop_due(now) {
            if let Err(error) = task.run(&mut self.ctx) {
                warn!(%error, "task error");
            }
            if task.schedule_mut().complete_run(now) {
                self.ctx.tasks.push(task);
            }
        }
    }

    /// Applies deferred table mutations.
    ///
    /// Order matters: port removals and retired fds drop stale entries
    /// before newly added connections (possibly reusing the same fd
    /// numbers) are inserted.
    fn sweep(&mut self) {
        for port in std::mem::take(&mut self.ctx.removed_ports) {
            self.connections.retain(|_, connection| {
                if connection.port() == Some(port) {
                    let _ = self.ctx.poller.delete(connection.fd());
                    false
                } else {
                    true
                }
            });
        }
        for fd in std::mem::take(&mut self.ctx.retired) {
            // The fd was closed by session termination, which already
            // removed it from the poller.
            self.connections.remove(&fd);
        }
        self.connections.retain(|_, connection| {
            if connection.state().is_stopped() {
                let _ = self.ctx.poller.delete(connection.fd());
                false
            } else {
                true
            }
        });
        self.absorb_pending();
    }

    fn absorb_pending(&mut self) {
        for connection in std::mem::take(&mut self.ctx.pending) {
            self.connections.insert(connection.fd(), connection);
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Construction helpers for state-machine tests.

    use super::ServerCtx;
    use crate::time::VirtualClock;
    use std::rc::Rc;

    pub(crate) fn ctx() -> ServerCtx {
        ServerCtx::new(Rc::new(VirtualClock::new())).expect("poller available")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Schedule, REPEAT_FOREVER};
    use crate::time::VirtualClock;
    use std::cell::Cell;

    struct Counter {
        schedule: Schedule,
        runs: Rc<Cell<u32>>,
    }

    impl Task for Counter {
        fn schedule(&self) -> &Schedule {
            &self.schedule
        }

        fn schedule_mut(&mut self) -> &mut Schedule {
            &mut self.schedule
        }

        fn run(&mut self, _ctx: &mut ServerCtx) -> Result<()> {
            self.runs.set(self.runs.get() + 1);
            Ok(())
        }
    }

    fn virtual_server() -> (Server, Rc<VirtualClock>) {
        let clock = Rc::new(VirtualClock::new());
        let server = Server::with_clock(clock.clone()).unwrap();
        (server, clock)
    }

    #[test]
    fn due_task_runs_on_turn() {
        let (mut server, clock) = virtual_server();
        let runs = Rc::new(Cell::new(0));
        server.submit(Box::new(Counter {
            schedule: Schedule::once_at(Time::from_secs(1)),
            runs: runs.clone(),
        }));

        // Not due yet: the wait consumes the submit wakeup, nothing runs.
        server.turn().unwrap();
        assert_eq!(runs.get(), 0);

        clock.set(Time::from_secs(1));
        server.turn().unwrap();
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn periodic_task_stays_queued_forever() {
        let (mut server, clock) = virtual_server();
        let runs = Rc::new(Cell::new(0));
        server.submit(Box::new(Counter {
            schedule: Schedule::repeating(Time::ZERO, Duration::from_secs(30), REPEAT_FOREVER),
            runs: runs.clone(),
        }));
        server.turn().unwrap(); // consume the submit wakeup
        for tick in 0..5u64 {
            clock.set(Time::from_secs(tick * 30));
            server.turn().unwrap();
        }
        assert_eq!(runs.get(), 5);
        assert!(!server.ctx.tasks.is_empty());
    }

    #[test]
    fn spent_one_shot_task_leaves_the_queue() {
        let (mut server, clock) = virtual_server();
        let runs = Rc::new(Cell::new(0));
        server.submit(Box::new(Counter {
            schedule: Schedule::once_at(Time::ZERO),
            runs: runs.clone(),
        }));
        server.turn().unwrap();
        clock.set(Time::from_secs(1));
        server.turn().unwrap();
        assert_eq!(runs.get(), 1);
        assert!(server.ctx.tasks.is_empty());
    }

    #[test]
    fn remove_by_port_destroys_the_listener() {
        use crate::listener::LocalServer;
        use crate::user::User;

        let (mut server, _clock) = virtual_server();
        let user = User::new(
            nix::unistd::Uid::effective().as_raw(),
            nix::unistd::Gid::effective().as_raw(),
            "tester",
            "/".into(),
            "/bin/sh".into(),
        );
        let address: std::net::SocketAddr = "127.0.0.1:48233".parse().unwrap();
        let port = Port::new(48_233).unwrap();
        let listener =
            LocalServer::new(address, Port::new(40_001).unwrap(), user.clone(), false).unwrap();
        server.add(Box::new(listener), Interest::reads()).unwrap();
        assert_eq!(server.bound_ports(), vec![port]);

        server.remove(port);
        assert_eq!(server.connection_count(), 0);

        // The socket is gone: the port can be bound again right away.
        let rebound = LocalServer::new(address, Port::new(40_001).unwrap(), user, false);
        assert!(rebound.is_ok());
    }
}
