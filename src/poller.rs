//! Readiness poller: one epoll instance plus an internal notify pipe.
//!
//! The poller is the single blocking point of the daemon. Listening sockets
//! register level-triggered read interest; relay sockets register
//! edge-triggered duplex interest so an idle-writable socket does not wake
//! the loop continuously. The notify pipe lets task submission interrupt a
//! long wait; its fd shows up in the ready set and is skipped by the event
//! dispatcher.

use crate::error::{Result, ResultExt};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::unistd::pipe2;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::time::Duration;

/// The readiness set a connection registers for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    read: bool,
    write: bool,
    edge: bool,
}

impl Interest {
    /// Level-triggered read interest (listeners).
    #[must_use]
    pub const fn reads() -> Self {
        Self {
            read: true,
            write: false,
            edge: false,
        }
    }

    /// Edge-triggered read-and-write interest (relay sockets).
    #[must_use]
    pub const fn duplex() -> Self {
        Self {
            read: true,
            write: true,
            edge: true,
        }
    }

    fn flags(self) -> EpollFlags {
        let mut flags = EpollFlags::empty();
        if self.read {
            flags |= EpollFlags::EPOLLIN;
        }
        if self.write {
            flags |= EpollFlags::EPOLLOUT;
        }
        if self.edge {
            flags |= EpollFlags::EPOLLET | EpollFlags::EPOLLRDHUP;
        }
        flags
    }
}

/// One readiness report for one file descriptor.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    fd: RawFd,
    flags: EpollFlags,
}

impl Event {
    pub(crate) const fn new(fd: RawFd, flags: EpollFlags) -> Self {
        Self { fd, flags }
    }

    /// The file descriptor this event is for.
    #[must_use]
    pub const fn fd(&self) -> RawFd {
        self.fd
    }

    /// Read readiness.
    #[must_use]
    pub fn readable(&self) -> bool {
        self.flags.contains(EpollFlags::EPOLLIN)
    }

    /// Write readiness.
    #[must_use]
    pub fn writable(&self) -> bool {
        self.flags.contains(EpollFlags::EPOLLOUT)
    }

    /// Error or hangup: the peer is gone or the socket failed.
    #[must_use]
    pub fn bad(&self) -> bool {
        self.flags.intersects(
            EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP | EpollFlags::EPOLLRDHUP,
        )
    }
}

/// The epoll wrapper with its notify pipe.
#[derive(Debug)]
pub struct Poller {
    epoll: Epoll,
    notify_read: OwnedFd,
    notify_write: OwnedFd,
}

impl Poller {
    /// Creates the epoll instance and registers the notify pipe.
    pub fn new() -> Result<Self> {
        let epoll =
            Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).context("creating epoll instance")?;
        let (notify_read, notify_write) =
            pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC).context("creating notify pipe")?;
        epoll
            .add(
                &notify_read,
                EpollEvent::new(EpollFlags::EPOLLIN, notify_read.as_raw_fd() as u64),
            )
            .context("registering notify pipe")?;
        Ok(Self {
            epoll,
            notify_read,
            notify_write,
        })
    }

    /// Registers a file descriptor for the given readiness set.
    pub fn add(&self, fd: BorrowedFd<'_>, interest: Interest) -> Result<()> {
        self.epoll
            .add(fd, EpollEvent::new(interest.flags(), fd.as_raw_fd() as u64))
            .with_context(|| format!("registering fd {}", fd.as_raw_fd()))?;
        Ok(())
    }

    /// Deregisters a file descriptor.
    ///
    /// The fd may already be closed (closing removes it from epoll
    /// automatically), so callers typically ignore the error.
    pub fn delete(&self, fd: RawFd) -> Result<()> {
        // SAFETY: the borrow lives only for this call; if the fd is already
        // closed the kernel answers EBADF, which callers discard.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        self.epoll
            .delete(borrowed)
            .with_context(|| format!("deregistering fd {fd}"))?;
        Ok(())
    }

    /// Wakes a blocked [`Poller::wait`].
    pub fn notify(&self) {
        // A full pipe already guarantees a pending wakeup.
        let _ = nix::unistd::write(&self.notify_write, &[1u8]);
    }

    /// Whether `fd` is the notify pipe's read end.
    #[must_use]
    pub fn is_notify(&self, fd: RawFd) -> bool {
        fd == self.notify_read.as_raw_fd()
    }

    /// Empties the notify pipe after a wakeup.
    pub fn drain_notify(&self) {
        let mut buf = [0u8; 64];
        while matches!(nix::unistd::read(self.notify_read.as_raw_fd(), &mut buf), Ok(n) if n > 0) {}
    }

    /// Waits for readiness, retrying transparently when a signal interrupts
    /// the wait. `None` blocks until an event arrives.
    pub fn wait(&self, events: &mut Vec<Event>, timeout: Option<Duration>) -> Result<usize> {
        let timeout = match timeout {
            None => EpollTimeout::NONE,
            Some(d) => {
                // Round up so a task due in under a millisecond does not spin,
                // and clamp long sleeps (the loop recomputes after waking).
                let millis = d.as_nanos().div_ceil(1_000_000).min(u128::from(u16::MAX));
                EpollTimeout::from(millis as u16)
            }
        };
        let mut ready = [EpollEvent::empty(); 64];
        let n = loop {
            match self.epoll.wait(&mut ready, timeout) {
                Ok(n) => break n,
                Err(Errno::EINTR) => {}
                Err(e) => return Err(crate::error::Error::from(e).with_context("epoll wait")),
            }
        };
        events.clear();
        for event in &ready[..n] {
            events.push(Event::new(event.data() as RawFd, event.events()));
        }
        Ok(n)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Hand-built events for state-machine tests.

    use super::{Event, EpollFlags};
    use std::os::fd::RawFd;

    pub(crate) fn readable_event(fd: RawFd) -> Event {
        Event::new(fd, EpollFlags::EPOLLIN)
    }

    pub(crate) fn writable_event(fd: RawFd) -> Event {
        Event::new(fd, EpollFlags::EPOLLOUT)
    }

    pub(crate) fn bad_event(fd: RawFd) -> Event {
        Event::new(fd, EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP)
    }
}
