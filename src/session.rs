//! Per-user bridge: child processes, splice pipes, termination.
//!
//! A session owns everything one remote desktop connection needs: the
//! accepted remote socket, the socket to the per-user back-end, two kernel
//! pipes used as zero-copy relay buffers, and the child processes (the VNC
//! server and the X session) running under the target user's identity.
//!
//! Two pipes are needed, not one, so that a half-full forward flow cannot
//! stall the backward flow: bytes move `remote → inbound pipe → local` and
//! `local → outbound pipe → remote`.

use crate::error::{Error, Result, ResultExt};
use crate::port::Port;
use crate::user::User;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{chdir, initgroups, pipe2, setgid, setuid, Gid, Pid, Uid};
use socket2::Socket;
use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command};
use tracing::debug;

/// Environment variable naming the back-end VNC server executable.
pub const SERVER_PROGRAM_VAR: &str = "VNCD_SERVER";
/// Environment variable naming the X session executable.
pub const SESSION_PROGRAM_VAR: &str = "VNCD_SESSION";

/// Fallback relay buffer size when the pipe capacity cannot be read.
const DEFAULT_PIPE_CAPACITY: usize = 64 * 1024;

/// A kernel pipe used as a splice buffer.
#[derive(Debug)]
struct SplicePipe {
    read: OwnedFd,
    write: OwnedFd,
    capacity: usize,
}

impl SplicePipe {
    fn new() -> Result<Self> {
        let (read, write) =
            pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC).context("creating splice pipe")?;
        // SAFETY: plain fcntl query on an fd we own; a failure falls back to
        // the default pipe capacity.
        let capacity = match unsafe { nix::libc::fcntl(read.as_raw_fd(), nix::libc::F_GETPIPE_SZ) }
        {
            size if size > 0 => size as usize,
            _ => DEFAULT_PIPE_CAPACITY,
        };
        Ok(Self {
            read,
            write,
            capacity,
        })
    }
}

/// Moves everything currently available from `src` to `dst` without
/// blocking, up to `capacity` bytes per splice call.
///
/// Returns on EOF or when no more data can move right now. A peer that
/// vanished mid-transfer is not an error here; the poller reports it as a
/// bad event on the next wait and the state machine terminates the session.
fn transfer(src: RawFd, dst: RawFd, capacity: usize) -> Result<()> {
    loop {
        // SAFETY: both fds are owned by the session and open for the
        // duration of the call; null offsets mean "use the fd offsets".
        let moved = unsafe {
            nix::libc::splice(
                src,
                std::ptr::null_mut(),
                dst,
                std::ptr::null_mut(),
                capacity,
                nix::libc::SPLICE_F_NONBLOCK,
            )
        };
        if moved > 0 {
            continue;
        }
        if moved == 0 {
            return Ok(());
        }
        return match Errno::last() {
            Errno::EAGAIN | Errno::EPIPE | Errno::ECONNRESET => Ok(()),
            errno => Err(Error::from(errno).with_context("splice")),
        };
    }
}

/// The per-user bridge between a remote client and its private back-end.
#[derive(Debug)]
pub struct Session {
    user: User,
    listen_port: Port,
    vnc_port: Port,
    remote: Option<Socket>,
    local: Option<Socket>,
    inbound: Option<SplicePipe>,
    outbound: Option<SplicePipe>,
    children: Vec<Child>,
    terminated: bool,
    verbose: bool,
}

impl Session {
    /// Creates a session with both relay pipes open and no sockets yet.
    pub fn new(user: User, listen_port: Port, vnc_port: Port, verbose: bool) -> Result<Self> {
        Ok(Self {
            user,
            listen_port,
            vnc_port,
            remote: None,
            local: None,
            inbound: Some(SplicePipe::new()?),
            outbound: Some(SplicePipe::new()?),
            children: Vec::new(),
            terminated: false,
            verbose,
        })
    }

    /// The session's user.
    #[must_use]
    pub fn user(&self) -> &User {
        &self.user
    }

    /// The port the daemon accepted the remote client on.
    #[must_use]
    pub const fn listen_port(&self) -> Port {
        self.listen_port
    }

    /// The port the per-user back-end listens on.
    #[must_use]
    pub const fn vnc_port(&self) -> Port {
        self.vnc_port
    }

    /// Whether [`Session::terminate`] has run.
    #[must_use]
    pub const fn terminated(&self) -> bool {
        self.terminated
    }

    /// Stores the accepted remote socket.
    pub fn set_remote(&mut self, socket: Socket) {
        self.remote = Some(socket);
    }

    /// Stores the connected back-end socket.
    pub fn set_local(&mut self, socket: Socket) {
        self.local = Some(socket);
    }

    /// The fds of both relay sockets that are currently open.
    ///
    /// The server uses this to retire the sibling relay half when one side
    /// terminates the session: termination closes these fds, and a closed fd
    /// never produces another poll event to clean its connection up with.
    #[must_use]
    pub fn relay_fds(&self) -> Vec<RawFd> {
        self.remote
            .iter()
            .chain(self.local.iter())
            .map(AsRawFd::as_raw_fd)
            .collect()
    }

    /// Splices `remote → inbound pipe`.
    pub fn pull_remote(&mut self) -> Result<()> {
        match (&self.remote, &self.inbound, self.terminated) {
            (Some(remote), Some(pipe), false) => {
                transfer(remote.as_raw_fd(), pipe.write.as_raw_fd(), pipe.capacity)
            }
            _ => Ok(()),
        }
    }

    /// Splices `inbound pipe → local`.
    pub fn push_local(&mut self) -> Result<()> {
        match (&self.local, &self.inbound, self.terminated) {
            (Some(local), Some(pipe), false) => {
                transfer(pipe.read.as_raw_fd(), local.as_raw_fd(), pipe.capacity)
            }
            _ => Ok(()),
        }
    }

    /// Splices `local → outbound pipe`.
    pub fn pull_local(&mut self) -> Result<()> {
        match (&self.local, &self.outbound, self.terminated) {
            (Some(local), Some(pipe), false) => {
                transfer(local.as_raw_fd(), pipe.write.as_raw_fd(), pipe.capacity)
            }
            _ => Ok(()),
        }
    }

    /// Splices `outbound pipe → remote`.
    pub fn push_remote(&mut self) -> Result<()> {
        match (&self.remote, &self.outbound, self.terminated) {
            (Some(remote), Some(pipe), false) => {
                transfer(pipe.read.as_raw_fd(), remote.as_raw_fd(), pipe.capacity)
            }
            _ => Ok(()),
        }
    }

    /// Drains all four splice directions once, back-channel first.
    ///
    /// Ran when the back-end connection comes up, to move any bytes that
    /// arrived before both sides were wired.
    pub fn flush(&mut self) -> Result<()> {
        self.pull_local()?;
        self.push_remote()?;
        self.pull_remote()?;
        self.push_local()
    }

    /// Launches the per-user back-end VNC server.
    ///
    /// The child drops to the user's identity and execs `$VNCD_SERVER` with
    /// `VNCD_UID`, `VNCD_GID` and `VNCD_PORT` describing the session.
    pub fn vnc_start(&mut self) -> Result<()> {
        if self.terminated {
            return Ok(());
        }
        let program = std::env::var_os(SERVER_PROGRAM_VAR)
            .ok_or_else(|| Error::missing_env(SERVER_PROGRAM_VAR))?;
        let mut command = Command::new(program);
        command
            .env("VNCD_UID", self.user.uid().to_string())
            .env("VNCD_GID", self.user.gid().to_string())
            .env("VNCD_PORT", self.vnc_port.to_string());
        self.launch(command, "vnc server")
    }

    /// Launches the per-user X session.
    ///
    /// The child drops to the user's identity and execs `$VNCD_SESSION` with
    /// `DISPLAY` derived from the uid.
    pub fn x_session_start(&mut self) -> Result<()> {
        if self.terminated {
            return Ok(());
        }
        let program = std::env::var_os(SESSION_PROGRAM_VAR)
            .ok_or_else(|| Error::missing_env(SESSION_PROGRAM_VAR))?;
        let mut command = Command::new(program);
        command.env("DISPLAY", format!(":{}", self.user.uid()));
        self.launch(command, "x session")
    }

    fn launch(&mut self, mut command: Command, what: &str) -> Result<()> {
        command
            .env("HOME", self.user.home())
            .env("SHELL", self.user.shell())
            .env("USER", self.user.name());
        let identity = identity_hook(&self.user)?;
        // SAFETY: the hook only calls async-signal-safe syscalls (chdir,
        // initgroups, setgid, setuid) on values captured before the fork.
        unsafe {
            command.pre_exec(identity);
        }
        let child = command
            .spawn()
            .with_context(|| format!("spawning {what} for {}", self.user))?;
        if self.verbose {
            debug!(user = %self.user.name(), pid = child.id(), "launched {what}");
        }
        self.children.push(child);
        Ok(())
    }

    /// Tears the session down: signal and reap the children, close both
    /// pipes and both sockets. Idempotent; all further splice calls are
    /// no-ops.
    pub fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        for child in &mut self.children {
            let pid = Pid::from_raw(child.id() as i32);
            // ESRCH just means the child beat us to the exit.
            let _ = kill(pid, Signal::SIGTERM);
            let _ = child.try_wait();
        }
        self.children.clear();
        self.remote = None;
        self.local = None;
        self.inbound = None;
        self.outbound = None;
        self.terminated = true;
        debug!(user = %self.user.name(), "session terminated");
    }
}

/// Builds the pre-exec identity drop for `user`.
///
/// A no-op when the daemon already runs as the target user (unprivileged
/// deployments); otherwise: chdir to `/`, set supplementary groups, set the
/// real and effective gid and uid, chdir to the user's home.
fn identity_hook(user: &User) -> Result<impl FnMut() -> io::Result<()> + Send + 'static> {
    let uid = Uid::from_raw(user.uid());
    let gid = Gid::from_raw(user.gid());
    let name = CString::new(user.name())
        .map_err(|_| Error::new(crate::error::ErrorKind::BadArgument).with_context("user name"))?;
    let home = user.home().to_path_buf();
    Ok(move || {
        if Uid::effective() == uid && Gid::effective() == gid {
            return Ok(());
        }
        chdir("/").map_err(errno_io)?;
        initgroups(&name, gid).map_err(errno_io)?;
        setgid(gid).map_err(errno_io)?;
        setuid(uid).map_err(errno_io)?;
        chdir(&home).map_err(errno_io)?;
        Ok(())
    })
}

fn errno_io(errno: Errno) -> io::Error {
    io::Error::from_raw_os_error(errno as i32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Best-effort settle delay for tests that race the kernel.
    fn settle() {
        std::thread::sleep(Duration::from_millis(20));
    }

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn current_user() -> User {
        User::new(
            Uid::effective().as_raw(),
            Gid::effective().as_raw(),
            "tester",
            PathBuf::from("/"),
            PathBuf::from("/bin/sh"),
        )
    }

    fn session() -> Session {
        Session::new(
            current_user(),
            Port::new(50_001).unwrap(),
            Port::new(40_001).unwrap(),
            false,
        )
        .unwrap()
    }

    /// A connected TCP pair; the near end goes into the session.
    fn tcp_pair() -> (Socket, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let far = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (near, _) = listener.accept().unwrap();
        near.set_nonblocking(true).unwrap();
        (Socket::from(near), far)
    }

    #[test]
    fn relay_moves_bytes_remote_to_local() {
        let mut session = session();
        let (remote_near, mut remote_far) = tcp_pair();
        let (local_near, mut local_far) = tcp_pair();
        session.set_remote(remote_near);
        session.set_local(local_near);

        remote_far.write_all(b"hello\n").unwrap();
        settle();
        session.pull_remote().unwrap();
        session.push_local().unwrap();

        let mut buf = [0u8; 16];
        local_far
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let n = local_far.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello\n");
    }

    #[test]
    fn relay_moves_bytes_local_to_remote() {
        let mut session = session();
        let (remote_near, mut remote_far) = tcp_pair();
        let (local_near, mut local_far) = tcp_pair();
        session.set_remote(remote_near);
        session.set_local(local_near);

        local_far.write_all(b"echo").unwrap();
        settle();
        session.flush().unwrap();

        let mut buf = [0u8; 16];
        remote_far
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let n = remote_far.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"echo");
    }

    #[test]
    fn splice_without_sockets_is_a_noop() {
        let mut session = session();
        session.pull_remote().unwrap();
        session.push_local().unwrap();
        session.pull_local().unwrap();
        session.push_remote().unwrap();
        session.flush().unwrap();
    }

    #[test]
    fn terminate_is_idempotent_and_silences_splices() {
        let mut session = session();
        let (remote_near, mut remote_far) = tcp_pair();
        session.set_remote(remote_near);

        session.terminate();
        assert!(session.terminated());
        session.terminate();
        assert!(session.terminated());

        // All four directions are no-ops now.
        session.flush().unwrap();

        // The remote socket was closed by termination.
        remote_far
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(remote_far.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn relay_fds_lists_open_sockets() {
        let mut session = session();
        assert!(session.relay_fds().is_empty());
        let (remote_near, _remote_far) = tcp_pair();
        let fd = remote_near.as_raw_fd();
        session.set_remote(remote_near);
        assert_eq!(session.relay_fds(), vec![fd]);
        session.terminate();
        assert!(session.relay_fds().is_empty());
    }

    #[test]
    fn vnc_start_requires_the_server_program() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var(SERVER_PROGRAM_VAR);
        let mut session = session();
        let err = session.vnc_start().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigMissing);
    }

    #[test]
    fn vnc_start_spawns_and_terminate_reaps() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var(SERVER_PROGRAM_VAR, "/bin/true");
        let mut session = session();
        session.vnc_start().unwrap();
        std::env::remove_var(SERVER_PROGRAM_VAR);
        assert_eq!(session.children.len(), 1);
        settle();
        session.terminate();
        assert!(session.children.is_empty());
    }

    #[test]
    fn x_session_start_requires_the_session_program() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var(SESSION_PROGRAM_VAR);
        let mut session = session();
        let err = session.x_session_start().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigMissing);
    }
}
