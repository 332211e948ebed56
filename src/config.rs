//! Daemon configuration.
//!
//! Assembled by the CLI and consumed by the group reconciler. Per-user
//! ports are derived from the two bases by adding the uid; the derivation
//! goes through [`Port`] so an out-of-range sum skips the user instead of
//! wrapping into someone else's port.

use crate::error::{Error, ErrorKind, Result};
use crate::port::Port;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Everything the daemon needs to run.
#[derive(Debug, Clone)]
pub struct Config {
    /// UNIX group whose members get per-user listeners.
    pub group: String,
    /// Bind address for the listeners.
    pub address: IpAddr,
    /// Base listen port; a user's port is `listen_base + uid`.
    pub listen_base: Port,
    /// Base back-end VNC port; a user's port is `vnc_base + uid`.
    pub vnc_base: Port,
    /// TCP user-timeout for all sockets.
    pub user_timeout: Duration,
    /// Group re-scan period.
    pub scan_period: Duration,
    /// Extra per-session logging.
    pub verbose: bool,
}

impl Config {
    /// Configuration for `group` with the documented defaults.
    #[must_use]
    pub fn new(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_base: Port::new(50_000).expect("default base is valid"),
            vnc_base: Port::new(40_000).expect("default base is valid"),
            user_timeout: Duration::from_secs(60),
            scan_period: Duration::from_secs(30),
            verbose: false,
        }
    }

    /// Rejects configurations the daemon cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.group.is_empty() {
            return Err(Error::new(ErrorKind::BadArgument).with_context("empty group name"));
        }
        if self.scan_period.is_zero() {
            return Err(Error::new(ErrorKind::BadArgument).with_context("zero scan period"));
        }
        Ok(())
    }

    /// The listen address for `uid`, or `BadPort` if it falls outside the
    /// port range.
    pub fn listen_address_for(&self, uid: u32) -> Result<SocketAddr> {
        let port = self.listen_port_for(uid)?;
        Ok(SocketAddr::new(self.address, port.get()))
    }

    /// The listen port for `uid`.
    pub fn listen_port_for(&self, uid: u32) -> Result<Port> {
        Port::try_from(u32::from(self.listen_base.get()) + uid)
    }

    /// The back-end VNC port for `uid`.
    pub fn vnc_port_for(&self, uid: u32) -> Result<Port> {
        Port::try_from(u32::from(self.vnc_base.get()) + uid)
    }
}
