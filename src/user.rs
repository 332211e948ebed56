//! User records and group-membership lookup.
//!
//! The event-loop core consumes plain [`User`] records; where they come from
//! is behind the [`UserDirectory`] trait so reconciliation can be tested
//! against a fake directory.

use crate::error::{Error, ErrorKind, Result};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;

/// An account eligible for a per-user proxy listener.
///
/// Equality and hashing are by `uid` alone: reconciliation treats a user
/// whose name or shell changed as the same user.
#[derive(Debug, Clone)]
pub struct User {
    uid: u32,
    gid: u32,
    name: String,
    home: PathBuf,
    shell: PathBuf,
}

impl User {
    /// Creates a user record.
    #[must_use]
    pub fn new(uid: u32, gid: u32, name: impl Into<String>, home: PathBuf, shell: PathBuf) -> Self {
        Self {
            uid,
            gid,
            name: name.into(),
            home,
            shell,
        }
    }

    /// The user id.
    #[must_use]
    pub const fn uid(&self) -> u32 {
        self.uid
    }

    /// The primary group id.
    #[must_use]
    pub const fn gid(&self) -> u32 {
        self.gid
    }

    /// The login name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The home directory.
    #[must_use]
    pub fn home(&self) -> &std::path::Path {
        &self.home
    }

    /// The login shell.
    #[must_use]
    pub fn shell(&self) -> &std::path::Path {
        &self.shell
    }
}

impl PartialEq for User {
    fn eq(&self, other: &Self) -> bool {
        self.uid == other.uid
    }
}

impl Eq for User {}

impl Hash for User {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.uid.hash(state);
    }
}

impl fmt::Display for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.uid)
    }
}

impl From<nix::unistd::User> for User {
    fn from(u: nix::unistd::User) -> Self {
        Self {
            uid: u.uid.as_raw(),
            gid: u.gid.as_raw(),
            name: u.name,
            home: u.dir,
            shell: u.shell,
        }
    }
}

/// Source of group membership.
pub trait UserDirectory {
    /// Resolves the members of `group` to user records.
    ///
    /// Names that do not resolve to a user are dropped here; policy checks
    /// (system accounts, overflow ids, port range) belong to the caller.
    fn members(&self, group: &str) -> Result<Vec<User>>;
}

/// The system user database, via `getgrnam`/`getpwnam`.
#[derive(Debug, Default)]
pub struct SystemDirectory;

impl UserDirectory for SystemDirectory {
    fn members(&self, group: &str) -> Result<Vec<User>> {
        let entry = nix::unistd::Group::from_name(group)
            .map_err(|e| Error::from(e).with_context(format!("looking up group {group:?}")))?
            .ok_or_else(|| {
                Error::new(ErrorKind::BadArgument).with_context(format!("no such group: {group}"))
            })?;
        let mut users = Vec::with_capacity(entry.mem.len());
        for name in &entry.mem {
            match nix::unistd::User::from_name(name) {
                Ok(Some(user)) => users.push(User::from(user)),
                Ok(None) => tracing::warn!(user = %name, "group member has no user entry"),
                Err(e) => tracing::warn!(user = %name, error = %e, "user lookup failed"),
            }
        }
        Ok(users)
    }
}

/// The kernel overflow uid/gid, read from `/proc/sys/fs`.
///
/// Accounts mapped to the overflow id (65534 unless the sysctl says
/// otherwise) are placeholders and never get a listener.
#[derive(Debug, Clone, Copy)]
pub struct OverflowIds {
    /// `/proc/sys/fs/overflowuid`.
    pub uid: u32,
    /// `/proc/sys/fs/overflowgid`.
    pub gid: u32,
}

impl OverflowIds {
    const DEFAULT: u32 = 65_534;

    /// Reads the overflow ids, falling back to 65534.
    #[must_use]
    pub fn read() -> Self {
        Self {
            uid: read_sysctl("/proc/sys/fs/overflowuid"),
            gid: read_sysctl("/proc/sys/fs/overflowgid"),
        }
    }
}

impl Default for OverflowIds {
    fn default() -> Self {
        Self {
            uid: Self::DEFAULT,
            gid: Self::DEFAULT,
        }
    }
}

fn read_sysctl(path: &str) -> u32 {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(OverflowIds::DEFAULT)
}
