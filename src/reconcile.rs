//! Periodic group-membership reconciliation.
//!
//! Every scan period the reconciler enumerates the configured group,
//! filters out accounts that must never get a listener (system accounts,
//! the kernel overflow ids, uids whose derived ports fall outside the port
//! range), and diffs the result against the previous scan: vanished members
//! lose their listener, new members gain one.

use crate::config::Config;
use crate::error::Result;
use crate::listener::LocalServer;
use crate::poller::Interest;
use crate::server::ServerCtx;
use crate::task::{Schedule, Task, REPEAT_FOREVER};
use crate::time::Time;
use crate::user::{OverflowIds, User, UserDirectory};
use std::collections::HashSet;
use tracing::{info, warn};

/// Lowest uid/gid considered a real login account.
const FIRST_LOGIN_ID: u32 = 1000;

/// The repeating reconciliation task.
pub struct UpdateUsers {
    schedule: Schedule,
    directory: Box<dyn UserDirectory>,
    config: Config,
    overflow: OverflowIds,
    tracked: HashSet<User>,
}

impl UpdateUsers {
    /// Creates the reconciler; the first scan fires immediately.
    #[must_use]
    pub fn new(directory: Box<dyn UserDirectory>, config: Config, now: Time) -> Self {
        let period = config.scan_period;
        Self {
            schedule: Schedule::repeating(now, period, REPEAT_FOREVER),
            directory,
            config,
            overflow: OverflowIds::read(),
            tracked: HashSet::new(),
        }
    }

    /// Overrides the overflow ids (tests).
    #[cfg(test)]
    pub(crate) fn with_overflow(mut self, overflow: OverflowIds) -> Self {
        self.overflow = overflow;
        self
    }

    /// Whether `user` may get a listener; logs the reason when not.
    fn eligible(&self, user: &User) -> bool {
        let reason = if user.uid() < FIRST_LOGIN_ID || user.gid() < FIRST_LOGIN_ID {
            Some("system account")
        } else if user.uid() == self.overflow.uid || user.gid() == self.overflow.gid {
            Some("kernel overflow id")
        } else if self.config.listen_port_for(user.uid()).is_err()
            || self.config.vnc_port_for(user.uid()).is_err()
        {
            Some("derived port out of range")
        } else {
            None
        };
        if let Some(reason) = reason {
            info!(user = %user, reason, "skipping user");
            return false;
        }
        true
    }
}

impl Task for UpdateUsers {
    fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    fn schedule_mut(&mut self) -> &mut Schedule {
        &mut self.schedule
    }

    fn run(&mut self, ctx: &mut ServerCtx) -> Result<()> {
        let members = self.directory.members(&self.config.group)?;
        let mut fresh: HashSet<User> = members
            .into_iter()
            .filter(|user| self.eligible(user))
            .collect();

        let removed: Vec<User> = self.tracked.difference(&fresh).cloned().collect();
        for user in removed {
            if let Ok(port) = self.config.listen_port_for(user.uid()) {
                info!(user = %user, %port, "user left the group, removing listener");
                ctx.remove(port);
            }
        }

        let added: Vec<User> = fresh.difference(&self.tracked).cloned().collect();
        for user in added {
            let address = self.config.listen_address_for(user.uid())?;
            let vnc_port = self.config.vnc_port_for(user.uid())?;
            let listener =
                LocalServer::new(address, vnc_port, user.clone(), self.config.verbose);
            let result = listener
                .and_then(|listener| ctx.add(Box::new(listener), Interest::reads()));
            match result {
                Ok(()) => info!(user = %user, %address, "listener added"),
                Err(error) => {
                    // Left untracked so the next scan retries the bind.
                    warn!(user = %user, %error, "failed to add listener");
                    fresh.remove(&user);
                }
            }
        }

        self.tracked = fresh;
        Ok(())
    }
}
