use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;

use super::clock::Clock;
use crate::config::LockoutConfig;
use crate::models::{AccountLockout, LockoutStatus, LoginAttempt};

#[derive(Default)]
struct AccountState {
    /// Most recent last, bounded.
    attempts: VecDeque<LoginAttempt>,
    /// Failures since the last reset point, inside the window.
    failures: VecDeque<DateTime<Utc>>,
    active: Option<AccountLockout>,
    /// Closed lockouts, most recent last.
    history: VecDeque<AccountLockout>,
}

impl AccountState {
    /// A lapsed lockout moves to history. Its expiry is a reset point.
    fn expire_lapsed(&mut self, now: DateTime<Utc>, history_size: usize) {
        let lapsed = self.active.as_ref().is_some_and(|l| !l.is_active(now));
        if lapsed {
            if let Some(lockout) = self.active.take() {
                self.archive(lockout, history_size);
                self.failures.clear();
            }
        }
    }

    /// No lock, and nothing left inside the window to count toward one.
    fn is_idle(&self, horizon: DateTime<Utc>) -> bool {
        self.active.is_none()
            && self.failures.back().is_none_or(|t| *t <= horizon)
            && self.attempts.back().is_none_or(|a| a.attempted_at <= horizon)
    }

    fn archive(&mut self, lockout: AccountLockout, history_size: usize) {
        self.history.push_back(lockout);
        while self.history.len() > history_size {
            self.history.pop_front();
        }
    }
}

/// Failed-login tracking and account lock state, keyed by username.
///
/// Keys are trimmed and lowercased, the same folding the credential store
/// applies on lookup, so case variants of a name share one lock.
pub struct LockoutManager {
    config: LockoutConfig,
    accounts: DashMap<String, AccountState>,
    clock: Arc<dyn Clock>,
}

impl LockoutManager {
    pub fn new(config: LockoutConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            accounts: DashMap::new(),
            clock,
        }
    }

    fn account_key(username: &str) -> String {
        username.trim().to_lowercase()
    }

    /// Record a credential check. Returns the lockout this attempt triggered, if any.
    pub fn record_attempt(
        &self,
        username: &str,
        ip: IpAddr,
        success: bool,
        failure_reason: Option<&str>,
    ) -> Option<AccountLockout> {
        let now = self.clock.now();
        let mut state = self.accounts.entry(Self::account_key(username)).or_default();
        state.expire_lapsed(now, self.config.history_size);

        state.attempts.push_back(LoginAttempt {
            username: username.to_string(),
            ip,
            attempted_at: now,
            success,
            failure_reason: failure_reason.map(str::to_string),
        });
        let horizon = now - Duration::seconds(self.config.window_seconds);
        while state.attempts.len() > self.config.max_tracked_attempts
            || state.attempts.front().is_some_and(|a| a.attempted_at <= horizon)
        {
            state.attempts.pop_front();
        }

        if success {
            state.failures.clear();
            return None;
        }

        if state.active.is_some() {
            return None;
        }

        state.failures.push_back(now);
        while state.failures.front().is_some_and(|t| *t <= horizon) {
            state.failures.pop_front();
        }

        let count = state.failures.len() as u32;
        if count < self.config.threshold {
            tracing::debug!(username, %ip, failures = count, "Failed login recorded");
            return None;
        }

        let lockout = AccountLockout {
            username: username.to_string(),
            reason: format!(
                "{} failed login attempts within {} seconds",
                count, self.config.window_seconds
            ),
            locked_at: now,
            expires_at: now + Duration::seconds(self.config.duration_seconds),
            attempt_count: count,
            unlocked_by: None,
            unlock_reason: None,
            unlocked_at: None,
        };
        state.failures.clear();
        state.active = Some(lockout.clone());

        tracing::warn!(
            username,
            %ip,
            attempts = count,
            expires_at = %lockout.expires_at,
            "Account locked after repeated failed logins"
        );
        Some(lockout)
    }

    pub fn check_lockout(&self, username: &str) -> LockoutStatus {
        let now = self.clock.now();
        let Some(mut state) = self.accounts.get_mut(&Self::account_key(username)) else {
            return LockoutStatus::unlocked();
        };
        state.expire_lapsed(now, self.config.history_size);

        match &state.active {
            Some(lockout) => LockoutStatus::from_lockout(lockout),
            None => LockoutStatus::unlocked(),
        }
    }

    /// Close an active lockout early. Returns the closed record, or `None`
    /// when the account was not locked.
    pub fn unlock(&self, username: &str, actor: &str, reason: &str) -> Option<AccountLockout> {
        let now = self.clock.now();
        let mut state = self.accounts.get_mut(&Self::account_key(username))?;
        state.expire_lapsed(now, self.config.history_size);

        let mut lockout = state.active.take()?;
        lockout.unlocked_by = Some(actor.to_string());
        lockout.unlock_reason = Some(reason.to_string());
        lockout.unlocked_at = Some(now);

        state.failures.clear();
        state.archive(lockout.clone(), self.config.history_size);

        tracing::info!(username, actor, reason, "Account unlocked");
        Some(lockout)
    }

    /// Active lockout first, then closed ones, most recent first.
    pub fn lockout_history(&self, username: &str) -> Vec<AccountLockout> {
        self.accounts
            .get(&Self::account_key(username))
            .map(|state| {
                state
                    .active
                    .iter()
                    .chain(state.history.iter().rev())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop idle accounts, closing lapsed locks first. Closed lockouts of a
    /// dropped account go with it; the audit trail keeps the permanent record.
    pub fn purge_idle(&self) -> usize {
        let now = self.clock.now();
        let horizon = now - Duration::seconds(self.config.window_seconds);
        let history_size = self.config.history_size;

        let before = self.accounts.len();
        self.accounts.retain(|_, state| {
            state.expire_lapsed(now, history_size);
            !state.is_idle(horizon)
        });
        let purged = before.saturating_sub(self.accounts.len());
        if purged > 0 {
            tracing::debug!(purged, "Purged idle lockout state");
        }
        purged
    }

    pub fn tracked_accounts(&self) -> usize {
        self.accounts.len()
    }

    /// Attempts still inside the window, most recent first.
    pub fn recent_attempts(&self, username: &str) -> Vec<LoginAttempt> {
        let horizon = self.clock.now() - Duration::seconds(self.config.window_seconds);
        self.accounts
            .get(&Self::account_key(username))
            .map(|state| {
                state
                    .attempts
                    .iter()
                    .rev()
                    .filter(|a| a.attempted_at > horizon)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}
