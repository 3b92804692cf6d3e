//! Per-document lock state held by a session.

use std::fmt;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use crate::settings::DEFAULT_LOCK_REFRESH_SECS;
use crate::util::random_hex;

/// Prefix of every lock token this server hands out.
pub const LOCK_TOKEN_PREFIX: &str = "cool-lock";

/// Where a [`LockContext`] stands in the lock lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// The host never reported lock support.
    Unsupported,
    Unlocked,
    Locked,
    /// Still believed locked, but the last lock request failed.
    LockLost,
}

/// Lock bookkeeping for one document session.
///
/// The token is generated once, on first use, and stays the same for the
/// life of the context.
#[derive(Debug)]
pub struct LockContext {
    supports_locks: bool,
    is_locked: bool,
    token: OnceLock<String>,
    last_lock_time: Option<Instant>,
    failure_reason: String,
    request_failed: bool,
    refresh_interval: Duration,
}

impl Default for LockContext {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_LOCK_REFRESH_SECS))
    }
}

impl LockContext {
    /// A zero `refresh_interval` disables refreshing.
    pub fn new(refresh_interval: Duration) -> Self {
        Self {
            supports_locks: false,
            is_locked: false,
            token: OnceLock::new(),
            last_lock_time: None,
            failure_reason: String::new(),
            request_failed: false,
            refresh_interval,
        }
    }

    /// A context resuming a lock taken earlier under `token`.
    pub fn with_token(refresh_interval: Duration, token: impl Into<String>) -> Self {
        let ctx = Self::new(refresh_interval);
        let _ = ctx.token.set(token.into());
        ctx
    }

    /// Mark locks as supported by the host. Only the first call has an effect.
    pub fn init_supports_locks(&mut self) {
        if self.supports_locks {
            return;
        }
        self.supports_locks = true;
        self.lock_token();
    }

    pub fn supports_locks(&self) -> bool {
        self.supports_locks
    }

    pub fn is_locked(&self) -> bool {
        self.is_locked
    }

    pub fn lock_token(&self) -> &str {
        self.token
            .get_or_init(|| format!("{}{}", LOCK_TOKEN_PREFIX, random_hex(8)))
    }

    pub fn last_lock_time(&self) -> Option<Instant> {
        self.last_lock_time
    }

    pub fn failure_reason(&self) -> &str {
        &self.failure_reason
    }

    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    /// Record a successful LOCK (or UNLOCK) acknowledged at `now`.
    pub fn record_lock(&mut self, locked: bool, now: Instant) {
        self.is_locked = locked;
        self.last_lock_time = Some(now);
        self.failure_reason.clear();
        self.request_failed = false;
    }

    /// Record a failed lock request; the lock state itself is unchanged.
    /// `reason` is empty when the host gave none or was unreachable.
    pub fn record_failure(&mut self, reason: impl Into<String>) {
        self.failure_reason = reason.into();
        self.request_failed = true;
    }

    /// Whether the last LOCK or UNLOCK request failed.
    pub fn request_failed(&self) -> bool {
        self.request_failed
    }

    pub fn clear_failure_reason(&mut self) {
        self.failure_reason.clear();
    }

    pub fn state(&self) -> LockState {
        match (self.supports_locks, self.is_locked) {
            (false, _) => LockState::Unsupported,
            (true, false) => LockState::Unlocked,
            (true, true) if !self.request_failed => LockState::Locked,
            (true, true) => LockState::LockLost,
        }
    }

    /// Whether the lock should be renewed at `now`.
    pub fn needs_refresh(&self, now: Instant) -> bool {
        if !self.supports_locks || !self.is_locked || self.refresh_interval.is_zero() {
            return false;
        }
        match self.last_lock_time {
            Some(locked_at) => now.saturating_duration_since(locked_at) >= self.refresh_interval,
            None => true,
        }
    }
}

impl fmt::Display for LockContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.supports_locks {
            return Ok(());
        }
        write!(f, "\n  LockContext:")?;
        write!(f, "\n    locked: {}", self.is_locked)?;
        write!(f, "\n    token: {}", self.lock_token())?;
        match self.last_lock_time {
            Some(at) => write!(f, "\n    last locked: {:?} ago", at.elapsed())?,
            None => write!(f, "\n    last locked: never")?,
        }
        if !self.failure_reason.is_empty() {
            write!(f, "\n    failure reason: {}", self.failure_reason)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_format_and_stability() {
        let ctx = LockContext::default();
        let token = ctx.lock_token().to_string();
        assert!(token.starts_with(LOCK_TOKEN_PREFIX));
        assert_eq!(token.len(), LOCK_TOKEN_PREFIX.len() + 8);
        assert!(token[LOCK_TOKEN_PREFIX.len()..]
            .chars()
            .all(|c| c.is_ascii_hexdigit()));
        assert_eq!(ctx.lock_token(), token);
    }

    #[test]
    fn test_tokens_differ_across_contexts() {
        let a = LockContext::default();
        let b = LockContext::default();
        assert_ne!(a.lock_token(), b.lock_token());
    }

    #[test]
    fn test_init_supports_locks_is_one_time() {
        let mut ctx = LockContext::default();
        assert_eq!(ctx.state(), LockState::Unsupported);

        ctx.init_supports_locks();
        let token = ctx.lock_token().to_string();
        ctx.init_supports_locks();

        assert!(ctx.supports_locks());
        assert_eq!(ctx.lock_token(), token);
        assert_eq!(ctx.state(), LockState::Unlocked);
    }

    #[test]
    fn test_needs_refresh_after_interval() {
        let mut ctx = LockContext::new(Duration::from_secs(60));
        ctx.init_supports_locks();
        let start = Instant::now();
        assert!(!ctx.needs_refresh(start));

        ctx.record_lock(true, start);
        assert!(!ctx.needs_refresh(start));
        assert!(!ctx.needs_refresh(start + Duration::from_secs(59)));
        assert!(ctx.needs_refresh(start + Duration::from_secs(60)));
        assert!(ctx.needs_refresh(start + Duration::from_secs(600)));
    }

    #[test]
    fn test_needs_refresh_disabled() {
        let mut ctx = LockContext::new(Duration::ZERO);
        ctx.init_supports_locks();
        let start = Instant::now();
        ctx.record_lock(true, start);
        assert!(!ctx.needs_refresh(start + Duration::from_secs(3600)));

        let mut unsupported = LockContext::new(Duration::from_secs(1));
        unsupported.record_lock(true, start);
        assert!(!unsupported.needs_refresh(start + Duration::from_secs(10)));
    }

    #[test]
    fn test_failed_refresh_is_lock_lost() {
        let mut ctx = LockContext::default();
        ctx.init_supports_locks();
        ctx.record_lock(true, Instant::now());
        assert_eq!(ctx.state(), LockState::Locked);

        ctx.record_failure("locked by another client");
        assert!(ctx.is_locked());
        assert_eq!(ctx.state(), LockState::LockLost);
        assert_eq!(ctx.failure_reason(), "locked by another client");

        ctx.record_lock(true, Instant::now());
        assert_eq!(ctx.state(), LockState::Locked);
    }

    #[test]
    fn test_failure_without_reason_is_lock_lost() {
        let mut ctx = LockContext::default();
        ctx.init_supports_locks();
        ctx.record_lock(true, Instant::now());

        ctx.record_failure("");
        assert!(ctx.request_failed());
        assert_eq!(ctx.failure_reason(), "");
        assert_eq!(ctx.state(), LockState::LockLost);

        ctx.clear_failure_reason();
        assert_eq!(ctx.state(), LockState::LockLost);

        ctx.record_lock(true, Instant::now());
        assert!(!ctx.request_failed());
        assert_eq!(ctx.state(), LockState::Locked);
    }

    #[test]
    fn test_display_dump() {
        let mut ctx = LockContext::default();
        assert_eq!(ctx.to_string(), "");

        ctx.init_supports_locks();
        let dump = ctx.to_string();
        assert!(dump.contains("locked: false"));
        assert!(dump.contains(ctx.lock_token()));
        assert!(dump.contains("never"));
    }

    #[test]
    fn test_resumed_token() {
        let mut ctx = LockContext::with_token(Duration::from_secs(60), "cool-lockabcd");
        ctx.init_supports_locks();
        assert_eq!(ctx.lock_token(), "cool-lockabcd");
        assert_eq!(ctx.refresh_interval(), Duration::from_secs(60));
    }
}
