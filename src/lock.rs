//! Client-side lock handles.
//!
//! A [`Lock`] is a claim on a named row: it is valid only while its
//! record version number still matches the row's. Handles are cheap to
//! clone; the background heartbeat task holds one and mutates the
//! shared state through the handle-local mutex.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Per-acquisition options.
#[derive(Clone, Default)]
pub struct AcquireOptions {
    pub(crate) data: Vec<u8>,
    pub(crate) lease_duration: Option<Duration>,
    pub(crate) fail_if_locked: bool,
    pub(crate) keep_on_release: bool,
    pub(crate) replace_data: bool,
    pub(crate) cancel: Option<CancellationToken>,
}

impl AcquireOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Payload to associate with the lock. Written on insert, and on
    /// contested upsert only when [`replace_data`](Self::replace_data)
    /// is set.
    pub fn data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = data.into();
        self
    }

    /// Overrides the client's lease duration for this handle.
    pub fn lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = Some(lease_duration);
        self
    }

    /// Return `NotAcquired` immediately instead of waiting for the
    /// current holder.
    pub fn fail_if_locked(mut self, enable: bool) -> Self {
        self.fail_if_locked = enable;
        self
    }

    /// Leave the freed row in place on release instead of deleting it.
    pub fn keep_on_release(mut self, enable: bool) -> Self {
        self.keep_on_release = enable;
        self
    }

    /// Overwrite the stored payload when taking over an existing row.
    /// When unset, the previous holder's payload is preserved.
    pub fn replace_data(mut self, enable: bool) -> Self {
        self.replace_data = enable;
        self
    }

    /// Caller-side cancellation: a cancelled token converts a pending
    /// acquisition into `NotAcquired` and propagates to the handle's
    /// own token once the lock is held.
    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

struct LockState {
    record_version_number: i64,
    data: Vec<u8>,
    released: bool,
}

struct LockInner {
    name: String,
    lease_duration: Duration,
    fail_if_locked: bool,
    keep_on_release: bool,
    replace_data: bool,
    cancel: CancellationToken,
    // serializes heartbeat refreshes against release on this handle
    op: tokio::sync::Mutex<()>,
    state: Mutex<LockState>,
}

/// A claim on a named lock. The database row is the source of truth;
/// the handle is valid only while its record version number equals the
/// row's.
///
/// Dropping every clone of a handle does not release the lock: the
/// background heartbeat keeps refreshing the claim until
/// [`Client::release`](crate::Client::release) is called or the
/// refresher fails. With heartbeats disabled, an abandoned lock is
/// superseded by the next contender roughly one lease after the last
/// refresh.
#[derive(Clone)]
pub struct Lock {
    inner: Arc<LockInner>,
}

impl Lock {
    pub(crate) fn new(name: &str, default_lease: Duration, opts: AcquireOptions) -> Self {
        let cancel = match &opts.cancel {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        Self {
            inner: Arc::new(LockInner {
                name: name.to_string(),
                lease_duration: opts.lease_duration.unwrap_or(default_lease),
                fail_if_locked: opts.fail_if_locked,
                keep_on_release: opts.keep_on_release,
                replace_data: opts.replace_data,
                cancel,
                op: tokio::sync::Mutex::new(()),
                state: Mutex::new(LockState {
                    record_version_number: 0,
                    data: opts.data,
                    released: false,
                }),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Validity window of a single record version number; also the
    /// deadline of every transaction issued for this handle.
    pub fn lease_duration(&self) -> Duration {
        self.inner.lease_duration
    }

    /// The record version number this handle believes it owns. Zero
    /// before the first acquisition. Usable as a fencing token by the
    /// protected resource.
    pub fn record_version_number(&self) -> i64 {
        self.state().record_version_number
    }

    /// The payload observed on the last successful read, or the one to
    /// associate on the next write.
    pub fn data(&self) -> Vec<u8> {
        self.state().data.clone()
    }

    /// Once true, never clears. Set by release and by any conditional
    /// update that matched zero rows.
    pub fn is_released(&self) -> bool {
        self.state().released
    }

    /// Completes when the claim stops being defensible: the lock was
    /// released, lost to another client, or the caller's token was
    /// cancelled.
    pub async fn cancelled(&self) {
        self.inner.cancel.cancelled().await
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    pub(crate) fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    pub(crate) fn fail_if_locked(&self) -> bool {
        self.inner.fail_if_locked
    }

    pub(crate) fn keep_on_release(&self) -> bool {
        self.inner.keep_on_release
    }

    pub(crate) fn replace_data(&self) -> bool {
        self.inner.replace_data
    }

    pub(crate) fn op_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.inner.op
    }

    pub(crate) fn set_acquired(&self, record_version_number: i64, data: Vec<u8>) {
        let mut state = self.state();
        state.record_version_number = record_version_number;
        state.data = data;
    }

    /// Records the holder's version observed during a failed attempt,
    /// so the next attempt can race against the current holder once it
    /// goes silent.
    pub(crate) fn observe_record_version_number(&self, record_version_number: i64) {
        self.state().record_version_number = record_version_number;
    }

    pub(crate) fn set_record_version_number(&self, record_version_number: i64) {
        self.state().record_version_number = record_version_number;
    }

    pub(crate) fn mark_released(&self) {
        self.state().released = true;
    }

    fn state(&self) -> std::sync::MutexGuard<'_, LockState> {
        self.inner.state.lock().expect("lock state mutex poisoned")
    }
}

impl std::fmt::Debug for Lock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("Lock")
            .field("name", &self.inner.name)
            .field("record_version_number", &state.record_version_number)
            .field("released", &state.released)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_defaults() {
        let opts = AcquireOptions::new();
        assert!(opts.data.is_empty());
        assert!(opts.lease_duration.is_none());
        assert!(!opts.fail_if_locked);
        assert!(!opts.keep_on_release);
        assert!(!opts.replace_data);
        assert!(opts.cancel.is_none());
    }

    #[test]
    fn handle_starts_unowned() {
        let lock = Lock::new("jobs", Duration::from_secs(20), AcquireOptions::new());
        assert_eq!(lock.name(), "jobs");
        assert_eq!(lock.record_version_number(), 0);
        assert!(lock.data().is_empty());
        assert!(!lock.is_released());
        assert_eq!(lock.lease_duration(), Duration::from_secs(20));
    }

    #[test]
    fn lease_override_wins() {
        let opts = AcquireOptions::new().lease_duration(Duration::from_secs(2));
        let lock = Lock::new("jobs", Duration::from_secs(20), opts);
        assert_eq!(lock.lease_duration(), Duration::from_secs(2));
    }

    #[test]
    fn released_flag_is_monotonic() {
        let lock = Lock::new("jobs", Duration::from_secs(20), AcquireOptions::new());
        lock.set_acquired(7, b"payload".to_vec());
        assert_eq!(lock.record_version_number(), 7);
        assert_eq!(lock.data(), b"payload");

        lock.mark_released();
        assert!(lock.is_released());
        // a later heartbeat bump does not resurrect the claim
        lock.set_record_version_number(9);
        assert!(lock.is_released());
    }

    #[test]
    fn observed_version_replaces_claim() {
        let lock = Lock::new("jobs", Duration::from_secs(20), AcquireOptions::new());
        lock.observe_record_version_number(41);
        assert_eq!(lock.record_version_number(), 41);
    }

    #[test]
    fn caller_token_propagates_to_handle() {
        let parent = CancellationToken::new();
        let opts = AcquireOptions::new().cancel(parent.clone());
        let lock = Lock::new("jobs", Duration::from_secs(20), opts);
        assert!(!lock.is_cancelled());
        parent.cancel();
        assert!(lock.is_cancelled());
    }
}
