//! The lock client: acquisition, heartbeats, release, and the
//! serialization-failure retry discipline.
//!
//! Mutual exclusion is delegated entirely to the database. Every
//! mutating operation runs in a serializable transaction bounded by one
//! lease duration, draws a fresh record version number from the table's
//! sequence, and performs a conditional update keyed on the version the
//! handle last observed. A conditional update that matches zero rows
//! means the claim is gone.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use deadpool_postgres::Pool;
use tokio_postgres::types::ToSql;
use tokio_postgres::IsolationLevel;
use tracing::{debug, warn};

use crate::error::{classify, Error};
use crate::lock::{AcquireOptions, Lock};

/// Table used to store lock content and metadata unless overridden.
pub const DEFAULT_TABLE_NAME: &str = "locks";

/// Recommended period a lock stays valid before another client may
/// steal it.
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(20);

/// Recommended interval between lease refreshes.
pub const DEFAULT_HEARTBEAT_FREQUENCY: Duration = Duration::from_secs(5);

struct ClientInner {
    pool: Pool,
    table_name: String,
    lease_duration: Duration,
    heartbeat_frequency: Duration,
}

/// PostgreSQL-backed distributed lock client. Cheap to clone; all
/// clones share one connection pool. Make sure it talks to the leader
/// and not a follower in replicated setups.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

/// Configures a [`Client`] before construction.
pub struct Builder {
    table_name: String,
    lease_duration: Duration,
    heartbeat_frequency: Duration,
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            table_name: DEFAULT_TABLE_NAME.to_string(),
            lease_duration: DEFAULT_LEASE_DURATION,
            heartbeat_frequency: DEFAULT_HEARTBEAT_FREQUENCY,
        }
    }
}

impl Builder {
    /// Alternate lock table name. The companion sequence is named
    /// `<table_name>_rvn`.
    pub fn table_name(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = table_name.into();
        self
    }

    /// How long a lease stays valid without a refresh.
    pub fn lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self
    }

    /// Interval between lease refreshes. Must be at most half the lease
    /// duration; `Duration::ZERO` disables the background heartbeat.
    pub fn heartbeat_frequency(mut self, heartbeat_frequency: Duration) -> Self {
        self.heartbeat_frequency = heartbeat_frequency;
        self
    }

    pub fn build(self, pool: Pool) -> Result<Client, Error> {
        if !self.heartbeat_frequency.is_zero() && self.lease_duration < 2 * self.heartbeat_frequency
        {
            return Err(Error::DurationTooSmall);
        }
        Ok(Client {
            inner: Arc::new(ClientInner {
                pool,
                table_name: self.table_name,
                lease_duration: self.lease_duration,
                heartbeat_frequency: self.heartbeat_frequency,
            }),
        })
    }
}

impl Client {
    /// A client with the default table name, lease, and heartbeat.
    pub fn new(pool: Pool) -> Client {
        Client {
            inner: Arc::new(ClientInner {
                pool,
                table_name: DEFAULT_TABLE_NAME.to_string(),
                lease_duration: DEFAULT_LEASE_DURATION,
                heartbeat_frequency: DEFAULT_HEARTBEAT_FREQUENCY,
            }),
        }
    }

    pub fn builder() -> Builder {
        Builder::default()
    }

    /// Prepares the lock table and its record version number sequence.
    /// Fails if the table already exists; idempotent re-creation is
    /// deliberately not offered.
    pub async fn create_table(&self) -> Result<(), Error> {
        let table = &self.inner.table_name;
        let statements = [
            format!(
                "CREATE TABLE {table} (\n\
                 \tname CHARACTER VARYING(255) PRIMARY KEY,\n\
                 \trecord_version_number BIGINT,\n\
                 \tdata BYTEA\n\
                 )"
            ),
            format!("CREATE SEQUENCE {table}_rvn OWNED BY {table}.record_version_number"),
        ];
        let conn = self.inner.pool.get().await?;
        for statement in &statements {
            conn.batch_execute(statement)
                .await
                .map_err(|err| classify(err, "cannot set up the lock table"))?;
        }
        Ok(())
    }

    /// Grabs the lock with the given name, waiting one lease duration
    /// between attempts until it succeeds. With
    /// [`fail_if_locked`](AcquireOptions::fail_if_locked) the first
    /// contested attempt returns [`Error::NotAcquired`] instead. A
    /// caller token cancelled between attempts converts to
    /// `NotAcquired`; one cancelled while a database call is in flight
    /// abandons the attempt and surfaces [`Error::Cancelled`].
    pub async fn acquire(&self, name: &str, opts: AcquireOptions) -> Result<Lock, Error> {
        let lock = Lock::new(name, self.inner.lease_duration, opts);
        loop {
            if lock.is_cancelled() {
                return Err(Error::NotAcquired);
            }
            let attempt = tokio::select! {
                res = self.try_acquire(&lock) => res,
                _ = lock.cancelled() => Err(Error::Cancelled {
                    context: "lock acquisition",
                }),
            };
            match attempt {
                Ok(()) => return Ok(lock),
                Err(Error::NotAcquired) if !lock.fail_if_locked() && !lock.is_cancelled() => {
                    debug!(
                        name = %lock.name(),
                        wait = ?lock.lease_duration(),
                        "lock not acquired, waiting one lease duration"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(lock.lease_duration()) => {}
                        _ = lock.cancelled() => return Err(Error::NotAcquired),
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Runs `f` while holding the named lock. The handle's token is
    /// cancelled when the heartbeat detects loss of the lock (or, with
    /// heartbeats disabled, one lease after acquisition); `f` should
    /// watch [`Lock::cancelled`] and wind down. The lock is released on
    /// all exit paths; a release failure other than
    /// [`Error::AlreadyReleased`] is surfaced in place of `f`'s result.
    pub async fn with_lock<T, F, Fut>(
        &self,
        name: &str,
        opts: AcquireOptions,
        f: F,
    ) -> Result<T, Error>
    where
        F: FnOnce(Lock) -> Fut,
        Fut: Future<Output = T>,
    {
        let lock = self.acquire(name, opts).await?;
        if self.inner.heartbeat_frequency.is_zero() {
            self.spawn_lease_watchdog(&lock);
        }
        // if the scoped future is dropped or panics before release, the
        // refresher must stop so another client can supersede the claim
        let _guard = CancelOnDrop(lock.clone());
        let result = f(lock.clone()).await;
        match self.release(&lock).await {
            Ok(()) | Err(Error::AlreadyReleased) => Ok(result),
            Err(err) => {
                warn!(name = %lock.name(), error = %err, "cannot release lock after scoped execution");
                Err(err)
            }
        }
    }

    /// Returns the lock to other clients. The freed row is deleted
    /// unless the handle was acquired with
    /// [`keep_on_release`](AcquireOptions::keep_on_release). Repeated
    /// calls on the same handle return [`Error::AlreadyReleased`].
    pub async fn release(&self, lock: &Lock) -> Result<(), Error> {
        if lock.is_released() {
            return Err(Error::AlreadyReleased);
        }
        loop {
            match self.store_release(lock).await {
                Err(err) if err.is_serialization_failure() => {
                    debug!(name = %lock.name(), error = %err, "retrying release");
                }
                other => return other,
            }
        }
    }

    /// Refreshes the lease so other clients cannot steal the lock. The
    /// background heartbeat task calls this on its own; it is public
    /// for holders that manage their own refresh cadence.
    pub async fn send_heartbeat(&self, lock: &Lock) -> Result<(), Error> {
        loop {
            match self.store_heartbeat(lock).await {
                Err(err) if err.is_serialization_failure() => {
                    debug!(name = %lock.name(), error = %err, "retrying heartbeat");
                }
                other => return other,
            }
        }
    }

    /// Reads the payload of a named lock without holding it. The
    /// `FOR UPDATE` read fences against concurrent writers.
    pub async fn get_data(&self, name: &str) -> Result<Vec<u8>, Error> {
        loop {
            match self.get_lock_data(name).await {
                Err(err) if err.is_serialization_failure() => {
                    debug!(name = %name, error = %err, "retrying lock data read");
                }
                other => return other,
            }
        }
    }

    async fn try_acquire(&self, lock: &Lock) -> Result<(), Error> {
        loop {
            match self.store_acquire(lock).await {
                Err(err) if err.is_serialization_failure() => {
                    debug!(name = %lock.name(), error = %err, "retrying acquisition");
                }
                Err(err) => return Err(err),
                Ok(()) => break,
            }
        }
        self.spawn_heartbeat(lock);
        Ok(())
    }

    async fn store_acquire(&self, lock: &Lock) -> Result<(), Error> {
        match tokio::time::timeout(lock.lease_duration(), self.store_acquire_tx(lock)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                context: "lock acquisition",
            }),
        }
    }

    async fn store_acquire_tx(&self, lock: &Lock) -> Result<(), Error> {
        let table = &self.inner.table_name;
        let mut conn = self.inner.pool.get().await?;
        let client: &mut tokio_postgres::Client = &mut conn;
        let tx = client
            .build_transaction()
            .isolation_level(IsolationLevel::Serializable)
            .start()
            .await
            .map_err(|err| classify(err, "cannot create transaction for lock acquisition"))?;
        let new_rvn = self.next_rvn(&tx).await?;
        let name = lock.name();
        let claimant_rvn = lock.record_version_number();
        let payload = lock.data();
        let payload_param: Option<&[u8]> = (!payload.is_empty()).then_some(payload.as_slice());
        debug!(
            name = %lock.name(),
            rvn = new_rvn,
            claimant_rvn = claimant_rvn,
            "attempting lock acquisition"
        );
        let upsert = format!(
            "INSERT INTO {table} (\"name\", \"record_version_number\", \"data\")\n\
             VALUES ($1, $2, $3)\n\
             ON CONFLICT (\"name\") DO UPDATE\n\
             SET\n\
             \t\"record_version_number\" = $2,\n\
             \t\"data\" = CASE WHEN $5 THEN $3 ELSE {table}.\"data\" END\n\
             WHERE\n\
             \t{table}.\"record_version_number\" IS NULL\n\
             \tOR {table}.\"record_version_number\" = $4"
        );
        let replace_data = lock.replace_data();
        let params: [&(dyn ToSql + Sync); 5] = [
            &name,
            &new_rvn,
            &payload_param,
            &claimant_rvn,
            &replace_data,
        ];
        tx.execute(&upsert, &params)
            .await
            .map_err(|err| classify(err, "cannot run query to acquire lock"))?;

        let confirm = format!(
            "SELECT \"record_version_number\", \"data\" FROM {table} WHERE \"name\" = $1 FOR UPDATE"
        );
        let row = tx
            .query_one(&confirm, &[&lock.name()])
            .await
            .map_err(|err| classify(err, "cannot load information for lock acquisition"))?;
        let actual_rvn: i64 = row
            .try_get(0)
            .map_err(|err| classify(err, "cannot load information for lock acquisition"))?;
        let data: Option<Vec<u8>> = row
            .try_get(1)
            .map_err(|err| classify(err, "cannot load information for lock acquisition"))?;

        if actual_rvn != new_rvn {
            debug!(
                name = %lock.name(),
                held_rvn = actual_rvn,
                "lock held by another client, recording its version"
            );
            lock.observe_record_version_number(actual_rvn);
            return Err(Error::NotAcquired);
        }
        tx.commit()
            .await
            .map_err(|err| classify(err, "cannot commit lock acquisition"))?;
        lock.set_acquired(new_rvn, data.unwrap_or_default());
        Ok(())
    }

    async fn store_release(&self, lock: &Lock) -> Result<(), Error> {
        let _op = lock.op_lock().lock().await;
        match tokio::time::timeout(lock.lease_duration(), self.store_release_tx(lock)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                context: "lock release",
            }),
        }
    }

    async fn store_release_tx(&self, lock: &Lock) -> Result<(), Error> {
        let table = &self.inner.table_name;
        let mut conn = self.inner.pool.get().await?;
        let client: &mut tokio_postgres::Client = &mut conn;
        let tx = client
            .build_transaction()
            .isolation_level(IsolationLevel::Serializable)
            .start()
            .await
            .map_err(|err| classify(err, "cannot create transaction for lock release"))?;
        let clear = format!(
            "UPDATE {table}\n\
             SET \"record_version_number\" = NULL\n\
             WHERE \"name\" = $1 AND \"record_version_number\" = $2"
        );
        let claimant_rvn = lock.record_version_number();
        let affected = tx
            .execute(&clear, &[&lock.name(), &claimant_rvn])
            .await
            .map_err(|err| classify(err, "cannot run query to release lock"))?;
        if affected == 0 {
            lock.mark_released();
            lock.cancel();
            return Err(Error::AlreadyReleased);
        }
        if !lock.keep_on_release() {
            let delete = format!(
                "DELETE FROM {table}\n\
                 WHERE \"name\" = $1 AND \"record_version_number\" IS NULL"
            );
            tx.execute(&delete, &[&lock.name()])
                .await
                .map_err(|err| classify(err, "cannot run query to delete lock"))?;
        }
        tx.commit()
            .await
            .map_err(|err| classify(err, "cannot commit lock release"))?;
        debug!(name = %lock.name(), "lock released");
        lock.mark_released();
        lock.cancel();
        Ok(())
    }

    async fn store_heartbeat(&self, lock: &Lock) -> Result<(), Error> {
        let _op = lock.op_lock().lock().await;
        match tokio::time::timeout(lock.lease_duration(), self.store_heartbeat_tx(lock)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                context: "heartbeat",
            }),
        }
    }

    async fn store_heartbeat_tx(&self, lock: &Lock) -> Result<(), Error> {
        let table = &self.inner.table_name;
        let mut conn = self.inner.pool.get().await?;
        let client: &mut tokio_postgres::Client = &mut conn;
        let tx = client
            .build_transaction()
            .isolation_level(IsolationLevel::Serializable)
            .start()
            .await
            .map_err(|err| classify(err, "cannot create transaction for heartbeat"))?;
        let new_rvn = self.next_rvn(&tx).await?;
        let refresh = format!(
            "UPDATE {table}\n\
             SET \"record_version_number\" = $3\n\
             WHERE \"name\" = $1 AND \"record_version_number\" = $2"
        );
        let claimant_rvn = lock.record_version_number();
        let affected = tx
            .execute(&refresh, &[&lock.name(), &claimant_rvn, &new_rvn])
            .await
            .map_err(|err| classify(err, "cannot run query to update the heartbeat"))?;
        if affected == 0 {
            lock.mark_released();
            return Err(Error::AlreadyReleased);
        }
        tx.commit()
            .await
            .map_err(|err| classify(err, "cannot commit lock heartbeat"))?;
        lock.set_record_version_number(new_rvn);
        Ok(())
    }

    async fn get_lock_data(&self, name: &str) -> Result<Vec<u8>, Error> {
        match tokio::time::timeout(self.inner.lease_duration, self.get_lock_data_query(name)).await
        {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                context: "lock data read",
            }),
        }
    }

    async fn get_lock_data_query(&self, name: &str) -> Result<Vec<u8>, Error> {
        let table = &self.inner.table_name;
        let conn = self.inner.pool.get().await?;
        let query = format!("SELECT \"data\" FROM {table} WHERE \"name\" = $1 FOR UPDATE");
        let row = conn
            .query_opt(&query, &[&name])
            .await
            .map_err(|err| classify(err, "cannot load the data of this lock"))?;
        match row {
            None => Err(Error::NotFound),
            Some(row) => {
                let data: Option<Vec<u8>> = row
                    .try_get(0)
                    .map_err(|err| classify(err, "cannot load the data of this lock"))?;
                Ok(data.unwrap_or_default())
            }
        }
    }

    async fn next_rvn(&self, tx: &tokio_postgres::Transaction<'_>) -> Result<i64, Error> {
        let query = format!("SELECT nextval('{}_rvn')", self.inner.table_name);
        let row = tx
            .query_one(&query, &[])
            .await
            .map_err(|err| classify(err, "cannot run query to read record version number"))?;
        Ok(row.get(0))
    }

    fn spawn_heartbeat(&self, lock: &Lock) {
        if self.inner.heartbeat_frequency.is_zero() {
            debug!(name = %lock.name(), "heartbeat disabled, lock valid for one lease");
            return;
        }
        let client = self.clone();
        let lock = lock.clone();
        tokio::spawn(async move {
            client.heartbeat_loop(lock).await;
        });
    }

    async fn heartbeat_loop(&self, lock: Lock) {
        let frequency = self.inner.heartbeat_frequency;
        loop {
            tokio::select! {
                _ = lock.cancelled() => {
                    debug!(name = %lock.name(), "heartbeat stopped");
                    return;
                }
                _ = tokio::time::sleep(frequency) => {
                    if let Err(err) = self.send_heartbeat(&lock).await {
                        warn!(
                            name = %lock.name(),
                            error = %err,
                            "heartbeat missed, lock is no longer defensible"
                        );
                        lock.cancel();
                        return;
                    }
                }
            }
        }
    }

    // With heartbeats disabled, a scoped execution stops being
    // defensible one lease after acquisition.
    fn spawn_lease_watchdog(&self, lock: &Lock) {
        let lock = lock.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = lock.cancelled() => {}
                _ = tokio::time::sleep(lock.lease_duration()) => {
                    debug!(
                        name = %lock.name(),
                        "lease elapsed without heartbeats, cancelling scoped work"
                    );
                    lock.cancel();
                }
            }
        });
    }
}

struct CancelOnDrop(Lock);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}
