//! Per-namespace single-leader election over the KV backend.
//!
//! Each election runs on a session: a lease with TTL equal to the
//! configured leader period, kept alive by a background task. Candidates
//! write one key each under the session's lease; the candidate whose key
//! has the lowest create revision is the leader, which gives strict FIFO
//! ordering among campaigners. Losing the session (missed keep-alives,
//! process death) deletes the candidate key and so resigns automatically.
//!
//! The winner's [`Election::guard`] turns leadership into a transactional
//! precondition: any store write carrying the guard fails once the
//! leader key has changed.

use crate::config::ElectionConfig;
use crate::error::{ElectionError, StoreError};
use crate::kv::{Compare, KvStore, Lease, Op, Txn, WatchEventKind};
use crate::store::{keys, GuardFunc};
use async_trait::async_trait;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Creates per-namespace elections.
#[async_trait]
pub trait Elector: Send + Sync + 'static {
    /// Create an election session for a namespace. The session TTL is the
    /// configured leader period; session expiry means automatic
    /// resignation.
    async fn create_election(&self, namespace: &str) -> Result<Election, ElectionError>;
}

/// KV-backed elector.
pub struct KvElector {
    kv: Arc<dyn KvStore>,
    prefix: String,
    leader_period: Duration,
}

impl KvElector {
    pub fn new(kv: Arc<dyn KvStore>, prefix: impl Into<String>, config: &ElectionConfig) -> Self {
        Self {
            kv,
            prefix: prefix.into(),
            leader_period: config.leader_period,
        }
    }
}

#[async_trait]
impl Elector for KvElector {
    async fn create_election(&self, namespace: &str) -> Result<Election, ElectionError> {
        let session = Session::new(self.kv.clone(), self.leader_period).await?;
        let election_prefix = format!("{}/", keys::leader_prefix(&self.prefix, namespace));
        let key = format!("{election_prefix}{:x}", session.lease_id());
        Ok(Election {
            kv: self.kv.clone(),
            session,
            election_prefix,
            key,
            leader_revision: AtomicI64::new(0),
            lost: CancellationToken::new(),
        })
    }
}

/// A session: a lease kept alive by a background task until closed.
struct Session {
    kv: Arc<dyn KvStore>,
    lease: Lease,
    keepalive_stop: CancellationToken,
}

impl Session {
    async fn new(kv: Arc<dyn KvStore>, ttl: Duration) -> Result<Self, ElectionError> {
        let lease = kv.lease_grant(ttl).await?;
        let keepalive_stop = CancellationToken::new();

        let keepalive_kv = kv.clone();
        let lease_id = lease.id;
        let expired = lease.expired.clone();
        let stop = keepalive_stop.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(ttl / 3);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = expired.cancelled() => return,
                    _ = tick.tick() => {
                        if let Err(e) = keepalive_kv.lease_keep_alive(lease_id).await {
                            warn!(lease = lease_id, error = %e, "session keep-alive failed");
                            return;
                        }
                    }
                }
            }
        });

        Ok(Self {
            kv,
            lease,
            keepalive_stop,
        })
    }

    fn lease_id(&self) -> i64 {
        self.lease.id
    }

    fn done(&self) -> CancellationToken {
        self.lease.expired.clone()
    }

    async fn close(&self) {
        self.keepalive_stop.cancel();
        if !self.lease.expired.is_cancelled() {
            let _ = self.kv.lease_revoke(self.lease.id).await;
        }
    }
}

/// One candidacy in a namespace's election.
pub struct Election {
    kv: Arc<dyn KvStore>,
    session: Session,
    election_prefix: String,
    key: String,
    /// Revision of our candidate key at the moment we won; 0 until then.
    leader_revision: AtomicI64,
    /// Fires when leadership is lost: session expired, resigned, or the
    /// candidate key disappeared.
    lost: CancellationToken,
}

impl Election {
    /// Campaign until this caller becomes leader. FIFO: earlier
    /// campaigners win first. Returns an error when the session ends
    /// before leadership is acquired.
    pub async fn campaign(&self, host: &str) -> Result<(), ElectionError> {
        // Write our candidate key once, attached to the session lease.
        let resp = self
            .kv
            .commit(
                Txn::new()
                    .when(Compare::mod_revision(&self.key, 0))
                    .and_then(Op::put_with_lease(&self.key, host, self.session.lease_id())),
            )
            .await?;
        debug!(key = %self.key, created = resp.succeeded, "entered election");

        let mut watch = self.kv.watch_prefix(&self.election_prefix).await?;
        loop {
            let range = self.kv.range(&self.election_prefix).await?;
            let ours = range
                .kvs
                .iter()
                .find(|kv| kv.key == self.key)
                .ok_or(ElectionError::SessionExpired)?;
            let blocked = range
                .kvs
                .iter()
                .any(|kv| kv.create_revision < ours.create_revision);

            if !blocked {
                self.leader_revision.store(ours.mod_revision, Ordering::SeqCst);
                self.spawn_leadership_watch();
                info!(key = %self.key, revision = ours.mod_revision, host, "won election");
                return Ok(());
            }

            let done = self.session.done();
            tokio::select! {
                _ = done.cancelled() => return Err(ElectionError::SessionExpired),
                maybe = watch.recv() => {
                    if maybe.is_none() {
                        return Err(ElectionError::CampaignFailed(
                            "election watch closed".to_string(),
                        ));
                    }
                    // A predecessor changed; re-check the ordering.
                }
            }
        }
    }

    /// Arm the `lost` signal: it fires on session expiry or when our
    /// candidate key is deleted (resignation included).
    fn spawn_leadership_watch(&self) {
        let kv = self.kv.clone();
        let key = self.key.clone();
        let done = self.session.done();
        let lost = self.lost.clone();
        tokio::spawn(async move {
            let mut watch = match kv.watch_prefix(&key).await {
                Ok(watch) => watch,
                Err(_) => {
                    lost.cancel();
                    return;
                }
            };
            loop {
                tokio::select! {
                    _ = done.cancelled() => {
                        lost.cancel();
                        return;
                    }
                    maybe = watch.recv() => {
                        let Some(batch) = maybe else {
                            lost.cancel();
                            return;
                        };
                        if batch
                            .events
                            .iter()
                            .any(|e| e.kind == WatchEventKind::Delete && e.key == key)
                        {
                            lost.cancel();
                            return;
                        }
                    }
                }
            }
        });
    }

    /// Yield leadership immediately by deleting the candidate key. The
    /// session stays open; a later `campaign` re-enters the queue.
    pub async fn resign(&self) -> Result<(), ElectionError> {
        self.leader_revision.store(0, Ordering::SeqCst);
        self.kv
            .commit(Txn::new().and_then(Op::delete(&self.key)))
            .await?;
        info!(key = %self.key, "resigned leadership");
        Ok(())
    }

    /// Close the session, revoking the lease and with it the candidate
    /// key.
    pub async fn cleanup(&self) {
        self.session.close().await;
    }

    /// Completion signal that fires when leadership is lost.
    pub fn done(&self) -> CancellationToken {
        self.lost.clone()
    }

    /// A guard that makes a transaction conditional on "the leader record
    /// is still the one this guard was issued to".
    ///
    /// Two guards from different winners can never both commit against
    /// the same namespace: each compares the key revision captured at its
    /// own win, and any change of leadership moves it.
    pub fn guard(&self) -> GuardFunc {
        let key = self.key.clone();
        let revision = self.leader_revision.load(Ordering::SeqCst);
        Arc::new(move |txn: Txn| {
            if revision == 0 {
                return Err(StoreError::VersionConflict(
                    "guard issued before leadership was won".to_string(),
                ));
            }
            Ok(txn.when(Compare::mod_revision(&key, revision)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use tokio::time::timeout;

    fn elector(kv: Arc<MemoryKv>, leader_period: Duration) -> KvElector {
        KvElector::new(
            kv,
            "/test",
            &ElectionConfig { leader_period },
        )
    }

    #[tokio::test]
    async fn test_single_candidate_wins() {
        let kv = Arc::new(MemoryKv::new());
        let elector = elector(kv.clone(), Duration::from_secs(5));

        let election = elector.create_election("ns").await.unwrap();
        timeout(Duration::from_secs(1), election.campaign("host-a"))
            .await
            .expect("campaign should finish")
            .unwrap();

        election.cleanup().await;
    }

    #[tokio::test]
    async fn test_fifo_ordering_and_handover() {
        let kv = Arc::new(MemoryKv::new());
        let elector = elector(kv.clone(), Duration::from_secs(5));

        let first = elector.create_election("ns").await.unwrap();
        first.campaign("host-a").await.unwrap();

        let second = Arc::new(elector.create_election("ns").await.unwrap());
        let waiter = second.clone();
        let handle = tokio::spawn(async move { waiter.campaign("host-b").await });

        // Second campaigner stays blocked while the first holds the key.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!handle.is_finished());

        first.resign().await.unwrap();
        timeout(Duration::from_secs(1), handle)
            .await
            .expect("second campaign should win after resignation")
            .unwrap()
            .unwrap();

        first.cleanup().await;
        second.cleanup().await;
    }

    #[tokio::test]
    async fn test_done_fires_on_session_end() {
        let kv = Arc::new(MemoryKv::new());
        let elector = elector(kv.clone(), Duration::from_millis(500));

        let election = elector.create_election("ns").await.unwrap();
        election.campaign("host-a").await.unwrap();
        let done = election.done();
        assert!(!done.is_cancelled());

        // Closing the session revokes the lease; leadership is lost.
        election.cleanup().await;
        timeout(Duration::from_secs(1), done.cancelled())
            .await
            .expect("done should fire after cleanup");
    }

    #[tokio::test]
    async fn test_stale_guard_fails_after_leadership_change() {
        let kv = Arc::new(MemoryKv::new());
        let elector = elector(kv.clone(), Duration::from_secs(5));

        let a = elector.create_election("ns").await.unwrap();
        a.campaign("host-a").await.unwrap();
        let guard_a = a.guard();

        a.resign().await.unwrap();

        let b = elector.create_election("ns").await.unwrap();
        b.campaign("host-b").await.unwrap();

        // Guard A's precondition no longer holds.
        let txn = guard_a(Txn::new().and_then(Op::put("/test/x", "1"))).unwrap();
        let resp = kv.commit(txn).await.unwrap();
        assert!(!resp.succeeded);

        // Guard B commits.
        let txn = b.guard()(Txn::new().and_then(Op::put("/test/x", "1"))).unwrap();
        let resp = kv.commit(txn).await.unwrap();
        assert!(resp.succeeded);

        a.cleanup().await;
        b.cleanup().await;
    }

    #[tokio::test]
    async fn test_guard_before_win_is_rejected() {
        let kv = Arc::new(MemoryKv::new());
        let elector = elector(kv, Duration::from_secs(5));

        let election = elector.create_election("ns").await.unwrap();
        let guard = election.guard();
        assert!(matches!(
            guard(Txn::new()),
            Err(StoreError::VersionConflict(_))
        ));
        election.cleanup().await;
    }
}
