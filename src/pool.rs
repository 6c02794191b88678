//! Connection Pool
//!
//! Keeps exactly one live session per credentialed linked account.
//!
//! The pool is a single-owner registry: only its own run loop mutates the
//! live set. Each pass reads the account directory, opens what is missing,
//! closes what is gone, reopens connections whose tasks died or whose
//! credential changed, and pushes fresh chat assignments to every live
//! connection. Passes run on startup, on a fixed interval, and whenever a
//! `PoolHandle` signals a directory change.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::autopost::AutopostEngine;
use crate::directory::{orphaned_assignments, AccountDirectory, AssignmentDirectory, AssignmentSnapshot};
use crate::engine::{BoundSession, EngineContext};
use crate::model::{AccountId, ChatGroupAssignment, ConnectionKey, Credential, LinkedAccount};
use crate::reply::ReplyEngine;
use crate::transport::{Connector, TransportError};

/// A live session plus the tasks bound to it
struct LiveConnection {
    binding: BoundSession,
    /// Account id as listed in the directory when opened (may be stale)
    listed_as: AccountId,
    credential: Credential,
    assignments: watch::Sender<Vec<ChatGroupAssignment>>,
    cancel: CancellationToken,
    listener: JoinHandle<()>,
    autopost: JoinHandle<()>,
}

impl LiveConnection {
    fn is_running(&self) -> bool {
        !self.listener.is_finished() && !self.autopost.is_finished()
    }

    fn answers_to(&self, key: ConnectionKey) -> bool {
        self.binding.key == key || (self.binding.key.owner == key.owner && self.listed_as == key.account)
    }
}

/// What one reconcile pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub opened: Vec<ConnectionKey>,
    pub closed: Vec<ConnectionKey>,
    /// Accounts that could not be connected this pass, with the reason
    pub skipped: Vec<(ConnectionKey, String)>,
    pub live: usize,
}

/// Cloneable control surface for a running pool
#[derive(Clone)]
pub struct PoolHandle {
    notify: Arc<Notify>,
    shutdown: CancellationToken,
    live_keys: watch::Receiver<BTreeSet<ConnectionKey>>,
}

impl PoolHandle {
    /// Ask for a reconcile pass as soon as possible
    pub fn notify_changed(&self) {
        self.notify.notify_one();
    }

    /// Stop every connection and the pool loop
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Keys live after the most recent pass
    pub fn live_keys(&self) -> BTreeSet<ConnectionKey> {
        self.live_keys.borrow().clone()
    }

    /// Receiver updated after every pass
    pub fn subscribe(&self) -> watch::Receiver<BTreeSet<ConnectionKey>> {
        self.live_keys.clone()
    }
}

pub struct ConnectionPool {
    accounts: Arc<dyn AccountDirectory>,
    assignments: Arc<dyn AssignmentDirectory>,
    connector: Arc<dyn Connector>,
    ctx: Arc<EngineContext>,
    reply: Arc<ReplyEngine>,
    autopost: Arc<AutopostEngine>,
    live: HashMap<ConnectionKey, LiveConnection>,
    notify: Arc<Notify>,
    shutdown: CancellationToken,
    live_keys: watch::Sender<BTreeSet<ConnectionKey>>,
}

impl ConnectionPool {
    pub fn new(
        accounts: Arc<dyn AccountDirectory>,
        assignments: Arc<dyn AssignmentDirectory>,
        connector: Arc<dyn Connector>,
        ctx: Arc<EngineContext>,
    ) -> Self {
        let (live_keys, _) = watch::channel(BTreeSet::new());
        Self {
            accounts,
            assignments,
            connector,
            reply: Arc::new(ReplyEngine::new(Arc::clone(&ctx))),
            autopost: Arc::new(AutopostEngine::new(Arc::clone(&ctx))),
            ctx,
            live: HashMap::new(),
            notify: Arc::new(Notify::new()),
            shutdown: CancellationToken::new(),
            live_keys,
        }
    }

    pub fn handle(&self) -> PoolHandle {
        PoolHandle {
            notify: Arc::clone(&self.notify),
            shutdown: self.shutdown.clone(),
            live_keys: self.live_keys.subscribe(),
        }
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    pub fn live_keys(&self) -> BTreeSet<ConnectionKey> {
        self.live.keys().copied().collect()
    }

    pub fn is_live(&self, key: ConnectionKey) -> bool {
        self.live.contains_key(&key)
    }

    /// Reconcile on startup, every poll interval and on change notification
    /// until shut down, then close everything.
    pub async fn run(mut self) {
        info!(
            "Connection pool started (poll every {} seconds)",
            self.ctx.settings.poll_interval.as_secs()
        );
        let notify = Arc::clone(&self.notify);
        let shutdown = self.shutdown.clone();
        let mut ticker = tokio::time::interval(self.ctx.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
                _ = notify.notified() => debug!("Directory change notified"),
            }
            self.reconcile().await;
        }

        self.close_all().await;
        info!("Connection pool stopped");
    }

    /// One reconciliation pass
    pub async fn reconcile(&mut self) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        let accounts = match self.accounts.load_accounts().await {
            Ok(accounts) => accounts,
            Err(e) => {
                error!("Failed to read account directory, keeping current connections: {}", e);
                report.live = self.live.len();
                return report;
            }
        };
        let assignments = match self.assignments.load_assignments().await {
            Ok(assignments) => Some(assignments),
            Err(e) => {
                error!("Failed to read chat assignments: {}", e);
                None
            }
        };

        if let Some(assignments) = &assignments {
            for (owner, account) in orphaned_assignments(&accounts, assignments) {
                warn!(
                    "Chat assignments reference account {} which owner {} has not linked, ignoring",
                    account, owner
                );
            }
        }

        let mut desired: BTreeMap<ConnectionKey, LinkedAccount> = BTreeMap::new();
        for (owner, linked) in accounts {
            for account in linked {
                let key = ConnectionKey::new(owner, account.account_id);
                if account.credential.is_empty() {
                    debug!("[{}] No stored credential, not connecting", key);
                    continue;
                }
                desired.insert(key, account);
            }
        }

        // Close what is gone, changed or dead
        let stale: Vec<ConnectionKey> = self
            .live
            .iter()
            .filter(|(_, conn)| {
                let listed = ConnectionKey::new(conn.binding.key.owner, conn.listed_as);
                let wanted = desired
                    .get(&conn.binding.key)
                    .or_else(|| desired.get(&listed));
                match wanted {
                    None => true,
                    Some(account) => account.credential != conn.credential || !conn.is_running(),
                }
            })
            .map(|(key, _)| *key)
            .collect();
        for key in stale {
            self.close(key).await;
            report.closed.push(key);
        }

        // Open what is missing
        for (key, account) in &desired {
            if self.live.values().any(|conn| conn.answers_to(*key)) {
                continue;
            }
            match self.open(*key, account, assignments.as_ref()).await {
                Ok(opened) => report.opened.push(opened),
                Err(e) => {
                    warn!("[{}] Skipping account this pass: {}", key, e);
                    report.skipped.push((*key, e.to_string()));
                }
            }
        }

        // Push current assignments to every live connection
        if let Some(assignments) = &assignments {
            for conn in self.live.values() {
                let current = lookup_assignments(assignments, conn.binding.key, conn.listed_as);
                conn.assignments.send_if_modified(|existing| {
                    if *existing == current {
                        false
                    } else {
                        *existing = current;
                        true
                    }
                });
            }
        }

        let now = self.ctx.now();
        self.ctx.tracker.cleanup(now);
        self.live_keys.send_replace(self.live_keys());
        report.live = self.live.len();

        let stats = self.ctx.stats.snapshot();
        info!(
            "Reconciled: {} live, {} opened, {} closed, {} skipped | replies={} autoposts={} rejected={} rate_limited={} failed={}",
            report.live,
            report.opened.len(),
            report.closed.len(),
            report.skipped.len(),
            stats.replies_sent,
            stats.autoposts_sent,
            stats.rejections,
            stats.rate_limit_waits,
            stats.failures
        );
        report
    }

    /// Connect, verify, correct the stored id and start the tasks.
    /// Returns the canonical key.
    async fn open(
        &mut self,
        key: ConnectionKey,
        account: &LinkedAccount,
        assignments: Option<&AssignmentSnapshot>,
    ) -> Result<ConnectionKey, TransportError> {
        let session = self.connector.connect(&account.credential).await?;

        let profile = match session.authorized_profile().await {
            Ok(Some(profile)) => profile,
            Ok(None) => {
                session.disconnect().await;
                return Err(TransportError::Unauthorized("session is not authorized".to_string()));
            }
            Err(e) => {
                session.disconnect().await;
                return Err(e);
            }
        };

        let canonical = ConnectionKey::new(key.owner, profile.id);
        if canonical != key {
            warn!(
                "[{}] Directory lists account id {} but session is {}, correcting",
                key, key.account, profile.id
            );
            if let Err(e) = self
                .accounts
                .correct_account_id(key.owner, key.account, profile.id)
                .await
            {
                error!("[{}] Failed to correct account id: {}", key, e);
            }
            if self.live.contains_key(&canonical) {
                session.disconnect().await;
                return Err(TransportError::Transient(format!(
                    "account {} is already connected",
                    profile.id
                )));
            }
        }

        let updates = match session.subscribe().await {
            Ok(updates) => updates,
            Err(e) => {
                session.disconnect().await;
                return Err(e);
            }
        };

        let current = assignments
            .map(|snapshot| lookup_assignments(snapshot, canonical, key.account))
            .unwrap_or_default();
        let (assignments_tx, assignments_rx) = watch::channel(current);

        let binding = BoundSession::new(canonical, self.ctx.now(), session, assignments_rx);
        let cancel = self.shutdown.child_token();
        let listener = tokio::spawn(Arc::clone(&self.reply).listen(
            binding.clone(),
            updates,
            cancel.child_token(),
        ));
        let autopost = tokio::spawn(Arc::clone(&self.autopost).run(binding.clone(), cancel.child_token()));

        info!(
            "[{}] Connected as {} ({} chats assigned)",
            canonical,
            profile.display_name(),
            binding.assignments().len()
        );
        self.live.insert(
            canonical,
            LiveConnection {
                binding,
                listed_as: key.account,
                credential: account.credential.clone(),
                assignments: assignments_tx,
                cancel,
                listener,
                autopost,
            },
        );
        Ok(canonical)
    }

    /// Cancel a connection's tasks, close its session and drop its activity
    async fn close(&mut self, key: ConnectionKey) {
        let Some(conn) = self.live.remove(&key) else {
            return;
        };
        conn.cancel.cancel();
        conn.binding.session.disconnect().await;
        self.ctx.tracker.forget(key);
        info!("[{}] Disconnected", key);
    }

    async fn close_all(&mut self) {
        let keys: Vec<ConnectionKey> = self.live.keys().copied().collect();
        for key in keys {
            self.close(key).await;
        }
        self.live_keys.send_replace(BTreeSet::new());
    }
}

fn lookup_assignments(
    snapshot: &AssignmentSnapshot,
    key: ConnectionKey,
    listed_as: AccountId,
) -> Vec<ChatGroupAssignment> {
    snapshot
        .get(&key.owner)
        .and_then(|by_account| by_account.get(&key.account).or_else(|| by_account.get(&listed_as)))
        .cloned()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::EngineSettings;
    use crate::directory::MemoryDirectory;
    use crate::generator::CannedGenerator;
    use crate::membership::StaticMembership;
    use crate::transport::MockNetwork;
    use tokio_test::{assert_pending, assert_ready_ok, task};

    struct Fixture {
        network: Arc<MockNetwork>,
        directory: Arc<MemoryDirectory>,
        pool: ConnectionPool,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::starting_now());
        let network = MockNetwork::with_clock(clock.clone());
        let directory = Arc::new(MemoryDirectory::new());
        let ctx = Arc::new(EngineContext::new(
            Arc::new(CannedGenerator),
            Arc::new(StaticMembership::none()),
            clock,
            EngineSettings::default(),
        ));
        let pool = ConnectionPool::new(directory.clone(), directory.clone(), network.connector(), ctx);
        Fixture {
            network,
            directory,
            pool,
        }
    }

    fn account(id: AccountId, cred: &str) -> LinkedAccount {
        LinkedAccount::new(id, Credential::new(cred), "Ann")
    }

    #[tokio::test]
    async fn test_opens_one_connection_per_account() {
        let mut f = fixture();
        f.network.register_account("a", 10, "A");
        f.network.register_account("b", 20, "B");
        f.directory.seed_account(1, account(10, "a"));
        f.directory.seed_account(2, account(20, "b"));

        let report = f.pool.reconcile().await;
        assert_eq!(report.opened.len(), 2);
        assert_eq!(report.live, 2);

        let report = f.pool.reconcile().await;
        assert!(report.opened.is_empty());
        assert!(report.closed.is_empty());
        assert_eq!(f.network.connects(), 2);
        assert_eq!(f.network.subscribers(), 2);
    }

    #[tokio::test]
    async fn test_subscribers_woken_only_by_a_pass() {
        let mut f = fixture();
        f.network.register_account("a", 10, "A");
        f.directory.seed_account(1, account(10, "a"));

        let mut live = f.pool.handle().subscribe();
        let mut changed = task::spawn(async move {
            live.changed().await?;
            let keys = live.borrow_and_update().clone();
            Ok::<_, watch::error::RecvError>(keys)
        });
        assert_pending!(changed.poll());

        // A directory edit alone publishes nothing
        f.directory.seed_account(2, account(20, "b"));
        assert!(!changed.is_woken());
        assert_pending!(changed.poll());

        f.pool.reconcile().await;
        assert!(changed.is_woken());
        let keys = assert_ready_ok!(changed.poll());
        assert_eq!(keys.into_iter().collect::<Vec<_>>(), vec![ConnectionKey::new(1, 10)]);
    }

    #[tokio::test]
    async fn test_bad_credential_is_skipped_without_affecting_others() {
        let mut f = fixture();
        f.network.register_account("good", 10, "A");
        f.directory.seed_account(1, account(10, "good"));
        f.directory.seed_account(1, account(11, "revoked"));
        f.directory.seed_account(2, account(20, ""));

        let report = f.pool.reconcile().await;
        assert_eq!(report.opened, vec![ConnectionKey::new(1, 10)]);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].0, ConnectionKey::new(1, 11));

        // Retried next pass once the credential works
        f.network.register_account("revoked", 11, "B");
        let report = f.pool.reconcile().await;
        assert_eq!(report.opened, vec![ConnectionKey::new(1, 11)]);
        assert_eq!(report.live, 2);
    }

    #[tokio::test]
    async fn test_unauthorized_session_is_skipped_and_closed() {
        let mut f = fixture();
        f.network.register_account("a", 10, "A");
        f.network.deauthorize("a");
        f.directory.seed_account(1, account(10, "a"));

        let report = f.pool.reconcile().await;
        assert_eq!(report.live, 0);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(f.network.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_removed_account_is_closed() {
        let mut f = fixture();
        f.network.register_account("a", 10, "A");
        f.directory.seed_account(1, account(10, "a"));
        f.pool.reconcile().await;
        assert_eq!(f.network.open_sessions(), 1);

        f.directory.remove_account(1, 10).await.unwrap();
        let report = f.pool.reconcile().await;
        assert_eq!(report.closed, vec![ConnectionKey::new(1, 10)]);
        assert_eq!(f.network.open_sessions(), 0);
        assert_eq!(f.network.subscribers(), 0);
        assert!(!f.pool.context().tracker.tracks(ConnectionKey::new(1, 10)));
    }

    #[tokio::test]
    async fn test_stale_account_id_is_corrected() {
        let mut f = fixture();
        f.network.register_account("a", 42, "A");
        f.directory.seed_account(1, account(0, "a"));
        f.directory
            .seed_assignment(1, 0, ChatGroupAssignment::new(-5, "g", "terse"));

        let report = f.pool.reconcile().await;
        assert_eq!(report.opened, vec![ConnectionKey::new(1, 42)]);
        assert_eq!(f.directory.load_accounts().await.unwrap()[&1][0].account_id, 42);

        let conn = &f.pool.live[&ConnectionKey::new(1, 42)];
        assert!(conn.binding.assignment(-5).is_some());

        let report = f.pool.reconcile().await;
        assert!(report.opened.is_empty() && report.closed.is_empty());
        assert_eq!(f.network.connects(), 1);
    }

    #[tokio::test]
    async fn test_assignment_changes_reach_live_connection() {
        let mut f = fixture();
        f.network.register_account("a", 10, "A");
        f.directory.seed_account(1, account(10, "a"));
        f.pool.reconcile().await;
        let key = ConnectionKey::new(1, 10);
        assert!(f.pool.live[&key].binding.assignments().is_empty());

        f.directory
            .seed_assignment(1, 10, ChatGroupAssignment::new(-5, "g", "terse"));
        f.pool.reconcile().await;
        assert_eq!(f.pool.live[&key].binding.assignment(-5).unwrap().persona, "terse");
    }

    #[tokio::test]
    async fn test_changed_credential_reopens() {
        let mut f = fixture();
        f.network.register_account("old", 10, "A");
        f.network.register_account("new", 10, "A");
        f.directory.seed_account(1, account(10, "old"));
        f.pool.reconcile().await;

        f.directory.remove_account(1, 10).await.unwrap();
        f.directory.seed_account(1, account(10, "new"));
        let report = f.pool.reconcile().await;
        assert_eq!(report.closed, vec![ConnectionKey::new(1, 10)]);
        assert_eq!(report.opened, vec![ConnectionKey::new(1, 10)]);
        assert_eq!(f.network.open_sessions(), 1);
    }

    #[tokio::test]
    async fn test_dead_listener_is_reopened() {
        let mut f = fixture();
        f.network.register_account("a", 10, "A");
        f.directory.seed_account(1, account(10, "a"));
        f.pool.reconcile().await;

        // Session drops underneath the listener
        let key = ConnectionKey::new(1, 10);
        f.pool.live[&key].binding.session.disconnect().await;
        while !f.pool.live[&key].listener.is_finished() {
            tokio::task::yield_now().await;
        }

        let report = f.pool.reconcile().await;
        assert_eq!(report.closed, vec![key]);
        assert_eq!(report.opened, vec![key]);
        assert_eq!(f.network.connects(), 2);
    }

    #[tokio::test]
    async fn test_run_reconciles_on_notify_and_shuts_down() {
        let f = fixture();
        f.network.register_account("a", 10, "A");
        let handle = f.pool.handle();
        let mut live = handle.subscribe();
        let task = tokio::spawn(f.pool.run());

        live.changed().await.unwrap();
        assert!(handle.live_keys().is_empty());

        f.directory.seed_account(1, account(10, "a"));
        handle.notify_changed();
        live.changed().await.unwrap();
        assert_eq!(handle.live_keys().len(), 1);

        handle.shutdown();
        task.await.unwrap();
        assert_eq!(f.network.open_sessions(), 0);
    }
}
