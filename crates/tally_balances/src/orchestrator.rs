//! Fans `watch` requests out to balance modules and folds
//! their updates into published snapshots.
//!
//! Identical (address, token) pairs requested by overlapping `watch` calls
//! share one module subscription. Each pair is reference counted; the module
//! is only unsubscribed when the last interested caller cancels, and its
//! record leaves the collection at the same time.
//!
//! Transport trouble reported by a module is held back for a grace period
//! (`stale_after`) measured from the pair's last good read. A record only
//! turns `stale` once that period has run out without a fresh value; a pair
//! that never produced one gets an `error` record instead.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tally_core::{TokenRef, Unsubscribe};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::collection::BalanceCollection;
use crate::error::BalanceError;
use crate::modules::{ModuleContext, ModuleRegistry, ModuleUpdate, UpdateSink};
use crate::record::{Amounts, BalanceKey, BalanceRecord, BalanceStatus, check_address};

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(100);

/// One deduplicated module subscription.
struct Triple {
    refs: usize,
    /// Distinguishes this subscription from an earlier one for the same key,
    /// so that late updates from a cancelled module are ignored.
    generation: u64,
    token: TokenRef,
    address: String,
    watched_at: Instant,
    last_ok: Option<Instant>,
    /// Set by the first transport failure after a good read.
    unreachable_since: Option<Instant>,
    unsubscribe: Unsubscribe,
}

impl Triple {
    /// Whether `grace` has run out since the last good read (or since the
    /// watch began, if there was none).
    fn overdue(&self, now: Instant, grace: Duration) -> bool {
        now.duration_since(self.last_ok.unwrap_or(self.watched_at)) >= grace
    }
}

struct State {
    collection: Arc<BalanceCollection>,
    triples: HashMap<BalanceKey, Triple>,
}

struct Inner {
    modules: ModuleRegistry,
    ctx: ModuleContext,
    state: Mutex<State>,
    snapshots: watch::Sender<Arc<BalanceCollection>>,
    updates: broadcast::Sender<BalanceRecord>,
    next_generation: AtomicU64,
    stale_after: Duration,
}

/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("active_subscriptions", &self.active_subscriptions())
            .finish()
    }
}

impl Orchestrator {
    /// `update_capacity` bounds the per-record broadcast channel; slow
    /// receivers lag rather than block publishing. `stale_after` is the
    /// grace period for unreachable sources.
    pub fn new(
        modules: ModuleRegistry,
        ctx: ModuleContext,
        update_capacity: usize,
        stale_after: Duration,
    ) -> Self {
        let initial = Arc::new(BalanceCollection::new());
        let (snapshots, _) = watch::channel(Arc::clone(&initial));
        let (updates, _) = broadcast::channel(update_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                modules,
                ctx,
                state: Mutex::new(State {
                    collection: initial,
                    triples: HashMap::new(),
                }),
                snapshots,
                updates,
                next_generation: AtomicU64::new(1),
                stale_after,
            }),
        }
    }

    pub fn context(&self) -> &ModuleContext {
        &self.inner.ctx
    }

    /// Add restored records with status `cached`. Keys already present are
    /// left alone.
    pub fn seed(&self, cached: &BalanceCollection) {
        let mut state = self.inner.state.lock();
        let fresh: Vec<BalanceRecord> = cached
            .iter()
            .filter(|r| !state.collection.contains(&r.key))
            .map(|r| BalanceRecord {
                status: BalanceStatus::Cached,
                ..r.clone()
            })
            .collect();
        if !fresh.is_empty() {
            self.inner.publish(&mut state, fresh);
        }
    }

    /// Watch every address for every token. Tokens are validated up front;
    /// addresses that do not fit a token's chain family are skipped.
    pub fn watch(&self, addresses: &[String], tokens: &[TokenRef]) -> Result<Unsubscribe, BalanceError> {
        for token in tokens {
            token.validate()?;
            self.inner.modules.module_for(token.kind)?;
        }

        let mut keys = Vec::with_capacity(addresses.len() * tokens.len());
        for token in tokens {
            for address in addresses {
                if let Err(e) = check_address(&token.chain, address) {
                    warn!(token = %token.id, address = %address, "Skipping address: {e}");
                    continue;
                }
                keys.push(self.inner.retain(token, address));
            }
        }
        info!(pairs = keys.len(), "Watching balances");

        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        Ok(Unsubscribe::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.release(&keys);
            }
        }))
    }

    pub fn snapshot(&self) -> Arc<BalanceCollection> {
        Arc::clone(&self.inner.state.lock().collection)
    }

    /// Latest snapshot, replaced on every change.
    pub fn subscribe_snapshots(&self) -> watch::Receiver<Arc<BalanceCollection>> {
        self.inner.snapshots.subscribe()
    }

    /// Every changed record, in publish order.
    pub fn subscribe_updates(&self) -> broadcast::Receiver<BalanceRecord> {
        self.inner.updates.subscribe()
    }

    /// Distinct (address, token) pairs with a live module subscription.
    pub fn active_subscriptions(&self) -> usize {
        self.inner.state.lock().triples.len()
    }

    /// Callers currently holding `key`.
    pub fn watchers(&self, key: &BalanceKey) -> usize {
        self.inner.state.lock().triples.get(key).map_or(0, |t| t.refs)
    }

    /// Age watched pairs that have gone `older_than` without a good read:
    /// `cached` records and `live` records whose source is unreachable turn
    /// `stale`, and pairs with no record at all get an `error` record.
    /// Returns how many records changed.
    pub fn mark_stale(&self, older_than: Duration) -> usize {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        let now = Instant::now();
        let mut due = Vec::new();
        for (key, triple) in &state.triples {
            if !triple.overdue(now, older_than) {
                continue;
            }
            match state.collection.get(key) {
                Some(r) if r.status == BalanceStatus::Cached => due.push(r.with_status(BalanceStatus::Stale)),
                Some(r) if r.status == BalanceStatus::Live && triple.unreachable_since.is_some() => {
                    due.push(r.with_status(BalanceStatus::Stale))
                }
                Some(_) => {}
                None => due.push(BalanceRecord::new(
                    &triple.token,
                    &triple.address,
                    Amounts::zero(),
                    no_value(older_than),
                )),
            }
        }
        let count = due.len();
        if count > 0 {
            debug!(count, "Balances aged out");
            self.inner.publish(state, due);
        }
        count
    }

    /// Run [`mark_stale`](Self::mark_stale) with the grace period until the
    /// orchestrator is dropped.
    pub fn spawn_stale_sweep(&self) -> JoinHandle<()> {
        let stale_after = self.inner.stale_after;
        let inner = Arc::downgrade(&self.inner);
        let period = (stale_after / 4).max(MIN_SWEEP_INTERVAL);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let Some(inner) = inner.upgrade() else { break };
                Orchestrator { inner }.mark_stale(stale_after);
            }
        })
    }
}

impl Inner {
    /// Take a reference on the pair, subscribing the module on first use.
    fn retain(self: &Arc<Self>, token: &TokenRef, address: &str) -> BalanceKey {
        let key = BalanceKey::for_token(token, address);
        let generation = {
            let mut state = self.state.lock();
            if let Some(triple) = state.triples.get_mut(&key) {
                triple.refs += 1;
                return key;
            }
            let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
            state.triples.insert(
                key.clone(),
                Triple {
                    refs: 1,
                    generation,
                    token: token.clone(),
                    address: address.to_string(),
                    watched_at: Instant::now(),
                    last_ok: None,
                    unreachable_since: None,
                    unsubscribe: Unsubscribe::noop(),
                },
            );
            generation
        };

        // Modules may report synchronously, so subscribe without the lock.
        let weak = Arc::downgrade(self);
        let sink_key = key.clone();
        let sink: UpdateSink = Arc::new(move |update| {
            if let Some(inner) = weak.upgrade() {
                inner.apply(&sink_key, generation, update);
            }
        });
        let subscribed = self
            .modules
            .module_for(token.kind)
            .and_then(|module| {
                debug!(%key, module = module.name(), "Subscribing");
                module.subscribe(&self.ctx, address, token, sink)
            });

        match subscribed {
            Ok(unsubscribe) => {
                let leftover = {
                    let mut state = self.state.lock();
                    match state.triples.get_mut(&key) {
                        Some(triple) if triple.generation == generation => {
                            triple.unsubscribe = unsubscribe;
                            None
                        }
                        _ => Some(unsubscribe),
                    }
                };
                // Released while subscribing.
                drop(leftover);
            }
            Err(e) => {
                warn!(%key, "Subscribe failed: {e}");
                self.apply(&key, generation, ModuleUpdate::Error(e.to_string()));
            }
        }
        key
    }

    fn release(&self, keys: &[BalanceKey]) {
        let mut cancelled = Vec::new();
        {
            let mut state = self.state.lock();
            let mut evicted = Vec::new();
            for key in keys {
                let Some(triple) = state.triples.get_mut(key) else { continue };
                triple.refs -= 1;
                if triple.refs == 0
                    && let Some(triple) = state.triples.remove(key)
                {
                    cancelled.push(triple.unsubscribe);
                    evicted.push(key.clone());
                }
            }
            if !evicted.is_empty() {
                debug!(count = evicted.len(), "Unsubscribing released balances");
                state.collection = Arc::new(state.collection.remove_where(|r| evicted.contains(&r.key)));
                self.snapshots.send_replace(Arc::clone(&state.collection));
            }
        }
        for unsubscribe in cancelled {
            unsubscribe.cancel();
        }
    }

    fn apply(&self, key: &BalanceKey, generation: u64, update: ModuleUpdate) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(triple) = state.triples.get_mut(key) else {
            debug!(%key, "Dropping update for a released balance");
            return;
        };
        if triple.generation != generation {
            debug!(%key, "Dropping update from a cancelled subscription");
            return;
        }

        let now = Instant::now();
        match update {
            ModuleUpdate::Balance(_) => {
                triple.last_ok = Some(now);
                triple.unreachable_since = None;
            }
            ModuleUpdate::Stale => {
                triple.unreachable_since.get_or_insert(now);
            }
            ModuleUpdate::Error(_) => {}
        }
        let triple = &*triple;

        let existing = state.collection.get(key);
        let record = match update {
            ModuleUpdate::Balance(amounts) => {
                BalanceRecord::new(&triple.token, &triple.address, amounts, BalanceStatus::Live)
            }
            ModuleUpdate::Stale => {
                if !triple.overdue(now, self.stale_after) {
                    debug!(%key, "Source unreachable, holding the last value");
                    return;
                }
                match existing {
                    Some(r) if matches!(r.status, BalanceStatus::Live | BalanceStatus::Cached) => {
                        r.with_status(BalanceStatus::Stale)
                    }
                    Some(_) => return,
                    None => BalanceRecord::new(
                        &triple.token,
                        &triple.address,
                        Amounts::zero(),
                        no_value(self.stale_after),
                    ),
                }
            }
            ModuleUpdate::Error(reason) => {
                warn!(%key, "Balance error: {reason}");
                match existing {
                    Some(r) => r.with_status(BalanceStatus::Error(reason)),
                    None => BalanceRecord::new(
                        &triple.token,
                        &triple.address,
                        Amounts::zero(),
                        BalanceStatus::Error(reason),
                    ),
                }
            }
        };
        if existing.is_some_and(|r| r.same_state(&record)) {
            return;
        }
        self.publish(state, vec![record]);
    }

    /// Swap in a new snapshot holding `records`. Called with the state lock
    /// held so that snapshots go out in order.
    fn publish(&self, state: &mut State, records: Vec<BalanceRecord>) {
        let mut next = (*state.collection).clone();
        for record in &records {
            next = next.upsert(record.clone());
        }
        state.collection = Arc::new(next);
        self.snapshots.send_replace(Arc::clone(&state.collection));
        for record in records {
            let _ = self.updates.send(record);
        }
    }
}

/// Status for a pair that never produced a value within `grace`.
fn no_value(grace: Duration) -> BalanceStatus {
    BalanceStatus::Error(format!("no balance received within {}s", grace.as_secs()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::BalanceModule;
    use primitive_types::U256;
    use tally_core::{ChainRef, ChainRegistry, MemoryHealthStore, TokenKind};
    use tally_network::testing::{MockEvmHttp, MockSubstrateNode};
    use tally_network::{ConnectorConfig, EvmConnector, SubstrateConnector};

    const ALICE: &str = "5GrwvaEF5zXb26Fz9rcQpDWS57CtERHpNehXCPcNoHGKutQY";
    const OWNER: &str = "0xabcdef0123456789abcdef0123456789abcdef01";

    /// Records every subscribe and hands the sink back to the test.
    #[derive(Default)]
    struct Scripted {
        sinks: Mutex<Vec<(String, UpdateSink)>>,
        cancelled: Arc<AtomicU64>,
    }

    impl BalanceModule for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn token_kinds(&self) -> &'static [TokenKind] {
            &TokenKind::ALL
        }

        fn subscribe(
            &self,
            _ctx: &ModuleContext,
            address: &str,
            token: &TokenRef,
            on_update: UpdateSink,
        ) -> Result<Unsubscribe, BalanceError> {
            if token.symbol == "FAIL" {
                return Err(BalanceError::Config("refused".into()));
            }
            self.sinks.lock().push((address.to_string(), on_update));
            let cancelled = Arc::clone(&self.cancelled);
            Ok(Unsubscribe::new(move || {
                cancelled.fetch_add(1, Ordering::SeqCst);
            }))
        }
    }

    fn context() -> ModuleContext {
        let registry = Arc::new(ChainRegistry::new());
        let health = Arc::new(MemoryHealthStore::new());
        let config = ConnectorConfig::default();
        ModuleContext {
            substrate: SubstrateConnector::new(
                Arc::clone(&registry),
                Arc::new(MockSubstrateNode::new()),
                health.clone(),
                config.clone(),
            ),
            evm: EvmConnector::new(registry, Arc::new(MockEvmHttp::new()), health, config),
            evm_poll_interval: Duration::from_secs(1),
        }
    }

    /// No grace period: transport hints apply at once.
    fn setup() -> (Orchestrator, Arc<Scripted>) {
        setup_with_grace(Duration::ZERO)
    }

    fn setup_with_grace(stale_after: Duration) -> (Orchestrator, Arc<Scripted>) {
        let module = Arc::new(Scripted::default());
        let dynamic: Arc<dyn BalanceModule> = module.clone();
        let registry = ModuleRegistry::new(vec![dynamic]).unwrap();
        (Orchestrator::new(registry, context(), 16, stale_after), module)
    }

    fn dot() -> TokenRef {
        TokenRef::substrate_native(&ChainRef::substrate("polkadot", "0x91b1"), "DOT", 10)
    }

    fn eth() -> TokenRef {
        TokenRef::evm_native(&ChainRef::evm(1), "ETH", 18)
    }

    fn free(n: u64) -> ModuleUpdate {
        ModuleUpdate::Balance(Amounts::free_only(U256::from(n)))
    }

    fn sink(module: &Scripted, i: usize) -> UpdateSink {
        Arc::clone(&module.sinks.lock()[i].1)
    }

    #[tokio::test]
    async fn identical_pairs_share_one_subscription() {
        let (orch, module) = setup();
        let a = orch.watch(&[ALICE.into()], &[dot()]).unwrap();
        let b = orch.watch(&[ALICE.into()], &[dot()]).unwrap();
        let key = BalanceKey::for_token(&dot(), ALICE);

        assert_eq!(module.sinks.lock().len(), 1);
        assert_eq!(orch.watchers(&key), 2);

        a.cancel();
        assert_eq!(orch.active_subscriptions(), 1);
        assert_eq!(module.cancelled.load(Ordering::SeqCst), 0);

        b.cancel();
        assert_eq!(orch.active_subscriptions(), 0);
        assert_eq!(module.cancelled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn updates_become_live_records() {
        let (orch, module) = setup();
        let mut snapshots = orch.subscribe_snapshots();
        let mut updates = orch.subscribe_updates();
        let _watch = orch.watch(&[ALICE.into()], &[dot()]).unwrap();

        sink(&module, 0)(free(42));
        snapshots.changed().await.unwrap();
        let snapshot = snapshots.borrow_and_update().clone();
        let record = snapshot.get(&BalanceKey::for_token(&dot(), ALICE)).unwrap();
        assert_eq!(record.status, BalanceStatus::Live);
        assert_eq!(record.amounts.free, U256::from(42u64));
        assert_eq!(updates.recv().await.unwrap().amounts.free, U256::from(42u64));
    }

    #[tokio::test]
    async fn repeated_values_publish_once() {
        let (orch, module) = setup();
        let mut updates = orch.subscribe_updates();
        let _watch = orch.watch(&[ALICE.into()], &[dot()]).unwrap();

        sink(&module, 0)(free(1));
        sink(&module, 0)(free(1));
        sink(&module, 0)(free(2));
        assert_eq!(updates.recv().await.unwrap().amounts.free, U256::from(1u64));
        assert_eq!(updates.recv().await.unwrap().amounts.free, U256::from(2u64));
        assert!(updates.try_recv().is_err());
    }

    #[tokio::test]
    async fn late_updates_after_cancel_are_dropped() {
        let (orch, module) = setup();
        let watch = orch.watch(&[ALICE.into()], &[dot()]).unwrap();
        let late = sink(&module, 0);
        sink(&module, 0)(free(5));
        assert_eq!(orch.snapshot().len(), 1);

        watch.cancel();
        assert!(orch.snapshot().is_empty());
        late(free(6));
        assert!(orch.snapshot().is_empty());

        // A new watch of the same pair ignores the old subscription's sink.
        let _again = orch.watch(&[ALICE.into()], &[dot()]).unwrap();
        late(free(7));
        assert!(orch.snapshot().is_empty());
        sink(&module, 1)(free(8));
        assert_eq!(orch.snapshot().records()[0].amounts.free, U256::from(8u64));
    }

    #[tokio::test]
    async fn stale_keeps_amounts_error_keeps_amounts() {
        let (orch, module) = setup();
        let _watch = orch.watch(&[ALICE.into()], &[dot()]).unwrap();
        let key = BalanceKey::for_token(&dot(), ALICE);

        // Unreachable before any value: nothing to keep, so an error record.
        sink(&module, 0)(ModuleUpdate::Stale);
        let record = orch.snapshot().get(&key).cloned().unwrap();
        assert!(record.status.is_error());
        assert_eq!(record.amounts, Amounts::zero());

        sink(&module, 0)(free(9));
        sink(&module, 0)(ModuleUpdate::Stale);
        let record = orch.snapshot().get(&key).cloned().unwrap();
        assert_eq!(record.status, BalanceStatus::Stale);
        assert_eq!(record.amounts.free, U256::from(9u64));

        sink(&module, 0)(ModuleUpdate::Error("undecodable".into()));
        let record = orch.snapshot().get(&key).cloned().unwrap();
        assert_eq!(record.status, BalanceStatus::Error("undecodable".into()));
        assert_eq!(record.amounts.free, U256::from(9u64));

        sink(&module, 0)(free(10));
        assert_eq!(orch.snapshot().get(&key).unwrap().status, BalanceStatus::Live);
    }

    #[tokio::test]
    async fn family_mismatches_are_skipped() {
        let (orch, module) = setup();
        let _watch = orch
            .watch(&[ALICE.into(), OWNER.into()], &[dot(), eth()])
            .unwrap();
        let addresses: Vec<String> = module.sinks.lock().iter().map(|(a, _)| a.clone()).collect();
        assert_eq!(addresses, vec![ALICE.to_string(), OWNER.to_string()]);
        assert_eq!(orch.active_subscriptions(), 2);
    }

    #[tokio::test]
    async fn network_spellings_of_one_account_share_a_subscription() {
        let (orch, module) = setup();
        let account = tally_codec::ss58::parse_account_id(ALICE).unwrap();
        let on_polkadot = tally_codec::ss58::encode(0, &account).unwrap();
        let _a = orch.watch(&[ALICE.into()], &[dot()]).unwrap();
        let _b = orch.watch(&[on_polkadot], &[dot()]).unwrap();

        assert_eq!(module.sinks.lock().len(), 1);
        assert_eq!(orch.watchers(&BalanceKey::for_token(&dot(), ALICE)), 2);
    }

    #[tokio::test]
    async fn unreachable_source_stays_live_within_grace() {
        let (orch, module) = setup_with_grace(Duration::from_secs(60));
        let mut updates = orch.subscribe_updates();
        let _watch = orch.watch(&[ALICE.into()], &[dot()]).unwrap();
        let key = BalanceKey::for_token(&dot(), ALICE);

        sink(&module, 0)(free(9));
        assert_eq!(updates.recv().await.unwrap().status, BalanceStatus::Live);
        sink(&module, 0)(ModuleUpdate::Stale);
        assert_eq!(orch.snapshot().get(&key).unwrap().status, BalanceStatus::Live);
        assert!(updates.try_recv().is_err());
        assert_eq!(orch.mark_stale(Duration::from_secs(60)), 0);

        // Once the grace period is over the sweep ages it.
        assert_eq!(orch.mark_stale(Duration::ZERO), 1);
        let record = orch.snapshot().get(&key).cloned().unwrap();
        assert_eq!(record.status, BalanceStatus::Stale);
        assert_eq!(record.amounts.free, U256::from(9u64));

        sink(&module, 0)(free(9));
        assert_eq!(orch.snapshot().get(&key).unwrap().status, BalanceStatus::Live);
        assert_eq!(orch.mark_stale(Duration::ZERO), 0);
    }

    #[tokio::test]
    async fn healthy_live_records_are_not_aged() {
        let (orch, module) = setup_with_grace(Duration::from_secs(60));
        let _watch = orch.watch(&[ALICE.into()], &[dot()]).unwrap();
        sink(&module, 0)(free(1));
        assert_eq!(orch.mark_stale(Duration::ZERO), 0);
        assert_eq!(orch.snapshot().records()[0].status, BalanceStatus::Live);
    }

    #[tokio::test]
    async fn silent_pairs_get_an_error_record() {
        let (orch, module) = setup_with_grace(Duration::from_secs(60));
        let _watch = orch.watch(&[ALICE.into()], &[dot()]).unwrap();
        let key = BalanceKey::for_token(&dot(), ALICE);

        sink(&module, 0)(ModuleUpdate::Stale);
        assert!(orch.snapshot().is_empty());
        assert_eq!(orch.mark_stale(Duration::from_secs(60)), 0);
        assert_eq!(orch.mark_stale(Duration::ZERO), 1);
        let record = orch.snapshot().get(&key).cloned().unwrap();
        assert_eq!(record.status, BalanceStatus::Error("no balance received within 0s".into()));
        assert_eq!(record.amounts, Amounts::zero());
        assert_eq!(orch.mark_stale(Duration::ZERO), 0);

        sink(&module, 0)(free(2));
        assert_eq!(orch.snapshot().get(&key).unwrap().status, BalanceStatus::Live);
    }

    #[tokio::test]
    async fn invalid_tokens_fail_synchronously() {
        let (orch, module) = setup();
        let mut broken = dot();
        broken.chain = ChainRef::evm(1);
        let err = orch.watch(&[ALICE.into()], &[broken]).unwrap_err();
        assert_eq!(err.category(), tally_core::ErrorCategory::Configuration);
        assert!(module.sinks.lock().is_empty());
    }

    #[tokio::test]
    async fn module_subscribe_failure_marks_the_record() {
        let (orch, _module) = setup();
        let mut failing = dot();
        failing.symbol = "FAIL".into();
        let _watch = orch.watch(&[ALICE.into()], &[failing.clone()]).unwrap();
        let record = orch.snapshot().get(&BalanceKey::for_token(&failing, ALICE)).cloned().unwrap();
        assert!(record.status.is_error());
        assert_eq!(orch.active_subscriptions(), 1);
    }

    #[tokio::test]
    async fn seeded_records_go_stale_when_nothing_arrives() {
        let (orch, module) = setup();
        let cached = BalanceRecord::new(
            &dot(),
            ALICE,
            Amounts::free_only(U256::from(3u64)),
            BalanceStatus::Live,
        );
        orch.seed(&BalanceCollection::from_records([cached]));
        let key = BalanceKey::for_token(&dot(), ALICE);
        assert_eq!(orch.snapshot().get(&key).unwrap().status, BalanceStatus::Cached);

        let _watch = orch.watch(&[ALICE.into()], &[dot()]).unwrap();
        assert_eq!(orch.mark_stale(Duration::from_secs(60)), 0);
        assert_eq!(orch.mark_stale(Duration::ZERO), 1);
        assert_eq!(orch.snapshot().get(&key).unwrap().status, BalanceStatus::Stale);

        sink(&module, 0)(free(4));
        assert_eq!(orch.snapshot().get(&key).unwrap().status, BalanceStatus::Live);
        assert_eq!(orch.mark_stale(Duration::ZERO), 0);
    }

    #[tokio::test]
    async fn seeding_never_overwrites_known_records() {
        let (orch, module) = setup();
        let _watch = orch.watch(&[ALICE.into()], &[dot()]).unwrap();
        sink(&module, 0)(free(11));
        let old = BalanceRecord::new(
            &dot(),
            ALICE,
            Amounts::free_only(U256::from(1u64)),
            BalanceStatus::Live,
        );
        orch.seed(&BalanceCollection::from_records([old]));
        let record = orch.snapshot().records()[0].clone();
        assert_eq!(record.amounts.free, U256::from(11u64));
        assert_eq!(record.status, BalanceStatus::Live);
    }

    #[tokio::test]
    async fn sweep_task_stops_with_the_orchestrator() {
        let (orch, _module) = setup();
        let sweep = orch.spawn_stale_sweep();
        drop(orch);
        tokio::time::timeout(Duration::from_secs(2), sweep)
            .await
            .expect("sweep should exit")
            .unwrap();
    }
}
