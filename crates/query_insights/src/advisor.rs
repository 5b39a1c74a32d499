use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use thiserror::Error;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::stats::{AdvisorResult, StatRow};

pub const DEFAULT_CONTEXT: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("advisor transport failed: {0}")]
    Transport(String),
    #[error("advisor fetch cancelled")]
    Cancelled,
}

/// Analysis failures belong in [`AdvisorResult::errors`]; `Err` is reserved
/// for results that never arrived.
#[async_trait]
pub trait AdvisorFetcher: Send + Sync {
    async fn fetch(&self, context: &str, query: &str) -> Result<AdvisorResult, FetchError>;
}

pub fn is_eligible(query: &str) -> bool {
    let normalized = query.trim().to_lowercase();
    normalized.starts_with("select") || normalized.starts_with("with")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvisorCacheConfig {
    pub ttl: Duration,
    pub max_entries: usize,
}

impl Default for AdvisorCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            max_entries: 512,
        }
    }
}

type CacheKey = (String, String);

#[derive(Debug)]
struct Resolved {
    result: AdvisorResult,
    at: Instant,
}

type Slot = Arc<OnceCell<Resolved>>;

/// Advisor results keyed by `(context, query text)`.
///
/// Each key has a single slot that one fetch populates; callers arriving while
/// that fetch is in flight wait on the same slot. Failed and cancelled fetches
/// are not cached: their slot is released once no caller holds it, so a later
/// call retries. Resolved slots expire after `ttl`, and once more than
/// `max_entries` slots exist the oldest resolved ones are dropped.
#[derive(Debug, Default)]
pub struct AdvisorCache {
    config: AdvisorCacheConfig,
    slots: Mutex<HashMap<CacheKey, Slot>>,
}

impl AdvisorCache {
    pub fn new(config: AdvisorCacheConfig) -> Self {
        Self {
            config,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// A cache that never expires or evicts, for one-off enrichment passes.
    pub fn unbounded() -> Self {
        Self::new(AdvisorCacheConfig {
            ttl: Duration::MAX,
            max_entries: usize::MAX,
        })
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, context: &str, query: &str) -> Option<AdvisorResult> {
        let slots = self.lock();
        let slot = slots.get(&(context.to_string(), query.to_string()))?;
        slot.get()
            .filter(|resolved| resolved.at.elapsed() < self.config.ttl)
            .map(|resolved| resolved.result.clone())
    }

    pub async fn resolve<F>(
        &self,
        context: &str,
        query: &str,
        fetcher: &F,
    ) -> Result<AdvisorResult, FetchError>
    where
        F: AdvisorFetcher + ?Sized,
    {
        let slot = self.slot(context, query);
        if let Some(resolved) = slot.get() {
            debug!(context, query, "advisor cache hit");
            return Ok(resolved.result.clone());
        }

        let outcome = slot
            .get_or_try_init(|| async {
                debug!(context, query, "fetching advisor result");
                let result = fetcher.fetch(context, query).await?;
                Ok::<_, FetchError>(Resolved {
                    result,
                    at: Instant::now(),
                })
            })
            .await
            .map(|resolved| resolved.result.clone());
        if outcome.is_err() {
            drop(slot);
            self.release_unresolved(context, query);
        }
        outcome
    }

    pub async fn enrich<F>(
        &self,
        context: &str,
        rows: Vec<StatRow>,
        enabled: bool,
        fetcher: &F,
    ) -> Vec<StatRow>
    where
        F: AdvisorFetcher + ?Sized,
    {
        self.enrich_until_cancelled(context, rows, enabled, fetcher, &CancellationToken::new())
            .await
    }

    /// Rows keep their order. Ineligible rows, and rows whose fetch failed or
    /// was cancelled, keep the advisor result they came in with.
    pub async fn enrich_until_cancelled<F>(
        &self,
        context: &str,
        mut rows: Vec<StatRow>,
        enabled: bool,
        fetcher: &F,
        cancel: &CancellationToken,
    ) -> Vec<StatRow>
    where
        F: AdvisorFetcher + ?Sized,
    {
        if !enabled {
            return rows;
        }

        // The full key set must exist before the first fetch starts.
        let queries = rows
            .iter()
            .map(|row| row.query.as_str())
            .filter(|query| is_eligible(query))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(str::to_owned)
            .collect::<Vec<_>>();
        if queries.is_empty() {
            return rows;
        }
        debug!(
            context,
            rows = rows.len(),
            distinct = queries.len(),
            "enriching statistics rows"
        );

        let outcomes = join_all(
            queries
                .iter()
                .map(|query| self.resolve_or_cancel(context, query, fetcher, cancel)),
        )
        .await;

        let resolved = queries
            .iter()
            .map(String::as_str)
            .zip(outcomes)
            .filter_map(|(query, outcome)| match outcome {
                Ok(result) => Some((query, result)),
                Err(err) => {
                    warn!(context, query, error = %err, "advisor result unresolved");
                    None
                }
            })
            .collect::<HashMap<_, _>>();

        for row in rows.iter_mut() {
            if let Some(result) = resolved.get(row.query.as_str()) {
                row.advisor_result = Some(result.clone());
            }
        }
        rows
    }

    async fn resolve_or_cancel<F>(
        &self,
        context: &str,
        query: &str,
        fetcher: &F,
        cancel: &CancellationToken,
    ) -> Result<AdvisorResult, FetchError>
    where
        F: AdvisorFetcher + ?Sized,
    {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
            outcome = self.resolve(context, query, fetcher) => outcome,
        };
        if matches!(outcome, Err(FetchError::Cancelled)) {
            self.release_unresolved(context, query);
        }
        outcome
    }

    fn slot(&self, context: &str, query: &str) -> Slot {
        let key = (context.to_string(), query.to_string());
        let mut slots = self.lock();
        if let Some(slot) = slots.get(&key) {
            match slot.get() {
                Some(resolved) if resolved.at.elapsed() >= self.config.ttl => {
                    debug!(context, query, "advisor cache entry expired");
                }
                _ => return Arc::clone(slot),
            }
        }

        let slot = Arc::new(OnceCell::new());
        slots.insert(key, Arc::clone(&slot));
        evict(&mut slots, &self.config);
        slot
    }

    // Drops the key's slot if it never resolved and no caller is waiting on it.
    fn release_unresolved(&self, context: &str, query: &str) {
        let key = (context.to_string(), query.to_string());
        let mut slots = self.lock();
        if slots.get(&key).is_some_and(is_abandoned) {
            slots.remove(&key);
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CacheKey, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn evict(slots: &mut HashMap<CacheKey, Slot>, config: &AdvisorCacheConfig) {
    if slots.len() <= config.max_entries {
        return;
    }

    slots.retain(|_, slot| match slot.get() {
        Some(resolved) => resolved.at.elapsed() < config.ttl,
        None => !is_abandoned(slot),
    });
    if slots.len() <= config.max_entries {
        return;
    }

    // In-flight slots are never evicted.
    let mut resolved = slots
        .iter()
        .filter_map(|(key, slot)| slot.get().map(|resolved| (resolved.at, key.clone())))
        .collect::<Vec<_>>();
    resolved.sort_by_key(|(at, _)| *at);

    let excess = slots.len() - config.max_entries;
    for (_, key) in resolved.into_iter().take(excess) {
        debug!(context = %key.0, query = %key.1, "evicting advisor cache entry");
        slots.remove(&key);
    }
}

fn is_abandoned(slot: &Slot) -> bool {
    !slot.initialized() && Arc::strong_count(slot) == 1
}

/// Enrich one batch with a cache scoped to this call alone.
pub async fn enrich<F>(rows: Vec<StatRow>, enabled: bool, fetcher: &F) -> Vec<StatRow>
where
    F: AdvisorFetcher + ?Sized,
{
    AdvisorCache::unbounded()
        .enrich(DEFAULT_CONTEXT, rows, enabled, fetcher)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[derive(Default)]
    struct ScriptedFetcher {
        calls: Mutex<Vec<(String, String)>>,
        failing: HashSet<String>,
        delay: Duration,
        hang: bool,
    }

    impl ScriptedFetcher {
        fn slow(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<(String, String)> {
            self.calls.lock().unwrap().clone()
        }

        fn calls_for(&self, query: &str) -> usize {
            self.calls().iter().filter(|(_, q)| q == query).count()
        }
    }

    #[async_trait]
    impl AdvisorFetcher for ScriptedFetcher {
        async fn fetch(&self, context: &str, query: &str) -> Result<AdvisorResult, FetchError> {
            self.calls
                .lock()
                .unwrap()
                .push((context.to_string(), query.to_string()));
            if self.hang {
                std::future::pending::<()>().await;
            }
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.failing.contains(query) {
                return Err(FetchError::Transport("connection reset".to_string()));
            }
            Ok(AdvisorResult::recommending(vec![format!(
                "CREATE INDEX ON t -- {query}"
            )]))
        }
    }

    fn previous() -> AdvisorResult {
        AdvisorResult::recommending(vec!["CREATE INDEX ON old(a)".to_string()])
    }

    #[test]
    fn eligibility_uses_trimmed_lowercase_prefix() {
        assert!(is_eligible("  SELECT * FROM t"));
        assert!(is_eligible("\nWith x as (select 1) select * from x"));
        assert!(!is_eligible("update t set x=1"));
        assert!(!is_eligible("insert into t values (1)"));
        assert!(!is_eligible(""));
    }

    #[tokio::test]
    async fn duplicate_query_texts_share_one_fetch() {
        let fetcher = ScriptedFetcher::slow(Duration::from_millis(5));
        let rows = vec![
            StatRow::new("select * from users where id = $1"),
            StatRow::new("select * from users where id = $1"),
            StatRow::new("select * from users where id = $1"),
        ];

        let enriched = enrich(rows, true, &fetcher).await;

        assert_eq!(fetcher.calls_for("select * from users where id = $1"), 1);
        assert_eq!(enriched.len(), 3);
        let first = enriched[0].advisor_result.clone();
        assert!(first.is_some());
        assert!(enriched.iter().all(|row| row.advisor_result == first));
    }

    #[tokio::test]
    async fn ineligible_rows_are_untouched_and_never_fetched() {
        let fetcher = ScriptedFetcher::default();
        let mut update = StatRow::new("update t set x=1");
        update.advisor_result = Some(previous());
        let rows = vec![update, StatRow::new("select 1")];

        let enriched = enrich(rows, true, &fetcher).await;

        assert_eq!(fetcher.calls_for("update t set x=1"), 0);
        assert_eq!(enriched[0].query, "update t set x=1");
        assert_eq!(enriched[0].advisor_result, Some(previous()));
        assert!(enriched[1].advisor_result.is_some());
    }

    #[tokio::test]
    async fn disabled_enrichment_is_a_pass_through() {
        let fetcher = ScriptedFetcher::default();
        let rows = vec![StatRow::new("select 1"), StatRow::new("delete from t")];

        let enriched = enrich(rows.clone(), false, &fetcher).await;

        assert_eq!(enriched, rows);
        assert!(fetcher.calls().is_empty());
    }

    #[tokio::test]
    async fn output_preserves_row_order_and_count() {
        let fetcher = ScriptedFetcher::default();
        let rows = vec![
            StatRow::new("select b"),
            StatRow::new("vacuum"),
            StatRow::new("select a"),
            StatRow::new("select b"),
        ];

        let enriched = enrich(rows, true, &fetcher).await;

        let queries = enriched.iter().map(|row| row.query.as_str()).collect::<Vec<_>>();
        assert_eq!(queries, vec!["select b", "vacuum", "select a", "select b"]);
        assert_eq!(fetcher.calls().len(), 2);
        assert!(enriched[1].advisor_result.is_none());
    }

    #[tokio::test]
    async fn failed_fetch_does_not_block_other_queries() {
        let fetcher = ScriptedFetcher {
            failing: HashSet::from(["select broken".to_string()]),
            ..ScriptedFetcher::default()
        };
        let mut broken = StatRow::new("select broken");
        broken.advisor_result = Some(previous());
        let rows = vec![broken, StatRow::new("select fine"), StatRow::new("select broken")];

        let enriched = enrich(rows, true, &fetcher).await;

        assert_eq!(enriched[0].advisor_result, Some(previous()));
        assert!(enriched[1].advisor_result.as_ref().is_some_and(|r| r.has_recommendation()));
        assert!(enriched[2].advisor_result.is_none());
    }

    #[tokio::test]
    async fn failed_fetches_are_retried_on_the_next_pass() {
        let cache = AdvisorCache::default();
        let fetcher = ScriptedFetcher {
            failing: HashSet::from(["select broken".to_string()]),
            ..ScriptedFetcher::default()
        };

        for _ in 0..2 {
            cache
                .enrich(DEFAULT_CONTEXT, vec![StatRow::new("select broken")], true, &fetcher)
                .await;
        }

        assert_eq!(fetcher.calls_for("select broken"), 2);
        assert_eq!(cache.get(DEFAULT_CONTEXT, "select broken"), None);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn failing_queries_do_not_grow_the_cache_past_its_bound() {
        let cache = AdvisorCache::new(AdvisorCacheConfig {
            ttl: Duration::from_secs(60),
            max_entries: 2,
        });
        let rows = (0..50)
            .map(|i| StatRow::new(format!("select {i}")))
            .collect::<Vec<_>>();
        let fetcher = ScriptedFetcher {
            failing: rows.iter().map(|row| row.query.clone()).collect(),
            ..ScriptedFetcher::default()
        };

        let enriched = cache.enrich(DEFAULT_CONTEXT, rows, true, &fetcher).await;

        assert_eq!(fetcher.calls().len(), 50);
        assert!(enriched.iter().all(|row| row.advisor_result.is_none()));
        assert!(cache.len() <= 2, "{} slots held", cache.len());
    }

    #[tokio::test]
    async fn long_lived_cache_skips_refetch_across_passes() {
        let cache = AdvisorCache::default();
        let fetcher = ScriptedFetcher::default();

        for _ in 0..3 {
            let enriched = cache
                .enrich("conn-1", vec![StatRow::new("select 1")], true, &fetcher)
                .await;
            assert!(enriched[0].advisor_result.is_some());
        }

        assert_eq!(fetcher.calls().len(), 1);
        assert!(cache.get("conn-1", "select 1").is_some());
    }

    #[tokio::test]
    async fn contexts_are_cached_separately() {
        let cache = AdvisorCache::default();
        let fetcher = ScriptedFetcher::default();

        cache
            .enrich("conn-1", vec![StatRow::new("select 1")], true, &fetcher)
            .await;
        cache
            .enrich("conn-2", vec![StatRow::new("select 1")], true, &fetcher)
            .await;

        assert_eq!(
            fetcher.calls(),
            vec![
                ("conn-1".to_string(), "select 1".to_string()),
                ("conn-2".to_string(), "select 1".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn concurrent_callers_await_the_same_fetch() {
        let cache = AdvisorCache::default();
        let fetcher = ScriptedFetcher::slow(Duration::from_millis(20));

        let (left, right) = tokio::join!(
            cache.enrich("conn-1", vec![StatRow::new("select 1")], true, &fetcher),
            cache.enrich("conn-1", vec![StatRow::new("select 1")], true, &fetcher),
        );

        assert_eq!(fetcher.calls().len(), 1);
        assert_eq!(left[0].advisor_result, right[0].advisor_result);
        assert!(left[0].advisor_result.is_some());
    }

    #[tokio::test]
    async fn expired_entries_are_refetched() {
        let cache = AdvisorCache::new(AdvisorCacheConfig {
            ttl: Duration::ZERO,
            max_entries: 16,
        });
        let fetcher = ScriptedFetcher::default();

        for _ in 0..2 {
            cache
                .enrich(DEFAULT_CONTEXT, vec![StatRow::new("select 1")], true, &fetcher)
                .await;
        }

        assert_eq!(fetcher.calls().len(), 2);
    }

    #[tokio::test]
    async fn oldest_resolved_entry_is_evicted_first() {
        let cache = AdvisorCache::new(AdvisorCacheConfig {
            ttl: Duration::from_secs(60),
            max_entries: 1,
        });
        let fetcher = ScriptedFetcher::default();

        cache
            .enrich(DEFAULT_CONTEXT, vec![StatRow::new("select a")], true, &fetcher)
            .await;
        cache
            .enrich(DEFAULT_CONTEXT, vec![StatRow::new("select b")], true, &fetcher)
            .await;

        assert_eq!(cache.len(), 1);
        assert!(cache.get(DEFAULT_CONTEXT, "select a").is_none());
        assert!(cache.get(DEFAULT_CONTEXT, "select b").is_some());
    }

    #[tokio::test]
    async fn cancelled_before_start_issues_no_fetch() {
        let fetcher = ScriptedFetcher::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut row = StatRow::new("select 1");
        row.advisor_result = Some(previous());

        let enriched = AdvisorCache::default()
            .enrich_until_cancelled(DEFAULT_CONTEXT, vec![row], true, &fetcher, &cancel)
            .await;

        assert!(fetcher.calls().is_empty());
        assert_eq!(enriched[0].advisor_result, Some(previous()));
    }

    #[tokio::test]
    async fn cancelling_in_flight_fetch_keeps_prior_result() {
        let cache = AdvisorCache::default();
        let fetcher = ScriptedFetcher {
            hang: true,
            ..ScriptedFetcher::default()
        };
        let cancel = CancellationToken::new();
        let mut row = StatRow::new("select 1");
        row.advisor_result = Some(previous());

        let (enriched, ()) = tokio::join!(
            cache.enrich_until_cancelled(DEFAULT_CONTEXT, vec![row], true, &fetcher, &cancel),
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                cancel.cancel();
            },
        );

        assert_eq!(fetcher.calls().len(), 1);
        assert_eq!(enriched[0].advisor_result, Some(previous()));
        assert!(cache.get(DEFAULT_CONTEXT, "select 1").is_none());
        assert!(cache.is_empty());
    }
}
