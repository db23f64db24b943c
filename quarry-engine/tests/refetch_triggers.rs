//! Automatic refetch on focus, reconnect and interval.

use quarry_engine::{Environment, QueryClient, QueryConfig, QueryDefinition, QueryOptions};
use quarry_test_utils::fixtures::{fast_config, fixed_clock};
use quarry_test_utils::{ManualClock, ScriptedFetcher};
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    client: QueryClient,
    clock: ManualClock,
    env: Environment,
    fetcher: ScriptedFetcher<u32>,
}

impl Harness {
    fn new(env: Environment) -> Self {
        let clock = fixed_clock();
        let config = QueryConfig {
            refetch_on_focus: true,
            refetch_on_reconnect: true,
            ..fast_config()
        };
        let client = QueryClient::builder()
            .config(config)
            .clock(Arc::new(clock.clone()))
            .environment(env.clone())
            .build()
            .unwrap();
        Self {
            client,
            clock,
            env,
            fetcher: ScriptedFetcher::always(1),
        }
    }

    fn definition(&self) -> QueryDefinition<u32, ()> {
        QueryDefinition::new(Arc::new(self.fetcher.clone()), ())
    }

    fn calls(&self) -> usize {
        self.fetcher.call_count()
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(5)).await;
}

// ============================================================================
// FOCUS
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_focus_refetches_stale_data() {
    let h = Harness::new(Environment::default());
    let _query = h
        .client
        .query("focus", h.definition(), QueryOptions::new())
        .unwrap();
    settle().await;
    assert_eq!(h.calls(), 1);

    h.clock.advance(Duration::from_secs(1));
    h.env.focus();
    settle().await;
    assert_eq!(h.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_visibility_change_counts_as_focus() {
    let h = Harness::new(Environment::default());
    let _query = h
        .client
        .query("visible", h.definition(), QueryOptions::new())
        .unwrap();
    settle().await;

    h.clock.advance(Duration::from_secs(1));
    h.env.set_visible(true);
    settle().await;
    assert_eq!(h.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_focus_skips_fresh_data() {
    let h = Harness::new(Environment::default());
    let _query = h
        .client
        .query(
            "fresh",
            h.definition(),
            QueryOptions::new().with_stale_time(Duration::from_secs(60)),
        )
        .unwrap();
    settle().await;

    h.clock.advance(Duration::from_secs(1));
    h.env.focus();
    settle().await;
    assert_eq!(h.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_focus_ignored_when_disabled_per_query() {
    let h = Harness::new(Environment::default());
    let _query = h
        .client
        .query(
            "no-focus",
            h.definition(),
            QueryOptions::new().with_refetch_on_focus(false),
        )
        .unwrap();
    settle().await;

    h.clock.advance(Duration::from_secs(1));
    h.env.focus();
    settle().await;
    assert_eq!(h.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_focus_leaves_untriggered_lazy_query_alone() {
    let h = Harness::new(Environment::default());
    let query = h
        .client
        .query("lazy-focus", h.definition(), QueryOptions::new().with_lazy(true))
        .unwrap();
    settle().await;

    h.env.focus();
    settle().await;
    assert_eq!(h.calls(), 0);

    query.fetch().await.unwrap();
    h.clock.advance(Duration::from_secs(1));
    h.env.focus();
    settle().await;
    assert_eq!(h.calls(), 2);
}

// ============================================================================
// RECONNECT
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_reconnect_refetches_stale_data() {
    let h = Harness::new(Environment::new(false, true));
    let _query = h
        .client
        .query("reconnect", h.definition(), QueryOptions::new())
        .unwrap();
    settle().await;
    assert_eq!(h.calls(), 1);

    h.clock.advance(Duration::from_secs(1));
    assert!(h.env.set_online(true));
    settle().await;
    assert_eq!(h.calls(), 2);

    // Going offline is not a trigger.
    h.clock.advance(Duration::from_secs(1));
    h.env.set_online(false);
    settle().await;
    assert_eq!(h.calls(), 2);
}

// ============================================================================
// INTERVAL
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_interval_refetches_while_focused() {
    let h = Harness::new(Environment::default());
    let _query = h
        .client
        .query(
            "interval",
            h.definition(),
            QueryOptions::new()
                .with_refetch_interval(Duration::from_millis(100))
                .with_stale_time(Duration::from_secs(3600)),
        )
        .unwrap();

    tokio::time::sleep(Duration::from_millis(350)).await;
    assert_eq!(h.calls(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_interval_pauses_in_background() {
    let h = Harness::new(Environment::new(true, false));
    let _query = h
        .client
        .query(
            "background",
            h.definition(),
            QueryOptions::new().with_refetch_interval(Duration::from_millis(100)),
        )
        .unwrap();

    tokio::time::sleep(Duration::from_millis(350)).await;
    assert_eq!(h.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_interval_in_background_when_allowed() {
    let h = Harness::new(Environment::new(true, false));
    let _query = h
        .client
        .query(
            "background-allowed",
            h.definition(),
            QueryOptions::new()
                .with_refetch_interval(Duration::from_millis(100))
                .with_refetch_interval_in_background(true),
        )
        .unwrap();

    tokio::time::sleep(Duration::from_millis(350)).await;
    assert_eq!(h.calls(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_interval_stops_after_dispose() {
    let h = Harness::new(Environment::default());
    let query = h
        .client
        .query(
            "stopped",
            h.definition(),
            QueryOptions::new().with_refetch_interval(Duration::from_millis(100)),
        )
        .unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(h.calls(), 2);
    query.dispose();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_disabled_query_has_no_scheduler() {
    let h = Harness::new(Environment::default());
    let _query = h
        .client
        .query(
            "disabled-interval",
            h.definition().with_enabled(false),
            QueryOptions::new().with_refetch_interval(Duration::from_millis(100)),
        )
        .unwrap();

    tokio::time::sleep(Duration::from_millis(350)).await;
    assert_eq!(h.calls(), 0);
}
