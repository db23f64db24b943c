//! Synchronization between clients sharing a broadcast channel.

use quarry_engine::{Query, QueryClient, QueryDefinition, QueryOptions};
use quarry_events::{ChannelMessage, LocalChannel, QueryBroadcastMessage, QueryChannel};
use quarry_test_utils::fixtures::fast_config;
use quarry_test_utils::ScriptedFetcher;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

struct Tab {
    client: QueryClient,
    fetcher: ScriptedFetcher<u32>,
}

impl Tab {
    fn open(channel: &Arc<LocalChannel>) -> Self {
        let client = QueryClient::builder()
            .config(fast_config())
            .channel(Arc::clone(channel) as Arc<dyn QueryChannel>)
            .build()
            .unwrap();
        Self {
            client,
            fetcher: ScriptedFetcher::always(1),
        }
    }

    fn query(&self, broadcast: bool) -> Query<u32, ()> {
        self.client
            .query(
                "shared",
                QueryDefinition::new(Arc::new(self.fetcher.clone()), ()),
                QueryOptions::new().with_broadcast(broadcast),
            )
            .unwrap()
    }

    fn calls(&self) -> usize {
        self.fetcher.call_count()
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(5)).await;
}

#[tokio::test(start_paused = true)]
async fn test_invalidation_propagates_to_other_tabs() {
    let channel = Arc::new(LocalChannel::new("tabs", 16));
    let a = Tab::open(&channel);
    let b = Tab::open(&channel);
    let qa = a.query(true);
    let qb = b.query(true);
    settle().await;
    assert_eq!((a.calls(), b.calls()), (1, 1));

    qa.invalidate();
    settle().await;

    assert_eq!(a.calls(), 2);
    assert_eq!(b.calls(), 2);
    assert!(qb.state().is_success());
}

#[tokio::test(start_paused = true)]
async fn test_remote_invalidation_is_not_echoed() {
    let channel = Arc::new(LocalChannel::new("tabs", 16));
    let mut observer = channel.subscribe();
    let a = Tab::open(&channel);
    let b = Tab::open(&channel);
    let qa = a.query(true);
    let _qb = b.query(true);
    settle().await;
    while observer.try_recv().is_ok() {}

    qa.invalidate();
    settle().await;

    let mut invalidations = 0;
    while let Ok(message) = observer.try_recv() {
        if matches!(message.message, QueryBroadcastMessage::Invalidate { .. }) {
            assert!(message.is_from(a.client.origin()));
            invalidations += 1;
        }
    }
    assert_eq!(invalidations, 1);
}

#[tokio::test(start_paused = true)]
async fn test_refetch_message_triggers_fetch() {
    let channel = Arc::new(LocalChannel::new("tabs", 16));
    let tab = Tab::open(&channel);
    let query = tab
        .client
        .query(
            "shared",
            QueryDefinition::new(Arc::new(tab.fetcher.clone()), ()),
            QueryOptions::new().with_broadcast(true).with_lazy(true),
        )
        .unwrap();
    settle().await;
    assert_eq!(tab.calls(), 0);

    channel.post_message(ChannelMessage::new(
        Uuid::now_v7(),
        QueryBroadcastMessage::refetch(query.query_key()),
    ));
    settle().await;
    assert_eq!(tab.calls(), 1);
    assert!(query.is_enabled());
}

#[tokio::test(start_paused = true)]
async fn test_messages_for_other_keys_are_ignored() {
    let channel = Arc::new(LocalChannel::new("tabs", 16));
    let tab = Tab::open(&channel);
    let _query = tab.query(true);
    settle().await;

    channel.post_message(ChannelMessage::new(
        Uuid::now_v7(),
        QueryBroadcastMessage::invalidate("elsewhere::null"),
    ));
    settle().await;
    assert_eq!(tab.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_without_broadcast_nothing_is_shared() {
    let channel = Arc::new(LocalChannel::new("tabs", 16));
    let a = Tab::open(&channel);
    let b = Tab::open(&channel);
    let qa = a.query(false);
    let _qb = b.query(true);
    settle().await;

    qa.invalidate();
    settle().await;
    assert_eq!(a.calls(), 2);
    assert_eq!(b.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_disposed_query_stops_listening() {
    let channel = Arc::new(LocalChannel::new("tabs", 16));
    let a = Tab::open(&channel);
    let b = Tab::open(&channel);
    let qa = a.query(true);
    let qb = b.query(true);
    settle().await;

    qb.dispose();
    qa.invalidate();
    settle().await;
    assert_eq!(b.calls(), 1);
}
