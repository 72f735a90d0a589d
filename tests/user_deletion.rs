use std::sync::Arc;
use std::time::Duration;

use auction_events::{
    Auction, AuctionStatus, BUYER_DELETION, InMemoryAuctionStore, UserDeleted, UserDeletedHandler,
    user_deleted_headers,
};
use rabbitmq::{
    EventPublisher, EventSubscriber, ExchangeSpec, InMemoryBroker, ReconnectPolicy, RetryConfig,
};
use tokio::time;

fn fast_retry() -> RetryConfig {
    RetryConfig {
        attempts: 2,
        delay: Duration::from_millis(1),
    }
}

async fn eventually(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[test_log::test(tokio::test)]
async fn user_deletion_event_cleans_up_auctions() {
    let broker = InMemoryBroker::new();
    let store = Arc::new(InMemoryAuctionStore::new());
    let active = store.insert(Auction::new("u-1", "Camera", AuctionStatus::Active));
    let draft = store.insert(Auction::new("u-1", "Bike", AuctionStatus::Draft));
    let foreign = store.insert(Auction::new("u-2", "Lamp", AuctionStatus::Draft));

    let mut subscriber = EventSubscriber::connect(broker.connector(), "event_bus", fast_retry())
        .await
        .unwrap()
        .with_reconnect_policy(ReconnectPolicy {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
        });
    subscriber.register_handler(BUYER_DELETION, Arc::new(UserDeletedHandler::new(store.clone())));
    subscriber
        .subscribe_events(BUYER_DELETION, BUYER_DELETION)
        .await
        .unwrap();
    let stop = subscriber.stop_token();
    let worker = tokio::spawn(async move { subscriber.start().await });

    let mut publisher = EventPublisher::connect(
        broker.connector(),
        ExchangeSpec::direct("event_bus"),
        fast_retry(),
    )
    .await
    .unwrap();
    let event = UserDeleted {
        user_id: "u-1".to_string(),
    };
    publisher
        .publish_event(&event, &user_deleted_headers(), BUYER_DELETION)
        .await
        .unwrap();

    eventually("first event acked", || broker.acked().len() == 1).await;
    assert_eq!(store.get(&active).unwrap().status, AuctionStatus::Deleted);
    assert!(store.get(&draft).is_none());
    assert_eq!(store.get(&foreign).unwrap().status, AuctionStatus::Draft);

    // The same event arriving again leaves the store as it is
    let snapshot = store.by_author("u-1");
    publisher
        .publish_event(&event, &user_deleted_headers(), BUYER_DELETION)
        .await
        .unwrap();
    eventually("duplicate acked", || broker.acked().len() == 2).await;
    assert_eq!(store.by_author("u-1"), snapshot);
    assert_eq!(broker.queue_len("buyer_deletion-dlq"), 0);

    publisher.close().await;
    stop.cancel();
    worker.await.unwrap().unwrap();
}
