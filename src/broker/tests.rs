use std::sync::Arc;
use std::time::Duration;

use super::Broker;
use super::subscriptions::Subscriptions;
use super::topic::Topic;
use crate::config::BrokerSettings;
use crate::message::Message;
use crate::transport::channel::ChannelConnection;
use crate::transport::{Connection, SharedConnection};
use crate::utils::error::Error;

fn topics(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

fn broker_with(names: &[&str]) -> Broker {
    Broker::new(&BrokerSettings {
        topics: topics(names),
        sync_timeout_ms: 500,
        ..BrokerSettings::default()
    })
}

/// Registers the broker end of a channel pair and returns (broker side id, client side).
fn connect(broker: &Broker, name: &str) -> (String, ChannelConnection) {
    let (server, client) = ChannelConnection::pair("channel:broker", name);
    let server: SharedConnection = Arc::new(server);
    let id = server.instance_id().to_string();
    broker.register(server);
    (id, client)
}

async fn read_message(connection: &ChannelConnection) -> Message {
    let data = connection
        .read(Some(Duration::from_secs(1)))
        .await
        .expect("expected a message");
    Message::deserialize(&data).unwrap()
}

#[test]
fn test_topic_subscribe_and_unsubscribe() {
    let mut topic = Topic::new("orders");
    assert!(topic.is_empty());
    assert!(topic.subscribe("c1".to_string()));
    assert!(!topic.subscribe("c1".to_string()));
    assert!(topic.contains("c1"));
    assert!(topic.unsubscribe("c1"));
    assert!(!topic.unsubscribe("c1"));
}

#[test]
fn test_subscriptions_keep_both_indices_in_sync() {
    let (conn, _peer) = ChannelConnection::pair("channel:a", "channel:b");
    let conn: SharedConnection = Arc::new(conn);
    let id = conn.instance_id().to_string();

    let mut subs = Subscriptions::new();
    subs.declare_topic("orders");
    subs.declare_topic("prices");
    assert!(subs.register(conn));

    subs.subscribe(&id, &topics(&["orders", "prices"])).unwrap();
    assert_eq!(subs.topics_of(&id), vec!["orders", "prices"]);
    assert_eq!(subs.subscriber_count("orders"), 1);

    subs.remove_connection(&id).unwrap();
    assert_eq!(subs.subscriber_count("orders"), 0);
    assert_eq!(subs.subscriber_count("prices"), 0);
    assert!(!subs.is_registered(&id));
}

#[test]
fn test_subscribe_unknown_topic_applies_nothing() {
    let broker = broker_with(&["orders"]);
    let (id, _client) = connect(&broker, "channel:a");

    let result = broker.subscribe(&id, &topics(&["orders", "volumes"]));
    assert!(matches!(result, Err(Error::UnknownTopic(t)) if t == "volumes"));
    assert!(broker.topics_of(&id).is_empty());
    assert_eq!(broker.subscriber_count("orders"), 0);
}

#[test]
fn test_unsubscribe_is_all_or_nothing() {
    let broker = broker_with(&["orders", "prices"]);
    let (id, _client) = connect(&broker, "channel:a");
    broker.subscribe(&id, &topics(&["orders"])).unwrap();

    let result = broker.unsubscribe(&id, &topics(&["orders", "prices"]));
    assert!(matches!(result, Err(Error::NotSubscribed(t)) if t == "prices"));
    assert_eq!(broker.topics_of(&id), vec!["orders"]);

    let result = broker.unsubscribe(&id, &topics(&["nope"]));
    assert!(matches!(result, Err(Error::UnknownTopic(_))));

    broker.unsubscribe(&id, &topics(&["orders"])).unwrap();
    assert!(broker.topics_of(&id).is_empty());
    // a second unsubscribe is an error, not a no-op
    assert!(matches!(
        broker.unsubscribe(&id, &topics(&["orders"])),
        Err(Error::NotSubscribed(_))
    ));
}

#[test]
fn test_subscribe_requires_registration() {
    let broker = broker_with(&["orders"]);
    assert!(matches!(
        broker.subscribe("ghost", &topics(&["orders"])),
        Err(Error::ConnectionClosed)
    ));
}

#[tokio::test]
async fn test_propagate_async_skips_sender() {
    let broker = broker_with(&["orders"]);
    let (a, client_a) = connect(&broker, "channel:a");
    let (b, client_b) = connect(&broker, "channel:b");
    broker.subscribe(&a, &topics(&["orders"])).unwrap();
    broker.subscribe(&b, &topics(&["orders"])).unwrap();

    let delivered = broker
        .propagate_async(&a, &Message::new("orders", "o-1"))
        .await
        .unwrap();
    assert_eq!(delivered, 1);

    let received = read_message(&client_b).await;
    assert_eq!(received.topic, "orders");
    assert_eq!(received.payload, "o-1");
    assert!(matches!(
        client_a.read(Some(Duration::from_millis(20))).await,
        Err(Error::Timeout)
    ));
    assert_eq!(broker.metrics().get("messages_propagated"), 1);
}

#[tokio::test]
async fn test_propagate_async_isolates_failed_subscriber() {
    let broker = broker_with(&["orders"]);
    let (a, client_a) = connect(&broker, "channel:a");
    let (b, client_b) = connect(&broker, "channel:b");
    broker.subscribe(&a, &topics(&["orders"])).unwrap();
    broker.subscribe(&b, &topics(&["orders"])).unwrap();
    client_a.close().await.unwrap();

    let delivered = broker
        .propagate_async("publisher", &Message::new("orders", "o-2"))
        .await
        .unwrap();
    assert_eq!(delivered, 1);
    assert_eq!(read_message(&client_b).await.payload, "o-2");

    let metrics = broker.metrics();
    assert_eq!(metrics.get("propagation_failures"), 1);
    assert_eq!(metrics.get("messages_propagated"), 1);
}

#[tokio::test]
async fn test_propagate_async_unknown_topic() {
    let broker = broker_with(&[]);
    let result = broker
        .propagate_async("publisher", &Message::new("orders", "x"))
        .await;
    assert!(matches!(result, Err(Error::UnknownTopic(_))));
}

/// Answers every sync request arriving on `client` with `answer`.
fn spawn_responder(
    broker: Arc<Broker>,
    responder_id: String,
    client: ChannelConnection,
    answer: &'static str,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Ok(data) = client.read(None).await {
            let request = Message::deserialize(&data).unwrap();
            broker
                .handle_response(&responder_id, request.reply(answer))
                .unwrap();
        }
    })
}

#[tokio::test]
async fn test_propagate_sync_gathers_every_reply() {
    let broker = Arc::new(broker_with(&["prices"]));
    let (a, client_a) = connect(&broker, "channel:a");
    let (b, client_b) = connect(&broker, "channel:b");
    let (requester, _client_r) = connect(&broker, "channel:r");
    broker.subscribe(&a, &topics(&["prices"])).unwrap();
    broker.subscribe(&b, &topics(&["prices"])).unwrap();

    spawn_responder(broker.clone(), a, client_a, "101");
    spawn_responder(broker.clone(), b, client_b, "102");

    let request = Message::new_sync("prices", "AAPL", "tok-1");
    let replies = broker.propagate_sync(&requester, &request).await.unwrap();

    let mut payloads: Vec<String> = replies.iter().map(|r| r.payload.clone()).collect();
    payloads.sort();
    assert_eq!(payloads, vec!["101", "102"]);
    assert!(replies.iter().all(|r| r.sync_token == "tok-1" && r.response));
    assert_eq!(broker.pending_requests(), 0);
    assert_eq!(broker.metrics().get("sync_responses"), 2);
}

#[tokio::test]
async fn test_propagate_sync_without_subscribers_is_an_error() {
    let broker = broker_with(&["prices"]);
    let result = broker
        .propagate_sync("requester", &Message::new_sync("prices", "AAPL", "tok"))
        .await;
    assert!(matches!(result, Err(Error::NoResponses)));
}

#[tokio::test]
async fn test_propagate_sync_times_out_silent_subscribers() {
    let broker = Broker::new(&BrokerSettings {
        topics: topics(&["prices"]),
        sync_timeout_ms: 30,
        ..BrokerSettings::default()
    });
    let (a, _silent) = connect(&broker, "channel:a");
    broker.subscribe(&a, &topics(&["prices"])).unwrap();

    let result = broker
        .propagate_sync("requester", &Message::new_sync("prices", "AAPL", "tok"))
        .await;
    assert!(matches!(result, Err(Error::NoResponses)));
    assert_eq!(broker.pending_requests(), 0);
}

#[tokio::test]
async fn test_propagate_sync_rejects_in_flight_token() {
    let broker = Arc::new(broker_with(&["prices"]));
    let (a, _silent) = connect(&broker, "channel:a");
    broker.subscribe(&a, &topics(&["prices"])).unwrap();

    let first = {
        let broker = broker.clone();
        tokio::spawn(async move {
            broker
                .propagate_sync("r1", &Message::new_sync("prices", "x", "dup"))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let second = broker
        .propagate_sync("r2", &Message::new_sync("prices", "x", "dup"))
        .await;
    assert!(matches!(second, Err(Error::TokenCollision(_))));
    assert!(matches!(first.await.unwrap(), Err(Error::NoResponses)));
}

#[tokio::test]
async fn test_response_from_wrong_connection_is_rejected() {
    let broker = Arc::new(broker_with(&["prices"]));
    let (a, client_a) = connect(&broker, "channel:a");
    broker.subscribe(&a, &topics(&["prices"])).unwrap();

    let gather = {
        let broker = broker.clone();
        tokio::spawn(async move {
            broker
                .propagate_sync("r", &Message::new_sync("prices", "x", "tok"))
                .await
        })
    };
    let request = read_message(&client_a).await;
    let spoofed = broker.handle_response("intruder", request.reply("forged"));
    assert!(matches!(spoofed, Err(Error::InvalidToken(_))));

    broker.handle_response(&a, request.reply("real")).unwrap();
    let replies = gather.await.unwrap().unwrap();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].payload, "real");
}

#[tokio::test]
async fn test_disconnect_purges_indices_and_pending_requests() {
    let broker = Arc::new(Broker::new(&BrokerSettings {
        topics: topics(&["orders", "prices"]),
        sync_timeout_ms: 0,
        ..BrokerSettings::default()
    }));
    let (a, _client_a) = connect(&broker, "channel:a");
    broker.subscribe(&a, &topics(&["orders", "prices"])).unwrap();

    let gather = {
        let broker = broker.clone();
        tokio::spawn(async move {
            broker
                .propagate_sync("r", &Message::new_sync("prices", "x", "tok"))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(broker.pending_requests(), 1);

    assert!(broker.disconnect(&a).is_some());
    assert_eq!(broker.subscriber_count("orders"), 0);
    assert_eq!(broker.subscriber_count("prices"), 0);
    assert_eq!(broker.pending_requests(), 0);
    assert!(!broker.is_registered(&a));

    // the gathering request observes the failure instead of hanging
    let result = tokio::time::timeout(Duration::from_secs(1), gather)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(Error::NoResponses)));
}

#[test]
fn test_add_and_remove_topic() {
    let broker = broker_with(&[]);
    assert!(broker.add_topic("orders"));
    assert!(!broker.add_topic("orders"));

    let (a, _client) = connect(&broker, "channel:a");
    broker.subscribe(&a, &topics(&["orders"])).unwrap();

    assert_eq!(broker.remove_topic("orders").unwrap(), 1);
    assert!(broker.topics_of(&a).is_empty());
    assert!(matches!(
        broker.remove_topic("orders"),
        Err(Error::UnknownTopic(_))
    ));
}

#[test]
fn test_disconnect_all_returns_connections() {
    let broker = broker_with(&["orders"]);
    let (_a, _client_a) = connect(&broker, "channel:a");
    let (_b, _client_b) = connect(&broker, "channel:b");
    assert_eq!(broker.disconnect_all().len(), 2);
    assert_eq!(broker.connection_count(), 0);
}
