//! End-to-end bridge scenarios against the in-memory broker.

use std::sync::Arc;

use futures::{stream, StreamExt};

use rabbit_flux::options::{ConsumeOptions, OverflowStrategy, SendOptions};
use rabbit_flux::testing::MemoryBroker;
use rabbit_flux::topology::{BindingSpecification, ExchangeSpecification, QueueSpecification};
use rabbit_flux::{OutboundMessage, Receiver, Sender};

fn message(queue: &str, index: u32) -> OutboundMessage {
    OutboundMessage::new("", queue, index.to_be_bytes().to_vec())
}

fn index_of(body: &[u8]) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(body);
    u32::from_be_bytes(bytes)
}

#[tokio::test]
async fn test_create_resources_publish_consume() {
    let broker = MemoryBroker::new();
    let sender = Sender::new(broker.connector());
    let receiver = Receiver::new(broker.connector());

    sender
        .declare_exchange(&ExchangeSpecification::exchange("events").kind("direct"))
        .await
        .unwrap();
    let queue = sender
        .declare_queue(&QueueSpecification::queue(""))
        .await
        .unwrap()
        .queue;
    sender
        .bind(
            &BindingSpecification::binding()
                .exchange("events")
                .queue(&queue)
                .routing_key("order.created"),
        )
        .await
        .unwrap();

    let mut stream = receiver
        .consume_no_ack(&queue, ConsumeOptions::new())
        .await
        .unwrap();

    sender
        .send(stream::iter(vec![OutboundMessage::new(
            "events",
            "order.created",
            b"payload".to_vec(),
        )]))
        .await
        .unwrap();

    let delivery = stream.next().await.unwrap().unwrap();
    assert_eq!(delivery.exchange, "events");
    assert_eq!(delivery.routing_key, "order.created");
    assert_eq!(delivery.body, b"payload");
    stream.dispose().await;
}

#[tokio::test]
async fn test_sink_publishes_in_arrival_order() {
    let broker = MemoryBroker::new();
    let sender = Sender::new(broker.connector());
    let receiver = Receiver::new(broker.connector());
    sender
        .declare_queue(&QueueSpecification::queue("ordered"))
        .await
        .unwrap();

    sender
        .send(stream::iter((0..50).map(|i| message("ordered", i))))
        .await
        .unwrap();

    let stream = receiver
        .consume_no_ack("ordered", ConsumeOptions::new())
        .await
        .unwrap();
    let received: Vec<u32> = stream
        .take(50)
        .map(|item| index_of(&item.unwrap().body))
        .collect()
        .await;

    assert_eq!(received, (0..50).collect::<Vec<u32>>());
}

#[tokio::test]
async fn test_buffer_strategy_is_lossless_for_slow_subscriber() {
    let broker = MemoryBroker::new();
    let sender = Sender::new(broker.connector());
    let receiver = Receiver::new(broker.connector());
    sender
        .declare_queue(&QueueSpecification::queue("firehose"))
        .await
        .unwrap();

    // Subscribe first, then let the broker push everything before the
    // subscriber polls once.
    let stream = receiver
        .consume_auto_ack("firehose", ConsumeOptions::new())
        .await
        .unwrap();
    sender
        .send(stream::iter((0..500).map(|i| message("firehose", i))))
        .await
        .unwrap();

    let mut stream = stream;
    let mut received = 0u32;
    while received < 500 {
        let delivery = stream.next().await.unwrap().unwrap();
        assert_eq!(index_of(&delivery.body), received);
        received += 1;
        tokio::task::yield_now().await;
    }
    assert_eq!(receiver.metrics().auto_acks, 500);
    assert_eq!(broker.unacked_count("firehose"), 0);
    stream.dispose().await;
}

#[tokio::test]
async fn test_drop_strategy_sheds_load_without_terminating() {
    let broker = MemoryBroker::new();
    let sender = Sender::new(broker.connector());
    let receiver = Receiver::new(broker.connector());
    sender
        .declare_queue(&QueueSpecification::queue("bursty"))
        .await
        .unwrap();

    let mut stream = receiver
        .consume_no_ack(
            "bursty",
            ConsumeOptions::new()
                .overflow_strategy(OverflowStrategy::Drop)
                .buffer_capacity(4),
        )
        .await
        .unwrap();

    sender
        .send(stream::iter((0..50).map(|i| message("bursty", i))))
        .await
        .unwrap();

    // The buffered prefix arrives; the overflow was shed silently.
    for expected in 0..4 {
        let delivery = stream.next().await.unwrap().unwrap();
        assert_eq!(index_of(&delivery.body), expected);
    }
    assert_eq!(receiver.metrics().deliveries_dropped, 46);

    // The stream is still live: later publishes flow through.
    sender
        .send(stream::iter(vec![message("bursty", 99)]))
        .await
        .unwrap();
    let delivery = stream.next().await.unwrap().unwrap();
    assert_eq!(index_of(&delivery.body), 99);
    stream.dispose().await;
}

#[tokio::test]
async fn test_manual_ack_backlog_drains_under_prefetch() {
    let broker = MemoryBroker::new();
    let sender = Sender::new(broker.connector());
    let receiver = Receiver::new(broker.connector());
    sender
        .declare_queue(&QueueSpecification::queue("jobs"))
        .await
        .unwrap();
    sender
        .send(stream::iter((0..100).map(|i| message("jobs", i))))
        .await
        .unwrap();

    let mut stream = receiver
        .consume_manual_ack("jobs", ConsumeOptions::new().prefetch(10))
        .await
        .unwrap();

    let mut acked = 0u32;
    while acked < 100 {
        let delivery = stream.next().await.unwrap().unwrap();
        assert_eq!(index_of(&delivery.delivery().body), acked);
        delivery.ack().await.unwrap();
        acked += 1;
    }

    broker.wait_for_idle().await;
    assert_eq!(broker.ready_count("jobs"), 0);
    assert_eq!(broker.unacked_count("jobs"), 0);
    stream.dispose().await;
}

#[tokio::test]
async fn test_shovel_between_queues() {
    let broker = MemoryBroker::new();
    let sender = Sender::new(broker.connector());
    let receiver = Receiver::new(broker.connector());
    sender
        .declare_queue(&QueueSpecification::queue("source"))
        .await
        .unwrap();
    sender
        .declare_queue(&QueueSpecification::queue("dest"))
        .await
        .unwrap();
    sender
        .send(stream::iter((0..20).map(|i| message("source", i))))
        .await
        .unwrap();

    // Move everything: republish, then settle the original.
    let mut stream = receiver
        .consume_manual_ack("source", ConsumeOptions::new())
        .await
        .unwrap();
    for _ in 0..20 {
        let delivery = stream.next().await.unwrap().unwrap();
        let body = delivery.delivery().body.clone();
        sender
            .send_with_options(
                stream::iter(vec![OutboundMessage::new("", "dest", body)]),
                SendOptions::confirmed(),
            )
            .await
            .unwrap();
        delivery.ack().await.unwrap();
    }
    stream.dispose().await;
    broker.wait_for_idle().await;

    assert_eq!(broker.ready_count("source"), 0);
    assert_eq!(broker.unacked_count("source"), 0);
    assert_eq!(broker.ready_count("dest"), 20);

    // The shovelled messages arrive in their original order.
    let out = receiver
        .consume_no_ack("dest", ConsumeOptions::new())
        .await
        .unwrap();
    let received: Vec<u32> = out
        .take(20)
        .map(|item| index_of(&item.unwrap().body))
        .collect()
        .await;
    assert_eq!(received, (0..20).collect::<Vec<u32>>());
}

#[tokio::test]
async fn test_broker_cancel_completes_all_consumers_cleanly() {
    let broker = MemoryBroker::new();
    let receiver = Receiver::new(broker.connector());
    let sender = Sender::new(broker.connector());
    sender
        .declare_queue(&QueueSpecification::queue("ephemeral"))
        .await
        .unwrap();

    let mut stream = receiver
        .consume_no_ack("ephemeral", ConsumeOptions::new())
        .await
        .unwrap();
    sender
        .send(stream::iter(vec![message("ephemeral", 1)]))
        .await
        .unwrap();
    assert!(stream.next().await.unwrap().is_ok());

    broker.delete_queue("ephemeral").await;
    // Clean completion, not an error.
    assert!(stream.next().await.is_none());
    broker.wait_for_idle().await;
    assert_eq!(broker.open_channel_count(), 0);
}

#[tokio::test]
async fn test_stop_condition_limits_stream_and_tears_down() {
    let broker = MemoryBroker::new();
    let sender = Sender::new(broker.connector());
    let receiver = Receiver::new(broker.connector());
    sender
        .declare_queue(&QueueSpecification::queue("limited"))
        .await
        .unwrap();
    sender
        .send(stream::iter((0..10).map(|i| message("limited", i))))
        .await
        .unwrap();

    let stream = receiver
        .consume_no_ack(
            "limited",
            ConsumeOptions::new().stop_condition(|state, _| state.emitted >= 5),
        )
        .await
        .unwrap();
    let tag = stream.consumer_tag().to_string();

    let received: Vec<u32> = stream
        .map(|item| index_of(&item.unwrap().body))
        .collect()
        .await;
    assert_eq!(received, (0..5).collect::<Vec<u32>>());

    broker.wait_for_idle().await;
    assert!(!broker.has_consumer(&tag));
}

#[tokio::test]
async fn test_connection_shared_within_and_split_across_roles() {
    let broker = MemoryBroker::new();
    let connector = broker.connector();
    let sender = Sender::new(Arc::clone(&connector));
    let receiver = Receiver::new(connector);
    sender
        .declare_queue(&QueueSpecification::queue("a"))
        .await
        .unwrap();
    sender
        .declare_queue(&QueueSpecification::queue("b"))
        .await
        .unwrap();

    let s1 = receiver.consume_no_ack("a", ConsumeOptions::new()).await.unwrap();
    let s2 = receiver.consume_no_ack("b", ConsumeOptions::new()).await.unwrap();

    // One connection per role, one channel per stream.
    assert_eq!(broker.connect_attempts(), 2);
    assert_eq!(broker.open_channel_count(), 2);

    s1.dispose().await;
    s2.dispose().await;
    broker.wait_for_idle().await;
    assert_eq!(broker.open_channel_count(), 0);

    receiver.close().await.unwrap();
    sender.close().await.unwrap();
}
