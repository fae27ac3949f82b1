//! Integration tests for inbound ordering, bundling and flow control.

mod common;

use std::time::Duration;

use common::{KvCommand, addresses, init_tracing, settle, three_nodes};
use gridwire_transport::{
    BundlerConfig, DeliverOrder, FlowControlConfig, FrameKind, JsonMarshaller, Marshaller,
    MapResponseCollector, NO_REQUEST_ID, TransportConfig,
    wire::{decode_batch, decode_frame, encode_frame},
};

fn run<F: std::future::Future<Output = ()>>(test: F) -> impl std::future::Future<Output = ()> {
    init_tracing();
    let local = tokio::task::LocalSet::new();
    async move { local.run_until(test).await }
}

fn slow_record(tag: u32, delay_ms: u64) -> KvCommand {
    KvCommand::Record { tag, delay_ms }
}

fn bundling() -> TransportConfig {
    TransportConfig::default().with_bundler(BundlerConfig {
        enabled: true,
        max_bundle_size: 64 * 1024,
    })
}

fn put(key: &str) -> KvCommand {
    KvCommand::Put {
        key: key.to_string(),
        value: "v".to_string(),
    }
}

/// Bytes a one-way `command` occupies on the wire.
fn wire_size(command: &KvCommand) -> u64 {
    let payload = JsonMarshaller.encode(command).expect("encode");
    encode_frame(FrameKind::SingleMessage, NO_REQUEST_ID, &payload)
        .expect("frame")
        .len() as u64
}

#[tokio::test(start_paused = true)]
async fn test_per_sender_order_serializes_execution() {
    run(async {
        let (_cluster, nodes) = three_nodes(TransportConfig::default());
        let sender = &nodes[0].transport;
        let target = &nodes[1].address;

        sender
            .send_to(target, &slow_record(1, 50), DeliverOrder::PerSender)
            .await
            .expect("sent");
        sender
            .send_to(target, &slow_record(2, 0), DeliverOrder::PerSender)
            .await
            .expect("sent");
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(nodes[1].handler.tags(), vec![1, 2]);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_unordered_messages_run_concurrently() {
    run(async {
        let (_cluster, nodes) = three_nodes(TransportConfig::default());
        let sender = &nodes[0].transport;
        let target = &nodes[1].address;

        sender
            .send_to(target, &slow_record(1, 50), DeliverOrder::None)
            .await
            .expect("sent");
        sender
            .send_to(target, &slow_record(2, 0), DeliverOrder::None)
            .await
            .expect("sent");
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(nodes[1].handler.tags(), vec![2, 1]);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_senders_do_not_block_each_other() {
    run(async {
        let (_cluster, nodes) = three_nodes(TransportConfig::default());
        let target = &nodes[2].address;

        nodes[0]
            .transport
            .send_to(target, &slow_record(1, 50), DeliverOrder::PerSender)
            .await
            .expect("sent");
        nodes[1]
            .transport
            .send_to(target, &slow_record(2, 0), DeliverOrder::PerSender)
            .await
            .expect("sent");
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(
            nodes[2].handler.records(),
            vec![("n2".to_string(), 2), ("n1".to_string(), 1)]
        );
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_non_blocking_commands_skip_the_sender_chain() {
    run(async {
        let (_cluster, nodes) = three_nodes(TransportConfig::default());
        let caller = nodes[0].transport.clone();
        let target = nodes[1].address.clone();

        caller
            .send_to(&target, &slow_record(1, 1_000), DeliverOrder::PerSender)
            .await
            .expect("sent");
        let response = caller
            .invoke_command(
                &target,
                &KvCommand::Ping,
                gridwire_transport::SingleResponseCollector::valid_only(),
                DeliverOrder::PerSender,
                Duration::from_secs(5),
            )
            .await
            .expect("ping is answered");

        assert_eq!(response, gridwire_transport::Response::success("n2".to_string()));
        assert!(nodes[1].handler.tags().is_empty(), "the slow record is still running");
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_bundler_batches_queued_frames_in_order() {
    run(async {
        let (cluster, nodes) = three_nodes(bundling());
        let sender = &nodes[0].transport;
        let target = &nodes[1].address;

        for tag in 1..=5 {
            sender
                .send_to(target, &slow_record(tag, 0), DeliverOrder::PerSender)
                .await
                .expect("queued");
        }
        settle().await;

        let sent = cluster.sent_to(&nodes[0].address, target);
        assert_eq!(sent.len(), 1);
        let batch = decode_frame(&sent[0].payload).expect("frame");
        assert_eq!(batch.kind, FrameKind::Batch);
        assert_eq!(decode_batch(&batch.payload).expect("batch").len(), 5);
        assert_eq!(nodes[1].handler.tags(), vec![1, 2, 3, 4, 5]);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_calls_round_trip_through_the_bundler() {
    run(async {
        let (_cluster, nodes) = three_nodes(bundling());

        let responses = nodes[0]
            .transport
            .invoke_commands(
                &addresses(&nodes),
                &KvCommand::Whoami,
                MapResponseCollector::new(false, 2),
                DeliverOrder::PerSender,
                Duration::from_secs(5),
            )
            .await
            .expect("both answer");
        assert_eq!(responses.len(), 2);

        // stopping flushes, later responses bypass the bundler
        nodes[1].transport.stop();
        let response = nodes[0]
            .transport
            .invoke_command(
                &nodes[1].address,
                &KvCommand::Whoami,
                gridwire_transport::SingleResponseCollector::ignore_leavers(),
                DeliverOrder::PerSender,
                Duration::from_secs(5),
            )
            .await
            .expect("stopped member still answers");
        assert_eq!(response, gridwire_transport::Response::NotFound);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_sends_wait_for_credits() {
    run(async {
        let window = wire_size(&put("k1"));
        let config = TransportConfig::default().with_flow_control(FlowControlConfig {
            enabled: true,
            max_credits: window,
        });
        let (cluster, nodes) = three_nodes(config);
        let target = nodes[1].address.clone();

        nodes[0]
            .transport
            .send_to(&target, &put("k1"), DeliverOrder::PerSender)
            .await
            .expect("within the window");

        let sender = nodes[0].transport.clone();
        let blocked_target = target.clone();
        let blocked = tokio::task::spawn_local(async move {
            sender
                .send_to(&blocked_target, &put("k2"), DeliverOrder::PerSender)
                .await
        });
        settle().await;
        assert!(!blocked.is_finished());
        assert_eq!(cluster.sent_to(&nodes[0].address, &target).len(), 1);
        assert_eq!(nodes[1].handler.get("k2"), None);

        // credits from another member do not help
        nodes[0].transport.on_credits(Some(&nodes[2].address), window);
        settle().await;
        assert!(!blocked.is_finished());

        nodes[0].transport.on_credits(Some(&target), window);
        blocked.await.expect("task").expect("sent once credited");
        settle().await;
        assert_eq!(nodes[1].handler.get("k2").as_deref(), Some("v"));
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_sends_queued_for_a_leaver_are_discarded() {
    run(async {
        let window = wire_size(&put("k1"));
        let config = TransportConfig::default().with_flow_control(FlowControlConfig {
            enabled: true,
            max_credits: window,
        });
        let (cluster, nodes) = three_nodes(config);
        let target = nodes[1].address.clone();

        nodes[0]
            .transport
            .send_to(&target, &put("k1"), DeliverOrder::PerSender)
            .await
            .expect("within the window");
        let sender = nodes[0].transport.clone();
        let blocked_target = target.clone();
        let blocked = tokio::task::spawn_local(async move {
            sender
                .send_to(&blocked_target, &put("k2"), DeliverOrder::PerSender)
                .await
        });
        settle().await;

        cluster.install_view(2, &[nodes[0].address.clone(), nodes[2].address.clone()]);
        blocked.await.expect("task").expect("released without sending");
        settle().await;

        assert_eq!(cluster.sent_to(&nodes[0].address, &target).len(), 1);
        assert_eq!(nodes[1].handler.get("k2"), None);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_deferred_response_is_released_by_credits() {
    run(async {
        let window = wire_size(&put("k1"));
        let config = TransportConfig::default().with_flow_control(FlowControlConfig {
            enabled: true,
            max_credits: window,
        });
        let (_cluster, nodes) = three_nodes(config);

        // n2 spends its window towards n1 before answering n1
        nodes[1]
            .transport
            .send_to(&nodes[0].address, &put("k1"), DeliverOrder::PerSender)
            .await
            .expect("within the window");

        let caller = nodes[0].transport.clone();
        let target = nodes[1].address.clone();
        let call = tokio::task::spawn_local(async move {
            caller
                .invoke_command(
                    &target,
                    &KvCommand::Whoami,
                    gridwire_transport::SingleResponseCollector::valid_only(),
                    DeliverOrder::PerSender,
                    Duration::from_secs(5),
                )
                .await
        });
        settle().await;
        assert!(!call.is_finished(), "the response waits for credits");

        nodes[1].transport.on_credits(Some(&nodes[0].address), window);
        let response = call.await.expect("task").expect("answered");
        assert_eq!(response, gridwire_transport::Response::success("n2".to_string()));
    })
    .await;
}
