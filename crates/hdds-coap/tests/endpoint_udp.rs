// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// End-to-end observe over loopback UDP: a client registers through the
// endpoint, then acknowledges (or ignores) confirmable notifications.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hdds_coap::endpoint::subscriber_id;
use hdds_coap::message::{code, Message, MessageType};
use hdds_coap::{Client, DeliveryOutcome, Endpoint, ObserveConfig};

const PATH: &str = "sensors/temp";
const TOKEN: &[u8] = b"tok";

fn config() -> ObserveConfig {
    ObserveConfig::default()
        .response_timeout(Duration::from_millis(200))
        .max_retransmit(1)
}

fn temperature(_from: SocketAddr, req: &Message) -> Option<Message> {
    if req.uri_path() != PATH {
        return Some(Message {
            code: code::NOT_FOUND,
            ..Message::ack_for(req)
        });
    }
    let mut resp = Message {
        code: code::CONTENT,
        token: req.token.clone(),
        ..Message::ack_for(req)
    };
    if req.observe().is_some() {
        resp = resp.with_observe(1);
    }
    Some(resp.with_payload(b"21.5".to_vec()))
}

fn notification(seq: u32) -> Message {
    Message::confirmable(code::CONTENT)
        .with_token(TOKEN)
        .with_observe(seq)
        .with_payload(b"22.0".to_vec())
}

async fn start() -> (Arc<Endpoint>, tokio::task::JoinHandle<()>, String) {
    let endpoint = Arc::new(
        Endpoint::bind("127.0.0.1:0".parse().unwrap(), config())
            .await
            .unwrap(),
    );
    let addr = endpoint.local_addr().unwrap().to_string();

    let runner = Arc::clone(&endpoint);
    let task = tokio::spawn(async move {
        runner.run(temperature).await.unwrap();
    });

    (endpoint, task, addr)
}

/// Subscriber id the endpoint derives for `client` and `token`.
fn observer_id(client: &Client, token: &[u8]) -> String {
    let port = client.local_addr().unwrap().port();
    subscriber_id(SocketAddr::from(([127, 0, 0, 1], port)), token)
}

async fn observe(client: &mut Client, path: &str, token: &[u8], value: u32) -> Message {
    let req = Message::confirmable(code::GET)
        .with_message_id(0x1001 + value as u16)
        .with_token(token)
        .with_observe(value)
        .with_uri_path(path);
    client.send(&req).await.unwrap().unwrap()
}

#[tokio::test]
async fn test_observe_and_acknowledge() {
    let (endpoint, task, addr) = start().await;
    let mut client = Client::dial(&addr, config()).await.unwrap();

    let resp = observe(&mut client, PATH, TOKEN, 0).await;
    assert_eq!(resp.kind, MessageType::Acknowledgement);
    assert_eq!(resp.message_id, 0x1001);
    assert_eq!(resp.code, code::CONTENT);
    assert_eq!(resp.payload, b"21.5");

    let dispatcher = endpoint.dispatcher().clone();
    let id = observer_id(&client, TOKEN);
    assert!(dispatcher.is_registered(PATH, id.as_str()).await.unwrap());

    let pending = {
        let dispatcher = dispatcher.clone();
        let id = id.clone();
        tokio::spawn(async move { dispatcher.notify(PATH, id, notification(2)).await })
    };

    let note = client.receive().await.unwrap();
    assert!(note.is_confirmable());
    assert_eq!(note.token, TOKEN);
    assert_eq!(note.observe(), Some(2));
    assert_ne!(note.message_id, 0);
    client.acknowledge(&note).await.unwrap();

    let outcome = pending.await.unwrap().unwrap();
    assert_eq!(outcome, DeliveryOutcome::Acknowledged { transmissions: 1 });
    assert!(dispatcher.is_registered(PATH, id.as_str()).await.unwrap());

    endpoint.shutdown();
    task.await.unwrap();
}

#[tokio::test]
async fn test_silent_observer_is_dropped() {
    let (endpoint, task, addr) = start().await;
    let mut client = Client::dial(&addr, config()).await.unwrap();
    observe(&mut client, PATH, TOKEN, 0).await;

    let dispatcher = endpoint.dispatcher().clone();
    let id = observer_id(&client, TOKEN);
    let pending = {
        let dispatcher = dispatcher.clone();
        let id = id.clone();
        tokio::spawn(async move { dispatcher.notify(PATH, id, notification(2)).await })
    };

    // Original send plus one retransmission, same transaction id.
    let first = client.receive().await.unwrap();
    let second = client.receive().await.unwrap();
    assert_eq!(first.message_id, second.message_id);

    let outcome = pending.await.unwrap().unwrap();
    assert_eq!(outcome, DeliveryOutcome::Exhausted { transmissions: 2 });
    assert!(!dispatcher.is_registered(PATH, id.as_str()).await.unwrap());

    endpoint.shutdown();
    task.await.unwrap();
}

#[tokio::test]
async fn test_observe_cancel() {
    let (endpoint, task, addr) = start().await;
    let mut client = Client::dial(&addr, config()).await.unwrap();
    observe(&mut client, PATH, TOKEN, 0).await;

    let dispatcher = endpoint.dispatcher();
    assert_eq!(dispatcher.subscriber_count(PATH).await.unwrap(), 1);

    observe(&mut client, PATH, TOKEN, 1).await;
    assert_eq!(dispatcher.subscriber_count(PATH).await.unwrap(), 0);

    endpoint.shutdown();
    task.await.unwrap();
}

#[tokio::test]
async fn test_observe_of_unknown_resource_is_not_registered() {
    let (endpoint, task, addr) = start().await;
    let mut client = Client::dial(&addr, config()).await.unwrap();

    let resp = observe(&mut client, "sensors/none", b"t", 0).await;
    assert_eq!(resp.code, code::NOT_FOUND);

    let dispatcher = endpoint.dispatcher();
    assert_eq!(dispatcher.subscriber_count("sensors/none").await.unwrap(), 0);
    assert_eq!(dispatcher.stats().await.unwrap().registered, 0);

    endpoint.shutdown();
    task.await.unwrap();
}

#[tokio::test]
async fn test_clients_sharing_a_token_observe_independently() {
    let (endpoint, task, addr) = start().await;
    let mut a = Client::dial(&addr, config()).await.unwrap();
    let mut b = Client::dial(&addr, config()).await.unwrap();

    observe(&mut a, PATH, b"", 0).await;
    observe(&mut b, PATH, b"", 0).await;

    let dispatcher = endpoint.dispatcher();
    assert_eq!(dispatcher.subscriber_count(PATH).await.unwrap(), 2);
    assert_eq!(dispatcher.stats().await.unwrap().replaced, 0);

    // A's cancel leaves B's observation alone.
    observe(&mut a, PATH, b"", 1).await;
    assert_eq!(dispatcher.subscriber_count(PATH).await.unwrap(), 1);
    let id_b = observer_id(&b, b"");
    assert!(dispatcher.is_registered(PATH, id_b.as_str()).await.unwrap());

    endpoint.shutdown();
    task.await.unwrap();
}
