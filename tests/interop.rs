//! Interoperability with an independent MQTT client implementation

mod common;

use std::time::Duration;

use common::{next, TestBroker, WAIT};
use mqttd::{Client, ClientOptions, QoS};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet};
use tokio::sync::mpsc;
use tokio::time::timeout;

fn rumqttc_client(broker: &TestBroker, id: &str) -> (AsyncClient, EventLoop) {
    let mut options = MqttOptions::new(id, broker.addr.ip().to_string(), broker.addr.port());
    options.set_keep_alive(Duration::from_secs(5));
    AsyncClient::new(options, 10)
}

/// Poll until `pick` accepts an event
async fn poll_until<T>(eventloop: &mut EventLoop, mut pick: impl FnMut(Event) -> Option<T>) -> T {
    loop {
        let event = timeout(WAIT, eventloop.poll())
            .await
            .expect("timed out polling rumqttc")
            .expect("rumqttc connection failed");
        if let Some(found) = pick(event) {
            return found;
        }
    }
}

#[tokio::test]
async fn test_rumqttc_subscriber_receives_from_mqttd_client() {
    let broker = TestBroker::start().await;
    let (subscriber, mut eventloop) = rumqttc_client(&broker, "interop-sub");
    subscriber
        .subscribe("interop/#", rumqttc::QoS::AtLeastOnce)
        .await
        .unwrap();
    poll_until(&mut eventloop, |event| match event {
        Event::Incoming(Packet::SubAck(ack)) => Some(ack),
        _ => None,
    })
    .await;

    let mut publisher = Client::new(ClientOptions::new("interop-pub"));
    publisher.connect(broker.addr).await.unwrap();
    publisher
        .publish("interop/hello", "world", QoS::AtLeastOnce, false)
        .await
        .unwrap();

    let publish = poll_until(&mut eventloop, |event| match event {
        Event::Incoming(Packet::Publish(publish)) => Some(publish),
        _ => None,
    })
    .await;
    assert_eq!(publish.topic, "interop/hello");
    assert_eq!(&publish.payload[..], b"world");
    assert_eq!(publish.qos, rumqttc::QoS::AtLeastOnce);

    publisher.disconnect().await.unwrap();
    broker.stop().await;
}

#[tokio::test]
async fn test_mqttd_client_receives_from_rumqttc_publisher() {
    let broker = TestBroker::start().await;

    let (tx, mut messages) = mpsc::unbounded_channel();
    let mut subscriber = Client::new(ClientOptions::new("native-sub"));
    subscriber.callbacks_mut().on_message(move |_, message| {
        let _ = tx.send(message.clone());
    });
    subscriber.connect(broker.addr).await.unwrap();
    subscriber
        .subscribe("metrics/+", QoS::ExactlyOnce)
        .await
        .unwrap();

    let (publisher, mut eventloop) = rumqttc_client(&broker, "interop-pub");
    publisher
        .publish("metrics/load", rumqttc::QoS::ExactlyOnce, false, "0.42")
        .await
        .unwrap();
    poll_until(&mut eventloop, |event| match event {
        Event::Incoming(Packet::PubComp(_)) => Some(()),
        _ => None,
    })
    .await;

    let message = next(&mut messages).await;
    assert_eq!(message.topic, "metrics/load");
    assert_eq!(message.payload_str(), "0.42");
    assert_eq!(message.qos, QoS::ExactlyOnce);

    subscriber.disconnect().await.unwrap();
    broker.stop().await;
}
