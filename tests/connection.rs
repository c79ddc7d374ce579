mod testsupport;

use std::time::Duration;

use gregor::prelude::{
    protocol, BrokerChannel, BrokerEndpoint, CancellationToken, ChannelConfig, Compression, Error,
    TcpChannel,
};
use testsupport::{find_coordinator_body, MockBroker, Reply};

async fn connect(broker: &MockBroker, config: ChannelConfig) -> TcpChannel {
    let endpoint = BrokerEndpoint::resolve("127.0.0.1", broker.port()).unwrap();
    TcpChannel::connect(endpoint, config).await.unwrap()
}

#[tokio::test]
async fn responses_match_requests_regardless_of_arrival_order() {
    // slower replies for earlier requests force out-of-order arrival
    let broker = MockBroker::spawn(|frame| {
        let key = testsupport::coordinator_key(&frame.body);
        let (node_id, delay_ms) = match key.as_str() {
            "first" => (1, 300),
            "second" => (2, 150),
            _ => (3, 0),
        };
        Reply::Delayed(
            find_coordinator_body(0, node_id, "localhost", 9092),
            Duration::from_millis(delay_ms),
        )
    })
    .await;

    let channel = connect(&broker, ChannelConfig::default()).await;
    let cancel = CancellationToken::new();

    let send = |key: &'static str| {
        let channel = channel.clone();
        let cancel = cancel.clone();
        async move {
            let request = protocol::FindCoordinatorRequest::new(0, "test", key);
            let bytes = channel.send(&request, None, &cancel).await.unwrap().unwrap();
            protocol::FindCoordinatorResponse::try_from(bytes).unwrap()
        }
    };

    let (first, second, third) = tokio::join!(send("first"), send("second"), send("third"));

    assert_eq!(first.node_id, 1);
    assert_eq!(second.node_id, 2);
    assert_eq!(third.node_id, 3);
}

#[tokio::test]
async fn fire_and_forget_send_resolves_without_response() {
    let broker = MockBroker::spawn(|_| Reply::Ignore).await;
    let channel = connect(&broker, ChannelConfig::default()).await;

    let mut request = protocol::ProduceRequest::new(
        0, // acks: no response will ever come
        1000,
        0,
        "test",
        protocol::Attributes::new(Compression::None),
    );
    request.add(
        "purchases",
        0,
        None,
        Some(bytes::Bytes::from_static(b"value")),
        vec![],
        None,
    );

    let response = channel
        .send(&request, None, &CancellationToken::new())
        .await
        .unwrap();
    assert!(response.is_none());
}

#[tokio::test]
async fn timed_out_send_abandons_its_correlation_id() {
    let broker = MockBroker::spawn(|frame| {
        let key = testsupport::coordinator_key(&frame.body);
        if key == "slow" {
            Reply::Delayed(
                find_coordinator_body(0, 9, "localhost", 9092),
                Duration::from_millis(300),
            )
        } else {
            Reply::Body(find_coordinator_body(0, 1, "localhost", 9092))
        }
    })
    .await;

    let config = ChannelConfig {
        request_timeout: Duration::from_millis(100),
        ..ChannelConfig::default()
    };
    let channel = connect(&broker, config).await;
    let cancel = CancellationToken::new();

    let request = protocol::FindCoordinatorRequest::new(0, "test", "slow");
    let result = channel.send(&request, None, &cancel).await;
    assert_eq!(result, Err(Error::Timeout));

    // the late response arrives while we sleep; it must be discarded,
    // not treated as a protocol desync
    tokio::time::sleep(Duration::from_millis(400)).await;

    let request = protocol::FindCoordinatorRequest::new(0, "test", "fast");
    let bytes = channel.send(&request, None, &cancel).await.unwrap().unwrap();
    let response = protocol::FindCoordinatorResponse::try_from(bytes).unwrap();
    assert_eq!(response.node_id, 1);
}

#[tokio::test]
async fn cancelled_send_leaves_other_requests_alone() {
    let broker = MockBroker::spawn(|frame| {
        let key = testsupport::coordinator_key(&frame.body);
        if key == "doomed" {
            Reply::Ignore
        } else {
            Reply::Delayed(
                find_coordinator_body(0, 5, "localhost", 9092),
                Duration::from_millis(100),
            )
        }
    })
    .await;

    let channel = connect(&broker, ChannelConfig::default()).await;
    let doomed_cancel = CancellationToken::new();

    let doomed = {
        let channel = channel.clone();
        let cancel = doomed_cancel.clone();
        tokio::spawn(async move {
            let request = protocol::FindCoordinatorRequest::new(0, "test", "doomed");
            channel.send(&request, None, &cancel).await
        })
    };
    let survivor = {
        let channel = channel.clone();
        tokio::spawn(async move {
            let request = protocol::FindCoordinatorRequest::new(0, "test", "survivor");
            channel.send(&request, None, &CancellationToken::new()).await
        })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    doomed_cancel.cancel();

    assert_eq!(doomed.await.unwrap(), Err(Error::Cancelled));
    let bytes = survivor.await.unwrap().unwrap().unwrap();
    let response = protocol::FindCoordinatorResponse::try_from(bytes).unwrap();
    assert_eq!(response.node_id, 5);
}

#[tokio::test]
async fn socket_loss_fails_pending_and_future_sends() {
    let broker = MockBroker::spawn(|frame| {
        let key = testsupport::coordinator_key(&frame.body);
        if key == "kill" {
            Reply::Close
        } else {
            Reply::Ignore
        }
    })
    .await;

    let channel = connect(&broker, ChannelConfig::default()).await;
    let cancel = CancellationToken::new();

    let pending = {
        let channel = channel.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let request = protocol::FindCoordinatorRequest::new(0, "test", "waiting");
            channel.send(&request, None, &cancel).await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let request = protocol::FindCoordinatorRequest::new(0, "test", "kill");
    let _ = channel.send(&request, None, &cancel).await;

    // the pending request fails with a connection error once the
    // socket drops
    let pending = pending.await.unwrap();
    assert!(pending.is_err());
    assert!(matches!(
        pending.unwrap_err(),
        Error::IoError(_) | Error::ConnectionClosed(_)
    ));

    // the channel is poisoned for good
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(channel.is_closed());
    let request = protocol::FindCoordinatorRequest::new(0, "test", "after");
    assert!(channel.send(&request, None, &cancel).await.is_err());
}

#[tokio::test]
async fn close_fails_in_flight_sends() {
    let broker = MockBroker::spawn(|_| Reply::Ignore).await;
    let channel = connect(&broker, ChannelConfig::default()).await;

    let pending = {
        let channel = channel.clone();
        tokio::spawn(async move {
            let request = protocol::FindCoordinatorRequest::new(0, "test", "waiting");
            channel.send(&request, None, &CancellationToken::new()).await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    channel.close();

    assert!(pending.await.unwrap().is_err());
    assert!(channel.is_closed());
}
