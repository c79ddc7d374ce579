mod testsupport;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gregor::prelude::{
    BrokerChannel, CancellationToken, Error, Router, RouterConfig, TcpChannel,
};
use testsupport::{find_coordinator_body, metadata_body, MockBroker, Reply};

const API_KEY_METADATA: i16 = 3;

fn test_config() -> RouterConfig {
    RouterConfig {
        // long enough that one refresh serves a whole test
        cache_expiration: Duration::from_secs(30),
        ..RouterConfig::default()
    }
}

#[tokio::test]
async fn routes_partitions_to_their_leaders() {
    testsupport::init_tracing();

    // two brokers; partition 0 led by broker 0, partition 1 by broker 1.
    // A handler cannot name its own broker's port before the spawn, so
    // the ports travel through a cell filled in afterwards.
    let ports = Arc::new(std::sync::Mutex::new((0u16, 0u16)));
    let handler = {
        let ports = ports.clone();
        move |frame: testsupport::RequestFrame| {
            assert_eq!(frame.api_key, API_KEY_METADATA);
            let (port_a, port_b) = *ports.lock().unwrap();
            Reply::Body(metadata_body(
                &[(0, "127.0.0.1", port_a), (1, "127.0.0.1", port_b)],
                &[("UnitTest", vec![(0, 0), (1, 1)])],
            ))
        }
    };
    let broker_a = MockBroker::spawn(handler.clone()).await;
    let broker_b = MockBroker::spawn(handler).await;
    *ports.lock().unwrap() = (broker_a.port(), broker_b.port());

    let router = Router::<TcpChannel>::connect(
        vec![broker_a.addr_string(), broker_b.addr_string()],
        test_config(),
    )
    .await
    .unwrap();

    let cancel = CancellationToken::new();
    router
        .refresh_topics(&[String::from("UnitTest")], &cancel)
        .await
        .unwrap();

    let route = router.route_to_partition("UnitTest", 0).unwrap();
    assert_eq!(route.connection.endpoint().port, broker_a.port());
    assert_eq!(route.topic, "UnitTest");
    assert_eq!(route.partition_id, 0);

    let route = router.route_to_partition("UnitTest", 1).unwrap();
    assert_eq!(route.connection.endpoint().port, broker_b.port());

    // unknown partitions and topics are cache misses
    assert!(matches!(
        router.route_to_partition("UnitTest", 9),
        Err(Error::CachedMetadata {
            partition: Some(9),
            ..
        })
    ));
    assert!(matches!(
        router.route_to_partition("NoSuchTopic", 0),
        Err(Error::CachedMetadata { .. })
    ));

    router.shutdown();
}

#[tokio::test]
async fn electing_leader_is_not_routable_but_healthy_partition_is() {
    let ports = Arc::new(std::sync::Mutex::new(0u16));
    let ports_for_handler = ports.clone();
    let broker = MockBroker::spawn(move |_| {
        let port = *ports_for_handler.lock().unwrap();
        // partition 0 is mid-election, partition 1 has a valid leader
        Reply::Body(metadata_body(
            &[(1, "127.0.0.1", port)],
            &[("UnitTest", vec![(0, -1), (1, 1)])],
        ))
    })
    .await;
    *ports.lock().unwrap() = broker.port();

    let router =
        Router::<TcpChannel>::connect(vec![broker.addr_string()], test_config()).await.unwrap();

    let cancel = CancellationToken::new();
    let refreshed = router
        .refresh_topics(&[String::from("UnitTest")], &cancel)
        .await;
    assert!(matches!(
        refreshed,
        Err(Error::CachedMetadata {
            partition: Some(0),
            ..
        })
    ));

    assert!(matches!(
        router.route_to_partition("UnitTest", 0),
        Err(Error::CachedMetadata {
            partition: Some(0),
            ..
        })
    ));
    let route = router.route_to_partition("UnitTest", 1).unwrap();
    assert_eq!(route.connection.endpoint().port, broker.port());

    router.shutdown();
}

#[tokio::test]
async fn refreshing_unchanged_metadata_is_idempotent() {
    let ports = Arc::new(std::sync::Mutex::new(0u16));
    let ports_for_handler = ports.clone();
    let broker = MockBroker::spawn(move |_| {
        let port = *ports_for_handler.lock().unwrap();
        Reply::Body(metadata_body(
            &[(0, "127.0.0.1", port)],
            &[("UnitTest", vec![(0, 0), (1, 0)])],
        ))
    })
    .await;
    *ports.lock().unwrap() = broker.port();

    let config = RouterConfig {
        cache_expiration: Duration::from_millis(1),
        ..RouterConfig::default()
    };
    let router =
        Router::<TcpChannel>::connect(vec![broker.addr_string()], config).await.unwrap();

    let cancel = CancellationToken::new();
    router
        .refresh_topics(&[String::from("UnitTest")], &cancel)
        .await
        .unwrap();
    let first = router.topic_metadata("UnitTest").unwrap();

    tokio::time::sleep(Duration::from_millis(5)).await;
    router
        .refresh_topics(&[String::from("UnitTest")], &cancel)
        .await
        .unwrap();
    let second = router.topic_metadata("UnitTest").unwrap();

    assert_eq!(first, second);
    assert_eq!(broker.request_count(API_KEY_METADATA), 2);

    router.shutdown();
}

#[tokio::test]
async fn construction_fails_with_zero_resolvable_seeds() {
    let result = Router::<TcpChannel>::connect(
        vec![String::from("seed.invalid.gregor.test:9092")],
        test_config(),
    )
    .await;

    assert!(matches!(result, Err(Error::NoBrokerReachable(_))));
}

#[tokio::test]
async fn construction_tolerates_some_unresolvable_seeds() {
    let broker = MockBroker::spawn(|_| Reply::Ignore).await;

    let router = Router::<TcpChannel>::connect(
        vec![
            String::from("seed.invalid.gregor.test:9092"),
            broker.addr_string(),
        ],
        test_config(),
    )
    .await;

    assert!(router.is_ok());
    router.unwrap().shutdown();
}

#[tokio::test]
async fn concurrent_cache_misses_share_one_metadata_request() {
    let ports = Arc::new(std::sync::Mutex::new(0u16));
    let ports_for_handler = ports.clone();
    let broker = MockBroker::spawn(move |_| {
        let port = *ports_for_handler.lock().unwrap();
        Reply::Body(metadata_body(
            &[(0, "127.0.0.1", port)],
            &[("UnitTest", vec![(0, 0)])],
        ))
    })
    .await;
    *ports.lock().unwrap() = broker.port();

    let router =
        Router::<TcpChannel>::connect(vec![broker.addr_string()], test_config()).await.unwrap();

    let cancel = CancellationToken::new();
    let a = router.route_to_partition_refreshing("UnitTest", 0, &cancel);
    let b = router.route_to_partition_refreshing("UnitTest", 0, &cancel);
    let (a, b) = tokio::join!(a, b);

    assert!(a.is_ok());
    assert!(b.is_ok());
    // the loser of the refresh race found the entry fresh under the
    // lock and never touched the wire
    assert_eq!(broker.request_count(API_KEY_METADATA), 1);

    router.shutdown();
}

#[tokio::test]
async fn broker_moving_endpoints_gets_a_new_connection() {
    // the same broker id is advertised first at old_home, then at
    // new_home
    let old_home = Arc::new(AtomicUsize::new(0));
    let new_home = Arc::new(AtomicUsize::new(0));
    let refresh_count = Arc::new(AtomicUsize::new(0));

    let make_handler = |old_home: Arc<AtomicUsize>,
                        new_home: Arc<AtomicUsize>,
                        refresh_count: Arc<AtomicUsize>| {
        move |_frame: testsupport::RequestFrame| {
            let count = refresh_count.fetch_add(1, Ordering::SeqCst);
            let port = if count == 0 {
                old_home.load(Ordering::SeqCst) as u16
            } else {
                new_home.load(Ordering::SeqCst) as u16
            };
            Reply::Body(metadata_body(
                &[(0, "127.0.0.1", port)],
                &[("UnitTest", vec![(0, 0)])],
            ))
        }
    };

    let broker_old = MockBroker::spawn(make_handler(
        old_home.clone(),
        new_home.clone(),
        refresh_count.clone(),
    ))
    .await;
    let broker_new = MockBroker::spawn(make_handler(
        old_home.clone(),
        new_home.clone(),
        refresh_count.clone(),
    ))
    .await;
    old_home.store(broker_old.port() as usize, Ordering::SeqCst);
    new_home.store(broker_new.port() as usize, Ordering::SeqCst);

    let config = RouterConfig {
        cache_expiration: Duration::from_millis(1),
        ..RouterConfig::default()
    };
    let router = Router::<TcpChannel>::connect(vec![broker_old.addr_string()], config)
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    router
        .refresh_topics(&[String::from("UnitTest")], &cancel)
        .await
        .unwrap();
    let first = router.route_to_partition("UnitTest", 0).unwrap();
    assert_eq!(first.connection.endpoint().port, broker_old.port());

    tokio::time::sleep(Duration::from_millis(5)).await;
    router
        .refresh_topics(&[String::from("UnitTest")], &cancel)
        .await
        .unwrap();
    let second = router.route_to_partition("UnitTest", 0).unwrap();
    assert_eq!(second.connection.endpoint().port, broker_new.port());

    // the replaced connection was disposed once the maps swapped
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(first.connection.is_closed());

    router.shutdown();
}

#[tokio::test]
async fn group_lookups_route_to_the_coordinator() {
    const API_KEY_FIND_COORDINATOR: i16 = 10;

    let coordinator = MockBroker::spawn(|_| Reply::Ignore).await;
    let coordinator_port = coordinator.port();

    let broker = MockBroker::spawn(move |frame| {
        if frame.api_key == API_KEY_FIND_COORDINATOR {
            Reply::Body(find_coordinator_body(0, 7, "127.0.0.1", coordinator_port))
        } else {
            Reply::Body(metadata_body(&[], &[]))
        }
    })
    .await;

    let router =
        Router::<TcpChannel>::connect(vec![broker.addr_string()], test_config()).await.unwrap();

    let cancel = CancellationToken::new();
    // cold cache misses
    assert!(matches!(
        router.route_to_group("accountants"),
        Err(Error::CachedMetadata { .. })
    ));

    let connection = router
        .route_to_group_refreshing("accountants", &cancel)
        .await
        .unwrap();
    assert_eq!(connection.endpoint().port, coordinator.port());

    router.shutdown();
}
