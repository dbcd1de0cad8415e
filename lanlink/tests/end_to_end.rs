use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use lanlink::discovery::backend::{BrowseBackend, MemoryBackend, ServiceRegistration};
use lanlink::{
    ConnectionState, DiscoveryOptions, DiscoveryResolver, Mode, PubSubClient, PubSubOptions,
    ServiceDescription,
};
use shared::types::{Protocol, ServiceFilter};

const TIMEOUT: Duration = Duration::from_secs(2);

fn sensor(instance: &str, subtype: &str, address: IpAddr, port: u16) -> ServiceRegistration {
    ServiceRegistration {
        instance_name: instance.to_string(),
        service_type: "_zmq._tcp.local.".to_string(),
        subtype: Some(subtype.to_string()),
        hostname: format!("{}.local.", instance),
        addresses: vec![address],
        port,
        txt: Default::default(),
    }
}

#[tokio::test]
async fn discovers_subtyped_service_once() {
    let backend = MemoryBackend::new();
    let resolver = DiscoveryResolver::with_backend(Arc::new(backend.clone()), DiscoveryOptions::default());

    let filter = ServiceFilter::new("zmq", Protocol::Tcp).with_subtype("cpuTemp");
    let (tx, rx) = flume::unbounded();
    let session = resolver
        .discover_services(filter.clone(), None, move |record, ranked| {
            let _ = tx.send((record, ranked));
        })
        .unwrap();

    let address = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5));
    let temperature = sensor("edison", "cpuTemp", address, 5556);
    backend.register(&temperature).unwrap();
    // Same advertisement again, plus one for a subtype nobody asked for
    backend.register(&temperature).unwrap();
    backend
        .register(&sensor("humidity", "humidity", IpAddr::V4(Ipv4Addr::new(10, 0, 0, 6)), 5557))
        .unwrap();

    let (record, ranked) = tokio::time::timeout(TIMEOUT, rx.recv_async()).await.unwrap().unwrap();
    assert_eq!(record.service_type, filter);
    assert_eq!(record.instance_name, "edison._zmq._tcp.local.");
    assert_eq!(record.port, 5556);
    assert_eq!(ranked.best(), Some(address));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.is_empty());

    session.join().await;
    assert_eq!(backend.active_browses(), 0);
}

#[tokio::test]
async fn sensor_record_becomes_subscriber_endpoint() {
    let backend = MemoryBackend::new();
    let address = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5));
    backend.register(&sensor("edison", "cpuTemp", address, 5556)).unwrap();

    let resolver = DiscoveryResolver::with_backend(Arc::new(backend), DiscoveryOptions::default());
    let (found_tx, found_rx) = flume::unbounded();
    let _session = resolver
        .discover_services(
            ServiceFilter::new("zmq", Protocol::Tcp).with_subtype("cpuTemp"),
            None,
            move |record, ranked| {
                let _ = found_tx.send((record, ranked));
            },
        )
        .unwrap();
    let (record, ranked) = tokio::time::timeout(TIMEOUT, found_rx.recv_async()).await.unwrap().unwrap();
    assert_eq!(record.port, 5556);
    let best = ranked.best().unwrap();
    assert_eq!(best, address);

    let options = PubSubOptions {
        connect_retries: 0,
        ..PubSubOptions::default()
    };
    let subscriber = PubSubClient::with_options(best, record.port, Mode::Sub, options);
    assert_eq!(subscriber.endpoint(), "10.0.0.5:5556".parse().unwrap());
    subscriber.subscribe("/Intel/temperature", |_, _| {}).unwrap();

    subscriber.close();
    assert_eq!(subscriber.state(), ConnectionState::Closed(None));
}

#[tokio::test]
async fn advertised_description_is_discoverable() {
    let backend = MemoryBackend::new();
    let resolver = DiscoveryResolver::with_backend(Arc::new(backend.clone()), DiscoveryOptions::default());

    let description = ServiceDescription::from_json(
        "edison.json",
        r#"{
            "name": "edison-temperature",
            "type": { "name": "zmq", "protocol": "tcp", "subtypes": ["cpuTemp"] },
            "port": 5556
        }"#,
    )
    .unwrap();

    // The in-memory network resolves an auto-addressed registration to no
    // addresses, which the resolver reports as a failure rather than a result
    let (tx, rx) = flume::unbounded();
    let session = resolver
        .discover_services(description.service_type.clone(), None, move |record, _| {
            let _ = tx.send(record);
        })
        .unwrap();
    let failures = session.failures();

    let advertisement = resolver.advertise_service(&description).unwrap();

    let failure = tokio::time::timeout(TIMEOUT, failures.recv_async()).await.unwrap().unwrap();
    assert_eq!(failure.instance, "edison-temperature._zmq._tcp.local.");
    assert!(rx.is_empty());

    advertisement.withdraw().unwrap();
    resolver.shutdown().unwrap();
}

#[tokio::test]
async fn discovered_endpoint_feeds_subscriber() {
    let publisher = PubSubClient::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0, Mode::Pub);
    publisher.wait_connected().await.unwrap();
    let port = publisher.local_addr().unwrap().port();

    // Announce the publisher the way a sensor would, then find it
    let backend = MemoryBackend::new();
    backend
        .register(&sensor("edison", "cpuTemp", IpAddr::V4(Ipv4Addr::LOCALHOST), port))
        .unwrap();
    let resolver = DiscoveryResolver::with_backend(Arc::new(backend), DiscoveryOptions::default());
    let (found_tx, found_rx) = flume::unbounded();
    let _session = resolver
        .discover_services(
            ServiceFilter::new("zmq", Protocol::Tcp).with_subtype("cpuTemp"),
            None,
            move |record, ranked| {
                let _ = found_tx.send((record, ranked));
            },
        )
        .unwrap();
    let (record, ranked) = tokio::time::timeout(TIMEOUT, found_rx.recv_async()).await.unwrap().unwrap();

    let subscriber = PubSubClient::new(ranked.best().unwrap(), record.port, Mode::Sub);
    let (tx, rx) = flume::unbounded();
    subscriber
        .subscribe("/Intel/temperature", move |topic, message| {
            let _ = tx.send((topic.to_string(), String::from_utf8_lossy(message).to_string()));
        })
        .unwrap();
    subscriber.wait_connected().await.unwrap();

    tokio::time::timeout(TIMEOUT, async {
        while publisher.subscriber_count("/Intel/temperature") == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    publisher.publish("/Intel/temperature", "23.5C").unwrap();

    let received = tokio::time::timeout(TIMEOUT, rx.recv_async()).await.unwrap().unwrap();
    assert_eq!(received, ("/Intel/temperature".to_string(), "23.5C".to_string()));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.is_empty());

    subscriber.close();
    publisher.close();
    assert_eq!(subscriber.state(), ConnectionState::Closed(None));
}
