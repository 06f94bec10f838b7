//! Lifecycle and command tests over the in-memory transport.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use okolab::transport::mock::{MockPort, MockProvider};
use okolab::{Channel, ConnectionState, Device, DeviceEvent, DeviceOptions, Error, Side};

fn standard_port() -> MockPort {
    let port = MockPort::new();
    port.stub("018", "X18SN42");
    port.stub("017", "X17H401-T");
    port.stub("001", "X0137.0");
    port.stub("037", "X37OFF");
    port.stub("002", "X0237.0");
    port.stub("004", "X040");
    port.stub("110", "X100");
    port.stub("025", "X25 3 d, 04:05:06");
    port.stub("026", "X2641.2");
    port.stub("00825.0", "X0825.0");
    port.stub("06360.0", "X6360.0");
    port
}

async fn connected_device(port: MockPort) -> Device {
    let provider = MockProvider::new();
    provider.add_port("mock0", port);
    let device = Device::open(
        Box::new(provider),
        DeviceOptions::default().with_address("mock0"),
    );
    device.connect().await.unwrap();
    device
}

fn drain(events: &mut okolab::EventReceiver) -> Vec<DeviceEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

#[tokio::test]
async fn test_connect_reaches_connected_state() {
    let device = connected_device(standard_port()).await;
    let mut events = device.subscribe();

    assert_eq!(device.state().await, ConnectionState::Connected);
    assert_eq!(device.address().await.as_deref(), Some("mock0"));

    // The Connected event predates this subscription; reconnecting state
    // should be quiescent now.
    assert!(drain(&mut events).is_empty());
}

#[tokio::test]
async fn test_connect_twice_is_a_no_op() {
    let device = connected_device(standard_port()).await;
    device.connect().await.unwrap();
    assert_eq!(device.state().await, ConnectionState::Connected);
}

#[tokio::test]
async fn test_concurrent_requests_never_interleave() {
    let port = standard_port();
    port.set_latency(Duration::from_millis(5));
    let device = Arc::new(connected_device(port.clone()).await);

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let device = Arc::clone(&device);
        tasks.push(tokio::spawn(async move {
            device.temperature(Channel::One).await
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap(), Some(37.0));
    }

    assert!(!port.overlap_detected());
}

#[tokio::test]
async fn test_transport_failure_tears_the_link_down() {
    let port = standard_port();
    let device = connected_device(port.clone()).await;
    let mut events = device.subscribe();

    port.fail_next_read();
    assert!(matches!(
        device.temperature(Channel::One).await,
        Err(Error::Disconnected)
    ));

    assert_eq!(device.state().await, ConnectionState::Lost);
    assert!(port.is_closed());
    assert_eq!(drain(&mut events), vec![DeviceEvent::Lost]);

    // A later call is rejected without touching the transport.
    let log_len = port.call_log().len();
    assert!(matches!(
        device.uptime().await,
        Err(Error::Disconnected)
    ));
    assert_eq!(port.call_log().len(), log_len);
}

#[tokio::test]
async fn test_lost_is_emitted_once_with_queued_callers() {
    let port = standard_port();
    port.set_latency(Duration::from_millis(10));
    let device = Arc::new(connected_device(port.clone()).await);
    let mut events = device.subscribe();

    port.fail_next_read();
    let first = {
        let device = Arc::clone(&device);
        tokio::spawn(async move { device.temperature(Channel::One).await })
    };
    // Let the first caller take the link before the second queues up.
    tokio::time::sleep(Duration::from_millis(2)).await;
    let second = {
        let device = Arc::clone(&device);
        tokio::spawn(async move { device.temperature(Channel::One).await })
    };

    assert!(first.await.unwrap().is_err());
    assert!(second.await.unwrap().is_err());

    let lost = drain(&mut events)
        .into_iter()
        .filter(|e| *e == DeviceEvent::Lost)
        .count();
    assert_eq!(lost, 1);
}

#[tokio::test]
async fn test_setpoint_range_is_enforced_locally() {
    let port = standard_port();
    let device = connected_device(port.clone()).await;

    for value in [24.9, 60.1] {
        match device.set_setpoint(Channel::One, value).await {
            Err(Error::SetpointOutOfRange { value: rejected }) => assert_eq!(rejected, value),
            other => panic!("expected local rejection, got {:?}", other),
        }
    }
    let log = port.call_log();
    assert!(log.iter().all(|entry| !entry.starts_with("write 008")));

    device.set_setpoint(Channel::One, 25.0).await.unwrap();
    device.set_setpoint(Channel::Two, 60.0).await.unwrap();
    let log = port.call_log();
    assert!(log.contains(&"write 00825.0".to_string()));
    assert!(log.contains(&"write 06360.0".to_string()));
}

#[tokio::test]
async fn test_inactive_channel_reads_as_none() {
    let device = connected_device(standard_port()).await;
    assert_eq!(device.temperature(Channel::Two).await.unwrap(), None);
    assert_eq!(device.temperature(Channel::One).await.unwrap(), Some(37.0));
}

#[tokio::test]
async fn test_uptime_and_identity_queries() {
    let device = connected_device(standard_port()).await;

    assert_eq!(device.serial_number().await.unwrap(), "SN42");
    assert_eq!(device.product_name().await.unwrap(), "H401-T");

    let expected = chrono::Duration::days(3)
        + chrono::Duration::hours(4)
        + chrono::Duration::minutes(5)
        + chrono::Duration::seconds(6);
    assert_eq!(device.uptime().await.unwrap(), expected);
}

#[tokio::test]
async fn test_close_emits_closed_and_resolves_waiters() {
    let port = standard_port();
    let device = Arc::new(connected_device(port.clone()).await);

    let waiter = {
        let device = Arc::clone(&device);
        tokio::spawn(async move { device.closed().await })
    };
    // Give the waiter time to subscribe.
    tokio::time::sleep(Duration::from_millis(10)).await;

    device.close().await.unwrap();
    assert_eq!(device.state().await, ConnectionState::Closed);
    assert!(port.is_closed());
    assert!(waiter.await.unwrap().is_ok());

    // Closing again finds no open port.
    assert!(matches!(device.close().await, Err(Error::Disconnected)));
}

#[tokio::test]
async fn test_abandoned_closed_waiter_shuts_the_port() {
    let port = standard_port();
    let device = connected_device(port.clone()).await;

    // Dropping the waiter mid-wait (here via timeout) must close the
    // link rather than leave the port open with nobody watching it.
    let waited = tokio::time::timeout(Duration::from_millis(20), device.closed()).await;
    assert!(waited.is_err());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(port.is_closed());
    assert_eq!(device.state().await, ConnectionState::Closed);
}

#[tokio::test]
async fn test_completed_closed_waiter_does_not_close_again() {
    let port = standard_port();
    let device = connected_device(port.clone()).await;
    let mut events = device.subscribe();

    device.close().await.unwrap();
    device.closed().await.unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(drain(&mut events), vec![DeviceEvent::Closed]);
}

#[tokio::test]
async fn test_closed_reports_a_lost_link() {
    let port = standard_port();
    let device = connected_device(port.clone()).await;

    port.fail_next_read();
    let _ = device.temperature(Channel::One).await;

    assert!(matches!(device.closed().await, Err(Error::ConnectionLost)));
}

#[tokio::test]
async fn test_identity_mismatch_rejects_the_port() {
    let port = standard_port();
    let provider = MockProvider::new();
    provider.add_port("mock0", port.clone());

    let device = Device::open(
        Box::new(provider),
        DeviceOptions::default()
            .with_address("mock0")
            .with_target_serial("SN99"),
    );

    assert!(matches!(device.connect().await, Err(Error::Disconnected)));
    assert_eq!(device.state().await, ConnectionState::Disconnected);
    assert!(port.is_closed());
}

#[tokio::test]
async fn test_discovery_tries_candidates_in_order() {
    let silent = MockPort::new();
    let good = standard_port();

    let provider = MockProvider::new();
    provider.add_port("mock0", silent);
    provider.add_port("mock1", good);

    let device = Device::open(Box::new(provider.clone()), DeviceOptions::default());
    device.connect().await.unwrap();

    assert_eq!(device.address().await.as_deref(), Some("mock1"));
    assert_eq!(provider.open_log(), vec!["mock0", "mock1"]);
}

#[tokio::test]
async fn test_fixed_address_connects_without_identity_probe() {
    // No response scripted for the serial number query at all; a fixed
    // address with no target identity must connect regardless.
    let port = MockPort::new();
    port.stub("001", "X0137.0");

    let provider = MockProvider::new();
    provider.add_port("mock0", port.clone());
    let device = Device::open(
        Box::new(provider),
        DeviceOptions::default().with_address("mock0"),
    );

    device.connect().await.unwrap();
    assert_eq!(device.state().await, ConnectionState::Connected);
    assert_eq!(device.temperature(Channel::One).await.unwrap(), Some(37.0));
    assert!(port
        .call_log()
        .iter()
        .all(|entry| entry.as_str() != "write 018"));
}

#[tokio::test]
async fn test_channel_type_writes_type_then_side() {
    let port = standard_port();
    port.stub("1125", "X12");
    port.stub("1161", "X16");
    port.stub("114-1", "X14");
    port.stub("111", "X115");
    port.stub("113", "X13-1");
    let device = connected_device(port.clone()).await;

    device
        .set_channel_type(Channel::One, Some(5), Some(Side::Glass))
        .await
        .unwrap();
    device
        .set_channel_type(Channel::Two, None, None)
        .await
        .unwrap();

    let writes: Vec<_> = port
        .call_log()
        .into_iter()
        .filter(|e| e.starts_with("write 11"))
        .collect();
    assert_eq!(writes, vec!["write 1125", "write 1161", "write 114-1"]);

    assert_eq!(device.channel_type(Channel::One).await.unwrap(), Some(5));
    assert_eq!(device.channel_type(Channel::Two).await.unwrap(), None);
}

#[tokio::test]
async fn test_clock_read_and_write_frames() {
    let port = standard_port();
    port.stub("070", "X7001/02/2024 03:04:05");
    port.stub("07101/02/2024 03:04:05", "X71");
    let device = connected_device(port.clone()).await;

    let time = device.time().await.unwrap();
    let expected = NaiveDate::from_ymd_opt(2024, 1, 2)
        .unwrap()
        .and_hms_opt(3, 4, 5)
        .unwrap();
    assert_eq!(time, expected);

    device.set_time(&time).await.unwrap();
    assert!(port
        .call_log()
        .contains(&"write 07101/02/2024 03:04:05".to_string()));
}

#[tokio::test]
async fn test_requests_require_a_connection() {
    let provider = MockProvider::new();
    provider.add_port("mock0", standard_port());
    let device = Device::open(
        Box::new(provider),
        DeviceOptions::default().with_address("mock0"),
    );

    assert!(matches!(
        device.temperature(Channel::One).await,
        Err(Error::Disconnected)
    ));
}
