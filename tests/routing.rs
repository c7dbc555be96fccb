//! End to end tests over the real local IPC path: a routing host, guest
//! applications from the SDK, and nothing mocked in between.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use codec::message::{MessageType, ReturnCode};
use sdk::{Application, Event};
use someip_router::config::Config;
use tokio::time::{sleep, timeout};

/// Start a routing host under a unique instance name and wait for its
/// socket to accept.
async fn start_host(name: &str) -> Result<Arc<Config>> {
    let config: Config = serde_json5::from_str(&format!(
        r#"{{
            routing: "{name}",
            "service-discovery": {{ enable: false }},
            services: [{{
                service: 0x1234,
                instance: 0x0001,
                major: 1,
                events: [{{ event: 0x8005, eventgroups: [0x0005] }}],
            }}],
            watchdog: {{ interval: 200, timeout: 1000 }},
            "request-timeout": 2000,
        }}"#
    ))?;

    let config = Arc::new(config);

    {
        let config = config.clone();
        tokio::spawn(async move {
            let _ = someip_router::startup(config).await;
        });
    }

    for _ in 0..50 {
        if tokio::net::UnixStream::connect(config.local_socket_path()).await.is_ok() {
            return Ok(config);
        }

        sleep(Duration::from_millis(20)).await;
    }

    anyhow::bail!("routing host did not come up")
}

async fn expect_event(app: &mut Application) -> Event {
    timeout(Duration::from_secs(5), app.next_event())
        .await
        .expect("timed out waiting for an event")
        .expect("connection closed")
}

/// Wait for the availability edge of 0x1234, skipping unrelated events.
async fn expect_availability(app: &mut Application, wanted: bool) {
    loop {
        if let Event::Availability { service, available, .. } = expect_event(app).await
            && service == 0x1234
            && available == wanted
        {
            return;
        }
    }
}

#[test]
fn configuration_loads_from_a_file() -> Result<()> {
    use std::io::Write;

    let mut file = tempfile::NamedTempFile::new()?;
    write!(
        file,
        r#"{{
            unicast: "192.168.1.5",
            routing: "fs-test",
            services: [{{ service: 0x1234, instance: 0x0001, unreliable: 30509 }}],
        }}"#
    )?;

    let config = Config::load_from(file.path().to_str().unwrap())?;

    assert_eq!(config.routing, "fs-test");
    assert_eq!(config.local_socket_path(), "/tmp/vsomeip-fs-test-0");
    assert_eq!(config.instance_on_port(0x1234, 30509, false), Some(0x0001));

    // A missing file is a load error, not a fallback to defaults.
    assert!(Config::load_from("/nonexistent/router.json").is_err());

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn request_response_between_two_guests() -> Result<()> {
    start_host("test-rr").await?;

    let offerer = Application::connect("offerer", "test-rr").await?;
    let mut consumer = Application::connect("consumer", "test-rr").await?;

    offerer.offer_service(0x1234, 0x0001, 1, 0)?;
    consumer.request_service(0x1234, 0x0001, 1, 0)?;
    expect_availability(&mut consumer, true).await;

    consumer.send_request(0x0001, 0x1234, 0x0042, 1, &[0x10, 0x20])?;

    // The offerer serves the call.
    let mut offerer = offerer;
    let request = loop {
        if let Event::Message { message, .. } = expect_event(&mut offerer).await {
            break message;
        }
    };

    assert_eq!(request.header.message_type, MessageType::Request);
    assert_eq!(request.header.method, 0x0042);
    assert_eq!(request.header.client, consumer.client());
    assert_eq!(request.payload, vec![0x10, 0x20]);

    offerer.respond(0x0001, &request.header, ReturnCode::Ok, &[0x30])?;

    let response = loop {
        if let Event::Message { message, .. } = expect_event(&mut consumer).await {
            break message;
        }
    };

    // Exactly the request's identifier tuple comes back.
    assert_eq!(response.header.message_type, MessageType::Response);
    assert_eq!(response.header.service, 0x1234);
    assert_eq!(response.header.method, 0x0042);
    assert_eq!(response.header.client, consumer.client());
    assert_eq!(response.header.session, request.header.session);
    assert_eq!(response.payload, vec![0x30]);

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn offerer_disconnect_is_observed_by_the_consumer() -> Result<()> {
    start_host("test-down").await?;

    let offerer = Application::connect("offerer", "test-down").await?;
    let mut consumer = Application::connect("consumer", "test-down").await?;

    offerer.offer_service(0x1234, 0x0001, 1, 0)?;
    consumer.request_service(0x1234, 0x0001, 1, 0)?;
    expect_availability(&mut consumer, true).await;

    // The offerer dies abruptly.
    drop(offerer);

    expect_availability(&mut consumer, false).await;

    // Sends now bounce with E_NOT_REACHABLE.
    consumer.send_request(0x0001, 0x1234, 0x0042, 1, &[])?;

    let error = loop {
        if let Event::Message { message, .. } = expect_event(&mut consumer).await {
            break message;
        }
    };

    assert_eq!(error.header.message_type, MessageType::Error);
    assert_eq!(error.header.return_code, ReturnCode::NotReachable);

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn local_subscription_receives_notifications_in_order() -> Result<()> {
    start_host("test-notify").await?;

    let offerer = Application::connect("offerer", "test-notify").await?;
    let mut subscriber = Application::connect("subscriber", "test-notify").await?;

    offerer.offer_service(0x1234, 0x0001, 1, 0)?;
    subscriber.request_service(0x1234, 0x0001, 1, 0)?;
    expect_availability(&mut subscriber, true).await;

    subscriber.subscribe(0x1234, 0x0001, 0x0005, 1)?;

    loop {
        if let Event::Subscribed { eventgroup, .. } = expect_event(&mut subscriber).await {
            assert_eq!(eventgroup, 0x0005);
            break;
        }
    }

    for value in 1..=3u8 {
        offerer.notify(0x0001, 0x1234, 0x8005, &[value])?;
    }

    let mut received = Vec::new();
    while received.len() < 3 {
        if let Event::Message { message, .. } = expect_event(&mut subscriber).await {
            assert_eq!(message.header.message_type, MessageType::Notification);
            assert_eq!(message.header.client, 0x0000);
            assert_eq!(message.header.method, 0x8005);
            received.push(message.payload[0]);
        }
    }

    assert_eq!(received, vec![1, 2, 3]);

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn unanswered_requests_time_out() -> Result<()> {
    start_host("test-timeout").await?;

    let mut offerer = Application::connect("offerer", "test-timeout").await?;
    let mut consumer = Application::connect("consumer", "test-timeout").await?;

    offerer.offer_service(0x1234, 0x0001, 1, 0)?;
    consumer.request_service(0x1234, 0x0001, 1, 0)?;
    expect_availability(&mut consumer, true).await;

    consumer.send_request(0x0001, 0x1234, 0x0042, 1, &[])?;

    // The offerer receives the request and never answers.
    loop {
        if let Event::Message { .. } = expect_event(&mut offerer).await {
            break;
        }
    }

    let error = loop {
        if let Event::Message { message, .. } = expect_event(&mut consumer).await {
            break message;
        }
    };

    assert_eq!(error.header.message_type, MessageType::Error);
    assert_eq!(error.header.return_code, ReturnCode::Timeout);
    assert_eq!(error.header.method, 0x0042);

    Ok(())
}
