//! End-to-end conductor scenarios against the scripted media driver.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use skein::driver::DriverErrorCode;
use skein::testing::ClientHarness;
use skein::{
    Agent, AgentError, ClientConfig, ClientError, CountedErrorHandler, Error, Image,
};

fn collecting_handler() -> (CountedErrorHandler, Arc<Mutex<Vec<Error>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink_seen = Arc::clone(&seen);
    let handler = CountedErrorHandler::new(Arc::new(move |error: &Error| {
        sink_seen.lock().unwrap().push(error.clone());
    }));
    (handler, seen)
}

/// Drive the conductor agent until `done` or the deadline passes.
fn drive_until(harness: &ClientHarness, mut done: impl FnMut() -> bool, timeout: Duration) {
    let mut agent = harness.client.conductor_agent();
    let deadline = Instant::now() + timeout;
    while !done() {
        let _ = agent.do_work();
        if Instant::now() > deadline {
            panic!("condition not reached within {timeout:?}");
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn publication_registration_happy_path() {
    let harness = ClientHarness::start();
    let publication = harness.client.add_publication("ipc:data", 7).unwrap();

    assert_eq!(publication.channel(), "ipc:data");
    assert_eq!(publication.stream_id(), 7);
    assert!(publication.is_connected());
    // The handle is keyed by the client's correlation id, not the driver's
    // own registration id.
    assert_ne!(
        publication.registration_id(),
        publication.original_registration_id()
    );

    let log_file = harness.driver.publication_log_file("ipc:data").unwrap();
    assert_eq!(harness.factory.map_count(&log_file), 1);
    assert_eq!(harness.client.resource_count(), 1);
    assert_eq!(harness.client.mapped_log_count(), 1);
}

#[test]
fn shared_publications_return_the_same_resource() {
    let harness = ClientHarness::start();
    let a = harness.client.add_publication("ipc:shared", 5).unwrap();
    let b = harness.client.add_publication("ipc:shared", 5).unwrap();

    assert_eq!(a.registration_id(), b.registration_id());
    assert_eq!(harness.client.resource_count(), 1);

    let log_file = harness.driver.publication_log_file("ipc:shared").unwrap();
    assert_eq!(harness.factory.map_count(&log_file), 1);

    // First close only drops a reference; the publication stays live.
    a.close().unwrap();
    assert!(!b.is_closed());
    assert_eq!(harness.client.resource_count(), 1);

    b.close().unwrap();
    assert!(b.is_closed());
    assert_eq!(harness.client.resource_count(), 0);
}

#[test]
fn exclusive_publications_are_always_distinct() {
    let harness = ClientHarness::start();
    let a = harness
        .client
        .add_exclusive_publication("ipc:excl", 5)
        .unwrap();
    let b = harness
        .client
        .add_exclusive_publication("ipc:excl", 5)
        .unwrap();

    assert_ne!(a.registration_id(), b.registration_id());
    assert_eq!(harness.client.resource_count(), 2);
}

#[test]
fn add_subscription_times_out_when_driver_is_silent() {
    let config = ClientConfig {
        driver_timeout_ms: 300,
        ..ClientConfig::default()
    };
    let harness = ClientHarness::start_with(|ctx| ctx.with_config(config));
    harness.driver.pause_acks();

    let start = Instant::now();
    let result = harness.client.add_subscription("ipc:quiet", 1);
    let elapsed = start.elapsed();

    assert!(matches!(
        result,
        Err(ClientError::DriverTimeout { window_ms: 300 })
    ));
    assert!(elapsed >= Duration::from_millis(300), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(450), "{elapsed:?}");
}

#[test]
fn released_log_buffers_linger_then_release() {
    let config = ClientConfig {
        resource_linger_ns: 50_000_000,
        resource_check_interval_ns: 10_000_000,
        idle_sleep_ns: 1_000_000,
        ..ClientConfig::default()
    };
    let harness = ClientHarness::start_with(|ctx| ctx.with_config(config));

    // Two handles onto the same log file.
    let a = harness.client.add_publication("ipc:linger", 2).unwrap();
    let b = harness.client.add_publication("ipc:linger", 2).unwrap();
    let log_file = harness.driver.publication_log_file("ipc:linger").unwrap();

    a.close().unwrap();
    assert_eq!(harness.client.lingering_log_count(), 0);

    b.close().unwrap();
    assert_eq!(harness.client.lingering_log_count(), 1);
    assert_eq!(harness.factory.unmap_count(&log_file), 0);

    let factory = harness.factory.clone();
    drive_until(
        &harness,
        || factory.unmap_count(&log_file) == 1,
        Duration::from_millis(1_000),
    );
    assert_eq!(harness.client.lingering_log_count(), 0);
}

#[test]
fn close_force_closes_resources_and_is_idempotent() {
    let harness = ClientHarness::start();
    let publication = harness.client.add_publication("ipc:a", 1).unwrap();
    let subscription = harness.client.add_subscription("ipc:b", 1).unwrap();
    let counter = harness.client.add_counter(7, b"key", "a label").unwrap();
    assert_eq!(harness.client.resource_count(), 3);

    harness.client.close();
    assert!(harness.client.is_closed());
    assert_eq!(harness.client.resource_count(), 0);
    assert!(publication.is_closed());
    assert!(subscription.is_closed());
    assert!(counter.is_closed());

    // Second close observes the same state.
    harness.client.close();
    assert_eq!(harness.client.resource_count(), 0);

    assert!(matches!(
        harness.client.add_publication("ipc:late", 1),
        Err(ClientError::ClientClosed)
    ));

    let mut agent = harness.client.conductor_agent();
    assert!(matches!(agent.do_work(), Err(AgentError::Terminated)));
}

#[test]
fn stale_driver_heartbeat_closes_the_conductor() {
    let (errors, seen) = collecting_handler();
    let config = ClientConfig {
        keep_alive_interval_ns: 5_000_000,
        driver_timeout_ms: 100,
        idle_sleep_ns: 1_000_000,
        ..ClientConfig::default()
    };
    let harness = ClientHarness::start_with(|ctx| {
        ctx.with_config(config).with_error_handler(errors.clone())
    });
    harness.driver.pause_heartbeat();

    let mut agent = harness.client.conductor_agent();
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        if agent.do_work().is_err() {
            break;
        }
        assert!(Instant::now() < deadline, "conductor never closed");
        std::thread::sleep(Duration::from_millis(10));
    }

    assert!(harness.client.is_closed());
    let seen = seen.lock().unwrap();
    assert!(seen.iter().any(|error| matches!(
        error,
        Error::Client(ClientError::DriverTimeout { window_ms: 100 })
    )));
}

#[test]
fn image_event_ahead_of_subscription_ready_still_resolves() {
    let harness = ClientHarness::start();
    harness
        .driver
        .announce_image_before_ready("ipc:early", "early-img.log");

    let images = Arc::new(Mutex::new(Vec::new()));
    let captured = Arc::clone(&images);
    let subscription = harness
        .client
        .add_subscription_with_handlers(
            "ipc:early",
            1,
            Some(Arc::new(move |image: &Image| {
                captured.lock().unwrap().push(image.correlation_id());
            })),
            None,
        )
        .unwrap();

    assert_eq!(subscription.image_count(), 1);
    assert_eq!(images.lock().unwrap().len(), 1);
    assert_eq!(harness.factory.map_count("early-img.log"), 1);
}

#[test]
fn unavailable_image_fires_handler_and_releases_log() {
    let removed = Arc::new(Mutex::new(Vec::new()));
    let captured = Arc::clone(&removed);

    let harness = ClientHarness::start();
    let subscription = harness
        .client
        .add_subscription_with_handlers(
            "ipc:in",
            1,
            None,
            Some(Arc::new(move |image: &Image| {
                captured.lock().unwrap().push(image.correlation_id());
            })),
        )
        .unwrap();

    let image_id = harness.driver.add_image("ipc:in", 3, "in-img.log").unwrap();
    let probe = subscription.clone();
    drive_until(
        &harness,
        || probe.image_count() == 1,
        Duration::from_millis(500),
    );
    assert!(subscription.has_image(image_id));

    harness.driver.remove_image("ipc:in", image_id);
    let probe = subscription.clone();
    drive_until(
        &harness,
        || probe.image_count() == 0,
        Duration::from_millis(500),
    );

    assert_eq!(removed.lock().unwrap().as_slice(), &[image_id]);
    assert_eq!(harness.client.lingering_log_count(), 1);
}

#[test]
fn panicking_image_handler_is_routed_to_the_error_sink() {
    let (errors, seen) = collecting_handler();
    let harness = ClientHarness::start_with(|ctx| ctx.with_error_handler(errors.clone()));

    let subscription = harness
        .client
        .add_subscription_with_handlers(
            "ipc:in",
            1,
            Some(Arc::new(|_: &Image| panic!("handler exploded"))),
            None,
        )
        .unwrap();

    harness.driver.add_image("ipc:in", 3, "boom-img.log").unwrap();
    let probe = subscription.clone();
    drive_until(
        &harness,
        || probe.image_count() == 1,
        Duration::from_millis(500),
    );

    let seen = seen.lock().unwrap();
    assert!(seen.iter().any(|error| matches!(
        error,
        Error::Client(ClientError::ImageHandler { .. })
    )));
}

#[test]
fn channel_endpoint_error_is_surfaced_per_matching_resource() {
    let (errors, seen) = collecting_handler();
    let harness = ClientHarness::start_with(|ctx| ctx.with_error_handler(errors.clone()));

    let _subscription = harness.client.add_subscription("ipc:err", 1).unwrap();
    let status_id = harness.driver.subscription_status_id("ipc:err").unwrap();
    harness
        .driver
        .emit_channel_endpoint_error(status_id, "endpoint down");

    drive_until(
        &harness,
        || !seen.lock().unwrap().is_empty(),
        Duration::from_millis(500),
    );

    let seen = seen.lock().unwrap();
    assert!(seen.iter().any(|error| matches!(
        error,
        Error::Client(ClientError::ChannelEndpoint { message, .. }) if message == "endpoint down"
    )));
}

#[test]
fn driver_rejection_surfaces_as_registration_error() {
    let harness = ClientHarness::start();
    harness
        .driver
        .reject_channel("ipc:bad", DriverErrorCode::InvalidChannel, "bad channel");

    let result = harness.client.add_publication("ipc:bad", 1);
    assert!(matches!(
        result,
        Err(ClientError::Registration {
            code: DriverErrorCode::InvalidChannel,
            ..
        })
    ));
    assert_eq!(harness.client.resource_count(), 0);
}

#[test]
fn counter_argument_validation_and_roundtrip() {
    let harness = ClientHarness::start();

    let oversized_key = vec![0u8; 200];
    assert!(matches!(
        harness.client.add_counter(1, &oversized_key, "label"),
        Err(ClientError::InvalidArgument { field: "key", .. })
    ));

    let oversized_label = "x".repeat(400);
    assert!(matches!(
        harness.client.add_counter(1, b"key", &oversized_label),
        Err(ClientError::InvalidArgument { field: "label", .. })
    ));

    let counter = harness.client.add_counter(1, b"key", "a label").unwrap();
    counter.set(41);
    assert_eq!(counter.increment(), 42);
    assert_eq!(counter.get(), 42);
    counter.close().unwrap();
    assert_eq!(harness.client.resource_count(), 0);
}

#[test]
fn destinations_roundtrip() {
    let harness = ClientHarness::start();
    let publication = harness.client.add_publication("ipc:mdc", 4).unwrap();

    harness
        .client
        .add_destination(publication.registration_id(), "ipc:mdc-endpoint-1")
        .unwrap();
    harness
        .client
        .remove_destination(publication.registration_id(), "ipc:mdc-endpoint-1")
        .unwrap();
}

#[test]
fn add_then_release_returns_registry_to_initial_state() {
    let config = ClientConfig {
        resource_linger_ns: 30_000_000,
        resource_check_interval_ns: 10_000_000,
        idle_sleep_ns: 1_000_000,
        ..ClientConfig::default()
    };
    let harness = ClientHarness::start_with(|ctx| ctx.with_config(config));
    assert_eq!(harness.client.resource_count(), 0);

    let publication = harness.client.add_publication("ipc:p", 1).unwrap();
    let exclusive = harness.client.add_exclusive_publication("ipc:q", 1).unwrap();
    let subscription = harness.client.add_subscription("ipc:s", 1).unwrap();
    let counter = harness.client.add_counter(3, b"k", "l").unwrap();
    assert_eq!(harness.client.resource_count(), 4);

    publication.close().unwrap();
    exclusive.close().unwrap();
    subscription.close().unwrap();
    counter.close().unwrap();
    assert_eq!(harness.client.resource_count(), 0);

    // Every log-buffer refcount drains to zero within the linger window
    // plus one sweep interval.
    let client = harness.client.clone();
    drive_until(
        &harness,
        || client.lingering_log_count() == 0 && client.mapped_log_count() == 0,
        Duration::from_millis(1_000),
    );
}
