//! End-to-end sequencer scenarios: ingress ordering, admission,
//! back-pressure and timers, all against the scripted media driver.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use skein::cluster::codecs::{
    decode_egress, decode_log_event, encode_cancel_timer, encode_schedule_timer,
    encode_session_close_request, encode_session_connect, encode_session_message, EgressEvent,
    LogEvent,
};
use skein::cluster::{CloseReason, ClusterContext, ClusterError, EventCode, SequencerAgent};
use skein::concurrent::ring::FrameQueue;
use skein::testing::{ClientHarness, ManualEpochClock};
use skein::{Agent, AgentError, ClusterConfig, Error};

struct ClusterFixture {
    harness: ClientHarness,
    sequencer: SequencerAgent,
    clock: ManualEpochClock,
    ingress: FrameQueue,
    timer: FrameQueue,
    log_terms: FrameQueue,
    config: ClusterConfig,
}

impl ClusterFixture {
    fn start() -> Self {
        let harness = ClientHarness::start();
        let clock = ManualEpochClock::new(1_000);
        let config = ClusterConfig::default();

        let ctx = ClusterContext::new(harness.client.clone())
            .with_config(config.clone())
            .with_epoch_clock(Arc::new(clock.clone()));
        let mut sequencer = SequencerAgent::new(ctx).unwrap();

        harness
            .driver
            .add_image(&config.ingress_channel, 1, "ingress.img")
            .unwrap();
        harness
            .driver
            .add_image(&config.timer_channel, 1, "timer.img")
            .unwrap();

        // Let the embedded conductor absorb the image events.
        for _ in 0..5 {
            let _ = sequencer.do_work();
            std::thread::sleep(Duration::from_millis(1));
        }

        let ingress = harness.factory.terms("ingress.img");
        let timer = harness.factory.terms("timer.img");
        let log_file = harness
            .driver
            .publication_log_file(&config.log_channel)
            .unwrap();
        let log_terms = harness.factory.terms(&log_file);

        Self {
            harness,
            sequencer,
            clock,
            ingress,
            timer,
            log_terms,
            config,
        }
    }

    fn step(&mut self, cycles: usize) {
        for _ in 0..cycles {
            let _ = self.sequencer.do_work();
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn drain_log(&self) -> Vec<LogEvent> {
        let mut events = Vec::new();
        while let Some(frame) = self.log_terms.pop() {
            events.push(decode_log_event(&frame).unwrap());
        }
        events
    }

    fn response_frames(&self, response_channel: &str) -> Vec<Bytes> {
        let log_file = self
            .harness
            .driver
            .publication_log_file(response_channel)
            .unwrap();
        let terms = self.harness.factory.terms(&log_file);
        let mut frames = Vec::new();
        while let Some(frame) = terms.pop() {
            frames.push(frame);
        }
        frames
    }

    /// Connect one session and run it through admission.
    fn open_session(&mut self, correlation_id: i64, response_channel: &str) -> i64 {
        self.ingress
            .offer(encode_session_connect(correlation_id, 9, response_channel));
        self.step(6);
        assert_eq!(self.sequencer.pending_session_count(), 0, "session stuck pending");
        self.sequencer.session_count() as i64
    }
}

#[test]
fn session_lifecycle_is_ordered_in_the_log() {
    let mut fx = ClusterFixture::start();

    fx.ingress.offer(encode_session_connect(900, 9, "ipc:resp-1"));
    fx.step(6);
    assert_eq!(fx.sequencer.session_count(), 1);

    // The client heard an OK session event on its response channel.
    let frames = fx.response_frames("ipc:resp-1");
    assert_eq!(frames.len(), 1);
    assert!(matches!(
        decode_egress(&frames[0]).unwrap(),
        EgressEvent::Session {
            cluster_session_id: 1,
            correlation_id: 900,
            code: EventCode::Ok,
            ..
        }
    ));

    fx.ingress.offer(encode_session_message(1, 901, 0, b"A"));
    fx.ingress.offer(encode_session_message(1, 902, 0, b"B"));
    fx.ingress.offer(encode_session_close_request(1));
    fx.step(4);
    assert_eq!(fx.sequencer.session_count(), 0);

    let events = fx.drain_log();
    assert_eq!(events.len(), 4, "{events:?}");

    assert!(matches!(
        &events[0],
        LogEvent::SessionOpen {
            cluster_session_id: 1,
            correlation_id: 900,
            response_channel,
            ..
        } if response_channel == "ipc:resp-1"
    ));
    match &events[1] {
        LogEvent::SessionMessage {
            cluster_session_id,
            correlation_id,
            timestamp_ms,
            payload,
        } => {
            assert_eq!(*cluster_session_id, 1);
            assert_eq!(*correlation_id, 901);
            assert_eq!(*timestamp_ms, 1_000, "timestamp rewritten to cached clock");
            assert_eq!(payload.as_ref(), b"A");
        }
        other => panic!("expected message, got {other:?}"),
    }
    assert!(matches!(
        &events[2],
        LogEvent::SessionMessage { correlation_id: 902, .. }
    ));
    assert!(matches!(
        &events[3],
        LogEvent::SessionClose {
            cluster_session_id: 1,
            close_reason: CloseReason::UserAction,
            ..
        }
    ));
}

#[test]
fn unknown_session_messages_are_dropped() {
    let mut fx = ClusterFixture::start();

    fx.ingress.offer(encode_session_message(42, 901, 0, b"ghost"));
    fx.step(3);

    assert!(fx.drain_log().is_empty());
    assert_eq!(fx.ingress.len(), 0, "fragment consumed, not redelivered");
}

#[test]
fn back_pressured_log_aborts_and_redelivers() {
    let mut fx = ClusterFixture::start();
    fx.open_session(900, "ipc:resp-bp");
    let opened = fx.drain_log();
    assert!(matches!(opened[0], LogEvent::SessionOpen { .. }));
    let activity_before = fx.sequencer.session_time_of_last_activity_ms(1).unwrap();

    fx.harness
        .driver
        .set_publication_limit(&fx.config.log_channel, 0);
    fx.clock.advance_ms(50);
    fx.ingress.offer(encode_session_message(1, 903, 0, b"C"));
    fx.step(3);

    // Nothing logged, the fragment is still queued, activity untouched.
    assert!(fx.drain_log().is_empty());
    assert_eq!(fx.ingress.len(), 1);
    assert_eq!(
        fx.sequencer.session_time_of_last_activity_ms(1).unwrap(),
        activity_before
    );

    fx.harness
        .driver
        .set_publication_limit(&fx.config.log_channel, 1 << 20);
    fx.step(3);

    let events = fx.drain_log();
    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0],
        LogEvent::SessionMessage { correlation_id: 903, .. }
    ));
    assert_eq!(fx.ingress.len(), 0);
}

#[test]
fn pending_session_times_out_without_logging() {
    let mut fx = ClusterFixture::start();

    // The response publication never connects.
    fx.harness.driver.set_publication_limit("ipc:resp-dead", 0);
    fx.ingress.offer(encode_session_connect(910, 9, "ipc:resp-dead"));
    fx.step(3);
    assert_eq!(fx.sequencer.pending_session_count(), 1);
    assert_eq!(fx.sequencer.session_count(), 0);

    fx.clock
        .advance_ms(fx.config.pending_session_timeout_ms + 10);
    fx.step(3);

    assert_eq!(fx.sequencer.pending_session_count(), 0);
    assert_eq!(fx.sequencer.session_count(), 0);
    assert!(fx.drain_log().is_empty(), "no open event may be logged");
}

#[test]
fn keep_alive_stamps_session_activity() {
    let mut fx = ClusterFixture::start();
    fx.open_session(920, "ipc:resp-ka");
    fx.drain_log();
    let before = fx.sequencer.session_time_of_last_activity_ms(1).unwrap();

    fx.clock.advance_ms(500);
    fx.ingress
        .offer(skein::cluster::codecs::encode_session_keep_alive(921, 1));
    fx.step(2);

    let after = fx.sequencer.session_time_of_last_activity_ms(1).unwrap();
    assert_eq!(after, before + 500);
    assert!(fx.drain_log().is_empty(), "keep-alives are not logged");
}

#[test]
fn timers_fire_in_deadline_order() {
    let mut fx = ClusterFixture::start();

    fx.timer.offer(encode_schedule_timer(71, 1_500));
    fx.timer.offer(encode_schedule_timer(72, 1_200));
    fx.step(2);
    assert!(fx.drain_log().is_empty(), "nothing due yet");

    fx.clock.advance_ms(600);
    fx.step(2);

    let events = fx.drain_log();
    assert_eq!(
        events,
        vec![
            LogEvent::Timer {
                correlation_id: 72,
                timestamp_ms: 1_600,
            },
            LogEvent::Timer {
                correlation_id: 71,
                timestamp_ms: 1_600,
            },
        ]
    );
}

#[test]
fn cancelled_timers_do_not_fire() {
    let mut fx = ClusterFixture::start();

    fx.timer.offer(encode_schedule_timer(73, 1_100));
    fx.timer.offer(encode_cancel_timer(73));
    fx.step(2);

    fx.clock.advance_ms(1_000);
    fx.step(2);
    assert!(fx.drain_log().is_empty());
}

#[test]
fn timer_append_failure_is_fatal_to_the_work_cycle() {
    let mut fx = ClusterFixture::start();

    fx.sequencer.schedule_timer(99, 1_050);
    fx.harness
        .driver
        .set_publication_limit(&fx.config.log_channel, 0);
    fx.clock.advance_ms(100);

    let result = fx.sequencer.do_work();
    assert!(matches!(
        result,
        Err(AgentError::Failed(Error::Cluster(
            ClusterError::UnableToAppend { event: "timer" }
        )))
    ));
}
