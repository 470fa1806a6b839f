//! Test support: manual clocks, an in-memory log-buffer factory, and a
//! scripted media driver that acks commands from the far side of the rings.
//!
//! Lives in the library so unit tests and integration tests share one
//! harness; nothing here is used by production paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::client::{Client, ClientContext, ClientError, LogBuffersFactory, MappedLog};
use crate::concurrent::clock::{EpochClock, NanoClock};
use crate::concurrent::counters::{channel_status, CountersBuffer};
use crate::concurrent::ring::{FrameQueue, RecordRing};
use crate::driver::{DriverCommand, DriverErrorCode, DriverEvent, DriverHeartbeat};

fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Wall clock driven by the test.
#[derive(Clone, Debug, Default)]
pub struct ManualEpochClock {
    ms: Arc<AtomicU64>,
}

impl ManualEpochClock {
    pub fn new(start_ms: u64) -> Self {
        let clock = Self::default();
        clock.set_ms(start_ms);
        clock
    }

    pub fn set_ms(&self, ms: u64) {
        self.ms.store(ms, Ordering::Release);
    }

    pub fn advance_ms(&self, delta: u64) {
        self.ms.fetch_add(delta, Ordering::AcqRel);
    }
}

impl EpochClock for ManualEpochClock {
    fn time_ms(&self) -> u64 {
        self.ms.load(Ordering::Acquire)
    }
}

/// Monotonic clock driven by the test.
#[derive(Clone, Debug, Default)]
pub struct ManualNanoClock {
    ns: Arc<AtomicU64>,
}

impl ManualNanoClock {
    pub fn set_ns(&self, ns: u64) {
        self.ns.store(ns, Ordering::Release);
    }

    pub fn advance_ns(&self, delta: u64) {
        self.ns.fetch_add(delta, Ordering::AcqRel);
    }
}

impl NanoClock for ManualNanoClock {
    fn nano_time(&self) -> u64 {
        self.ns.load(Ordering::Acquire)
    }
}

struct LogEntry {
    terms: FrameQueue,
    maps: usize,
    unmaps: Arc<AtomicUsize>,
}

/// Log-buffer factory backed by named in-memory frame pipes. Mapping the
/// same file name twice yields the same pipe, which is how the scripted
/// driver shares "files" with the client under test.
#[derive(Clone, Default)]
pub struct TestLogBuffersFactory {
    entries: Arc<Mutex<HashMap<String, LogEntry>>>,
}

impl TestLogBuffersFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The frame pipe for a log file, created on first use.
    pub fn terms(&self, log_file: &str) -> FrameQueue {
        let mut entries = self.lock();
        entries
            .entry(log_file.to_string())
            .or_insert_with(|| LogEntry {
                terms: FrameQueue::default(),
                maps: 0,
                unmaps: Arc::new(AtomicUsize::new(0)),
            })
            .terms
            .clone()
    }

    pub fn map_count(&self, log_file: &str) -> usize {
        self.lock().get(log_file).map_or(0, |entry| entry.maps)
    }

    pub fn unmap_count(&self, log_file: &str) -> usize {
        self.lock()
            .get(log_file)
            .map_or(0, |entry| entry.unmaps.load(Ordering::Acquire))
    }

    pub fn files(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, LogEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct TestMappedLog {
    name: String,
    terms: FrameQueue,
    unmaps: Arc<AtomicUsize>,
}

impl MappedLog for TestMappedLog {
    fn file_name(&self) -> &str {
        &self.name
    }

    fn terms(&self) -> FrameQueue {
        self.terms.clone()
    }
}

impl Drop for TestMappedLog {
    fn drop(&mut self) {
        self.unmaps.fetch_add(1, Ordering::AcqRel);
    }
}

impl LogBuffersFactory for TestLogBuffersFactory {
    fn map_log(&self, log_file: &str) -> Result<Box<dyn MappedLog>, ClientError> {
        let mut entries = self.lock();
        let entry = entries
            .entry(log_file.to_string())
            .or_insert_with(|| LogEntry {
                terms: FrameQueue::default(),
                maps: 0,
                unmaps: Arc::new(AtomicUsize::new(0)),
            });
        entry.maps += 1;
        Ok(Box::new(TestMappedLog {
            name: log_file.to_string(),
            terms: entry.terms.clone(),
            unmaps: Arc::clone(&entry.unmaps),
        }))
    }
}

const DEFAULT_PUBLICATION_LIMIT: i64 = 1 << 20;

struct DriverState {
    commands: RecordRing<DriverCommand>,
    events: RecordRing<DriverEvent>,
    counters: CountersBuffer,
    heartbeat: DriverHeartbeat,
    factory: TestLogBuffersFactory,
    next_registration_id: AtomicI64,
    next_counter_id: AtomicI32,
    default_publication_limit: AtomicI64,
    publication_limits: Mutex<HashMap<String, i64>>,
    publication_limit_ids: Mutex<HashMap<String, i32>>,
    publication_log_files: Mutex<HashMap<String, String>>,
    subscriptions: Mutex<HashMap<String, i64>>,
    subscription_status_ids: Mutex<HashMap<String, i32>>,
    image_before_ready: Mutex<HashMap<String, String>>,
    rejections: Mutex<HashMap<String, (DriverErrorCode, String)>>,
    acking: AtomicBool,
    heartbeating: AtomicBool,
    running: AtomicBool,
}

/// A scripted stand-in for the media driver process: acknowledges commands,
/// allocates counters and log files, and injects image and error events on
/// demand. Clone freely; all clones share state.
#[derive(Clone)]
pub struct FakeMediaDriver {
    state: Arc<DriverState>,
}

impl FakeMediaDriver {
    pub fn new(
        commands: RecordRing<DriverCommand>,
        events: RecordRing<DriverEvent>,
        counters: CountersBuffer,
        heartbeat: DriverHeartbeat,
        factory: TestLogBuffersFactory,
    ) -> Self {
        heartbeat.update(now_epoch_ms());
        Self {
            state: Arc::new(DriverState {
                commands,
                events,
                counters,
                heartbeat,
                factory,
                next_registration_id: AtomicI64::new(1_000),
                next_counter_id: AtomicI32::new(0),
                default_publication_limit: AtomicI64::new(DEFAULT_PUBLICATION_LIMIT),
                publication_limits: Mutex::new(HashMap::new()),
                publication_limit_ids: Mutex::new(HashMap::new()),
                publication_log_files: Mutex::new(HashMap::new()),
                subscriptions: Mutex::new(HashMap::new()),
                subscription_status_ids: Mutex::new(HashMap::new()),
                image_before_ready: Mutex::new(HashMap::new()),
                rejections: Mutex::new(HashMap::new()),
                acking: AtomicBool::new(true),
                heartbeating: AtomicBool::new(true),
                running: AtomicBool::new(true),
            }),
        }
    }

    /// Drive the scripted driver on its own thread until `stop`.
    pub fn spawn(&self) -> JoinHandle<()> {
        let driver = self.clone();
        std::thread::spawn(move || {
            while driver.state.running.load(Ordering::Acquire) {
                driver.do_work();
                std::thread::sleep(Duration::from_micros(200));
            }
        })
    }

    pub fn stop(&self) {
        self.state.running.store(false, Ordering::Release);
    }

    /// One driver duty cycle: heartbeat plus a bounded batch of commands.
    pub fn do_work(&self) -> usize {
        if self.state.heartbeating.load(Ordering::Acquire) {
            self.state.heartbeat.update(now_epoch_ms());
        }
        if !self.state.acking.load(Ordering::Acquire) {
            return 0;
        }

        let driver = self.clone();
        self.state.commands.drain(16, |command| driver.on_command(command))
    }

    pub fn pause_acks(&self) {
        self.state.acking.store(false, Ordering::Release);
    }

    pub fn resume_acks(&self) {
        self.state.acking.store(true, Ordering::Release);
    }

    pub fn pause_heartbeat(&self) {
        self.state.heartbeating.store(false, Ordering::Release);
    }

    pub fn set_default_publication_limit(&self, limit: i64) {
        self.state
            .default_publication_limit
            .store(limit, Ordering::Release);
    }

    /// Pin the publication limit for a channel; applies to live publications
    /// as well as future acknowledgements.
    pub fn set_publication_limit(&self, channel: &str, limit: i64) {
        lock(&self.state.publication_limits).insert(channel.to_string(), limit);
        if let Some(&limit_id) = lock(&self.state.publication_limit_ids).get(channel) {
            self.state.counters.set(limit_id, limit);
        }
    }

    /// Reject future registrations on a channel with an error event.
    pub fn reject_channel(&self, channel: &str, code: DriverErrorCode, message: &str) {
        lock(&self.state.rejections).insert(channel.to_string(), (code, message.to_string()));
    }

    /// When the next subscription on `channel` registers, announce an image
    /// for it ahead of the subscription-ready acknowledgement.
    pub fn announce_image_before_ready(&self, channel: &str, log_file: &str) {
        lock(&self.state.image_before_ready)
            .insert(channel.to_string(), log_file.to_string());
    }

    pub fn subscription_registration_id(&self, channel: &str) -> Option<i64> {
        lock(&self.state.subscriptions).get(channel).copied()
    }

    pub fn subscription_status_id(&self, channel: &str) -> Option<i32> {
        lock(&self.state.subscription_status_ids)
            .get(channel)
            .copied()
    }

    pub fn publication_log_file(&self, channel: &str) -> Option<String> {
        lock(&self.state.publication_log_files).get(channel).cloned()
    }

    /// Announce an image on a channel's subscription. Returns the image's
    /// correlation id.
    pub fn add_image(&self, channel: &str, session_id: i32, log_file: &str) -> Option<i64> {
        let subscription_registration_id = self.subscription_registration_id(channel)?;
        let correlation_id = self.mint_registration_id();
        let subscriber_position_id = self.alloc_counter(0);
        self.state.factory.terms(log_file);

        self.offer_event(DriverEvent::AvailableImage {
            correlation_id,
            stream_id: 0,
            session_id,
            subscription_registration_id,
            subscriber_position_id,
            log_file: log_file.to_string(),
            source_identity: format!("fake-driver:{channel}"),
        });
        Some(correlation_id)
    }

    pub fn remove_image(&self, channel: &str, image_correlation_id: i64) {
        if let Some(subscription_registration_id) = self.subscription_registration_id(channel) {
            self.offer_event(DriverEvent::UnavailableImage {
                correlation_id: image_correlation_id,
                subscription_registration_id,
                stream_id: 0,
            });
        }
    }

    pub fn emit_channel_endpoint_error(&self, status_indicator_id: i32, message: &str) {
        self.offer_event(DriverEvent::ChannelEndpointError {
            status_indicator_id,
            message: message.to_string(),
        });
    }

    fn on_command(&self, command: DriverCommand) {
        match command {
            DriverCommand::AddPublication {
                correlation_id,
                channel,
                stream_id,
            } => self.on_add_publication(correlation_id, &channel, stream_id, false),
            DriverCommand::AddExclusivePublication {
                correlation_id,
                channel,
                stream_id,
            } => self.on_add_publication(correlation_id, &channel, stream_id, true),
            DriverCommand::AddSubscription {
                correlation_id,
                channel,
                stream_id: _,
            } => {
                if self.maybe_reject(&channel, correlation_id) {
                    return;
                }
                let status_id = self.alloc_counter(channel_status::ACTIVE);
                lock(&self.state.subscriptions).insert(channel.clone(), correlation_id);
                lock(&self.state.subscription_status_ids).insert(channel.clone(), status_id);
                if let Some(log_file) = lock(&self.state.image_before_ready).remove(&channel) {
                    let _ = self.add_image(&channel, 0, &log_file);
                }
                self.offer_event(DriverEvent::SubscriptionReady {
                    correlation_id,
                    channel_status_indicator_id: status_id,
                });
            }
            DriverCommand::AddCounter { correlation_id, .. } => {
                let counter_id = self.alloc_counter(0);
                self.offer_event(DriverEvent::CounterReady {
                    correlation_id,
                    counter_id,
                });
            }
            DriverCommand::RemovePublication { correlation_id, .. }
            | DriverCommand::RemoveSubscription { correlation_id, .. }
            | DriverCommand::RemoveCounter { correlation_id, .. }
            | DriverCommand::AddDestination { correlation_id, .. }
            | DriverCommand::RemoveDestination { correlation_id, .. } => {
                self.offer_event(DriverEvent::OperationSuccess { correlation_id });
            }
            DriverCommand::ClientKeepalive { .. } => {}
        }
    }

    fn on_add_publication(
        &self,
        correlation_id: i64,
        channel: &str,
        stream_id: i32,
        exclusive: bool,
    ) {
        if self.maybe_reject(channel, correlation_id) {
            return;
        }

        let registration_id = self.mint_registration_id();
        let limit = lock(&self.state.publication_limits)
            .get(channel)
            .copied()
            .unwrap_or_else(|| self.state.default_publication_limit.load(Ordering::Acquire));
        let limit_id = self.alloc_counter(limit);
        let status_id = self.alloc_counter(channel_status::ACTIVE);
        let log_file = format!("{channel}:{stream_id}:{registration_id}.pub.log");

        lock(&self.state.publication_limit_ids).insert(channel.to_string(), limit_id);
        lock(&self.state.publication_log_files).insert(channel.to_string(), log_file.clone());
        self.state.factory.terms(&log_file);

        let event = if exclusive {
            DriverEvent::ExclusivePublicationReady {
                correlation_id,
                registration_id,
                stream_id,
                session_id: registration_id as i32,
                publication_limit_counter_id: limit_id,
                channel_status_indicator_id: status_id,
                log_file,
            }
        } else {
            DriverEvent::PublicationReady {
                correlation_id,
                registration_id,
                stream_id,
                session_id: registration_id as i32,
                publication_limit_counter_id: limit_id,
                channel_status_indicator_id: status_id,
                log_file,
            }
        };
        self.offer_event(event);
    }

    fn maybe_reject(&self, channel: &str, correlation_id: i64) -> bool {
        if let Some((code, message)) = lock(&self.state.rejections).get(channel).cloned() {
            self.offer_event(DriverEvent::Error {
                correlation_id,
                code,
                message,
            });
            return true;
        }
        false
    }

    fn mint_registration_id(&self) -> i64 {
        self.state.next_registration_id.fetch_add(1, Ordering::AcqRel)
    }

    fn alloc_counter(&self, initial: i64) -> i32 {
        let id = self.state.next_counter_id.fetch_add(1, Ordering::AcqRel);
        self.state.counters.set(id, initial);
        id
    }

    fn offer_event(&self, event: DriverEvent) {
        let mut pending = event;
        loop {
            match self.state.events.offer(pending) {
                Ok(()) => return,
                Err(returned) => {
                    pending = returned;
                    std::thread::sleep(Duration::from_micros(50));
                }
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A client wired to a spawned [`FakeMediaDriver`], torn down on drop.
pub struct ClientHarness {
    pub client: Client,
    pub driver: FakeMediaDriver,
    pub factory: TestLogBuffersFactory,
    pub counters: CountersBuffer,
    driver_thread: Option<JoinHandle<()>>,
}

impl ClientHarness {
    pub fn start() -> Self {
        Self::start_with(|ctx| ctx)
    }

    pub fn start_with(customize: impl FnOnce(ClientContext) -> ClientContext) -> Self {
        let commands = RecordRing::new(256);
        let events = RecordRing::new(256);
        let counters = CountersBuffer::new(512);
        let heartbeat = DriverHeartbeat::new();
        let factory = TestLogBuffersFactory::new();

        let driver = FakeMediaDriver::new(
            commands.clone(),
            events.clone(),
            counters.clone(),
            heartbeat.clone(),
            factory.clone(),
        );
        let driver_thread = driver.spawn();

        let ctx = customize(ClientContext::new(
            commands,
            events,
            counters.clone(),
            heartbeat,
            Arc::new(factory.clone()),
        ));
        let client = Client::connect(ctx);

        Self {
            client,
            driver,
            factory,
            counters,
            driver_thread: Some(driver_thread),
        }
    }
}

impl Drop for ClientHarness {
    fn drop(&mut self) {
        self.driver.stop();
        if let Some(thread) = self.driver_thread.take() {
            let _ = thread.join();
        }
    }
}
