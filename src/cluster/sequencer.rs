//! The sequencer: a single-threaded agent that admits sessions and appends
//! ordered events to the replicated log publication.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use crate::client::{Client, ConductorAgent, ControlledPollAction, Publication};
use crate::concurrent::agent::{Agent, AgentError, AgentInvoker};
use crate::concurrent::clock::{CachedEpochClock, EpochClock, SystemEpochClock};
use crate::config::ClusterConfig;
use crate::error::{CountedErrorHandler, Error};

use super::codecs;
use super::ingress::{IngressAdapter, IngressListener};
use super::session::{ClusterSession, SessionState};
use super::timer::{TimerHandler, TimerService};
use super::{CloseReason, ClusterError, EventCode};

pub const MAX_SEND_ATTEMPTS: usize = 3;
pub const TIMER_POLL_LIMIT: usize = 10;
pub const FRAGMENT_POLL_LIMIT: usize = 10;

/// Everything the sequencer is built from. The client's conductor is run
/// cooperatively from the sequencer's own duty cycle, so the client lock is
/// uncontended by construction.
pub struct ClusterContext {
    pub config: ClusterConfig,
    pub client: Client,
    pub error_handler: CountedErrorHandler,
    pub epoch_clock: Arc<dyn EpochClock>,
}

impl ClusterContext {
    pub fn new(client: Client) -> Self {
        Self {
            config: ClusterConfig::default(),
            client,
            error_handler: CountedErrorHandler::default(),
            epoch_clock: Arc::new(SystemEpochClock),
        }
    }

    pub fn with_config(mut self, config: ClusterConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_error_handler(mut self, error_handler: CountedErrorHandler) -> Self {
        self.error_handler = error_handler;
        self
    }

    pub fn with_epoch_clock(mut self, clock: Arc<dyn EpochClock>) -> Self {
        self.epoch_clock = clock;
        self
    }
}

struct SequencerCore {
    cached_clock: CachedEpochClock,
    next_session_id: i64,
    sessions: HashMap<i64, ClusterSession>,
    pending_sessions: Vec<ClusterSession>,
    log_publication: Publication,
    client: Client,
    pending_session_timeout_ms: u64,
    errors: CountedErrorHandler,
}

pub struct SequencerAgent {
    core: SequencerCore,
    ingress: IngressAdapter,
    timers: TimerService,
    conductor_invoker: AgentInvoker<ConductorAgent>,
    epoch_clock: Arc<dyn EpochClock>,
}

impl SequencerAgent {
    pub fn new(ctx: ClusterContext) -> Result<Self, ClusterError> {
        let ClusterContext {
            config,
            client,
            error_handler,
            epoch_clock,
        } = ctx;

        let ingress_subscription =
            client.add_subscription(&config.ingress_channel, config.ingress_stream_id)?;
        let log_publication =
            client.add_exclusive_publication(&config.log_channel, config.log_stream_id)?;
        let timer_subscription =
            client.add_subscription(&config.timer_channel, config.timer_stream_id)?;

        let ingress = IngressAdapter::new(
            ingress_subscription,
            FRAGMENT_POLL_LIMIT,
            error_handler.clone(),
        );
        let timers = TimerService::new(
            timer_subscription,
            TIMER_POLL_LIMIT,
            FRAGMENT_POLL_LIMIT,
            error_handler.clone(),
        );
        let conductor_invoker =
            AgentInvoker::new(client.conductor_agent(), error_handler.clone());

        Ok(Self {
            core: SequencerCore {
                cached_clock: CachedEpochClock::default(),
                next_session_id: 1,
                sessions: HashMap::new(),
                pending_sessions: Vec::new(),
                log_publication,
                client,
                pending_session_timeout_ms: config.pending_session_timeout_ms,
                errors: error_handler,
            },
            ingress,
            timers,
            conductor_invoker,
            epoch_clock,
        })
    }

    pub fn session_count(&self) -> usize {
        self.core.sessions.len()
    }

    pub fn pending_session_count(&self) -> usize {
        self.core.pending_sessions.len()
    }

    /// Activity stamp of a live session, if known.
    pub fn session_time_of_last_activity_ms(&self, cluster_session_id: i64) -> Option<u64> {
        self.core
            .sessions
            .get(&cluster_session_id)
            .map(|session| session.time_of_last_activity_ms())
    }

    pub fn schedule_timer(&mut self, correlation_id: i64, deadline_ms: u64) {
        self.timers.schedule(correlation_id, deadline_ms);
    }

    pub fn cancel_timer(&mut self, correlation_id: i64) -> bool {
        self.timers.cancel(correlation_id)
    }
}

impl Agent for SequencerAgent {
    fn do_work(&mut self) -> Result<usize, AgentError> {
        let now_ms = self.epoch_clock.time_ms();
        self.core.cached_clock.update(now_ms);

        let mut work_count = self.conductor_invoker.invoke();
        work_count += self.core.process_pending_sessions(now_ms);
        work_count += self.ingress.poll(&mut self.core);
        work_count += self
            .timers
            .poll(now_ms, &mut self.core)
            .map_err(|error| AgentError::Failed(Error::Cluster(error)))?;

        Ok(work_count)
    }

    fn role_name(&self) -> &'static str {
        "sequencer"
    }
}

impl SequencerCore {
    /// Reverse index walk so admitted and expired sessions can be removed
    /// with a swap without disturbing the pass.
    fn process_pending_sessions(&mut self, now_ms: u64) -> usize {
        let mut work_count = 0;

        for i in (0..self.pending_sessions.len()).rev() {
            let state = self.pending_sessions[i].state();
            if state == SessionState::Init
                && notify_session_opened(&mut self.pending_sessions[i], now_ms)
            {
                let mut session = self.pending_sessions.swap_remove(i);
                append_session_open(&self.log_publication, &mut session, now_ms);
                tracing::debug!(session_id = session.id(), "cluster session connected");
                self.sessions.insert(session.id(), session);
                work_count += 1;
            } else if now_ms
                > self.pending_sessions[i].time_of_last_activity_ms()
                    + self.pending_session_timeout_ms
            {
                let mut session = self.pending_sessions.swap_remove(i);
                tracing::debug!(session_id = session.id(), "pending session timed out");
                session.close();
            }
        }

        work_count
    }
}

impl IngressListener for SequencerCore {
    fn on_session_connect(
        &mut self,
        correlation_id: i64,
        response_stream_id: i32,
        response_channel: &str,
    ) {
        match self.client.add_publication(response_channel, response_stream_id) {
            Ok(response_publication) => {
                let session_id = self.next_session_id;
                self.next_session_id += 1;

                let mut session = ClusterSession::new(session_id, response_publication);
                session.last_activity(self.cached_clock.time_ms(), correlation_id);
                self.pending_sessions.push(session);
            }
            Err(error) => {
                tracing::warn!(%error, response_channel, "session connect rejected");
                self.errors.on_error(&Error::Client(error));
            }
        }
    }

    fn on_session_message(
        &mut self,
        frame: &Bytes,
        cluster_session_id: i64,
        correlation_id: i64,
    ) -> ControlledPollAction {
        let now_ms = self.cached_clock.time_ms();
        let log = &self.log_publication;

        let Some(session) = self.sessions.get_mut(&cluster_session_id) else {
            return ControlledPollAction::Continue;
        };
        // A session that never made it past CONNECTED owes the log its open
        // event before any message may follow it.
        if session.state() == SessionState::Connected
            && !append_session_open(log, session, now_ms)
        {
            return ControlledPollAction::Abort;
        }

        let mut framed = BytesMut::from(frame.as_ref());
        codecs::patch_session_message_timestamp(&mut framed, now_ms);
        let framed = framed.freeze();

        for _ in 0..MAX_SEND_ATTEMPTS {
            if log.offer_frame(framed.clone()) > 0 {
                session.last_activity(now_ms, correlation_id);
                return ControlledPollAction::Continue;
            }
        }

        ControlledPollAction::Abort
    }

    fn on_keep_alive(&mut self, correlation_id: i64, cluster_session_id: i64) {
        if let Some(session) = self.sessions.get_mut(&cluster_session_id) {
            session.last_activity(self.cached_clock.time_ms(), correlation_id);
        }
    }

    fn on_session_close(&mut self, cluster_session_id: i64) {
        let now_ms = self.cached_clock.time_ms();
        let log = &self.log_publication;

        if let Some(session) = self.sessions.get_mut(&cluster_session_id) {
            session.close();
            if append_session_close(log, session, CloseReason::UserAction, now_ms) {
                self.sessions.remove(&cluster_session_id);
            }
        }
    }
}

impl TimerHandler for SequencerCore {
    fn on_expire_timer(&mut self, correlation_id: i64, now_ms: u64) -> Result<(), ClusterError> {
        for _ in 0..MAX_SEND_ATTEMPTS {
            if let Ok(mut claim) = self.log_publication.try_claim(codecs::TIMER_EVENT_LENGTH) {
                codecs::encode_timer_event(claim.buffer(), correlation_id, now_ms);
                if claim.commit() > 0 {
                    return Ok(());
                }
            }
        }

        // TODO: queue unsuccessful timer appends for retry instead of
        // failing the work cycle.
        Err(ClusterError::UnableToAppend { event: "timer" })
    }
}

/// Notify the client on its response publication. On success the session
/// becomes CONNECTED.
fn notify_session_opened(session: &mut ClusterSession, now_ms: u64) -> bool {
    let publication = session.response_publication().clone();
    let length = codecs::session_event_length("");

    for _ in 0..MAX_SEND_ATTEMPTS {
        if let Ok(mut claim) = publication.try_claim(length) {
            codecs::encode_session_event(
                claim.buffer(),
                session.id(),
                session.last_correlation_id(),
                EventCode::Ok,
                "",
            );
            if claim.commit() > 0 {
                session.set_time_of_last_activity_ms(now_ms);
                session.set_state(SessionState::Connected);
                return true;
            }
        }
    }

    false
}

/// Append the session's open event; on success the session becomes OPEN.
fn append_session_open(log: &Publication, session: &mut ClusterSession, now_ms: u64) -> bool {
    let response_channel = session.response_publication().channel().to_string();
    let response_stream_id = session.response_publication().stream_id();
    let length = codecs::session_open_event_length(&response_channel);

    for _ in 0..MAX_SEND_ATTEMPTS {
        if let Ok(mut claim) = log.try_claim(length) {
            codecs::encode_session_open_event(
                claim.buffer(),
                session.id(),
                session.last_correlation_id(),
                now_ms,
                response_stream_id,
                &response_channel,
            );
            if claim.commit() > 0 {
                session.set_state(SessionState::Open);
                return true;
            }
        }
    }

    false
}

fn append_session_close(
    log: &Publication,
    session: &ClusterSession,
    close_reason: CloseReason,
    now_ms: u64,
) -> bool {
    for _ in 0..MAX_SEND_ATTEMPTS {
        if let Ok(mut claim) = log.try_claim(codecs::SESSION_CLOSE_EVENT_LENGTH) {
            codecs::encode_session_close_event(
                claim.buffer(),
                session.id(),
                now_ms,
                close_reason,
            );
            if claim.commit() > 0 {
                return true;
            }
        }
    }

    false
}
