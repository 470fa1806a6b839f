//! Controlled-fragment dispatch from the ingress subscription.

use bytes::Bytes;

use crate::client::{ControlledPollAction, Subscription};
use crate::error::{CountedErrorHandler, Error};

use super::codecs::{self, IngressMessage};

/// Receiver of decoded ingress traffic. The session-message handler decides
/// whether the fragment is consumed or redelivered.
pub trait IngressListener {
    fn on_session_connect(
        &mut self,
        correlation_id: i64,
        response_stream_id: i32,
        response_channel: &str,
    );

    fn on_session_message(
        &mut self,
        frame: &Bytes,
        cluster_session_id: i64,
        correlation_id: i64,
    ) -> ControlledPollAction;

    fn on_keep_alive(&mut self, correlation_id: i64, cluster_session_id: i64);

    fn on_session_close(&mut self, cluster_session_id: i64);
}

/// Polls the ingress subscription a bounded fragment batch at a time and
/// dispatches each decoded frame. Undecodable frames are consumed, reported
/// to the error sink and skipped.
pub struct IngressAdapter {
    subscription: Subscription,
    fragment_limit: usize,
    errors: CountedErrorHandler,
}

impl IngressAdapter {
    pub fn new(
        subscription: Subscription,
        fragment_limit: usize,
        errors: CountedErrorHandler,
    ) -> Self {
        Self {
            subscription,
            fragment_limit,
            errors,
        }
    }

    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    pub fn poll(&mut self, listener: &mut dyn IngressListener) -> usize {
        let errors = &self.errors;
        self.subscription.controlled_poll(
            &mut |frame| match codecs::decode_ingress(frame) {
                Ok(IngressMessage::SessionConnect {
                    correlation_id,
                    response_stream_id,
                    response_channel,
                }) => {
                    listener.on_session_connect(
                        correlation_id,
                        response_stream_id,
                        &response_channel,
                    );
                    ControlledPollAction::Continue
                }
                Ok(IngressMessage::SessionMessage {
                    cluster_session_id,
                    correlation_id,
                    timestamp_ms: _,
                }) => listener.on_session_message(frame, cluster_session_id, correlation_id),
                Ok(IngressMessage::KeepAlive {
                    correlation_id,
                    cluster_session_id,
                }) => {
                    listener.on_keep_alive(correlation_id, cluster_session_id);
                    ControlledPollAction::Continue
                }
                Ok(IngressMessage::SessionClose { cluster_session_id }) => {
                    listener.on_session_close(cluster_session_id);
                    ControlledPollAction::Continue
                }
                Err(error) => {
                    errors.on_error(&Error::Cluster(error.into()));
                    ControlledPollAction::Continue
                }
            },
            self.fragment_limit,
        )
    }
}
