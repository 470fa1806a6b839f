//! Fixed-layout little-endian codecs for ingress, egress, log and timer
//! frames. Every frame starts with the 8-byte message header; variable
//! strings are a u32 length prefix followed by utf-8 bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::{CloseReason, EventCode};

pub const SCHEMA_ID: u16 = 101;
pub const SCHEMA_VERSION: u16 = 1;

pub const MESSAGE_HEADER_LENGTH: usize = 8;

// Ingress templates.
pub const TEMPLATE_SESSION_CONNECT: u16 = 1;
pub const TEMPLATE_SESSION_MESSAGE: u16 = 2;
pub const TEMPLATE_SESSION_KEEP_ALIVE: u16 = 3;
pub const TEMPLATE_SESSION_CLOSE_REQUEST: u16 = 4;

// Egress and log templates.
pub const TEMPLATE_SESSION_EVENT: u16 = 10;
pub const TEMPLATE_SESSION_OPEN_EVENT: u16 = 11;
pub const TEMPLATE_SESSION_CLOSE_EVENT: u16 = 12;
pub const TEMPLATE_TIMER_EVENT: u16 = 13;

// Timer channel templates.
pub const TEMPLATE_SCHEDULE_TIMER: u16 = 20;
pub const TEMPLATE_CANCEL_TIMER: u16 = 21;

const SESSION_CONNECT_BLOCK_LENGTH: usize = 12;
const SESSION_MESSAGE_BLOCK_LENGTH: usize = 24;
const SESSION_KEEP_ALIVE_BLOCK_LENGTH: usize = 16;
const SESSION_CLOSE_REQUEST_BLOCK_LENGTH: usize = 8;
const SESSION_EVENT_BLOCK_LENGTH: usize = 20;
const SESSION_OPEN_EVENT_BLOCK_LENGTH: usize = 28;
const SESSION_CLOSE_EVENT_BLOCK_LENGTH: usize = 20;
const TIMER_EVENT_BLOCK_LENGTH: usize = 16;
const SCHEDULE_TIMER_BLOCK_LENGTH: usize = 16;
const CANCEL_TIMER_BLOCK_LENGTH: usize = 8;

/// Byte offset of the timestamp field within a session-message frame; the
/// sequencer overwrites it in place with its cached wall-clock.
pub const SESSION_MESSAGE_TIMESTAMP_OFFSET: usize = MESSAGE_HEADER_LENGTH + 16;

pub const SESSION_CLOSE_EVENT_LENGTH: usize =
    MESSAGE_HEADER_LENGTH + SESSION_CLOSE_EVENT_BLOCK_LENGTH;
pub const TIMER_EVENT_LENGTH: usize = MESSAGE_HEADER_LENGTH + TIMER_EVENT_BLOCK_LENGTH;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("frame truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("unknown template id {template_id}")]
    UnknownTemplate { template_id: u16 },

    #[error("schema mismatch: got {schema_id}, expected {expected}")]
    SchemaMismatch { schema_id: u16, expected: u16 },

    #[error("malformed utf-8 in {field}")]
    Utf8 { field: &'static str },

    #[error("unknown {field} code {code}")]
    UnknownCode { field: &'static str, code: u32 },
}

/// Decoded ingress frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IngressMessage {
    SessionConnect {
        correlation_id: i64,
        response_stream_id: i32,
        response_channel: String,
    },
    SessionMessage {
        cluster_session_id: i64,
        correlation_id: i64,
        timestamp_ms: u64,
    },
    KeepAlive {
        correlation_id: i64,
        cluster_session_id: i64,
    },
    SessionClose {
        cluster_session_id: i64,
    },
}

/// Decoded log frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogEvent {
    SessionOpen {
        cluster_session_id: i64,
        correlation_id: i64,
        timestamp_ms: u64,
        response_stream_id: i32,
        response_channel: String,
    },
    SessionMessage {
        cluster_session_id: i64,
        correlation_id: i64,
        timestamp_ms: u64,
        payload: Bytes,
    },
    SessionClose {
        cluster_session_id: i64,
        timestamp_ms: u64,
        close_reason: CloseReason,
    },
    Timer {
        correlation_id: i64,
        timestamp_ms: u64,
    },
}

/// Decoded egress frame on a session's response publication.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EgressEvent {
    Session {
        cluster_session_id: i64,
        correlation_id: i64,
        code: EventCode,
        detail: String,
    },
}

/// Decoded timer-channel frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerRequest {
    Schedule { correlation_id: i64, deadline_ms: u64 },
    Cancel { correlation_id: i64 },
}

// ---- encoding --------------------------------------------------------------

fn put_header(buf: &mut impl BufMut, template_id: u16, block_length: usize) {
    buf.put_u16_le(block_length as u16);
    buf.put_u16_le(template_id);
    buf.put_u16_le(SCHEMA_ID);
    buf.put_u16_le(SCHEMA_VERSION);
}

fn put_var_string(buf: &mut impl BufMut, value: &str) {
    buf.put_u32_le(value.len() as u32);
    buf.put_slice(value.as_bytes());
}

pub fn encode_session_connect(
    correlation_id: i64,
    response_stream_id: i32,
    response_channel: &str,
) -> Bytes {
    let mut buf = BytesMut::with_capacity(
        MESSAGE_HEADER_LENGTH + SESSION_CONNECT_BLOCK_LENGTH + 4 + response_channel.len(),
    );
    put_header(&mut buf, TEMPLATE_SESSION_CONNECT, SESSION_CONNECT_BLOCK_LENGTH);
    buf.put_i64_le(correlation_id);
    buf.put_i32_le(response_stream_id);
    put_var_string(&mut buf, response_channel);
    buf.freeze()
}

pub fn encode_session_message(
    cluster_session_id: i64,
    correlation_id: i64,
    timestamp_ms: u64,
    payload: &[u8],
) -> Bytes {
    let mut buf = BytesMut::with_capacity(
        MESSAGE_HEADER_LENGTH + SESSION_MESSAGE_BLOCK_LENGTH + payload.len(),
    );
    put_header(&mut buf, TEMPLATE_SESSION_MESSAGE, SESSION_MESSAGE_BLOCK_LENGTH);
    buf.put_i64_le(cluster_session_id);
    buf.put_i64_le(correlation_id);
    buf.put_u64_le(timestamp_ms);
    buf.put_slice(payload);
    buf.freeze()
}

/// Overwrite the timestamp field of an encoded session-message frame.
pub fn patch_session_message_timestamp(frame: &mut [u8], timestamp_ms: u64) {
    let end = SESSION_MESSAGE_TIMESTAMP_OFFSET + 8;
    frame[SESSION_MESSAGE_TIMESTAMP_OFFSET..end].copy_from_slice(&timestamp_ms.to_le_bytes());
}

pub fn encode_session_keep_alive(correlation_id: i64, cluster_session_id: i64) -> Bytes {
    let mut buf = BytesMut::with_capacity(MESSAGE_HEADER_LENGTH + SESSION_KEEP_ALIVE_BLOCK_LENGTH);
    put_header(
        &mut buf,
        TEMPLATE_SESSION_KEEP_ALIVE,
        SESSION_KEEP_ALIVE_BLOCK_LENGTH,
    );
    buf.put_i64_le(correlation_id);
    buf.put_i64_le(cluster_session_id);
    buf.freeze()
}

pub fn encode_session_close_request(cluster_session_id: i64) -> Bytes {
    let mut buf =
        BytesMut::with_capacity(MESSAGE_HEADER_LENGTH + SESSION_CLOSE_REQUEST_BLOCK_LENGTH);
    put_header(
        &mut buf,
        TEMPLATE_SESSION_CLOSE_REQUEST,
        SESSION_CLOSE_REQUEST_BLOCK_LENGTH,
    );
    buf.put_i64_le(cluster_session_id);
    buf.freeze()
}

pub fn session_event_length(detail: &str) -> usize {
    MESSAGE_HEADER_LENGTH + SESSION_EVENT_BLOCK_LENGTH + 4 + detail.len()
}

/// Encode a session event into an exactly-sized claimed buffer.
pub fn encode_session_event(
    mut buf: &mut [u8],
    cluster_session_id: i64,
    correlation_id: i64,
    code: EventCode,
    detail: &str,
) {
    put_header(&mut buf, TEMPLATE_SESSION_EVENT, SESSION_EVENT_BLOCK_LENGTH);
    buf.put_i64_le(cluster_session_id);
    buf.put_i64_le(correlation_id);
    buf.put_u32_le(code.code());
    put_var_string(&mut buf, detail);
}

pub fn session_open_event_length(response_channel: &str) -> usize {
    MESSAGE_HEADER_LENGTH + SESSION_OPEN_EVENT_BLOCK_LENGTH + 4 + response_channel.len()
}

pub fn encode_session_open_event(
    mut buf: &mut [u8],
    cluster_session_id: i64,
    correlation_id: i64,
    timestamp_ms: u64,
    response_stream_id: i32,
    response_channel: &str,
) {
    put_header(
        &mut buf,
        TEMPLATE_SESSION_OPEN_EVENT,
        SESSION_OPEN_EVENT_BLOCK_LENGTH,
    );
    buf.put_i64_le(cluster_session_id);
    buf.put_i64_le(correlation_id);
    buf.put_u64_le(timestamp_ms);
    buf.put_i32_le(response_stream_id);
    put_var_string(&mut buf, response_channel);
}

pub fn encode_session_close_event(
    mut buf: &mut [u8],
    cluster_session_id: i64,
    timestamp_ms: u64,
    close_reason: CloseReason,
) {
    put_header(
        &mut buf,
        TEMPLATE_SESSION_CLOSE_EVENT,
        SESSION_CLOSE_EVENT_BLOCK_LENGTH,
    );
    buf.put_i64_le(cluster_session_id);
    buf.put_u64_le(timestamp_ms);
    buf.put_u32_le(close_reason.code());
}

pub fn encode_timer_event(mut buf: &mut [u8], correlation_id: i64, timestamp_ms: u64) {
    put_header(&mut buf, TEMPLATE_TIMER_EVENT, TIMER_EVENT_BLOCK_LENGTH);
    buf.put_i64_le(correlation_id);
    buf.put_u64_le(timestamp_ms);
}

pub fn encode_schedule_timer(correlation_id: i64, deadline_ms: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(MESSAGE_HEADER_LENGTH + SCHEDULE_TIMER_BLOCK_LENGTH);
    put_header(&mut buf, TEMPLATE_SCHEDULE_TIMER, SCHEDULE_TIMER_BLOCK_LENGTH);
    buf.put_i64_le(correlation_id);
    buf.put_u64_le(deadline_ms);
    buf.freeze()
}

pub fn encode_cancel_timer(correlation_id: i64) -> Bytes {
    let mut buf = BytesMut::with_capacity(MESSAGE_HEADER_LENGTH + CANCEL_TIMER_BLOCK_LENGTH);
    put_header(&mut buf, TEMPLATE_CANCEL_TIMER, CANCEL_TIMER_BLOCK_LENGTH);
    buf.put_i64_le(correlation_id);
    buf.freeze()
}

// ---- decoding --------------------------------------------------------------

struct Header {
    template_id: u16,
    block_length: usize,
}

fn need(frame: &[u8], needed: usize) -> Result<(), CodecError> {
    if frame.len() < needed {
        Err(CodecError::Truncated {
            needed,
            available: frame.len(),
        })
    } else {
        Ok(())
    }
}

fn read_header(frame: &[u8]) -> Result<Header, CodecError> {
    need(frame, MESSAGE_HEADER_LENGTH)?;
    let mut cursor = frame;
    let block_length = cursor.get_u16_le() as usize;
    let template_id = cursor.get_u16_le();
    let schema_id = cursor.get_u16_le();
    let _version = cursor.get_u16_le();

    if schema_id != SCHEMA_ID {
        return Err(CodecError::SchemaMismatch {
            schema_id,
            expected: SCHEMA_ID,
        });
    }

    need(frame, MESSAGE_HEADER_LENGTH + block_length)?;
    Ok(Header {
        template_id,
        block_length,
    })
}

impl Header {
    /// A frame's block must cover the template's fixed fields.
    fn check_block(&self, expected: usize) -> Result<(), CodecError> {
        if self.block_length < expected {
            return Err(CodecError::Truncated {
                needed: expected,
                available: self.block_length,
            });
        }
        Ok(())
    }
}

fn read_var_string(cursor: &mut &[u8], field: &'static str) -> Result<String, CodecError> {
    need(*cursor, 4)?;
    let len = cursor.get_u32_le() as usize;
    need(*cursor, len)?;
    let raw = &cursor[..len];
    let value = std::str::from_utf8(raw)
        .map_err(|_| CodecError::Utf8 { field })?
        .to_string();
    cursor.advance(len);
    Ok(value)
}

pub fn decode_ingress(frame: &Bytes) -> Result<IngressMessage, CodecError> {
    let header = read_header(frame)?;
    let mut cursor = &frame[MESSAGE_HEADER_LENGTH..];

    match header.template_id {
        TEMPLATE_SESSION_CONNECT => {
            header.check_block(SESSION_CONNECT_BLOCK_LENGTH)?;
            let correlation_id = cursor.get_i64_le();
            let response_stream_id = cursor.get_i32_le();
            let mut tail = &frame[MESSAGE_HEADER_LENGTH + header.block_length..];
            let response_channel = read_var_string(&mut tail, "response_channel")?;
            Ok(IngressMessage::SessionConnect {
                correlation_id,
                response_stream_id,
                response_channel,
            })
        }
        TEMPLATE_SESSION_MESSAGE => {
            header.check_block(SESSION_MESSAGE_BLOCK_LENGTH)?;
            Ok(IngressMessage::SessionMessage {
                cluster_session_id: cursor.get_i64_le(),
                correlation_id: cursor.get_i64_le(),
                timestamp_ms: cursor.get_u64_le(),
            })
        }
        TEMPLATE_SESSION_KEEP_ALIVE => {
            header.check_block(SESSION_KEEP_ALIVE_BLOCK_LENGTH)?;
            Ok(IngressMessage::KeepAlive {
                correlation_id: cursor.get_i64_le(),
                cluster_session_id: cursor.get_i64_le(),
            })
        }
        TEMPLATE_SESSION_CLOSE_REQUEST => {
            header.check_block(SESSION_CLOSE_REQUEST_BLOCK_LENGTH)?;
            Ok(IngressMessage::SessionClose {
                cluster_session_id: cursor.get_i64_le(),
            })
        }
        template_id => Err(CodecError::UnknownTemplate { template_id }),
    }
}

pub fn decode_log_event(frame: &Bytes) -> Result<LogEvent, CodecError> {
    let header = read_header(frame)?;
    let mut cursor = &frame[MESSAGE_HEADER_LENGTH..];

    match header.template_id {
        TEMPLATE_SESSION_OPEN_EVENT => {
            header.check_block(SESSION_OPEN_EVENT_BLOCK_LENGTH)?;
            let cluster_session_id = cursor.get_i64_le();
            let correlation_id = cursor.get_i64_le();
            let timestamp_ms = cursor.get_u64_le();
            let response_stream_id = cursor.get_i32_le();
            let mut tail = &frame[MESSAGE_HEADER_LENGTH + header.block_length..];
            let response_channel = read_var_string(&mut tail, "response_channel")?;
            Ok(LogEvent::SessionOpen {
                cluster_session_id,
                correlation_id,
                timestamp_ms,
                response_stream_id,
                response_channel,
            })
        }
        TEMPLATE_SESSION_MESSAGE => {
            header.check_block(SESSION_MESSAGE_BLOCK_LENGTH)?;
            Ok(LogEvent::SessionMessage {
                cluster_session_id: cursor.get_i64_le(),
                correlation_id: cursor.get_i64_le(),
                timestamp_ms: cursor.get_u64_le(),
                payload: frame.slice(MESSAGE_HEADER_LENGTH + header.block_length..),
            })
        }
        TEMPLATE_SESSION_CLOSE_EVENT => {
            header.check_block(SESSION_CLOSE_EVENT_BLOCK_LENGTH)?;
            let cluster_session_id = cursor.get_i64_le();
            let timestamp_ms = cursor.get_u64_le();
            let code = cursor.get_u32_le();
            let close_reason = CloseReason::from_code(code).ok_or(CodecError::UnknownCode {
                field: "close_reason",
                code,
            })?;
            Ok(LogEvent::SessionClose {
                cluster_session_id,
                timestamp_ms,
                close_reason,
            })
        }
        TEMPLATE_TIMER_EVENT => {
            header.check_block(TIMER_EVENT_BLOCK_LENGTH)?;
            Ok(LogEvent::Timer {
                correlation_id: cursor.get_i64_le(),
                timestamp_ms: cursor.get_u64_le(),
            })
        }
        template_id => Err(CodecError::UnknownTemplate { template_id }),
    }
}

pub fn decode_egress(frame: &Bytes) -> Result<EgressEvent, CodecError> {
    let header = read_header(frame)?;
    let mut cursor = &frame[MESSAGE_HEADER_LENGTH..];

    match header.template_id {
        TEMPLATE_SESSION_EVENT => {
            header.check_block(SESSION_EVENT_BLOCK_LENGTH)?;
            let cluster_session_id = cursor.get_i64_le();
            let correlation_id = cursor.get_i64_le();
            let code = cursor.get_u32_le();
            let code = EventCode::from_code(code).ok_or(CodecError::UnknownCode {
                field: "event_code",
                code,
            })?;
            let mut tail = &frame[MESSAGE_HEADER_LENGTH + header.block_length..];
            let detail = read_var_string(&mut tail, "detail")?;
            Ok(EgressEvent::Session {
                cluster_session_id,
                correlation_id,
                code,
                detail,
            })
        }
        template_id => Err(CodecError::UnknownTemplate { template_id }),
    }
}

pub fn decode_timer_request(frame: &Bytes) -> Result<TimerRequest, CodecError> {
    let header = read_header(frame)?;
    let mut cursor = &frame[MESSAGE_HEADER_LENGTH..];

    match header.template_id {
        TEMPLATE_SCHEDULE_TIMER => {
            header.check_block(SCHEDULE_TIMER_BLOCK_LENGTH)?;
            Ok(TimerRequest::Schedule {
                correlation_id: cursor.get_i64_le(),
                deadline_ms: cursor.get_u64_le(),
            })
        }
        TEMPLATE_CANCEL_TIMER => {
            header.check_block(CANCEL_TIMER_BLOCK_LENGTH)?;
            Ok(TimerRequest::Cancel {
                correlation_id: cursor.get_i64_le(),
            })
        }
        template_id => Err(CodecError::UnknownTemplate { template_id }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_connect_roundtrip() {
        let frame = encode_session_connect(42, 9, "ipc:resp-1");
        let decoded = decode_ingress(&frame).unwrap();
        assert_eq!(
            decoded,
            IngressMessage::SessionConnect {
                correlation_id: 42,
                response_stream_id: 9,
                response_channel: "ipc:resp-1".to_string(),
            }
        );
    }

    #[test]
    fn session_message_timestamp_patching() {
        let frame = encode_session_message(7, 11, 0, b"payload");
        let mut patched = frame.to_vec();
        patch_session_message_timestamp(&mut patched, 5_000);

        let decoded = decode_ingress(&Bytes::from(patched.clone())).unwrap();
        assert_eq!(
            decoded,
            IngressMessage::SessionMessage {
                cluster_session_id: 7,
                correlation_id: 11,
                timestamp_ms: 5_000,
            }
        );

        // The same frame decodes as a log event carrying the payload.
        let log = decode_log_event(&Bytes::from(patched)).unwrap();
        match log {
            LogEvent::SessionMessage {
                timestamp_ms,
                payload,
                ..
            } => {
                assert_eq!(timestamp_ms, 5_000);
                assert_eq!(payload.as_ref(), b"payload");
            }
            other => panic!("unexpected log event: {other:?}"),
        }
    }

    #[test]
    fn session_open_event_roundtrip() {
        let length = session_open_event_length("ipc:resp");
        let mut buf = vec![0u8; length];
        encode_session_open_event(&mut buf, 3, 21, 99, 5, "ipc:resp");

        let decoded = decode_log_event(&Bytes::from(buf)).unwrap();
        assert_eq!(
            decoded,
            LogEvent::SessionOpen {
                cluster_session_id: 3,
                correlation_id: 21,
                timestamp_ms: 99,
                response_stream_id: 5,
                response_channel: "ipc:resp".to_string(),
            }
        );
    }

    #[test]
    fn close_and_timer_events_roundtrip() {
        let mut buf = vec![0u8; SESSION_CLOSE_EVENT_LENGTH];
        encode_session_close_event(&mut buf, 4, 77, CloseReason::UserAction);
        assert_eq!(
            decode_log_event(&Bytes::from(buf)).unwrap(),
            LogEvent::SessionClose {
                cluster_session_id: 4,
                timestamp_ms: 77,
                close_reason: CloseReason::UserAction,
            }
        );

        let mut buf = vec![0u8; TIMER_EVENT_LENGTH];
        encode_timer_event(&mut buf, 31, 88);
        assert_eq!(
            decode_log_event(&Bytes::from(buf)).unwrap(),
            LogEvent::Timer {
                correlation_id: 31,
                timestamp_ms: 88,
            }
        );
    }

    #[test]
    fn egress_session_event_roundtrip() {
        let length = session_event_length("");
        let mut buf = vec![0u8; length];
        encode_session_event(&mut buf, 8, 15, EventCode::Ok, "");
        assert_eq!(
            decode_egress(&Bytes::from(buf)).unwrap(),
            EgressEvent::Session {
                cluster_session_id: 8,
                correlation_id: 15,
                code: EventCode::Ok,
                detail: String::new(),
            }
        );
    }

    #[test]
    fn timer_requests_roundtrip() {
        assert_eq!(
            decode_timer_request(&encode_schedule_timer(5, 100)).unwrap(),
            TimerRequest::Schedule {
                correlation_id: 5,
                deadline_ms: 100,
            }
        );
        assert_eq!(
            decode_timer_request(&encode_cancel_timer(5)).unwrap(),
            TimerRequest::Cancel { correlation_id: 5 }
        );
    }

    #[test]
    fn truncated_and_foreign_frames_are_rejected() {
        let frame = encode_session_connect(1, 2, "ipc:resp");
        let truncated = frame.slice(..6);
        assert!(matches!(
            decode_ingress(&truncated),
            Err(CodecError::Truncated { .. })
        ));

        let mut foreign = frame.to_vec();
        foreign[4] = 0xFF; // corrupt the schema id
        foreign[5] = 0xFF;
        assert!(matches!(
            decode_ingress(&Bytes::from(foreign)),
            Err(CodecError::SchemaMismatch { .. })
        ));
    }
}
