//! Typed messages exchanged on channels.
//!
//! Every message travels in an envelope:
//!
//! ```text
//! ┌─────────┬──────────────────┬──────────────┐
//! │ Tag (1) │ Body length (4)  │ Body (N)     │
//! │ u8      │ u32 BE           │              │
//! └─────────┴──────────────────┴──────────────┘
//! ```
//!
//! The set of messages is closed: an unknown tag is a protocol error. Each
//! variant wraps a struct so a receiver can ask for exactly the message it
//! expects with [`MessageChannel::receive_typed`].

mod channel;
mod wire;

pub use channel::MessageChannel;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Result, TaskwireError};
use crate::mediator::RunnerFilter;
use crate::runner::{StatusKind, StatusRecord};
use wire::{put_bytes, put_opt_str, put_str, put_str_list, BodyReader};

/// Size of the `[tag][body_length]` envelope prefix.
pub const ENVELOPE_SIZE: usize = 5;

/// Largest body a receiver accepts.
pub const MAX_BODY_SIZE: usize = 256 * 1024 * 1024;

/// Message tags.
pub mod tags {
    pub const TASK_REQUEST: u8 = 1;
    pub const TASK_RESPONSE: u8 = 2;
    pub const TASK_ERROR: u8 = 3;
    pub const TASK_CANCEL: u8 = 4;
    pub const DISCONNECT: u8 = 5;
    pub const ASSEMBLY_REQUEST: u8 = 10;
    pub const ASSEMBLY_RESPONSE: u8 = 11;
    pub const ASSEMBLY_ERROR: u8 = 12;
    pub const RUNNER_STATUS: u8 = 20;
    pub const RUNNER_REQUEST: u8 = 21;
    pub const RUNNER_ASSIGNMENT: u8 = 22;
    pub const RUNNER_UNAVAILABLE: u8 = 23;
}

/// Encoded work unit submitted for execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRequest {
    pub payload: Bytes,
}

/// Encoded result of a successful execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskResponse {
    pub payload: Bytes,
}

/// Class of a runner-side task failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FailureKind {
    Deserialization = 1,
    Invokation = 2,
    General = 3,
}

impl FailureKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Deserialization),
            2 => Some(Self::Invokation),
            3 => Some(Self::General),
            _ => None,
        }
    }
}

/// Typed failure reported by the runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskError {
    pub kind: FailureKind,
    pub message: String,
    pub detail: Option<String>,
}

impl TaskError {
    /// Describe a local error for the application.
    pub fn from_error(err: &TaskwireError) -> Self {
        match err {
            TaskwireError::Deserialization { message, detail } => Self {
                kind: FailureKind::Deserialization,
                message: message.clone(),
                detail: detail.clone(),
            },
            TaskwireError::Invokation { message, detail } => Self {
                kind: FailureKind::Invokation,
                message: message.clone(),
                detail: detail.clone(),
            },
            TaskwireError::General { message, detail } => Self {
                kind: FailureKind::General,
                message: message.clone(),
                detail: detail.clone(),
            },
            other => Self {
                kind: FailureKind::General,
                message: other.to_string(),
                detail: None,
            },
        }
    }

    /// The error the application surfaces for this failure.
    pub fn into_error(self) -> TaskwireError {
        let Self {
            kind,
            message,
            detail,
        } = self;
        match kind {
            FailureKind::Deserialization => TaskwireError::Deserialization { message, detail },
            FailureKind::Invokation => TaskwireError::Invokation { message, detail },
            FailureKind::General => TaskwireError::General { message, detail },
        }
    }
}

/// Application asks the runner to abandon the task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskCancel {
    pub reason: String,
}

/// Orderly end of a session at the message level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnect {
    pub reason: String,
}

/// Runner asks the application for a dependency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblyRequest {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblyResponse {
    pub name: String,
    pub bytes: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblyError {
    pub name: String,
    pub detail: String,
}

/// Runner reports its state to the mediator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerStatus {
    pub record: StatusRecord,
}

/// Application asks the mediator for a runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerRequest {
    pub filter: RunnerFilter,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerAssignment {
    pub runner_id: String,
    pub endpoint: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerUnavailable {
    pub detail: String,
}

/// Every message the protocol knows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    TaskRequest(TaskRequest),
    TaskResponse(TaskResponse),
    TaskError(TaskError),
    TaskCancel(TaskCancel),
    Disconnect(Disconnect),
    AssemblyRequest(AssemblyRequest),
    AssemblyResponse(AssemblyResponse),
    AssemblyError(AssemblyError),
    RunnerStatus(RunnerStatus),
    RunnerRequest(RunnerRequest),
    RunnerAssignment(RunnerAssignment),
    RunnerUnavailable(RunnerUnavailable),
}

/// A message struct that can be received on its own.
pub trait TypedMessage: Into<Message> + Sized {
    const NAME: &'static str;

    /// Unwrap the matching variant, or give the message back.
    fn from_message(message: Message) -> std::result::Result<Self, Message>;
}

macro_rules! typed_message {
    ($($variant:ident),* $(,)?) => {
        $(
            impl From<$variant> for Message {
                fn from(value: $variant) -> Self {
                    Message::$variant(value)
                }
            }

            impl TypedMessage for $variant {
                const NAME: &'static str = stringify!($variant);

                fn from_message(message: Message) -> std::result::Result<Self, Message> {
                    match message {
                        Message::$variant(value) => Ok(value),
                        other => Err(other),
                    }
                }
            }
        )*

        impl Message {
            /// Variant name, for logs and errors.
            pub fn name(&self) -> &'static str {
                match self {
                    $(Message::$variant(_) => stringify!($variant),)*
                }
            }
        }
    };
}

typed_message!(
    TaskRequest,
    TaskResponse,
    TaskError,
    TaskCancel,
    Disconnect,
    AssemblyRequest,
    AssemblyResponse,
    AssemblyError,
    RunnerStatus,
    RunnerRequest,
    RunnerAssignment,
    RunnerUnavailable,
);

impl Message {
    pub fn tag(&self) -> u8 {
        match self {
            Self::TaskRequest(_) => tags::TASK_REQUEST,
            Self::TaskResponse(_) => tags::TASK_RESPONSE,
            Self::TaskError(_) => tags::TASK_ERROR,
            Self::TaskCancel(_) => tags::TASK_CANCEL,
            Self::Disconnect(_) => tags::DISCONNECT,
            Self::AssemblyRequest(_) => tags::ASSEMBLY_REQUEST,
            Self::AssemblyResponse(_) => tags::ASSEMBLY_RESPONSE,
            Self::AssemblyError(_) => tags::ASSEMBLY_ERROR,
            Self::RunnerStatus(_) => tags::RUNNER_STATUS,
            Self::RunnerRequest(_) => tags::RUNNER_REQUEST,
            Self::RunnerAssignment(_) => tags::RUNNER_ASSIGNMENT,
            Self::RunnerUnavailable(_) => tags::RUNNER_UNAVAILABLE,
        }
    }

    /// Encode the full envelope.
    pub fn encode(&self) -> Bytes {
        let mut body = BytesMut::new();
        self.encode_body(&mut body);

        let mut out = BytesMut::with_capacity(ENVELOPE_SIZE + body.len());
        out.put_u8(self.tag());
        out.put_u32(body.len() as u32);
        out.extend_from_slice(&body);
        out.freeze()
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        match self {
            Self::TaskRequest(m) => put_bytes(buf, &m.payload),
            Self::TaskResponse(m) => put_bytes(buf, &m.payload),
            Self::TaskError(m) => {
                buf.put_u8(m.kind as u8);
                put_str(buf, &m.message);
                put_opt_str(buf, m.detail.as_deref());
            }
            Self::TaskCancel(m) => put_str(buf, &m.reason),
            Self::Disconnect(m) => put_str(buf, &m.reason),
            Self::AssemblyRequest(m) => put_str(buf, &m.name),
            Self::AssemblyResponse(m) => {
                put_str(buf, &m.name);
                put_bytes(buf, &m.bytes);
            }
            Self::AssemblyError(m) => {
                put_str(buf, &m.name);
                put_str(buf, &m.detail);
            }
            Self::RunnerStatus(m) => {
                let r = &m.record;
                put_str(buf, &r.runner_id);
                put_str(buf, &r.endpoint);
                buf.put_u8(r.status as u8);
                put_str(buf, &r.platform);
                put_str(buf, &r.os_version);
                buf.put_u32(r.available_slots);
                buf.put_u32(r.queue_length);
                put_opt_str(buf, r.label.as_deref());
                put_str_list(buf, &r.tags);
            }
            Self::RunnerRequest(m) => {
                put_str_list(buf, &m.filter.platforms);
                put_opt_str(buf, m.filter.label.as_deref());
                put_str_list(buf, &m.filter.tags);
            }
            Self::RunnerAssignment(m) => {
                put_str(buf, &m.runner_id);
                put_str(buf, &m.endpoint);
            }
            Self::RunnerUnavailable(m) => put_str(buf, &m.detail),
        }
    }

    /// Decode a body received under `tag`.
    pub fn decode(tag: u8, body: Bytes) -> Result<Self> {
        let mut r = BodyReader::new(body);
        let message = match tag {
            tags::TASK_REQUEST => Self::TaskRequest(TaskRequest { payload: r.bytes()? }),
            tags::TASK_RESPONSE => Self::TaskResponse(TaskResponse { payload: r.bytes()? }),
            tags::TASK_ERROR => {
                let raw = r.u8()?;
                let kind = FailureKind::from_u8(raw).ok_or_else(|| {
                    TaskwireError::Protocol(format!("Unknown failure kind {}", raw))
                })?;
                Self::TaskError(TaskError {
                    kind,
                    message: r.string()?,
                    detail: r.opt_string()?,
                })
            }
            tags::TASK_CANCEL => Self::TaskCancel(TaskCancel { reason: r.string()? }),
            tags::DISCONNECT => Self::Disconnect(Disconnect { reason: r.string()? }),
            tags::ASSEMBLY_REQUEST => Self::AssemblyRequest(AssemblyRequest { name: r.string()? }),
            tags::ASSEMBLY_RESPONSE => Self::AssemblyResponse(AssemblyResponse {
                name: r.string()?,
                bytes: r.bytes()?,
            }),
            tags::ASSEMBLY_ERROR => Self::AssemblyError(AssemblyError {
                name: r.string()?,
                detail: r.string()?,
            }),
            tags::RUNNER_STATUS => {
                let runner_id = r.string()?;
                let endpoint = r.string()?;
                let raw = r.u8()?;
                let status = StatusKind::from_u8(raw).ok_or_else(|| {
                    TaskwireError::Protocol(format!("Unknown runner status {}", raw))
                })?;
                Self::RunnerStatus(RunnerStatus {
                    record: StatusRecord {
                        runner_id,
                        endpoint,
                        status,
                        platform: r.string()?,
                        os_version: r.string()?,
                        available_slots: r.u32()?,
                        queue_length: r.u32()?,
                        label: r.opt_string()?,
                        tags: r.string_list()?,
                    },
                })
            }
            tags::RUNNER_REQUEST => Self::RunnerRequest(RunnerRequest {
                filter: RunnerFilter {
                    platforms: r.string_list()?,
                    label: r.opt_string()?,
                    tags: r.string_list()?,
                },
            }),
            tags::RUNNER_ASSIGNMENT => Self::RunnerAssignment(RunnerAssignment {
                runner_id: r.string()?,
                endpoint: r.string()?,
            }),
            tags::RUNNER_UNAVAILABLE => {
                Self::RunnerUnavailable(RunnerUnavailable { detail: r.string()? })
            }
            other => {
                return Err(TaskwireError::Protocol(format!(
                    "Unknown message tag {}",
                    other
                )))
            }
        };
        r.finish()?;
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_envelope(encoded: Bytes) -> Message {
        let tag = encoded[0];
        let len = u32::from_be_bytes([encoded[1], encoded[2], encoded[3], encoded[4]]) as usize;
        assert_eq!(encoded.len(), ENVELOPE_SIZE + len);
        Message::decode(tag, encoded.slice(ENVELOPE_SIZE..)).unwrap()
    }

    #[test]
    fn test_task_request_envelope_layout() {
        let msg: Message = TaskRequest {
            payload: Bytes::from_static(b"abc"),
        }
        .into();
        let encoded = msg.encode();
        assert_eq!(
            &encoded[..],
            &[tags::TASK_REQUEST, 0, 0, 0, 7, 0, 0, 0, 3, b'a', b'b', b'c']
        );
    }

    #[test]
    fn test_status_record_survives_encoding() {
        let msg: Message = RunnerStatus {
            record: StatusRecord {
                runner_id: "r-1".into(),
                endpoint: "10.0.0.5:7420".into(),
                status: StatusKind::BeginJob,
                platform: "linux-x86_64".into(),
                os_version: "6.1".into(),
                available_slots: 3,
                queue_length: 1,
                label: Some("blue".into()),
                tags: vec!["gpu".into(), "fast".into()],
            },
        }
        .into();
        assert_eq!(decode_envelope(msg.encode()), msg);
    }

    #[test]
    fn test_task_error_keeps_kind_and_detail() {
        let msg: Message = TaskError {
            kind: FailureKind::Invokation,
            message: "division by zero".into(),
            detail: None,
        }
        .into();
        assert_eq!(decode_envelope(msg.encode()), msg);
    }

    #[test]
    fn test_runner_request_with_empty_filter() {
        let msg: Message = RunnerRequest {
            filter: RunnerFilter::default(),
        }
        .into();
        let encoded = msg.encode();
        // platforms count + label marker + tags count
        assert_eq!(encoded.len(), ENVELOPE_SIZE + 4 + 1 + 4);
        assert_eq!(decode_envelope(encoded), msg);
    }

    #[test]
    fn test_unknown_tag_is_protocol_error() {
        assert!(matches!(
            Message::decode(200, Bytes::new()),
            Err(TaskwireError::Protocol(_))
        ));
    }

    #[test]
    fn test_unknown_failure_kind_is_protocol_error() {
        let body = Bytes::from_static(&[9, 0, 0, 0, 0, 0]);
        assert!(matches!(
            Message::decode(tags::TASK_ERROR, body),
            Err(TaskwireError::Protocol(_))
        ));
    }

    #[test]
    fn test_trailing_body_bytes_rejected() {
        let body = Bytes::from_static(&[0, 0, 0, 1, b'x', 0xFF]);
        assert!(Message::decode(tags::TASK_CANCEL, body).is_err());
    }

    #[test]
    fn test_task_error_maps_back_to_typed_error() {
        let err = TaskwireError::deserialization("missing dependency 'lib'");
        let wire = TaskError::from_error(&err);
        assert_eq!(wire.kind, FailureKind::Deserialization);
        assert!(matches!(
            wire.into_error(),
            TaskwireError::Deserialization { message, .. } if message.contains("lib")
        ));

        let other = TaskError::from_error(&TaskwireError::ConnectionClosed);
        assert_eq!(other.kind, FailureKind::General);
    }

    #[test]
    fn test_typed_unwrap() {
        let msg: Message = TaskCancel {
            reason: "user".into(),
        }
        .into();
        assert_eq!(msg.name(), "TaskCancel");
        assert!(TaskResponse::from_message(msg.clone()).is_err());
        assert_eq!(TaskCancel::from_message(msg).unwrap().reason, "user");
    }
}
