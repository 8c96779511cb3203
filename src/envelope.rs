//! Log stream envelopes.
//!
//! One envelope is carried per WebSocket message (or per part of a
//! recent-logs response), protobuf encoded. The `event_type` discriminant
//! says which of the payload fields is populated.

use crate::error::Result;
use crate::time::Time;
use prost::Message;
use std::collections::BTreeMap;

/// Kind of event carried by an envelope
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum EventType {
    HttpStartStop = 4,
    LogMessage = 5,
    ValueMetric = 6,
    CounterEvent = 7,
    Error = 8,
    ContainerMetric = 9,
}

/// Stream a log line was written to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum MessageType {
    Out = 1,
    Err = 2,
}

/// Which side of an HTTP exchange recorded a timing event
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum PeerType {
    Client = 1,
    Server = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum Method {
    Get = 1,
    Post = 2,
    Put = 3,
    Delete = 4,
    Head = 5,
    Options = 6,
    Patch = 7,
}

/// A 128-bit identifier split into two little-endian halves
#[derive(Clone, Copy, PartialEq, Eq, Hash, Message)]
pub struct Uuid {
    #[prost(uint64, required, tag = "1")]
    pub low: u64,
    #[prost(uint64, required, tag = "2")]
    pub high: u64,
}

impl Uuid {
    /// Render in the canonical hyphenated form
    pub fn to_uuid(&self) -> uuid::Uuid {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&self.low.to_le_bytes());
        bytes[8..].copy_from_slice(&self.high.to_le_bytes());
        uuid::Uuid::from_bytes(bytes)
    }
}

/// One line written by an application or platform component
#[derive(Clone, PartialEq, Message)]
pub struct LogMessage {
    #[prost(bytes = "vec", required, tag = "1")]
    pub message: Vec<u8>,
    #[prost(enumeration = "MessageType", required, tag = "2")]
    pub message_type: i32,
    #[prost(int64, required, tag = "3")]
    pub timestamp: i64,
    #[prost(string, optional, tag = "4")]
    pub app_id: Option<String>,
    #[prost(string, optional, tag = "5")]
    pub source_type: Option<String>,
    #[prost(string, optional, tag = "6")]
    pub source_instance: Option<String>,
}

impl LogMessage {
    /// The message text, lossily decoded as UTF-8
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.message).into_owned()
    }
}

/// Timing record of one HTTP request/response
#[derive(Clone, PartialEq, Message)]
pub struct HttpStartStop {
    #[prost(int64, required, tag = "1")]
    pub start_timestamp: i64,
    #[prost(int64, required, tag = "2")]
    pub stop_timestamp: i64,
    #[prost(message, required, tag = "3")]
    pub request_id: Uuid,
    #[prost(enumeration = "PeerType", required, tag = "4")]
    pub peer_type: i32,
    #[prost(enumeration = "Method", required, tag = "5")]
    pub method: i32,
    #[prost(string, required, tag = "6")]
    pub uri: String,
    #[prost(string, required, tag = "7")]
    pub remote_address: String,
    #[prost(string, required, tag = "8")]
    pub user_agent: String,
    #[prost(int32, required, tag = "9")]
    pub status_code: i32,
    #[prost(int64, required, tag = "10")]
    pub content_length: i64,
    #[prost(message, optional, tag = "12")]
    pub application_id: Option<Uuid>,
    #[prost(int32, optional, tag = "13")]
    pub instance_index: Option<i32>,
    #[prost(string, optional, tag = "14")]
    pub instance_id: Option<String>,
    #[prost(string, repeated, tag = "15")]
    pub forwarded: Vec<String>,
}

impl HttpStartStop {
    /// Duration of the exchange in nanoseconds
    pub fn duration_nanos(&self) -> i64 {
        self.stop_timestamp.saturating_sub(self.start_timestamp)
    }
}

/// A numeric gauge
#[derive(Clone, PartialEq, Message)]
pub struct ValueMetric {
    #[prost(string, required, tag = "1")]
    pub name: String,
    #[prost(double, required, tag = "2")]
    pub value: f64,
    #[prost(string, required, tag = "3")]
    pub unit: String,
}

/// A counter increment
#[derive(Clone, PartialEq, Message)]
pub struct CounterEvent {
    #[prost(string, required, tag = "1")]
    pub name: String,
    #[prost(uint64, required, tag = "2")]
    pub delta: u64,
    #[prost(uint64, optional, tag = "3")]
    pub total: Option<u64>,
}

/// An error reported by a platform component
#[derive(Clone, PartialEq, Message)]
pub struct Error {
    #[prost(string, required, tag = "1")]
    pub source: String,
    #[prost(int32, required, tag = "2")]
    pub code: i32,
    #[prost(string, required, tag = "3")]
    pub message: String,
}

/// Resource usage of one application instance
#[derive(Clone, PartialEq, Message)]
pub struct ContainerMetric {
    #[prost(string, required, tag = "1")]
    pub application_id: String,
    #[prost(int32, required, tag = "2")]
    pub instance_index: i32,
    #[prost(double, required, tag = "3")]
    pub cpu_percentage: f64,
    #[prost(uint64, required, tag = "4")]
    pub memory_bytes: u64,
    #[prost(uint64, required, tag = "5")]
    pub disk_bytes: u64,
    #[prost(uint64, optional, tag = "6")]
    pub memory_bytes_quota: Option<u64>,
    #[prost(uint64, optional, tag = "7")]
    pub disk_bytes_quota: Option<u64>,
}

/// One decoded unit of the log stream
#[derive(Clone, PartialEq, Message)]
pub struct Envelope {
    #[prost(string, required, tag = "1")]
    pub origin: String,
    #[prost(enumeration = "EventType", required, tag = "2")]
    pub event_type: i32,
    /// Nanoseconds since the epoch
    #[prost(int64, optional, tag = "6")]
    pub timestamp: Option<i64>,
    #[prost(message, optional, tag = "7")]
    pub http_start_stop: Option<HttpStartStop>,
    #[prost(message, optional, tag = "8")]
    pub log_message: Option<LogMessage>,
    #[prost(message, optional, tag = "9")]
    pub value_metric: Option<ValueMetric>,
    #[prost(message, optional, tag = "10")]
    pub counter_event: Option<CounterEvent>,
    #[prost(message, optional, tag = "11")]
    pub error: Option<Error>,
    #[prost(message, optional, tag = "12")]
    pub container_metric: Option<ContainerMetric>,
    #[prost(string, optional, tag = "13")]
    pub deployment: Option<String>,
    #[prost(string, optional, tag = "14")]
    pub job: Option<String>,
    #[prost(string, optional, tag = "15")]
    pub index: Option<String>,
    #[prost(string, optional, tag = "16")]
    pub ip: Option<String>,
    #[prost(btree_map = "string, string", tag = "17")]
    pub tags: BTreeMap<String, String>,
}

/// Borrowed view of the payload selected by the event type
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Payload<'a> {
    Log(&'a LogMessage),
    HttpStartStop(&'a HttpStartStop),
    ValueMetric(&'a ValueMetric),
    CounterEvent(&'a CounterEvent),
    Error(&'a Error),
    ContainerMetric(&'a ContainerMetric),
    /// Unknown event type, or the payload field for it is absent
    Missing,
}

impl Envelope {
    /// Decode one binary frame
    pub fn from_frame(frame: &[u8]) -> Result<Self> {
        Ok(Envelope::decode(frame)?)
    }

    /// Encode into one binary frame
    pub fn to_frame(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    /// Event kind, `None` for kinds this client does not know
    pub fn kind(&self) -> Option<EventType> {
        EventType::try_from(self.event_type).ok()
    }

    /// Envelope time; log messages fall back to their own timestamp
    pub fn time(&self) -> Option<Time> {
        self.timestamp
            .or_else(|| self.log_message.as_ref().map(|log| log.timestamp))
            .map(Time::from_unix_nanos)
    }

    /// The kind-specific payload
    pub fn payload(&self) -> Payload<'_> {
        let payload = match self.kind() {
            Some(EventType::LogMessage) => self.log_message.as_ref().map(Payload::Log),
            Some(EventType::HttpStartStop) => self.http_start_stop.as_ref().map(Payload::HttpStartStop),
            Some(EventType::ValueMetric) => self.value_metric.as_ref().map(Payload::ValueMetric),
            Some(EventType::CounterEvent) => self.counter_event.as_ref().map(Payload::CounterEvent),
            Some(EventType::Error) => self.error.as_ref().map(Payload::Error),
            Some(EventType::ContainerMetric) => self.container_metric.as_ref().map(Payload::ContainerMetric),
            None => None,
        };
        payload.unwrap_or(Payload::Missing)
    }

    /// A log message envelope
    pub fn log(origin: impl Into<String>, log: LogMessage) -> Self {
        Envelope {
            origin: origin.into(),
            event_type: EventType::LogMessage as i32,
            timestamp: Some(log.timestamp),
            log_message: Some(log),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_envelope() -> Envelope {
        let mut envelope = Envelope::log(
            "rep",
            LogMessage {
                message: b"Hello from app".to_vec(),
                message_type: MessageType::Out as i32,
                timestamp: 1_597_242_491_747_497_000,
                app_id: Some("a1".into()),
                source_type: Some("APP/PROC/WEB".into()),
                source_instance: Some("0".into()),
            },
        );
        envelope.deployment = Some("cf".into());
        envelope.job = Some("diego-cell".into());
        envelope.index = Some("3f1c".into());
        envelope.ip = Some("10.0.16.5".into());
        envelope.tags.insert("source_id".into(), "a1".into());
        envelope.tags.insert("app_name".into(), "my-app".into());
        envelope
    }

    fn http_envelope() -> Envelope {
        Envelope {
            origin: "gorouter".into(),
            event_type: EventType::HttpStartStop as i32,
            timestamp: Some(1_000),
            http_start_stop: Some(HttpStartStop {
                start_timestamp: 1_000,
                stop_timestamp: 4_500,
                request_id: Uuid { low: 7, high: 9 },
                peer_type: PeerType::Client as i32,
                method: Method::Get as i32,
                uri: "http://my-app.example.com/health".into(),
                remote_address: "10.0.0.1:51234".into(),
                user_agent: "curl/8.0".into(),
                status_code: 200,
                content_length: 2,
                application_id: Some(Uuid { low: 1, high: 2 }),
                instance_index: Some(0),
                instance_id: Some("f00".into()),
                forwarded: vec!["203.0.113.7".into()],
            }),
            ..Default::default()
        }
    }

    fn all_kinds() -> Vec<Envelope> {
        vec![
            log_envelope(),
            http_envelope(),
            Envelope {
                origin: "metron".into(),
                event_type: EventType::ValueMetric as i32,
                timestamp: Some(2_000),
                value_metric: Some(ValueMetric {
                    name: "memoryStats.numBytesAllocated".into(),
                    value: 1536.5,
                    unit: "bytes".into(),
                }),
                ..Default::default()
            },
            Envelope {
                origin: "router".into(),
                event_type: EventType::CounterEvent as i32,
                timestamp: Some(3_000),
                counter_event: Some(CounterEvent {
                    name: "requests".into(),
                    delta: 5,
                    total: Some(105),
                }),
                ..Default::default()
            },
            Envelope {
                origin: "cc".into(),
                event_type: EventType::Error as i32,
                error: Some(Error {
                    source: "api".into(),
                    code: 500,
                    message: "boom".into(),
                }),
                ..Default::default()
            },
            Envelope {
                origin: "rep".into(),
                event_type: EventType::ContainerMetric as i32,
                timestamp: Some(4_000),
                container_metric: Some(ContainerMetric {
                    application_id: "a1".into(),
                    instance_index: 1,
                    cpu_percentage: 12.25,
                    memory_bytes: 1 << 27,
                    disk_bytes: 1 << 28,
                    memory_bytes_quota: Some(1 << 30),
                    disk_bytes_quota: None,
                }),
                ..Default::default()
            },
        ]
    }

    #[test]
    fn test_reencoding_is_byte_identical_for_every_kind() {
        for envelope in all_kinds() {
            let frame = envelope.to_frame();
            let decoded = Envelope::from_frame(&frame).unwrap();
            assert_eq!(decoded, envelope);
            assert_eq!(decoded.to_frame(), frame, "kind {:?}", envelope.kind());
        }
    }

    #[test]
    fn test_payload_follows_event_type() {
        let envelopes = all_kinds();
        let kinds: Vec<_> = envelopes.iter().map(|e| std::mem::discriminant(&e.payload())).collect();
        assert_eq!(kinds.len(), 6);
        assert!(kinds.windows(2).all(|w| w[0] != w[1]));

        let log = log_envelope();
        match log.payload() {
            Payload::Log(message) => {
                assert_eq!(message.text(), "Hello from app");
                assert_eq!(message.message_type(), MessageType::Out);
            }
            other => panic!("expected log payload, got {other:?}"),
        }

        let mut mismatched = log_envelope();
        mismatched.event_type = EventType::ValueMetric as i32;
        assert_eq!(mismatched.payload(), Payload::Missing);

        let mut unknown = log_envelope();
        unknown.event_type = 42;
        assert_eq!(unknown.kind(), None);
        assert_eq!(unknown.payload(), Payload::Missing);
    }

    #[test]
    fn test_http_start_stop_helpers() {
        let envelope = http_envelope();
        let Payload::HttpStartStop(http) = envelope.payload() else {
            panic!("expected http payload");
        };
        assert_eq!(http.duration_nanos(), 3_500);
        assert_eq!(http.method(), Method::Get);
        assert_eq!(
            http.request_id.to_uuid().to_string(),
            "07000000-0000-0000-0900-000000000000"
        );
    }

    #[test]
    fn test_time_falls_back_to_log_timestamp() {
        let mut envelope = log_envelope();
        envelope.timestamp = None;
        assert_eq!(envelope.time().map(|t| t.unix()), Some(1_597_242_491));
    }

    #[test]
    fn test_malformed_frame() {
        assert!(matches!(
            Envelope::from_frame(&[0x0a, 0xff, 0x01]),
            Err(crate::error::ClientError::Decode(_))
        ));
        let empty = Envelope::from_frame(&[]).unwrap();
        assert_eq!(empty.kind(), None);
        assert_eq!(empty.payload(), Payload::Missing);
    }
}
