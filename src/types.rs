//! Core types for the table.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

/// Identifier for a topic, assigned by the table on first use of a name.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TopicId(pub u32);

impl fmt::Debug for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TopicId({})", self.0)
    }
}

impl fmt::Display for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier for a publisher. Zero is never assigned, so it can stand for
/// "no publisher" in option directives.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct PublisherId(pub u32);

impl PublisherId {
    /// The reserved "no publisher" id.
    pub const NONE: PublisherId = PublisherId(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for PublisherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublisherId({})", self.0)
    }
}

impl fmt::Display for PublisherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier for a subscriber.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubscriberId(pub u32);

impl fmt::Debug for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriberId({})", self.0)
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier for a live connection to a remote peer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub u32);

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({})", self.0)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Microseconds on the process-wide monotonic clock.
///
/// Zero is reserved: APIs that accept a timestamp treat `Timestamp(0)` as
/// "use the current time".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Timestamp(pub u64);

fn clock_base() -> Instant {
    static BASE: OnceLock<Instant> = OnceLock::new();
    *BASE.get_or_init(Instant::now)
}

impl Timestamp {
    /// The "use current time" sentinel.
    pub const NOW: Timestamp = Timestamp(0);

    /// Current time. Never returns the zero sentinel.
    pub fn now() -> Self {
        Timestamp(clock_base().elapsed().as_micros() as u64 + 1)
    }

    /// Resolve the zero sentinel to the current time.
    pub fn or_now(self) -> Self {
        if self.0 == 0 {
            Self::now()
        } else {
            self
        }
    }

    pub fn from_secs_f64(secs: f64) -> Self {
        Timestamp((secs.max(0.0) * 1_000_000.0) as u64)
    }

    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }

    /// Add a duration, saturating at the end of the clock.
    pub fn saturating_add(self, duration: Duration) -> Self {
        Timestamp(self.0.saturating_add(duration.as_micros() as u64))
    }

    /// Time elapsed from `earlier` to `self`, zero if `earlier` is later.
    pub fn saturating_duration_since(self, earlier: Timestamp) -> Duration {
        Duration::from_micros(self.0.saturating_sub(earlier.0))
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Kind of value a topic carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Boolean,
    Integer,
    Float,
    Double,
    String,
    Raw,
    BooleanArray,
    IntegerArray,
    FloatArray,
    DoubleArray,
    StringArray,
}

impl ValueType {
    /// Canonical type string used in announcements and data logs.
    pub fn type_str(self) -> &'static str {
        match self {
            ValueType::Boolean => "boolean",
            ValueType::Integer => "int64",
            ValueType::Float => "float",
            ValueType::Double => "double",
            ValueType::String => "string",
            ValueType::Raw => "raw",
            ValueType::BooleanArray => "boolean[]",
            ValueType::IntegerArray => "int64[]",
            ValueType::FloatArray => "float[]",
            ValueType::DoubleArray => "double[]",
            ValueType::StringArray => "string[]",
        }
    }

    /// Map a declared type string to its payload kind.
    ///
    /// Unknown strings (`"struct:Pose2d"`, `"json"`, `"msgpack"`) carry raw
    /// bytes.
    pub fn from_type_str(s: &str) -> Self {
        match s {
            "boolean" => ValueType::Boolean,
            "int64" | "int" => ValueType::Integer,
            "float" => ValueType::Float,
            "double" => ValueType::Double,
            "string" => ValueType::String,
            "boolean[]" => ValueType::BooleanArray,
            "int64[]" | "int[]" => ValueType::IntegerArray,
            "float[]" => ValueType::FloatArray,
            "double[]" => ValueType::DoubleArray,
            "string[]" => ValueType::StringArray,
            _ => ValueType::Raw,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_str())
    }
}

/// A typed value stored in a topic.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Boolean(bool),
    Integer(i64),
    Float(f32),
    Double(f64),
    String(String),
    Raw(Vec<u8>),
    BooleanArray(Vec<bool>),
    IntegerArray(Vec<i64>),
    FloatArray(Vec<f32>),
    DoubleArray(Vec<f64>),
    StringArray(Vec<String>),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Boolean(_) => ValueType::Boolean,
            Value::Integer(_) => ValueType::Integer,
            Value::Float(_) => ValueType::Float,
            Value::Double(_) => ValueType::Double,
            Value::String(_) => ValueType::String,
            Value::Raw(_) => ValueType::Raw,
            Value::BooleanArray(_) => ValueType::BooleanArray,
            Value::IntegerArray(_) => ValueType::IntegerArray,
            Value::FloatArray(_) => ValueType::FloatArray,
            Value::DoubleArray(_) => ValueType::DoubleArray,
            Value::StringArray(_) => ValueType::StringArray,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Raw(v)
    }
}

impl From<Vec<f64>> for Value {
    fn from(v: Vec<f64>) -> Self {
        Value::DoubleArray(v)
    }
}

impl From<Vec<f32>> for Value {
    fn from(v: Vec<f32>) -> Self {
        Value::FloatArray(v)
    }
}

impl From<Vec<i64>> for Value {
    fn from(v: Vec<i64>) -> Self {
        Value::IntegerArray(v)
    }
}

impl From<Vec<bool>> for Value {
    fn from(v: Vec<bool>) -> Self {
        Value::BooleanArray(v)
    }
}

impl From<Vec<String>> for Value {
    fn from(v: Vec<String>) -> Self {
        Value::StringArray(v)
    }
}

/// Where a value update came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Published through this table instance.
    Local,
    /// Received from a remote peer.
    Remote(ConnectionId),
}

impl Origin {
    pub fn is_local(self) -> bool {
        matches!(self, Origin::Local)
    }

    pub fn is_remote(self) -> bool {
        matches!(self, Origin::Remote(_))
    }
}

/// A value change travelling from a publisher to subscriber queues.
#[derive(Clone, Debug, PartialEq)]
pub struct ValueUpdate {
    pub topic: TopicId,
    /// Topic name, shared with the topic record.
    pub name: Arc<str>,
    pub value: Value,
    pub timestamp: Timestamp,
    pub publisher: PublisherId,
    pub origin: Origin,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_now_is_never_zero() {
        assert_ne!(Timestamp::now(), Timestamp::NOW);
        assert_ne!(Timestamp::NOW.or_now(), Timestamp::NOW);
        assert_eq!(Timestamp(42).or_now(), Timestamp(42));
    }

    #[test]
    fn test_timestamp_arithmetic() {
        let t = Timestamp::from_secs_f64(1.5);
        assert_eq!(t, Timestamp(1_500_000));
        assert_eq!(
            t.saturating_add(Duration::from_millis(250)),
            Timestamp(1_750_000)
        );
        assert_eq!(
            Timestamp(10).saturating_duration_since(Timestamp(20)),
            Duration::ZERO
        );
    }

    #[test]
    fn test_type_str_mapping() {
        assert_eq!(ValueType::from_type_str("double"), ValueType::Double);
        assert_eq!(ValueType::from_type_str("int64[]"), ValueType::IntegerArray);
        assert_eq!(ValueType::from_type_str("struct:Pose2d"), ValueType::Raw);
        assert_eq!(Value::from(1.0).value_type().type_str(), "double");
    }
}
