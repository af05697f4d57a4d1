// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================
// The record that flows through every stage of the pipeline. Metrics are
// owned values: a stage that wants to change one takes it by value and hands
// back a new (or explicitly copied) metric, so concurrent consumers of the
// same batch never observe in-place mutation.
// ============================================================================

use std::fmt::{self, Display, Formatter};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use xxhash_rust::xxh3::Xxh3;

use crate::tracking::{Settlement, TrackingId, TrackingRef};

// ----------------------------------------------------------------------------
// 3.1 Timestamp - Nanosecond Precision Time Handling
// ----------------------------------------------------------------------------

/// High-precision timestamp in nanoseconds since Unix epoch.
/// Using i64 allows representing times from ~1677 to ~2262.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Create a new timestamp from nanoseconds since Unix epoch
    #[inline]
    pub const fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    /// Create a new timestamp from seconds since Unix epoch
    #[inline]
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs * 1_000_000_000)
    }

    /// Get the current timestamp with nanosecond precision
    #[inline]
    pub fn now() -> Self {
        Self::from(SystemTime::now())
    }

    #[inline]
    pub const fn as_nanos(&self) -> i64 {
        self.0
    }

    #[inline]
    pub const fn as_secs(&self) -> i64 {
        self.0 / 1_000_000_000
    }

    /// Calculate duration between two timestamps (zero if `earlier` is later)
    #[inline]
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        let nanos = self.0.saturating_sub(earlier.0);
        Duration::from_nanos(nanos.max(0) as u64)
    }

    /// Truncate to a multiple of `precision`. A zero precision keeps nanoseconds.
    pub fn truncate(&self, precision: Duration) -> Self {
        let step = precision.as_nanos().min(i64::MAX as u128) as i64;
        if step <= 1 {
            return *self;
        }
        Self(self.0 - self.0.rem_euclid(step))
    }

    /// Convert to chrono DateTime<Utc>
    pub fn to_datetime(&self) -> DateTime<Utc> {
        let secs = self.0.div_euclid(1_000_000_000);
        let nanos = self.0.rem_euclid(1_000_000_000) as u32;
        DateTime::from_timestamp(secs, nanos).unwrap_or_default()
    }

    /// Zero timestamp (Unix epoch)
    pub const EPOCH: Timestamp = Timestamp(0);
}

impl Default for Timestamp {
    #[inline]
    fn default() -> Self {
        Self::now()
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().format("%Y-%m-%dT%H:%M:%S%.9fZ"))
    }
}

impl From<i64> for Timestamp {
    #[inline]
    fn from(nanos: i64) -> Self {
        Self(nanos)
    }
}

impl From<SystemTime> for Timestamp {
    fn from(st: SystemTime) -> Self {
        let duration = st.duration_since(UNIX_EPOCH).unwrap_or_default();
        Self(duration.as_nanos().min(i64::MAX as u128) as i64)
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp_nanos_opt().unwrap_or(0))
    }
}

// ----------------------------------------------------------------------------
// 3.2 Tags - Key-Value Dimensional Data
// ----------------------------------------------------------------------------

/// A single tag (key-value pair) of a metric.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag {
    pub key: CompactString,
    pub value: CompactString,
}

impl Tag {
    #[inline]
    pub fn new<K, V>(key: K, value: V) -> Self
    where
        K: Into<CompactString>,
        V: Into<CompactString>,
    {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl Display for Tag {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// Tag set with unique keys.
///
/// Insertion order is kept for serialization; equality ignores order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tags(SmallVec<[Tag; 8]>);

impl Tags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|t| t.key.as_str() == key)
            .map(|t| t.value.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.iter().any(|t| t.key.as_str() == key)
    }

    /// Add or overwrite a tag. An overwritten tag keeps its position.
    pub fn set<K, V>(&mut self, key: K, value: V)
    where
        K: Into<CompactString>,
        V: Into<CompactString>,
    {
        let key = key.into();
        let value = value.into();
        if let Some(tag) = self.0.iter_mut().find(|t| t.key == key) {
            tag.value = value;
        } else {
            self.0.push(Tag { key, value });
        }
    }

    /// Add a tag only if the key is not present yet.
    pub fn set_if_absent<K, V>(&mut self, key: K, value: V)
    where
        K: Into<CompactString> + AsRef<str>,
        V: Into<CompactString>,
    {
        if !self.contains_key(key.as_ref()) {
            self.0.push(Tag::new(key, value));
        }
    }

    pub fn remove_tag(&mut self, key: &str) -> Option<Tag> {
        let pos = self.0.iter().position(|t| t.key.as_str() == key)?;
        Some(self.0.remove(pos))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tag> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Tags ordered by key, for hashing and key-sorted encodings.
    pub fn sorted(&self) -> SmallVec<[&Tag; 8]> {
        let mut sorted: SmallVec<[&Tag; 8]> = self.0.iter().collect();
        sorted.sort_by(|a, b| a.key.cmp(&b.key));
        sorted
    }
}

impl PartialEq for Tags {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .0
                .iter()
                .all(|t| other.get(&t.key) == Some(t.value.as_str()))
    }
}

impl Eq for Tags {}

impl<K, V> FromIterator<(K, V)> for Tags
where
    K: Into<CompactString>,
    V: Into<CompactString>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut tags = Tags::new();
        for (k, v) in iter {
            tags.set(k, v);
        }
        tags
    }
}

// ----------------------------------------------------------------------------
// 3.3 Field Values
// ----------------------------------------------------------------------------

/// Typed value of a single field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Int(i64),
    Uint(u64),
    Float(f64),
    Bool(bool),
    String(CompactString),
}

impl FieldValue {
    /// Numeric view used by aggregations; strings have none.
    #[inline]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Int(v) => Some(*v as f64),
            FieldValue::Uint(v) => Some(*v as f64),
            FieldValue::Float(v) => Some(*v),
            FieldValue::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            FieldValue::String(_) => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            FieldValue::Int(_) => "int",
            FieldValue::Uint(_) => "uint",
            FieldValue::Float(_) => "float",
            FieldValue::Bool(_) => "bool",
            FieldValue::String(_) => "string",
        }
    }
}

impl Display for FieldValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Int(v) => write!(f, "{}i", v),
            FieldValue::Uint(v) => write!(f, "{}u", v),
            FieldValue::Float(v) => write!(f, "{}", v),
            FieldValue::Bool(v) => write!(f, "{}", v),
            FieldValue::String(s) => write!(f, "\"{}\"", s),
        }
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        FieldValue::Int(v as i64)
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        FieldValue::Uint(v)
    }
}

impl From<usize> for FieldValue {
    fn from(v: usize) -> Self {
        FieldValue::Uint(v as u64)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::String(CompactString::from(v))
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::String(CompactString::from(v))
    }
}

/// A named field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub key: CompactString,
    pub value: FieldValue,
}

/// Field set with unique keys, insertion ordered.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fields(SmallVec<[Field; 4]>);

impl Fields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.0
            .iter()
            .find(|f| f.key.as_str() == key)
            .map(|f| &f.value)
    }

    pub fn set<K, V>(&mut self, key: K, value: V)
    where
        K: Into<CompactString>,
        V: Into<FieldValue>,
    {
        let key = key.into();
        let value = value.into();
        if let Some(field) = self.0.iter_mut().find(|f| f.key == key) {
            field.value = value;
        } else {
            self.0.push(Field { key, value });
        }
    }

    pub fn retain<F: FnMut(&Field) -> bool>(&mut self, mut f: F) {
        self.0.retain(|field| f(field));
    }

    pub fn remove_field(&mut self, key: &str) -> Option<Field> {
        let pos = self.0.iter().position(|f| f.key.as_str() == key)?;
        Some(self.0.remove(pos))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Field> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl PartialEq for Fields {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .0
                .iter()
                .all(|f| other.get(&f.key) == Some(&f.value))
    }
}

impl<K, V> FromIterator<(K, V)> for Fields
where
    K: Into<CompactString>,
    V: Into<FieldValue>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut fields = Fields::new();
        for (k, v) in iter {
            fields.set(k, v);
        }
        fields
    }
}

// ----------------------------------------------------------------------------
// 3.4 Metric Kind
// ----------------------------------------------------------------------------

/// Value semantics declared by the producing input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    #[default]
    Untyped,
    Counter,
    Gauge,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Untyped => "untyped",
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
        }
    }
}

// ----------------------------------------------------------------------------
// 3.5 The Metric
// ----------------------------------------------------------------------------

/// One named, timestamped observation with tags and fields.
///
/// A tracked metric carries a reference into its [`DeliveryTracker`]; cloning
/// the metric adds a reference, and every copy has to be settled (acked,
/// rejected or simply dropped) before the delivery notification fires.
///
/// [`DeliveryTracker`]: crate::tracking::DeliveryTracker
#[derive(Debug, Clone)]
pub struct Metric {
    name: CompactString,
    tags: Tags,
    fields: Fields,
    timestamp: Timestamp,
    kind: MetricKind,
    tracking: Option<TrackingRef>,
}

impl Metric {
    /// Create a metric with no tags and no fields.
    pub fn new<N: Into<CompactString>>(name: N, timestamp: Timestamp) -> Self {
        Self {
            name: name.into(),
            tags: Tags::new(),
            fields: Fields::new(),
            timestamp,
            kind: MetricKind::Untyped,
            tracking: None,
        }
    }

    /// Create a metric from already assembled parts.
    pub fn from_parts<N: Into<CompactString>>(
        name: N,
        tags: Tags,
        fields: Fields,
        timestamp: Timestamp,
        kind: MetricKind,
    ) -> Self {
        Self {
            name: name.into(),
            tags,
            fields,
            timestamp,
            kind,
            tracking: None,
        }
    }

    /// Builder: add a tag
    pub fn with_tag<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<CompactString>,
        V: Into<CompactString>,
    {
        self.tags.set(key, value);
        self
    }

    /// Builder: add a field
    pub fn with_field<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<CompactString>,
        V: Into<FieldValue>,
    {
        self.fields.set(key, value);
        self
    }

    #[inline]
    pub fn with_kind(mut self, kind: MetricKind) -> Self {
        self.kind = kind;
        self
    }

    #[inline]
    pub fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Builder: rename, keeping everything else (tracking included).
    pub fn with_name<N: Into<CompactString>>(mut self, name: N) -> Self {
        self.name = name.into();
        self
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn tags(&self) -> &Tags {
        &self.tags
    }

    #[inline]
    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    #[inline]
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    #[inline]
    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    #[inline]
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key)
    }

    #[inline]
    pub fn field(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    pub(crate) fn tags_mut(&mut self) -> &mut Tags {
        &mut self.tags
    }

    pub(crate) fn fields_mut(&mut self) -> &mut Fields {
        &mut self.fields
    }

    pub fn tracking_id(&self) -> Option<TrackingId> {
        self.tracking.as_ref().map(|t| t.id())
    }

    pub(crate) fn attach_tracking(&mut self, tracking: TrackingRef) {
        self.tracking = Some(tracking);
    }

    /// Series identity: name plus tags, independent of tag order.
    pub fn series_id(&self) -> u64 {
        let mut hasher = Xxh3::new();
        hasher.update(self.name.as_bytes());
        for tag in self.tags.sorted() {
            hasher.update(b",");
            hasher.update(tag.key.as_bytes());
            hasher.update(b"=");
            hasher.update(tag.value.as_bytes());
        }
        hasher.digest()
    }

    /// A metric without fields carries no observation.
    pub fn is_valid(&self) -> bool {
        !self.name.is_empty() && !self.fields.is_empty()
    }

    /// Settle this copy as delivered.
    pub(crate) fn accept(mut self) {
        if let Some(t) = self.tracking.as_mut() {
            t.settle_as(Settlement::Accepted);
        }
    }

    /// Settle this copy as failed delivery.
    pub(crate) fn reject(mut self) {
        if let Some(t) = self.tracking.as_mut() {
            t.settle_as(Settlement::Rejected);
        }
    }
}

impl Display for Metric {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        for tag in self.tags.iter() {
            write!(f, ",{}", tag)?;
        }
        for (i, field) in self.fields.iter().enumerate() {
            let sep = if i == 0 { ' ' } else { ',' };
            write!(f, "{}{}={}", sep, field.key, field.value)?;
        }
        write!(f, " {}", self.timestamp.as_nanos())
    }
}

impl PartialEq for Metric {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.timestamp == other.timestamp
            && self.kind == other.kind
            && self.tags == other.tags
            && self.fields == other.fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_truncate() {
        let ts = Timestamp::from_nanos(1_234_567_891);
        assert_eq!(ts.truncate(Duration::from_secs(1)).as_nanos(), 1_000_000_000);
        assert_eq!(ts.truncate(Duration::from_millis(1)).as_nanos(), 1_234_000_000);
        assert_eq!(ts.truncate(Duration::ZERO), ts);
    }

    #[test]
    fn test_timestamp_display() {
        let ts = Timestamp::from_secs(1_289_430_000);
        assert_eq!(ts.to_string(), "2010-11-10T23:00:00.000000000Z");
    }

    #[test]
    fn test_tags_equality_ignores_order() {
        let a: Tags = [("host", "a"), ("dc", "x")].into_iter().collect();
        let b: Tags = [("dc", "x"), ("host", "a")].into_iter().collect();
        assert_eq!(a, b);

        let keys: Vec<&str> = a.iter().map(|t| t.key.as_str()).collect();
        assert_eq!(keys, vec!["host", "dc"]);
    }

    #[test]
    fn test_tags_set_overwrites_in_place() {
        let mut tags: Tags = [("host", "a"), ("dc", "x")].into_iter().collect();
        tags.set("host", "b");
        tags.set_if_absent("dc", "y");
        assert_eq!(tags.get("host"), Some("b"));
        assert_eq!(tags.get("dc"), Some("x"));
        assert_eq!(tags.iter().next().map(|t| t.key.as_str()), Some("host"));
        assert!(tags.remove_tag("dc").is_some());
        assert_eq!(tags.len(), 1);
    }

    #[test]
    fn test_metric_builder_and_display() {
        let m = Metric::new("cpu", Timestamp::from_nanos(42))
            .with_tag("host", "web-01")
            .with_field("usage", 12.5)
            .with_field("cores", 8u64)
            .with_kind(MetricKind::Gauge);

        assert_eq!(m.name(), "cpu");
        assert_eq!(m.tag("host"), Some("web-01"));
        assert_eq!(m.field("cores"), Some(&FieldValue::Uint(8)));
        assert_eq!(m.kind(), MetricKind::Gauge);
        assert_eq!(m.to_string(), "cpu,host=web-01 usage=12.5,cores=8u 42");
    }

    #[test]
    fn test_series_id_stable_across_tag_order() {
        let a = Metric::new("m", Timestamp::EPOCH)
            .with_tag("a", "1")
            .with_tag("b", "2");
        let b = Metric::new("m", Timestamp::from_nanos(5))
            .with_tag("b", "2")
            .with_tag("a", "1");
        let c = Metric::new("m", Timestamp::EPOCH).with_tag("a", "2");
        assert_eq!(a.series_id(), b.series_id());
        assert_ne!(a.series_id(), c.series_id());
    }

    #[test]
    fn test_metric_without_fields_is_invalid() {
        assert!(!Metric::new("empty", Timestamp::EPOCH).is_valid());
        assert!(Metric::new("m", Timestamp::EPOCH)
            .with_field("v", 1i64)
            .is_valid());
    }
}
