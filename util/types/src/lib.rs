//! Wire and data-model types shared across the frame orchestrator core
//! (spec.md §3 "Data model").
//!
//! [`FrameEvent`] and [`ProcessorDescriptor`] are validated once, at the
//! boundary, via [`FrameEvent::validate`] / [`ProcessorDescriptor::validate`];
//! every other component trusts a value of these types to already satisfy
//! the invariants in spec.md §3. The flat string-map wire encoding
//! (`to_fields`/`from_fields`) is the format both the Stream Consumer and
//! the Work Queue Manager read and write, resolving Open Question #2 in
//! spec.md §9 in favor of the queue-manager's `enqueued_at`-bearing shape.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use frame_error::ValidationError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// System-wide default used when a processor descriptor doesn't set
/// `metadata.queue_maxlen` (spec.md §4.3).
pub const DEFAULT_QUEUE_MAXLEN: u64 = 10_000;

/// An immutable record describing one captured frame. Never mutated after
/// creation; its lifetime ends at processor ack.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FrameEvent {
    pub frame_id: String,
    pub camera_id: String,
    pub timestamp: DateTime<Utc>,
    pub size_bytes: u64,
    pub width: u32,
    pub height: u32,
    pub format: String,
    /// Must contain `detection_type`; may contain `priority` and
    /// `queue_maxlen`.
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    /// Raw JSON-serialized trace context, as carried on the wire. Parsed
    /// lazily by whichever component needs the structured value, via
    /// `frame-trace`.
    pub trace_context: String,
    /// Present once a frame has been redelivered at least once; counts
    /// attempts so the router can dead-letter after the configured cap.
    #[serde(default)]
    pub retry_count: u32,
}

impl FrameEvent {
    /// Validates the invariants of spec.md §3: non-empty id, positive
    /// dimensions, required `detection_type` metadata.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.frame_id.trim().is_empty() {
            return Err(ValidationError::MissingField("frame_id"));
        }
        if self.camera_id.trim().is_empty() {
            return Err(ValidationError::MissingField("camera_id"));
        }
        if self.width == 0 || self.height == 0 {
            return Err(ValidationError::NegativeDimensions {
                width: self.width as i64,
                height: self.height as i64,
            });
        }
        if self.detection_type().is_none() {
            return Err(ValidationError::MissingDetectionType);
        }
        Ok(())
    }

    pub fn detection_type(&self) -> Option<&str> {
        self.metadata.get("detection_type").and_then(Value::as_str)
    }

    /// Priority in `[0, 10]`; the inclusive range is authoritative per
    /// spec.md §9. Absent or out-of-range values default to `0`.
    pub fn priority(&self) -> u8 {
        self.metadata
            .get("priority")
            .and_then(Value::as_u64)
            .map(|p| p.min(10) as u8)
            .unwrap_or(0)
    }

    pub fn queue_maxlen(&self) -> Option<u64> {
        self.metadata.get("queue_maxlen").and_then(Value::as_u64)
    }

    /// Projects the event to the flat string-map wire format consumed by
    /// both the input stream and per-processor queues (spec.md §6):
    /// nested values are JSON-encoded, `null` becomes `""`.
    pub fn to_fields(&self) -> BTreeMap<String, String> {
        let mut fields = BTreeMap::new();
        fields.insert("frame_id".to_string(), self.frame_id.clone());
        fields.insert("camera_id".to_string(), self.camera_id.clone());
        fields.insert("timestamp".to_string(), self.timestamp.to_rfc3339());
        fields.insert("size_bytes".to_string(), self.size_bytes.to_string());
        fields.insert("width".to_string(), self.width.to_string());
        fields.insert("height".to_string(), self.height.to_string());
        fields.insert("format".to_string(), self.format.clone());
        fields.insert(
            "metadata".to_string(),
            serde_json::to_string(&self.metadata).unwrap_or_default(),
        );
        fields.insert("trace_context".to_string(), self.trace_context.clone());
        fields.insert("retry_count".to_string(), self.retry_count.to_string());
        fields
    }

    /// Inverse of [`FrameEvent::to_fields`]. Tolerates a missing
    /// `retry_count` (not present on frames produced upstream of the core).
    pub fn from_fields(fields: &BTreeMap<String, String>) -> Result<Self, ValidationError> {
        let get = |k: &'static str| {
            fields
                .get(k)
                .filter(|v| !v.is_empty())
                .ok_or(ValidationError::MissingField(k))
        };

        let frame_id = get("frame_id")?.clone();
        let camera_id = get("camera_id")?.clone();
        let timestamp = DateTime::parse_from_rfc3339(get("timestamp")?)
            .map_err(|e| ValidationError::InvalidField {
                field: "timestamp",
                reason: e.to_string(),
            })?
            .with_timezone(&Utc);
        let size_bytes: u64 = get("size_bytes")?
            .parse()
            .map_err(|_| ValidationError::InvalidField {
                field: "size_bytes",
                reason: "not a non-negative integer".to_string(),
            })?;
        let width: u32 = get("width")?
            .parse()
            .map_err(|_| ValidationError::InvalidField {
                field: "width",
                reason: "not a non-negative integer".to_string(),
            })?;
        let height: u32 = get("height")?
            .parse()
            .map_err(|_| ValidationError::InvalidField {
                field: "height",
                reason: "not a non-negative integer".to_string(),
            })?;
        let format = get("format")?.clone();
        let metadata: BTreeMap<String, Value> = fields
            .get("metadata")
            .filter(|v| !v.is_empty())
            .map(|v| serde_json::from_str(v))
            .transpose()
            .map_err(|e: serde_json::Error| ValidationError::InvalidField {
                field: "metadata",
                reason: e.to_string(),
            })?
            .unwrap_or_default();
        let trace_context = fields.get("trace_context").cloned().unwrap_or_default();
        let retry_count = fields
            .get("retry_count")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let event = FrameEvent {
            frame_id,
            camera_id,
            timestamp,
            size_bytes,
            width,
            height,
            format,
            metadata,
            trace_context,
            retry_count,
        };
        event.validate()?;
        Ok(event)
    }
}

/// Declares a processor's id, capabilities, and capacity. Created on
/// register, mutated only by update, destroyed on unregister.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessorDescriptor {
    pub id: String,
    pub capabilities: Vec<String>,
    pub capacity: u32,
    /// Defaults to `frames:ready:<id>` when empty.
    #[serde(default)]
    pub queue: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub health_endpoint: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl ProcessorDescriptor {
    pub fn new(id: impl Into<String>, capabilities: Vec<String>, capacity: u32) -> Self {
        let id = id.into();
        let queue = default_queue_name(&id);
        ProcessorDescriptor {
            id,
            capabilities,
            capacity,
            queue,
            endpoint: None,
            health_endpoint: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Fills in the derived queue name if absent, then validates.
    pub fn normalize(mut self) -> Result<Self, ValidationError> {
        if self.queue.trim().is_empty() {
            self.queue = default_queue_name(&self.id);
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.trim().is_empty() {
            return Err(ValidationError::EmptyProcessorId);
        }
        if self.capabilities.is_empty() {
            return Err(ValidationError::EmptyCapabilities);
        }
        if self.capacity == 0 {
            return Err(ValidationError::NonPositiveCapacity(0));
        }
        Ok(())
    }

    pub fn queue_maxlen(&self) -> Option<u64> {
        self.metadata.get("queue_maxlen").and_then(Value::as_u64)
    }
}

pub fn default_queue_name(processor_id: &str) -> String {
    format!("frames:ready:{processor_id}")
}

/// Discretized summary of aggregate queue utilization (spec.md §4.8).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PressureLevel {
    Normal,
    Moderate,
    High,
    Critical,
}

impl PressureLevel {
    /// The intake multiplier spec.md §4.8 associates with this level.
    pub fn multiplier(self) -> f64 {
        match self {
            PressureLevel::Normal => 1.0,
            PressureLevel::Moderate => 0.75,
            PressureLevel::High => 0.5,
            PressureLevel::Critical => 0.0,
        }
    }

    pub fn as_metric_value(self) -> i64 {
        match self {
            PressureLevel::Normal => 0,
            PressureLevel::Moderate => 1,
            PressureLevel::High => 2,
            PressureLevel::Critical => 3,
        }
    }
}

/// Statistics reported by the Work Queue Manager for one processor queue
/// (spec.md §4.3 `stats`).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queue_name: String,
    pub processor_id: String,
    pub length: u64,
    pub pending: u64,
    pub exists: bool,
    pub consumers: u64,
    pub first_id: Option<String>,
    pub last_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frame() -> FrameEvent {
        let mut metadata = BTreeMap::new();
        metadata.insert("detection_type".to_string(), Value::String("face".to_string()));
        FrameEvent {
            frame_id: "f1".to_string(),
            camera_id: "cam1".to_string(),
            timestamp: Utc::now(),
            size_bytes: 1024,
            width: 1920,
            height: 1080,
            format: "jpeg".to_string(),
            metadata,
            trace_context: "{}".to_string(),
            retry_count: 0,
        }
    }

    #[test]
    fn validate_accepts_a_well_formed_frame() {
        assert!(sample_frame().validate().is_ok());
    }

    #[test]
    fn validate_rejects_missing_detection_type() {
        let mut frame = sample_frame();
        frame.metadata.clear();
        assert_eq!(frame.validate(), Err(ValidationError::MissingDetectionType));
    }

    #[test]
    fn validate_rejects_zero_dimensions() {
        let mut frame = sample_frame();
        frame.width = 0;
        assert!(matches!(
            frame.validate(),
            Err(ValidationError::NegativeDimensions { .. })
        ));
    }

    #[test]
    fn fields_round_trip() {
        let frame = sample_frame();
        let fields = frame.to_fields();
        let parsed = FrameEvent::from_fields(&fields).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn from_fields_rejects_missing_required_field() {
        let frame = sample_frame();
        let mut fields = frame.to_fields();
        fields.remove("camera_id");
        assert_eq!(
            FrameEvent::from_fields(&fields),
            Err(ValidationError::MissingField("camera_id"))
        );
    }

    #[test]
    fn priority_defaults_to_zero_and_clamps_to_ten() {
        let mut frame = sample_frame();
        assert_eq!(frame.priority(), 0);
        frame.metadata.insert("priority".to_string(), Value::from(99u64));
        assert_eq!(frame.priority(), 10);
    }

    #[test]
    fn processor_descriptor_defaults_queue_name() {
        let descriptor = ProcessorDescriptor::new("p1", vec!["face".to_string()], 10);
        assert_eq!(descriptor.queue, "frames:ready:p1");
    }

    #[test]
    fn processor_descriptor_rejects_empty_capabilities() {
        let descriptor = ProcessorDescriptor::new("p1", vec![], 10);
        assert_eq!(descriptor.validate(), Err(ValidationError::EmptyCapabilities));
    }

    #[test]
    fn processor_descriptor_rejects_zero_capacity() {
        let descriptor = ProcessorDescriptor::new("p1", vec!["face".to_string()], 0);
        assert_eq!(descriptor.validate(), Err(ValidationError::NonPositiveCapacity(0)));
    }

    #[test]
    fn pressure_level_multipliers_match_spec_table() {
        assert_eq!(PressureLevel::Normal.multiplier(), 1.0);
        assert_eq!(PressureLevel::Moderate.multiplier(), 0.75);
        assert_eq!(PressureLevel::High.multiplier(), 0.5);
        assert_eq!(PressureLevel::Critical.multiplier(), 0.0);
    }
}
