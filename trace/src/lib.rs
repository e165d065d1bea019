//! Distributed trace context propagation (spec.md §3 "Trace context", §6
//! "Trace propagation").
//!
//! A [`TraceContext`] is an immutable-except-for-additions value object
//! carried on every frame and woven through every hop of the pipeline.
//! [`TraceContextManager`] performs the sampling decision and the
//! W3C `traceparent`/`tracestate`/`baggage` header codec. [`TraceSpan`] is
//! the RAII guard a hop uses to time itself and record its outcome.

use std::collections::BTreeMap;
use std::time::Instant;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Baggage entries beyond this count are dropped on child-span derivation.
pub const MAX_BAGGAGE_ITEMS: usize = 32;
/// Total baggage size (key length + value length, bytes) beyond which
/// further entries are dropped on child-span derivation.
pub const MAX_BAGGAGE_SIZE: usize = 8192;

fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

fn random_trace_id() -> [u8; 16] {
    let mut buf = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

fn random_span_id() -> [u8; 8] {
    let mut buf = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

/// W3C-style distributed trace context. Immutable except for add-only
/// `attributes` and `baggage` on a still-live span; child derivation
/// produces a new span id while copying `trace_id`, `flags`, `trace_state`,
/// and a size-capped snapshot of `baggage`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TraceContext {
    pub trace_id: [u8; 16],
    pub span_id: [u8; 8],
    pub parent_span_id: Option<[u8; 8]>,
    /// `01` = sampled, `00` = not sampled, matching the W3C `trace-flags` byte.
    pub flags: u8,
    #[serde(default)]
    pub trace_state: BTreeMap<String, String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    #[serde(default)]
    pub baggage: BTreeMap<String, String>,
}

impl TraceContext {
    /// Creates a new root trace context.
    pub fn create(sampled: bool) -> Self {
        TraceContext {
            trace_id: random_trace_id(),
            span_id: random_span_id(),
            parent_span_id: None,
            flags: if sampled { 0x01 } else { 0x00 },
            trace_state: BTreeMap::new(),
            attributes: BTreeMap::new(),
            baggage: BTreeMap::new(),
        }
    }

    pub fn is_sampled(&self) -> bool {
        self.flags & 0x01 == 0x01
    }

    /// Derives a child span: same trace id, a fresh span id, this span's id
    /// as `parent_span_id`, `trace_state` copied verbatim, and a
    /// size-capped snapshot of `baggage`. Attributes are never inherited.
    pub fn create_child_span(&self) -> Self {
        let mut baggage = BTreeMap::new();
        let mut total_size = 0usize;
        for (k, v) in self.baggage.iter().take(MAX_BAGGAGE_ITEMS) {
            let item_size = k.len() + v.len();
            if total_size + item_size > MAX_BAGGAGE_SIZE {
                break;
            }
            baggage.insert(k.clone(), v.clone());
            total_size += item_size;
        }

        TraceContext {
            trace_id: self.trace_id,
            span_id: random_span_id(),
            parent_span_id: Some(self.span_id),
            flags: self.flags,
            trace_state: self.trace_state.clone(),
            attributes: BTreeMap::new(),
            baggage,
        }
    }

    pub fn add_attribute(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.attributes.insert(key.into(), value.into());
    }

    pub fn set_baggage(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.baggage.insert(key.into(), value.into());
    }

    pub fn get_baggage(&self, key: &str) -> Option<&str> {
        self.baggage.get(key).map(String::as_str)
    }

    /// `00-<trace_id hex32>-<span_id hex16>-<flags hex2>`.
    pub fn to_traceparent(&self) -> String {
        format!(
            "00-{}-{}-{:02x}",
            encode_hex(&self.trace_id),
            encode_hex(&self.span_id),
            self.flags
        )
    }

    pub fn from_traceparent(traceparent: &str) -> Result<Self, TraceParseError> {
        let parts: Vec<&str> = traceparent.split('-').collect();
        if parts.len() != 4 {
            return Err(TraceParseError::Malformed(traceparent.to_string()));
        }
        let [version, trace_id, span_id, flags] = [parts[0], parts[1], parts[2], parts[3]];
        if version != "00" {
            return Err(TraceParseError::UnsupportedVersion(version.to_string()));
        }
        let trace_id = decode_hex(trace_id)
            .filter(|b| b.len() == 16)
            .ok_or_else(|| TraceParseError::Malformed(traceparent.to_string()))?;
        let span_id = decode_hex(span_id)
            .filter(|b| b.len() == 8)
            .ok_or_else(|| TraceParseError::Malformed(traceparent.to_string()))?;
        let flags = u8::from_str_radix(flags, 16)
            .map_err(|_| TraceParseError::Malformed(traceparent.to_string()))?;

        Ok(TraceContext {
            trace_id: trace_id.try_into().expect("checked len == 16"),
            span_id: span_id.try_into().expect("checked len == 8"),
            parent_span_id: None,
            flags,
            trace_state: BTreeMap::new(),
            attributes: BTreeMap::new(),
            baggage: BTreeMap::new(),
        })
    }

    /// Serializes the full context as the `trace_context` JSON blob carried
    /// in stream messages (spec.md §6).
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("TraceContext always serializes")
    }

    pub fn from_json(s: &str) -> Result<Self, TraceParseError> {
        serde_json::from_str(s).map_err(|e| TraceParseError::Malformed(e.to_string()))
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum TraceParseError {
    #[error("malformed trace context: {0}")]
    Malformed(String),
    #[error("unsupported trace version: {0}")]
    UnsupportedVersion(String),
}

/// Performs the sampling decision on context creation and the header /
/// message codec around [`TraceContext`].
#[derive(Clone, Debug)]
pub struct TraceContextManager {
    sampling_rate: f64,
}

impl TraceContextManager {
    pub fn new(sampling_rate: f64) -> Self {
        TraceContextManager {
            sampling_rate: sampling_rate.clamp(0.0, 1.0),
        }
    }

    pub fn create_context(&self, force_sample: Option<bool>) -> TraceContext {
        let sampled = force_sample.unwrap_or_else(|| rand::random::<f64>() < self.sampling_rate);
        TraceContext::create(sampled)
    }

    /// Extracts a context from HTTP-style headers (`traceparent`,
    /// `tracestate`, `baggage`). Returns `None` if `traceparent` is absent
    /// or unparseable, matching the original's "extraction never raises".
    pub fn extract_from_headers(&self, headers: &BTreeMap<String, String>) -> Option<TraceContext> {
        let traceparent = headers.get("traceparent")?;
        let mut ctx = TraceContext::from_traceparent(traceparent).ok()?;

        if let Some(tracestate) = headers.get("tracestate") {
            for item in tracestate.split(',') {
                if let Some((k, v)) = item.split_once('=') {
                    ctx.trace_state.insert(k.trim().to_string(), v.trim().to_string());
                }
            }
        }

        if let Some(baggage) = headers.get("baggage") {
            for item in baggage.split(',') {
                if let Some((k, v)) = item.split_once('=') {
                    ctx.baggage.insert(k.trim().to_string(), v.trim().to_string());
                }
            }
        }

        Some(ctx)
    }

    pub fn inject_to_headers(&self, ctx: &TraceContext, headers: &mut BTreeMap<String, String>) {
        headers.insert("traceparent".to_string(), ctx.to_traceparent());

        if !ctx.trace_state.is_empty() {
            let encoded = ctx
                .trace_state
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(",");
            headers.insert("tracestate".to_string(), encoded);
        }

        if !ctx.baggage.is_empty() {
            let encoded = ctx
                .baggage
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(",");
            headers.insert("baggage".to_string(), encoded);
        }
    }

    /// Extracts a context from the `trace_context` field of a stream
    /// message (flat string map per spec.md §6). Returns `None` rather than
    /// erroring if the field is absent or not valid JSON.
    pub fn extract_from_message(&self, fields: &BTreeMap<String, String>) -> Option<TraceContext> {
        let raw = fields.get("trace_context")?;
        TraceContext::from_json(raw).ok()
    }

    pub fn inject_to_message(&self, ctx: &TraceContext, fields: &mut BTreeMap<String, String>) {
        fields.insert("trace_context".to_string(), ctx.to_json());
    }
}

impl Default for TraceContextManager {
    fn default() -> Self {
        TraceContextManager::new(1.0)
    }
}

/// RAII guard timing one hop of a frame's journey. Derives a child span
/// from `parent` on construction; on drop, records `duration_ms` and, if
/// [`TraceSpan::mark_failed`] was called, `error`/`error.type`/
/// `error.message` attributes, then logs the finished span at debug level.
///
/// Replaces the original's `async with` context manager: span bookkeeping
/// here has no suspension points, so a synchronous `Drop` guard is the
/// idiomatic rendering (see DESIGN NOTES in SPEC_FULL.md).
pub struct TraceSpan {
    name: &'static str,
    ctx: Option<TraceContext>,
    start: Instant,
    failure: Option<(String, String)>,
}

impl TraceSpan {
    pub fn start(name: &'static str, parent: &TraceContext) -> Self {
        let mut ctx = parent.create_child_span();
        ctx.add_attribute("span.name", name);
        TraceSpan {
            name,
            ctx: Some(ctx),
            start: Instant::now(),
            failure: None,
        }
    }

    pub fn context(&self) -> &TraceContext {
        self.ctx.as_ref().expect("context present until drop")
    }

    pub fn context_mut(&mut self) -> &mut TraceContext {
        self.ctx.as_mut().expect("context present until drop")
    }

    /// Marks the span as failed; `error.type`/`error.message` are recorded
    /// as attributes when the guard finalizes.
    pub fn mark_failed(&mut self, error_type: impl Into<String>, message: impl Into<String>) {
        self.failure = Some((error_type.into(), message.into()));
    }

    fn finalize(&mut self) -> TraceContext {
        let mut ctx = self.ctx.take().expect("finalize called once");
        let duration_ms = self.start.elapsed().as_millis() as i64;
        ctx.add_attribute("duration_ms", duration_ms);
        if let Some((error_type, message)) = self.failure.take() {
            ctx.add_attribute("error", true);
            ctx.add_attribute("error.type", error_type);
            ctx.add_attribute("error.message", message);
        }
        ctx
    }

    /// Finishes the span explicitly and returns the completed context,
    /// bypassing the log line [`Drop`] would otherwise emit.
    pub fn finish(mut self) -> TraceContext {
        let ctx = self.finalize();
        std::mem::forget(self);
        ctx
    }
}

impl Drop for TraceSpan {
    fn drop(&mut self) {
        if self.ctx.is_none() {
            return;
        }
        let ctx = self.finalize();
        if self.failure.is_some() || ctx.attributes.contains_key("error") {
            frame_logger::warn!("span '{}' finished with an error ({}ms)", self.name, ctx.attributes.get("duration_ms").cloned().unwrap_or_default());
        } else {
            frame_logger::debug!("span '{}' finished ({}ms)", self.name, ctx.attributes.get("duration_ms").cloned().unwrap_or_default());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traceparent_round_trips() {
        let ctx = TraceContext::create(true);
        let header = ctx.to_traceparent();
        let parsed = TraceContext::from_traceparent(&header).unwrap();
        assert_eq!(parsed.trace_id, ctx.trace_id);
        assert_eq!(parsed.span_id, ctx.span_id);
        assert_eq!(parsed.flags, ctx.flags);
    }

    #[test]
    fn from_traceparent_rejects_wrong_part_count() {
        assert!(TraceContext::from_traceparent("00-abc-def").is_err());
    }

    #[test]
    fn from_traceparent_rejects_unsupported_version() {
        let ctx = TraceContext::create(true);
        let bad = ctx.to_traceparent().replacen("00-", "01-", 1);
        assert!(matches!(
            TraceContext::from_traceparent(&bad),
            Err(TraceParseError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn child_span_shares_trace_id_and_points_at_parent() {
        let root = TraceContext::create(true);
        let child = root.create_child_span();
        assert_eq!(child.trace_id, root.trace_id);
        assert_eq!(child.parent_span_id, Some(root.span_id));
        assert_ne!(child.span_id, root.span_id);
    }

    #[test]
    fn child_span_caps_baggage_by_item_count() {
        let mut root = TraceContext::create(true);
        for i in 0..40 {
            root.set_baggage(format!("k{i}"), "v");
        }
        let child = root.create_child_span();
        assert!(child.baggage.len() <= MAX_BAGGAGE_ITEMS);
    }

    #[test]
    fn child_span_caps_baggage_by_total_size() {
        let mut root = TraceContext::create(true);
        let big_value = "x".repeat(1000);
        for i in 0..20 {
            root.set_baggage(format!("k{i}"), big_value.clone());
        }
        let child = root.create_child_span();
        let total: usize = child.baggage.iter().map(|(k, v)| k.len() + v.len()).sum();
        assert!(total <= MAX_BAGGAGE_SIZE);
    }

    #[test]
    fn manager_sampling_rate_zero_never_samples() {
        let mgr = TraceContextManager::new(0.0);
        for _ in 0..20 {
            assert!(!mgr.create_context(None).is_sampled());
        }
    }

    #[test]
    fn manager_force_sample_overrides_rate() {
        let mgr = TraceContextManager::new(0.0);
        assert!(mgr.create_context(Some(true)).is_sampled());
    }

    #[test]
    fn header_round_trip_via_manager() {
        let mgr = TraceContextManager::default();
        let mut ctx = TraceContext::create(true);
        ctx.set_baggage("user_id", "42");
        ctx.trace_state.insert("vendor".to_string(), "value".to_string());

        let mut headers = BTreeMap::new();
        mgr.inject_to_headers(&ctx, &mut headers);
        let extracted = mgr.extract_from_headers(&headers).unwrap();

        assert_eq!(extracted.trace_id, ctx.trace_id);
        assert_eq!(extracted.get_baggage("user_id"), Some("42"));
        assert_eq!(extracted.trace_state.get("vendor"), Some(&"value".to_string()));
    }

    #[test]
    fn message_round_trip_via_manager() {
        let mgr = TraceContextManager::default();
        let ctx = TraceContext::create(true);

        let mut fields = BTreeMap::new();
        mgr.inject_to_message(&ctx, &mut fields);
        let extracted = mgr.extract_from_message(&fields).unwrap();
        assert_eq!(extracted.trace_id, ctx.trace_id);
        assert_eq!(extracted.span_id, ctx.span_id);
    }

    #[test]
    fn extract_from_message_returns_none_for_garbage() {
        let mgr = TraceContextManager::default();
        let mut fields = BTreeMap::new();
        fields.insert("trace_context".to_string(), "not json".to_string());
        assert!(mgr.extract_from_message(&fields).is_none());
    }

    #[test]
    fn span_records_duration_and_error_attributes() {
        let root = TraceContext::create(true);
        let mut span = TraceSpan::start("dispatch", &root);
        span.mark_failed("CircuitOpen", "processor p1 unavailable");
        let finished = span.finish();
        assert_eq!(finished.attributes.get("error"), Some(&Value::Bool(true)));
        assert_eq!(
            finished.attributes.get("error.type"),
            Some(&Value::String("CircuitOpen".to_string()))
        );
        assert!(finished.attributes.contains_key("duration_ms"));
    }
}
