//! Request classification.
//!
//! Turns an authenticated [`RawRequest`] into a [`Request`] with a fixed
//! [`RequestClass`]. Pure: no I/O, no locks, no blocking.

use crate::request::{RawRequest, Request, RequestClass};
use crate::SchedulerError;

impl RequestClass {
    /// Parse a class from a `request_type` string (`"realtime"`, `"task"`).
    ///
    /// Case-insensitive; surrounding whitespace is ignored. Returns `None`
    /// for unrecognised strings.
    pub fn from_name(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "realtime" => Some(Self::Realtime),
            "task" => Some(Self::Task),
            _ => None,
        }
    }
}

/// Classify a raw request.
///
/// # Errors
///
/// Returns [`SchedulerError::InvalidRequest`] if `request_type` is missing or
/// not one of the recognised class names.
///
/// # Example
///
/// ```rust
/// use hybrid_scheduler::classifier::classify;
/// use hybrid_scheduler::request::{InvocationPayload, RawRequest, RequestClass, TenantId};
///
/// let raw = RawRequest {
///     tenant_id: TenantId::new("acme"),
///     request_type: Some("task".into()),
///     payload: InvocationPayload::new("gpt-4o", "summarise this"),
/// };
/// let request = classify(raw).unwrap();
/// assert_eq!(request.class(), RequestClass::Task);
/// ```
pub fn classify(raw: RawRequest) -> Result<Request, SchedulerError> {
    let name = raw
        .request_type
        .as_deref()
        .ok_or_else(|| SchedulerError::InvalidRequest("request_type is missing".into()))?;

    let class = RequestClass::from_name(name).ok_or_else(|| {
        SchedulerError::InvalidRequest(format!("unrecognised request_type '{name}'"))
    })?;

    Ok(Request::new(raw.tenant_id, class, raw.payload))
}
