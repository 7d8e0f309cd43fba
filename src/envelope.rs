//! Job envelope wire schema.
//!
//! Every message on the queue carries one [`JobEnvelope`]: identity, tenancy,
//! idempotency key, and an open payload map. The envelope layer validates
//! shape only; payload contents are opaque here and are interpreted by the
//! handler registered for the job type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// Upper bound on the caller-supplied idempotency key.
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 512;
/// Upper bound on the entity id.
pub const MAX_ENTITY_ID_LEN: usize = 256;
/// Upper bound on the attempt counter.
pub const MAX_ATTEMPT: u32 = 100;

/// Validation failure for a [`JobEnvelope`].
///
/// These are poison-message errors: the worker dead-letters the message
/// immediately and never retries it.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// A required string field was empty after trimming.
    #[error("envelope field `{0}` must not be empty")]
    Empty(&'static str),

    /// A string field exceeded its maximum length.
    #[error("envelope field `{field}` exceeds {max} characters")]
    TooLong {
        /// Offending field name.
        field: &'static str,
        /// Maximum permitted length.
        max: usize,
    },

    /// The attempt counter fell outside `1..=100`.
    #[error("attempt {0} outside the 1..=100 range")]
    AttemptOutOfRange(u32),

    /// The JSON did not match the envelope schema (including unknown
    /// top-level fields, which are rejected).
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Validated job message.
///
/// Unknown top-level fields are rejected at deserialization time. Construct
/// with [`JobEnvelope::new`] and pass through [`JobEnvelope::validate`]
/// before handing to the store; [`JobEnvelope::parse`] does both for JSON
/// read back off the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobEnvelope {
    /// Unique id of this job instance.
    #[serde(default = "Uuid::new_v4")]
    pub job_id: Uuid,
    /// Correlation id propagated across systems.
    #[serde(default = "Uuid::new_v4")]
    pub trace_id: Uuid,
    /// Tenant the job belongs to.
    pub org_id: Uuid,
    /// Caller-supplied exactly-once key, unique per job type.
    pub idempotency_key: String,
    /// Kind of entity the job operates on, stored lower-cased.
    pub entity_type: String,
    /// Identifier of the entity within the tenant.
    pub entity_id: String,
    /// 1-based try number, incremented by the store on retry.
    #[serde(default = "default_attempt")]
    pub attempt: u32,
    /// Producer-side creation time.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// Open payload map, interpreted per job type by the handler.
    #[serde(default)]
    pub payload: Map<String, Value>,
}

fn default_attempt() -> u32 {
    1
}

impl JobEnvelope {
    /// Build an envelope with fresh ids and an empty payload.
    pub fn new(
        org_id: Uuid,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            trace_id: Uuid::new_v4(),
            org_id,
            idempotency_key: idempotency_key.into(),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            attempt: 1,
            created_at: Utc::now(),
            payload: Map::new(),
        }
    }

    /// Attach a payload map.
    #[must_use]
    pub fn with_payload(mut self, payload: Map<String, Value>) -> Self {
        self.payload = payload;
        self
    }

    /// Normalize and bounds-check the envelope.
    ///
    /// Trims the idempotency key and entity fields, lower-cases the entity
    /// type, and enforces the length and attempt ranges.
    pub fn validate(mut self) -> Result<Self, EnvelopeError> {
        self.idempotency_key = self.idempotency_key.trim().to_owned();
        if self.idempotency_key.is_empty() {
            return Err(EnvelopeError::Empty("idempotency_key"));
        }
        if self.idempotency_key.chars().count() > MAX_IDEMPOTENCY_KEY_LEN {
            return Err(EnvelopeError::TooLong {
                field: "idempotency_key",
                max: MAX_IDEMPOTENCY_KEY_LEN,
            });
        }

        self.entity_type = self.entity_type.trim().to_lowercase();
        if self.entity_type.is_empty() {
            return Err(EnvelopeError::Empty("entity_type"));
        }

        self.entity_id = self.entity_id.trim().to_owned();
        if self.entity_id.is_empty() {
            return Err(EnvelopeError::Empty("entity_id"));
        }
        if self.entity_id.chars().count() > MAX_ENTITY_ID_LEN {
            return Err(EnvelopeError::TooLong {
                field: "entity_id",
                max: MAX_ENTITY_ID_LEN,
            });
        }

        if !(1..=MAX_ATTEMPT).contains(&self.attempt) {
            return Err(EnvelopeError::AttemptOutOfRange(self.attempt));
        }

        Ok(self)
    }

    /// Deserialize and validate an envelope read back from the store.
    pub fn parse(value: Value) -> Result<Self, EnvelopeError> {
        let envelope: Self = serde_json::from_value(value)?;
        envelope.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::{assert_err, assert_matches, assert_ok};
    use serde_json::json;

    fn org() -> Uuid {
        Uuid::parse_str("71f4dca9-2c10-4b66-a812-e5c2b0ddad89").unwrap()
    }

    #[test]
    fn defaults_are_filled_in() {
        let envelope = JobEnvelope::parse(json!({
            "org_id": org(),
            "idempotency_key": "plaintiff:123:intake",
            "entity_type": "plaintiff",
            "entity_id": "123",
        }))
        .unwrap();

        assert_eq!(envelope.attempt, 1);
        assert!(!envelope.job_id.is_nil());
        assert!(!envelope.trace_id.is_nil());
        assert!(envelope.payload.is_empty());
    }

    #[test]
    fn unknown_top_level_fields_are_rejected() {
        let result = JobEnvelope::parse(json!({
            "org_id": org(),
            "idempotency_key": "k",
            "entity_type": "plaintiff",
            "entity_id": "123",
            "surprise": true,
        }));
        assert_matches!(result, Err(EnvelopeError::Malformed(_)));
    }

    #[test]
    fn key_is_trimmed_and_entity_type_lowercased() {
        let envelope = JobEnvelope::new(org(), "  Plaintiff ", " 123 ", "  key-1  ")
            .validate()
            .unwrap();
        assert_eq!(envelope.idempotency_key, "key-1");
        assert_eq!(envelope.entity_type, "plaintiff");
        assert_eq!(envelope.entity_id, "123");
    }

    #[test]
    fn empty_key_is_rejected() {
        let result = JobEnvelope::new(org(), "plaintiff", "123", "   ").validate();
        assert_matches!(result, Err(EnvelopeError::Empty("idempotency_key")));
    }

    #[test]
    fn oversized_fields_are_rejected() {
        let result = JobEnvelope::new(org(), "plaintiff", "123", "k".repeat(513)).validate();
        assert_matches!(
            result,
            Err(EnvelopeError::TooLong { field: "idempotency_key", .. })
        );

        let result = JobEnvelope::new(org(), "plaintiff", "e".repeat(257), "key").validate();
        assert_matches!(result, Err(EnvelopeError::TooLong { field: "entity_id", .. }));
    }

    #[test]
    fn attempt_bounds_are_enforced() {
        let mut envelope = JobEnvelope::new(org(), "plaintiff", "123", "key");
        envelope.attempt = 0;
        assert_matches!(
            envelope.clone().validate(),
            Err(EnvelopeError::AttemptOutOfRange(0))
        );

        envelope.attempt = 101;
        assert_err!(envelope.clone().validate());

        envelope.attempt = 100;
        assert_ok!(envelope.validate());
    }

    #[test]
    fn payload_is_carried_opaquely() {
        let mut payload = Map::new();
        payload.insert("amount_cents".into(), json!(125_000));
        let envelope = JobEnvelope::new(org(), "invoice", "inv-9", "invoice:9")
            .with_payload(payload)
            .validate()
            .unwrap();
        assert_eq!(envelope.payload["amount_cents"], json!(125_000));
    }
}
