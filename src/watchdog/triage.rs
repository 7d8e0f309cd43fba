//! Dead-letter triage: stateless, deterministic classification of DLQ
//! messages plus the best-effort alert sink the watchdog publishes through.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use tracing::{error, warn};

static SECURITY_PATTERNS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        "(?i)unauthori[sz]ed|forbidden|access denied|permission denied\
         |signature (?:mismatch|invalid|verification failed)\
         |auth(?:entication|orization)? fail|invalid (?:token|credentials?)",
    )
    .expect("security triage regex must compile")
});

static COMPLIANCE_PATTERNS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        "(?i)consent|legal[ _-]?hold|do[ _-]?not[ _-]?contact\
         |cease[ _-]?and[ _-]?desist|right to (?:be forgotten|erasure)|retention polic",
    )
    .expect("compliance triage regex must compile")
});

/// Triage bucket for a dead-lettered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TriageCategory {
    /// Auth/signature/authorization failure patterns. Outranks everything.
    Security,
    /// Consent/legal-hold patterns.
    Compliance,
    /// Nothing recognizable.
    Unclassified,
}

/// Classify combined payload and error text.
///
/// Security patterns win over compliance when both match.
pub fn classify(text: &str) -> TriageCategory {
    if SECURITY_PATTERNS.is_match(text) {
        TriageCategory::Security
    } else if COMPLIANCE_PATTERNS.is_match(text) {
        TriageCategory::Compliance
    } else {
        TriageCategory::Unclassified
    }
}

/// One classified DLQ message, handed to the alert sink.
#[derive(Debug, Clone, Serialize)]
pub struct DlqAlert {
    /// Queue message id, used by sinks for idempotent de-duplication.
    pub message_id: i64,
    /// Job type of the dead-lettered message.
    pub job_type: String,
    /// Triage bucket.
    pub category: TriageCategory,
    /// The error text that was classified.
    pub error: String,
}

/// Destination for triage side effects.
///
/// Implementations are expected to be best-effort idempotent (keyed on the
/// message id); the watchdog logs sink errors and carries on, so a broken
/// sink never affects the check pass itself.
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// A security-pattern DLQ message: raise a critical incident.
    async fn security_incident(&self, alert: &DlqAlert) -> anyhow::Result<()>;

    /// A compliance-pattern DLQ message: raise a high-priority remediation
    /// task.
    async fn remediation_task(&self, alert: &DlqAlert) -> anyhow::Result<()>;
}

/// Default sink: structured log lines only.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn security_incident(&self, alert: &DlqAlert) -> anyhow::Result<()> {
        error!(
            message_id = alert.message_id,
            job_type = %alert.job_type,
            error = %alert.error,
            "SECURITY incident: dead-lettered message matches security patterns"
        );
        Ok(())
    }

    async fn remediation_task(&self, alert: &DlqAlert) -> anyhow::Result<()> {
        warn!(
            message_id = alert.message_id,
            job_type = %alert.job_type,
            error = %alert.error,
            "Compliance remediation needed for dead-lettered message"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn security_patterns_are_recognized() {
        assert_eq!(classify("unauthorized access attempt"), TriageCategory::Security);
        assert_eq!(classify("401 Unauthorised"), TriageCategory::Security);
        assert_eq!(classify("webhook signature invalid"), TriageCategory::Security);
        assert_eq!(classify("authentication failed for org"), TriageCategory::Security);
        assert_eq!(classify("invalid token supplied"), TriageCategory::Security);
    }

    #[test]
    fn compliance_patterns_are_recognized() {
        assert_eq!(classify("consent required"), TriageCategory::Compliance);
        assert_eq!(classify("account under LEGAL HOLD"), TriageCategory::Compliance);
        assert_eq!(classify("debtor on do-not-contact list"), TriageCategory::Compliance);
    }

    #[test]
    fn unmatched_text_is_unclassified() {
        assert_eq!(classify("connection reset by peer"), TriageCategory::Unclassified);
        assert_eq!(classify(""), TriageCategory::Unclassified);
    }

    #[test]
    fn security_outranks_compliance() {
        assert_eq!(
            classify("unauthorized access while checking consent required flag"),
            TriageCategory::Security
        );
    }
}
