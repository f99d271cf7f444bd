//! Shared types for the bounce pipeline and its persisted state document.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Bounce classification ───────────────────────────────────────────

/// Category assigned to a delivery-failure notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BounceType {
    /// Permanent failure. Never retried.
    Hard,
    /// Transient failure. Eligible for retry.
    Soft,
    /// Neither keyword set matched. Handled like `Soft`.
    Unknown,
}

impl BounceType {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Hard => "hard",
            Self::Soft => "soft",
            Self::Unknown => "unknown",
        }
    }

    /// Whether this bounce goes down the retry path.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Hard)
    }
}

// ── Inbound message ─────────────────────────────────────────────────

/// One message fetched from the mailbox, reduced to the parts the
/// pipeline looks at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawMessage {
    /// Mailbox-native identifier (IMAP UID).
    pub uid: String,
    /// Sender address, if the message had one.
    pub from: Option<String>,
    pub subject: Option<String>,
    /// Plain-text body.
    pub text: Option<String>,
    /// HTML body, unmodified.
    pub html: Option<String>,
}

impl RawMessage {
    /// Plain-text and HTML bodies joined, used for address extraction.
    pub fn extraction_text(&self) -> String {
        format!(
            "{} {}",
            self.text.as_deref().unwrap_or_default(),
            self.html.as_deref().unwrap_or_default()
        )
    }

    /// Lowercased body + subject, used for classification.
    pub fn classification_text(&self) -> String {
        format!(
            "{} {}",
            self.text.as_deref().unwrap_or_default(),
            self.subject.as_deref().unwrap_or_default()
        )
        .to_lowercase()
    }
}

// ── Sender identities ───────────────────────────────────────────────

/// An alternate "From" identity used when resending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderIdentity {
    pub address: String,
    pub display_name: String,
}

impl SenderIdentity {
    pub fn new(address: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            display_name: display_name.into(),
        }
    }
}

// ── Persisted records ───────────────────────────────────────────────

/// One per distinct bounced address seen in a run, after dedup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BounceRecord {
    pub email: String,
    #[serde(rename = "type")]
    pub bounce_type: BounceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub processed_at: DateTime<Utc>,
    #[serde(default)]
    pub retried: bool,
}

/// One per successful resend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryAttempt {
    pub original_email: String,
    pub sender_used: String,
    #[serde(alias = "transportMessageId")]
    pub message_id: String,
    pub retried_at: DateTime<Utc>,
}

/// One per resend that could not be completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedRetry {
    pub email: String,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

/// Reason recorded when no transaction context exists for an address.
pub const REASON_NO_MATCHING_DEAL: &str = "no_matching_deal";
/// Reason recorded when every sender identity has been tried.
pub const REASON_SENDERS_EXHAUSTED: &str = "all_senders_exhausted";

/// Lifetime counters. Only ever incremented.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateStats {
    pub total: u64,
    pub retried: u64,
    pub failed: u64,
    pub permanent: u64,
}

impl AggregateStats {
    /// Fold one run's tallies into the lifetime counters.
    pub fn absorb(&mut self, run: &RunResults) {
        self.total += run.processed;
        self.retried += run.retried;
        self.failed += run.failed;
        self.permanent += run.permanent;
    }
}

/// The whole durable state: every bounce, retry and failure ever recorded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StateDocument {
    pub processed_bounces: Vec<BounceRecord>,
    pub retried_emails: Vec<RetryAttempt>,
    pub failed_retries: Vec<FailedRetry>,
    pub stats: AggregateStats,
    pub last_run: Option<DateTime<Utc>>,
}

impl StateDocument {
    /// Whether `email` already has a bounce record newer than `since`.
    ///
    /// Bounce type is not considered: any recent record suppresses the
    /// address, whether it was hard, soft or unknown.
    pub fn processed_since(&self, email: &str, since: DateTime<Utc>) -> bool {
        self.processed_bounces
            .iter()
            .any(|b| b.email == email && b.processed_at > since)
    }

    /// Sender addresses already used to resend to `email`, oldest first.
    pub fn senders_used_for(&self, email: &str) -> Vec<&str> {
        self.retried_emails
            .iter()
            .filter(|r| r.original_email == email)
            .map(|r| r.sender_used.as_str())
            .collect()
    }
}

// ── Run results ─────────────────────────────────────────────────────

/// Per-run tallies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResults {
    pub processed: u64,
    pub retried: u64,
    pub failed: u64,
    pub permanent: u64,
}

impl RunResults {
    pub fn summary(&self) -> String {
        format!(
            "Processed: {}, Retried: {}, Failed: {}, Permanent: {}",
            self.processed, self.retried, self.failed, self.permanent
        )
    }
}

/// Outcome of `BounceProcessor::run`, serialized as
/// `{success:true, results, summary}` or `{success:false, error}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RunReport {
    Completed {
        success: bool,
        results: RunResults,
        summary: String,
    },
    Aborted {
        success: bool,
        error: String,
    },
}

impl RunReport {
    pub fn completed(results: RunResults) -> Self {
        Self::Completed {
            success: true,
            summary: results.summary(),
            results,
        }
    }

    pub fn aborted(error: impl Into<String>) -> Self {
        Self::Aborted {
            success: false,
            error: error.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}
