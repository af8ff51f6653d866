//! Failure taxonomy, recovery policies and message classification.
//!
//! The recovery engine in the pipeline crate owns the schedule; this module
//! only answers "what kind of failure is this" and "what should happen to it
//! and when".

use std::fmt;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::item::ItemStage;
use crate::types::{DbId, Timestamp};

/// Upper bound on any computed retry delay.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(24 * 3600);

// ---------------------------------------------------------------------------
// ErrorType
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorType {
    CompressionFailed,
    VerificationFailed,
    UploadFailed,
    SpaceInsufficient,
    StoreError,
    FileNotFound,
    PermissionDenied,
    NetworkError,
    Unknown,
}

impl ErrorType {
    pub const ALL: [ErrorType; 9] = [
        ErrorType::CompressionFailed,
        ErrorType::VerificationFailed,
        ErrorType::UploadFailed,
        ErrorType::SpaceInsufficient,
        ErrorType::StoreError,
        ErrorType::FileNotFound,
        ErrorType::PermissionDenied,
        ErrorType::NetworkError,
        ErrorType::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::CompressionFailed => "COMPRESSION_FAILED",
            ErrorType::VerificationFailed => "VERIFICATION_FAILED",
            ErrorType::UploadFailed => "UPLOAD_FAILED",
            ErrorType::SpaceInsufficient => "SPACE_INSUFFICIENT",
            ErrorType::StoreError => "STORE_ERROR",
            ErrorType::FileNotFound => "FILE_NOT_FOUND",
            ErrorType::PermissionDenied => "PERMISSION_DENIED",
            ErrorType::NetworkError => "NETWORK_ERROR",
            ErrorType::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// RecoveryAction / RetryPolicy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryAction {
    /// Reset the item to its restart stage.
    Retry,
    /// Delete partial artifacts, then reset to `Classify`.
    CleanupAndRetry,
    /// Reset after an exponentially widening delay.
    WaitAndRetry,
    /// Give up on the item without escalation.
    Skip,
    /// Park the item and notify an operator.
    ManualIntervention,
}

impl RecoveryAction {
    /// Whether dispatching this action puts the item back into the pipeline.
    pub fn is_retry(&self) -> bool {
        matches!(
            self,
            RecoveryAction::Retry | RecoveryAction::CleanupAndRetry | RecoveryAction::WaitAndRetry
        )
    }
}

/// Retry budget and delay schedule for one [`ErrorType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub action: RecoveryAction,
}

impl RetryPolicy {
    pub const fn new(max_retries: u32, base_delay_secs: u64, action: RecoveryAction) -> Self {
        Self {
            max_retries,
            base_delay: Duration::from_secs(base_delay_secs),
            action,
        }
    }

    /// Built-in policy for an error type.
    pub fn for_error(error_type: ErrorType) -> Self {
        use RecoveryAction::*;
        match error_type {
            ErrorType::CompressionFailed => Self::new(3, 60, CleanupAndRetry),
            ErrorType::VerificationFailed => Self::new(2, 120, CleanupAndRetry),
            ErrorType::UploadFailed => Self::new(5, 300, Retry),
            ErrorType::SpaceInsufficient => Self::new(10, 600, WaitAndRetry),
            ErrorType::StoreError => Self::new(3, 30, Retry),
            ErrorType::FileNotFound => Self::new(1, 0, Skip),
            ErrorType::PermissionDenied => Self::new(1, 0, ManualIntervention),
            ErrorType::NetworkError => Self::new(5, 180, Retry),
            ErrorType::Unknown => Self::new(3, 300, Retry),
        }
    }

    /// Delay before the next dispatch after `retry_count` dispatches so far.
    ///
    /// Linear for `Retry`/`CleanupAndRetry`, doubling for `WaitAndRetry`,
    /// capped at [`MAX_RETRY_DELAY`].
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let delay = match self.action {
            RecoveryAction::WaitAndRetry => {
                let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
            _ => self.base_delay.saturating_mul(retry_count.max(1)),
        };
        delay.min(MAX_RETRY_DELAY)
    }
}

// ---------------------------------------------------------------------------
// ErrorRecord
// ---------------------------------------------------------------------------

/// Open failure owned by the recovery engine. At most one per item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub item_id: DbId,
    pub error_type: ErrorType,
    pub message: String,
    pub stage: ItemStage,
    pub retry_count: u32,
    pub max_retries: u32,
    pub action: RecoveryAction,
    /// `None` while a dispatched retry is in flight.
    pub next_retry_at: Option<Timestamp>,
    pub first_seen_at: Timestamp,
    pub last_seen_at: Timestamp,
}

impl ErrorRecord {
    pub fn new(
        item_id: DbId,
        error_type: ErrorType,
        message: impl Into<String>,
        stage: ItemStage,
        policy: &RetryPolicy,
        now: Timestamp,
    ) -> Self {
        Self {
            item_id,
            error_type,
            message: message.into(),
            stage,
            retry_count: 0,
            max_retries: policy.max_retries,
            action: policy.action,
            next_retry_at: Some(now + to_chrono(policy.delay_for(0))),
            first_seen_at: now,
            last_seen_at: now,
        }
    }

    /// Re-arm an existing record after the item failed again.
    ///
    /// The retry count is kept so repeated failures stay bounded.
    pub fn refail(
        &mut self,
        error_type: ErrorType,
        message: impl Into<String>,
        stage: ItemStage,
        policy: &RetryPolicy,
        now: Timestamp,
    ) {
        self.error_type = error_type;
        self.message = message.into();
        self.stage = stage;
        self.max_retries = policy.max_retries;
        self.action = policy.action;
        self.next_retry_at = Some(now + to_chrono(policy.delay_for(self.retry_count)));
        self.last_seen_at = now;
    }

    pub fn is_due(&self, now: Timestamp) -> bool {
        self.next_retry_at.is_some_and(|at| at <= now)
    }

    /// Retry budget has been used up.
    pub fn is_exhausted(&self) -> bool {
        self.retry_count > self.max_retries
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Keyword rules, most specific environmental conditions first.
const KEYWORD_RULES: [(&str, ErrorType); 8] = [
    (r"(?i)space|disk full|\bdisk\b|enospc|quota", ErrorType::SpaceInsufficient),
    (r"(?i)not found|no such file|does not exist|enoent", ErrorType::FileNotFound),
    (r"(?i)permission|access denied|eacces|forbidden", ErrorType::PermissionDenied),
    (r"(?i)network|connection|timed out|timeout|unreachable|dns", ErrorType::NetworkError),
    (r"(?i)upload|errno", ErrorType::UploadFailed),
    (r"(?i)verif|hash|digest|checksum|mismatch", ErrorType::VerificationFailed),
    (r"(?i)compress|zip|archive|\btar\b|gzip|deflate|seal", ErrorType::CompressionFailed),
    (r"(?i)database|store|sql|postgres", ErrorType::StoreError),
];

// The rules are constants and every one is compiled by the classifier tests,
// so the expect below cannot fire at runtime.
static KEYWORD_PATTERNS: LazyLock<Vec<(Regex, ErrorType)>> = LazyLock::new(|| {
    KEYWORD_RULES
        .iter()
        .map(|(pattern, ty)| (Regex::new(pattern).expect("valid regex"), *ty))
        .collect()
});

/// Default classifier: first matching keyword rule wins.
pub fn classify_message(message: &str) -> ErrorType {
    KEYWORD_PATTERNS
        .iter()
        .find(|(re, _)| re.is_match(message))
        .map(|(_, ty)| *ty)
        .unwrap_or(ErrorType::Unknown)
}

/// Pluggable `message -> ErrorType` mapping.
#[derive(Clone)]
pub struct ErrorClassifier(Arc<dyn Fn(&str) -> ErrorType + Send + Sync>);

impl ErrorClassifier {
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&str) -> ErrorType + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn classify(&self, message: &str) -> ErrorType {
        (self.0)(message)
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::from_fn(classify_message)
    }
}

impl fmt::Debug for ErrorClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ErrorClassifier")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    // -- classification -----------------------------------------------------

    #[test]
    fn classifies_common_messages() {
        let cases = [
            ("insufficient disk space for zip stage", ErrorType::SpaceInsufficient),
            ("No such file or directory (os error 2)", ErrorType::FileNotFound),
            ("Permission denied (os error 13)", ErrorType::PermissionDenied),
            ("connection reset by peer", ErrorType::NetworkError),
            ("upload rejected with errno 31024", ErrorType::UploadFailed),
            ("decompressed hash mismatch", ErrorType::VerificationFailed),
            ("failed to compress folder", ErrorType::CompressionFailed),
            ("database pool closed", ErrorType::StoreError),
            ("something odd happened", ErrorType::Unknown),
        ];
        for (message, expected) in cases {
            assert_eq!(classify_message(message), expected, "{message}");
        }
    }

    #[test]
    fn tar_keyword_needs_word_boundary() {
        assert_eq!(classify_message("failed to start worker"), ErrorType::Unknown);
        assert_eq!(classify_message("corrupt tar header"), ErrorType::CompressionFailed);
    }

    #[test]
    fn custom_classifier_replaces_keywords() {
        let classifier = ErrorClassifier::from_fn(|msg| {
            if msg.starts_with("E42") {
                ErrorType::NetworkError
            } else {
                ErrorType::Unknown
            }
        });
        assert_eq!(classifier.classify("E42: bad gateway"), ErrorType::NetworkError);
        assert_eq!(classifier.classify("zip failed"), ErrorType::Unknown);
    }

    // -- policies -----------------------------------------------------------

    #[test]
    fn every_error_type_has_a_policy() {
        for ty in ErrorType::ALL {
            let policy = RetryPolicy::for_error(ty);
            assert!(policy.max_retries >= 1, "{ty}");
        }
        assert_eq!(
            RetryPolicy::for_error(ErrorType::FileNotFound).action,
            RecoveryAction::Skip
        );
        assert_eq!(
            RetryPolicy::for_error(ErrorType::PermissionDenied).action,
            RecoveryAction::ManualIntervention
        );
    }

    #[test]
    fn retry_delay_grows_linearly() {
        let policy = RetryPolicy::new(5, 60, RecoveryAction::Retry);
        assert_eq!(policy.delay_for(0), Duration::from_secs(60));
        assert_eq!(policy.delay_for(1), Duration::from_secs(60));
        assert_eq!(policy.delay_for(3), Duration::from_secs(180));
    }

    #[test]
    fn wait_delay_doubles_and_caps() {
        let policy = RetryPolicy::new(10, 600, RecoveryAction::WaitAndRetry);
        assert_eq!(policy.delay_for(0), Duration::from_secs(600));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2400));
        assert_eq!(policy.delay_for(40), MAX_RETRY_DELAY);
    }

    // -- ErrorRecord --------------------------------------------------------

    #[test]
    fn new_record_is_due_after_base_delay() {
        let now = Utc::now();
        let policy = RetryPolicy::new(3, 60, RecoveryAction::Retry);
        let record = ErrorRecord::new(1, ErrorType::Unknown, "boom", ItemStage::Zip, &policy, now);
        assert!(!record.is_due(now));
        assert!(record.is_due(now + chrono::Duration::seconds(60)));
    }

    #[test]
    fn refail_keeps_retry_count() {
        let now = Utc::now();
        let policy = RetryPolicy::new(3, 10, RecoveryAction::Retry);
        let mut record = ErrorRecord::new(1, ErrorType::Unknown, "a", ItemStage::Zip, &policy, now);
        record.retry_count = 2;
        record.next_retry_at = None;
        record.refail(ErrorType::NetworkError, "b", ItemStage::UploadQueue, &policy, now);
        assert_eq!(record.retry_count, 2);
        assert_eq!(record.error_type, ErrorType::NetworkError);
        assert_eq!(record.next_retry_at, Some(now + chrono::Duration::seconds(20)));
    }
}
