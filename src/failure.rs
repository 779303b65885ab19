//! Failure values and classification.
//!
//! Every operation the framework drives reports errors as a [`Failure`]: a
//! category plus metadata, rather than an exception hierarchy. Retry and
//! degradation decisions are computed from the category, so classification
//! is a pure, inspectable step instead of control flow.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Named failure categories the framework has recovery policies for.
///
/// Categories key the retry policy tables, so they serialize as kebab-case
/// strings ("transient-network", "rate-limit", ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureCategory {
    Validation,
    DomainRule,
    TransientNetwork,
    ResourceNotFound,
    Authentication,
    RateLimit,
    SystemFailure,
    DataCorruption,
}

impl FailureCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::Validation => "validation",
            FailureCategory::DomainRule => "domain-rule",
            FailureCategory::TransientNetwork => "transient-network",
            FailureCategory::ResourceNotFound => "resource-not-found",
            FailureCategory::Authentication => "authentication",
            FailureCategory::RateLimit => "rate-limit",
            FailureCategory::SystemFailure => "system-failure",
            FailureCategory::DataCorruption => "data-corruption",
        }
    }

    /// The documented recovery intent for this category.
    pub fn recovery_intent(&self) -> RecoveryIntent {
        match self {
            FailureCategory::Validation => RecoveryIntent::UserCorrection,
            FailureCategory::DomainRule => RecoveryIntent::UserGuidance,
            FailureCategory::TransientNetwork => RecoveryIntent::AutomaticRetry,
            FailureCategory::ResourceNotFound => RecoveryIntent::Fallback,
            FailureCategory::Authentication => RecoveryIntent::Reauthenticate,
            FailureCategory::RateLimit => RecoveryIntent::ScheduledRetry,
            FailureCategory::SystemFailure => RecoveryIntent::CircuitBreaking,
            FailureCategory::DataCorruption => RecoveryIntent::Compensation,
        }
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a failure category is expected to be recovered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryIntent {
    UserCorrection,
    UserGuidance,
    AutomaticRetry,
    Fallback,
    Reauthenticate,
    ScheduledRetry,
    CircuitBreaking,
    Compensation,
}

/// A classified failure raised by an operation.
///
/// Immutable once constructed; the category, once assigned, is never
/// reassigned for the remainder of a retry loop. Cloneable so aggregate
/// errors can carry the same failure the caller sees.
#[derive(Debug, Clone)]
pub struct Failure {
    category: Option<FailureCategory>,
    message: String,
    cause: Option<Arc<dyn std::error::Error + Send + Sync>>,
    retry_after: Option<Duration>,
    is_critical: bool,
}

impl Failure {
    /// An unclassified failure. A classifier may assign a category later.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            category: None,
            message: message.into(),
            cause: None,
            retry_after: None,
            is_critical: false,
        }
    }

    /// A failure with a known category.
    pub fn with_category(category: FailureCategory, message: impl Into<String>) -> Self {
        Self {
            category: Some(category),
            ..Self::new(message)
        }
    }

    /// A fatal failure. Never retried, never a degradation trigger.
    pub fn critical(message: impl Into<String>) -> Self {
        Self {
            is_critical: true,
            ..Self::new(message)
        }
    }

    /// Wrap an underlying error, keeping it reachable via `source()`.
    pub fn from_error(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self {
            message: error.to_string(),
            cause: Some(Arc::new(error)),
            ..Self::new("")
        }
    }

    /// A timeout produced by one of the framework's own races.
    pub fn timeout(what: impl fmt::Display, limit: Duration) -> Self {
        Self::with_category(
            FailureCategory::TransientNetwork,
            format!("{what} timed out after {limit:?}"),
        )
    }

    pub fn set_cause(mut self, error: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Arc::new(error));
        self
    }

    /// Attach an explicit retry-after hint (e.g. from a rate-limit signal).
    pub fn set_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }

    pub fn set_critical(mut self) -> Self {
        self.is_critical = true;
        self
    }

    /// Assign a category if none is present. An existing category wins.
    pub(crate) fn ensure_category(mut self, category: FailureCategory) -> Self {
        if self.category.is_none() {
            self.category = Some(category);
        }
        self
    }

    pub fn category(&self) -> Option<FailureCategory> {
        self.category
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    pub fn is_critical(&self) -> bool {
        self.is_critical
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.category {
            Some(category) => write!(f, "[{}] {}", category, self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for Failure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_ref()
            .map(|cause| &**cause as &(dyn std::error::Error + 'static))
    }
}

/// Maps a raised failure to a category, or `None` when the system has no
/// policy for it. `None` is a contract: callers must treat it as fatal.
///
/// Implementations must be pure and deterministic, and must return an
/// already-assigned category unchanged.
pub trait FailureClassifier: Send + Sync {
    fn classify(&self, failure: &Failure) -> Option<FailureCategory>;
}

type Predicate = Arc<dyn Fn(&Failure) -> bool + Send + Sync>;

/// An ordered chain of predicates; the first match wins.
#[derive(Clone, Default)]
pub struct PredicateClassifier {
    rules: Vec<(Predicate, FailureCategory)>,
}

impl PredicateClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rule<F>(mut self, predicate: F, category: FailureCategory) -> Self
    where
        F: Fn(&Failure) -> bool + Send + Sync + 'static,
    {
        self.rules.push((Arc::new(predicate), category));
        self
    }

    /// Match any of the given (lowercased) substrings in the message.
    pub fn message_rule(self, patterns: &[&str], category: FailureCategory) -> Self {
        let patterns: Vec<String> = patterns.iter().map(|p| p.to_lowercase()).collect();
        self.rule(
            move |failure| {
                let message = failure.message().to_lowercase();
                patterns.iter().any(|p| message.contains(p.as_str()))
            },
            category,
        )
    }
}

impl FailureClassifier for PredicateClassifier {
    fn classify(&self, failure: &Failure) -> Option<FailureCategory> {
        if let Some(category) = failure.category() {
            return Some(category);
        }
        self.rules
            .iter()
            .find(|(predicate, _)| predicate(failure))
            .map(|(_, category)| *category)
    }
}

impl fmt::Debug for PredicateClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PredicateClassifier")
            .field("rules", &self.rules.len())
            .finish()
    }
}

/// A classifier covering the common message shapes of network clients:
/// connection/timeout phrasing, HTTP status code ranges, rate-limit signals.
pub fn default_classifier() -> PredicateClassifier {
    PredicateClassifier::new()
        .message_rule(
            &["429", "rate limit", "too many requests"],
            FailureCategory::RateLimit,
        )
        .message_rule(
            &[
                "connection",
                "timed out",
                "timeout",
                "reset by peer",
                "dns",
                "unreachable",
                "broken pipe",
            ],
            FailureCategory::TransientNetwork,
        )
        .message_rule(
            &["500", "502", "503", "504", "internal server error", "bad gateway"],
            FailureCategory::SystemFailure,
        )
        .message_rule(
            &["401", "403", "unauthorized", "forbidden", "expired token"],
            FailureCategory::Authentication,
        )
        .message_rule(&["404", "not found"], FailureCategory::ResourceNotFound)
        .message_rule(
            &["400", "422", "invalid", "validation", "malformed"],
            FailureCategory::Validation,
        )
        .message_rule(&["corrupt", "checksum"], FailureCategory::DataCorruption)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_category() {
        let failure = Failure::with_category(FailureCategory::RateLimit, "slow down");
        assert_eq!(failure.to_string(), "[rate-limit] slow down");

        let bare = Failure::new("oops");
        assert_eq!(bare.to_string(), "oops");
    }

    #[test]
    fn classifier_matches_first_rule() {
        let classifier = default_classifier();
        let failure = Failure::new("connection refused by upstream");
        assert_eq!(
            classifier.classify(&failure),
            Some(FailureCategory::TransientNetwork)
        );

        let failure = Failure::new("HTTP 429 Too Many Requests");
        assert_eq!(classifier.classify(&failure), Some(FailureCategory::RateLimit));
    }

    #[test]
    fn classifier_preserves_assigned_category() {
        // A failure arriving with a category keeps it, whatever the message says.
        let classifier = default_classifier();
        let failure = Failure::with_category(FailureCategory::DomainRule, "connection refused");
        assert_eq!(classifier.classify(&failure), Some(FailureCategory::DomainRule));
    }

    #[test]
    fn unmatched_failure_is_unclassified() {
        let classifier = default_classifier();
        let failure = Failure::new("the widget frobnicated");
        assert_eq!(classifier.classify(&failure), None);
    }

    #[test]
    fn ensure_category_never_reassigns() {
        let failure = Failure::with_category(FailureCategory::RateLimit, "x")
            .ensure_category(FailureCategory::Validation);
        assert_eq!(failure.category(), Some(FailureCategory::RateLimit));

        let failure = Failure::new("x").ensure_category(FailureCategory::Validation);
        assert_eq!(failure.category(), Some(FailureCategory::Validation));
    }

    #[test]
    fn source_chain_reaches_cause() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out");
        let failure = Failure::from_error(io);
        assert!(std::error::Error::source(&failure).is_some());
        assert_eq!(failure.message(), "timed out");
    }

    #[test]
    fn category_serde_round_trip() {
        let json = serde_json::to_string(&FailureCategory::TransientNetwork).unwrap();
        assert_eq!(json, "\"transient-network\"");
        let back: FailureCategory = serde_json::from_str(&json).unwrap();
        assert_eq!(back, FailureCategory::TransientNetwork);
    }
}
