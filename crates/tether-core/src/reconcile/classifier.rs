//! Provider status vocabularies.
//!
//! Each provider reports progress in its own words. A `StatusClassifier`
//! maps those words onto the three outcomes the reconciler understands;
//! adding a provider means adding an implementation, not editing the
//! reconciler.

use std::collections::HashSet;
use std::sync::Arc;

use tether_types::config::ClassifierConfig;

/// Outcome of classifying one provider status string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Final success.
    Succeeded,
    /// Final failure.
    Failed,
    /// Final, the external task was aborted. Recorded as a failure.
    Cancelled,
    /// Intermediate status; the task keeps waiting.
    Pending,
}

impl Classification {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Classification::Pending)
    }
}

/// Strategy mapping a provider's status vocabulary onto outcomes.
pub trait StatusClassifier: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    fn classify(&self, status: &str) -> Classification;
}

/// Cloud coding-agent launches (`CREATING`, `RUNNING`, `FINISHED`, ...).
#[derive(Debug, Clone, Copy, Default)]
pub struct CloudAgentClassifier;

impl StatusClassifier for CloudAgentClassifier {
    fn name(&self) -> &str {
        "cloud_agent"
    }

    fn classify(&self, status: &str) -> Classification {
        match status.trim().to_ascii_uppercase().as_str() {
            "FINISHED" | "COMPLETED" | "SUCCEEDED" => Classification::Succeeded,
            "ERROR" | "FAILED" | "EXPIRED" => Classification::Failed,
            "CANCELLED" | "CANCELED" | "STOPPED" => Classification::Cancelled,
            _ => Classification::Pending,
        }
    }
}

/// Interactive chat approvals (`approved` / `rejected`).
#[derive(Debug, Clone, Copy, Default)]
pub struct ApprovalClassifier;

impl StatusClassifier for ApprovalClassifier {
    fn name(&self) -> &str {
        "approval"
    }

    fn classify(&self, status: &str) -> Classification {
        match status.trim().to_ascii_lowercase().as_str() {
            "approved" | "approve" | "accepted" => Classification::Succeeded,
            "rejected" | "reject" | "denied" | "declined" => Classification::Failed,
            "cancelled" | "canceled" | "withdrawn" => Classification::Cancelled,
            _ => Classification::Pending,
        }
    }
}

/// Explicit, configured vocabulary. Comparison is case-insensitive.
#[derive(Debug, Clone, Default)]
pub struct VocabularyClassifier {
    success: HashSet<String>,
    failure: HashSet<String>,
    cancelled: HashSet<String>,
}

impl VocabularyClassifier {
    pub fn new<I, S>(success: I, failure: I, cancelled: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let normalize = |items: I| {
            items
                .into_iter()
                .map(|s| s.as_ref().trim().to_lowercase())
                .collect::<HashSet<_>>()
        };
        Self {
            success: normalize(success),
            failure: normalize(failure),
            cancelled: normalize(cancelled),
        }
    }
}

impl StatusClassifier for VocabularyClassifier {
    fn name(&self) -> &str {
        "custom"
    }

    fn classify(&self, status: &str) -> Classification {
        let status = status.trim().to_lowercase();
        if self.success.contains(&status) {
            Classification::Succeeded
        } else if self.failure.contains(&status) {
            Classification::Failed
        } else if self.cancelled.contains(&status) {
            Classification::Cancelled
        } else {
            Classification::Pending
        }
    }
}

/// Build the classifier named by a provider's configuration.
pub fn classifier_for(config: &ClassifierConfig) -> Arc<dyn StatusClassifier> {
    match config {
        ClassifierConfig::CloudAgent => Arc::new(CloudAgentClassifier),
        ClassifierConfig::Approval => Arc::new(ApprovalClassifier),
        ClassifierConfig::Custom {
            success,
            failure,
            cancelled,
        } => Arc::new(VocabularyClassifier::new(success, failure, cancelled)),
    }
}
