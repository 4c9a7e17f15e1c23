//! Per-integration reconciliation settings and the registry that routes
//! webhooks and callbacks to them.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tether_types::config::PollingConfig;

use super::classifier::StatusClassifier;
use super::payload::PayloadExtractor;
use super::probe::PollProbe;
use super::scheduler::PollBackoff;
use super::verifier::SignatureVerifier;

/// Everything the reconciler needs to know about one integration.
pub struct Provider<P> {
    pub name: String,
    /// Correlation namespace shared by all tasks of this provider.
    pub correlation_key: String,
    pub verifier: Arc<dyn SignatureVerifier>,
    pub extractor: PayloadExtractor,
    pub classifier: Arc<dyn StatusClassifier>,
    pub polling: PollingConfig,
    pub backoff: PollBackoff,
    /// Webhook-only timeout window.
    pub timeout: Option<Duration>,
    pub probe: Option<P>,
}

impl<P: PollProbe> Provider<P> {
    /// Polling runs only when enabled and a probe is available.
    pub fn polls(&self) -> bool {
        self.polling.enabled && self.probe.is_some()
    }
}

impl<P> std::fmt::Debug for Provider<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider")
            .field("name", &self.name)
            .field("correlation_key", &self.correlation_key)
            .field("verifier", &self.verifier.scheme())
            .field("classifier", &self.classifier.name())
            .field("polling", &self.polling)
            .field("timeout", &self.timeout)
            .field("probe", &self.probe.is_some())
            .finish()
    }
}

/// Thread-safe registry mapping provider names to their settings.
pub struct ProviderRegistry<P> {
    providers: DashMap<String, Arc<Provider<P>>>,
}

impl<P> Default for ProviderRegistry<P> {
    fn default() -> Self {
        Self {
            providers: DashMap::new(),
        }
    }
}

impl<P: PollProbe> ProviderRegistry<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider, replacing any existing one with the same name.
    pub fn register(&self, provider: Provider<P>) {
        tracing::info!(
            provider = %provider.name,
            correlation_key = %provider.correlation_key,
            verification = provider.verifier.scheme(),
            classifier = provider.classifier.name(),
            polling = provider.polls(),
            "registered provider"
        );
        self.providers
            .insert(provider.name.clone(), Arc::new(provider));
    }

    pub fn get(&self, name: &str) -> Option<Arc<Provider<P>>> {
        self.providers.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Registered provider names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}
