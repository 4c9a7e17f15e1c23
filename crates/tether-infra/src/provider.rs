//! Builds the provider registry from configuration.

use tether_core::reconcile::classifier::classifier_for;
use tether_core::reconcile::payload::PayloadExtractor;
use tether_core::reconcile::provider::{Provider, ProviderRegistry};
use tether_core::reconcile::scheduler::PollBackoff;
use tether_types::config::{ProviderConfig, TetherConfig};
use tether_types::error::ConfigError;

use crate::runtime::HttpPollProbe;
use crate::webhook::build_verifier;

/// Build one provider: verifier, extractor, classifier and probe.
pub fn build_provider(config: &ProviderConfig) -> Result<Provider<HttpPollProbe>, ConfigError> {
    config.validate()?;

    let probe = config
        .probe
        .clone()
        .map(HttpPollProbe::new)
        .transpose()
        .map_err(|e| ConfigError::provider(&config.name, e.to_string()))?;

    Ok(Provider {
        name: config.name.clone(),
        correlation_key: config.correlation_key.clone(),
        verifier: build_verifier(&config.name, &config.verification)?,
        extractor: PayloadExtractor::new(config.payload.clone()),
        classifier: classifier_for(&config.classifier),
        polling: config.polling.clone(),
        backoff: PollBackoff::from_config(&config.polling),
        timeout: config.timeout(),
        probe,
    })
}

/// Validate the whole configuration and register every provider.
pub fn build_registry(config: &TetherConfig) -> Result<ProviderRegistry<HttpPollProbe>, ConfigError> {
    config.validate()?;
    let registry = ProviderRegistry::new();
    for provider in &config.providers {
        registry.register(build_provider(provider)?);
    }
    Ok(registry)
}
