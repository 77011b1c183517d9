use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::debug;

use crate::app::config::ProviderConfig;
use crate::error::{Error, Result};
use crate::models::provider::{ContentType, ModelDescriptor, ProviderDescriptor};

/// Providers grouped by content type. Built once from configuration; only
/// per-model runtime state changes afterwards.
#[derive(Debug, Default)]
pub struct Registry {
    providers: BTreeMap<ContentType, Vec<Arc<ProviderDescriptor>>>,
}

impl Registry {
    pub fn from_config(configs: &[ProviderConfig]) -> Result<Self> {
        let providers = configs
            .iter()
            .map(|config| ProviderDescriptor::from_config(config).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        Self::from_providers(providers)
    }

    pub fn from_providers(descriptors: impl IntoIterator<Item = Arc<ProviderDescriptor>>) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut providers: BTreeMap<ContentType, Vec<Arc<ProviderDescriptor>>> = BTreeMap::new();

        for provider in descriptors {
            if !seen.insert(provider.key()) {
                return Err(Error::registry(format!(
                    "provider '{}' is declared twice for {} content",
                    provider.name, provider.content_type
                )));
            }
            debug!(
                "Registered provider {} with {} models",
                provider.key(),
                provider.models().len()
            );
            providers.entry(provider.content_type).or_default().push(provider);
        }

        for list in providers.values_mut() {
            list.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
        }

        Ok(Self { providers })
    }

    /// Enabled providers for a content type, ascending by priority.
    pub fn providers_for(&self, content_type: ContentType) -> Vec<Arc<ProviderDescriptor>> {
        self.providers
            .get(&content_type)
            .map(|list| list.iter().filter(|p| p.enabled).cloned().collect())
            .unwrap_or_default()
    }

    pub fn provider(&self, content_type: ContentType, name: &str) -> Option<Arc<ProviderDescriptor>> {
        self.providers
            .get(&content_type)
            .and_then(|list| list.iter().find(|p| p.name == name).cloned())
    }

    /// Every registered provider, disabled ones included.
    pub fn all(&self) -> impl Iterator<Item = &Arc<ProviderDescriptor>> {
        self.providers.values().flatten()
    }

    pub fn content_types(&self) -> impl Iterator<Item = ContentType> + '_ {
        self.providers.keys().copied()
    }

    pub fn available_models(&self, provider: &ProviderDescriptor) -> Vec<Arc<ModelDescriptor>> {
        provider.available_models()
    }

    pub fn available_models_at(
        &self,
        provider: &ProviderDescriptor,
        now: DateTime<Utc>,
    ) -> Vec<Arc<ModelDescriptor>> {
        provider.available_models_at(now)
    }

    pub fn len(&self) -> usize {
        self.providers.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::config::{AppConfig, ModelConfig};
    use crate::models::cooldown::ErrorClass;
    use std::time::Duration;

    fn catalog() -> Vec<ProviderConfig> {
        AppConfig::default_catalog().providers
    }

    #[test]
    fn test_providers_sorted_by_priority() {
        let mut configs = catalog();
        configs.reverse();
        let registry = Registry::from_config(&configs).unwrap();

        let names: Vec<_> = registry
            .providers_for(ContentType::Text)
            .iter()
            .map(|p| p.name.clone())
            .collect();
        assert_eq!(names, vec!["groq", "together", "gemini"]);
        assert_eq!(registry.providers_for(ContentType::Image).len(), 1);
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn test_content_types_listed_in_order() {
        let registry = Registry::from_config(&catalog()).unwrap();
        let types: Vec<_> = registry.content_types().collect();
        assert_eq!(types, vec![ContentType::Text, ContentType::Image]);
    }

    #[test]
    fn test_disabled_provider_skipped() {
        let mut configs = catalog();
        configs[0].enabled = false;
        let registry = Registry::from_config(&configs).unwrap();

        assert!(registry
            .providers_for(ContentType::Text)
            .iter()
            .all(|p| p.name != "groq"));
        assert!(registry.provider(ContentType::Text, "groq").is_some());
    }

    #[test]
    fn test_duplicate_provider_fails_fast() {
        let mut configs = catalog();
        configs.push(configs[0].clone());
        assert!(Registry::from_config(&configs).is_err());
    }

    #[test]
    fn test_same_name_allowed_across_content_types() {
        let mut configs = catalog();
        let mut image = configs[3].clone();
        image.name = "groq".to_string();
        configs.push(image);
        assert!(Registry::from_config(&configs).is_ok());
    }

    #[test]
    fn test_negative_model_priority_fails() {
        let mut configs = catalog();
        configs[0].models.push(ModelConfig {
            name: "broken".to_string(),
            priority: -2,
            ..ModelConfig::default()
        });
        assert!(Registry::from_config(&configs).is_err());
    }

    #[test]
    fn test_available_models_excludes_cooled_down() {
        let registry = Registry::from_config(&catalog()).unwrap();
        let groq = registry.provider(ContentType::Text, "groq").unwrap();
        let now = Utc::now();

        let models = registry.available_models_at(&groq, now);
        assert_eq!(models.len(), 2);
        assert_eq!(models[0].name, "llama-3.3-70b-versatile");

        models[0].enter_cooldown_at(now, Duration::from_secs(60), ErrorClass::RateLimited, "429");
        let models = registry.available_models_at(&groq, now);
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].name, "llama-3.1-8b-instant");

        let later = now + chrono::Duration::seconds(61);
        assert_eq!(registry.available_models_at(&groq, later).len(), 2);
    }
}
