use std::{collections::HashMap, sync::Arc};

use anyhow::{anyhow, Result};
use parking_lot::RwLock;

use super::{
    adapter::{ChannelAdapter, HttpSettings},
    facebook::FacebookAdapter,
    lazada::LazadaAdapter,
    zalo::ZaloAdapter,
};
use crate::{config::AppConfig, error::ChannelError, types::Platform};

#[derive(Clone, Default)]
pub struct ChannelRegistry {
    adapters: Arc<RwLock<HashMap<Platform, Arc<dyn ChannelAdapter>>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, adapter: Arc<dyn ChannelAdapter>) -> Result<()> {
        let platform = adapter.platform();
        let mut guard = self.adapters.write();
        if guard.contains_key(&platform) {
            return Err(anyhow!("channel adapter already registered: {platform}"));
        }
        guard.insert(platform, adapter);
        Ok(())
    }

    pub fn register_replace(&self, adapter: Arc<dyn ChannelAdapter>) {
        self.adapters.write().insert(adapter.platform(), adapter);
    }

    pub fn get(&self, platform: Platform) -> Result<Arc<dyn ChannelAdapter>, ChannelError> {
        self.adapters
            .read()
            .get(&platform)
            .cloned()
            .ok_or_else(|| ChannelError::UnknownPlatform(platform.to_string()))
    }

    pub fn platforms(&self) -> Vec<Platform> {
        let mut items = self.adapters.read().keys().copied().collect::<Vec<_>>();
        items.sort_unstable();
        items
    }
}

/// Registers an adapter for every enabled platform.
pub fn build_channel_registry(config: &AppConfig, http: reqwest::Client) -> Result<ChannelRegistry> {
    let settings = HttpSettings::new(http, config.upstream_timeout);
    let registry = ChannelRegistry::new();
    for platform in &config.enabled_platforms {
        let adapter: Arc<dyn ChannelAdapter> = match platform {
            Platform::Zalo => Arc::new(ZaloAdapter::new(
                settings.clone(),
                &config.api_bases.zalo,
                &config.credentials.zalo_oa_secret_key,
            )),
            Platform::Facebook => Arc::new(FacebookAdapter::new(
                settings.clone(),
                &config.api_bases.facebook,
                &config.credentials.facebook_app_secret,
                &config.credentials.facebook_verify_token,
            )),
            Platform::Lazada => Arc::new(LazadaAdapter::new(
                settings.clone(),
                &config.api_bases.lazada,
                &config.credentials.lazada_app_key,
                &config.credentials.lazada_app_secret,
            )),
        };
        registry.register(adapter)?;
    }
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channels::adapter::{InboundEvent, OutboundContent, OutboundTarget},
        types::{Channel, CustomerProfile},
    };
    use async_trait::async_trait;
    use serde_json::Value;

    struct MockAdapter;

    #[async_trait]
    impl ChannelAdapter for MockAdapter {
        fn platform(&self) -> Platform {
            Platform::Lazada
        }

        fn parse_webhook(&self, _payload: &Value) -> Result<Vec<InboundEvent>, ChannelError> {
            Ok(vec![])
        }

        async fn fetch_profile(
            &self,
            _channel: &Channel,
            _external_id: &str,
        ) -> Result<CustomerProfile, ChannelError> {
            Ok(CustomerProfile::default())
        }

        async fn send_message(
            &self,
            _channel: &Channel,
            _target: &OutboundTarget,
            _content: &OutboundContent,
        ) -> Result<String, ChannelError> {
            Ok("sent".to_string())
        }
    }

    #[test]
    fn register_and_get_adapter() {
        let registry = ChannelRegistry::new();
        registry.register(Arc::new(MockAdapter)).unwrap();
        assert!(registry.get(Platform::Lazada).is_ok());
        assert!(matches!(
            registry.get(Platform::Zalo),
            Err(ChannelError::UnknownPlatform(_))
        ));
    }

    #[test]
    fn duplicate_register_returns_error() {
        let registry = ChannelRegistry::new();
        registry.register(Arc::new(MockAdapter)).unwrap();
        let err = registry.register(Arc::new(MockAdapter)).unwrap_err();
        assert!(err.to_string().contains("already registered"));
    }

    #[test]
    fn builds_only_enabled_platforms() {
        let config = AppConfig {
            enabled_platforms: vec![Platform::Zalo, Platform::Facebook],
            ..AppConfig::default()
        };
        let registry = build_channel_registry(&config, reqwest::Client::new()).unwrap();
        assert_eq!(registry.platforms(), vec![Platform::Zalo, Platform::Facebook]);
    }
}
