//! Maps a platform sender id onto a stable internal customer.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::{
    channels::ChannelRegistry,
    error::{ChannelError, StoreError},
    store::ChatStore,
    types::{Channel, Customer, CustomerProfile, NewCustomer},
};

#[async_trait]
pub trait ProfileFetcher: Send + Sync {
    async fn fetch_profile(
        &self,
        channel: &Channel,
        external_id: &str,
    ) -> Result<CustomerProfile, ChannelError>;
}

#[async_trait]
impl ProfileFetcher for ChannelRegistry {
    async fn fetch_profile(
        &self,
        channel: &Channel,
        external_id: &str,
    ) -> Result<CustomerProfile, ChannelError> {
        self.get(channel.platform)?
            .fetch_profile(channel, external_id)
            .await
    }
}

pub struct CustomerResolver {
    store: Arc<dyn ChatStore>,
    profiles: Arc<dyn ProfileFetcher>,
    timeout: Duration,
}

impl CustomerResolver {
    pub fn new(store: Arc<dyn ChatStore>, profiles: Arc<dyn ProfileFetcher>, timeout: Duration) -> Self {
        Self {
            store,
            profiles,
            timeout,
        }
    }

    /// Finds the customer behind `external_id` on the channel's platform,
    /// creating it on first contact. Profile lookups never block creation.
    pub async fn resolve_or_create(
        &self,
        channel: &Channel,
        external_id: &str,
    ) -> Result<Customer, StoreError> {
        let external_id = external_id.trim();
        if let Some(customer) = self
            .store
            .find_customer(channel.shop_id, channel.platform, external_id)
            .await?
        {
            if customer.has_profile() {
                return Ok(customer);
            }
            return Ok(self.backfill_profile(channel, customer).await);
        }

        let profile = self.fetch_profile(channel, external_id).await;
        let upserted = self
            .store
            .upsert_customer(NewCustomer {
                shop_id: channel.shop_id,
                platform: channel.platform,
                external_id: external_id.to_string(),
                profile,
            })
            .await?;
        if upserted.created {
            debug!(
                customer_id = upserted.value.id,
                channel_id = channel.id,
                "created customer"
            );
        }
        Ok(upserted.value)
    }

    async fn backfill_profile(&self, channel: &Channel, customer: Customer) -> Customer {
        let profile = self.fetch_profile(channel, &customer.external_id).await;
        if profile.is_empty() {
            return customer;
        }
        match self.store.update_customer_profile(customer.id, &profile).await {
            Ok(updated) => updated,
            Err(err) => {
                warn!(error = %err, customer_id = customer.id, "profile backfill failed");
                customer
            }
        }
    }

    async fn fetch_profile(&self, channel: &Channel, external_id: &str) -> CustomerProfile {
        match tokio::time::timeout(
            self.timeout,
            self.profiles.fetch_profile(channel, external_id),
        )
        .await
        {
            Ok(Ok(profile)) => profile,
            Ok(Err(err)) => {
                warn!(error = %err, channel_id = channel.id, "profile fetch failed");
                CustomerProfile::default()
            }
            Err(_) => {
                warn!(channel_id = channel.id, timeout = ?self.timeout, "profile fetch timed out");
                CustomerProfile::default()
            }
        }
    }
}
