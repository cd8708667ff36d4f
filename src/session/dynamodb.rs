//! DynamoDB session table with native TTL eviction on the `ttl` attribute.

use super::storage::{SessionStore, StoreError};
use super::Session;
use crate::config::DynamoDbConfig;
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_dynamodb::config::Credentials;
use aws_sdk_dynamodb::types::{
    AttributeDefinition, AttributeValue, KeySchemaElement, KeyType, ProvisionedThroughput,
    ScalarAttributeType, TableStatus, TimeToLiveSpecification, TimeToLiveStatus,
};
use aws_sdk_dynamodb::Client;
use std::collections::HashMap;
use std::time::Duration;

const HASH_KEY: &str = "session_id";
const TTL_ATTRIBUTE: &str = "ttl";
const TABLE_READY_ATTEMPTS: usize = 30;

pub struct DynamoSessionStore {
    client: Client,
    table: String,
}

impl DynamoSessionStore {
    pub fn new(client: Client, table: impl Into<String>) -> Self {
        Self {
            client,
            table: table.into(),
        }
    }

    /// Builds a client for the configured region, or for the local emulator
    /// with static credentials when `dynamodb.local.endpoint` is set.
    pub async fn from_config(cfg: &DynamoDbConfig) -> Self {
        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(cfg.region.clone()));

        if let Some(local) = cfg.local.as_ref().filter(|l| !l.endpoint.trim().is_empty()) {
            tracing::info!(endpoint = %local.endpoint, "using local dynamodb endpoint");
            loader = loader
                .endpoint_url(local.endpoint.trim())
                .credentials_provider(Credentials::new(
                    local.access_key_id.clone(),
                    local.access_key.clone(),
                    None,
                    None,
                    "dynamodb-local",
                ));
        }

        let shared = loader.load().await;
        Self::new(Client::new(&shared), cfg.table.clone())
    }

    fn key(session_id: &str) -> AttributeValue {
        AttributeValue::S(session_id.to_owned())
    }

    /// Creates the table when missing and turns on TTL eviction.
    pub async fn ensure_table(&self) -> Result<(), StoreError> {
        match self.client.describe_table().table_name(&self.table).send().await {
            Ok(_) => tracing::debug!(table = %self.table, "session table exists"),
            Err(err) => {
                let err = err.into_service_error();
                if !err.is_resource_not_found_exception() {
                    return Err(StoreError::backend(err));
                }
                self.create_table().await?;
            }
        }

        self.enable_ttl().await
    }

    async fn create_table(&self) -> Result<(), StoreError> {
        self.client
            .create_table()
            .table_name(&self.table)
            .attribute_definitions(
                AttributeDefinition::builder()
                    .attribute_name(HASH_KEY)
                    .attribute_type(ScalarAttributeType::S)
                    .build()
                    .map_err(StoreError::backend)?,
            )
            .key_schema(
                KeySchemaElement::builder()
                    .attribute_name(HASH_KEY)
                    .key_type(KeyType::Hash)
                    .build()
                    .map_err(StoreError::backend)?,
            )
            .provisioned_throughput(
                ProvisionedThroughput::builder()
                    .read_capacity_units(5)
                    .write_capacity_units(5)
                    .build()
                    .map_err(StoreError::backend)?,
            )
            .send()
            .await
            .map_err(StoreError::backend)?;
        tracing::info!(table = %self.table, "session table created");

        for _ in 0..TABLE_READY_ATTEMPTS {
            let described = self
                .client
                .describe_table()
                .table_name(&self.table)
                .send()
                .await
                .map_err(StoreError::backend)?;
            let status = described.table().and_then(|table| table.table_status());
            if status == Some(&TableStatus::Active) {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        tracing::warn!(table = %self.table, "session table not active yet, continuing");
        Ok(())
    }

    async fn enable_ttl(&self) -> Result<(), StoreError> {
        let described = self
            .client
            .describe_time_to_live()
            .table_name(&self.table)
            .send()
            .await
            .map_err(StoreError::backend)?;

        let enabled = described.time_to_live_description().is_some_and(|ttl| {
            ttl.time_to_live_status() == Some(&TimeToLiveStatus::Enabled)
                && ttl.attribute_name() == Some(TTL_ATTRIBUTE)
        });
        if enabled {
            tracing::info!(table = %self.table, "ttl already enabled");
            return Ok(());
        }

        self.client
            .update_time_to_live()
            .table_name(&self.table)
            .time_to_live_specification(
                TimeToLiveSpecification::builder()
                    .attribute_name(TTL_ATTRIBUTE)
                    .enabled(true)
                    .build()
                    .map_err(StoreError::backend)?,
            )
            .send()
            .await
            .map_err(StoreError::backend)?;
        tracing::info!(table = %self.table, "ttl enabled");
        Ok(())
    }
}

#[async_trait]
impl SessionStore for DynamoSessionStore {
    async fn get(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        let output = self
            .client
            .get_item()
            .table_name(&self.table)
            .key(HASH_KEY, Self::key(session_id))
            .consistent_read(true)
            .send()
            .await
            .map_err(StoreError::backend)?;

        match output.item {
            Some(item) if !item.is_empty() => {
                let session = serde_dynamo::from_item(item).map_err(StoreError::backend)?;
                Ok(Some(session))
            }
            _ => Ok(None),
        }
    }

    async fn put(&self, session: &Session) -> Result<(), StoreError> {
        let item: HashMap<String, AttributeValue> =
            serde_dynamo::to_item(session).map_err(StoreError::backend)?;

        self.client
            .put_item()
            .table_name(&self.table)
            .set_item(Some(item))
            .send()
            .await
            .map_err(StoreError::backend)?;
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> Result<(), StoreError> {
        self.client
            .delete_item()
            .table_name(&self.table)
            .key(HASH_KEY, Self::key(session_id))
            .send()
            .await
            .map_err(StoreError::backend)?;
        Ok(())
    }
}
