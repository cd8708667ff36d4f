//! Hydrates secrets from AWS Systems Manager Parameter Store.

use super::SsmConfig;
use anyhow::{Context, Result};
use aws_config::{BehaviorVersion, Region};
use aws_sdk_ssm::Client;
use std::collections::HashMap;

/// `GetParameters` accepts at most ten names per call.
const BATCH_SIZE: usize = 10;

/// Resolves every mapped parameter and returns `config key -> value`.
pub async fn fetch_parameters(ssm: &SsmConfig) -> Result<HashMap<String, String>> {
    if ssm.mappings.is_empty() {
        tracing::info!("ssm mappings are empty, skipping parameter hydration");
        return Ok(HashMap::new());
    }

    let mut keys_by_parameter: HashMap<&str, Vec<&str>> = HashMap::new();
    for (key, parameter) in &ssm.mappings {
        keys_by_parameter
            .entry(parameter.as_str())
            .or_default()
            .push(key.as_str());
    }

    let mut loader = aws_config::defaults(BehaviorVersion::latest());
    if let Some(region) = ssm.region.as_deref().filter(|r| !r.trim().is_empty()) {
        loader = loader.region(Region::new(region.to_owned()));
    }
    let shared = loader.load().await;

    let mut builder = aws_sdk_ssm::config::Builder::from(&shared);
    if let Some(endpoint) = ssm.endpoint.as_deref().filter(|e| !e.trim().is_empty()) {
        builder = builder.endpoint_url(endpoint.trim());
    }
    let client = Client::from_conf(builder.build());

    let names: Vec<String> = keys_by_parameter.keys().map(|name| (*name).to_owned()).collect();
    let mut resolved = HashMap::with_capacity(names.len());

    for batch in names.chunks(BATCH_SIZE) {
        let output = client
            .get_parameters()
            .set_names(Some(batch.to_vec()))
            .with_decryption(true)
            .send()
            .await
            .context("ssm GetParameters failed")?;

        for parameter in output.parameters() {
            let (Some(name), Some(value)) = (parameter.name(), parameter.value()) else {
                continue;
            };
            for key in keys_by_parameter.get(name).into_iter().flatten() {
                tracing::info!(parameter = %name, config_key = %key, "ssm parameter loaded");
                resolved.insert((*key).to_owned(), value.to_owned());
            }
        }

        if !output.invalid_parameters().is_empty() {
            tracing::warn!(
                invalid = ?output.invalid_parameters(),
                "ssm reported invalid parameters"
            );
        }
    }

    Ok(resolved)
}
