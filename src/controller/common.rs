//! Shared controller helpers.
//!
//! Finalizer management for any namespaced resource.

use kube::{Api, Resource, ResourceExt, api::PatchParams};
use serde::de::DeserializeOwned;

use crate::controller::error::Error;

/// Add a finalizer to a resource.
pub async fn add_finalizer<T>(api: &Api<T>, name: &str, finalizer: &str) -> Result<(), Error>
where
    T: Resource + Clone + DeserializeOwned + std::fmt::Debug,
    <T as Resource>::DynamicType: Default,
{
    // Get current resource to check existing finalizers
    let resource = api.get(name).await?;
    let mut finalizers = resource.finalizers().to_vec();

    // Only add if not already present
    if !finalizers.contains(&finalizer.to_string()) {
        finalizers.push(finalizer.to_string());

        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers
            }
        });
        api.patch(
            name,
            &PatchParams::default(),
            &kube::api::Patch::Merge(&patch),
        )
        .await?;
    }
    Ok(())
}

/// Remove a specific finalizer from a resource.
pub async fn remove_finalizer<T>(api: &Api<T>, name: &str, finalizer: &str) -> Result<(), Error>
where
    T: Resource + Clone + DeserializeOwned + std::fmt::Debug,
    <T as Resource>::DynamicType: Default,
{
    let resource = match api.get(name).await {
        Ok(r) => r,
        Err(kube::Error::Api(e)) if e.code == 404 => {
            // Resource already deleted, nothing to do
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let finalizers: Vec<String> = resource
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != finalizer)
        .cloned()
        .collect();

    // Only patch if the finalizer was present
    if finalizers.len() != resource.finalizers().len() {
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers
            }
        });
        api.patch(
            name,
            &PatchParams::default(),
            &kube::api::Patch::Merge(&patch),
        )
        .await?;
    }
    Ok(())
}

/// Whether a resource carries a finalizer.
pub fn has_finalizer<T: Resource>(resource: &T, finalizer: &str) -> bool {
    resource.finalizers().iter().any(|f| f == finalizer)
}
