//! Backend traits the controller talks to.
//!
//! The controller never owns its backends: configuration lives in a
//! [`ConfigStore`] written by other actors, and the controller's own spec and
//! status live behind an [`OperatorClient`] with optimistic concurrency.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{ConfigMap, OperatorSpec, OperatorStatus, OwnerReference, Secret};

/// Access to the controller's persisted spec and status.
#[async_trait]
pub trait OperatorClient: Send + Sync {
    /// Read spec, status and the resource version the two were read at.
    async fn get(&self) -> Result<(OperatorSpec, OperatorStatus, String)>;

    /// Replace the status if the stored resource version still equals
    /// `resource_version`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Conflict`] when another writer got there first.
    async fn update_status(
        &self,
        resource_version: &str,
        status: OperatorStatus,
    ) -> Result<OperatorStatus>;
}

/// Access to config maps and secrets.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// # Errors
    ///
    /// Returns [`crate::Error::NotFound`] when the config map does not exist.
    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap>;

    /// # Errors
    ///
    /// Returns [`crate::Error::NotFound`] when the secret does not exist.
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret>;

    /// Create the config map, or update it when its content or owner
    /// references differ. Returns the stored object and whether a write
    /// happened.
    async fn apply_config_map(&self, config_map: ConfigMap) -> Result<(ConfigMap, bool)>;

    /// Copy a config map under a new name with the given owners.
    ///
    /// Returns `None` when the source does not exist; any stale destination
    /// is removed in that case.
    async fn sync_config_map(
        &self,
        source_namespace: &str,
        source_name: &str,
        target_namespace: &str,
        target_name: &str,
        owner_refs: &[OwnerReference],
    ) -> Result<(Option<ConfigMap>, bool)>;

    /// Copy a secret under a new name with the given owners.
    ///
    /// Returns `None` when the source does not exist; any stale destination
    /// is removed in that case.
    async fn sync_secret(
        &self,
        source_namespace: &str,
        source_name: &str,
        target_namespace: &str,
        target_name: &str,
        owner_refs: &[OwnerReference],
    ) -> Result<(Option<Secret>, bool)>;
}
