//! In-memory backends.
//!
//! Used by the local-mode binary and by tests. Each store publishes a
//! [`Notification`] on every write so it can double as a watched source.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::{RwLock, broadcast};
use tracing::debug;
use ulid::Ulid;

use crate::error::{Error, Result};
use crate::store::{ConfigStore, OperatorClient};
use crate::types::{
    ConfigMap, ObjectKey, ObjectMeta, Notification, OperatorSpec, OperatorStatus, OwnerReference,
    ResourceKind, Secret,
};

const CHANNEL_CAPACITY: usize = 256;

/// Name under which the operator object is reported in notifications.
pub const OPERATOR_OBJECT_NAME: &str = "cluster";

struct OperatorRecord {
    spec: OperatorSpec,
    status: OperatorStatus,
    resource_version: u64,
}

/// In-memory [`OperatorClient`] with compare-and-swap status writes.
pub struct InMemoryOperatorClient {
    record: RwLock<OperatorRecord>,
    status_writes: AtomicUsize,
    events: broadcast::Sender<Notification>,
}

impl Default for InMemoryOperatorClient {
    fn default() -> Self {
        Self::with_state(OperatorSpec::default(), OperatorStatus::default())
    }
}

impl InMemoryOperatorClient {
    /// Create a managed operator with an empty status.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an operator with the given spec and status.
    pub fn with_state(spec: OperatorSpec, status: OperatorStatus) -> Self {
        let (events, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            record: RwLock::new(OperatorRecord {
                spec,
                status,
                resource_version: 1,
            }),
            status_writes: AtomicUsize::new(0),
            events,
        }
    }

    /// Subscribe to changes of the operator object.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.events.subscribe()
    }

    /// Replace the spec, as an external writer would.
    pub async fn set_spec(&self, spec: OperatorSpec) {
        let mut record = self.record.write().await;
        record.spec = spec;
        record.resource_version = record.resource_version.saturating_add(1);
        self.notify();
    }

    /// Bump the resource version without changing content, as a concurrent
    /// writer touching the object would.
    pub async fn touch(&self) {
        let mut record = self.record.write().await;
        record.resource_version = record.resource_version.saturating_add(1);
        self.notify();
    }

    /// Current status.
    pub async fn status(&self) -> OperatorStatus {
        self.record.read().await.status.clone()
    }

    /// Number of successful status writes.
    pub fn status_writes(&self) -> usize {
        self.status_writes.load(Ordering::Relaxed)
    }

    fn notify(&self) {
        let key = ObjectKey::new("", OPERATOR_OBJECT_NAME);
        let _ = self.events.send(Notification::Updated(key));
    }
}

#[async_trait]
impl OperatorClient for InMemoryOperatorClient {
    async fn get(&self) -> Result<(OperatorSpec, OperatorStatus, String)> {
        let record = self.record.read().await;
        Ok((
            record.spec.clone(),
            record.status.clone(),
            record.resource_version.to_string(),
        ))
    }

    async fn update_status(
        &self,
        resource_version: &str,
        status: OperatorStatus,
    ) -> Result<OperatorStatus> {
        let mut record = self.record.write().await;
        let current = record.resource_version.to_string();
        if current != resource_version {
            return Err(Error::conflict(OPERATOR_OBJECT_NAME, resource_version, current));
        }

        record.status = status;
        record.resource_version = record.resource_version.saturating_add(1);
        self.status_writes.fetch_add(1, Ordering::Relaxed);
        self.notify();

        Ok(record.status.clone())
    }
}

type ObjectMap<T> = BTreeMap<(String, String), T>;

fn object_key(namespace: &str, name: &str) -> (String, String) {
    (namespace.to_string(), name.to_string())
}

/// In-memory [`ConfigStore`].
pub struct InMemoryConfigStore {
    config_maps: RwLock<ObjectMap<ConfigMap>>,
    secrets: RwLock<ObjectMap<Secret>>,
    next_version: AtomicU64,
    writes: AtomicUsize,
    config_map_events: broadcast::Sender<Notification>,
    secret_events: broadcast::Sender<Notification>,
}

impl Default for InMemoryConfigStore {
    fn default() -> Self {
        let (config_map_events, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (secret_events, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            config_maps: RwLock::new(BTreeMap::new()),
            secrets: RwLock::new(BTreeMap::new()),
            next_version: AtomicU64::new(1),
            writes: AtomicUsize::new(0),
            config_map_events,
            secret_events,
        }
    }
}

impl InMemoryConfigStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to config map changes.
    pub fn subscribe_config_maps(&self) -> broadcast::Receiver<Notification> {
        self.config_map_events.subscribe()
    }

    /// Subscribe to secret changes.
    pub fn subscribe_secrets(&self) -> broadcast::Receiver<Notification> {
        self.secret_events.subscribe()
    }

    /// Number of create, update and delete operations performed so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    /// Write a config map unconditionally, as an external owner would.
    pub async fn put_config_map(&self, config_map: ConfigMap) -> ConfigMap {
        let mut maps = self.config_maps.write().await;
        let key = object_key(&config_map.metadata.namespace, &config_map.metadata.name);
        let existing = maps.get(&key).map(|cm| cm.metadata.clone());
        let stored = ConfigMap {
            metadata: self.next_meta(config_map.metadata, existing.as_ref()),
            ..config_map
        };
        maps.insert(key, stored.clone());
        self.record_write(ResourceKind::ConfigMap, &stored.metadata, existing.is_some());
        stored
    }

    /// Write a secret unconditionally, as an external owner would.
    pub async fn put_secret(&self, secret: Secret) -> Secret {
        let mut secrets = self.secrets.write().await;
        let key = object_key(&secret.metadata.namespace, &secret.metadata.name);
        let existing = secrets.get(&key).map(|s| s.metadata.clone());
        let stored = Secret {
            metadata: self.next_meta(secret.metadata, existing.as_ref()),
            ..secret
        };
        secrets.insert(key, stored.clone());
        self.record_write(ResourceKind::Secret, &stored.metadata, existing.is_some());
        stored
    }

    /// Delete a config map. Returns whether it existed.
    pub async fn delete_config_map(&self, namespace: &str, name: &str) -> bool {
        let removed = self
            .config_maps
            .write()
            .await
            .remove(&object_key(namespace, name));
        if let Some(cm) = &removed {
            self.record_delete(ResourceKind::ConfigMap, &cm.metadata);
        }
        removed.is_some()
    }

    /// Delete a secret. Returns whether it existed.
    pub async fn delete_secret(&self, namespace: &str, name: &str) -> bool {
        let removed = self.secrets.write().await.remove(&object_key(namespace, name));
        if let Some(secret) = &removed {
            self.record_delete(ResourceKind::Secret, &secret.metadata);
        }
        removed.is_some()
    }

    /// Names of all config maps in a namespace, sorted.
    pub async fn config_map_names(&self, namespace: &str) -> Vec<String> {
        self.config_maps
            .read()
            .await
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, name)| name.clone())
            .collect()
    }

    /// Names of all secrets in a namespace, sorted.
    pub async fn secret_names(&self, namespace: &str) -> Vec<String> {
        self.secrets
            .read()
            .await
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, name)| name.clone())
            .collect()
    }

    /// Create the secret, or update it when content or owners differ.
    pub async fn apply_secret(&self, secret: Secret) -> (Secret, bool) {
        let mut secrets = self.secrets.write().await;
        let key = object_key(&secret.metadata.namespace, &secret.metadata.name);

        if let Some(existing) = secrets.get(&key) {
            if existing.content_eq(&secret)
                && existing.metadata.owner_references == secret.metadata.owner_references
            {
                return (existing.clone(), false);
            }
        }

        let existing = secrets.get(&key).map(|s| s.metadata.clone());
        let stored = Secret {
            metadata: self.next_meta(secret.metadata, existing.as_ref()),
            ..secret
        };
        secrets.insert(key, stored.clone());
        self.record_write(ResourceKind::Secret, &stored.metadata, existing.is_some());
        (stored, true)
    }

    /// Metadata for a write: keeps the uid of an existing object, assigns a
    /// fresh one otherwise, and always moves the resource version.
    fn next_meta(&self, mut meta: ObjectMeta, existing: Option<&ObjectMeta>) -> ObjectMeta {
        meta.uid = existing.map_or_else(|| Ulid::new().to_string(), |e| e.uid.clone());
        meta.resource_version = self.next_version.fetch_add(1, Ordering::Relaxed).to_string();
        meta
    }

    fn record_write(&self, kind: ResourceKind, meta: &ObjectMeta, updated: bool) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let key = ObjectKey::new(&meta.namespace, &meta.name);
        debug!(kind = %kind, object = %key, updated, "Stored object");
        let notification = if updated {
            Notification::Updated(key)
        } else {
            Notification::Added(key)
        };
        let _ = self.sender(kind).send(notification);
    }

    fn record_delete(&self, kind: ResourceKind, meta: &ObjectMeta) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let key = ObjectKey::new(&meta.namespace, &meta.name);
        debug!(kind = %kind, object = %key, "Deleted object");
        let _ = self.sender(kind).send(Notification::Deleted(key));
    }

    const fn sender(&self, kind: ResourceKind) -> &broadcast::Sender<Notification> {
        match kind {
            ResourceKind::ConfigMap => &self.config_map_events,
            ResourceKind::Secret => &self.secret_events,
        }
    }
}

#[async_trait]
impl ConfigStore for InMemoryConfigStore {
    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap> {
        self.config_maps
            .read()
            .await
            .get(&object_key(namespace, name))
            .cloned()
            .ok_or_else(|| Error::not_found(ResourceKind::ConfigMap, namespace, name))
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret> {
        self.secrets
            .read()
            .await
            .get(&object_key(namespace, name))
            .cloned()
            .ok_or_else(|| Error::not_found(ResourceKind::Secret, namespace, name))
    }

    async fn apply_config_map(&self, config_map: ConfigMap) -> Result<(ConfigMap, bool)> {
        let mut maps = self.config_maps.write().await;
        let key = object_key(&config_map.metadata.namespace, &config_map.metadata.name);

        if let Some(existing) = maps.get(&key) {
            if existing.content_eq(&config_map)
                && existing.metadata.owner_references == config_map.metadata.owner_references
            {
                return Ok((existing.clone(), false));
            }
        }

        let existing = maps.get(&key).map(|cm| cm.metadata.clone());
        let stored = ConfigMap {
            metadata: self.next_meta(config_map.metadata, existing.as_ref()),
            ..config_map
        };
        maps.insert(key, stored.clone());
        self.record_write(ResourceKind::ConfigMap, &stored.metadata, existing.is_some());
        Ok((stored, true))
    }

    async fn sync_config_map(
        &self,
        source_namespace: &str,
        source_name: &str,
        target_namespace: &str,
        target_name: &str,
        owner_refs: &[OwnerReference],
    ) -> Result<(Option<ConfigMap>, bool)> {
        let source = match self.get_config_map(source_namespace, source_name).await {
            Ok(source) => source,
            Err(e) if e.is_not_found() => {
                let deleted = self.delete_config_map(target_namespace, target_name).await;
                return Ok((None, deleted));
            }
            Err(e) => return Err(e),
        };

        let mut metadata = ObjectMeta::new(target_namespace, target_name);
        metadata.owner_references = owner_refs.to_vec();
        let target = ConfigMap {
            metadata,
            data: source.data,
            binary_data: source.binary_data,
        };

        let (stored, modified) = self.apply_config_map(target).await?;
        Ok((Some(stored), modified))
    }

    async fn sync_secret(
        &self,
        source_namespace: &str,
        source_name: &str,
        target_namespace: &str,
        target_name: &str,
        owner_refs: &[OwnerReference],
    ) -> Result<(Option<Secret>, bool)> {
        let source = match self.get_secret(source_namespace, source_name).await {
            Ok(source) => source,
            Err(e) if e.is_not_found() => {
                let deleted = self.delete_secret(target_namespace, target_name).await;
                return Ok((None, deleted));
            }
            Err(e) => return Err(e),
        };

        let mut metadata = ObjectMeta::new(target_namespace, target_name);
        metadata.owner_references = owner_refs.to_vec();
        let target = Secret {
            metadata,
            data: source.data,
        };

        let (stored, modified) = self.apply_secret(target).await;
        Ok((Some(stored), modified))
    }
}
