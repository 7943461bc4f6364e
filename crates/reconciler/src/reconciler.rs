//! Revision controller: decides when a new revision is needed, creates it and
//! records the outcome in the operator status.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::config::ControllerConfig;
use crate::error::{Error, Result};
use crate::queue::WorkQueue;
use crate::recorder::EventRecorder;
use crate::status::{advance_revision_fn, update_condition_fn, update_status};
use crate::store::{ConfigStore, OperatorClient};
use crate::types::{
    ConditionStatus, ConfigMap, ManagementState, OperatorCondition, OperatorStatus,
    OwnerReference, REVISION_STATUS_PREFIX, ResourceKind, revision_name,
};

/// Condition type the controller reports its health under.
pub const REVISION_CONTROLLER_FAILING: &str = "RevisionControllerFailing";

/// The only key that ever enters the work queue.
pub const WORK_QUEUE_KEY: &str = "key";

/// Condition reason used when a revision could not be materialized.
pub const CONTENT_CREATION_ERROR: &str = "ContentCreationError";

/// Condition reason used for any other failed pass.
pub const SYNC_ERROR: &str = "Error";

pub(crate) const CONTROLLER_NAME: &str = "RevisionController";

/// Whether a recorded revision still matches the live sources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevisionFreshness {
    /// Every snapshot equals its source.
    Current,
    /// The first mismatch found.
    Stale { reason: String },
}

impl RevisionFreshness {
    fn stale(reason: impl Into<String>) -> Self {
        Self::Stale {
            reason: reason.into(),
        }
    }

    #[must_use]
    pub const fn is_current(&self) -> bool {
        matches!(self, Self::Current)
    }

    /// Why the revision is stale; empty when current.
    #[must_use]
    pub fn reason(&self) -> &str {
        match self {
            Self::Current => "",
            Self::Stale { reason } => reason,
        }
    }
}

/// What a managed pass did about revisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevisionOutcome {
    /// The latest revision is current; nothing was written.
    Current,
    /// A new revision was created and recorded.
    Created { revision: u32 },
    /// Creating the next revision failed. The failure is already recorded in
    /// the failing condition; the pass must be retried.
    CreationFailed { revision: u32, error: Error },
}

enum Lookup<T> {
    Found(T),
    Missing(String),
}

fn lookup<T>(result: Result<T>) -> Result<Lookup<T>> {
    match result {
        Ok(value) => Ok(Lookup::Found(value)),
        Err(e) if e.is_not_found() => Ok(Lookup::Missing(e.to_string())),
        Err(e) => Err(e),
    }
}

/// Watches a fixed set of config maps and secrets and keeps numbered
/// snapshots of them.
///
/// When a source no longer matches its snapshot for the latest revision, the
/// revision counter in the operator status is increased and every source is
/// copied under `<name>-<revision>`.
pub struct RevisionController {
    pub(crate) target_namespace: String,
    /// Copied first to last. The first one conventionally carries the
    /// workload manifest.
    pub(crate) config_maps: Vec<String>,
    pub(crate) secrets: Vec<String>,
    pub(crate) workers: usize,

    pub(crate) operator_client: Arc<dyn OperatorClient>,
    pub(crate) config_store: Arc<dyn ConfigStore>,
    pub(crate) recorder: Arc<dyn EventRecorder>,

    /// Only ever holds [`WORK_QUEUE_KEY`]; used for its backoff handling.
    pub(crate) queue: WorkQueue<&'static str>,
}

impl RevisionController {
    /// Create a controller for the sources named in `config`.
    pub fn new(
        config: &ControllerConfig,
        operator_client: Arc<dyn OperatorClient>,
        config_store: Arc<dyn ConfigStore>,
        recorder: Arc<dyn EventRecorder>,
    ) -> Self {
        Self {
            target_namespace: config.target_namespace.clone(),
            config_maps: config.config_maps.clone(),
            secrets: config.secrets.clone(),
            workers: config.workers,
            operator_client,
            config_store,
            recorder,
            queue: WorkQueue::new(CONTROLLER_NAME, config.backoff.policy()),
        }
    }

    /// Run one reconciliation pass.
    ///
    /// # Errors
    ///
    /// Any error means the pass must be retried:
    /// [`Error::SyntheticRequeue`] when revision creation failed but the
    /// failure was recorded, the condition update error when recording the
    /// outcome failed, otherwise the store error that stopped the pass.
    #[instrument(skip_all, fields(namespace = %self.target_namespace))]
    pub async fn sync(&self) -> Result<()> {
        let (spec, status, _) = self.operator_client.get().await?;

        match spec.management_state {
            ManagementState::Unmanaged => {
                debug!("Operator is unmanaged, skipping");
                return Ok(());
            }
            ManagementState::Removed => {
                // Static workload managers cannot be removed. Whether this
                // should fail instead is still open.
                debug!("Operator is removed, skipping");
                return Ok(());
            }
            ManagementState::Managed => {}
        }

        let outcome = self.create_revision_if_needed(&status).await;

        let condition = match &outcome {
            Ok(RevisionOutcome::Current | RevisionOutcome::Created { .. }) => {
                OperatorCondition::new(REVISION_CONTROLLER_FAILING, ConditionStatus::False)
            }
            Ok(RevisionOutcome::CreationFailed { error, .. }) => {
                content_creation_failed(error)
            }
            Err(e) => OperatorCondition::new(REVISION_CONTROLLER_FAILING, ConditionStatus::True)
                .with_reason(SYNC_ERROR)
                .with_message(e.to_string()),
        };

        let result = match outcome {
            Ok(RevisionOutcome::CreationFailed { .. }) => Err(Error::SyntheticRequeue),
            Ok(_) => Ok(()),
            Err(e) => Err(e),
        };

        if let Err(update_error) =
            update_status(self.operator_client.as_ref(), &[update_condition_fn(condition)]).await
        {
            if result.is_ok() {
                return Err(update_error);
            }
            warn!(error = %update_error, "Failed to record failing condition");
        }

        result
    }

    /// Create the next revision when the latest one no longer matches the
    /// live sources.
    ///
    /// A creation failure is recorded in the failing condition and reported
    /// as [`RevisionOutcome::CreationFailed`].
    ///
    /// # Errors
    ///
    /// Store errors while deciding, status update errors (these take
    /// priority over a creation failure), and [`Error::RevisionOverflow`].
    pub async fn create_revision_if_needed(
        &self,
        status: &OperatorStatus,
    ) -> Result<RevisionOutcome> {
        let latest = status.latest_available_revision;
        let reason = match self.is_latest_revision_current(latest).await? {
            RevisionFreshness::Current => return Ok(RevisionOutcome::Current),
            RevisionFreshness::Stale { reason } => reason,
        };

        let next = latest
            .checked_add(1)
            .ok_or(Error::RevisionOverflow { revision: latest })?;
        info!(revision = next, reason = %reason, "New revision triggered");

        if let Err(error) = self.create_new_revision(next).await {
            warn!(revision = next, error = %error, "Revision creation failed");
            self.recorder.warning(
                "RevisionCreateFailed",
                &format!("Failed to create revision {next}: {error}"),
            );
            update_status(
                self.operator_client.as_ref(),
                &[update_condition_fn(content_creation_failed(&error))],
            )
            .await?;
            return Ok(RevisionOutcome::CreationFailed {
                revision: next,
                error,
            });
        }

        let cleared = OperatorCondition::new(REVISION_CONTROLLER_FAILING, ConditionStatus::False);
        let (_, updated) = update_status(
            self.operator_client.as_ref(),
            &[update_condition_fn(cleared), advance_revision_fn(latest, next)],
        )
        .await?;

        if updated {
            self.recorder.event(
                "RevisionCreate",
                &format!("Revision {next} created because {reason}"),
            );
        }

        Ok(RevisionOutcome::Created { revision: next })
    }

    /// Compare every source with its copy for `revision`.
    ///
    /// Config maps are checked before secrets, each in declared order, and
    /// the first mismatch is returned.
    ///
    /// # Errors
    ///
    /// Store errors other than not-found; a missing source or copy makes
    /// the revision stale instead.
    pub async fn is_latest_revision_current(&self, revision: u32) -> Result<RevisionFreshness> {
        let ns = self.target_namespace.as_str();
        let store = self.config_store.as_ref();

        for name in &self.config_maps {
            let required = match lookup(store.get_config_map(ns, name).await)? {
                Lookup::Found(cm) => cm,
                Lookup::Missing(reason) => return Ok(RevisionFreshness::stale(reason)),
            };
            let existing = match lookup(
                store
                    .get_config_map(ns, &revision_name(name, revision))
                    .await,
            )? {
                Lookup::Found(cm) => cm,
                Lookup::Missing(reason) => return Ok(RevisionFreshness::stale(reason)),
            };
            if !existing.content_eq(&required) {
                return Ok(RevisionFreshness::stale(format!(
                    "{}/{name} has changed",
                    ResourceKind::ConfigMap.short_name()
                )));
            }
        }

        for name in &self.secrets {
            let required = match lookup(store.get_secret(ns, name).await)? {
                Lookup::Found(secret) => secret,
                Lookup::Missing(reason) => return Ok(RevisionFreshness::stale(reason)),
            };
            let existing = match lookup(store.get_secret(ns, &revision_name(name, revision)).await)? {
                Lookup::Found(secret) => secret,
                Lookup::Missing(reason) => return Ok(RevisionFreshness::stale(reason)),
            };
            if !existing.content_eq(&required) {
                return Ok(RevisionFreshness::stale(format!(
                    "{}/{name} has changed",
                    ResourceKind::Secret.short_name()
                )));
            }
        }

        Ok(RevisionFreshness::Current)
    }

    /// Materialize `revision`: the marker first, then a copy of every config
    /// map and secret owned by it.
    ///
    /// Copies made before a failure stay in place; names are derived from
    /// the revision, so a retry re-applies them.
    ///
    /// # Errors
    ///
    /// Store errors, and [`Error::NotFound`] naming a source that vanished.
    pub async fn create_new_revision(&self, revision: u32) -> Result<()> {
        let ns = self.target_namespace.as_str();
        let store = self.config_store.as_ref();

        let marker = ConfigMap::new(ns, revision_name(REVISION_STATUS_PREFIX, revision))
            .with_data("status", "InProgress")
            .with_data("revision", revision.to_string());
        let (marker, _) = store.apply_config_map(marker).await?;

        let owner_refs = [OwnerReference {
            api_version: "v1".to_string(),
            kind: ResourceKind::ConfigMap.kind().to_string(),
            name: marker.metadata.name,
            uid: marker.metadata.uid,
        }];

        for name in &self.config_maps {
            let (copy, _) = store
                .sync_config_map(ns, name, ns, &revision_name(name, revision), &owner_refs)
                .await?;
            if copy.is_none() {
                return Err(Error::not_found(ResourceKind::ConfigMap, ns, name));
            }
        }

        for name in &self.secrets {
            let (copy, _) = store
                .sync_secret(ns, name, ns, &revision_name(name, revision), &owner_refs)
                .await?;
            if copy.is_none() {
                return Err(Error::not_found(ResourceKind::Secret, ns, name));
            }
        }

        debug!(revision, "Revision content created");
        Ok(())
    }
}

fn content_creation_failed(error: &Error) -> OperatorCondition {
    OperatorCondition::new(REVISION_CONTROLLER_FAILING, ConditionStatus::True)
        .with_reason(CONTENT_CREATION_ERROR)
        .with_message(error.to_string())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use super::*;
    use crate::memory::{InMemoryConfigStore, InMemoryOperatorClient};
    use crate::recorder::InMemoryEventRecorder;
    use crate::status::find_condition;
    use crate::types::{OperatorSpec, Secret};

    const NS: &str = "target";

    struct Fixture {
        controller: RevisionController,
        client: Arc<InMemoryOperatorClient>,
        store: Arc<InMemoryConfigStore>,
        recorder: Arc<InMemoryEventRecorder>,
    }

    fn setup(config_maps: &[&str], secrets: &[&str]) -> Fixture {
        let config = ControllerConfig::new(NS)
            .with_config_maps(config_maps.iter().copied())
            .with_secrets(secrets.iter().copied());
        let client = Arc::new(InMemoryOperatorClient::new());
        let store = Arc::new(InMemoryConfigStore::new());
        let recorder = Arc::new(InMemoryEventRecorder::new());
        let controller = RevisionController::new(
            &config,
            client.clone(),
            store.clone(),
            recorder.clone(),
        );
        Fixture {
            controller,
            client,
            store,
            recorder,
        }
    }

    async fn failing_condition(client: &InMemoryOperatorClient) -> Option<OperatorCondition> {
        find_condition(&client.status().await.conditions, REVISION_CONTROLLER_FAILING).cloned()
    }

    #[tokio::test]
    async fn test_missing_snapshot_is_stale() {
        let f = setup(&["config"], &[]);
        f.store
            .put_config_map(ConfigMap::new(NS, "config").with_data("a", "1"))
            .await;

        let freshness = f.controller.is_latest_revision_current(0).await.unwrap();
        assert!(!freshness.is_current());
        assert!(freshness.reason().contains("not found"));
        assert!(freshness.reason().contains("config-0"));
    }

    #[tokio::test]
    async fn test_missing_source_is_stale() {
        let f = setup(&["config"], &[]);
        let freshness = f.controller.is_latest_revision_current(1).await.unwrap();
        assert_eq!(
            freshness,
            RevisionFreshness::stale(
                "configmaps \"config\" not found in namespace \"target\""
            )
        );
    }

    #[tokio::test]
    async fn test_first_mismatch_wins() {
        let f = setup(&["a", "b"], &["s"]);
        for name in ["a", "b"] {
            f.store
                .put_config_map(ConfigMap::new(NS, name).with_data("k", "live"))
                .await;
            f.store
                .put_config_map(ConfigMap::new(NS, revision_name(name, 1)).with_data("k", "old"))
                .await;
        }

        let freshness = f.controller.is_latest_revision_current(1).await.unwrap();
        assert_eq!(freshness.reason(), "configmap/a has changed");
    }

    #[tokio::test]
    async fn test_changed_secret_is_reported() {
        let f = setup(&["config"], &["cert"]);
        f.store
            .put_config_map(ConfigMap::new(NS, "config").with_data("a", "1"))
            .await;
        f.store
            .put_config_map(ConfigMap::new(NS, "config-1").with_data("a", "1"))
            .await;
        f.store
            .put_secret(Secret::new(NS, "cert").with_data("k", b"new".to_vec()))
            .await;
        f.store
            .put_secret(Secret::new(NS, "cert-1").with_data("k", b"old".to_vec()))
            .await;

        let freshness = f.controller.is_latest_revision_current(1).await.unwrap();
        assert_eq!(freshness.reason(), "secret/cert has changed");
    }

    #[tokio::test]
    async fn test_create_new_revision_writes_marker_first_and_owns_copies() {
        let f = setup(&["config"], &["cert"]);
        f.store
            .put_config_map(ConfigMap::new(NS, "config").with_data("a", "1"))
            .await;
        f.store
            .put_secret(Secret::new(NS, "cert").with_data("k", b"v".to_vec()))
            .await;

        f.controller.create_new_revision(1).await.unwrap();

        let marker = f.store.get_config_map(NS, "revision-status-1").await.unwrap();
        assert_eq!(marker.data.get("status").map(String::as_str), Some("InProgress"));
        assert_eq!(marker.data.get("revision").map(String::as_str), Some("1"));

        let copy = f.store.get_config_map(NS, "config-1").await.unwrap();
        let secret_copy = f.store.get_secret(NS, "cert-1").await.unwrap();
        for owners in [
            &copy.metadata.owner_references,
            &secret_copy.metadata.owner_references,
        ] {
            assert_eq!(owners.len(), 1);
            assert_eq!(owners.first().map(|o| o.uid.as_str()), Some(marker.metadata.uid.as_str()));
            assert_eq!(owners.first().map(|o| o.kind.as_str()), Some("ConfigMap"));
        }
    }

    #[tokio::test]
    async fn test_create_new_revision_is_idempotent() {
        let f = setup(&["config"], &[]);
        f.store
            .put_config_map(ConfigMap::new(NS, "config").with_data("a", "1"))
            .await;

        f.controller.create_new_revision(1).await.unwrap();
        let writes = f.store.writes();
        f.controller.create_new_revision(1).await.unwrap();

        assert_eq!(f.store.writes(), writes);
        assert_eq!(
            f.store.config_map_names(NS).await,
            vec!["config", "config-1", "revision-status-1"]
        );
    }

    #[tokio::test]
    async fn test_unmanaged_does_nothing() {
        let f = setup(&["config"], &[]);
        f.client
            .set_spec(OperatorSpec {
                management_state: ManagementState::Unmanaged,
            })
            .await;

        f.controller.sync().await.unwrap();

        assert_eq!(f.client.status_writes(), 0);
        assert_eq!(f.store.writes(), 0);
    }

    #[tokio::test]
    async fn test_removed_is_a_no_op() {
        let f = setup(&["config"], &[]);
        f.client
            .set_spec(OperatorSpec {
                management_state: ManagementState::Removed,
            })
            .await;

        assert!(f.controller.sync().await.is_ok());
        assert_eq!(f.client.status_writes(), 0);
    }

    #[tokio::test]
    async fn test_sync_creates_first_revision() {
        let f = setup(&["config"], &[]);
        f.store
            .put_config_map(ConfigMap::new(NS, "config").with_data("a", "1"))
            .await;

        f.controller.sync().await.unwrap();

        let status = f.client.status().await;
        assert_eq!(status.latest_available_revision, 1);
        assert_eq!(
            failing_condition(&f.client).await.map(|c| c.status),
            Some(ConditionStatus::False)
        );
        let created = f.recorder.with_reason("RevisionCreate");
        assert_eq!(created.len(), 1);
        assert!(created.first().is_some_and(|e| e.message.starts_with("Revision 1 created because")));
    }

    #[tokio::test]
    async fn test_sync_records_creation_failure_and_requeues() {
        let f = setup(&["config"], &["cert"]);
        f.store
            .put_config_map(ConfigMap::new(NS, "config").with_data("a", "1"))
            .await;

        let err = f.controller.sync().await.unwrap_err();
        assert_eq!(err, Error::SyntheticRequeue);

        assert_eq!(f.client.status().await.latest_available_revision, 0);
        let condition = failing_condition(&f.client).await.unwrap();
        assert_eq!(condition.status, ConditionStatus::True);
        assert_eq!(condition.reason, CONTENT_CREATION_ERROR);
        assert!(condition.message.contains("secrets \"cert\" not found"));
        assert_eq!(f.recorder.with_reason("RevisionCreateFailed").len(), 1);
    }

    #[tokio::test]
    async fn test_revision_overflow_is_reported_as_error() {
        let config = ControllerConfig::new(NS).with_config_maps(["config"]);
        let status = OperatorStatus {
            latest_available_revision: u32::MAX,
            conditions: Vec::new(),
        };
        let client = Arc::new(InMemoryOperatorClient::with_state(
            OperatorSpec::default(),
            status,
        ));
        let store = Arc::new(InMemoryConfigStore::new());
        let controller = RevisionController::new(
            &config,
            client.clone(),
            store,
            Arc::new(InMemoryEventRecorder::new()),
        );

        let err = controller.sync().await.unwrap_err();
        assert!(matches!(err, Error::RevisionOverflow { .. }));

        let condition = failing_condition(&client).await.unwrap();
        assert_eq!(condition.reason, SYNC_ERROR);
    }
}
