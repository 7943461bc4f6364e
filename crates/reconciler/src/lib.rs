//! Revision controller for static workloads.
//!
//! Keeps numbered, immutable snapshots of a fixed set of config maps and
//! secrets. Whenever a live source differs from its copy for the latest
//! revision, the next revision is created:
//!
//! 1. A `revision-status-<n>` marker config map is applied.
//! 2. Every source is copied under `<name>-<n>`, owned by the marker.
//! 3. The operator status is advanced to `latestAvailableRevision = n`.
//!
//! Health is reported through the `RevisionControllerFailing` condition.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use revision_reconciler::{
//!     ControllerConfig, EventSources, InMemoryConfigStore, InMemoryOperatorClient,
//!     RevisionController, TracingEventRecorder, stop_signal,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ControllerConfig::new("openshift-kube-apiserver")
//!         .with_config_maps(["pod", "config"]);
//!     let client = Arc::new(InMemoryOperatorClient::new());
//!     let store = Arc::new(InMemoryConfigStore::new());
//!
//!     let sources = EventSources {
//!         operator: client.subscribe(),
//!         config_maps: store.subscribe_config_maps(),
//!         secrets: store.subscribe_secrets(),
//!     };
//!     let controller = Arc::new(RevisionController::new(
//!         &config,
//!         client,
//!         store,
//!         Arc::new(TracingEventRecorder::new("revision-controller")),
//!     ));
//!
//!     let (stopper, stop_rx) = stop_signal();
//!     // stopper.stop() ends the loop
//!     controller.run(sources, stop_rx).await;
//! }
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod config;
pub mod error;
pub mod r#loop;
pub mod memory;
pub mod queue;
pub mod reconciler;
pub mod recorder;
pub mod status;
pub mod store;
pub mod types;

// Re-export main types
pub use config::{BackoffConfig, ControllerConfig};
pub use error::{Error, Result};
pub use memory::{InMemoryConfigStore, InMemoryOperatorClient};
pub use r#loop::{EventSources, LoopStopper, stop_signal};
pub use queue::{BackoffPolicy, WorkQueue};
pub use reconciler::{
    CONTENT_CREATION_ERROR, REVISION_CONTROLLER_FAILING, RevisionController, RevisionFreshness,
    RevisionOutcome, SYNC_ERROR, WORK_QUEUE_KEY,
};
pub use recorder::{EventRecorder, EventType, InMemoryEventRecorder, RecordedEvent, TracingEventRecorder};
pub use store::{ConfigStore, OperatorClient};
pub use types::{
    ConditionStatus, ConfigMap, ManagementState, Notification, ObjectKey, ObjectMeta,
    OperatorCondition, OperatorSpec, OperatorStatus, OwnerReference, ResourceKind, Secret,
};
