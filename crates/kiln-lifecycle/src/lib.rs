//! kiln-lifecycle — components, builds, and executions.
//!
//! Three managers share one [`StateStore`](kiln_state::StateStore) and one
//! [`ContainerRuntime`](kiln_runtime::ContainerRuntime), both passed in at
//! construction:
//!
//! ```text
//! ComponentRegistry  add / look up components, read their specifications
//! BuildManager       component → image, tagged `<ns>/<id>:<n>` and `:latest`
//! ExecutionManager   build → started container with mounts and env
//! ```
//!
//! # Build serialization
//!
//! At most one build per component runs at a time. The locks belong to the
//! [`StateStore`](kiln_state::StateStore) handle, so every manager built on
//! it (or its clones) shares them; an on-disk store adds a lock file per
//! component that also excludes other handles and processes on the same
//! state directory. Builds of different components run in parallel.
//!
//! # Partial failure
//!
//! Nothing is rolled back in the runtime. If an image or container was
//! created but its row could not be written, the call fails and the error's
//! [`resource_id`](LifecycleError::resource_id) names what was left behind.

pub mod build;
pub mod error;
pub mod execution;
pub mod registry;

pub use build::BuildManager;
pub use error::{ErrorKind, LifecycleError, LifecycleResult};
pub use execution::ExecutionManager;
pub use registry::ComponentRegistry;

use std::time::{SystemTime, UNIX_EPOCH};

pub(crate) fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
