//! Ref-counted remote shares of read-only layers.
//!
//! Workloads in one hosting system that use the same read-only layer share a
//! single remote share. Only the first acquire adds the share and only the last
//! release removes it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strata_common::{HostingSystemId, LayerGuid, StrataError, StrataResult};
use tokio::sync::{Mutex, MutexGuard};

use crate::control::{ControlPlane, ModifyRequest, ShareFlags, ShareSettings};

/// A share exposed in the hosting system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareEntry {
    /// Host folder behind the share.
    pub host_path: PathBuf,
    /// Workloads currently using the share. Never zero while tracked.
    pub ref_count: usize,
}

/// Share identifier to entry.
pub type ShareTable = BTreeMap<LayerGuid, ShareEntry>;

/// Tracks the remote shares of one hosting system.
#[derive(Debug)]
pub struct ShareRegistry {
    hosting_system: HostingSystemId,
    control: Arc<dyn ControlPlane>,
    table: Mutex<ShareTable>,
}

impl ShareRegistry {
    /// Create an empty registry.
    pub fn new(hosting_system: HostingSystemId, control: Arc<dyn ControlPlane>) -> Self {
        Self {
            hosting_system,
            control,
            table: Mutex::new(ShareTable::new()),
        }
    }

    /// Lock the registry for a sequence of operations.
    pub async fn lock(&self) -> LockedShares<'_> {
        LockedShares {
            registry: self,
            table: self.table.lock().await,
        }
    }

    /// Take a reference on the share for `id`, adding it if this is the first.
    ///
    /// # Errors
    ///
    /// See [`LockedShares::acquire`].
    pub async fn acquire(&self, id: LayerGuid, host_path: &Path) -> StrataResult<usize> {
        self.lock().await.acquire(id, host_path).await
    }

    /// Drop a reference on the share for `id`, removing it if this was the last.
    ///
    /// # Errors
    ///
    /// See [`LockedShares::release`].
    pub async fn release(&self, id: LayerGuid) -> StrataResult<usize> {
        self.lock().await.release(id).await
    }

    /// Release every share in `ids`, logging failures instead of stopping.
    ///
    /// Used to undo the shares a failing mount acquired. Takes the lock itself, so
    /// it must not be called while a [`LockedShares`] from this registry is alive.
    pub async fn release_on_failure(&self, ids: &[LayerGuid]) {
        if ids.is_empty() {
            return;
        }

        let mut shares = self.lock().await;
        for id in ids {
            if let Err(e) = shares.release(*id).await {
                tracing::warn!(
                    hosting_system = %self.hosting_system,
                    share = %id,
                    error = %e,
                    "Possibly leaked share on error removal path"
                );
            }
        }
    }

    /// Current reference count of `id`, if it is tracked.
    pub async fn ref_count(&self, id: &LayerGuid) -> Option<usize> {
        self.table.lock().await.get(id).map(|entry| entry.ref_count)
    }

    /// Copy of the current table.
    pub async fn table(&self) -> ShareTable {
        self.table.lock().await.clone()
    }
}

/// Exclusive access to a [`ShareRegistry`]'s table.
///
/// Every method here runs with the registry lock already held.
#[derive(Debug)]
pub struct LockedShares<'a> {
    registry: &'a ShareRegistry,
    table: MutexGuard<'a, ShareTable>,
}

impl LockedShares<'_> {
    /// Take a reference on the share for `id`; returns the new count.
    ///
    /// The share is added to the environment only when `id` is not yet tracked.
    ///
    /// # Errors
    ///
    /// Returns the control plane's error if adding the share fails. Nothing is
    /// recorded in that case.
    pub async fn acquire(&mut self, id: LayerGuid, host_path: &Path) -> StrataResult<usize> {
        if let Some(entry) = self.table.get_mut(&id) {
            entry.ref_count += 1;
            tracing::debug!(
                hosting_system = %self.registry.hosting_system,
                share = %id,
                layer = %host_path.display(),
                ref_count = entry.ref_count,
                "Share already present"
            );
            return Ok(entry.ref_count);
        }

        let request = ModifyRequest::AddShare(ShareSettings {
            name: id,
            path: host_path.to_path_buf(),
            flags: ShareFlags::read_only_layer(),
        });
        self.registry.control.modify(&request).await?;

        self.table.insert(
            id,
            ShareEntry {
                host_path: host_path.to_path_buf(),
                ref_count: 1,
            },
        );
        tracing::debug!(
            hosting_system = %self.registry.hosting_system,
            share = %id,
            layer = %host_path.display(),
            "Added share"
        );
        Ok(1)
    }

    /// Drop a reference on the share for `id`; returns the remaining count.
    ///
    /// At zero the entry is forgotten and the share removed from the environment.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::NotRegistered`] if `id` is not tracked, or the control
    /// plane's error if removing the share fails. The entry is forgotten even then.
    pub async fn release(&mut self, id: LayerGuid) -> StrataResult<usize> {
        let Some(entry) = self.table.get_mut(&id) else {
            return Err(StrataError::NotRegistered {
                id: id.to_string(),
                hosting_system: self.registry.hosting_system.to_string(),
            });
        };

        entry.ref_count -= 1;
        if entry.ref_count > 0 {
            tracing::debug!(
                hosting_system = %self.registry.hosting_system,
                share = %id,
                ref_count = entry.ref_count,
                "Share still in use"
            );
            return Ok(entry.ref_count);
        }

        self.table.remove(&id);
        self.registry
            .control
            .modify(&ModifyRequest::RemoveShare { name: id })
            .await?;

        tracing::debug!(
            hosting_system = %self.registry.hosting_system,
            share = %id,
            "Removed share"
        );
        Ok(0)
    }

    /// Current reference count of `id`, if it is tracked.
    #[must_use]
    pub fn ref_count(&self, id: &LayerGuid) -> Option<usize> {
        self.table.get(id).map(|entry| entry.ref_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{RecordingControlPlane, RequestType, ResourceKind};
    use proptest::prelude::*;

    fn registry() -> (Arc<RecordingControlPlane>, ShareRegistry) {
        let control = Arc::new(RecordingControlPlane::new("uvm"));
        let registry = ShareRegistry::new(HostingSystemId::new("uvm").unwrap(), control.clone());
        (control, registry)
    }

    fn adds(control: &RecordingControlPlane) -> usize {
        control.count(ResourceKind::RemoteShare, RequestType::Add)
    }

    fn removes(control: &RecordingControlPlane) -> usize {
        control.count(ResourceKind::RemoteShare, RequestType::Remove)
    }

    #[tokio::test]
    async fn first_acquire_adds_and_last_release_removes() {
        let (control, registry) = registry();
        let id = LayerGuid::derive("ro1");
        let path = Path::new("/layers/ro1");

        assert_eq!(registry.acquire(id, path).await.unwrap(), 1);
        assert_eq!(registry.acquire(id, path).await.unwrap(), 2);
        assert_eq!(adds(&control), 1);

        assert_eq!(registry.release(id).await.unwrap(), 1);
        assert_eq!(removes(&control), 0);
        assert_eq!(registry.ref_count(&id).await, Some(1));

        assert_eq!(registry.release(id).await.unwrap(), 0);
        assert_eq!(removes(&control), 1);
        assert_eq!(registry.ref_count(&id).await, None);
    }

    #[tokio::test]
    async fn release_of_unknown_share_is_not_registered() {
        let (control, registry) = registry();
        let err = registry.release(LayerGuid::derive("ghost")).await.unwrap_err();
        assert!(matches!(err, StrataError::NotRegistered { .. }));
        assert!(control.attempts().is_empty());
    }

    #[tokio::test]
    async fn failed_add_records_nothing() {
        let (control, registry) = registry();
        control.fail_on(ResourceKind::RemoteShare, RequestType::Add);

        let id = LayerGuid::derive("ro1");
        assert!(registry.acquire(id, Path::new("/layers/ro1")).await.is_err());
        assert!(registry.table().await.is_empty());
    }

    #[tokio::test]
    async fn failed_remove_still_forgets_share() {
        let (control, registry) = registry();
        let id = LayerGuid::derive("ro1");
        registry.acquire(id, Path::new("/layers/ro1")).await.unwrap();
        control.fail_on(ResourceKind::RemoteShare, RequestType::Remove);

        let err = registry.release(id).await.unwrap_err();
        assert!(matches!(err, StrataError::ControlPlane { .. }));
        assert!(registry.table().await.is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn rollback_continues_past_failures() {
        let (control, registry) = registry();
        let ids: Vec<LayerGuid> = ["a", "b", "c"].iter().map(|n| LayerGuid::derive(n)).collect();
        for (id, name) in ids.iter().zip(["a", "b", "c"]) {
            registry.acquire(*id, Path::new(name)).await.unwrap();
        }

        let failing = ids[0];
        control.fail_when(move |request| {
            matches!(request, ModifyRequest::RemoveShare { name } if *name == failing)
        });
        registry.release_on_failure(&ids).await;

        assert!(registry.table().await.is_empty());
        assert_eq!(removes(&control), 2);
    }

    #[tokio::test]
    async fn locked_sequence_sees_consistent_counts() {
        let (_, registry) = registry();
        let id = LayerGuid::derive("base");

        let mut shares = registry.lock().await;
        shares.acquire(id, Path::new("/layers/base")).await.unwrap();
        shares.acquire(id, Path::new("/layers/base")).await.unwrap();
        assert_eq!(shares.ref_count(&id), Some(2));
        drop(shares);

        assert_eq!(registry.ref_count(&id).await, Some(2));
    }

    proptest! {
        #[test]
        fn ref_count_tracks_acquires_minus_releases(ops in proptest::collection::vec(any::<bool>(), 0..40)) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            runtime.block_on(async {
                let (control, registry) = registry();
                let id = LayerGuid::derive("layer-x");
                let path = Path::new("/layers/layer-x");
                let mut expected = 0usize;

                for acquire in ops {
                    if acquire {
                        registry.acquire(id, path).await.unwrap();
                        expected += 1;
                    } else if expected == 0 {
                        let err = registry.release(id).await.unwrap_err();
                        assert!(matches!(err, StrataError::NotRegistered { .. }));
                    } else {
                        registry.release(id).await.unwrap();
                        expected -= 1;
                    }

                    let tracked = registry.ref_count(&id).await;
                    assert_eq!(tracked, (expected > 0).then_some(expected));
                }

                // Each add is paired with at most one remove, and a share that is
                // still tracked has exactly one more add than removes.
                let (added, removed) = (adds(&control), removes(&control));
                assert_eq!(added - removed, usize::from(expected > 0));
            });
        }
    }
}
