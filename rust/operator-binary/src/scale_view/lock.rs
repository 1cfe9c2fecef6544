use snafu::{ResultExt, Snafu, ensure};

use crate::{
    crd::{GroupLock, RisingWave, RisingWaveScaleView, RisingWaveStatus, ScaleViewLock},
    scale_view::split::{self, split_replicas},
};

#[derive(Snafu, Debug, PartialEq, Eq)]
pub enum Error {
    #[snafu(display("a lock named {name:?} is held by another scale view (uid {uid})"))]
    OwnedByOther { name: String, uid: String },

    #[snafu(display("lock of scale view {name:?} is already grabbed"))]
    AlreadyGrabbed { name: String },

    #[snafu(display("group {group:?} of {component} is already locked by scale view {holder:?}"))]
    GroupLocked {
        group: String,
        component: String,
        holder: String,
    },

    #[snafu(display("failed to split the replicas of scale view {name:?}"))]
    SplitReplicas { source: split::Error, name: String },
}

/// Grabs, refreshes and releases the lock records a scale view keeps on the status of its
/// target. Changes are made in memory only, persisting them is up to the caller.
pub struct ScaleViewLockManager<'a> {
    status: &'a mut RisingWaveStatus,
}

impl<'a> ScaleViewLockManager<'a> {
    pub fn new(risingwave: &'a mut RisingWave) -> Self {
        Self {
            status: risingwave.status.get_or_insert_with(Default::default),
        }
    }

    pub fn get_lock(&self, scale_view: &RisingWaveScaleView) -> Option<&ScaleViewLock> {
        let name = scale_view.metadata.name.as_deref().unwrap_or_default();
        self.status
            .scale_views
            .iter()
            .find(|lock| lock.name == name && lock.uid == scale_view.uid())
    }

    pub fn is_locked(&self, scale_view: &RisingWaveScaleView) -> bool {
        self.get_lock(scale_view).is_some()
    }

    pub fn grab_lock(&mut self, scale_view: &RisingWaveScaleView) -> Result<(), Error> {
        let name = scale_view.metadata.name.clone().unwrap_or_default();
        let uid = scale_view.uid();
        let component = scale_view.spec.target_ref.component;

        for lock in &self.status.scale_views {
            if lock.name == name {
                ensure!(
                    lock.uid == uid,
                    OwnedByOtherSnafu {
                        name: name.clone(),
                        uid: lock.uid.clone()
                    }
                );
                return AlreadyGrabbedSnafu { name }.fail();
            }

            if lock.component != component {
                continue;
            }
            if let Some(group) = lock
                .group_locks
                .iter()
                .find(|g| scale_view.groups().any(|group| group == g.name))
            {
                return GroupLockedSnafu {
                    group: group.name.clone(),
                    component: component.to_string(),
                    holder: lock.name.clone(),
                }
                .fail();
            }
        }

        let group_locks = group_locks(scale_view)?;
        self.status.scale_views.push(ScaleViewLock {
            name,
            uid: uid.to_string(),
            component,
            generation: scale_view.generation(),
            group_locks,
        });
        Ok(())
    }

    /// Grabs the lock if it is not held yet, or refreshes it when the scale view has a newer
    /// generation. Returns whether the lock record changed.
    pub fn grab_or_update(&mut self, scale_view: &RisingWaveScaleView) -> Result<bool, Error> {
        let name = scale_view.metadata.name.as_deref().unwrap_or_default();
        let uid = scale_view.uid();
        let Some(index) = self
            .status
            .scale_views
            .iter()
            .position(|lock| lock.name == name && lock.uid == uid)
        else {
            self.grab_lock(scale_view)?;
            return Ok(true);
        };

        if self.status.scale_views[index].generation == scale_view.generation() {
            return Ok(false);
        }

        let group_locks = group_locks(scale_view)?;
        let lock = &mut self.status.scale_views[index];
        lock.group_locks = group_locks;
        lock.generation = scale_view.generation();
        Ok(true)
    }

    /// Removes the lock of the scale view. Returns whether there was one.
    pub fn release_lock(&mut self, scale_view: &RisingWaveScaleView) -> bool {
        let name = scale_view.metadata.name.as_deref().unwrap_or_default();
        let uid = scale_view.uid();
        let before = self.status.scale_views.len();
        self.status
            .scale_views
            .retain(|lock| !(lock.name == name && lock.uid == uid));
        self.status.scale_views.len() != before
    }
}

fn group_locks(scale_view: &RisingWaveScaleView) -> Result<Vec<GroupLock>, Error> {
    let split = split_replicas(&scale_view.spec).context(SplitReplicasSnafu {
        name: scale_view.metadata.name.clone().unwrap_or_default(),
    })?;
    Ok(split
        .into_iter()
        .map(|(name, replicas)| GroupLock { name, replicas })
        .collect())
}
