//! The observed `RisingWave` plus a draft of its status that the reconcile steps write into.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use snafu::{OptionExt, ResultExt, Snafu};
use stackable_operator::{
    client::Client,
    k8s_openapi::{apimachinery::pkg::apis::meta::v1::Time, chrono::Utc},
    kube::{Api, ResourceExt, api::PostParams},
};
use tracing::debug;

use crate::{
    crd::{
        Component, ComponentReplicasStatus, ConditionStatus, ConditionType, NodeGroup, RisingWave,
        RisingWaveCondition, RisingWaveStatus, image_version,
    },
    event::ClusterEvent,
};

pub const UNHEALTHY_MESSAGE_PREFIX: &str = "Found components broken or missing: ";

pub fn unhealthy_message(missing: &[String]) -> String {
    format!("{UNHEALTHY_MESSAGE_PREFIX}{}", missing.join(","))
}

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("object defines no namespace"))]
    ObjectHasNoNamespace,

    #[snafu(display("failed to serialize the status of {name}"))]
    SerializeStatus {
        source: serde_json::Error,
        name: String,
    },

    #[snafu(display("failed to update the status of {name}"))]
    ReplaceStatus {
        source: stackable_operator::kube::Error,
        name: String,
    },
}

pub struct RisingWaveManager {
    observed: RisingWave,
    draft: RwLock<RisingWave>,
    open_kruise_available: bool,
}

impl RisingWaveManager {
    pub fn new(observed: &RisingWave, open_kruise_available: bool) -> Self {
        Self {
            observed: observed.clone(),
            draft: RwLock::new(observed.clone()),
            open_kruise_available,
        }
    }

    /// The object as it was fetched. Never changes during a reconcile.
    pub fn observed(&self) -> &RisingWave {
        &self.observed
    }

    /// A copy of the object including all status changes made so far.
    pub fn draft(&self) -> RisingWave {
        self.draft.read().clone()
    }

    pub fn draft_status(&self) -> RisingWaveStatus {
        self.draft.read().status.clone().unwrap_or_default()
    }

    pub fn is_observed_generation_outdated(&self) -> bool {
        self.observed.observed_generation() < self.observed.generation()
    }

    pub fn get_condition(&self, type_: ConditionType) -> Option<&RisingWaveCondition> {
        self.observed.conditions().iter().find(|c| c.type_ == type_)
    }

    pub fn does_condition_exist_and_equal(&self, type_: ConditionType, value: bool) -> bool {
        self.get_condition(type_)
            .is_some_and(|c| (c.status == ConditionStatus::True) == value)
    }

    pub fn is_open_kruise_available(&self) -> bool {
        self.open_kruise_available
    }

    pub fn is_open_kruise_enabled(&self) -> bool {
        self.open_kruise_available && self.observed.is_open_kruise_requested()
    }

    pub fn is_standalone_mode_enabled(&self) -> bool {
        self.observed.spec.enable_standalone_mode.unwrap_or(false)
    }

    pub fn is_advertising_with_ip(&self) -> bool {
        self.observed.spec.enable_advertising_with_ip.unwrap_or(false)
    }

    pub fn node_groups(&self, component: Component) -> Vec<NodeGroup> {
        self.observed.spec.node_groups(component)
    }

    pub fn node_group(&self, component: Component, group: &str) -> Option<NodeGroup> {
        self.observed.spec.node_group(component, group)
    }

    pub fn state_store_root(&self) -> Option<&str> {
        self.observed.spec.state_store.root()
    }

    /// Upserts a condition into the draft. The transition time is reset when the observed
    /// object has no such condition or its status differs.
    pub fn update_condition(&self, condition: RisingWaveCondition) {
        self.update_condition_at(condition, Time(Utc::now()));
    }

    fn update_condition_at(&self, mut condition: RisingWaveCondition, now: Time) {
        condition.last_transition_time = match self.get_condition(condition.type_) {
            Some(observed) if observed.status == condition.status => {
                observed.last_transition_time.clone()
            }
            _ => Some(now),
        };

        self.update_status(|status| {
            match status
                .conditions
                .iter_mut()
                .find(|c| c.type_ == condition.type_)
            {
                Some(existing) => *existing = condition,
                None => status.conditions.push(condition),
            }
        });
    }

    pub fn remove_condition(&self, type_: ConditionType) {
        self.update_status(|status| status.conditions.retain(|c| c.type_ != type_));
    }

    pub fn update_status(&self, f: impl FnOnce(&mut RisingWaveStatus)) {
        let mut draft = self.draft.write();
        f(draft.status.get_or_insert_with(Default::default));
    }

    /// Sets the conditions every reconcile starts from: a fresh cluster is initializing, a
    /// running one whose spec moved on is upgrading. Returns the event to publish, if any.
    pub fn begin_reconcile(&self) -> Option<(ClusterEvent, String)> {
        if self.observed.conditions().is_empty() {
            self.update_condition(RisingWaveCondition::new(
                ConditionType::Initializing,
                ConditionStatus::True,
            ));
            self.update_condition(RisingWaveCondition::new(
                ConditionType::Running,
                ConditionStatus::False,
            ));
            Some((ClusterEvent::Initializing, "Initializing".to_string()))
        } else if self.does_condition_exist_and_equal(ConditionType::Running, true)
            && self.is_observed_generation_outdated()
        {
            self.update_condition(RisingWaveCondition::new(
                ConditionType::Upgrading,
                ConditionStatus::True,
            ));
            Some((
                ClusterEvent::Upgrading,
                format!("Upgrading to generation {}", self.observed.generation()),
            ))
        } else {
            None
        }
    }

    /// Records the replicas observed once every workload is rolled out and derives the
    /// `Running` condition from the children found missing. Returns the event for a flip of
    /// `Running`, if any.
    pub fn update_health(
        &self,
        replicas: BTreeMap<Component, ComponentReplicasStatus>,
        missing: &[String],
    ) -> Option<(ClusterEvent, String)> {
        let spec = &self.observed.spec;
        let healthy = missing.is_empty();
        self.update_status(|status| {
            status.meta_store.backend = spec.meta_store.backend_type();
            status.state_store.backend = spec.state_store.backend_type();
            for (component, replicas) in replicas {
                *status.component_replicas.get_mut(component) = replicas;
            }
            if healthy {
                status.version = Some(image_version(&spec.image));
            }
        });

        let was_running = self.does_condition_exist_and_equal(ConditionType::Running, true);
        if healthy {
            self.update_condition(RisingWaveCondition::new(
                ConditionType::Running,
                ConditionStatus::True,
            ));
            self.remove_condition(ConditionType::Initializing);
            let upgrading = self
                .draft_status()
                .conditions
                .iter()
                .any(|c| c.type_ == ConditionType::Upgrading);
            if upgrading {
                self.update_condition(RisingWaveCondition::new(
                    ConditionType::Upgrading,
                    ConditionStatus::False,
                ));
            }
            (!was_running).then(|| (ClusterEvent::Running, "Running".to_string()))
        } else {
            let message = unhealthy_message(missing);
            self.update_condition(
                RisingWaveCondition::new(ConditionType::Running, ConditionStatus::False)
                    .with_message("Unhealthy", &message),
            );
            was_running.then_some((ClusterEvent::Unhealthy, message))
        }
    }

    pub fn sync_observed_generation(&self) {
        let generation = self.observed.generation();
        self.update_status(|status| status.observed_generation = Some(generation));
    }

    pub fn is_status_changed(&self) -> bool {
        let draft = self.draft.read();
        draft.status.clone().unwrap_or_default() != self.observed.status.clone().unwrap_or_default()
    }

    /// Writes the draft status through the status subresource unless it equals the observed
    /// one. Returns whether a write happened.
    pub async fn push(&self, client: &Client) -> Result<bool, Error> {
        if !self.is_status_changed() {
            return Ok(false);
        }

        let name = self.observed.name_any();
        let namespace = self
            .observed
            .namespace()
            .context(ObjectHasNoNamespaceSnafu)?;
        let body = serde_json::to_vec(&self.draft()).context(SerializeStatusSnafu {
            name: name.clone(),
        })?;

        debug!(risingwave = %name, "updating status");
        Api::<RisingWave>::namespaced(client.as_kube_client(), &namespace)
            .replace_status(&name, &PostParams::default(), body)
            .await
            .context(ReplaceStatusSnafu { name })?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use stackable_operator::k8s_openapi::chrono::{TimeZone, Utc};

    use super::*;

    fn manager(input: &str) -> RisingWaveManager {
        let rw: RisingWave = serde_yaml::from_str(input).expect("illegal test input");
        RisingWaveManager::new(&rw, true)
    }

    const RUNNING: &str = indoc! {"
        apiVersion: risingwave.risingwavelabs.com/v1alpha1
        kind: RisingWave
        metadata:
          name: rw
          namespace: default
          generation: 2
        spec:
          enableOpenKruise: true
          stateStore:
            gcs:
              bucket: b
              root: /data
              credentials:
                useWorkloadIdentity: true
        status:
          observedGeneration: 1
          conditions:
            - type: Running
              status: 'True'
              lastTransitionTime: 2024-01-01T00:00:00Z
    "};

    fn time(secs: i64) -> Time {
        Time(Utc.timestamp_opt(secs, 0).unwrap())
    }

    #[test]
    fn test_readers() {
        let mgr = manager(RUNNING);
        assert!(mgr.is_observed_generation_outdated());
        assert!(mgr.is_open_kruise_enabled());
        assert!(!mgr.is_standalone_mode_enabled());
        assert!(mgr.does_condition_exist_and_equal(ConditionType::Running, true));
        assert!(!mgr.does_condition_exist_and_equal(ConditionType::Initializing, false));
        assert_eq!(mgr.state_store_root(), Some("/data"));
    }

    #[test]
    fn test_update_condition_keeps_transition_time() {
        let mgr = manager(RUNNING);
        let observed_time = mgr
            .get_condition(ConditionType::Running)
            .and_then(|c| c.last_transition_time.clone());

        mgr.update_condition_at(
            RisingWaveCondition::new(ConditionType::Running, ConditionStatus::True)
                .with_message("Running", "all good"),
            time(100),
        );
        let status = mgr.draft_status();
        assert_eq!(status.conditions.len(), 1);
        assert_eq!(status.conditions[0].last_transition_time, observed_time);
        assert_eq!(status.conditions[0].message.as_deref(), Some("all good"));
    }

    #[test]
    fn test_update_condition_compares_against_observed() {
        let mgr = manager(RUNNING);

        mgr.update_condition_at(
            RisingWaveCondition::new(ConditionType::Running, ConditionStatus::False),
            time(100),
        );
        // Flipping back in the same reconcile still counts as unchanged.
        mgr.update_condition_at(
            RisingWaveCondition::new(ConditionType::Running, ConditionStatus::True),
            time(200),
        );
        assert_eq!(
            mgr.draft_status().conditions[0].last_transition_time,
            mgr.get_condition(ConditionType::Running)
                .and_then(|c| c.last_transition_time.clone())
        );

        mgr.update_condition_at(
            RisingWaveCondition::new(ConditionType::Upgrading, ConditionStatus::True),
            time(300),
        );
        let status = mgr.draft_status();
        assert_eq!(status.conditions.len(), 2);
        assert_eq!(status.conditions[1].last_transition_time, Some(time(300)));
    }

    #[test]
    fn test_unhealthy_message() {
        assert_eq!(
            unhealthy_message(&["Service(meta)".to_string(), "Deployments(frontend)".to_string()]),
            "Found components broken or missing: Service(meta),Deployments(frontend)"
        );
    }

    #[test]
    fn test_begin_reconcile_of_settled_cluster() {
        let mut rw: RisingWave = serde_yaml::from_str(RUNNING).expect("illegal test input");
        rw.status.as_mut().unwrap().observed_generation = Some(2);
        let mgr = RisingWaveManager::new(&rw, true);

        assert_eq!(mgr.begin_reconcile(), None);
        assert!(!mgr.is_status_changed());
    }

    #[test]
    fn test_status_change_detection() {
        let mgr = manager(RUNNING);
        assert!(!mgr.is_status_changed());

        mgr.remove_condition(ConditionType::Initializing);
        assert!(!mgr.is_status_changed());

        mgr.sync_observed_generation();
        assert!(mgr.is_status_changed());
        assert_eq!(mgr.draft_status().observed_generation, Some(2));
        assert_eq!(mgr.observed().observed_generation(), 1);

        mgr.remove_condition(ConditionType::Running);
        assert!(mgr.draft_status().conditions.is_empty());
    }
}
