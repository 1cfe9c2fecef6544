//! Uniform access to the four workload kinds a node group can run as.

use stackable_operator::{
    k8s_openapi::api::apps::v1::{Deployment, StatefulSet},
    kube::ResourceExt,
};

use crate::crd::{
    LABEL_RISINGWAVE_GROUP,
    external::{AdvancedStatefulSet, CloneSet, WorkloadCondition},
};

/// The replica counters every workload kind reports, normalized to plain numbers.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RolloutStatus {
    pub generation: i64,
    pub observed_generation: i64,
    pub spec_replicas: Option<i32>,
    pub replicas: i32,
    pub updated_replicas: i32,
    pub available_replicas: i32,
    pub ready_replicas: i32,
}

impl RolloutStatus {
    /// The controller has seen the latest spec and every replica runs the latest revision
    /// and is available.
    pub fn is_rolled_out(&self) -> bool {
        if self.observed_generation < self.generation {
            return false;
        }
        if self
            .spec_replicas
            .is_some_and(|replicas| self.updated_replicas < replicas)
        {
            return false;
        }
        self.replicas <= self.updated_replicas && self.available_replicas >= self.updated_replicas
    }
}

pub trait Workload: ResourceExt {
    fn rollout_status(&self) -> RolloutStatus;

    /// Whether a condition of the workload reports a failure that blocks the rollout.
    fn has_failure_condition(&self) -> bool;

    fn is_rolled_out(&self) -> bool {
        !self.has_failure_condition() && self.rollout_status().is_rolled_out()
    }

    fn ready_replicas(&self) -> i32 {
        self.rollout_status().ready_replicas
    }

    /// The node group the workload belongs to. Objects without the label belong to the
    /// default group.
    fn group(&self) -> String {
        self.labels()
            .get(LABEL_RISINGWAVE_GROUP)
            .cloned()
            .unwrap_or_default()
    }
}

impl Workload for Deployment {
    fn rollout_status(&self) -> RolloutStatus {
        let status = self.status.clone().unwrap_or_default();
        RolloutStatus {
            generation: self.metadata.generation.unwrap_or(0),
            observed_generation: status.observed_generation.unwrap_or(0),
            spec_replicas: self.spec.as_ref().and_then(|spec| spec.replicas),
            replicas: status.replicas.unwrap_or(0),
            updated_replicas: status.updated_replicas.unwrap_or(0),
            available_replicas: status.available_replicas.unwrap_or(0),
            ready_replicas: status.ready_replicas.unwrap_or(0),
        }
    }

    fn has_failure_condition(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|status| status.conditions.as_ref())
            .is_some_and(|conditions| {
                conditions.iter().any(|c| {
                    c.type_ == "Progressing"
                        && c.reason.as_deref() == Some("ProgressDeadlineExceeded")
                })
            })
    }
}

impl Workload for StatefulSet {
    fn rollout_status(&self) -> RolloutStatus {
        let status = self.status.clone().unwrap_or_default();
        RolloutStatus {
            generation: self.metadata.generation.unwrap_or(0),
            observed_generation: status.observed_generation.unwrap_or(0),
            spec_replicas: self.spec.as_ref().and_then(|spec| spec.replicas),
            replicas: status.replicas,
            updated_replicas: status.updated_replicas.unwrap_or(0),
            available_replicas: status.available_replicas.unwrap_or(0),
            ready_replicas: status.ready_replicas.unwrap_or(0),
        }
    }

    fn has_failure_condition(&self) -> bool {
        false
    }
}

fn any_condition(conditions: &[WorkloadCondition], types: &[&str]) -> bool {
    conditions.iter().any(|c| types.contains(&c.type_.as_str()))
}

impl Workload for CloneSet {
    fn rollout_status(&self) -> RolloutStatus {
        let status = self.status.clone().unwrap_or_default();
        RolloutStatus {
            generation: self.metadata.generation.unwrap_or(0),
            observed_generation: status.observed_generation,
            spec_replicas: self.spec.replicas,
            replicas: status.replicas,
            updated_replicas: status.updated_replicas,
            available_replicas: status.available_replicas,
            ready_replicas: status.ready_replicas,
        }
    }

    fn has_failure_condition(&self) -> bool {
        self.status.as_ref().is_some_and(|status| {
            any_condition(&status.conditions, &["FailedUpdate", "FailedScale"])
        })
    }
}

impl Workload for AdvancedStatefulSet {
    fn rollout_status(&self) -> RolloutStatus {
        let status = self.status.clone().unwrap_or_default();
        RolloutStatus {
            generation: self.metadata.generation.unwrap_or(0),
            observed_generation: status.observed_generation,
            spec_replicas: self.spec.replicas,
            replicas: status.replicas,
            updated_replicas: status.updated_replicas,
            available_replicas: status.available_replicas,
            ready_replicas: status.ready_replicas,
        }
    }

    fn has_failure_condition(&self) -> bool {
        self.status.as_ref().is_some_and(|status| {
            any_condition(&status.conditions, &["FailedCreatePod", "FailedUpdatePod"])
        })
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use rstest::rstest;

    use super::*;

    fn deployment(input: &str) -> Deployment {
        serde_yaml::from_str(input).expect("illegal test input")
    }

    #[rstest]
    // observed generation lags behind
    #[case(RolloutStatus { generation: 2, observed_generation: 1, ..Default::default() }, false)]
    #[case(RolloutStatus { generation: 1, observed_generation: 1, ..Default::default() }, true)]
    // not every replica updated yet
    #[case(RolloutStatus {
        generation: 1, observed_generation: 1, spec_replicas: Some(3),
        replicas: 3, updated_replicas: 2, available_replicas: 2, ready_replicas: 2,
    }, false)]
    // old replicas still around
    #[case(RolloutStatus {
        generation: 1, observed_generation: 1, spec_replicas: Some(2),
        replicas: 3, updated_replicas: 2, available_replicas: 2, ready_replicas: 3,
    }, false)]
    // updated but not available
    #[case(RolloutStatus {
        generation: 1, observed_generation: 1, spec_replicas: Some(2),
        replicas: 2, updated_replicas: 2, available_replicas: 1, ready_replicas: 1,
    }, false)]
    #[case(RolloutStatus {
        generation: 4, observed_generation: 5, spec_replicas: Some(2),
        replicas: 2, updated_replicas: 2, available_replicas: 2, ready_replicas: 2,
    }, true)]
    fn test_is_rolled_out(#[case] status: RolloutStatus, #[case] expected: bool) {
        assert_eq!(status.is_rolled_out(), expected);
    }

    #[test]
    fn test_deployment_progress_deadline() {
        let mut deploy = deployment(indoc! {"
            apiVersion: apps/v1
            kind: Deployment
            metadata:
              name: rw-frontend
              generation: 1
              labels:
                risingwave/group: blue
            spec:
              replicas: 1
              selector: {}
              template: {}
            status:
              observedGeneration: 1
              replicas: 1
              updatedReplicas: 1
              availableReplicas: 1
              readyReplicas: 1
        "});
        assert!(deploy.is_rolled_out());
        assert_eq!(deploy.ready_replicas(), 1);
        assert_eq!(deploy.group(), "blue");

        deploy.status.as_mut().unwrap().conditions = Some(vec![serde_yaml::from_str(indoc! {"
            type: Progressing
            status: 'False'
            reason: ProgressDeadlineExceeded
        "})
        .unwrap()]);
        assert!(!deploy.is_rolled_out());
    }

    #[test]
    fn test_clone_set_failure_conditions() {
        let clone_set: CloneSet = serde_yaml::from_str(indoc! {"
            apiVersion: apps.kruise.io/v1alpha1
            kind: CloneSet
            metadata:
              name: rw-frontend
              generation: 1
            spec:
              replicas: 1
              selector: {}
              template: {}
            status:
              observedGeneration: 1
              replicas: 1
              updatedReplicas: 1
              availableReplicas: 1
              readyReplicas: 1
              conditions:
                - type: FailedScale
                  status: 'True'
        "})
        .expect("illegal test input");
        assert!(clone_set.rollout_status().is_rolled_out());
        assert!(!clone_set.is_rolled_out());
        assert_eq!(clone_set.group(), "");
    }
}
