use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use stackable_operator::{
    k8s_openapi::{
        api::{
            apps::v1::StatefulSetPersistentVolumeClaimRetentionPolicy,
            core::v1::{
                Affinity, Container, EnvFromSource, EnvVar, LocalObjectReference,
                PersistentVolumeClaim, PodSecurityContext, ResourceRequirements, SecurityContext,
                Toleration, Volume, VolumeMount,
            },
        },
        apimachinery::pkg::{apis::meta::v1::Time, util::intstr::IntOrString},
    },
    schemars::{self, JsonSchema},
    utils::crds::{raw_object_list_schema, raw_object_schema},
};
use strum::Display;

/// Labels and annotations a user may attach to generated objects.
#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialObjectMeta {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl PartialObjectMeta {
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty() && self.annotations.is_empty()
    }
}

#[derive(
    Clone, Copy, Debug, Default, Deserialize, Display, Eq, JsonSchema, PartialEq, Serialize,
)]
pub enum UpgradeStrategyType {
    /// Kill all existing pods before creating new ones.
    Recreate,

    /// Replace the old pods by new ones using rolling update.
    #[default]
    RollingUpdate,

    /// Update pods in place when only the image or metadata changed, recreate them otherwise.
    /// Requires OpenKruise.
    InPlaceIfPossible,

    /// Update pods in place only, never recreate them. Requires OpenKruise.
    InPlaceOnly,
}

impl UpgradeStrategyType {
    pub fn is_in_place(&self) -> bool {
        matches!(
            self,
            UpgradeStrategyType::InPlaceIfPossible | UpgradeStrategyType::InPlaceOnly
        )
    }
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RollingUpdate {
    /// The maximum number of pods that can be unavailable during the update.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<IntOrString>,

    /// Pods with an ordinal lower than the partition (or the given percentage of the replicas)
    /// are not updated. Only honored by the OpenKruise workloads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<IntOrString>,

    /// The maximum number of pods that can be scheduled above the desired number of pods.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_surge: Option<IntOrString>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InPlaceUpdateStrategy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grace_period_seconds: Option<i32>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeStrategy {
    #[serde(rename = "type", default)]
    pub type_: UpgradeStrategyType,

    /// Only allowed when the type is not `Recreate`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rolling_update: Option<RollingUpdate>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_place_update_strategy: Option<InPlaceUpdateStrategy>,
}

/// A reference to a key of a `ConfigMap` holding the configuration file.
#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMapSource {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub key: String,

    /// Whether a missing `ConfigMap` or key is tolerated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optional: Option<bool>,
}

impl ConfigMapSource {
    pub fn is_optional(&self) -> bool {
        self.optional.unwrap_or(false)
    }
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfiguration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map: Option<ConfigMapSource>,
}

/// The part of a pod spec users may customize per node group. The container is always the
/// single RisingWave container.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePodTemplateSpec {
    /// Overrides `spec.image` for this group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(schema_with = "raw_object_list_schema")]
    pub env: Vec<EnvVar>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(schema_with = "raw_object_list_schema")]
    pub env_from: Vec<EnvFromSource>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "raw_object_schema")]
    pub resources: Option<ResourceRequirements>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(schema_with = "raw_object_list_schema")]
    pub volume_mounts: Vec<VolumeMount>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "raw_object_schema")]
    pub security_context: Option<SecurityContext>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(schema_with = "raw_object_list_schema")]
    pub volumes: Vec<Volume>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "raw_object_schema")]
    pub affinity: Option<Affinity>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(schema_with = "raw_object_list_schema")]
    pub tolerations: Vec<Toleration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "raw_object_schema")]
    pub pod_security_context: Option<PodSecurityContext>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(schema_with = "raw_object_list_schema")]
    pub image_pull_secrets: Vec<LocalObjectReference>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_grace_period_seconds: Option<i64>,

    /// Sidecars added next to the RisingWave container.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(schema_with = "raw_object_list_schema")]
    pub additional_containers: Vec<Container>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePodTemplate {
    #[serde(default)]
    pub metadata: PartialObjectMeta,

    #[serde(default)]
    pub spec: NodePodTemplateSpec,
}

/// A named shard of a component with its own replica count and pod template.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeGroup {
    /// Unique within the component. The empty name is the default group.
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub replicas: i32,

    /// Changing this timestamp restarts all pods of the group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_at: Option<Time>,

    /// Overrides the cluster wide configuration for this group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration: Option<NodeConfiguration>,

    #[serde(default)]
    pub upgrade_strategy: UpgradeStrategy,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub min_ready_seconds: i32,

    /// Only honored for the compute component.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(schema_with = "raw_object_list_schema")]
    pub volume_claim_templates: Vec<PersistentVolumeClaim>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "raw_object_schema")]
    pub persistent_volume_claim_retention_policy:
        Option<StatefulSetPersistentVolumeClaimRetentionPolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_deadline_seconds: Option<i32>,

    /// Name of a `RisingWavePodTemplate` in the same namespace used as the base of the pod
    /// template. `template` is applied on top of it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_template: Option<String>,

    #[serde(default)]
    pub template: NodePodTemplate,
}

fn is_zero(v: &i32) -> bool {
    *v == 0
}

/// Per component ports. Zero means the default port of the component.
#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentPorts {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub service: i32,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub metrics: i32,

    /// Only used by meta.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub dashboard: i32,
}

/// The v1alpha1 shape of a group. Converted to a [`NodeGroup`] on admission, and on the fly
/// when reconciling objects that have not been converted yet.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyComponentGroup {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub replicas: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_template: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade_strategy: Option<UpgradeStrategy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "raw_object_schema")]
    pub resources: Option<ResourceRequirements>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(schema_with = "raw_object_list_schema")]
    pub env: Vec<EnvVar>,

    /// Compute only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(schema_with = "raw_object_list_schema")]
    pub volume_mounts: Vec<VolumeMount>,
}
