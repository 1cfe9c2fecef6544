use serde::{Deserialize, Serialize};
use stackable_operator::{
    k8s_openapi::{
        api::core::v1::{EnvVar, ResourceRequirements},
        apimachinery::pkg::apis::meta::v1::Time,
    },
    kube::CustomResource,
    schemars::{self, JsonSchema},
    utils::crds::{raw_object_list_schema, raw_object_schema},
};
use strum::{Display, EnumString};

use crate::crd::{
    Component,
    node_group::{
        ComponentPorts, LegacyComponentGroup, NodeConfiguration, NodeGroup, NodePodTemplate,
        NodePodTemplateSpec, PartialObjectMeta, UpgradeStrategy,
    },
    store::{MetaStoreBackend, MetaStoreBackendType, StateStoreBackend, StateStoreBackendType},
};

/// A RisingWave cluster. The operator creates the services, the config object and one
/// workload per node group of every component.
#[derive(Clone, CustomResource, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "risingwave.risingwavelabs.com",
    version = "v1alpha1",
    kind = "RisingWave",
    plural = "risingwaves",
    shortname = "rw",
    status = "RisingWaveStatus",
    namespaced,
    crates(
        kube_core = "stackable_operator::kube::core",
        k8s_openapi = "stackable_operator::k8s_openapi",
        schemars = "stackable_operator::schemars"
    ),
    printcolumn = r#"{"name":"RUNNING","type":"string","jsonPath":".status.conditions[?(@.type=='Running')].status"}"#,
    printcolumn = r#"{"name":"VERSION","type":"string","jsonPath":".status.version"}"#,
    printcolumn = r#"{"name":"AGE","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RisingWaveSpec {
    /// Image of the RisingWave containers, unless overridden by a node group.
    #[serde(default)]
    pub image: String,

    /// Use the OpenKruise workloads (CloneSet and Advanced StatefulSet) instead of
    /// Deployments and StatefulSets. Requires the operator to run with OpenKruise support.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_open_kruise: Option<bool>,

    /// Create a ServiceMonitor for the cluster if the Prometheus operator is installed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_default_service_monitor: Option<bool>,

    /// Run meta, frontend, compute and compactor in a single process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_standalone_mode: Option<bool>,

    /// Advertise the pod IP instead of the pod's DNS name to peers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_advertising_with_ip: Option<bool>,

    #[serde(default)]
    pub meta_store: MetaStoreBackend,

    #[serde(default)]
    pub state_store: StateStoreBackend,

    #[serde(default)]
    pub frontend_service_type: FrontendServiceType,

    /// Labels and annotations added to the frontend service.
    #[serde(default, skip_serializing_if = "PartialObjectMeta::is_empty")]
    pub additional_frontend_service_metadata: PartialObjectMeta,

    #[serde(default)]
    pub components: ComponentsSpec,

    /// The configuration file shared by all groups, unless a group overrides it.
    #[serde(default)]
    pub configuration: NodeConfiguration,

    /// Deprecated v1alpha1 settings, converted by the mutating webhook.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global: Option<GlobalSpec>,

    /// Deprecated v1alpha1 storages, converted into `metaStore` and `stateStore`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storages: Option<LegacyStorages>,
}

#[derive(
    Clone, Copy, Debug, Default, Deserialize, Display, EnumString, Eq, JsonSchema, PartialEq, Serialize,
)]
pub enum FrontendServiceType {
    #[default]
    ClusterIP,
    NodePort,
    LoadBalancer,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disallow_print_stack_traces: Option<bool>,

    #[serde(default)]
    pub ports: ComponentPorts,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_groups: Vec<NodeGroup>,

    /// Deprecated v1alpha1 groups. Ignored as soon as `nodeGroups` is not empty.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<LegacyComponentGroup>,

    /// Deprecated v1alpha1 restart timestamp, applied to the converted groups.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_at: Option<Time>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentsSpec {
    #[serde(default)]
    pub meta: ComponentSpec,

    #[serde(default)]
    pub frontend: ComponentSpec,

    #[serde(default)]
    pub compute: ComponentSpec,

    #[serde(default)]
    pub compactor: ComponentSpec,

    #[serde(default)]
    pub connector: ComponentSpec,
}

impl ComponentsSpec {
    pub fn get(&self, component: Component) -> &ComponentSpec {
        match component {
            Component::Meta => &self.meta,
            Component::Frontend => &self.frontend,
            Component::Compute => &self.compute,
            Component::Compactor => &self.compactor,
            Component::Connector => &self.connector,
        }
    }

    pub fn get_mut(&mut self, component: Component) -> &mut ComponentSpec {
        match component {
            Component::Meta => &mut self.meta,
            Component::Frontend => &mut self.frontend,
            Component::Compute => &mut self.compute,
            Component::Compactor => &mut self.compactor,
            Component::Connector => &mut self.connector,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalReplicas {
    #[serde(default)]
    pub meta: i32,
    #[serde(default)]
    pub frontend: i32,
    #[serde(default)]
    pub compute: i32,
    #[serde(default)]
    pub compactor: i32,
    #[serde(default)]
    pub connector: i32,
}

impl GlobalReplicas {
    pub fn get(&self, component: Component) -> i32 {
        match component {
            Component::Meta => self.meta,
            Component::Frontend => self.frontend,
            Component::Compute => self.compute,
            Component::Compactor => self.compactor,
            Component::Connector => self.connector,
        }
    }

    pub fn get_mut(&mut self, component: Component) -> &mut i32 {
        match component {
            Component::Meta => &mut self.meta,
            Component::Frontend => &mut self.frontend,
            Component::Compute => &mut self.compute,
            Component::Compactor => &mut self.compactor,
            Component::Connector => &mut self.connector,
        }
    }
}

/// The v1alpha1 global section: a template shared by all groups plus a default group per
/// component.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_template: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade_strategy: Option<UpgradeStrategy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "raw_object_schema")]
    pub resources: Option<ResourceRequirements>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(schema_with = "raw_object_list_schema")]
    pub env: Vec<EnvVar>,

    #[serde(default)]
    pub replicas: GlobalReplicas,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_type: Option<FrontendServiceType>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_meta: Option<PartialObjectMeta>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyStorages {
    #[serde(default)]
    pub meta: MetaStoreBackend,

    #[serde(default)]
    pub object: StateStoreBackend,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupReplicasStatus {
    pub name: String,
    pub target: i32,
    pub running: i32,

    #[serde(default)]
    pub exists: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentReplicasStatus {
    pub target: i32,
    pub running: i32,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<GroupReplicasStatus>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentsReplicasStatus {
    #[serde(default)]
    pub meta: ComponentReplicasStatus,
    #[serde(default)]
    pub frontend: ComponentReplicasStatus,
    #[serde(default)]
    pub compute: ComponentReplicasStatus,
    #[serde(default)]
    pub compactor: ComponentReplicasStatus,
    #[serde(default)]
    pub connector: ComponentReplicasStatus,
}

impl ComponentsReplicasStatus {
    pub fn get(&self, component: Component) -> &ComponentReplicasStatus {
        match component {
            Component::Meta => &self.meta,
            Component::Frontend => &self.frontend,
            Component::Compute => &self.compute,
            Component::Compactor => &self.compactor,
            Component::Connector => &self.connector,
        }
    }

    pub fn get_mut(&mut self, component: Component) -> &mut ComponentReplicasStatus {
        match component {
            Component::Meta => &mut self.meta,
            Component::Frontend => &mut self.frontend,
            Component::Compute => &mut self.compute,
            Component::Compactor => &mut self.compactor,
            Component::Connector => &mut self.connector,
        }
    }
}

#[derive(
    Clone, Copy, Debug, Deserialize, Display, Eq, Hash, JsonSchema, Ord, PartialEq, PartialOrd, Serialize,
)]
pub enum ConditionType {
    Initializing,
    Running,
    Upgrading,
    Failed,
    Unknown,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Display, Eq, JsonSchema, PartialEq, Serialize)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RisingWaveCondition {
    #[serde(rename = "type")]
    pub type_: ConditionType,

    pub status: ConditionStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl RisingWaveCondition {
    pub fn new(type_: ConditionType, status: ConditionStatus) -> Self {
        Self {
            type_,
            status,
            last_transition_time: None,
            reason: None,
            message: None,
        }
    }

    pub fn with_message(mut self, reason: impl Into<String>, message: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self.message = Some(message.into());
        self
    }
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaStoreStatus {
    pub backend: MetaStoreBackendType,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateStoreStatus {
    pub backend: StateStoreBackendType,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupLock {
    pub name: String,

    #[serde(default)]
    pub replicas: i32,
}

/// A lock held by a `RisingWaveScaleView` on some groups of one component.
#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleViewLock {
    pub name: String,
    pub uid: String,
    pub component: Component,

    /// Generation of the scale view the group locks were computed from.
    pub generation: i64,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub group_locks: Vec<GroupLock>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RisingWaveStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// The image tag of the cluster once all of its workloads are ready.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default)]
    pub component_replicas: ComponentsReplicasStatus,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<RisingWaveCondition>,

    #[serde(default)]
    pub meta_store: MetaStoreStatus,

    #[serde(default)]
    pub state_store: StateStoreStatus,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scale_views: Vec<ScaleViewLock>,
}

impl RisingWaveSpec {
    pub fn is_open_kruise_requested(&self) -> bool {
        self.enable_open_kruise.unwrap_or(false)
    }

    pub fn global_replicas(&self, component: Component) -> i32 {
        self.global
            .as_ref()
            .map(|global| global.replicas.get(component))
            .unwrap_or(0)
    }

    /// The node groups the reconciler manages for `component`.
    ///
    /// `nodeGroups` wins over the legacy `groups` and the legacy global replicas as soon as it
    /// is not empty. Otherwise the default group of the global replicas is appended unless a
    /// legacy group with the empty name already exists.
    pub fn node_groups(&self, component: Component) -> Vec<NodeGroup> {
        let spec = self.components.get(component);
        if !spec.node_groups.is_empty() {
            return spec.node_groups.clone();
        }
        let mut groups: Vec<NodeGroup> = spec
            .groups
            .iter()
            .map(|group| {
                convert_legacy_group(self.global.as_ref(), component, group, spec.restart_at.clone())
            })
            .collect();

        let global_replicas = self.global_replicas(component);
        if global_replicas > 0 && !groups.iter().any(|g| g.name.is_empty()) {
            let default_group = LegacyComponentGroup {
                replicas: global_replicas,
                ..LegacyComponentGroup::default()
            };
            groups.push(convert_legacy_group(
                self.global.as_ref(),
                component,
                &default_group,
                None,
            ));
        }
        groups
    }

    pub fn node_group(&self, component: Component, group: &str) -> Option<NodeGroup> {
        self.node_groups(component)
            .into_iter()
            .find(|g| g.name == group)
    }

    /// Total replicas of a component across all of its groups.
    pub fn total_replicas(&self, component: Component) -> i32 {
        self.node_groups(component).iter().map(|g| g.replicas).sum()
    }
}

/// Converts a v1alpha1 group into a node group. Fields the group leaves empty are taken
/// from the global template.
pub fn convert_legacy_group(
    global: Option<&GlobalSpec>,
    component: Component,
    group: &LegacyComponentGroup,
    restart_at: Option<Time>,
) -> NodeGroup {
    let global = global.cloned().unwrap_or_default();

    NodeGroup {
        name: group.name.clone(),
        replicas: group.replicas,
        restart_at,
        upgrade_strategy: group
            .upgrade_strategy
            .clone()
            .or(global.upgrade_strategy)
            .unwrap_or_default(),
        pod_template: group.pod_template.clone().or(global.pod_template),
        template: NodePodTemplate {
            metadata: PartialObjectMeta::default(),
            spec: NodePodTemplateSpec {
                image: group.image.clone().or(global.image),
                resources: group.resources.clone().or(global.resources),
                node_selector: group.node_selector.clone(),
                env: if group.env.is_empty() {
                    global.env
                } else {
                    group.env.clone()
                },
                volume_mounts: if component == Component::Compute {
                    group.volume_mounts.clone()
                } else {
                    Vec::new()
                },
                ..NodePodTemplateSpec::default()
            },
        },
        ..NodeGroup::default()
    }
}

impl RisingWave {
    pub fn is_open_kruise_requested(&self) -> bool {
        self.spec.is_open_kruise_requested()
    }

    pub fn generation(&self) -> i64 {
        self.metadata.generation.unwrap_or(0)
    }

    pub fn observed_generation(&self) -> i64 {
        self.status
            .as_ref()
            .and_then(|status| status.observed_generation)
            .unwrap_or(0)
    }

    pub fn conditions(&self) -> &[RisingWaveCondition] {
        self.status
            .as_ref()
            .map(|status| status.conditions.as_slice())
            .unwrap_or_default()
    }

    pub fn scale_view_locks(&self) -> &[ScaleViewLock] {
        self.status
            .as_ref()
            .map(|status| status.scale_views.as_slice())
            .unwrap_or_default()
    }

    /// The image a group runs, falling back to the cluster wide image.
    pub fn image_for(&self, group: &NodeGroup) -> String {
        group
            .template
            .spec
            .image
            .clone()
            .filter(|image| !image.is_empty())
            .unwrap_or_else(|| self.spec.image.clone())
    }
}

/// The version tag of an image reference: the text after the last `:`, unless that colon
/// belongs to a registry port. References without a tag are `latest`.
pub fn image_version(image: &str) -> String {
    let image = image.split('@').next().unwrap_or(image);
    match image.rsplit_once(':') {
        Some((_, tag)) if !tag.contains('/') => tag.to_string(),
        _ => "latest".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use rstest::rstest;

    use super::*;

    fn parse(input: &str) -> RisingWave {
        serde_yaml::from_str(input).expect("illegal test input")
    }

    #[rstest]
    #[case("risingwavelabs/risingwave:v1.7.0", "v1.7.0")]
    #[case("localhost:5000/risingwave:nightly", "nightly")]
    #[case("localhost:5000/risingwave", "latest")]
    #[case("risingwave", "latest")]
    #[case("risingwave:v1.0.0@sha256:abcd", "v1.0.0")]
    fn test_image_version(#[case] image: &str, #[case] expected: &str) {
        assert_eq!(image_version(image), expected);
    }

    #[test]
    fn test_node_groups_win_over_legacy_groups() {
        let rw = parse(indoc! {"
            apiVersion: risingwave.risingwavelabs.com/v1alpha1
            kind: RisingWave
            metadata:
              name: rw
            spec:
              image: risingwave:v1.7.0
              components:
                frontend:
                  nodeGroups:
                    - name: a
                      replicas: 2
                  groups:
                    - name: legacy
                      replicas: 5
        "});

        let groups = rw.spec.node_groups(Component::Frontend);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].name, "a");
        assert_eq!(rw.spec.total_replicas(Component::Frontend), 2);
    }

    #[test]
    fn test_legacy_groups_and_global_replicas() {
        let rw = parse(indoc! {"
            apiVersion: risingwave.risingwavelabs.com/v1alpha1
            kind: RisingWave
            metadata:
              name: rw
            spec:
              global:
                image: risingwave:v1.6.0
                podTemplate: base
                replicas:
                  compute: 3
              components:
                compute:
                  groups:
                    - name: large
                      replicas: 1
                      image: risingwave:v1.7.0
                      volumeMounts:
                        - name: data
                          mountPath: /data
        "});

        let groups = rw.spec.node_groups(Component::Compute);
        assert_eq!(groups.len(), 2);

        assert_eq!(groups[0].name, "large");
        assert_eq!(groups[0].template.spec.image.as_deref(), Some("risingwave:v1.7.0"));
        assert_eq!(groups[0].pod_template.as_deref(), Some("base"));
        assert_eq!(groups[0].template.spec.volume_mounts.len(), 1);

        assert_eq!(groups[1].name, "");
        assert_eq!(groups[1].replicas, 3);
        assert_eq!(groups[1].template.spec.image.as_deref(), Some("risingwave:v1.6.0"));

        assert_eq!(rw.spec.total_replicas(Component::Compute), 4);
        assert!(rw.spec.node_groups(Component::Meta).is_empty());
    }

    #[test]
    fn test_global_replicas_do_not_duplicate_default_group() {
        let rw = parse(indoc! {"
            apiVersion: risingwave.risingwavelabs.com/v1alpha1
            kind: RisingWave
            metadata:
              name: rw
            spec:
              global:
                replicas:
                  meta: 1
              components:
                meta:
                  nodeGroups:
                    - name: ''
                      replicas: 1
        "});

        assert_eq!(rw.spec.node_groups(Component::Meta).len(), 1);
    }

    #[test]
    fn test_global_replicas_ignored_next_to_node_groups() {
        let rw = parse(indoc! {"
            apiVersion: risingwave.risingwavelabs.com/v1alpha1
            kind: RisingWave
            metadata:
              name: rw
            spec:
              global:
                replicas:
                  compute: 2
              components:
                compute:
                  nodeGroups:
                    - name: a
                      replicas: 1
        "});

        let groups = rw.spec.node_groups(Component::Compute);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].name, "a");
        assert_eq!(rw.spec.node_group(Component::Compute, ""), None);
        assert_eq!(rw.spec.total_replicas(Component::Compute), 1);
    }

    #[test]
    fn test_image_for_group() {
        let rw = parse(indoc! {"
            apiVersion: risingwave.risingwavelabs.com/v1alpha1
            kind: RisingWave
            metadata:
              name: rw
            spec:
              image: risingwave:v1.7.0
              components:
                compactor:
                  nodeGroups:
                    - name: default
                    - name: canary
                      template:
                        spec:
                          image: risingwave:v1.8.0-rc
        "});

        let groups = rw.spec.node_groups(Component::Compactor);
        assert_eq!(rw.image_for(&groups[0]), "risingwave:v1.7.0");
        assert_eq!(rw.image_for(&groups[1]), "risingwave:v1.8.0-rc");
    }
}
