pub mod external;
pub mod node_group;
pub mod pod_template;
pub mod risingwave;
pub mod scale_view;
pub mod store;

use const_format::concatcp;
use serde::{Deserialize, Serialize};
use stackable_operator::schemars::{self, JsonSchema};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

pub use self::{
    node_group::{
        ComponentPorts, ConfigMapSource, LegacyComponentGroup, NodeConfiguration, NodeGroup,
        NodePodTemplate, NodePodTemplateSpec, PartialObjectMeta, RollingUpdate, UpgradeStrategy,
        UpgradeStrategyType,
    },
    pod_template::{RisingWavePodTemplate, RisingWavePodTemplateSpec},
    risingwave::{
        ComponentReplicasStatus, ComponentSpec, ComponentsReplicasStatus, ComponentsSpec,
        ConditionStatus, ConditionType, FrontendServiceType, GlobalReplicas, GlobalSpec, GroupLock,
        GroupReplicasStatus, RisingWave, RisingWaveCondition, RisingWaveSpec, RisingWaveStatus,
        ScaleViewLock, image_version,
    },
    scale_view::{
        RisingWaveScaleView, RisingWaveScaleViewSpec, RisingWaveScaleViewStatus, ScalePolicy,
        TargetRef,
    },
};

pub const API_GROUP: &str = "risingwave.risingwavelabs.com";
pub const API_VERSION: &str = "v1alpha1";
pub const OPERATOR_NAME: &str = "risingwave.risingwavelabs.com";

pub const LABEL_PREFIX: &str = "risingwave/";
pub const LABEL_RISINGWAVE_NAME: &str = concatcp!(LABEL_PREFIX, "name");
pub const LABEL_RISINGWAVE_COMPONENT: &str = concatcp!(LABEL_PREFIX, "component");
pub const LABEL_RISINGWAVE_GROUP: &str = concatcp!(LABEL_PREFIX, "group");
pub const LABEL_RISINGWAVE_GENERATION: &str = concatcp!(LABEL_PREFIX, "generation");

/// Generation label value of objects the reconciler must never rewrite.
pub const NO_SYNC: &str = "nosync";

pub const SCALE_VIEW_FINALIZER: &str = concatcp!(LABEL_PREFIX, "scale-view");

/// Component label value of the cluster wide config object.
pub const COMPONENT_CONFIG: &str = "config";

pub const DEFAULT_META_SERVICE_PORT: i32 = 5690;
pub const DEFAULT_META_DASHBOARD_PORT: i32 = 5691;
pub const DEFAULT_META_METRICS_PORT: i32 = 1250;
pub const DEFAULT_FRONTEND_SERVICE_PORT: i32 = 4567;
pub const DEFAULT_FRONTEND_METRICS_PORT: i32 = 8080;
pub const DEFAULT_COMPUTE_SERVICE_PORT: i32 = 5688;
pub const DEFAULT_COMPUTE_METRICS_PORT: i32 = 1222;
pub const DEFAULT_COMPACTOR_SERVICE_PORT: i32 = 6660;
pub const DEFAULT_COMPACTOR_METRICS_PORT: i32 = 1260;
pub const DEFAULT_CONNECTOR_SERVICE_PORT: i32 = 50051;
pub const DEFAULT_CONNECTOR_METRICS_PORT: i32 = 50052;

pub const PORT_NAME_SERVICE: &str = "service";
pub const PORT_NAME_METRICS: &str = "metrics";
pub const PORT_NAME_DASHBOARD: &str = "dashboard";

/// The processes a cluster is made of. Every child object belongs to exactly one of them,
/// except the config object.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Display,
    EnumIter,
    EnumString,
    Eq,
    Hash,
    IntoStaticStr,
    JsonSchema,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Component {
    Meta,
    Frontend,
    #[default]
    Compute,
    Compactor,
    Connector,
}

impl Component {
    /// Compute is the only component that keeps local state on volume claims.
    pub fn is_stateful(&self) -> bool {
        matches!(self, Component::Compute)
    }

    pub fn default_ports(&self) -> ComponentPorts {
        let (service, metrics, dashboard) = match self {
            Component::Meta => (
                DEFAULT_META_SERVICE_PORT,
                DEFAULT_META_METRICS_PORT,
                DEFAULT_META_DASHBOARD_PORT,
            ),
            Component::Frontend => (
                DEFAULT_FRONTEND_SERVICE_PORT,
                DEFAULT_FRONTEND_METRICS_PORT,
                0,
            ),
            Component::Compute => (DEFAULT_COMPUTE_SERVICE_PORT, DEFAULT_COMPUTE_METRICS_PORT, 0),
            Component::Compactor => (
                DEFAULT_COMPACTOR_SERVICE_PORT,
                DEFAULT_COMPACTOR_METRICS_PORT,
                0,
            ),
            Component::Connector => (
                DEFAULT_CONNECTOR_SERVICE_PORT,
                DEFAULT_CONNECTOR_METRICS_PORT,
                0,
            ),
        };
        ComponentPorts {
            service,
            metrics,
            dashboard,
        }
    }
}

/// The label selector of every object owned by `cluster` for `component`, written in the
/// `key=value,...` form accepted by list calls.
pub fn component_selector(cluster: &str, component: &str) -> String {
    format!("{LABEL_RISINGWAVE_NAME}={cluster},{LABEL_RISINGWAVE_COMPONENT}={component}")
}
