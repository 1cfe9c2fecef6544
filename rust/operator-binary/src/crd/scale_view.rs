use serde::{Deserialize, Serialize};
use stackable_operator::{
    kube::CustomResource,
    schemars::{self, JsonSchema},
};

use crate::crd::{
    Component, LABEL_RISINGWAVE_COMPONENT, LABEL_RISINGWAVE_GROUP, LABEL_RISINGWAVE_NAME,
};

/// Projects an aggregate replica count onto some node groups of one component of a
/// `RisingWave`. While the view exists it holds a lock on those groups.
#[derive(Clone, CustomResource, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "risingwave.risingwavelabs.com",
    version = "v1alpha1",
    kind = "RisingWaveScaleView",
    plural = "risingwavescaleviews",
    shortname = "rwsv",
    status = "RisingWaveScaleViewStatus",
    namespaced,
    crates(
        kube_core = "stackable_operator::kube::core",
        k8s_openapi = "stackable_operator::k8s_openapi",
        schemars = "stackable_operator::schemars"
    ),
    scale = r#"{"specReplicasPath":".spec.replicas","statusReplicasPath":".status.replicas","labelSelectorPath":".spec.labelSelector"}"#,
    printcolumn = r#"{"name":"TARGET","type":"string","jsonPath":".spec.targetRef.name"}"#,
    printcolumn = r#"{"name":"COMPONENT","type":"string","jsonPath":".spec.targetRef.component"}"#,
    printcolumn = r#"{"name":"READY","type":"integer","jsonPath":".status.replicas"}"#,
    printcolumn = r#"{"name":"REPLICAS","type":"integer","jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"LOCKED","type":"boolean","jsonPath":".status.locked"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RisingWaveScaleViewSpec {
    pub target_ref: TargetRef,

    /// Desired replicas summed over all groups of the view. Filled from the target on
    /// creation.
    #[serde(default)]
    pub replicas: i32,

    /// Filled by the operator, immutable afterwards.
    #[serde(default)]
    pub label_selector: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scale_policy: Vec<ScalePolicy>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetRef {
    pub name: String,

    #[serde(default)]
    pub component: Component,

    /// UID of the target. Filled by the operator on creation.
    #[serde(default)]
    pub uid: String,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalePolicy {
    pub group: String,

    /// Groups with a higher priority are filled first.
    #[serde(default)]
    pub priority: i32,

    /// Unbounded when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_replicas: Option<i32>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RisingWaveScaleViewStatus {
    /// Running replicas summed over the groups of the view.
    #[serde(default)]
    pub replicas: i32,

    #[serde(default)]
    pub locked: bool,
}

impl RisingWaveScaleView {
    pub fn generation(&self) -> i64 {
        self.metadata.generation.unwrap_or(0)
    }

    pub fn uid(&self) -> &str {
        self.metadata.uid.as_deref().unwrap_or_default()
    }

    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .is_some_and(|finalizers| finalizers.iter().any(|f| f == finalizer))
    }

    pub fn groups(&self) -> impl Iterator<Item = &str> {
        self.spec.scale_policy.iter().map(|p| p.group.as_str())
    }
}

/// `risingwave/name=<N>,risingwave/component=<C>,risingwave/group in (g1,...)`
pub fn scale_view_label_selector<'a>(
    target: &str,
    component: Component,
    groups: impl IntoIterator<Item = &'a str>,
) -> String {
    let groups: Vec<&str> = groups.into_iter().collect();
    format!(
        "{LABEL_RISINGWAVE_NAME}={target},{LABEL_RISINGWAVE_COMPONENT}={component},{LABEL_RISINGWAVE_GROUP} in ({})",
        groups.join(",")
    )
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    #[test]
    fn test_label_selector() {
        assert_eq!(
            scale_view_label_selector("rw", Component::Frontend, ["a", "b"]),
            "risingwave/name=rw,risingwave/component=frontend,risingwave/group in (a,b)"
        );
        assert_eq!(
            scale_view_label_selector("rw", Component::Compute, [""]),
            "risingwave/name=rw,risingwave/component=compute,risingwave/group in ()"
        );
    }

    #[test]
    fn test_deserialize_scale_view() {
        let sv: RisingWaveScaleView = serde_yaml::from_str(indoc! {"
            apiVersion: risingwave.risingwavelabs.com/v1alpha1
            kind: RisingWaveScaleView
            metadata:
              name: sv
              generation: 3
              finalizers:
                - risingwave/scale-view
            spec:
              targetRef:
                name: rw
                component: compute
              scalePolicy:
                - group: a
                  priority: 5
                  maxReplicas: 3
                - group: b
        "})
        .expect("illegal test input");

        assert_eq!(sv.generation(), 3);
        assert_eq!(sv.uid(), "");
        assert!(sv.has_finalizer("risingwave/scale-view"));
        assert!(!sv.is_being_deleted());
        assert_eq!(sv.spec.target_ref.component, Component::Compute);
        assert_eq!(sv.groups().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(sv.spec.scale_policy[1].max_replicas, None);
    }
}
