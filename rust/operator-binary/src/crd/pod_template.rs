use serde::{Deserialize, Serialize};
use stackable_operator::{
    k8s_openapi::api::core::v1::PodTemplateSpec,
    kube::CustomResource,
    schemars::{self, JsonSchema},
    utils::crds::raw_object_schema,
};

/// A reusable pod template referenced by name from node groups. The template is
/// immutable once created.
#[derive(Clone, CustomResource, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "risingwave.risingwavelabs.com",
    version = "v1alpha1",
    kind = "RisingWavePodTemplate",
    plural = "risingwavepodtemplates",
    shortname = "rwpt",
    namespaced,
    crates(
        kube_core = "stackable_operator::kube::core",
        k8s_openapi = "stackable_operator::k8s_openapi",
        schemars = "stackable_operator::schemars"
    )
)]
#[serde(rename_all = "camelCase")]
pub struct RisingWavePodTemplateSpec {
    #[serde(default)]
    #[schemars(schema_with = "raw_object_schema")]
    pub template: PodTemplateSpec,
}
