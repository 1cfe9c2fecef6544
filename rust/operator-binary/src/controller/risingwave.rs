//! Ensures that the services, the config object and the workloads of every node group exist
//! for each [`RisingWave`], and reports their state in its status.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    time::Duration,
};

use const_format::concatcp;
use snafu::{OptionExt, ResultExt, Snafu};
use stackable_operator::{
    client::Client,
    k8s_openapi::{
        api::{
            apps::v1::{Deployment, StatefulSet},
            core::v1::{ConfigMap, Service},
        },
        apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition,
    },
    kube::{
        Api,
        Resource,
        ResourceExt,
        core::{DeserializeGuard, error_boundary},
        runtime::{
            controller::Action,
            events::{Event, EventType, Recorder},
        },
    },
    logging::controller::ReconcilerError,
};
use strum::{Display, EnumDiscriminants, IntoEnumIterator, IntoStaticStr};
use tracing::{debug, info, warn};

use crate::{
    config::OperatorConfig,
    crd::{
        COMPONENT_CONFIG,
        Component,
        ComponentReplicasStatus,
        GroupReplicasStatus,
        LABEL_RISINGWAVE_COMPONENT,
        LABEL_RISINGWAVE_NAME,
        NodeGroup,
        OPERATOR_NAME,
        RisingWave,
        RisingWavePodTemplate,
        external::{AdvancedStatefulSet, CloneSet, SERVICE_MONITOR_CRD_NAME, ServiceMonitor},
    },
    event::{ClusterEvent, MessageStore},
    factory::{self, COMPONENT_SERVICE_MONITOR, DefaultObjectFactory, ObjectFactory, PodTemplates},
    metrics::OperatorMetrics,
    state::{self, RisingWaveManager, unhealthy_message},
    sync::{self, ChildObject, GroupSyncPlan, SyncAction, is_synced, plan_group_sync},
    workload::Workload,
};

pub const RISINGWAVE_CONTROLLER_NAME: &str = "risingwave";
pub const RISINGWAVE_FULL_CONTROLLER_NAME: &str =
    concatcp!(RISINGWAVE_CONTROLLER_NAME, '.', OPERATOR_NAME);

pub struct Ctx {
    pub client: Client,
    pub config: OperatorConfig,
    pub open_kruise_available: bool,
    pub messages: Arc<MessageStore>,
    pub metrics: OperatorMetrics,
    pub event_recorder: Arc<Recorder>,
}

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("RisingWave object is invalid"))]
    InvalidRisingWave {
        source: error_boundary::InvalidObject,
    },

    #[snafu(display("object defines no namespace"))]
    ObjectHasNoNamespace,

    #[snafu(display("standalone mode is not supported"))]
    StandaloneModeUnsupported,

    #[snafu(display("failed to list the children of the cluster"))]
    ListChildren { source: sync::Error },

    #[snafu(display("failed to sync the {component} service"))]
    SyncService {
        source: sync::Error,
        component: Component,
    },

    #[snafu(display("failed to sync the config object"))]
    SyncConfigMap { source: sync::Error },

    #[snafu(display("failed to sync the service monitor"))]
    SyncServiceMonitor { source: sync::Error },

    #[snafu(display("failed to sync the {kind} of {component}"))]
    SyncWorkloads {
        source: sync::Error,
        component: Component,
        kind: WorkloadKind,
    },

    #[snafu(display("failed to get config map {name}"))]
    GetConfigMap {
        source: stackable_operator::kube::Error,
        name: String,
    },

    #[snafu(display("failed to get pod template {name}"))]
    GetPodTemplate {
        source: stackable_operator::kube::Error,
        name: String,
    },

    #[snafu(display("failed to look up the {SERVICE_MONITOR_CRD_NAME} CRD"))]
    GetServiceMonitorCrd {
        source: stackable_operator::kube::Error,
    },

    #[snafu(display("failed to update the status"))]
    PushStatus { source: state::Error },
}

type Result<T, E = Error> = std::result::Result<T, E>;

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }
}

impl Error {
    fn is_conflict(&self) -> bool {
        match self {
            Error::SyncService { source, .. }
            | Error::SyncConfigMap { source }
            | Error::SyncServiceMonitor { source }
            | Error::SyncWorkloads { source, .. } => source.is_conflict(),
            Error::PushStatus {
                source: state::Error::ReplaceStatus { source, .. },
            } => sync::is_api_error(source, 409),
            _ => false,
        }
    }
}

/// The workload kind the node groups of a component run as.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum WorkloadKind {
    #[strum(serialize = "Deployments")]
    Deployment,
    #[strum(serialize = "StatefulSets")]
    StatefulSet,
    #[strum(serialize = "CloneSets")]
    CloneSet,
    #[strum(serialize = "AdvancedStatefulSets")]
    AdvancedStatefulSet,
}

impl WorkloadKind {
    pub fn for_component(component: Component, open_kruise: bool) -> Self {
        match (component, open_kruise) {
            (Component::Compute, false) => WorkloadKind::StatefulSet,
            (_, false) => WorkloadKind::Deployment,
            (Component::Meta | Component::Compute, true) => WorkloadKind::AdvancedStatefulSet,
            (_, true) => WorkloadKind::CloneSet,
        }
    }
}

/// The group to pod template map the workloads of a component are synced against.
pub fn expected_groups(groups: &[NodeGroup]) -> BTreeMap<String, String> {
    groups
        .iter()
        .map(|g| (g.name.clone(), g.pod_template.clone().unwrap_or_default()))
        .collect()
}

/// The state of the workloads of one component.
#[derive(Debug, PartialEq)]
pub struct ComponentObservation {
    /// Every existing workload of an expected group is current and rolled out.
    pub ready: bool,
    /// Some expected group has no workload.
    pub missing: bool,
    pub replicas: ComponentReplicasStatus,
}

pub fn observe_component<K: Workload>(
    workloads: &[&K],
    groups: &[NodeGroup],
    generation: i64,
) -> ComponentObservation {
    let expected: BTreeMap<&str, i32> = groups
        .iter()
        .map(|g| (g.name.as_str(), g.replicas))
        .collect();

    let mut ready = true;
    let mut seen = BTreeSet::new();
    let mut statuses = Vec::new();
    for workload in workloads {
        let group = workload.group();
        let running = workload.ready_replicas();
        match expected.get(group.as_str()) {
            Some(target) => {
                if !is_synced(workload.meta(), generation) || !workload.is_rolled_out() {
                    ready = false;
                }
                seen.insert(group.clone());
                statuses.push(GroupReplicasStatus {
                    name: group,
                    target: *target,
                    running,
                    exists: true,
                });
            }
            None => statuses.push(GroupReplicasStatus {
                name: format!("{group}(-)"),
                target: 0,
                running,
                exists: true,
            }),
        }
    }

    let mut missing = false;
    for (name, target) in &expected {
        if !seen.contains(*name) {
            missing = true;
            statuses.push(GroupReplicasStatus {
                name: name.to_string(),
                target: *target,
                running: 0,
                exists: false,
            });
        }
    }
    statuses.sort_by(|a, b| a.name.cmp(&b.name));

    ComponentObservation {
        ready,
        missing,
        replicas: ComponentReplicasStatus {
            target: expected.values().sum(),
            running: statuses.iter().map(|g| g.running).sum(),
            groups: statuses,
        },
    }
}

/// How a component with node groups lacking a workload shows up in the unhealthy message.
fn missing_workloads(kind: WorkloadKind, component: Component) -> String {
    format!("{kind}({component})")
}

pub fn serves_v1(crd: &CustomResourceDefinition) -> bool {
    crd.spec
        .versions
        .iter()
        .any(|version| version.name == "v1" && version.served)
}

fn of_component<'a, K: ResourceExt>(objects: &'a [K], component: &str) -> Vec<&'a K> {
    objects
        .iter()
        .filter(|obj| {
            obj.labels().get(LABEL_RISINGWAVE_COMPONENT).map(String::as_str) == Some(component)
        })
        .collect()
}

fn singleton<'a, K: ResourceExt>(objects: &'a [K], component: &str) -> Option<&'a K> {
    of_component(objects, component).into_iter().next()
}

/// Everything the cluster owns, as observed at the start of the reconcile.
#[derive(Default)]
struct Children {
    services: Vec<Service>,
    config_maps: Vec<ConfigMap>,
    service_monitors: Vec<ServiceMonitor>,
    deployments: Vec<Deployment>,
    stateful_sets: Vec<StatefulSet>,
    clone_sets: Vec<CloneSet>,
    advanced_stateful_sets: Vec<AdvancedStatefulSet>,
}

impl Children {
    async fn fetch(
        client: &Client,
        namespace: &str,
        cluster: &str,
        open_kruise_available: bool,
        with_service_monitor: bool,
    ) -> Result<Self, sync::Error> {
        let selector = format!("{LABEL_RISINGWAVE_NAME}={cluster}");
        let mut children = Children {
            services: sync::list_children(client, namespace, &selector).await?,
            config_maps: sync::list_children(client, namespace, &selector).await?,
            deployments: sync::list_children(client, namespace, &selector).await?,
            stateful_sets: sync::list_children(client, namespace, &selector).await?,
            ..Children::default()
        };
        if open_kruise_available {
            children.clone_sets = sync::list_children(client, namespace, &selector).await?;
            children.advanced_stateful_sets =
                sync::list_children(client, namespace, &selector).await?;
        }
        if with_service_monitor {
            children.service_monitors = sync::list_children(client, namespace, &selector).await?;
        }
        Ok(children)
    }
}

type ComponentPlans<K> = Vec<(Component, GroupSyncPlan<K>)>;

fn plan_workloads<K: ResourceExt + Clone>(
    objects: &[K],
    kind: WorkloadKind,
    expected: &BTreeMap<Component, BTreeMap<String, String>>,
    open_kruise: bool,
    generation: i64,
) -> ComponentPlans<K> {
    let none = BTreeMap::new();
    Component::iter()
        .map(|component| {
            let observed = of_component(objects, &component.to_string())
                .into_iter()
                .cloned()
                .collect();
            let groups = if WorkloadKind::for_component(component, open_kruise) == kind {
                expected.get(&component).unwrap_or(&none)
            } else {
                &none
            };
            (component, plan_group_sync(observed, groups, generation))
        })
        .collect()
}

fn referenced_templates<'a, K>(
    plans: &ComponentPlans<K>,
    expected: &'a BTreeMap<Component, BTreeMap<String, String>>,
    names: &mut BTreeSet<&'a str>,
) {
    for (component, plan) in plans {
        if let Some(groups) = expected.get(component) {
            names.extend(plan.pod_templates(groups));
        }
    }
}

async fn run_plans<K: ChildObject>(
    client: &Client,
    plans: ComponentPlans<K>,
    kind: WorkloadKind,
    generation: i64,
    build: impl Fn(Component, &str) -> Result<K, factory::Error>,
) -> Result<()> {
    for (component, plan) in plans {
        if plan.delete.is_empty() && plan.resync.is_empty() {
            continue;
        }
        debug!(
            component = %component,
            delete = plan.delete.len(),
            resync = plan.resync.len(),
            "syncing workloads"
        );
        sync::sync_group(client, plan, generation, |group| build(component, group))
            .await
            .context(SyncWorkloadsSnafu { component, kind })?;
    }
    Ok(())
}

async fn fetch_pod_templates(
    client: &Client,
    namespace: &str,
    names: &BTreeSet<&str>,
) -> Result<PodTemplates> {
    let api: Api<RisingWavePodTemplate> = Api::namespaced(client.as_kube_client(), namespace);
    let mut templates = PodTemplates::new();
    for name in names {
        let template = api
            .get_opt(name)
            .await
            .context(GetPodTemplateSnafu { name: *name })?;
        match template {
            Some(template) => {
                templates.insert(name.to_string(), template);
            }
            None => warn!(pod_template = %name, "referenced pod template does not exist"),
        }
    }
    Ok(templates)
}

async fn fetch_external_config(
    client: &Client,
    namespace: &str,
    rw: &RisingWave,
) -> Result<Option<ConfigMap>> {
    let Some(source) = &rw.spec.configuration.config_map else {
        return Ok(None);
    };
    Api::<ConfigMap>::namespaced(client.as_kube_client(), namespace)
        .get_opt(&source.name)
        .await
        .context(GetConfigMapSnafu {
            name: source.name.clone(),
        })
}

async fn is_service_monitor_served(client: &Client) -> Result<bool> {
    let crd = Api::<CustomResourceDefinition>::all(client.as_kube_client())
        .get_opt(SERVICE_MONITOR_CRD_NAME)
        .await
        .context(GetServiceMonitorCrdSnafu)?;
    Ok(crd.as_ref().is_some_and(serves_v1))
}

async fn publish_event(ctx: &Ctx, rw: &RisingWave, event: ClusterEvent, message: &str) {
    let uid = rw.uid().unwrap_or_default();
    if !ctx.messages.should_emit(&uid, event, message) {
        return;
    }
    let result = ctx
        .event_recorder
        .publish(
            &Event {
                type_: if event.is_warning() {
                    EventType::Warning
                } else {
                    EventType::Normal
                },
                reason: event.to_string(),
                note: Some(message.to_string()),
                action: "Reconcile".to_string(),
                secondary: None,
            },
            &rw.object_ref(&()),
        )
        .await;
    if let Err(error) = result {
        warn!(%error, event = %event, "failed to publish event");
    }
}

pub async fn reconcile_risingwave(
    rw: Arc<DeserializeGuard<RisingWave>>,
    ctx: Arc<Ctx>,
) -> Result<Action> {
    tracing::info!("Starting reconcile");
    let rw = rw
        .0
        .as_ref()
        .map_err(error_boundary::InvalidObject::clone)
        .context(InvalidRisingWaveSnafu)?;

    let result = reconcile(rw, &ctx).await;
    ctx.metrics
        .observe_reconcile(RISINGWAVE_CONTROLLER_NAME, result.is_ok());
    result
}

async fn reconcile(rw: &RisingWave, ctx: &Ctx) -> Result<Action> {
    let client = &ctx.client;
    let uid = rw.uid().unwrap_or_default();
    if rw.meta().deletion_timestamp.is_some() {
        ctx.messages.forget(&uid);
        return Ok(Action::await_change());
    }

    let namespace = rw.namespace().context(ObjectHasNoNamespaceSnafu)?;
    let cluster = rw.name_any();
    let generation = rw.generation();
    let mgr = RisingWaveManager::new(rw, ctx.open_kruise_available);
    // Admission rejects it, but objects created while the webhooks were off still get here.
    if mgr.is_standalone_mode_enabled() {
        return StandaloneModeUnsupportedSnafu.fail();
    }
    let open_kruise = mgr.is_open_kruise_enabled();
    let factory = DefaultObjectFactory::new(rw);

    if let Some((event, message)) = mgr.begin_reconcile() {
        publish_event(ctx, rw, event, &message).await;
    }

    let with_service_monitor = rw.spec.enable_default_service_monitor.unwrap_or(false)
        && is_service_monitor_served(client).await?;
    let children = Children::fetch(
        client,
        &namespace,
        &cluster,
        ctx.open_kruise_available,
        with_service_monitor,
    )
    .await
    .context(ListChildrenSnafu)?;

    let mut missing = Vec::new();

    for component in Component::iter() {
        let observed = singleton(&children.services, &component.to_string());
        if observed.is_none() {
            missing.push(format!("Service({component})"));
        }
        let action = sync::sync_object(client, observed, generation, || factory.service(component))
            .await
            .context(SyncServiceSnafu { component })?;
        debug!(component = %component, ?action, "synced service");
    }

    let observed_config = singleton(&children.config_maps, COMPONENT_CONFIG);
    if observed_config.is_none() {
        missing.push(format!("ConfigMap({COMPONENT_CONFIG})"));
    }
    let external_config =
        if sync::sync_action(observed_config.map(|c| c.meta()), generation) != SyncAction::Skip {
            fetch_external_config(client, &namespace, rw).await?
        } else {
            None
        };
    sync::sync_object(client, observed_config, generation, || {
        factory.config_map(external_config.as_ref())
    })
    .await
    .context(SyncConfigMapSnafu)?;

    if with_service_monitor {
        sync::sync_object(
            client,
            singleton(&children.service_monitors, COMPONENT_SERVICE_MONITOR),
            generation,
            || factory.service_monitor(),
        )
        .await
        .context(SyncServiceMonitorSnafu)?;
    }

    let node_groups: BTreeMap<Component, Vec<NodeGroup>> = Component::iter()
        .map(|component| (component, mgr.node_groups(component)))
        .collect();
    let expected: BTreeMap<Component, BTreeMap<String, String>> = node_groups
        .iter()
        .map(|(component, groups)| (*component, expected_groups(groups)))
        .collect();

    let deployment_plans = plan_workloads(
        &children.deployments,
        WorkloadKind::Deployment,
        &expected,
        open_kruise,
        generation,
    );
    let stateful_set_plans = plan_workloads(
        &children.stateful_sets,
        WorkloadKind::StatefulSet,
        &expected,
        open_kruise,
        generation,
    );
    let clone_set_plans = plan_workloads(
        &children.clone_sets,
        WorkloadKind::CloneSet,
        &expected,
        open_kruise,
        generation,
    );
    let advanced_stateful_set_plans = plan_workloads(
        &children.advanced_stateful_sets,
        WorkloadKind::AdvancedStatefulSet,
        &expected,
        open_kruise,
        generation,
    );

    let mut template_names = BTreeSet::new();
    referenced_templates(&deployment_plans, &expected, &mut template_names);
    referenced_templates(&stateful_set_plans, &expected, &mut template_names);
    referenced_templates(&clone_set_plans, &expected, &mut template_names);
    referenced_templates(&advanced_stateful_set_plans, &expected, &mut template_names);
    let templates = fetch_pod_templates(client, &namespace, &template_names).await?;

    run_plans(
        client,
        deployment_plans,
        WorkloadKind::Deployment,
        generation,
        |component, group| factory.deployment(component, group, &templates),
    )
    .await?;
    run_plans(
        client,
        stateful_set_plans,
        WorkloadKind::StatefulSet,
        generation,
        |component, group| factory.stateful_set(component, group, &templates),
    )
    .await?;
    run_plans(
        client,
        clone_set_plans,
        WorkloadKind::CloneSet,
        generation,
        |component, group| factory.clone_set(component, group, &templates),
    )
    .await?;
    run_plans(
        client,
        advanced_stateful_set_plans,
        WorkloadKind::AdvancedStatefulSet,
        generation,
        |component, group| factory.advanced_stateful_set(component, group, &templates),
    )
    .await?;

    let mut observations = BTreeMap::new();
    for (component, groups) in &node_groups {
        let component = *component;
        let name = component.to_string();
        let kind = WorkloadKind::for_component(component, open_kruise);
        let observation = match kind {
            WorkloadKind::Deployment => {
                observe_component(&of_component(&children.deployments, &name), groups, generation)
            }
            WorkloadKind::StatefulSet => observe_component(
                &of_component(&children.stateful_sets, &name),
                groups,
                generation,
            ),
            WorkloadKind::CloneSet => {
                observe_component(&of_component(&children.clone_sets, &name), groups, generation)
            }
            WorkloadKind::AdvancedStatefulSet => observe_component(
                &of_component(&children.advanced_stateful_sets, &name),
                groups,
                generation,
            ),
        };
        if !observation.ready {
            info!(component = %component, "workloads are rolling out, waiting");
            mgr.push(client).await.context(PushStatusSnafu)?;
            return Ok(Action::requeue(ctx.config.requeue_interval()));
        }
        if observation.missing {
            missing.push(missing_workloads(kind, component));
        }
        observations.insert(component, observation);
    }

    let replicas = observations
        .into_iter()
        .map(|(component, observation)| (component, observation.replicas))
        .collect();
    let transition = mgr.update_health(replicas, &missing);
    if missing.is_empty() {
        if ctx.messages.is_message_set(&uid, ClusterEvent::Unhealthy) {
            info!(
                previous = %ctx.messages.message_for(&uid, ClusterEvent::Unhealthy),
                "cluster recovered"
            );
            ctx.messages.clear_message(&uid, ClusterEvent::Unhealthy);
        }
    } else {
        info!(message = %unhealthy_message(&missing), "cluster is not running");
    }
    if let Some((event, message)) = transition {
        publish_event(ctx, rw, event, &message).await;
        if event == ClusterEvent::Unhealthy {
            ctx.messages.clear_message(&uid, ClusterEvent::Running);
        }
    }

    mgr.sync_observed_generation();
    mgr.push(client).await.context(PushStatusSnafu)?;

    Ok(Action::await_change())
}

pub fn error_policy(
    _obj: Arc<DeserializeGuard<RisingWave>>,
    error: &Error,
    _ctx: Arc<Ctx>,
) -> Action {
    match error {
        // An invalid object will not become valid by retrying.
        Error::InvalidRisingWave { .. } | Error::StandaloneModeUnsupported => {
            Action::await_change()
        }
        error if error.is_conflict() => Action::requeue(Duration::ZERO),
        _ => Action::requeue(Duration::from_secs(5)),
    }
}

#[cfg(test)]
mod tests {
    use indoc::{formatdoc, indoc};
    use rstest::rstest;

    use super::*;
    use crate::crd::{ConditionStatus, ConditionType, RisingWaveCondition};

    fn node_groups(input: &str) -> Vec<NodeGroup> {
        serde_yaml::from_str(input).expect("illegal test input")
    }

    fn deployment(group: &str, generation: i64, ready: i32, updated: i32) -> Deployment {
        serde_yaml::from_str(&formatdoc! {"
            apiVersion: apps/v1
            kind: Deployment
            metadata:
              name: rw-frontend-{group}
              namespace: default
              generation: 1
              labels:
                risingwave/name: rw
                risingwave/component: frontend
                risingwave/group: '{group}'
                risingwave/generation: '{generation}'
            spec:
              replicas: 2
              selector: {{}}
              template: {{}}
            status:
              observedGeneration: 1
              replicas: 2
              updatedReplicas: {updated}
              availableReplicas: {updated}
              readyReplicas: {ready}
        "})
        .expect("illegal test input")
    }

    #[rstest]
    #[case(Component::Meta, false, WorkloadKind::Deployment)]
    #[case(Component::Compute, false, WorkloadKind::StatefulSet)]
    #[case(Component::Connector, false, WorkloadKind::Deployment)]
    #[case(Component::Meta, true, WorkloadKind::AdvancedStatefulSet)]
    #[case(Component::Compute, true, WorkloadKind::AdvancedStatefulSet)]
    #[case(Component::Frontend, true, WorkloadKind::CloneSet)]
    fn test_workload_kind(
        #[case] component: Component,
        #[case] open_kruise: bool,
        #[case] expected: WorkloadKind,
    ) {
        assert_eq!(WorkloadKind::for_component(component, open_kruise), expected);
    }

    #[test]
    fn test_expected_groups() {
        let groups = node_groups(indoc! {"
            - name: ''
              replicas: 1
            - name: large
              replicas: 2
              podTemplate: big-nodes
        "});
        assert_eq!(
            expected_groups(&groups),
            BTreeMap::from([
                ("".to_string(), "".to_string()),
                ("large".to_string(), "big-nodes".to_string())
            ])
        );
    }

    #[test]
    fn test_observe_component_rollup() {
        let groups = node_groups(indoc! {"
            - name: a
              replicas: 2
            - name: b
              replicas: 3
            - name: c
              replicas: 1
        "});
        let a = deployment("a", 4, 2, 2);
        let old = deployment("old", 4, 1, 2);
        let b = deployment("b", 4, 2, 2);

        let observation = observe_component(&[&b, &old, &a], &groups, 4);
        assert!(observation.ready);
        assert!(observation.missing);
        assert_eq!(observation.replicas.target, 6);
        assert_eq!(observation.replicas.running, 5);

        let groups: Vec<(&str, i32, i32, bool)> = observation
            .replicas
            .groups
            .iter()
            .map(|g| (g.name.as_str(), g.target, g.running, g.exists))
            .collect();
        assert_eq!(
            groups,
            vec![
                ("a", 2, 2, true),
                ("b", 3, 2, true),
                ("c", 1, 0, false),
                ("old(-)", 0, 1, true),
            ]
        );
    }

    #[rstest]
    // outdated generation label
    #[case(deployment("a", 3, 2, 2), false)]
    // still rolling out
    #[case(deployment("a", 4, 1, 1), false)]
    #[case(deployment("a", 4, 2, 2), true)]
    fn test_observe_component_readiness(#[case] workload: Deployment, #[case] ready: bool) {
        let groups = node_groups("- name: a\n  replicas: 2\n");
        let observation = observe_component(&[&workload], &groups, 4);
        assert_eq!(observation.ready, ready);
        assert!(!observation.missing);
    }

    #[test]
    fn test_observe_component_without_groups() {
        let observation = observe_component::<Deployment>(&[], &[], 1);
        assert!(observation.ready);
        assert!(!observation.missing);
        assert_eq!(observation.replicas, ComponentReplicasStatus::default());
    }

    fn idle_deployment(group: &str) -> Deployment {
        serde_yaml::from_str(&formatdoc! {"
            apiVersion: apps/v1
            kind: Deployment
            metadata:
              name: rw-frontend-{group}
              namespace: default
              generation: 1
              labels:
                risingwave/name: rw
                risingwave/component: frontend
                risingwave/group: '{group}'
                risingwave/generation: '4'
            spec:
              replicas: 0
              selector: {{}}
              template: {{}}
            status:
              observedGeneration: 1
        "})
        .expect("illegal test input")
    }

    fn cluster(status: &str) -> RisingWaveManager {
        let rw: RisingWave = serde_yaml::from_str(&formatdoc! {"
            apiVersion: risingwave.risingwavelabs.com/v1alpha1
            kind: RisingWave
            metadata:
              name: rw
              namespace: default
              uid: rw-uid
              generation: 4
            spec:
              image: risingwave:v1.7.0
              metaStore:
                memory: true
              stateStore:
                memory: true
            {status}
        "})
        .expect("illegal test input");
        RisingWaveManager::new(&rw, false)
    }

    const UPGRADING: &str = indoc! {"
        status:
          observedGeneration: 3
          version: v1.6.0
          conditions:
            - type: Running
              status: 'True'
              lastTransitionTime: 2024-01-01T00:00:00Z
    "};

    /// The health step of a reconcile for a cluster whose only workloads are frontend
    /// deployments.
    fn frontend_health(
        mgr: &RisingWaveManager,
        workloads: &[Deployment],
        groups: &str,
    ) -> Option<(ClusterEvent, String)> {
        let workloads: Vec<&Deployment> = workloads.iter().collect();
        let observation = observe_component(&workloads, &node_groups(groups), 4);
        assert!(observation.ready);
        let missing = if observation.missing {
            vec![missing_workloads(WorkloadKind::Deployment, Component::Frontend)]
        } else {
            Vec::new()
        };
        mgr.update_health(
            BTreeMap::from([(Component::Frontend, observation.replicas)]),
            &missing,
        )
    }

    fn condition(mgr: &RisingWaveManager, type_: ConditionType) -> Option<RisingWaveCondition> {
        mgr.draft_status()
            .conditions
            .into_iter()
            .find(|c| c.type_ == type_)
    }

    #[rstest]
    #[case::all_groups_idle(
        vec![idle_deployment("a"), idle_deployment("b")],
        "[{name: a, replicas: 0}, {name: b, replicas: 0}]",
        true
    )]
    #[case::group_added(
        vec![deployment("a", 4, 2, 2)],
        "[{name: a, replicas: 2}, {name: c, replicas: 1}]",
        false
    )]
    #[case::group_removed(
        vec![deployment("a", 4, 2, 2), deployment("old", 3, 0, 1)],
        "[{name: a, replicas: 2}]",
        true
    )]
    fn test_running_condition_of_fresh_cluster(
        #[case] workloads: Vec<Deployment>,
        #[case] groups: &str,
        #[case] running: bool,
    ) {
        let mgr = cluster("");
        assert_eq!(
            mgr.begin_reconcile(),
            Some((ClusterEvent::Initializing, "Initializing".to_string()))
        );

        let event = frontend_health(&mgr, &workloads, groups);
        let status = mgr.draft_status();
        let running_condition =
            condition(&mgr, ConditionType::Running).expect("Running is always set");
        if running {
            assert_eq!(event, Some((ClusterEvent::Running, "Running".to_string())));
            assert_eq!(running_condition.status, ConditionStatus::True);
            assert_eq!(status.version.as_deref(), Some("v1.7.0"));
        } else {
            assert_eq!(event, None);
            assert_eq!(running_condition.status, ConditionStatus::False);
            assert_eq!(
                running_condition.message.as_deref(),
                Some("Found components broken or missing: Deployments(frontend)")
            );
            assert_eq!(status.version, None);
        }
        assert_eq!(
            condition(&mgr, ConditionType::Initializing).is_some(),
            !running
        );
    }

    #[test]
    fn test_upgrade_finishes() {
        let mgr = cluster(UPGRADING);
        assert_eq!(
            mgr.begin_reconcile(),
            Some((ClusterEvent::Upgrading, "Upgrading to generation 4".to_string()))
        );
        assert_eq!(
            condition(&mgr, ConditionType::Upgrading).map(|c| c.status),
            Some(ConditionStatus::True)
        );

        let event = frontend_health(&mgr, &[deployment("a", 4, 2, 2)], "[{name: a, replicas: 2}]");
        assert_eq!(event, None);
        assert_eq!(
            condition(&mgr, ConditionType::Upgrading).map(|c| c.status),
            Some(ConditionStatus::False)
        );
        assert_eq!(
            condition(&mgr, ConditionType::Running).map(|c| c.status),
            Some(ConditionStatus::True)
        );
        assert_eq!(mgr.draft_status().version.as_deref(), Some("v1.7.0"));
    }

    #[test]
    fn test_running_cluster_turns_unhealthy() {
        let mgr = cluster(UPGRADING);
        mgr.begin_reconcile();

        let event = frontend_health(&mgr, &[], "[{name: a, replicas: 2}]");
        let message = "Found components broken or missing: Deployments(frontend)".to_string();
        assert_eq!(event, Some((ClusterEvent::Unhealthy, message)));
        assert_eq!(
            condition(&mgr, ConditionType::Running).map(|c| c.status),
            Some(ConditionStatus::False)
        );
        assert_eq!(mgr.draft_status().version.as_deref(), Some("v1.6.0"));
    }

    #[test]
    fn test_plan_workloads_tears_down_inactive_kind() {
        let expected = BTreeMap::from([(
            Component::Frontend,
            BTreeMap::from([("a".to_string(), String::new())]),
        )]);
        let deployments = vec![deployment("a", 4, 2, 2)];

        let vanilla = plan_workloads(&deployments, WorkloadKind::Deployment, &expected, false, 4);
        assert!(vanilla.iter().all(|(_, plan)| plan.delete.is_empty()));

        let advanced = plan_workloads(&deployments, WorkloadKind::Deployment, &expected, true, 4);
        let (_, frontend) = advanced
            .iter()
            .find(|(component, _)| *component == Component::Frontend)
            .unwrap();
        assert_eq!(frontend.delete.len(), 1);
        assert!(frontend.resync.is_empty());

        let clone_sets: Vec<CloneSet> = Vec::new();
        let created = plan_workloads(&clone_sets, WorkloadKind::CloneSet, &expected, true, 4);
        let (_, frontend) = created
            .iter()
            .find(|(component, _)| *component == Component::Frontend)
            .unwrap();
        assert_eq!(frontend.resync.len(), 1);
    }

    #[test]
    fn test_serves_v1() {
        let crd: CustomResourceDefinition = serde_yaml::from_str(indoc! {"
            apiVersion: apiextensions.k8s.io/v1
            kind: CustomResourceDefinition
            metadata:
              name: servicemonitors.monitoring.coreos.com
            spec:
              group: monitoring.coreos.com
              names:
                kind: ServiceMonitor
                plural: servicemonitors
              scope: Namespaced
              versions:
                - name: v1
                  served: true
                  storage: true
        "})
        .expect("illegal test input");
        assert!(serves_v1(&crd));

        let mut not_served = crd.clone();
        not_served.spec.versions[0].served = false;
        assert!(!serves_v1(&not_served));
    }
}
