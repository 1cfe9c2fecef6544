//! Builds the child objects of a `RisingWave`.
//!
//! Every object carries the name, component, group and generation labels and is owned by the
//! cluster. The output only depends on the cluster, the group and the pod templates passed in,
//! so the generation label is enough to tell whether an observed object is current.

use std::collections::BTreeMap;

use snafu::{OptionExt, ResultExt, Snafu};
use stackable_operator::{
    builder::meta::ObjectMetaBuilder,
    k8s_openapi::{
        api::{
            apps::v1::{
                Deployment, DeploymentSpec, DeploymentStrategy, RollingUpdateDeployment,
                RollingUpdateStatefulSetStrategy, StatefulSet, StatefulSetSpec,
                StatefulSetUpdateStrategy,
            },
            core::v1::{
                ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EnvVar, EnvVarSource,
                KeyToPath, ObjectFieldSelector, PodSpec, PodTemplateSpec, Service, ServicePort,
                ServiceSpec, Volume, VolumeMount,
            },
        },
        apimachinery::pkg::{
            apis::meta::v1::{LabelSelector, ObjectMeta},
            util::intstr::IntOrString,
        },
    },
    kube::ResourceExt,
};

use crate::crd::{
    COMPONENT_CONFIG,
    Component,
    ConfigMapSource,
    FrontendServiceType,
    LABEL_RISINGWAVE_COMPONENT,
    LABEL_RISINGWAVE_GENERATION,
    LABEL_RISINGWAVE_GROUP,
    LABEL_RISINGWAVE_NAME,
    NO_SYNC,
    NodeGroup,
    PORT_NAME_DASHBOARD,
    PORT_NAME_METRICS,
    PORT_NAME_SERVICE,
    RisingWave,
    RisingWavePodTemplate,
    UpgradeStrategy,
    UpgradeStrategyType,
    external::{
        AdvancedRollingUpdate, AdvancedStatefulSet, AdvancedStatefulSetSpec,
        AdvancedStatefulSetUpdateStrategy, CloneSet, CloneSetSpec, CloneSetUpdateStrategy,
        InPlaceUpdateStrategy, ServiceMonitor, ServiceMonitorEndpoint, ServiceMonitorSpec,
    },
    store::{MetaStoreBackendType, StateStoreBackendType},
};

/// Component label value of the `ServiceMonitor`.
pub const COMPONENT_SERVICE_MONITOR: &str = "servicemonitor";

pub const CONFIG_VOLUME_NAME: &str = "risingwave-config";
pub const CONFIG_MOUNT_PATH: &str = "/risingwave/config";
pub const CONFIG_FILE_NAME: &str = "risingwave.toml";

pub const ANNOTATION_RESTART_AT: &str = "risingwave.risingwavelabs.com/restart-at";

/// Environment variables owned by the operator. Node groups may not set them.
pub const RESERVED_ENV_VARS: &[&str] = &[
    "RUST_BACKTRACE",
    "JAVA_OPTS",
    "RW_LISTEN_ADDR",
    "RW_ADVERTISE_ADDR",
    "RW_DASHBOARD_HOST",
    "RW_PROMETHEUS_HOST",
    "RW_ETCD_ENDPOINTS",
    "RW_ETCD_AUTH",
    "RW_ETCD_USERNAME",
    "RW_ETCD_PASSWORD",
    "RW_CONFIG_PATH",
    "RW_STATE_STORE",
    "RW_DATA_DIRECTORY",
    "RW_WORKER_THREADS",
    "RW_CONNECTOR_RPC_ENDPOINT",
    "RW_BACKEND",
    "RW_META_ADDR",
    "RW_META_ADDRESS",
    "RW_METRICS_LEVEL",
    "RW_PROMETHEUS_LISTENER_ADDR",
    "RW_PARALLELISM",
    "RW_TOTAL_MEMORY_BYTES",
];

/// Pod templates referenced by node groups, by name.
pub type PodTemplates = BTreeMap<String, RisingWavePodTemplate>;

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("object is missing metadata to build owner reference"))]
    ObjectMissingMetadataForOwnerRef {
        source: stackable_operator::builder::meta::Error,
    },

    #[snafu(display("node group {group:?} of {component} does not exist"))]
    NodeGroupNotFound { component: Component, group: String },

    #[snafu(display("pod template {name:?} referenced by group {group:?} was not found"))]
    PodTemplateNotFound { name: String, group: String },

    #[snafu(display("config map {name:?} referenced by the configuration was not found"))]
    ConfigMapNotFound { name: String },

    #[snafu(display("key {key:?} not found in config map {name:?}"))]
    ConfigMapKeyNotFound { name: String, key: String },
}

/// Produces every kind of child object the cluster reconciler manages.
pub trait ObjectFactory {
    fn service(&self, component: Component) -> Result<Service, Error>;

    /// `external` is the config map referenced by `spec.configuration`, if any was found.
    fn config_map(&self, external: Option<&ConfigMap>) -> Result<ConfigMap, Error>;

    fn service_monitor(&self) -> Result<ServiceMonitor, Error>;

    fn deployment(
        &self,
        component: Component,
        group: &str,
        templates: &PodTemplates,
    ) -> Result<Deployment, Error>;

    fn stateful_set(
        &self,
        component: Component,
        group: &str,
        templates: &PodTemplates,
    ) -> Result<StatefulSet, Error>;

    fn clone_set(
        &self,
        component: Component,
        group: &str,
        templates: &PodTemplates,
    ) -> Result<CloneSet, Error>;

    fn advanced_stateful_set(
        &self,
        component: Component,
        group: &str,
        templates: &PodTemplates,
    ) -> Result<AdvancedStatefulSet, Error>;
}

pub fn service_name(cluster: &str, component: Component) -> String {
    format!("{cluster}-{component}")
}

/// `<cluster>-<component>` for the default group, `<cluster>-<component>-<group>` otherwise.
pub fn workload_name(cluster: &str, component: Component, group: &str) -> String {
    if group.is_empty() {
        format!("{cluster}-{component}")
    } else {
        format!("{cluster}-{component}-{group}")
    }
}

pub fn config_map_name(cluster: &str) -> String {
    format!("{cluster}-{COMPONENT_CONFIG}")
}

pub fn service_monitor_name(cluster: &str) -> String {
    format!("risingwave-{cluster}")
}

/// The labels identifying the pods of one group.
pub fn pod_selector_labels(cluster: &str, component: &str, group: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_RISINGWAVE_NAME.to_string(), cluster.to_string()),
        (LABEL_RISINGWAVE_COMPONENT.to_string(), component.to_string()),
        (LABEL_RISINGWAVE_GROUP.to_string(), group.to_string()),
    ])
}

pub struct DefaultObjectFactory<'a> {
    risingwave: &'a RisingWave,
}

impl<'a> DefaultObjectFactory<'a> {
    pub fn new(risingwave: &'a RisingWave) -> Self {
        Self { risingwave }
    }

    fn cluster_name(&self) -> String {
        self.risingwave.name_any()
    }

    fn object_labels(&self, component: &str, group: &str) -> BTreeMap<String, String> {
        let mut labels = pod_selector_labels(&self.cluster_name(), component, group);
        labels.insert(
            LABEL_RISINGWAVE_GENERATION.to_string(),
            self.risingwave.generation().to_string(),
        );
        labels
    }

    fn object_meta(
        &self,
        name: String,
        labels: BTreeMap<String, String>,
    ) -> Result<ObjectMeta, Error> {
        let mut metadata = ObjectMetaBuilder::new()
            .name_and_namespace(self.risingwave)
            .name(name)
            .ownerreference_from_resource(self.risingwave, None, Some(true))
            .context(ObjectMissingMetadataForOwnerRefSnafu)?
            .build();
        metadata.labels = Some(labels);
        Ok(metadata)
    }

    fn node_group(&self, component: Component, group: &str) -> Result<NodeGroup, Error> {
        self.risingwave
            .spec
            .node_group(component, group)
            .context(NodeGroupNotFoundSnafu { component, group })
    }

    fn ports(&self, component: Component) -> (i32, i32, i32) {
        let defaults = component.default_ports();
        let ports = &self.risingwave.spec.components.get(component).ports;
        let pick = |value: i32, default: i32| if value > 0 { value } else { default };
        (
            pick(ports.service, defaults.service),
            pick(ports.metrics, defaults.metrics),
            pick(ports.dashboard, defaults.dashboard),
        )
    }

    fn container_ports(&self, component: Component) -> Vec<ContainerPort> {
        let (service, metrics, dashboard) = self.ports(component);
        let mut ports = vec![
            ContainerPort {
                name: Some(PORT_NAME_SERVICE.to_string()),
                container_port: service,
                protocol: Some("TCP".to_string()),
                ..ContainerPort::default()
            },
            ContainerPort {
                name: Some(PORT_NAME_METRICS.to_string()),
                container_port: metrics,
                protocol: Some("TCP".to_string()),
                ..ContainerPort::default()
            },
        ];
        if component == Component::Meta {
            ports.push(ContainerPort {
                name: Some(PORT_NAME_DASHBOARD.to_string()),
                container_port: dashboard,
                protocol: Some("TCP".to_string()),
                ..ContainerPort::default()
            });
        }
        ports
    }

    /// The environment the operator controls. Users may not set these names.
    fn reserved_env(&self, component: Component, stable_identity: bool) -> Vec<EnvVar> {
        let spec = &self.risingwave.spec;
        let cluster = self.cluster_name();
        let (service, metrics, dashboard) = self.ports(component);
        let advertise_host = if stable_identity && !spec.enable_advertising_with_ip.unwrap_or(false)
        {
            format!("$(POD_NAME).{}", service_name(&cluster, component))
        } else {
            "$(POD_IP)".to_string()
        };
        let disallow_stack_traces = spec
            .components
            .get(component)
            .disallow_print_stack_traces
            .unwrap_or(false);

        let mut env = vec![
            field_ref_env("POD_IP", "status.podIP"),
            field_ref_env("POD_NAME", "metadata.name"),
            env_var(
                "RUST_BACKTRACE",
                if disallow_stack_traces { "0" } else { "1" },
            ),
            env_var(
                "RW_CONFIG_PATH",
                format!("{CONFIG_MOUNT_PATH}/{CONFIG_FILE_NAME}"),
            ),
            env_var("RW_LISTEN_ADDR", format!("0.0.0.0:{service}")),
            env_var("RW_ADVERTISE_ADDR", format!("{advertise_host}:{service}")),
            env_var(
                "RW_PROMETHEUS_LISTENER_ADDR",
                format!("0.0.0.0:{metrics}"),
            ),
        ];

        if let Some(level) = &spec.components.get(component).log_level {
            env.push(env_var("RUST_LOG", level));
        }

        match component {
            Component::Meta => {
                env.push(env_var("RW_DASHBOARD_HOST", format!("0.0.0.0:{dashboard}")));
                env.push(env_var("RW_STATE_STORE", state_store_url(self.risingwave)));
                env.push(env_var(
                    "RW_DATA_DIRECTORY",
                    &spec.state_store.data_directory,
                ));
                let backend = match spec.meta_store.backend_type() {
                    MetaStoreBackendType::Memory => "mem",
                    MetaStoreBackendType::Etcd => "etcd",
                    _ => "sql",
                };
                env.push(env_var("RW_BACKEND", backend));
                if let Some(etcd) = &spec.meta_store.etcd {
                    env.push(env_var("RW_ETCD_ENDPOINTS", &etcd.endpoint));
                }
            }
            _ => {
                let (meta_port, _, _) = self.ports(Component::Meta);
                env.push(env_var(
                    "RW_META_ADDR",
                    format!(
                        "http://{}:{meta_port}",
                        service_name(&cluster, Component::Meta)
                    ),
                ));
            }
        }
        env
    }

    fn config_volume(&self, group: &NodeGroup) -> Volume {
        let source = match group.configuration.as_ref().and_then(|c| c.config_map.as_ref()) {
            Some(ConfigMapSource {
                name,
                key,
                optional,
            }) => ConfigMapVolumeSource {
                name: name.clone(),
                items: Some(vec![KeyToPath {
                    key: key.clone(),
                    path: CONFIG_FILE_NAME.to_string(),
                    ..KeyToPath::default()
                }]),
                optional: *optional,
                ..ConfigMapVolumeSource::default()
            },
            None => ConfigMapVolumeSource {
                name: config_map_name(&self.cluster_name()),
                items: Some(vec![KeyToPath {
                    key: CONFIG_FILE_NAME.to_string(),
                    path: CONFIG_FILE_NAME.to_string(),
                    ..KeyToPath::default()
                }]),
                ..ConfigMapVolumeSource::default()
            },
        };
        Volume {
            name: CONFIG_VOLUME_NAME.to_string(),
            config_map: Some(source),
            ..Volume::default()
        }
    }

    /// The pod template of a group: the referenced `RisingWavePodTemplate` if any, with the
    /// group's own template and the operator controlled fields applied on top.
    fn pod_template(
        &self,
        component: Component,
        group: &NodeGroup,
        templates: &PodTemplates,
        stable_identity: bool,
    ) -> Result<PodTemplateSpec, Error> {
        let mut base = match &group.pod_template {
            Some(name) => templates
                .get(name)
                .map(|t| t.spec.template.clone())
                .context(PodTemplateNotFoundSnafu {
                    name,
                    group: &group.name,
                })?,
            None => PodTemplateSpec::default(),
        };

        let mut pod_spec = base.spec.take().unwrap_or_default();
        let mut containers = std::mem::take(&mut pod_spec.containers).into_iter();
        let mut container = containers.next().unwrap_or_default();
        let sidecars: Vec<Container> = containers.collect();

        let template = &group.template.spec;
        container.name = component.to_string();
        container.image = Some(self.risingwave.image_for(group));
        if let Some(policy) = &template.image_pull_policy {
            container.image_pull_policy = Some(policy.clone());
        }
        if template.resources.is_some() {
            container.resources = template.resources.clone();
        }
        if template.security_context.is_some() {
            container.security_context = template.security_context.clone();
        }
        container.ports = Some(self.container_ports(component));

        let mut env = container.env.take().unwrap_or_default();
        env.extend(template.env.iter().cloned());
        env.extend(self.reserved_env(component, stable_identity));
        container.env = Some(env);

        let mut env_from = container.env_from.take().unwrap_or_default();
        env_from.extend(template.env_from.iter().cloned());
        container.env_from = (!env_from.is_empty()).then_some(env_from);

        let mut mounts = container.volume_mounts.take().unwrap_or_default();
        mounts.extend(template.volume_mounts.iter().cloned());
        mounts.push(VolumeMount {
            name: CONFIG_VOLUME_NAME.to_string(),
            mount_path: CONFIG_MOUNT_PATH.to_string(),
            read_only: Some(true),
            ..VolumeMount::default()
        });
        container.volume_mounts = Some(mounts);

        let mut all_containers = vec![container];
        all_containers.extend(sidecars);
        all_containers.extend(template.additional_containers.iter().cloned());
        pod_spec.containers = all_containers;

        let mut volumes = pod_spec.volumes.take().unwrap_or_default();
        volumes.extend(template.volumes.iter().cloned());
        volumes.push(self.config_volume(group));
        pod_spec.volumes = Some(volumes);

        if !template.node_selector.is_empty() {
            pod_spec
                .node_selector
                .get_or_insert_with(BTreeMap::new)
                .extend(template.node_selector.clone());
        }
        if template.affinity.is_some() {
            pod_spec.affinity = template.affinity.clone();
        }
        if !template.tolerations.is_empty() {
            pod_spec
                .tolerations
                .get_or_insert_with(Vec::new)
                .extend(template.tolerations.iter().cloned());
        }
        if template.service_account_name.is_some() {
            pod_spec.service_account_name = template.service_account_name.clone();
        }
        if template.pod_security_context.is_some() {
            pod_spec.security_context = template.pod_security_context.clone();
        }
        if !template.image_pull_secrets.is_empty() {
            pod_spec.image_pull_secrets = Some(template.image_pull_secrets.clone());
        }
        if template.priority_class_name.is_some() {
            pod_spec.priority_class_name = template.priority_class_name.clone();
        }
        if template.termination_grace_period_seconds.is_some() {
            pod_spec.termination_grace_period_seconds = template.termination_grace_period_seconds;
        }

        let mut metadata = base.metadata.take().unwrap_or_default();
        let labels = metadata.labels.get_or_insert_with(BTreeMap::new);
        labels.extend(group.template.metadata.labels.clone());
        labels.extend(pod_selector_labels(
            &self.cluster_name(),
            &component.to_string(),
            &group.name,
        ));
        let annotations = metadata.annotations.get_or_insert_with(BTreeMap::new);
        annotations.extend(group.template.metadata.annotations.clone());
        if let Some(restart_at) = &group.restart_at {
            annotations.insert(
                ANNOTATION_RESTART_AT.to_string(),
                restart_at.0.to_rfc3339(),
            );
        }
        if annotations.is_empty() {
            metadata.annotations = None;
        }

        Ok(PodTemplateSpec {
            metadata: Some(metadata),
            spec: Some(pod_spec),
        })
    }

    fn workload_meta(&self, component: Component, group: &str) -> Result<ObjectMeta, Error> {
        self.object_meta(
            workload_name(&self.cluster_name(), component, group),
            self.object_labels(&component.to_string(), group),
        )
    }

    fn selector(&self, component: Component, group: &str) -> LabelSelector {
        LabelSelector {
            match_labels: Some(pod_selector_labels(
                &self.cluster_name(),
                &component.to_string(),
                group,
            )),
            ..LabelSelector::default()
        }
    }
}

impl ObjectFactory for DefaultObjectFactory<'_> {
    fn service(&self, component: Component) -> Result<Service, Error> {
        let cluster = self.cluster_name();
        let (service, metrics, dashboard) = self.ports(component);
        let mut ports = vec![
            service_port(PORT_NAME_SERVICE, service),
            service_port(PORT_NAME_METRICS, metrics),
        ];
        if component == Component::Meta {
            ports.push(service_port(PORT_NAME_DASHBOARD, dashboard));
        }

        let mut metadata = self.object_meta(
            service_name(&cluster, component),
            self.object_labels(&component.to_string(), ""),
        )?;
        let mut selector = pod_selector_labels(&cluster, &component.to_string(), "");
        selector.remove(LABEL_RISINGWAVE_GROUP);

        let spec = if component == Component::Frontend {
            let extra = &self.risingwave.spec.additional_frontend_service_metadata;
            if let Some(labels) = metadata.labels.as_mut() {
                for (key, value) in &extra.labels {
                    labels.entry(key.clone()).or_insert_with(|| value.clone());
                }
            }
            if !extra.annotations.is_empty() {
                metadata.annotations = Some(extra.annotations.clone());
            }
            let service_type = self.risingwave.spec.frontend_service_type;
            ServiceSpec {
                type_: Some(service_type.to_string()),
                ports: Some(ports),
                selector: Some(selector),
                ..ServiceSpec::default()
            }
        } else {
            ServiceSpec {
                type_: Some(FrontendServiceType::ClusterIP.to_string()),
                cluster_ip: Some("None".to_string()),
                ports: Some(ports),
                selector: Some(selector),
                publish_not_ready_addresses: Some(true),
                ..ServiceSpec::default()
            }
        };

        Ok(Service {
            metadata,
            spec: Some(spec),
            status: None,
        })
    }

    fn config_map(&self, external: Option<&ConfigMap>) -> Result<ConfigMap, Error> {
        let mut labels = self.object_labels(COMPONENT_CONFIG, "");
        let content = match &self.risingwave.spec.configuration.config_map {
            Some(source) => {
                // The content is copied once and never rewritten afterwards.
                labels.insert(LABEL_RISINGWAVE_GENERATION.to_string(), NO_SYNC.to_string());
                match external {
                    Some(config_map) => {
                        let value = config_map
                            .data
                            .as_ref()
                            .and_then(|data| data.get(&source.key))
                            .cloned();
                        match value {
                            Some(value) => value,
                            None if source.is_optional() => String::new(),
                            None => {
                                return ConfigMapKeyNotFoundSnafu {
                                    name: &source.name,
                                    key: &source.key,
                                }
                                .fail()
                            }
                        }
                    }
                    None if source.is_optional() => String::new(),
                    None => {
                        return ConfigMapNotFoundSnafu {
                            name: &source.name,
                        }
                        .fail()
                    }
                }
            }
            None => String::new(),
        };

        Ok(ConfigMap {
            metadata: self.object_meta(config_map_name(&self.cluster_name()), labels)?,
            data: Some(BTreeMap::from([(CONFIG_FILE_NAME.to_string(), content)])),
            ..ConfigMap::default()
        })
    }

    fn service_monitor(&self) -> Result<ServiceMonitor, Error> {
        let cluster = self.cluster_name();
        let metadata = self.object_meta(
            service_monitor_name(&cluster),
            self.object_labels(COMPONENT_SERVICE_MONITOR, ""),
        )?;
        let spec = ServiceMonitorSpec {
            job_label: Some(LABEL_RISINGWAVE_NAME.to_string()),
            target_labels: vec![
                LABEL_RISINGWAVE_NAME.to_string(),
                LABEL_RISINGWAVE_COMPONENT.to_string(),
            ],
            selector: LabelSelector {
                match_labels: Some(BTreeMap::from([(
                    LABEL_RISINGWAVE_NAME.to_string(),
                    cluster.clone(),
                )])),
                ..LabelSelector::default()
            },
            endpoints: vec![ServiceMonitorEndpoint {
                port: PORT_NAME_METRICS.to_string(),
                path: Some("/metrics".to_string()),
                interval: Some("5s".to_string()),
                scrape_timeout: Some("5s".to_string()),
            }],
        };
        let mut monitor = ServiceMonitor::new(&service_monitor_name(&cluster), spec);
        monitor.metadata = metadata;
        Ok(monitor)
    }

    fn deployment(
        &self,
        component: Component,
        group: &str,
        templates: &PodTemplates,
    ) -> Result<Deployment, Error> {
        let node_group = self.node_group(component, group)?;
        let template = self.pod_template(component, &node_group, templates, false)?;

        Ok(Deployment {
            metadata: self.workload_meta(component, group)?,
            spec: Some(DeploymentSpec {
                replicas: Some(node_group.replicas),
                selector: self.selector(component, group),
                template,
                strategy: Some(deployment_strategy(&node_group.upgrade_strategy)),
                min_ready_seconds: positive(node_group.min_ready_seconds),
                progress_deadline_seconds: node_group.progress_deadline_seconds,
                ..DeploymentSpec::default()
            }),
            status: None,
        })
    }

    fn stateful_set(
        &self,
        component: Component,
        group: &str,
        templates: &PodTemplates,
    ) -> Result<StatefulSet, Error> {
        let node_group = self.node_group(component, group)?;
        let template = self.pod_template(component, &node_group, templates, true)?;
        let claims = volume_claim_templates(component, &node_group);

        Ok(StatefulSet {
            metadata: self.workload_meta(component, group)?,
            spec: Some(StatefulSetSpec {
                replicas: Some(node_group.replicas),
                service_name: Some(service_name(&self.cluster_name(), component)),
                selector: self.selector(component, group),
                template,
                pod_management_policy: Some("Parallel".to_string()),
                update_strategy: Some(stateful_set_strategy(&node_group)),
                volume_claim_templates: (!claims.is_empty()).then_some(claims),
                persistent_volume_claim_retention_policy: node_group
                    .persistent_volume_claim_retention_policy
                    .clone(),
                min_ready_seconds: positive(node_group.min_ready_seconds),
                ..StatefulSetSpec::default()
            }),
            status: None,
        })
    }

    fn clone_set(
        &self,
        component: Component,
        group: &str,
        templates: &PodTemplates,
    ) -> Result<CloneSet, Error> {
        let node_group = self.node_group(component, group)?;
        let template = self.pod_template(component, &node_group, templates, false)?;
        let strategy = &node_group.upgrade_strategy;
        let rolling = strategy.rolling_update.clone().unwrap_or_default();

        let mut clone_set = CloneSet::new(
            &workload_name(&self.cluster_name(), component, group),
            CloneSetSpec {
                replicas: Some(node_group.replicas),
                selector: self.selector(component, group),
                template,
                volume_claim_templates: volume_claim_templates(component, &node_group),
                update_strategy: Some(CloneSetUpdateStrategy {
                    type_: Some(kruise_update_policy(strategy.type_).to_string()),
                    partition: rolling.partition,
                    max_unavailable: rolling.max_unavailable,
                    max_surge: rolling.max_surge,
                    in_place_update_strategy: in_place_strategy(strategy),
                }),
                min_ready_seconds: positive(node_group.min_ready_seconds),
            },
        );
        clone_set.metadata = self.workload_meta(component, group)?;
        Ok(clone_set)
    }

    fn advanced_stateful_set(
        &self,
        component: Component,
        group: &str,
        templates: &PodTemplates,
    ) -> Result<AdvancedStatefulSet, Error> {
        let node_group = self.node_group(component, group)?;
        let template = self.pod_template(component, &node_group, templates, true)?;
        let strategy = &node_group.upgrade_strategy;
        let rolling = strategy.rolling_update.clone().unwrap_or_default();

        let mut sts = AdvancedStatefulSet::new(
            &workload_name(&self.cluster_name(), component, group),
            AdvancedStatefulSetSpec {
                replicas: Some(node_group.replicas),
                service_name: service_name(&self.cluster_name(), component),
                selector: self.selector(component, group),
                template,
                volume_claim_templates: volume_claim_templates(component, &node_group),
                persistent_volume_claim_retention_policy: node_group
                    .persistent_volume_claim_retention_policy
                    .clone(),
                pod_management_policy: Some("Parallel".to_string()),
                update_strategy: Some(AdvancedStatefulSetUpdateStrategy {
                    type_: Some("RollingUpdate".to_string()),
                    rolling_update: Some(AdvancedRollingUpdate {
                        partition: rolling
                            .partition
                            .as_ref()
                            .map(|p| resolve_partition(p, node_group.replicas)),
                        max_unavailable: rolling.max_unavailable,
                        pod_update_policy: Some(
                            kruise_update_policy(strategy.type_).to_string(),
                        ),
                        in_place_update_strategy: in_place_strategy(strategy),
                    }),
                }),
                min_ready_seconds: positive(node_group.min_ready_seconds),
            },
        );
        sts.metadata = self.workload_meta(component, group)?;
        Ok(sts)
    }
}

fn env_var(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        value_from: None,
    }
}

fn field_ref_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..ObjectFieldSelector::default()
            }),
            ..EnvVarSource::default()
        }),
    }
}

fn service_port(name: &str, port: i32) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port,
        target_port: Some(IntOrString::String(name.to_string())),
        protocol: Some("TCP".to_string()),
        ..ServicePort::default()
    }
}

fn positive(value: i32) -> Option<i32> {
    (value > 0).then_some(value)
}

fn volume_claim_templates(
    component: Component,
    group: &NodeGroup,
) -> Vec<stackable_operator::k8s_openapi::api::core::v1::PersistentVolumeClaim> {
    if component.is_stateful() {
        group.volume_claim_templates.clone()
    } else {
        Vec::new()
    }
}

fn state_store_url(risingwave: &RisingWave) -> String {
    let store = &risingwave.spec.state_store;
    match store.backend_type() {
        StateStoreBackendType::Memory => "hummock+memory".to_string(),
        StateStoreBackendType::MinIO => store
            .minio
            .as_ref()
            .map(|m| format!("hummock+minio://{}/{}", m.endpoint, m.bucket))
            .unwrap_or_default(),
        StateStoreBackendType::S3 => store
            .s3
            .as_ref()
            .map(|s3| format!("hummock+s3://{}", s3.bucket))
            .unwrap_or_default(),
        StateStoreBackendType::GCS => store
            .gcs
            .as_ref()
            .map(|gcs| format!("hummock+gcs://{}", gcs.bucket))
            .unwrap_or_default(),
        StateStoreBackendType::AliyunOSS => store
            .aliyun_oss
            .as_ref()
            .map(|oss| format!("hummock+oss://{}", oss.bucket))
            .unwrap_or_default(),
        StateStoreBackendType::AzureBlob => store
            .azure_blob
            .as_ref()
            .map(|az| format!("hummock+azblob://{}", az.container))
            .unwrap_or_default(),
        StateStoreBackendType::HDFS => store
            .hdfs
            .as_ref()
            .map(|hdfs| format!("hummock+hdfs://{}", hdfs.name_node))
            .unwrap_or_default(),
        StateStoreBackendType::WebHDFS => store
            .web_hdfs
            .as_ref()
            .map(|hdfs| format!("hummock+webhdfs://{}", hdfs.name_node))
            .unwrap_or_default(),
        StateStoreBackendType::LocalDisk => store
            .local_disk
            .as_ref()
            .map(|disk| format!("hummock+fs://{}", disk.root))
            .unwrap_or_default(),
        StateStoreBackendType::HuaweiCloudOBS => store
            .huawei_cloud_obs
            .as_ref()
            .map(|obs| format!("hummock+obs://{}", obs.bucket))
            .unwrap_or_default(),
        StateStoreBackendType::Unknown => String::new(),
    }
}

fn deployment_strategy(strategy: &UpgradeStrategy) -> DeploymentStrategy {
    match strategy.type_ {
        UpgradeStrategyType::Recreate => DeploymentStrategy {
            type_: Some("Recreate".to_string()),
            rolling_update: None,
        },
        _ => DeploymentStrategy {
            type_: Some("RollingUpdate".to_string()),
            rolling_update: strategy.rolling_update.as_ref().map(|r| RollingUpdateDeployment {
                max_surge: r.max_surge.clone(),
                max_unavailable: r.max_unavailable.clone(),
            }),
        },
    }
}

fn stateful_set_strategy(group: &NodeGroup) -> StatefulSetUpdateStrategy {
    let rolling = group.upgrade_strategy.rolling_update.as_ref();
    StatefulSetUpdateStrategy {
        type_: Some("RollingUpdate".to_string()),
        rolling_update: rolling.map(|r| RollingUpdateStatefulSetStrategy {
            max_unavailable: r.max_unavailable.clone(),
            partition: r
                .partition
                .as_ref()
                .map(|p| resolve_partition(p, group.replicas)),
        }),
    }
}

/// The pod update policy of the OpenKruise workloads.
fn kruise_update_policy(type_: UpgradeStrategyType) -> &'static str {
    match type_ {
        UpgradeStrategyType::InPlaceIfPossible => "InPlaceIfPossible",
        UpgradeStrategyType::InPlaceOnly => "InPlaceOnly",
        UpgradeStrategyType::Recreate | UpgradeStrategyType::RollingUpdate => "ReCreate",
    }
}

fn in_place_strategy(strategy: &UpgradeStrategy) -> Option<InPlaceUpdateStrategy> {
    strategy
        .in_place_update_strategy
        .as_ref()
        .map(|s| InPlaceUpdateStrategy {
            grace_period_seconds: s.grace_period_seconds,
        })
}

/// Turns a partition given as a number or a percentage of the replicas into a number.
/// Percentages round up.
pub fn resolve_partition(partition: &IntOrString, replicas: i32) -> i32 {
    match partition {
        IntOrString::Int(value) => *value,
        IntOrString::String(value) => {
            let trimmed = value.trim().trim_end_matches('%');
            let parsed = trimmed.parse::<i64>().unwrap_or(0);
            if value.trim().ends_with('%') {
                ((parsed * i64::from(replicas) + 99) / 100) as i32
            } else {
                parsed as i32
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use rstest::rstest;

    use super::*;

    fn risingwave(input: &str) -> RisingWave {
        serde_yaml::from_str(input).expect("illegal test input")
    }

    const CLUSTER: &str = indoc! {"
        apiVersion: risingwave.risingwavelabs.com/v1alpha1
        kind: RisingWave
        metadata:
          name: rw
          namespace: default
          uid: 7c0a2b7e-4d5c-4a8e-9f3a-1b2c3d4e5f60
          generation: 3
        spec:
          image: risingwave:v1.7.0
          metaStore:
            memory: true
          stateStore:
            memory: true
          frontendServiceType: NodePort
          additionalFrontendServiceMetadata:
            labels:
              team: streaming
            annotations:
              lb: internal
          components:
            meta:
              nodeGroups:
                - name: ''
                  replicas: 1
            frontend:
              nodeGroups:
                - name: ''
                  replicas: 2
                  upgradeStrategy:
                    type: Recreate
            compute:
              nodeGroups:
                - name: large
                  replicas: 4
                  podTemplate: base
                  upgradeStrategy:
                    type: RollingUpdate
                    rollingUpdate:
                      partition: 50%
                  volumeClaimTemplates:
                    - metadata:
                        name: data
                  template:
                    metadata:
                      labels:
                        tier: hot
                    spec:
                      image: risingwave:v1.8.0
                      env:
                        - name: EXTRA
                          value: '1'
                      volumeMounts:
                        - name: data
                          mountPath: /data
            compactor:
              nodeGroups:
                - name: ''
                  replicas: 1
            connector:
              nodeGroups:
                - name: ''
                  replicas: 1
    "};

    fn pod_templates() -> PodTemplates {
        let template: RisingWavePodTemplate = serde_yaml::from_str(indoc! {"
            apiVersion: risingwave.risingwavelabs.com/v1alpha1
            kind: RisingWavePodTemplate
            metadata:
              name: base
              namespace: default
            spec:
              template:
                spec:
                  priorityClassName: high
                  containers:
                    - name: ignored
                      env:
                        - name: FROM_TEMPLATE
                          value: 'yes'
                    - name: sidecar
                      image: busybox
        "})
        .expect("illegal test input");
        PodTemplates::from([("base".to_string(), template)])
    }

    fn assert_labels(metadata: &ObjectMeta, component: &str, group: &str, generation: &str) {
        let labels = metadata.labels.as_ref().unwrap();
        assert_eq!(labels.get(LABEL_RISINGWAVE_NAME).map(String::as_str), Some("rw"));
        assert_eq!(
            labels.get(LABEL_RISINGWAVE_COMPONENT).map(String::as_str),
            Some(component)
        );
        assert_eq!(labels.get(LABEL_RISINGWAVE_GROUP).map(String::as_str), Some(group));
        assert_eq!(
            labels.get(LABEL_RISINGWAVE_GENERATION).map(String::as_str),
            Some(generation)
        );
        let owner = &metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner.kind, "RisingWave");
        assert_eq!(owner.controller, Some(true));
    }

    #[rstest]
    #[case("rw", Component::Compute, "", "rw-compute")]
    #[case("rw", Component::Compute, "large", "rw-compute-large")]
    #[case("prod", Component::Meta, "a", "prod-meta-a")]
    fn test_workload_name(
        #[case] cluster: &str,
        #[case] component: Component,
        #[case] group: &str,
        #[case] expected: &str,
    ) {
        assert_eq!(workload_name(cluster, component, group), expected);
    }

    #[rstest]
    #[case(IntOrString::Int(2), 10, 2)]
    #[case(IntOrString::String("50%".to_string()), 5, 3)]
    #[case(IntOrString::String("100%".to_string()), 4, 4)]
    #[case(IntOrString::String("3".to_string()), 4, 3)]
    fn test_resolve_partition(
        #[case] partition: IntOrString,
        #[case] replicas: i32,
        #[case] expected: i32,
    ) {
        assert_eq!(resolve_partition(&partition, replicas), expected);
    }

    #[test]
    fn test_services() {
        let rw = risingwave(CLUSTER);
        let factory = DefaultObjectFactory::new(&rw);

        let frontend = factory.service(Component::Frontend).unwrap();
        assert_eq!(frontend.metadata.name.as_deref(), Some("rw-frontend"));
        assert_labels(&frontend.metadata, "frontend", "", "3");
        assert_eq!(
            frontend.metadata.labels.as_ref().unwrap().get("team").map(String::as_str),
            Some("streaming")
        );
        let spec = frontend.spec.unwrap();
        assert_eq!(spec.type_.as_deref(), Some("NodePort"));
        assert_eq!(spec.cluster_ip, None);
        assert_eq!(spec.ports.unwrap()[0].port, 4567);

        let meta = factory.service(Component::Meta).unwrap();
        let spec = meta.spec.unwrap();
        assert_eq!(spec.cluster_ip.as_deref(), Some("None"));
        let ports: Vec<i32> = spec.ports.unwrap().iter().map(|p| p.port).collect();
        assert_eq!(ports, vec![5690, 1250, 5691]);
        assert!(!spec.selector.unwrap().contains_key(LABEL_RISINGWAVE_GROUP));
    }

    #[test]
    fn test_config_map() {
        let rw = risingwave(CLUSTER);
        let config = DefaultObjectFactory::new(&rw).config_map(None).unwrap();
        assert_eq!(config.metadata.name.as_deref(), Some("rw-config"));
        assert_labels(&config.metadata, "config", "", "3");
        assert_eq!(
            config.data.unwrap().get(CONFIG_FILE_NAME).map(String::as_str),
            Some("")
        );
    }

    #[test]
    fn test_external_config_map_is_not_synced() {
        let mut rw = risingwave(CLUSTER);
        rw.spec.configuration.config_map = Some(ConfigMapSource {
            name: "user-config".to_string(),
            key: "risingwave.toml".to_string(),
            optional: None,
        });
        let external = ConfigMap {
            data: Some(BTreeMap::from([(
                "risingwave.toml".to_string(),
                "[server]\n".to_string(),
            )])),
            ..ConfigMap::default()
        };

        let factory = DefaultObjectFactory::new(&rw);
        let config = factory.config_map(Some(&external)).unwrap();
        assert_labels(&config.metadata, "config", "", NO_SYNC);
        assert_eq!(
            config.data.unwrap().get(CONFIG_FILE_NAME).map(String::as_str),
            Some("[server]\n")
        );

        assert!(matches!(
            factory.config_map(None),
            Err(Error::ConfigMapNotFound { .. })
        ));
        assert!(matches!(
            factory.config_map(Some(&ConfigMap::default())),
            Err(Error::ConfigMapKeyNotFound { .. })
        ));
    }

    #[test]
    fn test_deployment() {
        let rw = risingwave(CLUSTER);
        let deployment = DefaultObjectFactory::new(&rw)
            .deployment(Component::Frontend, "", &PodTemplates::new())
            .unwrap();

        assert_eq!(deployment.metadata.name.as_deref(), Some("rw-frontend"));
        assert_labels(&deployment.metadata, "frontend", "", "3");

        let spec = deployment.spec.unwrap();
        assert_eq!(spec.replicas, Some(2));
        assert_eq!(
            spec.strategy.unwrap().type_.as_deref(),
            Some("Recreate")
        );
        let pod = spec.template.spec.unwrap();
        let container = &pod.containers[0];
        assert_eq!(container.name, "frontend");
        assert_eq!(container.image.as_deref(), Some("risingwave:v1.7.0"));
        let env = container.env.as_ref().unwrap();
        assert!(env.iter().any(|e| e.name == "RW_META_ADDR"
            && e.value.as_deref() == Some("http://rw-meta:5690")));
        assert!(container
            .volume_mounts
            .as_ref()
            .unwrap()
            .iter()
            .any(|m| m.mount_path == CONFIG_MOUNT_PATH));
    }

    #[test]
    fn test_stateful_set_with_pod_template() {
        let rw = risingwave(CLUSTER);
        let sts = DefaultObjectFactory::new(&rw)
            .stateful_set(Component::Compute, "large", &pod_templates())
            .unwrap();

        assert_eq!(sts.metadata.name.as_deref(), Some("rw-compute-large"));
        assert_labels(&sts.metadata, "compute", "large", "3");

        let spec = sts.spec.unwrap();
        assert_eq!(spec.replicas, Some(4));
        assert_eq!(spec.service_name.as_deref(), Some("rw-compute"));
        assert_eq!(spec.volume_claim_templates.unwrap().len(), 1);
        assert_eq!(
            spec.update_strategy
                .unwrap()
                .rolling_update
                .unwrap()
                .partition,
            Some(2)
        );

        let pod_labels = spec.template.metadata.unwrap().labels.unwrap();
        assert_eq!(pod_labels.get("tier").map(String::as_str), Some("hot"));
        assert_eq!(
            pod_labels.get(LABEL_RISINGWAVE_GROUP).map(String::as_str),
            Some("large")
        );

        let pod = spec.template.spec.unwrap();
        assert_eq!(pod.priority_class_name.as_deref(), Some("high"));
        assert_eq!(pod.containers.len(), 2);
        assert_eq!(pod.containers[1].name, "sidecar");

        let container = &pod.containers[0];
        assert_eq!(container.name, "compute");
        assert_eq!(container.image.as_deref(), Some("risingwave:v1.8.0"));
        let env: Vec<&str> = container
            .env
            .as_ref()
            .unwrap()
            .iter()
            .map(|e| e.name.as_str())
            .collect();
        assert_eq!(env[0], "FROM_TEMPLATE");
        assert_eq!(env[1], "EXTRA");
        assert!(env.contains(&"RW_ADVERTISE_ADDR"));
    }

    #[test]
    fn test_missing_pod_template() {
        let rw = risingwave(CLUSTER);
        assert!(matches!(
            DefaultObjectFactory::new(&rw).stateful_set(
                Component::Compute,
                "large",
                &PodTemplates::new()
            ),
            Err(Error::PodTemplateNotFound { .. })
        ));
        assert!(matches!(
            DefaultObjectFactory::new(&rw).deployment(
                Component::Compactor,
                "missing",
                &PodTemplates::new()
            ),
            Err(Error::NodeGroupNotFound { .. })
        ));
    }

    #[test]
    fn test_open_kruise_workloads() {
        let rw = risingwave(CLUSTER);
        let factory = DefaultObjectFactory::new(&rw);

        let clone_set = factory
            .clone_set(Component::Frontend, "", &PodTemplates::new())
            .unwrap();
        assert_labels(&clone_set.metadata, "frontend", "", "3");
        assert_eq!(clone_set.metadata.namespace.as_deref(), Some("default"));
        assert_eq!(
            clone_set.spec.update_strategy.unwrap().type_.as_deref(),
            Some("ReCreate")
        );
        assert!(clone_set.spec.volume_claim_templates.is_empty());

        let sts = factory
            .advanced_stateful_set(Component::Compute, "large", &pod_templates())
            .unwrap();
        assert_labels(&sts.metadata, "compute", "large", "3");
        assert_eq!(sts.spec.service_name, "rw-compute");
        let rolling = sts.spec.update_strategy.unwrap().rolling_update.unwrap();
        assert_eq!(rolling.partition, Some(2));
        assert_eq!(rolling.pod_update_policy.as_deref(), Some("ReCreate"));
    }

    #[test]
    fn test_service_monitor() {
        let rw = risingwave(CLUSTER);
        let monitor = DefaultObjectFactory::new(&rw).service_monitor().unwrap();
        assert_eq!(monitor.metadata.name.as_deref(), Some("risingwave-rw"));
        assert_labels(&monitor.metadata, COMPONENT_SERVICE_MONITOR, "", "3");
        assert_eq!(monitor.spec.endpoints[0].port, PORT_NAME_METRICS);
    }
}
