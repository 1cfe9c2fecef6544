//! Admission of `RisingWave` objects: legacy shape conversion on the way in, spec checks and
//! scale view locks on create and update.

use std::sync::LazyLock;

use regex::Regex;
use stackable_operator::{
    cpu::CpuQuantity,
    k8s_openapi::{
        api::core::v1::{EnvVar, ResourceRequirements},
        apimachinery::pkg::util::intstr::IntOrString,
    },
    kube::core::{
        DynamicObject,
        admission::{AdmissionRequest, Operation},
    },
    memory::MemoryQuantity,
};
use strum::IntoEnumIterator;

use crate::{
    crd::{
        Component,
        ConfigMapSource,
        FrontendServiceType,
        LABEL_PREFIX,
        LegacyComponentGroup,
        NodeGroup,
        RisingWave,
        RisingWaveSpec,
        UpgradeStrategy,
        UpgradeStrategyType,
        risingwave::convert_legacy_group,
        store::{MetaStoreBackend, StateStoreBackend},
    },
    factory::RESERVED_ENV_VARS,
    scale_view::helper::ReplicasHelper,
    webhook::{Admission, Denial, DenialReason, FieldError, parse_object, spec_patch},
};

static IMAGE_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"^((?:(?:[a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9-]*[a-zA-Z0-9])",
        r"(?:\.(?:[a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9-]*[a-zA-Z0-9]))*(?::[0-9]+)?/)?",
        r"[a-z0-9]+(?:(?:[._]|__|[-]*)[a-z0-9]+)*",
        r"(?:/[a-z0-9]+(?:(?:[._]|__|[-]*)[a-z0-9]+)*)*)",
        r"(?::([\w][\w.-]{0,127}))?",
        r"(?:@([A-Za-z][A-Za-z0-9]*(?:[-_+.][A-Za-z][A-Za-z0-9]*)*[:][0-9A-Fa-f]{32,}))?$",
    ))
    .expect("image reference pattern is a valid regex")
});

pub fn is_valid_image(image: &str) -> bool {
    IMAGE_REFERENCE.is_match(image)
}

pub fn mutate(request: &AdmissionRequest<DynamicObject>) -> Admission {
    if !matches!(request.operation, Operation::Create | Operation::Update) {
        return Ok(None);
    }
    let mut risingwave: RisingWave = parse_object(request.object.as_ref(), "object")?;
    default_risingwave(&mut risingwave.spec);
    let spec =
        serde_json::to_value(&risingwave.spec).map_err(|e| Denial::internal(e.to_string()))?;
    spec_patch(request.object.as_ref(), spec)
}

pub fn validate(
    request: &AdmissionRequest<DynamicObject>,
    open_kruise_available: bool,
) -> Result<(), Denial> {
    match request.operation {
        Operation::Create => {
            let risingwave: RisingWave = parse_object(request.object.as_ref(), "object")?;
            Denial::check(
                DenialReason::Invalid,
                validate_create(&risingwave, open_kruise_available),
            )
        }
        Operation::Update => {
            let old: RisingWave = parse_object(request.old_object.as_ref(), "oldObject")?;
            let new: RisingWave = parse_object(request.object.as_ref(), "object")?;
            validate_update(&old, &new, open_kruise_available)
        }
        _ => Ok(()),
    }
}

/// Moves the v1alpha1 fields onto their v1alpha2 counterparts and fills defaults.
/// Running it twice yields the same spec.
pub fn default_risingwave(spec: &mut RisingWaveSpec) {
    if let Some(global) = spec.global.clone() {
        if spec.image.is_empty() {
            if let Some(image) = global.image.filter(|image| !image.is_empty()) {
                spec.image = image;
            }
        }
        if let Some(service_type) = global.service_type {
            if service_type != FrontendServiceType::ClusterIP
                && spec.frontend_service_type == FrontendServiceType::ClusterIP
            {
                spec.frontend_service_type = service_type;
            }
        }
        if let Some(meta) = global.service_meta {
            if spec.additional_frontend_service_metadata.is_empty() {
                spec.additional_frontend_service_metadata = meta;
            }
        }
    }

    for component in Component::iter() {
        if spec.components.get(component).node_groups.is_empty() {
            let node_groups = spec.node_groups(component);
            if !node_groups.is_empty() {
                let target = spec.components.get_mut(component);
                target.node_groups = node_groups;
                target.groups.clear();
                if let Some(global) = spec.global.as_mut() {
                    *global.replicas.get_mut(component) = 0;
                }
            }
        }

        let defaults = component.default_ports();
        let ports = &mut spec.components.get_mut(component).ports;
        if ports.service == 0 {
            ports.service = defaults.service;
        }
        if ports.metrics == 0 {
            ports.metrics = defaults.metrics;
        }
        if ports.dashboard == 0 {
            ports.dashboard = defaults.dashboard;
        }
    }

    if let Some(storages) = spec.storages.take() {
        if spec.meta_store.selected().is_empty() {
            spec.meta_store = storages.meta;
        }
        if spec.state_store.selected().is_empty() {
            spec.state_store = storages.object;
        }
    }

    let data_directory = spec.state_store.data_directory.trim().trim_end_matches('/');
    if data_directory != spec.state_store.data_directory {
        spec.state_store.data_directory = data_directory.to_string();
    }
}

/// The meta store in effect, honoring the legacy `storages` of clusters that were never
/// converted.
fn effective_meta_store(spec: &RisingWaveSpec) -> &MetaStoreBackend {
    match &spec.storages {
        Some(storages) if spec.meta_store.selected().is_empty() => &storages.meta,
        _ => &spec.meta_store,
    }
}

fn effective_state_store(spec: &RisingWaveSpec) -> &StateStoreBackend {
    match &spec.storages {
        Some(storages) if spec.state_store.selected().is_empty() => &storages.object,
        _ => &spec.state_store,
    }
}

pub fn validate_create(risingwave: &RisingWave, open_kruise_available: bool) -> Vec<FieldError> {
    let spec = &risingwave.spec;
    let mut errors = Vec::new();

    if spec.is_open_kruise_requested() && !open_kruise_available {
        errors.push(FieldError::forbidden(
            "spec.enableOpenKruise",
            "OpenKruise is disabled.",
        ));
    }
    if spec.enable_standalone_mode.unwrap_or(false) {
        errors.push(FieldError::forbidden(
            "spec.enableStandaloneMode",
            "standalone mode is not supported",
        ));
    }
    if !spec.image.is_empty() && !is_valid_image(&spec.image) {
        errors.push(FieldError::invalid("spec.image", "invalid image reference"));
    }

    validate_meta_store(effective_meta_store(spec), &mut errors);
    validate_state_store(effective_state_store(spec), &mut errors);
    if let Some(config_map) = &spec.configuration.config_map {
        validate_config_map(config_map, "spec.configuration.configMap", &mut errors);
    }

    let open_kruise = spec.is_open_kruise_requested() && open_kruise_available;
    for component in Component::iter() {
        let component_spec = spec.components.get(component);
        if !component_spec.node_groups.is_empty() {
            for (i, group) in component_spec.node_groups.iter().enumerate() {
                let paths = GroupPaths::node_group(format!(
                    "spec.components.{component}.nodeGroups[{i}]"
                ));
                validate_group(spec, group, &paths, open_kruise, &mut errors);
            }
        } else {
            for (i, legacy) in component_spec.groups.iter().enumerate() {
                let group = convert_legacy_group(spec.global.as_ref(), component, legacy, None);
                let paths =
                    GroupPaths::legacy(format!("spec.components.{component}.groups[{i}]"));
                validate_group(spec, &group, &paths, open_kruise, &mut errors);
            }
        }
    }
    // The global defaults only matter while some component still has its default group there.
    let global_default_in_use = Component::iter()
        .any(|c| spec.components.get(c).node_groups.is_empty() && spec.global_replicas(c) > 0);
    if global_default_in_use {
        let group = convert_legacy_group(
            spec.global.as_ref(),
            Component::Meta,
            &LegacyComponentGroup::default(),
            None,
        );
        validate_group(
            spec,
            &group,
            &GroupPaths::legacy("spec.global".to_string()),
            open_kruise,
            &mut errors,
        );
    }

    if effective_meta_store(spec).is_memory() && spec.total_replicas(Component::Meta) > 1 {
        errors.push(FieldError::invalid(
            "spec.components.meta",
            "the memory meta store allows at most one meta node",
        ));
    }
    errors
}

pub fn validate_update(
    old: &RisingWave,
    new: &RisingWave,
    open_kruise_available: bool,
) -> Result<(), Denial> {
    Denial::check(
        DenialReason::Invalid,
        validate_create(new, open_kruise_available),
    )?;

    let mut errors = Vec::new();
    if effective_meta_store(&old.spec) != effective_meta_store(&new.spec) {
        errors.push(FieldError::forbidden(
            "spec.metaStore",
            "meta store must be kept consistent",
        ));
    }
    if effective_state_store(&old.spec) != effective_state_store(&new.spec) {
        errors.push(FieldError::forbidden(
            "spec.stateStore",
            "state store must be kept consistent",
        ));
    }
    Denial::check(DenialReason::Forbidden, errors)?;

    Denial::check(DenialReason::Invalid, validate_locks(old, new))
}

/// Replicas of locked groups may only stay as they were or move to the value of the lock,
/// and all groups of one lock must do the same. A group whose value equals both fits either.
fn validate_locks(old: &RisingWave, new: &RisingWave) -> Vec<FieldError> {
    let mut errors = Vec::new();
    for lock in new.scale_view_locks() {
        let old_replicas = ReplicasHelper::new(&old.spec, lock.component);
        let new_replicas = ReplicasHelper::new(&new.spec, lock.component);

        let mut present = Vec::new();
        for group_lock in &lock.group_locks {
            let group = group_lock.name.as_str();
            let previous = old_replicas.read(group);
            match new_replicas.read(group) {
                Some(current) => present.push((group, group_lock.replicas, previous, current)),
                None => {
                    let path = old_replicas
                        .field_path(group)
                        .unwrap_or_else(|| format!("spec.components.{}", lock.component));
                    errors.push(FieldError::forbidden(path, "group is locked (delete)"));
                }
            }
        }

        let moved = present
            .iter()
            .any(|(_, locked, previous, current)| current == locked && Some(*current) != *previous);
        for (group, locked, previous, current) in present {
            let consistent = if moved {
                current == locked
            } else {
                Some(current) == previous
            };
            if !consistent {
                let path = new_replicas.field_path(group).unwrap_or_default();
                errors.push(FieldError::forbidden(path, "group is locked (update)"));
            }
        }
    }
    errors
}

fn validate_meta_store(store: &MetaStoreBackend, errors: &mut Vec<FieldError>) {
    if store.selected().len() != 1 {
        errors.push(FieldError::invalid(
            "spec.metaStore",
            "exactly one meta store backend must be set",
        ));
    }
    if let Some(etcd) = &store.etcd {
        if etcd.endpoint.is_empty() {
            errors.push(FieldError::required(
                "spec.metaStore.etcd.endpoint",
                "endpoint is required",
            ));
        }
    }
    if let Some(sqlite) = &store.sqlite {
        if sqlite.path.is_empty() {
            errors.push(FieldError::required(
                "spec.metaStore.sqlite.path",
                "path is required",
            ));
        }
    }
    for (name, database) in [("mysql", &store.mysql), ("postgresql", &store.postgresql)] {
        let Some(database) = database else {
            continue;
        };
        if database.host.is_empty() {
            errors.push(FieldError::required(
                format!("spec.metaStore.{name}.host"),
                "host is required",
            ));
        }
        if database.credentials.secret_name.is_empty() {
            errors.push(FieldError::required(
                format!("spec.metaStore.{name}.credentials.secretName"),
                "secret name is required",
            ));
        }
    }
}

fn validate_state_store(store: &StateStoreBackend, errors: &mut Vec<FieldError>) {
    if store.selected().len() != 1 {
        errors.push(FieldError::invalid(
            "spec.stateStore",
            "exactly one state store backend must be set",
        ));
    }

    if let Some(gcs) = &store.gcs {
        let workload_identity = gcs.credentials.use_workload_identity.unwrap_or(false);
        let secret = gcs
            .credentials
            .secret_name
            .as_ref()
            .is_some_and(|s| !s.is_empty());
        if workload_identity == secret {
            errors.push(FieldError::invalid(
                "spec.stateStore.gcs.credentials",
                "either useWorkloadIdentity or secretName must be set, but not both",
            ));
        }
    }
    if let Some(s3) = &store.s3 {
        let secret = s3
            .credentials
            .secret_name
            .as_ref()
            .is_some_and(|s| !s.is_empty());
        let endpoint = s3.endpoint.as_ref().is_some_and(|e| !e.is_empty());
        let service_account = s3.credentials.use_service_account.unwrap_or(false);
        if !secret && !endpoint && !service_account {
            errors.push(FieldError::required(
                "spec.stateStore.s3.credentials.secretName",
                "secret name is required unless an endpoint or the service account is used",
            ));
        }
    }
    if let Some(minio) = &store.minio {
        if minio.credentials.secret_name.is_empty() {
            errors.push(FieldError::required(
                "spec.stateStore.minio.credentials.secretName",
                "secret name is required",
            ));
        }
    }
    if let Some(oss) = &store.aliyun_oss {
        if oss.credentials.secret_name.is_empty() {
            errors.push(FieldError::required(
                "spec.stateStore.aliyunOSS.credentials.secretName",
                "secret name is required",
            ));
        }
    }
    if let Some(obs) = &store.huawei_cloud_obs {
        if obs.credentials.secret_name.is_empty() {
            errors.push(FieldError::required(
                "spec.stateStore.huaweiCloudOBS.credentials.secretName",
                "secret name is required",
            ));
        }
    }
    if let Some(azblob) = &store.azure_blob {
        let secret = azblob
            .credentials
            .secret_name
            .as_ref()
            .is_some_and(|s| !s.is_empty());
        let service_account = azblob.credentials.use_service_account.unwrap_or(false);
        if secret == service_account {
            errors.push(FieldError::invalid(
                "spec.stateStore.azureBlob.credentials",
                "either useServiceAccount or secretName must be set, but not both",
            ));
        }
    }
}

fn validate_config_map(config_map: &ConfigMapSource, path: &str, errors: &mut Vec<FieldError>) {
    if config_map.name.is_empty() || config_map.key.is_empty() {
        errors.push(FieldError::invalid(path, "name and key must both be set"));
    }
}

/// Where the fields of a group live. Node groups nest them in a pod template, legacy groups
/// and the global defaults keep them flat.
struct GroupPaths {
    base: String,
    nested: bool,
}

impl GroupPaths {
    fn node_group(base: String) -> Self {
        Self { base, nested: true }
    }

    fn legacy(base: String) -> Self {
        Self {
            base,
            nested: false,
        }
    }

    fn field(&self, name: &str) -> String {
        format!("{}.{name}", self.base)
    }

    fn template(&self, name: &str) -> String {
        if self.nested {
            format!("{}.template.spec.{name}", self.base)
        } else {
            self.field(name)
        }
    }
}

fn validate_group(
    spec: &RisingWaveSpec,
    group: &NodeGroup,
    paths: &GroupPaths,
    open_kruise: bool,
    errors: &mut Vec<FieldError>,
) {
    match group.template.spec.image.as_deref().filter(|i| !i.is_empty()) {
        Some(image) if !is_valid_image(image) => {
            errors.push(FieldError::invalid(
                paths.template("image"),
                "invalid image reference",
            ));
        }
        Some(_) => {}
        None if spec.image.is_empty() => {
            errors.push(FieldError::required(
                paths.template("image"),
                "image is required when spec.image is empty",
            ));
        }
        None => {}
    }

    validate_upgrade_strategy(
        &group.upgrade_strategy,
        &paths.field("upgradeStrategy"),
        open_kruise,
        errors,
    );

    if let Some(config_map) = group
        .configuration
        .as_ref()
        .and_then(|c| c.config_map.as_ref())
    {
        validate_config_map(config_map, &paths.field("configuration.configMap"), errors);
    }

    for key in group.template.metadata.labels.keys() {
        if key.starts_with(LABEL_PREFIX) {
            errors.push(FieldError::invalid(
                format!("{}.template.metadata.labels", paths.base),
                format!("label {key:?} is reserved"),
            ));
        }
    }

    validate_env(&group.template.spec.env, &paths.template("env"), errors);

    if let Some(resources) = &group.template.spec.resources {
        validate_resources(resources, &paths.template("resources"), errors);
    }
}

fn validate_upgrade_strategy(
    strategy: &UpgradeStrategy,
    path: &str,
    open_kruise: bool,
    errors: &mut Vec<FieldError>,
) {
    if strategy.type_ == UpgradeStrategyType::Recreate && strategy.rolling_update.is_some() {
        errors.push(FieldError::forbidden(
            format!("{path}.rollingUpdate"),
            "must be empty when the type is Recreate",
        ));
    }

    if open_kruise {
        if !strategy.type_.is_in_place() && strategy.in_place_update_strategy.is_some() {
            errors.push(FieldError::forbidden(
                format!("{path}.inPlaceUpdateStrategy"),
                "only allowed for in-place upgrades",
            ));
        }
    } else {
        if strategy.type_.is_in_place() {
            errors.push(FieldError::invalid(
                format!("{path}.type"),
                format!("{} requires OpenKruise", strategy.type_),
            ));
        }
        if strategy.in_place_update_strategy.is_some() {
            errors.push(FieldError::forbidden(
                format!("{path}.inPlaceUpdateStrategy"),
                "requires OpenKruise",
            ));
        }
    }

    if let Some(IntOrString::String(partition)) = strategy
        .rolling_update
        .as_ref()
        .and_then(|r| r.partition.as_ref())
    {
        if partition
            .trim()
            .trim_end_matches('%')
            .parse::<i32>()
            .is_err()
        {
            errors.push(FieldError::invalid(
                format!("{path}.rollingUpdate.partition"),
                "must be an integer or a percentage",
            ));
        }
    }
}

fn validate_env(env: &[EnvVar], path: &str, errors: &mut Vec<FieldError>) {
    for (i, var) in env.iter().enumerate() {
        if RESERVED_ENV_VARS.contains(&var.name.as_str()) {
            errors.push(FieldError::forbidden(
                format!("{path}[{i}].name"),
                format!("{} is reserved", var.name),
            ));
        }
    }
}

/// Limits below requests. Quantities that cannot be compared are left to the API server.
fn validate_resources(resources: &ResourceRequirements, path: &str, errors: &mut Vec<FieldError>) {
    let (Some(requests), Some(limits)) = (&resources.requests, &resources.limits) else {
        return;
    };

    if let (Some(request), Some(limit)) = (requests.get("cpu"), limits.get("cpu")) {
        if let (Ok(request), Ok(limit)) =
            (CpuQuantity::try_from(request), CpuQuantity::try_from(limit))
        {
            if limit < request {
                errors.push(FieldError::invalid(
                    format!("{path}.limits.cpu"),
                    "must be greater than or equal to the cpu request",
                ));
            }
        }
    }
    if let (Some(request), Some(limit)) = (requests.get("memory"), limits.get("memory")) {
        if let (Ok(request), Ok(limit)) = (
            MemoryQuantity::try_from(request),
            MemoryQuantity::try_from(limit),
        ) {
            if limit < request {
                errors.push(FieldError::invalid(
                    format!("{path}.limits.memory"),
                    "must be greater than or equal to the memory request",
                ));
            }
        }
    }
}
