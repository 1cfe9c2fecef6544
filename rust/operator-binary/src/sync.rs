//! Generation label driven create-or-update of child objects.
//!
//! An observed child is current when its `risingwave/generation` label is `nosync` or not
//! lower than the generation of the cluster. Current children are never touched, outdated
//! ones are replaced as a whole by what the factory builds for the current generation.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Debug,
};

use serde::{Serialize, de::DeserializeOwned};
use snafu::{OptionExt, ResultExt, Snafu};
use stackable_operator::{
    client::Client,
    k8s_openapi::{NamespaceResourceScope, apimachinery::pkg::apis::meta::v1::ObjectMeta},
    kube::{
        Api,
        Resource,
        ResourceExt,
        api::{DeleteParams, ListParams, PostParams},
    },
};
use tracing::{debug, info};

use crate::{
    crd::{LABEL_RISINGWAVE_GENERATION, LABEL_RISINGWAVE_GROUP, NO_SYNC},
    factory,
};

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("object {name} defines no namespace"))]
    ObjectHasNoNamespace { name: String },

    #[snafu(display("failed to build {kind} {name}"))]
    BuildObject {
        source: factory::Error,
        kind: String,
        name: String,
    },

    #[snafu(display(
        "refusing to replace {kind} {observed} with {expected}, objects are not the same"
    ))]
    ObjectIdentityMismatch {
        kind: String,
        observed: String,
        expected: String,
    },

    #[snafu(display("failed to list {kind} objects"))]
    ListObjects {
        source: stackable_operator::kube::Error,
        kind: String,
    },

    #[snafu(display("failed to create {kind} {name}"))]
    CreateObject {
        source: stackable_operator::kube::Error,
        kind: String,
        name: String,
    },

    #[snafu(display("failed to update {kind} {name}"))]
    UpdateObject {
        source: stackable_operator::kube::Error,
        kind: String,
        name: String,
    },

    #[snafu(display("failed to delete {kind} {name}"))]
    DeleteObject {
        source: stackable_operator::kube::Error,
        kind: String,
        name: String,
    },
}

impl Error {
    /// Optimistic concurrency failures are retried right away.
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::CreateObject { source, .. }
            | Error::UpdateObject { source, .. }
            | Error::DeleteObject { source, .. } => is_api_error(source, 409),
            _ => false,
        }
    }
}

pub fn is_api_error(error: &stackable_operator::kube::Error, code: u16) -> bool {
    matches!(error, stackable_operator::kube::Error::Api(response) if response.code == code)
}

/// Everything the reconciler creates, updates and deletes.
pub trait ChildObject:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<T> ChildObject for T where
    T: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SyncAction {
    Create,
    Update,
    Skip,
}

/// Unparsable generation labels count as generation zero, so such objects are rewritten.
pub fn is_synced(metadata: &ObjectMeta, generation: i64) -> bool {
    let label = metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(LABEL_RISINGWAVE_GENERATION));
    match label.map(String::as_str) {
        Some(NO_SYNC) => true,
        Some(value) => value.parse::<i64>().unwrap_or(0) >= generation,
        None => false,
    }
}

pub fn sync_action(observed: Option<&ObjectMeta>, generation: i64) -> SyncAction {
    match observed {
        None => SyncAction::Create,
        Some(metadata) if is_synced(metadata, generation) => SyncAction::Skip,
        Some(_) => SyncAction::Update,
    }
}

/// A replacement must keep the namespace and name of the object it replaces.
pub fn ensure_same_object<K: Resource<DynamicType = ()>>(
    observed: &K,
    expected: &K,
) -> Result<(), Error> {
    if observed.name_any() != expected.name_any() || observed.namespace() != expected.namespace()
    {
        return ObjectIdentityMismatchSnafu {
            kind: K::kind(&()).to_string(),
            observed: qualified_name(observed),
            expected: qualified_name(expected),
        }
        .fail();
    }
    Ok(())
}

fn qualified_name<K: Resource>(obj: &K) -> String {
    format!(
        "{}/{}",
        obj.namespace().unwrap_or_default(),
        obj.name_any()
    )
}

fn group_of(metadata: &ObjectMeta) -> String {
    metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(LABEL_RISINGWAVE_GROUP))
        .cloned()
        .unwrap_or_default()
}

/// What has to happen to the workloads of one component.
#[derive(Debug)]
pub struct GroupSyncPlan<K> {
    pub delete: Vec<K>,
    /// Groups to build, with the outdated object they replace if any.
    pub resync: Vec<(String, Option<K>)>,
}

impl<K> GroupSyncPlan<K> {
    /// The pod templates the groups to build refer to.
    pub fn pod_templates<'a>(&self, expected: &'a BTreeMap<String, String>) -> BTreeSet<&'a str> {
        self.resync
            .iter()
            .filter_map(|(group, _)| expected.get(group))
            .map(String::as_str)
            .filter(|template| !template.is_empty())
            .collect()
    }
}

/// Plans the sync of the workloads of one component.
///
/// `expected` maps each group that should exist to its pod template name, or the empty
/// string. Of several objects for the same group only the first one is kept. Objects of
/// groups that are not expected are deleted.
pub fn plan_group_sync<K: Resource>(
    observed: Vec<K>,
    expected: &BTreeMap<String, String>,
    generation: i64,
) -> GroupSyncPlan<K> {
    let mut plan = GroupSyncPlan {
        delete: Vec::new(),
        resync: Vec::new(),
    };
    let mut seen = BTreeSet::new();

    for obj in observed {
        let group = group_of(obj.meta());
        if !seen.insert(group.clone()) {
            plan.delete.push(obj);
            continue;
        }
        if !expected.contains_key(&group) {
            plan.delete.push(obj);
        } else if !is_synced(obj.meta(), generation) {
            plan.resync.push((group, Some(obj)));
        }
    }

    for group in expected.keys() {
        if !seen.contains(group) {
            plan.resync.push((group.clone(), None));
        }
    }
    plan
}

fn api_for<K: ChildObject>(client: &Client, obj: &K) -> Result<Api<K>, Error> {
    let namespace = obj.namespace().context(ObjectHasNoNamespaceSnafu {
        name: obj.name_any(),
    })?;
    Ok(Api::namespaced(client.as_kube_client(), &namespace))
}

pub async fn list_children<K: ChildObject>(
    client: &Client,
    namespace: &str,
    selector: &str,
) -> Result<Vec<K>, Error> {
    let api: Api<K> = Api::namespaced(client.as_kube_client(), namespace);
    Ok(api
        .list(&ListParams::default().labels(selector))
        .await
        .context(ListObjectsSnafu {
            kind: K::kind(&()).to_string(),
        })?
        .items)
}

/// Creates the child if it does not exist, replaces it if it is outdated.
pub async fn sync_object<K: ChildObject>(
    client: &Client,
    observed: Option<&K>,
    generation: i64,
    build: impl FnOnce() -> Result<K, factory::Error>,
) -> Result<SyncAction, Error> {
    let kind = K::kind(&()).to_string();
    let action = sync_action(observed.map(|o| o.meta()), generation);
    if action == SyncAction::Skip {
        return Ok(action);
    }

    let mut expected = build().with_context(|_| BuildObjectSnafu {
        kind: kind.clone(),
        name: observed.map(|o| o.name_any()).unwrap_or_default(),
    })?;
    let name = expected.name_any();
    let api = api_for(client, &expected)?;

    match observed {
        None => {
            info!(kind = %kind, name = %name, "creating object");
            match api.create(&PostParams::default(), &expected).await {
                Err(err) if is_api_error(&err, 409) => {
                    debug!(kind = %kind, name = %name, "object already exists");
                }
                result => {
                    result.context(CreateObjectSnafu { kind, name })?;
                }
            }
        }
        Some(observed) => {
            ensure_same_object(observed, &expected)?;
            expected.meta_mut().resource_version = observed.resource_version();
            info!(kind = %kind, name = %name, generation, "updating object");
            api.replace(&name, &PostParams::default(), &expected)
                .await
                .context(UpdateObjectSnafu { kind, name })?;
        }
    }
    Ok(action)
}

/// Deletes with background propagation. Objects that are already gone are fine.
pub async fn delete_object<K: ChildObject>(client: &Client, obj: &K) -> Result<(), Error> {
    let kind = K::kind(&()).to_string();
    let name = obj.name_any();
    info!(kind = %kind, name = %name, "deleting object");
    match api_for(client, obj)?
        .delete(&name, &DeleteParams::background())
        .await
    {
        Err(err) if is_api_error(&err, 404) => Ok(()),
        result => result.map(|_| ()).context(DeleteObjectSnafu { kind, name }),
    }
}

/// Runs a [`GroupSyncPlan`]: deletes first, then builds every group to resync.
pub async fn sync_group<K: ChildObject>(
    client: &Client,
    plan: GroupSyncPlan<K>,
    generation: i64,
    build: impl Fn(&str) -> Result<K, factory::Error>,
) -> Result<(), Error> {
    for obj in &plan.delete {
        delete_object(client, obj).await?;
    }
    for (group, observed) in &plan.resync {
        sync_object(client, observed.as_ref(), generation, || build(group)).await?;
    }
    Ok(())
}
