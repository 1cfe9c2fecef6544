//! Keeps the lock of every [`RisingWaveScaleView`] on its target and projects the desired
//! replicas of the view onto the groups of the target.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use const_format::concatcp;
use serde_json::json;
use snafu::{OptionExt, ResultExt, Snafu};
use stackable_operator::{
    client::Client,
    kube::{
        Api,
        ResourceExt,
        api::{Patch, PatchParams, PostParams},
        core::{DeserializeGuard, error_boundary},
        runtime::controller::Action,
    },
    logging::controller::ReconcilerError,
};
use strum::{EnumDiscriminants, IntoStaticStr};
use tracing::{debug, info};

use crate::{
    crd::{
        Component, OPERATOR_NAME, RisingWave, RisingWaveScaleView, RisingWaveScaleViewStatus,
        SCALE_VIEW_FINALIZER,
    },
    metrics::OperatorMetrics,
    scale_view::{
        helper::ReplicasHelper,
        lock::{self, ScaleViewLockManager},
        split::{self, split_replicas},
    },
    sync::is_api_error,
};

pub const SCALE_VIEW_CONTROLLER_NAME: &str = "risingwavescaleview";
pub const SCALE_VIEW_FULL_CONTROLLER_NAME: &str =
    concatcp!(SCALE_VIEW_CONTROLLER_NAME, '.', OPERATOR_NAME);

pub struct Ctx {
    pub client: Client,
    pub metrics: OperatorMetrics,
}

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("RisingWaveScaleView object is invalid"))]
    InvalidScaleView {
        source: error_boundary::InvalidObject,
    },

    #[snafu(display("object defines no namespace"))]
    ObjectHasNoNamespace,

    #[snafu(display("failed to get target {name}"))]
    GetTarget {
        source: stackable_operator::kube::Error,
        name: String,
    },

    #[snafu(display("target {name} does not exist"))]
    TargetNotFound { name: String },

    #[snafu(display("failed to lock the target"))]
    GrabLock { source: lock::Error },

    #[snafu(display("failed to split the replicas"))]
    SplitReplicas { source: split::Error },

    #[snafu(display("failed to build the replicas patch"))]
    BuildPatch { source: serde_json::Error },

    #[snafu(display("failed to serialize {name}"))]
    SerializeObject {
        source: serde_json::Error,
        name: String,
    },

    #[snafu(display("failed to update the locks on target {name}"))]
    UpdateTargetStatus {
        source: stackable_operator::kube::Error,
        name: String,
    },

    #[snafu(display("failed to patch the replicas of target {name}"))]
    PatchTarget {
        source: stackable_operator::kube::Error,
        name: String,
    },

    #[snafu(display("failed to update the finalizers of {name}"))]
    UpdateFinalizers {
        source: stackable_operator::kube::Error,
        name: String,
    },

    #[snafu(display("failed to update the status of {name}"))]
    UpdateStatus {
        source: stackable_operator::kube::Error,
        name: String,
    },
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
            // A failing resourceVersion test of a JSON patch is reported as invalid.
            Error::PatchTarget { source, .. } => {
                is_api_error(source, 409) || is_api_error(source, 422)
            }
            Error::UpdateTargetStatus { source, .. }
            | Error::UpdateFinalizers { source, .. }
            | Error::UpdateStatus { source, .. } => is_api_error(source, 409),
            _ => false,
        }
    }
}

/// The finalizers of `obj` with the scale view finalizer added or removed.
pub fn finalizers_with(obj: &RisingWaveScaleView, present: bool) -> Vec<String> {
    let mut finalizers: Vec<String> = obj
        .finalizers()
        .iter()
        .filter(|f| *f != SCALE_VIEW_FINALIZER)
        .cloned()
        .collect();
    if present {
        finalizers.push(SCALE_VIEW_FINALIZER.to_string());
    }
    finalizers
}

/// A JSON patch that writes `split` into the spec of `target`, guarded by the resource
/// version of `target`. `None` if every group already has the expected replicas.
pub fn replicas_patch(
    target: &RisingWave,
    component: Component,
    split: &BTreeMap<String, i32>,
) -> Result<Option<json_patch::Patch>, serde_json::Error> {
    let helper = ReplicasHelper::new(&target.spec, component);
    let mut ops = vec![json!({
        "op": "test",
        "path": "/metadata/resourceVersion",
        "value": target.resource_version().unwrap_or_default(),
    })];
    for (group, replicas) in split {
        if helper.read(group) == Some(*replicas) {
            continue;
        }
        if let Some(path) = helper.json_pointer(group) {
            ops.push(json!({ "op": "add", "path": path, "value": replicas }));
        }
    }
    if ops.len() == 1 {
        return Ok(None);
    }
    serde_json::from_value(serde_json::Value::Array(ops)).map(Some)
}

/// Sum of the running replicas the target reports for the groups of the view.
pub fn running_replicas(target: &RisingWave, scale_view: &RisingWaveScaleView) -> i32 {
    let Some(status) = &target.status else {
        return 0;
    };
    status
        .component_replicas
        .get(scale_view.spec.target_ref.component)
        .groups
        .iter()
        .filter(|g| scale_view.groups().any(|group| group == g.name))
        .map(|g| g.running)
        .sum()
}

fn matches_target(target: &RisingWave, scale_view: &RisingWaveScaleView) -> bool {
    let uid = &scale_view.spec.target_ref.uid;
    uid.is_empty() || target.uid().as_deref() == Some(uid.as_str())
}

struct Apis {
    risingwaves: Api<RisingWave>,
    scale_views: Api<RisingWaveScaleView>,
}

async fn update_finalizers(
    apis: &Apis,
    scale_view: &RisingWaveScaleView,
    present: bool,
) -> Result<()> {
    let name = scale_view.name_any();
    let patch = json!({
        "metadata": {
            "resourceVersion": scale_view.resource_version(),
            "finalizers": finalizers_with(scale_view, present),
        }
    });
    apis.scale_views
        .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .context(UpdateFinalizersSnafu { name })?;
    Ok(())
}

async fn replace_target_status(apis: &Apis, target: &RisingWave) -> Result<()> {
    let name = target.name_any();
    let body = serde_json::to_vec(target).context(SerializeObjectSnafu { name: name.clone() })?;
    apis.risingwaves
        .replace_status(&name, &PostParams::default(), body)
        .await
        .context(UpdateTargetStatusSnafu { name })?;
    Ok(())
}

async fn update_status(
    apis: &Apis,
    scale_view: &RisingWaveScaleView,
    status: RisingWaveScaleViewStatus,
) -> Result<()> {
    if scale_view.status.as_ref() == Some(&status) {
        return Ok(());
    }
    let name = scale_view.name_any();
    let mut draft = scale_view.clone();
    draft.status = Some(status);
    let body = serde_json::to_vec(&draft).context(SerializeObjectSnafu { name: name.clone() })?;
    apis.scale_views
        .replace_status(&name, &PostParams::default(), body)
        .await
        .context(UpdateStatusSnafu { name })?;
    Ok(())
}

/// Releases the lock on the target first, so no unchecked spec update can slip in between
/// dropping the finalizer and releasing the lock.
async fn release_and_remove_finalizer(
    apis: &Apis,
    scale_view: &RisingWaveScaleView,
    target: Option<&RisingWave>,
) -> Result<()> {
    if let Some(target) = target {
        let mut draft = target.clone();
        if ScaleViewLockManager::new(&mut draft).release_lock(scale_view) {
            info!(target = %target.name_any(), "releasing lock");
            replace_target_status(apis, &draft).await?;
        }
    }
    update_finalizers(apis, scale_view, false).await
}

pub async fn reconcile_scale_view(
    scale_view: Arc<DeserializeGuard<RisingWaveScaleView>>,
    ctx: Arc<Ctx>,
) -> Result<Action> {
    tracing::info!("Starting reconcile");
    let scale_view = scale_view
        .0
        .as_ref()
        .map_err(error_boundary::InvalidObject::clone)
        .context(InvalidScaleViewSnafu)?;

    let result = reconcile(scale_view, &ctx.client).await;
    ctx.metrics
        .observe_reconcile(SCALE_VIEW_CONTROLLER_NAME, result.is_ok());
    result
}

async fn reconcile(scale_view: &RisingWaveScaleView, client: &Client) -> Result<Action> {
    let namespace = scale_view.namespace().context(ObjectHasNoNamespaceSnafu)?;
    let apis = Apis {
        risingwaves: Api::namespaced(client.as_kube_client(), &namespace),
        scale_views: Api::namespaced(client.as_kube_client(), &namespace),
    };
    let target_name = &scale_view.spec.target_ref.name;

    let target = apis
        .risingwaves
        .get_opt(target_name)
        .await
        .context(GetTargetSnafu { name: target_name })?
        .filter(|target| matches_target(target, scale_view));

    if scale_view.is_being_deleted() {
        if scale_view.has_finalizer(SCALE_VIEW_FINALIZER) {
            release_and_remove_finalizer(&apis, scale_view, target.as_ref()).await?;
        }
        return Ok(Action::await_change());
    }

    let Some(target) = target else {
        if scale_view.spec.target_ref.uid.is_empty() {
            return TargetNotFoundSnafu { name: target_name }.fail();
        }
        info!(target = %target_name, "target is gone, marking the view as stale");
        update_status(
            &apis,
            scale_view,
            RisingWaveScaleViewStatus {
                replicas: 0,
                locked: false,
            },
        )
        .await?;
        return Ok(Action::await_change());
    };

    if !scale_view.has_finalizer(SCALE_VIEW_FINALIZER) {
        update_finalizers(&apis, scale_view, true).await?;
        return Ok(Action::await_change());
    }

    let mut draft = target.clone();
    let changed = ScaleViewLockManager::new(&mut draft)
        .grab_or_update(scale_view)
        .context(GrabLockSnafu)?;
    if changed {
        debug!(target = %target_name, "lock changed, updating target status");
        replace_target_status(&apis, &draft).await?;
        return Ok(Action::requeue(Duration::ZERO));
    }

    let split = split_replicas(&scale_view.spec).context(SplitReplicasSnafu)?;
    let component = scale_view.spec.target_ref.component;
    if let Some(patch) = replicas_patch(&target, component, &split).context(BuildPatchSnafu)? {
        info!(target = %target_name, component = %component, ?split, "updating replicas");
        apis.risingwaves
            .patch(
                target_name,
                &PatchParams::default(),
                &Patch::Json::<()>(patch),
            )
            .await
            .context(PatchTargetSnafu { name: target_name })?;
    }

    update_status(
        &apis,
        scale_view,
        RisingWaveScaleViewStatus {
            replicas: running_replicas(&target, scale_view),
            locked: true,
        },
    )
    .await?;

    Ok(Action::await_change())
}

pub fn error_policy(
    _obj: Arc<DeserializeGuard<RisingWaveScaleView>>,
    error: &Error,
    _ctx: Arc<Ctx>,
) -> Action {
    match error {
        Error::InvalidScaleView { .. } => Action::await_change(),
        error if error.is_conflict() => Action::requeue(Duration::ZERO),
        _ => Action::requeue(Duration::from_secs(5)),
    }
}
