//! Admission of `RisingWaveScaleView` objects.
//!
//! Creation fills the view from its target: the target uid, the scale policy, the current
//! replicas and the label selector used by the scale subresource. Afterwards the view may only
//! change its replicas and the priorities of its groups.

use std::collections::BTreeMap;

use stackable_operator::{
    client::Client,
    kube::{
        api::Api,
        core::{
            DynamicObject,
            admission::{AdmissionRequest, Operation},
        },
    },
};

use crate::{
    crd::{
        RisingWave, RisingWaveScaleView, RisingWaveScaleViewSpec, ScalePolicy,
        scale_view::scale_view_label_selector,
    },
    scale_view::{helper::ReplicasHelper, lock::ScaleViewLockManager},
    webhook::{Admission, Denial, DenialReason, FieldError, parse_object, spec_patch},
};

pub async fn mutate(client: &Client, request: &AdmissionRequest<DynamicObject>) -> Admission {
    if !matches!(request.operation, Operation::Create) {
        return Ok(None);
    }
    let mut scale_view: RisingWaveScaleView = parse_object(request.object.as_ref(), "object")?;
    let target = fetch_target(client, request, &scale_view).await?;
    default_scale_view(&mut scale_view.spec, target.as_ref())?;

    let spec =
        serde_json::to_value(&scale_view.spec).map_err(|e| Denial::internal(e.to_string()))?;
    spec_patch(request.object.as_ref(), spec)
}

pub async fn validate(
    client: &Client,
    request: &AdmissionRequest<DynamicObject>,
) -> Result<(), Denial> {
    let scale_view: RisingWaveScaleView = match request.operation {
        Operation::Create => parse_object(request.object.as_ref(), "object")?,
        Operation::Update => {
            let old: RisingWaveScaleView =
                parse_object(request.old_object.as_ref(), "oldObject")?;
            let new: RisingWaveScaleView = parse_object(request.object.as_ref(), "object")?;
            validate_update(&old, &new)?;
            new
        }
        _ => return Ok(()),
    };

    let target = fetch_target(client, request, &scale_view).await?;
    validate_create(&scale_view, target.as_ref())
}

async fn fetch_target(
    client: &Client,
    request: &AdmissionRequest<DynamicObject>,
    scale_view: &RisingWaveScaleView,
) -> Result<Option<RisingWave>, Denial> {
    let name = &scale_view.spec.target_ref.name;
    if name.is_empty() {
        return Ok(None);
    }
    let namespace = request
        .namespace
        .as_deref()
        .or(scale_view.metadata.namespace.as_deref())
        .unwrap_or_default();

    Api::<RisingWave>::namespaced(client.as_kube_client(), namespace)
        .get_opt(name)
        .await
        .map_err(|error| Denial::internal(format!("failed to get risingwave {name:?}: {error}")))
}

/// Fills a new scale view from its target.
pub fn default_scale_view(
    spec: &mut RisingWaveScaleViewSpec,
    target: Option<&RisingWave>,
) -> Result<(), Denial> {
    if !spec.target_ref.uid.is_empty() {
        return Err(Denial::single(
            DenialReason::Forbidden,
            FieldError::forbidden("spec.targetRef.uid", "must not be set"),
        ));
    }
    let Some(target) = target else {
        return Err(Denial::single(
            DenialReason::Invalid,
            FieldError::not_found("spec.targetRef.name", "target risingwave not found"),
        ));
    };

    let component = spec.target_ref.component;
    let helper = ReplicasHelper::new(&target.spec, component);
    spec.target_ref.uid = target.metadata.uid.clone().unwrap_or_default();

    if spec.scale_policy.is_empty() {
        spec.scale_policy = helper
            .groups()
            .into_iter()
            .map(|group| ScalePolicy {
                group,
                ..ScalePolicy::default()
            })
            .collect();
    }

    let mut errors = Vec::new();
    let mut replicas = 0;
    for (i, policy) in spec.scale_policy.iter().enumerate() {
        let Some(current) = helper.read(&policy.group) else {
            errors.push(FieldError::not_found(
                format!("spec.scalePolicy[{i}].group"),
                format!("group {:?} not found", policy.group),
            ));
            continue;
        };
        if policy.max_replicas.is_some_and(|max| current > max) {
            errors.push(FieldError::invalid(
                format!("spec.scalePolicy[{i}].maxReplicas"),
                format!("group currently runs {current} replicas, more than allowed"),
            ));
        }
        replicas += current;
    }
    Denial::check(DenialReason::Invalid, errors)?;

    spec.replicas = replicas;
    spec.label_selector = scale_view_label_selector(
        target.metadata.name.as_deref().unwrap_or_default(),
        component,
        spec.scale_policy.iter().map(|p| p.group.as_str()),
    );
    Ok(())
}

pub fn validate_create(
    scale_view: &RisingWaveScaleView,
    target: Option<&RisingWave>,
) -> Result<(), Denial> {
    let spec = &scale_view.spec;
    let mut errors = Vec::new();

    if spec.target_ref.name.is_empty() {
        errors.push(FieldError::required("spec.targetRef.name", "must be set"));
    }
    if spec.target_ref.uid.is_empty() {
        errors.push(FieldError::required("spec.targetRef.uid", "must be set"));
    }
    if spec.scale_policy.is_empty() {
        errors.push(FieldError::required("spec.scalePolicy", "must not be empty"));
    } else if spec.scale_policy.iter().all(|p| p.max_replicas.is_some()) {
        errors.push(FieldError::invalid(
            "spec.scalePolicy",
            "at least one group must have no maxReplicas",
        ));
    }
    match target {
        None if !spec.target_ref.name.is_empty() => errors.push(FieldError::not_found(
            "spec.targetRef.name",
            "target risingwave not found",
        )),
        Some(target)
            if !spec.target_ref.uid.is_empty()
                && target.metadata.uid.as_deref() != Some(spec.target_ref.uid.as_str()) =>
        {
            errors.push(FieldError::invalid(
                "spec.targetRef.uid",
                "does not match the uid of the target",
            ))
        }
        _ => {}
    }
    Denial::check(DenialReason::Invalid, errors)?;

    let Some(target) = target else {
        return Ok(());
    };
    let mut draft = target.clone();
    ScaleViewLockManager::new(&mut draft)
        .grab_or_update(scale_view)
        .map(|_| ())
        .map_err(|error| {
            Denial::single(
                DenialReason::Conflict,
                FieldError::invalid("spec.scalePolicy", error.to_string()),
            )
        })
}

pub fn validate_update(
    old: &RisingWaveScaleView,
    new: &RisingWaveScaleView,
) -> Result<(), Denial> {
    let mut errors = Vec::new();

    if old.spec.target_ref != new.spec.target_ref {
        errors.push(FieldError::forbidden("spec.targetRef", "field is immutable"));
    }
    if old.spec.label_selector != new.spec.label_selector {
        errors.push(FieldError::forbidden(
            "spec.labelSelector",
            "field is immutable",
        ));
    }

    let mut old_groups: Vec<&str> = old.groups().collect();
    let mut new_groups: Vec<&str> = new.groups().collect();
    old_groups.sort_unstable();
    new_groups.sort_unstable();
    if old_groups != new_groups {
        errors.push(FieldError::forbidden(
            "spec.scalePolicy",
            "groups can not be added or removed",
        ));
    }

    let old_limits: BTreeMap<&str, Option<i32>> = old
        .spec
        .scale_policy
        .iter()
        .map(|policy| (policy.group.as_str(), policy.max_replicas))
        .collect();
    for (i, policy) in new.spec.scale_policy.iter().enumerate() {
        if let Some(limit) = old_limits.get(policy.group.as_str()) {
            if *limit != policy.max_replicas {
                errors.push(FieldError::forbidden(
                    format!("spec.scalePolicy[{i}].maxReplicas"),
                    "field is immutable",
                ));
            }
        }
    }

    let locked = old.status.as_ref().is_some_and(|status| status.locked);
    if old.spec.replicas != new.spec.replicas && !locked {
        errors.push(FieldError::forbidden(
            "spec.replicas",
            "can not scale before the lock is grabbed",
        ));
    }

    Denial::check(DenialReason::Forbidden, errors)
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use rstest::rstest;

    use super::*;
    use crate::crd::Component;

    fn target() -> RisingWave {
        serde_yaml::from_str(indoc! {"
            apiVersion: risingwave.risingwavelabs.com/v1alpha1
            kind: RisingWave
            metadata:
              name: rw
              namespace: default
              uid: target-uid
            spec:
              image: risingwave:v1.7.0
              components:
                compute:
                  nodeGroups:
                    - name: a
                      replicas: 2
                    - name: b
                      replicas: 3
            status:
              scaleViews:
                - name: other
                  uid: other-uid
                  component: frontend
                  generation: 1
                  groupLocks:
                    - name: ''
                      replicas: 1
        "})
        .expect("illegal test input")
    }

    fn scale_view(input: &str) -> RisingWaveScaleView {
        serde_yaml::from_str(input).expect("illegal test input")
    }

    #[test]
    fn test_default_scale_view() {
        let mut sv = scale_view(indoc! {"
            apiVersion: risingwave.risingwavelabs.com/v1alpha1
            kind: RisingWaveScaleView
            metadata:
              name: sv
            spec:
              targetRef:
                name: rw
                component: compute
        "});

        default_scale_view(&mut sv.spec, Some(&target())).expect("defaulting succeeds");
        assert_eq!(sv.spec.target_ref.uid, "target-uid");
        assert_eq!(sv.groups().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(sv.spec.replicas, 5);
        assert_eq!(
            sv.spec.label_selector,
            "risingwave/name=rw,risingwave/component=compute,risingwave/group in (a,b)"
        );
    }

    #[test]
    fn test_default_scale_view_ignores_global_replicas() {
        let mut rw = target();
        rw.spec.global =
            Some(serde_yaml::from_str("replicas:\n  compute: 4").expect("illegal test input"));
        let mut sv = scale_view(indoc! {"
            apiVersion: risingwave.risingwavelabs.com/v1alpha1
            kind: RisingWaveScaleView
            metadata:
              name: sv
            spec:
              targetRef:
                name: rw
                component: compute
        "});

        default_scale_view(&mut sv.spec, Some(&rw)).expect("defaulting succeeds");
        assert_eq!(sv.groups().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(sv.spec.replicas, 5);
    }

    #[test]
    fn test_default_scale_view_rejections() {
        let mut sv = scale_view(indoc! {"
            apiVersion: risingwave.risingwavelabs.com/v1alpha1
            kind: RisingWaveScaleView
            metadata:
              name: sv
            spec:
              targetRef:
                name: rw
                component: compute
              scalePolicy:
                - group: a
                  maxReplicas: 1
                - group: missing
        "});

        let denial = default_scale_view(&mut sv.spec.clone(), None).unwrap_err();
        assert_eq!(denial.message(), "spec.targetRef.name: target risingwave not found");

        let denial = default_scale_view(&mut sv.spec, Some(&target())).unwrap_err();
        assert_eq!(denial.reason, DenialReason::Invalid);
        assert_eq!(
            denial
                .errors
                .iter()
                .map(|e| e.path.as_str())
                .collect::<Vec<_>>(),
            vec!["spec.scalePolicy[0].maxReplicas", "spec.scalePolicy[1].group"]
        );

        sv.spec.target_ref.uid = "user-set".to_string();
        let denial = default_scale_view(&mut sv.spec, Some(&target())).unwrap_err();
        assert_eq!(denial.reason, DenialReason::Forbidden);
    }

    fn created() -> RisingWaveScaleView {
        let mut sv = scale_view(indoc! {"
            apiVersion: risingwave.risingwavelabs.com/v1alpha1
            kind: RisingWaveScaleView
            metadata:
              name: sv
              uid: sv-uid
              generation: 1
            spec:
              targetRef:
                name: rw
                component: compute
              scalePolicy:
                - group: a
                  priority: 1
                - group: b
                  maxReplicas: 3
        "});
        default_scale_view(&mut sv.spec, Some(&target())).expect("defaulting succeeds");
        sv
    }

    #[test]
    fn test_validate_create() {
        let sv = created();
        assert_eq!(validate_create(&sv, Some(&target())), Ok(()));

        let denial = validate_create(&sv, None).unwrap_err();
        assert_eq!(denial.message(), "spec.targetRef.name: target risingwave not found");

        let mut other = target();
        other.metadata.uid = Some("recreated".to_string());
        let denial = validate_create(&sv, Some(&other)).unwrap_err();
        assert_eq!(denial.errors[0].path, "spec.targetRef.uid");

        let mut bounded = sv.clone();
        bounded.spec.scale_policy[0].max_replicas = Some(10);
        let denial = validate_create(&bounded, Some(&target())).unwrap_err();
        assert_eq!(denial.errors[0].path, "spec.scalePolicy");
    }

    #[test]
    fn test_validate_create_lock_conflict() {
        let mut sv = created();
        sv.spec.target_ref.component = Component::Frontend;
        sv.spec.scale_policy = vec![ScalePolicy {
            group: String::new(),
            ..ScalePolicy::default()
        }];

        let denial = validate_create(&sv, Some(&target())).unwrap_err();
        assert_eq!(denial.reason, DenialReason::Conflict);
    }

    #[test]
    fn test_validate_update() {
        let old = created();
        assert_eq!(validate_update(&old, &old), Ok(()));

        let mut scaled = old.clone();
        scaled.spec.replicas = 8;
        let denial = validate_update(&old, &scaled).unwrap_err();
        assert_eq!(denial.errors[0].path, "spec.replicas");

        let mut locked = old.clone();
        locked.status = Some(crate::crd::RisingWaveScaleViewStatus {
            replicas: 5,
            locked: true,
        });
        scaled.status = locked.status.clone();
        assert_eq!(validate_update(&locked, &scaled), Ok(()));

        let mut reordered = locked.clone();
        reordered.spec.scale_policy.reverse();
        reordered.spec.scale_policy[0].priority = 7;
        assert_eq!(validate_update(&locked, &reordered), Ok(()));

        let mut changed = locked.clone();
        changed.spec.scale_policy.pop();
        changed.spec.label_selector = String::new();
        let denial = validate_update(&locked, &changed).unwrap_err();
        assert_eq!(denial.reason, DenialReason::Forbidden);
        assert_eq!(
            denial.message(),
            "spec.labelSelector: field is immutable\nspec.scalePolicy: groups can not be added or removed"
        );
    }

    #[rstest]
    #[case::limit_raised(Some(3), Some(100))]
    #[case::limit_dropped(Some(3), None)]
    #[case::limit_added(None, Some(3))]
    fn test_max_replicas_immutable(#[case] before: Option<i32>, #[case] after: Option<i32>) {
        let mut old = created();
        old.spec.scale_policy[1].max_replicas = before;
        let mut new = old.clone();
        new.spec.scale_policy[1].max_replicas = after;
        new.spec.scale_policy[1].priority += 1;

        let denial = validate_update(&old, &new).unwrap_err();
        assert_eq!(denial.reason, DenialReason::Forbidden);
        assert_eq!(
            denial.errors,
            vec![FieldError::forbidden(
                "spec.scalePolicy[1].maxReplicas",
                "field is immutable"
            )]
        );

        // Only the position in the list moves, the limit of the group stays.
        let mut reordered = old.clone();
        reordered.spec.scale_policy.reverse();
        assert_eq!(validate_update(&old, &reordered), Ok(()));
    }
}
