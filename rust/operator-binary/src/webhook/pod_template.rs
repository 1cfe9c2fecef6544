use stackable_operator::kube::core::{
    DynamicObject,
    admission::{AdmissionRequest, Operation},
};

use crate::{
    crd::RisingWavePodTemplate,
    webhook::{Denial, DenialReason, FieldError, parse_object},
};

/// Node groups pick up pod templates by name, so a template never changes once created.
pub fn validate(request: &AdmissionRequest<DynamicObject>) -> Result<(), Denial> {
    if !matches!(request.operation, Operation::Update) {
        return Ok(());
    }
    let old: RisingWavePodTemplate = parse_object(request.old_object.as_ref(), "oldObject")?;
    let new: RisingWavePodTemplate = parse_object(request.object.as_ref(), "object")?;
    validate_update(&old, &new)
}

pub fn validate_update(
    old: &RisingWavePodTemplate,
    new: &RisingWavePodTemplate,
) -> Result<(), Denial> {
    if old.spec.template != new.spec.template {
        return Err(Denial::single(
            DenialReason::Forbidden,
            FieldError::forbidden("spec.template", "template is immutable"),
        ));
    }
    Ok(())
}
