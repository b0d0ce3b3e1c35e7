//! Admission checks for builds.
//!
//! Invalid builds are rejected when written, never clamped.

use thiserror::Error;

use super::BuildSpec;

/// A single rejected field.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Validate a build spec on create or update.
pub fn validate_build_spec(spec: &BuildSpec) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if spec.standing_by > spec.max {
        errors.push(ValidationError::new(
            "spec.standingBy",
            format!("standingBy ({}) must not exceed max ({})", spec.standing_by, spec.max),
        ));
    }

    if spec.template.image.trim().is_empty() {
        errors.push(ValidationError::new("spec.template.image", "image must not be empty"));
    }

    for (i, exposed) in spec.ports_to_expose.iter().enumerate() {
        let field = format!("spec.portsToExpose[{i}]");
        if exposed.is_empty() {
            errors.push(ValidationError::new(field, "ports to expose must have a name"));
            continue;
        }

        let matching: Vec<_> = spec
            .template
            .ports
            .iter()
            .filter(|p| &p.name == exposed)
            .collect();

        if matching.is_empty() && !spec.template.host_network {
            errors.push(ValidationError::new(
                field.clone(),
                format!("no template port named '{exposed}'"),
            ));
        }
        if matching.iter().any(|p| p.host_port.is_some()) {
            errors.push(ValidationError::new(
                field,
                format!("port '{exposed}' must not set a host port"),
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Validate an update of an existing build.
pub fn validate_build_update(old: &BuildSpec, new: &BuildSpec) -> Result<(), Vec<ValidationError>> {
    let mut errors = match validate_build_spec(new) {
        Ok(()) => Vec::new(),
        Err(errors) => errors,
    };
    if old.build_id != new.build_id {
        errors.push(ValidationError::new("spec.buildID", "buildID is immutable"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
