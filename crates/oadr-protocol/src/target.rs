//! Event and report targets, in both the flat and the grouped shape.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::types::TargetKind;

/// A single target: one identifier of one kind.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Target {
    pub kind: TargetKind,
    pub id: String,
}

impl Target {
    pub fn new(kind: TargetKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    pub fn ven_id(id: impl Into<String>) -> Self {
        Self::new(TargetKind::VenId, id)
    }

    pub fn group_id(id: impl Into<String>) -> Self {
        Self::new(TargetKind::GroupId, id)
    }

    pub fn resource_id(id: impl Into<String>) -> Self {
        Self::new(TargetKind::ResourceId, id)
    }

    pub fn party_id(id: impl Into<String>) -> Self {
        Self::new(TargetKind::PartyId, id)
    }
}

/// Targets grouped by kind, identifiers kept in insertion order.
pub type TargetsByType = BTreeMap<TargetKind, Vec<String>>;

pub fn group_targets(targets: &[Target]) -> TargetsByType {
    let mut grouped = TargetsByType::new();
    for target in targets {
        grouped
            .entry(target.kind)
            .or_default()
            .push(target.id.clone());
    }
    grouped
}

pub fn ungroup_targets(by_type: &TargetsByType) -> Vec<Target> {
    by_type
        .iter()
        .flat_map(|(kind, ids)| ids.iter().map(move |id| Target::new(*kind, id.clone())))
        .collect()
}

/// Reconciles the two ways targets can be supplied.
///
/// At least one must be present. When both are, they must describe the
/// same grouping, ignoring identifier order within a kind.
pub fn reconcile_targets(
    targets: Option<Vec<Target>>,
    by_type: Option<TargetsByType>,
) -> Result<Vec<Target>, ValidationError> {
    match (targets, by_type) {
        (None, None) => Err(ValidationError::MissingTargets),
        (Some(targets), None) => Ok(targets),
        (None, Some(by_type)) => Ok(ungroup_targets(&by_type)),
        (Some(targets), Some(by_type)) => {
            if normalized(group_targets(&targets)) != normalized(by_type.clone()) {
                return Err(ValidationError::InconsistentTargets {
                    targets: describe(&group_targets(&targets)),
                    by_type: describe(&by_type),
                });
            }
            Ok(targets)
        }
    }
}

fn normalized(mut grouped: TargetsByType) -> TargetsByType {
    grouped.retain(|_, ids| !ids.is_empty());
    for ids in grouped.values_mut() {
        ids.sort();
    }
    grouped
}

fn describe(grouped: &TargetsByType) -> String {
    grouped
        .iter()
        .map(|(kind, ids)| format!("{kind}=[{}]", ids.join(",")))
        .collect::<Vec<_>>()
        .join(" ")
}
