//! Decides whether a received resource event warrants reconciliation.
//!
//! The decision is a pure function of a [GateInput] snapshot so it can be
//! reasoned about and tested without a cluster. Acting on the decision
//! (stripping a FORCE instruction, updating the cache) is left to the observer.

use crds::EntandoCustomResource;
use kube::ResourceExt;
use thiserror::Error;

use super::{
    identity::OperatorIdentity, instruction::ProcessingInstruction, WatchAction,
};

/// Kind of the aggregate whose components are reconciled through it
pub(crate) const COMPOSITE_APP_KIND: &str = "EntandoCompositeApp";

/// Everything the gate looks at, extracted from one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct GateInput {
    pub(crate) action: WatchAction,
    pub(crate) incoming_version: u64,
    /// resourceVersion of the last accepted snapshot of the same UID
    pub(crate) cached_version: Option<u64>,
    pub(crate) generation: Option<i64>,
    pub(crate) observed_generation: Option<i64>,
    pub(crate) owned_by_composite_app: bool,
    pub(crate) matches_operator: bool,
    pub(crate) requires_upgrade: bool,
    pub(crate) instruction: ProcessingInstruction,
}

impl GateInput {
    pub(crate) fn from_resource<K: EntandoCustomResource>(
        action: WatchAction,
        resource: &K,
        cached_version: Option<&str>,
        identity: &OperatorIdentity,
    ) -> Result<Self, ResourceVersionError> {
        let incoming_version = parse_resource_version(resource.resource_version().as_deref())?;
        let cached_version = cached_version
            .map(|version| parse_resource_version(Some(version)))
            .transpose()?;
        Ok(Self {
            action,
            incoming_version,
            cached_version,
            generation: resource.meta().generation,
            observed_generation: resource.observed_generation(),
            owned_by_composite_app: resource
                .owner_references()
                .iter()
                .any(|owner| owner.kind == COMPOSITE_APP_KIND),
            matches_operator: identity.matches(resource.labels()),
            requires_upgrade: identity.requires_upgrade(resource.annotations()),
            instruction: ProcessingInstruction::from_annotations(resource.annotations()),
        })
    }
}

/// Kubernetes documents resourceVersion as opaque, the staleness check
/// nevertheless compares it numerically
pub(crate) fn parse_resource_version(version: Option<&str>) -> Result<u64, ResourceVersionError> {
    let version = version.ok_or(ResourceVersionError::Missing)?;
    version
        .parse()
        .map_err(|_| ResourceVersionError::NotNumeric(version.to_owned()))
}

#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum ResourceVersionError {
    #[error("Resource has no resourceVersion")]
    Missing,
    #[error("resourceVersion '{0}' is not numeric")]
    NotNumeric(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GateDecision {
    Accept(AcceptReason),
    Reject(RejectReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AcceptReason {
    /// Last processed by the operator version being replaced
    RequiresUpgrade,
    /// FORCE instruction present, the annotation must be removed
    Forced,
    GenerationChanged,
    /// Deletion of a tracked resource, only the cache is affected
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RejectReason {
    /// Not newer than the last accepted snapshot
    Duplicate,
    OwnedByCompositeApp,
    ForeignOperator,
    Deferred,
    Ignored,
    GenerationUnchanged,
}

pub(crate) fn evaluate(input: &GateInput) -> GateDecision {
    if input.requires_upgrade {
        if input.action == WatchAction::Deleted {
            return GateDecision::Accept(AcceptReason::Deleted);
        }
        return GateDecision::Accept(AcceptReason::RequiresUpgrade);
    }
    if input
        .cached_version
        .is_some_and(|cached| cached >= input.incoming_version)
    {
        return GateDecision::Reject(RejectReason::Duplicate);
    }
    if input.owned_by_composite_app {
        return GateDecision::Reject(RejectReason::OwnedByCompositeApp);
    }
    if !input.matches_operator {
        return GateDecision::Reject(RejectReason::ForeignOperator);
    }
    // a deletion carries no spec change to gate on
    if input.action == WatchAction::Deleted {
        return GateDecision::Accept(AcceptReason::Deleted);
    }
    match input.instruction {
        ProcessingInstruction::Force => GateDecision::Accept(AcceptReason::Forced),
        ProcessingInstruction::Defer => GateDecision::Reject(RejectReason::Deferred),
        ProcessingInstruction::Ignore => GateDecision::Reject(RejectReason::Ignored),
        ProcessingInstruction::None => match (input.observed_generation, input.generation) {
            (Some(observed), Some(generation)) if observed >= generation => {
                GateDecision::Reject(RejectReason::GenerationUnchanged)
            }
            _ => GateDecision::Accept(AcceptReason::GenerationChanged),
        },
    }
}
