use std::collections::BTreeMap;

/// Label naming the operator instance a resource is meant for
pub(crate) const OPERATOR_ID_LABEL: &str = "entando.org/operator-id";

/// Annotation carrying the operator version which last accepted the resource
pub(crate) const PROCESSED_BY_VERSION_ANNOTATION: &str = "entando.org/processed-by-version";

/// Identity of this operator instance, used to claim resources and to detect
/// resources left behind by the operator version being replaced
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct OperatorIdentity {
    /// Configured operator id. Without one, only unlabelled resources match
    pub(crate) operator_id: Option<String>,
    /// Version of the running operator
    pub(crate) version: String,
    pub(crate) version_to_replace: Option<String>,
}

impl OperatorIdentity {
    pub(crate) fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let label = labels.get(OPERATOR_ID_LABEL).map(String::as_str);
        label == self.operator_id.as_deref()
    }

    /// A resource last processed by the version being replaced must be
    /// reconciled by this version regardless of its generation
    pub(crate) fn requires_upgrade(&self, annotations: &BTreeMap<String, String>) -> bool {
        match (
            self.version_to_replace.as_deref(),
            annotations.get(PROCESSED_BY_VERSION_ANNOTATION),
        ) {
            (Some(to_replace), Some(processed_by)) => processed_by == to_replace,
            _ => false,
        }
    }
}
