use std::collections::BTreeMap;

/// Annotation through which users steer reconciliation of a single resource
pub(crate) const PROCESSING_INSTRUCTION_ANNOTATION: &str = "entando.org/processing-instruction";

/// Reconciliation control read from [PROCESSING_INSTRUCTION_ANNOTATION]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum ProcessingInstruction {
    /// Reconcile when the generation changed
    #[default]
    None,
    /// Reconcile unconditionally, then remove the annotation
    Force,
    Defer,
    Ignore,
}

impl ProcessingInstruction {
    pub(crate) fn from_annotations(annotations: &BTreeMap<String, String>) -> Self {
        annotations
            .get(PROCESSING_INSTRUCTION_ANNOTATION)
            .map_or(ProcessingInstruction::None, |value| Self::parse(value))
    }

    /// Unknown values read as [ProcessingInstruction::None]
    fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "force" => ProcessingInstruction::Force,
            "defer" => ProcessingInstruction::Defer,
            "ignore" => ProcessingInstruction::Ignore,
            _ => ProcessingInstruction::None,
        }
    }
}
