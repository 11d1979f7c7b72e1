use std::fmt::Display;

use crds::{EntandoCustomResource, EntandoKind};
use kube::ResourceExt;

/// Identity of an observed custom resource as it appears in logs, labels and
/// the environment of dispatched controller pods
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct ResourceRef {
    pub(crate) kind: EntandoKind,
    pub(crate) namespace: String,
    pub(crate) name: String,
}

impl ResourceRef {
    pub(crate) fn new(kind: EntandoKind, namespace: &str, name: &str) -> Self {
        Self {
            kind,
            namespace: namespace.to_owned(),
            name: name.to_owned(),
        }
    }

    pub(crate) fn from_resource<K: EntandoCustomResource>(resource: &K) -> Self {
        let namespace = resource.namespace().unwrap_or_else(|| "default".to_owned());
        Self::new(K::KIND, &namespace, &resource.name_any())
    }
}

impl Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}
