//! Resolution of the controller image dispatched for a resource kind
use std::collections::BTreeMap;

use crds::EntandoKind;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{Api, Client};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::ImageConfig;

const RELATED_IMAGE_PREFIX: &str = "RELATED_IMAGE_";

/// `EntandoAppPluginLink` is reconciled by `entando-k8s-app-plugin-link-controller`
pub(crate) fn controller_image_name(kind: EntandoKind) -> String {
    let kind = kind.as_str();
    let kind = kind.strip_prefix("Entando").unwrap_or(kind);
    let mut words = String::with_capacity(kind.len() + 4);
    for (i, c) in kind.char_indices() {
        if c.is_uppercase() && i > 0 {
            words.push('-');
        }
        words.push(c.to_ascii_lowercase());
    }
    format!("entando-k8s-{words}-controller")
}

/// Environment variable carrying a complete image reference for `image_name`
pub(crate) fn related_image_variable(image_name: &str) -> String {
    format!(
        "{RELATED_IMAGE_PREFIX}{}",
        image_name.to_uppercase().replace('-', "_")
    )
}

/// Replace the tag (or digest) of a complete image reference
fn replace_tag(image: &str, version: &str) -> String {
    // a registry port may contain ':', so only look behind the last '/'
    let name_start = image.rfind('/').map_or(0, |i| i + 1);
    let (path, name) = image.split_at(name_start);
    let name = name.split(['@', ':']).next().unwrap_or(name);
    format!("{path}{name}:{version}")
}

/// Per image coordinates as stored in the image info ConfigMap
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub(crate) struct ImageInfo {
    pub(crate) registry: Option<String>,
    pub(crate) organization: Option<String>,
    pub(crate) version: Option<String>,
}

/// Parse every entry of the image info ConfigMap, skipping malformed ones
pub(crate) fn image_info_from_config_map(config_map: &ConfigMap) -> BTreeMap<String, ImageInfo> {
    let Some(data) = config_map.data.as_ref() else {
        return BTreeMap::new();
    };
    data.iter()
        .filter_map(|(image, json)| match serde_json::from_str::<ImageInfo>(json) {
            Ok(info) => Some((image.clone(), info)),
            Err(e) => {
                warn!("Ignoring malformed image info for '{image}': {e}");
                None
            }
        })
        .collect()
}

/// Read the image info ConfigMap. A missing ConfigMap yields no entries.
pub(crate) async fn load_image_info(
    client: Client,
    namespace: &str,
    name: &str,
) -> Result<BTreeMap<String, ImageInfo>, kube::Error> {
    let api: Api<ConfigMap> = Api::namespaced(client, namespace);
    match api.get_opt(name).await? {
        Some(config_map) => Ok(image_info_from_config_map(&config_map)),
        None => {
            debug!("No image info ConfigMap {namespace}/{name}, using environment only");
            Ok(BTreeMap::new())
        }
    }
}

pub(crate) struct ControllerImageResolver {
    config: ImageConfig,
    /// `RELATED_IMAGE_*` entries of the operator environment
    related_images: BTreeMap<String, String>,
    image_info: BTreeMap<String, ImageInfo>,
}

impl ControllerImageResolver {
    pub(crate) fn new(
        config: ImageConfig,
        environment: &BTreeMap<String, String>,
        image_info: BTreeMap<String, ImageInfo>,
    ) -> Self {
        let related_images = environment
            .iter()
            .filter(|(name, _)| name.starts_with(RELATED_IMAGE_PREFIX))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        Self {
            config,
            related_images,
            image_info,
        }
    }

    /// Full image reference of the controller for `kind`.
    /// `version_override` beats every other version source.
    pub(crate) fn resolve(
        &self,
        kind: EntandoKind,
        version_override: Option<&str>,
    ) -> Result<String, ImageResolutionError> {
        let image_name = controller_image_name(kind);
        if let Some(image) = self.related_images.get(&related_image_variable(&image_name)) {
            return Ok(match version_override {
                Some(version) => replace_tag(image, version),
                None => image.clone(),
            });
        }

        let info = self.image_info.get(&image_name).cloned().unwrap_or_default();

        let registry = self
            .config
            .registry_override
            .clone()
            .or(info.registry)
            .unwrap_or_else(|| self.config.registry_fallback.clone());
        let organization = self
            .config
            .organization_override
            .clone()
            .or(info.organization)
            .unwrap_or_else(|| self.config.organization_fallback.clone());
        let version = version_override
            .map(str::to_owned)
            .or_else(|| self.config.version_override.clone())
            .or(info.version)
            .or_else(|| self.config.version_fallback.clone())
            .ok_or(ImageResolutionError::MissingVersion { image: image_name.clone() })?;

        Ok(format!("{registry}/{organization}/{image_name}:{version}"))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum ImageResolutionError {
    #[error("No version configured for image '{image}'")]
    MissingVersion { image: String },
}
