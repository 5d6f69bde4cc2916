//! Material definitions.
//!
//! A material container carries everything in its metadata and has an empty
//! payload: the effect (pipeline) it is drawn with, the texture assets bound to
//! each slot, free-form properties and how it blends.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::container::{AssetContainer, AssetType};
use crate::error::AssetResult;

/// Content version of material containers.
pub const MATERIAL_CONTENT_VERSION: u16 = 1;

/// How a material blends with what is behind it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TransparencyMode {
    #[default]
    Opaque,
    /// Alpha blended.
    Transparent,
    /// Alpha tested.
    Masked,
}

impl TransparencyMode {
    /// Metadata string, absent for opaque materials.
    pub fn as_metadata(self) -> Option<&'static str> {
        match self {
            TransparencyMode::Opaque => None,
            TransparencyMode::Transparent => Some("transparent"),
            TransparencyMode::Masked => Some("masked"),
        }
    }

    /// Unknown strings read as opaque.
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some("transparent") => TransparencyMode::Transparent,
            Some("masked") => TransparencyMode::Masked,
            _ => TransparencyMode::Opaque,
        }
    }
}

impl fmt::Display for TransparencyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_metadata().unwrap_or("opaque"))
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MaterialMetadata {
    base_effect: String,
    #[serde(default)]
    textures: BTreeMap<String, String>,
    #[serde(default)]
    custom_properties: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    transparency: Option<String>,
}

/// A material as stored in a `.mat` container.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MaterialInfo {
    /// Name of the effect the material is drawn with.
    pub base_effect: String,
    /// Texture slot name to texture asset path.
    pub textures: BTreeMap<String, String>,
    pub custom_properties: BTreeMap<String, String>,
    pub transparency: TransparencyMode,
}

impl MaterialInfo {
    pub fn new(base_effect: impl Into<String>) -> Self {
        Self {
            base_effect: base_effect.into(),
            ..Default::default()
        }
    }

    /// Builder-style texture slot assignment.
    pub fn with_texture(mut self, slot: impl Into<String>, path: impl Into<String>) -> Self {
        self.textures.insert(slot.into(), path.into());
        self
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_properties.insert(name.into(), value.into());
        self
    }

    pub fn with_transparency(mut self, transparency: TransparencyMode) -> Self {
        self.transparency = transparency;
        self
    }

    #[inline]
    pub fn texture(&self, slot: &str) -> Option<&str> {
        self.textures.get(slot).map(String::as_str)
    }

    /// Parses material metadata.
    ///
    /// # Errors
    ///
    /// Fails if the container is not a material, has an unsupported content
    /// version, or the metadata lacks `baseEffect`.
    pub fn read(container: &AssetContainer) -> AssetResult<Self> {
        container.expect(AssetType::MATERIAL, MATERIAL_CONTENT_VERSION)?;
        let meta: MaterialMetadata = serde_json::from_str(container.metadata())?;

        Ok(Self {
            base_effect: meta.base_effect,
            textures: meta.textures,
            custom_properties: meta.custom_properties,
            transparency: TransparencyMode::parse(meta.transparency.as_deref()),
        })
    }

    /// Loads a `.mat` file.
    pub fn load(path: &Path) -> AssetResult<Self> {
        Self::read(&AssetContainer::load(path)?)
    }
}

/// Packs a material into a container with an empty payload.
pub fn pack_material(info: &MaterialInfo) -> AssetResult<AssetContainer> {
    let meta = MaterialMetadata {
        base_effect: info.base_effect.clone(),
        textures: info.textures.clone(),
        custom_properties: info.custom_properties.clone(),
        transparency: info.transparency.as_metadata().map(str::to_owned),
    };

    debug!(
        "Packed material with effect '{}' ({} textures, {})",
        info.base_effect,
        info.textures.len(),
        info.transparency
    );

    Ok(AssetContainer::new(
        AssetType::MATERIAL,
        MATERIAL_CONTENT_VERSION,
        serde_json::to_string(&meta)?,
        Vec::new(),
    ))
}
