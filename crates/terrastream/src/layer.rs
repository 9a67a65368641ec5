//! Layer descriptors and the layer registry.
//!
//! A layer is one named raster channel (heightmap, normal map, imagery) with
//! its own URL template and cache namespace. Layers are registered once at
//! startup; afterwards only the enabled flag and token may change.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::tile::TileKey;

/// Conventional name of the elevation layer.
pub const HEIGHTMAP: &str = "heightmap";
/// Conventional name of the normal-map layer.
pub const NORMAL: &str = "normal";
/// Conventional name of the imagery layer.
pub const IMAGERY: &str = "imagery";

/// Public terrarium elevation tiles.
const TERRARIUM_URL: &str = "https://s3.amazonaws.com/elevation-tiles-prod/terrarium/{z}/{x}/{y}.png";

/// Highest zoom at which the public terrarium set is served.
const TERRARIUM_MAX_ZOOM: u8 = 15;

/// How a layer authenticates its requests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LayerAuth {
    /// No credentials required.
    #[default]
    Public,
    /// Requests carry a bearer token that expires and must be refreshed.
    Token {
        /// Initial token, if one was provisioned ahead of time.
        #[serde(default)]
        token: Option<String>,
        /// Endpoint returning a fresh token.
        refresh_url: String,
        /// Token lifetime assumed when the refresh response does not state one.
        #[serde(
            rename = "refresh_interval_secs",
            deserialize_with = "crate::config::deserialize_secs"
        )]
        refresh_interval: Duration,
    },
}

/// Static description of one tile layer.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LayerDescriptor {
    /// Layer name, also used as the disk cache namespace.
    pub layer_type: String,
    /// URL with `{x}`, `{y}`, `{z}` and optionally `{token}` placeholders.
    pub url_template: String,
    /// File extension of the payload, without a dot.
    pub extension: String,
    /// Queue priority; higher values are fetched first.
    #[serde(default)]
    pub priority: i32,
    /// Whether requests for this layer are accepted.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Deepest zoom the endpoint serves. Finer tiles are composited from
    /// this zoom.
    #[serde(default)]
    pub max_native_zoom: Option<u8>,
    /// Authentication scheme.
    #[serde(default)]
    pub auth: LayerAuth,
}

fn default_enabled() -> bool {
    true
}

impl LayerDescriptor {
    /// Create a public, enabled layer with priority 0.
    #[must_use]
    pub fn new(
        layer_type: impl Into<String>,
        url_template: impl Into<String>,
        extension: impl Into<String>,
    ) -> Self {
        Self {
            layer_type: layer_type.into(),
            url_template: url_template.into(),
            extension: extension.into(),
            priority: 0,
            enabled: true,
            max_native_zoom: None,
            auth: LayerAuth::Public,
        }
    }

    /// The public terrarium elevation layer.
    #[must_use]
    pub fn terrarium() -> Self {
        Self::new(HEIGHTMAP, TERRARIUM_URL, "png")
            .with_priority(10)
            .with_max_native_zoom(TERRARIUM_MAX_ZOOM)
    }

    /// Set the queue priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the deepest zoom the endpoint serves.
    #[must_use]
    pub fn with_max_native_zoom(mut self, zoom: u8) -> Self {
        self.max_native_zoom = Some(zoom);
        self
    }

    /// Require a refreshable bearer token.
    #[must_use]
    pub fn with_token_auth(
        mut self,
        token: Option<String>,
        refresh_url: impl Into<String>,
        refresh_interval: Duration,
    ) -> Self {
        self.auth = LayerAuth::Token {
            token,
            refresh_url: refresh_url.into(),
            refresh_interval,
        };
        self
    }

    /// Whether requests must carry a token.
    #[must_use]
    pub fn requires_token(&self) -> bool {
        matches!(self.auth, LayerAuth::Token { .. })
    }

    /// Whether the payload is an image rather than an opaque blob.
    #[must_use]
    pub fn is_raster(&self) -> bool {
        matches!(
            self.extension.to_ascii_lowercase().as_str(),
            "png" | "jpg" | "jpeg" | "webp"
        )
    }

    /// Zoom at which tiles for `zoom` are actually fetched.
    #[must_use]
    pub fn source_zoom(&self, zoom: u8) -> u8 {
        self.max_native_zoom.map_or(zoom, |max| zoom.min(max))
    }

    /// Substitute the tile coordinates and token into the URL template.
    #[must_use]
    pub fn resolve_url(&self, key: TileKey, token: Option<&str>) -> String {
        let url = self
            .url_template
            .replace("{x}", &key.x.to_string())
            .replace("{y}", &key.y.to_string())
            .replace("{z}", &key.zoom.to_string());
        match token {
            Some(token) => url.replace("{token}", &urlencoding::encode(token)),
            None => url,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.layer_type.is_empty()
            || self
                .layer_type
                .contains(|c: char| c == '/' || c == '\\' || c == '.')
        {
            return Err(Error::Config {
                context: "layer name",
                detail: format!("'{}' is not a valid cache namespace", self.layer_type),
            });
        }
        for placeholder in ["{x}", "{y}", "{z}"] {
            if !self.url_template.contains(placeholder) {
                return Err(Error::Config {
                    context: "url template",
                    detail: format!(
                        "layer '{}' template is missing {placeholder}",
                        self.layer_type
                    ),
                });
            }
        }
        if self.extension.is_empty() || self.extension.contains(['/', '.']) {
            return Err(Error::Config {
                context: "layer extension",
                detail: format!("'{}' is not a valid extension", self.extension),
            });
        }
        Ok(())
    }
}

/// The set of registered layers.
#[derive(Debug, Clone, Default)]
pub struct LayerRegistry {
    layers: HashMap<String, Arc<LayerDescriptor>>,
    /// Registration order, for stable iteration.
    order: Vec<String>,
}

impl LayerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from a list of descriptors.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an invalid or duplicate layer.
    pub fn from_layers(layers: impl IntoIterator<Item = LayerDescriptor>) -> Result<Self> {
        let mut registry = Self::new();
        for layer in layers {
            registry.register(layer)?;
        }
        Ok(registry)
    }

    /// Register a layer.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an invalid or duplicate layer.
    pub fn register(&mut self, layer: LayerDescriptor) -> Result<()> {
        layer.validate()?;
        if self.layers.contains_key(&layer.layer_type) {
            return Err(Error::Config {
                context: "layer registry",
                detail: format!("layer '{}' registered twice", layer.layer_type),
            });
        }
        self.order.push(layer.layer_type.clone());
        self.layers
            .insert(layer.layer_type.clone(), Arc::new(layer));
        Ok(())
    }

    /// Look up a layer regardless of its enabled flag.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownLayer`] if the layer was never registered.
    pub fn get(&self, layer: &str) -> Result<&Arc<LayerDescriptor>> {
        self.layers
            .get(layer)
            .ok_or_else(|| Error::UnknownLayer(layer.to_string()))
    }

    /// Look up a layer that is currently enabled.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownLayer`] or [`Error::LayerDisabled`].
    pub fn get_enabled(&self, layer: &str) -> Result<&Arc<LayerDescriptor>> {
        let descriptor = self.get(layer)?;
        if descriptor.enabled {
            Ok(descriptor)
        } else {
            Err(Error::LayerDisabled(layer.to_string()))
        }
    }

    /// Enable or disable a layer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownLayer`] if the layer was never registered.
    pub fn set_enabled(&mut self, layer: &str, enabled: bool) -> Result<()> {
        let descriptor = self
            .layers
            .get_mut(layer)
            .ok_or_else(|| Error::UnknownLayer(layer.to_string()))?;
        if descriptor.enabled != enabled {
            Arc::make_mut(descriptor).enabled = enabled;
        }
        Ok(())
    }

    /// Layers in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<LayerDescriptor>> {
        self.order.iter().filter_map(|name| self.layers.get(name))
    }

    /// Number of registered layers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Whether no layers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_url() {
        let layer = LayerDescriptor::new("heightmap", "https://tiles/{z}/{x}/{y}.png", "png");
        let url = layer.resolve_url(TileKey::new(5, 7, 12), None);
        assert_eq!(url, "https://tiles/12/5/7.png");
    }

    #[test]
    fn test_resolve_url_encodes_token() {
        let layer = LayerDescriptor::new(
            "imagery",
            "https://tiles/{z}/{x}/{y}.jpg?access_token={token}",
            "jpg",
        );
        let url = layer.resolve_url(TileKey::new(1, 2, 3), Some("a b&c"));
        assert_eq!(url, "https://tiles/3/1/2.jpg?access_token=a%20b%26c");
    }

    #[test]
    fn test_source_zoom() {
        let layer = LayerDescriptor::terrarium();
        assert_eq!(layer.source_zoom(12), 12);
        assert_eq!(layer.source_zoom(18), 15);
        let unbounded = LayerDescriptor::new("x", "{z}/{x}/{y}", "bin");
        assert_eq!(unbounded.source_zoom(20), 20);
        assert!(!unbounded.is_raster());
        assert!(layer.is_raster());
    }

    #[test]
    fn test_registry_rejects_duplicates_and_bad_templates() {
        let mut registry = LayerRegistry::new();
        registry.register(LayerDescriptor::terrarium()).unwrap();
        assert!(matches!(
            registry.register(LayerDescriptor::terrarium()),
            Err(Error::Config { .. })
        ));
        assert!(matches!(
            registry.register(LayerDescriptor::new("normal", "https://tiles/{z}/{x}", "png")),
            Err(Error::Config { .. })
        ));
        assert!(matches!(
            registry.register(LayerDescriptor::new("../etc", "{z}/{x}/{y}", "png")),
            Err(Error::Config { .. })
        ));
    }

    #[test]
    fn test_registry_enable_flag() {
        let mut registry = LayerRegistry::from_layers([LayerDescriptor::terrarium()]).unwrap();
        assert!(registry.get_enabled(HEIGHTMAP).is_ok());
        registry.set_enabled(HEIGHTMAP, false).unwrap();
        assert!(matches!(
            registry.get_enabled(HEIGHTMAP),
            Err(Error::LayerDisabled(_))
        ));
        assert!(matches!(
            registry.get(IMAGERY),
            Err(Error::UnknownLayer(_))
        ));
        assert!(registry.set_enabled(IMAGERY, true).is_err());
    }

    #[test]
    fn test_deserialize_token_layer() {
        let json = r#"{
            "layer_type": "imagery",
            "url_template": "https://tiles/{z}/{x}/{y}.jpg?t={token}",
            "extension": "jpg",
            "priority": 5,
            "auth": {
                "kind": "token",
                "refresh_url": "https://auth/token",
                "refresh_interval_secs": 600
            }
        }"#;
        let layer: LayerDescriptor = serde_json::from_str(json).unwrap();
        assert!(layer.enabled);
        assert!(layer.requires_token());
        assert_eq!(
            layer.auth,
            LayerAuth::Token {
                token: None,
                refresh_url: "https://auth/token".to_string(),
                refresh_interval: Duration::from_secs(600),
            }
        );
    }

    #[test]
    fn test_deserialize_public_default() {
        let json = r#"{
            "layer_type": "normal",
            "url_template": "https://tiles/{z}/{x}/{y}.png",
            "extension": "png"
        }"#;
        let layer: LayerDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(layer.auth, LayerAuth::Public);
        assert_eq!(layer.priority, 0);
        assert_eq!(layer.max_native_zoom, None);
    }
}
