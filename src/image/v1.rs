//! V1 image config model and id derivation
//!
//! Schema 1 manifests embed one v1 image config JSON per layer. The
//! reconstructor derives from these: per-layer history entries, the rootfs
//! chain over the layer diff ids, synthetic v1 layer ids, and the final
//! image config whose digest becomes the image id.
//!
//! Id derivation hashes a key-sorted JSON document, so the same inputs
//! always produce the same id; loaders read the ids back from the archive
//! rather than recomputing them.

use crate::digest::{self, Digest};
use crate::error::{PullError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The subset of a v1 image config this pipeline touches. Unknown fields in
/// the original config are dropped from per-layer `json` files, matching
/// what a runtime's own v1 serializer retains.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct V1Image {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parent: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub comment: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub container: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub container_config: Value,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub docker_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub author: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub config: Value,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub architecture: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub os: String,
    #[serde(rename = "Size", default, skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ThrowawayFlag {
    #[serde(default)]
    throwaway: bool,
}

/// Whether a layer's v1 config marks it as a throwaway (history-only) layer
pub fn is_throwaway(v1_json: &str) -> Result<bool> {
    let flag: ThrowawayFlag = serde_json::from_str(v1_json)?;
    Ok(flag.throwaway)
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// One entry of the image config's `history` array
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageHistory {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub author: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub created_by: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub comment: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub empty_layer: bool,
}

/// Build a history entry from a layer's v1 config JSON
pub fn history_from_config(v1_json: &str, empty_layer: bool) -> Result<ImageHistory> {
    let image: V1Image = serde_json::from_str(v1_json)?;
    let created_by = match image.container_config.get("Cmd") {
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| p.as_str())
            .collect::<Vec<_>>()
            .join(" "),
        _ => String::new(),
    };
    Ok(ImageHistory {
        created: image.created,
        author: image.author,
        created_by,
        comment: image.comment,
        empty_layer,
    })
}

/// The accumulated rootfs: ordered diff ids, bottom layer first
#[derive(Debug, Clone, Serialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub fs_type: String,
    pub diff_ids: Vec<Digest>,
}

impl Default for RootFs {
    fn default() -> Self {
        Self::new()
    }
}

impl RootFs {
    pub fn new() -> Self {
        Self {
            fs_type: "layers".to_string(),
            diff_ids: Vec::new(),
        }
    }

    pub fn append(&mut self, diff_id: Digest) {
        self.diff_ids.push(diff_id);
    }

    /// Chain id over the diff ids accumulated so far
    pub fn chain_id(&self) -> Option<Digest> {
        digest::chain_id(&self.diff_ids)
    }
}

/// Derive the synthetic v1 layer id from the layer's v1 config, the rootfs
/// chain id at this layer, and the previous layer's id.
pub fn create_id(
    v1_image: &V1Image,
    chain_id: &Digest,
    parent: Option<&Digest>,
) -> Result<Digest> {
    let mut image = v1_image.clone();
    image.id = String::new();

    let mut config = match serde_json::to_value(&image)? {
        Value::Object(map) => map,
        _ => {
            return Err(PullError::Parse(
                "v1 image config did not serialize to an object".to_string(),
            ));
        }
    };
    config.insert("layer_id".to_string(), Value::String(chain_id.to_string()));
    if let Some(parent) = parent {
        config.insert("parent".to_string(), Value::String(parent.to_string()));
    }

    let bytes = serde_json::to_vec(&Value::Object(config))?;
    Ok(Digest::from_bytes(&bytes))
}

/// Build the final image config from the top layer's v1 config, the
/// completed rootfs, and the accumulated history. Per-layer bookkeeping
/// fields are stripped; `rootfs` and `history` are injected.
pub fn make_config_from_v1_config(
    top_v1_json: &str,
    rootfs: &RootFs,
    history: &[ImageHistory],
) -> Result<Vec<u8>> {
    let mut config: Map<String, Value> = serde_json::from_str(top_v1_json)?;

    for key in ["id", "parent", "Size", "parent_id", "layer_id", "throwaway"] {
        config.remove(key);
    }
    config.insert("rootfs".to_string(), serde_json::to_value(rootfs)?);
    config.insert("history".to_string(), serde_json::to_value(history)?);

    Ok(serde_json::to_vec(&Value::Object(config))?)
}
