//! HTTP client for a Tiled-style catalog server.
//!
//! Speaks the catalog's REST dialect: `metadata/{path}` for node metadata
//! and array structure, `search/{path}` for listing runs newest-first, and
//! `array/full/{path}?slice={i}` for raw frame bytes. Array structure for a
//! frame node is fetched once and cached per node path; frame reads then
//! cost a single request.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::CatalogError;
use crate::messages::{DType, ImagePayload};

use super::{node_path, RunCatalog, RunInfo};

/// Array structure as reported by the catalog.
#[derive(Clone, Copy, Debug)]
struct ArrayStructure {
    length: u64,
    height: u32,
    width: u32,
    dtype: DType,
}

/// A `RunCatalog` over HTTP.
pub struct HttpCatalog {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    /// Path of the container holding runs, e.g. `["runs"]`.
    root_segments: Vec<String>,
    /// Path of the frame-stream node inside each run; used to enrich
    /// `RunInfo` with the frame structure when the node already exists.
    frame_segments: Vec<String>,
    structures: RwLock<HashMap<String, ArrayStructure>>,
}

impl HttpCatalog {
    /// Build a client for the catalog at `base_url`.
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        root_segments: Vec<String>,
        frame_segments: Vec<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            root_segments,
            frame_segments,
            structures: RwLock::new(HashMap::new()),
        }
    }

    fn url(&self, endpoint: &str, segments: &[&str]) -> String {
        let mut url = format!("{}/api/v1/{endpoint}", self.base_url);
        for segment in self.root_segments.iter().map(String::as_str).chain(segments.iter().copied())
        {
            url.push('/');
            url.push_str(segment);
        }
        url
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response, CatalogError> {
        let mut request = self.client.get(url);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Apikey {key}"));
        }
        Ok(request.send().await?.error_for_status()?)
    }

    async fn get_json(&self, url: &str) -> Result<Value, CatalogError> {
        Ok(self.get(url).await?.json::<Value>().await?)
    }

    /// Fetch (or reuse) the structure of a run's frame node.
    async fn frame_structure(
        &self,
        run_id: &str,
        segments: &[String],
    ) -> Result<ArrayStructure, CatalogError> {
        let path = node_path(run_id, segments);
        // The stack length in the cache goes stale while a run is live, but
        // `frame_count` refreshes it every cycle before frames are read.
        if let Ok(cache) = self.structures.read() {
            if let Some(structure) = cache.get(&path) {
                return Ok(*structure);
            }
        }
        let mut parts: Vec<&str> = vec![run_id];
        parts.extend(segments.iter().map(String::as_str));
        let doc = self.get_json(&self.url("metadata", &parts)).await?;
        let structure = parse_structure(&doc, &path)?;
        if let Ok(mut cache) = self.structures.write() {
            cache.insert(path, structure);
        }
        Ok(structure)
    }

    fn run_info_from_doc(&self, run_id: &str, attributes: &Value) -> RunInfo {
        let metadata = &attributes["metadata"];
        let run_name = metadata["start"]["run_name"]
            .as_str()
            .unwrap_or(run_id)
            .to_string();
        RunInfo {
            run_id: run_id.to_string(),
            run_name,
            uri: self.url("metadata", &[run_id]),
            frame_shape: None,
            data_type: None,
            has_stop: !metadata["stop"].is_null(),
        }
    }

    /// Fill in frame structure when the frame node already exists; a run
    /// observed before its first frame keeps the unknown markers.
    async fn enrich(&self, mut info: RunInfo) -> RunInfo {
        if let Ok(structure) = self.frame_structure(&info.run_id, &self.frame_segments).await {
            info.frame_shape = Some((structure.width, structure.height));
            info.data_type = Some(structure.dtype);
        }
        info
    }
}

#[async_trait]
impl RunCatalog for HttpCatalog {
    async fn most_recent_run(&self) -> Result<Option<RunInfo>, CatalogError> {
        let url = format!("{}?page[limit]=1&sort=-time", self.url("search", &[]));
        let doc = self.get_json(&url).await?;
        let Some(entry) = doc["data"].as_array().and_then(|runs| runs.first()) else {
            return Ok(None);
        };
        let run_id = entry["id"].as_str().ok_or_else(|| CatalogError::MalformedNode {
            node: "search".to_string(),
            reason: "run entry without an id".to_string(),
        })?;
        let info = self.run_info_from_doc(run_id, &entry["attributes"]);
        Ok(Some(self.enrich(info).await))
    }

    async fn run_info(&self, run_id: &str) -> Result<Option<RunInfo>, CatalogError> {
        let doc = match self.get_json(&self.url("metadata", &[run_id])).await {
            Ok(doc) => doc,
            Err(CatalogError::Transport(err))
                if err.status() == Some(reqwest::StatusCode::NOT_FOUND) =>
            {
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        let info = self.run_info_from_doc(run_id, &doc["data"]["attributes"]);
        Ok(Some(self.enrich(info).await))
    }

    async fn frame_count(&self, run_id: &str, segments: &[String]) -> Result<u64, CatalogError> {
        // The stack length changes while a run is live; always refetch.
        let path = node_path(run_id, segments);
        let mut parts: Vec<&str> = vec![run_id];
        parts.extend(segments.iter().map(String::as_str));
        let doc = self.get_json(&self.url("metadata", &parts)).await?;
        let structure = parse_structure(&doc, &path)?;
        if let Ok(mut cache) = self.structures.write() {
            cache.insert(path, structure);
        }
        Ok(structure.length)
    }

    async fn read_frame(
        &self,
        run_id: &str,
        segments: &[String],
        index: u64,
    ) -> Result<ImagePayload, CatalogError> {
        let structure = self.frame_structure(run_id, segments).await?;
        let path = node_path(run_id, segments);
        if index >= structure.length {
            return Err(CatalogError::FrameOutOfRange { node: path, index });
        }
        let mut parts: Vec<&str> = vec![run_id];
        parts.extend(segments.iter().map(String::as_str));
        let url = format!(
            "{}?slice={index}&format=application/octet-stream",
            self.url("array/full", &parts)
        );
        let bytes = self.get(&url).await?.bytes().await?;
        let payload = ImagePayload {
            data: bytes,
            dtype: structure.dtype,
            shape: vec![structure.height, structure.width],
        };
        if !payload.is_well_formed() {
            return Err(CatalogError::MalformedNode {
                node: node_path(run_id, segments),
                reason: format!(
                    "frame byte length {} does not match shape {:?} and dtype {}",
                    payload.data.len(),
                    payload.shape,
                    payload.dtype.as_str()
                ),
            });
        }
        Ok(payload)
    }
}

/// Extract an [`ArrayStructure`] from a node metadata document.
fn parse_structure(doc: &Value, path: &str) -> Result<ArrayStructure, CatalogError> {
    let malformed = |reason: &str| CatalogError::MalformedNode {
        node: path.to_string(),
        reason: reason.to_string(),
    };
    let structure = &doc["data"]["attributes"]["structure"];
    let shape = structure["shape"]
        .as_array()
        .ok_or_else(|| malformed("missing structure.shape"))?;
    if shape.len() != 3 {
        return Err(malformed("frame node is not a 3-D stack"));
    }
    let dims: Vec<u64> = shape.iter().filter_map(Value::as_u64).collect();
    if dims.len() != 3 {
        return Err(malformed("non-integer dimension in structure.shape"));
    }
    let data_type = &structure["data_type"];
    let kind = data_type["kind"].as_str().unwrap_or_default();
    let itemsize = data_type["itemsize"].as_u64().unwrap_or_default();
    let dtype = match (kind, itemsize) {
        ("u", 1) => DType::Uint8,
        ("u", 2) => DType::Uint16,
        ("i", 4) => DType::Int32,
        ("u", 4) => DType::Uint32,
        ("f", 4) => DType::Float32,
        ("f", 8) => DType::Float64,
        _ => return Err(malformed("unsupported element type")),
    };
    if data_type["endianness"].as_str() == Some("big") {
        return Err(malformed("big-endian arrays are not supported"));
    }
    Ok(ArrayStructure {
        length: dims[0],
        height: dims[1] as u32,
        width: dims[2] as u32,
        dtype,
    })
}
