//! Named aggregation pipelines loaded from definition files.
//!
//! Each pipeline lives in its own definition file: a JSON array of stage
//! objects, with a comment extension on top of strict JSON. A line whose
//! first non-whitespace character is `/` or `*` is a comment and is dropped
//! before parsing; everything else is passed through verbatim, so a `/`
//! inside a value is never a comment marker.
//!
//! Definitions are loaded once at startup into an ordered, immutable table.
//! A missing or malformed definition aborts the whole load: a pipeline the
//! aggregation entry points may reference must exist before the first call.

use std::fs;
use std::path::Path;

use bson::Document;
use indexmap::IndexMap;
use tracing::{error, info};

use crate::error::{StoreError, StoreResult};

/// Strip comment lines from a pipeline definition.
///
/// Line-oriented and deliberately naive: only the first non-whitespace
/// character of a line can introduce a comment.
pub fn strip_comments(text: &str) -> String {
    text.lines()
        .filter(|line| {
            let trimmed = line.trim_start();
            !trimmed.starts_with('/') && !trimmed.starts_with('*')
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Selector for a named pipeline: by logical name or by load-order index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineKey<'a> {
    /// Logical name the pipeline was loaded under.
    Name(&'a str),
    /// Position in the load order.
    Index(usize),
}

impl<'a> From<&'a str> for PipelineKey<'a> {
    fn from(name: &'a str) -> Self {
        Self::Name(name)
    }
}

impl From<usize> for PipelineKey<'_> {
    fn from(index: usize) -> Self {
        Self::Index(index)
    }
}

/// Immutable table of named aggregation pipelines, in load order.
#[derive(Debug, Clone, Default)]
pub struct PipelineSet {
    pipelines: IndexMap<String, Vec<Document>>,
}

impl PipelineSet {
    /// Load every named pipeline from `dir`.
    ///
    /// Each name maps to `<dir>/<name>.json`. The first missing or malformed
    /// definition fails the entire load; no partial table is retained.
    pub fn load(dir: &Path, names: &[impl AsRef<str>]) -> StoreResult<Self> {
        let mut pipelines = IndexMap::with_capacity(names.len());
        for name in names {
            let name = name.as_ref();
            let path = dir.join(format!("{}.json", name));
            let stages = load_definition(&path).inspect_err(|e| {
                error!(
                    pipeline = %name,
                    path = %path.display(),
                    error = %e,
                    "failed to load pipeline definition"
                );
            })?;
            pipelines.insert(name.to_string(), stages);
        }
        info!(count = pipelines.len(), "pipeline definitions loaded");
        Ok(Self { pipelines })
    }

    /// Resolve a pipeline by name or index.
    pub fn resolve(&self, key: PipelineKey<'_>) -> StoreResult<&[Document]> {
        match key {
            PipelineKey::Name(name) => self.get(name),
            PipelineKey::Index(index) => self.get_index(index),
        }
    }

    /// Look up a pipeline by logical name.
    pub fn get(&self, name: &str) -> StoreResult<&[Document]> {
        self.pipelines
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| StoreError::pipeline(format!("unknown pipeline: {}", name)))
    }

    /// Look up a pipeline by load-order index.
    pub fn get_index(&self, index: usize) -> StoreResult<&[Document]> {
        self.pipelines
            .get_index(index)
            .map(|(_, stages)| stages.as_slice())
            .ok_or_else(|| StoreError::pipeline(format!("no pipeline at index {}", index)))
    }

    /// Number of loaded pipelines.
    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    /// Loaded pipeline names, in load order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.pipelines.keys().map(String::as_str)
    }
}

fn load_definition(path: &Path) -> StoreResult<Vec<Document>> {
    let raw = fs::read_to_string(path)
        .map_err(|e| StoreError::pipeline(format!("{}: {}", path.display(), e)))?;
    parse_definition(&strip_comments(&raw))
        .map_err(|e| StoreError::pipeline(format!("{}: {}", path.display(), e)))
}

fn parse_definition(text: &str) -> Result<Vec<Document>, String> {
    let values: Vec<serde_json::Value> =
        serde_json::from_str(text).map_err(|e| e.to_string())?;
    values
        .iter()
        .map(|value| bson::to_document(value).map_err(|e| e.to_string()))
        .collect()
}
