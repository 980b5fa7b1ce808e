//! Facet dimension configuration and ordinal translation.
//!
//! Before a document reaches the writer, each of its facet fields is turned
//! into one or more category paths, every path is assigned an ordinal by the
//! taxonomy writer, and the ordinals are stored in [`FACET_ORDINALS_FIELD`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::data::{DataValue, Document};
use crate::error::{Result, ShardError};
use crate::index::taxonomy::DirectoryTaxonomyWriter;

/// Field that receives the ordinals of a document's categories.
pub const FACET_ORDINALS_FIELD: &str = "$facets";

/// How values of one facet dimension become category paths.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimConfig {
    /// A list value is one path (`["2024", "05"]` → `dim/2024/05`).
    #[serde(default)]
    pub hierarchical: bool,
    /// A list value is several single-level paths.
    #[serde(default)]
    pub multi_valued: bool,
}

/// Facet dimensions of an index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FacetsConfig {
    #[serde(default)]
    dims: BTreeMap<String, DimConfig>,
}

impl FacetsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_dim(mut self, dim: impl Into<String>, config: DimConfig) -> Self {
        self.dims.insert(dim.into(), config);
        self
    }

    pub fn set_hierarchical(&mut self, dim: &str, hierarchical: bool) {
        self.dims.entry(dim.to_string()).or_default().hierarchical = hierarchical;
    }

    pub fn set_multi_valued(&mut self, dim: &str, multi_valued: bool) {
        self.dims.entry(dim.to_string()).or_default().multi_valued = multi_valued;
    }

    pub fn dim_config(&self, dim: &str) -> Option<DimConfig> {
        self.dims.get(dim).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.dims.is_empty()
    }

    /// Category paths for the value of facet field `dim`.
    fn paths(&self, dim: &str, config: DimConfig, value: &DataValue) -> Result<Vec<Vec<String>>> {
        let single = |label: &str| vec![dim.to_string(), label.to_string()];
        match value {
            DataValue::Text(label) | DataValue::String(label) => Ok(vec![single(label.as_str())]),
            DataValue::List(items) if items.is_empty() => Err(ShardError::invalid_argument(
                format!("facet dimension \"{dim}\" has an empty value"),
            )),
            DataValue::List(items) if config.hierarchical => {
                let mut path = Vec::with_capacity(items.len() + 1);
                path.push(dim.to_string());
                path.extend(items.iter().cloned());
                Ok(vec![path])
            }
            DataValue::List(items) if items.len() == 1 || config.multi_valued => {
                Ok(items.iter().map(|item| single(item.as_str())).collect())
            }
            DataValue::List(_) => Err(ShardError::invalid_argument(format!(
                "facet dimension \"{dim}\" is not multi-valued"
            ))),
            other => Err(ShardError::invalid_argument(format!(
                "facet dimension \"{dim}\" cannot hold {other:?}"
            ))),
        }
    }

    /// Translate the facet fields of `doc` into ordinals.
    ///
    /// Documents without facet fields are returned unchanged.
    pub fn build(&self, taxonomy: &DirectoryTaxonomyWriter, mut doc: Document) -> Result<Document> {
        if doc.has_field(FACET_ORDINALS_FIELD) {
            return Err(ShardError::invalid_argument(format!(
                "field name \"{FACET_ORDINALS_FIELD}\" is reserved"
            )));
        }
        let mut ordinals = Vec::new();
        for (dim, config) in &self.dims {
            let Some(value) = doc.get(dim) else {
                continue;
            };
            for path in self.paths(dim, *config, value)? {
                ordinals.push(taxonomy.add_category(&path)?);
            }
        }
        if ordinals.is_empty() {
            return Ok(doc);
        }
        ordinals.sort_unstable();
        ordinals.dedup();
        doc.fields
            .insert(FACET_ORDINALS_FIELD.to_string(), DataValue::Ordinals(ordinals));
        Ok(doc)
    }
}
