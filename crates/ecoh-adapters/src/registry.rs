//! Endpoint registry: categories, their endpoints and field mappings, loaded
//! from YAML (built-in `endpoints.yaml` or an operator-supplied file).

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use ecoh_core::{Category, CollectionKind, DiscoveryStrategy, EndpointSpec};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::{FieldMapTransform, RecordTransform, TransformSpec};

const BUILTIN_ENDPOINTS: &str = include_str!("../endpoints.yaml");

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointRegistry {
    pub categories: Vec<CategoryEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CategoryEntry {
    pub category: Category,
    pub discovery: DiscoveryStrategy,
    pub endpoints: Vec<EndpointEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointEntry {
    pub name: String,
    pub path: String,
    pub kind: CollectionKind,
    #[serde(default)]
    pub transform: TransformSpec,
}

impl EndpointEntry {
    pub fn collection_name(&self) -> String {
        format!("{}_{}", self.name, self.kind.suffix())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("category {0} is listed more than once")]
    DuplicateCategory(Category),
    #[error("endpoint {name} appears twice in {category}")]
    DuplicateEndpoint { category: Category, name: String },
    #[error("{category} discovery references unknown collection {collection}")]
    UnknownCollection {
        category: Category,
        collection: String,
    },
    #[error("{0} suffix_scan has no suffixes")]
    NoSuffixes(Category),
}

/// One endpoint ready to fetch: resolved URL plus its transform.
#[derive(Clone)]
pub struct PlannedEndpoint {
    pub spec: EndpointSpec,
    pub transform: Arc<dyn RecordTransform>,
}

impl std::fmt::Debug for PlannedEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlannedEndpoint")
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct CategoryPlan {
    pub category: Category,
    pub discovery: DiscoveryStrategy,
    pub endpoints: Vec<PlannedEndpoint>,
}

impl EndpointRegistry {
    pub fn builtin() -> Result<Self> {
        Self::from_yaml_str(BUILTIN_ENDPOINTS).context("parsing built-in endpoints.yaml")
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let registry =
            Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        debug!(
            path = %path.display(),
            endpoints = registry.endpoint_count(),
            "loaded endpoint registry"
        );
        Ok(registry)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text)?;
        registry.validate()?;
        Ok(registry)
    }

    pub fn validate(&self) -> Result<(), RegistryError> {
        let mut categories = HashSet::new();
        for entry in &self.categories {
            if !categories.insert(entry.category) {
                return Err(RegistryError::DuplicateCategory(entry.category));
            }

            let mut names = HashSet::new();
            for endpoint in &entry.endpoints {
                if !names.insert(endpoint.name.as_str()) {
                    return Err(RegistryError::DuplicateEndpoint {
                        category: entry.category,
                        name: endpoint.name.clone(),
                    });
                }
            }

            let collections: HashSet<String> =
                entry.endpoints.iter().map(EndpointEntry::collection_name).collect();
            let referenced: Vec<&String> = match &entry.discovery {
                DiscoveryStrategy::SuffixScan { suffixes } => {
                    if suffixes.is_empty() {
                        return Err(RegistryError::NoSuffixes(entry.category));
                    }
                    Vec::new()
                }
                DiscoveryStrategy::NamedCollections { collections } => collections.iter().collect(),
                DiscoveryStrategy::RegroupLocal { collection } => vec![collection],
            };
            if let Some(missing) = referenced.into_iter().find(|c| !collections.contains(*c)) {
                return Err(RegistryError::UnknownCollection {
                    category: entry.category,
                    collection: missing.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn category(&self, category: Category) -> Option<&CategoryEntry> {
        self.categories.iter().find(|c| c.category == category)
    }

    pub fn endpoint_count(&self) -> usize {
        self.categories.iter().map(|c| c.endpoints.len()).sum()
    }

    /// Resolve every endpoint against `base_url`.
    pub fn plan(&self, base_url: &str) -> Vec<CategoryPlan> {
        let base = base_url.trim_end_matches('/');
        self.categories
            .iter()
            .map(|entry| CategoryPlan {
                category: entry.category,
                discovery: entry.discovery.clone(),
                endpoints: entry
                    .endpoints
                    .iter()
                    .map(|endpoint| PlannedEndpoint {
                        spec: EndpointSpec {
                            name: endpoint.name.clone(),
                            url: format!("{base}/{}", endpoint.path.trim_start_matches('/')),
                            kind: endpoint.kind,
                        },
                        transform: Arc::new(FieldMapTransform::new(endpoint.transform.clone())),
                    })
                    .collect(),
            })
            .collect()
    }
}
