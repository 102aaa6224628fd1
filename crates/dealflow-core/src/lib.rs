//! Core domain model for dealflow: verticals, raw source listings and the
//! canonical persisted listing shape.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "dealflow-core";

const BUILTIN_VERTICALS_YAML: &str = include_str!("../../../verticals.yaml");

/// One tenant's industry slice of the shared listings feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerticalDefinition {
    pub slug: String,
    pub name: String,
    pub domain: String,
    pub include_keywords: Vec<String>,
    pub exclude_keywords: Vec<String>,
    #[serde(default)]
    pub source_categories: Vec<String>,
}

impl VerticalDefinition {
    /// Case-insensitive keyword match. Any exclude hit rejects the text even
    /// when include keywords also match.
    pub fn matches_text(&self, text: &str) -> bool {
        let haystack = text.to_lowercase();
        if self
            .exclude_keywords
            .iter()
            .any(|needle| haystack.contains(&needle.to_lowercase()))
        {
            return false;
        }
        self.include_keywords
            .iter()
            .any(|needle| haystack.contains(&needle.to_lowercase()))
    }
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("reading vertical catalog {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing vertical catalog: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("vertical catalog defines no verticals")]
    Empty,
    #[error("vertical slug must not be empty")]
    EmptySlug,
    #[error("vertical `{0}` is defined more than once")]
    DuplicateSlug(String),
    #[error("vertical `{0}` has no include keywords")]
    NoIncludeKeywords(String),
    #[error("vertical `{0}` contains a blank keyword")]
    BlankKeyword(String),
    #[error("unknown vertical `{slug}` (configured: {known})")]
    UnknownVertical { slug: String, known: String },
}

#[derive(Debug, Clone, Deserialize)]
struct CatalogFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    verticals: Vec<VerticalDefinition>,
}

/// Read-only registry of vertical definitions, loaded once at startup and
/// handed to whatever needs it.
#[derive(Debug, Clone)]
pub struct VerticalCatalog {
    verticals: BTreeMap<String, VerticalDefinition>,
}

impl VerticalCatalog {
    /// The catalog compiled into the binary from `verticals.yaml`.
    pub fn builtin() -> Result<Self, CatalogError> {
        Self::from_yaml_str(BUILTIN_VERTICALS_YAML)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, CatalogError> {
        let file: CatalogFile = serde_yaml::from_str(text)?;
        Self::from_definitions(file.verticals)
    }

    pub fn from_definitions(
        definitions: impl IntoIterator<Item = VerticalDefinition>,
    ) -> Result<Self, CatalogError> {
        let mut verticals = BTreeMap::new();
        for definition in definitions {
            let slug = definition.slug.trim().to_string();
            if slug.is_empty() {
                return Err(CatalogError::EmptySlug);
            }
            if definition.include_keywords.is_empty() {
                return Err(CatalogError::NoIncludeKeywords(slug));
            }
            // A blank needle is a substring of every text.
            if definition
                .include_keywords
                .iter()
                .chain(&definition.exclude_keywords)
                .any(|k| k.trim().is_empty())
            {
                return Err(CatalogError::BlankKeyword(slug));
            }
            if verticals.contains_key(&slug) {
                return Err(CatalogError::DuplicateSlug(slug));
            }
            verticals.insert(slug.clone(), VerticalDefinition { slug, ..definition });
        }
        if verticals.is_empty() {
            return Err(CatalogError::Empty);
        }
        Ok(Self { verticals })
    }

    pub fn get(&self, slug: &str) -> Option<&VerticalDefinition> {
        self.verticals.get(slug)
    }

    pub fn require(&self, slug: &str) -> Result<&VerticalDefinition, CatalogError> {
        self.get(slug).ok_or_else(|| CatalogError::UnknownVertical {
            slug: slug.to_string(),
            known: self.slugs().collect::<Vec<_>>().join(", "),
        })
    }

    pub fn slugs(&self) -> impl Iterator<Item = &str> {
        self.verticals.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &VerticalDefinition> {
        self.verticals.values()
    }

    pub fn len(&self) -> usize {
        self.verticals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.verticals.is_empty()
    }
}

/// Intra-run deduplication key: `"{urlStub}--{header}"`. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListingIdentity(String);

impl ListingIdentity {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ListingIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One search-result document exactly as the source API returned it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawListing(JsonValue);

impl RawListing {
    pub fn new(value: JsonValue) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &JsonValue {
        &self.0
    }

    pub fn into_value(self) -> JsonValue {
        self.0
    }

    /// Field lookup that treats explicit `null` the same as a missing key.
    pub fn field(&self, name: &str) -> Option<&JsonValue> {
        self.0.get(name).filter(|v| !v.is_null())
    }

    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.field(name).and_then(JsonValue::as_str)
    }

    /// Field rendered as text; strings verbatim, numbers and booleans via
    /// their JSON form, missing/null as the empty string.
    pub fn field_text(&self, name: &str) -> String {
        match self.field(name) {
            None => String::new(),
            Some(JsonValue::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        }
    }

    pub fn identity(&self) -> ListingIdentity {
        ListingIdentity(format!(
            "{}--{}",
            self.field_text("urlStub"),
            self.field_text("header")
        ))
    }
}

impl From<JsonValue> for RawListing {
    fn from(value: JsonValue) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListingStatus {
    #[default]
    Pending,
}

impl ListingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
        }
    }
}

/// Canonical persisted listing shared by every vertical.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalListing {
    /// SHA-256 hex over list number, URL stub and title; stable across runs.
    pub id: String,
    pub vertical_slug: String,
    pub title: String,
    pub slug: String,
    pub description: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: String,
    pub zip_code: Option<String>,
    pub asking_price: Option<f64>,
    pub revenue: Option<f64>,
    pub sde: Option<f64>,
    pub ebitda: Option<f64>,
    pub cash_flow: Option<f64>,
    pub category: Option<String>,
    pub status: ListingStatus,
    pub source: String,
    pub external_id: String,
    pub external_url: String,
    pub images: Vec<String>,
    pub documents: Vec<String>,
    pub meta_title: String,
    pub meta_description: Option<String>,
    pub custom_fields: JsonValue,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Counters accumulated over one run and reported in the final summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub total_found: usize,
    pub matched: usize,
    pub filtered_out: usize,
    pub persisted: usize,
    pub new_listings: usize,
    pub updated_listings: usize,
    pub errors: usize,
}
