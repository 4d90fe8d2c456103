//! Shared data structures exchanged between the engine, the shell, and UI layers.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Identifier of a catalog entry, unique within the remote source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(String);

impl EntryId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    General,
    Anime,
    People,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Purity {
    Sfw,
    Sketchy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Latest,
    Popular,
    Random,
    Views,
    Favorites,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Popularity {
    pub views: u64,
    pub favorites: u64,
}

/// One wallpaper as reported by the catalog. Immutable once fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: EntryId,
    pub thumbnail_url: String,
    pub full_url: String,
    pub resolution: Resolution,
    pub category: Category,
    pub purity: Purity,
    pub popularity: Popularity,
    /// Size of the full-resolution file, when the catalog reports it.
    pub file_size: Option<u64>,
    pub file_type: Option<String>,
}

impl CatalogEntry {
    /// File extension used when persisting the full-resolution image.
    pub fn file_extension(&self) -> &str {
        match self.file_type.as_deref() {
            Some("image/png") => "png",
            Some("image/jpeg") | Some("image/jpg") => "jpg",
            Some("image/webp") => "webp",
            Some("image/gif") => "gif",
            _ => url_extension(&self.full_url).unwrap_or("jpg"),
        }
    }
}

pub(crate) fn url_extension(url: &str) -> Option<&str> {
    let path = url.split(['?', '#']).next()?;
    let name = path.rsplit('/').next()?;
    let (_, ext) = name.rsplit_once('.')?;
    if ext.is_empty() || ext.len() > 5 || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext)
}

/// Content filters applied to a query.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Filters {
    pub categories: BTreeSet<Category>,
    pub purity: BTreeSet<Purity>,
}

impl Default for Filters {
    fn default() -> Self {
        Self {
            categories: BTreeSet::from([Category::General]),
            purity: BTreeSet::from([Purity::Sfw]),
        }
    }
}

/// Full parameter set of one feed state. The page cursor is 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct Query {
    pub search: String,
    pub filters: Filters,
    pub sort: SortOrder,
    pub page: u32,
}

impl Default for Query {
    fn default() -> Self {
        Self { search: String::new(), filters: Filters::default(), sort: SortOrder::Latest, page: 1 }
    }
}

impl Query {
    /// Same search, filters, and sort; the page cursor is ignored.
    pub fn same_feed(&self, other: &Query) -> bool {
        self.search == other.search && self.filters == other.filters && self.sort == other.sort
    }

    pub fn with_page(&self, page: u32) -> Self {
        Self { page: page.max(1), ..self.clone() }
    }
}

/// One page of catalog results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub entries: Vec<CatalogEntry>,
    pub query: Query,
    pub has_more: bool,
}

/// Token identifying an in-flight asynchronous request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestToken(u64);

impl RequestToken {
    pub(crate) fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Name of a blob in the asset store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AssetKey {
    name: String,
    extension: String,
}

impl AssetKey {
    pub fn new(name: impl Into<String>, extension: impl Into<String>) -> Self {
        Self { name: name.into(), extension: extension.into() }
    }

    /// Key of the full-resolution image of an entry.
    pub fn full(entry: &CatalogEntry) -> Self {
        Self::new(format!("full::{}", entry.id), entry.file_extension())
    }

    /// Key of the derived thumbnail of an entry.
    pub fn thumbnail(entry: &CatalogEntry) -> Self {
        Self::new(
            format!("thumb::{}", entry.id),
            url_extension(&entry.thumbnail_url).unwrap_or("jpg"),
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }
}

/// Byte budget of the in-memory cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheBudget {
    pub bytes_max: usize,
}

impl Default for CacheBudget {
    fn default() -> Self {
        Self { bytes_max: 200 * 1024 * 1024 }
    }
}
