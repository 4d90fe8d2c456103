//! Wallhaven API v1 search client.

use std::sync::Arc;

use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::CoreError;
use crate::net::{Transport, fetch_bytes};
use crate::types::{
    CatalogEntry, Category, EntryId, Page, Popularity, Purity, Query, Resolution, SortOrder,
};

use super::{CatalogClient, Result};

pub const DEFAULT_BASE_URL: &str = "https://wallhaven.cc/api/v1";

#[derive(Debug, Clone)]
pub struct WallhavenClient {
    transport: Arc<dyn Transport>,
    base_url: String,
    api_key: Option<String>,
}

impl WallhavenClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport, base_url: DEFAULT_BASE_URL.to_string(), api_key: None }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|key| !key.trim().is_empty());
        self
    }

    /// Build the search URL for a query.
    pub fn search_url(&self, query: &Query) -> String {
        let mut url = format!(
            "{}/search?categories={}&purity={}&sorting={}&order=desc&page={}",
            self.base_url,
            category_bits(query),
            purity_bits(query),
            sorting(query.sort),
            query.page.max(1)
        );
        let search = query.search.trim();
        if !search.is_empty() {
            url.push_str("&q=");
            url.extend(utf8_percent_encode(search, NON_ALPHANUMERIC));
        }
        if let Some(key) = &self.api_key {
            url.push_str("&apikey=");
            url.extend(utf8_percent_encode(key, NON_ALPHANUMERIC));
        }
        url
    }
}

impl CatalogClient for WallhavenClient {
    fn fetch_page(&self, query: &Query) -> Result<Page> {
        let url = self.search_url(query);
        debug!(page = query.page, search = %query.search, "fetching catalog page");
        let body = fetch_bytes(self.transport.as_ref(), &url)?;
        parse_page(&body, query)
    }
}

fn category_bits(query: &Query) -> String {
    [Category::General, Category::Anime, Category::People]
        .iter()
        .map(|c| if query.filters.categories.contains(c) { '1' } else { '0' })
        .collect()
}

fn purity_bits(query: &Query) -> String {
    let mut bits: String = [Purity::Sfw, Purity::Sketchy]
        .iter()
        .map(|p| if query.filters.purity.contains(p) { '1' } else { '0' })
        .collect();
    // NSFW requires an authenticated account and is never requested.
    bits.push('0');
    bits
}

fn sorting(order: SortOrder) -> &'static str {
    match order {
        SortOrder::Latest => "date_added",
        SortOrder::Popular => "toplist",
        SortOrder::Random => "random",
        SortOrder::Views => "views",
        SortOrder::Favorites => "favorites",
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    data: Vec<WallpaperJson>,
    meta: Option<MetaJson>,
}

#[derive(Debug, Deserialize)]
struct MetaJson {
    current_page: u32,
    last_page: u32,
}

#[derive(Debug, Deserialize)]
struct WallpaperJson {
    id: String,
    path: String,
    thumbs: ThumbsJson,
    dimension_x: u32,
    dimension_y: u32,
    category: String,
    purity: String,
    #[serde(default)]
    views: u64,
    #[serde(default)]
    favorites: u64,
    file_size: Option<u64>,
    file_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ThumbsJson {
    small: String,
}

/// Decode a search response body into a page for `query`.
pub fn parse_page(body: &[u8], query: &Query) -> Result<Page> {
    let response: SearchResponse = serde_json::from_slice(body)
        .map_err(|err| CoreError::MalformedResponse(format!("search response: {err}")))?;

    let has_more = response.meta.map(|meta| meta.current_page < meta.last_page).unwrap_or(false);

    let mut entries = Vec::with_capacity(response.data.len());
    for item in response.data {
        let category = match item.category.as_str() {
            "general" => Category::General,
            "anime" => Category::Anime,
            "people" => Category::People,
            other => {
                return Err(CoreError::MalformedResponse(format!(
                    "unknown category `{other}` for {}",
                    item.id
                )));
            }
        };
        let purity = match item.purity.as_str() {
            "sfw" => Purity::Sfw,
            "sketchy" => Purity::Sketchy,
            other => {
                warn!(id = %item.id, purity = other, "skipping entry with unsupported purity");
                continue;
            }
        };
        entries.push(CatalogEntry {
            id: EntryId::new(item.id),
            thumbnail_url: item.thumbs.small,
            full_url: item.path,
            resolution: Resolution { width: item.dimension_x, height: item.dimension_y },
            category,
            purity,
            popularity: Popularity { views: item.views, favorites: item.favorites },
            file_size: item.file_size,
            file_type: item.file_type,
        });
    }

    Ok(Page { entries, query: query.clone(), has_more })
}
