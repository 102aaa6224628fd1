//! Source adapter contracts + the BizBuySell search API adapter.

pub mod normalize;

use std::time::Duration;

use async_trait::async_trait;
use dealflow_core::{RawListing, VerticalDefinition};
use dealflow_storage::{FetchError, FetchedResponse, HttpClientConfig, HttpFetcher};
use reqwest::header::{HeaderMap, SET_COOKIE};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

pub use normalize::{
    first_image, listing_id, parse_financial, slugify, split_location, NormalizeError, Normalizer,
};

pub const CRATE_NAME: &str = "dealflow-adapters";

pub const SOURCE_NAME: &str = "BizBuySell";
pub const SOURCE_KEY: &str = "bizbuysell";
pub const SITE_ORIGIN: &str = "https://www.bizbuysell.com";

const TOKEN_PAGE_URL: &str = "https://www.bizbuysell.com/businesses-for-sale/new-york-ny/";
const SEARCH_API_URL: &str = "https://api.bizbuysell.com/bff/v2/BbsBfsSearchResults";
const TOKEN_COOKIE: &str = "_track_tkn";

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/135.0.0.0 Safari/537.36";

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("token request failed: {0}")]
    Request(#[from] FetchError),
    #[error("token response carried no `{0}` cookie")]
    MissingToken(&'static str),
    #[error("no credential configured: {0}")]
    NotConfigured(String),
}

#[derive(Debug, Error)]
pub enum PageFetchError {
    #[error("page {page}: {source}")]
    Http {
        page: u32,
        #[source]
        source: FetchError,
    },
    #[error("page {page}: malformed body (status {status}): {reason}")]
    MalformedBody { page: u32, status: u16, reason: String },
    #[error("page {page}: no response within {after:?}")]
    Timeout { page: u32, after: Duration },
}

impl PageFetchError {
    pub fn page(&self) -> u32 {
        match self {
            Self::Http { page, .. }
            | Self::MalformedBody { page, .. }
            | Self::Timeout { page, .. } => *page,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { source, .. } => source.status(),
            Self::MalformedBody { status, .. } => Some(*status),
            Self::Timeout { .. } => None,
        }
    }
}

/// Supplies the bearer token every search request needs.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn bearer_token(&self) -> Result<String, CredentialError>;
}

/// Issues one paginated search request.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(&self, page: u32, token: &str) -> Result<Vec<RawListing>, PageFetchError>;
}

/// Token supplied out of band (`DEALFLOW_API_TOKEN`).
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticTokenProvider {
    async fn bearer_token(&self) -> Result<String, CredentialError> {
        let token = self.token.trim();
        if token.is_empty() {
            return Err(CredentialError::NotConfigured("static token is empty".into()));
        }
        Ok(token.to_string())
    }
}

/// Case-insensitive keyword filter for one vertical.
#[derive(Debug, Clone, Copy)]
pub struct VerticalFilter<'a> {
    definition: &'a VerticalDefinition,
}

impl<'a> VerticalFilter<'a> {
    pub fn new(definition: &'a VerticalDefinition) -> Self {
        Self { definition }
    }

    pub fn definition(&self) -> &'a VerticalDefinition {
        self.definition
    }

    /// Title, description and category joined the way the match sees them.
    pub fn search_text(raw: &RawListing) -> String {
        format!(
            "{} {} {}",
            raw.str_field("header").unwrap_or_default(),
            raw.str_field("description").unwrap_or_default(),
            raw.str_field("category").unwrap_or_default()
        )
    }

    pub fn matches(&self, raw: &RawListing) -> bool {
        self.definition.matches_text(&Self::search_text(raw))
    }
}

pub fn browser_headers(correlation_id: Uuid) -> Vec<(String, String)> {
    [
        ("Accept", "application/json, text/plain, */*".to_string()),
        ("Accept-Language", "en-US,en;q=0.9".to_string()),
        ("Sec-Ch-Ua", "\"Chromium\";v=\"135\", \"Not-A.Brand\";v=\"8\"".to_string()),
        ("Sec-Ch-Ua-Mobile", "?0".to_string()),
        ("Sec-Ch-Ua-Platform", "\"Windows\"".to_string()),
        ("Sec-Fetch-Site", "same-site".to_string()),
        ("Sec-Fetch-Mode", "cors".to_string()),
        ("Sec-Fetch-Dest", "empty".to_string()),
        ("Origin", SITE_ORIGIN.to_string()),
        ("Referer", format!("{SITE_ORIGIN}/")),
        ("X-Correlation-Id", correlation_id.to_string()),
    ]
    .into_iter()
    .map(|(name, value)| (name.to_string(), value))
    .collect()
}

/// Fresh search body for one page. Every call builds its own value so
/// concurrent fetches never share request state.
pub fn search_payload(page: u32) -> JsonValue {
    json!({
        "bfsSearchCriteria": {
            "siteId": 20,
            "languageId": 10,
            "categories": null,
            "locations": null,
            "excludeLocations": null,
            "askingPriceMax": 0,
            "askingPriceMin": 0,
            "pageNumber": page,
            "keyword": null,
            "cashFlowMin": 0,
            "cashFlowMax": 0,
            "grossIncomeMin": 0,
            "grossIncomeMax": 0,
            "daysListedAgo": 60,
            "establishedAfterYear": 0,
            "listingsWithNoAskingPrice": 0,
            "homeBasedListings": 0,
            "includeRealEstateForLease": 0,
            "listingsWithSellerFinancing": 0,
            "realEstateIncluded": 0,
            "showRelocatableListings": false,
            "relatedFranchises": 0,
            "listingTypeIds": null,
            "designationTypeIds": null,
            "sortList": null,
            "absenteeOwnerListings": 0,
            "seoSearchType": null
        }
    })
}

#[derive(Debug, Deserialize)]
struct SearchEnvelope {
    #[serde(default)]
    value: Option<SearchValue>,
}

#[derive(Debug, Deserialize)]
struct SearchValue {
    #[serde(rename = "bfsSearchResult", default)]
    bfs_search_result: Option<SearchResultPage>,
}

#[derive(Debug, Deserialize)]
struct SearchResultPage {
    #[serde(default)]
    value: Option<Vec<JsonValue>>,
}

/// Listings at `value.bfsSearchResult.value`; a missing path is an empty page.
pub fn parse_search_response(
    page: u32,
    status: u16,
    body: &[u8],
) -> Result<Vec<RawListing>, PageFetchError> {
    let envelope: SearchEnvelope =
        serde_json::from_slice(body).map_err(|err| PageFetchError::MalformedBody {
            page,
            status,
            reason: err.to_string(),
        })?;
    let listings = envelope
        .value
        .and_then(|v| v.bfs_search_result)
        .and_then(|r| r.value)
        .unwrap_or_default();
    Ok(listings.into_iter().map(RawListing::new).collect())
}

/// First `Set-Cookie` value for `name`, ignoring attributes.
pub fn extract_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .filter_map(|cookie| cookie.split(';').next())
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| key.trim() == name)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// HTTP adapter for the BizBuySell search API. Acts as both the credential
/// provider (tracking cookie from the public site) and the page fetcher.
#[derive(Debug, Clone)]
pub struct BizBuySellClient {
    http: HttpFetcher,
    run_id: Uuid,
}

impl BizBuySellClient {
    pub fn new(mut config: HttpClientConfig, run_id: Uuid) -> anyhow::Result<Self> {
        if config.user_agent.is_none() {
            config.user_agent = Some(DEFAULT_USER_AGENT.to_string());
        }
        config.default_headers.extend(browser_headers(run_id));
        Ok(Self {
            http: HttpFetcher::new(config)?,
            run_id,
        })
    }
}

/// The landing page may answer with an error status and still set the
/// tracking cookie; the cookie wins. The status only matters when it is absent.
fn token_from_response(resp: &FetchedResponse) -> Result<String, CredentialError> {
    if let Some(token) = extract_cookie(&resp.headers, TOKEN_COOKIE) {
        return Ok(token);
    }
    if !resp.status.is_success() {
        return Err(CredentialError::Request(FetchError::HttpStatus {
            status: resp.status.as_u16(),
            url: resp.final_url.clone(),
        }));
    }
    Err(CredentialError::MissingToken(TOKEN_COOKIE))
}

#[async_trait]
impl CredentialProvider for BizBuySellClient {
    async fn bearer_token(&self) -> Result<String, CredentialError> {
        info!(run_id = %self.run_id, "requesting BizBuySell tracking token");
        let resp = self.http.get_any_status(self.run_id, TOKEN_PAGE_URL).await?;
        let token = token_from_response(&resp)?;
        info!(run_id = %self.run_id, "tracking token obtained");
        Ok(token)
    }
}

#[async_trait]
impl PageFetcher for BizBuySellClient {
    async fn fetch_page(&self, page: u32, token: &str) -> Result<Vec<RawListing>, PageFetchError> {
        let payload = search_payload(page);
        let resp = self
            .http
            .post_json(self.run_id, SEARCH_API_URL, Some(token), &payload)
            .await
            .map_err(|source| PageFetchError::Http { page, source })?;
        let listings = parse_search_response(page, resp.status.as_u16(), &resp.body)?;
        debug!(run_id = %self.run_id, page, count = listings.len(), "fetched search page");
        Ok(listings)
    }
}
