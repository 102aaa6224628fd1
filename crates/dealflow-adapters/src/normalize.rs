//! Raw search result → `CanonicalListing`.

use chrono::{DateTime, Utc};
use dealflow_core::{CanonicalListing, ListingStatus, RawListing};
use dealflow_storage::sha256_hex;
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

use crate::{SITE_ORIGIN, SOURCE_KEY, SOURCE_NAME};

const SLUG_MAX_CHARS: usize = 100;
const META_DESCRIPTION_MAX_CHARS: usize = 160;

/// Source fields that land in canonical columns; everything else is kept
/// verbatim under `custom_fields.bizbuysell`.
const MAPPED_FIELDS: &[&str] = &[
    "listNumber",
    "urlStub",
    "header",
    "description",
    "location",
    "price",
    "grossSales",
    "cashFlow",
    "ebitda",
    "img",
    "category",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("listing is not a JSON object")]
    NotAnObject,
    #[error("field `{field}` should be {expected}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
    },
    #[error("listing has no listNumber, urlStub or header to derive an id from")]
    MissingIdentity,
}

/// Stable primary key: SHA-256 over `"{listNumber}--{urlStub}--{title}"`.
pub fn listing_id(list_number: &str, url_stub: &str, title: &str) -> String {
    sha256_hex(format!("{list_number}--{url_stub}--{title}").as_bytes())
}

/// Lower-cased, runs of non `[a-z0-9]` collapsed to `-`, trimmed, then cut
/// to 100 characters.
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut pending_separator = false;
    for c in title.to_lowercase().chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            if pending_separator && !slug.is_empty() {
                slug.push('-');
            }
            pending_separator = false;
            slug.push(c);
        } else {
            pending_separator = true;
        }
    }
    slug.chars().take(SLUG_MAX_CHARS).collect()
}

/// Currency amount from a JSON number or a formatted string like
/// `"$1,234.50"`. Unparseable input is `None`, never an error. Zero is the
/// source's "not disclosed" marker and is also `None`.
pub fn parse_financial(value: Option<&JsonValue>) -> Option<f64> {
    let amount = match value? {
        JsonValue::Number(n) => n.as_f64()?,
        JsonValue::String(s) => {
            let cleaned: String = s
                .chars()
                .filter(|c| !matches!(c, '$' | '€' | '£' | ',') && !c.is_whitespace())
                .collect();
            if cleaned.is_empty() {
                return None;
            }
            cleaned.parse::<f64>().ok()?
        }
        _ => return None,
    };
    (amount.is_finite() && amount != 0.0).then_some(amount)
}

/// `"City, ST"` → (`City`, `ST`). Without a comma the whole string is the
/// city. Text after a second comma is dropped.
pub fn split_location(location: &str) -> (Option<String>, Option<String>) {
    let location = location.trim();
    if location.is_empty() {
        return (None, None);
    }
    match location.split_once(',') {
        Some((city, rest)) => {
            let state = rest.split(',').next().unwrap_or_default();
            (non_empty(city), non_empty(state))
        }
        None => (Some(location.to_string()), None),
    }
}

pub fn first_image(value: Option<&JsonValue>) -> Option<String> {
    match value? {
        JsonValue::Array(items) => items.first()?.as_str().and_then(non_empty),
        JsonValue::String(url) => non_empty(url),
        _ => None,
    }
}

fn non_empty(text: &str) -> Option<String> {
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

fn optional_str<'a>(
    raw: &'a RawListing,
    field: &'static str,
) -> Result<Option<&'a str>, NormalizeError> {
    match raw.field(field) {
        None => Ok(None),
        Some(JsonValue::String(s)) => Ok(Some(s.as_str())),
        Some(_) => Err(NormalizeError::WrongType {
            field,
            expected: "a string",
        }),
    }
}

fn external_url(url_stub: &str) -> String {
    if url_stub.starts_with("http") {
        url_stub.to_string()
    } else {
        format!("{SITE_ORIGIN}{url_stub}")
    }
}

/// Maps raw listings of one run onto the canonical schema. Holds the vertical
/// and the run's observation time so that `normalize` is a pure function.
#[derive(Debug, Clone)]
pub struct Normalizer {
    vertical_slug: String,
    observed_at: DateTime<Utc>,
}

impl Normalizer {
    pub fn new(vertical_slug: impl Into<String>, observed_at: DateTime<Utc>) -> Self {
        Self {
            vertical_slug: vertical_slug.into(),
            observed_at,
        }
    }

    pub fn normalize(&self, raw: &RawListing) -> Result<CanonicalListing, NormalizeError> {
        let object = raw.as_value().as_object().ok_or(NormalizeError::NotAnObject)?;

        let title = optional_str(raw, "header")?.unwrap_or_default();
        let url_stub = optional_str(raw, "urlStub")?.unwrap_or_default();
        let description = optional_str(raw, "description")?;
        let list_number = raw.field_text("listNumber");
        if list_number.is_empty() && url_stub.is_empty() && title.is_empty() {
            return Err(NormalizeError::MissingIdentity);
        }

        let (city, state) = raw
            .str_field("location")
            .map(split_location)
            .unwrap_or((None, None));
        let cash_flow = parse_financial(raw.field("cashFlow"));
        let description = description.filter(|d| !d.is_empty());

        Ok(CanonicalListing {
            id: listing_id(&list_number, url_stub, title),
            vertical_slug: self.vertical_slug.clone(),
            title: title.to_string(),
            slug: slugify(title),
            description: description.map(str::to_string),
            city,
            state,
            country: "US".to_string(),
            zip_code: None,
            asking_price: parse_financial(raw.field("price")),
            revenue: parse_financial(raw.field("grossSales")),
            sde: cash_flow,
            ebitda: parse_financial(raw.field("ebitda")),
            cash_flow,
            category: raw.str_field("category").and_then(non_empty),
            status: ListingStatus::Pending,
            source: SOURCE_NAME.to_string(),
            external_id: list_number.clone(),
            external_url: external_url(url_stub),
            images: first_image(raw.field("img")).into_iter().collect(),
            documents: Vec::new(),
            meta_title: title.to_string(),
            meta_description: description
                .map(|d| d.chars().take(META_DESCRIPTION_MAX_CHARS).collect()),
            custom_fields: custom_fields(object, &list_number, url_stub),
            created_at: self.observed_at,
            updated_at: self.observed_at,
        })
    }
}

fn custom_fields(object: &Map<String, JsonValue>, list_number: &str, url_stub: &str) -> JsonValue {
    let mut extra: Map<String, JsonValue> = object
        .iter()
        .filter(|(key, _)| !MAPPED_FIELDS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    extra.insert("list_number".into(), JsonValue::from(list_number));
    extra.insert("url_stub".into(), JsonValue::from(url_stub));

    let mut fields = Map::new();
    fields.insert(SOURCE_KEY.into(), JsonValue::Object(extra));
    JsonValue::Object(fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn observed_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 8, 30, 0).single().unwrap()
    }

    fn sample() -> RawListing {
        RawListing::new(json!({
            "listNumber": 2245871,
            "urlStub": "/business-opportunity/commercial-cleaning-company/2245871/",
            "header": "Profitable Commercial Cleaning Company",
            "description": "Turnkey janitorial business with recurring contracts.",
            "location": "Dallas, TX",
            "price": "$1,250,000",
            "grossSales": 2100000,
            "cashFlow": "$410,500.75",
            "ebitda": "N/A",
            "img": ["https://images.example.com/a.jpg", "https://images.example.com/b.jpg"],
            "category": "Cleaning Businesses",
            "brokerCompany": "Sunbelt",
            "hotProperty": "true",
            "region": "Texas"
        }))
    }

    #[test]
    fn financial_values_parse_from_text_and_numbers() {
        assert_eq!(parse_financial(Some(&json!("$1,234.50"))), Some(1234.50));
        assert_eq!(parse_financial(Some(&json!(500000))), Some(500000.0));
        assert_eq!(parse_financial(Some(&json!(" € 12 000 "))), Some(12000.0));
        assert_eq!(parse_financial(Some(&json!(""))), None);
        assert_eq!(parse_financial(Some(&JsonValue::Null)), None);
        assert_eq!(parse_financial(None), None);
        assert_eq!(parse_financial(Some(&json!("N/A"))), None);
        assert_eq!(parse_financial(Some(&json!("inf"))), None);
        assert_eq!(parse_financial(Some(&json!(0))), None);
        assert_eq!(parse_financial(Some(&json!(true))), None);
        assert_eq!(parse_financial(Some(&json!([1]))), None);
    }

    #[test]
    fn slug_collapses_punctuation_runs() {
        assert_eq!(slugify("ABC Cleaning & Co.!!"), "abc-cleaning-co");
        assert_eq!(slugify("  --Maid 2 Order--  "), "maid-2-order");
        assert_eq!(slugify("Café Crème"), "caf-cr-me");
        assert_eq!(slugify("!!!"), "");
        assert_eq!(slugify(&"a".repeat(150)).len(), 100);
    }

    #[test]
    fn location_splits_on_first_comma() {
        assert_eq!(
            split_location("Dallas, TX"),
            (Some("Dallas".into()), Some("TX".into()))
        );
        assert_eq!(split_location("Remote"), (Some("Remote".into()), None));
        assert_eq!(
            split_location("Austin, TX, USA"),
            (Some("Austin".into()), Some("TX".into()))
        );
        assert_eq!(split_location("Ohio, "), (Some("Ohio".into()), None));
        assert_eq!(split_location("   "), (None, None));
    }

    #[test]
    fn image_takes_first_element_or_plain_string() {
        assert_eq!(first_image(Some(&json!(["a.jpg", "b.jpg"]))), Some("a.jpg".into()));
        assert_eq!(first_image(Some(&json!("c.jpg"))), Some("c.jpg".into()));
        assert_eq!(first_image(Some(&json!([]))), None);
        assert_eq!(first_image(Some(&json!(""))), None);
        assert_eq!(first_image(Some(&json!({"url": "x"}))), None);
        assert_eq!(first_image(None), None);
    }

    #[test]
    fn normalizes_full_listing() {
        let normalizer = Normalizer::new("cleaning", observed_at());
        let listing = normalizer.normalize(&sample()).expect("normalize");

        assert_eq!(
            listing.id,
            listing_id(
                "2245871",
                "/business-opportunity/commercial-cleaning-company/2245871/",
                "Profitable Commercial Cleaning Company"
            )
        );
        assert_eq!(listing.id.len(), 64);
        assert_eq!(listing.vertical_slug, "cleaning");
        assert_eq!(listing.slug, "profitable-commercial-cleaning-company");
        assert_eq!(listing.city.as_deref(), Some("Dallas"));
        assert_eq!(listing.state.as_deref(), Some("TX"));
        assert_eq!(listing.country, "US");
        assert_eq!(listing.asking_price, Some(1_250_000.0));
        assert_eq!(listing.revenue, Some(2_100_000.0));
        assert_eq!(listing.sde, Some(410_500.75));
        assert_eq!(listing.cash_flow, listing.sde);
        assert_eq!(listing.ebitda, None);
        assert_eq!(listing.status, ListingStatus::Pending);
        assert_eq!(listing.external_id, "2245871");
        assert_eq!(
            listing.external_url,
            "https://www.bizbuysell.com/business-opportunity/commercial-cleaning-company/2245871/"
        );
        assert_eq!(listing.images, vec!["https://images.example.com/a.jpg".to_string()]);
        assert!(listing.documents.is_empty());
        assert_eq!(listing.meta_title, listing.title);
        assert_eq!(listing.created_at, observed_at());

        let extra = &listing.custom_fields["bizbuysell"];
        assert_eq!(extra["brokerCompany"], "Sunbelt");
        assert_eq!(extra["hotProperty"], "true");
        assert_eq!(extra["region"], "Texas");
        assert_eq!(extra["list_number"], "2245871");
        assert!(extra.get("header").is_none());
    }

    #[test]
    fn normalization_is_pure_and_idempotent() {
        let normalizer = Normalizer::new("cleaning", observed_at());
        let first = normalizer.normalize(&sample()).expect("first");
        let second = normalizer.normalize(&sample()).expect("second");
        assert_eq!(first, second);

        let later = Normalizer::new("cleaning", observed_at() + chrono::Duration::days(1));
        assert_eq!(later.normalize(&sample()).expect("later").id, first.id);
    }

    #[test]
    fn meta_description_is_truncated() {
        let raw = RawListing::new(json!({"header": "Maids", "description": "x".repeat(400)}));
        let listing = Normalizer::new("cleaning", observed_at()).normalize(&raw).expect("normalize");
        assert_eq!(listing.meta_description.map(|d| d.len()), Some(160));
        assert_eq!(listing.description.map(|d| d.len()), Some(400));
    }

    #[test]
    fn absolute_url_stub_is_kept() {
        let raw = RawListing::new(json!({"header": "Maids", "urlStub": "https://partner.example.com/l/1"}));
        let listing = Normalizer::new("cleaning", observed_at()).normalize(&raw).expect("normalize");
        assert_eq!(listing.external_url, "https://partner.example.com/l/1");
        assert_eq!(listing.city, None);
        assert_eq!(listing.external_id, "");
    }

    #[test]
    fn malformed_listings_are_rejected() {
        let normalizer = Normalizer::new("cleaning", observed_at());
        assert_eq!(
            normalizer.normalize(&RawListing::new(json!(["not", "an", "object"]))),
            Err(NormalizeError::NotAnObject)
        );
        assert_eq!(
            normalizer.normalize(&RawListing::new(json!({"header": 42}))),
            Err(NormalizeError::WrongType { field: "header", expected: "a string" })
        );
        assert_eq!(
            normalizer.normalize(&RawListing::new(json!({"price": "$10"}))),
            Err(NormalizeError::MissingIdentity)
        );
    }
}
