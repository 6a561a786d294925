use std::collections::BTreeSet;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use regex::Regex;
use serde_json::{Map, Value};
use tracing::debug;
use url::Url;

use crate::html::HtmlText;
use crate::types::{Listing, ListingId, PropertyType, RawRecord, Source};
use crate::{Result, SleuthError};

static RE_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-?\d+(?:\.\d+)?").expect("invalid regex: number"));

/// Amenity keywords picked up from free-text descriptions.
const DESCRIPTION_AMENITIES: &[&str] = &[
    "parking",
    "garage",
    "gym",
    "fitness",
    "pool",
    "washer",
    "dryer",
    "dishwasher",
    "air conditioning",
    "balcony",
    "patio",
    "hardwood",
    "fireplace",
    "wheelchair",
    "elevator",
    "pet friendly",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%b %d, %Y", "%B %d, %Y", "%Y/%m/%d"];

/// Where each canonical field lives in one platform's raw records.
/// Keys are tried in order; the first present, non-null value wins.
struct FieldMap {
    id: &'static [&'static str],
    price: &'static [&'static str],
    address: &'static [&'static str],
    title: &'static [&'static str],
    bedrooms: &'static [&'static str],
    bathrooms: &'static [&'static str],
    property_type: &'static [&'static str],
    description: &'static [&'static str],
    url: &'static [&'static str],
    amenities: &'static [&'static str],
    listed_date: &'static [&'static str],
    default_type: Option<PropertyType>,
}

const ZILLOW: FieldMap = FieldMap {
    id: &["zpid", "id"],
    price: &["price", "unformattedPrice"],
    address: &["address"],
    title: &["streetAddress", "title"],
    bedrooms: &["bedrooms", "beds"],
    bathrooms: &["bathrooms", "baths"],
    property_type: &["homeType", "propertyType"],
    description: &["description"],
    url: &["url", "detailUrl", "hdpUrl"],
    amenities: &["amenities", "features"],
    listed_date: &["datePosted", "listedDate", "listingDate"],
    default_type: None,
};

const REALTOR: FieldMap = FieldMap {
    id: &["property_id", "listing_id", "id"],
    price: &["price", "list_price"],
    address: &["address", "addressComponents", "location"],
    title: &["title", "name"],
    bedrooms: &["beds", "bedrooms"],
    bathrooms: &["baths", "bathrooms"],
    property_type: &["propertyType", "propertySubType", "type"],
    description: &["description"],
    url: &["url", "permalink", "href"],
    amenities: &["features", "amenities"],
    listed_date: &["listDate", "list_date"],
    default_type: None,
};

const APARTMENTS: FieldMap = FieldMap {
    id: &["id", "propertyId"],
    price: &["rent", "price"],
    address: &["propertyAddress", "address"],
    title: &["title", "propertyName"],
    bedrooms: &["beds", "bedrooms"],
    bathrooms: &["baths", "bathrooms"],
    property_type: &[],
    description: &["description"],
    url: &["url"],
    amenities: &["apartmentAmenities", "communityAmenities", "amenities"],
    listed_date: &["dateAvailable", "datePosted"],
    default_type: Some(PropertyType::Apartment),
};

fn field_map(source: Source) -> &'static FieldMap {
    match source {
        Source::Zillow => &ZILLOW,
        Source::Realtor => &REALTOR,
        Source::Apartments => &APARTMENTS,
    }
}

/// Maps raw platform records onto the canonical [`Listing`] shape.
///
/// Only the id and url are required. Every other field is optional and a
/// value that is present but unparsable is treated as absent, so one bad
/// field never costs the rest of the record.
#[derive(Default)]
pub struct Normalizer {
    html: HtmlText,
}

impl Normalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalizes one record declared to come from `source`.
    pub fn normalize(&self, source: Source, record: &RawRecord) -> Result<Listing> {
        let malformed = |reason: String| SleuthError::MalformedRecord {
            platform: source,
            reason,
        };

        let obj = record
            .as_object()
            .ok_or_else(|| malformed("record is not a JSON object".to_string()))?;
        let fields = field_map(source);

        let native_id = first(obj, fields.id)
            .and_then(as_text)
            .ok_or_else(|| malformed("missing listing id".to_string()))?;
        let raw_url = first(obj, fields.url)
            .and_then(as_text)
            .ok_or_else(|| malformed(format!("listing {} has no url", native_id)))?;
        let url = resolve_url(source, &raw_url).map_err(malformed)?;

        let address = first(obj, fields.address).and_then(as_address).unwrap_or_default();
        let title = first(obj, fields.title)
            .and_then(as_text)
            .or_else(|| (!address.is_empty()).then(|| address.clone()))
            .unwrap_or_else(|| "Property Listing".to_string());

        let description = first(obj, fields.description)
            .and_then(as_text)
            .map(|d| self.html.extract(&d))
            .filter(|d| !d.is_empty());

        let property_type = first(obj, fields.property_type)
            .and_then(as_text)
            .map(|label| PropertyType::from_label(&label))
            .or_else(|| infer_property_type(&title, description.as_deref()))
            .or(fields.default_type)
            .unwrap_or(PropertyType::Other);

        let mut amenities = BTreeSet::new();
        for key in fields.amenities {
            if let Some(Value::Array(items)) = obj.get(*key) {
                amenities.extend(items.iter().filter_map(as_amenity));
            }
        }
        if let Some(text) = description.as_deref() {
            let lowered = text.to_lowercase();
            amenities.extend(
                DESCRIPTION_AMENITIES
                    .iter()
                    .filter(|keyword| lowered.contains(*keyword))
                    .map(|keyword| keyword.to_string()),
            );
        }

        let listing = Listing {
            id: ListingId::new(source, native_id),
            title,
            description,
            price: first(obj, fields.price).and_then(as_quantity),
            bedrooms: first(obj, fields.bedrooms).and_then(as_quantity),
            bathrooms: first(obj, fields.bathrooms).and_then(as_quantity),
            address,
            property_type,
            url,
            amenities,
            listed_date: first(obj, fields.listed_date).and_then(as_date),
            is_new: false,
        };

        debug!(id = %listing.id, "Normalized listing");
        Ok(listing)
    }
}

fn first<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| obj.get(*key))
        .find(|value| !value.is_null())
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Reads a non-negative quantity from a number or from the first number in a string.
///
/// "$2,450/mo" reads as 2450 and "2.5 ba" as 2.5; negative, non-finite and
/// number-free values read as absent.
fn as_quantity(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let cleaned = s.replace(',', "");
            RE_NUMBER
                .find(&cleaned)
                .and_then(|m| m.as_str().parse::<f64>().ok())
        }
        _ => None,
    }?;
    (parsed.is_finite() && parsed >= 0.0).then_some(parsed)
}

fn as_amenity(value: &Value) -> Option<String> {
    let raw = match value {
        Value::String(s) => s.as_str(),
        Value::Object(obj) => obj.get("name").and_then(Value::as_str)?,
        _ => return None,
    };
    let tag = raw.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
    (!tag.is_empty()).then_some(tag)
}

/// Formats a string address, or an address object in any of the platform layouts,
/// as "street, city, state zip".
fn as_address(value: &Value) -> Option<String> {
    let obj = match value {
        Value::String(s) => {
            let trimmed = s.trim();
            return (!trimmed.is_empty()).then(|| trimmed.to_string());
        }
        Value::Object(obj) => obj,
        _ => return None,
    };

    let get = |keys: &[&str]| first(obj, keys).and_then(as_text);

    let street = get(&["streetAddress", "addressLine", "street", "line"]).or_else(|| {
        let name = get(&["streetName"])?;
        Some(match get(&["streetNumber"]) {
            Some(number) => format!("{} {}", number, name),
            None => name,
        })
    });
    let city = get(&["city", "neighborhood"]);
    let state = get(&["state", "state_code", "stateCode"]);
    let zip = get(&["zipcode", "zipCode", "postalCode", "postal_code"]);

    let region = match (state, zip) {
        (Some(state), Some(zip)) => Some(format!("{} {}", state, zip)),
        (state, zip) => state.or(zip),
    };

    let parts: Vec<String> = [street, city, region].into_iter().flatten().collect();
    (!parts.is_empty()).then(|| parts.join(", "))
}

fn as_date(value: &Value) -> Option<NaiveDate> {
    match value {
        Value::Number(n) => {
            let raw = n.as_i64()?;
            // Platforms report epoch timestamps in milliseconds; small values are seconds.
            let millis = if raw.unsigned_abs() < 100_000_000_000 { raw * 1000 } else { raw };
            DateTime::<Utc>::from_timestamp_millis(millis).map(|dt| dt.date_naive())
        }
        Value::String(s) => parse_date(s.trim()),
        _ => None,
    }
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.date_naive());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
        return Some(dt.date());
    }
    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(s, format).ok())
        .or_else(|| s.get(..10).and_then(|head| NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()))
}

fn infer_property_type(title: &str, description: Option<&str>) -> Option<PropertyType> {
    let haystack = format!("{} {}", title, description.unwrap_or_default()).to_lowercase();
    if haystack.contains("townhouse") || haystack.contains("town house") || haystack.contains("townhome") {
        Some(PropertyType::Townhouse)
    } else if haystack.contains("condo") {
        Some(PropertyType::Condo)
    } else if haystack.contains("apartment") {
        Some(PropertyType::Apartment)
    } else if haystack.contains("house") {
        Some(PropertyType::House)
    } else {
        None
    }
}

/// Resolves `raw` against the platform origin and checks it belongs to the platform.
fn resolve_url(source: Source, raw: &str) -> std::result::Result<String, String> {
    let base = Url::parse(source.base_url()).map_err(|e| e.to_string())?;
    let url = base
        .join(raw)
        .map_err(|e| format!("unparsable url '{}': {}", raw, e))?;

    if url.scheme() != "https" && url.scheme() != "http" {
        return Err(format!("url '{}' is not a web link", raw));
    }

    let domain = source.domain();
    let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
    if host != domain && !host.ends_with(&format!(".{}", domain)) {
        return Err(format!("url '{}' does not belong to {}", raw, domain));
    }

    Ok(url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn normalize(source: Source, record: Value) -> Result<Listing> {
        Normalizer::new().normalize(source, &record)
    }

    #[test]
    fn test_zillow_record() {
        let listing = normalize(
            Source::Zillow,
            json!({
                "zpid": 2077310565u64,
                "price": "$2,450/mo",
                "address": "123 Main St, Austin, TX 78701",
                "streetAddress": "123 Main St",
                "bedrooms": 2,
                "bathrooms": "1.5 ba",
                "homeType": "SINGLE_FAMILY",
                "description": "<p>Bright home with a <b>fireplace</b> and garage.</p>",
                "url": "/homedetails/123-Main-St/2077310565_zpid/",
                "amenities": ["Central Air", " Dishwasher "],
                "datePosted": "2024-03-15"
            }),
        )
        .unwrap();

        assert_eq!(listing.id, ListingId::new(Source::Zillow, "2077310565"));
        assert_eq!(listing.title, "123 Main St");
        assert_eq!(listing.price, Some(2450.0));
        assert_eq!(listing.bedrooms, Some(2.0));
        assert_eq!(listing.bathrooms, Some(1.5));
        assert_eq!(listing.property_type, PropertyType::House);
        assert_eq!(
            listing.url,
            "https://www.zillow.com/homedetails/123-Main-St/2077310565_zpid/"
        );
        assert_eq!(
            listing.description.as_deref(),
            Some("Bright home with a fireplace and garage.")
        );
        for tag in ["central air", "dishwasher", "fireplace", "garage"] {
            assert!(listing.amenities.contains(tag), "missing {}", tag);
        }
        assert_eq!(listing.listed_date, NaiveDate::from_ymd_opt(2024, 3, 15));
        assert!(!listing.is_new);
    }

    #[test]
    fn test_realtor_address_components() {
        let listing = normalize(
            Source::Realtor,
            json!({
                "property_id": "M123",
                "list_price": 450000,
                "addressComponents": {
                    "streetNumber": "55",
                    "streetName": "Oak Ave",
                    "city": "Denver",
                    "state": "CO",
                    "zipcode": "80202"
                },
                "beds": "3 bd",
                "propertyType": "townhomes",
                "permalink": "https://www.realtor.com/realestateandhomes-detail/M123",
                "listDate": "2024-02-01T10:30:00Z"
            }),
        )
        .unwrap();

        assert_eq!(listing.address, "55 Oak Ave, Denver, CO 80202");
        assert_eq!(listing.title, listing.address);
        assert_eq!(listing.price, Some(450000.0));
        assert_eq!(listing.bedrooms, Some(3.0));
        assert_eq!(listing.bathrooms, None);
        assert_eq!(listing.property_type, PropertyType::Townhouse);
        assert_eq!(listing.listed_date, NaiveDate::from_ymd_opt(2024, 2, 1));
    }

    #[test]
    fn test_apartments_defaults_and_inference() {
        let listing = normalize(
            Source::Apartments,
            json!({
                "id": "abc12",
                "rent": "$1,800 - $2,100",
                "propertyAddress": {"addressLine": "9 Elm St", "neighborhood": "Uptown", "state": "MN"},
                "title": "Uptown Condo Living",
                "url": "https://www.apartments.com/uptown/abc12/",
                "apartmentAmenities": ["Washer/Dryer"],
                "communityAmenities": ["Pool", {"name": "Fitness Center"}],
                "dateAvailable": "04/01/2024"
            }),
        )
        .unwrap();

        assert_eq!(listing.price, Some(1800.0));
        assert_eq!(listing.address, "9 Elm St, Uptown, MN");
        assert_eq!(listing.property_type, PropertyType::Condo);
        assert!(listing.amenities.contains("washer/dryer"));
        assert!(listing.amenities.contains("pool"));
        assert!(listing.amenities.contains("fitness center"));
        assert_eq!(listing.listed_date, NaiveDate::from_ymd_opt(2024, 4, 1));

        let plain = normalize(
            Source::Apartments,
            json!({"id": 7, "url": "https://www.apartments.com/x/7/"}),
        )
        .unwrap();
        assert_eq!(plain.property_type, PropertyType::Apartment);
        assert_eq!(plain.title, "Property Listing");
    }

    #[test]
    fn test_missing_required_fields() {
        let no_id = normalize(Source::Zillow, json!({"url": "https://www.zillow.com/a"}));
        assert!(matches!(no_id, Err(SleuthError::MalformedRecord { .. })));

        let no_url = normalize(Source::Zillow, json!({"zpid": 1}));
        assert!(matches!(no_url, Err(SleuthError::MalformedRecord { .. })));

        let not_object = normalize(Source::Realtor, json!(["zpid", 1]));
        assert!(matches!(not_object, Err(SleuthError::MalformedRecord { .. })));
    }

    #[test]
    fn test_url_must_belong_to_source() {
        let foreign = normalize(
            Source::Zillow,
            json!({"zpid": 1, "url": "https://www.realtor.com/listing/1"}),
        );
        assert!(matches!(foreign, Err(SleuthError::MalformedRecord { .. })));

        let lookalike = normalize(
            Source::Zillow,
            json!({"zpid": 1, "url": "https://notzillow.com/listing/1"}),
        );
        assert!(lookalike.is_err());
    }

    #[test]
    fn test_unparsable_numbers_become_absent() {
        let listing = normalize(
            Source::Zillow,
            json!({
                "zpid": "9",
                "url": "https://www.zillow.com/homedetails/9_zpid/",
                "price": "Call for price",
                "bedrooms": -2,
                "bathrooms": {"full": 1},
                "datePosted": "yesterday"
            }),
        )
        .unwrap();

        assert_eq!(listing.price, None);
        assert_eq!(listing.bedrooms, None);
        assert_eq!(listing.bathrooms, None);
        assert_eq!(listing.listed_date, None);
        assert_eq!(listing.property_type, PropertyType::Other);
    }

    #[test]
    fn test_epoch_millis_date() {
        assert_eq!(
            as_date(&json!(1_710_460_800_000i64)),
            NaiveDate::from_ymd_opt(2024, 3, 15)
        );
        assert_eq!(as_date(&json!(1_710_460_800i64)), NaiveDate::from_ymd_opt(2024, 3, 15));
        assert_eq!(parse_date("Mar 15, 2024"), NaiveDate::from_ymd_opt(2024, 3, 15));
    }

    #[test]
    fn test_extreme_epoch_values_are_absent() {
        assert_eq!(as_date(&json!(i64::MIN)), None);
        assert_eq!(as_date(&json!(i64::MAX)), None);
        assert_eq!(as_date(&json!(-86_400i64)), NaiveDate::from_ymd_opt(1969, 12, 31));
    }
}
