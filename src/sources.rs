use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::{json, Map, Value};
use tracing::{info, instrument, warn};

use crate::apify::ApifyClient;
use crate::config::ApifyConfig;
use crate::types::{Bounds, PropertyType, PropertyTypeFilter, RawRecord, SearchType, Source, SourceRequest};
use crate::{Result, SleuthError};

/// A collaborator that retrieves raw listing records from one platform.
#[async_trait]
pub trait ListingSource: Send + Sync {
    /// The platform this collaborator serves.
    fn source(&self) -> Source;

    /// Fetches raw records matching `request`, or fails with `SourceUnavailable`.
    async fn fetch(&self, request: &SourceRequest) -> Result<Vec<RawRecord>>;
}

/// Builds one collaborator per platform from the platform settings.
///
/// With an API token every platform is served by its Apify actor; without
/// one, each platform yields generated mock listings so runs work locally.
pub fn build_sources(config: &ApifyConfig) -> Vec<Arc<dyn ListingSource>> {
    match config.token.as_deref() {
        Some(token) => {
            let client = ApifyClient::new(&config.base_url, token);
            Source::ALL
                .into_iter()
                .map(|source| {
                    let actor_id = match source {
                        Source::Zillow => &config.zillow_actor,
                        Source::Realtor => &config.realtor_actor,
                        Source::Apartments => &config.apartments_actor,
                    };
                    Arc::new(ApifySource::new(source, actor_id.clone(), client.clone(), config.wait_secs))
                        as Arc<dyn ListingSource>
                })
                .collect()
        }
        None => {
            warn!("No Apify token configured, sources will return mock listings");
            Source::ALL
                .into_iter()
                .map(|source| Arc::new(MockSource::new(source)) as Arc<dyn ListingSource>)
                .collect()
        }
    }
}

/// A platform served by an Apify actor.
pub struct ApifySource {
    source: Source,
    actor_id: String,
    client: ApifyClient,
    wait_secs: u64,
}

impl ApifySource {
    pub fn new(source: Source, actor_id: String, client: ApifyClient, wait_secs: u64) -> Self {
        Self {
            source,
            actor_id,
            client,
            wait_secs,
        }
    }
}

#[async_trait]
impl ListingSource for ApifySource {
    fn source(&self) -> Source {
        self.source
    }

    #[instrument(skip(self, request), fields(source = %self.source, actor = %self.actor_id))]
    async fn fetch(&self, request: &SourceRequest) -> Result<Vec<RawRecord>> {
        let input = actor_input(self.source, request);
        info!(%input, "Prepared actor input");

        self.client
            .run_actor(&self.actor_id, &input, request.max_items, self.wait_secs)
            .await
            .map_err(|e| SleuthError::SourceUnavailable {
                platform: self.source,
                reason: e.to_string(),
            })
    }
}

/// Formats a bound for a search URL: whole numbers without a decimal point.
fn fmt_bound(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}

fn proxy() -> Value {
    json!({ "useApifyProxy": true, "apifyProxyGroups": ["RESIDENTIAL"] })
}

/// Splits "Austin, TX" into url-safe ("austin", "tx") slugs.
fn city_state(location: &str) -> (String, String) {
    let mut parts = location.split(',');
    let slug = |s: &str| {
        urlencoding::encode(&s.trim().to_lowercase().split_whitespace().collect::<Vec<_>>().join("-"))
            .into_owned()
    };
    let city = parts.next().map(slug).unwrap_or_default();
    let state = parts.next().map(slug).unwrap_or_default();
    (city, state)
}

/// Builds the actor input that makes `source`'s scraper search for `request`.
pub fn actor_input(source: Source, request: &SourceRequest) -> Value {
    match source {
        Source::Zillow => zillow_input(request),
        Source::Realtor => realtor_input(request),
        Source::Apartments => apartments_input(request),
    }
}

fn zillow_input(request: &SourceRequest) -> Value {
    let (city, state) = city_state(&request.location);
    let location = if state.is_empty() { city } else { format!("{},{}", city, state) };
    let base = match request.search_type {
        SearchType::Rent => format!("https://www.zillow.com/homes/for_rent/{}", location),
        SearchType::Buy => format!("https://www.zillow.com/homes/{}", location),
    };

    let mut filters = Vec::new();
    if let Some(range) = range_filter("price", &request.price) {
        filters.push(range);
    }
    match (request.bedrooms.min, request.bedrooms.max) {
        (Some(min), Some(max)) if min == max => filters.push(format!("{}-_beds", fmt_bound(min))),
        _ => filters.extend(range_filter("beds", &request.bedrooms)),
    }
    if let PropertyTypeFilter::Only(property_type) = request.property_type {
        let label = match property_type {
            PropertyType::Townhouse => "townhome",
            other => other.as_str(),
        };
        filters.push(format!("type-{}", label));
    }

    let url = if filters.is_empty() {
        base
    } else {
        format!("{}/{}", base, filters.join("/"))
    };

    json!({
        "startUrls": [{ "url": url }],
        "maxPages": 10,
        "maxItems": request.max_items,
        "includeRental": request.search_type == SearchType::Rent,
        "includeSale": request.search_type == SearchType::Buy,
        "includeAuction": false,
        "proxy": proxy(),
    })
}

/// Zillow path filter such as `price_gte-1000_lte-3000`.
fn range_filter(name: &str, bounds: &Bounds) -> Option<String> {
    if bounds.is_unbounded() {
        return None;
    }
    let mut filter = name.to_string();
    if let Some(min) = bounds.min.filter(|m| *m > 0.0) {
        filter.push_str(&format!("_gte-{}", fmt_bound(min)));
    }
    if let Some(max) = bounds.max {
        filter.push_str(&format!("_lte-{}", fmt_bound(max)));
    }
    (filter.len() > name.len()).then_some(filter)
}

fn realtor_input(request: &SourceRequest) -> Value {
    let (city, state) = city_state(&request.location);
    let base = match request.search_type {
        SearchType::Rent => "https://www.realtor.com/apartments",
        SearchType::Buy => "https://www.realtor.com/realestateandhomes-search",
    };
    let location = if state.is_empty() { city } else { format!("{}_{}", city, state) };

    let mut params = Map::new();
    if let PropertyTypeFilter::Only(property_type) = request.property_type {
        let prop = match property_type {
            PropertyType::Apartment => "apartments",
            PropertyType::House => "single-family-home",
            PropertyType::Condo => "condos",
            PropertyType::Townhouse => "townhomes",
            PropertyType::Other => "any",
        };
        params.insert("prop".into(), prop.into());
    }
    insert_bounds(&mut params, &request.bedrooms, "beds-lower", "beds-upper");
    insert_bounds(&mut params, &request.price, "price-lower", "price-upper");

    json!({
        "startUrls": [{ "url": format!("{}/{}", base, location) }],
        "searchParams": params,
        "maxItems": request.max_items,
        "proxy": proxy(),
    })
}

fn apartments_input(request: &SourceRequest) -> Value {
    let (city, state) = city_state(&request.location);
    let location = if state.is_empty() { city } else { format!("{}-{}", city, state) };

    let mut params = Map::new();
    match (request.bedrooms.min, request.bedrooms.max) {
        (Some(min), Some(max)) if min == max => {
            params.insert("br".into(), fmt_bound(min).into());
        }
        _ => insert_bounds(&mut params, &request.bedrooms, "br-min", "br-max"),
    }
    insert_bounds(&mut params, &request.price, "price-min", "price-max");
    if let PropertyTypeFilter::Only(property_type) = request.property_type {
        if property_type != PropertyType::Apartment {
            params.insert("type".into(), property_type.as_str().into());
        }
    }

    json!({
        "startUrls": [{ "url": format!("https://www.apartments.com/{}/", location) }],
        "searchParams": params,
        "maxItems": request.max_items,
        "proxy": proxy(),
    })
}

fn insert_bounds(params: &mut Map<String, Value>, bounds: &Bounds, min_key: &str, max_key: &str) {
    if let Some(min) = bounds.min.filter(|m| *m > 0.0) {
        params.insert(min_key.into(), fmt_bound(min).into());
    }
    if let Some(max) = bounds.max {
        params.insert(max_key.into(), fmt_bound(max).into());
    }
}

/// A platform stand-in returning generated listings in the platform's raw shape.
pub struct MockSource {
    source: Source,
    count: usize,
}

impl MockSource {
    pub fn new(source: Source) -> Self {
        Self { source, count: 5 }
    }

    fn record(&self, request: &SourceRequest, i: usize) -> RawRecord {
        let price = request.price.min.unwrap_or(1000.0) + (i as f64) * 200.0;
        let beds = request.bedrooms.min.unwrap_or(1.0).floor() + (i % 2) as f64;
        let baths = (beds / 2.0).max(1.0);
        let city = request.location.split(',').next().unwrap_or_default().trim();
        let state = request.location.split(',').nth(1).unwrap_or_default().trim();
        let street = format!("{} Main St", 100 + i);
        let listed = (Utc::now().date_naive() - Duration::days(i as i64)).to_string();
        let description = format!(
            "Mock {} listing {} in {} with parking and air conditioning.",
            self.source, i, request.location
        );
        let native_id = format!("{}_mock_{}", self.source, i);

        match self.source {
            Source::Zillow => json!({
                "zpid": native_id,
                "price": price,
                "address": format!("{}, {}, {} 12345", street, city, state),
                "streetAddress": street,
                "bedrooms": beds,
                "bathrooms": baths,
                "description": description,
                "url": format!("/homedetails/{}/", native_id),
                "datePosted": listed,
            }),
            Source::Realtor => json!({
                "property_id": native_id,
                "price": format!("${}", fmt_bound(price)),
                "addressComponents": {
                    "streetNumber": (100 + i).to_string(),
                    "streetName": "Main St",
                    "city": city,
                    "state": state,
                    "zipcode": "12345",
                },
                "beds": beds,
                "baths": baths,
                "description": description,
                "url": format!("https://www.realtor.com/realestateandhomes-detail/{}", native_id),
                "listDate": listed,
            }),
            Source::Apartments => json!({
                "id": native_id,
                "rent": format!("${}/mo", fmt_bound(price)),
                "propertyAddress": {
                    "addressLine": street,
                    "city": city,
                    "state": state,
                    "postalCode": "12345",
                },
                "title": format!("Mock Apartments Listing {}", i),
                "beds": format!("{} bd", fmt_bound(beds)),
                "baths": baths,
                "description": description,
                "url": format!("https://www.apartments.com/{}/", native_id),
                "apartmentAmenities": ["Dishwasher"],
                "dateAvailable": listed,
            }),
        }
    }
}

#[async_trait]
impl ListingSource for MockSource {
    fn source(&self) -> Source {
        self.source
    }

    async fn fetch(&self, request: &SourceRequest) -> Result<Vec<RawRecord>> {
        info!(source = %self.source, count = self.count, "Generating mock listings");
        Ok((1..=self.count).map(|i| self.record(request, i)).collect())
    }
}

/// A platform stand-in returning a fixed set of raw records.
pub struct StaticSource {
    source: Source,
    records: Vec<RawRecord>,
}

impl StaticSource {
    pub fn new(source: Source, records: Vec<RawRecord>) -> Self {
        Self { source, records }
    }
}

#[async_trait]
impl ListingSource for StaticSource {
    fn source(&self) -> Source {
        self.source
    }

    async fn fetch(&self, _request: &SourceRequest) -> Result<Vec<RawRecord>> {
        Ok(self.records.clone())
    }
}
