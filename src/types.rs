use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::{Result, SleuthError};

/// A raw listing record as returned by a source collaborator.
pub type RawRecord = serde_json::Value;

/// The listing platform a record originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Zillow,
    Realtor,
    Apartments,
}

impl Source {
    /// Every supported platform, in the order they are fetched by default.
    pub const ALL: [Source; 3] = [Source::Zillow, Source::Realtor, Source::Apartments];

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Zillow => "zillow",
            Source::Realtor => "realtor",
            Source::Apartments => "apartments",
        }
    }

    /// The registrable domain every listing url of this platform must belong to.
    pub fn domain(&self) -> &'static str {
        match self {
            Source::Zillow => "zillow.com",
            Source::Realtor => "realtor.com",
            Source::Apartments => "apartments.com",
        }
    }

    /// The origin relative listing paths are resolved against.
    pub fn base_url(&self) -> &'static str {
        match self {
            Source::Zillow => "https://www.zillow.com",
            Source::Realtor => "https://www.realtor.com",
            Source::Apartments => "https://www.apartments.com",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = SleuthError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase();
        let name = normalized.trim_end_matches(".com");
        match name {
            "zillow" => Ok(Source::Zillow),
            "realtor" => Ok(Source::Realtor),
            "apartments" => Ok(Source::Apartments),
            _ => Err(SleuthError::InvalidCriteria(format!("unknown source '{}'", s))),
        }
    }
}

/// Canonical property type of a listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyType {
    Apartment,
    House,
    Condo,
    Townhouse,
    Other,
}

impl PropertyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PropertyType::Apartment => "apartment",
            PropertyType::House => "house",
            PropertyType::Condo => "condo",
            PropertyType::Townhouse => "townhouse",
            PropertyType::Other => "other",
        }
    }

    /// Maps a platform-specific type label onto the canonical type.
    ///
    /// Labels are compared case-insensitively with `-`, `_` and spaces
    /// treated alike, so `SINGLE_FAMILY` and `single-family-home` both map to
    /// [`PropertyType::House`]. Unknown labels map to [`PropertyType::Other`].
    pub fn from_label(label: &str) -> PropertyType {
        let key: String = label
            .trim()
            .to_ascii_lowercase()
            .chars()
            .map(|c| if c == '-' || c == '_' { ' ' } else { c })
            .collect();

        match key.split_whitespace().collect::<Vec<_>>().join(" ").as_str() {
            "apartment" | "apartments" | "apt" | "multi family" | "multifamily" | "studio" => {
                PropertyType::Apartment
            }
            "house" | "houses" | "single family" | "single family home" | "single family residence"
            | "home" | "manufactured" | "mobile" => PropertyType::House,
            "condo" | "condos" | "condominium" | "coop" | "co op" => PropertyType::Condo,
            "townhouse" | "townhouses" | "townhome" | "townhomes" | "town house" => {
                PropertyType::Townhouse
            }
            _ => PropertyType::Other,
        }
    }
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Property type restriction of a search: either `any` or one canonical type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PropertyTypeFilter {
    #[default]
    Any,
    Only(PropertyType),
}

impl PropertyTypeFilter {
    pub fn matches(&self, property_type: PropertyType) -> bool {
        match self {
            PropertyTypeFilter::Any => true,
            PropertyTypeFilter::Only(wanted) => *wanted == property_type,
        }
    }
}

impl fmt::Display for PropertyTypeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyTypeFilter::Any => f.write_str("any"),
            PropertyTypeFilter::Only(t) => t.fmt(f),
        }
    }
}

impl TryFrom<String> for PropertyTypeFilter {
    type Error = SleuthError;

    fn try_from(value: String) -> Result<Self> {
        if value.trim().eq_ignore_ascii_case("any") || value.trim().is_empty() {
            return Ok(PropertyTypeFilter::Any);
        }
        match PropertyType::from_label(&value) {
            PropertyType::Other if !value.trim().eq_ignore_ascii_case("other") => Err(
                SleuthError::InvalidCriteria(format!("unknown property type '{}'", value)),
            ),
            t => Ok(PropertyTypeFilter::Only(t)),
        }
    }
}

impl From<PropertyTypeFilter> for String {
    fn from(value: PropertyTypeFilter) -> Self {
        value.to_string()
    }
}

/// Whether the search targets rentals or sales.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchType {
    #[default]
    Rent,
    #[serde(alias = "sale")]
    Buy,
}

impl fmt::Display for SearchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchType::Rent => f.write_str("rent"),
            SearchType::Buy => f.write_str("buy"),
        }
    }
}

impl FromStr for SearchType {
    type Err = SleuthError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rent" => Ok(SearchType::Rent),
            "buy" | "sale" => Ok(SearchType::Buy),
            other => Err(SleuthError::InvalidCriteria(format!("unknown search type '{}'", other))),
        }
    }
}

/// An inclusive numeric range where either end may be open.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Bounds {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl Bounds {
    pub fn new(min: Option<f64>, max: Option<f64>) -> Self {
        Self { min, max }
    }

    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn is_unbounded(&self) -> bool {
        self.min.is_none() && self.max.is_none()
    }

    /// Whether `value` lies within the range.
    ///
    /// An absent value only satisfies a fully open range: it cannot be shown
    /// to meet a bound that is set.
    pub fn contains(&self, value: Option<f64>) -> bool {
        match value {
            None => self.is_unbounded(),
            Some(v) => {
                self.min.map_or(true, |min| v >= min) && self.max.map_or(true, |max| v <= max)
            }
        }
    }

    fn validate(&self, name: &str) -> Result<()> {
        for bound in [self.min, self.max].into_iter().flatten() {
            if !bound.is_finite() || bound < 0.0 {
                return Err(SleuthError::InvalidCriteria(format!(
                    "{} bound {} must be a non-negative number",
                    name, bound
                )));
            }
        }
        if let (Some(min), Some(max)) = (self.min, self.max) {
            if min > max {
                return Err(SleuthError::InvalidCriteria(format!(
                    "minimum {} {} exceeds maximum {}",
                    name, min, max
                )));
            }
        }
        Ok(())
    }
}

/// What the user is looking for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchCriteria {
    pub location: String,
    pub property_type: PropertyTypeFilter,
    pub bedrooms: Bounds,
    pub bathrooms: Bounds,
    pub price: Bounds,
    pub amenities: BTreeSet<String>,
    pub search_type: SearchType,
    pub sources: BTreeSet<Source>,
    /// Free-text preferences, read only by the semantic matcher.
    pub preferences: Option<String>,
}

impl SearchCriteria {
    /// Criteria for `location` with every other setting at its default:
    /// any property type, no bounds, rentals, all sources.
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            property_type: PropertyTypeFilter::Any,
            bedrooms: Bounds::unbounded(),
            bathrooms: Bounds::unbounded(),
            price: Bounds::unbounded(),
            amenities: BTreeSet::new(),
            search_type: SearchType::Rent,
            sources: Source::ALL.into_iter().collect(),
            preferences: None,
        }
    }

    pub fn with_property_type(mut self, property_type: PropertyType) -> Self {
        self.property_type = PropertyTypeFilter::Only(property_type);
        self
    }

    pub fn with_bedrooms(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.bedrooms = Bounds::new(min, max);
        self
    }

    pub fn with_bathrooms(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.bathrooms = Bounds::new(min, max);
        self
    }

    pub fn with_price(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.price = Bounds::new(min, max);
        self
    }

    pub fn with_amenities<I, S>(mut self, amenities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.amenities = amenities
            .into_iter()
            .map(|a| a.as_ref().trim().to_lowercase())
            .filter(|a| !a.is_empty())
            .collect();
        self
    }

    pub fn with_search_type(mut self, search_type: SearchType) -> Self {
        self.search_type = search_type;
        self
    }

    pub fn with_sources(mut self, sources: impl IntoIterator<Item = Source>) -> Self {
        self.sources = sources.into_iter().collect();
        self
    }

    pub fn with_preferences(mut self, preferences: impl Into<String>) -> Self {
        self.preferences = Some(preferences.into());
        self
    }

    /// The preference note, if it holds anything besides whitespace.
    pub fn preference_note(&self) -> Option<&str> {
        self.preferences
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
    }

    /// Rejects criteria that cannot describe a search.
    pub fn validate(&self) -> Result<()> {
        if self.location.trim().is_empty() {
            return Err(SleuthError::InvalidCriteria("location is required".to_string()));
        }
        if self.sources.is_empty() {
            return Err(SleuthError::InvalidCriteria(
                "at least one source must be enabled".to_string(),
            ));
        }
        self.bedrooms.validate("bedrooms")?;
        self.bathrooms.validate("bathrooms")?;
        self.price.validate("price")?;
        Ok(())
    }

    /// Fingerprint of the structured criteria, used to partition change tracking.
    ///
    /// Location is case-folded, sets are iterated in sorted order and the
    /// preference note is left out, so the same search always yields the same key.
    pub fn scope_key(&self) -> String {
        let sources: Vec<&str> = self.sources.iter().map(Source::as_str).collect();
        let amenities: Vec<&str> = self.amenities.iter().map(String::as_str).collect();
        let canonical = format!(
            "location={}|type={}|beds={:?}..{:?}|baths={:?}..{:?}|price={:?}..{:?}|search={}|sources={}|amenities={}",
            self.location.trim().to_lowercase(),
            self.property_type,
            self.bedrooms.min,
            self.bedrooms.max,
            self.bathrooms.min,
            self.bathrooms.max,
            self.price.min,
            self.price.max,
            self.search_type,
            sources.join(","),
            amenities.join(","),
        );
        hex::encode(Sha256::digest(canonical.as_bytes()))
    }
}

/// Actor-style search input, as found in `INPUT.json`.
///
/// Enumerated fields are kept as text and checked by the conversion into
/// [`SearchCriteria`], so an unknown value reads as `InvalidCriteria`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchInput {
    pub location: Option<String>,
    pub property_type: Option<String>,
    pub min_bedrooms: Option<f64>,
    pub max_bedrooms: Option<f64>,
    pub min_bathrooms: Option<f64>,
    pub max_bathrooms: Option<f64>,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    #[serde(default)]
    pub amenities: Vec<String>,
    pub search_type: Option<String>,
    pub sources: Option<Vec<String>>,
    pub preferences: Option<String>,
    /// Overrides the configured LLM API key for this run.
    pub llm_api_token: Option<String>,
}

impl SearchInput {
    /// Parses an `INPUT.json` document.
    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// The input's LLM token, if it carries a non-blank one.
    pub fn llm_token(&self) -> Option<&str> {
        self.llm_api_token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
    }
}

impl TryFrom<SearchInput> for SearchCriteria {
    type Error = SleuthError;

    fn try_from(input: SearchInput) -> Result<Self> {
        let location = input
            .location
            .ok_or_else(|| SleuthError::InvalidCriteria("location is required".to_string()))?;

        let search_type = match input.search_type.as_deref() {
            Some(raw) => raw.parse()?,
            None => SearchType::default(),
        };

        let mut criteria = SearchCriteria::new(location)
            .with_bedrooms(input.min_bedrooms, input.max_bedrooms)
            .with_bathrooms(input.min_bathrooms, input.max_bathrooms)
            .with_price(input.min_price, input.max_price)
            .with_amenities(input.amenities)
            .with_search_type(search_type);
        if let Some(raw) = input.property_type {
            criteria.property_type = PropertyTypeFilter::try_from(raw)?;
        }
        criteria.preferences = input.preferences;

        if let Some(sources) = input.sources {
            criteria.sources = sources
                .iter()
                .map(|s| s.parse())
                .collect::<Result<BTreeSet<Source>>>()?;
        }

        criteria.validate()?;
        Ok(criteria)
    }
}

/// Stable identity of a listing: its platform plus the platform's own id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ListingId {
    pub source: Source,
    pub native_id: String,
}

impl ListingId {
    pub fn new(source: Source, native_id: impl Into<String>) -> Self {
        Self {
            source,
            native_id: native_id.into(),
        }
    }
}

impl fmt::Display for ListingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.native_id)
    }
}

/// A normalized, source-agnostic property listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: ListingId,
    pub title: String,
    pub description: Option<String>,
    /// Price in USD.
    pub price: Option<f64>,
    pub bedrooms: Option<f64>,
    pub bathrooms: Option<f64>,
    pub address: String,
    pub property_type: PropertyType,
    pub url: String,
    pub amenities: BTreeSet<String>,
    pub listed_date: Option<NaiveDate>,
    /// Set by the change tracker; false until then.
    pub is_new: bool,
}

impl Listing {
    pub fn source(&self) -> Source {
        self.id.source
    }

    /// A one-line summary built from the structured fields.
    pub fn summary(&self) -> String {
        let fmt_count = |v: Option<f64>| v.map_or_else(|| "unknown".to_string(), |n| n.to_string());
        let price = self
            .price
            .map_or_else(|| "an unknown price".to_string(), |p| format!("${:.2}", p));
        format!(
            "{}: {} bed, {} bath {} for {} in {}.",
            self.title,
            fmt_count(self.bedrooms),
            fmt_count(self.bathrooms),
            self.property_type,
            price,
            self.address
        )
    }

    pub fn overview(&self) -> ListingOverview {
        ListingOverview {
            id: self.id.to_string(),
            title: self.title.clone(),
            price: self.price,
            bedrooms: self.bedrooms,
            bathrooms: self.bathrooms,
            address: self.address.clone(),
            property_type: self.property_type,
            source: self.source(),
            url: self.url.clone(),
            listed_date: self.listed_date,
            is_new: self.is_new,
        }
    }

    /// The detail record, summarized with [`Listing::summary`].
    pub fn detail(&self) -> ListingDetail {
        ListingDetail {
            overview: self.overview(),
            description: self.description.clone(),
            amenities: self.amenities.iter().cloned().collect(),
            summary: self.summary(),
            match_confidence: None,
            match_explanation: None,
        }
    }
}

/// The overview shape of a report record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingOverview {
    pub id: String,
    pub title: String,
    pub price: Option<f64>,
    pub bedrooms: Option<f64>,
    pub bathrooms: Option<f64>,
    pub address: String,
    pub property_type: PropertyType,
    pub source: Source,
    pub url: String,
    pub listed_date: Option<NaiveDate>,
    pub is_new: bool,
}

/// The detail shape of a report record: the overview plus description,
/// amenities and a short summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingDetail {
    #[serde(flatten)]
    pub overview: ListingOverview,
    pub description: Option<String>,
    pub amenities: Vec<String>,
    pub summary: String,
    /// The semantic matcher's confidence, for listings it judged a match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_confidence: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_explanation: Option<String>,
}

impl ListingDetail {
    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self
    }

    /// Records why the matcher kept the listing.
    pub fn with_match(mut self, confidence: f32, explanation: impl Into<String>) -> Self {
        let explanation = explanation.into();
        self.match_confidence = Some(confidence);
        self.match_explanation = (!explanation.trim().is_empty()).then_some(explanation);
        self
    }
}

/// The subset of the criteria a source collaborator needs to query its platform.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRequest {
    pub location: String,
    pub property_type: PropertyTypeFilter,
    pub bedrooms: Bounds,
    pub price: Bounds,
    pub search_type: SearchType,
    pub max_items: usize,
}

impl SourceRequest {
    pub fn from_criteria(criteria: &SearchCriteria, max_items: usize) -> Self {
        Self {
            location: criteria.location.clone(),
            property_type: criteria.property_type,
            bedrooms: criteria.bedrooms,
            price: criteria.price,
            search_type: criteria.search_type,
            max_items,
        }
    }
}
