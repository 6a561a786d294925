//! Structured filtering of canonical listings against search criteria.
//!
//! Policy:
//! - a property type filter of `any` matches every listing;
//! - numeric bounds are inclusive and an unset bound is open;
//! - a listing missing a value fails any bound set on that value;
//! - amenities pass when the listing carries every desired amenity
//!   (superset match, case-insensitive).

use std::fmt;

use serde::Serialize;

use crate::types::{Listing, SearchCriteria};

/// A criterion a listing can fail, in the order they are checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Criterion {
    PropertyType,
    Bedrooms,
    Bathrooms,
    Price,
    Amenities,
}

impl fmt::Display for Criterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Criterion::PropertyType => "property_type",
            Criterion::Bedrooms => "bedrooms",
            Criterion::Bathrooms => "bathrooms",
            Criterion::Price => "price",
            Criterion::Amenities => "amenities",
        })
    }
}

/// Checks `listing` against `criteria`, returning the first criterion it fails.
pub fn check(listing: &Listing, criteria: &SearchCriteria) -> Result<(), Criterion> {
    if !criteria.property_type.matches(listing.property_type) {
        return Err(Criterion::PropertyType);
    }
    if !criteria.bedrooms.contains(listing.bedrooms) {
        return Err(Criterion::Bedrooms);
    }
    if !criteria.bathrooms.contains(listing.bathrooms) {
        return Err(Criterion::Bathrooms);
    }
    if !criteria.price.contains(listing.price) {
        return Err(Criterion::Price);
    }
    let has_all_amenities = criteria.amenities.iter().all(|wanted| {
        listing
            .amenities
            .iter()
            .any(|tag| tag.eq_ignore_ascii_case(wanted))
    });
    if !has_all_amenities {
        return Err(Criterion::Amenities);
    }
    Ok(())
}

pub fn matches(listing: &Listing, criteria: &SearchCriteria) -> bool {
    check(listing, criteria).is_ok()
}
