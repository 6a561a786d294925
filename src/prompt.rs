use crate::types::Listing;

/// Instructions sent as the system message of every match request.
pub const MATCH_INSTRUCTIONS: &str = "You help people filter real estate listings. \
Decide whether the listing satisfies the user's preferences. \
Reply with a single JSON object and nothing else: \
{\"match\": true or false, \"confidence\": a number from 0 to 1, \"explanation\": one short sentence}.";

/// Instructions sent as the system message of every summary request.
pub const SUMMARY_INSTRUCTIONS: &str = "You write real estate listing summaries. \
Describe the listing in one short, appealing paragraph that highlights its key selling points. \
Use only the facts given and reply with the paragraph alone.";

/// The `PromptBuilder` struct is responsible for constructing match prompts from a listing and the user's preferences.
pub struct PromptBuilder {
    /// The user's free-text preferences.
    preferences: String,
    /// The listing text to be judged.
    listing: String,
}

impl PromptBuilder {
    /// Creates a new `PromptBuilder` for the given preferences.
    ///
    /// # Arguments
    ///
    /// * `preferences` - The free-text preference note to judge listings against.
    ///
    /// # Returns
    ///
    /// A new instance of `PromptBuilder`.
    pub fn new(preferences: impl Into<String>) -> Self {
        Self {
            preferences: preferences.into(),
            listing: String::new(),
        }
    }

    /// Sets the listing text to be judged.
    pub fn with_listing(mut self, listing: impl Into<String>) -> Self {
        self.listing = listing.into();
        self
    }

    /// Builds the user message by formatting the preferences and the listing.
    ///
    /// # Returns
    ///
    /// A formatted prompt string.
    pub fn build(&self) -> String {
        Self::clean_text(&format!(
            "User preferences:\n{}\n---\nListing:\n{}\n---\nDoes this listing satisfy the preferences?",
            self.preferences, self.listing
        ))
    }

    /// Builds the user message asking for a summary of `listing`.
    pub fn summary_request(listing: &Listing) -> String {
        Self::clean_text(&format!(
            "Listing:\n{}\n---\nSummarize this listing in one paragraph.",
            Self::describe(listing)
        ))
    }

    /// Renders the fields of a listing the model needs to judge or summarize it.
    pub fn describe(listing: &Listing) -> String {
        let unknown = || "unknown".to_string();
        let amenities = if listing.amenities.is_empty() {
            "none specified".to_string()
        } else {
            listing.amenities.iter().cloned().collect::<Vec<_>>().join(", ")
        };

        format!(
            "Title: {}\nPrice: {}\nAddress: {}\nProperty type: {}\nBedrooms: {}\nBathrooms: {}\nAmenities: {}\nDescription: {}",
            listing.title,
            listing.price.map_or_else(unknown, |p| format!("${:.2}", p)),
            listing.address,
            listing.property_type,
            listing.bedrooms.map_or_else(unknown, |b| b.to_string()),
            listing.bathrooms.map_or_else(unknown, |b| b.to_string()),
            amenities,
            listing.description.as_deref().unwrap_or("No description provided"),
        )
    }

    /// Cleans the given text by removing blank lines and normalizing whitespace.
    ///
    /// # Arguments
    ///
    /// * `text` - The text to be cleaned.
    ///
    /// # Returns
    ///
    /// The cleaned text.
    fn clean_text(text: &str) -> String {
        text.lines()
            .filter(|line| !line.trim().is_empty())       // Remove blank lines
            .map(|line| {
                line.split_whitespace()                   // Split by whitespace
                    .collect::<Vec<&str>>()
                    .join(" ")                            // Join with single space
            })
            .collect::<Vec<String>>()
            .join("\n")                                   // Join lines with newline
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ListingId, PropertyType, Source};

    /// Tests the `PromptBuilder` functionality.
    #[test]
    fn test_prompt_builder() {
        let listing = Listing {
            id: ListingId::new(Source::Realtor, "M1"),
            title: "Garden flat".to_string(),
            description: Some("Quiet   street,\n\n  big yard".to_string()),
            price: Some(2100.0),
            bedrooms: Some(2.0),
            bathrooms: None,
            address: "4 Pine Rd, Portland, OR".to_string(),
            property_type: PropertyType::Apartment,
            url: "https://www.realtor.com/M1".to_string(),
            amenities: ["yard".to_string()].into_iter().collect(),
            listed_date: None,
            is_new: true,
        };

        let prompt = PromptBuilder::new("Dog friendly, near a park")
            .with_listing(PromptBuilder::describe(&listing))
            .build();

        assert!(prompt.contains("Dog friendly, near a park"));
        assert!(prompt.contains("Price: $2100.00"));
        assert!(prompt.contains("Bathrooms: unknown"));
        assert!(prompt.contains("Amenities: yard"));
        assert!(prompt.contains("Description: Quiet street,"));
        assert!(!prompt.contains("\n\n"));

        let request = PromptBuilder::summary_request(&listing);
        assert!(request.starts_with("Listing:\nTitle: Garden flat"));
        assert!(request.ends_with("Summarize this listing in one paragraph."));
        assert!(!request.contains("Dog friendly"));
    }
}
