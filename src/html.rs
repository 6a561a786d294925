use scraper::Html;
use tracing::instrument;

/// The `HtmlText` struct reduces HTML fragments found in listing fields to plain text.
/// Platforms return descriptions either as plain text or as rendered markup; both
/// come out of [`HtmlText::extract`] as a single whitespace-normalized line.
pub struct HtmlText {
    /// Elements whose text content is dropped entirely.
    skipped_elements: Vec<String>,
}

impl Default for HtmlText {
    /// Provides an `HtmlText` that drops scripts, styles and embedded templates.
    fn default() -> Self {
        Self::new(["script", "style", "noscript", "template"])
    }
}

impl HtmlText {
    /// Creates a new `HtmlText` that ignores the text of the given elements.
    ///
    /// # Arguments
    ///
    /// * `skipped_elements` - Lower-case element names whose text is discarded.
    pub fn new(skipped_elements: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            skipped_elements: skipped_elements.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns true when `text` contains something that parses as markup.
    pub fn looks_like_html(text: &str) -> bool {
        let bytes = text.as_bytes();
        bytes.iter().enumerate().any(|(i, &b)| {
            b == b'<'
                && bytes
                    .get(i + 1)
                    .map_or(false, |next| next.is_ascii_alphabetic() || *next == b'/' || *next == b'!')
        }) || text.contains("&nbsp;")
            || text.contains("&amp;")
    }

    /// Extracts the visible text of `fragment`.
    ///
    /// # Arguments
    ///
    /// * `fragment` - An HTML fragment or plain text.
    ///
    /// # Returns
    ///
    /// The text content with entities decoded and whitespace collapsed. Plain
    /// text input is only whitespace-normalized.
    #[instrument(skip(self, fragment), fields(fragment_length = fragment.len()))]
    pub fn extract(&self, fragment: &str) -> String {
        if !Self::looks_like_html(fragment) {
            return Self::clean_text(fragment);
        }

        let document = Html::parse_fragment(fragment);
        let mut pieces: Vec<&str> = Vec::new();

        for node in document.root_element().descendants() {
            let Some(text) = node.value().as_text() else {
                continue;
            };
            let skipped = node.ancestors().any(|ancestor| {
                ancestor
                    .value()
                    .as_element()
                    .map_or(false, |el| self.skipped_elements.iter().any(|s| s == el.name()))
            });
            if !skipped {
                pieces.push(text);
            }
        }

        Self::clean_text(&pieces.join(" "))
    }

    /// Collapses runs of whitespace, including non-breaking spaces, to single spaces.
    fn clean_text(text: &str) -> String {
        text.split(|c: char| c.is_whitespace() || c == '\u{a0}')
            .filter(|word| !word.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }
}
