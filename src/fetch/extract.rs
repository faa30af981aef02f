use scraper::{Html, Selector};
use std::collections::BTreeMap;
use tracing::warn;

/// Field name -> text of every matching element
pub type ExtractedData = BTreeMap<String, Vec<String>>;

/// Run every named CSS selector against `body`.
///
/// A selector matching nothing yields an empty list, as does one that fails to
/// parse; extraction itself never fails.
pub fn extract(body: &str, selectors: &BTreeMap<String, String>) -> ExtractedData {
    let document = Html::parse_document(body);

    selectors
        .iter()
        .map(|(field, raw)| {
            let values = match Selector::parse(raw) {
                Ok(selector) => document
                    .select(&selector)
                    .map(|element| element_text(element.text()))
                    .collect(),
                Err(e) => {
                    warn!("Invalid selector for field '{}' ({}): {:?}", field, raw, e);
                    Vec::new()
                }
            };
            (field.clone(), values)
        })
        .collect()
}

// Each text node trimmed, empty ones dropped, the rest concatenated
fn element_text<'a>(pieces: impl Iterator<Item = &'a str>) -> String {
    pieces.map(str::trim).filter(|piece| !piece.is_empty()).collect()
}
