//! Entity-recognition pass for open-vocabulary PII categories.
//!
//! The engine is a trait so a real model can be plugged in behind the same
//! surface. The built-in [`HeuristicNer`] is cue-driven: honorifics and
//! capitalised runs for people, corporate suffixes for organizations,
//! prepositional cues for locations. Recall is deliberately modest; the
//! regex pass carries the high-precision categories.

use once_cell::sync::Lazy;
use regex::Regex;

use super::patterns::PiiCategory;

/// A single entity match with byte offsets into the scanned text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NerSpan {
    pub start: usize,
    pub end: usize,
    pub category: PiiCategory,
}

/// Named-entity detector over plain text.
#[cfg_attr(test, mockall::automock)]
pub trait NerEngine: Send + Sync {
    /// Return entity spans found in `text`. Spans must lie on character
    /// boundaries and must not overlap each other.
    fn detect(&self, text: &str) -> Vec<NerSpan>;
}

static HONORIFIC_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:Mr|Mrs|Ms|Dr|Prof)\.?\s+[A-Z][a-z]+(?:\s+[A-Z][a-z]+)?")
        .expect("built-in pattern must compile")
});

static FULL_NAME: Lazy<Regex> = Lazy::new(|| {
    // Two adjacent capitalised words. Sentence starts will false-positive;
    // acceptable for a heuristic fallback.
    Regex::new(r"\b[A-Z][a-z]+\s+[A-Z][a-z]+\b").expect("built-in pattern must compile")
});

static ORGANIZATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[A-Z][A-Za-z&]*(?:\s+[A-Z][A-Za-z&]*)*\s+(?:Inc|LLC|Ltd|Corp|Corporation|Company|GmbH)\.?\b")
        .expect("built-in pattern must compile")
});

static LOCATION_CUE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:in|at|from|near)\s+([A-Z][a-z]+(?:\s+[A-Z][a-z]+)?)\b")
        .expect("built-in pattern must compile")
});

/// Cue-based heuristic entity detector. No external model required.
#[derive(Debug, Default)]
pub struct HeuristicNer;

impl NerEngine for HeuristicNer {
    fn detect(&self, text: &str) -> Vec<NerSpan> {
        let mut spans: Vec<NerSpan> = Vec::new();

        for m in ORGANIZATION.find_iter(text) {
            spans.push(NerSpan {
                start: m.start(),
                end: m.end(),
                category: PiiCategory::Organization,
            });
        }

        for m in HONORIFIC_NAME.find_iter(text) {
            push_if_free(&mut spans, m.start(), m.end(), PiiCategory::Person);
        }
        for m in FULL_NAME.find_iter(text) {
            push_if_free(&mut spans, m.start(), m.end(), PiiCategory::Person);
        }

        for caps in LOCATION_CUE.captures_iter(text) {
            if let Some(place) = caps.get(1) {
                push_if_free(&mut spans, place.start(), place.end(), PiiCategory::Location);
            }
        }

        spans.sort_by_key(|s| s.start);
        spans
    }
}

/// Keep the first claim on any stretch of text.
fn push_if_free(spans: &mut Vec<NerSpan>, start: usize, end: usize, category: PiiCategory) {
    if spans.iter().any(|s| start < s.end && s.start < end) {
        return;
    }
    spans.push(NerSpan { start, end, category });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn categories(text: &str) -> Vec<(PiiCategory, String)> {
        HeuristicNer
            .detect(text)
            .into_iter()
            .map(|s| (s.category, text[s.start..s.end].to_owned()))
            .collect()
    }

    #[test]
    fn detects_honorific_names() {
        let found = categories("Please transfer Dr. Jane Smith to billing.");
        assert!(found.contains(&(PiiCategory::Person, "Dr. Jane Smith".into())));
    }

    #[test]
    fn detects_plain_full_names() {
        let found = categories("caller identified as John Doe yesterday");
        assert!(found.contains(&(PiiCategory::Person, "John Doe".into())));
    }

    #[test]
    fn detects_org_suffixes() {
        let found = categories("works at Initech Corp in the valley");
        assert!(found.contains(&(PiiCategory::Organization, "Initech Corp".into())));
    }

    #[test]
    fn detects_location_cues() {
        let found = categories("she lives in Springfield now");
        assert!(found.contains(&(PiiCategory::Location, "Springfield".into())));
    }

    #[test]
    fn spans_never_overlap() {
        let spans = HeuristicNer.detect("Dr. Jane Smith from Acme Widgets Inc in Portland");
        for pair in spans.windows(2) {
            assert!(pair[0].end <= pair[1].start);
        }
    }
}
