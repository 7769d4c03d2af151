//! Two-pass PII detection and redaction.
//!
//! Pass one is deterministic regex matching for high-precision categories
//! (email, phone, SSN, credit card, generic ids, IP addresses, plus the
//! HIPAA safe-harbor extras when enabled). Pass two is entity recognition
//! for open-vocabulary categories (people, organizations, locations).
//! Matches from both passes are merged into non-overlapping spans, with the
//! regex pass winning any intersection, then substituted in reverse order
//! so earlier offsets stay valid.
//!
//! Placeholder ordinals increment per category per call and reset between
//! calls, so `redact` is deterministic for a given input.

pub mod ner;
pub mod patterns;

pub use ner::{HeuristicNer, NerEngine, NerSpan};
pub use patterns::PiiCategory;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use patterns::{PatternRule, BASE_PATTERNS, SAFE_HARBOR_PATTERNS};

/// How a detected span is rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RedactionMode {
    /// Typed, numbered placeholder: `[EMAIL_1]`.
    #[default]
    Mask,
    /// Uniform marker with no category hint: `[REDACTED]`.
    Redact,
    /// Category plus a short content digest: `[EMAIL:1f8a0c3e]`. Equal
    /// values hash equally, which keeps repeated mentions correlatable
    /// without exposing the value.
    Hash,
}

/// Per-call result metadata: what was found and what replaced it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RedactionMetadata {
    /// Match count per category name.
    pub counts: BTreeMap<String, usize>,
    /// Placeholder token to category name, e.g. `"[EMAIL_1]" -> "email"`.
    /// Tokens are recorded in canonical `[LABEL_n]` form in every mode.
    pub placeholders: BTreeMap<String, String>,
    /// Sum of all per-category counts.
    pub total_redactions: usize,
    /// Result of re-running the regex pass over the redacted output.
    pub validated: bool,
}

#[derive(Debug, Clone, Copy)]
struct Span {
    start: usize,
    end: usize,
    category: PiiCategory,
}

fn intersects(a: &Span, start: usize, end: usize) -> bool {
    start < a.end && a.start < end
}

/// Detects PII and rewrites it according to the configured mode.
pub struct PiiRedactor {
    mode: RedactionMode,
    safe_harbor: bool,
    ner: Box<dyn NerEngine>,
}

impl PiiRedactor {
    /// Redactor with the built-in heuristic entity engine.
    pub fn new(mode: RedactionMode, safe_harbor: bool) -> Self {
        Self::with_ner(mode, safe_harbor, Box::new(HeuristicNer))
    }

    /// Redactor with a caller-supplied entity engine.
    pub fn with_ner(mode: RedactionMode, safe_harbor: bool, ner: Box<dyn NerEngine>) -> Self {
        Self {
            mode,
            safe_harbor,
            ner,
        }
    }

    fn rule_sets(&self) -> impl Iterator<Item = &'static PatternRule> {
        BASE_PATTERNS.iter().chain(
            self.safe_harbor
                .then(|| SAFE_HARBOR_PATTERNS.iter())
                .into_iter()
                .flatten(),
        )
    }

    /// Regex pass: collect validated matches, first rule claiming a stretch
    /// of text wins.
    fn regex_spans(&self, text: &str) -> Vec<Span> {
        let mut spans: Vec<Span> = Vec::new();
        for rule in self.rule_sets() {
            for m in rule.regex.find_iter(text) {
                if let Some(validate) = rule.validator {
                    if !validate(m.as_str()) {
                        continue;
                    }
                }
                if spans.iter().any(|s| intersects(s, m.start(), m.end())) {
                    continue;
                }
                spans.push(Span {
                    start: m.start(),
                    end: m.end(),
                    category: rule.category,
                });
            }
        }
        spans
    }

    /// Detect and rewrite PII in `text`.
    ///
    /// Empty input returns unchanged with zero counts. Counters reset on
    /// every call.
    pub fn redact(&self, text: &str) -> (String, RedactionMetadata) {
        if text.is_empty() {
            return (
                String::new(),
                RedactionMetadata {
                    validated: true,
                    ..RedactionMetadata::default()
                },
            );
        }

        let mut spans = self.regex_spans(text);

        // Entity pass only adds spans the regex pass left unclaimed.
        for entity in self.ner.detect(text) {
            if spans.iter().any(|s| intersects(s, entity.start, entity.end)) {
                continue;
            }
            spans.push(Span {
                start: entity.start,
                end: entity.end,
                category: entity.category,
            });
        }

        spans.sort_by_key(|s| s.start);

        // Ordinals are assigned in reading order so the first email in the
        // text is always [EMAIL_1].
        let mut counters: BTreeMap<PiiCategory, usize> = BTreeMap::new();
        let mut metadata = RedactionMetadata::default();
        let mut replacements: Vec<(Span, String)> = Vec::with_capacity(spans.len());

        for span in spans {
            let ordinal = counters.entry(span.category).or_insert(0);
            *ordinal += 1;
            let token = format!("[{}_{}]", span.category.token_label(), ordinal);

            let replacement = match self.mode {
                RedactionMode::Mask => token.clone(),
                RedactionMode::Redact => "[REDACTED]".to_owned(),
                RedactionMode::Hash => {
                    let digest = Sha256::digest(text[span.start..span.end].as_bytes());
                    format!("[{}:{:02x}{:02x}{:02x}{:02x}]",
                        span.category.token_label(),
                        digest[0], digest[1], digest[2], digest[3])
                }
            };

            *metadata
                .counts
                .entry(span.category.name().to_owned())
                .or_insert(0) += 1;
            metadata
                .placeholders
                .insert(token, span.category.name().to_owned());
            replacements.push((span, replacement));
        }

        let mut out = text.to_owned();
        for (span, replacement) in replacements.iter().rev() {
            out.replace_range(span.start..span.end, replacement);
        }

        metadata.total_redactions = metadata.counts.values().sum();
        metadata.validated = self.validate_redaction(text, &out);
        debug!(
            total = metadata.total_redactions,
            validated = metadata.validated,
            "redaction pass complete"
        );

        (out, metadata)
    }

    /// Re-apply the regex pass to the redacted output and report whether it
    /// is clean. Best effort: entity-recognition misses are not caught.
    pub fn validate_redaction(&self, original: &str, redacted: &str) -> bool {
        if original.is_empty() {
            return true;
        }
        self.regex_spans(redacted).is_empty()
    }
}
