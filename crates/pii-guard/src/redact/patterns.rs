//! Regex pattern rules for the high-precision redaction pass.
//!
//! Patterns are compiled once and shared. Each rule may carry a post-match
//! validator for categories whose regex alone over-matches (credit cards,
//! IP addresses).

use once_cell::sync::Lazy;
use regex::Regex;

/// PII category detected by either the regex or the entity-recognition pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PiiCategory {
    Email,
    Phone,
    Ssn,
    CreditCard,
    GenericId,
    IpAddress,
    Person,
    Organization,
    Location,
    Date,
    Url,
    MedicalRecordNumber,
}

impl PiiCategory {
    /// Metadata counter key for this category.
    pub fn name(self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Phone => "phone",
            Self::Ssn => "ssn",
            Self::CreditCard => "credit_card",
            Self::GenericId => "id",
            Self::IpAddress => "ip_address",
            Self::Person => "person",
            Self::Organization => "organization",
            Self::Location => "location",
            Self::Date => "date",
            Self::Url => "url",
            Self::MedicalRecordNumber => "mrn",
        }
    }

    /// Uppercase label used inside placeholder tokens, e.g. `[EMAIL_1]`.
    pub fn token_label(self) -> &'static str {
        match self {
            Self::Email => "EMAIL",
            Self::Phone => "PHONE",
            Self::Ssn => "SSN",
            Self::CreditCard => "CREDIT_CARD",
            Self::GenericId => "ID",
            Self::IpAddress => "IP",
            Self::Person => "NAME",
            Self::Organization => "ORG",
            Self::Location => "LOCATION",
            Self::Date => "DATE",
            Self::Url => "URL",
            Self::MedicalRecordNumber => "MRN",
        }
    }
}

/// One compiled regex rule of the high-precision pass.
pub struct PatternRule {
    pub category: PiiCategory,
    pub regex: Regex,
    /// Optional post-match filter for patterns that over-match.
    pub validator: Option<fn(&str) -> bool>,
}

impl PatternRule {
    fn new(category: PiiCategory, pattern: &str, validator: Option<fn(&str) -> bool>) -> Self {
        Self {
            category,
            // Patterns are literals reviewed below; a failure here is a
            // programming error, not a runtime condition.
            regex: Regex::new(pattern).expect("built-in pattern must compile"),
            validator,
        }
    }
}

/// A credit-card candidate must contain exactly 16 digits; shorter runs are
/// more likely account or ticket numbers.
pub(crate) fn valid_credit_card(text: &str) -> bool {
    text.chars().filter(char::is_ascii_digit).count() == 16
}

/// Each dotted-quad octet must be 0..=255.
pub(crate) fn valid_ipv4(text: &str) -> bool {
    text.split('.')
        .all(|octet| octet.parse::<u16>().map(|n| n <= 255).unwrap_or(false))
}

/// Baseline rules, ordered so that longer/more-specific shapes claim their
/// spans before shorter ones (SSN before phone, card before generic id).
pub static BASE_PATTERNS: Lazy<Vec<PatternRule>> = Lazy::new(|| {
    vec![
        PatternRule::new(
            PiiCategory::Email,
            r"(?i)\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b",
            None,
        ),
        PatternRule::new(PiiCategory::Ssn, r"\b\d{3}-\d{2}-\d{4}\b", None),
        PatternRule::new(
            PiiCategory::CreditCard,
            r"\b\d{4}[-\s]?\d{4}[-\s]?\d{4}[-\s]?\d{4}\b",
            Some(valid_credit_card),
        ),
        PatternRule::new(
            PiiCategory::Phone,
            r"\+\d{1,3}\s?\d{3}[-.]?\d{3}[-.]?\d{4}\b",
            None,
        ),
        PatternRule::new(PiiCategory::Phone, r"\(\d{3}\)\s*\d{3}[-.]?\d{4}\b", None),
        PatternRule::new(PiiCategory::Phone, r"\b\d{3}[-.]?\d{3}[-.]?\d{4}\b", None),
        PatternRule::new(PiiCategory::GenericId, r"\b[A-Z]{2}\d{6,8}\b", None),
        PatternRule::new(PiiCategory::GenericId, r"(?i)\bID[-\s]?\d{6,10}\b", None),
        PatternRule::new(
            PiiCategory::IpAddress,
            r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}\b",
            Some(valid_ipv4),
        ),
    ]
});

/// Extra rules applied only when the HIPAA safe-harbor entity set is enabled:
/// calendar dates, URLs, and medical record numbers.
pub static SAFE_HARBOR_PATTERNS: Lazy<Vec<PatternRule>> = Lazy::new(|| {
    vec![
        PatternRule::new(
            PiiCategory::Date,
            r"\b\d{1,2}[/-]\d{1,2}[/-]\d{2,4}\b",
            None,
        ),
        PatternRule::new(
            PiiCategory::Date,
            r"(?i)\b(?:january|february|march|april|may|june|july|august|september|october|november|december)\s+\d{1,2},?\s+\d{4}\b",
            None,
        ),
        PatternRule::new(
            PiiCategory::Url,
            r"(?i)\bhttps?://[^\s<>\x22]+",
            None,
        ),
        PatternRule::new(PiiCategory::MedicalRecordNumber, r"(?i)\bMRN[-:\s]?\d{5,10}\b", None),
    ]
});

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(rules: &[PatternRule], category: PiiCategory, text: &str) -> bool {
        rules.iter().any(|r| {
            r.category == category
                && r.regex.find_iter(text).any(|m| {
                    r.validator.map(|v| v(m.as_str())).unwrap_or(true)
                })
        })
    }

    #[test]
    fn base_patterns_hit_expected_shapes() {
        let rules = &*BASE_PATTERNS;
        assert!(matches(rules, PiiCategory::Email, "reach me at jo.doe+x@corp.io"));
        assert!(matches(rules, PiiCategory::Phone, "call 555-123-4567"));
        assert!(matches(rules, PiiCategory::Phone, "call (555) 123-4567"));
        assert!(matches(rules, PiiCategory::Phone, "call +1 555-123-4567"));
        assert!(matches(rules, PiiCategory::Ssn, "ssn 123-45-6789"));
        assert!(matches(rules, PiiCategory::CreditCard, "card 4111-1111-1111-1111"));
        assert!(matches(rules, PiiCategory::GenericId, "passport AB1234567"));
        assert!(matches(rules, PiiCategory::IpAddress, "from 192.168.0.12"));
    }

    #[test]
    fn credit_card_validator_requires_sixteen_digits() {
        assert!(valid_credit_card("4111 1111 1111 1111"));
        assert!(!valid_credit_card("4111 1111 1111"));
    }

    #[test]
    fn ipv4_validator_rejects_out_of_range_octets() {
        assert!(valid_ipv4("10.0.0.1"));
        assert!(!valid_ipv4("999.0.0.1"));
        assert!(!matches(&BASE_PATTERNS, PiiCategory::IpAddress, "version 999.300.1.1"));
    }

    #[test]
    fn safe_harbor_patterns_hit_dates_urls_and_mrns() {
        let rules = &*SAFE_HARBOR_PATTERNS;
        assert!(matches(rules, PiiCategory::Date, "seen on 03/14/2024"));
        assert!(matches(rules, PiiCategory::Date, "admitted January 5, 2024"));
        assert!(matches(rules, PiiCategory::Url, "see https://intranet.example.com/chart"));
        assert!(matches(rules, PiiCategory::MedicalRecordNumber, "MRN: 8841923"));
    }
}
