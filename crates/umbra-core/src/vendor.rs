//! Vendor name extraction
//!
//! Deterministic string heuristic applied at persistence time. The rule is
//! intentionally conservative: a short or generic result is treated as no
//! vendor at all.

use crate::types::Platform;
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    /// Suffixes like "for Slack", "OAuth", "API", "App"
    static ref SUFFIX_RE: Regex =
        Regex::new(r"(?i)\s*(for [A-Za-z ]+|OAuth|API|App)\s*$").unwrap();
    /// Trailing domain extensions
    static ref TLD_RE: Regex = Regex::new(r"(?i)\.(com|io|ai|net|org)$").unwrap();
    /// Ids that carry no vendor signal
    static ref NUMERIC_RE: Regex = Regex::new(r"^[0-9\-_.]+$").unwrap();
}

/// Generic prefixes that disqualify a display text as a vendor source
const GENERIC_PREFIXES: &[&str] = &["OAuth App:", "oauth app:", "app_", "client_"];

/// Extract a vendor name from an automation's display text.
///
/// Returns `None` when the text carries no usable vendor signal. Idempotent:
/// `extract(extract(x)) == extract(x)`.
pub fn extract_vendor_name(display: &str) -> Option<String> {
    let trimmed = display.trim();
    if trimmed.is_empty() {
        return None;
    }
    if GENERIC_PREFIXES.iter().any(|p| trimmed.starts_with(p)) {
        return None;
    }

    let mut name = trimmed.to_string();
    // Strip qualifier suffixes repeatedly; "Attio CRM App for Slack" has two
    loop {
        let stripped = SUFFIX_RE.replace(&name, "").to_string();
        if stripped == name {
            break;
        }
        name = stripped;
    }
    name = TLD_RE.replace(&name, "").to_string();

    let first = name.trim().split_whitespace().next()?.to_string();
    if first.len() < 3 || NUMERIC_RE.is_match(&first) {
        return None;
    }
    Some(first)
}

/// Compute the display grouping key: `lower(vendor_name) || '-' || platform`
pub fn vendor_group(vendor_name: Option<&str>, platform: Platform) -> Option<String> {
    vendor_name.map(|v| format!("{}-{}", v.to_lowercase(), platform.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_qualifier_suffixes() {
        assert_eq!(extract_vendor_name("Attio for Slack"), Some("Attio".into()));
        assert_eq!(extract_vendor_name("Zapier OAuth"), Some("Zapier".into()));
        assert_eq!(extract_vendor_name("Notion API"), Some("Notion".into()));
        assert_eq!(extract_vendor_name("Linear App"), Some("Linear".into()));
    }

    #[test]
    fn strips_trailing_domains() {
        assert_eq!(extract_vendor_name("clearbit.com"), Some("clearbit".into()));
        assert_eq!(extract_vendor_name("jasper.ai"), Some("jasper".into()));
    }

    #[test]
    fn takes_first_token() {
        assert_eq!(extract_vendor_name("Attio CRM"), Some("Attio".into()));
        assert_eq!(
            extract_vendor_name("Zapier Workflow Builder"),
            Some("Zapier".into())
        );
    }

    #[test]
    fn rejects_short_and_generic_inputs() {
        assert_eq!(extract_vendor_name("ab"), None);
        assert_eq!(extract_vendor_name("12345"), None);
        assert_eq!(extract_vendor_name("OAuth App: 99231"), None);
        assert_eq!(extract_vendor_name(""), None);
        assert_eq!(extract_vendor_name("   "), None);
    }

    #[test]
    fn extraction_is_idempotent() {
        for input in [
            "Attio for Slack",
            "Zapier Workflow Builder",
            "clearbit.com",
            "Notion API",
            "HubSpot CRM App",
        ] {
            let once = extract_vendor_name(input);
            let twice = once.as_deref().and_then(extract_vendor_name);
            assert_eq!(once, twice, "not idempotent for {input:?}");
        }
    }

    #[test]
    fn group_key_is_lowercased_and_platform_scoped() {
        assert_eq!(
            vendor_group(Some("Attio"), Platform::Google),
            Some("attio-google".into())
        );
        assert_eq!(vendor_group(None, Platform::Slack), None);
    }
}
