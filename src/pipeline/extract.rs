//! Recovers the bounced recipient address from a failure notification.
//!
//! Rules run in order over the joined plain-text and HTML bodies. Each
//! rule's matches are tried left to right; the first address that does not
//! belong to one of the operator's own domains is returned, lowercased.

use regex::Regex;

use crate::pipeline::types::RawMessage;

const EMAIL: &str = r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}";

/// Ordered extraction rules plus the own-domain filter.
#[derive(Debug, Clone)]
pub struct BounceExtractor {
    rules: Vec<Regex>,
    own_domains: Vec<String>,
}

impl BounceExtractor {
    /// Default rule order:
    /// 1. an address after "failed" / "rejected" / "undeliverable"
    /// 2. an address after "recipient" / "address"
    /// 3. a `To:` header line
    /// 4. an address before "does not exist" / "unknown" / "invalid"
    pub fn new(own_domains: Vec<String>) -> Self {
        let patterns = [
            format!(r"(?i)(?:failed|rejected|undeliverable).*?({EMAIL})"),
            format!(r"(?i)(?:recipient|address).*?({EMAIL})"),
            format!(r"(?i)To:\s*<?({EMAIL})>?"),
            format!(r"(?i)({EMAIL}).*?(?:does not exist|unknown|invalid)"),
        ];
        let rules = patterns
            .iter()
            .map(|p| Regex::new(p).expect("built-in extraction pattern compiles"))
            .collect();
        Self {
            rules,
            own_domains: own_domains
                .into_iter()
                .map(|d| d.trim().to_lowercase())
                .filter(|d| !d.is_empty())
                .collect(),
        }
    }

    /// Extract the bounced address, or `None` if no usable candidate exists.
    pub fn extract(&self, message: &RawMessage) -> Option<String> {
        self.extract_from_text(&message.extraction_text())
    }

    pub fn extract_from_text(&self, text: &str) -> Option<String> {
        for rule in &self.rules {
            for caps in rule.captures_iter(text) {
                let Some(m) = caps.get(1) else {
                    continue;
                };
                let email = m.as_str().to_lowercase();
                if !self.is_own_address(&email) {
                    return Some(email);
                }
            }
        }
        None
    }

    /// Whether the address's domain contains one of the own-domain markers.
    pub fn is_own_address(&self, email: &str) -> bool {
        let domain = email.rsplit_once('@').map_or(email, |(_, d)| d);
        let domain = domain.to_lowercase();
        self.own_domains.iter().any(|d| domain.contains(d.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> BounceExtractor {
        BounceExtractor::new(vec!["enterprise-universe".into()])
    }

    #[test]
    fn failed_delivery_line() {
        let e = extractor();
        assert_eq!(
            e.extract_from_text("Delivery to the following recipient failed permanently: Jane.Doe@Example.com"),
            Some("jane.doe@example.com".into())
        );
    }

    #[test]
    fn recipient_rule() {
        let e = extractor();
        assert_eq!(
            e.extract_from_text("Final-Recipient: rfc822; x@y.com"),
            Some("x@y.com".into())
        );
    }

    #[test]
    fn to_header_rule() {
        let e = extractor();
        assert_eq!(
            e.extract_from_text("Original message follows\nTo: <buyer@shop.de>\nSubject: Invoice"),
            Some("buyer@shop.de".into())
        );
    }

    #[test]
    fn trailing_unknown_rule() {
        let e = extractor();
        assert_eq!(
            e.extract_from_text("x@y.com: user unknown"),
            Some("x@y.com".into())
        );
    }

    #[test]
    fn own_domain_is_skipped_for_next_match() {
        let e = extractor();
        let text = "Delivery failed: invoice@enterprise-universe.com could not relay. \
                    Rejected by customer@client.org";
        assert_eq!(e.extract_from_text(text), Some("customer@client.org".into()));
    }

    #[test]
    fn own_domain_only_yields_none() {
        let e = extractor();
        assert_eq!(
            e.extract_from_text("delivery failed: info@enterprise-universe.one"),
            None
        );
    }

    #[test]
    fn no_address_yields_none() {
        let e = extractor();
        assert_eq!(e.extract_from_text("Mail delivery failed, sorry."), None);
    }

    #[test]
    fn rule_order_beats_text_order() {
        let e = extractor();
        // Rule 1 (failed/rejected) wins over rule 3 (To:) even though the
        // To: header appears earlier in the text.
        let text = "To: first@a.com\nrejected: second@b.com";
        assert_eq!(e.extract_from_text(text), Some("second@b.com".into()));
    }

    #[test]
    fn html_body_is_searched() {
        let e = extractor();
        let m = RawMessage {
            uid: "7".into(),
            html: Some("<p>Recipient address: <b>x@y.com</b></p>".into()),
            ..Default::default()
        };
        assert_eq!(e.extract(&m), Some("x@y.com".into()));
    }

    #[test]
    fn own_address_matches_domain_only() {
        let e = extractor();
        assert!(e.is_own_address("info@enterprise-universe.com"));
        assert!(e.is_own_address("x@mail.Enterprise-Universe.one"));
        assert!(!e.is_own_address("enterprise-universe@gmail.com"));
    }

    #[test]
    fn empty_markers_filter_nothing() {
        let e = BounceExtractor::new(vec![" ".into()]);
        assert!(!e.is_own_address("a@b.com"));
    }
}
