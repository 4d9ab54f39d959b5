//! Small shared helpers for mail processing

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;

/// Strip reply/forward prefixes and collapse whitespace so subjects can
/// be compared across a conversation.
pub fn normalize_subject(subject: &str) -> String {
    let mut result = subject.trim();

    loop {
        let lowered = result.to_lowercase();
        let stripped = ["re:", "fwd:", "fw:", "aw:", "wg:"]
            .iter()
            .find(|prefix| lowered.starts_with(**prefix))
            .map(|prefix| result[prefix.len()..].trim_start());
        match stripped {
            Some(rest) => result = rest,
            None => break,
        }
    }

    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Lowercase and trim an address for comparisons
pub fn normalize_email(address: &str) -> String {
    address.trim().to_lowercase()
}

/// Strip angle brackets and whitespace from a Message-ID header value
pub fn normalize_message_id(value: &str) -> String {
    value.trim().trim_start_matches('<').trim_end_matches('>').to_string()
}

/// Generate an RFC 5322 Message-ID under the sender's domain
pub fn generate_message_id(domain: &str, now: DateTime<Utc>) -> String {
    let token: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(|c| (c as char).to_ascii_lowercase())
        .collect();
    format!("<{}.{}@{}>", now.timestamp_millis(), token, domain)
}

/// Split a References header into individual Message-IDs
pub fn split_references(value: &str) -> Vec<String> {
    value
        .split_whitespace()
        .map(|part| normalize_message_id(part))
        .filter(|id| !id.is_empty())
        .map(|id| format!("<{}>", id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_subject_strips_prefixes() {
        assert_eq!(normalize_subject("Re: Hello"), "Hello");
        assert_eq!(normalize_subject("RE: Fwd: Hello"), "Hello");
        assert_eq!(normalize_subject("fw:  spaced   out "), "spaced out");
        assert_eq!(normalize_subject("Regarding the offer"), "Regarding the offer");
    }

    #[test]
    fn test_normalize_message_id() {
        assert_eq!(normalize_message_id(" <m1@x> "), "m1@x");
        assert_eq!(normalize_message_id("m1@x"), "m1@x");
    }

    #[test]
    fn test_generate_message_id_shape() {
        let id = generate_message_id("x.io", Utc::now());
        assert!(id.starts_with('<'));
        assert!(id.ends_with("@x.io>"));
    }

    #[test]
    fn test_split_references() {
        let refs = split_references("<a@x> <b@y>\t<c@z>");
        assert_eq!(refs, vec!["<a@x>", "<b@y>", "<c@z>"]);
        assert!(split_references("  ").is_empty());
    }
}
