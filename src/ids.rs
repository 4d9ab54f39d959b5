//! Opaque short identifiers with entity-tag prefixes
//!
//! Ids look like `mbox_k3v9q2h7x1p8d0sf` so log lines stay readable
//! without joining against the database.

use rand::distributions::Alphanumeric;
use rand::Rng;

const ID_LEN: usize = 16;

/// Entity tags used as id prefixes
pub mod tag {
    pub const MAILBOX: &str = "mbox";
    pub const EMAIL: &str = "email";
    pub const THREAD: &str = "thrd";
    pub const ATTACHMENT: &str = "att";
    pub const ORPHAN: &str = "orph";
    pub const SENDER: &str = "sender";
}

/// Generate a new id with the given entity tag
pub fn new_id(tag: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ID_LEN)
        .map(|c| (c as char).to_ascii_lowercase())
        .collect();
    format!("{}_{}", tag, suffix)
}

/// Check whether an id carries the expected entity tag
pub fn has_tag(id: &str, tag: &str) -> bool {
    id.strip_prefix(tag).is_some_and(|rest| rest.starts_with('_'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_shape() {
        let id = new_id(tag::MAILBOX);
        assert!(id.starts_with("mbox_"));
        assert_eq!(id.len(), "mbox_".len() + ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'));
    }

    #[test]
    fn test_ids_are_unique() {
        let a = new_id(tag::EMAIL);
        let b = new_id(tag::EMAIL);
        assert_ne!(a, b);
    }

    #[test]
    fn test_has_tag() {
        assert!(has_tag("thrd_abc123", tag::THREAD));
        assert!(!has_tag("thrdabc123", tag::THREAD));
        assert!(!has_tag("email_abc123", tag::THREAD));
    }
}
