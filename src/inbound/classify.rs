//! Pure classification of inbound messages from headers + subject + envelope
//!
//! No I/O: the same inputs always yield the same label, and the rules
//! are evaluated strictly in order with the first match winning.

use crate::inbound::headers::HeaderView;
use crate::models::{Classification, EmailAddress};
use crate::validation::{domain_of, is_free_mail};

/// Subject fragments that flag a delivery failure report
const BOUNCE_SUBJECTS: &[&str] = &[
    "delivery status notification",
    "undeliverable",
    "undelivered mail",
    "mail delivery failed",
    "returned mail",
    "failure notice",
    "delivery failure",
];

/// Subject fragments that flag an automatic reply
const AUTO_REPLY_SUBJECTS: &[&str] = &[
    "automatic reply",
    "auto-reply",
    "autoreply",
    "out of office",
    "abwesenheit",
];

/// Subject fragments that need a human decision before any automation
const SENSITIVE_SUBJECTS: &[&str] = &[
    "lawsuit",
    "legal action",
    "legal notice",
    "attorney",
    "cease and desist",
    "fraud",
    "scam",
    "harassment",
    "complaint",
];

/// Mailer fingerprints left by inbox-warming tools
const WARMER_MARKERS: &[&str] = &["lemwarm", "warmup inbox", "mailwarm", "warmbox"];

/// Classify one inbound message. Rules run in a fixed order; the
/// returned reason names the rule that matched.
pub fn classify(
    headers: &HeaderView,
    subject: &str,
    from: &EmailAddress,
    to: &[EmailAddress],
) -> (Classification, String) {
    let subject_lower = subject.to_lowercase();
    let from_lower = from.address.to_lowercase();

    // Bounce notifications
    if headers.x_failed_recipients.is_some() {
        return (
            Classification::BounceNotification,
            "X-Failed-Recipients present".to_string(),
        );
    }
    if headers.has_null_return_path() && headers.is_delivery_report() {
        return (
            Classification::BounceNotification,
            "null return path with delivery report".to_string(),
        );
    }
    if from_lower.starts_with("mailer-daemon@") || from_lower.starts_with("postmaster@") {
        return (
            Classification::BounceNotification,
            format!("sender {}", from.address),
        );
    }
    if let Some(marker) = BOUNCE_SUBJECTS.iter().find(|m| subject_lower.contains(**m)) {
        return (
            Classification::BounceNotification,
            format!("subject contains {:?}", marker),
        );
    }

    // Auto-responders
    if headers.is_auto_submitted() {
        return (
            Classification::AutoResponder,
            "Auto-Submitted header".to_string(),
        );
    }
    if headers.has_autoreply_markers() || headers.precedence_is("auto_reply") {
        return (
            Classification::AutoResponder,
            "auto-reply headers".to_string(),
        );
    }
    if let Some(marker) = AUTO_REPLY_SUBJECTS
        .iter()
        .find(|m| subject_lower.contains(**m))
    {
        return (
            Classification::AutoResponder,
            format!("subject contains {:?}", marker),
        );
    }

    // Inbox warmers announce themselves through their mailer fingerprint
    if let Some(mailer) = headers.x_mailer.as_deref() {
        let mailer_lower = mailer.to_lowercase();
        if WARMER_MARKERS.iter().any(|m| mailer_lower.contains(m)) {
            return (
                Classification::EmailWarmer,
                format!("mailer {:?}", mailer),
            );
        }
    }

    // Upstream spam verdict
    if headers
        .x_spam_flag
        .as_deref()
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("yes"))
    {
        return (Classification::Spam, "X-Spam-Flag".to_string());
    }

    // Bulk senders
    if headers.precedence_is("bulk") || headers.precedence_is("list") {
        return (Classification::Bulk, "Precedence header".to_string());
    }
    if headers.list_unsubscribe.is_some() {
        return (Classification::Bulk, "List-Unsubscribe present".to_string());
    }

    // Internal: same domain on both ends of the envelope, excluding
    // free-mail providers where a shared domain means nothing.
    if let Some(sender_domain) = domain_of(&from.address) {
        let all_same_domain = !to.is_empty()
            && to
                .iter()
                .all(|rcpt| domain_of(&rcpt.address).as_deref() == Some(sender_domain.as_str()));
        if all_same_domain && !is_free_mail(&from.address) {
            return (
                Classification::Internal,
                format!("all participants on {}", sender_domain),
            );
        }
    }

    // Sensitive subjects
    if let Some(marker) = SENSITIVE_SUBJECTS
        .iter()
        .find(|m| subject_lower.contains(**m))
    {
        return (
            Classification::Sensitive,
            format!("subject contains {:?}", marker),
        );
    }

    (Classification::Ok, String::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(address: &str) -> EmailAddress {
        EmailAddress::new(address)
    }

    #[test]
    fn test_bounce_beats_everything() {
        let headers = HeaderView {
            x_failed_recipients: Some("b@y.io".into()),
            list_unsubscribe: Some("<mailto:u@x.io>".into()),
            ..Default::default()
        };
        let (classification, _) = classify(&headers, "anything", &addr("a@x.io"), &[addr("b@x.io")]);
        assert_eq!(classification, Classification::BounceNotification);
    }

    #[test]
    fn test_mailer_daemon_sender_is_bounce() {
        let (classification, reason) = classify(
            &HeaderView::default(),
            "whatever",
            &addr("MAILER-DAEMON@mx.y.io"),
            &[],
        );
        assert_eq!(classification, Classification::BounceNotification);
        assert!(reason.contains("MAILER-DAEMON"));
    }

    #[test]
    fn test_auto_responder_before_bulk() {
        let headers = HeaderView {
            auto_submitted: Some("auto-replied".into()),
            list_unsubscribe: Some("<mailto:u@x.io>".into()),
            ..Default::default()
        };
        let (classification, _) = classify(&headers, "Out of office", &addr("a@x.io"), &[]);
        assert_eq!(classification, Classification::AutoResponder);
    }

    #[test]
    fn test_bulk_from_list_unsubscribe() {
        let headers = HeaderView {
            list_unsubscribe: Some("<https://x.io/u>".into()),
            ..Default::default()
        };
        let (classification, _) = classify(&headers, "March newsletter", &addr("news@x.io"), &[]);
        assert_eq!(classification, Classification::Bulk);
    }

    #[test]
    fn test_internal_same_domain() {
        let (classification, _) = classify(
            &HeaderView::default(),
            "budget",
            &addr("a@corp.io"),
            &[addr("b@corp.io"), addr("c@corp.io")],
        );
        assert_eq!(classification, Classification::Internal);
    }

    #[test]
    fn test_free_mail_is_not_internal() {
        let (classification, _) = classify(
            &HeaderView::default(),
            "hi",
            &addr("a@gmail.com"),
            &[addr("b@gmail.com")],
        );
        assert_eq!(classification, Classification::Ok);
    }

    #[test]
    fn test_sensitive_subject() {
        let (classification, _) = classify(
            &HeaderView::default(),
            "Notice of legal action",
            &addr("a@x.io"),
            &[addr("b@y.io")],
        );
        assert_eq!(classification, Classification::Sensitive);
    }

    #[test]
    fn test_spam_flag() {
        let headers = HeaderView {
            x_spam_flag: Some("YES".into()),
            ..Default::default()
        };
        let (classification, _) = classify(&headers, "hi", &addr("a@x.io"), &[addr("b@y.io")]);
        assert_eq!(classification, Classification::Spam);
    }

    #[test]
    fn test_warmer_fingerprint() {
        let headers = HeaderView {
            x_mailer: Some("lemwarm v2".into()),
            ..Default::default()
        };
        let (classification, _) = classify(&headers, "hi", &addr("a@x.io"), &[addr("b@y.io")]);
        assert_eq!(classification, Classification::EmailWarmer);
    }

    #[test]
    fn test_classification_is_deterministic() {
        let headers = HeaderView::default();
        let first = classify(&headers, "plain message", &addr("a@x.io"), &[addr("b@y.io")]);
        let second = classify(&headers, "plain message", &addr("a@x.io"), &[addr("b@y.io")]);
        assert_eq!(first, second);
        assert_eq!(first.0, Classification::Ok);
    }
}
