//! Typed view over the RFC 5322 headers the classifier cares about

use mailparse::MailHeaderMap;

/// Header signals extracted once per message. All lookups are
/// case-insensitive per RFC 5322.
#[derive(Debug, Clone, Default)]
pub struct HeaderView {
    pub reply_to: Option<String>,
    pub return_path: Option<String>,
    pub list_unsubscribe: Option<String>,
    pub precedence: Option<String>,
    pub auto_submitted: Option<String>,
    pub x_autoreply: Option<String>,
    pub x_autoresponse: Option<String>,
    pub x_loop: Option<String>,
    pub x_failed_recipients: Option<String>,
    pub dkim_signatures: Vec<String>,
    pub received_spf: Option<String>,
    pub dmarc_result: Option<String>,
    pub sender: Option<String>,
    pub forwarded_for: Option<String>,
    pub x_spam_flag: Option<String>,
    pub x_mailer: Option<String>,
    pub content_type: Option<String>,
}

impl HeaderView {
    /// Build the view from parsed headers
    pub fn from_headers(headers: &[mailparse::MailHeader<'_>]) -> Self {
        Self {
            reply_to: headers.get_first_value("Reply-To"),
            return_path: headers.get_first_value("Return-Path"),
            list_unsubscribe: headers.get_first_value("List-Unsubscribe"),
            precedence: headers.get_first_value("Precedence"),
            auto_submitted: headers.get_first_value("Auto-Submitted"),
            x_autoreply: headers.get_first_value("X-Autoreply"),
            x_autoresponse: headers.get_first_value("X-Autoresponse"),
            x_loop: headers.get_first_value("X-Loop"),
            x_failed_recipients: headers.get_first_value("X-Failed-Recipients"),
            dkim_signatures: headers.get_all_values("DKIM-Signature"),
            received_spf: headers.get_first_value("Received-SPF"),
            dmarc_result: headers.get_first_value("X-DMARC-Result"),
            sender: headers.get_first_value("Sender"),
            forwarded_for: headers.get_first_value("X-Forwarded-For"),
            x_spam_flag: headers.get_first_value("X-Spam-Flag"),
            x_mailer: headers.get_first_value("X-Mailer"),
            content_type: headers.get_first_value("Content-Type"),
        }
    }

    /// `<>` or an empty Return-Path marks a bounce per RFC 3464 practice
    pub fn has_null_return_path(&self) -> bool {
        self.return_path
            .as_deref()
            .is_some_and(|v| v.trim() == "<>" || v.trim().is_empty())
    }

    /// Auto-Submitted other than "no" marks machine-generated mail
    pub fn is_auto_submitted(&self) -> bool {
        self.auto_submitted
            .as_deref()
            .is_some_and(|v| !v.trim().eq_ignore_ascii_case("no"))
    }

    pub fn has_autoreply_markers(&self) -> bool {
        self.x_autoreply.is_some() || self.x_autoresponse.is_some() || self.x_loop.is_some()
    }

    pub fn precedence_is(&self, value: &str) -> bool {
        self.precedence
            .as_deref()
            .is_some_and(|v| v.trim().eq_ignore_ascii_case(value))
    }

    /// multipart/report content marks a delivery status notification
    pub fn is_delivery_report(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|v| v.to_ascii_lowercase().contains("multipart/report"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view_for(raw: &str) -> HeaderView {
        let parsed = mailparse::parse_mail(raw.as_bytes()).unwrap();
        HeaderView::from_headers(&parsed.headers)
    }

    #[test]
    fn test_extracts_named_headers() {
        let view = view_for(
            "Return-Path: <>\r\n\
             Auto-Submitted: auto-replied\r\n\
             Precedence: bulk\r\n\
             List-Unsubscribe: <mailto:u@x.io>\r\n\
             DKIM-Signature: v=1; a=rsa-sha256\r\n\
             DKIM-Signature: v=1; a=ed25519-sha256\r\n\
             \r\nbody",
        );

        assert!(view.has_null_return_path());
        assert!(view.is_auto_submitted());
        assert!(view.precedence_is("bulk"));
        assert!(view.list_unsubscribe.is_some());
        assert_eq!(view.dkim_signatures.len(), 2);
    }

    #[test]
    fn test_auto_submitted_no_is_not_automatic() {
        let view = view_for("Auto-Submitted: no\r\n\r\nbody");
        assert!(!view.is_auto_submitted());
    }

    #[test]
    fn test_delivery_report_detection() {
        let view = view_for(
            "Content-Type: multipart/report; report-type=delivery-status\r\n\r\nbody",
        );
        assert!(view.is_delivery_report());
    }
}
