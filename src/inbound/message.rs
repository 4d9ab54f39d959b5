//! Raw RFC 5322 message parsing into the shape the processor persists

use crate::error::{MailError, MailResult};
use crate::inbound::headers::HeaderView;
use crate::models::EmailAddress;
use crate::utils::{normalize_message_id, split_references};
use chrono::{DateTime, TimeZone, Utc};
use mailparse::{DispositionType, MailAddr, MailHeaderMap, ParsedMail};

/// One attachment cut out of the MIME tree
#[derive(Debug, Clone)]
pub struct ParsedAttachment {
    pub filename: String,
    pub content_type: String,
    pub inline: bool,
    pub bytes: Vec<u8>,
}

/// A fully parsed inbound message
#[derive(Debug, Clone)]
pub struct ParsedEmail {
    pub headers: HeaderView,
    pub message_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    pub subject: String,
    pub from: EmailAddress,
    pub to: Vec<EmailAddress>,
    pub cc: Vec<EmailAddress>,
    pub bcc: Vec<EmailAddress>,
    pub reply_to: Option<EmailAddress>,
    pub date: Option<DateTime<Utc>>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub raw_headers: String,
    pub attachments: Vec<ParsedAttachment>,
}

/// Parse raw message bytes. Fails only on structurally unparseable
/// input; individual missing headers degrade to defaults.
pub fn parse_raw(raw: &[u8]) -> MailResult<ParsedEmail> {
    let parsed = mailparse::parse_mail(raw)?;

    let headers = HeaderView::from_headers(&parsed.headers);

    let message_id = parsed
        .headers
        .get_first_value("Message-ID")
        .map(|v| format!("<{}>", normalize_message_id(&v)))
        .filter(|v| v.len() > 2);
    let in_reply_to = parsed
        .headers
        .get_first_value("In-Reply-To")
        .map(|v| format!("<{}>", normalize_message_id(&v)))
        .filter(|v| v.len() > 2);
    let references = parsed
        .headers
        .get_first_value("References")
        .map(|v| split_references(&v))
        .unwrap_or_default();

    let subject = parsed.headers.get_first_value("Subject").unwrap_or_default();

    let from = parse_address_list(&parsed, "From")
        .into_iter()
        .next()
        .unwrap_or_else(|| EmailAddress::new(""));
    let to = parse_address_list(&parsed, "To");
    let cc = parse_address_list(&parsed, "Cc");
    let bcc = parse_address_list(&parsed, "Bcc");
    let reply_to = parse_address_list(&parsed, "Reply-To").into_iter().next();

    let date = parsed
        .headers
        .get_first_value("Date")
        .and_then(|v| mailparse::dateparse(&v).ok())
        .and_then(|epoch| Utc.timestamp_opt(epoch, 0).single());

    let mut body_text = None;
    let mut body_html = None;
    let mut attachments = Vec::new();
    walk_parts(&parsed, &mut body_text, &mut body_html, &mut attachments)?;

    // A message with only an HTML part still gets a text body
    if body_text.is_none() {
        if let Some(html) = &body_html {
            body_text = Some(html2text::from_read(html.as_bytes(), 80));
        }
    }

    Ok(ParsedEmail {
        headers,
        message_id,
        in_reply_to,
        references,
        subject,
        from,
        to,
        cc,
        bcc,
        reply_to,
        date,
        body_text,
        body_html,
        raw_headers: raw_header_block(raw),
        attachments,
    })
}

fn parse_address_list(parsed: &ParsedMail<'_>, header: &str) -> Vec<EmailAddress> {
    let Some(value) = parsed.headers.get_first_value(header) else {
        return Vec::new();
    };

    match mailparse::addrparse(&value) {
        Ok(list) => list
            .iter()
            .flat_map(|addr| match addr {
                MailAddr::Single(single) => vec![EmailAddress {
                    name: single.display_name.clone(),
                    address: single.addr.clone(),
                }],
                MailAddr::Group(group) => group
                    .addrs
                    .iter()
                    .map(|single| EmailAddress {
                        name: single.display_name.clone(),
                        address: single.addr.clone(),
                    })
                    .collect(),
            })
            .collect(),
        Err(_) => Vec::new(),
    }
}

fn walk_parts(
    part: &ParsedMail<'_>,
    body_text: &mut Option<String>,
    body_html: &mut Option<String>,
    attachments: &mut Vec<ParsedAttachment>,
) -> MailResult<()> {
    if part.subparts.is_empty() {
        let disposition = part.get_content_disposition();
        let filename = disposition
            .params
            .get("filename")
            .cloned()
            .or_else(|| part.ctype.params.get("name").cloned());

        let is_attachment = disposition.disposition == DispositionType::Attachment
            || (disposition.disposition == DispositionType::Inline && filename.is_some());

        if is_attachment {
            attachments.push(ParsedAttachment {
                filename: filename.unwrap_or_else(|| "attachment".to_string()),
                content_type: part.ctype.mimetype.clone(),
                inline: disposition.disposition == DispositionType::Inline,
                bytes: part.get_body_raw()?,
            });
            return Ok(());
        }

        match part.ctype.mimetype.as_str() {
            "text/plain" if body_text.is_none() => {
                *body_text = Some(part.get_body()?);
            }
            "text/html" if body_html.is_none() => {
                *body_html = Some(part.get_body()?);
            }
            _ => {}
        }
        return Ok(());
    }

    for subpart in &part.subparts {
        walk_parts(subpart, body_text, body_html, attachments)?;
    }
    Ok(())
}

/// The header block verbatim, up to the first empty line
fn raw_header_block(raw: &[u8]) -> String {
    let boundary = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| p + 2)
        .or_else(|| raw.windows(2).position(|w| w == b"\n\n").map(|p| p + 1))
        .unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..boundary]).into_owned()
}

/// Deterministic synthetic Message-ID for messages that arrived without
/// one, derived from the content hash so re-ingest stays idempotent.
pub fn synthesize_message_id(raw: &[u8], domain: &str) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(raw);
    let hex: String = digest
        .iter()
        .take(16)
        .map(|b| format!("{:02x}", b))
        .collect();
    format!("<{}@{}>", hex, domain)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE: &str = "Message-ID: <m1@x>\r\n\
        From: Ada <a@x.io>\r\n\
        To: b@y.io, Carol <c@z.io>\r\n\
        Subject: Re: hello\r\n\
        Date: Mon, 6 Jan 2025 10:00:00 +0000\r\n\
        Content-Type: text/plain\r\n\
        \r\n\
        hi there\r\n";

    #[test]
    fn test_parse_simple_message() {
        let parsed = parse_raw(SIMPLE.as_bytes()).unwrap();
        assert_eq!(parsed.message_id.as_deref(), Some("<m1@x>"));
        assert_eq!(parsed.from.address, "a@x.io");
        assert_eq!(parsed.from.name.as_deref(), Some("Ada"));
        assert_eq!(parsed.to.len(), 2);
        assert_eq!(parsed.subject, "Re: hello");
        assert_eq!(parsed.body_text.as_deref(), Some("hi there\r\n"));
        assert!(parsed.body_html.is_none());
        assert!(parsed.date.is_some());
        assert!(parsed.raw_headers.contains("Message-ID: <m1@x>"));
        assert!(!parsed.raw_headers.contains("hi there"));
    }

    #[test]
    fn test_parse_references() {
        let raw = "Message-ID: <m3@x>\r\n\
            In-Reply-To: <m2@x>\r\n\
            References: <m1@x> <m2@x>\r\n\
            From: a@x.io\r\n\
            Subject: re\r\n\r\nbody";
        let parsed = parse_raw(raw.as_bytes()).unwrap();
        assert_eq!(parsed.in_reply_to.as_deref(), Some("<m2@x>"));
        assert_eq!(parsed.references, vec!["<m1@x>", "<m2@x>"]);
    }

    #[test]
    fn test_parse_multipart_with_attachment() {
        let raw = "Message-ID: <m4@x>\r\n\
            From: a@x.io\r\n\
            Subject: files\r\n\
            Content-Type: multipart/mixed; boundary=\"b\"\r\n\
            \r\n\
            --b\r\n\
            Content-Type: text/plain\r\n\
            \r\n\
            see attachment\r\n\
            --b\r\n\
            Content-Type: application/pdf; name=\"doc.pdf\"\r\n\
            Content-Disposition: attachment; filename=\"doc.pdf\"\r\n\
            Content-Transfer-Encoding: base64\r\n\
            \r\n\
            aGVsbG8=\r\n\
            --b--\r\n";
        let parsed = parse_raw(raw.as_bytes()).unwrap();
        assert!(parsed.body_text.as_deref().unwrap().contains("see attachment"));
        assert_eq!(parsed.attachments.len(), 1);
        assert_eq!(parsed.attachments[0].filename, "doc.pdf");
        assert_eq!(parsed.attachments[0].bytes, b"hello");
        assert!(!parsed.attachments[0].inline);
    }

    #[test]
    fn test_html_only_gets_text_fallback() {
        let raw = "Message-ID: <m5@x>\r\n\
            From: a@x.io\r\n\
            Subject: html\r\n\
            Content-Type: text/html\r\n\
            \r\n\
            <p>rendered</p>";
        let parsed = parse_raw(raw.as_bytes()).unwrap();
        assert!(parsed.body_html.is_some());
        assert!(parsed.body_text.unwrap().contains("rendered"));
    }

    #[test]
    fn test_synthesized_id_is_deterministic() {
        let a = synthesize_message_id(b"same bytes", "x.io");
        let b = synthesize_message_id(b"same bytes", "x.io");
        let c = synthesize_message_id(b"other bytes", "x.io");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.ends_with("@x.io>"));
    }
}
