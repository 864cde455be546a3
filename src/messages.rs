//! Inbox messages.
//!
//! Parsing is deliberately shallow: RFC 822 headers, a single text body and a
//! base64 transfer encoding are handled, multipart bodies are shown as is.

use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, FixedOffset};

/// Message wraps up a stored message and what the inbox displays of it.
///
/// - `raw`: the text as read (or decrypted) from disk, which is what gets saved again
/// - `identifier`: the file the message came from
/// - `is_unread`: unread messages are still ratchet-encrypted, so only their date is known
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub is_unread: bool,
    pub identifier: PathBuf,
    pub raw: String,
    pub id: Option<String>,
    pub date: Option<DateTime<FixedOffset>>,
    pub sender: Option<String>,
    pub subject: Option<String>,
    pub headers: String,
    pub content: String,
    pub title: String,
}

/// split_headers separates the (unfolded) header fields from the body
fn split_headers(raw: &str) -> (Vec<(String, String)>, &str) {
    let mut fields: Vec<(String, String)> = Vec::new();
    let mut rest = raw;
    while !rest.is_empty() {
        let (line, next) = match rest.find('\n') {
            Some(i) => (&rest[..i], &rest[i + 1..]),
            None => (rest, ""),
        };
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            return (fields, next);
        }
        if line.starts_with([' ', '\t']) {
            match fields.last_mut() {
                Some((_, value)) => {
                    value.push(' ');
                    value.push_str(line.trim());
                }
                None => return (fields, rest),
            }
        } else {
            match line.split_once(':') {
                Some((name, value)) if !name.is_empty() && !name.contains(' ') => {
                    fields.push((name.to_string(), value.trim().to_string()))
                }
                // Not a header: the message has no header block
                _ => return (fields, rest),
            }
        }
        rest = next;
    }
    (fields, rest)
}

/// sender_address pulls the bare address out of a From value
fn sender_address(from: &str) -> Option<String> {
    from.split(|c: char| c.is_whitespace() || matches!(c, '<' | '>' | '(' | ')'))
        .find(|token| token.len() > 2 && token.contains('@'))
        .map(str::to_string)
}

impl Message {
    /// parse reads `raw` as an RFC 822 message
    pub fn parse(is_unread: bool, raw: &str, identifier: &Path) -> Message {
        let (fields, body) = split_headers(raw);
        let header = |name: &str| {
            fields
                .iter()
                .find(|(field, _)| field.eq_ignore_ascii_case(name))
                .map(|(_, value)| value.clone())
        };

        let id = header("Message-ID");
        let date = header("Date").and_then(|value| DateTime::parse_from_rfc2822(&value).ok());
        let sender = header("From").and_then(|value| sender_address(&value));
        let subject = header("Subject");

        let base64_body = header("Content-Transfer-Encoding").is_some_and(|value| value.eq_ignore_ascii_case("base64"));
        let content = if base64_body {
            let encoded: String = body.split_whitespace().collect();
            match BASE64.decode(encoded) {
                Ok(decoded) => String::from_utf8_lossy(&decoded).into_owned(),
                Err(_) => body.to_string(),
            }
        } else {
            body.to_string()
        };

        let title = if is_unread {
            match date {
                Some(date) => format!("Undecrypted message - {}", date),
                None => "Undecrypted message".to_string(),
            }
        } else {
            let mut title = date.map(|d| format!("{} ", d.format("%Y-%m-%d %H:%M"))).unwrap_or_default();
            match &sender {
                Some(sender) => title.push_str(&format!("{}: ", sender)),
                None => title = "Unknown sender: ".to_string(),
            }
            title.push_str(subject.as_deref().unwrap_or("(no subject)"));
            title
        };

        Message {
            is_unread,
            identifier: identifier.to_path_buf(),
            raw: raw.to_string(),
            id,
            date,
            sender,
            subject,
            headers: fields.iter().map(|(name, value)| format!("{}: {}", name, value)).collect::<Vec<_>>().join("\n"),
            content,
            title,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAIL: &str = "From: Bob <bob@example.org>\nTo: alice@nym.example\nSubject: lunch\n\
Date: Tue, 1 Jul 2003 10:52:37 +0200\nMessage-ID: <1@example.org>\n\nsee you\nat noon\n";

    #[test]
    fn parses_headers_and_body() {
        let message = Message::parse(false, MAIL, Path::new("m.txt"));
        assert_eq!(message.sender.as_deref(), Some("bob@example.org"));
        assert_eq!(message.subject.as_deref(), Some("lunch"));
        assert_eq!(message.id.as_deref(), Some("<1@example.org>"));
        assert_eq!(message.content, "see you\nat noon\n");
        assert_eq!(message.title, "2003-07-01 10:52 bob@example.org: lunch");
        assert!(message.headers.starts_with("From: Bob <bob@example.org>\nTo: alice@nym.example"));
        assert_eq!(message.date.unwrap().timestamp(), 1057049557);
    }

    #[test]
    fn unknown_sender_and_subject() {
        let message = Message::parse(false, "X-Note: hi\n\nbody", Path::new("m.txt"));
        assert_eq!(message.title, "Unknown sender: (no subject)");
        assert!(message.date.is_none());
    }

    #[test]
    fn unread_title() {
        let message = Message::parse(true, "-----BEGIN PGP MESSAGE-----\n\nAAAA\n-----END PGP MESSAGE-----\n", Path::new("m.txt"));
        assert_eq!(message.title, "Undecrypted message");
        assert!(message.headers.is_empty());
        assert!(message.content.starts_with("-----BEGIN PGP MESSAGE-----"));
    }

    #[test]
    fn folded_header_and_base64_body() {
        let raw = "Subject: a\n long subject\nContent-Transfer-Encoding: base64\n\naGVsbG8=\n";
        let message = Message::parse(false, raw, Path::new("m.txt"));
        assert_eq!(message.subject.as_deref(), Some("a long subject"));
        assert_eq!(message.content, "hello");
    }
}
