//! Non-delivery notifications.
use crate::session::SmtpStatus;
use chrono::{DateTime, Utc};
use spool::Envelope;

/// Headers of the original message copied into the notification
const MAX_QUOTED_HEADER_BYTES: usize = 64 * 1024;

/// Build the notification telling the sender of `envelope` that the
/// message in `body` was refused with `status`.
/// Returns `None` for messages with the null sender, which must never
/// be answered with another bounce.
pub fn generate_bounce(
    envelope: &Envelope,
    body: &[u8],
    status: &SmtpStatus,
    hostname: &str,
    date: DateTime<Utc>,
) -> Option<(Envelope, Vec<String>)> {
    let sender = envelope.sender.as_deref().filter(|s| !s.is_empty())?;

    let bounce_envelope = Envelope {
        sender: None,
        recipients: vec![sender.to_string()],
    };

    let mut lines = vec![
        format!("From: Mail Delivery Subsystem <MAILER-DAEMON@{hostname}>"),
        format!("To: {sender}"),
        format!("Date: {}", date.to_rfc2822()),
        "Subject: Undelivered Mail Returned to Sender".to_string(),
        format!("Message-ID: <{}@{hostname}>", uuid::Uuid::new_v4().simple()),
        "MIME-Version: 1.0".to_string(),
        "Content-Type: text/plain; charset=utf-8".to_string(),
        String::new(),
        format!("This is the mail system at host {hostname}."),
        String::new(),
        "Your message could not be delivered to one or more recipients.".to_string(),
        "It has not been delivered to the following addresses:".to_string(),
        String::new(),
    ];
    for recipient in &envelope.recipients {
        lines.push(format!("    {recipient}"));
    }
    lines.push(String::new());
    lines.push(format!("The remote server responded: {status}"));
    lines.push(String::new());
    lines.push("The headers of your message follow.".to_string());
    lines.push(String::new());

    let mut quoted = 0;
    for line in crate::service::body_lines(body) {
        if line.is_empty() || quoted >= MAX_QUOTED_HEADER_BYTES {
            break;
        }
        quoted += line.len();
        lines.push(String::from_utf8_lossy(line).into_owned());
    }

    Some((bounce_envelope, lines))
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;

    fn envelope(sender: Option<&str>) -> Envelope {
        Envelope {
            sender: sender.map(|s| s.to_string()),
            recipients: vec!["a@remote.test".to_string(), "b@remote.test".to_string()],
        }
    }

    #[test]
    fn bounce() {
        let date = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        let status = SmtpStatus::new(550, "5.1.1 no such user");
        let (bounce_envelope, lines) = generate_bounce(
            &envelope(Some("alice@example.com")),
            b"Subject: hello\r\nFrom: alice@example.com\r\n\r\nsecret body\r\n",
            &status,
            "mx.example.com",
            date,
        )
        .unwrap();

        k9::assert_equal!(
            bounce_envelope,
            Envelope {
                sender: None,
                recipients: vec!["alice@example.com".to_string()],
            }
        );
        assert_eq!(
            lines[0],
            "From: Mail Delivery Subsystem <MAILER-DAEMON@mx.example.com>"
        );
        assert_eq!(lines[1], "To: alice@example.com");
        assert_eq!(lines[2], "Date: Fri, 1 Mar 2024 12:30:00 +0000");
        assert!(lines[4].starts_with("Message-ID: <"));
        assert!(lines[4].ends_with("@mx.example.com>"));

        let text = lines.join("\n");
        assert!(text.contains("    a@remote.test\n    b@remote.test"), "{text}");
        assert!(text.contains("550 5.1.1 no such user"), "{text}");
        assert!(text.contains("Subject: hello\nFrom: alice@example.com"), "{text}");
        assert!(!text.contains("secret body"), "{text}");
    }

    #[test]
    fn null_sender_is_never_bounced() {
        let status = SmtpStatus::new(550, "nope");
        assert!(generate_bounce(&envelope(None), b"x\n", &status, "h", Utc::now()).is_none());
        assert!(generate_bounce(&envelope(Some("")), b"x\n", &status, "h", Utc::now()).is_none());
    }
}
