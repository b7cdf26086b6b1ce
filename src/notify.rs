//! Notification delivery.
//!
//! The sink is a trait so the control loop never knows how a message leaves
//! the machine and tests can observe emissions directly. The production sink
//! speaks plain SMTP to the configured transport host; delivery is
//! best-effort and failures are the caller's to log.

use std::cell::RefCell;
use std::rc::Rc;

use lettre::message::header::ContentType;
use lettre::{Message, SmtpTransport, Transport};
use tracing::debug;

use crate::constants::SMTP_PORT;
use crate::error::NotifyError;

/// One outgoing notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Subject line, `Metasys: <event>`.
    pub subject: String,
    /// Message body; an HTML document when `html` is set.
    pub body: String,
    /// Whether the body is HTML.
    pub html: bool,
}

/// Destination for notifications.
pub trait NotificationSink {
    /// Delivers one notification to the given recipients via `mta_host`.
    fn emit(
        &mut self,
        recipients: &[String],
        mta_host: &str,
        note: &Notification,
    ) -> Result<(), NotifyError>;
}

/// SMTP sink delivering through the configured mail transport host.
pub struct SmtpSink {
    sender: String,
}

impl SmtpSink {
    /// Creates a sink sending as `metasys@<hostname>`.
    pub fn new(hostname: &str) -> Self {
        Self {
            sender: format!("metasys@{hostname}"),
        }
    }
}

impl NotificationSink for SmtpSink {
    fn emit(
        &mut self,
        recipients: &[String],
        mta_host: &str,
        note: &Notification,
    ) -> Result<(), NotifyError> {
        let mut builder = Message::builder()
            .from(self.sender.parse()?)
            .subject(note.subject.as_str());
        for recipient in recipients {
            builder = builder.to(recipient.parse()?);
        }

        let message = if note.html {
            builder
                .header(ContentType::TEXT_HTML)
                .body(note.body.clone())?
        } else {
            builder.body(note.body.clone())?
        };

        let mailer = SmtpTransport::builder_dangerous(mta_host)
            .port(SMTP_PORT)
            .build();
        mailer.send(&message)?;
        debug!("Delivered '{}' to {} recipient(s)", note.subject, recipients.len());
        Ok(())
    }
}

/// In-memory sink capturing emissions, shared with the test that inspects it.
#[derive(Clone, Default)]
pub struct BufferSink {
    sent: Rc<RefCell<Vec<Notification>>>,
}

impl BufferSink {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything emitted so far.
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.borrow().clone()
    }
}

impl NotificationSink for BufferSink {
    fn emit(
        &mut self,
        _recipients: &[String],
        _mta_host: &str,
        note: &Notification,
    ) -> Result<(), NotifyError> {
        self.sent.borrow_mut().push(note.clone());
        Ok(())
    }
}

/// Name of this host, used for sender addresses and message bodies.
pub fn hostname() -> String {
    nix::unistd::gethostname()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_sink_captures_notifications() {
        let sink = BufferSink::new();
        let mut handle = sink.clone();
        let note = Notification {
            subject: "Metasys: test".to_string(),
            body: "hello".to_string(),
            html: false,
        };

        handle
            .emit(&["ops@example.com".to_string()], "localhost", &note)
            .expect("emit");

        assert_eq!(sink.sent(), vec![note]);
    }

    #[test]
    fn smtp_sink_rejects_malformed_recipients_before_connecting() {
        let mut sink = SmtpSink::new("host1");
        let note = Notification {
            subject: "Metasys: test".to_string(),
            body: "hello".to_string(),
            html: false,
        };

        let err = sink
            .emit(&["not an address".to_string()], "localhost", &note)
            .unwrap_err();
        assert!(matches!(err, NotifyError::Address(_)));
    }

    #[test]
    fn hostname_is_nonempty() {
        assert!(!hostname().is_empty());
    }
}
