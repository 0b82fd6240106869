use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::{Message, SendmailTransport, Transport};

use crate::error::HostWatchError;

use super::MailSender;

/// Hands mail to the local `sendmail`-compatible program
pub struct SendmailMailer {
    program: String,
    from: String,
}

impl SendmailMailer {
    pub fn new(program: &str, from: &str) -> Self {
        SendmailMailer {
            program: program.to_owned(),
            from: from.to_owned(),
        }
    }

    fn build_message(&self, to: &str, subject: &str, body: &str) -> Result<Message, HostWatchError> {
        let from: Mailbox = self
            .from
            .parse()
            .map_err(|e| HostWatchError::MailError(format!("invalid from address: {}", e)))?;
        let to: Mailbox = to
            .parse()
            .map_err(|e| HostWatchError::MailError(format!("invalid to address: {}", e)))?;

        Message::builder()
            .from(from)
            .to(to)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_owned())
            .map_err(|e| HostWatchError::MailError(format!("failed to build email: {}", e)))
    }
}

impl MailSender for SendmailMailer {
    fn is_available(&self) -> bool {
        which::which(&self.program).is_ok()
    }

    fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), HostWatchError> {
        let email = self.build_message(to, subject, body)?;

        SendmailTransport::new_with_command(&self.program)
            .send(&email)
            .map_err(|e| HostWatchError::MailError(format!("sendmail failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_message_headers() {
        let mailer = SendmailMailer::new("sendmail", "hostwatch@localhost");
        let email = mailer
            .build_message("ops@example.com", "Backup failed on db01", "run log")
            .unwrap();

        let raw = String::from_utf8(email.formatted()).unwrap();
        assert!(raw.contains("To: ops@example.com"));
        assert!(raw.contains("Subject: Backup failed on db01"));
        assert!(raw.contains("run log"));
    }

    #[test]
    fn test_invalid_recipient_is_rejected() {
        let mailer = SendmailMailer::new("sendmail", "hostwatch@localhost");
        let result = mailer.build_message("not an address", "s", "b");
        assert!(matches!(result, Err(HostWatchError::MailError(_))));
    }

    #[test]
    fn test_missing_program_is_unavailable() {
        let mailer = SendmailMailer::new("/nonexistent/hostwatch-sendmail", "hostwatch@localhost");
        assert!(!mailer.is_available());
    }
}
