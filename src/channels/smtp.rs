//! Outbound transmission via SMTP (lettre).

use std::time::Duration;

use async_trait::async_trait;
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::{ExposeSecret, SecretString};
use uuid::Uuid;

use crate::error::TransportError;
use crate::pipeline::types::SenderIdentity;

/// A message ready for transmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMail {
    pub from: SenderIdentity,
    pub to: String,
    pub reply_to: Option<String>,
    pub subject: String,
    pub text: String,
    pub html: String,
}

/// Sends one message and returns its transport message id.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, mail: OutboundMail) -> Result<String, TransportError>;
}

/// SMTP relay settings. The login user is the sending identity's address.
#[derive(Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub password: SecretString,
    pub timeout: Duration,
}

impl std::fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("password", &"[REDACTED]")
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Blocking lettre transport, driven from `spawn_blocking`.
#[derive(Debug, Clone)]
pub struct SmtpMailer {
    config: SmtpConfig,
}

impl SmtpMailer {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }

    fn transport_for(&self, sender: &SenderIdentity) -> Result<SmtpTransport, TransportError> {
        let creds = Credentials::new(
            sender.address.clone(),
            self.config.password.expose_secret().to_string(),
        );

        // 465 speaks TLS from the first byte; everything else upgrades via STARTTLS.
        let builder = if self.config.port == 465 {
            SmtpTransport::relay(&self.config.host)
        } else {
            SmtpTransport::starttls_relay(&self.config.host)
        }
        .map_err(|e| TransportError::Send(format!("SMTP relay error: {e}")))?;

        Ok(builder
            .port(self.config.port)
            .credentials(creds)
            .timeout(Some(self.config.timeout))
            .build())
    }
}

#[async_trait]
impl MailTransport for SmtpMailer {
    async fn send(&self, mail: OutboundMail) -> Result<String, TransportError> {
        let (message, message_id) = build_message(&mail)?;
        let transport = self.transport_for(&mail.from)?;
        let to = mail.to.clone();

        tokio::task::spawn_blocking(move || transport.send(&message))
            .await
            .map_err(|e| TransportError::Send(format!("send task panicked: {e}")))?
            .map_err(|e| TransportError::Send(e.to_string()))?;

        tracing::info!(to = %to, sender = %mail.from.address, "Resend delivered to SMTP relay");
        Ok(message_id)
    }
}

fn parse_mailbox(name: Option<String>, address: &str) -> Result<Mailbox, TransportError> {
    let addr = address
        .parse::<lettre::Address>()
        .map_err(|e| TransportError::InvalidAddress {
            address: address.to_string(),
            reason: e.to_string(),
        })?;
    Ok(Mailbox::new(name, addr))
}

/// Build the MIME message and the `Message-ID` it carries.
pub fn build_message(mail: &OutboundMail) -> Result<(Message, String), TransportError> {
    let from = parse_mailbox(Some(mail.from.display_name.clone()), &mail.from.address)?;
    let to = parse_mailbox(None, &mail.to)?;

    let domain = mail
        .from
        .address
        .rsplit_once('@')
        .map_or("localhost", |(_, d)| d);
    let message_id = format!("<{}@{}>", Uuid::new_v4(), domain);

    let mut builder = Message::builder()
        .from(from)
        .to(to)
        .subject(mail.subject.clone())
        .message_id(Some(message_id.clone()));

    if let Some(reply_to) = &mail.reply_to {
        builder = builder.reply_to(parse_mailbox(None, reply_to)?);
    }

    let message = builder
        .multipart(MultiPart::alternative_plain_html(
            mail.text.clone(),
            mail.html.clone(),
        ))
        .map_err(|e| TransportError::Build(e.to_string()))?;

    Ok((message, message_id))
}
