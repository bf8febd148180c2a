use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use lettre::{
    message::{Mailbox, MultiPart},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use tracing::info;

use crate::config::SmtpConfig;

/// A message ready to hand to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingEmail {
    pub to: String,
    pub subject: String,
    pub text: String,
    pub html: String,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: OutgoingEmail) -> anyhow::Result<()>;
}

pub fn verification_email(to: &str, code: &str) -> OutgoingEmail {
    OutgoingEmail {
        to: to.to_string(),
        subject: "Email Verification".into(),
        text: format!("Your verification code is: {code}\nThis code will expire in 10 minutes."),
        html: format!(
            "<p>Your verification code is: <strong>{code}</strong></p>\n\
             <p>This code will expire in 10 minutes.</p>"
        ),
    }
}

pub fn reset_email(to: &str, reset_url: &str) -> OutgoingEmail {
    OutgoingEmail {
        to: to.to_string(),
        subject: "Password Reset Request".into(),
        text: format!(
            "You requested a password reset.\n\
             Open this link to choose a new password: {reset_url}\n\
             This link will expire in 10 minutes. If you did not request it, ignore this email."
        ),
        html: format!(
            "<p>You have requested a password reset.</p>\n\
             <p>Please click the link below to reset your password:</p>\n\
             <a href=\"{reset_url}\" target=\"_blank\">Reset Password</a>\n\
             <p>This link will expire in 10 minutes.</p>\n\
             <p>If you did not request a password reset, you can ignore this email.</p>"
        ),
    }
}

/// SMTP delivery through lettre. Port 465 uses implicit TLS, anything else STARTTLS.
#[derive(Clone)]
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn new(cfg: &SmtpConfig) -> anyhow::Result<Self> {
        let builder = if cfg.port == 465 {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&cfg.host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&cfg.host)
        }
        .context("smtp relay")?;

        let transport = builder
            .port(cfg.port)
            .credentials(Credentials::new(cfg.username.clone(), cfg.password.clone()))
            .timeout(Some(Duration::from_secs(10)))
            .build();

        let from = format!("\"{}\" <{}>", cfg.from_name, cfg.username)
            .parse::<Mailbox>()
            .context("invalid from address")?;

        Ok(Self { transport, from })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, email: OutgoingEmail) -> anyhow::Result<()> {
        let to = email
            .to
            .parse::<Mailbox>()
            .with_context(|| format!("invalid recipient {}", email.to))?;
        let message = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(email.subject.as_str())
            .multipart(MultiPart::alternative_plain_html(email.text, email.html))
            .context("build email")?;
        self.transport.send(message).await.context("smtp send")?;
        info!(to = %email.to, subject = %email.subject, "email sent");
        Ok(())
    }
}
