//! Resend through the next untried sender identity.
//!
//! For a soft or unknown bounce:
//! 1. look up the original transaction; none → `no_matching_deal`
//! 2. collect senders already used for this exact address
//! 3. take the first pool entry not yet used; none → `all_senders_exhausted`
//! 4. compose and send; transport errors are recorded with their text

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::channels::smtp::{MailTransport, OutboundMail};
use crate::pipeline::types::{
    FailedRetry, REASON_NO_MATCHING_DEAL, REASON_SENDERS_EXHAUSTED, RetryAttempt, SenderIdentity,
    StateDocument,
};
use crate::store::deals::{DealLookup, TransactionContext};

/// Fixed, ordered pool of alternate "From" identities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderPool {
    senders: Vec<SenderIdentity>,
}

impl SenderPool {
    pub fn new(senders: Vec<SenderIdentity>) -> Self {
        Self { senders }
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }

    /// First identity, in pool order, whose address is not in `used`.
    pub fn next_unused(&self, used: &[&str]) -> Option<&SenderIdentity> {
        self.senders
            .iter()
            .find(|s| !used.iter().any(|u| u.eq_ignore_ascii_case(&s.address)))
    }
}

/// Wording of the replacement message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResendTemplate {
    pub subject: String,
    pub reply_to: Option<String>,
    /// Contact address quoted in the body.
    pub contact: String,
}

impl ResendTemplate {
    pub fn new(reply_to: Option<String>) -> Self {
        let contact = reply_to
            .clone()
            .unwrap_or_else(|| "info@enterprise-universe.com".to_string());
        Self {
            subject: "Enterprise Universe - Projektbestätigung (Erneuter Versand)".to_string(),
            reply_to,
            contact,
        }
    }

    /// Build the resend for `to` from `sender`, quoting the reference number.
    pub fn compose(
        &self,
        sender: &SenderIdentity,
        to: &str,
        context: &TransactionContext,
    ) -> OutboundMail {
        let reference = context.reference_number.as_deref().unwrap_or("N/A");
        let contact = &self.contact;

        let text = format!(
            "Sehr geehrte Damen und Herren,\n\n\
             diese E-Mail wurde erneut versendet, da die vorherige Zustellung fehlgeschlagen ist.\n\n\
             Bitte kontaktieren Sie uns unter {contact} für Ihre Projektunterlagen.\n\n\
             Rechnungsnummer: {reference}\n\n\
             Mit freundlichen Grüßen,\n\
             Ihr Enterprise Universe Team"
        );

        let html = format!(
            r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"></head>
<body style="font-family:Arial,sans-serif;max-width:600px;margin:0 auto;padding:20px;">
    <div style="background:#1a365d;padding:20px;text-align:center;">
        <h1 style="color:white;margin:0;">Enterprise Universe</h1>
    </div>
    <div style="padding:20px;background:#f8f9fa;">
        <p>Sehr geehrte Damen und Herren,</p>
        <p>diese E-Mail wurde erneut versendet, da die vorherige Zustellung fehlgeschlagen ist.</p>
        <p>Bitte kontaktieren Sie uns unter <a href="mailto:{contact}">{contact}</a> für Ihre Projektunterlagen.</p>
        <div style="background:white;padding:15px;border-radius:8px;margin:20px 0;">
            <p><strong>Rechnungsnummer:</strong> {reference}</p>
        </div>
        <p>Mit freundlichen Grüßen,<br><strong>Ihr Enterprise Universe Team</strong></p>
    </div>
</body>
</html>"#
        );

        OutboundMail {
            from: sender.clone(),
            to: to.to_string(),
            reply_to: self.reply_to.clone(),
            subject: self.subject.clone(),
            text,
            html,
        }
    }
}

/// Result of one retry decision.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome {
    Sent(RetryAttempt),
    Failed(FailedRetry),
}

impl RetryOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, Self::Sent(_))
    }

    /// Append this outcome to the matching list of the state document.
    pub fn record(self, doc: &mut StateDocument) {
        match self {
            Self::Sent(attempt) => doc.retried_emails.push(attempt),
            Self::Failed(failure) => doc.failed_retries.push(failure),
        }
    }
}

/// Everything a retry needs besides the address and the state.
pub struct RetryContext<'a> {
    pub deals: &'a dyn DealLookup,
    pub transport: &'a dyn MailTransport,
    pub pool: &'a SenderPool,
    pub template: &'a ResendTemplate,
}

/// Attempt one resend to `email`. Never returns an error: every failure is
/// a `RetryOutcome::Failed` with its reason.
pub async fn retry(
    email: &str,
    doc: &StateDocument,
    ctx: &RetryContext<'_>,
    now: DateTime<Utc>,
) -> RetryOutcome {
    let failed = |reason: String| {
        RetryOutcome::Failed(FailedRetry {
            email: email.to_string(),
            reason,
            failed_at: now,
        })
    };

    let context = match ctx.deals.find_by_email(email).await {
        Ok(Some(context)) => context,
        Ok(None) => {
            info!(email = %email, "No matching deal found");
            return failed(REASON_NO_MATCHING_DEAL.to_string());
        }
        Err(e) => {
            warn!(email = %email, error = %e, "Deal lookup failed");
            return failed(e.to_string());
        }
    };

    let used = doc.senders_used_for(email);
    let Some(sender) = ctx.pool.next_unused(&used) else {
        info!(email = %email, tried = used.len(), pool = ctx.pool.len(), "All senders exhausted");
        return failed(REASON_SENDERS_EXHAUSTED.to_string());
    };

    let mail = ctx.template.compose(sender, email, &context);
    match ctx.transport.send(mail).await {
        Ok(message_id) => {
            info!(email = %email, sender = %sender.address, deal = %context.deal_id, "Retry sent");
            RetryOutcome::Sent(RetryAttempt {
                original_email: email.to_string(),
                sender_used: sender.address.clone(),
                message_id,
                retried_at: now,
            })
        }
        Err(e) => {
            warn!(email = %email, sender = %sender.address, error = %e, "Retry failed");
            failed(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::error::{StoreError, TransportError};

    struct OneDeal;

    #[async_trait]
    impl DealLookup for OneDeal {
        async fn find_by_email(&self, email: &str) -> Result<Option<TransactionContext>, StoreError> {
            Ok((email == "x@y.com").then(|| TransactionContext {
                deal_id: "1001".into(),
                reference_number: Some("RE-42".into()),
            }))
        }
    }

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<OutboundMail>>,
        fail_with: Option<String>,
    }

    #[async_trait]
    impl MailTransport for RecordingTransport {
        async fn send(&self, mail: OutboundMail) -> Result<String, TransportError> {
            if let Some(reason) = &self.fail_with {
                return Err(TransportError::Send(reason.clone()));
            }
            let mut sent = self.sent.lock().unwrap();
            sent.push(mail);
            Ok(format!("<m{}@test>", sent.len()))
        }
    }

    fn pool() -> SenderPool {
        SenderPool::new(vec![
            SenderIdentity::new("invoice@us.com", "Billing"),
            SenderIdentity::new("info@us.com", "Info"),
            SenderIdentity::new("projects@us.one", "Projects"),
        ])
    }

    fn attempt(email: &str, sender: &str) -> RetryAttempt {
        RetryAttempt {
            original_email: email.into(),
            sender_used: sender.into(),
            message_id: "<old>".into(),
            retried_at: Utc::now(),
        }
    }

    #[test]
    fn next_unused_follows_pool_order() {
        let p = pool();
        assert_eq!(p.next_unused(&[]).unwrap().address, "invoice@us.com");
        assert_eq!(
            p.next_unused(&["invoice@us.com"]).unwrap().address,
            "info@us.com"
        );
        // Out-of-order history still yields the first gap.
        assert_eq!(
            p.next_unused(&["info@us.com"]).unwrap().address,
            "invoice@us.com"
        );
        assert!(
            p.next_unused(&["invoice@us.com", "info@us.com", "projects@us.one"])
                .is_none()
        );
    }

    #[test]
    fn compose_quotes_reference_or_na() {
        let t = ResendTemplate::new(Some("info@us.com".into()));
        let sender = SenderIdentity::new("info@us.com", "Info");
        let mut ctx = TransactionContext {
            deal_id: "1".into(),
            reference_number: Some("RE-7".into()),
        };
        let mail = t.compose(&sender, "x@y.com", &ctx);
        assert_eq!(mail.to, "x@y.com");
        assert_eq!(mail.reply_to.as_deref(), Some("info@us.com"));
        assert!(mail.text.contains("Rechnungsnummer: RE-7"));
        assert!(mail.html.contains("RE-7"));

        ctx.reference_number = None;
        let mail = t.compose(&sender, "x@y.com", &ctx);
        assert!(mail.text.contains("Rechnungsnummer: N/A"));
    }

    #[tokio::test]
    async fn first_retry_uses_first_sender() {
        let transport = RecordingTransport::default();
        let p = pool();
        let template = ResendTemplate::new(None);
        let ctx = RetryContext {
            deals: &OneDeal,
            transport: &transport,
            pool: &p,
            template: &template,
        };

        let outcome = retry("x@y.com", &StateDocument::default(), &ctx, Utc::now()).await;
        let RetryOutcome::Sent(a) = outcome else {
            panic!("expected a sent retry");
        };
        assert_eq!(a.sender_used, "invoice@us.com");
        assert_eq!(a.message_id, "<m1@test>");
        assert_eq!(transport.sent.lock().unwrap()[0].from.address, "invoice@us.com");
    }

    #[tokio::test]
    async fn rotation_skips_senders_used_for_same_address_only() {
        let transport = RecordingTransport::default();
        let p = pool();
        let template = ResendTemplate::new(None);
        let ctx = RetryContext {
            deals: &OneDeal,
            transport: &transport,
            pool: &p,
            template: &template,
        };
        let mut doc = StateDocument::default();
        doc.retried_emails.push(attempt("x@y.com", "invoice@us.com"));
        doc.retried_emails.push(attempt("other@y.com", "info@us.com"));

        let outcome = retry("x@y.com", &doc, &ctx, Utc::now()).await;
        assert!(matches!(outcome, RetryOutcome::Sent(ref a) if a.sender_used == "info@us.com"));
    }

    #[tokio::test]
    async fn exhausted_pool_fails_without_sending() {
        let transport = RecordingTransport::default();
        let p = pool();
        let template = ResendTemplate::new(None);
        let ctx = RetryContext {
            deals: &OneDeal,
            transport: &transport,
            pool: &p,
            template: &template,
        };
        let mut doc = StateDocument::default();
        for s in ["invoice@us.com", "info@us.com", "projects@us.one"] {
            doc.retried_emails.push(attempt("x@y.com", s));
        }

        let outcome = retry("x@y.com", &doc, &ctx, Utc::now()).await;
        assert!(matches!(outcome, RetryOutcome::Failed(ref f) if f.reason == REASON_SENDERS_EXHAUSTED));
        assert!(transport.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_deal_fails_before_sender_selection() {
        let transport = RecordingTransport::default();
        let p = pool();
        let template = ResendTemplate::new(None);
        let ctx = RetryContext {
            deals: &OneDeal,
            transport: &transport,
            pool: &p,
            template: &template,
        };
        let outcome = retry("nobody@y.com", &StateDocument::default(), &ctx, Utc::now()).await;
        assert!(matches!(outcome, RetryOutcome::Failed(ref f) if f.reason == REASON_NO_MATCHING_DEAL));
    }

    #[tokio::test]
    async fn transport_error_text_becomes_reason() {
        let transport = RecordingTransport {
            fail_with: Some("554 relay denied".into()),
            ..Default::default()
        };
        let p = pool();
        let template = ResendTemplate::new(None);
        let ctx = RetryContext {
            deals: &OneDeal,
            transport: &transport,
            pool: &p,
            template: &template,
        };
        let outcome = retry("x@y.com", &StateDocument::default(), &ctx, Utc::now()).await;
        assert!(matches!(outcome, RetryOutcome::Failed(ref f) if f.reason.contains("554 relay denied")));
    }

    #[test]
    fn record_appends_to_matching_list() {
        let mut doc = StateDocument::default();
        RetryOutcome::Sent(attempt("x@y.com", "info@us.com")).record(&mut doc);
        RetryOutcome::Failed(FailedRetry {
            email: "z@y.com".into(),
            reason: REASON_NO_MATCHING_DEAL.into(),
            failed_at: Utc::now(),
        })
        .record(&mut doc);
        assert_eq!(doc.retried_emails.len(), 1);
        assert_eq!(doc.failed_retries.len(), 1);
    }
}
