//! Run controller: one bounded, sequential pass over the bounce mailbox.
//!
//! Per run:
//! 1. load the state document (empty if none)
//! 2. connect → open folder → search (any failure aborts the run)
//! 3. for at most `batch_limit` candidates: fetch → extract → dedup →
//!    classify → record or retry, pausing between messages
//! 4. close the session and save the document, also after an abort

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::channels::imap::{MailboxConnector, MailboxSession, SearchCriteria};
use crate::channels::smtp::MailTransport;
use crate::config::ProcessorConfig;
use crate::error::MailboxError;
use crate::pipeline::extract::BounceExtractor;
use crate::pipeline::retry::{self, ResendTemplate, RetryContext, SenderPool};
use crate::pipeline::rules::BounceClassifier;
use crate::pipeline::types::{BounceRecord, BounceType, RunReport, RunResults, StateDocument};
use crate::store::deals::DealLookup;
use crate::store::state::StateStore;

/// Source of the current time.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// External collaborators of the run controller.
#[derive(Clone)]
pub struct ProcessorDeps {
    pub mailbox: Arc<dyn MailboxConnector>,
    pub transport: Arc<dyn MailTransport>,
    pub deals: Arc<dyn DealLookup>,
    pub store: Arc<dyn StateStore>,
}

/// What happened to one candidate message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Fetch failed; logged and skipped.
    FetchFailed,
    /// No usable address in the message.
    NoAddressFound,
    /// Address already has a record inside the dedup window.
    DuplicateRecent,
    /// Hard bounce recorded, nothing sent.
    RecordedPermanent,
    /// Soft/unknown bounce resent.
    RecordedRetried(BounceType),
    /// Soft/unknown bounce whose resend could not be completed.
    RecordedFailed(BounceType),
}

impl MessageOutcome {
    /// Whether the message was acted on (and so counts towards pacing).
    pub fn was_recorded(&self) -> bool {
        matches!(
            self,
            Self::RecordedPermanent | Self::RecordedRetried(_) | Self::RecordedFailed(_)
        )
    }

    fn tally(&self) -> RunResults {
        let mut r = RunResults::default();
        match self {
            Self::RecordedPermanent => {
                r.processed = 1;
                r.permanent = 1;
            }
            Self::RecordedRetried(_) => {
                r.processed = 1;
                r.retried = 1;
            }
            Self::RecordedFailed(_) => {
                r.processed = 1;
                r.failed = 1;
            }
            _ => {}
        }
        r
    }
}

/// Detects bounces and resends through alternate sender identities.
pub struct BounceProcessor {
    deps: ProcessorDeps,
    config: ProcessorConfig,
    extractor: BounceExtractor,
    classifier: BounceClassifier,
    pool: SenderPool,
    template: ResendTemplate,
    clock: Clock,
}

impl BounceProcessor {
    pub fn new(deps: ProcessorDeps, config: ProcessorConfig) -> Self {
        let pool = SenderPool::new(config.senders.clone());
        if pool.is_empty() {
            warn!("Sender pool is empty, every retry will be recorded as exhausted");
        }
        Self {
            extractor: BounceExtractor::new(config.own_domains.clone()),
            classifier: BounceClassifier::default_rules(),
            pool,
            template: ResendTemplate::new(config.reply_to.clone()),
            clock: Arc::new(Utc::now),
            deps,
            config,
        }
    }

    /// Replace the wall clock (tests drive time explicitly).
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Load state, process one batch, save state.
    pub async fn run(&self) -> RunReport {
        info!("Bounce run starting");

        let doc = match self.deps.store.load().await {
            Ok(doc) => doc,
            Err(e) => {
                // Never overwrite a document we could not read.
                error!(error = %e, "Failed to load state document");
                return RunReport::aborted(e.to_string());
            }
        };

        let (mut doc, report) = self.run_with_state(doc).await;

        if let Err(e) = self.deps.store.save(&mut doc).await {
            error!(error = %e, "Failed to save state document");
            return RunReport::aborted(e.to_string());
        }
        report
    }

    /// Process one batch against `doc` and hand back the updated document.
    pub async fn run_with_state(&self, mut doc: StateDocument) -> (StateDocument, RunReport) {
        let mut results = RunResults::default();

        let report = match self.process_mailbox(&mut doc, &mut results).await {
            Ok(()) => {
                let report = RunReport::completed(results);
                if let RunReport::Completed { summary, .. } = &report {
                    info!("{summary}");
                }
                report
            }
            Err(e) => {
                error!(error = %e, partial = %results.summary(), "Bounce run aborted");
                RunReport::aborted(e.to_string())
            }
        };
        (doc, report)
    }

    async fn process_mailbox(
        &self,
        doc: &mut StateDocument,
        results: &mut RunResults,
    ) -> Result<(), MailboxError> {
        let mut session = self.deps.mailbox.connect().await?;
        let outcome = self.process_session(session.as_mut(), doc, results).await;
        session.close().await;
        outcome
    }

    async fn process_session(
        &self,
        session: &mut dyn MailboxSession,
        doc: &mut StateDocument,
        results: &mut RunResults,
    ) -> Result<(), MailboxError> {
        let folder = session.open_folder(&self.config.folders).await?;

        let criteria = SearchCriteria::bounce_notifications((self.clock)(), self.config.search_window);
        let uids = session.search(&criteria).await?;
        info!(folder = %folder, found = uids.len(), "Found potential bounce emails");

        for uid in uids.iter().take(self.config.batch_limit) {
            let outcome = self.process_message(session, uid, doc).await;
            debug!(uid = %uid, outcome = ?outcome, "Message handled");

            let tally = outcome.tally();
            doc.stats.absorb(&tally);
            results.processed += tally.processed;
            results.retried += tally.retried;
            results.failed += tally.failed;
            results.permanent += tally.permanent;

            if outcome.was_recorded() && !self.config.courtesy_delay.is_zero() {
                tokio::time::sleep(self.config.courtesy_delay).await;
            }
        }
        Ok(())
    }

    /// Drive one candidate through fetch → extract → dedup → classify → act.
    pub async fn process_message(
        &self,
        session: &mut dyn MailboxSession,
        uid: &str,
        doc: &mut StateDocument,
    ) -> MessageOutcome {
        let message = match session.fetch(uid).await {
            Ok(m) => m,
            Err(e) => {
                warn!(uid = %uid, error = %e, "Error processing email");
                return MessageOutcome::FetchFailed;
            }
        };

        let Some(email) = self.extractor.extract(&message) else {
            debug!(uid = %uid, "No bounced address found");
            return MessageOutcome::NoAddressFound;
        };

        let now = (self.clock)();
        let since = now
            .checked_sub_signed(self.config.dedup_window)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        if doc.processed_since(&email, since) {
            debug!(email = %email, "Bounce already processed recently");
            return MessageOutcome::DuplicateRecent;
        }

        info!(
            email = %email,
            notifier = message.from.as_deref().unwrap_or("unknown"),
            "Processing bounce"
        );
        let bounce_type = self.classifier.classify(&message);

        if !bounce_type.is_retryable() {
            info!(email = %email, "Hard bounce (permanent)");
            doc.processed_bounces.push(BounceRecord {
                email,
                bounce_type,
                subject: message.subject,
                processed_at: now,
                retried: false,
            });
            return MessageOutcome::RecordedPermanent;
        }

        info!(email = %email, kind = bounce_type.label(), "Attempting retry");
        let ctx = RetryContext {
            deals: self.deps.deals.as_ref(),
            transport: self.deps.transport.as_ref(),
            pool: &self.pool,
            template: &self.template,
        };
        let outcome = retry::retry(&email, doc, &ctx, now).await;
        let sent = outcome.is_sent();
        outcome.record(doc);

        doc.processed_bounces.push(BounceRecord {
            email,
            bounce_type,
            subject: message.subject,
            processed_at: now,
            retried: sent,
        });

        if sent {
            MessageOutcome::RecordedRetried(bounce_type)
        } else {
            MessageOutcome::RecordedFailed(bounce_type)
        }
    }
}
