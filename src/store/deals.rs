//! Read-only access to the transaction context of original sends.
//!
//! The invoicing job writes a ledger of processed deals; each entry names
//! the recipient address and the invoice number that was sent. This module
//! never writes to it.

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::{Deserializer, MapAccess, Visitor};

use crate::error::StoreError;

/// What the resend needs to know about the original transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionContext {
    pub deal_id: String,
    /// Invoice or reference number quoted in the resend.
    pub reference_number: Option<String>,
}

/// Keyed lookup of transaction context by recipient address.
#[async_trait]
pub trait DealLookup: Send + Sync {
    async fn find_by_email(&self, email: &str) -> Result<Option<TransactionContext>, StoreError>;
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct InvoicingLog {
    /// Deal entries in lookup order, see [`lookup_order`].
    #[serde(deserialize_with = "entries_in_document_order")]
    processed_deals: Vec<(String, DealEntry)>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct DealEntry {
    email: Option<String>,
    invoice_number: Option<serde_json::Value>,
}

fn entries_in_document_order<'de, D>(de: D) -> Result<Vec<(String, DealEntry)>, D::Error>
where
    D: Deserializer<'de>,
{
    struct EntriesVisitor;

    impl<'de> Visitor<'de> for EntriesVisitor {
        type Value = Vec<(String, DealEntry)>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a map of deal id to deal entry")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
            let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
            while let Some(entry) = map.next_entry::<String, DealEntry>()? {
                entries.push(entry);
            }
            Ok(entries)
        }
    }

    let mut entries = de.deserialize_map(EntriesVisitor)?;
    lookup_order(&mut entries);
    Ok(entries)
}

/// Order entries the way the invoicing job enumerates them: integer deal
/// ids ascending, then all other ids in document order.
fn lookup_order(entries: &mut [(String, DealEntry)]) {
    entries.sort_by_key(|(id, _)| array_index(id).map_or((1, 0), |n| (0, n)));
}

/// Canonical non-negative integer key below `u32::MAX` ("0", "17", not "017").
fn array_index(key: &str) -> Option<u32> {
    let n: u32 = key.parse().ok()?;
    (n != u32::MAX && n.to_string() == key).then_some(n)
}

/// Deal ledger stored as a JSON file owned by the invoicing job.
///
/// The file is re-read on each lookup so a long-running worker sees deals
/// invoiced after it started. A missing file is an empty ledger.
#[derive(Debug, Clone)]
pub struct JsonDealLedger {
    path: PathBuf,
}

impl JsonDealLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<InvoicingLog, StoreError> {
        let display = self.path.display().to_string();
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(InvoicingLog::default());
            }
            Err(source) => {
                return Err(StoreError::Io {
                    path: display,
                    source,
                });
            }
        };
        serde_json::from_str(&raw).map_err(|source| StoreError::Serialization {
            path: display,
            source,
        })
    }
}

#[async_trait]
impl DealLookup for JsonDealLedger {
    async fn find_by_email(&self, email: &str) -> Result<Option<TransactionContext>, StoreError> {
        let ledger = self.read().await?;
        Ok(find_deal(&ledger, email))
    }
}

fn find_deal(ledger: &InvoicingLog, email: &str) -> Option<TransactionContext> {
    ledger
        .processed_deals
        .iter()
        .find(|(_, entry)| {
            entry
                .email
                .as_deref()
                .is_some_and(|e| e.trim().eq_ignore_ascii_case(email))
        })
        .map(|(deal_id, entry)| TransactionContext {
            deal_id: deal_id.clone(),
            reference_number: entry.invoice_number.as_ref().and_then(reference_text),
        })
}

/// Invoice numbers appear both as strings and as bare numbers.
fn reference_text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEDGER: &str = r#"{
        "processedDeals": {
            "1001": {"email": "buyer@shop.de", "invoiceNumber": "RE-2026-0042", "amount": 1200},
            "1002": {"email": "Other@Client.org", "invoiceNumber": 77},
            "1003": {"email": "noinvoice@client.org"}
        },
        "sentEmails": []
    }"#;

    async fn ledger_with(contents: &str) -> (tempfile::TempDir, JsonDealLedger) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("invoicing-log.json");
        tokio::fs::write(&path, contents).await.unwrap();
        (dir, JsonDealLedger::new(path))
    }

    #[tokio::test]
    async fn finds_deal_by_email() {
        let (_dir, ledger) = ledger_with(LEDGER).await;
        let ctx = ledger.find_by_email("buyer@shop.de").await.unwrap().unwrap();
        assert_eq!(ctx.deal_id, "1001");
        assert_eq!(ctx.reference_number.as_deref(), Some("RE-2026-0042"));
    }

    #[tokio::test]
    async fn lookup_is_case_insensitive_and_accepts_numeric_invoice() {
        let (_dir, ledger) = ledger_with(LEDGER).await;
        let ctx = ledger.find_by_email("other@client.org").await.unwrap().unwrap();
        assert_eq!(ctx.deal_id, "1002");
        assert_eq!(ctx.reference_number.as_deref(), Some("77"));
    }

    #[tokio::test]
    async fn missing_invoice_number_is_none() {
        let (_dir, ledger) = ledger_with(LEDGER).await;
        let ctx = ledger
            .find_by_email("noinvoice@client.org")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ctx.reference_number, None);
    }

    #[tokio::test]
    async fn first_match_follows_numeric_id_order() {
        let (_dir, ledger) = ledger_with(
            r#"{"processedDeals": {
                "legacy-7": {"email": "dup@client.org", "invoiceNumber": "RE-L7"},
                "100": {"email": "dup@client.org", "invoiceNumber": "RE-100"},
                "99": {"email": "Dup@Client.org", "invoiceNumber": "RE-99"}
            }}"#,
        )
        .await;
        let ctx = ledger.find_by_email("dup@client.org").await.unwrap().unwrap();
        assert_eq!(ctx.deal_id, "99");
        assert_eq!(ctx.reference_number.as_deref(), Some("RE-99"));
    }

    #[tokio::test]
    async fn non_numeric_ids_keep_document_order() {
        let (_dir, ledger) = ledger_with(
            r#"{"processedDeals": {
                "b-deal": {"email": "dup@client.org", "invoiceNumber": "RE-B"},
                "a-deal": {"email": "dup@client.org", "invoiceNumber": "RE-A"}
            }}"#,
        )
        .await;
        let ctx = ledger.find_by_email("dup@client.org").await.unwrap().unwrap();
        assert_eq!(ctx.deal_id, "b-deal");
    }

    #[test]
    fn array_index_is_canonical() {
        assert_eq!(array_index("0"), Some(0));
        assert_eq!(array_index("4021"), Some(4021));
        assert_eq!(array_index("007"), None);
        assert_eq!(array_index("-1"), None);
        assert_eq!(array_index("4294967295"), None);
        assert_eq!(array_index("deal-1"), None);
    }

    #[tokio::test]
    async fn unknown_email_is_none() {
        let (_dir, ledger) = ledger_with(LEDGER).await;
        assert!(ledger.find_by_email("nobody@x.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_file_is_empty_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = JsonDealLedger::new(dir.path().join("absent.json"));
        assert!(ledger.find_by_email("buyer@shop.de").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn malformed_file_is_an_error() {
        let (_dir, ledger) = ledger_with("{not json").await;
        assert!(matches!(
            ledger.find_by_email("buyer@shop.de").await,
            Err(StoreError::Serialization { .. })
        ));
    }
}
