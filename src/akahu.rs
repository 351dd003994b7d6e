// Bank-aggregation collaborator: the Akahu REST API. The scheduler and the
// sync-now path consume the `BankFeed` trait; `AkahuClient` is the real
// implementation.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};
use crate::ledger::Candidate;
use crate::ynab::milliunits_from_decimal;

pub const BASE_URL: &str = "https://api.akahu.io/v1";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const PAYEE_MAX_LEN: usize = 50;

/// A connected bank account as reported by the aggregator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BankAccount {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub institution: String,
    pub balance: Option<f64>,
}

/// The pull side of a sync: list linked bank accounts and fetch raw
/// transactions for one of them since a date.
#[async_trait]
pub trait BankFeed: Send + Sync {
    async fn list_accounts(&self) -> Result<Vec<BankAccount>>;

    /// Transactions for `account_id` from `since` (inclusive) to today,
    /// already normalized into candidates.
    async fn transactions_since(&self, account_id: &str, since: NaiveDate) -> Result<Vec<Candidate>>;
}

// ============================================================================
// WIRE TYPES
// ============================================================================

#[derive(Deserialize)]
struct ItemsEnvelope<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
    #[serde(default)]
    cursor: Option<Cursor>,
}

#[derive(Deserialize)]
struct Cursor {
    next: Option<String>,
}

#[derive(Deserialize)]
struct RawAccount {
    #[serde(rename = "_id")]
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    connection: Option<RawConnection>,
    #[serde(default)]
    balance: Option<RawBalance>,
}

#[derive(Deserialize)]
struct RawConnection {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Deserialize)]
struct RawBalance {
    #[serde(default)]
    current: Option<f64>,
}

#[derive(Deserialize)]
struct RawTransaction {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_account")]
    account: String,
    date: String,
    /// Decimal dollars, signed: negative = outflow.
    amount: f64,
    #[serde(default)]
    description: String,
    #[serde(default)]
    merchant: Option<RawMerchant>,
}

#[derive(Deserialize)]
struct RawMerchant {
    #[serde(default)]
    name: Option<String>,
}

/// Payee is the merchant name when the aggregator resolved one, else the
/// description truncated for display; the full description goes to the memo.
fn to_candidate(raw: &RawTransaction) -> Result<Candidate> {
    let date = parse_transaction_date(&raw.date)?;

    let payee = match raw.merchant.as_ref().and_then(|m| m.name.clone()) {
        Some(name) if !name.trim().is_empty() => name.trim().to_string(),
        _ => raw.description.trim().chars().take(PAYEE_MAX_LEN).collect(),
    };

    Ok(Candidate {
        date,
        amount_milliunits: milliunits_from_decimal(raw.amount),
        payee,
        memo: raw.description.trim().to_string(),
        source_id: Some(raw.id.clone()),
    })
}

fn parse_transaction_date(raw: &str) -> Result<NaiveDate> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc).date_naive());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| BridgeError::Upstream(format!("Akahu returned unparsable date {raw:?}")))
}

// ============================================================================
// REST CLIENT
// ============================================================================

#[derive(Debug, Clone)]
pub struct AkahuClient {
    http: reqwest::Client,
    base_url: String,
}

impl AkahuClient {
    pub fn new(app_token: &str, user_token: &str) -> Result<Self> {
        if app_token.trim().is_empty() || user_token.trim().is_empty() {
            return Err(BridgeError::Configuration(
                "Akahu app and user tokens are not set".to_string(),
            ));
        }

        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {}", user_token.trim()))
            .map_err(|_| BridgeError::Configuration("Akahu user token is not a valid header value".to_string()))?;
        let app = HeaderValue::from_str(app_token.trim())
            .map_err(|_| BridgeError::Configuration("Akahu app token is not a valid header value".to_string()))?;
        headers.insert(AUTHORIZATION, bearer);
        headers.insert("X-Akahu-Id", app);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(AkahuClient {
            http,
            base_url: BASE_URL.to_string(),
        })
    }

    /// Point the client at a different server. Used by tests.
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub async fn test_connection(&self) -> Result<()> {
        self.list_accounts().await.map(|_| ())
    }

    async fn get_page<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<ItemsEnvelope<T>> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.http.get(&url).query(query).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BridgeError::Upstream(format!("Akahu returned {status}: {body}")));
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl BankFeed for AkahuClient {
    async fn list_accounts(&self) -> Result<Vec<BankAccount>> {
        let envelope: ItemsEnvelope<RawAccount> = self.get_page("/accounts", &[]).await?;
        Ok(envelope
            .items
            .into_iter()
            .map(|raw| BankAccount {
                id: raw.id,
                name: raw.name.unwrap_or_else(|| "Unknown Account".to_string()),
                kind: raw.kind.unwrap_or_else(|| "unknown".to_string()),
                institution: raw
                    .connection
                    .and_then(|c| c.name)
                    .unwrap_or_else(|| "Unknown".to_string()),
                balance: raw.balance.and_then(|b| b.current),
            })
            .collect())
    }

    async fn transactions_since(&self, account_id: &str, since: NaiveDate) -> Result<Vec<Candidate>> {
        let start = since.format("%Y-%m-%d").to_string();
        let end = Utc::now().date_naive().format("%Y-%m-%d").to_string();

        let mut candidates = Vec::new();
        let mut cursor: Option<String> = None;

        // The transactions endpoint is account-agnostic and cursor-paginated;
        // filter client-side and follow cursors until exhausted.
        loop {
            let mut query: Vec<(&str, &str)> = vec![("start", &start), ("end", &end)];
            if let Some(c) = cursor.as_deref() {
                query.push(("cursor", c));
            }

            let envelope: ItemsEnvelope<RawTransaction> =
                self.get_page("/transactions", &query).await?;

            for raw in &envelope.items {
                if raw.account != account_id {
                    continue;
                }
                candidates.push(to_candidate(raw)?);
            }

            cursor = envelope.cursor.and_then(|c| c.next);
            if cursor.is_none() {
                break;
            }
        }

        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(merchant: Option<&str>, description: &str, amount: f64) -> RawTransaction {
        RawTransaction {
            id: "txn_1".to_string(),
            account: "acc_1".to_string(),
            date: "2024-03-05T00:00:00Z".to_string(),
            amount,
            description: description.to_string(),
            merchant: merchant.map(|name| RawMerchant {
                name: Some(name.to_string()),
            }),
        }
    }

    #[test]
    fn candidate_prefers_merchant_name() {
        let c = to_candidate(&raw(Some("New World"), "POS W/D NEW WORLD 1234", -82.15)).unwrap();
        assert_eq!(c.payee, "New World");
        assert_eq!(c.memo, "POS W/D NEW WORLD 1234");
        assert_eq!(c.amount_milliunits, -82_150);
        assert_eq!(c.date, NaiveDate::from_ymd_opt(2024, 3, 5).unwrap());
        assert_eq!(c.source_id.as_deref(), Some("txn_1"));
    }

    #[test]
    fn candidate_falls_back_to_truncated_description() {
        let long = "A".repeat(80);
        let c = to_candidate(&raw(None, &long, 1.0)).unwrap();
        assert_eq!(c.payee.len(), PAYEE_MAX_LEN);
        assert_eq!(c.memo.len(), 80);
    }

    #[test]
    fn plain_dates_are_accepted() {
        let mut r = raw(None, "x", 1.0);
        r.date = "2024-03-05".to_string();
        let c = to_candidate(&r).unwrap();
        assert_eq!(c.date, NaiveDate::from_ymd_opt(2024, 3, 5).unwrap());

        r.date = "garbage".to_string();
        assert!(matches!(to_candidate(&r), Err(BridgeError::Upstream(_))));
    }

    #[test]
    fn envelope_decodes_cursor() {
        let raw = r#"{"items":[{"_id":"t","_account":"a","date":"2024-03-05","amount":-1.5}],"cursor":{"next":"abc"}}"#;
        let envelope: ItemsEnvelope<RawTransaction> = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.items.len(), 1);
        assert_eq!(envelope.cursor.unwrap().next.as_deref(), Some("abc"));
    }

    #[test]
    fn empty_tokens_rejected() {
        assert!(matches!(
            AkahuClient::new("", "user"),
            Err(BridgeError::Configuration(_))
        ));
        assert!(matches!(
            AkahuClient::new("app", ""),
            Err(BridgeError::Configuration(_))
        ));
        assert!(AkahuClient::new("app_token_123", "user_token_123").is_ok());
    }
}
