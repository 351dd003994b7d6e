// Budgeting-service collaborator: the YNAB REST API, reduced to the three
// calls the core consumes. The import engine talks to the `TransactionSink`
// trait so tests can substitute a mock.

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{BridgeError, Result};

pub const BASE_URL: &str = "https://api.ynab.com/v1";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// $1.00 == 1000 milliunits.
pub fn milliunits_from_decimal(amount: f64) -> i64 {
    (amount * 1000.0).round() as i64
}

pub fn milliunits_to_decimal(milliunits: i64) -> f64 {
    milliunits as f64 / 1000.0
}

// ============================================================================
// COLLABORATOR CONTRACT
// ============================================================================

/// One transaction in the shape the budgeting service expects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTransaction {
    pub date: NaiveDate,
    pub amount_milliunits: i64,
    pub payee: String,
    pub memo: String,
    /// Idempotency token. Stable across retries so the service can suppress
    /// duplicates server-side even when the local ledger write was lost.
    pub import_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct SubmitReceipt {
    pub transaction_id: Option<String>,
    /// True when the service recognised the import_id and ignored the create.
    pub duplicate: bool,
}

/// The "create transaction" seam of the budgeting service.
#[async_trait]
pub trait TransactionSink: Send + Sync {
    async fn create_transaction(
        &self,
        budget_id: &str,
        account_id: &str,
        transaction: &NewTransaction,
    ) -> Result<SubmitReceipt>;
}

// ============================================================================
// REST CLIENT
// ============================================================================

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Budget {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BudgetAccount {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub on_budget: bool,
    pub closed: bool,
    #[serde(default)]
    pub deleted: bool,
    pub balance: i64,
}

#[derive(Deserialize)]
struct BudgetsEnvelope {
    data: BudgetsData,
}

#[derive(Deserialize)]
struct BudgetsData {
    budgets: Vec<Budget>,
}

#[derive(Deserialize)]
struct AccountsEnvelope {
    data: AccountsData,
}

#[derive(Deserialize)]
struct AccountsData {
    accounts: Vec<BudgetAccount>,
}

#[derive(Deserialize)]
struct SaveEnvelope {
    data: SaveData,
}

#[derive(Deserialize)]
struct SaveData {
    #[serde(default)]
    transactions: Vec<CreatedTransaction>,
    #[serde(default)]
    duplicate_import_ids: Vec<String>,
}

#[derive(Deserialize)]
struct CreatedTransaction {
    id: String,
}

#[derive(Debug, Clone)]
pub struct YnabClient {
    http: reqwest::Client,
    base_url: String,
}

impl YnabClient {
    pub fn new(access_token: &str) -> Result<Self> {
        if access_token.trim().is_empty() {
            return Err(BridgeError::Configuration(
                "YNAB access token is not set".to_string(),
            ));
        }

        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {}", access_token.trim()))
            .map_err(|_| BridgeError::Configuration("YNAB access token is not a valid header value".to_string()))?;
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(YnabClient {
            http,
            base_url: BASE_URL.to_string(),
        })
    }

    /// Point the client at a different server. Used by tests.
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub async fn list_budgets(&self) -> Result<Vec<Budget>> {
        let url = format!("{}/budgets", self.base_url);
        let envelope: BudgetsEnvelope = self.get_json(&url).await?;
        Ok(envelope.data.budgets)
    }

    /// Open accounts for a budget; deleted accounts are filtered out.
    pub async fn list_accounts(&self, budget_id: &str) -> Result<Vec<BudgetAccount>> {
        let url = format!("{}/budgets/{}/accounts", self.base_url, budget_id);
        let envelope: AccountsEnvelope = self.get_json(&url).await?;
        Ok(envelope
            .data
            .accounts
            .into_iter()
            .filter(|a| !a.deleted)
            .collect())
    }

    pub async fn test_connection(&self) -> Result<()> {
        self.list_budgets().await.map(|_| ())
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self.http.get(url).send().await?;
        Self::decode(response).await
    }

    async fn decode<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BridgeError::Upstream(format!("YNAB returned {status}: {body}")));
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl TransactionSink for YnabClient {
    async fn create_transaction(
        &self,
        budget_id: &str,
        account_id: &str,
        transaction: &NewTransaction,
    ) -> Result<SubmitReceipt> {
        let url = format!("{}/budgets/{}/transactions", self.base_url, budget_id);
        let body = json!({
            "transaction": {
                "account_id": account_id,
                "date": transaction.date.format("%Y-%m-%d").to_string(),
                "amount": transaction.amount_milliunits,
                "payee_name": transaction.payee,
                "memo": transaction.memo,
                "cleared": "cleared",
                "import_id": transaction.import_id,
            }
        });

        let response = self.http.post(&url).json(&body).send().await?;
        let envelope: SaveEnvelope = Self::decode(response).await?;

        Ok(SubmitReceipt {
            transaction_id: envelope.data.transactions.first().map(|t| t.id.clone()),
            duplicate: !envelope.data.duplicate_import_ids.is_empty(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn milliunit_conversion_rounds() {
        assert_eq!(milliunits_from_decimal(12.34), 12_340);
        assert_eq!(milliunits_from_decimal(-0.005), -5);
        assert_eq!(milliunits_from_decimal(0.0), 0);
        assert_eq!(milliunits_to_decimal(12_340), 12.34);
    }

    #[test]
    fn empty_token_is_a_configuration_error() {
        assert!(matches!(
            YnabClient::new(""),
            Err(BridgeError::Configuration(_))
        ));
        assert!(matches!(
            YnabClient::new("   "),
            Err(BridgeError::Configuration(_))
        ));
        assert!(YnabClient::new("token-123").is_ok());
    }

    #[test]
    fn save_envelope_decodes_duplicates() {
        let raw = r#"{"data":{"transactions":[{"id":"t-1"}],"duplicate_import_ids":["YNB:abc"]}}"#;
        let envelope: SaveEnvelope = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.data.transactions[0].id, "t-1");
        assert!(!envelope.data.duplicate_import_ids.is_empty());
    }
}
