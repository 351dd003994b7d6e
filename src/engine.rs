// Import Engine - submits a candidate batch to the budgeting service with
// duplicate suppression and partial-failure semantics. Sole writer of the
// imported-transactions ledger.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::db::SharedConnection;
use crate::error::{BridgeError, Result};
use crate::ledger::{self, Candidate, Recorded, Source};
use crate::ynab::{NewTransaction, TransactionSink};

/// YNAB caps import ids at 36 characters; prefix + 32-char fingerprint fits
/// exactly.
pub fn import_id(fingerprint: &str) -> String {
    let mut id = format!("YNB:{fingerprint}");
    id.truncate(36);
    id
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportItemError {
    pub payee: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImportOutcome {
    pub imported: usize,
    pub skipped_duplicates: usize,
    pub failed: usize,
    pub errors: Vec<ImportItemError>,
}

/// Imports a batch against one budgeting-service account.
///
/// Candidates already present in the ledger are skipped. The rest are
/// submitted one by one, in the order received, each carrying an import id
/// derived from its fingerprint so a retried batch is safe even if a ledger
/// write was lost after a successful remote submit. A failed submit is
/// recorded and the batch continues; one bad transaction never aborts the
/// rest.
pub async fn import_batch(
    db: &SharedConnection,
    candidates: &[Candidate],
    budget_id: &str,
    account_id: &str,
    source: Source,
    sink: &dyn TransactionSink,
) -> Result<ImportOutcome> {
    if budget_id.trim().is_empty() {
        return Err(BridgeError::Configuration("no budget selected".to_string()));
    }
    if account_id.trim().is_empty() {
        return Err(BridgeError::Configuration("no account selected".to_string()));
    }

    let mut outcome = ImportOutcome::default();

    for candidate in candidates {
        let fp = ledger::candidate_fingerprint(candidate, account_id);

        let already = {
            let conn = db.lock().await;
            ledger::is_recorded(&conn, &fp, account_id)?
        };
        if already {
            outcome.skipped_duplicates += 1;
            continue;
        }

        let transaction = NewTransaction {
            date: candidate.date,
            amount_milliunits: candidate.amount_milliunits,
            payee: candidate.payee.clone(),
            memo: candidate.memo.clone(),
            import_id: import_id(&fp),
        };

        match sink.create_transaction(budget_id, account_id, &transaction).await {
            Ok(receipt) => {
                let conn = db.lock().await;
                let recorded = ledger::record(
                    &conn,
                    candidate,
                    account_id,
                    source,
                    receipt.transaction_id.as_deref(),
                )?;
                // Remote-side import_id suppression, or losing the insert race
                // to a concurrent sync, both mean the transaction was already
                // imported once.
                if receipt.duplicate || recorded == Recorded::Duplicate {
                    outcome.skipped_duplicates += 1;
                } else {
                    outcome.imported += 1;
                }
            }
            Err(e) => {
                warn!(payee = %candidate.payee, error = %e, "transaction submit failed");
                outcome.failed += 1;
                outcome.errors.push(ImportItemError {
                    payee: candidate.payee.clone(),
                    message: e.to_string(),
                });
            }
        }
    }

    info!(
        account_id,
        imported = outcome.imported,
        skipped = outcome.skipped_duplicates,
        failed = outcome.failed,
        "import batch finished"
    );

    Ok(outcome)
}

// ============================================================================
// TESTS
// ============================================================================
