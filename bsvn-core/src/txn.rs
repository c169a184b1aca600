//! The transactions table

use crate::error::{FsError, Result};
use crate::kv::{Table, Trail};
use crate::records::{self, Transaction};
use crate::skel::Skel;

pub fn get_txn(trail: &Trail<'_>, txn_id: &str) -> Result<Transaction> {
    let data = trail
        .get(Table::Transactions, txn_id.as_bytes())?
        .ok_or_else(|| FsError::NoSuchTransaction(txn_id.to_string()))?;
    let skel = Skel::parse(data).ok_or(FsError::malformed("transaction"))?;
    records::parse_transaction(&skel)
}

pub fn put_txn(trail: &Trail<'_>, txn_id: &str, txn: &Transaction) -> Result<()> {
    trail.put(
        Table::Transactions,
        txn_id.as_bytes(),
        &records::unparse_transaction(txn).unparse(),
    )
}

/// Store `txn` under a freshly allocated transaction ID
pub fn create_txn(trail: &Trail<'_>, txn: &Transaction) -> Result<String> {
    let txn_id = trail.next_key("transactions")?;
    put_txn(trail, &txn_id, txn)?;
    Ok(txn_id)
}

pub fn delete_txn(trail: &Trail<'_>, txn_id: &str) -> Result<()> {
    if !trail.delete(Table::Transactions, txn_id.as_bytes())? {
        return Err(FsError::NoSuchTransaction(txn_id.to_string()));
    }
    Ok(())
}

/// IDs of every transaction not yet committed or aborted
pub fn list_txns(trail: &Trail<'_>) -> Result<Vec<String>> {
    trail
        .scan_prefix(Table::Transactions, b"")?
        .into_iter()
        .map(|(k, _)| {
            String::from_utf8(k).map_err(|_| FsError::Database("malformed transaction key".into()))
        })
        .collect()
}
