//! Credit audit log
//!
//! Every consumption, grant and period reset appends one entry. The log is
//! informational; balances are always derived from the user counters and the
//! credit ledger.

use serde::{Deserialize, Serialize};
use shipmail_shared::CreditAmounts;
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CreditLogKind {
    Use,
    Add,
    Reset,
}

impl CreditLogKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreditLogKind::Use => "use",
            CreditLogKind::Add => "add",
            CreditLogKind::Reset => "reset",
        }
    }
}

impl fmt::Display for CreditLogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CreditLogKind {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "use" => Ok(CreditLogKind::Use),
            "add" => Ok(CreditLogKind::Add),
            "reset" => Ok(CreditLogKind::Reset),
            other => Err(BillingError::Database(format!(
                "unknown credit log kind: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditLogEntry {
    pub id: Uuid,
    pub user_id: String,
    pub kind: CreditLogKind,
    /// Amounts moved by the operation; resets record the usage they cleared
    pub credits: CreditAmounts,
    pub metadata: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl CreditLogEntry {
    pub fn new(
        user_id: &str,
        kind: CreditLogKind,
        credits: CreditAmounts,
        metadata: serde_json::Value,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            kind,
            credits,
            metadata,
            created_at: now,
        }
    }
}
