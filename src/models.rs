// src/models.rs
use crate::cell::TonAddress;
use alloy::primitives::{B256, U256};
use chrono::{DateTime, Utc};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub type TxHash = B256;

/// A transaction already taken into the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxMarker {
    pub hash: TxHash,
    pub lt: u64,
    pub utime: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Supply,
    Withdraw,
    Liquidate,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Supply => "supply",
            EventKind::Withdraw => "withdraw",
            EventKind::Liquidate => "liquidate",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown event kind `{0}`")]
pub struct UnknownEventKind(String);

impl FromStr for EventKind {
    type Err = UnknownEventKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "supply" => Ok(EventKind::Supply),
            "withdraw" => Ok(EventKind::Withdraw),
            "liquidate" => Ok(EventKind::Liquidate),
            other => Err(UnknownEventKind(other.to_string())),
        }
    }
}

/// One asset side of an event, as reported by the master contract after execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssetLeg {
    #[serde(serialize_with = "as_display")]
    pub asset_id: U256,
    pub amount: u64,
    pub principal: i64,
    pub total_supply_principal: i64,
    pub total_borrow_principal: i64,
    pub s_rate: u64,
    pub b_rate: u64,
}

/// Confirmed (or awaiting confirmation) supply/withdraw/liquidate event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Log {
    pub id: Option<i64>,
    #[serde(serialize_with = "as_display")]
    pub hash: TxHash,
    pub utime: u64,
    pub kind: EventKind,
    pub sender_address: TonAddress,
    pub user_address: TonAddress,
    pub attached: Option<AssetLeg>,
    pub redeemed: Option<AssetLeg>,
    pub processed: bool,
}

/// A request whose outcome message has not been observed yet.
/// `(lt, raw_body)` is the correlation key; `raw_body` is the lowercase hex bag of cells.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingOperation {
    pub id: Option<i64>,
    pub lt: u64,
    pub contract_address: TonAddress,
    pub opcode: u32,
    pub raw_body: String,
    pub event_id: i64,
    pub event_utime: u64,
    pub created_at: DateTime<Utc>,
}

/// Signed principals keyed by asset id, kept in asset-table order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Principals(Vec<(U256, i64)>);

impl Principals {
    /// Known assets first in `order`, then anything else by ascending id.
    pub fn ordered(entries: impl IntoIterator<Item = (U256, i64)>, order: &[U256]) -> Self {
        let mut rest: BTreeMap<U256, i64> = entries.into_iter().collect();
        let mut out = Vec::with_capacity(rest.len());
        for id in order {
            if let Some(value) = rest.remove(id) {
                out.push((*id, value));
            }
        }
        out.extend(rest);
        Self(out)
    }

    pub fn get(&self, asset_id: &U256) -> Option<i64> {
        self.0.iter().find(|(id, _)| id == asset_id).map(|(_, v)| *v)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(U256, i64)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Ordered `[["<decimal id>", principal], ...]`
    pub fn to_json(&self) -> String {
        let pairs: Vec<(String, i64)> = self.0.iter().map(|(id, v)| (id.to_string(), *v)).collect();
        serde_json::json!(pairs).to_string()
    }

    pub fn from_json(raw: &str) -> eyre::Result<Self> {
        let pairs: Vec<(String, i64)> = serde_json::from_str(raw)?;
        let entries = pairs
            .into_iter()
            .map(|(id, v)| Ok((id.parse::<U256>()?, v)))
            .collect::<eyre::Result<Vec<_>>>()?;
        Ok(Self(entries))
    }
}

impl Serialize for Principals {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (id, value) in &self.0 {
            map.serialize_entry(&id.to_string(), value)?;
        }
        map.end()
    }
}

/// Latest known on-chain balance state of one user contract
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserSnapshot {
    pub wallet_address: TonAddress,
    pub contract_address: TonAddress,
    pub code_version: u32,
    pub created_at: u64,
    pub updated_at: u64,
    pub principals: Principals,
    pub state: i64,
}

impl UserSnapshot {
    /// Takes balances from `incoming` (a fresher read) but never moves the
    /// timeline backwards: earliest creation and latest update win.
    pub fn merged_with(&self, incoming: &UserSnapshot) -> UserSnapshot {
        UserSnapshot {
            wallet_address: incoming.wallet_address,
            contract_address: self.contract_address,
            code_version: incoming.code_version,
            created_at: self.created_at.min(incoming.created_at),
            updated_at: self.updated_at.max(incoming.updated_at),
            principals: incoming.principals.clone(),
            state: incoming.state,
        }
    }
}

/// Deferred contract read; `due_at` is unix milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectionJob {
    pub contract_address: TonAddress,
    pub due_at: i64,
    pub first_event: u64,
    pub last_event: u64,
}

fn as_display<T: fmt::Display, S: Serializer>(value: &T, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}
