// src/rpc.rs
use crate::cell::{Cell, DecodeError, TonAddress};
use crate::models::{TxHash, TxMarker};
use async_trait::async_trait;
use eyre::{eyre, Result};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Transaction as returned by the indexing API
#[derive(Debug, Clone, Deserialize)]
pub struct Transaction {
    pub hash: String,
    pub lt: u64,
    pub utime: u64,
    #[serde(default)]
    pub aborted: bool,
    pub in_msg: Option<Message>,
    #[serde(default)]
    pub out_msgs: Vec<Message>,
    pub compute_phase: Option<Phase>,
    pub action_phase: Option<Phase>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Phase {
    pub success: Option<bool>,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub msg_type: String,
    #[serde(default)]
    pub created_lt: u64,
    pub op_code: Option<String>,
    pub raw_body: Option<String>,
    pub source: Option<AccountRef>,
    pub destination: Option<AccountRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountRef {
    pub address: String,
}

impl Transaction {
    pub fn tx_hash(&self) -> Result<TxHash, DecodeError> {
        let bytes = hex::decode(self.hash.trim_start_matches("0x"))?;
        if bytes.len() != 32 {
            return Err(DecodeError::Hex(format!("hash `{}` is not 32 bytes", self.hash)));
        }
        Ok(TxHash::from_slice(&bytes))
    }

    pub fn marker(&self) -> Result<TxMarker, DecodeError> {
        Ok(TxMarker {
            hash: self.tx_hash()?,
            lt: self.lt,
            utime: self.utime,
        })
    }

    /// Compute and action phases both ran and succeeded.
    pub fn executed(&self) -> bool {
        let ok = |phase: &Option<Phase>| matches!(phase, Some(Phase { success: Some(true), .. }));
        !self.aborted && ok(&self.compute_phase) && ok(&self.action_phase)
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.compute_phase.as_ref().and_then(|p| p.exit_code)
    }

    /// Outbound messages in emission order
    pub fn sorted_out_msgs(&self) -> Vec<&Message> {
        let mut msgs: Vec<&Message> = self.out_msgs.iter().collect();
        msgs.sort_by_key(|m| m.created_lt);
        msgs
    }
}

impl Message {
    pub fn opcode(&self) -> Option<u32> {
        if let Some(op) = &self.op_code {
            return u32::from_str_radix(op.trim_start_matches("0x"), 16).ok();
        }
        let body = self.body().ok()??;
        body.parse().load_uint(32).ok().map(|op| op as u32)
    }

    pub fn body(&self) -> Result<Option<Cell>, DecodeError> {
        match &self.raw_body {
            Some(raw) if !raw.is_empty() => Cell::from_boc_hex(raw).map(Some),
            _ => Ok(None),
        }
    }

    /// Lowercase hex body, the form used as a correlation key
    pub fn body_key(&self) -> Option<String> {
        self.raw_body.as_ref().map(|raw| raw.trim().to_ascii_lowercase())
    }

    pub fn is_internal(&self) -> bool {
        self.msg_type == "int_msg"
    }

    pub fn is_external_out(&self) -> bool {
        self.msg_type == "ext_out_msg"
    }

    pub fn destination(&self) -> Option<TonAddress> {
        self.destination.as_ref().and_then(|d| d.address.parse().ok())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GetMethodResult {
    #[serde(default)]
    pub success: bool,
    pub exit_code: i32,
    #[serde(default)]
    pub stack: Vec<StackEntry>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StackEntry {
    Num { num: String },
    Cell { cell: String },
    Slice { slice: String },
    Null,
    Nan,
    Tuple {
        #[serde(default)]
        tuple: Vec<StackEntry>,
    },
}

#[derive(Debug, Deserialize)]
struct TransactionsPage {
    #[serde(default)]
    transactions: Vec<Transaction>,
}

/// Blockchain indexing/RPC access needed by the pipeline. Single attempt per call;
/// call sites own their retry policy.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Up to `limit` transactions of `account` strictly older than `before_lt`
    /// (newest first when `before_lt` is `None`).
    async fn get_account_transactions(
        &self,
        account: &TonAddress,
        before_lt: Option<u64>,
        limit: usize,
    ) -> Result<Vec<Transaction>>;

    async fn call_get_method(&self, account: &TonAddress, method: &str) -> Result<GetMethodResult>;
}

pub struct TonApiClient {
    base_url: String,
    api_key: Option<String>,
    client: Client,
}

impl TonApiClient {
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(15)).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str, query: &[(&str, String)]) -> Result<T> {
        let mut request = self.client.get(url).query(query);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let resp = request.send().await?;
        if resp.status() != StatusCode::OK {
            return Err(eyre!("TonAPI error: HTTP {} for {}", resp.status(), url));
        }
        let text = resp.text().await?;
        debug!("TonAPI {} → {} bytes", url, text.len());
        Ok(serde_json::from_str(&text)?)
    }
}

#[async_trait]
impl ChainClient for TonApiClient {
    async fn get_account_transactions(
        &self,
        account: &TonAddress,
        before_lt: Option<u64>,
        limit: usize,
    ) -> Result<Vec<Transaction>> {
        let url = format!("{}/v2/blockchain/accounts/{}/transactions", self.base_url, account);
        let mut query = vec![("limit", limit.to_string()), ("sort_order", "desc".to_string())];
        if let Some(lt) = before_lt {
            query.push(("before_lt", lt.to_string()));
        }

        let page: TransactionsPage = self.get_json(&url, &query).await?;
        Ok(page.transactions)
    }

    async fn call_get_method(&self, account: &TonAddress, method: &str) -> Result<GetMethodResult> {
        let url = format!(
            "{}/v2/blockchain/accounts/{}/methods/{}",
            self.base_url, account, method
        );
        self.get_json(&url, &[]).await
    }
}
