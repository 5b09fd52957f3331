// src/testing.rs
//! Builders, fixtures and fakes shared by the unit tests.

use crate::cell::{crc32c, Cell, TonAddress};
use crate::db::{SqliteStore, Store};
use crate::models::{AssetLeg, Log, PendingOperation, ProjectionJob, TxHash, TxMarker, UserSnapshot};
use crate::notifier::{Channel, Notifier};
use crate::parser::op;
use crate::retry::RetryPolicy;
use crate::rpc::{AccountRef, ChainClient, GetMethodResult, Message, Phase, StackEntry, Transaction};
use alloy::primitives::U256;
use async_trait::async_trait;
use eyre::{eyre, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn addr(n: u8) -> TonAddress {
    TonAddress {
        workchain: 0,
        hash: [n; 32],
    }
}

#[derive(Debug, Default, Clone)]
pub struct CellBuilder {
    bits: Vec<bool>,
    refs: Vec<Arc<Cell>>,
}

impl CellBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store_bit(mut self, bit: bool) -> Self {
        self.bits.push(bit);
        self
    }

    pub fn store_uint(mut self, value: u64, bits: usize) -> Self {
        for i in (0..bits).rev() {
            self.bits.push(i < 64 && (value >> i) & 1 == 1);
        }
        self
    }

    pub fn store_int(self, value: i64, bits: usize) -> Self {
        let raw = if bits == 64 { value as u64 } else { (value as u64) & ((1u64 << bits) - 1) };
        self.store_uint(raw, bits)
    }

    pub fn store_bytes(mut self, bytes: &[u8]) -> Self {
        for b in bytes {
            self = self.store_uint(*b as u64, 8);
        }
        self
    }

    pub fn store_u256(self, value: U256) -> Self {
        self.store_bytes(&value.to_be_bytes::<32>())
    }

    pub fn store_coins(self, value: u128) -> Self {
        let bytes = value.to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count();
        let len = bytes.len() - skip;
        self.store_uint(len as u64, 4).store_bytes(&bytes[skip..])
    }

    pub fn store_address(self, address: &TonAddress) -> Self {
        self.store_uint(0b10, 2)
            .store_bit(false)
            .store_int(address.workchain as i64, 8)
            .store_bytes(&address.hash)
    }

    pub fn store_ref(mut self, cell: Cell) -> Self {
        self.refs.push(Arc::new(cell));
        self
    }

    pub fn store_maybe_ref(self, cell: Option<Cell>) -> Self {
        match cell {
            Some(cell) => self.store_bit(true).store_ref(cell),
            None => self.store_bit(false),
        }
    }

    pub fn build(self) -> Cell {
        let mut data = vec![0u8; self.bits.len().div_ceil(8)];
        for (i, bit) in self.bits.iter().enumerate() {
            if *bit {
                data[i / 8] |= 0x80 >> (i % 8);
            }
        }
        Cell::new(data, self.bits.len(), self.refs).unwrap()
    }
}

/// Serializes `root` as a checksummed single-root bag of cells.
pub fn to_boc(root: &Cell) -> Vec<u8> {
    fn flatten<'a>(cell: &'a Cell, out: &mut Vec<&'a Cell>) {
        out.push(cell);
        for child in cell.refs() {
            flatten(child, out);
        }
    }
    // pre-order numbering: a cell's children follow it, depth first
    fn number(cell: &Cell, indices: &mut Vec<Vec<usize>>) {
        let slot = indices.len();
        indices.push(Vec::new());
        let mut children = Vec::new();
        for child in cell.refs() {
            children.push(indices.len());
            number(child, indices);
        }
        indices[slot] = children;
    }
    let mut cells = Vec::new();
    flatten(root, &mut cells);
    let mut indices = Vec::with_capacity(cells.len());
    number(root, &mut indices);

    let size = if cells.len() < 256 { 1 } else { 2 };
    let mut body = Vec::new();
    for (cell, refs) in cells.iter().zip(&indices) {
        let bits = cell.bit_len();
        body.push(refs.len() as u8);
        body.push(((bits / 8) * 2 + usize::from(bits % 8 != 0)) as u8);
        let mut data = cell.data().to_vec();
        if bits % 8 != 0 {
            if let Some(last) = data.last_mut() {
                *last |= 0x80 >> (bits % 8);
            }
        }
        body.extend_from_slice(&data);
        for r in refs {
            body.extend_from_slice(&r.to_be_bytes()[8 - size..]);
        }
    }

    let off_bytes = (body.len().max(1).ilog2() as usize / 8) + 1;
    let mut out = Vec::new();
    out.extend_from_slice(&0xb5ee_9c72u32.to_be_bytes());
    out.push(0x40 | size as u8);
    out.push(off_bytes as u8);
    out.extend_from_slice(&cells.len().to_be_bytes()[8 - size..]);
    out.extend_from_slice(&1usize.to_be_bytes()[8 - size..]);
    out.extend_from_slice(&0usize.to_be_bytes()[8 - size..]);
    out.extend_from_slice(&body.len().to_be_bytes()[8 - off_bytes..]);
    out.extend_from_slice(&0usize.to_be_bytes()[8 - size..]);
    out.extend_from_slice(&body);
    let crc = crc32c(&out);
    out.extend_from_slice(&crc.to_le_bytes());
    out
}

pub fn boc_hex(cell: &Cell) -> String {
    hex::encode(to_boc(cell))
}

// ---------- protocol bodies ----------

pub fn supply_body(owner: &TonAddress, asset: U256, amount: u64) -> Cell {
    CellBuilder::new()
        .store_uint(op::SUPPLY as u64, 32)
        .store_uint(7, 64)
        .store_address(owner)
        .store_u256(asset)
        .store_uint(amount, 64)
        .build()
}

pub fn withdraw_body(owner: &TonAddress, asset: U256, amount: u64) -> Cell {
    CellBuilder::new()
        .store_uint(op::WITHDRAW as u64, 32)
        .store_uint(8, 64)
        .store_address(owner)
        .store_u256(asset)
        .store_uint(amount, 64)
        .build()
}

pub fn liquidate_body(
    borrower: &TonAddress,
    loan_asset: U256,
    collateral_asset: U256,
    min_collateral: u64,
    liquidation_amount: u64,
) -> Cell {
    CellBuilder::new()
        .store_uint(op::LIQUIDATE as u64, 32)
        .store_uint(9, 64)
        .store_address(borrower)
        .store_ref(
            CellBuilder::new()
                .store_u256(loan_asset)
                .store_u256(collateral_asset)
                .store_uint(min_collateral, 64)
                .store_uint(liquidation_amount, 64)
                .build(),
        )
        .build()
}

/// Report sent by the master: version, no upgrade, then the outcome.
pub fn report_body(outcome_op: u32, error_code: Option<u32>) -> Cell {
    let b = CellBuilder::new()
        .store_coins(5)
        .store_maybe_ref(None)
        .store_int(0, 2)
        .store_uint(outcome_op as u64, 32);
    match error_code {
        Some(code) => b.store_uint(code as u64, 32).build(),
        None => b.build(),
    }
}

pub fn outcome_body(outcome_op: u32, error_code: Option<u32>) -> Cell {
    let b = CellBuilder::new().store_uint(outcome_op as u64, 32);
    match error_code {
        Some(code) => b.store_uint(code as u64, 32).build(),
        None => b.build(),
    }
}

pub fn leg(asset: U256, amount: u64, principal: i64) -> AssetLeg {
    AssetLeg {
        asset_id: asset,
        amount,
        principal,
        total_supply_principal: 1_000_000,
        total_borrow_principal: 400_000,
        s_rate: 1_000_000_001,
        b_rate: 1_000_000_002,
    }
}

fn leg_cell(leg: Option<&AssetLeg>) -> Cell {
    match leg {
        Some(l) => CellBuilder::new()
            .store_u256(l.asset_id)
            .store_uint(l.amount, 64)
            .store_int(l.principal, 64)
            .store_int(l.total_supply_principal, 64)
            .store_int(l.total_borrow_principal, 64)
            .store_uint(l.s_rate, 64)
            .store_uint(l.b_rate, 64)
            .build(),
        None => CellBuilder::new().build(),
    }
}

pub fn log_body(
    tag: u8,
    user: &TonAddress,
    user_contract: &TonAddress,
    time: u32,
    attached: Option<&AssetLeg>,
    redeemed: Option<&AssetLeg>,
) -> Cell {
    CellBuilder::new()
        .store_uint(tag as u64, 8)
        .store_address(user)
        .store_address(user_contract)
        .store_uint(time as u64, 32)
        .store_ref(leg_cell(attached))
        .store_ref(leg_cell(redeemed))
        .build()
}

/// `HashmapE 256 int64` holding `entries`, or `None` when empty.
pub fn principals_dict(entries: &[(U256, i64)]) -> Option<Cell> {
    fn key_bits(key: U256) -> Vec<bool> {
        (0..256).map(|i| key.bit(255 - i)).collect()
    }

    fn edge(entries: &[(Vec<bool>, i64)], n: usize) -> Cell {
        let first = &entries[0].0;
        let common = entries
            .iter()
            .map(|(k, _)| k.iter().zip(first).take_while(|(a, b)| a == b).count())
            .min()
            .unwrap_or(n)
            .min(n);

        let len_bits = (usize::BITS - n.leading_zeros()) as usize;
        let mut b = CellBuilder::new()
            .store_bit(true)
            .store_bit(false)
            .store_uint(common as u64, len_bits);
        for bit in &first[..common] {
            b = b.store_bit(*bit);
        }
        if common == n {
            return b.store_int(entries[0].1, 64).build();
        }

        let split = |side: bool| -> Vec<(Vec<bool>, i64)> {
            entries
                .iter()
                .filter(|(k, _)| k[common] == side)
                .map(|(k, v)| (k[common + 1..].to_vec(), *v))
                .collect()
        };
        let rest = n - common - 1;
        b.store_ref(edge(&split(false), rest))
            .store_ref(edge(&split(true), rest))
            .build()
    }

    if entries.is_empty() {
        return None;
    }
    let keyed: Vec<(Vec<bool>, i64)> = entries.iter().map(|(k, v)| (key_bits(*k), *v)).collect();
    Some(edge(&keyed, 256))
}

/// Successful `getAllUserScData` reply.
pub fn user_state_result(master: &TonAddress, user: &TonAddress, principals: &[(U256, i64)]) -> GetMethodResult {
    let address = |a: &TonAddress| boc_hex(&CellBuilder::new().store_address(a).build());
    let dict = match principals_dict(principals) {
        Some(cell) => StackEntry::Cell { cell: boc_hex(&cell) },
        None => StackEntry::Null,
    };
    GetMethodResult {
        success: true,
        exit_code: 0,
        stack: vec![
            StackEntry::Num { num: "0x1".into() },
            StackEntry::Slice { slice: address(master) },
            StackEntry::Cell { cell: address(user) },
            dict,
            StackEntry::Num { num: "0x0".into() },
        ],
    }
}

// ---------- transactions ----------

pub fn int_msg(created_lt: u64, destination: Option<&TonAddress>, body: &Cell) -> Message {
    Message {
        msg_type: "int_msg".into(),
        created_lt,
        op_code: None,
        raw_body: Some(boc_hex(body)),
        source: None,
        destination: destination.map(|d| AccountRef {
            address: d.to_string(),
        }),
    }
}

pub fn ext_out_msg(created_lt: u64, body: &Cell) -> Message {
    Message {
        msg_type: "ext_out_msg".into(),
        created_lt,
        op_code: None,
        raw_body: Some(boc_hex(body)),
        source: None,
        destination: None,
    }
}

pub fn transaction(hash: u8, lt: u64, utime: u64, in_msg: Option<Message>, out_msgs: Vec<Message>) -> Transaction {
    let ok = Some(Phase {
        success: Some(true),
        exit_code: Some(0),
    });
    Transaction {
        hash: hex::encode([hash; 32]),
        lt,
        utime,
        aborted: false,
        in_msg,
        out_msgs,
        compute_phase: ok.clone(),
        action_phase: ok,
    }
}

/// A transaction that carries no protocol message.
pub fn plain_transaction(hash: u8, lt: u64, utime: u64) -> Transaction {
    transaction(hash, lt, utime, None, Vec::new())
}

// ---------- fakes ----------

pub fn memory_store() -> Arc<SqliteStore> {
    Arc::new(SqliteStore::open_in_memory().unwrap())
}

/// Delegates to an in-memory store, failing a scripted number of
/// pending-operation inserts and projection enqueues.
pub struct FlakyStore {
    inner: Arc<SqliteStore>,
    pending_insert_failures: Mutex<usize>,
    enqueue_failures: Mutex<usize>,
}

impl FlakyStore {
    pub fn new(inner: Arc<SqliteStore>) -> Self {
        Self {
            inner,
            pending_insert_failures: Mutex::new(0),
            enqueue_failures: Mutex::new(0),
        }
    }

    pub fn fail_next_pending_inserts(&self, n: usize) {
        *self.pending_insert_failures.lock().unwrap() = n;
    }

    pub fn fail_next_enqueues(&self, n: usize) {
        *self.enqueue_failures.lock().unwrap() = n;
    }

    fn take_failure(counter: &Mutex<usize>) -> Result<()> {
        let mut left = counter.lock().unwrap();
        if *left > 0 {
            *left -= 1;
            return Err(eyre!("disk I/O error"));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for FlakyStore {
    async fn mark_transaction_seen(&self, tx: &TxMarker) -> Result<bool> {
        self.inner.mark_transaction_seen(tx).await
    }
    async fn has_transaction(&self, hash: &TxHash) -> Result<bool> {
        self.inner.has_transaction(hash).await
    }
    async fn append_event(&self, event: &Log) -> Result<Option<i64>> {
        self.inner.append_event(event).await
    }
    async fn find_event_by_hash(&self, hash: &TxHash) -> Result<Option<Log>> {
        self.inner.find_event_by_hash(hash).await
    }
    async fn delete_event(&self, id: i64) -> Result<()> {
        self.inner.delete_event(id).await
    }
    async fn mark_event_processed(&self, id: i64) -> Result<()> {
        self.inner.mark_event_processed(id).await
    }
    async fn list_unprocessed_events(&self) -> Result<Vec<Log>> {
        self.inner.list_unprocessed_events().await
    }
    async fn list_events(&self, limit: u32, unprocessed_only: bool) -> Result<Vec<Log>> {
        self.inner.list_events(limit, unprocessed_only).await
    }
    async fn get_user_snapshot(&self, contract: &TonAddress) -> Result<Option<UserSnapshot>> {
        self.inner.get_user_snapshot(contract).await
    }
    async fn insert_user_snapshot(&self, snapshot: &UserSnapshot) -> Result<()> {
        self.inner.insert_user_snapshot(snapshot).await
    }
    async fn merge_user_snapshot(&self, snapshot: &UserSnapshot) -> Result<()> {
        self.inner.merge_user_snapshot(snapshot).await
    }
    async fn add_pending_operation(&self, op: &PendingOperation) -> Result<i64> {
        Self::take_failure(&self.pending_insert_failures)?;
        self.inner.add_pending_operation(op).await
    }
    async fn find_pending_operation(&self, lt: u64, raw_body: &str) -> Result<Option<PendingOperation>> {
        self.inner.find_pending_operation(lt, raw_body).await
    }
    async fn list_pending_operations(&self) -> Result<Vec<PendingOperation>> {
        self.inner.list_pending_operations().await
    }
    async fn remove_pending_operation(&self, id: i64) -> Result<()> {
        self.inner.remove_pending_operation(id).await
    }
    async fn enqueue_projection(&self, job: &ProjectionJob) -> Result<()> {
        Self::take_failure(&self.enqueue_failures)?;
        self.inner.enqueue_projection(job).await
    }
    async fn due_projections(&self, now_ms: i64) -> Result<Vec<ProjectionJob>> {
        self.inner.due_projections(now_ms).await
    }
    async fn complete_projection(&self, job: &ProjectionJob) -> Result<()> {
        self.inner.complete_projection(job).await
    }
    async fn load_walk_cursor(&self, account: &TonAddress) -> Result<Option<u64>> {
        self.inner.load_walk_cursor(account).await
    }
    async fn save_walk_cursor(&self, account: &TonAddress, before_lt: Option<u64>) -> Result<()> {
        self.inner.save_walk_cursor(account, before_lt).await
    }
}

pub fn instant_policy(attempts: u32) -> RetryPolicy {
    RetryPolicy::fixed(attempts, Duration::ZERO)
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(Channel, String)>>,
}

impl RecordingNotifier {
    pub fn messages(&self, channel: Channel) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| *c == channel)
            .map(|(_, m)| m.clone())
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, channel: Channel, message: &str) -> Result<()> {
        self.sent.lock().unwrap().push((channel, message.to_string()));
        Ok(())
    }
}

/// Scripted chain: per-account histories plus queued get-method replies.
#[derive(Default)]
pub struct FakeChain {
    history: Mutex<HashMap<TonAddress, Vec<Transaction>>>,
    fetch_failures: Mutex<usize>,
    fetches: Mutex<usize>,
    methods: Mutex<HashMap<TonAddress, VecDeque<Result<GetMethodResult, String>>>>,
    method_calls: Mutex<usize>,
}

impl FakeChain {
    pub fn push_transactions(&self, account: &TonAddress, txs: Vec<Transaction>) {
        self.history.lock().unwrap().entry(*account).or_default().extend(txs);
    }

    pub fn fail_next_fetches(&self, n: usize) {
        *self.fetch_failures.lock().unwrap() = n;
    }

    pub fn fetches(&self) -> usize {
        *self.fetches.lock().unwrap()
    }

    pub fn push_method_result(&self, account: &TonAddress, result: Result<GetMethodResult, String>) {
        self.methods.lock().unwrap().entry(*account).or_default().push_back(result);
    }

    pub fn method_calls(&self) -> usize {
        *self.method_calls.lock().unwrap()
    }
}

#[async_trait]
impl ChainClient for FakeChain {
    async fn get_account_transactions(
        &self,
        account: &TonAddress,
        before_lt: Option<u64>,
        limit: usize,
    ) -> Result<Vec<Transaction>> {
        *self.fetches.lock().unwrap() += 1;
        {
            let mut failures = self.fetch_failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(eyre!("connection reset"));
            }
        }

        let history = self.history.lock().unwrap();
        let mut page: Vec<Transaction> = history
            .get(account)
            .map(|txs| {
                txs.iter()
                    .filter(|tx| before_lt.map_or(true, |lt| tx.lt < lt))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        page.sort_by(|a, b| b.lt.cmp(&a.lt));
        page.truncate(limit);
        // the upstream API does not promise an order
        page.reverse();
        Ok(page)
    }

    async fn call_get_method(&self, account: &TonAddress, _method: &str) -> Result<GetMethodResult> {
        *self.method_calls.lock().unwrap() += 1;
        let next = self
            .methods
            .lock()
            .unwrap()
            .get_mut(account)
            .and_then(|q| q.pop_front());
        match next {
            Some(Ok(result)) => Ok(result),
            Some(Err(msg)) => Err(eyre!(msg)),
            None => Err(eyre!("no scripted result for {account}")),
        }
    }
}
