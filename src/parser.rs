// src/parser.rs
use crate::cell::{Cell, CellSlice, DecodeError, TonAddress};
use crate::models::{AssetLeg, EventKind, Log, Principals, TxHash};
use crate::rpc::StackEntry;
use alloy::primitives::U256;

pub mod op {
    pub const SUPPLY: u32 = 0x11a;
    pub const SUPPLY_SUCCESS: u32 = 0x11f1;
    pub const SUPPLY_FAIL: u32 = 0x11f2;
    pub const WITHDRAW: u32 = 0x211;
    pub const WITHDRAW_SUCCESS: u32 = 0x211a;
    pub const WITHDRAW_FAIL: u32 = 0x211f;
    pub const LIQUIDATE: u32 = 0x311;
    pub const LIQUIDATE_SUCCESS: u32 = 0x311a;
    pub const LIQUIDATE_FAIL: u32 = 0x311f;
    pub const JETTON_TRANSFER_NOTIFICATION: u32 = 0x7362_d09c;
}

/// Withdraw amount meaning "everything the user has"
pub const WITHDRAW_ALL: u64 = u64::MAX;

/// Request opcode with the only outcomes it may produce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Family {
    pub kind: EventKind,
    pub request: u32,
    pub success: u32,
    pub fail: u32,
    pub log_tag: u8,
}

const FAMILIES: [Family; 3] = [
    Family {
        kind: EventKind::Supply,
        request: op::SUPPLY,
        success: op::SUPPLY_SUCCESS,
        fail: op::SUPPLY_FAIL,
        log_tag: 1,
    },
    Family {
        kind: EventKind::Withdraw,
        request: op::WITHDRAW,
        success: op::WITHDRAW_SUCCESS,
        fail: op::WITHDRAW_FAIL,
        log_tag: 2,
    },
    Family {
        kind: EventKind::Liquidate,
        request: op::LIQUIDATE,
        success: op::LIQUIDATE_SUCCESS,
        fail: op::LIQUIDATE_FAIL,
        log_tag: 3,
    },
];

pub fn family(kind: EventKind) -> &'static Family {
    match kind {
        EventKind::Supply => &FAMILIES[0],
        EventKind::Withdraw => &FAMILIES[1],
        EventKind::Liquidate => &FAMILIES[2],
    }
}

pub fn family_of_request(opcode: u32) -> Option<&'static Family> {
    FAMILIES.iter().find(|f| f.request == opcode)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Supply {
        query_id: u64,
        owner: TonAddress,
        asset_id: U256,
        amount: u64,
    },
    Withdraw {
        query_id: u64,
        owner: TonAddress,
        asset_id: U256,
        amount: u64,
    },
    Liquidate {
        query_id: u64,
        borrower: TonAddress,
        loan_asset: U256,
        collateral_asset: U256,
        min_collateral: u64,
        liquidation_amount: u64,
    },
}

impl Request {
    pub fn kind(&self) -> EventKind {
        match self {
            Request::Supply { .. } => EventKind::Supply,
            Request::Withdraw { .. } => EventKind::Withdraw,
            Request::Liquidate { .. } => EventKind::Liquidate,
        }
    }
}

type RequestDecoder = fn(&mut CellSlice<'_>) -> Result<Request, DecodeError>;

const REQUEST_DECODERS: [(u32, RequestDecoder); 4] = [
    (op::SUPPLY, decode_supply),
    (op::WITHDRAW, decode_withdraw),
    (op::LIQUIDATE, decode_liquidate),
    (op::JETTON_TRANSFER_NOTIFICATION, decode_jetton_notification),
];

pub fn is_request_opcode(opcode: u32) -> bool {
    REQUEST_DECODERS.iter().any(|(op, _)| *op == opcode)
}

/// Decode the inbound body of a request transaction. The body must start with
/// `opcode` and be consumed completely.
pub fn decode_request(opcode: u32, body: &Cell) -> Result<Request, DecodeError> {
    let decoder = REQUEST_DECODERS
        .iter()
        .find(|(op, _)| *op == opcode)
        .map(|(_, decoder)| *decoder)
        .ok_or(DecodeError::UnknownOpcode(opcode))?;

    let mut s = body.parse();
    expect_opcode(&mut s, opcode)?;
    let request = decoder(&mut s)?;
    s.end_parse()?;
    Ok(request)
}

fn expect_opcode(s: &mut CellSlice<'_>, expected: u32) -> Result<(), DecodeError> {
    let found = s.load_uint(32)? as u32;
    if found != expected {
        return Err(DecodeError::UnexpectedOpcode { expected, found });
    }
    Ok(())
}

fn decode_supply(s: &mut CellSlice<'_>) -> Result<Request, DecodeError> {
    Ok(Request::Supply {
        query_id: s.load_uint(64)?,
        owner: s.load_address()?,
        asset_id: s.load_u256()?,
        amount: s.load_uint(64)?,
    })
}

fn decode_withdraw(s: &mut CellSlice<'_>) -> Result<Request, DecodeError> {
    Ok(Request::Withdraw {
        query_id: s.load_uint(64)?,
        owner: s.load_address()?,
        asset_id: s.load_u256()?,
        amount: s.load_uint(64)?,
    })
}

fn decode_liquidate(s: &mut CellSlice<'_>) -> Result<Request, DecodeError> {
    let query_id = s.load_uint(64)?;
    let borrower = s.load_address()?;
    let mut params = s.load_ref()?.parse();
    let request = Request::Liquidate {
        query_id,
        borrower,
        loan_asset: params.load_u256()?,
        collateral_asset: params.load_u256()?,
        min_collateral: params.load_uint(64)?,
        liquidation_amount: params.load_uint(64)?,
    };
    params.end_parse()?;
    Ok(request)
}

/// Jetton-funded supply or liquidation. The forwarded payload is a regular
/// request body; the jetton amount replaces its amount field.
fn decode_jetton_notification(s: &mut CellSlice<'_>) -> Result<Request, DecodeError> {
    let _query_id = s.load_uint(64)?;
    let jetton_amount =
        u64::try_from(s.load_coins()?).map_err(|_| DecodeError::Overflow("jetton amount"))?;
    let _sender = s.load_address()?;

    let request = if s.load_bit()? {
        let mut payload = s.load_ref()?.parse();
        let request = decode_forwarded(&mut payload)?;
        payload.end_parse()?;
        request
    } else {
        decode_forwarded(s)?
    };

    Ok(match request {
        Request::Supply {
            query_id,
            owner,
            asset_id,
            ..
        } => Request::Supply {
            query_id,
            owner,
            asset_id,
            amount: jetton_amount,
        },
        Request::Liquidate {
            query_id,
            borrower,
            loan_asset,
            collateral_asset,
            min_collateral,
            ..
        } => Request::Liquidate {
            query_id,
            borrower,
            loan_asset,
            collateral_asset,
            min_collateral,
            liquidation_amount: jetton_amount,
        },
        Request::Withdraw { .. } => return Err(DecodeError::UnknownOpcode(op::WITHDRAW)),
    })
}

fn decode_forwarded(s: &mut CellSlice<'_>) -> Result<Request, DecodeError> {
    match s.load_uint(32)? as u32 {
        op::SUPPLY => decode_supply(s),
        op::LIQUIDATE => decode_liquidate(s),
        other => Err(DecodeError::UnknownOpcode(other)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Fail { error_code: u32 },
}

/// Master's report to the user contract
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub version: u128,
    pub has_upgrade: bool,
    pub upgrade_exec: i64,
    pub outcome: Outcome,
}

pub fn decode_report(family: &Family, body: &Cell) -> Result<Report, DecodeError> {
    let mut s = body.parse();
    let version = s.load_coins()?;
    let has_upgrade = s.load_maybe_ref()?.is_some();
    let upgrade_exec = s.load_int(2)?;
    let outcome = read_outcome(family, &mut s)?;
    Ok(Report {
        version,
        has_upgrade,
        upgrade_exec,
        outcome,
    })
}

/// Bare outcome as sent back by a user contract.
pub fn decode_outcome(family: &Family, body: &Cell) -> Result<Outcome, DecodeError> {
    read_outcome(family, &mut body.parse())
}

fn read_outcome(family: &Family, s: &mut CellSlice<'_>) -> Result<Outcome, DecodeError> {
    let opcode = s.load_uint(32)? as u32;
    if opcode == family.success {
        Ok(Outcome::Success)
    } else if opcode == family.fail {
        Ok(Outcome::Fail {
            error_code: s.load_uint(32)? as u32,
        })
    } else {
        Err(DecodeError::UnexpectedOutcome {
            request: family.request,
            outcome: opcode,
        })
    }
}

pub fn error_description(code: u32) -> &'static str {
    match code {
        0x30F1 => "Master liquidating too much",
        0x31F0 => "User withdraw in process",
        0x31F2 => "Not liquidatable",
        0x31F3 => "Min collateral not satisfied",
        0x31F4 => "User not enough collateral",
        0x31F5 => "User liquidating too much",
        0x31F6 => "Master not enough liquidity",
        _ => "Unknown error",
    }
}

/// External log emitted by the master after executing a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMessage {
    pub kind: EventKind,
    pub user_address: TonAddress,
    pub user_contract: TonAddress,
    pub time: u32,
    pub attached: Option<AssetLeg>,
    pub redeemed: Option<AssetLeg>,
}

impl LogMessage {
    pub fn into_event(self, hash: TxHash, processed: bool) -> Log {
        Log {
            id: None,
            hash,
            utime: self.time as u64,
            kind: self.kind,
            sender_address: self.user_contract,
            user_address: self.user_address,
            attached: self.attached,
            redeemed: self.redeemed,
            processed,
        }
    }
}

pub fn decode_log(kind: EventKind, body: &Cell) -> Result<LogMessage, DecodeError> {
    let expected = family(kind).log_tag;
    let mut s = body.parse();
    let tag = s.load_uint(8)? as u8;
    if tag != expected {
        return Err(DecodeError::UnexpectedOpcode {
            expected: expected as u32,
            found: tag as u32,
        });
    }

    let user_address = s.load_address()?;
    let user_contract = s.load_address()?;
    let time = s.load_uint(32)? as u32;
    let attached = s.load_ref()?;
    let redeemed = s.load_ref()?;
    s.end_parse()?;

    let (attached, redeemed) = match kind {
        EventKind::Supply => (Some(decode_leg(attached)?), empty_leg(redeemed)?),
        EventKind::Withdraw => (empty_leg(attached)?, Some(decode_leg(redeemed)?)),
        EventKind::Liquidate => (Some(decode_leg(attached)?), Some(decode_leg(redeemed)?)),
    };

    Ok(LogMessage {
        kind,
        user_address,
        user_contract,
        time,
        attached,
        redeemed,
    })
}

fn decode_leg(cell: &Cell) -> Result<AssetLeg, DecodeError> {
    let mut s = cell.parse();
    let leg = AssetLeg {
        asset_id: s.load_u256()?,
        amount: s.load_uint(64)?,
        principal: s.load_int(64)?,
        total_supply_principal: s.load_int(64)?,
        total_borrow_principal: s.load_int(64)?,
        s_rate: s.load_uint(64)?,
        b_rate: s.load_uint(64)?,
    };
    s.end_parse()?;
    Ok(leg)
}

fn empty_leg(cell: &Cell) -> Result<Option<AssetLeg>, DecodeError> {
    cell.parse().end_parse()?;
    Ok(None)
}

/// Disagreement between what was requested and what the log reports.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Mismatch {
    #[error("{leg} asset mismatch: requested {requested}, executed {reported}")]
    Asset {
        leg: &'static str,
        requested: U256,
        reported: U256,
    },
    #[error("{leg} amount mismatch: requested {requested}, executed {reported}")]
    Amount {
        leg: &'static str,
        asset_id: U256,
        requested: u64,
        reported: u64,
    },
    #[error("collateral reward {reward} below requested minimum {minimum}")]
    CollateralBelowMinimum {
        asset_id: U256,
        minimum: u64,
        reward: u64,
    },
}

pub fn verify_amounts(request: &Request, log: &LogMessage) -> Vec<Mismatch> {
    let mut found = Vec::new();
    let mut check = |leg_name: &'static str, leg: Option<&AssetLeg>, asset: U256, amount: Option<u64>| {
        let Some(leg) = leg else { return };
        if leg.asset_id != asset {
            found.push(Mismatch::Asset {
                leg: leg_name,
                requested: asset,
                reported: leg.asset_id,
            });
        }
        if let Some(requested) = amount {
            if requested != leg.amount {
                found.push(Mismatch::Amount {
                    leg: leg_name,
                    asset_id: leg.asset_id,
                    requested,
                    reported: leg.amount,
                });
            }
        }
    };

    match request {
        Request::Supply { asset_id, amount, .. } => {
            check("supplied", log.attached.as_ref(), *asset_id, Some(*amount));
        }
        Request::Withdraw { asset_id, amount, .. } => {
            let amount = (*amount != WITHDRAW_ALL).then_some(*amount);
            check("withdrawn", log.redeemed.as_ref(), *asset_id, amount);
        }
        Request::Liquidate {
            loan_asset,
            collateral_asset,
            min_collateral,
            liquidation_amount,
            ..
        } => {
            check("repaid", log.attached.as_ref(), *loan_asset, Some(*liquidation_amount));
            check("collateral", log.redeemed.as_ref(), *collateral_asset, None);
            if let Some(reward) = &log.redeemed {
                if reward.amount < *min_collateral {
                    found.push(Mismatch::CollateralBelowMinimum {
                        asset_id: reward.asset_id,
                        minimum: *min_collateral,
                        reward: reward.amount,
                    });
                }
            }
        }
    }
    found
}

/// Result of the user contract's `getAllUserScData`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserState {
    pub code_version: u32,
    pub master_address: TonAddress,
    pub user_address: TonAddress,
    pub principals: Principals,
    pub state: i64,
}

pub fn decode_user_state(stack: &[StackEntry], order: &[U256]) -> Result<UserState, DecodeError> {
    let [version, master, user, principals, state] = stack else {
        return Err(DecodeError::Stack(format!("expected 5 entries, got {}", stack.len())));
    };

    let code_version = u32::try_from(stack_int(version)?)
        .map_err(|_| DecodeError::Stack("code version out of range".into()))?;
    let state = i64::try_from(stack_int(state)?).map_err(|_| DecodeError::Overflow("state"))?;

    let mut entries = Vec::new();
    match principals {
        StackEntry::Null => {}
        StackEntry::Cell { cell } | StackEntry::Slice { slice: cell } => {
            read_hashmap(&Cell::from_boc_hex(cell)?, 256, U256::ZERO, &mut entries)?;
        }
        other => return Err(DecodeError::Stack(format!("principals entry {other:?}"))),
    }

    Ok(UserState {
        code_version,
        master_address: stack_address(master)?,
        user_address: stack_address(user)?,
        principals: Principals::ordered(entries, order),
        state,
    })
}

fn stack_int(entry: &StackEntry) -> Result<i128, DecodeError> {
    let StackEntry::Num { num } = entry else {
        return Err(DecodeError::Stack(format!("expected a number, got {entry:?}")));
    };
    let (negative, digits) = match num.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, num.as_str()),
    };
    let value = match digits.strip_prefix("0x") {
        Some(hex) => i128::from_str_radix(hex, 16),
        None => digits.parse::<i128>(),
    }
    .map_err(|e| DecodeError::Stack(format!("number `{num}`: {e}")))?;
    Ok(if negative { -value } else { value })
}

fn stack_address(entry: &StackEntry) -> Result<TonAddress, DecodeError> {
    match entry {
        StackEntry::Cell { cell } | StackEntry::Slice { slice: cell } => {
            Cell::from_boc_hex(cell)?.parse().load_address()
        }
        other => Err(DecodeError::Stack(format!("expected an address, got {other:?}"))),
    }
}

/// `Hashmap n int64`, walking every edge; `prefix` holds the key bits read so far.
fn read_hashmap(
    cell: &Cell,
    n: usize,
    prefix: U256,
    out: &mut Vec<(U256, i64)>,
) -> Result<(), DecodeError> {
    let mut s = cell.parse();
    let (label, len) = read_label(&mut s, n)?;
    let key = prefix.checked_shl(len).unwrap_or_default() | label;
    let rest = n - len;

    if rest == 0 {
        out.push((key, s.load_int(64)?));
        return Ok(());
    }
    let left = s.load_ref()?;
    let right = s.load_ref()?;
    read_hashmap(left, rest - 1, key << 1usize, out)?;
    read_hashmap(right, rest - 1, (key << 1usize) | U256::from(1u8), out)
}

fn read_label(s: &mut CellSlice<'_>, max: usize) -> Result<(U256, usize), DecodeError> {
    let len_bits = (usize::BITS - max.leading_zeros()) as usize;
    let read_bits = |s: &mut CellSlice<'_>, len: usize| -> Result<U256, DecodeError> {
        let mut v = U256::ZERO;
        for _ in 0..len {
            v = (v << 1usize) | U256::from(s.load_bit()? as u8);
        }
        Ok(v)
    };

    let fits = |len: usize| -> Result<usize, DecodeError> {
        if len > max || len > 256 {
            return Err(DecodeError::Boc(format!("dictionary label of {len} bits exceeds {max}")));
        }
        Ok(len)
    };

    let len;
    let label = if !s.load_bit()? {
        // hml_short: unary length
        let mut n = 0;
        while s.load_bit()? {
            n = fits(n + 1)?;
        }
        len = n;
        read_bits(s, n)?
    } else if !s.load_bit()? {
        // hml_long
        len = fits(s.load_uint(len_bits)? as usize)?;
        read_bits(s, len)?
    } else {
        // hml_same
        let bit = s.load_bit()?;
        len = fits(s.load_uint(len_bits)? as usize)?;
        if bit && len > 0 {
            U256::MAX >> (256 - len)
        } else {
            U256::ZERO
        }
    };
    Ok((label, len))
}
