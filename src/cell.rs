// src/cell.rs
use alloy::primitives::U256;
use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// Bag-of-cells magic for the generic (indexed/checksummed) layout
const BOC_MAGIC: u32 = 0xb5ee_9c72;
const MAX_REFS: usize = 4;
const MAX_BITS: usize = 1023;
const CRC32C_POLY: u32 = 0x82f6_3b78;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("truncated input: wanted {wanted} bits, {remaining} remaining")]
    Truncated { wanted: usize, remaining: usize },
    #[error("missing cell reference #{index}")]
    MissingRef { index: usize },
    #[error("{bits} trailing bits and {refs} trailing refs left undecoded")]
    TrailingData { bits: usize, refs: usize },
    #[error("unexpected discriminator: expected {expected:#x}, found {found:#x}")]
    UnexpectedOpcode { expected: u32, found: u32 },
    #[error("outcome {outcome:#x} does not belong to request family {request:#x}")]
    UnexpectedOutcome { request: u32, outcome: u32 },
    #[error("unknown opcode {0:#x}")]
    UnknownOpcode(u32),
    #[error("message has no {0}")]
    MissingMessage(&'static str),
    #[error("{0} does not fit in 64 bits")]
    Overflow(&'static str),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("malformed bag of cells: {0}")]
    Boc(String),
    #[error("bag of cells checksum mismatch")]
    Checksum,
    #[error("invalid hex: {0}")]
    Hex(String),
    #[error("unexpected get-method stack: {0}")]
    Stack(String),
}

impl From<hex::FromHexError> for DecodeError {
    fn from(err: hex::FromHexError) -> Self {
        Self::Hex(err.to_string())
    }
}

/// A bounded bit-string with up to four references to child cells.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    data: Vec<u8>,
    bit_len: usize,
    refs: Vec<Arc<Cell>>,
}

impl Cell {
    pub fn new(mut data: Vec<u8>, bit_len: usize, refs: Vec<Arc<Cell>>) -> Result<Self, DecodeError> {
        if bit_len > MAX_BITS || bit_len > data.len() * 8 {
            return Err(DecodeError::Boc(format!("cell cannot hold {bit_len} bits")));
        }
        if refs.len() > MAX_REFS {
            return Err(DecodeError::Boc(format!("cell cannot hold {} refs", refs.len())));
        }
        data.truncate(bit_len.div_ceil(8));
        if bit_len % 8 != 0 {
            if let Some(last) = data.last_mut() {
                *last &= 0xffu8 << (8 - bit_len % 8);
            }
        }
        Ok(Self { data, bit_len, refs })
    }

    pub fn bit_len(&self) -> usize {
        self.bit_len
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn refs(&self) -> &[Arc<Cell>] {
        &self.refs
    }

    pub fn parse(&self) -> CellSlice<'_> {
        CellSlice {
            cell: self,
            bit_pos: 0,
            ref_pos: 0,
        }
    }

    fn bit(&self, index: usize) -> bool {
        (self.data[index / 8] >> (7 - index % 8)) & 1 == 1
    }

    pub fn from_boc_hex(raw: &str) -> Result<Cell, DecodeError> {
        let bytes = hex::decode(raw.trim().trim_start_matches("0x"))?;
        Self::from_boc(&bytes)
    }

    /// Deserialize a single-root bag of cells.
    pub fn from_boc(bytes: &[u8]) -> Result<Cell, DecodeError> {
        let mut r = ByteReader::new(bytes);

        let magic = r.uint(4)? as u32;
        if magic != BOC_MAGIC {
            return Err(DecodeError::Boc(format!("bad magic {magic:#010x}")));
        }

        let flags = r.uint(1)?;
        let has_idx = flags & 0x80 != 0;
        let has_crc = flags & 0x40 != 0;
        let size = flags & 0x07;
        if !(1..=4).contains(&size) {
            return Err(DecodeError::Boc(format!("invalid ref size {size}")));
        }
        let off_bytes = r.uint(1)?;
        if !(1..=8).contains(&off_bytes) {
            return Err(DecodeError::Boc(format!("invalid offset size {off_bytes}")));
        }

        let cell_count = r.uint(size)?;
        let root_count = r.uint(size)?;
        let _absent = r.uint(size)?;
        let total_size = r.uint(off_bytes)?;
        if root_count == 0 || root_count > cell_count {
            return Err(DecodeError::Boc(format!(
                "{root_count} roots for {cell_count} cells"
            )));
        }

        let root_index = r.uint(size)?;
        for _ in 1..root_count {
            r.uint(size)?;
        }
        if has_idx {
            let index_len = cell_count
                .checked_mul(off_bytes)
                .ok_or_else(|| DecodeError::Boc("index size overflow".into()))?;
            r.take(index_len)?;
        }

        let cell_data = r.take(total_size)?;
        if has_crc {
            let covered = r.pos;
            let stored = r.take(4)?;
            let expected = u32::from_le_bytes([stored[0], stored[1], stored[2], stored[3]]);
            if crc32c(&bytes[..covered]) != expected {
                return Err(DecodeError::Checksum);
            }
        }
        if r.remaining() != 0 {
            return Err(DecodeError::Boc(format!("{} trailing bytes", r.remaining())));
        }

        let raw_cells = read_raw_cells(cell_data, cell_count, size)?;

        let mut built: Vec<Option<Arc<Cell>>> = vec![None; cell_count];
        for (i, raw) in raw_cells.into_iter().enumerate().rev() {
            let refs = raw
                .refs
                .iter()
                .map(|&j| built[j].clone().ok_or(DecodeError::MissingRef { index: j }))
                .collect::<Result<Vec<_>, _>>()?;
            built[i] = Some(Arc::new(Cell::new(raw.data, raw.bit_len, refs)?));
        }

        let root = built
            .get(root_index)
            .cloned()
            .flatten()
            .ok_or(DecodeError::MissingRef { index: root_index })?;
        Ok((*root).clone())
    }
}

struct RawCell {
    data: Vec<u8>,
    bit_len: usize,
    refs: Vec<usize>,
}

fn read_raw_cells(data: &[u8], cell_count: usize, size: usize) -> Result<Vec<RawCell>, DecodeError> {
    let mut r = ByteReader::new(data);
    // every cell takes at least its two descriptor bytes
    let mut cells = Vec::with_capacity(cell_count.min(data.len() / 2));

    for i in 0..cell_count {
        let d1 = r.uint(1)?;
        let d2 = r.uint(1)?;
        let ref_count = d1 & 0x07;
        if ref_count > MAX_REFS {
            return Err(DecodeError::Boc(format!("cell #{i} claims {ref_count} refs")));
        }
        if d1 & 0x08 != 0 {
            return Err(DecodeError::Boc(format!("cell #{i} is exotic")));
        }

        let data_len = d2.div_ceil(2);
        let bytes = r.take(data_len)?.to_vec();
        let bit_len = if d2 % 2 == 0 {
            data_len * 8
        } else {
            match bytes.last() {
                Some(&last) if last != 0 => data_len * 8 - (last.trailing_zeros() as usize + 1),
                _ => return Err(DecodeError::Boc(format!("cell #{i} lacks completion tag"))),
            }
        };

        let mut refs = Vec::with_capacity(ref_count);
        for _ in 0..ref_count {
            let target = r.uint(size)?;
            if target <= i || target >= cell_count {
                return Err(DecodeError::Boc(format!(
                    "cell #{i} references #{target} out of order"
                )));
            }
            refs.push(target);
        }
        cells.push(RawCell { data: bytes, bit_len, refs });
    }

    if r.remaining() != 0 {
        return Err(DecodeError::Boc("cell data size mismatch".into()));
    }
    Ok(cells)
}

struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if n > self.remaining() {
            return Err(DecodeError::Truncated {
                wanted: n.saturating_mul(8),
                remaining: self.remaining() * 8,
            });
        }
        let out = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn uint(&mut self, n: usize) -> Result<usize, DecodeError> {
        let bytes = self.take(n)?;
        let value = bytes.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64);
        usize::try_from(value).map_err(|_| DecodeError::Boc(format!("size {value} too large")))
    }
}

pub fn crc32c(bytes: &[u8]) -> u32 {
    let mut crc = !0u32;
    for &b in bytes {
        crc ^= b as u32;
        for _ in 0..8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ CRC32C_POLY } else { crc >> 1 };
        }
    }
    !crc
}

/// Read cursor over one cell. Field order is fixed by the protocol; nothing is tagged.
#[derive(Debug, Clone)]
pub struct CellSlice<'a> {
    cell: &'a Cell,
    bit_pos: usize,
    ref_pos: usize,
}

impl<'a> CellSlice<'a> {
    pub fn remaining_bits(&self) -> usize {
        self.cell.bit_len - self.bit_pos
    }

    pub fn remaining_refs(&self) -> usize {
        self.cell.refs.len() - self.ref_pos
    }

    fn ensure(&self, bits: usize) -> Result<(), DecodeError> {
        if bits > self.remaining_bits() {
            return Err(DecodeError::Truncated {
                wanted: bits,
                remaining: self.remaining_bits(),
            });
        }
        Ok(())
    }

    pub fn load_bit(&mut self) -> Result<bool, DecodeError> {
        self.ensure(1)?;
        let bit = self.cell.bit(self.bit_pos);
        self.bit_pos += 1;
        Ok(bit)
    }

    pub fn load_uint(&mut self, bits: usize) -> Result<u64, DecodeError> {
        debug_assert!(bits <= 64);
        self.ensure(bits)?;
        let mut value = 0u64;
        for i in 0..bits {
            value = (value << 1) | self.cell.bit(self.bit_pos + i) as u64;
        }
        self.bit_pos += bits;
        Ok(value)
    }

    /// Two's-complement signed read.
    pub fn load_int(&mut self, bits: usize) -> Result<i64, DecodeError> {
        let raw = self.load_uint(bits)?;
        Ok(match bits {
            0 => 0,
            64 => raw as i64,
            _ if raw >> (bits - 1) & 1 == 1 => (raw | (!0u64 << bits)) as i64,
            _ => raw as i64,
        })
    }

    pub fn load_bytes(&mut self, n: usize) -> Result<Vec<u8>, DecodeError> {
        self.ensure(n * 8)?;
        (0..n).map(|_| self.load_uint(8).map(|b| b as u8)).collect()
    }

    pub fn load_u256(&mut self) -> Result<U256, DecodeError> {
        let bytes = self.load_bytes(32)?;
        let mut buf = [0u8; 32];
        buf.copy_from_slice(&bytes);
        Ok(U256::from_be_bytes(buf))
    }

    /// `VarUInteger 16`: a 4-bit byte length followed by that many bytes.
    pub fn load_coins(&mut self) -> Result<u128, DecodeError> {
        let len = self.load_uint(4)? as usize;
        let bytes = self.load_bytes(len)?;
        Ok(bytes.iter().fold(0u128, |acc, &b| (acc << 8) | b as u128))
    }

    pub fn load_address(&mut self) -> Result<TonAddress, DecodeError> {
        match self.load_uint(2)? {
            0b10 => {
                if self.load_bit()? {
                    return Err(DecodeError::InvalidAddress("anycast is not supported".into()));
                }
                let workchain = self.load_int(8)? as i8;
                let bytes = self.load_bytes(32)?;
                let mut hash = [0u8; 32];
                hash.copy_from_slice(&bytes);
                Ok(TonAddress { workchain, hash })
            }
            0b00 => Err(DecodeError::InvalidAddress("address is empty".into())),
            tag => Err(DecodeError::InvalidAddress(format!("unsupported tag {tag:#04b}"))),
        }
    }

    pub fn load_ref(&mut self) -> Result<&'a Cell, DecodeError> {
        let cell = self
            .cell
            .refs
            .get(self.ref_pos)
            .ok_or(DecodeError::MissingRef { index: self.ref_pos })?;
        self.ref_pos += 1;
        Ok(cell.as_ref())
    }

    pub fn load_maybe_ref(&mut self) -> Result<Option<&'a Cell>, DecodeError> {
        if self.load_bit()? {
            self.load_ref().map(Some)
        } else {
            Ok(None)
        }
    }

    pub fn end_parse(&self) -> Result<(), DecodeError> {
        if self.remaining_bits() != 0 || self.remaining_refs() != 0 {
            return Err(DecodeError::TrailingData {
                bits: self.remaining_bits(),
                refs: self.remaining_refs(),
            });
        }
        Ok(())
    }
}

/// Standard internal address in raw form, `workchain:hex`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TonAddress {
    pub workchain: i8,
    pub hash: [u8; 32],
}

impl fmt::Display for TonAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.workchain, hex::encode(self.hash))
    }
}

impl FromStr for TonAddress {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (wc, hash_hex) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| DecodeError::InvalidAddress(format!("`{s}` is not in raw form")))?;
        let workchain = wc
            .parse::<i8>()
            .map_err(|e| DecodeError::InvalidAddress(format!("workchain `{wc}`: {e}")))?;
        let bytes = hex::decode(hash_hex)?;
        let hash: [u8; 32] = bytes
            .try_into()
            .map_err(|_| DecodeError::InvalidAddress(format!("`{s}` hash is not 32 bytes")))?;
        Ok(Self { workchain, hash })
    }
}

impl Serialize for TonAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{addr, to_boc, CellBuilder};

    #[test]
    fn reads_fixed_width_fields_in_order() {
        let cell = CellBuilder::new()
            .store_uint(0x11a, 32)
            .store_int(-5, 64)
            .store_int(-1, 2)
            .store_coins(1_000_000_000)
            .store_address(&addr(7))
            .build();

        let mut s = cell.parse();
        assert_eq!(s.load_uint(32).unwrap(), 0x11a);
        assert_eq!(s.load_int(64).unwrap(), -5);
        assert_eq!(s.load_int(2).unwrap(), -1);
        assert_eq!(s.load_coins().unwrap(), 1_000_000_000);
        assert_eq!(s.load_address().unwrap(), addr(7));
        s.end_parse().unwrap();
    }

    #[test]
    fn overreading_is_a_truncation_error() {
        let cell = CellBuilder::new().store_uint(1, 8).build();
        let mut s = cell.parse();
        assert_eq!(
            s.load_uint(16),
            Err(DecodeError::Truncated { wanted: 16, remaining: 8 })
        );
        assert_eq!(s.load_ref(), Err(DecodeError::MissingRef { index: 0 }));
    }

    #[test]
    fn end_parse_reports_leftovers() {
        let child = CellBuilder::new().build();
        let cell = CellBuilder::new().store_uint(3, 3).store_ref(child).build();
        let mut s = cell.parse();
        s.load_uint(1).unwrap();
        assert_eq!(s.end_parse(), Err(DecodeError::TrailingData { bits: 2, refs: 1 }));
    }

    #[test]
    fn boc_round_trips_a_tree() {
        let leaf = CellBuilder::new().store_u256(U256::from(42u64)).build();
        let mid = CellBuilder::new().store_uint(5, 5).store_ref(leaf).build();
        let root = CellBuilder::new()
            .store_uint(0xdead, 16)
            .store_ref(mid)
            .store_ref(CellBuilder::new().build())
            .build();

        let parsed = Cell::from_boc(&to_boc(&root)).unwrap();
        assert_eq!(parsed, root);

        let mut s = parsed.parse();
        assert_eq!(s.load_uint(16).unwrap(), 0xdead);
        let mut m = s.load_ref().unwrap().parse();
        assert_eq!(m.load_uint(5).unwrap(), 5);
        assert_eq!(m.load_ref().unwrap().parse().load_u256().unwrap(), U256::from(42u64));
    }

    #[test]
    fn any_one_byte_truncation_is_rejected() {
        let root = CellBuilder::new()
            .store_uint(0x311, 32)
            .store_ref(CellBuilder::new().store_uint(9, 64).build())
            .build();
        let boc = to_boc(&root);
        for cut in 1..=boc.len() {
            assert!(Cell::from_boc(&boc[..boc.len() - cut]).is_err(), "cut {cut}");
        }
    }

    #[test]
    fn corrupted_payload_fails_checksum() {
        let root = CellBuilder::new().store_uint(0xabcdef, 24).build();
        let mut boc = to_boc(&root);
        let last_data = boc.len() - 5;
        boc[last_data] ^= 0x01;
        assert_eq!(Cell::from_boc(&boc), Err(DecodeError::Checksum));
    }

    #[test]
    fn crc32c_matches_reference_vector() {
        assert_eq!(crc32c(b"123456789"), 0xe306_9283);
    }

    #[test]
    fn raw_addresses_parse_and_print() {
        let raw = format!("-1:{}", "ab".repeat(32));
        let parsed: TonAddress = raw.parse().unwrap();
        assert_eq!(parsed.workchain, -1);
        assert_eq!(parsed.to_string(), raw);
        assert!("0:abcd".parse::<TonAddress>().is_err());
        assert!("nonsense".parse::<TonAddress>().is_err());
    }
}
