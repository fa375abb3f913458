//! Cells and bag-of-cells (BOC) serialization.
//!
//! A cell holds up to 1023 data bits and up to four references. Bag descriptors and
//! provider storage proofs are shipped as BOC blobs. Only the exotic kinds the storage
//! protocol produces are understood: pruned branches and Merkle proofs.

use std::collections::HashMap;
use std::sync::Arc;

use sha2::{Digest, Sha256};

pub const MAX_DATA_BITS: usize = 1023;
pub const MAX_REFS: usize = 4;
pub const MAX_DEPTH: u16 = 1024;

const BOC_MAGIC: [u8; 4] = [0xb5, 0xee, 0x9c, 0x72];
const MAX_LEVEL: u8 = 3;
const PRUNED_BRANCH_TYPE: u8 = 1;
const MERKLE_PROOF_TYPE: u8 = 3;
const MERKLE_PROOF_BITS: usize = 8 + 256 + 16;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CellError {
    #[error("cell data overflow: {0} bits")]
    DataOverflow(usize),
    #[error("too many references: {0}")]
    TooManyRefs(usize),
    #[error("not enough data in cell reading {0}")]
    SliceUnderflow(&'static str),
    #[error("no references left in cell")]
    NoRefs,
    #[error("unsupported exotic cell type {0}")]
    UnsupportedExotic(u8),
    #[error("malformed exotic cell: {0}")]
    BadExotic(&'static str),
    #[error("bag of cells: {0}")]
    Boc(&'static str),
    #[error("cell tree too deep")]
    DepthLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellKind {
    Ordinary,
    PrunedBranch,
    MerkleProof,
}

/// Which of the three levels above zero carry a distinct hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LevelMask(u8);

impl LevelMask {
    pub fn new(mask: u8) -> Self {
        Self(mask & 0b111)
    }

    pub fn mask(self) -> u8 {
        self.0
    }

    pub fn level(self) -> u8 {
        8 - self.0.leading_zeros() as u8
    }

    pub fn hash_index(self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn apply(self, level: u8) -> Self {
        Self(self.0 & ((1u8 << level) - 1))
    }

    pub fn is_significant(self, level: u8) -> bool {
        level == 0 || (self.0 >> (level - 1)) & 1 != 0
    }
}

#[derive(Debug)]
pub struct Cell {
    kind: CellKind,
    data: Vec<u8>,
    bit_len: usize,
    refs: Vec<Arc<Cell>>,
    level_mask: LevelMask,
    hashes: Vec<[u8; 32]>,
    depths: Vec<u16>,
}

impl Cell {
    /// Build a cell and compute its hashes. For exotic cells the first data byte is the type.
    pub fn new(
        exotic: bool,
        mut data: Vec<u8>,
        bit_len: usize,
        refs: Vec<Arc<Cell>>,
    ) -> Result<Arc<Cell>, CellError> {
        if bit_len > MAX_DATA_BITS {
            return Err(CellError::DataOverflow(bit_len));
        }
        if refs.len() > MAX_REFS {
            return Err(CellError::TooManyRefs(refs.len()));
        }
        let byte_len = (bit_len + 7) / 8;
        if data.len() < byte_len {
            return Err(CellError::SliceUnderflow("cell data"));
        }
        data.truncate(byte_len);
        if bit_len % 8 != 0 {
            if let Some(last) = data.last_mut() {
                *last &= 0xffu8 << (8 - bit_len % 8);
            }
        }

        let (kind, level_mask) = if !exotic {
            let mask = refs.iter().fold(0u8, |m, r| m | r.level_mask.mask());
            (CellKind::Ordinary, LevelMask::new(mask))
        } else {
            if bit_len < 8 {
                return Err(CellError::BadExotic("missing type byte"));
            }
            match data[0] {
                PRUNED_BRANCH_TYPE => {
                    if !refs.is_empty() {
                        return Err(CellError::BadExotic("pruned branch with references"));
                    }
                    if bit_len < 16 {
                        return Err(CellError::BadExotic("pruned branch without level mask"));
                    }
                    let mask = LevelMask::new(data[1]);
                    if mask.mask() == 0 || mask.mask() != data[1] {
                        return Err(CellError::BadExotic("pruned branch level mask"));
                    }
                    if bit_len != 16 + mask.hash_index() * (256 + 16) {
                        return Err(CellError::BadExotic("pruned branch size"));
                    }
                    (CellKind::PrunedBranch, mask)
                }
                MERKLE_PROOF_TYPE => {
                    if bit_len != MERKLE_PROOF_BITS || refs.len() != 1 {
                        return Err(CellError::BadExotic("merkle proof layout"));
                    }
                    (
                        CellKind::MerkleProof,
                        LevelMask::new(refs[0].level_mask.mask() >> 1),
                    )
                }
                other => return Err(CellError::UnsupportedExotic(other)),
            }
        };

        let mut cell = Cell {
            kind,
            data,
            bit_len,
            refs,
            level_mask,
            hashes: Vec::new(),
            depths: Vec::new(),
        };
        cell.compute_hashes()?;
        Ok(Arc::new(cell))
    }

    /// A pruned branch standing in for `of`: keeps its hash and depth, drops its content.
    pub fn pruned(of: &Cell) -> Result<Arc<Cell>, CellError> {
        if of.level_mask.level() != 0 {
            return Err(CellError::BadExotic("cannot prune a cell that has pruned children"));
        }
        let mut data = Vec::with_capacity(2 + 32 + 2);
        data.push(PRUNED_BRANCH_TYPE);
        data.push(1);
        data.extend_from_slice(&of.hash());
        data.extend_from_slice(&of.depth().to_be_bytes());
        Cell::new(true, data, 16 + 256 + 16, Vec::new())
    }

    /// Wrap a (partially pruned) tree in a Merkle proof cell.
    pub fn merkle_proof(inner: Arc<Cell>) -> Result<Arc<Cell>, CellError> {
        let mut data = Vec::with_capacity(1 + 32 + 2);
        data.push(MERKLE_PROOF_TYPE);
        data.extend_from_slice(&inner.hash_at(0));
        data.extend_from_slice(&inner.depth_at(0).to_be_bytes());
        Cell::new(true, data, MERKLE_PROOF_BITS, vec![inner])
    }

    fn compute_hashes(&mut self) -> Result<(), CellError> {
        let total = self.level_mask.hash_index() + 1;
        let own = if self.kind == CellKind::PrunedBranch { 1 } else { total };
        let offset = total - own;
        let child_shift = u8::from(self.kind == CellKind::MerkleProof);

        let mut hash_index = 0usize;
        for level in 0..=self.level_mask.level() {
            if !self.level_mask.is_significant(level) {
                continue;
            }
            if hash_index < offset {
                hash_index += 1;
                continue;
            }
            let mut hasher = Sha256::new();
            hasher.update(self.descriptors(self.level_mask.apply(level)));
            if hash_index == offset {
                hasher.update(self.padded_data());
            } else {
                hasher.update(self.hashes[hash_index - offset - 1]);
            }

            let child_level = (level + child_shift).min(MAX_LEVEL);
            let mut depth = 0u16;
            for child in &self.refs {
                let d = child.depth_at(child_level);
                hasher.update(d.to_be_bytes());
                depth = depth.max(d);
            }
            if !self.refs.is_empty() {
                depth += 1;
                if depth > MAX_DEPTH {
                    return Err(CellError::DepthLimit);
                }
            }
            for child in &self.refs {
                hasher.update(child.hash_at(child_level));
            }
            self.hashes.push(hasher.finalize().into());
            self.depths.push(depth);
            hash_index += 1;
        }
        Ok(())
    }

    fn descriptors(&self, mask: LevelMask) -> [u8; 2] {
        let exotic = u8::from(self.kind != CellKind::Ordinary);
        let d1 = self.refs.len() as u8 + 8 * exotic + 32 * mask.mask();
        let d2 = (self.bit_len / 8 + (self.bit_len + 7) / 8) as u8;
        [d1, d2]
    }

    /// Data bytes with the completion tag set when the bit length is not byte aligned.
    fn padded_data(&self) -> Vec<u8> {
        let mut out = self.data.clone();
        if self.bit_len % 8 != 0 {
            if let Some(last) = out.last_mut() {
                *last |= 1 << (7 - self.bit_len % 8);
            }
        }
        out
    }

    pub fn kind(&self) -> CellKind {
        self.kind
    }

    pub fn is_exotic(&self) -> bool {
        self.kind != CellKind::Ordinary
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

    pub fn level_mask(&self) -> LevelMask {
        self.level_mask
    }

    /// Representation hash (level 0).
    pub fn hash(&self) -> [u8; 32] {
        self.hash_at(0)
    }

    pub fn depth(&self) -> u16 {
        self.depth_at(0)
    }

    pub fn hash_at(&self, level: u8) -> [u8; 32] {
        let idx = self.level_mask.apply(level.min(MAX_LEVEL)).hash_index();
        if self.kind == CellKind::PrunedBranch {
            if idx != self.level_mask.hash_index() {
                let start = 2 + idx * 32;
                let mut out = [0u8; 32];
                out.copy_from_slice(&self.data[start..start + 32]);
                return out;
            }
            return self.hashes[0];
        }
        self.hashes[idx]
    }

    pub fn depth_at(&self, level: u8) -> u16 {
        let idx = self.level_mask.apply(level.min(MAX_LEVEL)).hash_index();
        if self.kind == CellKind::PrunedBranch {
            let stored = self.level_mask.hash_index();
            if idx != stored {
                let start = 2 + stored * 32 + idx * 2;
                return u16::from_be_bytes([self.data[start], self.data[start + 1]]);
            }
            return self.depths[0];
        }
        self.depths[idx]
    }

    pub fn begin_parse(&self) -> CellSlice<'_> {
        CellSlice {
            cell: self,
            bit_pos: 0,
            ref_pos: 0,
        }
    }

    /// Parse a BOC and return its first root.
    pub fn from_boc(bytes: &[u8]) -> Result<Arc<Cell>, CellError> {
        let mut roots = parse_boc(bytes)?;
        Ok(roots.swap_remove(0))
    }

    /// Single-root BOC without index or checksum.
    pub fn to_boc(self: &Arc<Self>) -> Vec<u8> {
        serialize_boc(self)
    }
}

/// Sequential reader over a cell's bits and references.
#[derive(Debug, Clone)]
pub struct CellSlice<'a> {
    cell: &'a Cell,
    bit_pos: usize,
    ref_pos: usize,
}

impl<'a> CellSlice<'a> {
    pub fn bits_left(&self) -> usize {
        self.cell.bit_len - self.bit_pos
    }

    pub fn refs_left(&self) -> usize {
        self.cell.refs.len() - self.ref_pos
    }

    pub fn load_bit(&mut self, what: &'static str) -> Result<bool, CellError> {
        if self.bits_left() == 0 {
            return Err(CellError::SliceUnderflow(what));
        }
        let pos = self.bit_pos;
        self.bit_pos += 1;
        Ok(self.cell.data[pos / 8] & (0x80 >> (pos % 8)) != 0)
    }

    /// Big-endian unsigned integer of up to 64 bits.
    pub fn load_uint(&mut self, bits: usize, what: &'static str) -> Result<u64, CellError> {
        if bits > 64 {
            return Err(CellError::DataOverflow(bits));
        }
        if self.bits_left() < bits {
            return Err(CellError::SliceUnderflow(what));
        }
        let mut value = 0u64;
        for _ in 0..bits {
            value = (value << 1) | u64::from(self.load_bit(what)?);
        }
        Ok(value)
    }

    pub fn load_bytes(&mut self, len: usize, what: &'static str) -> Result<Vec<u8>, CellError> {
        if self.bits_left() < len * 8 {
            return Err(CellError::SliceUnderflow(what));
        }
        (0..len)
            .map(|_| self.load_uint(8, what).map(|b| b as u8))
            .collect()
    }

    pub fn load_hash(&mut self, what: &'static str) -> Result<[u8; 32], CellError> {
        let bytes = self.load_bytes(32, what)?;
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(out)
    }

    pub fn load_ref(&mut self) -> Result<&'a Arc<Cell>, CellError> {
        let r = self.cell.refs.get(self.ref_pos).ok_or(CellError::NoRefs)?;
        self.ref_pos += 1;
        Ok(r)
    }
}

/// Accumulates bits and references for a new ordinary cell.
#[derive(Debug, Default)]
pub struct CellBuilder {
    data: Vec<u8>,
    bit_len: usize,
    refs: Vec<Arc<Cell>>,
}

impl CellBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bits_left(&self) -> usize {
        MAX_DATA_BITS - self.bit_len
    }

    pub fn store_bit(&mut self, bit: bool) -> Result<&mut Self, CellError> {
        if self.bit_len == MAX_DATA_BITS {
            return Err(CellError::DataOverflow(self.bit_len + 1));
        }
        if self.bit_len % 8 == 0 {
            self.data.push(0);
        }
        if bit {
            self.data[self.bit_len / 8] |= 0x80 >> (self.bit_len % 8);
        }
        self.bit_len += 1;
        Ok(self)
    }

    pub fn store_uint(&mut self, value: u64, bits: usize) -> Result<&mut Self, CellError> {
        if bits > 64 || self.bits_left() < bits {
            return Err(CellError::DataOverflow(self.bit_len + bits));
        }
        for i in (0..bits).rev() {
            self.store_bit((value >> i) & 1 == 1)?;
        }
        Ok(self)
    }

    pub fn store_bytes(&mut self, bytes: &[u8]) -> Result<&mut Self, CellError> {
        if self.bits_left() < bytes.len() * 8 {
            return Err(CellError::DataOverflow(self.bit_len + bytes.len() * 8));
        }
        for b in bytes {
            self.store_uint(u64::from(*b), 8)?;
        }
        Ok(self)
    }

    pub fn store_ref(&mut self, cell: Arc<Cell>) -> Result<&mut Self, CellError> {
        if self.refs.len() == MAX_REFS {
            return Err(CellError::TooManyRefs(MAX_REFS + 1));
        }
        self.refs.push(cell);
        Ok(self)
    }

    pub fn build(self) -> Result<Arc<Cell>, CellError> {
        Cell::new(false, self.data, self.bit_len, self.refs)
    }
}

struct BocReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BocReader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], CellError> {
        if self.data.len() - self.pos < len {
            return Err(CellError::Boc("unexpected end of data"));
        }
        let out = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn byte(&mut self) -> Result<u8, CellError> {
        Ok(self.take(1)?[0])
    }

    fn uint(&mut self, len: usize) -> Result<usize, CellError> {
        Ok(self
            .take(len)?
            .iter()
            .fold(0usize, |acc, b| (acc << 8) | *b as usize))
    }
}

struct RawCell {
    exotic: bool,
    data: Vec<u8>,
    bit_len: usize,
    refs: Vec<usize>,
}

fn parse_boc(bytes: &[u8]) -> Result<Vec<Arc<Cell>>, CellError> {
    let mut r = BocReader { data: bytes, pos: 0 };
    if r.take(4)? != BOC_MAGIC {
        return Err(CellError::Boc("invalid magic"));
    }
    let flags = r.byte()?;
    let has_index = flags & 0x80 != 0;
    let has_crc = flags & 0x40 != 0;
    let size_bytes = (flags & 0x07) as usize;
    if size_bytes == 0 || size_bytes > 4 {
        return Err(CellError::Boc("invalid reference size"));
    }
    let offset_bytes = r.byte()? as usize;
    if offset_bytes == 0 || offset_bytes > 8 {
        return Err(CellError::Boc("invalid offset size"));
    }

    let cells_num = r.uint(size_bytes)?;
    let roots_num = r.uint(size_bytes)?;
    let absent_num = r.uint(size_bytes)?;
    let total_size = r.uint(offset_bytes)?;
    if roots_num == 0 || roots_num > cells_num {
        return Err(CellError::Boc("invalid roots count"));
    }
    if absent_num != 0 {
        return Err(CellError::Boc("absent cells are not supported"));
    }
    let remaining = bytes.len() - r.pos;
    if roots_num.saturating_mul(size_bytes) > remaining || total_size > remaining {
        return Err(CellError::Boc("counts exceed data size"));
    }
    // every cell takes at least its two descriptor bytes
    if cells_num > total_size / 2 {
        return Err(CellError::Boc("too many cells for data size"));
    }

    let mut root_indices = Vec::with_capacity(roots_num);
    for _ in 0..roots_num {
        let idx = r.uint(size_bytes)?;
        if idx >= cells_num {
            return Err(CellError::Boc("invalid root index"));
        }
        root_indices.push(idx);
    }
    if has_index {
        r.take(cells_num.saturating_mul(offset_bytes))?;
    }
    let cell_data = r.take(total_size)?;
    if has_crc {
        r.take(4)?;
    }

    let mut cr = BocReader {
        data: cell_data,
        pos: 0,
    };
    let mut raw = Vec::with_capacity(cells_num.min(cell_data.len() / 2));
    for i in 0..cells_num {
        let d1 = cr.byte()?;
        let d2 = cr.byte()?;
        let refs_num = (d1 & 0x07) as usize;
        if refs_num > MAX_REFS {
            return Err(CellError::Boc("invalid references count"));
        }
        let exotic = d1 & 0x08 != 0;
        if d1 & 0x10 != 0 {
            let stored = LevelMask::new(d1 >> 5).hash_index() + 1;
            cr.take(stored * (32 + 2))?;
        }
        let data_len = (d2 as usize + 1) / 2;
        let mut data = cr.take(data_len)?.to_vec();
        let bit_len = if d2 % 2 == 0 {
            data_len * 8
        } else {
            let last = data.last_mut().ok_or(CellError::Boc("empty unaligned data"))?;
            if *last == 0 {
                return Err(CellError::Boc("missing completion tag"));
            }
            let trailing = last.trailing_zeros() as usize;
            *last &= !(1u8 << trailing);
            data_len * 8 - trailing - 1
        };
        let mut refs = Vec::with_capacity(refs_num);
        for _ in 0..refs_num {
            let idx = cr.uint(size_bytes)?;
            if idx <= i || idx >= cells_num {
                return Err(CellError::Boc("invalid reference index"));
            }
            refs.push(idx);
        }
        raw.push(RawCell {
            exotic,
            data,
            bit_len,
            refs,
        });
    }

    let mut built: Vec<Option<Arc<Cell>>> = vec![None; raw.len()];
    for (i, rc) in raw.into_iter().enumerate().rev() {
        let refs = rc
            .refs
            .iter()
            .map(|&idx| built[idx].clone().ok_or(CellError::Boc("unresolved reference")))
            .collect::<Result<Vec<_>, _>>()?;
        built[i] = Some(Cell::new(rc.exotic, rc.data, rc.bit_len, refs)?);
    }

    root_indices
        .into_iter()
        .map(|idx| built[idx].clone().ok_or(CellError::Boc("unresolved root")))
        .collect()
}

fn bytes_needed(value: usize) -> usize {
    let bits = (usize::BITS - value.leading_zeros()) as usize;
    ((bits + 7) / 8).max(1)
}

fn write_uint(out: &mut Vec<u8>, value: usize, len: usize) {
    let be = (value as u64).to_be_bytes();
    out.extend_from_slice(&be[8 - len..]);
}

fn serialize_boc(root: &Arc<Cell>) -> Vec<u8> {
    fn visit(cell: &Arc<Cell>, seen: &mut HashMap<[u8; 32], ()>, order: &mut Vec<Arc<Cell>>) {
        let key = cell.hash_at(MAX_LEVEL);
        if seen.contains_key(&key) {
            return;
        }
        seen.insert(key, ());
        for child in &cell.refs {
            visit(child, seen, order);
        }
        order.push(Arc::clone(cell));
    }

    let mut order = Vec::new();
    visit(root, &mut HashMap::new(), &mut order);
    order.reverse();
    let index: HashMap<[u8; 32], usize> = order
        .iter()
        .enumerate()
        .map(|(i, c)| (c.hash_at(MAX_LEVEL), i))
        .collect();

    let size_bytes = bytes_needed(order.len());
    let mut cells = Vec::new();
    for cell in &order {
        cells.extend_from_slice(&cell.descriptors(cell.level_mask));
        cells.extend_from_slice(&cell.padded_data());
        for child in &cell.refs {
            let idx = index.get(&child.hash_at(MAX_LEVEL)).copied().unwrap_or_default();
            write_uint(&mut cells, idx, size_bytes);
        }
    }
    let offset_bytes = bytes_needed(cells.len());

    let mut out = Vec::with_capacity(16 + cells.len());
    out.extend_from_slice(&BOC_MAGIC);
    out.push(size_bytes as u8);
    out.push(offset_bytes as u8);
    write_uint(&mut out, order.len(), size_bytes);
    write_uint(&mut out, 1, size_bytes);
    write_uint(&mut out, 0, size_bytes);
    write_uint(&mut out, cells.len(), offset_bytes);
    write_uint(&mut out, 0, size_bytes);
    out.extend_from_slice(&cells);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY_CELL_HASH: &str =
        "96a296d224f285c67bee93c30f8a309157f0daa35dc5b87e410b78630a09cfc7";

    fn leaf(tag: u8) -> Arc<Cell> {
        let mut b = CellBuilder::new();
        b.store_bytes(&[tag; 32]).unwrap();
        b.build().unwrap()
    }

    #[test]
    fn empty_cell_hash() {
        let cell = CellBuilder::new().build().unwrap();
        assert_eq!(hex::encode(cell.hash()), EMPTY_CELL_HASH);
        assert_eq!(cell.depth(), 0);
    }

    #[test]
    fn parses_boc_with_crc_flag() {
        let boc = hex::decode("b5ee9c724101010100020000004cacb9cd").unwrap();
        let cell = Cell::from_boc(&boc).unwrap();
        assert_eq!(cell.bit_len(), 0);
        assert_eq!(hex::encode(cell.hash()), EMPTY_CELL_HASH);
    }

    #[test]
    fn boc_roundtrip_keeps_hash_and_unaligned_bits() {
        let mut b = CellBuilder::new();
        b.store_uint(0b101, 3).unwrap();
        b.store_ref(leaf(1)).unwrap();
        b.store_ref(leaf(2)).unwrap();
        let root = b.build().unwrap();

        let parsed = Cell::from_boc(&root.to_boc()).unwrap();
        assert_eq!(parsed.hash(), root.hash());
        assert_eq!(parsed.bit_len(), 3);
        assert_eq!(parsed.refs().len(), 2);
        assert_eq!(parsed.depth(), 1);
        let mut s = parsed.begin_parse();
        assert_eq!(s.load_uint(3, "tag").unwrap(), 0b101);
        assert!(s.load_bit("past end").is_err());
    }

    #[test]
    fn shared_subtrees_are_stored_once() {
        let shared = leaf(9);
        let mut b = CellBuilder::new();
        b.store_ref(Arc::clone(&shared)).unwrap();
        b.store_ref(shared).unwrap();
        let root = b.build().unwrap();
        let boc = root.to_boc();
        // two cells: header is 4 magic + 2 flags + 4 counts/sizes + 1 root
        assert_eq!(boc[6], 2);
        assert_eq!(Cell::from_boc(&boc).unwrap().hash(), root.hash());
    }

    #[test]
    fn pruned_branch_keeps_original_hash() {
        let original = leaf(7);
        let pruned = Cell::pruned(&original).unwrap();
        assert_eq!(pruned.kind(), CellKind::PrunedBranch);
        assert_eq!(pruned.level_mask().level(), 1);
        assert_eq!(pruned.hash_at(0), original.hash());

        let mut full = CellBuilder::new();
        full.store_ref(Arc::clone(&original)).unwrap();
        let full = full.build().unwrap();
        let mut partial = CellBuilder::new();
        partial.store_ref(pruned).unwrap();
        let partial = partial.build().unwrap();
        assert_eq!(partial.hash_at(0), full.hash());
        assert_ne!(partial.hash_at(1), full.hash());
    }

    #[test]
    fn merkle_proof_survives_boc() {
        let mut b = CellBuilder::new();
        b.store_ref(Cell::pruned(&leaf(1)).unwrap()).unwrap();
        b.store_ref(leaf(2)).unwrap();
        let body = b.build().unwrap();
        let proof = Cell::merkle_proof(Arc::clone(&body)).unwrap();
        assert_eq!(proof.level_mask().mask(), 0);

        let parsed = Cell::from_boc(&proof.to_boc()).unwrap();
        assert_eq!(parsed.kind(), CellKind::MerkleProof);
        assert_eq!(parsed.hash(), proof.hash());
        let mut s = parsed.begin_parse();
        s.load_uint(8, "type").unwrap();
        assert_eq!(s.load_hash("hash").unwrap(), body.hash_at(0));
    }

    #[test]
    fn rejects_bad_magic_and_truncation() {
        assert_eq!(
            Cell::from_boc(&[0, 1, 2, 3]).unwrap_err(),
            CellError::Boc("invalid magic")
        );
        let boc = leaf(3).to_boc();
        assert!(Cell::from_boc(&boc[..boc.len() - 1]).is_err());
    }

    #[test]
    fn rejects_counts_larger_than_input() {
        let huge_roots = hex::decode("b5ee9c720401ffffffffffffffff0000000000").unwrap();
        assert!(Cell::from_boc(&huge_roots).is_err());
        // one root, but a billion cells in two bytes of data
        let huge_cells = hex::decode("b5ee9c7204013b9aca00000000010000000002000000000000").unwrap();
        assert_eq!(
            Cell::from_boc(&huge_cells).unwrap_err(),
            CellError::Boc("too many cells for data size")
        );
    }

    #[test]
    fn builder_overflow() {
        let mut b = CellBuilder::new();
        b.store_bytes(&[0u8; 127]).unwrap();
        b.store_uint(0, 7).unwrap();
        assert!(b.store_bit(true).is_err());
    }
}
