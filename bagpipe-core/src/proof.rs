//! Storage proofs: inclusion of one piece in the bag's binary piece tree.
//!
//! The piece tree has depth `ceil(log2(pieces))`. Inner nodes carry two references
//! (left = bit 0, right = bit 1 of the piece index, most significant first); leaves are
//! 256-bit piece hashes. A provider answers with a Merkle proof cell whose body is that
//! tree with every branch off the requested path pruned.

use std::sync::Arc;

use crate::cell::{Cell, CellBuilder, CellError, CellKind};

const LEAF_BITS: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProofError {
    #[error("piece is out of range {piece}/{pieces}")]
    OutOfRange { piece: u32, pieces: u32 },
    #[error("proof root is not a merkle proof cell")]
    NotMerkleProof,
    #[error("proof is for another root hash")]
    RootMismatch,
    #[error("proof body does not match its stored hash")]
    BodyMismatch,
    #[error("branch is missing at depth {0}")]
    MissingBranch(u32),
    #[error("incorrect branch")]
    BadLeaf,
    #[error("malformed proof: {0}")]
    Malformed(#[from] CellError),
}

/// Depth of a tree holding `pieces` leaves.
pub fn tree_depth(pieces: u32) -> u32 {
    if pieces <= 1 {
        0
    } else {
        u32::BITS - (pieces - 1).leading_zeros()
    }
}

/// Piece that holds byte `byte` of the concatenated bag data.
pub fn piece_for_byte(byte: u64, piece_size: u32) -> u32 {
    match byte.checked_div(u64::from(piece_size)) {
        Some(piece) => u32::try_from(piece).unwrap_or(u32::MAX),
        None => 0,
    }
}

/// Number of pieces, counting a trailing partial piece.
pub fn pieces_count(file_size: u64, piece_size: u32) -> u32 {
    if piece_size == 0 {
        return 0;
    }
    u32::try_from(file_size.div_ceil(u64::from(piece_size))).unwrap_or(u32::MAX)
}

/// Check the Merkle proof wrapper against the expected root and return its body.
pub fn unwrap_proof(proof: &Arc<Cell>, root_hash: &[u8; 32]) -> Result<Arc<Cell>, ProofError> {
    if proof.kind() != CellKind::MerkleProof {
        return Err(ProofError::NotMerkleProof);
    }
    let mut s = proof.begin_parse();
    s.load_uint(8, "proof type")?;
    let stored = s.load_hash("proof hash")?;
    if &stored != root_hash {
        return Err(ProofError::RootMismatch);
    }
    let body = s.load_ref()?;
    if body.hash_at(0) != stored {
        return Err(ProofError::BodyMismatch);
    }
    Ok(Arc::clone(body))
}

/// Walk from the body root to leaf `piece` and check the leaf shape.
pub fn check_proof_branch(body: &Cell, piece: u32, pieces: u32) -> Result<(), ProofError> {
    if piece >= pieces {
        return Err(ProofError::OutOfRange { piece, pieces });
    }
    let depth = tree_depth(pieces);
    let mut node = body;
    for i in (0..depth).rev() {
        let side = ((piece >> i) & 1) as usize;
        node = node
            .refs()
            .get(side)
            .map(|child| child.as_ref())
            .ok_or(ProofError::MissingBranch(depth - i))?;
    }
    if node.kind() != CellKind::Ordinary || node.bit_len() != LEAF_BITS || !node.refs().is_empty()
    {
        return Err(ProofError::BadLeaf);
    }
    Ok(())
}

/// Full verification of a provider's proof BOC. Every failure means "untrusted".
pub fn verify_inclusion_proof(
    proof_boc: &[u8],
    root_hash: &[u8; 32],
    piece: u32,
    pieces: u32,
) -> Result<(), ProofError> {
    let proof = Cell::from_boc(proof_boc)?;
    let body = unwrap_proof(&proof, root_hash)?;
    check_proof_branch(&body, piece, pieces)
}

/// Piece tree over known leaf hashes. Padded with zero leaves up to a power of two.
#[derive(Debug, Clone)]
pub struct PieceTree {
    root: Arc<Cell>,
    pieces: u32,
}

impl PieceTree {
    pub fn build(piece_hashes: &[[u8; 32]]) -> Result<Self, CellError> {
        let leaves = piece_hashes
            .iter()
            .map(|h| {
                let mut b = CellBuilder::new();
                b.store_bytes(h)?;
                b.build()
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_leaves(leaves)
    }

    fn from_leaves(mut level: Vec<Arc<Cell>>) -> Result<Self, CellError> {
        let pieces = level.len() as u32;
        let width = 1usize << tree_depth(pieces);
        if level.len() < width {
            let mut b = CellBuilder::new();
            b.store_bytes(&[0u8; 32])?;
            let zero = b.build()?;
            level.resize(width, zero);
        }
        while level.len() > 1 {
            level = level
                .chunks(2)
                .map(|pair| {
                    let mut b = CellBuilder::new();
                    for child in pair {
                        b.store_ref(Arc::clone(child))?;
                    }
                    b.build()
                })
                .collect::<Result<Vec<_>, _>>()?;
        }
        let root = level.pop().ok_or(CellError::NoRefs)?;
        Ok(Self { root, pieces })
    }

    pub fn root_hash(&self) -> [u8; 32] {
        self.root.hash()
    }

    pub fn pieces(&self) -> u32 {
        self.pieces
    }

    /// Merkle proof for one piece, siblings along the path pruned.
    pub fn prove(&self, piece: u32) -> Result<Arc<Cell>, ProofError> {
        if piece >= self.pieces {
            return Err(ProofError::OutOfRange {
                piece,
                pieces: self.pieces,
            });
        }
        let body = prune_path(&self.root, piece, tree_depth(self.pieces))?;
        Ok(Cell::merkle_proof(body)?)
    }
}

fn prune_path(node: &Arc<Cell>, piece: u32, level: u32) -> Result<Arc<Cell>, CellError> {
    if level == 0 {
        return Ok(Arc::clone(node));
    }
    let side = ((piece >> (level - 1)) & 1) as usize;
    let mut b = CellBuilder::new();
    for (i, child) in node.refs().iter().enumerate() {
        let kept = if i == side {
            prune_path(child, piece, level - 1)?
        } else {
            Cell::pruned(child)?
        };
        b.store_ref(kept)?;
    }
    b.build()
}
