//! Bag meta container: descriptor cell (`BagInfo`), optional root proof, optional file
//! manifest (`BagHeader`).
//!
//! ```text
//! torrent_file#6a7181e0 flags:(## 32) info_boc_size:uint32
//!   root_proof_boc_size:flags.0?uint32
//!   info_boc:(info_boc_size * [uint8])
//!   root_proof_boc:flags.0?(root_proof_boc_size * [uint8])
//!   header:flags.1?TorrentHeader
//! ```

use std::sync::Arc;

use crate::cell::{Cell, CellBuilder, CellError, CellSlice};
use crate::protocol::BagId;
use crate::wire::{CodecError, TlReader, TlWriter};

/// Boxed tag of the meta container; the daemon may send it with or without.
pub const META_TAG: u32 = 0x6a7181e0;
/// `torrent_header#9128aab7`, optional in front of the manifest.
pub const HEADER_TAG: u32 = 0x9128aab7;
/// `fec_info_none#c82a1964`
pub const FEC_INFO_NONE: u32 = 0xc82a1964;

const META_HAS_PROOF: u32 = 1;
const META_HAS_HEADER: u32 = 1 << 1;
const META_MIN_LEN: usize = 8;
const TEXT_CHUNK_MAX: usize = (crate::cell::MAX_DATA_BITS - 8) / 8;

/// Descriptor stored in the bag's root cell. Its representation hash is the bag id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BagInfo {
    pub piece_size: u32,
    pub file_size: u64,
    pub root_hash: [u8; 32],
    pub header_size: u64,
    pub header_hash: [u8; 32],
    pub microchunk_hash: Option<[u8; 32]>,
    pub description: String,
}

impl BagInfo {
    pub fn from_cell(cell: &Cell) -> Result<Self, CodecError> {
        let mut s = cell.begin_parse();
        let piece_size = s.load_uint(32, "piece size")? as u32;
        let file_size = s.load_uint(64, "file size")?;
        let root_hash = s.load_hash("root hash")?;
        let header_size = s.load_uint(64, "header size")?;
        let header_hash = s.load_hash("header hash")?;
        let microchunk_hash = if s.load_bit("microchunk flag")? {
            Some(s.load_hash("microchunk hash")?)
        } else {
            None
        };
        let description = load_text(s)?;
        if piece_size == 0 {
            return Err(CodecError::Invalid {
                what: "bag info",
                reason: "zero piece size".into(),
            });
        }
        Ok(Self {
            piece_size,
            file_size,
            root_hash,
            header_size,
            header_hash,
            microchunk_hash,
            description,
        })
    }

    pub fn to_cell(&self) -> Result<Arc<Cell>, CellError> {
        let mut b = CellBuilder::new();
        b.store_uint(u64::from(self.piece_size), 32)?
            .store_uint(self.file_size, 64)?
            .store_bytes(&self.root_hash)?
            .store_uint(self.header_size, 64)?
            .store_bytes(&self.header_hash)?;
        match &self.microchunk_hash {
            Some(hash) => {
                b.store_bit(true)?.store_bytes(hash)?;
            }
            None => {
                b.store_bit(false)?;
            }
        }
        store_text(&mut b, &self.description)?;
        b.build()
    }

    pub fn pieces_count(&self) -> u32 {
        crate::proof::pieces_count(self.file_size, self.piece_size)
    }
}

/// Chunked text: `chunks:(## 8)`, each chunk `len:(## 8) data`, the next chunk in a ref.
fn load_text(mut s: CellSlice<'_>) -> Result<String, CodecError> {
    let chunks = s.load_uint(8, "text chunks")?;
    let mut bytes = Vec::new();
    for i in 0..chunks {
        let len = s.load_uint(8, "text chunk length")? as usize;
        bytes.extend(s.load_bytes(len, "text chunk")?);
        if i + 1 < chunks {
            s = s.load_ref()?.begin_parse();
        }
    }
    String::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8("description"))
}

fn store_text(b: &mut CellBuilder, text: &str) -> Result<(), CellError> {
    let bytes = text.as_bytes();
    if bytes.is_empty() {
        b.store_uint(0, 8)?;
        return Ok(());
    }
    let first_len = (b.bits_left().saturating_sub(16) / 8).min(bytes.len());
    let (first, rest) = bytes.split_at(first_len);
    let tail: Vec<&[u8]> = rest.chunks(TEXT_CHUNK_MAX).collect();
    let chunks = 1 + tail.len();
    if chunks > 255 {
        return Err(CellError::DataOverflow(bytes.len() * 8));
    }

    let mut next: Option<Arc<Cell>> = None;
    for chunk in tail.iter().rev() {
        let mut cb = CellBuilder::new();
        cb.store_uint(chunk.len() as u64, 8)?.store_bytes(chunk)?;
        if let Some(n) = next.take() {
            cb.store_ref(n)?;
        }
        next = Some(cb.build()?);
    }
    b.store_uint(chunks as u64, 8)?
        .store_uint(first.len() as u64, 8)?
        .store_bytes(first)?;
    if let Some(n) = next {
        b.store_ref(n)?;
    }
    Ok(())
}

/// One file listed in the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderFile {
    pub name: String,
    /// Offset inside the concatenated bag data.
    pub offset: u64,
    pub size: u64,
}

/// File manifest. Indices hold cumulative end offsets into `names` and into the data.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BagHeader {
    pub files_count: u32,
    pub total_name_size: u64,
    pub total_data_size: u64,
    pub dir_name: String,
    pub data_index: Vec<u64>,
    pub name_index: Vec<u64>,
    pub names: Vec<u8>,
}

impl BagHeader {
    pub fn new(dir_name: impl Into<String>, files: &[(&str, u64)]) -> Self {
        let mut header = Self {
            dir_name: dir_name.into(),
            ..Self::default()
        };
        for (name, size) in files {
            header.names.extend_from_slice(name.as_bytes());
            header.total_data_size += size;
            header.name_index.push(header.names.len() as u64);
            header.data_index.push(header.total_data_size);
        }
        header.files_count = files.len() as u32;
        header.total_name_size = header.names.len() as u64;
        header
    }

    pub fn read(r: &mut TlReader<'_>) -> Result<Self, CodecError> {
        let mut files_count = r.read_u32("files count")?;
        if files_count == HEADER_TAG {
            files_count = r.read_u32("files count")?;
        }
        let total_name_size = r.read_u64("total name size")?;
        let total_data_size = r.read_u64("total data size")?;
        let fec = r.read_u32("fec info")?;
        if fec != FEC_INFO_NONE {
            return Err(CodecError::Invalid {
                what: "fec info",
                reason: format!("unsupported constructor 0x{fec:08x}"),
            });
        }
        let dir_name_size = r.read_u32("dir name size")? as usize;
        let dir_name = String::from_utf8(r.read_raw(dir_name_size, "dir name")?.to_vec())
            .map_err(|_| CodecError::InvalidUtf8("dir name"))?;

        let count = files_count as usize;
        if r.remaining_len() / 16 < count {
            return Err(CodecError::UnexpectedEof("file indices"));
        }
        let data_index = (0..count)
            .map(|_| r.read_u64("data index"))
            .collect::<Result<Vec<_>, _>>()?;
        let name_index = (0..count)
            .map(|_| r.read_u64("name index"))
            .collect::<Result<Vec<_>, _>>()?;
        let names_len = usize::try_from(total_name_size).map_err(|_| CodecError::InvalidLength)?;
        let names = r.read_raw(names_len, "names")?.to_vec();

        Ok(Self {
            files_count,
            total_name_size,
            total_data_size,
            dir_name,
            data_index,
            name_index,
            names,
        })
    }

    /// Bare form (no leading tag).
    pub fn write(&self, w: &mut TlWriter) {
        w.write_u32(self.files_count);
        w.write_u64(self.total_name_size);
        w.write_u64(self.total_data_size);
        w.write_u32(FEC_INFO_NONE);
        w.write_u32(self.dir_name.len() as u32);
        w.write_raw(self.dir_name.as_bytes());
        for v in &self.data_index {
            w.write_u64(*v);
        }
        for v in &self.name_index {
            w.write_u64(*v);
        }
        w.write_raw(&self.names);
    }

    /// Resolve the index tables into named files.
    pub fn files(&self) -> Result<Vec<HeaderFile>, CodecError> {
        let invalid = |reason: &str| CodecError::Invalid {
            what: "bag header",
            reason: reason.to_string(),
        };
        let mut out = Vec::with_capacity(self.name_index.len());
        let (mut name_start, mut data_start) = (0u64, 0u64);
        for (&name_end, &data_end) in self.name_index.iter().zip(&self.data_index) {
            if name_end < name_start || name_end > self.names.len() as u64 {
                return Err(invalid("name index out of order"));
            }
            if data_end < data_start || data_end > self.total_data_size {
                return Err(invalid("data index out of order"));
            }
            let raw = &self.names[name_start as usize..name_end as usize];
            let name = String::from_utf8(raw.to_vec())
                .map_err(|_| CodecError::InvalidUtf8("file name"))?;
            out.push(HeaderFile {
                name,
                offset: data_start,
                size: data_end - data_start,
            });
            name_start = name_end;
            data_start = data_end;
        }
        Ok(out)
    }
}

/// Exported bag meta. `id` is the representation hash of the descriptor cell.
#[derive(Debug, Clone)]
pub struct BagMeta {
    pub id: BagId,
    pub info: BagInfo,
    info_cell: Arc<Cell>,
    /// Attached as received; not verified.
    pub root_proof: Option<Arc<Cell>>,
    pub header: Option<BagHeader>,
}

impl BagMeta {
    pub fn new(info: BagInfo, header: Option<BagHeader>) -> Result<Self, CellError> {
        let info_cell = info.to_cell()?;
        Ok(Self {
            id: info_cell.hash(),
            info,
            info_cell,
            root_proof: None,
            header,
        })
    }

    /// Parse boxed or bare meta. Any short read is a hard failure.
    pub fn parse(data: &[u8]) -> Result<Self, CodecError> {
        let data = match data {
            [a, b, c, d, rest @ ..] if [*a, *b, *c, *d] == META_TAG.to_le_bytes() => rest,
            _ => data,
        };
        if data.len() < META_MIN_LEN {
            return Err(CodecError::TooShort {
                what: "bag meta",
                need: META_MIN_LEN,
                got: data.len(),
            });
        }

        let mut r = TlReader::new(data);
        let flags = r.read_u32("meta flags")?;
        let info_size = r.read_u32("info size")? as usize;
        let proof_size = if flags & META_HAS_PROOF != 0 {
            Some(r.read_u32("root proof size")? as usize)
        } else {
            None
        };

        let info_cell = Cell::from_boc(r.read_raw(info_size, "info boc")?)?;
        let info = BagInfo::from_cell(&info_cell)?;
        let root_proof = match proof_size {
            Some(size) => Some(Cell::from_boc(r.read_raw(size, "root proof boc")?)?),
            None => None,
        };
        let header = if flags & META_HAS_HEADER != 0 {
            Some(BagHeader::read(&mut r)?)
        } else {
            None
        };

        Ok(Self {
            id: info_cell.hash(),
            info,
            info_cell,
            root_proof,
            header,
        })
    }

    pub fn info_cell(&self) -> &Arc<Cell> {
        &self.info_cell
    }

    /// Boxed form, as written to `.meta` files.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let info = self.info_cell.to_boc();
        let proof = self.root_proof.as_ref().map(|p| p.to_boc());
        let mut flags = 0;
        if proof.is_some() {
            flags |= META_HAS_PROOF;
        }
        if self.header.is_some() {
            flags |= META_HAS_HEADER;
        }

        let mut w = TlWriter::new();
        w.write_u32(META_TAG);
        w.write_u32(flags);
        w.write_u32(info.len() as u32);
        if let Some(proof) = &proof {
            w.write_u32(proof.len() as u32);
        }
        w.write_raw(&info);
        if let Some(proof) = &proof {
            w.write_raw(proof);
        }
        if let Some(header) = &self.header {
            header.write(&mut w);
        }
        w.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_info(description: &str) -> BagInfo {
        BagInfo {
            piece_size: 128 * 1024,
            file_size: 3_000_000,
            root_hash: [3; 32],
            header_size: 120,
            header_hash: [4; 32],
            microchunk_hash: None,
            description: description.into(),
        }
    }

    #[test]
    fn meta_roundtrip_boxed_and_bare() {
        let header = BagHeader::new("photos", &[("a.jpg", 1_000_000), ("b/c.jpg", 2_000_000)]);
        let meta = BagMeta::new(sample_info("summer"), Some(header.clone())).unwrap();
        let boxed = meta.to_bytes().unwrap();
        assert_eq!(&boxed[..4], &META_TAG.to_le_bytes());

        let parsed = BagMeta::parse(&boxed).unwrap();
        assert_eq!(parsed.id, meta.id);
        assert_eq!(parsed.info, meta.info);
        assert_eq!(parsed.header.as_ref(), Some(&header));
        assert!(parsed.root_proof.is_none());

        let bare = BagMeta::parse(&boxed[4..]).unwrap();
        assert_eq!(bare.id, meta.id);
    }

    #[test]
    fn meta_with_root_proof_and_no_header() {
        let mut meta = BagMeta::new(sample_info(""), None).unwrap();
        let leaf = CellBuilder::new().build().unwrap();
        meta.root_proof = Some(Cell::merkle_proof(leaf).unwrap());
        let parsed = BagMeta::parse(&meta.to_bytes().unwrap()).unwrap();
        assert!(parsed.header.is_none());
        assert_eq!(
            parsed.root_proof.map(|p| p.hash()),
            meta.root_proof.map(|p| p.hash())
        );
    }

    #[test]
    fn short_meta_is_rejected() {
        assert!(matches!(
            BagMeta::parse(&[1, 2, 3]),
            Err(CodecError::TooShort { need: 8, .. })
        ));
        let bytes = BagMeta::new(sample_info("x"), None).unwrap().to_bytes().unwrap();
        assert!(BagMeta::parse(&bytes[..bytes.len() - 2]).is_err());
    }

    #[test]
    fn long_description_spans_cells() {
        let text = "d".repeat(600);
        let cell = sample_info(&text).to_cell().unwrap();
        assert!(!cell.refs().is_empty());
        assert_eq!(BagInfo::from_cell(&cell).unwrap().description, text);
    }

    #[test]
    fn microchunk_hash_is_optional() {
        let mut info = sample_info("m");
        info.microchunk_hash = Some([8; 32]);
        let cell = info.to_cell().unwrap();
        assert_eq!(BagInfo::from_cell(&cell).unwrap(), info);
        assert_ne!(cell.hash(), sample_info("m").to_cell().unwrap().hash());
    }

    #[test]
    fn header_files_resolve_offsets() {
        let header = BagHeader::new("", &[("x", 5), ("dir/y", 0), ("z", 7)]);
        let files = header.files().unwrap();
        assert_eq!(files.len(), 3);
        assert_eq!(files[1].name, "dir/y");
        assert_eq!((files[2].offset, files[2].size), (5, 7));
    }

    #[test]
    fn header_with_leading_tag_and_bad_fec() {
        let header = BagHeader::new("d", &[("f", 1)]);
        let mut w = TlWriter::new();
        w.write_u32(HEADER_TAG);
        header.write(&mut w);
        let bytes = w.finish().unwrap();
        assert_eq!(BagHeader::read(&mut TlReader::new(&bytes)).unwrap(), header);

        let mut broken = bytes.clone();
        // fec constructor follows tag, count and the two sizes
        broken[24..28].copy_from_slice(&0u32.to_le_bytes());
        assert!(matches!(
            BagHeader::read(&mut TlReader::new(&broken)),
            Err(CodecError::Invalid { what: "fec info", .. })
        ));
    }
}
