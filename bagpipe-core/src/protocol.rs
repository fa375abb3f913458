//! Storage daemon RPC schema: constructor ids, records and the request/response enums.
//!
//! Every request and every response is boxed: a 4-byte constructor id (CRC-32 of the
//! schema line) comes first. Records nested inside vectors are bare.

use crate::wire::{CodecError, TlReader, TlWriter};

/// Content hash identifying a bag.
pub type BagId = [u8; 32];

pub const ADD_BY_META: u32 = 0xb659165e;
pub const ADD_BY_HASH: u32 = 0xb535689e;
pub const GET_TORRENTS: u32 = 0x2335fb5a;
pub const REMOVE_TORRENT: u32 = 0x0a7a545b;
pub const SET_ACTIVE_UPLOAD: u32 = 0x3baeb69b;
pub const SET_ACTIVE_DOWNLOAD: u32 = 0x747a5d9d;
pub const GET_TORRENT_FULL: u32 = 0x5c9a4066;
pub const SET_FILE_PRIORITY_BY_NAME: u32 = 0xde2d22c9;
pub const CREATE_TORRENT: u32 = 0x9d99bc2b;
pub const GET_TORRENT_META: u32 = 0x735d2df1;
pub const GET_TORRENT_PEERS: u32 = 0x11b7d099;
pub const GET_SPEED_LIMITS: u32 = 0x9aae907f;
pub const SET_SPEED_LIMITS: u32 = 0x2ba1e7ea;

pub const TORRENT_LIST: u32 = 0x4f1c1842;
pub const TORRENT: u32 = 0x15b30b67;
pub const TORRENT_FULL: u32 = 0x5fa88c27;
pub const TORRENT_META: u32 = 0xd4be1ee8;
pub const PRIORITY_ACTION_ALL: u32 = 0xfe238940;
pub const PRIORITY_ACTION_IDX: u32 = 0x950fb728;
pub const PRIORITY_ACTION_NAME: u32 = 0x0124d1c0;
pub const FILE_INFO: u32 = 0x7177dbfe;
pub const PRIORITY_SET: u32 = 0xb6e89fd7;
pub const PRIORITY_PENDING: u32 = 0x840961a6;
pub const PEER: u32 = 0xbd345034;
pub const PEER_LIST: u32 = 0xa5de3815;
pub const SPEED_LIMITS: u32 = 0xfeb0e919;
pub const QUERY_ERROR: u32 = 0x04bdbac4;
pub const SUCCESS: u32 = 0xb3aeef1c;

/// Flag bits of `storage.daemon.torrent`.
pub const FLAG_INFO: u32 = 1;
pub const FLAG_HEADER: u32 = 1 << 1;
pub const FLAG_FATAL_ERROR: u32 = 1 << 2;

const BAG_RECORD_MIN_LEN: usize = 36;

/// Present once the bag info (descriptor) is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BagSummary {
    pub total_size: u64,
    pub description: String,
}

/// Present once the file manifest (header) has been fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderSummary {
    pub files_count: u64,
    pub included_size: u64,
    pub dir_name: String,
}

/// `storage.daemon.torrent`. Optional groups are selected by `flags` bits 0..2.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BagRecord {
    pub id: BagId,
    /// Raw flag word as received. Bits 0..2 are recomputed from the groups on encode.
    pub flags: u32,
    pub info: Option<BagSummary>,
    pub header: Option<HeaderSummary>,
    pub downloaded_size: u64,
    pub added_at: u32,
    pub root_dir: String,
    pub active_download: bool,
    pub active_upload: bool,
    pub completed: bool,
    pub download_speed: f64,
    pub upload_speed: f64,
    pub fatal_error: Option<String>,
}

impl BagRecord {
    /// Decode a bare record that must span the whole buffer.
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let mut r = TlReader::new(data);
        let record = Self::read(&mut r)?;
        r.finish()?;
        Ok(record)
    }

    /// Order-dependent manual parse: presence of later fields depends on the flag word.
    pub fn read(r: &mut TlReader<'_>) -> Result<Self, CodecError> {
        if r.remaining_len() < BAG_RECORD_MIN_LEN {
            return Err(CodecError::TooShort {
                what: "bag record",
                need: BAG_RECORD_MIN_LEN,
                got: r.remaining_len(),
            });
        }
        let id = r.read_int256("bag id")?;
        let flags = r.read_u32("bag flags")?;

        let info = if flags & FLAG_INFO != 0 {
            Some(BagSummary {
                total_size: r.read_u64("total size")?,
                description: r.read_string("description")?,
            })
        } else {
            None
        };
        let header = if flags & FLAG_HEADER != 0 {
            Some(HeaderSummary {
                files_count: r.read_u64("files count")?,
                included_size: r.read_u64("included size")?,
                dir_name: r.read_string("dir name")?,
            })
        } else {
            None
        };

        let downloaded_size = r.read_u64("downloaded size")?;
        let added_at = r.read_u32("added at")?;
        let root_dir = r.read_string("root dir")?;
        let active_download = r.read_bool("active download")?;
        let active_upload = r.read_bool("active upload")?;
        let completed = r.read_bool("completed")?;
        let download_speed = r.read_double("download speed")?;
        let upload_speed = r.read_double("upload speed")?;
        let fatal_error = if flags & FLAG_FATAL_ERROR != 0 {
            Some(r.read_string("fatal error")?)
        } else {
            None
        };

        Ok(Self {
            id,
            flags,
            info,
            header,
            downloaded_size,
            added_at,
            root_dir,
            active_download,
            active_upload,
            completed,
            download_speed,
            upload_speed,
            fatal_error,
        })
    }

    pub fn write(&self, w: &mut TlWriter) {
        let mut flags = self.flags & !(FLAG_INFO | FLAG_HEADER | FLAG_FATAL_ERROR);
        if self.info.is_some() {
            flags |= FLAG_INFO;
        }
        if self.header.is_some() {
            flags |= FLAG_HEADER;
        }
        if self.fatal_error.is_some() {
            flags |= FLAG_FATAL_ERROR;
        }

        w.write_int256(&self.id);
        w.write_u32(flags);
        if let Some(info) = &self.info {
            w.write_u64(info.total_size);
            w.write_string(&info.description);
        }
        if let Some(header) = &self.header {
            w.write_u64(header.files_count);
            w.write_u64(header.included_size);
            w.write_string(&header.dir_name);
        }
        w.write_u64(self.downloaded_size);
        w.write_u32(self.added_at);
        w.write_string(&self.root_dir);
        w.write_bool(self.active_download);
        w.write_bool(self.active_upload);
        w.write_bool(self.completed);
        w.write_double(self.download_speed);
        w.write_double(self.upload_speed);
        if let Some(err) = &self.fatal_error {
            w.write_string(err);
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut w = TlWriter::new();
        self.write(&mut w);
        w.finish()
    }

    /// True when the file manifest is known to the daemon.
    pub fn has_header(&self) -> bool {
        self.header.is_some()
    }
}

/// `storage.daemon.fileInfo`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileRecord {
    pub name: String,
    pub size: u64,
    pub flags: u32,
    /// 0 = not wanted, >0 = wanted.
    pub priority: i32,
    pub downloaded_size: u64,
}

impl FileRecord {
    fn read(r: &mut TlReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            name: r.read_string("file name")?,
            size: r.read_u64("file size")?,
            flags: r.read_u32("file flags")?,
            priority: r.read_i32("file priority")?,
            downloaded_size: r.read_u64("file downloaded size")?,
        })
    }

    fn write(&self, w: &mut TlWriter) {
        w.write_string(&self.name);
        w.write_u64(self.size);
        w.write_u32(self.flags);
        w.write_i32(self.priority);
        w.write_u64(self.downloaded_size);
    }
}

/// `storage.daemon.peer`
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PeerRecord {
    pub adnl_id: [u8; 32],
    pub address: String,
    pub download_speed: f64,
    pub upload_speed: f64,
    pub ready_parts: u64,
}

impl PeerRecord {
    fn read(r: &mut TlReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            adnl_id: r.read_int256("peer id")?,
            address: r.read_string("peer address")?,
            download_speed: r.read_double("peer download speed")?,
            upload_speed: r.read_double("peer upload speed")?,
            ready_parts: r.read_u64("peer ready parts")?,
        })
    }

    fn write(&self, w: &mut TlWriter) {
        w.write_int256(&self.adnl_id);
        w.write_string(&self.address);
        w.write_double(self.download_speed);
        w.write_double(self.upload_speed);
        w.write_u64(self.ready_parts);
    }
}

/// `storage.daemon.peerList`
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PeerList {
    pub peers: Vec<PeerRecord>,
    pub download_speed: f64,
    pub upload_speed: f64,
    pub total_parts: u64,
}

/// `storage.daemon.torrentFull`
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BagDetail {
    pub bag: BagRecord,
    pub files: Vec<FileRecord>,
}

impl BagDetail {
    fn read(r: &mut TlReader<'_>) -> Result<Self, CodecError> {
        let bag = BagRecord::read(r)?;
        let files = r.read_vector("files", FileRecord::read)?;
        Ok(Self { bag, files })
    }

    fn write(&self, w: &mut TlWriter) {
        self.bag.write(w);
        w.write_vector(&self.files, |w, f| f.write(w));
    }
}

/// `storage.daemon.speedLimits`, bytes per second; negative means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SpeedLimits {
    pub download: f64,
    pub upload: f64,
}

/// `storage.PriorityAction`, always boxed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PriorityAction {
    All(i32),
    Index { index: i64, priority: i32 },
    Name { name: String, priority: i32 },
}

impl PriorityAction {
    fn read(r: &mut TlReader<'_>) -> Result<Self, CodecError> {
        match r.read_u32("priority action")? {
            PRIORITY_ACTION_ALL => Ok(Self::All(r.read_i32("priority")?)),
            PRIORITY_ACTION_IDX => Ok(Self::Index {
                index: r.read_i64("file index")?,
                priority: r.read_i32("priority")?,
            }),
            PRIORITY_ACTION_NAME => Ok(Self::Name {
                name: r.read_string("file name")?,
                priority: r.read_i32("priority")?,
            }),
            other => Err(CodecError::UnknownConstructor(other)),
        }
    }

    fn write(&self, w: &mut TlWriter) {
        match self {
            Self::All(priority) => {
                w.write_u32(PRIORITY_ACTION_ALL);
                w.write_i32(*priority);
            }
            Self::Index { index, priority } => {
                w.write_u32(PRIORITY_ACTION_IDX);
                w.write_i64(*index);
                w.write_i32(*priority);
            }
            Self::Name { name, priority } => {
                w.write_u32(PRIORITY_ACTION_NAME);
                w.write_string(name);
                w.write_i32(*priority);
            }
        }
    }
}

/// Options shared by both add requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddOptions {
    pub root_dir: String,
    pub start_download: bool,
    pub allow_upload: bool,
    pub priorities: Vec<PriorityAction>,
}

impl AddOptions {
    /// Start right away, seed, and fetch only the header until files are chosen.
    pub fn header_only(root_dir: impl Into<String>) -> Self {
        Self {
            root_dir: root_dir.into(),
            start_download: true,
            allow_upload: true,
            priorities: vec![PriorityAction::All(0)],
        }
    }

    fn read(r: &mut TlReader<'_>) -> Result<Self, CodecError> {
        let root_dir = r.read_string("root dir")?;
        let start_download = r.read_bool("start download")?;
        let allow_upload = r.read_bool("allow upload")?;
        let priorities = r.read_vector("priorities", PriorityAction::read)?;
        r.read_u32("flags")?;
        Ok(Self {
            root_dir,
            start_download,
            allow_upload,
            priorities,
        })
    }

    fn write(&self, w: &mut TlWriter) {
        w.write_string(&self.root_dir);
        w.write_bool(self.start_download);
        w.write_bool(self.allow_upload);
        w.write_vector(&self.priorities, |w, p| p.write(w));
        w.write_u32(0);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    GetBags,
    AddByHash {
        id: BagId,
        options: AddOptions,
    },
    AddByMeta {
        meta: Vec<u8>,
        options: AddOptions,
    },
    CreateBag {
        path: String,
        description: String,
        allow_upload: bool,
        copy_inside: bool,
    },
    RemoveBag {
        id: BagId,
        remove_files: bool,
    },
    SetActiveDownload {
        id: BagId,
        active: bool,
    },
    SetActiveUpload {
        id: BagId,
        active: bool,
    },
    GetBagFull {
        id: BagId,
    },
    GetBagMeta {
        id: BagId,
    },
    GetPeers {
        id: BagId,
    },
    SetFilePriorityByName {
        id: BagId,
        name: String,
        priority: i32,
    },
    GetSpeedLimits,
    /// `None` leaves the corresponding flag bit clear.
    SetSpeedLimits {
        download: Option<f64>,
        upload: Option<f64>,
    },
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Self::GetBags => "getTorrents",
            Self::AddByHash { .. } => "addByHash",
            Self::AddByMeta { .. } => "addByMeta",
            Self::CreateBag { .. } => "createTorrent",
            Self::RemoveBag { .. } => "removeTorrent",
            Self::SetActiveDownload { .. } => "setActiveDownload",
            Self::SetActiveUpload { .. } => "setActiveUpload",
            Self::GetBagFull { .. } => "getTorrentFull",
            Self::GetBagMeta { .. } => "getTorrentMeta",
            Self::GetPeers { .. } => "getTorrentPeers",
            Self::SetFilePriorityByName { .. } => "setFilePriorityByName",
            Self::GetSpeedLimits => "getSpeedLimits",
            Self::SetSpeedLimits { .. } => "setSpeedLimits",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut w = TlWriter::new();
        match self {
            Self::GetBags => {
                w.write_u32(GET_TORRENTS);
                w.write_u32(0);
            }
            Self::AddByHash { id, options } => {
                w.write_u32(ADD_BY_HASH);
                w.write_int256(id);
                options.write(&mut w);
            }
            Self::AddByMeta { meta, options } => {
                w.write_u32(ADD_BY_META);
                w.write_bytes(meta);
                options.write(&mut w);
            }
            Self::CreateBag {
                path,
                description,
                allow_upload,
                copy_inside,
            } => {
                w.write_u32(CREATE_TORRENT);
                w.write_string(path);
                w.write_string(description);
                w.write_bool(*allow_upload);
                w.write_bool(*copy_inside);
                w.write_u32(0);
            }
            Self::RemoveBag { id, remove_files } => {
                w.write_u32(REMOVE_TORRENT);
                w.write_int256(id);
                w.write_bool(*remove_files);
            }
            Self::SetActiveDownload { id, active } => {
                w.write_u32(SET_ACTIVE_DOWNLOAD);
                w.write_int256(id);
                w.write_bool(*active);
            }
            Self::SetActiveUpload { id, active } => {
                w.write_u32(SET_ACTIVE_UPLOAD);
                w.write_int256(id);
                w.write_bool(*active);
            }
            Self::GetBagFull { id } => {
                w.write_u32(GET_TORRENT_FULL);
                w.write_int256(id);
                w.write_u32(0);
            }
            Self::GetBagMeta { id } => {
                w.write_u32(GET_TORRENT_META);
                w.write_int256(id);
                w.write_u32(0);
            }
            Self::GetPeers { id } => {
                w.write_u32(GET_TORRENT_PEERS);
                w.write_int256(id);
                w.write_u32(0);
            }
            Self::SetFilePriorityByName { id, name, priority } => {
                w.write_u32(SET_FILE_PRIORITY_BY_NAME);
                w.write_int256(id);
                w.write_string(name);
                w.write_i32(*priority);
            }
            Self::GetSpeedLimits => {
                w.write_u32(GET_SPEED_LIMITS);
                w.write_u32(0b11);
            }
            Self::SetSpeedLimits { download, upload } => {
                let flags = u32::from(download.is_some()) | u32::from(upload.is_some()) << 1;
                w.write_u32(SET_SPEED_LIMITS);
                w.write_u32(flags);
                if let Some(v) = download {
                    w.write_double(*v);
                }
                if let Some(v) = upload {
                    w.write_double(*v);
                }
            }
        }
        w.finish()
    }

    /// Daemon-side decode, used by in-process engines and test daemons.
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let mut r = TlReader::new(data);
        let request = match r.read_u32("request constructor")? {
            GET_TORRENTS => {
                r.read_u32("flags")?;
                Self::GetBags
            }
            ADD_BY_HASH => Self::AddByHash {
                id: r.read_int256("bag id")?,
                options: AddOptions::read(&mut r)?,
            },
            ADD_BY_META => Self::AddByMeta {
                meta: r.read_bytes("meta")?,
                options: AddOptions::read(&mut r)?,
            },
            CREATE_TORRENT => {
                let path = r.read_string("path")?;
                let description = r.read_string("description")?;
                let allow_upload = r.read_bool("allow upload")?;
                let copy_inside = r.read_bool("copy inside")?;
                r.read_u32("flags")?;
                Self::CreateBag {
                    path,
                    description,
                    allow_upload,
                    copy_inside,
                }
            }
            REMOVE_TORRENT => Self::RemoveBag {
                id: r.read_int256("bag id")?,
                remove_files: r.read_bool("remove files")?,
            },
            SET_ACTIVE_DOWNLOAD => Self::SetActiveDownload {
                id: r.read_int256("bag id")?,
                active: r.read_bool("active")?,
            },
            SET_ACTIVE_UPLOAD => Self::SetActiveUpload {
                id: r.read_int256("bag id")?,
                active: r.read_bool("active")?,
            },
            GET_TORRENT_FULL => {
                let id = r.read_int256("bag id")?;
                r.read_u32("flags")?;
                Self::GetBagFull { id }
            }
            GET_TORRENT_META => {
                let id = r.read_int256("bag id")?;
                r.read_u32("flags")?;
                Self::GetBagMeta { id }
            }
            GET_TORRENT_PEERS => {
                let id = r.read_int256("bag id")?;
                r.read_u32("flags")?;
                Self::GetPeers { id }
            }
            SET_FILE_PRIORITY_BY_NAME => Self::SetFilePriorityByName {
                id: r.read_int256("bag id")?,
                name: r.read_string("file name")?,
                priority: r.read_i32("priority")?,
            },
            GET_SPEED_LIMITS => {
                r.read_u32("flags")?;
                Self::GetSpeedLimits
            }
            SET_SPEED_LIMITS => {
                let flags = r.read_u32("flags")?;
                let download = if flags & 1 != 0 {
                    Some(r.read_double("download limit")?)
                } else {
                    None
                };
                let upload = if flags & 2 != 0 {
                    Some(r.read_double("upload limit")?)
                } else {
                    None
                };
                Self::SetSpeedLimits { download, upload }
            }
            other => return Err(CodecError::UnknownConstructor(other)),
        };
        r.finish()?;
        Ok(request)
    }
}

/// Every response variant the daemon may send back, dispatched on the leading id.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Success,
    BagList(Vec<BagRecord>),
    BagFull(BagDetail),
    /// Raw `storage.daemon.torrentMeta` payload; see [`crate::meta::BagMeta::parse`].
    BagMeta(Vec<u8>),
    PeerList(PeerList),
    SpeedLimits(SpeedLimits),
    PrioritySet,
    PriorityPending,
    /// `storage.daemon.queryError`
    Error(String),
}

impl Response {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::BagList(_) => "torrentList",
            Self::BagFull(_) => "torrentFull",
            Self::BagMeta(_) => "torrentMeta",
            Self::PeerList(_) => "peerList",
            Self::SpeedLimits(_) => "speedLimits",
            Self::PrioritySet => "prioritySet",
            Self::PriorityPending => "priorityPending",
            Self::Error(_) => "queryError",
        }
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let mut r = TlReader::new(data);
        let response = match r.read_u32("response constructor")? {
            SUCCESS => Self::Success,
            TORRENT_LIST => Self::BagList(r.read_vector("torrents", BagRecord::read)?),
            TORRENT_FULL => Self::BagFull(BagDetail::read(&mut r)?),
            TORRENT_META => Self::BagMeta(r.read_bytes("meta")?),
            PEER_LIST => Self::PeerList(PeerList {
                peers: r.read_vector("peers", PeerRecord::read)?,
                download_speed: r.read_double("download speed")?,
                upload_speed: r.read_double("upload speed")?,
                total_parts: r.read_u64("total parts")?,
            }),
            SPEED_LIMITS => Self::SpeedLimits(SpeedLimits {
                download: r.read_double("download limit")?,
                upload: r.read_double("upload limit")?,
            }),
            PRIORITY_SET => Self::PrioritySet,
            PRIORITY_PENDING => Self::PriorityPending,
            QUERY_ERROR => Self::Error(r.read_string("error message")?),
            other => return Err(CodecError::UnknownConstructor(other)),
        };
        r.finish()?;
        Ok(response)
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut w = TlWriter::new();
        match self {
            Self::Success => w.write_u32(SUCCESS),
            Self::BagList(bags) => {
                w.write_u32(TORRENT_LIST);
                w.write_vector(bags, |w, b| b.write(w));
            }
            Self::BagFull(detail) => {
                w.write_u32(TORRENT_FULL);
                detail.write(&mut w);
            }
            Self::BagMeta(meta) => {
                w.write_u32(TORRENT_META);
                w.write_bytes(meta);
            }
            Self::PeerList(list) => {
                w.write_u32(PEER_LIST);
                w.write_vector(&list.peers, |w, p| p.write(w));
                w.write_double(list.download_speed);
                w.write_double(list.upload_speed);
                w.write_u64(list.total_parts);
            }
            Self::SpeedLimits(limits) => {
                w.write_u32(SPEED_LIMITS);
                w.write_double(limits.download);
                w.write_double(limits.upload);
            }
            Self::PrioritySet => w.write_u32(PRIORITY_SET),
            Self::PriorityPending => w.write_u32(PRIORITY_PENDING),
            Self::Error(message) => {
                w.write_u32(QUERY_ERROR);
                w.write_string(message);
            }
        }
        w.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record(flags: u32) -> BagRecord {
        BagRecord {
            id: [0xab; 32],
            flags,
            info: (flags & FLAG_INFO != 0).then(|| BagSummary {
                total_size: 1_000_000,
                description: "holiday photos".into(),
            }),
            header: (flags & FLAG_HEADER != 0).then(|| HeaderSummary {
                files_count: 3,
                included_size: 999_000,
                dir_name: "photos".into(),
            }),
            downloaded_size: 250_000,
            added_at: 1_700_000_000,
            root_dir: "/data/bags".into(),
            active_download: true,
            active_upload: false,
            completed: false,
            download_speed: 1024.5,
            upload_speed: 0.0,
            fatal_error: (flags & FLAG_FATAL_ERROR != 0).then(|| "disk full".to_string()),
        }
    }

    #[test]
    fn bag_record_every_flag_combination() {
        for flags in 0..8u32 {
            let record = sample_record(flags);
            let decoded = BagRecord::decode(&record.encode().unwrap()).unwrap();
            assert_eq!(decoded, record, "flags {flags:03b}");
            assert_eq!(decoded.info.is_some(), flags & 1 != 0);
            assert_eq!(decoded.header.is_some(), flags & 2 != 0);
            assert_eq!(decoded.fatal_error.is_some(), flags & 4 != 0);
        }
    }

    #[test]
    fn bag_record_keeps_unknown_flag_bits() {
        let mut record = sample_record(FLAG_INFO);
        record.flags |= 1 << 7;
        let decoded = BagRecord::decode(&record.encode().unwrap()).unwrap();
        assert_eq!(decoded.flags, FLAG_INFO | 1 << 7);
    }

    #[test]
    fn bag_record_shorter_than_minimum() {
        let err = BagRecord::decode(&[0u8; 35]).unwrap_err();
        assert_eq!(
            err,
            CodecError::TooShort {
                what: "bag record",
                need: 36,
                got: 35
            }
        );
    }

    #[test]
    fn bag_record_truncated_group_is_an_error() {
        let bytes = sample_record(FLAG_INFO | FLAG_HEADER).encode().unwrap();
        assert!(BagRecord::decode(&bytes[..bytes.len() - 4]).is_err());
    }

    #[test]
    fn add_by_hash_layout() {
        let req = Request::AddByHash {
            id: [1; 32],
            options: AddOptions::header_only("/downloads"),
        };
        let bytes = req.encode().unwrap();
        assert_eq!(&bytes[..4], &ADD_BY_HASH.to_le_bytes());
        assert_eq!(&bytes[4..36], &[1u8; 32]);
        // root_dir "/downloads": 1 + 10 bytes padded to 12
        assert_eq!(bytes[36], 10);
        let tail = &bytes[48..];
        assert_eq!(&tail[..4], &crate::wire::BOOL_TRUE.to_le_bytes());
        assert_eq!(&tail[4..8], &crate::wire::BOOL_TRUE.to_le_bytes());
        assert_eq!(&tail[8..12], &1u32.to_le_bytes());
        assert_eq!(&tail[12..16], &PRIORITY_ACTION_ALL.to_le_bytes());
        assert_eq!(&tail[16..20], &0i32.to_le_bytes());
        assert_eq!(&tail[20..24], &0u32.to_le_bytes());
        assert_eq!(tail.len(), 24);
        assert_eq!(Request::decode(&bytes).unwrap(), req);
    }

    #[test]
    fn set_speed_limits_flags() {
        let both = Request::SetSpeedLimits {
            download: Some(-1.0),
            upload: Some(1024.0),
        }
        .encode()
        .unwrap();
        assert_eq!(&both[4..8], &0b11u32.to_le_bytes());
        assert_eq!(both.len(), 4 + 4 + 16);

        let upload_only = Request::SetSpeedLimits {
            download: None,
            upload: Some(5.0),
        };
        let bytes = upload_only.encode().unwrap();
        assert_eq!(&bytes[4..8], &0b10u32.to_le_bytes());
        assert_eq!(Request::decode(&bytes).unwrap(), upload_only);
    }

    #[test]
    fn response_dispatch() {
        let detail = BagDetail {
            bag: sample_record(FLAG_HEADER),
            files: vec![FileRecord {
                name: "a/b.txt".into(),
                size: 10,
                flags: 0,
                priority: 1,
                downloaded_size: 4,
            }],
        };
        let responses = [
            Response::Success,
            Response::BagList(vec![sample_record(0), sample_record(7)]),
            Response::BagFull(detail),
            Response::BagMeta(vec![9; 300]),
            Response::PeerList(PeerList {
                peers: vec![PeerRecord {
                    adnl_id: [5; 32],
                    address: "10.0.0.1:3333".into(),
                    download_speed: 1.0,
                    upload_speed: 2.0,
                    ready_parts: 17,
                }],
                download_speed: 1.0,
                upload_speed: 2.0,
                total_parts: 40,
            }),
            Response::SpeedLimits(SpeedLimits {
                download: -1.0,
                upload: 2048.0,
            }),
            Response::PrioritySet,
            Response::PriorityPending,
            Response::Error("duplicate hash".into()),
        ];
        for response in responses {
            assert_eq!(Response::decode(&response.encode().unwrap()).unwrap(), response);
        }
    }

    #[test]
    fn unknown_constructor_and_trailing_garbage() {
        assert_eq!(
            Response::decode(&0xdeadbeefu32.to_le_bytes()),
            Err(CodecError::UnknownConstructor(0xdeadbeef))
        );
        let mut bytes = Response::Success.encode().unwrap();
        bytes.extend_from_slice(&[0, 0, 0, 0]);
        assert_eq!(Response::decode(&bytes), Err(CodecError::TrailingBytes(4)));
    }
}
