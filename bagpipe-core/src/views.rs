//! Display-ready views derived from daemon records.

use serde::Serialize;

use crate::client::format_bag_id;
use crate::protocol::{BagDetail, FileRecord, PeerList};

const KB: u64 = 1024;
const MB: u64 = KB * 1024;
const GB: u64 = MB * 1024;

/// Human size: "N Bytes", then KB/MB/GB with two decimals.
pub fn to_size(bytes: u64) -> String {
    scaled(bytes, "")
}

/// Same as [`to_size`] with "/s"; blank for zero when `hide_zero` is set.
pub fn to_speed(bytes_per_sec: u64, hide_zero: bool) -> String {
    if bytes_per_sec == 0 && hide_zero {
        return String::new();
    }
    scaled(bytes_per_sec, "/s")
}

fn scaled(n: u64, suffix: &str) -> String {
    let f = n as f64;
    match n {
        n if n < KB => format!("{n} Bytes{suffix}"),
        n if n < MB => format!("{:.2} KB{suffix}", f / KB as f64),
        n if n < GB => format!("{:.2} MB{suffix}", f / MB as f64),
        _ => format!("{:.2} GB{suffix}", f / GB as f64),
    }
}

/// Remaining time at the current speed: "Xh Ym ", "Ym Zs ", "Zs " or "∞".
pub fn time_left(left_bytes: u64, speed: u64) -> String {
    if speed == 0 {
        return "∞".to_string();
    }
    let secs = left_bytes / speed;
    let minutes = secs / 60;
    let hours = minutes / 60;
    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{hours}h "));
    }
    if minutes > 0 {
        out.push_str(&format!("{}m ", minutes % 60));
    }
    if hours == 0 {
        out.push_str(&format!("{}s ", secs % 60));
    }
    out
}

/// Percent with one decimal, truncated.
fn progress(done: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (done as f64 / total as f64 * 1000.0).trunc() / 10.0
}

fn speed_bytes(speed: f64) -> u64 {
    // negative and NaN saturate to 0
    speed as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BagState {
    Downloading,
    Seeding,
    Inactive,
}

impl std::fmt::Display for BagState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Downloading => "downloading",
            Self::Seeding => "seeding",
            Self::Inactive => "inactive",
        })
    }
}

/// Raw figures behind the formatted strings of a [`BagView`].
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BagFigures {
    pub size: u64,
    pub downloaded: u64,
    pub download_speed: u64,
    pub upload_speed: u64,
}

/// One row of the bag list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BagView {
    pub id: String,
    pub name: String,
    pub size: String,
    pub downloaded: String,
    pub progress: f64,
    pub state: BagState,
    pub download: String,
    pub upload: String,
    pub path: String,
    pub peers: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ratio: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip)]
    pub figures: BagFigures,
}

impl BagView {
    /// `None` while no wanted file is known yet (header not fetched or nothing selected).
    pub fn from_detail(detail: &BagDetail, hide_zero_speed: bool) -> Option<Self> {
        let bag = &detail.bag;
        let (size, downloaded) = detail
            .files
            .iter()
            .filter(|f| f.priority > 0)
            .fold((0u64, 0u64), |(s, d), f| (s + f.size, d + f.downloaded_size));
        if size == 0 {
            return None;
        }

        let dir_name = bag.header.as_ref().map(|h| h.dir_name.as_str());
        let name = match bag.info.as_ref().map(|i| i.description.as_str()) {
            Some(desc) if !desc.is_empty() => desc.to_string(),
            _ => match dir_name {
                Some(dir) if !dir.is_empty() && dir != "/" => dir.to_string(),
                _ => hex::encode(bag.id),
            },
        };

        let download_speed = speed_bytes(bag.download_speed);
        let upload_speed = speed_bytes(bag.upload_speed);
        let download = if bag.active_download && !bag.completed {
            to_speed(download_speed, hide_zero_speed)
        } else {
            String::new()
        };
        let upload = if bag.active_upload {
            to_speed(upload_speed, hide_zero_speed)
        } else {
            String::new()
        };

        let state = if bag.active_download && !bag.completed {
            BagState::Downloading
        } else if bag.active_upload && bag.completed {
            BagState::Seeding
        } else {
            BagState::Inactive
        };

        let path = match dir_name {
            Some(dir) => format!("{}/{}", bag.root_dir, dir),
            None => bag.root_dir.clone(),
        };

        Some(Self {
            id: format_bag_id(&bag.id),
            name,
            size: to_size(size),
            downloaded: to_size(downloaded),
            progress: progress(downloaded, size),
            state,
            download,
            upload,
            path,
            peers: 0,
            ratio: None,
            error: bag.fatal_error.clone(),
            figures: BagFigures {
                size,
                downloaded,
                download_speed,
                upload_speed,
            },
        })
    }
}

/// Info panel of a single bag.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BagInfoView {
    pub description: String,
    pub size: String,
    pub downloaded: String,
    pub time_left: String,
    pub progress: f64,
    pub state: BagState,
    pub upload: String,
    pub download: String,
    pub path: String,
    pub peers: usize,
    pub added_at: String,
}

impl BagInfoView {
    pub fn from_detail(detail: &BagDetail, peers: &PeerList) -> Option<Self> {
        let view = BagView::from_detail(detail, false)?;
        let f = view.figures;
        let added_at = chrono::DateTime::from_timestamp(i64::from(detail.bag.added_at), 0)
            .map(|t| t.format("%d %b %Y %H:%M:%S").to_string())
            .unwrap_or_default();
        Some(Self {
            description: view.name,
            size: view.size,
            downloaded: view.downloaded,
            time_left: time_left(f.size.saturating_sub(f.downloaded), f.download_speed),
            progress: view.progress,
            state: view.state,
            upload: view.upload,
            download: view.download,
            path: view.path,
            peers: peers.peers.len(),
            added_at,
        })
    }
}

/// Directory tree node; directories aggregate the size of everything below them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileNode {
    pub name: String,
    pub path: String,
    pub size: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<FileNode>,
    #[serde(skip)]
    pub bytes: u64,
}

impl FileNode {
    fn new(name: &str, path: String, bytes: u64) -> Self {
        Self {
            name: name.to_string(),
            path,
            size: String::new(),
            children: Vec::new(),
            bytes,
        }
    }

    fn fill_sizes(&mut self) {
        self.size = to_size(self.bytes);
        for child in &mut self.children {
            child.fill_sizes();
        }
    }
}

pub fn file_tree(files: &[FileRecord]) -> Vec<FileNode> {
    let mut sorted: Vec<&FileRecord> = files.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));

    let mut root = FileNode::new("", String::new(), 0);
    for file in sorted {
        let parts: Vec<&str> = file.name.split('/').collect();
        let mut cur = &mut root;
        for (i, part) in parts.iter().enumerate() {
            cur.bytes += file.size;
            if i + 1 == parts.len() {
                cur.children
                    .push(FileNode::new(part, file.name.clone(), file.size));
                break;
            }
            let pos = match cur.children.iter().position(|c| c.name == *part) {
                Some(pos) => pos,
                None => {
                    cur.children
                        .push(FileNode::new(part, parts[..=i].join("/"), 0));
                    cur.children.len() - 1
                }
            };
            cur = &mut cur.children[pos];
        }
    }
    root.fill_sizes();
    root.children
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlainFile {
    pub path: String,
    pub name: String,
    pub size: String,
    pub downloaded: String,
    pub progress: f64,
}

pub fn plain_files(detail: &BagDetail) -> Vec<PlainFile> {
    let dir = detail
        .bag
        .header
        .as_ref()
        .map(|h| h.dir_name.as_str())
        .unwrap_or("");
    detail
        .files
        .iter()
        .map(|f| PlainFile {
            path: match dir {
                "" => format!("{}/{}", detail.bag.root_dir, f.name),
                d if d.ends_with('/') => format!("{}/{}{}", detail.bag.root_dir, d, f.name),
                d => format!("{}/{}/{}", detail.bag.root_dir, d, f.name),
            },
            name: f.name.clone(),
            size: to_size(f.size),
            downloaded: to_size(f.downloaded_size),
            progress: progress(f.downloaded_size, f.size),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerView {
    pub address: String,
    pub id: String,
    pub upload: String,
    pub download: String,
}

pub fn peer_views(peers: &PeerList) -> Vec<PeerView> {
    peers
        .peers
        .iter()
        .map(|p| PeerView {
            address: p.address.clone(),
            id: hex::encode_upper(p.adnl_id),
            upload: to_speed(speed_bytes(p.upload_speed), true),
            download: to_speed(speed_bytes(p.download_speed), true),
        })
        .collect()
}

/// Aggregate speed over all synced bags.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct SpeedSummary {
    pub download: String,
    pub upload: String,
}

impl SpeedSummary {
    pub fn new(download: f64, upload: f64) -> Self {
        Self {
            download: to_speed(speed_bytes(download), false),
            upload: to_speed(speed_bytes(upload), false),
        }
    }
}
