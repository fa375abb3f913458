//! Subcommand handlers.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use bagpipe_core::pricing::{
    amortized_days, deploy_amount, format_amount, parse_amount, quote, ProviderRates,
};
use bagpipe_core::views::{BagView, FileNode, PeerView, PlainFile};
use bagpipe_core::{
    format_bag_id, parse_bag_id, BagMeta, BagSynchronizer, ControlSession, SpeedLimits,
    StorageClient, SyncOptions,
};
use serde::Serialize;
use tracing::info;

use crate::config::Config;
use crate::Command;

pub async fn run(command: Command, cfg: Config, json: bool) -> Result<()> {
    let client = connect(&cfg).await?;
    let sync = BagSynchronizer::new(
        client.clone(),
        SyncOptions {
            interval: cfg.sync_interval(),
            hide_zero_speed: true,
        },
    );

    match command {
        Command::List => {
            sync.sync_once().await?;
            print_bags(&sync.snapshot().await, json)?;
        }
        Command::Watch => watch(&sync, json).await?,
        Command::Info { id } => match sync.bag_info(&id).await? {
            Some(info) if json => print_json(&info)?,
            Some(info) => {
                println!("{}", info.description);
                println!("  state:      {}", info.state);
                println!("  size:       {} ({} downloaded, {}%)", info.size, info.downloaded, info.progress);
                println!("  time left:  {}", info.time_left);
                println!("  speed:      down {} / up {}", info.download, info.upload);
                println!("  peers:      {}", info.peers);
                println!("  path:       {}", info.path);
                println!("  added at:   {}", info.added_at);
            }
            None => bail!("bag {id} is not initialized yet"),
        },
        Command::Files { id, plain: true } => {
            let files = sync.plain_files(&id).await?;
            if json {
                print_json(&files)?;
            } else {
                print_plain_files(&files);
            }
        }
        Command::Files { id, plain: false } => {
            let tree = sync.bag_files(&id).await?;
            if json {
                print_json(&tree)?;
            } else {
                print_tree(&tree, 0);
            }
        }
        Command::Peers { id } => {
            let peers = sync.peer_views(&id).await?;
            if json {
                print_json(&peers)?;
            } else {
                print_peers(&peers);
            }
        }
        Command::Add { id, dir } => {
            let dir = dir.unwrap_or_else(|| cfg.downloads_dir.clone());
            let added = client.add_by_hash(parse_bag_id(&id)?, &path_str(&dir)?).await?;
            report_added(&id.to_uppercase(), added.is_some());
        }
        Command::AddMeta { file, dir } => {
            let data = std::fs::read(&file).with_context(|| format!("read {}", file.display()))?;
            let meta = BagMeta::parse(&data).with_context(|| format!("parse {}", file.display()))?;
            let dir = dir.unwrap_or_else(|| cfg.downloads_dir.clone());
            let added = client.add_by_meta(data, &path_str(&dir)?).await?;
            report_added(&format_bag_id(&meta.id), added.is_some());
        }
        Command::Create {
            path,
            description,
            no_upload,
            copy,
        } => {
            let detail = client
                .create_bag(&path_str(&path)?, &description, !no_upload, copy)
                .await?;
            println!("{}", format_bag_id(&detail.bag.id));
        }
        Command::Remove {
            id,
            with_files,
            only_uninitialized,
        } => {
            let bag = parse_bag_id(&id)?;
            if only_uninitialized {
                if !client.remove_bag_if_uninitialized(bag, with_files).await? {
                    info!(bag = %id, "bag has selected files, kept");
                }
            } else {
                client.remove_bag(bag, with_files).await?;
            }
        }
        Command::Start { id } => client.set_active(parse_bag_id(&id)?, true).await?,
        Command::Stop { id } => client.set_active(parse_bag_id(&id)?, false).await?,
        Command::Priority {
            id,
            priority,
            names,
        } => {
            client
                .set_files_priority(parse_bag_id(&id)?, &names[..], priority)
                .await?
        }
        Command::Limits { download, upload } => limits(&client, download, upload, json).await?,
        Command::ExportMeta { id, file } => {
            let data = client.bag_meta(parse_bag_id(&id)?).await?;
            std::fs::write(&file, data).with_context(|| format!("write {}", file.display()))?;
        }
        Command::Quote {
            id,
            rate,
            span,
            min_bounty,
            providers,
            balance,
        } => {
            let detail = client.bag_detail(parse_bag_id(&id)?).await?;
            let Some(info) = detail.bag.info else {
                bail!("bag {id} is not initialized yet");
            };
            let offer = Offer {
                rate: parse_amount(&rate)?,
                min_bounty: parse_amount(&min_bounty)?,
                span,
                providers,
                balance: balance.as_deref().map(parse_amount).transpose()?,
            };
            let report = offer.price(info.total_size)?;
            if json {
                print_json(&report)?;
            } else {
                println!("size:       {}", bagpipe_core::views::to_size(report.size));
                println!("per day:    {}", report.per_day);
                println!("per proof:  {}", report.per_proof);
                println!("deploy:     {} ({} providers)", report.deploy, report.providers);
                if let Some(days) = report.days {
                    println!("lasts:      {days} days");
                }
            }
        }
    }
    Ok(())
}

async fn connect(cfg: &Config) -> Result<StorageClient> {
    let (keypair, daemon_key) = cfg.load_keys()?;
    let session = ControlSession::connect(
        cfg.daemon_addr.as_str(),
        &keypair,
        &daemon_key,
        cfg.query_timeout(),
    )
    .await
    .with_context(|| format!("connect to daemon at {}", cfg.daemon_addr))?;
    Ok(StorageClient::new(Arc::new(session)))
}

async fn watch(sync: &BagSynchronizer, json: bool) -> Result<()> {
    let mut generations = sync.subscribe();
    let speed = sync.subscribe_speed();
    sync.start();

    let shutdown = crate::shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            res = &mut shutdown => {
                res?;
                break;
            }
            changed = generations.changed() => {
                if changed.is_err() {
                    break;
                }
                let bags = sync.snapshot().await;
                let total = speed.borrow().clone();
                if json {
                    println!("{}", serde_json::to_string(&WatchFrame { bags: &bags, speed: &total })?);
                } else {
                    print!("\x1b[2J\x1b[H");
                    print_bags(&bags, false)?;
                    println!("\ntotal: down {} / up {}", total.download, total.upload);
                }
            }
        }
    }
    sync.stop();
    Ok(())
}

#[derive(Serialize)]
struct WatchFrame<'a> {
    bags: &'a [BagView],
    speed: &'a bagpipe_core::views::SpeedSummary,
}

/// Limits on the command line are KB/s; the daemon wants bytes/s.
#[derive(Debug, Serialize)]
struct LimitsKb {
    download: i64,
    upload: i64,
}

impl From<SpeedLimits> for LimitsKb {
    fn from(l: SpeedLimits) -> Self {
        let kb = |v: f64| if v < 0.0 { -1 } else { v as i64 / 1024 };
        Self {
            download: kb(l.download),
            upload: kb(l.upload),
        }
    }
}

/// A provider offer given on the command line.
struct Offer {
    rate: u128,
    min_bounty: u128,
    span: u32,
    providers: usize,
    balance: Option<u128>,
}

#[derive(Debug, Serialize)]
struct QuoteReport {
    size: u64,
    per_day: String,
    per_proof: String,
    providers: usize,
    deploy: String,
    days: Option<u128>,
}

impl Offer {
    fn price(&self, size: u64) -> Result<QuoteReport> {
        let rates = ProviderRates {
            available: true,
            rate_per_mb_day: self.rate,
            min_bounty: self.min_bounty,
            space_available_mb: u64::MAX,
            min_span: self.span,
            max_span: self.span,
            size,
        };
        let q = quote(&rates, self.span)?;
        let top_up = self.balance.unwrap_or(0);
        let days = self
            .balance
            .and_then(|b| amortized_days(b, &vec![q; self.providers]));
        Ok(QuoteReport {
            size,
            per_day: format_amount(q.per_day),
            per_proof: format_amount(q.per_proof),
            providers: self.providers,
            deploy: format_amount(deploy_amount(top_up, self.providers)?),
            days,
        })
    }
}

fn bytes_per_sec(kb: i64) -> f64 {
    if kb < 0 {
        -1.0
    } else {
        (kb * 1024) as f64
    }
}

async fn limits(
    client: &StorageClient,
    download: Option<i64>,
    upload: Option<i64>,
    json: bool,
) -> Result<()> {
    let current = client.speed_limits().await?;
    if download.is_none() && upload.is_none() {
        let kb = LimitsKb::from(current);
        if json {
            print_json(&kb)?;
        } else {
            let show = |v: i64| if v < 0 { "unlimited".to_string() } else { format!("{v} KB/s") };
            println!("download: {}", show(kb.download));
            println!("upload:   {}", show(kb.upload));
        }
        return Ok(());
    }
    let limits = SpeedLimits {
        download: download.map(bytes_per_sec).unwrap_or(current.download),
        upload: upload.map(bytes_per_sec).unwrap_or(current.upload),
    };
    client.set_speed_limits(limits).await?;
    info!(download = limits.download, upload = limits.upload, "speed limits updated");
    Ok(())
}

fn path_str(path: &Path) -> Result<String> {
    match path.to_str() {
        Some(s) => Ok(s.to_string()),
        None => bail!("path {} is not valid UTF-8", path.display()),
    }
}

fn report_added(id: &str, added: bool) {
    if added {
        println!("{id} added");
    } else {
        println!("{id} already added");
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_bags(bags: &[BagView], json: bool) -> Result<()> {
    if json {
        return print_json(bags);
    }
    for b in bags {
        println!(
            "{}  {:<12} {:>6.1}%  {:>10} / {:<10} {:>12} {:>12}  {}",
            b.id,
            b.state.to_string(),
            b.progress, b.downloaded, b.size, b.download, b.upload, b.name
        );
        if let Some(err) = &b.error {
            println!("    error: {err}");
        }
    }
    Ok(())
}

fn print_tree(nodes: &[FileNode], depth: usize) {
    for n in nodes {
        println!("{:indent$}{}  {}", "", n.name, n.size, indent = depth * 2);
        print_tree(&n.children, depth + 1);
    }
}

fn print_plain_files(files: &[PlainFile]) {
    for f in files {
        println!("{:>6.1}%  {:>10} / {:<10}  {}", f.progress, f.downloaded, f.size, f.path);
    }
}

fn print_peers(peers: &[PeerView]) {
    for p in peers {
        println!("{}  {:<21}  down {:<12} up {}", p.id, p.address, p.download, p.upload);
    }
}
