use anyhow::Result;
use clap::Parser;
use log::{info, warn};
use seedproof::config::Config;
use seedproof::engine::embedded::EmbeddedEngine;
use seedproof::evidence::{EvidenceMeta, EvidenceWriter};
use seedproof::filter::AllowList;
use seedproof::lookup::{public_ip, whois};
use seedproof::session::Session;
use seedproof::torrent::Torrent;
use seedproof::utils::{format_timestamp, jst_now};
use seedproof::{download, enumerate, probe};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
struct Cli {
    #[clap(short, long, help = "path to *.torrent file")]
    file: String,
    #[clap(short, long, help = "evidence root; payload, peer.csv and logs land here")]
    out: String,
    #[clap(short, long, help = "path to a JSON config file")]
    config: Option<String>,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Cli::parse();
    let config = match &args.config {
        Some(path) => Config::load(Path::new(path))?,
        None => Config::default(),
    };
    run(&args, &config)
}

fn run(args: &Cli, config: &Config) -> Result<()> {
    let save_root = PathBuf::from(&args.out);
    let torrent = Torrent::from_file(&args.file)?;
    info!(
        "collecting evidence for {} ({})",
        torrent.name(),
        torrent.info_hash_hex()
    );

    let allow = AllowList::load(&config.ipv4_list, &config.ipv6_list);
    if allow.is_empty() {
        warn!("allow-lists are empty, enumeration will select no peers");
    }
    let self_addr = public_ip::detect();
    info!("own addresses: {:?}", self_addr);

    // reference payload first, the binary check needs it
    let engine = Box::new(EmbeddedEngine::new(config.listen_port)?);
    let mut session = Session::open_sampling(engine, &torrent);
    let reference = download::fetch_payload(&mut session, &torrent, &save_root, config.poll_interval())?;
    drop(session);

    let engine = Box::new(EmbeddedEngine::new(config.listen_port)?);
    let mut session = Session::open_sampling(engine, &torrent);
    let peers = enumerate::enumerate_seeds(
        &mut session,
        &torrent,
        config.max_peers,
        &allow,
        &self_addr,
        config.poll_interval(),
    )?;
    drop(session);
    info!("selected {} seeds", peers.len());

    let engine = Box::new(EmbeddedEngine::new(config.listen_port)?);
    let mut session = Session::open(engine, &torrent);
    let writer = EvidenceWriter::new(&save_root, config.piece_download);
    let mut rng = rand::thread_rng();

    for peer in &peers {
        let organization = whois::organization(&peer.addr).unwrap_or_else(|err| {
            warn!("whois lookup for {} failed: {:#}", peer.addr, err);
            whois::LOOKUP_FAILED.to_string()
        });
        let meta = EvidenceMeta {
            organization,
            payload_name: torrent.name().to_string(),
            info_hash_hex: torrent.info_hash_hex(),
            started_at: format_timestamp(&jst_now()),
            version: config.version.clone(),
        };
        match probe::probe_peer(
            &mut session,
            &torrent,
            peer,
            Some(&reference),
            &meta,
            &writer,
            &mut rng,
            config.poll_interval(),
        ) {
            Ok(record) => info!("probe of {} finished: {:?}", peer, record.status),
            Err(err) => warn!("probe of {} failed: {:#}", peer, err),
        }
    }
    Ok(())
}
