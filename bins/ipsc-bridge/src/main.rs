use clap::Parser;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use bridge_config::{BridgeConfig, CfgMaster, toml_config};
use bridge_entities::Translator;
use bridge_entities::ipsc::{self, IpscServer, IpscServerHandle};
use bridge_entities::mmdvm::{MmdvmClient, MmdvmEvent};
use bridge_proto::debug;
use bridge_proto::dmrd::DmrdPacket;
use bridge_proto::rewrite;

/// Interval between idle sweeps of the call streams and the peer registry
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// One configured master with its running client
struct BridgeMaster {
    cfg: CfgMaster,
    client: MmdvmClient,
}

impl BridgeMaster {
    /// Whether this master carries the frame's slot at all
    fn slot_enabled(&self, slot: bool) -> bool {
        let bit = if slot { 0b10 } else { 0b01 };
        self.cfg.slots & bit != 0
    }
}

/// Load configuration file
fn load_config_from_toml(cfg_path: &str) -> BridgeConfig {
    match toml_config::from_file(cfg_path) {
        Ok(c) => c,
        Err(e) => {
            println!("Failed to load configuration from {}: {}", cfg_path, e);
            std::process::exit(1);
        }
    }
}

/// Repeater → masters: rewrite each translated frame per master and
/// forward it to every master whose rules accept it.
fn run_uplink(
    frames_rx: crossbeam_channel::Receiver<DmrdPacket>,
    masters: Arc<Vec<BridgeMaster>>,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::SeqCst) {
        let frame = match frames_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(frame) => frame,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        };

        for master in masters.iter() {
            if !master.slot_enabled(frame.slot) {
                continue;
            }
            let mut frame = frame.clone();
            // An empty rule list passes everything through untouched
            if !master.cfg.rewrite_out.is_empty()
                && !rewrite::apply(&master.cfg.rewrite_out, &mut frame)
            {
                continue;
            }
            frame.repeater = master.cfg.id;
            master.client.send_frame(frame);
        }
    }
}

/// One master → repeater: apply the inbound rules, translate to IPSC and
/// fan the datagrams out to the registered peers.
fn run_downlink(
    master: Arc<Vec<BridgeMaster>>,
    index: usize,
    translator: Arc<Translator>,
    handle: IpscServerHandle,
    running: Arc<AtomicBool>,
) {
    let master = &master[index];
    while running.load(Ordering::SeqCst) {
        let event = match master.client.events().recv_timeout(Duration::from_millis(100)) {
            Ok(event) => event,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        };

        match event {
            MmdvmEvent::Frame(mut frame) => {
                if !master.cfg.rewrite_in.is_empty()
                    && !rewrite::apply(&master.cfg.rewrite_in, &mut frame)
                {
                    continue;
                }
                let packets = translator.translate_to_ipsc(&frame);
                if !packets.is_empty() {
                    handle.send_to_peers(&packets);
                }
            }
            MmdvmEvent::Connected => {
                tracing::info!("master {} is up", master.cfg.callsign);
            }
            MmdvmEvent::Disconnected(reason) => {
                tracing::warn!("master {} lost: {}", master.cfg.callsign, reason);
            }
        }
    }
}

fn run_sweeper(
    translator: Arc<Translator>,
    server: Arc<IpscServer>,
    stream_timeout: Duration,
    peer_timeout: Duration,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::SeqCst) {
        thread::sleep(SWEEP_INTERVAL);
        translator.sweep(stream_timeout);
        server.peers().evict_stale(peer_timeout);
    }
}

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "IPSC ⇄ MMDVM bridge",
    long_about = "Presents a Motorola IPSC repeater to MMDVM/HBRP master servers using the provided TOML configuration file"
)]
struct Args {
    /// Config file (required)
    #[arg(help = "TOML config with IPSC and master parameters")]
    config: String,
}

fn main() {
    let args = Args::parse();
    let cfg = load_config_from_toml(&args.config);
    let _log_guard = debug::setup_logging_default(cfg.log_level.as_filter_str(), cfg.log_file.clone());

    let bind_addr: SocketAddr = match format!("{}:{}", cfg.ipsc.ip, cfg.ipsc.port).parse() {
        Ok(addr) => addr,
        Err(e) => {
            eprintln!("Invalid IPSC bind address: {}", e);
            std::process::exit(1);
        }
    };

    // Set up Ctrl+C handler for graceful shutdown
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .expect("failed to set Ctrl+C handler");

    let translator = Arc::new(Translator::new(cfg.id));
    let server = Arc::new(IpscServer::new(cfg.id, &cfg.ipsc.auth, translator.clone()));

    let (frames_tx, frames_rx) = crossbeam_channel::unbounded::<DmrdPacket>();
    let handle = match ipsc::server::spawn(server.clone(), bind_addr, frames_tx, running.clone()) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("Failed to start IPSC server on {}: {}", bind_addr, e);
            std::process::exit(1);
        }
    };

    let mut masters = Vec::with_capacity(cfg.masters.len());
    for master_cfg in cfg.masters.iter().cloned() {
        match MmdvmClient::spawn(master_cfg.clone(), running.clone()) {
            Ok(client) => masters.push(BridgeMaster { cfg: master_cfg, client }),
            Err(e) => {
                eprintln!("Failed to start client for {}: {}", master_cfg.callsign, e);
                std::process::exit(1);
            }
        }
    }
    let masters = Arc::new(masters);

    {
        let masters = masters.clone();
        let running = running.clone();
        if let Err(e) = thread::Builder::new()
            .name("bridge-uplink".into())
            .spawn(move || run_uplink(frames_rx, masters, running))
        {
            eprintln!("Failed to start uplink thread: {}", e);
            std::process::exit(1);
        }
    }

    for index in 0..masters.len() {
        let masters = masters.clone();
        let translator = translator.clone();
        let handle = handle.clone();
        let running = running.clone();
        let name = format!("bridge-downlink-{}", masters[index].cfg.callsign.to_lowercase());
        if let Err(e) = thread::Builder::new()
            .name(name)
            .spawn(move || run_downlink(masters, index, translator, handle, running))
        {
            eprintln!("Failed to start downlink thread: {}", e);
            std::process::exit(1);
        }
    }

    {
        let translator = translator.clone();
        let server = server.clone();
        let stream_timeout = Duration::from_secs(cfg.stream_timeout_secs);
        let peer_timeout = Duration::from_secs(cfg.ipsc.peer_timeout_secs);
        let running = running.clone();
        if let Err(e) = thread::Builder::new()
            .name("bridge-sweeper".into())
            .spawn(move || run_sweeper(translator, server, stream_timeout, peer_timeout, running))
        {
            eprintln!("Failed to start sweeper thread: {}", e);
            std::process::exit(1);
        }
    }

    tracing::info!(
        "bridge up: repeater ID {}, {} master connection(s)",
        cfg.id,
        masters.len()
    );

    while running.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(200));
    }

    tracing::info!("shutting down");
    for master in masters.iter() {
        master.client.shutdown();
    }
    // Give the workers a moment to send RPTCL and drain their queues
    thread::sleep(Duration::from_secs(1));
}
