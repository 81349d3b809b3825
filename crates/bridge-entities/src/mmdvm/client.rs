//! MMDVM master client worker: login handshake, keep-alive and traffic exchange

use std::net::UdpSocket;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, unbounded};

use bridge_config::CfgMaster;
use bridge_proto::dmrd::DmrdPacket;

use super::protocol::{self, MasterMessage};

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(5);
const MASTER_TIMEOUT: Duration = Duration::from_secs(15);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Login handshake progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    SentLogin,
    SentAuth,
    SentConfig,
    Ready,
}

/// Events the worker sends to the bridge
#[derive(Debug)]
pub enum MmdvmEvent {
    /// Handshake completed, traffic may flow
    Connected,
    /// Connection lost (with reason); the worker reconnects by itself
    Disconnected(String),
    /// Traffic frame received from the master
    Frame(DmrdPacket),
}

/// Commands the bridge sends to the worker
#[derive(Debug)]
pub enum MmdvmCommand {
    SendFrame(DmrdPacket),
    Disconnect,
}

/// Handle to a running master connection. The worker thread owns the
/// socket; this side only talks over channels.
pub struct MmdvmClient {
    callsign: String,
    cmd_tx: Sender<MmdvmCommand>,
    event_rx: Receiver<MmdvmEvent>,
}

impl MmdvmClient {
    /// Spawn the worker thread for one configured master.
    pub fn spawn(master: CfgMaster, running: Arc<AtomicBool>) -> std::io::Result<Self> {
        let (cmd_tx, cmd_rx) = unbounded::<MmdvmCommand>();
        let (event_tx, event_rx) = unbounded::<MmdvmEvent>();

        let callsign = master.callsign.clone();
        thread::Builder::new()
            .name(format!("mmdvm-{}", callsign.to_lowercase()))
            .spawn(move || {
                let mut worker = MmdvmWorker {
                    master,
                    event_tx,
                    cmd_rx,
                    running,
                    state: ClientState::Idle,
                };
                worker.run();
            })?;

        Ok(Self { callsign, cmd_tx, event_rx })
    }

    pub fn callsign(&self) -> &str {
        &self.callsign
    }

    /// Queue a traffic frame towards the master. Frames sent before the
    /// handshake completes are dropped by the worker.
    pub fn send_frame(&self, frame: DmrdPacket) {
        let _ = self.cmd_tx.send(MmdvmCommand::SendFrame(frame));
    }

    pub fn events(&self) -> &Receiver<MmdvmEvent> {
        &self.event_rx
    }

    /// Ask the worker to log out and stop.
    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(MmdvmCommand::Disconnect);
    }
}

struct MmdvmWorker {
    master: CfgMaster,
    event_tx: Sender<MmdvmEvent>,
    cmd_rx: Receiver<MmdvmCommand>,
    running: Arc<AtomicBool>,
    state: ClientState,
}

impl MmdvmWorker {
    fn run(&mut self) {
        tracing::info!(
            "MMDVM client {} starting, master {}:{}",
            self.master.callsign,
            self.master.host,
            self.master.port
        );

        while self.running.load(Ordering::SeqCst) {
            match self.connect_and_run() {
                Ok(()) => {
                    tracing::info!("MMDVM client {}: connection closed", self.master.callsign);
                    break;
                }
                Err(e) => {
                    tracing::warn!("MMDVM client {}: {}", self.master.callsign, e);
                    let _ = self.event_tx.send(MmdvmEvent::Disconnected(e));
                    self.state = ClientState::Idle;
                    if !self.sleep_while_running(RECONNECT_DELAY) {
                        break;
                    }
                    tracing::info!("MMDVM client {}: reconnecting", self.master.callsign);
                }
            }
        }

        tracing::info!("MMDVM client {} stopped", self.master.callsign);
    }

    /// One connection attempt: handshake, then the traffic loop. Returns
    /// Ok on a requested shutdown, Err on anything that warrants a
    /// reconnect.
    fn connect_and_run(&mut self) -> Result<(), String> {
        let socket = UdpSocket::bind("0.0.0.0:0").map_err(|e| format!("UDP bind failed: {}", e))?;
        socket
            .connect((self.master.host.as_str(), self.master.port))
            .map_err(|e| format!("UDP connect failed: {}", e))?;
        socket
            .set_read_timeout(Some(Duration::from_millis(100)))
            .map_err(|e| format!("set read timeout: {}", e))?;

        self.send(&socket, &protocol::build_login(self.master.id))?;
        self.state = ClientState::SentLogin;

        let mut last_heard = Instant::now();
        let mut last_ping = Instant::now();
        let mut buf = [0u8; 2048];

        loop {
            if !self.running.load(Ordering::SeqCst) {
                let _ = socket.send(&protocol::build_close(self.master.id));
                return Ok(());
            }

            // Commands from the bridge
            while let Ok(cmd) = self.cmd_rx.try_recv() {
                match cmd {
                    MmdvmCommand::SendFrame(frame) => {
                        if self.state == ClientState::Ready {
                            self.send(&socket, &frame.encode())?;
                        } else {
                            tracing::debug!(
                                "MMDVM client {}: dropping frame, not logged in",
                                self.master.callsign
                            );
                        }
                    }
                    MmdvmCommand::Disconnect => {
                        let _ = socket.send(&protocol::build_close(self.master.id));
                        return Ok(());
                    }
                }
            }

            // Inbound from the master
            match socket.recv(&mut buf) {
                Ok(len) => {
                    last_heard = Instant::now();
                    self.handle_master_message(&socket, &buf[..len])?;
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => return Err(format!("UDP receive failed: {}", e)),
            }

            // Keep-alive and liveness
            if self.state == ClientState::Ready
                && last_ping.elapsed() >= KEEP_ALIVE_INTERVAL
            {
                self.send(&socket, &protocol::build_ping(self.master.id))?;
                last_ping = Instant::now();
            }
            if last_heard.elapsed() > MASTER_TIMEOUT {
                return Err(if self.state == ClientState::Ready {
                    "master stopped answering pings".to_string()
                } else {
                    "login handshake timed out".to_string()
                });
            }
        }
    }

    fn handle_master_message(&mut self, socket: &UdpSocket, data: &[u8]) -> Result<(), String> {
        let msg = match protocol::parse_master_message(data) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!("MMDVM client {}: bad frame from master: {}", self.master.callsign, e);
                return Ok(());
            }
        };

        match msg {
            MasterMessage::Ack(payload) => match self.state {
                ClientState::SentLogin => {
                    // The payload is the nonce our password gets hashed with
                    self.send(
                        socket,
                        &protocol::build_auth(self.master.id, &payload, &self.master.password),
                    )?;
                    self.state = ClientState::SentAuth;
                }
                ClientState::SentAuth => {
                    self.send(socket, &protocol::build_config(&self.master))?;
                    self.state = ClientState::SentConfig;
                }
                ClientState::SentConfig => {
                    self.state = ClientState::Ready;
                    tracing::info!("MMDVM client {}: logged in", self.master.callsign);
                    let _ = self.event_tx.send(MmdvmEvent::Connected);
                }
                _ => {}
            },
            MasterMessage::Nak => {
                return Err("master refused login (MSTNAK)".to_string());
            }
            MasterMessage::Pong => {}
            MasterMessage::Closing => {
                return Err("master closed the connection (MSTCL)".to_string());
            }
            MasterMessage::Frame(frame) => {
                let _ = self.event_tx.send(MmdvmEvent::Frame(frame));
            }
            MasterMessage::Unknown => {
                tracing::debug!(
                    "MMDVM client {}: unhandled packet from master ({} bytes)",
                    self.master.callsign,
                    data.len()
                );
            }
        }
        Ok(())
    }

    fn send(&self, socket: &UdpSocket, data: &[u8]) -> Result<(), String> {
        socket
            .send(data)
            .map(|_| ())
            .map_err(|e| format!("UDP send failed: {}", e))
    }

    /// Sleep in small steps so shutdown stays responsive. Returns false
    /// when the bridge is stopping.
    fn sleep_while_running(&self, total: Duration) -> bool {
        let deadline = Instant::now() + total;
        while Instant::now() < deadline {
            if !self.running.load(Ordering::SeqCst) {
                return false;
            }
            thread::sleep(Duration::from_millis(100));
        }
        true
    }
}
