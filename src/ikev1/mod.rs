use log::{debug, info, trace, warn};
use std::{
    collections::HashMap,
    error, fmt,
    future::{self, Future},
    io,
    net::{IpAddr, SocketAddr},
    pin::pin,
    sync::Arc,
    task::Poll,
    time::{Duration, Instant},
};
use tokio::{
    net::UdpSocket,
    runtime, signal,
    sync::mpsc,
    task::JoinHandle,
    time,
};

mod cookie;
pub mod crypto;
mod engine;
mod exchange;
mod installer;
pub mod message;
mod phase1;
mod phase2;
mod pki;
pub mod policy;
mod recvcache;
mod registry;
mod sa;
mod schedule;

use engine::Engine;
use installer::LoggingInstaller;

// Largest UDP payload.
const MAX_DATAGRAM_SIZE: usize = 65535;
// Upper bound for sleeping when no timers are scheduled.
const IDLE_WAIT: Duration = Duration::from_secs(60);
const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(60);

pub struct Config {
    pub listen_ips: Vec<IpAddr>,
    pub port: u16,
    pub remote: policy::RemoteConfig,
    pub sainfo: policy::Sainfo,
    pub psk: policy::PskTable,
    pub root_ca: Option<String>,
    pub local_cert: Option<(String, String)>,
    pub peer_cert: Option<String>,
    pub padding: crypto::PaddingConfig,
    pub weak_keys: crypto::WeakKeyPolicy,
    /// Traffic to negotiate right after startup.
    pub acquire: Option<policy::TrafficSelectors>,
}

pub struct Server {
    listen_ips: Vec<IpAddr>,
    port: u16,
    policy: policy::Policy,
    acquire: Option<(policy::TrafficSelectors, IpAddr)>,
}

impl Server {
    pub fn new(config: Config) -> Result<Server, IKEv1Error> {
        let needs_pki = config.remote.auth_method() == Some(policy::AuthMethod::RsaSignature);
        let pki_processing = if needs_pki || config.root_ca.is_some() {
            Some(pki::PkiProcessing::new(
                config.root_ca.as_deref(),
                config
                    .local_cert
                    .as_ref()
                    .map(|(public_cert, private_key)| (public_cert.as_str(), private_key.as_str())),
                config.peer_cert.as_deref(),
                config.remote.verify_cert,
            )?)
        } else {
            None
        };
        let acquire = match config.acquire {
            Some(selectors) => {
                let remote_ip = config
                    .remote
                    .remote_addr
                    .ok_or("Connecting requires a peer address")?;
                Some((selectors, remote_ip))
            }
            None => None,
        };
        if config.listen_ips.is_empty() {
            return Err("No listen addresses".into());
        }
        let mut policy = policy::Policy::new(
            vec![config.remote],
            vec![config.sainfo],
            config.psk,
            pki_processing,
        );
        policy.padding = config.padding;
        policy.weak_keys = config.weak_keys;
        Ok(Server {
            listen_ips: config.listen_ips,
            port: config.port,
            policy,
            acquire,
        })
    }

    pub fn run(self) -> Result<(), IKEv1Error> {
        let rt = runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        rt.block_on(self.serve())?;
        rt.shutdown_timeout(Duration::from_secs(60));
        info!("Stopped server");
        Ok(())
    }

    async fn send_ticks(duration: Duration, dest: mpsc::Sender<Command>) -> Result<(), IKEv1Error> {
        let mut interval = time::interval(duration);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            dest.send(Command::Snapshot)
                .await
                .map_err(|_| "Channel closed")?;
        }
    }

    async fn wait_termination(dest: mpsc::Sender<Command>) -> Result<(), IKEv1Error> {
        signal::ctrl_c().await?;
        dest.send(Command::Shutdown)
            .await
            .map_err(|_| "Channel closed")?;
        Ok(())
    }

    async fn serve(self) -> Result<(), IKEv1Error> {
        let mut sockets = Sockets::new(&self.listen_ips, self.port).await?;
        let sender = sockets.create_sender();
        let rt = runtime::Handle::current();
        let (command_sender, mut command_receiver) = mpsc::channel(8);
        rt.spawn(Server::send_ticks(SNAPSHOT_INTERVAL, command_sender.clone()));
        rt.spawn(Server::wait_termination(command_sender));

        let mut engine = Engine::new(self.policy, LoggingInstaller::new(), Instant::now())?;
        if let Some((selectors, remote_ip)) = self.acquire {
            let local_addr = SocketAddr::new(self.listen_ips[0], self.port);
            let remote_addr = SocketAddr::new(remote_ip, self.port);
            if let Err(err) = engine.acquire(selectors, remote_addr, local_addr, Instant::now()) {
                warn!("Failed to start negotiation for {}: {}", selectors, err);
            }
        }
        loop {
            sender.flush(&mut engine).await?;
            let deadline = engine
                .next_deadline()
                .map(time::Instant::from_std)
                .unwrap_or_else(|| time::Instant::now() + IDLE_WAIT);
            // Wait until something is ready.
            let (command, datagram) = {
                let mut receive_command = pin!(command_receiver.recv());
                let mut receive_udp = pin!(sockets.receive_datagram());
                let mut timer = pin!(time::sleep_until(deadline));
                future::poll_fn(move |cx| {
                    let mut ready = false;
                    let received_command = receive_command.as_mut().poll(cx);
                    ready = ready || received_command.is_ready();
                    let received_command = match received_command {
                        Poll::Ready(cmd) => cmd,
                        Poll::Pending => None,
                    };
                    let received_udp = receive_udp.as_mut().poll(cx);
                    ready = ready || received_udp.is_ready();
                    let received_udp = match received_udp {
                        Poll::Ready(datagram) => datagram,
                        Poll::Pending => None,
                    };
                    ready = ready || timer.as_mut().poll(cx).is_ready();
                    if ready {
                        Poll::Ready((received_command, received_udp))
                    } else {
                        Poll::Pending
                    }
                })
                .await
            };
            // Process all ready events.
            match command {
                Some(Command::Shutdown) => {
                    info!("Shutting down, deleting all SAs");
                    engine.shutdown();
                    sender.flush(&mut engine).await?;
                    drop(sender);
                    if let Err(err) = sockets.close().await {
                        warn!("Failed to flush outgoing messages: {}", err);
                    }
                    return Ok(());
                }
                Some(Command::Snapshot) => {
                    let snapshot = engine.snapshot(Instant::now());
                    debug!(
                        "{} phase 1 SAs, {} scheduled events",
                        snapshot.phase1.len(),
                        snapshot.events.len()
                    );
                    for phase1 in snapshot.phase1.iter() {
                        debug!("{}", phase1);
                    }
                    for event in snapshot.events.iter() {
                        trace!(
                            "Event {} in {:?}: {}",
                            event.id,
                            event.remaining,
                            event.task
                        );
                    }
                }
                None => {}
            }
            if let Some(datagram) = datagram {
                let result = engine.process_datagram(
                    datagram.remote_addr,
                    datagram.local_addr,
                    &datagram.bytes,
                    Instant::now(),
                );
                match result {
                    Ok(()) => {}
                    Err(err) if err.is_malformed() => {
                        debug!(
                            "Dropped message from {}: {}",
                            datagram.remote_addr, err
                        );
                    }
                    Err(err) => {
                        warn!(
                            "Failed to process message from {}: {}",
                            datagram.remote_addr, err
                        );
                    }
                }
            }
            engine.process_timers(Instant::now());
        }
    }
}

enum Command {
    Snapshot,
    Shutdown,
}

struct Sockets {
    listen_rx: mpsc::Receiver<UdpDatagram>,
    send_tx: mpsc::Sender<UdpDatagram>,
    sender_task: JoinHandle<()>,
}

impl Sockets {
    async fn new(listen_ips: &[IpAddr], port: u16) -> Result<Sockets, IKEv1Error> {
        let mut sockets = HashMap::new();
        for listen_ip in listen_ips {
            let socket = match UdpSocket::bind((*listen_ip, port)).await {
                Ok(socket) => socket,
                Err(err) => {
                    log::error!("Failed to open listener on {}: {}", listen_ip, err);
                    return Err(err.into());
                }
            };
            let listen_addr = socket.local_addr()?;
            info!("Started server on {}", listen_addr);
            sockets.insert(listen_addr, Arc::new(socket));
        }
        let rt = runtime::Handle::current();
        let (listen_tx, listen_rx) = mpsc::channel(16);
        sockets.iter().for_each(|(listen_addr, socket)| {
            rt.spawn(Self::run_receiver(
                listen_tx.clone(),
                *listen_addr,
                socket.clone(),
            ));
        });
        let (send_tx, send_rx) = mpsc::channel(16);
        let sender_task = rt.spawn(Self::run_sender(send_rx, sockets));
        Ok(Sockets {
            listen_rx,
            send_tx,
            sender_task,
        })
    }

    async fn run_receiver(
        tx: mpsc::Sender<UdpDatagram>,
        listen_addr: SocketAddr,
        socket: Arc<UdpSocket>,
    ) {
        loop {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            let (bytes_res, remote_addr) = match socket.recv_from(&mut buf).await {
                Ok(res) => res,
                Err(err) => {
                    warn!("Failed to receive from socket {}: {}", listen_addr, err);
                    return;
                }
            };
            buf.truncate(bytes_res);
            let msg = UdpDatagram {
                remote_addr,
                local_addr: listen_addr,
                bytes: buf,
            };
            if tx.send(msg).await.is_err() {
                warn!("Channel closed for {}", listen_addr);
                return;
            }
        }
    }

    async fn run_sender(
        mut rx: mpsc::Receiver<UdpDatagram>,
        sockets: HashMap<SocketAddr, Arc<UdpSocket>>,
    ) {
        while let Some(datagram) = rx.recv().await {
            let socket = if let Some(socket) = sockets.get(&datagram.local_addr) {
                socket
            } else {
                warn!(
                    "No open sockets for source address {} (destination {})",
                    datagram.local_addr, datagram.remote_addr
                );
                continue;
            };
            if let Err(err) = socket.send_to(&datagram.bytes, datagram.remote_addr).await {
                warn!(
                    "Failed to send UDP message from {} to {}: {}",
                    datagram.local_addr, datagram.remote_addr, err
                );
            }
        }
    }

    async fn receive_datagram(&mut self) -> Option<UdpDatagram> {
        self.listen_rx.recv().await
    }

    /// Waits until all queued datagrams are sent.
    async fn close(self) -> Result<(), tokio::task::JoinError> {
        drop(self.send_tx);
        self.sender_task.await
    }

    fn create_sender(&self) -> UdpSender {
        UdpSender {
            tx: self.send_tx.clone(),
        }
    }
}

struct UdpDatagram {
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    bytes: Vec<u8>,
}

#[derive(Clone)]
struct UdpSender {
    tx: mpsc::Sender<UdpDatagram>,
}

impl UdpSender {
    /// Hands everything the engine queued to the socket task.
    async fn flush(&self, engine: &mut Engine<LoggingInstaller>) -> Result<(), IKEv1Error> {
        for datagram in engine.take_outgoing() {
            self.tx
                .send(UdpDatagram {
                    remote_addr: datagram.remote_addr,
                    local_addr: datagram.local_addr,
                    bytes: datagram.bytes,
                })
                .await
                .map_err(|_| "UDP sender channel closed")?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum IKEv1Error {
    Internal(&'static str),
    Format(message::FormatError),
    CertError(pki::CertError),
    Exchange(exchange::ExchangeError),
    Io(io::Error),
}

impl fmt::Display for IKEv1Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::Internal(msg) => f.write_str(msg),
            Self::Format(ref e) => write!(f, "Format error: {}", e),
            Self::CertError(ref e) => write!(f, "PKI cert error: {}", e),
            Self::Exchange(ref e) => write!(f, "IKEv1 exchange error: {}", e),
            Self::Io(ref e) => {
                write!(f, "IO error: {}", e)
            }
        }
    }
}

impl error::Error for IKEv1Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            Self::Internal(_msg) => None,
            Self::Format(ref err) => Some(err),
            Self::CertError(ref err) => Some(err),
            Self::Exchange(ref err) => Some(err),
            Self::Io(ref err) => Some(err),
        }
    }
}

impl From<&'static str> for IKEv1Error {
    fn from(msg: &'static str) -> IKEv1Error {
        Self::Internal(msg)
    }
}

impl From<message::FormatError> for IKEv1Error {
    fn from(err: message::FormatError) -> IKEv1Error {
        Self::Format(err)
    }
}

impl From<pki::CertError> for IKEv1Error {
    fn from(err: pki::CertError) -> IKEv1Error {
        Self::CertError(err)
    }
}

impl From<exchange::ExchangeError> for IKEv1Error {
    fn from(err: exchange::ExchangeError) -> IKEv1Error {
        Self::Exchange(err)
    }
}

impl From<io::Error> for IKEv1Error {
    fn from(err: io::Error) -> IKEv1Error {
        Self::Io(err)
    }
}
