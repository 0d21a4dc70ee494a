use std::{
    collections::{HashSet, VecDeque},
    fmt,
    net::{IpAddr, SocketAddr},
    time::{Duration, Instant},
};

use log::{debug, info, trace, warn};

use super::cookie::{self, CookieGenerator, Index};
use super::exchange::{ExchangeError, ReceivedPayloads, Role};
use super::installer::SaInstaller;
use super::message::{
    self, ExchangeType, Flags, InputMessage, MessageWriter, NotifyType, PayloadType, ProtocolId,
};
use super::phase1::{Phase1, Phase1State};
use super::phase2::{Phase2, Phase2Outcome, Phase2State};
use super::policy::{self, ExchangeMode, IpsecProtocol, Policy, TrafficSelectors};
use super::recvcache::ReceivedCache;
use super::registry::{Phase1Id, Phase2Id, Registry};
use super::schedule::{EventSnapshot, Scheduler};

// Final teardown waits this long after expiry, and re-checks with the same interval.
const TEARDOWN_DELAY: Duration = Duration::from_secs(1);

pub struct Datagram {
    pub remote_addr: SocketAddr,
    pub local_addr: SocketAddr,
    pub bytes: Vec<u8>,
}

/// Timed work, kept in the scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Task {
    Phase1Resend(Phase1Id),
    Phase1Expire(Phase1Id),
    Phase1Teardown(Phase1Id),
    Phase2Resend(Phase2Id),
    Phase2Expire(Phase2Id),
    Phase2Teardown(Phase2Id),
    Phase2CheckParent(Phase2Id),
    SweepCache,
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Phase1Resend(id) => write!(f, "resend {}", id),
            Self::Phase1Expire(id) => write!(f, "expire {}", id),
            Self::Phase1Teardown(id) => write!(f, "teardown {}", id),
            Self::Phase2Resend(id) => write!(f, "resend {}", id),
            Self::Phase2Expire(id) => write!(f, "expire {}", id),
            Self::Phase2Teardown(id) => write!(f, "teardown {}", id),
            Self::Phase2CheckParent(id) => write!(f, "check phase 1 for {}", id),
            Self::SweepCache => write!(f, "sweep received cache"),
        }
    }
}

pub struct Phase1Snapshot {
    pub id: Phase1Id,
    pub remote_addr: SocketAddr,
    pub local_addr: SocketAddr,
    pub index: Index,
    pub role: Role,
    pub version: u8,
    pub mode: ExchangeMode,
    pub state: Phase1State,
    pub created: Instant,
    pub children: usize,
}

impl fmt::Display for Phase1Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} -> {} v{}.{} {} {} {} children {}",
            self.id,
            self.index,
            self.local_addr,
            self.remote_addr,
            self.version >> 4,
            self.version & 0x0f,
            self.mode,
            self.role,
            self.state,
            self.children
        )
    }
}

/// Phase 1 SAs and pending timers at one point in time.
pub struct Snapshot {
    pub phase1: Vec<Phase1Snapshot>,
    pub events: Vec<EventSnapshot<Task>>,
}

/// Negotiation engine: owns every SA and timer, and is driven by received datagrams,
/// local acquire requests and the clock.
pub struct Engine<I: SaInstaller> {
    policy: Policy,
    installer: I,
    registry: Registry,
    scheduler: Scheduler<Task>,
    received: ReceivedCache,
    cookies: CookieGenerator,
    outbox: VecDeque<Datagram>,
    initial_contact_sent: HashSet<IpAddr>,
}

impl<I: SaInstaller> Engine<I> {
    pub fn new(policy: Policy, installer: I, now: Instant) -> Result<Engine<I>, ExchangeError> {
        let received = ReceivedCache::new(
            policy::DEFAULT_RETRY_COUNT,
            policy::DEFAULT_RETRY_INTERVAL,
        );
        let mut scheduler = Scheduler::new();
        scheduler.schedule(now, received.lifetime(), Task::SweepCache);
        Ok(Engine {
            policy,
            installer,
            registry: Registry::new(),
            scheduler,
            received,
            cookies: CookieGenerator::new()?,
            outbox: VecDeque::new(),
            initial_contact_sent: HashSet::new(),
        })
    }

    #[cfg(test)]
    pub fn installer(&self) -> &I {
        &self.installer
    }

    #[cfg(test)]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Removes all datagrams queued for sending.
    pub fn take_outgoing(&mut self) -> Vec<Datagram> {
        self.outbox.drain(..).collect()
    }

    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.scheduler.next_deadline()
    }

    pub fn snapshot(&self, now: Instant) -> Snapshot {
        let phase1 = self
            .registry
            .phase1_ids()
            .into_iter()
            .filter_map(|id| {
                let phase1 = self.registry.phase1(id)?;
                Some(Phase1Snapshot {
                    id,
                    remote_addr: phase1.remote_addr(),
                    local_addr: phase1.local_addr(),
                    index: phase1.index(),
                    role: phase1.role(),
                    version: message::ISAKMP_VERSION,
                    mode: phase1.mode(),
                    state: phase1.state(),
                    created: phase1.created(),
                    children: self.registry.children(id).len(),
                })
            })
            .collect();
        Snapshot {
            phase1,
            events: self.scheduler.snapshot(now),
        }
    }

    fn send(&mut self, remote_addr: SocketAddr, local_addr: SocketAddr, bytes: Vec<u8>) {
        trace!(
            "Sending {} bytes from {} to {}",
            bytes.len(),
            local_addr,
            remote_addr
        );
        self.outbox.push_back(Datagram {
            remote_addr,
            local_addr,
            bytes,
        });
    }

    /// Processes a datagram received on the IKE port.
    /// Errors mean the datagram was dropped or the negotiation it belongs to was rejected;
    /// the engine state is already cleaned up when this returns.
    pub fn process_datagram(
        &mut self,
        remote_addr: SocketAddr,
        local_addr: SocketAddr,
        data: &[u8],
        now: Instant,
    ) -> Result<(), ExchangeError> {
        if let Some(reply) = self.received.check(data, remote_addr, local_addr) {
            debug!("Received a retransmitted message from {}, resending reply", remote_addr);
            self.send(remote_addr, local_addr, reply);
            return Ok(());
        }
        let message = InputMessage::from_datagram(data)?;
        trace!("Received message from {}: {:?}", remote_addr, message);
        if message.read_initiator_cookie() == 0 {
            return Err("Initiator cookie is zero".into());
        }
        let (major_version, _) = message.read_version();
        if major_version < 1 {
            debug!("Unsupported ISAKMP version {}", major_version);
            return Err("Unsupported ISAKMP version".into());
        }
        let flags = message.read_flags()?;
        let exchange_type = message.read_exchange_type();
        if exchange_type.is_phase1() {
            self.process_phase1(&message, flags, remote_addr, local_addr, data, now)
        } else if exchange_type == ExchangeType::QUICK_MODE {
            self.process_quick_mode(&message, remote_addr, local_addr, data, now)
        } else if exchange_type == ExchangeType::INFORMATIONAL {
            self.process_informational(&message, remote_addr, data, now)
        } else {
            debug!("Unsupported exchange type {}", exchange_type);
            Err("Unsupported exchange type".into())
        }
    }

    fn process_phase1(
        &mut self,
        message: &InputMessage,
        flags: Flags,
        remote_addr: SocketAddr,
        local_addr: SocketAddr,
        data: &[u8],
        now: Instant,
    ) -> Result<(), ExchangeError> {
        let index = Index::new(
            message.read_initiator_cookie(),
            message.read_responder_cookie(),
        );
        if message.read_message_id() != 0 {
            return Err("Phase 1 message has a non-zero message ID".into());
        }
        if flags.has(Flags::COMMIT) {
            debug!("Phase 1 message from {} has the commit flag set", remote_addr);
            self.send_unprotected_notify(index, remote_addr, local_addr, NotifyType::INVALID_FLAGS);
            return Err("Commit flag in phase 1".into());
        }
        let mut created = false;
        let id = if !index.has_responder_cookie() {
            if self
                .registry
                .find_phase1_by_initiator_cookie(index.initiator_cookie)
                .is_some()
            {
                debug!("Phase 1 {} already exists, dropping message", index);
                return Err("Responder cookie is not set".into());
            }
            created = true;
            self.create_responder(message, remote_addr, local_addr, now)?
        } else if let Some(id) = self.registry.find_phase1(&index) {
            id
        } else if let Some(id) = self
            .registry
            .find_phase1_awaiting_responder(index.initiator_cookie)
        {
            id
        } else {
            debug!("No phase 1 SA for {} from {}", index, remote_addr);
            return Err("Unknown cookies".into());
        };
        let phase1 = self
            .registry
            .phase1_mut(id)
            .ok_or(ExchangeError::Internal("Phase 1 disappeared"))?;
        if phase1.remote_addr() != remote_addr {
            debug!(
                "Phase 1 {} was negotiated with {}, received message from {}",
                id,
                phase1.remote_addr(),
                remote_addr
            );
        }
        match phase1.handle_message(&self.policy, data) {
            Ok(outcome) => {
                let (remote_addr, local_addr) = (phase1.remote_addr(), phase1.local_addr());
                if let Some(event) = phase1.retransmit.event.take() {
                    self.scheduler.cancel(event);
                }
                if let Some(reply) = outcome.reply {
                    self.received
                        .add(data, &reply, remote_addr, local_addr, now);
                    if !outcome.established {
                        self.arm_phase1_resend(id, reply.clone(), now);
                    }
                    self.send(remote_addr, local_addr, reply);
                }
                if outcome.established {
                    self.phase1_established(id, now);
                }
                Ok(())
            }
            Err(err) if err.is_malformed() => {
                debug!("Dropping phase 1 message for {}: {}", id, err);
                if created {
                    self.registry.remove_phase1(id);
                }
                Err(err)
            }
            Err(err) => {
                warn!("Phase 1 {} failed: {}", id, err);
                if let Some(notify_type) = err.notify_type() {
                    self.send_phase1_notify(id, notify_type);
                }
                self.delete_phase1(id, false);
                Err(err)
            }
        }
    }

    fn create_responder(
        &mut self,
        message: &InputMessage,
        remote_addr: SocketAddr,
        local_addr: SocketAddr,
        now: Instant,
    ) -> Result<Phase1Id, ExchangeError> {
        let remote = match self.policy.remote_for(remote_addr.ip()) {
            Some(remote) => remote,
            None => {
                info!("No configuration for peer {}, ignoring", remote_addr);
                return Err(ExchangeError::Internal("Unknown peer"));
            }
        };
        let exchange_type = message.read_exchange_type();
        let mode = match ExchangeMode::from_exchange_type(exchange_type) {
            Some(mode) if remote.accepts_exchange(mode) => mode,
            _ => {
                warn!(
                    "Peer {} requested {} exchange, which is not allowed",
                    remote_addr, exchange_type
                );
                return Err(ExchangeError::Internal("Exchange mode is not allowed"));
            }
        };
        let index = Index::new(
            message.read_initiator_cookie(),
            self.cookies.generate(remote_addr, local_addr)?,
        );
        let phase1 = Phase1::new_responder(
            &self.policy,
            remote,
            index,
            mode,
            remote_addr,
            local_addr,
            now,
        )?;
        let id = self.registry.insert_phase1(phase1);
        info!(
            "Responding to {} mode from {} as {} ({})",
            mode, remote_addr, id, index
        );
        Ok(id)
    }

    /// Starts a phase 1 negotiation with a peer.
    pub fn connect(
        &mut self,
        remote_addr: SocketAddr,
        local_addr: SocketAddr,
        now: Instant,
    ) -> Result<Phase1Id, ExchangeError> {
        let remote = self
            .policy
            .remote_for(remote_addr.ip())
            .ok_or(ExchangeError::Internal("No configuration for peer"))?;
        let initiator_cookie = self.cookies.generate(remote_addr, local_addr)?;
        let mut phase1 = Phase1::new_initiator(
            &self.policy,
            remote,
            initiator_cookie,
            remote_addr,
            local_addr,
            now,
        )?;
        let message = phase1.initiate(&self.policy)?;
        let id = self.registry.insert_phase1(phase1);
        info!("Initiating phase 1 {} with {}", id, remote_addr);
        self.arm_phase1_resend(id, message.clone(), now);
        self.send(remote_addr, local_addr, message);
        Ok(id)
    }

    fn arm_phase1_resend(&mut self, id: Phase1Id, message: Vec<u8>, now: Instant) {
        let phase1 = match self.registry.phase1_mut(id) {
            Some(phase1) => phase1,
            None => return,
        };
        if let Some(event) = phase1.retransmit.event.take() {
            self.scheduler.cancel(event);
        }
        let (retry_count, retry_interval) =
            (phase1.remote().retry_count, phase1.remote().retry_interval);
        phase1.retransmit.retries_left = retry_count;
        let event = self
            .scheduler
            .schedule(now, retry_interval, Task::Phase1Resend(id));
        phase1.retransmit.event = Some(event);
        phase1.retransmit.message = message;
    }

    fn phase1_established(&mut self, id: Phase1Id, now: Instant) {
        let phase1 = match self.registry.phase1_mut(id) {
            Some(phase1) => phase1,
            None => return,
        };
        phase1.retransmit.message.clear();
        let lifetime = phase1
            .proposal()
            .map(|proposal| proposal.lifetime)
            .unwrap_or(policy::DEFAULT_LIFETIME);
        if let Some(event) = phase1.expire_event.take() {
            self.scheduler.cancel(event);
        }
        phase1.expire_event = Some(self.scheduler.schedule(now, lifetime, Task::Phase1Expire(id)));
        let remote_ip = phase1.remote_addr().ip();
        let send_initial_contact = phase1.role() == Role::Initiator
            && phase1.remote().initial_contact
            && !self.initial_contact_sent.contains(&remote_ip);
        match phase1.peer_identity() {
            Some(peer_id) => info!(
                "Phase 1 {} established with {} ({})",
                id,
                phase1.remote_addr(),
                peer_id
            ),
            None => info!("Phase 1 {} established with {}", id, phase1.remote_addr()),
        }
        if send_initial_contact {
            self.initial_contact_sent.insert(remote_ip);
            let index = phase1.index();
            let body = message::write_notify(
                ProtocolId::ISAKMP,
                &index.to_bytes(),
                NotifyType::INITIAL_CONTACT,
                &[],
            );
            self.send_informational(id, PayloadType::NOTIFICATION, &body);
        }
        for phase2_id in self.registry.unbound_phase2_for(remote_ip) {
            self.start_phase2(phase2_id, id, now);
        }
    }

    /// Requests an IPsec SA for traffic matching `selectors`.
    /// If no phase 1 SA exists yet, one is started and the request waits for it.
    pub fn acquire(
        &mut self,
        selectors: TrafficSelectors,
        remote_addr: SocketAddr,
        local_addr: SocketAddr,
        now: Instant,
    ) -> Result<(), ExchangeError> {
        let remote = match self.policy.remote_for(remote_addr.ip()) {
            Some(remote) => remote,
            None => {
                self.installer.acquire_failed(&selectors);
                return Err(ExchangeError::Internal("No configuration for peer"));
            }
        };
        if remote.passive {
            debug!("Peer {} is passive, ignoring acquire for {}", remote_addr, selectors);
            return Ok(());
        }
        if let Some(existing) = self
            .registry
            .find_phase2_by_selectors(remote_addr.ip(), &selectors)
        {
            debug!("SA for {} is already handled by {}", selectors, existing);
            return Ok(());
        }
        let sainfo = match self.policy.sainfo_for(Some(&selectors)) {
            Some(sainfo) => sainfo.clone(),
            None => {
                self.installer.acquire_failed(&selectors);
                return Err(ExchangeError::Internal("No phase 2 policy for traffic"));
            }
        };
        let phase2 = Phase2::new_initiator(selectors, sainfo, remote_addr, local_addr, now);
        let id = self.registry.insert_phase2(phase2);
        debug!("Acquire for {} started {}", selectors, id);
        if let Some(parent) = self.registry.established_phase1_for(remote_addr.ip()) {
            self.start_phase2(id, parent, now);
            return Ok(());
        }
        if self.registry.active_phase1_for(remote_addr.ip()).is_none() {
            if let Err(err) = self.connect(remote_addr, local_addr, now) {
                warn!("Failed to start phase 1 with {}: {}", remote_addr, err);
            }
        }
        let poll_count = self.policy.phase2_poll_count;
        self.arm_parent_check(id, Some(poll_count), now);
        Ok(())
    }

    fn arm_parent_check(&mut self, id: Phase2Id, polls: Option<usize>, now: Instant) {
        let interval = self.policy.phase2_poll_interval;
        if let Some(phase2) = self.registry.phase2_mut(id) {
            if let Some(polls) = polls {
                phase2.polls_left = polls;
            }
            phase2.poll_event = Some(self.scheduler.schedule(
                now,
                interval,
                Task::Phase2CheckParent(id),
            ));
        }
    }

    fn start_phase2(&mut self, id: Phase2Id, parent: Phase1Id, now: Instant) {
        if let Err(err) = self.try_start_phase2(id, parent, now) {
            warn!("Failed to start phase 2 {}: {}", id, err);
            self.delete_phase2(id, false);
        }
    }

    fn try_start_phase2(
        &mut self,
        id: Phase2Id,
        parent: Phase1Id,
        now: Instant,
    ) -> Result<(), ExchangeError> {
        let registry = &self.registry;
        let message_id =
            cookie::random_message_id(|message_id| registry.message_id_in_use(parent, message_id));
        let phase2 = self
            .registry
            .phase2_mut(id)
            .ok_or(ExchangeError::Internal("Phase 2 disappeared"))?;
        if let Some(event) = phase2.poll_event.take() {
            self.scheduler.cancel(event);
        }
        phase2.bind(parent, message_id)?;
        let protocols = phase2.request_spis()?;
        let (remote_ip, local_ip) = (phase2.remote_addr().ip(), phase2.local_addr().ip());
        let spis = self.reserve_spis(&protocols, remote_ip, local_ip)?;
        let (parent_phase1, phase2) = self
            .registry
            .phase2_with_parent_mut(id)
            .ok_or(ExchangeError::Internal("Phase 1 disappeared"))?;
        phase2.set_spis(spis)?;
        let message = phase2.initiate(&self.policy, parent_phase1)?;
        let (remote_addr, local_addr) = (phase2.remote_addr(), phase2.local_addr());
        info!(
            "Starting quick mode {} over {} for {}",
            id,
            parent,
            phase2.selectors()
        );
        self.arm_phase2_resend(id, message.clone(), now);
        self.send(remote_addr, local_addr, message);
        Ok(())
    }

    fn reserve_spis(
        &mut self,
        protocols: &[IpsecProtocol],
        remote_ip: IpAddr,
        local_ip: IpAddr,
    ) -> Result<Vec<(IpsecProtocol, u32)>, ExchangeError> {
        let mut spis = Vec::with_capacity(protocols.len());
        for protocol in protocols {
            match self.installer.get_spi(*protocol, remote_ip, local_ip) {
                Ok(spi) => spis.push((*protocol, spi)),
                Err(err) => {
                    warn!("Failed to reserve {} SPI: {}", protocol, err);
                    for (protocol, spi) in spis {
                        if let Err(err) = self.installer.delete_sa(protocol, spi, remote_ip, local_ip) {
                            warn!("Failed to release {} SPI {:08x}: {}", protocol, spi, err);
                        }
                    }
                    return Err(ExchangeError::Internal("Failed to reserve SPI"));
                }
            }
        }
        Ok(spis)
    }

    fn arm_phase2_resend(&mut self, id: Phase2Id, message: Vec<u8>, now: Instant) {
        let (retry_count, retry_interval) = match self
            .registry
            .phase2_with_parent_mut(id)
            .map(|(parent, _)| parent.remote())
        {
            Some(remote) => (remote.retry_count, remote.retry_interval),
            None => return,
        };
        let phase2 = match self.registry.phase2_mut(id) {
            Some(phase2) => phase2,
            None => return,
        };
        if let Some(event) = phase2.retransmit.event.take() {
            self.scheduler.cancel(event);
        }
        phase2.retransmit.retries_left = retry_count;
        phase2.retransmit.message = message;
        phase2.retransmit.event =
            Some(self.scheduler.schedule(now, retry_interval, Task::Phase2Resend(id)));
    }

    fn process_quick_mode(
        &mut self,
        message: &InputMessage,
        remote_addr: SocketAddr,
        local_addr: SocketAddr,
        data: &[u8],
        now: Instant,
    ) -> Result<(), ExchangeError> {
        let index = Index::new(
            message.read_initiator_cookie(),
            message.read_responder_cookie(),
        );
        let parent = match self.registry.find_phase1(&index) {
            Some(parent) => parent,
            None => {
                debug!("Quick mode message from {} has unknown cookies {}", remote_addr, index);
                self.send_unprotected_notify(
                    index,
                    remote_addr,
                    local_addr,
                    NotifyType::INVALID_COOKIE,
                );
                return Err("Unknown cookies".into());
            }
        };
        if !self
            .registry
            .phase1(parent)
            .is_some_and(|phase1| phase1.is_established())
        {
            debug!("Quick mode message for {}, which is not established", parent);
            return Err("Phase 1 is not established".into());
        }
        let message_id = message.read_message_id();
        if message_id == 0 {
            return Err("Quick mode message ID is zero".into());
        }
        let id = match self.registry.find_phase2(parent, message_id) {
            Some(id) => id,
            None => {
                let phase2 =
                    Phase2::new_responder(parent, message_id, remote_addr, local_addr, now);
                let id = self.registry.insert_phase2(phase2);
                debug!("Responding to quick mode {:08x} as {}", message_id, id);
                id
            }
        };
        let (parent_phase1, phase2) = self
            .registry
            .phase2_with_parent_mut(id)
            .ok_or(ExchangeError::Internal("Phase 1 disappeared"))?;
        let result = phase2.handle_message(&self.policy, parent_phase1, data);
        let (remote_addr, local_addr) = (phase2.remote_addr(), phase2.local_addr());
        let result = match result {
            Ok(Phase2Outcome::NeedSpi) => self.respond_phase2(id, data, now),
            Ok(Phase2Outcome::Install(reply)) => {
                if let Some(event) = phase2.retransmit.event.take() {
                    self.scheduler.cancel(event);
                }
                phase2.retransmit.message.clear();
                if let Some(reply) = reply {
                    self.received.add(data, &reply, remote_addr, local_addr, now);
                    self.send(remote_addr, local_addr, reply);
                }
                self.install_phase2(id, now)
            }
            Err(err) => Err(err),
        };
        match result {
            Ok(()) => Ok(()),
            Err(err) if err.is_malformed() => {
                debug!("Dropping quick mode message for {}: {}", id, err);
                if self
                    .registry
                    .phase2(id)
                    .is_some_and(|phase2| {
                        phase2.role() == Role::Responder && phase2.state() == Phase2State::Start
                    })
                {
                    self.registry.remove_phase2(id);
                }
                Err(err)
            }
            Err(err) => {
                warn!("Quick mode {} failed: {}", id, err);
                if let Some(notify_type) = err.notify_type() {
                    self.send_phase1_notify(parent, notify_type);
                }
                self.delete_phase2(id, false);
                Err(err)
            }
        }
    }

    fn respond_phase2(&mut self, id: Phase2Id, request: &[u8], now: Instant) -> Result<(), ExchangeError> {
        let phase2 = self
            .registry
            .phase2_mut(id)
            .ok_or(ExchangeError::Internal("Phase 2 disappeared"))?;
        let protocols = phase2.request_spis()?;
        let (remote_ip, local_ip) = (phase2.remote_addr().ip(), phase2.local_addr().ip());
        let spis = self.reserve_spis(&protocols, remote_ip, local_ip)?;
        let (parent, phase2) = self
            .registry
            .phase2_with_parent_mut(id)
            .ok_or(ExchangeError::Internal("Phase 1 disappeared"))?;
        phase2.set_spis(spis)?;
        let reply = phase2.respond(&self.policy, parent)?;
        let (remote_addr, local_addr) = (phase2.remote_addr(), phase2.local_addr());
        self.received.add(request, &reply, remote_addr, local_addr, now);
        self.arm_phase2_resend(id, reply.clone(), now);
        self.send(remote_addr, local_addr, reply);
        Ok(())
    }

    fn install_phase2(&mut self, id: Phase2Id, now: Instant) -> Result<(), ExchangeError> {
        let (parent, phase2) = self
            .registry
            .phase2_with_parent_mut(id)
            .ok_or(ExchangeError::Internal("Phase 1 disappeared"))?;
        let sa = phase2.negotiated_sa(parent)?;
        if let Err(err) = self.installer.add_sa(&sa) {
            warn!("Failed to install SA {}: {}", sa, err);
            return Err(ExchangeError::Internal("Failed to install SA"));
        }
        phase2.established();
        phase2.expire_event = Some(self.scheduler.schedule(now, sa.lifetime, Task::Phase2Expire(id)));
        info!("Phase 2 {} established: {}", id, sa);
        Ok(())
    }

    fn process_informational(
        &mut self,
        message: &InputMessage,
        remote_addr: SocketAddr,
        data: &[u8],
        now: Instant,
    ) -> Result<(), ExchangeError> {
        let index = Index::new(
            message.read_initiator_cookie(),
            message.read_responder_cookie(),
        );
        let id = match self.registry.find_phase1(&index).or_else(|| {
            self.registry
                .find_phase1_awaiting_responder(index.initiator_cookie)
        }) {
            Some(id) => id,
            None => {
                debug!("Informational message from {} has unknown cookies {}", remote_addr, index);
                return Err("Unknown cookies".into());
            }
        };
        let phase1 = self
            .registry
            .phase1(id)
            .ok_or(ExchangeError::Internal("Phase 1 disappeared"))?;
        let protected = phase1.crypto().is_some();
        let data = phase1.open_informational(&self.policy, data)?;
        let message = InputMessage::from_datagram(&data)?;
        let payloads = message.payloads()?;
        let received = ReceivedPayloads::collect(&payloads)?;
        for notify in received.notify.iter() {
            let notify = notify.to_notify()?;
            let notify_type = notify.notify_type();
            if notify_type.is_error() {
                warn!("Peer {} reported {} for {}", remote_addr, notify_type, id);
            } else if notify_type == NotifyType::INITIAL_CONTACT && protected {
                self.purge_peer(id, remote_addr.ip());
            } else {
                debug!("Peer {} sent notification {} for {}", remote_addr, notify_type, id);
            }
        }
        if !protected {
            if !received.delete.is_empty() {
                debug!("Ignoring unprotected Delete payload from {}", remote_addr);
            }
            return Ok(());
        }
        for delete in received.delete.iter() {
            let delete = delete.to_delete()?;
            match ProtocolId::from_u8(delete.protocol_id()) {
                Ok(ProtocolId::ISAKMP) => {
                    for spi in delete.iter_spi() {
                        let deleted = Index::from_bytes(spi)
                            .and_then(|deleted| self.registry.find_phase1(&deleted));
                        if let Some(deleted) = deleted {
                            info!("Peer {} deleted phase 1 {}", remote_addr, deleted);
                            self.expire_phase1(deleted, now);
                        }
                    }
                }
                Ok(ProtocolId::IPSEC_AH) | Ok(ProtocolId::IPSEC_ESP) => {
                    let protocol = if delete.protocol_id() == ProtocolId::IPSEC_AH.protocol_id() {
                        IpsecProtocol::Ah
                    } else {
                        IpsecProtocol::Esp
                    };
                    for spi in delete.iter_spi() {
                        let spi = match <[u8; 4]>::try_from(spi) {
                            Ok(spi) => u32::from_be_bytes(spi),
                            Err(_) => {
                                debug!("Unsupported SPI size {} in Delete payload", spi.len());
                                continue;
                            }
                        };
                        for deleted in
                            self.registry
                                .find_phase2_by_spi(remote_addr.ip(), protocol, spi)
                        {
                            info!("Peer {} deleted {} SA {:08x} ({})", remote_addr, protocol, spi, deleted);
                            self.delete_phase2(deleted, false);
                        }
                    }
                }
                _ => {
                    debug!("Ignoring Delete payload for protocol {}", delete.protocol_id());
                }
            }
        }
        Ok(())
    }

    /// Drops all other state for a peer that just restarted.
    fn purge_peer(&mut self, keep: Phase1Id, remote_ip: IpAddr) {
        for id in self.registry.phase1_for_peer(remote_ip) {
            if id != keep {
                info!("Peer {} restarted, removing {}", remote_ip, id);
                self.delete_phase1(id, false);
            }
        }
    }

    fn send_unprotected_notify(
        &mut self,
        index: Index,
        remote_addr: SocketAddr,
        local_addr: SocketAddr,
        notify_type: NotifyType,
    ) {
        let mut writer = MessageWriter::new(
            index.initiator_cookie,
            index.responder_cookie,
            ExchangeType::INFORMATIONAL,
            Flags::NONE,
            cookie::random_message_id(|_| false),
        );
        let body = message::write_notify(
            ProtocolId::ISAKMP,
            &index.to_bytes(),
            notify_type,
            &[],
        );
        if let Err(err) = writer.add_payload(PayloadType::NOTIFICATION, &body) {
            warn!("Failed to build {} notification: {}", notify_type, err);
            return;
        }
        self.send(remote_addr, local_addr, writer.into_bytes());
    }

    fn send_phase1_notify(&mut self, id: Phase1Id, notify_type: NotifyType) {
        let index = match self.registry.phase1(id) {
            Some(phase1) => phase1.index(),
            None => return,
        };
        let body = message::write_notify(
            ProtocolId::ISAKMP,
            &index.to_bytes(),
            notify_type,
            &[],
        );
        self.send_informational(id, PayloadType::NOTIFICATION, &body);
    }

    fn send_informational(&mut self, id: Phase1Id, payload_type: PayloadType, body: &[u8]) {
        let phase1 = match self.registry.phase1(id) {
            Some(phase1) => phase1,
            None => return,
        };
        let registry = &self.registry;
        let message_id = cookie::random_message_id(|message_id| registry.message_id_in_use(id, message_id));
        match phase1.informational(&self.policy, message_id, payload_type, body) {
            Ok(message) => {
                let (remote_addr, local_addr) = (phase1.remote_addr(), phase1.local_addr());
                self.send(remote_addr, local_addr, message);
            }
            Err(err) => warn!("Failed to build informational message for {}: {}", id, err),
        }
    }

    /// Tears down a phase 1 SA and all its children.
    /// With `notify`, the peer is told about every deleted established SA.
    pub fn delete_phase1(&mut self, id: Phase1Id, notify: bool) {
        for child in self.registry.children(id) {
            self.delete_phase2(child, notify);
        }
        let phase1 = match self.registry.phase1(id) {
            Some(phase1) => phase1,
            None => return,
        };
        if notify && phase1.crypto().is_some() {
            let index = phase1.index();
            let body = message::write_delete(ProtocolId::ISAKMP, 16, &[&index.to_bytes()]);
            self.send_informational(id, PayloadType::DELETE, &body);
        }
        if let Some(phase1) = self.registry.remove_phase1(id) {
            for event in [phase1.retransmit.event, phase1.expire_event].into_iter().flatten() {
                self.scheduler.cancel(event);
            }
            info!("Deleted phase 1 {} ({}) with {}", id, phase1.index(), phase1.remote_addr());
        }
    }

    /// Marks a phase 1 SA as unusable and schedules its removal.
    fn expire_phase1(&mut self, id: Phase1Id, now: Instant) {
        let phase1 = match self.registry.phase1_mut(id) {
            Some(phase1) => phase1,
            None => return,
        };
        for event in [phase1.retransmit.event.take(), phase1.expire_event.take()]
            .into_iter()
            .flatten()
        {
            self.scheduler.cancel(event);
        }
        phase1.expire();
        phase1.expire_event = Some(self.scheduler.schedule(now, TEARDOWN_DELAY, Task::Phase1Teardown(id)));
        debug!("Phase 1 {} expired", id);
    }

    /// Removes a phase 2 negotiation, releasing its SPIs or installed SAs.
    pub fn delete_phase2(&mut self, id: Phase2Id, notify: bool) {
        let phase2 = match self.registry.remove_phase2(id) {
            Some(phase2) => phase2,
            None => return,
        };
        for event in [
            phase2.retransmit.event,
            phase2.expire_event,
            phase2.poll_event,
        ]
        .into_iter()
        .flatten()
        {
            self.scheduler.cancel(event);
        }
        let (remote_ip, local_ip) = (phase2.remote_addr().ip(), phase2.local_addr().ip());
        if phase2.is_installed() {
            if let (Some(protocol), Some(local_spi), Some(peer_spi)) =
                (phase2.protocol(), phase2.local_spi(), phase2.peer_spi())
            {
                if let Err(err) = self.installer.delete_sa(protocol, local_spi, remote_ip, local_ip) {
                    debug!("Failed to delete inbound SA {:08x}: {}", local_spi, err);
                }
                if let Err(err) = self.installer.delete_sa(protocol, peer_spi, local_ip, remote_ip) {
                    debug!("Failed to delete outbound SA {:08x}: {}", peer_spi, err);
                }
                if notify {
                    if let Some(parent) = phase2.parent() {
                        let body = message::write_delete(
                            protocol.protocol_id(),
                            4,
                            &[&local_spi.to_be_bytes()],
                        );
                        self.send_informational(parent, PayloadType::DELETE, &body);
                    }
                }
            }
        } else {
            for (protocol, spi) in phase2.reserved_spis() {
                if let Err(err) = self.installer.delete_sa(*protocol, *spi, remote_ip, local_ip) {
                    debug!("Failed to release SPI {:08x}: {}", spi, err);
                }
            }
        }
        debug!("Deleted phase 2 {} ({})", id, phase2.selectors());
    }

    /// Deletes every SA, telling peers about it.
    pub fn shutdown(&mut self) {
        for id in self.registry.phase1_ids() {
            self.delete_phase1(id, true);
        }
        for id in self.registry.phase2_ids() {
            self.delete_phase2(id, false);
        }
        self.scheduler.clear();
        self.received.clear();
    }

    /// Runs all timers that are due.
    pub fn process_timers(&mut self, now: Instant) {
        while let Some((_, task)) = self.scheduler.pop_expired(now) {
            trace!("Running timer task {}", task);
            match task {
                Task::Phase1Resend(id) => self.resend_phase1(id, now),
                Task::Phase1Expire(id) => {
                    if let Some(phase1) = self.registry.phase1_mut(id) {
                        phase1.expire_event = None;
                        info!("Phase 1 {} reached its lifetime", id);
                    }
                    self.expire_phase1(id, now);
                }
                Task::Phase1Teardown(id) => self.teardown_phase1(id, now),
                Task::Phase2Resend(id) => self.resend_phase2(id, now),
                Task::Phase2Expire(id) => {
                    if let Some(phase2) = self.registry.phase2_mut(id) {
                        phase2.expire();
                        phase2.expire_event =
                            Some(self.scheduler.schedule(now, TEARDOWN_DELAY, Task::Phase2Teardown(id)));
                        info!("Phase 2 {} reached its lifetime", id);
                    }
                }
                Task::Phase2Teardown(id) => {
                    if let Some(phase2) = self.registry.phase2_mut(id) {
                        phase2.expire_event = None;
                    }
                    self.delete_phase2(id, true);
                }
                Task::Phase2CheckParent(id) => self.check_parent(id, now),
                Task::SweepCache => {
                    let removed = self.received.sweep(now);
                    if removed > 0 {
                        trace!("Removed {} entries from received cache", removed);
                    }
                    self.scheduler
                        .schedule(now, self.received.lifetime(), Task::SweepCache);
                }
            }
        }
    }

    fn resend_phase1(&mut self, id: Phase1Id, now: Instant) {
        let phase1 = match self.registry.phase1_mut(id) {
            Some(phase1) => phase1,
            None => return,
        };
        phase1.retransmit.event = None;
        if phase1.retransmit.retries_left == 0 {
            warn!("Phase 1 {} with {} timed out", id, phase1.remote_addr());
            self.delete_phase1(id, false);
            return;
        }
        phase1.retransmit.retries_left -= 1;
        let message = phase1.retransmit.message.clone();
        let (remote_addr, local_addr) = (phase1.remote_addr(), phase1.local_addr());
        let interval = phase1.remote().retry_interval;
        phase1.retransmit.event = Some(self.scheduler.schedule(now, interval, Task::Phase1Resend(id)));
        debug!("Resending phase 1 {} message to {}", id, remote_addr);
        self.send(remote_addr, local_addr, message);
    }

    fn teardown_phase1(&mut self, id: Phase1Id, now: Instant) {
        if self.registry.children(id).is_empty() {
            if let Some(phase1) = self.registry.phase1_mut(id) {
                phase1.expire_event = None;
            }
            self.delete_phase1(id, true);
        } else if let Some(phase1) = self.registry.phase1_mut(id) {
            trace!("Phase 1 {} still has children, postponing teardown", id);
            phase1.expire_event =
                Some(self.scheduler.schedule(now, TEARDOWN_DELAY, Task::Phase1Teardown(id)));
        }
    }

    fn resend_phase2(&mut self, id: Phase2Id, now: Instant) {
        let interval = match self
            .registry
            .phase2_with_parent_mut(id)
            .map(|(parent, _)| parent.remote().retry_interval)
        {
            Some(interval) => interval,
            None => {
                self.delete_phase2(id, false);
                return;
            }
        };
        let phase2 = match self.registry.phase2_mut(id) {
            Some(phase2) => phase2,
            None => return,
        };
        phase2.retransmit.event = None;
        if phase2.retransmit.retries_left == 0 {
            warn!("Quick mode {} with {} timed out", id, phase2.remote_addr());
            self.delete_phase2(id, false);
            return;
        }
        phase2.retransmit.retries_left -= 1;
        let message = phase2.retransmit.message.clone();
        let (remote_addr, local_addr) = (phase2.remote_addr(), phase2.local_addr());
        phase2.retransmit.event = Some(self.scheduler.schedule(now, interval, Task::Phase2Resend(id)));
        debug!("Resending quick mode {} message to {}", id, remote_addr);
        self.send(remote_addr, local_addr, message);
    }

    fn check_parent(&mut self, id: Phase2Id, now: Instant) {
        let (remote_addr, local_addr, polls_left) = match self.registry.phase2_mut(id) {
            Some(phase2) if phase2.parent().is_none() => {
                phase2.poll_event = None;
                (phase2.remote_addr(), phase2.local_addr(), phase2.polls_left)
            }
            Some(phase2) => {
                phase2.poll_event = None;
                return;
            }
            None => return,
        };
        if let Some(parent) = self.registry.established_phase1_for(remote_addr.ip()) {
            self.start_phase2(id, parent, now);
            return;
        }
        if polls_left == 0 {
            warn!("No phase 1 SA with {} became available for {}", remote_addr, id);
            if let Some(phase2) = self.registry.phase2(id) {
                let selectors = *phase2.selectors();
                self.delete_phase2(id, false);
                self.installer.acquire_failed(&selectors);
            }
            return;
        }
        if self.registry.active_phase1_for(remote_addr.ip()).is_none() {
            if let Err(err) = self.connect(remote_addr, local_addr, now) {
                warn!("Failed to start phase 1 with {}: {}", remote_addr, err);
            }
        }
        self.arm_parent_check(id, Some(polls_left - 1), now);
    }
}

#[cfg(test)]
mod tests {
    use super::super::crypto::{DhGroup, EncryptionAlgorithm, HashAlgorithm};
    use super::super::installer::{InstallerError, LoggingInstaller, NegotiatedSa};
    use super::super::phase2::Phase2State;
    use super::super::policy::{
        AuthMethod, Encapsulation, EspCipher, IntegrityAlgorithm, IpsecTransform, Phase1Proposal,
        PskTable, RemoteConfig, Sainfo, Subnet,
    };
    use super::*;

    const ADDR_A: &str = "192.0.2.1:500";
    const ADDR_B: &str = "192.0.2.2:500";

    fn addr(value: &str) -> SocketAddr {
        value.parse().unwrap()
    }

    fn policy(peer: &str, encryption: EncryptionAlgorithm) -> Policy {
        let remote = RemoteConfig::new(
            None,
            vec![Phase1Proposal {
                encryption,
                hash: HashAlgorithm::Sha1,
                auth: AuthMethod::PreSharedKey,
                dh_group: DhGroup::Modp1024,
                lifetime: Duration::from_secs(28800),
            }],
        );
        let sainfo = Sainfo {
            selectors: None,
            transforms: vec![IpsecTransform::esp(
                EspCipher::Aes(16),
                Some(IntegrityAlgorithm::HmacSha1),
            )],
            encapsulation: Encapsulation::Tunnel,
            pfs_group: None,
            lifetime: Duration::from_secs(3600),
        };
        let mut psk = PskTable::new();
        psk.add(peer, b"secret");
        Policy::new(vec![remote], vec![sainfo], psk, None)
    }

    fn engine(peer: &str, now: Instant) -> Engine<LoggingInstaller> {
        Engine::new(
            policy(peer, EncryptionAlgorithm::Aes(16)),
            LoggingInstaller::new(),
            now,
        )
        .unwrap()
    }

    fn host_selectors(local: &str, remote: &str) -> TrafficSelectors {
        TrafficSelectors {
            local: Subnet::host(addr(local).ip()),
            remote: Subnet::host(addr(remote).ip()),
        }
    }

    /// Delivers queued datagrams between two engines until both are quiet.
    fn shuttle(
        a: &mut Engine<LoggingInstaller>,
        b: &mut Engine<LoggingInstaller>,
        now: Instant,
    ) -> usize {
        let mut delivered = 0;
        loop {
            let from_a = a.take_outgoing();
            let from_b = b.take_outgoing();
            if from_a.is_empty() && from_b.is_empty() {
                return delivered;
            }
            for datagram in from_a {
                delivered += 1;
                let _ = b.process_datagram(datagram.local_addr, datagram.remote_addr, &datagram.bytes, now);
            }
            for datagram in from_b {
                delivered += 1;
                let _ = a.process_datagram(datagram.local_addr, datagram.remote_addr, &datagram.bytes, now);
            }
        }
    }

    fn established_pair(now: Instant) -> (Engine<LoggingInstaller>, Engine<LoggingInstaller>) {
        let mut a = engine("192.0.2.2", now);
        let mut b = engine("192.0.2.1", now);
        a.acquire(host_selectors(ADDR_A, ADDR_B), addr(ADDR_B), addr(ADDR_A), now)
            .unwrap();
        shuttle(&mut a, &mut b, now);
        (a, b)
    }

    #[test]
    fn acquire_negotiates_both_phases() {
        let now = Instant::now();
        let (a, b) = established_pair(now);
        assert_eq!(a.registry().phase1_count(), 1);
        assert_eq!(b.registry().phase1_count(), 1);
        let phase1_a = a.registry().phase1(a.registry().phase1_ids()[0]).unwrap();
        assert_eq!(phase1_a.state(), Phase1State::Established);
        let installed_a = a.installer().installed();
        let installed_b = b.installer().installed();
        assert_eq!(installed_a.len(), 1);
        assert_eq!(installed_b.len(), 1);
        assert_eq!(installed_a[0].inbound.spi, installed_b[0].outbound.spi);
        assert_eq!(installed_a[0].outbound.spi, installed_b[0].inbound.spi);
        assert_eq!(
            installed_a[0].inbound.encryption_key,
            installed_b[0].outbound.encryption_key
        );
        assert_eq!(
            installed_a[0].outbound.integrity_key,
            installed_b[0].inbound.integrity_key
        );
        let phase2_b = b.registry().phase2(b.registry().phase2_ids()[0]).unwrap();
        assert_eq!(phase2_b.state(), Phase2State::Established);
    }

    #[test]
    fn retransmitted_message_gets_same_reply() {
        let now = Instant::now();
        let mut a = engine("192.0.2.2", now);
        let mut b = engine("192.0.2.1", now);
        a.connect(addr(ADDR_B), addr(ADDR_A), now).unwrap();
        let first = a.take_outgoing().pop().unwrap();
        b.process_datagram(addr(ADDR_A), addr(ADDR_B), &first.bytes, now)
            .unwrap();
        let reply = b.take_outgoing().pop().unwrap();
        b.process_datagram(addr(ADDR_A), addr(ADDR_B), &first.bytes, now)
            .unwrap();
        let replay = b.take_outgoing();
        assert_eq!(replay.len(), 1);
        assert_eq!(replay[0].bytes, reply.bytes);
        assert_eq!(b.registry().phase1_count(), 1);
    }

    /// Hands out one SPI, then fails; releases always fail too.
    #[derive(Default)]
    struct ExhaustedInstaller {
        reserved: usize,
        released: Vec<(IpsecProtocol, u32)>,
    }

    impl SaInstaller for ExhaustedInstaller {
        fn get_spi(
            &mut self,
            _protocol: IpsecProtocol,
            _src: IpAddr,
            _dst: IpAddr,
        ) -> Result<u32, InstallerError> {
            if self.reserved > 0 {
                return Err("SPI range exhausted".into());
            }
            self.reserved += 1;
            Ok(0x1000)
        }

        fn add_sa(&mut self, _sa: &NegotiatedSa) -> Result<(), InstallerError> {
            Ok(())
        }

        fn delete_sa(
            &mut self,
            protocol: IpsecProtocol,
            spi: u32,
            _src: IpAddr,
            _dst: IpAddr,
        ) -> Result<(), InstallerError> {
            self.released.push((protocol, spi));
            Err("SA is gone".into())
        }

        fn acquire_failed(&mut self, _selectors: &TrafficSelectors) {}
    }

    #[test]
    fn failed_spi_reservation_releases_earlier_spis() {
        let now = Instant::now();
        let mut engine = Engine::new(
            policy("192.0.2.2", EncryptionAlgorithm::Aes(16)),
            ExhaustedInstaller::default(),
            now,
        )
        .unwrap();
        let remote_ip = addr(ADDR_B).ip();
        let local_ip = addr(ADDR_A).ip();
        let result = engine.reserve_spis(
            &[IpsecProtocol::Esp, IpsecProtocol::Ah],
            remote_ip,
            local_ip,
        );
        assert!(result.is_err());
        assert_eq!(engine.installer.released, vec![(IpsecProtocol::Esp, 0x1000)]);
    }

    #[test]
    fn malformed_first_message_leaves_no_state() {
        let now = Instant::now();
        let mut a = engine("192.0.2.2", now);
        let mut b = engine("192.0.2.1", now);
        a.connect(addr(ADDR_B), addr(ADDR_A), now).unwrap();
        let first = a.take_outgoing().pop().unwrap();
        let mut header_only = first.bytes[..28].to_vec();
        header_only[16] = 0;
        header_only[24..28].copy_from_slice(&28u32.to_be_bytes());
        let err = b
            .process_datagram(addr(ADDR_A), addr(ADDR_B), &header_only, now)
            .err()
            .unwrap();
        assert!(err.is_malformed());
        assert!(b.take_outgoing().is_empty());
        assert_eq!(b.registry().phase1_count(), 0);

        b.process_datagram(addr(ADDR_A), addr(ADDR_B), &first.bytes, now)
            .unwrap();
        assert_eq!(b.take_outgoing().len(), 1);
        assert_eq!(b.registry().phase1_count(), 1);
    }

    #[test]
    fn retransmitted_quick_mode_gets_same_reply() {
        let now = Instant::now();
        let (mut a, mut b) = established_pair(now);
        let subnets = TrafficSelectors {
            local: Subnet::parse("10.1.0.0/16").unwrap(),
            remote: Subnet::parse("10.2.0.0/16").unwrap(),
        };
        a.acquire(subnets, addr(ADDR_B), addr(ADDR_A), now).unwrap();
        let quick_mode = a.take_outgoing().pop().unwrap();
        b.process_datagram(addr(ADDR_A), addr(ADDR_B), &quick_mode.bytes, now)
            .unwrap();
        let reply = b.take_outgoing();
        assert_eq!(reply.len(), 1);
        b.process_datagram(addr(ADDR_A), addr(ADDR_B), &quick_mode.bytes, now)
            .unwrap();
        let replay = b.take_outgoing();
        assert_eq!(replay.len(), 1);
        assert_eq!(replay[0].bytes, reply[0].bytes);
        assert_eq!(b.registry().phase2_count(), 2);

        a.process_datagram(addr(ADDR_B), addr(ADDR_A), &replay[0].bytes, now)
            .unwrap();
        shuttle(&mut a, &mut b, now);
        assert_eq!(a.installer().installed().len(), 2);
        assert_eq!(b.installer().installed().len(), 2);
    }

    #[test]
    fn initial_contact_replaces_old_sas() {
        let now = Instant::now();
        let (_a, mut b) = established_pair(now);
        let old_id = b.registry().phase1_ids()[0];
        assert_eq!(b.installer().installed().len(), 1);

        // The peer restarts and negotiates from scratch.
        let mut restarted = engine("192.0.2.2", now);
        restarted
            .acquire(host_selectors(ADDR_A, ADDR_B), addr(ADDR_B), addr(ADDR_A), now)
            .unwrap();
        shuttle(&mut restarted, &mut b, now);
        assert_eq!(b.registry().phase1_count(), 1);
        assert_ne!(b.registry().phase1_ids()[0], old_id);
        assert_eq!(b.registry().phase2_count(), 1);
        let installed_b = b.installer().installed();
        let installed_restarted = restarted.installer().installed();
        assert_eq!(installed_b.len(), 1);
        assert_eq!(installed_restarted.len(), 1);
        assert_eq!(installed_b[0].inbound.spi, installed_restarted[0].outbound.spi);
    }

    #[test]
    fn unprotected_delete_is_ignored() {
        let now = Instant::now();
        let mut a = engine("192.0.2.2", now);
        let mut b = engine("192.0.2.1", now);
        a.connect(addr(ADDR_B), addr(ADDR_A), now).unwrap();
        let first = a.take_outgoing().pop().unwrap();
        b.process_datagram(addr(ADDR_A), addr(ADDR_B), &first.bytes, now)
            .unwrap();
        b.take_outgoing();
        let id = b.registry().phase1_ids()[0];
        let index = b.registry().phase1(id).unwrap().index();

        let mut writer = MessageWriter::new(
            index.initiator_cookie,
            index.responder_cookie,
            ExchangeType::INFORMATIONAL,
            Flags::NONE,
            0x1234,
        );
        let body = message::write_delete(ProtocolId::ISAKMP, 16, &[&index.to_bytes()]);
        writer.add_payload(PayloadType::DELETE, &body).unwrap();
        b.process_datagram(addr(ADDR_A), addr(ADDR_B), &writer.into_bytes(), now)
            .unwrap();
        assert!(b.take_outgoing().is_empty());
        assert_eq!(b.registry().phase1_count(), 1);
        assert_ne!(b.registry().phase1(id).unwrap().state(), Phase1State::Expired);
        b.process_timers(now + Duration::from_secs(1));
        assert_eq!(b.registry().phase1_count(), 1);
    }

    #[test]
    fn no_proposal_chosen_is_notified() {
        let now = Instant::now();
        let mut a = engine("192.0.2.2", now);
        let mut b = Engine::new(
            policy("192.0.2.1", EncryptionAlgorithm::TripleDes),
            LoggingInstaller::new(),
            now,
        )
        .unwrap();
        a.connect(addr(ADDR_B), addr(ADDR_A), now).unwrap();
        let first = a.take_outgoing().pop().unwrap();
        let err = b
            .process_datagram(addr(ADDR_A), addr(ADDR_B), &first.bytes, now)
            .err()
            .unwrap();
        assert_eq!(err.notify_type(), Some(NotifyType::NO_PROPOSAL_CHOSEN));
        let outgoing = b.take_outgoing();
        assert_eq!(outgoing.len(), 1);
        let message = InputMessage::from_datagram(&outgoing[0].bytes).unwrap();
        assert_eq!(message.read_exchange_type(), ExchangeType::INFORMATIONAL);
        assert_eq!(b.registry().phase1_count(), 0);
        // The initiator only logs the unprotected notification.
        a.process_datagram(addr(ADDR_B), addr(ADDR_A), &outgoing[0].bytes, now)
            .unwrap();
        assert_eq!(a.registry().phase1_count(), 1);
    }

    #[test]
    fn phase1_retransmission_gives_up() {
        let now = Instant::now();
        let mut a = engine("192.0.2.2", now);
        a.connect(addr(ADDR_B), addr(ADDR_A), now).unwrap();
        let first = a.take_outgoing().pop().unwrap();
        let mut resent = 0;
        for i in 1..=5 {
            a.process_timers(now + Duration::from_secs(10 * i));
            let outgoing = a.take_outgoing();
            assert_eq!(outgoing.len(), 1);
            assert_eq!(outgoing[0].bytes, first.bytes);
            resent += 1;
        }
        assert_eq!(resent, 5);
        assert_eq!(a.registry().phase1_count(), 1);
        a.process_timers(now + Duration::from_secs(60));
        assert!(a.take_outgoing().is_empty());
        assert_eq!(a.registry().phase1_count(), 0);
    }

    #[test]
    fn acquire_waits_for_phase1_then_fails() {
        let now = Instant::now();
        let mut a = engine("192.0.2.2", now);
        let selectors = host_selectors(ADDR_A, ADDR_B);
        a.acquire(selectors, addr(ADDR_B), addr(ADDR_A), now).unwrap();
        assert_eq!(a.registry().phase1_count(), 1);
        assert_eq!(a.registry().phase2_count(), 1);
        let phase2_id = a.registry().phase2_ids()[0];
        assert_eq!(a.registry().phase2(phase2_id).unwrap().parent(), None);
        // A repeated acquire for the same traffic is absorbed.
        a.acquire(selectors, addr(ADDR_B), addr(ADDR_A), now).unwrap();
        assert_eq!(a.registry().phase2_count(), 1);
        for i in 1..=30 {
            a.process_timers(now + Duration::from_secs(i));
            assert!(a.installer().failed_acquires().is_empty());
        }
        a.process_timers(now + Duration::from_secs(31));
        assert_eq!(a.installer().failed_acquires(), &[selectors]);
        assert_eq!(a.registry().phase2_count(), 0);
    }

    #[test]
    fn acquire_without_peer_config() {
        let now = Instant::now();
        let remote = RemoteConfig::new(
            Some(addr(ADDR_B).ip()),
            vec![Phase1Proposal {
                encryption: EncryptionAlgorithm::Aes(16),
                hash: HashAlgorithm::Sha1,
                auth: AuthMethod::PreSharedKey,
                dh_group: DhGroup::Modp1024,
                lifetime: Duration::from_secs(28800),
            }],
        );
        let policy = Policy::new(vec![remote], vec![], PskTable::new(), None);
        let mut a = Engine::new(policy, LoggingInstaller::new(), now).unwrap();
        let selectors = host_selectors(ADDR_A, "192.0.2.3:500");
        assert!(a
            .acquire(selectors, addr("192.0.2.3:500"), addr(ADDR_A), now)
            .is_err());
        assert_eq!(a.installer().failed_acquires(), &[selectors]);
        assert_eq!(a.registry().phase1_count(), 0);
    }

    #[test]
    fn deleting_phase1_removes_children() {
        let now = Instant::now();
        let (mut a, mut b) = established_pair(now);
        let subnets = TrafficSelectors {
            local: Subnet::parse("10.1.0.0/16").unwrap(),
            remote: Subnet::parse("10.2.0.0/16").unwrap(),
        };
        a.acquire(subnets, addr(ADDR_B), addr(ADDR_A), now).unwrap();
        shuttle(&mut a, &mut b, now);
        assert_eq!(a.installer().installed().len(), 2);
        assert_eq!(b.installer().installed().len(), 2);

        let id = a.registry().phase1_ids()[0];
        a.delete_phase1(id, true);
        assert_eq!(a.registry().phase1_count(), 0);
        assert_eq!(a.registry().phase2_count(), 0);
        assert!(a.installer().installed().is_empty());
        let outgoing = a.take_outgoing();
        assert_eq!(outgoing.len(), 3);
        for datagram in outgoing {
            let _ = b.process_datagram(datagram.local_addr, datagram.remote_addr, &datagram.bytes, now);
        }
        assert!(b.installer().installed().is_empty());
        assert_eq!(b.registry().phase2_count(), 0);
        let b_id = b.registry().phase1_ids()[0];
        assert_eq!(b.registry().phase1(b_id).unwrap().state(), Phase1State::Expired);
        b.process_timers(now + Duration::from_secs(1));
        assert_eq!(b.registry().phase1_count(), 0);
    }

    #[test]
    fn phase2_expires_after_lifetime() {
        let now = Instant::now();
        let (mut a, _b) = established_pair(now);
        assert_eq!(a.installer().installed().len(), 1);
        a.process_timers(now + Duration::from_secs(3600));
        assert_eq!(a.registry().phase2_count(), 1);
        a.process_timers(now + Duration::from_secs(3601));
        assert_eq!(a.registry().phase2_count(), 0);
        assert!(a.installer().installed().is_empty());
        assert_eq!(a.registry().phase1_count(), 1);
    }

    #[test]
    fn quick_mode_with_unknown_cookies() {
        let now = Instant::now();
        let (mut a, _b) = established_pair(now);
        let mut c = engine("192.0.2.1", now);
        let subnets = TrafficSelectors {
            local: Subnet::parse("10.1.0.0/16").unwrap(),
            remote: Subnet::parse("10.2.0.0/16").unwrap(),
        };
        a.acquire(subnets, addr(ADDR_B), addr(ADDR_A), now).unwrap();
        let quick_mode = a.take_outgoing().pop().unwrap();
        assert!(c
            .process_datagram(addr(ADDR_A), addr(ADDR_B), &quick_mode.bytes, now)
            .is_err());
        let outgoing = c.take_outgoing();
        assert_eq!(outgoing.len(), 1);
        let message = InputMessage::from_datagram(&outgoing[0].bytes).unwrap();
        assert_eq!(message.read_exchange_type(), ExchangeType::INFORMATIONAL);
        assert!(!message.is_encrypted());
    }

    #[test]
    fn snapshot_lists_phase1_and_timers() {
        let now = Instant::now();
        let (a, _b) = established_pair(now);
        let snapshot = a.snapshot(now + Duration::from_secs(5));
        assert_eq!(snapshot.phase1.len(), 1);
        let phase1 = &snapshot.phase1[0];
        assert_eq!(phase1.role, Role::Initiator);
        assert_eq!(phase1.mode, ExchangeMode::Main);
        assert_eq!(phase1.state, Phase1State::Established);
        assert_eq!(phase1.children, 1);
        assert_eq!(phase1.version, 0x10);
        assert!(snapshot
            .events
            .iter()
            .any(|event| matches!(event.task, Task::Phase1Expire(_))));
        assert!(snapshot
            .events
            .iter()
            .all(|event| event.remaining <= Duration::from_secs(28800)));
    }

    #[test]
    fn shutdown_notifies_peer() {
        let now = Instant::now();
        let (mut a, mut b) = established_pair(now);
        a.shutdown();
        assert_eq!(a.registry().phase1_count(), 0);
        assert!(a.next_deadline().is_none());
        shuttle(&mut a, &mut b, now);
        assert!(b.installer().installed().is_empty());
    }
}
