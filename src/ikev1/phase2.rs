use std::{fmt, mem, net::SocketAddr, time::Instant};

use log::{debug, trace, warn};

use super::crypto::{self, DHTransform, DHTransformType, SecretBytes};
use super::exchange::{self, ExchangeError, ReceivedPayloads, Retransmission, Role};
use super::installer::{NegotiatedSa, SaDirection};
use super::message::{
    ExchangeType, Flags, Identification, InputMessage, MessageWriter, NotifyType, PayloadType,
};
use super::phase1::Phase1;
use super::policy::{IpsecProtocol, Policy, Sainfo, Subnet, TrafficSelectors};
use super::registry::Phase1Id;
use super::sa::{self, ChosenPhase2};
use super::schedule::EventId;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Phase2State {
    Start,
    Status2,
    GetSpiSent,
    GetSpiDone,
    Msg1Sent,
    Status6,
    AddSa,
    Established,
    Expired,
}

impl fmt::Display for Phase2State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => write!(f, "START"),
            Self::Status2 => write!(f, "STATUS2"),
            Self::GetSpiSent => write!(f, "GETSPISENT"),
            Self::GetSpiDone => write!(f, "GETSPIDONE"),
            Self::Msg1Sent => write!(f, "MSG1SENT"),
            Self::Status6 => write!(f, "STATUS6"),
            Self::AddSa => write!(f, "ADDSA"),
            Self::Established => write!(f, "ESTABLISHED"),
            Self::Expired => write!(f, "EXPIRED"),
        }
    }
}

/// Result of processing a quick mode message.
pub enum Phase2Outcome {
    /// Inbound SPIs are needed before the exchange can continue.
    NeedSpi,
    /// The exchange is complete, with an optional final message to the peer.
    Install(Option<Vec<u8>>),
}

/// One quick mode negotiation, bound to a phase 1 SA once it's established.
pub struct Phase2 {
    role: Role,
    state: Phase2State,
    parent: Option<Phase1Id>,
    message_id: u32,
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    selectors: TrafficSelectors,
    send_ids: bool,
    sainfo: Option<Sainfo>,
    created: Instant,
    local_spis: Vec<(IpsecProtocol, u32)>,
    chosen: Option<ChosenPhase2>,
    nonce_local: Vec<u8>,
    nonce_peer: Vec<u8>,
    dh: Option<DHTransformType>,
    public_peer: Vec<u8>,
    shared_secret: Option<SecretBytes>,
    iv: Vec<u8>,
    pub retransmit: Retransmission,
    pub expire_event: Option<EventId>,
    pub poll_event: Option<EventId>,
    pub polls_left: usize,
}

impl Phase2 {
    fn new(
        role: Role,
        remote_addr: SocketAddr,
        local_addr: SocketAddr,
        selectors: TrafficSelectors,
        now: Instant,
    ) -> Phase2 {
        Phase2 {
            role,
            state: Phase2State::Start,
            parent: None,
            message_id: 0,
            remote_addr,
            local_addr,
            selectors,
            send_ids: false,
            sainfo: None,
            created: now,
            local_spis: vec![],
            chosen: None,
            nonce_local: vec![],
            nonce_peer: vec![],
            dh: None,
            public_peer: vec![],
            shared_secret: None,
            iv: vec![],
            retransmit: Retransmission::default(),
            expire_event: None,
            poll_event: None,
            polls_left: 0,
        }
    }

    /// Creates a negotiation requested by local policy.
    pub fn new_initiator(
        selectors: TrafficSelectors,
        sainfo: Sainfo,
        remote_addr: SocketAddr,
        local_addr: SocketAddr,
        now: Instant,
    ) -> Phase2 {
        let mut phase2 = Phase2::new(Role::Initiator, remote_addr, local_addr, selectors, now);
        phase2.send_ids = !(selectors.local == Subnet::host(local_addr.ip())
            && selectors.remote == Subnet::host(remote_addr.ip()));
        phase2.sainfo = Some(sainfo);
        phase2
    }

    /// Creates a negotiation started by the peer.
    pub fn new_responder(
        parent: Phase1Id,
        message_id: u32,
        remote_addr: SocketAddr,
        local_addr: SocketAddr,
        now: Instant,
    ) -> Phase2 {
        let selectors = TrafficSelectors {
            local: Subnet::host(local_addr.ip()),
            remote: Subnet::host(remote_addr.ip()),
        };
        let mut phase2 = Phase2::new(Role::Responder, remote_addr, local_addr, selectors, now);
        phase2.parent = Some(parent);
        phase2.message_id = message_id;
        phase2
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> Phase2State {
        self.state
    }

    pub fn parent(&self) -> Option<Phase1Id> {
        self.parent
    }

    pub fn message_id(&self) -> u32 {
        self.message_id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn selectors(&self) -> &TrafficSelectors {
        &self.selectors
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    pub fn is_established(&self) -> bool {
        self.state == Phase2State::Established
    }

    pub fn is_expired(&self) -> bool {
        self.state == Phase2State::Expired
    }

    /// Whether keys for this negotiation were handed to the SA installer.
    pub fn is_installed(&self) -> bool {
        matches!(self.state, Phase2State::Established | Phase2State::Expired)
            && self.chosen.is_some()
    }

    pub fn expire(&mut self) {
        self.state = Phase2State::Expired;
    }

    /// Inbound SPI of the negotiated protocol.
    pub fn local_spi(&self) -> Option<u32> {
        let protocol = self.chosen?.proposal.transform.protocol;
        self.local_spis
            .iter()
            .find(|(spi_protocol, _)| *spi_protocol == protocol)
            .map(|(_, spi)| *spi)
    }

    /// Outbound SPI, chosen by the peer.
    pub fn peer_spi(&self) -> Option<u32> {
        self.chosen.map(|chosen| chosen.peer_spi)
    }

    /// SPIs reserved for this negotiation, including ones for protocols the peer didn't pick.
    pub fn reserved_spis(&self) -> &[(IpsecProtocol, u32)] {
        &self.local_spis
    }

    pub fn protocol(&self) -> Option<IpsecProtocol> {
        self.chosen.map(|chosen| chosen.proposal.transform.protocol)
    }

    /// Binds an initiator to its established parent, as soon as one exists.
    pub fn bind(&mut self, parent: Phase1Id, message_id: u32) -> Result<(), ExchangeError> {
        if self.role != Role::Initiator || self.parent.is_some() {
            return Err(ExchangeError::Internal("Phase 2 is already bound"));
        }
        self.parent = Some(parent);
        self.message_id = message_id;
        self.state = Phase2State::Status2;
        Ok(())
    }

    /// Protocols that need an inbound SPI from the SA installer.
    pub fn request_spis(&mut self) -> Result<Vec<IpsecProtocol>, ExchangeError> {
        if self.state != Phase2State::Status2 {
            return Err(ExchangeError::Internal("Phase 2 doesn't need an SPI"));
        }
        let protocols = match (self.role, &self.sainfo, &self.chosen) {
            (Role::Initiator, Some(sainfo), _) => sa::sainfo_protocols(sainfo),
            (Role::Responder, _, Some(chosen)) => vec![chosen.proposal.transform.protocol],
            _ => return Err(ExchangeError::Internal("Phase 2 policy is not known")),
        };
        self.state = Phase2State::GetSpiSent;
        Ok(protocols)
    }

    pub fn set_spis(&mut self, spis: Vec<(IpsecProtocol, u32)>) -> Result<(), ExchangeError> {
        if self.state != Phase2State::GetSpiSent {
            return Err(ExchangeError::Internal("Phase 2 didn't request an SPI"));
        }
        self.local_spis = spis;
        self.state = Phase2State::GetSpiDone;
        Ok(())
    }

    fn sainfo(&self) -> Result<&Sainfo, ExchangeError> {
        self.sainfo
            .as_ref()
            .ok_or(ExchangeError::Internal("Phase 2 policy is not known"))
    }

    fn nonce_initiator(&self) -> &[u8] {
        match self.role {
            Role::Initiator => &self.nonce_local,
            Role::Responder => &self.nonce_peer,
        }
    }

    fn nonce_responder(&self) -> &[u8] {
        match self.role {
            Role::Initiator => &self.nonce_peer,
            Role::Responder => &self.nonce_local,
        }
    }

    fn parent_crypto<'a>(&self, parent: &'a Phase1) -> Result<&'a crypto::CryptoStack, ExchangeError> {
        if !parent.is_established() {
            return Err(ExchangeError::Internal("Phase 1 is not established"));
        }
        parent
            .crypto()
            .ok_or(ExchangeError::Internal("Phase 1 keys are not available"))
    }

    fn init_iv(&mut self, parent: &Phase1) -> Result<(), ExchangeError> {
        if self.iv.is_empty() {
            let crypto = self.parent_crypto(parent)?;
            self.iv = crypto.phase2_iv(parent.iv(), self.message_id);
        }
        Ok(())
    }

    fn writer(&self, parent: &Phase1) -> MessageWriter {
        let index = parent.index();
        MessageWriter::new(
            index.initiator_cookie,
            index.responder_cookie,
            ExchangeType::QUICK_MODE,
            Flags::ENCRYPTION,
            self.message_id,
        )
    }

    fn encrypt(
        &mut self,
        policy: &Policy,
        parent: &Phase1,
        writer: MessageWriter,
    ) -> Result<Vec<u8>, ExchangeError> {
        self.init_iv(parent)?;
        let crypto = self.parent_crypto(parent)?;
        let mut data = writer.into_bytes();
        self.iv = crypto.encrypt_message(&mut data, &self.iv, &policy.padding)?;
        Ok(data)
    }

    fn add_ids(&self, writer: &mut MessageWriter) -> Result<(), ExchangeError> {
        if !self.send_ids {
            return Ok(());
        }
        let (id_initiator, id_responder) = match self.role {
            Role::Initiator => (self.selectors.local, self.selectors.remote),
            Role::Responder => (self.selectors.remote, self.selectors.local),
        };
        writer.add_payload(
            PayloadType::IDENTIFICATION,
            &id_initiator.to_identification().to_bytes(),
        )?;
        writer.add_payload(
            PayloadType::IDENTIFICATION,
            &id_responder.to_identification().to_bytes(),
        )?;
        Ok(())
    }

    /// Writes a placeholder HASH payload and fills it in once the rest of the message is known.
    fn finish_hash(
        &self,
        crypto: &crypto::CryptoStack,
        writer: &mut MessageWriter,
        hash_range: std::ops::Range<usize>,
        nonce: Option<&[u8]>,
    ) -> Result<(), ExchangeError> {
        let message_id = self.message_id.to_be_bytes();
        let rest = writer.data_from(hash_range.end);
        let hash = match nonce {
            Some(nonce) => crypto.prf_a(&[&message_id, nonce, rest])?,
            None => crypto.prf_a(&[&message_id, rest])?,
        };
        writer.payload_mut(hash_range).copy_from_slice(&hash);
        Ok(())
    }

    /// Sends the first quick mode message.
    pub fn initiate(&mut self, policy: &Policy, parent: &Phase1) -> Result<Vec<u8>, ExchangeError> {
        if self.role != Role::Initiator || self.state != Phase2State::GetSpiDone {
            return Err(ExchangeError::Internal("Phase 2 is not ready to start"));
        }
        let crypto = self.parent_crypto(parent)?;
        let nonce_size = parent.remote().nonce_size;
        let sainfo = self.sainfo()?;
        let sa = sa::phase2_offer(sainfo, &self.local_spis)?;
        let dh = match sainfo.pfs_group {
            Some(group) => Some(group.generate()?),
            None => None,
        };
        let nonce = exchange::generate_nonce(nonce_size)?;

        let mut writer = self.writer(parent);
        let hash_range = writer.add_payload(
            PayloadType::HASH,
            &vec![0u8; crypto.hash_algorithm().output_length()],
        )?;
        writer.add_payload(PayloadType::SECURITY_ASSOCIATION, &sa)?;
        writer.add_payload(PayloadType::NONCE, &nonce)?;
        if let Some(dh) = &dh {
            writer.add_payload(PayloadType::KEY_EXCHANGE, dh.read_public_key())?;
        }
        self.add_ids(&mut writer)?;
        self.finish_hash(crypto, &mut writer, hash_range, None)?;
        self.nonce_local = nonce;
        self.dh = dh;
        let data = self.encrypt(policy, parent, writer)?;
        self.state = Phase2State::Msg1Sent;
        debug!(
            "Starting quick mode {:08x} for {} with {}",
            self.message_id, self.selectors, self.remote_addr
        );
        Ok(data)
    }

    /// Processes a received quick mode message.
    pub fn handle_message(
        &mut self,
        policy: &Policy,
        parent: &Phase1,
        data: &[u8],
    ) -> Result<Phase2Outcome, ExchangeError> {
        let message = InputMessage::from_datagram(data)?;
        if !message.is_encrypted() {
            return Err("Quick mode message is not encrypted".into());
        }
        if message.read_message_id() != self.message_id {
            return Err(ExchangeError::Internal("Message ID doesn't match phase 2"));
        }
        self.init_iv(parent)?;
        let crypto = self.parent_crypto(parent)?;
        let mut data = data.to_vec();
        let next_iv = crypto
            .decrypt_message(&mut data, &self.iv, &policy.padding)
            .map_err(|err| {
                debug!("Failed to decrypt quick mode message: {}", err);
                ExchangeError::from("Failed to decrypt message")
            })?;
        let message = InputMessage::from_datagram(&data)?;
        trace!("Processing quick mode message {:?}", message);
        let payloads = message.payloads()?;
        let hash = match payloads.first() {
            Some(hash) if hash.payload_type() == PayloadType::HASH => *hash,
            _ => return Err("Quick mode message doesn't start with a Hash payload".into()),
        };
        let received = ReceivedPayloads::collect(&payloads)?;
        let received_hash = hash.to_hash()?;
        let rest = message.payloads_after(&hash, &payloads);
        let message_id = self.message_id.to_be_bytes();

        let saved_iv = mem::replace(&mut self.iv, next_iv);
        let result = match (self.role, self.state) {
            (Role::Responder, Phase2State::Start) => {
                let expected = crypto.prf_a(&[&message_id, rest])?;
                check_hash(&expected, received_hash)?;
                self.receive_offer(policy, &received)?;
                Ok(Phase2Outcome::NeedSpi)
            }
            (Role::Initiator, Phase2State::Msg1Sent) => {
                let expected = crypto.prf_a(&[&message_id, &self.nonce_local, rest])?;
                check_hash(&expected, received_hash)?;
                self.receive_reply(&received)?;
                let reply = self.send_commit(policy, parent)?;
                Ok(Phase2Outcome::Install(Some(reply)))
            }
            (Role::Responder, Phase2State::Msg1Sent) => {
                let expected = crypto.prf_a(&[
                    &[0],
                    &message_id,
                    &self.nonce_peer,
                    &self.nonce_local,
                ])?;
                check_hash(&expected, received_hash)?;
                if !rest.is_empty() {
                    debug!("Ignoring {} bytes after HASH(3)", rest.len());
                }
                self.state = Phase2State::AddSa;
                Ok(Phase2Outcome::Install(None))
            }
            (role, state) => {
                debug!("No quick mode {} transition from state {}", role, state);
                Err("Unexpected message in current state".into())
            }
        };
        if result.is_err() {
            self.iv = saved_iv;
        }
        result
    }

    fn receive_ids(&mut self, received: &ReceivedPayloads) -> Result<Option<TrafficSelectors>, ExchangeError> {
        let (id_initiator, id_responder) = match received.identification.as_slice() {
            [] => return Ok(None),
            [id_initiator, id_responder] => (
                Identification::from_payload(&id_initiator.to_identification()?),
                Identification::from_payload(&id_responder.to_identification()?),
            ),
            _ => return Err("Unexpected number of Identification payloads".into()),
        };
        let parse = |id: &Identification| {
            Subnet::from_identification(id).map_err(|err| {
                debug!("Unsupported traffic selector {}: {}", id, err);
                ExchangeError::Notify(NotifyType::INVALID_ID_INFORMATION)
            })
        };
        let (initiator, responder) = (parse(&id_initiator)?, parse(&id_responder)?);
        Ok(Some(match self.role {
            Role::Initiator => TrafficSelectors {
                local: initiator,
                remote: responder,
            },
            Role::Responder => TrafficSelectors {
                local: responder,
                remote: initiator,
            },
        }))
    }

    fn receive_key_exchange(
        &mut self,
        received: &ReceivedPayloads,
        pfs_group: Option<crypto::DhGroup>,
    ) -> Result<(), ExchangeError> {
        match (pfs_group, received.key_exchange) {
            (Some(_), Some(public_key)) => {
                self.public_peer = public_key.to_vec();
                Ok(())
            }
            (None, None) => Ok(()),
            (Some(_), None) => {
                warn!("PFS is required, but no Key Exchange payload was received");
                Err(NotifyType::NO_PROPOSAL_CHOSEN.into())
            }
            (None, Some(_)) => {
                warn!("Key Exchange payload received without PFS");
                Err(NotifyType::INVALID_PAYLOAD_TYPE.into())
            }
        }
    }

    fn receive_offer(&mut self, policy: &Policy, received: &ReceivedPayloads) -> Result<(), ExchangeError> {
        let selectors = self.receive_ids(received)?;
        if let Some(selectors) = selectors {
            self.selectors = selectors;
            self.send_ids = true;
        }
        let sainfo = policy
            .sainfo_for(selectors.as_ref())
            .ok_or_else(|| {
                warn!("No phase 2 policy for {}", self.selectors);
                ExchangeError::Notify(NotifyType::NO_PROPOSAL_CHOSEN)
            })?
            .clone();
        let sa = received.require_security_association()?.to_security_association()?;
        let chosen = sa::choose_phase2(&sa, &sainfo)?;
        self.nonce_peer = received.require_nonce()?.to_vec();
        self.receive_key_exchange(received, chosen.proposal.pfs_group)?;
        self.chosen = Some(chosen);
        self.sainfo = Some(sainfo);
        self.state = Phase2State::Status2;
        Ok(())
    }

    /// Sends the responder's reply, once an SPI is available.
    pub fn respond(&mut self, policy: &Policy, parent: &Phase1) -> Result<Vec<u8>, ExchangeError> {
        if self.role != Role::Responder || self.state != Phase2State::GetSpiDone {
            return Err(ExchangeError::Internal("Phase 2 is not ready to reply"));
        }
        let chosen = self
            .chosen
            .ok_or(ExchangeError::Internal("Phase 2 proposal is not negotiated"))?;
        let spi = self
            .local_spi()
            .ok_or(ExchangeError::Internal("No SPI reserved"))?;
        let crypto = self.parent_crypto(parent)?;
        let nonce = exchange::generate_nonce(parent.remote().nonce_size)?;
        let dh = match chosen.proposal.pfs_group {
            Some(group) => {
                let dh = group.generate()?;
                let shared_secret = dh.compute_shared_secret(&self.public_peer).map_err(|err| {
                    debug!("Failed to compute PFS shared secret: {}", err);
                    ExchangeError::Notify(NotifyType::INVALID_KEY_INFORMATION)
                })?;
                self.shared_secret = Some(shared_secret);
                Some(dh)
            }
            None => None,
        };

        let mut writer = self.writer(parent);
        let hash_range = writer.add_payload(
            PayloadType::HASH,
            &vec![0u8; crypto.hash_algorithm().output_length()],
        )?;
        writer.add_payload(PayloadType::SECURITY_ASSOCIATION, &sa::phase2_reply(&chosen, spi))?;
        writer.add_payload(PayloadType::NONCE, &nonce)?;
        if let Some(dh) = &dh {
            writer.add_payload(PayloadType::KEY_EXCHANGE, dh.read_public_key())?;
        }
        self.add_ids(&mut writer)?;
        self.finish_hash(crypto, &mut writer, hash_range, Some(&self.nonce_peer))?;
        self.nonce_local = nonce;
        self.dh = dh;
        let data = self.encrypt(policy, parent, writer)?;
        self.state = Phase2State::Msg1Sent;
        Ok(data)
    }

    fn receive_reply(&mut self, received: &ReceivedPayloads) -> Result<(), ExchangeError> {
        let sainfo = self.sainfo()?;
        let sa = received.require_security_association()?.to_security_association()?;
        let chosen = sa::accept_phase2(&sa, sainfo)?;
        if !self
            .local_spis
            .iter()
            .any(|(protocol, _)| *protocol == chosen.proposal.transform.protocol)
        {
            return Err(NotifyType::INVALID_PROTOCOL_ID.into());
        }
        let selectors = self.receive_ids(received)?;
        match selectors {
            Some(selectors) if self.send_ids && selectors == self.selectors => {}
            None if !self.send_ids => {}
            _ => {
                warn!("Peer changed traffic selectors for {}", self.selectors);
                return Err(NotifyType::INVALID_ID_INFORMATION.into());
            }
        }
        self.nonce_peer = received.require_nonce()?.to_vec();
        self.receive_key_exchange(received, chosen.proposal.pfs_group)?;
        if let Some(dh) = &self.dh {
            let shared_secret = dh.compute_shared_secret(&self.public_peer).map_err(|err| {
                debug!("Failed to compute PFS shared secret: {}", err);
                ExchangeError::Notify(NotifyType::INVALID_KEY_INFORMATION)
            })?;
            self.shared_secret = Some(shared_secret);
        }
        self.chosen = Some(chosen);
        self.state = Phase2State::Status6;
        Ok(())
    }

    fn send_commit(&mut self, policy: &Policy, parent: &Phase1) -> Result<Vec<u8>, ExchangeError> {
        let crypto = self.parent_crypto(parent)?;
        let hash = crypto.prf_a(&[
            &[0],
            &self.message_id.to_be_bytes(),
            &self.nonce_local,
            &self.nonce_peer,
        ])?;
        let mut writer = self.writer(parent);
        writer.add_payload(PayloadType::HASH, &hash)?;
        let data = self.encrypt(policy, parent, writer)?;
        self.state = Phase2State::AddSa;
        Ok(data)
    }

    /// Derives the keys for both directions (RFC 2409, Section 5.5).
    pub fn negotiated_sa(&self, parent: &Phase1) -> Result<NegotiatedSa, ExchangeError> {
        if self.state != Phase2State::AddSa {
            return Err(ExchangeError::Internal("Phase 2 is not ready to install"));
        }
        let crypto = self.parent_crypto(parent)?;
        let chosen = self
            .chosen
            .ok_or(ExchangeError::Internal("Phase 2 proposal is not negotiated"))?;
        let local_spi = self
            .local_spi()
            .ok_or(ExchangeError::Internal("No SPI reserved"))?;
        let transform = chosen.proposal.transform;
        let protocol_id = transform.protocol.protocol_id().protocol_id();
        let direction = |spi: u32, src, dst| -> Result<SaDirection, ExchangeError> {
            let keymat = crypto::keymat(
                crypto.hash_algorithm(),
                crypto.skeyid_d(),
                self.shared_secret.as_ref().map(|secret| secret.as_slice()),
                protocol_id,
                &spi.to_be_bytes(),
                self.nonce_initiator(),
                self.nonce_responder(),
                transform.keymat_length(),
            )?;
            let (encryption_key, integrity_key) = keymat.split_at(transform.encryption_key_length());
            Ok(SaDirection {
                spi,
                src,
                dst,
                encryption_key: SecretBytes::new(encryption_key.to_vec()),
                integrity_key: SecretBytes::new(integrity_key.to_vec()),
            })
        };
        let local_ip = self.local_addr.ip();
        let remote_ip = self.remote_addr.ip();
        Ok(NegotiatedSa {
            protocol: transform.protocol,
            transform,
            encapsulation: chosen.proposal.encapsulation,
            selectors: self.selectors,
            lifetime: chosen.proposal.lifetime,
            inbound: direction(local_spi, remote_ip, local_ip)?,
            outbound: direction(chosen.peer_spi, local_ip, remote_ip)?,
        })
    }

    pub fn established(&mut self) {
        self.state = Phase2State::Established;
    }
}

fn check_hash(expected: &[u8], received: &[u8]) -> Result<(), ExchangeError> {
    if exchange::hash_equals(expected, received) {
        Ok(())
    } else {
        warn!("Quick mode hash doesn't match");
        Err(NotifyType::INVALID_HASH_INFORMATION.into())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::super::cookie::Index;
    use super::super::crypto::{DhGroup, EncryptionAlgorithm, HashAlgorithm};
    use super::super::policy::{
        AuthMethod, Encapsulation, EspCipher, IntegrityAlgorithm, IpsecTransform, Phase1Proposal,
        PskTable, RemoteConfig,
    };
    use super::*;

    fn policy(peer: &str, sainfos: Vec<Sainfo>) -> Policy {
        let remote = RemoteConfig::new(
            None,
            vec![Phase1Proposal {
                encryption: EncryptionAlgorithm::Aes(16),
                hash: HashAlgorithm::Sha1,
                auth: AuthMethod::PreSharedKey,
                dh_group: DhGroup::Modp1024,
                lifetime: Duration::from_secs(28800),
            }],
        );
        let mut psk = PskTable::new();
        psk.add(peer, b"secret");
        Policy::new(vec![remote], sainfos, psk, None)
    }

    fn sainfo(selectors: Option<TrafficSelectors>, pfs_group: Option<DhGroup>) -> Sainfo {
        Sainfo {
            selectors,
            transforms: vec![IpsecTransform::esp(
                EspCipher::Aes(32),
                Some(IntegrityAlgorithm::HmacSha256),
            )],
            encapsulation: Encapsulation::Tunnel,
            pfs_group,
            lifetime: Duration::from_secs(3600),
        }
    }

    struct Peers {
        policy_a: Policy,
        policy_b: Policy,
        phase1_a: Phase1,
        phase1_b: Phase1,
    }

    fn established_peers(sainfos_a: Vec<Sainfo>, sainfos_b: Vec<Sainfo>) -> Peers {
        let policy_a = policy("192.0.2.2", sainfos_a);
        let policy_b = policy("192.0.2.1", sainfos_b);
        let addr_a: SocketAddr = "192.0.2.1:500".parse().unwrap();
        let addr_b: SocketAddr = "192.0.2.2:500".parse().unwrap();
        let now = Instant::now();
        let mut phase1_a = Phase1::new_initiator(
            &policy_a,
            policy_a.remote_for(addr_b.ip()).unwrap(),
            7,
            addr_b,
            addr_a,
            now,
        )
        .unwrap();
        let mut phase1_b = Phase1::new_responder(
            &policy_b,
            policy_b.remote_for(addr_a.ip()).unwrap(),
            Index::new(7, 9),
            super::super::policy::ExchangeMode::Main,
            addr_a,
            addr_b,
            now,
        )
        .unwrap();
        let mut message = Some(phase1_a.initiate(&policy_a).unwrap());
        let mut to_b = true;
        while let Some(data) = message.take() {
            let outcome = if to_b {
                phase1_b.handle_message(&policy_b, &data).unwrap()
            } else {
                phase1_a.handle_message(&policy_a, &data).unwrap()
            };
            message = outcome.reply;
            to_b = !to_b;
        }
        assert!(phase1_a.is_established() && phase1_b.is_established());
        Peers {
            policy_a,
            policy_b,
            phase1_a,
            phase1_b,
        }
    }

    fn negotiate(
        peers: &Peers,
        selectors: TrafficSelectors,
    ) -> Result<(NegotiatedSa, NegotiatedSa), ExchangeError> {
        let now = Instant::now();
        let addr_a = peers.phase1_a.local_addr();
        let addr_b = peers.phase1_a.remote_addr();
        let sainfo_a = peers.policy_a.sainfo_for(Some(&selectors)).unwrap().clone();
        let mut initiator = Phase2::new_initiator(selectors, sainfo_a, addr_b, addr_a, now);
        initiator.bind(Phase1Id::from_raw(1), 0x5151).unwrap();
        let protocols = initiator.request_spis().unwrap();
        initiator
            .set_spis(protocols.into_iter().map(|p| (p, 0x1000)).collect())
            .unwrap();
        let msg1 = initiator.initiate(&peers.policy_a, &peers.phase1_a)?;

        let mut responder = Phase2::new_responder(Phase1Id::from_raw(2), 0x5151, addr_a, addr_b, now);
        match responder.handle_message(&peers.policy_b, &peers.phase1_b, &msg1)? {
            Phase2Outcome::NeedSpi => {}
            Phase2Outcome::Install(_) => panic!("Responder skipped the SPI request"),
        }
        let protocols = responder.request_spis().unwrap();
        responder
            .set_spis(protocols.into_iter().map(|p| (p, 0x2000)).collect())
            .unwrap();
        let msg2 = responder.respond(&peers.policy_b, &peers.phase1_b)?;

        let msg3 = match initiator.handle_message(&peers.policy_a, &peers.phase1_a, &msg2)? {
            Phase2Outcome::Install(Some(msg3)) => msg3,
            _ => panic!("Initiator didn't send HASH(3)"),
        };
        match responder.handle_message(&peers.policy_b, &peers.phase1_b, &msg3)? {
            Phase2Outcome::Install(None) => {}
            _ => panic!("Responder didn't complete"),
        }
        assert_eq!(responder.selectors(), &TrafficSelectors {
            local: selectors.remote,
            remote: selectors.local,
        });
        Ok((
            initiator.negotiated_sa(&peers.phase1_a)?,
            responder.negotiated_sa(&peers.phase1_b)?,
        ))
    }

    fn host_selectors() -> TrafficSelectors {
        TrafficSelectors {
            local: Subnet::host("192.0.2.1".parse().unwrap()),
            remote: Subnet::host("192.0.2.2".parse().unwrap()),
        }
    }

    fn assert_mirrored(sa_a: &NegotiatedSa, sa_b: &NegotiatedSa) {
        assert_eq!(sa_a.inbound.spi, 0x1000);
        assert_eq!(sa_a.outbound.spi, 0x2000);
        assert_eq!(sa_b.inbound.spi, 0x2000);
        assert_eq!(sa_b.outbound.spi, 0x1000);
        assert_eq!(sa_a.inbound.encryption_key, sa_b.outbound.encryption_key);
        assert_eq!(sa_a.inbound.integrity_key, sa_b.outbound.integrity_key);
        assert_eq!(sa_a.outbound.encryption_key, sa_b.inbound.encryption_key);
        assert_ne!(sa_a.inbound.encryption_key, sa_a.outbound.encryption_key);
        assert_eq!(sa_a.inbound.encryption_key.len(), 32);
        assert_eq!(sa_a.inbound.integrity_key.len(), 32);
    }

    #[test]
    fn quick_mode_host_to_host() {
        let peers = established_peers(vec![sainfo(None, None)], vec![sainfo(None, None)]);
        let (sa_a, sa_b) = negotiate(&peers, host_selectors()).unwrap();
        assert_mirrored(&sa_a, &sa_b);
        assert_eq!(sa_a.lifetime, Duration::from_secs(3600));
    }

    #[test]
    fn quick_mode_subnets_with_pfs() {
        let selectors = TrafficSelectors {
            local: Subnet::parse("10.1.0.0/16").unwrap(),
            remote: Subnet::parse("10.2.0.0/16").unwrap(),
        };
        let mirrored = TrafficSelectors {
            local: selectors.remote,
            remote: selectors.local,
        };
        let peers = established_peers(
            vec![sainfo(Some(selectors), Some(DhGroup::Modp1024))],
            vec![sainfo(Some(mirrored), Some(DhGroup::Modp1024))],
        );
        let (sa_a, sa_b) = negotiate(&peers, selectors).unwrap();
        assert_mirrored(&sa_a, &sa_b);
        assert_eq!(sa_b.selectors, mirrored);
    }

    #[test]
    fn quick_mode_without_policy() {
        let selectors = TrafficSelectors {
            local: Subnet::parse("10.1.0.0/16").unwrap(),
            remote: Subnet::parse("10.2.0.0/16").unwrap(),
        };
        let other = TrafficSelectors {
            local: Subnet::parse("10.3.0.0/16").unwrap(),
            remote: Subnet::parse("10.1.0.0/16").unwrap(),
        };
        let peers = established_peers(
            vec![sainfo(Some(selectors), None)],
            vec![sainfo(Some(other), None)],
        );
        let err = negotiate(&peers, selectors).err().unwrap();
        assert_eq!(err.notify_type(), Some(NotifyType::NO_PROPOSAL_CHOSEN));
    }

    #[test]
    fn quick_mode_pfs_mismatch() {
        let peers = established_peers(
            vec![sainfo(None, None)],
            vec![sainfo(None, Some(DhGroup::Modp1024))],
        );
        let err = negotiate(&peers, host_selectors()).err().unwrap();
        assert_eq!(err.notify_type(), Some(NotifyType::NO_PROPOSAL_CHOSEN));
    }

    #[test]
    fn tampered_hash_is_rejected() {
        let peers = established_peers(vec![sainfo(None, None)], vec![sainfo(None, None)]);
        let now = Instant::now();
        let addr_a = peers.phase1_a.local_addr();
        let addr_b = peers.phase1_a.remote_addr();
        let mut initiator = Phase2::new_initiator(
            host_selectors(),
            sainfo(None, None),
            addr_b,
            addr_a,
            now,
        );
        initiator.bind(Phase1Id::from_raw(1), 0x77).unwrap();
        initiator.request_spis().unwrap();
        initiator
            .set_spis(vec![(IpsecProtocol::Esp, 0x1000)])
            .unwrap();
        let msg1 = initiator.initiate(&peers.policy_a, &peers.phase1_a).unwrap();
        let mut responder = Phase2::new_responder(Phase1Id::from_raw(2), 0x77, addr_a, addr_b, now);
        let mut tampered = msg1.clone();
        tampered[40] ^= 0x01;
        assert!(responder
            .handle_message(&peers.policy_b, &peers.phase1_b, &tampered)
            .is_err());
        assert_eq!(responder.state(), Phase2State::Start);
        assert!(responder
            .handle_message(&peers.policy_b, &peers.phase1_b, &msg1)
            .is_ok());
        assert_eq!(responder.state(), Phase2State::Status2);
    }
}
