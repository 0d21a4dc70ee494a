use std::{fmt, mem, net::SocketAddr, sync::Arc, time::Instant};

use log::{debug, trace, warn};

use super::cookie::Index;
use super::crypto::{self, CryptoStack, DHTransform, DHTransformType, SecretBytes};
use super::exchange::{self, ExchangeError, ReceivedPayloads, Retransmission, Role};
use super::message::{
    self, CertificateEncoding, ExchangeType, Flags, Identification, InputMessage, MessageWriter,
    NotifyType, PayloadType,
};
use super::policy::{self, AuthMethod, ExchangeMode, Phase1Proposal, Policy, RemoteConfig};
use super::sa;
use super::schedule::EventId;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Phase1State {
    Start,
    Msg1Received,
    Msg1Sent,
    Msg2Received,
    Msg2Sent,
    Msg3Received,
    Msg3Sent,
    Msg4Received,
    Established,
    Expired,
}

impl fmt::Display for Phase1State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => write!(f, "START"),
            Self::Msg1Received => write!(f, "MSG1RECEIVED"),
            Self::Msg1Sent => write!(f, "MSG1SENT"),
            Self::Msg2Received => write!(f, "MSG2RECEIVED"),
            Self::Msg2Sent => write!(f, "MSG2SENT"),
            Self::Msg3Received => write!(f, "MSG3RECEIVED"),
            Self::Msg3Sent => write!(f, "MSG3SENT"),
            Self::Msg4Received => write!(f, "MSG4RECEIVED"),
            Self::Established => write!(f, "ESTABLISHED"),
            Self::Expired => write!(f, "EXPIRED"),
        }
    }
}

/// Result of processing a phase 1 message.
pub struct Phase1Outcome {
    pub reply: Option<Vec<u8>>,
    pub established: bool,
}

impl Phase1Outcome {
    fn reply(data: Vec<u8>) -> Phase1Outcome {
        Phase1Outcome {
            reply: Some(data),
            established: false,
        }
    }
}

/// One ISAKMP SA negotiation.
pub struct Phase1 {
    index: Index,
    role: Role,
    mode: ExchangeMode,
    state: Phase1State,
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    remote: Arc<RemoteConfig>,
    created: Instant,
    proposal: Option<Phase1Proposal>,
    sa_initiator: Vec<u8>,
    reply_sa: Option<Vec<u8>>,
    dh: Option<DHTransformType>,
    public_peer: Vec<u8>,
    nonce_local: Vec<u8>,
    nonce_peer: Vec<u8>,
    id_local: Identification,
    id_peer: Option<Identification>,
    cert_requested: bool,
    shared_secret: Option<SecretBytes>,
    skeyid: Option<SecretBytes>,
    crypto: Option<CryptoStack>,
    iv: Vec<u8>,
    pub retransmit: Retransmission,
    pub expire_event: Option<EventId>,
}

impl Phase1 {
    #[allow(clippy::too_many_arguments)]
    fn new(
        policy: &Policy,
        remote: Arc<RemoteConfig>,
        index: Index,
        role: Role,
        mode: ExchangeMode,
        remote_addr: SocketAddr,
        local_addr: SocketAddr,
        now: Instant,
    ) -> Result<Phase1, ExchangeError> {
        let id_local = if let Some(local_id) = &remote.local_id {
            local_id.clone()
        } else if remote.auth_method() == Some(AuthMethod::RsaSignature) {
            policy
                .pki()
                .and_then(|pki| pki.local_identification())
                .ok_or(ExchangeError::Internal("No local certificate is configured"))?
        } else {
            policy::address_identity(local_addr.ip())
        };
        Ok(Phase1 {
            index,
            role,
            mode,
            state: Phase1State::Start,
            remote_addr,
            local_addr,
            remote,
            created: now,
            proposal: None,
            sa_initiator: vec![],
            reply_sa: None,
            dh: None,
            public_peer: vec![],
            nonce_local: vec![],
            nonce_peer: vec![],
            id_local,
            id_peer: None,
            cert_requested: false,
            shared_secret: None,
            skeyid: None,
            crypto: None,
            iv: vec![],
            retransmit: Retransmission::default(),
            expire_event: None,
        })
    }

    pub fn new_initiator(
        policy: &Policy,
        remote: Arc<RemoteConfig>,
        initiator_cookie: u64,
        remote_addr: SocketAddr,
        local_addr: SocketAddr,
        now: Instant,
    ) -> Result<Phase1, ExchangeError> {
        let mode = remote.exchange_mode;
        Phase1::new(
            policy,
            remote,
            Index::new(initiator_cookie, 0),
            Role::Initiator,
            mode,
            remote_addr,
            local_addr,
            now,
        )
    }

    pub fn new_responder(
        policy: &Policy,
        remote: Arc<RemoteConfig>,
        index: Index,
        mode: ExchangeMode,
        remote_addr: SocketAddr,
        local_addr: SocketAddr,
        now: Instant,
    ) -> Result<Phase1, ExchangeError> {
        Phase1::new(
            policy,
            remote,
            index,
            Role::Responder,
            mode,
            remote_addr,
            local_addr,
            now,
        )
    }

    pub fn index(&self) -> Index {
        self.index
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn mode(&self) -> ExchangeMode {
        self.mode
    }

    pub fn state(&self) -> Phase1State {
        self.state
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote(&self) -> &Arc<RemoteConfig> {
        &self.remote
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    pub fn proposal(&self) -> Option<&Phase1Proposal> {
        self.proposal.as_ref()
    }

    pub fn peer_identity(&self) -> Option<&Identification> {
        self.id_peer.as_ref()
    }

    pub fn is_established(&self) -> bool {
        self.state == Phase1State::Established
    }

    pub fn is_expired(&self) -> bool {
        self.state == Phase1State::Expired
    }

    pub fn expire(&mut self) {
        self.state = Phase1State::Expired;
    }

    pub fn crypto(&self) -> Option<&CryptoStack> {
        self.crypto.as_ref()
    }

    /// Last phase 1 IV, used to derive phase 2 and informational IVs.
    pub fn iv(&self) -> &[u8] {
        &self.iv
    }

    fn negotiated(&self) -> Result<Phase1Proposal, ExchangeError> {
        self.proposal
            .ok_or(ExchangeError::Internal("Phase 1 proposal is not negotiated"))
    }

    fn dh(&self) -> Result<&DHTransformType, ExchangeError> {
        self.dh
            .as_ref()
            .ok_or(ExchangeError::Internal("DH key is not generated"))
    }

    fn keys(&self) -> Result<&CryptoStack, ExchangeError> {
        self.crypto
            .as_ref()
            .ok_or(ExchangeError::Internal("Phase 1 keys are not available"))
    }

    fn public_initiator(&self) -> Result<&[u8], ExchangeError> {
        match self.role {
            Role::Initiator => Ok(self.dh()?.read_public_key()),
            Role::Responder => Ok(&self.public_peer),
        }
    }

    fn public_responder(&self) -> Result<&[u8], ExchangeError> {
        match self.role {
            Role::Initiator => Ok(&self.public_peer),
            Role::Responder => Ok(self.dh()?.read_public_key()),
        }
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

    fn id_initiator(&self) -> Result<Vec<u8>, ExchangeError> {
        match self.role {
            Role::Initiator => Ok(self.id_local.to_bytes()),
            Role::Responder => self.id_peer_bytes(),
        }
    }

    fn id_responder(&self) -> Result<Vec<u8>, ExchangeError> {
        match self.role {
            Role::Initiator => self.id_peer_bytes(),
            Role::Responder => Ok(self.id_local.to_bytes()),
        }
    }

    fn id_peer_bytes(&self) -> Result<Vec<u8>, ExchangeError> {
        self.id_peer
            .as_ref()
            .map(|id| id.to_bytes())
            .ok_or(ExchangeError::Internal("Peer identity is not known"))
    }

    fn writer(&self, flags: Flags) -> MessageWriter {
        MessageWriter::new(
            self.index.initiator_cookie,
            self.index.responder_cookie,
            self.mode.exchange_type(),
            flags,
            0,
        )
    }

    fn encrypt(&mut self, policy: &Policy, writer: MessageWriter) -> Result<Vec<u8>, ExchangeError> {
        let mut data = writer.into_bytes();
        let crypto = self.keys()?;
        let next_iv = crypto.encrypt_message(&mut data, &self.iv, &policy.padding)?;
        self.iv = next_iv;
        Ok(data)
    }

    /// Generates the first message of the exchange.
    pub fn initiate(&mut self, policy: &Policy) -> Result<Vec<u8>, ExchangeError> {
        if self.role != Role::Initiator || self.state != Phase1State::Start {
            return Err(ExchangeError::Internal("Phase 1 was already started"));
        }
        let mut proposals = self.remote.proposals.clone();
        if self.mode == ExchangeMode::Aggressive {
            // Aggressive mode sends the KE payload before the group is negotiated.
            let group = self
                .remote
                .dh_group()
                .ok_or(ExchangeError::Internal("No phase 1 proposals configured"))?;
            proposals.retain(|proposal| proposal.dh_group == group);
        }
        if proposals.is_empty() {
            return Err(ExchangeError::Internal("No phase 1 proposals configured"));
        }
        self.sa_initiator = sa::phase1_offer(&proposals);
        self.nonce_local = exchange::generate_nonce(self.remote.nonce_size)?;

        let mut writer = self.writer(Flags::NONE);
        writer.add_payload(PayloadType::SECURITY_ASSOCIATION, &self.sa_initiator)?;
        match self.mode {
            ExchangeMode::Main => {}
            ExchangeMode::Aggressive => {
                let dh = proposals[0].dh_group.generate()?;
                writer.add_payload(PayloadType::KEY_EXCHANGE, dh.read_public_key())?;
                self.dh = Some(dh);
                writer.add_payload(PayloadType::NONCE, &self.nonce_local)?;
                writer.add_payload(PayloadType::IDENTIFICATION, &self.id_local.to_bytes())?;
                self.add_certificate_request(policy, &mut writer)?;
            }
            ExchangeMode::Base => {
                writer.add_payload(PayloadType::NONCE, &self.nonce_local)?;
                writer.add_payload(PayloadType::IDENTIFICATION, &self.id_local.to_bytes())?;
                self.add_certificate_request(policy, &mut writer)?;
            }
        }
        self.state = Phase1State::Msg1Sent;
        debug!(
            "Starting {} mode phase 1 {} with {}",
            self.mode, self.index, self.remote_addr
        );
        Ok(writer.into_bytes())
    }

    /// Processes a received message and produces the reply, if any.
    pub fn handle_message(
        &mut self,
        policy: &Policy,
        data: &[u8],
    ) -> Result<Phase1Outcome, ExchangeError> {
        let mut data = data.to_vec();
        let encrypted = InputMessage::from_datagram(&data)?.is_encrypted();
        let saved_iv = if encrypted {
            let crypto = self
                .crypto
                .as_ref()
                .ok_or("Encrypted message received before keys are established")?;
            let next_iv = crypto
                .decrypt_message(&mut data, &self.iv, &policy.padding)
                .map_err(|err| {
                    debug!("Failed to decrypt phase 1 message: {}", err);
                    ExchangeError::from("Failed to decrypt message")
                })?;
            Some(mem::replace(&mut self.iv, next_iv))
        } else {
            None
        };
        let message = InputMessage::from_datagram(&data)?;
        trace!("Processing phase 1 message {:?}", message);
        let result = self.process(policy, &message, encrypted);
        if result.is_err() {
            if let Some(iv) = saved_iv {
                self.iv = iv;
            }
        }
        result
    }

    fn process(
        &mut self,
        policy: &Policy,
        message: &InputMessage,
        encrypted: bool,
    ) -> Result<Phase1Outcome, ExchangeError> {
        if message.read_exchange_type() != self.mode.exchange_type() {
            debug!(
                "Phase 1 {} uses {} mode, received {}",
                self.index,
                self.mode,
                message.read_exchange_type()
            );
            return Err("Unexpected exchange type".into());
        }
        let payloads = message.payloads()?;
        let received = ReceivedPayloads::collect(&payloads)?;
        use ExchangeMode::{Aggressive, Base, Main};
        use Phase1State::{Msg1Sent, Msg2Sent, Msg3Sent, Start};
        match (self.mode, self.role, self.state) {
            (Main, Role::Initiator, Msg1Sent) => {
                self.main_i2recv(message, &received)?;
                self.main_i2send(policy).map(Phase1Outcome::reply)
            }
            (Main, Role::Initiator, Msg2Sent) => {
                self.main_i3recv(policy, &received)?;
                self.main_i3send(policy).map(Phase1Outcome::reply)
            }
            (Main, Role::Initiator, Msg3Sent) if encrypted => {
                self.main_i4recv(policy, &received)?;
                Ok(self.established(None))
            }
            (Main, Role::Responder, Start) => {
                self.main_r1recv(&received)?;
                self.main_r1send().map(Phase1Outcome::reply)
            }
            (Main, Role::Responder, Msg1Sent) => {
                self.main_r2recv(&received)?;
                self.main_r2send(policy).map(Phase1Outcome::reply)
            }
            (Main, Role::Responder, Msg2Sent) if encrypted => {
                self.main_r3recv(policy, &received)?;
                let reply = self.main_r3send(policy)?;
                Ok(self.established(Some(reply)))
            }
            (Aggressive, Role::Initiator, Msg1Sent) => {
                self.aggressive_i2recv(policy, message, &received)?;
                let reply = self.aggressive_i2send(policy)?;
                Ok(self.established(Some(reply)))
            }
            (Aggressive, Role::Responder, Start) => {
                self.aggressive_r1recv(&received)?;
                self.aggressive_r1send(policy).map(Phase1Outcome::reply)
            }
            (Aggressive, Role::Responder, Msg1Sent) => {
                self.aggressive_r2recv(policy, &received)?;
                Ok(self.established(None))
            }
            (Base, Role::Initiator, Msg1Sent) => {
                self.base_i2recv(message, &received)?;
                self.base_i2send(policy).map(Phase1Outcome::reply)
            }
            (Base, Role::Initiator, Msg2Sent) => {
                self.base_i3recv(policy, &received)?;
                Ok(self.established(None))
            }
            (Base, Role::Responder, Start) => {
                self.base_r1recv(&received)?;
                self.base_r1send(policy).map(Phase1Outcome::reply)
            }
            (Base, Role::Responder, Msg1Sent) => {
                self.base_r2recv(policy, &received)?;
                let reply = self.base_r2send(policy)?;
                Ok(self.established(Some(reply)))
            }
            (mode, role, state) => {
                debug!(
                    "No {} mode {} transition from state {} (encrypted {})",
                    mode, role, state, encrypted
                );
                Err("Unexpected message in current state".into())
            }
        }
    }

    fn established(&mut self, reply: Option<Vec<u8>>) -> Phase1Outcome {
        self.state = Phase1State::Established;
        Phase1Outcome {
            reply,
            established: true,
        }
    }

    // Main mode, initiator.

    fn main_i2recv(
        &mut self,
        message: &InputMessage,
        received: &ReceivedPayloads,
    ) -> Result<(), ExchangeError> {
        let sa = received.require_security_association()?.to_security_association()?;
        let proposal = sa::accept_phase1(&sa, &self.remote.proposals)?;
        self.proposal = Some(proposal);
        self.index.responder_cookie = message.read_responder_cookie();
        self.state = Phase1State::Msg2Received;
        Ok(())
    }

    fn main_i2send(&mut self, policy: &Policy) -> Result<Vec<u8>, ExchangeError> {
        let dh = self.negotiated()?.dh_group.generate()?;
        let mut writer = self.writer(Flags::NONE);
        writer.add_payload(PayloadType::KEY_EXCHANGE, dh.read_public_key())?;
        self.dh = Some(dh);
        writer.add_payload(PayloadType::NONCE, &self.nonce_local)?;
        self.add_certificate_request(policy, &mut writer)?;
        self.state = Phase1State::Msg2Sent;
        Ok(writer.into_bytes())
    }

    fn main_i3recv(
        &mut self,
        policy: &Policy,
        received: &ReceivedPayloads,
    ) -> Result<(), ExchangeError> {
        self.receive_key_exchange(received)?;
        self.cert_requested = received.certificate_request;
        self.compute_keys(policy)?;
        self.state = Phase1State::Msg3Received;
        Ok(())
    }

    fn main_i3send(&mut self, policy: &Policy) -> Result<Vec<u8>, ExchangeError> {
        let mut writer = self.writer(Flags::ENCRYPTION);
        writer.add_payload(PayloadType::IDENTIFICATION, &self.id_local.to_bytes())?;
        self.add_authentication(policy, &mut writer)?;
        let data = self.encrypt(policy, writer)?;
        self.state = Phase1State::Msg3Sent;
        Ok(data)
    }

    fn main_i4recv(
        &mut self,
        policy: &Policy,
        received: &ReceivedPayloads,
    ) -> Result<(), ExchangeError> {
        self.receive_identification(received)?;
        self.verify_authentication(policy, received)?;
        self.state = Phase1State::Msg4Received;
        Ok(())
    }

    // Main mode, responder.

    fn main_r1recv(&mut self, received: &ReceivedPayloads) -> Result<(), ExchangeError> {
        self.choose_proposal(received, None)?;
        self.state = Phase1State::Msg1Received;
        Ok(())
    }

    fn main_r1send(&mut self) -> Result<Vec<u8>, ExchangeError> {
        let reply_sa = self.reply_sa.take().ok_or(ExchangeError::Internal("No SA reply"))?;
        let mut writer = self.writer(Flags::NONE);
        writer.add_payload(PayloadType::SECURITY_ASSOCIATION, &reply_sa)?;
        self.state = Phase1State::Msg1Sent;
        Ok(writer.into_bytes())
    }

    fn main_r2recv(&mut self, received: &ReceivedPayloads) -> Result<(), ExchangeError> {
        self.receive_key_exchange(received)?;
        self.cert_requested = received.certificate_request;
        self.state = Phase1State::Msg2Received;
        Ok(())
    }

    fn main_r2send(&mut self, policy: &Policy) -> Result<Vec<u8>, ExchangeError> {
        let dh = self.negotiated()?.dh_group.generate()?;
        self.nonce_local = exchange::generate_nonce(self.remote.nonce_size)?;
        let mut writer = self.writer(Flags::NONE);
        writer.add_payload(PayloadType::KEY_EXCHANGE, dh.read_public_key())?;
        self.dh = Some(dh);
        writer.add_payload(PayloadType::NONCE, &self.nonce_local)?;
        self.compute_keys(policy)?;
        self.state = Phase1State::Msg2Sent;
        Ok(writer.into_bytes())
    }

    fn main_r3recv(
        &mut self,
        policy: &Policy,
        received: &ReceivedPayloads,
    ) -> Result<(), ExchangeError> {
        self.receive_identification(received)?;
        self.verify_authentication(policy, received)?;
        self.state = Phase1State::Msg3Received;
        Ok(())
    }

    fn main_r3send(&mut self, policy: &Policy) -> Result<Vec<u8>, ExchangeError> {
        let mut writer = self.writer(Flags::ENCRYPTION);
        writer.add_payload(PayloadType::IDENTIFICATION, &self.id_local.to_bytes())?;
        self.add_authentication(policy, &mut writer)?;
        self.encrypt(policy, writer)
    }

    // Aggressive mode, initiator.

    fn aggressive_i2recv(
        &mut self,
        policy: &Policy,
        message: &InputMessage,
        received: &ReceivedPayloads,
    ) -> Result<(), ExchangeError> {
        let sa = received.require_security_association()?.to_security_association()?;
        let proposal = sa::accept_phase1(&sa, &self.remote.proposals)?;
        if proposal.dh_group != self.dh()?.group() {
            warn!(
                "Peer selected DH group {}, but {} was offered",
                proposal.dh_group,
                self.dh()?.group()
            );
            return Err(NotifyType::NO_PROPOSAL_CHOSEN.into());
        }
        self.proposal = Some(proposal);
        self.index.responder_cookie = message.read_responder_cookie();
        self.receive_key_exchange(received)?;
        self.receive_identification(received)?;
        self.cert_requested = received.certificate_request;
        self.compute_keys(policy)?;
        self.verify_authentication(policy, received)?;
        self.state = Phase1State::Msg2Received;
        Ok(())
    }

    fn aggressive_i2send(&mut self, policy: &Policy) -> Result<Vec<u8>, ExchangeError> {
        let mut writer = self.writer(Flags::NONE);
        self.add_authentication(policy, &mut writer)?;
        Ok(writer.into_bytes())
    }

    // Aggressive mode, responder.

    fn aggressive_r1recv(&mut self, received: &ReceivedPayloads) -> Result<(), ExchangeError> {
        let group = self.remote.dh_group();
        self.choose_proposal(received, group)?;
        self.receive_key_exchange(received)?;
        self.receive_identification(received)?;
        self.cert_requested = received.certificate_request;
        self.state = Phase1State::Msg1Received;
        Ok(())
    }

    fn aggressive_r1send(&mut self, policy: &Policy) -> Result<Vec<u8>, ExchangeError> {
        let reply_sa = self.reply_sa.take().ok_or(ExchangeError::Internal("No SA reply"))?;
        let dh = self.negotiated()?.dh_group.generate()?;
        self.nonce_local = exchange::generate_nonce(self.remote.nonce_size)?;
        let mut writer = self.writer(Flags::NONE);
        writer.add_payload(PayloadType::SECURITY_ASSOCIATION, &reply_sa)?;
        writer.add_payload(PayloadType::KEY_EXCHANGE, dh.read_public_key())?;
        self.dh = Some(dh);
        writer.add_payload(PayloadType::NONCE, &self.nonce_local)?;
        writer.add_payload(PayloadType::IDENTIFICATION, &self.id_local.to_bytes())?;
        self.compute_keys(policy)?;
        self.add_authentication(policy, &mut writer)?;
        self.state = Phase1State::Msg1Sent;
        Ok(writer.into_bytes())
    }

    fn aggressive_r2recv(
        &mut self,
        policy: &Policy,
        received: &ReceivedPayloads,
    ) -> Result<(), ExchangeError> {
        self.verify_authentication(policy, received)?;
        self.state = Phase1State::Msg2Received;
        Ok(())
    }

    // Base mode, initiator.

    fn base_i2recv(
        &mut self,
        message: &InputMessage,
        received: &ReceivedPayloads,
    ) -> Result<(), ExchangeError> {
        let sa = received.require_security_association()?.to_security_association()?;
        let proposal = sa::accept_phase1(&sa, &self.remote.proposals)?;
        self.proposal = Some(proposal);
        self.index.responder_cookie = message.read_responder_cookie();
        self.nonce_peer = received.require_nonce()?.to_vec();
        self.receive_identification(received)?;
        self.cert_requested = received.certificate_request;
        self.state = Phase1State::Msg2Received;
        Ok(())
    }

    fn base_i2send(&mut self, policy: &Policy) -> Result<Vec<u8>, ExchangeError> {
        let proposal = self.negotiated()?;
        let dh = proposal.dh_group.generate()?;
        let mut writer = self.writer(Flags::NONE);
        writer.add_payload(PayloadType::KEY_EXCHANGE, dh.read_public_key())?;
        self.dh = Some(dh);
        if proposal.auth == AuthMethod::PreSharedKey {
            self.compute_skeyid(policy)?;
        }
        self.add_authentication(policy, &mut writer)?;
        self.state = Phase1State::Msg2Sent;
        Ok(writer.into_bytes())
    }

    fn base_i3recv(
        &mut self,
        policy: &Policy,
        received: &ReceivedPayloads,
    ) -> Result<(), ExchangeError> {
        self.public_peer = received.require_key_exchange()?.to_vec();
        self.compute_keys(policy)?;
        self.verify_authentication(policy, received)?;
        self.state = Phase1State::Msg3Received;
        Ok(())
    }

    // Base mode, responder.

    fn base_r1recv(&mut self, received: &ReceivedPayloads) -> Result<(), ExchangeError> {
        self.choose_proposal(received, None)?;
        self.nonce_peer = received.require_nonce()?.to_vec();
        self.receive_identification(received)?;
        self.cert_requested = received.certificate_request;
        self.state = Phase1State::Msg1Received;
        Ok(())
    }

    fn base_r1send(&mut self, policy: &Policy) -> Result<Vec<u8>, ExchangeError> {
        let reply_sa = self.reply_sa.take().ok_or(ExchangeError::Internal("No SA reply"))?;
        self.nonce_local = exchange::generate_nonce(self.remote.nonce_size)?;
        let mut writer = self.writer(Flags::NONE);
        writer.add_payload(PayloadType::SECURITY_ASSOCIATION, &reply_sa)?;
        writer.add_payload(PayloadType::NONCE, &self.nonce_local)?;
        writer.add_payload(PayloadType::IDENTIFICATION, &self.id_local.to_bytes())?;
        self.add_certificate_request(policy, &mut writer)?;
        self.state = Phase1State::Msg1Sent;
        Ok(writer.into_bytes())
    }

    fn base_r2recv(
        &mut self,
        policy: &Policy,
        received: &ReceivedPayloads,
    ) -> Result<(), ExchangeError> {
        self.public_peer = received.require_key_exchange()?.to_vec();
        if self.negotiated()?.auth == AuthMethod::PreSharedKey {
            self.compute_skeyid(policy)?;
        }
        self.verify_authentication(policy, received)?;
        self.state = Phase1State::Msg2Received;
        Ok(())
    }

    fn base_r2send(&mut self, policy: &Policy) -> Result<Vec<u8>, ExchangeError> {
        let dh = self.negotiated()?.dh_group.generate()?;
        let mut writer = self.writer(Flags::NONE);
        writer.add_payload(PayloadType::KEY_EXCHANGE, dh.read_public_key())?;
        self.dh = Some(dh);
        self.compute_keys(policy)?;
        self.add_authentication(policy, &mut writer)?;
        Ok(writer.into_bytes())
    }

    // Shared steps.

    fn choose_proposal(
        &mut self,
        received: &ReceivedPayloads,
        required_group: Option<crypto::DhGroup>,
    ) -> Result<(), ExchangeError> {
        let payload = received.require_security_association()?;
        let sa = payload.to_security_association()?;
        let (proposal, reply) = sa::choose_phase1(&sa, &self.remote.proposals, required_group)?;
        self.sa_initiator = payload.data().to_vec();
        self.proposal = Some(proposal);
        self.reply_sa = Some(reply);
        Ok(())
    }

    fn receive_key_exchange(&mut self, received: &ReceivedPayloads) -> Result<(), ExchangeError> {
        self.public_peer = received.require_key_exchange()?.to_vec();
        self.nonce_peer = received.require_nonce()?.to_vec();
        Ok(())
    }

    fn receive_identification(
        &mut self,
        received: &ReceivedPayloads,
    ) -> Result<(), ExchangeError> {
        let payload = received.require_identification()?.to_identification()?;
        let id = Identification::from_payload(&payload);
        if self.remote.verify_identifier {
            if let Some(expected) = &self.remote.peer_id {
                if expected.id_type() != id.id_type() || expected.data() != id.data() {
                    warn!(
                        "Peer {} identified as {}, expected {}",
                        self.remote_addr, id, expected
                    );
                    return Err(NotifyType::INVALID_ID_INFORMATION.into());
                }
            }
        }
        debug!("Peer {} identified as {}", self.remote_addr, id);
        self.id_peer = Some(id);
        Ok(())
    }

    fn add_certificate_request(
        &self,
        policy: &Policy,
        writer: &mut MessageWriter,
    ) -> Result<(), ExchangeError> {
        if self.role != Role::Initiator
            || !self.remote.send_cr
            || self.remote.auth_method() != Some(AuthMethod::RsaSignature)
        {
            return Ok(());
        }
        if let Some(ca) = policy.pki().and_then(|pki| pki.certificate_request()) {
            writer.add_payload(
                PayloadType::CERTIFICATE_REQUEST,
                &message::write_certificate(CertificateEncoding::X509_SIGNATURE, ca),
            )?;
        }
        Ok(())
    }

    fn compute_skeyid(&mut self, policy: &Policy) -> Result<(), ExchangeError> {
        let proposal = self.negotiated()?;
        let skeyid = match proposal.auth {
            AuthMethod::PreSharedKey => {
                let psk = policy
                    .psk_for(
                        &self.remote,
                        self.mode,
                        self.remote_addr.ip(),
                        self.id_peer.as_ref(),
                    )
                    .ok_or_else(|| {
                        warn!("No pre-shared key found for peer {}", self.remote_addr);
                        ExchangeError::Notify(NotifyType::AUTHENTICATION_FAILED)
                    })?;
                crypto::skeyid_psk(
                    proposal.hash,
                    psk,
                    self.nonce_initiator(),
                    self.nonce_responder(),
                )?
            }
            AuthMethod::RsaSignature => {
                let shared_secret = self
                    .shared_secret
                    .as_ref()
                    .ok_or(ExchangeError::Internal("Shared secret is not computed"))?;
                crypto::skeyid_signature(
                    proposal.hash,
                    self.nonce_initiator(),
                    self.nonce_responder(),
                    shared_secret,
                )?
            }
        };
        self.skeyid = Some(skeyid);
        Ok(())
    }

    fn compute_keys(&mut self, policy: &Policy) -> Result<(), ExchangeError> {
        let proposal = self.negotiated()?;
        if self.shared_secret.is_none() {
            let shared_secret = self
                .dh()?
                .compute_shared_secret(&self.public_peer)
                .map_err(|err| {
                    debug!("Failed to compute DH shared secret: {}", err);
                    ExchangeError::Notify(NotifyType::INVALID_KEY_INFORMATION)
                })?;
            self.shared_secret = Some(shared_secret);
        }
        if self.skeyid.is_none() {
            self.compute_skeyid(policy)?;
        }
        let skeyid = self
            .skeyid
            .clone()
            .ok_or(ExchangeError::Internal("SKEYID is not computed"))?;
        let shared_secret = self
            .shared_secret
            .as_ref()
            .ok_or(ExchangeError::Internal("Shared secret is not computed"))?;
        let keys = crypto::derive_phase1_keys(
            proposal.hash,
            skeyid,
            shared_secret,
            self.index.initiator_cookie,
            self.index.responder_cookie,
            proposal.encryption,
        )?;
        trace!(
            "Phase 1 {} SKEYID_e {} encryption key {}",
            self.index,
            crate::logger::fmt_slice_hex(&keys.skeyid_e),
            crate::logger::fmt_slice_hex(&keys.enc_key)
        );
        let crypto = CryptoStack::new(proposal.hash, proposal.encryption, keys, policy.weak_keys)?;
        self.iv = crypto::phase1_iv(
            proposal.hash,
            self.public_initiator()?,
            self.public_responder()?,
            crypto.block_size(),
        );
        self.crypto = Some(crypto);
        Ok(())
    }

    /// HASH_I (RFC 2409, Section 5).
    fn hash_initiator(&self) -> Result<SecretBytes, ExchangeError> {
        let crypto = self.keys()?;
        Ok(crypto.prf_skeyid(&[
            self.public_initiator()?,
            self.public_responder()?,
            &self.index.initiator_cookie.to_be_bytes(),
            &self.index.responder_cookie.to_be_bytes(),
            &self.sa_initiator,
            &self.id_initiator()?,
        ])?)
    }

    /// HASH_R (RFC 2409, Section 5).
    fn hash_responder(&self) -> Result<SecretBytes, ExchangeError> {
        let crypto = self.keys()?;
        Ok(crypto.prf_skeyid(&[
            self.public_responder()?,
            self.public_initiator()?,
            &self.index.responder_cookie.to_be_bytes(),
            &self.index.initiator_cookie.to_be_bytes(),
            &self.sa_initiator,
            &self.id_responder()?,
        ])?)
    }

    /// Base mode initiator hash, computed before the responder's DH value is known.
    fn base_hash_initiator(&self) -> Result<SecretBytes, ExchangeError> {
        let proposal = self.negotiated()?;
        let key = match proposal.auth {
            AuthMethod::PreSharedKey => self
                .skeyid
                .clone()
                .ok_or(ExchangeError::Internal("SKEYID is not computed"))?,
            AuthMethod::RsaSignature => SecretBytes::new(
                proposal
                    .hash
                    .hash(&[self.nonce_responder(), self.nonce_initiator()]),
            ),
        };
        Ok(proposal.hash.prf(
            &key,
            &[
                self.public_initiator()?,
                &self.index.initiator_cookie.to_be_bytes(),
                &self.index.responder_cookie.to_be_bytes(),
                &self.sa_initiator,
                &self.id_initiator()?,
            ],
        )?)
    }

    /// Base mode responder hash for signature authentication.
    fn base_hash_responder(&self) -> Result<SecretBytes, ExchangeError> {
        let proposal = self.negotiated()?;
        let key = proposal
            .hash
            .hash(&[self.nonce_initiator(), self.nonce_responder()]);
        Ok(proposal.hash.prf(
            &key,
            &[
                self.public_initiator()?,
                self.public_responder()?,
                &self.index.initiator_cookie.to_be_bytes(),
                &self.index.responder_cookie.to_be_bytes(),
                &self.sa_initiator,
                &self.id_initiator()?,
            ],
        )?)
    }

    fn authentication_hash(&self, role: Role) -> Result<SecretBytes, ExchangeError> {
        let auth = self.negotiated()?.auth;
        match (self.mode, role, auth) {
            (ExchangeMode::Base, Role::Initiator, _) => self.base_hash_initiator(),
            (ExchangeMode::Base, Role::Responder, AuthMethod::RsaSignature) => {
                self.base_hash_responder()
            }
            (_, Role::Initiator, _) => self.hash_initiator(),
            (_, Role::Responder, _) => self.hash_responder(),
        }
    }

    fn add_authentication(
        &self,
        policy: &Policy,
        writer: &mut MessageWriter,
    ) -> Result<(), ExchangeError> {
        let hash = self.authentication_hash(self.role)?;
        match self.negotiated()?.auth {
            AuthMethod::PreSharedKey => {
                writer.add_payload(PayloadType::HASH, &hash)?;
            }
            AuthMethod::RsaSignature => {
                let pki = policy
                    .pki()
                    .ok_or(ExchangeError::Internal("No certificates are configured"))?;
                if self.remote.send_cert || self.cert_requested {
                    if let Some(cert) = pki.local_cert_der() {
                        writer.add_payload(
                            PayloadType::CERTIFICATE,
                            &message::write_certificate(CertificateEncoding::X509_SIGNATURE, cert),
                        )?;
                    }
                }
                let signature = pki.sign(&hash)?;
                writer.add_payload(PayloadType::SIGNATURE, &signature)?;
            }
        }
        Ok(())
    }

    fn verify_authentication(
        &mut self,
        policy: &Policy,
        received: &ReceivedPayloads,
    ) -> Result<(), ExchangeError> {
        let peer_role = match self.role {
            Role::Initiator => Role::Responder,
            Role::Responder => Role::Initiator,
        };
        let expected = self.authentication_hash(peer_role)?;
        match self.negotiated()?.auth {
            AuthMethod::PreSharedKey => {
                let hash = received.require_hash()?;
                if !exchange::hash_equals(&expected, hash) {
                    warn!("Phase 1 {} hash from {} doesn't match", self.index, self.remote_addr);
                    return Err(NotifyType::INVALID_HASH_INFORMATION.into());
                }
            }
            AuthMethod::RsaSignature => {
                let signature = received.require_signature()?;
                let pki = policy
                    .pki()
                    .ok_or(ExchangeError::Internal("No certificates are configured"))?;
                let peer_cert = pki.peer_certificate(received.certificate)?;
                if let Err(err) = peer_cert.verify_signature(&expected, signature) {
                    warn!("Phase 1 {} signature check failed: {}", self.index, err);
                    return Err(NotifyType::INVALID_SIGNATURE.into());
                }
                let id_peer = self
                    .id_peer
                    .as_ref()
                    .ok_or(ExchangeError::Internal("Peer identity is not known"))?;
                if !peer_cert.matches_identity(id_peer)? {
                    warn!(
                        "Peer identity {} doesn't match its certificate",
                        id_peer
                    );
                    return Err(NotifyType::INVALID_ID_INFORMATION.into());
                }
            }
        }
        Ok(())
    }

    /// Builds an informational exchange message with a single notify or delete payload,
    /// protected by the phase 1 keys if they're available.
    pub fn informational(
        &self,
        policy: &Policy,
        message_id: u32,
        payload_type: PayloadType,
        body: &[u8],
    ) -> Result<Vec<u8>, ExchangeError> {
        let crypto = match &self.crypto {
            Some(crypto) => crypto,
            None => {
                let mut writer = MessageWriter::new(
                    self.index.initiator_cookie,
                    self.index.responder_cookie,
                    ExchangeType::INFORMATIONAL,
                    Flags::NONE,
                    message_id,
                );
                writer.add_payload(payload_type, body)?;
                return Ok(writer.into_bytes());
            }
        };
        let mut writer = MessageWriter::new(
            self.index.initiator_cookie,
            self.index.responder_cookie,
            ExchangeType::INFORMATIONAL,
            Flags::ENCRYPTION,
            message_id,
        );
        let hash_range = writer.add_payload(
            PayloadType::HASH,
            &vec![0u8; crypto.hash_algorithm().output_length()],
        )?;
        writer.add_payload(payload_type, body)?;
        let hash = crypto.prf_a(&[&message_id.to_be_bytes(), writer.data_from(hash_range.end)])?;
        writer.payload_mut(hash_range).copy_from_slice(&hash);
        let mut data = writer.into_bytes();
        let iv = crypto.phase2_iv(&self.iv, message_id);
        crypto.encrypt_message(&mut data, &iv, &policy.padding)?;
        Ok(data)
    }

    /// Decrypts and authenticates a received informational message.
    pub fn open_informational(&self, policy: &Policy, data: &[u8]) -> Result<Vec<u8>, ExchangeError> {
        let message = InputMessage::from_datagram(data)?;
        let message_id = message.read_message_id();
        let crypto = match (&self.crypto, message.is_encrypted()) {
            (Some(crypto), true) => crypto,
            (None, false) => return Ok(message.raw_data().to_vec()),
            (Some(_), false) => {
                return Err("Unprotected informational message after keys are established".into())
            }
            (None, true) => return Err("Encrypted informational message without keys".into()),
        };
        let mut data = message.raw_data().to_vec();
        let iv = crypto.phase2_iv(&self.iv, message_id);
        crypto
            .decrypt_message(&mut data, &iv, &policy.padding)
            .map_err(|err| {
                debug!("Failed to decrypt informational message: {}", err);
                ExchangeError::from("Failed to decrypt message")
            })?;
        {
            let message = InputMessage::from_datagram(&data)?;
            let payloads = message.payloads()?;
            let hash = match payloads.first() {
                Some(hash) if hash.payload_type() == PayloadType::HASH => hash,
                _ => return Err("Informational message doesn't start with a Hash payload".into()),
            };
            let expected = crypto.prf_a(&[
                &message_id.to_be_bytes(),
                message.payloads_after(hash, &payloads),
            ])?;
            if !exchange::hash_equals(&expected, hash.to_hash()?) {
                debug!("Informational message hash doesn't match");
                return Err("Informational message hash doesn't match".into());
            }
        }
        Ok(data)
    }
}
