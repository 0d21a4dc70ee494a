use std::{fmt, time::Duration};

use log::{debug, warn};

use super::crypto::{DhGroup, EncryptionAlgorithm, HashAlgorithm};
use super::exchange::ExchangeError;
use super::message::{
    self, AttributeWriter, NotifyType, PayloadSecurityAssociation, ProtocolId,
    SecurityAssociationTransform, SecurityAssociationWriter, TransformData,
};
use super::policy::{
    AuthMethod, Encapsulation, EspCipher, IntegrityAlgorithm, IpsecProtocol, IpsecTransform,
    Phase1Proposal, Sainfo, DEFAULT_LIFETIME,
};

// Oakley attributes (RFC 2409, Appendix A).
const OAKLEY_ENCRYPTION_ALGORITHM: u16 = 1;
const OAKLEY_HASH_ALGORITHM: u16 = 2;
const OAKLEY_AUTHENTICATION_METHOD: u16 = 3;
const OAKLEY_GROUP_DESCRIPTION: u16 = 4;
const OAKLEY_LIFE_TYPE: u16 = 11;
const OAKLEY_LIFE_DURATION: u16 = 12;
const OAKLEY_KEY_LENGTH: u16 = 14;

// IPsec DOI attributes (RFC 2407, Section 4.5).
const IPSEC_SA_LIFE_TYPE: u16 = 1;
const IPSEC_SA_LIFE_DURATION: u16 = 2;
const IPSEC_GROUP_DESCRIPTION: u16 = 3;
const IPSEC_ENCAPSULATION_MODE: u16 = 4;
const IPSEC_AUTHENTICATION_ALGORITHM: u16 = 5;
const IPSEC_KEY_LENGTH: u16 = 6;

const LIFE_TYPE_SECONDS: u16 = 1;
const LIFE_TYPE_KILOBYTES: u16 = 2;

const KEY_IKE: u8 = 1;

fn lifetime_seconds(lifetime: Duration) -> u32 {
    lifetime.as_secs().min(u32::MAX as u64) as u32
}

fn check_situation(sa: &PayloadSecurityAssociation) -> Result<(), ExchangeError> {
    if sa.doi() != message::IPSEC_DOI {
        debug!("Unsupported DOI {}", sa.doi());
        return Err(NotifyType::DOI_NOT_SUPPORTED.into());
    }
    if sa.situation() != message::SITUATION_IDENTITY_ONLY {
        debug!("Unsupported situation {}", sa.situation());
        return Err(NotifyType::SITUATION_NOT_SUPPORTED.into());
    }
    Ok(())
}

/// Tracks the lifetime type/duration attribute pairs of a transform.
#[derive(Default)]
struct LifetimeParser {
    life_type: Option<u16>,
    seconds: Option<u32>,
}

impl LifetimeParser {
    fn life_type(&mut self, value: Option<u32>) -> Result<(), message::FormatError> {
        match value {
            Some(value) if value == LIFE_TYPE_SECONDS as u32 => {
                self.life_type = Some(LIFE_TYPE_SECONDS)
            }
            Some(value) if value == LIFE_TYPE_KILOBYTES as u32 => {
                self.life_type = Some(LIFE_TYPE_KILOBYTES)
            }
            _ => return Err("Unsupported life type".into()),
        }
        Ok(())
    }

    fn duration(&mut self, value: Option<u32>) -> Result<(), message::FormatError> {
        let value = value.ok_or("Life duration doesn't fit into 32 bits")?;
        match self.life_type.take() {
            Some(LIFE_TYPE_SECONDS) => self.seconds = Some(value),
            Some(_) => debug!("Ignoring lifetime of {} kilobytes", value),
            None => return Err("Life duration without life type".into()),
        }
        Ok(())
    }

    fn lifetime(&self) -> Duration {
        self.seconds
            .map(|seconds| Duration::from_secs(seconds as u64))
            .unwrap_or(DEFAULT_LIFETIME)
    }
}

fn phase1_attributes(proposal: &Phase1Proposal) -> AttributeWriter {
    let mut attributes = AttributeWriter::new();
    attributes.add_basic(OAKLEY_ENCRYPTION_ALGORITHM, proposal.encryption.oakley_id());
    if let Some(key_length) = proposal.encryption.key_length_attribute() {
        attributes.add_basic(OAKLEY_KEY_LENGTH, key_length);
    }
    attributes
        .add_basic(OAKLEY_HASH_ALGORITHM, proposal.hash.oakley_id())
        .add_basic(OAKLEY_AUTHENTICATION_METHOD, proposal.auth.oakley_id())
        .add_basic(OAKLEY_GROUP_DESCRIPTION, proposal.dh_group.group_number())
        .add_basic(OAKLEY_LIFE_TYPE, LIFE_TYPE_SECONDS)
        .add_u32(OAKLEY_LIFE_DURATION, lifetime_seconds(proposal.lifetime));
    attributes
}

/// Builds the body of an ISAKMP SA payload offering all proposals, as one proposal
/// with one transform per entry.
pub fn phase1_offer(proposals: &[Phase1Proposal]) -> Vec<u8> {
    let attributes = proposals.iter().map(phase1_attributes).collect::<Vec<_>>();
    let transforms = attributes
        .iter()
        .enumerate()
        .map(|(i, attributes)| TransformData {
            transform_num: (i + 1) as u8,
            transform_id: KEY_IKE,
            attributes: attributes.as_bytes(),
        })
        .collect::<Vec<_>>();
    let mut sa = SecurityAssociationWriter::new(message::IPSEC_DOI, message::SITUATION_IDENTITY_ONLY);
    sa.add_proposal(1, ProtocolId::ISAKMP, &[], &transforms);
    sa.into_bytes()
}

fn phase1_reply(proposal_num: u8, transform_num: u8, proposal: &Phase1Proposal) -> Vec<u8> {
    let attributes = phase1_attributes(proposal);
    let mut sa = SecurityAssociationWriter::new(message::IPSEC_DOI, message::SITUATION_IDENTITY_ONLY);
    sa.add_proposal(
        proposal_num,
        ProtocolId::ISAKMP,
        &[],
        &[TransformData {
            transform_num,
            transform_id: KEY_IKE,
            attributes: attributes.as_bytes(),
        }],
    );
    sa.into_bytes()
}

/// Parses an Oakley transform; returns None if it uses unsupported algorithms.
fn parse_phase1_transform(
    transform: &SecurityAssociationTransform,
) -> Result<Option<Phase1Proposal>, message::FormatError> {
    if transform.transform_id() != KEY_IKE {
        debug!("Unsupported phase 1 transform ID {}", transform.transform_id());
        return Ok(None);
    }
    let mut encryption = None;
    let mut key_length = None;
    let mut hash = None;
    let mut auth = None;
    let mut group = None;
    let mut lifetime = LifetimeParser::default();
    for attribute in transform.iter_attributes() {
        let attribute = attribute?;
        let value = attribute.value_u32();
        match attribute.attribute_type() {
            OAKLEY_ENCRYPTION_ALGORITHM => encryption = value,
            OAKLEY_KEY_LENGTH => key_length = value,
            OAKLEY_HASH_ALGORITHM => hash = value,
            OAKLEY_AUTHENTICATION_METHOD => auth = value,
            OAKLEY_GROUP_DESCRIPTION => group = value,
            OAKLEY_LIFE_TYPE => lifetime.life_type(value)?,
            OAKLEY_LIFE_DURATION => lifetime.duration(value)?,
            attribute_type => {
                debug!("Unsupported Oakley attribute {}", attribute_type);
                return Ok(None);
            }
        }
    }
    let proposal = (|| {
        Some(Phase1Proposal {
            encryption: EncryptionAlgorithm::from_oakley(encryption?, key_length)?,
            hash: HashAlgorithm::from_oakley(hash?)?,
            auth: AuthMethod::from_oakley(auth?)?,
            dh_group: DhGroup::from_group_number(group?)?,
            lifetime: lifetime.lifetime(),
        })
    })();
    Ok(proposal)
}

fn phase1_matches(offered: &Phase1Proposal, local: &Phase1Proposal) -> bool {
    offered.encryption == local.encryption
        && offered.hash == local.hash
        && offered.auth == local.auth
        && offered.dh_group == local.dh_group
        && offered.lifetime <= local.lifetime
}

/// Responder side: picks the first offered transform that matches a local proposal.
/// Returns the accepted parameters and the body of the reply SA payload.
pub fn choose_phase1(
    sa: &PayloadSecurityAssociation,
    local: &[Phase1Proposal],
    required_group: Option<DhGroup>,
) -> Result<(Phase1Proposal, Vec<u8>), ExchangeError> {
    check_situation(sa)?;
    for proposal in sa.iter_proposals() {
        let proposal = proposal?;
        if proposal.protocol_id() != ProtocolId::ISAKMP {
            debug!("Skipping phase 1 proposal for {}", proposal.protocol_id());
            continue;
        }
        for transform in proposal.iter_transforms() {
            let transform = transform?;
            let offered = match parse_phase1_transform(&transform)? {
                Some(offered) => offered,
                None => continue,
            };
            if required_group.is_some_and(|group| group != offered.dh_group) {
                debug!("Transform {} uses a different DH group", offered);
                continue;
            }
            if let Some(local) = local.iter().find(|local| phase1_matches(&offered, local)) {
                let chosen = Phase1Proposal {
                    lifetime: offered.lifetime.min(local.lifetime),
                    ..*local
                };
                debug!("Accepted phase 1 transform {}", chosen);
                let reply = phase1_reply(proposal.proposal_num(), transform.transform_num(), &chosen);
                return Ok((chosen, reply));
            }
            debug!("Transform {} doesn't match local policy", offered);
        }
    }
    warn!("No acceptable phase 1 proposal");
    Err(NotifyType::NO_PROPOSAL_CHOSEN.into())
}

/// Initiator side: checks that the responder picked exactly one of our transforms.
pub fn accept_phase1(
    sa: &PayloadSecurityAssociation,
    offered: &[Phase1Proposal],
) -> Result<Phase1Proposal, ExchangeError> {
    check_situation(sa)?;
    let mut proposals = sa.iter_proposals();
    let proposal = proposals.next().ok_or("Reply SA has no proposals")??;
    if proposals.next().is_some() || proposal.num_transforms() != 1 {
        debug!("Reply SA must contain one proposal with one transform");
        return Err(NotifyType::BAD_PROPOSAL_SYNTAX.into());
    }
    if proposal.protocol_id() != ProtocolId::ISAKMP {
        return Err(NotifyType::INVALID_PROTOCOL_ID.into());
    }
    let transform = proposal
        .iter_transforms()
        .next()
        .ok_or("Reply SA has no transforms")??;
    let accepted = parse_phase1_transform(&transform)?
        .ok_or(ExchangeError::Notify(NotifyType::NO_PROPOSAL_CHOSEN))?;
    if offered.iter().any(|local| phase1_matches(&accepted, local)) {
        Ok(accepted)
    } else {
        warn!("Peer selected a phase 1 transform that wasn't offered: {}", accepted);
        Err(NotifyType::NO_PROPOSAL_CHOSEN.into())
    }
}

/// Phase-2 parameters for one IPsec transform.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Phase2Proposal {
    pub transform: IpsecTransform,
    pub encapsulation: Encapsulation,
    pub pfs_group: Option<DhGroup>,
    pub lifetime: Duration,
}

impl fmt::Display for Phase2Proposal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.transform, self.encapsulation)?;
        if let Some(group) = self.pfs_group {
            write!(f, " PFS {}", group)?;
        }
        write!(f, " lifetime {}s", self.lifetime.as_secs())
    }
}

/// A phase-2 transform accepted from an SA payload.
#[derive(Clone, Copy, Debug)]
pub struct ChosenPhase2 {
    pub proposal: Phase2Proposal,
    pub peer_spi: u32,
    pub proposal_num: u8,
    pub transform_num: u8,
}

fn phase2_attributes(proposal: &Phase2Proposal) -> AttributeWriter {
    let mut attributes = AttributeWriter::new();
    attributes
        .add_basic(IPSEC_SA_LIFE_TYPE, LIFE_TYPE_SECONDS)
        .add_u32(IPSEC_SA_LIFE_DURATION, lifetime_seconds(proposal.lifetime));
    if let Some(group) = proposal.pfs_group {
        attributes.add_basic(IPSEC_GROUP_DESCRIPTION, group.group_number());
    }
    attributes.add_basic(IPSEC_ENCAPSULATION_MODE, proposal.encapsulation.attribute_value());
    if let Some(integrity) = proposal.transform.integrity {
        attributes.add_basic(IPSEC_AUTHENTICATION_ALGORITHM, integrity.attribute_value());
    }
    if let Some(key_length) = proposal
        .transform
        .cipher
        .and_then(|cipher| cipher.key_length_attribute())
    {
        attributes.add_basic(IPSEC_KEY_LENGTH, key_length);
    }
    attributes
}

fn phase2_transform_id(transform: &IpsecTransform) -> u8 {
    match transform.protocol {
        IpsecProtocol::Esp => transform
            .cipher
            .map(|cipher| cipher.transform_id())
            .unwrap_or(0),
        IpsecProtocol::Ah => transform
            .integrity
            .map(|integrity| integrity.ah_transform_id())
            .unwrap_or(0),
    }
}

fn sainfo_proposals(sainfo: &Sainfo) -> impl Iterator<Item = Phase2Proposal> + '_ {
    sainfo.transforms.iter().map(|transform| Phase2Proposal {
        transform: *transform,
        encapsulation: sainfo.encapsulation,
        pfs_group: sainfo.pfs_group,
        lifetime: sainfo.lifetime,
    })
}

/// Protocols used by a phase-2 policy, in the order they're offered.
pub fn sainfo_protocols(sainfo: &Sainfo) -> Vec<IpsecProtocol> {
    let mut protocols = vec![];
    for transform in sainfo.transforms.iter() {
        if !protocols.contains(&transform.protocol) {
            protocols.push(transform.protocol);
        }
    }
    protocols
}

/// Builds a phase-2 SA payload body, with one proposal per protocol and
/// the inbound SPI allocated for that protocol.
pub fn phase2_offer(
    sainfo: &Sainfo,
    spis: &[(IpsecProtocol, u32)],
) -> Result<Vec<u8>, ExchangeError> {
    let mut sa = SecurityAssociationWriter::new(message::IPSEC_DOI, message::SITUATION_IDENTITY_ONLY);
    for (i, (protocol, spi)) in spis.iter().enumerate() {
        let proposals = sainfo_proposals(sainfo)
            .filter(|proposal| proposal.transform.protocol == *protocol)
            .collect::<Vec<_>>();
        if proposals.is_empty() {
            return Err(ExchangeError::Internal("SPI allocated for an unused protocol"));
        }
        let attributes = proposals.iter().map(phase2_attributes).collect::<Vec<_>>();
        let transforms = proposals
            .iter()
            .zip(attributes.iter())
            .enumerate()
            .map(|(j, (proposal, attributes))| TransformData {
                transform_num: (j + 1) as u8,
                transform_id: phase2_transform_id(&proposal.transform),
                attributes: attributes.as_bytes(),
            })
            .collect::<Vec<_>>();
        sa.add_proposal(
            (i + 1) as u8,
            protocol.protocol_id(),
            &spi.to_be_bytes(),
            &transforms,
        );
    }
    Ok(sa.into_bytes())
}

/// Reply SA payload body, echoing the chosen transform with our inbound SPI.
pub fn phase2_reply(chosen: &ChosenPhase2, spi: u32) -> Vec<u8> {
    let attributes = phase2_attributes(&chosen.proposal);
    let mut sa = SecurityAssociationWriter::new(message::IPSEC_DOI, message::SITUATION_IDENTITY_ONLY);
    sa.add_proposal(
        chosen.proposal_num,
        chosen.proposal.transform.protocol.protocol_id(),
        &spi.to_be_bytes(),
        &[TransformData {
            transform_num: chosen.transform_num,
            transform_id: phase2_transform_id(&chosen.proposal.transform),
            attributes: attributes.as_bytes(),
        }],
    );
    sa.into_bytes()
}

fn parse_phase2_transform(
    protocol_id: ProtocolId,
    transform: &SecurityAssociationTransform,
) -> Result<Option<Phase2Proposal>, message::FormatError> {
    let mut lifetime = LifetimeParser::default();
    let mut group = None;
    let mut encapsulation = None;
    let mut auth = None;
    let mut key_length = None;
    for attribute in transform.iter_attributes() {
        let attribute = attribute?;
        let value = attribute.value_u32();
        match attribute.attribute_type() {
            IPSEC_SA_LIFE_TYPE => lifetime.life_type(value)?,
            IPSEC_SA_LIFE_DURATION => lifetime.duration(value)?,
            IPSEC_GROUP_DESCRIPTION => group = value,
            IPSEC_ENCAPSULATION_MODE => encapsulation = value,
            IPSEC_AUTHENTICATION_ALGORITHM => auth = value,
            IPSEC_KEY_LENGTH => key_length = value,
            attribute_type => {
                debug!("Unsupported IPsec attribute {}", attribute_type);
                return Ok(None);
            }
        }
    }
    let proposal = (|| {
        let integrity = match auth {
            Some(auth) => Some(IntegrityAlgorithm::from_attribute(auth)?),
            None => None,
        };
        let transform = match protocol_id {
            ProtocolId::IPSEC_ESP => IpsecTransform::esp(
                EspCipher::from_transform(transform.transform_id(), key_length)?,
                integrity,
            ),
            ProtocolId::IPSEC_AH => {
                let ah = IntegrityAlgorithm::from_ah_transform(transform.transform_id())?;
                if integrity.is_some_and(|integrity| integrity != ah) {
                    return None;
                }
                IpsecTransform::ah(ah)
            }
            _ => return None,
        };
        let pfs_group = match group {
            Some(group) => Some(DhGroup::from_group_number(group)?),
            None => None,
        };
        let encapsulation = match encapsulation {
            Some(encapsulation) => Encapsulation::from_attribute(encapsulation)?,
            None => Encapsulation::Tunnel,
        };
        Some(Phase2Proposal {
            transform,
            encapsulation,
            pfs_group,
            lifetime: lifetime.lifetime(),
        })
    })();
    Ok(proposal)
}

fn phase2_matches(offered: &Phase2Proposal, local: &Phase2Proposal) -> bool {
    offered.transform == local.transform
        && offered.encapsulation == local.encapsulation
        && offered.pfs_group == local.pfs_group
        && offered.lifetime <= local.lifetime
}

fn read_spi(spi: &[u8]) -> Result<u32, ExchangeError> {
    let spi: [u8; 4] = spi.try_into().map_err(|_| {
        debug!("Unsupported IPsec SPI length {}", spi.len());
        ExchangeError::Notify(NotifyType::INVALID_SPI)
    })?;
    Ok(u32::from_be_bytes(spi))
}

/// Responder side: picks the first offered IPsec transform allowed by the policy.
pub fn choose_phase2(
    sa: &PayloadSecurityAssociation,
    sainfo: &Sainfo,
) -> Result<ChosenPhase2, ExchangeError> {
    check_situation(sa)?;
    for proposal in sa.iter_proposals() {
        let proposal = proposal?;
        let protocol_id = proposal.protocol_id();
        if protocol_id != ProtocolId::IPSEC_ESP && protocol_id != ProtocolId::IPSEC_AH {
            debug!("Skipping phase 2 proposal for {}", protocol_id);
            continue;
        }
        let peer_spi = read_spi(proposal.spi())?;
        for transform in proposal.iter_transforms() {
            let transform = transform?;
            let offered = match parse_phase2_transform(protocol_id, &transform)? {
                Some(offered) => offered,
                None => continue,
            };
            if let Some(local) = sainfo_proposals(sainfo).find(|local| phase2_matches(&offered, local)) {
                let chosen = ChosenPhase2 {
                    proposal: Phase2Proposal {
                        lifetime: offered.lifetime.min(local.lifetime),
                        ..local
                    },
                    peer_spi,
                    proposal_num: proposal.proposal_num(),
                    transform_num: transform.transform_num(),
                };
                debug!("Accepted phase 2 transform {}", chosen.proposal);
                return Ok(chosen);
            }
            debug!("Transform {} doesn't match local policy", offered);
        }
    }
    warn!("No acceptable phase 2 proposal");
    Err(NotifyType::NO_PROPOSAL_CHOSEN.into())
}

/// Initiator side: validates the responder's choice against what was offered.
pub fn accept_phase2(
    sa: &PayloadSecurityAssociation,
    sainfo: &Sainfo,
) -> Result<ChosenPhase2, ExchangeError> {
    check_situation(sa)?;
    let mut proposals = sa.iter_proposals();
    let proposal = proposals.next().ok_or("Reply SA has no proposals")??;
    if proposals.next().is_some() || proposal.num_transforms() != 1 {
        debug!("Reply SA must contain one proposal with one transform");
        return Err(NotifyType::BAD_PROPOSAL_SYNTAX.into());
    }
    let peer_spi = read_spi(proposal.spi())?;
    let transform = proposal
        .iter_transforms()
        .next()
        .ok_or("Reply SA has no transforms")??;
    let accepted = parse_phase2_transform(proposal.protocol_id(), &transform)?
        .ok_or(ExchangeError::Notify(NotifyType::NO_PROPOSAL_CHOSEN))?;
    if !sainfo_proposals(sainfo).any(|local| phase2_matches(&accepted, &local)) {
        warn!("Peer selected a phase 2 transform that wasn't offered: {}", accepted);
        return Err(NotifyType::NO_PROPOSAL_CHOSEN.into());
    }
    Ok(ChosenPhase2 {
        proposal: accepted,
        peer_spi,
        proposal_num: proposal.proposal_num(),
        transform_num: transform.transform_num(),
    })
}

#[cfg(test)]
mod tests {
    use super::super::message::{ExchangeType, Flags, InputMessage, MessageWriter, PayloadType};
    use super::*;

    fn proposal(encryption: EncryptionAlgorithm, dh_group: DhGroup) -> Phase1Proposal {
        Phase1Proposal {
            encryption,
            hash: HashAlgorithm::Sha1,
            auth: AuthMethod::PreSharedKey,
            dh_group,
            lifetime: DEFAULT_LIFETIME,
        }
    }

    fn with_sa<F>(body: &[u8], f: F)
    where
        F: FnOnce(&PayloadSecurityAssociation),
    {
        let mut writer = MessageWriter::new(1, 0, ExchangeType::IDENTITY_PROTECTION, Flags::NONE, 0);
        writer.add_payload(PayloadType::SECURITY_ASSOCIATION, body).unwrap();
        let data = writer.into_bytes();
        let message = InputMessage::from_datagram(&data).unwrap();
        let payloads = message.payloads().unwrap();
        let sa = payloads[0].to_security_association().unwrap();
        f(&sa)
    }

    fn sainfo(pfs_group: Option<DhGroup>) -> Sainfo {
        Sainfo {
            selectors: None,
            transforms: vec![
                IpsecTransform::esp(EspCipher::Aes(16), Some(IntegrityAlgorithm::HmacSha1)),
                IpsecTransform::ah(IntegrityAlgorithm::HmacSha256),
            ],
            encapsulation: Encapsulation::Tunnel,
            pfs_group,
            lifetime: Duration::from_secs(3600),
        }
    }

    #[test]
    fn phase1_negotiation() {
        let offered = vec![
            proposal(EncryptionAlgorithm::TripleDes, DhGroup::Modp1536),
            proposal(EncryptionAlgorithm::Aes(16), DhGroup::Modp1024),
        ];
        let mut local = proposal(EncryptionAlgorithm::Aes(16), DhGroup::Modp1024);
        local.lifetime = Duration::from_secs(86400);
        let offer = phase1_offer(&offered);
        let mut reply = vec![];
        with_sa(&offer, |sa| {
            let (chosen, body) = choose_phase1(sa, &[local], None).unwrap();
            assert_eq!(chosen.encryption, EncryptionAlgorithm::Aes(16));
            // The initiator's shorter lifetime wins.
            assert_eq!(chosen.lifetime, DEFAULT_LIFETIME);
            reply = body;
        });
        with_sa(&reply, |sa| {
            let proposal = sa.iter_proposals().next().unwrap().unwrap();
            let transform = proposal.iter_transforms().next().unwrap().unwrap();
            assert_eq!(transform.transform_num(), 2);
            let accepted = accept_phase1(sa, &offered).unwrap();
            assert_eq!(accepted, offered[1]);
        });
    }

    #[test]
    fn phase1_rejects_longer_lifetime_and_other_groups() {
        let mut offered = proposal(EncryptionAlgorithm::Aes(32), DhGroup::Modp2048);
        offered.lifetime = Duration::from_secs(86400);
        let local = proposal(EncryptionAlgorithm::Aes(32), DhGroup::Modp2048);
        with_sa(&phase1_offer(&[offered]), |sa| {
            let err = choose_phase1(sa, &[local], None).err().unwrap();
            assert_eq!(err.notify_type(), Some(NotifyType::NO_PROPOSAL_CHOSEN));
        });
        with_sa(&phase1_offer(&[local]), |sa| {
            let err = choose_phase1(sa, &[local], Some(DhGroup::Modp1024)).err().unwrap();
            assert_eq!(err.notify_type(), Some(NotifyType::NO_PROPOSAL_CHOSEN));
            assert!(choose_phase1(sa, &[local], Some(DhGroup::Modp2048)).is_ok());
        });
    }

    #[test]
    fn phase1_reply_must_match_offer() {
        let offered = proposal(EncryptionAlgorithm::Aes(16), DhGroup::Modp1024);
        let other = proposal(EncryptionAlgorithm::Des, DhGroup::Modp1024);
        with_sa(&phase1_reply(1, 1, &other), |sa| {
            assert!(accept_phase1(sa, &[offered]).is_err());
        });
        with_sa(&phase1_offer(&[offered, offered]), |sa| {
            let err = accept_phase1(sa, &[offered]).err().unwrap();
            assert_eq!(err.notify_type(), Some(NotifyType::BAD_PROPOSAL_SYNTAX));
        });
    }

    #[test]
    fn unsupported_doi() {
        let mut body = phase1_offer(&[proposal(EncryptionAlgorithm::Des, DhGroup::Modp768)]);
        body[3] = 2;
        with_sa(&body, |sa| {
            let err = choose_phase1(sa, &[], None).err().unwrap();
            assert_eq!(err.notify_type(), Some(NotifyType::DOI_NOT_SUPPORTED));
        });
    }

    #[test]
    fn phase2_negotiation() {
        let policy = sainfo(Some(DhGroup::Modp1024));
        assert_eq!(
            sainfo_protocols(&policy),
            vec![IpsecProtocol::Esp, IpsecProtocol::Ah]
        );
        let offer = phase2_offer(
            &policy,
            &[(IpsecProtocol::Esp, 0x1000), (IpsecProtocol::Ah, 0x2000)],
        )
        .unwrap();
        let mut reply = vec![];
        with_sa(&offer, |sa| {
            assert_eq!(sa.iter_proposals().count(), 2);
            let chosen = choose_phase2(sa, &policy).unwrap();
            assert_eq!(chosen.peer_spi, 0x1000);
            assert_eq!(chosen.proposal.transform, policy.transforms[0]);
            assert_eq!(chosen.proposal.pfs_group, Some(DhGroup::Modp1024));
            reply = phase2_reply(&chosen, 0x3000);
        });
        with_sa(&reply, |sa| {
            let accepted = accept_phase2(sa, &policy).unwrap();
            assert_eq!(accepted.peer_spi, 0x3000);
            assert_eq!(accepted.proposal.transform, policy.transforms[0]);
            assert_eq!(accepted.proposal.lifetime, Duration::from_secs(3600));
        });
    }

    #[test]
    fn phase2_requires_matching_pfs_and_mode() {
        let offer = phase2_offer(&sainfo(None), &[(IpsecProtocol::Esp, 1)]).unwrap();
        with_sa(&offer, |sa| {
            let err = choose_phase2(sa, &sainfo(Some(DhGroup::Modp1024))).err().unwrap();
            assert_eq!(err.notify_type(), Some(NotifyType::NO_PROPOSAL_CHOSEN));
            let mut transport = sainfo(None);
            transport.encapsulation = Encapsulation::Transport;
            assert!(choose_phase2(sa, &transport).is_err());
            assert!(choose_phase2(sa, &sainfo(None)).is_ok());
        });
        assert!(phase2_offer(&sainfo(None), &[(IpsecProtocol::Ah, 1)]).is_ok());
    }

    #[test]
    fn phase2_invalid_spi() {
        let mut sa = SecurityAssociationWriter::new(message::IPSEC_DOI, message::SITUATION_IDENTITY_ONLY);
        let attributes = phase2_attributes(&sainfo_proposals(&sainfo(None)).next().unwrap());
        sa.add_proposal(
            1,
            ProtocolId::IPSEC_ESP,
            &[1, 2],
            &[TransformData {
                transform_num: 1,
                transform_id: 12,
                attributes: attributes.as_bytes(),
            }],
        );
        with_sa(&sa.into_bytes(), |sa| {
            let err = choose_phase2(sa, &sainfo(None)).err().unwrap();
            assert_eq!(err.notify_type(), Some(NotifyType::INVALID_SPI));
        });
    }
}
