use std::{
    collections::HashMap,
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    sync::Arc,
    time::Duration,
};

use log::debug;
use zeroize::Zeroizing;

use super::crypto::{DhGroup, EncryptionAlgorithm, HashAlgorithm, PaddingConfig, SecretBytes};
use super::message::{self, IdentificationType, ProtocolId};
use super::pki;

pub use super::crypto::WeakKeyPolicy;

pub const DEFAULT_RETRY_COUNT: usize = 5;
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_LIFETIME: Duration = Duration::from_secs(28800);
pub const DEFAULT_NONCE_SIZE: usize = 16;
pub const PHASE2_POLL_COUNT: usize = 30;
pub const PHASE2_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ExchangeMode {
    Main,
    Aggressive,
    Base,
}

impl ExchangeMode {
    pub fn exchange_type(&self) -> message::ExchangeType {
        match self {
            Self::Main => message::ExchangeType::IDENTITY_PROTECTION,
            Self::Aggressive => message::ExchangeType::AGGRESSIVE,
            Self::Base => message::ExchangeType::BASE,
        }
    }

    pub fn from_exchange_type(exchange_type: message::ExchangeType) -> Option<ExchangeMode> {
        match exchange_type {
            message::ExchangeType::IDENTITY_PROTECTION => Some(Self::Main),
            message::ExchangeType::AGGRESSIVE => Some(Self::Aggressive),
            message::ExchangeType::BASE => Some(Self::Base),
            _ => None,
        }
    }
}

impl fmt::Display for ExchangeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Main => write!(f, "main"),
            Self::Aggressive => write!(f, "aggressive"),
            Self::Base => write!(f, "base"),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AuthMethod {
    PreSharedKey,
    RsaSignature,
}

impl AuthMethod {
    pub fn from_oakley(value: u32) -> Option<AuthMethod> {
        match value {
            1 => Some(Self::PreSharedKey),
            3 => Some(Self::RsaSignature),
            _ => None,
        }
    }

    pub fn oakley_id(&self) -> u16 {
        match self {
            Self::PreSharedKey => 1,
            Self::RsaSignature => 3,
        }
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PreSharedKey => write!(f, "pre-shared key"),
            Self::RsaSignature => write!(f, "RSA signature"),
        }
    }
}

/// Phase-1 transform: one offered or accepted set of ISAKMP SA parameters.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Phase1Proposal {
    pub encryption: EncryptionAlgorithm,
    pub hash: HashAlgorithm,
    pub auth: AuthMethod,
    pub dh_group: DhGroup,
    pub lifetime: Duration,
}

impl fmt::Display for Phase1Proposal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} lifetime {}s",
            self.encryption,
            self.hash,
            self.auth,
            self.dh_group,
            self.lifetime.as_secs()
        )
    }
}

/// Per-peer negotiation parameters.
#[derive(Clone, Debug)]
pub struct RemoteConfig {
    /// Peer address, or None to accept any peer.
    pub remote_addr: Option<IpAddr>,
    pub exchange_mode: ExchangeMode,
    pub proposals: Vec<Phase1Proposal>,
    pub local_id: Option<message::Identification>,
    pub peer_id: Option<message::Identification>,
    pub verify_identifier: bool,
    pub retry_count: usize,
    pub retry_interval: Duration,
    pub passive: bool,
    pub initial_contact: bool,
    pub send_cert: bool,
    pub send_cr: bool,
    pub verify_cert: bool,
    pub nonce_size: usize,
}

impl RemoteConfig {
    pub fn new(remote_addr: Option<IpAddr>, proposals: Vec<Phase1Proposal>) -> RemoteConfig {
        RemoteConfig {
            remote_addr,
            exchange_mode: ExchangeMode::Main,
            proposals,
            local_id: None,
            peer_id: None,
            verify_identifier: false,
            retry_count: DEFAULT_RETRY_COUNT,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            passive: false,
            initial_contact: true,
            send_cert: true,
            send_cr: true,
            verify_cert: true,
            nonce_size: DEFAULT_NONCE_SIZE,
        }
    }

    pub fn auth_method(&self) -> Option<AuthMethod> {
        self.proposals.first().map(|proposal| proposal.auth)
    }

    pub fn dh_group(&self) -> Option<DhGroup> {
        self.proposals.first().map(|proposal| proposal.dh_group)
    }

    pub fn accepts_exchange(&self, exchange_mode: ExchangeMode) -> bool {
        self.exchange_mode == exchange_mode
    }
}

/// An IPv4 or IPv6 network, used as a traffic selector.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Subnet {
    addr: IpAddr,
    prefix_len: u8,
}

impl Subnet {
    pub fn new(addr: IpAddr, prefix_len: u8) -> Result<Subnet, &'static str> {
        let max_len = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix_len > max_len {
            return Err("Prefix length is too long");
        }
        Ok(Subnet {
            addr: mask_addr(addr, prefix_len),
            prefix_len,
        })
    }

    pub fn host(addr: IpAddr) -> Subnet {
        let prefix_len = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        Subnet { addr, prefix_len }
    }

    pub fn parse(value: &str) -> Result<Subnet, &'static str> {
        match value.split_once('/') {
            Some((addr, prefix_len)) => {
                let addr = addr.parse().map_err(|_| "Failed to parse subnet address")?;
                let prefix_len = prefix_len
                    .parse()
                    .map_err(|_| "Failed to parse subnet prefix length")?;
                Subnet::new(addr, prefix_len)
            }
            None => Ok(Subnet::host(
                value.parse().map_err(|_| "Failed to parse address")?,
            )),
        }
    }

    pub fn is_host(&self) -> bool {
        match self.addr {
            IpAddr::V4(_) => self.prefix_len == 32,
            IpAddr::V6(_) => self.prefix_len == 128,
        }
    }

    /// Encodes the subnet as an IDci/IDcr payload.
    pub fn to_identification(&self) -> message::Identification {
        match self.addr {
            IpAddr::V4(addr) if self.is_host() => {
                message::Identification::new(IdentificationType::IPV4_ADDR, addr.octets().to_vec())
            }
            IpAddr::V6(addr) if self.is_host() => {
                message::Identification::new(IdentificationType::IPV6_ADDR, addr.octets().to_vec())
            }
            IpAddr::V4(addr) => {
                let mut data = addr.octets().to_vec();
                data.extend_from_slice(&prefix_mask_v4(self.prefix_len).octets());
                message::Identification::new(IdentificationType::IPV4_ADDR_SUBNET, data)
            }
            IpAddr::V6(addr) => {
                let mut data = addr.octets().to_vec();
                data.extend_from_slice(&prefix_mask_v6(self.prefix_len).octets());
                message::Identification::new(IdentificationType::IPV6_ADDR_SUBNET, data)
            }
        }
    }

    pub fn from_identification(id: &message::Identification) -> Result<Subnet, &'static str> {
        let data = id.data();
        match id.id_type() {
            IdentificationType::IPV4_ADDR if data.len() == 4 => {
                Ok(Subnet::host(IpAddr::V4(ipv4_from_slice(data))))
            }
            IdentificationType::IPV6_ADDR if data.len() == 16 => {
                Ok(Subnet::host(IpAddr::V6(ipv6_from_slice(data))))
            }
            IdentificationType::IPV4_ADDR_SUBNET if data.len() == 8 => {
                let mask = u32::from(ipv4_from_slice(&data[4..]));
                if mask.leading_ones() + mask.trailing_zeros() != 32 {
                    return Err("IPv4 subnet mask is not contiguous");
                }
                Subnet::new(
                    IpAddr::V4(ipv4_from_slice(&data[..4])),
                    mask.leading_ones() as u8,
                )
            }
            IdentificationType::IPV6_ADDR_SUBNET if data.len() == 32 => {
                let mask = u128::from(ipv6_from_slice(&data[16..]));
                if mask.leading_ones() + mask.trailing_zeros() != 128 {
                    return Err("IPv6 subnet mask is not contiguous");
                }
                Subnet::new(
                    IpAddr::V6(ipv6_from_slice(&data[..16])),
                    mask.leading_ones() as u8,
                )
            }
            _ => Err("Unsupported traffic selector identification"),
        }
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

fn ipv4_from_slice(data: &[u8]) -> Ipv4Addr {
    let mut addr = [0u8; 4];
    addr.copy_from_slice(&data[..4]);
    Ipv4Addr::from(addr)
}

fn ipv6_from_slice(data: &[u8]) -> Ipv6Addr {
    let mut addr = [0u8; 16];
    addr.copy_from_slice(&data[..16]);
    Ipv6Addr::from(addr)
}

fn prefix_mask_v4(prefix_len: u8) -> Ipv4Addr {
    let mask = u32::MAX.checked_shl(32 - prefix_len as u32).unwrap_or(0);
    Ipv4Addr::from(mask)
}

fn prefix_mask_v6(prefix_len: u8) -> Ipv6Addr {
    let mask = u128::MAX.checked_shl(128 - prefix_len as u32).unwrap_or(0);
    Ipv6Addr::from(mask)
}

fn mask_addr(addr: IpAddr, prefix_len: u8) -> IpAddr {
    match addr {
        IpAddr::V4(addr) => {
            IpAddr::V4(Ipv4Addr::from(u32::from(addr) & u32::from(prefix_mask_v4(prefix_len))))
        }
        IpAddr::V6(addr) => IpAddr::V6(Ipv6Addr::from(
            u128::from(addr) & u128::from(prefix_mask_v6(prefix_len)),
        )),
    }
}

/// Local and remote traffic selectors of an IPsec SA.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TrafficSelectors {
    pub local: Subnet,
    pub remote: Subnet,
}

impl fmt::Display for TrafficSelectors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <=> {}", self.local, self.remote)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum IpsecProtocol {
    Esp,
    Ah,
}

impl IpsecProtocol {
    pub fn protocol_id(&self) -> ProtocolId {
        match self {
            Self::Esp => ProtocolId::IPSEC_ESP,
            Self::Ah => ProtocolId::IPSEC_AH,
        }
    }
}

impl fmt::Display for IpsecProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Esp => write!(f, "ESP"),
            Self::Ah => write!(f, "AH"),
        }
    }
}

/// ESP encryption transform, with key length in bytes where it's variable.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum EspCipher {
    Des,
    TripleDes,
    Cast(usize),
    Blowfish(usize),
    Null,
    Aes(usize),
}

impl EspCipher {
    pub fn from_transform(transform_id: u8, key_length: Option<u32>) -> Option<EspCipher> {
        let key_bytes = |default: u32, min: u32, max: u32| {
            let bits = key_length.unwrap_or(default);
            if bits < min || bits > max || bits % 8 != 0 {
                None
            } else {
                Some(bits as usize / 8)
            }
        };
        match transform_id {
            2 if key_length.is_none() => Some(Self::Des),
            3 if key_length.is_none() => Some(Self::TripleDes),
            6 => Some(Self::Cast(key_bytes(128, 40, 128)?)),
            7 => Some(Self::Blowfish(key_bytes(128, 40, 448)?)),
            11 if key_length.is_none() => Some(Self::Null),
            12 => match key_length.unwrap_or(128) {
                128 | 192 | 256 => Some(Self::Aes(key_bytes(128, 128, 256)?)),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn transform_id(&self) -> u8 {
        match self {
            Self::Des => 2,
            Self::TripleDes => 3,
            Self::Cast(_) => 6,
            Self::Blowfish(_) => 7,
            Self::Null => 11,
            Self::Aes(_) => 12,
        }
    }

    pub fn key_length(&self) -> usize {
        match self {
            Self::Des => 8,
            Self::TripleDes => 24,
            Self::Null => 0,
            Self::Cast(len) | Self::Blowfish(len) | Self::Aes(len) => *len,
        }
    }

    pub fn key_length_attribute(&self) -> Option<u16> {
        match self {
            Self::Cast(len) | Self::Blowfish(len) | Self::Aes(len) => Some((*len * 8) as u16),
            _ => None,
        }
    }
}

impl fmt::Display for EspCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Des => write!(f, "DES"),
            Self::TripleDes => write!(f, "3DES"),
            Self::Cast(len) => write!(f, "CAST-{}", len * 8),
            Self::Blowfish(len) => write!(f, "Blowfish-{}", len * 8),
            Self::Null => write!(f, "NULL"),
            Self::Aes(len) => write!(f, "AES-{}", len * 8),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum IntegrityAlgorithm {
    HmacMd5,
    HmacSha1,
    HmacSha256,
}

impl IntegrityAlgorithm {
    /// IPsec DOI authentication algorithm attribute value.
    pub fn from_attribute(value: u32) -> Option<IntegrityAlgorithm> {
        match value {
            1 => Some(Self::HmacMd5),
            2 => Some(Self::HmacSha1),
            5 => Some(Self::HmacSha256),
            _ => None,
        }
    }

    pub fn attribute_value(&self) -> u16 {
        match self {
            Self::HmacMd5 => 1,
            Self::HmacSha1 => 2,
            Self::HmacSha256 => 5,
        }
    }

    /// AH transform ID.
    pub fn from_ah_transform(transform_id: u8) -> Option<IntegrityAlgorithm> {
        match transform_id {
            2 => Some(Self::HmacMd5),
            3 => Some(Self::HmacSha1),
            5 => Some(Self::HmacSha256),
            _ => None,
        }
    }

    pub fn ah_transform_id(&self) -> u8 {
        match self {
            Self::HmacMd5 => 2,
            Self::HmacSha1 => 3,
            Self::HmacSha256 => 5,
        }
    }

    pub fn key_length(&self) -> usize {
        match self {
            Self::HmacMd5 => 16,
            Self::HmacSha1 => 20,
            Self::HmacSha256 => 32,
        }
    }
}

impl fmt::Display for IntegrityAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HmacMd5 => write!(f, "HMAC-MD5"),
            Self::HmacSha1 => write!(f, "HMAC-SHA1"),
            Self::HmacSha256 => write!(f, "HMAC-SHA256"),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Encapsulation {
    Tunnel,
    Transport,
}

impl Encapsulation {
    pub fn from_attribute(value: u32) -> Option<Encapsulation> {
        match value {
            1 => Some(Self::Tunnel),
            2 => Some(Self::Transport),
            _ => None,
        }
    }

    pub fn attribute_value(&self) -> u16 {
        match self {
            Self::Tunnel => 1,
            Self::Transport => 2,
        }
    }
}

impl fmt::Display for Encapsulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tunnel => write!(f, "tunnel"),
            Self::Transport => write!(f, "transport"),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct IpsecTransform {
    pub protocol: IpsecProtocol,
    pub cipher: Option<EspCipher>,
    pub integrity: Option<IntegrityAlgorithm>,
}

impl IpsecTransform {
    pub fn esp(cipher: EspCipher, integrity: Option<IntegrityAlgorithm>) -> IpsecTransform {
        IpsecTransform {
            protocol: IpsecProtocol::Esp,
            cipher: Some(cipher),
            integrity,
        }
    }

    pub fn ah(integrity: IntegrityAlgorithm) -> IpsecTransform {
        IpsecTransform {
            protocol: IpsecProtocol::Ah,
            cipher: None,
            integrity: Some(integrity),
        }
    }

    pub fn encryption_key_length(&self) -> usize {
        self.cipher.map(|cipher| cipher.key_length()).unwrap_or(0)
    }

    pub fn integrity_key_length(&self) -> usize {
        self.integrity
            .map(|integrity| integrity.key_length())
            .unwrap_or(0)
    }

    pub fn keymat_length(&self) -> usize {
        self.encryption_key_length() + self.integrity_key_length()
    }
}

impl fmt::Display for IpsecTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.protocol)?;
        if let Some(cipher) = self.cipher {
            write!(f, " {}", cipher)?;
        }
        if let Some(integrity) = self.integrity {
            write!(f, " {}", integrity)?;
        }
        Ok(())
    }
}

/// Phase-2 policy for a pair of traffic selectors.
#[derive(Clone, Debug)]
pub struct Sainfo {
    /// Selectors this policy applies to, or None to match any.
    pub selectors: Option<TrafficSelectors>,
    pub transforms: Vec<IpsecTransform>,
    pub encapsulation: Encapsulation,
    pub pfs_group: Option<DhGroup>,
    pub lifetime: Duration,
}

impl Sainfo {
    pub fn matches(&self, selectors: Option<&TrafficSelectors>) -> bool {
        match (&self.selectors, selectors) {
            (None, _) => true,
            (Some(own), Some(selectors)) => own == selectors,
            (Some(_), None) => false,
        }
    }
}

/// Pre-shared keys, by peer address and by peer identity.
#[derive(Default)]
pub struct PskTable {
    by_address: HashMap<IpAddr, SecretBytes>,
    by_identity: HashMap<Vec<u8>, SecretBytes>,
}

impl PskTable {
    pub fn new() -> PskTable {
        PskTable::default()
    }

    /// Adds a key; an identifier that parses as an IP address is also usable as an address key.
    pub fn add(&mut self, identifier: &str, key: &[u8]) {
        if let Ok(addr) = identifier.parse::<IpAddr>() {
            self.by_address.insert(addr, Zeroizing::new(key.to_vec()));
        }
        self.by_identity.insert(
            identifier.as_bytes().to_vec(),
            Zeroizing::new(key.to_vec()),
        );
    }

    pub fn by_address(&self, addr: IpAddr) -> Option<&[u8]> {
        self.by_address.get(&addr).map(|key| key.as_slice())
    }

    pub fn by_identity(&self, id: &message::Identification) -> Option<&[u8]> {
        let name = match id.id_type() {
            IdentificationType::FQDN | IdentificationType::USER_FQDN | IdentificationType::KEY_ID => {
                id.data().to_vec()
            }
            IdentificationType::IPV4_ADDR if id.data().len() == 4 => {
                ipv4_from_slice(id.data()).to_string().into_bytes()
            }
            IdentificationType::IPV6_ADDR if id.data().len() == 16 => {
                ipv6_from_slice(id.data()).to_string().into_bytes()
            }
            _ => return None,
        };
        self.by_identity.get(&name).map(|key| key.as_slice())
    }

    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty() && self.by_identity.is_empty()
    }
}

/// Parses an identity from its text form: an IP address, user@FQDN or FQDN.
pub fn parse_identity(value: &str) -> Result<message::Identification, &'static str> {
    if value.is_empty() {
        return Err("Identity is empty");
    }
    Ok(match value.parse::<IpAddr>() {
        Ok(IpAddr::V4(addr)) => {
            message::Identification::new(IdentificationType::IPV4_ADDR, addr.octets().to_vec())
        }
        Ok(IpAddr::V6(addr)) => {
            message::Identification::new(IdentificationType::IPV6_ADDR, addr.octets().to_vec())
        }
        Err(_) if value.contains('@') => {
            message::Identification::new(IdentificationType::USER_FQDN, value.as_bytes().to_vec())
        }
        Err(_) => message::Identification::new(IdentificationType::FQDN, value.as_bytes().to_vec()),
    })
}

pub fn address_identity(addr: IpAddr) -> message::Identification {
    match addr {
        IpAddr::V4(addr) => {
            message::Identification::new(IdentificationType::IPV4_ADDR, addr.octets().to_vec())
        }
        IpAddr::V6(addr) => {
            message::Identification::new(IdentificationType::IPV6_ADDR, addr.octets().to_vec())
        }
    }
}

/// Everything the engine needs to decide how to negotiate.
pub struct Policy {
    remotes: Vec<Arc<RemoteConfig>>,
    sainfos: Vec<Sainfo>,
    psk: PskTable,
    pki: Option<Arc<pki::PkiProcessing>>,
    pub padding: PaddingConfig,
    pub weak_keys: WeakKeyPolicy,
    pub phase2_poll_count: usize,
    pub phase2_poll_interval: Duration,
}

impl Policy {
    pub fn new(
        remotes: Vec<RemoteConfig>,
        sainfos: Vec<Sainfo>,
        psk: PskTable,
        pki: Option<pki::PkiProcessing>,
    ) -> Policy {
        Policy {
            remotes: remotes.into_iter().map(Arc::new).collect(),
            sainfos,
            psk,
            pki: pki.map(Arc::new),
            padding: PaddingConfig::default(),
            weak_keys: WeakKeyPolicy::default(),
            phase2_poll_count: PHASE2_POLL_COUNT,
            phase2_poll_interval: PHASE2_POLL_INTERVAL,
        }
    }

    /// Finds the remote configuration for a peer, preferring an exact address match.
    pub fn remote_for(&self, addr: IpAddr) -> Option<Arc<RemoteConfig>> {
        self.remotes
            .iter()
            .find(|remote| remote.remote_addr == Some(addr))
            .or_else(|| self.remotes.iter().find(|remote| remote.remote_addr.is_none()))
            .cloned()
    }

    pub fn sainfo_for(&self, selectors: Option<&TrafficSelectors>) -> Option<&Sainfo> {
        let exact = self
            .sainfos
            .iter()
            .find(|sainfo| sainfo.selectors.is_some() && sainfo.matches(selectors));
        exact.or_else(|| self.sainfos.iter().find(|sainfo| sainfo.selectors.is_none()))
    }

    /// Looks up the pre-shared key for a peer.
    /// Main mode uses only the address; other modes try the peer identity first.
    pub fn psk_for(
        &self,
        remote: &RemoteConfig,
        exchange_mode: ExchangeMode,
        addr: IpAddr,
        peer_id: Option<&message::Identification>,
    ) -> Option<&[u8]> {
        if exchange_mode == ExchangeMode::Main {
            return self.psk.by_address(addr);
        }
        if let Some(key) = peer_id.and_then(|peer_id| self.psk.by_identity(peer_id)) {
            return Some(key);
        }
        if remote.verify_identifier {
            debug!("No pre-shared key found for peer identity, and identifier verification is enabled");
            None
        } else {
            self.psk.by_address(addr)
        }
    }

    pub fn pki(&self) -> Option<&Arc<pki::PkiProcessing>> {
        self.pki.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proposal() -> Phase1Proposal {
        Phase1Proposal {
            encryption: EncryptionAlgorithm::Aes(16),
            hash: HashAlgorithm::Sha1,
            auth: AuthMethod::PreSharedKey,
            dh_group: DhGroup::Modp1024,
            lifetime: DEFAULT_LIFETIME,
        }
    }

    #[test]
    fn subnet_parsing() {
        let subnet = Subnet::parse("10.1.2.3/24").unwrap();
        assert_eq!(subnet.to_string(), "10.1.2.0/24");
        assert_eq!(Subnet::parse("10.1.2.200/24").unwrap(), subnet);
        assert_ne!(Subnet::parse("10.1.3.1/24").unwrap(), subnet);
        assert!(!subnet.is_host());
        let host = Subnet::parse("192.0.2.1").unwrap();
        assert!(host.is_host());
        assert!(Subnet::parse("10.0.0.0/33").is_err());
        assert_eq!(
            Subnet::parse("2001:db8::1/32").unwrap().to_string(),
            "2001:db8::/32"
        );
    }

    #[test]
    fn subnet_identification() {
        let subnet = Subnet::parse("10.1.0.0/16").unwrap();
        let id = subnet.to_identification();
        assert_eq!(id.id_type(), IdentificationType::IPV4_ADDR_SUBNET);
        assert_eq!(id.data(), &[10, 1, 0, 0, 255, 255, 0, 0]);
        assert_eq!(Subnet::from_identification(&id), Ok(subnet));

        let host = Subnet::parse("2001:db8::1").unwrap();
        let id = host.to_identification();
        assert_eq!(id.id_type(), IdentificationType::IPV6_ADDR);
        assert_eq!(Subnet::from_identification(&id), Ok(host));

        let broken = message::Identification::new(
            IdentificationType::IPV4_ADDR_SUBNET,
            vec![10, 1, 0, 0, 255, 0, 255, 0],
        );
        assert!(Subnet::from_identification(&broken).is_err());
    }

    #[test]
    fn remote_lookup_prefers_exact_address() {
        let anonymous = RemoteConfig::new(None, vec![proposal()]);
        let mut exact = RemoteConfig::new(Some("192.0.2.1".parse().unwrap()), vec![proposal()]);
        exact.exchange_mode = ExchangeMode::Aggressive;
        let policy = Policy::new(vec![anonymous, exact], vec![], PskTable::new(), None);
        let remote = policy.remote_for("192.0.2.1".parse().unwrap()).unwrap();
        assert_eq!(remote.exchange_mode, ExchangeMode::Aggressive);
        let remote = policy.remote_for("192.0.2.9".parse().unwrap()).unwrap();
        assert_eq!(remote.exchange_mode, ExchangeMode::Main);
    }

    #[test]
    fn psk_lookup() {
        let mut psk = PskTable::new();
        psk.add("192.0.2.1", b"by-address");
        psk.add("vpn.example.com", b"by-name");
        let mut remote = RemoteConfig::new(None, vec![proposal()]);
        let policy = Policy::new(vec![remote.clone()], vec![], psk, None);
        let addr = "192.0.2.1".parse().unwrap();
        let fqdn = parse_identity("vpn.example.com").unwrap();
        let unknown = parse_identity("other.example.com").unwrap();
        assert_eq!(
            policy.psk_for(&remote, ExchangeMode::Main, addr, Some(&fqdn)),
            Some(&b"by-address"[..])
        );
        assert_eq!(
            policy.psk_for(&remote, ExchangeMode::Aggressive, addr, Some(&fqdn)),
            Some(&b"by-name"[..])
        );
        assert_eq!(
            policy.psk_for(&remote, ExchangeMode::Aggressive, addr, Some(&unknown)),
            Some(&b"by-address"[..])
        );
        remote.verify_identifier = true;
        assert_eq!(
            policy.psk_for(&remote, ExchangeMode::Aggressive, addr, Some(&unknown)),
            None
        );
        let ip_id = address_identity(addr);
        assert_eq!(
            policy.psk_for(&remote, ExchangeMode::Base, addr, Some(&ip_id)),
            Some(&b"by-address"[..])
        );
    }

    #[test]
    fn identity_parsing() {
        assert_eq!(
            parse_identity("user@example.com").unwrap().id_type(),
            IdentificationType::USER_FQDN
        );
        assert_eq!(
            parse_identity("example.com").unwrap().id_type(),
            IdentificationType::FQDN
        );
        assert_eq!(
            parse_identity("192.0.2.1").unwrap().data(),
            &[192, 0, 2, 1]
        );
        assert!(parse_identity("").is_err());
    }

    #[test]
    fn esp_cipher_ids() {
        assert_eq!(EspCipher::from_transform(12, Some(256)), Some(EspCipher::Aes(32)));
        assert_eq!(EspCipher::from_transform(3, None), Some(EspCipher::TripleDes));
        assert_eq!(EspCipher::from_transform(3, Some(192)), None);
        assert_eq!(EspCipher::from_transform(11, None), Some(EspCipher::Null));
        let transform = IpsecTransform::esp(EspCipher::Aes(16), Some(IntegrityAlgorithm::HmacSha1));
        assert_eq!(transform.keymat_length(), 36);
    }
}
