use std::{error, fmt, ops::Range};

use log::debug;

pub const HEADER_LENGTH: usize = 28;
pub const ISAKMP_VERSION: u8 = 0x10;
pub const IPSEC_DOI: u32 = 1;
pub const SITUATION_IDENTITY_ONLY: u32 = 1;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ExchangeType(u8);

impl ExchangeType {
    pub const NONE: ExchangeType = ExchangeType(0);
    pub const BASE: ExchangeType = ExchangeType(1);
    pub const IDENTITY_PROTECTION: ExchangeType = ExchangeType(2);
    pub const AUTHENTICATION_ONLY: ExchangeType = ExchangeType(3);
    pub const AGGRESSIVE: ExchangeType = ExchangeType(4);
    pub const INFORMATIONAL: ExchangeType = ExchangeType(5);
    pub const QUICK_MODE: ExchangeType = ExchangeType(32);
    pub const NEW_GROUP_MODE: ExchangeType = ExchangeType(33);

    pub fn from_u8(value: u8) -> ExchangeType {
        ExchangeType(value)
    }

    pub fn is_phase1(&self) -> bool {
        matches!(
            *self,
            Self::BASE | Self::IDENTITY_PROTECTION | Self::AGGRESSIVE
        )
    }
}

impl fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::NONE => write!(f, "None")?,
            Self::BASE => write!(f, "Base")?,
            Self::IDENTITY_PROTECTION => write!(f, "Identity Protection")?,
            Self::AUTHENTICATION_ONLY => write!(f, "Authentication Only")?,
            Self::AGGRESSIVE => write!(f, "Aggressive")?,
            Self::INFORMATIONAL => write!(f, "Informational")?,
            Self::QUICK_MODE => write!(f, "Quick Mode")?,
            Self::NEW_GROUP_MODE => write!(f, "New Group Mode")?,
            _ => write!(f, "Unknown exchange type {}", self.0)?,
        }
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Flags(u8);

impl Flags {
    pub const NONE: Flags = Flags(0);
    pub const ENCRYPTION: Flags = Flags(1 << 0);
    pub const COMMIT: Flags = Flags(1 << 1);
    pub const AUTHENTICATION_ONLY: Flags = Flags(1 << 2);

    pub fn from_u8(value: u8) -> Result<Flags, FormatError> {
        const RESERVED_MASK: u8 = 0xff
            & !Flags::ENCRYPTION.0
            & !Flags::COMMIT.0
            & !Flags::AUTHENTICATION_ONLY.0;
        if value & RESERVED_MASK != 0x00 {
            debug!("ISAKMP reserved flags are set {}", value & RESERVED_MASK);
            return Err("ISAKMP reserved flags are set".into());
        }
        Ok(Flags(value))
    }

    pub fn has(&self, flag: Flags) -> bool {
        self.0 & flag.0 != 0
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.has(Flags::ENCRYPTION) {
            f.write_str("E")?;
        }
        if self.has(Flags::COMMIT) {
            f.write_str("C")?;
        }
        if self.has(Flags::AUTHENTICATION_ONLY) {
            f.write_str("A")?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct PayloadType(u8);

impl PayloadType {
    pub const NONE: PayloadType = PayloadType(0);
    pub const SECURITY_ASSOCIATION: PayloadType = PayloadType(1);
    pub const PROPOSAL: PayloadType = PayloadType(2);
    pub const TRANSFORM: PayloadType = PayloadType(3);
    pub const KEY_EXCHANGE: PayloadType = PayloadType(4);
    pub const IDENTIFICATION: PayloadType = PayloadType(5);
    pub const CERTIFICATE: PayloadType = PayloadType(6);
    pub const CERTIFICATE_REQUEST: PayloadType = PayloadType(7);
    pub const HASH: PayloadType = PayloadType(8);
    pub const SIGNATURE: PayloadType = PayloadType(9);
    pub const NONCE: PayloadType = PayloadType(10);
    pub const NOTIFICATION: PayloadType = PayloadType(11);
    pub const DELETE: PayloadType = PayloadType(12);
    pub const VENDOR_ID: PayloadType = PayloadType(13);

    pub fn from_u8(value: u8) -> PayloadType {
        PayloadType(value)
    }

    pub fn type_id(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for PayloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::NONE => write!(f, "No Next Payload")?,
            Self::SECURITY_ASSOCIATION => write!(f, "Security Association")?,
            Self::PROPOSAL => write!(f, "Proposal")?,
            Self::TRANSFORM => write!(f, "Transform")?,
            Self::KEY_EXCHANGE => write!(f, "Key Exchange")?,
            Self::IDENTIFICATION => write!(f, "Identification")?,
            Self::CERTIFICATE => write!(f, "Certificate")?,
            Self::CERTIFICATE_REQUEST => write!(f, "Certificate Request")?,
            Self::HASH => write!(f, "Hash")?,
            Self::SIGNATURE => write!(f, "Signature")?,
            Self::NONCE => write!(f, "Nonce")?,
            Self::NOTIFICATION => write!(f, "Notification")?,
            Self::DELETE => write!(f, "Delete")?,
            Self::VENDOR_ID => write!(f, "Vendor ID")?,
            _ => write!(f, "Unknown payload type {}", self.0)?,
        }
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ProtocolId(u8);

impl ProtocolId {
    pub const ISAKMP: ProtocolId = ProtocolId(1);
    pub const IPSEC_AH: ProtocolId = ProtocolId(2);
    pub const IPSEC_ESP: ProtocolId = ProtocolId(3);
    pub const IPCOMP: ProtocolId = ProtocolId(4);

    pub fn from_u8(value: u8) -> Result<ProtocolId, FormatError> {
        if value >= Self::ISAKMP.0 && value <= Self::IPCOMP.0 {
            Ok(ProtocolId(value))
        } else {
            debug!("Unsupported protocol ID {}", value);
            Err("Unsupported protocol ID".into())
        }
    }

    pub fn protocol_id(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::ISAKMP => write!(f, "ISAKMP")?,
            Self::IPSEC_AH => write!(f, "AH")?,
            Self::IPSEC_ESP => write!(f, "ESP")?,
            Self::IPCOMP => write!(f, "IPCOMP")?,
            _ => write!(f, "Unknown protocol {}", self.0)?,
        }
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct NotifyType(u16);

impl NotifyType {
    pub const INVALID_PAYLOAD_TYPE: NotifyType = NotifyType(1);
    pub const DOI_NOT_SUPPORTED: NotifyType = NotifyType(2);
    pub const SITUATION_NOT_SUPPORTED: NotifyType = NotifyType(3);
    pub const INVALID_COOKIE: NotifyType = NotifyType(4);
    pub const INVALID_MAJOR_VERSION: NotifyType = NotifyType(5);
    pub const INVALID_MINOR_VERSION: NotifyType = NotifyType(6);
    pub const INVALID_EXCHANGE_TYPE: NotifyType = NotifyType(7);
    pub const INVALID_FLAGS: NotifyType = NotifyType(8);
    pub const INVALID_MESSAGE_ID: NotifyType = NotifyType(9);
    pub const INVALID_PROTOCOL_ID: NotifyType = NotifyType(10);
    pub const INVALID_SPI: NotifyType = NotifyType(11);
    pub const INVALID_TRANSFORM_ID: NotifyType = NotifyType(12);
    pub const ATTRIBUTES_NOT_SUPPORTED: NotifyType = NotifyType(13);
    pub const NO_PROPOSAL_CHOSEN: NotifyType = NotifyType(14);
    pub const BAD_PROPOSAL_SYNTAX: NotifyType = NotifyType(15);
    pub const PAYLOAD_MALFORMED: NotifyType = NotifyType(16);
    pub const INVALID_KEY_INFORMATION: NotifyType = NotifyType(17);
    pub const INVALID_ID_INFORMATION: NotifyType = NotifyType(18);
    pub const INVALID_CERT_ENCODING: NotifyType = NotifyType(19);
    pub const INVALID_CERTIFICATE: NotifyType = NotifyType(20);
    pub const CERT_TYPE_UNSUPPORTED: NotifyType = NotifyType(21);
    pub const INVALID_CERT_AUTHORITY: NotifyType = NotifyType(22);
    pub const INVALID_HASH_INFORMATION: NotifyType = NotifyType(23);
    pub const AUTHENTICATION_FAILED: NotifyType = NotifyType(24);
    pub const INVALID_SIGNATURE: NotifyType = NotifyType(25);
    pub const ADDRESS_NOTIFICATION: NotifyType = NotifyType(26);
    pub const NOTIFY_SA_LIFETIME: NotifyType = NotifyType(27);
    pub const CERTIFICATE_UNAVAILABLE: NotifyType = NotifyType(28);
    pub const UNSUPPORTED_EXCHANGE_TYPE: NotifyType = NotifyType(29);
    pub const UNEQUAL_PAYLOAD_LENGTHS: NotifyType = NotifyType(30);

    pub const CONNECTED: NotifyType = NotifyType(16384);
    pub const RESPONDER_LIFETIME: NotifyType = NotifyType(24576);
    pub const REPLAY_STATUS: NotifyType = NotifyType(24577);
    pub const INITIAL_CONTACT: NotifyType = NotifyType(24578);

    pub fn from_u16(value: u16) -> NotifyType {
        NotifyType(value)
    }

    pub fn is_error(&self) -> bool {
        self.0 < 16384
    }
}

impl fmt::Display for NotifyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::INVALID_PAYLOAD_TYPE => write!(f, "INVALID-PAYLOAD-TYPE")?,
            Self::DOI_NOT_SUPPORTED => write!(f, "DOI-NOT-SUPPORTED")?,
            Self::SITUATION_NOT_SUPPORTED => write!(f, "SITUATION-NOT-SUPPORTED")?,
            Self::INVALID_COOKIE => write!(f, "INVALID-COOKIE")?,
            Self::INVALID_MAJOR_VERSION => write!(f, "INVALID-MAJOR-VERSION")?,
            Self::INVALID_MINOR_VERSION => write!(f, "INVALID-MINOR-VERSION")?,
            Self::INVALID_EXCHANGE_TYPE => write!(f, "INVALID-EXCHANGE-TYPE")?,
            Self::INVALID_FLAGS => write!(f, "INVALID-FLAGS")?,
            Self::INVALID_MESSAGE_ID => write!(f, "INVALID-MESSAGE-ID")?,
            Self::INVALID_PROTOCOL_ID => write!(f, "INVALID-PROTOCOL-ID")?,
            Self::INVALID_SPI => write!(f, "INVALID-SPI")?,
            Self::INVALID_TRANSFORM_ID => write!(f, "INVALID-TRANSFORM-ID")?,
            Self::ATTRIBUTES_NOT_SUPPORTED => write!(f, "ATTRIBUTES-NOT-SUPPORTED")?,
            Self::NO_PROPOSAL_CHOSEN => write!(f, "NO-PROPOSAL-CHOSEN")?,
            Self::BAD_PROPOSAL_SYNTAX => write!(f, "BAD-PROPOSAL-SYNTAX")?,
            Self::PAYLOAD_MALFORMED => write!(f, "PAYLOAD-MALFORMED")?,
            Self::INVALID_KEY_INFORMATION => write!(f, "INVALID-KEY-INFORMATION")?,
            Self::INVALID_ID_INFORMATION => write!(f, "INVALID-ID-INFORMATION")?,
            Self::INVALID_CERT_ENCODING => write!(f, "INVALID-CERT-ENCODING")?,
            Self::INVALID_CERTIFICATE => write!(f, "INVALID-CERTIFICATE")?,
            Self::CERT_TYPE_UNSUPPORTED => write!(f, "CERT-TYPE-UNSUPPORTED")?,
            Self::INVALID_CERT_AUTHORITY => write!(f, "INVALID-CERT-AUTHORITY")?,
            Self::INVALID_HASH_INFORMATION => write!(f, "INVALID-HASH-INFORMATION")?,
            Self::AUTHENTICATION_FAILED => write!(f, "AUTHENTICATION-FAILED")?,
            Self::INVALID_SIGNATURE => write!(f, "INVALID-SIGNATURE")?,
            Self::ADDRESS_NOTIFICATION => write!(f, "ADDRESS-NOTIFICATION")?,
            Self::NOTIFY_SA_LIFETIME => write!(f, "NOTIFY-SA-LIFETIME")?,
            Self::CERTIFICATE_UNAVAILABLE => write!(f, "CERTIFICATE-UNAVAILABLE")?,
            Self::UNSUPPORTED_EXCHANGE_TYPE => write!(f, "UNSUPPORTED-EXCHANGE-TYPE")?,
            Self::UNEQUAL_PAYLOAD_LENGTHS => write!(f, "UNEQUAL-PAYLOAD-LENGTHS")?,
            Self::CONNECTED => write!(f, "CONNECTED")?,
            Self::RESPONDER_LIFETIME => write!(f, "RESPONDER-LIFETIME")?,
            Self::REPLAY_STATUS => write!(f, "REPLAY-STATUS")?,
            Self::INITIAL_CONTACT => write!(f, "INITIAL-CONTACT")?,
            _ => write!(f, "Unknown notify type {}", self.0)?,
        }
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct IdentificationType(u8);

impl IdentificationType {
    pub const IPV4_ADDR: IdentificationType = IdentificationType(1);
    pub const FQDN: IdentificationType = IdentificationType(2);
    pub const USER_FQDN: IdentificationType = IdentificationType(3);
    pub const IPV4_ADDR_SUBNET: IdentificationType = IdentificationType(4);
    pub const IPV6_ADDR: IdentificationType = IdentificationType(5);
    pub const IPV6_ADDR_SUBNET: IdentificationType = IdentificationType(6);
    pub const IPV4_ADDR_RANGE: IdentificationType = IdentificationType(7);
    pub const IPV6_ADDR_RANGE: IdentificationType = IdentificationType(8);
    pub const DER_ASN1_DN: IdentificationType = IdentificationType(9);
    pub const DER_ASN1_GN: IdentificationType = IdentificationType(10);
    pub const KEY_ID: IdentificationType = IdentificationType(11);

    pub fn from_u8(value: u8) -> Result<IdentificationType, FormatError> {
        if value >= Self::IPV4_ADDR.0 && value <= Self::KEY_ID.0 {
            Ok(IdentificationType(value))
        } else {
            debug!("Unsupported identification type {}", value);
            Err("Unsupported identification type".into())
        }
    }

    pub fn type_id(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for IdentificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::IPV4_ADDR => write!(f, "IPV4_ADDR")?,
            Self::FQDN => write!(f, "FQDN")?,
            Self::USER_FQDN => write!(f, "USER_FQDN")?,
            Self::IPV4_ADDR_SUBNET => write!(f, "IPV4_ADDR_SUBNET")?,
            Self::IPV6_ADDR => write!(f, "IPV6_ADDR")?,
            Self::IPV6_ADDR_SUBNET => write!(f, "IPV6_ADDR_SUBNET")?,
            Self::IPV4_ADDR_RANGE => write!(f, "IPV4_ADDR_RANGE")?,
            Self::IPV6_ADDR_RANGE => write!(f, "IPV6_ADDR_RANGE")?,
            Self::DER_ASN1_DN => write!(f, "DER_ASN1_DN")?,
            Self::DER_ASN1_GN => write!(f, "DER_ASN1_GN")?,
            Self::KEY_ID => write!(f, "KEY_ID")?,
            _ => write!(f, "Unknown ID type {}", self.0)?,
        }
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct CertificateEncoding(u8);

impl CertificateEncoding {
    pub const X509_SIGNATURE: CertificateEncoding = CertificateEncoding(4);

    pub fn from_u8(value: u8) -> CertificateEncoding {
        CertificateEncoding(value)
    }
}

impl fmt::Display for CertificateEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::X509_SIGNATURE => write!(f, "X.509 Certificate - Signature"),
            _ => write!(f, "Unknown certificate encoding {}", self.0),
        }
    }
}

fn read_u16(data: &[u8]) -> u16 {
    let mut result = [0u8; 2];
    result.copy_from_slice(&data[0..2]);
    u16::from_be_bytes(result)
}

fn read_u32(data: &[u8]) -> u32 {
    let mut result = [0u8; 4];
    result.copy_from_slice(&data[0..4]);
    u32::from_be_bytes(result)
}

fn read_u64(data: &[u8]) -> u64 {
    let mut result = [0u8; 8];
    result.copy_from_slice(&data[0..8]);
    u64::from_be_bytes(result)
}

pub struct InputMessage<'a> {
    data: &'a [u8],
}

// Parse and validate using spec from RFC 2408, Section 3.
impl<'a> InputMessage<'a> {
    pub fn from_datagram(p: &'a [u8]) -> Result<InputMessage<'a>, FormatError> {
        if p.len() < HEADER_LENGTH {
            debug!("Not enough data in message");
            return Err("Not enough data in message".into());
        }
        let declared_length = read_u32(&p[24..28]) as usize;
        if declared_length < HEADER_LENGTH {
            debug!("Declared message length {} is too short", declared_length);
            return Err("Declared message length is too short".into());
        }
        if declared_length > p.len() {
            debug!(
                "Packet length mismatch (received {} bytes, header specified {} bytes)",
                p.len(),
                declared_length
            );
            return Err("Packet length mismatch".into());
        }
        if declared_length < p.len() {
            debug!(
                "Ignoring {} bytes after end of message",
                p.len() - declared_length
            );
        }
        Ok(InputMessage {
            data: &p[..declared_length],
        })
    }

    pub fn read_initiator_cookie(&self) -> u64 {
        read_u64(&self.data[0..8])
    }

    pub fn read_responder_cookie(&self) -> u64 {
        read_u64(&self.data[8..16])
    }

    pub fn read_next_payload(&self) -> PayloadType {
        PayloadType::from_u8(self.data[16])
    }

    pub fn read_version(&self) -> (u8, u8) {
        let version = self.data[17];
        (version >> 4 & 0x0f, version & 0x0f)
    }

    pub fn read_exchange_type(&self) -> ExchangeType {
        ExchangeType::from_u8(self.data[18])
    }

    pub fn read_flags(&self) -> Result<Flags, FormatError> {
        Flags::from_u8(self.data[19])
    }

    pub fn read_message_id(&self) -> u32 {
        read_u32(&self.data[20..24])
    }

    pub fn read_length(&self) -> u32 {
        read_u32(&self.data[24..28])
    }

    pub fn is_encrypted(&self) -> bool {
        self.data[19] & Flags::ENCRYPTION.0 != 0
    }

    pub fn raw_data(&self) -> &'a [u8] {
        self.data
    }

    pub fn iter_payloads(&self) -> PayloadIter<'a> {
        PayloadIter {
            next_payload: self.read_next_payload(),
            data: self.data,
            offset: HEADER_LENGTH,
            failed: false,
        }
    }

    /// Parses the whole payload chain, failing if any payload is malformed.
    pub fn payloads(&self) -> Result<Vec<Payload<'a>>, FormatError> {
        self.iter_payloads().collect()
    }

    /// Returns the bytes of all payloads following `payload`, excluding any padding.
    pub fn payloads_after(&self, payload: &Payload, all: &[Payload]) -> &'a [u8] {
        let start = payload.end();
        let end = all.last().map(|last| last.end()).unwrap_or(start).max(start);
        &self.data[start..end]
    }
}

impl fmt::Debug for InputMessage<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (major_version, minor_version) = self.read_version();
        writeln!(
            f,
            "Initiator cookie {:016x} Responder cookie {:016x}",
            self.read_initiator_cookie(),
            self.read_responder_cookie()
        )?;
        writeln!(
            f,
            "Version {}.{} Exchange type {} Flags {:02x} Message ID {:08x} Length {}",
            major_version,
            minor_version,
            self.read_exchange_type(),
            self.data[19],
            self.read_message_id(),
            self.read_length()
        )?;
        if self.is_encrypted() {
            return writeln!(f, "  Encrypted payloads");
        }
        for pl in self.iter_payloads() {
            match pl {
                Ok(pl) => writeln!(f, "  Payload {} length {}", pl.payload_type, pl.data.len())?,
                Err(err) => writeln!(f, "  Payload error {}", err)?,
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy)]
pub struct Payload<'a> {
    payload_type: PayloadType,
    offset: usize,
    data: &'a [u8],
}

impl<'a> Payload<'a> {
    pub fn payload_type(&self) -> PayloadType {
        self.payload_type
    }

    /// Payload body, without the generic payload header.
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    fn end(&self) -> usize {
        self.offset + 4 + self.data.len()
    }

    pub fn to_security_association(&self) -> Result<PayloadSecurityAssociation<'a>, FormatError> {
        if self.payload_type != PayloadType::SECURITY_ASSOCIATION {
            return Err("Payload type is not SECURITY_ASSOCIATION".into());
        }
        PayloadSecurityAssociation::from_payload(self.data)
    }

    pub fn to_key_exchange(&self) -> Result<&'a [u8], FormatError> {
        if self.payload_type != PayloadType::KEY_EXCHANGE {
            return Err("Payload type is not KEY_EXCHANGE".into());
        }
        if self.data.is_empty() {
            return Err("Key exchange payload is empty".into());
        }
        Ok(self.data)
    }

    pub fn to_identification(&self) -> Result<PayloadIdentification<'a>, FormatError> {
        if self.payload_type != PayloadType::IDENTIFICATION {
            return Err("Payload type is not IDENTIFICATION".into());
        }
        PayloadIdentification::from_payload(self.data)
    }

    pub fn to_certificate(&self) -> Result<PayloadCertificate<'a>, FormatError> {
        if self.payload_type != PayloadType::CERTIFICATE
            && self.payload_type != PayloadType::CERTIFICATE_REQUEST
        {
            return Err("Payload type is not CERTIFICATE or CERTIFICATE_REQUEST".into());
        }
        if self.data.is_empty() {
            return Err("Certificate payload is empty".into());
        }
        Ok(PayloadCertificate {
            encoding: CertificateEncoding::from_u8(self.data[0]),
            data: &self.data[1..],
        })
    }

    pub fn to_hash(&self) -> Result<&'a [u8], FormatError> {
        if self.payload_type != PayloadType::HASH {
            return Err("Payload type is not HASH".into());
        }
        Ok(self.data)
    }

    pub fn to_signature(&self) -> Result<&'a [u8], FormatError> {
        if self.payload_type != PayloadType::SIGNATURE {
            return Err("Payload type is not SIGNATURE".into());
        }
        Ok(self.data)
    }

    pub fn to_nonce(&self) -> Result<&'a [u8], FormatError> {
        if self.payload_type != PayloadType::NONCE {
            return Err("Payload type is not NONCE".into());
        }
        // RFC 2409, Section 5: nonce length must be between 8 and 256 bytes.
        if self.data.len() < 8 || self.data.len() > 256 {
            debug!("Invalid nonce length {}", self.data.len());
            return Err("Invalid nonce length".into());
        }
        Ok(self.data)
    }

    pub fn to_notify(&self) -> Result<PayloadNotify<'a>, FormatError> {
        if self.payload_type != PayloadType::NOTIFICATION {
            return Err("Payload type is not NOTIFICATION".into());
        }
        PayloadNotify::from_payload(self.data)
    }

    pub fn to_delete(&self) -> Result<PayloadDelete<'a>, FormatError> {
        if self.payload_type != PayloadType::DELETE {
            return Err("Payload type is not DELETE".into());
        }
        PayloadDelete::from_payload(self.data)
    }
}

pub struct PayloadIter<'a> {
    next_payload: PayloadType,
    data: &'a [u8],
    offset: usize,
    failed: bool,
}

impl<'a> Iterator for PayloadIter<'a> {
    type Item = Result<Payload<'a>, FormatError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.next_payload == PayloadType::NONE {
            return None;
        }
        let remaining = &self.data[self.offset..];
        if remaining.len() < 4 {
            debug!("Not enough data in payload {}", self.next_payload);
            self.failed = true;
            return Some(Err("Not enough data in payload".into()));
        }
        let next_payload = PayloadType::from_u8(remaining[0]);
        let payload_length = read_u16(&remaining[2..4]) as usize;
        if payload_length < 4 {
            debug!("Payload {} length {} is too short", self.next_payload, payload_length);
            self.failed = true;
            return Some(Err("Payload length is too short".into()));
        }
        if payload_length > remaining.len() {
            debug!(
                "Payload {} overflow ({} bytes declared, {} available)",
                self.next_payload,
                payload_length,
                remaining.len()
            );
            self.failed = true;
            return Some(Err("Payload overflow".into()));
        }
        let item = Payload {
            payload_type: self.next_payload,
            offset: self.offset,
            data: &remaining[4..payload_length],
        };
        self.next_payload = next_payload;
        self.offset += payload_length;
        if self.next_payload == PayloadType::NONE && self.offset != self.data.len() {
            debug!(
                "Ignoring {} bytes after last payload",
                self.data.len() - self.offset
            );
        }
        Some(Ok(item))
    }
}

pub struct PayloadSecurityAssociation<'a> {
    doi: u32,
    situation: u32,
    data: &'a [u8],
}

impl<'a> PayloadSecurityAssociation<'a> {
    fn from_payload(data: &'a [u8]) -> Result<PayloadSecurityAssociation<'a>, FormatError> {
        if data.len() < 8 {
            debug!("Not enough data in security association");
            return Err("Not enough data in security association".into());
        }
        Ok(PayloadSecurityAssociation {
            doi: read_u32(&data[0..4]),
            situation: read_u32(&data[4..8]),
            data: &data[8..],
        })
    }

    pub fn doi(&self) -> u32 {
        self.doi
    }

    pub fn situation(&self) -> u32 {
        self.situation
    }

    pub fn iter_proposals(&self) -> SecurityAssociationIter<'a> {
        SecurityAssociationIter {
            data: self.data,
            failed: false,
        }
    }
}

pub struct SecurityAssociationIter<'a> {
    data: &'a [u8],
    failed: bool,
}

impl<'a> Iterator for SecurityAssociationIter<'a> {
    type Item = Result<SecurityAssociationProposal<'a>, FormatError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.data.is_empty() {
            return None;
        }
        self.failed = true;
        if self.data.len() < 8 {
            debug!("Not enough data in proposal");
            return Some(Err("Not enough data in proposal".into()));
        }
        let last_substruct = self.data[0];
        let proposal_length = read_u16(&self.data[2..4]) as usize;
        if proposal_length < 8 || proposal_length > self.data.len() {
            debug!("Proposal length {} is out of bounds", proposal_length);
            return Some(Err("Proposal length is out of bounds".into()));
        }
        match last_substruct {
            0 if proposal_length != self.data.len() => {
                debug!("Unaccounted proposal bytes");
                return Some(Err("Unaccounted proposal bytes".into()));
            }
            2 if proposal_length == self.data.len() => {
                debug!("Missing proposal after proposal {}", self.data[4]);
                return Some(Err("Missing proposal".into()));
            }
            0 | 2 => {}
            _ => {
                debug!("Unexpected proposal last substruc {}", last_substruct);
                return Some(Err("Unexpected proposal last substruc".into()));
            }
        }
        let proposal_num = self.data[4];
        let protocol_id = match ProtocolId::from_u8(self.data[5]) {
            Ok(protocol_id) => protocol_id,
            Err(err) => return Some(Err(err)),
        };
        let spi_size = self.data[6] as usize;
        let num_transforms = self.data[7] as usize;
        if 8 + spi_size > proposal_length {
            debug!("Proposal SPI overflow");
            return Some(Err("Proposal SPI overflow".into()));
        }
        let item = SecurityAssociationProposal {
            proposal_num,
            protocol_id,
            num_transforms,
            spi: &self.data[8..8 + spi_size],
            data: &self.data[8 + spi_size..proposal_length],
        };
        self.data = &self.data[proposal_length..];
        self.failed = false;
        Some(Ok(item))
    }
}

pub struct SecurityAssociationProposal<'a> {
    proposal_num: u8,
    protocol_id: ProtocolId,
    num_transforms: usize,
    spi: &'a [u8],
    data: &'a [u8],
}

impl<'a> SecurityAssociationProposal<'a> {
    pub fn proposal_num(&self) -> u8 {
        self.proposal_num
    }

    pub fn protocol_id(&self) -> ProtocolId {
        self.protocol_id
    }

    pub fn spi(&self) -> &'a [u8] {
        self.spi
    }

    pub fn num_transforms(&self) -> usize {
        self.num_transforms
    }

    pub fn iter_transforms(&self) -> SecurityAssociationTransformIter<'a> {
        SecurityAssociationTransformIter {
            num_transforms: self.num_transforms,
            data: self.data,
            failed: false,
        }
    }
}

pub struct SecurityAssociationTransformIter<'a> {
    num_transforms: usize,
    data: &'a [u8],
    failed: bool,
}

impl<'a> Iterator for SecurityAssociationTransformIter<'a> {
    type Item = Result<SecurityAssociationTransform<'a>, FormatError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if self.data.is_empty() {
            if self.num_transforms != 0 {
                debug!("Proposal is missing {} transforms", self.num_transforms);
                self.failed = true;
                return Some(Err("Proposal is missing transforms".into()));
            }
            return None;
        }
        self.failed = true;
        if self.data.len() < 8 {
            debug!("Not enough data in transform");
            return Some(Err("Not enough data in transform".into()));
        }
        let last_substruct = self.data[0];
        let transform_length = read_u16(&self.data[2..4]) as usize;
        if transform_length < 8 || transform_length > self.data.len() {
            debug!("Transform length {} is out of bounds", transform_length);
            return Some(Err("Transform length is out of bounds".into()));
        }
        match last_substruct {
            0 if transform_length != self.data.len() => {
                debug!("Unaccounted transform bytes");
                return Some(Err("Unaccounted transform bytes".into()));
            }
            3 if transform_length == self.data.len() => {
                debug!("Missing transform after transform {}", self.data[4]);
                return Some(Err("Missing transform".into()));
            }
            0 | 3 => {}
            _ => {
                debug!("Unexpected transform last substruc {}", last_substruct);
                return Some(Err("Unexpected transform last substruc".into()));
            }
        }
        let item = SecurityAssociationTransform {
            transform_num: self.data[4],
            transform_id: self.data[5],
            data: &self.data[8..transform_length],
        };
        self.data = &self.data[transform_length..];
        self.num_transforms = self.num_transforms.saturating_sub(1);
        self.failed = false;
        Some(Ok(item))
    }
}

pub struct SecurityAssociationTransform<'a> {
    transform_num: u8,
    transform_id: u8,
    data: &'a [u8],
}

impl<'a> SecurityAssociationTransform<'a> {
    pub fn transform_num(&self) -> u8 {
        self.transform_num
    }

    pub fn transform_id(&self) -> u8 {
        self.transform_id
    }

    pub fn iter_attributes(&self) -> SecurityAssociationTransformAttributesIter<'a> {
        SecurityAssociationTransformAttributesIter {
            data: self.data,
            failed: false,
        }
    }
}

pub struct SecurityAssociationTransformAttributesIter<'a> {
    data: &'a [u8],
    failed: bool,
}

impl<'a> Iterator for SecurityAssociationTransformAttributesIter<'a> {
    type Item = Result<SecurityAssociationTransformAttribute<'a>, FormatError>;

    fn next(&mut self) -> Option<Self::Item> {
        const ATTRIBUTE_FORMAT_TV: u16 = 1 << 15;
        if self.failed || self.data.is_empty() {
            return None;
        }
        if self.data.len() < 4 {
            debug!("Not enough data in transform attribute");
            self.failed = true;
            return Some(Err("Not enough data in transform attribute".into()));
        }
        let attribute_type = read_u16(&self.data[0..2]);
        let (value, length) = if attribute_type & ATTRIBUTE_FORMAT_TV != 0 {
            (AttributeValue::Basic(read_u16(&self.data[2..4])), 4)
        } else {
            let value_length = read_u16(&self.data[2..4]) as usize;
            if 4 + value_length > self.data.len() {
                debug!("Transform attribute overflow");
                self.failed = true;
                return Some(Err("Transform attribute overflow".into()));
            }
            (
                AttributeValue::Variable(&self.data[4..4 + value_length]),
                4 + value_length,
            )
        };
        self.data = &self.data[length..];
        Some(Ok(SecurityAssociationTransformAttribute {
            attribute_type: attribute_type & !ATTRIBUTE_FORMAT_TV,
            value,
        }))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttributeValue<'a> {
    Basic(u16),
    Variable(&'a [u8]),
}

pub struct SecurityAssociationTransformAttribute<'a> {
    attribute_type: u16,
    value: AttributeValue<'a>,
}

impl<'a> SecurityAssociationTransformAttribute<'a> {
    pub fn attribute_type(&self) -> u16 {
        self.attribute_type
    }

    #[cfg(test)]
    pub fn value(&self) -> AttributeValue<'a> {
        self.value
    }

    /// Numeric value of the attribute, if it fits into 32 bits.
    pub fn value_u32(&self) -> Option<u32> {
        match self.value {
            AttributeValue::Basic(value) => Some(value as u32),
            AttributeValue::Variable(data) if !data.is_empty() && data.len() <= 4 => {
                Some(data.iter().fold(0u32, |acc, b| (acc << 8) | *b as u32))
            }
            AttributeValue::Variable(_) => None,
        }
    }
}

pub struct PayloadIdentification<'a> {
    id_type: IdentificationType,
    protocol_id: u8,
    port: u16,
    raw: &'a [u8],
}

impl<'a> PayloadIdentification<'a> {
    fn from_payload(data: &'a [u8]) -> Result<PayloadIdentification<'a>, FormatError> {
        if data.len() < 4 {
            debug!("Not enough data in identification");
            return Err("Not enough data in identification".into());
        }
        Ok(PayloadIdentification {
            id_type: IdentificationType::from_u8(data[0])?,
            protocol_id: data[1],
            port: read_u16(&data[2..4]),
            raw: data,
        })
    }

    pub fn id_type(&self) -> IdentificationType {
        self.id_type
    }

    pub fn protocol_id(&self) -> u8 {
        self.protocol_id
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn identification_data(&self) -> &'a [u8] {
        &self.raw[4..]
    }
}

pub struct PayloadCertificate<'a> {
    encoding: CertificateEncoding,
    data: &'a [u8],
}

impl<'a> PayloadCertificate<'a> {
    pub fn encoding(&self) -> CertificateEncoding {
        self.encoding
    }

    pub fn read_value(&self) -> &'a [u8] {
        self.data
    }
}

pub struct PayloadNotify<'a> {
    notify_type: NotifyType,
    spi: &'a [u8],
}

impl<'a> PayloadNotify<'a> {
    fn from_payload(data: &'a [u8]) -> Result<PayloadNotify<'a>, FormatError> {
        if data.len() < 8 {
            debug!("Not enough data in notification");
            return Err("Not enough data in notification".into());
        }
        let spi_size = data[5] as usize;
        if 8 + spi_size > data.len() {
            debug!("Notification SPI overflow");
            return Err("Notification SPI overflow".into());
        }
        Ok(PayloadNotify {
            notify_type: NotifyType::from_u16(read_u16(&data[6..8])),
            spi: &data[8..8 + spi_size],
        })
    }

    pub fn notify_type(&self) -> NotifyType {
        self.notify_type
    }

    pub fn spi(&self) -> &'a [u8] {
        self.spi
    }
}

pub struct PayloadDelete<'a> {
    protocol_id: u8,
    spi_size: usize,
    data: &'a [u8],
}

impl<'a> PayloadDelete<'a> {
    fn from_payload(data: &'a [u8]) -> Result<PayloadDelete<'a>, FormatError> {
        if data.len() < 8 {
            debug!("Not enough data in delete payload");
            return Err("Not enough data in delete payload".into());
        }
        let spi_size = data[5] as usize;
        let num_spi = read_u16(&data[6..8]) as usize;
        if spi_size == 0 || spi_size * num_spi != data.len() - 8 {
            debug!(
                "Delete payload SPI size {} count {} doesn't match length {}",
                spi_size,
                num_spi,
                data.len()
            );
            return Err("Delete payload SPI list is malformed".into());
        }
        Ok(PayloadDelete {
            protocol_id: data[4],
            spi_size,
            data: &data[8..],
        })
    }

    pub fn protocol_id(&self) -> u8 {
        self.protocol_id
    }

    pub fn iter_spi(&self) -> impl Iterator<Item = &'a [u8]> {
        self.data.chunks_exact(self.spi_size)
    }
}

/// Identification payload contents, owned.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Identification {
    id_type: IdentificationType,
    protocol_id: u8,
    port: u16,
    data: Vec<u8>,
}

impl Identification {
    pub fn new(id_type: IdentificationType, data: Vec<u8>) -> Identification {
        Identification {
            id_type,
            protocol_id: 0,
            port: 0,
            data,
        }
    }

    #[cfg(test)]
    pub fn with_protocol(mut self, protocol_id: u8, port: u16) -> Identification {
        self.protocol_id = protocol_id;
        self.port = port;
        self
    }

    pub fn from_payload(payload: &PayloadIdentification) -> Identification {
        Identification {
            id_type: payload.id_type(),
            protocol_id: payload.protocol_id(),
            port: payload.port(),
            data: payload.identification_data().to_vec(),
        }
    }

    pub fn id_type(&self) -> IdentificationType {
        self.id_type
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Encodes the payload body (type, protocol, port and data).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut result = Vec::with_capacity(4 + self.data.len());
        result.push(self.id_type.type_id());
        result.push(self.protocol_id);
        result.extend_from_slice(&self.port.to_be_bytes());
        result.extend_from_slice(&self.data);
        result
    }
}

impl fmt::Display for Identification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id_type {
            IdentificationType::FQDN | IdentificationType::USER_FQDN => {
                write!(f, "{} {}", self.id_type, String::from_utf8_lossy(&self.data))
            }
            IdentificationType::IPV4_ADDR if self.data.len() == 4 => {
                let mut addr = [0u8; 4];
                addr.copy_from_slice(&self.data);
                write!(f, "{} {}", self.id_type, std::net::Ipv4Addr::from(addr))
            }
            IdentificationType::IPV6_ADDR if self.data.len() == 16 => {
                let mut addr = [0u8; 16];
                addr.copy_from_slice(&self.data);
                write!(f, "{} {}", self.id_type, std::net::Ipv6Addr::from(addr))
            }
            _ => write!(
                f,
                "{} {}",
                self.id_type,
                crate::logger::fmt_slice_hex(&self.data)
            ),
        }
    }
}

/// Builds an outgoing message: header followed by a chain of payloads.
pub struct MessageWriter {
    data: Vec<u8>,
    next_payload_offset: usize,
}

impl MessageWriter {
    pub fn new(
        initiator_cookie: u64,
        responder_cookie: u64,
        exchange_type: ExchangeType,
        flags: Flags,
        message_id: u32,
    ) -> MessageWriter {
        let mut data = Vec::with_capacity(512);
        data.extend_from_slice(&initiator_cookie.to_be_bytes());
        data.extend_from_slice(&responder_cookie.to_be_bytes());
        data.push(PayloadType::NONE.0);
        data.push(ISAKMP_VERSION);
        data.push(exchange_type.0);
        data.push(flags.0);
        data.extend_from_slice(&message_id.to_be_bytes());
        data.extend_from_slice(&[0u8; 4]);
        MessageWriter {
            data,
            next_payload_offset: 16,
        }
    }

    /// Appends a payload and returns the range of its body within the message.
    pub fn add_payload(
        &mut self,
        payload_type: PayloadType,
        body: &[u8],
    ) -> Result<Range<usize>, FormatError> {
        let payload_length = match u16::try_from(4 + body.len()) {
            Ok(length) => length,
            Err(_) => {
                debug!("Payload body of {} bytes doesn't fit", body.len());
                return Err("Payload is too long".into());
            }
        };
        self.data[self.next_payload_offset] = payload_type.0;
        self.next_payload_offset = self.data.len();
        self.data.push(PayloadType::NONE.0);
        self.data.push(0);
        self.data.extend_from_slice(&payload_length.to_be_bytes());
        let start = self.data.len();
        self.data.extend_from_slice(body);
        Ok(start..self.data.len())
    }

    pub fn payload_mut(&mut self, range: Range<usize>) -> &mut [u8] {
        &mut self.data[range]
    }

    /// All bytes from `offset` until the current end of the message.
    pub fn data_from(&self, offset: usize) -> &[u8] {
        &self.data[offset..]
    }

    pub fn into_bytes(mut self) -> Vec<u8> {
        let length = (self.data.len() as u32).to_be_bytes();
        self.data[24..28].copy_from_slice(&length);
        self.data
    }
}

/// Encodes transform attributes (RFC 2408, Section 3.3).
#[derive(Default)]
pub struct AttributeWriter {
    data: Vec<u8>,
}

impl AttributeWriter {
    pub fn new() -> AttributeWriter {
        AttributeWriter { data: vec![] }
    }

    pub fn add_basic(&mut self, attribute_type: u16, value: u16) -> &mut AttributeWriter {
        self.data
            .extend_from_slice(&(attribute_type | 0x8000).to_be_bytes());
        self.data.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn add_variable(&mut self, attribute_type: u16, value: &[u8]) -> &mut AttributeWriter {
        self.data
            .extend_from_slice(&(attribute_type & 0x7fff).to_be_bytes());
        self.data
            .extend_from_slice(&(value.len() as u16).to_be_bytes());
        self.data.extend_from_slice(value);
        self
    }

    pub fn add_u32(&mut self, attribute_type: u16, value: u32) -> &mut AttributeWriter {
        if let Ok(value) = u16::try_from(value) {
            self.add_basic(attribute_type, value)
        } else {
            self.add_variable(attribute_type, &value.to_be_bytes())
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

pub struct TransformData<'a> {
    pub transform_num: u8,
    pub transform_id: u8,
    pub attributes: &'a [u8],
}

/// Encodes a Security Association payload body with its proposals and transforms.
pub struct SecurityAssociationWriter {
    data: Vec<u8>,
    last_proposal: Option<usize>,
}

impl SecurityAssociationWriter {
    pub fn new(doi: u32, situation: u32) -> SecurityAssociationWriter {
        let mut data = Vec::with_capacity(128);
        data.extend_from_slice(&doi.to_be_bytes());
        data.extend_from_slice(&situation.to_be_bytes());
        SecurityAssociationWriter {
            data,
            last_proposal: None,
        }
    }

    pub fn add_proposal(
        &mut self,
        proposal_num: u8,
        protocol_id: ProtocolId,
        spi: &[u8],
        transforms: &[TransformData],
    ) {
        if let Some(last_proposal) = self.last_proposal {
            self.data[last_proposal] = PayloadType::PROPOSAL.0;
        }
        let start = self.data.len();
        self.last_proposal = Some(start);
        self.data.extend_from_slice(&[0, 0, 0, 0]);
        self.data.push(proposal_num);
        self.data.push(protocol_id.0);
        self.data.push(spi.len() as u8);
        self.data.push(transforms.len() as u8);
        self.data.extend_from_slice(spi);
        for (i, transform) in transforms.iter().enumerate() {
            let next = if i + 1 < transforms.len() {
                PayloadType::TRANSFORM.0
            } else {
                PayloadType::NONE.0
            };
            let transform_length = (8 + transform.attributes.len()) as u16;
            self.data.push(next);
            self.data.push(0);
            self.data
                .extend_from_slice(&transform_length.to_be_bytes());
            self.data.push(transform.transform_num);
            self.data.push(transform.transform_id);
            self.data.extend_from_slice(&[0, 0]);
            self.data.extend_from_slice(transform.attributes);
        }
        let proposal_length = ((self.data.len() - start) as u16).to_be_bytes();
        self.data[start + 2..start + 4].copy_from_slice(&proposal_length);
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

pub fn write_notify(protocol_id: ProtocolId, spi: &[u8], notify_type: NotifyType, data: &[u8]) -> Vec<u8> {
    let mut result = Vec::with_capacity(8 + spi.len() + data.len());
    result.extend_from_slice(&IPSEC_DOI.to_be_bytes());
    result.push(protocol_id.0);
    result.push(spi.len() as u8);
    result.extend_from_slice(&notify_type.0.to_be_bytes());
    result.extend_from_slice(spi);
    result.extend_from_slice(data);
    result
}

pub fn write_delete(protocol_id: ProtocolId, spi_size: usize, spis: &[&[u8]]) -> Vec<u8> {
    let mut result = Vec::with_capacity(8 + spi_size * spis.len());
    result.extend_from_slice(&IPSEC_DOI.to_be_bytes());
    result.push(protocol_id.0);
    result.push(spi_size as u8);
    result.extend_from_slice(&(spis.len() as u16).to_be_bytes());
    for spi in spis {
        result.extend_from_slice(spi);
    }
    result
}

pub fn write_certificate(encoding: CertificateEncoding, data: &[u8]) -> Vec<u8> {
    let mut result = Vec::with_capacity(1 + data.len());
    result.push(encoding.0);
    result.extend_from_slice(data);
    result
}

/// Rewrites the length field of a serialized message.
pub fn set_message_length(message: &mut [u8]) {
    if message.len() >= HEADER_LENGTH {
        let length = (message.len() as u32).to_be_bytes();
        message[24..28].copy_from_slice(&length);
    }
}

pub struct FormatError {
    msg: &'static str,
}

impl fmt::Display for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl fmt::Debug for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl error::Error for FormatError {}

impl From<&'static str> for FormatError {
    fn from(msg: &'static str) -> FormatError {
        FormatError { msg }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_message(payloads: &[(PayloadType, &[u8])]) -> Vec<u8> {
        let mut writer = MessageWriter::new(
            0x0102030405060708,
            0,
            ExchangeType::IDENTITY_PROTECTION,
            Flags::NONE,
            0,
        );
        for (payload_type, body) in payloads {
            writer.add_payload(*payload_type, body).unwrap();
        }
        writer.into_bytes()
    }

    #[test]
    fn oversized_payload() {
        let mut writer = MessageWriter::new(1, 0, ExchangeType::INFORMATIONAL, Flags::NONE, 0);
        assert!(writer
            .add_payload(PayloadType::VENDOR_ID, &vec![0u8; 65532])
            .is_err());
        let data = writer.into_bytes();
        assert_eq!(data.len(), 28);
        assert_eq!(data[16], 0);

        let mut writer = MessageWriter::new(1, 0, ExchangeType::INFORMATIONAL, Flags::NONE, 0);
        let range = writer
            .add_payload(PayloadType::VENDOR_ID, &vec![0u8; 65531])
            .unwrap();
        assert_eq!(range, 32..65563);
    }

    #[test]
    fn header_fields() {
        let message = build_message(&[(PayloadType::NONCE, &[0xaa; 16])]);
        let message = InputMessage::from_datagram(&message).unwrap();
        assert_eq!(message.read_initiator_cookie(), 0x0102030405060708);
        assert_eq!(message.read_responder_cookie(), 0);
        assert_eq!(message.read_version(), (1, 0));
        assert_eq!(
            message.read_exchange_type(),
            ExchangeType::IDENTITY_PROTECTION
        );
        assert_eq!(message.read_length(), 28 + 4 + 16);
        let payloads = message.payloads().unwrap();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0].to_nonce().unwrap(), &[0xaa; 16]);
    }

    #[test]
    fn payload_chain_order() {
        let message = build_message(&[
            (PayloadType::HASH, &[1, 2, 3]),
            (PayloadType::NONCE, &[4; 8]),
            (PayloadType::VENDOR_ID, &[5, 6]),
        ]);
        let message = InputMessage::from_datagram(&message).unwrap();
        assert_eq!(message.read_next_payload(), PayloadType::HASH);
        let payloads = message.payloads().unwrap();
        let types = payloads
            .iter()
            .map(|pl| pl.payload_type())
            .collect::<Vec<_>>();
        assert_eq!(
            types,
            vec![PayloadType::HASH, PayloadType::NONCE, PayloadType::VENDOR_ID]
        );
        let after_hash = message.payloads_after(&payloads[0], &payloads);
        assert_eq!(after_hash.len(), 4 + 8 + 4 + 2);
        assert_eq!(after_hash[0], PayloadType::VENDOR_ID.0);
    }

    #[test]
    fn overflowing_payload_aborts_message() {
        let mut message = build_message(&[
            (PayloadType::NONCE, &[4; 8]),
            (PayloadType::VENDOR_ID, &[5, 6]),
        ]);
        // Second payload claims to be longer than the message.
        let second = 28 + 4 + 8;
        message[second + 2..second + 4].copy_from_slice(&100u16.to_be_bytes());
        let message = InputMessage::from_datagram(&message).unwrap();
        assert!(message.payloads().is_err());
    }

    #[test]
    fn short_payload_length_rejected() {
        let mut message = build_message(&[(PayloadType::NONCE, &[4; 8])]);
        message[28 + 2..28 + 4].copy_from_slice(&2u16.to_be_bytes());
        let message = InputMessage::from_datagram(&message).unwrap();
        assert!(message.payloads().is_err());
    }

    #[test]
    fn truncated_datagram_rejected() {
        let message = build_message(&[(PayloadType::NONCE, &[4; 8])]);
        assert!(InputMessage::from_datagram(&message[..message.len() - 1]).is_err());
        assert!(InputMessage::from_datagram(&message[..20]).is_err());
    }

    #[test]
    fn trailing_padding_ignored() {
        let mut message = build_message(&[(PayloadType::NONCE, &[4; 8])]);
        message.extend_from_slice(&[0u8; 7]);
        set_message_length(&mut message);
        let message = InputMessage::from_datagram(&message).unwrap();
        let payloads = message.payloads().unwrap();
        assert_eq!(payloads.len(), 1);
    }

    #[test]
    fn reserved_flags_rejected() {
        assert!(Flags::from_u8(0x08).is_err());
        let flags = Flags::from_u8(0x03).unwrap();
        assert!(flags.has(Flags::ENCRYPTION));
        assert!(flags.has(Flags::COMMIT));
        assert!(!flags.has(Flags::AUTHENTICATION_ONLY));
    }

    #[test]
    fn security_association_structure() {
        let mut attributes = AttributeWriter::new();
        attributes.add_basic(1, 7).add_basic(14, 128).add_u32(12, 86400);
        let mut sa = SecurityAssociationWriter::new(IPSEC_DOI, SITUATION_IDENTITY_ONLY);
        sa.add_proposal(
            1,
            ProtocolId::ISAKMP,
            &[],
            &[
                TransformData {
                    transform_num: 1,
                    transform_id: 1,
                    attributes: attributes.as_bytes(),
                },
                TransformData {
                    transform_num: 2,
                    transform_id: 1,
                    attributes: attributes.as_bytes(),
                },
            ],
        );
        let message = build_message(&[(PayloadType::SECURITY_ASSOCIATION, &sa.into_bytes())]);
        let message = InputMessage::from_datagram(&message).unwrap();
        let payloads = message.payloads().unwrap();
        let sa = payloads[0].to_security_association().unwrap();
        assert_eq!(sa.doi(), IPSEC_DOI);
        let proposals = sa.iter_proposals().collect::<Result<Vec<_>, _>>().unwrap();
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].protocol_id(), ProtocolId::ISAKMP);
        let transforms = proposals[0]
            .iter_transforms()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(transforms.len(), 2);
        assert_eq!(transforms[1].transform_num(), 2);
        let attributes = transforms[0]
            .iter_attributes()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(attributes.len(), 3);
        assert_eq!(attributes[0].value(), AttributeValue::Basic(7));
        assert_eq!(attributes[2].attribute_type(), 12);
        assert_eq!(attributes[2].value_u32(), Some(86400));
    }

    #[test]
    fn transform_count_mismatch_rejected() {
        let mut sa = SecurityAssociationWriter::new(IPSEC_DOI, SITUATION_IDENTITY_ONLY);
        sa.add_proposal(
            1,
            ProtocolId::IPSEC_ESP,
            &[1, 2, 3, 4],
            &[TransformData {
                transform_num: 1,
                transform_id: 12,
                attributes: &[],
            }],
        );
        let mut sa = sa.into_bytes();
        // Claim two transforms in the proposal.
        sa[8 + 7] = 2;
        let sa = PayloadSecurityAssociation::from_payload(&sa).unwrap();
        let proposal = sa.iter_proposals().next().unwrap().unwrap();
        assert_eq!(proposal.spi(), &[1, 2, 3, 4]);
        assert!(proposal
            .iter_transforms()
            .collect::<Result<Vec<_>, _>>()
            .is_err());
    }

    #[test]
    fn notify_and_delete_bodies() {
        let notify = write_notify(
            ProtocolId::ISAKMP,
            &[0xab; 16],
            NotifyType::INITIAL_CONTACT,
            &[],
        );
        let delete = write_delete(ProtocolId::IPSEC_ESP, 4, &[&[0, 0, 1, 0], &[0, 0, 2, 0]]);
        let message = build_message(&[
            (PayloadType::NOTIFICATION, &notify),
            (PayloadType::DELETE, &delete),
        ]);
        let message = InputMessage::from_datagram(&message).unwrap();
        let payloads = message.payloads().unwrap();
        let notify = payloads[0].to_notify().unwrap();
        assert_eq!(notify.notify_type(), NotifyType::INITIAL_CONTACT);
        assert_eq!(notify.spi(), &[0xab; 16]);
        assert!(!notify.notify_type().is_error());
        let delete = payloads[1].to_delete().unwrap();
        assert_eq!(delete.protocol_id(), ProtocolId::IPSEC_ESP.protocol_id());
        let spis = delete.iter_spi().collect::<Vec<_>>();
        assert_eq!(spis, vec![&[0, 0, 1, 0][..], &[0, 0, 2, 0][..]]);
    }

    #[test]
    fn identification_body() {
        let id = Identification::new(IdentificationType::FQDN, b"vpn.example.com".to_vec())
            .with_protocol(17, 500);
        let body = id.to_bytes();
        assert_eq!(&body[..4], &[2, 17, 0x01, 0xf4]);
        let parsed = PayloadIdentification::from_payload(&body).unwrap();
        assert_eq!(Identification::from_payload(&parsed), id);
        assert_eq!(parsed.identification_data(), b"vpn.example.com");
    }
}
