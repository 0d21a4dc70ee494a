use std::{error, fmt};

use log::{debug, trace};

use super::crypto::{self, CryptoError, InitError};
use super::message::{CertificateEncoding, FormatError, NotifyType, Payload, PayloadType};
use super::pki::CertError;
use super::schedule::EventId;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Role {
    Initiator,
    Responder,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initiator => write!(f, "initiator"),
            Self::Responder => write!(f, "responder"),
        }
    }
}

/// Last message sent by an exchange, and its pending resend.
#[derive(Default)]
pub struct Retransmission {
    pub event: Option<EventId>,
    pub retries_left: usize,
    pub message: Vec<u8>,
}

pub fn generate_nonce(size: usize) -> Result<Vec<u8>, ExchangeError> {
    Ok(crypto::random_bytes(size)?)
}

/// Payloads of one received message, sorted by type.
#[derive(Default)]
pub struct ReceivedPayloads<'a> {
    pub hash: Option<Payload<'a>>,
    pub security_association: Option<Payload<'a>>,
    pub key_exchange: Option<&'a [u8]>,
    pub nonce: Option<&'a [u8]>,
    pub identification: Vec<Payload<'a>>,
    pub certificate: Option<&'a [u8]>,
    pub certificate_request: bool,
    pub signature: Option<&'a [u8]>,
    pub notify: Vec<Payload<'a>>,
    pub delete: Vec<Payload<'a>>,
}

impl<'a> ReceivedPayloads<'a> {
    pub fn collect(payloads: &[Payload<'a>]) -> Result<ReceivedPayloads<'a>, ExchangeError> {
        let mut result = ReceivedPayloads::default();
        for payload in payloads {
            match payload.payload_type() {
                PayloadType::HASH => {
                    let _ = payload.to_hash()?;
                    set_once(&mut result.hash, *payload)?
                }
                PayloadType::SECURITY_ASSOCIATION => {
                    let _ = payload.to_security_association()?;
                    set_once(&mut result.security_association, *payload)?
                }
                PayloadType::KEY_EXCHANGE => {
                    set_once(&mut result.key_exchange, payload.to_key_exchange()?)?
                }
                PayloadType::NONCE => set_once(&mut result.nonce, payload.to_nonce()?)?,
                PayloadType::IDENTIFICATION => {
                    let _ = payload.to_identification()?;
                    result.identification.push(*payload);
                }
                PayloadType::CERTIFICATE => {
                    let cert = payload.to_certificate()?;
                    if cert.encoding() != CertificateEncoding::X509_SIGNATURE {
                        debug!("Ignoring certificate with encoding {}", cert.encoding());
                    } else if result.certificate.is_none() {
                        result.certificate = Some(cert.read_value());
                    }
                }
                PayloadType::CERTIFICATE_REQUEST => {
                    let _ = payload.to_certificate()?;
                    result.certificate_request = true;
                }
                PayloadType::SIGNATURE => {
                    set_once(&mut result.signature, payload.to_signature()?)?
                }
                PayloadType::NOTIFICATION => {
                    let _ = payload.to_notify()?;
                    result.notify.push(*payload);
                }
                PayloadType::DELETE => {
                    let _ = payload.to_delete()?;
                    result.delete.push(*payload);
                }
                PayloadType::VENDOR_ID => {
                    trace!("Ignoring Vendor ID {:?}", payload.data());
                }
                _ => {
                    debug!("Unexpected payload type {}", payload.payload_type());
                    return Err("Unexpected payload type".into());
                }
            }
        }
        Ok(result)
    }

    pub fn require_security_association(&self) -> Result<Payload<'a>, ExchangeError> {
        self.security_association
            .ok_or_else(|| "Missing Security Association payload".into())
    }

    pub fn require_key_exchange(&self) -> Result<&'a [u8], ExchangeError> {
        self.key_exchange
            .ok_or_else(|| "Missing Key Exchange payload".into())
    }

    pub fn require_nonce(&self) -> Result<&'a [u8], ExchangeError> {
        self.nonce.ok_or_else(|| "Missing Nonce payload".into())
    }

    pub fn require_identification(&self) -> Result<Payload<'a>, ExchangeError> {
        match self.identification.as_slice() {
            [id] => Ok(*id),
            [] => Err("Missing Identification payload".into()),
            _ => Err("Unexpected number of Identification payloads".into()),
        }
    }

    pub fn require_hash(&self) -> Result<&'a [u8], ExchangeError> {
        match self.hash {
            Some(hash) => Ok(hash.data()),
            None => Err("Missing Hash payload".into()),
        }
    }

    pub fn require_signature(&self) -> Result<&'a [u8], ExchangeError> {
        self.signature.ok_or_else(|| "Missing Signature payload".into())
    }
}

fn set_once<T>(slot: &mut Option<T>, value: T) -> Result<(), ExchangeError> {
    if slot.is_some() {
        return Err("Duplicate payload".into());
    }
    *slot = Some(value);
    Ok(())
}

/// Compares authentication values in constant time.
pub fn hash_equals(expected: &[u8], received: &[u8]) -> bool {
    if expected.len() != received.len() {
        return false;
    }
    expected
        .iter()
        .zip(received)
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// Outcome of a failed exchange step.
/// `Format` means the message is dropped and nothing changes;
/// `Notify` means the negotiation is rejected with a notification to the peer.
#[derive(Debug)]
pub enum ExchangeError {
    Internal(&'static str),
    Format(FormatError),
    Notify(NotifyType),
    Crypto(CryptoError),
    CryptoInit(InitError),
    CertError(CertError),
}

impl ExchangeError {
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Format(_))
    }

    pub fn notify_type(&self) -> Option<NotifyType> {
        match self {
            Self::Notify(notify_type) => Some(*notify_type),
            _ => None,
        }
    }
}

impl fmt::Display for ExchangeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Internal(msg) => f.write_str(msg),
            Self::Format(e) => write!(f, "Format error: {e}"),
            Self::Notify(notify_type) => write!(f, "Rejected with {notify_type}"),
            Self::Crypto(e) => write!(f, "Crypto error: {e}"),
            Self::CryptoInit(e) => write!(f, "Crypto init error: {e}"),
            Self::CertError(e) => write!(f, "PKI cert error: {e}"),
        }
    }
}

impl error::Error for ExchangeError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Internal(_msg) => None,
            Self::Format(err) => Some(err),
            Self::Notify(_) => None,
            Self::Crypto(err) => Some(err),
            Self::CryptoInit(err) => Some(err),
            Self::CertError(err) => Some(err),
        }
    }
}

impl From<&'static str> for ExchangeError {
    fn from(msg: &'static str) -> ExchangeError {
        Self::Format(msg.into())
    }
}

impl From<FormatError> for ExchangeError {
    fn from(err: FormatError) -> ExchangeError {
        Self::Format(err)
    }
}

impl From<NotifyType> for ExchangeError {
    fn from(notify_type: NotifyType) -> ExchangeError {
        Self::Notify(notify_type)
    }
}

impl From<CryptoError> for ExchangeError {
    fn from(err: CryptoError) -> ExchangeError {
        Self::Crypto(err)
    }
}

impl From<InitError> for ExchangeError {
    fn from(err: InitError) -> ExchangeError {
        Self::CryptoInit(err)
    }
}

impl From<CertError> for ExchangeError {
    fn from(err: CertError) -> ExchangeError {
        match err {
            CertError::Invalid(msg) => {
                debug!("Certificate rejected: {}", msg);
                Self::Notify(NotifyType::INVALID_CERTIFICATE)
            }
            CertError::Authority(msg) => {
                debug!("Certificate authority rejected: {}", msg);
                Self::Notify(NotifyType::INVALID_CERT_AUTHORITY)
            }
            err => Self::CertError(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::message::{InputMessage, MessageWriter, ExchangeType, Flags};
    use super::*;

    #[test]
    fn collects_payloads_by_type() {
        let mut writer =
            MessageWriter::new(1, 2, ExchangeType::IDENTITY_PROTECTION, Flags::NONE, 0);
        writer.add_payload(PayloadType::KEY_EXCHANGE, &[1u8; 128]).unwrap();
        writer.add_payload(PayloadType::NONCE, &[2u8; 16]).unwrap();
        writer.add_payload(PayloadType::VENDOR_ID, b"vendor").unwrap();
        writer.add_payload(PayloadType::CERTIFICATE_REQUEST, &[4]).unwrap();
        let data = writer.into_bytes();
        let message = InputMessage::from_datagram(&data).unwrap();
        let payloads = message.payloads().unwrap();
        let received = ReceivedPayloads::collect(&payloads).unwrap();
        assert_eq!(received.require_key_exchange().unwrap(), &[1u8; 128]);
        assert_eq!(received.require_nonce().unwrap(), &[2u8; 16]);
        assert!(received.certificate_request);
        assert!(received.require_security_association().is_err());
        assert!(received.require_identification().is_err());
    }

    #[test]
    fn duplicate_payloads_are_malformed() {
        let mut writer =
            MessageWriter::new(1, 2, ExchangeType::IDENTITY_PROTECTION, Flags::NONE, 0);
        writer.add_payload(PayloadType::NONCE, &[2u8; 16]).unwrap();
        writer.add_payload(PayloadType::NONCE, &[3u8; 16]).unwrap();
        let data = writer.into_bytes();
        let message = InputMessage::from_datagram(&data).unwrap();
        let payloads = message.payloads().unwrap();
        let err = ReceivedPayloads::collect(&payloads).err().unwrap();
        assert!(err.is_malformed());
    }

    #[test]
    fn unexpected_payload_type() {
        let mut writer =
            MessageWriter::new(1, 2, ExchangeType::IDENTITY_PROTECTION, Flags::NONE, 0);
        writer.add_payload(PayloadType::TRANSFORM, &[0u8; 8]).unwrap();
        let data = writer.into_bytes();
        let message = InputMessage::from_datagram(&data).unwrap();
        let payloads = message.payloads().unwrap();
        assert!(ReceivedPayloads::collect(&payloads).is_err());
    }

    #[test]
    fn certificate_errors_map_to_notifications() {
        let err: ExchangeError = CertError::Authority("untrusted").into();
        assert_eq!(err.notify_type(), Some(NotifyType::INVALID_CERT_AUTHORITY));
        let err: ExchangeError = CertError::Invalid("expired").into();
        assert_eq!(err.notify_type(), Some(NotifyType::INVALID_CERTIFICATE));
        let err: ExchangeError = CertError::Internal("no key").into();
        assert_eq!(err.notify_type(), None);
        assert!(!err.is_malformed());
    }

    #[test]
    fn hash_comparison() {
        assert!(hash_equals(&[1, 2, 3], &[1, 2, 3]));
        assert!(!hash_equals(&[1, 2, 3], &[1, 2, 4]));
        assert!(!hash_equals(&[1, 2, 3], &[1, 2]));
    }
}
