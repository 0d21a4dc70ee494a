use std::{error, fmt};

use log::{debug, warn};
use openssl::{asn1, pkey, rsa, x509};

use super::message::{self, IdentificationType};

/// Certificates and keys for RSA signature authentication.
pub struct PkiProcessing {
    root_ca: Option<RootCa>,
    local_identity: Option<LocalIdentity>,
    peer_cert: Option<x509::X509>,
    verify_cert: bool,
}

impl PkiProcessing {
    pub fn new(
        root_ca: Option<&str>,
        local_cert: Option<(&str, &str)>,
        peer_cert: Option<&str>,
        verify_cert: bool,
    ) -> Result<PkiProcessing, CertError> {
        let root_ca = if let Some(root_ca) = root_ca {
            Some(RootCa::new(root_ca)?)
        } else {
            None
        };
        let local_identity = if let Some((public_cert, private_key)) = local_cert {
            Some(LocalIdentity::new(public_cert, private_key)?)
        } else {
            None
        };
        let peer_cert = if let Some(peer_cert) = peer_cert {
            Some(x509::X509::from_pem(peer_cert.as_bytes())?)
        } else {
            None
        };
        if verify_cert && root_ca.is_none() {
            warn!("Certificate verification is enabled, but no root CA is configured");
        }
        Ok(PkiProcessing {
            root_ca,
            local_identity,
            peer_cert,
            verify_cert,
        })
    }

    /// Body of a CERT payload with the local certificate.
    pub fn local_cert_der(&self) -> Option<&[u8]> {
        self.local_identity
            .as_ref()
            .map(|identity| identity.public_cert_der.as_slice())
    }

    /// Local identity derived from the certificate subject.
    pub fn local_identification(&self) -> Option<message::Identification> {
        self.local_identity.as_ref().map(|identity| {
            message::Identification::new(
                IdentificationType::DER_ASN1_DN,
                identity.subject_der.clone(),
            )
        })
    }

    /// Certificate authority name, as sent in a CR payload.
    pub fn certificate_request(&self) -> Option<&[u8]> {
        self.root_ca.as_ref().map(|root_ca| root_ca.subject_der.as_slice())
    }

    /// Signs a hash with PKCS#1 v1.5 padding, without a DigestInfo wrapper.
    pub fn sign(&self, hash: &[u8]) -> Result<Vec<u8>, CertError> {
        if let Some(local_identity) = &self.local_identity {
            local_identity.sign_hash(hash)
        } else {
            Err("No local certificate is configured".into())
        }
    }

    /// Picks the peer certificate: the one received in a CERT payload,
    /// or the one configured locally.
    pub fn peer_certificate(&self, received: Option<&[u8]>) -> Result<PeerCertificate, CertError> {
        let cert = match (received, &self.peer_cert) {
            (Some(der), _) => x509::X509::from_der(der).map_err(|err| {
                debug!("Failed to parse peer certificate: {}", err);
                CertError::Invalid("Failed to parse peer certificate")
            })?,
            (None, Some(cert)) => cert.clone(),
            (None, None) => return Err(CertError::Invalid("No peer certificate is available")),
        };
        if self.verify_cert {
            if !certificate_date_valid(&cert) {
                return Err(CertError::Invalid("Peer certificate has invalid date"));
            }
            if let Some(root_ca) = &self.root_ca {
                root_ca.verify_cert(&cert)?;
            }
        }
        let public_key = cert.public_key()?;
        if public_key.id() != pkey::Id::RSA {
            debug!(
                "Certificate public key algorithm {} is not supported",
                public_key.id().as_raw()
            );
            return Err(CertError::Invalid(
                "Certificate public key algorithm is not supported",
            ));
        }
        Ok(PeerCertificate {
            cert,
            public_key: public_key.rsa()?,
            verify_identity: self.verify_cert,
        })
    }
}

pub struct PeerCertificate {
    cert: x509::X509,
    public_key: rsa::Rsa<pkey::Public>,
    verify_identity: bool,
}

impl PeerCertificate {
    pub fn verify_signature(&self, hash: &[u8], signature: &[u8]) -> Result<(), CertError> {
        let mut decrypted = vec![0u8; self.public_key.size() as usize];
        let len = self
            .public_key
            .public_decrypt(signature, &mut decrypted, rsa::Padding::PKCS1)
            .map_err(|err| {
                debug!("Failed to decrypt signature: {}", err);
                CertError::Invalid("Failed to decrypt signature")
            })?;
        if &decrypted[..len] != hash {
            return Err(CertError::Invalid("Signature doesn't match hash"));
        }
        Ok(())
    }

    /// Checks that the certificate is bound to the identity claimed by the peer.
    pub fn matches_identity(&self, id: &message::Identification) -> Result<bool, CertError> {
        if !self.verify_identity {
            return Ok(true);
        }
        let data = id.data();
        let sans = self.cert.subject_alt_names();
        let result = match id.id_type() {
            IdentificationType::DER_ASN1_DN => self.cert.subject_name().to_der()? == data,
            IdentificationType::IPV4_ADDR | IdentificationType::IPV6_ADDR => sans
                .map(|sans| sans.iter().any(|san| san.ipaddress() == Some(data)))
                .unwrap_or(false),
            IdentificationType::FQDN => sans
                .map(|sans| {
                    sans.iter().any(|san| {
                        san.dnsname()
                            .map(|name| name.as_bytes().eq_ignore_ascii_case(data))
                            .unwrap_or(false)
                    })
                })
                .unwrap_or(false),
            IdentificationType::USER_FQDN => sans
                .map(|sans| {
                    sans.iter().any(|san| {
                        san.email()
                            .map(|email| email.as_bytes().eq_ignore_ascii_case(data))
                            .unwrap_or(false)
                    })
                })
                .unwrap_or(false),
            _ => {
                debug!("Identity type {} can't be bound to a certificate", id.id_type());
                false
            }
        };
        Ok(result)
    }
}

struct RootCa {
    root_ca: x509::X509,
    subject_der: Vec<u8>,
    public_key: pkey::PKey<pkey::Public>,
}

impl RootCa {
    fn new(root_ca_pem: &str) -> Result<RootCa, CertError> {
        let root_ca = x509::X509::from_pem(root_ca_pem.as_bytes())?;
        let public_key = root_ca.public_key()?;
        let subject_der = root_ca.subject_name().to_der()?;
        Ok(RootCa {
            root_ca,
            subject_der,
            public_key,
        })
    }

    fn verify_cert(&self, cert: &x509::X509) -> Result<(), CertError> {
        if !certificate_date_valid(&self.root_ca) {
            return Err(CertError::Invalid("Root CA certificate has invalid date"));
        }
        if self.root_ca.issued(cert) != x509::X509VerifyResult::OK {
            return Err(CertError::Authority("Certificate was not issued by the root CA"));
        }
        if !cert.verify(&self.public_key)? {
            return Err(CertError::Authority("Certificate verification failed"));
        }
        Ok(())
    }
}

struct LocalIdentity {
    public_cert_der: Vec<u8>,
    subject_der: Vec<u8>,
    private_key: rsa::Rsa<pkey::Private>,
}

impl LocalIdentity {
    fn new(public_cert_pem: &str, private_key_pem: &str) -> Result<LocalIdentity, CertError> {
        let public_cert = x509::X509::from_pem(public_cert_pem.as_bytes())?;
        let subject_der = public_cert.subject_name().to_der()?;
        let public_cert_der = public_cert.to_der()?;
        let private_key = pkey::PKey::private_key_from_pem(private_key_pem.as_bytes())?;
        let private_key = private_key.rsa()?;
        Ok(LocalIdentity {
            public_cert_der,
            subject_der,
            private_key,
        })
    }

    fn sign_hash(&self, hash: &[u8]) -> Result<Vec<u8>, CertError> {
        let mut signature = vec![0u8; self.private_key.size() as usize];
        let len = self
            .private_key
            .private_encrypt(hash, &mut signature, rsa::Padding::PKCS1)?;
        signature.truncate(len);
        Ok(signature)
    }
}

fn certificate_date_valid(cert: &x509::X509) -> bool {
    let time_now = match asn1::Asn1Time::days_from_now(0) {
        Ok(time) => time,
        Err(err) => {
            debug!("Failed to get current time in ASN format: {}", err);
            return false;
        }
    };
    cert.not_before() < time_now && cert.not_after() > time_now
}

#[derive(Debug)]
pub enum CertError {
    Internal(&'static str),
    Invalid(&'static str),
    Authority(&'static str),
    OpenSSL(openssl::error::ErrorStack),
}

impl fmt::Display for CertError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::Internal(msg) => f.write_str(msg),
            Self::Invalid(msg) => write!(f, "Invalid certificate: {}", msg),
            Self::Authority(msg) => write!(f, "Invalid certificate authority: {}", msg),
            Self::OpenSSL(ref e) => write!(f, "OpenSSL error: {}", e),
        }
    }
}

impl error::Error for CertError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            Self::Internal(_) | Self::Invalid(_) | Self::Authority(_) => None,
            Self::OpenSSL(ref err) => Some(err),
        }
    }
}

impl From<&'static str> for CertError {
    fn from(msg: &'static str) -> CertError {
        Self::Internal(msg)
    }
}

impl From<openssl::error::ErrorStack> for CertError {
    fn from(err: openssl::error::ErrorStack) -> CertError {
        Self::OpenSSL(err)
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    pub const CA_PEM: &str = include_str!("testdata/ca.pem");
    pub const PEER_A_PEM: &str = include_str!("testdata/peer-a.pem");
    pub const PEER_A_KEY: &str = include_str!("testdata/peer-a.key");
    pub const PEER_B_PEM: &str = include_str!("testdata/peer-b.pem");
    pub const PEER_B_KEY: &str = include_str!("testdata/peer-b.key");

    #[test]
    fn sign_and_verify() {
        let local = PkiProcessing::new(Some(CA_PEM), Some((PEER_A_PEM, PEER_A_KEY)), None, true)
            .unwrap();
        let remote = PkiProcessing::new(Some(CA_PEM), Some((PEER_B_PEM, PEER_B_KEY)), None, true)
            .unwrap();
        let hash = [0x5au8; 20];
        let signature = local.sign(&hash).unwrap();
        assert_eq!(signature.len(), 256);
        let peer = remote.peer_certificate(local.local_cert_der()).unwrap();
        assert!(peer.verify_signature(&hash, &signature).is_ok());
        assert!(peer.verify_signature(&[0x5bu8; 20], &signature).is_err());
    }

    #[test]
    fn identity_binding() {
        let local = PkiProcessing::new(Some(CA_PEM), Some((PEER_A_PEM, PEER_A_KEY)), None, true)
            .unwrap();
        let peer = local.peer_certificate(local.local_cert_der()).unwrap();
        let dn = local.local_identification().unwrap();
        assert_eq!(dn.id_type(), IdentificationType::DER_ASN1_DN);
        assert!(peer.matches_identity(&dn).unwrap());
        let fqdn = message::Identification::new(
            IdentificationType::FQDN,
            b"VPN-A.example.com".to_vec(),
        );
        assert!(peer.matches_identity(&fqdn).unwrap());
        let other = message::Identification::new(
            IdentificationType::FQDN,
            b"vpn-b.example.com".to_vec(),
        );
        assert!(!peer.matches_identity(&other).unwrap());
        let addr = message::Identification::new(IdentificationType::IPV4_ADDR, vec![192, 0, 2, 1]);
        assert!(peer.matches_identity(&addr).unwrap());
        let email = message::Identification::new(
            IdentificationType::USER_FQDN,
            b"admin@vpn-a.example.com".to_vec(),
        );
        assert!(peer.matches_identity(&email).unwrap());
        let key_id = message::Identification::new(IdentificationType::KEY_ID, b"key".to_vec());
        assert!(!peer.matches_identity(&key_id).unwrap());
        let other_addr =
            message::Identification::new(IdentificationType::IPV4_ADDR, vec![192, 0, 2, 9]);
        assert!(!peer.matches_identity(&other_addr).unwrap());
    }

    #[test]
    fn certificate_sources() {
        let without_ca = PkiProcessing::new(None, None, Some(PEER_B_PEM), true).unwrap();
        assert!(without_ca.peer_certificate(None).is_ok());
        assert!(without_ca.certificate_request().is_none());
        let nothing = PkiProcessing::new(Some(CA_PEM), None, None, true).unwrap();
        assert!(nothing.peer_certificate(None).is_err());
        assert!(nothing.sign(&[0u8; 20]).is_err());
        assert!(nothing.certificate_request().is_some());
        let ca_der = x509::X509::from_pem(CA_PEM.as_bytes()).unwrap().to_der().unwrap();
        assert!(nothing.peer_certificate(Some(&ca_der)).is_ok());
        assert!(nothing.peer_certificate(Some(&[1, 2, 3])).is_err());
    }
}
