use std::{
    collections::HashSet,
    error, fmt,
    net::IpAddr,
    time::Duration,
};

use log::{info, trace, warn};
use rand::Rng;

use super::crypto::SecretBytes;
use super::policy::{Encapsulation, IpsecProtocol, IpsecTransform, TrafficSelectors};

/// One direction of a negotiated IPsec SA.
#[derive(Clone)]
pub struct SaDirection {
    pub spi: u32,
    pub src: IpAddr,
    pub dst: IpAddr,
    pub encryption_key: SecretBytes,
    pub integrity_key: SecretBytes,
}

/// A finished phase 2 negotiation, ready to be installed into the SA database.
#[derive(Clone)]
pub struct NegotiatedSa {
    pub protocol: IpsecProtocol,
    pub transform: IpsecTransform,
    pub encapsulation: Encapsulation,
    pub selectors: TrafficSelectors,
    pub lifetime: Duration,
    pub inbound: SaDirection,
    pub outbound: SaDirection,
}

impl fmt::Display for NegotiatedSa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} in {:08x} ({} -> {}) out {:08x} ({} -> {}) ({})",
            self.transform,
            self.encapsulation,
            self.inbound.spi,
            self.inbound.src,
            self.inbound.dst,
            self.outbound.spi,
            self.outbound.src,
            self.outbound.dst,
            self.selectors
        )
    }
}

/// Platform SA database, where negotiated keys end up.
pub trait SaInstaller {
    /// Reserves an inbound SPI for an SA from `src` to `dst`.
    fn get_spi(
        &mut self,
        protocol: IpsecProtocol,
        src: IpAddr,
        dst: IpAddr,
    ) -> Result<u32, InstallerError>;

    fn add_sa(&mut self, sa: &NegotiatedSa) -> Result<(), InstallerError>;

    fn delete_sa(
        &mut self,
        protocol: IpsecProtocol,
        spi: u32,
        src: IpAddr,
        dst: IpAddr,
    ) -> Result<(), InstallerError>;

    /// Reports that a requested negotiation couldn't be started.
    fn acquire_failed(&mut self, selectors: &TrafficSelectors);
}

/// Keeps installed SAs in memory and logs every change.
#[derive(Default)]
pub struct LoggingInstaller {
    reserved: HashSet<(IpsecProtocol, u32)>,
    installed: Vec<NegotiatedSa>,
    failed_acquires: Vec<TrafficSelectors>,
}

impl LoggingInstaller {
    pub fn new() -> LoggingInstaller {
        LoggingInstaller::default()
    }

    #[cfg(test)]
    pub fn installed(&self) -> &[NegotiatedSa] {
        &self.installed
    }

    #[cfg(test)]
    pub fn failed_acquires(&self) -> &[TrafficSelectors] {
        &self.failed_acquires
    }
}

impl SaInstaller for LoggingInstaller {
    fn get_spi(
        &mut self,
        protocol: IpsecProtocol,
        src: IpAddr,
        dst: IpAddr,
    ) -> Result<u32, InstallerError> {
        let mut rng = rand::thread_rng();
        // SPIs 1-255 are reserved by IANA.
        for _ in 0..16 {
            let spi = rng.gen_range(0x100..=u32::MAX);
            if self.reserved.insert((protocol, spi)) {
                trace!("Reserved {} SPI {:08x} for {} -> {}", protocol, spi, src, dst);
                return Ok(spi);
            }
        }
        Err("Failed to find an unused SPI".into())
    }

    fn add_sa(&mut self, sa: &NegotiatedSa) -> Result<(), InstallerError> {
        if !self.reserved.contains(&(sa.protocol, sa.inbound.spi)) {
            return Err("Inbound SPI was not reserved".into());
        }
        info!("Installing SA {}", sa);
        trace!(
            "Inbound keys {} / {}, outbound keys {} / {}",
            crate::logger::fmt_slice_hex(&sa.inbound.encryption_key),
            crate::logger::fmt_slice_hex(&sa.inbound.integrity_key),
            crate::logger::fmt_slice_hex(&sa.outbound.encryption_key),
            crate::logger::fmt_slice_hex(&sa.outbound.integrity_key),
        );
        self.installed.push(sa.clone());
        Ok(())
    }

    fn delete_sa(
        &mut self,
        protocol: IpsecProtocol,
        spi: u32,
        src: IpAddr,
        dst: IpAddr,
    ) -> Result<(), InstallerError> {
        let reserved = self.reserved.remove(&(protocol, spi));
        let before = self.installed.len();
        self.installed.retain(|sa| {
            !(sa.protocol == protocol && (sa.inbound.spi == spi || sa.outbound.spi == spi))
        });
        if reserved || self.installed.len() != before {
            info!("Deleted {} SA {:08x} ({} -> {})", protocol, spi, src, dst);
            Ok(())
        } else {
            Err("SA not found".into())
        }
    }

    fn acquire_failed(&mut self, selectors: &TrafficSelectors) {
        warn!("Failed to negotiate an SA for {}", selectors);
        self.failed_acquires.push(*selectors);
    }
}

pub struct InstallerError {
    msg: &'static str,
}

impl fmt::Display for InstallerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.msg)
    }
}

impl fmt::Debug for InstallerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl error::Error for InstallerError {}

impl From<&'static str> for InstallerError {
    fn from(msg: &'static str) -> InstallerError {
        InstallerError { msg }
    }
}

#[cfg(test)]
mod tests {
    use zeroize::Zeroizing;

    use super::super::policy::{EspCipher, IntegrityAlgorithm, Subnet};
    use super::*;

    fn negotiated(inbound_spi: u32) -> NegotiatedSa {
        let local: IpAddr = "192.0.2.1".parse().unwrap();
        let remote: IpAddr = "192.0.2.2".parse().unwrap();
        NegotiatedSa {
            protocol: IpsecProtocol::Esp,
            transform: IpsecTransform::esp(EspCipher::Aes(16), Some(IntegrityAlgorithm::HmacSha1)),
            encapsulation: Encapsulation::Tunnel,
            selectors: TrafficSelectors {
                local: Subnet::host(local),
                remote: Subnet::host(remote),
            },
            lifetime: Duration::from_secs(3600),
            inbound: SaDirection {
                spi: inbound_spi,
                src: remote,
                dst: local,
                encryption_key: Zeroizing::new(vec![1u8; 16]),
                integrity_key: Zeroizing::new(vec![2u8; 20]),
            },
            outbound: SaDirection {
                spi: 0x1234,
                src: local,
                dst: remote,
                encryption_key: Zeroizing::new(vec![3u8; 16]),
                integrity_key: Zeroizing::new(vec![4u8; 20]),
            },
        }
    }

    #[test]
    fn install_and_delete() {
        let mut installer = LoggingInstaller::new();
        let local: IpAddr = "192.0.2.1".parse().unwrap();
        let remote: IpAddr = "192.0.2.2".parse().unwrap();
        let spi = installer.get_spi(IpsecProtocol::Esp, remote, local).unwrap();
        assert!(spi >= 0x100);
        assert!(installer.add_sa(&negotiated(spi)).is_ok());
        assert_eq!(installer.installed().len(), 1);
        assert!(installer
            .delete_sa(IpsecProtocol::Esp, spi, remote, local)
            .is_ok());
        assert!(installer.installed().is_empty());
        assert!(installer
            .delete_sa(IpsecProtocol::Esp, spi, remote, local)
            .is_err());
    }

    #[test]
    fn sa_description_names_both_directions() {
        let description = negotiated(0xabcd).to_string();
        assert!(description.contains("in 0000abcd (192.0.2.2 -> 192.0.2.1)"));
        assert!(description.contains("out 00001234 (192.0.2.1 -> 192.0.2.2)"));
    }

    #[test]
    fn unreserved_spi_is_rejected() {
        let mut installer = LoggingInstaller::new();
        assert!(installer.add_sa(&negotiated(0x5555)).is_err());
    }
}
