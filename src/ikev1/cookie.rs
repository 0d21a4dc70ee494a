use std::{
    fmt,
    net::{IpAddr, SocketAddr},
    time::{SystemTime, UNIX_EPOCH},
};

use rand::Rng;

use super::crypto::{self, CryptoError};

/// ISAKMP SA index: the pair of cookies chosen by the initiator and the responder.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub struct Index {
    pub initiator_cookie: u64,
    pub responder_cookie: u64,
}

impl Index {
    pub fn new(initiator_cookie: u64, responder_cookie: u64) -> Index {
        Index {
            initiator_cookie,
            responder_cookie,
        }
    }

    pub fn has_responder_cookie(&self) -> bool {
        self.responder_cookie != 0
    }

    /// Encodes both cookies, as used in ISAKMP notify and delete SPIs.
    pub fn to_bytes(&self) -> [u8; 16] {
        let mut result = [0u8; 16];
        result[..8].copy_from_slice(&self.initiator_cookie.to_be_bytes());
        result[8..].copy_from_slice(&self.responder_cookie.to_be_bytes());
        result
    }

    pub fn from_bytes(data: &[u8]) -> Option<Index> {
        if data.len() != 16 {
            return None;
        }
        let mut initiator_cookie = [0u8; 8];
        let mut responder_cookie = [0u8; 8];
        initiator_cookie.copy_from_slice(&data[..8]);
        responder_cookie.copy_from_slice(&data[8..]);
        Some(Index {
            initiator_cookie: u64::from_be_bytes(initiator_cookie),
            responder_cookie: u64::from_be_bytes(responder_cookie),
        })
    }
}

impl fmt::Display for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:016x}:{:016x}",
            self.initiator_cookie, self.responder_cookie
        )
    }
}

pub struct CookieGenerator {
    secret: [u8; 32],
}

impl CookieGenerator {
    pub fn new() -> Result<CookieGenerator, CryptoError> {
        let random = crypto::random_bytes(32)?;
        let mut secret = [0u8; 32];
        secret.copy_from_slice(&random);
        Ok(CookieGenerator { secret })
    }

    /// Generates an unpredictable cookie from the address pair, time and a local secret
    /// (RFC 2408, Section 2.5.3).
    pub fn generate(
        &self,
        remote_addr: SocketAddr,
        local_addr: SocketAddr,
    ) -> Result<u64, CryptoError> {
        let time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|time| time.as_nanos())
            .unwrap_or_default();
        loop {
            let salt = crypto::random_bytes(8)?;
            let hash = crypto::hash_sha1(&[
                &ip_bytes(remote_addr.ip()),
                &remote_addr.port().to_be_bytes(),
                &ip_bytes(local_addr.ip()),
                &local_addr.port().to_be_bytes(),
                &time.to_be_bytes(),
                &salt,
                &self.secret,
            ]);
            let mut cookie = [0u8; 8];
            cookie.copy_from_slice(&hash[..8]);
            let cookie = u64::from_be_bytes(cookie);
            if cookie != 0 {
                return Ok(cookie);
            }
        }
    }
}

fn ip_bytes(addr: IpAddr) -> Vec<u8> {
    match addr {
        IpAddr::V4(addr) => addr.octets().to_vec(),
        IpAddr::V6(addr) => addr.octets().to_vec(),
    }
}

/// Picks a random non-zero message ID that is not in use.
pub fn random_message_id<F>(in_use: F) -> u32
where
    F: Fn(u32) -> bool,
{
    let mut rng = rand::thread_rng();
    loop {
        let message_id = rng.gen::<u32>();
        if message_id != 0 && !in_use(message_id) {
            return message_id;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookies_are_unique() {
        let generator = CookieGenerator::new().unwrap();
        let remote = "192.0.2.1:500".parse().unwrap();
        let local = "192.0.2.2:500".parse().unwrap();
        let first = generator.generate(remote, local).unwrap();
        let second = generator.generate(remote, local).unwrap();
        assert_ne!(first, 0);
        assert_ne!(first, second);
    }

    #[test]
    fn index_encoding() {
        let index = Index::new(0x0102030405060708, 0x1112131415161718);
        assert_eq!(
            index.to_string(),
            "0102030405060708:1112131415161718"
        );
        assert_eq!(Index::from_bytes(&index.to_bytes()), Some(index));
        assert_eq!(Index::from_bytes(&[0u8; 8]), None);
        assert!(!Index::new(1, 0).has_responder_cookie());
    }

    #[test]
    fn message_id_skips_used_values() {
        let message_id = random_message_id(|id| id % 2 == 0);
        assert_eq!(message_id % 2, 1);
    }
}
