use aes::{Aes128, Aes192, Aes256};
use blowfish::Blowfish;
use cast5::Cast5;
use cipher::{
    block_padding::NoPadding, BlockCipher, BlockDecryptMut, BlockEncryptMut, InnerIvInit,
    KeyInit,
};
use crypto_bigint::{
    const_residue, impl_modulus,
    modular::constant_mod::{self, ResidueParams},
    Encoding, U1024, U1536, U2048, U768,
};
use des::{Des, TdesEde3};
use hmac::{Hmac, Mac};
use log::debug;
use md5::Md5;
use rand::Rng;
use sha1::{Digest, Sha1};
use sha2::{Sha256, Sha384, Sha512};
use std::{error, fmt};
use zeroize::{Zeroize, Zeroizing};

pub type SecretBytes = Zeroizing<Vec<u8>>;

pub fn random_bytes(len: usize) -> Result<Vec<u8>, CryptoError> {
    let mut result = vec![0u8; len];
    rand::thread_rng()
        .try_fill(result.as_mut_slice())
        .map_err(|err| {
            debug!("Failed to generate random bytes: {}", err);
            "Failed to generate random bytes"
        })?;
    Ok(result)
}

pub fn hash_sha1(data: &[&[u8]]) -> [u8; 160 / 8] {
    let mut hasher = Sha1::new();
    data.iter().for_each(|part| hasher.update(part));
    hasher.finalize().into()
}

/// Oakley hash algorithm, also used as the HMAC-based PRF.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HashAlgorithm {
    Md5,
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    pub fn from_oakley(value: u32) -> Option<HashAlgorithm> {
        match value {
            1 => Some(Self::Md5),
            2 => Some(Self::Sha1),
            4 => Some(Self::Sha256),
            5 => Some(Self::Sha384),
            6 => Some(Self::Sha512),
            _ => None,
        }
    }

    pub fn oakley_id(&self) -> u16 {
        match self {
            Self::Md5 => 1,
            Self::Sha1 => 2,
            Self::Sha256 => 4,
            Self::Sha384 => 5,
            Self::Sha512 => 6,
        }
    }

    pub fn output_length(&self) -> usize {
        match self {
            Self::Md5 => 128 / 8,
            Self::Sha1 => 160 / 8,
            Self::Sha256 => 256 / 8,
            Self::Sha384 => 384 / 8,
            Self::Sha512 => 512 / 8,
        }
    }

    pub fn hash(&self, data: &[&[u8]]) -> Vec<u8> {
        fn digest<D: Digest>(data: &[&[u8]]) -> Vec<u8> {
            let mut hasher = D::new();
            data.iter().for_each(|part| hasher.update(part));
            hasher.finalize().to_vec()
        }
        match self {
            Self::Md5 => digest::<Md5>(data),
            Self::Sha1 => digest::<Sha1>(data),
            Self::Sha256 => digest::<Sha256>(data),
            Self::Sha384 => digest::<Sha384>(data),
            Self::Sha512 => digest::<Sha512>(data),
        }
    }

    pub fn prf(&self, key: &[u8], data: &[&[u8]]) -> Result<SecretBytes, InitError> {
        Ok(PseudorandomTransform::init(*self, key)?.prf(data))
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Md5 => write!(f, "MD5"),
            Self::Sha1 => write!(f, "SHA1"),
            Self::Sha256 => write!(f, "SHA256"),
            Self::Sha384 => write!(f, "SHA384"),
            Self::Sha512 => write!(f, "SHA512"),
        }
    }
}

type HmacMd5 = Hmac<Md5>;
type HmacSha1 = Hmac<Sha1>;
type HmacSha256 = Hmac<Sha256>;
type HmacSha384 = Hmac<Sha384>;
type HmacSha512 = Hmac<Sha512>;

#[derive(Clone)]
pub enum PseudorandomTransform {
    HmacMd5(HmacMd5),
    HmacSha1(HmacSha1),
    HmacSha256(HmacSha256),
    HmacSha384(HmacSha384),
    HmacSha512(HmacSha512),
}

impl PseudorandomTransform {
    pub fn init(hash: HashAlgorithm, key: &[u8]) -> Result<PseudorandomTransform, InitError> {
        let err = |_| InitError::new("Failed to init HMAC PRF");
        Ok(match hash {
            HashAlgorithm::Md5 => Self::HmacMd5(<HmacMd5 as Mac>::new_from_slice(key).map_err(err)?),
            HashAlgorithm::Sha1 => {
                Self::HmacSha1(<HmacSha1 as Mac>::new_from_slice(key).map_err(err)?)
            }
            HashAlgorithm::Sha256 => {
                Self::HmacSha256(<HmacSha256 as Mac>::new_from_slice(key).map_err(err)?)
            }
            HashAlgorithm::Sha384 => {
                Self::HmacSha384(<HmacSha384 as Mac>::new_from_slice(key).map_err(err)?)
            }
            HashAlgorithm::Sha512 => {
                Self::HmacSha512(<HmacSha512 as Mac>::new_from_slice(key).map_err(err)?)
            }
        })
    }

    pub fn prf(&self, data: &[&[u8]]) -> SecretBytes {
        fn compute<M: Mac + Clone>(hmac: &M, data: &[&[u8]]) -> SecretBytes {
            let mut hmac = hmac.clone();
            data.iter().for_each(|part| hmac.update(part));
            Zeroizing::new(hmac.finalize().into_bytes().to_vec())
        }
        match self {
            Self::HmacMd5(ref hmac) => compute(hmac, data),
            Self::HmacSha1(ref hmac) => compute(hmac, data),
            Self::HmacSha256(ref hmac) => compute(hmac, data),
            Self::HmacSha384(ref hmac) => compute(hmac, data),
            Self::HmacSha512(ref hmac) => compute(hmac, data),
        }
    }
}

/// Oakley/MODP Diffie-Hellman group (RFC 2409, RFC 3526).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DhGroup {
    Modp768,
    Modp1024,
    Modp1536,
    Modp2048,
}

impl DhGroup {
    pub fn from_group_number(value: u32) -> Option<DhGroup> {
        match value {
            1 => Some(Self::Modp768),
            2 => Some(Self::Modp1024),
            5 => Some(Self::Modp1536),
            14 => Some(Self::Modp2048),
            _ => None,
        }
    }

    pub fn group_number(&self) -> u16 {
        match self {
            Self::Modp768 => 1,
            Self::Modp1024 => 2,
            Self::Modp1536 => 5,
            Self::Modp2048 => 14,
        }
    }

    pub fn key_length_bytes(&self) -> usize {
        match self {
            Self::Modp768 => 768 / 8,
            Self::Modp1024 => 1024 / 8,
            Self::Modp1536 => 1536 / 8,
            Self::Modp2048 => 2048 / 8,
        }
    }

    pub fn generate(&self) -> Result<DHTransformType, InitError> {
        DHTransformType::init(*self)
    }
}

impl fmt::Display for DhGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MODP {}", self.key_length_bytes() * 8)
    }
}

pub trait DHTransform {
    fn read_public_key(&self) -> &[u8];

    fn group(&self) -> DhGroup;

    fn compute_shared_secret(&self, other_public_key: &[u8]) -> Result<SecretBytes, InitError>;
}

pub enum DHTransformType {
    MODP768(DHTransformMODP768),
    MODP1024(DHTransformMODP1024),
    MODP1536(DHTransformMODP1536),
    MODP2048(DHTransformMODP2048),
}

impl DHTransformType {
    fn init(group: DhGroup) -> Result<DHTransformType, InitError> {
        Ok(match group {
            DhGroup::Modp768 => Self::MODP768(DHTransformMODP768::generate()?),
            DhGroup::Modp1024 => Self::MODP1024(DHTransformMODP1024::generate()?),
            DhGroup::Modp1536 => Self::MODP1536(DHTransformMODP1536::generate()?),
            DhGroup::Modp2048 => Self::MODP2048(DHTransformMODP2048::generate()?),
        })
    }
}

impl DHTransform for DHTransformType {
    fn read_public_key(&self) -> &[u8] {
        match self {
            Self::MODP768(ref dh) => dh.read_public_key(),
            Self::MODP1024(ref dh) => dh.read_public_key(),
            Self::MODP1536(ref dh) => dh.read_public_key(),
            Self::MODP2048(ref dh) => dh.read_public_key(),
        }
    }

    fn group(&self) -> DhGroup {
        match self {
            Self::MODP768(ref dh) => dh.group(),
            Self::MODP1024(ref dh) => dh.group(),
            Self::MODP1536(ref dh) => dh.group(),
            Self::MODP2048(ref dh) => dh.group(),
        }
    }

    fn compute_shared_secret(&self, other_public_key: &[u8]) -> Result<SecretBytes, InitError> {
        match self {
            Self::MODP768(ref dh) => dh.compute_shared_secret(other_public_key),
            Self::MODP1024(ref dh) => dh.compute_shared_secret(other_public_key),
            Self::MODP1536(ref dh) => dh.compute_shared_secret(other_public_key),
            Self::MODP2048(ref dh) => dh.compute_shared_secret(other_public_key),
        }
    }
}

macro_rules! modp_transform {
    ($name:ident, $uint:ident, $modulus:ident, $residue:ident, $group:expr) => {
        pub struct $name {
            private_key: $uint,
            public_key: Vec<u8>,
        }

        impl $name {
            fn generate() -> Result<$name, InitError> {
                let mut private_key = random_bytes($uint::BYTES).map_err(|_| {
                    InitError::new("Failed to generate DH private key")
                })?;
                let private_key_value = $uint::from_be_slice(&private_key);
                private_key.zeroize();
                // This calculates the generator^private_key mod p.
                let public_key = $residue.pow(&private_key_value).retrieve();
                Ok($name {
                    private_key: private_key_value,
                    public_key: public_key.to_be_bytes().to_vec(),
                })
            }
        }

        impl DHTransform for $name {
            fn read_public_key(&self) -> &[u8] {
                &self.public_key
            }

            fn group(&self) -> DhGroup {
                $group
            }

            fn compute_shared_secret(
                &self,
                other_public_key: &[u8],
            ) -> Result<SecretBytes, InitError> {
                if other_public_key.is_empty() || other_public_key.len() > $uint::BYTES {
                    debug!(
                        "{} public key has invalid length {}",
                        $group,
                        other_public_key.len()
                    );
                    return Err("DH public key length is not valid".into());
                }
                // Shorter values are left-padded with zeros.
                let mut padded = [0u8; $uint::BYTES];
                padded[$uint::BYTES - other_public_key.len()..].copy_from_slice(other_public_key);
                let other_public_key = $uint::from_be_slice(&padded);
                let upper_bound = $modulus::MODULUS.wrapping_sub(&$uint::ONE);
                if other_public_key <= $uint::ONE || other_public_key >= upper_bound {
                    debug!("{} public key is out of range", $group);
                    return Err("DH public key is out of range".into());
                }
                let other_key_residue = const_residue!(other_public_key, $modulus);
                let shared_key = other_key_residue.pow(&self.private_key).retrieve();
                Ok(Zeroizing::new(shared_key.to_be_bytes().to_vec()))
            }
        }

        impl Drop for $name {
            fn drop(&mut self) {
                self.private_key.zeroize();
            }
        }
    };
}

modp_transform!(
    DHTransformMODP768,
    U768,
    DHModulus768,
    DH_MODP_RESIDUE_768,
    DhGroup::Modp768
);
modp_transform!(
    DHTransformMODP1024,
    U1024,
    DHModulus1024,
    DH_MODP_RESIDUE_1024,
    DhGroup::Modp1024
);
modp_transform!(
    DHTransformMODP1536,
    U1536,
    DHModulus1536,
    DH_MODP_RESIDUE_1536,
    DhGroup::Modp1536
);
modp_transform!(
    DHTransformMODP2048,
    U2048,
    DHModulus2048,
    DH_MODP_RESIDUE_2048,
    DhGroup::Modp2048
);

/// Oakley encryption algorithm with its effective key length in bytes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EncryptionAlgorithm {
    Des,
    TripleDes,
    Blowfish(usize),
    Cast(usize),
    Aes(usize),
}

impl EncryptionAlgorithm {
    /// Maps an Oakley algorithm ID and optional key length (in bits).
    pub fn from_oakley(value: u32, key_length: Option<u32>) -> Option<EncryptionAlgorithm> {
        let key_bytes = |default: u32, min: u32, max: u32| {
            let bits = key_length.unwrap_or(default);
            if bits < min || bits > max || bits % 8 != 0 {
                None
            } else {
                Some(bits as usize / 8)
            }
        };
        match value {
            1 if key_length.is_none() => Some(Self::Des),
            5 if key_length.is_none() => Some(Self::TripleDes),
            3 => Some(Self::Blowfish(key_bytes(128, 40, 448)?)),
            6 => Some(Self::Cast(key_bytes(128, 40, 128)?)),
            7 => match key_length.unwrap_or(128) {
                128 | 192 | 256 => Some(Self::Aes(key_bytes(128, 128, 256)?)),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn oakley_id(&self) -> u16 {
        match self {
            Self::Des => 1,
            Self::Blowfish(_) => 3,
            Self::TripleDes => 5,
            Self::Cast(_) => 6,
            Self::Aes(_) => 7,
        }
    }

    /// Key length attribute, only sent for variable-length ciphers.
    pub fn key_length_attribute(&self) -> Option<u16> {
        match self {
            Self::Des | Self::TripleDes => None,
            Self::Blowfish(len) | Self::Cast(len) | Self::Aes(len) => Some((*len * 8) as u16),
        }
    }

    pub fn key_length(&self) -> usize {
        match self {
            Self::Des => 8,
            Self::TripleDes => 24,
            Self::Blowfish(len) | Self::Cast(len) | Self::Aes(len) => *len,
        }
    }

    pub fn init(&self, key: &[u8], weak_keys: WeakKeyPolicy) -> Result<EncryptionType, InitError> {
        if key.len() != self.key_length() {
            debug!(
                "{} key length {} doesn't match expected {}",
                self,
                key.len(),
                self.key_length()
            );
            return Err("Encryption key length is not valid".into());
        }
        if weak_keys == WeakKeyPolicy::Reject && self.is_weak_key(key) {
            debug!("{} key is weak", self);
            return Err("Weak encryption key".into());
        }
        let err = |_| InitError::new("Failed to init encryption key");
        Ok(match self {
            Self::Des => EncryptionType::Des(Des::new_from_slice(key).map_err(err)?),
            Self::TripleDes => {
                EncryptionType::TripleDes(TdesEde3::new_from_slice(key).map_err(err)?)
            }
            Self::Blowfish(_) => EncryptionType::Blowfish(Blowfish::new_from_slice(key).map_err(err)?),
            Self::Cast(_) => EncryptionType::Cast5(Cast5::new_from_slice(key).map_err(err)?),
            Self::Aes(16) => EncryptionType::Aes128(Aes128::new_from_slice(key).map_err(err)?),
            Self::Aes(24) => EncryptionType::Aes192(Aes192::new_from_slice(key).map_err(err)?),
            Self::Aes(32) => EncryptionType::Aes256(Aes256::new_from_slice(key).map_err(err)?),
            Self::Aes(_) => return Err("Unsupported AES key length".into()),
        })
    }

    /// Checks DES keys (and each 3DES sub-key) against the weak and semi-weak key list.
    pub fn is_weak_key(&self, key: &[u8]) -> bool {
        match self {
            Self::Des | Self::TripleDes => key.chunks(8).any(is_des_weak_key),
            _ => false,
        }
    }
}

impl fmt::Display for EncryptionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Des => write!(f, "DES-CBC"),
            Self::TripleDes => write!(f, "3DES-CBC"),
            Self::Blowfish(len) => write!(f, "Blowfish-CBC-{}", len * 8),
            Self::Cast(len) => write!(f, "CAST-CBC-{}", len * 8),
            Self::Aes(len) => write!(f, "AES-CBC-{}", len * 8),
        }
    }
}

const DES_WEAK_KEYS: [[u8; 8]; 16] = [
    [0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01],
    [0xFE, 0xFE, 0xFE, 0xFE, 0xFE, 0xFE, 0xFE, 0xFE],
    [0xE0, 0xE0, 0xE0, 0xE0, 0xF1, 0xF1, 0xF1, 0xF1],
    [0x1F, 0x1F, 0x1F, 0x1F, 0x0E, 0x0E, 0x0E, 0x0E],
    [0x01, 0x1F, 0x01, 0x1F, 0x01, 0x0E, 0x01, 0x0E],
    [0x1F, 0x01, 0x1F, 0x01, 0x0E, 0x01, 0x0E, 0x01],
    [0x01, 0xE0, 0x01, 0xE0, 0x01, 0xF1, 0x01, 0xF1],
    [0xE0, 0x01, 0xE0, 0x01, 0xF1, 0x01, 0xF1, 0x01],
    [0x01, 0xFE, 0x01, 0xFE, 0x01, 0xFE, 0x01, 0xFE],
    [0xFE, 0x01, 0xFE, 0x01, 0xFE, 0x01, 0xFE, 0x01],
    [0x1F, 0xE0, 0x1F, 0xE0, 0x0E, 0xF1, 0x0E, 0xF1],
    [0xE0, 0x1F, 0xE0, 0x1F, 0xF1, 0x0E, 0xF1, 0x0E],
    [0x1F, 0xFE, 0x1F, 0xFE, 0x0E, 0xFE, 0x0E, 0xFE],
    [0xFE, 0x1F, 0xFE, 0x1F, 0xFE, 0x0E, 0xFE, 0x0E],
    [0xE0, 0xFE, 0xE0, 0xFE, 0xF1, 0xFE, 0xF1, 0xFE],
    [0xFE, 0xE0, 0xFE, 0xE0, 0xFE, 0xF1, 0xFE, 0xF1],
];

fn is_des_weak_key(key: &[u8]) -> bool {
    // Parity bits are ignored.
    DES_WEAK_KEYS.iter().any(|weak| {
        key.len() == weak.len()
            && key
                .iter()
                .zip(weak.iter())
                .all(|(a, b)| a & 0xfe == b & 0xfe)
    })
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum WeakKeyPolicy {
    #[default]
    Allow,
    Reject,
}

#[derive(Clone)]
pub enum EncryptionType {
    Des(Des),
    TripleDes(TdesEde3),
    Blowfish(Blowfish),
    Cast5(Cast5),
    Aes128(Aes128),
    Aes192(Aes192),
    Aes256(Aes256),
}

fn cbc_encrypt<C>(cipher: &C, iv: &[u8], data: &mut [u8]) -> Result<(), CryptoError>
where
    C: BlockEncryptMut + BlockCipher + Clone,
{
    let block_encryptor =
        cbc::Encryptor::<C>::inner_iv_slice_init(cipher.clone(), iv).map_err(|err| {
            debug!("Failed to init CBC IV: {}", err);
            "Failed to init CBC IV"
        })?;
    let msg_len = data.len();
    block_encryptor
        .encrypt_padded_mut::<NoPadding>(data, msg_len)
        .map_err(|err| {
            debug!("Failed to encrypt CBC message: {}", err);
            "Failed to encrypt CBC message"
        })?;
    Ok(())
}

fn cbc_decrypt<C>(cipher: &C, iv: &[u8], data: &mut [u8]) -> Result<(), CryptoError>
where
    C: BlockDecryptMut + BlockCipher + Clone,
{
    let block_decryptor =
        cbc::Decryptor::<C>::inner_iv_slice_init(cipher.clone(), iv).map_err(|err| {
            debug!("Failed to init CBC IV: {}", err);
            "Failed to init CBC IV"
        })?;
    block_decryptor
        .decrypt_padded_mut::<NoPadding>(data)
        .map_err(|err| {
            debug!("Failed to decrypt CBC message: {}", err);
            "Failed to decrypt CBC message"
        })?;
    Ok(())
}

impl EncryptionType {
    pub fn block_size(&self) -> usize {
        match self {
            Self::Aes128(_) | Self::Aes192(_) | Self::Aes256(_) => 16,
            _ => 8,
        }
    }

    /// Encrypts whole blocks in place, using CBC mode.
    pub fn encrypt(&self, iv: &[u8], data: &mut [u8]) -> Result<(), CryptoError> {
        match self {
            Self::Des(ref cipher) => cbc_encrypt(cipher, iv, data),
            Self::TripleDes(ref cipher) => cbc_encrypt(cipher, iv, data),
            Self::Blowfish(ref cipher) => cbc_encrypt(cipher, iv, data),
            Self::Cast5(ref cipher) => cbc_encrypt(cipher, iv, data),
            Self::Aes128(ref cipher) => cbc_encrypt(cipher, iv, data),
            Self::Aes192(ref cipher) => cbc_encrypt(cipher, iv, data),
            Self::Aes256(ref cipher) => cbc_encrypt(cipher, iv, data),
        }
    }

    /// Decrypts whole blocks in place, using CBC mode.
    pub fn decrypt(&self, iv: &[u8], data: &mut [u8]) -> Result<(), CryptoError> {
        match self {
            Self::Des(ref cipher) => cbc_decrypt(cipher, iv, data),
            Self::TripleDes(ref cipher) => cbc_decrypt(cipher, iv, data),
            Self::Blowfish(ref cipher) => cbc_decrypt(cipher, iv, data),
            Self::Cast5(ref cipher) => cbc_decrypt(cipher, iv, data),
            Self::Aes128(ref cipher) => cbc_decrypt(cipher, iv, data),
            Self::Aes192(ref cipher) => cbc_decrypt(cipher, iv, data),
            Self::Aes256(ref cipher) => cbc_decrypt(cipher, iv, data),
        }
    }
}

const MAX_PADDING_LENGTH: usize = 255;

/// How outgoing messages are padded and incoming padding is checked.
#[derive(Clone, Debug)]
pub struct PaddingConfig {
    pub random_bytes: bool,
    pub random_length: bool,
    pub max_length: usize,
    pub exclude_tail: bool,
    pub strict: bool,
}

impl Default for PaddingConfig {
    fn default() -> PaddingConfig {
        PaddingConfig {
            random_bytes: true,
            random_length: false,
            max_length: 20,
            exclude_tail: true,
            strict: false,
        }
    }
}

impl PaddingConfig {
    pub fn padding_length(&self, msg_len: usize, block_size: usize) -> usize {
        let mut padding = block_size - msg_len % block_size;
        if self.random_length {
            // The pad length is stored in a single byte.
            let limit = (MAX_PADDING_LENGTH - padding) / block_size;
            let extra_blocks = (rand::thread_rng().gen_range(0..=self.max_length) + 1).min(limit);
            padding += extra_blocks * block_size;
        }
        padding
    }
}

/// Keys derived from SKEYID (RFC 2409, Section 5).
pub struct Phase1Keys {
    pub skeyid: SecretBytes,
    pub skeyid_d: SecretBytes,
    pub skeyid_a: SecretBytes,
    pub skeyid_e: SecretBytes,
    pub enc_key: SecretBytes,
}

pub fn skeyid_psk(
    hash: HashAlgorithm,
    psk: &[u8],
    nonce_i: &[u8],
    nonce_r: &[u8],
) -> Result<SecretBytes, InitError> {
    hash.prf(psk, &[nonce_i, nonce_r])
}

pub fn skeyid_signature(
    hash: HashAlgorithm,
    nonce_i: &[u8],
    nonce_r: &[u8],
    shared_secret: &[u8],
) -> Result<SecretBytes, InitError> {
    let mut key = Zeroizing::new(Vec::with_capacity(nonce_i.len() + nonce_r.len()));
    key.extend_from_slice(nonce_i);
    key.extend_from_slice(nonce_r);
    hash.prf(&key, &[shared_secret])
}

pub fn derive_phase1_keys(
    hash: HashAlgorithm,
    skeyid: SecretBytes,
    shared_secret: &[u8],
    cookie_i: u64,
    cookie_r: u64,
    encryption: EncryptionAlgorithm,
) -> Result<Phase1Keys, InitError> {
    let cookie_i = cookie_i.to_be_bytes();
    let cookie_r = cookie_r.to_be_bytes();
    let prf = PseudorandomTransform::init(hash, &skeyid)?;
    let skeyid_d = prf.prf(&[shared_secret, &cookie_i, &cookie_r, &[0]]);
    let skeyid_a = prf.prf(&[&skeyid_d, shared_secret, &cookie_i, &cookie_r, &[1]]);
    let skeyid_e = prf.prf(&[&skeyid_a, shared_secret, &cookie_i, &cookie_r, &[2]]);
    let enc_key = encryption_key(hash, &skeyid_e, encryption.key_length())?;
    Ok(Phase1Keys {
        skeyid,
        skeyid_d,
        skeyid_a,
        skeyid_e,
        enc_key,
    })
}

/// Expands SKEYID_e into a key of the required length (RFC 2409, Appendix B).
pub fn encryption_key(
    hash: HashAlgorithm,
    skeyid_e: &[u8],
    key_length: usize,
) -> Result<SecretBytes, InitError> {
    if key_length <= skeyid_e.len() {
        return Ok(Zeroizing::new(skeyid_e[..key_length].to_vec()));
    }
    let prf = PseudorandomTransform::init(hash, skeyid_e)?;
    let mut result = Zeroizing::new(Vec::with_capacity(key_length + hash.output_length()));
    let mut block = prf.prf(&[&[0]]);
    result.extend_from_slice(&block);
    while result.len() < key_length {
        block = prf.prf(&[&block]);
        result.extend_from_slice(&block);
    }
    result.truncate(key_length);
    Ok(result)
}

pub fn phase1_iv(hash: HashAlgorithm, public_i: &[u8], public_r: &[u8], block_size: usize) -> Vec<u8> {
    let mut iv = hash.hash(&[public_i, public_r]);
    iv.truncate(block_size);
    iv
}

pub fn phase2_iv(hash: HashAlgorithm, phase1_iv: &[u8], message_id: u32, block_size: usize) -> Vec<u8> {
    let mut iv = hash.hash(&[phase1_iv, &message_id.to_be_bytes()]);
    iv.truncate(block_size);
    iv
}

/// Keying material for an IPsec SA (RFC 2409, Section 5.5).
#[allow(clippy::too_many_arguments)]
pub fn keymat(
    hash: HashAlgorithm,
    skeyid_d: &[u8],
    shared_secret: Option<&[u8]>,
    protocol: u8,
    spi: &[u8],
    nonce_i: &[u8],
    nonce_r: &[u8],
    length: usize,
) -> Result<SecretBytes, InitError> {
    let prf = PseudorandomTransform::init(hash, skeyid_d)?;
    let shared_secret = shared_secret.unwrap_or(&[]);
    let protocol = [protocol];
    let mut result = Zeroizing::new(Vec::with_capacity(length + hash.output_length()));
    let mut block = prf.prf(&[shared_secret, &protocol, spi, nonce_i, nonce_r]);
    result.extend_from_slice(&block);
    while result.len() < length {
        block = prf.prf(&[&block, shared_secret, &protocol, spi, nonce_i, nonce_r]);
        result.extend_from_slice(&block);
    }
    result.truncate(length);
    Ok(result)
}

/// Negotiated phase-1 algorithms and keys, used to protect ISAKMP messages.
pub struct CryptoStack {
    hash: HashAlgorithm,
    encryption: EncryptionType,
    skeyid: SecretBytes,
    skeyid_d: SecretBytes,
    skeyid_a: SecretBytes,
}

impl CryptoStack {
    pub fn new(
        hash: HashAlgorithm,
        encryption: EncryptionAlgorithm,
        keys: Phase1Keys,
        weak_keys: WeakKeyPolicy,
    ) -> Result<CryptoStack, InitError> {
        let cipher = encryption.init(&keys.enc_key, weak_keys)?;
        Ok(CryptoStack {
            hash,
            encryption: cipher,
            skeyid: keys.skeyid,
            skeyid_d: keys.skeyid_d,
            skeyid_a: keys.skeyid_a,
        })
    }

    pub fn hash_algorithm(&self) -> HashAlgorithm {
        self.hash
    }

    pub fn block_size(&self) -> usize {
        self.encryption.block_size()
    }

    pub fn skeyid_d(&self) -> &[u8] {
        &self.skeyid_d
    }

    pub fn prf_skeyid(&self, data: &[&[u8]]) -> Result<SecretBytes, InitError> {
        self.hash.prf(&self.skeyid, data)
    }

    pub fn prf_a(&self, data: &[&[u8]]) -> Result<SecretBytes, InitError> {
        self.hash.prf(&self.skeyid_a, data)
    }

    pub fn phase2_iv(&self, phase1_iv: &[u8], message_id: u32) -> Vec<u8> {
        phase2_iv(self.hash, phase1_iv, message_id, self.block_size())
    }

    /// Encrypts everything after the ISAKMP header, returning the IV for the next message.
    pub fn encrypt_message(
        &self,
        message: &mut Vec<u8>,
        iv: &[u8],
        padding: &PaddingConfig,
    ) -> Result<Vec<u8>, CryptoError> {
        use super::message::{set_message_length, HEADER_LENGTH};
        let block_size = self.block_size();
        if message.len() < HEADER_LENGTH || iv.len() != block_size {
            return Err("Message or IV length is not valid".into());
        }
        let msg_len = message.len() - HEADER_LENGTH;
        let padding_length = padding.padding_length(msg_len, block_size);
        let mut pad = if padding.random_bytes {
            random_bytes(padding_length)?
        } else {
            vec![0u8; padding_length]
        };
        pad[padding_length - 1] = if padding.exclude_tail {
            (padding_length - 1) as u8
        } else {
            padding_length as u8
        };
        message.extend_from_slice(&pad);
        self.encryption.encrypt(iv, &mut message[HEADER_LENGTH..])?;
        set_message_length(message);
        Ok(message[message.len() - block_size..].to_vec())
    }

    /// Decrypts everything after the ISAKMP header, returning the IV for the next message.
    pub fn decrypt_message(
        &self,
        message: &mut Vec<u8>,
        iv: &[u8],
        padding: &PaddingConfig,
    ) -> Result<Vec<u8>, CryptoError> {
        use super::message::{set_message_length, HEADER_LENGTH};
        let block_size = self.block_size();
        if message.len() <= HEADER_LENGTH || iv.len() != block_size {
            return Err("Message or IV length is not valid".into());
        }
        let encrypted_len = message.len() - HEADER_LENGTH;
        if encrypted_len % block_size != 0 {
            debug!(
                "Encrypted length {} is not a multiple of block size {}",
                encrypted_len, block_size
            );
            return Err("Encrypted length is not a multiple of block size".into());
        }
        let next_iv = message[message.len() - block_size..].to_vec();
        self.encryption.decrypt(iv, &mut message[HEADER_LENGTH..])?;
        if padding.strict {
            let last = message[message.len() - 1] as usize;
            let padding_length = if padding.exclude_tail { last + 1 } else { last };
            if padding_length > encrypted_len {
                debug!(
                    "Padding length {} exceeds encrypted length {}",
                    padding_length, encrypted_len
                );
                return Err("Padding length exceeds encrypted data".into());
            }
            message.truncate(message.len() - padding_length);
        }
        set_message_length(message);
        Ok(next_iv)
    }
}

pub struct InitError {
    msg: &'static str,
}

impl InitError {
    fn new(msg: &'static str) -> InitError {
        InitError { msg }
    }
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl fmt::Debug for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl error::Error for InitError {}

impl From<&'static str> for InitError {
    fn from(msg: &'static str) -> InitError {
        InitError { msg }
    }
}

pub struct CryptoError {
    msg: &'static str,
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.msg)?;
        Ok(())
    }
}

impl fmt::Debug for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl error::Error for CryptoError {}

impl From<&'static str> for CryptoError {
    fn from(msg: &'static str) -> CryptoError {
        CryptoError { msg }
    }
}

impl From<InitError> for CryptoError {
    fn from(err: InitError) -> CryptoError {
        CryptoError { msg: err.msg }
    }
}

const DH_MODP_GENERATOR_768: U768 = U768::from_u8(2);
const DH_MODP_RESIDUE_768: constant_mod::Residue<DHModulus768, { U768::LIMBS }> =
    const_residue!(DH_MODP_GENERATOR_768, DHModulus768);

const DH_MODP_GENERATOR_1024: U1024 = U1024::from_u8(2);
const DH_MODP_RESIDUE_1024: constant_mod::Residue<DHModulus1024, { U1024::LIMBS }> =
    const_residue!(DH_MODP_GENERATOR_1024, DHModulus1024);

const DH_MODP_GENERATOR_1536: U1536 = U1536::from_u8(2);
const DH_MODP_RESIDUE_1536: constant_mod::Residue<DHModulus1536, { U1536::LIMBS }> =
    const_residue!(DH_MODP_GENERATOR_1536, DHModulus1536);

const DH_MODP_GENERATOR_2048: U2048 = U2048::from_u8(2);
const DH_MODP_RESIDUE_2048: constant_mod::Residue<DHModulus2048, { U2048::LIMBS }> =
    const_residue!(DH_MODP_GENERATOR_2048, DHModulus2048);

impl_modulus!(
    DHModulus768,
    U768,
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245E485B576625E7EC6F44C42E9A63A3620FFFFFFFFFFFFFFFF"
);

impl_modulus!(
    DHModulus1024,
    U1024,
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7EDEE386BFB5A899FA5AE9F24117C4B1FE649286651ECE65381FFFFFFFFFFFFFFFF"
);

impl_modulus!(
    DHModulus1536,
    U1536,
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7EDEE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB9ED529077096966D670C354E4ABC9804F1746C08CA237327FFFFFFFFFFFFFFFF"
);

impl_modulus!(
    DHModulus2048,
    U2048,
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7EDEE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3BE39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF6955817183995497CEA956AE515D2261898FA051015728E5A8AACAA68FFFFFFFFFFFFFFFF"
);

#[cfg(test)]
mod tests {
    use super::*;

    fn test_keys(encryption: EncryptionAlgorithm) -> Phase1Keys {
        let skeyid = skeyid_psk(HashAlgorithm::Sha1, b"secret", &[1u8; 16], &[2u8; 16]).unwrap();
        derive_phase1_keys(
            HashAlgorithm::Sha1,
            skeyid,
            &[3u8; 128],
            0x1111,
            0x2222,
            encryption,
        )
        .unwrap()
    }

    #[test]
    fn hmac_sha1_rfc2202() {
        let result = HashAlgorithm::Sha1
            .prf(b"Jefe", &[b"what do ya want ", b"for nothing?"])
            .unwrap();
        assert_eq!(
            result.as_slice(),
            &[
                0xef, 0xfc, 0xdf, 0x6a, 0xe5, 0xeb, 0x2f, 0xa2, 0xd2, 0x74, 0x16, 0xd5, 0xf1, 0x84,
                0xdf, 0x9c, 0x25, 0x9a, 0x7c, 0x79
            ]
        );
    }

    #[test]
    fn dh_shared_secret_agrees() {
        let local = DhGroup::Modp1024.generate().unwrap();
        let remote = DhGroup::Modp1024.generate().unwrap();
        assert_eq!(local.read_public_key().len(), 128);
        let local_secret = local
            .compute_shared_secret(remote.read_public_key())
            .unwrap();
        let remote_secret = remote
            .compute_shared_secret(local.read_public_key())
            .unwrap();
        assert_eq!(local_secret.as_slice(), remote_secret.as_slice());
        assert_eq!(local.group().group_number(), 2);
    }

    #[test]
    fn dh_rejects_degenerate_public_keys() {
        let local = DhGroup::Modp768.generate().unwrap();
        assert!(local.compute_shared_secret(&[1]).is_err());
        assert!(local.compute_shared_secret(&[0u8; 96]).is_err());
        assert!(local.compute_shared_secret(&[0xffu8; 96]).is_err());
        assert!(local.compute_shared_secret(&[2u8; 97]).is_err());
        // Short values are left-padded.
        assert!(local.compute_shared_secret(&[2]).is_ok());
    }

    #[test]
    fn encryption_key_expansion() {
        // SHA1 output is shorter than a 3DES key.
        let key = encryption_key(HashAlgorithm::Sha1, &[7u8; 20], 24).unwrap();
        assert_eq!(key.len(), 24);
        let k1 = HashAlgorithm::Sha1.prf(&[7u8; 20], &[&[0]]).unwrap();
        assert_eq!(&key[..20], k1.as_slice());
        let k2 = HashAlgorithm::Sha1.prf(&[7u8; 20], &[&k1]).unwrap();
        assert_eq!(&key[20..], &k2[..4]);

        let key = encryption_key(HashAlgorithm::Sha1, &[7u8; 20], 16).unwrap();
        assert_eq!(key.as_slice(), &[7u8; 16]);
    }

    #[test]
    fn phase1_key_chain() {
        let keys = test_keys(EncryptionAlgorithm::Aes(16));
        let d = HashAlgorithm::Sha1
            .prf(
                &keys.skeyid,
                &[&[3u8; 128], &0x1111u64.to_be_bytes(), &0x2222u64.to_be_bytes(), &[0]],
            )
            .unwrap();
        assert_eq!(keys.skeyid_d.as_slice(), d.as_slice());
        assert_eq!(keys.enc_key.as_slice(), &keys.skeyid_e[..16]);
        assert_ne!(keys.skeyid_a.as_slice(), keys.skeyid_e.as_slice());
    }

    #[test]
    fn keymat_length_and_spi() {
        let a = keymat(HashAlgorithm::Sha1, &[1u8; 20], None, 3, &[0, 0, 0, 1], &[2; 16], &[3; 16], 36)
            .unwrap();
        let b = keymat(HashAlgorithm::Sha1, &[1u8; 20], None, 3, &[0, 0, 0, 2], &[2; 16], &[3; 16], 36)
            .unwrap();
        assert_eq!(a.len(), 36);
        assert_ne!(a.as_slice(), b.as_slice());
        let with_pfs = keymat(
            HashAlgorithm::Sha1,
            &[1u8; 20],
            Some(&[9u8; 128]),
            3,
            &[0, 0, 0, 1],
            &[2; 16],
            &[3; 16],
            36,
        )
        .unwrap();
        assert_ne!(a.as_slice(), with_pfs.as_slice());
    }

    #[test]
    fn encrypt_decrypt_iv_chain() {
        let stack = CryptoStack::new(
            HashAlgorithm::Sha1,
            EncryptionAlgorithm::Aes(16),
            test_keys(EncryptionAlgorithm::Aes(16)),
            WeakKeyPolicy::Allow,
        )
        .unwrap();
        let padding = PaddingConfig {
            strict: true,
            ..Default::default()
        };
        let iv = phase1_iv(HashAlgorithm::Sha1, &[1u8; 128], &[2u8; 128], 16);
        assert_eq!(iv.len(), 16);
        let plaintext = [0x42u8; 28 + 21];
        let mut message = plaintext.to_vec();
        let next_iv = stack.encrypt_message(&mut message, &iv, &padding).unwrap();
        assert_eq!(message.len(), 28 + 32);
        assert_eq!(&message[24..28], &60u32.to_be_bytes());
        assert_eq!(next_iv.as_slice(), &message[message.len() - 16..]);

        let mut received = message.clone();
        let decrypt_iv = stack.decrypt_message(&mut received, &iv, &padding).unwrap();
        assert_eq!(decrypt_iv, next_iv);
        assert_eq!(&received[28..], &plaintext[28..]);
        assert_eq!(&received[24..28], &49u32.to_be_bytes());

        let lenient = PaddingConfig::default();
        let mut received = message.clone();
        stack.decrypt_message(&mut received, &iv, &lenient).unwrap();
        assert_eq!(received.len(), 60);

        let mut truncated = message[..message.len() - 3].to_vec();
        assert!(stack.decrypt_message(&mut truncated, &iv, &padding).is_err());
    }

    #[test]
    fn random_padding_length() {
        let padding = PaddingConfig {
            random_length: true,
            max_length: 3,
            ..Default::default()
        };
        for _ in 0..20 {
            let length = padding.padding_length(13, 8);
            assert_eq!((13 + length) % 8, 0);
            assert!(length > 3 && length <= 3 + 4 * 8);
        }
        assert_eq!(PaddingConfig::default().padding_length(16, 8), 8);
    }

    #[test]
    fn random_padding_fits_length_byte() {
        let padding = PaddingConfig {
            random_length: true,
            max_length: 100,
            strict: true,
            ..Default::default()
        };
        for _ in 0..20 {
            let length = padding.padding_length(13, 16);
            assert_eq!((13 + length) % 16, 0);
            assert!(length <= 255);
        }
        let stack = CryptoStack::new(
            HashAlgorithm::Sha1,
            EncryptionAlgorithm::Aes(16),
            test_keys(EncryptionAlgorithm::Aes(16)),
            WeakKeyPolicy::Allow,
        )
        .unwrap();
        let iv = [7u8; 16];
        let plaintext = [0x42u8; 28 + 13];
        let mut message = plaintext.to_vec();
        stack.encrypt_message(&mut message, &iv, &padding).unwrap();
        stack.decrypt_message(&mut message, &iv, &padding).unwrap();
        assert_eq!(&message[28..], &plaintext[28..]);
    }

    #[test]
    fn des_weak_keys() {
        let des = EncryptionAlgorithm::Des;
        assert!(des.is_weak_key(&[0x01; 8]));
        // Parity bits don't matter.
        assert!(des.is_weak_key(&[0x00; 8]));
        assert!(des.is_weak_key(&[0x1F, 0xE0, 0x1F, 0xE0, 0x0E, 0xF1, 0x0E, 0xF1]));
        assert!(!des.is_weak_key(&[0x13, 0x34, 0x57, 0x79, 0x9B, 0xBC, 0xDF, 0xF1]));
        let mut tdes_key = [0x13u8; 24];
        tdes_key[8..16].copy_from_slice(&[0xFE; 8]);
        assert!(EncryptionAlgorithm::TripleDes.is_weak_key(&tdes_key));
        assert!(EncryptionAlgorithm::TripleDes
            .init(&tdes_key, WeakKeyPolicy::Reject)
            .is_err());
        assert!(EncryptionAlgorithm::TripleDes
            .init(&tdes_key, WeakKeyPolicy::Allow)
            .is_ok());
        assert!(!EncryptionAlgorithm::Aes(16).is_weak_key(&[0x01; 16]));
    }

    #[test]
    fn oakley_encryption_ids() {
        assert_eq!(
            EncryptionAlgorithm::from_oakley(7, Some(256)),
            Some(EncryptionAlgorithm::Aes(32))
        );
        assert_eq!(
            EncryptionAlgorithm::from_oakley(7, None),
            Some(EncryptionAlgorithm::Aes(16))
        );
        assert_eq!(EncryptionAlgorithm::from_oakley(7, Some(160)), None);
        assert_eq!(EncryptionAlgorithm::from_oakley(1, Some(64)), None);
        assert_eq!(
            EncryptionAlgorithm::from_oakley(3, Some(448)),
            Some(EncryptionAlgorithm::Blowfish(56))
        );
    }
}
