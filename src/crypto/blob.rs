//! Key Blob Wire Formats
//!
//! Three little-endian tagged layouts travel between the client, the local
//! store and the server, all base64-armored on the wire:
//!
//! - `priv_key_v1 = u32 type | u32 flags | u8 salt[64] | u8 ciphertext[..]`
//! - `pub_key_v1  = u32 type | u32 flags | u8 key[..]`
//! - `sym_key_v1  = u32 type | u32 flags | u8 aes_key[32] | u8 hmac_key[64]`
//!
//! The symmetric bundle is exactly 104 bytes and is only ever persisted in
//! RSA-wrapped form.

use base64::{engine::general_purpose, Engine as _};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha512;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::{CryptoError, CryptoResult};

/// PBKDF2 salt length in bytes
pub const SALT_LEN: usize = 64;

/// PBKDF2 iteration count of the only recognized private-key version
pub const PBKDF2_ITERATIONS: u32 = 20_000;

/// AES-256 key length
pub const AES_KEY_LEN: usize = 32;

/// AES block / CTR nonce length
pub const AES_BLOCK_LEN: usize = 16;

/// HMAC-SHA512 key length
pub const HMAC_KEY_LEN: usize = 64;

/// Serialized `sym_key_v1` length
pub const SYM_KEY_LEN: usize = 8 + AES_KEY_LEN + HMAC_KEY_LEN;

/// Version tag of `priv_key_v1`: RSA-4096, 64-byte salt, 20 000 iterations
pub const PRIV_KEY_TYPE_RSA4096_64BYTESALT_20000IT: u32 = 1;

/// Version tag of `pub_key_v1`: RSA-4096
pub const PUB_KEY_TYPE_RSA4096: u32 = 1;

/// Version tag of `sym_key_v1`: AES-256 + 1024-bit HMAC key
pub const SYM_KEY_TYPE_AES256_1024BIT_HMAC: u32 = 1;

/// `sym_key_v1` flag bit: the key belongs to a folder
pub const SYM_FLAG_IS_DIR: u32 = 1;

/// Base64-armor a blob for the wire
pub fn wire_encode(data: &[u8]) -> String {
    general_purpose::STANDARD.encode(data)
}

/// Decode a base64 wire blob
pub fn wire_decode(data: &str) -> CryptoResult<Vec<u8>> {
    general_purpose::STANDARD
        .decode(data.trim())
        .map_err(|_| CryptoError::InvalidKey)
}

/// At-rest form of the user's private key
#[derive(Clone)]
pub struct PrivKeyBlob {
    /// Format flags, currently zero
    pub flags: u32,
    /// PBKDF2 salt
    pub salt: [u8; SALT_LEN],
    /// AES-256-CTR encrypted PKCS#8 DER
    pub ciphertext: Vec<u8>,
}

impl PrivKeyBlob {
    /// Serialize to the tagged wire layout
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + SALT_LEN + self.ciphertext.len());
        out.extend_from_slice(&PRIV_KEY_TYPE_RSA4096_64BYTESALT_20000IT.to_le_bytes());
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.extend_from_slice(&self.salt);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Parse the tagged wire layout; unknown version tags are rejected
    pub fn parse(data: &[u8]) -> CryptoResult<Self> {
        if data.len() <= 8 + SALT_LEN {
            return Err(CryptoError::UnknownKeyFormat);
        }
        let key_type = u32::from_le_bytes(data[0..4].try_into().expect("sliced to width"));
        if key_type != PRIV_KEY_TYPE_RSA4096_64BYTESALT_20000IT {
            return Err(CryptoError::UnknownKeyFormat);
        }
        let flags = u32::from_le_bytes(data[4..8].try_into().expect("sliced to width"));
        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&data[8..8 + SALT_LEN]);
        Ok(Self { flags, salt, ciphertext: data[8 + SALT_LEN..].to_vec() })
    }
}

/// Wire form of the user's public key
#[derive(Clone)]
pub struct PubKeyBlob {
    /// Format flags, currently zero
    pub flags: u32,
    /// SPKI DER of the public key
    pub key: Vec<u8>,
}

impl PubKeyBlob {
    /// Serialize to the tagged wire layout
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.key.len());
        out.extend_from_slice(&PUB_KEY_TYPE_RSA4096.to_le_bytes());
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.extend_from_slice(&self.key);
        out
    }

    /// Parse the tagged wire layout; unknown version tags are rejected
    pub fn parse(data: &[u8]) -> CryptoResult<Self> {
        if data.len() <= 8 {
            return Err(CryptoError::UnknownKeyFormat);
        }
        let key_type = u32::from_le_bytes(data[0..4].try_into().expect("sliced to width"));
        if key_type != PUB_KEY_TYPE_RSA4096 {
            return Err(CryptoError::UnknownKeyFormat);
        }
        let flags = u32::from_le_bytes(data[4..8].try_into().expect("sliced to width"));
        Ok(Self { flags, key: data[8..].to_vec() })
    }
}

/// The 104-byte symmetric key bundle of one folder or file
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymKey {
    /// `SYM_FLAG_IS_DIR` for folder keys
    pub flags: u32,
    /// AES-256 key driving the CTR keystream
    pub aes_key: [u8; AES_KEY_LEN],
    /// HMAC-SHA512 key driving nonce derivation
    pub hmac_key: [u8; HMAC_KEY_LEN],
}

impl SymKey {
    /// Generate a fresh bundle with strong randomness
    pub fn generate(flags: u32) -> Self {
        let mut aes_key = [0u8; AES_KEY_LEN];
        let mut hmac_key = [0u8; HMAC_KEY_LEN];
        OsRng.fill_bytes(&mut aes_key);
        OsRng.fill_bytes(&mut hmac_key);
        Self { flags, aes_key, hmac_key }
    }

    /// Whether this is a folder key
    pub fn is_dir(&self) -> bool {
        self.flags & SYM_FLAG_IS_DIR != 0
    }

    /// Serialize to the 104-byte `sym_key_v1` layout
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SYM_KEY_LEN);
        out.extend_from_slice(&SYM_KEY_TYPE_AES256_1024BIT_HMAC.to_le_bytes());
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.extend_from_slice(&self.aes_key);
        out.extend_from_slice(&self.hmac_key);
        out
    }

    /// Parse a decrypted `sym_key_v1`; size and version tag must match
    pub fn parse(data: &[u8]) -> CryptoResult<Self> {
        if data.len() != SYM_KEY_LEN {
            tracing::warn!(expected = SYM_KEY_LEN, got = data.len(), "bad size of decrypted key");
            return Err(CryptoError::InvalidKey);
        }
        let key_type = u32::from_le_bytes(data[0..4].try_into().expect("sliced to width"));
        if key_type != SYM_KEY_TYPE_AES256_1024BIT_HMAC {
            tracing::warn!(key_type, "unknown symmetric key type");
            return Err(CryptoError::InvalidKey);
        }
        let flags = u32::from_le_bytes(data[4..8].try_into().expect("sliced to width"));
        let mut aes_key = [0u8; AES_KEY_LEN];
        let mut hmac_key = [0u8; HMAC_KEY_LEN];
        aes_key.copy_from_slice(&data[8..8 + AES_KEY_LEN]);
        hmac_key.copy_from_slice(&data[8 + AES_KEY_LEN..]);
        Ok(Self { flags, aes_key, hmac_key })
    }
}

impl std::fmt::Debug for SymKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymKey")
            .field("flags", &self.flags)
            .field("aes_key", &"[REDACTED]")
            .field("hmac_key", &"[REDACTED]")
            .finish()
    }
}

/// PBKDF2-derived material protecting the private key at rest
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct WrapperKey {
    /// AES-256 key
    pub aes: [u8; AES_KEY_LEN],
    /// CTR nonce
    pub iv: [u8; AES_BLOCK_LEN],
}

impl WrapperKey {
    /// Derive from the account password via PBKDF2-HMAC-SHA512
    pub fn derive(password: &str, salt: &[u8], iterations: u32) -> Self {
        let mut material = [0u8; AES_KEY_LEN + AES_BLOCK_LEN];
        pbkdf2::pbkdf2_hmac::<Sha512>(password.as_bytes(), salt, iterations, &mut material);
        let mut aes = [0u8; AES_KEY_LEN];
        let mut iv = [0u8; AES_BLOCK_LEN];
        aes.copy_from_slice(&material[..AES_KEY_LEN]);
        iv.copy_from_slice(&material[AES_KEY_LEN..]);
        material.zeroize();
        Self { aes, iv }
    }

    /// Run the AES-256-CTR keystream over `data` in place.
    ///
    /// CTR is an involution, so the same call encrypts and decrypts.
    pub fn crypt_in_place(&self, data: &mut [u8]) {
        use cipher::{KeyIvInit, StreamCipher};
        let mut cipher = ctr::Ctr128BE::<aes::Aes256>::new((&self.aes).into(), (&self.iv).into());
        cipher.apply_keystream(data);
    }
}

/// Draw a fresh PBKDF2 salt
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}
