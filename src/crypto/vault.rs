//! Key Vault
//!
//! Owns the user's asymmetric keypair for the duration of a session and
//! vends codec handles derived from per-folder and per-file symmetric
//! keys. The vault is constructed at login and dropped at logout;
//! `setup`/`start`/`stop` drive the key lifecycle:
//!
//! ```text
//! NOT_SETUP --setup--> SETUP_IDLE --start--> STARTED --stop--> SETUP_IDLE
//! ```
//!
//! Key resolution walks cache manager, local store, then the API, in that
//! order. Decrypted keys and initialized codecs are returned to the cache
//! manager under a short TTL when their handle drops.

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use tracing::{debug, warn};
use zeroize::Zeroize;

use super::blob::{
    generate_salt, wire_decode, wire_encode, PrivKeyBlob, PubKeyBlob, SymKey, WrapperKey,
    PBKDF2_ITERATIONS, SYM_FLAG_IS_DIR,
};
use super::codec::{KeyBundle, NameDecoder, NameEncoder, SectorCodec};
use super::{CryptoError, CryptoResult};
use crate::api::{call_with_retry, response_num, response_str, ApiClient, ApiError, ApiParam};
use crate::keycache::CacheManager;
use crate::store::{MetaStore, FS_TASK_CREAT, FS_TASK_MODIFY};

/// Settings row ids used by the vault
mod setting_ids {
    pub const SETUP: &str = "cryptosetup";
    pub const EXPIRES: &str = "cryptoexpires";
    pub const PRIVATE_KEY: &str = "crypto_private_key";
    pub const PUBLIC_KEY: &str = "crypto_public_key";
    pub const PRIVATE_SALT: &str = "crypto_private_salt";
    pub const PRIVATE_ITER: &str = "crypto_private_iter";
}

/// Cached plaintext symmetric keys live this long after release
const SYM_KEY_TTL: Duration = Duration::from_secs(600);

/// Cached codecs live this long after release
const CODEC_TTL: Duration = Duration::from_secs(60);

/// RSA key size of the user keypair
#[derive(Debug, Clone, Copy)]
pub enum RsaKeySize {
    /// 2048-bit key (test fixtures only)
    Bits2048,
    /// 4096-bit key (the production key size)
    Bits4096,
}

impl RsaKeySize {
    fn bits(&self) -> usize {
        match self {
            RsaKeySize::Bits2048 => 2048,
            RsaKeySize::Bits4096 => 4096,
        }
    }
}

struct KeyPair {
    public: RsaPublicKey,
    private: RsaPrivateKey,
}

/// RAII handle to a cached codec.
///
/// Dropping the handle re-inserts the codec into the cache manager under
/// its key prefix; codecs for temporary (negative) ids are simply dropped.
pub struct CodecHandle<T: Send + 'static> {
    inner: Option<Box<T>>,
    cache_key: Option<String>,
    cache: Arc<CacheManager>,
}

impl<T: Send + 'static> CodecHandle<T> {
    fn new(inner: Box<T>, cache_key: Option<String>, cache: Arc<CacheManager>) -> Self {
        Self { inner: Some(inner), cache_key, cache }
    }
}

impl<T: Send + 'static> Deref for CodecHandle<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.inner.as_deref().expect("present until drop")
    }
}

impl<T: Send + 'static> Drop for CodecHandle<T> {
    fn drop(&mut self) {
        if let (Some(inner), Some(key)) = (self.inner.take(), self.cache_key.take()) {
            self.cache.add(&key, inner, CODEC_TTL, None, 2);
        }
    }
}

/// Handle to a folder's filename encoder
pub type EncoderHandle = CodecHandle<NameEncoder>;
/// Handle to a folder's filename decoder
pub type DecoderHandle = CodecHandle<NameDecoder>;
/// Handle to a file's sector codec
pub type SectorCodecHandle = CodecHandle<SectorCodec>;

/// The user's key vault
pub struct KeyVault {
    api: Arc<dyn ApiClient>,
    store: Arc<MetaStore>,
    cache: Arc<CacheManager>,
    keys: RwLock<Option<KeyPair>>,
    started: AtomicBool,
    key_size: RsaKeySize,
}

impl KeyVault {
    /// Create a vault in the locked state
    pub fn new(api: Arc<dyn ApiClient>, store: Arc<MetaStore>, cache: Arc<CacheManager>) -> Self {
        Self {
            api,
            store,
            cache,
            keys: RwLock::new(None),
            started: AtomicBool::new(false),
            key_size: RsaKeySize::Bits4096,
        }
    }

    /// Override the keypair size (test fixtures)
    pub fn with_key_size(mut self, key_size: RsaKeySize) -> Self {
        self.key_size = key_size;
        self
    }

    /// Whether a key set exists for this account
    pub fn is_setup(&self) -> CryptoResult<bool> {
        Ok(self.store.setting(setting_ids::SETUP)?.is_some())
    }

    /// Whether the key set exists but its validity window has lapsed
    pub fn is_expired(&self) -> CryptoResult<bool> {
        match self.store.setting_u64(setting_ids::EXPIRES)? {
            Some(expires) if expires > 0 => Ok(expires < unix_now() as u64),
            _ => Ok(false),
        }
    }

    /// Whether the vault is unlocked
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    fn api_call(
        &self,
        command: &str,
        params: &[ApiParam],
        map_code: fn(u64) -> Option<CryptoError>,
    ) -> CryptoResult<serde_json::Value> {
        match call_with_retry(&*self.api, command, params) {
            Ok(value) => Ok(value),
            Err(ApiError::Server { code, message }) => {
                warn!(command, code, "server rejected call");
                Err(map_code(code).unwrap_or(CryptoError::Api { code, message }))
            }
            Err(other) => Err(other.into()),
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// First-time provisioning: generate the keypair, wrap the private half
    /// under the password, upload both blobs and persist them locally.
    pub fn setup(&self, password: &str, hint: &str) -> CryptoResult<()> {
        debug!("generating salt");
        let salt = generate_salt();
        debug!("generating AES key from password");
        let wrapper = WrapperKey::derive(password, &salt, PBKDF2_ITERATIONS);
        debug!(bits = self.key_size.bits(), "generating RSA key");
        let private = RsaPrivateKey::new(&mut OsRng, self.key_size.bits())
            .map_err(|e| CryptoError::Rsa(e.to_string()))?;
        let public = private.to_public_key();
        let mut priv_der = private
            .to_pkcs8_der()
            .map_err(|e| CryptoError::Rsa(e.to_string()))?
            .as_bytes()
            .to_vec();
        let pub_der = public
            .to_public_key_der()
            .map_err(|e| CryptoError::Rsa(e.to_string()))?
            .as_bytes()
            .to_vec();
        debug!("encoding private key");
        wrapper.crypt_in_place(&mut priv_der);
        let priv_blob = PrivKeyBlob { flags: 0, salt, ciphertext: priv_der };
        let pub_blob = PubKeyBlob { flags: 0, key: pub_der };

        debug!("uploading keys");
        let response = self.api_call(
            "crypto_setuserkeys",
            &[
                ApiParam::Str("privatekey", wire_encode(&priv_blob.to_bytes())),
                ApiParam::Str("publickey", wire_encode(&pub_blob.to_bytes())),
                ApiParam::Str("hint", hint.to_owned()),
            ],
            |code| match code {
                1000 => Some(CryptoError::NotLoggedIn),
                2110 => Some(CryptoError::AlreadySetup),
                _ => None,
            },
        )?;
        let expires = response_num(&response, "cryptoexpires").unwrap_or(0);
        debug!("keys uploaded");
        self.save_keys_locally(&priv_blob.ciphertext, &pub_blob.key, &priv_blob.salt, PBKDF2_ITERATIONS, expires)?;
        Ok(())
    }

    fn save_keys_locally(
        &self,
        priv_ct: &[u8],
        pub_der: &[u8],
        salt: &[u8],
        iterations: u32,
        expires: u64,
    ) -> CryptoResult<()> {
        self.store.set_setting(setting_ids::SETUP, &[1])?;
        if expires > 0 {
            self.store.set_setting_u64(setting_ids::EXPIRES, expires)?;
        }
        self.store.set_setting(setting_ids::PRIVATE_KEY, priv_ct)?;
        self.store.set_setting(setting_ids::PUBLIC_KEY, pub_der)?;
        self.store.set_setting(setting_ids::PRIVATE_SALT, salt)?;
        self.store.set_setting_u64(setting_ids::PRIVATE_ITER, iterations as u64)?;
        Ok(())
    }

    fn download_keys(&self) -> CryptoResult<(Vec<u8>, Vec<u8>, Vec<u8>, u32)> {
        debug!("downloading keys");
        let response = self.api_call("crypto_getuserkeys", &[], |code| match code {
            1000 => Some(CryptoError::NotLoggedIn),
            2111 => Some(CryptoError::NotSetup),
            _ => None,
        })?;
        let priv_raw = wire_decode(response_str(&response, "privatekey")?)
            .map_err(|_| CryptoError::UnknownKeyFormat)?;
        let pub_raw = wire_decode(response_str(&response, "publickey")?)
            .map_err(|_| CryptoError::UnknownKeyFormat)?;
        let pub_blob = PubKeyBlob::parse(&pub_raw)?;
        let priv_blob = PrivKeyBlob::parse(&priv_raw)?;
        debug!("downloaded keys");
        Ok((priv_blob.ciphertext, pub_blob.key, priv_blob.salt.to_vec(), PBKDF2_ITERATIONS))
    }

    /// Per-session unlock: load or download the blobs, unwrap the private
    /// key under `password` and verify the pair matches.
    pub fn start(&self, password: &str) -> CryptoResult<()> {
        let mut keys_guard = self.keys.write();
        if keys_guard.is_some() {
            return Err(CryptoError::AlreadyStarted);
        }
        if self.is_expired()? {
            return Err(CryptoError::SetupExpired);
        }

        // The metadata store locks internally, so loading under the write
        // lock cannot deadlock the way the SQL engine's global lock could.
        let local = (
            self.store.setting(setting_ids::PRIVATE_KEY)?,
            self.store.setting(setting_ids::PUBLIC_KEY)?,
            self.store.setting(setting_ids::PRIVATE_SALT)?,
            self.store.setting_u64(setting_ids::PRIVATE_ITER)?,
        );
        let (priv_ct, pub_der, salt, iterations, downloaded) = match local {
            (Some(ct), Some(der), Some(salt), Some(iter)) => {
                debug!("got keys from the local store");
                (ct, der, salt, iter as u32, false)
            }
            (None, None, None, None) => {
                let (ct, der, salt, iter) = self.download_keys()?;
                (ct, der, salt, iter, true)
            }
            _ => {
                warn!("only some key records found locally, redownloading");
                let (ct, der, salt, iter) = self.download_keys()?;
                (ct, der, salt, iter, true)
            }
        };

        let public = RsaPublicKey::from_public_key_der(&pub_der)
            .map_err(|_| CryptoError::UnknownKeyFormat)?;
        let wrapper = WrapperKey::derive(password, &salt, iterations);
        let mut priv_der = priv_ct.clone();
        wrapper.crypt_in_place(&mut priv_der);
        let parsed = RsaPrivateKey::from_pkcs8_der(&priv_der);
        priv_der.zeroize();
        let private = match parsed {
            Ok(key) => key,
            Err(_) => {
                debug!("bad password");
                return Err(CryptoError::BadPassword);
            }
        };
        if !keys_match(&public, &private) {
            warn!("keys don't match");
            return Err(CryptoError::KeysDontMatch);
        }
        *keys_guard = Some(KeyPair { public, private });
        self.started.store(true, Ordering::Release);
        drop(keys_guard);
        if downloaded {
            self.save_keys_locally(&priv_ct, &pub_der, &salt, iterations, 0)?;
        }
        debug!("crypto successfully started");
        Ok(())
    }

    /// Lock the vault. Idempotent; zeroes all private material and retires
    /// every cached plaintext key and codec.
    pub fn stop(&self) {
        self.started.store(false, Ordering::Release);
        let mut keys_guard = self.keys.write();
        *keys_guard = None; // private key material zeroizes on drop
        drop(keys_guard);
        self.cache.clean_all();
        debug!("stopped crypto");
    }

    /// Download the password hint
    pub fn get_hint(&self) -> CryptoResult<String> {
        let response = self.api_call("crypto_getuserhint", &[], |code| match code {
            1000 => Some(CryptoError::NotLoggedIn),
            2122 => Some(CryptoError::HintNotProvided),
            _ => None,
        })?;
        Ok(response_str(&response, "hint")?.to_owned())
    }

    /// Request server-side destruction of the account's key set.
    ///
    /// Does not require the vault to be stopped first.
    pub fn reset(&self) -> CryptoResult<()> {
        if !self.is_setup()? {
            return Err(CryptoError::NotSetup);
        }
        debug!("resetting crypto");
        self.api_call("crypto_reset", &[], |code| match code {
            2000 => Some(CryptoError::NotLoggedIn),
            2111 => Some(CryptoError::NotSetup),
            _ => None,
        })?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Wrapped-key resolution
    // ------------------------------------------------------------------

    fn download_folder_key(&self, folder_id: u64) -> CryptoResult<Vec<u8>> {
        debug!(folder_id, "downloading folder key");
        let response = self.api_call(
            "crypto_getfolderkey",
            &[ApiParam::Num("folderid", folder_id)],
            |code| match code {
                2124 => Some(CryptoError::FolderNotEncrypted),
                _ => None,
            },
        )?;
        let enc_key = wire_decode(response_str(&response, "key")?)?;
        self.store.set_folder_key(folder_id, &enc_key)?;
        Ok(enc_key)
    }

    fn download_file_key(&self, file_id: u64) -> CryptoResult<Vec<u8>> {
        debug!(file_id, "downloading file key");
        let response = self.api_call(
            "crypto_getfilekey",
            &[ApiParam::Num("fileid", file_id)],
            |_| None,
        )?;
        let enc_key = wire_decode(response_str(&response, "key")?)?;
        self.store.set_file_key(file_id, &enc_key)?;
        Ok(enc_key)
    }

    fn decrypt_sym_key(&self, keys: &KeyPair, enc_key: &[u8]) -> CryptoResult<SymKey> {
        let mut raw = keys
            .private
            .decrypt(Oaep::new::<Sha256>(), enc_key)
            .map_err(|_| CryptoError::InvalidKey)?;
        let parsed = SymKey::parse(&raw);
        raw.zeroize();
        parsed
    }

    fn folder_sym_key(&self, keys: &KeyPair, folder_id: u64) -> CryptoResult<Box<SymKey>> {
        let cache_key = format!("FKEY{folder_id}");
        if let Some(sym) = self.cache.get_as::<SymKey>(&cache_key) {
            return Ok(sym);
        }
        let enc_key = match self.store.folder_key(folder_id)? {
            Some(enc_key) => enc_key,
            None => self.download_folder_key(folder_id)?,
        };
        Ok(Box::new(self.decrypt_sym_key(keys, &enc_key)?))
    }

    fn file_sym_key(&self, keys: &KeyPair, file_id: u64) -> CryptoResult<Box<SymKey>> {
        let cache_key = format!("DKEY{file_id}");
        if let Some(sym) = self.cache.get_as::<SymKey>(&cache_key) {
            return Ok(sym);
        }
        let enc_key = match self.store.file_key(file_id)? {
            Some(enc_key) => enc_key,
            None => self.download_file_key(file_id)?,
        };
        Ok(Box::new(self.decrypt_sym_key(keys, &enc_key)?))
    }

    fn release_sym_key(&self, prefix: &str, id: u64, sym: Box<SymKey>) {
        self.cache.add(&format!("{prefix}{id}"), sym, SYM_KEY_TTL, None, 2);
    }

    /// Resolve an uploaded folder's key bundle; requires `IS_DIR` set
    fn folder_bundle(&self, keys: &KeyPair, folder_id: u64) -> CryptoResult<KeyBundle> {
        let sym = self.folder_sym_key(keys, folder_id)?;
        if !sym.is_dir() {
            warn!(folder_id, "file key found where a folder key was expected");
            return Err(CryptoError::InvalidKey);
        }
        let bundle = KeyBundle::from_sym_key(&sym);
        self.release_sym_key("FKEY", folder_id, sym);
        Ok(bundle)
    }

    /// Resolve an uploaded file's key bundle; requires `IS_DIR` clear
    fn file_bundle(&self, keys: &KeyPair, file_id: u64) -> CryptoResult<KeyBundle> {
        let sym = self.file_sym_key(keys, file_id)?;
        if sym.is_dir() {
            warn!(file_id, "folder key found where a file key was expected");
            return Err(CryptoError::InvalidKey);
        }
        let bundle = KeyBundle::from_sym_key(&sym);
        self.release_sym_key("DKEY", file_id, sym);
        Ok(bundle)
    }

    /// Resolve a staging row's key bundle; `want_dir` enforces the flag
    fn staging_bundle(&self, keys: &KeyPair, temp_id: i64, want_dir: bool) -> CryptoResult<KeyBundle> {
        let task_id = temp_id.unsigned_abs();
        let row = match self.store.fs_task(task_id)? {
            Some(row) => row,
            None if want_dir => return Err(CryptoError::FolderNotFound),
            None => return Err(CryptoError::FileNotFound),
        };
        match row.kind {
            FS_TASK_CREAT => {
                let key_b64 = row.key_b64.ok_or(CryptoError::FolderNotEncrypted)?;
                let enc_key = wire_decode(&key_b64)?;
                let sym = self.decrypt_sym_key(keys, &enc_key)?;
                if sym.is_dir() != want_dir {
                    warn!(temp_id, "staging key flag does not match object kind");
                    return Err(CryptoError::InvalidKey);
                }
                Ok(KeyBundle::from_sym_key(&sym))
            }
            // A modification re-uses the uploaded file's key.
            FS_TASK_MODIFY if !want_dir => self.file_bundle(keys, row.file_id),
            _ => Err(CryptoError::InvalidKey),
        }
    }

    // ------------------------------------------------------------------
    // Codec getters
    // ------------------------------------------------------------------

    fn with_keys<T>(&self, f: impl FnOnce(&KeyPair) -> CryptoResult<T>) -> CryptoResult<T> {
        let guard = self.keys.read();
        match guard.as_ref() {
            Some(keys) => f(keys),
            None => Err(CryptoError::NotStarted),
        }
    }

    /// Vend the filename encoder of a folder
    pub fn get_folder_encoder(&self, folder_id: i64) -> CryptoResult<EncoderHandle> {
        if !self.is_started() {
            return Err(CryptoError::NotStarted);
        }
        let cache_key = (folder_id >= 0).then(|| format!("FLDE{folder_id}"));
        if let Some(key) = &cache_key {
            if let Some(enc) = self.cache.get_as::<NameEncoder>(key) {
                return Ok(CodecHandle::new(enc, cache_key, self.cache.clone()));
            }
        }
        let bundle = self.with_keys(|keys| match folder_id {
            id if id > 0 => self.folder_bundle(keys, id as u64),
            id if id < 0 => self.staging_bundle(keys, id, true),
            _ => Err(CryptoError::FolderNotEncrypted),
        })?;
        Ok(CodecHandle::new(Box::new(NameEncoder::new(bundle)), cache_key, self.cache.clone()))
    }

    /// Vend the filename decoder of a folder
    pub fn get_folder_decoder(&self, folder_id: i64) -> CryptoResult<DecoderHandle> {
        if !self.is_started() {
            return Err(CryptoError::NotStarted);
        }
        let cache_key = (folder_id >= 0).then(|| format!("FLDD{folder_id}"));
        if let Some(key) = &cache_key {
            if let Some(dec) = self.cache.get_as::<NameDecoder>(key) {
                return Ok(CodecHandle::new(dec, cache_key, self.cache.clone()));
            }
        }
        let bundle = self.with_keys(|keys| match folder_id {
            id if id > 0 => self.folder_bundle(keys, id as u64),
            id if id < 0 => self.staging_bundle(keys, id, true),
            _ => Err(CryptoError::FolderNotEncrypted),
        })?;
        Ok(CodecHandle::new(Box::new(NameDecoder::new(bundle)), cache_key, self.cache.clone()))
    }

    /// Vend the sector codec of a file
    pub fn get_file_sector_codec(&self, file_id: i64) -> CryptoResult<SectorCodecHandle> {
        if !self.is_started() {
            return Err(CryptoError::NotStarted);
        }
        let cache_key = (file_id >= 0).then(|| format!("SEEN{file_id}"));
        if let Some(key) = &cache_key {
            if let Some(codec) = self.cache.get_as::<SectorCodec>(key) {
                return Ok(CodecHandle::new(codec, cache_key, self.cache.clone()));
            }
        }
        let bundle = self.with_keys(|keys| match file_id {
            id if id > 0 => self.file_bundle(keys, id as u64),
            id if id < 0 => self.staging_bundle(keys, id, false),
            _ => Err(CryptoError::FolderNotEncrypted),
        })?;
        Ok(CodecHandle::new(Box::new(SectorCodec::new(bundle)), cache_key, self.cache.clone()))
    }

    /// Build a file's sector codec from a response that carries its
    /// wrapped key (file creation returns one); persists the key binding.
    pub fn file_codec_from_key_response(
        &self,
        file_id: u64,
        response: &serde_json::Value,
    ) -> CryptoResult<SectorCodecHandle> {
        let enc_key = wire_decode(response_str(response, "key").map_err(|_| CryptoError::InvalidKey)?)?;
        self.store.set_file_key(file_id, &enc_key)?;
        self.get_file_sector_codec(file_id as i64)
    }

    // ------------------------------------------------------------------
    // Name translation and folder creation
    // ------------------------------------------------------------------

    /// Encode a child name for storage under `folder_id`
    pub fn encode_name(&self, folder_id: i64, name: &str) -> CryptoResult<String> {
        let encoder = self.get_folder_encoder(folder_id)?;
        Ok(encoder.encode(name))
    }

    /// Decode a stored child name of `folder_id`
    pub fn decode_name(&self, folder_id: i64, encoded: &str) -> CryptoResult<String> {
        let decoder = self.get_folder_decoder(folder_id)?;
        decoder.decode(encoded)
    }

    /// Create an encrypted folder under `parent_id` and return its id.
    ///
    /// The child name is translated with the parent's encoder; the root
    /// (id 0) and unencrypted parents store child names in the clear.
    pub fn mkdir(&self, parent_id: u64, name: &str) -> CryptoResult<u64> {
        if !self.is_started() {
            return Err(CryptoError::NotStarted);
        }
        let mut sym = SymKey::generate(SYM_FLAG_IS_DIR);
        let enc_sym = self.with_keys(|keys| wrap_sym_key(keys, &sym))?;
        sym.zeroize();
        let encoded_name = if parent_id == 0 {
            name.to_owned()
        } else {
            match self.encode_name(parent_id as i64, name) {
                Ok(encoded) => encoded,
                // A plain parent has no key; its child names stay plain.
                Err(CryptoError::FolderNotEncrypted) => name.to_owned(),
                Err(err) => return Err(err),
            }
        };
        let response = self.api_call(
            "createfolder",
            &[
                ApiParam::Num("folderid", parent_id),
                ApiParam::Str("name", encoded_name),
                ApiParam::Bool("encrypted", true),
                ApiParam::Str("key", wire_encode(&enc_sym)),
            ],
            |_| None,
        )?;
        let meta = response
            .get("metadata")
            .ok_or(CryptoError::Api { code: 0, message: "createfolder response without metadata".into() })?;
        let folder_id = response_num(meta, "folderid")?;
        self.store.set_folder_key(folder_id, &enc_sym)?;
        debug!(folder_id, "created encrypted folder");
        Ok(folder_id)
    }

    // ------------------------------------------------------------------
    // Wrapped-key helpers for the sync engine
    // ------------------------------------------------------------------

    /// Generate a fresh wrapped key, base64 wire form
    pub fn new_wrapped_key(&self, flags: u32) -> CryptoResult<String> {
        if !self.is_started() {
            return Err(CryptoError::NotStarted);
        }
        let mut sym = SymKey::generate(flags);
        let enc_sym = self.with_keys(|keys| wrap_sym_key(keys, &sym))?;
        sym.zeroize();
        Ok(wire_encode(&enc_sym))
    }

    /// Generate a fresh wrapped key and also return the plaintext bundle
    pub fn new_wrapped_key_with_plain(&self, flags: u32) -> CryptoResult<(String, KeyBundle)> {
        if !self.is_started() {
            return Err(CryptoError::NotStarted);
        }
        let mut sym = SymKey::generate(flags);
        let enc_sym = self.with_keys(|keys| wrap_sym_key(keys, &sym))?;
        let bundle = KeyBundle::from_sym_key(&sym);
        sym.zeroize();
        Ok((wire_encode(&enc_sym), bundle))
    }

    /// Wire form of an uploaded file's wrapped key
    pub fn file_wrapped_key(&self, file_id: i64) -> CryptoResult<String> {
        if file_id < 0 {
            return Err(CryptoError::FileNotFound);
        }
        let enc_key = match self.store.file_key(file_id as u64)? {
            Some(enc_key) => enc_key,
            None => self.download_file_key(file_id as u64)?,
        };
        Ok(wire_encode(&enc_key))
    }
}

fn wrap_sym_key(keys: &KeyPair, sym: &SymKey) -> CryptoResult<Vec<u8>> {
    let mut plain = sym.to_bytes();
    let wrapped = keys
        .public
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), &plain)
        .map_err(|e| CryptoError::Rsa(e.to_string()));
    plain.zeroize();
    wrapped
}

fn keys_match(public: &RsaPublicKey, private: &RsaPrivateKey) -> bool {
    debug!("trying encrypt/decrypt operation with loaded keys");
    let mut probe = [0u8; 64];
    OsRng.fill_bytes(&mut probe);
    let Ok(wrapped) = public.encrypt(&mut OsRng, Oaep::new::<Sha256>(), &probe) else {
        return false;
    };
    let Ok(unwrapped) = private.decrypt(Oaep::new::<Sha256>(), &wrapped) else {
        return false;
    };
    unwrapped == probe
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rsa_key_size_bits() {
        assert_eq!(RsaKeySize::Bits2048.bits(), 2048);
        assert_eq!(RsaKeySize::Bits4096.bits(), 4096);
    }

    #[test]
    fn test_keys_match_detects_mismatch() {
        let a = RsaPrivateKey::new(&mut OsRng, 2048).unwrap();
        let b = RsaPrivateKey::new(&mut OsRng, 2048).unwrap();
        assert!(keys_match(&a.to_public_key(), &a));
        assert!(!keys_match(&a.to_public_key(), &b));
    }
}
