// Integration tests for the key vault lifecycle and key derivation

mod common;

use std::sync::Arc;

use cirrus::api::ApiClient;
use cirrus::crypto::blob::{wire_decode, SYM_FLAG_IS_DIR};
use cirrus::crypto::vault::{KeyVault, RsaKeySize};
use cirrus::crypto::CryptoError;
use cirrus::keycache::CacheManager;
use cirrus::store::{FsTaskRow, MetaStore, FS_TASK_CREAT};

use common::{scratch_dir, MockRemote};

const PASSWORD: &str = "correct horse battery staple";

fn new_vault(
    remote: &Arc<MockRemote>,
    dir: &std::path::Path,
) -> (KeyVault, Arc<MetaStore>, Arc<CacheManager>) {
    let store = Arc::new(MetaStore::open(&dir.join("meta")).unwrap());
    let cache = Arc::new(CacheManager::new());
    let api: Arc<dyn ApiClient> = remote.clone();
    let vault =
        KeyVault::new(api, store.clone(), cache.clone()).with_key_size(RsaKeySize::Bits2048);
    (vault, store, cache)
}

#[test]
fn test_setup_start_stop_roundtrip_with_same_password() {
    let remote = Arc::new(MockRemote::new());
    let dir = scratch_dir("vault_roundtrip");
    let (vault, store, _cache) = new_vault(&remote, &dir);

    vault.setup(PASSWORD, "my hint").unwrap();
    assert!(vault.is_setup().unwrap());
    vault.start(PASSWORD).unwrap();
    assert!(vault.is_started());

    // Bind a folder key and remember a name encoded under it.
    let wrapped = vault.new_wrapped_key(SYM_FLAG_IS_DIR).unwrap();
    store.set_folder_key(5, &wire_decode(&wrapped).unwrap()).unwrap();
    let encoded = vault.encode_name(5, "quarterly-report.pdf").unwrap();

    vault.stop();
    assert!(!vault.is_started());
    assert!(matches!(vault.encode_name(5, "x"), Err(CryptoError::NotStarted)));

    // The same password unlocks the same keypair.
    vault.start(PASSWORD).unwrap();
    assert_eq!(vault.decode_name(5, &encoded).unwrap(), "quarterly-report.pdf");

    vault.stop();
    std::fs::remove_dir_all(dir).unwrap();
}

#[test]
fn test_wrong_password_is_rejected() {
    let remote = Arc::new(MockRemote::new());
    let dir = scratch_dir("vault_badpass");
    let (vault, _store, _cache) = new_vault(&remote, &dir);

    vault.setup(PASSWORD, "").unwrap();
    let err = vault.start("correct horse battery stable").unwrap_err();
    assert!(matches!(err, CryptoError::BadPassword));
    assert!(!vault.is_started());
    // The right password still works afterwards.
    vault.start(PASSWORD).unwrap();
    vault.stop();
    std::fs::remove_dir_all(dir).unwrap();
}

#[test]
fn test_filename_roundtrip_through_created_folder() {
    let remote = Arc::new(MockRemote::new());
    let dir = scratch_dir("vault_names");
    let (vault, _store, cache) = new_vault(&remote, &dir);

    vault.setup(PASSWORD, "").unwrap();
    vault.start(PASSWORD).unwrap();

    let folder_id = vault.mkdir(0, "Documents").unwrap();
    let encoded = vault.encode_name(folder_id as i64, "report.pdf").unwrap();
    assert_ne!(encoded, "report.pdf");
    assert!(encoded.chars().all(|c| c.is_ascii_alphanumeric()));

    // Force the decoder to be rebuilt from the wrapped key.
    cache.clean_all();
    assert_eq!(vault.decode_name(folder_id as i64, &encoded).unwrap(), "report.pdf");

    vault.stop();
    std::fs::remove_dir_all(dir).unwrap();
}

#[test]
fn test_mkdir_encodes_name_only_under_encrypted_parent() {
    let remote = Arc::new(MockRemote::new());
    let dir = scratch_dir("vault_mkdir_parent");
    let (vault, _store, _cache) = new_vault(&remote, &dir);

    vault.setup(PASSWORD, "").unwrap();
    vault.start(PASSWORD).unwrap();

    // A child of an encrypted parent goes up under its ciphertext name.
    let enc_parent = vault.mkdir(0, "Vault").unwrap();
    vault.mkdir(enc_parent, "Secret Child").unwrap();
    let (parent, sent_name) = remote.last_created_folder().unwrap();
    assert_eq!(parent, enc_parent);
    assert_ne!(sent_name, "Secret Child");
    assert_eq!(vault.decode_name(enc_parent as i64, &sent_name).unwrap(), "Secret Child");

    // A plain (unkeyed) parent passes the child name through unencoded.
    vault.mkdir(500, "Plain Child").unwrap();
    assert_eq!(remote.last_created_folder().unwrap(), (500, "Plain Child".to_owned()));

    vault.stop();
    std::fs::remove_dir_all(dir).unwrap();
}

#[test]
fn test_second_device_downloads_keys() {
    let remote = Arc::new(MockRemote::new());
    let dir_a = scratch_dir("vault_dev_a");
    let dir_b = scratch_dir("vault_dev_b");

    let (vault_a, store_a, _) = new_vault(&remote, &dir_a);
    vault_a.setup(PASSWORD, "").unwrap();
    vault_a.start(PASSWORD).unwrap();
    let wrapped = vault_a.new_wrapped_key(SYM_FLAG_IS_DIR).unwrap();
    store_a.set_folder_key(8, &wire_decode(&wrapped).unwrap()).unwrap();
    remote.add_folder_key(8, wrapped);
    let encoded = vault_a.encode_name(8, "shared.txt").unwrap();
    vault_a.stop();

    // A fresh store has no local records; start() downloads the blobs and
    // the folder key comes over the API on first use.
    let (vault_b, _, _) = new_vault(&remote, &dir_b);
    vault_b.start(PASSWORD).unwrap();
    assert_eq!(vault_b.decode_name(8, &encoded).unwrap(), "shared.txt");
    vault_b.stop();

    std::fs::remove_dir_all(dir_a).unwrap();
    std::fs::remove_dir_all(dir_b).unwrap();
}

#[test]
fn test_start_twice_and_idempotent_stop() {
    let remote = Arc::new(MockRemote::new());
    let dir = scratch_dir("vault_states");
    let (vault, _, _) = new_vault(&remote, &dir);

    assert!(matches!(vault.start(PASSWORD), Err(CryptoError::NotSetup)));
    vault.setup(PASSWORD, "").unwrap();
    assert!(matches!(vault.setup(PASSWORD, ""), Err(CryptoError::AlreadySetup)));
    vault.start(PASSWORD).unwrap();
    assert!(matches!(vault.start(PASSWORD), Err(CryptoError::AlreadyStarted)));
    vault.stop();
    vault.stop(); // idempotent
    std::fs::remove_dir_all(dir).unwrap();
}

#[test]
fn test_folder_key_flag_enforced_both_ways() {
    let remote = Arc::new(MockRemote::new());
    let dir = scratch_dir("vault_flags");
    let (vault, store, _) = new_vault(&remote, &dir);

    vault.setup(PASSWORD, "").unwrap();
    vault.start(PASSWORD).unwrap();

    // A folder key bound to a file id must be rejected...
    let dir_key = vault.new_wrapped_key(SYM_FLAG_IS_DIR).unwrap();
    store.set_file_key(9, &wire_decode(&dir_key).unwrap()).unwrap();
    assert!(matches!(vault.get_file_sector_codec(9), Err(CryptoError::InvalidKey)));

    // ...and a file key bound to a folder id likewise.
    let file_key = vault.new_wrapped_key(0).unwrap();
    store.set_folder_key(9, &wire_decode(&file_key).unwrap()).unwrap();
    assert!(matches!(vault.get_folder_encoder(9), Err(CryptoError::InvalidKey)));

    vault.stop();
    std::fs::remove_dir_all(dir).unwrap();
}

#[test]
fn test_temporary_ids_resolve_through_staging_rows() {
    let remote = Arc::new(MockRemote::new());
    let dir = scratch_dir("vault_temp");
    let (vault, store, _) = new_vault(&remote, &dir);

    vault.setup(PASSWORD, "").unwrap();
    vault.start(PASSWORD).unwrap();

    let wrapped = vault.new_wrapped_key(SYM_FLAG_IS_DIR).unwrap();
    store
        .set_fs_task(3, &FsTaskRow { kind: FS_TASK_CREAT, file_id: 0, key_b64: Some(wrapped) })
        .unwrap();

    let encoder = vault.get_folder_encoder(-3).unwrap();
    let decoder = vault.get_folder_decoder(-3).unwrap();
    assert_eq!(decoder.decode(&encoder.encode("draft.txt")).unwrap(), "draft.txt");
    drop(encoder);
    drop(decoder);

    assert!(matches!(vault.get_folder_encoder(-4), Err(CryptoError::FolderNotFound)));

    vault.stop();
    std::fs::remove_dir_all(dir).unwrap();
}

#[test]
fn test_sector_codec_roundtrip_for_file_key() {
    let remote = Arc::new(MockRemote::new());
    let dir = scratch_dir("vault_sector");
    let (vault, store, _) = new_vault(&remote, &dir);

    vault.setup(PASSWORD, "").unwrap();
    vault.start(PASSWORD).unwrap();

    let wrapped = vault.new_wrapped_key(0).unwrap();
    store.set_file_key(42, &wire_decode(&wrapped).unwrap()).unwrap();

    let codec = vault.get_file_sector_codec(42).unwrap();
    let mut sector = vec![0x5Au8; 4096];
    codec.encode_sector(&mut sector, 7);
    assert_ne!(sector, vec![0x5Au8; 4096]);
    codec.decode_sector(&mut sector, 7);
    assert_eq!(sector, vec![0x5Au8; 4096]);

    drop(codec);
    vault.stop();
    std::fs::remove_dir_all(dir).unwrap();
}

#[test]
fn test_hint_and_reset() {
    let remote = Arc::new(MockRemote::new());
    let dir = scratch_dir("vault_hint");
    let (vault, _, _) = new_vault(&remote, &dir);

    assert!(matches!(vault.reset(), Err(CryptoError::NotSetup)));
    vault.setup(PASSWORD, "favorite xkcd").unwrap();
    assert_eq!(vault.get_hint().unwrap(), "favorite xkcd");
    // Reset does not require crypto to be stopped.
    vault.start(PASSWORD).unwrap();
    vault.reset().unwrap();
    vault.stop();
    std::fs::remove_dir_all(dir).unwrap();
}
