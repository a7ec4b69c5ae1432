#![allow(dead_code)] // not every test binary uses every helper

//! Shared test double for the API client and content host collaborators.
//!
//! `MockRemote` keeps files, user keys and folder/file keys in memory and
//! answers the exact calls the engine makes, counting link fetches, range
//! requests and API pipeline reads so tests can assert on network traffic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use serde_json::{json, Value};

use cirrus::api::{ApiClient, ApiError, ApiParam, ApiResult, ContentHost};

const FAR_FUTURE: i64 = 4_102_444_800; // 2100-01-01

fn param_num(params: &[ApiParam], name: &str) -> Option<u64> {
    params.iter().find_map(|p| match p {
        ApiParam::Num(n, v) if *n == name => Some(*v),
        _ => None,
    })
}

fn param_str<'a>(params: &'a [ApiParam], name: &str) -> Option<&'a str> {
    params.iter().find_map(|p| match p {
        ApiParam::Str(n, v) if *n == name => Some(v.as_str()),
        _ => None,
    })
}

fn server_err(code: u64, message: &str) -> ApiError {
    ApiError::Server { code, message: message.to_owned() }
}

#[derive(Default)]
struct UserKeys {
    private: String,
    public: String,
    hint: String,
}

/// In-memory stand-in for the API servers and content hosts
#[derive(Default)]
pub struct MockRemote {
    files: Mutex<HashMap<u64, Vec<u8>>>,
    user_keys: Mutex<Option<UserKeys>>,
    folder_keys: Mutex<HashMap<u64, String>>,
    file_keys: Mutex<HashMap<u64, String>>,
    created_folders: Mutex<Vec<(u64, String)>>,
    next_folder_id: AtomicU64,
    /// `getfilelink` calls served
    pub link_requests: AtomicU64,
    /// Content-host range requests served
    pub range_requests: AtomicU64,
    /// API `readfile` pipeline calls served
    pub read_file_calls: AtomicU64,
    /// When set, content hosts answer every range with a hard error
    pub fail_content: AtomicBool,
    /// When set, the API `readfile` pipeline fails fatally
    pub fail_pipeline: AtomicBool,
    /// When set, the next range request reports a stale link (410) once
    pub stale_once: AtomicBool,
    fetched_end: Mutex<HashMap<u64, u64>>,
}

impl MockRemote {
    pub fn new() -> Self {
        let remote = Self::default();
        remote.next_folder_id.store(1000, Ordering::Relaxed);
        remote
    }

    /// Publish a file version under `hash`
    pub fn add_file(&self, hash: u64, data: Vec<u8>) {
        self.files.lock().unwrap().insert(hash, data);
    }

    /// Register a wrapped folder key (as the server would hold it)
    pub fn add_folder_key(&self, folder_id: u64, key_b64: String) {
        self.folder_keys.lock().unwrap().insert(folder_id, key_b64);
    }

    /// Furthest byte fetched for `hash` across all range requests
    pub fn fetched_end(&self, hash: u64) -> u64 {
        self.fetched_end.lock().unwrap().get(&hash).copied().unwrap_or(0)
    }

    /// `(parent_id, name)` of the most recent `createfolder` call
    pub fn last_created_folder(&self) -> Option<(u64, String)> {
        self.created_folders.lock().unwrap().last().cloned()
    }
}

impl ApiClient for MockRemote {
    fn call(&self, command: &str, params: &[ApiParam]) -> ApiResult<Value> {
        match command {
            "crypto_setuserkeys" => {
                let mut keys = self.user_keys.lock().unwrap();
                if keys.is_some() {
                    return Err(server_err(2110, "Crypto is already set up."));
                }
                *keys = Some(UserKeys {
                    private: param_str(params, "privatekey").unwrap_or_default().to_owned(),
                    public: param_str(params, "publickey").unwrap_or_default().to_owned(),
                    hint: param_str(params, "hint").unwrap_or_default().to_owned(),
                });
                Ok(json!({ "result": 0 }))
            }
            "crypto_getuserkeys" => {
                let keys = self.user_keys.lock().unwrap();
                match keys.as_ref() {
                    Some(keys) => Ok(json!({
                        "result": 0,
                        "privatekey": keys.private,
                        "publickey": keys.public,
                    })),
                    None => Err(server_err(2111, "Crypto is not set up.")),
                }
            }
            "crypto_getuserhint" => {
                let keys = self.user_keys.lock().unwrap();
                match keys.as_ref() {
                    Some(keys) if !keys.hint.is_empty() => Ok(json!({ "hint": keys.hint })),
                    Some(_) => Err(server_err(2122, "No hint is set.")),
                    None => Err(server_err(2111, "Crypto is not set up.")),
                }
            }
            "crypto_reset" => {
                *self.user_keys.lock().unwrap() = None;
                Ok(json!({ "result": 0 }))
            }
            "crypto_getfolderkey" => {
                let folder_id = param_num(params, "folderid").unwrap_or(0);
                self.folder_keys
                    .lock()
                    .unwrap()
                    .get(&folder_id)
                    .map(|key| json!({ "key": key }))
                    .ok_or_else(|| server_err(2124, "Folder is not encrypted."))
            }
            "crypto_getfilekey" => {
                let file_id = param_num(params, "fileid").unwrap_or(0);
                self.file_keys
                    .lock()
                    .unwrap()
                    .get(&file_id)
                    .map(|key| json!({ "key": key }))
                    .ok_or_else(|| server_err(2125, "File not found."))
            }
            "createfolder" => {
                let folder_id = self.next_folder_id.fetch_add(1, Ordering::Relaxed);
                if let Some(key) = param_str(params, "key") {
                    self.folder_keys.lock().unwrap().insert(folder_id, key.to_owned());
                }
                self.created_folders.lock().unwrap().push((
                    param_num(params, "folderid").unwrap_or(0),
                    param_str(params, "name").unwrap_or_default().to_owned(),
                ));
                Ok(json!({ "metadata": { "folderid": folder_id } }))
            }
            "getfilelink" => {
                let hash = param_num(params, "hash").unwrap_or(0);
                if !self.files.lock().unwrap().contains_key(&hash) {
                    return Err(server_err(2009, "File not found."));
                }
                self.link_requests.fetch_add(1, Ordering::SeqCst);
                Ok(json!({
                    "hosts": ["mock-host"],
                    "path": format!("/dl/{hash}"),
                    "expires": FAR_FUTURE,
                }))
            }
            other => Err(server_err(255, &format!("Unknown command {other}"))),
        }
    }

    fn read_file(&self, _file_id: u64, hash: u64, offset: u64, count: u64) -> ApiResult<Vec<u8>> {
        if self.fail_pipeline.load(Ordering::SeqCst) {
            return Err(server_err(5000, "Internal error."));
        }
        self.read_file_calls.fetch_add(1, Ordering::SeqCst);
        let files = self.files.lock().unwrap();
        let data = files
            .get(&hash)
            .ok_or_else(|| server_err(2009, "File not found."))?;
        let start = (offset as usize).min(data.len());
        let end = ((offset + count) as usize).min(data.len());
        Ok(data[start..end].to_vec())
    }
}

impl ContentHost for MockRemote {
    fn fetch_range(&self, _host: &str, path: &str, offset: u64, length: u64) -> ApiResult<Vec<u8>> {
        if self.stale_once.swap(false, Ordering::SeqCst) {
            return Err(server_err(410, "Link expired."));
        }
        if self.fail_content.load(Ordering::SeqCst) {
            return Err(server_err(500, "Host down."));
        }
        let hash: u64 = path
            .strip_prefix("/dl/")
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| server_err(404, "Unknown path."))?;
        let files = self.files.lock().unwrap();
        let data = files.get(&hash).ok_or_else(|| server_err(410, "Link expired."))?;
        self.range_requests.fetch_add(1, Ordering::SeqCst);
        let end = offset + length;
        let mut fetched = self.fetched_end.lock().unwrap();
        let entry = fetched.entry(hash).or_insert(0);
        *entry = (*entry).max(end.min(data.len() as u64));
        let start = (offset as usize).min(data.len());
        let stop = (end as usize).min(data.len());
        Ok(data[start..stop].to_vec())
    }
}

/// A unique scratch directory under the system temp dir
pub fn scratch_dir(name: &str) -> std::path::PathBuf {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let dir = std::env::temp_dir().join(format!("cirrus_test_{}_{}", name, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}
