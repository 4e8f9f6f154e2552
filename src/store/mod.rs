//! Auth/KV domain layer: combines the sharded maps, quota tracking, MRU
//! listing, persistence log, and function table into the single `Store`
//! that the session layer drives.

pub mod mru;
pub mod persistence;
pub mod quota;
pub mod sharded_map;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn};
use thiserror::Error;

use crate::config::{LEN_CONTENT, LEN_PASS, LEN_UNAME};
use crate::mapreduce::{FunctionTable, MapReduceError};
use mru::MruManager;
use persistence::{PersistenceError, PersistenceLog, ReplayRecord};
use quota::QuotaTracker;
use sharded_map::ShardedMap;

/// One user's auth-table entry.
#[derive(Clone)]
struct AuthEntry {
    pass_hash: Vec<u8>,
    content: Vec<u8>,
}

/// A user's three sliding-window quota trackers.
struct Quotas {
    uploads: QuotaTracker,
    downloads: QuotaTracker,
    requests: QuotaTracker,
}

/// Errors raised by `Store` operations, mapped 1:1 onto the wire's response
/// tokens by the session dispatcher.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The named user does not exist, or the password did not verify.
    /// Deliberately not split into "no such user" vs. "wrong password" to
    /// avoid username enumeration.
    #[error("authentication failed")]
    Login,

    /// `add_user` on a username that is already registered.
    #[error("user already exists")]
    UserExists,

    /// Lookup target user does not exist.
    #[error("no such user")]
    NoUser,

    /// Lookup target user exists but has no content.
    #[error("no data for user")]
    NoData,

    /// `kv_insert` on a key that is already present.
    #[error("key already exists")]
    KeyExists,

    /// `kv_get`/`kv_delete` on a key that is absent.
    #[error("no such key")]
    KeyMissing,

    /// The request-count sliding window would be exceeded.
    #[error("request quota exceeded")]
    QuotaRequests,

    /// The upload sliding window would be exceeded.
    #[error("upload quota exceeded")]
    QuotaUpload,

    /// The download sliding window would be exceeded.
    #[error("download quota exceeded")]
    QuotaDownload,

    /// `register_mr` by a non-admin user.
    #[error("admin privilege required")]
    NotAdmin,

    /// A username, password, or content/value field exceeded its bound.
    #[error("{field} exceeds the maximum length of {max} bytes")]
    InvalidLength {
        /// The field that was too long.
        field: &'static str,
        /// The bound it exceeded.
        max: usize,
    },

    /// A map/reduce operation failed.
    #[error(transparent)]
    MapReduce(#[from] MapReduceError),

    /// The persistence layer failed to append or replay a record.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    /// A password-hashing operation failed.
    #[error(transparent)]
    Crypto(#[from] crate::crypto::CryptoError),
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Outcome of [`Store::kv_upsert`], distinguishing insert from update so the
/// session layer can reply `OK_INSERT` vs. `OK_UPDATE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// The key was newly created.
    Inserted,
    /// An existing key's value was replaced.
    Updated,
}

/// The process-wide authenticated key/value store.
pub struct Store {
    auth_table: ShardedMap<String, AuthEntry>,
    kv_store: ShardedMap<String, Vec<u8>>,
    quota_table: ShardedMap<String, Arc<Quotas>>,
    mru: MruManager,
    funcs: FunctionTable,
    log: PersistenceLog,
    data_file: PathBuf,
    admin_name: String,
    up_quota: u64,
    down_quota: u64,
    req_quota: u64,
    quota_duration: u64,
}

impl Store {
    /// Open (or create) `data_file`, replaying any existing log, and return
    /// a ready-to-use store.
    pub fn open(
        data_file: &Path,
        num_buckets: usize,
        up_quota: u64,
        down_quota: u64,
        req_quota: u64,
        quota_duration: u64,
        mru_capacity: usize,
        admin_name: String,
    ) -> StoreResult<Self> {
        let auth_table = ShardedMap::new(num_buckets);
        let kv_store = ShardedMap::new(num_buckets);
        let quota_table: ShardedMap<String, Arc<Quotas>> = ShardedMap::new(num_buckets);

        info!("replaying persistence log from {}", data_file.display());
        let mut replayed_users = 0usize;
        let mut replayed_kvs = 0usize;
        persistence::replay(data_file, |record| {
            match record {
                ReplayRecord::AuthSnapshot(user, hash, content) => {
                    quota_table.insert(
                        user.clone(),
                        Arc::new(Quotas {
                            uploads: QuotaTracker::new(up_quota, quota_duration),
                            downloads: QuotaTracker::new(down_quota, quota_duration),
                            requests: QuotaTracker::new(req_quota, quota_duration),
                        }),
                        |_, _| {},
                    );
                    auth_table.insert(user, AuthEntry { pass_hash: hash, content }, |_, _| {});
                    replayed_users += 1;
                }
                ReplayRecord::KvSnapshot(key, value) => {
                    kv_store.insert(key, value, |_, _| {});
                    replayed_kvs += 1;
                }
                ReplayRecord::AuthDiff(user, content) => {
                    let found = auth_table.do_with(&user, |entry| entry.content = content);
                    if found.is_none() {
                        return Err(PersistenceError::UnknownKeyInReplay(user));
                    }
                }
                ReplayRecord::KvUpdate(key, value) => {
                    kv_store.upsert(key, value, |_, _| {}, |_, _| {});
                }
                ReplayRecord::KvDelete(key) => {
                    let removed = kv_store.remove(&key, |_, _| {});
                    if !removed {
                        return Err(PersistenceError::UnknownKeyInReplay(key));
                    }
                }
            }
            Ok(())
        })?;
        info!("replay complete: {replayed_users} users, {replayed_kvs} keys");

        let log = PersistenceLog::open(data_file)?;

        Ok(Self {
            auth_table,
            kv_store,
            quota_table,
            mru: MruManager::new(mru_capacity),
            funcs: FunctionTable::new(),
            log,
            data_file: data_file.to_path_buf(),
            admin_name,
            up_quota,
            down_quota,
            req_quota,
            quota_duration,
        })
    }

    fn check_len(field: &'static str, len: usize, max: usize) -> StoreResult<()> {
        if len > max {
            Err(StoreError::InvalidLength { field, max })
        } else {
            Ok(())
        }
    }

    fn quotas_for(&self, user: &str) -> Option<Arc<Quotas>> {
        self.quota_table.do_with_readonly(&user.to_string(), |q| q.clone())
    }

    /// Verify a user exists and their password matches. Errors are
    /// deliberately uniform (`StoreError::Login`) for both "no such user"
    /// and "wrong password", to avoid leaking which case occurred.
    fn authenticate(&self, user: &str, pass: &str) -> StoreResult<()> {
        let hash = self
            .auth_table
            .do_with_readonly(&user.to_string(), |entry| entry.pass_hash.clone())
            .ok_or(StoreError::Login)?;
        let matches = crate::crypto::kdf::verify_password(pass.as_bytes(), &hash)
            .map_err(crate::crypto::CryptoError::from)?;
        if matches {
            Ok(())
        } else {
            Err(StoreError::Login)
        }
    }

    /// Increment the per-user request counter unconditionally, returning an
    /// error if doing so exceeds the request quota. Matches the source's
    /// behavior of always charging a request even when the request itself
    /// is about to be rejected.
    fn charge_request(&self, user: &str) -> StoreResult<()> {
        let quotas = self.quotas_for(user).expect("authenticated user always has a quota entry");
        let allowed = quotas.requests.check(1);
        quotas.requests.add(1);
        if allowed {
            Ok(())
        } else {
            warn!("request quota exceeded for {user}");
            Err(StoreError::QuotaRequests)
        }
    }

    fn check_upload(&self, user: &str, amount: u64) -> StoreResult<()> {
        let quotas = self.quotas_for(user).expect("authenticated user always has a quota entry");
        if quotas.uploads.check(amount) {
            Ok(())
        } else {
            warn!("upload quota exceeded for {user}");
            Err(StoreError::QuotaUpload)
        }
    }

    fn record_upload(&self, user: &str, amount: u64) {
        if let Some(quotas) = self.quotas_for(user) {
            quotas.uploads.add(amount);
        }
    }

    fn check_download(&self, user: &str, amount: u64) -> StoreResult<()> {
        let quotas = self.quotas_for(user).expect("authenticated user always has a quota entry");
        if quotas.downloads.check(amount) {
            Ok(())
        } else {
            warn!("download quota exceeded for {user}");
            Err(StoreError::QuotaDownload)
        }
    }

    fn record_download(&self, user: &str, amount: u64) {
        if let Some(quotas) = self.quotas_for(user) {
            quotas.downloads.add(amount);
        }
    }

    /// Register a new user. No authentication required, but the username
    /// must be unused.
    pub fn add_user(&self, user: &str, pass: &str) -> StoreResult<()> {
        Self::check_len("username", user.len(), LEN_UNAME)?;
        Self::check_len("password", pass.len(), LEN_PASS)?;
        let hash = crate::crypto::kdf::hash_password(pass.as_bytes())
            .map_err(crate::crypto::CryptoError::from)?;
        let log = &self.log;
        let mut append_result = Ok(());
        let inserted = self.auth_table.insert(
            user.to_string(),
            AuthEntry { pass_hash: hash, content: Vec::new() },
            |k, v| {
                append_result = log.append_auth_new(k, &v.pass_hash);
            },
        );
        if !inserted {
            return Err(StoreError::UserExists);
        }
        append_result?;
        self.quota_table.insert(
            user.to_string(),
            Arc::new(Quotas {
                uploads: QuotaTracker::new(self.up_quota, self.quota_duration),
                downloads: QuotaTracker::new(self.down_quota, self.quota_duration),
                requests: QuotaTracker::new(self.req_quota, self.quota_duration),
            }),
            |_, _| {},
        );
        debug!("registered user {user}");
        Ok(())
    }

    /// Replace `user`'s own content with `content`.
    pub fn set_user_data(&self, user: &str, pass: &str, content: Vec<u8>) -> StoreResult<()> {
        Self::check_len("content", content.len(), LEN_CONTENT)?;
        self.authenticate(user, pass)?;
        self.check_upload(user, content.len() as u64)?;

        let log = &self.log;
        let content_len = content.len() as u64;
        let mut append_result = Ok(());
        let found = self.auth_table.do_with(&user.to_string(), |entry| {
            append_result = log.append_auth_diff(user, &content);
            entry.content = content;
        });
        found.ok_or(StoreError::NoUser)?;
        append_result?;

        self.record_upload(user, content_len);
        Ok(())
    }

    /// Fetch `who`'s content, charging `user`'s download quota.
    pub fn get_user_data(&self, user: &str, pass: &str, who: &str) -> StoreResult<Vec<u8>> {
        self.authenticate(user, pass)?;
        let content = self
            .auth_table
            .do_with_readonly(&who.to_string(), |entry| entry.content.clone())
            .ok_or(StoreError::NoUser)?;
        if content.is_empty() {
            return Err(StoreError::NoData);
        }
        self.check_download(user, content.len() as u64)?;
        self.record_download(user, content.len() as u64);
        Ok(content)
    }

    /// List every registered username, newline-separated.
    pub fn get_all_users(&self, user: &str, pass: &str) -> StoreResult<String> {
        self.authenticate(user, pass)?;
        let mut names = Vec::new();
        self.auth_table.do_all_readonly(|k, _| names.push(k.clone()), || {});
        let listing = names.join("\n");
        self.check_download(user, listing.len() as u64)?;
        self.record_download(user, listing.len() as u64);
        Ok(listing)
    }

    /// Insert `(key, value)` only if `key` is absent.
    pub fn kv_insert(&self, user: &str, pass: &str, key: &str, value: Vec<u8>) -> StoreResult<()> {
        Self::check_len("value", value.len(), LEN_CONTENT)?;
        self.authenticate(user, pass)?;
        self.charge_request(user)?;
        self.check_upload(user, value.len() as u64)?;

        let log = &self.log;
        let value_len = value.len() as u64;
        let mut append_result = Ok(());
        let inserted = self.kv_store.insert(key.to_string(), value, |k, v| {
            append_result = log.append_kv_update(k, v);
        });
        if !inserted {
            return Err(StoreError::KeyExists);
        }
        append_result?;

        self.mru.insert(key);
        self.record_upload(user, value_len);
        Ok(())
    }

    /// Insert or replace `(key, value)`.
    pub fn kv_upsert(
        &self,
        user: &str,
        pass: &str,
        key: &str,
        value: Vec<u8>,
    ) -> StoreResult<UpsertOutcome> {
        Self::check_len("value", value.len(), LEN_CONTENT)?;
        self.authenticate(user, pass)?;
        self.charge_request(user)?;
        self.check_upload(user, value.len() as u64)?;

        let log = &self.log;
        let value_len = value.len() as u64;
        let mut append_result = Ok(());
        let inserted = self.kv_store.upsert(
            key.to_string(),
            value,
            |k, v| {
                append_result = log.append_kv_update(k, v);
            },
            |k, v| {
                append_result = log.append_kv_update(k, v);
            },
        );
        append_result?;

        self.mru.insert(key);
        self.record_upload(user, value_len);
        Ok(if inserted { UpsertOutcome::Inserted } else { UpsertOutcome::Updated })
    }

    /// Fetch the value for `key`.
    pub fn kv_get(&self, user: &str, pass: &str, key: &str) -> StoreResult<Vec<u8>> {
        self.authenticate(user, pass)?;
        self.charge_request(user)?;
        let value = self
            .kv_store
            .do_with_readonly(&key.to_string(), |v| v.clone())
            .ok_or(StoreError::KeyMissing)?;
        self.check_download(user, value.len() as u64)?;
        self.record_download(user, value.len() as u64);
        Ok(value)
    }

    /// Remove `key`.
    pub fn kv_delete(&self, user: &str, pass: &str, key: &str) -> StoreResult<()> {
        self.authenticate(user, pass)?;
        self.charge_request(user)?;

        let log = &self.log;
        let mut append_result = Ok(());
        let removed = self.kv_store.remove(&key.to_string(), |k, _| {
            append_result = log.append_kv_delete(k);
        });
        if !removed {
            return Err(StoreError::KeyMissing);
        }
        append_result?;
        self.mru.remove(key);
        Ok(())
    }

    /// List every key, newline-separated.
    pub fn kv_all(&self, user: &str, pass: &str) -> StoreResult<String> {
        self.authenticate(user, pass)?;
        self.charge_request(user)?;
        let mut keys = Vec::new();
        self.kv_store.do_all_readonly(|k, _| keys.push(k.clone()), || {});
        let listing = keys.join("\n");
        self.check_download(user, listing.len() as u64)?;
        self.record_download(user, listing.len() as u64);
        Ok(listing)
    }

    /// Return the MRU listing.
    pub fn kv_top(&self, user: &str, pass: &str) -> StoreResult<String> {
        self.authenticate(user, pass)?;
        self.charge_request(user)?;
        let listing = self.mru.get();
        self.check_download(user, listing.len() as u64)?;
        self.record_download(user, listing.len() as u64);
        Ok(listing)
    }

    /// Register a map/reduce plugin. Admin-only.
    pub fn register_mr(&self, user: &str, pass: &str, name: &str, so_bytes: &[u8]) -> StoreResult<()> {
        self.authenticate(user, pass)?;
        if user != self.admin_name {
            return Err(StoreError::NotAdmin);
        }
        self.funcs.register(name, so_bytes)?;
        info!("registered map/reduce function {name} (by {user})");
        Ok(())
    }

    /// Run a registered map/reduce over every KV pair in a forked child.
    pub fn invoke_mr(&self, user: &str, pass: &str, name: &str) -> StoreResult<Vec<u8>> {
        self.authenticate(user, pass)?;
        let mut pairs = Vec::new();
        self.kv_store.do_all_readonly(|k, v| pairs.push((k.clone(), v.clone())), || {});
        let result = self.funcs.invoke(name, &pairs)?;
        Ok(result)
    }

    /// Write a consistent snapshot and atomically replace the data file,
    /// then resume incremental appends against the new file.
    pub fn persist(&self) -> StoreResult<()> {
        let mut auth_rows: Vec<(String, Vec<u8>, Vec<u8>)> = Vec::new();
        let mut kv_rows: Vec<(String, Vec<u8>)> = Vec::new();

        // A single do_all_readonly per map keeps each map's own two-phase
        // lock scope tight; the cross-map snapshot is still "consistent
        // enough" in the sense the spec requires (each table internally
        // consistent at the instant of its own scan), since the two tables
        // never share a bucket lock.
        self.auth_table.do_all_readonly(
            |k, v| auth_rows.push((k.clone(), v.pass_hash.clone(), v.content.clone())),
            || {},
        );
        self.kv_store.do_all_readonly(|k, v| kv_rows.push((k.clone(), v.clone())), || {});

        persistence::write_snapshot(
            &self.data_file,
            auth_rows.iter().map(|(u, h, c)| (u.as_str(), h.as_slice(), c.as_slice())),
            kv_rows.iter().map(|(k, v)| (k.as_str(), v.as_slice())),
        )?;
        info!("persisted snapshot: {} users, {} keys", auth_rows.len(), kv_rows.len());
        Ok(())
    }

    /// `BYE`: authenticate and signal the session layer to close after
    /// acknowledging.
    pub fn bye(&self, user: &str, pass: &str) -> StoreResult<()> {
        self.authenticate(user, pass)
    }

    /// `SAV`: authenticate, then persist.
    pub fn sav(&self, user: &str, pass: &str) -> StoreResult<()> {
        self.authenticate(user, pass)?;
        self.persist()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_store(dir: &std::path::Path) -> Store {
        Store::open(&dir.join("store.dat"), 4, 1 << 20, 1 << 20, 1000, 60, 8, "admin".to_string()).unwrap()
    }

    #[test]
    fn register_then_duplicate_register_fails() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        store.add_user("alice", "pw1").unwrap();
        assert!(matches!(store.add_user("alice", "pw2"), Err(StoreError::UserExists)));
    }

    #[test]
    fn username_at_the_bound_is_accepted_one_past_it_is_rejected() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        let at_bound = "u".repeat(LEN_UNAME);
        let one_over = "u".repeat(LEN_UNAME + 1);
        store.add_user(&at_bound, "pw1").unwrap();
        assert!(matches!(
            store.add_user(&one_over, "pw1"),
            Err(StoreError::InvalidLength { field: "username", .. })
        ));
    }

    #[test]
    fn content_at_the_bound_is_accepted_one_past_it_is_rejected() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        store.add_user("alice", "pw1").unwrap();
        store.set_user_data("alice", "pw1", vec![0u8; LEN_CONTENT]).unwrap();
        assert!(matches!(
            store.set_user_data("alice", "pw1", vec![0u8; LEN_CONTENT + 1]),
            Err(StoreError::InvalidLength { field: "content", .. })
        ));
    }

    #[test]
    fn kv_insert_then_duplicate_then_upsert_then_get() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        store.add_user("alice", "pw1").unwrap();

        store.kv_insert("alice", "pw1", "k", b"v1".to_vec()).unwrap();
        assert!(matches!(
            store.kv_insert("alice", "pw1", "k", b"v2".to_vec()),
            Err(StoreError::KeyExists)
        ));
        let outcome = store.kv_upsert("alice", "pw1", "k", b"v2".to_vec()).unwrap();
        assert_eq!(outcome, UpsertOutcome::Updated);
        assert_eq!(store.kv_get("alice", "pw1", "k").unwrap(), b"v2".to_vec());
    }

    #[test]
    fn set_then_get_user_data() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        store.add_user("alice", "pw1").unwrap();
        store.set_user_data("alice", "pw1", vec![0u8; 100]).unwrap();
        assert_eq!(store.get_user_data("alice", "pw1", "alice").unwrap(), vec![0u8; 100]);
        assert!(matches!(store.get_user_data("alice", "pw1", "bob"), Err(StoreError::NoUser)));
    }

    #[test]
    fn wrong_password_is_rejected() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        store.add_user("alice", "pw1").unwrap();
        assert!(matches!(store.kv_get("alice", "wrong", "k"), Err(StoreError::Login)));
    }

    #[test]
    fn upload_quota_is_enforced() {
        let dir = tempdir().unwrap();
        let store = Store::open(&dir.path().join("s.dat"), 4, 10, 1 << 20, 1000, 60, 8, "admin".to_string()).unwrap();
        store.add_user("alice", "pw1").unwrap();
        store.kv_insert("alice", "pw1", "a", b"1234567".to_vec()).unwrap();
        assert!(matches!(
            store.kv_insert("alice", "pw1", "b", b"1234".to_vec()),
            Err(StoreError::QuotaUpload)
        ));
    }

    #[test]
    fn persist_then_reopen_replays_state() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.dat");
        {
            let store = Store::open(&path, 4, 1 << 20, 1 << 20, 1000, 60, 8, "admin".to_string()).unwrap();
            store.add_user("alice", "pw1").unwrap();
            store.kv_insert("alice", "pw1", "k", b"v".to_vec()).unwrap();
            store.persist().unwrap();
        }
        let reopened = Store::open(&path, 4, 1 << 20, 1 << 20, 1000, 60, 8, "admin".to_string()).unwrap();
        assert_eq!(reopened.kv_get("alice", "pw1", "k").unwrap(), b"v".to_vec());
    }

    #[test]
    fn mru_tracks_recent_keys() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        store.add_user("alice", "pw1").unwrap();
        store.kv_insert("alice", "pw1", "a", b"1".to_vec()).unwrap();
        store.kv_insert("alice", "pw1", "b", b"2".to_vec()).unwrap();
        assert_eq!(store.kv_top("alice", "pw1").unwrap(), "b\na");
    }
}
