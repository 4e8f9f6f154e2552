//! Hybrid snapshot + incremental-log persistence.
//!
//! One on-disk file carries two record shapes, distinguished by an 8-byte
//! magic prefix: full snapshot records (written only by
//! [`write_snapshot`]) and incremental records (appended after every
//! successful mutating operation). Replaying the file from the start
//! reconstructs the in-memory state exactly.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use thiserror::Error;

/// A user's full auth entry: written by [`write_snapshot`] for every user at
/// snapshot time, and appended incrementally (with an empty content field)
/// the moment a new user registers.
pub const MAGIC_AUTH_ENTRY: &[u8; 8] = b"AUTHAUTH";
/// Snapshot record: a key/value pair.
pub const MAGIC_KV_ENTRY: &[u8; 8] = b"KVKVKVKV";
/// Incremental record: a user's content was replaced.
pub const MAGIC_AUTH_DIFF: &[u8; 8] = b"AUTHDIFF";
/// Incremental record: a key was inserted or updated.
pub const MAGIC_KV_UPDATE: &[u8; 8] = b"KVUPDATE";
/// Incremental record: a key was deleted.
pub const MAGIC_KV_DELETE: &[u8; 8] = b"KVDELETE";

/// Errors from snapshot/replay/incremental-append operations.
#[derive(Error, Debug)]
pub enum PersistenceError {
    /// Underlying file I/O failed.
    #[error("persistence I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The log contained an unrecognized 8-byte magic.
    #[error("unrecognized record magic {0:?} at byte offset {1}")]
    UnknownMagic([u8; 8], u64),

    /// A length-prefixed field claimed more bytes than remained in the file.
    #[error("truncated record: field claimed {claimed} bytes but only {available} remained")]
    TruncatedRecord { claimed: usize, available: usize },

    /// An `AUTHDIFF`/`KVDELETE` record referenced a key absent from the map
    /// built up so far.
    #[error("replay record referenced unknown key {0:?}")]
    UnknownKeyInReplay(String),
}

/// Result alias for persistence operations.
pub type PersistenceResult<T> = Result<T, PersistenceError>;

fn write_field<W: Write>(w: &mut W, bytes: &[u8]) -> PersistenceResult<()> {
    w.write_all(&(bytes.len() as u32).to_le_bytes())?;
    w.write_all(bytes)?;
    Ok(())
}

fn read_exact_or_truncated<R: Read>(r: &mut R, n: usize) -> PersistenceResult<Vec<u8>> {
    let mut buf = vec![0u8; n];
    match r.read_exact(&mut buf) {
        Ok(()) => Ok(buf),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(PersistenceError::TruncatedRecord { claimed: n, available: 0 })
        }
        Err(e) => Err(e.into()),
    }
}

fn read_field<R: Read>(r: &mut R) -> PersistenceResult<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match r.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    Ok(Some(read_exact_or_truncated(r, len)?))
}

/// Outcome of replaying the log, handed back to the caller to populate the
/// live `Store`.
pub enum ReplayRecord {
    /// Full auth snapshot entry: `(username, pass_hash, content)`.
    AuthSnapshot(String, Vec<u8>, Vec<u8>),
    /// Full KV snapshot entry: `(key, value)`.
    KvSnapshot(String, Vec<u8>),
    /// A user's content was replaced: `(username, content)`.
    AuthDiff(String, Vec<u8>),
    /// A key was inserted or updated: `(key, value)`.
    KvUpdate(String, Vec<u8>),
    /// A key was deleted.
    KvDelete(String),
}

/// Sequentially parse every record in `path`, invoking `on_record` for each
/// in file order. A nonexistent file yields no records (it is not an
/// error — the caller is expected to create it empty on first use).
pub fn replay<F>(path: &Path, mut on_record: F) -> PersistenceResult<()>
where
    F: FnMut(ReplayRecord) -> PersistenceResult<()>,
{
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let mut reader = BufReader::new(file);

    loop {
        let mut magic = [0u8; 8];
        match reader.read_exact(&mut magic) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }

        let record = match &magic {
            m if m == MAGIC_AUTH_ENTRY => {
                let user = read_field(&mut reader)?.ok_or(PersistenceError::TruncatedRecord { claimed: 4, available: 0 })?;
                let hash = read_field(&mut reader)?.ok_or(PersistenceError::TruncatedRecord { claimed: 4, available: 0 })?;
                let content = read_field(&mut reader)?.ok_or(PersistenceError::TruncatedRecord { claimed: 4, available: 0 })?;
                ReplayRecord::AuthSnapshot(String::from_utf8_lossy(&user).into_owned(), hash, content)
            }
            m if m == MAGIC_KV_ENTRY => {
                let key = read_field(&mut reader)?.ok_or(PersistenceError::TruncatedRecord { claimed: 4, available: 0 })?;
                let value = read_field(&mut reader)?.ok_or(PersistenceError::TruncatedRecord { claimed: 4, available: 0 })?;
                ReplayRecord::KvSnapshot(String::from_utf8_lossy(&key).into_owned(), value)
            }
            m if m == MAGIC_AUTH_DIFF => {
                let user = read_field(&mut reader)?.ok_or(PersistenceError::TruncatedRecord { claimed: 4, available: 0 })?;
                let content = read_field(&mut reader)?.ok_or(PersistenceError::TruncatedRecord { claimed: 4, available: 0 })?;
                ReplayRecord::AuthDiff(String::from_utf8_lossy(&user).into_owned(), content)
            }
            m if m == MAGIC_KV_UPDATE => {
                let key = read_field(&mut reader)?.ok_or(PersistenceError::TruncatedRecord { claimed: 4, available: 0 })?;
                let value = read_field(&mut reader)?.ok_or(PersistenceError::TruncatedRecord { claimed: 4, available: 0 })?;
                ReplayRecord::KvUpdate(String::from_utf8_lossy(&key).into_owned(), value)
            }
            m if m == MAGIC_KV_DELETE => {
                let key = read_field(&mut reader)?.ok_or(PersistenceError::TruncatedRecord { claimed: 4, available: 0 })?;
                ReplayRecord::KvDelete(String::from_utf8_lossy(&key).into_owned())
            }
            other => return Err(PersistenceError::UnknownMagic(*other, 0)),
        };

        on_record(record)?;
    }

    Ok(())
}

/// Write a full, consistent snapshot to `<path>.tmp` and atomically rename
/// it over `path`. The caller is responsible for holding whatever locks are
/// needed to make `users`/`kvs` a consistent cross-shard view (see
/// `ShardedMap::do_all_readonly`).
pub fn write_snapshot<'a>(
    path: &Path,
    users: impl Iterator<Item = (&'a str, &'a [u8], &'a [u8])>,
    kvs: impl Iterator<Item = (&'a str, &'a [u8])>,
) -> PersistenceResult<()> {
    let tmp_path = tmp_path_for(path);
    {
        let mut tmp = File::create(&tmp_path)?;
        for (user, hash, content) in users {
            tmp.write_all(MAGIC_AUTH_ENTRY)?;
            write_field(&mut tmp, user.as_bytes())?;
            write_field(&mut tmp, hash)?;
            write_field(&mut tmp, content)?;
        }
        for (key, value) in kvs {
            tmp.write_all(MAGIC_KV_ENTRY)?;
            write_field(&mut tmp, key.as_bytes())?;
            write_field(&mut tmp, value)?;
        }
        tmp.flush()?;
        tmp.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".tmp");
    PathBuf::from(os)
}

/// An open handle to the incremental-log tail of the persistence file,
/// opened in append mode. Every append is followed by `flush` + `sync_all`
/// before returning, so a successful `append_*` call is durable.
pub struct PersistenceLog {
    file: Mutex<File>,
}

impl PersistenceLog {
    /// Open (creating if absent) `path` in append mode for incremental
    /// writes. Does not replay; call [`replay`] separately at startup
    /// before opening this handle for writes.
    pub fn open(path: &Path) -> PersistenceResult<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file: Mutex::new(file) })
    }

    /// Reopen the log in append mode after a snapshot replaced the
    /// underlying file via rename.
    pub fn reopen_after_snapshot(path: &Path) -> PersistenceResult<Self> {
        Self::open(path)
    }

    fn append(&self, magic: &[u8; 8], fields: &[&[u8]]) -> PersistenceResult<()> {
        let mut file = self.file.lock();
        file.write_all(magic)?;
        for f in fields {
            write_field(&mut *file, f)?;
        }
        file.flush()?;
        file.sync_all()?;
        Ok(())
    }

    /// Append an `AUTHAUTH` record: a new user was registered (content empty).
    pub fn append_auth_new(&self, user: &str, pass_hash: &[u8]) -> PersistenceResult<()> {
        self.append(MAGIC_AUTH_ENTRY, &[user.as_bytes(), pass_hash, &[]])
    }

    /// Append an `AUTHDIFF` record: a user's content was replaced.
    pub fn append_auth_diff(&self, user: &str, content: &[u8]) -> PersistenceResult<()> {
        self.append(MAGIC_AUTH_DIFF, &[user.as_bytes(), content])
    }

    /// Append a `KVUPDATE` record: a key was inserted or updated.
    pub fn append_kv_update(&self, key: &str, value: &[u8]) -> PersistenceResult<()> {
        self.append(MAGIC_KV_UPDATE, &[key.as_bytes(), value])
    }

    /// Append a `KVDELETE` record: a key was deleted.
    pub fn append_kv_delete(&self, key: &str) -> PersistenceResult<()> {
        self.append(MAGIC_KV_DELETE, &[key.as_bytes()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_replays_as_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nonexistent.dat");
        let mut count = 0;
        replay(&path, |_| {
            count += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn snapshot_then_replay_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.dat");

        let users = vec![("alice".to_string(), vec![1u8, 2, 3], vec![9u8, 9])];
        let kvs = vec![("k1".to_string(), vec![5u8, 6, 7])];

        write_snapshot(
            &path,
            users.iter().map(|(u, h, c)| (u.as_str(), h.as_slice(), c.as_slice())),
            kvs.iter().map(|(k, v)| (k.as_str(), v.as_slice())),
        )
        .unwrap();

        let mut seen_users = Vec::new();
        let mut seen_kvs = Vec::new();
        replay(&path, |rec| {
            match rec {
                ReplayRecord::AuthSnapshot(u, h, c) => seen_users.push((u, h, c)),
                ReplayRecord::KvSnapshot(k, v) => seen_kvs.push((k, v)),
                _ => panic!("unexpected incremental record in a snapshot-only file"),
            }
            Ok(())
        })
        .unwrap();

        assert_eq!(seen_users, users);
        assert_eq!(seen_kvs, kvs);
    }

    #[test]
    fn incremental_log_replays_in_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.dat");

        let log = PersistenceLog::open(&path).unwrap();
        log.append_kv_update("k", b"v1").unwrap();
        log.append_kv_update("k", b"v2").unwrap();
        log.append_kv_delete("k").unwrap();

        let mut events = Vec::new();
        replay(&path, |rec| {
            match rec {
                ReplayRecord::KvUpdate(k, v) => events.push(format!("update:{k}:{}", String::from_utf8_lossy(&v))),
                ReplayRecord::KvDelete(k) => events.push(format!("delete:{k}")),
                _ => {}
            }
            Ok(())
        })
        .unwrap();

        assert_eq!(events, vec!["update:k:v1", "update:k:v2", "delete:k"]);
    }

    #[test]
    fn truncated_record_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.dat");
        {
            let mut f = File::create(&path).unwrap();
            f.write_all(MAGIC_KV_UPDATE).unwrap();
            f.write_all(&100u32.to_le_bytes()).unwrap();
            f.write_all(b"short").unwrap();
        }
        let result = replay(&path, |_| Ok(()));
        assert!(result.is_err());
    }

    #[test]
    fn unknown_magic_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad_magic.dat");
        std::fs::write(&path, b"NOTAMAGIC").unwrap();
        let result = replay(&path, |_| Ok(()));
        assert!(matches!(result, Err(PersistenceError::UnknownMagic(_, _))));
    }
}
