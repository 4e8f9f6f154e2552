//! Dynamic registration and sandboxed execution of user-supplied map/reduce
//! plugins.
//!
//! A plugin is a shared object exporting two C-ABI symbols, `map` and
//! `reduce`. [`FunctionTable`] loads and holds these; [`sandbox`] runs them
//! in a forked child so a crashing or malicious plugin cannot corrupt the
//! server process.

pub mod sandbox;

use std::collections::HashMap;
use std::path::PathBuf;

use libloading::Library;
use log::{info, warn};
use parking_lot::RwLock;
use thiserror::Error;

use sandbox::SandboxError;

/// C ABI of a registered `map` function: given a key/value pair, returns a
/// heap-allocated result buffer through the out-pointer/out-length pair.
/// The buffer must be allocated so that a `Vec<u8>` of length `*out_len` can
/// safely reclaim it (i.e. capacity equals length, allocated with Rust's
/// global allocator) — plugins are expected to be built with the same
/// toolchain and allocator as the server.
pub type MapFn = unsafe extern "C" fn(
    key_ptr: *const u8,
    key_len: usize,
    val_ptr: *const u8,
    val_len: usize,
    out_len: *mut usize,
) -> *mut u8;

/// C ABI of a registered `reduce` function: given the accumulated map
/// outputs, returns a heap-allocated result buffer the same way [`MapFn`]
/// does.
pub type ReduceFn = unsafe extern "C" fn(
    item_ptrs: *const *const u8,
    item_lens: *const usize,
    n_items: usize,
    out_len: *mut usize,
) -> *mut u8;

/// Errors from registering or invoking a map/reduce plugin.
#[derive(Error, Debug)]
pub enum MapReduceError {
    /// Writing the plugin's `.so` bytes to a temp file failed.
    #[error("failed to write plugin file: {0}")]
    SoWrite(#[source] std::io::Error),

    /// `dlopen` of the plugin file failed.
    #[error("failed to load plugin: {0}")]
    LoadFailed(String),

    /// The plugin did not export a required symbol.
    #[error("plugin is missing the required `{0}` symbol")]
    MissingSymbol(&'static str),

    /// `register_mr` with a name that is already registered.
    #[error("map/reduce function {0:?} is already registered")]
    DuplicateName(String),

    /// `invoke_mr` for a name that was never registered.
    #[error("no such map/reduce function {0:?}")]
    NotRegistered(String),

    /// The fork/pipe sandbox failed to run the plugin.
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

/// Result alias for map/reduce operations.
pub type MapReduceResult<T> = Result<T, MapReduceError>;

struct Registered {
    // Kept alive for the process lifetime so `map_fn`/`reduce_fn` remain
    // valid; dropped (and the mapping unloaded) only at process exit.
    _library: Library,
    map_fn: MapFn,
    reduce_fn: ReduceFn,
}

struct Inner {
    next_id: usize,
    functions: HashMap<String, Registered>,
    plugin_files: Vec<PathBuf>,
}

/// Registry of named `(map, reduce)` function pairs loaded from
/// user-supplied shared objects. Registration is append-only for the
/// process's lifetime.
pub struct FunctionTable {
    inner: RwLock<Inner>,
}

impl Default for FunctionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FunctionTable {
    /// Construct an empty function table.
    pub fn new() -> Self {
        Self { inner: RwLock::new(Inner { next_id: 0, functions: HashMap::new(), plugin_files: Vec::new() }) }
    }

    /// Write `so_bytes` to a uniquely named file, `dlopen` it, resolve the
    /// `map` and `reduce` symbols, and register them under `name`. On any
    /// failure the partially loaded handle (and file) is cleaned up and an
    /// error is returned; `name` remains unregistered.
    pub fn register(&self, name: &str, so_bytes: &[u8]) -> MapReduceResult<()> {
        let mut inner = self.inner.write();
        if inner.functions.contains_key(name) {
            return Err(MapReduceError::DuplicateName(name.to_string()));
        }

        let id = inner.next_id;
        inner.next_id += 1;
        let path = std::env::temp_dir().join(format!("vaultd-mr-{}-{id}.so", std::process::id()));
        std::fs::write(&path, so_bytes).map_err(MapReduceError::SoWrite)?;

        let registered = match self.load_plugin(&path) {
            Ok(r) => r,
            Err(e) => {
                let _ = std::fs::remove_file(&path);
                return Err(e);
            }
        };

        inner.functions.insert(name.to_string(), registered);
        inner.plugin_files.push(path);
        info!("registered map/reduce plugin {name:?}");
        Ok(())
    }

    fn load_plugin(&self, path: &std::path::Path) -> MapReduceResult<Registered> {
        let library = unsafe { Library::new(path) }.map_err(|e| MapReduceError::LoadFailed(e.to_string()))?;
        let map_fn: MapFn = unsafe {
            *library
                .get::<MapFn>(b"map\0")
                .map_err(|_| MapReduceError::MissingSymbol("map"))?
        };
        let reduce_fn: ReduceFn = unsafe {
            *library
                .get::<ReduceFn>(b"reduce\0")
                .map_err(|_| MapReduceError::MissingSymbol("reduce"))?
        };
        Ok(Registered { _library: library, map_fn, reduce_fn })
    }

    /// Look up the `(map, reduce)` pair registered under `name`.
    pub fn get(&self, name: &str) -> Option<(MapFn, ReduceFn)> {
        let inner = self.inner.read();
        inner.functions.get(name).map(|r| (r.map_fn, r.reduce_fn))
    }

    /// Resolve `name`, then run it over `pairs` in a forked sandbox,
    /// returning the reduce result.
    pub fn invoke(&self, name: &str, pairs: &[(String, Vec<u8>)]) -> MapReduceResult<Vec<u8>> {
        let (map_fn, reduce_fn) = self.get(name).ok_or_else(|| MapReduceError::NotRegistered(name.to_string()))?;
        let result = sandbox::run(map_fn, reduce_fn, pairs)?;
        Ok(result)
    }
}

impl Drop for FunctionTable {
    fn drop(&mut self) {
        let inner = self.inner.read();
        for path in &inner.plugin_files {
            if let Err(e) = std::fs::remove_file(path) {
                warn!("failed to remove plugin file {}: {e}", path.display());
            }
        }
    }
}

/// Call a registered `map` function, copying its result into an owned
/// buffer.
///
/// # Safety
/// `map_fn` must be a valid function pointer following the [`MapFn`] ABI
/// contract.
pub(crate) unsafe fn call_map(map_fn: MapFn, key: &[u8], value: &[u8]) -> Vec<u8> {
    let mut out_len: usize = 0;
    let ptr = map_fn(key.as_ptr(), key.len(), value.as_ptr(), value.len(), &mut out_len);
    if ptr.is_null() || out_len == 0 {
        return Vec::new();
    }
    Vec::from_raw_parts(ptr, out_len, out_len)
}

/// Call a registered `reduce` function over the accumulated map outputs,
/// copying its result into an owned buffer.
///
/// # Safety
/// `reduce_fn` must be a valid function pointer following the [`ReduceFn`]
/// ABI contract.
pub(crate) unsafe fn call_reduce(reduce_fn: ReduceFn, items: &[Vec<u8>]) -> Vec<u8> {
    let ptrs: Vec<*const u8> = items.iter().map(|v| v.as_ptr()).collect();
    let lens: Vec<usize> = items.iter().map(|v| v.len()).collect();
    let mut out_len: usize = 0;
    let ptr = reduce_fn(ptrs.as_ptr(), lens.as_ptr(), items.len(), &mut out_len);
    if ptr.is_null() || out_len == 0 {
        return Vec::new();
    }
    Vec::from_raw_parts(ptr, out_len, out_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_duplicate_name_fails_without_touching_the_first() {
        let table = FunctionTable::new();
        // Registering garbage bytes always fails to load, but the first
        // failed attempt must not leave a dangling entry for the duplicate
        // check below to stumble over.
        let first = table.register("wordcount", b"not a valid shared object");
        assert!(first.is_err());
        let second = table.register("wordcount", b"still not valid");
        assert!(second.is_err());
    }

    #[test]
    fn invoke_unregistered_name_fails() {
        let table = FunctionTable::new();
        let result = table.invoke("nope", &[]);
        assert!(matches!(result, Err(MapReduceError::NotRegistered(_))));
    }
}
