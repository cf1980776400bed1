//! Bytecode cache keyed by absolute script path, invalidated on mtime change
//! (§4.2). Grounded in the teacher's `lua_bc::LuaBytecodeCache` sharding and
//! striped-compile-lock design, re-keyed by path+mtime instead of a
//! content hash, and without its KV-backed L2 tier (persistence across
//! restarts is an explicit Non-goal of this system).

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::{Mutex, RwLock};
use xxhash_rust::xxh3::xxh3_64;

use crate::error::{AppError, AppResult};

#[derive(Clone)]
struct CacheEntry {
    bytecode: Arc<Vec<u8>>,
    mtime: SystemTime,
}

struct Shard {
    map: RwLock<HashMap<PathBuf, CacheEntry>>,
}

const N_SHARDS: usize = 32;
const N_LOCKS: usize = 64;

/// Process-wide compiled-bytecode cache shared across workers.
///
/// Callers receive an owned `Arc<Vec<u8>>` from `get_or_compile`, which is
/// what resolves the source design's fragile pointer-lifetime hazard
/// (design note §9): a concurrent recompile swaps the cache's internal
/// `Arc`, but can never invalidate a clone a caller already holds.
pub struct BytecodeCache {
    shards: Vec<Shard>,
    compile_locks: Vec<Mutex<()>>,
}

impl Default for BytecodeCache {
    fn default() -> Self {
        Self::new()
    }
}

impl BytecodeCache {
    pub fn new() -> Self {
        Self {
            shards: (0..N_SHARDS)
                .map(|_| Shard {
                    map: RwLock::new(HashMap::new()),
                })
                .collect(),
            compile_locks: (0..N_LOCKS).map(|_| Mutex::new(())).collect(),
        }
    }

    fn shard_idx(path: &Path) -> usize {
        (xxh3_64(path.to_string_lossy().as_bytes()) as usize) & (N_SHARDS - 1)
    }

    fn lock_idx(path: &Path) -> usize {
        (xxh3_64(path.to_string_lossy().as_bytes()) as usize) & (N_LOCKS - 1)
    }

    /// Compile-on-demand lookup implementing the §4.2 algorithm. `compile_fn`
    /// is invoked with the script source and must return Lua bytecode
    /// (`mlua::Function::dump`'d bytes); it always runs outside any lock held
    /// by this cache.
    pub fn get_or_compile<F>(
        &self,
        path: &Path,
        compile_fn: F,
    ) -> AppResult<(Arc<Vec<u8>>, bool)>
    where
        F: FnOnce(&str) -> AppResult<Vec<u8>>,
    {
        let meta = fs::metadata(path)
            .map_err(|e| AppError::ScriptResolution(format!("{}: {}", path.display(), e)))?;
        let source_mtime = meta
            .modified()
            .map_err(|e| AppError::ScriptResolution(format!("{}: {}", path.display(), e)))?;

        let si = Self::shard_idx(path);
        if let Some(entry) = self.shards[si].map.read().get(path) {
            if entry.mtime >= source_mtime {
                return Ok((entry.bytecode.clone(), false));
            }
        }

        let li = Self::lock_idx(path);
        let _guard = self.compile_locks[li].lock();
        // Recheck: another worker may have compiled this path while we
        // waited for the lock.
        if let Some(entry) = self.shards[si].map.read().get(path) {
            if entry.mtime >= source_mtime {
                return Ok((entry.bytecode.clone(), false));
            }
        }

        let source = fs::read_to_string(path)
            .map_err(|e| AppError::ScriptResolution(format!("{}: {}", path.display(), e)))?;
        let bytes = compile_fn(&source)?;
        let bytecode = Arc::new(bytes);
        self.shards[si].map.write().insert(
            path.to_path_buf(),
            CacheEntry {
                bytecode: bytecode.clone(),
                mtime: source_mtime,
            },
        );
        Ok((bytecode, true))
    }

    /// Drop every cached entry. Not used on the request path; kept for tests
    /// and administrative hooks.
    pub fn invalidate_all(&self) {
        for shard in &self.shards {
            shard.map.write().clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use tempfile::NamedTempFile;

    #[test]
    fn compiles_once_then_serves_from_cache() {
        let cache = BytecodeCache::new();
        let file = NamedTempFile::new().unwrap();
        fs::write(file.path(), "return 1").unwrap();
        let compiles = AtomicUsize::new(0);

        let (bc1, fresh1) = cache
            .get_or_compile(file.path(), |src| {
                compiles.fetch_add(1, Ordering::SeqCst);
                Ok(src.as_bytes().to_vec())
            })
            .unwrap();
        assert!(fresh1);

        let (bc2, fresh2) = cache
            .get_or_compile(file.path(), |src| {
                compiles.fetch_add(1, Ordering::SeqCst);
                Ok(src.as_bytes().to_vec())
            })
            .unwrap();
        assert!(!fresh2);
        assert_eq!(*bc1, *bc2);
        assert_eq!(compiles.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stale_mtime_triggers_recompile() {
        let cache = BytecodeCache::new();
        let file = NamedTempFile::new().unwrap();
        fs::write(file.path(), "return 1").unwrap();
        let (bc1, _) = cache
            .get_or_compile(file.path(), |src| Ok(src.as_bytes().to_vec()))
            .unwrap();

        // Force a strictly-later mtime.
        thread::sleep(std::time::Duration::from_millis(1100));
        fs::write(file.path(), "return 2").unwrap();

        let (bc2, fresh) = cache
            .get_or_compile(file.path(), |src| Ok(src.as_bytes().to_vec()))
            .unwrap();
        assert!(fresh);
        assert_ne!(*bc1, *bc2);
    }

    #[test]
    fn missing_file_reports_script_resolution_error() {
        let cache = BytecodeCache::new();
        let err = cache
            .get_or_compile(Path::new("/no/such/script.lua"), |src| {
                Ok(src.as_bytes().to_vec())
            })
            .unwrap_err();
        assert!(matches!(err, AppError::ScriptResolution(_)));
    }

    #[test]
    fn a_held_arc_survives_a_later_recompile() {
        let cache = BytecodeCache::new();
        let file = NamedTempFile::new().unwrap();
        fs::write(file.path(), "return 1").unwrap();
        let (held, _) = cache
            .get_or_compile(file.path(), |src| Ok(src.as_bytes().to_vec()))
            .unwrap();

        thread::sleep(std::time::Duration::from_millis(1100));
        fs::write(file.path(), "return 2").unwrap();
        cache
            .get_or_compile(file.path(), |src| Ok(src.as_bytes().to_vec()))
            .unwrap();

        // `held` is untouched even though the cache entry for this path changed.
        assert_eq!(&**held, b"return 1");
    }
}
