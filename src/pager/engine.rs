//! The engine: configuration, the cache backend and shared WAL state.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::cache::{CacheBackend, DefaultCacheBackend, PageCache};
use crate::common::config::Config;
use crate::common::{Error, Result};
use crate::storage::{DbFile, FileHeader};
use crate::wal::{Wal, WalShared};

use super::Pager;

/// Entry point for opening databases.
///
/// Holds what would otherwise be process-wide state: the configuration,
/// the page cache backend (and through it any shared cache group and page
/// pool) and one [`WalShared`] per open WAL file, so that pagers on the
/// same database coordinate through the same locks and read marks.
///
/// # Example
/// ```no_run
/// use udb::{Config, Engine};
///
/// let engine = Engine::new(Config::default())?;
/// let pager = engine.open_pager("app.db")?;
/// pager.begin_read()?;
/// # Ok::<(), udb::Error>(())
/// ```
pub struct Engine {
    config: Config,
    backend: Arc<dyn CacheBackend>,
    wals: Mutex<HashMap<PathBuf, Weak<WalShared>>>,
}

impl Engine {
    /// # Errors
    /// Returns `Error::InvalidConfig` if `config` does not validate.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let backend = Arc::new(DefaultCacheBackend::new(&config));
        Ok(Self::build(config, backend))
    }

    /// Use a custom page cache backend instead of the built-in one.
    pub fn with_cache_backend(config: Config, backend: Arc<dyn CacheBackend>) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config, backend))
    }

    fn build(config: Config, backend: Arc<dyn CacheBackend>) -> Self {
        tracing::debug!(
            page_size = config.page_size,
            cache_size = config.cache_size,
            mode = ?config.cache_mode,
            "engine created"
        );
        Self {
            config,
            backend,
            wals: Mutex::new(HashMap::new()),
        }
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[inline]
    pub fn cache_backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    /// Open a connection to the database at `path`, creating the file if
    /// needed. The WAL lives beside it with a `-wal` suffix.
    ///
    /// # Errors
    /// - I/O errors opening either file
    /// - `Error::Corrupt` if the file is not a database or its page size
    ///   disagrees with the WAL's
    pub fn open_pager<P: AsRef<Path>>(&self, path: P) -> Result<Pager> {
        let mut db = DbFile::open(path.as_ref(), self.config.page_size)?;
        let db_path = std::fs::canonicalize(path.as_ref())?;

        let mut raw = [0u8; FileHeader::SIZE];
        let header = if db.read_prefix(&mut raw)? {
            Some(FileHeader::from_bytes(&raw)?)
        } else if db.is_empty()? {
            None
        } else {
            return Err(Error::corrupt("file is not a database"));
        };

        let hint = header.map_or(self.config.page_size, |h| h.page_size);
        let shared = self.shared_wal(&wal_path(&db_path), hint)?;

        let page_size = {
            let mut wal_header = shared.header.lock();
            match header {
                Some(h) if h.page_size as u32 != wal_header.page_size => {
                    if wal_header.max_frame > 0 {
                        return Err(Error::corrupt(format!(
                            "database page size {} disagrees with wal page size {}",
                            h.page_size, wal_header.page_size
                        )));
                    }
                    wal_header.page_size = h.page_size as u32;
                    h.page_size
                }
                _ => wal_header.page_size as usize,
            }
        };
        db.set_page_size(page_size);

        let cache = PageCache::open(
            self.backend.as_ref(),
            page_size,
            0,
            self.config.cache_size,
            self.config.spill_size,
        )?;
        let wal = Wal::new(shared, self.config.max_wal_size);

        tracing::debug!(path = %db_path.display(), page_size, "opened pager");
        Ok(Pager::new(db, wal, cache))
    }

    fn shared_wal(&self, path: &Path, page_size: usize) -> Result<Arc<WalShared>> {
        let mut wals = self.wals.lock();
        if let Some(shared) = wals.get(path).and_then(Weak::upgrade) {
            return Ok(shared);
        }
        let shared = Arc::new(WalShared::open(path, page_size)?);
        wals.retain(|_, w| w.strong_count() > 0);
        wals.insert(path.to_path_buf(), Arc::downgrade(&shared));
        Ok(shared)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("open_wals", &self.wals.lock().len())
            .finish()
    }
}

/// `<db path>-wal`.
pub fn wal_path(db_path: &Path) -> PathBuf {
    let mut name: OsString = db_path.as_os_str().to_owned();
    name.push("-wal");
    PathBuf::from(name)
}
