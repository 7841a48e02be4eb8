//! Transactions over the trees of one database.

use crate::common::{Error, PageNo, Result};
use crate::pager::Pager;

use super::cursor::Cursor;
use super::mem_page::MemPage;
use super::tree::BTree;

/// A read or write transaction on one pager.
///
/// Trees are found by name through the catalog, a tree rooted at page 1
/// that maps each name to its root page. Dropping an unfinished
/// transaction rolls it back.
///
/// # Example
/// ```no_run
/// use udb::{Config, Engine, Txn};
///
/// let engine = Engine::new(Config::default())?;
/// let pager = engine.open_pager("app.db")?;
///
/// let txn = Txn::begin_write(&pager)?;
/// if let Some(tree) = txn.open_tree("users", true)? {
///     txn.write(&tree, b"alice", b"admin")?;
/// }
/// txn.commit()?;
///
/// let txn = Txn::begin_read(&pager)?;
/// let tree = txn.open_tree("users", false)?.expect("tree exists");
/// assert_eq!(txn.get(&tree, b"alice")?.as_deref(), Some(&b"admin"[..]));
/// # Ok::<(), udb::Error>(())
/// ```
pub struct Txn<'p> {
    pager: &'p Pager,
    writable: bool,
    finished: bool,
}

impl<'p> Txn<'p> {
    /// # Errors
    /// `Error::Misuse` if the pager already has a transaction open, or an
    /// error from starting the WAL snapshot.
    pub fn begin_read(pager: &'p Pager) -> Result<Self> {
        pager.begin_read()?;
        Ok(Self {
            pager,
            writable: false,
            finished: false,
        })
    }

    /// Start a write transaction. On an empty database this creates page 1
    /// holding an empty catalog.
    ///
    /// # Errors
    /// `Error::Busy` if another connection is writing or has committed
    /// since the snapshot was taken.
    pub fn begin_write(pager: &'p Pager) -> Result<Self> {
        pager.begin_read()?;
        let txn = Self {
            pager,
            writable: true,
            finished: false,
        };
        if pager.begin_write()? {
            let page1 = pager.get_page(PageNo::FIRST)?;
            MemPage::init(PageNo::FIRST, &mut pager.write(&page1)?, true);
            tracing::debug!("created catalog");
        }
        Ok(txn)
    }

    #[inline]
    pub fn pager(&self) -> &'p Pager {
        self.pager
    }

    #[inline]
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    fn require_write(&self) -> Result<()> {
        if self.writable {
            Ok(())
        } else {
            Err(Error::Misuse("operation requires a write transaction"))
        }
    }

    // ========================================================================
    // Public API: trees
    // ========================================================================

    /// Look up the tree called `name`, creating it if `create` is set.
    ///
    /// Returns `None` if the tree does not exist and was not created.
    ///
    /// # Errors
    /// - `Error::Misuse` when creating inside a read transaction
    /// - `Error::KeyTooLarge` if the name is too long to be a catalog key
    /// - `Error::Corrupt` if the catalog entry is malformed
    pub fn open_tree(&self, name: &str, create: bool) -> Result<Option<BTree>> {
        if self.pager.page_count() == 0 {
            // Nothing has been committed yet.
            return if create {
                self.require_write().map(|()| None)
            } else {
                Ok(None)
            };
        }

        let mut cursor = Cursor::new(self);
        cursor.move_to(&BTree::catalog(), name.as_bytes())?;
        if let Some(value) = cursor.value()? {
            return decode_root(name, &value).map(|root| Some(BTree::new(name, root)));
        }
        if !create {
            return Ok(None);
        }
        self.require_write()?;

        let root = {
            let handle = self.pager.allocate_page()?;
            MemPage::init(handle.no(), &mut self.pager.write(&handle)?, true);
            handle.no()
        };
        cursor.insert(name.as_bytes(), &root.0.to_be_bytes())?;
        tracing::debug!(tree = name, root = root.0, "created tree");
        Ok(Some(BTree::new(name, root)))
    }

    /// Remove `name` from the catalog. The tree's pages are not reclaimed.
    ///
    /// Returns `false` if no such tree exists.
    pub fn drop_tree(&self, name: &str) -> Result<bool> {
        self.require_write()?;
        let mut cursor = Cursor::new(self);
        cursor.move_to(&BTree::catalog(), name.as_bytes())?;
        let dropped = cursor.delete(name.as_bytes())?;
        if dropped {
            tracing::debug!(tree = name, "dropped tree");
        }
        Ok(dropped)
    }

    // ========================================================================
    // Public API: keys
    // ========================================================================

    pub fn get(&self, tree: &BTree, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut cursor = Cursor::new(self);
        cursor.move_to(tree, key)?;
        cursor.value()
    }

    /// Store `value` under `key`, replacing any existing value.
    ///
    /// # Errors
    /// - `Error::Misuse` in a read transaction
    /// - `Error::KeyTooLarge` if the key cannot be stored on a page
    pub fn write(&self, tree: &BTree, key: &[u8], value: &[u8]) -> Result<()> {
        self.require_write()?;
        let mut cursor = Cursor::new(self);
        cursor.move_to(tree, key)?;
        cursor.insert(key, value)
    }

    /// Remove `key`. Returns `false` if it was not present.
    pub fn delete(&self, tree: &BTree, key: &[u8]) -> Result<bool> {
        self.require_write()?;
        let mut cursor = Cursor::new(self);
        cursor.move_to(tree, key)?;
        cursor.delete(key)
    }

    // ========================================================================
    // Public API: completion
    // ========================================================================

    /// Commit a write transaction, or end a read transaction.
    ///
    /// On error the transaction is rolled back when dropped.
    pub fn commit(mut self) -> Result<()> {
        if self.writable {
            self.pager.commit()?;
        }
        self.finished = true;
        self.pager.end_read();
        Ok(())
    }

    pub fn rollback(mut self) -> Result<()> {
        self.finished = true;
        let result = if self.writable {
            self.pager.rollback()
        } else {
            Ok(())
        };
        self.pager.end_read();
        result
    }
}

impl Drop for Txn<'_> {
    fn drop(&mut self) {
        if !self.finished {
            // Rolls back a pending write transaction.
            self.pager.end_read();
        }
    }
}

impl std::fmt::Debug for Txn<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Txn")
            .field("writable", &self.writable)
            .field("finished", &self.finished)
            .finish()
    }
}

fn decode_root(name: &str, value: &[u8]) -> Result<PageNo> {
    let bytes: [u8; 4] = value
        .try_into()
        .map_err(|_| Error::corrupt(format!("bad catalog entry for tree {:?}", name)))?;
    let root = PageNo::new(u32::from_be_bytes(bytes));
    if !root.is_valid() {
        return Err(Error::corrupt(format!("tree {:?} has no root page", name)));
    }
    Ok(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::config::Config;
    use crate::pager::Engine;
    use tempfile::{tempdir, TempDir};

    fn setup() -> (TempDir, Engine) {
        let dir = tempdir().unwrap();
        let engine = Engine::new(Config::new().with_page_size(1024)).unwrap();
        (dir, engine)
    }

    #[test]
    fn test_read_on_empty_database() {
        let (dir, engine) = setup();
        let pager = engine.open_pager(dir.path().join("t.db")).unwrap();
        let txn = Txn::begin_read(&pager).unwrap();
        assert_eq!(txn.open_tree("t", false).unwrap(), None);
        assert!(matches!(txn.open_tree("t", true), Err(Error::Misuse(_))));
    }

    #[test]
    fn test_open_tree_creates_once() {
        let (dir, engine) = setup();
        let pager = engine.open_pager(dir.path().join("t.db")).unwrap();
        let txn = Txn::begin_write(&pager).unwrap();
        assert_eq!(txn.open_tree("a", false).unwrap(), None);

        let a = txn.open_tree("a", true).unwrap().unwrap();
        let b = txn.open_tree("b", true).unwrap().unwrap();
        assert_ne!(a.root(), b.root());
        assert_eq!(txn.open_tree("a", true).unwrap(), Some(a.clone()));
        txn.commit().unwrap();

        let txn = Txn::begin_read(&pager).unwrap();
        assert_eq!(txn.open_tree("a", false).unwrap(), Some(a));
        assert_eq!(txn.open_tree("b", false).unwrap().map(|t| t.root()), Some(b.root()));
    }

    #[test]
    fn test_write_get_delete() {
        let (dir, engine) = setup();
        let pager = engine.open_pager(dir.path().join("t.db")).unwrap();
        let txn = Txn::begin_write(&pager).unwrap();
        let tree = txn.open_tree("kv", true).unwrap().unwrap();

        txn.write(&tree, b"k1", b"one").unwrap();
        txn.write(&tree, b"k2", b"two").unwrap();
        assert_eq!(txn.get(&tree, b"k1").unwrap(), Some(b"one".to_vec()));

        txn.write(&tree, b"k1", b"uno").unwrap();
        assert_eq!(txn.get(&tree, b"k1").unwrap(), Some(b"uno".to_vec()));

        assert!(txn.delete(&tree, b"k2").unwrap());
        assert!(!txn.delete(&tree, b"k2").unwrap());
        assert_eq!(txn.get(&tree, b"k2").unwrap(), None);
    }

    #[test]
    fn test_drop_tree() {
        let (dir, engine) = setup();
        let pager = engine.open_pager(dir.path().join("t.db")).unwrap();
        let txn = Txn::begin_write(&pager).unwrap();
        txn.open_tree("gone", true).unwrap();
        assert!(txn.drop_tree("gone").unwrap());
        assert!(!txn.drop_tree("gone").unwrap());
        assert_eq!(txn.open_tree("gone", false).unwrap(), None);
    }

    #[test]
    fn test_rollback_and_drop_discard_writes() {
        let (dir, engine) = setup();
        let pager = engine.open_pager(dir.path().join("t.db")).unwrap();
        {
            let txn = Txn::begin_write(&pager).unwrap();
            let tree = txn.open_tree("t", true).unwrap().unwrap();
            txn.write(&tree, b"kept", b"1").unwrap();
            txn.commit().unwrap();
        }
        {
            let txn = Txn::begin_write(&pager).unwrap();
            let tree = txn.open_tree("t", false).unwrap().unwrap();
            txn.write(&tree, b"lost", b"2").unwrap();
            txn.rollback().unwrap();
        }
        {
            let txn = Txn::begin_write(&pager).unwrap();
            let tree = txn.open_tree("t", false).unwrap().unwrap();
            txn.write(&tree, b"dropped", b"3").unwrap();
        }

        let txn = Txn::begin_read(&pager).unwrap();
        let tree = txn.open_tree("t", false).unwrap().unwrap();
        assert_eq!(txn.get(&tree, b"kept").unwrap(), Some(b"1".to_vec()));
        assert_eq!(txn.get(&tree, b"lost").unwrap(), None);
        assert_eq!(txn.get(&tree, b"dropped").unwrap(), None);
    }

    #[test]
    fn test_key_too_large() {
        let (dir, engine) = setup();
        let pager = engine.open_pager(dir.path().join("t.db")).unwrap();
        let txn = Txn::begin_write(&pager).unwrap();
        let tree = txn.open_tree("t", true).unwrap().unwrap();

        // min_local for 1024-byte pages.
        let max = (1024 - 12) * 32 / 255 - 23;
        txn.write(&tree, &vec![b'k'; max], b"v").unwrap();
        match txn.write(&tree, &vec![b'k'; max + 1], b"v") {
            Err(Error::KeyTooLarge { size, max: limit }) => {
                assert_eq!(size, max + 1);
                assert_eq!(limit, max);
            }
            other => panic!("expected KeyTooLarge, got {:?}", other),
        }
    }

    #[test]
    fn test_read_transaction_rejects_writes() {
        let (dir, engine) = setup();
        let pager = engine.open_pager(dir.path().join("t.db")).unwrap();
        Txn::begin_write(&pager).unwrap().commit().unwrap();

        let txn = Txn::begin_read(&pager).unwrap();
        let tree = BTree::new("t", PageNo::new(2));
        assert!(matches!(txn.write(&tree, b"k", b"v"), Err(Error::Misuse(_))));
        assert!(matches!(txn.drop_tree("t"), Err(Error::Misuse(_))));
    }

    #[test]
    fn test_decode_root() {
        assert_eq!(decode_root("t", &[0, 0, 1, 0]).unwrap(), PageNo::new(256));
        assert!(matches!(decode_root("t", &[0, 0, 0, 0]), Err(Error::Corrupt(_))));
        assert!(matches!(decode_root("t", &[1, 2]), Err(Error::Corrupt(_))));
    }
}
