//! Cursor - search and modification of one B-tree.
//!
//! A cursor descends from the root to a leaf, keeping every page it passes
//! on a stack together with the child index it followed:
//!
//! ```text
//! stack[0]  root      index = child pointer taken
//! stack[1]  internal  index = child pointer taken
//!   ...
//! stack[n]  leaf      index = cell the location refers to
//! ```
//!
//! The stack is capped at [`TREE_MAX_DEPTH`]. Page numbers are read from
//! disk and may form a cycle; a descent past the cap fails with
//! [`Error::CursorOverflow`] instead of looping.
//!
//! Insertion works bottom-up along the stack: when a page is full it is
//! split, and the separator for the new left sibling is inserted into the
//! parent, which may split in turn. A full root moves its content into a
//! new child so the root page number never changes.

use crate::common::config::TREE_MAX_DEPTH;
use crate::common::{Error, PageNo, Result};
use crate::pager::{PageHandle, Pager};

use super::cell::{encode_internal_cell, encode_leaf_cell, parse_cell, set_overflow, PayloadLimits};
use super::mem_page::MemPage;
use super::tree::{read_overflow, write_overflow, BTree};
use super::txn::Txn;

/// Where the cursor rests relative to the key it searched for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Location {
    /// Not positioned, or positioned on an empty leaf.
    #[default]
    Invalid,
    /// The key sorts before the cell at the cursor.
    Left,
    /// The cell at the cursor holds the key.
    Equal,
    /// The key sorts after the cell at the cursor.
    Right,
}

struct Level<'t> {
    handle: PageHandle<'t>,
    page: MemPage,
    index: usize,
}

/// Traversal state over one tree, bound to a transaction.
///
/// # Example
/// ```no_run
/// use udb::{Config, Cursor, Engine, Location, Txn};
///
/// let engine = Engine::new(Config::default())?;
/// let pager = engine.open_pager("app.db")?;
/// let txn = Txn::begin_write(&pager)?;
/// let tree = txn.open_tree("users", true)?.expect("created");
///
/// let mut cursor = Cursor::new(&txn);
/// cursor.move_to(&tree, b"alice")?;
/// if cursor.location() != Location::Equal {
///     cursor.insert(b"alice", b"admin")?;
/// }
/// drop(cursor);
/// txn.commit()?;
/// # Ok::<(), udb::Error>(())
/// ```
pub struct Cursor<'t> {
    pager: &'t Pager,
    writable: bool,
    limits: PayloadLimits,
    root: PageNo,
    key: Vec<u8>,
    stack: Vec<Level<'t>>,
    location: Location,
}

impl<'t> Cursor<'t> {
    pub fn new(txn: &'t Txn<'_>) -> Self {
        let pager = txn.pager();
        Self {
            pager,
            writable: txn.is_writable(),
            limits: PayloadLimits::new(pager.page_size()),
            root: PageNo::NONE,
            key: Vec::new(),
            stack: Vec::with_capacity(TREE_MAX_DEPTH),
            location: Location::Invalid,
        }
    }

    /// Drop every page reference and forget the position.
    pub fn reset(&mut self) {
        self.stack.clear();
        self.root = PageNo::NONE;
        self.key.clear();
        self.location = Location::Invalid;
    }

    #[inline]
    pub fn location(&self) -> Location {
        self.location
    }

    /// Pages on the stack, root included.
    #[inline]
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// The page the cursor rests on.
    pub fn page_no(&self) -> Option<PageNo> {
        self.stack.last().map(|l| l.handle.no())
    }

    /// Index of the cell the location refers to.
    pub fn cell_index(&self) -> Option<usize> {
        match self.location {
            Location::Invalid => None,
            _ => self.stack.last().map(|l| l.index),
        }
    }

    // ========================================================================
    // Public API: search
    // ========================================================================

    /// Position the cursor on the leaf where `key` is or would be.
    ///
    /// # Errors
    /// - `Error::CursorOverflow` if the descent exceeds the depth bound
    /// - `Error::Corrupt` if a page on the path is malformed
    pub fn move_to(&mut self, tree: &BTree, key: &[u8]) -> Result<()> {
        if self.root != tree.root() {
            self.reset();
            self.root = tree.root();
        }
        self.key.clear();
        self.key.extend_from_slice(key);
        self.location = Location::Invalid;
        self.move_to_root()?;

        loop {
            let top = self.stack.len() - 1;
            let level = &mut self.stack[top];
            let result = {
                let data = level.handle.data();
                level.page.search(&data, key, &self.limits)?
            };
            level.index = result.index;
            self.location = result.location;
            if level.page.is_leaf() {
                return Ok(());
            }
            self.push(result.child)?;
        }
    }

    fn move_to_root(&mut self) -> Result<()> {
        if self.stack.first().is_some_and(|l| l.handle.no() == self.root) {
            self.stack.truncate(1);
            // The root may have changed since the last descent.
            let level = &mut self.stack[0];
            level.page = MemPage::parse(self.root, &level.handle.data())?;
            return Ok(());
        }
        self.stack.clear();
        self.push(self.root)
    }

    fn push(&mut self, no: PageNo) -> Result<()> {
        if self.stack.len() >= TREE_MAX_DEPTH {
            return Err(Error::CursorOverflow {
                page: no.0,
                depth: TREE_MAX_DEPTH,
            });
        }
        let handle = self.pager.get_page(no)?;
        let page = MemPage::parse(no, &handle.data())?;
        self.stack.push(Level {
            handle,
            page,
            index: 0,
        });
        Ok(())
    }

    /// Value of the cell at the cursor, if the cursor rests on its key.
    pub fn value(&self) -> Result<Option<Vec<u8>>> {
        if self.location != Location::Equal {
            return Ok(None);
        }
        let Some(level) = self.stack.last() else {
            return Ok(None);
        };
        let (mut value, overflow, remaining) = {
            let data = level.handle.data();
            let cell = level.page.cell(&data, level.index, &self.limits)?;
            let spilled = cell.data_size - cell.local_data as u64;
            (cell.local_data(&data).to_vec(), PageNo::new(cell.overflow), spilled)
        };
        if remaining > 0 {
            // The size comes from disk: it cannot exceed what every page
            // of the database could hold as overflow.
            let capacity = self.pager.page_count() as u64 * self.limits.overflow_capacity() as u64;
            if remaining > capacity {
                return Err(Error::corrupt(format!(
                    "value of {} overflow bytes on page {} exceeds the database",
                    remaining,
                    level.page.no()
                )));
            }
            read_overflow(self.pager, overflow, remaining as usize, &self.limits, &mut value)?;
        }
        Ok(Some(value))
    }

    // ========================================================================
    // Public API: modification
    // ========================================================================

    fn check_writable(&self, key: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(Error::Misuse("modification through a read transaction"));
        }
        if self.stack.is_empty() || self.key != key {
            return Err(Error::Misuse("cursor is not positioned on the key"));
        }
        Ok(())
    }

    /// Store `value` under `key`, replacing any existing value.
    ///
    /// The cursor must have been positioned with [`move_to`](Self::move_to)
    /// on the same key. It is reset afterwards.
    ///
    /// # Errors
    /// - `Error::KeyTooLarge` if the key cannot be stored on a page
    /// - `Error::CursorOverflow` if a root split would exceed the depth bound
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_writable(key)?;
        if key.len() > self.limits.max_key() {
            return Err(Error::KeyTooLarge {
                size: key.len(),
                max: self.limits.max_key(),
            });
        }

        let (mut cell, spill) = encode_leaf_cell(key, value, &self.limits);
        if let Some(from) = spill {
            let first = write_overflow(self.pager, &value[from..], &self.limits)?;
            set_overflow(&mut cell, first.0);
        }

        let leaf = self.stack.len() - 1;
        let index = match self.location {
            Location::Equal => {
                // Overflow pages of the old value are not reclaimed.
                self.drop_cell_at(leaf)?;
                self.stack[leaf].index
            }
            Location::Right => self.stack[leaf].index + 1,
            Location::Left | Location::Invalid => self.stack[leaf].index,
        };
        let result = self.insert_at(leaf, index, cell);
        self.reset();
        result
    }

    /// Remove the cell the cursor rests on. Returns `false` if the cursor
    /// is not on `key`'s cell. The cursor is reset.
    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        self.check_writable(key)?;
        if self.location != Location::Equal {
            return Ok(false);
        }
        let leaf = self.stack.len() - 1;
        let result = self.drop_cell_at(leaf);
        self.reset();
        result.map(|()| true)
    }

    fn drop_cell_at(&mut self, level: usize) -> Result<()> {
        let level = &mut self.stack[level];
        let mut data = self.pager.write(&level.handle)?;
        level.page.drop_cell(&mut data, level.index, &self.limits)
    }

    /// Insert `cell` at `index` of the page at stack `level`, splitting
    /// pages upward as needed.
    fn insert_at(&mut self, mut level: usize, mut index: usize, mut cell: Vec<u8>) -> Result<()> {
        loop {
            {
                let current = &mut self.stack[level];
                let mut data = self.pager.write(&current.handle)?;
                if current.page.insert_cell(&mut data, index, &cell)? {
                    return Ok(());
                }
            }
            if level == 0 {
                self.split_root()?;
                level = 1;
                continue;
            }
            cell = self.split(level, index, cell)?;
            level -= 1;
            index = self.stack[level].index;
        }
    }

    /// Move the root's content into a new child, leaving the root an
    /// internal page whose only pointer is that child.
    fn split_root(&mut self) -> Result<()> {
        if self.stack.len() >= TREE_MAX_DEPTH {
            return Err(Error::CursorOverflow {
                page: self.root.0,
                depth: TREE_MAX_DEPTH,
            });
        }
        let child = self.pager.allocate_page()?;
        let root = &mut self.stack[0];
        let cells = root.page.cells(&root.handle.data(), &self.limits)?;
        let child_page = MemPage::rebuild(
            child.no(),
            &mut self.pager.write(&child)?,
            root.page.is_leaf(),
            &cells,
            root.page.right_child(),
        )?;
        {
            let mut data = self.pager.write(&root.handle)?;
            let mut page = MemPage::init(root.page.no(), &mut data, false);
            page.set_right_child(&mut data, child.no());
            root.page = page;
        }
        tracing::trace!(root = self.root.0, child = child.no().0, "root split");

        let index = std::mem::replace(&mut root.index, 0);
        self.stack.insert(
            1,
            Level {
                handle: child,
                page: child_page,
                index,
            },
        );
        Ok(())
    }

    /// Split the page at stack `level`, which cannot hold `cell` at
    /// `index`. The lower keys move to a new left sibling; the page keeps
    /// the rest. Returns the parent cell pointing to the new sibling.
    fn split(&mut self, level: usize, index: usize, cell: Vec<u8>) -> Result<Vec<u8>> {
        let sibling = self.pager.allocate_page()?;
        let current = &mut self.stack[level];
        let is_leaf = current.page.is_leaf();
        let mut cells = current.page.cells(&current.handle.data(), &self.limits)?;
        cells.insert(index, cell);

        let k = split_point(&cells, is_leaf);
        let (left, right, left_child, separator) = if is_leaf {
            let last = parse_cell(&cells[k - 1], 0, true, &self.limits)?;
            let separator = last.key(&cells[k - 1]).to_vec();
            (&cells[..k], &cells[k..], PageNo::NONE, separator)
        } else {
            let up = parse_cell(&cells[k], 0, false, &self.limits)?;
            let separator = up.key(&cells[k]).to_vec();
            (&cells[..k], &cells[k + 1..], PageNo::new(up.left_child), separator)
        };

        MemPage::rebuild(sibling.no(), &mut self.pager.write(&sibling)?, is_leaf, left, left_child)?;
        let right_child = current.page.right_child();
        current.page = MemPage::rebuild(
            current.page.no(),
            &mut self.pager.write(&current.handle)?,
            is_leaf,
            right,
            right_child,
        )?;
        tracing::trace!(
            page = current.page.no().0,
            sibling = sibling.no().0,
            left = left.len(),
            right = right.len(),
            "page split"
        );
        Ok(encode_internal_cell(sibling.no().0, &separator))
    }
}

/// Number of cells for the left page so both halves hold about the same
/// number of bytes. Leaves keep at least one cell on each side; internal
/// pages also need a cell to move up.
fn split_point(cells: &[Vec<u8>], is_leaf: bool) -> usize {
    let total: usize = cells.iter().map(|c| c.len() + 2).sum();
    let mut k = 0;
    let mut acc = 0;
    while k < cells.len() && acc < total / 2 {
        acc += cells[k].len() + 2;
        k += 1;
    }
    let max = if is_leaf {
        cells.len() - 1
    } else {
        cells.len().saturating_sub(2).max(1)
    };
    k.clamp(1, max)
}

impl std::fmt::Debug for Cursor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("root", &self.root)
            .field("depth", &self.stack.len())
            .field("page", &self.page_no())
            .field("location", &self.location)
            .finish()
    }
}
