//! WAL index - maps page numbers to the frames that hold them.
//!
//! Frames are grouped into hash blocks of `npage` consecutive frames. Each
//! block keeps the page number of every frame it covers plus an open
//! addressing hash table with twice as many slots:
//!
//! ```text
//! block b covers frames b*npage+1 ..= (b+1)*npage
//!
//! page_nos: [pgno of frame 1][pgno of frame 2] ... [pgno of frame npage]
//! slots:    [0 | k]  k is a 1-based index into page_nos, 0 = empty
//!           hash(pgno) = pgno * 383 mod nslot, linear probing
//! ```
//!
//! A lookup walks blocks from newest to oldest and returns the newest frame
//! for the page inside the caller's `[min_frame, max_frame]` window.

use crate::common::{Error, Result};

/// Frames per hash block.
pub const WAL_NPAGE: usize = 4096;

const HASH_PRIME: u64 = 383;

/// One hash block.
#[derive(Debug, Clone)]
struct HashBlock {
    page_nos: Vec<u32>,
    slots: Vec<u16>,
}

impl HashBlock {
    fn new(npage: usize) -> Self {
        Self {
            page_nos: vec![0; npage],
            slots: vec![0; npage * 2],
        }
    }

    fn clear(&mut self) {
        self.page_nos.fill(0);
        self.slots.fill(0);
    }
}

/// The in-memory WAL index.
#[derive(Debug, Clone)]
pub struct WalIndex {
    npage: usize,
    blocks: Vec<HashBlock>,
}

impl WalIndex {
    pub fn new() -> Self {
        Self::with_block_size(WAL_NPAGE)
    }

    /// An index with `npage` frames per block. `npage` must be a power of
    /// two no larger than 16384 so slot values fit a `u16`.
    ///
    /// # Panics
    /// Panics if `npage` is not a power of two in that range.
    pub fn with_block_size(npage: usize) -> Self {
        assert!(
            npage.is_power_of_two() && npage <= 16384,
            "hash block size must be a power of two <= 16384"
        );
        Self {
            npage,
            blocks: Vec::new(),
        }
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        self.npage
    }

    #[inline]
    fn nslot(&self) -> usize {
        self.npage * 2
    }

    #[inline]
    fn hash(&self, page_no: u32) -> usize {
        ((page_no as u64 * HASH_PRIME) as usize) & (self.nslot() - 1)
    }

    #[inline]
    fn next_slot(&self, slot: usize) -> usize {
        (slot + 1) & (self.nslot() - 1)
    }

    /// Block number and 1-based position inside the block for `frame`.
    #[inline]
    fn locate(&self, frame: u32) -> (usize, usize) {
        let zero_based = frame as usize - 1;
        (zero_based / self.npage, zero_based % self.npage + 1)
    }

    /// Record that `frame` holds `page_no`.
    ///
    /// Frames are appended in order. Appending a frame that was already
    /// recorded (after a rollback or a restart) first discards every entry
    /// at or after it.
    ///
    /// # Errors
    /// Returns `Error::Corrupt` if the block's hash table has no free slot.
    pub fn append(&mut self, frame: u32, page_no: u32) -> Result<()> {
        debug_assert!(frame > 0 && page_no > 0);
        let (block_no, k) = self.locate(frame);

        while self.blocks.len() <= block_no {
            self.blocks.push(HashBlock::new(self.npage));
        }
        if k == 1 {
            self.blocks[block_no].clear();
        } else if self.blocks[block_no].page_nos[k - 1] != 0 {
            self.cleanup_block(block_no, k - 1);
        }

        let nslot = self.nslot();
        let mut slot = self.hash(page_no);
        let mut probes = 0;
        while self.blocks[block_no].slots[slot] != 0 {
            probes += 1;
            if probes > nslot {
                return Err(Error::corrupt("wal index hash block is full"));
            }
            slot = self.next_slot(slot);
        }

        let block = &mut self.blocks[block_no];
        block.page_nos[k - 1] = page_no;
        block.slots[slot] = k as u16;
        Ok(())
    }

    /// Newest frame holding `page_no` with `min_frame <= frame <= max_frame`.
    ///
    /// # Errors
    /// Returns `Error::Corrupt` if a probe sequence never reaches an empty
    /// slot.
    pub fn find_frame(&self, page_no: u32, min_frame: u32, max_frame: u32) -> Result<Option<u32>> {
        if max_frame == 0 || min_frame > max_frame {
            return Ok(None);
        }
        let min_frame = min_frame.max(1);
        let nslot = self.nslot();
        let (last_block, _) = self.locate(max_frame);
        let (first_block, _) = self.locate(min_frame);
        let Some(newest) = self.blocks.len().checked_sub(1) else {
            return Ok(None);
        };

        for block_no in (first_block..=last_block.min(newest)).rev() {
            let block = &self.blocks[block_no];
            let base = (block_no * self.npage) as u32;
            let mut best = None;

            let mut slot = self.hash(page_no);
            let mut probes = 0;
            while block.slots[slot] != 0 {
                let k = block.slots[slot] as u32;
                let frame = base + k;
                if frame >= min_frame
                    && frame <= max_frame
                    && block.page_nos[k as usize - 1] == page_no
                {
                    best = best.max(Some(frame));
                }
                probes += 1;
                if probes > nslot {
                    return Err(Error::corrupt("wal index probe did not terminate"));
                }
                slot = self.next_slot(slot);
            }

            if best.is_some() {
                return Ok(best);
            }
        }
        Ok(None)
    }

    /// Page number recorded for `frame`, if any.
    pub fn page_at(&self, frame: u32) -> Option<u32> {
        if frame == 0 {
            return None;
        }
        let (block_no, k) = self.locate(frame);
        self.blocks
            .get(block_no)
            .map(|b| b.page_nos[k - 1])
            .filter(|&p| p != 0)
    }

    /// Forget every frame after `max_frame`.
    pub fn truncate(&mut self, max_frame: u32) {
        if max_frame == 0 {
            self.clear();
            return;
        }
        let (block_no, k) = self.locate(max_frame);
        self.blocks.truncate(block_no + 1);
        if let Some(block) = self.blocks.get(block_no) {
            if block.page_nos[k..].iter().any(|&p| p != 0) {
                self.cleanup_block(block_no, k);
            }
        }
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.blocks.clear();
    }

    /// Remove entries with 1-based position greater than `keep` from a block.
    fn cleanup_block(&mut self, block_no: usize, keep: usize) {
        let block = &mut self.blocks[block_no];
        for slot in block.slots.iter_mut() {
            if *slot as usize > keep {
                *slot = 0;
            }
        }
        block.page_nos[keep..].fill(0);

        // Clearing slots can split probe chains. Rehash the survivors so
        // every remaining entry is reachable from its home slot again.
        let survivors: Vec<(usize, u32)> = block.page_nos[..keep]
            .iter()
            .enumerate()
            .filter(|(_, &p)| p != 0)
            .map(|(i, &p)| (i + 1, p))
            .collect();
        block.slots.fill(0);
        for (k, page_no) in survivors {
            let mut slot = self.hash(page_no);
            let block = &mut self.blocks[block_no];
            while block.slots[slot] != 0 {
                slot = (slot + 1) & (block.slots.len() - 1);
            }
            block.slots[slot] = k as u16;
        }
    }

    #[cfg(test)]
    pub(crate) fn poison_block(&mut self, block_no: usize) {
        let block = &mut self.blocks[block_no];
        for (i, slot) in block.slots.iter_mut().enumerate() {
            *slot = (i % self.npage) as u16 + 1;
        }
    }
}

impl Default for WalIndex {
    fn default() -> Self {
        Self::new()
    }
}
