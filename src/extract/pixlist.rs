//! Fixed-capacity pixel record arena used by the streaming scan.
//!
//! Above-threshold pixels are held in singly linked chains while their
//! object is still open; completed or discarded chains are spliced back
//! onto the free chain in O(1). The arena never grows: exhausting it is a
//! hard error so that runaway detections (unsubtracted background, absurd
//! threshold) fail loudly instead of eating memory.

use crate::error::SepError;

/// Chain terminator / "no pixel" sentinel.
pub const NONE: i32 = -1;

/// One detected pixel.
#[derive(Debug, Clone, Copy, Default)]
pub struct PixelRecord {
    /// Image column.
    pub x: i32,
    /// Image row.
    pub y: i32,
    /// Value in the unconvolved (measurement) image.
    pub value: f32,
    /// Value in the filtered (detection) image; equals `value` when no
    /// kernel is configured.
    pub cdvalue: f32,
    /// Pixel variance, 0 when the image has no noise model.
    pub var: f32,
    /// Detection threshold that applied at this pixel.
    pub thresh: f32,
    /// Next record in the chain, or [`NONE`].
    pub next: i32,
}

/// Slab of pixel records with an internal free chain.
pub struct PixelArena {
    records: Vec<PixelRecord>,
    free_first: i32,
    free_last: i32,
}

impl PixelArena {
    /// Allocate an arena of `capacity` records, all free.
    pub fn new(capacity: usize) -> PixelArena {
        let capacity = capacity.max(2);
        let mut records = vec![PixelRecord::default(); capacity];
        for (i, rec) in records.iter_mut().enumerate() {
            rec.next = if i + 1 < capacity { (i + 1) as i32 } else { NONE };
        }
        PixelArena {
            records,
            free_first: 0,
            free_last: (capacity - 1) as i32,
        }
    }

    /// Take one record off the free chain and store `rec` in it.
    ///
    /// Fails when the free chain is down to its last record, leaving the
    /// arena in a state the caller must treat as fatal for this run.
    pub fn alloc(&mut self, rec: PixelRecord) -> Result<i32, SepError> {
        let idx = self.free_first;
        self.free_first = self.records[idx as usize].next;
        if self.free_first == self.free_last || self.free_first == NONE {
            return Err(SepError::PixelStackFull {
                capacity: self.records.len(),
            });
        }
        self.records[idx as usize] = PixelRecord { next: NONE, ..rec };
        Ok(idx)
    }

    /// Borrow a record.
    pub fn get(&self, idx: i32) -> &PixelRecord {
        &self.records[idx as usize]
    }

    /// Link `from` to `to`, for chain concatenation.
    pub fn link(&mut self, from: i32, to: i32) {
        self.records[from as usize].next = to;
    }

    /// Splice the whole chain `first..=last` back onto the free chain.
    pub fn free_chain(&mut self, first: i32, last: i32) {
        if first == NONE {
            return;
        }
        self.records[last as usize].next = self.free_first;
        self.free_first = first;
    }

    /// Copy the chain starting at `first` into an owned vector, in chain
    /// order, with `next` links cleared.
    pub fn collect_chain(&self, first: i32) -> Vec<PixelRecord> {
        let mut out = Vec::new();
        let mut i = first;
        while i != NONE {
            let mut rec = self.records[i as usize];
            i = rec.next;
            rec.next = NONE;
            out.push(rec);
        }
        out
    }
}
