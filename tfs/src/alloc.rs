#[derive(Debug, PartialEq, Clone, Copy)]
pub enum State {
    Free,
    Used,
}

/// Tracks which slots of a fixed-size table are in use, one bit per slot. Both the
/// data block store and the inode table allocate out of one of these.
#[derive(Debug)]
pub struct Bitmap {
    bitmap: Vec<u64>,
    /// The maximum allocatable value. For example, with 50 inode slots available
    /// this value would be 50; bits past it are never handed out.
    cap: usize,
    used: usize,
}

impl Bitmap {
    pub fn new(cap: usize) -> Self {
        Self {
            bitmap: vec![0; (cap + 63) / 64],
            cap,
            used: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    pub fn used(&self) -> usize {
        self.used
    }

    /// Returns the state of a slot, or `None` when the slot lies outside the map.
    pub fn get(&self, nr: usize) -> Option<State> {
        if nr >= self.cap {
            return None;
        }
        // Grab the u64 containing the significant bit.
        let outer_offset = self.bitmap[nr / 64];

        let inner_offset = nr % 64;
        let mask = 0b01_u64 << inner_offset;
        match (outer_offset & mask) >> inner_offset {
            0 => Some(State::Free),
            1 => Some(State::Used),
            _ => unreachable!("Slot state returned a non 0 or 1 value. This likely indicates an error with bitmasking"),
        }
    }

    pub fn set_reserved(&mut self, nr: usize) {
        assert!(nr < self.cap, "slot {} outside bitmap of {}", nr, self.cap);
        if self.get(nr) == Some(State::Free) {
            self.bitmap[nr / 64] |= 0b01_u64 << (nr % 64);
            self.used += 1;
        }
    }

    pub fn set_free(&mut self, nr: usize) {
        assert!(nr < self.cap, "slot {} outside bitmap of {}", nr, self.cap);
        if self.get(nr) == Some(State::Used) {
            self.bitmap[nr / 64] &= !(0b01_u64 << (nr % 64));
            self.used -= 1;
        }
    }

    /// Reserves the lowest free slot and returns it. This is a first-fit policy: freed
    /// slots are handed out again before untouched ones further along the map.
    pub fn alloc(&mut self) -> Option<usize> {
        let nr = self
            .bitmap
            .iter()
            .enumerate()
            .find(|&(_, &bits)| bits != u64::MAX)
            .map(|(group, &bits)| group * 64 + bits.trailing_ones() as usize)
            .filter(|&nr| nr < self.cap)?;
        self.set_reserved(nr);
        Some(nr)
    }
}
