use std::sync::Mutex;

use crate::fs::{lock, Filesystem, FsError, Resource, Result, BLOCK_SIZE};
use crate::io::{BlockNumber, BlockStorage};

use log::debug;

#[derive(Debug, PartialEq)]
pub enum State {
    Free,
    Used,
}

/// One block worth of allocation bits. Bit `n` lives in byte `n / 8` at position
/// `n % 8` counting from the least significant bit, a set bit marks the object
/// as allocated. A 4K bitmap tracks up to 4096 * 8 objects.
pub struct Bitmap {
    bits: [u8; BLOCK_SIZE],
}

impl Bitmap {
    pub fn new() -> Self {
        Self {
            bits: [0; BLOCK_SIZE],
        }
    }

    /// Copies a bitmap out of a block sized buffer.
    pub fn parse(buf: &[u8]) -> Self {
        let mut map = Self::new();
        map.bits.copy_from_slice(&buf[..BLOCK_SIZE]);
        map
    }

    pub fn serialize(&self) -> &[u8] {
        &self.bits
    }

    pub fn get(&self, n: usize) -> State {
        match self.bits[n / 8] & (1 << (n % 8)) {
            0 => State::Free,
            _ => State::Used,
        }
    }

    pub fn set_reserved(&mut self, n: usize) {
        self.bits[n / 8] |= 1 << (n % 8);
    }

    pub fn set_free(&mut self, n: usize) {
        self.bits[n / 8] &= !(1 << (n % 8));
    }

    /// First fit scan, skipping whole bytes that are already full.
    pub fn find_free(&self) -> Option<usize> {
        self.bits
            .iter()
            .position(|&byte| byte != 0xFF)
            .map(|i| i * 8 + self.bits[i].trailing_ones() as usize)
    }
}

impl Default for Bitmap {
    fn default() -> Self {
        Self::new()
    }
}

/// Hands out the objects tracked by the bitmap stored in one block. The
/// read, mark and write back of the bitmap happen under `lock` so concurrent
/// callers never receive the same number.
pub struct BitmapAllocator {
    map_block: BlockNumber,
    /// Objects numbered at or beyond this are never handed out, the bitmap block
    /// can describe more objects than the image holds.
    limit: usize,
    resource: Resource,
    lock: Mutex<()>,
}

impl BitmapAllocator {
    pub fn new(map_block: BlockNumber, limit: usize, resource: Resource) -> Self {
        Self {
            map_block,
            limit,
            resource,
            lock: Mutex::new(()),
        }
    }

    pub fn allocate<T: BlockStorage>(&self, fs: &Filesystem<T>) -> Result<usize> {
        let _guard = lock(&self.lock);

        let mut buf = [0; BLOCK_SIZE];
        fs.bread(self.map_block, &mut buf)?;
        let mut map = Bitmap::parse(&buf);
        let n = match map.find_free() {
            Some(n) if n < self.limit => n,
            _ => return Err(FsError::AllocationExhausted(self.resource)),
        };
        map.set_reserved(n);
        fs.bwrite(self.map_block, map.serialize())?;

        debug!("allocated {} #{}", self.resource, n);
        Ok(n)
    }

    /// Marks objects `0..count` as allocated.
    pub fn reserve_prefix<T: BlockStorage>(&self, fs: &Filesystem<T>, count: usize) -> Result<()> {
        let _guard = lock(&self.lock);

        let mut buf = [0; BLOCK_SIZE];
        fs.bread(self.map_block, &mut buf)?;
        let mut map = Bitmap::parse(&buf);
        (0..count).for_each(|n| map.set_reserved(n));
        fs.bwrite(self.map_block, map.serialize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_bitmap_finds_first_bit() {
        let mut bmp = Bitmap::new();
        assert_eq!(bmp.find_free(), Some(0));

        bmp.set_reserved(0);
        assert_eq!(bmp.find_free(), Some(1));
    }

    #[test]
    fn find_free_skips_full_bytes_and_fills_holes() {
        let mut bmp = Bitmap::new();
        (0..19).for_each(|n| bmp.set_reserved(n));
        assert_eq!(bmp.find_free(), Some(19));

        bmp.set_free(3);
        assert_eq!(bmp.find_free(), Some(3));
    }

    #[test]
    fn full_bitmap_has_no_free_bit() {
        let bmp = Bitmap::parse(&[0xFF; BLOCK_SIZE]);
        assert_eq!(bmp.find_free(), None);
    }

    #[test]
    fn can_set_values_at_ends_of_bitmap() {
        let mut bmp = Bitmap::new();

        bmp.set_reserved(0);
        bmp.set_reserved(BLOCK_SIZE * 8 - 1);

        assert_eq!(bmp.get(0), State::Used);
        assert_eq!(bmp.get(1), State::Free);
        assert_eq!(bmp.get(BLOCK_SIZE * 8 - 1), State::Used);
        assert_eq!(bmp.serialize()[BLOCK_SIZE - 1], 0x80);
    }

    #[test]
    fn can_toggle_block_between_free_and_used() {
        let mut bmp = Bitmap::new();

        bmp.set_reserved(10);
        bmp.set_reserved(11);
        assert_eq!(bmp.get(10), State::Used);

        bmp.set_free(10);
        assert_eq!(bmp.get(10), State::Free);
        // Neighbouring bits are untouched.
        assert_eq!(bmp.get(11), State::Used);
    }

    #[test]
    #[should_panic]
    fn setting_bit_past_buffer_panics() {
        Bitmap::new().set_reserved(BLOCK_SIZE * 8);
    }

    #[test]
    fn parse_reads_back_serialized_bits() {
        let mut bmp = Bitmap::new();
        bmp.set_reserved(10);
        bmp.set_reserved(12);

        let read_bmp = Bitmap::parse(bmp.serialize());
        assert_eq!(read_bmp.serialize(), bmp.serialize());
        assert_eq!(read_bmp.serialize()[1], 0b0001_0100);
    }
}
