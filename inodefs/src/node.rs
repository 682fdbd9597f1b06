use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard};

use crate::fs::{
  lock, Filesystem, FsError, Result, BLOCK_SIZE, CACHE_CAPACITY, INODES_PER_BLOCK,
  INODE_COUNT, INODE_FIRST_BLOCK, INODE_PTR_COUNT, INODE_SIZE, INODE_TYPE_DIRECTORY,
};
use crate::io::{BlockNumber, BlockStorage};

use log::{debug, error, warn};
use zerocopy::{AsBytes, FromBytes};

/// The in-memory form of an inode.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Inode {
  /// The total size of the file in bytes.
  pub size: u32,
  /// The id of the owning user.
  pub owner_id: u16,
  /// Permission bits, stored but not enforced.
  pub permissions: u8,
  /// Object type, [`INODE_TYPE_DIRECTORY`] for directories.
  pub flags: u8,
  /// The number of links to this file.
  pub link_count: u8,
  /// Data block numbers, 0 marks an unused pointer. There is no indirection so a
  /// file spans at most `INODE_PTR_COUNT` blocks.
  pub block_ptr: [u16; INODE_PTR_COUNT],
}

impl Inode {
  pub fn is_dir(&self) -> bool {
    self.flags == INODE_TYPE_DIRECTORY
  }
}

#[repr(C)]
#[derive(AsBytes, FromBytes, Copy, Clone)]
/// On-disk encoding of an inode, big endian. This structure __must be exactly
/// 64 bytes.__
pub struct DiskInode {
  size: [u8; 4],
  owner_id: [u8; 2],
  permissions: u8,
  flags: u8,
  link_count: u8,
  block_ptr: [[u8; 2]; INODE_PTR_COUNT],
  reserved: [u8; 23],
}

impl DiskInode {
  fn zeroed() -> Self {
    Self {
      size: [0; 4],
      owner_id: [0; 2],
      permissions: 0,
      flags: 0,
      link_count: 0,
      block_ptr: [[0; 2]; INODE_PTR_COUNT],
      reserved: [0; 23],
    }
  }

  fn decode(bytes: &[u8]) -> Self {
    let mut raw = Self::zeroed();
    raw.as_bytes_mut().copy_from_slice(&bytes[..INODE_SIZE]);
    raw
  }
}

impl From<&DiskInode> for Inode {
  fn from(raw: &DiskInode) -> Self {
    let mut block_ptr = [0; INODE_PTR_COUNT];
    for (ptr, bytes) in block_ptr.iter_mut().zip(raw.block_ptr.iter()) {
      *ptr = u16::from_be_bytes(*bytes);
    }
    Inode {
      size: u32::from_be_bytes(raw.size),
      owner_id: u16::from_be_bytes(raw.owner_id),
      permissions: raw.permissions,
      flags: raw.flags,
      link_count: raw.link_count,
      block_ptr,
    }
  }
}

impl From<&Inode> for DiskInode {
  fn from(inode: &Inode) -> Self {
    let mut raw = DiskInode::zeroed();
    raw.size = inode.size.to_be_bytes();
    raw.owner_id = inode.owner_id.to_be_bytes();
    raw.permissions = inode.permissions;
    raw.flags = inode.flags;
    raw.link_count = inode.link_count;
    for (bytes, ptr) in raw.block_ptr.iter_mut().zip(inode.block_ptr.iter()) {
      *bytes = ptr.to_be_bytes();
    }
    raw
  }
}

/// Returns the inode table block holding `inode_num` and the byte offset of the
/// inode inside it.
pub fn inode_location(inode_num: u32) -> (BlockNumber, usize) {
  let inode_num = inode_num as usize;
  (
    inode_num / INODES_PER_BLOCK + INODE_FIRST_BLOCK,
    (inode_num % INODES_PER_BLOCK) * INODE_SIZE,
  )
}

#[derive(Clone, Copy)]
struct SlotMeta {
  ref_count: u32,
  /// The inode this slot caches. Survives the count dropping to zero so a quick
  /// re-get finds the copy, until the slot is claimed for another inode.
  inode_num: Option<u32>,
}

impl SlotMeta {
  const EMPTY: SlotMeta = SlotMeta {
    ref_count: 0,
    inode_num: None,
  };
}

struct Payload {
  inode: Inode,
  /// Which inode `inode` was read from disk for. A slot bound to a new inode
  /// is loaded by whoever locks it first.
  loaded: Option<u32>,
}

/// Fixed table of in-core inodes. The slot table (bindings and reference counts)
/// is guarded by one lock, each slot's content by its own.
pub(crate) struct InodeCache {
  table: Mutex<[SlotMeta; CACHE_CAPACITY]>,
  slots: Vec<Mutex<Payload>>,
}

impl InodeCache {
  pub fn new() -> Self {
    Self {
      table: Mutex::new([SlotMeta::EMPTY; CACHE_CAPACITY]),
      slots: (0..CACHE_CAPACITY)
        .map(|_| {
          Mutex::new(Payload {
            inode: Inode::default(),
            loaded: None,
          })
        })
        .collect(),
    }
  }

  /// Takes a reference on the slot bound to `inode_num`, binding a free slot if
  /// there is none. Never touches the disk, but rebinding a slot waits for the
  /// write-back of its previous inode.
  fn claim(&self, inode_num: u32) -> Result<usize> {
    let mut table = lock(&self.table);

    if let Some(slot) = table.iter().position(|m| m.inode_num == Some(inode_num)) {
      table[slot].ref_count += 1;
      return Ok(slot);
    }

    // Prefer slots that never cached anything so recently released copies
    // stay around for a while.
    let slot = table
      .iter()
      .position(|m| m.ref_count == 0 && m.inode_num.is_none())
      .or_else(|| table.iter().position(|m| m.ref_count == 0))
      .ok_or(FsError::CacheExhausted)?;
    if table[slot].inode_num.is_some() {
      // The previous inode may still be writing back. Its binding must outlive
      // the write, or a concurrent iget of it would reload a stale copy.
      drop(lock(&self.slots[slot]));
    }
    table[slot] = SlotMeta {
      ref_count: 1,
      inode_num: Some(inode_num),
    };
    Ok(slot)
  }

  /// Drops one reference. When it was the last one the slot content is
  /// returned locked, so nobody can rebind and reload the slot before the caller
  /// wrote it back.
  fn release(&self, slot: usize, inode_num: u32) -> Option<MutexGuard<'_, Payload>> {
    let mut table = lock(&self.table);
    let meta = &mut table[slot];
    if meta.inode_num != Some(inode_num) || meta.ref_count == 0 {
      warn!("release of inode {} found slot {} not holding it", inode_num, slot);
      return None;
    }

    meta.ref_count -= 1;
    if meta.ref_count > 0 {
      return None;
    }
    let payload = lock(&self.slots[slot]);
    drop(table);
    Some(payload)
  }

  fn evict_unused(&self) {
    let mut table = lock(&self.table);
    for (meta, payload) in table.iter_mut().zip(self.slots.iter()) {
      if meta.ref_count == 0 {
        meta.inode_num = None;
        lock(payload).loaded = None;
      }
    }
  }

  fn active(&self) -> usize {
    lock(&self.table).iter().filter(|m| m.ref_count > 0).count()
  }
}

/// A live reference to a cached inode. All references to the same inode share
/// one copy, and the copy is written back to disk when the last reference is
/// released, either through [`InodeRef::put`] or by dropping it.
pub struct InodeRef<'fs, T: BlockStorage> {
  fs: &'fs Filesystem<T>,
  slot: usize,
  inode_num: u32,
  released: bool,
}

impl<'fs, T: BlockStorage> InodeRef<'fs, T> {
  pub fn inode_num(&self) -> u32 {
    self.inode_num
  }

  /// Locks the shared copy for reading or modification. Other holders of the
  /// same inode block until the guard is dropped, so don't `iget` this inode
  /// again while holding it.
  pub fn lock(&self) -> InodeGuard<'_> {
    InodeGuard {
      payload: lock(&self.fs.cache.slots[self.slot]),
    }
  }

  /// A snapshot of the current in-core fields.
  pub fn get(&self) -> Inode {
    *self.lock()
  }

  /// Releases the reference, writing the inode back if this was the last one.
  pub fn put(mut self) -> Result<()> {
    self.released = true;
    self.fs.release_slot(self.slot, self.inode_num)
  }

  fn load(&self) -> Result<()> {
    let mut payload = lock(&self.fs.cache.slots[self.slot]);
    if payload.loaded != Some(self.inode_num) {
      payload.loaded = None;
      payload.inode = self.fs.read_inode(self.inode_num)?;
      payload.loaded = Some(self.inode_num);
      debug!("loaded inode {} into slot {}", self.inode_num, self.slot);
    }
    Ok(())
  }
}

impl<'fs, T: BlockStorage> Drop for InodeRef<'fs, T> {
  fn drop(&mut self) {
    if self.released {
      return;
    }
    if let Err(e) = self.fs.release_slot(self.slot, self.inode_num) {
      error!("failed to write back inode {}: {}", self.inode_num, e);
    }
  }
}

impl<'fs, T: BlockStorage> fmt::Debug for InodeRef<'fs, T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("InodeRef")
      .field("inode_num", &self.inode_num)
      .field("slot", &self.slot)
      .finish()
  }
}

/// Exclusive access to a cached inode, see [`InodeRef::lock`].
pub struct InodeGuard<'a> {
  payload: MutexGuard<'a, Payload>,
}

impl<'a> Deref for InodeGuard<'a> {
  type Target = Inode;

  fn deref(&self) -> &Inode {
    &self.payload.inode
  }
}

impl<'a> DerefMut for InodeGuard<'a> {
  fn deref_mut(&mut self) -> &mut Inode {
    &mut self.payload.inode
  }
}

impl<T: BlockStorage> Filesystem<T> {
  /// Reads an inode straight from the inode table, bypassing the cache.
  pub fn read_inode(&self, inode_num: u32) -> Result<Inode> {
    let (blocknr, offset) = inode_location(inode_num);
    let mut block = [0; BLOCK_SIZE];
    self.bread(blocknr, &mut block)?;
    Ok(Inode::from(&DiskInode::decode(&block[offset..])))
  }

  /// Writes an inode straight to the inode table, bypassing the cache. The other
  /// inodes sharing the table block are preserved.
  pub fn write_inode(&self, inode_num: u32, inode: &Inode) -> Result<()> {
    let (blocknr, offset) = inode_location(inode_num);
    let raw = DiskInode::from(inode);
    self.bupdate(blocknr, |block| {
      block[offset..offset + INODE_SIZE].copy_from_slice(raw.as_bytes())
    })
  }

  /// Returns a reference to the in-core copy of `inode_num`, loading it from
  /// disk unless another holder already has it.
  pub fn iget(&self, inode_num: u32) -> Result<InodeRef<'_, T>> {
    if inode_num as usize >= INODE_COUNT {
      return Err(FsError::InvalidArgument(format!(
        "inode {} is outside the inode table",
        inode_num
      )));
    }

    let slot = self.cache.claim(inode_num)?;
    let handle = InodeRef {
      fs: self,
      slot,
      inode_num,
      released: false,
    };
    // A failed load drops the handle, which releases the slot again.
    handle.load()?;
    Ok(handle)
  }

  /// Releases a reference, see [`InodeRef::put`].
  pub fn iput(&self, inode: InodeRef<'_, T>) -> Result<()> {
    inode.put()
  }

  /// Allocates a fresh inode with every field zeroed. The caller holds the only
  /// reference.
  pub fn ialloc(&self) -> Result<InodeRef<'_, T>> {
    let inode_num = self.inodes.allocate(self)? as u32;
    let handle = self.iget(inode_num).map_err(|e| {
      warn!("inode {} allocated but could not be cached: {}", inode_num, e);
      e
    })?;

    {
      let mut inode = handle.lock();
      *inode = Inode::default();
      self.write_inode(inode_num, &inode)?;
    }
    Ok(handle)
  }

  /// Forgets every cached inode that nobody references, so the next `iget`
  /// reads it from disk.
  pub fn evict_unused(&self) {
    self.cache.evict_unused()
  }

  /// Number of inodes currently referenced.
  pub fn cached_inodes(&self) -> usize {
    self.cache.active()
  }

  fn release_slot(&self, slot: usize, inode_num: u32) -> Result<()> {
    if let Some(payload) = self.cache.release(slot, inode_num) {
      if payload.loaded == Some(inode_num) {
        self.write_inode(inode_num, &payload.inode)?;
        debug!("wrote back inode {} from slot {}", inode_num, slot);
      }
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::io::{FileBlockEmulator, FileBlockEmulatorBuilder};

  fn create_test_fs() -> Filesystem<FileBlockEmulator> {
    let dev = tempfile::tempfile().unwrap();
    let dev = FileBlockEmulatorBuilder::from(dev)
      .with_block_count(64)
      .build()
      .expect("Could not initialize disk emulator.");
    Filesystem::create(dev).unwrap()
  }

  fn sample_inode() -> Inode {
    let mut block_ptr = [0; INODE_PTR_COUNT];
    for (i, ptr) in block_ptr.iter_mut().enumerate() {
      *ptr = 0x100 + i as u16;
    }
    Inode {
      size: 1234,
      owner_id: 42,
      permissions: 7,
      flags: 1,
      link_count: 2,
      block_ptr,
    }
  }

  #[test]
  fn disk_inode_is_64_bytes() {
    assert_eq!(std::mem::size_of::<DiskInode>(), INODE_SIZE);
  }

  #[test]
  fn disk_inode_fields_are_big_endian_at_fixed_offsets() {
    let raw = DiskInode::from(&sample_inode());
    let bytes = raw.as_bytes();
    assert_eq!(&bytes[0..4], &[0, 0, 0x04, 0xD2]);
    assert_eq!(&bytes[4..6], &[0, 42]);
    assert_eq!(bytes[6], 7);
    assert_eq!(bytes[7], 1);
    assert_eq!(bytes[8], 2);
    assert_eq!(&bytes[9..11], &[0x01, 0x00]);
    assert_eq!(&bytes[39..41], &[0x01, 0x0F]);
    assert!(bytes[41..].iter().all(|&b| b == 0));
  }

  #[test]
  fn inode_location_follows_table_layout() {
    assert_eq!(inode_location(0), (INODE_FIRST_BLOCK, 0));
    assert_eq!(inode_location(5), (INODE_FIRST_BLOCK, 5 * INODE_SIZE));
    assert_eq!(inode_location(64), (INODE_FIRST_BLOCK + 1, 0));
    assert_eq!(inode_location(130), (INODE_FIRST_BLOCK + 2, 2 * INODE_SIZE));
  }

  #[test]
  fn written_inode_reads_back_through_evicted_cache() {
    let fs = create_test_fs();
    let inode = sample_inode();
    fs.write_inode(5, &inode).unwrap();

    fs.evict_unused();
    let out = fs.iget(5).unwrap();
    assert_eq!(out.get(), inode);
  }

  #[test]
  fn writing_inode_preserves_block_neighbours() {
    let fs = create_test_fs();
    let first = sample_inode();
    let second = Inode {
      size: 77,
      ..Inode::default()
    };
    fs.write_inode(9, &first).unwrap();
    fs.write_inode(10, &second).unwrap();

    assert_eq!(fs.read_inode(9).unwrap(), first);
    assert_eq!(fs.read_inode(10).unwrap(), second);
  }

  #[test]
  fn ialloc_hands_out_increasing_numbers() {
    let fs = create_test_fs();
    // The root directory owns inode 0.
    let n1 = fs.ialloc().unwrap();
    let n2 = fs.ialloc().unwrap();
    let n3 = fs.ialloc().unwrap();
    assert_eq!(n1.inode_num(), 1);
    assert_eq!(n2.inode_num(), 2);
    assert_eq!(n3.inode_num(), 3);
    assert_eq!(n1.get(), Inode::default());
  }

  #[test]
  fn ialloc_zeroes_stale_disk_content() {
    let fs = create_test_fs();
    fs.write_inode(1, &sample_inode()).unwrap();

    let fresh = fs.ialloc().unwrap();
    assert_eq!(fresh.inode_num(), 1);
    assert_eq!(fresh.get(), Inode::default());
    assert_eq!(fs.read_inode(1).unwrap(), Inode::default());
  }

  #[test]
  fn ialloc_reports_exhaustion() {
    let fs = create_test_fs();
    for _ in 1..INODE_COUNT {
      fs.ialloc().unwrap().put().unwrap();
    }
    match fs.ialloc().unwrap_err() {
      FsError::AllocationExhausted(crate::fs::Resource::Inode) => (),
      e => panic!("unexpected error {:?}", e),
    }
  }

  #[test]
  fn iget_on_active_inode_shares_the_copy() {
    let fs = create_test_fs();
    let first = fs.iget(3).unwrap();
    first.lock().size = 4242;

    // Changing the disk underneath shows the second reference reads no disk.
    fs.write_inode(3, &sample_inode()).unwrap();
    let second = fs.iget(3).unwrap();
    assert_eq!(second.get().size, 4242);
    assert_eq!(fs.cached_inodes(), 1);

    second.put().unwrap();
    // Still referenced, nothing written yet.
    assert_eq!(fs.read_inode(3).unwrap(), sample_inode());
    first.put().unwrap();
    assert_eq!(fs.read_inode(3).unwrap().size, 4242);
    assert_eq!(fs.cached_inodes(), 0);
  }

  #[test]
  fn last_put_writes_back() {
    let fs = create_test_fs();
    let inode = fs.ialloc().unwrap();
    let num = inode.inode_num();
    inode.lock().size = 9999;
    inode.put().unwrap();

    fs.evict_unused();
    let reread = fs.iget(num).unwrap();
    assert_eq!(reread.get().size, 9999);
  }

  #[test]
  fn dropping_reference_writes_back() {
    let fs = create_test_fs();
    {
      let inode = fs.iget(7).unwrap();
      inode.lock().owner_id = 11;
    }
    assert_eq!(fs.read_inode(7).unwrap().owner_id, 11);
  }

  #[test]
  fn released_copy_is_reused_until_evicted() {
    let fs = create_test_fs();
    fs.iget(4).unwrap().put().unwrap();
    fs.write_inode(4, &sample_inode()).unwrap();

    // The released slot still caches inode 4, and releasing it again writes
    // the cached copy over the direct write.
    let cached = fs.iget(4).unwrap();
    assert_eq!(cached.get(), Inode::default());
    cached.put().unwrap();
    assert_eq!(fs.read_inode(4).unwrap(), Inode::default());

    fs.write_inode(4, &sample_inode()).unwrap();
    fs.evict_unused();
    assert_eq!(fs.iget(4).unwrap().get(), sample_inode());
  }

  #[test]
  fn distinct_inodes_take_distinct_slots() {
    let fs = create_test_fs();
    let a = fs.iget(1).unwrap();
    let b = fs.iget(2).unwrap();
    assert_ne!(a.slot, b.slot);
  }

  #[test]
  fn cache_exhaustion_is_reported() {
    let fs = create_test_fs();
    let held: Vec<_> = (0..CACHE_CAPACITY as u32)
      .map(|n| fs.iget(n).unwrap())
      .collect();
    match fs.iget(CACHE_CAPACITY as u32).unwrap_err() {
      FsError::CacheExhausted => (),
      e => panic!("unexpected error {:?}", e),
    }
    // Already cached inodes can still be shared.
    assert!(fs.iget(0).is_ok());
    drop(held);
    assert!(fs.iget(CACHE_CAPACITY as u32).is_ok());
  }

  #[test]
  fn iget_rejects_numbers_outside_table() {
    let fs = create_test_fs();
    assert!(matches!(
      fs.iget(INODE_COUNT as u32),
      Err(FsError::InvalidArgument(_))
    ));
  }
}
