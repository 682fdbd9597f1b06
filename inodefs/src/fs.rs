use std::fmt;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::alloc::BitmapAllocator;
use crate::io::{BlockNumber, BlockStorage, FileBlockEmulator, FileBlockEmulatorBuilder};
use crate::node::InodeCache;
use crate::sb::SuperBlock;

use log::info;
use thiserror::Error;

pub const BLOCK_SIZE: usize = 4096;

/// Known locations.
pub const SUPERBLOCK_BLOCK: BlockNumber = 0;
pub const INODE_MAP_BLOCK: BlockNumber = 1;
pub const BLOCK_MAP_BLOCK: BlockNumber = 2;
pub const INODE_FIRST_BLOCK: BlockNumber = 3;
pub const INODE_BLOCK_COUNT: usize = 4;
pub const FIRST_DATA_BLOCK: BlockNumber = INODE_FIRST_BLOCK + INODE_BLOCK_COUNT;

pub const INODE_SIZE: usize = 64;
pub const INODES_PER_BLOCK: usize = BLOCK_SIZE / INODE_SIZE;
/// Upper bound on file system objects, set by the size of the inode table.
pub const INODE_COUNT: usize = INODE_BLOCK_COUNT * INODES_PER_BLOCK;
pub const INODE_PTR_COUNT: usize = 16;
/// Number of inodes that may be referenced in memory at the same time.
pub const CACHE_CAPACITY: usize = 64;

pub const DIRECTORY_ENTRY_SIZE: usize = 32;
pub const ENTRIES_PER_BLOCK: usize = BLOCK_SIZE / DIRECTORY_ENTRY_SIZE;
/// Longest name a directory entry can hold, the 16 byte field keeps a trailing NUL.
pub const NAME_MAX: usize = 15;

pub const INODE_TYPE_DIRECTORY: u8 = 2;
pub const ROOT_INODE: u32 = 0;

/// Image size used by [`mkfs`], 4MiB.
pub const DEFAULT_BLOCK_COUNT: usize = 1024;

/// The kind of object an allocation bitmap hands out.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Resource {
    Block,
    Inode,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Block => write!(f, "data blocks"),
            Resource::Inode => write!(f, "inodes"),
        }
    }
}

#[derive(Error, Debug)]
pub enum FsError {
    #[error("no free {0} left")]
    AllocationExhausted(Resource),
    #[error("inode cache has no free slot")]
    CacheExhausted,
    #[error("found no file at path {0:?}")]
    NotFound(String),
    #[error("inode {0} is not a directory")]
    NotADirectory(u32),
    #[error("an entry named {0:?} already exists")]
    AlreadyExists(String),
    #[error("directory inode {0} has no room for another entry")]
    DirectoryFull(u32),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("image does not hold a formatted file system")]
    InvalidSuperBlock,
    #[error("block device failure: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FsError>;

/// Locks a mutex, carrying on with the inner value if a previous holder panicked.
/// Every critical section in this crate leaves its data consistent before any
/// call that could panic.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A small file system on block storage with a flat inode table and directories
/// made of fixed size entries.
///
/// # Layout
/// ===========================================================================
/// | SuperBlock | Bitmap (inodes) | Bitmap (data region) | Inodes | Data Region |
/// ===========================================================================
///
/// The context owns the device, the in-core inode cache, and the four locks that
/// serialize allocation of blocks, allocation of inodes, assignment of cache
/// slots, and appends to directories. It is `Sync` so any number of threads may
/// share one instance.
pub struct Filesystem<T: BlockStorage> {
    dev: Mutex<T>,
    super_block: SuperBlock,
    pub(crate) blocks: BitmapAllocator,
    pub(crate) inodes: BitmapAllocator,
    pub(crate) cache: InodeCache,
    pub(crate) dir_lock: Mutex<()>,
}

impl<T: BlockStorage> Filesystem<T> {
    /// Formats the device and returns the mounted file system. The root
    /// directory (inode 0) holds "." and "..", both pointing at itself.
    pub fn create(mut dev: T) -> Result<Self> {
        let nblocks = dev.block_count();
        if nblocks <= FIRST_DATA_BLOCK {
            return Err(FsError::InvalidArgument(format!(
                "device of {} blocks cannot hold the metadata region",
                nblocks
            )));
        }

        let zeroed = [0; BLOCK_SIZE];
        for blocknr in SUPERBLOCK_BLOCK..FIRST_DATA_BLOCK {
            dev.write_block(blocknr, &zeroed)?;
        }
        let super_block = SuperBlock::new(nblocks as u32, INODE_COUNT as u32);
        dev.write_block(SUPERBLOCK_BLOCK, &super_block.serialize())?;

        let fs = Self::with_device(dev, super_block);
        // The metadata region is never handed out as data.
        fs.blocks.reserve_prefix(&fs, FIRST_DATA_BLOCK)?;
        fs.make_root()?;
        fs.sync()?;
        info!("formatted {} block image", nblocks);
        Ok(fs)
    }

    /// Mounts a device previously prepared by [`Filesystem::create`].
    pub fn open(mut dev: T) -> Result<Self> {
        let mut block_buf = [0; BLOCK_SIZE];
        dev.read_block(SUPERBLOCK_BLOCK, &mut block_buf)?;
        let super_block = SuperBlock::parse(&block_buf)?;
        if super_block.block_count as usize > dev.block_count()
            || super_block.inode_count as usize != INODE_COUNT
        {
            return Err(FsError::InvalidSuperBlock);
        }

        info!(
            "mounted image of {} blocks, {} inodes",
            super_block.block_count, super_block.inode_count
        );
        Ok(Self::with_device(dev, super_block))
    }

    fn with_device(dev: T, super_block: SuperBlock) -> Self {
        // One bitmap block, and 16 bit block pointers, cap the data region.
        let block_limit = std::cmp::min(super_block.block_count as usize, BLOCK_SIZE * 8);
        Filesystem {
            dev: Mutex::new(dev),
            super_block,
            blocks: BitmapAllocator::new(BLOCK_MAP_BLOCK, block_limit, Resource::Block),
            inodes: BitmapAllocator::new(INODE_MAP_BLOCK, INODE_COUNT, Resource::Inode),
            cache: InodeCache::new(),
            dir_lock: Mutex::new(()),
        }
    }

    /// Allocates a data block, returning its block number.
    pub fn alloc(&self) -> Result<BlockNumber> {
        self.blocks.allocate(self)
    }

    /// Number of blocks on the mounted image.
    pub fn block_count(&self) -> usize {
        self.super_block.block_count as usize
    }

    /// Flushes device buffers.
    pub fn sync(&self) -> Result<()> {
        lock(&self.dev).sync_disk()?;
        Ok(())
    }

    /// Releases the file system, handing the device back to the caller.
    pub fn into_device(self) -> T {
        self.dev.into_inner().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn bread(&self, blocknr: BlockNumber, buf: &mut [u8]) -> Result<()> {
        lock(&self.dev).read_block(blocknr, buf)?;
        Ok(())
    }

    pub(crate) fn bwrite(&self, blocknr: BlockNumber, buf: &[u8]) -> Result<()> {
        lock(&self.dev).write_block(blocknr, buf)?;
        Ok(())
    }

    /// Reads a block, lets `update` modify it, and writes it back without any
    /// other device access in between.
    pub(crate) fn bupdate<F>(&self, blocknr: BlockNumber, update: F) -> Result<()>
    where
        F: FnOnce(&mut [u8]),
    {
        let mut buf = [0; BLOCK_SIZE];
        let mut dev = lock(&self.dev);
        dev.read_block(blocknr, &mut buf)?;
        update(&mut buf);
        dev.write_block(blocknr, &buf)?;
        Ok(())
    }
}

/// Creates (or truncates) the image file at `path` and formats it with
/// [`DEFAULT_BLOCK_COUNT`] blocks.
pub fn mkfs<P: AsRef<Path>>(path: P) -> Result<Filesystem<FileBlockEmulator>> {
    mkfs_with_blocks(path, DEFAULT_BLOCK_COUNT)
}

/// Like [`mkfs`] with a chosen image size.
pub fn mkfs_with_blocks<P: AsRef<Path>>(
    path: P,
    nblocks: usize,
) -> Result<Filesystem<FileBlockEmulator>> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    let dev = FileBlockEmulatorBuilder::from(file)
        .with_block_count(nblocks)
        .build()?;
    Filesystem::create(dev)
}

/// Mounts the image file at `path`, sizing the device from the file length.
pub fn open_image<P: AsRef<Path>>(path: P) -> Result<Filesystem<FileBlockEmulator>> {
    let len = std::fs::metadata(path.as_ref())?.len() as usize;
    let dev = FileBlockEmulator::open_disk(path, len / BLOCK_SIZE)?;
    Filesystem::open(dev)
}
