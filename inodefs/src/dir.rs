use std::io::Write;

use crate::fs::{
    lock, Filesystem, FsError, Result, BLOCK_SIZE, DIRECTORY_ENTRY_SIZE, INODE_PTR_COUNT,
    INODE_TYPE_DIRECTORY, NAME_MAX, ROOT_INODE,
};
use crate::io::BlockStorage;
use crate::node::{Inode, InodeRef};

use log::{error, info, warn};
use zerocopy::{AsBytes, FromBytes};

const NAME_FIELD_SIZE: usize = 16;

#[repr(C)]
#[derive(AsBytes, FromBytes, Copy, Clone)]
/// On-disk directory entry: a big endian inode number followed by a NUL padded
/// name. Exactly 32 bytes.
struct DiskDirEntry {
    inode_num: [u8; 2],
    name: [u8; NAME_FIELD_SIZE],
    reserved: [u8; 14],
}

impl DiskDirEntry {
    fn zeroed() -> Self {
        Self {
            inode_num: [0; 2],
            name: [0; NAME_FIELD_SIZE],
            reserved: [0; 14],
        }
    }
}

/// A name and the inode it refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub inode_num: u32,
    pub name: String,
}

impl DirEntry {
    pub fn new(inode_num: u32, name: &str) -> Self {
        Self {
            inode_num,
            name: name.to_string(),
        }
    }

    /// Decodes the entry at the start of `bytes`. Names are cut at the first NUL
    /// and never run past 15 bytes.
    fn decode(bytes: &[u8]) -> Self {
        let mut raw = DiskDirEntry::zeroed();
        raw.as_bytes_mut()
            .copy_from_slice(&bytes[..DIRECTORY_ENTRY_SIZE]);

        let name = &raw.name[..NAME_MAX];
        let len = name.iter().position(|&c| c == 0).unwrap_or(NAME_MAX);
        DirEntry {
            inode_num: u16::from_be_bytes(raw.inode_num) as u32,
            name: String::from_utf8_lossy(&name[..len]).into_owned(),
        }
    }

    fn encode(&self) -> DiskDirEntry {
        let mut raw = DiskDirEntry::zeroed();
        raw.inode_num = (self.inode_num as u16).to_be_bytes();
        let name = self.name.as_bytes();
        let len = name.len().min(NAME_MAX);
        raw.name[..len].copy_from_slice(&name[..len]);
        raw
    }
}

/// A cursor over the entries of an open directory. Holds a reference to the
/// directory inode until closed or dropped.
pub struct Directory<'fs, T: BlockStorage> {
    fs: &'fs Filesystem<T>,
    inode: InodeRef<'fs, T>,
    offset: usize,
}

impl<'fs, T: BlockStorage> Directory<'fs, T> {
    pub fn inode_num(&self) -> u32 {
        self.inode.inode_num()
    }

    /// Reads the entry under the cursor and advances past it. Returns `None` at
    /// the end of the directory.
    pub fn get(&mut self) -> Result<Option<DirEntry>> {
        let inode = self.inode.get();
        if self.offset >= inode.size as usize {
            return Ok(None);
        }

        let blocknr = match inode.block_ptr.get(self.offset / BLOCK_SIZE) {
            Some(&blocknr) => blocknr as usize,
            None => {
                warn!(
                    "directory {} claims {} bytes, past its direct blocks",
                    self.inode_num(),
                    inode.size
                );
                return Ok(None);
            }
        };
        let mut block = [0; BLOCK_SIZE];
        self.fs.bread(blocknr, &mut block)?;

        let at = self.offset % BLOCK_SIZE;
        let entry = DirEntry::decode(&block[at..]);
        self.offset += DIRECTORY_ENTRY_SIZE;
        Ok(Some(entry))
    }

    /// Scans the rest of the directory for an entry named `name`.
    pub fn lookup(&mut self, name: &str) -> Result<Option<u32>> {
        while let Some(entry) = self.get()? {
            if entry.name == name {
                return Ok(Some(entry.inode_num));
            }
        }
        Ok(None)
    }

    pub fn close(self) -> Result<()> {
        self.inode.put()
    }
}

impl<'fs, T: BlockStorage> Iterator for Directory<'fs, T> {
    type Item = Result<DirEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.get();
        if next.is_err() {
            // Stop after the first failure.
            self.offset = usize::MAX;
        }
        next.transpose()
    }
}

/// Splits a rooted path into the parent path and the final component.
fn split_parent(path: &str) -> Result<(&str, &str)> {
    if !path.starts_with('/') {
        return Err(FsError::InvalidArgument(
            "path must start with \"/\"".to_string(),
        ));
    }
    let split = path.rfind('/').unwrap_or(0);
    let parent = match &path[..split] {
        "" => "/",
        parent => parent,
    };
    let name = &path[split + 1..];

    if name.is_empty() {
        return Err(FsError::InvalidArgument(format!(
            "{:?} does not name a directory",
            path
        )));
    }
    if name.len() > NAME_MAX || name.contains('\0') {
        return Err(FsError::InvalidArgument(format!(
            "{:?} is not a valid name, names are at most {} bytes",
            name, NAME_MAX
        )));
    }
    Ok((parent, name))
}

fn is_root(path: &str) -> bool {
    path.is_empty() || path == "/"
}

impl<T: BlockStorage> Filesystem<T> {
    /// Opens a cursor at the first entry of directory `inode_num`.
    pub fn directory_open(&self, inode_num: u32) -> Result<Directory<'_, T>> {
        let inode = self.iget(inode_num)?;
        if !inode.get().is_dir() {
            return Err(FsError::NotADirectory(inode_num));
        }
        Ok(Directory {
            fs: self,
            inode,
            offset: 0,
        })
    }

    /// Writes one `<inode_num> <name>` line per entry of the root directory.
    pub fn ls<W: Write>(&self, out: &mut W) -> Result<()> {
        let mut dir = self.directory_open(ROOT_INODE)?;
        while let Some(entry) = dir.get()? {
            writeln!(out, "{} {}", entry.inode_num, entry.name)?;
        }
        dir.close()
    }

    /// All entries of the directory at `path`, in on-disk order.
    pub fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let mut dir = self.directory_open(self.path_lookup(path)?)?;
        let entries = dir.by_ref().collect::<Result<Vec<_>>>()?;
        dir.close()?;
        Ok(entries)
    }

    /// Resolves `path` to an inode number by walking directories from the root.
    /// Empty components are skipped, so "a/b", "/a//b" and "/a/b/" all name the
    /// same directory.
    pub fn path_lookup(&self, path: &str) -> Result<u32> {
        if is_root(path) {
            return Ok(ROOT_INODE);
        }

        let mut current = ROOT_INODE;
        for component in path.split('/').filter(|c| !c.is_empty()) {
            let mut dir = self.directory_open(current)?;
            let found = dir.lookup(component)?;
            dir.close()?;
            current = found.ok_or_else(|| FsError::NotFound(path.to_string()))?;
        }
        Ok(current)
    }

    /// Resolves `path` and returns a reference to its inode.
    pub fn namei(&self, path: &str) -> Result<InodeRef<'_, T>> {
        if is_root(path) {
            return self.iget(ROOT_INODE);
        }
        let inode_num = self.path_lookup(path)?;
        self.iget(inode_num)
    }

    /// Creates an empty directory at `path`, returning its inode number. The
    /// parent must exist and the final component must not.
    ///
    /// Once the entry is linked into the parent the directory exists and its
    /// number is returned, even if writing back the parent inode fails. That
    /// failure is logged and the updated parent stays in the cache, where the
    /// next release of it writes it again.
    pub fn directory_make(&self, path: &str) -> Result<u32> {
        let (parent_path, name) = split_parent(path)?;

        let parent = self.namei(parent_path)?;
        let parent_num = parent.inode_num();
        let snapshot = parent.get();
        if !snapshot.is_dir() {
            return Err(FsError::NotADirectory(parent_num));
        }
        if self.find_entry(&snapshot, name)?.is_some() {
            return Err(FsError::AlreadyExists(path.to_string()));
        }
        if snapshot.size as usize >= INODE_PTR_COUNT * BLOCK_SIZE {
            return Err(FsError::DirectoryFull(parent_num));
        }

        let child = self.ialloc()?;
        let child_num = child.inode_num();
        self.init_directory(&child, parent_num)?;
        child.put()?;

        self.append_entry(&parent, DirEntry::new(child_num, name))
            .map_err(|e| {
                warn!(
                    "inode {} stays allocated after failing to link {:?}: {}",
                    child_num, path, e
                );
                e
            })?;
        if let Err(e) = parent.put() {
            error!(
                "linked {:?} but failed to write back parent inode {}: {}",
                path, parent_num, e
            );
        }

        info!("created directory {:?} as inode {}", path, child_num);
        Ok(child_num)
    }

    /// Allocates the root directory on a freshly formatted image.
    pub(crate) fn make_root(&self) -> Result<()> {
        let root = self.ialloc()?;
        if root.inode_num() != ROOT_INODE {
            return Err(FsError::InvalidArgument(
                "root directory must be the first inode".to_string(),
            ));
        }
        self.init_directory(&root, ROOT_INODE)?;
        root.put()
    }

    /// Gives a freshly allocated inode one data block holding "." and "..".
    fn init_directory(&self, dir: &InodeRef<'_, T>, parent: u32) -> Result<()> {
        let blocknr = self.alloc()?;

        let mut block = [0; BLOCK_SIZE];
        let entries = [
            DirEntry::new(dir.inode_num(), "."),
            DirEntry::new(parent, ".."),
        ];
        for (entry, slot) in entries.iter().zip(block.chunks_mut(DIRECTORY_ENTRY_SIZE)) {
            slot.copy_from_slice(entry.encode().as_bytes());
        }
        self.bwrite(blocknr, &block)?;

        let mut inode = dir.lock();
        inode.flags = INODE_TYPE_DIRECTORY;
        inode.size = (entries.len() * DIRECTORY_ENTRY_SIZE) as u32;
        inode.link_count = 2;
        inode.block_ptr[0] = blocknr as u16;
        Ok(())
    }

    /// Writes `entry` after the last entry of `parent` under the directory lock.
    /// A directory whose last block is full gets one more data block.
    fn append_entry(&self, parent: &InodeRef<'_, T>, entry: DirEntry) -> Result<()> {
        let _guard = lock(&self.dir_lock);
        let mut dir = parent.lock();

        // Another thread may have linked the same name since the unlocked check.
        if self.find_entry(&dir, &entry.name)?.is_some() {
            return Err(FsError::AlreadyExists(entry.name));
        }

        let offset = dir.size as usize;
        let index = offset / BLOCK_SIZE;
        if index >= INODE_PTR_COUNT {
            return Err(FsError::DirectoryFull(parent.inode_num()));
        }
        if dir.block_ptr[index] == 0 {
            let blocknr = self.alloc()?;
            self.bwrite(blocknr, &[0; BLOCK_SIZE])?;
            dir.block_ptr[index] = blocknr as u16;
        }

        let raw = entry.encode();
        let at = offset % BLOCK_SIZE;
        self.bupdate(dir.block_ptr[index] as usize, |block| {
            block[at..at + DIRECTORY_ENTRY_SIZE].copy_from_slice(raw.as_bytes())
        })?;
        dir.size += DIRECTORY_ENTRY_SIZE as u32;
        dir.link_count = dir.link_count.saturating_add(1);
        Ok(())
    }

    /// Scans the content of a directory inode without going through the cache.
    fn find_entry(&self, dir: &Inode, name: &str) -> Result<Option<u32>> {
        let size = dir.size as usize;
        let mut block = [0; BLOCK_SIZE];
        for (index, &blocknr) in dir.block_ptr.iter().enumerate() {
            let start = index * BLOCK_SIZE;
            if start >= size {
                break;
            }
            self.bread(blocknr as usize, &mut block)?;

            let used = (size - start).min(BLOCK_SIZE);
            let found = block[..used]
                .chunks(DIRECTORY_ENTRY_SIZE)
                .map(DirEntry::decode)
                .find(|entry| entry.name == name);
            if let Some(entry) = found {
                return Ok(Some(entry.inode_num));
            }
        }
        Ok(None)
    }
}
