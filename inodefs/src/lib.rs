//! A small Unix style file system on top of a block device. Blocks and inodes
//! are handed out from on-disk bitmaps, inodes are shared through a bounded
//! reference counted cache, and directories are flat arrays of fixed size
//! entries.
//!
//! ```no_run
//! let fs = inodefs::mkfs("disk.img")?;
//! fs.directory_make("/usr")?;
//! fs.directory_make("/usr/share")?;
//! assert_eq!(fs.path_lookup("/usr/share")?, 2);
//! fs.ls(&mut std::io::stdout())?;
//! # Ok::<(), inodefs::FsError>(())
//! ```
mod alloc;
mod dir;
mod fs;
pub mod io;
mod node;
mod sb;

pub use crate::alloc::{Bitmap, State};
pub use crate::dir::{DirEntry, Directory};
pub use crate::fs::*;
pub use crate::node::{inode_location, Inode, InodeGuard, InodeRef};
