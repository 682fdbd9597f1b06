use std::convert::TryInto;

use crate::fs::{FsError, BLOCK_SIZE};

const SB_MAGIC: u32 = 0x494E_4653; // INFS

/// The first block of the file system storing information critical for mounting
/// the file system and verifying the underlying disk is formatted correctly.
#[derive(Debug, PartialEq)]
pub struct SuperBlock {
    /// A 32-bit identifying string, in this case INFS.
    pub sb_magic: u32,
    /// Total blocks on the image, metadata region included.
    pub block_count: u32,
    /// Size of the inode table in inodes.
    pub inode_count: u32,
}

impl SuperBlock {
    pub fn new(block_count: u32, inode_count: u32) -> Self {
        Self {
            sb_magic: SB_MAGIC,
            block_count,
            inode_count,
        }
    }

    /// Reads the super block from the first bytes of a block.
    pub fn parse(buf: &[u8]) -> Result<Self, FsError> {
        if buf.len() < 12 {
            return Err(FsError::InvalidSuperBlock);
        }
        let field = |at: usize| u32::from_be_bytes(buf[at..at + 4].try_into().unwrap_or([0; 4]));

        if field(0) != SB_MAGIC {
            return Err(FsError::InvalidSuperBlock);
        }
        Ok(Self {
            sb_magic: SB_MAGIC,
            block_count: field(4),
            inode_count: field(8),
        })
    }

    /// Serializes the SuperBlock into a BLOCK_SIZE buffer for writing to disk.
    /// The encoding is a series of struct fields with big endian alignment.
    pub fn serialize(&self) -> Vec<u8> {
        let mut sb_encoded = Vec::with_capacity(BLOCK_SIZE);
        sb_encoded.extend_from_slice(&self.sb_magic.to_be_bytes());
        sb_encoded.extend_from_slice(&self.block_count.to_be_bytes());
        sb_encoded.extend_from_slice(&self.inode_count.to_be_bytes());
        sb_encoded.resize(BLOCK_SIZE, 0);
        sb_encoded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_encode_and_decode_superblocks() {
        let sb = SuperBlock::new(1024, 256);
        let encoded = sb.serialize();
        assert_eq!(encoded.len(), BLOCK_SIZE);
        assert_eq!(&encoded[0..4], b"INFS");

        let parsed = SuperBlock::parse(&encoded).unwrap();

        assert_eq!(parsed, sb);
    }

    #[test]
    fn parsing_buffer_with_invalid_magic_fails() {
        let zero_buffer_with_right_size = vec![0; 4096];
        assert!(matches!(
            SuperBlock::parse(&zero_buffer_with_right_size),
            Err(FsError::InvalidSuperBlock)
        ));
    }

    #[test]
    fn parsing_short_buffer_fails() {
        assert!(SuperBlock::parse(&[0x49, 0x4E]).is_err());
    }
}
