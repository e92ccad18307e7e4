//! On-disk format definitions, version 1.
//!
//! These structures are the contract with the kernel-side reader and must stay bit-exact.  All
//! integers are big-endian.  The image is a sequence of blocks:
//!
//! - block 0: [`Superblock`], zero-padded to the end of the block
//! - blocks `1..data_start`: directory tables, one per directory, each an array of
//!   [`DirectoryEntryRecord`] occupying at least one block
//! - blocks `data_start..total_blocks`: file content, each file starting on a block boundary with
//!   its final block zero-padded

use std::{ffi::OsStr, fmt};

use zerocopy::{
    big_endian::{U16, U32, U64},
    FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout,
};

pub const MAGIC: [u8; 8] = *b"CINEA FS";
pub const VERSION: u8 = 1;

/// Block sizes are `MIN_BLOCK_SIZE << shift` with the shift stored in the superblock.
pub const MIN_BLOCK_SIZE: u32 = 512;
pub const MAX_BLOCK_SIZE: u32 = 4096;
pub const DEFAULT_BLOCK_SIZE: u32 = MIN_BLOCK_SIZE;

pub const RECORD_SIZE: usize = 64;
pub const MAX_NAME_LEN: usize = 36;
pub const MAX_FILE_SIZE: u64 = u32::MAX as u64;
pub const MAX_BLOCKS: u64 = u32::MAX as u64;

pub const KIND_DIRECTORY: u8 = 0;
pub const KIND_FILE: u8 = 1;

#[derive(Clone, Copy, Debug, FromBytes, Immutable, IntoBytes, KnownLayout, PartialEq)]
#[repr(C)]
pub struct Superblock {
    pub magic: [u8; 8],
    pub version: u8,
    pub block_shift: u8,
    /// At offset 10, where the kernel reads the block count.
    pub total_blocks: U32,
    pub root_table: U32,
    pub root_entries: U32,
    pub meta_blocks: U32,
    pub data_start: U32,
    pub entry_count: U32,
    pub reserved: [u8; 30],
}

#[derive(Clone, Copy, FromBytes, Immutable, IntoBytes, KnownLayout, PartialEq)]
#[repr(C)]
pub struct DirectoryEntryRecord {
    pub kind: u8,
    pub name_len: u8,
    pub reserved: U16,
    /// File length in bytes, or `entries * RECORD_SIZE` for a directory.
    pub size: U32,
    /// First block of the content; 0 for empty files.
    pub start_block: U32,
    pub block_count: U32,
    /// Table of the directory that `..` leads to from the directory holding this record.
    pub parent: U32,
    pub mtime: U64,
    pub name: [u8; MAX_NAME_LEN],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameError {
    TooLong { len: usize, max: usize },
    Invalid,
}

/// Maps a block size to the shift stored in the superblock, if the size is supported.
pub fn block_shift(block_size: u32) -> Option<u8> {
    if (MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size) && block_size.is_power_of_two() {
        Some((block_size / MIN_BLOCK_SIZE).trailing_zeros() as u8)
    } else {
        None
    }
}

pub fn block_size_from_shift(shift: u8) -> Option<u32> {
    let size = MIN_BLOCK_SIZE.checked_shl(shift.into())?;
    (size <= MAX_BLOCK_SIZE).then_some(size)
}

/// Number of blocks needed to hold `bytes` bytes.
pub fn blocks_for(bytes: u64, block_size: u32) -> u64 {
    bytes.div_ceil(block_size.into())
}

/// Number of blocks reserved for a directory table with `entries` records.  Every directory gets at
/// least one block so that its start block always points at something real.
pub fn table_blocks(entries: usize, block_size: u32) -> u64 {
    blocks_for((entries * RECORD_SIZE) as u64, block_size).max(1)
}

/// Checks a name against the fixed-width name field.
pub fn check_name(name: &OsStr) -> Result<&str, NameError> {
    let name = name.to_str().ok_or(NameError::Invalid)?;
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\0']) {
        return Err(NameError::Invalid);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(NameError::TooLong {
            len: name.len(),
            max: MAX_NAME_LEN,
        });
    }
    Ok(name)
}

impl Superblock {
    pub fn block_size(&self) -> Option<u32> {
        block_size_from_shift(self.block_shift)
    }
}

impl DirectoryEntryRecord {
    pub fn new(name: &OsStr, kind: u8) -> Result<Self, NameError> {
        let name = check_name(name)?;
        let mut record = Self::new_zeroed();
        record.kind = kind;
        record.name_len = name.len() as u8;
        record.name[..name.len()].copy_from_slice(name.as_bytes());
        Ok(record)
    }

    /// The name bytes, without padding.  Clamped so that corrupt lengths can't panic.
    pub fn name(&self) -> &[u8] {
        &self.name[..(self.name_len as usize).min(MAX_NAME_LEN)]
    }

    pub fn is_dir(&self) -> bool {
        self.kind == KIND_DIRECTORY
    }

    pub fn is_file(&self) -> bool {
        self.kind == KIND_FILE
    }
}

impl fmt::Debug for DirectoryEntryRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DirectoryEntryRecord")
            .field("kind", &self.kind)
            .field("name", &String::from_utf8_lossy(self.name()))
            .field("size", &self.size.get())
            .field("start_block", &self.start_block.get())
            .field("block_count", &self.block_count.get())
            .field("parent", &self.parent.get())
            .field("mtime", &self.mtime.get())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use std::mem::size_of;

    use super::*;

    #[test]
    fn struct_sizes() {
        assert_eq!(size_of::<Superblock>(), 64);
        assert_eq!(size_of::<DirectoryEntryRecord>(), RECORD_SIZE);
    }

    #[test]
    fn block_shifts() {
        assert_eq!(block_shift(512), Some(0));
        assert_eq!(block_shift(4096), Some(3));
        assert_eq!(block_shift(1000), None);
        assert_eq!(block_shift(256), None);
        assert_eq!(block_shift(8192), None);
        assert_eq!(block_size_from_shift(1), Some(1024));
        assert_eq!(block_size_from_shift(4), None);
    }

    #[test]
    fn name_limits() {
        let max = "n".repeat(MAX_NAME_LEN);
        assert_eq!(check_name(OsStr::new(&max)), Ok(max.as_str()));

        let over = "n".repeat(MAX_NAME_LEN + 1);
        assert_eq!(
            check_name(OsStr::new(&over)),
            Err(NameError::TooLong {
                len: MAX_NAME_LEN + 1,
                max: MAX_NAME_LEN
            })
        );

        for bad in ["", ".", "..", "a/b", "nul\0"] {
            assert_eq!(check_name(OsStr::new(bad)), Err(NameError::Invalid));
        }
    }

    #[test]
    fn multibyte_names_count_bytes() {
        // 12 three-byte characters fill the field exactly
        let name = "語".repeat(12);
        assert!(check_name(OsStr::new(&name)).is_ok());
        let name = "語".repeat(13);
        assert!(matches!(
            check_name(OsStr::new(&name)),
            Err(NameError::TooLong { len: 39, .. })
        ));
    }

    #[test]
    fn record_encoding() {
        let mut record = DirectoryEntryRecord::new(OsStr::new("a.txt"), KIND_FILE).unwrap();
        record.size = 10.into();
        record.start_block = 3.into();
        record.block_count = 1.into();
        record.parent = 1.into();

        let bytes = record.as_bytes();
        assert_eq!(bytes[0], KIND_FILE);
        assert_eq!(bytes[1], 5);
        assert_eq!(&bytes[4..8], &[0, 0, 0, 10]);
        assert_eq!(&bytes[8..12], &[0, 0, 0, 3]);
        assert_eq!(&bytes[28..33], b"a.txt");
        assert!(bytes[33..].iter().all(|b| *b == 0));
        assert_eq!(record.name(), b"a.txt");
    }
}
