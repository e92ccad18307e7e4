//! Zero-copy decoding of an image, mirroring what the kernel-side reader does block by block.

use thiserror::Error;
use zerocopy::FromBytes;

use super::format::{
    block_size_from_shift, DirectoryEntryRecord, Superblock, MAGIC, RECORD_SIZE, VERSION,
};
use crate::layout::table_capacity;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ImageError {
    #[error("Image is too short to hold a superblock")]
    TooShort,
    #[error("Bad magic {0:?}")]
    BadMagic([u8; 8]),
    #[error("Unsupported format version {0}")]
    UnsupportedVersion(u8),
    #[error("Invalid block shift {0}")]
    InvalidBlockShift(u8),
    #[error("Image is {actual} bytes but the superblock describes {expected}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("Blocks {start}+{count} are outside the image")]
    OutOfBounds { start: u32, count: u32 },
    #[error("Record {name:?} has unknown kind {kind}")]
    UnknownKind { name: String, kind: u8 },
    #[error("Record {0:?} is corrupt")]
    CorruptRecord(String),
}

#[derive(Debug)]
pub struct Image<'img> {
    data: &'img [u8],
    superblock: &'img Superblock,
    block_size: u32,
}

impl<'img> Image<'img> {
    pub fn open(data: &'img [u8]) -> Result<Self, ImageError> {
        let (superblock, _) = Superblock::ref_from_prefix(data).map_err(|_| ImageError::TooShort)?;

        if superblock.magic != MAGIC {
            return Err(ImageError::BadMagic(superblock.magic));
        }
        if superblock.version != VERSION {
            return Err(ImageError::UnsupportedVersion(superblock.version));
        }
        let block_size = block_size_from_shift(superblock.block_shift)
            .ok_or(ImageError::InvalidBlockShift(superblock.block_shift))?;

        let expected = u64::from(superblock.total_blocks.get()) * u64::from(block_size);
        if data.len() as u64 != expected {
            return Err(ImageError::SizeMismatch {
                expected,
                actual: data.len() as u64,
            });
        }

        let image = Self {
            data,
            superblock,
            block_size,
        };

        // The metadata region must sit between the superblock and the data region
        let data_start = superblock.data_start.get();
        if data_start != 1 + superblock.meta_blocks.get()
            || data_start > superblock.total_blocks.get()
        {
            return Err(ImageError::OutOfBounds {
                start: 1,
                count: superblock.meta_blocks.get(),
            });
        }
        image.root()?;

        Ok(image)
    }

    pub fn superblock(&self) -> &'img Superblock {
        self.superblock
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// The bytes of `count` blocks starting at `start`.
    pub fn blocks(&self, start: u32, count: u32) -> Result<&'img [u8], ImageError> {
        let oob = ImageError::OutOfBounds { start, count };
        let Some(end) = start.checked_add(count) else {
            return Err(oob);
        };
        if end > self.superblock.total_blocks.get() {
            return Err(oob);
        }
        let bs = self.block_size as usize;
        Ok(&self.data[start as usize * bs..end as usize * bs])
    }

    /// A directory table with `entries` records.  Tables must lie in the metadata region.
    pub fn table(
        &self,
        start: u32,
        entries: u32,
    ) -> Result<&'img [DirectoryEntryRecord], ImageError> {
        let count = super::format::table_blocks(entries as usize, self.block_size) as u32;
        let oob = ImageError::OutOfBounds { start, count };
        if start == 0 || start.saturating_add(count) > self.superblock.data_start.get() {
            return Err(oob);
        }
        if entries as usize > table_capacity(count, self.block_size) {
            return Err(oob);
        }
        let bytes = &self.blocks(start, count)?[..entries as usize * RECORD_SIZE];
        <[DirectoryEntryRecord]>::ref_from_bytes(bytes).map_err(|_| oob)
    }

    pub fn root(&self) -> Result<&'img [DirectoryEntryRecord], ImageError> {
        self.table(
            self.superblock.root_table.get(),
            self.superblock.root_entries.get(),
        )
    }

    fn check_record(record: &DirectoryEntryRecord) -> Result<&str, ImageError> {
        let name = std::str::from_utf8(record.name())
            .map_err(|_| ImageError::CorruptRecord(String::from_utf8_lossy(record.name()).into()))?;
        if !record.is_dir() && !record.is_file() {
            return Err(ImageError::UnknownKind {
                name: name.into(),
                kind: record.kind,
            });
        }
        Ok(name)
    }

    /// The name of a record, checked to be valid UTF-8.
    pub fn name<'r>(&self, record: &'r DirectoryEntryRecord) -> Result<&'r str, ImageError> {
        Self::check_record(record)
    }

    /// The records of the subdirectory described by `record`.
    pub fn directory(
        &self,
        record: &DirectoryEntryRecord,
    ) -> Result<&'img [DirectoryEntryRecord], ImageError> {
        let name = Self::check_record(record)?;
        if !record.is_dir() || record.size.get() as usize % RECORD_SIZE != 0 {
            return Err(ImageError::CorruptRecord(name.into()));
        }
        let entries = record.size.get() / RECORD_SIZE as u32;
        if u64::from(record.block_count.get())
            != super::format::table_blocks(entries as usize, self.block_size)
        {
            return Err(ImageError::CorruptRecord(name.into()));
        }
        self.table(record.start_block.get(), entries)
    }

    /// The content of the file described by `record`, without the block padding.
    pub fn file_data(&self, record: &DirectoryEntryRecord) -> Result<&'img [u8], ImageError> {
        let name = Self::check_record(record)?;
        let size = record.size.get();
        if !record.is_file()
            || u64::from(record.block_count.get())
                != u64::from(size).div_ceil(self.block_size.into())
        {
            return Err(ImageError::CorruptRecord(name.into()));
        }
        if size == 0 {
            return Ok(&[]);
        }
        let start = record.start_block.get();
        if start < self.superblock.data_start.get() {
            return Err(ImageError::OutOfBounds {
                start,
                count: record.block_count.get(),
            });
        }
        let blocks = self.blocks(start, record.block_count.get())?;
        Ok(&blocks[..size as usize])
    }

    /// The zero padding after a file's content in its final block.
    pub fn file_tail(&self, record: &DirectoryEntryRecord) -> Result<&'img [u8], ImageError> {
        let data = self.file_data(record)?;
        if data.is_empty() {
            return Ok(&[]);
        }
        let blocks = self.blocks(record.start_block.get(), record.block_count.get())?;
        Ok(&blocks[data.len()..])
    }
}
