//! Reserves block 0 up front and patches the superblock in once everything else is written.

use log::{debug, info};
use zerocopy::{FromZeros, IntoBytes};

use crate::{
    error::CompileError,
    image::{
        format::{self, Superblock, MAGIC, VERSION},
        writer::{Output, WriteProgress},
    },
    layout::Layout,
};

/// Totals of a finished image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageSummary {
    pub block_size: u32,
    pub total_blocks: u32,
    pub meta_blocks: u32,
    pub data_blocks: u32,
    pub entry_count: u32,
}

impl ImageSummary {
    pub fn image_len(&self) -> u64 {
        u64::from(self.total_blocks) * u64::from(self.block_size)
    }
}

const SUPERBLOCK_PATH: &str = "<superblock>";

pub struct ImageAssembler<'l, 'a> {
    layout: &'l Layout<'a>,
}

impl<'l, 'a> ImageAssembler<'l, 'a> {
    pub fn new(layout: &'l Layout<'a>) -> Self {
        Self { layout }
    }

    /// Zero-fills block 0 and pre-sizes the output to the final image length.
    pub fn reserve(&self, output: &mut (impl Output + ?Sized)) -> Result<(), CompileError> {
        debug!("reserve superblock, image {} bytes", self.layout.image_len());
        output
            .zero_fill(0, self.layout.block_size as usize)
            .and_then(|()| output.set_len(self.layout.image_len()))
            .map_err(|e| CompileError::write_failure(SUPERBLOCK_PATH, e))
    }

    pub fn superblock(&self) -> Result<Superblock, CompileError> {
        let block_shift = format::block_shift(self.layout.block_size).ok_or_else(|| {
            CompileError::InvalidOptions(format!("block size {}", self.layout.block_size))
        })?;

        let mut sb = Superblock::new_zeroed();
        sb.magic = MAGIC;
        sb.version = VERSION;
        sb.block_shift = block_shift;
        sb.total_blocks = self.layout.total_blocks.into();
        sb.root_table = self.layout.root_table.into();
        sb.root_entries = self.layout.root_entries.into();
        sb.meta_blocks = self.layout.meta_blocks.into();
        sb.data_start = self.layout.data_start.into();
        sb.entry_count = self.layout.entry_count.into();
        Ok(sb)
    }

    /// Verifies that every planned entry was written, then writes the superblock and truncates the
    /// output to exactly `total_blocks` blocks.
    pub fn finish(
        &self,
        output: &mut (impl Output + ?Sized),
        progress: WriteProgress,
    ) -> Result<ImageSummary, CompileError> {
        let layout = self.layout;
        if progress.tables != layout.tables.len() || progress.files != layout.files.len() {
            return Err(CompileError::AssemblyIncomplete(format!(
                "wrote {}/{} tables and {}/{} files",
                progress.tables,
                layout.tables.len(),
                progress.files,
                layout.files.len()
            )));
        }
        if progress.end_block != u64::from(layout.total_blocks) {
            return Err(CompileError::AssemblyIncomplete(format!(
                "content ends at block {} but the layout has {} blocks",
                progress.end_block, layout.total_blocks
            )));
        }

        let sb = self.superblock()?;
        debug!("write superblock {sb:?}");
        output
            .write_at(0, sb.as_bytes())
            .and_then(|()| output.set_len(layout.image_len()))
            .and_then(|()| output.flush())
            .map_err(|e| CompileError::write_failure(SUPERBLOCK_PATH, e))?;

        let summary = ImageSummary {
            block_size: layout.block_size,
            total_blocks: layout.total_blocks,
            meta_blocks: layout.meta_blocks,
            data_blocks: layout.total_blocks - layout.data_start,
            entry_count: layout.entry_count,
        };
        info!(
            "assembled image: {} entries, {} blocks of {} bytes",
            summary.entry_count, summary.total_blocks, summary.block_size
        );
        Ok(summary)
    }
}
