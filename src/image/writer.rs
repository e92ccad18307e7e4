//! Streams planned tables and file content into a block-addressed output.

use std::{
    fs::File,
    io::{self, Read},
    os::unix::fs::FileExt,
    path::Path,
};

use log::debug;
use zerocopy::IntoBytes;

use crate::{
    error::CompileError,
    image::format::MAX_BLOCK_SIZE,
    layout::{byte_range, PlannedFile, PlannedTable},
    tree::Content,
    util::read_full,
};

/// Size of the buffer used to copy file content.  A multiple of every supported block size.
pub const TRANSFER_BUFFER_SIZE: usize = 64 * 1024;

static ZEROS: [u8; MAX_BLOCK_SIZE as usize] = [0; MAX_BLOCK_SIZE as usize];

/// A random-access destination for image bytes.
pub trait Output {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()>;
    fn set_len(&mut self, len: u64) -> io::Result<()>;
    fn flush(&mut self) -> io::Result<()>;

    /// Writes `len` zero bytes at `offset`.  `len` is at most one block.
    fn zero_fill(&mut self, offset: u64, len: usize) -> io::Result<()> {
        self.write_at(offset, &ZEROS[..len])
    }
}

impl Output for File {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        self.write_all_at(data, offset)
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        File::set_len(self, len)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sync_all()
    }
}

/// An in-memory image.  Grows as needed.
impl Output for Vec<u8> {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        let start = usize::try_from(offset).map_err(io::Error::other)?;
        let end = start + data.len();
        if self.len() < end {
            self.resize(end, 0);
        }
        self[start..end].copy_from_slice(data);
        Ok(())
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        self.resize(usize::try_from(len).map_err(io::Error::other)?, 0);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// How much of a layout has been written so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteProgress {
    pub tables: usize,
    pub files: usize,
    /// One past the last block written.
    pub end_block: u64,
}

pub struct BlockWriter<'o, O: Output + ?Sized> {
    output: &'o mut O,
    block_size: u32,
    buffer: Vec<u8>,
    progress: WriteProgress,
}

fn changed_size(path: &Path) -> CompileError {
    CompileError::unreadable(
        path,
        io::Error::new(
            io::ErrorKind::InvalidData,
            "file changed size while compiling",
        ),
    )
}

impl<'o, O: Output + ?Sized> BlockWriter<'o, O> {
    pub fn new(output: &'o mut O, block_size: u32) -> Self {
        Self {
            output,
            block_size,
            buffer: vec![0; TRANSFER_BUFFER_SIZE],
            progress: WriteProgress {
                end_block: 1,
                ..Default::default()
            },
        }
    }

    fn note_written(&mut self, start_block: u32, block_count: u32) {
        self.progress.end_block = self
            .progress
            .end_block
            .max(u64::from(start_block) + u64::from(block_count));
    }

    /// Pads from `written` to the end of the entry's last block.
    fn pad_tail(
        &mut self,
        range_end: u64,
        written_end: u64,
        path: &Path,
    ) -> Result<(), CompileError> {
        let tail = range_end - written_end;
        if tail > 0 {
            debug!("  pad {tail} bytes @{written_end}");
            self.output
                .zero_fill(written_end, tail as usize)
                .map_err(|e| CompileError::write_failure(path, e))?;
        }
        Ok(())
    }

    pub fn write_table(&mut self, table: &PlannedTable) -> Result<(), CompileError> {
        let range = byte_range(table.start_block, table.block_count, self.block_size);
        let bytes = table.records.as_bytes();
        debug!(
            "write table {:?}: {} records @{}",
            table.path,
            table.records.len(),
            range.start
        );
        assert!(bytes.len() as u64 <= range.end - range.start);

        self.output
            .write_at(range.start, bytes)
            .map_err(|e| CompileError::write_failure(&table.path, e))?;

        // Tables may span several blocks; pad block by block
        let mut offset = range.start + bytes.len() as u64;
        while offset < range.end {
            let chunk_end = (offset / u64::from(self.block_size) + 1) * u64::from(self.block_size);
            self.pad_tail(chunk_end, offset, &table.path)?;
            offset = chunk_end;
        }

        self.progress.tables += 1;
        self.note_written(table.start_block, table.block_count);
        Ok(())
    }

    pub fn write_file(&mut self, file: &PlannedFile) -> Result<(), CompileError> {
        debug!(
            "write file {:?}: {} bytes @block {}",
            file.path, file.size, file.start_block
        );
        match file.content {
            Content::Inline(data) => {
                if data.len() as u64 != file.size {
                    return Err(changed_size(&file.path));
                }
                self.copy_content(&mut &data[..], file)?;
            }
            Content::Host(source) => {
                let mut source =
                    File::open(source).map_err(|e| CompileError::unreadable(&file.path, e))?;
                self.copy_content(&mut source, file)?;
            }
        }

        self.progress.files += 1;
        self.note_written(file.start_block, file.block_count);
        Ok(())
    }

    /// Copies exactly `file.size` bytes from `reader`, then zero-fills the final block.
    fn copy_content(
        &mut self,
        reader: &mut impl Read,
        file: &PlannedFile,
    ) -> Result<(), CompileError> {
        let range = byte_range(file.start_block, file.block_count, self.block_size);
        let mut offset = range.start;
        let mut remaining = file.size;

        while remaining > 0 {
            let want = remaining.min(self.buffer.len() as u64) as usize;
            let n = read_full(reader, &mut self.buffer[..want])
                .map_err(|e| CompileError::unreadable(&file.path, e))?;
            if n < want {
                return Err(changed_size(&file.path));
            }
            self.output
                .write_at(offset, &self.buffer[..n])
                .map_err(|e| CompileError::write_failure(&file.path, e))?;
            offset += n as u64;
            remaining -= n as u64;
        }

        // Anything left over means the file grew since the walk
        let mut extra = [0u8; 1];
        if read_full(reader, &mut extra).map_err(|e| CompileError::unreadable(&file.path, e))? != 0
        {
            return Err(changed_size(&file.path));
        }

        self.pad_tail(range.end, offset, &file.path)
    }

    pub fn progress(&self) -> WriteProgress {
        self.progress
    }
}
