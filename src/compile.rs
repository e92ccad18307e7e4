//! The compile pipeline: plan, reserve, write, assemble; plus safe replacement of the destination.

use std::{
    ffi::OsString,
    fs::Permissions,
    io,
    os::{fd::OwnedFd, unix::fs::PermissionsExt},
    path::{Path, PathBuf},
    time::UNIX_EPOCH,
};

use log::{debug, info};
use rustix::{
    fs::{flock, openat, FlockOperation, Mode, OFlags, CWD},
    io::Errno,
};

use crate::{
    error::CompileError,
    image::{
        assembler::ImageAssembler,
        format::{self, DEFAULT_BLOCK_SIZE, MAX_BLOCKS, MAX_FILE_SIZE},
        writer::{BlockWriter, Output},
    },
    layout::plan,
    tree::Directory,
};

pub use crate::image::assembler::ImageSummary;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileOptions {
    /// Bytes per block: 512, 1024, 2048 or 4096.
    pub block_size: u32,
    /// Largest file accepted, at most `MAX_FILE_SIZE`.
    pub max_file_size: u64,
    /// Largest image accepted, in blocks.  Useful to match a fixed-size target disk.
    pub max_blocks: u32,
    /// Recorded as every entry's mtime instead of the host's, for reproducible images.
    pub timestamp: Option<u64>,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            max_file_size: MAX_FILE_SIZE,
            max_blocks: MAX_BLOCKS as u32,
            timestamp: None,
        }
    }
}

impl CompileOptions {
    pub fn validate(&self) -> Result<(), CompileError> {
        if format::block_shift(self.block_size).is_none() {
            return Err(CompileError::InvalidOptions(format!(
                "block size {} is not one of 512, 1024, 2048, 4096",
                self.block_size
            )));
        }
        if self.max_file_size > MAX_FILE_SIZE {
            return Err(CompileError::InvalidOptions(format!(
                "maximum file size {} exceeds the format limit of {MAX_FILE_SIZE}",
                self.max_file_size
            )));
        }
        // superblock plus one root table block
        if self.max_blocks < 2 {
            return Err(CompileError::InvalidOptions(format!(
                "maximum block count {} is below the minimum image size of 2",
                self.max_blocks
            )));
        }
        Ok(())
    }
}

/// Compiles `root` into `output`, which must support random-access writes.
pub fn compile_tree<O: Output + ?Sized>(
    root: &Directory,
    options: &CompileOptions,
    output: &mut O,
) -> Result<ImageSummary, CompileError> {
    let layout = plan(root, options)?;
    let assembler = ImageAssembler::new(&layout);

    assembler.reserve(output)?;

    let mut writer = BlockWriter::new(output, layout.block_size);
    for table in &layout.tables {
        writer.write_table(table)?;
    }
    for file in &layout.files {
        writer.write_file(file)?;
    }
    let progress = writer.progress();

    assembler.finish(output, progress)
}

/// Compiles `root` into a buffer in memory.
pub fn compile_to_vec(root: &Directory, options: &CompileOptions) -> Result<Vec<u8>, CompileError> {
    let mut image = vec![];
    compile_tree(root, options, &mut image)?;
    Ok(image)
}

/// An exclusive `flock` on `.<image name>.lock` next to the image.  Released when dropped; the
/// lock file itself is left in place.
#[derive(Debug)]
struct OutputLock {
    _fd: OwnedFd,
}

impl OutputLock {
    fn acquire(dest: &Path) -> Result<Self, CompileError> {
        let path = lock_path(dest)?;
        let fd = openat(
            CWD,
            &path,
            OFlags::CREATE | OFlags::RDWR | OFlags::NOFOLLOW | OFlags::CLOEXEC,
            Mode::from_raw_mode(0o644),
        )
        .map_err(|e| CompileError::write_failure(&path, e))?;

        match flock(&fd, FlockOperation::NonBlockingLockExclusive) {
            Ok(()) => Ok(Self { _fd: fd }),
            Err(Errno::WOULDBLOCK) => Err(CompileError::OutputLocked {
                path: dest.to_path_buf(),
            }),
            Err(e) => Err(CompileError::write_failure(&path, e)),
        }
    }
}

fn output_dir(dest: &Path) -> &Path {
    match dest.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

fn lock_path(dest: &Path) -> Result<PathBuf, CompileError> {
    let Some(name) = dest.file_name() else {
        return Err(CompileError::write_failure(
            dest,
            io::Error::new(io::ErrorKind::InvalidInput, "not a file name"),
        ));
    };
    let mut lock_name = OsString::from(".");
    lock_name.push(name);
    lock_name.push(".lock");
    Ok(output_dir(dest).join(lock_name))
}

/// Compiles `root` into the image file at `dest`.
///
/// The image is built in a temporary file next to `dest` and renamed over it only once it is
/// complete, so on failure a previous image at `dest` is left as it was.  `dest` is locked for
/// the duration of the run.
pub fn compile_to_path(
    root: &Directory,
    dest: &Path,
    options: &CompileOptions,
) -> Result<ImageSummary, CompileError> {
    let dir = output_dir(dest);
    let _lock = OutputLock::acquire(dest)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".blockfs-")
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(|e| CompileError::write_failure(dir, e))?;
    debug!("building {dest:?} in {:?}", tmp.path());

    let summary = compile_tree(root, options, tmp.as_file_mut())?;

    tmp.as_file()
        .set_permissions(Permissions::from_mode(0o644))
        .map_err(|e| CompileError::write_failure(dest, e))?;
    tmp.persist(dest)
        .map_err(|e| CompileError::write_failure(dest, e.error))?;

    info!("wrote {dest:?} ({} bytes)", summary.image_len());
    Ok(summary)
}

/// Whether the image at `dest` is newer than everything in `root`.
///
/// Timestamps are compared in whole seconds, and an image from the same second as the newest
/// source entry counts as stale.
pub fn image_is_current(root: &Directory, dest: &Path) -> bool {
    let Ok(modified) = std::fs::metadata(dest).and_then(|m| m.modified()) else {
        return false;
    };
    let Ok(image_mtime) = modified.duration_since(UNIX_EPOCH) else {
        return false;
    };
    let newest = root.newest_mtime();
    debug!("newest source mtime {newest}, image mtime {}", image_mtime.as_secs());
    i64::try_from(image_mtime.as_secs()).is_ok_and(|image| image > newest)
}
