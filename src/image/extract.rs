//! Unpacks an image into a host directory, restoring names, content and modification times.

use std::{collections::HashSet, ffi::OsStr, fs::File, io::Write, os::fd::OwnedFd, path::Path};

use anyhow::{bail, ensure, Context, Result};
use log::debug;
use rustix::{
    fs::{futimens, mkdirat, openat, Mode, OFlags, Timespec, Timestamps, CWD},
    io::Errno,
};

use super::{
    format::{check_name, DirectoryEntryRecord},
    reader::Image,
};

fn set_mtime(fd: &OwnedFd, mtime: u64) -> Result<()> {
    let time = Timespec {
        tv_sec: mtime.try_into()?,
        tv_nsec: 0,
    };
    futimens(
        fd,
        &Timestamps {
            last_access: time,
            last_modification: time,
        },
    )?;
    Ok(())
}

struct Extractor<'a, 'img> {
    image: &'a Image<'img>,
    /// Start blocks of the tables extracted so far.
    seen: HashSet<u32>,
}

impl Extractor<'_, '_> {
    fn write_file(
        &self,
        record: &DirectoryEntryRecord,
        dirfd: &OwnedFd,
        name: &OsStr,
    ) -> Result<()> {
        let data = self.image.file_data(record)?;
        let fd = openat(
            dirfd,
            name,
            OFlags::CREATE | OFlags::EXCL | OFlags::WRONLY | OFlags::CLOEXEC,
            Mode::from_raw_mode(0o644),
        )?;
        let mut file = File::from(fd);
        file.write_all(data)?;
        set_mtime(&OwnedFd::from(file), record.mtime.get())
    }

    fn write_directory(
        &mut self,
        record: &DirectoryEntryRecord,
        dirfd: &OwnedFd,
        name: &OsStr,
    ) -> Result<()> {
        let records = self.image.directory(record)?;
        // every table belongs to exactly one directory
        ensure!(
            self.seen.insert(record.start_block.get()),
            "Table at block {} is reachable twice",
            record.start_block.get()
        );

        match mkdirat(dirfd, name, Mode::from_raw_mode(0o755)) {
            Ok(()) | Err(Errno::EXIST) => {}
            Err(e) => Err(e)?,
        }

        let fd = openat(
            dirfd,
            name,
            OFlags::RDONLY | OFlags::DIRECTORY | OFlags::NOFOLLOW | OFlags::CLOEXEC,
            Mode::empty(),
        )?;
        self.write_directory_contents(records, &fd)?;
        // after the contents, which would otherwise bump it again
        set_mtime(&fd, record.mtime.get())
    }

    fn write_directory_contents(
        &mut self,
        records: &[DirectoryEntryRecord],
        fd: &OwnedFd,
    ) -> Result<()> {
        for record in records {
            let name = self.image.name(record)?;
            // a crafted image could otherwise escape the destination
            if check_name(OsStr::new(name)).is_err() {
                bail!("Refusing to extract entry named {name:?}");
            }
            let name = OsStr::new(name);

            if record.is_dir() {
                self.write_directory(record, fd, name)
            } else {
                self.write_file(record, fd, name)
            }
            .with_context(|| format!("Extracting {name:?}"))?;
        }

        Ok(())
    }
}

/// Writes the contents of `image` into the existing directory `dest`.  Existing files are not
/// overwritten.
pub fn extract(image: &Image, dest: &Path) -> Result<()> {
    let fd = openat(
        CWD,
        dest,
        OFlags::RDONLY | OFlags::DIRECTORY | OFlags::CLOEXEC,
        Mode::empty(),
    )
    .with_context(|| format!("Opening {dest:?}"))?;

    let mut extractor = Extractor {
        image,
        seen: HashSet::from([image.superblock().root_table.get()]),
    };
    extractor.write_directory_contents(image.root()?, &fd)?;
    debug!("extracted {} entries to {dest:?}", image.superblock().entry_count.get());
    Ok(())
}
