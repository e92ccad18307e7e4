//! Reads a source tree from the host filesystem.

use std::{
    ffi::OsStr,
    io,
    os::{fd::OwnedFd, unix::ffi::OsStrExt},
    path::Path,
};

use log::{debug, info, warn};
use rustix::fs::{fstat, openat, statat, AtFlags, Dir, FileType, Mode, OFlags, CWD};

use crate::{
    compile::CompileOptions,
    error::CompileError,
    image::format::check_name,
    tree::{Directory, File, SourceEntry, Stat},
};

#[derive(Debug)]
pub struct SourceReader<'o> {
    options: &'o CompileOptions,
    skipped: usize,
}

impl<'o> SourceReader<'o> {
    pub fn new(options: &'o CompileOptions) -> Self {
        Self {
            options,
            skipped: 0,
        }
    }

    /// Number of entries skipped because the image can't represent them.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    fn stat(fd: &OwnedFd, ifmt: FileType, path: &Path) -> Result<rustix::fs::Stat, CompileError> {
        let buf = fstat(fd).map_err(|e| CompileError::unreadable(path, e))?;

        if FileType::from_raw_mode(buf.st_mode) != ifmt {
            return Err(CompileError::unreadable(
                path,
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    "file type changed between readdir() and fstat()",
                ),
            ));
        }

        Ok(buf)
    }

    fn host_stat(buf: &rustix::fs::Stat) -> Stat {
        Stat {
            mtime: buf.st_mtime as i64,
        }
    }

    fn read_file(
        &mut self,
        dirfd: &OwnedFd,
        name: &OsStr,
        path: &Path,
    ) -> Result<File, CompileError> {
        // Opening the file now proves it is readable; the content is streamed at write time
        let fd = openat(
            dirfd,
            name,
            OFlags::RDONLY | OFlags::NOFOLLOW | OFlags::CLOEXEC,
            Mode::empty(),
        )
        .map_err(|e| CompileError::unreadable(path, e))?;

        let buf = Self::stat(&fd, FileType::RegularFile, path)?;
        let size = buf.st_size as u64;
        if size > self.options.max_file_size {
            return Err(CompileError::SourceTooLarge {
                path: path.to_path_buf(),
                size,
                max: self.options.max_file_size,
            });
        }

        debug!("file {path:?}: {size} bytes");
        Ok(File::host(path, size, Self::host_stat(&buf)))
    }

    fn file_type(
        dirfd: &OwnedFd,
        name: &OsStr,
        hint: FileType,
        path: &Path,
    ) -> Result<FileType, CompileError> {
        // Some filesystems don't fill in d_type
        if hint != FileType::Unknown {
            return Ok(hint);
        }
        let buf = statat(dirfd, name, AtFlags::SYMLINK_NOFOLLOW)
            .map_err(|e| CompileError::unreadable(path, e))?;
        Ok(FileType::from_raw_mode(buf.st_mode))
    }

    /// Reads the directory `name` (relative to `dirfd`) and everything below it.
    pub fn read_directory(
        &mut self,
        dirfd: impl rustix::fd::AsFd,
        name: &OsStr,
        path: &Path,
        follow: bool,
    ) -> Result<Directory, CompileError> {
        let nofollow = if follow {
            OFlags::empty()
        } else {
            OFlags::NOFOLLOW
        };
        let fd = openat(
            dirfd,
            name,
            OFlags::RDONLY | OFlags::DIRECTORY | OFlags::CLOEXEC | nofollow,
            Mode::empty(),
        )
        .map_err(|e| CompileError::unreadable(path, e))?;

        let buf = Self::stat(&fd, FileType::Directory, path)?;
        let mut directory = Directory::new(Self::host_stat(&buf));

        for item in Dir::read_from(&fd).map_err(|e| CompileError::unreadable(path, e))? {
            let entry = item.map_err(|e| CompileError::unreadable(path, e))?;
            let name = OsStr::from_bytes(entry.file_name().to_bytes());

            if name == "." || name == ".." {
                continue;
            }

            let child_path = path.join(name);
            let entry = match Self::file_type(&fd, name, entry.file_type(), &child_path)? {
                FileType::Directory => {
                    check_name(name).map_err(|e| CompileError::bad_name(&child_path, e))?;
                    let dir = self.read_directory(&fd, name, &child_path, false)?;
                    SourceEntry::Directory(Box::new(dir))
                }
                FileType::RegularFile => {
                    check_name(name).map_err(|e| CompileError::bad_name(&child_path, e))?;
                    SourceEntry::File(self.read_file(&fd, name, &child_path)?)
                }
                other => {
                    warn!("skipping {child_path:?}: {other:?} can't be stored in the image");
                    self.skipped += 1;
                    continue;
                }
            };
            directory.insert(name, entry);
        }

        Ok(directory)
    }
}

/// Reads the tree rooted at `path`.  The root itself may be a symlink to a directory; nothing
/// below it is followed.
pub fn read_from_path(path: &Path, options: &CompileOptions) -> Result<Directory, CompileError> {
    let mut reader = SourceReader::new(options);
    let root = reader.read_directory(CWD, path.as_os_str(), path, true)?;
    info!(
        "read {} entries from {path:?}, skipped {}",
        root.count_entries(),
        reader.skipped()
    );
    Ok(root)
}

#[cfg(test)]
mod test {
    use std::{fs, os::unix::fs::symlink};

    use similar_asserts::assert_eq;

    use super::*;
    use crate::{
        image::format::{MAX_FILE_SIZE, MAX_NAME_LEN},
        test::{tempdir, write_tree},
        tree::Content,
    };

    fn names(dir: &Directory) -> Vec<String> {
        dir.entries()
            .map(|(name, _)| name.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn walk_is_sorted() {
        let td = tempdir();
        write_tree(
            td.path(),
            &[
                ("zz", b"last"),
                ("b/c.txt", b"hello"),
                ("a.txt", b"0123456789"),
                ("B", b"upper"),
                ("empty/", b""),
            ],
        );

        let root = read_from_path(td.path(), &CompileOptions::default()).unwrap();
        assert_eq!(names(&root), ["B", "a.txt", "b", "empty", "zz"]);

        match root.get(OsStr::new("a.txt")) {
            Some(SourceEntry::File(file)) => {
                assert_eq!(file.size, 10);
                assert!(matches!(&file.content, Content::Host(p) if p == &td.path().join("a.txt")));
            }
            other => panic!("unexpected {other:?}"),
        }
        match root.get(OsStr::new("empty")) {
            Some(SourceEntry::Directory(dir)) => assert!(dir.is_empty()),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(root.count_entries(), 6);
    }

    #[test]
    fn name_length_boundary() {
        let td = tempdir();
        let ok = "n".repeat(MAX_NAME_LEN);
        fs::write(td.path().join(&ok), b"x").unwrap();
        assert!(read_from_path(td.path(), &CompileOptions::default()).is_ok());

        let long = "n".repeat(MAX_NAME_LEN + 1);
        fs::create_dir(td.path().join(&long)).unwrap();
        match read_from_path(td.path(), &CompileOptions::default()) {
            Err(CompileError::NameTooLong { path, len, max }) => {
                assert_eq!(path, td.path().join(&long));
                assert_eq!(len, MAX_NAME_LEN + 1);
                assert_eq!(max, MAX_NAME_LEN);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn non_utf8_name_is_invalid() {
        let td = tempdir();
        fs::write(td.path().join(OsStr::from_bytes(b"bad\xff")), b"x").unwrap();
        assert!(matches!(
            read_from_path(td.path(), &CompileOptions::default()),
            Err(CompileError::InvalidName { .. })
        ));
    }

    #[test]
    fn file_size_boundary() {
        let td = tempdir();
        let big = fs::File::create(td.path().join("big")).unwrap();

        // sparse, so this costs no disk space
        big.set_len(MAX_FILE_SIZE).unwrap();
        assert!(read_from_path(td.path(), &CompileOptions::default()).is_ok());

        big.set_len(MAX_FILE_SIZE + 1).unwrap();
        assert!(matches!(
            read_from_path(td.path(), &CompileOptions::default()),
            Err(CompileError::SourceTooLarge { size, max, .. })
                if size == MAX_FILE_SIZE + 1 && max == MAX_FILE_SIZE
        ));
    }

    #[test]
    fn configured_size_limit() {
        let td = tempdir();
        write_tree(td.path(), &[("d/f", b"12345")]);
        let options = CompileOptions {
            max_file_size: 4,
            ..CompileOptions::default()
        };
        match read_from_path(td.path(), &options) {
            Err(CompileError::SourceTooLarge { path, size, max }) => {
                assert_eq!(path, td.path().join("d/f"));
                assert_eq!((size, max), (5, 4));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn symlinks_are_skipped() {
        let td = tempdir();
        write_tree(td.path(), &[("src/real", b"data")]);
        symlink("real", td.path().join("src/link")).unwrap();
        symlink(td.path().join("src"), td.path().join("root-link")).unwrap();

        // the root may be reached through a symlink
        let root =
            read_from_path(&td.path().join("root-link"), &CompileOptions::default()).unwrap();
        assert_eq!(names(&root), ["real"]);
    }

    #[test]
    fn missing_root_is_unreadable() {
        let td = tempdir();
        assert!(matches!(
            read_from_path(&td.path().join("absent"), &CompileOptions::default()),
            Err(CompileError::UnreadableSource { .. })
        ));
    }

    #[test]
    fn root_must_be_a_directory() {
        let td = tempdir();
        write_tree(td.path(), &[("file", b"")]);
        assert!(matches!(
            read_from_path(&td.path().join("file"), &CompileOptions::default()),
            Err(CompileError::UnreadableSource { .. })
        ));
    }
}
