//! In-memory representation of a source tree.
//!
//! Directories keep their entries in a `BTreeMap` keyed by name, so iteration order is always the
//! byte order of the names.  That order decides the on-disk layout, so it must never depend on the
//! order in which the host filesystem happened to list the entries.

use std::{
    collections::BTreeMap,
    ffi::OsStr,
    path::{Component, Path, PathBuf},
};

use thiserror::Error;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stat {
    /// Modification time in seconds since the epoch.
    pub mtime: i64,
}

/// Where the bytes of a file come from when the image is written.
#[derive(Debug, Clone)]
pub enum Content {
    /// Bytes held in memory.
    Inline(Box<[u8]>),
    /// A host file, streamed at write time.  Its length must still match `File::size`.
    Host(PathBuf),
}

#[derive(Debug, Clone)]
pub struct File {
    pub stat: Stat,
    pub size: u64,
    pub content: Content,
}

#[derive(Debug, Default)]
pub struct Directory {
    pub stat: Stat,
    entries: BTreeMap<Box<OsStr>, SourceEntry>,
}

#[derive(Debug)]
pub enum SourceEntry {
    Directory(Box<Directory>),
    File(File),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    File,
}

#[derive(Error, Debug)]
pub enum TreeError {
    #[error("Invalid filename {0:?}")]
    InvalidFilename(Box<OsStr>),
    #[error("Directory entry {0:?} does not exist")]
    NotFound(Box<OsStr>),
    #[error("Directory entry {0:?} is not a subdirectory")]
    NotADirectory(Box<OsStr>),
}

impl File {
    pub fn inline(data: impl Into<Box<[u8]>>) -> Self {
        let data = data.into();
        Self {
            stat: Stat::default(),
            size: data.len() as u64,
            content: Content::Inline(data),
        }
    }

    pub fn host(path: impl Into<PathBuf>, size: u64, stat: Stat) -> Self {
        Self {
            stat,
            size,
            content: Content::Host(path.into()),
        }
    }
}

impl SourceEntry {
    pub fn kind(&self) -> EntryKind {
        match self {
            SourceEntry::Directory(..) => EntryKind::Directory,
            SourceEntry::File(..) => EntryKind::File,
        }
    }

    pub fn stat(&self) -> &Stat {
        match self {
            SourceEntry::Directory(dir) => &dir.stat,
            SourceEntry::File(file) => &file.stat,
        }
    }
}

impl Directory {
    pub fn new(stat: Stat) -> Self {
        Self {
            stat,
            entries: BTreeMap::new(),
        }
    }

    /// Iterates over the entries of this directory in byte order of their names.
    pub fn entries(&self) -> impl Iterator<Item = (&OsStr, &SourceEntry)> {
        self.entries.iter().map(|(k, v)| (k.as_ref(), v))
    }

    pub fn get(&self, name: &OsStr) -> Option<&SourceEntry> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Inserts an entry, replacing any existing entry of the same name.
    pub fn insert(&mut self, name: &OsStr, entry: SourceEntry) {
        self.entries.insert(Box::from(name), entry);
    }

    /// Gets a mutable reference to a subdirectory of this directory.
    ///
    /// The path is taken relative to this directory even if it starts with '/'.  It may not
    /// contain "." or ".." components.
    pub fn get_directory_mut(&mut self, pathname: &Path) -> Result<&mut Directory, TreeError> {
        let mut dir = self;

        for component in pathname.components() {
            dir = match component {
                Component::RootDir => dir,
                Component::Prefix(..) | Component::CurDir | Component::ParentDir => {
                    return Err(TreeError::InvalidFilename(pathname.as_os_str().into()))
                }
                Component::Normal(filename) => match dir.entries.get_mut(filename) {
                    Some(SourceEntry::Directory(subdir)) => subdir,
                    Some(_) => return Err(TreeError::NotADirectory(filename.into())),
                    None => return Err(TreeError::NotFound(filename.into())),
                },
            };
        }

        Ok(dir)
    }

    /// Creates a subdirectory and any missing parents, returning the innermost one.
    pub fn mkdir_all(&mut self, pathname: &Path) -> Result<&mut Directory, TreeError> {
        let mut dir = self;

        for component in pathname.components() {
            dir = match component {
                Component::RootDir => dir,
                Component::Prefix(..) | Component::CurDir | Component::ParentDir => {
                    return Err(TreeError::InvalidFilename(pathname.as_os_str().into()))
                }
                Component::Normal(filename) => {
                    match dir
                        .entries
                        .entry(Box::from(filename))
                        .or_insert_with(|| SourceEntry::Directory(Box::default()))
                    {
                        SourceEntry::Directory(subdir) => subdir,
                        SourceEntry::File(..) => {
                            return Err(TreeError::NotADirectory(filename.into()))
                        }
                    }
                }
            };
        }

        Ok(dir)
    }

    /// Adds a file at `pathname`, creating parent directories as needed.
    pub fn add_file(&mut self, pathname: &Path, file: File) -> Result<(), TreeError> {
        let Some(name) = pathname.file_name() else {
            return Err(TreeError::InvalidFilename(pathname.as_os_str().into()));
        };
        let parent = pathname.parent().unwrap_or(Path::new(""));
        self.mkdir_all(parent)?.insert(name, SourceEntry::File(file));
        Ok(())
    }

    /// The newest modification time of this directory and everything below it.
    pub fn newest_mtime(&self) -> i64 {
        self.entries
            .values()
            .map(|entry| match entry {
                SourceEntry::Directory(dir) => dir.newest_mtime(),
                SourceEntry::File(file) => file.stat.mtime,
            })
            .fold(self.stat.mtime, i64::max)
    }

    /// Number of entries in this directory and all of its subdirectories.
    pub fn count_entries(&self) -> usize {
        self.entries
            .values()
            .map(|entry| match entry {
                SourceEntry::Directory(dir) => 1 + dir.count_entries(),
                SourceEntry::File(..) => 1,
            })
            .sum()
    }
}
