//! Assigns block ranges to every directory table and file.
//!
//! The planner does no I/O: it consumes a [`Directory`] tree and produces a [`Layout`] that the
//! writer and assembler follow.  Directory tables live in a metadata region right after the
//! superblock, file content in a data region after that.  Both regions are filled in pre-order,
//! name-sorted, by explicit [`BlockAllocator`] cursors, so the same tree always yields the same
//! layout.

use std::path::{Path, PathBuf};

use log::debug;

use crate::{
    compile::CompileOptions,
    error::CompileError,
    image::format::{
        self, blocks_for, table_blocks, DirectoryEntryRecord, KIND_DIRECTORY, KIND_FILE,
        RECORD_SIZE,
    },
    tree::{Content, Directory, SourceEntry},
};

/// A bump allocator over block numbers.
#[derive(Debug, Clone)]
pub struct BlockAllocator {
    next: u64,
    limit: u64,
}

impl BlockAllocator {
    /// Hands out blocks starting at `first`; no range may extend past `limit`.
    pub fn new(first: u64, limit: u64) -> Self {
        Self { next: first, limit }
    }

    /// Reserves `count` contiguous blocks and returns the first, or `None` if they don't fit.
    pub fn allocate(&mut self, count: u64) -> Option<u32> {
        let start = self.next;
        let end = start.checked_add(count)?;
        if end > self.limit {
            return None;
        }
        self.next = end;
        u32::try_from(start).ok()
    }

    pub fn next_free(&self) -> u64 {
        self.next
    }
}

/// One directory table and where it goes.
#[derive(Debug)]
pub struct PlannedTable {
    pub path: PathBuf,
    pub start_block: u32,
    pub block_count: u32,
    pub records: Vec<DirectoryEntryRecord>,
}

/// One file's content and where it goes.
#[derive(Debug)]
pub struct PlannedFile<'a> {
    pub path: PathBuf,
    pub start_block: u32,
    pub block_count: u32,
    pub size: u64,
    pub content: &'a Content,
}

#[derive(Debug)]
pub struct Layout<'a> {
    pub block_size: u32,
    /// Tables in ascending block order; the root table comes first.
    pub tables: Vec<PlannedTable>,
    /// Non-empty files in ascending block order.  Empty files have a record but no blocks.
    pub files: Vec<PlannedFile<'a>>,
    pub root_table: u32,
    pub root_entries: u32,
    pub meta_blocks: u32,
    pub data_start: u32,
    pub total_blocks: u32,
    pub entry_count: u32,
}

impl Layout<'_> {
    pub fn image_len(&self) -> u64 {
        u64::from(self.total_blocks) * u64::from(self.block_size)
    }
}

struct Planner<'a, 'o> {
    options: &'o CompileOptions,
    block_size: u32,
    limit: u64,
    meta: BlockAllocator,
    data: BlockAllocator,
    tables: Vec<PlannedTable>,
    files: Vec<PlannedFile<'a>>,
    entry_count: u32,
}

fn count_table_blocks(dir: &Directory, block_size: u32) -> u64 {
    let mut total = table_blocks(dir.len(), block_size);
    for (_, entry) in dir.entries() {
        if let SourceEntry::Directory(subdir) = entry {
            total += count_table_blocks(subdir, block_size);
        }
    }
    total
}

impl<'a> Planner<'a, '_> {
    fn too_large(&self, path: &Path) -> CompileError {
        CompileError::ImageTooLarge {
            path: path.to_path_buf(),
            max: self.limit,
        }
    }

    fn allocate_table(&mut self, dir: &Directory, path: &Path) -> Result<(u32, u32), CompileError> {
        let count = table_blocks(dir.len(), self.block_size);
        let start = self
            .meta
            .allocate(count)
            .ok_or_else(|| self.too_large(path))?;
        Ok((start, count as u32))
    }

    fn plan_file(
        &mut self,
        record: &mut DirectoryEntryRecord,
        size: u64,
        content: &'a Content,
        path: PathBuf,
    ) -> Result<(), CompileError> {
        if size > self.options.max_file_size {
            return Err(CompileError::SourceTooLarge {
                path,
                size,
                max: self.options.max_file_size,
            });
        }

        let count = blocks_for(size, self.block_size);
        let start = if count == 0 {
            0
        } else {
            self.data
                .allocate(count)
                .ok_or_else(|| self.too_large(&path))?
        };

        debug!("file {path:?}: {size} bytes at block {start} (+{count})");

        // max_file_size never exceeds the 32-bit size field, so neither of these can truncate
        record.size = (size as u32).into();
        record.start_block = start.into();
        record.block_count = (count as u32).into();

        if count > 0 {
            self.files.push(PlannedFile {
                path,
                start_block: start,
                block_count: count as u32,
                size,
                content,
            });
        }
        Ok(())
    }

    /// Lays out the children of `dir`, whose own table has already been reserved at `table`.
    /// `parent_table` is the table of the directory containing `dir` (itself, for the root).
    fn plan_directory(
        &mut self,
        dir: &'a Directory,
        path: &Path,
        table: (u32, u32),
        parent_table: u32,
    ) -> Result<(), CompileError> {
        let (start_block, block_count) = table;
        debug!(
            "directory {path:?}: {} entries, table at block {start_block} (+{block_count})",
            dir.len()
        );

        // Reserve our slot now so that tables stay in allocation order
        let me = self.tables.len();
        self.tables.push(PlannedTable {
            path: path.to_path_buf(),
            start_block,
            block_count,
            records: Vec::with_capacity(dir.len()),
        });

        let mut records = Vec::with_capacity(dir.len());
        for (name, entry) in dir.entries() {
            let child_path = path.join(name);
            let kind = match entry {
                SourceEntry::Directory(..) => KIND_DIRECTORY,
                SourceEntry::File(..) => KIND_FILE,
            };
            let mut record = DirectoryEntryRecord::new(name, kind)
                .map_err(|err| CompileError::bad_name(&child_path, err))?;
            record.parent = parent_table.into();
            record.mtime = self
                .options
                .timestamp
                .unwrap_or_else(|| entry.stat().mtime.max(0) as u64)
                .into();

            self.entry_count = self
                .entry_count
                .checked_add(1)
                .ok_or_else(|| self.too_large(&child_path))?;

            match entry {
                SourceEntry::Directory(subdir) => {
                    let size = u32::try_from(subdir.len() * RECORD_SIZE)
                        .map_err(|_| self.too_large(&child_path))?;
                    let subtable = self.allocate_table(subdir, &child_path)?;
                    record.size = size.into();
                    record.start_block = subtable.0.into();
                    record.block_count = subtable.1.into();
                    self.plan_directory(subdir, &child_path, subtable, start_block)?;
                }
                SourceEntry::File(file) => {
                    self.plan_file(&mut record, file.size, &file.content, child_path)?;
                }
            }

            records.push(record);
        }

        self.tables[me].records = records;
        Ok(())
    }
}

/// Computes the complete layout of the image for `root`.
pub fn plan<'a>(root: &'a Directory, options: &CompileOptions) -> Result<Layout<'a>, CompileError> {
    options.validate()?;
    let block_size = options.block_size;
    let limit = u64::from(options.max_blocks);
    let root_path = Path::new("/");

    let meta_blocks = count_table_blocks(root, block_size);
    let data_start = 1 + meta_blocks;
    if data_start > limit {
        return Err(CompileError::ImageTooLarge {
            path: root_path.to_path_buf(),
            max: limit,
        });
    }

    let mut planner = Planner {
        options,
        block_size,
        limit,
        meta: BlockAllocator::new(1, data_start),
        data: BlockAllocator::new(data_start, limit),
        tables: vec![],
        files: vec![],
        entry_count: 0,
    };

    let root_table = planner.allocate_table(root, root_path)?;
    planner.plan_directory(root, root_path, root_table, root_table.0)?;
    assert_eq!(planner.meta.next_free(), data_start);

    let total_blocks = planner.data.next_free();
    debug!(
        "layout: {} tables in {meta_blocks} blocks, {} files, {total_blocks} blocks total",
        planner.tables.len(),
        planner.files.len()
    );

    // Everything below is bounded by `limit`, which is itself a u32
    Ok(Layout {
        block_size,
        tables: planner.tables,
        files: planner.files,
        root_table: root_table.0,
        root_entries: root.len() as u32,
        meta_blocks: meta_blocks as u32,
        data_start: data_start as u32,
        total_blocks: total_blocks as u32,
        entry_count: planner.entry_count,
    })
}

/// Bytes of the block range occupied by an entry.
pub fn byte_range(start_block: u32, block_count: u32, block_size: u32) -> std::ops::Range<u64> {
    let start = u64::from(start_block) * u64::from(block_size);
    start..start + u64::from(block_count) * u64::from(block_size)
}

/// Upper bound on the number of records a table of `block_count` blocks can hold.
pub fn table_capacity(block_count: u32, block_size: u32) -> usize {
    block_count as usize * block_size as usize / format::RECORD_SIZE
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::tree::File;

    fn options() -> CompileOptions {
        CompileOptions::default()
    }

    fn sample_tree() -> Directory {
        let mut root = Directory::default();
        root.add_file(Path::new("a.txt"), File::inline(vec![b'a'; 10]))
            .unwrap();
        root.add_file(Path::new("b/c.txt"), File::inline(vec![b'c'; 5000]))
            .unwrap();
        root
    }

    #[test]
    fn allocator_respects_limit() {
        let mut alloc = BlockAllocator::new(1, 10);
        assert_eq!(alloc.allocate(4), Some(1));
        assert_eq!(alloc.allocate(0), Some(5));
        assert_eq!(alloc.allocate(5), Some(5));
        assert_eq!(alloc.allocate(1), None);
        assert_eq!(alloc.next_free(), 10);
    }

    #[test]
    fn empty_root() {
        let root = Directory::default();
        let layout = plan(&root, &options()).unwrap();
        assert_eq!(layout.total_blocks, 2);
        assert_eq!(layout.root_table, 1);
        assert_eq!(layout.root_entries, 0);
        assert_eq!(layout.meta_blocks, 1);
        assert_eq!(layout.data_start, 2);
        assert_eq!(layout.tables.len(), 1);
        assert!(layout.tables[0].records.is_empty());
        assert!(layout.files.is_empty());
        assert_eq!(layout.image_len(), 1024);
    }

    #[test]
    fn file_and_subdirectory() {
        let root = sample_tree();
        let layout = plan(&root, &options()).unwrap();

        // superblock + root table + b's table + a.txt + c.txt
        assert_eq!(layout.total_blocks, 1 + 1 + 1 + 1 + 10);
        assert_eq!(layout.root_entries, 2);
        assert_eq!(layout.entry_count, 3);

        let root_records = &layout.tables[0].records;
        assert_eq!(root_records.len(), 2);
        assert_eq!(root_records[0].name(), b"a.txt");
        assert!(root_records[0].is_file());
        assert_eq!(root_records[0].start_block.get(), 3);
        assert_eq!(root_records[0].block_count.get(), 1);
        assert_eq!(root_records[1].name(), b"b");
        assert!(root_records[1].is_dir());
        assert_eq!(root_records[1].start_block.get(), 2);
        assert_eq!(root_records[1].size.get(), 64);

        let b_records = &layout.tables[1].records;
        assert_eq!(layout.tables[1].path, Path::new("/b"));
        assert_eq!(b_records[0].name(), b"c.txt");
        assert_eq!(b_records[0].size.get(), 5000);
        assert_eq!(b_records[0].start_block.get(), 4);
        assert_eq!(b_records[0].block_count.get(), 10);
        assert_eq!(b_records[0].parent.get(), 1);
    }

    #[test]
    fn tables_and_files_are_ascending() {
        let mut root = Directory::default();
        for path in ["x/y/z/1", "x/2", "a/3", "m/n/4", "5"] {
            root.add_file(Path::new(path), File::inline(vec![1u8; 700]))
                .unwrap();
        }
        let layout = plan(&root, &options()).unwrap();

        let tables: Vec<u32> = layout.tables.iter().map(|t| t.start_block).collect();
        assert!(tables.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(tables.last().map(|t| t + 1), Some(layout.data_start));

        let files: Vec<u32> = layout.files.iter().map(|f| f.start_block).collect();
        assert!(files.windows(2).all(|w| w[0] + 2 == w[1]));
        assert_eq!(files[0], layout.data_start);

        // pre-order: root, a, m, m/n, x, x/y, x/y/z
        let paths: Vec<_> = layout.tables.iter().map(|t| t.path.clone()).collect();
        let expected: Vec<PathBuf> = ["/", "/a", "/m", "/m/n", "/x", "/x/y", "/x/y/z"]
            .iter()
            .map(PathBuf::from)
            .collect();
        assert_eq!(paths, expected);
    }

    #[test]
    fn parent_links_point_at_dotdot() {
        let mut root = Directory::default();
        root.add_file(Path::new("d/e/f"), File::inline(*b"f"))
            .unwrap();
        let layout = plan(&root, &options()).unwrap();
        let [root_t, d_t, e_t] = &layout.tables[..] else {
            panic!("expected three tables");
        };
        assert_eq!(root_t.records[0].parent.get(), root_t.start_block);
        assert_eq!(d_t.records[0].parent.get(), root_t.start_block);
        assert_eq!(e_t.records[0].parent.get(), d_t.start_block);
    }

    #[test]
    fn large_directory_table_spans_blocks() {
        let mut root = Directory::default();
        for i in 0..9 {
            root.add_file(Path::new(&format!("f{i}")), File::inline(*b""))
                .unwrap();
        }
        let layout = plan(&root, &options()).unwrap();
        assert_eq!(layout.tables[0].block_count, 2);
        assert_eq!(table_capacity(2, 512), 16);
        // empty files take no blocks
        assert_eq!(layout.total_blocks, 3);
        assert!(layout.files.is_empty());
        assert!(layout.tables[0]
            .records
            .iter()
            .all(|r| r.start_block.get() == 0 && r.block_count.get() == 0));
    }

    #[test]
    fn block_size_changes_block_counts() {
        let root = sample_tree();
        let options = CompileOptions {
            block_size: 4096,
            ..CompileOptions::default()
        };
        let layout = plan(&root, &options).unwrap();
        assert_eq!(layout.total_blocks, 1 + 1 + 1 + 1 + 2);
    }

    #[test]
    fn image_too_large() {
        let root = sample_tree();
        let options = CompileOptions {
            max_blocks: 13,
            ..CompileOptions::default()
        };
        match plan(&root, &options) {
            Err(CompileError::ImageTooLarge { path, max }) => {
                assert_eq!(path, Path::new("/b/c.txt"));
                assert_eq!(max, 13);
            }
            other => panic!("unexpected {other:?}"),
        }

        let options = CompileOptions {
            max_blocks: 14,
            ..CompileOptions::default()
        };
        assert_eq!(plan(&root, &options).unwrap().total_blocks, 14);
    }

    #[test]
    fn oversized_name_in_built_tree() {
        let mut root = Directory::default();
        let name = "x".repeat(format::MAX_NAME_LEN + 1);
        root.add_file(Path::new(&name), File::inline(*b"")).unwrap();
        assert!(matches!(
            plan(&root, &options()),
            Err(CompileError::NameTooLong { .. })
        ));
    }

    #[test]
    fn file_size_limit() {
        let mut root = Directory::default();
        root.add_file(Path::new("f"), File::inline(vec![0u8; 100]))
            .unwrap();
        let at_limit = CompileOptions {
            max_file_size: 100,
            ..CompileOptions::default()
        };
        assert!(plan(&root, &at_limit).is_ok());
        let below = CompileOptions {
            max_file_size: 99,
            ..CompileOptions::default()
        };
        assert!(matches!(
            plan(&root, &below),
            Err(CompileError::SourceTooLarge { size: 100, max: 99, .. })
        ));
    }

    #[test]
    fn timestamp_override() {
        let mut root = Directory::default();
        let mut file = File::inline(*b"x");
        file.stat.mtime = 1234;
        root.add_file(Path::new("f"), file).unwrap();

        let layout = plan(&root, &options()).unwrap();
        assert_eq!(layout.tables[0].records[0].mtime.get(), 1234);

        let fixed = CompileOptions {
            timestamp: Some(7),
            ..CompileOptions::default()
        };
        let layout = plan(&root, &fixed).unwrap();
        assert_eq!(layout.tables[0].records[0].mtime.get(), 7);
    }
}
