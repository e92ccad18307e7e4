//! Property-based tests: images are deterministic, and decoding an image gives back the tree it
//! was compiled from.

use std::path::PathBuf;

use proptest::prelude::*;

use blockfs::{
    compile_to_vec,
    image::{
        format::{DirectoryEntryRecord, RECORD_SIZE},
        reader::Image,
    },
    tree::{Content, Directory, File, SourceEntry, Stat},
    CompileOptions,
};

/// Strategy for path components.  A small alphabet so that generated paths share directories.
fn component_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        "[a-d]{1,2}",
        "[a-zA-Z0-9][a-zA-Z0-9._-]{0,35}",
    ]
}

fn content_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        Just(vec![]),
        prop::collection::vec(any::<u8>(), 1..600),
        // straddling a few block boundaries
        (1000usize..5000).prop_map(|n| (0..n).map(|i| (i % 251) as u8).collect()),
    ]
}

fn tree_strategy() -> impl Strategy<Value = Directory> {
    let entry = (
        prop::collection::vec(component_strategy(), 1..4),
        content_strategy(),
        0i64..2_000_000_000,
    );
    prop::collection::vec(entry, 0..24).prop_map(|entries| {
        let mut root = Directory::new(Stat { mtime: 1 });
        for (components, data, mtime) in entries {
            let path: PathBuf = components.iter().collect();
            let mut file = File::inline(data);
            file.stat = Stat { mtime };
            // a path that runs through an existing file is just dropped
            let _ = root.add_file(&path, file);
        }
        root
    })
}

fn block_size_strategy() -> impl Strategy<Value = u32> {
    prop_oneof![Just(512), Just(1024), Just(2048), Just(4096)]
}

/// Checks that `records` describe exactly the entries of `dir`, recursively.
fn compare_dir(
    image: &Image,
    dir: &Directory,
    records: &[DirectoryEntryRecord],
    table: u32,
    parent: u32,
) -> Result<(), TestCaseError> {
    let bs = u64::from(image.block_size());
    prop_assert_eq!(records.len(), dir.len());

    let mut last_start = 0;
    for ((name, entry), record) in dir.entries().zip(records) {
        prop_assert_eq!(image.name(record).unwrap(), name.to_str().unwrap());
        prop_assert_eq!(record.parent.get(), parent);
        prop_assert_eq!(record.mtime.get(), entry.stat().mtime as u64);

        match entry {
            SourceEntry::Directory(subdir) => {
                prop_assert!(record.is_dir());
                prop_assert_eq!(record.size.get() as usize, subdir.len() * RECORD_SIZE);
                let start = record.start_block.get();
                prop_assert!(start > table);
                let sub = image.directory(record).unwrap();
                compare_dir(image, subdir, sub, start, table)?;
            }
            SourceEntry::File(file) => {
                prop_assert!(record.is_file());
                let Content::Inline(data) = &file.content else {
                    unreachable!()
                };
                prop_assert_eq!(image.file_data(record).unwrap(), &data[..]);
                prop_assert_eq!(
                    u64::from(record.block_count.get()),
                    file.size.div_ceil(bs)
                );
                prop_assert!(image.file_tail(record).unwrap().iter().all(|b| *b == 0));

                // files are laid out in traversal order
                if record.block_count.get() > 0 {
                    prop_assert!(record.start_block.get() >= image.superblock().data_start.get());
                    prop_assert!(record.start_block.get() > last_start);
                    last_start = record.start_block.get();
                }
            }
        }
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        .. ProptestConfig::default()
    })]

    #[test]
    fn compile_is_deterministic(root in tree_strategy(), block_size in block_size_strategy()) {
        let options = CompileOptions { block_size, ..Default::default() };
        let first = compile_to_vec(&root, &options).unwrap();
        let second = compile_to_vec(&root, &options).unwrap();
        prop_assert!(first == second);
    }

    #[test]
    fn decode_gives_back_the_tree(root in tree_strategy(), block_size in block_size_strategy()) {
        let options = CompileOptions { block_size, ..Default::default() };
        let data = compile_to_vec(&root, &options).unwrap();

        let image = Image::open(&data).unwrap();
        let sb = image.superblock();
        prop_assert_eq!(
            data.len() as u64,
            u64::from(sb.total_blocks.get()) * u64::from(block_size)
        );
        prop_assert_eq!(sb.entry_count.get() as usize, root.count_entries());

        let root_table = sb.root_table.get();
        compare_dir(&image, &root, image.root().unwrap(), root_table, root_table)?;
    }
}
