//! A diff-friendly dump of an image: every block region in address order, labelled with the path
//! that owns it, followed by space statistics.

use std::{
    collections::BTreeMap,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{ensure, Result};

use super::{
    format::{DirectoryEntryRecord, RECORD_SIZE},
    reader::Image,
};

fn utf8_or_hex(data: &[u8]) -> String {
    if let Ok(string) = std::str::from_utf8(data) {
        format!("{:?}", string)
    } else {
        hex::encode(data)
    }
}

enum Segment<'img> {
    Table(&'img [DirectoryEntryRecord]),
    Data(&'img DirectoryEntryRecord),
}

struct Region<'img> {
    block_count: u32,
    segment: Segment<'img>,
    path: PathBuf,
}

struct ImageVisitor<'a, 'img> {
    image: &'a Image<'img>,
    regions: BTreeMap<u32, Region<'img>>,
}

impl<'img> ImageVisitor<'_, 'img> {
    fn note(&mut self, start: u32, region: Region<'img>) -> Result<()> {
        ensure!(
            !self.regions.contains_key(&start),
            "block {start} is claimed twice (by {:?})",
            region.path
        );
        self.regions.insert(start, region);
        Ok(())
    }

    fn visit_table(
        &mut self,
        start: u32,
        block_count: u32,
        records: &'img [DirectoryEntryRecord],
        path: &Path,
    ) -> Result<()> {
        self.note(
            start,
            Region {
                block_count,
                segment: Segment::Table(records),
                path: path.to_path_buf(),
            },
        )?;

        for record in records {
            let child = path.join(self.image.name(record)?);
            if record.is_dir() {
                let table = self.image.directory(record)?;
                self.visit_table(
                    record.start_block.get(),
                    record.block_count.get(),
                    table,
                    &child,
                )?;
            } else if record.block_count.get() > 0 {
                self.image.file_data(record)?;
                self.note(
                    record.start_block.get(),
                    Region {
                        block_count: record.block_count.get(),
                        segment: Segment::Data(record),
                        path: child,
                    },
                )?;
            }
        }
        Ok(())
    }
}

fn write_record(
    output: &mut impl Write,
    index: usize,
    record: &DirectoryEntryRecord,
) -> Result<()> {
    writeln!(
        output,
        "    +{:<4x} {} {} size {} blocks {}+{} parent {} mtime {}",
        index * RECORD_SIZE,
        if record.is_dir() { "dir " } else { "file" },
        utf8_or_hex(record.name()),
        record.size.get(),
        record.start_block.get(),
        record.block_count.get(),
        record.parent.get(),
        record.mtime.get(),
    )?;
    Ok(())
}

/// Writes a dump of `data` to `output`.  Fails if the image is corrupt or regions overlap.
pub fn dump_image(output: &mut impl Write, data: &[u8]) -> Result<()> {
    let image = Image::open(data)?;
    let sb = image.superblock();
    let block_size = u64::from(image.block_size());

    writeln!(output, "{:08x} superblock", 0)?;
    writeln!(output, "    magic: {}", utf8_or_hex(&sb.magic))?;
    writeln!(output, "    version: {}", sb.version)?;
    writeln!(output, "    block_size: {}", image.block_size())?;
    writeln!(output, "    total_blocks: {}", sb.total_blocks.get())?;
    writeln!(output, "    root_table: {}", sb.root_table.get())?;
    writeln!(output, "    root_entries: {}", sb.root_entries.get())?;
    writeln!(output, "    meta_blocks: {}", sb.meta_blocks.get())?;
    writeln!(output, "    data_start: {}", sb.data_start.get())?;
    writeln!(output, "    entry_count: {}", sb.entry_count.get())?;
    writeln!(output)?;

    let mut visitor = ImageVisitor {
        image: &image,
        regions: BTreeMap::new(),
    };
    let root = image.root()?;
    let root_blocks = super::format::table_blocks(root.len(), image.block_size()) as u32;
    visitor.visit_table(sb.root_table.get(), root_blocks, root, Path::new("/"))?;

    let mut stats: BTreeMap<&str, u64> = BTreeMap::new();
    *stats.entry("superblock").or_default() += block_size;

    let mut next = 1;
    for (start, region) in &visitor.regions {
        if *start > next {
            writeln!(output, "*** Unassigned blocks {next}..{start}")?;
            writeln!(output)?;
            *stats.entry("unassigned").or_default() += u64::from(start - next) * block_size;
        } else if *start < next {
            writeln!(output, "*** Overlapping regions at block {start}")?;
            writeln!(output)?;
        }
        next = start + region.block_count;

        let region_len = u64::from(region.block_count) * block_size;
        let path = region.path.as_os_str().as_encoded_bytes();
        writeln!(output, "# Filename {}", utf8_or_hex(path))?;
        match &region.segment {
            Segment::Table(records) => {
                let used = (records.len() * RECORD_SIZE) as u64;
                writeln!(
                    output,
                    "{:08x} directory table ({} blocks, {} entries)",
                    u64::from(*start) * block_size,
                    region.block_count,
                    records.len()
                )?;
                for (index, record) in records.iter().enumerate() {
                    write_record(output, index, record)?;
                }
                *stats.entry("directory tables").or_default() += used;
                *stats.entry("padding").or_default() += region_len - used;
            }
            Segment::Data(record) => {
                let size = u64::from(record.size.get());
                writeln!(
                    output,
                    "{:08x} file data ({} blocks, {} bytes, {} padding)",
                    u64::from(*start) * block_size,
                    region.block_count,
                    size,
                    region_len - size
                )?;
                *stats.entry("file data").or_default() += size;
                *stats.entry("padding").or_default() += region_len - size;
            }
        }
        writeln!(output)?;
    }

    if next < sb.total_blocks.get() {
        writeln!(output, "*** Unassigned blocks {next}..{}", sb.total_blocks.get())?;
        writeln!(output)?;
    }

    writeln!(output, "Space statistics (total size {}B):", data.len())?;
    for (kind, bytes) in stats {
        writeln!(
            output,
            "  {kind} = {bytes}B, {:.2}%",
            (100. * bytes as f64) / data.len() as f64
        )?;
    }

    Ok(())
}
