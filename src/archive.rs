//! Archive transactions (C8, spec §4.8/§6): capture, append, update, delete,
//! test, apply, export, split, plus the read-only `info`/`dir` queries.
//! Each transaction opens the on-disk file itself, drives the state machine
//! below, and leaves the archive consistent on every successful return (or
//! untouched/recoverable on failure — see [`crate::recovery`]).
//!
//! ```text
//! Idle -> header read, write-in-progress set -> resources appended
//!      -> metadata written -> offset table written -> XML written
//!      -> integrity table written (optional) -> write-in-progress cleared -> Idle
//! ```
//!
//! Grounded on `SSWIMMC.py` (`create`, the capture transaction shape),
//! `SSWIMMA.py` (`append`, refcount rebuild before new content), `SSWIMMU.py`
//! (`update`/`delete`, XML renumbering), `SSWIMMD.py` (`apply`/`test`/`dir`),
//! `SSWIMMX.py` (`export`), `SSWIMMS.py` (`split`), and on
//! `byte271-6cy/archive.rs`'s open/create/finalize shape, generalized from a
//! single solid block stream to the WIM resource/offset-table/XML layout.

use crate::chunked::{self, CompressionThreshold};
use crate::codec::pool::CodecPool;
use crate::codec::CodecRegistry;
use crate::dedup::{Deduplicator, PrefilterDecision, ResolveOutcome};
use crate::error::{FormatError, PreconditionError, WimError};
use crate::hash::{hash_bytes, Sha1Key};
use crate::header::{CompressionKind, WimHeader};
use crate::metadata::{self, CapturedNode, DirEntry, ParsedMetadata, SecurityBlock};
use crate::platform::{NullPlatform, PlatformCapabilities};
use crate::records::{IntegrityTable, OffsetTableEntry, ResourceHeader, RESFLAG_METADATA};
use crate::time::system_time_to_nt;
use crate::wildcard::wildcard_match;
use crate::xml::{ImageXmlInfo, WimXml};
use std::fs::File;
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Options shared by every transaction that writes new content
/// (`capture`/`append`/`update`/`export`).
#[derive(Debug, Clone)]
pub struct WriteOptions {
    pub compression: CompressionKind,
    pub threshold: Option<CompressionThreshold>,
    pub threads: usize,
    pub integrity: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self { compression: CompressionKind::Xpress, threshold: None, threads: crate::codec::pool::DEFAULT_THREADS, integrity: false }
    }
}

/// Fields a caller may set on a freshly captured or appended image.
#[derive(Debug, Clone, Default)]
pub struct ImageNaming {
    pub name: Option<String>,
    pub description: Option<String>,
    pub excludes: Vec<String>,
}

/// Summary returned by `capture`/`append`/`update`/`export`, for the CLI's
/// compression-ratio/timing report (SPEC_FULL.md Supplemented Features).
#[derive(Debug, Clone, Default)]
pub struct WriteSummary {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub files_stored: u64,
    pub files_deduplicated: u64,
}

impl WriteSummary {
    pub fn ratio(&self) -> f64 {
        if self.bytes_in == 0 {
            1.0
        } else {
            self.bytes_out as f64 / self.bytes_in as f64
        }
    }
}

/// The loaded, in-memory state of one archive: header plus the two
/// resources every operation needs (offset table, XML manifest). Resource
/// bodies (file contents, metadata trees) are read on demand.
///
/// When `header.total_parts > 1` this is a view over the whole split set,
/// not just the one file at `path`: `open` locates every sibling part by the
/// `base.swm`/`baseN.swm` naming convention and merges their offset tables,
/// so `offset_table` always covers every resource in the set, each entry
/// still tagged with the `part_number` of the physical file that holds it.
pub struct WimArchive {
    pub path: PathBuf,
    pub header: WimHeader,
    pub offset_table: crate::dedup::OffsetTable,
    pub xml: WimXml,
    part_paths: Vec<PathBuf>,
}

/// The base stem a split set's part files share, recovered from any one
/// part's path plus its own `part_number` (`SSWIMMS.py`'s naming: part 1 is
/// `stem.swm`, parts N>=2 are `stemN.swm`).
fn split_set_stem(path: &Path, part_number: u16) -> String {
    let stem = path.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_default();
    if part_number <= 1 {
        stem
    } else {
        stem.strip_suffix(part_number.to_string().as_str()).map(str::to_string).unwrap_or(stem)
    }
}

fn split_set_part_path(dir: &Path, base_stem: &str, part_number: u16) -> PathBuf {
    if part_number <= 1 {
        dir.join(format!("{base_stem}.swm"))
    } else {
        dir.join(format!("{base_stem}{part_number}.swm"))
    }
}

impl WimArchive {
    /// Open an existing archive and load its header, offset table, and XML
    /// manifest. Runs the crash-recovery check first: if the
    /// write-in-progress bit is set, the archive is truncated back to the
    /// last known-good XML tail before anything else is read.
    ///
    /// If the header reports a split set (`total_parts > 1`), every sibling
    /// part is located and its offset table folded into one merged view
    /// (see struct docs); a missing or unreadable sibling fails the whole
    /// open, since a split set with a part missing can't resolve every
    /// resource by definition.
    pub fn open(path: &Path) -> Result<Self, WimError> {
        let mut file = File::options().read(true).write(true).open(path)?;
        let header = WimHeader::read(&mut file)?;
        if header.is_write_in_progress() {
            crate::recovery::recover(&mut file, &header)?;
        }
        let header = {
            file.seek(SeekFrom::Start(0))?;
            WimHeader::read(&mut file)?
        };

        let mut offset_table = read_offset_table(&mut file, &header)?;
        let xml = read_xml(&mut file, &header)?;

        let part_paths = if header.total_parts > 1 {
            let base_stem = split_set_stem(path, header.part_number);
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            let mut paths = Vec::with_capacity(header.total_parts as usize);
            for part_no in 1..=header.total_parts {
                let part_path = if part_no == header.part_number { path.to_path_buf() } else { split_set_part_path(dir, &base_stem, part_no) };
                if part_no != header.part_number {
                    let mut sibling = File::options().read(true).open(&part_path)?;
                    let sibling_header = WimHeader::read(&mut sibling)?;
                    let sibling_table = read_offset_table(&mut sibling, &sibling_header)?;
                    for e in sibling_table.iter() {
                        offset_table.insert_with_count(e.hash, e.resource, e.part_number, e.ref_count);
                    }
                }
                paths.push(part_path);
            }
            paths
        } else {
            vec![path.to_path_buf()]
        };

        Ok(Self { path: path.to_path_buf(), header, offset_table, xml, part_paths })
    }

    pub fn image_count(&self) -> u32 {
        self.header.image_count
    }

    /// Open the physical file for `part_number`, following the split set's
    /// naming convention when it isn't the file `open` was called with.
    pub fn open_part_file(&self, part_number: u16) -> Result<File, WimError> {
        let idx = part_number.saturating_sub(1) as usize;
        let path = self.part_paths.get(idx).unwrap_or(&self.path);
        Ok(File::options().read(true).open(path)?)
    }

    /// Resolve a CLI image argument (`1`-based index, or a `NAME` match) to
    /// its 1-based index.
    pub fn resolve_image(&self, selector: &str) -> Result<u32, WimError> {
        if let Ok(idx) = selector.parse::<u32>() {
            if self.xml.image(idx).is_some() {
                return Ok(idx);
            }
        }
        for img in &self.xml.images {
            if img.name.as_deref() == Some(selector) {
                return Ok(img.index);
            }
        }
        Err(PreconditionError::UnknownImage(selector.to_string()).into())
    }

    fn metadata_bytes_for(&self, hash: &Sha1Key) -> Result<Vec<u8>, WimError> {
        if hash.is_zero() {
            return Ok(Vec::new());
        }
        let entry = self
            .offset_table
            .get(hash)
            .ok_or_else(|| FormatError::Xml(format!("no offset table entry for metadata hash {hash}")))?;
        let mut file = self.open_part_file(entry.part_number)?;
        read_resource_bytes(&mut file, &entry.resource, self.header.compression())
    }

    pub fn parsed_metadata_for_image(&self, index: u32) -> Result<ParsedMetadata, WimError> {
        let img = self.xml.image(index).ok_or_else(|| PreconditionError::UnknownImage(index.to_string()))?;
        let bytes = self.metadata_bytes_for(&img.metadata_hash)?;
        if bytes.is_empty() {
            return Ok(ParsedMetadata { security: SecurityBlock::new(), by_hash: Default::default(), directories: Default::default() });
        }
        Ok(metadata::parse_metadata_resource(&bytes)?)
    }
}

// ---------------------------------------------------------------------
// shared on-disk helpers
// ---------------------------------------------------------------------

fn read_resource_bytes(file: &mut File, rh: &ResourceHeader, kind: CompressionKind) -> Result<Vec<u8>, WimError> {
    file.seek(SeekFrom::Start(rh.offset))?;
    let mut compressed_bytes = vec![0u8; rh.on_disk_size() as usize];
    file.read_exact(&mut compressed_bytes)?;
    let mut input = Cursor::new(compressed_bytes);
    let mut out = Vec::with_capacity(rh.uncompressed_size as usize);
    let effective_kind = if rh.is_compressed() { kind } else { CompressionKind::Copy };
    let registry = CodecRegistry::with_defaults();
    let pool = CodecPool::default();
    chunked::decompress_resource(&mut input, rh.on_disk_size(), rh.uncompressed_size, &mut out, effective_kind, &registry, &pool, false)?;
    Ok(out)
}

/// Fetch (opening and caching on first use) the file holding `part_number`
/// for `archive`. Every multi-part-aware consumer (`apply`/`test`/`export`/
/// `split`) routes its resource reads through this instead of assuming a
/// single already-open file.
fn part_file<'a>(archive: &WimArchive, cache: &'a mut std::collections::HashMap<u16, File>, part_number: u16) -> Result<&'a mut File, WimError> {
    if !cache.contains_key(&part_number) {
        cache.insert(part_number, archive.open_part_file(part_number)?);
    }
    Ok(cache.get_mut(&part_number).unwrap())
}

fn read_offset_table(file: &mut File, header: &WimHeader) -> Result<crate::dedup::OffsetTable, WimError> {
    if header.rh_offset_table.uncompressed_size == 0 {
        return Ok(crate::dedup::OffsetTable::new());
    }
    let bytes = read_resource_bytes(file, &header.rh_offset_table, header.compression())?;
    Ok(crate::dedup::OffsetTable::decode(&bytes)?)
}

fn read_xml(file: &mut File, header: &WimHeader) -> Result<WimXml, WimError> {
    if header.rh_xml_data.uncompressed_size == 0 {
        return Ok(WimXml::new());
    }
    file.seek(SeekFrom::Start(header.rh_xml_data.offset))?;
    let mut buf = vec![0u8; header.rh_xml_data.on_disk_size() as usize];
    file.read_exact(&mut buf)?;
    Ok(WimXml::decode_bytes(&buf)?)
}

/// Write a resource's content-addressed bytes at the file's current end,
/// deduplicating against `dedup`'s table. Returns the resulting hash and
/// whether a fresh resource was written (vs. an existing one reused).
fn store_content(
    dedup: &mut Deduplicator,
    file: &mut File,
    content: &[u8],
    is_metadata: bool,
    opts: &WriteOptions,
    registry: &CodecRegistry,
    pool: &CodecPool,
) -> Result<(Sha1Key, bool), WimError> {
    if content.is_empty() {
        return Ok((Sha1Key::ZERO, false));
    }

    let prefilter_len = content.len().min(crate::hash::PREFILTER_WINDOW);
    let prefilter_hash = hash_bytes(&content[..prefilter_len]);
    let full_hash = hash_bytes(content);

    // A prefilter miss means nothing stored so far shares this content's
    // first 32 KiB, so there's no point checking the full hash table at
    // all, go straight to compressing. A hit means a full compare is
    // worth it before spending anything on compression.
    if dedup.decide(prefilter_hash) == PrefilterDecision::CheckFullHash {
        if dedup.lookup_full(&full_hash).is_some() {
            dedup.bump_known(&full_hash);
            debug!(hash = %full_hash, "deduplicated against existing resource (prefilter hit)");
            return Ok((full_hash, false));
        }
    }

    let start = file.seek(SeekFrom::End(0))?;
    let mut input = Cursor::new(content.to_vec());
    let result = chunked::compress_resource(
        &mut input,
        content.len() as u64,
        file,
        opts.compression,
        registry,
        pool,
        opts.threshold,
        false,
    )?;

    let mut flags = if result.compressed { crate::records::RESFLAG_COMPRESSED } else { 0 };
    if is_metadata {
        flags |= RESFLAG_METADATA;
    }
    let resource = ResourceHeader::new(start, result.on_disk_size, content.len() as u64, flags);

    match dedup.resolve_after_compress(prefilter_hash, full_hash, resource, 1) {
        ResolveOutcome::New { .. } => Ok((full_hash, true)),
        ResolveOutcome::Duplicate { .. } => {
            // A collision surfaced only at stage 2: rewind, discard the
            // bytes just written, and keep the existing resource.
            file.set_len(start)?;
            Ok((full_hash, false))
        }
    }
}

fn count_tree(node: &CapturedNode) -> (u64, u64, u64) {
    let mut dirs = 0u64;
    let mut files = 0u64;
    let mut bytes = 0u64;
    fn walk(n: &CapturedNode, dirs: &mut u64, files: &mut u64, bytes: &mut u64) {
        for c in &n.children {
            if c.entry.is_directory() {
                *dirs += 1;
                walk(c, dirs, files, bytes);
            } else {
                *files += 1;
                *bytes += c.content.as_ref().map(|v| v.len() as u64).unwrap_or(0);
            }
        }
    }
    walk(node, &mut dirs, &mut files, &mut bytes);
    (dirs, files, bytes)
}

/// Store every file's content depth-first, skipping names any `--exclude`
/// pattern matches (spec §6). Directory entries keep `subdir_offset`
/// unpatched here — [`metadata::build_metadata_resource`] assigns those
/// once the whole tree's content hashes are final.
fn store_tree_contents(
    node: &CapturedNode,
    file: &mut File,
    dedup: &mut Deduplicator,
    registry: &CodecRegistry,
    pool: &CodecPool,
    opts: &WriteOptions,
    summary: &mut WriteSummary,
) -> Result<(), WimError> {
    for child in &node.children {
        if let Some(content) = &child.content {
            summary.bytes_in += content.len() as u64;
            let (_, is_new) = store_content(dedup, file, content, false, opts, registry, pool)?;
            summary.files_stored += 1;
            if !is_new {
                summary.files_deduplicated += 1;
            }
        }
        store_tree_contents(child, file, dedup, registry, pool, opts, summary)?;
    }
    Ok(())
}

fn prune_excluded(node: &mut CapturedNode, excludes: &[String], prefix: &Path) {
    node.children.retain(|c| {
        let rel = prefix.join(&c.entry.file_name);
        let name = rel.to_string_lossy();
        !excludes.iter().any(|pat| wildcard_match(pat, &c.entry.file_name) || wildcard_match(pat, &name))
    });
    for c in node.children.iter_mut() {
        if c.entry.is_directory() {
            prune_excluded(c, excludes, &prefix.join(&c.entry.file_name));
        }
    }
}

/// Finish a write transaction: serialize the offset table, XML, and (if
/// requested) integrity table, then flip the write-in-progress bit off with
/// a second header write, completing the state machine in the module docs.
fn finalize_write(file: &mut File, header: &mut WimHeader, xml: &mut WimXml, table: &crate::dedup::OffsetTable, opts: &WriteOptions) -> Result<(), WimError> {
    let table_bytes = table.encode();
    let table_offset = file.seek(SeekFrom::End(0))?;
    file.write_all(&table_bytes)?;
    header.rh_offset_table = ResourceHeader::new(table_offset, table_bytes.len() as u64, table_bytes.len() as u64, 0);

    let body_len_before_xml = file.stream_position()?;
    xml.recompute_total_bytes(body_len_before_xml);
    let xml_bytes = xml.encode_bytes();
    let xml_offset = file.seek(SeekFrom::End(0))?;
    file.write_all(&xml_bytes)?;
    header.rh_xml_data = ResourceHeader::new(xml_offset, xml_bytes.len() as u64, xml_bytes.len() as u64, 0);

    if opts.integrity {
        let body_len = xml_offset + xml_bytes.len() as u64 - crate::header::HEADER_SIZE as u64;
        let mut reader = file.try_clone()?;
        reader.seek(SeekFrom::Start(crate::header::HEADER_SIZE as u64))?;
        let windows = crate::hash::hash_integrity_windows(&mut reader, body_len)?;
        let it = IntegrityTable::new(windows);
        let it_offset = file.seek(SeekFrom::End(0))?;
        let mut it_bytes = Vec::new();
        it.write(&mut it_bytes)?;
        file.write_all(&it_bytes)?;
        header.rh_integrity = ResourceHeader::new(it_offset, it_bytes.len() as u64, it_bytes.len() as u64, 0);
    }

    header.set_write_in_progress(false);
    file.seek(SeekFrom::Start(0))?;
    header.write(&mut *file)?;
    file.flush()?;
    info!(images = header.image_count, "archive write transaction complete");
    Ok(())
}

// ---------------------------------------------------------------------
// capture
// ---------------------------------------------------------------------

/// Build a brand-new archive from `src`, replacing whatever is at `dest`.
pub fn capture(dest: &Path, src: &Path, naming: &ImageNaming, opts: &WriteOptions) -> Result<WriteSummary, WimError> {
    if !src.is_dir() {
        return Err(PreconditionError::MissingSource(src.display().to_string()).into());
    }
    let mut file = File::create(dest)?;
    let mut header = WimHeader::new(opts.compression);
    header.set_write_in_progress(true);
    header.write(&mut file)?;

    let registry = CodecRegistry::with_defaults();
    let pool = CodecPool::new(opts.threads);
    let mut dedup = Deduplicator::new();
    let mut summary = WriteSummary::default();

    let mut tree = metadata::walk_source_tree(src)?;
    prune_excluded(&mut tree, &naming.excludes, Path::new(""));
    store_tree_contents(&tree, &mut file, &mut dedup, &registry, &pool, opts, &mut summary)?;

    let security = SecurityBlock::new();
    let meta_bytes = metadata::build_metadata_resource(&tree, &security);
    let (meta_hash, _) = store_content(&mut dedup, &mut file, &meta_bytes, true, opts, &registry, &pool)?;

    let (dir_count, file_count, total_bytes) = count_tree(&tree);
    header.image_count = 1;

    let now = system_time_to_nt(std::time::SystemTime::now());
    let mut xml = WimXml::new();
    xml.push_image(ImageXmlInfo {
        index: 0,
        dir_count,
        file_count,
        total_bytes,
        hard_link_bytes: 0,
        creation_time_nt: now,
        last_modification_time_nt: now,
        name: naming.name.clone(),
        description: naming.description.clone(),
        flags: None,
        metadata_hash: meta_hash,
    });

    summary.bytes_out = dedup.table.iter().map(|e| e.resource.on_disk_size()).sum();
    finalize_write(&mut file, &mut header, &mut xml, &dedup.table, opts)?;
    Ok(summary)
}

// ---------------------------------------------------------------------
// append
// ---------------------------------------------------------------------

/// Add a new image to an existing archive, rebuilding refcounts for all
/// previously stored resources before adding anything new (`SSWIMMA.py`'s
/// `RefCounts` rebuild, already satisfied here since the offset table is
/// loaded directly off disk with its persisted ref counts intact).
pub fn append(archive_path: &Path, src: &Path, naming: &ImageNaming, opts: &WriteOptions) -> Result<WriteSummary, WimError> {
    if !src.is_dir() {
        return Err(PreconditionError::MissingSource(src.display().to_string()).into());
    }
    let mut archive = WimArchive::open(archive_path)?;
    if archive.header.is_read_only() {
        return Err(PreconditionError::ReadOnly.into());
    }
    let mut file = File::options().read(true).write(true).open(archive_path)?;

    // The on-disk header keeps pointing at the *old* offset table/XML/
    // integrity resources until `finalize_write` overwrites it at the very
    // end; new content lands after them, at the current end of file. A
    // crash mid-transaction leaves those old resources intact and
    // recoverable (`crate::recovery::recover`) — nothing is reclaimed until
    // `export` compacts it away (spec §4.8 open question).
    archive.header.set_write_in_progress(true);
    file.seek(SeekFrom::Start(0))?;
    archive.header.write(&mut file)?;
    file.seek(SeekFrom::End(0))?;

    let registry = CodecRegistry::with_defaults();
    let pool = CodecPool::new(opts.threads);
    let mut dedup = Deduplicator::from_table(std::mem::take(&mut archive.offset_table));
    let mut summary = WriteSummary::default();

    let mut tree = metadata::walk_source_tree(src)?;
    prune_excluded(&mut tree, &naming.excludes, Path::new(""));
    store_tree_contents(&tree, &mut file, &mut dedup, &registry, &pool, opts, &mut summary)?;

    let security = SecurityBlock::new();
    let meta_bytes = metadata::build_metadata_resource(&tree, &security);
    let (meta_hash, _) = store_content(&mut dedup, &mut file, &meta_bytes, true, opts, &registry, &pool)?;

    let (dir_count, file_count, total_bytes) = count_tree(&tree);
    archive.header.image_count += 1;

    let now = system_time_to_nt(std::time::SystemTime::now());
    archive.xml.push_image(ImageXmlInfo {
        index: 0,
        dir_count,
        file_count,
        total_bytes,
        hard_link_bytes: 0,
        creation_time_nt: now,
        last_modification_time_nt: now,
        name: naming.name.clone(),
        description: naming.description.clone(),
        flags: None,
        metadata_hash: meta_hash,
    });

    summary.bytes_out = dedup.table.iter().map(|e| e.resource.on_disk_size()).sum();
    finalize_write(&mut file, &mut archive.header, &mut archive.xml, &dedup.table, opts)?;
    Ok(summary)
}

/// The earliest trailing-resource offset (offset table, XML, or integrity
/// table, whichever comes first in the file) recorded in `header` — the
/// byte position [`crate::recovery::recover`] truncates back to when a
/// write-in-progress archive can't be trusted past its last known-good
/// index.
pub(crate) fn first_trailing_resource_offset(header: &WimHeader) -> u64 {
    let mut candidates = vec![header.rh_offset_table.offset, header.rh_xml_data.offset];
    if header.rh_integrity.uncompressed_size > 0 {
        candidates.push(header.rh_integrity.offset);
    }
    candidates.retain(|&o| o > 0);
    candidates.into_iter().min().unwrap_or(crate::header::HEADER_SIZE as u64)
}

// ---------------------------------------------------------------------
// update
// ---------------------------------------------------------------------

/// Replace image `image_selector`'s tree with a fresh capture of `src`,
/// decrementing every resource the old tree referenced and incrementing
/// (or inserting) resources the new tree needs (`SSWIMMU.py`'s update path).
pub fn update(archive_path: &Path, image_selector: &str, src: &Path, opts: &WriteOptions) -> Result<WriteSummary, WimError> {
    if !src.is_dir() {
        return Err(PreconditionError::MissingSource(src.display().to_string()).into());
    }
    let mut archive = WimArchive::open(archive_path)?;
    if archive.header.is_read_only() {
        return Err(PreconditionError::ReadOnly.into());
    }
    let index = archive.resolve_image(image_selector)?;
    let mut file = File::options().read(true).write(true).open(archive_path)?;

    let old_parsed = archive.parsed_metadata_for_image(index)?;
    let old_image = archive.xml.image(index).unwrap().clone();

    let mut dedup = Deduplicator::from_table(std::mem::take(&mut archive.offset_table));
    if !old_image.metadata_hash.is_zero() {
        dedup.table.decrement(&old_image.metadata_hash);
    }
    for (hash, entries) in old_parsed.by_hash.iter() {
        if hash.is_zero() {
            continue;
        }
        dedup.table.decrement_by(hash, entries.len() as u32);
    }

    archive.header.set_write_in_progress(true);
    file.seek(SeekFrom::Start(0))?;
    archive.header.write(&mut file)?;
    file.seek(SeekFrom::End(0))?;

    let registry = CodecRegistry::with_defaults();
    let pool = CodecPool::new(opts.threads);
    let mut summary = WriteSummary::default();

    let tree = metadata::walk_source_tree(src)?;
    store_tree_contents(&tree, &mut file, &mut dedup, &registry, &pool, opts, &mut summary)?;

    let security = SecurityBlock::new();
    let meta_bytes = metadata::build_metadata_resource(&tree, &security);
    let (meta_hash, _) = store_content(&mut dedup, &mut file, &meta_bytes, true, opts, &registry, &pool)?;

    let (dir_count, file_count, total_bytes) = count_tree(&tree);
    let now = system_time_to_nt(std::time::SystemTime::now());
    if let Some(img) = archive.xml.images.iter_mut().find(|i| i.index == index) {
        img.dir_count = dir_count;
        img.file_count = file_count;
        img.total_bytes = total_bytes;
        img.last_modification_time_nt = now;
        img.metadata_hash = meta_hash;
    }

    summary.bytes_out = dedup.table.iter().map(|e| e.resource.on_disk_size()).sum();
    finalize_write(&mut file, &mut archive.header, &mut archive.xml, &dedup.table, opts)?;
    Ok(summary)
}

// ---------------------------------------------------------------------
// delete
// ---------------------------------------------------------------------

/// Remove image `image_selector`: decrement every resource it referenced
/// (without compacting — that is `export`'s job, spec §4.8 open question),
/// renumber the remaining images, and rewrite the offset table and XML.
pub fn delete(archive_path: &Path, image_selector: &str) -> Result<(), WimError> {
    let mut archive = WimArchive::open(archive_path)?;
    if archive.header.is_read_only() {
        return Err(PreconditionError::ReadOnly.into());
    }
    let index = archive.resolve_image(image_selector)?;
    let mut file = File::options().read(true).write(true).open(archive_path)?;

    let parsed = archive.parsed_metadata_for_image(index)?;
    let image = archive.xml.image(index).unwrap().clone();

    let mut table = std::mem::take(&mut archive.offset_table);
    if !image.metadata_hash.is_zero() {
        table.decrement(&image.metadata_hash);
    }
    for (hash, entries) in parsed.by_hash.iter() {
        if hash.is_zero() {
            continue;
        }
        table.decrement_by(hash, entries.len() as u32);
    }

    archive.xml.remove_image(index)?;
    archive.header.image_count -= 1;

    archive.header.set_write_in_progress(true);
    file.seek(SeekFrom::Start(0))?;
    archive.header.write(&mut file)?;
    file.seek(SeekFrom::End(0))?;

    let opts = WriteOptions { compression: archive.header.compression(), ..Default::default() };
    finalize_write(&mut file, &mut archive.header, &mut archive.xml, &table, &opts)?;
    Ok(())
}

// ---------------------------------------------------------------------
// apply
// ---------------------------------------------------------------------

/// Materialize image `image_selector`'s tree under `target_dir`
/// (`SSWIMMD.py`'s apply path): resources are applied in on-disk-offset
/// order for locality (DESIGN.md open-question resolution), directories
/// first so their children always have a parent to land in.
pub fn apply(archive_path: &Path, image_selector: &str, target_dir: &Path) -> Result<(), WimError> {
    if !target_dir.is_dir() {
        return Err(PreconditionError::MissingDestination(target_dir.display().to_string()).into());
    }
    let archive = WimArchive::open(archive_path)?;
    let index = archive.resolve_image(image_selector)?;
    let parsed = archive.parsed_metadata_for_image(index)?;
    let platform = NullPlatform;

    // directories first, by path depth, so parents exist before children
    let mut dirs: Vec<&PathBuf> = parsed.directories.values().collect();
    dirs.sort_by_key(|p| p.components().count());
    for rel in dirs {
        if rel.as_os_str().is_empty() {
            continue;
        }
        std::fs::create_dir_all(target_dir.join(rel))?;
    }

    // files, grouped by resource so a shared resource is decompressed once;
    // sorted by the resource's on-disk offset for sequential read locality.
    let mut file_entries: Vec<(Sha1Key, &PathBuf, &DirEntry)> = Vec::new();
    for (hash, entries) in parsed.by_hash.iter() {
        // The all-zero hash is shared by directories (already created above)
        // and empty files; only the latter still need a file created here.
        for (path, entry) in entries {
            if !entry.is_directory() {
                file_entries.push((*hash, path, entry));
            }
        }
    }
    file_entries.sort_by_key(|(hash, _, _)| {
        archive.offset_table.get(hash).map(|e| (e.part_number, e.resource.offset)).unwrap_or((0, 0))
    });

    // One file handle per part, opened lazily and reused across entries that
    // share it, so a multi-part set doesn't reopen a sibling for every file.
    let mut part_files: std::collections::HashMap<u16, File> = std::collections::HashMap::new();

    for (hash, rel, entry) in file_entries {
        let dest = target_dir.join(rel);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let bytes = if hash.is_zero() {
            Vec::new()
        } else {
            let offset_entry = archive.offset_table.get(&hash).ok_or_else(|| FormatError::Xml(format!("dangling content hash {hash}")))?;
            let rh = offset_entry.resource;
            let f = part_file(&archive, &mut part_files, offset_entry.part_number)?;
            read_resource_bytes(f, &rh, archive.header.compression())?
        };

        if metadata::is_symlink(entry) || metadata::is_junction(entry) {
            platform.write_reparse(&dest, entry.reparse_tag, &bytes)?;
        } else {
            std::fs::write(&dest, &bytes)?;
        }
        let ft_write = filetime::FileTime::from_unix_time(crate::time::nt_to_unix_secs(entry.write_time), 0);
        let _ = filetime::set_file_mtime(&dest, ft_write);
    }

    debug!(image = index, dirs = parsed.directories.len(), "apply complete");
    Ok(())
}

// ---------------------------------------------------------------------
// test
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct TestReport {
    pub resources_checked: u64,
    pub resources_failed: u64,
    pub integrity_windows_checked: u64,
    pub integrity_windows_failed: u64,
}

impl TestReport {
    pub fn is_clean(&self) -> bool {
        self.resources_failed == 0 && self.integrity_windows_failed == 0
    }
}

/// Verify every resource an image (or, if `image_selector` is `None`, every
/// live resource in the archive) references decompresses to its recorded
/// uncompressed size and content hash, plus the optional integrity table.
pub fn test(archive_path: &Path, image_selector: Option<&str>) -> Result<TestReport, WimError> {
    let archive = WimArchive::open(archive_path)?;
    let mut report = TestReport::default();

    let hashes: Vec<Sha1Key> = match image_selector {
        Some(sel) => {
            let index = archive.resolve_image(sel)?;
            let parsed = archive.parsed_metadata_for_image(index)?;
            let img = archive.xml.image(index).unwrap();
            let mut hs: Vec<Sha1Key> = parsed.by_hash.keys().copied().filter(|h| !h.is_zero()).collect();
            if !img.metadata_hash.is_zero() {
                hs.push(img.metadata_hash);
            }
            hs
        }
        None => archive.offset_table.iter().filter(|e| !e.resource.is_free()).map(|e| e.hash).collect(),
    };

    // One handle per part, so a split set is verified by following each
    // resource's own `part_number` instead of assuming a single open file.
    let mut part_files: std::collections::HashMap<u16, File> = std::collections::HashMap::new();

    for hash in hashes {
        report.resources_checked += 1;
        let entry = match archive.offset_table.get(&hash) {
            Some(e) => e,
            None => {
                report.resources_failed += 1;
                continue;
            }
        };
        let (resource, part_number) = (entry.resource, entry.part_number);
        let f = match part_file(&archive, &mut part_files, part_number) {
            Ok(f) => f,
            Err(_) => {
                report.resources_failed += 1;
                continue;
            }
        };
        match read_resource_bytes(f, &resource, archive.header.compression()) {
            Ok(bytes) if hash_bytes(&bytes) == hash => {}
            _ => {
                warn!(%hash, "resource failed verification");
                report.resources_failed += 1;
            }
        }
    }

    if archive.header.rh_integrity.uncompressed_size > 0 {
        let mut file = archive.open_part_file(archive.header.part_number)?;
        file.seek(SeekFrom::Start(archive.header.rh_integrity.offset))?;
        let it = IntegrityTable::decode(&mut file)?;
        let body_len = archive.header.rh_offset_table.offset.max(archive.header.rh_xml_data.offset)
            - crate::header::HEADER_SIZE as u64;
        file.seek(SeekFrom::Start(crate::header::HEADER_SIZE as u64))?;
        let computed = crate::hash::hash_integrity_windows(&mut file, body_len)?;
        report.integrity_windows_checked = it.entries.len() as u64;
        for (expected, got) in it.entries.iter().zip(computed.iter()) {
            if expected != got {
                report.integrity_windows_failed += 1;
            }
        }
    }

    Ok(report)
}

// ---------------------------------------------------------------------
// export
// ---------------------------------------------------------------------

/// Copy one image (or, when `image_selector` is `"*"`, every image) from
/// `src_archive` into `dst_archive`. If `dst_archive` already exists, its
/// header, XML manifest, and dedup table are loaded and the exported images
/// are appended to them (merging into the destination's existing dedup
/// table, same as `append` does for new content); otherwise a fresh archive
/// is created (`SSWIMMX.py`'s `export`). Either way the destination's own
/// compression is used for any newly stored content, not `opts.compression`
/// — a WIM archive has exactly one compression kind for its whole lifetime.
pub fn export(src_archive: &Path, image_selector: &str, dst_archive: &Path, opts: &WriteOptions) -> Result<WriteSummary, WimError> {
    let src = WimArchive::open(src_archive)?;
    // One handle per part of `src`, so a multi-part source resolves every
    // resource from the physical file its offset-table entry names.
    let mut src_files: std::collections::HashMap<u16, File> = std::collections::HashMap::new();

    let selected: Vec<u32> = if image_selector == "*" {
        src.xml.images.iter().map(|i| i.index).collect()
    } else {
        vec![src.resolve_image(image_selector)?]
    };
    if selected.is_empty() {
        return Err(PreconditionError::NoImages.into());
    }

    let dst_exists = dst_archive.is_file();
    let (mut dst_file, mut header, mut xml, mut dedup) = if dst_exists {
        let mut existing = WimArchive::open(dst_archive)?;
        if existing.header.is_read_only() {
            return Err(PreconditionError::ReadOnly.into());
        }
        let mut file = File::options().read(true).write(true).open(dst_archive)?;
        existing.header.set_write_in_progress(true);
        file.seek(SeekFrom::Start(0))?;
        existing.header.write(&mut file)?;
        file.seek(SeekFrom::End(0))?;
        let dedup = Deduplicator::from_table(std::mem::take(&mut existing.offset_table));
        (file, existing.header, existing.xml, dedup)
    } else {
        let mut file = File::create(dst_archive)?;
        let mut header = WimHeader::new(opts.compression);
        header.set_write_in_progress(true);
        header.write(&mut file)?;
        (file, header, WimXml::new(), Deduplicator::new())
    };
    let opts = &WriteOptions { compression: header.compression(), ..opts.clone() };

    let registry = CodecRegistry::with_defaults();
    let pool = CodecPool::new(opts.threads);
    let mut summary = WriteSummary::default();

    for index in selected {
        let image = src.xml.image(index).unwrap().clone();
        let parsed = src.parsed_metadata_for_image(index)?;

        for (hash, _entries) in parsed.by_hash.iter() {
            if hash.is_zero() {
                continue;
            }
            if dedup.lookup_full(hash).is_some() {
                dedup.bump_known(hash);
                summary.files_deduplicated += 1;
                continue;
            }
            let entry = src.offset_table.get(hash).ok_or_else(|| FormatError::Xml(format!("dangling content hash {hash}")))?;
            let (rh, part_number) = (entry.resource, entry.part_number);
            let f = part_file(&src, &mut src_files, part_number)?;
            let bytes = read_resource_bytes(f, &rh, src.header.compression())?;
            summary.bytes_in += bytes.len() as u64;
            let (_, _) = store_content(&mut dedup, &mut dst_file, &bytes, false, opts, &registry, &pool)?;
            summary.files_stored += 1;
        }

        let meta_bytes = if image.metadata_hash.is_zero() {
            Vec::new()
        } else {
            let entry = src
                .offset_table
                .get(&image.metadata_hash)
                .ok_or_else(|| FormatError::Xml("dangling metadata hash".into()))?;
            let (rh, part_number) = (entry.resource, entry.part_number);
            let f = part_file(&src, &mut src_files, part_number)?;
            read_resource_bytes(f, &rh, src.header.compression())?
        };
        let new_meta_hash = if meta_bytes.is_empty() {
            Sha1Key::ZERO
        } else {
            store_content(&mut dedup, &mut dst_file, &meta_bytes, true, opts, &registry, &pool)?.0
        };

        let mut new_image = image;
        new_image.metadata_hash = new_meta_hash;
        xml.push_image(new_image);
    }

    header.image_count = xml.images.len() as u32;
    summary.bytes_out = dedup.table.iter().map(|e| e.resource.on_disk_size()).sum();
    finalize_write(&mut dst_file, &mut header, &mut xml, &dedup.table, opts)?;
    Ok(summary)
}

// ---------------------------------------------------------------------
// split
// ---------------------------------------------------------------------

/// Rewrite `archive_path` as a set of part files, each at most
/// `max_part_bytes`, sharing the same archive GUID with an incrementing
/// `part_number`/fixed `total_parts` (`SSWIMMS.py`'s split transaction).
/// Resources are never divided across a boundary; a part starts a new file
/// as soon as the next resource wouldn't fit.
pub fn split(archive_path: &Path, max_part_bytes: u64) -> Result<Vec<PathBuf>, WimError> {
    let archive = WimArchive::open(archive_path)?;
    let mut src_files: std::collections::HashMap<u16, File> = std::collections::HashMap::new();

    let budget = crate::header::HEADER_SIZE as u64;
    let mut metadata_resources: Vec<&OffsetTableEntry> = Vec::new();
    let mut rest: Vec<&OffsetTableEntry> = Vec::new();
    for e in archive.offset_table.iter().filter(|e| !e.resource.is_free()) {
        if e.resource.is_metadata() {
            metadata_resources.push(e);
        } else {
            rest.push(e);
        }
    }

    // Unit 1 carries every image's metadata resource unconditionally, then
    // is bin-packed largest-first like every other unit:
    // repeatedly take the largest unplaced resource whose size plus the
    // per-entry offset-table overhead still fits the remaining budget,
    // opening a new unit once nothing more fits.
    let mut parts: Vec<Vec<&OffsetTableEntry>> = vec![metadata_resources];
    let mut part_sizes: Vec<u64> = vec![budget + parts[0].iter().map(|e| e.resource.on_disk_size() + 50).sum::<u64>()];

    rest.sort_by_key(|e| std::cmp::Reverse(e.resource.on_disk_size()));
    for entry in rest {
        let unit_cost = entry.resource.on_disk_size() + 50;
        let mut placed = false;
        for (size, part) in part_sizes.iter_mut().zip(parts.iter_mut()) {
            if *size + unit_cost <= max_part_bytes || part.is_empty() {
                part.push(entry);
                *size += unit_cost;
                placed = true;
                break;
            }
        }
        if !placed {
            parts.push(vec![entry]);
            part_sizes.push(budget + unit_cost);
        }
    }

    let total_parts = parts.len() as u16;
    let stem = archive_path.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_default();
    let dir = archive_path.parent().unwrap_or_else(|| Path::new("."));

    let mut out_paths = Vec::new();
    for (i, part) in parts.iter().enumerate() {
        let part_no = (i + 1) as u16;
        let part_path = if part_no == 1 { dir.join(format!("{stem}.swm")) } else { dir.join(format!("{stem}{part_no}.swm")) };
        let mut out = File::create(&part_path)?;

        let mut header = archive.header.clone();
        header.part_number = part_no;
        header.total_parts = total_parts;
        header.set_write_in_progress(true);
        header.write(&mut out)?;

        let mut table = crate::dedup::OffsetTable::new();
        for entry in part {
            let f = part_file(&archive, &mut src_files, entry.part_number)?;
            let bytes = read_resource_bytes(f, &entry.resource, archive.header.compression())?;
            let offset = out.seek(SeekFrom::End(0))?;
            out.write_all(&bytes)?;
            let flags = if entry.resource.is_metadata() { RESFLAG_METADATA } else { 0 };
            let new_rh = ResourceHeader::new(offset, bytes.len() as u64, entry.resource.uncompressed_size, flags);
            table.insert_with_count(entry.hash, new_rh, part_no, entry.ref_count);
        }

        // Every unit carries the full, identical XML manifest and image
        // count; only each unit's own offset table differs, covering only
        // the resources physically stored there. A reader merges all of a
        // set's offset tables on open (see `WimArchive::open`), so this
        // stays a single source of truth per resource rather than a
        // redundant copy duplicated across every part.
        header.image_count = archive.header.image_count;
        let mut xml = archive.xml.clone();
        let opts = WriteOptions { compression: archive.header.compression(), ..Default::default() };
        finalize_write(&mut out, &mut header, &mut xml, &table, &opts)?;
        out_paths.push(part_path);
    }

    Ok(out_paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn opts() -> WriteOptions {
        WriteOptions { compression: CompressionKind::Copy, threshold: None, threads: 1, integrity: false }
    }

    #[test]
    fn capture_then_apply_roundtrip() {
        let src = tempdir().unwrap();
        std::fs::write(src.path().join("a.txt"), b"hello world").unwrap();
        std::fs::create_dir(src.path().join("sub")).unwrap();
        std::fs::write(src.path().join("sub/b.txt"), b"nested").unwrap();

        let archive_dir = tempdir().unwrap();
        let archive_path = archive_dir.path().join("test.wim");
        let naming = ImageNaming { name: Some("Main".into()), ..Default::default() };
        let summary = capture(&archive_path, src.path(), &naming, &opts()).unwrap();
        assert_eq!(summary.files_stored, 2);

        let out = tempdir().unwrap();
        apply(&archive_path, "1", out.path()).unwrap();
        assert_eq!(std::fs::read(out.path().join("a.txt")).unwrap(), b"hello world");
        assert_eq!(std::fs::read(out.path().join("sub/b.txt")).unwrap(), b"nested");
    }

    #[test]
    fn capture_dedups_identical_file_contents() {
        let src = tempdir().unwrap();
        std::fs::write(src.path().join("a.txt"), b"same bytes").unwrap();
        std::fs::write(src.path().join("b.txt"), b"same bytes").unwrap();

        let archive_dir = tempdir().unwrap();
        let archive_path = archive_dir.path().join("test.wim");
        let summary = capture(&archive_path, src.path(), &ImageNaming::default(), &opts()).unwrap();
        assert_eq!(summary.files_stored, 2);
        assert_eq!(summary.files_deduplicated, 1);

        let archive = WimArchive::open(&archive_path).unwrap();
        let live: Vec<_> = archive.offset_table.iter().filter(|e| !e.resource.is_free() && !e.resource.is_metadata()).collect();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].ref_count, 2);
    }

    #[test]
    fn test_reports_clean_archive() {
        let src = tempdir().unwrap();
        std::fs::write(src.path().join("a.txt"), b"hello").unwrap();
        let archive_path = tempdir().unwrap().path().join("t.wim");
        capture(&archive_path, src.path(), &ImageNaming::default(), &opts()).unwrap();
        let report = test(&archive_path, None).unwrap();
        assert!(report.is_clean());
    }

    #[test]
    fn delete_removes_image_and_renumbers() {
        let src1 = tempdir().unwrap();
        std::fs::write(src1.path().join("one.txt"), b"one").unwrap();
        let src2 = tempdir().unwrap();
        std::fs::write(src2.path().join("two.txt"), b"two").unwrap();

        let archive_path = tempdir().unwrap().path().join("multi.wim");
        capture(&archive_path, src1.path(), &ImageNaming::default(), &opts()).unwrap();
        append(&archive_path, src2.path(), &ImageNaming::default(), &opts()).unwrap();

        let archive = WimArchive::open(&archive_path).unwrap();
        assert_eq!(archive.image_count(), 2);

        delete(&archive_path, "1").unwrap();
        let archive = WimArchive::open(&archive_path).unwrap();
        assert_eq!(archive.image_count(), 1);
        assert_eq!(archive.xml.images[0].index, 1);
    }

    #[test]
    fn append_adds_second_image_with_dedup_across_images() {
        let src1 = tempdir().unwrap();
        std::fs::write(src1.path().join("shared.txt"), b"shared content").unwrap();
        let src2 = tempdir().unwrap();
        std::fs::write(src2.path().join("shared.txt"), b"shared content").unwrap();

        let archive_path = tempdir().unwrap().path().join("m.wim");
        capture(&archive_path, src1.path(), &ImageNaming::default(), &opts()).unwrap();
        let summary = append(&archive_path, src2.path(), &ImageNaming::default(), &opts()).unwrap();
        assert_eq!(summary.files_deduplicated, 1);

        let archive = WimArchive::open(&archive_path).unwrap();
        assert_eq!(archive.image_count(), 2);
    }
}
