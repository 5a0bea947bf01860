// Stract is an open source web search engine.
// Copyright (C) 2024 Stract ApS
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Zim file reader.
//! https://wiki.openzim.org/wiki/ZIM_file_format
//!
//! A [`ZimFile`] gives random access to the articles of a ZIM archive:
//! by URL index, by title index, or by URL lookup through a binary
//! search over the archive's sorted pointer table. Only the cluster
//! holding a requested blob is ever decompressed, and decoded clusters
//! are kept in a small shared LRU so hot clusters are not decoded again
//! on every read.
//!
//! The archive is immutable once opened and a `ZimFile` can be shared
//! freely between threads.

mod cache;
mod cluster;
mod decode;
mod entry;
mod header;
mod source;
pub mod wiki;

pub use cluster::Cluster;
pub use entry::{DirEntry, Entry};
pub use header::MimeTypes;
pub use wiki::{Article, ArticleIterator, Image, ImageIterator};

use std::cmp::Ordering;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use cache::ClusterCache;
use cluster::{parse_info_byte, CompressionType};
use entry::ENTRY_WINDOW;
use header::{Header, HEADER_LEN};
use source::ByteSource;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected end of bytes")]
    UnexpectedEndOfBytes,

    #[error("invalid magic number {0:#010x}")]
    InvalidMagicNumber(u32),

    #[error("unsupported ZIM major version {0}")]
    UnsupportedVersion(u16),

    #[error("invalid header: {0}")]
    InvalidHeader(&'static str),

    #[error("invalid directory entry at offset {offset}: {reason}")]
    InvalidDirEntry { offset: u64, reason: &'static str },

    #[error("invalid mime type index {0}")]
    InvalidMimeType(u16),

    #[error("invalid compression type {0}")]
    InvalidCompressionType(u8),

    #[error("unsupported cluster info byte {0:#04x}")]
    UnsupportedClusterInfo(u8),

    #[error("invalid cluster {index}: {reason}")]
    InvalidCluster { index: u32, reason: &'static str },

    #[error("index {index} out of bounds, limit is {limit}")]
    OutOfBounds { index: u64, limit: u64 },

    #[error("invalid UTF-8 string: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("LZMA error: {0}")]
    Lzma(#[from] lzma::Error),

    #[error("redirect chain exceeded {0} hops")]
    RedirectLoop(usize),

    #[error("invalid checksum")]
    InvalidChecksum,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The MIME list hugs the header and fits this window in every corpus
/// we have seen.
const MIME_LIST_WINDOW: u64 = 2048;

/// Knobs for [`ZimFile::open_with`].
#[derive(Debug, Clone)]
pub struct Options {
    /// Map the file into memory instead of issuing positional reads.
    pub use_mmap: bool,
    /// Decoded clusters kept resident; each is typically around a
    /// megabyte.
    pub cluster_cache_capacity: usize,
    /// Bound on redirect chains followed by [`ZimFile::resolve`].
    pub max_redirect_hops: usize,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            use_mmap: true,
            cluster_cache_capacity: 4,
            max_redirect_hops: 16,
        }
    }
}

/// An open ZIM archive.
///
/// Read-only after construction. Directory entries and blob buffers are
/// copied out on demand and owned by the caller; the archive itself only
/// holds its header, MIME list, byte source, and cluster cache.
pub struct ZimFile {
    source: ByteSource,
    header: Header,
    mime_types: MimeTypes,
    cluster_cache: ClusterCache,
    max_redirect_hops: usize,
}

impl ZimFile {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<ZimFile> {
        Self::open_with(path, Options::default())
    }

    pub fn open_with<P: AsRef<Path>>(path: P, options: Options) -> Result<ZimFile> {
        let file = File::open(path)?;
        let source = ByteSource::new(file, options.use_mmap)?;

        let header = {
            let window = source.read_range(0, HEADER_LEN.min(source.len()))?;
            Header::from_bytes(&window, source.len())?
        };

        let mime_types = {
            let end = (header.mime_list_pos + MIME_LIST_WINDOW).min(source.len());
            let window = source.read_range(header.mime_list_pos, end)?;
            MimeTypes::from_bytes(&window)?
        };

        Ok(ZimFile {
            source,
            header,
            mime_types,
            cluster_cache: ClusterCache::new(options.cluster_cache_capacity),
            max_redirect_hops: options.max_redirect_hops,
        })
    }

    /// Number of directory entries (articles, redirects, and sentinels).
    pub fn entry_count(&self) -> u32 {
        self.header.entry_count
    }

    pub fn cluster_count(&self) -> u32 {
        self.header.cluster_count
    }

    /// `(major, minor)` format version of the archive.
    pub fn version(&self) -> (u16, u16) {
        (self.header.major_version, self.header.minor_version)
    }

    pub fn uuid(&self) -> &[u8; 16] {
        &self.header.uuid
    }

    pub fn mime_types(&self) -> &MimeTypes {
        &self.mime_types
    }

    /// The entry at position `index` of the URL pointer table.
    pub fn entry_at_url_index(&self, index: u32) -> Result<Entry<'_>> {
        let offset = self.url_pointer(index)?;

        if offset < HEADER_LEN {
            return Err(Error::InvalidDirEntry {
                offset,
                reason: "entry pointer inside header",
            });
        }

        if offset >= self.header.checksum_pos {
            return Err(Error::InvalidDirEntry {
                offset,
                reason: "entry pointer outside data region",
            });
        }

        let window_end = offset
            .saturating_add(ENTRY_WINDOW)
            .min(self.header.checksum_pos)
            .min(self.source.len());
        let window = self.source.read_range(offset, window_end.max(offset))?;
        let dir_entry = entry::DirEntry::from_bytes(offset, &window, self.mime_types.len())?;

        Ok(Entry::new(self, index, offset, dir_entry))
    }

    /// The entry at position `index` of the title pointer table.
    pub fn entry_at_title_index(&self, index: u32) -> Result<Entry<'_>> {
        let url_index = self.title_pointer(index)?;
        self.entry_at_url_index(url_index)
    }

    /// The archive's designated main page, if it has one.
    pub fn main_page(&self) -> Result<Option<Entry<'_>>> {
        match self.header.main_page() {
            Some(index) => Ok(Some(self.entry_at_url_index(index)?)),
            None => Ok(None),
        }
    }

    /// The archive's designated layout page, if it has one.
    pub fn layout_page(&self) -> Result<Option<Entry<'_>>> {
        match self.header.layout_page() {
            Some(index) => Ok(Some(self.entry_at_url_index(index)?)),
            None => Ok(None),
        }
    }

    /// Binary search for the entry whose `"{namespace}/{url}"` equals
    /// `full_url`.
    ///
    /// The URL pointer table is sorted by `(namespace, url)`, which is
    /// the same order as comparing the formatted URLs byte for byte.
    /// Each probe costs one pointer read and one entry decode.
    pub fn find_by_url(&self, full_url: &str) -> Result<Option<Entry<'_>>> {
        let mut low = 0u32;
        let mut high = self.header.entry_count;

        while low < high {
            let mid = low + (high - low) / 2;
            let entry = self.entry_at_url_index(mid)?;

            let probe = entry.full_url().ok_or(Error::InvalidDirEntry {
                offset: entry.offset(),
                reason: "unaddressable entry in url pointer table",
            })?;

            match probe.as_str().cmp(full_url) {
                Ordering::Equal => return Ok(Some(entry)),
                Ordering::Less => low = mid + 1,
                Ordering::Greater => high = mid,
            }
        }

        Ok(None)
    }

    /// [`find_by_url`](Self::find_by_url), then follow redirects until a
    /// non-redirect entry is reached.
    ///
    /// Chains longer than the configured hop limit fail with
    /// [`Error::RedirectLoop`].
    pub fn resolve(&self, full_url: &str) -> Result<Option<Entry<'_>>> {
        let Some(mut entry) = self.find_by_url(full_url)? else {
            return Ok(None);
        };

        let mut hops = 0;
        while entry.dir_entry().is_redirect() {
            if hops >= self.max_redirect_hops {
                return Err(Error::RedirectLoop(self.max_redirect_hops));
            }

            entry = entry.follow_redirect()?;
            hops += 1;
        }

        Ok(Some(entry))
    }

    /// Iterate the raw directory records in URL order.
    pub fn dir_entries(&self) -> DirEntryIterator<'_> {
        DirEntryIterator { zim: self, index: 0 }
    }

    /// Iterate the title pointer table in title order; each item is a
    /// URL index.
    pub fn iter_titles(&self) -> TitleIterator<'_> {
        TitleIterator { zim: self, index: 0 }
    }

    /// Articles (`A` namespace, `text/html`), grouped by cluster.
    pub fn articles(&self) -> Result<ArticleIterator<'_>> {
        ArticleIterator::new(self)
    }

    /// Images (`I` namespace), grouped by cluster.
    pub fn images(&self) -> Result<ImageIterator<'_>> {
        ImageIterator::new(self)
    }

    /// The decoded image of cluster `index`.
    ///
    /// Compressed clusters go through the shared LRU cache with one
    /// decode in flight per cluster; uncompressed clusters are cheap to
    /// rebuild and bypass it.
    pub fn cluster(&self, index: u32) -> Result<Arc<Cluster>> {
        let (start, end) = self.cluster_range(index)?;
        let info = self.source.read_byte(start)?;
        let (compression, _) = parse_info_byte(info)?;

        if compression == CompressionType::Uncompressed {
            let bytes = self.source.read_range(start, end)?;
            return Ok(Arc::new(Cluster::from_bytes(index, &bytes)?));
        }

        self.cluster_cache.get_or_decode(index, || {
            let bytes = self.source.read_range(start, end)?;
            Cluster::from_bytes(index, &bytes)
        })
    }

    /// Recompute the archive's trailing MD5 and compare.
    pub fn verify_checksum(&self) -> Result<()> {
        const CHUNK: u64 = 1 << 20;

        let checksum_pos = self.header.checksum_pos;
        let mut context = md5::Context::new();

        let mut pos = 0;
        while pos < checksum_pos {
            let end = pos.saturating_add(CHUNK).min(checksum_pos);
            context.consume(&self.source.read_range(pos, end)?);
            pos = end;
        }

        let expected = self
            .source
            .read_range(checksum_pos, checksum_pos.saturating_add(16))?;

        if context.compute().0[..] != expected[..] {
            return Err(Error::InvalidChecksum);
        }

        Ok(())
    }

    pub(crate) fn blob_data(&self, cluster_number: u32, blob_number: u32) -> Result<Vec<u8>> {
        let (start, end) = self.cluster_range(cluster_number)?;
        let info = self.source.read_byte(start)?;
        let (compression, size) = parse_info_byte(info)?;

        if compression == CompressionType::Uncompressed {
            return cluster::read_blob_direct(
                &self.source,
                cluster_number,
                start + 1,
                end,
                size,
                blob_number,
            );
        }

        let cluster = self.cluster_cache.get_or_decode(cluster_number, || {
            let bytes = self.source.read_range(start, end)?;
            Cluster::from_bytes(cluster_number, &bytes)
        })?;

        Ok(cluster.get_blob(blob_number)?.to_vec())
    }

    fn url_pointer(&self, index: u32) -> Result<u64> {
        if index >= self.header.entry_count {
            return Err(Error::OutOfBounds {
                index: u64::from(index),
                limit: u64::from(self.header.entry_count),
            });
        }

        let pos = self.header.url_ptr_pos + u64::from(index) * 8;
        decode::u64_le(&self.source.read_range(pos, pos + 8)?)
    }

    fn title_pointer(&self, index: u32) -> Result<u32> {
        if index >= self.header.entry_count {
            return Err(Error::OutOfBounds {
                index: u64::from(index),
                limit: u64::from(self.header.entry_count),
            });
        }

        let pos = self.header.title_ptr_pos + u64::from(index) * 4;
        decode::u32_le(&self.source.read_range(pos, pos + 4)?)
    }

    /// File byte range `[start, end)` of cluster `index`; the last
    /// cluster ends where the trailing checksum begins.
    fn cluster_range(&self, index: u32) -> Result<(u64, u64)> {
        if index >= self.header.cluster_count {
            return Err(Error::OutOfBounds {
                index: u64::from(index),
                limit: u64::from(self.header.cluster_count),
            });
        }

        let pos = self.header.cluster_ptr_pos + u64::from(index) * 8;
        let start = decode::u64_le(&self.source.read_range(pos, pos + 8)?)?;

        let end = if index + 1 < self.header.cluster_count {
            decode::u64_le(&self.source.read_range(pos + 8, pos + 16)?)?
        } else {
            self.header.checksum_pos
        };

        if start > end {
            return Err(Error::InvalidCluster {
                index,
                reason: "cluster pointers not monotonic",
            });
        }

        Ok((start, end))
    }
}

impl std::fmt::Debug for ZimFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZimFile")
            .field("version", &self.version())
            .field("entry_count", &self.header.entry_count)
            .field("cluster_count", &self.header.cluster_count)
            .field("mime_types", &self.mime_types.len())
            .finish()
    }
}

pub struct DirEntryIterator<'a> {
    zim: &'a ZimFile,
    index: u32,
}

impl<'a> Iterator for DirEntryIterator<'a> {
    type Item = Result<DirEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.zim.entry_count() {
            return None;
        }

        let item = self
            .zim
            .entry_at_url_index(self.index)
            .map(Entry::into_dir_entry);
        self.index += 1;

        Some(item)
    }
}

pub struct TitleIterator<'a> {
    zim: &'a ZimFile,
    index: u32,
}

impl<'a> Iterator for TitleIterator<'a> {
    type Item = Result<u32>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.zim.entry_count() {
            return None;
        }

        let item = self.zim.title_pointer(self.index);
        self.index += 1;

        Some(item)
    }
}
