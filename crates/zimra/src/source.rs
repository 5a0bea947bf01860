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

//! Random read access over the archive bytes.
//!
//! Every higher layer asks for half-open byte ranges `[start, end)` and
//! gets back either a slice borrowed from a memory map or a freshly read
//! buffer. Three backends exist: a whole-file map (the common case on
//! 64-bit), a segmented map for files a 32-bit process cannot address in
//! one piece, and plain positional reads for callers that opt out of
//! mapping altogether.

use std::borrow::Cow;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::Mutex;

use memmap2::{Mmap, MmapOptions};

use crate::{Error, Result};

/// Largest file a 32-bit process maps in one piece.
const MAX_SINGLE_MAP: u64 = 1 << 31;

pub(crate) enum ByteSource {
    Mapped(Mmap),
    Segmented(SegmentedFile),
    File(PositionalFile),
}

impl ByteSource {
    pub(crate) fn new(file: File, use_mmap: bool) -> Result<ByteSource> {
        let len = file.metadata()?.len();

        if len == 0 {
            return Err(Error::UnexpectedEndOfBytes);
        }

        if !use_mmap {
            return Ok(ByteSource::File(PositionalFile { file, len }));
        }

        if fits_single_map(len) {
            let map = unsafe { Mmap::map(&file)? };
            Ok(ByteSource::Mapped(map))
        } else {
            let segment_len = default_segment_len();
            Ok(ByteSource::Segmented(SegmentedFile::new(
                file,
                len,
                segment_len,
            )))
        }
    }

    pub(crate) fn len(&self) -> u64 {
        match self {
            ByteSource::Mapped(map) => map.len() as u64,
            ByteSource::Segmented(segmented) => segmented.len,
            ByteSource::File(file) => file.len,
        }
    }

    /// Bytes of the half-open range `[start, end)`.
    ///
    /// Borrowed from the map when the whole file is mapped, owned
    /// otherwise. Callers must not hold borrowed slices beyond the life
    /// of the source.
    pub(crate) fn read_range(&self, start: u64, end: u64) -> Result<Cow<'_, [u8]>> {
        if start > end || end > self.len() {
            return Err(Error::OutOfBounds {
                index: end,
                limit: self.len(),
            });
        }

        match self {
            ByteSource::Mapped(map) => Ok(Cow::Borrowed(&map[start as usize..end as usize])),
            ByteSource::Segmented(segmented) => Ok(Cow::Owned(segmented.read_range(start, end)?)),
            ByteSource::File(file) => Ok(Cow::Owned(file.read_range(start, end)?)),
        }
    }

    pub(crate) fn read_byte(&self, offset: u64) -> Result<u8> {
        Ok(self.read_range(offset, offset.saturating_add(1))?[0])
    }
}

pub(crate) struct PositionalFile {
    file: File,
    len: u64,
}

impl PositionalFile {
    fn read_range(&self, start: u64, end: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0; (end - start) as usize];
        self.file.read_exact_at(&mut buf, start)?;
        Ok(buf)
    }
}

/// A memory map split into fixed-size segments, of which at most one is
/// mapped at a time.
///
/// Reads always copy out under the segment lock: a slice into the active
/// segment could be unmapped by a concurrent remap, and a range may
/// straddle two segments anyway.
pub(crate) struct SegmentedFile {
    file: File,
    len: u64,
    segment_len: u64,
    active: Mutex<Option<ActiveSegment>>,
}

struct ActiveSegment {
    index: u64,
    map: Mmap,
}

impl SegmentedFile {
    /// `segment_len` must be a non-zero multiple of the page size.
    pub(crate) fn new(file: File, len: u64, segment_len: u64) -> SegmentedFile {
        SegmentedFile {
            file,
            len,
            segment_len,
            active: Mutex::new(None),
        }
    }

    fn read_range(&self, start: u64, end: u64) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity((end - start) as usize);
        let mut active = self.active.lock().unwrap();

        let mut pos = start;
        while pos < end {
            let segment = pos / self.segment_len;

            let seg = match &mut *active {
                Some(seg) if seg.index == segment => seg,
                slot => {
                    let offset = segment * self.segment_len;
                    let map_len = self.segment_len.min(self.len - offset) as usize;
                    let map = unsafe {
                        MmapOptions::new()
                            .offset(offset)
                            .len(map_len)
                            .map(&self.file)?
                    };
                    slot.insert(ActiveSegment { index: segment, map })
                }
            };
            let map = &seg.map;

            let local = (pos - segment * self.segment_len) as usize;
            let take = ((end - pos) as usize).min(map.len() - local);
            out.extend_from_slice(&map[local..local + take]);
            pos += take as u64;
        }

        Ok(out)
    }
}

fn fits_single_map(len: u64) -> bool {
    cfg!(target_pointer_width = "64") || len < MAX_SINGLE_MAP
}

fn default_segment_len() -> u64 {
    (MAX_SINGLE_MAP / page_size()) * page_size()
}

fn page_size() -> u64 {
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page <= 0 {
        4096
    } else {
        page as u64
    }
}
