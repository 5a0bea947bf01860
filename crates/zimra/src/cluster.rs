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

//! Cluster decoding and blob extraction.
//!
//! A cluster is an info byte followed by a (usually compressed) body:
//! a blob-offset table of `n + 1` entries and then the blob bytes. All
//! offsets are relative to the start of the body. The blob count is not
//! stored; it follows from the first offset, since the blobs start right
//! after the table.

use std::io::{BufReader, Cursor, Read};

use crate::source::ByteSource;
use crate::{decode, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CompressionType {
    Uncompressed,
    Lzma,
    Zstd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OffsetSize {
    U32,
    U64,
}

impl OffsetSize {
    pub(crate) fn width(self) -> u64 {
        match self {
            OffsetSize::U32 => 4,
            OffsetSize::U64 => 8,
        }
    }

    fn read_from(self, reader: &mut impl Read) -> Result<u64> {
        match self {
            OffsetSize::U32 => {
                let mut buf = [0u8; 4];
                read_exact_stream(reader, &mut buf)?;
                Ok(u64::from(u32::from_le_bytes(buf)))
            }
            OffsetSize::U64 => {
                let mut buf = [0u8; 8];
                read_exact_stream(reader, &mut buf)?;
                Ok(u64::from_le_bytes(buf))
            }
        }
    }

    fn decode(self, bytes: &[u8]) -> Result<u64> {
        match self {
            OffsetSize::U32 => decode::u32_le(bytes).map(u64::from),
            OffsetSize::U64 => decode::u64_le(bytes),
        }
    }
}

/// Split the cluster info byte into its compression tag (low nibble) and
/// offset width (bit 4). The remaining bits are reserved; a file setting
/// them asks for features this reader does not have.
pub(crate) fn parse_info_byte(info: u8) -> Result<(CompressionType, OffsetSize)> {
    if info & 0xe0 != 0 {
        return Err(Error::UnsupportedClusterInfo(info));
    }

    let size = if info & 0x10 == 0 {
        OffsetSize::U32
    } else {
        OffsetSize::U64
    };

    let compression = match info & 0x0f {
        0 | 1 => CompressionType::Uncompressed,
        4 => CompressionType::Lzma,
        5 => CompressionType::Zstd,
        tag => return Err(Error::InvalidCompressionType(tag)),
    };

    Ok((compression, size))
}

enum CompressedReader<'a> {
    Uncompressed(BufReader<Cursor<&'a [u8]>>),
    Lzma(Box<BufReader<lzma::Reader<BufReader<&'a [u8]>>>>),
    Zstd(BufReader<zstd::Decoder<'a, BufReader<&'a [u8]>>>),
}

impl<'a> CompressedReader<'a> {
    fn new(compression: CompressionType, bytes: &'a [u8]) -> Result<Self> {
        Ok(match compression {
            CompressionType::Uncompressed => {
                CompressedReader::Uncompressed(BufReader::new(Cursor::new(bytes)))
            }
            CompressionType::Lzma => {
                let decoder = lzma::Reader::from(BufReader::new(bytes))?;
                CompressedReader::Lzma(Box::new(BufReader::new(decoder)))
            }
            CompressionType::Zstd => {
                let decoder = zstd::Decoder::new(bytes)?;
                CompressedReader::Zstd(BufReader::new(decoder))
            }
        })
    }
}

impl<'a> std::io::Read for CompressedReader<'a> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            CompressedReader::Uncompressed(reader) => reader.read(buf),
            CompressedReader::Lzma(reader) => reader.read(buf),
            CompressedReader::Zstd(reader) => reader.read(buf),
        }
    }
}

fn read_exact_stream(reader: &mut impl Read, buf: &mut [u8]) -> Result<()> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::UnexpectedEndOfBytes
        } else {
            Error::Io(e)
        }
    })
}

/// A decoded cluster image: the blob-offset table plus the decompressed
/// blob bytes.
#[derive(Debug)]
pub struct Cluster {
    blob_offsets: Vec<u64>,
    blobs: Vec<u8>,
}

impl Cluster {
    /// Decode a whole cluster from its file bytes `[cstart, cend)`,
    /// info byte included.
    ///
    /// The decompressed stream is consumed exactly through the last blob
    /// offset; the offset table must be monotonically non-decreasing.
    pub(crate) fn from_bytes(index: u32, bytes: &[u8]) -> Result<Cluster> {
        let info = *bytes.first().ok_or(Error::UnexpectedEndOfBytes)?;
        let (compression, size) = parse_info_byte(info)?;
        let mut reader = CompressedReader::new(compression, &bytes[1..])?;

        let width = size.width();
        let first = size.read_from(&mut reader)?;

        if first < width || first % width != 0 {
            return Err(Error::InvalidCluster {
                index,
                reason: "misaligned blob offset table",
            });
        }

        let count = first / width;
        let mut blob_offsets = Vec::with_capacity(count.min(4096) as usize);
        blob_offsets.push(first);

        for _ in 1..count {
            let offset = size.read_from(&mut reader)?;

            if offset < *blob_offsets.last().unwrap() {
                return Err(Error::InvalidCluster {
                    index,
                    reason: "blob offsets not monotonic",
                });
            }

            blob_offsets.push(offset);
        }

        let blob_len = *blob_offsets.last().unwrap() - first;
        let mut blobs = Vec::new();
        std::io::copy(&mut (&mut reader).take(blob_len), &mut blobs)?;

        if (blobs.len() as u64) < blob_len {
            return Err(Error::UnexpectedEndOfBytes);
        }

        Ok(Cluster {
            blob_offsets,
            blobs,
        })
    }

    pub fn blob_count(&self) -> u32 {
        (self.blob_offsets.len() - 1) as u32
    }

    /// The bytes of blob `blob_number`, borrowed from the decoded image.
    pub fn get_blob(&self, blob_number: u32) -> Result<&[u8]> {
        let blob_count = self.blob_count();

        if blob_number >= blob_count {
            return Err(Error::OutOfBounds {
                index: u64::from(blob_number),
                limit: u64::from(blob_count),
            });
        }

        let first = self.blob_offsets[0];
        let b = blob_number as usize;
        let start = (self.blob_offsets[b] - first) as usize;
        let end = (self.blob_offsets[b + 1] - first) as usize;

        Ok(&self.blobs[start..end])
    }
}

/// Extract one blob of an uncompressed cluster straight through the byte
/// provider, without materializing the cluster image.
///
/// `body_start` points just past the info byte; offsets in the table are
/// relative to it.
pub(crate) fn read_blob_direct(
    source: &ByteSource,
    index: u32,
    body_start: u64,
    body_end: u64,
    size: OffsetSize,
    blob_number: u32,
) -> Result<Vec<u8>> {
    let width = size.width();
    let body_len = body_end.saturating_sub(body_start);

    if body_len < width {
        return Err(Error::UnexpectedEndOfBytes);
    }

    let first = size.decode(&source.read_range(body_start, body_start + width)?)?;

    if first < width || first % width != 0 || first > body_len {
        return Err(Error::InvalidCluster {
            index,
            reason: "misaligned blob offset table",
        });
    }

    let count = first / width;

    if u64::from(blob_number) + 1 >= count {
        return Err(Error::OutOfBounds {
            index: u64::from(blob_number),
            limit: count - 1,
        });
    }

    let entry_pos = body_start + u64::from(blob_number) * width;
    let pair = source.read_range(entry_pos, entry_pos + 2 * width)?;
    let blob_start = size.decode(&pair)?;
    let blob_end = size.decode(&pair[width as usize..])?;

    if blob_start > blob_end || blob_end > body_len {
        return Err(Error::InvalidCluster {
            index,
            reason: "blob outside cluster",
        });
    }

    Ok(source
        .read_range(body_start + blob_start, body_start + blob_end)?
        .into_owned())
}
