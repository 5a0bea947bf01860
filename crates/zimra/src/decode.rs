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

//! Little-endian primitives shared by every layer of the reader.
//!
//! All ZIM integers are little-endian; strings are NUL-terminated UTF-8.

use crate::{Error, Result};

pub(crate) fn u16_le(bytes: &[u8]) -> Result<u16> {
    if bytes.len() < 2 {
        return Err(Error::UnexpectedEndOfBytes);
    }

    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

pub(crate) fn u32_le(bytes: &[u8]) -> Result<u32> {
    if bytes.len() < 4 {
        return Err(Error::UnexpectedEndOfBytes);
    }

    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

pub(crate) fn u64_le(bytes: &[u8]) -> Result<u64> {
    if bytes.len() < 8 {
        return Err(Error::UnexpectedEndOfBytes);
    }

    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

/// Read a NUL-terminated UTF-8 string out of `bytes`.
///
/// Returns the string (without the NUL) and the number of bytes consumed
/// including the NUL. The terminator must appear inside the supplied
/// window; callers size their windows conservatively to avoid paging in
/// more of the file than needed.
pub(crate) fn read_zero_terminated(bytes: &[u8]) -> Result<(String, usize)> {
    let end = bytes
        .iter()
        .position(|&b| b == 0)
        .ok_or(Error::UnexpectedEndOfBytes)?;

    let string = String::from_utf8(bytes[..end].to_vec())?;

    Ok((string, end + 1))
}
