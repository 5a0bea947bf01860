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

use crate::decode;
use crate::{Error, Result, ZimFile};

pub(crate) const REDIRECT_KIND: u16 = 0xffff;
pub(crate) const LINK_TARGET_KIND: u16 = 0xfffe;
pub(crate) const DELETED_KIND: u16 = 0xfffd;

/// Directory entries fit comfortably inside this window (URL + title +
/// parameters); reading more would page in file bytes for nothing.
pub(crate) const ENTRY_WINDOW: u64 = 2048;

/// One record of the URL-sorted directory.
///
/// URL and title are copied out of the probe window so holding an entry
/// does not pin archive bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirEntry {
    Content {
        mime_type: u16,
        parameter_len: u8,
        namespace: u8,
        revision: u32,
        cluster_number: u32,
        blob_number: u32,
        url: String,
        title: String,
    },
    Redirect {
        parameter_len: u8,
        namespace: u8,
        revision: u32,
        redirect_index: u32,
        url: String,
        title: String,
    },
    /// `0xfffe` sentinel; carries no body.
    LinkTarget,
    /// `0xfffd` sentinel; carries no body.
    Deleted,
}

impl DirEntry {
    /// Decode the record at `offset` from a window of bytes starting
    /// there. `mime_count` bounds the MIME index of content entries.
    pub(crate) fn from_bytes(offset: u64, bytes: &[u8], mime_count: usize) -> Result<Self> {
        let kind = decode::u16_le(bytes)?;

        match kind {
            LINK_TARGET_KIND => return Ok(Self::LinkTarget),
            DELETED_KIND => return Ok(Self::Deleted),
            _ => {}
        }

        // fixed fields: 12 bytes for redirects, 16 for content entries
        if bytes.len() < 12 || (kind != REDIRECT_KIND && bytes.len() < 16) {
            return Err(Error::UnexpectedEndOfBytes);
        }
        let parameter_len = bytes[2];
        let namespace = bytes[3];
        let revision = decode::u32_le(&bytes[4..])?;

        if kind == REDIRECT_KIND {
            let redirect_index = decode::u32_le(&bytes[8..])?;
            let (url, consumed) = decode::read_zero_terminated(&bytes[12..])?;
            let (title, _) = decode::read_zero_terminated(&bytes[12 + consumed..])?;

            if url.is_empty() {
                return Err(Error::InvalidDirEntry {
                    offset,
                    reason: "empty url",
                });
            }

            return Ok(Self::Redirect {
                parameter_len,
                namespace,
                revision,
                redirect_index,
                url,
                title,
            });
        }

        if kind as usize >= mime_count {
            return Err(Error::InvalidMimeType(kind));
        }

        let cluster_number = decode::u32_le(&bytes[8..])?;
        let blob_number = decode::u32_le(&bytes[12..])?;
        let (url, consumed) = decode::read_zero_terminated(&bytes[16..])?;
        let (title, _) = decode::read_zero_terminated(&bytes[16 + consumed..])?;

        if url.is_empty() {
            return Err(Error::InvalidDirEntry {
                offset,
                reason: "empty url",
            });
        }

        Ok(Self::Content {
            mime_type: kind,
            parameter_len,
            namespace,
            revision,
            cluster_number,
            blob_number,
            url,
            title,
        })
    }

    pub fn namespace(&self) -> Option<u8> {
        match self {
            Self::Content { namespace, .. } | Self::Redirect { namespace, .. } => Some(*namespace),
            Self::LinkTarget | Self::Deleted => None,
        }
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            Self::Content { url, .. } | Self::Redirect { url, .. } => Some(url),
            Self::LinkTarget | Self::Deleted => None,
        }
    }

    /// The raw title as stored; may be empty.
    pub fn title(&self) -> Option<&str> {
        match self {
            Self::Content { title, .. } | Self::Redirect { title, .. } => Some(title),
            Self::LinkTarget | Self::Deleted => None,
        }
    }

    /// `"{namespace}/{url}"`, the form the URL pointer table sorts by.
    pub fn full_url(&self) -> Option<String> {
        let (namespace, url) = (self.namespace()?, self.url()?);
        Some(format!("{}/{}", char::from(namespace), url))
    }

    pub fn is_redirect(&self) -> bool {
        matches!(self, Self::Redirect { .. })
    }

    pub fn is_content(&self) -> bool {
        matches!(self, Self::Content { .. })
    }
}

/// A directory entry bound to the archive it came from.
///
/// The plain [`DirEntry`] record answers everything that is stored
/// inline; this handle adds the operations that need the archive back:
/// blob data, MIME strings, and redirect chasing.
pub struct Entry<'a> {
    zim: &'a ZimFile,
    url_index: u32,
    offset: u64,
    dir_entry: DirEntry,
}

impl<'a> Entry<'a> {
    pub(crate) fn new(zim: &'a ZimFile, url_index: u32, offset: u64, dir_entry: DirEntry) -> Self {
        Entry {
            zim,
            url_index,
            offset,
            dir_entry,
        }
    }

    /// Position of this entry in the URL pointer table.
    pub fn url_index(&self) -> u32 {
        self.url_index
    }

    /// File offset the URL pointer table pointed at.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn dir_entry(&self) -> &DirEntry {
        &self.dir_entry
    }

    pub fn into_dir_entry(self) -> DirEntry {
        self.dir_entry
    }

    pub fn namespace(&self) -> Option<u8> {
        self.dir_entry.namespace()
    }

    pub fn url(&self) -> Option<&str> {
        self.dir_entry.url()
    }

    pub fn full_url(&self) -> Option<String> {
        self.dir_entry.full_url()
    }

    /// The entry's title, falling back to its URL when the stored title
    /// is empty.
    pub fn title(&self) -> Option<&str> {
        match self.dir_entry.title() {
            Some("") => self.dir_entry.url(),
            title => title,
        }
    }

    /// The MIME type string of a content entry.
    pub fn mime_type(&self) -> Option<&str> {
        match self.dir_entry {
            DirEntry::Content { mime_type, .. } => self.zim.mime_types().get(mime_type),
            _ => None,
        }
    }

    /// URL index a redirect entry points at.
    pub fn redirect_index(&self) -> Result<u32> {
        match self.dir_entry {
            DirEntry::Redirect { redirect_index, .. } => Ok(redirect_index),
            _ => Err(Error::InvalidDirEntry {
                offset: self.offset,
                reason: "not a redirect entry",
            }),
        }
    }

    /// Decode the entry one redirect hop away.
    ///
    /// A redirect naming its own URL index is corrupt; callers that chase
    /// chains bound the hop count (see [`ZimFile::resolve`]).
    pub fn follow_redirect(&self) -> Result<Entry<'a>> {
        let redirect_index = self.redirect_index()?;

        if redirect_index == self.url_index {
            return Err(Error::InvalidDirEntry {
                offset: self.offset,
                reason: "redirect points at itself",
            });
        }

        self.zim.entry_at_url_index(redirect_index)
    }

    /// The blob bytes of a content entry, decompressed and copied out.
    pub fn data(&self) -> Result<Vec<u8>> {
        match self.dir_entry {
            DirEntry::Content {
                cluster_number,
                blob_number,
                ..
            } => self.zim.blob_data(cluster_number, blob_number),
            _ => Err(Error::InvalidDirEntry {
                offset: self.offset,
                reason: "entry kind carries no data",
            }),
        }
    }
}

impl std::fmt::Debug for Entry<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("url_index", &self.url_index)
            .field("offset", &self.offset)
            .field("dir_entry", &self.dir_entry)
            .finish()
    }
}
