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

//! A programmatic ZIM v5 fixture.
//!
//! `build_archive` lays out a syntactically valid archive from a URL-sorted
//! entry list and a cluster list: header, MIME list, directory entries,
//! the three pointer tables, cluster data, and the trailing MD5. The XZ
//! cluster body is a pre-compressed literal so the builder itself only
//! needs a zstd encoder.

use std::io::Write;

pub const FIXTURE_UUID: [u8; 16] = [0x5a; 16];

pub const ANIMAL_HTML: &[u8] = b"<html><body>All about animals</body></html>";
pub const ZEBRA_HTML: &[u8] = b"<html><body>Stripes, mostly</body></html>";
pub const COUNTER_TEXT: &[u8] = b"text/html=3;image/png=1";
pub const DRACULA_HTML: &[u8] = b"<html><body>Jonathan Harker's Journal: 3 May, Bistritz.</body></html>";

/// The blob stored in the XZ cluster.
pub const XZ_BLOB: &[u8] = &[
    0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a, 0x66, 0x61, 0x6b, 0x65, 0x2d, 0x6c, 0x69,
    0x6f, 0x6e, 0x2d, 0x69, 0x6d, 0x61, 0x67, 0x65, 0x2d, 0x62, 0x79, 0x74, 0x65, 0x73, 0x2d,
    0x66, 0x61, 0x6b, 0x65, 0x2d, 0x6c, 0x69, 0x6f, 0x6e, 0x2d, 0x69, 0x6d, 0x61, 0x67, 0x65,
    0x2d, 0x62, 0x79, 0x74, 0x65, 0x73, 0x2d, 0x66, 0x61, 0x6b, 0x65, 0x2d, 0x6c, 0x69, 0x6f,
    0x6e, 0x2d, 0x69, 0x6d, 0x61, 0x67, 0x65, 0x2d, 0x62, 0x79, 0x74, 0x65, 0x73, 0x2d, 0x66,
    0x61, 0x6b, 0x65, 0x2d, 0x6c, 0x69, 0x6f, 0x6e, 0x2d, 0x69, 0x6d, 0x61, 0x67, 0x65, 0x2d,
    0x62, 0x79, 0x74, 0x65, 0x73, 0x2d,
];

/// `XZ_BLOB` wrapped in a one-blob cluster body (offset table + blob),
/// compressed as an XZ stream.
pub const XZ_CLUSTER_BODY: &[u8] = &[
    0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00, 0x00, 0x04, 0xe6, 0xd6, 0xb4, 0x46, 0x02, 0x00, 0x21,
    0x01, 0x16, 0x00, 0x00, 0x00, 0x74, 0x2f, 0xe5, 0xa3, 0xe0, 0x00, 0x67, 0x00, 0x2b, 0x5d,
    0x00, 0x04, 0x00, 0x35, 0x06, 0xb0, 0x32, 0xe9, 0x25, 0xbc, 0x3b, 0x68, 0xca, 0x14, 0x9b,
    0xca, 0x2b, 0xac, 0x56, 0x47, 0xcc, 0xbc, 0x87, 0x74, 0xde, 0x1a, 0xf5, 0x43, 0x75, 0xb8,
    0xa7, 0x28, 0xd0, 0x9e, 0xbf, 0x53, 0x18, 0xa6, 0xae, 0x1c, 0x49, 0x2e, 0x10, 0x00, 0x00,
    0x00, 0x5c, 0x83, 0xb5, 0x4d, 0x92, 0xb1, 0x2e, 0xdd, 0x00, 0x01, 0x47, 0x68, 0x83, 0x85,
    0xd7, 0xdc, 0x1f, 0xb6, 0xf3, 0x7d, 0x01, 0x00, 0x00, 0x00, 0x00, 0x04, 0x59, 0x5a,
];

pub enum FixtureKind {
    Content { mime: u16, cluster: u32, blob: u32 },
    Redirect { target: u32 },
}

pub struct FixtureEntry {
    pub namespace: u8,
    pub url: &'static str,
    pub title: &'static str,
    pub kind: FixtureKind,
}

pub enum FixtureCluster {
    /// Uncompressed, info byte `0x01`.
    Plain(Vec<Vec<u8>>),
    /// Zstd-compressed, info byte `0x05`.
    Zstd(Vec<Vec<u8>>),
    /// Pre-built body with an explicit info byte.
    Raw { info: u8, body: Vec<u8> },
}

/// URL-sorted directory of the standard fixture.
///
/// Index 1 redirects to index 0, indices 6 and 7 redirect to each other,
/// and index 3 stores an empty title.
pub fn standard_entries() -> Vec<FixtureEntry> {
    vec![
        FixtureEntry {
            namespace: b'A',
            url: "Animal.html",
            title: "Animal",
            kind: FixtureKind::Content { mime: 0, cluster: 0, blob: 0 },
        },
        FixtureEntry {
            namespace: b'A',
            url: "Bear.html",
            title: "Bear",
            kind: FixtureKind::Redirect { target: 0 },
        },
        FixtureEntry {
            namespace: b'A',
            url: "Dracula:Capitol_1.html",
            title: "Dracula Capitol 1",
            kind: FixtureKind::Content { mime: 0, cluster: 1, blob: 0 },
        },
        FixtureEntry {
            namespace: b'A',
            url: "Zebra.html",
            title: "",
            kind: FixtureKind::Content { mime: 0, cluster: 0, blob: 1 },
        },
        FixtureEntry {
            namespace: b'I',
            url: "lion.png",
            title: "Lion",
            kind: FixtureKind::Content { mime: 1, cluster: 2, blob: 0 },
        },
        FixtureEntry {
            namespace: b'M',
            url: "Counter",
            title: "Counter",
            kind: FixtureKind::Content { mime: 2, cluster: 0, blob: 2 },
        },
        FixtureEntry {
            namespace: b'X',
            url: "loop_a",
            title: "Loop A",
            kind: FixtureKind::Redirect { target: 7 },
        },
        FixtureEntry {
            namespace: b'X',
            url: "loop_b",
            title: "Loop B",
            kind: FixtureKind::Redirect { target: 6 },
        },
    ]
}

pub fn standard_mimes() -> Vec<&'static str> {
    vec!["text/html", "image/png", "text/plain"]
}

pub fn standard_clusters() -> Vec<FixtureCluster> {
    vec![
        FixtureCluster::Plain(vec![
            ANIMAL_HTML.to_vec(),
            ZEBRA_HTML.to_vec(),
            COUNTER_TEXT.to_vec(),
        ]),
        FixtureCluster::Zstd(vec![DRACULA_HTML.to_vec()]),
        FixtureCluster::Raw {
            info: 0x04,
            body: XZ_CLUSTER_BODY.to_vec(),
        },
    ]
}

pub fn standard_archive() -> Vec<u8> {
    build_archive(
        &standard_mimes(),
        &standard_entries(),
        &standard_clusters(),
        Some(1),
    )
}

pub fn build_archive(
    mimes: &[&str],
    entries: &[FixtureEntry],
    clusters: &[FixtureCluster],
    main_page: Option<u32>,
) -> Vec<u8> {
    // entries must arrive in URL-pointer order
    for pair in entries.windows(2) {
        let a = (pair[0].namespace, pair[0].url);
        let b = (pair[1].namespace, pair[1].url);
        assert!(a < b, "fixture entries not url-sorted: {a:?} >= {b:?}");
    }

    let mime_list = {
        let mut bytes = Vec::new();
        for mime in mimes {
            bytes.extend_from_slice(mime.as_bytes());
            bytes.push(0);
        }
        bytes.push(0);
        bytes
    };

    let encoded_entries: Vec<Vec<u8>> = entries.iter().map(entry_bytes).collect();
    let encoded_clusters: Vec<Vec<u8>> = clusters.iter().map(cluster_bytes).collect();

    let mime_list_pos = 80u64;
    let entries_pos = mime_list_pos + mime_list.len() as u64;

    let mut entry_offsets = Vec::new();
    let mut pos = entries_pos;
    for encoded in &encoded_entries {
        entry_offsets.push(pos);
        pos += encoded.len() as u64;
    }

    let url_ptr_pos = pos;
    let title_ptr_pos = url_ptr_pos + 8 * entries.len() as u64;
    let cluster_ptr_pos = title_ptr_pos + 4 * entries.len() as u64;
    let clusters_pos = cluster_ptr_pos + 8 * clusters.len() as u64;

    let mut cluster_offsets = Vec::new();
    let mut pos = clusters_pos;
    for encoded in &encoded_clusters {
        cluster_offsets.push(pos);
        pos += encoded.len() as u64;
    }
    let checksum_pos = pos;

    // title pointer table: URL indices ordered by (namespace, title)
    let title_order = {
        let mut order: Vec<u32> = (0..entries.len() as u32).collect();
        order.sort_by_key(|&i| {
            let entry = &entries[i as usize];
            (entry.namespace, entry.title)
        });
        order
    };

    let mut bytes = Vec::new();
    bytes.extend_from_slice(&72_173_914u32.to_le_bytes());
    bytes.extend_from_slice(&5u16.to_le_bytes());
    bytes.extend_from_slice(&0u16.to_le_bytes());
    bytes.extend_from_slice(&FIXTURE_UUID);
    bytes.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    bytes.extend_from_slice(&(clusters.len() as u32).to_le_bytes());
    bytes.extend_from_slice(&url_ptr_pos.to_le_bytes());
    bytes.extend_from_slice(&title_ptr_pos.to_le_bytes());
    bytes.extend_from_slice(&cluster_ptr_pos.to_le_bytes());
    bytes.extend_from_slice(&mime_list_pos.to_le_bytes());
    bytes.extend_from_slice(&main_page.unwrap_or(0xffff_ffff).to_le_bytes());
    bytes.extend_from_slice(&0xffff_ffffu32.to_le_bytes()); // layout_page
    bytes.extend_from_slice(&checksum_pos.to_le_bytes());
    assert_eq!(bytes.len(), 80);

    bytes.extend_from_slice(&mime_list);
    for encoded in &encoded_entries {
        bytes.extend_from_slice(encoded);
    }
    for offset in &entry_offsets {
        bytes.extend_from_slice(&offset.to_le_bytes());
    }
    for url_index in &title_order {
        bytes.extend_from_slice(&url_index.to_le_bytes());
    }
    for offset in &cluster_offsets {
        bytes.extend_from_slice(&offset.to_le_bytes());
    }
    for encoded in &encoded_clusters {
        bytes.extend_from_slice(encoded);
    }
    assert_eq!(bytes.len() as u64, checksum_pos);

    let digest = md5::compute(&bytes);
    bytes.extend_from_slice(&digest.0);

    bytes
}

pub fn write_archive(bytes: &[u8]) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(bytes).unwrap();
    file.flush().unwrap();
    file
}

fn entry_bytes(entry: &FixtureEntry) -> Vec<u8> {
    let mut bytes = Vec::new();

    match entry.kind {
        FixtureKind::Content { mime, cluster, blob } => {
            bytes.extend_from_slice(&mime.to_le_bytes());
            bytes.push(0); // parameter_len
            bytes.push(entry.namespace);
            bytes.extend_from_slice(&0u32.to_le_bytes()); // revision
            bytes.extend_from_slice(&cluster.to_le_bytes());
            bytes.extend_from_slice(&blob.to_le_bytes());
        }
        FixtureKind::Redirect { target } => {
            bytes.extend_from_slice(&0xffffu16.to_le_bytes());
            bytes.push(0);
            bytes.push(entry.namespace);
            bytes.extend_from_slice(&0u32.to_le_bytes());
            bytes.extend_from_slice(&target.to_le_bytes());
        }
    }

    bytes.extend_from_slice(entry.url.as_bytes());
    bytes.push(0);
    bytes.extend_from_slice(entry.title.as_bytes());
    bytes.push(0);

    bytes
}

fn cluster_bytes(cluster: &FixtureCluster) -> Vec<u8> {
    match cluster {
        FixtureCluster::Plain(blobs) => {
            let mut bytes = vec![0x01];
            bytes.extend_from_slice(&cluster_body(blobs));
            bytes
        }
        FixtureCluster::Zstd(blobs) => {
            let mut bytes = vec![0x05];
            let body = zstd::encode_all(&cluster_body(blobs)[..], 0).unwrap();
            bytes.extend_from_slice(&body);
            bytes
        }
        FixtureCluster::Raw { info, body } => {
            let mut bytes = vec![*info];
            bytes.extend_from_slice(body);
            bytes
        }
    }
}

/// Offset table (u32 entries, relative to the table start) followed by
/// the blob bytes.
fn cluster_body(blobs: &[Vec<u8>]) -> Vec<u8> {
    let mut offsets = Vec::new();
    let mut pos = 4 * (blobs.len() as u32 + 1);
    offsets.push(pos);
    for blob in blobs {
        pos += blob.len() as u32;
        offsets.push(pos);
    }

    let mut body = Vec::new();
    for offset in offsets {
        body.extend_from_slice(&offset.to_le_bytes());
    }
    for blob in blobs {
        body.extend_from_slice(blob);
    }
    body
}
