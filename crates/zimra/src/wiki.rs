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

//! Bulk iteration over the archive's articles and images.
//!
//! Entries are grouped by cluster before any data is read, so each
//! cluster is decoded once per pass instead of once per entry.

use std::collections::HashMap;
use std::sync::Arc;

use crate::cluster::Cluster;
use crate::entry::DirEntry;
use crate::{Error, Result, ZimFile};

struct ArticleRef {
    blob_number: u32,
    url: String,
    title: String,
}

struct WorkingCluster<T> {
    cluster: Arc<Cluster>,
    data: Vec<T>,
}

pub struct ArticleIterator<'a> {
    zim: &'a ZimFile,
    // key: cluster number, value: list of article refs in that cluster
    articles: Vec<(u32, Vec<ArticleRef>)>,

    cur_cluster: Option<WorkingCluster<ArticleRef>>,
}

impl<'a> ArticleIterator<'a> {
    pub(crate) fn new(zim: &'a ZimFile) -> Result<ArticleIterator<'a>> {
        let mut articles = HashMap::new();
        for entry in zim.dir_entries() {
            let entry = entry?;

            if let DirEntry::Content {
                mime_type,
                namespace,
                cluster_number,
                blob_number,
                url,
                title,
                ..
            } = entry
            {
                if namespace != b'A' || zim.mime_types().get(mime_type) != Some("text/html") {
                    continue;
                }

                let article_ref = ArticleRef {
                    blob_number,
                    url,
                    title,
                };

                articles
                    .entry(cluster_number)
                    .or_insert(Vec::new())
                    .push(article_ref);
            }
        }

        let mut articles = articles
            .into_iter()
            .map(|(cluster, mut articles)| {
                articles.sort_by_key(|article| article.blob_number);
                (cluster, articles)
            })
            .collect::<Vec<_>>();
        articles.sort_by_key(|(cluster_number, _)| *cluster_number);

        Ok(ArticleIterator {
            zim,
            articles,
            cur_cluster: None,
        })
    }
}

#[derive(Debug)]
pub struct Article {
    pub url: String,
    pub title: String,
    pub content: String,
}

impl<'a> Iterator for ArticleIterator<'a> {
    type Item = Article;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cur_cluster.is_none() {
            if self.articles.is_empty() {
                return None;
            }

            let (cluster_number, articles) = self.articles.swap_remove(0);
            let cluster = self.zim.cluster(cluster_number).ok()?;
            self.cur_cluster = Some(WorkingCluster {
                cluster,
                data: articles,
            });
        }

        let cur_cluster = self.cur_cluster.as_mut()?;

        let article_ref = cur_cluster.data.pop()?;

        let blob = cur_cluster
            .cluster
            .get_blob(article_ref.blob_number)
            .ok()?;

        let mut title = article_ref.title;

        if title.is_empty() {
            title.clone_from(&article_ref.url);
        }

        let article = Article {
            title,
            url: article_ref.url,
            content: String::from_utf8_lossy(blob).to_string(),
        };

        if cur_cluster.data.is_empty() {
            self.cur_cluster = None;
        }

        Some(article)
    }
}

struct ImageRef {
    mime_type: String,
    blob_number: u32,
    url: String,
}

pub struct ImageIterator<'a> {
    zim: &'a ZimFile,
    // key: cluster number, value: list of image refs in that cluster
    images: Vec<(u32, Vec<ImageRef>)>,

    cur_cluster: Option<WorkingCluster<ImageRef>>,
}

impl<'a> ImageIterator<'a> {
    pub(crate) fn new(zim: &'a ZimFile) -> Result<ImageIterator<'a>> {
        let mut images = HashMap::new();
        for entry in zim.dir_entries() {
            let entry = entry?;

            if let DirEntry::Content {
                mime_type,
                namespace,
                cluster_number,
                blob_number,
                url,
                ..
            } = entry
            {
                if namespace != b'I' {
                    continue;
                }

                let mime_type = zim
                    .mime_types()
                    .get(mime_type)
                    .ok_or(Error::InvalidMimeType(mime_type))?
                    .to_string();

                let image_ref = ImageRef {
                    blob_number,
                    url,
                    mime_type,
                };

                images
                    .entry(cluster_number)
                    .or_insert(Vec::new())
                    .push(image_ref);
            }
        }

        let mut images = images
            .into_iter()
            .map(|(cluster, mut images)| {
                images.sort_by_key(|image| image.blob_number);
                (cluster, images)
            })
            .collect::<Vec<_>>();
        images.sort_by_key(|(cluster_number, _)| *cluster_number);

        Ok(ImageIterator {
            zim,
            images,
            cur_cluster: None,
        })
    }
}

#[derive(Debug)]
pub struct Image {
    pub url: String,
    pub mime_type: String,
    pub content: Vec<u8>,
}

impl Image {
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.content
    }
}

impl<'a> Iterator for ImageIterator<'a> {
    type Item = Image;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cur_cluster.is_none() {
            if self.images.is_empty() {
                return None;
            }

            let (cluster_number, images) = self.images.swap_remove(0);
            let cluster = self.zim.cluster(cluster_number).ok()?;
            self.cur_cluster = Some(WorkingCluster {
                cluster,
                data: images,
            });
        }

        let cur_cluster = self.cur_cluster.as_mut()?;

        let image_ref = cur_cluster.data.pop()?;

        let blob = cur_cluster.cluster.get_blob(image_ref.blob_number).ok()?;

        let image = Image {
            url: image_ref.url,
            mime_type: image_ref.mime_type,
            content: blob.to_vec(),
        };

        if cur_cluster.data.is_empty() {
            self.cur_cluster = None;
        }

        Some(image)
    }
}
