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

//! LRU cache of decoded clusters with per-cluster single flight.
//!
//! Decoding a cluster costs a decompression pass over a megabyte or so,
//! and hot clusters are hit by every article that lives in them. The
//! cache bounds how many decoded images stay resident; the single-flight
//! bookkeeping makes concurrent misses on the same cluster share one
//! decode instead of racing.

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::{Arc, Condvar, Mutex};

use lru::LruCache;

use crate::cluster::Cluster;
use crate::Result;

pub(crate) struct ClusterCache {
    state: Mutex<State>,
    decoded: Condvar,
}

struct State {
    clusters: LruCache<u32, Arc<Cluster>>,
    in_flight: HashSet<u32>,
}

impl ClusterCache {
    pub(crate) fn new(capacity: usize) -> ClusterCache {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);

        ClusterCache {
            state: Mutex::new(State {
                clusters: LruCache::new(capacity),
                in_flight: HashSet::new(),
            }),
            decoded: Condvar::new(),
        }
    }

    /// Return the decoded cluster, decoding at most once per miss across
    /// all threads.
    ///
    /// The first requester of a missing cluster installs an in-flight
    /// marker and decodes outside the lock; everyone else waits on the
    /// condvar and picks the result out of the cache. A failed decode
    /// removes the marker without inserting anything, so the next
    /// request retries.
    pub(crate) fn get_or_decode<F>(&self, index: u32, decode: F) -> Result<Arc<Cluster>>
    where
        F: FnOnce() -> Result<Cluster>,
    {
        let mut state = self.state.lock().unwrap();

        loop {
            if let Some(cluster) = state.clusters.get(&index) {
                return Ok(Arc::clone(cluster));
            }

            if !state.in_flight.contains(&index) {
                break;
            }

            state = self.decoded.wait(state).unwrap();
        }

        state.in_flight.insert(index);
        drop(state);

        let result = decode();

        let mut state = self.state.lock().unwrap();
        state.in_flight.remove(&index);
        self.decoded.notify_all();

        match result {
            Ok(cluster) => {
                let cluster = Arc::new(cluster);
                state.clusters.put(index, Arc::clone(&cluster));
                Ok(cluster)
            }
            Err(err) => Err(err),
        }
    }
}
