//! Plain, programmatically-built configuration. There is no file or
//! environment-variable loader here — wiring that up is left to the
//! embedding application (see the scope note in the top-level docs).

use std::path::PathBuf;

/// Tunables for an [crate::index::Index] instance.
#[derive(Debug, Clone)]
pub struct Config {
    pub dir: PathBuf,
    pub cache_segments: u32,
    pub min_node_size: u16,
    pub max_node_size: u16,
    pub max_open_files: usize,
    pub worker_pool_min: usize,
}

impl Config {
    pub fn new(dir: impl Into<PathBuf>, cache_segments: u32) -> Config {
        Config {
            dir: dir.into(),
            cache_segments,
            min_node_size: 512,
            max_node_size: 4096,
            max_open_files: 256,
            worker_pool_min: 1,
        }
    }

    pub fn with_node_sizes(mut self, min: u16, max: u16) -> Config {
        self.min_node_size = min;
        self.max_node_size = max;
        self
    }

    pub fn with_max_open_files(mut self, n: usize) -> Config {
        self.max_open_files = n;
        self
    }

    pub fn with_worker_pool_min(mut self, n: usize) -> Config {
        self.worker_pool_min = n.max(1);
        self
    }

    pub fn set_cache_segments(&mut self, n: u32) {
        self.cache_segments = n;
    }

    /// `concurrency = max(shards / 16, 1)`, floored at `worker_pool_min`.
    pub fn worker_pool_size(&self) -> usize {
        let computed = (self.cache_segments as usize / 16).max(1);
        computed.max(self.worker_pool_min)
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;
