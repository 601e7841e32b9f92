//! Bounded pool of open file handles over numbered `index.<id>` files
//! inside a shard directory.
//!
//! Handles are positioned-IO only (`read`/`write` take an explicit
//! offset) so that a single [Handle] can be shared between the shard's
//! applier (writer) and concurrent readers without any locking beyond
//! what the OS already guarantees for `pread`/`pwrite`.

use std::{
    collections::{HashMap, VecDeque},
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::error::{Error, Result};
use crate::err_at;

#[cfg(unix)]
use std::os::unix::fs::FileExt;
#[cfg(windows)]
use std::os::windows::fs::FileExt as _;

/// A reference-counted, positioned-IO handle to one `index.<id>` file.
///
/// Cloning a `Handle` is cheap; every clone shares the same underlying
/// `fs::File` so reads and writes through any clone observe each other.
#[derive(Clone)]
pub struct Handle {
    id: u64,
    file: Arc<fs::File>,
}

impl Handle {
    fn open(id: u64, path: &Path) -> Result<Handle> {
        let file = err_at!(
            IoError,
            fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(path)
        )?;
        Ok(Handle {
            id,
            file: Arc::new(file),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    #[cfg(unix)]
    fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        err_at!(IoError, self.file.read_at(buf, offset))
    }

    #[cfg(windows)]
    fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        err_at!(IoError, self.file.seek_read(buf, offset))
    }

    #[cfg(unix)]
    fn pwrite(&self, buf: &[u8], offset: u64) -> Result<usize> {
        err_at!(IoError, self.file.write_at(buf, offset))
    }

    #[cfg(windows)]
    fn pwrite(&self, buf: &[u8], offset: u64) -> Result<usize> {
        err_at!(IoError, self.file.seek_write(buf, offset))
    }

    /// Fill `buf` completely from `offset`. Returns `Error::PartialRead`
    /// if EOF is reached first — callers in the load path use this to
    /// detect a truncated file.
    pub fn read(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let n = self.pread(&mut buf[done..], offset + done as u64)?;
            if n == 0 {
                return err_at!(
                    PartialRead,
                    msg: "wanted {} bytes at {}, got {}",
                    buf.len(),
                    offset,
                    done
                );
            }
            done += n;
        }
        Ok(())
    }

    /// Drain `buf` completely to `offset`, looping over partial writes.
    pub fn write(&self, buf: &[u8], offset: u64) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let n = self.pwrite(&buf[done..], offset + done as u64)?;
            if n == 0 {
                return err_at!(
                    PartialWrite,
                    msg: "wanted {} bytes at {}, wrote {}",
                    buf.len(),
                    offset,
                    done
                );
            }
            done += n;
        }
        Ok(())
    }

    pub fn truncate(&self, size: u64) -> Result<()> {
        err_at!(IoError, self.file.set_len(size))
    }

    /// fsync. `metadata` mirrors `File::sync_all` (true) vs
    /// `File::sync_data` (false, skip metadata fsync where supported).
    pub fn force(&self, metadata: bool) -> Result<()> {
        if metadata {
            err_at!(IoError, self.file.sync_all())
        } else {
            err_at!(IoError, self.file.sync_data())
        }
    }

    pub fn size(&self) -> Result<u64> {
        Ok(err_at!(IoError, self.file.metadata())?.len())
    }
}

struct Inner {
    handles: HashMap<u64, Handle>,
    /// Most-recently-touched id at the back; front is the next eviction
    /// candidate.
    lru: VecDeque<u64>,
}

/// Pool of bounded open file handles over numbered files in a directory.
///
/// At most `max_open_files` handles are cached; the least-recently-touched
/// handle is closed (dropped) to make room for a new one. Closing a handle
/// here never deletes the underlying file — outstanding clones (e.g. a
/// reader mid-traversal) keep it alive until they are dropped too.
pub struct FileHandleProvider {
    dir: PathBuf,
    max_open_files: usize,
    inner: std::sync::Mutex<Inner>,
}

impl FileHandleProvider {
    pub fn new(dir: impl Into<PathBuf>, max_open_files: usize) -> FileHandleProvider {
        FileHandleProvider {
            dir: dir.into(),
            max_open_files: max_open_files.max(1),
            inner: std::sync::Mutex::new(Inner {
                handles: HashMap::new(),
                lru: VecDeque::new(),
            }),
        }
    }

    fn path_of(&self, id: u64) -> PathBuf {
        self.dir.join(format!("index.{}", id))
    }

    /// Open (creating if absent) the numbered file, caching the handle.
    pub fn open(&self, id: u64) -> Result<Handle> {
        let mut inner = self.inner.lock()?;
        if let Some(h) = inner.handles.get(&id).cloned() {
            Self::touch(&mut inner.lru, id);
            return Ok(h);
        }
        let path = self.path_of(id);
        let handle = Handle::open(id, &path)?;
        Self::evict_if_needed(&mut inner, self.max_open_files);
        inner.handles.insert(id, handle.clone());
        inner.lru.push_back(id);
        Ok(handle)
    }

    /// Return a handle only if it is already cached; never touches disk.
    pub fn open_if_already_open(&self, id: u64) -> Option<Handle> {
        let mut inner = self.inner.lock().ok()?;
        let h = inner.handles.get(&id).cloned();
        if h.is_some() {
            Self::touch(&mut inner.lru, id);
        }
        h
    }

    /// Drop the cached handle (if any) and remove the backing file.
    pub fn delete(&self, id: u64) -> Result<()> {
        {
            let mut inner = self.inner.lock()?;
            inner.handles.remove(&id);
            inner.lru.retain(|x| *x != id);
        }
        let path = self.path_of(id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::from(e)),
        }
    }

    pub fn size(&self, id: u64) -> Result<u64> {
        self.open(id)?.size()
    }

    fn touch(lru: &mut VecDeque<u64>, id: u64) {
        if let Some(pos) = lru.iter().position(|x| *x == id) {
            lru.remove(pos);
        }
        lru.push_back(id);
    }

    fn evict_if_needed(inner: &mut Inner, max_open_files: usize) {
        while inner.handles.len() >= max_open_files {
            match inner.lru.pop_front() {
                Some(victim) => {
                    inner.handles.remove(&victim);
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
#[path = "files_test.rs"]
mod files_test;
