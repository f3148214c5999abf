//! Named resource backends.
//!
//! A channel's four resources are flat, named byte regions. A
//! [`ResourceBackend`] knows how to create one exclusively, open an
//! existing one, and unlink a name. [`ShmDirBackend`] keeps them as files
//! in a tmpfs directory (normally `/dev/shm`) so unrelated processes can
//! share them; [`MemoryBackend`] keeps them on the heap for in-process
//! tests and benchmarks.
//!
//! Removing a name never invalidates a [`Region`] that is already mapped:
//! like an unlinked file, the bytes live until the last handle drops.

use crate::error::{ShmError, ShmResult};
use crate::platform::{self, LinuxMemoryConfig};
use duplex::consts::{CACHE_LINE_SIZE, DEFAULT_SHM_DIR};
use duplex::layout::align_up;
use memmap2::MmapMut;
use parking_lot::Mutex;
use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::Arc;
use tracing::{debug, trace};

/// A mapped resource. Cheap to move, unmapped on drop.
pub struct Region {
    ptr: NonNull<u8>,
    len: usize,
    _storage: Storage,
}

/// Keeps the backing memory alive for as long as the region exists.
enum Storage {
    Mapped { _map: MmapMut },
    Heap { _block: Arc<HeapBlock> },
}

// SAFETY: the region is plain shared bytes; all mutation goes through the
// process-shared primitives placed inside it.
unsafe impl Send for Region {}
// SAFETY: as above.
unsafe impl Sync for Region {}

impl Region {
    fn from_mmap(mut mmap: MmapMut) -> ShmResult<Self> {
        let len = mmap.len();
        let ptr = NonNull::new(mmap.as_mut_ptr()).ok_or_else(|| ShmError::Io {
            source: std::io::Error::new(ErrorKind::InvalidData, "null mapping"),
        })?;
        Ok(Self {
            ptr,
            len,
            _storage: Storage::Mapped { _map: mmap },
        })
    }

    fn from_heap(block: Arc<HeapBlock>) -> Self {
        Self {
            ptr: block.base(),
            len: block.len,
            _storage: Storage::Heap { _block: block },
        }
    }

    /// Base address, aligned to at least a cache line.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the region is empty (a resource still being sized by its creator).
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Typed pointer at `offset`, or `None` if `T` does not fit or is misaligned.
    pub fn ptr_at<T>(&self, offset: usize) -> Option<NonNull<T>> {
        let end = offset.checked_add(core::mem::size_of::<T>())?;
        if end > self.len {
            return None;
        }
        // SAFETY: offset + size_of::<T>() is within the region.
        let p = unsafe { self.as_ptr().add(offset) };
        if (p as usize) % core::mem::align_of::<T>() != 0 {
            return None;
        }
        NonNull::new(p.cast())
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self._storage {
            Storage::Mapped { .. } => "mapped",
            Storage::Heap { .. } => "heap",
        };
        f.debug_struct("Region")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("kind", &kind)
            .finish()
    }
}

/// Creates, opens and removes named regions.
pub trait ResourceBackend: Send + Sync + fmt::Debug {
    /// Create `name` with `size` zeroed bytes. Fails with `AlreadyExists` if the name is taken.
    fn create(&self, name: &str, size: usize) -> ShmResult<Region>;

    /// Open an existing `name`. Fails with `NotFound` if absent.
    fn open(&self, name: &str) -> ShmResult<Region>;

    /// Unlink `name`. Returns `false` if it was already absent.
    fn remove(&self, name: &str) -> ShmResult<bool>;

    /// Whether `name` currently exists.
    fn exists(&self, name: &str) -> bool;

    /// All names currently present, in no particular order.
    fn list(&self) -> ShmResult<Vec<String>>;
}

// ─── tmpfs directory ────────────────────────────────────────────────

/// Resources as files under a directory, normally `/dev/shm`.
#[derive(Debug, Clone)]
pub struct ShmDirBackend {
    root: PathBuf,
    config: LinuxMemoryConfig,
}

impl ShmDirBackend {
    /// Backend rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            config: LinuxMemoryConfig::default(),
        }
    }

    /// Pre-fault pages when creating.
    pub fn with_populate(mut self, populate: bool) -> Self {
        self.config.populate = populate;
        self
    }

    /// Directory holding the resources.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

impl Default for ShmDirBackend {
    fn default() -> Self {
        Self::new(DEFAULT_SHM_DIR)
    }
}

impl ResourceBackend for ShmDirBackend {
    fn create(&self, name: &str, size: usize) -> ShmResult<Region> {
        let mmap = platform::create_mapping(&self.path(name), size, &self.config)?;
        trace!("Created {} ({} bytes) in {}", name, size, self.root.display());
        Region::from_mmap(mmap)
    }

    fn open(&self, name: &str) -> ShmResult<Region> {
        Region::from_mmap(platform::open_mapping(&self.path(name))?)
    }

    fn remove(&self, name: &str) -> ShmResult<bool> {
        match std::fs::remove_file(self.path(name)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&self, name: &str) -> bool {
        self.path(name).exists()
    }

    fn list(&self) -> ShmResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        Ok(names)
    }
}

// ─── heap ───────────────────────────────────────────────────────────

#[repr(C, align(64))]
struct CacheLine(UnsafeCell<[u8; CACHE_LINE_SIZE]>);

struct HeapBlock {
    lines: Box<[CacheLine]>,
    len: usize,
}

// SAFETY: bytes are only touched through raw pointers guarded by the
// process-shared primitives stored inside them.
unsafe impl Send for HeapBlock {}
// SAFETY: as above.
unsafe impl Sync for HeapBlock {}

impl HeapBlock {
    fn zeroed(len: usize) -> Self {
        let count = align_up(len.max(1), CACHE_LINE_SIZE) / CACHE_LINE_SIZE;
        let lines = (0..count)
            .map(|_| CacheLine(UnsafeCell::new([0; CACHE_LINE_SIZE])))
            .collect();
        Self { lines, len }
    }

    fn base(&self) -> NonNull<u8> {
        let first_line = self.lines.as_ptr().cast::<UnsafeCell<[u8; CACHE_LINE_SIZE]>>();
        let first = UnsafeCell::raw_get(first_line);
        // SAFETY: a boxed slice pointer is never null (dangling-but-aligned when empty,
        // and the slice always has at least one line).
        unsafe { NonNull::new_unchecked(first.cast::<u8>()) }
    }
}

/// Process-local backend; names live only as long as the backend.
#[derive(Default)]
pub struct MemoryBackend {
    blocks: Mutex<HashMap<String, Arc<HeapBlock>>>,
}

impl MemoryBackend {
    /// Empty backend.
    pub fn new() -> Self {
        Self::default()
    }
}

impl fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("names", &self.blocks.lock().len())
            .finish()
    }
}

impl ResourceBackend for MemoryBackend {
    fn create(&self, name: &str, size: usize) -> ShmResult<Region> {
        let mut blocks = self.blocks.lock();
        if blocks.contains_key(name) {
            return Err(ShmError::AlreadyExists {
                name: name.to_string(),
            });
        }
        let block = Arc::new(HeapBlock::zeroed(size));
        blocks.insert(name.to_string(), Arc::clone(&block));
        debug!("Created heap resource {} ({} bytes)", name, size);
        Ok(Region::from_heap(block))
    }

    fn open(&self, name: &str) -> ShmResult<Region> {
        self.blocks
            .lock()
            .get(name)
            .map(|b| Region::from_heap(Arc::clone(b)))
            .ok_or_else(|| ShmError::NotFound {
                name: name.to_string(),
            })
    }

    fn remove(&self, name: &str) -> ShmResult<bool> {
        Ok(self.blocks.lock().remove(name).is_some())
    }

    fn exists(&self, name: &str) -> bool {
        self.blocks.lock().contains_key(name)
    }

    fn list(&self) -> ShmResult<Vec<String>> {
        Ok(self.blocks.lock().keys().cloned().collect())
    }
}
