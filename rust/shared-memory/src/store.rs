//! File-backed block store
//!
//! Every segment is a file under the store root named after its [`BlockId`],
//! so any process holding the id can map the same bytes without sharing
//! addresses. Ids are derived from segment names with SHA-256, which lets a
//! process that only knows a well-known name find the segment too.

use crate::{PlatformUtils, Result, ShmError};
use memmap2::MmapMut;
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, warn};

/// Segment header magic ("SHMC")
pub const SEGMENT_MAGIC: u32 = 0x53484D43;

/// Segment header layout version
pub const SEGMENT_LAYOUT_VERSION: u32 = 1;

/// Bytes reserved in front of every payload
pub const HEADER_SIZE: usize = 128;

/// Longest segment name accepted
pub const MAX_NAME_LEN: usize = 96;

const BLOCK_EXTENSION: &str = "blk";

/// Stable numeric handle of a segment, valid in every process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u64);

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[repr(C)]
struct SegmentHeader {
    magic: AtomicU32,
    version: u32,
    id: u64,
    size: u64,
    name_len: u32,
    _reserved: u32,
    name: [u8; MAX_NAME_LEN],
}

const _: () = assert!(std::mem::size_of::<SegmentHeader>() == HEADER_SIZE);

/// Types that may be viewed in place inside a mapped segment.
///
/// # Safety
///
/// Implementors must be `#[repr(C)]`, valid for the all-zero bit pattern and
/// for any bytes another process may write, and must only be mutated through
/// atomics or `UnsafeCell`s guarded by a shared lock.
pub unsafe trait SharedRecord: Sync {}

/// A mapped segment. Dropping it unmaps this process's view only.
pub struct Block {
    id: BlockId,
    name: String,
    size: usize,
    mmap: MmapMut,
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("size", &self.size)
            .finish()
    }
}

impl Block {
    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Payload size in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// Pointer to the first payload byte
    pub fn as_ptr(&self) -> *const u8 {
        // In bounds: the mapping is always at least HEADER_SIZE long.
        unsafe { self.mmap.as_ptr().add(HEADER_SIZE) }
    }

    /// View the payload as a shared record
    pub fn view<T: SharedRecord>(&self) -> Result<&T> {
        if self.size < std::mem::size_of::<T>() {
            return Err(ShmError::Allocation(format!(
                "segment {} holds {} bytes, record needs {}",
                self.name,
                self.size,
                std::mem::size_of::<T>()
            )));
        }

        let ptr = self.as_ptr();
        if ptr as usize % std::mem::align_of::<T>() != 0 {
            return Err(ShmError::Allocation(format!("segment {} payload is misaligned", self.name)));
        }

        // SharedRecord guarantees every bit pattern is valid and that shared
        // mutation only goes through atomics or lock-guarded cells.
        Ok(unsafe { &*(ptr as *const T) })
    }

    fn header(&self) -> &SegmentHeader {
        unsafe { &*(self.mmap.as_ptr() as *const SegmentHeader) }
    }
}

/// File-backed segment allocator
#[derive(Debug, Clone)]
pub struct BlockStore {
    root: PathBuf,
}

impl BlockStore {
    /// Open (creating if needed) a store rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .map_err(|e| ShmError::allocation(format!("create store root {}", root.display()), e))?;
        Ok(Self { root })
    }

    /// Open the store at the platform default location
    pub fn open_default() -> Result<Self> {
        Self::new(PlatformUtils::default_store_root())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Id every process derives for `name`
    pub fn block_id_for(name: &str) -> BlockId {
        let digest = Sha256::digest(name.as_bytes());
        let mut id = [0u8; 8];
        id.copy_from_slice(&digest[..8]);
        BlockId(u64::from_be_bytes(id))
    }

    /// Ensure a backing file for `name` exists. Idempotent.
    pub fn create_if_absent(&self, name: &str) -> Result<BlockId> {
        validate_segment_name(name)?;
        let id = Self::block_id_for(name);
        let path = self.path_for(id);

        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|e| ShmError::allocation(format!("create segment {}", name), e))?;

        debug!("Segment {} ready as block {}", name, id);
        Ok(id)
    }

    /// Map the segment named `name` with a payload of at least `size` bytes.
    /// The segment must have been created with [`create_if_absent`](Self::create_if_absent).
    pub fn attach_by_name(&self, name: &str, size: usize) -> Result<Block> {
        validate_segment_name(name)?;
        let id = Self::block_id_for(name);
        let file = self.open_existing(id, name)?;

        let wanted = segment_end(size)
            .ok_or_else(|| ShmError::Allocation(format!("segment {} size {} is too large", name, size)))?
            as u64;
        let len = file_len(&file, name)?;
        if len < wanted {
            file.set_len(wanted)
                .map_err(|e| ShmError::allocation(format!("resize segment {}", name), e))?;
        }

        let mmap = map_file(&file, name)?;
        let mut block = Block { id, name: name.to_string(), size, mmap };

        match block.header().magic.load(Ordering::Acquire) {
            0 => write_header(&block, size),
            SEGMENT_MAGIC => {
                let header = block.header();
                let stored = &header.name[..(header.name_len as usize).min(MAX_NAME_LEN)];
                if header.id != id.0 || stored != name.as_bytes() {
                    return Err(ShmError::Allocation(format!(
                        "block {} already belongs to another segment",
                        id
                    )));
                }
                let stored_size = usize::try_from(header.size)
                    .ok()
                    .filter(|&stored| fits(stored, block.mmap.len()))
                    .ok_or_else(|| {
                        ShmError::Allocation(format!(
                            "segment {} header claims {} bytes, file holds {}",
                            name,
                            header.size,
                            block.mmap.len()
                        ))
                    })?;
                if stored_size < size {
                    write_header(&block, size);
                }
                block.size = size.max(stored_size);
            }
            other => {
                return Err(ShmError::Allocation(format!(
                    "segment {} has unknown magic {:#x}",
                    name, other
                )))
            }
        }

        Ok(block)
    }

    /// Map a segment knowing only its id
    pub fn attach_by_id(&self, id: BlockId) -> Result<Block> {
        let label = id.to_string();
        let file = self.open_existing(id, &label)?;
        let len = file_len(&file, &label)? as usize;
        if len < HEADER_SIZE {
            return Err(ShmError::Allocation(format!("block {} is not initialized", id)));
        }

        let mmap = map_file(&file, &label)?;
        let header = unsafe { &*(mmap.as_ptr() as *const SegmentHeader) };

        if header.magic.load(Ordering::Acquire) != SEGMENT_MAGIC {
            return Err(ShmError::Allocation(format!("block {} has no valid header", id)));
        }
        if header.version != SEGMENT_LAYOUT_VERSION {
            return Err(ShmError::Allocation(format!(
                "block {} has layout version {}, expected {}",
                id, header.version, SEGMENT_LAYOUT_VERSION
            )));
        }
        if header.id != id.0 {
            return Err(ShmError::Allocation(format!("block {} header names block {:016x}", id, header.id)));
        }

        let size = usize::try_from(header.size)
            .ok()
            .filter(|&size| fits(size, len))
            .ok_or_else(|| {
                ShmError::Allocation(format!("block {} header claims {} bytes, file holds {}", id, header.size, len))
            })?;

        let name_len = (header.name_len as usize).min(MAX_NAME_LEN);
        let name = String::from_utf8_lossy(&header.name[..name_len]).into_owned();

        Ok(Block { id, name, size, mmap })
    }

    /// Whether a backing file for `id` exists
    pub fn exists(&self, id: BlockId) -> bool {
        self.path_for(id).exists()
    }

    /// Unlink the backing file. Mappings that are still alive stay valid.
    pub fn release(&self, id: BlockId) -> Result<()> {
        match std::fs::remove_file(self.path_for(id)) {
            Ok(()) => {
                debug!("Released block {}", id);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ShmError::allocation(format!("release block {}", id), e)),
        }
    }

    /// Ids of every segment currently in the store
    pub fn list(&self) -> Result<Vec<BlockId>> {
        let entries = std::fs::read_dir(&self.root)
            .map_err(|e| ShmError::allocation(format!("list {}", self.root.display()), e))?;

        let mut ids: Vec<BlockId> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let path = entry.path();
                if path.extension()? != BLOCK_EXTENSION {
                    return None;
                }
                u64::from_str_radix(path.file_stem()?.to_str()?, 16).ok().map(BlockId)
            })
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Remove the whole store directory
    pub fn destroy(self) -> Result<()> {
        if let Err(e) = std::fs::remove_dir_all(&self.root) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove store {}: {}", self.root.display(), e);
                return Err(ShmError::allocation(format!("remove {}", self.root.display()), e));
            }
        }
        Ok(())
    }

    fn path_for(&self, id: BlockId) -> PathBuf {
        self.root.join(format!("{}.{}", id, BLOCK_EXTENSION))
    }

    fn open_existing(&self, id: BlockId, label: &str) -> Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.path_for(id))
            .map_err(|e| ShmError::allocation(format!("open segment {}", label), e))
    }
}

/// Offset one past the payload of a `size`-byte segment
fn segment_end(size: usize) -> Option<usize> {
    HEADER_SIZE.checked_add(size)
}

/// Whether a `size`-byte payload lies inside a mapping of `len` bytes
fn fits(size: usize, len: usize) -> bool {
    segment_end(size).map_or(false, |end| end <= len)
}

fn file_len(file: &File, label: &str) -> Result<u64> {
    file.metadata()
        .map(|m| m.len())
        .map_err(|e| ShmError::allocation(format!("stat segment {}", label), e))
}

fn map_file(file: &File, label: &str) -> Result<MmapMut> {
    // Concurrent access to the mapping is mediated by shared locks and atomics.
    unsafe { MmapMut::map_mut(file) }.map_err(|e| ShmError::allocation(format!("mmap segment {}", label), e))
}

fn write_header(block: &Block, size: usize) {
    let header = block.mmap.as_ptr() as *mut SegmentHeader;
    let name = block.name.as_bytes();
    let name_len = name.len().min(MAX_NAME_LEN);

    unsafe {
        std::ptr::addr_of_mut!((*header).version).write(SEGMENT_LAYOUT_VERSION);
        std::ptr::addr_of_mut!((*header).id).write(block.id.0);
        std::ptr::addr_of_mut!((*header).size).write(size as u64);
        std::ptr::addr_of_mut!((*header).name_len).write(name_len as u32);
        let dst = std::ptr::addr_of_mut!((*header).name) as *mut u8;
        std::ptr::copy_nonoverlapping(name.as_ptr(), dst, name_len);
        (*header).magic.store(SEGMENT_MAGIC, Ordering::Release);
    }
}

/// Validate segment name
fn validate_segment_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(ShmError::InvalidName(format!(
            "{:?} must be 1..={} bytes",
            name, MAX_NAME_LEN
        )));
    }

    if name.contains('\0') || name.contains('/') {
        return Err(ShmError::InvalidName(format!("{:?} contains a NUL or '/'", name)));
    }

    Ok(())
}
