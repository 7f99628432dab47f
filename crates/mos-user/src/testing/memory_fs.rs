//! In-memory file server for testing.
//!
//! Speaks the FS-IPC protocol from its own environment. File blocks live in
//! host memory (the "disk"); blocks handed to clients are cached in pages of
//! the server's address space, one 4 MiB region per cached file:
//!
//! ```text
//!   CACHE_BASE + slot * PDMAP + block * BY2PG
//! ```
//!
//! Client writes land directly in those pages and reach the disk only when
//! the block is marked dirty and flushed (on `CLOSE` of that file or on
//! `SYNC`). When the last reference to a file is closed its cache is dropped,
//! so writes that were never marked dirty are lost.

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::vec;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};

use mos_ipc::fsreq::{
    self, FSREQ_CLOSE, FSREQ_DIRTY, FSREQ_INCREF, FSREQ_MAP, FSREQ_OPEN, FSREQ_REMOVE,
    FSREQ_SET_SIZE, FSREQ_SYNC,
};
use mos_ipc::mmu::{self, BY2PG, FSIPCBUF, FSREQVA, MAXFILESIZE, PDMAP};
use mos_ipc::{Errno, OpenMode, Perm, Syscalls, Va};

use crate::error::{Error, Result};
use crate::fs::wire::{self, BlockRequest, FileRequest, OpenRequest, RemoveRequest, SetSizeRequest};
use crate::fs::{DevKind, FdRecord, FileMeta};
use crate::runtime::Runtime;
use crate::testing::path::{filename, normalize_path, parent_path};

/// Files that may be cached (and opened) at once
pub const MAXOPEN: u32 = 32;

/// Base of the block cache in the server's address space
pub const CACHE_BASE: Va = 0x1000_0000;

/// Page the server builds `OPEN` replies in
const OPEN_SCRATCH: Va = FSIPCBUF - BY2PG;

/// Reply to one request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reply {
    /// Value only
    Empty,
    /// Value plus the page at `va`
    Page {
        /// Page to send
        va: Va,
        /// Permission to send it with
        perm: Perm,
    },
}

struct Node {
    size: u32,
    /// block number -> one page of contents
    disk: BTreeMap<u32, Vec<u8>>,
    isdir: bool,
    /// Open references across all file ids
    refs: u32,
    cache: Option<BlockCache>,
}

struct BlockCache {
    slot: u32,
    /// block number -> dirty
    blocks: BTreeMap<u32, bool>,
}

impl BlockCache {
    fn block_va(&self, block: u32) -> Va {
        block_va(self.slot, block)
    }
}

fn block_va(slot: u32, block: u32) -> Va {
    CACHE_BASE + slot * PDMAP + block * BY2PG
}

struct OpenFile {
    path: String,
    mode: OpenMode,
    refs: u32,
}

/// In-memory file server.
pub struct MemoryFs {
    nodes: RefCell<BTreeMap<String, Node>>,
    opens: RefCell<BTreeMap<u32, OpenFile>>,
    free_slots: RefCell<Vec<u32>>,
    next_fileid: Cell<u32>,
}

impl Default for MemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFs {
    /// Create a file system holding only the root directory.
    pub fn new() -> Self {
        let fs = Self {
            nodes: RefCell::new(BTreeMap::new()),
            opens: RefCell::new(BTreeMap::new()),
            free_slots: RefCell::new((0..MAXOPEN).rev().collect()),
            next_fileid: Cell::new(1),
        };
        fs.nodes.borrow_mut().insert(String::from("/"), Node::new(&[], true));
        fs
    }

    /// Add a file, creating missing parent directories.
    pub fn with_file(self, path: &str, contents: &[u8]) -> Self {
        self.insert(path, contents, false);
        self
    }

    /// Add a directory, creating missing parents.
    pub fn with_dir(self, path: &str) -> Self {
        self.insert(path, &[], true);
        self
    }

    fn insert(&self, path: &str, data: &[u8], isdir: bool) {
        let Ok(path) = normalize_path(path) else {
            return;
        };
        let mut nodes = self.nodes.borrow_mut();
        let mut parent = parent_path(&path).to_string();
        while !nodes.contains_key(&parent) {
            nodes.insert(parent.clone(), Node::new(&[], true));
            parent = parent_path(&parent).to_string();
        }
        nodes.insert(path, Node::new(data, isdir));
    }

    /// Contents on the "disk", ignoring unflushed cache pages.
    pub fn disk_contents(&self, path: &str) -> Option<Vec<u8>> {
        let path = normalize_path(path).ok()?;
        self.nodes.borrow().get(&path).map(Node::contents)
    }

    /// Number of live open file ids.
    pub fn open_files(&self) -> usize {
        self.opens.borrow().len()
    }

    // =========================================================================
    // Request loop
    // =========================================================================

    /// Serve requests forever. Returns only on a fatal error or if receiving
    /// fails.
    pub fn serve<S: Syscalls>(&self, rt: &Runtime<S>) -> Result<()> {
        log::info!("[{:08x}] file server up", rt.envid());
        loop {
            let req = rt.ipc_recv(FSREQVA)?;
            let has_page = !req.perm.is_empty();
            let result = self.handle(rt, req.value, has_page);
            if has_page {
                let _ = rt.syscall_mem_unmap(0, FSREQVA);
            }

            let sent = match result {
                Ok(Reply::Empty) => rt.ipc_send(req.from, 0, 0, Perm::empty()),
                Ok(Reply::Page { va, perm }) => {
                    let sent = rt.ipc_send(req.from, 0, va, perm);
                    if va == OPEN_SCRATCH {
                        let _ = rt.syscall_mem_unmap(0, OPEN_SCRATCH);
                    }
                    sent
                }
                Err(Error::Errno(e)) => {
                    log::debug!(
                        "fs: {} from {:08x} failed: {}",
                        fsreq::name(req.value),
                        req.from,
                        e
                    );
                    rt.ipc_send(req.from, e.to_value(), 0, Perm::empty())
                }
                Err(fatal) => return Err(fatal),
            };
            match sent {
                Ok(()) => {}
                Err(Error::Errno(e)) => log::debug!("fs: reply to {:08x} lost: {}", req.from, e),
                Err(fatal) => return Err(fatal),
            }
        }
    }

    /// Handle one request whose payload (if any) is mapped at `FSREQVA`.
    pub fn handle<S: Syscalls>(&self, rt: &Runtime<S>, code: u32, has_page: bool) -> Result<Reply> {
        log::trace!("fs: {}", fsreq::name(code));
        if code == FSREQ_SYNC {
            self.serve_sync(rt)?;
            return Ok(Reply::Empty);
        }
        if !has_page {
            return Err(Errno::Inval.into());
        }
        let mut page = vec![0u8; BY2PG as usize];
        rt.load(FSREQVA, &mut page)?;

        match code {
            FSREQ_OPEN => self.serve_open(rt, &decode(&page)?),
            FSREQ_MAP => self.serve_map(rt, decode(&page)?),
            FSREQ_SET_SIZE => self.serve_set_size(rt, decode(&page)?).map(|()| Reply::Empty),
            FSREQ_CLOSE => self.serve_close(rt, decode(&page)?).map(|()| Reply::Empty),
            FSREQ_DIRTY => self.serve_dirty(decode(&page)?).map(|()| Reply::Empty),
            FSREQ_REMOVE => self.serve_remove(rt, &decode(&page)?).map(|()| Reply::Empty),
            FSREQ_INCREF => self.serve_incref(decode(&page)?).map(|()| Reply::Empty),
            _ => Err(Errno::Inval.into()),
        }
    }

    // =========================================================================
    // Requests
    // =========================================================================

    fn serve_open<S: Syscalls>(&self, rt: &Runtime<S>, req: &OpenRequest) -> Result<Reply> {
        let mode = OpenMode::from_bits_retain(req.omode);
        let access = mode.access().ok_or(Errno::Inval)?;
        let path = normalize_path(&req.path)?;
        if self.opens.borrow().len() >= MAXOPEN as usize {
            return Err(Errno::MaxOpen.into());
        }

        let mut nodes = self.nodes.borrow_mut();
        let exists = nodes.contains_key(&path);
        if exists && mode.intersects(OpenMode::EXCL | OpenMode::MKDIR) {
            return Err(Errno::FileExists.into());
        }
        let created = !exists;
        if created {
            if !mode.intersects(OpenMode::CREAT | OpenMode::MKDIR) {
                return Err(Errno::NotFound.into());
            }
            match nodes.get(parent_path(&path)) {
                Some(parent) if parent.isdir => {}
                _ => return Err(Errno::NotFound.into()),
            }
        }

        rt.syscall_mem_alloc(0, OPEN_SCRATCH, Perm::RW)?;
        if created {
            nodes.insert(path.clone(), Node::new(&[], mode.contains(OpenMode::MKDIR)));
        }
        let Some(node) = nodes.get_mut(&path) else {
            return Err(Errno::NotFound.into());
        };
        if mode.contains(OpenMode::TRUNC) && access.can_write() && !node.isdir {
            self.resize(rt, node, 0)?;
        }

        let fileid = self.next_fileid.get();
        let rec = FdRecord {
            dev: DevKind::File,
            offset: 0,
            omode: mode.bits(),
            file: Some(FileMeta {
                fileid,
                name: filename(&path).to_string(),
                size: node.size,
                isdir: node.isdir,
            }),
        };
        let page = wire::encode_page(&rec)?;
        rt.store(OPEN_SCRATCH, &page)?;

        node.refs += 1;
        self.next_fileid.set(fileid + 1);
        log::debug!("fs: open {} -> fileid {}", path, fileid);
        self.opens.borrow_mut().insert(fileid, OpenFile { path, mode, refs: 1 });
        Ok(Reply::Page {
            va: OPEN_SCRATCH,
            perm: Perm::SHARED,
        })
    }

    fn serve_map<S: Syscalls>(&self, rt: &Runtime<S>, req: BlockRequest) -> Result<Reply> {
        let (path, mode) = self.lookup(req.fileid)?;
        let mut nodes = self.nodes.borrow_mut();
        let node = nodes.get_mut(&path).ok_or(Errno::NotFound)?;
        if req.offset >= MAXFILESIZE {
            return Err(Errno::Inval.into());
        }
        let va = self.cache_block(rt, node, req.offset / BY2PG)?;
        let writable = mode.access().is_some_and(|a| a.can_write());
        let perm = if writable {
            Perm::SHARED
        } else {
            Perm::VALID | Perm::LIBRARY
        };
        Ok(Reply::Page { va, perm })
    }

    fn serve_set_size<S: Syscalls>(&self, rt: &Runtime<S>, req: SetSizeRequest) -> Result<()> {
        if req.size > MAXFILESIZE {
            return Err(Errno::NoDisk.into());
        }
        let (path, _) = self.lookup(req.fileid)?;
        let mut nodes = self.nodes.borrow_mut();
        let node = nodes.get_mut(&path).ok_or(Errno::NotFound)?;
        if node.isdir {
            return Err(Errno::Inval.into());
        }
        self.resize(rt, node, req.size)
    }

    fn serve_close<S: Syscalls>(&self, rt: &Runtime<S>, req: FileRequest) -> Result<()> {
        let (path, _) = self.lookup(req.fileid)?;
        {
            let mut opens = self.opens.borrow_mut();
            if let Some(open) = opens.get_mut(&req.fileid) {
                open.refs -= 1;
                if open.refs == 0 {
                    opens.remove(&req.fileid);
                }
            }
        }

        let mut nodes = self.nodes.borrow_mut();
        let Some(node) = nodes.get_mut(&path) else {
            return Ok(());
        };
        flush(rt, node)?;
        node.refs = node.refs.saturating_sub(1);
        if node.refs == 0 {
            self.evict(rt, node);
        }
        Ok(())
    }

    fn serve_dirty(&self, req: BlockRequest) -> Result<()> {
        let (path, _) = self.lookup(req.fileid)?;
        let mut nodes = self.nodes.borrow_mut();
        let node = nodes.get_mut(&path).ok_or(Errno::NotFound)?;
        let dirty = node
            .cache
            .as_mut()
            .and_then(|cache| cache.blocks.get_mut(&(req.offset / BY2PG)))
            .ok_or(Errno::NotFound)?;
        *dirty = true;
        Ok(())
    }

    fn serve_remove<S: Syscalls>(&self, rt: &Runtime<S>, req: &RemoveRequest) -> Result<()> {
        let path = normalize_path(&req.path)?;
        if path == "/" {
            return Err(Errno::Inval.into());
        }
        let mut nodes = self.nodes.borrow_mut();
        let mut node = nodes.remove(&path).ok_or(Errno::NotFound)?;
        self.evict(rt, &mut node);
        log::debug!("fs: removed {}", path);
        Ok(())
    }

    fn serve_sync<S: Syscalls>(&self, rt: &Runtime<S>) -> Result<()> {
        for node in self.nodes.borrow_mut().values_mut() {
            flush(rt, node)?;
        }
        Ok(())
    }

    fn serve_incref(&self, req: FileRequest) -> Result<()> {
        let (path, _) = self.lookup(req.fileid)?;
        if let Some(open) = self.opens.borrow_mut().get_mut(&req.fileid) {
            open.refs += 1;
        }
        if let Some(node) = self.nodes.borrow_mut().get_mut(&path) {
            node.refs += 1;
        }
        Ok(())
    }

    // =========================================================================
    // Cache
    // =========================================================================

    fn lookup(&self, fileid: u32) -> Result<(String, OpenMode)> {
        self.opens
            .borrow()
            .get(&fileid)
            .map(|open| (open.path.clone(), open.mode))
            .ok_or(Error::Errno(Errno::Inval))
    }

    fn cache_block<S: Syscalls>(&self, rt: &Runtime<S>, node: &mut Node, block: u32) -> Result<Va> {
        if node.cache.is_none() {
            let slot = self.free_slots.borrow_mut().pop().ok_or(Errno::MaxOpen)?;
            node.cache = Some(BlockCache {
                slot,
                blocks: BTreeMap::new(),
            });
        }
        let Some(cache) = node.cache.as_mut() else {
            return Err(Errno::MaxOpen.into());
        };
        let va = cache.block_va(block);
        if !cache.blocks.contains_key(&block) {
            rt.syscall_mem_alloc(0, va, Perm::RW)?;
            if let Some(contents) = node.disk.get(&block) {
                rt.store(va, contents)?;
            }
            cache.blocks.insert(block, false);
        }
        Ok(va)
    }

    /// Set the size. Blocks past the end are dropped from disk and cache;
    /// a partial last block is zeroed past the end.
    fn resize<S: Syscalls>(&self, rt: &Runtime<S>, node: &mut Node, size: u32) -> Result<()> {
        let old = node.size;
        node.size = size;
        let keep = mmu::round_up(size) / BY2PG;
        node.disk.retain(|&block, _| block < keep);

        let tail = mmu::page_offset(size);
        let last = size / BY2PG;
        if size < old && tail != 0 {
            if let Some(contents) = node.disk.get_mut(&last) {
                contents[tail as usize..].fill(0);
            }
        }

        let Some(cache) = node.cache.as_mut() else {
            return Ok(());
        };
        let dropped: Vec<u32> = cache.blocks.range(keep..).map(|(&b, _)| b).collect();
        for block in dropped {
            let _ = rt.syscall_mem_unmap(0, cache.block_va(block));
            cache.blocks.remove(&block);
        }
        if size < old && tail != 0 && cache.blocks.contains_key(&last) {
            let zeroes = vec![0u8; (BY2PG - tail) as usize];
            rt.store(cache.block_va(last) + tail, &zeroes)?;
        }
        Ok(())
    }

    fn evict<S: Syscalls>(&self, rt: &Runtime<S>, node: &mut Node) {
        if let Some(cache) = node.cache.take() {
            for &block in cache.blocks.keys() {
                let _ = rt.syscall_mem_unmap(0, cache.block_va(block));
            }
            self.free_slots.borrow_mut().push(cache.slot);
        }
    }
}

impl Node {
    fn new(data: &[u8], isdir: bool) -> Self {
        let disk = data
            .chunks(BY2PG as usize)
            .enumerate()
            .map(|(i, chunk)| {
                let mut page = vec![0u8; BY2PG as usize];
                page[..chunk.len()].copy_from_slice(chunk);
                (i as u32, page)
            })
            .collect();
        Self {
            size: data.len() as u32,
            disk,
            isdir,
            refs: 0,
            cache: None,
        }
    }

    fn contents(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.size as usize];
        for (&block, page) in &self.disk {
            let start = (block * BY2PG) as usize;
            if start >= out.len() {
                break;
            }
            let end = out.len().min(start + BY2PG as usize);
            out[start..end].copy_from_slice(&page[..end - start]);
        }
        out
    }
}

fn decode<T: serde::de::DeserializeOwned>(page: &[u8]) -> Result<T> {
    wire::decode_page(page).map_err(|_| Error::Errno(Errno::Inval))
}

/// Write a node's dirty cached blocks back to disk.
fn flush<S: Syscalls>(rt: &Runtime<S>, node: &mut Node) -> Result<()> {
    let Some(cache) = node.cache.as_mut() else {
        return Ok(());
    };
    let slot = cache.slot;
    for (&block, dirty) in cache.blocks.iter_mut() {
        if !*dirty {
            continue;
        }
        let mut page = vec![0u8; BY2PG as usize];
        rt.load(block_va(slot, block), &mut page)?;
        node.disk.insert(block, page);
        *dirty = false;
    }
    Ok(())
}
