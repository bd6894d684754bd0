//! FUSE filesystem implementation over the union.
//!
//! Translates kernel requests into union operations. The kernel speaks
//! in inode numbers; the bridge maps them to paths through the session's
//! inode table and blocks on the async union from the synchronous
//! callback context.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow,
};
use tokio::runtime::Handle;
use tracing::warn;

use crate::error::VfsError;
use crate::object::EntryKind;
use crate::options::MountOptions;
use crate::tree::{InodeId, InodeTable, ROOT_INODE};
use crate::union::{DirEntry, EntryAttr, UnionFs};

struct OpenHandle {
    inode: InodeId,
    path: String,
}

/// FUSE bridge serving one mounted revision with its writable overlay.
pub struct GitFs {
    /// The merged filesystem.
    union: Arc<UnionFs>,
    /// Path to inode mapping for this session.
    inodes: InodeTable,
    /// Open file handles.
    handles: Arc<RwLock<HashMap<u64, OpenHandle>>>,
    /// Next file handle ID.
    next_handle: AtomicU64,
    /// TTL handed to the kernel for entries and attributes.
    entry_ttl: Duration,
    /// Tokio runtime handle.
    runtime: Handle,
}

impl GitFs {
    /// Create the bridge. Must be called from within a tokio runtime.
    ///
    /// # Arguments
    /// * `union` - The merged filesystem to serve
    /// * `options` - Mount configuration
    pub fn new(union: Arc<UnionFs>, options: &MountOptions) -> Result<Self, VfsError> {
        let runtime: Handle = Handle::try_current()
            .map_err(|e| VfsError::MountFailed(format!("no tokio runtime: {}", e)))?;
        Ok(Self {
            union,
            inodes: InodeTable::new(),
            handles: Arc::new(RwLock::new(HashMap::new())),
            next_handle: AtomicU64::new(1),
            entry_ttl: options.entry_ttl,
            runtime,
        })
    }

    /// Convert union attributes to FUSE file attributes.
    fn to_file_attr(&self, ino: InodeId, attr: &EntryAttr) -> FileAttr {
        let kind: FileType = file_type(attr.kind);
        let mtime: SystemTime = attr.mtime;

        FileAttr {
            ino,
            size: attr.size,
            blocks: (attr.size + 511) / 512,
            atime: mtime,
            mtime,
            ctime: mtime,
            crtime: UNIX_EPOCH,
            kind,
            perm: attr.perm as u16,
            nlink: if kind == FileType::Directory { 2 } else { 1 },
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
            rdev: 0,
            blksize: 512,
            flags: 0,
        }
    }

    fn path_of(&self, ino: InodeId) -> Result<String, i32> {
        self.inodes.path_of(ino).ok_or(libc::ENOENT)
    }

    /// Path of `name` under the directory inode `parent`.
    fn child_of(&self, parent: InodeId, name: &OsStr) -> Result<String, i32> {
        let parent_path: String = self.path_of(parent)?;
        let name: &str = name.to_str().ok_or(libc::EINVAL)?;
        if name.contains('/') || name.is_empty() || name == "." || name == ".." {
            return Err(libc::EINVAL);
        }
        if parent_path.is_empty() {
            Ok(name.to_string())
        } else {
            Ok(format!("{}/{}", parent_path, name))
        }
    }

    /// Resolve a path and build its FUSE attributes.
    fn resolve_attr(&self, path: &str) -> Result<FileAttr, i32> {
        let union: Arc<UnionFs> = self.union.clone();
        let attr: EntryAttr = self
            .runtime
            .block_on(async { union.lookup(path).await })
            .map_err(|e| e.errno())?;
        let ino: InodeId = self.inodes.ino_for_path(path);
        Ok(self.to_file_attr(ino, &attr))
    }
}

fn file_type(kind: EntryKind) -> FileType {
    match kind {
        EntryKind::Directory => FileType::Directory,
        EntryKind::File => FileType::RegularFile,
        EntryKind::Symlink => FileType::Symlink,
    }
}

/// Mode bits FUSE hands to create/mkdir, masked to permissions.
fn perm_bits(mode: u32) -> u32 {
    mode & 0o7777
}

impl Filesystem for GitFs {
    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let path: String = match self.child_of(parent, name) {
            Ok(p) => p,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        match self.resolve_attr(&path) {
            Ok(attr) => reply.entry(&self.entry_ttl, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        let path: String = match self.path_of(ino) {
            Ok(p) => p,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        match self.resolve_attr(&path) {
            Ok(attr) => reply.attr(&self.entry_ttl, &attr),
            Err(errno) => reply.error(errno),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let path: String = match self.path_of(ino) {
            Ok(p) => p,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };

        let union: Arc<UnionFs> = self.union.clone();
        let result: Result<(), VfsError> = self.runtime.block_on(async {
            if let Some(size) = size {
                union.set_len(&path, size).await?;
            }
            if let Some(mode) = mode {
                union.set_perm(&path, perm_bits(mode)).await?;
            }
            Ok(())
        });
        if let Err(e) = result {
            reply.error(e.errno());
            return;
        }

        match self.resolve_attr(&path) {
            Ok(attr) => reply.attr(&self.entry_ttl, &attr),
            Err(errno) => reply.error(errno),
        }
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        let path: String = match self.path_of(ino) {
            Ok(p) => p,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        let union: Arc<UnionFs> = self.union.clone();
        match self.runtime.block_on(async { union.read_link(&path).await }) {
            Ok(target) => reply.data(target.as_bytes()),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn mkdir(&mut self, _req: &Request, parent: u64, name: &OsStr, mode: u32, _umask: u32, reply: ReplyEntry) {
        let path: String = match self.child_of(parent, name) {
            Ok(p) => p,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        let union: Arc<UnionFs> = self.union.clone();
        match self
            .runtime
            .block_on(async { union.mkdir(&path, perm_bits(mode)).await })
        {
            Ok(attr) => {
                let ino: InodeId = self.inodes.ino_for_path(&path);
                reply.entry(&self.entry_ttl, &self.to_file_attr(ino, &attr), 0);
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path: String = match self.child_of(parent, name) {
            Ok(p) => p,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        let union: Arc<UnionFs> = self.union.clone();
        match self.runtime.block_on(async { union.unlink(&path).await }) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path: String = match self.child_of(parent, name) {
            Ok(p) => p,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        let union: Arc<UnionFs> = self.union.clone();
        match self.runtime.block_on(async { union.rmdir(&path).await }) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request,
        parent: u64,
        link_name: &OsStr,
        target: &std::path::Path,
        reply: ReplyEntry,
    ) {
        let path: String = match self.child_of(parent, link_name) {
            Ok(p) => p,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        let target: String = target.to_string_lossy().into_owned();
        let union: Arc<UnionFs> = self.union.clone();
        match self
            .runtime
            .block_on(async { union.symlink(&target, &path).await })
        {
            Ok(attr) => {
                let ino: InodeId = self.inodes.ino_for_path(&path);
                reply.entry(&self.entry_ttl, &self.to_file_attr(ino, &attr), 0);
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        if flags != 0 {
            reply.error(libc::EINVAL);
            return;
        }
        let from: String = match self.child_of(parent, name) {
            Ok(p) => p,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        let to: String = match self.child_of(newparent, newname) {
            Ok(p) => p,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        let union: Arc<UnionFs> = self.union.clone();
        match self.runtime.block_on(async { union.rename(&from, &to).await }) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        let path: String = match self.path_of(ino) {
            Ok(p) => p,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };

        let union: Arc<UnionFs> = self.union.clone();
        let truncate: bool = flags & libc::O_TRUNC != 0;
        let result: Result<(), VfsError> = self.runtime.block_on(async {
            let attr: EntryAttr = union.lookup(&path).await?;
            if attr.kind == EntryKind::Directory {
                return Err(VfsError::IsADirectory(path.clone()));
            }
            if truncate {
                union.set_len(&path, 0).await?;
            }
            Ok(())
        });
        if let Err(e) = result {
            reply.error(e.errno());
            return;
        }

        let fh: u64 = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.handles
            .write()
            .unwrap()
            .insert(fh, OpenHandle { inode: ino, path });
        reply.opened(fh, 0);
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let path: String = match self.child_of(parent, name) {
            Ok(p) => p,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        let union: Arc<UnionFs> = self.union.clone();
        match self
            .runtime
            .block_on(async { union.create_file(&path, perm_bits(mode)).await })
        {
            Ok(attr) => {
                let ino: InodeId = self.inodes.ino_for_path(&path);
                let fh: u64 = self.next_handle.fetch_add(1, Ordering::SeqCst);
                self.handles.write().unwrap().insert(
                    fh,
                    OpenHandle {
                        inode: ino,
                        path: path.clone(),
                    },
                );
                reply.created(&self.entry_ttl, &self.to_file_attr(ino, &attr), 0, fh, 0);
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock: Option<u64>,
        reply: ReplyData,
    ) {
        let path: String = {
            let handles = self.handles.read().unwrap();
            match handles.get(&fh) {
                Some(h) if h.inode == ino => h.path.clone(),
                _ => {
                    reply.error(libc::EBADF);
                    return;
                }
            }
        };
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }

        let union: Arc<UnionFs> = self.union.clone();
        match self
            .runtime
            .block_on(async { union.read(&path, offset as u64, size).await })
        {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let path: String = {
            let handles = self.handles.read().unwrap();
            match handles.get(&fh) {
                Some(h) if h.inode == ino => h.path.clone(),
                _ => {
                    reply.error(libc::EBADF);
                    return;
                }
            }
        };
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }

        let union: Arc<UnionFs> = self.union.clone();
        match self
            .runtime
            .block_on(async { union.write(&path, offset as u64, data).await })
        {
            Ok(written) => reply.written(written),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn flush(&mut self, _req: &Request, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        // Writes go straight to the upper layer; there is nothing
        // buffered to push out.
        let handles = self.handles.read().unwrap();
        match handles.get(&fh) {
            Some(h) if h.inode == ino => reply.ok(),
            _ => reply.error(libc::EBADF),
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.handles.write().unwrap().remove(&fh);
        reply.ok();
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let path: String = match self.path_of(ino) {
            Ok(p) => p,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };

        let union: Arc<UnionFs> = self.union.clone();
        let children: Arc<Vec<DirEntry>> = {
            let p = path.clone();
            match self
                .runtime
                .block_on(async { union.list_children(&p).await })
            {
                Ok(c) => c,
                Err(e) => {
                    reply.error(e.errno());
                    return;
                }
            }
        };

        let parent_ino: InodeId = if ino == ROOT_INODE {
            ROOT_INODE
        } else {
            self.inodes.ino_for_path(parent_path(&path))
        };

        let mut entries: Vec<(u64, FileType, String)> = vec![
            (ino, FileType::Directory, ".".to_string()),
            (parent_ino, FileType::Directory, "..".to_string()),
        ];
        for child in children.iter() {
            let child_path: String = if path.is_empty() {
                child.name.clone()
            } else {
                format!("{}/{}", path, child.name)
            };
            let child_ino: InodeId = self.inodes.ino_for_path(&child_path);
            entries.push((child_ino, file_type(child.kind), child.name.clone()));
        }

        for (i, (e_ino, kind, name)) in entries.iter().enumerate().skip(offset as usize) {
            if reply.add(*e_ino, (i + 1) as i64, *kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn destroy(&mut self) {
        let open: usize = self.handles.read().unwrap().len();
        if open > 0 {
            warn!(open, "unmounting with open handles");
        }
    }
}

fn parent_path(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[..idx],
        None => "",
    }
}
