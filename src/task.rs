use std::cell::RefCell;
use std::rc::Rc;

use crate::error::Result;
use crate::fileref::{FrId, OpenFlags};
use crate::types::{BLKSIZE, Doff, INO_NULL, Ino, Lrange, off_next_rseg};
use crate::vobj::bkref::{Bkref, BkrefRef};
use crate::vobj::inode::{Iattr, Itimes, SetAttrFlags, Uctx};
use crate::vobj::superblock::FsInfo;

/// Operation codes matching the FUSE surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum Opcode {
    Lookup = 0,
    Forget,
    Getattr,
    Setattr,
    Readlink,
    Symlink,
    Mknod,
    Mkdir,
    Unlink,
    Rmdir,
    Rename,
    Link,
    Open,
    Read,
    Write,
    Statfs,
    Release,
    Fsync,
    Flush,
    Opendir,
    Readdir,
    Releasedir,
    Fsyncdir,
    Access,
    Create,
    Fallocate,
    Punch,
    Truncate,
    Fquery,
    Fsinfo,
}

pub const OPCODE_COUNT: usize = Opcode::Fsinfo as usize + 1;

/// Typed request payload, one variant per opcode.
#[derive(Debug, Clone)]
pub enum Request {
    Lookup { parent: Ino, name: String },
    Forget { ino: Ino, nlookup: u64 },
    Getattr { ino: Ino },
    Setattr { ino: Ino, flags: SetAttrFlags, mode: u32, uid: u32, gid: u32, size: u64, times: Itimes },
    Readlink { ino: Ino },
    Symlink { parent: Ino, name: String, slnk: String },
    Mknod { parent: Ino, name: String, mode: u32, rdev: u64 },
    Mkdir { parent: Ino, name: String, mode: u32 },
    Unlink { parent: Ino, name: String },
    Rmdir { parent: Ino, name: String },
    Rename { parent: Ino, name: String, newparent: Ino, newname: String },
    Link { ino: Ino, newparent: Ino, newname: String },
    Open { ino: Ino, flags: OpenFlags },
    Read { ino: Ino, fh: FrId, off: u64, size: u64 },
    Write { ino: Ino, fh: FrId, off: u64, size: u64 },
    Statfs { ino: Ino },
    Release { ino: Ino, fh: FrId, flags: OpenFlags },
    Fsync { ino: Ino, fh: FrId, datasync: bool },
    Flush { ino: Ino, fh: FrId },
    Opendir { ino: Ino },
    Readdir { ino: Ino, fh: FrId, off: Doff },
    Releasedir { ino: Ino, fh: FrId },
    Fsyncdir { ino: Ino, fh: FrId, datasync: bool },
    Access { ino: Ino, mask: u32 },
    Create { parent: Ino, name: String, mode: u32, flags: OpenFlags },
    Fallocate { ino: Ino, fh: FrId, off: u64, len: u64, keep_size: bool },
    Punch { ino: Ino, fh: FrId, off: u64, len: u64 },
    Truncate { ino: Ino, size: u64 },
    Fquery { ino: Ino, fh: FrId },
    Fsinfo { ino: Ino },
}

impl Request {
    pub fn opcode(&self) -> Opcode {
        match self {
            Request::Lookup { .. } => Opcode::Lookup,
            Request::Forget { .. } => Opcode::Forget,
            Request::Getattr { .. } => Opcode::Getattr,
            Request::Setattr { .. } => Opcode::Setattr,
            Request::Readlink { .. } => Opcode::Readlink,
            Request::Symlink { .. } => Opcode::Symlink,
            Request::Mknod { .. } => Opcode::Mknod,
            Request::Mkdir { .. } => Opcode::Mkdir,
            Request::Unlink { .. } => Opcode::Unlink,
            Request::Rmdir { .. } => Opcode::Rmdir,
            Request::Rename { .. } => Opcode::Rename,
            Request::Link { .. } => Opcode::Link,
            Request::Open { .. } => Opcode::Open,
            Request::Read { .. } => Opcode::Read,
            Request::Write { .. } => Opcode::Write,
            Request::Statfs { .. } => Opcode::Statfs,
            Request::Release { .. } => Opcode::Release,
            Request::Fsync { .. } => Opcode::Fsync,
            Request::Flush { .. } => Opcode::Flush,
            Request::Opendir { .. } => Opcode::Opendir,
            Request::Readdir { .. } => Opcode::Readdir,
            Request::Releasedir { .. } => Opcode::Releasedir,
            Request::Fsyncdir { .. } => Opcode::Fsyncdir,
            Request::Access { .. } => Opcode::Access,
            Request::Create { .. } => Opcode::Create,
            Request::Fallocate { .. } => Opcode::Fallocate,
            Request::Punch { .. } => Opcode::Punch,
            Request::Truncate { .. } => Opcode::Truncate,
            Request::Fquery { .. } => Opcode::Fquery,
            Request::Fsinfo { .. } => Opcode::Fsinfo,
        }
    }
}

/// Typed response payload; populated by the handler on success.
#[derive(Debug, Clone, Default)]
pub enum Response {
    #[default]
    None,
    Iattr { iattr: Iattr },
    Create { iattr: Iattr, fh: FrId },
    Open { fh: FrId },
    Opendir { fh: FrId },
    Read { size: u64 },
    Write { size: u64 },
    Readlink { slnk: String },
    Fsinfo { fsinfo: FsInfo },
    Readdir { name: String, child: Ino, mode: u32, next: Doff },
    Unlink { ino: Ino },
}

/// One scatter/gather element: a byte range confined to a single region
/// segment plus the block handles for each slot position the range covers.
/// `bks` is indexed by the absolute slot position within the segment, like
/// the segment map it mirrors.
#[derive(Debug, Clone)]
pub struct Iobuf {
    pub rng: Lrange,
    pub bks: Vec<Option<BkrefRef>>,
}

impl Iobuf {
    fn new(rng: Lrange) -> Iobuf {
        Iobuf {
            rng,
            bks: vec![None; crate::types::RSEG_NBK],
        }
    }
}

/// The scatter list of a read or write task.
#[derive(Debug, Clone, Default)]
pub struct Iobufs {
    pub iob: Vec<Iobuf>,
}

impl Iobufs {
    /// Split `[off, off+len)` at region-segment boundaries.
    pub fn assign(off: u64, len: u64) -> Iobufs {
        let mut iob = Vec::new();
        let end = off + len;
        let mut cur = off;
        while cur < end {
            let piv = off_next_rseg(cur).min(end);
            iob.push(Iobuf::new(Lrange::span(cur, piv)));
            cur = piv;
        }
        Iobufs { iob }
    }

    /// Build a write scatter list carrying `data` in fresh anonymous blocks,
    /// each positioned at its in-block offset.
    pub fn for_write(off: u64, data: &[u8]) -> Iobufs {
        let mut iobufs = Iobufs::assign(off, data.len() as u64);
        for iobuf in iobufs.iob.iter_mut() {
            let rng = iobuf.rng;
            let mut cur = rng.off;
            while cur < rng.end() {
                let piv = (crate::types::off_floor_blk(cur) + BLKSIZE).min(rng.end());
                let pos = ((cur % crate::types::RSEGSIZE) / BLKSIZE) as usize;
                let mut bk = Bkref::new_anon();
                let dbeg = (cur - off) as usize;
                let dend = (piv - off) as usize;
                bk.fill((cur % BLKSIZE) as usize, &data[dbeg..dend]);
                iobuf.bks[pos] = Some(Rc::new(RefCell::new(bk)));
                cur = piv;
            }
        }
        iobufs
    }

    /// Total byte length covered.
    pub fn len(&self) -> u64 {
        self.iob.iter().map(|b| b.rng.len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Assemble the covered bytes in order; unmapped slots read as zeros.
    pub fn collect(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len() as usize);
        for iobuf in &self.iob {
            let rng = iobuf.rng;
            let mut cur = rng.off;
            while cur < rng.end() {
                let piv = (crate::types::off_floor_blk(cur) + BLKSIZE).min(rng.end());
                let pos = ((cur % crate::types::RSEGSIZE) / BLKSIZE) as usize;
                let beg = (cur % BLKSIZE) as usize;
                let end = beg + (piv - cur) as usize;
                match &iobuf.bks[pos] {
                    Some(bk) => out.extend_from_slice(&bk.borrow().frame[beg..end]),
                    None => out.resize(out.len() + (end - beg), 0),
                }
                cur = piv;
            }
        }
        out
    }

    /// Drop block references, returning blocks whose refcount reached zero
    /// so the caller can hand them back to storage.
    pub fn relax(&mut self) -> Vec<BkrefRef> {
        let mut released = Vec::new();
        for iobuf in self.iob.iter_mut() {
            for slot in iobuf.bks.iter_mut() {
                if let Some(bk) = slot.take() {
                    let mut b = bk.borrow_mut();
                    b.refcnt = b.refcnt.saturating_sub(1);
                    if b.refcnt == 0 && !b.cached {
                        drop(b);
                        released.push(bk);
                    }
                }
            }
        }
        released
    }
}

/// A unit of work travelling through the vproc inbox.
#[derive(Debug)]
pub struct Task {
    pub opcode: Opcode,
    pub uctx: Uctx,
    pub request: Request,
    pub response: Response,
    pub iobufs: Iobufs,
    pub fref: Option<FrId>,
    pub status: Result<()>,
    pub runcnt: u32,
}

impl Task {
    pub fn new(uctx: &Uctx, request: Request) -> Task {
        Task {
            opcode: request.opcode(),
            uctx: uctx.clone(),
            request,
            response: Response::None,
            iobufs: Iobufs::default(),
            fref: None,
            status: Ok(()),
            runcnt: 0,
        }
    }

    /// Write task with its payload pre-staged into iobufs.
    pub fn new_write(uctx: &Uctx, ino: Ino, fh: FrId, off: u64, data: &[u8]) -> Task {
        let mut task = Task::new(
            uctx,
            Request::Write {
                ino,
                fh,
                off,
                size: data.len() as u64,
            },
        );
        task.iobufs = Iobufs::for_write(off, data);
        task
    }

    /// The ino a response refers to, for reply routing.
    pub fn response_ino(&self) -> Ino {
        match &self.response {
            Response::Iattr { iattr } | Response::Create { iattr, .. } => iattr.ino,
            Response::Unlink { ino } => *ino,
            _ => INO_NULL,
        }
    }
}

/// Inbound and outbound jobs of a vproc.
#[derive(Debug)]
pub enum Job {
    TaskExecReq(Task),
    TaskFiniReq(Task),
    TaskExecRes(Task),
    TaskFiniRes(Task),
    BkReadReq(BkrefRef),
    BkWriteReq(BkrefRef),
    BkSyncReq(BkrefRef),
    BkReadRes(BkrefRef),
    BkWriteRes(BkrefRef),
    BkSyncRes(BkrefRef),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RSEGSIZE;

    #[test]
    fn assign_splits_at_segment_boundaries() {
        let io = Iobufs::assign(RSEGSIZE - 10, 30);
        assert_eq!(io.iob.len(), 2);
        assert_eq!(io.iob[0].rng.len, 10);
        assert_eq!(io.iob[1].rng.off, RSEGSIZE);
        assert_eq!(io.len(), 30);
    }

    #[test]
    fn write_payload_roundtrips_through_collect() {
        let data: Vec<u8> = (0..100u32).map(|i| i as u8).collect();
        let io = Iobufs::for_write(BLKSIZE - 50, &data);
        assert_eq!(io.collect(), data);
    }

    #[test]
    fn collect_reads_holes_as_zeros() {
        let io = Iobufs::assign(0, 40);
        assert_eq!(io.collect(), vec![0u8; 40]);
    }

    #[test]
    fn opcode_derivation() {
        let rq = Request::Mkdir {
            parent: crate::types::INO_ROOT,
            name: "d".into(),
            mode: 0o755,
        };
        assert_eq!(rq.opcode(), Opcode::Mkdir);
    }
}
