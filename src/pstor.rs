use std::collections::{HashMap, HashSet, VecDeque};

use zerocopy::byteorder::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::{FnxError, Result};
use crate::types::{BLKSIZE, INO_ROOT, Vaddr, Vtype};
use crate::vobj::bkref::{Bkref, BkrefRef};
use crate::vobj::dir::Dir;
use crate::vobj::inode::Uctx;
use crate::vobj::superblock::{FsAttr, Super};
use crate::vobj::vnode::{Vnode, VnodeKind, VnodeRef};

/// Storage contract consumed by the vproc. Block-device mechanics, space
/// maps and write-back policy live behind it; the core only sees vnodes
/// moving in and out, plus `Pend`/`Delay` when an implementation needs the
/// task to wait.
pub trait Pstor {
    /// Materialize a fresh vnode at `vaddr`, optionally adopting a data
    /// block.
    fn spawn_vnode(&mut self, vaddr: &Vaddr, bkref: Option<BkrefRef>) -> Result<VnodeRef>;

    /// Bring a committed vnode back into memory. `Err(Pend)` while paging.
    fn stage_vnode(&mut self, vaddr: &Vaddr) -> Result<VnodeRef>;

    /// Write a dirtied vnode out. `Err(Delay)` while the flush is in flight.
    fn commit_vnode(&mut self, vnode: &VnodeRef) -> Result<()>;

    /// Release the storage slot of a placed vnode.
    fn unmap_vnode(&mut self, vnode: &VnodeRef) -> Result<()>;

    /// Hand a dead vnode back to the allocator.
    fn retire_vnode(&mut self, vnode: VnodeRef);

    /// Hand a dead block back to the allocator.
    fn retire_bk(&mut self, bkref: BkrefRef);

    /// Check that `vaddr` can be placed. `Err(NoSpace)` when its slot is
    /// taken or the volume is full; `Err(Pend)` while the answer needs I/O.
    fn require_vaddr(&mut self, vaddr: &Vaddr) -> Result<()>;

    fn sync(&mut self) -> Result<()>;

    fn sync_vnode(&mut self, vnode: &VnodeRef) -> Result<()>;

    /// Pop the next storage-produced block I/O request, if any.
    fn pop_sbk(&mut self) -> Option<BkrefRef>;

    /// Pop a vnode staged on the storage-side queue (space-map class).
    fn pop_staged(&mut self) -> Option<VnodeRef>;

    /// Outstanding slave-queue length; feeds the write backpressure check.
    fn sbkq_len(&self) -> usize;
}

const BK_MAGIC: u32 = 0x464e_5842; // "FNXB"

/// On-storage block header stamped on every committed vnode image.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
struct BkHeader {
    magic: U32,
    vtype: U16,
    pad: U16,
    ino: U64,
    xno: U64,
    crc: U32,
    pad2: U32,
}

/// Compact on-storage form of the inode attributes; enough to checksum the
/// fields that matter across a remount of the in-memory volume.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
struct InodeStencil {
    ino: U64,
    mode: U32,
    uid: U32,
    gid: U32,
    nlink: U32,
    size: U64,
    atime_sec: U64,
    mtime_sec: U64,
    ctime_sec: U64,
}

struct StoredVnode {
    header: Vec<u8>,
    payload: Vec<u8>,
    kind: VnodeKind,
}

/// RAM-backed implementation of the storage contract.
///
/// Every commit serializes a header (and, for data blocks, the block bytes)
/// with a crc32c over the payload; stage verifies the checksum before the
/// object re-enters the cache. Capacity is bounded so allocation failures
/// are observable.
pub struct MemPstor {
    blocks: HashMap<Vaddr, StoredVnode>,
    mapped: HashSet<Vaddr>,
    blk_max: usize,
    sbkq: VecDeque<BkrefRef>,
    staged: VecDeque<VnodeRef>,
    /// Commits performed since format; visible for noatime auditing.
    pub commits: u64,
}

impl MemPstor {
    pub fn new(blk_max: usize) -> MemPstor {
        MemPstor {
            blocks: HashMap::new(),
            mapped: HashSet::new(),
            blk_max,
            sbkq: VecDeque::new(),
            staged: VecDeque::new(),
            commits: 0,
        }
    }

    /// Build a fresh volume: super plus an empty root directory, both
    /// committed so that mount can stage them.
    pub fn format(&mut self, attr: FsAttr, uctx: &Uctx, ino_max: u64) -> Result<()> {
        let blk_max = self.blk_max as u64;
        let mut superb = Super::new(attr, ino_max, blk_max);
        superb.uctx = uctx.clone();
        superb.stat.account(Vtype::Dir, 1);

        let mut rootd = Dir::new(INO_ROOT, uctx, 0o755);
        rootd.parentd = INO_ROOT;
        rootd.inode.iattr.nlink = 2;

        let sv = Vnode::new_ref(Vaddr::for_super(), VnodeKind::Super(superb));
        let rv = Vnode::new_ref(Vaddr::for_inode(INO_ROOT), VnodeKind::Dir(rootd));
        for vn in [&sv, &rv] {
            self.mapped.insert(vn.borrow().vaddr);
            vn.borrow_mut().placed = true;
            self.commit_vnode(vn)?;
        }
        Ok(())
    }

    /// Test hook: enqueue a block on the slave queue as a real storage layer
    /// would when write-back kicks in.
    pub fn push_sbk(&mut self, bkref: BkrefRef) {
        self.sbkq.push_back(bkref);
    }

    fn payload_of(vnode: &Vnode) -> Vec<u8> {
        match &vnode.kind {
            VnodeKind::Vbk => vnode
                .bkref
                .as_ref()
                .map(|bk| bk.borrow().frame.to_vec())
                .unwrap_or_default(),
            _ => match vnode.try_inode() {
                Some(inode) => {
                    let st = InodeStencil {
                        ino: U64::new(inode.ino()),
                        mode: U32::new(inode.iattr.mode),
                        uid: U32::new(inode.iattr.uid),
                        gid: U32::new(inode.iattr.gid),
                        nlink: U32::new(inode.iattr.nlink),
                        size: U64::new(inode.iattr.size),
                        atime_sec: U64::new(inode.iattr.times.atime.secs),
                        mtime_sec: U64::new(inode.iattr.times.mtime.secs),
                        ctime_sec: U64::new(inode.iattr.times.ctime.secs),
                    };
                    st.as_bytes().to_vec()
                }
                None => Vec::new(),
            },
        }
    }

    fn encode(vnode: &Vnode) -> StoredVnode {
        let payload = Self::payload_of(vnode);
        let hdr = BkHeader {
            magic: U32::new(BK_MAGIC),
            vtype: U16::new(vnode.vtype() as u16),
            pad: U16::new(0),
            ino: U64::new(vnode.vaddr.ino),
            xno: U64::new(vnode.vaddr.xno),
            crc: U32::new(crc32c::crc32c(&payload)),
            pad2: U32::new(0),
        };
        StoredVnode {
            header: hdr.as_bytes().to_vec(),
            payload,
            kind: vnode.kind.clone(),
        }
    }

    fn verify(stored: &StoredVnode, vaddr: &Vaddr) -> Result<()> {
        let hdr = BkHeader::ref_from_bytes(&stored.header).map_err(|_| FnxError::Io)?;
        if hdr.magic.get() != BK_MAGIC {
            return Err(FnxError::Io);
        }
        if hdr.vtype.get() != vaddr.vtype as u16 || hdr.ino.get() != vaddr.ino {
            return Err(FnxError::Io);
        }
        if hdr.crc.get() != crc32c::crc32c(&stored.payload) {
            return Err(FnxError::Io);
        }
        Ok(())
    }

    fn fresh_kind(vaddr: &Vaddr) -> VnodeKind {
        use crate::vobj::inode::Inode;
        use crate::vobj::reg::{Regsec, Regseg};

        match vaddr.vtype {
            Vtype::Dirseg => VnodeKind::Dirseg(crate::vobj::dir::Dirseg::new(vaddr.xno as usize)),
            Vtype::Regsec => VnodeKind::Regsec(Regsec::new()),
            Vtype::Regseg => VnodeKind::Regseg(Regseg::new(vaddr.xno)),
            Vtype::Reflnk => VnodeKind::Reflnk(Inode::default()),
            Vtype::Special => VnodeKind::Special(Inode::default()),
            Vtype::Vbk => VnodeKind::Vbk,
            other => panic!("spawn of kind-less vtype {other:?}"),
        }
    }
}

impl Pstor for MemPstor {
    fn spawn_vnode(&mut self, vaddr: &Vaddr, bkref: Option<BkrefRef>) -> Result<VnodeRef> {
        if self.mapped.len() >= self.blk_max {
            return Err(FnxError::NoSpace);
        }
        self.mapped.insert(*vaddr);

        // Inode-bearing kinds get their payload from the caller's setup;
        // spawn only shapes the container.
        let kind = match vaddr.vtype {
            Vtype::Dir => VnodeKind::Dir(Dir::new(vaddr.ino, &Uctx::default(), 0)),
            Vtype::Reg => {
                VnodeKind::Reg(crate::vobj::reg::Reg::new(vaddr.ino, &Uctx::default(), 0))
            }
            Vtype::Symlnk => VnodeKind::Symlnk(crate::vobj::reg::Symlnk::new(
                vaddr.ino,
                &Uctx::default(),
                "",
            )),
            _ => Self::fresh_kind(vaddr),
        };

        let vn = Vnode::new_ref(*vaddr, kind);
        {
            let mut v = vn.borrow_mut();
            v.placed = true;
            if vaddr.vtype == Vtype::Vbk {
                let bk = bkref.unwrap_or_else(|| Bkref::new_ref(vaddr.vlba()));
                {
                    let mut b = bk.borrow_mut();
                    b.lba = vaddr.vlba();
                    b.cached = true;
                }
                v.bkref = Some(bk);
            }
        }
        Ok(vn)
    }

    fn stage_vnode(&mut self, vaddr: &Vaddr) -> Result<VnodeRef> {
        let stored = self.blocks.get(vaddr).ok_or(FnxError::NoEnt)?;
        Self::verify(stored, vaddr)?;

        let vn = Vnode::new_ref(*vaddr, stored.kind.clone());
        {
            let mut v = vn.borrow_mut();
            v.placed = true;
            if vaddr.vtype == Vtype::Vbk {
                let bk = Bkref::new_ref(vaddr.vlba());
                {
                    let mut b = bk.borrow_mut();
                    b.frame.copy_from_slice(&stored.payload);
                    b.cached = true;
                }
                v.bkref = Some(bk);
            }
        }
        Ok(vn)
    }

    fn commit_vnode(&mut self, vnode: &VnodeRef) -> Result<()> {
        let v = vnode.borrow();
        if v.forgot || v.pseudo {
            return Ok(());
        }
        debug_assert!(v.placed, "commit of unplaced vnode {:?}", v.vaddr);
        if v.vtype() == Vtype::Vbk {
            debug_assert_eq!(
                Self::payload_of(&v).len(),
                BLKSIZE as usize,
                "short vbk payload"
            );
        }
        let stored = Self::encode(&v);
        self.blocks.insert(v.vaddr, stored);
        self.commits += 1;
        Ok(())
    }

    fn unmap_vnode(&mut self, vnode: &VnodeRef) -> Result<()> {
        let mut v = vnode.borrow_mut();
        self.mapped.remove(&v.vaddr);
        self.blocks.remove(&v.vaddr);
        v.placed = false;
        Ok(())
    }

    fn retire_vnode(&mut self, vnode: VnodeRef) {
        let mut v = vnode.borrow_mut();
        debug_assert_eq!(v.refcnt, 0, "retire of referenced vnode {:?}", v.vaddr);
        if let Some(bk) = v.bkref.take() {
            let mut b = bk.borrow_mut();
            b.cached = false;
            if b.refcnt == 0 {
                drop(b);
                drop(bk);
            }
        }
    }

    fn retire_bk(&mut self, bkref: BkrefRef) {
        bkref.borrow_mut().cached = false;
    }

    fn require_vaddr(&mut self, vaddr: &Vaddr) -> Result<()> {
        if self.mapped.contains(vaddr) {
            return Err(FnxError::NoSpace);
        }
        if self.mapped.len() >= self.blk_max {
            return Err(FnxError::NoSpace);
        }
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }

    fn sync_vnode(&mut self, _vnode: &VnodeRef) -> Result<()> {
        Ok(())
    }

    fn pop_sbk(&mut self) -> Option<BkrefRef> {
        self.sbkq.pop_front()
    }

    fn pop_staged(&mut self) -> Option<VnodeRef> {
        self.staged.pop_front()
    }

    fn sbkq_len(&self) -> usize {
        self.sbkq.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ino_create;

    fn format_pstor() -> MemPstor {
        let mut ps = MemPstor::new(1024);
        ps.format(FsAttr::default(), &Uctx::new(0, 0), 64).unwrap();
        ps
    }

    #[test]
    fn format_stages_super_and_root() {
        let mut ps = format_pstor();
        let sv = ps.stage_vnode(&Vaddr::for_super()).unwrap();
        assert!(matches!(sv.borrow().kind, VnodeKind::Super(_)));

        let rv = ps.stage_vnode(&Vaddr::for_inode(INO_ROOT)).unwrap();
        assert!(rv.borrow().is_dir());
        assert_eq!(rv.borrow().dir().parentd, INO_ROOT);
    }

    #[test]
    fn vbk_bytes_survive_commit_and_stage() {
        let mut ps = format_pstor();
        let vaddr = Vaddr::for_vbk(7);
        ps.require_vaddr(&vaddr).unwrap();
        let vn = ps.spawn_vnode(&vaddr, None).unwrap();
        vn.borrow()
            .bkref
            .as_ref()
            .unwrap()
            .borrow_mut()
            .fill(11, b"sixteen bytes!!!");
        ps.commit_vnode(&vn).unwrap();

        let back = ps.stage_vnode(&vaddr).unwrap();
        let b = back.borrow();
        let bk = b.bkref.as_ref().unwrap().borrow();
        assert_eq!(&bk.frame[11..27], b"sixteen bytes!!!");
    }

    #[test]
    fn stage_rejects_corrupt_payload() {
        let mut ps = format_pstor();
        let vaddr = Vaddr::for_vbk(8);
        let vn = ps.spawn_vnode(&vaddr, None).unwrap();
        ps.commit_vnode(&vn).unwrap();

        ps.blocks.get_mut(&vaddr).unwrap().payload[0] ^= 0xff;
        assert!(matches!(ps.stage_vnode(&vaddr), Err(FnxError::Io)));
    }

    #[test]
    fn require_vaddr_refuses_taken_and_full() {
        let mut ps = MemPstor::new(3);
        ps.format(FsAttr::default(), &Uctx::new(0, 0), 8).unwrap();
        let va = Vaddr::for_vbk(1);
        ps.require_vaddr(&va).unwrap();
        ps.spawn_vnode(&va, None).unwrap();
        assert_eq!(ps.require_vaddr(&va), Err(FnxError::NoSpace));

        // super + root + vbk fill the 3-block volume
        let other = Vaddr::for_vbk(2);
        assert_eq!(ps.require_vaddr(&other), Err(FnxError::NoSpace));
    }

    #[test]
    fn commit_skips_forgotten_vnodes() {
        let mut ps = format_pstor();
        let ino = ino_create(9, Vtype::Reg);
        let vn = ps.spawn_vnode(&Vaddr::for_inode(ino), None).unwrap();
        let before = ps.commits;
        vn.borrow_mut().forgot = true;
        ps.commit_vnode(&vn).unwrap();
        assert_eq!(ps.commits, before);
    }
}
