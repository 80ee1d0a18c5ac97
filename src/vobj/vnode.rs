use std::cell::RefCell;
use std::rc::Rc;

use crate::types::{Vaddr, Vtype};
use crate::vobj::bkref::BkrefRef;
use crate::vobj::dir::{Dir, Dirseg};
use crate::vobj::inode::Inode;
use crate::vobj::reg::{Reg, Regsec, Regseg, Symlnk};
use crate::vobj::superblock::Super;

/// Shared handle to a cached vnode. The engine is single-threaded, so
/// `Rc<RefCell<_>>` replaces the original's manually ref-counted intrusive
/// objects; the filesystem-level reference count stays an explicit field.
pub type VnodeRef = Rc<RefCell<Vnode>>;

/// Type-specific payload of a vnode.
#[derive(Debug, Clone)]
pub enum VnodeKind {
    Super(Super),
    Dir(Dir),
    Dirseg(Dirseg),
    Reg(Reg),
    Regsec(Regsec),
    Regseg(Regseg),
    Symlnk(Symlnk),
    Reflnk(Inode),
    Special(Inode),
    Vbk,
}

/// In-memory image of an on-storage object.
#[derive(Debug)]
pub struct Vnode {
    pub vaddr: Vaddr,
    pub bkref: Option<BkrefRef>,
    pub refcnt: u32,
    /// Mapped to a storage slot.
    pub placed: bool,
    /// Lives only in memory; never committed or accounted.
    pub pseudo: bool,
    /// Never evicted (super, root dir).
    pub pinned: bool,
    /// Present in the vnode cache.
    pub cached: bool,
    /// Scheduled for retirement at the next zero-refcount visit.
    pub expired: bool,
    /// Storage accounting already released; commit must skip.
    pub forgot: bool,
    /// Member of a staged queue (insertion idempotence).
    pub staged: bool,
    pub kind: VnodeKind,
}

impl Vnode {
    pub fn new(vaddr: Vaddr, kind: VnodeKind) -> Vnode {
        Vnode {
            vaddr,
            bkref: None,
            refcnt: 0,
            placed: false,
            pseudo: false,
            pinned: false,
            cached: false,
            expired: false,
            forgot: false,
            staged: false,
            kind,
        }
    }

    pub fn new_ref(vaddr: Vaddr, kind: VnodeKind) -> VnodeRef {
        Rc::new(RefCell::new(Vnode::new(vaddr, kind)))
    }

    pub fn vtype(&self) -> Vtype {
        self.vaddr.vtype
    }

    /// A vnode is mutable unless its block is travelling through the I/O
    /// queue; mutability failures surface as `Pend`.
    pub fn is_mutable(&self) -> bool {
        match &self.bkref {
            Some(bk) => !bk.borrow().slaved,
            None => true,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, VnodeKind::Dir(_))
    }

    pub fn is_reg(&self) -> bool {
        matches!(self.kind, VnodeKind::Reg(_))
    }

    pub fn is_symlnk(&self) -> bool {
        matches!(self.kind, VnodeKind::Symlnk(_))
    }

    pub fn is_reflnk(&self) -> bool {
        matches!(self.kind, VnodeKind::Reflnk(_))
    }

    pub fn is_special(&self) -> bool {
        matches!(self.kind, VnodeKind::Special(_))
    }

    /// Common inode view for the inode-bearing kinds.
    pub fn try_inode(&self) -> Option<&Inode> {
        match &self.kind {
            VnodeKind::Dir(d) => Some(&d.inode),
            VnodeKind::Reg(r) => Some(&r.inode),
            VnodeKind::Symlnk(s) => Some(&s.inode),
            VnodeKind::Reflnk(i) | VnodeKind::Special(i) => Some(i),
            _ => None,
        }
    }

    pub fn try_inode_mut(&mut self) -> Option<&mut Inode> {
        match &mut self.kind {
            VnodeKind::Dir(d) => Some(&mut d.inode),
            VnodeKind::Reg(r) => Some(&mut r.inode),
            VnodeKind::Symlnk(s) => Some(&mut s.inode),
            VnodeKind::Reflnk(i) | VnodeKind::Special(i) => Some(i),
            _ => None,
        }
    }

    // The checked views below mirror the original's asserting casts: the
    // fetch layer has already type-checked, so a mismatch here is a bug.

    pub fn inode(&self) -> &Inode {
        self.try_inode().expect("vnode is not an inode")
    }

    pub fn inode_mut(&mut self) -> &mut Inode {
        self.try_inode_mut().expect("vnode is not an inode")
    }

    pub fn dir(&self) -> &Dir {
        match &self.kind {
            VnodeKind::Dir(d) => d,
            _ => panic!("vnode is not a dir"),
        }
    }

    pub fn dir_mut(&mut self) -> &mut Dir {
        match &mut self.kind {
            VnodeKind::Dir(d) => d,
            _ => panic!("vnode is not a dir"),
        }
    }

    pub fn dirseg(&self) -> &Dirseg {
        match &self.kind {
            VnodeKind::Dirseg(ds) => ds,
            _ => panic!("vnode is not a dirseg"),
        }
    }

    pub fn dirseg_mut(&mut self) -> &mut Dirseg {
        match &mut self.kind {
            VnodeKind::Dirseg(ds) => ds,
            _ => panic!("vnode is not a dirseg"),
        }
    }

    pub fn reg(&self) -> &Reg {
        match &self.kind {
            VnodeKind::Reg(r) => r,
            _ => panic!("vnode is not a reg"),
        }
    }

    pub fn reg_mut(&mut self) -> &mut Reg {
        match &mut self.kind {
            VnodeKind::Reg(r) => r,
            _ => panic!("vnode is not a reg"),
        }
    }

    pub fn regsec(&self) -> &Regsec {
        match &self.kind {
            VnodeKind::Regsec(rc) => rc,
            _ => panic!("vnode is not a regsec"),
        }
    }

    pub fn regsec_mut(&mut self) -> &mut Regsec {
        match &mut self.kind {
            VnodeKind::Regsec(rc) => rc,
            _ => panic!("vnode is not a regsec"),
        }
    }

    pub fn regseg(&self) -> &Regseg {
        match &self.kind {
            VnodeKind::Regseg(rs) => rs,
            _ => panic!("vnode is not a regseg"),
        }
    }

    pub fn regseg_mut(&mut self) -> &mut Regseg {
        match &mut self.kind {
            VnodeKind::Regseg(rs) => rs,
            _ => panic!("vnode is not a regseg"),
        }
    }

    pub fn symlnk(&self) -> &Symlnk {
        match &self.kind {
            VnodeKind::Symlnk(s) => s,
            _ => panic!("vnode is not a symlnk"),
        }
    }

    pub fn superb(&self) -> &Super {
        match &self.kind {
            VnodeKind::Super(s) => s,
            _ => panic!("vnode is not the super"),
        }
    }

    pub fn superb_mut(&mut self) -> &mut Super {
        match &mut self.kind {
            VnodeKind::Super(s) => s,
            _ => panic!("vnode is not the super"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{INO_ROOT, ino_create};
    use crate::vobj::bkref::Bkref;
    use crate::vobj::inode::Uctx;

    #[test]
    fn mutability_follows_slaved_bkref() {
        let reg = Reg::new(ino_create(4, Vtype::Reg), &Uctx::new(0, 0), 0o600);
        let vaddr = Vaddr::for_inode(reg.ino());
        let mut vn = Vnode::new(vaddr, VnodeKind::Reg(reg));
        assert!(vn.is_mutable());

        let bk = Bkref::new_ref(9);
        vn.bkref = Some(bk.clone());
        assert!(vn.is_mutable());

        bk.borrow_mut().slaved = true;
        assert!(!vn.is_mutable());
    }

    #[test]
    fn inode_view_covers_all_inode_kinds() {
        let dir = Dir::new(INO_ROOT, &Uctx::new(0, 0), 0o755);
        let vn = Vnode::new(Vaddr::for_inode(INO_ROOT), VnodeKind::Dir(dir));
        assert_eq!(vn.inode().ino(), INO_ROOT);
        assert!(vn.is_dir() && !vn.is_reg());

        let vbk = Vnode::new(Vaddr::for_vbk(5), VnodeKind::Vbk);
        assert!(vbk.try_inode().is_none());
    }
}
