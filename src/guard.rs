use crate::error::{FnxError, Result};
use crate::task::Task;
use crate::types::{
    Doff, INO_NULL, Ino, NAME_MAX, REGSIZE_MAX, doff_isvalid, off_ceil_blk, off_floor_blk,
};
use crate::vobj::inode::{Capf, SetAttrFlags, Uctx};
use crate::vobj::superblock::MntFlags;
use crate::vobj::vnode::VnodeRef;
use crate::vproc::Vproc;

/// Extra mapping-node blocks budgeted per write when probing free space.
const WRITE_META_BLKS: u64 = 2;

fn uctx_of(task: &Task) -> &Uctx {
    &task.uctx
}

impl Vproc {
    // ------------------------------------------------------------------
    // Filesystem-wide gates
    // ------------------------------------------------------------------

    fn let_modify(&self) -> Result<()> {
        if self.mntf.contains(MntFlags::RDONLY) {
            return Err(FnxError::RdOnly);
        }
        if self.pstor.sbkq_len() > self.sbkq_pressure {
            return Err(FnxError::Pend); // write backpressure
        }
        Ok(())
    }

    fn let_fsaccess(&self, mask: u32) -> Result<()> {
        if (mask & libc::W_OK as u32) != 0 {
            self.let_modify()
        } else {
            Ok(())
        }
    }

    fn let_modify_vnode(&self, vnode: &VnodeRef) -> Result<()> {
        self.let_modify()?;
        self.require_mutable(vnode)
    }

    fn let_modify_inode(&mut self, vnode: &VnodeRef) -> Result<()> {
        if vnode.borrow().pseudo {
            return Err(FnxError::Perm);
        }
        self.let_modify_vnode(vnode)?;
        if let Some(iref) = self.fetch_iref(vnode)? {
            self.let_modify_vnode(&iref)?;
        }
        Ok(())
    }

    fn let_modify_dir(&mut self, dirvn: &VnodeRef) -> Result<()> {
        self.let_modify_inode(dirvn)
    }

    // ------------------------------------------------------------------
    // Fileref consistency
    // ------------------------------------------------------------------

    fn fileref_let_ino(&self, task: &Task, ino: Ino) -> Result<()> {
        let frid = task.fref.ok_or(FnxError::BadF)?;
        let fref = self.frpool.get(frid).ok_or(FnxError::BadF)?;
        if fref.ino != ino {
            log::error!(
                "vproc: fileref-inconsistency ino={:#x} fref-ino={:#x}",
                ino,
                fref.ino
            );
            return Err(FnxError::BadF);
        }
        Ok(())
    }

    /// I/O operations on an open file: the inode must arrive through the
    /// task's fileref.
    pub(crate) fn grab_reg(&mut self, task: &Task, ino: Ino) -> Result<VnodeRef> {
        self.fileref_let_ino(task, ino)?;
        let vn = self.fetch_inode(ino)?;
        if !vn.borrow().is_reg() {
            return Err(FnxError::BadF);
        }
        Ok(vn)
    }

    pub(crate) fn grab_dir(&mut self, task: &Task, ino: Ino) -> Result<VnodeRef> {
        self.fileref_let_ino(task, ino)?;
        let vn = self.fetch_inode(ino)?;
        if !vn.borrow().is_dir() {
            return Err(FnxError::NotDir);
        }
        Ok(vn)
    }

    // ------------------------------------------------------------------
    // Per-operation prechecks
    // ------------------------------------------------------------------

    pub(crate) fn let_access(&mut self, task: &Task, vnode: &VnodeRef, mask: u32) -> Result<()> {
        if !vnode.borrow().inode().access(uctx_of(task), mask) {
            return Err(FnxError::Access);
        }
        self.let_fsaccess(mask)
    }

    pub(crate) fn let_lookup(&mut self, task: &Task, dirvn: &VnodeRef) -> Result<()> {
        self.let_access(task, dirvn, libc::X_OK as u32)
    }

    pub(crate) fn let_namespace(&self, _task: &Task, name: &str) -> Result<()> {
        if name.is_empty() || name.len() > NAME_MAX {
            return Err(FnxError::NameTooLong);
        }
        Ok(())
    }

    pub(crate) fn let_getattr(&self, _task: &Task, _vnode: &VnodeRef) -> Result<()> {
        Ok(())
    }

    pub(crate) fn let_readdir(&self, task: &Task, ino: Ino, doff: Doff) -> Result<()> {
        self.fileref_let_ino(task, ino)?;
        let frid = task.fref.expect("checked fileref");
        let fref = self.frpool.get(frid).expect("checked fileref");
        if crate::types::ino_vtype(fref.ino) != crate::types::Vtype::Dir {
            return Err(FnxError::NotDir);
        }
        if !doff_isvalid(doff) {
            return Err(FnxError::Inval);
        }
        Ok(())
    }

    pub(crate) fn let_releasedir(&mut self, task: &Task, ino: Ino) -> Result<()> {
        self.fileref_let_ino(task, ino)?;
        let vn = self.fetch_inode(ino)?;
        if !vn.borrow().is_dir() {
            return Err(FnxError::NotDir);
        }
        if vn.borrow().expired {
            self.let_modify_vnode(&vn)?;
        }
        Ok(())
    }

    pub(crate) fn let_readlink(&mut self, task: &Task, slvn: &VnodeRef) -> Result<()> {
        self.let_access(task, slvn, libc::R_OK as u32)
    }

    pub(crate) fn let_flush(&mut self, task: &Task, ino: Ino) -> Result<()> {
        self.fileref_let_ino(task, ino)?;
        let vn = self.fetch_inode(ino)?;
        if !vn.borrow().is_reg() {
            return Err(FnxError::Inval);
        }
        if vn.borrow().pseudo {
            return Ok(());
        }
        self.let_modify_inode(&vn)
    }

    pub(crate) fn let_forget(&self, _task: &Task, ino: Ino) -> Result<()> {
        if !crate::types::ino_isvalid(ino) {
            return Err(FnxError::Inval);
        }
        Ok(())
    }

    pub(crate) fn let_release(&mut self, task: &Task, ino: Ino) -> Result<()> {
        self.fileref_let_ino(task, ino)?;
        let vn = self.fetch_inode(ino)?;
        if !vn.borrow().is_reg() {
            return Err(FnxError::Inval);
        }
        self.let_modify_vnode(&vn)
    }

    pub(crate) fn let_fsyncdir(&mut self, task: &Task, dirvn: &VnodeRef) -> Result<()> {
        let ino = dirvn.borrow().inode().ino();
        self.fileref_let_ino(task, ino)?;
        self.let_modify_dir(dirvn)
    }

    pub(crate) fn let_fsync(&mut self, task: &Task, ino: Ino) -> Result<()> {
        self.fileref_let_ino(task, ino)?;
        let vn = self.fetch_inode(ino)?;
        if !vn.borrow().is_reg() {
            return Err(FnxError::Inval);
        }
        self.let_modify_vnode(&vn)
    }

    // ------------------------------------------------------------------
    // Setattr family
    // ------------------------------------------------------------------

    fn let_chmod(&mut self, task: &Task, vnode: &VnodeRef, mode: u32) -> Result<()> {
        let uctx = uctx_of(task).clone();
        self.let_modify_inode(vnode)?;
        let v = vnode.borrow();
        let inode = v.inode();
        if (mode & libc::S_IFMT) != 0
            && crate::vobj::inode::mode_to_vtype(mode) != inode.vtype()
        {
            return Err(FnxError::Perm); // no type change via chmod
        }
        if !inode.is_owner(&uctx) && !uctx.has_cap(Capf::FOWNER) {
            return Err(FnxError::Perm);
        }
        Ok(())
    }

    fn let_chown_gid(&mut self, task: &Task, vnode: &VnodeRef, gid: u32) -> Result<()> {
        let uctx = uctx_of(task).clone();
        self.let_modify_inode(vnode)?;
        if !uctx.has_cap(Capf::CHOWN) {
            let v = vnode.borrow();
            if !v.inode().is_owner(&uctx) {
                return Err(FnxError::Perm);
            }
            if !uctx.in_group(gid) {
                return Err(FnxError::Perm);
            }
        }
        Ok(())
    }

    fn let_chown_uid(&mut self, task: &Task, vnode: &VnodeRef, uid: u32) -> Result<()> {
        let uctx = uctx_of(task).clone();
        self.let_modify_inode(vnode)?;
        if !uctx.has_cap(Capf::CHOWN) {
            let v = vnode.borrow();
            if !v.inode().is_owner(&uctx) {
                return Err(FnxError::Perm);
            }
            if v.inode().iattr.uid != uid {
                return Err(FnxError::Perm);
            }
        }
        Ok(())
    }

    fn let_utimes(&mut self, task: &Task, vnode: &VnodeRef) -> Result<()> {
        let uctx = uctx_of(task).clone();
        self.let_modify_inode(vnode)?;
        let v = vnode.borrow();
        if !v.inode().is_owner(&uctx) && !uctx.has_cap(Capf::FOWNER) {
            return Err(FnxError::Perm);
        }
        Ok(())
    }

    pub(crate) fn let_setsize(&mut self, task: &Task, vnode: &VnodeRef, size: u64) -> Result<()> {
        if size > REGSIZE_MAX {
            return Err(FnxError::FBig);
        }
        if vnode.borrow().is_dir() {
            return Err(FnxError::IsDir);
        }
        if !vnode.borrow().is_reg() {
            return Err(FnxError::Inval);
        }
        self.let_modify_inode(vnode)?;
        let uctx = uctx_of(task);
        if !vnode.borrow().inode().is_owner(uctx) && !uctx.has_cap(Capf::ADMIN) {
            return Err(FnxError::Perm);
        }
        Ok(())
    }

    pub(crate) fn let_setattr(
        &mut self,
        task: &Task,
        vnode: &VnodeRef,
        flags: SetAttrFlags,
        mode: u32,
        uid: u32,
        gid: u32,
        size: u64,
    ) -> Result<()> {
        if flags.contains(SetAttrFlags::MODE) {
            self.let_chmod(task, vnode, mode)?;
        }
        if flags.contains(SetAttrFlags::GID) {
            self.let_chown_gid(task, vnode, gid)?;
        }
        if flags.contains(SetAttrFlags::UID) {
            self.let_chown_uid(task, vnode, uid)?;
        }
        if flags.contains(SetAttrFlags::SIZE) && vnode.borrow().inode().size() != size {
            self.let_setsize(task, vnode, size)?;
        }
        if flags.any_time() {
            self.let_utimes(task, vnode)?;
        }
        Ok(())
    }

    pub(crate) fn let_truncate(&mut self, task: &Task, regvn: &VnodeRef) -> Result<()> {
        let ino = regvn.borrow().inode().ino();
        match task.fref {
            Some(frid) => {
                let fref = self.frpool.get(frid).ok_or(FnxError::Inval)?;
                if fref.ino != ino {
                    return Err(FnxError::Inval);
                }
                if !fref.writeable {
                    return Err(FnxError::Access);
                }
                self.let_modify_inode(regvn)
            }
            None => {
                self.let_access(task, regvn, libc::W_OK as u32)?;
                self.let_modify_inode(regvn)
            }
        }
    }

    pub(crate) fn let_statfs(&mut self, task: &Task, vnode: &VnodeRef) -> Result<()> {
        let ino = vnode.borrow().inode().ino();
        match task.fref {
            Some(frid) => {
                let fref = self.frpool.get(frid).ok_or(FnxError::Inval)?;
                if fref.ino != ino {
                    return Err(FnxError::Inval);
                }
                if !fref.readable {
                    return Err(FnxError::Access);
                }
                Ok(())
            }
            None => self.let_access(task, vnode, libc::R_OK as u32),
        }
    }

    // ------------------------------------------------------------------
    // Namespace mutation gates
    // ------------------------------------------------------------------

    fn let_openf(&self, task: &Task) -> Result<()> {
        if !self.frpool.has_free(uctx_of(task).is_privileged()) {
            return Err(FnxError::NFile);
        }
        Ok(())
    }

    /// Sticky-directory ownership rule for unlink/rmdir/rename.
    fn verify_sticky(&self, task: &Task, dirvn: &VnodeRef, child: &VnodeRef) -> Result<()> {
        let uctx = uctx_of(task);
        let vtx = (dirvn.borrow().inode().iattr.mode & libc::S_ISVTX) != 0;
        if !vtx
            || dirvn.borrow().inode().is_owner(uctx)
            || child.borrow().inode().is_owner(uctx)
            || uctx.has_cap(Capf::FOWNER)
        {
            Ok(())
        } else {
            Err(FnxError::Perm)
        }
    }

    fn let_dir_waccess(&mut self, task: &Task, dirvn: &VnodeRef) -> Result<()> {
        self.let_access(task, dirvn, libc::W_OK as u32)
    }

    fn let_iacquire(&self, task: &Task) -> Result<()> {
        let sv = self.super_vn().clone();
        let has = sv
            .borrow()
            .superb()
            .stat
            .has_next_ino(uctx_of(task).is_privileged());
        if has { Ok(()) } else { Err(FnxError::NoSpace) }
    }

    pub(crate) fn let_opendir(&mut self, task: &Task, dirvn: &VnodeRef) -> Result<()> {
        self.let_access(task, dirvn, libc::R_OK as u32)?;
        self.let_openf(task)?;
        self.let_iacquire(task)
    }

    pub(crate) fn let_rmdir(
        &mut self,
        task: &Task,
        parentd: &VnodeRef,
        dirvn: &VnodeRef,
    ) -> Result<()> {
        self.let_modify_dir(parentd)?;
        self.let_modify_dir(dirvn)?;
        self.let_dir_waccess(task, parentd)?;
        {
            let v = dirvn.borrow();
            let d = v.dir();
            if !d.is_empty() {
                return Err(FnxError::NotEmpty);
            }
            if d.is_root() {
                return Err(FnxError::Busy);
            }
            if d.nsegs > 0 {
                return Err(FnxError::Busy); // empty dir must hold no segs
            }
        }
        self.verify_sticky(task, parentd, dirvn)
    }

    pub(crate) fn let_unlink(
        &mut self,
        task: &Task,
        parentd: &VnodeRef,
        child: &VnodeRef,
    ) -> Result<()> {
        if child.borrow().is_dir() {
            return Err(FnxError::IsDir);
        }
        self.let_dir_waccess(task, parentd)?;
        self.verify_sticky(task, parentd, child)?;
        self.let_modify_inode(child)?;
        self.let_modify_dir(parentd)
    }

    pub(crate) fn let_link(
        &mut self,
        task: &Task,
        dirvn: &VnodeRef,
        child: &VnodeRef,
        newname: &str,
    ) -> Result<()> {
        if child.borrow().is_dir() {
            return Err(FnxError::IsDir);
        }
        if dirvn.borrow().pseudo {
            return Err(FnxError::Perm);
        }
        if !dirvn.borrow().dir().has_space() {
            return Err(FnxError::MLink);
        }
        if child.borrow().inode().iattr.nlink >= crate::types::LINK_MAX {
            return Err(FnxError::MLink);
        }
        self.let_dir_waccess(task, dirvn)?;
        self.let_iacquire(task)?;
        self.let_nolink(task, dirvn, newname)?;
        self.let_modify_dir(dirvn)?;
        self.let_modify_inode(child)
    }

    /// Refuse when the name is already bound.
    pub(crate) fn let_nolink(&mut self, task: &Task, dirvn: &VnodeRef, name: &str) -> Result<()> {
        self.let_namespace(task, name)?;
        match self.lookup_iinode(dirvn, name) {
            Ok(_) => Err(FnxError::Exist),
            Err(FnxError::NoEnt) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub(crate) fn let_open(
        &mut self,
        task: &Task,
        vnode: &VnodeRef,
        flags: crate::fileref::OpenFlags,
    ) -> Result<()> {
        use crate::fileref::OpenFlags;
        if vnode.borrow().is_dir() || flags.contains(OpenFlags::DIRECTORY) {
            return Err(FnxError::IsDir);
        }
        if flags.intersects(OpenFlags::CREAT | OpenFlags::EXCL) {
            return Err(FnxError::Exist); // creation goes through CREATE
        }
        if !vnode.borrow().is_reg() {
            return Err(FnxError::Inval);
        }
        self.let_openf(task)?;

        let mut mask = 0u32;
        if flags.readable() {
            mask |= libc::R_OK as u32;
        }
        if flags.writeable() || flags.intersects(OpenFlags::TRUNC | OpenFlags::APPEND) {
            mask |= libc::W_OK as u32;
        }
        self.let_access(task, vnode, mask)?;

        // Pseudo files take writers only when they advertise meta support.
        {
            let v = vnode.borrow();
            if v.pseudo && flags.writeable() && !v.inode().meta {
                return Err(FnxError::NotSup);
            }
        }
        self.let_modify_vnode(vnode)
    }

    pub(crate) fn let_symlink(
        &mut self,
        task: &Task,
        dirvn: &VnodeRef,
        name: &str,
        path: &str,
    ) -> Result<()> {
        self.let_modify_dir(dirvn)?;
        self.let_dir_waccess(task, dirvn)?;
        self.let_iacquire(task)?;
        self.let_nolink(task, dirvn, name)?;
        if !dirvn.borrow().dir().has_space() {
            return Err(FnxError::MLink);
        }
        if path.is_empty() || path.len() > crate::types::PATH_MAX {
            return Err(FnxError::Inval);
        }
        Ok(())
    }

    pub(crate) fn let_mknod(
        &mut self,
        task: &Task,
        dirvn: &VnodeRef,
        name: &str,
        mode: u32,
    ) -> Result<()> {
        self.let_modify_dir(dirvn)?;
        self.let_dir_waccess(task, dirvn)?;
        self.let_iacquire(task)?;
        self.let_nolink(task, dirvn, name)?;
        if !dirvn.borrow().dir().has_space() {
            return Err(FnxError::MLink);
        }
        if !crate::vobj::inode::mode_isspecial(mode) {
            return Err(FnxError::Inval);
        }
        Ok(())
    }

    pub(crate) fn let_mkdir(
        &mut self,
        task: &Task,
        dirvn: &VnodeRef,
        name: &str,
        mode: u32,
    ) -> Result<()> {
        // FUSE hands mkdir modes without the dir bit; only refuse an
        // explicit non-dir format.
        if (mode & libc::S_IFMT) != 0 && !crate::vobj::inode::mode_isdir(mode) {
            return Err(FnxError::Inval);
        }
        self.let_modify_dir(dirvn)?;
        self.let_dir_waccess(task, dirvn)?;
        self.let_iacquire(task)?;
        self.let_nolink(task, dirvn, name)?;
        if !dirvn.borrow().dir().has_space() {
            return Err(FnxError::MLink);
        }
        Ok(())
    }

    pub(crate) fn let_create(
        &mut self,
        task: &Task,
        dirvn: &VnodeRef,
        name: &str,
        mode: u32,
    ) -> Result<()> {
        self.let_modify_dir(dirvn)?;
        self.let_dir_waccess(task, dirvn)?;
        self.let_iacquire(task)?;
        self.let_openf(task)?;
        self.let_nolink(task, dirvn, name)?;
        if (mode & libc::S_IFMT) != 0 && !crate::vobj::inode::mode_isreg(mode) {
            return Err(FnxError::Inval);
        }
        if !dirvn.borrow().dir().has_space() {
            return Err(FnxError::MLink);
        }
        Ok(())
    }

    /// Walking up from the destination parent must never meet the moved
    /// directory.
    fn verify_nocycles(&mut self, dirvn: &VnodeRef, startd: &VnodeRef) -> Result<()> {
        let dino = dirvn.borrow().inode().ino();
        let mut cur = startd.clone();
        loop {
            let (ino, isroot, parent) = {
                let v = cur.borrow();
                let d = v.dir();
                (d.ino(), d.is_root(), d.parentd)
            };
            if ino == dino {
                return Err(FnxError::Inval);
            }
            if isroot || parent == INO_NULL || parent == ino {
                return Ok(());
            }
            cur = self.fetch_dir(parent)?;
        }
    }

    pub(crate) fn let_rename_src(
        &mut self,
        task: &Task,
        parentd: &VnodeRef,
        newparentd: &VnodeRef,
        child: &VnodeRef,
    ) -> Result<()> {
        self.let_dir_waccess(task, parentd)?;
        self.verify_sticky(task, parentd, child)?;
        if child.borrow().is_dir() {
            if child.borrow().dir().is_root() {
                return Err(FnxError::Busy);
            }
            self.verify_nocycles(child, newparentd)?;
        }
        self.let_modify_dir(parentd)?;
        self.let_modify_dir(newparentd)?;
        self.let_modify_inode(child)
    }

    pub(crate) fn let_rename_tgt(
        &mut self,
        task: &Task,
        newparentd: &VnodeRef,
        curchild: Option<&VnodeRef>,
    ) -> Result<()> {
        self.let_dir_waccess(task, newparentd)?;
        if !newparentd.borrow().dir().has_space() {
            return Err(FnxError::MLink);
        }
        let Some(curchild) = curchild else {
            return Ok(()); // no overridden target
        };
        self.verify_sticky(task, newparentd, curchild)?;
        if curchild.borrow().is_dir() {
            self.let_rmdir(task, newparentd, curchild)?;
        }
        self.let_modify_dir(newparentd)?;
        self.let_modify_inode(curchild)
    }

    // ------------------------------------------------------------------
    // I/O range and space gates
    // ------------------------------------------------------------------

    fn let_iorange(&self, task: &Task, ino: Ino, off: u64, len: u64) -> Result<()> {
        self.fileref_let_ino(task, ino)?;
        let end = off.checked_add(len).ok_or(FnxError::FBig)?;
        if off >= REGSIZE_MAX || end > REGSIZE_MAX {
            return Err(FnxError::FBig);
        }
        Ok(())
    }

    fn let_space(&self, task: &Task, regvn: &VnodeRef, off: u64, len: u64) -> Result<()> {
        if regvn.borrow().pseudo {
            return Ok(());
        }
        let beg = off_floor_blk(off);
        let end = off_ceil_blk(off + len);
        let nblks = (end - beg) / crate::types::BLKSIZE + WRITE_META_BLKS;
        let sv = self.super_vn().clone();
        let has = sv
            .borrow()
            .superb()
            .stat
            .has_free_blocks(nblks, uctx_of(task).is_privileged());
        if has { Ok(()) } else { Err(FnxError::NoSpace) }
    }

    fn fref_writeable(&self, task: &Task) -> Result<bool> {
        let frid = task.fref.ok_or(FnxError::BadF)?;
        Ok(self.frpool.get(frid).ok_or(FnxError::BadF)?.writeable)
    }

    fn fref_readable(&self, task: &Task) -> Result<bool> {
        let frid = task.fref.ok_or(FnxError::BadF)?;
        Ok(self.frpool.get(frid).ok_or(FnxError::BadF)?.readable)
    }

    pub(crate) fn let_fallocate(
        &mut self,
        task: &Task,
        regvn: &VnodeRef,
        off: u64,
        len: u64,
    ) -> Result<()> {
        let ino = regvn.borrow().inode().ino();
        self.let_iorange(task, ino, off, len)?;
        self.let_space(task, regvn, off, len)?;
        self.let_modify_inode(regvn)?;
        if !self.fref_writeable(task)? {
            return Err(FnxError::Perm);
        }
        Ok(())
    }

    pub(crate) fn let_write(
        &mut self,
        task: &Task,
        regvn: &VnodeRef,
        off: u64,
        len: u64,
    ) -> Result<()> {
        let ino = regvn.borrow().inode().ino();
        self.let_modify_vnode(regvn)?;
        self.let_iorange(task, ino, off, len)?;
        if !self.fref_writeable(task)? {
            return Err(FnxError::Perm);
        }
        self.let_space(task, regvn, off, len)
    }

    pub(crate) fn let_read(
        &mut self,
        task: &Task,
        regvn: &VnodeRef,
        off: u64,
        len: u64,
    ) -> Result<()> {
        let ino = regvn.borrow().inode().ino();
        self.let_iorange(task, ino, off, len)?;
        if !self.fref_readable(task)? {
            return Err(FnxError::BadF);
        }
        Ok(())
    }

    pub(crate) fn let_punch(
        &mut self,
        task: &Task,
        regvn: &VnodeRef,
        off: u64,
        len: u64,
    ) -> Result<()> {
        let ino = regvn.borrow().inode().ino();
        self.let_iorange(task, ino, off, len)?;
        self.let_modify_inode(regvn)?;
        if !self.fref_writeable(task)? {
            return Err(FnxError::Perm);
        }
        Ok(())
    }

    pub(crate) fn let_fquery(&self, task: &Task, regvn: &VnodeRef) -> Result<()> {
        let ino = regvn.borrow().inode().ino();
        self.fileref_let_ino(task, ino)?;
        if !self.fref_readable(task)? {
            return Err(FnxError::Perm);
        }
        Ok(())
    }
}
