use log::debug;

use crate::error::{FnxError, Result};
use crate::fileref::{FrId, OpenFlags};
use crate::task::{Opcode, Request, Response, Task};
use crate::types::{DOFF_NONE, INO_NULL, Ino, doff_isvalid};
use crate::vobj::inode::Iattr;
use crate::vobj::vnode::VnodeRef;
use crate::vproc::Vproc;

/// Attribute snapshot for a response; regs fold in their block count.
fn getiattr(vnode: &VnodeRef) -> Iattr {
    let v = vnode.borrow();
    if v.is_reg() {
        v.reg().getiattr()
    } else {
        v.inode().iattr.clone()
    }
}

impl Vproc {
    fn count_read(&mut self, nbytes: u64) {
        let sv = self.super_vn().clone();
        sv.borrow_mut().superb_mut().rdst.update(nbytes);
    }

    fn count_write(&mut self, nbytes: u64) {
        let sv = self.super_vn().clone();
        sv.borrow_mut().superb_mut().wrst.update(nbytes);
    }

    fn attach_fileref(&mut self, task: &mut Task, ino: Ino, flags: OpenFlags) -> Result<FrId> {
        let Some(frid) = self.frpool.tie(ino, flags) else {
            log::warn!("vproc: no-new-fileref nused={}", self.frpool.nused());
            return Err(FnxError::NFile);
        };
        self.iref_get(ino);
        task.fref = Some(frid);
        Ok(frid)
    }

    fn detach_fileref(&mut self, task: &mut Task) -> Result<()> {
        let frid = task.fref.take().ok_or(FnxError::BadF)?;
        let fref = self.frpool.untie(frid).ok_or(FnxError::BadF)?;
        self.iref_put(fref.ino);
        if let Ok(vn) = self.fetch_cached_inode(fref.ino) {
            if vn.borrow().expired {
                self.fix_unlinked(Some(&vn))?;
            }
        }
        Ok(())
    }
}

/// Select and run the handler for the task's opcode: resolve inode(s),
/// let-check, prep, exec, populate the response.
pub(crate) fn dispatch_op(vproc: &mut Vproc, task: &mut Task) -> Result<()> {
    match task.opcode {
        Opcode::Lookup => vop_lookup(vproc, task),
        Opcode::Forget => vop_forget(vproc, task),
        Opcode::Getattr => vop_getattr(vproc, task),
        Opcode::Setattr => vop_setattr(vproc, task),
        Opcode::Readlink => vop_readlink(vproc, task),
        Opcode::Symlink => vop_symlink(vproc, task),
        Opcode::Mknod => vop_mknod(vproc, task),
        Opcode::Mkdir => vop_mkdir(vproc, task),
        Opcode::Unlink => vop_unlink(vproc, task),
        Opcode::Rmdir => vop_rmdir(vproc, task),
        Opcode::Rename => vproc.exec_rename(task),
        Opcode::Link => vop_link(vproc, task),
        Opcode::Open => vop_open(vproc, task),
        Opcode::Read => vop_read(vproc, task),
        Opcode::Write => vop_write(vproc, task),
        Opcode::Statfs => vop_statfs(vproc, task),
        Opcode::Release => vop_release(vproc, task),
        Opcode::Fsync => vop_fsync(vproc, task),
        Opcode::Flush => vop_flush(vproc, task),
        Opcode::Opendir => vop_opendir(vproc, task),
        Opcode::Readdir => vop_readdir(vproc, task),
        Opcode::Releasedir => vop_releasedir(vproc, task),
        Opcode::Fsyncdir => vop_fsyncdir(vproc, task),
        Opcode::Access => vop_access(vproc, task),
        Opcode::Create => vop_create(vproc, task),
        Opcode::Fallocate => vop_fallocate(vproc, task),
        Opcode::Punch => vop_punch(vproc, task),
        Opcode::Truncate => vop_truncate(vproc, task),
        Opcode::Fquery => vop_fquery(vproc, task),
        Opcode::Fsinfo => vop_fsinfo(vproc, task),
    }
}

fn vop_lookup(vproc: &mut Vproc, task: &mut Task) -> Result<()> {
    let Request::Lookup { parent, name } = task.request.clone() else {
        return Err(FnxError::Inval);
    };
    let dirvn = vproc.fetch_dir(parent)?;
    vproc.let_lookup(task, &dirvn)?;
    let vn = vproc.lookup_inode(&dirvn, &name)?;
    task.response = Response::Iattr { iattr: getiattr(&vn) };
    debug!("vproc: lookup parent={parent:#x} name={name}");
    Ok(())
}

fn vop_forget(vproc: &mut Vproc, task: &mut Task) -> Result<()> {
    let Request::Forget { ino, nlookup } = task.request.clone() else {
        return Err(FnxError::Inval);
    };
    vproc.let_forget(task, ino)?;
    if nlookup > 0 {
        vproc.exec_forget(ino)?;
    }
    debug!("vproc: forget ino={ino:#x} nlookup={nlookup}");
    Ok(())
}

fn vop_getattr(vproc: &mut Vproc, task: &mut Task) -> Result<()> {
    let Request::Getattr { ino } = task.request.clone() else {
        return Err(FnxError::Inval);
    };
    let vn = vproc.fetch_inode(ino)?;
    vproc.let_getattr(task, &vn)?;
    task.response = Response::Iattr { iattr: getiattr(&vn) };
    Ok(())
}

fn vop_setattr(vproc: &mut Vproc, task: &mut Task) -> Result<()> {
    let Request::Setattr {
        ino,
        flags,
        mode,
        uid,
        gid,
        size,
        times,
    } = task.request.clone()
    else {
        return Err(FnxError::Inval);
    };
    let vn = vproc.fetch_inode(ino)?;
    vproc.let_setattr(task, &vn, flags, mode, uid, gid, size)?;
    let uctx = task.uctx.clone();
    if flags.contains(crate::vobj::inode::SetAttrFlags::SIZE)
        && vn.borrow().inode().size() != size
    {
        // Size changes run through the data path with the ghost fileref.
        vproc.reassure_task_fref(task, ino);
        let rc = vproc.exec_trunc(task, size);
        vproc.fadeaway_task_fref(task);
        rc?;
    }
    let flags_rest = flags - crate::vobj::inode::SetAttrFlags::SIZE;
    vproc.setiattr(&vn, &uctx, flags_rest, mode, uid, gid, size, &times)?;
    task.response = Response::Iattr { iattr: getiattr(&vn) };
    debug!("vproc: setattr ino={ino:#x} flags={flags:?} mode={mode:o}");
    Ok(())
}

fn vop_truncate(vproc: &mut Vproc, task: &mut Task) -> Result<()> {
    let Request::Truncate { ino, size } = task.request.clone() else {
        return Err(FnxError::Inval);
    };
    // No grab here: a by-path truncate carries no fileref.
    let regvn = vproc.fetch_reg(ino)?;
    vproc.let_truncate(task, &regvn)?;
    vproc.let_setsize(task, &regvn, size)?;
    if size != regvn.borrow().inode().size() {
        vproc.reassure_task_fref(task, ino);
        let rc = vproc.exec_trunc(task, size);
        vproc.fadeaway_task_fref(task);
        rc?;
    }
    task.response = Response::Iattr { iattr: getiattr(&regvn) };
    debug!("vproc: truncate ino={ino:#x} size={size}");
    Ok(())
}

fn vop_readlink(vproc: &mut Vproc, task: &mut Task) -> Result<()> {
    let Request::Readlink { ino } = task.request.clone() else {
        return Err(FnxError::Inval);
    };
    let slvn = vproc.fetch_symlnk(ino)?;
    vproc.let_readlink(task, &slvn)?;
    let slnk = vproc.read_symlnk(&slvn)?;
    task.response = Response::Readlink { slnk };
    Ok(())
}

fn vop_symlink(vproc: &mut Vproc, task: &mut Task) -> Result<()> {
    let Request::Symlink { parent, name, slnk } = task.request.clone() else {
        return Err(FnxError::Inval);
    };
    let dirvn = vproc.fetch_dir(parent)?;
    vproc.let_symlink(task, &dirvn, &name, &slnk)?;
    vproc.prep_link(&dirvn, &name)?;
    let uctx = task.uctx.clone();
    let vn = vproc.acquire_symlnk(&uctx, &slnk)?;
    if let Err(e) = vproc.link_child(&dirvn, &vn, &name) {
        vproc.retire_vnode(&vn);
        return Err(e);
    }
    task.response = Response::Iattr { iattr: getiattr(&vn) };
    debug!("vproc: symlink parent={parent:#x} name={name} slnk={slnk}");
    Ok(())
}

fn vop_mknod(vproc: &mut Vproc, task: &mut Task) -> Result<()> {
    let Request::Mknod {
        parent,
        name,
        mode,
        rdev,
    } = task.request.clone()
    else {
        return Err(FnxError::Inval);
    };
    let dirvn = vproc.fetch_dir(parent)?;
    vproc.let_mknod(task, &dirvn, &name, mode)?;
    vproc.prep_link(&dirvn, &name)?;
    let uctx = task.uctx.clone();
    let vn = vproc.acquire_special(&uctx, mode, rdev)?;
    if let Err(e) = vproc.link_child(&dirvn, &vn, &name) {
        vproc.retire_vnode(&vn);
        return Err(e);
    }
    task.response = Response::Iattr { iattr: getiattr(&vn) };
    debug!("vproc: mknod parent={parent:#x} name={name} mode={mode:o} rdev={rdev:#x}");
    Ok(())
}

fn vop_mkdir(vproc: &mut Vproc, task: &mut Task) -> Result<()> {
    let Request::Mkdir { parent, name, mode } = task.request.clone() else {
        return Err(FnxError::Inval);
    };
    let dirvn = vproc.fetch_dir(parent)?;
    vproc.let_mkdir(task, &dirvn, &name, mode)?;
    vproc.prep_link(&dirvn, &name)?;
    let uctx = task.uctx.clone();
    let vn = vproc.acquire_dir(&uctx, mode)?;
    if let Err(e) = vproc.link_child(&dirvn, &vn, &name) {
        vproc.retire_vnode(&vn);
        return Err(e);
    }
    task.response = Response::Iattr { iattr: getiattr(&vn) };
    debug!("vproc: mkdir parent={parent:#x} name={name} mode={mode:o}");
    Ok(())
}

fn vop_unlink(vproc: &mut Vproc, task: &mut Task) -> Result<()> {
    let Request::Unlink { parent, name } = task.request.clone() else {
        return Err(FnxError::Inval);
    };
    let dirvn = vproc.fetch_dir(parent)?;
    let vn = vproc.lookup_link(&dirvn, &name)?;
    vproc.let_unlink(task, &dirvn, &vn)?;
    let ino = vn.borrow().inode().refino_or_self();
    vproc.prep_xunlink(&dirvn, &vn)?;
    vproc.unlink_child(&dirvn, &vn)?;
    vproc.fix_unlinked(Some(&vn))?;
    task.response = Response::Unlink { ino };
    debug!("vproc: unlink parent={parent:#x} name={name} ino={ino:#x}");
    Ok(())
}

fn vop_rmdir(vproc: &mut Vproc, task: &mut Task) -> Result<()> {
    let Request::Rmdir { parent, name } = task.request.clone() else {
        return Err(FnxError::Inval);
    };
    let dirvn = vproc.fetch_dir(parent)?;
    let vn = vproc.lookup_dir(&dirvn, &name)?;
    vproc.let_rmdir(task, &dirvn, &vn)?;
    vproc.prep_unlink(&dirvn, &vn)?;
    vproc.unlink_child(&dirvn, &vn)?;
    vproc.fix_unlinked(Some(&vn))?;
    debug!("vproc: rmdir parent={parent:#x} name={name}");
    Ok(())
}

fn vop_link(vproc: &mut Vproc, task: &mut Task) -> Result<()> {
    let Request::Link {
        ino,
        newparent,
        newname,
    } = task.request.clone()
    else {
        return Err(FnxError::Inval);
    };
    let dirvn = vproc.fetch_dir(newparent)?;
    let vn = vproc.fetch_inode(ino)?;
    vproc.let_namespace(task, &newname)?;
    vproc.let_link(task, &dirvn, &vn, &newname)?;
    vproc.prep_link(&dirvn, &newname)?;
    let uctx = task.uctx.clone();
    let rlnk = vproc.acquire_reflnk(&uctx, ino)?;
    if let Err(e) = vproc.link_child(&dirvn, &rlnk, &newname) {
        vproc.retire_vnode(&rlnk);
        return Err(e);
    }
    task.response = Response::Iattr { iattr: getiattr(&vn) };
    debug!("vproc: link ino={ino:#x} newparent={newparent:#x} newname={newname}");
    Ok(())
}

fn vop_open(vproc: &mut Vproc, task: &mut Task) -> Result<()> {
    let Request::Open { ino, flags } = task.request.clone() else {
        return Err(FnxError::Inval);
    };
    let vn = vproc.fetch_inode(ino)?;
    vproc.let_open(task, &vn, flags)?;
    let frid = vproc.attach_fileref(task, ino, flags)?;
    if let Err(e) = vproc.exec_open(task, flags) {
        vproc.detach_fileref(task)?;
        return Err(e);
    }
    task.response = Response::Open { fh: frid };
    debug!("vproc: open ino={ino:#x} flags={flags:?}");
    Ok(())
}

fn vop_read(vproc: &mut Vproc, task: &mut Task) -> Result<()> {
    let Request::Read { ino, fh, off, size } = task.request.clone() else {
        return Err(FnxError::Inval);
    };
    task.fref = Some(fh);
    let regvn = vproc.grab_reg(task, ino)?;
    vproc.let_read(task, &regvn, off, size)?;
    vproc.exec_read(task, off, size)?;
    let rsize = task.iobufs.len();
    task.response = Response::Read { size: rsize };
    vproc.count_read(rsize);
    debug!("vproc: read ino={ino:#x} off={off} rsize={rsize}");
    Ok(())
}

fn vop_write(vproc: &mut Vproc, task: &mut Task) -> Result<()> {
    let Request::Write { ino, fh, off, size } = task.request.clone() else {
        return Err(FnxError::Inval);
    };
    task.fref = Some(fh);
    let regvn = match vproc.grab_reg(task, ino) {
        Ok(vn) => vn,
        Err(e) => {
            if e != FnxError::Pend {
                vproc.relax_iobufs(task);
            }
            return Err(e);
        }
    };
    if let Err(e) = vproc.let_write(task, &regvn, off, size) {
        if e != FnxError::Pend {
            vproc.relax_iobufs(task);
        }
        return Err(e);
    }
    vproc.exec_write(task)?;
    let wsize = task.iobufs.len();
    task.response = Response::Write { size: wsize };
    vproc.count_write(wsize);
    debug!("vproc: write ino={ino:#x} off={off} size={wsize}");
    Ok(())
}

fn vop_statfs(vproc: &mut Vproc, task: &mut Task) -> Result<()> {
    let Request::Statfs { ino } = task.request.clone() else {
        return Err(FnxError::Inval);
    };
    let vn = vproc.fetch_inode(ino)?;
    vproc.let_statfs(task, &vn)?;
    let fsinfo = vproc.super_vn().borrow().superb().getfsinfo();
    task.response = Response::Fsinfo { fsinfo };
    Ok(())
}

fn vop_release(vproc: &mut Vproc, task: &mut Task) -> Result<()> {
    let Request::Release { ino, fh, flags } = task.request.clone() else {
        return Err(FnxError::Inval);
    };
    task.fref = Some(fh);
    vproc.let_release(task, ino)?;
    vproc.exec_release(task)?;
    debug!("vproc: release ino={ino:#x} flags={flags:?}");
    Ok(())
}

fn vop_fsync(vproc: &mut Vproc, task: &mut Task) -> Result<()> {
    let Request::Fsync { ino, fh, datasync } = task.request.clone() else {
        return Err(FnxError::Inval);
    };
    task.fref = Some(fh);
    vproc.let_fsync(task, ino)?;
    vproc.exec_fsync(task)?;
    debug!("vproc: fsync ino={ino:#x} datasync={datasync}");
    Ok(())
}

fn vop_flush(vproc: &mut Vproc, task: &mut Task) -> Result<()> {
    let Request::Flush { ino, fh } = task.request.clone() else {
        return Err(FnxError::Inval);
    };
    task.fref = Some(fh);
    vproc.let_flush(task, ino)?;
    vproc.exec_fsync(task)?;
    debug!("vproc: flush ino={ino:#x}");
    Ok(())
}

fn vop_opendir(vproc: &mut Vproc, task: &mut Task) -> Result<()> {
    let Request::Opendir { ino } = task.request.clone() else {
        return Err(FnxError::Inval);
    };
    let dirvn = vproc.fetch_dir(ino)?;
    vproc.let_opendir(task, &dirvn)?;
    let frid = vproc.attach_fileref(task, ino, OpenFlags::empty())?;
    task.response = Response::Opendir { fh: frid };
    debug!("vproc: opendir ino={ino:#x}");
    Ok(())
}

fn vop_readdir(vproc: &mut Vproc, task: &mut Task) -> Result<()> {
    let Request::Readdir { ino, fh, off } = task.request.clone() else {
        return Err(FnxError::Inval);
    };
    task.fref = Some(fh);

    // Valid even past end-of-stream: the empty entry closes the stream.
    task.response = Response::Readdir {
        name: String::new(),
        child: INO_NULL,
        mode: 0,
        next: DOFF_NONE,
    };
    if !doff_isvalid(off) {
        return Ok(());
    }
    vproc.let_readdir(task, ino, off)?;
    let dirvn = vproc.fetch_dir(ino)?;
    match vproc.search_dent(&dirvn, off) {
        Ok((name, child, next)) => {
            let (child_ino, mode) = {
                let c = child.borrow();
                (c.inode().ino(), c.inode().iattr.mode)
            };
            task.response = Response::Readdir {
                name,
                child: child_ino,
                mode,
                next,
            };
        }
        Err(FnxError::Eos) => {}
        Err(e) => return Err(e),
    }
    Ok(())
}

fn vop_releasedir(vproc: &mut Vproc, task: &mut Task) -> Result<()> {
    let Request::Releasedir { ino, fh } = task.request.clone() else {
        return Err(FnxError::Inval);
    };
    task.fref = Some(fh);
    vproc.let_releasedir(task, ino)?;
    vproc.detach_fileref(task)?;
    debug!("vproc: releasedir ino={ino:#x}");
    Ok(())
}

fn vop_fsyncdir(vproc: &mut Vproc, task: &mut Task) -> Result<()> {
    let Request::Fsyncdir { ino, fh, datasync } = task.request.clone() else {
        return Err(FnxError::Inval);
    };
    task.fref = Some(fh);
    let dirvn = vproc.grab_dir(task, ino)?;
    vproc.let_fsyncdir(task, &dirvn)?;
    vproc.exec_fsync(task)?;
    debug!("vproc: fsyncdir ino={ino:#x} datasync={datasync}");
    Ok(())
}

fn vop_access(vproc: &mut Vproc, task: &mut Task) -> Result<()> {
    let Request::Access { ino, mask } = task.request.clone() else {
        return Err(FnxError::Inval);
    };
    let vn = vproc.fetch_inode(ino)?;
    vproc.let_access(task, &vn, mask)?;
    Ok(())
}

fn vop_create(vproc: &mut Vproc, task: &mut Task) -> Result<()> {
    let Request::Create {
        parent,
        name,
        mode,
        flags,
    } = task.request.clone()
    else {
        return Err(FnxError::Inval);
    };
    let dirvn = vproc.fetch_dir(parent)?;
    vproc.let_create(task, &dirvn, &name, mode)?;
    vproc.prep_link(&dirvn, &name)?;
    let uctx = task.uctx.clone();
    let vn = vproc.acquire_reg(&uctx, mode)?;
    vproc
        .link_child(&dirvn, &vn, &name)
        .expect("prepped link failed to commit");
    let vn_ino = vn.borrow().inode().ino();
    let frid = match vproc.attach_fileref(task, vn_ino, flags) {
        Ok(frid) => frid,
        Err(e) => {
            vproc.retire_vnode(&vn);
            return Err(e);
        }
    };
    task.response = Response::Create {
        iattr: getiattr(&vn),
        fh: frid,
    };
    debug!("vproc: create parent={parent:#x} name={name} mode={mode:o} flags={flags:?}");
    Ok(())
}

fn vop_fallocate(vproc: &mut Vproc, task: &mut Task) -> Result<()> {
    let Request::Fallocate {
        ino,
        fh,
        off,
        len,
        keep_size,
    } = task.request.clone()
    else {
        return Err(FnxError::Inval);
    };
    task.fref = Some(fh);
    let regvn = vproc.grab_reg(task, ino)?;
    vproc.let_fallocate(task, &regvn, off, len)?;
    vproc.exec_falloc(task, off, len, keep_size)?;
    debug!("vproc: fallocate ino={ino:#x} off={off} len={len} keep_size={keep_size}");
    Ok(())
}

fn vop_punch(vproc: &mut Vproc, task: &mut Task) -> Result<()> {
    let Request::Punch { ino, fh, off, len } = task.request.clone() else {
        return Err(FnxError::Inval);
    };
    task.fref = Some(fh);
    let regvn = vproc.grab_reg(task, ino)?;
    vproc.let_punch(task, &regvn, off, len)?;
    vproc.exec_punch(task, off, len)?;
    debug!("vproc: punch ino={ino:#x} off={off} len={len}");
    Ok(())
}

fn vop_fquery(vproc: &mut Vproc, task: &mut Task) -> Result<()> {
    let Request::Fquery { ino, fh } = task.request.clone() else {
        return Err(FnxError::Inval);
    };
    task.fref = Some(fh);
    let regvn = vproc.grab_reg(task, ino)?;
    vproc.let_fquery(task, &regvn)?;
    task.response = Response::Iattr { iattr: getiattr(&regvn) };
    Ok(())
}

fn vop_fsinfo(vproc: &mut Vproc, task: &mut Task) -> Result<()> {
    let Request::Fsinfo { ino } = task.request.clone() else {
        return Err(FnxError::Inval);
    };
    let vn = vproc.fetch_inode(ino)?;
    vproc.let_statfs(task, &vn)?;
    let fsinfo = vproc.super_vn().borrow().superb().getfsinfo();
    task.response = Response::Fsinfo { fsinfo };
    Ok(())
}
