use crate::error::{FnxError, Result};
use crate::fileref::{FrId, OpenFlags};
use crate::task::{Iobufs, Task};
use crate::types::{
    BLKSIZE, Lrange, Vaddr, off_ceil_blk, off_floor_blk, off_isseg0, off_issec0, off_next_rseg,
    off_next_rsec,
};
use crate::vobj::inode::TimeFlags;
use crate::vobj::superblock::MntFlags;
use crate::vobj::vnode::VnodeRef;
use crate::vproc::Vproc;

impl Vproc {
    fn fref_ino(&self, task: &Task) -> Result<crate::types::Ino> {
        let frid = task.fref.ok_or(FnxError::BadF)?;
        let fref = self.frpool.get(frid).ok_or(FnxError::BadF)?;
        Ok(fref.ino)
    }

    fn fref_reg(&mut self, task: &Task) -> Result<VnodeRef> {
        let ino = self.fref_ino(task)?;
        self.fetch_reg(ino)
    }

    pub(crate) fn has_noatime(&self, frid: FrId) -> bool {
        if self.mntf.contains(MntFlags::NOATIME) {
            return true;
        }
        self.frpool.get(frid).is_some_and(|f| f.noatime)
    }

    fn refresh_reg(&mut self, regvn: &VnodeRef, mc: bool) {
        let tf = if mc {
            TimeFlags::AMCTIME
        } else {
            TimeFlags::ATIME
        };
        regvn.borrow_mut().inode_mut().setitime(tf);
        self.put_vnode(regvn);
    }

    fn expire(&mut self, vnode: &VnodeRef) {
        vnode.borrow_mut().expired = true;
        self.put_vnode(vnode);
    }

    fn fetch_vbk(&mut self, vba: &Vaddr) -> Result<VnodeRef> {
        let vbk = self.fetch_vnode(vba)?;
        self.require_mutable(&vbk)?;
        Ok(vbk)
    }

    // ------------------------------------------------------------------
    // Extent-map tier plumbing
    // ------------------------------------------------------------------

    fn vba_at(&self, regvn: &VnodeRef, regseg: Option<&VnodeRef>, isseg0: bool, pos: usize) -> Vaddr {
        if isseg0 {
            regvn.borrow().reg().segmap0[pos]
        } else {
            regseg.expect("regseg missing").borrow().regseg().segmap[pos]
        }
    }

    fn set_vba_at(
        &self,
        regvn: &VnodeRef,
        regseg: Option<&VnodeRef>,
        isseg0: bool,
        pos: usize,
        vba: Vaddr,
    ) {
        if isseg0 {
            regvn.borrow_mut().reg_mut().segmap0[pos] = vba;
        } else {
            regseg
                .expect("regseg missing")
                .borrow_mut()
                .regseg_mut()
                .segmap[pos] = vba;
        }
    }

    fn acquire_regseg(&mut self, regvn: &VnodeRef, off: u64) -> Result<VnodeRef> {
        let ino = regvn.borrow().inode().ino();
        self.acquire_vvnode(&Vaddr::for_regseg(ino, off))
    }

    fn acquire_regsec(&mut self, regvn: &VnodeRef, off: u64) -> Result<VnodeRef> {
        let ino = regvn.borrow().inode().ino();
        self.acquire_vvnode(&Vaddr::for_regsec(ino, off))
    }

    fn fetch_regsec(&mut self, regvn: &VnodeRef, off: u64) -> Result<VnodeRef> {
        let ino = regvn.borrow().inode().ino();
        let vn = self.fetch_vnode(&Vaddr::for_regsec(ino, off))?;
        self.require_mutable(&vn)?;
        Ok(vn)
    }

    fn fetch_regseg(&mut self, regvn: &VnodeRef, off: u64) -> Result<VnodeRef> {
        let ino = regvn.borrow().inode().ino();
        let vn = self.fetch_vnode(&Vaddr::for_regseg(ino, off))?;
        self.require_mutable(&vn)?;
        Ok(vn)
    }

    /// Fetch the mapping nodes covering `lrange` without creating anything.
    /// `Err(NoEnt)` means the range is a hole.
    fn tryfetch_secseg(
        &mut self,
        regvn: &VnodeRef,
        lrange: &Lrange,
    ) -> Result<(Option<VnodeRef>, Option<VnodeRef>)> {
        let off = lrange.off;
        if off_isseg0(off) {
            return Ok((None, None));
        }
        if off_issec0(off) {
            if !regvn.borrow().reg().testseg(off) {
                return Err(FnxError::NoEnt);
            }
            let regseg = self.fetch_regseg(regvn, off)?;
            return Ok((None, Some(regseg)));
        }
        if !regvn.borrow().reg().testsec(off) {
            return Err(FnxError::NoEnt);
        }
        let regsec = self.fetch_regsec(regvn, off)?;
        if !regsec.borrow().regsec().testseg(off) {
            return Err(FnxError::NoEnt);
        }
        let regseg = self.fetch_regseg(regvn, off)?;
        Ok((Some(regsec), Some(regseg)))
    }

    /// Fetch-or-create the regsec covering a beyond-section-0 offset.
    fn yield_regsec(&mut self, regvn: &VnodeRef, lrange: &Lrange) -> Result<VnodeRef> {
        let off = lrange.off;
        if regvn.borrow().reg().testsec(off) {
            self.fetch_regsec(regvn, off)
        } else {
            let regsec = self.acquire_regsec(regvn, off)?;
            {
                let mut r = regvn.borrow_mut();
                let reg = r.reg_mut();
                reg.marksec(off);
                reg.wmore(lrange.end(), 0, true);
            }
            self.put_vnode(regvn);
            Ok(regsec)
        }
    }

    /// Fetch-or-create a section-0 regseg (tracked by the reg head itself).
    fn yield_regseg0(&mut self, regvn: &VnodeRef, lrange: &Lrange) -> Result<VnodeRef> {
        let off = lrange.off;
        if regvn.borrow().reg().testseg(off) {
            self.fetch_regseg(regvn, off)
        } else {
            let regseg = self.acquire_regseg(regvn, off)?;
            {
                let mut r = regvn.borrow_mut();
                let reg = r.reg_mut();
                reg.markseg(off);
                if !reg.testsec(off) {
                    reg.marksec(off);
                }
                reg.wmore(lrange.end(), 0, true);
            }
            self.put_vnode(regvn);
            Ok(regseg)
        }
    }

    /// Fetch-or-create a regseg below an existing regsec.
    fn yield_regseg(
        &mut self,
        regvn: &VnodeRef,
        regsec: &VnodeRef,
        lrange: &Lrange,
    ) -> Result<VnodeRef> {
        let off = lrange.off;
        if regsec.borrow().regsec().testseg(off) {
            self.fetch_regseg(regvn, off)
        } else {
            let regseg = self.acquire_regseg(regvn, off)?;
            regsec.borrow_mut().regsec_mut().markseg(off);
            regvn.borrow_mut().reg_mut().wmore(lrange.end(), 0, true);
            self.put_vnode(regsec);
            self.put_vnode(regvn);
            Ok(regseg)
        }
    }

    /// Ensure the mapping nodes covering `lrange` exist; which tiers are
    /// needed is purely a function of the offset.
    fn require_secseg(
        &mut self,
        regvn: &VnodeRef,
        lrange: &Lrange,
    ) -> Result<(Option<VnodeRef>, Option<VnodeRef>)> {
        let off = lrange.off;
        if off_isseg0(off) {
            Ok((None, None))
        } else if off_issec0(off) {
            let regseg = self.yield_regseg0(regvn, lrange)?;
            Ok((None, Some(regseg)))
        } else {
            let regsec = self.yield_regsec(regvn, lrange)?;
            let regseg = self.yield_regseg(regvn, &regsec, lrange)?;
            Ok((Some(regsec), Some(regseg)))
        }
    }

    // ------------------------------------------------------------------
    // Write pipeline
    // ------------------------------------------------------------------

    /// Pre-stage the blocks already mapped under the write range, so the
    /// whole write either runs to completion or pends before mutating.
    fn stage_vbks(
        &mut self,
        regvn: &VnodeRef,
        regseg: Option<&VnodeRef>,
        lrange: &Lrange,
    ) -> Result<()> {
        let isseg0 = off_isseg0(lrange.off);
        for i in 0..lrange.cnt {
            let pos = lrange.idx + i;
            let vba = self.vba_at(regvn, regseg, isseg0, pos);
            if vba.is_null() {
                continue;
            }
            self.fetch_vbk(&vba)?;
        }
        Ok(())
    }

    fn prepare_write(&mut self, regvn: &VnodeRef, iobufs: &Iobufs) -> Result<()> {
        let nblks: usize = iobufs.iob.iter().map(|b| b.rng.cnt).sum();
        self.predict_next_vba(nblks)?;

        for iobuf in &iobufs.iob {
            match self.tryfetch_secseg(regvn, &iobuf.rng) {
                Err(FnxError::NoEnt) => continue, // hole, nothing to stage
                Err(e) => return Err(e),
                Ok((_, regseg)) => {
                    self.stage_vbks(regvn, regseg.as_ref(), &iobuf.rng)?;
                }
            }
        }
        for iobuf in &iobufs.iob {
            self.require_secseg(regvn, &iobuf.rng)?;
        }
        Ok(())
    }

    /// Allocate a fresh vbk carrying the caller's bytes and swing the map
    /// slot onto it; the displaced block (if any) is merged into the gap of
    /// a sub-block write and expired.
    fn write_regseg(
        &mut self,
        regvn: &VnodeRef,
        regseg: Option<&VnodeRef>,
        iobuf: &mut crate::task::Iobuf,
    ) -> Result<()> {
        let rng = iobuf.rng;
        let isseg0 = off_isseg0(rng.off);
        let end = rng.end();
        let mut off = rng.off;

        for i in 0..rng.cnt {
            let pos = rng.idx + i;
            let piv = (off_floor_blk(off) + BLKSIZE).min(end);
            let srange = Lrange::span(off, piv);

            let Some(bkref) = iobuf.bks[pos].clone() else {
                off = piv;
                continue; // consumed by an earlier attempt
            };

            let vba = self.vba_at(regvn, regseg, isseg0, pos);
            let rewrite = !vba.is_null();
            let vbk_cur = if rewrite {
                Some(self.fetch_vbk(&vba)?)
            } else {
                None
            };

            let vbk_new = self.acquire_vbk(bkref)?;
            let new_vba = vbk_new.borrow().vaddr;
            self.set_vba_at(regvn, regseg, isseg0, pos, new_vba);
            {
                let mut r = regvn.borrow_mut();
                r.reg_mut()
                    .wmore(srange.end(), if rewrite { 0 } else { 1 }, false);
            }
            self.put_vnode(regvn);
            if let Some(rs) = regseg {
                self.put_vnode(rs);
            }

            if let Some(cur) = vbk_cur {
                if srange.is_subblk() {
                    let beg = (srange.off % BLKSIZE) as usize;
                    let end_in = beg + srange.len as usize;
                    let newbk = vbk_new.borrow().bkref.clone().expect("vbk without block");
                    let curbk = cur.borrow().bkref.clone().expect("vbk without block");
                    newbk.borrow_mut().merge_from(&curbk.borrow(), beg, end_in);
                }
                self.expire(&cur);
            }

            iobuf.bks[pos] = None;
            off = piv;
        }
        Ok(())
    }

    fn write_data(&mut self, regvn: &VnodeRef, iobufs: &mut Iobufs) -> Result<()> {
        self.prepare_write(regvn, iobufs)?;
        let total = iobufs.len();
        for i in 0..iobufs.iob.len() {
            let rng = iobufs.iob[i].rng;
            let (_, regseg) = self.require_secseg(regvn, &rng)?;
            let mut iobuf = std::mem::replace(
                &mut iobufs.iob[i],
                crate::task::Iobuf {
                    rng,
                    bks: Vec::new(),
                },
            );
            let rc = self.write_regseg(regvn, regseg.as_ref(), &mut iobuf);
            iobufs.iob[i] = iobuf;
            rc?;
        }
        self.refresh_reg(regvn, total > 0);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Trim / punch / truncate
    // ------------------------------------------------------------------

    fn trim_regseg(
        &mut self,
        regvn: &VnodeRef,
        regseg: Option<&VnodeRef>,
        lrange: &Lrange,
    ) -> Result<()> {
        let isseg0 = off_isseg0(lrange.off);
        for i in 0..lrange.cnt {
            let pos = lrange.idx + i;
            let vba = self.vba_at(regvn, regseg, isseg0, pos);
            if vba.is_null() {
                continue;
            }
            let vbk = self.fetch_vbk(&vba)?;
            self.set_vba_at(regvn, regseg, isseg0, pos, Vaddr::NULL);
            self.expire(&vbk);
            regvn.borrow_mut().reg_mut().wless(1);
        }
        Ok(())
    }

    /// After trimming, drop mapping nodes that went empty and clear their
    /// existence bits.
    fn settle_trimmed(
        &mut self,
        regvn: &VnodeRef,
        regseg: Option<&VnodeRef>,
        regsec: Option<&VnodeRef>,
        lrange: &Lrange,
    ) {
        let off = lrange.off;
        let isseg0 = off_isseg0(off);
        let issec0 = off_issec0(off);

        let seg_empty = regseg.map(|rs| rs.borrow().regseg().is_empty());
        if isseg0 || seg_empty == Some(false) {
            if let Some(rs) = regseg {
                self.put_vnode(rs);
            }
            self.put_vnode(regvn);
            return;
        }
        if issec0 {
            {
                let mut r = regvn.borrow_mut();
                let reg = r.reg_mut();
                reg.unmarkseg(off);
                if reg.nsegs == 0 {
                    reg.unmarksec(off);
                }
            }
            self.expire(regseg.expect("trimmed regseg missing"));
            self.put_vnode(regvn);
            return;
        }
        let rc = regsec.expect("trimmed regsec missing");
        rc.borrow_mut().regsec_mut().unmarkseg(off);
        if rc.borrow().regsec().is_empty() {
            regvn.borrow_mut().reg_mut().unmarksec(off);
            self.expire(rc);
        } else {
            self.put_vnode(rc);
        }
        self.expire(regseg.expect("trimmed regseg missing"));
        self.put_vnode(regvn);
    }

    fn trim_data(&mut self, regvn: &VnodeRef, beg: u64, end: u64) -> Result<()> {
        let mut off = beg;
        while off < end {
            let piv = off_next_rseg(off).min(end);
            if !off_isseg0(off) && !off_issec0(off) && !regvn.borrow().reg().testsec(off) {
                off = off_next_rsec(off);
                continue; // sparse, skip the whole section
            }
            let srange = Lrange::span(off, piv);
            match self.tryfetch_secseg(regvn, &srange) {
                Err(FnxError::NoEnt) => {
                    off = piv;
                    continue;
                }
                Err(e) => return Err(e),
                Ok((regsec, regseg)) => {
                    self.trim_regseg(regvn, regseg.as_ref(), &srange)?;
                    self.settle_trimmed(regvn, regseg.as_ref(), regsec.as_ref(), &srange);
                }
            }
            off = piv;
        }
        Ok(())
    }

    /// Whole-block punch within the mapped extent.
    fn punch_data(&mut self, regvn: &VnodeRef, beg: u64, end: u64) -> Result<()> {
        let bend = regvn.borrow().reg().bcap;
        let end = end.min(bend);
        if beg >= bend {
            return Ok(()); // past the mapped region
        }
        let xbeg = off_ceil_blk(beg);
        let xend = off_floor_blk(end);
        if xend <= xbeg {
            return Ok(()); // no whole block in range
        }
        self.trim_data(regvn, xbeg, xend)?;
        if xbeg <= bend && bend < xend {
            regvn.borrow_mut().reg_mut().bcap = xbeg;
        }
        Ok(())
    }

    /// Truncate the data mapping to `off` and set the logical size.
    pub(crate) fn trunc_data(&mut self, regvn: &VnodeRef, off: u64) -> Result<()> {
        let cur = regvn.borrow().reg().size();
        if off < cur {
            let beg = off_ceil_blk(off);
            let end = off_ceil_blk(cur);
            self.punch_data(regvn, beg, end)?;
        }
        regvn.borrow_mut().reg_mut().set_size(off);
        self.refresh_reg(regvn, true);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read pipeline
    // ------------------------------------------------------------------

    fn read_regseg(
        &mut self,
        regvn: &VnodeRef,
        regseg: Option<&VnodeRef>,
        iobuf: &mut crate::task::Iobuf,
    ) -> Result<()> {
        let rng = iobuf.rng;
        let isseg0 = off_isseg0(rng.off);
        for i in 0..rng.cnt {
            let pos = rng.idx + i;
            let vba = self.vba_at(regvn, regseg, isseg0, pos);
            if vba.is_null() {
                continue; // hole, reads as zeros
            }
            let vbk = self.fetch_vbk(&vba)?;
            let bkref = vbk.borrow().bkref.clone().expect("vbk without block");
            bkref.borrow_mut().refcnt += 1;
            iobuf.bks[pos] = Some(bkref);
        }
        Ok(())
    }

    fn read_data(&mut self, regvn: &VnodeRef, iobufs: &mut Iobufs, off: u64, len: u64) -> Result<()> {
        let size = regvn.borrow().reg().size();
        if off >= size {
            *iobufs = Iobufs::default();
            regvn.borrow_mut().inode_mut().setitime(TimeFlags::ATIME);
            return Ok(());
        }
        let len = (off + len).min(size) - off;
        *iobufs = Iobufs::assign(off, len);

        for i in 0..iobufs.iob.len() {
            let rng = iobufs.iob[i].rng;
            let nodes = match self.tryfetch_secseg(regvn, &rng) {
                Err(FnxError::NoEnt) => continue, // hole
                Err(e) => {
                    for bk in iobufs.relax() {
                        self.pstor.retire_bk(bk);
                    }
                    return Err(e);
                }
                Ok(n) => n,
            };
            let mut iobuf = std::mem::replace(
                &mut iobufs.iob[i],
                crate::task::Iobuf {
                    rng,
                    bks: Vec::new(),
                },
            );
            let rc = self.read_regseg(regvn, nodes.1.as_ref(), &mut iobuf);
            iobufs.iob[i] = iobuf;
            if rc.is_err() {
                for bk in iobufs.relax() {
                    self.pstor.retire_bk(bk);
                }
                return rc;
            }
        }

        // atime moves only in cache; the commit decision is the caller's.
        regvn.borrow_mut().inode_mut().setitime(TimeFlags::ATIME);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Data-path execution entry points
    // ------------------------------------------------------------------

    /// O_TRUNC handling at open time.
    pub(crate) fn exec_open(&mut self, task: &Task, flags: OpenFlags) -> Result<()> {
        if !flags.contains(OpenFlags::TRUNC) || !flags.writeable() {
            return Ok(());
        }
        let ino = self.fref_ino(task)?;
        let vn = self.fetch_inode(ino)?;
        let (size, pseudo, isreg) = {
            let v = vn.borrow();
            (v.inode().size(), v.pseudo, v.is_reg())
        };
        if size == 0 || pseudo || !isreg {
            return Ok(());
        }
        self.trunc_data(&vn, 0)?;
        self.refresh_reg(&vn, false);
        Ok(())
    }

    pub(crate) fn exec_read(&mut self, task: &mut Task, off: u64, len: u64) -> Result<()> {
        let regvn = self.fref_reg(task)?;
        if regvn.borrow().pseudo {
            return Err(FnxError::NotSup);
        }
        let mut iobufs = std::mem::take(&mut task.iobufs);
        let rc = self.read_data(&regvn, &mut iobufs, off, len);
        task.iobufs = iobufs;
        rc?;
        let frid = task.fref.expect("read without fileref");
        if !self.has_noatime(frid) {
            // atime went stale on storage; commit the inode for the read.
            self.put_vnode(&regvn);
        }
        Ok(())
    }

    pub(crate) fn exec_write(&mut self, task: &mut Task) -> Result<()> {
        let regvn = self.fref_reg(task)?;
        if regvn.borrow().pseudo {
            return Err(FnxError::NotSup);
        }
        let mut iobufs = std::mem::take(&mut task.iobufs);
        let rc = self.write_data(&regvn, &mut iobufs);
        task.iobufs = iobufs;
        rc?;
        // A write by an unprivileged caller drops the setid bits.
        {
            let mut v = regvn.borrow_mut();
            let inode = v.inode_mut();
            inode.refresh_suid(&task.uctx);
            inode.refresh_sgid(&task.uctx);
        }
        Ok(())
    }

    pub(crate) fn exec_punch(&mut self, task: &Task, off: u64, len: u64) -> Result<()> {
        let regvn = self.fref_reg(task)?;
        if regvn.borrow().pseudo {
            return Err(FnxError::NotSup);
        }
        self.punch_data(&regvn, off, off + len)?;
        self.refresh_reg(&regvn, len > 0);
        Ok(())
    }

    pub(crate) fn exec_trunc(&mut self, task: &Task, size: u64) -> Result<()> {
        let regvn = self.fref_reg(task)?;
        if regvn.borrow().pseudo {
            return Err(FnxError::NotSup);
        }
        self.trunc_data(&regvn, size)?;
        let uctx = task.uctx.clone();
        self.setiattr_size(&regvn, &uctx, size);
        Ok(())
    }

    pub(crate) fn exec_falloc(
        &mut self,
        task: &Task,
        off: u64,
        len: u64,
        keep_size: bool,
    ) -> Result<()> {
        let regvn = self.fref_reg(task)?;
        if regvn.borrow().pseudo {
            return Err(FnxError::NotSup);
        }
        let end = off + len;
        let mut cur = off;
        while cur < end {
            let piv = off_next_rseg(cur).min(end);
            let srange = Lrange::span(cur, piv);
            self.require_secseg(&regvn, &srange)?;
            regvn
                .borrow_mut()
                .reg_mut()
                .wmore(srange.end(), 0, keep_size);
            self.put_vnode(&regvn);
            cur = piv;
        }
        self.refresh_reg(&regvn, len > 0);
        Ok(())
    }

    pub(crate) fn exec_fsync(&mut self, task: &Task) -> Result<()> {
        let ino = self.fref_ino(task)?;
        let vn = self.fetch_inode(ino)?;
        if vn.borrow().pseudo {
            return Ok(());
        }
        self.pstor.sync_vnode(&vn)
    }

    fn reg_needs_implicit_cleanup(&self, vn: &VnodeRef) -> bool {
        let v = vn.borrow();
        if !v.is_reg() {
            return false;
        }
        !v.pseudo
            && v.expired
            && v.refcnt <= 1
            && v.inode().iattr.nlink == crate::types::INIT_NLINK
    }

    /// Drop the fileref; an expired last-link reg gets its data reclaimed
    /// now that the final open reference goes away.
    pub(crate) fn exec_release(&mut self, task: &mut Task) -> Result<()> {
        let frid = task.fref.ok_or(FnxError::BadF)?;
        let ino = self.fref_ino(task)?;
        let vn = self.fetch_reg(ino)?;

        if self.reg_needs_implicit_cleanup(&vn) {
            self.exec_trunc(task, 0)?;
            self.fix_unlinked(Some(&vn))?;
        }
        self.frpool.untie(frid).ok_or(FnxError::BadF)?;
        self.iref_put(ino);
        task.fref = None;

        if vn.borrow().expired {
            self.fix_unlinked(Some(&vn))?;
        }
        Ok(())
    }

    /// Kernel dropped its references; reclaim an expired last-link reg.
    /// Anything else is deliberately a no-op.
    pub(crate) fn exec_forget(&mut self, ino: crate::types::Ino) -> Result<()> {
        let vn = match self.fetch_cached_inode(ino) {
            Err(FnxError::CacheMiss) => return Ok(()),
            other => other?,
        };
        if !vn.borrow().is_reg() {
            return Ok(());
        }
        if self.reg_needs_implicit_cleanup(&vn) {
            self.trunc_data(&vn, 0)?;
        }
        Ok(())
    }

    /// Bind the ghost fileref for a by-path truncate.
    pub(crate) fn reassure_task_fref(&mut self, task: &mut Task, ino: crate::types::Ino) {
        if task.fref.is_none() {
            task.fref = Some(self.frpool.tie_ghost(ino));
        }
    }

    pub(crate) fn fadeaway_task_fref(&mut self, task: &mut Task) {
        if task.fref == Some(crate::fileref::FR_GHOST) {
            task.fref = None;
            self.frpool.drop_ghost();
        }
    }
}
