use log::{debug, info, warn};

use crate::cache::Vcache;
use crate::error::{FnxError, Result};
use crate::fileref::FrPool;
use crate::pendq::Pendq;
use crate::pstor::Pstor;
use crate::task::{Job, Task};
use crate::types::{
    INO_PSROOT, INO_ROOT, Ino, PSROOTNAME, Name, Vaddr, Vtype, inamehash, ino_create, ino_isvalid,
};
use crate::vobj::bkref::BkrefRef;
use crate::vobj::dir::Dir;
use crate::vobj::inode::{TimeFlags, Uctx};
use crate::vobj::superblock::MntFlags;
use crate::vobj::vnode::{Vnode, VnodeKind, VnodeRef};

/// Outbound dispatch hook: replies and slave block I/O leave through here.
pub type DispatchFn = Box<dyn FnMut(Job)>;

/// The virtual processor: single-threaded transactional engine owning the
/// in-memory filesystem tree, the vnode cache, the open-file table, the
/// pending queue and the allocation accounting.
pub struct Vproc {
    /// Super-user context of the mounting process.
    pub uctx: Uctx,
    pub mntf: MntFlags,
    /// Slave-queue length above which mutating ops return `Pend`.
    pub sbkq_pressure: usize,
    pub(crate) cache: Vcache,
    pub(crate) pstor: Box<dyn Pstor>,
    pub(crate) pendq: Pendq,
    pub(crate) frpool: FrPool,
    pub(crate) super_vn: Option<VnodeRef>,
    pub(crate) rootd: Option<VnodeRef>,
    pub(crate) psroot: Option<VnodeRef>,
    dispatch: DispatchFn,
}

impl Vproc {
    pub fn new(pstor: Box<dyn Pstor>, dispatch: DispatchFn) -> Vproc {
        Vproc {
            uctx: Uctx::default(),
            mntf: MntFlags::empty(),
            sbkq_pressure: 100_000,
            cache: Vcache::new(),
            pstor,
            pendq: Pendq::new(),
            frpool: FrPool::new(),
            super_vn: None,
            rootd: None,
            psroot: None,
            dispatch,
        }
    }

    pub(crate) fn super_vn(&self) -> &VnodeRef {
        self.super_vn.as_ref().expect("vproc not mounted")
    }

    pub fn has_open_files(&self) -> bool {
        self.frpool.nused() > 0
    }

    /// Bind the staged volume: stage super and root dir, verify ownership,
    /// stamp the mount state, and pin both plus the pseudo-root.
    pub fn open_namespace(&mut self, uctx: &Uctx, mntf: MntFlags) -> Result<()> {
        let sv = self.fetch_vnode(&Vaddr::for_super())?;
        {
            let mut s = sv.borrow_mut();
            let superb = s.superb_mut();
            if superb.attr.uid != uctx.uid {
                warn!(
                    "vproc: uid-mismatch fs-uid={} uid={}",
                    superb.attr.uid, uctx.uid
                );
                return Err(FnxError::Inval);
            }
            if superb.attr.gid != uctx.gid {
                warn!(
                    "vproc: gid-mismatch fs-gid={} gid={}",
                    superb.attr.gid, uctx.gid
                );
            }
            superb.attr.mntf = mntf;
            superb.uctx = uctx.clone();
            s.pinned = true;
        }

        let rv = self.fetch_vnode(&Vaddr::for_inode(INO_ROOT))?;
        {
            let mut r = rv.borrow_mut();
            r.pinned = true;
            r.inode_mut().setitime(TimeFlags::AMCTIME);
        }

        // The pseudo-root lives only in memory; visible from the root dir
        // under its well-known name.
        let mut psd = Dir::new(INO_PSROOT, uctx, 0o555);
        psd.parentd = INO_ROOT;
        psd.inode.name = Name::new(PSROOTNAME, inamehash(PSROOTNAME, INO_ROOT));
        let ps = Vnode::new_ref(Vaddr::for_inode(INO_PSROOT), VnodeKind::Dir(psd));
        {
            let mut p = ps.borrow_mut();
            p.pseudo = true;
            p.pinned = true;
        }
        self.cache.store(ps.clone());

        self.uctx = uctx.clone();
        self.mntf = mntf;
        self.super_vn = Some(sv);
        self.rootd = Some(rv);
        self.psroot = Some(ps);
        info!("vproc: open-namespace root={INO_ROOT:#x}");
        Ok(())
    }

    /// Commit root and super, sync storage, and drop the pinned pair.
    pub fn close(&mut self) -> Result<()> {
        let (Some(rv), Some(sv)) = (self.rootd.take(), self.super_vn.take()) else {
            return Ok(()); // bootstrap case
        };
        info!("vproc: closing");
        for vn in [&rv, &sv] {
            vn.borrow_mut().pinned = false;
            self.pstor.commit_vnode(vn)?;
        }
        self.pstor.sync()?;
        self.evict_delete_vnode(&rv);
        self.evict_delete_vnode(&sv);
        if let Some(ps) = self.psroot.take() {
            ps.borrow_mut().pinned = false;
            self.evict_delete_vnode(&ps);
        }
        Ok(())
    }

    /// Untie every fileref and drain the whole cache.
    pub fn clear_caches(&mut self) {
        self.frpool.clear();
        self.cache.clear_des();
        while let Some(vn) = self.cache.poplru() {
            debug_assert_eq!(vn.borrow().refcnt, 0);
            self.evict_delete_vnode(&vn);
        }
    }

    // ------------------------------------------------------------------
    // Allocation accounting
    // ------------------------------------------------------------------

    fn account_vtype(&mut self, vtype: Vtype, n: i64) {
        let sv = self.super_vn().clone();
        let mut s = sv.borrow_mut();
        let superb = s.superb_mut();
        superb.stat.account(vtype, n);
        superb.settimes(TimeFlags::MTIME);
    }

    /// Reserve `n` fresh data-block vaddrs off the vlba cursor without
    /// stamping it; fails with `NoSpace` when the candidates run out.
    pub(crate) fn predict_next_vba(&mut self, n: usize) -> Result<Vec<Vaddr>> {
        let mut vlba = {
            let sv = self.super_vn().clone();
            let s = sv.borrow();
            s.superb().stat.next_vlba()?
        };
        let mut out = Vec::with_capacity(n);
        let mut budget = n + 128;
        while budget > 0 && out.len() < n {
            let vba = Vaddr::for_vbk(vlba);
            match self.pstor.require_vaddr(&vba) {
                Ok(()) => out.push(vba),
                Err(FnxError::NoSpace) => {}
                Err(e) => return Err(e),
            }
            vlba += 1;
            budget -= 1;
        }
        if out.len() < n {
            return Err(FnxError::NoSpace);
        }
        Ok(out)
    }

    fn acquire_vba(&mut self) -> Result<Vaddr> {
        let vba = self.predict_next_vba(1)?.remove(0);
        let sv = self.super_vn().clone();
        sv.borrow_mut().superb_mut().stat.stamp_vlba(vba.vlba());
        Ok(vba)
    }

    fn acquire_via(&mut self, vtype: Vtype) -> Result<Vaddr> {
        let mut base = {
            let sv = self.super_vn().clone();
            let s = sv.borrow();
            s.superb().stat.next_ino()?
        };
        let mut budget = 64;
        loop {
            let ino = ino_create(base, vtype);
            let vaddr = Vaddr::for_inode(ino);
            match self.pstor.require_vaddr(&vaddr) {
                Ok(()) => {
                    let sv = self.super_vn().clone();
                    sv.borrow_mut().superb_mut().stat.stamp_ino(base);
                    return Ok(vaddr);
                }
                Err(FnxError::NoSpace) if budget > 0 => {
                    base += 1;
                    budget -= 1;
                }
                Err(FnxError::NoSpace) => return Err(FnxError::NoSpace),
                Err(e) => return Err(e),
            }
        }
    }

    /// Reserve an address for a new object and account it against the super.
    pub(crate) fn acquire_vaddr(&mut self, vtype: Vtype, ino: Ino, xno: u64) -> Result<Vaddr> {
        let vaddr = if vtype == Vtype::Vbk {
            self.acquire_vba()?
        } else if vtype.is_itype() {
            self.acquire_via(vtype)?
        } else {
            let vaddr = Vaddr::new(vtype, ino, xno);
            self.pstor.require_vaddr(&vaddr)?;
            vaddr
        };
        self.account_vtype(vtype, 1);
        Ok(vaddr)
    }

    pub(crate) fn forget_vaddr(&mut self, vaddr: &Vaddr) {
        debug_assert!(!vaddr.is_null());
        self.account_vtype(vaddr.vtype, -1);
    }

    pub(crate) fn forget_vnode(&mut self, vnode: &VnodeRef) {
        let (forgot, vaddr) = {
            let v = vnode.borrow();
            (v.forgot, v.vaddr)
        };
        if !forgot {
            self.forget_vaddr(&vaddr);
            vnode.borrow_mut().forgot = true;
        }
    }

    // ------------------------------------------------------------------
    // Fetch: cache hit or storage stage
    // ------------------------------------------------------------------

    fn lookup_cached_vnode(&mut self, vaddr: &Vaddr) -> Result<VnodeRef> {
        self.cache.lookup(vaddr).ok_or(FnxError::CacheMiss)
    }

    pub(crate) fn fetch_vnode(&mut self, vaddr: &Vaddr) -> Result<VnodeRef> {
        match self.lookup_cached_vnode(vaddr) {
            Err(FnxError::CacheMiss) => {}
            other => return other,
        }
        let vn = self.pstor.stage_vnode(vaddr)?;
        self.cache.store(vn.clone());
        Ok(vn)
    }

    pub(crate) fn fetch_cached_inode(&mut self, ino: Ino) -> Result<VnodeRef> {
        self.lookup_cached_vnode(&Vaddr::for_inode(ino))
    }

    /// Fetch an inode by number; a reflnk additionally wants its target
    /// resident so link accounting can follow `refino` without blocking.
    pub(crate) fn fetch_inode(&mut self, ino: Ino) -> Result<VnodeRef> {
        if !ino_isvalid(ino) {
            return Err(FnxError::Inval);
        }
        let vn = self.fetch_vnode(&Vaddr::for_inode(ino))?;
        let refino = {
            let v = vn.borrow();
            if v.is_reflnk() { v.inode().refino } else { 0 }
        };
        if refino != 0 {
            if !ino_isvalid(refino) {
                return Err(FnxError::Inval);
            }
            self.fetch_vnode(&Vaddr::for_inode(refino))?;
        }
        Ok(vn)
    }

    pub(crate) fn fetch_dir(&mut self, ino: Ino) -> Result<VnodeRef> {
        let vn = self.fetch_inode(ino)?;
        if !vn.borrow().is_dir() {
            return Err(FnxError::NotDir);
        }
        Ok(vn)
    }

    pub(crate) fn fetch_reg(&mut self, ino: Ino) -> Result<VnodeRef> {
        let vn = self.fetch_inode(ino)?;
        {
            let v = vn.borrow();
            if v.is_dir() {
                return Err(FnxError::IsDir);
            }
            if v.is_special() {
                let mode = v.inode().iattr.mode;
                if (mode & libc::S_IFMT) == libc::S_IFIFO {
                    return Err(FnxError::SPipe);
                }
            }
            if !v.is_reg() {
                return Err(FnxError::Inval);
            }
        }
        Ok(vn)
    }

    pub(crate) fn fetch_symlnk(&mut self, ino: Ino) -> Result<VnodeRef> {
        let vn = self.fetch_inode(ino)?;
        if !vn.borrow().is_symlnk() {
            return Err(FnxError::Inval);
        }
        Ok(vn)
    }

    // ------------------------------------------------------------------
    // Acquire: allocate + spawn + cache
    // ------------------------------------------------------------------

    /// Spawn a new vnode at a caller-chosen address (dirseg, regsec,
    /// regseg).
    pub(crate) fn acquire_vvnode(&mut self, vaddr: &Vaddr) -> Result<VnodeRef> {
        let va = self.acquire_vaddr(vaddr.vtype, vaddr.ino, vaddr.xno)?;
        debug_assert_eq!(va, *vaddr);
        let vn = match self.pstor.spawn_vnode(&va, None) {
            Ok(vn) => vn,
            Err(e) => {
                self.forget_vaddr(&va);
                return Err(e);
            }
        };
        self.cache.store(vn.clone());
        self.put_vnode(&vn);
        Ok(vn)
    }

    /// Spawn a new data block adopting the caller's bytes.
    pub(crate) fn acquire_vbk(&mut self, bkref: BkrefRef) -> Result<VnodeRef> {
        let va = self.acquire_vaddr(Vtype::Vbk, 0, 0)?;
        let vn = match self.pstor.spawn_vnode(&va, Some(bkref)) {
            Ok(vn) => vn,
            Err(e) => {
                self.forget_vaddr(&va);
                return Err(e);
            }
        };
        self.cache.store(vn.clone());
        self.put_vnode(&vn);
        Ok(vn)
    }

    /// Spawn a new inode of the given type; the caller shapes its payload.
    pub(crate) fn acquire_inode(&mut self, vtype: Vtype) -> Result<VnodeRef> {
        let va = self.acquire_vaddr(vtype, 0, 0)?;
        let vn = match self.pstor.spawn_vnode(&va, None) {
            Ok(vn) => vn,
            Err(e) => {
                self.forget_vaddr(&va);
                return Err(e);
            }
        };
        self.cache.store(vn.clone());
        self.put_vnode(&vn);
        Ok(vn)
    }

    pub(crate) fn acquire_dir(&mut self, uctx: &Uctx, mode: u32) -> Result<VnodeRef> {
        let vn = self.acquire_inode(Vtype::Dir)?;
        {
            let mut v = vn.borrow_mut();
            let ino = v.vaddr.ino;
            *v.dir_mut() = Dir::new(ino, uctx, mode);
        }
        Ok(vn)
    }

    pub(crate) fn acquire_reg(&mut self, uctx: &Uctx, mode: u32) -> Result<VnodeRef> {
        let vn = self.acquire_inode(Vtype::Reg)?;
        {
            let mut v = vn.borrow_mut();
            let ino = v.vaddr.ino;
            *v.reg_mut() = crate::vobj::reg::Reg::new(ino, uctx, mode);
        }
        Ok(vn)
    }

    pub(crate) fn acquire_symlnk(&mut self, uctx: &Uctx, path: &str) -> Result<VnodeRef> {
        let vn = self.acquire_inode(Vtype::Symlnk)?;
        {
            let mut v = vn.borrow_mut();
            let ino = v.vaddr.ino;
            match &mut v.kind {
                VnodeKind::Symlnk(s) => *s = crate::vobj::reg::Symlnk::new(ino, uctx, path),
                _ => panic!("acquire_symlnk spawned a non-symlnk"),
            }
        }
        Ok(vn)
    }

    pub(crate) fn acquire_special(&mut self, uctx: &Uctx, mode: u32, rdev: u64) -> Result<VnodeRef> {
        let vn = self.acquire_inode(Vtype::Special)?;
        {
            let mut v = vn.borrow_mut();
            let ino = v.vaddr.ino;
            match &mut v.kind {
                VnodeKind::Special(i) => *i = crate::vobj::inode::Inode::setup(ino, uctx, mode, rdev),
                _ => panic!("acquire_special spawned a non-special"),
            }
        }
        Ok(vn)
    }

    pub(crate) fn acquire_reflnk(&mut self, uctx: &Uctx, refino: Ino) -> Result<VnodeRef> {
        let vn = self.acquire_inode(Vtype::Reflnk)?;
        {
            let mut v = vn.borrow_mut();
            let ino = v.vaddr.ino;
            match &mut v.kind {
                VnodeKind::Reflnk(i) => {
                    *i = crate::vobj::inode::Inode::setup(ino, uctx, 0, 0);
                    i.refino = refino;
                }
                _ => panic!("acquire_reflnk spawned a non-reflnk"),
            }
        }
        Ok(vn)
    }

    // ------------------------------------------------------------------
    // Retire / evict
    // ------------------------------------------------------------------

    pub(crate) fn evict_delete_vnode(&mut self, vnode: &VnodeRef) {
        let (refcnt, cached, vaddr) = {
            let v = vnode.borrow();
            (v.refcnt, v.cached, v.vaddr)
        };
        if refcnt == 0 {
            debug_assert_ne!(vaddr.vtype, Vtype::None);
            if cached {
                self.cache.evict(&vaddr);
            }
            self.pendq.unstage(vnode);
            self.pstor.retire_vnode(vnode.clone());
        }
    }

    /// Release a dead vnode: unmap its storage slot, give back its
    /// accounting, and drop it from the cache.
    pub(crate) fn retire_vnode(&mut self, vnode: &VnodeRef) {
        let (placed, refcnt, vaddr) = {
            let v = vnode.borrow();
            (v.placed, v.refcnt, v.vaddr)
        };
        debug_assert_ne!(vaddr.vtype, Vtype::Spmap);
        debug_assert!(!vaddr.is_null());

        if placed {
            self.pstor
                .unmap_vnode(vnode)
                .expect("unmap of placed vnode failed");
        }
        if refcnt == 0 {
            self.forget_vnode(vnode);
            self.evict_delete_vnode(vnode);
        }
    }

    /// Stage a dirtied vnode for the post-op commit drain. The super is
    /// committed only on close/sync; pseudo vnodes never go to storage.
    pub(crate) fn put_vnode(&mut self, vnode: &VnodeRef) {
        let (vtype, pseudo) = {
            let v = vnode.borrow();
            debug_assert!(v.is_mutable() || !v.cached);
            (v.vtype(), v.pseudo)
        };
        if vtype != Vtype::Super && !pseudo {
            self.pendq.stage(vnode);
        }
    }

    /// LRU eviction sweep; stops at the first non-evictable vnode.
    pub fn squeeze(&mut self, mut cnt: usize) {
        while cnt > 0 {
            cnt -= 1;
            let Some(vn) = self.cache.poplru() else {
                break;
            };
            let evictable = {
                let v = vn.borrow();
                v.refcnt == 0 && !v.pseudo && !v.pinned && v.is_mutable()
            };
            if !evictable {
                self.cache.store(vn);
                break;
            }
            debug!("vproc: squeeze {:?}", vn.borrow().vaddr);
            self.evict_delete_vnode(&vn);
        }
    }

    // ------------------------------------------------------------------
    // Job loop
    // ------------------------------------------------------------------

    /// Feed one inbound job through the engine.
    pub fn exec_job(&mut self, job: Job) {
        match job {
            Job::TaskExecReq(task) => self.exec_task(task),
            Job::TaskFiniReq(task) => self.fini_task(task),
            Job::BkReadRes(bk) | Job::BkWriteRes(bk) | Job::BkSyncRes(bk) => {
                self.post_recv_asio(&bk);
            }
            other => panic!("illegal vproc job: {other:?}"),
        }
    }

    fn exec_task(&mut self, mut task: Task) {
        let rc = self.execute_vop(&mut task);
        match rc {
            Err(e) if e.is_deferred() => {
                task.status = Err(e);
                self.pend_task(task);
            }
            _ => {
                task.status = rc;
                self.reply_task(task, false);
            }
        }
    }

    fn fini_task(&mut self, mut task: Task) {
        self.relax_iobufs(&mut task);
        task.status = Ok(());
        self.reply_task(task, true);
    }

    fn execute_vop(&mut self, task: &mut Task) -> Result<()> {
        task.status = Ok(());
        task.runcnt += 1;

        let oper_rc = crate::opers::dispatch_op(self, task);
        let post_rc = self.post_vop();
        self.slave_vop();

        if oper_rc.is_ok() {
            let sv = self.super_vn().clone();
            sv.borrow_mut().superb_mut().oper.count(task.opcode);
        }
        oper_rc.and(post_rc)
    }

    fn pop_modv(&mut self) -> Option<VnodeRef> {
        self.pendq.sfront().or_else(|| self.pstor.pop_staged())
    }

    /// Post-op commit drain: every vnode dirtied by the operation goes to
    /// the storage commit path, expired ones are retired instead.
    fn post_vop(&mut self) -> Result<()> {
        let mut delayed = false;
        while let Some(vn) = self.pop_modv() {
            if vn.borrow().expired {
                self.retire_vnode(&vn);
                continue;
            }
            match self.pstor.commit_vnode(&vn) {
                Ok(()) => {}
                Err(FnxError::Delay) => delayed = true,
                Err(e) => panic!("commit failed: {e}"),
            }
        }
        if delayed { Err(FnxError::Delay) } else { Ok(()) }
    }

    pub(crate) fn prep_send_asio(&mut self, bkref: &BkrefRef) {
        let mut b = bkref.borrow_mut();
        b.slaved = true;
        b.refcnt += 1;
    }

    /// Emit storage-produced block I/O as outbound jobs.
    fn slave_vop(&mut self) {
        while let Some(bk) = self.pstor.pop_sbk() {
            self.prep_send_asio(&bk);
            (self.dispatch)(Job::BkWriteReq(bk));
        }
    }

    /// A slaved block I/O completed; release the slave reference.
    pub(crate) fn post_recv_asio(&mut self, bkref: &BkrefRef) {
        let retire = {
            let mut b = bkref.borrow_mut();
            debug_assert!(b.slaved);
            debug_assert!(b.refcnt > 0);
            b.slaved = false;
            b.refcnt -= 1;
            !b.cached && b.refcnt == 0
        };
        if retire {
            self.pstor.retire_bk(bkref.clone());
        }
    }

    fn reply_task(&mut self, task: Task, fini: bool) {
        let job = if fini {
            Job::TaskFiniRes(task)
        } else {
            Job::TaskExecRes(task)
        };
        (self.dispatch)(job);
    }

    pub(crate) fn pend_task(&mut self, task: Task) {
        self.pendq.pend(task);
    }

    /// Re-attempt every pended task: `Pend` tasks re-run, `Delay` tasks are
    /// replied now that the commit stream settled.
    pub fn exec_pendq(&mut self) {
        let limit = self.pendq.pended_len();
        for _ in 0..limit {
            let Some(mut task) = self.pendq.pfront() else {
                break;
            };
            match task.status {
                Err(FnxError::Pend) => self.exec_task(task),
                Err(FnxError::Delay) => {
                    task.status = Ok(());
                    self.reply_task(task, false);
                }
                _ => panic!("non-deferred task on pendq"),
            }
        }
    }

    pub(crate) fn relax_iobufs(&mut self, task: &mut Task) {
        for bk in task.iobufs.relax() {
            self.pstor.retire_bk(bk);
        }
    }

    /// Take an open reference on a resident inode for a fileref binding.
    pub(crate) fn iref_get(&mut self, ino: Ino) {
        if let Ok(vn) = self.fetch_cached_inode(ino) {
            vn.borrow_mut().refcnt += 1;
        }
    }

    pub(crate) fn iref_put(&mut self, ino: Ino) {
        if let Ok(vn) = self.fetch_cached_inode(ino) {
            let mut v = vn.borrow_mut();
            debug_assert!(v.refcnt > 0);
            v.refcnt -= 1;
        }
    }
}
