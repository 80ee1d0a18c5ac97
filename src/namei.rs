use log::warn;

use crate::error::{FnxError, Result};
use crate::types::{
    DOFF_BEGINS, DOFF_END, DOFF_NONE, DOFF_PARENT, DOFF_SELF, DOFF_TOP, Doff, Hash, INO_NULL,
    INO_PSROOT, Name, PSROOTNAME, Vaddr, doff_isvalid, doff_to_dseg, dseg_to_doff, hash_to_dseg,
    inamehash,
};
use crate::vobj::dir::Dirent;
use crate::vobj::inode::{Itimes, SetAttrFlags, TimeFlags, Uctx};
use crate::vobj::vnode::VnodeRef;
use crate::vproc::Vproc;

impl Vproc {
    pub(crate) fn require_mutable(&self, vnode: &VnodeRef) -> Result<()> {
        if vnode.borrow().is_mutable() {
            Ok(())
        } else {
            Err(FnxError::Pend)
        }
    }

    /// Name hash within a directory; seeded with the dir ino.
    pub(crate) fn nhash_of(&self, dirvn: &VnodeRef, name: &str) -> Hash {
        inamehash(name, dirvn.borrow().inode().ino())
    }

    /// The ref target of a reflnk, resident; `None` for plain inodes.
    pub(crate) fn fetch_iref(&mut self, vnode: &VnodeRef) -> Result<Option<VnodeRef>> {
        let refino = {
            let v = vnode.borrow();
            if v.is_reflnk() { v.inode().refino } else { INO_NULL }
        };
        if refino == INO_NULL {
            return Ok(None);
        }
        self.fetch_inode(refino).map(Some)
    }

    // ------------------------------------------------------------------
    // Lookup chain
    // ------------------------------------------------------------------

    fn lookup_special(&mut self, dirvn: &VnodeRef, name: &str) -> Result<VnodeRef> {
        // Case 1: pseudo-namespace root, visible only from the root dir.
        let (isroot, meta) = {
            let v = dirvn.borrow();
            let d = v.dir();
            (d.is_root(), d.meta(name))
        };
        if isroot && name == PSROOTNAME {
            let vn = self.fetch_inode(INO_PSROOT)?;
            if vn.borrow().inode().has_name(name) {
                return Ok(vn);
            }
        }
        // Case 2: dot and dot-dot.
        match meta {
            Some(ino) => self.fetch_inode(ino),
            None => Err(FnxError::NoEnt),
        }
    }

    fn lookup_cached_de(&mut self, dirvn: &VnodeRef, name: &str, nhash: Hash) -> Result<VnodeRef> {
        let dino = dirvn.borrow().inode().ino();
        let ino = self.cache.lookup_de(dino, nhash, name.len());
        if ino == INO_NULL {
            return Err(FnxError::NoEnt);
        }
        let vn = self.fetch_inode(ino)?;
        if !vn.borrow().inode().has_name(name) {
            return Err(FnxError::NoEnt); // stale hint
        }
        Ok(vn)
    }

    fn lookup_dirent(&mut self, dirvn: &VnodeRef, name: &str, nhash: Hash) -> Result<Dirent> {
        // Top-of-dir first.
        if let Some(de) = dirvn.borrow().dir().lookup(nhash, name.len()) {
            return Ok(*de);
        }
        // Then the hashed segment.
        let dsvn = self.fetch_hdirseg(dirvn, nhash)?;
        let v = dsvn.borrow();
        v.dirseg()
            .lookup(nhash, name.len())
            .copied()
            .ok_or(FnxError::NoEnt)
    }

    fn dirent_to_inode(&mut self, de: &Dirent, name: &str) -> Result<VnodeRef> {
        let vn = self.fetch_inode(de.ino)?;
        if !vn.borrow().inode().has_name(name) {
            return Err(FnxError::NoEnt);
        }
        Ok(vn)
    }

    /// Resolve `(dir, name)` to the link itself (a reflnk stays a reflnk).
    pub(crate) fn lookup_iinode(&mut self, dirvn: &VnodeRef, name: &str) -> Result<VnodeRef> {
        match self.lookup_special(dirvn, name) {
            Ok(vn) => return Ok(vn),
            Err(FnxError::NoEnt) => {}
            Err(e) if e == FnxError::Pend => return Err(e),
            Err(_) => {}
        }
        let nhash = self.nhash_of(dirvn, name);
        if let Ok(vn) = self.lookup_cached_de(dirvn, name, nhash) {
            return Ok(vn);
        }
        let de = self.lookup_dirent(dirvn, name, nhash)?;
        self.dirent_to_inode(&de, name)
    }

    /// Optional lookup: absence is not an error.
    pub(crate) fn lookup_ientry(
        &mut self,
        dirvn: &VnodeRef,
        name: &str,
    ) -> Result<Option<VnodeRef>> {
        match self.lookup_iinode(dirvn, name) {
            Ok(vn) => Ok(Some(vn)),
            Err(FnxError::NoEnt) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// User-facing lookup: follows a reflnk once to its target.
    pub(crate) fn lookup_inode(&mut self, dirvn: &VnodeRef, name: &str) -> Result<VnodeRef> {
        let vn = self.lookup_iinode(dirvn, name)?;
        let refino = {
            let v = vn.borrow();
            if v.is_reflnk() { v.inode().refino } else { INO_NULL }
        };
        if refino != INO_NULL {
            return self.fetch_inode(refino);
        }
        Ok(vn)
    }

    /// Link-accounting lookup: the link itself, never a directory.
    pub(crate) fn lookup_link(&mut self, dirvn: &VnodeRef, name: &str) -> Result<VnodeRef> {
        let vn = self.lookup_iinode(dirvn, name)?;
        if vn.borrow().is_dir() {
            return Err(FnxError::IsDir);
        }
        Ok(vn)
    }

    pub(crate) fn lookup_dir(&mut self, dirvn: &VnodeRef, name: &str) -> Result<VnodeRef> {
        let vn = self.lookup_inode(dirvn, name)?;
        if !vn.borrow().is_dir() {
            return Err(FnxError::NotDir);
        }
        Ok(vn)
    }

    // ------------------------------------------------------------------
    // Readdir enumeration
    // ------------------------------------------------------------------

    fn search_dirtop(&mut self, dirvn: &VnodeRef, doff: Doff) -> Result<(Dirent, Doff)> {
        if !(DOFF_SELF..DOFF_BEGINS).contains(&doff) {
            return Err(FnxError::Eos);
        }
        let v = dirvn.borrow();
        match v.dir().search(doff) {
            Some((de, at)) => Ok((de, at + 1)),
            None => Err(FnxError::Eos),
        }
    }

    fn search_dirsegs(&mut self, dirvn: &VnodeRef, doff: Doff) -> Result<(Dirent, Doff)> {
        if doff >= DOFF_END {
            return Err(FnxError::Eos);
        }
        if dirvn.borrow().dir().nsegs == 0 {
            return Err(FnxError::Eos);
        }
        let mut doff = doff.max(DOFF_BEGINS);
        let mut dseg = doff_to_dseg(doff);
        let mut first = true;
        loop {
            if !first {
                doff = dseg_to_doff(dseg);
            }
            if dirvn.borrow().dir().hasseg(dseg) {
                let dsvn = self.fetch_dirseg(dirvn, dseg)?;
                let found = dsvn.borrow().dirseg().search(doff);
                if let Some((de, at)) = found {
                    return Ok((de, at + 1));
                }
            }
            match dirvn.borrow().dir().nextseg(dseg + 1) {
                Some(next) => dseg = next,
                None => return Err(FnxError::Eos),
            }
            first = false;
        }
    }

    fn search_normal(
        &mut self,
        dirvn: &VnodeRef,
        doff: Doff,
    ) -> Result<(String, VnodeRef, Doff)> {
        if doff == DOFF_SELF {
            return Ok((".".to_string(), dirvn.clone(), DOFF_PARENT));
        }
        if doff == DOFF_PARENT {
            let parent = {
                let v = dirvn.borrow();
                let d = v.dir();
                if d.is_root() { d.ino() } else { d.parentd }
            };
            let pvn = self.fetch_dir(parent)?;
            return Ok(("..".to_string(), pvn, DOFF_TOP));
        }

        let (de, next) = match self.search_dirtop(dirvn, doff) {
            Ok(hit) => hit,
            Err(FnxError::Eos) => self.search_dirsegs(dirvn, doff)?,
            Err(e) => return Err(e),
        };

        // Resolve the entry, following a hard-link once for the child view;
        // the yielded name is the link's own binding.
        let hlnk = self.fetch_inode(de.ino)?;
        let name = hlnk.borrow().inode().name.s.clone();
        let refino = {
            let v = hlnk.borrow();
            if v.is_reflnk() { v.inode().refino } else { INO_NULL }
        };
        let child = if refino != INO_NULL {
            self.fetch_inode(refino)?
        } else {
            hlnk
        };
        Ok((name, child, next))
    }

    /// Yield one directory entry at `doff`: `(name, child, next_doff)`.
    /// On the root dir, the pseudo-root trails the normal tree.
    pub(crate) fn search_dent(
        &mut self,
        dirvn: &VnodeRef,
        doff: Doff,
    ) -> Result<(String, VnodeRef, Doff)> {
        if !doff_isvalid(doff) {
            return Err(FnxError::Eos);
        }
        match self.search_normal(dirvn, doff) {
            Err(FnxError::Eos) => {
                if dirvn.borrow().dir().is_root() {
                    let ps = self.fetch_inode(INO_PSROOT)?;
                    return Ok((PSROOTNAME.to_string(), ps, DOFF_NONE));
                }
                Err(FnxError::Eos)
            }
            other => other,
        }
    }

    // ------------------------------------------------------------------
    // Dirseg plumbing
    // ------------------------------------------------------------------

    fn acquire_dirseg(&mut self, dirvn: &VnodeRef, dseg: usize) -> Result<VnodeRef> {
        let dino = dirvn.borrow().inode().ino();
        self.acquire_vvnode(&Vaddr::for_dirseg(dino, dseg))
    }

    pub(crate) fn fetch_dirseg(&mut self, dirvn: &VnodeRef, dseg: usize) -> Result<VnodeRef> {
        if !dirvn.borrow().dir().hasseg(dseg) {
            return Err(FnxError::NoEnt);
        }
        let dino = dirvn.borrow().inode().ino();
        self.fetch_vnode(&Vaddr::for_dirseg(dino, dseg))
    }

    fn fetch_hdirseg(&mut self, dirvn: &VnodeRef, nhash: Hash) -> Result<VnodeRef> {
        self.fetch_dirseg(dirvn, hash_to_dseg(nhash))
    }

    fn fetch_idirseg(&mut self, dirvn: &VnodeRef, inode_vn: &VnodeRef) -> Result<VnodeRef> {
        let nhash = inode_vn.borrow().inode().name.hash;
        debug_assert_ne!(nhash, 0);
        self.fetch_hdirseg(dirvn, nhash)
    }

    /// The dirseg owning `nhash`, created on demand.
    fn yield_dirseg(&mut self, dirvn: &VnodeRef, nhash: Hash) -> Result<VnodeRef> {
        let dseg = hash_to_dseg(nhash);
        if dirvn.borrow().dir().hasseg(dseg) {
            let dsvn = self.fetch_dirseg(dirvn, dseg)?;
            self.require_mutable(&dsvn)?;
            Ok(dsvn)
        } else {
            self.require_mutable(dirvn)?;
            let dsvn = self.acquire_dirseg(dirvn, dseg)?;
            dirvn.borrow_mut().dir_mut().setseg(dseg);
            self.put_vnode(dirvn);
            Ok(dsvn)
        }
    }

    // ------------------------------------------------------------------
    // Dentry-cache association
    // ------------------------------------------------------------------

    fn associate_link(&mut self, dirvn: &VnodeRef, name: &str, nhash: Hash, child: &VnodeRef) {
        let dino = dirvn.borrow().inode().ino();
        let ino = {
            let mut c = child.borrow_mut();
            let inode = c.inode_mut();
            inode.name = Name::new(name, nhash);
            inode.refino_or_self()
        };
        self.cache.remap_de(dino, nhash, name.len(), ino);
    }

    fn dissociate_link(&mut self, dirvn: &VnodeRef, child: &VnodeRef) {
        let dino = dirvn.borrow().inode().ino();
        let (hash, nlen) = {
            let c = child.borrow();
            (c.inode().name.hash, c.inode().name.len())
        };
        self.cache.remap_de(dino, hash, nlen, INO_NULL);
        child.borrow_mut().inode_mut().name = Name::default();
    }

    fn settle_linked(&mut self, dirvn: &VnodeRef, dsvn: Option<&VnodeRef>) {
        let Some(dsvn) = dsvn else { return };
        if dsvn.borrow().dirseg().is_empty() {
            return;
        }
        let index = dsvn.borrow().dirseg().index;
        dirvn.borrow_mut().dir_mut().setseg(index);
        dsvn.borrow_mut().expired = false;
        self.put_vnode(dsvn);
        self.put_vnode(dirvn);
    }

    fn settle_unlinked(&mut self, dirvn: &VnodeRef, dsvn: Option<&VnodeRef>) {
        let Some(dsvn) = dsvn else { return };
        if !dsvn.borrow().dirseg().is_empty() {
            return;
        }
        let index = dsvn.borrow().dirseg().index;
        dirvn.borrow_mut().dir_mut().unsetseg(index);
        dsvn.borrow_mut().expired = true;
        self.put_vnode(dsvn);
        self.put_vnode(dirvn);
    }

    fn update_linked(&mut self, dirvn: &VnodeRef, child: &VnodeRef, iref: Option<&VnodeRef>) {
        let child_isdir = child.borrow().is_dir();
        let child_isref = child.borrow().is_reflnk();
        let dino = dirvn.borrow().inode().ino();

        if child_isdir {
            {
                let mut c = child.borrow_mut();
                let childd = c.dir_mut();
                childd.parentd = dino;
                childd.inode.iattr.nlink += 1;
                childd.inode.setitime(TimeFlags::AMCTIME);
            }
            let mut d = dirvn.borrow_mut();
            let dir = d.dir_mut();
            dir.nchilds += 1;
            dir.inode.iattr.nlink += 1;
            dir.inode.setitime(TimeFlags::AMCTIME);
        } else if child_isref {
            let iref = iref.expect("reflnk without target");
            {
                let mut t = iref.borrow_mut();
                t.inode_mut().iattr.nlink += 1;
                t.inode_mut().setitime(TimeFlags::MCTIME);
            }
            child.borrow_mut().inode_mut().setitime(TimeFlags::MCTIME);
            let mut d = dirvn.borrow_mut();
            d.dir_mut().nchilds += 1;
            d.inode_mut().setitime(TimeFlags::MCTIME);
        } else {
            debug_assert!(iref.is_none());
            {
                let mut c = child.borrow_mut();
                c.inode_mut().iattr.nlink += 1;
                c.inode_mut().setitime(TimeFlags::AMCTIME);
            }
            let mut d = dirvn.borrow_mut();
            d.dir_mut().nchilds += 1;
            d.inode_mut().setitime(TimeFlags::MCTIME);
        }
    }

    fn update_unlinked(&mut self, dirvn: &VnodeRef, child: &VnodeRef, iref: Option<&VnodeRef>) {
        let child_isdir = child.borrow().is_dir();
        let child_isref = child.borrow().is_reflnk();

        if child_isdir {
            {
                let mut c = child.borrow_mut();
                let childd = c.dir_mut();
                debug_assert!(childd.inode.iattr.nlink > 0);
                childd.parentd = INO_NULL;
                childd.inode.iattr.nlink -= 1;
                childd.inode.setitime(TimeFlags::CTIME);
            }
            let mut d = dirvn.borrow_mut();
            let dir = d.dir_mut();
            debug_assert!(dir.nchilds > 0 && dir.inode.iattr.nlink > 0);
            dir.nchilds -= 1;
            dir.inode.iattr.nlink -= 1;
            dir.inode.setitime(TimeFlags::MCTIME);
        } else if child_isref {
            let iref = iref.expect("reflnk without target");
            {
                let mut t = iref.borrow_mut();
                debug_assert!(t.inode().iattr.nlink > 0);
                t.inode_mut().iattr.nlink -= 1;
                t.inode_mut().setitime(TimeFlags::CTIME);
            }
            let mut d = dirvn.borrow_mut();
            debug_assert!(d.dir().nchilds > 0);
            d.dir_mut().nchilds -= 1;
            d.inode_mut().setitime(TimeFlags::MCTIME);
        } else {
            debug_assert!(iref.is_none());
            {
                let mut c = child.borrow_mut();
                debug_assert!(c.inode().iattr.nlink > 0);
                c.inode_mut().iattr.nlink -= 1;
                c.inode_mut().setitime(TimeFlags::CTIME);
            }
            let mut d = dirvn.borrow_mut();
            debug_assert!(d.dir().nchilds > 0);
            d.dir_mut().nchilds -= 1;
            d.inode_mut().setitime(TimeFlags::MCTIME);
        }
    }

    fn put_link_parties(
        &mut self,
        dirvn: &VnodeRef,
        child: &VnodeRef,
        iref: Option<&VnodeRef>,
        dsvn: Option<&VnodeRef>,
        newdsvn: Option<&VnodeRef>,
    ) {
        if let Some(vn) = newdsvn {
            self.put_vnode(vn);
        }
        if let Some(vn) = dsvn {
            self.put_vnode(vn);
        }
        if let Some(vn) = iref {
            self.put_vnode(vn);
        }
        self.put_vnode(child);
        self.put_vnode(dirvn);
    }

    // ------------------------------------------------------------------
    // Link
    // ------------------------------------------------------------------

    /// Establish that a link of `name` can be committed without blocking:
    /// a dir-top slot, or a mutable (possibly fresh) dirseg with room.
    pub(crate) fn prep_link(&mut self, dirvn: &VnodeRef, name: &str) -> Result<()> {
        self.require_mutable(dirvn)?;
        let nhash = self.nhash_of(dirvn, name);
        if dirvn.borrow().dir().predict(nhash).is_some() {
            return Ok(());
        }
        let dsvn = self.yield_dirseg(dirvn, nhash)?;
        if dsvn.borrow().dirseg().predict(nhash).is_none() {
            return Err(FnxError::NoSpace);
        }
        self.require_mutable(&dsvn)?;
        Ok(())
    }

    /// Bind `child` under `name`; the namespace accounting and dentry cache
    /// follow in the same transaction.
    pub(crate) fn link_child(
        &mut self,
        dirvn: &VnodeRef,
        child: &VnodeRef,
        name: &str,
    ) -> Result<()> {
        let nhash = self.nhash_of(dirvn, name);
        let iref = self.fetch_iref(child)?;
        let child_ino = child.borrow().inode().ino();
        let de = Dirent::new(nhash, name.len(), child_ino);

        let mut dsvn = None;
        if dirvn.borrow().dir().predict(nhash).is_some() {
            self.associate_link(dirvn, name, nhash, child);
            dirvn.borrow_mut().dir_mut().link(de);
        } else {
            let ds = self.yield_dirseg(dirvn, nhash)?;
            if !ds.borrow_mut().dirseg_mut().link(de) {
                return Err(FnxError::NoSpace);
            }
            self.associate_link(dirvn, name, nhash, child);
            dsvn = Some(ds);
        }

        self.update_linked(dirvn, child, iref.as_ref());
        self.settle_linked(dirvn, dsvn.as_ref());
        self.put_link_parties(dirvn, child, iref.as_ref(), dsvn.as_ref(), None);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Unlink
    // ------------------------------------------------------------------

    pub(crate) fn prep_unlink(&mut self, dirvn: &VnodeRef, child: &VnodeRef) -> Result<()> {
        self.require_mutable(dirvn)?;
        let at_top = {
            let d = dirvn.borrow();
            let c = child.borrow();
            d.dir().ilookup(c.inode()).is_some()
        };
        if at_top {
            return Ok(());
        }
        let dsvn = self.fetch_idirseg(dirvn, child)?;
        {
            let ds = dsvn.borrow();
            let c = child.borrow();
            if ds.dirseg().ilookup(c.inode()).is_none() {
                panic!("broken namespace: child lost between prep and commit");
            }
        }
        self.require_mutable(&dsvn)?;
        Ok(())
    }

    fn unlink_reg_data(&mut self, regvn: &VnodeRef) -> Result<()> {
        let (refcnt, nlink) = {
            let v = regvn.borrow();
            (v.refcnt, v.inode().iattr.nlink)
        };
        if refcnt > 0 {
            return Ok(());
        }
        // Only when this unlink drops the very last namespace binding.
        if nlink != crate::types::INIT_NLINK + 1 {
            return Ok(());
        }
        self.trunc_data(regvn, 0)
    }

    fn trunc_upon_unlink(&mut self, child: &VnodeRef) -> Result<()> {
        let iref = self.fetch_iref(child)?;
        if let Some(target) = iref {
            if target.borrow().is_reg() {
                self.unlink_reg_data(&target)?;
            }
        } else if child.borrow().is_reg() {
            self.unlink_reg_data(child)?;
        }
        Ok(())
    }

    /// Unlink prep with the implicit data truncation of a last-link reg.
    pub(crate) fn prep_xunlink(&mut self, dirvn: &VnodeRef, child: &VnodeRef) -> Result<()> {
        self.trunc_upon_unlink(child)?;
        self.prep_unlink(dirvn, child)
    }

    pub(crate) fn unlink_child(&mut self, dirvn: &VnodeRef, child: &VnodeRef) -> Result<()> {
        let iref = self.fetch_iref(child)?;

        let unlinked_top = {
            let mut d = dirvn.borrow_mut();
            let c = child.borrow();
            d.dir_mut().unlink(c.inode()).is_some()
        };
        let mut dsvn = None;
        if !unlinked_top {
            let ds = self.fetch_idirseg(dirvn, child)?;
            let gone = {
                let mut dsb = ds.borrow_mut();
                let c = child.borrow();
                dsb.dirseg_mut().unlink(c.inode()).is_some()
            };
            if !gone {
                panic!("broken namespace: child lost between prep and commit");
            }
            dsvn = Some(ds);
        }

        self.dissociate_link(dirvn, child);
        self.update_unlinked(dirvn, child, iref.as_ref());
        self.settle_unlinked(dirvn, dsvn.as_ref());
        self.put_link_parties(dirvn, child, iref.as_ref(), dsvn.as_ref(), None);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Rename bindings
    // ------------------------------------------------------------------

    /// Establish that a same-dir rebind can commit: the old entry is
    /// locatable and the new name has (or can get) a slot.
    pub(crate) fn prep_rename(
        &mut self,
        dirvn: &VnodeRef,
        child: &VnodeRef,
        newname: &str,
    ) -> Result<()> {
        self.require_mutable(dirvn)?;
        let at_top = {
            let d = dirvn.borrow();
            let c = child.borrow();
            d.dir().ilookup(c.inode()).is_some()
        };
        if at_top {
            return Ok(());
        }
        let dsvn = self.fetch_idirseg(dirvn, child)?;
        {
            let ds = dsvn.borrow();
            let c = child.borrow();
            if ds.dirseg().ilookup(c.inode()).is_none() {
                panic!("broken namespace: child lost between prep and commit");
            }
        }
        let newnhash = self.nhash_of(dirvn, newname);
        let newdsvn = self.yield_dirseg(dirvn, newnhash)?;
        if newdsvn.borrow().dirseg().predict(newnhash).is_none() {
            return Err(FnxError::NoSpace);
        }
        self.require_mutable(&dsvn)?;
        self.require_mutable(&newdsvn)?;
        Ok(())
    }

    /// Detach `child`'s entry from wherever it is bound in `dirvn`,
    /// without touching the accounting.
    fn detach_entry(&mut self, dirvn: &VnodeRef, child: &VnodeRef) -> Result<Option<VnodeRef>> {
        let at_top = {
            let mut d = dirvn.borrow_mut();
            let c = child.borrow();
            d.dir_mut().unlink(c.inode()).is_some()
        };
        if at_top {
            return Ok(None);
        }
        let dsvn = self.fetch_idirseg(dirvn, child)?;
        let gone = {
            let mut ds = dsvn.borrow_mut();
            let c = child.borrow();
            ds.dirseg_mut().unlink(c.inode()).is_some()
        };
        if !gone {
            panic!("broken namespace: child lost between prep and commit");
        }
        Ok(Some(dsvn))
    }

    /// Attach an entry for `child` under `name`, preferring dir-top.
    fn attach_entry(
        &mut self,
        dirvn: &VnodeRef,
        child: &VnodeRef,
        name: &str,
        nhash: Hash,
    ) -> Result<Option<VnodeRef>> {
        let child_ino = child.borrow().inode().ino();
        let de = Dirent::new(nhash, name.len(), child_ino);
        if dirvn.borrow().dir().predict(nhash).is_some() {
            self.associate_link(dirvn, name, nhash, child);
            dirvn.borrow_mut().dir_mut().link(de);
            return Ok(None);
        }
        let dsvn = self.yield_dirseg(dirvn, nhash)?;
        if !dsvn.borrow_mut().dirseg_mut().link(de) {
            return Err(FnxError::NoSpace);
        }
        self.associate_link(dirvn, name, nhash, child);
        Ok(Some(dsvn))
    }

    /// Rebind `child` under a new name within the same directory.
    pub(crate) fn rename_inplace(
        &mut self,
        dirvn: &VnodeRef,
        child: &VnodeRef,
        newname: &str,
    ) -> Result<()> {
        let iref = self.fetch_iref(child)?;
        let newnhash = self.nhash_of(dirvn, newname);

        let dsvn = self.detach_entry(dirvn, child)?;
        self.dissociate_link(dirvn, child);
        let newdsvn = self.attach_entry(dirvn, child, newname, newnhash)?;

        self.update_unlinked(dirvn, child, iref.as_ref());
        self.update_linked(dirvn, child, iref.as_ref());
        self.settle_unlinked(dirvn, dsvn.as_ref());
        self.settle_linked(dirvn, newdsvn.as_ref());
        self.put_link_parties(dirvn, child, iref.as_ref(), dsvn.as_ref(), newdsvn.as_ref());
        Ok(())
    }

    /// Rebind `child` onto `curchild`'s name within one directory, dropping
    /// `curchild`'s entry.
    pub(crate) fn rename_replace(
        &mut self,
        dirvn: &VnodeRef,
        child: &VnodeRef,
        curchild: &VnodeRef,
    ) -> Result<()> {
        self.rename_override(dirvn, child, dirvn, curchild)
    }

    /// Move `child` onto `curchild`'s binding in `newdirvn`, dropping the
    /// overridden entry; also covers the same-dir replace shape.
    pub(crate) fn rename_override(
        &mut self,
        dirvn: &VnodeRef,
        child: &VnodeRef,
        newdirvn: &VnodeRef,
        curchild: &VnodeRef,
    ) -> Result<()> {
        let newname = curchild.borrow().inode().name.s.clone();
        let newnhash = self.nhash_of(newdirvn, &newname);

        let iref = self.fetch_iref(child)?;
        let curiref = self.fetch_iref(curchild)?;

        let dsvn = self.detach_entry(dirvn, child)?;
        let curdsvn = self.detach_entry(newdirvn, curchild)?;
        self.dissociate_link(dirvn, child);
        self.dissociate_link(newdirvn, curchild);
        let newdsvn = self.attach_entry(newdirvn, child, &newname, newnhash)?;

        self.update_unlinked(newdirvn, curchild, curiref.as_ref());
        self.update_unlinked(dirvn, child, iref.as_ref());
        self.update_linked(newdirvn, child, iref.as_ref());
        self.settle_unlinked(dirvn, dsvn.as_ref());
        self.settle_unlinked(newdirvn, curdsvn.as_ref());
        self.settle_linked(newdirvn, newdsvn.as_ref());
        self.put_link_parties(dirvn, child, iref.as_ref(), dsvn.as_ref(), newdsvn.as_ref());
        self.put_link_parties(
            newdirvn,
            curchild,
            curiref.as_ref(),
            curdsvn.as_ref(),
            None,
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Unlinked-inode settlement
    // ------------------------------------------------------------------

    fn finalize_inode(&mut self, vnode: &VnodeRef) {
        vnode.borrow_mut().expired = true;
        self.forget_vnode(vnode);
        self.put_vnode(vnode);
    }

    fn settle_unlinked_dir(&mut self, dirvn: &VnodeRef) -> Result<()> {
        let (nlink, refcnt, nchilds) = {
            let v = dirvn.borrow();
            (v.inode().iattr.nlink, v.refcnt, v.dir().nchilds)
        };
        if nlink > crate::types::INIT_NLINK_DIR {
            return Ok(());
        }
        dirvn.borrow_mut().expired = true;
        if refcnt > 0 {
            return Ok(());
        }
        debug_assert_eq!(nchilds, 0);
        self.finalize_inode(dirvn);
        Ok(())
    }

    fn settle_unlinked_inode(&mut self, vnode: &VnodeRef) -> Result<()> {
        let (nlink, isreg, pseudo) = {
            let v = vnode.borrow();
            (v.inode().iattr.nlink, v.is_reg(), v.pseudo)
        };
        debug_assert!(!pseudo);
        if nlink > crate::types::INIT_NLINK {
            return Ok(());
        }
        self.finalize_inode(vnode);
        if vnode.borrow().refcnt > 0 {
            return Ok(());
        }
        if isreg {
            self.trunc_data(vnode, 0)?;
        }
        Ok(())
    }

    /// After an unlink dropped a binding, expire inodes whose last link is
    /// gone; a reflnk settles both itself and its target.
    pub(crate) fn fix_unlinked(&mut self, vnode: Option<&VnodeRef>) -> Result<()> {
        let Some(vnode) = vnode else {
            return Ok(()); // rename without an overridden target
        };
        let iref = self.fetch_iref(vnode)?;
        if vnode.borrow().is_dir() {
            self.settle_unlinked_dir(vnode)
        } else if vnode.borrow().is_reflnk() {
            let target = iref.expect("reflnk without target");
            self.settle_unlinked_inode(&target)?;
            self.settle_unlinked_inode(vnode)
        } else {
            debug_assert!(iref.is_none());
            self.settle_unlinked_inode(vnode)
        }
    }

    // ------------------------------------------------------------------
    // Attribute application
    // ------------------------------------------------------------------

    pub(crate) fn setiattr(
        &mut self,
        vnode: &VnodeRef,
        uctx: &Uctx,
        flags: SetAttrFlags,
        mode: u32,
        uid: u32,
        gid: u32,
        size: u64,
        times: &Itimes,
    ) -> Result<()> {
        let mut tf = TimeFlags::empty();
        {
            let mut v = vnode.borrow_mut();
            let inode = v.inode_mut();
            if flags.contains(SetAttrFlags::MODE) {
                inode.iattr.mode = (inode.iattr.mode & libc::S_IFMT) | (mode & 0o7777);
                inode.refresh_sgid(uctx);
                tf |= TimeFlags::CTIME;
            }
            if flags.contains(SetAttrFlags::GID) {
                inode.iattr.gid = gid;
                inode.refresh_sgid(uctx);
                tf |= TimeFlags::CTIME;
            }
            if flags.contains(SetAttrFlags::UID) {
                inode.iattr.uid = uid;
                inode.refresh_suid(uctx);
                tf |= TimeFlags::CTIME;
            }
            if flags.any_time() {
                inode.set_times(flags, times);
            }
        }
        if flags.contains(SetAttrFlags::SIZE) && vnode.borrow().inode().size() != size {
            self.setiattr_size(vnode, uctx, size);
            tf |= TimeFlags::ACTIME;
        }
        vnode.borrow_mut().inode_mut().setitime(tf);
        self.put_vnode(vnode);
        Ok(())
    }

    pub(crate) fn setiattr_size(&mut self, vnode: &VnodeRef, uctx: &Uctx, size: u64) {
        {
            let mut v = vnode.borrow_mut();
            let inode = v.inode_mut();
            inode.set_size(size);
            inode.refresh_suid(uctx);
            inode.refresh_sgid(uctx);
        }
        self.put_vnode(vnode);
    }

    /// Copy out a symlink's value; atime moves only in cache.
    pub(crate) fn read_symlnk(&mut self, slvn: &VnodeRef) -> Result<String> {
        let mut v = slvn.borrow_mut();
        let value = v.symlnk().value.clone();
        v.inode_mut().setitime(TimeFlags::ATIME);
        if value.is_empty() {
            warn!("vproc: empty symlink value ino={:#x}", v.inode().ino());
        }
        Ok(value)
    }
}
