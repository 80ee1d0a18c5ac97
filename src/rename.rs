use std::rc::Rc;

use log::debug;

use crate::error::Result;
use crate::task::{Request, Task};
use crate::vobj::vnode::VnodeRef;
use crate::vproc::Vproc;

impl Vproc {
    /// Rename existing entry within the same parent directory.
    fn exec_rename_inplace(
        &mut self,
        parentd: &VnodeRef,
        child: &VnodeRef,
        newname: &str,
    ) -> Result<()> {
        self.prep_rename(parentd, child, newname)?;
        self.rename_inplace(parentd, child, newname)
    }

    /// Rename-move between directories as an unlink/link pair; both sides
    /// are prepped before either mutates.
    fn exec_rename_move(
        &mut self,
        parentd: &VnodeRef,
        child: &VnodeRef,
        newparentd: &VnodeRef,
        newname: &str,
    ) -> Result<()> {
        self.prep_unlink(parentd, child)?;
        self.prep_link(newparentd, newname)?;
        self.unlink_child(parentd, child)
            .expect("prepped unlink failed to commit");
        self.link_child(newparentd, child, newname)
            .expect("prepped link failed to commit");
        Ok(())
    }

    /// Same-dir rename with implicit unlink of the current holder.
    fn exec_rename_replace(
        &mut self,
        parentd: &VnodeRef,
        child: &VnodeRef,
        curchild: &VnodeRef,
    ) -> Result<()> {
        self.prep_xunlink(parentd, curchild)?;
        self.prep_unlink(parentd, child)?;
        self.rename_replace(parentd, child, curchild)
    }

    /// Cross-dir rename with implicit unlink of the destination's current
    /// holder.
    fn exec_rename_override(
        &mut self,
        parentd: &VnodeRef,
        child: &VnodeRef,
        newparentd: &VnodeRef,
        curchild: &VnodeRef,
    ) -> Result<()> {
        self.prep_xunlink(newparentd, curchild)?;
        self.prep_unlink(parentd, child)?;
        self.rename_override(parentd, child, newparentd, curchild)
    }

    /// Resolve both ends, run the pre-flight checks, then dispatch one of
    /// the four rename shapes. Atomic to external observers: no task
    /// boundary falls between the unbind and the rebind.
    pub(crate) fn exec_rename(&mut self, task: &mut Task) -> Result<()> {
        let Request::Rename {
            parent,
            name,
            newparent,
            newname,
        } = task.request.clone()
        else {
            return Err(crate::error::FnxError::Inval);
        };

        let parentd = self.fetch_dir(parent)?;
        let newparentd = self.fetch_dir(newparent)?;
        self.let_namespace(task, &name)?;
        self.let_namespace(task, &newname)?;

        let child = self.lookup_iinode(&parentd, &name)?;
        let curchild = self.lookup_ientry(&newparentd, &newname)?;
        if let Some(cur) = &curchild {
            if Rc::ptr_eq(cur, &child) {
                return Ok(()); // rename onto its own binding
            }
        }
        self.let_rename_src(task, &parentd, &newparentd, &child)?;
        self.let_rename_tgt(task, &newparentd, curchild.as_ref())?;

        let same_dir = Rc::ptr_eq(&parentd, &newparentd);
        match (&curchild, same_dir) {
            (None, true) => self.exec_rename_inplace(&parentd, &child, &newname)?,
            (Some(cur), true) => self.exec_rename_replace(&parentd, &child, cur)?,
            (None, false) => self.exec_rename_move(&parentd, &child, &newparentd, &newname)?,
            (Some(cur), false) => {
                self.exec_rename_override(&parentd, &child, &newparentd, cur)?
            }
        }

        self.fix_unlinked(curchild.as_ref())?;
        debug!("vproc: rename parent={parent:#x} name={name} newparent={newparent:#x} newname={newname}");
        Ok(())
    }
}
