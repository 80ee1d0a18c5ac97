use std::collections::VecDeque;

use crate::task::Task;
use crate::vobj::vnode::VnodeRef;

/// Two-stage queue of job elements: vnodes dirtied by the current
/// transaction (*staged*, FIFO by stage time) and tasks suspended on
/// `Pend`/`Delay` (*pended*).
///
/// Staging is idempotent per vnode: the `staged` flag on the vnode is the
/// membership bit, and unstaged entries are dropped lazily at pop time.
pub struct Pendq {
    staged: VecDeque<VnodeRef>,
    pended: VecDeque<Task>,
}

impl Pendq {
    pub fn new() -> Pendq {
        Pendq {
            staged: VecDeque::new(),
            pended: VecDeque::new(),
        }
    }

    pub fn stage(&mut self, vnode: &VnodeRef) {
        let mut v = vnode.borrow_mut();
        if !v.staged {
            v.staged = true;
            drop(v);
            self.staged.push_back(vnode.clone());
        }
    }

    pub fn unstage(&mut self, vnode: &VnodeRef) {
        vnode.borrow_mut().staged = false;
    }

    /// Pop the oldest staged vnode, skipping entries unstaged since.
    pub fn sfront(&mut self) -> Option<VnodeRef> {
        while let Some(vn) = self.staged.pop_front() {
            let mut v = vn.borrow_mut();
            if v.staged {
                v.staged = false;
                drop(v);
                return Some(vn);
            }
        }
        None
    }

    pub fn has_staged(&self) -> bool {
        self.staged.iter().any(|vn| vn.borrow().staged)
    }

    pub fn pend(&mut self, task: Task) {
        self.pended.push_back(task);
    }

    pub fn pfront(&mut self) -> Option<Task> {
        self.pended.pop_front()
    }

    pub fn pended_len(&self) -> usize {
        self.pended.len()
    }
}

impl Default for Pendq {
    fn default() -> Pendq {
        Pendq::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Vaddr, Vtype, ino_create};
    use crate::vobj::inode::Uctx;
    use crate::vobj::reg::Reg;
    use crate::vobj::vnode::{Vnode, VnodeKind};

    fn mkvn(base: u64) -> VnodeRef {
        let ino = ino_create(base, Vtype::Reg);
        let reg = Reg::new(ino, &Uctx::new(0, 0), 0o644);
        Vnode::new_ref(Vaddr::for_inode(ino), VnodeKind::Reg(reg))
    }

    #[test]
    fn stage_is_idempotent_and_fifo() {
        let mut pq = Pendq::new();
        let (a, b) = (mkvn(1), mkvn(2));

        pq.stage(&a);
        pq.stage(&b);
        pq.stage(&a); // no-op

        let first = pq.sfront().unwrap();
        assert_eq!(first.borrow().vaddr, a.borrow().vaddr);
        let second = pq.sfront().unwrap();
        assert_eq!(second.borrow().vaddr, b.borrow().vaddr);
        assert!(pq.sfront().is_none());
    }

    #[test]
    fn unstage_drops_lazily() {
        let mut pq = Pendq::new();
        let a = mkvn(3);
        pq.stage(&a);
        pq.unstage(&a);
        assert!(!pq.has_staged());
        assert!(pq.sfront().is_none());
    }
}
