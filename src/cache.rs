use std::collections::{BTreeMap, HashMap};

use crate::types::{Hash, INO_NULL, Ino, Vaddr};
use crate::vobj::vnode::VnodeRef;

/// Soft cap on dentry hints; staleness is tolerated, so shedding arbitrary
/// entries on overflow is fine.
const DE_CAP: usize = 4096;

struct Slot {
    vnode: VnodeRef,
    tick: u64,
}

/// Maps `vaddr -> vnode` with LRU ordering, plus the dentry hint cache
/// `(dir_ino, name_hash, name_len) -> ino`.
///
/// LRU is kept as a monotonic access tick per entry and a tick-ordered index;
/// a lookup re-stamps the entry at the MRU end.
pub struct Vcache {
    map: HashMap<Vaddr, Slot>,
    order: BTreeMap<u64, Vaddr>,
    tick: u64,
    dents: HashMap<(Ino, Hash, u16), Ino>,
}

impl Vcache {
    pub fn new() -> Vcache {
        Vcache {
            map: HashMap::new(),
            order: BTreeMap::new(),
            tick: 0,
            dents: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Insert at the MRU end; the vnode is marked cached.
    pub fn store(&mut self, vnode: VnodeRef) {
        let vaddr = vnode.borrow().vaddr;
        if let Some(old) = self.map.remove(&vaddr) {
            self.order.remove(&old.tick);
        }
        let tick = self.next_tick();
        vnode.borrow_mut().cached = true;
        self.order.insert(tick, vaddr);
        self.map.insert(vaddr, Slot { vnode, tick });
    }

    /// Hit refreshes the entry to the MRU end.
    pub fn lookup(&mut self, vaddr: &Vaddr) -> Option<VnodeRef> {
        let tick = self.next_tick();
        let slot = self.map.get_mut(vaddr)?;
        self.order.remove(&slot.tick);
        slot.tick = tick;
        self.order.insert(tick, *vaddr);
        Some(slot.vnode.clone())
    }

    pub fn evict(&mut self, vaddr: &Vaddr) -> Option<VnodeRef> {
        let slot = self.map.remove(vaddr)?;
        self.order.remove(&slot.tick);
        slot.vnode.borrow_mut().cached = false;
        Some(slot.vnode)
    }

    /// Detach and return the least-recently-used vnode.
    pub fn poplru(&mut self) -> Option<VnodeRef> {
        let (&tick, &vaddr) = self.order.iter().next()?;
        self.order.remove(&tick);
        let slot = self.map.remove(&vaddr).expect("order/map out of sync");
        slot.vnode.borrow_mut().cached = false;
        Some(slot.vnode)
    }

    /// Bind or unbind a dentry hint; `INO_NULL` unbinds.
    pub fn remap_de(&mut self, dino: Ino, hash: Hash, nlen: usize, ino: Ino) {
        let key = (dino, hash, nlen as u16);
        if ino == INO_NULL {
            self.dents.remove(&key);
            return;
        }
        if self.dents.len() >= DE_CAP {
            if let Some(k) = self.dents.keys().next().copied() {
                self.dents.remove(&k);
            }
        }
        self.dents.insert(key, ino);
    }

    pub fn lookup_de(&self, dino: Ino, hash: Hash, nlen: usize) -> Ino {
        self.dents
            .get(&(dino, hash, nlen as u16))
            .copied()
            .unwrap_or(INO_NULL)
    }

    pub fn clear_des(&mut self) {
        self.dents.clear();
    }
}

impl Default for Vcache {
    fn default() -> Vcache {
        Vcache::new()
    }
}
