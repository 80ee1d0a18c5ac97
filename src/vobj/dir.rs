use crate::types::{
    Bitmap, DIR_NDENT, DIR_NSEGS, DIRSEG_NDENT, DOFF_TOP, Doff, Hash, INO_NULL, INO_ROOT, Ino,
    hash_to_dtop,
};
use crate::vobj::inode::{Inode, Uctx};

/// A directory entry as stored in a dent slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dirent {
    pub hash: Hash,
    pub nlen: u16,
    pub ino: Ino,
}

impl Dirent {
    pub fn new(hash: Hash, nlen: usize, ino: Ino) -> Dirent {
        Dirent {
            hash,
            nlen: nlen as u16,
            ino,
        }
    }

    pub fn matches(&self, hash: Hash, nlen: usize) -> bool {
        self.hash == hash && self.nlen as usize == nlen
    }
}

/// Directory head: the inode plus the top-of-dir dent slots and the bitmap of
/// hashed segment nodes hanging below it.
#[derive(Debug, Clone)]
pub struct Dir {
    pub inode: Inode,
    pub nchilds: u64,
    pub dent: [Option<Dirent>; DIR_NDENT],
    pub segmap: Bitmap,
    pub nsegs: usize,
    /// Back-reference to the parent directory, by ino (never a pointer).
    pub parentd: Ino,
}

impl Dir {
    pub fn new(ino: Ino, uctx: &Uctx, mode: u32) -> Dir {
        Dir {
            inode: Inode::setup(ino, uctx, libc::S_IFDIR | (mode & 0o7777), 0),
            nchilds: 0,
            dent: [None; DIR_NDENT],
            segmap: Bitmap::new(DIR_NSEGS),
            nsegs: 0,
            parentd: INO_NULL,
        }
    }

    pub fn ino(&self) -> Ino {
        self.inode.ino()
    }

    pub fn is_root(&self) -> bool {
        self.ino() == INO_ROOT
    }

    pub fn is_empty(&self) -> bool {
        self.nchilds == 0
    }

    pub fn has_space(&self) -> bool {
        self.nchilds < crate::types::DIRCHILD_MAX
    }

    /// The `.` / `..` resolution; other names miss here.
    pub fn meta(&self, name: &str) -> Option<Ino> {
        match name {
            "." => Some(self.ino()),
            ".." => {
                if self.is_root() {
                    Some(self.ino())
                } else {
                    Some(self.parentd)
                }
            }
            _ => None,
        }
    }

    /// Free top slot for this hash, if the name can be linked at dir-top.
    pub fn predict(&self, hash: Hash) -> Option<usize> {
        let slot = hash_to_dtop(hash);
        self.dent[slot].is_none().then_some(slot)
    }

    pub fn lookup(&self, hash: Hash, nlen: usize) -> Option<&Dirent> {
        self.dent[hash_to_dtop(hash)]
            .as_ref()
            .filter(|de| de.matches(hash, nlen))
    }

    /// Locate the top entry binding `inode`, by its bound name hash.
    pub fn ilookup(&self, inode: &Inode) -> Option<usize> {
        let slot = hash_to_dtop(inode.name.hash);
        match &self.dent[slot] {
            Some(de) if de.ino == inode.ino() => Some(slot),
            _ => None,
        }
    }

    pub fn link(&mut self, de: Dirent) {
        let slot = hash_to_dtop(de.hash);
        debug_assert!(self.dent[slot].is_none());
        self.dent[slot] = Some(de);
    }

    pub fn unlink(&mut self, inode: &Inode) -> Option<Dirent> {
        self.ilookup(inode).and_then(|slot| self.dent[slot].take())
    }

    /// First populated top slot at stream offset `doff` or later, with the
    /// offset it was found at.
    pub fn search(&self, doff: Doff) -> Option<(Dirent, Doff)> {
        let from = (doff.max(DOFF_TOP) - DOFF_TOP) as usize;
        (from..DIR_NDENT)
            .find_map(|slot| self.dent[slot].map(|de| (de, DOFF_TOP + slot as Doff)))
    }

    pub fn hasseg(&self, dseg: usize) -> bool {
        self.segmap.test(dseg)
    }

    pub fn setseg(&mut self, dseg: usize) {
        if !self.segmap.test(dseg) {
            self.segmap.set(dseg);
            self.nsegs += 1;
        }
    }

    pub fn unsetseg(&mut self, dseg: usize) {
        if self.segmap.test(dseg) {
            self.segmap.clear(dseg);
            self.nsegs -= 1;
        }
    }

    /// Next existing segment index at or after `from`.
    pub fn nextseg(&self, from: usize) -> Option<usize> {
        self.segmap.next_set(from)
    }
}

/// Hashed directory-segment node: overflow entries whose top slot was taken.
#[derive(Debug, Clone)]
pub struct Dirseg {
    pub index: usize,
    pub dent: Vec<Option<Dirent>>,
    pub nents: usize,
}

impl Dirseg {
    pub fn new(index: usize) -> Dirseg {
        Dirseg {
            index,
            dent: vec![None; DIRSEG_NDENT],
            nents: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nents == 0
    }

    /// Free slot available for a new entry, if any.
    pub fn predict(&self, _hash: Hash) -> Option<usize> {
        self.dent.iter().position(Option::is_none)
    }

    pub fn lookup(&self, hash: Hash, nlen: usize) -> Option<&Dirent> {
        self.dent
            .iter()
            .flatten()
            .find(|de| de.matches(hash, nlen))
    }

    pub fn ilookup(&self, inode: &Inode) -> Option<usize> {
        self.dent
            .iter()
            .position(|d| matches!(d, Some(de) if de.ino == inode.ino()))
    }

    pub fn link(&mut self, de: Dirent) -> bool {
        match self.predict(de.hash) {
            Some(slot) => {
                self.dent[slot] = Some(de);
                self.nents += 1;
                true
            }
            None => false,
        }
    }

    pub fn unlink(&mut self, inode: &Inode) -> Option<Dirent> {
        let slot = self.ilookup(inode)?;
        self.nents -= 1;
        self.dent[slot].take()
    }

    /// First populated slot at stream offset `doff` or later within this
    /// segment's window.
    pub fn search(&self, doff: Doff) -> Option<(Dirent, Doff)> {
        let base = crate::types::dseg_to_doff(self.index);
        let from = if doff > base { (doff - base) as usize } else { 0 };
        (from..DIRSEG_NDENT)
            .find_map(|slot| self.dent[slot].map(|de| (de, base + slot as Doff)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DOFF_BEGINS, Vtype, inamehash, ino_create};

    fn mkdir(ino: Ino) -> Dir {
        Dir::new(ino, &Uctx::new(0, 0), 0o755)
    }

    #[test]
    fn top_link_lookup_unlink() {
        let mut dir = mkdir(INO_ROOT);
        let hash = inamehash("kid", dir.ino());
        let child = ino_create(9, Vtype::Reg);
        let slot = dir.predict(hash).expect("top slot");

        dir.link(Dirent::new(hash, 3, child));
        assert_eq!(dir.predict(hash), None);
        assert_eq!(dir.lookup(hash, 3).map(|d| d.ino), Some(child));
        assert!(dir.lookup(hash, 4).is_none());

        let mut inode = Inode::default();
        inode.iattr.ino = child;
        inode.name = crate::types::Name::new("kid", hash);
        assert_eq!(dir.ilookup(&inode), Some(slot));
        assert!(dir.unlink(&inode).is_some());
        assert!(dir.lookup(hash, 3).is_none());
    }

    #[test]
    fn dirseg_fills_linearly_until_full() {
        let mut seg = Dirseg::new(2);
        for i in 0..DIRSEG_NDENT {
            assert!(seg.link(Dirent::new(1000 + i as u64, 4, ino_create(i as u64 + 10, Vtype::Reg))));
        }
        assert!(!seg.link(Dirent::new(1, 1, ino_create(999, Vtype::Reg))));
        assert_eq!(seg.nents, DIRSEG_NDENT);
    }

    #[test]
    fn dirseg_search_walks_slots_in_doff_order() {
        let mut seg = Dirseg::new(0);
        seg.link(Dirent::new(11, 1, ino_create(3, Vtype::Reg)));
        seg.link(Dirent::new(22, 1, ino_create(4, Vtype::Reg)));

        let (de, doff) = seg.search(DOFF_BEGINS).expect("first");
        assert_eq!(de.hash, 11);
        let (de2, _) = seg.search(doff + 1).expect("second");
        assert_eq!(de2.hash, 22);
        assert!(seg.search(doff + 2).is_none());
    }

    #[test]
    fn meta_resolves_dots() {
        let mut dir = mkdir(ino_create(5, Vtype::Dir));
        dir.parentd = INO_ROOT;
        assert_eq!(dir.meta("."), Some(dir.ino()));
        assert_eq!(dir.meta(".."), Some(INO_ROOT));
        assert_eq!(dir.meta("x"), None);
    }
}
