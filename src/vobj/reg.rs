use crate::types::{
    Bitmap, Ino, PATH_MAX, REG_NSEC, RSEC_NSEG, RSEG_NBK, RSECSIZE, RSEGSIZE, Vaddr, off_ceil_blk,
};
use crate::vobj::inode::{Inode, Uctx};

fn sec_index(off: u64) -> usize {
    (off / RSECSIZE) as usize
}

fn seg_index_in_sec(off: u64) -> usize {
    ((off % RSECSIZE) / RSEGSIZE) as usize
}

/// Regular-file head: the inode, the inline block map of segment 0, and the
/// existence bitmaps for the deeper extent-map tiers.
#[derive(Debug, Clone)]
pub struct Reg {
    pub inode: Inode,
    /// Block slots of segment 0, inlined here.
    pub segmap0: Vec<Vaddr>,
    /// Which section-0 regseg nodes exist (slot 0 stands for segment 0).
    pub segmap: Bitmap,
    /// Which regsec nodes exist; bit 0 marks "section 0 has segments".
    pub secmap: Bitmap,
    pub nsegs: usize,
    pub nblks: u64,
    /// Block-aligned max mapped extent.
    pub bcap: u64,
}

impl Reg {
    pub fn new(ino: Ino, uctx: &Uctx, mode: u32) -> Reg {
        Reg {
            inode: Inode::setup(ino, uctx, libc::S_IFREG | (mode & 0o7777), 0),
            segmap0: vec![Vaddr::NULL; RSEG_NBK],
            segmap: Bitmap::new(RSEC_NSEG),
            secmap: Bitmap::new(REG_NSEC),
            nsegs: 0,
            nblks: 0,
            bcap: 0,
        }
    }

    pub fn ino(&self) -> Ino {
        self.inode.ino()
    }

    pub fn size(&self) -> u64 {
        self.inode.size()
    }

    pub fn set_size(&mut self, size: u64) {
        self.inode.set_size(size);
    }

    pub fn testsec(&self, off: u64) -> bool {
        self.secmap.test(sec_index(off))
    }

    pub fn marksec(&mut self, off: u64) {
        self.secmap.set(sec_index(off));
    }

    pub fn unmarksec(&mut self, off: u64) {
        self.secmap.clear(sec_index(off));
    }

    /// Section-0 segment existence (the regseg nodes hanging directly off
    /// this head).
    pub fn testseg(&self, off: u64) -> bool {
        self.segmap.test(seg_index_in_sec(off))
    }

    pub fn markseg(&mut self, off: u64) {
        let pos = seg_index_in_sec(off);
        if !self.segmap.test(pos) {
            self.segmap.set(pos);
            self.nsegs += 1;
        }
    }

    pub fn unmarkseg(&mut self, off: u64) {
        let pos = seg_index_in_sec(off);
        if self.segmap.test(pos) {
            self.segmap.clear(pos);
            self.nsegs -= 1;
        }
    }

    /// Grow-side accounting: extend the mapped capacity to cover `end`, add
    /// freshly mapped blocks, and grow the logical size unless told to keep
    /// it (fallocate with `keep_size`, pure mapping-node creation).
    pub fn wmore(&mut self, end: u64, nblks: u64, keep_size: bool) {
        self.bcap = self.bcap.max(off_ceil_blk(end));
        self.nblks += nblks;
        if !keep_size && end > self.size() {
            self.set_size(end);
        }
    }

    /// Shrink-side accounting for trimmed blocks.
    pub fn wless(&mut self, nblks: u64) {
        debug_assert!(self.nblks >= nblks);
        self.nblks -= nblks;
    }

    /// Attribute snapshot with the block count folded in.
    pub fn getiattr(&self) -> crate::vobj::inode::Iattr {
        let mut iattr = self.inode.iattr.clone();
        iattr.blocks = self.nblks;
        iattr
    }
}

/// Second-level extent-map node: marks which regseg children exist within
/// one section.
#[derive(Debug, Clone)]
pub struct Regsec {
    pub segmap: Bitmap,
    pub nsegs: usize,
}

impl Regsec {
    pub fn new() -> Regsec {
        Regsec {
            segmap: Bitmap::new(RSEC_NSEG),
            nsegs: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nsegs == 0
    }

    pub fn testseg(&self, off: u64) -> bool {
        self.segmap.test(seg_index_in_sec(off))
    }

    pub fn markseg(&mut self, off: u64) {
        let pos = seg_index_in_sec(off);
        if !self.segmap.test(pos) {
            self.segmap.set(pos);
            self.nsegs += 1;
        }
    }

    pub fn unmarkseg(&mut self, off: u64) {
        let pos = seg_index_in_sec(off);
        if self.segmap.test(pos) {
            self.segmap.clear(pos);
            self.nsegs -= 1;
        }
    }
}

impl Default for Regsec {
    fn default() -> Regsec {
        Regsec::new()
    }
}

/// Third-level extent-map node: one vaddr slot per block position within a
/// `RSEGSIZE` region.
#[derive(Debug, Clone)]
pub struct Regseg {
    /// Byte offset of the region this segment covers.
    pub base: u64,
    pub segmap: Vec<Vaddr>,
}

impl Regseg {
    pub fn new(base: u64) -> Regseg {
        Regseg {
            base,
            segmap: vec![Vaddr::NULL; RSEG_NBK],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.segmap.iter().all(Vaddr::is_null)
    }
}

/// Symbolic link: an inode with an embedded path value.
#[derive(Debug, Clone)]
pub struct Symlnk {
    pub inode: Inode,
    pub value: String,
}

impl Symlnk {
    pub fn new(ino: Ino, uctx: &Uctx, value: &str) -> Symlnk {
        debug_assert!(value.len() <= PATH_MAX);
        let mut inode = Inode::setup(ino, uctx, libc::S_IFLNK | 0o777, 0);
        inode.iattr.size = value.len() as u64;
        Symlnk {
            inode,
            value: value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BLKSIZE, Vtype, ino_create};

    fn mkreg() -> Reg {
        Reg::new(ino_create(3, Vtype::Reg), &Uctx::new(0, 0), 0o644)
    }

    #[test]
    fn wmore_grows_size_and_capacity() {
        let mut reg = mkreg();
        reg.wmore(5, 1, false);
        assert_eq!(reg.size(), 5);
        assert_eq!(reg.bcap, BLKSIZE);
        assert_eq!(reg.nblks, 1);

        // keep_size leaves the logical size alone.
        reg.wmore(3 * BLKSIZE, 0, true);
        assert_eq!(reg.size(), 5);
        assert_eq!(reg.bcap, 3 * BLKSIZE);
    }

    #[test]
    fn seg_and_sec_marks_account() {
        let mut reg = mkreg();
        assert!(!reg.testseg(RSEGSIZE));
        reg.markseg(RSEGSIZE);
        reg.markseg(RSEGSIZE); // idempotent
        assert_eq!(reg.nsegs, 1);
        reg.unmarkseg(RSEGSIZE);
        assert_eq!(reg.nsegs, 0);

        reg.marksec(RSECSIZE * 2);
        assert!(reg.testsec(RSECSIZE * 2 + 5));
        assert!(!reg.testsec(RSECSIZE));
    }

    #[test]
    fn regseg_emptiness_tracks_slots() {
        let mut seg = Regseg::new(RSEGSIZE);
        assert!(seg.is_empty());
        seg.segmap[4] = Vaddr::for_vbk(77);
        assert!(!seg.is_empty());
        seg.segmap[4] = Vaddr::NULL;
        assert!(seg.is_empty());
    }
}
