use static_assertions::const_assert;

/// Inode number. The low nibble encodes the object's vtype so a raw ino
/// round-trips to its type tag.
pub type Ino = u64;

/// Extra number of a vaddr: dirseg index, region byte offset, or vlba.
pub type Xno = u64;

/// Virtual logical block address of a data block.
pub type Lba = u64;

/// 64-bit name hash (FNV-1a seeded with the directory ino).
pub type Hash = u64;

/// Directory stream offset.
pub type Doff = i64;

/// Bytes per data block.
pub const BLKSIZE: u64 = 8192;

/// Block slots per region segment.
pub const RSEG_NBK: usize = 16;

/// Bytes covered by one region segment.
pub const RSEGSIZE: u64 = BLKSIZE * RSEG_NBK as u64;

/// Region segments per region section.
pub const RSEC_NSEG: usize = 32;

/// Bytes covered by one region section.
pub const RSECSIZE: u64 = RSEGSIZE * RSEC_NSEG as u64;

/// Region sections per regular file.
pub const REG_NSEC: usize = 4096;

/// Maximum logical size of a regular file.
pub const REGSIZE_MAX: u64 = RSECSIZE * REG_NSEC as u64;

/// Top-of-dir hash slots.
pub const DIR_NDENT: usize = 16;

/// Hashed directory-segment nodes per directory.
pub const DIR_NSEGS: usize = 16;

/// Entries per directory segment.
pub const DIRSEG_NDENT: usize = 128;

/// Maximum visible children per directory.
pub const DIRCHILD_MAX: u64 = 128;

/// Maximum nlink per inode.
pub const LINK_MAX: u32 = 32;

/// Maximum name length, bytes.
pub const NAME_MAX: usize = 255;

/// Maximum symlink value length, bytes.
pub const PATH_MAX: usize = 4096;

/// Base link count of an unbound non-directory inode; its first namespace
/// binding brings it to `INIT_NLINK + 1`.
pub const INIT_NLINK: u32 = 0;

/// Link count of an empty, bound directory (the self entry plus the parent
/// binding).
pub const INIT_NLINK_DIR: u32 = 2;

// A dirseg must be able to absorb every child of a full directory, so the
// structural child-count check fires before any hash bucket overflows.
const_assert!(DIRSEG_NDENT as u64 >= DIRCHILD_MAX);
const_assert!(RSEGSIZE % BLKSIZE == 0);
const_assert!(RSECSIZE % RSEGSIZE == 0);

/// Directory stream offsets: `.` then `..` then the top-of-dir slots, then
/// each hashed segment's slots back to back.
pub const DOFF_SELF: Doff = 0;
pub const DOFF_PARENT: Doff = 1;
pub const DOFF_TOP: Doff = 2;
pub const DOFF_BEGINS: Doff = DOFF_TOP + DIR_NDENT as Doff;
pub const DOFF_END: Doff = DOFF_BEGINS + (DIR_NSEGS * DIRSEG_NDENT) as Doff;
pub const DOFF_NONE: Doff = -1;

pub fn doff_isvalid(doff: Doff) -> bool {
    (DOFF_SELF..=DOFF_END).contains(&doff)
}

/// Directory-segment index owning a stream offset past the top region.
pub fn doff_to_dseg(doff: Doff) -> usize {
    debug_assert!(doff >= DOFF_BEGINS);
    ((doff - DOFF_BEGINS) as usize) / DIRSEG_NDENT
}

/// First stream offset of a directory segment.
pub fn dseg_to_doff(dseg: usize) -> Doff {
    DOFF_BEGINS + (dseg * DIRSEG_NDENT) as Doff
}

/// Types of on-storage objects addressable by a vaddr.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Vtype {
    None = 0,
    Super = 1,
    Spmap = 2,
    Dir = 3,
    Dirseg = 4,
    Reg = 5,
    Regsec = 6,
    Regseg = 7,
    Symlnk = 8,
    Reflnk = 9,
    Special = 10,
    Vbk = 11,
}

pub const VTYPE_COUNT: usize = 12;

impl Vtype {
    /// Inode-bearing types: those whose identity is an ino with the type
    /// packed into its low nibble.
    pub fn is_itype(&self) -> bool {
        matches!(
            self,
            Vtype::Dir | Vtype::Reg | Vtype::Symlnk | Vtype::Reflnk | Vtype::Special
        )
    }

    pub fn from_tag(tag: u8) -> Vtype {
        match tag {
            1 => Vtype::Super,
            2 => Vtype::Spmap,
            3 => Vtype::Dir,
            4 => Vtype::Dirseg,
            5 => Vtype::Reg,
            6 => Vtype::Regsec,
            7 => Vtype::Regseg,
            8 => Vtype::Symlnk,
            9 => Vtype::Reflnk,
            10 => Vtype::Special,
            11 => Vtype::Vbk,
            _ => Vtype::None,
        }
    }
}

pub const INO_NULL: Ino = 0;

/// Pack a type tag into the low nibble of an allocator-issued base number.
pub const fn ino_create(base: u64, vtype: Vtype) -> Ino {
    (base << 4) | (vtype as u64)
}

/// Strip the type tag, yielding the allocator base number.
pub fn ino_getbase(ino: Ino) -> u64 {
    ino >> 4
}

/// Recover the vtype packed into an ino.
pub fn ino_vtype(ino: Ino) -> Vtype {
    Vtype::from_tag((ino & 0xf) as u8)
}

pub fn ino_isvalid(ino: Ino) -> bool {
    ino != INO_NULL && ino_vtype(ino).is_itype()
}

/// The root directory.
pub const INO_ROOT: Ino = ino_create(1, Vtype::Dir);

/// The pseudo-namespace root, resolvable from the root dir by name.
pub const INO_PSROOT: Ino = ino_create(2, Vtype::Dir);

/// Name binding the pseudo-root under the root directory.
pub const PSROOTNAME: &str = ".fnx";

/// Virtual address of any on-storage object: `(vtype, ino, xno)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Vaddr {
    pub vtype: Vtype,
    pub ino: Ino,
    pub xno: Xno,
}

impl Vaddr {
    pub const NULL: Vaddr = Vaddr {
        vtype: Vtype::None,
        ino: INO_NULL,
        xno: 0,
    };

    pub fn new(vtype: Vtype, ino: Ino, xno: Xno) -> Vaddr {
        Vaddr { vtype, ino, xno }
    }

    pub fn is_null(&self) -> bool {
        self.vtype == Vtype::None
    }

    pub fn for_super() -> Vaddr {
        Vaddr::new(Vtype::Super, INO_NULL, 0)
    }

    /// Vaddr of an inode-bearing object; the type is implied by the ino.
    pub fn for_inode(ino: Ino) -> Vaddr {
        Vaddr::new(ino_vtype(ino), ino, 0)
    }

    pub fn for_dirseg(dino: Ino, dseg: usize) -> Vaddr {
        Vaddr::new(Vtype::Dirseg, dino, dseg as Xno)
    }

    pub fn for_regsec(ino: Ino, off: u64) -> Vaddr {
        Vaddr::new(Vtype::Regsec, ino, off_floor_rsec(off))
    }

    pub fn for_regseg(ino: Ino, off: u64) -> Vaddr {
        Vaddr::new(Vtype::Regseg, ino, off_floor_rseg(off))
    }

    pub fn for_vbk(vlba: Lba) -> Vaddr {
        Vaddr::new(Vtype::Vbk, INO_NULL, vlba)
    }

    pub fn vlba(&self) -> Lba {
        debug_assert_eq!(self.vtype, Vtype::Vbk);
        self.xno
    }
}

/// Offset rounded down to its block start.
pub fn off_floor_blk(off: u64) -> u64 {
    off - (off % BLKSIZE)
}

/// Offset rounded up to the next block boundary (identity on boundaries).
pub fn off_ceil_blk(off: u64) -> u64 {
    off_floor_blk(off + BLKSIZE - 1)
}

pub fn off_floor_rseg(off: u64) -> u64 {
    off - (off % RSEGSIZE)
}

/// Start of the region segment after the one holding `off`.
pub fn off_next_rseg(off: u64) -> u64 {
    off_floor_rseg(off) + RSEGSIZE
}

pub fn off_floor_rsec(off: u64) -> u64 {
    off - (off % RSECSIZE)
}

/// Start of the region section after the one holding `off`.
pub fn off_next_rsec(off: u64) -> u64 {
    off_floor_rsec(off) + RSECSIZE
}

/// True while the offset lies in segment 0, which is inlined in the reg head.
pub fn off_isseg0(off: u64) -> bool {
    off < RSEGSIZE
}

/// True while the offset lies in section 0, whose segments hang directly off
/// the reg head (no regsec node).
pub fn off_issec0(off: u64) -> bool {
    off < RSECSIZE
}

/// A contiguous byte range confined to a single region segment, carried with
/// its block-slot window: `idx` is the first slot within the segment map and
/// `cnt` the number of slots the range overlaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lrange {
    pub off: u64,
    pub len: u64,
    pub idx: usize,
    pub cnt: usize,
}

impl Lrange {
    pub fn new(off: u64, len: u64) -> Lrange {
        debug_assert!(len == 0 || off_floor_rseg(off) == off_floor_rseg(off + len - 1));
        let idx = ((off % RSEGSIZE) / BLKSIZE) as usize;
        let cnt = if len == 0 {
            0
        } else {
            (((off + len - 1) / BLKSIZE) - (off / BLKSIZE) + 1) as usize
        };
        Lrange { off, len, idx, cnt }
    }

    /// Range from begin/end offsets instead of offset/length.
    pub fn span(beg: u64, end: u64) -> Lrange {
        debug_assert!(beg <= end);
        Lrange::new(beg, end - beg)
    }

    pub fn end(&self) -> u64 {
        self.off + self.len
    }

    /// Sub-block ranges merge into the previous block image on write.
    pub fn is_subblk(&self) -> bool {
        self.len < BLKSIZE
    }
}

/// A directory-bound name: the hash is seeded with the owning directory's
/// ino, so equal strings bind to different buckets in different dirs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Name {
    pub hash: Hash,
    pub s: String,
}

impl Name {
    pub fn new(s: &str, hash: Hash) -> Name {
        Name {
            hash,
            s: s.to_string(),
        }
    }

    pub fn len(&self) -> usize {
        self.s.len()
    }

    pub fn is_empty(&self) -> bool {
        self.s.is_empty()
    }
}

/// FNV-1a over the name bytes, seeded with the directory ino.
pub fn inamehash(name: &str, dino: Ino) -> Hash {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut h = FNV_OFFSET ^ dino.wrapping_mul(FNV_PRIME);
    for b in name.as_bytes() {
        h ^= u64::from(*b);
        h = h.wrapping_mul(FNV_PRIME);
    }
    // Zero is reserved for "hash not computed yet".
    if h == 0 { FNV_PRIME } else { h }
}

/// Top-of-dir slot addressed by a name hash.
pub fn hash_to_dtop(hash: Hash) -> usize {
    (hash % DIR_NDENT as u64) as usize
}

/// Hashed directory-segment index addressed by a name hash.
pub fn hash_to_dseg(hash: Hash) -> usize {
    ((hash >> 16) % DIR_NSEGS as u64) as usize
}

/// Fixed-width bitmap used for section/segment existence maps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bitmap {
    words: Vec<u64>,
    nbits: usize,
}

impl Bitmap {
    pub fn new(nbits: usize) -> Bitmap {
        Bitmap {
            words: vec![0; nbits.div_ceil(64)],
            nbits,
        }
    }

    pub fn test(&self, pos: usize) -> bool {
        debug_assert!(pos < self.nbits);
        (self.words[pos / 64] >> (pos % 64)) & 1 != 0
    }

    pub fn set(&mut self, pos: usize) {
        debug_assert!(pos < self.nbits);
        self.words[pos / 64] |= 1u64 << (pos % 64);
    }

    pub fn clear(&mut self, pos: usize) {
        debug_assert!(pos < self.nbits);
        self.words[pos / 64] &= !(1u64 << (pos % 64));
    }

    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// First set bit at or after `from`, if any.
    pub fn next_set(&self, from: usize) -> Option<usize> {
        (from..self.nbits).find(|p| self.test(*p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ino_roundtrips_vtype() {
        let ino = ino_create(77, Vtype::Reg);
        assert_eq!(ino_vtype(ino), Vtype::Reg);
        assert_eq!(ino_getbase(ino), 77);
        assert_eq!(ino_vtype(INO_ROOT), Vtype::Dir);
        assert!(!ino_isvalid(INO_NULL));
    }

    #[test]
    fn lrange_block_window() {
        let r = Lrange::new(0, 5);
        assert_eq!((r.idx, r.cnt), (0, 1));

        let r = Lrange::new(BLKSIZE - 1, 2);
        assert_eq!((r.idx, r.cnt), (0, 2));

        let r = Lrange::new(3 * BLKSIZE, BLKSIZE);
        assert_eq!((r.idx, r.cnt), (3, 1));

        let r = Lrange::new(RSEGSIZE + BLKSIZE, 0);
        assert_eq!((r.idx, r.cnt), (1, 0));
    }

    #[test]
    fn doff_segment_mapping() {
        assert_eq!(doff_to_dseg(DOFF_BEGINS), 0);
        assert_eq!(doff_to_dseg(dseg_to_doff(7)), 7);
        assert!(doff_isvalid(DOFF_SELF));
        assert!(doff_isvalid(DOFF_END));
        assert!(!doff_isvalid(DOFF_NONE));
    }

    #[test]
    fn namehash_is_dir_seeded() {
        let h1 = inamehash("hello", INO_ROOT);
        let h2 = inamehash("hello", ino_create(9, Vtype::Dir));
        assert_ne!(h1, 0);
        assert_ne!(h1, h2);
        assert_eq!(h1, inamehash("hello", INO_ROOT));
    }

    #[test]
    fn bitmap_ops() {
        let mut bm = Bitmap::new(100);
        assert_eq!(bm.next_set(0), None);
        bm.set(3);
        bm.set(70);
        assert!(bm.test(3) && bm.test(70) && !bm.test(4));
        assert_eq!(bm.count(), 2);
        assert_eq!(bm.next_set(4), Some(70));
        bm.clear(3);
        assert_eq!(bm.count(), 1);
    }
}
