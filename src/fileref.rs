use bitflags::bitflags;

use crate::types::{INO_NULL, Ino};

/// Open-file table capacity.
pub const OPENF_MAX: usize = 64;

/// Free slots held back from unprivileged callers.
const OPENF_SPARE: usize = 3;

bitflags! {
    /// Open flags carried on a fileref; a subset of the O_* surface.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OpenFlags: u32 {
        const WRONLY    = libc::O_WRONLY as u32;
        const RDWR      = libc::O_RDWR as u32;
        const APPEND    = libc::O_APPEND as u32;
        const TRUNC     = libc::O_TRUNC as u32;
        const CREAT     = libc::O_CREAT as u32;
        const EXCL      = libc::O_EXCL as u32;
        const DIRECTORY = libc::O_DIRECTORY as u32;
        const NOATIME   = libc::O_NOATIME as u32;
    }
}

impl OpenFlags {
    /// O_RDONLY is the absence of both write bits, so readability cannot be
    /// probed with a plain mask.
    pub fn readable(&self) -> bool {
        !self.contains(OpenFlags::WRONLY) || self.contains(OpenFlags::RDWR)
    }

    pub fn writeable(&self) -> bool {
        self.intersects(OpenFlags::WRONLY | OpenFlags::RDWR)
    }
}

/// Client-visible handle into the fileref pool.
pub type FrId = u64;

/// Reserved handle of the internal ghost fileref.
pub const FR_GHOST: FrId = u64::MAX;

/// One open-session view of an inode.
#[derive(Debug, Clone)]
pub struct Fileref {
    pub ino: Ino,
    pub readable: bool,
    pub writeable: bool,
    pub noatime: bool,
    pub append: bool,
    pub flags: OpenFlags,
}

impl Fileref {
    fn new(ino: Ino, flags: OpenFlags) -> Fileref {
        Fileref {
            ino,
            readable: flags.readable(),
            writeable: flags.writeable(),
            noatime: flags.contains(OpenFlags::NOATIME),
            append: flags.contains(OpenFlags::APPEND),
            flags,
        }
    }
}

/// Fixed-capacity pool of filerefs plus the ghost slot used to carry an
/// inode through by-path operations (truncate without an fd).
pub struct FrPool {
    slots: Vec<Option<Fileref>>,
    nused: usize,
    ghost: Option<Fileref>,
}

impl FrPool {
    pub fn new() -> FrPool {
        FrPool {
            slots: (0..OPENF_MAX).map(|_| None).collect(),
            nused: 0,
            ghost: None,
        }
    }

    pub fn nused(&self) -> usize {
        self.nused
    }

    /// Unprivileged callers are refused while only the spare slots remain.
    pub fn has_free(&self, privileged: bool) -> bool {
        let free = OPENF_MAX - self.nused;
        if privileged { free > 0 } else { free > OPENF_SPARE }
    }

    pub fn tie(&mut self, ino: Ino, flags: OpenFlags) -> Option<FrId> {
        let slot = self.slots.iter().position(Option::is_none)?;
        self.slots[slot] = Some(Fileref::new(ino, flags));
        self.nused += 1;
        Some(slot as FrId)
    }

    /// Unbind and return the fileref, yielding the inode it held.
    pub fn untie(&mut self, frid: FrId) -> Option<Fileref> {
        if frid == FR_GHOST {
            return self.ghost.take();
        }
        let slot = self.slots.get_mut(frid as usize)?;
        let fref = slot.take()?;
        self.nused -= 1;
        Some(fref)
    }

    pub fn get(&self, frid: FrId) -> Option<&Fileref> {
        if frid == FR_GHOST {
            return self.ghost.as_ref();
        }
        self.slots.get(frid as usize)?.as_ref()
    }

    /// Bind the ghost fileref for a by-path operation.
    pub fn tie_ghost(&mut self, ino: Ino) -> FrId {
        self.ghost = Some(Fileref::new(
            ino,
            OpenFlags::WRONLY | OpenFlags::NOATIME,
        ));
        FR_GHOST
    }

    pub fn drop_ghost(&mut self) {
        self.ghost = None;
    }

    /// Unbind everything, returning the held inos.
    pub fn clear(&mut self) -> Vec<Ino> {
        self.ghost = None;
        let mut inos = Vec::new();
        for slot in self.slots.iter_mut() {
            if let Some(fref) = slot.take() {
                inos.push(fref.ino);
            }
        }
        self.nused = 0;
        inos.retain(|&ino| ino != INO_NULL);
        inos
    }
}

impl Default for FrPool {
    fn default() -> FrPool {
        FrPool::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Vtype, ino_create};

    #[test]
    fn openflags_access_modes() {
        let rd = OpenFlags::empty();
        assert!(rd.readable() && !rd.writeable());

        let wr = OpenFlags::WRONLY;
        assert!(!wr.readable() && wr.writeable());

        let rw = OpenFlags::RDWR;
        assert!(rw.readable() && rw.writeable());
    }

    #[test]
    fn pool_spare_slots_refuse_unprivileged() {
        let mut pool = FrPool::new();
        let ino = ino_create(4, Vtype::Reg);
        while pool.nused() < OPENF_MAX - OPENF_SPARE {
            pool.tie(ino, OpenFlags::empty()).unwrap();
        }
        assert!(!pool.has_free(false));
        assert!(pool.has_free(true));
    }

    #[test]
    fn tie_untie_roundtrip() {
        let mut pool = FrPool::new();
        let ino = ino_create(4, Vtype::Reg);
        let frid = pool.tie(ino, OpenFlags::RDWR).unwrap();
        assert_eq!(pool.get(frid).unwrap().ino, ino);
        assert!(pool.get(frid).unwrap().writeable);

        let fref = pool.untie(frid).unwrap();
        assert_eq!(fref.ino, ino);
        assert!(pool.get(frid).is_none());
        assert_eq!(pool.nused(), 0);
    }

    #[test]
    fn ghost_carries_an_inode_without_a_slot() {
        let mut pool = FrPool::new();
        let ino = ino_create(6, Vtype::Reg);
        let frid = pool.tie_ghost(ino);
        assert_eq!(frid, FR_GHOST);
        assert_eq!(pool.get(frid).unwrap().ino, ino);
        assert_eq!(pool.nused(), 0);
        pool.drop_ghost();
        assert!(pool.get(frid).is_none());
    }
}
