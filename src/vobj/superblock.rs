use bitflags::bitflags;

use crate::error::{FnxError, Result};
use crate::task::{OPCODE_COUNT, Opcode};
use crate::types::{BLKSIZE, Lba, NAME_MAX, VTYPE_COUNT, Vtype};
use crate::vobj::inode::{Itimes, TimeFlags, Tstamp, Uctx};

bitflags! {
    /// Mount options stored on the super.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MntFlags: u32 {
        const RDONLY  = 1 << 0;
        const NOATIME = 1 << 1;
        const NOSUID  = 1 << 2;
        const NODEV   = 1 << 3;
        const NOEXEC  = 1 << 4;
    }
}

/// Filesystem identity and mount state.
#[derive(Debug, Clone, Default)]
pub struct FsAttr {
    pub uuid: [u8; 16],
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub mntf: MntFlags,
}

/// Ino slots reserved for privileged callers.
const INO_SPARE: u64 = 2;

/// Block slots reserved for privileged callers.
const BLK_SPARE: u64 = 16;

/// Object counters and the ino/vlba allocation cursors.
#[derive(Debug, Clone, Default)]
pub struct FsStat {
    pub ino_next: u64,
    pub vlba_next: Lba,
    pub ino_max: u64,
    pub blk_max: u64,
    pub ino_used: u64,
    pub blk_used: u64,
    pub vstat: [u64; VTYPE_COUNT],
}

impl FsStat {
    pub fn new(ino_max: u64, blk_max: u64) -> FsStat {
        FsStat {
            ino_next: 3, // 1 and 2 are the root and pseudo-root bases
            vlba_next: 1,
            ino_max,
            blk_max,
            ..FsStat::default()
        }
    }

    /// Per-vtype accounting on acquire (+1) / forget (-1). Pseudo objects
    /// never reach here.
    pub fn account(&mut self, vtype: Vtype, n: i64) {
        let slot = &mut self.vstat[vtype as usize];
        *slot = slot.checked_add_signed(n).expect("vstat underflow");

        match vtype {
            Vtype::None | Vtype::Super | Vtype::Spmap => {}
            other => {
                self.blk_used = self.blk_used.checked_add_signed(n).expect("blk underflow");
                if other.is_itype() {
                    self.ino_used =
                        self.ino_used.checked_add_signed(n).expect("ino underflow");
                }
            }
        }
    }

    pub fn next_ino(&self) -> Result<u64> {
        if self.ino_used >= self.ino_max {
            return Err(FnxError::NoSpace);
        }
        Ok(self.ino_next)
    }

    pub fn stamp_ino(&mut self, base: u64) {
        self.ino_next = self.ino_next.max(base + 1);
    }

    pub fn next_vlba(&self) -> Result<Lba> {
        if self.blk_used >= self.blk_max {
            return Err(FnxError::NoSpace);
        }
        Ok(self.vlba_next)
    }

    pub fn stamp_vlba(&mut self, vlba: Lba) {
        self.vlba_next = self.vlba_next.max(vlba + 1);
    }

    pub fn has_next_ino(&self, privileged: bool) -> bool {
        let spare = if privileged { 0 } else { INO_SPARE };
        self.ino_used + spare < self.ino_max
    }

    pub fn has_free_blocks(&self, nblks: u64, privileged: bool) -> bool {
        let spare = if privileged { 0 } else { BLK_SPARE };
        self.blk_used + nblks + spare <= self.blk_max
    }
}

/// Per-opcode success counters.
#[derive(Debug, Clone)]
pub struct OpStat {
    counts: [u64; OPCODE_COUNT],
}

impl OpStat {
    pub fn new() -> OpStat {
        OpStat {
            counts: [0; OPCODE_COUNT],
        }
    }

    pub fn count(&mut self, opcode: Opcode) {
        self.counts[opcode as usize] += 1;
    }

    pub fn get(&self, opcode: Opcode) -> u64 {
        self.counts[opcode as usize]
    }
}

impl Default for OpStat {
    fn default() -> OpStat {
        OpStat::new()
    }
}

/// Byte/operation counters for one I/O direction.
#[derive(Debug, Clone, Copy, Default)]
pub struct IoStat {
    pub nbytes: u64,
    pub nopers: u64,
}

impl IoStat {
    pub fn update(&mut self, nbytes: u64) {
        self.nbytes += nbytes;
        self.nopers += 1;
    }
}

/// Snapshot handed out by STATFS / FSINFO.
#[derive(Debug, Clone, Default)]
pub struct FsInfo {
    pub uuid: [u8; 16],
    pub name: String,
    pub blk_size: u64,
    pub blk_total: u64,
    pub blk_free: u64,
    pub ino_total: u64,
    pub ino_free: u64,
    pub name_max: u64,
}

/// Process-wide filesystem state carried by the super vnode.
#[derive(Debug, Clone)]
pub struct Super {
    pub attr: FsAttr,
    pub stat: FsStat,
    pub oper: OpStat,
    pub rdst: IoStat,
    pub wrst: IoStat,
    pub uctx: Uctx,
    pub times: Itimes,
}

impl Super {
    pub fn new(attr: FsAttr, ino_max: u64, blk_max: u64) -> Super {
        let now = Tstamp::now();
        Super {
            attr,
            stat: FsStat::new(ino_max, blk_max),
            oper: OpStat::new(),
            rdst: IoStat::default(),
            wrst: IoStat::default(),
            uctx: Uctx::default(),
            times: Itimes {
                btime: now,
                atime: now,
                mtime: now,
                ctime: now,
            },
        }
    }

    pub fn settimes(&mut self, tf: TimeFlags) {
        let now = Tstamp::now();
        if tf.contains(TimeFlags::MTIME) {
            self.times.mtime = now;
        }
        if tf.contains(TimeFlags::ATIME) {
            self.times.atime = now;
        }
        if tf.contains(TimeFlags::CTIME) {
            self.times.ctime = now;
        }
    }

    pub fn is_rdonly(&self) -> bool {
        self.attr.mntf.contains(MntFlags::RDONLY)
    }

    pub fn getfsinfo(&self) -> FsInfo {
        FsInfo {
            uuid: self.attr.uuid,
            name: self.attr.name.clone(),
            blk_size: BLKSIZE,
            blk_total: self.stat.blk_max,
            blk_free: self.stat.blk_max.saturating_sub(self.stat.blk_used),
            ino_total: self.stat.ino_max,
            ino_free: self.stat.ino_max.saturating_sub(self.stat.ino_used),
            name_max: NAME_MAX as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_tracks_blocks_and_inos() {
        let mut stat = FsStat::new(10, 100);
        stat.account(Vtype::Reg, 1);
        stat.account(Vtype::Vbk, 1);
        stat.account(Vtype::Regseg, 1);
        assert_eq!(stat.ino_used, 1);
        assert_eq!(stat.blk_used, 3);

        stat.account(Vtype::Vbk, -1);
        assert_eq!(stat.blk_used, 2);
        assert_eq!(stat.vstat[Vtype::Vbk as usize], 0);
    }

    #[test]
    fn spares_hold_back_unprivileged_callers() {
        let mut stat = FsStat::new(3, 20);
        stat.ino_used = 1;
        assert!(stat.has_next_ino(true));
        assert!(!stat.has_next_ino(false));

        stat.blk_used = 3;
        assert!(stat.has_free_blocks(17, true));
        assert!(!stat.has_free_blocks(17, false));
    }

    #[test]
    fn cursors_advance_monotonically() {
        let mut stat = FsStat::new(10, 10);
        let base = stat.next_ino().unwrap();
        stat.stamp_ino(base);
        assert_eq!(stat.next_ino().unwrap(), base + 1);
        stat.stamp_ino(base); // stale stamp does not move the cursor back
        assert_eq!(stat.next_ino().unwrap(), base + 1);
    }
}
