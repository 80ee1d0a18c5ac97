use std::time::{SystemTime, UNIX_EPOCH};

use bitflags::bitflags;

use crate::types::{Ino, Name, Vtype, ino_vtype};

bitflags! {
    /// Capabilities relevant to the permission gate. Root holds all of them.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Capf: u32 {
        const CHOWN  = 1 << 0;
        const FOWNER = 1 << 1;
        const FSETID = 1 << 2;
        const ADMIN  = 1 << 3;
    }
}

bitflags! {
    /// Which attributes a SETATTR request carries.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SetAttrFlags: u32 {
        const MODE  = 1 << 0;
        const UID   = 1 << 1;
        const GID   = 1 << 2;
        const SIZE  = 1 << 3;
        const ATIME = 1 << 4;
        const MTIME = 1 << 5;
    }
}

impl SetAttrFlags {
    pub fn any_time(&self) -> bool {
        self.intersects(SetAttrFlags::ATIME | SetAttrFlags::MTIME)
    }
}

bitflags! {
    /// Which inode timestamps to refresh.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TimeFlags: u32 {
        const ATIME = 1 << 0;
        const MTIME = 1 << 1;
        const CTIME = 1 << 2;
        const BTIME = 1 << 3;
    }
}

impl TimeFlags {
    pub const AMCTIME: TimeFlags = TimeFlags::ATIME
        .union(TimeFlags::MTIME)
        .union(TimeFlags::CTIME);
    pub const MCTIME: TimeFlags = TimeFlags::MTIME.union(TimeFlags::CTIME);
    pub const ACTIME: TimeFlags = TimeFlags::ATIME.union(TimeFlags::CTIME);
}

/// User context attached to every task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Uctx {
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
    pub umask: u32,
    pub caps: Capf,
    pub root: bool,
    pub groups: Vec<u32>,
}

impl Uctx {
    pub fn new(uid: u32, gid: u32) -> Uctx {
        Uctx {
            uid,
            gid,
            root: uid == 0,
            umask: 0o022,
            ..Uctx::default()
        }
    }

    pub fn has_cap(&self, cap: Capf) -> bool {
        self.root || self.caps.contains(cap)
    }

    pub fn in_group(&self, gid: u32) -> bool {
        self.gid == gid || self.groups.contains(&gid)
    }

    pub fn is_privileged(&self) -> bool {
        self.root || self.caps.contains(Capf::ADMIN)
    }
}

/// Seconds + nanos since the epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Tstamp {
    pub secs: u64,
    pub nanos: u32,
}

impl Tstamp {
    pub fn now() -> Tstamp {
        let d = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Tstamp {
            secs: d.as_secs(),
            nanos: d.subsec_nanos(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Itimes {
    pub btime: Tstamp,
    pub atime: Tstamp,
    pub mtime: Tstamp,
    pub ctime: Tstamp,
}

/// Inode attributes; also the GETATTR/LOOKUP response payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Iattr {
    pub ino: Ino,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub size: u64,
    pub blocks: u64,
    pub rdev: u64,
    pub times: Itimes,
}

pub fn mode_isdir(mode: u32) -> bool {
    (mode & libc::S_IFMT) == libc::S_IFDIR
}

pub fn mode_isreg(mode: u32) -> bool {
    (mode & libc::S_IFMT) == libc::S_IFREG
}

pub fn mode_islnk(mode: u32) -> bool {
    (mode & libc::S_IFMT) == libc::S_IFLNK
}

pub fn mode_isspecial(mode: u32) -> bool {
    matches!(
        mode & libc::S_IFMT,
        libc::S_IFIFO | libc::S_IFSOCK | libc::S_IFCHR | libc::S_IFBLK
    )
}

pub fn mode_to_vtype(mode: u32) -> Vtype {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => Vtype::Dir,
        libc::S_IFREG => Vtype::Reg,
        libc::S_IFLNK => Vtype::Symlnk,
        libc::S_IFIFO | libc::S_IFSOCK | libc::S_IFCHR | libc::S_IFBLK => Vtype::Special,
        _ => Vtype::None,
    }
}

fn vtype_to_ifmt(vtype: Vtype) -> u32 {
    match vtype {
        Vtype::Dir => libc::S_IFDIR,
        Vtype::Symlnk => libc::S_IFLNK,
        _ => libc::S_IFREG,
    }
}

/// Common state of every inode-bearing vnode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inode {
    pub iattr: Iattr,
    /// Name of the single namespace binding, set when linked.
    pub name: Name,
    /// Target ino for reflnk inodes; `INO_NULL` otherwise.
    pub refino: Ino,
    /// Pseudo inode advertises meta-write support.
    pub meta: bool,
}

impl Inode {
    /// Fresh inode with ownership and permission bits taken from the caller.
    pub fn setup(ino: Ino, uctx: &Uctx, mode: u32, rdev: u64) -> Inode {
        let vtype = ino_vtype(ino);
        let now = Tstamp::now();
        let fmt = if mode & libc::S_IFMT != 0 {
            mode & libc::S_IFMT
        } else {
            vtype_to_ifmt(vtype)
        };
        let perm = (mode & 0o7777) & !uctx.umask;
        // Unbound base count; linking bumps it (a dir starts with its self
        // entry already counted).
        let nlink = if vtype == Vtype::Dir { 1 } else { 0 };
        Inode {
            iattr: Iattr {
                ino,
                mode: fmt | perm,
                uid: uctx.uid,
                gid: uctx.gid,
                nlink,
                rdev,
                times: Itimes {
                    btime: now,
                    atime: now,
                    mtime: now,
                    ctime: now,
                },
                ..Iattr::default()
            },
            ..Inode::default()
        }
    }

    pub fn ino(&self) -> Ino {
        self.iattr.ino
    }

    pub fn vtype(&self) -> Vtype {
        ino_vtype(self.iattr.ino)
    }

    pub fn is_reflnk(&self) -> bool {
        self.vtype() == Vtype::Reflnk
    }

    /// Link-accounting target: the ref target for a reflnk, self otherwise.
    pub fn refino_or_self(&self) -> Ino {
        if self.is_reflnk() { self.refino } else { self.ino() }
    }

    pub fn has_name(&self, s: &str) -> bool {
        self.name.s == s
    }

    pub fn size(&self) -> u64 {
        self.iattr.size
    }

    pub fn set_size(&mut self, size: u64) {
        self.iattr.size = size;
    }

    pub fn is_owner(&self, uctx: &Uctx) -> bool {
        self.iattr.uid == uctx.uid
    }

    pub fn is_exec(&self) -> bool {
        (self.iattr.mode & 0o111) != 0
    }

    pub fn setitime(&mut self, tf: TimeFlags) {
        let now = Tstamp::now();
        if tf.contains(TimeFlags::ATIME) {
            self.iattr.times.atime = now;
        }
        if tf.contains(TimeFlags::MTIME) {
            self.iattr.times.mtime = now;
        }
        if tf.contains(TimeFlags::CTIME) {
            self.iattr.times.ctime = now;
        }
        if tf.contains(TimeFlags::BTIME) {
            self.iattr.times.btime = now;
        }
    }

    pub fn set_times(&mut self, tf: SetAttrFlags, times: &Itimes) {
        if tf.contains(SetAttrFlags::ATIME) {
            self.iattr.times.atime = times.atime;
        }
        if tf.contains(SetAttrFlags::MTIME) {
            self.iattr.times.mtime = times.mtime;
        }
    }

    /// POSIX class-based permission check. `mask` is an `R_OK`/`W_OK`/`X_OK`
    /// combination.
    pub fn access(&self, uctx: &Uctx, mask: u32) -> bool {
        if uctx.root {
            // Root bypasses rw checks; exec still wants some x bit on files.
            if (mask & libc::X_OK as u32) != 0 && !mode_isdir(self.iattr.mode) {
                return self.is_exec();
            }
            return true;
        }
        let mode = self.iattr.mode;
        let perm = if self.iattr.uid == uctx.uid {
            (mode >> 6) & 0o7
        } else if uctx.in_group(self.iattr.gid) {
            (mode >> 3) & 0o7
        } else {
            mode & 0o7
        };
        (mask & !perm) == 0
    }

    pub fn clear_suid(&mut self) {
        self.iattr.mode &= !libc::S_ISUID;
    }

    pub fn clear_sgid(&mut self) {
        self.iattr.mode &= !libc::S_ISGID;
    }

    /// Drop SUID from an executable regular file mutated by a caller
    /// without `CHOWN`.
    pub fn refresh_suid(&mut self, uctx: &Uctx) {
        if mode_isreg(self.iattr.mode) && self.is_exec() && !uctx.has_cap(Capf::CHOWN) {
            self.clear_suid();
        }
    }

    /// Drop SGID when the mutating caller is outside the owning group and
    /// lacks `FSETID`.
    pub fn refresh_sgid(&mut self, uctx: &Uctx) {
        if !uctx.in_group(self.iattr.gid) && !uctx.has_cap(Capf::FSETID) {
            self.clear_sgid();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ino_create;

    fn mkinode(uid: u32, gid: u32, mode: u32) -> Inode {
        let mut uctx = Uctx::new(uid, gid);
        uctx.umask = 0;
        Inode::setup(ino_create(5, Vtype::Reg), &uctx, libc::S_IFREG | mode, 0)
    }

    #[test]
    fn access_uses_owner_group_other_classes() {
        let inode = mkinode(100, 100, 0o640);
        let owner = Uctx::new(100, 100);
        let group = Uctx::new(101, 100);
        let other = Uctx::new(102, 102);

        assert!(inode.access(&owner, libc::W_OK as u32));
        assert!(inode.access(&group, libc::R_OK as u32));
        assert!(!inode.access(&group, libc::W_OK as u32));
        assert!(!inode.access(&other, libc::R_OK as u32));
    }

    #[test]
    fn root_exec_still_wants_an_x_bit() {
        let inode = mkinode(100, 100, 0o644);
        let root = Uctx::new(0, 0);
        assert!(inode.access(&root, libc::W_OK as u32));
        assert!(!inode.access(&root, libc::X_OK as u32));

        let exe = mkinode(100, 100, 0o744);
        assert!(exe.access(&root, libc::X_OK as u32));
    }

    #[test]
    fn refresh_clears_setid_bits_for_unprivileged_mutators() {
        let mut inode = mkinode(100, 100, 0o6755);
        let other = Uctx::new(101, 101);
        inode.refresh_suid(&other);
        inode.refresh_sgid(&other);
        assert_eq!(inode.iattr.mode & (libc::S_ISUID | libc::S_ISGID), 0);

        // Root holds CHOWN and FSETID; the bits survive.
        let mut keeper = mkinode(100, 100, 0o6755);
        let root = Uctx::new(0, 0);
        keeper.refresh_suid(&root);
        keeper.refresh_sgid(&root);
        assert_ne!(keeper.iattr.mode & libc::S_ISUID, 0);
        assert_ne!(keeper.iattr.mode & libc::S_ISGID, 0);
    }

    #[test]
    fn setup_applies_umask_and_base_nlink() {
        let uctx = Uctx::new(100, 100);
        let reg = Inode::setup(ino_create(7, Vtype::Reg), &uctx, libc::S_IFREG | 0o666, 0);
        assert_eq!(reg.iattr.mode & 0o777, 0o644);
        assert_eq!(reg.iattr.nlink, 0);

        let dir = Inode::setup(ino_create(8, Vtype::Dir), &uctx, libc::S_IFDIR | 0o777, 0);
        assert_eq!(dir.iattr.nlink, 1);
    }
}
