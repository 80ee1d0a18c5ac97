pub mod cache;
mod data;
pub mod error;
pub mod fileref;
mod guard;
mod namei;
mod opers;
pub mod pendq;
pub mod pstor;
mod rename;
pub mod task;
pub mod types;
pub mod vobj;
pub mod vproc;

pub use error::FnxError;
pub use fileref::{FrId, OpenFlags};
pub use pstor::{MemPstor, Pstor};
pub use task::{Job, Opcode, Request, Response, Task};
pub use types::{BLKSIZE, INO_ROOT, Ino, REGSIZE_MAX};
pub use vobj::inode::{Capf, SetAttrFlags, Uctx};
pub use vobj::superblock::{FsAttr, FsInfo, MntFlags};
pub use vproc::Vproc;
