use thiserror::Error;

/// Errors produced by the virtual processor.
///
/// The POSIX variants translate 1:1 to negative errnos at the FUSE boundary
/// (see [`FnxError::errno`]). The remaining variants are internal control
/// statuses: `Pend` and `Delay` suspend a task until block I/O or a commit
/// settles, `Eos` terminates directory enumeration, and `CacheMiss` routes a
/// vnode fetch to the storage stage path. None of the internal variants may
/// ever reach a client reply.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FnxError {
    #[error("operation not permitted")]
    Perm,
    #[error("permission denied")]
    Access,
    #[error("is a directory")]
    IsDir,
    #[error("not a directory")]
    NotDir,
    #[error("no such entry")]
    NoEnt,
    #[error("entry exists")]
    Exist,
    #[error("directory not empty")]
    NotEmpty,
    #[error("too many links")]
    MLink,
    #[error("bad file reference")]
    BadF,
    #[error("read-only file system")]
    RdOnly,
    #[error("no space left")]
    NoSpace,
    #[error("file too large")]
    FBig,
    #[error("invalid argument")]
    Inval,
    #[error("name too long")]
    NameTooLong,
    #[error("file table overflow")]
    NFile,
    #[error("operation not supported")]
    NotSup,
    #[error("illegal seek")]
    SPipe,
    #[error("I/O error")]
    Io,
    #[error("bad address")]
    Fault,
    #[error("resource busy")]
    Busy,
    /// Vnode not resident; caller must stage from storage.
    #[error("cache miss")]
    CacheMiss,
    /// Task must be re-queued and retried once block I/O lands.
    #[error("pending block I/O")]
    Pend,
    /// Commit still in flight; reply once the stream settles.
    #[error("commit in flight")]
    Delay,
    /// End-of-stream for directory enumeration.
    #[error("end of stream")]
    Eos,
}

pub type Result<T> = std::result::Result<T, FnxError>;

impl FnxError {
    /// The negative errno surfaced to the client, or `None` for the internal
    /// control statuses.
    pub fn errno(&self) -> Option<i32> {
        let e = match self {
            FnxError::Perm => libc::EPERM,
            FnxError::Access => libc::EACCES,
            FnxError::IsDir => libc::EISDIR,
            FnxError::NotDir => libc::ENOTDIR,
            FnxError::NoEnt => libc::ENOENT,
            FnxError::Exist => libc::EEXIST,
            FnxError::NotEmpty => libc::ENOTEMPTY,
            FnxError::MLink => libc::EMLINK,
            FnxError::BadF => libc::EBADF,
            FnxError::RdOnly => libc::EROFS,
            FnxError::NoSpace => libc::ENOSPC,
            FnxError::FBig => libc::EFBIG,
            FnxError::Inval => libc::EINVAL,
            FnxError::NameTooLong => libc::ENAMETOOLONG,
            FnxError::NFile => libc::ENFILE,
            FnxError::NotSup => libc::ENOTSUP,
            FnxError::SPipe => libc::ESPIPE,
            FnxError::Io => libc::EIO,
            FnxError::Fault => libc::EFAULT,
            FnxError::Busy => libc::EBUSY,
            FnxError::CacheMiss
            | FnxError::Pend
            | FnxError::Delay
            | FnxError::Eos => return None,
        };
        Some(-e)
    }

    /// True for the deferred statuses that suspend a task instead of
    /// producing a reply.
    pub fn is_deferred(&self) -> bool {
        matches!(self, FnxError::Pend | FnxError::Delay)
    }
}
