use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use fnxvproc::pstor::{MemPstor, Pstor};
use fnxvproc::task::{Job, Request, Response, Task};
use fnxvproc::types::{BLKSIZE, DOFF_NONE, DOFF_SELF, Doff, INO_NULL, INO_ROOT, Ino, ino_vtype};
use fnxvproc::vobj::bkref::BkrefRef;
use fnxvproc::vobj::inode::{Iattr, SetAttrFlags, Uctx};
use fnxvproc::vobj::superblock::{FsAttr, FsInfo, MntFlags};
use fnxvproc::vobj::vnode::VnodeRef;
use fnxvproc::{FnxError, FrId, OpenFlags, Vproc};

/// Storage handle shared between the engine and the test so the suite can
/// observe commits and drive the slave queue.
#[derive(Clone)]
struct SharedPstor(Rc<RefCell<MemPstor>>);

impl SharedPstor {
    fn new(blk_max: usize) -> SharedPstor {
        SharedPstor(Rc::new(RefCell::new(MemPstor::new(blk_max))))
    }

    fn commits(&self) -> u64 {
        self.0.borrow().commits
    }

    fn push_sbk(&self, bk: BkrefRef) {
        self.0.borrow_mut().push_sbk(bk);
    }
}

impl Pstor for SharedPstor {
    fn spawn_vnode(
        &mut self,
        vaddr: &fnxvproc::types::Vaddr,
        bkref: Option<BkrefRef>,
    ) -> Result<VnodeRef, FnxError> {
        self.0.borrow_mut().spawn_vnode(vaddr, bkref)
    }
    fn stage_vnode(&mut self, vaddr: &fnxvproc::types::Vaddr) -> Result<VnodeRef, FnxError> {
        self.0.borrow_mut().stage_vnode(vaddr)
    }
    fn commit_vnode(&mut self, vnode: &VnodeRef) -> Result<(), FnxError> {
        self.0.borrow_mut().commit_vnode(vnode)
    }
    fn unmap_vnode(&mut self, vnode: &VnodeRef) -> Result<(), FnxError> {
        self.0.borrow_mut().unmap_vnode(vnode)
    }
    fn retire_vnode(&mut self, vnode: VnodeRef) {
        self.0.borrow_mut().retire_vnode(vnode)
    }
    fn retire_bk(&mut self, bkref: BkrefRef) {
        self.0.borrow_mut().retire_bk(bkref)
    }
    fn require_vaddr(&mut self, vaddr: &fnxvproc::types::Vaddr) -> Result<(), FnxError> {
        self.0.borrow_mut().require_vaddr(vaddr)
    }
    fn sync(&mut self) -> Result<(), FnxError> {
        self.0.borrow_mut().sync()
    }
    fn sync_vnode(&mut self, vnode: &VnodeRef) -> Result<(), FnxError> {
        self.0.borrow_mut().sync_vnode(vnode)
    }
    fn pop_sbk(&mut self) -> Option<BkrefRef> {
        self.0.borrow_mut().pop_sbk()
    }
    fn pop_staged(&mut self) -> Option<VnodeRef> {
        self.0.borrow_mut().pop_staged()
    }
    fn sbkq_len(&self) -> usize {
        self.0.borrow().sbkq_len()
    }
}

/// One mounted volume plus the outbound job queue.
struct Fs {
    vproc: Vproc,
    out: Rc<RefCell<VecDeque<Job>>>,
    pstor: SharedPstor,
    uctx: Uctx,
}

impl Fs {
    fn mount() -> Fs {
        Fs::mount_with(MntFlags::empty())
    }

    fn mount_with(mntf: MntFlags) -> Fs {
        let _ = env_logger::builder().is_test(true).try_init();
        let uctx = Uctx::new(0, 0);
        let pstor = SharedPstor::new(4096);
        pstor
            .0
            .borrow_mut()
            .format(FsAttr::default(), &uctx, 512)
            .expect("format");
        Fs::remount(pstor, mntf)
    }

    /// Attach a fresh engine to already-formatted storage.
    fn remount(pstor: SharedPstor, mntf: MntFlags) -> Fs {
        let uctx = Uctx::new(0, 0);
        let out: Rc<RefCell<VecDeque<Job>>> = Rc::new(RefCell::new(VecDeque::new()));
        let sink = {
            let out = out.clone();
            Box::new(move |job| out.borrow_mut().push_back(job))
        };
        let mut vproc = Vproc::new(Box::new(pstor.clone()), sink);
        vproc.open_namespace(&uctx, mntf).expect("open namespace");
        Fs {
            vproc,
            out,
            pstor,
            uctx,
        }
    }

    fn pop_exec_res(&mut self) -> Task {
        loop {
            match self.out.borrow_mut().pop_front() {
                Some(Job::TaskExecRes(task)) => return task,
                Some(_) => continue,
                None => panic!("no exec response pending"),
            }
        }
    }

    fn submit(&mut self, task: Task) -> Task {
        self.vproc.exec_job(Job::TaskExecReq(task));
        self.pop_exec_res()
    }

    fn run_as(&mut self, uctx: &Uctx, request: Request) -> Task {
        self.submit(Task::new(uctx, request))
    }

    fn run(&mut self, request: Request) -> Task {
        let uctx = self.uctx.clone();
        self.run_as(&uctx, request)
    }

    fn expect_ok(&mut self, request: Request) -> Task {
        let task = self.run(request);
        task.status.expect("operation failed");
        task
    }

    fn expect_err(&mut self, request: Request) -> FnxError {
        self.run(request).status.expect_err("operation succeeded")
    }

    // -- convenience wrappers -------------------------------------------

    fn mkdir(&mut self, parent: Ino, name: &str) -> Ino {
        let task = self.expect_ok(Request::Mkdir {
            parent,
            name: name.into(),
            mode: 0o755,
        });
        match task.response {
            Response::Iattr { iattr } => iattr.ino,
            other => panic!("unexpected mkdir response {other:?}"),
        }
    }

    fn create(&mut self, parent: Ino, name: &str) -> (Ino, FrId) {
        let task = self.expect_ok(Request::Create {
            parent,
            name: name.into(),
            mode: libc::S_IFREG | 0o644,
            flags: OpenFlags::RDWR,
        });
        match task.response {
            Response::Create { iattr, fh } => (iattr.ino, fh),
            other => panic!("unexpected create response {other:?}"),
        }
    }

    fn mkfifo(&mut self, parent: Ino, name: &str) -> Ino {
        let task = self.expect_ok(Request::Mknod {
            parent,
            name: name.into(),
            mode: libc::S_IFIFO | 0o644,
            rdev: 0,
        });
        match task.response {
            Response::Iattr { iattr } => iattr.ino,
            other => panic!("unexpected mknod response {other:?}"),
        }
    }

    fn write(&mut self, ino: Ino, fh: FrId, off: u64, data: &[u8]) -> u64 {
        let uctx = self.uctx.clone();
        let task = self.submit(Task::new_write(&uctx, ino, fh, off, data));
        task.status.expect("write failed");
        match task.response {
            Response::Write { size } => size,
            other => panic!("unexpected write response {other:?}"),
        }
    }

    fn read(&mut self, ino: Ino, fh: FrId, off: u64, size: u64) -> Vec<u8> {
        let task = self.expect_ok(Request::Read { ino, fh, off, size });
        let data = task.iobufs.collect();
        match task.response {
            Response::Read { size } => assert_eq!(size as usize, data.len()),
            ref other => panic!("unexpected read response {other:?}"),
        }
        // Hand the task back so the block references drop.
        self.vproc.exec_job(Job::TaskFiniReq(task));
        loop {
            match self.out.borrow_mut().pop_front() {
                Some(Job::TaskFiniRes(_)) => break,
                Some(_) => continue,
                None => panic!("no fini response"),
            }
        }
        data
    }

    fn getattr(&mut self, ino: Ino) -> Iattr {
        let task = self.expect_ok(Request::Getattr { ino });
        match task.response {
            Response::Iattr { iattr } => iattr,
            other => panic!("unexpected getattr response {other:?}"),
        }
    }

    fn lookup(&mut self, parent: Ino, name: &str) -> Result<Iattr, FnxError> {
        let task = self.run(Request::Lookup {
            parent,
            name: name.into(),
        });
        task.status?;
        match task.response {
            Response::Iattr { iattr } => Ok(iattr),
            other => panic!("unexpected lookup response {other:?}"),
        }
    }

    fn release(&mut self, ino: Ino, fh: FrId) {
        self.expect_ok(Request::Release {
            ino,
            fh,
            flags: OpenFlags::empty(),
        });
    }

    fn unlink(&mut self, parent: Ino, name: &str) {
        self.expect_ok(Request::Unlink {
            parent,
            name: name.into(),
        });
    }

    fn statfs(&mut self) -> FsInfo {
        let task = self.expect_ok(Request::Statfs { ino: INO_ROOT });
        match task.response {
            Response::Fsinfo { fsinfo } => fsinfo,
            other => panic!("unexpected statfs response {other:?}"),
        }
    }

    /// Full readdir sweep: opendir, iterate feeding next offsets back,
    /// releasedir; returns the yielded names in order.
    fn readdir_all(&mut self, ino: Ino) -> Vec<String> {
        let task = self.expect_ok(Request::Opendir { ino });
        let fh = match task.response {
            Response::Opendir { fh } => fh,
            other => panic!("unexpected opendir response {other:?}"),
        };

        let mut names = Vec::new();
        let mut off: Doff = DOFF_SELF;
        loop {
            let task = self.expect_ok(Request::Readdir { ino, fh, off });
            let (name, child, next) = match task.response {
                Response::Readdir {
                    name, child, next, ..
                } => (name, child, next),
                other => panic!("unexpected readdir response {other:?}"),
            };
            if child == INO_NULL {
                break;
            }
            names.push(name);
            if next == DOFF_NONE {
                break;
            }
            off = next;
        }
        self.expect_ok(Request::Releasedir { ino, fh });
        names
    }
}

// ---------------------------------------------------------------------------
// Create, write, read, unlink
// ---------------------------------------------------------------------------

#[test]
fn create_write_read_unlink_roundtrip() {
    let mut fs = Fs::mount();

    let d = fs.mkdir(INO_ROOT, "d");
    let (f, fh) = fs.create(d, "f");
    assert_eq!(fs.getattr(f).size, 0);

    assert_eq!(fs.write(f, fh, 0, b"hello"), 5);
    assert_eq!(fs.read(f, fh, 0, 16), b"hello");

    let iattr = fs.getattr(f);
    assert_eq!(iattr.size, 5);
    assert_eq!(iattr.nlink, 1);

    fs.release(f, fh);
    fs.unlink(d, "f");
    assert_eq!(fs.lookup(d, "f").unwrap_err(), FnxError::NoEnt);

    fs.expect_ok(Request::Rmdir {
        parent: INO_ROOT,
        name: "d".into(),
    });
    assert_eq!(fs.lookup(INO_ROOT, "d").unwrap_err(), FnxError::NoEnt);
}

#[test]
fn created_inos_carry_their_vtype() {
    let mut fs = Fs::mount();
    let d = fs.mkdir(INO_ROOT, "dir");
    let (f, fh) = fs.create(d, "file");
    assert_eq!(ino_vtype(d), fnxvproc::types::Vtype::Dir);
    assert_eq!(ino_vtype(f), fnxvproc::types::Vtype::Reg);
    fs.release(f, fh);
}

#[test]
fn write_is_serialized_with_read_on_same_channel() {
    let mut fs = Fs::mount();
    let (f, fh) = fs.create(INO_ROOT, "f");

    fs.write(f, fh, 0, b"xxxxxxxxxx");
    fs.write(f, fh, 3, b"YY");
    assert_eq!(fs.read(f, fh, 0, 10), b"xxxYYxxxxx");
    fs.release(f, fh);
}

#[test]
fn write_spanning_blocks_roundtrips() {
    let mut fs = Fs::mount();
    let (f, fh) = fs.create(INO_ROOT, "f");

    let data: Vec<u8> = (0..100u32).map(|i| i as u8).collect();
    let off = BLKSIZE - 50;
    assert_eq!(fs.write(f, fh, off, &data), 100);
    assert_eq!(fs.read(f, fh, off, 100), data);
    assert_eq!(fs.getattr(f).blocks, 2);
    fs.release(f, fh);
}

// ---------------------------------------------------------------------------
// Sparse files and punch
// ---------------------------------------------------------------------------

#[test]
fn sparse_write_and_punch() {
    let mut fs = Fs::mount();
    let (f, fh) = fs.create(INO_ROOT, "sparse");

    fs.write(f, fh, 0, b"a");
    fs.write(f, fh, 3 * BLKSIZE, b"b");

    let iattr = fs.getattr(f);
    assert_eq!(iattr.size, 3 * BLKSIZE + 1);
    assert_eq!(iattr.blocks, 2);

    fs.expect_ok(Request::Punch {
        ino: f,
        fh,
        off: 0,
        len: 3 * BLKSIZE,
    });
    let iattr = fs.getattr(f);
    assert_eq!(iattr.blocks, 1, "only the tail block should remain");
    assert_eq!(iattr.size, 3 * BLKSIZE + 1, "punch must not change the size");

    assert_eq!(fs.read(f, fh, 0, 16), vec![0u8; 16]);
    fs.release(f, fh);
}

#[test]
fn punched_holes_read_as_zeros_but_tail_survives() {
    let mut fs = Fs::mount();
    let (f, fh) = fs.create(INO_ROOT, "f");

    fs.write(f, fh, 0, &vec![7u8; 2 * BLKSIZE as usize]);
    fs.expect_ok(Request::Punch {
        ino: f,
        fh,
        off: 0,
        len: BLKSIZE,
    });

    let head = fs.read(f, fh, 0, BLKSIZE);
    assert!(head.iter().all(|&b| b == 0));
    let tail = fs.read(f, fh, BLKSIZE, BLKSIZE);
    assert!(tail.iter().all(|&b| b == 7));
    fs.release(f, fh);
}

// ---------------------------------------------------------------------------
// Truncate
// ---------------------------------------------------------------------------

#[test]
fn truncate_is_idempotent() {
    let mut fs = Fs::mount();
    let (f, fh) = fs.create(INO_ROOT, "t");
    fs.write(f, fh, 0, &vec![1u8; 3 * BLKSIZE as usize]);
    fs.release(f, fh);

    fs.expect_ok(Request::Truncate { ino: f, size: 10 });
    let first = fs.getattr(f);
    fs.expect_ok(Request::Truncate { ino: f, size: 10 });
    let second = fs.getattr(f);

    assert_eq!(first.size, 10);
    assert_eq!(second.size, 10);
    assert_eq!(first.blocks, second.blocks);
}

#[test]
fn truncate_shrinks_blocks_and_grow_is_sparse() {
    let mut fs = Fs::mount();
    let (f, fh) = fs.create(INO_ROOT, "t");
    fs.write(f, fh, 0, &vec![1u8; 3 * BLKSIZE as usize]);
    fs.release(f, fh);
    assert_eq!(fs.getattr(f).blocks, 3);

    fs.expect_ok(Request::Truncate { ino: f, size: BLKSIZE });
    let iattr = fs.getattr(f);
    assert_eq!(iattr.size, BLKSIZE);
    assert_eq!(iattr.blocks, 1);

    fs.expect_ok(Request::Truncate {
        ino: f,
        size: 10 * BLKSIZE,
    });
    let iattr = fs.getattr(f);
    assert_eq!(iattr.size, 10 * BLKSIZE);
    assert_eq!(iattr.blocks, 1, "growth must not allocate");
}

#[test]
fn setattr_size_routes_through_the_data_path() {
    let mut fs = Fs::mount();
    let (f, fh) = fs.create(INO_ROOT, "s");
    fs.write(f, fh, 0, &vec![9u8; 2 * BLKSIZE as usize]);
    fs.release(f, fh);

    fs.expect_ok(Request::Setattr {
        ino: f,
        flags: SetAttrFlags::SIZE,
        mode: 0,
        uid: 0,
        gid: 0,
        size: 1,
        times: Default::default(),
    });
    let iattr = fs.getattr(f);
    assert_eq!(iattr.size, 1);
    assert_eq!(iattr.blocks, 1);
}

// ---------------------------------------------------------------------------
// Fallocate
// ---------------------------------------------------------------------------

#[test]
fn fallocate_reserves_mapping_without_blocks() {
    let mut fs = Fs::mount();
    let (f, fh) = fs.create(INO_ROOT, "fa");

    fs.expect_ok(Request::Fallocate {
        ino: f,
        fh,
        off: 0,
        len: 4 * BLKSIZE,
        keep_size: false,
    });
    let iattr = fs.getattr(f);
    assert_eq!(iattr.size, 4 * BLKSIZE);
    assert_eq!(iattr.blocks, 0);

    fs.expect_ok(Request::Fallocate {
        ino: f,
        fh,
        off: 8 * BLKSIZE,
        len: BLKSIZE,
        keep_size: true,
    });
    assert_eq!(fs.getattr(f).size, 4 * BLKSIZE, "keep_size holds the size");
    fs.release(f, fh);
}

// ---------------------------------------------------------------------------
// Rename
// ---------------------------------------------------------------------------

#[test]
fn rename_inplace_rebinds_the_same_ino() {
    let mut fs = Fs::mount();
    let d = fs.mkdir(INO_ROOT, "d");
    let (f, fh) = fs.create(d, "x");
    fs.write(f, fh, 0, b"X");
    fs.release(f, fh);

    fs.expect_ok(Request::Rename {
        parent: d,
        name: "x".into(),
        newparent: d,
        newname: "x2".into(),
    });
    assert_eq!(fs.lookup(d, "x").unwrap_err(), FnxError::NoEnt);
    assert_eq!(fs.lookup(d, "x2").unwrap().ino, f);
}

#[test]
fn rename_onto_itself_is_a_noop() {
    let mut fs = Fs::mount();
    let d = fs.mkdir(INO_ROOT, "d");
    let (f, fh) = fs.create(d, "x");
    fs.release(f, fh);

    fs.expect_ok(Request::Rename {
        parent: d,
        name: "x".into(),
        newparent: d,
        newname: "x".into(),
    });
    assert_eq!(fs.lookup(d, "x").unwrap().ino, f);
}

#[test]
fn rename_across_dirs_with_override_drops_the_target() {
    let mut fs = Fs::mount();
    let a = fs.mkdir(INO_ROOT, "a");
    let b = fs.mkdir(INO_ROOT, "b");

    let (x, xfh) = fs.create(a, "x");
    fs.write(x, xfh, 0, b"X");
    fs.release(x, xfh);

    let (y, yfh) = fs.create(b, "y");
    fs.write(y, yfh, 0, b"Y");
    fs.release(y, yfh);

    let free_before = fs.statfs().blk_free;

    fs.expect_ok(Request::Rename {
        parent: a,
        name: "x".into(),
        newparent: b,
        newname: "y".into(),
    });

    // The destination now resolves to the moved ino with its content.
    assert_eq!(fs.lookup(b, "y").unwrap().ino, x);
    assert_eq!(fs.lookup(a, "x").unwrap_err(), FnxError::NoEnt);

    let task = fs.expect_ok(Request::Open {
        ino: x,
        flags: OpenFlags::empty(),
    });
    let fh = match task.response {
        Response::Open { fh } => fh,
        other => panic!("unexpected open response {other:?}"),
    };
    assert_eq!(fs.read(x, fh, 0, 4), b"X");
    fs.release(x, fh);

    // The overridden ino is gone and its blocks are reclaimed.
    assert_eq!(fs.run(Request::Getattr { ino: y }).status, Err(FnxError::NoEnt));
    assert!(fs.statfs().blk_free > free_before, "target blocks reclaimed");
}

#[test]
fn rename_directory_into_own_subtree_is_rejected() {
    let mut fs = Fs::mount();
    let a = fs.mkdir(INO_ROOT, "a");
    let b = fs.mkdir(a, "b");

    let err = fs.expect_err(Request::Rename {
        parent: INO_ROOT,
        name: "a".into(),
        newparent: b,
        newname: "a2".into(),
    });
    assert_eq!(err, FnxError::Inval);
}

#[test]
fn rename_moves_directory_and_fixes_parent_links() {
    let mut fs = Fs::mount();
    let a = fs.mkdir(INO_ROOT, "a");
    let b = fs.mkdir(INO_ROOT, "b");
    let sub = fs.mkdir(a, "sub");

    assert_eq!(fs.getattr(a).nlink, 3);
    assert_eq!(fs.getattr(b).nlink, 2);

    fs.expect_ok(Request::Rename {
        parent: a,
        name: "sub".into(),
        newparent: b,
        newname: "sub".into(),
    });
    assert_eq!(fs.getattr(a).nlink, 2);
    assert_eq!(fs.getattr(b).nlink, 3);
    assert_eq!(fs.lookup(b, "sub").unwrap().ino, sub);
}

// ---------------------------------------------------------------------------
// Hard links
// ---------------------------------------------------------------------------

#[test]
fn hardlink_and_unlink_accounting() {
    let mut fs = Fs::mount();
    let d = fs.mkdir(INO_ROOT, "d");
    let (f, fh) = fs.create(d, "f");
    fs.write(f, fh, 0, b"data");
    fs.release(f, fh);

    let task = fs.expect_ok(Request::Link {
        ino: f,
        newparent: d,
        newname: "g".into(),
    });
    match task.response {
        Response::Iattr { iattr } => {
            assert_eq!(iattr.ino, f);
            assert_eq!(iattr.nlink, 2);
        }
        other => panic!("unexpected link response {other:?}"),
    }

    // Lookup through the link resolves to the target ino.
    assert_eq!(fs.lookup(d, "g").unwrap().ino, f);

    fs.unlink(d, "g");
    assert_eq!(fs.getattr(f).nlink, 1);
    assert_eq!(fs.lookup(d, "g").unwrap_err(), FnxError::NoEnt);

    // The original binding and data are untouched.
    assert_eq!(fs.lookup(d, "f").unwrap().ino, f);
}

#[test]
fn unlink_of_last_link_reclaims_data() {
    let mut fs = Fs::mount();
    let (f, fh) = fs.create(INO_ROOT, "f");
    fs.write(f, fh, 0, &vec![3u8; 2 * BLKSIZE as usize]);
    fs.release(f, fh);

    let free_before = fs.statfs().blk_free;
    fs.unlink(INO_ROOT, "f");
    assert!(fs.statfs().blk_free > free_before);
    assert_eq!(fs.run(Request::Getattr { ino: f }).status, Err(FnxError::NoEnt));
}

#[test]
fn unlink_while_open_defers_reclaim_to_release() {
    let mut fs = Fs::mount();
    let (f, fh) = fs.create(INO_ROOT, "f");
    fs.write(f, fh, 0, b"still here");
    fs.unlink(INO_ROOT, "f");

    // Data remains readable through the open fileref.
    assert_eq!(fs.read(f, fh, 0, 10), b"still here");

    fs.release(f, fh);
    assert_eq!(fs.run(Request::Getattr { ino: f }).status, Err(FnxError::NoEnt));
}

// ---------------------------------------------------------------------------
// Readdir
// ---------------------------------------------------------------------------

#[test]
fn readdir_yields_every_entry_exactly_once() {
    let mut fs = Fs::mount();
    let d = fs.mkdir(INO_ROOT, "dir");

    let mut expected: Vec<String> = Vec::new();
    for i in 0..10 {
        let name = format!("n{i}");
        fs.mkfifo(d, &name);
        expected.push(name);
    }

    let names = fs.readdir_all(d);
    assert_eq!(names[0], ".");
    assert_eq!(names[1], "..");

    let mut yielded: Vec<&str> = names[2..].iter().map(String::as_str).collect();
    yielded.sort_unstable();
    let mut want: Vec<&str> = expected.iter().map(String::as_str).collect();
    want.sort_unstable();
    assert_eq!(yielded, want, "every created name exactly once");
}

#[test]
fn readdir_on_root_trails_the_pseudo_root() {
    let mut fs = Fs::mount();
    fs.mkdir(INO_ROOT, "d");

    let names = fs.readdir_all(INO_ROOT);
    assert_eq!(names.last().map(String::as_str), Some(".fnx"));
    assert!(names.contains(&"d".to_string()));
}

// ---------------------------------------------------------------------------
// Pseudo namespace
// ---------------------------------------------------------------------------

#[test]
fn pseudo_root_resolves_but_rejects_mutation() {
    let mut fs = Fs::mount();

    let ps = fs.lookup(INO_ROOT, ".fnx").expect("pseudo root");
    assert_eq!(ps.ino, fnxvproc::types::INO_PSROOT);

    let err = fs.expect_err(Request::Mkdir {
        parent: ps.ino,
        name: "x".into(),
        mode: 0o755,
    });
    assert_eq!(err, FnxError::Perm);

    // Never accounted: creating and removing it leaves fsinfo alone.
    let info = fs.statfs();
    assert!(info.ino_free > 0);
}

// ---------------------------------------------------------------------------
// Permission gate
// ---------------------------------------------------------------------------

#[test]
fn access_checks_use_mode_classes() {
    let mut fs = Fs::mount();
    let (f, fh) = fs.create(INO_ROOT, "secret");
    fs.release(f, fh);
    fs.expect_ok(Request::Setattr {
        ino: f,
        flags: SetAttrFlags::MODE,
        mode: 0o600,
        uid: 0,
        gid: 0,
        size: 0,
        times: Default::default(),
    });

    let user = Uctx::new(1001, 1001);
    let denied = fs
        .run_as(&user, Request::Access {
            ino: f,
            mask: libc::R_OK as u32,
        })
        .status;
    assert_eq!(denied, Err(FnxError::Access));

    let opened = fs
        .run_as(&user, Request::Open {
            ino: f,
            flags: OpenFlags::empty(),
        })
        .status;
    assert_eq!(opened, Err(FnxError::Access));
}

#[test]
fn write_by_unprivileged_caller_clears_setid_bits() {
    let mut fs = Fs::mount();
    let (f, fh) = fs.create(INO_ROOT, "tool");
    fs.release(f, fh);
    fs.expect_ok(Request::Setattr {
        ino: f,
        flags: SetAttrFlags::MODE,
        mode: 0o6777,
        uid: 0,
        gid: 0,
        size: 0,
        times: Default::default(),
    });
    let setid = libc::S_ISUID | libc::S_ISGID;
    assert_eq!(fs.getattr(f).mode & setid, setid);

    // Root carries CHOWN and FSETID; its write leaves the bits alone.
    let task = fs.expect_ok(Request::Open {
        ino: f,
        flags: OpenFlags::RDWR,
    });
    let rfh = match task.response {
        Response::Open { fh } => fh,
        other => panic!("unexpected open response {other:?}"),
    };
    fs.write(f, rfh, 0, b"root");
    assert_eq!(fs.getattr(f).mode & setid, setid);
    fs.release(f, rfh);

    let alice = Uctx::new(1001, 1001);
    let task = fs.run_as(&alice, Request::Open {
        ino: f,
        flags: OpenFlags::RDWR,
    });
    task.status.expect("alice open");
    let afh = match task.response {
        Response::Open { fh } => fh,
        other => panic!("unexpected open response {other:?}"),
    };
    let wtask = fs.submit(Task::new_write(&alice, f, afh, 0, b"alice"));
    wtask.status.expect("alice write");

    let mode = fs.getattr(f).mode;
    assert_eq!(mode & libc::S_ISUID, 0, "suid cleared by write");
    assert_eq!(mode & libc::S_ISGID, 0, "sgid cleared by write");

    fs.run_as(&alice, Request::Release {
        ino: f,
        fh: afh,
        flags: OpenFlags::empty(),
    })
    .status
    .expect("alice release");
}

#[test]
fn sticky_dir_restricts_unlink_to_owners() {
    let mut fs = Fs::mount();
    let tmp = fs.mkdir(INO_ROOT, "tmp");
    fs.expect_ok(Request::Setattr {
        ino: tmp,
        flags: SetAttrFlags::MODE,
        mode: 0o1777,
        uid: 0,
        gid: 0,
        size: 0,
        times: Default::default(),
    });

    let alice = Uctx::new(1001, 1001);
    let bob = Uctx::new(1002, 1002);

    fs.run_as(&alice, Request::Mknod {
        parent: tmp,
        name: "af".into(),
        mode: libc::S_IFIFO | 0o644,
        rdev: 0,
    })
    .status
    .expect("alice mknod");

    let denied = fs
        .run_as(&bob, Request::Unlink {
            parent: tmp,
            name: "af".into(),
        })
        .status;
    assert_eq!(denied, Err(FnxError::Perm));

    fs.run_as(&alice, Request::Unlink {
        parent: tmp,
        name: "af".into(),
    })
    .status
    .expect("alice unlink");
}

#[test]
fn rdonly_mount_refuses_mutation() {
    let mut fs = Fs::mount_with(MntFlags::RDONLY);
    let err = fs.expect_err(Request::Mkdir {
        parent: INO_ROOT,
        name: "d".into(),
        mode: 0o755,
    });
    assert_eq!(err, FnxError::RdOnly);
    assert!(fs.readdir_all(INO_ROOT).len() >= 2);
}

// ---------------------------------------------------------------------------
// Rollback on namespace exhaustion
// ---------------------------------------------------------------------------

#[test]
fn full_directory_rejects_with_emlink_and_rolls_back() {
    let mut fs = Fs::mount();
    let d = fs.mkdir(INO_ROOT, "full");

    for i in 0..fnxvproc::types::DIRCHILD_MAX {
        fs.mkfifo(d, &format!("c{i}"));
    }

    let before = fs.statfs();
    let names_before = fs.readdir_all(d).len();

    let err = fs.expect_err(Request::Mknod {
        parent: d,
        name: "one-more".into(),
        mode: libc::S_IFREG | 0o644,
        rdev: 0,
    });
    assert_eq!(err, FnxError::MLink);

    let after = fs.statfs();
    assert_eq!(before.ino_free, after.ino_free, "ino counter untouched");
    assert_eq!(before.blk_free, after.blk_free, "block counter untouched");
    assert_eq!(fs.readdir_all(d).len(), names_before);
    assert_eq!(fs.lookup(d, "one-more").unwrap_err(), FnxError::NoEnt);
}

// ---------------------------------------------------------------------------
// Symlinks
// ---------------------------------------------------------------------------

#[test]
fn symlink_readlink_roundtrip() {
    let mut fs = Fs::mount();
    let task = fs.expect_ok(Request::Symlink {
        parent: INO_ROOT,
        name: "ln".into(),
        slnk: "over/the/rainbow".into(),
    });
    let ino = match task.response {
        Response::Iattr { iattr } => {
            assert_eq!(iattr.nlink, 1);
            iattr.ino
        }
        other => panic!("unexpected symlink response {other:?}"),
    };

    let task = fs.expect_ok(Request::Readlink { ino });
    match task.response {
        Response::Readlink { slnk } => assert_eq!(slnk, "over/the/rainbow"),
        other => panic!("unexpected readlink response {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Noatime
// ---------------------------------------------------------------------------

#[test]
fn noatime_read_commits_nothing() {
    let mut fs = Fs::mount_with(MntFlags::NOATIME);
    let (f, fh) = fs.create(INO_ROOT, "f");
    fs.write(f, fh, 0, b"payload");

    let commits_before = fs.pstor.commits();
    fs.read(f, fh, 0, 7);
    assert_eq!(fs.pstor.commits(), commits_before, "no stage under noatime");
    fs.release(f, fh);
}

#[test]
fn atime_read_commits_the_inode_by_default() {
    let mut fs = Fs::mount();
    let (f, fh) = fs.create(INO_ROOT, "f");
    fs.write(f, fh, 0, b"payload");

    let commits_before = fs.pstor.commits();
    fs.read(f, fh, 0, 7);
    assert!(fs.pstor.commits() > commits_before);
    fs.release(f, fh);
}

// ---------------------------------------------------------------------------
// Cooperative suspension
// ---------------------------------------------------------------------------

#[test]
fn backpressure_pends_then_retries_to_completion() {
    let mut fs = Fs::mount();
    fs.vproc.sbkq_pressure = 0;

    // Simulate storage-produced write-back pressure.
    let bk = fnxvproc::vobj::bkref::Bkref::new_ref(99);
    fs.pstor.push_sbk(bk);

    let uctx = fs.uctx.clone();
    fs.vproc.exec_job(Job::TaskExecReq(Task::new(
        &uctx,
        Request::Mkdir {
            parent: INO_ROOT,
            name: "later".into(),
            mode: 0o755,
        },
    )));

    // First attempt pended; the slave request went out instead of a reply.
    let mut saw_slave = None;
    while let Some(job) = fs.out.borrow_mut().pop_front() {
        match job {
            Job::BkWriteReq(bk) => saw_slave = Some(bk),
            Job::TaskExecRes(_) => panic!("task replied while pended"),
            _ => {}
        }
    }
    let bk = saw_slave.expect("slave block request dispatched");
    assert!(bk.borrow().slaved);

    // Block I/O completes; the drain re-runs the task successfully.
    fs.vproc.exec_job(Job::BkWriteRes(bk));
    fs.vproc.exec_pendq();
    let task = fs.pop_exec_res();
    task.status.expect("retried mkdir");
    assert_eq!(task.runcnt, 2);
    assert!(fs.lookup(INO_ROOT, "later").is_ok());
}

// ---------------------------------------------------------------------------
// Eviction and remount
// ---------------------------------------------------------------------------

#[test]
fn close_and_remount_preserves_the_tree() {
    let mut fs = Fs::mount();
    let d = fs.mkdir(INO_ROOT, "persist");
    let (f, fh) = fs.create(d, "f");
    fs.write(f, fh, 0, b"durable bytes");
    fs.release(f, fh);
    let pstor = fs.pstor.clone();
    fs.vproc.close().expect("close");

    let mut fs2 = Fs::remount(pstor, MntFlags::empty());
    let d2 = fs2.lookup(INO_ROOT, "persist").expect("dir staged back").ino;
    assert_eq!(d2, d);
    let f2 = fs2.lookup(d2, "f").expect("file staged back").ino;
    assert_eq!(f2, f);

    let task = fs2.expect_ok(Request::Open {
        ino: f2,
        flags: OpenFlags::empty(),
    });
    let fh2 = match task.response {
        Response::Open { fh } => fh,
        other => panic!("unexpected open response {other:?}"),
    };
    assert_eq!(fs2.read(f2, fh2, 0, 13), b"durable bytes");
    fs2.release(f2, fh2);
}

// ---------------------------------------------------------------------------
// Accounting invariants
// ---------------------------------------------------------------------------

#[test]
fn fsinfo_space_returns_after_cleanup() {
    let mut fs = Fs::mount();
    let baseline = fs.statfs();

    let d = fs.mkdir(INO_ROOT, "d");
    let (f, fh) = fs.create(d, "f");
    fs.write(f, fh, 0, &vec![5u8; 3 * BLKSIZE as usize]);
    fs.release(f, fh);

    let used = fs.statfs();
    assert!(used.blk_free < baseline.blk_free);
    assert!(used.ino_free < baseline.ino_free);

    fs.unlink(d, "f");
    fs.expect_ok(Request::Rmdir {
        parent: INO_ROOT,
        name: "d".into(),
    });

    let after = fs.statfs();
    assert_eq!(after.blk_free, baseline.blk_free);
    assert_eq!(after.ino_free, baseline.ino_free);
}

#[test]
fn dir_link_counts_follow_subdirs() {
    let mut fs = Fs::mount();
    let d = fs.mkdir(INO_ROOT, "d");
    assert_eq!(fs.getattr(d).nlink, 2);

    fs.mkdir(d, "s1");
    fs.mkdir(d, "s2");
    assert_eq!(fs.getattr(d).nlink, 4);

    fs.expect_ok(Request::Rmdir {
        parent: d,
        name: "s1".into(),
    });
    assert_eq!(fs.getattr(d).nlink, 3);
}

#[test]
fn fquery_answers_through_the_fileref_path() {
    let mut fs = Fs::mount();
    let (f, fh) = fs.create(INO_ROOT, "f");
    fs.write(f, fh, 0, b"12345678");

    let task = fs.expect_ok(Request::Fquery { ino: f, fh });
    match task.response {
        Response::Iattr { iattr } => {
            assert_eq!(iattr.ino, f);
            assert_eq!(iattr.size, 8);
            assert_eq!(iattr.blocks, 1);
        }
        other => panic!("unexpected fquery response {other:?}"),
    }

    // A mismatched handle is refused.
    let (g, gfh) = fs.create(INO_ROOT, "g");
    let err = fs.expect_err(Request::Fquery { ino: f, fh: gfh });
    assert_eq!(err, FnxError::BadF);

    fs.release(f, fh);
    fs.release(g, gfh);
}

#[test]
fn every_visible_entry_resolves_to_a_live_inode() {
    let mut fs = Fs::mount();
    let d = fs.mkdir(INO_ROOT, "mixed");
    let mut created: HashMap<String, Ino> = HashMap::new();
    for i in 0..20 {
        let name = format!("f{i}");
        created.insert(name.clone(), fs.mkfifo(d, &name));
    }
    fs.unlink(d, "f3");
    fs.unlink(d, "f17");
    created.remove("f3");
    created.remove("f17");

    let names = fs.readdir_all(d);
    let visible: Vec<&String> = names[2..].iter().collect();
    assert_eq!(visible.len(), created.len());
    for name in visible {
        let iattr = fs.lookup(d, name).expect("entry resolves");
        assert_eq!(created.get(name), Some(&iattr.ino));
    }
}
