#[cfg(not(feature = "fuse-mount"))]
fn main() {
    eprintln!("cloudfs-fuse binary requires --features fuse-mount");
    std::process::exit(1);
}

#[cfg(feature = "fuse-mount")]
mod app {
    use std::ffi::OsStr;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use anyhow::Context;
    use cloudfs_core::HttpRemote;
    use cloudfs_engine::{EngineConfig, EngineContext, EngineError, NodeKind, paths};
    use cloudfs_fuse::{Attr, OperationAdapter, XATTR_PINNED, XATTR_STATE};
    use fuser::{
        FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyCreate, ReplyData,
        ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr,
        Request, TimeOrNow,
    };
    use tokio::runtime::Runtime;
    use tracing::info;
    use tracing_subscriber::EnvFilter;

    const TTL: Duration = Duration::from_secs(1);
    const BLOCK_SIZE: u64 = 4096;
    const NAME_MAX: u32 = 255;

    struct CloudFs {
        rt: Runtime,
        adapter: OperationAdapter,
        uid: u32,
        gid: u32,
    }

    impl CloudFs {
        fn new(rt: Runtime, adapter: OperationAdapter) -> Self {
            Self {
                rt,
                adapter,
                uid: unsafe { libc::geteuid() },
                gid: unsafe { libc::getegid() },
            }
        }

        fn path(&self, ino: u64) -> Result<String, i32> {
            self.adapter.path_of(ino).ok_or(libc::ENOENT)
        }

        fn child(&self, parent: u64, name: &OsStr) -> Result<(String, String), i32> {
            let parent = self.path(parent)?;
            let name = name.to_str().ok_or(libc::EINVAL)?;
            Ok((parent, name.to_string()))
        }

        fn file_attr(&self, attr: &Attr) -> FileAttr {
            let kind = match attr.kind {
                NodeKind::Dir => FileType::Directory,
                NodeKind::File => FileType::RegularFile,
            };
            let mtime = UNIX_EPOCH + Duration::from_secs(attr.mtime.max(0) as u64);
            FileAttr {
                ino: attr.ino,
                size: attr.size,
                blocks: attr.size.div_ceil(512),
                atime: mtime,
                mtime,
                ctime: mtime,
                crtime: mtime,
                kind,
                perm: if kind == FileType::Directory { 0o755 } else { 0o644 },
                nlink: if kind == FileType::Directory { 2 } else { 1 },
                uid: self.uid,
                gid: self.gid,
                rdev: 0,
                flags: 0,
                blksize: BLOCK_SIZE as u32,
            }
        }
    }

    impl Filesystem for CloudFs {
        fn destroy(&mut self) {
            let engine = self.adapter.engine().clone();
            self.rt.block_on(engine.shutdown());
            info!("filesystem unmounted");
        }

        fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
            let (parent, name) = match self.child(parent, name) {
                Ok(child) => child,
                Err(errno) => return reply.error(errno),
            };
            match self.adapter.lookup(&parent, &name) {
                Ok(attr) => reply.entry(&TTL, &self.file_attr(&attr), 0),
                Err(err) => reply.error(err.code()),
            }
        }

        fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
            let path = match self.path(ino) {
                Ok(path) => path,
                Err(errno) => return reply.error(errno),
            };
            match self.adapter.getattr(&path) {
                Ok(attr) => reply.attr(&TTL, &self.file_attr(&attr)),
                Err(err) => reply.error(err.code()),
            }
        }

        fn setattr(
            &mut self,
            _req: &Request<'_>,
            ino: u64,
            _mode: Option<u32>,
            _uid: Option<u32>,
            _gid: Option<u32>,
            size: Option<u64>,
            _atime: Option<TimeOrNow>,
            _mtime: Option<TimeOrNow>,
            _ctime: Option<SystemTime>,
            _fh: Option<u64>,
            _crtime: Option<SystemTime>,
            _chgtime: Option<SystemTime>,
            _bkuptime: Option<SystemTime>,
            _flags: Option<u32>,
            reply: ReplyAttr,
        ) {
            let path = match self.path(ino) {
                Ok(path) => path,
                Err(errno) => return reply.error(errno),
            };
            let result = match size {
                Some(size) => self.rt.block_on(self.adapter.truncate(&path, size)),
                None => self.adapter.getattr(&path),
            };
            match result {
                Ok(attr) => reply.attr(&TTL, &self.file_attr(&attr)),
                Err(err) => reply.error(err.code()),
            }
        }

        fn readdir(
            &mut self,
            _req: &Request<'_>,
            ino: u64,
            _fh: u64,
            offset: i64,
            mut reply: ReplyDirectory,
        ) {
            let path = match self.path(ino) {
                Ok(path) => path,
                Err(errno) => return reply.error(errno),
            };
            let children = match self.rt.block_on(self.adapter.readdir(&path)) {
                Ok(children) => children,
                Err(err) => return reply.error(err.code()),
            };
            let parent_ino = paths::split(&path)
                .and_then(|(parent, _)| self.adapter.getattr(parent).ok())
                .map_or(ino, |attr| attr.ino);
            let mut entries = vec![
                (ino, FileType::Directory, ".".to_string()),
                (parent_ino, FileType::Directory, "..".to_string()),
            ];
            entries.extend(children.into_iter().map(|entry| {
                let kind = match entry.attr.kind {
                    NodeKind::Dir => FileType::Directory,
                    NodeKind::File => FileType::RegularFile,
                };
                (entry.attr.ino, kind, entry.name)
            }));
            for (idx, (entry_ino, kind, name)) in entries.iter().enumerate().skip(offset as usize) {
                if reply.add(*entry_ino, (idx + 1) as i64, *kind, name) {
                    break;
                }
            }
            reply.ok();
        }

        fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
            let path = match self.path(ino) {
                Ok(path) => path,
                Err(errno) => return reply.error(errno),
            };
            match self.adapter.open(&path) {
                Ok(_) => reply.opened(0, 0),
                Err(err) => reply.error(err.code()),
            }
        }

        fn read(
            &mut self,
            _req: &Request<'_>,
            ino: u64,
            _fh: u64,
            offset: i64,
            size: u32,
            _flags: i32,
            _lock_owner: Option<u64>,
            reply: ReplyData,
        ) {
            let path = match self.path(ino) {
                Ok(path) => path,
                Err(errno) => return reply.error(errno),
            };
            let result = self
                .rt
                .block_on(self.adapter.read(&path, offset.max(0) as u64, u64::from(size)));
            match result {
                Ok(bytes) => reply.data(&bytes),
                Err(err) => reply.error(err.code()),
            }
        }

        fn write(
            &mut self,
            _req: &Request<'_>,
            ino: u64,
            _fh: u64,
            offset: i64,
            data: &[u8],
            _write_flags: u32,
            _flags: i32,
            _lock_owner: Option<u64>,
            reply: ReplyWrite,
        ) {
            let path = match self.path(ino) {
                Ok(path) => path,
                Err(errno) => return reply.error(errno),
            };
            match self
                .rt
                .block_on(self.adapter.write(&path, offset.max(0) as u64, data))
            {
                Ok(written) => reply.written(u32::try_from(written).unwrap_or(u32::MAX)),
                Err(err) => reply.error(err.code()),
            }
        }

        fn flush(
            &mut self,
            _req: &Request<'_>,
            ino: u64,
            _fh: u64,
            _lock_owner: u64,
            reply: ReplyEmpty,
        ) {
            let path = match self.path(ino) {
                Ok(path) => path,
                Err(errno) => return reply.error(errno),
            };
            match self.adapter.flush(&path) {
                Ok(()) => reply.ok(),
                Err(err) => reply.error(err.code()),
            }
        }

        fn fsync(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
            let path = match self.path(ino) {
                Ok(path) => path,
                Err(errno) => return reply.error(errno),
            };
            match self.rt.block_on(self.adapter.fsync(&path)) {
                Ok(()) => reply.ok(),
                Err(err) => reply.error(err.code()),
            }
        }

        fn create(
            &mut self,
            _req: &Request<'_>,
            parent: u64,
            name: &OsStr,
            _mode: u32,
            _umask: u32,
            _flags: i32,
            reply: ReplyCreate,
        ) {
            let (parent, name) = match self.child(parent, name) {
                Ok(child) => child,
                Err(errno) => return reply.error(errno),
            };
            match self.rt.block_on(self.adapter.create(&parent, &name)) {
                Ok(attr) => reply.created(&TTL, &self.file_attr(&attr), 0, 0, 0),
                Err(err) => reply.error(err.code()),
            }
        }

        fn mkdir(
            &mut self,
            _req: &Request<'_>,
            parent: u64,
            name: &OsStr,
            _mode: u32,
            _umask: u32,
            reply: ReplyEntry,
        ) {
            let (parent, name) = match self.child(parent, name) {
                Ok(child) => child,
                Err(errno) => return reply.error(errno),
            };
            match self.rt.block_on(self.adapter.mkdir(&parent, &name)) {
                Ok(attr) => reply.entry(&TTL, &self.file_attr(&attr), 0),
                Err(err) => reply.error(err.code()),
            }
        }

        fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
            let (parent, name) = match self.child(parent, name) {
                Ok(child) => child,
                Err(errno) => return reply.error(errno),
            };
            match self.rt.block_on(self.adapter.unlink(&paths::join(&parent, &name))) {
                Ok(()) => reply.ok(),
                Err(err) => reply.error(err.code()),
            }
        }

        fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
            let (parent, name) = match self.child(parent, name) {
                Ok(child) => child,
                Err(errno) => return reply.error(errno),
            };
            match self.rt.block_on(self.adapter.rmdir(&paths::join(&parent, &name))) {
                Ok(()) => reply.ok(),
                Err(err) => reply.error(err.code()),
            }
        }

        fn rename(
            &mut self,
            _req: &Request<'_>,
            parent: u64,
            name: &OsStr,
            newparent: u64,
            newname: &OsStr,
            _flags: u32,
            reply: ReplyEmpty,
        ) {
            let from = match self.child(parent, name) {
                Ok((parent, name)) => paths::join(&parent, &name),
                Err(errno) => return reply.error(errno),
            };
            let to = match self.child(newparent, newname) {
                Ok((parent, name)) => paths::join(&parent, &name),
                Err(errno) => return reply.error(errno),
            };
            match self.rt.block_on(self.adapter.rename(&from, &to)) {
                Ok(()) => reply.ok(),
                Err(err) => reply.error(err.code()),
            }
        }

        fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
            let stats = self.adapter.statfs();
            let blocks = stats.budget / BLOCK_SIZE;
            let free = stats.budget.saturating_sub(stats.used) / BLOCK_SIZE;
            reply.statfs(
                blocks,
                free,
                free,
                stats.files,
                u64::from(u32::MAX),
                BLOCK_SIZE as u32,
                NAME_MAX,
                BLOCK_SIZE as u32,
            );
        }

        fn getxattr(
            &mut self,
            _req: &Request<'_>,
            ino: u64,
            name: &OsStr,
            size: u32,
            reply: ReplyXattr,
        ) {
            let path = match self.path(ino) {
                Ok(path) => path,
                Err(errno) => return reply.error(errno),
            };
            let attr = match self.adapter.getattr(&path) {
                Ok(attr) => attr,
                Err(err) => return reply.error(err.code()),
            };
            let value = match name.to_str() {
                Some(XATTR_STATE) => attr.state.as_str().as_bytes().to_vec(),
                Some(XATTR_PINNED) => if attr.pinned { b"1".to_vec() } else { b"0".to_vec() },
                _ => return reply.error(libc::ENODATA),
            };
            if size == 0 {
                reply.size(value.len() as u32);
            } else if (size as usize) < value.len() {
                reply.error(libc::ERANGE);
            } else {
                reply.data(&value);
            }
        }

        fn setxattr(
            &mut self,
            _req: &Request<'_>,
            ino: u64,
            name: &OsStr,
            value: &[u8],
            _flags: i32,
            _position: u32,
            reply: ReplyEmpty,
        ) {
            if name.to_str() != Some(XATTR_PINNED) {
                return reply.error(libc::ENOTSUP);
            }
            let path = match self.path(ino) {
                Ok(path) => path,
                Err(errno) => return reply.error(errno),
            };
            let pinned = match value {
                b"1" | b"true" => true,
                b"0" | b"false" => false,
                _ => return reply.error(libc::EINVAL),
            };
            match self.adapter.set_pinned(&path, pinned) {
                Ok(_) => reply.ok(),
                Err(err) => reply.error(err.code()),
            }
        }
    }

    pub fn run() -> anyhow::Result<()> {
        dotenvy::dotenv().ok();
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .init();

        let mountpoint = parse_mountpoint()?;
        let config = EngineConfig::from_env().context("invalid engine configuration")?;
        let base_url =
            std::env::var("CLOUDFS_REMOTE_URL").context("CLOUDFS_REMOTE_URL is not set")?;
        let token = std::env::var("CLOUDFS_TOKEN").context("CLOUDFS_TOKEN is not set")?;
        let remote = Arc::new(HttpRemote::with_base_url(&base_url, token)?);

        let rt = Runtime::new()?;
        let engine = rt
            .block_on(async {
                let engine = EngineContext::open(config, remote).await?;
                engine.spawn_background();
                Ok::<_, EngineError>(engine)
            })
            .context("failed to start the engine")?;
        std::fs::create_dir_all(&mountpoint)?;
        info!(mountpoint = %mountpoint.display(), "mounting");

        let fs = CloudFs::new(rt, OperationAdapter::new(Arc::new(engine)));
        let options = vec![
            MountOption::FSName("cloudfs".to_string()),
            MountOption::DefaultPermissions,
        ];
        fuser::mount2(fs, &mountpoint, &options)?;
        Ok(())
    }

    fn parse_mountpoint() -> anyhow::Result<PathBuf> {
        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            if arg == "--mount"
                && let Some(path) = args.next()
            {
                return Ok(PathBuf::from(path));
            }
        }
        anyhow::bail!("usage: cloudfs-fuse --mount <path>")
    }
}

#[cfg(feature = "fuse-mount")]
fn main() -> anyhow::Result<()> {
    app::run()
}
