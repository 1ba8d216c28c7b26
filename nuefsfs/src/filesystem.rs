// NueFS :: a layered, write-through filesystem served over FUSE.

// The FUSE plumbing here is derived from the implementation of PassthroughFS,
// the example filesystem for the 'fuse_mt' crate.
// PassthroughFS's original copyright :: Copyright (c) 2016-2022 by William R. Fraser

use std::ffi::{CString, OsStr};
use std::fs::{self, File};
use std::io::{self, Write};
use std::mem;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::{FileExt, FileTypeExt};
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tap::prelude::*;

use crate::index::{Resolution, VirtualTreeIndex};
use crate::libc_extras::{io_to_libc_error, libc};
use crate::libc_wrappers;
use crate::manifest::ManifestEntry;
use crate::state::MountState;

use fuse_mt::*;

/// Number of dispatch threads fuse_mt runs for one mount session.
const FUSE_DISPATCH_THREADS: usize = 4;

pub const TTL: Duration = Duration::from_secs(1);

/// One mounted NueFS view. The heavy lifting lives in the *VirtualTreeIndex*
/// snapshot taken at the start of each request; every operation then turns
/// into plain syscalls against the resolved backend path.
pub struct NueFs {
    state: Arc<MountState>,
}

pub fn mode_to_filetype(mode: libc::mode_t) -> FileType {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => FileType::Directory,
        libc::S_IFREG => FileType::RegularFile,
        libc::S_IFLNK => FileType::Symlink,
        libc::S_IFBLK => FileType::BlockDevice,
        libc::S_IFCHR => FileType::CharDevice,
        libc::S_IFIFO => FileType::NamedPipe,
        libc::S_IFSOCK => FileType::Socket,
        _ => {
            panic!("unknown file type");
        }
    }
}

pub fn stat_to_fuse(stat: libc::stat64) -> FileAttr {
    // st_mode encodes both the kind and the permissions
    let kind = mode_to_filetype(stat.st_mode);
    let perm = (stat.st_mode & 0o7777) as u16;

    let time =
        |secs: i64, nanos: i64| SystemTime::UNIX_EPOCH + Duration::new(secs as u64, nanos as u32);

    // libc::nlink_t is wildly different sizes on different platforms:
    // linux amd64: u64
    // linux x86:   u32
    // macOS amd64: u16
    #[allow(clippy::cast_lossless)]
    let nlink = stat.st_nlink as u32;

    FileAttr {
        size: stat.st_size as u64,
        blocks: stat.st_blocks as u64,
        atime: time(stat.st_atime, stat.st_atime_nsec),
        mtime: time(stat.st_mtime, stat.st_mtime_nsec),
        ctime: time(stat.st_ctime, stat.st_ctime_nsec),
        crtime: SystemTime::UNIX_EPOCH,
        kind,
        perm,
        nlink,
        uid: stat.st_uid,
        gid: stat.st_gid,
        rdev: stat.st_rdev as u32,
        flags: 0,
    }
}

#[cfg(target_os = "macos")]
fn statfs_to_fuse(statfs: libc::statfs) -> Statfs {
    Statfs {
        blocks: statfs.f_blocks,
        bfree: statfs.f_bfree,
        bavail: statfs.f_bavail,
        files: statfs.f_files,
        ffree: statfs.f_ffree,
        bsize: statfs.f_bsize as u32,
        namelen: 0,
        frsize: 0,
    }
}

#[cfg(target_os = "linux")]
fn statfs_to_fuse(statfs: libc::statfs) -> Statfs {
    Statfs {
        blocks: statfs.f_blocks,
        bfree: statfs.f_bfree,
        bavail: statfs.f_bavail,
        files: statfs.f_files,
        ffree: statfs.f_ffree,
        bsize: statfs.f_bsize as u32,
        namelen: statfs.f_namelen as u32,
        frsize: statfs.f_frsize as u32,
    }
}

/// Strips the kernel-side leading slash; the index speaks relative paths.
/// Virtual paths are UTF-8 by construction, so undecodable ones cannot exist.
fn vp_of(path: &Path) -> Result<String, libc::c_int> {
    match path.to_str() {
        Some(text) => Ok(text.trim_start_matches('/').to_string()),
        None => Err(libc::EINVAL),
    }
}

fn vp_join(parent: &str, name: &OsStr) -> Result<String, libc::c_int> {
    let name = name.to_str().ok_or(libc::EINVAL)?;

    match parent.is_empty() {
        true => Ok(name.to_string()),
        false => Ok(format!("{parent}/{name}")),
    }
}

fn filetype_of(file_type: fs::FileType) -> FileType {
    if file_type.is_dir() {
        FileType::Directory
    } else if file_type.is_symlink() {
        FileType::Symlink
    } else if file_type.is_block_device() {
        FileType::BlockDevice
    } else if file_type.is_char_device() {
        FileType::CharDevice
    } else if file_type.is_fifo() {
        FileType::NamedPipe
    } else if file_type.is_socket() {
        FileType::Socket
    } else {
        FileType::RegularFile
    }
}

impl NueFs {
    pub fn new(state: Arc<MountState>) -> Self {
        Self { state }
    }

    /// Mounts this filesystem on a newly spawned session thread.
    /// This method returns a handle that will unmount the filesystem when dropped.
    pub fn spawn_mount(self, mountpoint: impl AsRef<Path>) -> io::Result<fuser::BackgroundSession> {
        let args = ["fsname=nuefs"].map(OsStr::new);
        fuse_mt::spawn_mount(FuseMT::new(self, FUSE_DISPATCH_THREADS), mountpoint, &args)
    }

    fn index(&self) -> Arc<VirtualTreeIndex> {
        self.state.index()
    }

    /// Resolves a virtual path to its owning entry and backend path.
    /// Synthetic directories carry no backend; the caller picks their errno.
    fn resolve_owned<'a>(
        &self,
        index: &'a VirtualTreeIndex,
        virt: &str,
        synthetic_err: libc::c_int,
    ) -> Result<(&'a ManifestEntry, PathBuf), libc::c_int> {
        match index.resolve(virt) {
            Some(Resolution::Exact(entry)) => Ok((entry, entry.backend_path.clone())),
            Some(Resolution::Descend { entry, backend }) => Ok((entry, backend)),
            Some(Resolution::Synthetic) => Err(synthetic_err),
            None => Err(libc::ENOENT),
        }
    }

    fn backend_or(
        &self,
        index: &VirtualTreeIndex,
        virt: &str,
        synthetic_err: libc::c_int,
    ) -> Result<PathBuf, libc::c_int> {
        self.resolve_owned(index, virt, synthetic_err)
            .map(|(_, backend)| backend)
    }

    /// Backend directory a new child lands in. A parent with no resolvable
    /// backend behaves as a read-only region of the tree.
    fn backend_parent(
        &self,
        index: &VirtualTreeIndex,
        parent: &str,
    ) -> Result<PathBuf, libc::c_int> {
        self.backend_or(index, parent, libc::EROFS)
    }

    fn stat_backend(&self, backend: &Path) -> ResultEntry {
        libc_wrappers::lstat(backend.as_os_str().to_os_string())
            .map(|stat| (TTL, stat_to_fuse(stat)))
    }

    /// Attributes for a directory that exists only in the virtual tree.
    fn synthetic_dir_attr(&self) -> FileAttr {
        let now = SystemTime::now();

        FileAttr {
            size: 0,
            blocks: 0,
            atime: now,
            mtime: now,
            ctime: now,
            crtime: now,
            kind: FileType::Directory,
            perm: 0o755,
            nlink: 2,
            uid: self.state.uid(),
            gid: self.state.gid(),
            rdev: 0,
            flags: 0,
        }
    }
}

impl FilesystemMT for NueFs {
    fn init(&self, _req: RequestInfo) -> ResultEmpty {
        info!("NueFS mount session is up");
        Ok(())
    }

    fn destroy(&self) {
        debug!("Shutting down NueFS mount session...");
    }

    fn getattr(&self, _req: RequestInfo, path: &Path, fh: Option<u64>) -> ResultEntry {
        debug!("getattr: {:?}", path);

        if let Some(fh) = fh {
            if let Some(file) = self.state.handles().file(fh) {
                return libc_wrappers::fstat(file.as_raw_fd()).map(|stat| (TTL, stat_to_fuse(stat)));
            }
        }

        let virt = vp_of(path)?;
        let index = self.index();

        match index.resolve(&virt) {
            Some(Resolution::Exact(entry)) => self.stat_backend(&entry.backend_path),
            Some(Resolution::Descend { backend, .. }) => self.stat_backend(&backend),
            Some(Resolution::Synthetic) => Ok((TTL, self.synthetic_dir_attr())),
            None => Err(libc::ENOENT),
        }
    }

    fn opendir(&self, _req: RequestInfo, path: &Path, _flags: u32) -> ResultOpen {
        debug!("opendir: {:?} (flags = {:#o})", path, _flags);

        let virt = vp_of(path)?;
        let index = self.index();

        match index.resolve(&virt) {
            None => return Err(libc::ENOENT),
            Some(Resolution::Exact(entry)) if !entry.is_dir => return Err(libc::ENOTDIR),
            Some(Resolution::Descend { backend, .. }) => {
                let stat = libc_wrappers::lstat(backend.as_os_str().to_os_string())?;
                if stat.st_mode & libc::S_IFMT != libc::S_IFDIR {
                    return Err(libc::ENOTDIR);
                }
            }
            Some(_) => {}
        }

        Ok((self.state.handles().insert_dir(virt), 0))
    }

    fn releasedir(&self, _req: RequestInfo, path: &Path, fh: u64, _flags: u32) -> ResultEmpty {
        debug!("releasedir: {:?}", path);
        self.state.handles().remove(fh);
        Ok(())
    }

    fn readdir(&self, _req: RequestInfo, path: &Path, fh: u64) -> ResultReaddir {
        debug!("readdir: {:?}", path);

        if fh == 0 {
            error!("readdir: missing fh");
            return Err(libc::EINVAL);
        }

        let Some(virt) = self.state.handles().dir(fh) else {
            return Err(libc::EBADF);
        };

        let index = self.index();
        let mut listing: Vec<DirectoryEntry> = Vec::new();
        let mut registered = std::collections::BTreeSet::new();

        // Registered children first; they take priority over backend names.
        if let Some(children) = index.children_of(&virt) {
            for name in children {
                let child_virt = match virt.is_empty() {
                    true => name.clone(),
                    false => format!("{virt}/{name}"),
                };

                let kind = match index.lookup_exact(&child_virt) {
                    Some(entry) if entry.is_dir => FileType::Directory,
                    Some(entry) => libc_wrappers::lstat(entry.backend_path.as_os_str().to_os_string())
                        .map(|stat| mode_to_filetype(stat.st_mode))
                        .unwrap_or(FileType::RegularFile),
                    // A name only implied by deeper entries is a directory.
                    None => FileType::Directory,
                };

                registered.insert(name.clone());
                listing.push(DirectoryEntry {
                    name: name.into(),
                    kind,
                });
            }
        }

        // Dynamic descent: merge in the backend listing of the longest
        // registered ancestor, without shadowing registered names.
        if let Some((entry, remainder)) = index.lookup_prefix(&virt) {
            let backend = entry.backend_path.join(remainder);

            match fs::read_dir(&backend) {
                Ok(children) => {
                    for child in children.flatten() {
                        let name = child.file_name();
                        if let Some(text) = name.to_str() {
                            if registered.contains(text) {
                                continue;
                            }
                        }

                        let kind = child
                            .file_type()
                            .map(filetype_of)
                            .unwrap_or(FileType::RegularFile);

                        listing.push(DirectoryEntry { name, kind });
                    }
                }
                Err(err) => {
                    warn!(
                        "readdir {:?}: cannot list backend '{}': {}",
                        path,
                        backend.display(),
                        err
                    );
                }
            }
        }

        Ok(listing.tap_mut(|entries| entries.sort_by(|a, b| a.name.cmp(&b.name))))
    }

    fn open(&self, _req: RequestInfo, path: &Path, flags: u32) -> ResultOpen {
        debug!("open: {:?} flags={:#x}", path, flags);

        let virt = vp_of(path)?;
        let index = self.index();
        let backend = self.backend_or(&index, &virt, libc::EISDIR)?;

        match libc_wrappers::open(backend.into_os_string(), flags as libc::c_int) {
            Ok(fd) => {
                let file = unsafe { File::from_raw_fd(fd) };
                Ok((self.state.handles().insert_file(file), flags))
            }
            Err(e) => {
                error!("open({:?}): {}", path, io::Error::from_raw_os_error(e));
                Err(e)
            }
        }
    }

    fn release(
        &self,
        _req: RequestInfo,
        path: &Path,
        fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> ResultEmpty {
        debug!("release: {:?}", path);
        self.state.handles().remove(fh);
        Ok(())
    }

    fn read(
        &self,
        _req: RequestInfo,
        path: &Path,
        fh: u64,
        offset: u64,
        size: u32,
        callback: impl FnOnce(ResultSlice<'_>) -> CallbackResult,
    ) -> CallbackResult {
        debug!("read: {:?} {:#x} @ {:#x}", path, size, offset);

        let Some(file) = self.state.handles().file(fh) else {
            return callback(Err(libc::EBADF));
        };

        let mut data = vec![0u8; size as usize];
        let mut filled = 0usize;

        while filled < data.len() {
            match file.read_at(&mut data[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("read {:?}, {:#x} @ {:#x}: {}", path, size, offset, e);
                    return callback(Err(io_to_libc_error(e)));
                }
            }
        }

        data.truncate(filled);
        callback(Ok(&data))
    }

    fn write(
        &self,
        _req: RequestInfo,
        path: &Path,
        fh: u64,
        offset: u64,
        data: Vec<u8>,
        _flags: u32,
    ) -> ResultWrite {
        debug!("write: {:?} {:#x} @ {:#x}", path, data.len(), offset);

        let Some(file) = self.state.handles().file(fh) else {
            return Err(libc::EBADF);
        };

        match file.write_at(&data, offset) {
            Ok(n) => Ok(n as u32),
            Err(e) => {
                error!("write {:?}, {:#x} @ {:#x}: {}", path, data.len(), offset, e);
                Err(io_to_libc_error(e))
            }
        }
    }

    fn flush(&self, _req: RequestInfo, path: &Path, fh: u64, _lock_owner: u64) -> ResultEmpty {
        debug!("flush: {:?}", path);

        let Some(file) = self.state.handles().file(fh) else {
            return Err(libc::EBADF);
        };

        if let Err(e) = (&*file).flush() {
            error!("flush({:?}): {}", path, e);
            return Err(io_to_libc_error(e));
        }

        Ok(())
    }

    fn fsync(&self, _req: RequestInfo, path: &Path, fh: u64, datasync: bool) -> ResultEmpty {
        debug!("fsync: {:?}, data={:?}", path, datasync);

        let Some(file) = self.state.handles().file(fh) else {
            return Err(libc::EBADF);
        };

        if let Err(e) = if datasync {
            file.sync_data()
        } else {
            file.sync_all()
        } {
            error!("fsync({:?}, {:?}): {}", path, datasync, e);
            return Err(io_to_libc_error(e));
        }

        Ok(())
    }

    fn chmod(&self, _req: RequestInfo, path: &Path, fh: Option<u64>, mode: u32) -> ResultEmpty {
        debug!("chmod: {:?} to {:#o}", path, mode);

        let result = if let Some(file) = fh.and_then(|fh| self.state.handles().file(fh)) {
            unsafe { libc::fchmod(file.as_raw_fd(), mode as libc::mode_t) }
        } else {
            let virt = vp_of(path)?;
            let index = self.index();

            // Synthetic directories have no permissions to change.
            let real = self.backend_or(&index, &virt, libc::ENOTSUP)?;

            unsafe {
                let path_c = CString::from_vec_unchecked(real.into_os_string().into_vec());
                libc::chmod(path_c.as_ptr(), mode as libc::mode_t)
            }
        };

        if result == -1 {
            let e = io::Error::last_os_error();
            error!("chmod({:?}, {:#o}): {}", path, mode, e);
            Err(io_to_libc_error(e))
        } else {
            Ok(())
        }
    }

    fn chown(
        &self,
        _req: RequestInfo,
        path: &Path,
        fh: Option<u64>,
        uid: Option<u32>,
        gid: Option<u32>,
    ) -> ResultEmpty {
        let unwrapped_uid = uid.unwrap_or(u32::MAX); // docs say "-1", but uid_t is unsigned
        let unwrapped_gid = gid.unwrap_or(u32::MAX); // ditto for gid_t
        debug!("chown: {:?} to {}:{}", path, unwrapped_uid, unwrapped_gid);

        let result = if let Some(file) = fh.and_then(|fh| self.state.handles().file(fh)) {
            unsafe { libc::fchown(file.as_raw_fd(), unwrapped_uid, unwrapped_gid) }
        } else {
            let virt = vp_of(path)?;
            let index = self.index();
            let real = self.backend_or(&index, &virt, libc::ENOTSUP)?;

            unsafe {
                let path_c = CString::from_vec_unchecked(real.into_os_string().into_vec());
                libc::chown(path_c.as_ptr(), unwrapped_uid, unwrapped_gid)
            }
        };

        if result == -1 {
            let e = io::Error::last_os_error();
            error!(
                "chown({:?}, {}, {}): {}",
                path, unwrapped_uid, unwrapped_gid, e
            );
            Err(io_to_libc_error(e))
        } else {
            Ok(())
        }
    }

    fn truncate(&self, _req: RequestInfo, path: &Path, fh: Option<u64>, size: u64) -> ResultEmpty {
        debug!("truncate: {:?} to {:#x}", path, size);

        let result = if let Some(file) = fh.and_then(|fh| self.state.handles().file(fh)) {
            unsafe { libc::ftruncate64(file.as_raw_fd(), size as i64) }
        } else {
            let virt = vp_of(path)?;
            let index = self.index();
            let real = self.backend_or(&index, &virt, libc::EISDIR)?;

            unsafe {
                let path_c = CString::from_vec_unchecked(real.into_os_string().into_vec());
                libc::truncate64(path_c.as_ptr(), size as i64)
            }
        };

        if result == -1 {
            let e = io::Error::last_os_error();
            error!("truncate({:?}, {}): {}", path, size, e);
            Err(io_to_libc_error(e))
        } else {
            Ok(())
        }
    }

    fn utimens(
        &self,
        _req: RequestInfo,
        path: &Path,
        fh: Option<u64>,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> ResultEmpty {
        debug!("utimens: {:?}: {:?}, {:?}", path, atime, mtime);

        let systemtime_to_libc = |time: Option<SystemTime>| -> libc::timespec {
            if let Some(time) = time {
                let (secs, nanos) = match time.duration_since(SystemTime::UNIX_EPOCH) {
                    Ok(duration) => (duration.as_secs() as i64, duration.subsec_nanos()),
                    Err(in_past) => {
                        let duration = in_past.duration();
                        (-(duration.as_secs() as i64), duration.subsec_nanos())
                    }
                };

                libc::timespec {
                    tv_sec: secs,
                    tv_nsec: i64::from(nanos),
                }
            } else {
                libc::timespec {
                    tv_sec: 0,
                    tv_nsec: libc::UTIME_OMIT,
                }
            }
        };

        let times = [systemtime_to_libc(atime), systemtime_to_libc(mtime)];

        let result = if let Some(file) = fh.and_then(|fh| self.state.handles().file(fh)) {
            unsafe { libc::futimens(file.as_raw_fd(), &times as *const libc::timespec) }
        } else {
            let virt = vp_of(path)?;
            let index = self.index();

            // Synthetic directories have no timestamps to change.
            let real = self.backend_or(&index, &virt, libc::ENOTSUP)?;

            unsafe {
                let path_c = CString::from_vec_unchecked(real.into_os_string().into_vec());
                libc::utimensat(
                    libc::AT_FDCWD,
                    path_c.as_ptr(),
                    &times as *const libc::timespec,
                    libc::AT_SYMLINK_NOFOLLOW,
                )
            }
        };

        if result == -1 {
            let e = io::Error::last_os_error();
            error!("utimens({:?}, {:?}, {:?}): {}", path, atime, mtime, e);
            Err(io_to_libc_error(e))
        } else {
            Ok(())
        }
    }

    fn readlink(&self, _req: RequestInfo, path: &Path) -> ResultData {
        debug!("readlink: {:?}", path);

        let virt = vp_of(path)?;
        let index = self.index();
        let real = self.backend_or(&index, &virt, libc::EINVAL)?;

        match fs::read_link(real) {
            Ok(target) => Ok(target.into_os_string().into_vec()),
            Err(e) => Err(io_to_libc_error(e)),
        }
    }

    fn statfs(&self, _req: RequestInfo, path: &Path) -> ResultStatfs {
        debug!("statfs: {:?}", path);

        let virt = vp_of(path)?;
        let index = self.index();

        // A synthetic directory has no backing filesystem of its own; answer
        // for the host root so statvfs callers still get usable numbers.
        let target = match index.resolve(&virt) {
            None => return Err(libc::ENOENT),
            Some(Resolution::Exact(entry)) => entry.backend_path.clone(),
            Some(Resolution::Descend { backend, .. }) => backend,
            Some(Resolution::Synthetic) => PathBuf::from("/"),
        };

        let mut buf: libc::statfs = unsafe { mem::zeroed() };
        let result = unsafe {
            let path_c = CString::from_vec_unchecked(target.into_os_string().into_vec());
            libc::statfs(path_c.as_ptr(), &mut buf)
        };

        if result == -1 {
            let e = io::Error::last_os_error();
            error!("statfs({:?}): {}", path, e);
            Err(io_to_libc_error(e))
        } else {
            Ok(statfs_to_fuse(buf))
        }
    }

    fn fsyncdir(&self, _req: RequestInfo, path: &Path, _fh: u64, datasync: bool) -> ResultEmpty {
        debug!("fsyncdir: {:?} (datasync = {:?})", path, datasync);
        Ok(()) // Silently succeed; directory structure lives in the index.
    }

    fn mknod(
        &self,
        _req: RequestInfo,
        parent_path: &Path,
        name: &OsStr,
        mode: u32,
        rdev: u32,
    ) -> ResultEntry {
        debug!(
            "mknod: {:?}/{:?} (mode={:#o}, rdev={})",
            parent_path, name, mode, rdev
        );

        let parent = vp_of(parent_path)?;
        let index = self.index();
        let real = self.backend_parent(&index, &parent)?.join(name);

        let result = unsafe {
            let path_c = CString::from_vec_unchecked(real.as_os_str().as_bytes().to_vec());
            libc::mknod(path_c.as_ptr(), mode as libc::mode_t, rdev as libc::dev_t)
        };

        if result == -1 {
            let e = io::Error::last_os_error();
            error!("mknod({:?}, {}, {}): {}", real, mode, rdev, e);
            Err(io_to_libc_error(e))
        } else {
            self.stat_backend(&real)
        }
    }

    fn mkdir(&self, _req: RequestInfo, parent_path: &Path, name: &OsStr, mode: u32) -> ResultEntry {
        debug!("mkdir {:?}/{:?} (mode={:#o})", parent_path, name, mode);

        let parent = vp_of(parent_path)?;
        let index = self.index();
        let real = self.backend_parent(&index, &parent)?.join(name);

        nix::unistd::mkdir(
            &real,
            nix::sys::stat::Mode::from_bits_truncate(mode as libc::mode_t),
        )
        .map_err(|e| {
            error!("mkdir({:?}, {:#o}): {}", real, mode, e);
            e as i32
        })?;

        self.stat_backend(&real)
    }

    fn unlink(&self, _req: RequestInfo, parent_path: &Path, name: &OsStr) -> ResultEmpty {
        debug!("unlink {:?}/{:?}", parent_path, name);

        let virt = vp_join(&vp_of(parent_path)?, name)?;
        let index = self.index();
        let real = self.backend_or(&index, &virt, libc::EROFS)?;

        fs::remove_file(&real).map_err(|e| {
            error!("unlink({:?}): {}", real, e);
            io_to_libc_error(e)
        })
    }

    fn rmdir(&self, _req: RequestInfo, parent_path: &Path, name: &OsStr) -> ResultEmpty {
        debug!("rmdir: {:?}/{:?}", parent_path, name);

        let virt = vp_join(&vp_of(parent_path)?, name)?;
        let index = self.index();
        let real = self.backend_or(&index, &virt, libc::EROFS)?;

        fs::remove_dir(&real).map_err(|e| {
            error!("rmdir({:?}): {}", real, e);
            io_to_libc_error(e)
        })
    }

    fn symlink(
        &self,
        _req: RequestInfo,
        parent_path: &Path,
        name: &OsStr,
        target: &Path,
    ) -> ResultEntry {
        debug!("symlink: {:?}/{:?} -> {:?}", parent_path, name, target);

        let parent = vp_of(parent_path)?;
        let index = self.index();
        let real = self.backend_parent(&index, &parent)?.join(name);

        match std::os::unix::fs::symlink(target, &real) {
            Ok(()) => self.stat_backend(&real),
            Err(e) => {
                error!("symlink({:?}, {:?}): {}", real, target, e);
                Err(io_to_libc_error(e))
            }
        }
    }

    fn rename(
        &self,
        _req: RequestInfo,
        parent_path: &Path,
        name: &OsStr,
        newparent_path: &Path,
        newname: &OsStr,
    ) -> ResultEmpty {
        debug!(
            "rename: {:?}/{:?} -> {:?}/{:?}",
            parent_path, name, newparent_path, newname
        );

        let old_virt = vp_join(&vp_of(parent_path)?, name)?;
        let new_virt = vp_join(&vp_of(newparent_path)?, newname)?;
        let index = self.index();

        let (old_entry, old_real) = self.resolve_owned(&index, &old_virt, libc::EROFS)?;

        let (new_entry, new_real) = match index.resolve(&new_virt) {
            Some(Resolution::Exact(entry)) => (entry, entry.backend_path.clone()),
            Some(Resolution::Descend { entry, backend }) => (entry, backend),
            Some(Resolution::Synthetic) => return Err(libc::EISDIR),
            None => {
                // No backend under the destination parent means nowhere to
                // land the rename.
                let newparent = vp_of(newparent_path)?;
                return Err(match index.is_dir(&newparent) {
                    true => libc::EROFS,
                    false => libc::ENOENT,
                });
            }
        };

        // A move between differently rooted layers cannot be expressed as a
        // backend rename; report it the way a device boundary would be.
        if old_entry.virtual_path != new_entry.virtual_path
            && !old_entry.backend_path.starts_with(&new_entry.backend_path)
            && !new_entry.backend_path.starts_with(&old_entry.backend_path)
        {
            return Err(libc::EXDEV);
        }

        fs::rename(&old_real, &new_real).map_err(|e| {
            error!("rename({:?}, {:?}): {}", old_real, new_real, e);
            io_to_libc_error(e)
        })
    }

    fn link(
        &self,
        _req: RequestInfo,
        path: &Path,
        newparent: &Path,
        newname: &OsStr,
    ) -> ResultEntry {
        debug!("link: {:?} -> {:?}/{:?}", path, newparent, newname);

        let virt = vp_of(path)?;
        let index = self.index();

        let (entry, real) = self.resolve_owned(&index, &virt, libc::EPERM)?;

        let newparent_virt = vp_of(newparent)?;
        let (parent_entry, parent_real) =
            self.resolve_owned(&index, &newparent_virt, libc::EROFS)?;
        let new_real = parent_real.join(newname);

        if entry.virtual_path != parent_entry.virtual_path
            && !entry.backend_path.starts_with(&parent_entry.backend_path)
            && !parent_entry.backend_path.starts_with(&entry.backend_path)
        {
            return Err(libc::EXDEV);
        }

        match fs::hard_link(&real, &new_real) {
            Ok(()) => self.stat_backend(&real),
            Err(e) => {
                error!("link({:?}, {:?}): {}", real, new_real, e);
                Err(io_to_libc_error(e))
            }
        }
    }

    fn create(
        &self,
        _req: RequestInfo,
        parent: &Path,
        name: &OsStr,
        mode: u32,
        flags: u32,
    ) -> ResultCreate {
        debug!(
            "create: {:?}/{:?} (mode={:#o}, flags={:#x})",
            parent, name, mode, flags
        );

        let parent_virt = vp_of(parent)?;
        let index = self.index();
        let real = self.backend_parent(&index, &parent_virt)?.join(name);

        let fd = unsafe {
            let real_c = CString::from_vec_unchecked(real.as_os_str().as_bytes().to_vec());
            libc::open(
                real_c.as_ptr(),
                flags as i32 | libc::O_CREAT | libc::O_EXCL,
                mode,
            )
        };

        if -1 == fd {
            let ioerr = io::Error::last_os_error();
            error!("create({:?}): {}", real, ioerr);
            Err(io_to_libc_error(ioerr))
        } else {
            // The new entry is deliberately not added to the index; it stays
            // visible through dynamic descent into the parent's backend.
            let file = unsafe { File::from_raw_fd(fd) };
            let fh = self.state.handles().insert_file(file);

            match libc_wrappers::lstat(real.as_os_str().to_os_string()) {
                Ok(stat) => Ok(CreatedEntry {
                    ttl: TTL,
                    attr: stat_to_fuse(stat),
                    fh,
                    flags,
                }),
                Err(e) => {
                    error!(
                        "lstat after create({:?}): {}",
                        real,
                        io::Error::from_raw_os_error(e)
                    );
                    self.state.handles().remove(fh);
                    Err(e)
                }
            }
        }
    }
}
