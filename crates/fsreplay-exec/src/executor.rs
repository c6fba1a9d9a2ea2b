use std::ffi::CString;
use std::fmt;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt as _;
use std::path::{Path, PathBuf};

use fsreplay_trace::{strerror, Command, Errno, Trace, TraceRow};

use crate::buffer::{self, Buffers};

/// Execution context for one replay run: workspace root, payload buffers,
/// outcome counters and the operation trace. Owned by the driver; one method
/// call per workload operation, one trace row per call.
///
/// Descriptor values returned by [`Executor::open`] are the raw OS
/// descriptors. The workload owns their lifetime and may hand back anything;
/// misuse surfaces as an OS-level failure (EBADF) in the trace, never as a
/// crash.
pub struct Executor {
    root: PathBuf,
    buffers: Buffers,
    trace: Trace,
    next_index: u32,
    success_count: u32,
    failure_count: u32,
}

impl Executor {
    pub fn new(root: impl Into<PathBuf>) -> Executor {
        Executor {
            root: root.into(),
            buffers: Buffers::new(),
            trace: Trace::default(),
            next_index: 0,
            success_count: 0,
            failure_count: 0,
        }
    }

    pub fn trace(&self) -> &Trace {
        &self.trace
    }

    pub fn success_count(&self) -> u32 {
        self.success_count
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// Deterministic write-source payload; exposed so a driver can compute
    /// the expected hash of a `[offset, offset+size)` write independently.
    pub fn write_source(&self) -> &[u8] {
        self.buffers.source()
    }

    /// Maps a workload-supplied virtual absolute path into the workspace.
    fn resolve(&self, virtual_path: &str) -> PathBuf {
        let Some(rel) = virtual_path.strip_prefix('/') else {
            crate::fatal(format!(
                "bad path '{virtual_path}', expected it to start with '/'"
            ));
        };
        self.root.join(rel)
    }

    fn c_path(&self, real: &Path) -> CString {
        match CString::new(real.as_os_str().as_bytes()) {
            Ok(c) => c,
            Err(_) => crate::fatal(format!(
                "bad path '{}', contains an interior NUL byte",
                real.display()
            )),
        }
    }

    fn bump(&mut self) -> u32 {
        let idx = self.next_index;
        self.next_index += 1;
        idx
    }

    fn success(&mut self, index: u32, command: Command, return_code: i32, extra: String) {
        self.trace.push(TraceRow {
            index,
            command,
            return_code,
            errno: Errno::from_code(0),
            extra,
        });
        self.success_count += 1;
    }

    fn failure(
        &mut self,
        index: u32,
        command: Command,
        return_code: i32,
        code: i32,
        operands: &str,
    ) {
        self.trace.push(TraceRow {
            index,
            command,
            return_code,
            errno: Errno::from_code(code),
            extra: String::new(),
        });
        eprintln!("[WARNING] {command}({operands}) FAIL({})", strerror(code));
        self.failure_count += 1;
    }

    pub fn mkdir(&mut self, path: &str, mode: u32) -> i32 {
        let idx = self.bump();
        let path_c = self.c_path(&self.resolve(path));
        let status = unsafe { libc::mkdir(path_c.as_ptr(), mode as libc::mode_t) };
        if status == -1 {
            self.failure(idx, Command::Mkdir, status, last_errno(), &quote(path));
        } else {
            self.success(idx, Command::Mkdir, status, String::new());
        }
        status
    }

    /// `creat` plus an immediate close; the descriptor is never handed to the
    /// workload, so the recorded outcome covers the pair. A close failure
    /// after a successful creation is logged as a minor failure and turns the
    /// record into a failure.
    pub fn create(&mut self, path: &str, mode: u32) -> i32 {
        let idx = self.bump();
        let path_c = self.c_path(&self.resolve(path));
        let fd = unsafe { libc::creat(path_c.as_ptr(), mode as libc::mode_t) };
        if fd == -1 {
            self.failure(idx, Command::Create, fd, last_errno(), &quote(path));
            return fd;
        }
        if unsafe { libc::close(fd) } == -1 {
            let code = last_errno();
            minor_failure(Command::Close, path, code);
            self.failure(idx, Command::Create, fd, code, &quote(path));
        } else {
            self.success(idx, Command::Create, fd, String::new());
        }
        fd
    }

    /// Removes a file, or a directory with everything under it. The whole
    /// subtree yields this one trace row; child failures inside it are
    /// diagnostics only.
    pub fn remove(&mut self, path: &str) -> i32 {
        let idx = self.bump();
        let real = self.resolve(path);
        let operands = quote(real.display());
        let metadata = match fs::symlink_metadata(&real) {
            Ok(m) => m,
            Err(err) => {
                self.failure(idx, Command::Stat, -1, errno_of(&err), &operands);
                return -1;
            }
        };
        if metadata.is_dir() {
            match remove_tree(&real) {
                Ok(()) => {
                    self.success(idx, Command::Rmdir, 0, String::new());
                    0
                }
                Err(err) => {
                    self.failure(idx, Command::Rmdir, -1, errno_of(&err), &operands);
                    -1
                }
            }
        } else {
            match fs::remove_file(&real) {
                Ok(()) => {
                    self.success(idx, Command::Unlink, 0, String::new());
                    0
                }
                Err(err) => {
                    self.failure(idx, Command::Unlink, -1, errno_of(&err), &operands);
                    -1
                }
            }
        }
    }

    pub fn hardlink(&mut self, old_path: &str, new_path: &str) -> i32 {
        let idx = self.bump();
        let old_c = self.c_path(&self.resolve(old_path));
        let new_c = self.c_path(&self.resolve(new_path));
        let status = unsafe { libc::link(old_c.as_ptr(), new_c.as_ptr()) };
        if status == -1 {
            let operands = format!("{}, {}", quote(old_path), quote(new_path));
            self.failure(idx, Command::Hardlink, status, last_errno(), &operands);
        } else {
            self.success(idx, Command::Hardlink, status, String::new());
        }
        status
    }

    pub fn rename(&mut self, old_path: &str, new_path: &str) -> i32 {
        let idx = self.bump();
        let old_c = self.c_path(&self.resolve(old_path));
        let new_c = self.c_path(&self.resolve(new_path));
        let status = unsafe { libc::rename(old_c.as_ptr(), new_c.as_ptr()) };
        if status == -1 {
            let operands = format!("{}, {}", quote(old_path), quote(new_path));
            self.failure(idx, Command::Rename, status, last_errno(), &operands);
        } else {
            self.success(idx, Command::Rename, status, String::new());
        }
        status
    }

    pub fn open(&mut self, path: &str) -> i32 {
        let idx = self.bump();
        let path_c = self.c_path(&self.resolve(path));
        let fd = unsafe { libc::open(path_c.as_ptr(), libc::O_RDWR) };
        if fd == -1 {
            self.failure(idx, Command::Open, fd, last_errno(), &quote(path));
        } else {
            self.success(idx, Command::Open, fd, String::new());
        }
        fd
    }

    pub fn close(&mut self, fd: i32) -> i32 {
        let idx = self.bump();
        let status = unsafe { libc::close(fd) };
        if status == -1 {
            self.failure(idx, Command::Close, status, last_errno(), &quote(fd));
        } else {
            self.success(idx, Command::Close, status, String::new());
        }
        status
    }

    /// Writes `[src_offset, src_offset+size)` of the source buffer to `fd`.
    /// A short write still records as a success with the actual count.
    pub fn write(&mut self, fd: i32, src_offset: usize, size: usize) -> i32 {
        let idx = self.bump();
        let written = {
            let src = self.buffers.source_range(src_offset, size);
            unsafe { libc::write(fd, src.as_ptr().cast(), src.len()) }
        };
        if written == -1 {
            self.failure(idx, Command::Write, -1, last_errno(), &quote(fd));
            return -1;
        }
        let written = written as i32;
        self.success(idx, Command::Write, written, String::new());
        written
    }

    /// Reads up to `size` bytes into the scratch buffer and records the hash
    /// of exactly the bytes returned. A result larger than the request would
    /// overrun the scratch; it is classified as a failure.
    pub fn read(&mut self, fd: i32, size: usize) -> i32 {
        let idx = self.bump();
        let got = {
            let scratch = self.buffers.scratch_range(size);
            unsafe { libc::read(fd, scratch.as_mut_ptr().cast(), scratch.len()) }
        };
        if got == -1 {
            self.failure(idx, Command::Read, -1, last_errno(), &quote(fd));
            return -1;
        }
        let got = got as usize;
        if got > size {
            // The kernel reported no error, so none is recorded.
            self.failure(idx, Command::Read, got as i32, 0, &quote(fd));
            return -1;
        }
        let digest = buffer::content_hash(&self.buffers.scratch()[..got]);
        self.success(idx, Command::Read, got as i32, format!("hash={digest:x}"));
        got as i32
    }

    pub fn fsync(&mut self, fd: i32) -> i32 {
        let idx = self.bump();
        let status = unsafe { libc::fsync(fd) };
        if status == -1 {
            self.failure(idx, Command::Fsync, status, last_errno(), &quote(fd));
        } else {
            self.success(idx, Command::Fsync, status, String::new());
        }
        status
    }
}

/// Removes a directory subtree bottom-up. A failing child is logged as a
/// minor failure and does not stop its siblings; the error of the most recent
/// failure decides the result for the subtree. The directory itself is
/// removed only once all children are gone.
fn remove_tree(dir: &Path) -> io::Result<()> {
    let mut last_err: Option<io::Error> = None;
    match fs::read_dir(dir) {
        Ok(entries) => {
            for entry in entries {
                let child = match entry {
                    Ok(e) => e.path(),
                    Err(err) => {
                        minor_failure(Command::Stat, dir.display(), errno_of(&err));
                        last_err = Some(err);
                        continue;
                    }
                };
                let metadata = match fs::symlink_metadata(&child) {
                    Ok(m) => m,
                    Err(err) => {
                        minor_failure(Command::Stat, child.display(), errno_of(&err));
                        last_err = Some(err);
                        continue;
                    }
                };
                if metadata.is_dir() {
                    // Recursion logs its own diagnostics.
                    if let Err(err) = remove_tree(&child) {
                        last_err = Some(err);
                    }
                } else if let Err(err) = fs::remove_file(&child) {
                    minor_failure(Command::Unlink, child.display(), errno_of(&err));
                    last_err = Some(err);
                }
            }
        }
        Err(err) => last_err = Some(err),
    }
    if last_err.is_none() {
        if let Err(err) = fs::remove_dir(dir) {
            last_err = Some(err);
        }
    }
    match last_err {
        None => Ok(()),
        Some(err) => {
            minor_failure(Command::Rmdir, dir.display(), errno_of(&err));
            Err(err)
        }
    }
}

fn minor_failure(command: Command, operand: impl fmt::Display, code: i32) {
    eprintln!(
        "[WARNING] {command}('{operand}') FAIL({}) <minor>",
        strerror(code)
    );
}

fn quote(operand: impl fmt::Display) -> String {
    format!("'{operand}'")
}

fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn errno_of(err: &io::Error) -> i32 {
    err.raw_os_error().unwrap_or(0)
}
