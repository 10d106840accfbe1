//! Pseudo-terminal primitives.
//!
//! Thin wrappers over openpty, TIOCSWINSZ, TIOCSCTTY and poll. Every `unsafe`
//! block in the terminal stack lives here.

use crate::config::types::{LabError, Result};
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::pty::{openpty, Winsize};
use std::fs::File;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

/// Master as a file, slave as the descriptor handed to the child
pub struct PtyPair {
    pub master: File,
    pub slave: OwnedFd,
}

fn winsize(rows: u16, cols: u16) -> Winsize {
    Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}

fn set_cloexec(fd: RawFd) -> Result<()> {
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    Ok(())
}

/// Allocate a master/slave pair with an initial window size.
///
/// Both descriptors are close-on-exec so no other child inherits them.
pub fn open_pty(rows: u16, cols: u16) -> Result<PtyPair> {
    let pair = openpty(Some(&winsize(rows, cols)), None)
        .map_err(|e| LabError::Process(format!("openpty failed: {}", e)))?;
    set_cloexec(pair.master.as_raw_fd())?;
    set_cloexec(pair.slave.as_raw_fd())?;
    Ok(PtyPair {
        master: File::from(pair.master),
        slave: pair.slave,
    })
}

/// TIOCSWINSZ on the master so the line discipline reflows
pub fn set_window_size(master: &impl AsRawFd, rows: u16, cols: u16) -> Result<()> {
    let size = winsize(rows, cols);
    // SAFETY: the fd is a live pty master and `size` outlives the call.
    let rc = unsafe { libc::ioctl(master.as_raw_fd(), libc::TIOCSWINSZ as _, &size as *const Winsize) };
    if rc != 0 {
        return Err(LabError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

/// Spawn `cmd` with the slave as its standard streams, in a new session with
/// the slave as controlling terminal.
///
/// The caller has already configured program, arguments, environment,
/// working directory and credentials on `cmd`.
pub fn spawn_on_slave(mut cmd: Command, slave: &OwnedFd) -> Result<Child> {
    let stdin = slave.try_clone()?;
    let stdout = slave.try_clone()?;
    let stderr = slave.try_clone()?;
    cmd.stdin(Stdio::from(stdin))
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr));

    // SAFETY: only async-signal-safe calls (setsid, ioctl) run between fork and exec.
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() < 0 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::ioctl(0, libc::TIOCSCTTY as _, 0) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    cmd.spawn()
        .map_err(|e| LabError::Process(format!("Failed to start shell: {}", e)))
}

/// Wait up to `timeout` for `fd` to become readable (or hung up)
pub fn wait_readable(fd: RawFd, timeout: Duration) -> std::io::Result<bool> {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let millis = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
    // SAFETY: one valid pollfd for the duration of the call.
    let rc = unsafe { libc::poll(&mut pollfd, 1, millis) };
    if rc < 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(err);
    }
    Ok(rc > 0 && pollfd.revents != 0)
}
