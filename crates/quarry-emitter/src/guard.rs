use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::FromRawFd;
use std::sync::atomic::{AtomicBool, Ordering};

/// Longest stray-write preview echoed to the diagnostic channel.
const STRAY_PREVIEW_LIMIT: usize = 256;

static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Stdout guard failures.
#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    /// The guard was already installed; double-install is a bug.
    #[error("stdout guard is already installed")]
    AlreadyInstalled,
    /// A file descriptor operation failed.
    #[error("stdout guard setup: {0}")]
    Io(#[from] std::io::Error),
}

/// Protect the framed IPC channel from direct stdout writes.
///
/// The real stdout descriptor is duplicated and returned for framed writes.
/// Descriptor 1 is then replaced with a pipe whose reader thread forwards
/// anything written there to stderr, prefixed and truncated to a preview.
/// Writes to descriptor 1 always succeed (the forwarder drains the pipe
/// continuously), so code waiting on a stdout drain cannot deadlock.
///
/// Installing twice is an error: this is the process's one global mutation.
pub fn install_stdout_guard() -> Result<tokio::fs::File, GuardError> {
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return Err(GuardError::AlreadyInstalled);
    }

    let real_fd = unsafe { libc::dup(libc::STDOUT_FILENO) };
    if real_fd < 0 {
        return Err(std::io::Error::last_os_error().into());
    }

    let mut pipe_fds = [0i32; 2];
    if unsafe { libc::pipe(pipe_fds.as_mut_ptr()) } < 0 {
        let err = std::io::Error::last_os_error();
        unsafe { libc::close(real_fd) };
        return Err(err.into());
    }
    let (pipe_read, pipe_write) = (pipe_fds[0], pipe_fds[1]);

    if unsafe { libc::dup2(pipe_write, libc::STDOUT_FILENO) } < 0 {
        let err = std::io::Error::last_os_error();
        unsafe {
            libc::close(real_fd);
            libc::close(pipe_read);
            libc::close(pipe_write);
        }
        return Err(err.into());
    }
    unsafe { libc::close(pipe_write) };

    let pipe = unsafe { File::from_raw_fd(pipe_read) };
    std::thread::spawn(move || forward_stray_writes(pipe, std::io::stderr()));

    let real = unsafe { File::from_raw_fd(real_fd) };
    Ok(tokio::fs::File::from_std(real))
}

/// Drain `stray` forever, echoing a bounded preview of each burst to the
/// diagnostic channel.
fn forward_stray_writes<R: Read, W: Write>(mut stray: R, mut diag: W) {
    let mut buf = [0u8; 8192];
    loop {
        match stray.read(&mut buf) {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                let preview = String::from_utf8_lossy(&buf[..n.min(STRAY_PREVIEW_LIMIT)]);
                let _ = writeln!(
                    diag,
                    "[quarry stdout guard] redirected {n} bytes written directly to stdout: {}",
                    preview.trim_end()
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwarder_prefixes_and_bounds_the_preview() {
        let stray = vec![b'x'; 1000];
        let mut diag = Vec::new();
        forward_stray_writes(std::io::Cursor::new(stray), &mut diag);

        let out = String::from_utf8(diag).unwrap();
        assert!(out.contains("[quarry stdout guard]"));
        assert!(out.contains("redirected"));
        // One read burst is previewed at no more than the limit.
        let preview_line = out.lines().next().unwrap();
        assert!(preview_line.len() < STRAY_PREVIEW_LIMIT + 128);
    }

    #[test]
    fn forwarder_stops_at_eof() {
        let mut diag = Vec::new();
        forward_stray_writes(std::io::Cursor::new(Vec::new()), &mut diag);
        assert!(diag.is_empty());
    }
}
