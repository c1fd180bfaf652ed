//! Listener setup and accept loop: wires the socket, the worker pool, and
//! the per-connection codec together into a runnable server.
//!
//! Two acquisition modes are supported, matching the two deployment
//! styles seen across the corpus: reuse a listening socket the parent
//! process already bound to fd 0 (classic `mod_fcgid`/spawn-fcgi style,
//! grounded in the teacher's `fcgisocketsetup.rs`), or bind a fresh
//! Unix-domain socket ourselves (grounded in
//! `original_source/fastcgi/wsgi.py`'s `Server.__init__`).

use std::fs;
use std::io::{self, BufReader};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::Arc;

use log::{error, info, warn};
use nix::sys::socket::{
    bind, getpeername, listen, socket, AddressFamily, Backlog, SockFlag, SockType, UnixAddr,
};
use nix::unistd::dup2_stdin;

use crate::gateway::Application;
use crate::pool::WorkerPool;

/// Detect and take over a FastCGI listening socket inherited on fd 0.
/// Returns `Err` if fd 0 isn't a connected-but-peerless socket (i.e. not
/// a listening Unix socket handed down by a spawner).
pub fn init_inherited_fcgi_socket() -> io::Result<UnixListener> {
    let stdin = io::stdin();
    if getpeername::<()>(stdin.as_raw_fd()) != Err(nix::Error::ENOTCONN) {
        return Err(io::Error::other(
            "fd 0 is not a FastCGI listening socket (peer is connected or fd is invalid)",
        ));
    }
    let devnull = fs::File::open("/dev/null")?;
    let socket_fd = stdin.as_fd().try_clone_to_owned()?;
    dup2_stdin(devnull)?;
    Ok(UnixListener::from(socket_fd))
}

/// Bind a fresh Unix-domain socket at `path` with the given listen
/// backlog, removing any stale socket file left over from a previous
/// run. `umask` is applied for the duration of the bind only, then
/// restored, matching the original's `os.umask(umask)`/`finally
/// os.umask(oldmask)` pattern. Built on raw `nix` socket calls rather
/// than `UnixListener::bind` because `std` has no way to pick the listen
/// backlog.
pub fn bind_unix_socket(
    path: &str,
    umask_mask: Option<u32>,
    backlog: i32,
) -> io::Result<UnixListener> {
    use nix::sys::stat::{umask, Mode};

    let _ = fs::remove_file(path);
    let addr = UnixAddr::new(path).map_err(io::Error::from)?;

    let fd: OwnedFd = socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::empty(),
        None,
    )
    .map_err(io::Error::from)?;

    let old_mask = umask_mask.map(|mask| umask(Mode::from_bits_truncate(mask)));
    let bind_result = bind(fd.as_raw_fd(), &addr);
    if let Some(old) = old_mask {
        umask(old);
    }
    bind_result.map_err(io::Error::from)?;

    let backlog = Backlog::new(backlog).map_err(io::Error::from)?;
    listen(&fd, backlog).map_err(io::Error::from)?;

    Ok(UnixListener::from(fd))
}

/// Accept connections from `listener` forever, handing each one to
/// `pool` to run against `app`. Never returns under normal operation;
/// per-connection errors are logged and the connection is dropped.
pub fn serve(listener: UnixListener, pool: WorkerPool, app: Arc<dyn Application>) -> ! {
    info!("accepting connections");
    loop {
        match listener.accept() {
            Ok((stream, _addr)) => {
                let app = app.clone();
                pool.submit(move || handle_connection(stream, &*app));
            }
            Err(e) => {
                error!("accept failed: {e}");
            }
        }
    }
}

fn handle_connection(stream: UnixStream, app: &dyn Application) {
    let write_stream = match stream.try_clone() {
        Ok(s) => s,
        Err(e) => {
            error!("failed to clone connection for writing: {e}");
            return;
        }
    };
    let mut reader = BufReader::new(stream);
    let mut writer = write_stream;
    match crate::connection::serve_connection(&mut reader, &mut writer, app) {
        Ok(()) => {}
        Err(e) if e.is_broken_pipe() => {
            warn!("connection closed by peer mid-response");
        }
        Err(e) => {
            warn!("connection terminated: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_unix_socket_creates_and_replaces_stale_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.sock");
        let path_str = path.to_str().unwrap();

        let first = bind_unix_socket(path_str, None, 128).unwrap();
        drop(first);
        // The path still exists as a stale socket file; binding again
        // must remove and replace it rather than failing with EADDRINUSE.
        let second = bind_unix_socket(path_str, None, 128).unwrap();
        drop(second);
    }

    #[test]
    fn bind_unix_socket_applies_and_restores_umask() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("masked.sock");
        let listener = bind_unix_socket(path.to_str().unwrap(), Some(0o077), 128).unwrap();
        drop(listener);
    }
}
