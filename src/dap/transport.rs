//! Listener and stream types for the client connection and debuggee IPC.
//!
//! Three transports with identical semantics once connected: TCP (ephemeral
//! `port=0` supported; the bound port is observable before `accept`), Unix
//! domain sockets (auto-generated path when none is given, unlinked on
//! drop) and named pipes, rendered on POSIX as a Unix socket bound at the
//! pipe name. Each listener accepts exactly one peer.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
#[cfg(unix)]
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::debugger::error::Error;

/// Where to listen for one peer.
#[derive(Debug, Clone)]
pub enum ListenAddr {
    Tcp { host: String, port: u16 },
    /// Filesystem path; `None` auto-generates one under the temp dir.
    Unix { path: Option<PathBuf> },
    /// Platform named pipe; on POSIX this is a Unix socket at the name.
    Pipe { name: String },
}

/// Address actually bound, published before `accept` completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoundAddr {
    Tcp(SocketAddr),
    Path(PathBuf),
}

impl std::fmt::Display for BoundAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BoundAddr::Tcp(addr) => write!(f, "{addr}"),
            BoundAddr::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

enum ListenerInner {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

/// A bound listener; owns the filesystem path (if any) and unlinks it on
/// drop on every exit path.
pub struct Listener {
    inner: ListenerInner,
    bound: BoundAddr,
    owned_path: Option<PathBuf>,
}

/// Auto-generated socket path: `<tmpdir>/dapper-{pid}-{ms}.sock`.
pub fn default_socket_path() -> PathBuf {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    std::env::temp_dir().join(format!("dapper-{}-{}.sock", std::process::id(), millis))
}

impl Listener {
    pub fn bind(addr: &ListenAddr) -> Result<Listener, Error> {
        match addr {
            ListenAddr::Tcp { host, port } => {
                let listener = TcpListener::bind((host.as_str(), *port))
                    .map_err(|e| Error::Transport(format!("bind {host}:{port}: {e}")))?;
                let bound = listener
                    .local_addr()
                    .map_err(|e| Error::Transport(format!("local_addr: {e}")))?;
                Ok(Listener {
                    inner: ListenerInner::Tcp(listener),
                    bound: BoundAddr::Tcp(bound),
                    owned_path: None,
                })
            }
            #[cfg(unix)]
            ListenAddr::Unix { path } => {
                let path = path.clone().unwrap_or_else(default_socket_path);
                Self::bind_path(&path)
            }
            #[cfg(unix)]
            ListenAddr::Pipe { name } => Self::bind_path(Path::new(name)),
            #[cfg(not(unix))]
            _ => Err(Error::Configuration(
                "unix/pipe transports are not supported on this platform".into(),
            )),
        }
    }

    #[cfg(unix)]
    fn bind_path(path: &Path) -> Result<Listener, Error> {
        // A previous run may have left the socket file behind.
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path)
            .map_err(|e| Error::Transport(format!("bind {}: {e}", path.display())))?;
        Ok(Listener {
            inner: ListenerInner::Unix(listener),
            bound: BoundAddr::Path(path.to_path_buf()),
            owned_path: Some(path.to_path_buf()),
        })
    }

    pub fn bound_addr(&self) -> &BoundAddr {
        &self.bound
    }

    /// Accept exactly one peer. The listener (and any bound path) is
    /// released when `self` drops after the accept.
    pub fn accept(&self) -> Result<DapStream, Error> {
        match &self.inner {
            ListenerInner::Tcp(listener) => {
                let (stream, _) = listener
                    .accept()
                    .map_err(|e| Error::Transport(format!("accept: {e}")))?;
                stream
                    .set_nodelay(true)
                    .map_err(|e| Error::Transport(format!("set_nodelay: {e}")))?;
                Ok(DapStream::Tcp(stream))
            }
            #[cfg(unix)]
            ListenerInner::Unix(listener) => {
                let (stream, _) = listener
                    .accept()
                    .map_err(|e| Error::Transport(format!("accept: {e}")))?;
                Ok(DapStream::Unix(stream))
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(path) = self.owned_path.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Connect to a listening peer (used by the launcher child and `attach`).
pub fn connect(addr: &ListenAddr) -> Result<DapStream, Error> {
    match addr {
        ListenAddr::Tcp { host, port } => {
            let stream = TcpStream::connect((host.as_str(), *port))
                .map_err(|e| Error::Transport(format!("connect {host}:{port}: {e}")))?;
            stream
                .set_nodelay(true)
                .map_err(|e| Error::Transport(format!("set_nodelay: {e}")))?;
            Ok(DapStream::Tcp(stream))
        }
        #[cfg(unix)]
        ListenAddr::Unix { path } => {
            let path = path
                .as_ref()
                .ok_or_else(|| Error::Configuration("unix connect requires a path".into()))?;
            let stream = UnixStream::connect(path)
                .map_err(|e| Error::Transport(format!("connect {}: {e}", path.display())))?;
            Ok(DapStream::Unix(stream))
        }
        #[cfg(unix)]
        ListenAddr::Pipe { name } => {
            let stream = UnixStream::connect(name)
                .map_err(|e| Error::Transport(format!("connect pipe {name}: {e}")))?;
            Ok(DapStream::Unix(stream))
        }
        #[cfg(not(unix))]
        _ => Err(Error::Configuration(
            "unix/pipe transports are not supported on this platform".into(),
        )),
    }
}

/// One connected peer; transport differences end here.
pub enum DapStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl DapStream {
    /// Independent handle over the same connection (reader/writer split).
    pub fn try_clone(&self) -> Result<DapStream, Error> {
        match self {
            DapStream::Tcp(stream) => stream
                .try_clone()
                .map(DapStream::Tcp)
                .map_err(|e| Error::Transport(format!("clone stream: {e}"))),
            #[cfg(unix)]
            DapStream::Unix(stream) => stream
                .try_clone()
                .map(DapStream::Unix)
                .map_err(|e| Error::Transport(format!("clone stream: {e}"))),
        }
    }

    pub fn shutdown(&self) {
        match self {
            DapStream::Tcp(stream) => {
                let _ = stream.shutdown(std::net::Shutdown::Both);
            }
            #[cfg(unix)]
            DapStream::Unix(stream) => {
                let _ = stream.shutdown(std::net::Shutdown::Both);
            }
        }
    }
}

impl Read for DapStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            DapStream::Tcp(stream) => stream.read(buf),
            #[cfg(unix)]
            DapStream::Unix(stream) => stream.read(buf),
        }
    }
}

impl Write for DapStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            DapStream::Tcp(stream) => stream.write(buf),
            #[cfg(unix)]
            DapStream::Unix(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            DapStream::Tcp(stream) => stream.flush(),
            #[cfg(unix)]
            DapStream::Unix(stream) => stream.flush(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader};
    use std::thread;

    #[test]
    fn test_tcp_ephemeral_port_published_before_accept() {
        let listener = Listener::bind(&ListenAddr::Tcp {
            host: "127.0.0.1".to_string(),
            port: 0,
        })
        .unwrap();
        let addr = match listener.bound_addr() {
            BoundAddr::Tcp(addr) => *addr,
            other => panic!("expected a TCP bound address, got {other}"),
        };
        assert_ne!(addr.port(), 0);

        let client = thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            stream.write_all(b"ping\n").unwrap();
        });
        let stream = listener.accept().unwrap();
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line, "ping\n");
        client.join().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_unix_socket_path_unlinked_on_drop() {
        let path = default_socket_path();
        let listener = Listener::bind(&ListenAddr::Unix { path: Some(path.clone()) }).unwrap();
        assert!(path.exists());

        let client_path = path.clone();
        let client = thread::spawn(move || {
            let mut stream = UnixStream::connect(client_path).unwrap();
            stream.write_all(b"hi").unwrap();
        });
        let mut stream = listener.accept().unwrap();
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hi");
        client.join().unwrap();

        drop(listener);
        assert!(!path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_auto_generated_path_shape() {
        let path = default_socket_path();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("dapper-"));
        assert!(name.ends_with(".sock"));
    }
}
