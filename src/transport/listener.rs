use std::fs;
use std::path::{Path, PathBuf};

use tokio::net::UnixListener;
use tracing::{debug, info};

use crate::transport::connection::Connection;
use crate::transport::TransportError;

/// Accepts worker connections on a Unix domain socket.
///
/// A stale socket file left behind by a previous run is replaced on bind,
/// and the file is removed again when the listener is dropped.
pub struct TransportListener {
    listener: UnixListener,
    path: PathBuf,
    max_frame_len: usize,
}

impl TransportListener {
    pub fn bind(path: &Path, max_frame_len: usize) -> Result<Self, TransportError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        if path.exists() {
            debug!(path = %path.display(), "removing stale socket");
            fs::remove_file(path)?;
        }
        let listener = UnixListener::bind(path)?;
        info!(path = %path.display(), "listening for workers");
        Ok(Self {
            listener,
            path: path.to_path_buf(),
            max_frame_len,
        })
    }

    pub async fn accept(&self) -> Result<Connection, TransportError> {
        let (stream, _addr) = self.listener.accept().await?;
        debug!(path = %self.path.display(), "accepted connection");
        Ok(Connection::new(stream, self.max_frame_len))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }
}

impl Drop for TransportListener {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
