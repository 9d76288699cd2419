// IPC client: blocking request/response over the daemon socket

use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, SpindleError};
use crate::ipc::{read_frame, write_frame, Request, Response};

pub struct IpcClient {
    stream: UnixStream,
}

impl IpcClient {
    /// Connect to a running daemon. A missing or dead socket maps to
    /// `NotRunning` on the wire, so callers can message it cleanly.
    pub fn connect(socket_path: &Path) -> Result<IpcClient> {
        let stream = UnixStream::connect(socket_path).map_err(|e| {
            SpindleError::NotRunning(format!("no daemon at {} ({})", socket_path.display(), e))
        })?;
        stream.set_read_timeout(Some(Duration::from_secs(120)))?;
        Ok(IpcClient { stream })
    }

    /// Send one request and wait for its response. Responses on a single
    /// connection come back in request order.
    pub fn request(&mut self, request: &Request) -> Result<Response> {
        write_frame(&mut self.stream, request)?;
        read_frame(&mut self.stream)?
            .ok_or_else(|| SpindleError::Internal("daemon closed the connection".to_string()))
    }

    /// One-shot convenience for the CLI.
    pub fn send(socket_path: &Path, request: &Request) -> Result<Response> {
        IpcClient::connect(socket_path)?.request(request)
    }
}
