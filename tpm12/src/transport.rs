// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM transport bindings
//!
//! A transport moves exactly one framed command and one framed response per
//! exchange. It never retries; ordinal-specific retry lives in the
//! dispatcher.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::config::{TpmConfig, TransportConfig};
use crate::constants::HEADER_SIZE;
use crate::error::{Error, Result};

/// A channel to one TPM endpoint
pub trait Transport: Send {
    /// Write one complete command buffer
    fn send(&mut self, command: &[u8]) -> Result<()>;

    /// Read one complete response buffer
    fn receive(&mut self) -> Result<Vec<u8>>;

    /// Drop the current channel and connect again.
    ///
    /// Called after a timeout, since the TPM may still answer the abandoned
    /// command.
    fn reopen(&mut self) -> Result<()>;

    /// Human readable endpoint, for logs
    fn endpoint(&self) -> String;
}

/// Open the binding selected by `config`
pub fn open(config: &TpmConfig) -> Result<Box<dyn Transport>> {
    match &config.transport {
        TransportConfig::Tcp { host, port } => Ok(Box::new(TcpTransport::connect(
            host,
            *port,
            config.timeout,
            config.max_response_size,
        )?)),
        TransportConfig::Device { path } => Ok(Box::new(DeviceTransport::open(
            path,
            config.timeout,
            config.max_response_size,
        )?)),
        #[cfg(unix)]
        TransportConfig::Unix { path } => Ok(Box::new(UnixTransport::connect(
            path,
            config.timeout,
            config.max_response_size,
        )?)),
        #[cfg(not(unix))]
        TransportConfig::Unix { .. } => Err(Error::Config(
            "unix sockets are not available on this platform".into(),
        )),
    }
}

fn map_io(context: &str, err: io::Error, timeout: Duration) -> Error {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Error::Timeout(timeout),
        _ => Error::transport(context, err),
    }
}

/// Check a response header and return the total length it declares
pub(crate) fn declared_length(header: &[u8], max_response_size: usize) -> Result<usize> {
    if header.len() < HEADER_SIZE {
        return Err(Error::MalformedResponse(format!(
            "response header of {} bytes",
            header.len()
        )));
    }
    let size = u32::from_be_bytes([header[2], header[3], header[4], header[5]]) as usize;
    if size < HEADER_SIZE {
        return Err(Error::MalformedResponse(format!(
            "declared response size {size} is smaller than the header"
        )));
    }
    if size > max_response_size {
        return Err(Error::MalformedResponse(format!(
            "declared response size {size} exceeds limit {max_response_size}"
        )));
    }
    Ok(size)
}

/// Read a length-framed response from a byte stream
pub(crate) fn read_frame<R: Read>(
    reader: &mut R,
    max_response_size: usize,
    timeout: Duration,
) -> Result<Vec<u8>> {
    let mut frame = vec![0u8; HEADER_SIZE];
    reader
        .read_exact(&mut frame)
        .map_err(|e| map_io("reading response header", e, timeout))?;
    let size = declared_length(&frame, max_response_size)?;
    frame.resize(size, 0);
    reader
        .read_exact(&mut frame[HEADER_SIZE..])
        .map_err(|e| map_io("reading response body", e, timeout))?;
    Ok(frame)
}

/// TCP connection to a software TPM (`TPM_SERVER_NAME`/`TPM_SERVER_PORT`)
pub struct TcpTransport {
    host: String,
    port: u16,
    timeout: Duration,
    max_response_size: usize,
    stream: Option<TcpStream>,
}

impl TcpTransport {
    pub fn connect(
        host: &str,
        port: u16,
        timeout: Duration,
        max_response_size: usize,
    ) -> Result<Self> {
        let mut transport = Self {
            host: host.to_string(),
            port,
            timeout,
            max_response_size,
            stream: None,
        };
        transport.reopen()?;
        Ok(transport)
    }

    fn dial(&self) -> Result<TcpStream> {
        let context = format!("connecting to {}:{}", self.host, self.port);
        let addrs = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| Error::transport(&context, e))?;
        let mut last_err =
            io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses");
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(stream) => {
                    stream
                        .set_read_timeout(Some(self.timeout))
                        .and_then(|_| stream.set_write_timeout(Some(self.timeout)))
                        .and_then(|_| stream.set_nodelay(true))
                        .map_err(|e| Error::transport(&context, e))?;
                    return Ok(stream);
                }
                Err(e) => last_err = e,
            }
        }
        Err(map_io(&context, last_err, self.timeout))
    }

    fn stream(&mut self) -> Result<&mut TcpStream> {
        if self.stream.is_none() {
            self.stream = Some(self.dial()?);
        }
        self.stream
            .as_mut()
            .ok_or_else(|| Error::Config("TCP stream unavailable".into()))
    }
}

impl Transport for TcpTransport {
    fn send(&mut self, command: &[u8]) -> Result<()> {
        let timeout = self.timeout;
        let stream = self.stream()?;
        stream
            .write_all(command)
            .and_then(|_| stream.flush())
            .map_err(|e| map_io("writing command", e, timeout))
    }

    fn receive(&mut self) -> Result<Vec<u8>> {
        let (timeout, max) = (self.timeout, self.max_response_size);
        read_frame(self.stream()?, max, timeout)
    }

    fn reopen(&mut self) -> Result<()> {
        self.stream = None;
        self.stream = Some(self.dial()?);
        debug!("connected to {}", self.endpoint());
        Ok(())
    }

    fn endpoint(&self) -> String {
        format!("tcp://{}:{}", self.host, self.port)
    }
}

/// Local stream socket exposed by a TPM proxy or simulator
#[cfg(unix)]
pub struct UnixTransport {
    path: PathBuf,
    timeout: Duration,
    max_response_size: usize,
    stream: Option<std::os::unix::net::UnixStream>,
}

#[cfg(unix)]
impl UnixTransport {
    pub fn connect(path: &Path, timeout: Duration, max_response_size: usize) -> Result<Self> {
        let mut transport = Self {
            path: path.to_path_buf(),
            timeout,
            max_response_size,
            stream: None,
        };
        transport.reopen()?;
        Ok(transport)
    }

    fn stream(&mut self) -> Result<&mut std::os::unix::net::UnixStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| Error::Config("unix socket is not connected".into()))
    }
}

#[cfg(unix)]
impl Transport for UnixTransport {
    fn send(&mut self, command: &[u8]) -> Result<()> {
        let timeout = self.timeout;
        let stream = self.stream()?;
        stream
            .write_all(command)
            .and_then(|_| stream.flush())
            .map_err(|e| map_io("writing command", e, timeout))
    }

    fn receive(&mut self) -> Result<Vec<u8>> {
        let (timeout, max) = (self.timeout, self.max_response_size);
        read_frame(self.stream()?, max, timeout)
    }

    fn reopen(&mut self) -> Result<()> {
        self.stream = None;
        let context = format!("connecting to {}", self.path.display());
        let stream = std::os::unix::net::UnixStream::connect(&self.path)
            .map_err(|e| Error::transport(&context, e))?;
        stream
            .set_read_timeout(Some(self.timeout))
            .and_then(|_| stream.set_write_timeout(Some(self.timeout)))
            .map_err(|e| Error::transport(&context, e))?;
        self.stream = Some(stream);
        debug!("connected to {}", self.endpoint());
        Ok(())
    }

    fn endpoint(&self) -> String {
        format!("unix://{}", self.path.display())
    }
}

/// TPM character device such as `/dev/tpm0`
///
/// The driver hands back a whole response per read; a short read is
/// continued until the declared length arrives.
pub struct DeviceTransport {
    path: PathBuf,
    timeout: Duration,
    max_response_size: usize,
    file: Option<File>,
}

impl DeviceTransport {
    pub fn open(path: &Path, timeout: Duration, max_response_size: usize) -> Result<Self> {
        let mut transport = Self {
            path: path.to_path_buf(),
            timeout,
            max_response_size,
            file: None,
        };
        transport.reopen()?;
        Ok(transport)
    }

    fn file(&mut self) -> Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| Error::Config(format!("{} is not open", self.path.display())))
    }

    #[cfg(unix)]
    fn wait_readable(&mut self) -> Result<()> {
        use std::os::fd::AsRawFd;

        let timeout = self.timeout;
        let fd = self.file()?.as_raw_fd();
        let millis = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);
        let mut pollfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        loop {
            // SAFETY: pollfd refers to a file descriptor owned by self.file.
            let rc = unsafe { libc::poll(&mut pollfd, 1, millis) };
            match rc {
                0 => return Err(Error::Timeout(timeout)),
                n if n > 0 => return Ok(()),
                _ => {
                    let err = io::Error::last_os_error();
                    if err.kind() != io::ErrorKind::Interrupted {
                        return Err(Error::transport("polling TPM device", err));
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    fn wait_readable(&mut self) -> Result<()> {
        Ok(())
    }
}

impl Transport for DeviceTransport {
    fn send(&mut self, command: &[u8]) -> Result<()> {
        let timeout = self.timeout;
        self.file()?
            .write_all(command)
            .map_err(|e| map_io("writing command", e, timeout))
    }

    fn receive(&mut self) -> Result<Vec<u8>> {
        let (timeout, max) = (self.timeout, self.max_response_size);
        let mut frame = Vec::new();
        let mut chunk = vec![0u8; 4096];
        let mut expected = None;
        loop {
            self.wait_readable()?;
            let n = self
                .file()?
                .read(&mut chunk)
                .map_err(|e| map_io("reading response", e, timeout))?;
            if n == 0 {
                return Err(Error::transport(
                    "reading response",
                    io::Error::new(io::ErrorKind::UnexpectedEof, "device closed mid-response"),
                ));
            }
            frame.extend_from_slice(&chunk[..n]);
            if expected.is_none() && frame.len() >= HEADER_SIZE {
                expected = Some(declared_length(&frame, max)?);
            }
            if let Some(size) = expected {
                if frame.len() >= size {
                    frame.truncate(size);
                    return Ok(frame);
                }
            }
        }
    }

    fn reopen(&mut self) -> Result<()> {
        self.file = None;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|e| {
                Error::transport(format!("opening TPM device {}", self.path.display()), e)
            })?;
        self.file = Some(file);
        debug!("opened {}", self.endpoint());
        Ok(())
    }

    fn endpoint(&self) -> String {
        format!("device:{}", self.path.display())
    }
}
