//! `NetworkStream` over `std::net::TcpStream`.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};

use msspi_types::backend::NetworkStream;
use msspi_types::config::TransportConfig;
use msspi_types::error::{MsspiError, Result};

/// A TCP connection with the deadlines from a [`TransportConfig`].
///
/// A peer FIN reads as [`MsspiError::Eof`] and an expired read deadline as a
/// timeout error, which is what the callback bridge expects.
pub struct StdNetworkStream {
    stream: TcpStream,
    closed: bool,
}

impl StdNetworkStream {
    /// Resolve `address:port` and connect to the first address that answers.
    pub fn connect(address: &str, port: u16, config: &TransportConfig) -> Result<Self> {
        let addrs: Vec<SocketAddr> = (address, port).to_socket_addrs()?.collect();
        if addrs.is_empty() {
            return Err(MsspiError::Config(format!(
                "no addresses for {address}:{port}"
            )));
        }

        let mut last_err = None;
        for addr in &addrs {
            let attempt = match config.connect_timeout() {
                Some(timeout) => TcpStream::connect_timeout(addr, timeout),
                None => TcpStream::connect(addr),
            };
            match attempt {
                Ok(stream) => {
                    log::debug!("Connected to {addr}");
                    return Self::from_tcp(stream, config);
                },
                Err(e) => {
                    log::debug!("Connect to {addr} failed: {e}");
                    last_err = Some(e);
                },
            }
        }
        Err(last_err
            .unwrap_or_else(|| io::Error::from(io::ErrorKind::AddrNotAvailable))
            .into())
    }

    /// Wrap an already connected (or accepted) stream.
    pub fn from_tcp(stream: TcpStream, config: &TransportConfig) -> Result<Self> {
        stream.set_read_timeout(config.read_timeout())?;
        stream.set_write_timeout(config.write_timeout())?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            closed: false,
        })
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        Ok(self.stream.peer_addr()?)
    }
}

impl NetworkStream for StdNetworkStream {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.closed {
            return Err(MsspiError::Closed);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            match self.stream.read(buf) {
                Ok(0) => return Err(MsspiError::Eof),
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        if self.closed {
            return Err(MsspiError::Closed);
        }
        loop {
            match self.stream.write(data) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => return Ok(other?),
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        // The peer may already be gone; NotConnected here is not a failure.
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e.into()),
            _ => Ok(()),
        }
    }
}
