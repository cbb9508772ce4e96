use crate::session;
use anyhow::Context as _;
use std::{
  io::{self, Read as _, Write as _},
  net, sync,
};

// Matches the sizing of a typical IDLE notification burst; the buffer doubles
// whenever a read needs more room.
const READ_BUFFER_SIZE: usize = 2000;

// Commands are a few dozen bytes, so flushing them inline is cheaper than
// bouncing through the poll loop. The bound keeps a wedged socket from
// spinning forever.
const WRITE_RETRY_LIMIT: usize = 1000;

/// Outcome of one non-blocking transport operation. `WantRead`/`WantWrite`
/// ask the caller to wait for the matching readiness before retrying.
#[derive(Debug, PartialEq)]
pub enum Io {
  Ready(usize),
  WantRead,
  WantWrite,
  Closed,
}

/// A TLS session over a non-blocking socket. The client configuration is
/// built once and shared across every link.
pub struct Link {
  pub(crate) stream: mio::net::TcpStream,
  tls: rustls::ClientConnection,
  /// Readiness the link wants next; None means it shouldn't be polled.
  pub(crate) interest: Option<mio::Interest>,
  /// Readiness the poll currently knows about.
  registered: Option<mio::Interest>,
}

impl Link {
  /// Starts a non-blocking connect; completion is observed as writability.
  pub fn connect(
    address: net::SocketAddr,
    server: &str,
    config: &sync::Arc<rustls::ClientConfig>,
  ) -> anyhow::Result<Self> {
    let stream = mio::net::TcpStream::connect(address)?;
    let tls = rustls::ClientConnection::new(
      config.clone(),
      server
        .try_into()
        .with_context(|| format!("couldn't convert {server} to a server name"))?,
    )?;
    Ok(Self {
      stream,
      tls,
      interest: Some(mio::Interest::WRITABLE),
      registered: None,
    })
  }

  pub fn is_handshaking(&self) -> bool {
    self.tls.is_handshaking()
  }

  /// Flushes whatever TLS output is queued. `Some` asks the caller to yield
  /// with that result.
  fn flush(&mut self) -> anyhow::Result<Option<Io>> {
    while self.tls.wants_write() {
      match self.tls.write_tls(&mut self.stream) {
        Ok(0) => return Ok(Some(Io::Closed)),
        Ok(_) => (),
        Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
          return Ok(Some(Io::WantWrite))
        }
        Err(error) if error.kind() == io::ErrorKind::Interrupted => (),
        Err(error) => return Err(error.into()),
      }
    }
    Ok(None)
  }

  /// Advances the handshake as far as the socket allows. Re-entrant: the
  /// reactor keeps calling it on readiness until it reports `Ready`.
  pub fn handshake(&mut self) -> anyhow::Result<Io> {
    while self.tls.is_handshaking() {
      if let Some(io) = self.flush()? {
        return Ok(io);
      }
      if !self.tls.wants_read() {
        return Ok(Io::WantRead);
      }
      match self.tls.read_tls(&mut self.stream) {
        Ok(0) => return Ok(Io::Closed),
        Ok(_) => {
          self.tls.process_new_packets()?;
        }
        Err(error) if error.kind() == io::ErrorKind::WouldBlock => return Ok(Io::WantRead),
        Err(error) if error.kind() == io::ErrorKind::Interrupted => (),
        Err(error) => return Err(error.into()),
      }
    }
    Ok(Io::Ready(0))
  }

  /// Pumps ciphertext off the socket and drains available plaintext into
  /// `buffer`. Never blocks.
  pub fn read(&mut self, buffer: &mut [u8]) -> anyhow::Result<Io> {
    if let Some(io) = self.flush()? {
      return Ok(io);
    }
    match self.tls.read_tls(&mut self.stream) {
      Ok(0) => return Ok(Io::Closed),
      Ok(_) => {
        self.tls.process_new_packets()?;
        // Processing can queue output of its own: the tail of the handshake
        // or a key update. It has to go out before this returns, otherwise
        // the session reports WantRead with a reply stranded in the outgoing
        // buffer and parks on readability for a server that is itself
        // waiting on us.
        if let Some(io) = self.flush()? {
          return Ok(io);
        }
      }
      Err(error)
        if error.kind() == io::ErrorKind::WouldBlock
          || error.kind() == io::ErrorKind::Interrupted => (),
      Err(error) => return Err(error.into()),
    }
    match self.tls.reader().read(buffer) {
      Ok(0) => Ok(Io::Closed),
      Ok(length) => Ok(Io::Ready(length)),
      Err(error) if error.kind() == io::ErrorKind::WouldBlock => Ok(Io::WantRead),
      Err(error) => Err(error.into()),
    }
  }

  /// Brings the poll registration in line with the wanted interest.
  pub(crate) fn sync(&mut self, registry: &mio::Registry, token: mio::Token) -> io::Result<()> {
    if self.registered == self.interest {
      return Ok(());
    }
    match (self.registered, self.interest) {
      (None, Some(interest)) => registry.register(&mut self.stream, token, interest)?,
      (Some(_), Some(interest)) => registry.reregister(&mut self.stream, token, interest)?,
      (Some(_), None) => registry.deregister(&mut self.stream)?,
      (None, None) => (),
    }
    self.registered = self.interest;
    Ok(())
  }

  pub(crate) fn close(&mut self, registry: &mio::Registry) {
    if self.registered.is_some() {
      if let Err(error) = registry.deregister(&mut self.stream) {
        log::warn!("couldn't deregister socket: {error}");
      }
    }
    if let Err(error) = self.stream.shutdown(net::Shutdown::Both) {
      log::debug!("shutdown: {error}");
    }
  }
}

impl session::Wire for Link {
  fn send(&mut self, line: &[u8]) -> anyhow::Result<()> {
    self.tls.writer().write_all(line)?;
    self.tls.writer().write_all(b"\r\n")?;
    let mut retries = 0;
    while self.tls.wants_write() {
      match self.tls.write_tls(&mut self.stream) {
        Ok(0) => anyhow::bail!("connection closed while writing"),
        Ok(_) => (),
        Err(error)
          if error.kind() == io::ErrorKind::WouldBlock
            || error.kind() == io::ErrorKind::Interrupted =>
        {
          retries += 1;
          anyhow::ensure!(
            retries < WRITE_RETRY_LIMIT,
            "write stalled after {WRITE_RETRY_LIMIT} retries"
          );
        }
        Err(error) => return Err(error.into()),
      }
    }
    Ok(())
  }
}

/// Accumulates reads and hands out complete CRLF-terminated lines. A line
/// split across reads stays in the buffer until its terminator arrives.
#[derive(Debug)]
pub struct LineBuffer {
  buffer: Vec<u8>,
  length: usize,
}

impl Default for LineBuffer {
  fn default() -> Self {
    Self::new()
  }
}

impl LineBuffer {
  pub fn new() -> Self {
    Self {
      buffer: vec![0; READ_BUFFER_SIZE],
      length: 0,
    }
  }

  /// The writable tail of the buffer, grown when a previous read filled it.
  pub fn space(&mut self) -> &mut [u8] {
    if self.length == self.buffer.len() {
      self.buffer.resize(self.buffer.len() * 2, 0);
    }
    &mut self.buffer[self.length..]
  }

  pub fn advance(&mut self, read: usize) {
    debug_assert!(self.length + read <= self.buffer.len());
    self.length += read;
  }

  /// Next complete line without its CRLF; the remainder compacts to the
  /// front so partial lines keep accumulating.
  pub fn take_line(&mut self) -> Option<Vec<u8>> {
    let terminator = memchr::memmem::find(&self.buffer[..self.length], b"\r\n")?;
    let line = self.buffer[..terminator].to_vec();
    self.buffer.copy_within(terminator + 2..self.length, 0);
    self.length -= terminator + 2;
    Some(line)
  }

  pub fn clear(&mut self) {
    self.length = 0;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  fn feed(buffer: &mut LineBuffer, bytes: &[u8]) {
    let space = buffer.space();
    space[..bytes.len()].copy_from_slice(bytes);
    buffer.advance(bytes.len());
  }

  #[test]
  fn lines_per_read() {
    let mut buffer = LineBuffer::new();
    feed(&mut buffer, b"* OK ready\r\nA1 OK done\r\n");
    assert_eq!(Some(b"* OK ready".to_vec()), buffer.take_line());
    assert_eq!(Some(b"A1 OK done".to_vec()), buffer.take_line());
    assert_eq!(None, buffer.take_line());
  }

  #[test]
  fn line_split_across_reads() {
    let mut buffer = LineBuffer::new();
    feed(&mut buffer, b"* 12 EXI");
    assert_eq!(None, buffer.take_line());
    feed(&mut buffer, b"STS\r\n* 3 EXP");
    assert_eq!(Some(b"* 12 EXISTS".to_vec()), buffer.take_line());
    assert_eq!(None, buffer.take_line());
    feed(&mut buffer, b"UNGE\r\n");
    assert_eq!(Some(b"* 3 EXPUNGE".to_vec()), buffer.take_line());
  }

  #[test]
  fn crlf_split_across_reads() {
    let mut buffer = LineBuffer::new();
    feed(&mut buffer, b"* OK\r");
    assert_eq!(None, buffer.take_line());
    feed(&mut buffer, b"\n");
    assert_eq!(Some(b"* OK".to_vec()), buffer.take_line());
  }

  #[test]
  fn grows_when_full() {
    let mut buffer = LineBuffer::new();
    let long = vec![b'x'; READ_BUFFER_SIZE];
    feed(&mut buffer, &long);
    // The buffer is exactly full; asking for more space doubles it.
    assert!(!buffer.space().is_empty());
    feed(&mut buffer, b"\r\n");
    let line = buffer.take_line().unwrap();
    assert_eq!(READ_BUFFER_SIZE, line.len());
    assert_eq!(None, buffer.take_line());
  }

  #[test]
  fn link_shutdown_reaches_the_peer() {
    use std::io::Read as _;

    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap();
    let config = sync::Arc::new(
      rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(rustls::RootCertStore::empty())
        .with_no_client_auth(),
    );
    let mut link = Link::connect(address, "localhost", &config).unwrap();

    let mut poll = mio::Poll::new().unwrap();
    let registry = poll.registry().try_clone().unwrap();
    let mut events = mio::Events::with_capacity(8);
    link.sync(&registry, mio::Token(7)).unwrap();
    poll
      .poll(&mut events, Some(std::time::Duration::from_secs(5)))
      .unwrap();
    assert!(events
      .iter()
      .any(|event| event.token() == mio::Token(7) && event.is_writable()));

    // The connect completed: the first handshake step flushes the client
    // hello and waits on the server.
    assert_eq!(Io::WantRead, link.handshake().unwrap());
    let (mut peer, _) = listener.accept().unwrap();
    let mut buffer = [0; 4096];
    assert!(peer.read(&mut buffer).unwrap() > 0);

    link.close(&registry);
    // The shutdown reaches the peer and the poll has nothing left to report.
    assert_eq!(0, peer.read(&mut buffer).unwrap());
    poll
      .poll(&mut events, Some(std::time::Duration::from_millis(200)))
      .unwrap();
    assert!(events.is_empty());
  }
}
