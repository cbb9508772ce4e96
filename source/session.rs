use crate::{
  account::{self, Account},
  imap, transport, unseen,
};
use std::{mem, net::ToSocketAddrs as _, sync, time};

pub const RECONNECT_INTERVAL: time::Duration = time::Duration::from_secs(30);
const RECONNECT_NOTE_INTERVAL: time::Duration = time::Duration::from_secs(10);
pub const INACTIVITY_TIME_LIMIT: time::Duration = time::Duration::from_secs(200);
// https://www.rfc-editor.org/rfc/rfc2177
// The server MAY consider a client inactive if it has an IDLE command running,
// and if such a server has an inactivity timeout it MAY log the client off
// [...] Because of that, clients using IDLE are advised to terminate the IDLE
// and re-issue it at least every 29 minutes.
pub const IDLE_TIME_LIMIT: time::Duration = time::Duration::from_secs(25 * 60);

/// Where a command line ends up. The link implements this; tests substitute a
/// recorder.
pub trait Wire {
  fn send(&mut self, line: &[u8]) -> anyhow::Result<()>;
}

/// What the current stage of the exchange is waiting for. `Handshake` covers
/// the window between connect and TLS completion, during which no protocol
/// line can arrive.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Wait {
  Handshake,
  Greeting,
  Login,
  Select,
  Search,
  Idle,
  RefreshAck,
  ByeAck,
  Logout,
}

#[derive(Debug, PartialEq)]
pub enum Flow {
  Continue,
  Disconnect,
}

/// The per-account protocol driver: consumes server lines, issues at most one
/// command per line, and keeps the unseen bookkeeping current.
#[derive(Debug)]
pub struct Driver {
  wait: Wait,
  /// Prefix of the tagged response that completes the outstanding command.
  needle: String,
  seq: u64,
  exists: u32,
  unseens: unseen::UnseenSet,
  /// Search results accumulate here and replace `unseens` wholesale when the
  /// search completes, so a half-finished search never shows up in the
  /// published counts.
  pending: unseen::UnseenSet,
  idle_started: Option<time::Instant>,
}

impl Default for Driver {
  fn default() -> Self {
    Self::new()
  }
}

impl Driver {
  pub fn new() -> Self {
    Self {
      wait: Wait::Handshake,
      needle: String::new(),
      seq: 0,
      exists: 0,
      unseens: unseen::UnseenSet::new(),
      pending: unseen::UnseenSet::new(),
      idle_started: None,
    }
  }

  /// Back to the pre-handshake state. The unseen set survives so a reconnect
  /// doesn't disturb the published counts until the next search lands.
  pub fn reset(&mut self) {
    self.wait = Wait::Handshake;
    self.needle.clear();
    self.seq = 0;
    self.exists = 0;
    self.pending.clear();
    self.idle_started = None;
  }

  /// Installed once the TLS handshake completes: the first expected line is
  /// the server greeting.
  pub fn greet(&mut self) {
    self.wait = Wait::Greeting;
  }

  pub fn wait(&self) -> Wait {
    self.wait
  }

  pub fn count(&self) -> usize {
    self.unseens.len()
  }

  pub fn exists(&self) -> u32 {
    self.exists
  }

  pub fn unseens(&self) -> &unseen::UnseenSet {
    &self.unseens
  }

  pub fn idling_since(&self) -> Option<time::Instant> {
    match self.wait {
      Wait::Idle => self.idle_started,
      _ => None,
    }
  }

  fn matches(&self, line: &[u8]) -> bool {
    !self.needle.is_empty() && line.starts_with(self.needle.as_bytes())
  }

  fn send_login(&mut self, account: &Account, wire: &mut dyn Wire) -> anyhow::Result<()> {
    self.seq += 1;
    log::debug!(
      "  [{}] >>> A{} LOGIN {} {}",
      account.name,
      self.seq,
      account.user,
      account::redact(account.password())
    );
    wire.send(format!("A{} LOGIN {} {}", self.seq, account.user, account.password()).as_bytes())?;
    self.needle = format!("A{} ", self.seq);
    self.wait = Wait::Login;
    Ok(())
  }

  fn send_select(&mut self, account: &Account, wire: &mut dyn Wire) -> anyhow::Result<()> {
    self.seq += 1;
    let command = format!("A{} SELECT INBOX", self.seq);
    log::debug!("  [{}] >>> {command}", account.name);
    wire.send(command.as_bytes())?;
    self.needle = format!("A{} OK ", self.seq);
    self.wait = Wait::Select;
    Ok(())
  }

  fn send_search(&mut self, account: &Account, wire: &mut dyn Wire) -> anyhow::Result<()> {
    self.pending.clear();
    self.seq += 1;
    let command = format!("A{} SEARCH (UNSEEN)", self.seq);
    log::debug!("  [{}] >>> {command}", account.name);
    wire.send(command.as_bytes())?;
    self.needle = format!("A{} OK ", self.seq);
    self.wait = Wait::Search;
    Ok(())
  }

  fn send_idle(&mut self, account: &Account, wire: &mut dyn Wire) -> anyhow::Result<()> {
    self.seq += 1;
    let command = format!("A{} IDLE", self.seq);
    log::debug!("  [{}] >>> {command}", account.name);
    wire.send(command.as_bytes())?;
    self.needle = format!("A{} OK ", self.seq);
    self.wait = Wait::Idle;
    self.idle_started = Some(time::Instant::now());
    Ok(())
  }

  fn send_done(&mut self, account: &Account, wire: &mut dyn Wire) -> anyhow::Result<()> {
    log::debug!("  [{}] >>> DONE", account.name);
    wire.send(b"DONE")
  }

  /// Ends the current IDLE so its completion triggers a fresh search. Used
  /// for the periodic refresh and as the first inactivity escalation step.
  pub fn refresh(&mut self, account: &Account, wire: &mut dyn Wire) -> anyhow::Result<()> {
    self.send_done(account, wire)?;
    self.wait = Wait::RefreshAck;
    self.idle_started = None;
    Ok(())
  }

  /// Starts a graceful logout; the tagged completion disconnects.
  pub fn quit(&mut self, account: &Account, wire: &mut dyn Wire) -> anyhow::Result<()> {
    self.seq += 1;
    let command = format!("A{} LOGOUT", self.seq);
    log::debug!("  [{}] >>> {command}", account.name);
    wire.send(command.as_bytes())?;
    self.needle = format!("A{} OK", self.seq);
    self.wait = Wait::Logout;
    Ok(())
  }

  /// Advances the exchange by one server line. Lines that match nothing are
  /// ignored; the needle makes sure only the awaited tagged response moves
  /// the stage forward.
  pub fn on_line(
    &mut self,
    account: &Account,
    line: &[u8],
    wire: &mut dyn Wire,
  ) -> anyhow::Result<Flow> {
    match self.wait {
      Wait::Handshake => (),
      Wait::Greeting => {
        if line.starts_with(b"* OK") {
          self.send_login(account, wire)?;
        }
      }
      Wait::Login => {
        if self.matches(line) {
          self.send_select(account, wire)?;
        }
      }
      Wait::Select => {
        if let Ok(imap::Untagged::Exists(count)) = imap::parser::untagged(line) {
          log::debug!("  [{}] exists: {count}", account.name);
          self.exists = count;
        } else if self.matches(line) {
          self.send_search(account, wire)?;
        }
      }
      Wait::Search => {
        if let Ok(imap::Untagged::Search(numbers)) = imap::parser::untagged(line) {
          for number in numbers {
            self.pending.add(number);
          }
        } else if self.matches(line) {
          mem::swap(&mut self.unseens, &mut self.pending);
          log::debug!("  [{}] unseen: {}", account.name, self.unseens.len());
          self.send_idle(account, wire)?;
        }
      }
      Wait::Idle => {
        if self.matches(line) {
          self.send_search(account, wire)?;
        } else {
          match imap::parser::untagged(line) {
            Ok(imap::Untagged::Ok) => (),
            Ok(imap::Untagged::Bye) => {
              self.send_done(account, wire)?;
              self.wait = Wait::ByeAck;
              self.idle_started = None;
            }
            Ok(imap::Untagged::Fetch(number, attributes)) => {
              if imap::seen(attributes) {
                log::debug!("  [{}] unseen remove: {number}", account.name);
                self.unseens.remove(number);
              } else {
                log::debug!("  [{}] unseen add: {number}", account.name);
                self.unseens.add(number);
              }
            }
            Ok(imap::Untagged::Expunge(number)) => {
              log::debug!("  [{}] expunge: {number}", account.name);
              self.unseens.remove(number);
              self.unseens.decrement_above(number);
              self.exists = self.exists.saturating_sub(1);
            }
            Ok(imap::Untagged::Exists(count)) => {
              log::debug!("  [{}] exists: {count}", account.name);
              self.exists = count;
              self.send_done(account, wire)?;
              self.wait = Wait::RefreshAck;
              self.idle_started = None;
            }
            Ok(imap::Untagged::Search(_)) | Err(_) => (),
          }
        }
      }
      Wait::RefreshAck => {
        if self.matches(line) {
          self.send_search(account, wire)?;
        }
      }
      Wait::ByeAck => {
        if self.matches(line) {
          self.quit(account, wire)?;
        }
      }
      Wait::Logout => {
        if self.matches(line) {
          return Ok(Flow::Disconnect);
        }
      }
    }
    Ok(Flow::Continue)
  }
}

/// One monitored account: the protocol driver plus whatever transport it
/// currently has. Sessions are built once and reused across reconnects.
pub struct Session {
  account: Account,
  driver: Driver,
  link: Option<transport::Link>,
  buffer: transport::LineBuffer,
  last_activity: time::Instant,
  retry_at: time::Instant,
  noted_at: time::Instant,
}

impl Session {
  pub fn new(account: Account) -> Self {
    let now = time::Instant::now();
    Self {
      account,
      driver: Driver::new(),
      link: None,
      buffer: transport::LineBuffer::new(),
      last_activity: now,
      retry_at: now,
      noted_at: now,
    }
  }

  pub fn name(&self) -> &str {
    &self.account.name
  }

  pub fn count(&self) -> usize {
    self.driver.count()
  }

  fn handshaking(&self) -> bool {
    self.driver.wait() == Wait::Handshake
  }

  /// Timer pass, run once per reactor iteration: reconnect when due,
  /// escalate on inactivity, refresh a long-lived IDLE.
  pub fn tick(
    &mut self,
    now: time::Instant,
    registry: &mio::Registry,
    config: &sync::Arc<rustls::ClientConfig>,
  ) {
    if self.link.is_none() {
      if now >= self.retry_at {
        self.connect(now, config);
      } else if now.duration_since(self.noted_at) >= RECONNECT_NOTE_INTERVAL {
        log::info!(
          "  [{}] reconnecting in {}s",
          self.account.name,
          self.retry_at.duration_since(now).as_secs()
        );
        self.noted_at = now;
      }
      return;
    }
    if now.duration_since(self.last_activity) > INACTIVITY_TIME_LIMIT {
      self.escalate(registry, now);
    } else if self
      .driver
      .idling_since()
      .map_or(false, |since| now.duration_since(since) > IDLE_TIME_LIMIT)
    {
      log::info!("  [{}] restarting idle", self.account.name);
      let Session { link, driver, account, .. } = self;
      let failed = match link.as_mut() {
        Some(link) => driver.refresh(account, link).is_err(),
        None => false,
      };
      if failed {
        self.disconnect(registry);
      }
    }
  }

  /// Nothing read for too long: wind the session down one step at a time,
  /// ending the IDLE first, then logging out, then cutting the connection.
  fn escalate(&mut self, registry: &mio::Registry, now: time::Instant) {
    log::info!(
      "  [{}] no activity for {}s",
      self.account.name,
      now.duration_since(self.last_activity).as_secs()
    );
    let wait = self.driver.wait();
    if matches!(wait, Wait::Handshake | Wait::Logout) {
      self.disconnect(registry);
      return;
    }
    let Session { link, driver, account, .. } = self;
    let Some(wire) = link.as_mut() else { return };
    let result = if wait == Wait::Idle {
      driver.refresh(account, wire)
    } else {
      driver.quit(account, wire)
    };
    if let Err(error) = result {
      log::error!("  [{}] {error:#}", self.account.name);
      self.disconnect(registry);
    }
  }

  fn connect(&mut self, now: time::Instant, config: &sync::Arc<rustls::ClientConfig>) {
    let account = &self.account;
    log::info!(
      "  [{}] connecting to {}:{}",
      account.name,
      account.server,
      account.port
    );
    let address = match (account.server.as_str(), account.port).to_socket_addrs() {
      Ok(mut addresses) => match addresses.next() {
        Some(address) => address,
        None => {
          log::error!(
            "  [{}] no address for {}:{}",
            account.name,
            account.server,
            account.port
          );
          self.retry_at = now + RECONNECT_INTERVAL;
          return;
        }
      },
      Err(error) => {
        log::error!(
          "  [{}] couldn't resolve {}:{}: {error}",
          account.name,
          account.server,
          account.port
        );
        self.retry_at = now + RECONNECT_INTERVAL;
        return;
      }
    };
    match transport::Link::connect(address, &account.server, config) {
      Ok(link) => {
        self.link = Some(link);
        self.driver.reset();
        self.buffer.clear();
        self.last_activity = now;
      }
      Err(error) => {
        log::error!("  [{}] connect: {error:#}", account.name);
        self.retry_at = now + RECONNECT_INTERVAL;
      }
    }
  }

  fn disconnect(&mut self, registry: &mio::Registry) {
    let Some(mut link) = self.link.take() else { return };
    log::info!(
      "  [{}] disconnecting from {}:{}",
      self.account.name,
      self.account.server,
      self.account.port
    );
    link.close(registry);
    let now = time::Instant::now();
    self.last_activity = now;
    self.retry_at = now + RECONNECT_INTERVAL;
    self.noted_at = now;
  }

  pub fn sync_interest(&mut self, registry: &mio::Registry, token: mio::Token) {
    let failed = match self.link.as_mut() {
      Some(link) => match link.sync(registry, token) {
        Ok(()) => false,
        Err(error) => {
          log::error!("  [{}] poll registration: {error}", self.account.name);
          true
        }
      },
      None => false,
    };
    if failed {
      self.disconnect(registry);
    }
  }

  /// Readiness dispatch for one poll event.
  pub fn service(&mut self, registry: &mio::Registry, event: &mio::event::Event, now: time::Instant) {
    if self.link.is_none() {
      return;
    }
    if event.is_error() {
      log::error!("  [{}] socket error", self.account.name);
      self.disconnect(registry);
      return;
    }
    if event.is_writable() && self.handshaking() {
      self.on_writable(registry, now);
    }
    // A peer hangup still surfaces through the read path as a clean close.
    if self.link.is_some()
      && (event.is_readable()
        || event.is_read_closed()
        || (event.is_writable() && !self.handshaking()))
    {
      self.on_readable(registry, now);
    }
  }

  /// Writability before the handshake finished: either the connect just
  /// completed or the handshake wants to continue. Once it is done the
  /// greeting stage takes over and this branch never runs again.
  fn on_writable(&mut self, registry: &mio::Registry, now: time::Instant) {
    let mut failed = false;
    {
      let Session { link, driver, account, last_activity, .. } = self;
      let Some(link) = link.as_mut() else { return };
      match link.stream.take_error() {
        Ok(None) => (),
        Ok(Some(error)) => {
          log::error!("  [{}] connect: {error}", account.name);
          failed = true;
        }
        Err(error) => {
          log::error!("  [{}] connect: {error}", account.name);
          failed = true;
        }
      }
      if !failed {
        match link.handshake() {
          Ok(transport::Io::Ready(_)) => {
            log::info!("  [{}] TLS handshake complete", account.name);
            link.interest = Some(mio::Interest::READABLE);
          }
          Ok(transport::Io::WantRead) => link.interest = Some(mio::Interest::READABLE),
          Ok(transport::Io::WantWrite) => link.interest = Some(mio::Interest::WRITABLE),
          Ok(transport::Io::Closed) => {
            log::error!("  [{}] connection closed during handshake", account.name);
            failed = true;
          }
          Err(error) => {
            log::error!("  [{}] handshake: {error:#}", account.name);
            failed = true;
          }
        }
      }
      if !failed {
        // Installed after the first handshake step, not on completion: the
        // remaining flights ride along inside the regular read path, and the
        // greeting stage must already be in place when the first plaintext
        // line surfaces there.
        driver.greet();
        *last_activity = now;
      }
    }
    if failed {
      self.disconnect(registry);
    }
  }

  fn on_readable(&mut self, registry: &mio::Registry, now: time::Instant) {
    let mut failed = false;
    {
      let Session { link, driver, account, buffer, last_activity, .. } = self;
      let Some(link) = link.as_mut() else { return };
      loop {
        match link.read(buffer.space()) {
          Ok(transport::Io::Ready(read)) => {
            buffer.advance(read);
            *last_activity = now;
          }
          Ok(transport::Io::WantRead) => {
            link.interest = Some(mio::Interest::READABLE);
            break;
          }
          Ok(transport::Io::WantWrite) => {
            link.interest = Some(mio::Interest::WRITABLE);
            break;
          }
          Ok(transport::Io::Closed) => {
            log::info!("  [{}] connection closed by peer", account.name);
            failed = true;
            break;
          }
          Err(error) => {
            log::error!("  [{}] read: {error:#}", account.name);
            failed = true;
            break;
          }
        }
      }
      if !failed {
        while let Some(line) = buffer.take_line() {
          log::debug!("  [{}] <<< {}", account.name, String::from_utf8_lossy(&line));
          match driver.on_line(account, &line, link) {
            Ok(Flow::Continue) => (),
            Ok(Flow::Disconnect) => {
              failed = true;
              break;
            }
            Err(error) => {
              log::error!("  [{}] {error:#}", account.name);
              failed = true;
              break;
            }
          }
        }
      }
    }
    if failed {
      self.disconnect(registry);
    }
  }
}
