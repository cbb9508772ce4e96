use crate::{account::Account, session, status};
use anyhow::Context as _;
use std::{io, path, sync, time};

// Upper bound on one readiness wait; timer effects are evaluated at least
// this often even when every server is quiet.
const POLL_TIMEOUT: time::Duration = time::Duration::from_secs(5);

/// The single-threaded readiness loop. Owns every session, the poll they
/// share, and the status publisher that runs after each cycle.
pub struct Reactor {
  poll: mio::Poll,
  events: mio::Events,
  sessions: Vec<session::Session>,
  publisher: status::Publisher,
  config: sync::Arc<rustls::ClientConfig>,
}

impl Reactor {
  pub fn new(
    accounts: Vec<Account>,
    config: sync::Arc<rustls::ClientConfig>,
    status_file: &path::Path,
  ) -> anyhow::Result<Self> {
    Ok(Self {
      poll: mio::Poll::new().context("couldn't create the poll")?,
      events: mio::Events::with_capacity(64),
      sessions: accounts.into_iter().map(session::Session::new).collect(),
      publisher: status::Publisher::new(status_file),
      config,
    })
  }

  /// Runs until the publisher fails; every other failure is confined to the
  /// session it happened on.
  pub fn run(&mut self) -> anyhow::Result<()> {
    let Self {
      poll,
      events,
      sessions,
      publisher,
      config,
    } = self;
    let registry = poll.registry().try_clone()?;
    loop {
      let now = time::Instant::now();
      for (index, session) in sessions.iter_mut().enumerate() {
        session.tick(now, &registry, config);
        session.sync_interest(&registry, mio::Token(index));
      }

      match poll.poll(events, Some(POLL_TIMEOUT)) {
        Ok(()) => (),
        Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
        Err(error) => return Err(error).context("poll failed"),
      }

      if !events.is_empty() {
        log::debug!("poll: {} event(s)", events.iter().count());
      }

      let now = time::Instant::now();
      for event in events.iter() {
        let mio::Token(index) = event.token();
        if let Some(session) = sessions.get_mut(index) {
          session.service(&registry, event, now);
        }
      }

      let counts: Vec<(&str, usize)> = sessions
        .iter()
        .map(|session| (session.name(), session.count()))
        .collect();
      publisher.publish(&counts)?;
    }
  }
}
