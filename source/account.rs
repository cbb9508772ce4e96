use std::io;
use zeroize::Zeroize as _;

// Accounts past the cap are dropped so that a runaway input stream can't grow
// the poll set without bound.
pub const MAX_ACCOUNTS: usize = 10;

/// Immutable connection record for one mailbox.
pub struct Account {
  pub name: String,
  pub user: String,
  password: String,
  pub server: String,
  pub port: u16,
}

impl Account {
  pub fn new(name: &str, user: &str, password: &str, server: &str, port: u16) -> Self {
    Self {
      name: name.to_string(),
      user: user.to_string(),
      password: password.to_string(),
      server: server.to_string(),
      port,
    }
  }

  pub fn password(&self) -> &str {
    &self.password
  }
}

impl Drop for Account {
  fn drop(&mut self) {
    self.password.zeroize();
  }
}

/// Every 8th character survives, the rest becomes '*'. Enough to recognize
/// which password was loaded without disclosing it.
pub fn redact(password: &str) -> String {
  password
    .chars()
    .enumerate()
    .map(|(i, c)| if i % 8 == 0 { c } else { '*' })
    .collect()
}

/// Reads `name user password server port` records until EOF or the cap.
/// Malformed records are logged and skipped, they never abort the load.
pub fn load(reader: impl io::BufRead) -> anyhow::Result<Vec<Account>> {
  let mut accounts = Vec::new();
  for line in reader.lines().take(MAX_ACCOUNTS) {
    let mut line = line?;
    let record = line.strip_suffix('\r').unwrap_or(&line);
    match record.split(' ').collect::<Vec<_>>()[..] {
      [name, user, password, server, port]
        if !name.is_empty()
          && !user.is_empty()
          && !password.is_empty()
          && !server.is_empty()
          && !port.is_empty() =>
      {
        match port.parse::<u16>() {
          Ok(port) => {
            log::info!("[{name}] {user} {} {server}:{port}", redact(password));
            accounts.push(Account::new(name, user, password, server, port));
          }
          Err(error) => log::error!("[{name}] unusable port {port:?}: {error}"),
        }
      }
      _ => log::error!("skipping malformed account record"),
    }
    line.zeroize();
  }
  Ok(accounts)
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  #[test]
  fn load_record() {
    let accounts = load(&b"work user hunter2 imap.example.org 993\n"[..]).unwrap();
    assert_eq!(1, accounts.len());
    assert_eq!("work", accounts[0].name);
    assert_eq!("user", accounts[0].user);
    assert_eq!("hunter2", accounts[0].password());
    assert_eq!("imap.example.org", accounts[0].server);
    assert_eq!(993, accounts[0].port);
  }

  #[test]
  fn load_skips_malformed() {
    let input = b"short line\n\
                  a u p s 993\n\
                  trailing empty field s 993 \n\
                  b u p s notaport\n\
                  c u p s 143\n";
    let accounts = load(&input[..]).unwrap();
    assert_eq!(
      vec!["a", "c"],
      accounts.iter().map(|a| a.name.as_str()).collect::<Vec<_>>()
    );
  }

  #[test]
  fn load_stops_at_cap() {
    let input = (0..15)
      .map(|i| format!("a{i} u p s 993\n"))
      .collect::<String>();
    let accounts = load(input.as_bytes()).unwrap();
    assert_eq!(MAX_ACCOUNTS, accounts.len());
  }

  #[test]
  fn redacted() {
    assert_eq!("", redact(""));
    assert_eq!("h******", redact("hunter2"));
    assert_eq!("c*******c*******c", redact("correct horse bat"));
  }
}
