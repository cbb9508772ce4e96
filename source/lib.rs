// https://www.rfc-editor.org/rfc/rfc3501 - IMAP4rev1
// https://www.rfc-editor.org/rfc/rfc2177 - IMAP4 IDLE command

use anyhow::Context as _;
use std::{io, path, sync};

pub mod account;
pub mod imap;
mod reactor;
pub mod session;
pub mod status;
pub mod transport;
pub mod unseen;

#[derive(clap::Args)]
#[group(skip)]
pub struct Arguments {
  #[arg(help = "Status file rewritten whenever an unseen count changes")]
  pub status_file: path::PathBuf,
}

/// Reads accounts from standard input (one `name user password server port`
/// record per line) and monitors them until the process is killed.
pub fn run(arguments: &Arguments) -> anyhow::Result<()> {
  let config = tls_config()?;
  let stdin = io::stdin();
  let accounts = account::load(stdin.lock())?;
  anyhow::ensure!(!accounts.is_empty(), "no accounts on standard input");
  reactor::Reactor::new(accounts, config, &arguments.status_file)?.run()
}

fn tls_config() -> anyhow::Result<sync::Arc<rustls::ClientConfig>> {
  let mut root_store = rustls::RootCertStore::empty();
  for certificate in
    rustls_native_certs::load_native_certs().context("couldn't load the native certificates")?
  {
    root_store.add(&rustls::Certificate(certificate.0))?
  }
  Ok(sync::Arc::new(
    rustls::ClientConfig::builder()
      .with_safe_defaults()
      .with_root_certificates(root_store)
      .with_no_client_auth(),
  ))
}
