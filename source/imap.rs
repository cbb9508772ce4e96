// The monitor only consumes the handful of responses a mailbox pushes while
// it is being watched, so the grammar below covers that subset and nothing
// more. Anything else is reported as a parse failure and ignored by the
// caller (a client must be prepared to receive any response at all times, per
// https://www.rfc-editor.org/rfc/rfc3501#section-2.2.2).

use std::str;

/// One untagged server response, without its trailing CRLF.
#[derive(Debug, PartialEq)]
pub enum Untagged<'input> {
  Ok,
  Bye,
  Exists(u32),
  Expunge(u32),
  Fetch(u32, &'input [u8]),
  Search(Vec<u32>),
}

peg::parser! {
  // https://www.rfc-editor.org/rfc/rfc2234#section-2.3
  // https://www.rfc-editor.org/rfc/rfc3501#section-9
  pub grammar parser() for [u8] {
    // SP = %x20
    rule SP() = " "
    // DIGIT = %x30-39
    rule DIGIT() = [b'\x30'..=b'\x39']

    // number = 1*DIGIT
    // The unwrap is covered by DIGIT(); the parse can still overflow, which
    // fails the rule instead of the process.
    rule number() -> u32
      = n:$(DIGIT()+)
      {? str::from_utf8(n).unwrap().parse().or(Err("number")) }

    rule rest() -> &'input [u8]
      = r:$([_]*)
      { r }
    rule end() = ![_]
    // resp-text carries no information the monitor acts on.
    rule trailer() = (SP() [_]*)? end()

    // message-data = nz-number SP ("EXPUNGE" / ("FETCH" SP msg-att))
    // mailbox-data = "SEARCH" *(SP nz-number) / number SP "EXISTS" / ...
    // resp-cond-state = "OK" SP resp-text / ...
    // resp-cond-bye = "BYE" SP resp-text
    pub rule untagged() -> Untagged<'input>
      = "* " u:(
          n:number() SP() m:message(n) { m }
        / "OK" trailer() { Untagged::Ok }
        / "BYE" trailer() { Untagged::Bye }
        / "SEARCH" ns:(SP() n:number() { n })* end() { Untagged::Search(ns) }
      )
      { u }

    rule message(n: u32) -> Untagged<'input>
      = "EXISTS" end() { Untagged::Exists(n) }
      / "EXPUNGE" end() { Untagged::Expunge(n) }
      / "FETCH" SP() r:rest() { Untagged::Fetch(n, r) }
  }
}

/// The flag list of a FETCH is not worth a grammar of its own: the monitor
/// only cares whether \Seen appears anywhere in it.
pub fn seen(attributes: &[u8]) -> bool {
  memchr::memmem::find(attributes, br"\Seen").is_some()
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  #[test]
  fn ok() {
    assert_eq!(Untagged::Ok, parser::untagged(b"* OK Dovecot ready.").unwrap());
    assert_eq!(Untagged::Ok, parser::untagged(b"* OK Still here").unwrap());
    assert_eq!(Untagged::Ok, parser::untagged(b"* OK").unwrap());
  }

  #[test]
  fn bye() {
    assert_eq!(
      Untagged::Bye,
      parser::untagged(b"* BYE Autologout; idle for too long").unwrap()
    );
  }

  #[test]
  fn exists_and_expunge() {
    assert_eq!(Untagged::Exists(23), parser::untagged(b"* 23 EXISTS").unwrap());
    assert_eq!(Untagged::Expunge(4), parser::untagged(b"* 4 EXPUNGE").unwrap());
    // EXISTS with trailing garbage isn't EXISTS.
    assert!(parser::untagged(b"* 23 EXISTSx").is_err());
  }

  #[test]
  fn fetch() {
    assert_eq!(
      Untagged::Fetch(12, &b"(FLAGS (\\Seen))"[..]),
      parser::untagged(b"* 12 FETCH (FLAGS (\\Seen))").unwrap()
    );
  }

  #[test]
  fn search() {
    assert_eq!(
      Untagged::Search(vec![2, 10, 11]),
      parser::untagged(b"* SEARCH 2 10 11").unwrap()
    );
    assert_eq!(Untagged::Search(vec![]), parser::untagged(b"* SEARCH").unwrap());
  }

  #[test]
  fn rejects_noise() {
    assert!(parser::untagged(b"A3 OK Search completed.").is_err());
    assert!(parser::untagged(b"+ idling").is_err());
    assert!(parser::untagged(b"* FLAGS (\\Answered \\Seen)").is_err());
    // Numbers that don't fit the sequence number space are noise too.
    assert!(parser::untagged(b"* 99999999999999999999 EXISTS").is_err());
  }

  #[test]
  fn seen_flag() {
    assert!(seen(b"(FLAGS (\\Seen))"));
    assert!(seen(b"(UID 7 FLAGS (\\Answered \\Seen))"));
    assert!(!seen(b"(FLAGS ())"));
    assert!(!seen(b"(FLAGS (\\Answered))"));
  }
}
