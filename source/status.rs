use anyhow::Context as _;
use std::{fs, path};

/// Rewrites the status file whenever any account's unseen count moved away
/// from what was last written. Counts are cached so an unchanged cycle does
/// not touch the file at all.
pub struct Publisher {
  path: path::PathBuf,
  last: Option<Vec<usize>>,
}

impl Publisher {
  pub fn new(path: &path::Path) -> Self {
    Self {
      path: path.to_path_buf(),
      last: None,
    }
  }

  /// Returns whether the file was rewritten. A write failure is fatal to the
  /// caller's loop, not to the sessions.
  pub fn publish(&mut self, counts: &[(&str, usize)]) -> anyhow::Result<bool> {
    let current: Vec<usize> = counts.iter().map(|&(_, count)| count).collect();
    if self.last.as_ref() == Some(&current) {
      return Ok(false);
    }
    let line = render(counts);
    fs::write(&self.path, &line)
      .with_context(|| format!("couldn't write status file {:?}", self.path))?;
    log::debug!("status: {line:?}");
    self.last = Some(current);
    Ok(true)
  }
}

/// `"(name: count) "` for every account with unseen mail, closed off with
/// `"| "`; accounts with nothing unseen stay out of the line entirely.
pub fn render(counts: &[(&str, usize)]) -> String {
  let mut line = String::new();
  for &(name, count) in counts {
    if count > 0 {
      line += &format!("({name}: {count}) ");
    }
  }
  if !line.is_empty() {
    line += "| ";
  }
  line
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  #[test]
  fn rendering() {
    assert_eq!("", render(&[]));
    assert_eq!("", render(&[("work", 0), ("home", 0)]));
    assert_eq!("(work: 2) | ", render(&[("work", 2), ("home", 0)]));
    assert_eq!("(work: 2) (home: 1) | ", render(&[("work", 2), ("home", 1)]));
  }

  #[test]
  fn publishes_only_changes() {
    let directory = tempfile::tempdir().unwrap();
    let path = directory.path().join("status");
    let mut publisher = Publisher::new(&path);

    // The very first cycle establishes the file.
    assert!(publisher.publish(&[("work", 0)]).unwrap());
    assert_eq!("", fs::read_to_string(&path).unwrap());

    assert!(publisher.publish(&[("work", 2)]).unwrap());
    assert_eq!("(work: 2) | ", fs::read_to_string(&path).unwrap());

    // Unchanged counts leave the file alone, even if it disappeared.
    fs::remove_file(&path).unwrap();
    assert!(!publisher.publish(&[("work", 2)]).unwrap());
    assert!(!path.exists());

    assert!(publisher.publish(&[("work", 0)]).unwrap());
    assert_eq!("", fs::read_to_string(&path).unwrap());
  }

  #[test]
  fn write_failure_is_an_error() {
    let directory = tempfile::tempdir().unwrap();
    let path = directory.path().join("missing").join("status");
    let mut publisher = Publisher::new(&path);
    assert!(publisher.publish(&[("work", 1)]).is_err());
  }
}
