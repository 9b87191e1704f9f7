//! Name and path handling.

use crate::error::{Result, SfsError};
use crate::param::{MAXNAME, SEPARATOR};

/// A validated file name: at most `MAXNAME` bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileName<'s> {
    inner: &'s str,
}

impl<'s> FileName<'s> {
    pub fn new(name: &'s str) -> Result<FileName<'s>> {
        if name.len() > MAXNAME {
            return Err(SfsError::NameTooLong);
        }
        Ok(FileName { inner: name })
    }

    pub fn as_str(&self) -> &'s str {
        self.inner
    }

    pub fn as_bytes(&self) -> &'s [u8] {
        self.inner.as_bytes()
    }
}

/// A borrowed `\`-separated path, resolved from the root directory.
///
/// Paths never name the root itself: `root\a\b.txt` is spelled `a\b.txt`.
#[derive(Clone, Copy, Debug)]
pub struct Path<'s> {
    inner: &'s str,
}

impl<'s> Path<'s> {
    pub fn new(path: &'s str) -> Path<'s> {
        Path { inner: path }
    }

    /// Directory components leading to the terminal name.
    pub fn dirs(&self) -> impl Iterator<Item = &'s str> {
        let (dirs, _) = self.split();
        dirs.into_iter().flat_map(|d| d.split(SEPARATOR))
    }

    /// The terminal name.
    pub fn name(&self) -> &'s str {
        self.split().1
    }

    fn split(&self) -> (Option<&'s str>, &'s str) {
        match self.inner.rsplit_once(SEPARATOR) {
            Some((dirs, name)) => (Some(dirs), name),
            None => (None, self.inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_name_has_no_dirs() {
        let p = Path::new("notes.txt");
        assert_eq!(p.dirs().count(), 0);
        assert_eq!(p.name(), "notes.txt");
    }

    #[test]
    fn nested_path_splits_in_order() {
        let p = Path::new("a\\bb\\c.txt");
        assert_eq!(p.dirs().collect::<Vec<_>>(), ["a", "bb"]);
        assert_eq!(p.name(), "c.txt");
    }

    #[test]
    fn empty_components_are_preserved() {
        // A doubled separator names an empty entry, which can never be
        // found; resolution fails instead of silently skipping it.
        let p = Path::new("a\\\\c");
        assert_eq!(p.dirs().collect::<Vec<_>>(), ["a", ""]);

        let p = Path::new("a\\");
        assert_eq!(p.dirs().collect::<Vec<_>>(), ["a"]);
        assert_eq!(p.name(), "");
    }

    #[test]
    fn name_length_is_capped() {
        assert!(FileName::new("12345678901234567890").is_ok());
        assert!(matches!(
            FileName::new("123456789012345678901"),
            Err(SfsError::NameTooLong)
        ));
    }
}
