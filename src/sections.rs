//! Section roots
//!
//! A section is a top-level area of the namespace such as `/mp3`. Slavetop
//! needs it to find the release a path belongs to: the release is the direct
//! child of the section root on the way to the path.

use crate::error::{Result, StowageError};
use crate::tree::split_path;

/// Configured section roots
#[derive(Debug, Clone, Default)]
pub struct Sections {
    // longest first, so the first prefix match is the most specific root
    roots: Vec<String>,
}

fn has_prefix(path: &str, root: &str) -> bool {
    if root == "/" {
        return true;
    }
    match path.get(..root.len()) {
        Some(head) if head.eq_ignore_ascii_case(root) => {
            path.len() == root.len() || path.as_bytes()[root.len()] == b'/'
        }
        _ => false,
    }
}

impl Sections {
    /// No configured roots; every top-level directory is its own section
    pub fn new() -> Self {
        Self::default()
    }

    /// Sections rooted at `roots`
    pub fn with_roots<I, S>(roots: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut normalized = Vec::new();
        for root in roots {
            let root = root.as_ref();
            let parts = split_path(root)
                .map_err(|_| StowageError::config(format!("section root {} is not absolute", root)))?;
            normalized.push(format!("/{}", parts.join("/")));
        }
        normalized.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        normalized.dedup();
        Ok(Self { roots: normalized })
    }

    /// Configured roots, longest first
    pub fn roots(&self) -> &[String] {
        &self.roots
    }

    /// Section root that `path` falls under
    ///
    /// The longest configured root wins. Without a match the top-level
    /// directory of the path is the section; `/` itself has none.
    pub fn section_of(&self, path: &str) -> Option<String> {
        if let Some(root) = self.roots.iter().find(|r| has_prefix(path, r)) {
            return Some(root.clone());
        }
        let parts = split_path(path).ok()?;
        parts.first().map(|top| format!("/{}", top))
    }

    /// Release directory of `path`: the direct child of its section root
    ///
    /// `None` when the path is the section root itself.
    pub fn release_of(&self, path: &str) -> Option<String> {
        let section = self.section_of(path)?;
        let section_depth = split_path(&section).ok()?.len();
        let parts = split_path(path).ok()?;
        if parts.len() <= section_depth {
            return None;
        }
        Some(format!("/{}", parts[..=section_depth].join("/")))
    }
}
