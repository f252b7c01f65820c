//! Component-wise path values for the guest namespace and the host tree.
//!
//! A path is a list of components plus an absolute flag. Empty segments are
//! dropped on construction, so `"/a//b/"` and `"/a/b"` are the same value.

use std::fmt;
use std::marker::PhantomData;
use std::ops::{Div, DivAssign};
use std::path::PathBuf;

/// Separator policy for a path family. The derives on [`PathOf`] need the
/// marker itself to be `Clone`, `Eq` and `Hash`.
pub trait Separator: fmt::Debug + Clone + Copy + PartialEq + Eq + std::hash::Hash {
    const SEP: char;
}

/// Paths as the guest sees them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Guest;

/// Paths on the host filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Host;

impl Separator for Guest {
    const SEP: char = '/';
}

impl Separator for Host {
    const SEP: char = std::path::MAIN_SEPARATOR;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathOf<S> {
    components: Vec<String>,
    absolute: bool,
    _sep: PhantomData<S>,
}

/// Guest-visible path (what arrives in protocol requests).
pub type VfsPath = PathOf<Guest>;
/// Host filesystem path below the export root.
pub type HostPath = PathOf<Host>;

impl<S: Separator> PathOf<S> {
    /// Split `s` on the separator. A leading separator makes it absolute.
    pub fn new(s: &str) -> Self {
        Self {
            components: s
                .split(S::SEP)
                .filter(|c| !c.is_empty())
                .map(str::to_owned)
                .collect(),
            absolute: s.starts_with(S::SEP),
            _sep: PhantomData,
        }
    }

    pub fn root() -> Self {
        Self::from_components(Vec::new(), true)
    }

    fn from_components(components: Vec<String>, absolute: bool) -> Self {
        Self {
            components,
            absolute,
            _sep: PhantomData,
        }
    }

    /// Re-express another path family's components under this separator.
    pub fn from_path<T>(other: &PathOf<T>) -> Self {
        Self::from_components(other.components.clone(), other.absolute)
    }

    pub fn is_absolute(&self) -> bool {
        self.absolute
    }

    /// True for `/`.
    pub fn is_root(&self) -> bool {
        self.absolute && self.components.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        !self.absolute && self.components.is_empty()
    }

    pub fn components(&self) -> &[String] {
        &self.components
    }

    pub fn file_name(&self) -> Option<&str> {
        self.components.last().map(String::as_str)
    }

    /// Path without its last component; the parent of `/` is `/`.
    pub fn parent(&self) -> Self {
        let mut components = self.components.clone();
        components.pop();
        Self::from_components(components, self.absolute)
    }

    /// The same components, anchored at the root.
    pub fn to_absolute(&self) -> Self {
        Self::from_components(self.components.clone(), true)
    }

    /// Append a single name (which may itself contain separators).
    pub fn join_name(&self, name: &str) -> Self {
        self / &Self::new(name)
    }

    /// Component-wise prefix test. Both paths must agree on absoluteness.
    pub fn starts_with(&self, base: &Self) -> bool {
        self.absolute == base.absolute
            && self.components.len() >= base.components.len()
            && self.components[..base.components.len()] == base.components[..]
    }

    /// Remainder of `self` after `base`, as a relative path.
    pub fn strip_prefix(&self, base: &Self) -> Option<Self> {
        if !self.starts_with(base) {
            return None;
        }
        Some(Self::from_components(
            self.components[base.components.len()..].to_vec(),
            false,
        ))
    }

    /// `path` with `base` stripped if it is a prefix, otherwise `path`.
    pub fn relative(path: &Self, base: &Self) -> Self {
        path.strip_prefix(base).unwrap_or_else(|| path.clone())
    }

    /// Resolve `.` and `..` without touching the filesystem.
    ///
    /// `..` never climbs above the first component: `/../x` is `/x` and a
    /// relative `../x` is `x`. The result contains no `.` or `..`
    /// components, so canonicalizing twice yields the same path.
    pub fn canonicalize(&self) -> Self {
        let mut out: Vec<String> = Vec::with_capacity(self.components.len());
        for c in &self.components {
            match c.as_str() {
                "." => {}
                ".." => {
                    out.pop();
                }
                _ => out.push(c.clone()),
            }
        }
        Self::from_components(out, self.absolute)
    }

    pub fn to_path_buf(&self) -> PathBuf {
        PathBuf::from(self.to_string())
    }
}

impl<S: Separator> Default for PathOf<S> {
    fn default() -> Self {
        Self::from_components(Vec::new(), false)
    }
}

impl<S: Separator> fmt::Display for PathOf<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.absolute {
            write!(f, "{}", S::SEP)?;
        }
        for (i, c) in self.components.iter().enumerate() {
            if i > 0 {
                write!(f, "{}", S::SEP)?;
            }
            f.write_str(c)?;
        }
        Ok(())
    }
}

impl<S: Separator> From<&str> for PathOf<S> {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl<S: Separator> Div<&PathOf<S>> for &PathOf<S> {
    type Output = PathOf<S>;

    fn div(self, rhs: &PathOf<S>) -> PathOf<S> {
        let mut components = self.components.clone();
        components.extend(rhs.components.iter().cloned());
        PathOf::from_components(components, self.absolute)
    }
}

impl<S: Separator> DivAssign<&PathOf<S>> for PathOf<S> {
    fn div_assign(&mut self, rhs: &PathOf<S>) {
        self.components.extend(rhs.components.iter().cloned());
    }
}
