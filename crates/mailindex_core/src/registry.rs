//! Process-wide extension and keyword registrations.
//!
//! A [`Registry`] is created once per process and handed to every
//! [`MailIndex`](crate::MailIndex) opened in it. Different mailboxes
//! introduce keywords at different times, so the tables only ever grow.

use crate::error::{CoreError, CoreResult};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Handle of a registered extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExtId(pub u32);

/// Handle of a keyword name in the process-wide table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeywordId(pub u32);

impl fmt::Display for ExtId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ext#{}", self.0)
    }
}

/// Default layout of a registered extension.
///
/// The values are used when the extension is first introduced to an index;
/// an index that already carries the extension keeps its own layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtRegistration {
    /// Unique extension name.
    pub name: String,
    /// Size of the extension's header area.
    pub hdr_size: u32,
    /// Size of the per-message record area.
    pub record_size: u16,
    /// Alignment of the per-message record area (1, 2, 4 or 8).
    pub record_align: u16,
}

#[derive(Debug, Default)]
struct RegistryInner {
    exts: Vec<ExtRegistration>,
    ext_by_name: HashMap<String, ExtId>,
    keywords: Vec<String>,
    keyword_by_name: HashMap<String, KeywordId>,
}

/// Extension and keyword tables shared by every index in a process.
///
/// # Thread Safety
///
/// Lookups take a read lock; registrations take a write lock. Ids are never
/// reused, so a looked-up id stays valid for the life of the registry.
#[derive(Debug, Default)]
pub struct Registry {
    inner: RwLock<RegistryInner>,
}

impl Registry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers an extension, or returns the id of an existing
    /// registration with the same name.
    ///
    /// # Panics
    ///
    /// Panics on an empty name or an alignment that is not 1, 2, 4 or 8.
    pub fn register_ext(
        &self,
        name: &str,
        hdr_size: u32,
        record_size: u16,
        record_align: u16,
    ) -> ExtId {
        assert!(!name.is_empty(), "extension name must not be empty");
        assert!(
            matches!(record_align, 1 | 2 | 4 | 8),
            "invalid extension alignment {record_align}"
        );

        if let Some(&id) = self.inner.read().ext_by_name.get(name) {
            return id;
        }

        let mut inner = self.inner.write();
        if let Some(&id) = inner.ext_by_name.get(name) {
            return id;
        }
        let id = ExtId(inner.exts.len() as u32);
        inner.exts.push(ExtRegistration {
            name: name.to_string(),
            hdr_size,
            record_size,
            record_align,
        });
        inner.ext_by_name.insert(name.to_string(), id);
        tracing::debug!(name, ?id, hdr_size, record_size, "registered extension");
        id
    }

    /// Returns the registration behind an id.
    #[must_use]
    pub fn ext(&self, id: ExtId) -> Option<ExtRegistration> {
        self.inner.read().exts.get(id.0 as usize).cloned()
    }

    /// Looks up an extension by name.
    #[must_use]
    pub fn ext_id(&self, name: &str) -> Option<ExtId> {
        self.inner.read().ext_by_name.get(name).copied()
    }

    /// Returns the id of a keyword, registering it if it is new.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` for names that cannot be stored: empty
    /// names or names containing NUL.
    pub fn keyword_lookup_or_create(&self, name: &str) -> CoreResult<KeywordId> {
        if name.is_empty() || name.contains('\0') {
            return Err(CoreError::invalid_operation(format!(
                "invalid keyword name {name:?}"
            )));
        }

        if let Some(&id) = self.inner.read().keyword_by_name.get(name) {
            return Ok(id);
        }

        let mut inner = self.inner.write();
        if let Some(&id) = inner.keyword_by_name.get(name) {
            return Ok(id);
        }
        let id = KeywordId(inner.keywords.len() as u32);
        inner.keywords.push(name.to_string());
        inner.keyword_by_name.insert(name.to_string(), id);
        Ok(id)
    }

    /// Looks up a keyword without registering it.
    #[must_use]
    pub fn keyword_lookup(&self, name: &str) -> Option<KeywordId> {
        self.inner.read().keyword_by_name.get(name).copied()
    }

    /// Returns the name of a keyword.
    #[must_use]
    pub fn keyword_name(&self, id: KeywordId) -> Option<String> {
        self.inner.read().keywords.get(id.0 as usize).cloned()
    }

    /// Returns the number of keywords known to the process.
    #[must_use]
    pub fn keywords_count(&self) -> usize {
        self.inner.read().keywords.len()
    }

    /// Builds a keyword set from names, registering unknown ones.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if any name is invalid.
    pub fn keywords_create<S: AsRef<str>>(&self, names: &[S]) -> CoreResult<KeywordSet> {
        let ids = names
            .iter()
            .map(|name| self.keyword_lookup_or_create(name.as_ref()))
            .collect::<CoreResult<Vec<_>>>()?;
        Ok(KeywordSet::from_ids(ids))
    }
}

/// A sorted, de-duplicated set of keywords.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeywordSet {
    ids: Vec<KeywordId>,
}

impl KeywordSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a set from ids in any order.
    #[must_use]
    pub fn from_ids(mut ids: Vec<KeywordId>) -> Self {
        ids.sort_unstable();
        ids.dedup();
        Self { ids }
    }

    /// Returns true if the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Returns the number of keywords in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Returns true if the keyword is in the set.
    #[must_use]
    pub fn contains(&self, id: KeywordId) -> bool {
        self.ids.binary_search(&id).is_ok()
    }

    /// Iterates over the keywords in id order.
    pub fn iter(&self) -> impl Iterator<Item = KeywordId> + '_ {
        self.ids.iter().copied()
    }
}
