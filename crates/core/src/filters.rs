//! Task-selection policy.
//!
//! A [`Filters`] table maps each [`SourceKind`] to an ordered list of
//! predicates. A candidate is admitted only when its kind has at least one
//! registered predicate and all of them pass; everything else fails closed.

use std::collections::HashMap;
use std::fmt;

use crate::model::{SourceKind, TaskDescriptor};

/// Admission predicate over a candidate.
pub type Predicate<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

/// Anything that can be routed to a predicate list by source kind.
pub trait Classified {
    /// Known source kind, `None` when unknown.
    fn source_kind(&self) -> Option<SourceKind>;
}

impl Classified for TaskDescriptor {
    fn source_kind(&self) -> Option<SourceKind> {
        TaskDescriptor::source_kind(self)
    }
}

/// Registrable per-kind predicate table.
pub struct Filters<T> {
    sources: HashMap<SourceKind, Vec<Predicate<T>>>,
}

impl<T> Default for Filters<T> {
    fn default() -> Self {
        Self {
            sources: HashMap::new(),
        }
    }
}

impl<T> fmt::Debug for Filters<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self
            .sources
            .iter()
            .map(|(kind, preds)| (kind.tag(), preds.len()))
            .collect();
        kinds.sort_unstable();
        f.debug_struct("Filters").field("sources", &kinds).finish()
    }
}

impl<T: Classified> Filters<T> {
    /// Empty table; admits nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a predicate to the list of `kind`.
    pub fn register<F>(&mut self, kind: SourceKind, predicate: F) -> &mut Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.sources
            .entry(kind)
            .or_default()
            .push(Box::new(predicate));
        self
    }

    /// Builder form of [`Filters::register`].
    pub fn with<F>(mut self, kind: SourceKind, predicate: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.register(kind, predicate);
        self
    }

    /// Whether `item` passes every predicate registered for its kind.
    pub fn admits(&self, item: &T) -> bool {
        let Some(kind) = item.source_kind() else {
            return false;
        };
        match self.sources.get(&kind) {
            Some(predicates) if !predicates.is_empty() => predicates.iter().all(|p| p(item)),
            _ => false,
        }
    }

    /// First admitted element of `batch`, in batch order.
    pub fn get<'a>(&self, batch: &'a [T]) -> Option<&'a T> {
        batch.iter().find(|item| self.admits(item))
    }
}

impl Filters<TaskDescriptor> {
    /// Policy used by the importer daemon: the branch must be set and the
    /// kind's required payload fields must be present and non-empty.
    pub fn importer_defaults() -> Self {
        let mut filters = Self::new();
        for kind in SourceKind::ALL {
            filters.register(kind, |d: &TaskDescriptor| !d.branch.trim().is_empty());
            let fields = required_fields(kind);
            filters.register(kind, move |d: &TaskDescriptor| {
                let source = d.source_fields();
                fields
                    .iter()
                    .all(|name| source.get(*name).is_some_and(is_present))
            });
        }
        filters
    }
}

fn required_fields(kind: SourceKind) -> &'static [&'static str] {
    match kind {
        SourceKind::SrpmLink => &["url"],
        SourceKind::SrpmUpload => &["tmp", "pkg"],
        SourceKind::GitAndTito => &["git_url"],
        SourceKind::MockScm => &["scm_url", "spec"],
        SourceKind::Pypi => &["pypi_package_name"],
        SourceKind::Rubygems => &["gem_name"],
    }
}

fn is_present(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => false,
        serde_json::Value::String(s) => !s.trim().is_empty(),
        _ => true,
    }
}
