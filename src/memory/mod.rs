//! Working memory — the soul's structured, regioned conversational context.
//!
//! Every mutating operation returns a new `WorkingMemory`; the prior value
//! stays valid and unaffected. The scheduler relies on this to read a stable
//! pre-turn snapshot while a turn computes against its own snapshot, with no
//! locking.
//!
//! Regions are at-most-one-entry slots keyed by tag — the integrator uses the
//! `"core"` region to keep a single identity preamble installed without
//! duplicating it turn over turn. Serialization order places listed regions
//! first (in `region_order` order), then everything else in insertion order.

use serde::{Deserialize, Serialize};

use crate::types::MemoryEntry;

/// Immutable regioned sequence of conversational entries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkingMemory {
    soul_name: String,
    entries: Vec<MemoryEntry>,
    region_order: Vec<String>,
}

impl WorkingMemory {
    pub fn new(soul_name: impl Into<String>) -> Self {
        Self {
            soul_name: soul_name.into(),
            entries: Vec::new(),
            region_order: Vec::new(),
        }
    }

    pub fn soul_name(&self) -> &str {
        &self.soul_name
    }

    /// Entries in insertion order, ignoring regions
    pub fn entries(&self) -> &[MemoryEntry] {
        &self.entries
    }

    pub fn region_order(&self) -> &[String] {
        &self.region_order
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append an entry
    pub fn with_memory(&self, entry: MemoryEntry) -> Self {
        let mut next = self.clone();
        next.entries.push(entry);
        next
    }

    /// Set the single entry for a region slot — replaces in place if the tag
    /// already holds an entry, appends otherwise
    pub fn with_region(&self, tag: impl Into<String>, entry: MemoryEntry) -> Self {
        let tag = tag.into();
        let mut next = self.clone();
        let entry = MemoryEntry {
            region: Some(tag.clone()),
            ..entry
        };
        match next
            .entries
            .iter()
            .position(|e| e.region.as_deref() == Some(tag.as_str()))
        {
            Some(index) => next.entries[index] = entry,
            None => next.entries.push(entry),
        }
        next
    }

    /// Set the serialization order of region tags
    pub fn with_region_order<I, S>(&self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut next = self.clone();
        next.region_order = tags.into_iter().map(Into::into).collect();
        next
    }

    /// Drop every entry belonging to any of the given regions
    pub fn without_regions(&self, tags: &[&str]) -> Self {
        let mut next = self.clone();
        next.entries
            .retain(|e| !matches!(&e.region, Some(r) if tags.contains(&r.as_str())));
        next
    }

    /// Keep only entries belonging to one of the given regions
    pub fn with_only_regions(&self, tags: &[&str]) -> Self {
        let mut next = self.clone();
        next.entries
            .retain(|e| matches!(&e.region, Some(r) if tags.contains(&r.as_str())));
        next
    }

    /// Keep entries matching the predicate
    pub fn filter(&self, predicate: impl Fn(&MemoryEntry) -> bool) -> Self {
        let mut next = self.clone();
        next.entries.retain(|e| predicate(e));
        next
    }

    /// Keep the `[start, end)` range of entries (saturating, in insertion order)
    pub fn slice(&self, start: usize, end: usize) -> Self {
        let mut next = self.clone();
        let end = end.min(next.entries.len());
        let start = start.min(end);
        next.entries = next.entries[start..end].to_vec();
        next
    }

    /// Concatenate another memory's entries after this one's
    pub fn concat(&self, other: &WorkingMemory) -> Self {
        let mut next = self.clone();
        next.entries.extend(other.entries.iter().cloned());
        next
    }

    /// Entries in serialization order: listed regions first, in
    /// `region_order` order (original relative order within each region),
    /// then unregioned and unlisted-region entries in original relative order
    pub fn ordered_entries(&self) -> Vec<MemoryEntry> {
        let mut ordered = Vec::with_capacity(self.entries.len());
        for tag in &self.region_order {
            for entry in &self.entries {
                if entry.region.as_deref() == Some(tag.as_str()) {
                    ordered.push(entry.clone());
                }
            }
        }
        for entry in &self.entries {
            let listed = entry
                .region
                .as_deref()
                .map(|r| self.region_order.iter().any(|t| t == r))
                .unwrap_or(false);
            if !listed {
                ordered.push(entry.clone());
            }
        }
        ordered
    }
}
