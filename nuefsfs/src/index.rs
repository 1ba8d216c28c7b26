// VirtualTreeIndex :: the read-only lookup structure behind a live mount.
// Built once from compiled manifest entries; an update replaces the whole
// index, so concurrent readers never need synchronization.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

use indexmap::IndexMap;

use crate::manifest::{ManifestEntry, ManifestError, OwnerInfo};

/// How a virtual path resolves against the index.
/// Handlers branch on the variant; there is no dynamic dispatch at the seam.
pub enum Resolution<'a> {
    /// The path is itself a registered entry.
    Exact(&'a ManifestEntry),

    /// The path lives inside a registered directory's backend.
    Descend {
        entry: &'a ManifestEntry,
        backend: PathBuf,
    },

    /// The path is a directory implied by deeper entries; it has no backend.
    Synthetic,
}

/// The in-memory index over one mount's manifest.
pub struct VirtualTreeIndex {
    /// Exact-match table, in registration order.
    entries: IndexMap<String, ManifestEntry>,

    /// Direct children of every virtual directory, explicit or inferred.
    /// The root uses the empty key.
    children: HashMap<String, BTreeSet<String>>,

    /// Ordered table of registered directory paths, for longest-prefix lookups.
    prefixes: BTreeSet<String>,
}

impl VirtualTreeIndex {
    /// An index with no entries; the mount then exposes an empty root.
    pub fn empty() -> Self {
        Self {
            entries: IndexMap::new(),
            children: HashMap::new(),
            prefixes: BTreeSet::new(),
        }
    }

    /// Builds the index, validating every entry and applying the same merge
    /// rule as the compiler: last entry wins, directories never replace
    /// directories.
    pub fn build(
        source: impl IntoIterator<Item = ManifestEntry>,
    ) -> Result<Self, ManifestError> {
        let mut entries: IndexMap<String, ManifestEntry> = IndexMap::new();

        for entry in source {
            entry.validate()?;

            if let Some(existing) = entries.get(&entry.virtual_path) {
                if existing.is_dir && entry.is_dir {
                    continue;
                }
            }

            entries.insert(entry.virtual_path.clone(), entry);
        }

        let mut children: HashMap<String, BTreeSet<String>> = HashMap::new();
        let mut prefixes = BTreeSet::new();

        for (virt, entry) in &entries {
            if entry.is_dir {
                prefixes.insert(virt.clone());
            }

            // Every path segment implies its parent directory.
            let mut parent = "";
            for (offset, _) in virt.match_indices('/') {
                let child = virt[parent.len()..offset].trim_start_matches('/');
                children
                    .entry(parent.trim_end_matches('/').to_string())
                    .or_default()
                    .insert(child.to_string());
                parent = &virt[..offset];
            }

            let name = match virt.rfind('/') {
                Some(idx) => &virt[idx + 1..],
                None => virt.as_str(),
            };
            children
                .entry(parent.to_string())
                .or_default()
                .insert(name.to_string());
        }

        Ok(Self {
            entries,
            children,
            prefixes,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All registered entries, in registration order.
    pub fn entries(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.entries.values()
    }

    pub fn lookup_exact(&self, virt: &str) -> Option<&ManifestEntry> {
        self.entries.get(virt)
    }

    /// Finds the longest registered directory that is `virt` or an ancestor of
    /// it, returning the entry and the remainder below it ("" when equal).
    pub fn lookup_prefix<'v>(&self, virt: &'v str) -> Option<(&ManifestEntry, &'v str)> {
        let mut candidate = virt;

        loop {
            if self.prefixes.contains(candidate) {
                let entry = self.entries.get(candidate)?;
                let remainder = virt[candidate.len()..].trim_start_matches('/');
                return Some((entry, remainder));
            }

            candidate = match candidate.rfind('/') {
                Some(idx) => &candidate[..idx],
                None => return None,
            };
        }
    }

    /// Direct child names of a virtual directory, or *None* when the path is
    /// not a directory the index knows about.
    pub fn children_of(&self, virt: &str) -> Option<BTreeSet<String>> {
        if let Some(names) = self.children.get(virt) {
            return Some(names.clone());
        }

        let known_dir =
            virt.is_empty() || self.entries.get(virt).is_some_and(|entry| entry.is_dir);

        known_dir.then(BTreeSet::new)
    }

    /// True when the path is a registered directory or implied by one.
    pub fn is_dir(&self, virt: &str) -> bool {
        if virt.is_empty() {
            return true;
        }

        self.entries
            .get(virt)
            .map(|entry| entry.is_dir)
            .unwrap_or_else(|| self.children.contains_key(virt))
    }

    /// Resolution precedence: exact entry, then longest prefix descent, then
    /// synthetic directory, then nothing.
    pub fn resolve(&self, virt: &str) -> Option<Resolution<'_>> {
        if virt.is_empty() {
            return Some(Resolution::Synthetic);
        }

        if let Some(entry) = self.entries.get(virt) {
            return Some(Resolution::Exact(entry));
        }

        if let Some((entry, remainder)) = self.lookup_prefix(virt) {
            return Some(Resolution::Descend {
                entry,
                backend: entry.backend_path.join(remainder),
            });
        }

        if self.children.contains_key(virt) {
            return Some(Resolution::Synthetic);
        }

        None
    }

    /// The backend path serving a virtual path, when one exists.
    pub fn backend_of(&self, virt: &str) -> Option<PathBuf> {
        match self.resolve(virt)? {
            Resolution::Exact(entry) => Some(entry.backend_path.clone()),
            Resolution::Descend { backend, .. } => Some(backend),
            Resolution::Synthetic => None,
        }
    }

    /// The registered mapping that owns a virtual path.
    /// Synthetic directories belong to no layer and return *None*.
    pub fn which(&self, virt: &str) -> Option<OwnerInfo> {
        match self.resolve(virt)? {
            Resolution::Exact(entry) => Some(OwnerInfo {
                owner: entry.virtual_path.clone(),
                backend_path: entry.backend_path.clone(),
            }),
            Resolution::Descend { entry, backend } => Some(OwnerInfo {
                owner: entry.virtual_path.clone(),
                backend_path: backend,
            }),
            Resolution::Synthetic => None,
        }
    }
}
