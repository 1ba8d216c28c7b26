// Layer declarations and the manifest compiler.
// A layer maps one backend source path into the virtual tree; compiling an
// ordered list of layers yields the flat virtual-path -> backend-path manifest
// that a VirtualTreeIndex is built from.

use std::fs;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Names never picked up while expanding a layer source.
/// Only an explicit mount targeting `.git` re-admits `.git` itself.
const SKIP_NAMES: [&str; 6] = [
    ".git",
    ".pixi",
    "node_modules",
    "__pycache__",
    ".venv",
    "target",
];

/// A gitignore-style matcher supplied by the caller.
/// The compiler treats it as a black box over entry names.
pub type NamePredicate = Box<dyn Fn(&str) -> bool + Send + Sync>;

/// Error raised while compiling layers or validating manifest entries.
#[derive(Error, Debug)]
pub enum ManifestError {
    /// The virtual path breaks one of the rules for relative POSIX paths.
    #[error("invalid virtual path '{path}': {reason}")]
    InvalidVirtualPath { path: String, reason: &'static str },

    /// Backend paths must always be absolute host paths.
    #[error("backend path '{}' must be absolute", .0.display())]
    RelativeBackendPath(PathBuf),

    /// A layer may filter with include or exclude, never both.
    #[error("layer '{0}' declares both include and exclude")]
    IncludeAndExclude(String),
}

/// One user-declared mount rule.
///
/// A trailing `/` on the source string expands the directory's contents into
/// the target; without it, the source itself is registered as a single entry.
pub struct Layer {
    source: String,
    target: String,
    exclude: Option<NamePredicate>,
    include: Option<NamePredicate>,
}

impl Layer {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            exclude: None,
            include: None,
        }
    }

    /// Suppresses entries whose name matches the predicate.
    pub fn exclude(mut self, pred: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.exclude = Some(Box::new(pred));
        self
    }

    /// Admits only entries whose name matches the predicate.
    pub fn include(mut self, pred: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.include = Some(Box::new(pred));
        self
    }
}

/// A compiled mapping from one virtual path to the backend path serving it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub virtual_path: String,
    pub backend_path: PathBuf,
    pub is_dir: bool,
}

impl ManifestEntry {
    pub fn new(
        virtual_path: impl Into<String>,
        backend_path: impl Into<PathBuf>,
        is_dir: bool,
    ) -> Result<Self, ManifestError> {
        let entry = Self {
            virtual_path: virtual_path.into(),
            backend_path: backend_path.into(),
            is_dir,
        };

        entry.validate()?;
        Ok(entry)
    }

    /// Checks the path rules; entries arriving over the wire go through this
    /// again during index construction.
    pub fn validate(&self) -> Result<(), ManifestError> {
        validate_virtual_path(&self.virtual_path)?;

        if !self.backend_path.is_absolute() {
            return Err(ManifestError::RelativeBackendPath(self.backend_path.clone()));
        }

        Ok(())
    }
}

/// Answer to a `which` query: the registered mapping that owns a path.
/// `owner` is the virtual path of the winning entry; for a dynamic descent it
/// names the registered ancestor the resolution went through.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerInfo {
    pub owner: String,
    pub backend_path: PathBuf,
}

/// Enforces the virtual-path rules: relative, `/`-separated, no `.`/`..`.
pub fn validate_virtual_path(path: &str) -> Result<(), ManifestError> {
    let reason = if path.is_empty() {
        Some("must not be empty")
    } else if path == "." {
        Some("must not be '.'")
    } else if path.starts_with('/') {
        Some("must be relative")
    } else if path.contains('\\') {
        Some("must use '/' separators")
    } else if path
        .split('/')
        .any(|seg| seg.is_empty() || seg == "." || seg == "..")
    {
        Some("must not contain empty, '.' or '..' segments")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(ManifestError::InvalidVirtualPath {
            path: path.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

/// Compiles an ordered list of layers into the virtual manifest.
///
/// The output map is insertion-ordered, so compiling the same layers against
/// the same filesystem state always yields the same manifest.
pub fn compile(layers: &[Layer]) -> Result<IndexMap<String, ManifestEntry>, ManifestError> {
    let mut entries = IndexMap::new();

    for layer in layers {
        apply_layer(&mut entries, layer)?;
    }

    Ok(entries)
}

fn apply_layer(
    entries: &mut IndexMap<String, ManifestEntry>,
    layer: &Layer,
) -> Result<(), ManifestError> {
    if layer.exclude.is_some() && layer.include.is_some() {
        return Err(ManifestError::IncludeAndExclude(layer.source.clone()));
    }

    let target = normalize_target(&layer.target)?;
    let expand = layer.source.trim_end().ends_with('/');
    let source = PathBuf::from(trim_source(&layer.source));

    let Ok(meta) = fs::metadata(&source) else {
        debug!("layer source '{}' is absent, skipping", source.display());
        return Ok(());
    };

    if meta.is_file() {
        let Some(name) = basename(&source) else {
            warn!("layer source '{}' has no usable name", source.display());
            return Ok(());
        };

        if !admits(layer, name) {
            return Ok(());
        }

        let virt = match &target {
            Some(target) => target.clone(),
            None => name.to_string(),
        };

        register(entries, ManifestEntry::new(virt, source, false)?);
        return Ok(());
    }

    // A directory without the trailing slash becomes one entry covering the
    // whole subtree; descendants stay reachable through dynamic descent.
    if !expand {
        let virt = match &target {
            Some(target) => target.clone(),
            None => match basename(&source) {
                Some(name) => name.to_string(),
                None => {
                    warn!("layer source '{}' has no usable name", source.display());
                    return Ok(());
                }
            },
        };

        register(entries, ManifestEntry::new(virt, source, true)?);
        return Ok(());
    }

    let git_target = target
        .as_deref()
        .is_some_and(|t| t == ".git" || t.starts_with(".git/"));

    let children = match fs::read_dir(&source) {
        Ok(children) => children,
        Err(err) => {
            warn!(
                "cannot enumerate layer source '{}': {}",
                source.display(),
                err
            );
            return Ok(());
        }
    };

    for child in children.flatten() {
        let Some(name) = child.file_name().to_str().map(str::to_string) else {
            warn!("skipping non-UTF-8 name under '{}'", source.display());
            continue;
        };

        if skipped(&name, git_target) || !admits(layer, &name) {
            continue;
        }

        // An unreadable child drops that child alone, never the whole layer.
        let Ok(file_type) = child.file_type() else {
            continue;
        };

        let virt = match &target {
            Some(target) => format!("{target}/{name}"),
            None => name,
        };

        if file_type.is_dir() {
            let (virt, backend) = collapse_chain(layer, virt, child.path(), git_target);
            register(entries, ManifestEntry::new(virt, backend, true)?);
        } else {
            register(entries, ManifestEntry::new(virt, child.path(), false)?);
        }
    }

    Ok(())
}

/// Later layers win on collision, except that a directory never replaces a
/// directory; sibling mounts from different layers merge instead of clobbering.
fn register(entries: &mut IndexMap<String, ManifestEntry>, entry: ManifestEntry) {
    if let Some(existing) = entries.get(&entry.virtual_path) {
        if existing.is_dir && entry.is_dir {
            return;
        }
    }

    entries.insert(entry.virtual_path.clone(), entry);
}

/// While a directory holds exactly one surviving subdirectory and nothing
/// else, descend into it; the registered prefix then covers the longest chain
/// that still reaches every leaf.
fn collapse_chain(
    layer: &Layer,
    mut virt: String,
    mut dir: PathBuf,
    git_target: bool,
) -> (String, PathBuf) {
    loop {
        let Ok(children) = fs::read_dir(&dir) else {
            break;
        };

        let mut sole_dir: Option<(String, PathBuf)> = None;
        let mut blocked = false;

        for child in children.flatten() {
            let Some(name) = child.file_name().to_str().map(str::to_string) else {
                blocked = true;
                break;
            };

            if skipped(&name, git_target) || !admits(layer, &name) {
                continue;
            }

            let Ok(file_type) = child.file_type() else {
                blocked = true;
                break;
            };

            if !file_type.is_dir() || sole_dir.replace((name, child.path())).is_some() {
                blocked = true;
                break;
            }
        }

        match sole_dir {
            Some((name, path)) if !blocked => {
                virt.push('/');
                virt.push_str(&name);
                dir = path;
            }
            _ => break,
        }
    }

    (virt, dir)
}

/// Empty or `.` targets mean the virtual root; a trailing slash is cosmetic.
fn normalize_target(raw: &str) -> Result<Option<String>, ManifestError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "." {
        return Ok(None);
    }

    let stripped = trimmed.trim_end_matches('/');
    if stripped.is_empty() {
        return Err(ManifestError::InvalidVirtualPath {
            path: raw.to_string(),
            reason: "must be relative",
        });
    }

    validate_virtual_path(stripped)?;
    Ok(Some(stripped.to_string()))
}

fn trim_source(raw: &str) -> &str {
    let trimmed = raw.trim();
    match trimmed.trim_end_matches('/') {
        "" => trimmed,
        stripped => stripped,
    }
}

fn basename(path: &Path) -> Option<&str> {
    path.file_name().and_then(|name| name.to_str())
}

fn admits(layer: &Layer, name: &str) -> bool {
    if let Some(include) = &layer.include {
        return include(name);
    }

    if let Some(exclude) = &layer.exclude {
        return !exclude(name);
    }

    true
}

fn skipped(name: &str, git_target: bool) -> bool {
    if git_target && name == ".git" {
        return false;
    }

    SKIP_NAMES.contains(&name)
}
