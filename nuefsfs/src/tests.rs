// Tests for the manifest compiler, the virtual tree index, and the handle
// table. The end-to-end mount test at the bottom needs /dev/fuse and is
// ignored by default.

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::handles::HandleTable;
use crate::index::{Resolution, VirtualTreeIndex};
use crate::manifest::{compile, Layer, ManifestEntry, ManifestError};

fn write_file(path: impl AsRef<Path>, contents: &str) {
    let path = path.as_ref();
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
}

/// A layer source string with the trailing slash that requests expansion.
fn expanded(dir: impl AsRef<Path>) -> String {
    format!("{}/", dir.as_ref().display())
}

#[test]
fn later_layer_wins_on_file_collisions() {
    let tmp = TempDir::new().unwrap();
    write_file(tmp.path().join("a/x.txt"), "a");
    write_file(tmp.path().join("a/only_a.txt"), "only");
    write_file(tmp.path().join("b/x.txt"), "b");

    let layers = vec![
        Layer::new(expanded(tmp.path().join("a")), "."),
        Layer::new(expanded(tmp.path().join("b")), "."),
    ];

    let entries = compile(&layers).unwrap();

    assert_eq!(entries["x.txt"].backend_path, tmp.path().join("b/x.txt"));
    assert_eq!(
        entries["only_a.txt"].backend_path,
        tmp.path().join("a/only_a.txt")
    );
}

#[test]
fn directories_merge_instead_of_clobbering() {
    let tmp = TempDir::new().unwrap();
    write_file(tmp.path().join("a/sub/f1.txt"), "1");
    write_file(tmp.path().join("a/sub/f2.txt"), "2");
    write_file(tmp.path().join("b/sub/g1.txt"), "3");
    write_file(tmp.path().join("b/sub/g2.txt"), "4");

    let layers = vec![
        Layer::new(expanded(tmp.path().join("a")), "."),
        Layer::new(expanded(tmp.path().join("b")), "."),
    ];

    let entries = compile(&layers).unwrap();

    // The earlier directory entry survives a directory collision.
    assert!(entries["sub"].is_dir);
    assert_eq!(entries["sub"].backend_path, tmp.path().join("a/sub"));
}

#[test]
fn file_layer_overwrites_directory_entry() {
    let tmp = TempDir::new().unwrap();
    write_file(tmp.path().join("dir/inner.txt"), "x");
    write_file(tmp.path().join("notes.txt"), "y");

    let layers = vec![
        Layer::new(tmp.path().join("dir").display().to_string(), "v"),
        Layer::new(tmp.path().join("notes.txt").display().to_string(), "v"),
    ];

    let entries = compile(&layers).unwrap();

    assert!(!entries["v"].is_dir);
    assert_eq!(entries["v"].backend_path, tmp.path().join("notes.txt"));
}

#[test]
fn file_layer_at_root_uses_basename() {
    let tmp = TempDir::new().unwrap();
    write_file(tmp.path().join("notes.txt"), "y");

    let layers = vec![Layer::new(
        tmp.path().join("notes.txt").display().to_string(),
        ".",
    )];

    let entries = compile(&layers).unwrap();

    assert_eq!(
        entries["notes.txt"].backend_path,
        tmp.path().join("notes.txt")
    );
    assert!(!entries["notes.txt"].is_dir);
}

#[test]
fn directory_layer_mounts_at_target() {
    let tmp = TempDir::new().unwrap();
    write_file(tmp.path().join("libs/pkg/mod.py"), "code");

    let layers = vec![Layer::new(
        tmp.path().join("libs").display().to_string(),
        "vendor",
    )];

    let entries = compile(&layers).unwrap();

    assert_eq!(entries.len(), 1);
    assert!(entries["vendor"].is_dir);
    assert_eq!(entries["vendor"].backend_path, tmp.path().join("libs"));
}

#[test]
fn directory_layer_at_root_uses_basename() {
    let tmp = TempDir::new().unwrap();
    write_file(tmp.path().join("libs/pkg/mod.py"), "code");

    let layers = vec![Layer::new(tmp.path().join("libs").display().to_string(), ".")];

    let entries = compile(&layers).unwrap();

    assert!(entries["libs"].is_dir);
    assert_eq!(entries["libs"].backend_path, tmp.path().join("libs"));
}

#[test]
fn skip_set_hides_tooling_directories() {
    let tmp = TempDir::new().unwrap();
    write_file(tmp.path().join("proj/.git/HEAD"), "ref");
    write_file(tmp.path().join("proj/node_modules/pkg/index.js"), "js");
    write_file(tmp.path().join("proj/src/main.py"), "code");

    let layers = vec![Layer::new(expanded(tmp.path().join("proj")), ".")];
    let entries = compile(&layers).unwrap();

    assert!(!entries.contains_key(".git"));
    assert!(!entries.contains_key("node_modules"));
    assert!(entries.contains_key("src"));
}

#[test]
fn explicit_git_mount_readmits_git() {
    let tmp = TempDir::new().unwrap();
    write_file(tmp.path().join("proj/.git/HEAD"), "ref");

    // Mounting the .git directory itself at .git puts it back in the tree.
    let layers = vec![Layer::new(
        tmp.path().join("proj/.git").display().to_string(),
        ".git",
    )];
    let entries = compile(&layers).unwrap();

    assert!(entries[".git"].is_dir);
    assert_eq!(entries[".git"].backend_path, tmp.path().join("proj/.git"));

    // Expanding it under a .git target works too.
    let layers = vec![Layer::new(expanded(tmp.path().join("proj/.git")), ".git")];
    let entries = compile(&layers).unwrap();

    assert!(entries.contains_key(".git/HEAD"));
}

#[test]
fn exclude_suppresses_and_include_whitelists() {
    let tmp = TempDir::new().unwrap();
    write_file(tmp.path().join("src/main.py"), "code");
    write_file(tmp.path().join("src/main.pyc"), "bytecode");

    let excluded = vec![
        Layer::new(expanded(tmp.path().join("src")), ".").exclude(|name| name.ends_with(".pyc")),
    ];
    let entries = compile(&excluded).unwrap();
    assert!(entries.contains_key("main.py"));
    assert!(!entries.contains_key("main.pyc"));

    let included = vec![
        Layer::new(expanded(tmp.path().join("src")), ".").include(|name| name.ends_with(".pyc")),
    ];
    let entries = compile(&included).unwrap();
    assert!(!entries.contains_key("main.py"));
    assert!(entries.contains_key("main.pyc"));
}

#[test]
fn include_and_exclude_together_are_rejected() {
    let tmp = TempDir::new().unwrap();
    write_file(tmp.path().join("src/main.py"), "code");

    let layers = vec![Layer::new(expanded(tmp.path().join("src")), ".")
        .exclude(|name| name.ends_with(".pyc"))
        .include(|name| name.ends_with(".py"))];

    assert!(matches!(
        compile(&layers),
        Err(ManifestError::IncludeAndExclude(_))
    ));
}

#[test]
fn single_child_chains_collapse() {
    let tmp = TempDir::new().unwrap();
    write_file(tmp.path().join("layer/a/b/c/leaf.txt"), "deep");
    write_file(tmp.path().join("layer/a/b/c/other.txt"), "deep");

    let layers = vec![Layer::new(expanded(tmp.path().join("layer")), ".")];
    let entries = compile(&layers).unwrap();

    assert_eq!(entries.len(), 1);
    assert!(entries["a/b/c"].is_dir);
    assert_eq!(entries["a/b/c"].backend_path, tmp.path().join("layer/a/b/c"));
}

#[test]
fn chain_collapsing_stops_at_files() {
    let tmp = TempDir::new().unwrap();
    write_file(tmp.path().join("layer/a/readme.txt"), "stop here");
    write_file(tmp.path().join("layer/a/b/leaf.txt"), "deep");

    let layers = vec![Layer::new(expanded(tmp.path().join("layer")), ".")];
    let entries = compile(&layers).unwrap();

    assert_eq!(entries["a"].backend_path, tmp.path().join("layer/a"));
}

#[test]
fn missing_source_contributes_nothing() {
    let layers = vec![Layer::new("/definitely/not/here/", ".")];
    let entries = compile(&layers).unwrap();
    assert!(entries.is_empty());
}

#[test]
fn invalid_targets_are_rejected() {
    let tmp = TempDir::new().unwrap();
    write_file(tmp.path().join("src/main.py"), "code");
    let source = expanded(tmp.path().join("src"));

    for target in ["/abs", "a/../b", "a\\b", "a/./b"] {
        let layers = vec![Layer::new(source.clone(), target)];
        assert!(
            matches!(
                compile(&layers),
                Err(ManifestError::InvalidVirtualPath { .. })
            ),
            "target {target:?} should be rejected"
        );
    }
}

#[test]
fn relative_backend_paths_are_rejected() {
    assert!(matches!(
        ManifestEntry::new("x.txt", "relative/path", false),
        Err(ManifestError::RelativeBackendPath(_))
    ));
}

#[test]
fn compilation_is_deterministic() {
    let tmp = TempDir::new().unwrap();
    write_file(tmp.path().join("a/one.txt"), "1");
    write_file(tmp.path().join("a/two.txt"), "2");
    write_file(tmp.path().join("b/sub/three.txt"), "3");

    let layers = || {
        vec![
            Layer::new(expanded(tmp.path().join("a")), "."),
            Layer::new(expanded(tmp.path().join("b")), "vendor"),
        ]
    };

    assert_eq!(compile(&layers()).unwrap(), compile(&layers()).unwrap());
}

#[test]
fn index_exact_and_prefix_lookup() {
    let entries = vec![
        ManifestEntry::new("vendor", "/srv/libs", true).unwrap(),
        ManifestEntry::new("x.txt", "/tmp/b/x.txt", false).unwrap(),
    ];
    let index = VirtualTreeIndex::build(entries).unwrap();

    assert!(index.lookup_exact("vendor").unwrap().is_dir);
    assert!(index.lookup_exact("vendor/pkg").is_none());

    let (entry, remainder) = index.lookup_prefix("vendor/pkg/mod.py").unwrap();
    assert_eq!(entry.virtual_path, "vendor");
    assert_eq!(remainder, "pkg/mod.py");

    match index.resolve("vendor/pkg/mod.py").unwrap() {
        Resolution::Descend { backend, .. } => {
            assert_eq!(backend, PathBuf::from("/srv/libs/pkg/mod.py"));
        }
        _ => panic!("expected a dynamic descent"),
    }

    // Files never act as prefixes.
    assert!(index.lookup_prefix("x.txt/deeper").is_none());
}

#[test]
fn longest_prefix_wins() {
    let entries = vec![
        ManifestEntry::new("vendor", "/srv/libs", true).unwrap(),
        ManifestEntry::new("vendor/pkg", "/opt/override/pkg", true).unwrap(),
    ];
    let index = VirtualTreeIndex::build(entries).unwrap();

    let (entry, remainder) = index.lookup_prefix("vendor/pkg/mod.py").unwrap();
    assert_eq!(entry.virtual_path, "vendor/pkg");
    assert_eq!(remainder, "mod.py");
}

#[test]
fn implied_parents_are_synthetic_directories() {
    let entries = vec![ManifestEntry::new("a/b/c.txt", "/srv/c.txt", false).unwrap()];
    let index = VirtualTreeIndex::build(entries).unwrap();

    assert_eq!(
        index.children_of("").unwrap().into_iter().collect::<Vec<_>>(),
        vec!["a".to_string()]
    );
    assert_eq!(
        index.children_of("a").unwrap().into_iter().collect::<Vec<_>>(),
        vec!["b".to_string()]
    );

    assert!(index.is_dir("a"));
    assert!(index.is_dir("a/b"));
    assert!(matches!(index.resolve("a"), Some(Resolution::Synthetic)));

    // Synthetic directories belong to no layer.
    assert!(index.which("a").is_none());
    assert!(index.which("a/b/c.txt").is_some());
}

#[test]
fn which_round_trips_every_entry() {
    let tmp = TempDir::new().unwrap();
    write_file(tmp.path().join("a/x.txt"), "1");
    write_file(tmp.path().join("a/sub/y.txt"), "2");
    write_file(tmp.path().join("b/z.txt"), "3");

    let layers = vec![
        Layer::new(expanded(tmp.path().join("a")), "."),
        Layer::new(expanded(tmp.path().join("b")), "extra"),
    ];

    let entries = compile(&layers).unwrap();
    let index = VirtualTreeIndex::build(entries.values().cloned()).unwrap();

    for entry in entries.values() {
        let info = index.which(&entry.virtual_path).unwrap();
        assert_eq!(info.backend_path, entry.backend_path);
        assert_eq!(info.owner, entry.virtual_path);
    }
}

#[test]
fn which_reports_descent_through_owner() {
    let entries = vec![ManifestEntry::new("vendor", "/srv/libs", true).unwrap()];
    let index = VirtualTreeIndex::build(entries).unwrap();

    let info = index.which("vendor/pkg/mod.py").unwrap();
    assert_eq!(info.owner, "vendor");
    assert_eq!(info.backend_path, PathBuf::from("/srv/libs/pkg/mod.py"));
}

#[test]
fn index_build_applies_merge_rules() {
    let entries = vec![
        ManifestEntry::new("v", "/first", true).unwrap(),
        ManifestEntry::new("v", "/second", true).unwrap(),
        ManifestEntry::new("w", "/dir", true).unwrap(),
        ManifestEntry::new("w", "/file", false).unwrap(),
    ];
    let index = VirtualTreeIndex::build(entries).unwrap();

    assert_eq!(index.lookup_exact("v").unwrap().backend_path, PathBuf::from("/first"));
    assert_eq!(index.lookup_exact("w").unwrap().backend_path, PathBuf::from("/file"));
}

#[test]
fn index_build_rejects_invalid_entries() {
    let bogus = ManifestEntry {
        virtual_path: "../escape".to_string(),
        backend_path: PathBuf::from("/srv"),
        is_dir: false,
    };

    assert!(VirtualTreeIndex::build(vec![bogus]).is_err());
}

#[test]
fn unknown_paths_resolve_to_nothing() {
    let entries = vec![ManifestEntry::new("x.txt", "/tmp/x.txt", false).unwrap()];
    let index = VirtualTreeIndex::build(entries).unwrap();

    assert!(index.resolve("missing").is_none());
    assert!(index.children_of("missing").is_none());
    assert!(index.backend_of("missing").is_none());
    assert!(!index.is_dir("missing"));
}

#[test]
fn empty_index_still_has_a_root() {
    let index = VirtualTreeIndex::empty();

    assert!(index.is_empty());
    assert!(index.is_dir(""));
    assert!(index.children_of("").unwrap().is_empty());
    assert!(matches!(index.resolve(""), Some(Resolution::Synthetic)));
}

#[test]
fn installed_index_replaces_snapshot_for_new_readers() {
    use crate::state::MountState;

    let first = VirtualTreeIndex::build(vec![
        ManifestEntry::new("x.txt", "/tmp/a/x.txt", false).unwrap()
    ])
    .unwrap();
    let state = MountState::new(first);

    let before = state.index();

    let second = VirtualTreeIndex::build(vec![
        ManifestEntry::new("x.txt", "/tmp/b/x.txt", false).unwrap()
    ])
    .unwrap();
    state.install_index(second);

    // A request that took its snapshot before the update keeps answering
    // from it, while new readers see the replacement immediately.
    assert_eq!(
        before.which("x.txt").unwrap().backend_path,
        PathBuf::from("/tmp/a/x.txt")
    );
    assert_eq!(
        state.index().which("x.txt").unwrap().backend_path,
        PathBuf::from("/tmp/b/x.txt")
    );
}

#[test]
fn handle_table_round_trip() {
    let tmp = TempDir::new().unwrap();
    write_file(tmp.path().join("f.txt"), "contents");

    let table = HandleTable::new();

    let file = fs::File::open(tmp.path().join("f.txt")).unwrap();
    let fh = table.insert_file(file);
    assert!(table.file(fh).is_some());
    assert!(table.dir(fh).is_none());

    let dh = table.insert_dir("vendor");
    assert_eq!(table.dir(dh).unwrap(), "vendor");
    assert!(table.file(dh).is_none());

    table.remove(fh);
    assert!(table.file(fh).is_none());
}

/// Mounts a two-layer overlay and drives it through the kernel.
/// Needs /dev/fuse and an unprivileged-FUSE-friendly kernel, so it stays out
/// of the default test run.
#[test]
#[ignore]
fn do_mount() {
    use std::sync::Arc;

    use crate::filesystem::NueFs;
    use crate::state::MountState;

    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Debug)
        .init()
        .ok();

    let tmp = TempDir::new().unwrap();
    write_file(tmp.path().join("base/x.txt"), "from base");
    write_file(tmp.path().join("base/keep.txt"), "kept");
    write_file(tmp.path().join("over/x.txt"), "from overlay");
    write_file(tmp.path().join("libs/pkg/mod.py"), "print('hi')");
    fs::create_dir_all(tmp.path().join("mnt")).unwrap();

    let layers = vec![
        Layer::new(expanded(tmp.path().join("base")), "."),
        Layer::new(expanded(tmp.path().join("over")), "."),
        Layer::new(tmp.path().join("libs").display().to_string(), "vendor"),
    ];

    let entries = compile(&layers).unwrap();
    let index = VirtualTreeIndex::build(entries.into_values()).unwrap();
    let state = Arc::new(MountState::new(index));

    let mount = tmp.path().join("mnt");
    let session = NueFs::new(state).spawn_mount(&mount).unwrap();

    // Later layer wins; untouched files shine through.
    assert_eq!(fs::read_to_string(mount.join("x.txt")).unwrap(), "from overlay");
    assert_eq!(fs::read_to_string(mount.join("keep.txt")).unwrap(), "kept");

    // Dynamic descent below a registered directory.
    let listed: Vec<_> = fs::read_dir(mount.join("vendor"))
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(listed, vec!["pkg"]);
    assert_eq!(
        fs::read_to_string(mount.join("vendor/pkg/mod.py")).unwrap(),
        "print('hi')"
    );

    // Write-through create lands in the backend.
    fs::write(mount.join("vendor/new.txt"), "fresh").unwrap();
    assert_eq!(
        fs::read_to_string(tmp.path().join("libs/new.txt")).unwrap(),
        "fresh"
    );

    // Rename within the layer moves the backend file.
    fs::rename(mount.join("vendor/new.txt"), mount.join("vendor/renamed.txt")).unwrap();
    assert!(tmp.path().join("libs/renamed.txt").exists());
    assert!(!tmp.path().join("libs/new.txt").exists());

    // The virtual tree matches a recursive walk of what the layers promise.
    let walked: Vec<_> = walkdir::WalkDir::new(&mount)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .map(|e| e.unwrap().path().strip_prefix(&mount).unwrap().to_path_buf())
        .collect();
    assert!(walked.contains(&PathBuf::from("vendor/pkg/mod.py")));

    drop(session);
}
