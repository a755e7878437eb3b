//! Integration tests for plugin discovery against real archives.
//!
//! Each test builds a plugin directory in a temporary location, starts a
//! host on it and checks what the registry exposes.

mod common;

use std::sync::Arc;

use bioimage_plugins::error::PluginError;
use bioimage_plugins::host::PluginHost;
use bioimage_plugins::plugin::{
    ActionPlugin, BuiltinClass, ClassInfo, LoadError, PluginIdent, PluginKind,
};
use bioimage_plugins::registry::PluginFilter;
use common::{config_for, plugin_dir, version, write_archive};

const ACME: &str = r#"
[archive]
name = "Acme tools"
author = "Acme Lab"

[[class]]
name = "plugins.acme.Palette"
version = "1.2.0"
kind = "library"
implements = ["ColorSource"]

[[class]]
name = "plugins.acme.Filter"
shape = "interface"
implements = ["ImageFilter"]

[[class]]
name = "plugins.acme.BaseFilter"
shape = "abstract"
implements = ["ImageFilter"]

[[class]]
name = "plugins.acme.Kernels"
kind = "library"
bundled = true

[[class]]
name = "plugins.acme.Helper"
plugin = false

[[class]]
name = "plugins.acme.NeedsGhost"
kind = "library"
requires = ["plugins.ghost.Missing"]

[[class]]
name = "plugins.acme.Denoise"
kind = "action"
"#;

#[derive(Default)]
struct Histogram;

impl ActionPlugin for Histogram {
    fn run(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

fn histogram() -> BuiltinClass {
    BuiltinClass::action(
        ClassInfo::new("plugins.core.Histogram", "Histogram", version("2.0.0"))
            .implementing("ImageFilter"),
        Histogram::default,
    )
}

fn start(root: &std::path::Path) -> PluginHost {
    PluginHost::builder(config_for(&plugin_dir(root)))
        .register(histogram())
        .start()
        .unwrap()
}

fn class_names(plugins: &[bioimage_plugins::plugin::PluginDescriptor]) -> Vec<&str> {
    plugins.iter().map(|p| p.class_name()).collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_archive_classes_are_classified() {
    let root = tempfile::tempdir().unwrap();
    write_archive(
        &plugin_dir(root.path()).join("acme.zip"),
        ACME,
        &[("icons/palette.png", b"\x89PNG".as_slice())],
    );
    let host = start(root.path());

    let all = host.plugins(true).await;
    assert_eq!(
        class_names(&all),
        vec![
            "plugins.acme.BaseFilter",
            "plugins.acme.Filter",
            "plugins.core.Histogram",
            "plugins.acme.Kernels",
            "plugins.acme.Palette",
        ]
    );

    let unbundled = host.plugins(false).await;
    assert!(!class_names(&unbundled).contains(&"plugins.acme.Kernels"));

    let palette = host.plugin_by_class("plugins.acme.Palette").await.unwrap();
    assert_eq!(palette.kind(), PluginKind::Library);
    assert_eq!(palette.version(), &version("1.2.0"));
    assert_eq!(palette.info().author, "Acme Lab");
    assert!(palette.archive_path().unwrap().ends_with("acme.zip"));

    host.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_capability_queries() {
    let root = tempfile::tempdir().unwrap();
    write_archive(&plugin_dir(root.path()).join("acme.zip"), ACME, &[]);
    let host = start(root.path());

    let filters = host
        .plugins_implementing("ImageFilter", PluginFilter::default())
        .await;
    assert_eq!(
        class_names(&filters),
        vec!["plugins.acme.Filter", "plugins.core.Histogram"]
    );

    let with_abstract = host
        .plugins_implementing(
            "ImageFilter",
            PluginFilter {
                abstract_classes: true,
                ..PluginFilter::default()
            },
        )
        .await;
    assert_eq!(with_abstract.len(), 3);

    let actionable = host.actionable_plugins(false).await;
    assert_eq!(class_names(&actionable), vec!["plugins.core.Histogram"]);

    let libraries = host
        .plugins_implementing(
            "Library",
            PluginFilter {
                bundled: true,
                ..PluginFilter::default()
            },
        )
        .await;
    assert_eq!(libraries.len(), 2);

    host.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_candidates_are_not_listed() {
    let root = tempfile::tempdir().unwrap();
    write_archive(&plugin_dir(root.path()).join("acme.zip"), ACME, &[]);
    let host = start(root.path());

    for missing in [
        "plugins.acme.Helper",
        "plugins.acme.NeedsGhost",
        "plugins.acme.Denoise",
    ] {
        assert!(host.plugin_by_class(missing).await.is_none(), "{missing}");
    }

    match host.load_class("plugins.acme.Helper").await {
        Err(PluginError::Load(LoadError::NotAPlugin(class))) => {
            assert_eq!(class, "plugins.acme.Helper")
        }
        other => panic!("unexpected result: {:?}", other.map(|c| c.info().class_name.clone())),
    }
    assert!(matches!(
        host.load_class("plugins.acme.NeedsGhost").await,
        Err(PluginError::Load(LoadError::MissingDependency { .. }))
    ));
    assert!(matches!(
        host.load_class("plugins.acme.Denoise").await,
        Err(PluginError::Load(LoadError::Linkage { .. }))
    ));
    assert!(matches!(
        host.load_class("plugins.nowhere.Ghost").await,
        Err(PluginError::Load(LoadError::NotFound(_)))
    ));

    host.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_corrupt_archive_does_not_affect_others() {
    let root = tempfile::tempdir().unwrap();
    let dir = plugin_dir(root.path());
    write_archive(&dir.join("acme.zip"), ACME, &[]);
    std::fs::write(dir.join("broken.zip"), b"definitely not a zip").unwrap();
    write_archive(&dir.join("bad-manifest.plugin"), "[[class]]\nname = 42\n", &[]);
    std::fs::write(dir.join("notes.txt"), b"ignored").unwrap();

    let host = start(root.path());
    assert!(host.plugin_by_class("plugins.acme.Palette").await.is_some());

    host.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_missing_plugin_directory_yields_builtins() {
    let root = tempfile::tempdir().unwrap();
    let host = start(root.path());

    let plugins = host.plugins(true).await;
    assert_eq!(class_names(&plugins), vec!["plugins.core.Histogram"]);
    assert_eq!(host.current().number(), 1);

    host.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_resources_are_visible() {
    let root = tempfile::tempdir().unwrap();
    write_archive(
        &plugin_dir(root.path()).join("acme.zip"),
        ACME,
        &[("icons/palette.png", b"\x89PNG".as_slice())],
    );
    let host = PluginHost::builder(config_for(&plugin_dir(root.path())))
        .builtins(
            bioimage_plugins::plugin::BuiltinClasses::new()
                .register(histogram())
                .add_resource("plugins/core/histogram.txt", b"bins".to_vec()),
        )
        .start()
        .unwrap();

    let icon = host.resource("icons/palette.png").await.unwrap();
    assert_eq!(icon.read().unwrap(), b"\x89PNG");
    assert!(icon.origin().archive_path().is_some());

    let all = host.all_resources().await;
    assert!(all.contains_key("icons/palette.png"));
    assert!(all.contains_key("plugins/core/histogram.txt"));
    assert!(!all.contains_key("plugin.toml"));

    let classes = host.all_classes().await;
    assert!(classes.contains_key("plugins.acme.Palette"));
    assert!(classes.contains_key("plugins.core.Histogram"));

    host.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reload_picks_up_added_and_removed_archives() {
    let root = tempfile::tempdir().unwrap();
    let dir = plugin_dir(root.path());
    let host = start(root.path());

    host.prepare().await.unwrap();
    let before = host.current();
    assert!(before.plugin_by_class("plugins.acme.Palette").is_none());

    write_archive(&dir.join("acme.zip"), ACME, &[]);
    host.reload().await.unwrap();
    let added = host.current();
    assert!(added.number() > before.number());
    let palette = added.plugin_by_class("plugins.acme.Palette").unwrap();
    assert_eq!(palette.generation(), added.number());

    // The old generation stays self-consistent.
    assert!(before.plugin_by_class("plugins.acme.Palette").is_none());
    assert!(before.load_class("plugins.acme.Palette").is_err());

    std::fs::remove_file(dir.join("acme.zip")).unwrap();
    host.reload().await.unwrap();
    assert!(host.current().plugin_by_class("plugins.acme.Palette").is_none());

    host.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_builtin_definition_wins_over_archive() {
    let root = tempfile::tempdir().unwrap();
    write_archive(
        &plugin_dir(root.path()).join("shadow.zip"),
        r#"
[archive]
name = "Shadow"

[[class]]
name = "plugins.core.Histogram"
version = "9.0.0"
kind = "library"
"#,
        &[],
    );
    let host = start(root.path());

    let histogram = host.plugin_by_class("plugins.core.Histogram").await.unwrap();
    assert_eq!(histogram.version(), &version("2.0.0"));
    assert!(histogram.archive_path().is_none());

    host.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_lookup_by_ident() {
    let root = tempfile::tempdir().unwrap();
    write_archive(&plugin_dir(root.path()).join("acme.zip"), ACME, &[]);
    let host = start(root.path());

    let exact = PluginIdent::new("plugins.acme.Palette", version("1.2.0"));
    let older = PluginIdent::new("plugins.acme.Palette", version("1.0.0"));
    let newer = PluginIdent::new("plugins.acme.Palette", version("2.0.0"));

    assert!(host.plugin(&exact, false).await.is_some());
    assert!(host.plugin(&older, false).await.is_none());
    assert!(host.plugin(&older, true).await.is_some());
    assert!(!host.is_loaded(&newer, true).await);

    host.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_archives_disabled_at_runtime() {
    let root = tempfile::tempdir().unwrap();
    write_archive(&plugin_dir(root.path()).join("acme.zip"), ACME, &[]);
    let host = start(root.path());
    assert!(host.plugin_by_class("plugins.acme.Palette").await.is_some());

    host.set_archives_disabled(true);
    assert!(host.archives_disabled());
    host.reload().await.unwrap();
    assert_eq!(
        class_names(&host.plugins(true).await),
        vec!["plugins.core.Histogram"]
    );

    host.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_verify_reports_vanished_class() {
    let root = tempfile::tempdir().unwrap();
    let dir = plugin_dir(root.path());
    write_archive(&dir.join("acme.zip"), ACME, &[]);
    let host = start(root.path());

    let plugins = host.plugins(true).await;
    host.verify_plugins_are_valid(&plugins).unwrap();

    std::fs::remove_file(dir.join("acme.zip")).unwrap();
    host.reload().await.unwrap();

    let err = host.verify_plugins_are_valid(&plugins).unwrap_err();
    let message = err.to_string();
    assert!(message.starts_with("Fatal error while loading 'plugins.acme."), "{message}");
    assert!(message.contains("acme.zip"));
    assert!(message.contains("Verify you correctly set the class name"));

    host.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_clones_share_one_registry() {
    let root = tempfile::tempdir().unwrap();
    let host = start(root.path());
    let clone = host.clone();

    clone.reload().await.unwrap();
    assert!(host.is_initialized());
    assert_eq!(host.current().number(), clone.current().number());
    assert!(Arc::ptr_eq(&host.current(), &clone.current()));

    host.shutdown().await.unwrap();
}
