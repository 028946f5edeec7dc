//! File reloads, directly and through the debounced reload manager.

use std::sync::Arc;
use std::time::Duration;

use arbor_runtime::{NodeKey, NodeState, ReloadOutcome, context_value};
use arbor_test::{EventLog, Journal, plugin, test_runtime};

#[tokio::test]
async fn test_reload_rebuilds_only_the_changed_subtree() {
    let (runtime, modules) = test_runtime(["a", "s"]);
    modules.define(plugin("a"), |_| Ok(()));
    modules.define(plugin("a/b"), |_| Ok(()));
    modules.define(plugin("s"), |scope| {
        scope.declare_context("cache", context_value(vec![1_u32, 2, 3]))?;
        Ok(())
    });
    assert!(runtime.start().await.is_clean());

    let a = runtime.node_for(plugin("a")).unwrap();
    let b = runtime.node_for(plugin("a/b")).unwrap();
    let s = runtime.node_for(plugin("s")).unwrap();
    let cache = runtime.context::<Vec<u32>>(s, "cache").unwrap();

    let outcome = runtime.reload_file(plugin("a")).await.unwrap();
    let ReloadOutcome::Rebuilt { previous, node } = outcome else {
        panic!("unexpected outcome {outcome:?}");
    };
    assert_eq!(previous, a);
    assert_ne!(node, a);
    assert_eq!(runtime.state(a), Some(NodeState::Disposed));
    assert_eq!(runtime.state(node), Some(NodeState::Mounted));
    assert_eq!(runtime.parent(node), Some(NodeKey::ROOT));

    let b2 = runtime.node_for(plugin("a/b")).unwrap();
    assert_ne!(b2, b);
    assert_eq!(runtime.parent(b2), Some(node));

    // The sibling and its context are untouched.
    assert_eq!(runtime.node_for(plugin("s")), Some(s));
    let after = runtime.context::<Vec<u32>>(s, "cache").unwrap();
    assert!(Arc::ptr_eq(&cache, &after));
    runtime.check_consistency().unwrap();
}

#[tokio::test]
async fn test_reload_picks_up_redefined_module() {
    let journal = Journal::new();
    let (runtime, modules) = test_runtime(["a"]);
    let j = journal.clone();
    modules.define(plugin("a"), move |_| {
        j.record("v1");
        Ok(())
    });
    runtime.start().await;

    let j = journal.clone();
    modules.define(plugin("a"), move |_| {
        j.record("v2");
        Ok(())
    });
    runtime.reload_file(plugin("a")).await.unwrap();
    assert_eq!(journal.entries(), vec!["v1", "v2"]);
}

#[tokio::test]
async fn test_reload_of_deleted_file_removes_node() {
    let (runtime, modules) = test_runtime(["a"]);
    modules.define(plugin("a"), |_| Ok(()));
    modules.define(plugin("a/b"), |_| Ok(()));
    runtime.start().await;

    let a = runtime.node_for(plugin("a")).unwrap();
    assert!(modules.remove(&plugin("a")));
    let outcome = runtime.reload_file(plugin("a")).await.unwrap();
    assert_eq!(outcome, ReloadOutcome::Removed(a));
    assert_eq!(runtime.node_for(plugin("a")), None);
    assert_eq!(runtime.node_for(plugin("a/b")), None);
    assert_eq!(runtime.node_count(), 1);
}

#[tokio::test]
async fn test_reload_of_new_file_adds_top_level_plugin() {
    let (runtime, modules) = test_runtime(["a"]);
    modules.define(plugin("a"), |_| Ok(()));
    runtime.start().await;

    modules.define(plugin("n"), |_| Ok(()));
    let outcome = runtime.reload_file(plugin("n")).await.unwrap();
    let ReloadOutcome::Added(n) = outcome else {
        panic!("unexpected outcome {outcome:?}");
    };
    assert_eq!(runtime.parent(n), Some(NodeKey::ROOT));
    assert_eq!(runtime.state(n), Some(NodeState::Mounted));

    let unrelated = runtime.reload_file("/tmp/scratch.txt").await.unwrap();
    assert_eq!(unrelated, ReloadOutcome::Ignored);
}

#[tokio::test]
async fn test_asset_change_rebuilds_owning_plugin() {
    let (runtime, modules) = test_runtime(["a"]);
    modules.define(plugin("a"), |_| Ok(()));
    modules.define(plugin("a/b"), |_| Ok(()));
    runtime.start().await;

    let a = runtime.node_for(plugin("a")).unwrap();
    let b = runtime.node_for(plugin("a/b")).unwrap();
    let outcome = runtime.reload_file(plugin("a/style.css")).await.unwrap();
    let ReloadOutcome::Rebuilt { previous, .. } = outcome else {
        panic!("unexpected outcome {outcome:?}");
    };
    assert_eq!(previous, a);
    assert_eq!(runtime.state(b), Some(NodeState::Disposed));

    // The nearest plugin directory owns a nested asset.
    let b_now = runtime.node_for(plugin("a/b")).unwrap();
    let a_now = runtime.node_for(plugin("a")).unwrap();
    let nested = runtime.reload_file(plugin("a/b/icon.svg")).await.unwrap();
    let ReloadOutcome::Rebuilt { previous, node } = nested else {
        panic!("unexpected outcome {nested:?}");
    };
    assert_eq!(previous, b_now);
    assert_eq!(runtime.parent(node), Some(a_now));
    assert_eq!(runtime.node_for(plugin("a")), Some(a_now));
}

#[tokio::test(start_paused = true)]
async fn test_failed_reload_does_not_stop_the_batch() {
    let (runtime, modules) = test_runtime(["p1", "p2"]);
    modules.define(plugin("p1"), |_| Ok(()));
    modules.define(plugin("p2"), |_| Ok(()));
    runtime.start().await;
    let p2 = runtime.node_for(plugin("p2")).unwrap();

    let mut log = EventLog::new(runtime.subscribe());
    modules.define(plugin("p1"), |_| anyhow::bail!("unexpected token"));
    let manager = runtime.reload_manager().unwrap();
    manager.schedule_reload(plugin("p1"));
    manager.schedule_reload(plugin("p2"));

    let done = log
        .wait_for("reload_batch_completed", Duration::from_secs(1))
        .await;
    assert!(done.is_some());
    assert_eq!(log.count("reload_file"), 2);

    let p1_new = runtime.node_for(plugin("p1")).unwrap();
    let p2_new = runtime.node_for(plugin("p2")).unwrap();
    assert!(matches!(runtime.state(p1_new), Some(NodeState::Failed(_))));
    assert_eq!(runtime.state(p2_new), Some(NodeState::Mounted));
    assert_ne!(p2_new, p2);
    runtime.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_rapid_changes_collapse_into_one_reload() {
    let journal = Journal::new();
    let (runtime, modules) = test_runtime(["a"]);
    let j = journal.clone();
    modules.define(plugin("a"), move |_| {
        j.record("built");
        Ok(())
    });
    runtime.start().await;
    journal.clear();

    let mut log = EventLog::new(runtime.subscribe());
    let manager = runtime.reload_manager().unwrap();
    for _ in 0..5 {
        manager.schedule_reload(plugin("a"));
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let done = log
        .wait_for("reload_batch_completed", Duration::from_secs(1))
        .await;
    assert!(done.is_some());
    assert_eq!(log.count("reload_scheduled"), 5);
    assert_eq!(log.count("reload_file"), 1);
    assert_eq!(journal.entries(), vec!["built"]);

    let hint = log
        .wait_for("resources_reclaimable", Duration::from_secs(1))
        .await;
    assert!(hint.is_some());
    runtime.shutdown().await;
}
