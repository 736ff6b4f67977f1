//! Reload coordination with in-process loaders and no running workers.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tessera_core::{
    CallArgs, Error, FunctionDescriptor, PoolConfig, ReloadCoordinator, Result, UnitLoader,
    UnitRegistry, WorkerPool,
};

fn registry(logic: &str) -> UnitRegistry {
    let mut registry = UnitRegistry::new();
    registry
        .register(FunctionDescriptor::new("hillshade", logic))
        .unwrap();
    registry
}

/// Loader whose logic text changes on every load and that fails on the
/// loads listed in `failing`.
fn versioned_loader(failing: &'static [usize]) -> (Arc<dyn UnitLoader>, Arc<AtomicUsize>) {
    let loads = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&loads);
    let loader = move || -> Result<UnitRegistry> {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        if failing.contains(&n) {
            return Err(Error::Execution(format!("syntax error in load {}", n)));
        }
        Ok(registry(&format!("hillshade/v{}", n)))
    };
    let loader: Arc<dyn UnitLoader> = Arc::new(loader);
    (loader, loads)
}

fn idle_pool() -> Arc<WorkerPool> {
    Arc::new(WorkerPool::new(PoolConfig::default()))
}

fn current_logic(coordinator: &ReloadCoordinator) -> String {
    let snapshot = coordinator.registry().snapshot();
    snapshot
        .registry
        .unit("hillshade", CallArgs::default())
        .unwrap()
        .function()
        .logic
        .clone()
}

#[tokio::test]
async fn test_initial_load_is_generation_zero() {
    let (loader, loads) = versioned_loader(&[]);
    let coordinator = ReloadCoordinator::new(loader, idle_pool()).await.unwrap();

    assert_eq!(coordinator.generation(), 0);
    assert_eq!(loads.load(Ordering::SeqCst), 1);
    assert_eq!(current_logic(&coordinator), "hillshade/v0");
}

#[tokio::test]
async fn test_initial_load_failure_is_reported() {
    let (loader, _) = versioned_loader(&[0]);
    let result = ReloadCoordinator::new(loader, idle_pool()).await;
    assert!(matches!(result, Err(Error::Execution(_))));
}

#[tokio::test]
async fn test_reload_without_pool_publishes() {
    let (loader, _) = versioned_loader(&[]);
    let coordinator = ReloadCoordinator::new(loader, idle_pool()).await.unwrap();
    let reloaded = coordinator.next_reload();

    assert_eq!(coordinator.on_source_changed().await.unwrap(), 1);
    assert_eq!(current_logic(&coordinator), "hillshade/v1");
    assert_eq!(
        tokio::time::timeout(Duration::from_secs(1), reloaded)
            .await
            .unwrap(),
        1
    );
    assert!(!coordinator.pool().is_running());
}

#[tokio::test]
async fn test_failed_reload_keeps_current_code() {
    let (loader, _) = versioned_loader(&[1]);
    let coordinator = ReloadCoordinator::new(loader, idle_pool()).await.unwrap();
    let mut waiter = coordinator.code_reloaded().subscribe();

    assert!(coordinator.on_source_changed().await.is_err());
    assert_eq!(coordinator.generation(), 0);
    assert_eq!(current_logic(&coordinator), "hillshade/v0");
    assert_eq!(coordinator.code_reloaded().generation(), 0);

    // The next edit recovers.
    assert_eq!(coordinator.on_source_changed().await.unwrap(), 1);
    assert_eq!(current_logic(&coordinator), "hillshade/v2");
    assert_eq!(
        tokio::time::timeout(Duration::from_secs(1), waiter.next())
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn test_reload_signal_carries_registry_generation() {
    let (loader, _) = versioned_loader(&[]);
    let coordinator = ReloadCoordinator::new(loader, idle_pool()).await.unwrap();
    let mut waiter = coordinator.code_reloaded().subscribe();

    for expected in 1..=3 {
        let generation = coordinator.on_source_changed().await.unwrap();
        assert_eq!(generation, expected);
        let fired = tokio::time::timeout(Duration::from_secs(1), waiter.next())
            .await
            .unwrap();
        assert_eq!(fired, coordinator.generation());
    }
}

#[tokio::test]
async fn test_duplicate_units_fail_the_load() {
    let loader = || -> Result<UnitRegistry> {
        let mut registry = registry("hillshade/v1");
        registry.register(FunctionDescriptor::new("hillshade", "hillshade/v2"))?;
        Ok(registry)
    };
    let result = ReloadCoordinator::new(Arc::new(loader), idle_pool()).await;
    assert!(matches!(result, Err(Error::DuplicateUnit(ref name)) if name == "hillshade"));
}

#[tokio::test]
async fn test_asset_change_leaves_code_alone() {
    let (loader, loads) = versioned_loader(&[]);
    let coordinator = ReloadCoordinator::new(loader, idle_pool()).await.unwrap();
    let assets = coordinator.assets_changed().wait();

    coordinator.on_assets_changed();

    assert_eq!(
        tokio::time::timeout(Duration::from_secs(1), assets)
            .await
            .unwrap(),
        1
    );
    assert_eq!(coordinator.generation(), 0);
    assert_eq!(coordinator.code_reloaded().generation(), 0);
    assert_eq!(loads.load(Ordering::SeqCst), 1);
}
