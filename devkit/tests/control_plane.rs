/*!
Tests d'intégration du plan de contrôle complet : broker mémoire, agents
embarqués, pool en profil rapide.
*/

use orbion_devkit::TestHarness;
use orbion_kernel::models::{MethodDescriptor, ObjectDescriptor, ParamKind};
use orbion_kernel::Error;
use serde_json::json;
use std::time::Duration;

fn counter_descriptor(transferable: bool) -> ObjectDescriptor {
    ObjectDescriptor {
        kind: "counter".into(),
        methods: vec![
            MethodDescriptor { name: "increment".into(), params: vec![] },
            MethodDescriptor { name: "add".into(), params: vec![ParamKind::Number] },
            MethodDescriptor { name: "get".into(), params: vec![] },
        ],
        transferable,
    }
}

#[tokio::test]
async fn discovery_window_separates_static_and_dynamic_hosts() {
    let mut harness = TestHarness::new();
    let early = harness.spawn_agent().await;

    let pool = harness.open_pool().await.unwrap();
    let late = harness.spawn_agent().await;

    let detector = pool.detector().clone();
    assert!(
        harness
            .wait_until(Duration::from_secs(2), || {
                detector.registered_instances().contains(&late)
            })
            .await,
        "late agent never registered"
    );

    assert!(pool.detector().is_static_id(early));
    assert!(!pool.detector().is_static_id(late));

    pool.close().await;
    harness.shutdown().await;
}

#[tokio::test]
async fn deploy_invoke_destroy_accounting() {
    let mut harness = TestHarness::new();
    harness.spawn_agent().await;
    let pool = harness.open_pool().await.unwrap();

    let id = pool
        .deploy_cloud_object(counter_descriptor(true), vec![])
        .await
        .unwrap();
    assert_eq!(pool.get_cloud_objects_count(), 1);
    assert!(pool.find_managing_host(id).is_some());
    assert!(pool.get_co_lock(id).is_some());

    let value = pool.invoke_cloud_object(id, "increment", vec![], None).await.unwrap();
    assert_eq!(value, json!(1));
    let value = pool
        .invoke_cloud_object(id, "add", vec![json!(9)], None)
        .await
        .unwrap();
    assert_eq!(value, json!(10));
    let value = pool.get_cloud_object_field(id, "value").await.unwrap();
    assert_eq!(value, json!(10));

    pool.set_cloud_object_field(id, "value", json!(3)).await.unwrap();
    let value = pool.get_cloud_object_field(id, "value").await.unwrap();
    assert_eq!(value, json!(3));

    pool.destroy_cloud_object(id).await.unwrap();
    assert_eq!(pool.get_cloud_objects_count(), 0);
    assert!(pool.find_managing_host(id).is_none());
    assert!(pool.get_co_lock(id).is_none());

    // la destruction n'est pas idempotente
    let err = pool.destroy_cloud_object(id).await.unwrap_err();
    assert!(matches!(err, Error::UnknownObject(_)));

    pool.close().await;
    harness.shutdown().await;
}

#[tokio::test]
async fn overload_resolution_rejects_bad_calls_locally() {
    let mut harness = TestHarness::new();
    harness.spawn_agent().await;
    let pool = harness.open_pool().await.unwrap();

    let id = pool
        .deploy_cloud_object(counter_descriptor(true), vec![])
        .await
        .unwrap();

    let err = pool
        .invoke_cloud_object(id, "add", vec![json!("not a number")], None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Dispatch(_)));

    let err = pool
        .invoke_cloud_object(id, "no_such_method", vec![], None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Dispatch(_)));

    pool.close().await;
    harness.shutdown().await;
}

#[tokio::test]
async fn migration_moves_placement_and_preserves_state() {
    let mut harness = TestHarness::new();
    let agent_a = harness.spawn_agent().await;
    let pool = harness.open_pool().await.unwrap();

    let id = pool
        .deploy_cloud_object(counter_descriptor(true), vec![])
        .await
        .unwrap();
    pool.invoke_cloud_object(id, "add", vec![json!(5)], None)
        .await
        .unwrap();
    let host_a = pool.find_managing_host(id).unwrap();

    let agent_b = harness.spawn_agent().await;
    let detector = pool.detector().clone();
    assert!(
        harness
            .wait_until(Duration::from_secs(2), || {
                detector.registered_instances().contains(&agent_b)
            })
            .await
    );
    let host_b = pool.start_new_host(None).await.unwrap();
    assert_eq!(host_b.id(), Some(agent_b));

    pool.migrate_object(id, host_b.clone()).await.unwrap();

    // le placement a basculé, les comptes suivent
    let managing = pool.find_managing_host(id).unwrap();
    assert_eq!(managing.id(), Some(agent_b));
    assert_eq!(host_a.get_cloud_objects_count(), 0);
    assert_eq!(host_b.get_cloud_objects_count(), 1);
    assert_eq!(pool.get_cloud_objects_count(), 1);

    // l'état a voyagé et l'objet est de nouveau invocable
    let value = pool.invoke_cloud_object(id, "get", vec![], None).await.unwrap();
    assert_eq!(value, json!(5));

    // le retrait fire-and-forget finit par vider l'agent source
    let source_agent = harness.agent_handle(agent_a).unwrap();
    assert!(
        harness
            .wait_until(Duration::from_secs(2), || {
                source_agent.hosted_object_count() == 0
            })
            .await
    );

    pool.close().await;
    harness.shutdown().await;
}

#[tokio::test]
async fn failed_migration_leaves_object_operational_with_no_orphan_lock() {
    let mut harness = TestHarness::new();
    harness.spawn_agent().await;
    let pool = harness.open_pool().await.unwrap();

    let id = pool
        .deploy_cloud_object(counter_descriptor(false), vec![])
        .await
        .unwrap();
    pool.invoke_cloud_object(id, "add", vec![json!(7)], None)
        .await
        .unwrap();
    let host_a = pool.find_managing_host(id).unwrap();

    let agent_b = harness.spawn_agent().await;
    let detector = pool.detector().clone();
    assert!(
        harness
            .wait_until(Duration::from_secs(2), || {
                detector.registered_instances().contains(&agent_b)
            })
            .await
    );
    let host_b = pool.start_new_host(None).await.unwrap();

    let err = pool.migrate_object(id, host_b).await.unwrap_err();
    assert!(matches!(err, Error::Migration(_)));

    // rien de committé : l'objet vit toujours sur la source, état intact
    assert!(std::sync::Arc::ptr_eq(&pool.find_managing_host(id).unwrap(), &host_a));
    let obj = pool.get_cloud_object_by_id(id).unwrap();
    assert_eq!(obj.state, orbion_kernel::hosts::ObjectState::Idle);
    let value = pool.invoke_cloud_object(id, "get", vec![], None).await.unwrap();
    assert_eq!(value, json!(7));

    // pas de verrou orphelin : l'écriture se prend immédiatement
    let lock = pool.get_co_lock(id).unwrap();
    assert!(lock.try_write().is_ok());

    pool.close().await;
    harness.shutdown().await;
}

#[tokio::test]
async fn async_host_shutdown_removes_host_before_teardown() {
    let mut harness = TestHarness::new();
    harness.spawn_agent().await;
    let pool = harness.open_pool().await.unwrap();

    let host = pool.start_new_host(None).await.unwrap();
    assert_eq!(pool.hosts().len(), 1);

    pool.shutdown_host_async(host);
    // absence immédiate, sans attendre le démontage
    assert!(pool.hosts().is_empty());

    pool.close().await;
    harness.shutdown().await;
}

#[tokio::test]
async fn concurrent_destroys_of_same_object_serialize() {
    let mut harness = TestHarness::new();
    harness.spawn_agent().await;
    let pool = harness.open_pool().await.unwrap();

    let id = pool
        .deploy_cloud_object(counter_descriptor(true), vec![])
        .await
        .unwrap();

    let p1 = pool.clone();
    let p2 = pool.clone();
    let (r1, r2) = tokio::join!(
        tokio::spawn(async move { p1.destroy_cloud_object(id).await }),
        tokio::spawn(async move { p2.destroy_cloud_object(id).await }),
    );
    let outcomes = [r1.unwrap(), r2.unwrap()];
    let successes = outcomes.iter().filter(|r| r.is_ok()).count();
    assert_eq!(successes, 1, "exactly one concurrent destroy must win");
    assert_eq!(pool.get_cloud_objects_count(), 0);

    pool.close().await;
    harness.shutdown().await;
}

#[tokio::test]
async fn concurrent_destroys_of_different_objects_both_succeed() {
    let mut harness = TestHarness::new();
    harness.spawn_agent().await;
    let pool = harness.open_pool().await.unwrap();

    let a = pool
        .deploy_cloud_object(counter_descriptor(true), vec![])
        .await
        .unwrap();
    let b = pool
        .deploy_cloud_object(counter_descriptor(true), vec![])
        .await
        .unwrap();

    let p1 = pool.clone();
    let p2 = pool.clone();
    let (r1, r2) = tokio::join!(
        tokio::spawn(async move { p1.destroy_cloud_object(a).await }),
        tokio::spawn(async move { p2.destroy_cloud_object(b).await }),
    );
    r1.unwrap().unwrap();
    r2.unwrap().unwrap();
    assert_eq!(pool.get_cloud_objects_count(), 0);

    pool.close().await;
    harness.shutdown().await;
}

#[tokio::test]
async fn silent_agent_expires_while_graceful_stop_is_immediate() {
    let mut harness = TestHarness::new();
    let pool = harness.open_pool().await.unwrap();

    let silent = harness.spawn_agent().await;
    let graceful = harness.spawn_agent().await;
    let detector = pool.detector().clone();
    assert!(
        harness
            .wait_until(Duration::from_secs(2), || {
                let ids = detector.registered_instances();
                ids.contains(&silent) && ids.contains(&graceful)
            })
            .await
    );

    // arrêt propre : l'adieu retire l'hôte sans attendre le timeout
    harness.stop_agent(graceful).await;
    let d = detector.clone();
    assert!(
        harness
            .wait_until(Duration::from_millis(500), || {
                !d.registered_instances().contains(&graceful)
            })
            .await
    );

    // mort silencieuse : expiration à 3 intervalles de heartbeat
    harness.kill_agent(silent);
    let d = detector.clone();
    assert!(
        harness
            .wait_until(Duration::from_secs(2), || {
                !d.registered_instances().contains(&silent)
            })
            .await
    );

    pool.close().await;
    harness.shutdown().await;
}

#[tokio::test]
async fn keepalive_periodically_refreshes_hosts() {
    let mut harness = TestHarness::new();
    let agent = harness.spawn_agent().await;

    let mut timing = harness.timing.clone();
    timing.keepalive_interval_ms = 150;
    let pool = harness
        .open_pool_with(timing, std::sync::Arc::new(orbion_kernel::policy::FirstFitPolicy))
        .await
        .unwrap();

    pool.start_new_host(None).await.unwrap();

    let broker = harness.broker.clone();
    let topic = orbion_kernel::models::host_request_topic(agent);
    let refreshed = harness
        .wait_until(Duration::from_secs(2), || {
            broker
                .messages_on(&topic)
                .iter()
                .any(|m| String::from_utf8_lossy(&m.payload).contains("\"refresh\""))
        })
        .await;
    assert!(refreshed, "no keepalive refresh observed");

    pool.close().await;
    harness.shutdown().await;
}

#[tokio::test]
async fn static_host_shutdown_releases_it_instead_of_destroying() {
    let mut harness = TestHarness::new();
    let agent = harness.spawn_agent().await;
    let pool = harness.open_pool().await.unwrap();

    let host = pool.start_new_host(None).await.unwrap();
    assert_eq!(host.id(), Some(agent));
    assert!(pool.detector().is_static_id(agent));

    pool.shutdown_host(&host).await.unwrap();

    // toujours enregistré, toujours statique, de nouveau libre
    assert!(pool.detector().is_static_id(agent));
    assert_eq!(pool.detector().get_free_id(true), Some(agent));
    pool.detector().release_id(agent);

    // l'agent n'a reçu aucun ordre d'arrêt : il bat toujours et survit
    // largement à la fenêtre d'expiration de 3 intervalles
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(pool.detector().registered_instances().contains(&agent));

    // et il reste rattachable par un démarrage suivant
    let host = pool.start_new_host(None).await.unwrap();
    assert_eq!(host.id(), Some(agent));

    pool.close().await;
    harness.shutdown().await;
}

#[tokio::test]
async fn host_shutdown_drain_waits_for_in_flight_calls() {
    let mut harness = TestHarness::new();
    harness.spawn_agent().await;
    let pool = harness.open_pool().await.unwrap();

    let id = pool
        .deploy_cloud_object(counter_descriptor(true), vec![])
        .await
        .unwrap();
    let host = pool.find_managing_host(id).unwrap();

    // appel en vol simulé : garde de lecture tenue sur le verrou de l'objet
    let lock = pool.get_co_lock(id).unwrap();
    let guard = lock.read().await;

    let p = pool.clone();
    let h = host.clone();
    let shutdown = tokio::spawn(async move { p.shutdown_host(&h).await });

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!shutdown.is_finished(), "drain must wait for the in-flight call");

    drop(guard);
    shutdown.await.unwrap().unwrap();
    assert_eq!(pool.get_cloud_objects_count(), 0);

    pool.close().await;
    harness.shutdown().await;
}

#[tokio::test]
async fn transient_faults_are_retried_transparently() {
    let mut harness = TestHarness::new();
    harness.spawn_agent().await;
    let pool = harness.open_pool().await.unwrap();

    let id = pool
        .deploy_cloud_object(counter_descriptor(true), vec![])
        .await
        .unwrap();

    // la prochaine publication échoue ; le retry à backoff fixe la rejoue
    harness.broker.fail_next_publishes(1);
    let value = pool.invoke_cloud_object(id, "increment", vec![], None).await.unwrap();
    assert_eq!(value, json!(1));

    pool.close().await;
    harness.shutdown().await;
}
