//! Runs against a real Redis in Docker: `cargo test -- --ignored`

use slidegate::{
    cache::LocalFallbackCache,
    limiter::{CheckOptions, EngineConfig, RateLimitEngine},
    metrics::Metrics,
    redis::{RedisClient, RedisConfig},
    store::{CounterStore, NodeStatus},
    utils::{Clock, SystemClock},
};
use std::sync::Arc;
use std::time::Duration;
use testcontainers::{clients::Cli, core::WaitFor, GenericImage};

fn redis_image() -> GenericImage {
    GenericImage::new("redis", "7-alpine")
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"))
}

fn client_for(port: u16) -> Arc<RedisClient> {
    Arc::new(
        RedisClient::new(RedisConfig {
            host: "127.0.0.1".to_string(),
            port,
            ..Default::default()
        })
        .unwrap(),
    )
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_sliding_window_against_redis() {
    let docker = Cli::default();
    let container = docker.run(redis_image());
    let client = client_for(container.get_host_port_ipv4(6379));
    assert!(client.is_ready().await);

    let engine = RateLimitEngine::new(
        client.clone(),
        Arc::new(LocalFallbackCache::default()),
        Arc::new(SystemClock),
        Arc::new(Metrics::new().unwrap()),
        EngineConfig::default(),
    );
    let options = CheckOptions::new()
        .with_limit(2)
        .with_window_ms(1_000)
        .with_burst(0);

    assert!(engine.check("redis-user", &options).await.allowed);
    assert!(engine.check("redis-user", &options).await.allowed);
    let third = engine.check("redis-user", &options).await;
    assert!(!third.allowed);
    assert!(!third.fallback);
    assert_eq!(third.current, 3);

    tokio::time::sleep(Duration::from_millis(1_100)).await;
    let later = engine.check("redis-user", &options).await;
    assert!(later.allowed);
    assert_eq!(later.current, 1);

    assert!(engine.reset("redis-user", None).await);
    assert_eq!(client.cardinality("ratelimit:redis-user:default").await.unwrap(), 0);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_heartbeat_records_against_redis() {
    let docker = Cli::default();
    let container = docker.run(redis_image());
    let client = client_for(container.get_host_port_ipv4(6379));

    let now = SystemClock.now_millis();
    client.publish_heartbeat("node-a", now, 30).await.unwrap();
    let record = client.node_health("node-a").await.unwrap().unwrap();
    assert_eq!(record.status, NodeStatus::Active);
    assert_eq!(record.last_heartbeat_ms, Some(now));

    client.mark_shutdown("node-a", 30).await.unwrap();
    let record = client.node_health("node-a").await.unwrap().unwrap();
    assert_eq!(record.status, NodeStatus::Shutdown);

    assert!(client.node_health("node-missing").await.unwrap().is_none());
}
