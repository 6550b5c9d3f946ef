use adc_dht::dht::{Cid, DhtConfig, DhtEngine, MemoryStore, StaticBootstrap};
use std::sync::Arc;
use std::time::Duration;

fn loopback_config(nick: &str) -> DhtConfig {
    DhtConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        nick: nick.to_string(),
        ..DhtConfig::default()
    }
}

async fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..50 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    condition()
}

/// 两个节点通过本地UDP互相发现
#[tokio::test]
async fn test_two_engines_discover_each_other() {
    let first = Arc::new(DhtEngine::new(
        loopback_config("first"),
        Cid::random(),
        Arc::new(MemoryStore::new()),
    ));
    first.start().await.expect("first engine should start");
    let first_port = first.local_port().expect("first engine has a port");
    assert_ne!(first_port, 0);

    let seed = format!("{}@127.0.0.1:{}", first.local_id(), first_port);
    let second = Arc::new(
        DhtEngine::new(loopback_config("second"), Cid::random(), Arc::new(MemoryStore::new()))
            .with_bootstrap(Arc::new(StaticBootstrap::from_strings(&[seed]))),
    );
    second.start().await.expect("second engine should start");

    let found = wait_for(|| {
        first.get_node(second.local_id()).map_or(false, |n| n.is_online())
            && second.get_node(first.local_id()).map_or(false, |n| n.is_online())
    })
    .await;
    assert!(found, "engines did not see each other");

    let nick = second.get_node(first.local_id()).and_then(|n| n.nick());
    assert_eq!(nick.as_deref(), Some("first"));
    assert!(first.is_connected());
    assert!(second.is_connected());

    second.stop(true);
    first.stop(true);
    assert!(first.local_port().is_none());
}
