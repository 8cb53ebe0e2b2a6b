//! Name-based, fixed-list and discovery-mediated resolvers.

mod common;

use std::net::SocketAddr;
use std::sync::Arc;

use common::{eventually, fast_config, next_item, quiet, server_instance, within, Cluster};
use eureka_core::{
    ChangeNotification, DiscoveryError, Endpoint, InstanceInfoBuilder, Interests, LoopbackTransport, NameResolver,
    StaticNameResolver, Status,
};
use eureka_rs::config::ResolverConfig;
use eureka_rs::resolver::from_config;
use eureka_rs::{ServerResolver, ServerResolvers};

const VIP: &str = "eurekaReadServerVip";

fn addr(ip: [u8; 4]) -> SocketAddr {
    (ip, 0).into()
}

#[tokio::test]
async fn dns_resolver_caches_until_invalidated() {
    let naming = StaticNameResolver::new().with_host("write.local", vec![addr([10, 0, 0, 1]), addr([10, 0, 0, 2])]);
    let resolver = ServerResolvers::from_dns_name("write.local")
        .with_port(13100)
        .with_name_resolver(Arc::new(naming.clone()))
        .build_resolver();

    let eps = resolver.endpoints().await.unwrap();
    assert_eq!(eps, vec![Endpoint::new("10.0.0.1", 13100), Endpoint::new("10.0.0.2", 13100)]);
    resolver.endpoints().await.unwrap();
    assert_eq!(resolver.lookups(), 1);

    naming.set("write.local", vec![addr([10, 0, 0, 3])]);
    assert_eq!(resolver.endpoints().await.unwrap().len(), 2);
    resolver.invalidate();
    assert_eq!(resolver.endpoints().await.unwrap(), vec![Endpoint::new("10.0.0.3", 13100)]);
    assert_eq!(resolver.lookups(), 2);
}

#[tokio::test]
async fn dns_failure_is_reported_not_retried() {
    let naming = StaticNameResolver::new();
    let resolver = ServerResolvers::from_dns_name("missing.local")
        .with_name_resolver(Arc::new(naming))
        .build_resolver();
    match resolver.endpoints().await {
        Err(DiscoveryError::Resolution(_)) => {}
        other => panic!("expected Resolution, got {:?}", other),
    }
    assert_eq!(resolver.lookups(), 1);

    let mut stream = resolver.resolve();
    assert!(matches!(next_item(&mut stream).await, Err(DiscoveryError::Resolution(_))));
    assert!(within(futures_util::StreamExt::next(&mut stream)).await.is_none());
}

#[tokio::test]
async fn dns_resolve_stream_follows_re_resolution() {
    let naming = StaticNameResolver::new().with_host("write.local", vec![addr([10, 0, 0, 1])]);
    let resolver = ServerResolvers::from_dns_name("write.local")
        .with_port(1)
        .with_name_resolver(Arc::new(naming.clone()))
        .build_resolver();

    let mut stream = resolver.resolve();
    assert_eq!(next_item(&mut stream).await, Ok(ChangeNotification::Add(Endpoint::new("10.0.0.1", 1))));
    assert_eq!(next_item(&mut stream).await, Ok(ChangeNotification::BufferSentinel));

    naming.set("write.local", vec![addr([10, 0, 0, 2])]);
    resolver.invalidate();
    resolver.endpoints().await.unwrap();
    assert_eq!(next_item(&mut stream).await, Ok(ChangeNotification::Delete(Endpoint::new("10.0.0.1", 1))));
    assert_eq!(next_item(&mut stream).await, Ok(ChangeNotification::Add(Endpoint::new("10.0.0.2", 1))));

    // Each subscription is its own traversal.
    let mut second = resolver.resolve();
    assert_eq!(next_item(&mut second).await, Ok(ChangeNotification::Add(Endpoint::new("10.0.0.2", 1))));
    assert_eq!(next_item(&mut second).await, Ok(ChangeNotification::BufferSentinel));

    resolver.close().await;
    assert_eq!(next_item(&mut stream).await, Ok(ChangeNotification::Delete(Endpoint::new("10.0.0.2", 1))));
    assert!(within(futures_util::StreamExt::next(&mut stream)).await.is_none());

    // A closed resolver starts over with a fresh lookup.
    assert_eq!(resolver.endpoints().await.unwrap(), vec![Endpoint::new("10.0.0.2", 1)]);
    assert_eq!(resolver.lookups(), 3);
}

#[tokio::test]
async fn static_resolver_survives_close() {
    let resolver = ServerResolvers::from_endpoints([Endpoint::new("a", 1), Endpoint::new("b", 2)]);
    assert_eq!(resolver.endpoints().await.unwrap().len(), 2);
    resolver.close().await;
    assert_eq!(resolver.endpoints().await.unwrap().len(), 2);
    assert!(ServerResolvers::from_endpoints([]).endpoints().await.is_err());
}

#[tokio::test]
async fn config_builds_the_resolver_graph() {
    let transport: Arc<LoopbackTransport> = Arc::new(LoopbackTransport::new());
    let naming: Arc<dyn NameResolver> =
        Arc::new(StaticNameResolver::new().with_host("write.local", vec![addr([10, 0, 0, 1])]));
    let cfg = ResolverConfig::from_json(
        r#"{"type":"eureka","bootstrap":{"type":"dns","host":"write.local","port":13101},
            "interest":{"type":"vip","vip":"eurekaReadServerVip"}}"#,
    )
    .unwrap();
    let resolver = from_config(&cfg, Some(naming.clone()), transport.clone(), &fast_config()).unwrap();
    assert!(resolver.describe().starts_with("eureka("));
    assert_eq!(transport.total_opened(), 0);

    let bad = ResolverConfig::Dns {
        host: " ".into(),
        port: 1,
    };
    assert!(matches!(
        from_config(&bad, Some(naming.clone()), transport.clone(), &fast_config()),
        Err(DiscoveryError::InvalidArgument(_))
    ));
    let empty = ResolverConfig::Endpoints { endpoints: vec![] };
    assert!(from_config(&empty, Some(naming), transport, &fast_config()).is_err());
}

#[tokio::test]
async fn eureka_resolver_needs_a_valid_interest() {
    let bootstrap = ServerResolvers::from_endpoints([Endpoint::new("a", 1)]);
    assert!(ServerResolvers::from_eureka(Arc::clone(&bootstrap)).build().is_err());
    assert!(ServerResolvers::from_eureka(bootstrap)
        .for_interest(Interests::for_applications(Vec::<String>::new()))
        .build()
        .is_err());
}

#[tokio::test]
async fn eureka_resolver_tracks_up_instances() {
    let cluster = Cluster::new("10.0.0.1", 13101);
    cluster.registry.upsert(server_instance("r1", VIP, "10.1.0.1", 13200, Status::Up));
    cluster.registry.upsert(server_instance("r2", VIP, "10.1.0.2", 13200, Status::Down));
    cluster.registry.upsert(server_instance("other", "otherVip", "10.1.0.3", 13200, Status::Up));

    let resolver = ServerResolvers::from_eureka(Arc::clone(&cluster.resolver))
        .for_interest(Interests::for_vips([VIP]))
        .with_transport(cluster.transport())
        .with_config(fast_config())
        .build()
        .unwrap();
    assert_eq!(cluster.transport.total_opened(), 0);

    assert_eq!(within(resolver.endpoints()).await.unwrap(), vec![Endpoint::new("10.1.0.1", 13200)]);

    let mut stream = resolver.resolve();
    assert_eq!(next_item(&mut stream).await, Ok(ChangeNotification::Add(Endpoint::new("10.1.0.1", 13200))));
    assert_eq!(next_item(&mut stream).await, Ok(ChangeNotification::BufferSentinel));

    // r2 comes up, then goes away again.
    let r2 = server_instance("r2", VIP, "10.1.0.2", 13200, Status::Up);
    cluster.registry.upsert(r2.clone());
    assert_eq!(next_item(&mut stream).await, Ok(ChangeNotification::Add(Endpoint::new("10.1.0.2", 13200))));
    cluster.registry.upsert(InstanceInfoBuilder::from(&r2).status(Status::OutOfService).build().unwrap());
    assert_eq!(next_item(&mut stream).await, Ok(ChangeNotification::Delete(Endpoint::new("10.1.0.2", 13200))));
    cluster.registry.remove("r2");
    assert!(quiet(&mut stream).await);

    // Same id, new address: old endpoint leaves before the new one appears.
    cluster.registry.upsert(server_instance("r1", VIP, "10.1.0.9", 13200, Status::Up));
    assert_eq!(next_item(&mut stream).await, Ok(ChangeNotification::Delete(Endpoint::new("10.1.0.1", 13200))));
    assert_eq!(next_item(&mut stream).await, Ok(ChangeNotification::Add(Endpoint::new("10.1.0.9", 13200))));

    resolver.close().await;
    assert_eq!(next_item(&mut stream).await, Ok(ChangeNotification::Delete(Endpoint::new("10.1.0.9", 13200))));
    assert!(within(futures_util::StreamExt::next(&mut stream)).await.is_none());
    eventually("inner interest session closed", || cluster.registry.live_sessions() == 0).await;
}

#[tokio::test]
async fn eureka_resolver_with_no_live_instances_fails_resolution() {
    let cluster = Cluster::new("10.0.0.1", 13101);
    let resolver = ServerResolvers::from_eureka(Arc::clone(&cluster.resolver))
        .for_interest(Interests::for_vips([VIP]))
        .with_transport(cluster.transport())
        .with_config(fast_config())
        .build()
        .unwrap();
    assert!(matches!(within(resolver.endpoints()).await, Err(DiscoveryError::Resolution(_))));

    cluster.registry.upsert(server_instance("r1", VIP, "10.1.0.1", 13200, Status::Up));
    let mut stream = resolver.resolve();
    loop {
        if next_item(&mut stream).await == Ok(ChangeNotification::Add(Endpoint::new("10.1.0.1", 13200))) {
            break;
        }
    }
    resolver.close().await;
}

#[tokio::test]
async fn eureka_resolver_restart_waits_for_a_fresh_snapshot() {
    let cluster = Cluster::new("10.0.0.1", 13101);
    cluster.registry.upsert(server_instance("r1", VIP, "10.1.0.1", 13200, Status::Up));
    let resolver = ServerResolvers::from_eureka(Arc::clone(&cluster.resolver))
        .for_interest(Interests::for_vips([VIP]))
        .with_transport(cluster.transport())
        .with_config(fast_config())
        .build()
        .unwrap();
    let mut stream = resolver.resolve();
    assert_eq!(next_item(&mut stream).await, Ok(ChangeNotification::Add(Endpoint::new("10.1.0.1", 13200))));
    assert_eq!(next_item(&mut stream).await, Ok(ChangeNotification::BufferSentinel));

    // The subscription dies for good while the cluster is unreachable.
    cluster.transport.refuse(&cluster.endpoint, true);
    cluster.registry.drop_sessions();
    assert!(matches!(next_item(&mut stream).await, Err(DiscoveryError::Connection { .. })));

    // Membership moves on while nobody is watching.
    cluster.registry.remove("r1");
    cluster.registry.upsert(server_instance("r3", VIP, "10.1.0.3", 13200, Status::Up));
    cluster.transport.refuse(&cluster.endpoint, false);

    assert_eq!(within(resolver.endpoints()).await.unwrap(), vec![Endpoint::new("10.1.0.3", 13200)]);
    assert_eq!(next_item(&mut stream).await, Ok(ChangeNotification::Delete(Endpoint::new("10.1.0.1", 13200))));
    assert_eq!(next_item(&mut stream).await, Ok(ChangeNotification::Add(Endpoint::new("10.1.0.3", 13200))));
    resolver.close().await;
}
