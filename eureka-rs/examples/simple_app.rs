//! Register ServiceA, flip it to DOWN, deregister, and watch the whole lifecycle from an interest
//! subscription. Runs against the in-process loopback registry:
//! `cargo run -p eureka-rs --example simple_app`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use eureka_core::{
    DataCenterInfo, Endpoint, InstanceInfo, InstanceInfoBuilder, Interests, LoopbackRegistry, LoopbackTransport,
    NetworkAddress, ServicePort, StaticNameResolver, Status,
};
use eureka_rs::{ClientConfig, EurekaClient, InstancePublisher, ServerResolvers};
use futures_util::StreamExt;
use tracing_subscriber::EnvFilter;

const WRITE_SERVER_DNS: &str = "writeserver.eureka.local";
const WRITE_SERVER_PORT: u16 = 13100;
const READ_SERVER_PORT: u16 = 13101;
const READ_SERVER_VIP: &str = "eurekaReadServerVip";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // One registry reachable both as the write server and as the read server it advertises.
    let registry = LoopbackRegistry::new();
    let transport = LoopbackTransport::new();
    let write_addr: SocketAddr = ([127, 0, 0, 1], WRITE_SERVER_PORT).into();
    transport.serve(&Endpoint::from(write_addr), registry.clone());
    transport.serve(&Endpoint::new("127.0.0.2", READ_SERVER_PORT), registry.clone());
    registry.upsert(
        InstanceInfo::builder()
            .id("read-server-1")
            .app("ReadServer")
            .vip_address(READ_SERVER_VIP)
            .status(Status::Up)
            .data_center_info(DataCenterInfo::new("default").with_address(NetworkAddress {
                ip: Some("127.0.0.2".into()),
                hostname: None,
                public: true,
            }))
            .port(ServicePort::named("interest", READ_SERVER_PORT))
            .build()?,
    );
    let naming = Arc::new(StaticNameResolver::new().with_host(WRITE_SERVER_DNS, vec![write_addr]));

    let config = ClientConfig::from_env();
    let write_resolver = ServerResolvers::from_dns_name(WRITE_SERVER_DNS)
        .with_port(WRITE_SERVER_PORT)
        .with_name_resolver(naming)
        .build();
    let read_resolver = ServerResolvers::from_eureka(Arc::clone(&write_resolver))
        .for_interest(Interests::for_vips([READ_SERVER_VIP]))
        .with_transport(Arc::new(transport.clone()))
        .with_config(config.clone())
        .build()?;

    let client = EurekaClient::builder()
        .with_registration_resolver(write_resolver)
        .with_interest_resolver(read_resolver)
        .with_transport(Arc::new(transport))
        .with_config(config)
        .build()?;

    let mut notifications = client.for_interest(Interests::for_applications(["WriteServer", "ReadServer", "ServiceA"]))?;
    let watcher = tokio::spawn(async move {
        while let Some(n) = notifications.next().await {
            match n {
                Ok(n) => println!("interest: {}", n),
                Err(e) => {
                    eprintln!("interest stream failed: {}", e);
                    break;
                }
            }
        }
    });

    let service_a = InstanceInfo::builder()
        .id("id_serviceA")
        .app("ServiceA")
        .app_group("ServiceA_1")
        .status(Status::Up)
        .data_center_info(DataCenterInfo::from_system_data())
        .build()?;

    let (publisher, updates) = InstancePublisher::new();
    let registration = client.register(updates)?;
    println!("registering SERVICE_A with eureka");
    publisher.push(service_a.clone())?;
    tokio::time::sleep(Duration::from_secs(1)).await;

    println!("updating SERVICE_A status to DOWN");
    publisher.push(InstanceInfoBuilder::from(&service_a).status(Status::Down).build()?)?;
    tokio::time::sleep(Duration::from_secs(1)).await;

    println!("unregistering SERVICE_A");
    registration.unregister().await?;
    tokio::time::sleep(Duration::from_millis(500)).await;

    for message in registry.registration_messages() {
        println!("server observed: {}", message.name());
    }

    client.shutdown().await;
    let _ = watcher.await;
    Ok(())
}
