//! CLI for eureka-rs: register this process, or watch notifications for an interest.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use eureka_core::{DataCenterInfo, InstanceInfo, Interests, ServicePort, Status, TcpTransport};
use eureka_rs::config::{DEFAULT_INTEREST_PORT, DEFAULT_REGISTRATION_PORT};
use eureka_rs::{ClientConfig, EurekaClient, InstancePublisher, ServerResolver, ServerResolvers};
use futures_util::StreamExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "eureka")]
#[command(about = "Eureka client CLI")]
struct Cli {
    /// Discovery server host, optionally host:port (registration port when omitted)
    #[arg(long, env = "EUREKA_SERVER", default_value = "localhost")]
    server: String,
    /// Interest port on the same host
    #[arg(long, env = "EUREKA_INTEREST_PORT", default_value_t = DEFAULT_INTEREST_PORT)]
    interest_port: u16,
    /// Read the interest cluster from instances with this vip instead of the server host
    #[arg(long)]
    read_vip: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register an instance as UP until interrupted, then deregister.
    Register {
        /// Application name
        #[arg(long)]
        app: String,
        /// Instance id (defaults to id_<app>)
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        vip: Option<String>,
        /// Service port advertised in the record
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print change notifications until interrupted.
    Watch {
        /// Application names; the whole registry when neither --app nor --vip is given
        #[arg(long = "app")]
        apps: Vec<String>,
        #[arg(long)]
        vip: Option<String>,
    },
}

fn split_host_port(server: &str, default_port: u16) -> Result<(String, u16), Box<dyn std::error::Error + Send + Sync>> {
    match server.rsplit_once(':') {
        Some((host, port)) => Ok((host.to_string(), port.parse()?)),
        None => Ok((server.to_string(), default_port)),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = ClientConfig::from_env();
    let transport = Arc::new(TcpTransport::new(config.connect_timeout));
    let (host, registration_port) = split_host_port(&cli.server, DEFAULT_REGISTRATION_PORT)?;

    let write_resolver = ServerResolvers::from_dns_name(host.clone()).with_port(registration_port).build();
    let mut read_resolver: Arc<dyn ServerResolver> = ServerResolvers::from_dns_name(host).with_port(cli.interest_port).build();
    if let Some(vip) = &cli.read_vip {
        read_resolver = ServerResolvers::from_eureka(read_resolver)
            .for_interest(Interests::for_vips([vip.clone()]))
            .with_port(cli.interest_port)
            .with_transport(transport.clone())
            .with_config(config.clone())
            .build()?;
    }

    let client = EurekaClient::builder()
        .with_registration_resolver(write_resolver)
        .with_interest_resolver(read_resolver)
        .with_transport(transport)
        .with_config(config)
        .build()?;

    match cli.command {
        Commands::Register { app, id, vip, port } => {
            let mut builder = InstanceInfo::builder()
                .id(id.unwrap_or_else(|| format!("id_{}", app)))
                .app(app.clone())
                .vip_address(vip.unwrap_or(app))
                .status(Status::Up)
                .data_center_info(DataCenterInfo::from_system_data());
            if let Some(p) = port {
                builder = builder.port(ServicePort::new(p));
            }
            let info = builder.build()?;
            let (publisher, updates) = InstancePublisher::new();
            publisher.push(info.clone())?;
            let registration = client.register(updates)?;
            println!("registering {}", info);
            tokio::select! {
                r = registration.closed() => r?,
                _ = tokio::signal::ctrl_c() => {
                    println!("deregistering {}", info.id());
                    registration.cancel();
                    if let Err(e) = registration.closed().await {
                        eprintln!("{}", e);
                    }
                }
            }
        }
        Commands::Watch { apps, vip } => {
            let interest = match (apps.is_empty(), vip) {
                (true, None) => Interests::for_full_registry(),
                (true, Some(v)) => Interests::for_vips([v]),
                (false, None) => Interests::for_applications(apps),
                (false, Some(v)) => Interests::for_some(vec![Interests::for_applications(apps), Interests::for_vips([v])]),
            };
            println!("watching {}", interest);
            let mut notifications = client.for_interest(interest)?;
            loop {
                tokio::select! {
                    n = notifications.next() => match n {
                        Some(Ok(n)) => println!("{}", n),
                        Some(Err(e)) => {
                            eprintln!("{}", e);
                            break;
                        }
                        None => break,
                    },
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        }
    }

    client.shutdown().await;
    Ok(())
}
