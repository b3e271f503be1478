use anyhow::Context;
use clap::{Arg, ArgMatches, Command};
use dbal_pool::db::{ConnectionPool, Connector, Downscaler, PgConnectionFactory};
use dbal_pool::{Config, logging, server};
use dotenv::dotenv;
use std::process;
use tracing::{info, warn};

#[tokio::main]
async fn main() {
    // Load environment variables from .env file
    dotenv().ok();

    let matches = build_cli().get_matches();

    if let Err(e) = run_command(matches).await {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

fn build_cli() -> Command {
    Command::new("dbal-pool")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Pooled PostgreSQL connections with retry and idle downscaling")
        .arg_required_else_help(true)
        .subcommand(
            Command::new("serve")
                .about("Start the HTTP demo server")
                .arg(
                    Arg::new("host")
                        .long("host")
                        .help("Address to bind (overrides server.host)"),
                )
                .arg(
                    Arg::new("port")
                        .short('p')
                        .long("port")
                        .help("Port to listen on (overrides server.port)")
                        .value_parser(clap::value_parser!(u16)),
                ),
        )
        .subcommand(
            Command::new("config").about("Print the effective configuration with secrets masked"),
        )
}

async fn run_command(matches: ArgMatches) -> anyhow::Result<()> {
    let config = Config::load()?;

    match matches.subcommand() {
        Some(("serve", sub_matches)) => serve(config, sub_matches).await?,
        Some(("config", _)) => {
            println!("{}", serde_json::to_string_pretty(&config.redacted())?);
        }
        _ => {
            unreachable!("Command parsing should ensure we never reach this");
        }
    }

    Ok(())
}

async fn serve(mut config: Config, matches: &ArgMatches) -> anyhow::Result<()> {
    if let Some(host) = matches.get_one::<String>("host") {
        config.server.host = host.clone();
    }
    if let Some(port) = matches.get_one::<u16>("port") {
        config.server.port = *port;
    }

    logging::init(&config.logging)?;

    let factory = PgConnectionFactory::new(config.database.to_connection_config());
    info!("Pooling connections to {}", factory);

    let pool = ConnectionPool::new(factory, config.pool.pool_settings())
        .context("Failed to create connection pool")?;
    let downscaler = Downscaler::new(pool.clone(), config.pool.tick_frequency())
        .retire_exhausted(config.pool.retire_exhausted);
    downscaler.run();

    let connector = Connector::new(pool.clone(), config.pool.acquire_settings()?);
    let addr = format!("{}:{}", config.server.host, config.server.port);

    let result = server::start_server(connector, &addr, shutdown_signal()).await;

    downscaler.shutdown().await;
    pool.close();
    info!("Pool closed");

    result?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
