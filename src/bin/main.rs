use local_geoip::cache::MemoryCache;
use local_geoip::config::{parse_config, Config};
use local_geoip::geo::{GeoIpLookup, LookupSettings, MmdbGeoIpLookup};
use local_geoip::update::UpdatePipeline;

use std::sync::Arc;
use std::time::Duration;

enum Command {
    Lookup(String),
    Update,
}

fn usage() -> anyhow::Error {
    anyhow::anyhow!("usage: local-geoip <config.toml> (lookup <ip> | update)")
}

fn parse_args() -> anyhow::Result<(String, Command)> {
    let mut args = std::env::args().skip(1);
    let config_path = args.next().ok_or_else(usage)?;
    let command = match args.next().as_deref() {
        Some("lookup") => Command::Lookup(args.next().ok_or_else(usage)?),
        Some("update") => Command::Update,
        _ => return Err(usage()),
    };
    Ok((config_path, command))
}

async fn async_main(config: Config, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Lookup(ip_address) => {
            let lookup = MmdbGeoIpLookup::new(
                LookupSettings {
                    database_path: config.database_path,
                    cache_ttl: Duration::from_secs(config.cache_ttl),
                    database_max_age_days: config.database_max_age_days,
                },
                Arc::new(MemoryCache::new()),
            );
            match lookup.lookup(&ip_address) {
                Some(record) => println!("{record:#?}"),
                None => println!("no record for {ip_address}"),
            }
            lookup.close();
            Ok(())
        }
        Command::Update => {
            let pipeline = UpdatePipeline::new(config.update, config.database_path);
            let target = pipeline.run().await?;
            println!("database updated: {}", target.display());
            Ok(())
        }
    }
}

fn main() -> anyhow::Result<()> {
    let (config_path, command) = parse_args()?;
    let config = parse_config(&config_path)?;

    simple_logger::init_with_level(config.log_level)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async_main(config, command))
}
