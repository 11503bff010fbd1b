#![cfg(not(tarpaulin_include))]

use screener::{Config, app, source_from_config};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::load()?;
    let source = source_from_config(&config)?;

    println!(
        "Starting screener for sheet \"{}\" on http://{}",
        config.sheet.name, config.server.bind
    );
    app::run(config, source).await
}
