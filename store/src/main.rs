use std::path::PathBuf;

use arcade_env::Config;
use arcade_store::StoreServer;
use clap::{arg, Command};
use tracing_subscriber::EnvFilter;

fn cli() -> Command {
    Command::new("arcade-store")
        .about("Record store service of the arcade platform.")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new("run").arg(
                arg!([config] "The path to the config file")
                    .value_parser(clap::value_parser!(PathBuf)),
            ),
        )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let matches = cli().get_matches();
    match matches.subcommand() {
        Some(("run", subcommand_matches)) => {
            let path = subcommand_matches.get_one::<PathBuf>("config");
            let config = Config::load(path.map(PathBuf::as_path)).await?;
            let server = StoreServer::bind(&config).await?;
            server.serve().await
        }
        _ => unreachable!(),
    }
}
