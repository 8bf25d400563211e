use clap::Parser;
use foodvision::Opts;
use foodvision::cli::SubCommandExtend;
use foodvision::config::SubCommand;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let opts = Opts::parse();

    match &opts.subcmd {
        SubCommand::Server(config) => config.run(&opts).await,
        SubCommand::Add(config) => config.run(&opts).await,
        SubCommand::Search(config) => config.run(&opts).await,
        SubCommand::Train(config) => config.run(&opts).await,
        SubCommand::Purge(config) => config.run(&opts).await,
        SubCommand::Show(config) => config.run(&opts).await,
    }
}
