use clap::Parser;
use env_logger::{Builder, Env};
use log::error;

mod cli;
mod cmd_create;
mod cmd_extract;
mod util;

fn init_logger() {
    // Уровень берём из RUST_LOG, иначе дефолт — info.
    Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}

fn main() {
    init_logger();

    if let Err(e) = run() {
        error!("{:?}", e);
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();
    match cli.cmd {
        cli::Cmd::Create(args) => cmd_create::exec(args),
        cli::Cmd::Extract(args) => cmd_extract::exec(args),
    }
}
