use ailang_cli::CompileCommand;
use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    env_logger::init();
    CompileCommand::parse().execute()
}
