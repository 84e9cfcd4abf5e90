use anyhow::{Context, Result};
use clap::Parser;
use intercal::Config;
use std::fs::read_to_string;

#[derive(Parser)]
/// Validates a TOML calibration config and prints it merged over its preset
struct Args {
    file: String,
    /// Print the resolved config as TOML
    #[arg(short, long)]
    toml: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let contents = read_to_string(&args.file).with_context(|| format!("Reading {}", args.file))?;
    let config = Config::from_toml(&contents).with_context(|| format!("Loading {}", args.file))?;

    if args.toml {
        print!("{}", toml::to_string(&config)?);
    } else {
        println!("{:#?}", config);
    }
    Ok(())
}
