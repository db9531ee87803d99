//! Thin CLI harness for manual probing and integration tests: each
//! subcommand exercises one component end to end against a scratch
//! directory or in-memory fixture, wrapping a subsystem for operator use.

use std::path::PathBuf;

use anyhow::{bail, Result};

use yt_core_storage::changelog::FileChangelog;
use yt_core_storage::config::{load_config, ChangelogConfig};

fn print_usage() {
    eprintln!("usage: storectl <command> [args]");
    eprintln!("commands:");
    eprintln!("  changelog-inspect <path-prefix>   open a changelog and print its record count and seal state");
    eprintln!("  config-check <path>               load a TOML config file and print it back out");
}

fn cmd_changelog_inspect(path_prefix: &str) -> Result<()> {
    let config = ChangelogConfig::default();
    let changelog = FileChangelog::open(PathBuf::from(path_prefix), config.index_block_size)?;
    println!("record_count: {}", changelog.record_count());
    println!("sealed: {}", changelog.is_sealed());
    Ok(())
}

fn cmd_config_check(path: &str) -> Result<()> {
    let config = load_config(path)?;
    println!("{:#?}", config);
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    let Some(command) = args.get(1) else {
        print_usage();
        bail!("missing command");
    };

    match command.as_str() {
        "changelog-inspect" => {
            let path = args.get(2).ok_or_else(|| anyhow::anyhow!("changelog-inspect requires a path"))?;
            cmd_changelog_inspect(path)
        }
        "config-check" => {
            let path = args.get(2).ok_or_else(|| anyhow::anyhow!("config-check requires a path"))?;
            cmd_config_check(path)
        }
        other => {
            print_usage();
            bail!("unknown command {:?}", other);
        }
    }
}
