// build.rs

use clap::{Arg, ArgAction, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

fn store_args(cmd: Command) -> Command {
    cmd.arg(
        Arg::new("root")
            .short('r')
            .long("root")
            .value_name("PATH")
            .global(true)
            .default_value("/var/lib/stowage")
            .help("Store root directory"),
    )
    .arg(
        Arg::new("timeout")
            .short('t')
            .long("timeout")
            .value_name("SECS")
            .global(true)
            .default_value("60")
            .help("Seconds to wait for the store lock"),
    )
}

fn build_cli() -> Command {
    store_args(
        Command::new("stowage")
            .version(env!("CARGO_PKG_VERSION"))
            .author("Stowage Contributors")
            .about("Installation store guarded by cross-process file locks"),
    )
    .subcommand_required(false)
    .subcommand(Command::new("init").about("Initialize the store"))
    .subcommand(
        Command::new("add")
            .about("Record an installed package")
            .arg(Arg::new("name").required(true).help("Package name"))
            .arg(Arg::new("version").required(true).help("Package version"))
            .arg(Arg::new("prefix").required(true).help("Installation prefix"))
            .arg(
                Arg::new("implicit")
                    .long("implicit")
                    .action(ArgAction::SetTrue)
                    .help("Mark as installed as a dependency"),
            ),
    )
    .subcommand(
        Command::new("remove")
            .about("Forget an installed package")
            .arg(Arg::new("name").required(true).help("Package name to remove")),
    )
    .subcommand(
        Command::new("query")
            .about("Query installed packages")
            .arg(Arg::new("pattern").help("Package name pattern (optional)")),
    )
    .subcommand(Command::new("lock-info").about("Show the store lock file and its last exclusive holder"))
    .subcommand(
        Command::new("completions")
            .about("Generate shell completion scripts")
            .arg(
                Arg::new("shell")
                    .required(true)
                    .value_parser(["bash", "elvish", "fish", "powershell", "zsh"])
                    .help("Shell type"),
            ),
    )
}

fn main() -> std::io::Result<()> {
    println!("cargo:rerun-if-changed=build.rs");

    let out_dir = PathBuf::from(env::var_os("OUT_DIR").ok_or_else(|| std::io::Error::other("OUT_DIR not set"))?);
    let man_dir = out_dir.join("man");
    fs::create_dir_all(&man_dir)?;

    let mut buffer = Vec::new();
    Man::new(build_cli()).render(&mut buffer)?;

    let man_path = man_dir.join("stowage.1");
    fs::write(&man_path, buffer)?;
    Ok(())
}
