use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use std::process::Command;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Workspace tasks", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build every crate
    Build,
    /// Run the test suite
    Test,
    /// Run the capture tool; extra arguments are passed through
    Capture {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

fn cargo(args: &[&str]) -> Result<()> {
    let status = Command::new("cargo").args(args).status()?;
    if !status.success() {
        bail!("cargo {} failed", args.join(" "));
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Build => cargo(&["build", "--workspace"]),
        Commands::Test => cargo(&["test", "--workspace"]),
        Commands::Capture { args } => {
            let mut cmd = vec!["run", "-p", "goodix-cli", "--"];
            cmd.extend(args.iter().map(String::as_str));
            cargo(&cmd)
        }
    }
}
