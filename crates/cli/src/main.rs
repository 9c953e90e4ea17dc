use std::{
    path::{Path, PathBuf},
    process,
};

use clap::{Parser, Subcommand};
use strom_core::config::{MANIFEST_FILE_NAME, Manifest};

mod run;

#[derive(Clone, Debug)]
pub struct Context {
    pub manifest_dir: PathBuf,
    pub manifest: Manifest,
}

#[derive(Parser, Debug)]
#[clap(author, version, about = "Strom - Stream lifecycle coordinator", long_about = None)]
struct Opts {
    /// Path to the strom.yaml manifest file (default: ./strom.yaml)
    #[arg(long = "manifest-path", short = 'm', global = true, default_value_t = default_manifest_path())]
    manifest_path: String,

    #[clap(subcommand)]
    command: Command,
}

fn default_manifest_path() -> String {
    format!("./{}", MANIFEST_FILE_NAME)
}

#[derive(Subcommand, PartialEq, Clone, Debug)]
enum Command {
    /// Start the coordinator server
    Run(run::RunCommand),
}

#[tokio::main]
async fn main() {
    let opts: Opts = match Opts::try_parse() {
        Ok(opts) => opts,
        Err(e) => {
            let _ = e.print();
            process::exit(e.exit_code());
        }
    };

    let manifest_path = PathBuf::from(&opts.manifest_path);
    let manifest_dir = manifest_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();

    load_env_file(&manifest_dir);

    let manifest = match Manifest::load(&manifest_path) {
        Ok(manifest) => {
            eprintln!("✓ Loaded manifest from {}", manifest_path.display());
            manifest
        }
        Err(e) => {
            eprintln!("Warning: {}", e);
            eprintln!("Using default configuration...");
            Manifest::default()
        }
    };

    let ctx = Context {
        manifest_dir,
        manifest,
    };

    if let Err(e) = handle_command(opts, &ctx).await {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

/// Load environment variables from .env file in the manifest directory
fn load_env_file(manifest_dir: &Path) {
    let env_file_path = manifest_dir.join(".env");

    match dotenvy::from_path(&env_file_path) {
        Ok(_) => {
            eprintln!("✓ Loaded environment from {}", env_file_path.display());
        }
        Err(e) if e.not_found() => {}
        Err(e) => {
            eprintln!(
                "Warning: Failed to load .env file at {}: {}",
                env_file_path.display(),
                e
            );
        }
    }
}

async fn handle_command(opts: Opts, ctx: &Context) -> Result<(), run::RunCommandError> {
    match opts.command {
        Command::Run(cmd) => cmd.execute(ctx).await,
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_definition() {
        Opts::command().debug_assert();
    }

    #[test]
    fn test_parse_run() {
        let opts = Opts::try_parse_from(["strom", "run", "--port", "8080", "-m", "conf/strom.yaml"])
            .unwrap();
        assert_eq!(opts.manifest_path, "conf/strom.yaml");
        let Command::Run(run) = opts.command;
        assert_eq!(run.port, Some(8080));
        assert_eq!(run.host, None);
    }

    #[test]
    fn test_default_manifest_path() {
        let opts = Opts::try_parse_from(["strom", "run"]).unwrap();
        assert_eq!(opts.manifest_path, "./strom.yaml");
    }
}
