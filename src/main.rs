use std::fs::{self, File};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use flownav::blueprint::Blueprint;
use flownav::core::config::{self, StorageBackend};
use flownav::flow::Flow;
use flownav::script;
use simplelog::{ConfigBuilder, LevelFilter, WriteLogger};

#[derive(Parser)]
#[command(name = "flownav", about = "Drive a navigation tree from the command line")]
struct Args {
    /// TOML blueprint describing the node tree
    blueprint: PathBuf,

    /// Navigation script to run against the tree
    #[arg(short, long)]
    script: Option<PathBuf>,

    /// Config file (defaults to ~/.flownav/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Storage backend, overriding config and environment
    #[arg(long, value_parser = parse_backend)]
    storage: Option<StorageBackend>,

    /// Directory for the file backend
    #[arg(long)]
    storage_dir: Option<PathBuf>,

    /// Log file
    #[arg(long, default_value = "flownav.log")]
    log_file: PathBuf,

    #[arg(long, default_value_t = LevelFilter::Debug)]
    log_level: LevelFilter,
}

fn parse_backend(s: &str) -> Result<StorageBackend, String> {
    StorageBackend::parse(s).ok_or_else(|| format!("unknown storage backend '{s}'"))
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    dotenv::dotenv().ok();

    let log_config = ConfigBuilder::new().set_time_format_rfc3339().build();
    if let Ok(log_file) = File::create(&args.log_file) {
        let _ = WriteLogger::init(args.log_level, log_config, log_file);
    }

    let file_config = match &args.config {
        Some(path) => config::load_config_from(path),
        None => config::load_config(),
    };
    let file_config = match file_config {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let mut resolved = config::resolve(&file_config, args.storage);
    if let Some(dir) = args.storage_dir {
        resolved.storage_dir = Some(dir);
    }
    log::info!("flownav starting with {:?}", resolved);

    let flow = Flow::new(resolved);
    let blueprint = match Blueprint::load(&args.blueprint) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = blueprint.apply(flow.registry()) {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }
    if let Some(root) = &blueprint.root {
        flow.switch_root(root);
    }

    if let Some(path) = &args.script {
        let commands = match fs::read_to_string(path)
            .map_err(|e| e.to_string())
            .and_then(|src| script::parse(&src).map_err(|e| e.to_string()))
        {
            Ok(c) => c,
            Err(e) => {
                eprintln!("{}: {e}", path.display());
                return ExitCode::FAILURE;
            }
        };
        for command in &commands {
            println!("{}", script::run(&flow, command).await);
        }
    }

    print!("{}", flow.print_tree());
    ExitCode::SUCCESS
}
