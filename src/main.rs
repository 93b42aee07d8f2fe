use std::path::PathBuf;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use localfn::{ActionDescriptor, EngineConfig, LocalEngine, RuntimeKind};

#[derive(Parser, Debug)]
#[command(name = "localfn", version, about = "Run and debug serverless actions in a local Docker container")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Verbose logs
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Endpoint serving the runtimes listing
    #[arg(long, global = true)]
    runtimes: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run an action from a local source file in a container
    Play {
        /// Action source file (a zip archive with --binary)
        file: PathBuf,
        /// Runtime kind of the action
        #[arg(long, default_value = "nodejs:8")]
        kind: String,
        /// Input parameter as a name/value pair; repeatable
        #[arg(short = 'p', long = "param", num_args = 2, value_names = ["NAME", "VALUE"])]
        param: Vec<String>,
        /// Treat the file as a zip archive with a package.json manifest
        #[arg(long)]
        binary: bool,
    },
    /// Run a nodejs action under the inspector and report its result
    Debug {
        file: PathBuf,
        #[arg(long, default_value = "nodejs:8")]
        kind: String,
        #[arg(short = 'p', long = "param", num_args = 2, value_names = ["NAME", "VALUE"])]
        param: Vec<String>,
        #[arg(long)]
        binary: bool,
    },
    /// Start a container for a runtime kind without running anything
    Init {
        #[arg(long, default_value = "nodejs:8")]
        kind: String,
    },
    /// Stop and remove the managed container
    Kill,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "info" } else { "warn" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("LOCALFN_LOG").unwrap_or_else(|_| filter.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut cfg = EngineConfig::default();
    if let Some(endpoint) = cli.runtimes {
        cfg.runtimes_endpoint = endpoint;
    }
    let mut engine = LocalEngine::with_docker(cfg)?;

    match cli.command {
        Commands::Play {
            file,
            kind,
            param,
            binary,
        } => {
            let action = load_action(&file, &kind, binary)?;
            let overrides = param_pairs(&param)?;
            let result = engine.run(&action, &Map::new(), &overrides).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Debug {
            file,
            kind,
            param,
            binary,
        } => {
            let action = load_action(&file, &kind, binary)?;
            let overrides = param_pairs(&param)?;
            let result = engine.debug(&action, &Map::new(), &overrides).await?;
            if let Some(id) = &result.frontend_id {
                println!("inspector session: {id}");
            }
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Init { kind } => {
            engine.ensure(&RuntimeKind::new(kind)).await?;
            println!("container ready");
        }
        Commands::Kill => {
            engine.kill().await?;
            println!("container removed");
        }
    }
    Ok(())
}

fn load_action(file: &PathBuf, kind: &str, binary: bool) -> Result<ActionDescriptor> {
    let name = file
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "action".to_string());
    let code = if binary {
        let bytes =
            std::fs::read(file).with_context(|| format!("reading archive '{}'", file.display()))?;
        BASE64.encode(bytes)
    } else {
        std::fs::read_to_string(file)
            .with_context(|| format!("reading source file '{}'", file.display()))?
    };
    Ok(ActionDescriptor {
        name,
        code,
        kind: RuntimeKind::new(kind),
        parameters: Map::new(),
        binary,
    })
}

fn param_pairs(pairs: &[String]) -> Result<Map<String, Value>> {
    let mut map = Map::new();
    for pair in pairs.chunks(2) {
        match pair {
            [name, value] => {
                // Values that parse as JSON are passed through structurally;
                // everything else is a plain string.
                let parsed = serde_json::from_str::<Value>(value)
                    .unwrap_or_else(|_| Value::String(value.clone()));
                map.insert(name.clone(), parsed);
            }
            _ => anyhow::bail!("-p expects a name and a value"),
        }
    }
    Ok(map)
}
