use anyhow::Context;
use bridge_protocol::Message;
use bridge_protocol::transport::spawn_child;
use clap::{Args, Parser, Subcommand};
use schemars::schema_for;
use serde_json::Value;
use std::{env, path::PathBuf};
use tracing::info;
use workerbridge::{
    config::{BridgeConfig, ConfigManager, EnvConfigManager},
    logger::{LogLevel, init_tracing},
    registry::MethodTable,
    ui::{ClassRegistry, UiContext},
    worker::run_stdio,
};

#[derive(Parser, Debug)]
#[command(
    name = "workerbridge",
    about = "RPC and event bridge between a UI context and a worker context",
    version
)]
struct Cli {
    /// Env file layered under the process environment
    #[arg(long, global = true, default_value = ".env")]
    env_file: PathBuf,

    /// Optional log level override (trace, debug, info, warn, error, critical)
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the in-memory demo engine on stdin/stdout
    Worker,

    /// Spawn a worker, initialise its engine and issue one call
    Call(CallArgs),

    /// Emit the JSON-Schema of a wire frame
    Schema,
}

#[derive(Args, Debug)]
struct CallArgs {
    /// Handler group: controller, engine, sqlite, agent_provider, transaction_result
    target: String,

    /// Positional arguments; each is read as JSON, or taken as a plain string
    args: Vec<String>,

    /// JSON passed to `engine init`
    #[arg(long, default_value = "{}")]
    init: String,

    /// Worker binary to spawn. Default: this executable
    #[arg(long)]
    worker: Option<PathBuf>,
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let env = EnvConfigManager::new(cli.env_file.clone());
    let env_report = env.clone();
    let mut config = BridgeConfig::load(&ConfigManager(env)).await?;
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    init_tracing(&config.log_config())?;
    env_report.report();

    match cli.command {
        Commands::Worker => run_stdio(&config).await,
        Commands::Call(args) => call(&config, args).await,
        Commands::Schema => {
            let schema = schema_for!(Message);
            println!("{}", serde_json::to_string_pretty(&schema)?);
            Ok(())
        }
    }
}

/// Classes this CLI exposes to the worker it spawns.
fn cli_classes(config: &BridgeConfig) -> ClassRegistry {
    ClassRegistry::new()
        .with_class(
            config.utility_agent.clone(),
            MethodTable::new().with("logDebug", |args| async move {
                let args = Value::Array(args);
                info!(target: "worker", %args, "logDebug");
                Ok(Value::Null)
            }),
        )
        .with_class(
            "ApiClient",
            MethodTable::new().with("useOffchainEndPoint", |_args| async { Ok(Value::Bool(false)) }),
        )
}

fn parse_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_owned()))
}

async fn call(config: &BridgeConfig, args: CallArgs) -> anyhow::Result<()> {
    let init: Value = serde_json::from_str(&args.init).context("--init must be JSON")?;
    let program = match args.worker {
        Some(path) => path,
        None => env::current_exe().context("cannot locate this executable")?,
    };

    let (endpoint, mut child) = spawn_child(&program, ["worker"])
        .with_context(|| format!("could not start worker {}", program.display()))?;
    let (ui, _serving) = UiContext::connect(endpoint, cli_classes(config), config.bus_config("ui")).await?;
    ui.init_engine(vec![init]).await?;

    let params: Vec<Value> = args.args.iter().map(|raw| parse_arg(raw)).collect();
    let value = ui.bus().post_async(args.target, params).await?;
    println!("{}", serde_json::to_string_pretty(&value)?);

    child.kill().await.ok();
    Ok(())
}
