//! toolforge - Entry Point
//!
//! Startup order matters: the process refuses to run without its durable
//! store, capabilities load before the first turn, and the heartbeat starts
//! alongside the chat transport. Exit code 42 asks the external supervisor
//! for a relaunch.

use std::sync::Arc;

use toolforge::{
    agent::{Agent, Heartbeat},
    builtin_tools,
    capability::{CapabilityRegistry, Validator},
    config::Config,
    engine::ScriptEngine,
    llm::OpenAiCompatClient,
    restart::{RestartSignal, RESTART_EXIT_CODE},
    server,
    store::Store,
    tools::CatalogBuilder,
    BUILTIN_TOOL_NAMES,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("toolforge=info,tower_http=info")),
        )
        .init();

    let config = Config::from_env()?;
    info!("Starting toolforge (model: {})", config.llm_model);

    // Store connectivity is fatal at startup; everything after it degrades
    // gracefully instead
    let store = Arc::new(Store::open(&config.database_path)?);

    let engine = Arc::new(ScriptEngine::new());
    let registry = Arc::new(CapabilityRegistry::new(
        Arc::clone(&store),
        Arc::clone(&engine),
    ));
    let report = registry.load_all().await?;
    for (name, error) in &report.failures {
        warn!("Capability '{}' failed to load: {}", name, error);
    }
    info!("Loaded {} capabilities", report.loaded);

    let validator = Arc::new(Validator::new(
        Arc::clone(&store),
        Arc::clone(&engine),
        Arc::clone(&registry),
        config.capabilities_dir.clone(),
        BUILTIN_TOOL_NAMES.iter().map(|s| s.to_string()).collect(),
    ));

    let restart = RestartSignal::new();
    let builtins = builtin_tools(
        Arc::clone(&store),
        validator,
        Arc::clone(&registry),
        Arc::clone(&restart),
    );
    let catalogs = Arc::new(CatalogBuilder::new(builtins, registry, engine));

    let model = Arc::new(OpenAiCompatClient::from_config(&config));
    let agent = Arc::new(Agent::new(
        Arc::clone(&store),
        model,
        catalogs,
        config.max_conversation_history,
        config.max_tool_iterations,
    ));

    let heartbeat = Heartbeat::new(
        Arc::clone(&agent),
        Arc::clone(&store),
        config.heartbeat_interval,
    );
    tokio::spawn(heartbeat.run());

    let server_task = tokio::spawn(server::serve(config.http_addr, agent, store));

    tokio::select! {
        _ = restart.wait() => {
            info!("Restart requested; exiting with code {}", RESTART_EXIT_CODE);
            std::process::exit(RESTART_EXIT_CODE);
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
        result = server_task => {
            result??;
        }
    }

    Ok(())
}
