use clap::Parser;
use tracing_subscriber::EnvFilter;

use etcd_warden::agent::{Agent, Verb};
use etcd_warden::config::AgentConfig;

#[derive(Parser, Debug)]
#[command(name = "etcd-warden")]
#[command(about = "Lifecycle agent that keeps a fixed-size etcd cluster available")]
struct Args {
    /// Operation to perform: save, replace, reconfigure, or check
    verb: String,
}

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    if let Err(e) = run(&args.verb).await {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}

async fn run(verb: &str) -> etcd_warden::error::Result<()> {
    let verb: Verb = verb.parse()?;
    let config = AgentConfig::from_env()?;

    tracing::info!(
        member = %config.member_name(),
        index = config.member_index,
        count = config.member_count,
        verb = ?verb,
        "Starting etcd-warden"
    );

    let agent = Agent::new(config);
    agent.run(verb).await
}
