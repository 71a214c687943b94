use std::io::{BufRead, Write};
use std::sync::Arc;

use loanflow::config::{OrchestratorConfig, ProviderConfig};
use loanflow::orchestrator::Orchestrator;
use loanflow::provider::HttpProvider;
use loanflow::session::store::InMemorySessionStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let base_url = std::env::var("LOANFLOW_API_BASE_URL")
        .unwrap_or_else(|_| "https://api.staging.dspfin.com/los/api/v1".to_string());
    let channel_code = std::env::var("LOANFLOW_CHANNEL_CODE").unwrap_or_else(|_| {
        eprintln!("Error: LOANFLOW_CHANNEL_CODE not set");
        std::process::exit(1);
    });
    let secret_key = std::env::var("LOANFLOW_SECRET_KEY").unwrap_or_else(|_| {
        eprintln!("Error: LOANFLOW_SECRET_KEY not set");
        std::process::exit(1);
    });

    let provider_config = ProviderConfig::new(
        base_url.clone(),
        channel_code,
        secrecy::SecretString::from(secret_key),
    );
    let provider = Arc::new(HttpProvider::new(provider_config)?);
    let store = Arc::new(InMemorySessionStore::new());
    let orchestrator = Orchestrator::new(OrchestratorConfig::default(), provider, store);

    eprintln!("loanflow v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API: {base_url}");
    eprintln!("   Type a message and press Enter. /quit to exit.\n");

    let user_id = std::env::var("LOANFLOW_USER_ID").unwrap_or_else(|_| "local-user".to_string());
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    loop {
        print!("> ");
        stdout.flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }

        match orchestrator.handle_message(&user_id, line).await {
            Ok(response) => {
                println!("{}", response.message);
                tracing::debug!(step = %response.step, message_id = %response.message_id, "Turn complete");
            }
            Err(e) => eprintln!("error: {e}"),
        }
    }

    Ok(())
}
