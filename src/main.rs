use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use rust_decimal::Decimal;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::wrappers::BroadcastStream;

use rent_vs_buy_vault::config::VaultConfig;
use rent_vs_buy_vault::connectivity::{self, ConnectivityStatus};
use rent_vs_buy_vault::document::Document;
use rent_vs_buy_vault::funnel::{FunnelController, FunnelView, LeadSubmission};
use rent_vs_buy_vault::service::{HttpServiceClient, ServiceClient};

const PROBE_INTERVAL: Duration = Duration::from_secs(30);

const HELP: &str = "\
Commands:
  upload <path>    Upload a salary slip (PNG, JPEG or PDF)
  analyze [rent]   Run the rent vs buy analysis (optional annual rent)
  chat             Ask the advisor to explain your situation
  offer            Check pre-approval
  dismiss          Close the pre-approval offer
  submit           Submit details for the pre-approval certificate
  status           Show the current session
  quit             Exit";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = VaultConfig::from_env()?;
    let client: Arc<dyn ServiceClient> = Arc::new(HttpServiceClient::from_config(&config)?);
    let funnel = FunnelController::new(Arc::clone(&client), config.policy);

    eprintln!("🏠 Rent vs Buy Vault v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Service: {}", config.service_url);
    eprintln!(
        "   Defaults: income {} / rent {}",
        config.policy.default_monthly_income, config.policy.default_annual_rent
    );
    eprintln!("   Type 'help' for commands.\n");

    let (connectivity, _probe_handle) = connectivity::spawn_probe_task(client, PROBE_INTERVAL);

    // Surface late failures (background lead submission) as they arrive.
    let mut views = BroadcastStream::new(funnel.subscribe());
    tokio::spawn(async move {
        let mut last_error: Option<String> = None;
        while let Some(item) = views.next().await {
            let Ok(view) = item else { continue };
            if view.last_error != last_error {
                if let Some(ref err) = view.last_error {
                    eprintln!("❌ {err}");
                }
                last_error = view.last_error;
            }
        }
    });

    let mut pending_leads: Vec<LeadSubmission> = Vec::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    eprint!("> ");
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        let (command, arg) = match line.split_once(char::is_whitespace) {
            Some((c, a)) => (c, Some(a.trim())),
            None => (line, None),
        };

        match command {
            "" => {}
            "help" => println!("{HELP}"),
            "quit" | "exit" => break,
            "upload" => match arg {
                Some(path) => upload(&funnel, Path::new(path), config.max_upload_bytes()).await,
                None => eprintln!("usage: upload <path>"),
            },
            "analyze" => {
                let rent = match arg.map(Decimal::from_str).transpose() {
                    Ok(rent) => rent,
                    Err(e) => {
                        eprintln!("invalid rent: {e}");
                        eprint!("> ");
                        continue;
                    }
                };
                match funnel.run_analysis_with_rent(rent).await {
                    Ok(_) => render(&funnel.view().await),
                    Err(e) => eprintln!("❌ {e}"),
                }
            }
            "chat" => match funnel.send_chat_turn().await {
                Ok(_) => {
                    if let Some(message) = funnel.view().await.transcript.last() {
                        println!("\n💬 {}\n", message.content);
                    }
                }
                Err(e) => eprintln!("❌ {e}"),
            },
            "offer" => {
                funnel.open_pre_approval().await;
                if funnel.view().await.facets.pre_approval_open {
                    println!("\nPre-Approval");
                    println!("Based on your financial profile, you are eligible for a home loan.");
                    println!("Would you like us to generate your pre-approval certificate?");
                    println!("(type 'submit' to submit details, 'dismiss' to close)\n");
                }
            }
            "dismiss" => {
                funnel.dismiss_pre_approval().await;
            }
            "submit" => match funnel.capture_lead().await {
                Some(submission) => {
                    println!("✅ Details submitted. We'll be in touch with your certificate.");
                    pending_leads.push(submission);
                }
                None => eprintln!("Open the pre-approval offer first ('offer')."),
            },
            "status" => {
                println!("Status: {}", *connectivity.borrow());
                render(&funnel.view().await);
            }
            other => {
                eprintln!("unknown command '{other}'");
                let allowed = funnel.allowed_intents().await;
                eprintln!("available now: {allowed:?}");
            }
        }
        eprint!("> ");
    }

    for submission in pending_leads {
        if let Err(e) = submission.outcome().await {
            tracing::warn!(error = %e, "Lead submission did not complete");
        }
    }

    if *connectivity.borrow() == ConnectivityStatus::Unreachable {
        eprintln!("(backend was not reachable at exit)");
    }
    Ok(())
}

async fn upload(funnel: &FunnelController, path: &Path, max_bytes: usize) {
    let document = match Document::from_path(path, max_bytes).await {
        Ok(doc) => doc,
        Err(e) => {
            eprintln!("❌ {e}");
            return;
        }
    };
    eprintln!("⏳ Extracting salary data…");
    match funnel.submit_document(&document).await {
        Ok(_) => render(&funnel.view().await),
        Err(e) => eprintln!("❌ {e}"),
    }
}

fn render(view: &FunnelView) {
    println!("\nState: {}", view.state);
    if let Some(ref extraction) = view.extraction {
        println!("Extracted salary data:");
        println!(
            "{}",
            serde_json::to_string_pretty(extraction).unwrap_or_default()
        );
    }
    if let Some(ref analysis) = view.analysis {
        println!("Financial analysis:");
        println!("{}", serde_json::to_string_pretty(analysis).unwrap_or_default());
    }
    for message in &view.transcript {
        println!("💬 {}", message.content);
    }
    let allowed: Vec<String> = view.allowed.iter().map(|i| i.to_string()).collect();
    println!("Next: {}\n", allowed.join(", "));
}
