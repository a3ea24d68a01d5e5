// src/cli.rs
use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info};

use crate::config::ClientConfig;
use crate::core::{PaymentBackend, ServiceClient};
use crate::gate::{decide_action, RouteDecision};
use crate::payment::{CheckoutProcessor, CheckoutState, HostedCheckout, MemoryLocation};
use crate::types::User;
use crate::utils::mask_token;
use crate::PremiumApp;

#[derive(Parser)]
#[command(name = "jobportal-premium")]
#[command(about = "Premium entitlement and checkout for the job portal")]
pub struct PremiumCli {
    #[command(subcommand)]
    pub command: PremiumCommand,

    /// Directory holding the session, pending order and log file
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    /// Backend base URL, e.g. http://localhost:8080/api
    #[arg(long, global = true)]
    pub api_url: Option<String>,
}

#[derive(Subcommand)]
pub enum PremiumCommand {
    /// Adopt a session obtained from the login page
    Login {
        #[arg(long)]
        token: String,
        #[arg(long)]
        user_id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        email: Option<String>,
    },
    /// Show session, entitlement and checkout state
    Status,
    /// Evaluate a route or an in-page action
    Gate {
        #[command(subcommand)]
        target: GateTarget,
    },
    /// Create an order and hand it to the hosted checkout
    Checkout {
        /// Amount in minor units; defaults to the configured premium price
        #[arg(long)]
        amount: Option<u64>,
    },
    /// Load the application at URL, as when returning from the processor
    Resume {
        #[arg(long)]
        url: String,
    },
    /// End the session
    Logout,
}

#[derive(Subcommand)]
pub enum GateTarget {
    Route { path: String },
    Action { feature: String },
}

impl PremiumCli {
    /// Command line overrides on top of loaded configuration.
    pub fn apply_overrides(&self, mut config: ClientConfig) -> ClientConfig {
        if let Some(dir) = &self.state_dir {
            config = config.with_state_dir(dir.clone());
        }
        if let Some(url) = &self.api_url {
            config = config.with_api_base_url(url);
        }
        config
    }
}

pub async fn handle_premium_command(cli: PremiumCli, config: ClientConfig) -> Result<()> {
    let app = PremiumApp::<ServiceClient, HostedCheckout>::from_config(&config)?;

    let start_url = match &cli.command {
        PremiumCommand::Resume { url } => url.clone(),
        _ => config.return_url.clone(),
    };
    let location = MemoryLocation::parse(&start_url)?;
    let snapshot = app.start(&location).await;
    info!(
        authenticated = snapshot.authenticated,
        entitled = snapshot.entitled,
        "Application started"
    );

    match cli.command {
        PremiumCommand::Login {
            token,
            user_id,
            name,
            email,
        } => {
            let mut user = User::new(user_id.as_str());
            if let Some(name) = name {
                user = user.with_name(name);
            }
            if let Some(email) = email {
                user = user.with_email(email);
            }
            app.store.establish_session(&token, user)?;
            match app.store.refresh_profile().await {
                Ok(snapshot) => println!(
                    "✅ Logged in as {} (premium: {})",
                    user_id, snapshot.entitled
                ),
                Err(e) => println!(
                    "✅ Logged in as {} (profile not confirmed: {})",
                    user_id, e
                ),
            }
        }

        PremiumCommand::Status => print_status(&app)?,

        PremiumCommand::Gate { target } => match target {
            GateTarget::Route { path } => {
                let decision = app.guard.enter(&path).await;
                match decision {
                    RouteDecision::Render => println!("{}: render", path),
                    other => println!(
                        "{}: {} -> {}",
                        path,
                        other,
                        other.redirect_target().unwrap_or("/")
                    ),
                }
            }
            GateTarget::Action { feature } => {
                let decision = decide_action(&feature, &app.store.snapshot());
                println!("{}: {}", feature, decision);
            }
        },

        PremiumCommand::Checkout { amount } => {
            let user_id = app
                .store
                .current_user_id()
                .ok_or_else(|| anyhow!("Not logged in, run `login` first"))?;
            let amount = amount.unwrap_or(config.default_amount);

            match app.coordinator.start_checkout(&user_id, amount).await {
                Ok(CheckoutState::HandedOff { order_id, .. }) => {
                    let processor = app.coordinator.processor();
                    let url = processor.take_last_redirect().unwrap_or_default();
                    println!("🧾 Order {} created", order_id);
                    println!("   Open to pay: {}", url);
                    println!(
                        "   Then run: jobportal-premium resume --url '{}'",
                        crate::utils::with_order_id(&config.return_url, &order_id)
                            .unwrap_or_else(|| config.return_url.clone())
                    );
                }
                Ok(state) => println!("Checkout state: {}", state.label()),
                Err(e) => {
                    error!(%user_id, error = %e, "Checkout failed");
                    if let Some(message) = e.kind().message() {
                        println!("❌ {}", message);
                    }
                }
            }
        }

        PremiumCommand::Resume { .. } => {
            let state = app.coordinator.state();
            match state.failure() {
                Some(kind) => println!(
                    "❌ {}",
                    kind.message().unwrap_or("Checkout was not completed")
                ),
                None => println!("Checkout state: {}", state.label()),
            }
            print_status(&app)?;
        }

        PremiumCommand::Logout => {
            app.store.logout();
            println!("✅ Logged out");
        }
    }

    Ok(())
}

fn print_status<B: PaymentBackend, P: CheckoutProcessor>(app: &PremiumApp<B, P>) -> Result<()> {
    let snapshot = app.store.snapshot();
    let token = app.store.token().map(|t| mask_token(&t));
    let status = serde_json::json!({
        "token": token,
        "user": app.store.user(),
        "entitlement": snapshot,
        "checkout": app.coordinator.state(),
        "pendingOrder": app.coordinator.pending_order(),
    });
    let rendered = serde_json::to_string_pretty(&status).context("Failed to render status")?;
    println!("{}", rendered);
    Ok(())
}
