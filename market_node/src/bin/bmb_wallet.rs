//! Wallet helper for the marketplace: pays escrow before placing an order,
//! checks a payment, and mints development session tokens.

use anyhow::{Context, Result};
use bmb_node::config::NodeConfig;
use bmb_node::payment::{checkout, ChainVerifier, Erc20Relay, PaymentOutcome, PaymentVerifier};
use bmb_node::policy::SessionValidator;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Environment variable holding the payer's private key
const PAYER_KEY_VAR: &str = "BMB_PAYER_PRIVATE_KEY";

#[derive(Parser)]
#[command(name = "bmb-wallet", version, about = "Escrow payments for Buy My Behavior orders")]
struct Cli {
    /// Node configuration with the payment section
    #[arg(long, default_value = "config/node.yaml")]
    config_path: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Transfer the order price into escrow and print the outcome
    Pay {
        /// Price in whole tokens, e.g. 12.5
        price: Decimal,
    },
    /// Check that a transaction paid the escrow
    Verify {
        tx_hash: String,
        amount: Decimal,
    },
    /// Sign a session token for local testing
    Token {
        /// User id; a fresh one when omitted
        #[arg(long)]
        user: Option<Uuid>,
        #[arg(long)]
        email: Option<String>,
    },
}

fn required<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str> {
    value
        .as_deref()
        .with_context(|| format!("payment.{name} is not configured"))
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    let config = NodeConfig::load(Some(&cli.config_path))?;
    let payment = &config.payment;

    match cli.command {
        Commands::Pay { price } => {
            let key = std::env::var(PAYER_KEY_VAR)
                .with_context(|| format!("{PAYER_KEY_VAR} must hold the payer's private key"))?;
            let relay = Erc20Relay::connect(
                required(&payment.rpc_url, "rpc_url")?,
                &key,
                required(&payment.usdt_contract_address, "usdt_contract_address")?,
                payment.token_decimals,
                Duration::from_secs(payment.confirmation_timeout_secs),
            )
            .await?;
            let escrow = required(&payment.escrow_wallet_address, "escrow_wallet_address")?;

            let outcome = checkout(&relay, escrow, price).await;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            match outcome {
                PaymentOutcome::Aborted { reason } => anyhow::bail!("payment aborted: {reason}"),
                PaymentOutcome::Unconfirmed { tx_hash } => anyhow::bail!(
                    "transfer {tx_hash} is not confirmed yet; place the order once it is"
                ),
                PaymentOutcome::Free | PaymentOutcome::Paid { .. } => {}
            }
        }
        Commands::Verify { tx_hash, amount } => {
            let verifier = ChainVerifier::new(
                required(&payment.rpc_url, "rpc_url")?,
                required(&payment.usdt_contract_address, "usdt_contract_address")?,
                required(&payment.escrow_wallet_address, "escrow_wallet_address")?,
                payment.token_decimals,
            )?;
            let check = verifier.verify(&tx_hash, amount).await?;
            println!("{}", serde_json::to_string_pretty(&check)?);
        }
        Commands::Token { user, email } => {
            let sessions = SessionValidator::new(
                &config.auth.jwt_secret,
                &config.auth.audience,
                config.auth.token_ttl_secs,
            );
            let user = user.unwrap_or_else(Uuid::new_v4);
            let token = sessions.issue(user, email)?;
            println!("{user}\n{token}");
        }
    }
    Ok(())
}
