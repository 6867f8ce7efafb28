#![forbid(unsafe_code)]
use clap::{Parser, Subcommand};
use colored::*;
use qrledger::config::load_config;
use qrledger::contracts::ContractKind;
use qrledger::crypto::{generate_keypair_named, KeyPair};
use qrledger::transaction::{ContractCall, Params, Transaction};
use qrledger::{Ledger, MineOutcome};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Instant;

const DEMO_CONTRACT: &str = "demo-registry";

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the TOML configuration (defaults apply when absent)
    #[arg(long, default_value = "qrledger.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submits signed transfers and contract calls, then mines them
    Run {
        /// Number of blocks to mine
        #[arg(long, default_value_t = 3)]
        blocks: u64,
        /// Transfers submitted before each block
        #[arg(long, default_value_t = 2)]
        transfers: u64,
        /// Signature scheme for the demo accounts
        #[arg(long, default_value = "ed25519")]
        scheme: String,
    },
    /// Prints the effective configuration
    Config,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Run {
            blocks,
            transfers,
            scheme,
        } => run(&cli.config, *blocks, *transfers, scheme)?,
        Commands::Config => {
            let config = load_config(&cli.config)?;
            println!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn signed_transfer(from: &KeyPair, to: &KeyPair, amount: u64, nonce: u64, call: Option<ContractCall>) -> Result<Transaction, Box<dyn std::error::Error>> {
    let mut tx = Transaction::new(from.public.clone(), to.public.clone(), amount, nonce);
    if let Some(call) = call {
        tx = tx.with_contract_call(call);
    }
    tx.sign(&from.secret)?;
    Ok(tx)
}

fn run(config_path: &Path, blocks: u64, transfers: u64, scheme: &str) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(config_path)?;
    let ledger = Ledger::from_config(&config)?;

    println!("{}", "⛓️  QRLedger demo".bright_cyan().bold());
    println!("Consensus: {}", ledger.consensus().name().bright_yellow());
    println!("Genesis:   {}\n", ledger.last_block().hash_hex().dimmed());

    let alice = generate_keypair_named(scheme)?;
    let bob = generate_keypair_named(scheme)?;
    ledger.deploy_contract(DEMO_CONTRACT, alice.public.clone(), ContractKind::KeyValue)?;

    let mut nonce = 0;
    for round in 1..=blocks {
        for _ in 0..transfers {
            nonce += 1;
            ledger.submit_transaction(signed_transfer(&alice, &bob, 10, nonce, None)?)?;
        }

        let mut params = Params::new();
        params.insert("key".to_string(), json!(format!("round-{}", round)));
        params.insert("value".to_string(), json!(nonce));
        nonce += 1;
        let call = ContractCall::new(DEMO_CONTRACT, "set", params);
        ledger.submit_transaction(signed_transfer(&alice, &bob, 0, nonce, Some(call))?)?;

        let start = Instant::now();
        match ledger.mine()? {
            MineOutcome::Mined { index, hash } => println!(
                "{} block {} in {:.2?} → {}",
                "✅".green(),
                index.to_string().bright_white().bold(),
                start.elapsed(),
                hex::encode(hash).bright_green()
            ),
            MineOutcome::NothingToMine => println!("{}", "Nothing to mine".yellow()),
        }
    }

    println!("\n{}", "Chain".bright_cyan().bold());
    for block in ledger.blocks() {
        let forger = block.forger.as_deref().unwrap_or("-");
        println!(
            "  #{:<3} txs={:<3} nonce={:<8} forger={} hash={}",
            block.index,
            block.transactions.len(),
            block.nonce,
            forger,
            &block.hash_hex()[..16]
        );
    }

    if let Some(state) = ledger.contract_state(DEMO_CONTRACT) {
        println!("\n{}", "Contract state".bright_cyan().bold());
        for (key, value) in state {
            println!("  {} = {}", key.bright_yellow(), value);
        }
    }

    match ledger.validate_chain() {
        Ok(()) => println!("\n{}", "Chain is valid".green().bold()),
        Err(e) => println!("\n{} {}", "Chain is invalid:".red().bold(), e),
    }
    Ok(())
}
