use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use std::path::PathBuf;
use std::sync::Arc;

use crate::blockchain::{Ledger, ProofOfWork, Store, Transaction};
use crate::wallet::{self, Wallets};

/// A minimal single-node UTXO cryptocurrency ledger
#[derive(Parser)]
#[command(name = "ferrocoin", version, about)]
pub struct Cli {
    /// Directory holding the ledger database
    #[arg(long, default_value = "ferrocoin_db")]
    pub data_dir: PathBuf,

    /// Path of the wallet collection file
    #[arg(long, default_value = "wallets.json")]
    pub wallet_file: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create a new ledger and send the genesis reward to an address
    CreateChain {
        #[arg(long)]
        address: String,
    },

    /// Create a new wallet and print its address
    NewWallet,

    /// List every wallet address with its balance
    ListWallets,

    /// Print the balance of an address
    Balance {
        #[arg(long)]
        address: String,
    },

    /// Send coins from one address to another, mining a new block
    Send {
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        #[arg(long)]
        amount: i64,
    },

    /// Print every block from the tip back to genesis
    PrintChain,

    /// Rebuild the unspent-output index from the chain
    Reindex,
}

pub fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::CreateChain { address } => {
            if !wallet::validate_address(&address) {
                bail!("invalid address: {}", address);
            }

            let store = Arc::new(Store::open(&cli.data_dir)?);
            let ledger = Ledger::create(store, &address)?;
            println!(
                "Created ledger; genesis reward sent to {} (tip {})",
                address,
                hex::encode(ledger.tip())
            );
        }

        Command::NewWallet => {
            let mut wallets = Wallets::open(&cli.wallet_file)?;
            let address = wallets.create()?;
            wallets.save(&cli.wallet_file)?;
            println!("New wallet created. Address: {}", address);
        }

        Command::ListWallets => {
            let wallets = Wallets::open(&cli.wallet_file)?;
            let store = Arc::new(Store::open(&cli.data_dir)?);
            let ledger = Ledger::open(store).context("open the ledger")?;

            println!("Wallet addresses:");
            for address in wallets.addresses() {
                let balance = ledger.get_balance(&address)?;
                println!("{} {}", address, balance);
            }
        }

        Command::Balance { address } => {
            if !wallet::validate_address(&address) {
                bail!("invalid address: {}", address);
            }

            let store = Arc::new(Store::open(&cli.data_dir)?);
            let ledger = Ledger::open(store).context("open the ledger")?;
            println!("Balance of '{}': {}", address, ledger.get_balance(&address)?);
        }

        Command::Send { from, to, amount } => {
            if amount <= 0 {
                bail!("invalid amount: {}", amount);
            }
            if !wallet::validate_address(&from) {
                bail!("invalid sender address: {}", from);
            }
            if !wallet::validate_address(&to) {
                bail!("invalid recipient address: {}", to);
            }

            let store = Arc::new(Store::open(&cli.data_dir)?);
            let mut ledger = Ledger::open(store).context("open the ledger")?;
            let wallets = Wallets::open(&cli.wallet_file)?;

            let payment = ledger.new_transaction(&wallets, &from, &to, amount as u64)?;
            // The sender mines the block and collects the reward
            let reward = Transaction::new_coinbase(&from, b"")?;
            let block = ledger.mine_block(vec![reward, payment])?;

            println!(
                "Sent {} to {} in block {}.",
                amount,
                to,
                hex::encode(&block.hash)
            );
        }

        Command::PrintChain => {
            let store = Arc::new(Store::open(&cli.data_dir)?);
            let ledger = Ledger::open(store).context("open the ledger")?;

            let mut iter = ledger.iterator();
            while let Some(block) = iter.next_block()? {
                println!("{}", block);
                println!("pow valid: {}", ProofOfWork::new(&block).is_valid());
                println!();
            }
        }

        Command::Reindex => {
            let store = Arc::new(Store::open(&cli.data_dir)?);
            let ledger = Ledger::open(store).context("open the ledger")?;

            if ledger.check_utxo_consistency().is_err() {
                println!("utxo index had diverged from the chain");
            }
            let count = ledger.reindex_utxos()?;
            println!(
                "Reindex complete: {} transactions with unspent outputs.",
                count
            );
        }
    }

    Ok(())
}
