//! Transfer SAGA demo binary
//!
//! ```text
//! ┌──────────┐    ┌──────────────┐    ┌──────────┐    ┌──────────┐
//! │  Config  │───▶│ Orchestrator │───▶│  Ledger  │    │ Journal  │
//! │  (YAML)  │    │ (SAGA + CAS) │───▶│ (locks)  │    │ (fsync)  │
//! └──────────┘    └──────────────┘    └──────────┘    └──────────┘
//! ```
//!
//! Usage:
//!
//! ```text
//! transfer_saga --env dev --from acc-a --to acc-b --amount 300 --currency EUR [--key k1] [--serve]
//! ```

use anyhow::{Context, bail};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::info;

use transfer_saga::config::AppConfig;
use transfer_saga::logging::init_logging;
use transfer_saga::money::{Currency, parse_amount};
use transfer_saga::transfer::{
    AccountId, AccountStatus, InMemoryIdempotencyStore, InMemoryLedger, InMemoryStateStore,
    JournalStateStore, RecoveryWorker, StateStore, TracingEventPublisher, TransferOrchestrator,
    TransferRequest,
};

// ============================================================
// ARGUMENTS
// ============================================================

fn get_arg(name: &str) -> Option<String> {
    let args: Vec<String> = std::env::args().collect();
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1).cloned())
}

fn has_flag(name: &str) -> bool {
    std::env::args().any(|a| a == name)
}

fn seed_ledger(config: &AppConfig) -> anyhow::Result<InMemoryLedger> {
    let ledger = InMemoryLedger::new();
    for seed in &config.seed_accounts {
        let currency = Currency::new(&seed.currency)
            .with_context(|| format!("seed account {}", seed.id))?;
        let status = if seed.frozen {
            AccountStatus::Frozen
        } else {
            AccountStatus::Active
        };
        ledger.open_account(AccountId::new(seed.id.clone()), seed.balance, currency, status);
    }
    Ok(ledger)
}

fn request_from_args(config: &AppConfig) -> anyhow::Result<Option<TransferRequest>> {
    let (Some(from), Some(to), Some(amount)) =
        (get_arg("--from"), get_arg("--to"), get_arg("--amount"))
    else {
        return Ok(None);
    };
    let amount = parse_amount(&amount, config.saga.max_amount_scale)?;
    let currency = Currency::new(&get_arg("--currency").unwrap_or_else(|| "EUR".to_string()))?;
    let key = get_arg("--key").unwrap_or_else(|| ulid::Ulid::new().to_string());
    Ok(Some(TransferRequest::new(
        key,
        AccountId::new(from),
        AccountId::new(to),
        amount,
        currency,
    )))
}

// ============================================================
// MAIN
// ============================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_arg("--env").unwrap_or_else(|| "dev".to_string());
    let config = AppConfig::load(&env)?;
    let _guard = init_logging(&config);

    info!(env = %env, "Starting transfer saga");

    let store: Arc<dyn StateStore> = if config.journal.enabled {
        let journal = JournalStateStore::open(&config.journal.path)
            .with_context(|| format!("Failed to open journal {}", config.journal.path))?;
        Arc::new(journal)
    } else {
        Arc::new(InMemoryStateStore::new())
    };

    let ledger = Arc::new(seed_ledger(&config)?);
    let orchestrator = Arc::new(TransferOrchestrator::new(
        store,
        ledger.clone(),
        Arc::new(InMemoryIdempotencyStore::new()),
        Arc::new(TracingEventPublisher),
        config.saga.clone(),
    ));

    // Keys outlive the process only through the transfers they point at
    orchestrator.restore_idempotency().await?;

    // Startup sweep before accepting new transfers
    let worker = RecoveryWorker::new(orchestrator.clone(), config.worker.clone());
    let recovered = worker.recover_all().await?;
    info!(count = recovered, "Startup recovery finished");

    if config.worker.enabled {
        tokio::spawn(async move {
            worker.run().await;
        });
    }

    if let Some(req) = request_from_args(&config)? {
        let source = req.source.clone();
        let destination = req.destination.clone();
        match orchestrator.initiate(req).await {
            Ok(result) => {
                println!("transfer_ref: {}", result.transfer_ref);
                println!("status:       {}", result.status);
                if let Some(reason) = &result.failure_reason {
                    println!("reason:       {}", reason);
                }
                for account in [&source, &destination] {
                    let balance = ledger.balance(account).unwrap_or(Decimal::ZERO);
                    println!("balance[{}]: {}", account, balance);
                }
            }
            Err(e) => bail!("[{}] {}", e.code(), e),
        }
    }

    if has_flag("--serve") {
        info!("Recovery worker running, press Ctrl-C to stop");
        tokio::signal::ctrl_c().await?;
    }

    Ok(())
}
