use anyhow::{bail, Context, Result};
use invoice_numbering::{AllocateError, AllocatedNumber, InvoiceNumberAllocator, SettingsStore};
use serde::Deserialize;
use std::{collections::HashMap, num::NonZeroUsize, time::Instant};
use tokio::task::JoinSet;
use tracing::debug;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    pub account_count: usize,
    pub task_count: NonZeroUsize,
    pub allocation_count: usize,
    #[serde(default)]
    pub allocator: invoice_numbering::Config,
}

/// Allocate invoice numbers for a couple of accounts from a lot of concurrent tasks and verify
/// that the consumed counter values per account are distinct and gapless.
pub async fn run<S>(config: Config, store: S) -> Result<()>
where
    S: SettingsStore<Id = String>,
{
    let allocator = InvoiceNumberAllocator::new(store, config.allocator)
        .context("create invoice number allocator")?;
    let ids = (0..config.account_count)
        .map(|n| format!("account-{n}"))
        .collect::<Vec<_>>();

    println!(
        "Allocating {} invoice numbers for each of {} accounts from {} tasks each ...",
        config.allocation_count, config.account_count, config.task_count
    );
    let mut tasks = JoinSet::new();
    let start_time = Instant::now();
    for id in &ids {
        for task in 0..config.task_count.get() {
            let allocator = allocator.clone();
            let id = id.clone();
            let count = allocations_for_task(config.allocation_count, config.task_count, task);

            tasks.spawn(async move {
                let mut numbers = Vec::with_capacity(count);
                for _ in 0..count {
                    let number = allocate(&allocator, &id).await?;
                    numbers.push(number);
                }
                Ok::<_, anyhow::Error>((id, numbers))
            });
        }
    }

    let mut numbers_by_id = HashMap::<String, Vec<AllocatedNumber>>::new();
    while let Some(result) = tasks.join_next().await {
        let (id, numbers) = result.context("join allocation task")??;
        numbers_by_id.entry(id).or_default().extend(numbers);
    }
    let end_time = Instant::now();
    println!(
        "Duration for allocating {} invoice numbers for each of {} accounts: {:?}",
        config.allocation_count,
        config.account_count,
        end_time - start_time
    );

    for (id, numbers) in numbers_by_id {
        verify(&id, numbers, config.allocation_count)?;
    }
    println!("All invoice numbers are distinct and gapless");

    Ok(())
}

/// Allocate, retrying on contention which is expected with many concurrent tasks per account.
async fn allocate<S>(allocator: &InvoiceNumberAllocator<S>, id: &S::Id) -> Result<AllocatedNumber>
where
    S: SettingsStore,
{
    loop {
        match allocator.allocate(id).await {
            Ok(number) => break Ok(number),

            Err(AllocateError::AllocationContention { attempts }) => {
                debug!(%id, attempts, "contention, allocating again");
            }

            Err(error) => break Err(error).context("allocate invoice number"),
        }
    }
}

fn allocations_for_task(allocation_count: usize, task_count: NonZeroUsize, task: usize) -> usize {
    let task_count = task_count.get();
    let base = allocation_count / task_count;
    if task < allocation_count % task_count {
        base + 1
    } else {
        base
    }
}

fn verify(id: &str, numbers: Vec<AllocatedNumber>, allocation_count: usize) -> Result<()> {
    if numbers.len() != allocation_count {
        bail!(
            "expected {allocation_count} invoice numbers for {id}, but got {}",
            numbers.len()
        );
    }

    let mut consumed = numbers
        .iter()
        .map(|number| number.consumed)
        .collect::<Vec<_>>();
    consumed.sort_unstable();
    for pair in consumed.windows(2) {
        if pair[1] != pair[0] + 1 {
            bail!(
                "invoice numbers for {id} not gapless and distinct: {} followed by {}",
                pair[0],
                pair[1]
            );
        }
    }

    Ok(())
}
