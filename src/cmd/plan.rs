//! Plan display, execution, rollback, and completion commands.

use anyhow::Result;
use console::style;
use std::sync::Arc;
use std::time::Duration;

use anvil::config::AnvilConfig;
use anvil::engine::Engine;
use anvil::executors::ExecutorRegistry;
use anvil::plan::{format_plan, resolve_plan};
use anvil::store::ClusterOperator;
use anvil::updater::{Updater, WHOLE_PLAN};

use super::{interrupt_token, operation_key, operator, runner};

pub async fn cmd_display(config: &AnvilConfig, operation_id: Option<&str>) -> Result<()> {
    let store = operator(config);
    let key = operation_key(&store, config, operation_id).await?;

    let plan = store.get_operation_plan(&key).await?;
    let changelog = store.get_plan_changelog(&key).await?;
    let resolved = resolve_plan(&plan, &changelog);

    println!();
    println!("{}", style(format!("Operation {key}")).bold());
    print!("{}", format_plan(&resolved));
    println!();
    Ok(())
}

fn updater(config: &AnvilConfig, key: anvil::plan::OperationKey) -> Updater {
    let store = operator(config);
    let registry = Arc::new(ExecutorRegistry::with_defaults(
        store.clone() as Arc<dyn ClusterOperator>
    ));
    Updater::new(key, store, runner(config), registry)
        .with_retry(config.retry_policy())
        .with_complete_retries(config.updater.complete_retries)
        .with_follow_config(config.follow_config())
}

pub async fn cmd_execute(
    config: &AnvilConfig,
    phase: &str,
    force: bool,
    operation_id: Option<&str>,
    timeout_secs: Option<u64>,
) -> Result<()> {
    let store = operator(config);
    let key = operation_key(&store, config, operation_id).await?;
    let updater = updater(config, key.clone());
    let cancel = interrupt_token();

    if phase == WHOLE_PLAN {
        updater.run(&cancel).await?;
        println!("{}", style(format!("operation {} completed", key.operation_id)).green());
    } else {
        let timeout = timeout_secs.map(Duration::from_secs);
        updater.run_phase(&cancel, phase, timeout, force).await?;
        println!("{}", style(format!("phase {phase} completed")).green());
    }
    Ok(())
}

pub async fn cmd_rollback(
    config: &AnvilConfig,
    phase: &str,
    force: bool,
    dry_run: bool,
    operation_id: Option<&str>,
    timeout_secs: Option<u64>,
) -> Result<()> {
    let store = operator(config);
    let key = operation_key(&store, config, operation_id).await?;
    let cancel = interrupt_token();

    if dry_run {
        let registry = Arc::new(ExecutorRegistry::with_defaults(
            store.clone() as Arc<dyn ClusterOperator>
        ));
        let engine = Engine::new(key, store, registry, runner(config))
            .with_retry(config.retry_policy());
        let targets = engine.rollback_plan(&cancel, force, true).await?;
        if targets.is_empty() {
            println!("nothing to roll back");
        } else {
            println!("would roll back, in order:");
            for phase_id in targets {
                println!("  {phase_id}");
            }
        }
        return Ok(());
    }

    let updater = updater(config, key);
    let timeout = timeout_secs.map(Duration::from_secs);
    updater.rollback_phase(&cancel, phase, timeout, force).await?;
    println!("{}", style(format!("rolled back {phase}")).green());
    Ok(())
}

pub async fn cmd_complete(config: &AnvilConfig, operation_id: Option<&str>) -> Result<()> {
    let store = operator(config);
    let key = operation_key(&store, config, operation_id).await?;
    let updater = updater(config, key.clone());
    let cancel = interrupt_token();

    updater.complete(&cancel, Ok(())).await?;
    println!(
        "{}",
        style(format!("operation {} marked complete", key.operation_id)).green()
    );
    Ok(())
}
