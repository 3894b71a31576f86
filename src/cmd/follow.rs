//! Stream plan progress to the terminal.

use anyhow::Result;
use console::style;
use std::sync::Arc;

use anvil::config::AnvilConfig;
use anvil::follow::{PlanEvent, follow_operation_plan_with};
use anvil::store::{ClusterOperator, resolved_plan};

use super::{interrupt_token, operation_key, operator};

pub async fn cmd_follow(config: &AnvilConfig, operation_id: Option<&str>) -> Result<()> {
    let store = operator(config);
    let key = operation_key(&store, config, operation_id).await?;
    let cancel = interrupt_token();

    let get_store = store.clone() as Arc<dyn ClusterOperator>;
    let get_key = key.clone();
    let mut events = follow_operation_plan_with(config.follow_config(), cancel, move || {
        let store = get_store.clone();
        let key = get_key.clone();
        async move { resolved_plan(&store, &key).await }
    });

    while let Some(event) = events.recv().await {
        match event {
            PlanEvent::Changed { change } => {
                println!("phase {} is now {}", change.phase_id, change.new_state);
                if let Some(error) = change.error {
                    println!("  {}", style(error).red());
                }
            }
            PlanEvent::Completed => {
                println!("{}", style(format!("operation {} completed", key.operation_id)).green());
            }
            PlanEvent::RolledBack => {
                println!(
                    "{}",
                    style(format!("operation {} rolled back", key.operation_id)).yellow()
                );
            }
        }
    }
    Ok(())
}
