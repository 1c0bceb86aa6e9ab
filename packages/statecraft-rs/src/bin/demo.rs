use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use statecraft::app::{
    app_registry, greeting_epic, init_epic, AppAction, AppState, GreetingState,
    StaticGreetingSource, APP_SLICE, GREETING_SLICE,
};
use statecraft::{StoreBuilder, StoreConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,statecraft=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true),
        )
        .init();

    let config = StoreConfig::from_env().context("Failed to load store config")?;
    tracing::info!(?config, "Starting statecraft demo");

    let stage = std::env::var("STAGE").unwrap_or_else(|_| "dev".to_string());
    let store = StoreBuilder::new()
        .with_registry(app_registry())
        .with_config(config)
        .with_named_epic("init", init_epic)
        .with_named_epic(
            "greeting",
            greeting_epic(Arc::new(StaticGreetingSource::new(stage))),
        )
        .build()
        .context("Failed to build store")?;

    let mut settled = store
        .action_stream()
        .filter(|action| {
            futures::future::ready(matches!(
                action,
                AppAction::GreetingLoaded(_) | AppAction::GreetingFailed(_)
            ))
        });

    store.dispatch(AppAction::AppInit)?;
    store.dispatch(AppAction::AppLoading(true))?;
    store.dispatch(AppAction::GreetingRequested)?;

    tokio::time::timeout(Duration::from_secs(5), settled.next())
        .await
        .context("Timed out waiting for greeting")?;

    let state = store.state();
    let snapshot = serde_json::json!({
        APP_SLICE: state.slice::<AppState>(APP_SLICE),
        GREETING_SLICE: state.slice::<GreetingState>(GREETING_SLICE),
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&snapshot).context("Failed to serialize state")?
    );

    for (epic, status) in store.epic_statuses() {
        tracing::info!(epic, ?status, "epic status");
    }

    store.teardown();
    Ok(())
}
