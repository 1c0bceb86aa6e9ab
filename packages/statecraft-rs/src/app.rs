//! Application slices and epics.
//!
//! Two slices:
//!
//! - `app`: lifecycle flags (`initialized`, `loading`)
//! - `greeting`: the result of asking a [`GreetingSource`] for a greeting
//!
//! Two epics:
//!
//! - [`init_epic`]: `APP_INIT` → `APP_LOADING(false)`
//! - [`GreetingEpic`]: `GREETING_REQUESTED` → `GREETING_LOADED` | `GREETING_FAILED`

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::action::Action;
use crate::bus::ActionStream;
use crate::epic::{Epic, EpicOutput, StateReader};
use crate::reducer::{ReducerRegistry, SliceReducer};

pub const APP_SLICE: &str = "app";
pub const GREETING_SLICE: &str = "greeting";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum AppAction {
    #[serde(rename = "APP_INIT")]
    AppInit,
    #[serde(rename = "APP_LOADING")]
    AppLoading(bool),
    #[serde(rename = "GREETING_REQUESTED")]
    GreetingRequested,
    #[serde(rename = "GREETING_LOADED")]
    GreetingLoaded(Greeting),
    #[serde(rename = "GREETING_FAILED")]
    GreetingFailed(String),
}

impl Action for AppAction {
    fn action_type(&self) -> &'static str {
        match self {
            AppAction::AppInit => "APP_INIT",
            AppAction::AppLoading(_) => "APP_LOADING",
            AppAction::GreetingRequested => "GREETING_REQUESTED",
            AppAction::GreetingLoaded(_) => "GREETING_LOADED",
            AppAction::GreetingFailed(_) => "GREETING_FAILED",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppState {
    pub initialized: bool,
    pub loading: bool,
}

pub struct AppReducer;

impl SliceReducer<AppAction> for AppReducer {
    type Slice = AppState;

    fn init(&self) -> AppState {
        AppState::default()
    }

    fn reduce(&self, state: Arc<AppState>, action: &AppAction) -> Arc<AppState> {
        match action {
            AppAction::AppInit => Arc::new(AppState {
                initialized: true,
                ..(*state).clone()
            }),
            AppAction::AppLoading(loading) => Arc::new(AppState {
                loading: *loading,
                ..(*state).clone()
            }),
            _ => state,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Greeting {
    pub message: String,
    pub stage: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GreetingState {
    pub loading: bool,
    pub greeting: Option<Greeting>,
    pub error: Option<String>,
}

pub struct GreetingReducer;

impl SliceReducer<AppAction> for GreetingReducer {
    type Slice = GreetingState;

    fn init(&self) -> GreetingState {
        GreetingState::default()
    }

    fn reduce(&self, state: Arc<GreetingState>, action: &AppAction) -> Arc<GreetingState> {
        match action {
            AppAction::GreetingRequested => Arc::new(GreetingState {
                loading: true,
                error: None,
                ..(*state).clone()
            }),
            AppAction::GreetingLoaded(greeting) => Arc::new(GreetingState {
                loading: false,
                greeting: Some(greeting.clone()),
                error: None,
            }),
            AppAction::GreetingFailed(error) => Arc::new(GreetingState {
                loading: false,
                error: Some(error.clone()),
                ..(*state).clone()
            }),
            _ => state,
        }
    }
}

/// The registry for every application slice.
pub fn app_registry() -> ReducerRegistry<AppAction> {
    ReducerRegistry::new()
        .with_slice(APP_SLICE, AppReducer)
        .with_slice(GREETING_SLICE, GreetingReducer)
}

/// Clears the loading flag once the app has initialized.
pub fn init_epic(actions: ActionStream<AppAction>, _state: StateReader) -> EpicOutput<AppAction> {
    actions
        .of_type("APP_INIT")
        .map(|_| {
            info!("app initialized");
            Ok(AppAction::AppLoading(false))
        })
        .boxed()
}

/// Produces greetings on request.
#[async_trait]
pub trait GreetingSource: Send + Sync + 'static {
    async fn fetch(&self) -> anyhow::Result<Greeting>;
}

/// Answers with a fixed message stamped with the current time.
#[derive(Debug, Clone)]
pub struct StaticGreetingSource {
    stage: String,
}

impl StaticGreetingSource {
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
        }
    }
}

#[async_trait]
impl GreetingSource for StaticGreetingSource {
    async fn fetch(&self) -> anyhow::Result<Greeting> {
        Ok(Greeting {
            message: "Hello from Lambda!".to_string(),
            stage: self.stage.clone(),
            timestamp: Utc::now(),
        })
    }
}

/// Fetches a greeting for every `GREETING_REQUESTED`.
///
/// Source errors become `GREETING_FAILED`; they do not end the epic.
#[derive(Clone)]
pub struct GreetingEpic {
    source: Arc<dyn GreetingSource>,
}

impl GreetingEpic {
    pub fn new(source: Arc<dyn GreetingSource>) -> Self {
        Self { source }
    }
}

impl Epic<AppAction> for GreetingEpic {
    fn run(&self, actions: ActionStream<AppAction>, _state: StateReader) -> EpicOutput<AppAction> {
        let source = Arc::clone(&self.source);
        actions
            .of_type("GREETING_REQUESTED")
            .then(move |_| {
                let source = Arc::clone(&source);
                async move {
                    match source.fetch().await {
                        Ok(greeting) => Ok(AppAction::GreetingLoaded(greeting)),
                        Err(err) => {
                            warn!(error = %format!("{:#}", err), "greeting fetch failed");
                            Ok(AppAction::GreetingFailed(err.to_string()))
                        }
                    }
                }
            })
            .boxed()
    }
}

/// Shorthand for [`GreetingEpic::new`].
pub fn greeting_epic(source: Arc<dyn GreetingSource>) -> GreetingEpic {
    GreetingEpic::new(source)
}
