use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;

use crate::event_sourcing::{AccessContext, Command, Payload, PayloadError};
use crate::metrics::Metrics;

/// Executes one command type, usually by driving an aggregate through the
/// [`AggregateManager`](crate::event_sourcing::AggregateManager).
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle_command(&self, command: &dyn Command) -> anyhow::Result<()>;
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("command factory returned no value")]
    FactoryInvalid,

    #[error("command type cannot be empty")]
    EmptyCommandType,

    #[error("command type {0} is already registered")]
    CommandTypeAlreadyRegistered(String),

    #[error("command type {0} is not registered")]
    CommandNotRegistered(String),

    #[error("a handler for command type {0} is already set")]
    HandlerAlreadySet(String),

    #[error("no handler for command type {0}")]
    HandlerNotFound(String),

    #[error("role {role} may not issue {command_type}")]
    Unauthorized { command_type: String, role: String },

    #[error(transparent)]
    Payload(#[from] PayloadError),

    #[error("handler for {command_type} failed: {source}")]
    HandlerFailed {
        command_type: String,
        #[source]
        source: anyhow::Error,
    },
}

type Decoder = Arc<dyn Fn(&Payload) -> Result<Box<dyn Command>, PayloadError> + Send + Sync>;

#[derive(Default)]
struct Tables {
    decoders: HashMap<String, Decoder>,
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
}

/// Registration is append-only: a command type or handler, once bound,
/// stays bound for the life of the registry.
#[derive(Default)]
pub struct CommandRegistry {
    tables: RwLock<Tables>,
    metrics: Option<Arc<Metrics>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Register a command type. `factory` yields the zero value used for an
    /// empty payload; its `command_type()` is the registration key.
    pub async fn register_command<C, F>(&self, factory: F) -> Result<(), RegistryError>
    where
        C: Command + DeserializeOwned,
        F: Fn() -> Option<C> + Send + Sync + 'static,
    {
        let zero = factory().ok_or(RegistryError::FactoryInvalid)?;
        let command_type = zero.command_type().to_string();
        if command_type.is_empty() {
            return Err(RegistryError::EmptyCommandType);
        }

        let mut tables = self.tables.write().await;
        if tables.decoders.contains_key(&command_type) {
            return Err(RegistryError::CommandTypeAlreadyRegistered(command_type));
        }

        let expected = command_type.clone();
        let decoder: Decoder = Arc::new(move |payload: &Payload| {
            if !payload.type_url.is_empty() && payload.type_url != expected {
                return Err(PayloadError::TypeMismatch {
                    expected: expected.clone(),
                    actual: payload.type_url.clone(),
                });
            }
            let command = if payload.is_empty() {
                factory().ok_or_else(|| PayloadError::TypeMismatch {
                    expected: expected.clone(),
                    actual: String::new(),
                })?
            } else {
                payload.decode::<C>()?
            };
            Ok(Box::new(command) as Box<dyn Command>)
        });

        tables.decoders.insert(command_type.clone(), decoder);
        tracing::debug!(command_type = %command_type, "Command type registered");
        Ok(())
    }

    /// Decode a registered command from its payload envelope.
    pub async fn create_command(
        &self,
        command_type: &str,
        payload: &Payload,
    ) -> Result<Box<dyn Command>, RegistryError> {
        let decoder = self
            .tables
            .read()
            .await
            .decoders
            .get(command_type)
            .cloned()
            .ok_or_else(|| RegistryError::CommandNotRegistered(command_type.to_string()))?;
        Ok(decoder(payload)?)
    }

    pub async fn set_handler(
        &self,
        handler: Arc<dyn CommandHandler>,
        command_type: &str,
    ) -> Result<(), RegistryError> {
        if command_type.is_empty() {
            return Err(RegistryError::EmptyCommandType);
        }
        let mut tables = self.tables.write().await;
        if tables.handlers.contains_key(command_type) {
            return Err(RegistryError::HandlerAlreadySet(command_type.to_string()));
        }
        tables.handlers.insert(command_type.to_string(), handler);
        tracing::debug!(command_type = %command_type, "Command handler bound");
        Ok(())
    }

    /// Dispatch to the bound handler. The registry lock is released before
    /// the handler runs.
    pub async fn handle_command(&self, command: &dyn Command) -> Result<(), RegistryError> {
        let command_type = command.command_type();
        let handler = self
            .tables
            .read()
            .await
            .handlers
            .get(command_type)
            .cloned()
            .ok_or_else(|| RegistryError::HandlerNotFound(command_type.to_string()))?;

        let result = handler.handle_command(command).await;
        if let Some(metrics) = &self.metrics {
            metrics.record_command(command_type, result.is_ok());
        }

        result.map_err(|source| {
            tracing::warn!(
                command_type = %command_type,
                aggregate_id = %command.aggregate_id(),
                error = %source,
                "Command failed"
            );
            RegistryError::HandlerFailed {
                command_type: command_type.to_string(),
                source,
            }
        })
    }

    /// Authorize against the caller's context, then dispatch.
    pub async fn handle_command_as(
        &self,
        context: &AccessContext,
        command: &dyn Command,
    ) -> Result<(), RegistryError> {
        if !context.permits(command) {
            return Err(RegistryError::Unauthorized {
                command_type: command.command_type().to_string(),
                role: context.role.clone(),
            });
        }
        self.handle_command(command).await
    }
}
