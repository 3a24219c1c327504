//! Named command handlers for external start/stop/administration control.
//!
//! Services publish a [`CommandHandlers`] map; whoever drives them (a CLI, an
//! admin socket, a dashboard) looks a command up by name and invokes it with
//! string arguments.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::utils::error::{Error, Result};

pub type CommandFuture = BoxFuture<'static, Result<String>>;
pub type CommandHandler = Arc<dyn Fn(Vec<String>) -> CommandFuture + Send + Sync>;
pub type CommandHandlers = HashMap<String, CommandHandler>;

/// Wraps an async closure into a [`CommandHandler`].
pub fn handler<F, Fut>(f: F) -> CommandHandler
where
    F: Fn(Vec<String>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String>> + Send + 'static,
{
    Arc::new(move |args| Box::pin(f(args)))
}

pub async fn execute(handlers: &CommandHandlers, name: &str, args: Vec<String>) -> Result<String> {
    let handler = handlers
        .get(name)
        .ok_or_else(|| Error::protocol(format!("unknown command '{name}'")))?;
    handler(args).await
}

/// Returns the single expected argument or a protocol error naming the command.
pub fn single_arg(command: &str, args: &[String]) -> Result<String> {
    match args {
        [arg] => Ok(arg.clone()),
        _ => Err(Error::protocol(format!("{command} expects 1 argument"))),
    }
}
