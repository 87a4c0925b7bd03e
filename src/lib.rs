//! # tiller
//!
//! An autonomous task-execution loop. Each step asks a language model for the
//! next move, runs the tools it requests (concurrently, results kept in request
//! order), folds the results back into the conversation and decides whether to
//! keep going.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tiller::prelude::*;
//!
//! # async fn run() -> tiller::error::Result<()> {
//! let config = RuntimeConfig::from_env();
//! let provider = create_provider(ProviderKind::Anthropic, "claude-sonnet-4-5", &config)?;
//! let mut registry = ToolRegistry::new();
//! registry.register(Arc::new(AgentTool::new(
//!     "echo",
//!     "Echo the input back",
//!     AgentToolParameters::object().string("text", "Text to echo", true).build(),
//!     |args, _ctx| async move { Ok(ToolResult::ok(args.get_str("text")?)) },
//! )));
//!
//! let mut agent = AgentLoop::builder()
//!     .provider(Arc::from(provider))
//!     .tools(Arc::new(registry))
//!     .system_prompt("You are a helpful assistant.")
//!     .build();
//! let outcome = agent.run("say hi", &CancellationToken::new()).await;
//! println!("{:?}: {:?}", outcome.status, outcome.final_content);
//! # Ok(())
//! # }
//! ```

pub mod agent_loop;
pub mod config;
pub mod error;
pub mod prelude;
pub mod provider;
pub mod tools;
pub mod types;
pub mod util;
