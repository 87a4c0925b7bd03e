//! Tool system: definitions, registry, argument validation and dispatch.

pub mod arguments;
pub mod dispatch;
pub mod process;
pub mod registry;
pub mod tool;
pub mod types;
pub mod validation;

pub use arguments::ToolArguments;
pub use dispatch::{DispatchEvent, DispatchOutcome, ToolDispatcher};
pub use process::{process_tool, ProcessManager, ProcessState, ProcessStatus};
pub use registry::ToolRegistry;
pub use tool::{AgentTool, Tool, ToolExecutionContext};
pub use types::{AgentToolParameters, ParameterBuilder};
pub use validation::validate_arguments;
