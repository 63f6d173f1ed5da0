pub mod file_tools;
pub mod registry;
pub mod remote;
pub mod shell;
pub mod traits;

pub use file_tools::{ListDirTool, ReadFileTool, WriteFileTool};
pub use registry::ToolRegistry;
pub use remote::{discover_tools, qualified_name, DiscoveryReport, RemoteCallResult, RemoteTool, RemoteToolSpec, ToolServer};
pub use shell::ShellTool;
pub use traits::{ConfirmationDetails, Tool, ToolContext, ToolError, ToolKind, ToolResult};
