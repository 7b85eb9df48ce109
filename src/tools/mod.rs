pub mod gateway;
pub mod http;
pub mod server;

pub use gateway::ToolGateway;
pub use http::HttpToolServer;
pub use server::{ToolCallRequest, ToolCallResult, ToolError, ToolServer, ToolSignature};
