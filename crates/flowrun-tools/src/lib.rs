//! Default capability implementations: the tool registry with its built-in
//! tools, the subprocess code runner and the outbound HTTP client.

pub mod builtin;
pub mod http;
pub mod process;
pub mod registry;

pub use http::ReqwestHttpClient;
pub use process::ProcessRunner;
pub use registry::ToolRegistry;
