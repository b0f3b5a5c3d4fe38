pub mod config;
pub mod context;
pub mod logging;
pub mod programs;
pub mod rpc;
pub mod server;

pub use config::AppConfig;
pub use context::AppContext;
pub use server::{ServerError, SunRpc};
