pub mod call;
pub mod chat;
pub mod config;
pub mod context;
pub mod telemetry;

pub use call::CallSession;
pub use config::CallConfig;
pub use context::AppContext;
