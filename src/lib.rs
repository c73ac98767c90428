//! AgentSmithy - per-project self-hosted coding assistant server
//!
//! Clients (IDE plugins) POST chat requests; the server runs an LLM agent
//! that iteratively invokes tools, streams output/reasoning/tool events back
//! over SSE, and maintains per-project dialog state, checkpoints and a RAG
//! index under `<workdir>/.agentsmithy/`.

pub mod agent;
pub mod chat;
pub mod config;
pub mod dialogs;
pub mod events;
pub mod llm;
pub mod project;
pub mod rag;
pub mod server;
pub mod tools;
pub mod versioning;

pub use config::Settings;
pub use events::AgentEvent;
pub use project::Project;
