// Library entrypoint for integration tests and internal reuse.
pub mod api;
pub mod config;
pub mod dataset;
pub mod extract;
pub mod i18n;
pub mod llm;
pub mod memory;
pub mod orchestrator;
pub mod schema_rag;
pub mod schemas;
pub mod shutdown;
pub mod sql_gate;
pub mod state;
pub mod tools;
