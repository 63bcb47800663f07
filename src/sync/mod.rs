pub mod fetcher;
pub mod orchestrator;
pub mod snowflake;
