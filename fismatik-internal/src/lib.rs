pub mod abuse_guard; // duplicate-submission guard
pub mod ai; // generation provider client, prompt templates, receipt reply parsing
pub mod auth; // bearer token resolution
pub mod config; // gateway config file and environment secrets
pub mod endpoints; // API endpoints
pub mod error; // error handling
pub mod gateway_util; // app state and shared extractors
pub mod observability; // logs and metrics
pub mod pipeline; // request admission pipeline
pub mod quota; // subscription tiers and the quota store
pub mod rate_limit; // coarse per-caller rate limiting
mod testing;
pub mod usage; // background token usage accounting

pub mod built_info {
    #![expect(clippy::allow_attributes)]
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}
