pub mod config; // quota engine config file
pub mod counter; // per-principal, per-period counters (memory, redis)
pub mod durable; // durable storage for flushed counters (memory, clickhouse)
pub mod endpoints; // API endpoints
pub mod error; // error handling
pub mod gateway_util; // app state and router assembly
pub mod observability; // logs and metrics setup
pub mod period;
pub mod plan;
pub mod principal; // bearer token authentication
pub mod quota; // quota policy, enforcement and middleware
pub mod reconciler; // background flush from counter store to durable store
mod testing;
