pub mod auth;
pub mod clock;
pub mod config;
pub mod engine;
pub mod journal;
pub mod limits;
pub mod model;
pub mod observability;
pub mod pricing;
pub mod queue;
pub mod ratelimit;
pub mod reaper;
pub mod sql;
pub mod store;
pub mod validate;
pub mod wire;
