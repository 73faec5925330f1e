// Life of a request:
// 1. Resolve the endpoint in the registry table
// 2. Security checkers, in priority order; the first rejection ends it
// 3. Decoders transform the inbound payload
// 4. The backend produces a response
// 5. Encoders transform the outbound payload
// 6. Header managers add response headers (the token manager issues tokens here)
//
// System components:
//  - Shared store (registry table, live-token table)
//  - Extension loader
//  - API registry
//  - Token manager

pub mod apps;
pub mod auth;
pub mod config;
pub mod extensions;
pub mod http;
pub mod pipeline;
pub mod registry;
pub mod store;
pub mod time;


pub use registry::{ApiRegistry, RegistryError, RegistryOptions};
