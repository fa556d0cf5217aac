//! Flash coupon service wiring.
//!
//! - [`config`]: environment-driven configuration
//! - [`resources`]: backend connections and the services built on them
//!
//! The `flashcoupon` binary connects everything and runs the fulfillment
//! worker pool until it receives Ctrl+C or SIGTERM.

pub mod config;
pub mod resources;

pub use config::Config;
pub use resources::Resources;
