#![forbid(unsafe_code)]

mod hub;

#[cfg(test)]
mod hub_tests;

pub use hub::{HubEvent, RelayHub, RelayHubConfig};
