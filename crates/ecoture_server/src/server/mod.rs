#![forbid(unsafe_code)]

pub mod health;
pub mod state;
pub mod ws;
