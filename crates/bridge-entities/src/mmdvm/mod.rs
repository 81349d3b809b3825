pub mod client;
pub mod protocol;

pub use client::{ClientState, MmdvmClient, MmdvmCommand, MmdvmEvent};
