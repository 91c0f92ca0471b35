// src/lib.rs

//! camhub is a multiclient camera-access arbiter: a privileged server owns
//! the camera engine and shares its inputs across client processes over a
//! connection-oriented IPC substrate.
//!
//! The crate ships both halves: [`server`] hosts the engine behind the
//! rendezvous/dispatch machinery, [`client`] is the library applications
//! link against. [`core`] and [`transport`] are the protocol and transport
//! layers they share.

pub mod client;
pub mod config;
pub mod core;
pub mod engine;
pub mod server;
pub mod transport;
