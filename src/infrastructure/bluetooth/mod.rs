//! Bluetooth Module
//!
//! Radio-facing side of the central role.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                       Controller                         │
//! │   (forwards every command, normalizes discover events)   │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!           ┌───────────┴────────────┐
//!           │                        │
//!           ▼                        ▼
//! ┌───────────────────┐    ┌──────────────────┐
//! │  Driver (trait)   │    │     Protocol     │
//! │                   │    │                  │
//! │ - host radio      │    │ - UUID forms     │
//! │ - network proc.   │    │ - SIG names      │
//! └───────────────────┘    └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`controller`] - Backend selection and command forwarding
//! - [`driver`] - The capability contract a radio backend implements
//! - [`protocol`] - UUID normalization and assigned-number names

pub mod controller;
pub mod driver;
pub mod protocol;

pub use controller::{Backend, Controller};
pub use driver::Driver;
