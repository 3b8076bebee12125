//! Grid & Hedge Engine
//!
//! An autonomous position-management engine for a single exchange account:
//! it watches price history, classifies the market regime, keeps an adaptive
//! price grid and a directional position with a protective hedge, reconciles
//! its orders against the venue and persists everything per symbol so it
//! survives restarts.

pub mod common;
pub mod config;
pub mod engine;
pub mod exchange;
pub mod grid;
pub mod indicators;
pub mod lifecycle;
pub mod market;
pub mod notify;
pub mod reconciler;
pub mod regime;
pub mod signal;
pub mod state_manager;
pub mod types;

pub use config::Config;
pub use engine::{Engine, EngineHandle};
pub use types::*;
