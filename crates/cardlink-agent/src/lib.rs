//! Cardlink Agent Library
//!
//! Core functionality for the card-issuance agent:
//! - Pairing with the cloud and the liveness heartbeat
//! - Card encoding over PC/SC readers (or a simulated reader)
//! - Durable `SQLite` queue for jobs that could not complete
//! - Issuance poll loop and queue replay
//! - Local control API with a loopback HTTP router

pub mod agent;
pub mod card;
pub mod cloud;
pub mod control;
pub mod identity;
pub mod issuance;
pub mod pairing;
pub mod queue;
pub mod storage;
