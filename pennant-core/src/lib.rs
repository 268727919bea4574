//! Pennant Core
//!
//! Core types and pure logic for the Pennant deployment dispatch engine.
//!
//! This crate contains:
//! - Domain types: Core business entities (Resource, ReleaseTarget, Release, Policy, Job)
//! - Condition trees: The selector language and its evaluator
//! - Rollout math: Deterministic gradual-rollout admission
//! - Work items: Queue envelopes exchanged between engine components
//!
//! Note: Persistence and scheduling logic live in the engine crate.

pub mod condition;
pub mod domain;
pub mod dto;
pub mod rollout;
pub mod workitem;
