//! Integration test suite for pipewright.
//!
//! These tests drive several components together over the in-memory
//! event channel and metadata store.
//!
//! # Test Categories
//!
//! - `orchestration_flow`: event ingestion through decision application
//! - `conflict_resolution`: arbitration between agents on one pipeline
//! - `recovery`: failed executions healed or escalated
//! - `stream_backpressure`: partitioned consumption under a slow sink

mod fixtures;

mod conflict_resolution;
mod orchestration_flow;
mod recovery;
mod stream_backpressure;
