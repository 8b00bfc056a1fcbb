//! Integration test suite for herd.
//!
//! These tests drive a real `Orchestrator` over in-memory collaborators
//! (see `fixtures`), so no tmux server, tracker binary or worker process is
//! needed.
//!
//! # Test Categories
//!
//! - `dispatch`: the dispatch pipeline, duplicates and failures
//! - `operations`: check, followup, abort and list
//! - `cleanup`: per-step teardown results
//! - `reconstruction`: startup recovery from tracker metadata
//! - `poller`: state-change detection across workers


mod dispatch;
mod poller;
