//! End-to-end tests: the orchestrator driving a fake `eb` executable.
#![cfg(unix)]

mod common;

mod cancel_tests;
mod ledger_tests;
mod manifest_tests;
mod orchestrate_tests;
mod retry_tests;
