//! Common test utilities for nethub integration tests
//!
//! This module provides:
//! - `TestHost` for starting listeners on ephemeral ports with a private
//!   certificate directory
//! - Polling and wire-level assertions shared by the scenario tests

#![allow(unused_imports)]
#![allow(dead_code)]

pub mod assertions;
pub mod test_host;

pub use assertions::*;
pub use test_host::TestHost;
