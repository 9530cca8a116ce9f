//! Host lifecycle and connection bookkeeping

mod host_tests;
mod store_tests;
