//! Request/response behaviour as seen by a client

mod plain_tests;
mod tls_tests;
