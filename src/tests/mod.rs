//! Test modules for the scheduler crate

mod support;

mod runtime_tests;
mod sqlite_store_tests;
