//! Integration tests for the mediaq scheduler.

mod helpers;

mod admission_test;
mod cancel_test;
mod lifecycle_test;
mod shutdown_test;
