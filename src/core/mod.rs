//! Core domain types: identifiers, job definitions, cron schedules and retry
//! policy.

pub mod job;
pub mod retry;
pub mod schedule;
pub mod types;
