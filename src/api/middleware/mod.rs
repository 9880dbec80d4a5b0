//! Request middleware: correlation + metrics tracking, API-key auth,
//! per-client rate limiting.

pub mod auth;
pub mod rate;
pub mod track;
