//! Core domain types for the volley pipeline.
//!
//! This module contains pure domain types with no I/O:
//! - Recipient identifiers and normalization
//! - Classification results
//! - Dispatch payloads, outcomes and summaries

pub mod classification;
pub mod dispatch;
pub mod recipient;
