//! Property-based tests for the routing pipeline using proptest.
//!
//! These tests verify the invariants callers rely on:
//!
//! - Parsing never fails, and text without an action comes back verbatim
//! - Well-formed action markers always classify into the closed action set
//! - Classification is deterministic
//! - Tier plans and dispatch walks never repeat a tier
//! - Budget truncation drops lowest-relevance supplements first and never
//!   touches the query text
