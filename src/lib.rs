//! Clinic Lead Intake Library
//!
//! Turns signed lead webhooks from ad providers into deduplicated customer
//! records: signature verification, field normalization, match scoring,
//! deduplication and the ingestion pipeline that ties them to storage.
//!
//! # Modules
//!
//! - `api`: HTTP-facing components.
//! - `core`: Pure matching logic, the pipeline and shared models/errors.
//! - `integrations`: Provider payloads, lead fetching and storage.
//! - `config`: Configuration management.
//! - `db`: Database connection and schema setup.
//! - `dedup`: Thresholds, resolutions and the merge rule.
//! - `errors`: Error handling types.
//! - `handlers`: HTTP request handlers and router.
//! - `lead_fetch`: Graph API / mock lead field lookup.
//! - `lead_models`: Webhook and Google Ads payload models.
//! - `matching`: Candidate scoring.
//! - `models`: Core data models.
//! - `normalizer`: Provider fields to canonical leads.
//! - `pipeline`: Lead ingestion pipeline.
//! - `retry`: Bounded backoff for storage calls.
//! - `signature`: Webhook HMAC verification.
//! - `store`: `LeadStore` trait with Postgres and in-memory backends.

pub mod api;
pub mod core;
pub mod integrations;

pub mod config;
pub mod db;
pub mod dedup;
pub mod errors;
pub mod handlers;
pub mod lead_fetch;
pub mod lead_models;
pub mod matching;
pub mod models;
pub mod normalizer;
pub mod pipeline;
pub mod retry;
pub mod signature;
pub mod store;
