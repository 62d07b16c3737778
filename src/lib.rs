#![allow(missing_docs)] // TODO: enforce once core types are stable

//! Straylight — multi-tenant integration gateway credential plane.
//!
//! End users provision long-lived *instances* of third-party integrations
//! (Gmail, Slack, GitHub, ...) through a uniform tool-call protocol. Each
//! instance binds one user to one service type, carries its own credential
//! set, and is subject to per-plan quotas. When a tool call arrives, the
//! auth pipeline resolves the instance, materializes a fresh bearer, and
//! records usage.
//!
//! The crate is the credential plane only: instance lifecycle, the OAuth
//! refresh state machine with optimistic concurrency, a process-local
//! credential cache synchronized with the durable store, and the
//! authenticating request pipeline. Per-integration adapters and the
//! tool-call transport are external collaborators wired against
//! [`pipeline::AuthGate`] and [`instances::InstanceManager`].

pub mod cache;
pub mod config;
pub mod instances;
pub mod logging;
pub mod maintenance;
pub mod oauth;
pub mod pipeline;
pub mod refresh;
pub mod store;
pub mod types;
