// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flowtide DB - Workflow Persistence and Accounting Core
//!
//! This crate is the persistence and accounting layer of a multi-tenant
//! workflow execution platform. It owns workflow and job lifecycle state,
//! the per-subject resource quota ledger, restart run numbering, and the
//! scheduling priority calculation consumed by the external scheduler.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         External Callers                                 │
//! │              (API layer, scheduler, workspace service, CLI)              │
//! └─────────────────────────────────────────────────────────────────────────┘
//!            │ create/restart          │ status changes        │ priority
//!            ▼                         ▼                       ▼
//! ┌───────────────────┐   ┌────────────────────────┐   ┌─────────────────┐
//! │  Run Numbering    │   │  Transition Validator  │   │    Priority     │
//! │  (major.minor)    │   │  (pure, per-kind graph)│   │   Calculator    │
//! └─────────┬─────────┘   └───────────┬────────────┘   └────────┬────────┘
//!           │                         │                         │
//!           └──────────────┬──────────┴─────────────────────────┘
//!                          ▼
//!               ┌────────────────────┐        ┌────────────────────┐
//!               │     Lifecycle      │───────►│    Quota Ledger    │
//!               │   (write path)     │        │ (usage, limits,    │
//!               └─────────┬──────────┘        │  health)           │
//!                         │                   └─────────▲──────────┘
//!                         ▼                             │ set_usage
//!               ┌────────────────────┐        ┌─────────┴──────────┐
//!               │ PostgreSQL/SQLite  │◄───────│   Quota Updater    │
//!               │  (Durable Storage) │ sample │  (periodic pass)   │
//!               └────────────────────┘        └────────────────────┘
//! ```
//!
//! # Workflow Status State Machine
//!
//! ```text
//! ┌─────────┐    ┌─────────┐    ┌─────────┐    ┌─────────┐
//! │ CREATED │───►│ PENDING │───►│ QUEUED  │───►│ RUNNING │
//! └─────────┘    └─────────┘    └────┬────┘    └────┬────┘
//!                                    │               │
//!                                    │ fail     ┌────┼─────────┐
//!                                    │          ▼    ▼         ▼
//!                                    │   ┌─────────┐ ┌───────┐ ┌─────────┐
//!                                    └──►│ FAILED  │ │FINISHED│ │ STOPPED │
//!                                        └─────────┘ └───────┘ └─────────┘
//! ```
//!
//! Any non-terminal status may also transition to `DELETED`. Jobs use a
//! smaller graph: `CREATED → RUNNING → {FINISHED, FAILED, STOPPED}`.
//! Self-transitions are accepted as no-ops except on terminal statuses.
//!
//! # Quota Model
//!
//! Usage is tracked per `(subject, resource)` pair, where a subject is a
//! user or a workflow run and resources are CPU seconds and disk bytes.
//! Job completions increment the ledger on the hot path; a periodic
//! updater pass overwrites entries with authoritative sampled values, so
//! any drift is bounded by one pass interval. Usage never goes below
//! zero. Health is classified into bands (healthy, warning, critical,
//! exceeded) against configurable percentage edges.
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `FLOWTIDE_DATABASE_URL` | Yes | - | PostgreSQL or SQLite connection string |
//! | `FLOWTIDE_DB_POOL_SIZE` | No | `10` | Store connection pool size |
//! | `FLOWTIDE_QUOTA_UPDATE_INTERVAL_SECS` | No | `600` | Periodic pass cadence |
//! | `FLOWTIDE_QUOTA_UPDATE_RESOURCES` | No | `cpu,disk` | Resources the pass reconciles |
//! | `FLOWTIDE_QUOTA_UPDATE_POLICY` | No | `active` | `all` or `active` subject selection |
//! | `FLOWTIDE_QUOTA_WARNING_PCT` | No | `50` | Health band edge |
//! | `FLOWTIDE_QUOTA_CRITICAL_PCT` | No | `80` | Health band edge |
//! | `FLOWTIDE_QUOTA_EXCEEDED_PCT` | No | `100` | Health band edge |
//! | `FLOWTIDE_MAX_RESTARTS_PER_MAJOR` | No | `9` | Minor range per major run version |
//! | `FLOWTIDE_MAX_PRIORITY` | No | `100` | Priority range upper bound |
//! | `FLOWTIDE_DEFAULT_CPU_LIMIT` | No | `0` | CPU limit for new users (0 = unlimited) |
//! | `FLOWTIDE_DEFAULT_DISK_LIMIT` | No | `0` | Disk limit for new users (0 = unlimited) |
//! | `FLOWTIDE_DEFAULT_CONCURRENCY_ALLOWANCE` | No | `4` | Fallback concurrency allowance |
//!
//! # Modules
//!
//! - [`config`]: Configuration from environment variables
//! - [`error`]: Error types with stable error codes
//! - [`lifecycle`]: Workflow/job write path with validation and accounting
//! - [`migrations`]: Embedded database migrations
//! - [`model`]: Shared domain types (resources, subjects, health)
//! - [`persistence`]: Persistence trait and PostgreSQL/SQLite backends
//! - [`priority`]: Scheduling priority formula
//! - [`quota`]: Health bands and derived quota views
//! - [`run_number`]: Two-level restart run numbering
//! - [`sampler`]: Authoritative usage sampling
//! - [`status`]: Status state machines and the transition validator
//! - [`updater`]: Periodic quota reconciliation

#![deny(missing_docs)]

/// Configuration loaded from environment variables.
pub mod config;

/// Error types for core operations with stable error codes.
pub mod error;

/// Workflow and job lifecycle write path.
pub mod lifecycle;

/// Embedded database migrations for PostgreSQL and SQLite.
pub mod migrations;

/// Shared domain types: resources, subjects, quota health, audit actions.
pub mod model;

/// Persistence trait and backend implementations.
pub mod persistence;

/// Scheduling priority calculation.
pub mod priority;

/// Quota health bands and derived quota views.
pub mod quota;

/// Two-level run numbering for workflow restarts.
pub mod run_number;

/// Usage sampling for quota reconciliation.
pub mod sampler;

/// Workflow and job status state machines.
pub mod status;

/// Periodic quota reconciliation passes.
pub mod updater;
