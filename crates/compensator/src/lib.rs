/*
 * 5D Labs Agent Platform - Disruption Compensator
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Disruption compensator
//!
//! Watches for node drains blocked by a disruption budget, temporarily scales
//! the affected test Deployments up so the drain can proceed, keeps Argo CD
//! from reverting the change, and restores the original replica count on a
//! periodic sweep. Cluster state is the only source of truth: the original
//! count lives in a marker on the Deployment itself.

pub mod cluster;
pub mod compensator;
pub mod config;
pub mod error;
pub mod kube_store;
pub mod locator;
pub mod model;
pub mod retry;
pub mod runtime;
pub mod suppression;
pub mod sweeper;
pub mod watcher;

#[cfg(test)]
mod fake;

// Re-export commonly used types
pub use compensator::{CompensationOutcome, CompensationReport, Compensator};
pub use config::{CompensatorConfig, DEFAULT_CONFIG_PATH};
pub use error::{Error, Result};
pub use model::{DisruptionSignal, UnitKey, UnitState, WorkloadUnit};
pub use runtime::run_compensator;
pub use sweeper::{RestorationSweeper, SweepReport};
pub use watcher::EventWatcher;
