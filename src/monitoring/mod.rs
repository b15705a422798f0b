//! Monitoring Layer
//!
//! Independent, timer-driven checks over the repository:
//! - Git working-tree dirtiness with two reminder tiers
//! - Evidence artifact freshness and auto-refresh
//! - Aggregated health snapshots over pluggable providers
//! - User activity in the repository, which holds back evidence alerts

pub mod activity;
pub mod evidence;
pub mod git_tree;
pub mod health;
pub mod providers;

pub use activity::ActivityFilter;
pub use evidence::{EvidenceManager, EvidenceVerdict, RefreshOutcome};
pub use git_tree::{
    DirtyLevel, GitCli, GitQuery, GitStatusSource, GitTreeLimits, GitTreeMonitor, GitTreeState,
};
pub use health::{HealthCheckProvider, HealthCheckResult, HealthCheckService, HealthSnapshot, HealthStatus};
pub use providers::{default_providers, PidSource};
