//! Walk context and progress tracking
//!
//! Every upward or downward walk runs step by step against the store. Between
//! steps it checks its [`WalkContext`] so a caller-level timeout or a shutdown
//! stops the walk at a known position instead of letting it finish silently.

use crate::config::TreeConfig;
use crate::services::TreeError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Which walk was interrupted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalkKind {
    /// Upward, through the ancestors' `descendants` sets
    AncestorClosure,
    /// Downward, rewriting `nestingLevel`
    Depth,
    /// Downward, rewriting `fullName`
    PathName,
    /// Downward, collecting a subtree through parent pointers
    Subtree,
    /// Upward, reading the parent chain
    Ancestors,
    /// Rewriting cached fields from parent pointers
    Reconcile,
}

impl fmt::Display for WalkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WalkKind::AncestorClosure => "ancestor closure",
            WalkKind::Depth => "depth",
            WalkKind::PathName => "path name",
            WalkKind::Subtree => "subtree",
            WalkKind::Ancestors => "ancestor chain",
            WalkKind::Reconcile => "reconcile",
        };
        f.write_str(name)
    }
}

/// Cancellation, deadline and step budget shared by the walks of one operation
#[derive(Debug, Clone)]
pub struct WalkContext {
    cancel_token: CancellationToken,
    deadline: Option<Instant>,
    max_steps: usize,
}

impl WalkContext {
    pub fn new(max_steps: usize) -> Self {
        Self {
            cancel_token: CancellationToken::new(),
            deadline: None,
            max_steps,
        }
    }

    /// Context for one operation under `config`: step budget from
    /// `max_walk_depth`, deadline from `walk_timeout_ms`
    pub fn from_config(config: &TreeConfig) -> Self {
        let ctx = Self::new(config.max_walk_depth);
        match config.walk_timeout() {
            Some(timeout) => ctx.with_timeout(timeout),
            None => ctx,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn with_cancel_token(mut self, cancel_token: CancellationToken) -> Self {
        self.cancel_token = cancel_token;
        self
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }

    pub fn max_steps(&self) -> usize {
        self.max_steps
    }

    /// Why the walk must not take another step, if anything
    pub fn interruption(&self) -> Option<&'static str> {
        if self.cancel_token.is_cancelled() {
            return Some("cancelled");
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some("deadline exceeded"),
            _ => None,
        }
    }
}

impl Default for WalkContext {
    fn default() -> Self {
        Self::from_config(&TreeConfig::default())
    }
}

/// Position of a running walk, turned into `PartialWalkFailure` when it stops
#[derive(Debug)]
pub struct WalkProgress<'a> {
    ctx: &'a WalkContext,
    kind: WalkKind,
    origin: String,
    completed: usize,
    hops: usize,
}

impl<'a> WalkProgress<'a> {
    pub fn begin(ctx: &'a WalkContext, kind: WalkKind, origin: &str) -> Self {
        Self {
            ctx,
            kind,
            origin: origin.to_string(),
            completed: 0,
            hops: 0,
        }
    }

    /// Check cancellation, deadline and step budget before touching `next`
    pub fn check(&self, next: &str) -> Result<(), TreeError> {
        if let Some(reason) = self.ctx.interruption() {
            return Err(self.stopped(next, reason));
        }
        if self.hops >= self.ctx.max_steps {
            return Err(self.stopped(
                next,
                format!("exceeded {} steps (cycle in parent chain?)", self.ctx.max_steps),
            ));
        }
        Ok(())
    }

    /// Record `nodes` updated in one hop (one ancestor, or one tree level)
    pub fn advance(&mut self, nodes: usize) {
        self.completed += nodes;
        self.hops += 1;
    }

    pub fn completed(&self) -> usize {
        self.completed
    }

    /// Error for a walk that stopped before `at`
    pub fn stopped(&self, at: &str, reason: impl fmt::Display) -> TreeError {
        tracing::warn!(
            "{} walk from '{}' stopped at '{}' after {} step(s): {}",
            self.kind,
            self.origin,
            at,
            self.completed,
            reason
        );
        TreeError::PartialWalkFailure {
            walk: self.kind,
            node_id: self.origin.clone(),
            completed: self.completed,
            stopped_at: at.to_string(),
            reason: reason.to_string(),
        }
    }
}
