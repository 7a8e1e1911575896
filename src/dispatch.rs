//! Handler dispatch: ordered pattern-matched overrides layered above the
//! generic tree operations. Subtree ops replace get/set/delete wholesale
//! for everything under a matching path; property hooks add semantic
//! checks (and value transforms) the type validators cannot express;
//! expire hooks decide what happens when a leaf's TTL elapses.
//!
//! Dispatch is strictly first-match in registration order.

use std::sync::Arc;

use regex::Regex;
use thiserror::Error;
use time::OffsetDateTime;

use crate::{
    path::PropPath,
    tree::{PropTree, TreeError},
};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("operation not supported on {0}")]
    Unsupported(String),

    #[error("{0}")]
    Hook(String),

    #[error(transparent)]
    Tree(#[from] TreeError),
}

/// Replacement get/set/delete implementations for a whole subtree.
pub trait SubtreeOps: Send + Sync {
    fn get(
        &self,
        tree: &mut PropTree,
        path: &PropPath,
        now: OffsetDateTime,
    ) -> Result<String, DispatchError>;

    fn set(
        &self,
        tree: &mut PropTree,
        path: &PropPath,
        value: &str,
        expires: Option<OffsetDateTime>,
        create: bool,
    ) -> Result<(), DispatchError>;

    fn delete(&self, tree: &mut PropTree, path: &PropPath) -> Result<Vec<String>, DispatchError>;
}

/// A per-path semantic check. May transform the value by returning
/// `Some(replacement)`; returning an `Err` rejects the write.
pub trait PropHook: Send + Sync {
    fn check(
        &self,
        tree: &PropTree,
        path: &PropPath,
        value: &str,
        now: OffsetDateTime,
    ) -> Result<Option<String>, String>;
}

/// What the expiration driver should do with a leaf whose TTL elapsed.
pub enum ExpireAction {
    /// Delete-style notification plus removal. The default.
    Remove,
    /// Reset the leaf to the given value instead of removing it.
    Reset(String),
}

pub trait ExpireHook: Send + Sync {
    fn action(&self, tree: &PropTree, path: &PropPath) -> ExpireAction;
}

/// The default subtree ops: straight-through tree operations.
struct TreeOpsDefault;

impl SubtreeOps for TreeOpsDefault {
    fn get(
        &self,
        tree: &mut PropTree,
        path: &PropPath,
        now: OffsetDateTime,
    ) -> Result<String, DispatchError> {
        Ok(tree.get_json(path, now)?)
    }

    fn set(
        &self,
        tree: &mut PropTree,
        path: &PropPath,
        value: &str,
        expires: Option<OffsetDateTime>,
        create: bool,
    ) -> Result<(), DispatchError> {
        if create {
            tree.add(path, value, expires)?;
        } else {
            tree.set(path, value, expires)?;
        }
        Ok(())
    }

    fn delete(&self, tree: &mut PropTree, path: &PropPath) -> Result<Vec<String>, DispatchError> {
        Ok(tree.delete(path)?)
    }
}

/// The dispatch tables. One instance is shared by the RPC server, the
/// expiration driver, and the emulator.
pub struct Dispatch {
    subtree: Vec<(Regex, Arc<dyn SubtreeOps>)>,
    hooks: Vec<(Regex, Arc<dyn PropHook>)>,
    expire: Vec<(Regex, Arc<dyn ExpireHook>)>,
    default_ops: Arc<dyn SubtreeOps>,
}

impl Dispatch {
    pub fn new() -> Dispatch {
        Dispatch {
            subtree: Vec::new(),
            hooks: Vec::new(),
            expire: Vec::new(),
            default_ops: Arc::new(TreeOpsDefault),
        }
    }

    pub fn register_subtree(
        &mut self,
        pattern: &str,
        ops: Arc<dyn SubtreeOps>,
    ) -> Result<(), regex::Error> {
        self.subtree.push((Regex::new(pattern)?, ops));
        Ok(())
    }

    pub fn register_hook(
        &mut self,
        pattern: &str,
        hook: Arc<dyn PropHook>,
    ) -> Result<(), regex::Error> {
        self.hooks.push((Regex::new(pattern)?, hook));
        Ok(())
    }

    pub fn register_expire(
        &mut self,
        pattern: &str,
        hook: Arc<dyn ExpireHook>,
    ) -> Result<(), regex::Error> {
        self.expire.push((Regex::new(pattern)?, hook));
        Ok(())
    }

    /// The subtree ops serving `path`: first registered match, or the
    /// default tree operations.
    pub fn ops_for(&self, path: &str) -> &Arc<dyn SubtreeOps> {
        self.subtree
            .iter()
            .find(|(pattern, _)| pattern.is_match(path))
            .map(|(_, ops)| ops)
            .unwrap_or(&self.default_ops)
    }

    /// Runs the first matching property hook. Returns the (possibly
    /// transformed) value to store.
    pub fn run_set_hook(
        &self,
        tree: &PropTree,
        path: &PropPath,
        value: &str,
        now: OffsetDateTime,
    ) -> Result<String, DispatchError> {
        let display = path.to_string_under(tree.root_path());
        for (pattern, hook) in &self.hooks {
            if pattern.is_match(&display) {
                return match hook.check(tree, path, value, now) {
                    Ok(Some(replacement)) => Ok(replacement),
                    Ok(None) => Ok(value.to_owned()),
                    Err(reason) => Err(DispatchError::Hook(reason)),
                };
            }
        }
        Ok(value.to_owned())
    }

    /// What to do when the leaf at `path` expires: first registered match,
    /// or removal.
    pub fn expire_action(&self, tree: &PropTree, path: &PropPath) -> ExpireAction {
        let display = path.to_string_under(tree.root_path());
        for (pattern, hook) in &self.expire {
            if pattern.is_match(&display) {
                return hook.action(tree, path);
            }
        }
        ExpireAction::Remove
    }
}

impl Default for Dispatch {
    fn default() -> Self {
        Self::new()
    }
}
