//! Workflow engine: role × record-type × status rules.
//!
//! Pure functions over configuration; no I/O, no state. Two checks:
//!
//! 1. [`can_act`]: may this role create/edit/delete/view this record type?
//! 2. [`can_transition`]: may this role move a record between two statuses?
//!
//! Evaluation is deny-by-default: a role with no `can_<action>` list defined
//! is denied that action everywhere. `admin` bypasses both checks. The
//! `public` role is granted nothing here; the engine additionally filters
//! what `public` can see by published status.

pub mod config;
pub mod roles;

pub use config::{RolePermissions, TypeOverride, WorkflowConfig};

use crate::error::{Error, Result};

/// The four record actions subject to role checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Create,
    Edit,
    Delete,
    View,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Edit => "edit",
            Action::Delete => "delete",
            Action::View => "view",
        }
    }
}

/// Checks whether `role` may perform `action` on `record_type`.
///
/// Wildcard `*` in a permission list grants the action for every type. An
/// unknown role is a denial, not an error.
pub fn can_act(
    config: &WorkflowConfig,
    role: &str,
    action: Action,
    record_type: &str,
) -> Result<()> {
    if role == "admin" {
        return Ok(());
    }

    let Some(perms) = config.roles.get(role) else {
        return Err(Error::action_denied(role, action.as_str(), record_type));
    };

    let list = match action {
        Action::Create => &perms.can_create,
        Action::Edit => &perms.can_edit,
        Action::Delete => &perms.can_delete,
        Action::View => &perms.can_view,
    };

    // Undefined list = deny by default.
    let Some(allowed) = list else {
        return Err(Error::action_denied(role, action.as_str(), record_type));
    };

    if allowed.iter().any(|t| t == "*" || t == record_type) {
        Ok(())
    } else {
        Err(Error::action_denied(role, action.as_str(), record_type))
    }
}

/// Checks whether `role` may transition a record of `record_type` from
/// `from` to `to`.
///
/// Both gates must pass: the (possibly type-overridden) global transition
/// graph must contain the edge, and the role's own transition rules
/// (`can_transition[from] ∪ can_transition["any"]`) must contain the target.
/// `any` is a wildcard source only; there is no wildcard target.
pub fn can_transition(
    config: &WorkflowConfig,
    role: &str,
    record_type: &str,
    from: &str,
    to: &str,
) -> Result<()> {
    let statuses = config.statuses_for(record_type);
    if !statuses.iter().any(|s| s == to) {
        return Err(Error::UnknownStatus(to.to_string()));
    }

    let transitions = config.transitions_for(record_type);
    let edge_exists = transitions
        .get(from)
        .map(|targets| targets.iter().any(|t| t == to))
        .unwrap_or(false);
    if !edge_exists {
        return Err(Error::transition_denied(role, from, to));
    }

    if role == "admin" {
        return Ok(());
    }

    let Some(perms) = config.roles.get(role) else {
        return Err(Error::transition_denied(role, from, to));
    };

    let allowed = perms
        .can_transition
        .get(from)
        .into_iter()
        .chain(perms.can_transition.get("any"))
        .flatten()
        .any(|t| t == to);

    if allowed {
        Ok(())
    } else {
        Err(Error::transition_denied(role, from, to))
    }
}
