//! Order status state machine.
//!
//! Every status change goes through [`transition`]; callers pick the actor
//! from the caller's relation to the order (or `System` for the monitor).

use serde::{Deserialize, Serialize};
use std::fmt;

use super::types::{Order, OrderStatus, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    Customer,
    Performer,
    System,
}

impl Actor {
    /// Relation of `user` to `order`, if any
    pub fn of(order: &Order, user: &UserId) -> Option<Actor> {
        if order.customer_id == *user {
            Some(Actor::Customer)
        } else if order.performer_id == *user {
            Some(Actor::Performer)
        } else {
            None
        }
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::Customer => f.write_str("customer"),
            Actor::Performer => f.write_str("performer"),
            Actor::System => f.write_str("system"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderAction {
    Accept,
    Decline,
    Cancel,
    MarkDone,
    Approve,
    OpenDispute,
    Expire,
    AutoApprove,
    ResolveForPerformer,
    ResolveForCustomer,
}

impl OrderAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderAction::Accept => "accept",
            OrderAction::Decline => "decline",
            OrderAction::Cancel => "cancel",
            OrderAction::MarkDone => "mark_done",
            OrderAction::Approve => "approve",
            OrderAction::OpenDispute => "open_dispute",
            OrderAction::Expire => "expire",
            OrderAction::AutoApprove => "auto_approve",
            OrderAction::ResolveForPerformer => "resolve_for_performer",
            OrderAction::ResolveForCustomer => "resolve_for_customer",
        }
    }

    pub fn actor(&self) -> Actor {
        match self {
            OrderAction::Accept | OrderAction::Decline | OrderAction::MarkDone => {
                Actor::Performer
            }
            OrderAction::Cancel | OrderAction::Approve | OrderAction::OpenDispute => {
                Actor::Customer
            }
            OrderAction::Expire
            | OrderAction::AutoApprove
            | OrderAction::ResolveForPerformer
            | OrderAction::ResolveForCustomer => Actor::System,
        }
    }
}

impl fmt::Display for OrderAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("{actor} may not {action} an order")]
    NotPermitted { actor: Actor, action: OrderAction },
    #[error("cannot {action} an order in status {from}")]
    InvalidState {
        from: OrderStatus,
        action: OrderAction,
    },
}

/// Target status of `action` taken by `actor` on an order in `from`
pub fn transition(
    from: OrderStatus,
    action: OrderAction,
    actor: Actor,
) -> Result<OrderStatus, TransitionError> {
    if action.actor() != actor {
        return Err(TransitionError::NotPermitted { actor, action });
    }

    use OrderAction::*;
    use OrderStatus::*;
    let to = match (action, from) {
        (Accept, s) if s.is_pending() => Some(InProgress),
        (Decline, s) | (Cancel, s) if s.is_pending() => Some(Cancelled),
        (MarkDone, InProgress) => Some(CompletedPendingApproval),
        (Approve, CompletedPendingApproval) | (AutoApprove, CompletedPendingApproval) => {
            Some(Completed)
        }
        (OpenDispute, CompletedPendingApproval) => Some(Disputed),
        (Expire, s) if s.is_pending() || s == InProgress => Some(Expired),
        (ResolveForPerformer, Disputed) => Some(Completed),
        (ResolveForCustomer, Disputed) => Some(Cancelled),
        _ => None,
    };

    to.ok_or(TransitionError::InvalidState { from, action })
}
