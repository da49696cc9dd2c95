// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Router
//!
//! Maps a logical queue name onto a handler capability. When a queue prefix is
//! configured the first dot-delimited segment of the name is dropped before
//! matching, then the remainder is lower-cased and looked up in [`ROUTES`]: exact
//! patterns first, prefix patterns after.
//!
//! Names that match nothing are acknowledged as a no-op so that unknown routes
//! cannot turn into poison-message loops.

use crate::{
    errors::AmqpError,
    handler::{ConsumerHandler, ConsumerMessage},
};
use opentelemetry::Context;
use std::{collections::HashMap, fmt, sync::Arc};
use tracing::{debug, warn};

/// Business capabilities a queue can be routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Settlement,
    SettlementRollback,
    Closure,
    Approval,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::Settlement => "settlement",
            Capability::SettlementRollback => "settlement_rollback",
            Capability::Closure => "closure",
            Capability::Approval => "approval",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteMatch {
    Exact,
    Prefix,
}

/// The routing table.
///
/// Both the `bet_`-qualified action names used by deployed producers and their
/// short forms resolve. Every exact pattern is tried before any prefix pattern, so
/// `bet_settlement_rollback` reaches [`Capability::SettlementRollback`].
pub const ROUTES: [(&str, RouteMatch, Capability); 12] = [
    ("bet_settlement", RouteMatch::Exact, Capability::Settlement),
    ("bet_settlement_rollback", RouteMatch::Exact, Capability::SettlementRollback),
    ("rollback_bet_settlement", RouteMatch::Exact, Capability::SettlementRollback),
    ("bet_closure", RouteMatch::Exact, Capability::Closure),
    ("bet_approval", RouteMatch::Exact, Capability::Approval),
    ("settlement", RouteMatch::Exact, Capability::Settlement),
    ("settlement_rollback", RouteMatch::Exact, Capability::SettlementRollback),
    ("rollback_settlement", RouteMatch::Exact, Capability::SettlementRollback),
    ("closure", RouteMatch::Exact, Capability::Closure),
    ("approval", RouteMatch::Exact, Capability::Approval),
    ("bet_settlement", RouteMatch::Prefix, Capability::Settlement),
    ("settlement", RouteMatch::Prefix, Capability::Settlement),
];

/// Outcome of a successful dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    Handled(Capability),
    /// No handler for the normalized route; the message is dropped.
    Unmatched(String),
}

/// Dispatches consumed messages to the handler registered for their capability.
#[derive(Clone, Default)]
pub struct MessageRouter {
    prefix: String,
    handlers: HashMap<Capability, Arc<dyn ConsumerHandler>>,
}

impl MessageRouter {
    /// Creates a router with no handlers.
    ///
    /// # Parameters
    /// * `prefix` - Queue prefix marker; when non-empty the first dot-delimited
    ///   segment of every queue name is dropped before matching
    pub fn new(prefix: &str) -> MessageRouter {
        MessageRouter {
            prefix: prefix.trim().to_owned(),
            handlers: HashMap::default(),
        }
    }

    /// Registers `handler` for `capability`, replacing any previous one.
    pub fn register(mut self, capability: Capability, handler: Arc<dyn ConsumerHandler>) -> Self {
        self.handlers.insert(capability, handler);
        self
    }

    /// Strips the prefix segment (when configured) and lower-cases the name.
    pub fn normalize(&self, queue_name: &str) -> String {
        let route = match queue_name.split_once('.') {
            Some((_, rest)) if !self.prefix.is_empty() => rest,
            _ => queue_name,
        };

        route.to_lowercase()
    }

    /// Looks up the capability of a normalized route.
    ///
    /// # Parameters
    /// * `route` - Queue name as returned by [`MessageRouter::normalize`]
    ///
    /// # Returns
    /// The capability of the first exact match, else of the first prefix match,
    /// else `None`
    pub fn resolve(route: &str) -> Option<Capability> {
        let exact = ROUTES
            .iter()
            .find(|(pattern, kind, _)| *kind == RouteMatch::Exact && route == *pattern);

        exact
            .or_else(|| {
                ROUTES.iter().find(|(pattern, kind, _)| {
                    *kind == RouteMatch::Prefix && route.starts_with(*pattern)
                })
            })
            .map(|(_, _, capability)| *capability)
    }

    /// Runs the handler matching the queue of `msg`.
    ///
    /// # Parameters
    /// * `ctx` - Trace context extracted from the delivery
    /// * `msg` - The consumed message
    ///
    /// # Returns
    /// The matched capability, [`Routed::Unmatched`] when no handler applies, or the
    /// handler's error
    pub async fn dispatch(&self, ctx: &Context, msg: &ConsumerMessage) -> Result<Routed, AmqpError> {
        let route = self.normalize(&msg.queue);

        let Some(capability) = MessageRouter::resolve(&route) else {
            warn!(queue = msg.queue.as_str(), route = route.as_str(), "no route for queue");
            return Ok(Routed::Unmatched(route));
        };

        let Some(handler) = self.handlers.get(&capability) else {
            warn!(
                queue = msg.queue.as_str(),
                capability = %capability,
                "no handler registered"
            );
            return Ok(Routed::Unmatched(route));
        };

        debug!(queue = msg.queue.as_str(), capability = %capability, "routing message");
        handler.exec(ctx, msg).await?;

        Ok(Routed::Handled(capability))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::MockConsumerHandler;

    #[test]
    fn normalize_keeps_name_without_prefix() {
        let router = MessageRouter::new("");

        assert_eq!(router.normalize("Bet.Approval"), "bet.approval");
    }

    #[test]
    fn normalize_strips_first_segment_with_prefix() {
        let router = MessageRouter::new("ussd");

        assert_eq!(router.normalize("BET.Approval"), "approval");
        assert_eq!(router.normalize("ussd.bet.closure"), "bet.closure");
        assert_eq!(router.normalize("closure"), "closure");
    }

    #[test]
    fn resolve_prefers_exact_matches() {
        assert_eq!(
            MessageRouter::resolve("settlement"),
            Some(Capability::Settlement)
        );
        assert_eq!(
            MessageRouter::resolve("settlement_rollback"),
            Some(Capability::SettlementRollback)
        );
        assert_eq!(
            MessageRouter::resolve("rollback_settlement"),
            Some(Capability::SettlementRollback)
        );
        assert_eq!(
            MessageRouter::resolve("settlement_jackpot"),
            Some(Capability::Settlement)
        );
        assert_eq!(MessageRouter::resolve("closure"), Some(Capability::Closure));
        assert_eq!(MessageRouter::resolve("approval"), Some(Capability::Approval));
        assert_eq!(MessageRouter::resolve("bet.approval"), None);
        assert_eq!(MessageRouter::resolve("refund"), None);
    }

    #[test]
    fn resolve_accepts_bet_qualified_actions() {
        let router = MessageRouter::new("ussd");
        let resolved = |queue: &str| MessageRouter::resolve(&router.normalize(queue));

        assert_eq!(resolved("mobile.bet_settlement"), Some(Capability::Settlement));
        assert_eq!(
            resolved("mobile.bet_settlement_rollback"),
            Some(Capability::SettlementRollback)
        );
        assert_eq!(
            resolved("mobile.rollback_bet_settlement"),
            Some(Capability::SettlementRollback)
        );
        assert_eq!(resolved("mobile.bet_closure"), Some(Capability::Closure));
        assert_eq!(resolved("mobile.bet_approval"), Some(Capability::Approval));
        assert_eq!(
            resolved("mobile.bet_settlement_jackpot"),
            Some(Capability::Settlement)
        );
    }

    #[tokio::test]
    async fn dispatch_reaches_handler_of_bet_qualified_queue() {
        let mut handler = MockConsumerHandler::new();
        handler
            .expect_exec()
            .withf(|_, msg| msg.queue == "mobile.bet_closure")
            .times(1)
            .returning(|_, _| Ok(()));
        let router = MessageRouter::new("ussd").register(Capability::Closure, Arc::new(handler));

        let routed = router
            .dispatch(&Context::new(), &ConsumerMessage::new("mobile.bet_closure", b"{}"))
            .await;

        assert_eq!(routed, Ok(Routed::Handled(Capability::Closure)));
    }

    #[tokio::test]
    async fn dispatch_runs_the_registered_handler() {
        let mut handler = MockConsumerHandler::new();
        handler
            .expect_exec()
            .withf(|_, msg| msg.queue == "bet.approval")
            .times(1)
            .returning(|_, _| Ok(()));
        let router = MessageRouter::new("ussd").register(Capability::Approval, Arc::new(handler));

        let routed = router
            .dispatch(&Context::new(), &ConsumerMessage::new("bet.approval", b"{}"))
            .await;

        assert_eq!(routed, Ok(Routed::Handled(Capability::Approval)));
    }

    #[tokio::test]
    async fn dispatch_propagates_handler_errors() {
        let mut handler = MockConsumerHandler::new();
        handler
            .expect_exec()
            .returning(|_, _| Err(AmqpError::HandlerError("wallet down".to_owned())));
        let router = MessageRouter::new("ussd").register(Capability::Closure, Arc::new(handler));

        let routed = router
            .dispatch(&Context::new(), &ConsumerMessage::new("bet.closure", b"{}"))
            .await;

        assert_eq!(routed, Err(AmqpError::HandlerError("wallet down".to_owned())));
    }

    #[tokio::test]
    async fn unmatched_routes_are_a_no_op() {
        let mut handler = MockConsumerHandler::new();
        handler.expect_exec().never();
        let router = MessageRouter::new("ussd").register(Capability::Approval, Arc::new(handler));

        let unknown = router
            .dispatch(&Context::new(), &ConsumerMessage::new("bet.refund", b"{}"))
            .await;
        let unregistered = router
            .dispatch(&Context::new(), &ConsumerMessage::new("bet.closure", b"{}"))
            .await;

        assert_eq!(unknown, Ok(Routed::Unmatched("refund".to_owned())));
        assert_eq!(unregistered, Ok(Routed::Unmatched("closure".to_owned())));
    }
}
