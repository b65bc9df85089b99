//! Callback routing for server-originated messages.
//!
//! Progress, log, elicitation, and sampling callbacks arrive on the
//! transport's reader task, not on the task that invoked the tool.
//! Task-local storage therefore cannot associate them with the in-flight
//! call; instead a process-scoped concurrent map keyed by
//! `(server, tool_call_id)` holds the sinks for every in-flight call.
//! Entries are inserted before the call and removed by a guard when the
//! call completes or errors.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use parley_kernel::{ElicitationAction, EventSink, Message};

// ---------------------------------------------------------------------------
// Handler contracts
// ---------------------------------------------------------------------------

/// An elicitation prompt forwarded from a tool server.
#[derive(Debug, Clone)]
pub struct ElicitationPrompt {
    pub tool_call_id: String,
    pub tool_name: String,
    pub message: String,
    pub response_schema: Value,
}

/// The user's reply to an elicitation prompt.
#[derive(Debug, Clone)]
pub struct ElicitationOutcome {
    pub action: ElicitationAction,
    pub content: Option<Value>,
}

impl ElicitationOutcome {
    /// The reply used when nobody can answer (no routing context, timeout).
    pub fn cancelled() -> Self {
        Self {
            action: ElicitationAction::Cancel,
            content: None,
        }
    }
}

/// Answers elicitation prompts by asking the user.  Implemented by the
/// approval/elicitation broker in the agent crate.
#[async_trait]
pub trait ElicitationHandler: Send + Sync {
    async fn elicit(&self, prompt: ElicitationPrompt) -> ElicitationOutcome;
}

/// A sampling request: the server asks the host to run an LLM call on its
/// behalf.
#[derive(Debug, Clone)]
pub struct SamplingRequest {
    pub messages: Vec<Message>,
    pub system_prompt: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: u32,
    /// Model names the server would prefer, best first.
    pub model_preferences: Vec<String>,
}

/// The host's answer to a sampling request.
#[derive(Debug, Clone)]
pub struct SamplingReply {
    pub content: String,
    pub model: String,
}

/// Runs LLM calls on behalf of tool servers.
#[async_trait]
pub trait SamplingHandler: Send + Sync {
    async fn sample(
        &self,
        request: SamplingRequest,
    ) -> std::result::Result<SamplingReply, String>;
}

// ---------------------------------------------------------------------------
// Routing table
// ---------------------------------------------------------------------------

/// The sinks registered for one in-flight tool call.
pub struct CallSinks {
    pub tool_call_id: String,
    pub tool_name: String,
    /// Receives progress and log events; absent when the caller has no UI.
    pub events: Option<Arc<dyn EventSink>>,
    pub elicitation: Option<Arc<dyn ElicitationHandler>>,
    pub sampling: Option<Arc<dyn SamplingHandler>>,
}

/// Concurrent `(server, tool_call_id) -> sinks` table shared between the
/// manager and every transport reader task.
#[derive(Clone, Default)]
pub struct CallbackRouter {
    inner: Arc<DashMap<(String, String), Arc<CallSinks>>>,
}

impl CallbackRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register sinks for a call, returning a guard that removes the entry
    /// on drop.
    pub fn register(
        &self,
        server: impl Into<String>,
        sinks: CallSinks,
    ) -> RoutingGuard {
        let key = (server.into(), sinks.tool_call_id.clone());
        self.inner.insert(key.clone(), Arc::new(sinks));
        RoutingGuard {
            router: self.clone(),
            key,
        }
    }

    /// Exact lookup by server and call id.
    pub fn get(&self, server: &str, tool_call_id: &str) -> Option<Arc<CallSinks>> {
        self.inner
            .get(&(server.to_owned(), tool_call_id.to_owned()))
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Any in-flight call for the server.  Used for callbacks that carry no
    /// call correlation of their own (logs, elicitation on servers that do
    /// not echo the token).
    pub fn any_for_server(&self, server: &str) -> Option<Arc<CallSinks>> {
        self.inner
            .iter()
            .find(|entry| entry.key().0 == server)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Number of registered in-flight calls (test/diagnostic aid).
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Removes the routing entry when the tool call finishes, normally or not.
pub struct RoutingGuard {
    router: CallbackRouter,
    key: (String, String),
}

impl Drop for RoutingGuard {
    fn drop(&mut self) {
        self.router.inner.remove(&self.key);
        tracing::trace!(server = %self.key.0, tool_call_id = %self.key.1, "routing entry removed");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sinks(id: &str) -> CallSinks {
        CallSinks {
            tool_call_id: id.to_owned(),
            tool_name: "srv_tool".to_owned(),
            events: None,
            elicitation: None,
            sampling: None,
        }
    }

    #[test]
    fn register_lookup_and_guard_cleanup() {
        let router = CallbackRouter::new();
        {
            let _guard = router.register("srv", sinks("call_1"));
            assert!(router.get("srv", "call_1").is_some());
            assert!(router.get("srv", "call_2").is_none());
            assert!(router.any_for_server("srv").is_some());
            assert_eq!(router.len(), 1);
        }
        // Guard dropped: entry gone.
        assert!(router.get("srv", "call_1").is_none());
        assert!(router.is_empty());
    }

    #[test]
    fn concurrent_calls_do_not_collide() {
        let router = CallbackRouter::new();
        let _g1 = router.register("srv", sinks("call_a"));
        let _g2 = router.register("srv", sinks("call_b"));
        assert_eq!(router.len(), 2);
        assert_eq!(router.get("srv", "call_a").unwrap().tool_call_id, "call_a");
        assert_eq!(router.get("srv", "call_b").unwrap().tool_call_id, "call_b");
    }
}
