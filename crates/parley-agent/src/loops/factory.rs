//! Strategy factory.
//!
//! Maps a strategy name to a constructor and caches one instance per
//! strategy; instances are safe to cache because they hold only immutable
//! references to their collaborators.  Aliases normalize to the canonical
//! name, and unknown names fall back to `react` with a warning.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::loops::act::ActLoop;
use crate::loops::agentic::AgenticLoop;
use crate::loops::react::ReactLoop;
use crate::loops::think_act::ThinkActLoop;
use crate::loops::{AgentLoop, LoopDeps};

type LoopConstructor = Box<dyn Fn(LoopDeps) -> Arc<dyn AgentLoop> + Send + Sync>;

/// Factory for agent loop instances.
///
/// New strategies can be added at runtime with
/// [`register_strategy`](Self::register_strategy) without touching
/// existing ones.
pub struct AgentLoopFactory {
    deps: LoopDeps,
    registry: HashMap<String, LoopConstructor>,
    cache: Mutex<HashMap<String, Arc<dyn AgentLoop>>>,
}

impl AgentLoopFactory {
    /// Create a factory with the built-in strategies registered.
    pub fn new(deps: LoopDeps) -> Self {
        let mut registry: HashMap<String, LoopConstructor> = HashMap::new();
        registry.insert(
            "react".into(),
            Box::new(|deps| Arc::new(ReactLoop::new(deps))),
        );
        registry.insert(
            "think-act".into(),
            Box::new(|deps| Arc::new(ThinkActLoop::new(deps))),
        );
        registry.insert("act".into(), Box::new(|deps| Arc::new(ActLoop::new(deps))));
        registry.insert(
            "agentic".into(),
            Box::new(|deps| Arc::new(AgenticLoop::new(deps))),
        );

        Self {
            deps,
            registry,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Normalize a requested name to its canonical registry key.
    fn canonical(strategy: &str) -> String {
        let normalized = strategy.trim().to_lowercase();
        match normalized.as_str() {
            "think_act" | "thinkact" => "think-act".to_owned(),
            _ => normalized,
        }
    }

    /// Create (or reuse) the loop for a strategy name.
    pub fn create(&self, strategy: &str) -> Arc<dyn AgentLoop> {
        let mut name = Self::canonical(strategy);

        if !self.registry.contains_key(&name) {
            tracing::warn!(
                strategy = %strategy,
                "unknown agent loop strategy, falling back to react"
            );
            name = "react".to_owned();
        }

        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(cached) = cache.get(&name) {
            tracing::debug!(strategy = %name, "using cached agent loop");
            return Arc::clone(cached);
        }

        let instance = self.registry[&name](self.deps.clone());
        cache.insert(name.clone(), Arc::clone(&instance));
        tracing::info!(strategy = %name, "created agent loop");
        instance
    }

    /// Register an additional strategy.
    pub fn register_strategy(
        &mut self,
        name: &str,
        constructor: impl Fn(LoopDeps) -> Arc<dyn AgentLoop> + Send + Sync + 'static,
    ) {
        let name = Self::canonical(name);
        tracing::info!(strategy = %name, "registered agent loop strategy");
        self.registry.insert(name, Box::new(constructor));
    }

    /// Canonical names of every registered strategy.
    pub fn available_strategies(&self) -> Vec<String> {
        let mut names: Vec<String> = self.registry.keys().cloned().collect();
        names.sort();
        names
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{ApprovalBroker, ElicitationBroker};
    use crate::executor::ToolExecutor;
    use async_trait::async_trait;
    use parley_kernel::ApprovalTimeouts;
    use parley_llm::{LlmCaller, LlmError, LlmStream, ToolChoice};
    use parley_kernel::{LlmResponse, Message};
    use serde_json::Value;

    struct NullCaller;

    #[async_trait]
    impl LlmCaller for NullCaller {
        async fn call_plain(
            &self,
            _: &str,
            _: &[Message],
            _: Option<f32>,
            _: Option<&str>,
        ) -> parley_llm::Result<String> {
            Err(LlmError::Internal("null".into()))
        }
        async fn call_with_tools(
            &self,
            _: &str,
            _: &[Message],
            _: &[Value],
            _: ToolChoice,
            _: Option<f32>,
            _: Option<&str>,
        ) -> parley_llm::Result<LlmResponse> {
            Err(LlmError::Internal("null".into()))
        }
        async fn call_with_rag(
            &self,
            _: &str,
            _: &[Message],
            _: &[String],
            _: &str,
            _: Option<f32>,
        ) -> parley_llm::Result<String> {
            Err(LlmError::Internal("null".into()))
        }
        async fn call_with_rag_and_tools(
            &self,
            _: &str,
            _: &[Message],
            _: &[String],
            _: &[Value],
            _: &str,
            _: ToolChoice,
            _: Option<f32>,
        ) -> parley_llm::Result<LlmResponse> {
            Err(LlmError::Internal("null".into()))
        }
        async fn stream_plain(
            &self,
            _: &str,
            _: &[Message],
            _: Option<f32>,
            _: Option<&str>,
        ) -> parley_llm::Result<LlmStream> {
            Err(LlmError::Internal("null".into()))
        }
        async fn stream_with_tools(
            &self,
            _: &str,
            _: &[Message],
            _: &[Value],
            _: ToolChoice,
            _: Option<f32>,
            _: Option<&str>,
        ) -> parley_llm::Result<LlmStream> {
            Err(LlmError::Internal("null".into()))
        }
        async fn stream_with_rag(
            &self,
            _: &str,
            _: &[Message],
            _: &[String],
            _: &str,
            _: Option<f32>,
        ) -> parley_llm::Result<LlmStream> {
            Err(LlmError::Internal("null".into()))
        }
        async fn stream_with_rag_and_tools(
            &self,
            _: &str,
            _: &[Message],
            _: &[String],
            _: &[Value],
            _: &str,
            _: ToolChoice,
            _: Option<f32>,
        ) -> parley_llm::Result<LlmStream> {
            Err(LlmError::Internal("null".into()))
        }
    }

    fn deps() -> LoopDeps {
        let approvals = Arc::new(ApprovalBroker::new());
        let elicitations = Arc::new(ElicitationBroker::new());
        struct NoRuntime;
        #[async_trait]
        impl crate::runtime::ToolRuntime for NoRuntime {
            fn tool_descriptor(
                &self,
                _: &str,
            ) -> Option<parley_mcp::protocol::ToolDescriptor> {
                None
            }
            fn tools_schema(&self, _: &[String]) -> Vec<Value> {
                Vec::new()
            }
            async fn servers_digest(&self) -> Value {
                serde_json::json!({"available_servers": []})
            }
            async fn requires_admin_approval(&self, _: &str) -> bool {
                false
            }
            async fn execute_tool(
                &self,
                call: &parley_kernel::ToolCall,
                _: Option<&str>,
                _: Option<Arc<dyn parley_kernel::EventSink>>,
                _: Option<Arc<dyn parley_mcp::ElicitationHandler>>,
            ) -> parley_mcp::Result<parley_kernel::ToolResult> {
                Ok(parley_kernel::ToolResult::ok(&call.id, "{}"))
            }
        }
        let runtime: Arc<dyn crate::runtime::ToolRuntime> = Arc::new(NoRuntime);
        let executor = Arc::new(ToolExecutor::new(
            Arc::clone(&runtime),
            approvals,
            elicitations,
        ));
        LoopDeps {
            llm: Arc::new(NullCaller),
            runtime: Some(runtime),
            executor,
            control: None,
            timeouts: ApprovalTimeouts::default(),
        }
    }

    #[test]
    fn known_strategies_resolve() {
        let factory = AgentLoopFactory::new(deps());
        assert_eq!(factory.create("act").strategy(), "act");
        assert_eq!(factory.create("react").strategy(), "react");
        assert_eq!(factory.create("agentic").strategy(), "agentic");
        assert_eq!(factory.create("think-act").strategy(), "think-act");
    }

    #[test]
    fn aliases_normalize() {
        let factory = AgentLoopFactory::new(deps());
        assert_eq!(factory.create("think_act").strategy(), "think-act");
        assert_eq!(factory.create("thinkact").strategy(), "think-act");
        assert_eq!(factory.create("  React ").strategy(), "react");
    }

    #[test]
    fn unknown_strategy_falls_back_to_react() {
        let factory = AgentLoopFactory::new(deps());
        assert_eq!(factory.create("quantum-leap").strategy(), "react");
    }

    #[test]
    fn instances_are_cached() {
        let factory = AgentLoopFactory::new(deps());
        let first = factory.create("agentic");
        let second = factory.create("agentic");
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn available_strategies_lists_canonical_names() {
        let factory = AgentLoopFactory::new(deps());
        assert_eq!(
            factory.available_strategies(),
            vec!["act", "agentic", "react", "think-act"]
        );
    }
}
