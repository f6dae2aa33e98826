use coterie_agent::{Agent, BreakerConfig, CircuitBreaker};
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// One recorded task outcome, used for load accounting.
pub(crate) struct Outcome {
    pub at: Instant,
    pub success: bool,
}

/// A registered agent with its breaker and rolling outcome window.
pub(crate) struct AgentEntry {
    pub agent: Arc<dyn Agent>,
    pub name: String,
    pub capabilities: HashSet<String>,
    pub available: bool,
    pub breaker: Arc<CircuitBreaker>,
    pub outcomes: VecDeque<Outcome>,
    pub completed_total: u64,
}

impl AgentEntry {
    fn new(agent: Arc<dyn Agent>, breaker_config: BreakerConfig) -> Self {
        let name = agent.name().to_string();
        let capabilities = agent.capabilities().into_iter().collect();
        let breaker = Arc::new(CircuitBreaker::new(&name, breaker_config));
        Self {
            agent,
            name,
            capabilities,
            available: true,
            breaker,
            outcomes: VecDeque::new(),
            completed_total: 0,
        }
    }

    pub fn record_outcome(&mut self, success: bool) {
        self.outcomes.push_back(Outcome {
            at: Instant::now(),
            success,
        });
        if success {
            self.completed_total += 1;
        }
    }

    fn trim(&mut self, window: Duration) {
        let cutoff = Instant::now().checked_sub(window);
        if let Some(cutoff) = cutoff {
            while self.outcomes.front().is_some_and(|o| o.at < cutoff) {
                self.outcomes.pop_front();
            }
        }
    }

    /// Recent activity normalized to [0, 1]: outcomes within the trailing
    /// window divided by `normalization`, capped at 1.
    pub fn load_factor(&mut self, window: Duration, normalization: u32) -> f64 {
        self.trim(window);
        let recent = self.outcomes.len() as f64;
        (recent / f64::from(normalization.max(1))).min(1.0)
    }

    pub fn recent_outcomes(&mut self, window: Duration) -> usize {
        self.trim(window);
        self.outcomes.len()
    }
}

/// Per-agent load snapshot, part of the system status report.
#[derive(Debug, Clone, Serialize)]
pub struct AgentLoad {
    /// Agent name.
    pub name: String,
    /// Whether the agent accepts new work.
    pub available: bool,
    /// Capability tags.
    pub capabilities: Vec<String>,
    /// Current load factor in [0, 1].
    pub load_factor: f64,
}

/// Per-agent performance report.
#[derive(Debug, Clone, Serialize)]
pub struct AgentPerformance {
    /// Agent name.
    pub name: String,
    /// Successful task completions since registration.
    pub tasks_completed: u64,
    /// Task outcomes within the trailing load window.
    pub recent_outcomes: usize,
    /// Current load factor in [0, 1].
    pub load_factor: f64,
    /// Whether the agent accepts new work.
    pub available: bool,
}

/// Registration-ordered agent collection. Order is significant: scheduling
/// ties break toward the earliest registration.
pub(crate) struct AgentRegistry {
    entries: Vec<AgentEntry>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Register an agent. A duplicate name replaces the prior registration
    /// in place, keeping its position in the tie-break order.
    pub fn register(&mut self, agent: Arc<dyn Agent>, breaker_config: BreakerConfig) {
        let entry = AgentEntry::new(agent, breaker_config);
        info!(agent = %entry.name, capabilities = ?entry.capabilities, "agent registered");
        if let Some(existing) = self.entries.iter_mut().find(|e| e.name == entry.name) {
            *existing = entry;
        } else {
            self.entries.push(entry);
        }
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut AgentEntry> {
        self.entries.iter_mut().find(|e| e.name == name)
    }

    pub fn set_availability(&mut self, name: &str, available: bool) -> bool {
        if let Some(entry) = self.get_mut(name) {
            entry.available = available;
            true
        } else {
            false
        }
    }

    /// Whether any available agent advertises `kind`.
    pub fn has_capable(&self, kind: &str) -> bool {
        self.entries
            .iter()
            .any(|e| e.available && e.capabilities.contains(kind))
    }

    /// Pick the least-loaded available agent capable of `kind`. Ties break
    /// toward the earliest registration.
    pub fn select(
        &mut self,
        kind: &str,
        window: Duration,
        normalization: u32,
    ) -> Option<&mut AgentEntry> {
        let mut best: Option<(usize, f64)> = None;
        for (idx, entry) in self.entries.iter_mut().enumerate() {
            if !entry.available || !entry.capabilities.contains(kind) {
                continue;
            }
            let load = entry.load_factor(window, normalization);
            match best {
                Some((_, best_load)) if load >= best_load => {}
                _ => best = Some((idx, load)),
            }
        }
        best.map(|(idx, _)| &mut self.entries[idx])
    }

    pub fn loads(&mut self, window: Duration, normalization: u32) -> Vec<AgentLoad> {
        self.entries
            .iter_mut()
            .map(|e| AgentLoad {
                name: e.name.clone(),
                available: e.available,
                capabilities: e.capabilities.iter().cloned().collect(),
                load_factor: e.load_factor(window, normalization),
            })
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use coterie_core::{CoterieResult, TaskPayload};

    struct StubAgent {
        name: &'static str,
        capabilities: Vec<String>,
    }

    #[async_trait]
    impl Agent for StubAgent {
        fn name(&self) -> &str {
            self.name
        }

        fn capabilities(&self) -> Vec<String> {
            self.capabilities.clone()
        }

        async fn process(&self, _payload: TaskPayload) -> CoterieResult<serde_json::Value> {
            Ok(serde_json::Value::Null)
        }
    }

    fn stub(name: &'static str, caps: &[&str]) -> Arc<dyn Agent> {
        Arc::new(StubAgent {
            name,
            capabilities: caps.iter().map(|c| (*c).to_string()).collect(),
        })
    }

    const WINDOW: Duration = Duration::from_secs(3600);

    #[test]
    fn test_select_requires_capability() {
        let mut registry = AgentRegistry::new();
        registry.register(stub("coder", &["code"]), BreakerConfig::default());

        assert!(registry.select("code", WINDOW, 10).is_some());
        assert!(registry.select("planning", WINDOW, 10).is_none());
    }

    #[test]
    fn test_select_skips_unavailable() {
        let mut registry = AgentRegistry::new();
        registry.register(stub("coder", &["code"]), BreakerConfig::default());
        registry.set_availability("coder", false);
        assert!(registry.select("code", WINDOW, 10).is_none());
    }

    #[test]
    fn test_select_prefers_lowest_load() {
        let mut registry = AgentRegistry::new();
        registry.register(stub("busy", &["code"]), BreakerConfig::default());
        registry.register(stub("idle", &["code"]), BreakerConfig::default());

        for _ in 0..5 {
            registry.get_mut("busy").unwrap().record_outcome(true);
        }

        let selected = registry.select("code", WINDOW, 10).unwrap();
        assert_eq!(selected.name, "idle");
    }

    #[test]
    fn test_tie_breaks_by_registration_order() {
        let mut registry = AgentRegistry::new();
        registry.register(stub("first", &["code"]), BreakerConfig::default());
        registry.register(stub("second", &["code"]), BreakerConfig::default());

        let selected = registry.select("code", WINDOW, 10).unwrap();
        assert_eq!(selected.name, "first");
    }

    #[test]
    fn test_load_factor_normalized_and_capped() {
        let mut registry = AgentRegistry::new();
        registry.register(stub("a", &["code"]), BreakerConfig::default());
        let entry = registry.get_mut("a").unwrap();

        assert_eq!(entry.load_factor(WINDOW, 10), 0.0);
        for _ in 0..5 {
            entry.record_outcome(true);
        }
        assert!((entry.load_factor(WINDOW, 10) - 0.5).abs() < f64::EPSILON);
        for _ in 0..20 {
            entry.record_outcome(false);
        }
        assert_eq!(entry.load_factor(WINDOW, 10), 1.0);
    }

    #[test]
    fn test_window_trims_old_outcomes() {
        let mut registry = AgentRegistry::new();
        registry.register(stub("a", &["code"]), BreakerConfig::default());
        let entry = registry.get_mut("a").unwrap();

        entry.record_outcome(true);
        entry.record_outcome(true);
        std::thread::sleep(Duration::from_millis(20));
        entry.record_outcome(true);

        // A 10ms window only retains the last outcome.
        assert_eq!(entry.recent_outcomes(Duration::from_millis(10)), 1);
        assert_eq!(entry.completed_total, 3);
    }

    #[test]
    fn test_reregistration_replaces_in_place() {
        let mut registry = AgentRegistry::new();
        registry.register(stub("a", &["code"]), BreakerConfig::default());
        registry.register(stub("b", &["code"]), BreakerConfig::default());
        registry.register(stub("a", &["code", "review"]), BreakerConfig::default());

        let selected = registry.select("code", WINDOW, 10).unwrap();
        assert_eq!(selected.name, "a");
        assert!(registry.get_mut("a").unwrap().capabilities.contains("review"));
        assert_eq!(registry.loads(WINDOW, 10).len(), 2);
    }
}
