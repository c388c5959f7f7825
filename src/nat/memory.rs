use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Result};

use super::{NatTable, RuleSpec};

const BUILTIN_CHAINS: [&str; 4] = ["PREROUTING", "INPUT", "OUTPUT", "POSTROUTING"];

#[derive(Debug, Default)]
struct MemoryState {
    chains: BTreeMap<String, Vec<RuleSpec>>,
    fail_appends_containing: Option<String>,
    fail_deletes: bool,
    mutations: u64,
}

#[derive(Debug)]
pub struct MemoryNatTable {
    state: Mutex<MemoryState>,
}

impl Default for MemoryNatTable {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNatTable {
    pub fn new() -> Self {
        let chains = BUILTIN_CHAINS
            .iter()
            .map(|chain| (chain.to_string(), Vec::new()))
            .collect();
        Self {
            state: Mutex::new(MemoryState {
                chains,
                ..MemoryState::default()
            }),
        }
    }

    pub fn insert_chain(&self, chain: &str) {
        self.lock().chains.entry(chain.to_string()).or_default();
    }

    /// Seeds a rule without counting it as a mutation.
    pub fn insert_rule(&self, chain: &str, rule: RuleSpec) {
        self.lock()
            .chains
            .entry(chain.to_string())
            .or_default()
            .push(rule);
    }

    pub fn fail_appends_containing(&self, needle: &str) {
        self.lock().fail_appends_containing = Some(needle.to_string());
    }

    pub fn fail_deletes(&self) {
        self.lock().fail_deletes = true;
    }

    pub fn mutations(&self) -> u64 {
        self.lock().mutations
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl NatTable for MemoryNatTable {
    fn chain_exists(&self, chain: &str) -> Result<bool> {
        Ok(self.lock().chains.contains_key(chain))
    }

    fn new_chain(&self, chain: &str) -> Result<()> {
        let mut state = self.lock();
        if state.chains.contains_key(chain) {
            return Err(anyhow!("chain {} already exists", chain));
        }
        state.chains.insert(chain.to_string(), Vec::new());
        state.mutations += 1;
        Ok(())
    }

    fn rule_exists(&self, chain: &str, rule: &RuleSpec) -> Result<bool> {
        let state = self.lock();
        let rules = state
            .chains
            .get(chain)
            .ok_or_else(|| anyhow!("no chain named {}", chain))?;
        Ok(rules.contains(rule))
    }

    fn append(&self, chain: &str, rule: &RuleSpec) -> Result<()> {
        let mut state = self.lock();
        if let Some(needle) = state.fail_appends_containing.as_deref() {
            if rule.to_string().contains(needle) {
                return Err(anyhow!("injected append failure for '{}'", rule));
            }
        }
        let rules = state
            .chains
            .get_mut(chain)
            .ok_or_else(|| anyhow!("no chain named {}", chain))?;
        rules.push(rule.clone());
        state.mutations += 1;
        Ok(())
    }

    fn list_rules(&self, chain: &str) -> Result<Vec<RuleSpec>> {
        self.lock()
            .chains
            .get(chain)
            .cloned()
            .ok_or_else(|| anyhow!("no chain named {}", chain))
    }

    fn delete(&self, chain: &str, rule: &RuleSpec) -> Result<()> {
        let mut state = self.lock();
        if state.fail_deletes {
            return Err(anyhow!("injected delete failure for '{}'", rule));
        }
        let rules = state
            .chains
            .get_mut(chain)
            .ok_or_else(|| anyhow!("no chain named {}", chain))?;
        let index = rules
            .iter()
            .position(|candidate| candidate == rule)
            .ok_or_else(|| anyhow!("rule '{}' does not exist in {}", rule, chain))?;
        rules.remove(index);
        state.mutations += 1;
        Ok(())
    }
}
