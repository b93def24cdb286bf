//! Write-through persistence for learned workspace/global policy rules.
//!
//! The core treats persistence as an abstract key-value concern: rules are
//! appended through [`RuleStore`] and re-read only at startup. Whether rules
//! survive a server restart is entirely a property of the injected store;
//! the in-memory implementation below does not persist.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::policy::PolicyRule;

/// Learned rules as loaded from the store at startup.
#[derive(Debug, Clone, Default)]
pub struct PersistedRules {
    pub workspace: HashMap<String, Vec<PolicyRule>>,
    pub global: Vec<PolicyRule>,
}

#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn load(&self) -> Result<PersistedRules>;

    async fn append_workspace(&self, workspace_id: &str, rule: PolicyRule) -> Result<()>;

    async fn append_global(&self, rule: PolicyRule) -> Result<()>;
}

/// Keeps learned rules for the lifetime of the process only.
#[derive(Default)]
pub struct MemoryRuleStore {
    rules: Mutex<PersistedRules>,
}

#[async_trait]
impl RuleStore for MemoryRuleStore {
    async fn load(&self) -> Result<PersistedRules> {
        Ok(self.rules.lock().await.clone())
    }

    async fn append_workspace(&self, workspace_id: &str, rule: PolicyRule) -> Result<()> {
        let mut rules = self.rules.lock().await;
        rules
            .workspace
            .entry(workspace_id.to_string())
            .or_default()
            .push(rule);
        Ok(())
    }

    async fn append_global(&self, rule: PolicyRule) -> Result<()> {
        self.rules.lock().await.global.push(rule);
        Ok(())
    }
}
