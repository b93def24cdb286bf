//! Classifies tool calls as `allow`, `deny` or `ask`.
//!
//! Rules are evaluated in a fixed order: the immutable hard-deny classes,
//! session-scoped learned rules, workspace-scoped rules, global rules, and
//! finally the static tool-class registry. First match wins. Evaluation
//! never fails; malformed input is denied outright.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use oppi_protocol::ApprovalScope;
use oppi_protocol::RiskLevel;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use wildmatch::WildMatch;

use crate::config::PolicyConfig;
use crate::error::OppiErr;
use crate::error::Result;
use crate::hard_deny;
use crate::rule_store::RuleStore;

/// Decision attached to a policy rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Allow,
    Deny,
    Ask,
}

/// An ordered match pattern → decision, learned from user approvals or
/// provided by configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Glob over the tool name.
    pub tool: String,

    /// Optional glob over the rendered shell command. Rules carrying a
    /// command pattern never match non-shell calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    pub action: RuleAction,
    pub risk: RiskLevel,
}

impl PolicyRule {
    fn matches(&self, profile: &CallProfile) -> bool {
        if !WildMatch::new(&self.tool).matches(&profile.tool) {
            return false;
        }
        match &self.command {
            None => true,
            Some(pattern) => profile
                .command_string
                .as_deref()
                .is_some_and(|command| WildMatch::new(pattern).matches(command)),
        }
    }

    fn describe(&self) -> String {
        match &self.command {
            Some(command) => format!("{} [{command}]", self.tool),
            None => self.tool.clone(),
        }
    }
}

/// Outcome of a policy evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyVerdict {
    pub action: RuleAction,
    pub reason: String,
    pub risk: RiskLevel,
    /// Human-readable description of the rule that decided, if any.
    pub matched_rule: Option<String>,
}

impl PolicyVerdict {
    fn malformed() -> Self {
        Self {
            action: RuleAction::Deny,
            reason: "malformed".to_string(),
            risk: RiskLevel::Critical,
            matched_rule: None,
        }
    }
}

/// Built-in classification of known tools. Anything else is `Unknown` and
/// defaults to `ask`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ToolClass {
    ReadOnly,
    Compute,
    Write,
    Delete,
    Network,
    Install,
    Shell,
    Unknown,
}

fn classify_tool(tool: &str) -> ToolClass {
    match tool {
        "read_file" | "read_many_files" | "list_dir" | "glob" | "grep" | "stat" | "view_diff" => {
            ToolClass::ReadOnly
        }
        "think" | "plan_update" | "math" => ToolClass::Compute,
        "write_file" | "edit_file" | "create_file" | "apply_patch" | "move_file" => {
            ToolClass::Write
        }
        "delete_file" | "delete_dir" => ToolClass::Delete,
        "fetch" | "http_request" | "web_search" | "download" => ToolClass::Network,
        "install_package" | "pip_install" | "npm_install" | "cargo_add" => ToolClass::Install,
        "bash" | "shell" | "exec" | "run_command" | "container.exec" => ToolClass::Shell,
        _ => ToolClass::Unknown,
    }
}

/// A tool call parsed just far enough for rule matching and the hard-deny
/// checks. `None` from [`CallProfile::parse`] means the input was malformed.
struct CallProfile {
    tool: String,
    class: ToolClass,
    /// Exec-style argv for shell calls given as an array.
    argv: Option<Vec<String>>,
    /// Raw script for shell calls given as a single string.
    script: Option<String>,
    /// Target path for file-class calls, when present.
    path: Option<String>,
    /// Rendering used for rule matching and display summaries.
    command_string: Option<String>,
}

impl CallProfile {
    fn parse(tool: &str, input: &Value) -> Option<Self> {
        let object = input.as_object()?;
        let class = classify_tool(tool);

        let mut argv = None;
        let mut script = None;
        let mut command_string = None;
        if class == ToolClass::Shell {
            match object.get("command") {
                Some(Value::String(raw)) => {
                    command_string = Some(raw.clone());
                    script = Some(raw.clone());
                }
                Some(Value::Array(items)) => {
                    let words: Option<Vec<String>> = items
                        .iter()
                        .map(|item| item.as_str().map(str::to_owned))
                        .collect();
                    let words = words?;
                    command_string = shlex::try_join(words.iter().map(String::as_str)).ok();
                    argv = Some(words);
                }
                _ => return None,
            }
        }

        let path = object
            .get("path")
            .or_else(|| object.get("file_path"))
            .and_then(Value::as_str)
            .map(str::to_owned);

        Some(Self {
            tool: tool.to_string(),
            class,
            argv,
            script,
            path,
            command_string,
        })
    }

    fn hard_deny(&self) -> Option<&'static str> {
        match self.class {
            ToolClass::Shell => {
                if let Some(argv) = &self.argv {
                    hard_deny::hard_deny_command(argv)
                } else if let Some(script) = &self.script {
                    hard_deny::hard_deny_script(script)
                } else {
                    None
                }
            }
            ToolClass::Write => self
                .path
                .as_deref()
                .and_then(hard_deny::hard_deny_write_path),
            ToolClass::Delete => self
                .path
                .as_deref()
                .and_then(hard_deny::hard_deny_delete_path),
            _ => None,
        }
    }

    fn summary(&self) -> String {
        match (&self.command_string, &self.path) {
            (Some(command), _) => format!("{} {command}", self.tool),
            (None, Some(path)) => format!("{} {path}", self.tool),
            (None, None) => self.tool.clone(),
        }
    }
}

/// Render the short human-readable summary the gate attaches to permission
/// requests.
pub fn display_summary(tool: &str, input: &Value) -> String {
    match CallProfile::parse(tool, input) {
        Some(profile) => profile.summary(),
        None => tool.to_string(),
    }
}

/// Read-only commands that never need approval, mirrored by the shell-class
/// default. Commands with shell metacharacters are never allow-listed.
fn is_read_only_command(argv: &[String]) -> bool {
    let cmd0 = argv.first().map(String::as_str);
    match cmd0 {
        Some(
            "cat" | "cd" | "echo" | "grep" | "head" | "ls" | "pwd" | "rg" | "tail" | "wc"
            | "which",
        ) => true,
        Some("find") => !argv.iter().any(|arg| {
            matches!(
                arg.as_str(),
                "-exec" | "-execdir" | "-ok" | "-okdir" | "-delete" | "-fls" | "-fprint"
                    | "-fprint0" | "-fprintf"
            )
        }),
        Some("git") => matches!(
            argv.get(1).map(String::as_str),
            Some("branch" | "status" | "log" | "diff" | "show")
        ),
        Some("cargo") if argv.get(1).map(String::as_str) == Some("check") => true,
        _ => false,
    }
}

fn shell_argv(profile: &CallProfile) -> Option<Vec<String>> {
    if let Some(argv) = &profile.argv {
        return Some(argv.clone());
    }
    let script = profile.script.as_deref()?;
    if script.contains(['|', ';', '&', '>', '<', '$', '`', '(', ')']) {
        return None;
    }
    shlex::split(script)
}

fn looks_destructive(argv: &[String]) -> bool {
    argv.iter().any(|arg| {
        matches!(
            arg.as_str(),
            "rm" | "sudo" | "chmod" | "chown" | "mkfs" | "dd" | "shutdown" | "reboot"
        )
    })
}

/// Learned rules shared across sessions. Readers take a stable snapshot;
/// writers produce a new snapshot and atomically publish it.
#[derive(Debug, Clone, Default)]
struct RuleSet {
    workspace: HashMap<String, Vec<PolicyRule>>,
    global: Vec<PolicyRule>,
}

struct SessionRules {
    workspace_id: String,
    rules: Vec<PolicyRule>,
}

pub struct PolicyEngine {
    config: PolicyConfig,
    store: Arc<dyn RuleStore>,
    shared: Mutex<Arc<RuleSet>>,
    sessions: Mutex<HashMap<String, SessionRules>>,
}

// Poisoned mutex should fail the program
#[allow(clippy::unwrap_used)]
impl PolicyEngine {
    pub async fn new(config: PolicyConfig, store: Arc<dyn RuleStore>) -> Result<Self> {
        let persisted = store.load().await?;
        let shared = RuleSet {
            workspace: persisted.workspace,
            global: persisted.global,
        };
        Ok(Self {
            config,
            store,
            shared: Mutex::new(Arc::new(shared)),
            sessions: Mutex::new(HashMap::new()),
        })
    }

    /// Bind a session to its workspace so workspace-scoped rules apply.
    pub fn register_session(&self, session_id: &str, workspace_id: &str) {
        self.sessions.lock().unwrap().insert(
            session_id.to_string(),
            SessionRules {
                workspace_id: workspace_id.to_string(),
                rules: Vec::new(),
            },
        );
    }

    pub fn unregister_session(&self, session_id: &str) {
        self.sessions.lock().unwrap().remove(session_id);
    }

    /// Classify one tool call. Never fails: malformed input is denied with
    /// risk `critical`.
    pub fn evaluate(&self, session_id: &str, tool: &str, input: &Value) -> PolicyVerdict {
        let Some(profile) = CallProfile::parse(tool, input) else {
            return PolicyVerdict::malformed();
        };

        if let Some(reason) = profile.hard_deny() {
            return PolicyVerdict {
                action: RuleAction::Deny,
                reason: reason.to_string(),
                risk: RiskLevel::Critical,
                matched_rule: Some("hard_deny".to_string()),
            };
        }

        let workspace_id = {
            let sessions = self.sessions.lock().unwrap();
            let Some(session) = sessions.get(session_id) else {
                // Unregistered sessions still get hard-deny and defaults,
                // but no learned rules.
                return self.default_verdict(&profile);
            };
            if let Some(rule) = session.rules.iter().find(|rule| rule.matches(&profile)) {
                return Self::rule_verdict(rule, "session");
            }
            session.workspace_id.clone()
        };

        let snapshot = self.shared.lock().unwrap().clone();
        if let Some(rules) = snapshot.workspace.get(&workspace_id) {
            if let Some(rule) = rules.iter().find(|rule| rule.matches(&profile)) {
                return Self::rule_verdict(rule, "workspace");
            }
        }
        if let Some(rule) = snapshot.global.iter().find(|rule| rule.matches(&profile)) {
            return Self::rule_verdict(rule, "global");
        }

        self.default_verdict(&profile)
    }

    /// Append a learned rule at the given scope. `Once` is a no-op.
    pub async fn learn(
        &self,
        session_id: &str,
        rule: PolicyRule,
        scope: ApprovalScope,
    ) -> Result<()> {
        match scope {
            ApprovalScope::Once => Ok(()),
            ApprovalScope::Session => {
                let mut sessions = self.sessions.lock().unwrap();
                let session = sessions
                    .get_mut(session_id)
                    .ok_or_else(|| OppiErr::SessionNotFound(session_id.to_string()))?;
                session.rules.push(rule);
                Ok(())
            }
            ApprovalScope::Workspace => {
                let workspace_id = {
                    let sessions = self.sessions.lock().unwrap();
                    sessions
                        .get(session_id)
                        .map(|session| session.workspace_id.clone())
                        .ok_or_else(|| OppiErr::SessionNotFound(session_id.to_string()))?
                };
                {
                    let mut shared = self.shared.lock().unwrap();
                    let mut next = RuleSet::clone(&shared);
                    next.workspace
                        .entry(workspace_id.clone())
                        .or_default()
                        .push(rule.clone());
                    *shared = Arc::new(next);
                }
                self.store.append_workspace(&workspace_id, rule).await
            }
            ApprovalScope::Global => {
                {
                    let mut shared = self.shared.lock().unwrap();
                    let mut next = RuleSet::clone(&shared);
                    next.global.push(rule.clone());
                    *shared = Arc::new(next);
                }
                self.store.append_global(rule).await
            }
        }
    }

    fn rule_verdict(rule: &PolicyRule, scope: &str) -> PolicyVerdict {
        PolicyVerdict {
            action: rule.action,
            reason: format!("{scope} rule"),
            risk: rule.risk,
            matched_rule: Some(format!("{scope}:{}", rule.describe())),
        }
    }

    fn default_verdict(&self, profile: &CallProfile) -> PolicyVerdict {
        if let Some(default) = self.config.tool_overrides.get(&profile.tool) {
            return PolicyVerdict {
                action: default.action,
                reason: "configured default".to_string(),
                risk: default.risk,
                matched_rule: None,
            };
        }

        let (action, risk, reason) = match profile.class {
            ToolClass::ReadOnly | ToolClass::Compute => {
                (RuleAction::Allow, RiskLevel::Low, "read-only tool")
            }
            ToolClass::Write => (RuleAction::Ask, RiskLevel::Medium, "write tool"),
            ToolClass::Delete => (RuleAction::Ask, RiskLevel::High, "delete tool"),
            ToolClass::Network => (RuleAction::Ask, RiskLevel::Medium, "network tool"),
            ToolClass::Install => (RuleAction::Ask, RiskLevel::High, "install tool"),
            ToolClass::Shell => match shell_argv(profile) {
                Some(argv) if is_read_only_command(&argv) => {
                    (RuleAction::Allow, RiskLevel::Low, "read-only command")
                }
                Some(argv) if looks_destructive(&argv) => {
                    (RuleAction::Ask, RiskLevel::High, "shell command")
                }
                _ => (RuleAction::Ask, RiskLevel::Medium, "shell command"),
            },
            ToolClass::Unknown => (RuleAction::Ask, RiskLevel::Medium, "unrecognized tool"),
        };
        PolicyVerdict {
            action,
            risk,
            reason: reason.to_string(),
            matched_rule: None,
        }
    }
}

/// Build the learned rule recorded when the user answers a permission
/// request with a remember scope: exact tool, exact command for shell calls.
pub fn rule_for_remembered_decision(
    tool: &str,
    input: &Value,
    action: RuleAction,
    risk: RiskLevel,
) -> PolicyRule {
    let command = CallProfile::parse(tool, input).and_then(|profile| profile.command_string);
    PolicyRule {
        tool: tool.to_string(),
        command,
        action,
        risk,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::config::ToolDefault;
    use crate::rule_store::MemoryRuleStore;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    async fn engine() -> PolicyEngine {
        PolicyEngine::new(PolicyConfig::default(), Arc::new(MemoryRuleStore::default()))
            .await
            .unwrap()
    }

    fn allow_rule(tool: &str) -> PolicyRule {
        PolicyRule {
            tool: tool.to_string(),
            command: None,
            action: RuleAction::Allow,
            risk: RiskLevel::Low,
        }
    }

    #[tokio::test]
    async fn read_only_tools_default_to_allow() {
        let engine = engine().await;
        engine.register_session("s1", "w1");
        let verdict = engine.evaluate("s1", "read_file", &json!({"path": "src/main.rs"}));
        assert_eq!(verdict.action, RuleAction::Allow);
        assert_eq!(verdict.risk, RiskLevel::Low);
    }

    #[tokio::test]
    async fn writes_default_to_ask() {
        let engine = engine().await;
        engine.register_session("s1", "w1");
        let verdict = engine.evaluate("s1", "write_file", &json!({"path": "/tmp/x"}));
        assert_eq!(verdict.action, RuleAction::Ask);
        assert_eq!(verdict.risk, RiskLevel::Medium);
        let verdict = engine.evaluate("s1", "delete_file", &json!({"path": "/tmp/x"}));
        assert_eq!(verdict.risk, RiskLevel::High);
    }

    #[tokio::test]
    async fn malformed_input_is_denied_critical() {
        let engine = engine().await;
        engine.register_session("s1", "w1");
        let verdict = engine.evaluate("s1", "bash", &json!("not an object"));
        assert_eq!(verdict.action, RuleAction::Deny);
        assert_eq!(verdict.reason, "malformed");
        assert_eq!(verdict.risk, RiskLevel::Critical);

        let verdict = engine.evaluate("s1", "bash", &json!({"command": 42}));
        assert_eq!(verdict.action, RuleAction::Deny);
    }

    #[tokio::test]
    async fn hard_deny_beats_learned_allow() {
        let engine = engine().await;
        engine.register_session("s1", "w1");
        engine
            .learn("s1", allow_rule("bash"), ApprovalScope::Session)
            .await
            .unwrap();
        let verdict = engine.evaluate("s1", "bash", &json!({"command": ["rm", "-rf", "/"]}));
        assert_eq!(verdict.action, RuleAction::Deny);
        assert_eq!(verdict.risk, RiskLevel::Critical);
        assert_eq!(verdict.matched_rule.as_deref(), Some("hard_deny"));
    }

    #[tokio::test]
    async fn session_rules_apply_before_global() {
        let engine = engine().await;
        engine.register_session("s1", "w1");
        engine
            .learn(
                "s1",
                PolicyRule {
                    tool: "fetch".to_string(),
                    command: None,
                    action: RuleAction::Deny,
                    risk: RiskLevel::High,
                },
                ApprovalScope::Session,
            )
            .await
            .unwrap();
        engine
            .learn("s1", allow_rule("fetch"), ApprovalScope::Global)
            .await
            .unwrap();

        let verdict = engine.evaluate("s1", "fetch", &json!({"url": "https://example.com"}));
        assert_eq!(verdict.action, RuleAction::Deny);
        assert_eq!(verdict.matched_rule.as_deref(), Some("session:fetch"));
    }

    #[tokio::test]
    async fn workspace_rules_are_shared_across_sessions() {
        let engine = engine().await;
        engine.register_session("s1", "w1");
        engine.register_session("s2", "w1");
        engine.register_session("other", "w2");
        engine
            .learn("s1", allow_rule("write_file"), ApprovalScope::Workspace)
            .await
            .unwrap();

        let input = json!({"path": "/tmp/x"});
        assert_eq!(
            engine.evaluate("s2", "write_file", &input).action,
            RuleAction::Allow
        );
        assert_eq!(
            engine.evaluate("other", "write_file", &input).action,
            RuleAction::Ask
        );
    }

    #[tokio::test]
    async fn session_rules_die_with_the_session() {
        let engine = engine().await;
        engine.register_session("s1", "w1");
        engine
            .learn("s1", allow_rule("write_file"), ApprovalScope::Session)
            .await
            .unwrap();
        engine.unregister_session("s1");
        engine.register_session("s1", "w1");
        let verdict = engine.evaluate("s1", "write_file", &json!({"path": "/tmp/x"}));
        assert_eq!(verdict.action, RuleAction::Ask);
    }

    #[tokio::test]
    async fn shell_read_only_commands_are_allowed() {
        let engine = engine().await;
        engine.register_session("s1", "w1");
        let verdict = engine.evaluate("s1", "bash", &json!({"command": ["git", "status"]}));
        assert_eq!(verdict.action, RuleAction::Allow);

        let verdict = engine.evaluate("s1", "bash", &json!({"command": "ls -la"}));
        assert_eq!(verdict.action, RuleAction::Allow);

        // Metacharacters disqualify the allow-list.
        let verdict = engine.evaluate("s1", "bash", &json!({"command": "ls && rm x"}));
        assert_eq!(verdict.action, RuleAction::Ask);
    }

    #[tokio::test]
    async fn destructive_shell_commands_ask_high() {
        let engine = engine().await;
        engine.register_session("s1", "w1");
        let verdict = engine.evaluate("s1", "bash", &json!({"command": ["rm", "-rf", "build"]}));
        assert_eq!(verdict.action, RuleAction::Ask);
        assert_eq!(verdict.risk, RiskLevel::High);
    }

    #[tokio::test]
    async fn command_rules_match_rendered_command() {
        let engine = engine().await;
        engine.register_session("s1", "w1");
        engine
            .learn(
                "s1",
                PolicyRule {
                    tool: "bash".to_string(),
                    command: Some("cargo *".to_string()),
                    action: RuleAction::Allow,
                    risk: RiskLevel::Low,
                },
                ApprovalScope::Session,
            )
            .await
            .unwrap();
        let verdict = engine.evaluate("s1", "bash", &json!({"command": ["cargo", "build"]}));
        assert_eq!(verdict.action, RuleAction::Allow);
        // The command pattern never matches a different tool.
        let verdict = engine.evaluate("s1", "fetch", &json!({"url": "x"}));
        assert_eq!(verdict.action, RuleAction::Ask);
    }

    #[tokio::test]
    async fn config_overrides_replace_class_defaults() {
        let mut config = PolicyConfig::default();
        config.tool_overrides.insert(
            "web_search".to_string(),
            ToolDefault {
                action: RuleAction::Allow,
                risk: RiskLevel::Low,
            },
        );
        let engine = PolicyEngine::new(config, Arc::new(MemoryRuleStore::default()))
            .await
            .unwrap();
        engine.register_session("s1", "w1");
        let verdict = engine.evaluate("s1", "web_search", &json!({"query": "rust"}));
        assert_eq!(verdict.action, RuleAction::Allow);
    }

    #[test]
    fn summaries_render_commands_and_paths() {
        assert_eq!(
            display_summary("bash", &json!({"command": ["ls", "-la"]})),
            "bash ls -la"
        );
        assert_eq!(
            display_summary("write_file", &json!({"path": "/tmp/x"})),
            "write_file /tmp/x"
        );
    }
}
