//! Environment policy for spawned agent processes.
//!
//! The child environment is a filtered copy of the parent's. Rules are matched
//! in table order and the first match wins; unmatched variables fall back to
//! the policy's default action.

use std::collections::BTreeMap;

/// What happens to a variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvAction {
    Keep,
    Drop,
    /// Set to this value, whether or not the parent defines it.
    Override(String),
}

/// Which variable names a rule applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvMatcher {
    Exact(String),
    Prefix(String),
}

impl EnvMatcher {
    pub fn matches(&self, name: &str) -> bool {
        match self {
            EnvMatcher::Exact(exact) => name == exact,
            EnvMatcher::Prefix(prefix) => name.starts_with(prefix.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvRule {
    pub matcher: EnvMatcher,
    pub action: EnvAction,
    /// Why the rule exists, shown when the table is dumped.
    pub reason: &'static str,
}

impl EnvRule {
    pub fn exact(name: &str, action: EnvAction, reason: &'static str) -> Self {
        Self {
            matcher: EnvMatcher::Exact(name.to_string()),
            action,
            reason,
        }
    }

    pub fn prefix(prefix: &str, action: EnvAction, reason: &'static str) -> Self {
        Self {
            matcher: EnvMatcher::Prefix(prefix.to_string()),
            action,
            reason,
        }
    }
}

/// Ordered rule table plus a default action.
#[derive(Debug, Clone)]
pub struct EnvPolicy {
    rules: Vec<EnvRule>,
    default_action: EnvAction,
}

const AUTH_MODE: &str = "credential would switch the agent CLI's auth/billing mode";
const HOST_BUILD: &str = "host build-tool variable leaks into the agent's own builds";
const PLAIN_OUTPUT: &str = "keeps stream output free of terminal control codes";

impl Default for EnvPolicy {
    fn default() -> Self {
        use EnvAction::{Drop, Override};

        Self {
            rules: vec![
                EnvRule::exact("ANTHROPIC_API_KEY", Drop, AUTH_MODE),
                EnvRule::exact("ANTHROPIC_AUTH_TOKEN", Drop, AUTH_MODE),
                EnvRule::exact("CLAUDE_CODE_USE_BEDROCK", Drop, AUTH_MODE),
                EnvRule::exact("CLAUDE_CODE_USE_VERTEX", Drop, AUTH_MODE),
                EnvRule::prefix("npm_config_", Drop, HOST_BUILD),
                EnvRule::prefix("npm_lifecycle_", Drop, HOST_BUILD),
                EnvRule::prefix("npm_package_", Drop, HOST_BUILD),
                EnvRule::exact("npm_execpath", Drop, HOST_BUILD),
                EnvRule::exact("npm_node_execpath", Drop, HOST_BUILD),
                EnvRule::exact("INIT_CWD", Drop, HOST_BUILD),
                EnvRule::exact("NODE_OPTIONS", Drop, HOST_BUILD),
                EnvRule::exact("CARGO_MANIFEST_DIR", Drop, HOST_BUILD),
                EnvRule::prefix("CARGO_PKG_", Drop, HOST_BUILD),
                EnvRule::exact("CARGO_PRIMARY_PACKAGE", Drop, HOST_BUILD),
                EnvRule::exact("RUSTC_WRAPPER", Drop, HOST_BUILD),
                EnvRule::exact("FORCE_COLOR", Drop, PLAIN_OUTPUT),
                EnvRule::exact("NO_COLOR", Override("1".to_string()), PLAIN_OUTPUT),
            ],
            default_action: EnvAction::Keep,
        }
    }
}

impl EnvPolicy {
    /// A policy with no rules that keeps everything.
    pub fn permissive() -> Self {
        Self {
            rules: Vec::new(),
            default_action: EnvAction::Keep,
        }
    }

    /// Prepend a rule so it takes precedence over existing ones.
    pub fn with_rule(mut self, rule: EnvRule) -> Self {
        self.rules.insert(0, rule);
        self
    }

    pub fn rules(&self) -> &[EnvRule] {
        &self.rules
    }

    /// Decide the action for a single variable name.
    pub fn decide(&self, name: &str) -> &EnvAction {
        self.rules
            .iter()
            .find(|rule| rule.matcher.matches(name))
            .map(|rule| &rule.action)
            .unwrap_or(&self.default_action)
    }

    /// Apply the policy to a set of variables, producing the child environment.
    ///
    /// `Override` rules with an exact matcher are applied even when the variable is absent.
    pub fn apply<I, K, V>(&self, vars: I) -> BTreeMap<String, String>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut env = BTreeMap::new();
        for (name, value) in vars {
            let name = name.into();
            match self.decide(&name) {
                EnvAction::Keep => {
                    env.insert(name, value.into());
                }
                EnvAction::Drop => {}
                EnvAction::Override(forced) => {
                    env.insert(name, forced.clone());
                }
            }
        }

        for rule in &self.rules {
            if let (EnvMatcher::Exact(name), EnvAction::Override(_)) = (&rule.matcher, &rule.action) {
                // Only the first matching rule counts, so check the variable resolves to this one.
                if let EnvAction::Override(value) = self.decide(name) {
                    env.insert(name.clone(), value.clone());
                }
            }
        }

        env
    }

    /// Apply the policy to the current process environment.
    pub fn apply_to_current(&self) -> BTreeMap<String, String> {
        self.apply(std::env::vars())
    }
}
