//! Command safety classification.
//!
//! A fixed, case-insensitive blocked set plus an administrative override
//! that is read once at startup. Command names outside the blocked set are
//! treated as safe.

use std::collections::BTreeMap;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Safe,
    Dangerous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DangerCategory {
    DatabaseClearing,
    ServerShutdown,
    ConfigurationMutation,
    Scripting,
    Debugging,
    Replication,
    Configured,
}

impl DangerCategory {
    pub fn rationale(&self) -> &'static str {
        match self {
            DangerCategory::DatabaseClearing => "deletes every key in one or all databases",
            DangerCategory::ServerShutdown => "stops the server process",
            DangerCategory::ConfigurationMutation => {
                "reads or rewrites live server configuration or loaded modules"
            }
            DangerCategory::Scripting => "runs arbitrary server-side code that can touch any key",
            DangerCategory::Debugging => {
                "debugging and monitoring commands can block or crash the server"
            }
            DangerCategory::Replication => "changes or hijacks the replication topology",
            DangerCategory::Configured => "blocked by operator configuration",
        }
    }
}

const BUILTIN_BLOCKED: &[(&str, DangerCategory)] = &[
    ("FLUSHDB", DangerCategory::DatabaseClearing),
    ("FLUSHALL", DangerCategory::DatabaseClearing),
    ("SHUTDOWN", DangerCategory::ServerShutdown),
    ("CONFIG", DangerCategory::ConfigurationMutation),
    ("MODULE", DangerCategory::ConfigurationMutation),
    ("EVAL", DangerCategory::Scripting),
    ("EVALSHA", DangerCategory::Scripting),
    ("EVAL_RO", DangerCategory::Scripting),
    ("EVALSHA_RO", DangerCategory::Scripting),
    ("SCRIPT", DangerCategory::Scripting),
    ("FUNCTION", DangerCategory::Scripting),
    ("FCALL", DangerCategory::Scripting),
    ("FCALL_RO", DangerCategory::Scripting),
    ("DEBUG", DangerCategory::Debugging),
    ("MONITOR", DangerCategory::Debugging),
    ("SYNC", DangerCategory::Replication),
    ("PSYNC", DangerCategory::Replication),
    ("REPLICAOF", DangerCategory::Replication),
    ("SLAVEOF", DangerCategory::Replication),
];

/// Classification of one command name, as reported by `get_command_info`.
#[derive(Debug, Clone, Serialize)]
pub struct CommandVerdict {
    pub command: String,
    pub classification: Classification,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<DangerCategory>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    pub blocked: bool,
    pub override_enabled: bool,
}

#[derive(Debug, Clone)]
pub struct SafetyPolicy {
    blocked: BTreeMap<String, DangerCategory>,
    allow_dangerous: bool,
}

impl SafetyPolicy {
    /// The built-in blocked set plus `extra` names, with the override flag.
    pub fn new<I, S>(allow_dangerous: bool, extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut blocked: BTreeMap<String, DangerCategory> = BUILTIN_BLOCKED
            .iter()
            .map(|(name, category)| (name.to_string(), *category))
            .collect();
        for name in extra {
            let name = name.as_ref().trim().to_ascii_uppercase();
            if !name.is_empty() {
                blocked.entry(name).or_insert(DangerCategory::Configured);
            }
        }
        Self {
            blocked,
            allow_dangerous,
        }
    }

    pub fn allow_dangerous(&self) -> bool {
        self.allow_dangerous
    }

    pub fn classify(&self, command: &str) -> Classification {
        if self.category(command).is_some() {
            Classification::Dangerous
        } else {
            Classification::Safe
        }
    }

    pub fn is_allowed(&self, command: &str) -> bool {
        self.allow_dangerous || self.classify(command) == Classification::Safe
    }

    pub fn category(&self, command: &str) -> Option<DangerCategory> {
        self.blocked
            .get(&command.trim().to_ascii_uppercase())
            .copied()
    }

    pub fn blocked_commands(&self) -> Vec<String> {
        self.blocked.keys().cloned().collect()
    }

    pub fn verdict(&self, command: &str) -> CommandVerdict {
        let category = self.category(command);
        CommandVerdict {
            command: command.trim().to_ascii_uppercase(),
            classification: self.classify(command),
            category,
            rationale: category.map(|c| c.rationale().to_string()),
            blocked: !self.is_allowed(command),
            override_enabled: self.allow_dangerous,
        }
    }
}

impl Default for SafetyPolicy {
    fn default() -> Self {
        Self::new(false, std::iter::empty::<&str>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocked_set_is_case_insensitive() {
        let policy = SafetyPolicy::default();
        for name in ["FLUSHALL", "flushall", "FlushDb", " config "] {
            assert_eq!(policy.classify(name), Classification::Dangerous, "{name}");
            assert!(!policy.is_allowed(name));
        }
    }

    #[test]
    fn test_unknown_commands_default_to_safe() {
        let policy = SafetyPolicy::default();
        assert_eq!(policy.classify("GET"), Classification::Safe);
        assert_eq!(policy.classify("NOTACOMMAND"), Classification::Safe);
        assert!(policy.is_allowed("hgetall"));
    }

    #[test]
    fn test_override_allows_every_blocked_command() {
        let policy = SafetyPolicy::new(true, std::iter::empty::<&str>());
        for name in policy.blocked_commands() {
            assert_eq!(policy.classify(&name), Classification::Dangerous);
            assert!(policy.is_allowed(&name), "{name}");
        }
    }

    #[test]
    fn test_extra_commands_are_blocked() {
        let policy = SafetyPolicy::new(false, ["keys", " ", "FLUSHDB"]);
        assert_eq!(policy.category("KEYS"), Some(DangerCategory::Configured));
        // Built-in category wins over the configured one.
        assert_eq!(policy.category("flushdb"), Some(DangerCategory::DatabaseClearing));
        assert!(!policy.blocked_commands().contains(&String::new()));
    }

    #[test]
    fn test_verdict_has_rationale_only_for_dangerous() {
        let policy = SafetyPolicy::default();
        let verdict = policy.verdict("shutdown");
        assert_eq!(verdict.command, "SHUTDOWN");
        assert!(verdict.blocked);
        assert_eq!(verdict.rationale.as_deref(), Some("stops the server process"));

        let verdict = policy.verdict("get");
        assert!(!verdict.blocked);
        assert!(verdict.rationale.is_none());
        assert!(verdict.category.is_none());
    }
}
