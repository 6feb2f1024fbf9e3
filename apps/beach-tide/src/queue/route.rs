use std::collections::HashSet;

use parking_lot::RwLock;

use super::CommandMode;

/// Delivery path chosen for one command at flush time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Prompt,
    Shell,
}

pub trait CommandRouter: Send + Sync {
    fn route(&self, session: &str, mode: CommandMode) -> Route;
}

/// Shell commands always go to the shell. AI commands go through the prompt
/// path only for sessions with an assistant attached; everywhere else they
/// fall back to shell execution.
#[derive(Debug, Default)]
pub struct RoutingRules {
    prompt_capable: RwLock<HashSet<String>>,
    prompt_everywhere: RwLock<bool>,
}

impl RoutingRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every session accepts prompts unless told otherwise.
    pub fn permissive() -> Self {
        let rules = Self::default();
        *rules.prompt_everywhere.write() = true;
        rules
    }

    pub fn set_prompt_capable(&self, session: &str, capable: bool) {
        let mut sessions = self.prompt_capable.write();
        if capable {
            sessions.insert(session.to_string());
        } else {
            sessions.remove(session);
        }
    }

    pub fn set_prompt_everywhere(&self, enabled: bool) {
        *self.prompt_everywhere.write() = enabled;
    }
}

impl CommandRouter for RoutingRules {
    fn route(&self, session: &str, mode: CommandMode) -> Route {
        match mode {
            CommandMode::Shell => Route::Shell,
            CommandMode::Ai
                if *self.prompt_everywhere.read()
                    || self.prompt_capable.read().contains(session) =>
            {
                Route::Prompt
            }
            CommandMode::Ai => Route::Shell,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ai_commands_follow_capability() {
        let rules = RoutingRules::new();
        assert_eq!(rules.route("s", CommandMode::Ai), Route::Shell);
        rules.set_prompt_capable("s", true);
        assert_eq!(rules.route("s", CommandMode::Ai), Route::Prompt);
        assert_eq!(rules.route("s", CommandMode::Shell), Route::Shell);
        rules.set_prompt_capable("s", false);
        assert_eq!(rules.route("s", CommandMode::Ai), Route::Shell);
    }

    #[test]
    fn permissive_rules_prompt_everywhere() {
        let rules = RoutingRules::permissive();
        assert_eq!(rules.route("any", CommandMode::Ai), Route::Prompt);
        rules.set_prompt_everywhere(false);
        assert_eq!(rules.route("any", CommandMode::Ai), Route::Shell);
    }
}
