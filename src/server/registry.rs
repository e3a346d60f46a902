//! Command registry mapping verbs to handlers.
//!
//! Lookup is ASCII case-insensitive and exact-length. The table is seeded
//! with the mandatory protocol verbs; registering a verb again (built-in or
//! not) replaces the previous entry, so embedders can override any of them.

use std::sync::Arc;

use super::context::HandlerCtx;
use crate::error::{Error, Result};

/// A registered command handler.
///
/// Handlers receive a restricted handle to the conversation and the raw
/// argument string, and report the terminal outcome of the command as their
/// return value.
pub type Handler = Arc<dyn Fn(&mut HandlerCtx<'_>, &str) -> Result<()> + Send + Sync>;

/// The mandatory verbs every server understands out of the box.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Builtin {
    Nop,
    Cancel,
    Bye,
    Auth,
    Reset,
    End,
    Help,
    Option,
}

#[derive(Clone)]
pub(crate) enum Action {
    Builtin(Builtin),
    User(Handler),
}

pub(crate) struct CommandEntry {
    pub(crate) verb: String,
    pub(crate) action: Action,
    pub(crate) help: Option<String>,
}

/// Verb table of a server context. Append-only apart from replacement.
pub(crate) struct CommandRegistry {
    entries: Vec<CommandEntry>,
}

impl CommandRegistry {
    /// Create a registry pre-seeded with the mandatory verbs.
    pub(crate) fn with_builtins() -> Self {
        let builtins = [
            (Builtin::Nop, "NOP"),
            (Builtin::Cancel, "CANCEL"),
            (Builtin::Option, "OPTION"),
            (Builtin::Bye, "BYE"),
            (Builtin::Auth, "AUTH"),
            (Builtin::Reset, "RESET"),
            (Builtin::End, "END"),
            (Builtin::Help, "HELP"),
        ];
        Self {
            entries: builtins
                .into_iter()
                .map(|(builtin, verb)| CommandEntry {
                    verb: verb.to_owned(),
                    action: Action::Builtin(builtin),
                    help: None,
                })
                .collect(),
        }
    }

    /// Add or replace a verb.
    pub(crate) fn register(
        &mut self,
        verb: &str,
        handler: Handler,
        help: Option<&str>,
    ) -> Result<()> {
        if verb.is_empty() || verb.contains([' ', '\t']) {
            return Err(Error::Parameter);
        }
        let entry = CommandEntry {
            verb: verb.to_owned(),
            action: Action::User(handler),
            help: help.map(str::to_owned),
        };
        match self.position(verb) {
            Some(idx) => self.entries[idx] = entry,
            None => self.entries.push(entry),
        }
        Ok(())
    }

    fn position(&self, verb: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.verb.eq_ignore_ascii_case(verb))
    }

    pub(crate) fn lookup(&self, verb: &str) -> Option<&CommandEntry> {
        self.position(verb).map(|idx| &self.entries[idx])
    }

    /// Registered verbs in registration order, for `HELP`.
    pub(crate) fn verbs(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.verb.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_handler() -> Handler {
        Arc::new(|_ctx, _args| Ok(()))
    }

    #[test]
    fn test_builtins_always_present() {
        let registry = CommandRegistry::with_builtins();
        for verb in ["NOP", "CANCEL", "BYE", "AUTH", "RESET", "END", "HELP", "OPTION"] {
            assert!(registry.lookup(verb).is_some(), "{verb} missing");
        }
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let mut registry = CommandRegistry::with_builtins();
        registry.register("GetInfo", noop_handler(), None).unwrap();
        assert!(registry.lookup("GETINFO").is_some());
        assert!(registry.lookup("getinfo").is_some());
        // Exact length: a prefix is not a match.
        assert!(registry.lookup("GETINF").is_none());
        assert!(registry.lookup("GETINFOX").is_none());
    }

    #[test]
    fn test_registration_replaces() {
        let mut registry = CommandRegistry::with_builtins();
        registry
            .register("ECHO", noop_handler(), Some("first"))
            .unwrap();
        registry
            .register("echo", noop_handler(), Some("second"))
            .unwrap();
        assert_eq!(
            registry.lookup("ECHO").unwrap().help.as_deref(),
            Some("second")
        );
        // Replacement, not duplication.
        let count = registry
            .verbs()
            .iter()
            .filter(|v| v.eq_ignore_ascii_case("echo"))
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_builtin_can_be_overridden() {
        let mut registry = CommandRegistry::with_builtins();
        registry.register("NOP", noop_handler(), None).unwrap();
        assert!(matches!(
            registry.lookup("NOP").unwrap().action,
            Action::User(_)
        ));
    }

    #[test]
    fn test_invalid_verbs_rejected() {
        let mut registry = CommandRegistry::with_builtins();
        assert_eq!(
            registry.register("", noop_handler(), None),
            Err(Error::Parameter)
        );
        assert_eq!(
            registry.register("TWO WORDS", noop_handler(), None),
            Err(Error::Parameter)
        );
    }
}
