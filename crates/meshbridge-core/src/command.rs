//! Slash-command recognition
//!
//! A command is text of the form `/<name>[-<suffix>] [args]`. The suffix is
//! the per-deployment alias: several bridges on one mesh each answer only
//! their own `/help-<alias>`. A small reserved set (`/ping`, `/emergency`,
//! ...) is accepted without it. Anything else that looks like a command but
//! carries no suffix, or a foreign one, is plain text.

use std::collections::HashSet;
use std::fmt;

use crate::config::CommandConfig;

/// A recognized command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Lowercased command name without slash or suffix
    pub name: String,
    /// Alias suffix as typed, if any
    pub suffix: Option<String>,
    /// Everything after the first whitespace, trimmed
    pub args: String,
    /// Original message text
    pub raw: String,
    /// Whether the command raises an emergency alert
    pub emergency: bool,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.suffix {
            Some(suffix) => write!(f, "/{}-{}", self.name, suffix),
            None => write!(f, "/{}", self.name),
        }
    }
}

/// Parses commands against the deployment alias
#[derive(Debug, Clone)]
pub struct CommandParser {
    alias: String,
    reserved: HashSet<String>,
    emergency: HashSet<String>,
}

impl CommandParser {
    /// Build from command configuration
    pub fn from_config(config: &CommandConfig) -> Self {
        let lower = |names: &[String]| names.iter().map(|n| n.to_lowercase()).collect();
        Self {
            alias: config.alias().to_lowercase(),
            reserved: lower(&config.reserved),
            emergency: lower(&config.emergency),
        }
    }

    /// The deployment alias suffix
    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Whether `name` is accepted without the suffix
    pub fn is_reserved(&self, name: &str) -> bool {
        self.reserved.contains(&name.to_lowercase())
    }

    /// Whether `name` is emergency-class
    pub fn is_emergency(&self, name: &str) -> bool {
        self.emergency.contains(&name.to_lowercase())
    }

    /// How users invoke `name` on this deployment
    pub fn invocation(&self, name: &str) -> String {
        if self.is_reserved(name) || self.alias.is_empty() {
            format!("/{}", name)
        } else {
            format!("/{}-{}", name, self.alias)
        }
    }

    /// Parse `text` as a command. Returns `None` for plain text.
    pub fn parse(&self, text: &str) -> Option<Command> {
        let trimmed = text.trim_start();
        let rest = trimmed.strip_prefix('/')?;

        let (token, args) = match rest.find(char::is_whitespace) {
            Some(pos) => (&rest[..pos], rest[pos..].trim()),
            None => (rest, ""),
        };
        if token.is_empty() {
            return None;
        }
        let token = token.to_lowercase();

        let (name, suffix) = match token.rsplit_once('-') {
            Some((name, suffix)) if !name.is_empty() && !suffix.is_empty() && suffix == self.alias => {
                (name.to_string(), Some(suffix.to_string()))
            }
            // A reserved name may itself contain a dash
            _ if self.reserved.contains(&token) => (token, None),
            _ => return None,
        };

        Some(Command {
            emergency: self.emergency.contains(&name),
            name,
            suffix,
            args: args.to_string(),
            raw: text.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> CommandParser {
        let config = CommandConfig {
            alias_suffix: Some("x7".to_string()),
            ..Default::default()
        };
        CommandParser::from_config(&config)
    }

    #[test]
    fn test_suffixed_command() {
        let cmd = parser().parse("/help-x7").unwrap();
        assert_eq!(cmd.name, "help");
        assert_eq!(cmd.suffix.as_deref(), Some("x7"));
        assert!(cmd.args.is_empty());
        assert!(!cmd.emergency);
        assert_eq!(cmd.to_string(), "/help-x7");
    }

    #[test]
    fn test_args_and_case() {
        let cmd = parser().parse("  /Weather-X7   Boulder, CO ").unwrap();
        assert_eq!(cmd.name, "weather");
        assert_eq!(cmd.args, "Boulder, CO");
        assert_eq!(cmd.raw, "  /Weather-X7   Boulder, CO ");
    }

    #[test]
    fn test_unsuffixed_non_reserved_is_plain_text() {
        assert!(parser().parse("/help").is_none());
        assert!(parser().parse("/help please").is_none());
    }

    #[test]
    fn test_foreign_suffix_is_plain_text() {
        assert!(parser().parse("/help-zz").is_none());
    }

    #[test]
    fn test_reserved_without_suffix() {
        let cmd = parser().parse("/ping").unwrap();
        assert_eq!(cmd.name, "ping");
        assert!(cmd.suffix.is_none());

        let cmd = parser().parse("/911 fell off trail").unwrap();
        assert!(cmd.emergency);
        assert_eq!(cmd.args, "fell off trail");

        let cmd = parser().parse("/EMERGENCY").unwrap();
        assert!(cmd.emergency);
    }

    #[test]
    fn test_reserved_with_suffix() {
        let cmd = parser().parse("/emergency-x7 help").unwrap();
        assert_eq!(cmd.name, "emergency");
        assert!(cmd.emergency);
    }

    #[test]
    fn test_non_commands() {
        let p = parser();
        assert!(p.parse("hello").is_none());
        assert!(p.parse("/").is_none());
        assert!(p.parse("/ ping").is_none());
        assert!(p.parse("/-x7").is_none());
        assert!(p.parse("see /ping").is_none());
    }

    #[test]
    fn test_invocation() {
        let p = parser();
        assert_eq!(p.invocation("ping"), "/ping");
        assert_eq!(p.invocation("help"), "/help-x7");
    }
}
