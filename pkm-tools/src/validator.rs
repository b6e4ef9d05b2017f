use crate::error::{Result, ToolError};
use regex::Regex;
use serde::Serialize;

/// Ordered blacklist. First match wins, so more specific entries come first.
const BLOCKED_PATTERNS: &[(&str, &str)] = &[
    (
        "root_deletion",
        r"\brm\s+(?:-\S+\s+)*(?:/|/\*|~/?|\$home/?|\$\{home\}/?)(?:[\s;&|)]|$)",
    ),
    ("root_deletion", r"\brm\s[^;&|]*--no-preserve-root\b"),
    ("fork_bomb", r"(?::|\w+)\s*\(\s*\)\s*\{[^}]*\|\s*(?::|\w+)\s*&"),
    (
        "pipe_to_interpreter",
        r"\b(?:curl|wget)\b.*\|\s*(?:sudo\s+(?:-\S+\s+)*)?(?:env\s+)?(?:sh|bash|zsh|ksh|dash|fish|python[0-9.]*|perl|ruby|node|php)\b",
    ),
    (
        "pipe_to_interpreter",
        r#"\b(?:sh|bash|zsh|ksh|dash)\s+(?:-c\s+)?["']?(?:<\(|\$\()\s*(?:curl|wget)\b"#,
    ),
    ("raw_socket_device", r"/dev/(?:tcp|udp)/"),
    (
        "kernel_parameters",
        r"/proc/sys(?:/|rq-trigger)|/sys/(?:kernel|class|devices|firmware|module|power|fs|bus)/|\bsysctl\b[^;&|]*\s(?:-w|--write)\b",
    ),
    (
        "package_manager",
        r"(?:^|[;&|(\x60]|\$\()\s*(?:sudo\s+(?:-\S+\s+)*)?(?:apt|apt-get|aptitude|dpkg|yum|dnf|rpm|zypper|pacman|apk|brew|snap|flatpak|nix-env|port)\b",
    ),
    (
        "package_manager",
        r"(?:^|[;&|(\x60]|\$\()\s*(?:sudo\s+(?:-\S+\s+)*)?(?:pip[0-9.]*|pipx|npm|pnpm|yarn|gem|cargo|go)\s+(?:install|add|uninstall|remove|i)\b",
    ),
    (
        "disk_overwrite",
        r"\bmkfs(?:\.\w+)?\b|\bdd\b[^;&|]*\bof=/dev/(?:sd|nvme|hd|vd|xvd|disk|mmcblk|mapper)|>\s*/dev/(?:sd|nvme|hd|vd|xvd|disk|mmcblk)",
    ),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MatchedPattern {
    pub name: String,
    pub regex: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandValidationResult {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched: Option<MatchedPattern>,
    pub normalized: String,
}

struct BlockedPattern {
    name: String,
    source: String,
    regex: Regex,
}

/// Screens shell text against a pattern blacklist.
///
/// Anything not matched is allowed, including pipes, substitutions and chaining. This
/// catches obvious accidents and nothing more.
pub struct CommandValidator {
    patterns: Vec<BlockedPattern>,
}

impl CommandValidator {
    pub fn new() -> Result<Self> {
        Self::with_extra_patterns(&[])
    }

    /// Built-in patterns followed by `extra` (name, regex) pairs from configuration.
    pub fn with_extra_patterns(extra: &[(String, String)]) -> Result<Self> {
        let builtin = BLOCKED_PATTERNS
            .iter()
            .map(|(name, source)| (name.to_string(), source.to_string()));
        let patterns = builtin
            .chain(extra.iter().cloned())
            .map(|(name, source)| {
                let regex = Regex::new(&format!("(?is){source}")).map_err(|e| {
                    ToolError::InvalidArguments(format!("invalid blocked pattern {name}: {e}"))
                })?;
                Ok(BlockedPattern {
                    name,
                    source,
                    regex,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }

    pub fn validate(&self, command: &str) -> CommandValidationResult {
        let normalized = normalize_command(command);
        let matched = self
            .patterns
            .iter()
            .find(|p| p.regex.is_match(&normalized))
            .map(|p| MatchedPattern {
                name: p.name.clone(),
                regex: p.source.clone(),
            });
        if let Some(m) = matched.as_ref() {
            tracing::warn!(pattern = %m.name, command = %normalized, "command blocked");
        }
        CommandValidationResult {
            allowed: matched.is_none(),
            matched,
            normalized,
        }
    }
}

/// Joins backslash line continuations and collapses whitespace runs.
fn normalize_command(command: &str) -> String {
    let joined = command.replace("\\\r\n", " ").replace("\\\n", " ");
    joined.split_whitespace().collect::<Vec<_>>().join(" ")
}
