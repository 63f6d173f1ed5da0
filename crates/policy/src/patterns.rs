use regex::{Regex, RegexBuilder};
use tracing::warn;

const DEFAULT_DANGEROUS: &[&str] = &[
    // destructive filesystem operations
    r"rm\s+(-rf?|--recursive)\s+[/~]",
    r"rm\s+-rf?\s+\*",
    r"rmdir\s+[/~]",
    // raw disk access
    r"dd\s+if=",
    r"mkfs",
    r"fdisk",
    r"parted",
    // power state
    r"shutdown",
    r"reboot",
    r"halt",
    r"poweroff",
    r"init\s+[06]",
    // ownership and permissions on root
    r"chmod\s+(-R\s+)?777\s+[/~]",
    r"chown\s+-R\s+.*\s+[/~]",
    // listeners
    r"nc\s+-l",
    r"netcat\s+-l",
    // piping downloads into a shell
    r"curl\s+.*\|\s*(bash|sh)",
    r"wget\s+.*\|\s*(bash|sh)",
    // fork bomb
    r":\(\)\s*\{\s*:\|:&\s*\}\s*;",
];

const DEFAULT_SAFE: &[&str] = &[
    r"^(ls|dir|pwd|cd|echo|cat|head|tail|less|more|wc)(\s|$)",
    r"^(find|locate|which|whereis|file|stat)(\s|$)",
    r"^git\s+(status|log|diff|show|branch|remote|tag)(\s|$)",
    r"^(npm|yarn|pnpm)\s+(list|ls|outdated)(\s|$)",
    r"^pip\s+(list|show|freeze)(\s|$)",
    r"^cargo\s+(tree|search)(\s|$)",
    r"^(grep|awk|sed|cut|sort|uniq|tr|diff|comm)(\s|$)",
    r"^(date|cal|uptime|whoami|id|groups|hostname|uname)(\s|$)",
    r"^(env|printenv|set)$",
    r"^(ps|top|htop|pgrep)(\s|$)",
];

/// Shell command classifier used for the danger flag of command tools.
#[derive(Debug, Clone)]
pub struct CommandPatterns {
    dangerous: Vec<Regex>,
    safe: Vec<Regex>,
}

impl CommandPatterns {
    pub fn new() -> Self {
        Self {
            dangerous: compile(DEFAULT_DANGEROUS.iter().copied()),
            safe: compile(DEFAULT_SAFE.iter().copied()),
        }
    }

    /// Build from configured pattern lists on top of the built-in ones.
    /// Invalid expressions are skipped with a warning.
    pub fn with_extra<'a>(
        dangerous: impl IntoIterator<Item = &'a str>,
        safe: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        let mut patterns = Self::new();
        patterns.dangerous.extend(compile(dangerous));
        patterns.safe.extend(compile(safe));
        patterns
    }

    pub fn is_dangerous(&self, command: &str) -> bool {
        self.dangerous.iter().any(|re| re.is_match(command))
    }

    /// True only for commands on the read-only allowlist that are not also dangerous.
    pub fn is_safe(&self, command: &str) -> bool {
        let command = command.trim();
        !self.is_dangerous(command) && self.safe.iter().any(|re| re.is_match(command))
    }

    pub fn add_dangerous(&mut self, pattern: &str) {
        self.dangerous.extend(compile([pattern]));
    }
}

impl Default for CommandPatterns {
    fn default() -> Self {
        Self::new()
    }
}

fn compile<'a>(patterns: impl IntoIterator<Item = &'a str>) -> Vec<Regex> {
    patterns
        .into_iter()
        .filter_map(|p| match RegexBuilder::new(p).case_insensitive(true).build() {
            Ok(re) => Some(re),
            Err(e) => {
                warn!("Ignoring invalid command pattern {:?}: {}", p, e);
                None
            }
        })
        .collect()
}
