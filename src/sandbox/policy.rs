//! Blocked shell command patterns.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::paths::{self, Joiner, Segment};

/// Which blocked pattern a command matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockedRule {
    PrivilegeEscalation,
    RecursiveDeleteOutsideWorkspace,
    RemoteScriptExecution,
    SystemPathWrite,
    Configured,
}

impl fmt::Display for BlockedRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            BlockedRule::PrivilegeEscalation => "privilege escalation",
            BlockedRule::RecursiveDeleteOutsideWorkspace => "recursive delete outside workspace",
            BlockedRule::RemoteScriptExecution => "remote content piped into a shell",
            BlockedRule::SystemPathWrite => "write to system path",
            BlockedRule::Configured => "blocked by configuration",
        };
        f.write_str(tag)
    }
}

/// A blocked-pattern hit with the offending fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyViolation {
    pub rule: BlockedRule,
    pub detail: String,
}

/// Pattern lists checked against every parsed shell command.
#[derive(Debug, Clone)]
pub struct CommandPolicy {
    escalation_programs: Vec<&'static str>,
    shell_programs: Vec<&'static str>,
    download_programs: Vec<&'static str>,
    substitution_patterns: Vec<&'static str>,
    system_prefixes: Vec<&'static str>,
    write_programs: Vec<&'static str>,
    /// Extra word-prefix patterns from configuration, e.g. `git push --force`.
    configured: Vec<Vec<String>>,
}

impl Default for CommandPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandPolicy {
    pub fn new() -> Self {
        Self {
            escalation_programs: vec!["sudo", "su", "doas", "pkexec", "runuser", "setcap"],
            shell_programs: vec![
                "sh", "bash", "zsh", "dash", "ksh", "fish", "python", "python3", "perl", "ruby",
                "node",
            ],
            download_programs: vec!["curl", "wget", "fetch", "nc", "ncat"],
            substitution_patterns: vec!["$(curl", "$(wget", "<(curl", "<(wget", "`curl", "`wget"],
            system_prefixes: vec![
                "/etc", "/usr", "/bin", "/sbin", "/lib", "/lib64", "/boot", "/sys", "/proc",
                "/dev", "/var", "/opt", "/root",
            ],
            write_programs: vec!["tee", "cp", "mv", "install", "ln", "touch", "mkdir", "truncate"],
            configured: Vec::new(),
        }
    }

    /// Adds blocked patterns; each is matched as a prefix of a segment's words.
    pub fn with_blocked_commands<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for pattern in patterns {
            if let Some(words) = shlex::split(pattern.as_ref()) {
                if !words.is_empty() {
                    self.configured.push(words);
                }
            }
        }
        self
    }

    /// Checks a parsed command line. `raw` is the unparsed text, used for
    /// command-substitution patterns the tokenizer does not model.
    pub fn check(&self, raw: &str, segments: &[Segment], root: &Path) -> Option<PolicyViolation> {
        let lower = raw.to_lowercase();
        if let Some(pattern) = self
            .substitution_patterns
            .iter()
            .find(|p| lower.contains(*p))
        {
            return Some(violation(BlockedRule::RemoteScriptExecution, *pattern));
        }

        let mut cwd = root.to_path_buf();
        for (index, segment) in segments.iter().enumerate() {
            let Some(program) = segment.program() else {
                continue;
            };

            if let Some(words) = self.configured.iter().find(|p| starts_with_words(segment, p)) {
                return Some(violation(BlockedRule::Configured, words.join(" ")));
            }

            if self.escalation_programs.contains(&program)
                || segment.args().iter().any(|a| self.escalation_programs.contains(&a.as_str()))
            {
                return Some(violation(BlockedRule::PrivilegeEscalation, program));
            }
            if program == "chmod" && segment.args().iter().any(|a| is_setuid_mode(a)) {
                return Some(violation(BlockedRule::PrivilegeEscalation, "chmod setuid"));
            }
            if program == "chown" && segment.args().iter().any(|a| a.starts_with("root")) {
                return Some(violation(BlockedRule::PrivilegeEscalation, "chown root"));
            }

            if self.shell_programs.contains(&program)
                && segment.joiner == Joiner::Pipe
                && self.pipeline_downloads(segments, index)
            {
                return Some(violation(BlockedRule::RemoteScriptExecution, program));
            }

            if program == "rm" && is_recursive_rm(segment) {
                for target in segment.args().iter().filter(|a| !a.starts_with('-')) {
                    let escapes = match paths::resolve(&cwd, target) {
                        Some(path) => !paths::is_within(&path, root) || target == "/",
                        None => true,
                    };
                    if escapes {
                        return Some(violation(
                            BlockedRule::RecursiveDeleteOutsideWorkspace,
                            target,
                        ));
                    }
                }
            }

            for target in self.write_targets(segment) {
                if let Some(path) = paths::resolve(&cwd, target) {
                    if self.is_system_path(&path) {
                        return Some(violation(BlockedRule::SystemPathWrite, target));
                    }
                }
            }

            if program == "cd" {
                if let Some(dir) = segment.args().first() {
                    if let Some(next) = paths::resolve(&cwd, dir) {
                        cwd = next;
                    }
                }
            }
        }
        None
    }

    /// True if `path` is under a protected system prefix. `/dev/null` is exempt.
    pub fn is_system_path(&self, path: &Path) -> bool {
        if path == Path::new("/dev/null") {
            return false;
        }
        self.system_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix))
    }

    fn pipeline_downloads(&self, segments: &[Segment], index: usize) -> bool {
        // Walk back over the pipeline feeding this segment.
        let mut i = index;
        while i > 0 && segments[i].joiner == Joiner::Pipe {
            i -= 1;
            if let Some(program) = segments[i].program() {
                if self.download_programs.contains(&program) {
                    return true;
                }
            }
        }
        false
    }

    fn write_targets<'a>(&self, segment: &'a Segment) -> Vec<&'a str> {
        let mut targets: Vec<&str> = segment
            .redirects
            .iter()
            .filter(|r| !r.input)
            .map(|r| r.target.as_str())
            .collect();

        match segment.program() {
            Some("dd") => {
                targets.extend(segment.args().iter().filter_map(|a| a.strip_prefix("of=")));
            }
            Some(program) if self.write_programs.contains(&program) => {
                let operands: Vec<&str> = segment
                    .args()
                    .iter()
                    .filter(|a| !a.starts_with('-'))
                    .map(String::as_str)
                    .collect();
                match program {
                    // destination is the last operand
                    "cp" | "mv" | "install" | "ln" => targets.extend(operands.last().copied()),
                    _ => targets.extend(operands),
                }
            }
            _ => {}
        }
        targets
    }
}

fn violation(rule: BlockedRule, detail: impl Into<String>) -> PolicyViolation {
    PolicyViolation {
        rule,
        detail: detail.into(),
    }
}

fn starts_with_words(segment: &Segment, pattern: &[String]) -> bool {
    if segment.words.len() < pattern.len() {
        return false;
    }
    let program_matches = segment.program() == Some(pattern[0].as_str());
    program_matches
        && segment.words[1..pattern.len()]
            .iter()
            .zip(&pattern[1..])
            .all(|(w, p)| w == p)
}

fn is_recursive_rm(segment: &Segment) -> bool {
    segment.args().iter().any(|a| {
        a == "--recursive"
            || (a.starts_with('-') && !a.starts_with("--") && (a.contains('r') || a.contains('R')))
    })
}

fn is_setuid_mode(arg: &str) -> bool {
    if arg.contains("+s") {
        return true;
    }
    // Four-digit octal with the setuid/setgid bit set, e.g. 4755.
    arg.len() == 4
        && arg.chars().all(|c| c.is_digit(8))
        && matches!(arg.chars().next(), Some('2' | '4' | '6'))
}
