//! Shell command parsing and lexical path containment.
//!
//! Nothing here touches the filesystem: the same command and root always
//! produce the same answer.

use std::path::{Component, Path, PathBuf};

/// How a segment is joined to the one before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Joiner {
    /// First segment, or after `;`, `&&`, `||`, `&` or a newline.
    Sequence,
    /// After `|`; stdin is the previous segment's stdout.
    Pipe,
}

/// An I/O redirection attached to a segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub target: String,
    /// `<` rather than `>`/`>>`.
    pub input: bool,
}

/// One simple command of a compound shell line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub joiner: Joiner,
    pub words: Vec<String>,
    pub redirects: Vec<Redirect>,
}

impl Segment {
    /// Basename of the program being run.
    pub fn program(&self) -> Option<&str> {
        let first = self.words.first()?;
        Some(first.rsplit('/').next().unwrap_or(first))
    }

    pub fn args(&self) -> &[String] {
        if self.words.is_empty() {
            &[]
        } else {
            &self.words[1..]
        }
    }
}

/// Splits a shell line into segments at unquoted `;`, `&&`, `||`, `|`, `&` and newlines,
/// then tokenises each segment with `shlex`.
///
/// Returns `Err` for unbalanced quoting.
pub fn parse_command(command: &str) -> Result<Vec<Segment>, String> {
    let mut segments = Vec::new();
    for (joiner, raw) in split_segments(command)? {
        let tokens = shlex::split(&raw)
            .ok_or_else(|| format!("invalid shell quoting in '{}'", raw.trim()))?;
        if tokens.is_empty() {
            continue;
        }
        segments.push(build_segment(joiner, tokens));
    }
    Ok(segments)
}

fn split_segments(command: &str) -> Result<Vec<(Joiner, String)>, String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut joiner = Joiner::Sequence;
    let mut chars = command.chars().peekable();
    let mut single = false;
    let mut double = false;

    while let Some(c) = chars.next() {
        match c {
            '\\' if !single => {
                current.push(c);
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '\'' if !double => {
                single = !single;
                current.push(c);
            }
            '"' if !single => {
                double = !double;
                current.push(c);
            }
            _ if single || double => current.push(c),
            ';' | '\n' => {
                parts.push((joiner, std::mem::take(&mut current)));
                joiner = Joiner::Sequence;
            }
            '&' => {
                // `2>&1`, `<&3` and `&>` are redirections, not separators.
                if current.ends_with('>') || current.ends_with('<') {
                    current.push(c);
                    continue;
                }
                if chars.peek() == Some(&'>') {
                    if !current.ends_with(char::is_whitespace) {
                        current.push(' ');
                    }
                    current.push(c);
                    continue;
                }
                if chars.peek() == Some(&'&') {
                    chars.next();
                }
                parts.push((joiner, std::mem::take(&mut current)));
                joiner = Joiner::Sequence;
            }
            '|' => {
                let next_joiner = if chars.peek() == Some(&'|') {
                    chars.next();
                    Joiner::Sequence
                } else {
                    Joiner::Pipe
                };
                parts.push((joiner, std::mem::take(&mut current)));
                joiner = next_joiner;
            }
            '<' | '>' => {
                // Give the operator its own word: shlex keeps `cat<f` whole.
                if !ends_with_fd_prefix(&current) {
                    current.push(' ');
                }
                current.push(c);
                if c == '<' && chars.peek() == Some(&'(') {
                    continue;
                }
                while let Some(&next) = chars.peek() {
                    if next == c || (c == '>' && next == '|') {
                        current.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if chars.peek() != Some(&'&') {
                    current.push(' ');
                }
            }
            _ => current.push(c),
        }
    }

    if single || double {
        return Err("unterminated quote".to_string());
    }
    parts.push((joiner, current));
    Ok(parts)
}

/// True when the word being built is empty or a file descriptor prefix
/// such as `2` or `&`.
fn ends_with_fd_prefix(current: &str) -> bool {
    current
        .rsplit(char::is_whitespace)
        .next()
        .unwrap_or("")
        .chars()
        .all(|c| c.is_ascii_digit() || c == '&')
}

fn build_segment(joiner: Joiner, tokens: Vec<String>) -> Segment {
    let mut words = Vec::new();
    let mut redirects = Vec::new();
    let mut iter = tokens.into_iter();

    while let Some(token) = iter.next() {
        match split_redirect(&token) {
            Some((input, mut rest)) => {
                if let Some(dup) = rest.strip_prefix('&') {
                    // fd duplication such as `2>&1`; `>&file` still writes a file.
                    if !dup.is_empty() && dup.chars().all(|c| c.is_ascii_digit() || c == '-') {
                        continue;
                    }
                    rest = dup.to_string();
                }
                let target = if rest.is_empty() { iter.next() } else { Some(rest) };
                if let Some(target) = target {
                    redirects.push(Redirect { target, input });
                }
            }
            None => words.push(token),
        }
    }

    Segment {
        joiner,
        words,
        redirects,
    }
}

/// Recognises `>`, `>>`, `>|`, `<`, `<<`, `2>`, `&>` prefixes. Returns
/// (is_input, remainder).
fn split_redirect(token: &str) -> Option<(bool, String)> {
    let trimmed = token.trim_start_matches(|c: char| c.is_ascii_digit() || c == '&');
    if let Some(rest) = trimmed.strip_prefix('>') {
        let rest = rest.strip_prefix('>').or_else(|| rest.strip_prefix('|')).unwrap_or(rest);
        return Some((false, rest.to_string()));
    }
    if let Some(rest) = trimmed.strip_prefix('<') {
        if rest.starts_with('(') {
            return None;
        }
        return Some((true, rest.trim_start_matches('<').to_string()));
    }
    None
}

/// Heuristic: does this argument name a filesystem location?
pub fn looks_like_path(token: &str) -> bool {
    if token.is_empty() || token.contains("://") {
        return false;
    }
    token == "."
        || token == ".."
        || token.starts_with('/')
        || token.starts_with("./")
        || token.starts_with("../")
        || token.starts_with('~')
        || token.contains('/')
}

/// Path-like values among a segment's arguments, including `--flag=value` forms.
pub fn path_arguments(segment: &Segment) -> Vec<&str> {
    let mut paths = Vec::new();
    for arg in segment.args() {
        let candidate = if arg.starts_with('-') {
            match arg.split_once('=') {
                Some((_, value)) => value,
                None => continue,
            }
        } else {
            arg.as_str()
        };
        if looks_like_path(candidate) {
            paths.push(candidate);
        }
    }
    paths
}

/// Collapses `.` and `..` components without consulting the filesystem.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(p) => out.push(p.as_os_str()),
            Component::RootDir => out.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() && !out.has_root() {
                    out.push("..");
                }
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}

/// Resolves `raw` against `base`.
///
/// Returns `None` when the location depends on the environment (`~`, `$VAR`),
/// which callers must treat as outside every workspace.
pub fn resolve(base: &Path, raw: &str) -> Option<PathBuf> {
    if raw.starts_with('~') || raw.starts_with('$') {
        return None;
    }
    let path = Path::new(raw);
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    };
    Some(normalize(&joined))
}

/// True if `path` equals `root` or lies beneath it, both taken lexically.
pub fn is_within(path: &Path, root: &Path) -> bool {
    normalize(path).starts_with(normalize(root))
}
