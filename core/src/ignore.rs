//! Gitignore-style rule parsing and matching (spec §4.8). Grounded on the
//! original implementation's `GitIgnore`/`GitIgnoreStack` (precedence order,
//! the `.hg`/`.eden` hidden-name special case, and walking a path's suffixes
//! from innermost directory up to the mount root), but rules compile to
//! `regex::Regex` here instead of a hand-rolled matcher.

use std::sync::Arc;

use edenfs_castore::{PathComponent, RelativePath, RelativePathBuf};
use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Exclude,
    Include,
    NoMatch,
    Hidden,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    File,
    Directory,
}

#[derive(Debug)]
struct Rule {
    regex: Regex,
    negated: bool,
    directory_only: bool,
}

/// The parsed contents of a single `.gitignore` file (spec §4.8). Rules are
/// stored highest-precedence-first, i.e. reversed from file order, since a
/// later line in a gitignore file overrides an earlier one.
#[derive(Debug, Default)]
pub struct GitIgnore {
    rules: Vec<Rule>,
}

impl GitIgnore {
    pub fn parse(contents: &str) -> Self {
        let mut rules = Vec::new();
        for line in contents.lines() {
            if let Some(rule) = parse_rule(line) {
                rules.push(rule);
            }
        }
        rules.reverse();
        Self { rules }
    }

    /// `path` is relative to the directory containing this gitignore file.
    pub fn matches(&self, path: &RelativePath, basename: &[u8], file_type: FileType) -> Verdict {
        for rule in &self.rules {
            if rule.directory_only && file_type != FileType::Directory {
                continue;
            }
            let subject = std::str::from_utf8(path.as_bytes()).unwrap_or("");
            let base = std::str::from_utf8(basename).unwrap_or("");
            if rule.regex.is_match(subject) || (!subject.contains('/') && rule.regex.is_match(base))
            {
                return if rule.negated { Verdict::Include } else { Verdict::Exclude };
            }
        }
        Verdict::NoMatch
    }
}

fn parse_rule(raw_line: &str) -> Option<Rule> {
    let line = raw_line.trim_end();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let mut rest = line;

    let negated = if let Some(stripped) = rest.strip_prefix('!') {
        rest = stripped;
        true
    } else {
        false
    };

    let anchored = rest.starts_with('/');
    if anchored {
        rest = &rest[1..];
    }

    let directory_only = rest.ends_with('/') && !rest.ends_with("\\/");
    if directory_only {
        rest = &rest[..rest.len() - 1];
    }

    if rest.is_empty() {
        return None;
    }

    let pattern = glob_to_regex(rest);
    let regex = Regex::new(&pattern).ok()?;
    Some(Rule { regex, negated, directory_only })
}

/// Translates one gitignore glob line into an anchored regex matched either
/// against the full path relative to the `.gitignore` file's directory (when
/// the pattern is anchored or contains an inner `/`) or retried against the
/// basename alone otherwise — see [`GitIgnore::matches`].
fn glob_to_regex(pattern: &str) -> String {
    let mut out = String::from("^");
    let chars: Vec<char> = pattern.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' if chars.get(i + 1) == Some(&'*') => {
                // `**/` matches zero or more path components.
                if chars.get(i + 2) == Some(&'/') {
                    out.push_str("(.*/)?");
                    i += 3;
                } else {
                    out.push_str(".*");
                    i += 2;
                }
            }
            '*' => {
                out.push_str("[^/]*");
                i += 1;
            }
            '?' => {
                out.push_str("[^/]");
                i += 1;
            }
            '[' => {
                let end = chars[i..].iter().position(|&c| c == ']').map(|p| i + p);
                match end {
                    Some(end) => {
                        out.push('[');
                        out.extend(&chars[i + 1..end]);
                        out.push(']');
                        i = end + 1;
                    }
                    None => {
                        out.push_str("\\[");
                        i += 1;
                    }
                }
            }
            c if "\\.+()|^$".contains(c) => {
                out.push('\\');
                out.push(c);
                i += 1;
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    out.push('$');
    out
}

/// A node in the ignore-file chain walked from the directory containing a
/// path up to the mount root (spec §4.8 `GitIgnoreStack`), plus any
/// system-wide/per-user rules prepended ahead of the root.
pub struct GitIgnoreStack {
    ignore: GitIgnore,
    parent: Option<Arc<GitIgnoreStack>>,
    /// Rules here match the full mount-relative path rather than a path
    /// relative to this node's directory (true for prepended global rules).
    matches_full_path: bool,
}

impl GitIgnoreStack {
    pub fn root() -> Arc<Self> {
        Arc::new(Self { ignore: GitIgnore::default(), parent: None, matches_full_path: false })
    }

    /// Prepends a system-wide or per-user ignore file below the repository
    /// root; its rules are matched against the full mount-relative path.
    pub fn with_global(parent: Arc<Self>, ignore: GitIgnore) -> Arc<Self> {
        Arc::new(Self { ignore, parent: Some(parent), matches_full_path: true })
    }

    pub fn child(self: &Arc<Self>, ignore: GitIgnore) -> Arc<Self> {
        Arc::new(Self { ignore, parent: Some(self.clone()), matches_full_path: false })
    }

    /// Walks from this node up to the root, returning the first non-`NoMatch`
    /// verdict (spec §4.8). `path` is always relative to the mount root.
    pub fn matches(&self, path: &RelativePath, file_type: FileType) -> Verdict {
        let basename = path.file_name().unwrap_or(path.as_bytes());
        if basename == b".hg" || basename == b".eden" {
            return Verdict::Hidden;
        }

        let components: Vec<&[u8]> = path.components().collect();
        let mut node = self;
        let mut depth = ancestor_depth(node);
        loop {
            let subject = if node.matches_full_path {
                path.to_owned()
            } else {
                suffix_at_depth(&components, depth)
            };
            let verdict = node.ignore.matches(&subject, basename, file_type);
            if verdict != Verdict::NoMatch {
                return verdict;
            }
            match &node.parent {
                Some(parent) => {
                    node = parent;
                    depth = depth.saturating_sub(1);
                }
                None => return Verdict::NoMatch,
            }
        }
    }
}

fn ancestor_depth(node: &GitIgnoreStack) -> usize {
    let mut depth = 0;
    let mut current = node;
    while let Some(parent) = &current.parent {
        if current.matches_full_path {
            break;
        }
        depth += 1;
        current = parent;
    }
    depth
}

/// Rebuilds the suffix of a path's components starting `depth` components
/// from the end, i.e. the part of the path below the directory `depth`
/// levels up from the leaf.
fn suffix_at_depth(components: &[&[u8]], depth: usize) -> RelativePathBuf {
    if depth >= components.len() {
        return RelativePathBuf::from_components(
            components.iter().filter_map(|c| PathComponent::new(c.to_vec()).ok()).collect::<Vec<_>>().iter(),
        );
    }
    let start = components.len() - depth - 1;
    RelativePathBuf::from_components(
        components[start..]
            .iter()
            .filter_map(|c| PathComponent::new(c.to_vec()).ok())
            .collect::<Vec<_>>()
            .iter(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use edenfs_castore::{PathComponent as PC, RelativePathBuf};

    fn path(s: &str) -> RelativePathBuf {
        let mut buf = RelativePathBuf::root();
        for part in s.split('/') {
            buf = buf.join(&PC::new(part.to_string()).unwrap());
        }
        buf
    }

    #[test]
    fn simple_name_excludes_anywhere() {
        let ignore = GitIgnore::parse("*.o\n");
        let p = path("src/main.o");
        assert_eq!(ignore.matches(&p, b"main.o", FileType::File), Verdict::Exclude);
    }

    #[test]
    fn negation_overrides_earlier_rule() {
        let ignore = GitIgnore::parse("*.log\n!keep.log\n");
        let keep = path("keep.log");
        assert_eq!(ignore.matches(&keep, b"keep.log", FileType::File), Verdict::Include);
        let other = path("other.log");
        assert_eq!(ignore.matches(&other, b"other.log", FileType::File), Verdict::Exclude);
    }

    #[test]
    fn anchored_pattern_only_matches_from_root() {
        let ignore = GitIgnore::parse("/build\n");
        let top = path("build");
        assert_eq!(ignore.matches(&top, b"build", FileType::Directory), Verdict::Exclude);
        let nested = path("sub/build");
        assert_eq!(ignore.matches(&nested, b"build", FileType::Directory), Verdict::NoMatch);
    }

    #[test]
    fn directory_only_pattern_skips_files() {
        let ignore = GitIgnore::parse("logs/\n");
        let as_dir = path("logs");
        assert_eq!(ignore.matches(&as_dir, b"logs", FileType::Directory), Verdict::Exclude);
        let as_file = path("logs");
        assert_eq!(ignore.matches(&as_file, b"logs", FileType::File), Verdict::NoMatch);
    }

    #[test]
    fn double_star_matches_any_depth() {
        let ignore = GitIgnore::parse("**/target\n");
        let nested = path("a/b/target");
        assert_eq!(ignore.matches(&nested, b"target", FileType::Directory), Verdict::Exclude);
    }

    #[test]
    fn hidden_names_bypass_everything() {
        let stack = GitIgnoreStack::root();
        let hg = path(".hg");
        assert_eq!(stack.matches(&hg, FileType::Directory), Verdict::Hidden);
        let eden = path(".eden");
        assert_eq!(stack.matches(&eden, FileType::Directory), Verdict::Hidden);
    }

    #[test]
    fn stack_walks_innermost_first() {
        let root = GitIgnoreStack::root();
        let root = root.child(GitIgnore::parse("*.tmp\n"));
        let sub = root.child(GitIgnore::parse("!keep.tmp\n"));
        let nested = path("sub/keep.tmp");
        assert_eq!(sub.matches(&nested, FileType::File), Verdict::Include);
        let other = path("sub/other.tmp");
        assert_eq!(sub.matches(&other, FileType::File), Verdict::Exclude);
    }
}
