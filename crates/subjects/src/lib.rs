//! Subject-pattern matching for NATS-style subjects.
//!
//! Patterns are dot-separated token sequences where `*` matches exactly one
//! token and `>` matches one or more trailing tokens. A [`SubjectMatcher`]
//! holds a set of patterns in an immutable trie and resolves a concrete
//! subject to the most specific registered pattern.

use std::collections::HashMap;

/// Per-token specificity: a literal outranks `*`, which outranks the
/// tokens a `>` swallows (rank 0).
const LITERAL_RANK: u8 = 2;
const WILDCARD_RANK: u8 = 1;

#[derive(Default)]
struct Node {
    literal: HashMap<String, Node>,
    wildcard: Option<Box<Node>>,
    /// Pattern id of a `>` ending at this node. `>` is always terminal.
    tail: Option<usize>,
    /// Pattern id ending exactly at this node.
    exact: Option<usize>,
}

/// Immutable trie of subject patterns.
///
/// Resolution ranks candidates by their per-token specificity from the root
/// (literal over `*` over the remainder a `>` swallows), then an exact end
/// over `>`, then insertion recency as the final tiebreak.
pub struct SubjectMatcher {
    root: Node,
    patterns: Vec<String>,
    index: HashMap<String, usize>,
    stamps: Vec<u64>,
    clock: u64,
}

impl SubjectMatcher {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut matcher = SubjectMatcher {
            root: Node::default(),
            patterns: Vec::new(),
            index: HashMap::new(),
            stamps: Vec::new(),
            clock: 0,
        };
        for pattern in patterns {
            matcher.insert(pattern.as_ref());
        }
        matcher
    }

    /// Inserts a pattern. Re-inserting an existing pattern keeps its entry
    /// and only refreshes its recency.
    fn insert(&mut self, pattern: &str) {
        self.clock += 1;
        if let Some(&id) = self.index.get(pattern) {
            self.stamps[id] = self.clock;
            return;
        }
        let id = self.patterns.len();
        self.patterns.push(pattern.to_string());
        self.index.insert(pattern.to_string(), id);
        self.stamps.push(self.clock);

        let mut node = &mut self.root;
        let mut tail_terminal = false;
        for token in pattern.split('.').filter(|t| !t.is_empty()) {
            match token {
                ">" => {
                    node.tail = Some(id);
                    tail_terminal = true;
                    break;
                }
                "*" => {
                    node = node.wildcard.get_or_insert_with(Box::default);
                }
                literal => {
                    node = node.literal.entry(literal.to_string()).or_default();
                }
            }
        }
        if !tail_terminal {
            node.exact = Some(id);
        }
    }

    /// Resolves a concrete subject to the most specific registered pattern,
    /// or `None` when nothing matches.
    pub fn resolve(&self, subject: &str) -> Option<&str> {
        let tokens = tokenize(subject);
        let total = tokens.len();

        struct Frame<'a> {
            node: &'a Node,
            consumed: usize,
            /// One rank per consumed token, root first.
            ranks: Vec<u8>,
        }

        // (per-token ranks, exact-over-tail, recency stamp, pattern id);
        // ranks are padded to the input length so comparison is elementwise
        // from the root.
        type Candidate = (Vec<u8>, u8, u64, usize);
        let mut best: Option<Candidate> = None;
        fn consider(candidate: Candidate, best: &mut Option<Candidate>) {
            let better = match best {
                Some(current) => {
                    (&candidate.0, candidate.1, candidate.2)
                        > (&current.0, current.1, current.2)
                }
                None => true,
            };
            if better {
                *best = Some(candidate);
            }
        }

        let mut stack = vec![Frame {
            node: &self.root,
            consumed: 0,
            ranks: Vec::new(),
        }];
        while let Some(frame) = stack.pop() {
            // `>` requires at least one remaining token.
            if frame.consumed < total {
                if let Some(id) = frame.node.tail {
                    let mut ranks = frame.ranks.clone();
                    ranks.resize(total, 0);
                    consider((ranks, 0, self.stamps[id], id), &mut best);
                }
            }
            if frame.consumed == total {
                if let Some(id) = frame.node.exact {
                    consider((frame.ranks, 1, self.stamps[id], id), &mut best);
                }
                continue;
            }
            let (start, end) = tokens[frame.consumed];
            let token = &subject[start..end];
            if let Some(child) = &frame.node.wildcard {
                let mut ranks = frame.ranks.clone();
                ranks.push(WILDCARD_RANK);
                stack.push(Frame {
                    node: child,
                    consumed: frame.consumed + 1,
                    ranks,
                });
            }
            if let Some(child) = frame.node.literal.get(token) {
                let mut ranks = frame.ranks;
                ranks.push(LITERAL_RANK);
                stack.push(Frame {
                    node: child,
                    consumed: frame.consumed + 1,
                    ranks,
                });
            }
        }

        best.map(|(_, _, _, id)| self.patterns[id].as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Number of distinct registered patterns.
    pub fn len(&self) -> usize {
        self.patterns.len()
    }
}

/// Token boundaries as index ranges over the input; empty tokens skipped.
fn tokenize(subject: &str) -> Vec<(usize, usize)> {
    let mut tokens = Vec::new();
    let mut start = 0;
    for (idx, byte) in subject.bytes().enumerate() {
        if byte == b'.' {
            if idx > start {
                tokens.push((start, idx));
            }
            start = idx + 1;
        }
    }
    if subject.len() > start {
        tokens.push((start, subject.len()));
    }
    tokens
}

/// Returns true when `pattern` captures every concrete subject that
/// `candidate` can match. Both sides may carry wildcards; a concrete
/// `candidate` degenerates to plain subject matching.
pub fn covers(pattern: &str, candidate: &str) -> bool {
    let p: Vec<&str> = pattern.split('.').filter(|t| !t.is_empty()).collect();
    let c: Vec<&str> = candidate.split('.').filter(|t| !t.is_empty()).collect();
    covers_tokens(&p, &c)
}

fn covers_tokens(pattern: &[&str], candidate: &[&str]) -> bool {
    match (pattern.first(), candidate.first()) {
        // `>` captures whatever remains, as long as something remains.
        (Some(&">"), Some(_)) => true,
        (Some(&">"), None) => false,
        (None, None) => true,
        (None, Some(_)) | (Some(_), None) => false,
        // `*` pins exactly one token; a candidate `>` is unbounded here.
        (Some(&"*"), Some(&">")) => false,
        (Some(&"*"), Some(_)) => covers_tokens(&pattern[1..], &candidate[1..]),
        (Some(&literal), Some(&head)) => {
            literal == head && covers_tokens(&pattern[1..], &candidate[1..])
        }
    }
}
