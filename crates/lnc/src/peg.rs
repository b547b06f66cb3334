//! Hand-written PEG-style combinator engine.
//!
//! The grammar is a graph of reference-counted [`Rule`]s built from a small
//! combinator set: literals, keywords, character sets, negated literals,
//! optional/zero-or-more/one-or-more repetition, concatenation, ordered
//! choice, named nodes (the record/tagged-union producers), and late-bound
//! slots for circular references.
//!
//! Matching is greedy with backtracking at choice points. The parser tracks
//! the deepest failure offset and the terminal alternatives expected there,
//! which becomes the syntax error when no parse covers the whole input.
//! Comments are blanked out (not removed) before parsing so every node keeps
//! its original line and column.

use std::{cell::RefCell, rc::Rc};

use crate::error::{CompileError, CompileResult, SourceLoc};

/// Identifiers may not collide with statement or declaration keywords; the
/// parser refuses these so that blockless conditionals and emit/return
/// statements terminate the preceding expression.
const RESERVED: &[&str] = &[
    "as", "const", "else", "emit", "event", "export", "false", "fn", "from", "if", "import", "infix", "interface",
    "let", "new", "on", "precedence", "prefix", "return", "true", "type",
];

pub(crate) type RuleRef = Rc<Rule>;

/// One grammar rule. Composite rules own their sub-rules by `Rc`, so shared
/// rules (whitespace, identifiers) are built once.
pub(crate) struct Rule {
    kind: RuleKind,
}

enum RuleKind {
    /// Exact text.
    Lit(&'static str),
    /// Exact text followed by a non-identifier character (or end of input).
    Keyword(&'static str),
    /// One character inside (or, negated, outside) the given ranges.
    CharSet {
        label: &'static str,
        ranges: Vec<(char, char)>,
        negated: bool,
    },
    /// One character, provided the input at this position does not start
    /// with the given literal. Used for string bodies.
    NotLit(&'static str),
    /// An identifier that is not a reserved word.
    Ident,
    Opt(RuleRef),
    Star(RuleRef),
    Plus(RuleRef),
    Seq(Vec<RuleRef>),
    Choice(Vec<RuleRef>),
    /// Zero-width negative lookahead: succeeds without consuming input when
    /// the sub-rule fails to match here.
    NotAhead(RuleRef),
    /// Wrap whatever the sub-rule consumes in a node carrying this name.
    Named(&'static str, RuleRef),
    /// Late-bound slot, filled after construction to close grammar cycles.
    Slot(RefCell<Option<RuleRef>>),
}

pub(crate) fn lit(text: &'static str) -> RuleRef {
    Rc::new(Rule { kind: RuleKind::Lit(text) })
}

pub(crate) fn kw(text: &'static str) -> RuleRef {
    Rc::new(Rule {
        kind: RuleKind::Keyword(text),
    })
}

pub(crate) fn charset(label: &'static str, ranges: &[(char, char)]) -> RuleRef {
    Rc::new(Rule {
        kind: RuleKind::CharSet {
            label,
            ranges: ranges.to_vec(),
            negated: false,
        },
    })
}

pub(crate) fn not_charset(label: &'static str, ranges: &[(char, char)]) -> RuleRef {
    Rc::new(Rule {
        kind: RuleKind::CharSet {
            label,
            ranges: ranges.to_vec(),
            negated: true,
        },
    })
}

pub(crate) fn not_lit(text: &'static str) -> RuleRef {
    Rc::new(Rule {
        kind: RuleKind::NotLit(text),
    })
}

pub(crate) fn ident() -> RuleRef {
    Rc::new(Rule { kind: RuleKind::Ident })
}

pub(crate) fn opt(rule: RuleRef) -> RuleRef {
    Rc::new(Rule { kind: RuleKind::Opt(rule) })
}

pub(crate) fn star(rule: RuleRef) -> RuleRef {
    Rc::new(Rule { kind: RuleKind::Star(rule) })
}

pub(crate) fn plus(rule: RuleRef) -> RuleRef {
    Rc::new(Rule { kind: RuleKind::Plus(rule) })
}

pub(crate) fn seq(rules: Vec<RuleRef>) -> RuleRef {
    Rc::new(Rule { kind: RuleKind::Seq(rules) })
}

pub(crate) fn choice(rules: Vec<RuleRef>) -> RuleRef {
    Rc::new(Rule {
        kind: RuleKind::Choice(rules),
    })
}

pub(crate) fn not_ahead(rule: RuleRef) -> RuleRef {
    Rc::new(Rule {
        kind: RuleKind::NotAhead(rule),
    })
}

pub(crate) fn named(name: &'static str, rule: RuleRef) -> RuleRef {
    Rc::new(Rule {
        kind: RuleKind::Named(name, rule),
    })
}

/// A record node: named fields matched in sequence. Fields with a `Some`
/// name become queryable children; `None` fields (punctuation, whitespace)
/// only consume input.
pub(crate) fn named_and(name: &'static str, fields: Vec<(Option<&'static str>, RuleRef)>) -> RuleRef {
    let parts = fields
        .into_iter()
        .map(|(field, rule)| match field {
            Some(n) => named(n, rule),
            None => rule,
        })
        .collect();
    named(name, seq(parts))
}

/// A tagged union node: ordered alternatives, each of which should itself be
/// a named rule so the match records which branch won.
pub(crate) fn named_or(name: &'static str, alternatives: Vec<RuleRef>) -> RuleRef {
    named(name, choice(alternatives))
}

/// Creates an empty slot rule. Bind it once the referenced rule exists.
pub(crate) fn slot() -> RuleRef {
    Rc::new(Rule {
        kind: RuleKind::Slot(RefCell::new(None)),
    })
}

/// Fills a slot created by [`slot`].
///
/// # Panics
/// Panics when called on a non-slot rule or an already-bound slot.
pub(crate) fn bind_slot(slot: &RuleRef, target: RuleRef) {
    match &slot.kind {
        RuleKind::Slot(cell) => {
            let mut cell = cell.borrow_mut();
            assert!(cell.is_none(), "grammar slot bound twice");
            *cell = Some(target);
        }
        _ => panic!("bind_slot called on a non-slot rule"),
    }
}

/// One node of the parse tree.
///
/// Nodes are produced by `Named` rules only; everything else just consumes
/// input. A node records its span in the comment-blanked source, its
/// position, and its named children in match order.
#[derive(Debug)]
pub(crate) struct Node {
    pub name: &'static str,
    src: Rc<str>,
    file: Rc<str>,
    pub start: usize,
    pub end: usize,
    pub line: u32,
    pub column: u32,
    children: Vec<Rc<Node>>,
}

impl Node {
    /// The source slice this node covers.
    pub fn text(&self) -> &str {
        &self.src[self.start..self.end]
    }

    /// Whether a direct child with the given rule name exists.
    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// First direct child with the given rule name.
    pub fn get(&self, name: &str) -> Option<&Rc<Node>> {
        self.children.iter().find(|c| c.name == name)
    }

    /// All direct children with the given rule name, in match order.
    pub fn get_all(&self, name: &str) -> Vec<&Rc<Node>> {
        self.children.iter().filter(|c| c.name == name).collect()
    }

    /// All direct children regardless of name, in match order.
    pub fn children(&self) -> &[Rc<Node>] {
        &self.children
    }

    /// Source location of this node, with the whole source line as excerpt.
    pub fn loc(&self) -> SourceLoc {
        let line_start = self.src[..self.start].rfind('\n').map_or(0, |i| i + 1);
        let line_end = self.src[line_start..].find('\n').map_or(self.src.len(), |i| line_start + i);
        SourceLoc::new(
            self.file.to_string(),
            self.line,
            self.column,
            self.src[line_start..line_end].trim_end().to_string(),
        )
    }
}

/// Blanks `//…` and `/*…*/` comments with spaces, preserving newlines so
/// line numbers survive. String literals are respected: comment markers
/// inside quotes are left alone.
pub(crate) fn blank_comments(src: &str) -> String {
    enum Mode {
        Code,
        Line,
        Block,
        Str(char),
    }
    let mut out = String::with_capacity(src.len());
    let mut mode = Mode::Code;
    let mut chars = src.chars().peekable();
    while let Some(c) = chars.next() {
        match mode {
            Mode::Code => match c {
                '/' if chars.peek() == Some(&'/') => {
                    chars.next();
                    out.push_str("  ");
                    mode = Mode::Line;
                }
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    out.push_str("  ");
                    mode = Mode::Block;
                }
                '\'' | '"' => {
                    out.push(c);
                    mode = Mode::Str(c);
                }
                _ => out.push(c),
            },
            Mode::Line => {
                if c == '\n' {
                    out.push('\n');
                    mode = Mode::Code;
                } else {
                    out.push(' ');
                }
            }
            Mode::Block => {
                if c == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    out.push_str("  ");
                    mode = Mode::Code;
                } else if c == '\n' {
                    out.push('\n');
                } else {
                    out.push(' ');
                }
            }
            Mode::Str(quote) => {
                out.push(c);
                if c == '\\' {
                    if let Some(&next) = chars.peek() {
                        out.push(next);
                        chars.next();
                    }
                } else if c == quote {
                    mode = Mode::Code;
                }
            }
        }
    }
    out
}

/// Parses `src` against the grammar rooted at `root`, which must consume the
/// entire input. Trailing content is a syntax error, not a partial success.
pub(crate) fn parse(root: &RuleRef, src: &str, file: &str) -> CompileResult<Rc<Node>> {
    let blanked: Rc<str> = blank_comments(src).into();
    let file: Rc<str> = file.into();
    let mut parser = Parser {
        src: Rc::clone(&blanked),
        file: Rc::clone(&file),
        line_starts: line_starts(&blanked),
        deepest: 0,
        expected: Vec::new(),
    };
    let result = parser.apply(root, 0);
    match result {
        Some((end, mut nodes)) if end == blanked.len() => {
            debug_assert_eq!(nodes.len(), 1, "grammar root must be a named rule");
            Ok(nodes.remove(0))
        }
        _ => Err(parser.syntax_error()),
    }
}

fn line_starts(src: &str) -> Vec<usize> {
    let mut starts = vec![0];
    for (i, b) in src.bytes().enumerate() {
        if b == b'\n' {
            starts.push(i + 1);
        }
    }
    starts
}

struct Parser {
    src: Rc<str>,
    file: Rc<str>,
    line_starts: Vec<usize>,
    deepest: usize,
    expected: Vec<String>,
}

impl Parser {
    fn apply(&mut self, rule: &RuleRef, pos: usize) -> Option<(usize, Vec<Rc<Node>>)> {
        match &rule.kind {
            RuleKind::Lit(text) => self.match_text(pos, text, false),
            RuleKind::Keyword(text) => self.match_text(pos, text, true),
            RuleKind::CharSet { label, ranges, negated } => {
                let c = self.src[pos..].chars().next();
                match c {
                    Some(c) if ranges.iter().any(|&(lo, hi)| c >= lo && c <= hi) != *negated => {
                        Some((pos + c.len_utf8(), Vec::new()))
                    }
                    _ => {
                        self.fail(pos, label);
                        None
                    }
                }
            }
            RuleKind::NotLit(text) => {
                if self.src[pos..].starts_with(text) || pos >= self.src.len() {
                    self.fail(pos, &format!("anything but \"{text}\""));
                    None
                } else {
                    let c = self.src[pos..].chars().next()?;
                    Some((pos + c.len_utf8(), Vec::new()))
                }
            }
            RuleKind::Ident => {
                let rest = &self.src[pos..];
                let mut len = 0;
                for (i, c) in rest.char_indices() {
                    let ok = if i == 0 {
                        c.is_ascii_alphabetic() || c == '_'
                    } else {
                        c.is_ascii_alphanumeric() || c == '_'
                    };
                    if !ok {
                        break;
                    }
                    len = i + c.len_utf8();
                }
                if len == 0 || RESERVED.contains(&&rest[..len]) {
                    self.fail(pos, "identifier");
                    None
                } else {
                    Some((pos + len, Vec::new()))
                }
            }
            RuleKind::Opt(inner) => Some(self.apply(inner, pos).unwrap_or((pos, Vec::new()))),
            RuleKind::Star(inner) => {
                let mut at = pos;
                let mut nodes = Vec::new();
                while let Some((next, sub)) = self.apply(inner, at) {
                    if next == at {
                        break;
                    }
                    at = next;
                    nodes.extend(sub);
                }
                Some((at, nodes))
            }
            RuleKind::Plus(inner) => {
                let (mut at, mut nodes) = self.apply(inner, pos)?;
                while let Some((next, sub)) = self.apply(inner, at) {
                    if next == at {
                        break;
                    }
                    at = next;
                    nodes.extend(sub);
                }
                Some((at, nodes))
            }
            RuleKind::Seq(parts) => {
                let mut at = pos;
                let mut nodes = Vec::new();
                for part in parts {
                    let (next, sub) = self.apply(part, at)?;
                    at = next;
                    nodes.extend(sub);
                }
                Some((at, nodes))
            }
            RuleKind::Choice(alternatives) => {
                for alternative in alternatives {
                    if let Some(hit) = self.apply(alternative, pos) {
                        return Some(hit);
                    }
                }
                None
            }
            RuleKind::NotAhead(inner) => {
                // Failures inside a lookahead are not real expectations.
                let saved_deepest = self.deepest;
                let saved_expected = std::mem::take(&mut self.expected);
                let hit = self.apply(inner, pos).is_some();
                self.deepest = saved_deepest;
                self.expected = saved_expected;
                if hit { None } else { Some((pos, Vec::new())) }
            }
            RuleKind::Named(name, inner) => {
                let (end, children) = self.apply(inner, pos)?;
                let (line, column) = self.position(pos);
                let node = Rc::new(Node {
                    name,
                    src: Rc::clone(&self.src),
                    file: Rc::clone(&self.file),
                    start: pos,
                    end,
                    line,
                    column,
                    children,
                });
                Some((end, vec![node]))
            }
            RuleKind::Slot(cell) => {
                let target = cell.borrow().as_ref().map(Rc::clone);
                let target = target.expect("grammar slot used before binding");
                self.apply(&target, pos)
            }
        }
    }

    fn match_text(&mut self, pos: usize, text: &'static str, boundary: bool) -> Option<(usize, Vec<Rc<Node>>)> {
        if self.src[pos..].starts_with(text) {
            let end = pos + text.len();
            let boundary_ok = !boundary
                || self.src[end..]
                    .chars()
                    .next()
                    .is_none_or(|c| !c.is_ascii_alphanumeric() && c != '_');
            if boundary_ok {
                return Some((end, Vec::new()));
            }
        }
        self.fail(pos, &format!("\"{text}\""));
        None
    }

    fn fail(&mut self, pos: usize, expected: &str) {
        if pos > self.deepest {
            self.deepest = pos;
            self.expected.clear();
        }
        if pos == self.deepest && !self.expected.iter().any(|e| e == expected) {
            self.expected.push(expected.to_string());
        }
    }

    fn position(&self, pos: usize) -> (u32, u32) {
        let line = self.line_starts.partition_point(|&s| s <= pos) - 1;
        (line as u32 + 1, (pos - self.line_starts[line]) as u32 + 1)
    }

    fn syntax_error(&self) -> CompileError {
        let (line, column) = self.position(self.deepest);
        let line_start = self.line_starts[line as usize - 1];
        let line_end = self.src[line_start..].find('\n').map_or(self.src.len(), |i| line_start + i);
        CompileError::Syntax {
            loc: SourceLoc::new(
                self.file.to_string(),
                line,
                column,
                self.src[line_start..line_end].trim_end().to_string(),
            ),
            expected: self.expected.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn digits() -> RuleRef {
        plus(charset("digit", &[('0', '9')]))
    }

    #[test]
    fn blank_comments_preserves_lines_and_strings() {
        let src = "a // one\nb /* two\nlines */ c\n'// not a comment'";
        let out = blank_comments(src);
        assert_eq!(out.matches('\n').count(), src.matches('\n').count());
        assert!(out.contains("'// not a comment'"));
        assert!(!out.contains("one"));
        assert!(!out.contains("lines"));
    }

    #[test]
    fn named_and_exposes_fields() {
        let rule = named_and(
            "pair",
            vec![
                (Some("left"), digits()),
                (None, lit(",")),
                (Some("right"), digits()),
            ],
        );
        let tree = parse(&rule, "12,34", "test.ln").unwrap();
        assert_eq!(tree.name, "pair");
        assert_eq!(tree.get("left").unwrap().text(), "12");
        assert_eq!(tree.get("right").unwrap().text(), "34");
        assert!(!tree.has("middle"));
    }

    #[test]
    fn named_or_tags_the_winning_alternative() {
        let rule = named_or(
            "value",
            vec![named("number", digits()), named("word", ident())],
        );
        let tree = parse(&rule, "abc", "test.ln").unwrap();
        assert!(tree.has("word"));
        assert!(!tree.has("number"));
    }

    #[test]
    fn deepest_failure_wins() {
        let rule = named_and(
            "pair",
            vec![(Some("left"), digits()), (None, lit(",")), (Some("right"), digits())],
        );
        let err = parse(&rule, "12,x", "test.ln").unwrap_err();
        match err {
            CompileError::Syntax { loc, expected } => {
                assert_eq!((loc.line, loc.column), (1, 4));
                assert_eq!(expected, vec!["digit".to_string()]);
            }
            other => panic!("expected syntax error, got {other:?}"),
        }
    }

    #[test]
    fn trailing_input_is_an_error() {
        let rule = named("number", digits());
        assert!(parse(&rule, "12 ", "test.ln").is_err());
    }

    #[test]
    fn slot_closes_cycles() {
        // nested = "(" nested? ")"
        let inner = slot();
        let nested = named_and(
            "nested",
            vec![(None, lit("(")), (Some("body"), opt(Rc::clone(&inner))), (None, lit(")"))],
        );
        bind_slot(&inner, Rc::clone(&nested));
        let tree = parse(&nested, "((()))", "test.ln").unwrap();
        assert!(tree.get("body").is_some());
    }

    #[test]
    fn reserved_words_are_not_identifiers() {
        let rule = named("name", ident());
        assert!(parse(&rule, "return", "test.ln").is_err());
        assert!(parse(&rule, "returning", "test.ln").is_ok());
    }

    #[test]
    fn keyword_requires_boundary() {
        let rule = seq(vec![kw("on"), ident()]);
        assert!(parse(&named("x", Rc::clone(&rule)), "once", "t.ln").is_err());
    }
}
