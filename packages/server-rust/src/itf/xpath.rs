//! A small XPath 1.0 subset evaluated over `scraper` documents.
//!
//! Supported: absolute and relative location paths, `/` and `//`, name
//! tests and `*`, `.` and `..`, and predicates built from `@attr`,
//! `text()`, `.`, child element names, string literals, `=` and `!=`,
//! `contains()`, `starts-with()`, `normalize-space()`, `not()`, `and`,
//! `or`, parentheses, and numeric positions.

use std::collections::HashSet;

use ego_tree::NodeId;
use scraper::{ElementRef, Html};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum XPathError {
    #[error("empty expression")]
    Empty,
    #[error("unexpected character {found:?} at offset {offset}")]
    UnexpectedChar { found: char, offset: usize },
    #[error("unterminated string literal")]
    UnterminatedLiteral,
    #[error("unexpected {found} in expression")]
    UnexpectedToken { found: String },
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("unsupported function {0}()")]
    UnsupportedFunction(String),
}

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Slash,
    DoubleSlash,
    LBracket,
    RBracket,
    LParen,
    RParen,
    At,
    Comma,
    Eq,
    NotEq,
    Dot,
    DotDot,
    Star,
    Name(String),
    Literal(String),
    Number(usize),
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Name(n) => write!(f, "name {n:?}"),
            Self::Literal(l) => write!(f, "literal {l:?}"),
            Self::Number(n) => write!(f, "number {n}"),
            other => write!(f, "{other:?}"),
        }
    }
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '-' | '_' | ':')
}

fn tokenize(input: &str) -> Result<Vec<Token>, XPathError> {
    let chars: Vec<(usize, char)> = input.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (offset, c) = chars[i];
        let next = chars.get(i + 1).map(|(_, c)| *c);
        match c {
            c if c.is_whitespace() => i += 1,
            '/' if next == Some('/') => {
                tokens.push(Token::DoubleSlash);
                i += 2;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '.' if next == Some('.') => {
                tokens.push(Token::DotDot);
                i += 2;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '!' if next == Some('=') => {
                tokens.push(Token::NotEq);
                i += 2;
            }
            '[' | ']' | '(' | ')' | '@' | ',' | '=' | '*' => {
                tokens.push(match c {
                    '[' => Token::LBracket,
                    ']' => Token::RBracket,
                    '(' => Token::LParen,
                    ')' => Token::RParen,
                    '@' => Token::At,
                    ',' => Token::Comma,
                    '=' => Token::Eq,
                    _ => Token::Star,
                });
                i += 1;
            }
            '\'' | '"' => {
                let quote = c;
                let start = i + 1;
                let end = chars[start..]
                    .iter()
                    .position(|(_, c)| *c == quote)
                    .map(|p| start + p)
                    .ok_or(XPathError::UnterminatedLiteral)?;
                tokens.push(Token::Literal(chars[start..end].iter().map(|(_, c)| c).collect()));
                i = end + 1;
            }
            c if c.is_ascii_digit() => {
                let mut value = 0usize;
                while let Some(d) = chars.get(i).and_then(|(_, c)| c.to_digit(10)) {
                    value = value.saturating_mul(10).saturating_add(d as usize);
                    i += 1;
                }
                tokens.push(Token::Number(value));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while chars.get(i).is_some_and(|(_, c)| is_name_char(*c)) {
                    i += 1;
                }
                tokens.push(Token::Name(chars[start..i].iter().map(|(_, c)| c).collect()));
            }
            found => return Err(XPathError::UnexpectedChar { found, offset }),
        }
    }
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Axis {
    Child,
    /// `//name`: children of the context node or any of its descendants.
    Descendant,
    SelfNode,
    Parent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum NodeTest {
    Name(String),
    Any,
}

#[derive(Debug, Clone, PartialEq)]
struct Step {
    axis: Axis,
    test: NodeTest,
    predicates: Vec<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Attr(String),
    Text,
    Context,
    Child(String),
    Literal(String),
    NormalizeSpace(Option<Box<Operand>>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Comparison {
    Eq,
    NotEq,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Position(usize),
    Exists(Operand),
    Compare(Operand, Comparison, Operand),
    Contains(Operand, Operand),
    StartsWith(Operand, Operand),
}

/// A compiled expression.
#[derive(Debug, Clone, PartialEq)]
pub struct XPath {
    steps: Vec<Step>,
}

impl XPath {
    /// Compiles `expr`.
    ///
    /// # Errors
    ///
    /// Returns an [`XPathError`] for syntax outside the supported subset.
    pub fn parse(expr: &str) -> Result<Self, XPathError> {
        let tokens = tokenize(expr)?;
        if tokens.is_empty() {
            return Err(XPathError::Empty);
        }
        let mut parser = Parser { tokens, pos: 0 };
        let steps = parser.path()?;
        match parser.peek() {
            None => Ok(Self { steps }),
            Some(token) => Err(XPathError::UnexpectedToken {
                found: token.to_string(),
            }),
        }
    }

    /// Matching elements, each reported once.
    #[must_use]
    pub fn select<'a>(&self, doc: &'a Html) -> Vec<ElementRef<'a>> {
        let mut current = vec![Node::Document(doc)];
        for step in &self.steps {
            let contexts: HashSet<NodeId> = current.iter().filter_map(|n| n.id()).collect();
            let mut seen: HashSet<Option<NodeId>> = HashSet::new();
            let mut next: Vec<Node<'a>> = Vec::new();
            for ctx in &current {
                // A descendant step from an ancestor context already reached this subtree.
                if matches!(step.axis, Axis::Descendant) && has_ancestor_in(*ctx, &contexts) {
                    continue;
                }
                for node in step.apply(*ctx, doc) {
                    if seen.insert(node.id()) {
                        next.push(node);
                    }
                }
            }
            current = next;
        }
        current
            .into_iter()
            .filter_map(|n| match n {
                Node::Element(el) => Some(el),
                Node::Document(_) => None,
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn next(&mut self) -> Result<Token, XPathError> {
        let token = self.tokens.get(self.pos).cloned().ok_or(XPathError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(token)
    }

    fn expect(&mut self, expected: &Token) -> Result<(), XPathError> {
        let token = self.next()?;
        if &token == expected {
            Ok(())
        } else {
            Err(XPathError::UnexpectedToken {
                found: token.to_string(),
            })
        }
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn path(&mut self) -> Result<Vec<Step>, XPathError> {
        let mut axis = if self.eat(&Token::DoubleSlash) {
            Axis::Descendant
        } else {
            self.eat(&Token::Slash);
            Axis::Child
        };
        let mut steps = Vec::new();
        loop {
            steps.push(self.step(axis)?);
            if self.eat(&Token::DoubleSlash) {
                axis = Axis::Descendant;
            } else if self.eat(&Token::Slash) {
                axis = Axis::Child;
            } else {
                return Ok(steps);
            }
        }
    }

    fn step(&mut self, axis: Axis) -> Result<Step, XPathError> {
        let (axis, test) = match self.next()? {
            Token::Dot => (Axis::SelfNode, NodeTest::Any),
            Token::DotDot => (Axis::Parent, NodeTest::Any),
            Token::Star => (axis, NodeTest::Any),
            Token::Name(name) => (axis, NodeTest::Name(name.to_ascii_lowercase())),
            other => {
                return Err(XPathError::UnexpectedToken {
                    found: other.to_string(),
                })
            }
        };
        let mut predicates = Vec::new();
        while self.eat(&Token::LBracket) {
            predicates.push(self.or_expr()?);
            self.expect(&Token::RBracket)?;
        }
        Ok(Step {
            axis,
            test,
            predicates,
        })
    }

    fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Name(n)) if n == keyword)
    }

    fn or_expr(&mut self) -> Result<Expr, XPathError> {
        let mut left = self.and_expr()?;
        while self.is_keyword("or") {
            self.pos += 1;
            let right = self.and_expr()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr, XPathError> {
        let mut left = self.unary()?;
        while self.is_keyword("and") {
            self.pos += 1;
            let right = self.unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, XPathError> {
        if self.eat(&Token::LParen) {
            let inner = self.or_expr()?;
            self.expect(&Token::RParen)?;
            return Ok(inner);
        }
        if let Some(Token::Number(n)) = self.peek() {
            let n = *n;
            self.pos += 1;
            return Ok(Expr::Position(n));
        }
        if let (Some(Token::Name(name)), Some(Token::LParen)) = (self.peek(), self.peek_at(1)) {
            let name = name.clone();
            match name.as_str() {
                "not" => {
                    self.pos += 2;
                    let inner = self.or_expr()?;
                    self.expect(&Token::RParen)?;
                    return Ok(Expr::Not(Box::new(inner)));
                }
                "contains" | "starts-with" => {
                    self.pos += 2;
                    let haystack = self.operand()?;
                    self.expect(&Token::Comma)?;
                    let needle = self.operand()?;
                    self.expect(&Token::RParen)?;
                    return Ok(if name == "contains" {
                        Expr::Contains(haystack, needle)
                    } else {
                        Expr::StartsWith(haystack, needle)
                    });
                }
                _ => {}
            }
        }

        let left = self.operand()?;
        let comparison = if self.eat(&Token::Eq) {
            Comparison::Eq
        } else if self.eat(&Token::NotEq) {
            Comparison::NotEq
        } else {
            return Ok(Expr::Exists(left));
        };
        let right = self.operand()?;
        Ok(Expr::Compare(left, comparison, right))
    }

    fn operand(&mut self) -> Result<Operand, XPathError> {
        match self.next()? {
            Token::At => match self.next()? {
                Token::Name(name) => Ok(Operand::Attr(name)),
                other => Err(XPathError::UnexpectedToken {
                    found: other.to_string(),
                }),
            },
            Token::Dot => Ok(Operand::Context),
            Token::Literal(text) => Ok(Operand::Literal(text)),
            Token::Name(name) if self.peek() == Some(&Token::LParen) => {
                self.pos += 1;
                match name.as_str() {
                    "text" => {
                        self.expect(&Token::RParen)?;
                        Ok(Operand::Text)
                    }
                    "normalize-space" => {
                        if self.eat(&Token::RParen) {
                            return Ok(Operand::NormalizeSpace(None));
                        }
                        let inner = self.operand()?;
                        self.expect(&Token::RParen)?;
                        Ok(Operand::NormalizeSpace(Some(Box::new(inner))))
                    }
                    _ => Err(XPathError::UnsupportedFunction(name)),
                }
            }
            Token::Name(name) => Ok(Operand::Child(name.to_ascii_lowercase())),
            other => Err(XPathError::UnexpectedToken {
                found: other.to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
enum Node<'a> {
    Document(&'a Html),
    Element(ElementRef<'a>),
}

impl Node<'_> {
    /// Tree id of an element; the document itself has none.
    fn id(&self) -> Option<NodeId> {
        match self {
            Node::Document(_) => None,
            Node::Element(el) => Some(el.id()),
        }
    }
}

fn has_ancestor_in(node: Node<'_>, ids: &HashSet<NodeId>) -> bool {
    match node {
        Node::Document(_) => false,
        Node::Element(el) => el.ancestors().any(|a| ids.contains(&a.id())),
    }
}

fn child_elements(node: Node<'_>) -> Vec<ElementRef<'_>> {
    match node {
        Node::Document(doc) => vec![doc.root_element()],
        Node::Element(el) => el.children().filter_map(ElementRef::wrap).collect(),
    }
}

fn self_and_descendants(node: Node<'_>) -> Vec<Node<'_>> {
    match node {
        Node::Document(doc) => std::iter::once(node)
            .chain(
                doc.root_element()
                    .descendants()
                    .filter_map(ElementRef::wrap)
                    .map(Node::Element),
            )
            .collect(),
        Node::Element(el) => el
            .descendants()
            .filter_map(ElementRef::wrap)
            .map(Node::Element)
            .collect(),
    }
}

fn parent_of<'a>(node: Node<'a>, doc: &'a Html) -> Option<Node<'a>> {
    let Node::Element(el) = node else {
        return None;
    };
    let parent = el.parent()?;
    match ElementRef::wrap(parent) {
        Some(p) => Some(Node::Element(p)),
        None if parent.value().is_document() => Some(Node::Document(doc)),
        None => None,
    }
}

impl Step {
    fn matches(&self, node: Node<'_>) -> bool {
        match (&self.test, node) {
            (NodeTest::Any, _) => true,
            (NodeTest::Name(name), Node::Element(el)) => el.value().name() == name,
            (NodeTest::Name(_), Node::Document(_)) => false,
        }
    }

    fn apply<'a>(&self, ctx: Node<'a>, doc: &'a Html) -> Vec<Node<'a>> {
        match self.axis {
            Axis::Child => self.filter(child_elements(ctx).into_iter().map(Node::Element).collect()),
            Axis::Descendant => self_and_descendants(ctx)
                .into_iter()
                .flat_map(|d| {
                    self.filter(child_elements(d).into_iter().map(Node::Element).collect())
                })
                .collect(),
            Axis::SelfNode => self.filter(vec![ctx]),
            Axis::Parent => self.filter(parent_of(ctx, doc).into_iter().collect()),
        }
    }

    /// Applies the node test, then each predicate in turn with positions
    /// relative to the nodes that survived the previous one.
    fn filter<'a>(&self, candidates: Vec<Node<'a>>) -> Vec<Node<'a>> {
        let mut nodes: Vec<Node<'a>> = candidates.into_iter().filter(|n| self.matches(*n)).collect();
        for predicate in &self.predicates {
            nodes = nodes
                .iter()
                .enumerate()
                .filter(|(idx, node)| match node {
                    Node::Element(el) => predicate.eval(*el, idx + 1),
                    Node::Document(_) => false,
                })
                .map(|(_, node)| *node)
                .collect();
        }
        nodes
    }
}

impl Expr {
    fn eval(&self, el: ElementRef<'_>, position: usize) -> bool {
        match self {
            Self::Or(a, b) => a.eval(el, position) || b.eval(el, position),
            Self::And(a, b) => a.eval(el, position) && b.eval(el, position),
            Self::Not(inner) => !inner.eval(el, position),
            Self::Position(n) => position == *n,
            Self::Exists(operand) => match operand {
                Operand::Literal(text) => !text.is_empty(),
                Operand::NormalizeSpace(_) => {
                    operand.values(el).first().is_some_and(|v| !v.is_empty())
                }
                _ => !operand.values(el).is_empty(),
            },
            Self::Compare(left, comparison, right) => {
                let (left, right) = (left.values(el), right.values(el));
                left.iter().any(|l| {
                    right.iter().any(|r| match comparison {
                        Comparison::Eq => l == r,
                        Comparison::NotEq => l != r,
                    })
                })
            }
            Self::Contains(haystack, needle) => {
                haystack.first_string(el).contains(&needle.first_string(el))
            }
            Self::StartsWith(haystack, needle) => {
                haystack.first_string(el).starts_with(&needle.first_string(el))
            }
        }
    }
}

impl Operand {
    /// The operand as a node-set of string values.
    fn values(&self, el: ElementRef<'_>) -> Vec<String> {
        match self {
            Self::Attr(name) => el.value().attr(name).map(str::to_string).into_iter().collect(),
            Self::Text => el
                .children()
                .filter_map(|n| n.value().as_text().map(|t| t.to_string()))
                .filter(|t| !t.is_empty())
                .collect(),
            Self::Context => vec![string_value(el)],
            Self::Child(name) => el
                .children()
                .filter_map(ElementRef::wrap)
                .filter(|c| c.value().name() == name)
                .map(string_value)
                .collect(),
            Self::Literal(text) => vec![text.clone()],
            Self::NormalizeSpace(inner) => {
                let raw = match inner {
                    Some(inner) => inner.first_string(el),
                    None => string_value(el),
                };
                vec![normalize_space(&raw)]
            }
        }
    }

    fn first_string(&self, el: ElementRef<'_>) -> String {
        self.values(el).into_iter().next().unwrap_or_default()
    }
}

fn string_value(el: ElementRef<'_>) -> String {
    el.text().collect()
}

fn normalize_space(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
        <html><body>
          <form id="user-form">
            <label for="email">Email</label>
            <input name="email" type="email" value="ada@example.com">
            <small data-testid="field-error" data-field-id="email">Email is taken</small>
            <select name="role">
              <option value="admin">Admin</option>
              <option value="viewer" selected>Viewer</option>
            </select>
            <button type="submit" class="btn btn-primary">  Save  changes </button>
          </form>
          <ul id="list"><li>one</li><li>two</li><li>three</li></ul>
        </body></html>
    "#;

    fn select(expr: &str) -> Vec<String> {
        let doc = Html::parse_document(PAGE);
        XPath::parse(expr)
            .unwrap()
            .select(&doc)
            .into_iter()
            .map(|el| string_value(el).trim().to_string())
            .collect()
    }

    #[test]
    fn descendant_name_test() {
        assert_eq!(select("//li"), vec!["one", "two", "three"]);
    }

    #[test]
    fn absolute_child_path() {
        assert_eq!(select("/html/body/ul/li").len(), 3);
        assert!(select("/body").is_empty());
    }

    #[test]
    fn attribute_equality_with_and() {
        let found = select("//small[@data-testid='field-error' and @data-field-id='email']");
        assert_eq!(found, vec!["Email is taken"]);
        assert!(select("//small[@data-testid='field-error' and @data-field-id='name']").is_empty());
    }

    #[test]
    fn attribute_presence_and_not() {
        assert_eq!(select("//option[@selected]"), vec!["Viewer"]);
        assert_eq!(select("//option[not(@selected)]"), vec!["Admin"]);
    }

    #[test]
    fn positions_are_per_parent() {
        assert_eq!(select("//ul/li[2]"), vec!["two"]);
        assert_eq!(select("//li[1]"), vec!["one"]);
    }

    #[test]
    fn string_functions() {
        assert_eq!(select("//button[contains(@class, 'btn-primary')]").len(), 1);
        assert_eq!(select("//input[starts-with(@value, 'ada@')]").len(), 1);
        assert_eq!(
            select("//button[normalize-space()='Save changes']").len(),
            1
        );
        assert_eq!(select("//li[text()='three' or .='one']"), vec!["one", "three"]);
    }

    #[test]
    fn parent_and_self_steps() {
        assert_eq!(select("//li[.='two']/..").len(), 1);
        let doc = Html::parse_document(PAGE);
        let ul = XPath::parse("//li[.='two']/..").unwrap().select(&doc);
        assert_eq!(ul[0].value().attr("id"), Some("list"));
        assert_eq!(select("//ul/.").len(), 1);
    }

    #[test]
    fn child_element_predicate() {
        let doc = Html::parse_document(PAGE);
        let forms = XPath::parse("//form[label='Email']").unwrap().select(&doc);
        assert_eq!(forms.len(), 1);
        assert_eq!(forms[0].value().attr("id"), Some("user-form"));
    }

    #[test]
    fn wildcard_and_dedup() {
        // Every ancestor of the list reaches the same items; each is reported once.
        assert_eq!(select("//*//li").len(), 3);
        assert_eq!(select("//form/*[@name]").len(), 2);
    }

    #[test]
    fn nested_descendant_contexts_report_each_match_once() {
        let depth = 200;
        let markup = format!(
            "<html><body>{}<span>leaf</span>{}</body></html>",
            "<div><span>x</span>".repeat(depth),
            "</div>".repeat(depth)
        );
        let doc = Html::parse_document(&markup);

        let spans = XPath::parse("//div//span").unwrap().select(&doc);
        assert_eq!(spans.len(), depth + 1);
        let unique: HashSet<NodeId> = spans.iter().map(|el| el.id()).collect();
        assert_eq!(unique.len(), spans.len());
        assert_eq!(string_value(spans[0]), "x");
        assert_eq!(string_value(spans[depth]), "leaf");
    }

    #[test]
    fn syntax_errors() {
        assert_eq!(XPath::parse(""), Err(XPathError::Empty));
        assert_eq!(
            XPath::parse("//div[@id='x'"),
            Err(XPathError::UnexpectedEnd)
        );
        assert_eq!(
            XPath::parse("//div[@id='x]"),
            Err(XPathError::UnterminatedLiteral)
        );
        assert!(matches!(
            XPath::parse("//div[count(li)]"),
            Err(XPathError::UnsupportedFunction(name)) if name == "count"
        ));
        assert!(matches!(
            XPath::parse("//div#main"),
            Err(XPathError::UnexpectedChar { found: '#', .. })
        ));
    }
}
