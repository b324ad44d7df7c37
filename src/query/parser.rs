//! Recursive-descent query parser.
//!
//! Produces statement ASTs with tag predicates already translated against the
//! dictionary: string lookups happen once at parse time, so filter evaluation
//! is pure integer work. Unknown keys and values collapse to constant
//! predicates; absent ordered literals are rewritten against the next lower
//! stored value with the operator adjusted to preserve the string-order
//! semantics.
//!
//! `AND` binds tighter than `OR`. A `this.`-rooted statement is only legal as
//! a filter term, and `child_relations` only inside a sub-statement whose
//! enclosing statement selects relations.

use std::collections::HashSet;

use crate::error::{OsmGridError, Result};
use crate::geometry::BoundingBox;
use crate::grid::CellIndex;
use crate::model::ObjectType;
use crate::tag_index::TagIndex;

use super::lexer::{tokenize, Token, TokenKind};

// ── AST ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeSelector {
    Nodes,
    Ways,
    Relations,
    ChildRelations,
}

impl TypeSelector {
    pub fn object_type(&self) -> ObjectType {
        match self {
            TypeSelector::Nodes => ObjectType::Node,
            TypeSelector::Ways => ObjectType::Way,
            TypeSelector::Relations | TypeSelector::ChildRelations => ObjectType::Relation,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Location {
    Bbox(BoundingBox),
}

#[derive(Debug, PartialEq)]
pub struct Statement {
    pub location: Location,
    pub selector: TypeSelector,
    pub filter: FilterExpr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    pub fn eval(&self, left: u32, right: u32) -> bool {
        match self {
            CompareOp::Eq => left == right,
            CompareOp::Ne => left != right,
            CompareOp::Lt => left < right,
            CompareOp::Le => left <= right,
            CompareOp::Gt => left > right,
            CompareOp::Ge => left >= right,
        }
    }

    fn from_text(text: &str) -> Option<Self> {
        match text {
            "=" => Some(CompareOp::Eq),
            "!=" => Some(CompareOp::Ne),
            "<" => Some(CompareOp::Lt),
            "<=" => Some(CompareOp::Le),
            ">" => Some(CompareOp::Gt),
            ">=" => Some(CompareOp::Ge),
            _ => None,
        }
    }
}

#[derive(Debug, PartialEq)]
pub enum FilterExpr {
    /// `true`, `false`, and the collapse target for unknown keys/values.
    Const(bool),
    /// `key=*`
    HasKey(u32),
    /// `key!=*` with a known key; with an unknown key it collapses to true.
    NotHasKey(u32),
    /// Integer comparison against the dictionary's value order. Missing key
    /// short-circuits to false.
    Compare {
        key_id: u32,
        op: CompareOp,
        value_id: u32,
    },
    And(Box<FilterExpr>, Box<FilterExpr>),
    Or(Box<FilterExpr>, Box<FilterExpr>),
    Not(Box<FilterExpr>),
    Sub(SubStatement),
}

/// `this.`-rooted sub-statement used as a predicate. Owns the scan caches
/// for one query's lifetime: `cached_cells` guarantees every cell is scanned
/// at most once per sub-statement, and `id_cache` grows monotonically with
/// the ids touched by matching inner features.
#[derive(Debug, PartialEq)]
pub struct SubStatement {
    pub selector: TypeSelector,
    pub filter: Box<FilterExpr>,
    pub cached_cells: HashSet<CellIndex>,
    pub relations_scanned: bool,
    pub id_cache: HashSet<(ObjectType, u64)>,
}

impl SubStatement {
    fn new(selector: TypeSelector, filter: FilterExpr) -> Self {
        Self {
            selector,
            filter: Box::new(filter),
            cached_cells: HashSet::new(),
            relations_scanned: false,
            id_cache: HashSet::new(),
        }
    }
}

// ── Parser ─────────────────────────────────────────────────────────

/// Parse a query into its statements, translating tag predicates against
/// `tags`.
pub fn parse_query(input: &str, tags: &TagIndex) -> Result<Vec<Statement>> {
    let tokens = tokenize(input)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        end: input.len(),
        tags,
    };
    let mut statements = Vec::new();
    loop {
        statements.push(parser.statement()?);
        if parser.peek().is_none() {
            break;
        }
    }
    Ok(statements)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    /// Byte length of the input, reported as the position of end-of-input
    /// errors.
    end: usize,
    tags: &'a TagIndex,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<&Token> {
        let token = self.tokens.get(self.pos);
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn error(&self, expected: &str) -> OsmGridError {
        match self.peek() {
            Some(token) => OsmGridError::Parse {
                position: token.pos,
                expected: expected.to_string(),
                found: format!("'{}'", token.text),
            },
            None => OsmGridError::Parse {
                position: self.end,
                expected: expected.to_string(),
                found: "end of input".to_string(),
            },
        }
    }

    fn expect(&mut self, kind: TokenKind, expected: &str) -> Result<Token> {
        let found = matches!(self.peek(), Some(t) if t.kind == kind);
        if found {
            Ok(self.advance().expect("token peeked above").clone())
        } else {
            Err(self.error(expected))
        }
    }

    fn peek_keyword(&self, word: &str) -> bool {
        matches!(self.peek(), Some(t) if t.kind == TokenKind::Keyword && t.text == word)
    }

    // statement := 'bbox' '(' number{4} ')' '.' type '{' filter '}'
    fn statement(&mut self) -> Result<Statement> {
        if self.peek_keyword("this") {
            return Err(self.error("'bbox' ('this' is only valid inside a sub-statement)"));
        }
        let keyword = self.expect(TokenKind::Keyword, "'bbox'")?;
        if keyword.text != "bbox" {
            return Err(OsmGridError::Parse {
                position: keyword.pos,
                expected: "'bbox'".to_string(),
                found: format!("'{}'", keyword.text),
            });
        }
        self.expect(TokenKind::OpenParen, "'('")?;
        let min_lon = self.number()?;
        let min_lat = self.number()?;
        let max_lon = self.number()?;
        let max_lat = self.number()?;
        self.expect(TokenKind::CloseParen, "')'")?;
        self.expect(TokenKind::Dot, "'.'")?;

        let selector_pos = self.peek().map(|t| t.pos).unwrap_or(self.end);
        let selector = self.selector()?;
        if selector == TypeSelector::ChildRelations {
            return Err(OsmGridError::Parse {
                position: selector_pos,
                expected: "'nodes', 'ways' or 'relations'".to_string(),
                found: "'child_relations' (only valid inside a sub-statement)".to_string(),
            });
        }

        self.expect(TokenKind::OpenBrace, "'{'")?;
        let filter = self.or_filter(selector)?;
        self.expect(TokenKind::CloseBrace, "'}'")?;

        Ok(Statement {
            location: Location::Bbox(BoundingBox::new(min_lon, min_lat, max_lon, max_lat)),
            selector,
            filter,
        })
    }

    fn number(&mut self) -> Result<f64> {
        let token = self.expect(TokenKind::Number, "a number")?;
        token.text.parse::<f64>().map_err(|_| OsmGridError::Parse {
            position: token.pos,
            expected: "a number".to_string(),
            found: format!("'{}'", token.text),
        })
    }

    fn selector(&mut self) -> Result<TypeSelector> {
        let token = self.expect(
            TokenKind::Keyword,
            "'nodes', 'ways', 'relations' or 'child_relations'",
        )?;
        match token.text.as_str() {
            "nodes" => Ok(TypeSelector::Nodes),
            "ways" => Ok(TypeSelector::Ways),
            "relations" => Ok(TypeSelector::Relations),
            "child_relations" => Ok(TypeSelector::ChildRelations),
            other => Err(OsmGridError::Parse {
                position: token.pos,
                expected: "'nodes', 'ways', 'relations' or 'child_relations'".to_string(),
                found: format!("'{}'", other),
            }),
        }
    }

    // filter := and_filter ('OR' filter)?
    fn or_filter(&mut self, enclosing: TypeSelector) -> Result<FilterExpr> {
        let left = self.and_filter(enclosing)?;
        if self.peek_keyword("OR") {
            self.advance();
            let right = self.or_filter(enclosing)?;
            return Ok(FilterExpr::Or(Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    // and_filter := term ('AND' and_filter)?
    fn and_filter(&mut self, enclosing: TypeSelector) -> Result<FilterExpr> {
        let left = self.term(enclosing)?;
        if self.peek_keyword("AND") {
            self.advance();
            let right = self.and_filter(enclosing)?;
            return Ok(FilterExpr::And(Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn term(&mut self, enclosing: TypeSelector) -> Result<FilterExpr> {
        let (kind, text) = match self.peek() {
            Some(t) => (t.kind, t.text.clone()),
            None => return Err(self.error("a filter term")),
        };
        match (kind, text.as_str()) {
            (TokenKind::Operator, "!") => {
                self.advance();
                self.expect(TokenKind::OpenParen, "'(' after '!'")?;
                let inner = self.or_filter(enclosing)?;
                self.expect(TokenKind::CloseParen, "')'")?;
                Ok(FilterExpr::Not(Box::new(inner)))
            }
            (TokenKind::OpenParen, _) => {
                self.advance();
                let inner = self.or_filter(enclosing)?;
                self.expect(TokenKind::CloseParen, "')'")?;
                Ok(inner)
            }
            (TokenKind::Keyword, "this") => self.sub_statement(enclosing),
            (TokenKind::Keyword, "true") => {
                self.advance();
                Ok(FilterExpr::Const(true))
            }
            (TokenKind::Keyword, "false") => {
                self.advance();
                Ok(FilterExpr::Const(false))
            }
            (TokenKind::Keyword, _) => {
                let key = self.advance().expect("keyword peeked above").clone();
                self.tag_predicate(&key)
            }
            _ => Err(self.error("a filter term")),
        }
    }

    // 'this' '.' type '{' filter '}'
    fn sub_statement(&mut self, enclosing: TypeSelector) -> Result<FilterExpr> {
        self.advance(); // 'this'
        self.expect(TokenKind::Dot, "'.' after 'this'")?;
        let selector_pos = self.peek().map(|t| t.pos).unwrap_or(self.end);
        let selector = self.selector()?;
        if selector == TypeSelector::ChildRelations
            && !matches!(
                enclosing,
                TypeSelector::Relations | TypeSelector::ChildRelations
            )
        {
            return Err(OsmGridError::Parse {
                position: selector_pos,
                expected: "'nodes', 'ways' or 'relations'".to_string(),
                found: "'child_relations' (requires an enclosing relation statement)".to_string(),
            });
        }
        self.expect(TokenKind::OpenBrace, "'{'")?;
        let filter = self.or_filter(selector)?;
        self.expect(TokenKind::CloseBrace, "'}'")?;
        Ok(FilterExpr::Sub(SubStatement::new(selector, filter)))
    }

    // key op value — translated against the dictionary immediately.
    fn tag_predicate(&mut self, key: &Token) -> Result<FilterExpr> {
        let op_token = self.expect(TokenKind::Operator, "a comparison operator")?;
        let op = CompareOp::from_text(&op_token.text).ok_or_else(|| OsmGridError::Parse {
            position: op_token.pos,
            expected: "one of '=', '!=', '<', '<=', '>', '>='".to_string(),
            found: format!("'{}'", op_token.text),
        })?;

        let value_kind = self.peek().map(|t| t.kind);
        match value_kind {
            Some(TokenKind::Wildcard) => {
                let wildcard = self.advance().expect("wildcard peeked above").clone();
                match op {
                    CompareOp::Eq | CompareOp::Ne => Ok(self.has_key_predicate(&key.text, op)),
                    _ => Err(OsmGridError::Parse {
                        position: wildcard.pos,
                        expected: "a value ('*' is only valid with '=' or '!=')".to_string(),
                        found: "'*'".to_string(),
                    }),
                }
            }
            Some(TokenKind::Keyword) | Some(TokenKind::Number) => {
                let value = self.advance().expect("value peeked above").clone();
                Ok(self.value_predicate(&key.text, op, &value.text))
            }
            _ => Err(self.error("a value")),
        }
    }

    /// `key=*` / `key!=*`: presence and absence. An unknown key is present on
    /// nothing, so `=` collapses to false and `!=` to true.
    fn has_key_predicate(&self, key: &str, op: CompareOp) -> FilterExpr {
        match (self.tags.key_id(key), op) {
            (Some(key_id), CompareOp::Eq) => FilterExpr::HasKey(key_id),
            (Some(key_id), CompareOp::Ne) => FilterExpr::NotHasKey(key_id),
            (None, CompareOp::Eq) => FilterExpr::Const(false),
            (None, CompareOp::Ne) => FilterExpr::Const(true),
            _ => unreachable!("wildcard predicates only accept = and !="),
        }
    }

    /// `key op value` with a concrete literal.
    ///
    /// For `=`/`!=`, an unknown value can match nothing / anything carrying
    /// the key. For ordered operators, an absent literal is rewritten against
    /// the next lower stored value with the operator adjusted, which keeps
    /// the integer predicate faithful to the string-order comparison:
    /// `>= V` becomes `> lower(V)`, `< V` becomes `<= lower(V)`, and when V
    /// sorts below every stored value, `>`/`>=` accept any value (`>= 0`)
    /// while `<`/`<=` accept none.
    fn value_predicate(&self, key: &str, op: CompareOp, value: &str) -> FilterExpr {
        let key_id = match self.tags.key_id(key) {
            Some(id) => id,
            None => return FilterExpr::Const(false),
        };

        if let Some((value_id, exact)) = self.tags.next_lower_value_id(key_id, value) {
            if exact {
                return FilterExpr::Compare {
                    key_id,
                    op,
                    value_id,
                };
            }
            // Value absent, but a lower one exists.
            return match op {
                CompareOp::Eq => FilterExpr::Const(false),
                CompareOp::Ne => FilterExpr::HasKey(key_id),
                CompareOp::Gt | CompareOp::Ge => FilterExpr::Compare {
                    key_id,
                    op: CompareOp::Gt,
                    value_id,
                },
                CompareOp::Lt | CompareOp::Le => FilterExpr::Compare {
                    key_id,
                    op: CompareOp::Le,
                    value_id,
                },
            };
        }

        // Value sorts below every stored value of the key.
        match op {
            CompareOp::Eq => FilterExpr::Const(false),
            CompareOp::Ne => FilterExpr::HasKey(key_id),
            CompareOp::Gt | CompareOp::Ge => FilterExpr::Compare {
                key_id,
                op: CompareOp::Ge,
                value_id: 0,
            },
            CompareOp::Lt | CompareOp::Le => FilterExpr::Const(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag_index::TagIndexBuilder;

    fn dict() -> TagIndex {
        let mut b = TagIndexBuilder::new();
        for (k, v) in [
            ("a", "1"),
            ("a", "2"),
            ("b", "x"),
            ("b", "y"),
            ("width", "2"),
            ("width", "2.2"),
            ("width", "3"),
            ("building", "yes"),
        ] {
            b.insert(k, v);
        }
        b.finish().unwrap()
    }

    fn parse_one(input: &str) -> Statement {
        let dict = dict();
        let mut statements = parse_query(input, &dict).unwrap();
        assert_eq!(statements.len(), 1);
        statements.remove(0)
    }

    #[test]
    fn test_basic_statement() {
        let stmt = parse_one("bbox(0, 0, 0.2, 0.1).nodes{true}");
        assert_eq!(stmt.selector, TypeSelector::Nodes);
        let Location::Bbox(bbox) = stmt.location;
        assert_eq!(bbox.max_lon, 0.2);
        assert_eq!(stmt.filter, FilterExpr::Const(true));
    }

    #[test]
    fn test_equality_translated_to_ids() {
        let stmt = parse_one("bbox(0,0,1,1).nodes{a=2}");
        assert_eq!(
            stmt.filter,
            FilterExpr::Compare {
                key_id: 0,
                op: CompareOp::Eq,
                value_id: 1,
            }
        );
    }

    #[test]
    fn test_and_binds_tighter_than_or() {
        let stmt = parse_one("bbox(0,0,1,1).nodes{a=1 OR a=2 AND b=x}");
        // a=1 OR (a=2 AND b=x)
        match stmt.filter {
            FilterExpr::Or(left, right) => {
                assert!(matches!(*left, FilterExpr::Compare { .. }));
                assert!(matches!(*right, FilterExpr::And(_, _)));
            }
            other => panic!("expected OR at the root, got {:?}", other),
        }
    }

    #[test]
    fn test_negation_and_parens() {
        let stmt = parse_one("bbox(0,0,1,1).nodes{!(a=1 OR b=y)}");
        assert!(matches!(stmt.filter, FilterExpr::Not(_)));
    }

    #[test]
    fn test_wildcard_presence_and_absence() {
        assert_eq!(
            parse_one("bbox(0,0,1,1).nodes{building=*}").filter,
            FilterExpr::HasKey(3)
        );
        assert_eq!(
            parse_one("bbox(0,0,1,1).nodes{building!=*}").filter,
            FilterExpr::NotHasKey(3)
        );
        // Unknown key: trivially false / true.
        assert_eq!(
            parse_one("bbox(0,0,1,1).nodes{missing=*}").filter,
            FilterExpr::Const(false)
        );
        assert_eq!(
            parse_one("bbox(0,0,1,1).nodes{missing!=*}").filter,
            FilterExpr::Const(true)
        );
    }

    #[test]
    fn test_unknown_value_matches_nothing_or_any_keyed() {
        assert_eq!(
            parse_one("bbox(0,0,1,1).nodes{a=99}").filter,
            FilterExpr::Const(false)
        );
        assert_eq!(
            parse_one("bbox(0,0,1,1).nodes{a!=99}").filter,
            FilterExpr::HasKey(0)
        );
    }

    #[test]
    fn test_operator_adjustment_for_absent_value() {
        // width values: "2"(0) < "2.2"(1) < "3"(2); "2.5" sits between ids 1 and 2.
        assert_eq!(
            parse_one("bbox(0,0,1,1).ways{width>=2.5}").filter,
            FilterExpr::Compare {
                key_id: 2,
                op: CompareOp::Gt,
                value_id: 1,
            }
        );
        assert_eq!(
            parse_one("bbox(0,0,1,1).ways{width<2.5}").filter,
            FilterExpr::Compare {
                key_id: 2,
                op: CompareOp::Le,
                value_id: 1,
            }
        );
        // "1" sorts below all stored width values.
        assert_eq!(
            parse_one("bbox(0,0,1,1).ways{width>1}").filter,
            FilterExpr::Compare {
                key_id: 2,
                op: CompareOp::Ge,
                value_id: 0,
            }
        );
        assert_eq!(
            parse_one("bbox(0,0,1,1).ways{width<=1}").filter,
            FilterExpr::Const(false)
        );
    }

    #[test]
    fn test_sub_statement() {
        let stmt =
            parse_one("bbox(0,0,1,1).nodes{addr:housenumber!=* AND this.ways{building=*}}");
        match stmt.filter {
            FilterExpr::And(_, right) => match *right {
                FilterExpr::Sub(sub) => {
                    assert_eq!(sub.selector, TypeSelector::Ways);
                    assert!(sub.cached_cells.is_empty());
                    assert!(sub.id_cache.is_empty());
                }
                other => panic!("expected sub-statement, got {:?}", other),
            },
            other => panic!("expected AND, got {:?}", other),
        }
    }

    #[test]
    fn test_this_rejected_at_top_level() {
        let err = parse_query("this.nodes{true}", &dict()).unwrap_err();
        assert!(err.to_string().contains("sub-statement"), "got: {}", err);
    }

    #[test]
    fn test_child_relations_needs_relation_context() {
        let err =
            parse_query("bbox(0,0,1,1).nodes{this.child_relations{true}}", &dict()).unwrap_err();
        assert!(
            err.to_string().contains("child_relations"),
            "got: {}",
            err
        );

        let ok = parse_query(
            "bbox(0,0,1,1).relations{this.child_relations{true}}",
            &dict(),
        );
        assert!(ok.is_ok());
    }

    #[test]
    fn test_child_relations_rejected_at_top_level() {
        let err = parse_query("bbox(0,0,1,1).child_relations{true}", &dict()).unwrap_err();
        assert!(matches!(err, OsmGridError::Parse { .. }));
    }

    #[test]
    fn test_error_carries_position_and_expectation() {
        let err = parse_query("bbox(0,0,1,1).houses{true}", &dict()).unwrap_err();
        match err {
            OsmGridError::Parse {
                position,
                expected,
                found,
            } => {
                assert_eq!(position, 14);
                assert!(expected.contains("'nodes'"));
                assert_eq!(found, "'houses'");
            }
            other => panic!("expected parse error, got {:?}", other),
        }
    }

    #[test]
    fn test_unterminated_statement_reports_end_of_input() {
        let err = parse_query("bbox(0,0,1,1).nodes{a=1", &dict()).unwrap_err();
        match err {
            OsmGridError::Parse { found, .. } => assert_eq!(found, "end of input"),
            other => panic!("expected parse error, got {:?}", other),
        }
    }

    #[test]
    fn test_multiple_statements() {
        let dict = dict();
        let statements =
            parse_query("bbox(0,0,1,1).nodes{a=1} bbox(0,0,1,1).ways{b=x}", &dict).unwrap();
        assert_eq!(statements.len(), 2);
        assert_eq!(statements[1].selector, TypeSelector::Ways);
    }
}
