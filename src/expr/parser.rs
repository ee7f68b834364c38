//! Recursive descent parser from tokens to [`Expr`].

use crate::error::ParseError;

use super::ast::{Axis, BinaryOp, Expr, NodeTest, PathExpr, PathStart, Step};
use super::lexer::{Spanned, Token, tokenize};

/// Parser output.
#[derive(Debug, Clone, PartialEq)]
pub struct Parsed {
    pub expr: Expr,
    /// Set when the source used syntax XPath 1.0 does not have: value
    /// comparisons, the `union` keyword, or sequence constructors.
    pub xpath2_syntax: bool,
}

pub fn parse(source: &str) -> Result<Parsed, ParseError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        source,
        tokens,
        pos: 0,
        xpath2_syntax: false,
    };
    let expr = parser.expr()?;
    if let Some(spanned) = parser.tokens.get(parser.pos) {
        return Err(ParseError::new(
            source,
            spanned.offset,
            format!("unexpected {:?} after complete expression", spanned.token),
        ));
    }
    Ok(Parsed {
        expr,
        xpath2_syntax: parser.xpath2_syntax,
    })
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Spanned>,
    pos: usize,
    xpath2_syntax: bool,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|spanned| &spanned.token)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|spanned| spanned.token.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|spanned| spanned.offset)
            .unwrap_or(self.source.len())
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError::new(self.source, self.offset(), message)
    }

    fn expect(&mut self, expected: Token) -> Result<(), ParseError> {
        match self.peek() {
            Some(token) if *token == expected => {
                self.pos += 1;
                Ok(())
            }
            Some(token) => Err(self.error(format!("expected {:?}, found {:?}", expected, token))),
            None => Err(self.error(format!("expected {:?}, found end of expression", expected))),
        }
    }

    fn at_operator(&self, names: &[&str]) -> Option<String> {
        match self.peek() {
            Some(Token::OperatorName(name)) if names.contains(&name.as_str()) => Some(name.clone()),
            _ => None,
        }
    }

    fn expr(&mut self) -> Result<Expr, ParseError> {
        self.or_expr()
    }

    fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    fn or_expr(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.and_expr()?;
        while self.at_operator(&["or"]).is_some() {
            self.pos += 1;
            let right = self.and_expr()?;
            left = Self::binary(BinaryOp::Or, left, right);
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.equality_expr()?;
        while self.at_operator(&["and"]).is_some() {
            self.pos += 1;
            let right = self.equality_expr()?;
            left = Self::binary(BinaryOp::And, left, right);
        }
        Ok(left)
    }

    fn equality_expr(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.relational_expr()?;
        loop {
            let (op, value_comparison) = match self.peek() {
                Some(Token::Eq) => (BinaryOp::Eq, false),
                Some(Token::NotEq) => (BinaryOp::NotEq, false),
                Some(Token::OperatorName(name)) if name == "eq" => (BinaryOp::Eq, true),
                Some(Token::OperatorName(name)) if name == "ne" => (BinaryOp::NotEq, true),
                _ => break,
            };
            self.xpath2_syntax |= value_comparison;
            self.pos += 1;
            let right = self.relational_expr()?;
            left = Self::binary(op, left, right);
        }
        Ok(left)
    }

    fn relational_expr(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.additive_expr()?;
        loop {
            let (op, value_comparison) = match self.peek() {
                Some(Token::Lt) => (BinaryOp::Lt, false),
                Some(Token::LtEq) => (BinaryOp::LtEq, false),
                Some(Token::Gt) => (BinaryOp::Gt, false),
                Some(Token::GtEq) => (BinaryOp::GtEq, false),
                Some(Token::OperatorName(name)) => match name.as_str() {
                    "lt" => (BinaryOp::Lt, true),
                    "le" => (BinaryOp::LtEq, true),
                    "gt" => (BinaryOp::Gt, true),
                    "ge" => (BinaryOp::GtEq, true),
                    _ => break,
                },
                _ => break,
            };
            self.xpath2_syntax |= value_comparison;
            self.pos += 1;
            let right = self.additive_expr()?;
            left = Self::binary(op, left, right);
        }
        Ok(left)
    }

    fn additive_expr(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.multiplicative_expr()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let right = self.multiplicative_expr()?;
            left = Self::binary(op, left, right);
        }
        Ok(left)
    }

    fn multiplicative_expr(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.unary_expr()?;
        loop {
            let op = match self.peek() {
                Some(Token::Multiply) => BinaryOp::Mul,
                Some(Token::OperatorName(name)) if name == "div" => BinaryOp::Div,
                Some(Token::OperatorName(name)) if name == "mod" => BinaryOp::Mod,
                _ => break,
            };
            self.pos += 1;
            let right = self.unary_expr()?;
            left = Self::binary(op, left, right);
        }
        Ok(left)
    }

    fn unary_expr(&mut self) -> Result<Expr, ParseError> {
        if self.peek() == Some(&Token::Minus) {
            self.pos += 1;
            let operand = self.unary_expr()?;
            return Ok(Expr::Negate(Box::new(operand)));
        }
        self.union_expr()
    }

    fn union_expr(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.path_expr()?;
        loop {
            let keyword = match self.peek() {
                Some(Token::Pipe) => false,
                Some(Token::OperatorName(name)) if name == "union" => true,
                _ => break,
            };
            self.xpath2_syntax |= keyword;
            self.pos += 1;
            let right = self.path_expr()?;
            left = Expr::Union {
                left: Some(Box::new(left)),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn starts_step(token: Option<&Token>) -> bool {
        matches!(
            token,
            Some(
                Token::Dot
                    | Token::DotDot
                    | Token::At
                    | Token::AxisName(_)
                    | Token::NameTest(_)
                    | Token::NodeType(_)
            )
        )
    }

    fn path_expr(&mut self) -> Result<Expr, ParseError> {
        match self.peek() {
            Some(Token::Slash) => {
                self.pos += 1;
                let steps = if Self::starts_step(self.peek()) {
                    self.relative_steps()?
                } else {
                    Vec::new()
                };
                Ok(Expr::Path(PathExpr {
                    start: PathStart::Root,
                    steps,
                }))
            }
            Some(Token::DoubleSlash) => {
                self.pos += 1;
                let mut steps = vec![Step::descendant_or_self()];
                steps.extend(self.relative_steps()?);
                Ok(Expr::Path(PathExpr {
                    start: PathStart::Root,
                    steps,
                }))
            }
            token if Self::starts_step(token) => Ok(Expr::Path(PathExpr {
                start: PathStart::Relative,
                steps: self.relative_steps()?,
            })),
            _ => {
                let filter = self.filter_expr()?;
                let mut steps = Vec::new();
                match self.peek() {
                    Some(Token::Slash) => {
                        self.pos += 1;
                        steps = self.relative_steps()?;
                    }
                    Some(Token::DoubleSlash) => {
                        self.pos += 1;
                        steps.push(Step::descendant_or_self());
                        steps.extend(self.relative_steps()?);
                    }
                    _ => return Ok(filter),
                }
                Ok(Expr::Path(PathExpr {
                    start: PathStart::Filter(Box::new(filter)),
                    steps,
                }))
            }
        }
    }

    fn relative_steps(&mut self) -> Result<Vec<Step>, ParseError> {
        let mut steps = vec![self.step()?];
        loop {
            match self.peek() {
                Some(Token::Slash) => {
                    self.pos += 1;
                }
                Some(Token::DoubleSlash) => {
                    self.pos += 1;
                    steps.push(Step::descendant_or_self());
                }
                _ => break,
            }
            steps.push(self.step()?);
        }
        Ok(steps)
    }

    fn step(&mut self) -> Result<Step, ParseError> {
        match self.peek() {
            Some(Token::Dot) => {
                self.pos += 1;
                return Ok(Step::new(Axis::SelfAxis, NodeTest::Node));
            }
            Some(Token::DotDot) => {
                self.pos += 1;
                return Ok(Step::new(Axis::Parent, NodeTest::Node));
            }
            _ => {}
        }

        let axis = match self.peek().cloned() {
            Some(Token::At) => {
                self.pos += 1;
                Axis::Attribute
            }
            Some(Token::AxisName(name)) => {
                let axis = Axis::from_name(&name)
                    .ok_or_else(|| self.error(format!("unknown axis '{}'", name)))?;
                self.pos += 1;
                self.expect(Token::ColonColon)?;
                axis
            }
            _ => Axis::Child,
        };

        let test = self.node_test()?;
        let mut step = Step::new(axis, test);
        step.predicates = self.predicates()?;
        Ok(step)
    }

    fn node_test(&mut self) -> Result<NodeTest, ParseError> {
        match self.advance() {
            Some(Token::NameTest(name)) => Ok(if name == "*" {
                NodeTest::Wildcard
            } else if let Some(prefix) = name.strip_suffix(":*") {
                NodeTest::PrefixWildcard(prefix.to_string())
            } else {
                NodeTest::Name(name)
            }),
            Some(Token::NodeType(kind)) => {
                self.expect(Token::LParen)?;
                let test = match kind.as_str() {
                    "node" => NodeTest::Node,
                    "text" => NodeTest::Text,
                    "comment" => NodeTest::Comment,
                    _ => match self.peek().cloned() {
                        Some(Token::Literal(target)) => {
                            self.pos += 1;
                            NodeTest::ProcessingInstruction(Some(target))
                        }
                        _ => NodeTest::ProcessingInstruction(None),
                    },
                };
                self.expect(Token::RParen)?;
                Ok(test)
            }
            Some(token) => {
                self.pos -= 1;
                Err(self.error(format!("expected node test, found {:?}", token)))
            }
            None => Err(self.error("expected node test, found end of expression")),
        }
    }

    fn predicates(&mut self) -> Result<Vec<Expr>, ParseError> {
        let mut predicates = Vec::new();
        while self.peek() == Some(&Token::LBracket) {
            self.pos += 1;
            predicates.push(self.expr()?);
            self.expect(Token::RBracket)?;
        }
        Ok(predicates)
    }

    fn filter_expr(&mut self) -> Result<Expr, ParseError> {
        let primary = self.primary_expr()?;
        let predicates = self.predicates()?;
        if predicates.is_empty() {
            Ok(primary)
        } else {
            Ok(Expr::Filter {
                primary: Box::new(primary),
                predicates,
            })
        }
    }

    fn primary_expr(&mut self) -> Result<Expr, ParseError> {
        match self.peek().cloned() {
            Some(Token::Variable(name)) => {
                self.pos += 1;
                Ok(Expr::VariableRef(name))
            }
            Some(Token::Literal(value)) => {
                self.pos += 1;
                Ok(Expr::Literal(value))
            }
            Some(Token::Number(value)) => {
                self.pos += 1;
                Ok(Expr::Number(value))
            }
            Some(Token::FunctionName(name)) => {
                self.pos += 1;
                self.expect(Token::LParen)?;
                let args = self.arguments()?;
                Ok(Expr::FunctionCall { name, args })
            }
            Some(Token::LParen) => {
                self.pos += 1;
                if self.peek() == Some(&Token::RParen) {
                    self.pos += 1;
                    self.xpath2_syntax = true;
                    return Ok(Expr::Sequence(Vec::new()));
                }
                let first = self.expr()?;
                if self.peek() == Some(&Token::RParen) {
                    self.pos += 1;
                    return Ok(Expr::Group(Box::new(first)));
                }
                self.xpath2_syntax = true;
                let mut items = vec![first];
                while self.peek() == Some(&Token::Comma) {
                    self.pos += 1;
                    items.push(self.expr()?);
                }
                self.expect(Token::RParen)?;
                Ok(Expr::Sequence(items))
            }
            Some(token) => Err(self.error(format!("unexpected {:?}", token))),
            None => Err(self.error("unexpected end of expression")),
        }
    }

    fn arguments(&mut self) -> Result<Vec<Expr>, ParseError> {
        let mut args = Vec::new();
        if self.peek() == Some(&Token::RParen) {
            self.pos += 1;
            return Ok(args);
        }
        loop {
            args.push(self.expr()?);
            match self.peek() {
                Some(Token::Comma) => self.pos += 1,
                _ => break,
            }
        }
        self.expect(Token::RParen)?;
        Ok(args)
    }
}
