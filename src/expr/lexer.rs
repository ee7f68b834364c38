//! XPath tokenizer.
//!
//! Names are disambiguated the way XPath 1.0 section 3.7 prescribes: after a
//! token that can end an operand, `*` is multiplication and a bare name is an
//! operator name; a name followed by `(` is a function or node type; a name
//! followed by `::` is an axis.

use crate::error::ParseError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    LParen,
    RParen,
    LBracket,
    RBracket,
    Dot,
    DotDot,
    At,
    Comma,
    ColonColon,
    Slash,
    DoubleSlash,
    Pipe,
    Plus,
    Minus,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Multiply,
    /// `and`, `or`, `div`, `mod` and the XPath 2.0 operator words.
    OperatorName(String),
    /// `*`, `prefix:*` or a QName in a node test position.
    NameTest(String),
    /// `node`, `text`, `comment`, `processing-instruction` before `(`.
    NodeType(String),
    FunctionName(String),
    AxisName(String),
    Literal(String),
    Number(String),
    Variable(String),
}

impl Token {
    /// Tokens after which `*` and names take their operand reading.
    fn allows_operand(&self) -> bool {
        matches!(
            self,
            Token::At
                | Token::ColonColon
                | Token::LParen
                | Token::LBracket
                | Token::Comma
                | Token::OperatorName(_)
                | Token::Multiply
                | Token::Slash
                | Token::DoubleSlash
                | Token::Pipe
                | Token::Plus
                | Token::Minus
                | Token::Eq
                | Token::NotEq
                | Token::Lt
                | Token::LtEq
                | Token::Gt
                | Token::GtEq
        )
    }
}

const OPERATOR_NAMES: &[&str] = &[
    "and", "or", "div", "mod", "union", "eq", "ne", "lt", "le", "gt", "ge",
];

const NODE_TYPES: &[&str] = &["node", "text", "comment", "processing-instruction"];

/// A token with its byte offset in the source expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub offset: usize,
}

pub fn tokenize(source: &str) -> Result<Vec<Spanned>, ParseError> {
    Lexer::new(source).run()
}

struct Lexer<'a> {
    source: &'a str,
    chars: Vec<(usize, char)>,
    pos: usize,
    tokens: Vec<Spanned>,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            chars: source.char_indices().collect(),
            pos: 0,
            tokens: Vec::new(),
        }
    }

    fn error(&self, offset: usize, message: impl Into<String>) -> ParseError {
        ParseError::new(self.source, offset, message)
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).map(|&(_, c)| c)
    }

    fn peek_at(&self, ahead: usize) -> Option<char> {
        self.chars.get(self.pos + ahead).map(|&(_, c)| c)
    }

    fn offset(&self) -> usize {
        self.chars
            .get(self.pos)
            .map(|&(offset, _)| offset)
            .unwrap_or(self.source.len())
    }

    fn operand_expected(&self) -> bool {
        self.tokens
            .last()
            .map(|spanned| spanned.token.allows_operand())
            .unwrap_or(true)
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    /// Next non-whitespace character without consuming anything.
    fn next_significant(&self) -> Option<(usize, char)> {
        self.chars[self.pos..]
            .iter()
            .enumerate()
            .find(|(_, (_, c))| !c.is_whitespace())
            .map(|(ahead, &(_, c))| (ahead, c))
    }

    fn push(&mut self, token: Token, offset: usize) {
        self.tokens.push(Spanned { token, offset });
    }

    fn run(mut self) -> Result<Vec<Spanned>, ParseError> {
        loop {
            self.skip_whitespace();
            let Some(c) = self.peek() else { break };
            let offset = self.offset();

            match c {
                '(' => self.single(Token::LParen, offset),
                ')' => self.single(Token::RParen, offset),
                '[' => self.single(Token::LBracket, offset),
                ']' => self.single(Token::RBracket, offset),
                '@' => self.single(Token::At, offset),
                ',' => self.single(Token::Comma, offset),
                '|' => self.single(Token::Pipe, offset),
                '+' => self.single(Token::Plus, offset),
                '-' => self.single(Token::Minus, offset),
                '=' => self.single(Token::Eq, offset),
                '!' if self.peek_at(1) == Some('=') => {
                    self.pos += 2;
                    self.push(Token::NotEq, offset);
                }
                '<' if self.peek_at(1) == Some('=') => {
                    self.pos += 2;
                    self.push(Token::LtEq, offset);
                }
                '<' => self.single(Token::Lt, offset),
                '>' if self.peek_at(1) == Some('=') => {
                    self.pos += 2;
                    self.push(Token::GtEq, offset);
                }
                '>' => self.single(Token::Gt, offset),
                ':' if self.peek_at(1) == Some(':') => {
                    self.pos += 2;
                    self.push(Token::ColonColon, offset);
                }
                '/' if self.peek_at(1) == Some('/') => {
                    self.pos += 2;
                    self.push(Token::DoubleSlash, offset);
                }
                '/' => self.single(Token::Slash, offset),
                '.' if self.peek_at(1) == Some('.') => {
                    self.pos += 2;
                    self.push(Token::DotDot, offset);
                }
                '.' if self.peek_at(1).is_some_and(|d| d.is_ascii_digit()) => {
                    self.number(offset)
                }
                '.' => self.single(Token::Dot, offset),
                '*' => {
                    self.pos += 1;
                    if self.operand_expected() {
                        self.push(Token::NameTest("*".to_string()), offset);
                    } else {
                        self.push(Token::Multiply, offset);
                    }
                }
                '\'' | '"' => self.literal(c, offset)?,
                '$' => {
                    self.pos += 1;
                    let name = self
                        .qname()
                        .ok_or_else(|| self.error(offset, "expected variable name after '$'"))?;
                    self.push(Token::Variable(name), offset);
                }
                d if d.is_ascii_digit() => self.number(offset),
                n if is_name_start(n) => self.name(offset)?,
                other => {
                    return Err(self.error(offset, format!("unexpected character '{}'", other)));
                }
            }
        }
        Ok(self.tokens)
    }

    fn single(&mut self, token: Token, offset: usize) {
        self.pos += 1;
        self.push(token, offset);
    }

    fn literal(&mut self, quote: char, offset: usize) -> Result<(), ParseError> {
        self.pos += 1;
        let mut value = String::new();
        loop {
            match self.peek() {
                None => return Err(self.error(offset, "unterminated string literal")),
                Some(c) if c == quote => {
                    // XPath 2.0 escapes a quote by doubling it.
                    if self.peek_at(1) == Some(quote) {
                        value.push(quote);
                        self.pos += 2;
                    } else {
                        self.pos += 1;
                        break;
                    }
                }
                Some(c) => {
                    value.push(c);
                    self.pos += 1;
                }
            }
        }
        self.push(Token::Literal(value), offset);
        Ok(())
    }

    fn number(&mut self, offset: usize) {
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
        }
        if self.peek() == Some('.') && self.peek_at(1) != Some('.') {
            self.pos += 1;
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.pos += 1;
            }
        }
        let text: String = self.chars[start..self.pos].iter().map(|&(_, c)| c).collect();
        self.push(Token::Number(text), offset);
    }

    fn ncname(&mut self) -> Option<String> {
        if !self.peek().is_some_and(is_name_start) {
            return None;
        }
        let start = self.pos;
        while self.peek().is_some_and(is_name_char) {
            self.pos += 1;
        }
        Some(self.chars[start..self.pos].iter().map(|&(_, c)| c).collect())
    }

    /// `prefix:local` or `local`; a lone `:` followed by a name start joins
    /// the two parts.
    fn qname(&mut self) -> Option<String> {
        let mut name = self.ncname()?;
        if self.peek() == Some(':')
            && self.peek_at(1) != Some(':')
            && self.peek_at(1).is_some_and(is_name_start)
        {
            self.pos += 1;
            let local = self.ncname()?;
            name.push(':');
            name.push_str(&local);
        }
        Some(name)
    }

    fn name(&mut self, offset: usize) -> Result<(), ParseError> {
        let operand_expected = self.operand_expected();
        let start = self.pos;
        let first = self
            .ncname()
            .ok_or_else(|| self.error(offset, "expected a name"))?;

        if !operand_expected && OPERATOR_NAMES.contains(&first.as_str()) {
            self.push(Token::OperatorName(first), offset);
            return Ok(());
        }

        // prefix:* name test
        if self.peek() == Some(':') && self.peek_at(1) == Some('*') {
            self.pos += 2;
            self.push(Token::NameTest(format!("{}:*", first)), offset);
            return Ok(());
        }

        // Rewind and read the full QName.
        self.pos = start;
        let name = self
            .qname()
            .ok_or_else(|| self.error(offset, "expected a name"))?;

        match self.next_significant() {
            Some((_, '(')) => {
                if NODE_TYPES.contains(&name.as_str()) {
                    self.push(Token::NodeType(name), offset);
                } else {
                    self.push(Token::FunctionName(name), offset);
                }
            }
            Some((ahead, ':'))
                if self.chars.get(self.pos + ahead + 1).map(|&(_, c)| c) == Some(':') =>
            {
                self.push(Token::AxisName(name), offset);
            }
            _ => self.push(Token::NameTest(name), offset),
        }
        Ok(())
    }
}

fn is_name_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | '\u{B7}')
}
