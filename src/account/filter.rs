//! Boolean filter expressions over listed accounts.
//!
//! ```text
//! "/item/attributes/subject" == "alice" and not "/item/name" matches "^test-"
//! ```
//!
//! Selectors are JSON pointers rooted at `/item`, the serialized account
//! view. Supported operators are `==`, `!=`, `contains` and `matches`,
//! combined with `and`, `or`, `not` and parentheses. An empty expression
//! matches everything.

use regex_lite::Regex;
use serde_json::Value;

const ITEM_ROOT: &str = "/item";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FilterError {
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("unexpected token {0:?}")]
    UnexpectedToken(String),
    #[error("unterminated string literal")]
    UnterminatedString,
    #[error("selector {0:?} must start with \"/item\"")]
    InvalidSelector(String),
    #[error("invalid pattern: {0}")]
    InvalidPattern(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Open,
    Close,
    Equal,
    NotEqual,
    /// Quoted literal.
    Quoted(String),
    /// Bare word, keyword or unquoted literal.
    Word(String),
}

impl Token {
    fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self, Self::Word(word) if word.eq_ignore_ascii_case(keyword))
    }

    fn describe(&self) -> String {
        match self {
            Self::Open => "(".into(),
            Self::Close => ")".into(),
            Self::Equal => "==".into(),
            Self::NotEqual => "!=".into(),
            Self::Quoted(value) | Self::Word(value) => value.clone(),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, FilterError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            },
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            },
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            },
            '=' | '!' => {
                chars.next();
                if chars.next_if_eq(&'=').is_none() {
                    return Err(FilterError::UnexpectedToken(c.to_string()));
                }
                tokens.push(if c == '=' { Token::Equal } else { Token::NotEqual });
            },
            '"' => {
                chars.next();
                let mut value = String::new();
                loop {
                    match chars.next() {
                        None => return Err(FilterError::UnterminatedString),
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(escaped) => value.push(escaped),
                            None => return Err(FilterError::UnterminatedString),
                        },
                        Some(c) => value.push(c),
                    }
                }
                tokens.push(Token::Quoted(value));
            },
            _ => {
                let mut word = String::new();
                while let Some(c) =
                    chars.next_if(|c| !c.is_whitespace() && !matches!(*c, '(' | ')' | '"' | '=' | '!'))
                {
                    word.push(c);
                }
                tokens.push(Token::Word(word));
            },
        }
    }

    Ok(tokens)
}

#[derive(Debug, Clone)]
enum Expr {
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Equal(String, String),
    NotEqual(String, String),
    Contains(String, String),
    Matches(String, Regex),
}

struct Parser {
    tokens: Vec<Token>,
    position: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn next(&mut self) -> Result<Token, FilterError> {
        let token = self
            .tokens
            .get(self.position)
            .cloned()
            .ok_or(FilterError::UnexpectedEnd)?;
        self.position += 1;
        Ok(token)
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.peek().is_some_and(|t| t.is_keyword(keyword)) {
            self.position += 1;
            true
        } else {
            false
        }
    }

    fn or(&mut self) -> Result<Expr, FilterError> {
        let mut expr = self.and()?;
        while self.eat_keyword("or") {
            expr = Expr::Or(Box::new(expr), Box::new(self.and()?));
        }
        Ok(expr)
    }

    fn and(&mut self) -> Result<Expr, FilterError> {
        let mut expr = self.unary()?;
        while self.eat_keyword("and") {
            expr = Expr::And(Box::new(expr), Box::new(self.unary()?));
        }
        Ok(expr)
    }

    fn unary(&mut self) -> Result<Expr, FilterError> {
        if self.eat_keyword("not") {
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        if self.peek() == Some(&Token::Open) {
            self.position += 1;
            let expr = self.or()?;
            return match self.next()? {
                Token::Close => Ok(expr),
                token => Err(FilterError::UnexpectedToken(token.describe())),
            };
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, FilterError> {
        let selector = match self.next()? {
            Token::Quoted(s) | Token::Word(s) => selector(s)?,
            token => return Err(FilterError::UnexpectedToken(token.describe())),
        };
        let operator = self.next()?;
        let value = match self.next()? {
            Token::Quoted(s) | Token::Word(s) => s,
            token => return Err(FilterError::UnexpectedToken(token.describe())),
        };

        match operator {
            Token::Equal => Ok(Expr::Equal(selector, value)),
            Token::NotEqual => Ok(Expr::NotEqual(selector, value)),
            t if t.is_keyword("contains") => Ok(Expr::Contains(selector, value)),
            t if t.is_keyword("matches") => Regex::new(&value)
                .map(|re| Expr::Matches(selector, re))
                .map_err(|err| FilterError::InvalidPattern(err.to_string())),
            token => Err(FilterError::UnexpectedToken(token.describe())),
        }
    }
}

/// JSON pointer into the item, without the `/item` root.
fn selector(path: String) -> Result<String, FilterError> {
    match path.strip_prefix(ITEM_ROOT) {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => Ok(rest.to_owned()),
        _ => Err(FilterError::InvalidSelector(path)),
    }
}

/// Scalar rendering used for comparisons. Objects and null never compare.
fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

impl Expr {
    fn eval(&self, item: &Value) -> bool {
        match self {
            Self::And(lhs, rhs) => lhs.eval(item) && rhs.eval(item),
            Self::Or(lhs, rhs) => lhs.eval(item) || rhs.eval(item),
            Self::Not(expr) => !expr.eval(item),
            Self::Equal(pointer, value) => {
                item.pointer(pointer).and_then(scalar).is_some_and(|v| v == *value)
            },
            Self::NotEqual(pointer, value) => {
                !item.pointer(pointer).and_then(scalar).is_some_and(|v| v == *value)
            },
            Self::Contains(pointer, value) => match item.pointer(pointer) {
                Some(Value::String(s)) => s.contains(value.as_str()),
                Some(Value::Array(items)) => items
                    .iter()
                    .filter_map(scalar)
                    .any(|v| v == *value),
                _ => false,
            },
            Self::Matches(pointer, re) => {
                item.pointer(pointer).and_then(scalar).is_some_and(|v| re.is_match(&v))
            },
        }
    }
}

/// Parsed filter expression.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    expr: Option<Expr>,
}

impl Filter {
    pub fn parse(input: &str) -> Result<Self, FilterError> {
        let tokens = tokenize(input)?;
        if tokens.is_empty() {
            return Ok(Self::default());
        }

        let mut parser = Parser {
            tokens,
            position: 0,
        };
        let expr = parser.or()?;
        if let Some(token) = parser.peek() {
            return Err(FilterError::UnexpectedToken(token.describe()));
        }

        Ok(Self { expr: Some(expr) })
    }

    /// Whether `item`, a serialized account view, passes the filter.
    pub fn matches(&self, item: &Value) -> bool {
        self.expr.as_ref().is_none_or(|expr| expr.eval(item))
    }
}
