//! Minimal recursive-descent parser producing the AST shapes the compiler
//! assumes. Three entry points, matching §6's CLI contract: a whole source
//! file, a single method-definition fragment, and a single "do-it"
//! expression.
//!
//! Precedence (standard Smalltalk): unary binds tightest, then binary, then
//! keyword; assignment is lower still and right-associative.

use crate::ast::{ClassDef, Expr, Item, MethodDef, Stmt};
use crate::errors::{ParseError, Span};
use crate::lexer::{Lexer, Token, TokenKind};

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Parser {
        Parser { tokens, pos: 0 }
    }

    pub fn from_source(source: &str) -> Result<Parser, ParseError> {
        let tokens = Lexer::new(source).tokenize()?;
        Ok(Parser::new(tokens))
    }

    fn peek(&self) -> &TokenKind {
        &self.tokens[self.pos].kind
    }

    fn peek_span(&self) -> Span {
        self.tokens[self.pos].span
    }

    fn advance(&mut self) -> Token {
        let t = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, kind: &TokenKind, expected: &'static str) -> Result<Token, ParseError> {
        if std::mem::discriminant(self.peek()) == std::mem::discriminant(kind) {
            Ok(self.advance())
        } else if matches!(self.peek(), TokenKind::Eof) {
            Err(ParseError::UnexpectedEof { expected })
        } else {
            Err(ParseError::UnexpectedToken {
                found: format!("{:?}", self.peek()),
                expected,
                span: self.peek_span(),
            })
        }
    }

    // ---- Entry points -----------------------------------------------------

    /// Parse a whole source file: a sequence of `classDef`/`methodDef`
    /// declarations and bang/period-terminated top-level statements.
    pub fn parse_file(&mut self) -> Result<Vec<Item>, ParseError> {
        let mut items = Vec::new();
        while !matches!(self.peek(), TokenKind::Eof) {
            items.push(self.parse_item()?);
        }
        Ok(items)
    }

    /// Parse a single method-definition fragment (no `methodDef` / class
    /// name prefix — just the selector pattern and body), for use when
    /// compiling a method already known to belong to a given class.
    pub fn parse_method_fragment(&mut self) -> Result<MethodDef, ParseError> {
        let (selector, params) = self.parse_method_pattern()?;
        let (temps, body) = self.parse_method_body()?;
        Ok(MethodDef { selector, params, temps, body })
    }

    /// Parse a single expression ("do-it").
    pub fn parse_do_it(&mut self) -> Result<Expr, ParseError> {
        self.parse_expr()
    }

    fn parse_item(&mut self) -> Result<Item, ParseError> {
        if let TokenKind::Identifier(name) = self.peek().clone() {
            if name == "classDef" {
                return self.parse_class_def();
            }
            if name == "methodDef" {
                return self.parse_method_def();
            }
        }
        let stmt = self.parse_stmt()?;
        self.expect(&TokenKind::Period, "'.'")?;
        Ok(Item::TopLevel(stmt))
    }

    fn parse_class_def(&mut self) -> Result<Item, ParseError> {
        self.advance(); // classDef
        let name = self.parse_identifier_name("class name")?;
        let superclass = self.parse_identifier_name("superclass name")?;
        let mut instance_variables = Vec::new();
        if matches!(self.peek(), TokenKind::LParen) {
            self.advance();
            while !matches!(self.peek(), TokenKind::RParen) {
                instance_variables.push(self.parse_identifier_name("instance variable name")?);
            }
            self.advance(); // ')'
        }
        self.expect(&TokenKind::Period, "'.'")?;
        Ok(Item::Class(ClassDef { name, superclass, instance_variables }))
    }

    fn parse_method_def(&mut self) -> Result<Item, ParseError> {
        self.advance(); // methodDef
        let class_name = self.parse_identifier_name("class name")?;
        let (selector, params) = self.parse_method_pattern()?;
        let (temps, body) = self.parse_method_body()?;
        Ok(Item::Method { class_name, method: MethodDef { selector, params, temps, body } })
    }

    fn parse_identifier_name(&mut self, expected: &'static str) -> Result<String, ParseError> {
        match self.peek().clone() {
            TokenKind::Identifier(name) => {
                self.advance();
                Ok(name)
            }
            _ => Err(ParseError::UnexpectedToken {
                found: format!("{:?}", self.peek()),
                expected,
                span: self.peek_span(),
            }),
        }
    }

    fn parse_method_pattern(&mut self) -> Result<(String, Vec<String>), ParseError> {
        match self.peek().clone() {
            TokenKind::Keyword(_) => {
                let mut selector = String::new();
                let mut params = Vec::new();
                while let TokenKind::Keyword(kw) = self.peek().clone() {
                    self.advance();
                    selector.push_str(&kw);
                    params.push(self.parse_identifier_name("parameter name")?);
                }
                Ok((selector, params))
            }
            TokenKind::BinarySelector(sel) => {
                self.advance();
                let param = self.parse_identifier_name("parameter name")?;
                Ok((sel, vec![param]))
            }
            TokenKind::Identifier(name) => {
                self.advance();
                Ok((name, Vec::new()))
            }
            _ => Err(ParseError::UnexpectedToken {
                found: format!("{:?}", self.peek()),
                expected: "method selector pattern",
                span: self.peek_span(),
            }),
        }
    }

    fn parse_method_body(&mut self) -> Result<(Vec<String>, Vec<Stmt>), ParseError> {
        self.expect(&TokenKind::LBracket, "'['")?;
        let temps = self.parse_optional_temps()?;
        let mut body = Vec::new();
        while !matches!(self.peek(), TokenKind::RBracket) {
            body.push(self.parse_stmt()?);
            if matches!(self.peek(), TokenKind::Period) {
                self.advance();
            }
        }
        self.advance(); // ']'
        Ok((temps, body))
    }

    fn parse_optional_temps(&mut self) -> Result<Vec<String>, ParseError> {
        if matches!(self.peek(), TokenKind::Bar) {
            self.advance();
            let mut temps = Vec::new();
            while let TokenKind::Identifier(name) = self.peek().clone() {
                self.advance();
                temps.push(name);
            }
            self.expect(&TokenKind::Bar, "'|'")?;
            Ok(temps)
        } else {
            Ok(Vec::new())
        }
    }

    fn parse_stmt(&mut self) -> Result<Stmt, ParseError> {
        if matches!(self.peek(), TokenKind::Caret) {
            self.advance();
            Ok(Stmt::Return(self.parse_expr()?))
        } else {
            Ok(Stmt::Expr(self.parse_expr()?))
        }
    }

    fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        if let TokenKind::Identifier(name) = self.peek().clone() {
            if matches!(self.tokens.get(self.pos + 1).map(|t| &t.kind), Some(TokenKind::Assign)) {
                let start = self.peek_span();
                self.advance(); // identifier
                self.advance(); // :=
                let value = self.parse_expr()?;
                let span = start.merge(value.span());
                return Ok(Expr::Assignment { name, value: Box::new(value), span });
            }
        }
        self.parse_keyword_expr()
    }

    fn parse_keyword_expr(&mut self) -> Result<Expr, ParseError> {
        let receiver = self.parse_binary_expr()?;
        if matches!(self.peek(), TokenKind::Keyword(_)) {
            let start = receiver.span();
            let mut selector = String::new();
            let mut args = Vec::new();
            while let TokenKind::Keyword(kw) = self.peek().clone() {
                self.advance();
                selector.push_str(&kw);
                args.push(self.parse_binary_expr()?);
            }
            let span = args.last().map(|a| start.merge(a.span())).unwrap_or(start);
            Ok(Expr::MessageSend { receiver: Box::new(receiver), selector, args, span })
        } else {
            Ok(receiver)
        }
    }

    fn parse_binary_expr(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_unary_expr()?;
        while let TokenKind::BinarySelector(sel) = self.peek().clone() {
            self.advance();
            let right = self.parse_unary_expr()?;
            let span = left.span().merge(right.span());
            left = Expr::MessageSend { receiver: Box::new(left), selector: sel, args: vec![right], span };
        }
        Ok(left)
    }

    fn parse_unary_expr(&mut self) -> Result<Expr, ParseError> {
        let mut receiver = self.parse_primary()?;
        while let TokenKind::Identifier(name) = self.peek().clone() {
            self.advance();
            let span = receiver.span();
            receiver = Expr::MessageSend { receiver: Box::new(receiver), selector: name, args: Vec::new(), span };
        }
        Ok(receiver)
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        let span = self.peek_span();
        match self.peek().clone() {
            TokenKind::Integer(n) => {
                self.advance();
                Ok(Expr::LiteralInt { value: n, span })
            }
            TokenKind::Character(c) => {
                self.advance();
                Ok(Expr::LiteralChar { value: c, span })
            }
            TokenKind::True => {
                self.advance();
                Ok(Expr::LiteralBool { value: true, span })
            }
            TokenKind::False => {
                self.advance();
                Ok(Expr::LiteralBool { value: false, span })
            }
            TokenKind::Nil => {
                self.advance();
                Ok(Expr::LiteralNil { span })
            }
            TokenKind::SelfKw => {
                self.advance();
                Ok(Expr::SelfExpr { span })
            }
            TokenKind::SuperKw => {
                self.advance();
                Ok(Expr::SuperExpr { span })
            }
            TokenKind::Identifier(name) => {
                self.advance();
                Ok(Expr::Identifier { name, span })
            }
            TokenKind::LParen => {
                self.advance();
                let inner = self.parse_expr()?;
                self.expect(&TokenKind::RParen, "')'")?;
                Ok(inner)
            }
            TokenKind::LBracket => self.parse_block(),
            _ => Err(ParseError::UnexpectedToken {
                found: format!("{:?}", self.peek()),
                expected: "an expression",
                span,
            }),
        }
    }

    fn parse_block(&mut self) -> Result<Expr, ParseError> {
        let start = self.peek_span();
        self.advance(); // '['
        let mut params = Vec::new();
        while matches!(self.peek(), TokenKind::Colon) {
            self.advance();
            params.push(self.parse_identifier_name("block parameter name")?);
        }
        if !params.is_empty() {
            self.expect(&TokenKind::Bar, "'|'")?;
        }
        let temps = self.parse_optional_temps()?;
        let mut body = Vec::new();
        while !matches!(self.peek(), TokenKind::RBracket) {
            body.push(self.parse_stmt()?);
            if matches!(self.peek(), TokenKind::Period) {
                self.advance();
            }
        }
        let end = self.peek_span();
        self.advance(); // ']'
        Ok(Expr::Block { params, temps, body, span: start.merge(end) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_assignment_and_return() {
        let mut parser = Parser::from_source("| x | x := 2 + 3. ^ x").unwrap();
        // This source has no enclosing method body; exercise via fragment
        // helpers directly: temps then statements.
        let temps = parser.parse_optional_temps().unwrap();
        assert_eq!(temps, vec!["x".to_string()]);
        let first = parser.parse_stmt().unwrap();
        assert!(matches!(first, Stmt::Expr(Expr::Assignment { .. })));
    }

    #[test]
    fn binds_unary_tighter_than_binary_tighter_than_keyword() {
        let mut parser = Parser::from_source("1 to: 3 do: [:i | i]").unwrap();
        let expr = parser.parse_do_it().unwrap();
        match expr {
            Expr::MessageSend { selector, args, .. } => {
                assert_eq!(selector, "to:do:");
                assert_eq!(args.len(), 2);
            }
            other => panic!("expected keyword send, got {other:?}"),
        }
    }

    #[test]
    fn parses_block_with_params_and_body() {
        let mut parser = Parser::from_source("[:a :b | a * b]").unwrap();
        let expr = parser.parse_do_it().unwrap();
        match expr {
            Expr::Block { params, body, .. } => {
                assert_eq!(params, vec!["a".to_string(), "b".to_string()]);
                assert_eq!(body.len(), 1);
            }
            other => panic!("expected block, got {other:?}"),
        }
    }

    #[test]
    fn parses_class_and_method_definitions() {
        let mut parser = Parser::from_source(
            "classDef A Object (x).\nmethodDef A x [ ^ x ]\n",
        )
        .unwrap();
        let items = parser.parse_file().unwrap();
        assert_eq!(items.len(), 2);
        assert!(matches!(items[0], Item::Class(_)));
        assert!(matches!(items[1], Item::Method { .. }));
    }
}
