// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::ast::*;
use crate::lexer::*;
use crate::number::Number;
use crate::value::Value;

use core::str::FromStr;

use anyhow::Result;

// Words that cannot begin a statement as a plain expression.
const KEYWORDS: [&str; 13] = [
    "schema",
    "resource",
    "component",
    "var",
    "fun",
    "for",
    "in",
    "if",
    "else",
    "return",
    "output",
    "import",
    "sensitive",
];

#[derive(Clone)]
pub struct Parser<'source> {
    source: Source,
    lexer: Lexer<'source>,
    tok: Token,
    line: u32,
    end: u32,
}

impl<'source> Parser<'source> {
    pub fn new(source: &'source Source) -> Result<Self> {
        let mut lexer = Lexer::new(source);
        let tok = lexer.next_token()?;
        Ok(Self {
            source: source.clone(),
            lexer,
            tok,
            line: 0,
            end: 0,
        })
    }

    // String tokens never match keywords or symbols, so they read as "".
    pub fn token_text(&self) -> &str {
        match self.tok.0 {
            TokenKind::String => "",
            _ => self.tok.1.text(),
        }
    }

    pub fn next_token(&mut self) -> Result<()> {
        self.line = self.tok.1.line;
        self.end = self.tok.1.end;
        self.tok = self.lexer.next_token()?;
        Ok(())
    }

    fn expect(&mut self, text: &str, context: &str) -> Result<()> {
        if self.token_text() != text {
            return Err(self.error_at_tok(&format!("expecting `{text}` {context}")));
        }
        self.next_token()
    }

    fn is_ident(&self) -> bool {
        self.tok.0 == TokenKind::Ident
    }

    fn parse_ident(&mut self, context: &str) -> Result<Span> {
        if !self.is_ident() {
            return Err(self.error_at_tok(&format!("expecting identifier {context}")));
        }
        let span = self.tok.1.clone();
        self.next_token()?;
        Ok(span)
    }

    fn error_at_tok(&self, msg: &str) -> anyhow::Error {
        self.tok.1.error(msg)
    }

    // Close a span that started at `span` with the end of the previous token.
    fn finish_span(&self, mut span: Span) -> Span {
        span.end = self.end;
        span
    }

    pub fn parse(&mut self) -> Result<Program> {
        let mut statements = vec![];
        while self.tok.0 != TokenKind::Eof {
            statements.push(Ref::new(self.parse_statement()?));
        }
        Ok(Program {
            source: self.source.clone(),
            statements,
        })
    }

    fn parse_statement_block(&mut self, context: &str) -> Result<Vec<Ref<Statement>>> {
        self.expect("{", context)?;
        let mut statements = vec![];
        while self.token_text() != "}" {
            if self.tok.0 == TokenKind::Eof {
                return Err(self.error_at_tok("unexpected end of file inside block"));
            }
            statements.push(Ref::new(self.parse_statement()?));
        }
        self.next_token()?;
        Ok(statements)
    }

    fn parse_statement(&mut self) -> Result<Statement> {
        match self.token_text() {
            "schema" => self.parse_schema(),
            "resource" => self.parse_instance_stmt(InstanceKind::Resource),
            "component" => self.parse_component(),
            "var" => self.parse_var(),
            "fun" => self.parse_function(),
            "for" => self.parse_for(),
            "if" => self.parse_if(),
            "return" => self.parse_return(),
            "output" => self.parse_output(false),
            "sensitive" => {
                let span = self.tok.1.clone();
                self.next_token()?;
                if self.token_text() != "output" {
                    return Err(span.error("expecting `output` after `sensitive`"));
                }
                self.parse_output(true)
            }
            "import" => self.parse_import(),
            _ => self.parse_expr_or_assign(),
        }
    }

    fn parse_schema(&mut self) -> Result<Statement> {
        let span = self.tok.1.clone();
        self.next_token()?;
        let name = self.parse_ident("after `schema`")?;
        self.expect("{", "to begin schema body")?;
        let mut properties: Vec<Property> = vec![];
        while self.token_text() != "}" {
            let prop = self.parse_property()?;
            if properties.iter().any(|p| p.name.text() == prop.name.text()) {
                return Err(prop
                    .name
                    .error(format!("duplicate property `{}`", prop.name.text()).as_str()));
            }
            properties.push(prop);
        }
        self.next_token()?;
        Ok(Statement::Schema {
            span: self.finish_span(span),
            name,
            properties,
        })
    }

    // [input|output] [cloud] <type> <name> [= <expr>]
    fn parse_property(&mut self) -> Result<Property> {
        let span = self.tok.1.clone();
        let role = match self.token_text() {
            "input" => {
                self.next_token()?;
                PropertyRole::Input
            }
            "output" => {
                self.next_token()?;
                PropertyRole::Output
            }
            _ => PropertyRole::Regular,
        };
        let cloud = if self.token_text() == "cloud" {
            self.next_token()?;
            true
        } else {
            false
        };

        let ty = match TypeName::from_text(self.token_text()) {
            Some(ty) => {
                self.next_token()?;
                ty
            }
            None => return Err(self.error_at_tok("expecting property type")),
        };
        let name = self.parse_ident("as property name")?;

        let default = if self.token_text() == "=" {
            self.next_token()?;
            Some(Ref::new(self.parse_expr()?))
        } else {
            None
        };

        // Externally computed and output properties may depend on other
        // values but cannot be seeded with a literal.
        if let Some(expr) = &default {
            if (cloud || role == PropertyRole::Output) && expr.is_literal() {
                return Err(name.error("output/cloud property cannot have a literal initializer"));
            }
        }

        Ok(Property {
            span: self.finish_span(span),
            name,
            ty,
            role,
            cloud,
            default,
        })
    }

    fn parse_instance_stmt(&mut self, kind: InstanceKind) -> Result<Statement> {
        let span = self.tok.1.clone();
        self.next_token()?;
        let type_name = self.parse_ident("as instance type")?;
        let name = self.parse_ident("as instance name")?;
        let fields = self.parse_instance_body()?;
        Ok(Statement::Instance {
            span: self.finish_span(span),
            kind,
            type_name,
            name,
            fields,
        })
    }

    fn parse_instance_body(&mut self) -> Result<Vec<Field>> {
        self.expect("{", "to begin instance body")?;
        let mut fields: Vec<Field> = vec![];
        while self.token_text() != "}" {
            let span = self.tok.1.clone();
            let name = self.parse_ident("as field name")?;
            self.expect("=", "after field name")?;
            let value = Ref::new(self.parse_expr()?);
            if fields.iter().any(|f| f.name.text() == name.text()) {
                return Err(name.error(format!("field `{}` assigned twice", name.text()).as_str()));
            }
            fields.push(Field {
                span: self.finish_span(span),
                name,
                value,
            });
        }
        self.next_token()?;
        Ok(fields)
    }

    // `component name { ... }` is a definition; `component type name { ... }`
    // is an instantiation.
    fn parse_component(&mut self) -> Result<Statement> {
        let span = self.tok.1.clone();
        self.next_token()?;
        let first = self.parse_ident("after `component`")?;

        if self.is_ident() {
            let name = self.parse_ident("as instance name")?;
            let fields = self.parse_instance_body()?;
            return Ok(Statement::Instance {
                span: self.finish_span(span),
                kind: InstanceKind::Component,
                type_name: first,
                name,
                fields,
            });
        }

        self.expect("{", "to begin component body")?;
        let mut properties: Vec<Property> = vec![];
        let mut body = vec![];
        while self.token_text() != "}" {
            if self.at_property_decl() {
                let prop = self.parse_property()?;
                if properties.iter().any(|p| p.name.text() == prop.name.text()) {
                    return Err(prop
                        .name
                        .error(format!("duplicate property `{}`", prop.name.text()).as_str()));
                }
                properties.push(prop);
            } else {
                body.push(Ref::new(self.parse_statement()?));
            }
        }
        self.next_token()?;
        Ok(Statement::ComponentDef {
            span: self.finish_span(span),
            name: first,
            properties,
            body,
        })
    }

    // Distinguish `string name ...` (a property declaration) from expression
    // statements like `string(x)` by looking one token ahead.
    fn at_property_decl(&mut self) -> bool {
        match self.token_text() {
            "input" | "output" | "cloud" => true,
            t if TypeName::from_text(t).is_some() => {
                let state = (self.lexer.clone(), self.tok.clone(), self.line, self.end);
                let is_decl = self.next_token().is_ok() && self.is_ident();
                (self.lexer, self.tok, self.line, self.end) = state;
                is_decl
            }
            _ => false,
        }
    }

    fn parse_var(&mut self) -> Result<Statement> {
        let span = self.tok.1.clone();
        self.next_token()?;
        let name = self.parse_ident("after `var`")?;
        self.expect("=", "after variable name")?;
        let value = Ref::new(self.parse_expr()?);
        Ok(Statement::Var {
            span: self.finish_span(span),
            name,
            value,
        })
    }

    fn parse_function(&mut self) -> Result<Statement> {
        let span = self.tok.1.clone();
        self.next_token()?;
        let name = self.parse_ident("after `fun`")?;
        self.expect("(", "to begin parameter list")?;
        let mut params = vec![];
        if self.token_text() != ")" {
            loop {
                params.push(self.parse_ident("as parameter name")?);
                if self.token_text() != "," {
                    break;
                }
                self.next_token()?;
            }
        }
        self.expect(")", "to end parameter list")?;
        let body = self.parse_statement_block("to begin function body")?;
        Ok(Statement::Function {
            span: self.finish_span(span),
            name,
            params,
            body,
        })
    }

    fn parse_return(&mut self) -> Result<Statement> {
        let span = self.tok.1.clone();
        self.next_token()?;
        let value = if self.token_text() == "}" {
            None
        } else {
            Some(Ref::new(self.parse_expr()?))
        };
        Ok(Statement::Return {
            span: self.finish_span(span),
            value,
        })
    }

    fn parse_for(&mut self) -> Result<Statement> {
        let span = self.tok.1.clone();
        self.next_token()?;
        let item = self.parse_ident("as loop variable")?;
        let index = if self.token_text() == "," {
            self.next_token()?;
            Some(self.parse_ident("as loop index variable")?)
        } else {
            None
        };
        self.expect("in", "after loop variable")?;
        let iterable = Ref::new(self.parse_expr()?);
        let body = self.parse_statement_block("to begin loop body")?;
        Ok(Statement::For {
            span: self.finish_span(span),
            item,
            index,
            iterable,
            body,
        })
    }

    fn parse_if(&mut self) -> Result<Statement> {
        let span = self.tok.1.clone();
        self.next_token()?;
        let cond = Ref::new(self.parse_expr()?);
        let then_body = self.parse_statement_block("to begin if body")?;
        let else_body = if self.token_text() == "else" {
            self.next_token()?;
            if self.token_text() == "if" {
                vec![Ref::new(self.parse_if()?)]
            } else {
                self.parse_statement_block("to begin else body")?
            }
        } else {
            vec![]
        };
        Ok(Statement::If {
            span: self.finish_span(span),
            cond,
            then_body,
            else_body,
        })
    }

    fn parse_output(&mut self, sensitive: bool) -> Result<Statement> {
        let span = self.tok.1.clone();
        self.next_token()?;
        let ty = match TypeName::from_text(self.token_text()) {
            Some(ty) => {
                self.next_token()?;
                ty
            }
            None => return Err(self.error_at_tok("expecting output type")),
        };
        let name = self.parse_ident("as output name")?;
        self.expect("=", "after output name")?;
        let value = Ref::new(self.parse_expr()?);
        Ok(Statement::Output {
            span: self.finish_span(span),
            ty,
            name,
            sensitive,
            value,
        })
    }

    fn parse_import(&mut self) -> Result<Statement> {
        let span = self.tok.1.clone();
        self.next_token()?;
        if self.tok.0 != TokenKind::String {
            return Err(self.error_at_tok("expecting import path string"));
        }
        let path = self.tok.1.clone();
        self.next_token()?;
        let alias = if self.token_text() == "as" {
            self.next_token()?;
            Some(self.parse_ident("as import alias")?)
        } else {
            None
        };
        Ok(Statement::Import {
            span: self.finish_span(span),
            path,
            alias,
        })
    }

    fn parse_expr_or_assign(&mut self) -> Result<Statement> {
        let span = self.tok.1.clone();
        if self.is_ident() && KEYWORDS.contains(&self.token_text()) {
            return Err(self.error_at_tok("unexpected keyword"));
        }
        let expr = Ref::new(self.parse_expr()?);
        if self.token_text() == "=" {
            match expr.as_ref() {
                Expr::Var { .. } | Expr::RefDot { .. } | Expr::RefBrack { .. } => (),
                _ => return Err(expr.span().error("invalid assignment target")),
            }
            self.next_token()?;
            let value = Ref::new(self.parse_expr()?);
            return Ok(Statement::Assign {
                span: self.finish_span(span),
                target: expr,
                value,
            });
        }
        Ok(Statement::Expr {
            span: self.finish_span(span),
            expr,
        })
    }

    pub fn parse_expr(&mut self) -> Result<Expr> {
        self.parse_or_expr()
    }

    fn parse_or_expr(&mut self) -> Result<Expr> {
        let start = self.tok.1.clone();
        let mut expr = self.parse_and_expr()?;
        while self.token_text() == "||" {
            self.next_token()?;
            let rhs = self.parse_and_expr()?;
            expr = Expr::LogicExpr {
                span: self.finish_span(start.clone()),
                op: LogicOp::Or,
                lhs: Ref::new(expr),
                rhs: Ref::new(rhs),
            };
        }
        Ok(expr)
    }

    fn parse_and_expr(&mut self) -> Result<Expr> {
        let start = self.tok.1.clone();
        let mut expr = self.parse_bool_expr()?;
        while self.token_text() == "&&" {
            self.next_token()?;
            let rhs = self.parse_bool_expr()?;
            expr = Expr::LogicExpr {
                span: self.finish_span(start.clone()),
                op: LogicOp::And,
                lhs: Ref::new(expr),
                rhs: Ref::new(rhs),
            };
        }
        Ok(expr)
    }

    fn parse_bool_expr(&mut self) -> Result<Expr> {
        let start = self.tok.1.clone();
        let expr = self.parse_arith_expr()?;
        let op = match self.token_text() {
            "<" => BoolOp::Lt,
            "<=" => BoolOp::Le,
            "==" => BoolOp::Eq,
            ">=" => BoolOp::Ge,
            ">" => BoolOp::Gt,
            "!=" => BoolOp::Ne,
            _ => return Ok(expr),
        };
        self.next_token()?;
        let rhs = self.parse_arith_expr()?;
        Ok(Expr::BoolExpr {
            span: self.finish_span(start),
            op,
            lhs: Ref::new(expr),
            rhs: Ref::new(rhs),
        })
    }

    fn parse_arith_expr(&mut self) -> Result<Expr> {
        let start = self.tok.1.clone();
        let mut expr = self.parse_mul_expr()?;
        loop {
            let op = match self.token_text() {
                "+" => ArithOp::Add,
                "-" => ArithOp::Sub,
                _ => return Ok(expr),
            };
            self.next_token()?;
            let rhs = self.parse_mul_expr()?;
            expr = Expr::ArithExpr {
                span: self.finish_span(start.clone()),
                op,
                lhs: Ref::new(expr),
                rhs: Ref::new(rhs),
            };
        }
    }

    fn parse_mul_expr(&mut self) -> Result<Expr> {
        let start = self.tok.1.clone();
        let mut expr = self.parse_unary_expr()?;
        loop {
            let op = match self.token_text() {
                "*" => ArithOp::Mul,
                "/" => ArithOp::Div,
                "%" => ArithOp::Mod,
                _ => return Ok(expr),
            };
            self.next_token()?;
            let rhs = self.parse_unary_expr()?;
            expr = Expr::ArithExpr {
                span: self.finish_span(start.clone()),
                op,
                lhs: Ref::new(expr),
                rhs: Ref::new(rhs),
            };
        }
    }

    fn parse_unary_expr(&mut self) -> Result<Expr> {
        let start = self.tok.1.clone();
        let op = match self.token_text() {
            "-" => UnaryOp::Neg,
            "!" => UnaryOp::Not,
            _ => return self.parse_postfix_expr(),
        };
        self.next_token()?;
        let expr = self.parse_unary_expr()?;
        Ok(Expr::UnaryExpr {
            span: self.finish_span(start),
            op,
            expr: Ref::new(expr),
        })
    }

    fn parse_postfix_expr(&mut self) -> Result<Expr> {
        let start = self.tok.1.clone();
        let mut expr = self.parse_primary_expr()?;
        loop {
            match self.token_text() {
                "." => {
                    self.next_token()?;
                    let field = self.parse_ident("after `.`")?;
                    expr = Expr::RefDot {
                        span: self.finish_span(start.clone()),
                        refr: Ref::new(expr),
                        field,
                    };
                }
                "[" => {
                    self.next_token()?;
                    let index = Ref::new(self.parse_expr()?);
                    self.expect("]", "to close subscript")?;
                    expr = Expr::RefBrack {
                        span: self.finish_span(start.clone()),
                        refr: Ref::new(expr),
                        index,
                    };
                }
                "(" => {
                    self.next_token()?;
                    let mut params = vec![];
                    if self.token_text() != ")" {
                        loop {
                            params.push(Ref::new(self.parse_expr()?));
                            if self.token_text() != "," {
                                break;
                            }
                            self.next_token()?;
                        }
                    }
                    self.expect(")", "to close call")?;
                    expr = Expr::Call {
                        span: self.finish_span(start.clone()),
                        fcn: Ref::new(expr),
                        params,
                    };
                }
                _ => return Ok(expr),
            }
        }
    }

    fn parse_primary_expr(&mut self) -> Result<Expr> {
        let span = self.tok.1.clone();
        match &self.tok.0 {
            TokenKind::Number => {
                let value = Value::from(Number::from_str(span.text()).map_err(|e| {
                    span.error(format!("could not parse number. {e}").as_str())
                })?);
                self.next_token()?;
                Ok(Expr::Number { span, value })
            }
            TokenKind::String => {
                let text = unescape(span.text())
                    .map_err(|e| span.error(format!("invalid string literal. {e}").as_str()))?;
                let value = Value::String(text.into());
                self.next_token()?;
                Ok(Expr::String { span, value })
            }
            TokenKind::Ident => match span.text() {
                "true" | "false" => {
                    let value = span.text() == "true";
                    self.next_token()?;
                    Ok(Expr::Bool { span, value })
                }
                "null" => {
                    self.next_token()?;
                    Ok(Expr::Null { span })
                }
                _ => {
                    self.next_token()?;
                    Ok(Expr::Var { span })
                }
            },
            TokenKind::Symbol => match span.text() {
                "(" => {
                    self.next_token()?;
                    let expr = self.parse_expr()?;
                    self.expect(")", "to close grouping")?;
                    Ok(expr)
                }
                "[" => self.parse_array_or_compr(),
                "{" => self.parse_object(),
                _ => Err(self.error_at_tok("unexpected token in expression")),
            },
            TokenKind::Eof => Err(self.error_at_tok("unexpected end of file in expression")),
        }
    }

    fn parse_array_or_compr(&mut self) -> Result<Expr> {
        let span = self.tok.1.clone();
        self.next_token()?; // [

        if self.token_text() == "for" {
            let compr = self.parse_comprehension()?;
            self.expect("]", "to close comprehension")?;
            return Ok(Expr::ArrayCompr {
                span: self.finish_span(span),
                compr: Ref::new(compr),
            });
        }

        let mut items = vec![];
        if self.token_text() != "]" {
            loop {
                items.push(Ref::new(self.parse_expr()?));
                if self.token_text() != "," {
                    break;
                }
                self.next_token()?;
            }
        }
        self.expect("]", "to close array")?;
        Ok(Expr::Array {
            span: self.finish_span(span),
            items,
        })
    }

    // for x[, i] in xs: term [if cond [else other]]
    fn parse_comprehension(&mut self) -> Result<Comprehension> {
        let span = self.tok.1.clone();
        self.next_token()?; // for
        let item = self.parse_ident("as comprehension variable")?;
        let index = if self.token_text() == "," {
            self.next_token()?;
            Some(self.parse_ident("as comprehension index variable")?)
        } else {
            None
        };
        self.expect("in", "after comprehension variable")?;
        let iterable = Ref::new(self.parse_expr()?);
        self.expect(":", "before comprehension term")?;
        let term = Ref::new(self.parse_expr()?);
        let guard = if self.token_text() == "if" {
            self.next_token()?;
            let cond = Ref::new(self.parse_expr()?);
            let otherwise = if self.token_text() == "else" {
                self.next_token()?;
                Some(Ref::new(self.parse_expr()?))
            } else {
                None
            };
            Some(Guard { cond, otherwise })
        } else {
            None
        };
        Ok(Comprehension {
            span: self.finish_span(span),
            item,
            index,
            iterable,
            term,
            guard,
        })
    }

    fn parse_object(&mut self) -> Result<Expr> {
        let span = self.tok.1.clone();
        self.next_token()?; // {
        let mut fields = vec![];
        if self.token_text() != "}" {
            loop {
                let key_span = self.tok.1.clone();
                let key = match &self.tok.0 {
                    TokenKind::String => {
                        let text = unescape(key_span.text()).map_err(|e| {
                            key_span.error(format!("invalid string literal. {e}").as_str())
                        })?;
                        self.next_token()?;
                        Expr::String {
                            span: key_span.clone(),
                            value: Value::String(text.into()),
                        }
                    }
                    TokenKind::Ident => {
                        self.next_token()?;
                        Expr::String {
                            span: key_span.clone(),
                            value: Value::String(key_span.text().into()),
                        }
                    }
                    _ => return Err(self.error_at_tok("expecting object key")),
                };
                self.expect(":", "after object key")?;
                let value = Ref::new(self.parse_expr()?);
                fields.push((key_span, Ref::new(key), value));
                if self.token_text() != "," {
                    break;
                }
                self.next_token()?;
            }
        }
        self.expect("}", "to close object")?;
        Ok(Expr::Object {
            span: self.finish_span(span),
            fields,
        })
    }
}
