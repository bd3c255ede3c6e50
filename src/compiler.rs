//! Recursive-descent compiler from source text to SECD bytecode.
//!
//! The compiler reads tokens straight from the [`Lexer`] with one token of lookahead
//! and emits code as it recognises each form; there is no intermediate syntax tree.
//! Every production receives the [`Scope`] chain explicitly, so lambda, `let` and
//! `letrec` bodies see their new frame and nothing leaks out once a body is done.
//!
//! Each emitted instruction atom carries the span of the form that produced it, which
//! the [`crate::trace`] module uses to point back at the source during execution.

use tracing::{debug, instrument, trace};

use crate::lexer::{Keyword, Lexer, Operator, Token, TokenKind};
use crate::scope::Scope;
use crate::value::{NumberType, Opcode, Value, sym};
use crate::{Error, MAX_PARSE_DEPTH, Span, SyntaxError, SyntaxErrorKind};

/// Compiler options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileConfig {
    /// Treat `;` to end of line as a comment (default: true)
    pub handle_comments: bool,
    /// Accept `!`-prefixed identifiers, reserved for machine-generated names
    /// (default: false)
    pub allow_generated_identifiers: bool,
}

impl Default for CompileConfig {
    fn default() -> Self {
        CompileConfig {
            handle_comments: true,
            allow_generated_identifiers: false,
        }
    }
}

/// Bytecode together with the global names it leaves behind
#[derive(Debug, Clone, PartialEq)]
pub struct Compiled {
    pub code: Vec<Value>,
    /// Global frame names after compilation, in runtime order. Feed these back into
    /// [`Compiler::compile_with_globals`] to compile a follow-up program against the
    /// same global frame.
    pub globals: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Compiler {
    config: CompileConfig,
}

impl Compiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: CompileConfig) -> Self {
        Compiler { config }
    }

    pub fn config(&self) -> CompileConfig {
        self.config
    }

    /// Compile a whole program, starting from an empty global frame
    pub fn compile(&self, source: &str) -> Result<Vec<Value>, Error> {
        self.compile_with_globals(source, Vec::new())
            .map(|compiled| compiled.code)
    }

    /// Compile a program whose global frame already holds `globals`
    #[instrument(level = "debug", skip_all, fields(source_len = source.len(), globals = globals.len()))]
    pub fn compile_with_globals(
        &self,
        source: &str,
        globals: Vec<String>,
    ) -> Result<Compiled, Error> {
        let lexer = Lexer::new(source)
            .handle_comments(self.config.handle_comments)
            .allow_generated_identifiers(self.config.allow_generated_identifiers);
        let mut parser = Parser { lexer, depth: 0 };
        let mut scope = Scope::with_globals(globals);

        let code = parser.program(&mut scope)?;
        debug!(
            instructions = code.len(),
            globals = scope.globals().len(),
            "compiled program"
        );

        Ok(Compiled {
            code,
            globals: scope.into_globals(),
        })
    }
}

/// Compile `source` with the default configuration
pub fn compile(source: &str) -> Result<Vec<Value>, Error> {
    Compiler::new().compile(source)
}

/// Whether a top-level form leaves a value on the Stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Produces {
    Value,
    Nothing,
}

/// A quasiquote template is either fixed data or code that builds the data
enum Template {
    Literal(Value),
    Code(Vec<Value>),
}

struct Parser<'a> {
    lexer: Lexer<'a>,
    depth: usize,
}

impl Parser<'_> {
    // ---- Token plumbing ----

    fn peek_kind(&mut self) -> Result<TokenKind, Error> {
        Ok(self.lexer.peek_token()?.kind.clone())
    }

    fn at_close(&mut self) -> Result<bool, Error> {
        Ok(self.lexer.peek_token()?.kind == TokenKind::RightParen)
    }

    fn expect(&mut self, kind: &TokenKind, expected: &str) -> Result<Token, Error> {
        let token = self.lexer.next_token()?;
        if token.kind == *kind {
            Ok(token)
        } else {
            Err(self.unexpected(&token, expected))
        }
    }

    fn close(&mut self, expected: &str) -> Result<Span, Error> {
        self.expect(&TokenKind::RightParen, expected)
            .map(|token| token.span)
    }

    fn identifier(&mut self, expected: &str) -> Result<(String, Span), Error> {
        let token = self.lexer.next_token()?;
        if let TokenKind::Identifier(name) = &token.kind {
            return Ok((name.clone(), token.span));
        }
        Err(self.unexpected(&token, expected))
    }

    fn unexpected(&self, token: &Token, expected: &str) -> Error {
        let kind = if token.kind == TokenKind::Eof {
            SyntaxErrorKind::UnexpectedEof
        } else {
            SyntaxErrorKind::UnexpectedToken
        };
        SyntaxError::new(kind, format!("expected {expected}, found {}", token.kind))
            .expected(expected)
            .found(token.kind.to_string())
            .with_context(self.lexer.source(), token.span.start)
            .into()
    }

    fn error_at(&self, kind: SyntaxErrorKind, message: impl Into<String>, span: Span) -> Error {
        SyntaxError::new(kind, message)
            .with_context(self.lexer.source(), span.start)
            .into()
    }

    fn invalid_form(&self, message: impl Into<String>, span: Span) -> Error {
        self.error_at(SyntaxErrorKind::InvalidForm, message, span)
    }

    /// Run `production` one nesting level deeper
    fn nested<T>(
        &mut self,
        production: impl FnOnce(&mut Self) -> Result<T, Error>,
    ) -> Result<T, Error> {
        if self.depth >= MAX_PARSE_DEPTH {
            let offset = self.lexer.offset();
            return Err(self.error_at(
                SyntaxErrorKind::TooDeeplyNested,
                format!("expression nested deeper than {MAX_PARSE_DEPTH} levels"),
                Span::new(offset, offset),
            ));
        }
        self.depth += 1;
        let result = production(self);
        self.depth -= 1;
        result
    }

    // ---- Program structure ----

    /// program := form+
    ///
    /// Every value-producing form except the last is followed by `POP`, so a program
    /// leaves at most one value on the Stack.
    fn program(&mut self, scope: &mut Scope) -> Result<Vec<Value>, Error> {
        let mut code = Vec::new();
        let mut pending: Option<Span> = None;
        let mut forms = 0usize;

        loop {
            let token = self.lexer.peek_token()?.clone();
            match token.kind {
                TokenKind::Eof if forms == 0 => {
                    return Err(self.unexpected(&token, "an expression"));
                }
                TokenKind::Eof => break,
                TokenKind::RightParen => {
                    return Err(SyntaxError::new(
                        SyntaxErrorKind::TrailingContent,
                        "unexpected ')' after a complete expression",
                    )
                    .found(token.kind.to_string())
                    .with_context(self.lexer.source(), token.span.start)
                    .into());
                }
                _ => {}
            }

            if let Some(span) = pending.take() {
                emit(&mut code, Opcode::Pop, span);
            }
            let start = token.span.start;
            if self.form(scope, &mut code, true)? == Produces::Value {
                pending = Some(Span::new(start, self.lexer.offset()));
            }
            forms += 1;
        }

        Ok(code)
    }

    fn form(
        &mut self,
        scope: &mut Scope,
        out: &mut Vec<Value>,
        top_level: bool,
    ) -> Result<Produces, Error> {
        self.nested(|parser| parser.form_inner(scope, out, top_level))
    }

    fn expression(&mut self, scope: &mut Scope, out: &mut Vec<Value>) -> Result<(), Error> {
        self.form(scope, out, false).map(|_| ())
    }

    /// Compile one expression into its own block
    fn expression_code(&mut self, scope: &mut Scope) -> Result<Vec<Value>, Error> {
        let mut code = Vec::new();
        self.expression(scope, &mut code)?;
        Ok(code)
    }

    fn form_inner(
        &mut self,
        scope: &mut Scope,
        out: &mut Vec<Value>,
        top_level: bool,
    ) -> Result<Produces, Error> {
        let token = self.lexer.next_token()?;
        let span = token.span;

        match &token.kind {
            TokenKind::Number(n) => emit_operand(out, Opcode::Ldc, span, Value::number(*n)),
            TokenKind::Boolean(b) => emit_operand(out, Opcode::Ldc, span, Value::from(*b)),
            TokenKind::String(s) => emit_operand(out, Opcode::Ldc, span, Value::from(s.as_str())),
            TokenKind::Identifier(name) => variable(scope, name, span, out)?,
            TokenKind::Keyword(Keyword::Null) => emit(out, Opcode::Nil, span),
            TokenKind::Quote => {
                let datum = self.datum()?;
                let span = Span::new(span.start, self.lexer.offset());
                emit_operand(out, Opcode::Ldc, span, datum);
            }
            TokenKind::Backquote => self.quasiquote(scope, span, out)?,
            TokenKind::LeftParen => return self.compound(scope, span, out, top_level),
            TokenKind::Comma => {
                return Err(self.invalid_form("unquote ',' outside of a quasiquote", span));
            }
            _ => return Err(self.unexpected(&token, "an expression")),
        }

        Ok(Produces::Value)
    }

    /// Everything that starts with `(`; the opening parenthesis is already consumed
    fn compound(
        &mut self,
        scope: &mut Scope,
        open: Span,
        out: &mut Vec<Value>,
        top_level: bool,
    ) -> Result<Produces, Error> {
        match self.peek_kind()? {
            TokenKind::Keyword(keyword) => {
                self.lexer.next_token()?;
                match keyword {
                    Keyword::If => self.if_form(scope, open, out)?,
                    Keyword::Let => self.let_form(scope, open, out)?,
                    Keyword::Letrec => self.letrec_form(scope, open, out)?,
                    Keyword::Lambda => self.lambda_form(scope, open, out)?,
                    Keyword::Begin => self.begin_form(scope, open, out)?,
                    Keyword::Car => self.primitive(scope, open, "car", Opcode::Car, 1, out)?,
                    Keyword::Cdr => self.primitive(scope, open, "cdr", Opcode::Cdr, 1, out)?,
                    Keyword::Consp => {
                        self.primitive(scope, open, "consp", Opcode::Consp, 1, out)?
                    }
                    Keyword::Cons => self.primitive(scope, open, "cons", Opcode::Cons, 2, out)?,
                    Keyword::Quote => {
                        let datum = self.datum()?;
                        let close = self.close("')' closing quote")?;
                        emit_operand(out, Opcode::Ldc, cover(open, close), datum);
                    }
                    Keyword::Define if top_level => {
                        self.define_form(scope, open, out)?;
                        return Ok(Produces::Nothing);
                    }
                    Keyword::Define => {
                        return Err(self.invalid_form("define is only allowed at top level", open));
                    }
                    Keyword::DefineMacro => {
                        return Err(self.error_at(
                            SyntaxErrorKind::Unsupported,
                            "define-macro is not supported",
                            open,
                        ));
                    }
                    Keyword::Null => {
                        let mut function = Vec::new();
                        emit(&mut function, Opcode::Nil, open);
                        self.call(scope, open, function, out)?;
                    }
                }
            }
            TokenKind::Operator(operator) => {
                self.lexer.next_token()?;
                self.primitive(scope, open, operator.symbol(), binary_opcode(operator), 2, out)?;
            }
            // `and` and `or` are ordinary names, so a binding shadows the operator
            TokenKind::Identifier(name)
                if (name == "and" || name == "or") && scope.resolve(&name).is_none() =>
            {
                self.lexer.next_token()?;
                let (symbol, opcode) = if name == "and" {
                    ("and", Opcode::And)
                } else {
                    ("or", Opcode::Or)
                };
                self.primitive(scope, open, symbol, opcode, 2, out)?;
            }
            TokenKind::RightParen => {
                return Err(self.invalid_form("cannot evaluate the empty application ()", open));
            }
            _ => self.application(scope, open, out)?,
        }

        Ok(Produces::Value)
    }

    /// Compile expressions up to and including the closing `)`, each into its own block
    fn operands(&mut self, scope: &mut Scope) -> Result<(Vec<Vec<Value>>, Span), Error> {
        let mut operands = Vec::new();
        loop {
            if self.at_close()? {
                let close = self.lexer.next_token()?.span;
                return Ok((operands, close));
            }
            operands.push(self.expression_code(scope)?);
        }
    }

    // ---- Special forms ----

    /// Fixed-arity primitive. Operands are emitted right to left so the leftmost
    /// operand ends up on top of the Stack.
    fn primitive(
        &mut self,
        scope: &mut Scope,
        open: Span,
        name: &str,
        opcode: Opcode,
        arity: usize,
        out: &mut Vec<Value>,
    ) -> Result<(), Error> {
        let (operands, close) = self.operands(scope)?;
        if operands.len() != arity {
            return Err(self.invalid_form(
                format!(
                    "'{name}' expects {arity} operand{}, found {}",
                    if arity == 1 { "" } else { "s" },
                    operands.len()
                ),
                open,
            ));
        }
        for code in operands.into_iter().rev() {
            out.extend(code);
        }
        emit(out, opcode, cover(open, close));
        Ok(())
    }

    /// `(if c t e)` => `c SEL (t JOIN) (e JOIN)`
    fn if_form(&mut self, scope: &mut Scope, open: Span, out: &mut Vec<Value>) -> Result<(), Error> {
        let (operands, close) = self.operands(scope)?;
        let span = cover(open, close);
        let count = operands.len();
        let [condition, consequent, alternative]: [Vec<Value>; 3] = operands
            .try_into()
            .map_err(|_| self.invalid_form(format!("'if' expects 3 operands, found {count}"), open))?;

        out.extend(condition);
        emit(out, Opcode::Sel, span);
        out.push(Value::List(with_join(consequent, span)));
        out.push(Value::List(with_join(alternative, span)));
        Ok(())
    }

    /// `(lambda (p...) body...)` => `LDF (body RTN)`
    fn lambda_form(
        &mut self,
        scope: &mut Scope,
        open: Span,
        out: &mut Vec<Value>,
    ) -> Result<(), Error> {
        self.expect(&TokenKind::LeftParen, "'(' opening the parameter list")?;
        let params = self.parameter_names()?;
        let (body, close) = self.body_in_frame(scope, params, open, "lambda")?;
        emit_operand(out, Opcode::Ldf, cover(open, close), Value::List(body));
        Ok(())
    }

    /// `(let ((x e)...) body...)` => `NIL eₙ CONS ... e₁ CONS LDF (body RTN) AP`
    ///
    /// The initialisers are compiled in the enclosing scope.
    fn let_form(&mut self, scope: &mut Scope, open: Span, out: &mut Vec<Value>) -> Result<(), Error> {
        let (names, inits) = self.bindings(scope, "let")?;
        let (body, close) = self.body_in_frame(scope, names, open, "let")?;
        let span = cover(open, close);

        emit_arguments(out, inits, span);
        emit_operand(out, Opcode::Ldf, span, Value::List(body));
        emit(out, Opcode::Ap, span);
        Ok(())
    }

    /// `(letrec ((f e)...) body...)` => `DUM NIL eₙ CONS ... LDF (body RTN) RAP`
    ///
    /// The initialisers see the new frame, so the names are collected before any of
    /// them is compiled.
    fn letrec_form(
        &mut self,
        scope: &mut Scope,
        open: Span,
        out: &mut Vec<Value>,
    ) -> Result<(), Error> {
        let names = self.binding_names()?;
        trace!(?names, "letrec frame");

        scope.push(names);
        let result = self.bindings(scope, "letrec").and_then(|(_, inits)| {
            self.body(scope, open, "letrec")
                .map(|(body, close)| (inits, body, close))
        });
        scope.pop();
        let (inits, body, close) = result?;
        let span = cover(open, close);

        emit(out, Opcode::Dum, span);
        emit_arguments(out, inits, span);
        emit_operand(out, Opcode::Ldf, span, Value::List(body));
        emit(out, Opcode::Rap, span);
        Ok(())
    }

    /// `(begin e₁ ... eₙ)` => `e₁ POP ... eₙ`
    fn begin_form(
        &mut self,
        scope: &mut Scope,
        open: Span,
        out: &mut Vec<Value>,
    ) -> Result<(), Error> {
        let (forms, close) = self.operands(scope)?;
        if forms.is_empty() {
            return Err(self.invalid_form("'begin' needs at least one expression", open));
        }
        let span = cover(open, close);
        for (i, code) in forms.into_iter().enumerate() {
            if i > 0 {
                emit(out, Opcode::Pop, span);
            }
            out.extend(code);
        }
        Ok(())
    }

    /// `(f a₁ ... aₙ)` => `NIL aₙ CONS ... a₁ CONS f AP`
    fn application(
        &mut self,
        scope: &mut Scope,
        open: Span,
        out: &mut Vec<Value>,
    ) -> Result<(), Error> {
        let function = self.expression_code(scope)?;
        self.call(scope, open, function, out)
    }

    /// Arguments of an application whose function code is already compiled
    fn call(
        &mut self,
        scope: &mut Scope,
        open: Span,
        function: Vec<Value>,
        out: &mut Vec<Value>,
    ) -> Result<(), Error> {
        let (arguments, close) = self.operands(scope)?;
        let span = cover(open, close);

        emit_arguments(out, arguments, span);
        out.extend(function);
        emit(out, Opcode::Ap, span);
        Ok(())
    }

    /// `(define (f p...) body...)` => `LDF (body RTN) DEFUN`
    /// `(define x e)` => `e DEFUN`
    ///
    /// The name is bound in the global frame before its value is compiled, which lets
    /// a function refer to itself.
    fn define_form(
        &mut self,
        scope: &mut Scope,
        open: Span,
        out: &mut Vec<Value>,
    ) -> Result<(), Error> {
        let token = self.lexer.next_token()?;
        match &token.kind {
            TokenKind::LeftParen => {
                let (name, _) = self.identifier("the name of the function being defined")?;
                let params = self.parameter_names()?;
                trace!(name = %name, params = params.len(), "define function");
                scope.add_binding(name);

                let (body, close) = self.body_in_frame(scope, params, open, "define")?;
                let span = cover(open, close);
                emit_operand(out, Opcode::Ldf, span, Value::List(body));
                emit(out, Opcode::Defun, span);
            }
            TokenKind::Identifier(name) => {
                trace!(name = %name, "define value");
                scope.add_binding(name.clone());

                let value = self.expression_code(scope)?;
                let close = self.close("')' closing define")?;
                out.extend(value);
                emit(out, Opcode::Defun, cover(open, close));
            }
            _ => return Err(self.unexpected(&token, "a name or '(' after define")),
        }
        Ok(())
    }

    // ---- Pieces shared by the binding forms ----

    /// Identifiers up to and including `)`; the opening `(` is already consumed
    fn parameter_names(&mut self) -> Result<Vec<String>, Error> {
        let mut names: Vec<String> = Vec::new();
        loop {
            let token = self.lexer.next_token()?;
            match &token.kind {
                TokenKind::RightParen => return Ok(names),
                TokenKind::Identifier(name) => {
                    if names.contains(name) {
                        return Err(self.invalid_form(
                            format!("duplicate parameter '{name}'"),
                            token.span,
                        ));
                    }
                    names.push(name.clone());
                }
                _ => return Err(self.unexpected(&token, "a parameter name or ')'")),
            }
        }
    }

    /// `((name expr)...)`, compiling each expr in `scope` as it stands
    fn bindings(
        &mut self,
        scope: &mut Scope,
        form: &str,
    ) -> Result<(Vec<String>, Vec<Vec<Value>>), Error> {
        self.expect(&TokenKind::LeftParen, "'(' opening the binding list")?;
        let mut names: Vec<String> = Vec::new();
        let mut inits = Vec::new();

        loop {
            let token = self.lexer.next_token()?;
            match token.kind {
                TokenKind::RightParen => return Ok((names, inits)),
                TokenKind::LeftParen => {
                    let (name, span) = self.identifier("a variable name")?;
                    if names.contains(&name) {
                        return Err(self.invalid_form(
                            format!("duplicate binding '{name}' in '{form}'"),
                            span,
                        ));
                    }
                    inits.push(self.expression_code(scope)?);
                    self.close("')' closing the binding")?;
                    names.push(name);
                }
                _ => return Err(self.unexpected(&token, "'(' opening a binding or ')'")),
            }
        }
    }

    /// Names bound by the `letrec` binding list ahead, read without consuming any
    /// input. Malformed lists stop the scan early; the real pass reports the error.
    fn binding_names(&self) -> Result<Vec<String>, Error> {
        let mut lookahead = self.lexer.clone();
        let mut names = Vec::new();

        if lookahead.next_token()?.kind != TokenKind::LeftParen {
            return Ok(names);
        }
        while lookahead.next_token()?.kind == TokenKind::LeftParen {
            match lookahead.next_token()?.kind {
                TokenKind::Identifier(name) => names.push(name),
                _ => break,
            }
            skip_datum(&mut lookahead)?;
            if lookahead.next_token()?.kind != TokenKind::RightParen {
                break;
            }
        }
        Ok(names)
    }

    /// Compile a body with `frame` pushed onto the scope chain
    fn body_in_frame(
        &mut self,
        scope: &mut Scope,
        frame: Vec<String>,
        open: Span,
        form: &str,
    ) -> Result<(Vec<Value>, Span), Error> {
        scope.push(frame);
        let result = self.body(scope, open, form);
        scope.pop();
        result
    }

    /// `body... )` => `body₁ POP ... bodyₙ RTN`
    fn body(
        &mut self,
        scope: &mut Scope,
        open: Span,
        form: &str,
    ) -> Result<(Vec<Value>, Span), Error> {
        let mut code = Vec::new();
        let mut forms = 0usize;

        let close = loop {
            if self.at_close()? {
                break self.lexer.next_token()?.span;
            }
            if forms > 0 {
                emit(&mut code, Opcode::Pop, open);
            }
            self.expression(scope, &mut code)?;
            forms += 1;
        };

        if forms == 0 {
            return Err(self.invalid_form(format!("'{form}' has an empty body"), open));
        }
        emit(&mut code, Opcode::Rtn, cover(open, close));
        Ok((code, close))
    }

    // ---- Quoted data ----

    /// A literal datum: identifiers become symbols and booleans become `1`/`0`
    fn datum(&mut self) -> Result<Value, Error> {
        self.nested(Self::datum_inner)
    }

    fn datum_inner(&mut self) -> Result<Value, Error> {
        let token = self.lexer.next_token()?;
        Ok(match &token.kind {
            TokenKind::Number(n) => Value::number(*n),
            TokenKind::Boolean(b) => Value::from(*b),
            TokenKind::String(s) => Value::from(s.as_str()),
            TokenKind::Identifier(name) => sym(name),
            TokenKind::Keyword(keyword) => sym(keyword.name()),
            TokenKind::Operator(operator) => sym(operator.symbol()),
            TokenKind::LeftParen => {
                let mut items = Vec::new();
                while !self.at_close()? {
                    items.push(self.datum()?);
                }
                self.lexer.next_token()?;
                Value::List(items)
            }
            TokenKind::Quote => Value::List(vec![sym("quote"), self.datum()?]),
            TokenKind::Backquote => Value::List(vec![sym("quasiquote"), self.datum()?]),
            TokenKind::Comma => Value::List(vec![sym("unquote"), self.datum()?]),
            TokenKind::RightParen | TokenKind::Eof => {
                return Err(self.unexpected(&token, "a datum"));
            }
        })
    }

    /// `` `template `` with `,expr` holes. Parts without holes stay literal; a list
    /// with holes is built at runtime with `NIL` and `CONS`.
    fn quasiquote(
        &mut self,
        scope: &mut Scope,
        open: Span,
        out: &mut Vec<Value>,
    ) -> Result<(), Error> {
        match self.template(scope)? {
            Template::Literal(value) => {
                let span = Span::new(open.start, self.lexer.offset());
                emit_operand(out, Opcode::Ldc, span, value);
            }
            Template::Code(code) => out.extend(code),
        }
        Ok(())
    }

    fn template(&mut self, scope: &mut Scope) -> Result<Template, Error> {
        self.nested(|parser| parser.template_inner(scope))
    }

    fn template_inner(&mut self, scope: &mut Scope) -> Result<Template, Error> {
        let token = self.lexer.peek_token()?.clone();
        match token.kind {
            TokenKind::Comma => {
                self.lexer.next_token()?;
                Ok(Template::Code(self.expression_code(scope)?))
            }
            TokenKind::Backquote => Err(self.error_at(
                SyntaxErrorKind::Unsupported,
                "nested quasiquote is not supported",
                token.span,
            )),
            TokenKind::LeftParen => {
                self.lexer.next_token()?;
                let mut elements = Vec::new();
                let close = loop {
                    if self.at_close()? {
                        break self.lexer.next_token()?.span;
                    }
                    elements.push(self.template(scope)?);
                };

                if elements.iter().all(|e| matches!(e, Template::Literal(_))) {
                    let items = elements
                        .into_iter()
                        .filter_map(|element| match element {
                            Template::Literal(value) => Some(value),
                            Template::Code(_) => None,
                        })
                        .collect();
                    return Ok(Template::Literal(Value::List(items)));
                }

                let span = cover(token.span, close);
                let mut code = Vec::new();
                emit(&mut code, Opcode::Nil, span);
                for element in elements.into_iter().rev() {
                    match element {
                        Template::Literal(value) => {
                            emit_operand(&mut code, Opcode::Ldc, span, value)
                        }
                        Template::Code(element_code) => code.extend(element_code),
                    }
                    emit(&mut code, Opcode::Cons, span);
                }
                Ok(Template::Code(code))
            }
            _ => Ok(Template::Literal(self.datum()?)),
        }
    }
}

/// Consume one datum from `lexer` without interpreting it
fn skip_datum(lexer: &mut Lexer<'_>) -> Result<(), Error> {
    let mut depth = 0usize;
    loop {
        match lexer.next_token()?.kind {
            TokenKind::LeftParen => depth += 1,
            TokenKind::RightParen if depth > 0 => depth -= 1,
            // Prefixes belong to the datum that follows
            TokenKind::Quote | TokenKind::Backquote | TokenKind::Comma => continue,
            TokenKind::RightParen | TokenKind::Eof => return Ok(()),
            _ => {}
        }
        if depth == 0 {
            return Ok(());
        }
    }
}

/// `x` => `LD depth offset`
fn variable(scope: &Scope, name: &str, span: Span, out: &mut Vec<Value>) -> Result<(), Error> {
    let (depth, offset) = scope.resolve(name).ok_or_else(|| Error::Scope {
        name: name.to_owned(),
    })?;
    emit(out, Opcode::Ld, span);
    out.push(index_operand(depth));
    out.push(index_operand(offset));
    Ok(())
}

fn emit(out: &mut Vec<Value>, code: Opcode, span: Span) {
    out.push(Value::opcode(code, Some(span)));
}

fn emit_operand(out: &mut Vec<Value>, code: Opcode, span: Span, operand: Value) {
    emit(out, code, span);
    out.push(operand);
}

/// `NIL aₙ CONS ... a₁ CONS`: an argument list with `a₁` at its head
fn emit_arguments(out: &mut Vec<Value>, arguments: Vec<Vec<Value>>, span: Span) {
    emit(out, Opcode::Nil, span);
    for argument in arguments.into_iter().rev() {
        out.extend(argument);
        emit(out, Opcode::Cons, span);
    }
}

fn with_join(mut code: Vec<Value>, span: Span) -> Vec<Value> {
    emit(&mut code, Opcode::Join, span);
    code
}

fn index_operand(index: usize) -> Value {
    Value::number(NumberType::try_from(index).unwrap_or(NumberType::MAX))
}

fn cover(open: Span, close: Span) -> Span {
    Span::new(open.start, close.end)
}

fn binary_opcode(operator: Operator) -> Opcode {
    match operator {
        Operator::Add => Opcode::Add,
        Operator::Sub => Opcode::Sub,
        Operator::Mul => Opcode::Mul,
        Operator::Div => Opcode::Div,
        Operator::Eq => Opcode::Eq,
        Operator::Ne => Opcode::Ne,
        Operator::Lt => Opcode::Lt,
        Operator::Le => Opcode::Le,
        Operator::Gt => Opcode::Ht,
        Operator::Ge => Opcode::He,
    }
}
