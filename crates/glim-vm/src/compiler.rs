use std::rc::Rc;

use glim_core::chunk::{Function, MAX_CONSTANTS};
use glim_core::value::Value;
use glim_core::GlimError;
use glim_scanner::{Scanner, Token, TokenKind};

use crate::opcodes::Op;

/// Slot operands are a single byte, and slot 0 of every frame is reserved
/// for the callee (or `this`).
const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;
const MAX_JUMP: usize = u16::MAX as usize;

/// Compile Glim source into the top-level script function.
///
/// Diagnostics are written to stderr as they are found; on failure the
/// returned error carries only the count and the chunk must be discarded.
pub fn compile(source: &str) -> Result<Function, GlimError> {
    let mut parser = Parser::new(source);
    parser.advance();
    while !parser.matches(TokenKind::Eof) {
        parser.declaration();
    }
    let function = parser.end_script();
    if parser.had_error {
        Err(GlimError::Compile {
            count: parser.error_count,
        })
    } else {
        Ok(function)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Unary,      // ! -
    Call,       // . ()
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call => Precedence::Primary,
            Precedence::Primary => Precedence::Primary,
        }
    }
}

type ParseFn<'src> = fn(&mut Parser<'src>, bool);

struct ParseRule<'src> {
    prefix: Option<ParseFn<'src>>,
    infix: Option<ParseFn<'src>>,
    precedence: Precedence,
}

impl<'src> ParseRule<'src> {
    fn new(
        prefix: Option<ParseFn<'src>>,
        infix: Option<ParseFn<'src>>,
        precedence: Precedence,
    ) -> Self {
        ParseRule {
            prefix,
            infix,
            precedence,
        }
    }
}

/// The parse-rule table: one row per token kind. Adding an operator means
/// adding a row, nothing else.
fn rule<'src>(kind: TokenKind) -> ParseRule<'src> {
    use Precedence as P;
    use TokenKind as T;
    match kind {
        T::LeftParen => ParseRule::new(Some(Parser::grouping), Some(Parser::call), P::Call),
        T::RightParen => ParseRule::new(None, None, P::None),
        T::LeftBrace => ParseRule::new(None, None, P::None),
        T::RightBrace => ParseRule::new(None, None, P::None),
        T::Semicolon => ParseRule::new(None, None, P::None),
        T::Comma => ParseRule::new(None, None, P::None),
        T::Dot => ParseRule::new(None, Some(Parser::dot), P::Call),
        T::Minus => ParseRule::new(Some(Parser::unary), Some(Parser::binary), P::Term),
        T::Plus => ParseRule::new(None, Some(Parser::binary), P::Term),
        T::Slash => ParseRule::new(None, Some(Parser::binary), P::Factor),
        T::Star => ParseRule::new(None, Some(Parser::binary), P::Factor),
        T::Bang => ParseRule::new(Some(Parser::unary), None, P::None),
        T::BangEqual => ParseRule::new(None, Some(Parser::binary), P::Equality),
        T::Equal => ParseRule::new(None, None, P::None),
        T::EqualEqual => ParseRule::new(None, Some(Parser::binary), P::Equality),
        T::Greater => ParseRule::new(None, Some(Parser::binary), P::Comparison),
        T::GreaterEqual => ParseRule::new(None, Some(Parser::binary), P::Comparison),
        T::Less => ParseRule::new(None, Some(Parser::binary), P::Comparison),
        T::LessEqual => ParseRule::new(None, Some(Parser::binary), P::Comparison),
        T::Identifier => ParseRule::new(Some(Parser::variable), None, P::None),
        T::String => ParseRule::new(Some(Parser::string), None, P::None),
        T::Number => ParseRule::new(Some(Parser::number), None, P::None),
        T::And => ParseRule::new(None, Some(Parser::and_rule), P::And),
        T::Break => ParseRule::new(None, None, P::None),
        T::Class => ParseRule::new(None, None, P::None),
        T::Else => ParseRule::new(None, None, P::None),
        T::False => ParseRule::new(Some(Parser::literal), None, P::None),
        T::For => ParseRule::new(None, None, P::None),
        T::Fun => ParseRule::new(None, None, P::None),
        T::If => ParseRule::new(None, None, P::None),
        T::Nil => ParseRule::new(Some(Parser::literal), None, P::None),
        T::Or => ParseRule::new(None, Some(Parser::or_rule), P::Or),
        T::Print => ParseRule::new(None, None, P::None),
        T::Return => ParseRule::new(None, None, P::None),
        T::Super => ParseRule::new(None, None, P::None),
        T::This => ParseRule::new(Some(Parser::this_rule), None, P::None),
        T::True => ParseRule::new(Some(Parser::literal), None, P::None),
        T::Var => ParseRule::new(None, None, P::None),
        T::While => ParseRule::new(None, None, P::None),
        T::Error => ParseRule::new(None, None, P::None),
        T::Eof => ParseRule::new(None, None, P::None),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
}

struct Local<'src> {
    name: &'src str,
    /// -1 while declared but not yet initialized.
    depth: i32,
    is_captured: bool,
}

struct CompilerUpvalue {
    index: u8,
    is_local: bool,
}

/// Per-function compilation state. The parser keeps a stack of these; the
/// innermost one receives all emitted code.
struct FunctionCompiler<'src> {
    function: Function,
    kind: FunctionKind,
    locals: Vec<Local<'src>>,
    upvalues: Vec<CompilerUpvalue>,
    scope_depth: i32,
}

impl<'src> FunctionCompiler<'src> {
    fn new(kind: FunctionKind, name: &str) -> Self {
        let mut locals = Vec::with_capacity(8);
        // Slot 0 belongs to the callee; methods expose it as `this`.
        locals.push(Local {
            name: if kind == FunctionKind::Method {
                "this"
            } else {
                ""
            },
            depth: 0,
            is_captured: false,
        });
        FunctionCompiler {
            function: if kind == FunctionKind::Script {
                Function::script()
            } else {
                Function::named(name)
            },
            kind,
            locals,
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

/// Marker for an enclosing `class` declaration; exists only so the
/// compiler can tell whether `this` is legal.
struct ClassCompiler;

struct Parser<'src> {
    scanner: Scanner<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    compilers: Vec<FunctionCompiler<'src>>,
    classes: Vec<ClassCompiler>,
    had_error: bool,
    panic_mode: bool,
    error_count: usize,
}

impl<'src> Parser<'src> {
    fn new(source: &'src str) -> Self {
        Parser {
            scanner: Scanner::new(source),
            current: Token::empty(),
            previous: Token::empty(),
            compilers: vec![FunctionCompiler::new(FunctionKind::Script, "")],
            classes: Vec::new(),
            had_error: false,
            panic_mode: false,
            error_count: 0,
        }
    }

    fn end_script(&mut self) -> Function {
        self.emit_return();
        let compiler = self
            .compilers
            .pop()
            .expect("script compiler still on the stack");
        compiler.function
    }

    fn compiler(&self) -> &FunctionCompiler<'src> {
        self.compilers.last().expect("compiler stack is never empty")
    }

    fn compiler_mut(&mut self) -> &mut FunctionCompiler<'src> {
        self.compilers
            .last_mut()
            .expect("compiler stack is never empty")
    }

    // ── Token plumbing ────────────────────────────────────────────

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = self.current.lexeme;
            self.error_at(self.current, message);
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
            return;
        }
        self.error_at(self.current, message);
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    // ── Error reporting ───────────────────────────────────────────

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        self.error_count += 1;

        let mut text = format!("[line {}] Error", token.line);
        match token.kind {
            TokenKind::Eof => text.push_str(" at end"),
            TokenKind::Error => {}
            _ => {
                text.push_str(" at '");
                text.push_str(token.lexeme);
                text.push('\'');
            }
        }
        eprintln!("{text}: {message}");
    }

    fn error(&mut self, message: &str) {
        self.error_at(self.previous, message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current, message);
    }

    /// Skip forward to a statement boundary so one mistake does not cascade.
    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::While
                | TokenKind::If
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // ── Emission ──────────────────────────────────────────────────

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.compiler_mut().function.chunk.write(byte, line);
    }

    fn emit_op(&mut self, op: Op) {
        self.emit_byte(op as u8);
    }

    fn emit_ops(&mut self, a: Op, b: Op) {
        self.emit_op(a);
        self.emit_op(b);
    }

    fn emit_op_byte(&mut self, op: Op, operand: u8) {
        self.emit_op(op);
        self.emit_byte(operand);
    }

    /// The implicit tail of every function body.
    fn emit_return(&mut self) {
        self.emit_ops(Op::Nil, Op::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        let index = self.compiler_mut().function.chunk.add_constant(value);
        if index >= MAX_CONSTANTS {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        index as u8
    }

    fn emit_constant(&mut self, value: Value) {
        let index = self.make_constant(value);
        self.emit_op_byte(Op::Constant, index);
    }

    fn current_len(&self) -> usize {
        self.compiler().function.chunk.code.len()
    }

    /// Emit a jump with a 0xFFFF placeholder; returns the offset of the
    /// operand for later patching.
    fn emit_jump(&mut self, op: Op) -> usize {
        self.emit_op(op);
        self.emit_byte(0xFF);
        self.emit_byte(0xFF);
        self.current_len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        // -2 to step over the operand itself.
        let jump = self.current_len() - offset - 2;
        if jump > MAX_JUMP {
            self.error("Too much code to jump over.");
        }
        let code = &mut self.compiler_mut().function.chunk.code;
        code[offset] = ((jump >> 8) & 0xFF) as u8;
        code[offset + 1] = (jump & 0xFF) as u8;
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(Op::Loop);
        let offset = self.current_len() - loop_start + 2;
        if offset > MAX_JUMP {
            self.error("Loop body too large.");
        }
        self.emit_byte(((offset >> 8) & 0xFF) as u8);
        self.emit_byte((offset & 0xFF) as u8);
    }

    // ── Pratt core ────────────────────────────────────────────────

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix) = rule(self.previous.kind).prefix else {
            self.error("Expect expression.");
            return;
        };

        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= rule(self.current.kind).precedence {
            self.advance();
            if let Some(infix) = rule(self.previous.kind).infix {
                infix(self, can_assign);
            }
        }

        if can_assign && self.matches(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    // ── Prefix / infix handlers ───────────────────────────────────

    fn number(&mut self, _can_assign: bool) {
        match self.previous.lexeme.parse::<f64>() {
            Ok(value) => self.emit_constant(Value::Number(value)),
            Err(_) => self.error("Invalid number literal."),
        }
    }

    fn string(&mut self, _can_assign: bool) {
        let lexeme = self.previous.lexeme;
        let body = &lexeme[1..lexeme.len() - 1];
        self.emit_constant(Value::string(body));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::False => self.emit_op(Op::False),
            TokenKind::True => self.emit_op(Op::True),
            TokenKind::Nil => self.emit_op(Op::Nil),
            _ => {}
        }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenKind::Minus => self.emit_op(Op::Negate),
            TokenKind::Bang => self.emit_op(Op::Not),
            _ => {}
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        self.parse_precedence(rule(operator).precedence.next());
        match operator {
            TokenKind::BangEqual => self.emit_ops(Op::Equal, Op::Not),
            TokenKind::EqualEqual => self.emit_op(Op::Equal),
            TokenKind::Greater => self.emit_op(Op::Greater),
            TokenKind::GreaterEqual => self.emit_ops(Op::Less, Op::Not),
            TokenKind::Less => self.emit_op(Op::Less),
            TokenKind::LessEqual => self.emit_ops(Op::Greater, Op::Not),
            TokenKind::Plus => self.emit_op(Op::Add),
            TokenKind::Minus => self.emit_op(Op::Subtract),
            TokenKind::Star => self.emit_op(Op::Multiply),
            TokenKind::Slash => self.emit_op(Op::Divide),
            _ => {}
        }
    }

    fn and_rule(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(Op::JumpIfFalse);
        self.emit_op(Op::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_rule(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(Op::JumpIfFalse);
        let end_jump = self.emit_jump(Op::Jump);
        self.patch_jump(else_jump);
        self.emit_op(Op::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self, _can_assign: bool) {
        let arg_count = self.argument_list();
        self.emit_op_byte(Op::Call, arg_count);
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: usize = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if count == 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                count += 1;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        count.min(255) as u8
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.identifier_constant(self.previous);
        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_op_byte(Op::SetProperty, name);
        } else {
            self.emit_op_byte(Op::GetProperty, name);
        }
    }

    fn variable(&mut self, can_assign: bool) {
        self.named_variable(self.previous, can_assign);
    }

    fn this_rule(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.variable(false);
    }

    // ── Variable resolution ───────────────────────────────────────

    fn identifier_constant(&mut self, token: Token<'src>) -> u8 {
        self.make_constant(Value::string(token.lexeme))
    }

    /// Resolve `name` as a local of the compiler at `level`; locals are
    /// scanned from the top of the stack downward so inner shadows win.
    fn resolve_local_at(&mut self, level: usize, name: &str) -> Option<u8> {
        let mut found = None;
        for (i, local) in self.compilers[level].locals.iter().enumerate().rev() {
            if local.name == name {
                found = Some((i as u8, local.depth == -1));
                break;
            }
        }
        let (slot, uninitialized) = found?;
        if uninitialized {
            self.error("Can't read local variable in its own initializer.");
        }
        Some(slot)
    }

    /// Resolve `name` as a variable of an enclosing function, threading a
    /// chain of upvalues down to `level`.
    fn resolve_upvalue_at(&mut self, level: usize, name: &str) -> Option<u8> {
        if level == 0 {
            return None;
        }
        let parent = level - 1;
        if let Some(slot) = self.resolve_local_at(parent, name) {
            self.compilers[parent].locals[slot as usize].is_captured = true;
            return Some(self.add_upvalue_at(level, slot, true));
        }
        if let Some(index) = self.resolve_upvalue_at(parent, name) {
            return Some(self.add_upvalue_at(level, index, false));
        }
        None
    }

    fn add_upvalue_at(&mut self, level: usize, index: u8, is_local: bool) -> u8 {
        if let Some(existing) = self.compilers[level]
            .upvalues
            .iter()
            .position(|upvalue| upvalue.index == index && upvalue.is_local == is_local)
        {
            return existing as u8;
        }
        if self.compilers[level].upvalues.len() >= MAX_UPVALUES {
            self.error("Too many closure variables in function.");
            return 0;
        }
        let compiler = &mut self.compilers[level];
        compiler.upvalues.push(CompilerUpvalue { index, is_local });
        compiler.function.upvalue_count = compiler.upvalues.len();
        (compiler.upvalues.len() - 1) as u8
    }

    fn named_variable(&mut self, name: Token<'src>, can_assign: bool) {
        let top = self.compilers.len() - 1;
        let (get_op, set_op, arg);
        if let Some(slot) = self.resolve_local_at(top, name.lexeme) {
            get_op = Op::GetLocal;
            set_op = Op::SetLocal;
            arg = slot;
        } else if let Some(index) = self.resolve_upvalue_at(top, name.lexeme) {
            get_op = Op::GetUpvalue;
            set_op = Op::SetUpvalue;
            arg = index;
        } else {
            arg = self.identifier_constant(name);
            get_op = Op::GetGlobal;
            set_op = Op::SetGlobal;
        }

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_op_byte(set_op, arg);
        } else {
            self.emit_op_byte(get_op, arg);
        }
    }

    // ── Declarations ──────────────────────────────────────────────

    fn declaration(&mut self) {
        if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else if self.matches(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.matches(TokenKind::Class) {
            self.class_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.matches(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(Op::Nil);
        }
        self.consume(
            TokenKind::Semicolon,
            "Expect ';' after variable declaration.",
        );
        self.define_variable(global);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        // Initialized eagerly so the body can call itself.
        self.mark_initialized();
        self.function(FunctionKind::Function);
        self.define_variable(global);
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous;
        let name_constant = self.identifier_constant(class_name);
        self.declare_variable();
        self.emit_op_byte(Op::Class, name_constant);
        self.define_variable(name_constant);

        self.classes.push(ClassCompiler);
        // Load the class back on the stack so METHOD can find it.
        self.named_variable(class_name, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.emit_op(Op::Pop);
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.classes.pop();
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let constant = self.identifier_constant(self.previous);
        self.function(FunctionKind::Method);
        self.emit_op_byte(Op::Method, constant);
    }

    /// Compile a function body into a fresh compiler, then emit the
    /// CLOSURE instruction and its upvalue descriptors in the parent.
    fn function(&mut self, kind: FunctionKind) {
        let name = self.previous.lexeme;
        self.compilers.push(FunctionCompiler::new(kind, name));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                if self.compiler().function.arity == 255 {
                    self.error_at_current("Can't have more than 255 parameters.");
                } else {
                    self.compiler_mut().function.arity += 1;
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        let compiler = self.end_compiler();
        let upvalues = compiler.upvalues;
        let constant = self.make_constant(Value::Function(Rc::new(compiler.function)));
        self.emit_op_byte(Op::Closure, constant);
        for upvalue in &upvalues {
            self.emit_byte(upvalue.is_local as u8);
            self.emit_byte(upvalue.index);
        }
    }

    fn end_compiler(&mut self) -> FunctionCompiler<'src> {
        self.emit_return();
        self.compilers
            .pop()
            .expect("function compiler still on the stack")
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.compiler().scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(self.previous)
    }

    fn declare_variable(&mut self) {
        if self.compiler().scope_depth == 0 {
            return;
        }
        let name = self.previous.lexeme;

        let mut duplicate = false;
        let compiler = self.compiler();
        for local in compiler.locals.iter().rev() {
            if local.depth != -1 && local.depth < compiler.scope_depth {
                break;
            }
            if local.name == name {
                duplicate = true;
                break;
            }
        }
        if duplicate {
            self.error("Already a variable with this name in this scope.");
        }
        self.add_local(name);
    }

    fn add_local(&mut self, name: &'src str) {
        if self.compiler().locals.len() >= MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.compiler_mut().locals.push(Local {
            name,
            depth: -1,
            is_captured: false,
        });
    }

    fn mark_initialized(&mut self) {
        let depth = self.compiler().scope_depth;
        if depth == 0 {
            return;
        }
        self.compiler_mut()
            .locals
            .last_mut()
            .expect("a local was just declared")
            .depth = depth;
    }

    fn define_variable(&mut self, global: u8) {
        if self.compiler().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_op_byte(Op::DefineGlobal, global);
    }

    // ── Statements ────────────────────────────────────────────────

    fn statement(&mut self) {
        if self.matches(TokenKind::Print) {
            self.print_statement();
        } else if self.matches(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else if self.matches(TokenKind::If) {
            self.if_statement();
        } else if self.matches(TokenKind::While) {
            self.while_statement();
        } else if self.matches(TokenKind::For) {
            self.for_statement();
        } else if self.matches(TokenKind::Return) {
            self.return_statement();
        } else {
            self.expression_statement();
        }
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(Op::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(Op::Pop);
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn begin_scope(&mut self) {
        self.compiler_mut().scope_depth += 1;
    }

    /// Pop every local that belonged to the closed scope; captured ones are
    /// migrated to the heap instead of discarded.
    fn end_scope(&mut self) {
        self.compiler_mut().scope_depth -= 1;
        loop {
            let compiler = self.compiler();
            let Some(local) = compiler.locals.last() else {
                break;
            };
            if local.depth <= compiler.scope_depth {
                break;
            }
            let captured = local.is_captured;
            self.compiler_mut().locals.pop();
            if captured {
                self.emit_op(Op::CloseUpvalue);
            } else {
                self.emit_op(Op::Pop);
            }
        }
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let else_jump = self.emit_jump(Op::JumpIfFalse);
        self.emit_op(Op::Pop);
        self.statement();
        let end_jump = self.emit_jump(Op::Jump);

        self.patch_jump(else_jump);
        self.emit_op(Op::Pop);
        if self.matches(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(end_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_len();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(Op::JumpIfFalse);
        self.emit_op(Op::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(Op::Pop);
    }

    /// `for` desugars to a while loop with the increment spliced in via a
    /// pair of jumps.
    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");

        if self.matches(TokenKind::Semicolon) {
            // No initializer.
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_len();
        let mut exit_jump = None;

        if !self.matches(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(Op::JumpIfFalse));
            self.emit_op(Op::Pop);
        }

        if !self.matches(TokenKind::RightParen) {
            let body_jump = self.emit_jump(Op::Jump);
            let increment_start = self.current_len();
            self.expression();
            self.emit_op(Op::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");
            self.emit_loop(loop_start);
            self.patch_jump(body_jump);
            loop_start = increment_start;
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit) = exit_jump {
            self.patch_jump(exit);
            self.emit_op(Op::Pop);
        }
        self.end_scope();
    }

    fn return_statement(&mut self) {
        if self.compiler().kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }
        if self.matches(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(Op::Return);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcodes::op;

    fn compile_ok(source: &str) -> Function {
        compile(source).expect("source should compile")
    }

    fn error_count(source: &str) -> usize {
        match compile(source) {
            Err(GlimError::Compile { count }) => count,
            Ok(_) => 0,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn precedence_orders_factor_over_term() {
        let function = compile_ok("1 + 2 * 3;");
        assert_eq!(
            function.chunk.code,
            vec![
                op::CONSTANT,
                0,
                op::CONSTANT,
                1,
                op::CONSTANT,
                2,
                op::MULTIPLY,
                op::ADD,
                op::POP,
                op::NIL,
                op::RETURN,
            ]
        );
        assert_eq!(function.chunk.constants.len(), 3);
    }

    #[test]
    fn comparison_pairs_desugar_with_not() {
        let function = compile_ok("1 <= 2;");
        assert_eq!(
            function.chunk.code,
            vec![
                op::CONSTANT,
                0,
                op::CONSTANT,
                1,
                op::GREATER,
                op::NOT,
                op::POP,
                op::NIL,
                op::RETURN,
            ]
        );
    }

    #[test]
    fn global_declaration_emits_define() {
        let function = compile_ok("var a = 1;");
        // Constant 0 is the name, constant 1 the initializer.
        assert_eq!(
            function.chunk.code,
            vec![op::CONSTANT, 1, op::DEFINE_GLOBAL, 0, op::NIL, op::RETURN]
        );
        assert_eq!(function.chunk.constants[0], Value::string("a"));
    }

    #[test]
    fn locals_use_slots_not_names() {
        let function = compile_ok("{ var a = 1; a; }");
        assert_eq!(
            function.chunk.code,
            vec![
                op::CONSTANT,
                0,
                op::GET_LOCAL,
                1,
                op::POP,
                op::POP,
                op::NIL,
                op::RETURN,
            ]
        );
        // No name constant needed for locals.
        assert_eq!(function.chunk.constants, vec![Value::Number(1.0)]);
    }

    #[test]
    fn and_short_circuits_with_a_single_jump() {
        let function = compile_ok("true and false;");
        assert_eq!(
            function.chunk.code,
            vec![
                op::TRUE,
                op::JUMP_IF_FALSE,
                0,
                2,
                op::POP,
                op::FALSE,
                op::POP,
                op::NIL,
                op::RETURN,
            ]
        );
    }

    #[test]
    fn chunk_lines_track_code_length() {
        let function = compile_ok("var a = 1;\nprint a;\n");
        assert_eq!(function.chunk.code.len(), function.chunk.lines.len());
        assert!(function.chunk.lines.iter().all(|&line| line >= 1));
    }

    #[test]
    fn nested_function_captures_local_as_upvalue() {
        let function = compile_ok("{ var x = 1; fun inner() { x = x + 1; } }");
        let inner = function
            .chunk
            .constants
            .iter()
            .find_map(|constant| match constant {
                Value::Function(f) => Some(f.clone()),
                _ => None,
            })
            .expect("inner function in the constant pool");
        assert_eq!(inner.upvalue_count, 1);

        // The CLOSURE for inner carries one (is_local=1, index=1) pair.
        let code = &function.chunk.code;
        let closure_at = code
            .iter()
            .position(|&byte| byte == op::CLOSURE)
            .expect("block emits CLOSURE");
        assert_eq!(&code[closure_at + 2..closure_at + 4], &[1, 1]);

        // Leaving the block closes the captured slot instead of popping it.
        assert!(code.contains(&op::CLOSE_UPVALUE));
    }

    #[test]
    fn upvalue_chain_through_two_levels() {
        let function =
            compile_ok("fun a() { var x = 1; fun b() { fun c() { x; } } }");
        let a = function
            .chunk
            .constants
            .iter()
            .find_map(|c| match c {
                Value::Function(f) => Some(f.clone()),
                _ => None,
            })
            .unwrap();
        let b = a
            .chunk
            .constants
            .iter()
            .find_map(|c| match c {
                Value::Function(f) => Some(f.clone()),
                _ => None,
            })
            .unwrap();
        let c = b
            .chunk
            .constants
            .iter()
            .find_map(|c| match c {
                Value::Function(f) => Some(f.clone()),
                _ => None,
            })
            .unwrap();
        // b re-exports a's local; c captures b's upvalue.
        assert_eq!(b.upvalue_count, 1);
        assert_eq!(c.upvalue_count, 1);
        let closure_at = b
            .chunk
            .code
            .iter()
            .position(|&byte| byte == op::CLOSURE)
            .unwrap();
        assert_eq!(&b.chunk.code[closure_at + 2..closure_at + 4], &[0, 0]);
    }

    #[test]
    fn script_function_is_unnamed() {
        let function = compile_ok("print 1;");
        assert!(function.is_script());
    }

    #[test]
    fn return_at_top_level_is_an_error() {
        assert_eq!(error_count("return 1;"), 1);
    }

    #[test]
    fn reading_local_in_its_own_initializer_is_an_error() {
        assert_eq!(error_count("{ var a = a; }"), 1);
    }

    #[test]
    fn same_scope_redeclaration_is_an_error() {
        assert_eq!(error_count("{ var a = 1; var a = 2; }"), 1);
        // Shadowing in an inner scope is fine.
        assert_eq!(error_count("{ var a = 1; { var a = 2; } }"), 0);
    }

    #[test]
    fn global_redeclaration_is_allowed() {
        assert_eq!(error_count("var a = 1; var a = 2;"), 0);
    }

    #[test]
    fn invalid_assignment_target() {
        assert_eq!(error_count("1 = 2;"), 1);
        assert_eq!(error_count("a + b = 1;"), 1);
    }

    #[test]
    fn this_outside_a_class_is_an_error() {
        assert_eq!(error_count("print this;"), 1);
        assert_eq!(error_count("fun f() { this; }"), 1);
    }

    #[test]
    fn this_inside_a_method_compiles() {
        assert_eq!(error_count("class C { m() { return this; } }"), 0);
    }

    #[test]
    fn too_many_constants_in_one_chunk() {
        let mut source = String::new();
        for i in 0..257 {
            source.push_str(&format!("{i}.5;\n"));
        }
        assert!(error_count(&source) >= 1);
    }

    #[test]
    fn too_many_locals_in_one_function() {
        let mut source = String::from("{\n");
        for i in 0..256 {
            source.push_str(&format!("var l{i} = 0;\n"));
        }
        source.push('}');
        assert!(error_count(&source) >= 1);
    }

    #[test]
    fn jump_distance_is_capped() {
        // A then-branch bigger than 0xFFFF bytes cannot be patched.
        let mut source = String::from("if (true) {\n");
        for _ in 0..22000 {
            source.push_str("1;\n");
        }
        source.push('}');
        assert!(error_count(&source) >= 1);
    }

    #[test]
    fn multiple_errors_reported_after_synchronizing() {
        assert_eq!(error_count("var 1 = 2; var 3 = 4;"), 2);
    }

    #[test]
    fn statements_keep_compiling_after_an_error() {
        // The second statement is fine; only the first errors.
        assert_eq!(error_count("var = 1; print 2;"), 1);
    }
}
