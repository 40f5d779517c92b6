//! Single-pass Pratt compiler (`spec.md` §4.4). Scans and emits bytecode in
//! one pass, no AST in between. The C reference dispatches prefix/infix rules
//! through a `ParseFn` function-pointer table (`getRule`); matching that
//! shape in Rust means either trait objects or a method-pointer table, both
//! friction for no benefit here, so [`Parser::parse_prefix`] and
//! [`Parser::parse_infix`] are plain `match`es over [`TokenKind`] instead.
//! Likewise the reference's `Compiler` forms a singly linked list through
//! `enclosing`, recursed into for each nested function; here it's a
//! `Vec<FunctionCompiler>` stack on the `Parser`, indexed rather than
//! recursed through, which sidesteps a self-referential struct.

use dragon_core::{Chunk, Heap, ObjRef, OpCode, Value};

use crate::error::CompileError;
use crate::scanner::Scanner;
use crate::token::{Token, TokenKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment, // = (and in-place operators)
    Ternary,    // ?:
    Pipe,       // |>
    Or,         // ||
    And,        // &&
    BitOr,      // |
    BitXor,     // ^
    BitAnd,     // &
    Equality,   // == != is
    Comparison, // < > <= >= in instanceof
    Shift,      // << >> >>>
    Term,       // + -
    Factor,     // * / %
    Range,      // ..
    Unary,      // ! - ~ typeof
    Call,       // . () {} []
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        use Precedence::*;
        match self {
            None => Assignment,
            Assignment => Ternary,
            Ternary => Pipe,
            Pipe => Or,
            Or => And,
            And => BitOr,
            BitOr => BitXor,
            BitXor => BitAnd,
            BitAnd => Equality,
            Equality => Comparison,
            Comparison => Shift,
            Shift => Term,
            Term => Factor,
            Factor => Range,
            Range => Unary,
            Unary => Call,
            Call => Primary,
            Primary => Primary,
        }
    }
}

/// A 256-slot cap applies to both locals and upvalues, matching the byte
/// operand `GET_LOCAL`/`GET_UPVALUE` carry. Upvalues are additionally capped
/// one short of that (255) so `Function::upvalue_count: u8` can always
/// represent the final count without wrapping — the reference stores the
/// same count in a `uint8_t` field but only checks `== UINT8_COUNT` (256)
/// *before* incrementing, so a function with exactly 256 upvalues silently
/// wraps its own count to 0. Capping one lower avoids inheriting that.
const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 255;

struct Local<'src> {
    name: Token<'src>,
    /// -1 marks "declared but not yet initialized" — reading the name in
    /// this state is the classic `var x = x;` self-reference error.
    depth: i32,
    is_captured: bool,
}

#[derive(Clone, Copy)]
struct UpvalueDesc {
    index: u8,
    is_local: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Constructor,
}

struct FunctionCompiler<'src> {
    kind: FunctionKind,
    is_lambda: bool,
    is_varargs: bool,
    arity: u32,
    chunk: Chunk,
    name: Option<ObjRef>,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: i32,
    is_in_loop: bool,
    continue_jump: usize,
    break_jump: usize,
}

impl<'src> FunctionCompiler<'src> {
    fn new(kind: FunctionKind, name: Option<ObjRef>) -> Self {
        // Stack slot 0 is reserved for `this` in methods/constructors and
        // the top-level script (where it is never read); in a plain
        // function it gets an empty, unmatchable name so no real
        // identifier can ever resolve to it.
        let slot0 = if kind == FunctionKind::Function {
            Token::synthetic(TokenKind::Identifier, "", 0)
        } else {
            Token::synthetic(TokenKind::This, "this", 0)
        };
        FunctionCompiler {
            kind,
            is_lambda: false,
            is_varargs: false,
            arity: 0,
            chunk: Chunk::new(),
            name,
            locals: vec![Local {
                name: slot0,
                depth: 0,
                is_captured: false,
            }],
            upvalues: Vec::new(),
            scope_depth: 0,
            is_in_loop: false,
            continue_jump: 0,
            break_jump: 0,
        }
    }
}

pub struct Parser<'src, 'h> {
    scanner: Scanner<'src>,
    previous: Token<'src>,
    current: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<CompileError>,
    compilers: Vec<FunctionCompiler<'src>>,
    /// Depth counter rather than a value copied into each nested
    /// `FunctionCompiler` (as the reference's `currentClass` pointer is):
    /// `this`/`super` validity only changes at class boundaries, never at
    /// function boundaries, so a single counter on the parser observes
    /// exactly the same scoping the reference achieves by propagating a
    /// pointer down through `initCompiler`.
    class_depth: u32,
    heap: &'h mut Heap,
}

impl<'src, 'h> Parser<'src, 'h> {
    fn new(source: &'src str, heap: &'h mut Heap) -> Self {
        let dummy = Token::synthetic(TokenKind::Eof, "", 0);
        Parser {
            scanner: Scanner::new(source),
            previous: dummy,
            current: dummy,
            had_error: false,
            panic_mode: false,
            errors: Vec::new(),
            compilers: vec![FunctionCompiler::new(FunctionKind::Script, None)],
            class_depth: 0,
            heap,
        }
    }

    // ---- token stream -----------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.next_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            self.error(self.current.lexeme);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
            return;
        }
        self.error(message);
    }

    /// Every diagnostic in the reference compiler is reported at the
    /// *current* token (`error()` always forwards to `errorAt(parser,
    /// &parser->current, message)`), never at `previous` — somewhat
    /// surprising since most call sites read like "previous token was bad",
    /// but that's what the corpus does and a consume() failure's `current`
    /// is exactly the unexpected token anyway.
    fn error(&mut self, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        self.errors.push(CompileError {
            line: self.current.line,
            message: message.to_string(),
            cascaded: false,
        });
    }

    fn synchronize(&mut self) {
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                self.panic_mode = false;
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Function
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Return
                | TokenKind::Import
                | TokenKind::Export => {
                    self.panic_mode = false;
                    return;
                }
                _ => {}
            }
            self.advance();
        }
        self.panic_mode = false;
    }

    // ---- compiler stack / chunk plumbing -----------------------------

    fn current_fn(&self) -> &FunctionCompiler<'src> {
        self.compilers.last().unwrap()
    }

    fn current_fn_mut(&mut self) -> &mut FunctionCompiler<'src> {
        self.compilers.last_mut().unwrap()
    }

    fn current_chunk(&mut self) -> &mut Chunk {
        &mut self.current_fn_mut().chunk
    }

    fn line(&self) -> u32 {
        self.previous.line
    }

    fn emit_u8(&mut self, byte: u8) {
        let line = self.line();
        self.current_chunk().write_u8(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        let line = self.line();
        self.current_chunk().write_op(op, line);
    }

    fn emit_pair(&mut self, op: OpCode, byte: u8) {
        self.emit_op(op);
        self.emit_u8(byte);
    }

    fn emit_return(&mut self) {
        if self.current_fn().kind == FunctionKind::Constructor {
            self.emit_pair(OpCode::GetLocal, 0);
        } else {
            self.emit_op(OpCode::Null);
        }
        self.emit_op(OpCode::Return);
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        let line = self.line();
        let offset = self.current_chunk().current_offset();
        self.current_chunk().write_u16(0xffff, line);
        offset
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let current = self.current_chunk().current_offset();
        let offset = current - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        let line = self.line();
        self.current_chunk().write_u16(offset as u16, line);
    }

    fn patch_jump(&mut self, offset: usize) {
        let current = self.current_chunk().current_offset();
        let jump = current - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }
        self.current_chunk().patch_u16(offset, jump as u16);
    }

    fn make_constant(&mut self, value: Value) -> usize {
        self.current_chunk().add_constant(value)
    }

    fn encode_constant(&mut self, index: usize) {
        let line = self.line();
        self.current_chunk().write_uleb(index, line);
    }

    fn emit_constant(&mut self, value: Value) {
        self.emit_op(OpCode::Constant);
        let idx = self.make_constant(value);
        self.encode_constant(idx);
    }

    fn identifier_constant(&mut self, name: Token<'src>) -> usize {
        let r = self.heap.intern_copy(name.lexeme);
        self.make_constant(Value::Object(r))
    }

    fn synthetic_constant(&mut self, text: &str) -> usize {
        let r = self.heap.intern_copy(text);
        self.make_constant(Value::Object(r))
    }

    // ---- scope / locals / upvalues -----------------------------------

    fn begin_scope(&mut self) {
        self.current_fn_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.current_fn_mut().scope_depth -= 1;
        let depth = self.current_fn().scope_depth;
        loop {
            let pop = matches!(self.current_fn().locals.last(), Some(l) if l.depth > depth);
            if !pop {
                break;
            }
            if self.current_fn().locals.last().unwrap().is_captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
            self.current_fn_mut().locals.pop();
        }
    }

    fn add_local(&mut self, name: Token<'src>) {
        if self.current_fn().locals.len() == MAX_LOCALS {
            self.error("Too many local variables in scope.");
            return;
        }
        self.current_fn_mut().locals.push(Local {
            name,
            depth: -1,
            is_captured: false,
        });
    }

    fn resolve_local_at(&mut self, level: usize, name: &str) -> Option<u8> {
        let mut found: Option<(usize, bool)> = None;
        {
            let locals = &self.compilers[level].locals;
            for i in (0..locals.len()).rev() {
                if locals[i].name.lexeme == name {
                    found = Some((i, locals[i].depth == -1));
                    break;
                }
            }
        }
        match found {
            Some((idx, uninitialized)) => {
                if uninitialized {
                    self.error("Cannot read local variable within its own initializer.");
                }
                Some(idx as u8)
            }
            None => None,
        }
    }

    fn resolve_local(&mut self, name: &str) -> Option<u8> {
        let level = self.compilers.len() - 1;
        self.resolve_local_at(level, name)
    }

    fn add_upvalue(&mut self, level: usize, index: u8, is_local: bool) -> u8 {
        let existing = self.compilers[level]
            .upvalues
            .iter()
            .position(|uv| uv.index == index && uv.is_local == is_local);
        if let Some(i) = existing {
            return i as u8;
        }
        if self.compilers[level].upvalues.len() >= MAX_UPVALUES {
            self.error("Too many closure variables in function.");
            return 0;
        }
        self.compilers[level].upvalues.push(UpvalueDesc { index, is_local });
        (self.compilers[level].upvalues.len() - 1) as u8
    }

    fn resolve_upvalue_at(&mut self, level: usize, name: &str) -> Option<u8> {
        if level == 0 {
            return None;
        }
        let enclosing = level - 1;
        if let Some(local_idx) = self.resolve_local_at(enclosing, name) {
            self.compilers[enclosing].locals[local_idx as usize].is_captured = true;
            return Some(self.add_upvalue(level, local_idx, true));
        }
        if let Some(up_idx) = self.resolve_upvalue_at(enclosing, name) {
            return Some(self.add_upvalue(level, up_idx, false));
        }
        None
    }

    fn resolve_upvalue(&mut self, name: &str) -> Option<u8> {
        let level = self.compilers.len() - 1;
        self.resolve_upvalue_at(level, name)
    }

    fn mark_initialized(&mut self) {
        let fc = self.current_fn_mut();
        if fc.scope_depth == 0 {
            return;
        }
        let depth = fc.scope_depth;
        let last = fc.locals.len() - 1;
        fc.locals[last].depth = depth;
    }

    fn declare_variable(&mut self) {
        if self.current_fn().scope_depth == 0 {
            return;
        }
        let name = self.previous;
        let scope_depth = self.current_fn().scope_depth;
        let mut duplicate = false;
        for local in self.current_fn().locals.iter().rev() {
            if local.depth != -1 && local.depth < scope_depth {
                break;
            }
            if local.name.lexeme == name.lexeme {
                duplicate = true;
                break;
            }
        }
        if duplicate {
            self.error("Already a variable with this name in scope.");
        }
        self.add_local(name);
    }

    fn parse_variable(&mut self, message: &str) -> usize {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.current_fn().scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(self.previous)
    }

    fn define_variable(&mut self, global: usize) {
        if self.current_fn().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_op(OpCode::DefineGlobal);
        self.encode_constant(global);
    }

    // ---- function compiler push/pop -----------------------------------

    fn push_compiler(&mut self, kind: FunctionKind, name: Option<Token<'src>>) {
        let name_ref = match (kind, name) {
            (FunctionKind::Script, _) => None,
            (_, Some(tok)) => Some(self.heap.intern_copy(tok.lexeme)),
            (_, None) => None,
        };
        self.compilers.push(FunctionCompiler::new(kind, name_ref));
    }

    /// Mirrors `endCompiler`: unconditionally emits the implicit return
    /// (even along a path — lambda bare-expression bodies — that already
    /// emitted an explicit `OP_RETURN` of its own, leaving a harmless
    /// unreachable `NULL; RETURN` tail), builds the finished [`Function`]
    /// and hands back its heap ref plus the upvalue descriptors the
    /// *enclosing* compiler needs to emit after `OP_CLOSURE`.
    fn pop_compiler(&mut self) -> (ObjRef, Vec<UpvalueDesc>) {
        self.emit_return();
        let fc = self.compilers.pop().unwrap();
        let function = dragon_core::Function {
            arity: fc.arity.min(255) as u8,
            upvalue_count: fc.upvalues.len().min(255) as u8,
            chunk: fc.chunk,
            name: fc.name,
            is_lambda: fc.is_lambda,
            is_varargs: fc.is_varargs,
        };
        let oref = self.heap.alloc_function(function);
        (oref, fc.upvalues)
    }

    fn emit_closure(&mut self, oref: ObjRef, upvalues: Vec<UpvalueDesc>) {
        self.emit_op(OpCode::Closure);
        let idx = self.make_constant(Value::Object(oref));
        self.encode_constant(idx);
        for uv in upvalues {
            self.emit_u8(uv.is_local as u8);
            self.emit_u8(uv.index);
        }
    }

    // ---- in-place compound assignment ----------------------------------

    fn is_inplace_operator(&mut self) -> bool {
        use TokenKind::*;
        match self.current.kind {
            PlusEqual | MinusEqual | SlashEqual | StarEqual | PercentEqual | CaretEqual
            | AmpEqual | PipeEqual | LessLessEqual | GreaterGreaterEqual
            | GreaterGreaterGreaterEqual => {
                self.advance();
                true
            }
            _ => false,
        }
    }

    fn inplace_operator(&mut self, op: TokenKind) {
        use TokenKind::*;
        let op_code = match op {
            PlusEqual => OpCode::Add,
            MinusEqual => OpCode::Sub,
            SlashEqual => OpCode::Div,
            StarEqual => OpCode::Mul,
            PercentEqual => OpCode::Mod,
            CaretEqual => OpCode::BitXor,
            AmpEqual => OpCode::BitAnd,
            PipeEqual => OpCode::BitOr,
            GreaterGreaterEqual => OpCode::Ash,
            GreaterGreaterGreaterEqual => OpCode::Rsh,
            LessLessEqual => OpCode::Lsh,
            _ => return,
        };
        self.emit_op(op_code);
    }

    // ---- pattern (switch case condition) --------------------------------

    fn pattern(&mut self) {
        if self.match_token(TokenKind::In) {
            self.expression();
            self.emit_op(OpCode::In);
        } else if self.match_token(TokenKind::Is) {
            self.expression();
            self.emit_op(OpCode::Is);
        } else if self.match_token(TokenKind::PipeGreater) {
            self.expression();
            self.emit_op(OpCode::Swap);
            self.emit_pair(OpCode::Call, 1);
        } else if self.match_token(TokenKind::Else) {
            self.emit_op(OpCode::Pop);
            self.emit_op(OpCode::True);
        } else if self.match_token(TokenKind::Bang) {
            self.pattern();
            self.emit_op(OpCode::Not);
        } else {
            self.expression();
            self.emit_op(OpCode::Equal);
        }
    }

    // ---- functions, methods, lambdas ------------------------------------

    fn function_body(&mut self, kind: FunctionKind) {
        let name_tok = self.previous;
        self.push_compiler(kind, Some(name_tok));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expected '(' after function name.");
        let mut varargs = false;
        if !self.check(TokenKind::RightParen) {
            loop {
                if varargs {
                    self.error("Variadic parameter must be the last parameter in function definition.");
                }
                self.current_fn_mut().arity += 1;
                if self.current_fn().arity > 255 {
                    self.error("Functions may not exceed 255 parameters.");
                }
                let constant = self.parse_variable("Expected parameter name");
                self.define_variable(constant);
                if self.match_token(TokenKind::DotDotDot) {
                    varargs = true;
                }
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expected ')' after function parameters.");
        self.consume(TokenKind::LeftBrace, "Expected '{' before function body");
        self.current_fn_mut().is_varargs = varargs;
        self.block();

        let (oref, upvalues) = self.pop_compiler();
        self.emit_closure(oref, upvalues);
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expected method name.");
        let name = self.previous;
        let constant = self.identifier_constant(name);
        let kind = if name.lexeme == "constructor" {
            FunctionKind::Constructor
        } else {
            FunctionKind::Method
        };
        self.function_body(kind);
        self.emit_op(OpCode::Method);
        self.encode_constant(constant);
    }

    fn finish_lambda_body(&mut self) {
        if self.match_token(TokenKind::LeftBrace) {
            self.block();
        } else {
            self.expression();
            self.emit_op(OpCode::Return);
        }
        let (oref, upvalues) = self.pop_compiler();
        self.emit_closure(oref, upvalues);
    }

    /// `|a, b, rest...| expr` or `|a, b| { block }` — a nested function
    /// whose name is always `<lambda>`, arity relaxed the same as a named
    /// function (up to one trailing variadic parameter).
    fn lambda(&mut self, _can_assign: bool) {
        self.push_compiler(FunctionKind::Function, None);
        let name_ref = self.heap.intern_copy("<lambda>");
        self.current_fn_mut().name = Some(name_ref);
        self.current_fn_mut().is_lambda = true;
        self.begin_scope();

        let mut varargs = false;
        if !self.check(TokenKind::Pipe) {
            loop {
                if varargs {
                    self.error("Variadic parameter must be the last parameter in function definition.");
                }
                self.current_fn_mut().arity += 1;
                if self.current_fn().arity > 255 {
                    self.error("Functions may not exceed 255 parameters.");
                }
                let constant = self.parse_variable("Expected parameter name");
                self.define_variable(constant);
                if self.match_token(TokenKind::DotDotDot) {
                    varargs = true;
                }
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::Pipe, "Expected '|' after parameters.");
        self.current_fn_mut().is_varargs = varargs;
        self.finish_lambda_body();
    }

    /// `||expr|` / `|| { block }` — the `||` token is scanned as one piece,
    /// so an empty parameter list needs no separate closing-pipe consume.
    fn lambda_empty(&mut self, _can_assign: bool) {
        self.push_compiler(FunctionKind::Function, None);
        let name_ref = self.heap.intern_copy("<lambda>");
        self.current_fn_mut().name = Some(name_ref);
        self.current_fn_mut().is_lambda = true;
        self.begin_scope();
        self.finish_lambda_body();
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: u32 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if count == 255 {
                    self.error("Cannot pass more than 255 arguments.");
                }
                count += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expected ')' after arguments.");
        count.min(255) as u8
    }

    // ---- expressions: literals, variables, this/super -------------------

    fn number(&mut self, _can_assign: bool) {
        let value: f64 = self.previous.lexeme.parse().unwrap_or(f64::NAN);
        self.emit_constant(Value::Number(value));
    }

    /// Escapes are resolved here, once the full lexeme is in hand, rather
    /// than during scanning (`spec.md` §4.3): `\n \\ \r \t \b \f \' \"`.
    fn unescape(raw: &str) -> String {
        let inner = &raw[1..raw.len() - 1];
        let mut out = String::with_capacity(inner.len());
        let mut chars = inner.chars();
        while let Some(c) = chars.next() {
            if c == '\\' {
                match chars.next() {
                    Some('n') => out.push('\n'),
                    Some('\\') => out.push('\\'),
                    Some('r') => out.push('\r'),
                    Some('t') => out.push('\t'),
                    Some('b') => out.push('\u{8}'),
                    Some('f') => out.push('\u{c}'),
                    Some('\'') => out.push('\''),
                    Some('"') => out.push('"'),
                    Some(other) => {
                        out.push('\\');
                        out.push(other);
                    }
                    None => out.push('\\'),
                }
            } else {
                out.push(c);
            }
        }
        out
    }

    fn string_literal(&mut self, _can_assign: bool) {
        let out = Self::unescape(self.previous.lexeme);
        let r = self.heap.intern_take(out);
        self.emit_constant(Value::Object(r));
    }

    /// `import "path"` (`spec.md` §4.7): pushes the resolved module's
    /// `Import` instance. Usable anywhere an expression is, most commonly
    /// `var m = import "lib";`.
    fn import_expr(&mut self, _can_assign: bool) {
        self.consume(TokenKind::String, "Expected a module path string after 'import'.");
        let path = Self::unescape(self.previous.lexeme);
        self.emit_op(OpCode::Import);
        let r = self.heap.intern_take(path);
        let idx = self.make_constant(Value::Object(r));
        self.encode_constant(idx);
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::Null => self.emit_op(OpCode::Null),
            TokenKind::True => self.emit_op(OpCode::True),
            _ => {}
        }
    }

    fn named_variable(&mut self, name: Token<'src>, can_assign: bool) {
        enum Slot {
            Local(u8),
            Upvalue(u8),
            Global(usize),
        }
        let slot = if let Some(idx) = self.resolve_local(name.lexeme) {
            Slot::Local(idx)
        } else if let Some(idx) = self.resolve_upvalue(name.lexeme) {
            Slot::Upvalue(idx)
        } else {
            Slot::Global(self.identifier_constant(name))
        };

        let emit_get = |p: &mut Self| match slot {
            Slot::Local(i) => p.emit_pair(OpCode::GetLocal, i),
            Slot::Upvalue(i) => p.emit_pair(OpCode::GetUpvalue, i),
            Slot::Global(c) => {
                p.emit_op(OpCode::GetGlobal);
                p.encode_constant(c);
            }
        };
        let emit_set = |p: &mut Self| match slot {
            Slot::Local(i) => p.emit_pair(OpCode::SetLocal, i),
            Slot::Upvalue(i) => p.emit_pair(OpCode::SetUpvalue, i),
            Slot::Global(c) => {
                p.emit_op(OpCode::SetGlobal);
                p.encode_constant(c);
            }
        };

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            emit_set(self);
        } else if can_assign && self.is_inplace_operator() {
            let op = self.previous.kind;
            emit_get(self);
            self.expression();
            self.inplace_operator(op);
            emit_set(self);
        } else {
            emit_get(self);
        }
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous;
        self.named_variable(name, can_assign);
    }

    fn this_expr(&mut self, _can_assign: bool) {
        if self.class_depth == 0 {
            self.error("Use of 'this' is not permitted outside of a class.");
        }
        self.named_variable(self.previous, false);
    }

    fn super_expr(&mut self, _can_assign: bool) {
        if self.class_depth == 0 {
            self.error("Use of 'super' is not permitted outside of a class.");
        }
        self.consume(TokenKind::Dot, "Expected '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expected superclass method name.");
        let name = self.identifier_constant(self.previous);

        let this_tok = Token::synthetic(TokenKind::This, "this", self.previous.line);
        self.named_variable(this_tok, false);

        if self.match_token(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            let super_tok = Token::synthetic(TokenKind::Super, "super", self.previous.line);
            self.named_variable(super_tok, false);
            self.emit_op(OpCode::SuperInvoke);
            self.encode_constant(name);
            self.emit_u8(arg_count);
        } else {
            let super_tok = Token::synthetic(TokenKind::Super, "super", self.previous.line);
            self.named_variable(super_tok, false);
            self.emit_op(OpCode::GetSuper);
            self.encode_constant(name);
        }
    }

    // ---- object / list literals ------------------------------------------

    /// Parses the `key: value, ...` body of an object literal or an
    /// in-place field-update suffix (`SomeExpr { k: v }`), assuming the
    /// target object is already on the stack.
    fn object_body(&mut self, _can_assign: bool) {
        if self.current.kind != TokenKind::RightBrace {
            loop {
                self.consume(TokenKind::Identifier, "Expected identifier key for object key-value pair.");
                let identifier = self.previous;
                let name = self.identifier_constant(identifier);

                if self.match_token(TokenKind::Colon) {
                    self.expression();
                } else {
                    self.named_variable(identifier, false);
                }

                self.emit_op(OpCode::SetPropertyKv);
                self.encode_constant(name);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBrace, "Expected '}' after object body.");
    }

    fn object_creation(&mut self, can_assign: bool) {
        self.emit_op(OpCode::Object);
        self.emit_pair(OpCode::Call, 0);
        self.object_body(can_assign);
    }

    fn list_literal(&mut self, _can_assign: bool) {
        let mut count: u32 = 0;
        if !self.check(TokenKind::RightBracket) {
            loop {
                self.expression();
                if count == 255 {
                    self.error("Cannot initialize a list with more than 255 items.");
                }
                count += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBracket, "Expected ']' after list items.");
        self.emit_pair(OpCode::List, count.min(255) as u8);
    }

    // ---- calls, property/index access, operators -------------------------

    fn pipe_op(&mut self, _can_assign: bool) {
        self.parse_precedence(Precedence::Pipe.next());
        self.emit_op(OpCode::Swap);
        self.emit_pair(OpCode::Call, 1);
    }

    fn call(&mut self, _can_assign: bool) {
        let arg_count = self.argument_list();
        self.emit_pair(OpCode::Call, arg_count);
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expected property name after '.'.");
        let name = self.identifier_constant(self.previous);

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op(OpCode::SetProperty);
            self.encode_constant(name);
        } else if can_assign && self.is_inplace_operator() {
            let op = self.previous.kind;
            self.emit_op(OpCode::Dup);
            self.emit_op(OpCode::GetProperty);
            self.encode_constant(name);
            self.expression();
            self.inplace_operator(op);
            self.emit_op(OpCode::SetProperty);
            self.encode_constant(name);
        } else if self.match_token(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.emit_op(OpCode::Invoke);
            self.encode_constant(name);
            self.emit_u8(arg_count);
        } else {
            self.emit_op(OpCode::GetProperty);
            self.encode_constant(name);
        }
    }

    fn index(&mut self, can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightBracket, "Expected ']' after index");

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op(OpCode::SetIndex);
        } else if can_assign && self.is_inplace_operator() {
            let op = self.previous.kind;
            self.emit_op(OpCode::DupX2);
            self.emit_op(OpCode::GetIndex);
            self.expression();
            self.inplace_operator(op);
            self.emit_op(OpCode::SetIndex);
        } else {
            self.emit_op(OpCode::GetIndex);
        }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expected '(' after expression.");
    }

    fn unary(&mut self, _can_assign: bool) {
        let op = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match op {
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Bang => self.emit_op(OpCode::Not),
            TokenKind::Tilde => self.emit_op(OpCode::BitNot),
            TokenKind::Typeof => self.emit_op(OpCode::TypeOf),
            _ => {}
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let op = self.previous.kind;
        let rule_prec = Self::rule_precedence(op);
        self.parse_precedence(rule_prec.next());
        match op {
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Sub),
            TokenKind::Star => self.emit_op(OpCode::Mul),
            TokenKind::Slash => self.emit_op(OpCode::Div),
            TokenKind::Percent => self.emit_op(OpCode::Mod),
            TokenKind::Amp => self.emit_op(OpCode::BitAnd),
            TokenKind::Pipe => self.emit_op(OpCode::BitOr),
            TokenKind::Caret => self.emit_op(OpCode::BitXor),
            TokenKind::LessLess => self.emit_op(OpCode::Lsh),
            TokenKind::GreaterGreater => self.emit_op(OpCode::Ash),
            TokenKind::GreaterGreaterGreater => self.emit_op(OpCode::Rsh),
            TokenKind::BangEqual => self.emit_op(OpCode::NotEqual),
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => self.emit_op(OpCode::GreaterEq),
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => self.emit_op(OpCode::LessEq),
            TokenKind::Is => self.emit_op(OpCode::Is),
            TokenKind::In => self.emit_op(OpCode::In),
            TokenKind::Instanceof => self.emit_op(OpCode::InstanceOf),
            TokenKind::DotDot => self.emit_op(OpCode::Range),
            _ => {}
        }
    }

    fn and_(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalseSc);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalseSc);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn ternary(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.parse_precedence(Precedence::Ternary);
        let true_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        if self.match_token(TokenKind::Colon) {
            self.parse_precedence(Precedence::Ternary);
        } else {
            self.emit_op(OpCode::Null);
        }
        self.patch_jump(true_jump);
    }

    // ---- switch (both expression and statement form) ----------------------

    fn switch_common(&mut self, as_expression: bool) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expected '(' after switch.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expected ')' after switch clause.");
        self.consume(TokenKind::LeftBrace, "Expected '{' before switch body.");

        let break_skip_jump = self.emit_jump(OpCode::Jump);
        let break_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(break_skip_jump);

        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.emit_op(OpCode::Dup);
            self.pattern();

            while self.match_token(TokenKind::Comma) {
                let false_jump = self.emit_jump(OpCode::JumpIfFalse);
                let true_jump = self.emit_jump(OpCode::Jump);
                self.patch_jump(false_jump);
                self.emit_op(OpCode::Dup);
                self.pattern();
                self.patch_jump(true_jump);
            }

            let jump = self.emit_jump(OpCode::JumpIfFalse);
            self.consume(TokenKind::Arrow, "Expected '->' after case condition.");

            if as_expression {
                self.expression();
                self.consume(TokenKind::Semicolon, "Expected ';' after case expression.");
            } else {
                self.statement();
            }

            self.emit_loop(break_jump - 1);
            self.patch_jump(jump);
        }

        if as_expression {
            self.emit_op(OpCode::Null);
        }
        self.patch_jump(break_jump);
        if as_expression {
            self.emit_op(OpCode::Swap);
        }
        self.emit_op(OpCode::Pop);

        self.consume(TokenKind::RightBrace, "Expected '}' after switch body.");
        self.end_scope();
    }

    fn switch_expression(&mut self, _can_assign: bool) {
        self.switch_common(true);
    }

    fn switch_statement(&mut self) {
        self.switch_common(false);
    }

    // ---- statements --------------------------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expected ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expected '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expected ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.statement();

        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);

        if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn return_statement(&mut self) {
        if self.current_fn().kind == FunctionKind::Script {
            self.error("Cannot return from top-level of program.");
        }
        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.current_fn().kind == FunctionKind::Constructor {
                self.error("Cannot return a value from a constructor.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expected ';' after return value");
            self.emit_op(OpCode::Return);
        }
    }

    fn while_statement(&mut self) {
        let was_in_loop = self.current_fn().is_in_loop;
        let prev_continue = self.current_fn().continue_jump;
        let prev_break = self.current_fn().break_jump;
        self.current_fn_mut().is_in_loop = true;

        let loop_start = self.current_chunk().current_offset();
        self.current_fn_mut().continue_jump = loop_start;

        self.consume(TokenKind::LeftParen, "Expected '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expected ')' after condition");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.current_fn_mut().break_jump = exit_jump;
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);

        self.current_fn_mut().is_in_loop = was_in_loop;
        self.current_fn_mut().continue_jump = prev_continue;
        self.current_fn_mut().break_jump = prev_break;
    }

    fn for_statement(&mut self) {
        let was_in_loop = self.current_fn().is_in_loop;
        let prev_continue = self.current_fn().continue_jump;
        let prev_break = self.current_fn().break_jump;
        self.current_fn_mut().is_in_loop = true;

        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expected '(' after 'for'.");
        if self.match_token(TokenKind::Semicolon) {
            // No initializer clause.
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_chunk().current_offset();
        let mut exit_jump: Option<usize> = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expected ';' after condition");
            let j = self.emit_jump(OpCode::JumpIfFalse);
            exit_jump = Some(j);
            self.current_fn_mut().break_jump = j;
        } else {
            self.emit_op(OpCode::True);
            let j = self.emit_jump(OpCode::JumpIfFalse);
            exit_jump = Some(j);
            self.current_fn_mut().break_jump = j;
        }

        if !self.match_token(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.current_chunk().current_offset();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expected ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }
        self.current_fn_mut().continue_jump = loop_start;

        self.statement();
        self.emit_loop(loop_start);

        if let Some(j) = exit_jump {
            self.patch_jump(j);
        }
        self.end_scope();

        self.current_fn_mut().is_in_loop = was_in_loop;
        self.current_fn_mut().continue_jump = prev_continue;
        self.current_fn_mut().break_jump = prev_break;
    }

    /// Desugars to `expr.iterator()` then a `more()`/`next()` loop, matching
    /// `spec.md` §4.4's iterator protocol (`iterator`/`more`/`next`).
    fn foreach_statement(&mut self) {
        let was_in_loop = self.current_fn().is_in_loop;
        let prev_continue = self.current_fn().continue_jump;
        let prev_break = self.current_fn().break_jump;

        self.begin_scope();
        self.current_fn_mut().is_in_loop = true;

        self.consume(TokenKind::LeftParen, "Expected '(' after 'foreach'.");
        self.consume(TokenKind::Var, "Expected 'var' in foreach clause.");

        let var_idx = self.parse_variable("Expected variable name.");
        let item_token = self.previous;
        self.define_variable(var_idx);

        self.emit_op(OpCode::Null);
        let local = self.resolve_local(item_token.lexeme).expect("just declared");
        self.emit_pair(OpCode::SetLocal, local);
        self.current_fn_mut().locals[local as usize].depth = -1;

        self.consume(TokenKind::In, "Expected 'in' after variable in foreach clause.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expected ')' after foreach clause.");
        self.define_variable(var_idx);

        let iterator_name = self.synthetic_constant("iterator");
        self.emit_op(OpCode::Invoke);
        self.encode_constant(iterator_name);
        self.emit_u8(0);

        let loop_start = self.current_chunk().current_offset();
        self.current_fn_mut().continue_jump = loop_start;

        self.emit_op(OpCode::Dup);
        let more_name = self.synthetic_constant("more");
        self.emit_op(OpCode::Invoke);
        self.encode_constant(more_name);
        self.emit_u8(0);

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.current_fn_mut().break_jump = exit_jump;

        self.emit_op(OpCode::Dup);
        let next_name = self.synthetic_constant("next");
        self.emit_op(OpCode::Invoke);
        self.encode_constant(next_name);
        self.emit_u8(0);

        let local = self.resolve_local(item_token.lexeme).expect("still in scope");
        self.emit_pair(OpCode::SetLocal, local);
        self.emit_op(OpCode::Pop);

        self.statement();

        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);

        self.end_scope();

        self.current_fn_mut().is_in_loop = was_in_loop;
        self.current_fn_mut().continue_jump = prev_continue;
        self.current_fn_mut().break_jump = prev_break;
    }

    fn throw_statement(&mut self) {
        if matches!(self.current_fn().kind, FunctionKind::Script | FunctionKind::Constructor) {
            self.error("Cannot use 'throw' in current scope.");
        }
        self.expression();
        self.emit_op(OpCode::Throw);
        self.consume(TokenKind::Semicolon, "Expected ';' after throw statement.");
    }

    fn try_statement(&mut self) {
        self.emit_op(OpCode::TryBegin);
        let catch_location = self.current_chunk().current_offset();
        let line = self.line();
        self.current_chunk().write_u16(0xffff, line);

        self.statement();
        self.emit_op(OpCode::TryEnd);

        let try_finally_jump = self.emit_jump(OpCode::Jump);

        if !self.match_token(TokenKind::Catch) {
            self.error("Expected 'catch' block after try.");
        }
        self.patch_jump(catch_location);

        self.begin_scope();
        if self.match_token(TokenKind::LeftParen) {
            let variable = self.parse_variable("Expected variable name to bind exception to.");
            self.consume(TokenKind::RightParen, "Expected ')' after catch clause.");
            self.define_variable(variable);
        } else {
            self.emit_op(OpCode::Pop);
        }
        self.statement();
        self.end_scope();

        self.patch_jump(try_finally_jump);

        if self.match_token(TokenKind::Finally) {
            self.statement();
        }
    }

    /// `export NAME = EXPR;` (`spec.md` §4.7): binds `NAME` as a normal
    /// global in the current module and additionally records it in the
    /// module's export table, so an importer sees it on the `Import`
    /// instance it gets back.
    fn export_statement(&mut self) {
        self.consume(TokenKind::Identifier, "Expected identifier after 'export'.");
        let name_constant = self.identifier_constant(self.previous);
        self.consume(TokenKind::Equal, "Expected '=' after export name.");
        self.expression();
        self.consume(TokenKind::Semicolon, "Expected ';' after export statement.");
        self.emit_op(OpCode::Export);
        self.encode_constant(name_constant);
    }

    fn continue_statement(&mut self) {
        if !self.current_fn().is_in_loop {
            self.error("Use of 'continue' is not permitted outside of a loop.");
        }
        let target = self.current_fn().continue_jump;
        self.emit_loop(target);
        self.consume(TokenKind::Semicolon, "Expected ';' after continue.");
    }

    fn break_statement(&mut self) {
        if !self.current_fn().is_in_loop {
            self.error("Use of 'break' is not permitted outside of a loop.");
        }
        self.emit_op(OpCode::False);
        let target = self.current_fn().break_jump;
        self.emit_loop(target - 1);
        self.consume(TokenKind::Semicolon, "Expected ';' after break.");
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expected '}' after block.");
    }

    fn statement(&mut self) {
        if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::Foreach) {
            self.foreach_statement();
        } else if self.match_token(TokenKind::Throw) {
            self.throw_statement();
        } else if self.match_token(TokenKind::Try) {
            self.try_statement();
        } else if self.match_token(TokenKind::Switch) {
            self.switch_statement();
        } else if self.match_token(TokenKind::Continue) {
            self.continue_statement();
        } else if self.match_token(TokenKind::Break) {
            self.break_statement();
        } else if self.match_token(TokenKind::Export) {
            self.export_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expected variable name.");
        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Null);
        }
        self.consume(TokenKind::Semicolon, "Expected ';' after variable declaration.");
        self.define_variable(global);
    }

    fn function_declaration(&mut self) {
        let global = self.parse_variable("Expected function name");
        self.mark_initialized();
        self.function_body(FunctionKind::Function);
        self.define_variable(global);
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expected class name.");
        let class_name = self.previous;
        let name_constant = self.identifier_constant(class_name);
        self.declare_variable();

        self.emit_op(OpCode::Class);
        self.encode_constant(name_constant);
        self.define_variable(name_constant);

        self.class_depth += 1;

        if self.match_token(TokenKind::Colon) {
            self.consume(TokenKind::Identifier, "Expected superclass name.");
            self.named_variable(self.previous, false);
            if self.previous.lexeme == class_name.lexeme {
                self.error("A class cannot inherit from itself.");
            }
        } else {
            self.emit_op(OpCode::Object);
        }

        self.begin_scope();
        self.add_local(Token::synthetic(TokenKind::Super, "super", class_name.line));
        self.define_variable(0);

        self.named_variable(class_name, false);
        self.emit_op(OpCode::Inherit);

        self.named_variable(class_name, false);
        self.consume(TokenKind::LeftBrace, "Expected '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expected '}' after class body");
        self.emit_op(OpCode::Pop);

        self.end_scope();
        self.class_depth -= 1;
    }

    fn declaration(&mut self) {
        if self.match_token(TokenKind::Class) {
            self.class_declaration();
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else if self.match_token(TokenKind::Function) {
            self.function_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    // ---- Pratt dispatch table --------------------------------------------

    fn has_prefix(kind: TokenKind) -> bool {
        use TokenKind::*;
        matches!(
            kind,
            LeftParen
                | LeftBrace
                | LeftBracket
                | Minus
                | Bang
                | Tilde
                | Pipe
                | PipePipe
                | Identifier
                | String
                | Number
                | False
                | Null
                | True
                | This
                | Super
                | Switch
                | Typeof
                | Import
        )
    }

    fn rule_precedence(kind: TokenKind) -> Precedence {
        use Precedence::*;
        use TokenKind::*;
        match kind {
            LeftParen | LeftBrace | LeftBracket | Dot => Call,
            DotDot => Range,
            Minus | Plus => Term,
            Slash | Star | Percent => Factor,
            BangEqual | EqualEqual | Is => Equality,
            Greater | GreaterEqual | Less | LessEqual | In | Instanceof => Comparison,
            Amp => BitAnd,
            Pipe => BitOr,
            Caret => BitXor,
            LessLess | GreaterGreater | GreaterGreaterGreater => Shift,
            PipeGreater => Precedence::Pipe,
            Question => Ternary,
            AmpAmp => And,
            PipePipe => Or,
            _ => None,
        }
    }

    fn parse_prefix(&mut self, kind: TokenKind, can_assign: bool) {
        use TokenKind::*;
        match kind {
            LeftParen => self.grouping(can_assign),
            LeftBrace => self.object_creation(can_assign),
            LeftBracket => self.list_literal(can_assign),
            Minus | Bang | Tilde | Typeof => self.unary(can_assign),
            Pipe => self.lambda(can_assign),
            PipePipe => self.lambda_empty(can_assign),
            Identifier => self.variable(can_assign),
            String => self.string_literal(can_assign),
            Number => self.number(can_assign),
            False | Null | True => self.literal(can_assign),
            This => self.this_expr(can_assign),
            Super => self.super_expr(can_assign),
            Switch => self.switch_expression(can_assign),
            Import => self.import_expr(can_assign),
            _ => {}
        }
    }

    fn parse_infix(&mut self, kind: TokenKind, can_assign: bool) {
        use TokenKind::*;
        match kind {
            LeftParen => self.call(can_assign),
            LeftBrace => self.object_body(can_assign),
            LeftBracket => self.index(can_assign),
            Dot => self.dot(can_assign),
            DotDot | Minus | Plus | Slash | Star | Percent | BangEqual | EqualEqual | Greater
            | GreaterEqual | Less | LessEqual | Amp | Pipe | Caret | LessLess | GreaterGreater
            | GreaterGreaterGreater | Is | In | Instanceof => self.binary(can_assign),
            PipeGreater => self.pipe_op(can_assign),
            Question => self.ternary(can_assign),
            AmpAmp => self.and_(can_assign),
            PipePipe => self.or_(can_assign),
            _ => {}
        }
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let prev_kind = self.previous.kind;
        if !Self::has_prefix(prev_kind) {
            self.error("Expected expression.");
            return;
        }
        let can_assign = precedence <= Precedence::Assignment;
        self.parse_prefix(prev_kind, can_assign);

        while precedence <= Self::rule_precedence(self.current.kind) {
            self.advance();
            let prev_kind = self.previous.kind;
            self.parse_infix(prev_kind, can_assign);
        }

        if can_assign && (self.match_token(TokenKind::Equal) || self.is_inplace_operator()) {
            self.error("Invalid assignment target.");
        }
    }
}

/// Compiles a complete source file into a top-level script [`Function`],
/// returning every diagnostic collected (not just the first) on failure.
/// GC is suspended for the call's duration: the compiler builds each nested
/// `Function`'s `Chunk` locally and only hands it to the heap at the end of
/// that function's compilation (`Parser::pop_compiler`), so partially-built
/// functions are never live heap objects a collection could need to trace —
/// there is nothing for `dragon-vm`'s root-marking closure to find here,
/// unlike the reference compiler which allocates `ObjFunction` up front and
/// relies on `markCompilerRoots` walking the live `Compiler` chain.
pub fn compile(source: &str, heap: &mut Heap) -> Result<ObjRef, Vec<CompileError>> {
    heap.set_gc_enabled(false);
    let result = compile_inner(source, heap);
    heap.set_gc_enabled(true);
    result
}

fn compile_inner(source: &str, heap: &mut Heap) -> Result<ObjRef, Vec<CompileError>> {
    let mut parser = Parser::new(source, heap);
    parser.advance();
    while !parser.match_token(TokenKind::Eof) {
        parser.declaration();
    }
    let (oref, _upvalues) = parser.pop_compiler();
    if parser.had_error {
        Err(parser.errors)
    } else {
        Ok(oref)
    }
}
