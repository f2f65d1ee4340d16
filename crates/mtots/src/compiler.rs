//! Single-pass compiler: token stream in, bytecode chunk out.
//!
//! A Pratt parser drives code generation directly; there is no AST. Each
//! function body gets its own [`FnCompiler`] frame tracking locals, upvalue
//! captures, scope depth, and staged default arguments; frames stack up as
//! nested `def`s are entered and pop as each function's thunk is finished.
//!
//! Compilation allocates strings and thunks against the heap directly. The
//! collector only runs at the VM's allocation gate, so nothing compiled here
//! needs to be rooted mid-compile.

use crate::bytecode::{Chunk, Op};
use crate::error::{Error, Result};
use crate::heap::Heap;
use crate::map::Map;
use crate::object::{Obj, ObjThunk, UpvalueDesc};
use crate::ops;
use crate::scanner::{Scanner, Token, TokenType};
use crate::value::{ObjId, StrId, Value};

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;
const MAX_ELIF_CHAIN_COUNT: usize = 64;
const UNINITIALIZED: i32 = -1;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment,
    If,
    Or,
    And,
    Not,
    Comparison,
    Shift,
    BitwiseAnd,
    BitwiseXor,
    BitwiseOr,
    Term,
    Factor,
    Unary,
    Call,
    Primary,
}

impl Precedence {
    fn one_higher(self) -> Precedence {
        use Precedence::*;
        match self {
            None => Assignment,
            Assignment => If,
            If => Or,
            Or => And,
            And => Not,
            Not => Comparison,
            Comparison => Shift,
            Shift => BitwiseAnd,
            BitwiseAnd => BitwiseXor,
            BitwiseXor => BitwiseOr,
            BitwiseOr => Term,
            Term => Factor,
            Factor => Unary,
            Unary => Call,
            Call => Primary,
            Primary => Primary,
        }
    }
}

type ParseFn<'src, 'h> = fn(&mut Compiler<'src, 'h>, bool);

struct ParseRule<'src, 'h> {
    prefix: Option<ParseFn<'src, 'h>>,
    infix: Option<ParseFn<'src, 'h>>,
    precedence: Precedence,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum FunctionType {
    Function,
    Initializer,
    Method,
    Script,
}

struct Local<'src> {
    name: &'src str,
    depth: i32,
    is_captured: bool,
}

/// Per-function compilation state.
struct FnCompiler<'src> {
    ty: FunctionType,
    chunk: Chunk,
    name: Option<StrId>,
    arity: u8,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: i32,
    /// Compile-time constant defaults for the trailing parameters.
    default_args: Vec<Value>,
}

impl<'src> FnCompiler<'src> {
    fn new(ty: FunctionType, name: Option<StrId>) -> FnCompiler<'src> {
        let slot_zero = Local {
            // Slot 0 holds the receiver; functions cannot name it.
            name: if ty == FunctionType::Function { "" } else { "this" },
            depth: 0,
            is_captured: false,
        };
        FnCompiler {
            ty,
            chunk: Chunk::new(),
            name,
            arity: 0,
            locals: vec![slot_zero],
            upvalues: Vec::new(),
            scope_depth: 0,
            default_args: Vec::new(),
        }
    }
}

struct ClassInfo {
    has_superclass: bool,
}

pub struct Compiler<'src, 'h> {
    heap: &'h mut Heap,
    scanner: Scanner<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    fns: Vec<FnCompiler<'src>>,
    classes: Vec<ClassInfo>,
    module_name: StrId,
    diagnostics: Vec<String>,
}

/// Compile `source` into a script thunk bound to `module_name`.
pub fn compile(heap: &mut Heap, source: &str, module_name: StrId) -> Result<ObjId> {
    let mut compiler = Compiler::new(heap, source, module_name);
    compiler.advance();
    while !compiler.consume(TokenType::Eof) {
        compiler.declaration();
    }
    let thunk = compiler.end_fn();
    if compiler.had_error {
        Err(Error::Compile(compiler.diagnostics.join("\n")))
    } else {
        Ok(thunk)
    }
}

impl<'src, 'h> Compiler<'src, 'h> {
    fn new(heap: &'h mut Heap, source: &'src str, module_name: StrId) -> Compiler<'src, 'h> {
        let placeholder = Token {
            ty: TokenType::Eof,
            text: "",
            line: 1,
        };
        Compiler {
            heap,
            scanner: Scanner::new(source),
            current: placeholder,
            previous: placeholder,
            had_error: false,
            panic_mode: false,
            fns: vec![FnCompiler::new(FunctionType::Script, None)],
            classes: Vec::new(),
            module_name,
            diagnostics: Vec::new(),
        }
    }

    // -- Diagnostics --------------------------------------------------------

    fn error_at(&mut self, at_current: bool, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        let token = if at_current { &self.current } else { &self.previous };
        let location = match token.ty {
            TokenType::Eof => " at end".to_string(),
            TokenType::Error => String::new(),
            _ => format!(" at '{}'", token.text),
        };
        let diagnostic = format!("[line {}] Error{}: {}", token.line, location, message);
        eprintln!("{diagnostic}");
        self.diagnostics.push(diagnostic);
    }

    fn error(&mut self, message: &str) {
        self.error_at(false, message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(true, message);
    }

    // -- Token plumbing -----------------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if self.current.ty != TokenType::Error {
                break;
            }
            let message = self.current.text.to_string();
            self.error_at_current(&message);
        }
    }

    fn expect(&mut self, ty: TokenType, message: &str) {
        if self.current.ty == ty {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    fn check(&self, ty: TokenType) -> bool {
        self.current.ty == ty
    }

    fn consume(&mut self, ty: TokenType) -> bool {
        if !self.check(ty) {
            return false;
        }
        self.advance();
        true
    }

    fn consume_statement_delimiter(&mut self, message: &str) {
        if !self.consume(TokenType::Newline) {
            self.expect(TokenType::Semicolon, message);
        }
    }

    // -- Emission -----------------------------------------------------------

    fn fn_mut(&mut self) -> &mut FnCompiler<'src> {
        self.fns.last_mut().expect("compiler frame stack is never empty")
    }

    fn fn_ref(&self) -> &FnCompiler<'src> {
        self.fns.last().expect("compiler frame stack is never empty")
    }

    fn emit(&mut self, op: Op) {
        let line = self.previous.line;
        self.fn_mut().chunk.write(op, line);
    }

    fn current_offset(&self) -> u32 {
        self.fn_ref().chunk.code.len() as u32
    }

    /// Emit a jump with a placeholder target; returns its index for patching.
    fn emit_jump(&mut self, make_op: fn(u32) -> Op) -> usize {
        self.emit(make_op(u32::MAX));
        self.fn_ref().chunk.code.len() - 1
    }

    fn patch_jump(&mut self, index: usize) {
        let target = self.current_offset();
        match &mut self.fn_mut().chunk.code[index] {
            Op::Jump(t)
            | Op::JumpIfFalse(t)
            | Op::JumpIfStopIteration(t)
            | Op::TryStart(t)
            | Op::TryEnd(t) => *t = target,
            op => panic!("cannot patch non-jump instruction {op:?}"),
        }
    }

    fn emit_loop(&mut self, loop_start: u32) {
        self.emit(Op::Loop(loop_start));
    }

    fn emit_return(&mut self) {
        if self.fn_ref().ty == FunctionType::Initializer {
            self.emit(Op::GetLocal(0));
        } else {
            self.emit(Op::Nil);
        }
        self.emit(Op::Return);
    }

    fn make_constant(&mut self, value: Value) -> u16 {
        if self.fn_ref().chunk.constants.len() > u16::MAX as usize {
            self.error("Too many constants in one chunk");
            return 0;
        }
        self.fn_mut().chunk.add_constant(value)
    }

    fn emit_constant(&mut self, value: Value) {
        let index = self.make_constant(value);
        self.emit(Op::Constant(index));
    }

    fn identifier_constant(&mut self, text: &str) -> u16 {
        let id = self.heap.intern(text);
        self.make_constant(Value::Str(id))
    }

    // -- Scopes and variables -----------------------------------------------

    fn begin_scope(&mut self) {
        self.fn_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.fn_mut().scope_depth -= 1;
        loop {
            let doomed = {
                let f = self.fn_ref();
                match f.locals.last() {
                    Some(local) if local.depth > f.scope_depth => Some(local.is_captured),
                    _ => None,
                }
            };
            let Some(captured) = doomed else { break };
            if captured {
                self.emit(Op::CloseUpvalue);
            } else {
                self.emit(Op::Pop);
            }
            self.fn_mut().locals.pop();
        }
    }

    fn add_local(&mut self, name: &'src str) {
        if self.fn_ref().locals.len() == MAX_LOCALS {
            self.error("Too many local variables in function");
            return;
        }
        self.fn_mut().locals.push(Local {
            name,
            depth: UNINITIALIZED,
            is_captured: false,
        });
    }

    /// Record the existence of the variable named by the previous token.
    fn declare_variable(&mut self) {
        if self.fn_ref().scope_depth == 0 {
            return;
        }
        let name = self.previous.text;
        let mut clash = false;
        {
            let f = self.fn_ref();
            for local in f.locals.iter().rev() {
                if local.depth != UNINITIALIZED && local.depth < f.scope_depth {
                    break;
                }
                if local.name == name {
                    clash = true;
                    break;
                }
            }
        }
        if clash {
            self.error("Already a variable with this name in this scope");
        }
        self.add_local(name);
    }

    fn parse_variable(&mut self, message: &str) -> u16 {
        self.expect(TokenType::Identifier, message);
        self.declare_variable();
        if self.fn_ref().scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(self.previous.text)
    }

    fn mark_initialized(&mut self) {
        let f = self.fn_mut();
        if f.scope_depth == 0 {
            return;
        }
        let depth = f.scope_depth;
        if let Some(local) = f.locals.last_mut() {
            local.depth = depth;
        }
    }

    /// Bind the value at TOS to the variable declared last.
    fn define_variable(&mut self, global: u16) {
        if self.fn_ref().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit(Op::DefineGlobal(global));
    }

    fn resolve_local(&mut self, fn_index: usize, name: &str) -> Option<usize> {
        let mut uninitialized = false;
        let mut found = None;
        for (i, local) in self.fns[fn_index].locals.iter().enumerate().rev() {
            if local.name == name {
                if local.depth == UNINITIALIZED {
                    uninitialized = true;
                }
                found = Some(i);
                break;
            }
        }
        if uninitialized {
            self.error("Can't read local variable in its own initializer");
        }
        found
    }

    fn add_upvalue(&mut self, fn_index: usize, desc: UpvalueDesc) -> u8 {
        for (i, existing) in self.fns[fn_index].upvalues.iter().enumerate() {
            if *existing == desc {
                return i as u8;
            }
        }
        if self.fns[fn_index].upvalues.len() == MAX_UPVALUES {
            self.error("Too many closure variables in function");
            return 0;
        }
        self.fns[fn_index].upvalues.push(desc);
        (self.fns[fn_index].upvalues.len() - 1) as u8
    }

    /// Resolve `name` as a capture, walking outward through every enclosing
    /// function and threading an upvalue slot through each one between.
    fn resolve_upvalue(&mut self, fn_index: usize, name: &str) -> Option<u8> {
        if fn_index == 0 {
            return None;
        }
        if let Some(local) = self.resolve_local(fn_index - 1, name) {
            self.fns[fn_index - 1].locals[local].is_captured = true;
            return Some(self.add_upvalue(
                fn_index,
                UpvalueDesc {
                    is_local: true,
                    index: local as u8,
                },
            ));
        }
        if let Some(upvalue) = self.resolve_upvalue(fn_index - 1, name) {
            return Some(self.add_upvalue(
                fn_index,
                UpvalueDesc {
                    is_local: false,
                    index: upvalue,
                },
            ));
        }
        None
    }

    fn named_variable(&mut self, name: &'src str, can_assign: bool) {
        let top = self.fns.len() - 1;
        let (get_op, set_op) = if let Some(slot) = self.resolve_local(top, name) {
            (Op::GetLocal(slot as u8), Op::SetLocal(slot as u8))
        } else if let Some(slot) = self.resolve_upvalue(top, name) {
            (Op::GetUpvalue(slot), Op::SetUpvalue(slot))
        } else {
            let constant = self.identifier_constant(name);
            (Op::GetGlobal(constant), Op::SetGlobal(constant))
        };
        if can_assign && self.consume(TokenType::Equal) {
            self.expression();
            self.emit(set_op);
        } else {
            self.emit(get_op);
        }
    }

    // -- Function bodies ----------------------------------------------------

    fn end_fn(&mut self) -> ObjId {
        self.emit_return();
        let f = self.fns.pop().expect("compiler frame stack is never empty");
        self.heap.allocate(Obj::Thunk(ObjThunk {
            arity: f.arity,
            chunk: f.chunk,
            name: f.name,
            module_name: Some(self.module_name),
            default_args: f.default_args,
            upvalues: f.upvalues,
        }))
    }

    /// Parse a default argument: compile-time constants only.
    fn default_argument(&mut self) -> Value {
        if self.consume(TokenType::Nil) {
            Value::Nil
        } else if self.consume(TokenType::True) {
            Value::Bool(true)
        } else if self.consume(TokenType::False) {
            Value::Bool(false)
        } else if self.consume(TokenType::Number) {
            Value::Number(self.previous.text.parse().unwrap_or(0.0))
        } else if self.consume(TokenType::Str) {
            match self.string_literal_value() {
                Some(id) => Value::Str(id),
                None => Value::Nil,
            }
        } else {
            self.error("Expected default argument expression");
            Value::Nil
        }
    }

    /// Compile a parameter list and body; emits the closure instruction.
    fn function(&mut self, ty: FunctionType) {
        let name = self.heap.intern(self.previous.text);
        self.fns.push(FnCompiler::new(ty, Some(name)));
        self.begin_scope();

        self.expect(TokenType::LeftParen, "Expect '(' after function name");
        if !self.check(TokenType::RightParen) {
            loop {
                if self.fn_ref().arity == u8::MAX {
                    self.error_at_current("Can't have more than 255 parameters");
                }
                let arity = self.fn_ref().arity.saturating_add(1);
                self.fn_mut().arity = arity;
                let constant = self.parse_variable("Expect parameter name");
                self.define_variable(constant);
                if self.check(TokenType::Identifier) {
                    self.type_expression();
                }
                if !self.fn_ref().default_args.is_empty() && !self.check(TokenType::Equal) {
                    self.error("non-optional argument may not follow an optional argument");
                }
                if self.consume(TokenType::Equal) {
                    let default = self.default_argument();
                    self.fn_mut().default_args.push(default);
                }
                if !self.consume(TokenType::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenType::RightParen, "Expect ')' after parameters");

        if self.check(TokenType::Identifier) {
            self.type_expression();
        }

        self.expect(TokenType::Colon, "Expect ':' before function body");
        while self.consume(TokenType::Newline) {}
        self.block(false);

        let thunk = self.end_fn();
        let constant = self.make_constant(Value::Obj(thunk));
        self.emit(Op::Closure(constant));
    }

    // -- Expressions --------------------------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        let can_assign = precedence <= Precedence::Assignment;
        self.advance();
        let Some(prefix) = rule(self.previous.ty).prefix else {
            self.error("Expected expression");
            return;
        };
        prefix(self, can_assign);

        while precedence <= rule(self.current.ty).precedence {
            self.advance();
            if let Some(infix) = rule(self.previous.ty).infix {
                infix(self, can_assign);
            }
        }
    }

    /// A parenthesized expression, or a tuple display when a comma (or an
    /// immediate `)`) follows.
    fn grouping(&mut self, _can_assign: bool) {
        if self.consume(TokenType::RightParen) {
            self.emit(Op::NewTuple(0));
            return;
        }
        self.expression();
        if self.check(TokenType::Comma) {
            let mut length: usize = 1;
            while self.consume(TokenType::Comma) {
                if self.check(TokenType::RightParen) {
                    break;
                }
                self.expression();
                length += 1;
            }
            if length > u8::MAX as usize {
                self.error("Number of items in a tuple display cannot exceed 255");
                return;
            }
            self.expect(TokenType::RightParen, "Expected ')' after tuple display");
            self.emit(Op::NewTuple(length as u8));
            return;
        }
        self.expect(TokenType::RightParen, "Expected ')' after expression");
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.ty {
            TokenType::False => self.emit(Op::False),
            TokenType::Nil => self.emit(Op::Nil),
            TokenType::True => self.emit(Op::True),
            _ => unreachable!("literal rule on non-literal token"),
        }
    }

    fn number(&mut self, _can_assign: bool) {
        let value: f64 = self.previous.text.parse().unwrap_or(0.0);
        self.emit_constant(Value::Number(value));
    }

    fn number_hex(&mut self, _can_assign: bool) {
        let mut value: f64 = 0.0;
        for &b in &self.previous.text.as_bytes()[2..] {
            value = value * 16.0 + (b as char).to_digit(16).unwrap_or(0) as f64;
        }
        self.emit_constant(Value::Number(value));
    }

    fn number_bin(&mut self, _can_assign: bool) {
        let mut value: f64 = 0.0;
        for &b in &self.previous.text.as_bytes()[2..] {
            value = value * 2.0 + (b - b'0') as f64;
        }
        self.emit_constant(Value::Number(value));
    }

    /// Unescape the previous string token into an interned string.
    fn string_literal_value(&mut self) -> Option<StrId> {
        let text = self.previous.text;
        let triple = text.starts_with("\"\"\"") || text.starts_with("'''");
        let body = if triple {
            &text[3..text.len() - 3]
        } else {
            &text[1..text.len() - 1]
        };
        match ops::unescape(body) {
            Ok(unescaped) => Some(self.heap.intern_owned(unescaped)),
            Err(message) => {
                self.error(&message);
                None
            }
        }
    }

    fn string(&mut self, _can_assign: bool) {
        if let Some(id) = self.string_literal_value() {
            self.emit_constant(Value::Str(id));
        }
    }

    fn raw_string(&mut self, _can_assign: bool) {
        let text = self.previous.text;
        let body = &text[2..text.len() - 1];
        let id = self.heap.intern(body);
        self.emit_constant(Value::Str(id));
    }

    fn raw_triple_string(&mut self, _can_assign: bool) {
        let text = self.previous.text;
        let body = &text[4..text.len() - 3];
        let id = self.heap.intern(body);
        self.emit_constant(Value::Str(id));
    }

    fn variable(&mut self, can_assign: bool) {
        self.named_variable(self.previous.text, can_assign);
    }

    fn this(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Can't use 'this' outside of a class");
            return;
        }
        self.named_variable("this", false);
    }

    fn super_(&mut self, _can_assign: bool) {
        match self.classes.last() {
            None => self.error("Can't use 'super' outside of a class"),
            Some(info) if !info.has_superclass => {
                self.error("Can't use 'super' in a class with no superclass")
            }
            Some(_) => {}
        }

        self.expect(TokenType::Dot, "Expect '.' after 'super'");
        self.expect(TokenType::Identifier, "Expect superclass method name");
        let name = self.identifier_constant(self.previous.text);

        self.named_variable("this", false);
        self.expect(TokenType::LeftParen, "Expect '(' to call super method");
        let arg_count = self.argument_list();
        self.named_variable("super", false);
        self.emit(Op::SuperInvoke(name, arg_count));
    }

    fn unary(&mut self, _can_assign: bool) {
        let operator = self.previous.ty;
        self.parse_precedence(if operator == TokenType::Not {
            Precedence::Not
        } else {
            Precedence::Unary
        });
        match operator {
            TokenType::Tilde => self.emit(Op::BitwiseNot),
            TokenType::Not => self.emit(Op::Not),
            TokenType::Minus => self.emit(Op::Negate),
            _ => unreachable!("unary rule on non-unary token"),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let mut operator = self.previous.ty;
        let mut is_not = false;
        let mut not_in = false;
        if operator == TokenType::Is && self.consume(TokenType::Not) {
            is_not = true;
        } else if operator == TokenType::Not {
            self.expect(
                TokenType::In,
                "when used as a binary operator, 'not' must always be followed by 'in'",
            );
            not_in = true;
            operator = TokenType::In;
        }
        self.parse_precedence(rule(operator).precedence.one_higher());

        match operator {
            TokenType::Is => {
                self.emit(Op::Is);
                if is_not {
                    self.emit(Op::Not);
                }
            }
            TokenType::BangEqual => {
                self.emit(Op::Equal);
                self.emit(Op::Not);
            }
            TokenType::EqualEqual => self.emit(Op::Equal),
            TokenType::Greater => self.emit(Op::Greater),
            TokenType::GreaterEqual => {
                self.emit(Op::Less);
                self.emit(Op::Not);
            }
            TokenType::Less => self.emit(Op::Less),
            TokenType::LessEqual => {
                self.emit(Op::Greater);
                self.emit(Op::Not);
            }
            TokenType::In => {
                self.emit(Op::In);
                if not_in {
                    self.emit(Op::Not);
                }
            }
            TokenType::Plus => self.emit(Op::Add),
            TokenType::Minus => self.emit(Op::Subtract),
            TokenType::Star => self.emit(Op::Multiply),
            TokenType::Slash => self.emit(Op::Divide),
            TokenType::SlashSlash => self.emit(Op::FloorDivide),
            TokenType::Percent => self.emit(Op::Modulo),
            TokenType::ShiftLeft => self.emit(Op::ShiftLeft),
            TokenType::ShiftRight => self.emit(Op::ShiftRight),
            TokenType::Pipe => self.emit(Op::BitwiseOr),
            TokenType::Ampersand => self.emit(Op::BitwiseAnd),
            TokenType::Caret => self.emit(Op::BitwiseXor),
            _ => unreachable!("binary rule on non-binary token"),
        }
    }

    fn and(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(Op::JumpIfFalse);
        self.emit(Op::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(Op::JumpIfFalse);
        let end_jump = self.emit_jump(Op::Jump);
        self.patch_jump(else_jump);
        self.emit(Op::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    /// `try EXPR else EXPR` as an expression.
    fn try_(&mut self, _can_assign: bool) {
        let start_jump = self.emit_jump(Op::TryStart);
        self.expression();
        let end_jump = self.emit_jump(Op::TryEnd);
        self.expect(TokenType::Else, "Expected 'else' in 'try' expression");
        self.patch_jump(start_jump);
        self.expression();
        self.patch_jump(end_jump);
    }

    fn raise(&mut self, _can_assign: bool) {
        self.expression();
        self.emit(Op::Raise);
    }

    fn argument_list(&mut self) -> u8 {
        let mut arg_count: u16 = 0;
        if !self.check(TokenType::RightParen) {
            loop {
                if self.check(TokenType::RightParen) {
                    break;
                }
                self.expression();
                if arg_count == 255 {
                    self.error("Can't have more than 255 arguments");
                }
                arg_count = arg_count.saturating_add(1);
                if !self.consume(TokenType::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenType::RightParen, "Expect ')' after arguments");
        arg_count.min(255) as u8
    }

    fn call(&mut self, _can_assign: bool) {
        let arg_count = self.argument_list();
        self.emit(Op::Call(arg_count));
    }

    fn dot(&mut self, can_assign: bool) {
        self.expect(TokenType::Identifier, "Expect property name after '.'");
        let name = self.identifier_constant(self.previous.text);

        if can_assign && self.consume(TokenType::Equal) {
            self.expression();
            self.emit(Op::SetField(name));
        } else if self.consume(TokenType::LeftParen) {
            let arg_count = self.argument_list();
            self.emit(Op::Invoke(name, arg_count));
        } else {
            self.emit(Op::GetField(name));
        }
    }

    /// `a[i]`, `a[i] = v`, and `a[lo:hi]` rewrite into dunder invokes.
    fn subscript(&mut self, can_assign: bool) {
        if self.check(TokenType::Colon) {
            // Implicit nil when the first slice argument is missing.
            self.emit(Op::Nil);
        } else {
            self.expression();
        }

        if self.consume(TokenType::Colon) {
            let name = self.identifier_constant("__slice__");
            if self.check(TokenType::RightBracket) {
                self.emit(Op::Nil);
            } else {
                self.expression();
            }
            self.expect(
                TokenType::RightBracket,
                "Expect ']' after slice index expression",
            );
            self.emit(Op::Invoke(name, 2));
        } else {
            self.expect(TokenType::RightBracket, "Expect ']' after index expression");
            if can_assign && self.consume(TokenType::Equal) {
                let name = self.identifier_constant("__setitem__");
                self.expression();
                self.emit(Op::Invoke(name, 2));
            } else {
                let name = self.identifier_constant("__getitem__");
                self.emit(Op::Invoke(name, 1));
            }
        }
    }

    fn list_display(&mut self, _can_assign: bool) {
        let mut length: usize = 0;
        loop {
            if self.consume(TokenType::RightBracket) {
                break;
            }
            self.expression();
            length += 1;
            if !self.consume(TokenType::Comma) {
                self.expect(
                    TokenType::RightBracket,
                    "Expect ']' at the end of a list display",
                );
                break;
            }
        }
        if length > u8::MAX as usize {
            self.error("Number of items in a list display cannot exceed 255");
            return;
        }
        self.emit(Op::NewList(length as u8));
    }

    fn map_display(&mut self, _can_assign: bool) {
        let mut length: usize = 0;
        loop {
            if self.consume(TokenType::RightBrace) {
                break;
            }
            self.expression();
            if self.consume(TokenType::Colon) {
                self.expression();
            } else {
                // A missing value part means nil; `{a, b}` is a set display.
                self.emit(Op::Nil);
            }
            length += 1;
            if !self.consume(TokenType::Comma) {
                self.expect(
                    TokenType::RightBrace,
                    "Expect '}' at the end of a dict display",
                );
                break;
            }
        }
        if length > u8::MAX as usize {
            self.error("Number of pairs in a dict display cannot exceed 255");
            return;
        }
        self.emit(Op::NewDict(length as u8));
    }

    // -- Type annotations ---------------------------------------------------

    /// Type expressions are parsed and discarded; they have no runtime
    /// effect.
    fn type_expression(&mut self) {
        self.expect(TokenType::Identifier, "Expected type expression");
        loop {
            if self.consume(TokenType::QMark) {
                continue;
            }
            if self.consume(TokenType::Dot) {
                self.expect(TokenType::Identifier, "Expected type member identifier");
                continue;
            }
            if self.consume(TokenType::Pipe) {
                self.type_expression();
                continue;
            }
            if self.consume(TokenType::LeftBracket) {
                while self.check(TokenType::Identifier) {
                    self.type_expression();
                    if !self.consume(TokenType::Comma) {
                        break;
                    }
                }
                self.expect(
                    TokenType::RightBracket,
                    "Expected ']' to close matching bracket",
                );
                continue;
            }
            break;
        }
    }

    // -- Statements ---------------------------------------------------------

    fn block(&mut self, new_scope: bool) {
        if new_scope {
            self.begin_scope();
        }

        while self.consume(TokenType::Newline) {}
        self.expect(TokenType::Indent, "Expect INDENT at beginning of block");
        while self.consume(TokenType::Newline) {}
        let mut at_least_one_declaration = false;
        while !self.check(TokenType::Dedent) && !self.check(TokenType::Eof) {
            at_least_one_declaration = true;
            self.declaration();
            while self.consume(TokenType::Newline) {}
        }
        self.expect(TokenType::Dedent, "Expect DEDENT after block");

        if !at_least_one_declaration {
            self.error("Expected an indented block");
        }

        if new_scope {
            self.end_scope();
        }
    }

    fn declaration(&mut self) {
        if self.consume(TokenType::Class) {
            self.class_declaration();
        } else if self.consume(TokenType::Def) {
            self.fn_declaration();
        } else if self.consume(TokenType::Var) || self.consume(TokenType::Final) {
            self.var_declaration();
        } else if self.consume(TokenType::At) {
            self.decorated_fn_declaration();
        } else {
            self.statement();
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    fn statement(&mut self) {
        if self.consume(TokenType::For) {
            self.for_statement();
        } else if self.consume(TokenType::If) {
            self.if_statement();
        } else if self.consume(TokenType::Return) {
            self.return_statement();
        } else if self.consume(TokenType::While) {
            self.while_statement();
        } else if self.consume(TokenType::Import) {
            self.import_statement();
        } else if self.consume(TokenType::Newline) || self.consume(TokenType::Semicolon) {
            // nop statement
        } else if self.consume(TokenType::Pass) {
            self.consume_statement_delimiter(
                "Expected statement delimiter at end of pass statement",
            );
        } else {
            self.expression_statement();
        }
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume_statement_delimiter("Expected statement delimiter after expression");
        self.emit(Op::Pop);
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name");

        if self.check(TokenType::Identifier) {
            self.type_expression();
        }

        if self.consume(TokenType::Equal) {
            self.expression();
        } else {
            self.emit(Op::Nil);
        }
        self.consume_statement_delimiter(
            "Expected statement delimiter after variable declaration",
        );
        self.define_variable(global);
    }

    fn fn_declaration(&mut self) {
        let global = self.parse_variable("Expect function name");
        self.mark_initialized();
        self.function(FunctionType::Function);
        self.define_variable(global);
    }

    /// One or more `@decorator` lines followed by a (possibly anonymous)
    /// `def`. Each decorator wraps the function value with one call.
    fn decorated_fn_declaration(&mut self) {
        let mut wrap_count = 0;
        loop {
            self.expression();
            self.consume_statement_delimiter(
                "Expected statement delimiter after decorator expression",
            );
            wrap_count += 1;
            if !self.consume(TokenType::At) {
                break;
            }
        }

        self.expect(
            TokenType::Def,
            "Expect 'def' to start function after decorator expression",
        );
        let mut named = false;
        let mut global = 0;
        if self.check(TokenType::Identifier) {
            named = true;
            global = self.parse_variable("Expect function name");
            self.mark_initialized();
        }
        self.function(FunctionType::Function);

        for _ in 0..wrap_count {
            self.emit(Op::Call(1));
        }

        if named {
            self.define_variable(global);
        } else {
            self.emit(Op::Pop);
        }
    }

    fn class_declaration(&mut self) {
        self.expect(TokenType::Identifier, "Expect class name");
        let class_name = self.previous.text;
        let name_constant = self.identifier_constant(class_name);
        self.declare_variable();

        self.emit(Op::Class(name_constant));
        self.define_variable(name_constant);

        self.classes.push(ClassInfo {
            has_superclass: false,
        });

        let mut has_superclass = false;
        if self.consume(TokenType::LeftParen) {
            if !self.consume(TokenType::RightParen) {
                self.expression();

                self.begin_scope();
                self.add_local("super");
                self.define_variable(0);

                self.named_variable(class_name, false);
                self.emit(Op::Inherit);
                has_superclass = true;
                self.classes.last_mut().unwrap().has_superclass = true;

                self.expect(
                    TokenType::RightParen,
                    "Expect ')' after superclass expression",
                );
            }
        }

        self.named_variable(class_name, false);
        self.expect(TokenType::Colon, "Expect ':' before class body");
        while self.consume(TokenType::Newline) {}
        self.expect(TokenType::Indent, "Expect INDENT before class body");
        while self.consume(TokenType::Newline) {}
        // An optional docstring leads the body.
        if self.consume(TokenType::Str)
            || self.consume(TokenType::RawStr)
            || self.consume(TokenType::RawTripleStr)
        {
            while self.consume(TokenType::Newline) {}
        }
        while !self.check(TokenType::Dedent) && !self.check(TokenType::Eof) {
            if self.check(TokenType::Var) || self.check(TokenType::Final) {
                self.field_declaration();
            } else {
                self.method();
            }
            while self.consume(TokenType::Newline) {}
        }
        self.expect(TokenType::Dedent, "Expect DEDENT after class body");
        self.emit(Op::Pop);

        if has_superclass {
            self.end_scope();
        }

        self.classes.pop();
    }

    /// Field declarations are documentation only; nothing is emitted.
    fn field_declaration(&mut self) {
        if !self.consume(TokenType::Final) {
            self.expect(TokenType::Var, "Expected 'var' for field declaration");
        }
        self.expect(TokenType::Identifier, "Expected field identifier");
        self.type_expression();
        self.consume_statement_delimiter("Expected delimiter after field declaration");
    }

    fn method(&mut self) {
        self.expect(TokenType::Def, "Expect 'def' to start method definition");
        self.expect(TokenType::Identifier, "Expect method name");
        let constant = self.identifier_constant(self.previous.text);

        let ty = if self.previous.text == "__init__" {
            FunctionType::Initializer
        } else {
            FunctionType::Method
        };
        self.function(ty);
        self.emit(Op::Method(constant));
    }

    fn if_statement(&mut self) {
        let mut end_jumps: Vec<usize> = Vec::new();

        self.expression();
        self.expect(TokenType::Colon, "Expect ':' after condition");

        let mut then_jump = self.emit_jump(Op::JumpIfFalse);
        self.emit(Op::Pop);
        self.block(true);
        end_jumps.push(self.emit_jump(Op::Jump));

        self.patch_jump(then_jump);
        self.emit(Op::Pop);

        while self.consume(TokenType::Elif) {
            if end_jumps.len() >= MAX_ELIF_CHAIN_COUNT {
                self.error("Too many chained 'elif' clauses");
            }
            self.expression();
            self.expect(TokenType::Colon, "Expect ':' after elif condition");
            then_jump = self.emit_jump(Op::JumpIfFalse);
            self.emit(Op::Pop);
            self.block(true);
            let end_jump = self.emit_jump(Op::Jump);
            self.patch_jump(then_jump);
            self.emit(Op::Pop);
            if end_jumps.len() < MAX_ELIF_CHAIN_COUNT {
                end_jumps.push(end_jump);
            }
        }

        if self.consume(TokenType::Else) {
            self.expect(TokenType::Colon, "Expect ':' after 'else'");
            self.block(true);
        }

        for jump in end_jumps {
            self.patch_jump(jump);
        }
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_offset();
        self.expression();
        self.expect(TokenType::Colon, "Expect ':' after condition");

        let exit_jump = self.emit_jump(Op::JumpIfFalse);
        self.emit(Op::Pop);
        self.block(true);
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit(Op::Pop);
    }

    /// `for x in iterable:` — lowered onto the iterator protocol with a
    /// synthetic `@iterator` local holding the iterator itself.
    fn for_in_statement(&mut self) {
        self.begin_scope();

        self.expect(
            TokenType::Identifier,
            "Expect loop variable name for for-in statement",
        );
        let variable_name = self.previous.text;

        self.expect(TokenType::In, "Expect 'in' in for-in statement");
        self.expression();
        self.emit(Op::GetIter);
        self.add_local("@iterator");
        self.define_variable(0);
        let loop_start = self.current_offset();
        self.emit(Op::GetNext);
        let exit_jump = self.emit_jump(Op::JumpIfStopIteration);

        self.begin_scope();
        // The freshly produced item on TOS becomes the loop variable's slot.
        self.add_local(variable_name);
        self.define_variable(0);
        self.expect(TokenType::Colon, "Expect ':' to begin for-in loop body");
        self.block(false);
        self.end_scope();

        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        self.emit(Op::Pop); // StopIteration

        // The iterator itself is popped by end_scope as the '@iterator'
        // local goes away.
        self.end_scope();
    }

    fn for_statement(&mut self) {
        if self.check(TokenType::Identifier) {
            self.for_in_statement();
            return;
        }

        self.begin_scope();

        self.expect(TokenType::LeftParen, "Expect '(' after 'for'");
        if self.consume(TokenType::Semicolon) {
            // No initializer.
        } else if self.consume(TokenType::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_offset();
        let mut exit_jump: Option<usize> = None;
        if !self.consume(TokenType::Semicolon) {
            self.expression();
            self.expect(TokenType::Semicolon, "Expect ';' after loop condition");

            exit_jump = Some(self.emit_jump(Op::JumpIfFalse));
            self.emit(Op::Pop);
        }

        if !self.consume(TokenType::RightParen) {
            let body_jump = self.emit_jump(Op::Jump);
            let increment_start = self.current_offset();
            self.expression();
            self.emit(Op::Pop);
            self.expect(TokenType::RightParen, "Expect ')' after for clauses");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.expect(TokenType::Colon, "Expect ':' for for body");
        self.block(true);
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit(Op::Pop);
        }

        self.end_scope();
    }

    fn return_statement(&mut self) {
        if self.fn_ref().ty == FunctionType::Script {
            self.error("Can't return from top-level code");
        }

        if self.consume(TokenType::Semicolon) {
            self.emit_return();
        } else {
            if self.fn_ref().ty == FunctionType::Initializer {
                self.error("Can't return a value from an initializer");
            }
            self.expression();
            self.consume_statement_delimiter("Expect newline or ';' after return value");
            self.emit(Op::Return);
        }
    }

    fn import_statement(&mut self) {
        self.expect(TokenType::Identifier, "Expect module name after 'import'");
        let module_name = self.identifier_constant(self.previous.text);

        if self.consume(TokenType::As) {
            self.expect(TokenType::Identifier, "Expect module alias after 'as'");
        }

        // Declare without consuming: the previous token (alias or module
        // name) is the bound variable.
        self.declare_variable();
        let alias = if self.fn_ref().scope_depth > 0 {
            0
        } else {
            self.identifier_constant(self.previous.text)
        };

        self.emit(Op::Import(module_name));
        self.define_variable(alias);

        self.consume_statement_delimiter("Expect statement delimiter after import statement");
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.ty != TokenType::Eof {
            if self.previous.ty == TokenType::Semicolon {
                return;
            }
            match self.current.ty {
                TokenType::Class
                | TokenType::Def
                | TokenType::Var
                | TokenType::Final
                | TokenType::For
                | TokenType::If
                | TokenType::While
                | TokenType::Return => return,
                _ => {}
            }
            self.advance();
        }
    }
}

/// The Pratt rule table.
fn rule<'src, 'h>(ty: TokenType) -> ParseRule<'src, 'h> {
    use TokenType::*;

    fn entry<'src, 'h>(
        prefix: Option<ParseFn<'src, 'h>>,
        infix: Option<ParseFn<'src, 'h>>,
        precedence: Precedence,
    ) -> ParseRule<'src, 'h> {
        ParseRule {
            prefix,
            infix,
            precedence,
        }
    }

    match ty {
        LeftParen => entry(Some(Compiler::grouping), Some(Compiler::call), Precedence::Call),
        LeftBrace => entry(Some(Compiler::map_display), None, Precedence::None),
        LeftBracket => entry(
            Some(Compiler::list_display),
            Some(Compiler::subscript),
            Precedence::Call,
        ),
        Dot => entry(None, Some(Compiler::dot), Precedence::Call),
        Minus => entry(Some(Compiler::unary), Some(Compiler::binary), Precedence::Term),
        Plus => entry(None, Some(Compiler::binary), Precedence::Term),
        Slash => entry(None, Some(Compiler::binary), Precedence::Factor),
        SlashSlash => entry(None, Some(Compiler::binary), Precedence::Factor),
        Percent => entry(None, Some(Compiler::binary), Precedence::Factor),
        Star => entry(None, Some(Compiler::binary), Precedence::Factor),
        Pipe => entry(None, Some(Compiler::binary), Precedence::BitwiseOr),
        Ampersand => entry(None, Some(Compiler::binary), Precedence::BitwiseAnd),
        Caret => entry(None, Some(Compiler::binary), Precedence::BitwiseXor),
        Tilde => entry(Some(Compiler::unary), None, Precedence::None),
        ShiftLeft => entry(None, Some(Compiler::binary), Precedence::Shift),
        ShiftRight => entry(None, Some(Compiler::binary), Precedence::Shift),
        BangEqual => entry(None, Some(Compiler::binary), Precedence::Comparison),
        EqualEqual => entry(None, Some(Compiler::binary), Precedence::Comparison),
        Greater => entry(None, Some(Compiler::binary), Precedence::Comparison),
        GreaterEqual => entry(None, Some(Compiler::binary), Precedence::Comparison),
        Less => entry(None, Some(Compiler::binary), Precedence::Comparison),
        LessEqual => entry(None, Some(Compiler::binary), Precedence::Comparison),
        In => entry(None, Some(Compiler::binary), Precedence::Comparison),
        Is => entry(None, Some(Compiler::binary), Precedence::Comparison),
        Not => entry(Some(Compiler::unary), Some(Compiler::binary), Precedence::Comparison),
        Identifier => entry(Some(Compiler::variable), None, Precedence::None),
        Str => entry(Some(Compiler::string), None, Precedence::None),
        RawStr => entry(Some(Compiler::raw_string), None, Precedence::None),
        RawTripleStr => entry(Some(Compiler::raw_triple_string), None, Precedence::None),
        Number => entry(Some(Compiler::number), None, Precedence::None),
        NumberHex => entry(Some(Compiler::number_hex), None, Precedence::None),
        NumberBin => entry(Some(Compiler::number_bin), None, Precedence::None),
        And => entry(None, Some(Compiler::and), Precedence::And),
        Or => entry(None, Some(Compiler::or), Precedence::Or),
        False => entry(Some(Compiler::literal), None, Precedence::None),
        Nil => entry(Some(Compiler::literal), None, Precedence::None),
        True => entry(Some(Compiler::literal), None, Precedence::None),
        Super => entry(Some(Compiler::super_), None, Precedence::None),
        This => entry(Some(Compiler::this), None, Precedence::None),
        Raise => entry(Some(Compiler::raise), None, Precedence::None),
        Try => entry(Some(Compiler::try_), None, Precedence::None),
        _ => entry(None, None, Precedence::None),
    }
}

/// Build a fresh module class + instance pair. Script modules start with a
/// copy of `globals` in their fields.
pub fn new_module(heap: &mut Heap, name: StrId, globals: Option<&Map>) -> ObjId {
    let class = heap.allocate(Obj::Class(crate::object::ObjClass {
        name,
        methods: Map::new(),
        static_methods: Map::new(),
        is_builtin: false,
        is_module: true,
        descriptor: None,
    }));
    let mut fields = Map::new();
    if let Some(globals) = globals {
        fields.extend_from(globals);
    }
    heap.allocate(Obj::Instance(crate::object::ObjInstance { class, fields }))
}
