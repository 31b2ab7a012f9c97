use std::collections::{BTreeSet, HashMap, HashSet};
use std::rc::Rc;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::chunk::OpCode;
use crate::constants::{
    FIELD_CHECK_VICTORY, FIELD_RUN, FIELD_TRIGGER, FIELD_UPDATE, INIT, ITERATE, NEXT, SCRIPT_FILE, SCRIPT_FUNCTION, THIS,
};
use crate::debugger::{CodePointer, DebugInfo};
use crate::error::CompilerError;
use crate::objects::object_class::ClassKind;
use crate::objects::object_function::ObjectFunction;
use crate::patcher::patch;
use crate::scanner::{Literal, Token, TokenFactory, TokenType};
use crate::value::{make_str_value, Value};

static CONST_IDENTIFIER: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"^[A-Z]+(?:_+[A-Z]+)*$").ok());
static IMPLICIT_ARG: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"^\$([0-9]+)$").ok());

const CLASS_OPENERS: [TokenType; 5] = [
    TokenType::TokenClass,
    TokenType::TokenEffect,
    TokenType::TokenStance,
    TokenType::TokenScenario,
    TokenType::TokenAi,
];

const ASSIGNMENT_OPERATORS: [TokenType; 7] = [
    TokenType::TokenEqual,
    TokenType::TokenPlusEqual,
    TokenType::TokenMinusEqual,
    TokenType::TokenStarEqual,
    TokenType::TokenSlashEqual,
    TokenType::TokenSlashSlashEqual,
    TokenType::TokenModEqual,
];

fn is_const_name(name: &str) -> bool {
    name == THIS || CONST_IDENTIFIER.as_ref().map_or(false, |re| re.is_match(name))
}

fn implicit_arg_index(name: &str) -> Option<usize> {
    IMPLICIT_ARG.as_ref()?.captures(name)?.get(1)?.as_str().parse().ok()
}

fn compound_op(operator: TokenType) -> Option<OpCode> {
    match operator {
        TokenType::TokenPlusEqual => Some(OpCode::Add),
        TokenType::TokenMinusEqual => Some(OpCode::Subtract),
        TokenType::TokenStarEqual => Some(OpCode::Multiply),
        TokenType::TokenSlashEqual => Some(OpCode::Divide),
        TokenType::TokenSlashSlashEqual => Some(OpCode::DivideInt),
        TokenType::TokenModEqual => Some(OpCode::Mod),
        _ => None,
    }
}

fn string_literal(token: &Token) -> Rc<str> {
    match &token.literal {
        Some(Literal::Str(value)) => Rc::clone(value),
        _ => Rc::from(token.lexeme.as_str()),
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
enum Precedence {
    None,
    Rescue,      // ?!
    Or,          // ||
    And,         // &&
    Equality,    // == != is !is in !in
    Comparison,  // < > <= >=
    Range,       // .. ...
    Term,        // + -
    Factor,      // * / // %
    NilCoalesce, // ??
    Unary,
}

impl From<u8> for Precedence {
    fn from(value: u8) -> Self {
        match value {
            0 => Precedence::None,
            1 => Precedence::Rescue,
            2 => Precedence::Or,
            3 => Precedence::And,
            4 => Precedence::Equality,
            5 => Precedence::Comparison,
            6 => Precedence::Range,
            7 => Precedence::Term,
            8 => Precedence::Factor,
            9 => Precedence::NilCoalesce,
            _ => Precedence::Unary,
        }
    }
}

impl Precedence {
    fn next(self) -> Precedence {
        Precedence::from(self as u8 + 1)
    }
}

type InfixFn = fn(&mut Parser, check_unresolved: bool) -> Result<(), CompilerError>;

#[derive(Clone, Copy)]
struct ParseRule {
    infix: Option<InfixFn>,
    precedence: Precedence,
}

impl ParseRule {
    const fn new(infix: Option<InfixFn>, precedence: Precedence) -> Self {
        ParseRule { infix, precedence }
    }
}

const RULES: [ParseRule; TokenType::TokenEof as usize + 1] = {
    let mut rules = [ParseRule::new(None, Precedence::None); TokenType::TokenEof as usize + 1];
    rules[TokenType::TokenQuestionBang as usize] =
        ParseRule::new(Some(|parser, check| parser.rescue(check)), Precedence::Rescue);
    rules[TokenType::TokenOrOr as usize] = ParseRule::new(Some(|parser, check| parser.or(check)), Precedence::Or);
    rules[TokenType::TokenAndAnd as usize] = ParseRule::new(Some(|parser, check| parser.and(check)), Precedence::And);

    rules[TokenType::TokenEqualEqual as usize] =
        ParseRule::new(Some(|parser, check| parser.binary(check)), Precedence::Equality);
    rules[TokenType::TokenBangEqual as usize] =
        ParseRule::new(Some(|parser, check| parser.binary(check)), Precedence::Equality);
    rules[TokenType::TokenIs as usize] = ParseRule::new(Some(|parser, check| parser.binary(check)), Precedence::Equality);
    rules[TokenType::TokenNotIs as usize] =
        ParseRule::new(Some(|parser, check| parser.binary(check)), Precedence::Equality);
    rules[TokenType::TokenIn as usize] = ParseRule::new(Some(|parser, check| parser.binary(check)), Precedence::Equality);
    rules[TokenType::TokenNotIn as usize] =
        ParseRule::new(Some(|parser, check| parser.binary(check)), Precedence::Equality);

    rules[TokenType::TokenGreater as usize] =
        ParseRule::new(Some(|parser, check| parser.binary(check)), Precedence::Comparison);
    rules[TokenType::TokenGreaterEqual as usize] =
        ParseRule::new(Some(|parser, check| parser.binary(check)), Precedence::Comparison);
    rules[TokenType::TokenLess as usize] =
        ParseRule::new(Some(|parser, check| parser.binary(check)), Precedence::Comparison);
    rules[TokenType::TokenLessEqual as usize] =
        ParseRule::new(Some(|parser, check| parser.binary(check)), Precedence::Comparison);

    rules[TokenType::TokenDotDot as usize] = ParseRule::new(Some(|parser, check| parser.range(check)), Precedence::Range);
    rules[TokenType::TokenDotDotDot as usize] =
        ParseRule::new(Some(|parser, check| parser.range(check)), Precedence::Range);

    rules[TokenType::TokenPlus as usize] = ParseRule::new(Some(|parser, check| parser.binary(check)), Precedence::Term);
    rules[TokenType::TokenMinus as usize] = ParseRule::new(Some(|parser, check| parser.binary(check)), Precedence::Term);

    rules[TokenType::TokenStar as usize] = ParseRule::new(Some(|parser, check| parser.binary(check)), Precedence::Factor);
    rules[TokenType::TokenSlash as usize] = ParseRule::new(Some(|parser, check| parser.binary(check)), Precedence::Factor);
    rules[TokenType::TokenSlashSlash as usize] =
        ParseRule::new(Some(|parser, check| parser.binary(check)), Precedence::Factor);
    rules[TokenType::TokenMod as usize] = ParseRule::new(Some(|parser, check| parser.binary(check)), Precedence::Factor);

    rules[TokenType::TokenQuestionQuestion as usize] =
        ParseRule::new(Some(|parser, check| parser.nil_coalesce(check)), Precedence::NilCoalesce);
    rules
};

fn get_rule(token_type: TokenType) -> ParseRule {
    RULES[token_type as usize]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Init,
    Lambda,
}

/// What a statement leaves behind, used to turn the last line of a block
/// into the block's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Completion {
    Value,
    Diverges,
    Nothing,
}

#[derive(Debug, Clone)]
struct Local {
    name: Rc<str>,
    slot: usize,
    depth: i32,
    is_captured: bool,
    is_const: bool,
    /// Declared by an assignment whose right-hand side is still compiling.
    pending: bool,
    debug_index: Option<usize>,
}

#[derive(Debug, Clone)]
struct Upvalue {
    index: usize,
    is_local: bool,
    is_const: bool,
    fiber_name: Rc<str>,
}

#[derive(Debug, Default)]
struct ActiveLoop {
    start: usize,
    depth: i32,
    breaks: Vec<usize>,
    continues: Vec<usize>,
}

#[derive(Debug, Clone)]
enum Operand {
    None,
    Name(Rc<str>),
    Local { slot: usize, is_const: bool },
    Upvalue { index: usize, is_const: bool },
}

/// One emitted instruction, kept so the parser can look back at and undo
/// what it just wrote.
#[derive(Debug, Clone)]
struct Emitted {
    op: OpCode,
    start: usize,
    operand: Operand,
}

struct FunctionCompiler {
    function: ObjectFunction,
    kind: FunctionKind,
    locals: Vec<Local>,
    upvalues: Vec<Upvalue>,
    scope_depth: i32,
    loops: Vec<ActiveLoop>,
    emitted: Vec<Emitted>,
}

impl FunctionCompiler {
    fn new(kind: FunctionKind, name: &str, is_debug: bool) -> Self {
        let mut function = ObjectFunction::new(name);
        let receiver = if kind == FunctionKind::Function { "" } else { THIS };
        let debug_index = if is_debug {
            let mut info = DebugInfo::default();
            let index = info.open_local(receiver, 0, 0);
            function.debug_info = Some(info);
            Some(index)
        } else {
            None
        };
        let receiver = Local {
            name: Rc::from(receiver),
            slot: 0,
            depth: 0,
            is_captured: false,
            is_const: is_const_name(receiver),
            pending: false,
            debug_index,
        };
        FunctionCompiler {
            function,
            kind,
            locals: vec![receiver],
            upvalues: Vec::new(),
            scope_depth: 0,
            loops: Vec::new(),
            emitted: Vec::new(),
        }
    }

    fn find_local(&self, name: &str, allow_pending: bool) -> Option<usize> {
        self.locals
            .iter()
            .rposition(|local| local.name.as_ref() == name && (allow_pending || !local.pending))
    }
}

#[derive(Debug, Clone)]
struct ClassCompiler {
    name: Rc<str>,
    kind: ClassKind,
    superclasses: Vec<Rc<str>>,
    /// `this.field = value` lines run at the top of `init`.
    init_tokens: Vec<Token>,
    declared_fields: HashSet<Rc<str>>,
}

impl ClassCompiler {
    fn new(name: Rc<str>, kind: ClassKind) -> Self {
        ClassCompiler { name, kind, superclasses: Vec::new(), init_tokens: Vec::new(), declared_fields: HashSet::new() }
    }

    fn required_fields(&self) -> &'static [&'static str] {
        match self.kind {
            ClassKind::Effect => &[FIELD_TRIGGER, FIELD_RUN],
            ClassKind::Scenario => &[FIELD_CHECK_VICTORY],
            ClassKind::Ai => &[FIELD_UPDATE],
            _ => &[],
        }
    }
}

#[derive(Debug, Default)]
struct ArgList {
    names: Vec<Rc<str>>,
    prepended: Vec<Token>,
    optional_start: Option<usize>,
    defaults: Vec<Value>,
}

/// Compiles a whole token stream into the top-level script function.
/// `initial_objects` become const locals in slots 1.. in the given order.
pub fn compile(tokens: Vec<Token>, initial_objects: &[&str], is_debug: bool) -> Result<Rc<ObjectFunction>, CompilerError> {
    Parser::new(tokens, is_debug).compile_script(initial_objects)
}

pub struct Parser {
    tokens: Vec<Token>,
    current: usize,
    compiler: FunctionCompiler,
    enclosing: Vec<FunctionCompiler>,
    classes: Vec<ClassCompiler>,
    compiled_classes: HashMap<Rc<str>, ClassCompiler>,
    pending_increment: Option<Vec<Token>>,
    lambda_count: usize,
    implicit_var_count: usize,
    is_debug: bool,
}

impl Parser {
    pub fn new(mut tokens: Vec<Token>, is_debug: bool) -> Parser {
        if tokens.last().map_or(true, |token| token.token_type != TokenType::TokenEof) {
            let eof = match tokens.last() {
                Some(token) => token.with_type(TokenType::TokenEof),
                None => Token::new(TokenType::TokenEof, "", None, 1, Rc::from(SCRIPT_FILE)),
            };
            tokens.push(eof);
        }
        Parser {
            tokens,
            current: 0,
            compiler: FunctionCompiler::new(FunctionKind::Script, SCRIPT_FUNCTION, is_debug),
            enclosing: Vec::new(),
            classes: Vec::new(),
            compiled_classes: HashMap::new(),
            pending_increment: None,
            lambda_count: 0,
            implicit_var_count: 0,
            is_debug,
        }
    }

    pub fn compile_script(mut self, initial_objects: &[&str]) -> Result<Rc<ObjectFunction>, CompilerError> {
        self.begin_scope();
        for name in initial_objects {
            self.declare_local(name, true, false)?;
        }
        self.compiler.function.arity = initial_objects.len();

        let last = self.compile_internal(false)?;
        if last == Completion::Value && self.last_op() == Some(OpCode::Pop) {
            self.roll_back_last();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_return(OpCode::Return, &[]);
        let (function, _) = Self::finish(self.compiler);
        Ok(Rc::new(function))
    }

    fn compile_internal(&mut self, is_expr: bool) -> Result<Completion, CompilerError> {
        let mut last = Completion::Nothing;
        while !self.is_at_end() {
            if self.match_token(TokenType::TokenNewline) {
                continue;
            }
            last = if is_expr {
                if self.expression()? {
                    Completion::Value
                } else {
                    Completion::Nothing
                }
            } else {
                self.declaration()?
            };
        }
        Ok(last)
    }

    /// Compiles generated tokens in place of the current stream.
    fn compile_nested(&mut self, mut tokens: Vec<Token>, is_expr: bool) -> Result<Completion, CompilerError> {
        let eof = tokens.last().unwrap_or_else(|| self.previous()).with_type(TokenType::TokenEof);
        tokens.push(eof);
        let saved_tokens = std::mem::replace(&mut self.tokens, tokens);
        let saved_current = std::mem::replace(&mut self.current, 0);
        let result = self.compile_internal(is_expr);
        self.tokens = saved_tokens;
        self.current = saved_current;
        result
    }

    fn compile_as_called_lambda(&mut self, tokens: Vec<Token>) -> Result<(), CompilerError> {
        let name = self.next_lambda_name();
        let saved_tokens = std::mem::replace(&mut self.tokens, tokens);
        let saved_current = std::mem::replace(&mut self.current, 0);
        self.begin_function(FunctionKind::Lambda, &name);
        let result = self.compile_internal(true);
        self.tokens = saved_tokens;
        self.current = saved_current;
        result?;
        self.emit_scope_return(OpCode::Return);
        let (function, upvalues) = self.end_function()?;
        self.emit_closure(function, upvalues);
        self.emit_with_i32(OpCode::Call, 0, Operand::None);
        Ok(())
    }

    fn declaration(&mut self) -> Result<Completion, CompilerError> {
        self.update_debug_info();
        if self.match_any(&CLASS_OPENERS) {
            self.class_declaration()?;
            Ok(Completion::Nothing)
        } else if self.match_token(TokenType::TokenFn) {
            self.function(FunctionKind::Function, None, true, false)?;
            Ok(Completion::Nothing)
        } else {
            self.statement()
        }
    }

    fn statement(&mut self) -> Result<Completion, CompilerError> {
        if self.match_token(TokenType::TokenLeftBrace) {
            self.begin_scope();
            self.block()?;
            self.end_scope(true);
            Ok(Completion::Nothing)
        } else if self.match_token(TokenType::TokenIf) {
            self.if_something(false)?;
            Ok(Completion::Nothing)
        } else if self.match_token(TokenType::TokenWhen) {
            self.when_something(false)?;
            Ok(Completion::Nothing)
        } else if self.match_token(TokenType::TokenFor) {
            self.for_statement()?;
            Ok(Completion::Nothing)
        } else if self.match_token(TokenType::TokenWhile) {
            self.while_statement()?;
            Ok(Completion::Nothing)
        } else if self.match_token(TokenType::TokenReturn) {
            self.return_or_throw(true)?;
            Ok(Completion::Diverges)
        } else if self.match_token(TokenType::TokenThrow) {
            self.return_or_throw(false)?;
            Ok(Completion::Diverges)
        } else if self.match_token(TokenType::TokenBreak) {
            self.break_or_continue(true)?;
            Ok(Completion::Diverges)
        } else if self.match_token(TokenType::TokenContinue) {
            self.break_or_continue(false)?;
            Ok(Completion::Diverges)
        } else {
            self.expression_statement()
        }
    }

    fn block(&mut self) -> Result<Completion, CompilerError> {
        let mut last = Completion::Nothing;
        loop {
            self.match_all_newlines();
            if self.is_at_end() || self.check(TokenType::TokenRightBrace) {
                break;
            }
            last = self.declaration()?;
        }
        self.consume(TokenType::TokenRightBrace, "Expect '}' after block!")?;
        Ok(last)
    }

    fn expression_statement(&mut self) -> Result<Completion, CompilerError> {
        if self.expression()? {
            self.emit_op(OpCode::Pop);
            Ok(Completion::Value)
        } else {
            Ok(Completion::Nothing)
        }
    }

    /// `{ ...; value }` leaves `value` after dropping the block's locals.
    fn expression_or_expression_block(&mut self) -> Result<bool, CompilerError> {
        if !self.match_token(TokenType::TokenLeftBrace) {
            return self.expression();
        }
        self.begin_scope();
        let last = self.block()?;
        match last {
            Completion::Nothing => Err(self.error_previous("Block is not a valid expression block!")),
            Completion::Diverges => {
                self.end_scope(false);
                Ok(true)
            }
            Completion::Value => {
                // The trailing POP of the last line becomes a POP_UNDER of the locals.
                self.roll_back_last();
                let count = self.end_scope(false);
                if count > 0 {
                    self.emit_with_i32(OpCode::PopUnder, count, Operand::None);
                }
                Ok(true)
            }
        }
    }

    fn if_something(&mut self, is_expr: bool) -> Result<(), CompilerError> {
        let opener = self.current - 1;
        self.expression()?;
        let if_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.if_body(opener, is_expr)?;
        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(if_jump);
        self.emit_op(OpCode::Pop);
        if is_expr {
            self.match_all_newlines();
        }
        if self.match_token(TokenType::TokenElse) {
            self.if_body(opener, is_expr)?;
        } else if is_expr {
            return Err(self.error_at(opener, "An if expression must have an else!"));
        }
        self.patch_jump(else_jump);
        Ok(())
    }

    fn if_body(&mut self, opener: usize, is_expr: bool) -> Result<(), CompilerError> {
        if is_expr {
            if !self.expression_or_expression_block()? {
                return Err(self.error_at(opener, "An if expression must have a return value."));
            }
        } else {
            self.match_all_newlines();
            self.statement()?;
        }
        Ok(())
    }

    fn when_something(&mut self, is_expr: bool) -> Result<(), CompilerError> {
        let origin = self.previous().clone();
        let is_when_throw = self.match_token(TokenType::TokenThrow);
        let factory = TokenFactory::new(&origin);
        let mut tokens = Vec::new();
        let mut uses_temp = false;

        let subject_follows = |parser: &Parser, opener| {
            parser.peek_sequence(&[opener, TokenType::TokenLeftBrace, TokenType::TokenNewline])
        };
        // A bare `when {` has no subject; every clause is then a plain condition.
        let id = if !is_when_throw && self.check(TokenType::TokenLeftBrace) {
            None
        } else if !is_when_throw
            && (subject_follows(self, TokenType::TokenIdentifier)
                || subject_follows(self, TokenType::TokenThis)
                || subject_follows(self, TokenType::TokenSuper))
        {
            Some(self.advance().clone())
        } else {
            uses_temp = true;
            let temp = factory.named(&self.next_implicit_var_name("when"));
            tokens.push(temp.clone());
            tokens.push(factory.of_type(TokenType::TokenEqual));
            if is_when_throw {
                tokens.push(factory.of_type(TokenType::TokenCatch));
                tokens.push(factory.of_type(TokenType::TokenLeftParen));
            }
            tokens.extend(self.consume_until_type(&[TokenType::TokenLeftBrace])?);
            if is_when_throw {
                tokens.push(factory.of_type(TokenType::TokenRightParen));
            }
            tokens.push(factory.of_type(TokenType::TokenNewline));
            Some(temp)
        };

        self.consume(TokenType::TokenLeftBrace, "Expect a '{' after when")?;
        self.consume(TokenType::TokenNewline, "Expect a newline after when '{'")?;

        let condition_ends = [TokenType::TokenOrOr, TokenType::TokenLeftBrace, TokenType::TokenEqualGreater];
        let mut first = true;
        let mut wrote_else = false;
        while !self.is_at_end() && !self.check(TokenType::TokenRightBrace) {
            self.match_all_newlines();
            if self.check(TokenType::TokenRightBrace) {
                break;
            }
            if self.match_token(TokenType::TokenElse) {
                wrote_else = true;
                tokens.push(self.previous().clone());
                tokens.extend(self.consume_next_block(true)?);
            } else if wrote_else {
                return Err(self.error_previous("'else' must be the last clause in a 'when' block"));
            } else {
                let mut opened = false;
                loop {
                    let op = if id.is_none() {
                        self.match_token(TokenType::TokenIf);
                        origin.with_type(TokenType::TokenIf)
                    } else if self.match_any(&[
                        TokenType::TokenIs,
                        TokenType::TokenIn,
                        TokenType::TokenNotIn,
                        TokenType::TokenNotIs,
                        TokenType::TokenIf,
                    ]) {
                        self.previous().clone()
                    } else {
                        origin.with_type(TokenType::TokenEqualEqual)
                    };
                    if !opened {
                        opened = true;
                        let if_token = op.with_type(TokenType::TokenIf);
                        if first {
                            first = false;
                        } else {
                            tokens.push(if_token.with_type(TokenType::TokenElse));
                        }
                        tokens.push(if_token);
                    }
                    if let (Some(id), false) = (&id, op.token_type == TokenType::TokenIf) {
                        tokens.push(id.clone());
                        tokens.push(op);
                    }
                    tokens.extend(self.consume_until_type(&condition_ends)?);
                    if self.match_token(TokenType::TokenOrOr) {
                        tokens.push(self.previous().clone());
                    }
                    if self.check(TokenType::TokenLeftBrace) || self.check(TokenType::TokenEqualGreater) {
                        break;
                    }
                    if self.is_at_end() {
                        return Err(self.error_current("Expect '{' or '=>' after when condition."));
                    }
                }
                tokens.extend(self.consume_next_block(true)?);
            }
            self.match_all_newlines();
        }
        self.consume(TokenType::TokenRightBrace, "Expect '}' at the end of when.")?;

        if is_expr && uses_temp {
            tokens.push(factory.of_type(TokenType::TokenEof));
            self.compile_as_called_lambda(tokens)
        } else {
            self.compile_nested(tokens, is_expr)?;
            if uses_temp {
                self.discard_last_local();
            }
            Ok(())
        }
    }

    fn for_statement(&mut self) -> Result<(), CompilerError> {
        let opener = self.current - 1;
        if self.peek_sequence(&[TokenType::TokenIdentifier, TokenType::TokenIn]) {
            return self.for_each_statement();
        }
        let factory = TokenFactory::new(self.previous());
        self.begin_scope();
        if !self.peek_sequence(&[TokenType::TokenIdentifier, TokenType::TokenEqual]) {
            return Err(self.error_current("Expect assignment at the start of for-loop."));
        }
        if self.assignment()? {
            self.emit_op(OpCode::Pop);
        }
        self.consume(TokenType::TokenNewline, "Expect newline after assignment.")?;
        let condition = self.consume_until_type(&[TokenType::TokenNewline])?;
        self.consume(TokenType::TokenNewline, "Expect newline after condition.")?;
        let mut increment = self.consume_until_type(&[TokenType::TokenLeftBrace])?;
        if !self.check(TokenType::TokenLeftBrace) {
            return Err(self.error_at(opener, "A for loop must include a block."));
        }
        let body = self.consume_next_block(false)?;
        increment.push(factory.of_type(TokenType::TokenNewline));

        let mut tokens = vec![factory.of_type(TokenType::TokenWhile)];
        tokens.extend(condition);
        tokens.extend(body);
        tokens.push(factory.of_type(TokenType::TokenNewline));
        self.pending_increment = Some(increment);
        self.compile_nested(tokens, false)?;
        self.end_scope(true);
        Ok(())
    }

    fn for_each_statement(&mut self) -> Result<(), CompilerError> {
        let opener = self.current - 1;
        let factory = TokenFactory::new(self.previous());
        let id = self.advance().clone();
        self.consume(TokenType::TokenIn, "Expect 'in' after identifier in 'foreach'.")?;
        let iterable = self.consume_until_type(&[TokenType::TokenLeftBrace])?;
        if !self.check(TokenType::TokenLeftBrace) {
            return Err(self.error_at(opener, "A foreach loop must include a block."));
        }
        let body = self.consume_next_block(false)?;

        let iterator = factory.named(&self.next_implicit_var_name("iterator"));
        let newline = factory.of_type(TokenType::TokenNewline);
        let mut tokens = vec![iterator.clone(), factory.of_type(TokenType::TokenEqual), factory.of_type(TokenType::TokenLeftParen)];
        tokens.extend(iterable);
        tokens.extend([
            factory.of_type(TokenType::TokenRightParen),
            factory.of_type(TokenType::TokenDot),
            factory.named(ITERATE),
            factory.of_type(TokenType::TokenLeftParen),
            factory.of_type(TokenType::TokenRightParen),
            newline.clone(),
            factory.of_type(TokenType::TokenWhile),
            iterator.clone(),
            factory.of_type(TokenType::TokenBangEqual),
            factory.of_type(TokenType::TokenNull),
        ]);
        for (index, token) in body.into_iter().enumerate() {
            tokens.push(token);
            if index == 0 {
                tokens.extend([
                    newline.clone(),
                    id.clone(),
                    factory.of_type(TokenType::TokenEqual),
                    iterator.clone(),
                    factory.of_type(TokenType::TokenDot),
                    factory.named(NEXT),
                    factory.of_type(TokenType::TokenLeftParen),
                    factory.of_type(TokenType::TokenRightParen),
                    newline.clone(),
                    factory.of_type(TokenType::TokenIf),
                    id.clone(),
                    factory.of_type(TokenType::TokenEqualEqual),
                    factory.of_type(TokenType::TokenNull),
                    factory.of_type(TokenType::TokenBreak),
                    newline.clone(),
                ]);
            }
        }
        self.compile_nested(tokens, false)?;
        self.discard_last_local();
        Ok(())
    }

    fn while_statement(&mut self) -> Result<(), CompilerError> {
        let increment = self.pending_increment.take();
        let start = self.code_len();
        self.compiler.loops.push(ActiveLoop { start, depth: self.compiler.scope_depth, ..Default::default() });
        self.expression()?;
        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement()?;

        let continues = self.compiler.loops.last_mut().map(|l| std::mem::take(&mut l.continues)).unwrap_or_default();
        for offset in continues {
            self.patch_jump(offset);
        }
        if let Some(increment) = increment {
            self.compile_nested(increment, false)?;
        }
        self.emit_with_i32(OpCode::Jump, start, Operand::None);
        let end = self.patch_jump(exit_jump);
        // Breaks already popped the condition inside the body, so they land past the exit POP.
        let breaks = self.compiler.loops.pop().map(|l| l.breaks).unwrap_or_default();
        for offset in breaks {
            self.patch_jump_to(offset, end + 1);
        }
        self.emit_op(OpCode::Pop);
        Ok(())
    }

    fn break_or_continue(&mut self, is_break: bool) -> Result<(), CompilerError> {
        let depth = match self.compiler.loops.last() {
            Some(active) => active.depth,
            None if is_break => return Err(self.error_previous("Cannot 'break' outside of a loop!")),
            None => return Err(self.error_previous("Cannot 'continue' outside of a loop!")),
        };
        let mut scope = self.compiler.scope_depth;
        while scope > depth {
            self.discard_locals(scope, true, true);
            scope -= 1;
        }
        let offset = self.emit_jump(OpCode::Jump);
        if let Some(active) = self.compiler.loops.last_mut() {
            if is_break {
                active.breaks.push(offset);
            } else {
                active.continues.push(offset);
            }
        }
        Ok(())
    }

    fn return_or_throw(&mut self, is_return: bool) -> Result<(), CompilerError> {
        let keyword = if is_return { "return" } else { "throw" };
        if self.compiler.kind == FunctionKind::Init {
            return Err(self.error_previous(format!("Can't {keyword} from init!")));
        }
        if self.check(TokenType::TokenNewline) || self.check(TokenType::TokenRightBrace) || self.is_at_end() {
            self.match_token(TokenType::TokenNewline);
            self.emit_op(OpCode::Nil);
        } else {
            if !self.expression()? {
                self.emit_op(OpCode::Nil);
            }
            self.check_if_unidentified()?;
            if !self.check(TokenType::TokenRightBrace) && !self.is_at_end() {
                self.consume(TokenType::TokenNewline, &format!("Expect newline after {keyword} value."))?;
            }
        }
        self.emit_scope_return(if is_return { OpCode::Return } else { OpCode::Throw });
        Ok(())
    }

    fn class_declaration(&mut self) -> Result<(), CompilerError> {
        let kind = match self.previous().token_type {
            TokenType::TokenEffect => ClassKind::Effect,
            TokenType::TokenStance => ClassKind::Stance,
            TokenType::TokenScenario => ClassKind::Scenario,
            TokenType::TokenAi => ClassKind::Ai,
            _ => ClassKind::Custom,
        };
        let name = self.consume_identifier("Expect class name.")?;
        self.declare_local(&name, true, false)?;
        self.emit_class(&name, kind);
        self.classes.push(ClassCompiler::new(Rc::clone(&name), kind));

        if self.match_token(TokenType::TokenIs) {
            self.superclasses(&name, kind)?;
        }

        let mut deferred_init = None;
        if self.match_token(TokenType::TokenLeftBrace) {
            loop {
                self.match_all_newlines();
                if self.is_at_end() || self.check(TokenType::TokenRightBrace) {
                    break;
                }
                self.match_token(TokenType::TokenFn);
                if !self.match_token(TokenType::TokenIdentifier) {
                    return Err(self.error_current("Invalid line in class declaration."));
                }
                let field_index = self.current - 1;
                let field: Rc<str> = Rc::from(self.previous().lexeme.as_str());
                if let Some(class) = self.classes.last_mut() {
                    class.declared_fields.insert(Rc::clone(&field));
                }
                if self.match_token(TokenType::TokenEqual) {
                    self.field_initializer(field_index)?;
                } else if field.as_ref() == INIT {
                    // Compiled after the body so every field initializer is known.
                    deferred_init = Some(self.current);
                    self.skip_function()?;
                } else {
                    self.method(field, false)?;
                }
            }
            self.consume(TokenType::TokenRightBrace, "Expect '}' after class body.")?;
        } else if !self.is_at_end() {
            self.consume(TokenType::TokenNewline, "Expect newline after empty class declaration.")?;
        }

        match deferred_init {
            Some(position) => {
                let resume = self.current;
                self.current = position;
                self.method(Rc::from(INIT), false)?;
                self.current = resume;
            }
            None => self.method(Rc::from(INIT), true)?,
        }

        self.validate_class_fields()?;
        self.emit_op(OpCode::ClassDeclrDone);
        if let Some(class) = self.classes.pop() {
            self.compiled_classes.insert(Rc::clone(&class.name), class);
        }
        Ok(())
    }

    fn superclasses(&mut self, name: &Rc<str>, kind: ClassKind) -> Result<(), CompilerError> {
        let mut superclasses = Vec::new();
        loop {
            let superclass = self.consume_identifier("Expect superclass name.")?;
            if superclass == *name {
                return Err(self.error_previous("A class cannot inherit from itself!"));
            }
            match self.compiled_classes.get(&superclass) {
                None => return Err(self.error_previous(format!("Can't find a class named {superclass}."))),
                Some(class) if class.kind != kind => {
                    return Err(self.error_previous("A class must inherit a class of the same type!"))
                }
                Some(_) => superclasses.push(superclass),
            }
            if !self.match_token(TokenType::TokenComma) {
                break;
            }
        }
        // Later superclasses overwrite earlier ones on conflicting names.
        for superclass in &superclasses {
            self.variable(superclass)?;
            self.emit_op(OpCode::Inherit);
        }
        if let Some(class) = self.classes.last_mut() {
            class.superclasses = superclasses;
        }
        Ok(())
    }

    fn field_initializer(&mut self, field_index: usize) -> Result<(), CompilerError> {
        let field = self.tokens[field_index].clone();
        let factory = TokenFactory::new(&field);
        let mut tokens = vec![factory.this(), factory.of_type(TokenType::TokenDot), field, self.previous().clone()];
        let value = self.consume_next_expr();
        if value.is_empty() {
            return Err(self.error_current("Expect expression."));
        }
        tokens.extend(value);
        tokens.push(factory.of_type(TokenType::TokenNewline));
        if !self.check(TokenType::TokenRightBrace) {
            self.consume(TokenType::TokenNewline, "Expect newline after class field declaration.")?;
        }
        if let Some(class) = self.classes.last_mut() {
            class.init_tokens.extend(tokens);
        }
        Ok(())
    }

    fn skip_function(&mut self) -> Result<(), CompilerError> {
        if self.check(TokenType::TokenLeftParen) {
            let mut depth = 0;
            loop {
                if self.is_at_end() {
                    return Err(self.error_current("Expect ')' after params."));
                }
                match self.advance().token_type {
                    TokenType::TokenLeftParen => depth += 1,
                    TokenType::TokenRightParen => {
                        depth -= 1;
                        if depth == 0 {
                            break;
                        }
                    }
                    _ => {}
                }
            }
        }
        if self.check(TokenType::TokenLeftBrace) {
            self.consume_next_block(false)?;
        } else if self.match_token(TokenType::TokenEqualGreater) {
            self.consume_next_expr();
        }
        Ok(())
    }

    fn validate_class_fields(&self) -> Result<(), CompilerError> {
        let class = match self.classes.last() {
            Some(class) => class,
            None => return Ok(()),
        };
        let required = class.required_fields();
        if required.is_empty() {
            return Ok(());
        }
        let mut current = Some(class);
        while let Some(candidate) = current {
            if required.iter().all(|field| candidate.declared_fields.contains(*field)) {
                return Ok(());
            }
            current = candidate.superclasses.first().and_then(|name| self.compiled_classes.get(name));
        }
        Err(self.error_previous(format!("Unable to find required fields {} in {}!", required.join(", "), class.name)))
    }

    fn method(&mut self, name: Rc<str>, is_synthesized: bool) -> Result<(), CompilerError> {
        let kind = if name.as_ref() == INIT { FunctionKind::Init } else { FunctionKind::Method };
        self.function(kind, Some(Rc::clone(&name)), false, is_synthesized)?;
        let index = self.make_constant(Value::Str(Rc::clone(&name)));
        self.emit_with_i32(OpCode::Method, index, Operand::Name(name));
        Ok(())
    }

    fn function(
        &mut self,
        kind: FunctionKind,
        name: Option<Rc<str>>,
        declare: bool,
        is_synthesized: bool,
    ) -> Result<(), CompilerError> {
        let declaration_index = self.current.saturating_sub(1);
        let name = match name {
            Some(name) => name,
            None => self.consume_identifier("Expect an identifier for function name.")?,
        };
        if declare {
            self.declare_local(&name, false, false)?;
        }

        let mut args = if is_synthesized { ArgList::default() } else { self.params(kind)? };
        if kind == FunctionKind::Init {
            if let Some(class) = self.classes.last() {
                let mut prepended = class.init_tokens.clone();
                prepended.append(&mut args.prepended);
                args.prepended = prepended;
            }
        }

        let (is_expr_body, has_body) = if is_synthesized {
            (false, false)
        } else if self.match_token(TokenType::TokenEqualGreater) {
            (true, true)
        } else if self.match_token(TokenType::TokenLeftBrace) {
            (false, true)
        } else {
            if !self.check(TokenType::TokenRightBrace) && !self.is_at_end() {
                self.consume(TokenType::TokenNewline, "Expect '{', '=>' or newline to start func.")?;
            }
            (false, false)
        };
        if kind == FunctionKind::Lambda && has_body && args.names.is_empty() {
            args.names = self.scan_for_implicit_args(declaration_index, is_expr_body)?;
        }

        self.begin_function(kind, &name);
        for arg in &args.names {
            self.declare_local(arg, false, false)?;
        }
        self.compiler.function.arity = args.names.len();
        self.compiler.function.optional_params_start = args.optional_start;
        self.compiler.function.default_values = args.defaults;

        if is_expr_body {
            if !self.expression()? {
                self.emit_op(OpCode::Nil);
            }
            self.check_if_unidentified()?;
        } else {
            if !args.prepended.is_empty() {
                self.compile_nested(args.prepended, false)?;
            }
            if has_body {
                self.block()?;
            }
            if kind == FunctionKind::Init {
                self.emit_with_i32(OpCode::GetLocal, 0, Operand::Local { slot: 0, is_const: true });
            } else {
                self.emit_op(OpCode::Nil);
            }
        }
        self.emit_scope_return(OpCode::Return);
        let (function, upvalues) = self.end_function()?;
        self.emit_closure(function, upvalues);
        Ok(())
    }

    fn params(&mut self, kind: FunctionKind) -> Result<ArgList, CompilerError> {
        let mut args = ArgList::default();
        if !self.match_token(TokenType::TokenLeftParen) {
            return Ok(args);
        }
        self.match_all_newlines();
        if !self.check(TokenType::TokenRightParen) {
            loop {
                self.match_all_newlines();
                let is_autoset = self.match_sequence(&[TokenType::TokenThis, TokenType::TokenDot]);
                if is_autoset && kind != FunctionKind::Init {
                    return Err(self.error_previous("Autoset arguments are only allowed in initializers!"));
                }
                let name = self.consume_identifier("Expect param name.")?;
                let name_token = self.previous().clone();
                if self.match_token(TokenType::TokenEqual) {
                    let value = self.consume_value("Expected a value as default param value!")?;
                    args.optional_start.get_or_insert(args.names.len());
                    args.defaults.push(value);
                } else if args.optional_start.is_some() {
                    return Err(self.error_previous("Params with default values must come last."));
                }
                if is_autoset {
                    let factory = TokenFactory::new(&name_token);
                    args.prepended.extend([
                        factory.this(),
                        factory.of_type(TokenType::TokenDot),
                        name_token.clone(),
                        factory.of_type(TokenType::TokenEqual),
                        name_token,
                        factory.of_type(TokenType::TokenNewline),
                    ]);
                }
                args.names.push(name);
                self.match_all_newlines();
                if !self.match_token(TokenType::TokenComma) {
                    break;
                }
            }
        }
        self.consume(TokenType::TokenRightParen, "Expect ')' after params.")?;
        Ok(args)
    }

    fn scan_for_implicit_args(&mut self, declaration_index: usize, is_expr: bool) -> Result<Vec<Rc<str>>, CompilerError> {
        let saved = self.current;
        let body = if is_expr {
            self.scan_next_expr()
        } else {
            self.current -= 1;
            self.consume_next_block(false)?
        };
        self.current = saved;

        let found: BTreeSet<usize> = body
            .iter()
            .filter(|token| token.token_type == TokenType::TokenIdentifier)
            .filter_map(|token| implicit_arg_index(&token.lexeme))
            .collect();
        let mut names = Vec::with_capacity(found.len());
        for (expected, index) in found.into_iter().enumerate() {
            if index != expected {
                return Err(
                    self.error_at(declaration_index, format!("Invalid implicit arg order, found ${index} instead of ${expected}"))
                );
            }
            names.push(Rc::from(format!("${index}")));
        }
        Ok(names)
    }

    fn consume_value(&mut self, message: &str) -> Result<Value, CompilerError> {
        let negate = self.match_token(TokenType::TokenMinus);
        if self.is_at_end() {
            return Err(self.error_current(message));
        }
        let token = self.advance().clone();
        let value = match (token.token_type, &token.literal) {
            (TokenType::TokenNumber, Some(Literal::Int(value))) => Value::Int(if negate { -value } else { *value }),
            (TokenType::TokenNumber, Some(Literal::Float(value))) => Value::Float(if negate { -value } else { *value }),
            (TokenType::TokenString, Some(Literal::Str(value))) if !negate => Value::Str(Rc::clone(value)),
            (TokenType::TokenTrue, _) if !negate => Value::Bool(true),
            (TokenType::TokenFalse, _) if !negate => Value::Bool(false),
            (TokenType::TokenNull, _) if !negate => Value::Nil,
            _ => return Err(self.error_previous(message)),
        };
        Ok(value)
    }

    fn expression(&mut self) -> Result<bool, CompilerError> {
        self.assignment()
    }

    /// Returns whether a value was left on the stack; assignments leave none.
    fn assignment(&mut self) -> Result<bool, CompilerError> {
        self.first_non_assignment(false)?;
        if !self.match_any(&ASSIGNMENT_OPERATORS) {
            return Ok(true);
        }
        let operator = self.previous().token_type;
        let last = match self.compiler.emitted.last() {
            Some(last) => last.clone(),
            None => return Err(self.error_previous("Assigning to undeclared var!")),
        };
        match last.op {
            OpCode::GetSuper => Err(self.error_previous("Setters aren't allowed with 'super'.")),
            OpCode::GetProp => {
                self.roll_back_last();
                let declared_field = match self.compiler.emitted.last() {
                    Some(Emitted { op: OpCode::ConstId, operand: Operand::Name(name), .. })
                        if self.compiler.kind == FunctionKind::Init && operator == TokenType::TokenEqual =>
                    {
                        Some(Rc::clone(name))
                    }
                    _ => None,
                };
                self.first_non_assignment(true)?;
                match compound_op(operator) {
                    Some(op) => self.emit_update_prop(op),
                    None => self.emit_op(OpCode::SetProp),
                }
                if let (Some(field), Some(class)) = (declared_field, self.classes.last_mut()) {
                    class.declared_fields.insert(field);
                }
                Ok(false)
            }
            OpCode::ConstId if operator == TokenType::TokenEqual => {
                let name = match &last.operand {
                    Operand::Name(name) => Rc::clone(name),
                    _ => return Err(self.error_previous("Assigning to undeclared var!")),
                };
                self.roll_back_last();
                let index = self.declare_local(&name, false, true)?;
                self.first_non_assignment(true)?;
                self.compiler.locals[index].pending = false;
                Ok(false)
            }
            _ => {
                self.reassignment(operator, &last)?;
                Ok(false)
            }
        }
    }

    fn reassignment(&mut self, operator: TokenType, last: &Emitted) -> Result<(), CompilerError> {
        let (set_op, index, is_const) = match last.operand {
            Operand::Local { slot, is_const } => (OpCode::SetLocal, slot, is_const),
            Operand::Upvalue { index, is_const } => (OpCode::SetUpvalue, index, is_const),
            _ => return Err(self.error_previous("Assigning to undeclared var!")),
        };
        if is_const {
            return Err(self.error_previous("Can't assign to a const!"));
        }
        let compound = compound_op(operator);
        if compound.is_none() {
            self.roll_back_last();
        }
        self.first_non_assignment(true)?;
        if let Some(op) = compound {
            self.emit_op(op);
        }
        self.emit_with_i32(set_op, index, Operand::None);
        Ok(())
    }

    fn first_non_assignment(&mut self, check_unresolved: bool) -> Result<(), CompilerError> {
        self.parse_precedence(Precedence::Rescue, check_unresolved)
    }

    fn parse_precedence(&mut self, precedence: Precedence, check_unresolved: bool) -> Result<(), CompilerError> {
        self.unary(check_unresolved)?;
        loop {
            let rule = get_rule(self.peek().token_type);
            let infix = match rule.infix {
                Some(infix) if precedence <= rule.precedence => infix,
                _ => break,
            };
            self.advance();
            infix(self, check_unresolved)?;
        }
        Ok(())
    }

    fn rescue(&mut self, check_unresolved: bool) -> Result<(), CompilerError> {
        let else_jump = self.emit_jump(OpCode::JumpIfThrown);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        if self.match_token(TokenType::TokenThrow) {
            self.emit_return(OpCode::Throw, &[]);
        } else {
            self.emit_op(OpCode::Pop);
            self.parse_precedence(Precedence::Or, check_unresolved)?;
        }
        self.patch_jump(end_jump);
        Ok(())
    }

    fn or(&mut self, check_unresolved: bool) -> Result<(), CompilerError> {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And, check_unresolved)?;
        self.patch_jump(end_jump);
        Ok(())
    }

    fn and(&mut self, check_unresolved: bool) -> Result<(), CompilerError> {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Equality, check_unresolved)?;
        self.patch_jump(end_jump);
        Ok(())
    }

    fn nil_coalesce(&mut self, check_unresolved: bool) -> Result<(), CompilerError> {
        let else_jump = self.emit_jump(OpCode::JumpIfNil);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Unary, check_unresolved)?;
        self.patch_jump(end_jump);
        Ok(())
    }

    fn range(&mut self, check_unresolved: bool) -> Result<(), CompilerError> {
        let operator = self.previous().token_type;
        self.parse_precedence(Precedence::Range.next(), check_unresolved)?;
        if operator == TokenType::TokenDotDot {
            self.emit_int(1);
            self.emit_op(OpCode::Subtract);
        }
        self.emit_op(OpCode::RangeTo);
        Ok(())
    }

    fn binary(&mut self, check_unresolved: bool) -> Result<(), CompilerError> {
        let operator = self.previous().token_type;
        let rule = get_rule(operator);
        self.parse_precedence(rule.precedence.next(), check_unresolved)?;
        match operator {
            TokenType::TokenEqualEqual => self.emit_op(OpCode::Eq),
            TokenType::TokenBangEqual => self.emit_ops(&[OpCode::Eq, OpCode::Invert]),
            TokenType::TokenIs => self.emit_op(OpCode::Is),
            TokenType::TokenNotIs => self.emit_ops(&[OpCode::Is, OpCode::Invert]),
            TokenType::TokenIn => self.emit_op(OpCode::Has),
            TokenType::TokenNotIn => self.emit_ops(&[OpCode::Has, OpCode::Invert]),
            TokenType::TokenGreater => self.emit_op(OpCode::Gt),
            TokenType::TokenGreaterEqual => self.emit_op(OpCode::Ge),
            TokenType::TokenLess => self.emit_op(OpCode::Lt),
            TokenType::TokenLessEqual => self.emit_op(OpCode::Le),
            TokenType::TokenPlus => self.emit_op(OpCode::Add),
            TokenType::TokenMinus => self.emit_op(OpCode::Subtract),
            TokenType::TokenStar => self.emit_op(OpCode::Multiply),
            TokenType::TokenSlash => self.emit_op(OpCode::Divide),
            TokenType::TokenSlashSlash => self.emit_op(OpCode::DivideInt),
            TokenType::TokenMod => self.emit_op(OpCode::Mod),
            _ => return Err(self.error_previous("Unknown binary operator.")),
        }
        Ok(())
    }

    fn unary(&mut self, check_unresolved: bool) -> Result<(), CompilerError> {
        if self.match_any(&[TokenType::TokenBang, TokenType::TokenMinus]) {
            let operator = self.previous().token_type;
            self.unary(check_unresolved)?;
            self.emit_op(if operator == TokenType::TokenBang { OpCode::Invert } else { OpCode::Negate });
        } else if self.match_token(TokenType::TokenCatch) {
            self.unary(check_unresolved)?;
            self.emit_op(OpCode::UnboxThrown);
        } else {
            self.call(check_unresolved)?;
        }
        Ok(())
    }

    fn call(&mut self, check_unresolved: bool) -> Result<(), CompilerError> {
        self.primary(check_unresolved)?;
        // Only the accessor right after `super` reads from the superclass.
        let mut is_super = self.last_op() == Some(OpCode::Super);
        loop {
            if self.match_token(TokenType::TokenLeftParen) {
                self.check_if_unidentified()?;
                let argc = self.argument_list()?;
                self.emit_with_i32(OpCode::Call, argc, Operand::None);
            } else if self.match_any(&[
                TokenType::TokenDot,
                TokenType::TokenQuestionDot,
                TokenType::TokenDotComma,
                TokenType::TokenQuestionDotComma,
                TokenType::TokenColonColon,
            ]) {
                let accessor = self.previous().token_type;
                self.member(accessor, is_super)?;
            } else {
                break;
            }
            is_super = false;
        }
        Ok(())
    }

    fn member(&mut self, accessor: TokenType, is_super: bool) -> Result<(), CompilerError> {
        let null_safe = matches!(accessor, TokenType::TokenQuestionDot | TokenType::TokenQuestionDotComma);
        let cascade = matches!(accessor, TokenType::TokenDotComma | TokenType::TokenQuestionDotComma);
        if accessor == TokenType::TokenColonColon {
            let name = self.consume_member_name()?;
            self.emit_id(&name);
            return self.finish_get(is_super);
        }
        if self.match_token(TokenType::TokenLeftParen) {
            self.expression()?;
            self.consume(TokenType::TokenRightParen, "Expect ')' after evaluated getter.")?;
            return self.finish_get(is_super);
        }
        if let (TokenType::TokenNumber, Some(Literal::Int(index))) = (self.peek().token_type, &self.peek().literal) {
            let index = *index;
            self.advance();
            self.emit_int(index);
            return self.finish_get(is_super);
        }
        let name = self.consume_member_name()?;
        if self.match_token(TokenType::TokenLeftParen) {
            let argc = self.argument_list()?;
            self.emit_invoke(&name, argc, is_super, null_safe, cascade);
        } else if ASSIGNMENT_OPERATORS.contains(&self.peek().token_type) {
            self.emit_id(&name);
            self.finish_get(is_super)?;
        } else {
            self.emit_invoke(&name, 0, is_super, null_safe, cascade);
        }
        Ok(())
    }

    fn consume_member_name(&mut self) -> Result<Rc<str>, CompilerError> {
        if self.match_token(TokenType::TokenIdentifier) {
            Ok(Rc::from(self.previous().lexeme.as_str()))
        } else if self.match_token(TokenType::TokenString) {
            Ok(string_literal(self.previous()))
        } else {
            Err(self.error_current("Expect property name after '.'."))
        }
    }

    fn finish_get(&mut self, is_super: bool) -> Result<(), CompilerError> {
        if is_super {
            if self.last_op() != Some(OpCode::ConstId) {
                return Err(self.error_previous("'super' get can only involve an identifier."));
            }
            self.emit_op(OpCode::GetSuper);
        } else {
            self.emit_op(OpCode::GetProp);
        }
        Ok(())
    }

    fn argument_list(&mut self) -> Result<usize, CompilerError> {
        let mut count = 0;
        self.match_all_newlines();
        if !self.check(TokenType::TokenRightParen) {
            loop {
                self.match_all_newlines();
                // Named arguments are positional; the name is documentation.
                self.match_sequence(&[TokenType::TokenIdentifier, TokenType::TokenColon]);
                self.expression()?;
                self.check_if_unidentified()?;
                count += 1;
                self.match_all_newlines();
                if !self.match_token(TokenType::TokenComma) {
                    break;
                }
            }
        }
        self.consume(TokenType::TokenRightParen, "Expect ')' after arguments.")?;
        Ok(count)
    }

    fn primary(&mut self, check_unresolved: bool) -> Result<(), CompilerError> {
        if self.check(TokenType::TokenEqualGreater) {
            let name = self.next_lambda_name();
            return self.function(FunctionKind::Lambda, Some(Rc::from(name)), false, false);
        }
        if self.is_at_end() {
            return Err(self.error_current("Expect expression."));
        }
        let token = self.advance().clone();
        match token.token_type {
            TokenType::TokenFalse => self.emit_op(OpCode::False),
            TokenType::TokenTrue => self.emit_op(OpCode::True),
            TokenType::TokenNull => self.emit_op(OpCode::Nil),
            TokenType::TokenString => self.emit_constant(Value::Str(string_literal(&token))),
            TokenType::TokenNumber => match token.literal {
                Some(Literal::Int(value)) => self.emit_int(value),
                Some(Literal::Float(value)) => self.emit_float(value),
                _ => return Err(self.error_previous("Invalid number literal.")),
            },
            TokenType::TokenSuper => {
                let superclass = match self.classes.last() {
                    None => return Err(self.error_previous("Cannot use 'super' outside of a class.")),
                    Some(class) => match class.superclasses.first() {
                        Some(superclass) => Rc::clone(superclass),
                        None => return Err(self.error_previous("Cannot use 'super' in a class with no superclass.")),
                    },
                };
                let index = self.make_constant(Value::Str(Rc::clone(&superclass)));
                self.emit_with_i32(OpCode::Super, index, Operand::Name(superclass));
            }
            TokenType::TokenThis => {
                if self.classes.is_empty() {
                    return Err(self.error_previous("Cannot use 'this' outside of class."));
                }
                self.variable(THIS)?;
            }
            TokenType::TokenLeftBracket => self.object_literal()?,
            TokenType::TokenFn => {
                let name = self.next_lambda_name();
                self.function(FunctionKind::Lambda, Some(Rc::from(name)), false, false)?;
            }
            TokenType::TokenIdentifier => {
                let name = token.lexeme.as_str();
                if self.compiler.find_local(name, false).is_none() && self.is_implicit_field(name) {
                    self.variable(THIS)?;
                    self.emit_id(name);
                    self.emit_op(OpCode::GetProp);
                } else {
                    self.variable(name)?;
                    if check_unresolved {
                        self.check_if_unidentified()?;
                    }
                }
            }
            TokenType::TokenLeftParen => {
                self.match_all_newlines();
                self.expression()?;
                self.match_all_newlines();
                self.consume(TokenType::TokenRightParen, "Expect ')' after expression.")?;
            }
            TokenType::TokenIf => self.if_something(true)?,
            TokenType::TokenWhen => self.when_something(true)?,
            TokenType::TokenYield => {
                if self.check(TokenType::TokenNewline)
                    || self.check(TokenType::TokenRightBrace)
                    || self.check(TokenType::TokenRightParen)
                    || self.is_at_end()
                {
                    self.emit_op(OpCode::Nil);
                } else if !self.expression()? {
                    self.emit_op(OpCode::Nil);
                }
                self.emit_op(OpCode::Yield);
            }
            _ => return Err(self.error_previous("Expect expression.")),
        }
        Ok(())
    }

    fn object_literal(&mut self) -> Result<(), CompilerError> {
        let mut count = 0;
        let mut is_list = None;
        if self.match_token(TokenType::TokenRightBracket) {
            is_list = Some(true);
        } else if self.match_sequence(&[TokenType::TokenColon, TokenType::TokenRightBracket]) {
            is_list = Some(false);
        } else {
            loop {
                self.match_all_newlines();
                if count > 0 && self.check(TokenType::TokenRightBracket) {
                    break;
                }
                let list = *is_list.get_or_insert_with(|| {
                    !(self.peek_sequence(&[TokenType::TokenIdentifier, TokenType::TokenColon])
                        || self.peek_sequence(&[TokenType::TokenString, TokenType::TokenColon]))
                });
                if list {
                    self.expression()?;
                } else {
                    let key = if self.match_token(TokenType::TokenString) {
                        string_literal(self.previous())
                    } else {
                        self.consume_identifier("Expect identifier or string as object key.")?
                    };
                    self.emit_constant(Value::Str(key));
                    self.consume(TokenType::TokenColon, "Expect ':' between object key and value pair.")?;
                    self.match_all_newlines();
                    self.expression()?;
                }
                count += 1;
                self.match_all_newlines();
                if !self.match_token(TokenType::TokenComma) {
                    break;
                }
            }
            self.match_all_newlines();
            self.consume(TokenType::TokenRightBracket, "Expect ']' at the end of object.")?;
        }
        let op = if is_list == Some(false) { OpCode::Object } else { OpCode::List };
        self.emit_with_i32(op, count, Operand::None);
        Ok(())
    }

    fn variable(&mut self, name: &str) -> Result<(), CompilerError> {
        if let Some(index) = self.compiler.find_local(name, false) {
            let local = &self.compiler.locals[index];
            let operand = Operand::Local { slot: local.slot, is_const: local.is_const };
            let slot = local.slot;
            self.emit_with_i32(OpCode::GetLocal, slot, operand);
        } else if let Some(index) = self.resolve_upvalue(self.enclosing.len(), name) {
            let is_const = self.compiler.upvalues[index].is_const;
            self.emit_with_i32(OpCode::GetUpvalue, index, Operand::Upvalue { index, is_const });
        } else {
            self.emit_id(name);
        }
        Ok(())
    }

    /// Bare names inside a method fall back to fields of the class being
    /// declared or of any of its superclasses.
    fn is_implicit_field(&self, name: &str) -> bool {
        let mut pending: Vec<&ClassCompiler> = self.classes.last().into_iter().collect();
        while let Some(class) = pending.pop() {
            if class.declared_fields.contains(name) {
                return true;
            }
            pending.extend(class.superclasses.iter().filter_map(|s| self.compiled_classes.get(s)));
        }
        false
    }

    fn compiler_at(&mut self, level: usize) -> &mut FunctionCompiler {
        if level < self.enclosing.len() {
            &mut self.enclosing[level]
        } else {
            &mut self.compiler
        }
    }

    fn resolve_upvalue(&mut self, level: usize, name: &str) -> Option<usize> {
        if level == 0 {
            return None;
        }
        let outer = level - 1;
        if let Some(index) = self.compiler_at(outer).find_local(name, true) {
            let compiler = self.compiler_at(outer);
            compiler.locals[index].is_captured = true;
            let local = &compiler.locals[index];
            let upvalue = Upvalue {
                index: local.slot,
                is_local: true,
                is_const: local.is_const,
                fiber_name: Rc::clone(&compiler.function.name),
            };
            return Some(self.add_upvalue(level, upvalue));
        }
        let index = self.resolve_upvalue(outer, name)?;
        let compiler = self.compiler_at(outer);
        let parent = &compiler.upvalues[index];
        let upvalue = Upvalue {
            index,
            is_local: false,
            is_const: parent.is_const,
            fiber_name: Rc::clone(&parent.fiber_name),
        };
        Some(self.add_upvalue(level, upvalue))
    }

    fn add_upvalue(&mut self, level: usize, upvalue: Upvalue) -> usize {
        let compiler = self.compiler_at(level);
        if let Some(existing) = compiler.upvalues.iter().position(|u| {
            u.index == upvalue.index && u.is_local == upvalue.is_local && u.fiber_name == upvalue.fiber_name
        }) {
            return existing;
        }
        compiler.upvalues.push(upvalue);
        compiler.upvalues.len() - 1
    }

    fn declare_local(&mut self, name: &str, is_const: bool, pending: bool) -> Result<usize, CompilerError> {
        let depth = self.compiler.scope_depth;
        let duplicate = self
            .compiler
            .locals
            .iter()
            .rev()
            .take_while(|local| local.depth >= depth)
            .any(|local| local.name.as_ref() == name);
        if duplicate {
            return Err(self.error_previous(format!("Variable {name} is already declared in scope!")));
        }
        let slot = self.compiler.locals.iter().filter(|local| !local.pending).count();
        let start = self.code_len();
        let debug_index = self.compiler.function.debug_info.as_mut().map(|info| info.open_local(name, slot, start));
        self.compiler.locals.push(Local {
            name: Rc::from(name),
            slot,
            depth,
            is_captured: false,
            is_const: is_const || is_const_name(name),
            pending,
            debug_index,
        });
        Ok(self.compiler.locals.len() - 1)
    }

    fn begin_scope(&mut self) {
        self.compiler.scope_depth += 1;
    }

    /// Returns how many locals the scope held.
    fn end_scope(&mut self, emit_pops: bool) -> usize {
        let count = self.discard_locals(self.compiler.scope_depth, emit_pops, false);
        self.compiler.scope_depth -= 1;
        count
    }

    fn scope_range(&self, depth: i32) -> Option<(usize, usize)> {
        let last = self.compiler.locals.iter().rposition(|local| local.depth == depth)?;
        let first = self.compiler.locals[..last].iter().rposition(|local| local.depth != depth).map_or(0, |i| i + 1);
        Some((first, last))
    }

    /// Codes that drop the locals of one scope, innermost first.
    fn scope_exit_codes(&self, depth: i32) -> Vec<OpCode> {
        match self.scope_range(depth) {
            Some((first, last)) => self.compiler.locals[first..=last]
                .iter()
                .rev()
                .map(|local| if local.is_captured { OpCode::CloseUpvalue } else { OpCode::Pop })
                .collect(),
            None => Vec::new(),
        }
    }

    fn discard_locals(&mut self, depth: i32, emit_pops: bool, keep_locals: bool) -> usize {
        let codes = self.scope_exit_codes(depth);
        if emit_pops {
            self.emit_ops(&codes);
        }
        if !keep_locals {
            if let Some((first, last)) = self.scope_range(depth) {
                let end = self.code_len();
                let removed: Vec<Local> = self.compiler.locals.drain(first..=last).collect();
                self.close_debug_locals(&removed, end);
            }
        }
        codes.len()
    }

    fn discard_last_local(&mut self) {
        if let Some(local) = self.compiler.locals.pop() {
            self.emit_op(if local.is_captured { OpCode::CloseUpvalue } else { OpCode::Pop });
            let end = self.code_len();
            self.close_debug_locals(&[local], end);
        }
    }

    fn close_debug_locals(&mut self, locals: &[Local], end: usize) {
        if let Some(info) = self.compiler.function.debug_info.as_mut() {
            for index in locals.iter().filter_map(|local| local.debug_index) {
                info.close_local(index, end);
            }
        }
    }

    fn begin_function(&mut self, kind: FunctionKind, name: &str) {
        let compiler = FunctionCompiler::new(kind, name, self.is_debug);
        let outer = std::mem::replace(&mut self.compiler, compiler);
        self.enclosing.push(outer);
        self.begin_scope();
    }

    fn end_function(&mut self) -> Result<(ObjectFunction, Vec<Upvalue>), CompilerError> {
        let outer = match self.enclosing.pop() {
            Some(outer) => outer,
            None => return Err(self.error_previous("Can't end the top-level function.")),
        };
        let compiler = std::mem::replace(&mut self.compiler, outer);
        Ok(Self::finish(compiler))
    }

    fn finish(compiler: FunctionCompiler) -> (ObjectFunction, Vec<Upvalue>) {
        let FunctionCompiler { mut function, upvalues, .. } = compiler;
        function.upvalue_count = upvalues.len();
        let end = function.chunk.code.len();
        if let Some(info) = function.debug_info.as_mut() {
            info.close_open_locals(end);
        }
        debug_feature::print_code(&function);
        (function, upvalues)
    }

    fn check_if_unidentified(&self) -> Result<(), CompilerError> {
        if let Some(Emitted { op: OpCode::ConstId, operand: Operand::Name(name), .. }) = self.compiler.emitted.last() {
            return Err(self.error_previous(format!("Unable to resolve identifier: {name}")));
        }
        Ok(())
    }

    fn update_debug_info(&mut self) {
        if !self.is_debug {
            return;
        }
        let token = self.peek();
        let pointer = CodePointer::new(Rc::clone(&token.file), token.line);
        let has_breakpoint = token.has_breakpoint;
        let offset = self.code_len();
        if let Some(info) = self.compiler.function.debug_info.as_mut() {
            info.mark_line(pointer, offset, has_breakpoint);
        }
    }

    fn next_lambda_name(&mut self) -> String {
        self.lambda_count += 1;
        format!("__lambda_{}_{}__", self.enclosing.len(), self.lambda_count)
    }

    fn next_implicit_var_name(&mut self, opener: &str) -> String {
        self.implicit_var_count += 1;
        format!("__{}_{}_{}__", opener, self.enclosing.len(), self.implicit_var_count)
    }

    // Token stream

    fn token_at(&self, index: usize) -> &Token {
        &self.tokens[index.min(self.tokens.len() - 1)]
    }

    fn peek(&self) -> &Token {
        self.token_at(self.current)
    }

    fn previous(&self) -> &Token {
        self.token_at(self.current.saturating_sub(1))
    }

    fn is_at_end(&self) -> bool {
        self.peek().token_type == TokenType::TokenEof
    }

    fn advance(&mut self) -> &Token {
        if !self.is_at_end() {
            self.current += 1;
        }
        self.previous()
    }

    fn check(&self, token_type: TokenType) -> bool {
        self.peek().token_type == token_type
    }

    fn match_token(&mut self, token_type: TokenType) -> bool {
        if !self.check(token_type) || self.is_at_end() {
            return false;
        }
        self.advance();
        true
    }

    fn match_any(&mut self, token_types: &[TokenType]) -> bool {
        token_types.iter().any(|token_type| self.match_token(*token_type))
    }

    fn match_all_newlines(&mut self) {
        while self.match_token(TokenType::TokenNewline) {}
    }

    fn peek_sequence(&self, token_types: &[TokenType]) -> bool {
        if self.current + token_types.len() >= self.tokens.len() {
            return false;
        }
        token_types.iter().enumerate().all(|(i, token_type)| self.tokens[self.current + i].token_type == *token_type)
    }

    fn match_sequence(&mut self, token_types: &[TokenType]) -> bool {
        if self.peek_sequence(token_types) {
            self.current += token_types.len();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, token_type: TokenType, message: &str) -> Result<(), CompilerError> {
        if self.match_token(token_type) {
            Ok(())
        } else {
            Err(self.error_current(message))
        }
    }

    fn consume_identifier(&mut self, message: &str) -> Result<Rc<str>, CompilerError> {
        self.consume(TokenType::TokenIdentifier, message)?;
        Ok(Rc::from(self.previous().lexeme.as_str()))
    }

    fn consume_until_type(&mut self, token_types: &[TokenType]) -> Result<Vec<Token>, CompilerError> {
        let start = self.current;
        while !self.is_at_end() && !token_types.contains(&self.peek().token_type) {
            if self.check(TokenType::TokenNewline) {
                return Err(self.error_current("Unreachable token types!"));
            }
            self.current += 1;
        }
        Ok(self.tokens[start..self.current].to_vec())
    }

    /// Takes a braced block, or with `allow_arrow` a `=> expr` line wrapped
    /// in braces.
    fn consume_next_block(&mut self, allow_arrow: bool) -> Result<Vec<Token>, CompilerError> {
        if allow_arrow && self.match_token(TokenType::TokenEqualGreater) {
            let factory = TokenFactory::new(self.previous());
            let mut block = vec![factory.of_type(TokenType::TokenLeftBrace)];
            block.extend(self.consume_next_expr());
            block.push(factory.of_type(TokenType::TokenNewline));
            block.push(factory.of_type(TokenType::TokenRightBrace));
            return Ok(block);
        }
        if !self.check(TokenType::TokenLeftBrace) {
            return Err(self.error_current("Expect '{' to start a block."));
        }
        let start = self.current;
        let mut depth = 0;
        let mut end = None;
        for (index, token) in self.tokens.iter().enumerate().skip(start) {
            match token.token_type {
                TokenType::TokenLeftBrace => depth += 1,
                TokenType::TokenRightBrace => {
                    depth -= 1;
                    if depth == 0 {
                        end = Some(index);
                        break;
                    }
                }
                _ => {}
            }
        }
        let end = match end {
            Some(end) => end,
            None => return Err(self.error_current("Expect '}' to close the block.")),
        };
        let block = self.tokens[start..=end].to_vec();
        self.current = end + 1;
        self.match_all_newlines();
        Ok(block)
    }

    /// Tokens of the expression starting at the cursor, without consuming them.
    fn scan_next_expr(&self) -> Vec<Token> {
        let start = self.current;
        let mut end = self.tokens.len();
        let (mut parens, mut brackets, mut braces) = (0i32, 0i32, 0i32);
        for (index, token) in self.tokens.iter().enumerate().skip(start) {
            let stop = match token.token_type {
                TokenType::TokenEof => true,
                TokenType::TokenNewline => parens == 0 && brackets == 0 && braces == 0,
                TokenType::TokenComma => parens == 0 && brackets == 0 && braces == 0,
                TokenType::TokenLeftParen => {
                    parens += 1;
                    false
                }
                TokenType::TokenLeftBracket => {
                    brackets += 1;
                    false
                }
                TokenType::TokenLeftBrace => {
                    braces += 1;
                    false
                }
                TokenType::TokenRightParen => {
                    parens -= 1;
                    parens < 0
                }
                TokenType::TokenRightBracket => {
                    brackets -= 1;
                    brackets < 0
                }
                TokenType::TokenRightBrace => {
                    braces -= 1;
                    braces < 0
                }
                _ => false,
            };
            if stop {
                end = index;
                break;
            }
        }
        self.tokens[start..end].to_vec()
    }

    fn consume_next_expr(&mut self) -> Vec<Token> {
        let tokens = self.scan_next_expr();
        self.current += tokens.len();
        tokens
    }

    // Errors

    fn error_at(&self, index: usize, message: impl Into<String>) -> CompilerError {
        let index = index.min(self.tokens.len() - 1);
        let token = &self.tokens[index];
        CompilerError {
            file: token.file.to_string(),
            line: token.line,
            token_type: token.token_type.to_string(),
            message: message.into(),
            window: patch(&self.tokens, index),
        }
    }

    fn error_current(&self, message: impl Into<String>) -> CompilerError {
        self.error_at(self.current, message)
    }

    fn error_previous(&self, message: impl Into<String>) -> CompilerError {
        self.error_at(self.current.saturating_sub(1), message)
    }

    // Emission

    fn code_len(&self) -> usize {
        self.compiler.function.chunk.code.len()
    }

    fn last_op(&self) -> Option<OpCode> {
        self.compiler.emitted.last().map(|emitted| emitted.op)
    }

    fn roll_back_last(&mut self) {
        if let Some(emitted) = self.compiler.emitted.pop() {
            self.compiler.function.chunk.truncate(emitted.start);
        }
    }

    fn make_constant(&mut self, value: Value) -> usize {
        self.compiler.function.chunk.add_constant(value)
    }

    fn write_op(&mut self, op: OpCode) -> usize {
        let token = self.previous();
        let (line, file) = (token.line, Rc::clone(&token.file));
        let chunk = &mut self.compiler.function.chunk;
        chunk.mark_file(&file);
        let start = chunk.code.len();
        chunk.write_op(op, line);
        start
    }

    fn write_i32(&mut self, value: usize) {
        let line = self.previous().line;
        self.compiler.function.chunk.write_i32(value as i32, line);
    }

    fn write_byte(&mut self, value: u8) {
        let line = self.previous().line;
        self.compiler.function.chunk.write(value, line);
    }

    fn record(&mut self, op: OpCode, start: usize, operand: Operand) {
        self.compiler.emitted.push(Emitted { op, start, operand });
    }

    fn emit_op(&mut self, op: OpCode) {
        let start = self.write_op(op);
        self.record(op, start, Operand::None);
    }

    fn emit_ops(&mut self, ops: &[OpCode]) {
        for op in ops {
            self.emit_op(*op);
        }
    }

    fn emit_with_i32(&mut self, op: OpCode, value: usize, operand: Operand) {
        let start = self.write_op(op);
        self.write_i32(value);
        self.record(op, start, operand);
    }

    fn emit_id(&mut self, name: &str) {
        let index = self.make_constant(make_str_value(name));
        self.emit_with_i32(OpCode::ConstId, index, Operand::Name(Rc::from(name)));
    }

    fn emit_constant(&mut self, value: Value) {
        let index = self.make_constant(value);
        self.emit_with_i32(OpCode::Const, index, Operand::None);
    }

    fn emit_int(&mut self, value: i64) {
        let start = self.write_op(OpCode::ConstInt);
        let line = self.previous().line;
        self.compiler.function.chunk.write_i64(value, line);
        self.record(OpCode::ConstInt, start, Operand::None);
    }

    fn emit_float(&mut self, value: f64) {
        let start = self.write_op(OpCode::ConstFloat);
        let line = self.previous().line;
        self.compiler.function.chunk.write_f64(value, line);
        self.record(OpCode::ConstFloat, start, Operand::None);
    }

    /// Emits a forward jump and returns the offset of its target operand.
    fn emit_jump(&mut self, op: OpCode) -> usize {
        let start = self.write_op(op);
        let offset = self.code_len();
        self.write_i32(0);
        self.record(op, start, Operand::None);
        offset
    }

    fn patch_jump(&mut self, offset: usize) -> usize {
        let target = self.code_len();
        self.patch_jump_to(offset, target);
        target
    }

    fn patch_jump_to(&mut self, offset: usize, target: usize) {
        self.compiler.function.chunk.patch_i32(offset, target as i32);
    }

    fn emit_update_prop(&mut self, op: OpCode) {
        let start = self.write_op(OpCode::UpdateProp);
        self.write_byte(op.to_byte());
        self.record(OpCode::UpdateProp, start, Operand::None);
    }

    fn emit_invoke(&mut self, name: &str, argc: usize, is_super: bool, null_safe: bool, cascade: bool) {
        let op = if is_super { OpCode::SuperInvoke } else { OpCode::Invoke };
        let index = self.make_constant(make_str_value(name));
        let start = self.write_op(op);
        self.write_i32(index);
        self.write_i32(argc);
        self.write_byte(null_safe as u8);
        self.write_byte(cascade as u8);
        self.record(op, start, Operand::Name(Rc::from(name)));
    }

    fn emit_class(&mut self, name: &str, kind: ClassKind) {
        let index = self.make_constant(make_str_value(name));
        let start = self.write_op(OpCode::Class);
        self.write_byte(kind.to_byte());
        self.write_i32(index);
        self.record(OpCode::Class, start, Operand::None);
    }

    fn emit_closure(&mut self, function: ObjectFunction, upvalues: Vec<Upvalue>) {
        let index = self.make_constant(Value::Function(Rc::new(function)));
        let start = self.write_op(OpCode::Closure);
        self.write_i32(index);
        for upvalue in upvalues {
            self.write_byte(upvalue.is_local as u8);
            self.write_i32(upvalue.index);
            let fiber = self.make_constant(Value::Str(upvalue.fiber_name));
            self.write_i32(fiber);
        }
        self.record(OpCode::Closure, start, Operand::None);
    }

    /// RETURN/THROW followed by the count and codes that unwind the
    /// innermost scope.
    fn emit_return(&mut self, op: OpCode, codes: &[OpCode]) {
        let start = self.write_op(op);
        self.write_i32(codes.len());
        for code in codes {
            self.write_byte(code.to_byte());
        }
        self.record(op, start, Operand::None);
    }

    fn emit_scope_return(&mut self, op: OpCode) {
        let codes = self.scope_exit_codes(self.compiler.scope_depth);
        self.emit_return(op, &codes);
    }
}

#[cfg(feature = "debug_print_code")]
mod debug_feature {
    use crate::debug;
    use crate::objects::object_function::ObjectFunction;

    pub fn print_code(function: &ObjectFunction) {
        log::debug!("{}", debug::disassemble_function(function));
    }
}

#[cfg(not(feature = "debug_print_code"))]
mod debug_feature {
    use crate::objects::object_function::ObjectFunction;

    pub fn print_code(_function: &ObjectFunction) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Chunk;
    use crate::constants::INITIAL_OBJECTS;
    use crate::debug::disassemble_instruction;
    use crate::scanner::Scanner;

    fn compile_source(source: &str) -> Result<Rc<ObjectFunction>, CompilerError> {
        let output = Scanner::new("test", source, false).scan_tokens(true).unwrap();
        compile(output.tokens, &INITIAL_OBJECTS, false)
    }

    fn opcodes(chunk: &Chunk) -> Vec<OpCode> {
        let mut ops = Vec::new();
        let mut offset = 0;
        let mut sink = String::new();
        while offset < chunk.code.len() {
            ops.push(OpCode::from_byte(chunk.code[offset]).unwrap());
            offset = disassemble_instruction(chunk, offset, &mut sink);
        }
        ops
    }

    fn error_message(source: &str) -> String {
        compile_source(source).unwrap_err().message
    }

    #[test]
    fn test_script_takes_initial_objects_as_args() {
        let function = compile_source("1 + 2").unwrap();
        assert_eq!(function.arity, INITIAL_OBJECTS.len());
        assert_eq!(function.name.as_ref(), SCRIPT_FUNCTION);
        let ops = opcodes(&function.chunk);
        assert_eq!(ops, vec![OpCode::ConstInt, OpCode::ConstInt, OpCode::Add, OpCode::Return]);
    }

    #[test]
    fn test_while_loop_branches_once_each_way() {
        let function = compile_source("x = 1\nwhile x < 3 {\n  x = x + 1\n}\nx").unwrap();
        let ops = opcodes(&function.chunk);
        assert_eq!(ops.iter().filter(|op| **op == OpCode::JumpIfFalse).count(), 1);
        assert_eq!(ops.iter().filter(|op| **op == OpCode::Jump).count(), 1);
        assert_eq!(ops.last(), Some(&OpCode::Return));
    }

    #[test]
    fn test_scope_exit_closes_captured_locals() {
        let function = compile_source("{\n  a = 1\n  f = fn() => a\n}").unwrap();
        let ops = opcodes(&function.chunk);
        let tail = &ops[ops.len() - 4..];
        assert_eq!(tail, &[OpCode::Pop, OpCode::CloseUpvalue, OpCode::Nil, OpCode::Return]);
    }

    #[test]
    fn test_expression_block_pops_under_value() {
        let function = compile_source("x = if true {\n  y = 2\n  y + 1\n} else {\n  0\n}\nx").unwrap();
        let ops = opcodes(&function.chunk);
        assert!(ops.contains(&OpCode::PopUnder));
    }

    #[test]
    fn test_member_assignment_becomes_set_prop() {
        let function = compile_source("o = [a: 1]\no.a = 2\no.a += 3").unwrap();
        let ops = opcodes(&function.chunk);
        assert!(ops.contains(&OpCode::SetProp));
        assert!(ops.contains(&OpCode::UpdateProp));
        assert!(!ops.contains(&OpCode::GetProp));
    }

    #[test]
    fn test_closure_constant_records_upvalues() {
        let function = compile_source("a = 1\nfn f() {\n  a + 1\n}").unwrap();
        let closure = function.chunk.constants.iter().find_map(|value| match value {
            Value::Function(function) => Some(Rc::clone(function)),
            _ => None,
        });
        let closure = closure.unwrap();
        assert_eq!(closure.name.as_ref(), "f");
        assert_eq!(closure.upvalue_count, 1);
    }

    #[test]
    fn test_default_params_must_be_values() {
        assert_eq!(error_message("fn f(a = b) {}"), "Expected a value as default param value!");
        let function = compile_source("fn f(a, b = 2, c = -1) {}").unwrap();
        let f = function.chunk.constants.iter().find_map(|value| match value {
            Value::Function(function) => Some(Rc::clone(function)),
            _ => None,
        });
        let f = f.unwrap();
        assert_eq!(f.arity, 3);
        assert_eq!(f.optional_params_start, Some(1));
        assert_eq!(f.default_values, vec![Value::Int(2), Value::Int(-1)]);
    }

    #[test]
    fn test_compile_error_format() {
        let error = compile_source("x = 1 +\ny = 2").unwrap_err();
        assert_eq!(error.message, "Expect expression.");
        assert_eq!(error.line, 1);
        assert_eq!(error.token_type, "TokenNewline");
        assert!(error.window.contains('^'));
        assert!(error.to_string().starts_with("[\"test\" line 1] At TokenNewline: Expect expression."));
    }

    #[test]
    fn test_const_assignment_is_rejected() {
        assert_eq!(error_message("MAX_HP = 3\nMAX_HP = 4"), "Can't assign to a const!");
        assert_eq!(error_message("Int = 4"), "Can't assign to a const!");
        assert_eq!(error_message("x += 1"), "Assigning to undeclared var!");
    }

    #[test]
    fn test_unresolved_identifier() {
        assert_eq!(error_message("y = z + 1"), "Unable to resolve identifier: z");
        assert_eq!(error_message("x = x"), "Unable to resolve identifier: x");
        assert_eq!(error_message("foo(1)"), "Unable to resolve identifier: foo");
    }

    #[test]
    fn test_scope_errors() {
        assert_eq!(error_message("a = 1\nfn a() {}"), "Variable a is already declared in scope!");
        assert_eq!(error_message("break"), "Cannot 'break' outside of a loop!");
        assert_eq!(error_message("continue"), "Cannot 'continue' outside of a loop!");
        assert_eq!(error_message("x = if true { 1 }"), "An if expression must have an else!");
        assert_eq!(error_message("x = if true {\n  y = 1\n} else { 2 }"), "Block is not a valid expression block!");
    }

    #[test]
    fn test_class_errors() {
        assert_eq!(error_message("class A is A {}"), "A class cannot inherit from itself!");
        assert_eq!(error_message("class A is B {}"), "Can't find a class named B.");
        assert_eq!(error_message("class A {}\neffect E is A {}"), "A class must inherit a class of the same type!");
        assert_eq!(error_message("effect E {\n  fn trigger() {}\n}"), "Unable to find required fields trigger, run in E!");
        assert_eq!(error_message("class A {\n  fn init() {\n    return 1\n  }\n}"), "Can't return from init!");
        assert_eq!(error_message("fn f(this.a) {}"), "Autoset arguments are only allowed in initializers!");
        assert_eq!(error_message("this"), "Cannot use 'this' outside of class.");
    }

    #[test]
    fn test_effect_fields_may_come_from_superclass() {
        let source = "effect Base {\n  trigger = 1\n  fn run() {}\n}\neffect Burn is Base {\n  damage = 2\n}";
        assert!(compile_source(source).is_ok());
    }

    #[test]
    fn test_super_setter_is_rejected() {
        let source = "class A {\n  x = 1\n}\nclass B is A {\n  fn set() {\n    super.x = 2\n  }\n}";
        assert_eq!(error_message(source), "Setters aren't allowed with 'super'.");
    }

    #[test]
    fn test_implicit_args_must_be_contiguous() {
        assert!(compile_source("f = => $0 + $1").is_ok());
        assert_eq!(error_message("f = => $1"), "Invalid implicit arg order, found $1 instead of $0");
    }

    #[test]
    fn test_when_and_for_compile() {
        let source = r#"
x = 3
when x {
  1 => Console.log("one")
  is Int || 4 {
    Console.log("int")
  }
  else => Console.log("other")
}
y = when {
  if x > 2 => "big"
  else => "small"
}
for i = 0
i < 3
i += 1 {
  if i == 1 continue
}
for item in [1, 2] {
  Console.log(item)
}
"#;
        assert!(compile_source(source).is_ok());
    }

    #[test]
    fn test_else_must_be_last_in_when() {
        let source = "x = 1\nwhen x {\n  else => 1\n  2 => 2\n}";
        assert_eq!(error_message(source), "'else' must be the last clause in a 'when' block");
    }
}
