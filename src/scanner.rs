use std::rc::Rc;

use strum_macros::{Display, EnumString};

use crate::constants::{BREAKPOINT_LEXEME, THIS};
use crate::error::LexerError;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, Display)]
pub enum TokenType {
    // Grouping and punctuation.
    TokenLeftParen,
    TokenRightParen,
    TokenLeftBracket,
    TokenRightBracket,
    TokenLeftBrace,
    TokenRightBrace,
    TokenComma,
    TokenDot,
    TokenDotComma,
    TokenQuestionDot,
    TokenQuestionDotComma,
    TokenDotDot,
    TokenDotDotDot,
    TokenColon,
    TokenColonColon,
    TokenNewline,

    // Operators.
    TokenBang,
    TokenBangEqual,
    TokenEqual,
    TokenEqualEqual,
    TokenEqualGreater,
    TokenGreater,
    TokenGreaterEqual,
    TokenLess,
    TokenLessEqual,
    TokenPlus,
    TokenPlusEqual,
    TokenMinus,
    TokenMinusEqual,
    TokenStar,
    TokenStarStar,
    TokenStarEqual,
    TokenSlash,
    TokenSlashSlash,
    TokenSlashEqual,
    TokenSlashSlashEqual,
    TokenMod,
    TokenModMod,
    TokenModEqual,
    TokenAndAnd,
    TokenOrOr,
    TokenQuestionQuestion,
    TokenQuestionBang,
    TokenNotIs,
    TokenNotIn,

    // Literals.
    TokenIdentifier,
    TokenString,
    TokenNumber,

    // Keywords.
    TokenBreak,
    TokenContinue,
    TokenElse,
    TokenThis,
    TokenSuper,
    TokenFalse,
    TokenFn,
    TokenFor,
    TokenIf,
    TokenIs,
    TokenNull,
    TokenReturn,
    TokenTrue,
    TokenWhile,
    TokenWhen,
    TokenIn,
    TokenThrow,
    TokenImport,
    TokenClass,
    TokenEffect,
    TokenStance,
    TokenScenario,
    TokenAi,
    TokenCatch,
    TokenYield,

    TokenEof,
}

static KEYWORDS: phf::Map<&'static str, TokenType> = phf::phf_map! {
    "break" => TokenType::TokenBreak,
    "continue" => TokenType::TokenContinue,
    "else" => TokenType::TokenElse,
    "this" => TokenType::TokenThis,
    "super" => TokenType::TokenSuper,
    "false" => TokenType::TokenFalse,
    "fn" => TokenType::TokenFn,
    "for" => TokenType::TokenFor,
    "if" => TokenType::TokenIf,
    "is" => TokenType::TokenIs,
    "null" => TokenType::TokenNull,
    "return" => TokenType::TokenReturn,
    "true" => TokenType::TokenTrue,
    "while" => TokenType::TokenWhile,
    "when" => TokenType::TokenWhen,
    "in" => TokenType::TokenIn,
    "throw" => TokenType::TokenThrow,
    "import" => TokenType::TokenImport,
    "class" => TokenType::TokenClass,
    "effect" => TokenType::TokenEffect,
    "stance" => TokenType::TokenStance,
    "scenario" => TokenType::TokenScenario,
    "ai" => TokenType::TokenAi,
    "catch" => TokenType::TokenCatch,
    "yield" => TokenType::TokenYield,
};

impl TokenType {
    /// Source text of fixed-spelling tokens, `None` for identifiers and literals.
    pub fn code(&self) -> Option<&'static str> {
        let code = match self {
            TokenType::TokenLeftParen => "(",
            TokenType::TokenRightParen => ")",
            TokenType::TokenLeftBracket => "[",
            TokenType::TokenRightBracket => "]",
            TokenType::TokenLeftBrace => "{",
            TokenType::TokenRightBrace => "}",
            TokenType::TokenComma => ",",
            TokenType::TokenDot => ".",
            TokenType::TokenDotComma => ".,",
            TokenType::TokenQuestionDot => "?.",
            TokenType::TokenQuestionDotComma => "?.,",
            TokenType::TokenDotDot => "..",
            TokenType::TokenDotDotDot => "...",
            TokenType::TokenColon => ":",
            TokenType::TokenColonColon => "::",
            TokenType::TokenNewline => "\n",
            TokenType::TokenBang => "!",
            TokenType::TokenBangEqual => "!=",
            TokenType::TokenEqual => "=",
            TokenType::TokenEqualEqual => "==",
            TokenType::TokenEqualGreater => "=>",
            TokenType::TokenGreater => ">",
            TokenType::TokenGreaterEqual => ">=",
            TokenType::TokenLess => "<",
            TokenType::TokenLessEqual => "<=",
            TokenType::TokenPlus => "+",
            TokenType::TokenPlusEqual => "+=",
            TokenType::TokenMinus => "-",
            TokenType::TokenMinusEqual => "-=",
            TokenType::TokenStar => "*",
            TokenType::TokenStarStar => "**",
            TokenType::TokenStarEqual => "*=",
            TokenType::TokenSlash => "/",
            TokenType::TokenSlashSlash => "//",
            TokenType::TokenSlashEqual => "/=",
            TokenType::TokenSlashSlashEqual => "//=",
            TokenType::TokenMod => "%",
            TokenType::TokenModMod => "%%",
            TokenType::TokenModEqual => "%=",
            TokenType::TokenAndAnd => "&&",
            TokenType::TokenOrOr => "||",
            TokenType::TokenQuestionQuestion => "??",
            TokenType::TokenQuestionBang => "?!",
            TokenType::TokenNotIs => "!is",
            TokenType::TokenNotIn => "!in",
            TokenType::TokenBreak => "break",
            TokenType::TokenContinue => "continue",
            TokenType::TokenElse => "else",
            TokenType::TokenThis => "this",
            TokenType::TokenSuper => "super",
            TokenType::TokenFalse => "false",
            TokenType::TokenFn => "fn",
            TokenType::TokenFor => "for",
            TokenType::TokenIf => "if",
            TokenType::TokenIs => "is",
            TokenType::TokenNull => "null",
            TokenType::TokenReturn => "return",
            TokenType::TokenTrue => "true",
            TokenType::TokenWhile => "while",
            TokenType::TokenWhen => "when",
            TokenType::TokenIn => "in",
            TokenType::TokenThrow => "throw",
            TokenType::TokenImport => "import",
            TokenType::TokenClass => "class",
            TokenType::TokenEffect => "effect",
            TokenType::TokenStance => "stance",
            TokenType::TokenScenario => "scenario",
            TokenType::TokenAi => "ai",
            TokenType::TokenCatch => "catch",
            TokenType::TokenYield => "yield",
            TokenType::TokenEof => "",
            TokenType::TokenIdentifier | TokenType::TokenString | TokenType::TokenNumber => return None,
        };
        Some(code)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Int(i64),
    Float(f64),
    Str(Rc<str>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub token_type: TokenType,
    pub lexeme: String,
    pub literal: Option<Literal>,
    pub line: usize,
    pub file: Rc<str>,
    pub has_breakpoint: bool,
}

impl Token {
    pub fn new(token_type: TokenType, lexeme: &str, literal: Option<Literal>, line: usize, file: Rc<str>) -> Token {
        Token {
            token_type,
            lexeme: lexeme.to_string(),
            literal,
            line,
            file,
            has_breakpoint: false,
        }
    }

    pub fn with_type(&self, token_type: TokenType) -> Token {
        Token { token_type, ..self.clone() }
    }

    /// Text used when echoing the token back in diagnostics.
    pub fn code(&self) -> &str {
        match self.token_type.code() {
            Some(code) => code,
            None => &self.lexeme,
        }
    }
}

/// Builds synthetic tokens positioned at an existing token, used when
/// compiling sugar through generated token sequences.
pub struct TokenFactory {
    line: usize,
    file: Rc<str>,
}

impl TokenFactory {
    pub fn new(opener: &Token) -> TokenFactory {
        TokenFactory { line: opener.line, file: Rc::clone(&opener.file) }
    }

    pub fn of_type(&self, token_type: TokenType) -> Token {
        Token::new(token_type, token_type.code().unwrap_or(""), None, self.line, Rc::clone(&self.file))
    }

    pub fn this(&self) -> Token {
        Token::new(TokenType::TokenThis, THIS, None, self.line, Rc::clone(&self.file))
    }

    pub fn named(&self, name: &str) -> Token {
        Token::new(TokenType::TokenIdentifier, name, None, self.line, Rc::clone(&self.file))
    }

    pub fn of_string(&self, value: &str) -> Token {
        let literal = Literal::Str(Rc::from(value));
        Token::new(TokenType::TokenString, &format!("\"{value}\""), Some(literal), self.line, Rc::clone(&self.file))
    }

    pub fn of_int(&self, value: i64) -> Token {
        Token::new(TokenType::TokenNumber, &value.to_string(), Some(Literal::Int(value)), self.line, Rc::clone(&self.file))
    }
}

#[derive(Debug)]
pub struct ScannerOutput {
    pub tokens: Vec<Token>,
    pub imports: Vec<String>,
}

pub struct Scanner {
    file: Rc<str>,
    chars: Vec<char>,
    is_debug: bool,
    tokens: Vec<Token>,
    imports: Vec<String>,
    start: usize,
    current: usize,
    line: usize,
    interpolation_parens: usize,
}

impl Scanner {
    pub fn new(file: &str, source: &str, is_debug: bool) -> Scanner {
        Scanner {
            file: Rc::from(file),
            chars: source.chars().collect(),
            is_debug,
            tokens: Vec::new(),
            imports: Vec::new(),
            start: 0,
            current: 0,
            line: 1,
            interpolation_parens: 0,
        }
    }

    pub fn scan_tokens(mut self, add_eof: bool) -> Result<ScannerOutput, LexerError> {
        while !self.is_end() {
            self.start = self.current;
            self.scan_token()?;
        }
        if add_eof {
            let eof = Token::new(TokenType::TokenEof, "", None, self.line, Rc::clone(&self.file));
            self.tokens.push(eof);
        }
        Ok(ScannerOutput { tokens: self.tokens, imports: self.imports })
    }

    fn scan_token(&mut self) -> Result<(), LexerError> {
        let c = self.advance();
        match c {
            '(' => {
                self.add_token(TokenType::TokenLeftParen);
                if self.interpolation_parens > 0 {
                    self.interpolation_parens += 1;
                }
            }
            ')' => {
                self.add_token(TokenType::TokenRightParen);
                if self.interpolation_parens > 0 {
                    self.interpolation_parens -= 1;
                    if self.interpolation_parens == 0 {
                        self.continue_interpolation()?;
                    }
                }
            }
            '[' => self.add_token(TokenType::TokenLeftBracket),
            ']' => self.add_token(TokenType::TokenRightBracket),
            '{' => self.add_token(TokenType::TokenLeftBrace),
            '}' => self.add_token(TokenType::TokenRightBrace),
            ',' => self.add_token(TokenType::TokenComma),
            '.' => {
                if self.match_char(',') {
                    self.add_token(TokenType::TokenDotComma);
                } else if self.match_char('.') {
                    if self.match_char('.') {
                        self.add_token(TokenType::TokenDotDotDot);
                    } else {
                        self.add_token(TokenType::TokenDotDot);
                    }
                } else {
                    self.add_token(TokenType::TokenDot);
                }
            }
            ':' => {
                if self.match_char(':') {
                    self.add_token(TokenType::TokenColonColon);
                } else {
                    self.add_token(TokenType::TokenColon);
                }
            }
            '@' => {
                self.synthesize(TokenType::TokenThis, THIS);
                self.add_token(TokenType::TokenDot);
            }
            '=' => {
                if self.match_char('=') {
                    self.add_token(TokenType::TokenEqualEqual);
                } else if self.match_char('>') {
                    self.add_token(TokenType::TokenEqualGreater);
                } else {
                    self.add_token(TokenType::TokenEqual);
                }
            }
            '<' => {
                let token_type = if self.match_char('=') { TokenType::TokenLessEqual } else { TokenType::TokenLess };
                self.add_token(token_type);
            }
            '>' => {
                let token_type = if self.match_char('=') { TokenType::TokenGreaterEqual } else { TokenType::TokenGreater };
                self.add_token(token_type);
            }
            '!' => {
                if self.match_char('=') {
                    self.add_token(TokenType::TokenBangEqual);
                } else if self.match_str("is ") {
                    self.add_token(TokenType::TokenNotIs);
                } else if self.match_str("in ") {
                    self.add_token(TokenType::TokenNotIn);
                } else {
                    self.add_token(TokenType::TokenBang);
                }
            }
            '+' => {
                let token_type = if self.match_char('=') { TokenType::TokenPlusEqual } else { TokenType::TokenPlus };
                self.add_token(token_type);
            }
            '-' => {
                let token_type = if self.match_char('=') { TokenType::TokenMinusEqual } else { TokenType::TokenMinus };
                self.add_token(token_type);
            }
            '/' => {
                if self.match_char('/') {
                    if self.match_char('=') {
                        self.add_token(TokenType::TokenSlashSlashEqual);
                    } else {
                        self.add_token(TokenType::TokenSlashSlash);
                    }
                } else if self.match_char('=') {
                    self.add_token(TokenType::TokenSlashEqual);
                } else {
                    self.add_token(TokenType::TokenSlash);
                }
            }
            '*' => {
                if self.match_char('*') {
                    self.add_token(TokenType::TokenStarStar);
                } else if self.match_char('=') {
                    self.add_token(TokenType::TokenStarEqual);
                } else {
                    self.add_token(TokenType::TokenStar);
                }
            }
            '%' => {
                if self.match_char('%') {
                    self.add_token(TokenType::TokenModMod);
                } else if self.match_char('=') {
                    self.add_token(TokenType::TokenModEqual);
                } else {
                    self.add_token(TokenType::TokenMod);
                }
            }
            '?' => {
                if self.match_char('?') {
                    self.add_token(TokenType::TokenQuestionQuestion);
                } else if self.match_char('!') {
                    self.add_token(TokenType::TokenQuestionBang);
                } else if self.match_str(".,") {
                    self.add_token(TokenType::TokenQuestionDotComma);
                } else if self.match_char('.') {
                    self.add_token(TokenType::TokenQuestionDot);
                } else {
                    return Err(self.error("Unexpected character."));
                }
            }
            '&' if self.match_char('&') => self.add_token(TokenType::TokenAndAnd),
            '|' if self.match_char('|') => self.add_token(TokenType::TokenOrOr),
            '$' => self.identifier()?,
            '#' => self.comment(),
            '\\' => {
                if self.match_char('\n') {
                    self.line += 1;
                }
            }
            '\n' => {
                self.add_token(TokenType::TokenNewline);
                self.line += 1;
            }
            ';' => self.add_token(TokenType::TokenNewline),
            ' ' | '\r' | '\t' => {}
            '"' => {
                self.string(true)?;
            }
            c if Self::is_digit(c) => self.number()?,
            c if Self::is_alpha(c) => self.identifier()?,
            _ => return Err(self.error("Unexpected character.")),
        }
        Ok(())
    }

    fn comment(&mut self) {
        if self.match_char('*') {
            while !self.is_end() && !self.match_str("*#") {
                if self.peek() == Some('\n') {
                    self.line += 1;
                }
                self.advance();
            }
            return;
        }

        while !self.is_end() && self.peek() != Some('\n') {
            self.advance();
        }
        if self.is_debug {
            let comment: String = self.chars[self.start + 1..self.current].iter().collect();
            if comment.trim().starts_with(BREAKPOINT_LEXEME) {
                let line = self.line;
                for token in self.tokens.iter_mut().rev() {
                    if token.line != line {
                        break;
                    }
                    token.has_breakpoint = true;
                }
            }
        }
    }

    fn identifier(&mut self) -> Result<(), LexerError> {
        while self.peek().map_or(false, Self::is_alphanumeric) {
            self.advance();
        }

        let text = self.lexeme();
        match KEYWORDS.get(text.as_str()).copied() {
            Some(TokenType::TokenImport) => {
                let rewind = self.current;
                if self.skip_to_string_opener() {
                    self.start = self.current - 1;
                    match self.string(false)? {
                        Some(path) => {
                            self.imports.push(path);
                            return Ok(());
                        }
                        None => return Err(self.error("String interpolation is forbidden in imports.")),
                    }
                }
                self.current = rewind;
                self.add_token(TokenType::TokenImport);
            }
            Some(token_type) => self.add_token(token_type),
            None => self.add_token(TokenType::TokenIdentifier),
        }
        Ok(())
    }

    fn number(&mut self) -> Result<(), LexerError> {
        while self.peek().map_or(false, Self::is_digit_or_underscore) {
            self.advance();
        }
        if self.peek() == Some('.') && self.peek_next().map_or(false, Self::is_digit) {
            self.advance();
            while self.peek().map_or(false, Self::is_digit_or_underscore) {
                self.advance();
            }
        }
        if matches!(self.peek(), Some('e') | Some('E')) {
            match self.peek_next() {
                Some(c) if Self::is_digit(c) => {
                    self.advance();
                }
                Some('+') | Some('-') => {
                    self.advance();
                    self.advance();
                }
                _ => return Err(self.error("Expected a digit or + or - after E!")),
            }
            while self.peek().map_or(false, Self::is_digit_or_underscore) {
                self.advance();
            }
        }

        let number: String = self.lexeme().chars().filter(|c| *c != '_').collect();
        let literal = match number.parse::<i64>() {
            Ok(value) => Literal::Int(value),
            Err(_) => match number.parse::<f64>() {
                Ok(value) => Literal::Float(value),
                Err(_) => return Err(self.error(&format!("Invalid number: {number}"))),
            },
        };
        self.add_literal(TokenType::TokenNumber, literal);
        Ok(())
    }

    /// Scans a string body starting after the opening quote. Returns `None` when
    /// the string was split by an interpolation; the pieces are emitted as tokens.
    fn string(&mut self, add_token: bool) -> Result<Option<String>, LexerError> {
        let mut value = String::new();
        loop {
            let c = match self.peek() {
                Some(c) => c,
                None => return Err(self.error("Unterminated string.")),
            };
            match c {
                '"' => break,
                '\n' => {
                    self.line += 1;
                    value.push(c);
                }
                '\\' => {
                    let escaped = match self.peek_next() {
                        Some('"') => '"',
                        Some('$') => '$',
                        Some('n') => '\n',
                        Some('t') => '\t',
                        Some('\\') => '\\',
                        Some(other) => return Err(self.error(&format!("Invalid string escape char: {other}"))),
                        None => return Err(self.error("Unterminated string.")),
                    };
                    self.advance();
                    value.push(escaped);
                }
                '$' if self.peek_next() == Some('(') => {
                    if add_token {
                        self.add_string(&value);
                        self.synthesize(TokenType::TokenPlus, "+");
                        self.advance();
                        self.advance();
                        self.synthesize(TokenType::TokenLeftParen, "(");
                        self.interpolation_parens = 1;
                    }
                    return Ok(None);
                }
                '$' if self.peek_next().map_or(false, Self::is_alpha) => {
                    if add_token {
                        self.add_string(&value);
                        self.advance();
                        self.synthesize(TokenType::TokenPlus, "+");
                        let name_start = self.current;
                        while self.peek().map_or(false, Self::is_alphanumeric) {
                            self.advance();
                        }
                        let name: String = self.chars[name_start..self.current].iter().collect();
                        self.synthesize(TokenType::TokenIdentifier, &name);
                        self.continue_interpolation()?;
                    }
                    return Ok(None);
                }
                _ => value.push(c),
            }
            self.advance();
        }

        // The closing quote.
        self.advance();
        if add_token {
            self.add_string(&value);
        }
        Ok(Some(value))
    }

    fn continue_interpolation(&mut self) -> Result<(), LexerError> {
        self.synthesize(TokenType::TokenPlus, "+");
        self.start = self.current;
        if let Some(rest) = self.string(true)? {
            if rest.is_empty() {
                // Nothing follows the interpolation, drop the trailing `+ ""`.
                self.tokens.pop();
                self.tokens.pop();
            }
        }
        Ok(())
    }

    fn skip_to_string_opener(&mut self) -> bool {
        while matches!(self.peek(), Some(' ') | Some('\r') | Some('\t')) {
            self.advance();
        }
        self.match_char('"')
    }

    fn is_digit(c: char) -> bool {
        c.is_ascii_digit()
    }

    fn is_digit_or_underscore(c: char) -> bool {
        c.is_ascii_digit() || c == '_'
    }

    fn is_alpha(c: char) -> bool {
        c.is_ascii_alphabetic() || c == '_'
    }

    fn is_alphanumeric(c: char) -> bool {
        Self::is_alpha(c) || Self::is_digit(c)
    }

    fn is_end(&self) -> bool {
        self.current >= self.chars.len()
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.current).copied()
    }

    fn peek_next(&self) -> Option<char> {
        self.chars.get(self.current + 1).copied()
    }

    fn advance(&mut self) -> char {
        let c = self.chars.get(self.current).copied().unwrap_or('\0');
        self.current += 1;
        c
    }

    fn match_char(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.current += 1;
            return true;
        }
        false
    }

    fn match_str(&mut self, expected: &str) -> bool {
        let len = expected.chars().count();
        if self.current + len > self.chars.len() {
            return false;
        }
        if !self.chars[self.current..self.current + len].iter().copied().eq(expected.chars()) {
            return false;
        }
        self.current += len;
        true
    }

    fn lexeme(&self) -> String {
        let end = self.current.min(self.chars.len());
        self.chars[self.start..end].iter().collect()
    }

    fn add_token(&mut self, token_type: TokenType) {
        let lexeme = self.lexeme();
        self.tokens.push(Token::new(token_type, &lexeme, None, self.line, Rc::clone(&self.file)));
    }

    fn add_literal(&mut self, token_type: TokenType, literal: Literal) {
        let lexeme = self.lexeme();
        self.tokens.push(Token::new(token_type, &lexeme, Some(literal), self.line, Rc::clone(&self.file)));
    }

    fn add_string(&mut self, value: &str) {
        let literal = Literal::Str(Rc::from(value));
        let lexeme = format!("\"{value}\"");
        self.tokens.push(Token::new(TokenType::TokenString, &lexeme, Some(literal), self.line, Rc::clone(&self.file)));
    }

    fn synthesize(&mut self, token_type: TokenType, lexeme: &str) {
        self.tokens.push(Token::new(token_type, lexeme, None, self.line, Rc::clone(&self.file)));
    }

    fn error(&self, message: &str) -> LexerError {
        LexerError { file: self.file.to_string(), line: self.line, message: message.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::{Literal, Scanner, TokenType};

    fn types(source: &str) -> Vec<TokenType> {
        let output = Scanner::new("test", source, false).scan_tokens(false).unwrap();
        output.tokens.iter().map(|t| t.token_type).collect()
    }

    #[test]
    fn test_keywords_and_identifiers() {
        let output = Scanner::new("test", "this is for if fn fn1 forfor yield", false).scan_tokens(true).unwrap();
        let tokens = output.tokens;
        assert!(tokens[0].token_type == TokenType::TokenThis);
        assert!(tokens[1].token_type == TokenType::TokenIs);
        assert!(tokens[2].token_type == TokenType::TokenFor);
        assert!(tokens[3].token_type == TokenType::TokenIf);
        assert!(tokens[4].token_type == TokenType::TokenFn);
        assert!(tokens[5].token_type == TokenType::TokenIdentifier);
        assert!(tokens[5].lexeme == "fn1");
        assert!(tokens[6].token_type == TokenType::TokenIdentifier);
        assert!(tokens[7].token_type == TokenType::TokenYield);
        assert!(tokens[8].token_type == TokenType::TokenEof);
    }

    #[test]
    fn test_compound_operators() {
        assert_eq!(
            types("a ?., b ?. c .. d ... e //= f ?? g ?! h !is Int !in xs"),
            vec![
                TokenType::TokenIdentifier,
                TokenType::TokenQuestionDotComma,
                TokenType::TokenIdentifier,
                TokenType::TokenQuestionDot,
                TokenType::TokenIdentifier,
                TokenType::TokenDotDot,
                TokenType::TokenIdentifier,
                TokenType::TokenDotDotDot,
                TokenType::TokenIdentifier,
                TokenType::TokenSlashSlashEqual,
                TokenType::TokenIdentifier,
                TokenType::TokenQuestionQuestion,
                TokenType::TokenIdentifier,
                TokenType::TokenQuestionBang,
                TokenType::TokenIdentifier,
                TokenType::TokenNotIs,
                TokenType::TokenIdentifier,
                TokenType::TokenNotIn,
                TokenType::TokenIdentifier,
            ]
        );
    }

    #[test]
    fn test_at_sign_and_semicolon() {
        assert_eq!(
            types("@x; y"),
            vec![
                TokenType::TokenThis,
                TokenType::TokenDot,
                TokenType::TokenIdentifier,
                TokenType::TokenNewline,
                TokenType::TokenIdentifier,
            ]
        );
    }

    #[test]
    fn test_numbers() {
        let output = Scanner::new("test", "1_000 2.5 3e2", false).scan_tokens(false).unwrap();
        assert_eq!(output.tokens[0].literal, Some(Literal::Int(1000)));
        assert_eq!(output.tokens[1].literal, Some(Literal::Float(2.5)));
        assert_eq!(output.tokens[2].literal, Some(Literal::Float(300.0)));

        let error = Scanner::new("test", "1e", false).scan_tokens(false).unwrap_err();
        assert_eq!(error.message, "Expected a digit or + or - after E!");
    }

    #[test]
    fn test_string_escapes() {
        let output = Scanner::new("test", r#""a\"b\n\$c""#, false).scan_tokens(false).unwrap();
        assert_eq!(output.tokens[0].literal, Some(Literal::Str("a\"b\n$c".into())));

        let error = Scanner::new("test", r#""\q""#, false).scan_tokens(false).unwrap_err();
        assert_eq!(error.to_string(), "[\"test\" line 1] Error: Invalid string escape char: q");

        let error = Scanner::new("test", "\"abc", false).scan_tokens(false).unwrap_err();
        assert_eq!(error.message, "Unterminated string.");
    }

    #[test]
    fn test_string_interpolation() {
        assert_eq!(
            types(r#""a $name b""#),
            vec![
                TokenType::TokenString,
                TokenType::TokenPlus,
                TokenType::TokenIdentifier,
                TokenType::TokenPlus,
                TokenType::TokenString,
            ]
        );
        assert_eq!(
            types(r#""sum: $(a + b)""#),
            vec![
                TokenType::TokenString,
                TokenType::TokenPlus,
                TokenType::TokenLeftParen,
                TokenType::TokenIdentifier,
                TokenType::TokenPlus,
                TokenType::TokenIdentifier,
                TokenType::TokenRightParen,
            ]
        );
    }

    #[test]
    fn test_imports_and_comments() {
        let source = "import \"lib/util\"\n# comment\nx #* block\ncomment *# y";
        let output = Scanner::new("test", source, false).scan_tokens(false).unwrap();
        assert_eq!(output.imports, vec!["lib/util".to_string()]);
        let identifiers: Vec<&str> = output
            .tokens
            .iter()
            .filter(|t| t.token_type == TokenType::TokenIdentifier)
            .map(|t| t.lexeme.as_str())
            .collect();
        assert_eq!(identifiers, vec!["x", "y"]);
        assert_eq!(output.tokens.last().map(|t| t.line), Some(4));
    }

    #[test]
    fn test_breakpoint_marks() {
        let output = Scanner::new("test", "a = 1\nb = 2 # BP\nc = 3", true).scan_tokens(false).unwrap();
        let marked: Vec<&str> = output.tokens.iter().filter(|t| t.has_breakpoint).map(|t| t.code()).collect();
        assert_eq!(marked, vec!["b", "=", "2"]);
    }

    #[test]
    fn test_unexpected_character() {
        let error = Scanner::new("test", "a ^ b", false).scan_tokens(false).unwrap_err();
        assert_eq!(error.message, "Unexpected character.");
    }
}
