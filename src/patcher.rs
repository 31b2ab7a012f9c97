use crate::constants::SURROUNDING_LINES_COUNT;
use crate::scanner::{Token, TokenType};

/// Renders the source lines around `tokens[highlighted]` with line-number
/// prefixes and a caret under the highlighted token.
pub fn patch(tokens: &[Token], highlighted: usize) -> String {
    let target = match tokens.get(highlighted) {
        Some(token) => token,
        None => return String::new(),
    };
    let target_line = target.line;
    let first_line = target_line.saturating_sub(SURROUNDING_LINES_COUNT);
    let last_line = target_line + SURROUNDING_LINES_COUNT;

    let mut out = String::new();
    let mut line_start = 0;
    let mut caret_column = None;
    let mut caret_written = false;
    let mut print_line_number = true;
    let mut previous = TokenType::TokenNewline;

    for (index, token) in tokens.iter().enumerate() {
        if token.file != target.file {
            continue;
        }
        if token.line < first_line {
            continue;
        } else if token.line > last_line {
            break;
        }

        if print_line_number {
            line_start = out.len();
            out.push_str(&format!("[{}] ", token.line));
        } else if needs_space(previous, token.token_type) {
            out.push(' ');
        }

        if index == highlighted {
            caret_column = Some(out[line_start..].chars().count());
        }

        let is_newline = token.token_type == TokenType::TokenNewline;
        if is_newline && token.line == target_line && !caret_written {
            push_caret(&mut out, caret_column);
            caret_written = true;
        }
        out.push_str(token.code());
        print_line_number = is_newline;
        previous = token.token_type;
    }

    if !caret_written {
        push_caret(&mut out, caret_column);
    }
    out
}

fn push_caret(out: &mut String, column: Option<usize>) {
    out.push('\n');
    if let Some(column) = column {
        out.push_str(&" ".repeat(column));
    }
    out.push('^');
}

fn needs_space(previous: TokenType, token_type: TokenType) -> bool {
    let tight_after = matches!(
        previous,
        TokenType::TokenDot | TokenType::TokenDotDot | TokenType::TokenDotDotDot | TokenType::TokenLeftParen | TokenType::TokenLeftBracket
    );
    let tight_before = matches!(
        token_type,
        TokenType::TokenDot
            | TokenType::TokenDotDot
            | TokenType::TokenDotDotDot
            | TokenType::TokenLeftParen
            | TokenType::TokenRightParen
            | TokenType::TokenLeftBracket
            | TokenType::TokenRightBracket
            | TokenType::TokenNewline
            | TokenType::TokenEof
    );
    !tight_after && !tight_before
}

#[cfg(test)]
mod tests {
    use super::patch;
    use crate::scanner::Scanner;

    #[test]
    fn test_caret_under_highlighted_token() {
        let tokens = Scanner::new("test", "a = 1\nb = a.foo(2)\nc = 3", false).scan_tokens(true).unwrap().tokens;
        let index = tokens.iter().position(|t| t.lexeme == "foo").unwrap();
        let window = patch(&tokens, index);
        let lines: Vec<&str> = window.lines().collect();
        assert_eq!(lines[0], "[1] a = 1");
        assert_eq!(lines[1], "[2] b = a.foo(2)");
        assert_eq!(lines[2], "          ^");
        assert_eq!(lines[3], "[3] c = 3");
    }

    #[test]
    fn test_window_is_limited() {
        let source = "l1\nl2\nl3\nl4\nl5\nl6\nl7";
        let tokens = Scanner::new("test", source, false).scan_tokens(true).unwrap().tokens;
        let index = tokens.iter().position(|t| t.lexeme == "l6").unwrap();
        let window = patch(&tokens, index);
        assert!(!window.contains("l3"));
        assert!(window.contains("[4] l4"));
        assert!(window.contains("[6] l6\n    ^"));
    }
}
