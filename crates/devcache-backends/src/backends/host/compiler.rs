//! Front end for OpenCL-C-style kernel source
//!
//! The host backend does not generate code. Building a program checks that
//! the source is well formed (comments closed, brackets balanced, kernels
//! declared `void`) and records each `__kernel` entry point with its
//! parameter count. Diagnostics are collected into a build log in
//! `line:column: error: message` form.

use std::fmt::Write as _;

/// A kernel declared in program source
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct KernelSignature {
    pub(crate) name: String,
    pub(crate) arity: u32,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Punct(char),
}

#[derive(Debug, Clone)]
struct Spanned {
    token: Token,
    line: usize,
    column: usize,
}

#[derive(Default)]
struct Diagnostics {
    log: String,
    errors: usize,
}

impl Diagnostics {
    fn error(&mut self, line: usize, column: usize, message: impl AsRef<str>) {
        let _ = writeln!(self.log, "{line}:{column}: error: {}", message.as_ref());
        self.errors += 1;
    }

    fn finish(self) -> Result<(), String> {
        if self.errors == 0 {
            Ok(())
        } else {
            let mut log = self.log;
            let _ = write!(
                log,
                "{} error{} generated.",
                self.errors,
                if self.errors == 1 { "" } else { "s" }
            );
            Err(log)
        }
    }
}

/// Build `source`, returning its kernels or the build log
pub(crate) fn build(source: &str) -> Result<Vec<KernelSignature>, String> {
    let mut diagnostics = Diagnostics::default();

    if source.trim().is_empty() {
        diagnostics.error(1, 1, "program source is empty");
        return diagnostics.finish().map(|()| Vec::new());
    }

    let tokens = tokenize(source, &mut diagnostics);
    check_brackets(&tokens, &mut diagnostics);
    let kernels = collect_kernels(&tokens, &mut diagnostics);

    diagnostics.finish()?;
    Ok(kernels)
}

fn tokenize(source: &str, diagnostics: &mut Diagnostics) -> Vec<Spanned> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let (mut i, mut line, mut column) = (0, 1, 1);

    macro_rules! advance {
        () => {{
            if chars[i] == '\n' {
                line += 1;
                column = 1;
            } else {
                column += 1;
            }
            i += 1;
        }};
    }

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();

        if c == '/' && next == Some('/') {
            while i < chars.len() && chars[i] != '\n' {
                advance!();
            }
        } else if c == '/' && next == Some('*') {
            let (start_line, start_column) = (line, column);
            advance!();
            advance!();
            let mut closed = false;
            while i < chars.len() {
                if chars[i] == '*' && chars.get(i + 1) == Some(&'/') {
                    advance!();
                    advance!();
                    closed = true;
                    break;
                }
                advance!();
            }
            if !closed {
                diagnostics.error(start_line, start_column, "unterminated /* comment");
            }
        } else if c == '"' || c == '\'' {
            let (start_line, start_column) = (line, column);
            advance!();
            let mut closed = false;
            while i < chars.len() && chars[i] != '\n' {
                if chars[i] == '\\' {
                    advance!();
                    if i < chars.len() {
                        advance!();
                    }
                    continue;
                }
                if chars[i] == c {
                    advance!();
                    closed = true;
                    break;
                }
                advance!();
            }
            if !closed {
                diagnostics.error(start_line, start_column, format!("missing terminating {c} character"));
            }
        } else if c.is_alphabetic() || c == '_' {
            let (start_line, start_column) = (line, column);
            let mut ident = String::new();
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                ident.push(chars[i]);
                advance!();
            }
            tokens.push(Spanned {
                token: Token::Ident(ident),
                line: start_line,
                column: start_column,
            });
        } else if c.is_whitespace() || c.is_ascii_digit() {
            advance!();
        } else {
            tokens.push(Spanned {
                token: Token::Punct(c),
                line,
                column,
            });
            advance!();
        }
    }

    tokens
}

fn closing(open: char) -> char {
    match open {
        '(' => ')',
        '[' => ']',
        _ => '}',
    }
}

fn check_brackets(tokens: &[Spanned], diagnostics: &mut Diagnostics) {
    let mut stack: Vec<(char, usize, usize)> = Vec::new();

    for spanned in tokens {
        let Token::Punct(c) = spanned.token else {
            continue;
        };
        match c {
            '(' | '[' | '{' => stack.push((c, spanned.line, spanned.column)),
            ')' | ']' | '}' => match stack.pop() {
                Some((open, _, _)) if closing(open) == c => {}
                Some((open, line, column)) => {
                    diagnostics.error(
                        spanned.line,
                        spanned.column,
                        format!("expected '{}' before '{c}'", closing(open)),
                    );
                    diagnostics.error(line, column, format!("to match this '{open}'"));
                }
                None => diagnostics.error(spanned.line, spanned.column, format!("unmatched '{c}'")),
            },
            _ => {}
        }
    }

    for (open, line, column) in stack.into_iter().rev() {
        diagnostics.error(
            line,
            column,
            format!("expected '{}' at end of input to match this '{open}'", closing(open)),
        );
    }
}

fn is_kernel_qualifier(token: &Token) -> bool {
    matches!(token, Token::Ident(s) if s == "__kernel" || s == "kernel")
}

fn collect_kernels(tokens: &[Spanned], diagnostics: &mut Diagnostics) -> Vec<KernelSignature> {
    let mut kernels: Vec<KernelSignature> = Vec::new();
    let mut i = 0;

    while i < tokens.len() {
        if !is_kernel_qualifier(&tokens[i].token) {
            i += 1;
            continue;
        }
        let qualifier = &tokens[i];
        i += 1;

        // Attribute clauses may sit between the qualifier and the return type.
        while matches!(tokens.get(i).map(|t| &t.token), Some(Token::Ident(s)) if s == "__attribute__") {
            i += 1;
            i = skip_group(tokens, i);
        }

        match tokens.get(i).map(|t| &t.token) {
            Some(Token::Ident(ret)) if ret == "void" => i += 1,
            Some(Token::Ident(ret)) => {
                diagnostics.error(
                    tokens[i].line,
                    tokens[i].column,
                    format!("kernel must have void return type, found '{ret}'"),
                );
                i += 1;
                continue;
            }
            _ => {
                diagnostics.error(qualifier.line, qualifier.column, "expected kernel declaration");
                continue;
            }
        }

        let Some(Spanned {
            token: Token::Ident(name),
            line,
            column,
        }) = tokens.get(i)
        else {
            diagnostics.error(qualifier.line, qualifier.column, "expected kernel name");
            continue;
        };
        i += 1;

        if tokens.get(i).map(|t| &t.token) != Some(&Token::Punct('(')) {
            diagnostics.error(*line, *column, format!("expected '(' after kernel name '{name}'"));
            continue;
        }
        let (arity, end) = count_parameters(tokens, i);
        i = end;

        if kernels.iter().any(|k| &k.name == name) {
            diagnostics.error(*line, *column, format!("redefinition of kernel '{name}'"));
            continue;
        }
        kernels.push(KernelSignature {
            name: name.clone(),
            arity,
        });
    }

    kernels
}

/// Skip a parenthesized group starting at `i`; returns the index after it
fn skip_group(tokens: &[Spanned], mut i: usize) -> usize {
    let mut depth = 0usize;
    while let Some(spanned) = tokens.get(i) {
        i += 1;
        match spanned.token {
            Token::Punct('(') => depth += 1,
            Token::Punct(')') => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    break;
                }
            }
            _ if depth == 0 => break,
            _ => {}
        }
    }
    i
}

/// Count the parameters of the list opening at `tokens[open]`
fn count_parameters(tokens: &[Spanned], open: usize) -> (u32, usize) {
    let mut depth = 0usize;
    let mut commas = 0u32;
    let mut idents: Vec<&str> = Vec::new();
    let mut i = open;

    while let Some(spanned) = tokens.get(i) {
        i += 1;
        match &spanned.token {
            Token::Punct('(') => depth += 1,
            Token::Punct(')') => {
                depth -= 1;
                if depth == 0 {
                    break;
                }
            }
            Token::Punct(',') if depth == 1 => commas += 1,
            Token::Ident(s) if depth == 1 => idents.push(s),
            _ => {}
        }
    }

    let arity = match idents.as_slice() {
        [] | ["void"] => 0,
        _ => commas + 1,
    };
    (arity, i)
}
