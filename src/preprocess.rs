//! Text preprocessor
//!
//! Expands `<? ?>` directives before any parsing happens. Directives are
//! written in a small expression language: numeric assignments, arithmetic
//! and comparisons, and `printf` which appends formatted text to the
//! expansion. Variables are seeded from the file's `config:` constants, so
//! a directive like `<?printf("%d", order)?>` emits the configured value,
//! and generated text (slider lines included) is parsed as if it had been
//! written by hand.
//!
//! The whole load aborts when a directive fails to evaluate.

use crate::types::{ParseError, Real};
use std::collections::HashMap;

/// Expand every `<? ?>` directive in `text`. `seed` provides the initial
/// variable environment, keyed by lowercase identifier.
pub fn preprocess(text: &str, seed: &HashMap<String, Real>) -> Result<String, ParseError> {
    if !text.contains("<?") {
        return Ok(text.to_string());
    }

    let mut env = seed.clone();
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    let mut line: u32 = 0;

    while let Some(start) = rest.find("<?") {
        out.push_str(&rest[..start]);
        line += count_newlines(&rest[..start]);

        let after = &rest[start + 2..];
        let end = after.find("?>").ok_or_else(|| ParseError {
            line,
            message: "unterminated preprocessor directive".to_string(),
        })?;

        let code = &after[..end];
        let expansion =
            eval_directive(code, &mut env).map_err(|message| ParseError { line, message })?;
        out.push_str(&expansion);

        line += count_newlines(code);
        rest = &after[end + 2..];
    }
    out.push_str(rest);

    Ok(out)
}

fn count_newlines(text: &str) -> u32 {
    text.bytes().filter(|&b| b == b'\n').count() as u32
}

//------------------------------------------------------------------------------
// directive language

#[derive(Clone, Debug, PartialEq)]
enum Tok {
    Num(Real),
    Ident(String),
    Str(String),
    Punct(&'static str),
}

fn tokenize(code: &str) -> Result<Vec<Tok>, String> {
    let mut toks = Vec::new();
    let bytes = code.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        if c.is_ascii_whitespace() {
            i += 1;
        } else if code[i..].starts_with("//") {
            while i < bytes.len() && bytes[i] != b'\n' {
                i += 1;
            }
        } else if code[i..].starts_with("/*") {
            match code[i + 2..].find("*/") {
                Some(pos) => i += pos + 4,
                None => i = bytes.len(),
            }
        } else if c.is_ascii_digit() || (c == '.' && matches!(bytes.get(i + 1), Some(b) if b.is_ascii_digit())) {
            let start = i;
            while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
                i += 1;
            }
            if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
                let mut j = i + 1;
                if matches!(bytes.get(j), Some(b'+') | Some(b'-')) {
                    j += 1;
                }
                if matches!(bytes.get(j), Some(b) if b.is_ascii_digit()) {
                    i = j;
                    while i < bytes.len() && bytes[i].is_ascii_digit() {
                        i += 1;
                    }
                }
            }
            let value = code[start..i]
                .parse::<Real>()
                .map_err(|_| format!("bad number: `{}`", &code[start..i]))?;
            toks.push(Tok::Num(value));
        } else if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < bytes.len()
                && ((bytes[i] as char).is_ascii_alphanumeric()
                    || bytes[i] == b'_'
                    || bytes[i] == b'.')
            {
                i += 1;
            }
            toks.push(Tok::Ident(code[start..i].to_ascii_lowercase()));
        } else if c == '"' {
            let start = i + 1;
            let close = code[start..]
                .find('"')
                .ok_or_else(|| "unterminated string".to_string())?;
            toks.push(Tok::Str(code[start..start + close].to_string()));
            i = start + close + 1;
        } else {
            let two: Option<&'static str> = if code[i..].starts_with("==") {
                Some("==")
            } else if code[i..].starts_with("!=") {
                Some("!=")
            } else if code[i..].starts_with("<=") {
                Some("<=")
            } else if code[i..].starts_with(">=") {
                Some(">=")
            } else {
                None
            };
            if let Some(op) = two {
                toks.push(Tok::Punct(op));
                i += 2;
                continue;
            }
            let one: &'static str = match c {
                '+' => "+",
                '-' => "-",
                '*' => "*",
                '/' => "/",
                '%' => "%",
                '=' => "=",
                '<' => "<",
                '>' => ">",
                '(' => "(",
                ')' => ")",
                ',' => ",",
                ';' => ";",
                _ => return Err(format!("unexpected character `{}`", c)),
            };
            toks.push(Tok::Punct(one));
            i += 1;
        }
    }

    Ok(toks)
}

struct DirectiveEval<'a> {
    toks: Vec<Tok>,
    pos: usize,
    env: &'a mut HashMap<String, Real>,
    out: String,
}

fn eval_directive(code: &str, env: &mut HashMap<String, Real>) -> Result<String, String> {
    let mut eval = DirectiveEval {
        toks: tokenize(code)?,
        pos: 0,
        env,
        out: String::new(),
    };
    eval.run()?;
    Ok(eval.out)
}

impl DirectiveEval<'_> {
    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos)
    }

    fn eat_punct(&mut self, p: &str) -> bool {
        if matches!(self.peek(), Some(Tok::Punct(q)) if *q == p) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn run(&mut self) -> Result<(), String> {
        while self.pos < self.toks.len() {
            if self.eat_punct(";") {
                continue;
            }
            self.statement()?;
            if self.pos < self.toks.len() && !self.eat_punct(";") {
                return Err("expected `;` between statements".to_string());
            }
        }
        Ok(())
    }

    fn statement(&mut self) -> Result<(), String> {
        // assignment: ident `=` (but not `==`)
        if let (Some(Tok::Ident(name)), Some(Tok::Punct("="))) =
            (self.toks.get(self.pos), self.toks.get(self.pos + 1))
        {
            let name = name.clone();
            self.pos += 2;
            let value = self.expr()?;
            self.env.insert(name, value);
            return Ok(());
        }
        self.expr()?;
        Ok(())
    }

    fn expr(&mut self) -> Result<Real, String> {
        let mut lhs = self.additive()?;
        loop {
            let op = match self.peek() {
                Some(Tok::Punct(op @ ("==" | "!=" | "<" | "<=" | ">" | ">="))) => *op,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.additive()?;
            let holds = match op {
                "==" => lhs == rhs,
                "!=" => lhs != rhs,
                "<" => lhs < rhs,
                "<=" => lhs <= rhs,
                ">" => lhs > rhs,
                _ => lhs >= rhs,
            };
            lhs = if holds { 1.0 } else { 0.0 };
        }
        Ok(lhs)
    }

    fn additive(&mut self) -> Result<Real, String> {
        let mut lhs = self.multiplicative()?;
        loop {
            if self.eat_punct("+") {
                lhs += self.multiplicative()?;
            } else if self.eat_punct("-") {
                lhs -= self.multiplicative()?;
            } else {
                break;
            }
        }
        Ok(lhs)
    }

    fn multiplicative(&mut self) -> Result<Real, String> {
        let mut lhs = self.unary()?;
        loop {
            if self.eat_punct("*") {
                lhs *= self.unary()?;
            } else if self.eat_punct("/") {
                let rhs = self.unary()?;
                lhs = if rhs != 0.0 { lhs / rhs } else { 0.0 };
            } else if self.eat_punct("%") {
                let rhs = self.unary()?;
                lhs = if rhs != 0.0 { lhs % rhs } else { 0.0 };
            } else {
                break;
            }
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Real, String> {
        if self.eat_punct("-") {
            return Ok(-self.unary()?);
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Real, String> {
        match self.toks.get(self.pos).cloned() {
            Some(Tok::Num(value)) => {
                self.pos += 1;
                Ok(value)
            }
            Some(Tok::Punct("(")) => {
                self.pos += 1;
                let value = self.expr()?;
                if !self.eat_punct(")") {
                    return Err("expected `)`".to_string());
                }
                Ok(value)
            }
            Some(Tok::Ident(name)) => {
                self.pos += 1;
                if self.eat_punct("(") {
                    if name != "printf" {
                        return Err(format!("unknown function: `{}`", name));
                    }
                    return self.printf_call();
                }
                // undefined variables read as zero
                Ok(self.env.get(&name).copied().unwrap_or(0.0))
            }
            Some(Tok::Str(_)) => Err("unexpected string".to_string()),
            _ => Err("unexpected end of directive".to_string()),
        }
    }

    fn printf_call(&mut self) -> Result<Real, String> {
        let fmt = match self.toks.get(self.pos).cloned() {
            Some(Tok::Str(fmt)) => {
                self.pos += 1;
                fmt
            }
            _ => return Err("printf needs a format string".to_string()),
        };

        let mut args = Vec::new();
        while self.eat_punct(",") {
            args.push(self.expr()?);
        }
        if !self.eat_punct(")") {
            return Err("expected `)` after printf arguments".to_string());
        }

        let formatted = format_printf(&fmt, &args)?;
        self.out.push_str(&formatted);
        Ok(0.0)
    }
}

fn format_printf(fmt: &str, args: &[Real]) -> Result<String, String> {
    let mut out = String::with_capacity(fmt.len());
    let mut chars = fmt.chars().peekable();
    let mut next_arg = 0;
    let arg = |next_arg: &mut usize| -> Real {
        let value = args.get(*next_arg).copied().unwrap_or(0.0);
        *next_arg += 1;
        value
    };

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        // optional zero-pad width and precision, e.g. %02d or %.3f
        let mut zero_pad = false;
        let mut width = 0usize;
        let mut precision: Option<usize> = None;
        if matches!(chars.peek(), Some('0')) {
            zero_pad = true;
            chars.next();
        }
        while matches!(chars.peek(), Some(d) if d.is_ascii_digit()) {
            width = width * 10 + chars.next().unwrap().to_digit(10).unwrap() as usize;
        }
        if matches!(chars.peek(), Some('.')) {
            chars.next();
            let mut p = 0usize;
            while matches!(chars.peek(), Some(d) if d.is_ascii_digit()) {
                p = p * 10 + chars.next().unwrap().to_digit(10).unwrap() as usize;
            }
            precision = Some(p);
        }
        match chars.next() {
            Some('%') => out.push('%'),
            Some('d') | Some('i') => {
                let value = arg(&mut next_arg) as i64;
                if zero_pad {
                    out.push_str(&format!("{:0width$}", value, width = width));
                } else {
                    out.push_str(&format!("{:width$}", value, width = width));
                }
            }
            Some('f') => {
                let value = arg(&mut next_arg);
                let prec = precision.unwrap_or(6);
                out.push_str(&format!("{:.prec$}", value, prec = prec));
            }
            Some('g') | Some('s') => {
                let value = arg(&mut next_arg);
                out.push_str(&format!("{}", value));
            }
            Some(other) => return Err(format!("unsupported format `%{}`", other)),
            None => return Err("dangling `%` in format string".to_string()),
        }
    }

    Ok(out)
}
