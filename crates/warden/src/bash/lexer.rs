//! Quote-aware splitting and tokenizing of shell command lines.
//!
//! This is not a shell parser. It knows enough about quoting, escapes and
//! `$(...)`/backtick nesting to find command boundaries, words and
//! redirections, and everything it does not understand is left inside a
//! word where the classifier treats it as an opaque operand.

/// Kind of a redirection operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RedirectKind {
    /// `>`, `2>`, `&>`, `>|`, `<>`
    Write,
    /// `>>`, `2>>`, `&>>`
    Append,
    /// `<`
    Read,
    /// `<<`, `<<-` and `<<<`; the target is not a file
    HereDoc,
    /// `>&N`, `<&N`, `>&-`; the target is a descriptor
    Duplicate,
}

/// One token of a simple command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Token {
    /// A word with quotes removed. Substitutions are kept verbatim.
    Word(String),
    /// A redirection and its target
    Redirect {
        /// Operator kind
        kind: RedirectKind,
        /// Target word
        target: String,
    },
}

/// Expansions found in a command line outside single quotes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Expansions {
    /// Bodies of `$(...)` and backtick substitutions, outermost only
    pub substitutions: Vec<String>,
    /// `$NAME` and `${NAME}` references as written
    pub variables: Vec<String>,
}

/// Index just past the `)` matching the `(` at `open`.
///
/// Returns `chars.len()` when the group is unterminated.
fn skip_group(chars: &[char], open: usize) -> usize {
    let mut depth = 0usize;
    let mut j = open;
    while j < chars.len() {
        match chars[j] {
            '\\' => {
                j += 2;
                continue;
            }
            '\'' => {
                j = skip_single(chars, j);
                continue;
            }
            '"' => {
                j = skip_double(chars, j);
                continue;
            }
            '`' => {
                j = skip_backtick(chars, j);
                continue;
            }
            '(' => depth += 1,
            ')' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return j + 1;
                }
            }
            _ => {}
        }
        j += 1;
    }
    chars.len()
}

fn skip_single(chars: &[char], open: usize) -> usize {
    chars[open + 1..]
        .iter()
        .position(|c| *c == '\'')
        .map_or(chars.len(), |p| open + 1 + p + 1)
}

fn skip_double(chars: &[char], open: usize) -> usize {
    let mut k = open + 1;
    while k < chars.len() {
        match chars[k] {
            '\\' => k += 2,
            '"' => return k + 1,
            '$' if chars.get(k + 1) == Some(&'(') => k = skip_group(chars, k + 1),
            '`' => k = skip_backtick(chars, k),
            _ => k += 1,
        }
    }
    chars.len()
}

fn skip_backtick(chars: &[char], open: usize) -> usize {
    let mut k = open + 1;
    while k < chars.len() {
        match chars[k] {
            '\\' => k += 2,
            '`' => return k + 1,
            _ => k += 1,
        }
    }
    chars.len()
}

fn collect(chars: &[char], from: usize, to: usize) -> String {
    chars[from.min(chars.len())..to.min(chars.len())].iter().collect()
}

/// Split a command line into simple commands at `&&`, `||`, `;`, `|`, `&`
/// and newlines, and at subshell parentheses.
///
/// Operators inside quotes or substitutions do not split. `#` comments are
/// dropped.
pub fn split_subcommands(input: &str) -> Vec<String> {
    let chars: Vec<char> = input.chars().collect();
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut i = 0;

    let flush = |cur: &mut String, out: &mut Vec<String>| {
        let trimmed = cur.trim();
        if !trimmed.is_empty() {
            out.push(trimmed.to_string());
        }
        cur.clear();
    };

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            '\\' => {
                let end = (i + 2).min(chars.len());
                cur.push_str(&collect(&chars, i, end));
                i = end;
            }
            '\'' => {
                let end = skip_single(&chars, i);
                cur.push_str(&collect(&chars, i, end));
                i = end;
            }
            '"' => {
                let end = skip_double(&chars, i);
                cur.push_str(&collect(&chars, i, end));
                i = end;
            }
            '`' => {
                let end = skip_backtick(&chars, i);
                cur.push_str(&collect(&chars, i, end));
                i = end;
            }
            '$' if next == Some('(') => {
                let end = skip_group(&chars, i + 1);
                cur.push_str(&collect(&chars, i, end));
                i = end;
            }
            '#' if cur.is_empty() || cur.ends_with(char::is_whitespace) => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            ';' | '\n' | '(' | ')' => {
                flush(&mut cur, &mut out);
                i += 1;
            }
            '&' if next == Some('>') || cur.ends_with('>') || cur.ends_with('<') => {
                cur.push(c);
                i += 1;
            }
            '&' => {
                flush(&mut cur, &mut out);
                i += if next == Some('&') { 2 } else { 1 };
            }
            '|' if cur.ends_with('>') => {
                cur.push(c);
                i += 1;
            }
            '|' => {
                flush(&mut cur, &mut out);
                i += if matches!(next, Some('|') | Some('&')) { 2 } else { 1 };
            }
            _ => {
                cur.push(c);
                i += 1;
            }
        }
    }
    flush(&mut cur, &mut out);
    out
}

/// Tokenize one simple command into words and redirections.
pub fn tokenize(command: &str) -> Vec<Token> {
    let chars: Vec<char> = command.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        if chars[i].is_whitespace() {
            i += 1;
            continue;
        }

        if let Some((kind, after)) = redirect_operator(&chars, i) {
            i = after;
            while i < chars.len() && chars[i].is_whitespace() {
                i += 1;
            }
            if i >= chars.len() {
                break;
            }
            let (target, after) = read_word(&chars, i);
            i = after;
            let kind = match kind {
                OperatorKind::Plain(kind) => kind,
                OperatorKind::DuplicateOrWrite => {
                    if target == "-" || (!target.is_empty() && target.chars().all(|c| c.is_ascii_digit())) {
                        RedirectKind::Duplicate
                    } else {
                        RedirectKind::Write
                    }
                }
            };
            tokens.push(Token::Redirect { kind, target });
            continue;
        }

        let (word, after) = read_word(&chars, i);
        i = after.max(i + 1);
        if !word.is_empty() {
            tokens.push(Token::Word(word));
        }
    }
    tokens
}

enum OperatorKind {
    Plain(RedirectKind),
    DuplicateOrWrite,
}

/// Recognize a redirection operator at `i`, with an optional descriptor
/// prefix. Returns the operator kind and the index after it.
fn redirect_operator(chars: &[char], i: usize) -> Option<(OperatorKind, usize)> {
    let mut j = i;
    while j < chars.len() && chars[j].is_ascii_digit() {
        j += 1;
    }
    let at = |k: usize| chars.get(k).copied();

    if j == i && at(j) == Some('&') && at(j + 1) == Some('>') {
        return if at(j + 2) == Some('>') {
            Some((OperatorKind::Plain(RedirectKind::Append), j + 3))
        } else {
            Some((OperatorKind::Plain(RedirectKind::Write), j + 2))
        };
    }

    match (at(j), at(j + 1), at(j + 2)) {
        (Some('>'), Some('>'), _) => Some((OperatorKind::Plain(RedirectKind::Append), j + 2)),
        (Some('>'), Some('&'), _) => Some((OperatorKind::DuplicateOrWrite, j + 2)),
        (Some('>'), Some('|'), _) => Some((OperatorKind::Plain(RedirectKind::Write), j + 2)),
        (Some('>'), _, _) => Some((OperatorKind::Plain(RedirectKind::Write), j + 1)),
        (Some('<'), Some('<'), Some('<')) => Some((OperatorKind::Plain(RedirectKind::HereDoc), j + 3)),
        (Some('<'), Some('<'), Some('-')) => Some((OperatorKind::Plain(RedirectKind::HereDoc), j + 3)),
        (Some('<'), Some('<'), _) => Some((OperatorKind::Plain(RedirectKind::HereDoc), j + 2)),
        (Some('<'), Some('&'), _) => Some((OperatorKind::Plain(RedirectKind::Duplicate), j + 2)),
        (Some('<'), Some('>'), _) => Some((OperatorKind::Plain(RedirectKind::Write), j + 2)),
        (Some('<'), _, _) => Some((OperatorKind::Plain(RedirectKind::Read), j + 1)),
        _ => None,
    }
}

/// Read one word starting at `i`, removing quotes. Stops at unquoted
/// whitespace or a redirection operator.
fn read_word(chars: &[char], start: usize) -> (String, usize) {
    let mut word = String::new();
    let mut i = start;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => break,
            '>' | '<' => break,
            '&' if chars.get(i + 1) == Some(&'>') => break,
            '\\' => {
                if let Some(n) = chars.get(i + 1) {
                    word.push(*n);
                }
                i += 2;
            }
            '\'' => {
                let end = skip_single(chars, i);
                word.push_str(&collect(chars, i + 1, end.saturating_sub(1).max(i + 1)));
                i = end;
            }
            '"' => {
                let end = skip_double(chars, i);
                let inner = collect(chars, i + 1, end.saturating_sub(1).max(i + 1));
                word.push_str(&unescape_double(&inner));
                i = end;
            }
            '`' => {
                let end = skip_backtick(chars, i);
                word.push_str(&collect(chars, i, end));
                i = end;
            }
            '$' if chars.get(i + 1) == Some(&'(') => {
                let end = skip_group(chars, i + 1);
                word.push_str(&collect(chars, i, end));
                i = end;
            }
            _ => {
                word.push(c);
                i += 1;
            }
        }
    }
    (word, i)
}

fn unescape_double(inner: &str) -> String {
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\'
            && let Some(&n) = chars.peek()
            && matches!(n, '"' | '\\' | '$' | '`')
        {
            out.push(n);
            chars.next();
            continue;
        }
        out.push(c);
    }
    out
}

/// Find substitutions and variable references outside single quotes.
pub fn scan_expansions(input: &str) -> Expansions {
    let chars: Vec<char> = input.chars().collect();
    let mut found = Expansions::default();
    let mut in_double = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            '\\' => i += 2,
            '\'' if !in_double => i = skip_single(&chars, i),
            '"' => {
                in_double = !in_double;
                i += 1;
            }
            '$' if next == Some('(') && chars.get(i + 2) == Some(&'(') => {
                // Arithmetic expansion.
                i = skip_group(&chars, i + 1);
            }
            '$' if next == Some('(') => {
                let end = skip_group(&chars, i + 1);
                let body_end = if chars.get(end.wrapping_sub(1)) == Some(&')') { end - 1 } else { end };
                found.substitutions.push(collect(&chars, i + 2, body_end));
                i = end;
            }
            '`' => {
                let end = skip_backtick(&chars, i);
                let body_end = if end > i + 1 && chars.get(end - 1) == Some(&'`') { end - 1 } else { end };
                found.substitutions.push(collect(&chars, i + 1, body_end));
                i = end;
            }
            '$' if next == Some('{') => {
                let end = chars[i..]
                    .iter()
                    .position(|c| *c == '}')
                    .map_or(chars.len(), |p| i + p + 1);
                found.variables.push(collect(&chars, i, end));
                i = end;
            }
            '$' if next.is_some_and(|n| n.is_ascii_alphabetic() || n == '_') => {
                let mut end = i + 1;
                while end < chars.len() && (chars[end].is_ascii_alphanumeric() || chars[end] == '_') {
                    end += 1;
                }
                found.variables.push(collect(&chars, i, end));
                i = end;
            }
            _ => i += 1,
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(command: &str) -> Vec<String> {
        tokenize(command)
            .into_iter()
            .filter_map(|t| match t {
                Token::Word(w) => Some(w),
                Token::Redirect { .. } => None,
            })
            .collect()
    }

    fn redirects(command: &str) -> Vec<(RedirectKind, String)> {
        tokenize(command)
            .into_iter()
            .filter_map(|t| match t {
                Token::Redirect { kind, target } => Some((kind, target)),
                Token::Word(_) => None,
            })
            .collect()
    }

    #[test]
    fn test_split_operators() {
        assert_eq!(
            split_subcommands("cat a && echo 'x' > b; rm c | wc -l || true & sleep 1\nls"),
            vec!["cat a", "echo 'x' > b", "rm c", "wc -l", "true", "sleep 1", "ls"]
        );
    }

    #[test]
    fn test_split_respects_quotes_and_substitutions() {
        assert_eq!(
            split_subcommands(r#"echo "a; b && c" 'd | e' $(f; g) `h && i`; j"#),
            vec![r#"echo "a; b && c" 'd | e' $(f; g) `h && i`"#, "j"]
        );
        assert_eq!(split_subcommands(r"echo a\;b"), vec![r"echo a\;b"]);
    }

    #[test]
    fn test_split_keeps_redirect_ampersands() {
        assert_eq!(
            split_subcommands("make 2>&1 | tee log; cmd &> out"),
            vec!["make 2>&1", "tee log", "cmd &> out"]
        );
    }

    #[test]
    fn test_split_subshell_and_comments() {
        assert_eq!(
            split_subcommands("(cd sub; rm x) # trailing; comment\necho done"),
            vec!["cd sub", "rm x", "echo done"]
        );
    }

    #[test]
    fn test_tokenize_quotes() {
        assert_eq!(
            words(r#"grep -n "two words" 'single $x' esc\ aped"#),
            vec!["grep", "-n", "two words", "single $x", "esc aped"]
        );
    }

    #[test]
    fn test_tokenize_redirections() {
        assert_eq!(
            redirects("cmd > out.txt 2>err.log >>app.log < in.txt &> all.log"),
            vec![
                (RedirectKind::Write, "out.txt".to_string()),
                (RedirectKind::Write, "err.log".to_string()),
                (RedirectKind::Append, "app.log".to_string()),
                (RedirectKind::Read, "in.txt".to_string()),
                (RedirectKind::Write, "all.log".to_string()),
            ]
        );
        assert_eq!(words("echo hi>out.txt"), vec!["echo", "hi"]);
    }

    #[test]
    fn test_tokenize_duplications() {
        assert_eq!(
            redirects("cmd 2>&1 >&- <&3 >& both.log <<EOF"),
            vec![
                (RedirectKind::Duplicate, "1".to_string()),
                (RedirectKind::Duplicate, "-".to_string()),
                (RedirectKind::Duplicate, "3".to_string()),
                (RedirectKind::Write, "both.log".to_string()),
                (RedirectKind::HereDoc, "EOF".to_string()),
            ]
        );
    }

    #[test]
    fn test_tokenize_keeps_substitution_whole() {
        assert_eq!(words("cat $(echo a b) `x y`"), vec!["cat", "$(echo a b)", "`x y`"]);
    }

    #[test]
    fn test_scan_expansions() {
        let found = scan_expansions(r#"cat $(echo secret.txt) "$HOME/x" '$NOT' ${DIR}/y `pwd` $((1+2))"#);
        assert_eq!(found.substitutions, vec!["echo secret.txt", "pwd"]);
        assert_eq!(found.variables, vec!["$HOME", "${DIR}"]);
    }

    #[test]
    fn test_scan_nested_substitution() {
        let found = scan_expansions("cat $(cat $(echo name.txt))");
        assert_eq!(found.substitutions, vec!["cat $(echo name.txt)"]);
    }
}
