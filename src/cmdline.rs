//! Command-line string building and splitting.
//!
//! Two dialects are supported:
//!
//! - Windows / MS C runtime: [`join_windows`] builds a single command line
//!   from an argument vector, [`split_windows`] parses it back with the same
//!   rules the C runtime applies to `argv`.
//! - POSIX shell: [`quote`] and [`join_posix`] produce strings that
//!   `/bin/sh` splits back into the original words.
//!
//! # Windows quoting rules
//!
//! 1. Arguments are separated by spaces or tabs.
//! 2. An argument containing whitespace, or an empty argument, is wrapped
//!    in double quotes.
//! 3. A literal double quote is written as `\"`.
//! 4. Backslashes are literal unless they immediately precede a double
//!    quote, in which case each one is doubled.
//!
//! ```ignore
//! let line = procmux::cmdline::join_windows(["a b", "c\"d", "e\\", ""]);
//! assert_eq!(line, r#""a b" c\"d e\ """#);
//! ```

/// Joins `args` into a Windows command line.
pub fn join_windows<I, S>(args: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut line = String::new();
    for (index, arg) in args.into_iter().enumerate() {
        let arg = arg.as_ref();
        if index > 0 {
            line.push(' ');
        }
        let needs_quotes = arg.is_empty() || arg.contains([' ', '\t']);
        if needs_quotes {
            line.push('"');
        }
        let mut backslashes = 0usize;
        for c in arg.chars() {
            match c {
                '\\' => backslashes += 1,
                '"' => {
                    push_backslashes(&mut line, backslashes * 2);
                    backslashes = 0;
                    line.push_str("\\\"");
                }
                _ => {
                    push_backslashes(&mut line, backslashes);
                    backslashes = 0;
                    line.push(c);
                }
            }
        }
        push_backslashes(&mut line, backslashes);
        if needs_quotes {
            // The closing quote turns trailing backslashes into escapes.
            push_backslashes(&mut line, backslashes);
            line.push('"');
        }
    }
    line
}

fn push_backslashes(out: &mut String, count: usize) {
    out.extend(std::iter::repeat_n('\\', count));
}

/// Splits a Windows command line into arguments.
#[must_use]
pub fn split_windows(line: &str) -> Vec<String> {
    let chars: Vec<char> = line.chars().collect();
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut in_quotes = false;
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            ' ' | '\t' if !in_quotes => {
                if in_token {
                    args.push(std::mem::take(&mut current));
                    in_token = false;
                }
                i += 1;
            }
            '\\' => {
                let start = i;
                while i < chars.len() && chars[i] == '\\' {
                    i += 1;
                }
                let run = i - start;
                if chars.get(i) == Some(&'"') {
                    push_backslashes(&mut current, run / 2);
                    if run % 2 == 1 {
                        current.push('"');
                        i += 1;
                    }
                } else {
                    push_backslashes(&mut current, run);
                }
                in_token = true;
            }
            '"' => {
                in_quotes = !in_quotes;
                in_token = true;
                i += 1;
            }
            c => {
                current.push(c);
                in_token = true;
                i += 1;
            }
        }
    }
    if in_token {
        args.push(current);
    }
    args
}

fn is_shell_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || "@%+=:,./-_".contains(c)
}

/// Quotes `word` so a POSIX shell reads it back as a single word.
#[must_use]
pub fn quote(word: &str) -> String {
    if word.is_empty() {
        return "''".to_string();
    }
    if word.chars().all(is_shell_safe) {
        return word.to_string();
    }
    format!("'{}'", word.replace('\'', "'\"'\"'"))
}

/// Quotes and joins `words` into a POSIX shell command string.
pub fn join_posix<I, S>(words: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    words
        .into_iter()
        .map(|word| quote(word.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;
    use proptest::prelude::*;

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    #[test]
    fn join_matches_reference_line() {
        init_test("join_matches_reference_line");
        let line = join_windows(["a b", "c\"d", "e\\", ""]);
        crate::assert_with_log!(
            line == r#""a b" c\"d e\ """#,
            "joined",
            r#""a b" c\"d e\ """#,
            line
        );
        let args = split_windows(&line);
        crate::assert_with_log!(
            args == ["a b", "c\"d", "e\\", ""],
            "split back",
            ["a b", "c\"d", "e\\", ""],
            args
        );
        crate::test_complete!("join_matches_reference_line");
    }

    #[test]
    fn backslashes_before_quotes() {
        init_test("backslashes_before_quotes");
        let cases: [(&[&str], &str); 4] = [
            (&["ab\\\"c", "\\", "d"], r#"ab\\\"c \ d"#),
            (&["a\\\\\\b", "de fg", "h"], r#"a\\\b "de fg" h"#),
            (&["a\\\"b", "c", "d"], r#"a\\\"b c d"#),
            (&["a b\\"], r#""a b\\""#),
        ];
        for (args, expected) in cases {
            let line = join_windows(args.iter().copied());
            crate::assert_with_log!(line == expected, "join", expected, line);
            let back = split_windows(&line);
            crate::assert_with_log!(back == args, "split", args, back);
        }
        crate::test_complete!("backslashes_before_quotes");
    }

    #[test]
    fn posix_quote() {
        init_test("posix_quote");
        crate::assert_with_log!(quote("") == "''", "empty", "''", quote(""));
        crate::assert_with_log!(
            quote("plain-word_1.txt") == "plain-word_1.txt",
            "safe",
            "plain-word_1.txt",
            quote("plain-word_1.txt")
        );
        crate::assert_with_log!(
            quote("it's here") == r#"'it'"'"'s here'"#,
            "single quote",
            r#"'it'"'"'s here'"#,
            quote("it's here")
        );
        let joined = join_posix(["echo", "a b", "$HOME"]);
        crate::assert_with_log!(
            joined == "echo 'a b' '$HOME'",
            "join",
            "echo 'a b' '$HOME'",
            joined
        );
        crate::test_complete!("posix_quote");
    }

    proptest! {
        #[test]
        fn windows_round_trip(args in prop::collection::vec("[ab \\t\"\\\\]{0,8}", 0..6)) {
            let line = join_windows(&args);
            prop_assert_eq!(split_windows(&line), args);
        }
    }
}
