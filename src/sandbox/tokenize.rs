//! Lexical tokenizer for SQL-like query strings
//!
//! Splits a query into tokens without interpreting grammar. String
//! literals, quoted identifiers and comments come out as single tokens with
//! their delimiters, which is what injection heuristics in policy scripts
//! compare against the user input.

const MULTI_CHAR_OPERATORS: [&str; 10] = ["<=>", "<=", ">=", "<>", "!=", "||", "&&", ":=", "<<", ">>"];

/// Tokenize `query`
///
/// Unterminated strings and comments run to the end of the input.
pub fn sql_tokenize(query: &str) -> Vec<String> {
    let bytes = query.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let rest = &query[i..];
        let Some(c) = rest.chars().next() else {
            break;
        };

        if c.is_whitespace() {
            i += c.len_utf8();
            continue;
        }

        let len = if c == '\'' || c == '"' || c == '`' {
            quoted_len(rest, c)
        } else if rest.starts_with("--") || c == '#' {
            rest.find('\n').unwrap_or(rest.len())
        } else if rest.starts_with("/*") {
            rest[2..].find("*/").map(|end| end + 4).unwrap_or(rest.len())
        } else if c.is_ascii_digit() {
            number_len(rest)
        } else if is_word_char(c) {
            rest.find(|ch: char| !is_word_char(ch)).unwrap_or(rest.len())
        } else {
            MULTI_CHAR_OPERATORS
                .iter()
                .find(|op| rest.starts_with(*op))
                .map(|op| op.len())
                .unwrap_or(c.len_utf8())
        };

        tokens.push(rest[..len].to_string());
        i += len;
    }

    tokens
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$' || c == '@'
}

/// Byte length of a quoted run starting at `rest[0] == quote`
///
/// Backslash escapes and doubled quotes stay inside the token.
fn quoted_len(rest: &str, quote: char) -> usize {
    let mut chars = rest.char_indices().skip(1).peekable();
    while let Some((idx, ch)) = chars.next() {
        if ch == '\\' && quote != '`' {
            chars.next();
        } else if ch == quote {
            match chars.peek() {
                Some((_, next)) if *next == quote => {
                    chars.next();
                }
                _ => return idx + ch.len_utf8(),
            }
        }
    }
    rest.len()
}

fn number_len(rest: &str) -> usize {
    if rest.starts_with("0x") || rest.starts_with("0X") {
        return 2 + rest[2..]
            .find(|ch: char| !ch.is_ascii_hexdigit())
            .unwrap_or(rest.len() - 2);
    }
    rest.find(|ch: char| !(ch.is_ascii_digit() || ch == '.'))
        .unwrap_or(rest.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_select() {
        assert_eq!(
            sql_tokenize("SELECT * FROM users WHERE id=1"),
            vec!["SELECT", "*", "FROM", "users", "WHERE", "id", "=", "1"]
        );
    }

    #[test]
    fn test_string_literals_stay_whole() {
        assert_eq!(
            sql_tokenize(r#"select 'it''s', "a\"b" from t"#),
            vec!["select", "'it''s'", ",", r#""a\"b""#, "from", "t"]
        );
    }

    #[test]
    fn test_injection_shape() {
        let tokens = sql_tokenize("select * from u where name='' or '1'='1' -- x");
        assert_eq!(tokens.last().unwrap(), "-- x");
        assert!(tokens.contains(&"or".to_string()));
        assert_eq!(tokens.iter().filter(|t| t.starts_with('\'')).count(), 3);
    }

    #[test]
    fn test_comments() {
        assert_eq!(
            sql_tokenize("select /*!50000 union*/ 1 # tail\nfrom dual"),
            vec!["select", "/*!50000 union*/", "1", "# tail", "from", "dual"]
        );
    }

    #[test]
    fn test_operators_and_numbers() {
        assert_eq!(
            sql_tokenize("a<=>b and c<>0x1F or d>=3.14"),
            vec!["a", "<=>", "b", "and", "c", "<>", "0x1F", "or", "d", ">=", "3.14"]
        );
    }

    #[test]
    fn test_unterminated_runs_to_end() {
        assert_eq!(sql_tokenize("select 'abc"), vec!["select", "'abc"]);
        assert_eq!(sql_tokenize("1 /* open"), vec!["1", "/* open"]);
    }

    #[test]
    fn test_non_ascii() {
        assert_eq!(sql_tokenize("select 名字 from t"), vec!["select", "名字", "from", "t"]);
        assert!(sql_tokenize("").is_empty());
        assert!(sql_tokenize("   \n\t").is_empty());
    }
}
