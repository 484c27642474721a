/// Quote an SQL identifier, doubling any embedded double quotes.
///
/// Table and column names can't be bound as parameters, so policy
/// identifiers go through here before being interpolated.
pub fn quote_ident(ident: &str) -> String {
    let mut quoted = String::with_capacity(ident.len() + 2);
    quoted.push('"');
    for c in ident.chars() {
        if c == '"' {
            quoted.push('"');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_plain() {
        assert_eq!(quote_ident("orders"), "\"orders\"");
    }

    #[test]
    fn test_quote_preserves_case() {
        assert_eq!(quote_ident("CreatedAt"), "\"CreatedAt\"");
    }

    #[test]
    fn test_quote_embedded_quotes() {
        assert_eq!(quote_ident(r#"a"; DROP TABLE x; --"#), r#""a""; DROP TABLE x; --""#);
    }
}
