//! Command line filter expressions
//!
//! One argument is one filter set: comma separated `key<op>value` terms with
//! `op` one of `=`, `!=`, `=~`, `!~`. Values may be double quoted to hold
//! commas; `\"` and `\\` are unescaped inside quotes.

use anyhow::{anyhow, bail, Result};
use ixdb_core::Scope;
use ixdb_index::TagFilters;

/// One parsed `key<op>value` term
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterTerm {
    pub key: String,
    pub value: String,
    pub is_negative: bool,
    pub is_regexp: bool,
}

/// Parse `account:project`
pub fn parse_scope(s: &str) -> std::result::Result<Scope, String> {
    let (account, project) = s
        .split_once(':')
        .ok_or_else(|| format!("expected account:project, got {:?}", s))?;
    let account = account
        .parse()
        .map_err(|e| format!("bad account id {:?}: {}", account, e))?;
    let project = project
        .parse()
        .map_err(|e| format!("bad project id {:?}: {}", project, e))?;
    Ok(Scope::new(account, project))
}

/// Split a filter set expression into terms
pub fn parse_terms(expr: &str) -> Result<Vec<FilterTerm>> {
    let expr = expr.trim();
    let expr = expr
        .strip_prefix('{')
        .and_then(|e| e.strip_suffix('}'))
        .unwrap_or(expr);

    let mut terms = Vec::new();
    let mut rest = expr.trim_start();
    while !rest.is_empty() {
        let (term, tail) = parse_term(rest)?;
        terms.push(term);
        rest = tail.trim_start();
        match rest.strip_prefix(',') {
            Some(tail) => rest = tail.trim_start(),
            None if rest.is_empty() => {}
            None => bail!("expected ',' before {:?}", rest),
        }
    }
    Ok(terms)
}

fn parse_term(s: &str) -> Result<(FilterTerm, &str)> {
    let op_start = s
        .find(|c| c == '=' || c == '!')
        .ok_or_else(|| anyhow!("missing operator in {:?}", s))?;
    let key = s[..op_start].trim().to_string();
    let after = &s[op_start..];
    let (is_negative, is_regexp, op_len) = if after.starts_with("!=") {
        (true, false, 2)
    } else if after.starts_with("!~") {
        (true, true, 2)
    } else if after.starts_with("=~") {
        (false, true, 2)
    } else if after.starts_with('=') {
        (false, false, 1)
    } else {
        bail!("unknown operator in {:?}", s);
    };

    let (value, tail) = parse_value(after[op_len..].trim_start())?;
    Ok((
        FilterTerm {
            key,
            value,
            is_negative,
            is_regexp,
        },
        tail,
    ))
}

fn parse_value(s: &str) -> Result<(String, &str)> {
    let quoted = match s.strip_prefix('"') {
        Some(quoted) => quoted,
        None => {
            let end = s.find(',').unwrap_or(s.len());
            return Ok((s[..end].trim_end().to_string(), &s[end..]));
        }
    };

    let mut value = String::new();
    let mut chars = quoted.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '"' => return Ok((value, &quoted[i + 1..])),
            '\\' => match chars.next() {
                Some((_, escaped)) => value.push(escaped),
                None => break,
            },
            c => value.push(c),
        }
    }
    bail!("unterminated quoted value in {:?}", s)
}

/// Compile one filter set expression
pub fn build_tag_filters(scope: Scope, expr: &str, match_cache_size: usize) -> Result<TagFilters> {
    let mut tfs = TagFilters::new(scope).with_match_cache_size(match_cache_size);
    for term in parse_terms(expr)? {
        tfs.add(&term.key, &term.value, term.is_negative, term.is_regexp)?;
    }
    Ok(tfs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn term(key: &str, value: &str, is_negative: bool, is_regexp: bool) -> FilterTerm {
        FilterTerm {
            key: key.to_string(),
            value: value.to_string(),
            is_negative,
            is_regexp,
        }
    }

    #[test]
    fn test_operators() {
        let terms = parse_terms(r#"n=1, j!=foo,i=~".+" ,i!~2.*"#).unwrap();
        assert_eq!(
            terms,
            vec![
                term("n", "1", false, false),
                term("j", "foo", true, false),
                term("i", ".+", false, true),
                term("i", "2.*", true, true),
            ]
        );
    }

    #[test]
    fn test_quoted_values() {
        let terms = parse_terms(r#"{__name__="cpu", path=~"a,b|c\"d", i=""}"#).unwrap();
        assert_eq!(
            terms,
            vec![
                term("__name__", "cpu", false, false),
                term("path", "a,b|c\"d", false, true),
                term("i", "", false, false),
            ]
        );
    }

    #[test]
    fn test_malformed() {
        assert!(parse_terms("novalue").is_err());
        assert!(parse_terms(r#"a="open"#).is_err());
        assert!(parse_terms(r#"a="x" b="y""#).is_err());
        assert!(parse_terms("").unwrap().is_empty());
    }

    #[test]
    fn test_scope() {
        assert_eq!(parse_scope("12:34").unwrap(), Scope::new(12, 34));
        assert!(parse_scope("12").is_err());
        assert!(parse_scope("x:1").is_err());
    }

    #[test]
    fn test_build_rejects_bad_regexp() {
        assert!(build_tag_filters(Scope::default(), "a=~[", 16).is_err());
        let tfs = build_tag_filters(Scope::default(), "a=1,b!~x.*", 16).unwrap();
        assert_eq!(tfs.to_string(), r#"{a="1", b!~"x.*"}"#);
    }
}
