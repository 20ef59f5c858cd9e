use std::sync::OnceLock;

use regex::Regex;
use unicode_normalization::UnicodeNormalization;

use super::{GuardrailEvaluator, GuardrailPolicy, ProposedAction, Violation};

/// Verbs a `WITH` prefix can lead into.
const DML_VERBS: &[&str] = &["SELECT", "INSERT", "UPDATE", "DELETE", "REPLACE"];

/// Verbs whose FROM introduces a table list.
const QUERY_VERBS: &[&str] = &["SELECT", "DELETE", "UPDATE"];

/// Words that end a FROM list at its own depth.
const FROM_LIST_END: &[&str] = &[
    "WHERE", "GROUP", "ORDER", "LIMIT", "OFFSET", "HAVING", "WINDOW", "UNION", "INTERSECT",
    "EXCEPT", "RETURNING", "SET", "VALUES", "FETCH", "FOR",
];

/// Constructs rejected regardless of policy. Matched against the statement
/// with string literals and quoted identifiers masked out.
const BLOCKLIST: &[(&str, &str)] = &[
    (
        r"(?i)\b(DROP|TRUNCATE|ALTER|CREATE|GRANT|REVOKE|ATTACH|DETACH|PRAGMA)\b",
        "DDL or administrative statement",
    ),
    (r"--", "comment injection"),
    (r"/\*|\*/", "comment injection"),
    (r";\s*\S", "stacked statements"),
    (r"(?i)\bOR\s+TRUE\b", "tautology"),
    (r"(?i)\bUNION(\s+ALL)?\s+SELECT\b", "UNION SELECT"),
    (r"(?i)\bINTO\s+(OUT|DUMP)FILE\b", "file write"),
    (r"(?i)\bLOAD_FILE\s*\(", "file read"),
    (r"(?i)\bxp_cmdshell\b", "command execution"),
    (r"(?i)\b(SLEEP|PG_SLEEP|BENCHMARK)\s*\(", "time-based delay"),
    (r"(?i)\bWAITFOR\s+DELAY\b", "time-based delay"),
];

struct BlockRule {
    /// `None` when the pattern failed to compile; every statement is then refused.
    re: Option<Regex>,
    pattern: &'static str,
    label: &'static str,
}

/// Compiled once per process.
fn blocklist() -> &'static [BlockRule] {
    static RULES: OnceLock<Vec<BlockRule>> = OnceLock::new();
    RULES.get_or_init(|| {
        BLOCKLIST
            .iter()
            .map(|&(pattern, label)| {
                let re = match Regex::new(pattern) {
                    Ok(re) => Some(re),
                    Err(e) => {
                        tracing::error!(pattern = %pattern, error = %e, "Invalid SQL blocklist regex, refusing all statements");
                        None
                    }
                };
                BlockRule { re, pattern, label }
            })
            .collect()
    })
}

/// Guardrail for database workers.
///
/// Checks run in a fixed order and the first failure wins:
/// normalization and lexing, statement operation (merged with the WHERE
/// requirement), referenced tables, then the unconditional blocklist.
/// An unset allowlist is unrestricted; an empty one denies everything.
pub struct SqlGuardrail {
    blocklist: &'static [BlockRule],
}

impl SqlGuardrail {
    pub fn new() -> Self {
        Self {
            blocklist: blocklist(),
        }
    }

    /// Evaluate one SQL statement against `policy`.
    pub fn check_sql(&self, sql: &str, policy: &GuardrailPolicy) -> Option<Violation> {
        let normalized: String = sql.nfkc().collect();
        let text = normalized.trim();
        if text.is_empty() {
            return Some(Violation::new("sql.empty", "empty SQL statement", sql));
        }

        let lexed = match lex(text) {
            Ok(lexed) => lexed,
            Err(violation) => return Some(violation),
        };
        let depths = depths(&lexed.tokens);

        let Some((verb, verb_at)) = main_verb(&lexed.tokens, &depths) else {
            return Some(
                Violation::new("sql.syntax", "statement does not start with a SQL verb", text)
                    .with_suggestion("start the statement with an operation such as SELECT"),
            );
        };

        let has_where = has_where_at(&lexed.tokens, &depths, verb_at);
        if let Some(v) = check_operation(&verb, has_where, text, policy) {
            return Some(v);
        }
        if let Some(v) = check_tables(&lexed.tokens, &depths, verb_at, policy) {
            return Some(v);
        }
        if let Some(v) = check_tautology(&lexed.tokens) {
            return Some(v);
        }
        self.check_blocklist(&lexed.masked)
    }

    fn check_blocklist(&self, masked: &str) -> Option<Violation> {
        for rule in self.blocklist {
            let Some(ref re) = rule.re else {
                return Some(
                    Violation::new(
                        "sql.blocklist",
                        format!("blocklist rule for {} is unavailable", rule.label),
                        rule.pattern,
                    )
                    .with_suggestion("fix the blocklist pattern"),
                );
            };
            if let Some(m) = re.find(masked) {
                return Some(
                    Violation::new(
                        "sql.blocklist",
                        format!("statement contains a blocked construct: {}", rule.label),
                        m.as_str().trim(),
                    )
                    .with_suggestion(format!("remove the {}", rule.label)),
                );
            }
        }
        None
    }
}

impl Default for SqlGuardrail {
    fn default() -> Self {
        Self::new()
    }
}

impl GuardrailEvaluator for SqlGuardrail {
    fn name(&self) -> &str {
        "sql"
    }

    fn evaluate(&self, action: &ProposedAction, policy: &GuardrailPolicy) -> Option<Violation> {
        match action {
            ProposedAction::Sql { text } => self.check_sql(text, policy),
            other => Some(Violation::new(
                "guardrail.action",
                "SQL guardrail cannot evaluate a non-SQL action",
                other.summary(),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Quoted(String),
    Str(String),
    Number(String),
    Punct(char),
}

struct Lexed {
    tokens: Vec<Token>,
    /// Statement text with literal and quoted-identifier contents removed.
    masked: String,
}

fn lex(text: &str) -> Result<Lexed, Violation> {
    let mut tokens = Vec::new();
    let mut masked = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                let mut value = String::new();
                let mut closed = false;
                while let Some(ch) = chars.next() {
                    if ch == '\'' {
                        if chars.peek() == Some(&'\'') {
                            chars.next();
                            value.push('\'');
                            continue;
                        }
                        closed = true;
                        break;
                    }
                    value.push(ch);
                }
                if !closed {
                    return Err(unterminated(text));
                }
                masked.push_str("''");
                tokens.push(Token::Str(value));
            }
            '"' | '`' => {
                let mut value = String::new();
                let mut closed = false;
                for ch in chars.by_ref() {
                    if ch == c {
                        closed = true;
                        break;
                    }
                    value.push(ch);
                }
                if !closed {
                    return Err(unterminated(text));
                }
                if !value.is_ascii() {
                    return Err(non_ascii(&value));
                }
                masked.push(c);
                masked.push(c);
                tokens.push(Token::Quoted(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut word = String::from(c);
                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_alphanumeric() || ch == '_' || ch == '$' {
                        word.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                masked.push_str(&word);
                tokens.push(Token::Word(word));
            }
            c if c.is_ascii_digit() => {
                let mut number = String::from(c);
                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_alphanumeric() || ch == '.' {
                        number.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                masked.push_str(&number);
                tokens.push(Token::Number(number));
            }
            c if c.is_ascii_whitespace() => masked.push(c),
            c if !c.is_ascii() => return Err(non_ascii(&c.to_string())),
            other => {
                masked.push(other);
                tokens.push(Token::Punct(other));
            }
        }
    }

    Ok(Lexed { tokens, masked })
}

fn unterminated(text: &str) -> Violation {
    Violation::new("sql.syntax", "unterminated quoted string or identifier", text)
        .with_suggestion("close every quote; escape a single quote inside a literal as ''")
}

fn non_ascii(offending: &str) -> Violation {
    Violation::new(
        "sql.non_ascii",
        "non-ASCII character outside a string literal",
        offending,
    )
    .with_suggestion("use plain ASCII for keywords and identifiers")
}

/// Parenthesis depth of every token. An opening parenthesis sits at the
/// depth outside it, and so does its closing one.
fn depths(tokens: &[Token]) -> Vec<usize> {
    let mut depth = 0usize;
    tokens
        .iter()
        .map(|t| match t {
            Token::Punct('(') => {
                depth += 1;
                depth - 1
            }
            Token::Punct(')') => {
                depth = depth.saturating_sub(1);
                depth
            }
            _ => depth,
        })
        .collect()
}

fn is_word(token: &Token, keywords: &[&str]) -> bool {
    matches!(token, Token::Word(w) if keywords.iter().any(|k| w.eq_ignore_ascii_case(k)))
}

/// Position of the first token that is not an opening parenthesis.
fn first_token(tokens: &[Token]) -> Option<usize> {
    tokens.iter().position(|t| !matches!(t, Token::Punct('(')))
}

/// The statement's operation and its position. For `WITH`, this is the
/// verb after the common table expressions.
fn main_verb(tokens: &[Token], depths: &[usize]) -> Option<(String, usize)> {
    let first = first_token(tokens)?;
    let Token::Word(word) = &tokens[first] else {
        return None;
    };
    let verb = word.to_ascii_uppercase();
    if verb != "WITH" {
        return Some((verb, first));
    }
    let depth = depths[first];
    (first + 1..tokens.len())
        .find(|&i| depths[i] == depth && is_word(&tokens[i], DML_VERBS))
        .and_then(|i| match &tokens[i] {
            Token::Word(w) => Some((w.to_ascii_uppercase(), i)),
            _ => None,
        })
        .or(Some((verb, first)))
}

/// A WHERE belonging to the statement itself, not to a subquery.
fn has_where_at(tokens: &[Token], depths: &[usize], verb_at: usize) -> bool {
    let depth = depths[verb_at];
    (verb_at + 1..tokens.len()).any(|i| depths[i] == depth && is_word(&tokens[i], &["WHERE"]))
}

/// Names declared by a leading `WITH`. They shadow tables of the same name.
fn cte_names(tokens: &[Token], depths: &[usize], verb_at: usize) -> Vec<String> {
    let Some(first) = first_token(tokens) else {
        return Vec::new();
    };
    if !is_word(&tokens[first], &["WITH"]) {
        return Vec::new();
    }
    let depth = depths[first];
    let mut names = Vec::new();
    let mut expect_name = true;
    for i in first + 1..verb_at {
        if depths[i] != depth {
            continue;
        }
        match &tokens[i] {
            Token::Punct(',') => expect_name = true,
            Token::Word(w) if w.eq_ignore_ascii_case("RECURSIVE") => {}
            Token::Word(w) | Token::Quoted(w) if expect_name => {
                names.push(w.clone());
                expect_name = false;
            }
            _ => {}
        }
    }
    names
}

fn check_operation(
    verb: &str,
    has_where: bool,
    text: &str,
    policy: &GuardrailPolicy,
) -> Option<Violation> {
    let mut rules = Vec::new();
    let mut reasons = Vec::new();
    let mut suggestions = Vec::new();

    if let Some(ref allowed) = policy.allowed_operations {
        if !allowed.iter().any(|op| op.trim().eq_ignore_ascii_case(verb)) {
            rules.push("sql.operation");
            reasons.push(format!(
                "operation {} is not allowed (allowed: {})",
                verb,
                list_or_none(allowed)
            ));
            suggestions.push(format!("use one of: {}", list_or_none(allowed)));
        }
    }

    let needs_where = policy.require_where.unwrap_or(false)
        && (verb == "UPDATE" || verb == "DELETE")
        && !has_where;
    if needs_where {
        rules.push("sql.where");
        reasons.push(format!("{} without a WHERE clause is not allowed", verb));
        suggestions.push("add a WHERE clause that limits the affected rows".to_string());
    }

    if rules.is_empty() {
        return None;
    }
    Some(
        Violation::new(rules.join("+"), reasons.join("; "), text)
            .with_suggestion(suggestions.join("; ")),
    )
}

fn check_tables(
    tokens: &[Token],
    depths: &[usize],
    verb_at: usize,
    policy: &GuardrailPolicy,
) -> Option<Violation> {
    let allowed = policy.allowed_tables.as_ref()?;
    let ctes = cte_names(tokens, depths, verb_at);

    for parts in table_references(tokens, depths) {
        let is_cte = parts.len() == 1 && ctes.iter().any(|c| c.eq_ignore_ascii_case(&parts[0]));
        if is_cte || table_allowed(&parts, allowed) {
            continue;
        }
        let name = parts.join(".");
        return Some(
            Violation::new(
                "sql.table",
                format!("table {} is not allowed (allowed: {})", name, list_or_none(allowed)),
                name,
            )
            .with_suggestion(format!("query only: {}", list_or_none(allowed))),
        );
    }
    None
}

/// Every table name the statement references, in statement order.
fn table_references(tokens: &[Token], depths: &[usize]) -> Vec<Vec<String>> {
    let mut names = Vec::new();
    for (i, token) in tokens.iter().enumerate() {
        let Token::Word(word) = token else { continue };
        match word.to_ascii_uppercase().as_str() {
            "INTO" | "JOIN" | "TABLE" => names.extend(qualified_name(&tokens[i + 1..])),
            // `ON CONFLICT ... DO UPDATE SET` belongs to the INSERT
            "UPDATE" if !(i > 0 && is_word(&tokens[i - 1], &["DO"])) => {
                names.extend(qualified_name(&tokens[i + 1..]))
            }
            "FROM" if opens_from_list(tokens, depths, i) => {
                from_list(tokens, depths, i, &mut names)
            }
            _ => {}
        }
    }
    names
}

/// False for the FROM inside calls such as `EXTRACT(YEAR FROM ts)`: inside
/// parentheses, a table list needs a query verb earlier in the same group.
fn opens_from_list(tokens: &[Token], depths: &[usize], at: usize) -> bool {
    let depth = depths[at];
    if depth == 0 {
        return true;
    }
    for i in (0..at).rev() {
        if depths[i] < depth {
            return false;
        }
        if depths[i] == depth && is_word(&tokens[i], QUERY_VERBS) {
            return true;
        }
    }
    false
}

/// First name of each comma-separated item after the FROM at `start`.
/// Aliases and subqueries are skipped; joined tables are found by their JOIN.
fn from_list(tokens: &[Token], depths: &[usize], start: usize, names: &mut Vec<Vec<String>>) {
    let depth = depths[start];
    let mut expect_name = true;
    for i in start + 1..tokens.len() {
        if depths[i] < depth {
            break;
        }
        if depths[i] > depth {
            continue;
        }
        match &tokens[i] {
            Token::Punct(';') => break,
            Token::Punct(',') => expect_name = true,
            token if is_word(token, FROM_LIST_END) => break,
            token => {
                if expect_name && matches!(token, Token::Word(_) | Token::Quoted(_)) {
                    names.extend(qualified_name(&tokens[i..]));
                }
                expect_name = false;
            }
        }
    }
}

/// Identifier-shaped name at the start of `tokens`, split on dots.
fn qualified_name(tokens: &[Token]) -> Option<Vec<String>> {
    let mut parts = Vec::new();
    let mut iter = tokens.iter();
    loop {
        match iter.next() {
            Some(Token::Word(w)) | Some(Token::Quoted(w)) => parts.push(w.clone()),
            _ => break,
        }
        if !matches!(iter.next(), Some(Token::Punct('.'))) {
            break;
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts)
    }
}

/// Qualified allowlist entries match the full name; bare entries match the last segment.
fn table_allowed(parts: &[String], allowed: &[String]) -> bool {
    let full = parts.join(".");
    let last = parts.last().map(String::as_str).unwrap_or_default();
    allowed.iter().any(|entry| {
        let entry = entry.trim();
        if entry.contains('.') {
            entry.eq_ignore_ascii_case(&full)
        } else {
            entry.eq_ignore_ascii_case(last)
        }
    })
}

/// `X = X` where both sides are the same literal.
fn check_tautology(tokens: &[Token]) -> Option<Violation> {
    for window in tokens.windows(3) {
        let [lhs, Token::Punct('='), rhs] = window else { continue };
        let same = match (lhs, rhs) {
            (Token::Number(a), Token::Number(b)) => a == b,
            (Token::Str(a), Token::Str(b)) => a == b,
            _ => false,
        };
        if same {
            let offending = format!("{} = {}", literal_text(lhs), literal_text(rhs));
            return Some(
                Violation::new(
                    "sql.blocklist",
                    "statement contains a blocked construct: tautology",
                    offending,
                )
                .with_suggestion("remove the always-true condition"),
            );
        }
    }
    None
}

fn literal_text(token: &Token) -> String {
    match token {
        Token::Str(s) => format!("'{}'", s),
        Token::Number(n) => n.clone(),
        Token::Word(w) | Token::Quoted(w) => w.clone(),
        Token::Punct(c) => c.to_string(),
    }
}

fn list_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "none".to_string()
    } else {
        items.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(ops: Option<&[&str]>, tables: Option<&[&str]>, require_where: bool) -> GuardrailPolicy {
        GuardrailPolicy {
            allowed_operations: ops.map(|o| o.iter().map(|s| s.to_string()).collect()),
            allowed_tables: tables.map(|t| t.iter().map(|s| s.to_string()).collect()),
            require_where: Some(require_where),
            ..Default::default()
        }
    }

    fn check(sql: &str, policy: &GuardrailPolicy) -> Option<Violation> {
        SqlGuardrail::new().check_sql(sql, policy)
    }

    #[test]
    fn blocked_delete_cites_operation_and_where() {
        let p = policy(Some(&["SELECT"]), None, true);
        let v = check("DELETE FROM users", &p).unwrap();
        assert_eq!(v.rule, "sql.operation+sql.where");
        assert!(v.reason.contains("operation DELETE is not allowed"));
        assert!(v.reason.contains("WHERE"));
        assert_eq!(v.offending, "DELETE FROM users");
        assert!(v.suggestion.is_some());
    }

    #[test]
    fn allowed_select_passes() {
        let p = policy(Some(&["select"]), Some(&["users"]), true);
        assert!(check("SELECT id, name FROM users WHERE id = 7", &p).is_none());
        assert!(check("  select * from USERS;  ", &p).is_none());
        assert!(check("(SELECT id FROM users)", &p).is_none());
    }

    #[test]
    fn where_requirement_only_applies_to_writes() {
        let p = policy(None, None, true);
        assert!(check("SELECT * FROM users", &p).is_none());
        let v = check("UPDATE users SET name = 'x'", &p).unwrap();
        assert_eq!(v.rule, "sql.where");
        assert!(check("UPDATE users SET name = 'x' WHERE id = 2", &p).is_none());
    }

    #[test]
    fn unlisted_table_rejected() {
        let p = policy(Some(&["SELECT"]), Some(&["users"]), false);
        let v = check("SELECT * FROM users JOIN payments ON payments.uid = users.id", &p).unwrap();
        assert_eq!(v.rule, "sql.table");
        assert_eq!(v.offending, "payments");
    }

    #[test]
    fn qualified_and_quoted_tables() {
        let p = policy(None, Some(&["users", "billing.invoices"]), false);
        assert!(check("SELECT * FROM main.users", &p).is_none());
        assert!(check("SELECT * FROM \"users\"", &p).is_none());
        assert!(check("SELECT * FROM `billing`.`invoices`", &p).is_none());
        let v = check("SELECT * FROM archive.invoices", &p).unwrap();
        assert_eq!(v.offending, "archive.invoices");
    }

    #[test]
    fn subqueries_and_literals_do_not_count_as_tables() {
        let p = policy(None, Some(&["users"]), false);
        assert!(check("SELECT * FROM (SELECT id FROM users) AS t", &p).is_none());
        assert!(check("SELECT * FROM users WHERE note = 'from secrets'", &p).is_none());
    }

    #[test]
    fn every_referenced_table_is_checked() {
        let p = policy(None, Some(&["users", "orders"]), false);
        for (sql, offending) in [
            ("SELECT * FROM users, secrets WHERE users.id = secrets.uid", "secrets"),
            ("SELECT * FROM users u, secrets s WHERE u.id = s.uid", "secrets"),
            ("SELECT * FROM users AS u, main.secrets AS s", "main.secrets"),
            ("SELECT * FROM users JOIN orders ON orders.uid = users.id, secrets", "secrets"),
            ("SELECT * FROM users LEFT JOIN secrets ON secrets.uid = users.id", "secrets"),
            ("SELECT * FROM users WHERE id IN (SELECT uid FROM secrets)", "secrets"),
            ("SELECT * FROM (SELECT * FROM orders, secrets) AS t", "secrets"),
            ("SELECT (SELECT token FROM secrets) AS t FROM users", "secrets"),
            ("UPDATE users SET name = (SELECT name FROM secrets LIMIT 1) WHERE id = 1", "secrets"),
            ("WITH s AS (SELECT * FROM secrets) SELECT * FROM users, s", "secrets"),
            ("WITH x AS (SELECT id FROM users) DELETE FROM secrets WHERE id = 1", "secrets"),
            ("INSERT INTO secrets (id) SELECT id FROM users", "secrets"),
        ] {
            let v = check(sql, &p).unwrap_or_else(|| panic!("{} passed", sql));
            assert_eq!(v.rule, "sql.table", "{}", sql);
            assert_eq!(v.offending, offending, "{}", sql);
        }
    }

    #[test]
    fn allowed_tables_in_complex_statements_pass() {
        let p = policy(None, Some(&["users", "orders"]), false);
        for sql in [
            "SELECT * FROM users u, orders o WHERE u.id = o.uid",
            "SELECT * FROM users AS u JOIN orders AS o ON o.uid = u.id ORDER BY u.id",
            "WITH recent AS (SELECT * FROM orders) SELECT * FROM users, recent",
            "WITH RECURSIVE a AS (SELECT 1), b AS (SELECT 2) SELECT * FROM a, b",
            "SELECT EXTRACT(YEAR FROM created_at) FROM orders WHERE id = 1",
            "SELECT SUBSTRING(name FROM 2 FOR 3) FROM users",
            "INSERT INTO users (id, name) VALUES (1, 'a') ON CONFLICT (id) DO UPDATE SET name = 'b'",
            "UPDATE users SET total = (SELECT SUM(amount) FROM orders WHERE orders.uid = users.id) WHERE id = 1",
        ] {
            assert_eq!(check(sql, &p), None, "{}", sql);
        }
    }

    #[test]
    fn where_must_belong_to_the_statement() {
        let p = policy(None, None, true);
        for sql in [
            "UPDATE users SET role = (SELECT role FROM users WHERE id = 1)",
            "UPDATE users SET name = lower((SELECT name FROM users WHERE id = 2))",
            "DELETE FROM users RETURNING (SELECT id FROM audit WHERE id = 1)",
            "WITH x AS (SELECT id FROM users WHERE id = 1) DELETE FROM users",
        ] {
            let v = check(sql, &p).unwrap_or_else(|| panic!("{} passed", sql));
            assert_eq!(v.rule, "sql.where", "{}", sql);
        }
        for sql in [
            "DELETE FROM t WHERE id IN (SELECT id FROM t WHERE expired = 1)",
            "UPDATE users SET role = (SELECT role FROM roles WHERE id = 1) WHERE id = 2",
            "WITH x AS (SELECT id FROM users) DELETE FROM users WHERE id IN (SELECT id FROM x)",
        ] {
            assert_eq!(check(sql, &p), None, "{}", sql);
        }
    }

    #[test]
    fn with_prefix_is_judged_by_its_main_verb() {
        let p = policy(Some(&["SELECT"]), None, true);
        let v = check("WITH x AS (SELECT 1) DELETE FROM t", &p).unwrap();
        assert_eq!(v.rule, "sql.operation+sql.where");
        assert!(v.reason.contains("operation DELETE is not allowed"));
        assert!(check("WITH x AS (SELECT 1) SELECT * FROM x", &p).is_none());
    }

    #[test]
    fn every_blocklist_pattern_compiles() {
        for rule in blocklist() {
            assert!(rule.re.is_some(), "{} did not compile", rule.pattern);
        }
    }

    #[test]
    fn empty_allowlist_denies_everything() {
        let p = policy(Some(&[]), None, false);
        let v = check("SELECT 1", &p).unwrap();
        assert!(v.reason.contains("allowed: none"));

        let p = policy(None, Some(&[]), false);
        assert!(check("SELECT * FROM users", &p).is_some());
    }

    #[test]
    fn unset_allowlists_are_unrestricted() {
        let p = GuardrailPolicy::default();
        assert!(check("INSERT INTO audit (msg) VALUES ('hi')", &p).is_none());
    }

    #[test]
    fn ddl_blocked_without_any_policy() {
        let p = GuardrailPolicy::default();
        for sql in [
            "DROP TABLE users",
            "truncate users",
            "ALTER TABLE users ADD COLUMN x INT",
            "PRAGMA table_info(users)",
            "ATTACH DATABASE 'x.db' AS x",
        ] {
            let v = check(sql, &p).unwrap_or_else(|| panic!("{} passed", sql));
            assert_eq!(v.rule, "sql.blocklist", "{}", sql);
        }
    }

    #[test]
    fn comments_and_stacked_statements_blocked() {
        let p = GuardrailPolicy::default();
        let v = check("SELECT * FROM users WHERE id = 1 -- AND tenant = 2", &p).unwrap();
        assert!(v.reason.contains("comment"));
        assert!(check("SELECT * FROM users /* hi */", &p).is_some());
        let v = check("SELECT 1; DELETE FROM users", &p).unwrap();
        assert!(v.reason.contains("stacked"));
        assert!(check("SELECT 1;", &p).is_none());
    }

    #[test]
    fn tautologies_blocked() {
        let p = GuardrailPolicy::default();
        let v = check("SELECT * FROM users WHERE name = 'a' OR 1=1", &p).unwrap();
        assert!(v.reason.contains("tautology"));
        assert_eq!(v.offending, "1 = 1");
        assert!(check("SELECT * FROM users WHERE 'x' = 'x'", &p).is_some());
        assert!(check("SELECT * FROM users WHERE id = 3 OR TRUE", &p).is_some());
        assert!(check("SELECT * FROM users WHERE 1 = 2", &p).is_none());
    }

    #[test]
    fn exfiltration_constructs_blocked() {
        let p = GuardrailPolicy::default();
        assert!(check("SELECT name FROM users UNION SELECT password FROM admins", &p).is_some());
        assert!(check("SELECT * FROM users INTO OUTFILE '/tmp/x'", &p).is_some());
        assert!(check("SELECT LOAD_FILE('/etc/passwd')", &p).is_some());
        assert!(check("SELECT SLEEP(5)", &p).is_some());
        assert!(check("EXEC xp_cmdshell 'dir'", &p).is_some());
    }

    #[test]
    fn blocked_words_inside_literals_are_ignored() {
        let p = GuardrailPolicy::default();
        assert!(check("SELECT * FROM notes WHERE body = 'drop table; -- now'", &p).is_none());
        assert!(check("SELECT * FROM notes WHERE body = 'it''s fine'", &p).is_none());
    }

    #[test]
    fn unicode_is_normalized_before_matching() {
        let p = GuardrailPolicy::default();
        // Fullwidth letters fold to ASCII under NFKC.
        let v = check("ＤＲＯＰ TABLE users", &p).unwrap();
        assert_eq!(v.rule, "sql.blocklist");

        // Cyrillic E does not fold and is rejected outright.
        let v = check("D\u{0415}LETE FROM users", &p).unwrap();
        assert_eq!(v.rule, "sql.non_ascii");

        // Non-ASCII inside a literal is data, not syntax.
        assert!(check("SELECT * FROM users WHERE name = 'José'", &p).is_none());
    }

    #[test]
    fn malformed_statements_rejected() {
        let p = GuardrailPolicy::default();
        assert_eq!(check("   ", &p).unwrap().rule, "sql.empty");
        assert_eq!(check("SELECT 'oops", &p).unwrap().rule, "sql.syntax");
        assert_eq!(check("42", &p).unwrap().rule, "sql.syntax");
    }

    #[test]
    fn evaluation_is_idempotent() {
        let guardrail = SqlGuardrail::new();
        let p = policy(Some(&["SELECT"]), Some(&["users"]), true);
        for sql in ["DELETE FROM users", "SELECT * FROM users", "SELECT * FROM x"] {
            assert_eq!(guardrail.check_sql(sql, &p), guardrail.check_sql(sql, &p));
        }
    }

    #[test]
    fn http_action_is_refused() {
        let v = SqlGuardrail::new()
            .evaluate(
                &ProposedAction::http("https://example.com", "GET"),
                &GuardrailPolicy::default(),
            )
            .unwrap();
        assert_eq!(v.rule, "guardrail.action");
    }
}
