//! Routing-oriented InfluxQL inspection.
//!
//! The proxy never executes InfluxQL; it only needs to know which database
//! and measurement a statement touches so the statement can be forwarded to
//! the backends that own the series. This crate extracts those two tokens
//! and nothing else — full syntax validation stays with the remote.
//!
//! Token model:
//!
//! * bare identifiers `[A-Za-z_][A-Za-z0-9_]*`
//! * double-quoted identifiers with `\"` and `\\` escapes (inner dots,
//!   commas and spaces preserved)
//! * single-quoted string literals
//! * regex literals `/…/`, returned verbatim including the slashes

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use nom::branch::alt;
use nom::bytes::complete::is_not;
use nom::character::complete::char;
use nom::combinator::{map, verify};
use nom::multi::fold_many0;
use nom::sequence::{delimited, preceded};
use nom::IResult;
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// None of the recognized statement shapes matched.
    #[error("no routing target found in statement")]
    NoMatch,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Extract the database a statement addresses.
///
/// Recognized shapes: `CREATE DATABASE <db>` (a trailing `WITH …` clause is
/// ignored), `DROP DATABASE <db>`, and any `ALTER`/`CREATE`/`DROP`/`GRANT`/
/// `REVOKE`/`SHOW` statement carrying an `ON <db>` clause. For
/// `ON <db>.<rp>` forms the component before the dot is the database.
pub fn database_from_influxql(q: &str) -> Result<String> {
    let mut s = Scanner::new(q);
    s.skip_leading_brackets();
    let Some(first) = s.word() else {
        return Err(Error::NoMatch);
    };
    if first.eq_ignore_ascii_case("CREATE") || first.eq_ignore_ascii_case("DROP") {
        if s.keyword("DATABASE") {
            return s.identifier();
        }
        return on_clause(s);
    }
    if ["ALTER", "GRANT", "REVOKE", "SHOW"]
        .iter()
        .any(|k| first.eq_ignore_ascii_case(k))
    {
        return on_clause(s);
    }
    Err(Error::NoMatch)
}

/// Extract the measurement a statement addresses.
///
/// `DROP MEASUREMENT <m>` is handled directly; everything else routes on the
/// first top-level `FROM` clause: the measurement is the last component of
/// the fully-qualified name (`m`, `rp.m`, `db..m`, `db.rp.m`). Regex
/// literals come back verbatim. `REVOKE … FROM <user>` deliberately falls
/// out of the same rule, returning the user for routing uniformity.
pub fn measurement_from_influxql(q: &str) -> Result<String> {
    let mut s = Scanner::new(q);
    s.skip_leading_brackets();
    {
        let mut probe = s.clone();
        if probe.keyword("DROP") && probe.keyword("MEASUREMENT") {
            return probe.identifier();
        }
    }
    loop {
        match s.next_token() {
            None => return Err(Error::NoMatch),
            Some(Tok::Word(w)) if w.eq_ignore_ascii_case("FROM") => return s.fqn_last(),
            Some(_) => continue,
        }
    }
}

fn on_clause(mut s: Scanner<'_>) -> Result<String> {
    loop {
        match s.next_token() {
            None => return Err(Error::NoMatch),
            Some(Tok::Word(w)) if w.eq_ignore_ascii_case("ON") => return s.identifier(),
            Some(_) => continue,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Fragment<'a> {
    Literal(&'a str),
    Escaped(char),
}

fn quoted_string(
    delimiter: char,
    literal_chars: &'static str,
) -> impl FnMut(&str) -> IResult<&str, String> {
    move |i| {
        let literal = verify(is_not(literal_chars), |s: &str| !s.is_empty());
        let escaped = preceded(char('\\'), alt((char('\\'), char(delimiter))));
        let fragment = alt((
            map(literal, Fragment::Literal),
            map(escaped, Fragment::Escaped),
            // A backslash before anything else stays verbatim.
            map(char('\\'), Fragment::Escaped),
        ));
        let build = fold_many0(fragment, String::new, |mut out, frag| {
            match frag {
                Fragment::Literal(s) => out.push_str(s),
                Fragment::Escaped(c) => out.push(c),
            }
            out
        });
        delimited(char(delimiter), build, char(delimiter))(i)
    }
}

/// Parse a double-quoted identifier, unescaping `\"` and `\\`.
fn double_quoted(i: &str) -> IResult<&str, String> {
    quoted_string('"', "\"\\")(i)
}

/// Parse a single-quoted string literal.
fn single_quoted(i: &str) -> IResult<&str, String> {
    quoted_string('\'', "'\\")(i)
}

/// Match a regex literal and return it verbatim, slashes included.
fn regex_verbatim(i: &str) -> Option<(&str, &str)> {
    let inner = i.strip_prefix('/')?;
    let bytes = inner.as_bytes();
    let mut idx = 0;
    while idx < bytes.len() {
        match bytes[idx] {
            b'\\' if idx + 1 < bytes.len() => idx += 2,
            b'/' => {
                let end = idx + 2;
                return Some((&i[end..], &i[..end]));
            }
            _ => idx += 1,
        }
    }
    None
}

#[derive(Debug)]
#[allow(dead_code)]
enum Tok<'a> {
    Word(&'a str),
    Quoted(String),
    Str(String),
    Punct(char),
}

/// A cursor over a statement that understands the token model above. Quoted
/// regions are consumed whole, so keywords inside them are never matched.
#[derive(Debug, Clone)]
struct Scanner<'a> {
    rest: &'a str,
}

impl<'a> Scanner<'a> {
    fn new(q: &'a str) -> Self {
        Self { rest: q }
    }

    fn skip_ws(&mut self) {
        self.rest = self.rest.trim_start();
    }

    /// Tolerate bracketing characters ahead of the statement, e.g.
    /// `(select *) from m`.
    fn skip_leading_brackets(&mut self) {
        self.rest = self
            .rest
            .trim_start_matches(|c: char| c.is_whitespace() || matches!(c, '(' | '[' | '{'));
    }

    /// Consume a bare word, if one is next.
    fn word(&mut self) -> Option<&'a str> {
        self.skip_ws();
        let mut end = 0;
        for (idx, c) in self.rest.char_indices() {
            let ok = if idx == 0 {
                c.is_ascii_alphabetic() || c == '_'
            } else {
                c.is_ascii_alphanumeric() || c == '_'
            };
            if !ok {
                break;
            }
            end = idx + c.len_utf8();
        }
        if end == 0 {
            return None;
        }
        let (w, r) = self.rest.split_at(end);
        self.rest = r;
        Some(w)
    }

    /// Consume the next word iff it equals `kw` (ASCII case-insensitive).
    fn keyword(&mut self, kw: &str) -> bool {
        let save = self.rest;
        match self.word() {
            Some(w) if w.eq_ignore_ascii_case(kw) => true,
            _ => {
                self.rest = save;
                false
            }
        }
    }

    fn next_token(&mut self) -> Option<Tok<'a>> {
        self.skip_ws();
        let c = self.rest.chars().next()?;
        match c {
            '"' => {
                if let Ok((r, s)) = double_quoted(self.rest) {
                    self.rest = r;
                    return Some(Tok::Quoted(s));
                }
            }
            '\'' => {
                if let Ok((r, s)) = single_quoted(self.rest) {
                    self.rest = r;
                    return Some(Tok::Str(s));
                }
            }
            _ if c.is_ascii_alphabetic() || c == '_' => {
                return self.word().map(Tok::Word);
            }
            _ => {}
        }
        self.rest = &self.rest[c.len_utf8()..];
        Some(Tok::Punct(c))
    }

    /// A single identifier: the quoted form is taken whole (inner dots
    /// preserved), the bare form stops at the first delimiter.
    fn identifier(&mut self) -> Result<String> {
        self.skip_ws();
        if self.rest.starts_with('"') {
            return match double_quoted(self.rest) {
                Ok((r, s)) => {
                    self.rest = r;
                    Ok(s)
                }
                Err(_) => Err(Error::NoMatch),
            };
        }
        let mut end = 0;
        for (idx, c) in self.rest.char_indices() {
            if c.is_whitespace() || matches!(c, '.' | ';' | ',' | '(' | ')' | '"' | '\'') {
                break;
            }
            end = idx + c.len_utf8();
        }
        if end == 0 {
            return Err(Error::NoMatch);
        }
        let (w, r) = self.rest.split_at(end);
        self.rest = r;
        Ok(w.to_string())
    }

    /// A fully-qualified measurement name; returns the last component.
    fn fqn_last(&mut self) -> Result<String> {
        self.skip_ws();
        if self.rest.starts_with('/') {
            return match regex_verbatim(self.rest) {
                Some((r, re)) => {
                    self.rest = r;
                    Ok(re.to_string())
                }
                None => Err(Error::NoMatch),
            };
        }
        let mut last = None;
        loop {
            if self.rest.starts_with('"') {
                match double_quoted(self.rest) {
                    Ok((r, s)) => {
                        self.rest = r;
                        last = Some(s);
                    }
                    Err(_) => break,
                }
            } else if self.rest.starts_with('\'') {
                match single_quoted(self.rest) {
                    Ok((r, s)) => {
                        self.rest = r;
                        last = Some(s);
                    }
                    Err(_) => break,
                }
            } else {
                let mut end = 0;
                for (idx, c) in self.rest.char_indices() {
                    if c.is_whitespace() || matches!(c, '.' | ';' | ',' | '(' | ')' | '"' | '\'') {
                        break;
                    }
                    end = idx + c.len_utf8();
                }
                if end > 0 {
                    let (w, r) = self.rest.split_at(end);
                    self.rest = r;
                    last = Some(w.to_string());
                }
            }
            // An empty component between two dots (`db..m`) is allowed.
            if let Some(r) = self.rest.strip_prefix('.') {
                self.rest = r;
                continue;
            }
            break;
        }
        last.ok_or(Error::NoMatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[track_caller]
    fn assert_database(q: &str, want: &str) {
        assert_eq!(database_from_influxql(q).as_deref(), Ok(want), "query: {q}");
    }

    #[track_caller]
    fn assert_measurement(q: &str, want: &str) {
        assert_eq!(
            measurement_from_influxql(q).as_deref(),
            Ok(want),
            "query: {q}"
        );
    }

    #[test]
    fn database_from_on_clauses() {
        assert_database("ALTER RETENTION POLICY \"1h.cpu\" ON \"mydb\" DEFAULT", "mydb");
        assert_database(
            "ALTER RETENTION POLICY \"policy1\" ON \"somedb\" DURATION 1h REPLICATION 4",
            "somedb",
        );
        assert_database(
            "CREATE RETENTION POLICY \"10m.events\" ON \"somedb\" DURATION 60m REPLICATION 2 SHARD DURATION 30m",
            "somedb",
        );
        assert_database("DROP CONTINUOUS QUERY \"myquery\" ON \"mydb\"", "mydb");
        assert_database("DROP RETENTION POLICY \"1h.cpu\" ON \"mydb\"", "mydb");
        assert_database("DROP SUBSCRIPTION \"sub0\" ON \"mydb\".\"autogen\"", "mydb");
        assert_database("GRANT READ ON \"mydb\" TO \"jdoe\"", "mydb");
        assert_database("REVOKE READ ON \"mydb\" FROM \"jdoe\"", "mydb");
        assert_database("SHOW FIELD KEY EXACT CARDINALITY ON mydb", "mydb");
        assert_database("SHOW MEASUREMENT EXACT CARDINALITY ON mydb", "mydb");
        assert_database("SHOW RETENTION POLICIES ON \"mydb\"", "mydb");
        assert_database("SHOW SERIES CARDINALITY ON mydb", "mydb");
        assert_database("SHOW SERIES EXACT CARDINALITY ON mydb", "mydb");
    }

    #[test]
    fn database_from_subscriptions() {
        assert_database(
            "CREATE SUBSCRIPTION \"sub0\" ON \"mydb\".\"autogen\" DESTINATIONS ALL 'udp://example.com:9090'",
            "mydb",
        );
        // The component before the dot is the database; quoted names keep
        // their inner dots.
        assert_database(
            "CREATE SUBSCRIPTION \"sub0\" ON \"my.db\".autogen DESTINATIONS ALL 'udp://example.com:9090'",
            "my.db",
        );
        assert_database(
            "CREATE SUBSCRIPTION \"sub0\" ON mydb.autogen DESTINATIONS ALL 'udp://example.com:9090'",
            "mydb",
        );
        assert_database(
            "CREATE SUBSCRIPTION \"sub0\" ON mydb.\"autogen\" DESTINATIONS ALL 'udp://example.com:9090'",
            "mydb",
        );
    }

    #[test]
    fn database_from_create_drop() {
        assert_database("CREATE DATABASE \"foo\"", "foo");
        assert_database(
            "CREATE DATABASE \"bar\" WITH DURATION 1d REPLICATION 1 SHARD DURATION 30m NAME \"myrp\"",
            "bar",
        );
        assert_database("CREATE DATABASE \"mydb\" WITH NAME \"myrp\"", "mydb");
        assert_database("DROP DATABASE \"mydb\"", "mydb");
        assert_database("CREATE DATABASE foo;", "foo");
        assert_database("CREATE DATABASE \"f.oo\"", "f.oo");
        assert_database("CREATE DATABASE \"f,oo\"", "f,oo");
        assert_database("CREATE DATABASE \"f oo\"", "f oo");
        assert_database("CREATE DATABASE \"f\\\"oo\"", "f\"oo");
    }

    #[test]
    fn database_requires_a_recognized_shape() {
        assert_eq!(database_from_influxql("SHOW DATABASES"), Err(Error::NoMatch));
        assert_eq!(
            database_from_influxql("select * from cpu"),
            Err(Error::NoMatch)
        );
        assert_eq!(database_from_influxql(""), Err(Error::NoMatch));
    }

    #[test]
    fn measurement_from_delete_and_drop() {
        assert_measurement("DELETE FROM \"cpu\"", "cpu");
        assert_measurement(
            "DELETE FROM \"cpu\" WHERE time < '2000-01-01T00:00:00Z'",
            "cpu",
        );
        assert_measurement("DROP MEASUREMENT cpu;", "cpu");
        assert_measurement("DROP MEASUREMENT \"cpu\"", "cpu");
        assert_measurement("DROP SERIES FROM \"cpu\" WHERE cpu = 'cpu8'", "cpu");
        assert_measurement(
            "DROP SERIES FROM \"telegraf\"..\"cp u\" WHERE cpu = 'cpu8'",
            "cp u",
        );
        assert_measurement(
            "DROP SERIES FROM \"telegraf\".\"autogen\".\"cp u\" WHERE cpu = 'cpu8'",
            "cp u",
        );
    }

    #[test]
    fn measurement_from_revoke_returns_the_user() {
        assert_measurement("REVOKE ALL PRIVILEGES FROM \"jdoe\"", "jdoe");
        assert_measurement("REVOKE READ ON \"mydb\" FROM \"jdoe\"", "jdoe");
    }

    #[test]
    fn measurement_from_select() {
        assert_measurement("select * from cpu", "cpu");
        assert_measurement("(select *) from \"c.pu\"", "c.pu");
        assert_measurement("[select *] from \"c,pu\"", "c,pu");
        assert_measurement("{select *} from \"c pu\"", "c pu");
        assert_measurement("select * from \"cpu\"", "cpu");
        assert_measurement("select * from \"c\\\"pu\"", "c\"pu");
        assert_measurement("select * from 'cpu'", "cpu");
        assert_measurement("select * from \"db\".\"autogen\".\"cpu.load\"", "cpu.load");
        assert_measurement("select * from \"d.b\".\"autogen\".\"cpu.load\"", "cpu.load");
        assert_measurement(
            "SELECT mean(\"value\") INTO \"cpu\\\"_1h\".:MEASUREMENT FROM /cpu.*/",
            "/cpu.*/",
        );
        assert_measurement(
            "SELECT mean(\"value\") FROM \"cpu\" WHERE \"region\" = 'uswest' GROUP BY time(10m) fill(0)",
            "cpu",
        );
    }

    #[test]
    fn measurement_from_show() {
        assert_measurement("SHOW FIELD KEYS FROM \"cpu\"", "cpu");
        assert_measurement("SHOW FIELD KEYS FROM \"1h\".\"cpu\"", "cpu");
        assert_measurement("SHOW FIELD KEYS FROM 1h.cpu", "cpu");
        assert_measurement("SHOW FIELD KEYS FROM \"cpu.load\"", "cpu.load");
        assert_measurement("SHOW FIELD KEYS FROM 1h.\"cpu.load\"", "cpu.load");
        assert_measurement("SHOW FIELD KEYS FROM \"1h\".\"cpu.load\"", "cpu.load");
        assert_measurement("SHOW SERIES FROM \"cpu\" WHERE cpu = 'cpu8'", "cpu");
        assert_measurement(
            "SHOW SERIES FROM \"telegraf\"..\"cp.u\" WHERE cpu = 'cpu8'",
            "cp.u",
        );
        assert_measurement(
            "SHOW SERIES FROM \"telegraf\".\"autogen\".\"cp.u\" WHERE cpu = 'cpu8'",
            "cp.u",
        );
        assert_measurement("SHOW TAG KEYS FROM cpu", "cpu");
        assert_measurement("SHOW TAG KEYS FROM \"cpu\" WHERE \"region\" = 'uswest'", "cpu");
        assert_measurement("SHOW TAG VALUES FROM \"cpu\" WITH KEY = \"region\"", "cpu");
        assert_measurement(
            "SHOW TAG VALUES FROM \"cpu\" WITH KEY IN (\"region\", \"host\") WHERE \"service\" = 'redis'",
            "cpu",
        );
    }

    #[test]
    fn measurement_requires_a_from_clause() {
        assert_eq!(
            measurement_from_influxql("SHOW DATABASES"),
            Err(Error::NoMatch)
        );
        assert_eq!(
            measurement_from_influxql("CREATE DATABASE foo"),
            Err(Error::NoMatch)
        );
    }

    #[test]
    fn quoted_identifier_round_trips() {
        let (rest, got) = double_quoted("\"c\\\"pu\" tail").unwrap();
        assert_eq!(got, "c\"pu");
        assert_eq!(rest, " tail");

        let (_, got) = double_quoted("\"a\\\\b\"").unwrap();
        assert_eq!(got, "a\\b");

        // A lone backslash stays verbatim.
        let (_, got) = double_quoted("\"a\\nb\"").unwrap();
        assert_eq!(got, "a\\nb");

        // Unterminated input does not parse.
        assert!(double_quoted("\"cpu").is_err());
    }

    #[test]
    fn regex_literals_are_verbatim() {
        let (rest, got) = regex_verbatim("/cpu.*/ where x").unwrap();
        assert_eq!(got, "/cpu.*/");
        assert_eq!(rest, " where x");

        let (_, got) = regex_verbatim(r"/a\/b/").unwrap();
        assert_eq!(got, r"/a\/b/");

        assert!(regex_verbatim("/unterminated").is_none());
    }
}
