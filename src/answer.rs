//! Query answers and the engine's answer envelope.
//!
//! The engine frames each solution on its captured stdout as
//! `STX user-output ETX json newline`. The JSON object carries a
//! `status` of `success`, `failure`, or `error`, a variable
//! substitution on success, and the thrown ball on error.

use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::term::{term_from_json, Term};

const STX: u8 = 0x02;
const ETX: u8 = 0x03;

/// One successful solution to a query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Answer {
    /// The original query goal text.
    pub query: String,
    /// Substitutions for the query's variables.
    pub solution: Substitution,
    /// Stdout captured while this answer was computed.
    pub stdout: String,
    /// Stderr captured while this answer was computed.
    pub stderr: String,
}

/// A mapping of variable names to terms; one answer to a query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Substitution(BTreeMap<String, Term>);

impl Substitution {
    pub fn new() -> Substitution {
        Substitution::default()
    }

    /// The binding for a variable, if present.
    pub fn get(&self, name: &str) -> Option<&Term> {
        self.0.get(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Term) {
        self.0.insert(name.into(), value);
    }

    /// Iterate bindings in variable-name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Term)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Substitution {
    /// Renders in the same shape as the ISO `variable_names/1` option:
    /// `[X = 1, Y = foo]`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, (name, value)) in self.iter().enumerate() {
            if i != 0 {
                f.write_str(", ")?;
            }
            write!(f, "{name} = {value}")?;
        }
        f.write_str("]")
    }
}

impl FromIterator<(String, Term)> for Substitution {
    fn from_iter<I: IntoIterator<Item = (String, Term)>>(iter: I) -> Self {
        Substitution(iter.into_iter().collect())
    }
}

impl IntoIterator for Substitution {
    type Item = (String, Term);
    type IntoIter = std::collections::btree_map::IntoIter<String, Term>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "lowercase")]
enum Status {
    Success,
    Failure,
    Error,
}

#[derive(Deserialize)]
struct Envelope {
    status: Status,
    #[serde(default)]
    answer: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

/// Parse one answer envelope out of the captured output of a
/// `pl_query`/`pl_redo` boundary.
///
/// An empty capture means the goal failed without producing an
/// envelope (exhausted backtracking). A missing ETX frame is a
/// protocol error.
pub(crate) fn parse_answer(query: &str, stdout: &[u8], stderr: &[u8]) -> Result<Answer> {
    let stderr = String::from_utf8_lossy(stderr).into_owned();

    if stdout.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(Error::Failure {
            query: query.to_owned(),
            stdout: String::new(),
            stderr,
        });
    }

    // Everything between STX and ETX is user output; the JSON runs from
    // ETX to the following newline.
    let start = stdout.iter().position(|&b| b == STX).map_or(0, |i| i + 1);
    let end = stdout
        .iter()
        .position(|&b| b == ETX)
        .ok_or_else(|| Error::Protocol {
            message: "answer envelope missing end-of-text frame".into(),
        })?;
    let output = String::from_utf8_lossy(&stdout[start..end]).into_owned();

    let tail = &stdout[end + 1..];
    let json = match tail.iter().position(|&b| b == b'\n') {
        Some(nl) => &tail[..nl],
        None => tail,
    };

    let envelope: Envelope = serde_json::from_slice(json).map_err(|err| Error::Protocol {
        message: format!("decoding error: {err}"),
    })?;

    match envelope.status {
        Status::Success => {
            let solution = envelope
                .answer
                .map(|bindings| {
                    bindings
                        .iter()
                        .map(|(name, value)| Ok((name.clone(), term_from_json(value)?)))
                        .collect::<Result<Substitution>>()
                })
                .transpose()?
                .unwrap_or_default();
            Ok(Answer {
                query: query.to_owned(),
                solution,
                stdout: output,
                stderr,
            })
        }
        Status::Failure => Err(Error::Failure {
            query: query.to_owned(),
            stdout: output,
            stderr,
        }),
        Status::Error => {
            let ball = envelope.error.ok_or_else(|| Error::Protocol {
                message: "error status without error term".into(),
            })?;
            Err(Error::Throw {
                ball: term_from_json(&ball)?,
                query: query.to_owned(),
                stdout: output,
                stderr,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::term::Atom;

    fn envelope(user: &str, json: &str) -> Vec<u8> {
        let mut bytes = vec![STX];
        bytes.extend_from_slice(user.as_bytes());
        bytes.push(ETX);
        bytes.extend_from_slice(json.as_bytes());
        bytes.push(b'\n');
        bytes
    }

    #[test]
    fn success_with_bindings_and_output() {
        let raw = envelope(
            "hello",
            r#"{"status":"success","answer":{"X":1,"Y":{"functor":"boop"}}}"#,
        );
        let ans = parse_answer("q.", &raw, b"warn").unwrap();
        assert_eq!(ans.stdout, "hello");
        assert_eq!(ans.stderr, "warn");
        assert_eq!(ans.solution.get("X"), Some(&Term::Int(1)));
        assert_eq!(ans.solution.get("Y"), Some(&Term::atom("boop")));
    }

    #[test]
    fn success_with_empty_substitution() {
        let raw = envelope("", r#"{"status":"success"}"#);
        let ans = parse_answer("true.", &raw, b"").unwrap();
        assert!(ans.solution.is_empty());
        assert_eq!(ans.stdout, "");
    }

    #[test]
    fn failure_keeps_captured_output() {
        let raw = envelope("foo", r#"{"status":"failure"}"#);
        let err = parse_answer("fail.", &raw, b"bar").unwrap_err();
        match err {
            Error::Failure { stdout, stderr, .. } => {
                assert_eq!(stdout, "foo");
                assert_eq!(stderr, "bar");
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn empty_capture_is_failure() {
        let err = parse_answer("q.", b"  \n", b"").unwrap_err();
        assert!(err.is_failure());
    }

    #[test]
    fn thrown_ball_is_decoded() {
        let raw = envelope("hello", r#"{"status":"error","error":{"functor":"ball"}}"#);
        let err = parse_answer("q.", &raw, b"").unwrap_err();
        match err {
            Error::Throw { ball, stdout, .. } => {
                assert_eq!(ball, Term::atom("ball"));
                assert_eq!(stdout, "hello");
            }
            other => panic!("expected throw, got {other:?}"),
        }
    }

    #[test]
    fn missing_etx_is_a_protocol_error() {
        let err = parse_answer("q.", b"\x02no frame end", b"").unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
    }

    #[test]
    fn garbage_json_is_a_protocol_error() {
        let raw = envelope("", "{nope");
        let err = parse_answer("q.", &raw, b"").unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
    }

    #[test]
    fn substitution_renders_sorted() {
        let mut sub = Substitution::new();
        sub.insert("Y", Term::atom("b"));
        sub.insert("X", Term::Atom(Atom::new("a")));
        assert_eq!(sub.to_string(), "[X = a, Y = b]");
    }
}
