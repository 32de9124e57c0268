//! Decoding of the engine's term JSON into [`Term`].
//!
//! The engine serializes terms as JSON when it answers a query and when
//! it forwards a goal through `host-call`:
//!
//! - strings are Prolog strings
//! - numbers are integers (no dot) or floats (dot)
//! - arrays are lists
//! - `{"number": "..."}` is an arbitrary-precision integer
//! - `{"numerator": N, "denominator": D}` is a rational; either side may
//!   itself be a big-integer object
//! - `{"var": Name, "attr": [...]}` is a variable with residual goals
//! - `{"functor": F, "args": [...]}` is an atom (no args) or compound

use num_bigint::{BigInt, Sign};
use num_rational::BigRational;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::term::{Atom, Compound, Term, Variable};

/// Decode one term from its JSON form.
pub(crate) fn term_from_json(value: &Value) -> Result<Term> {
    match value {
        Value::String(s) => Ok(Term::Str(s.clone())),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Term::Int(i))
            } else if let Some(f) = n.as_f64() {
                Ok(Term::Float(f))
            } else {
                Err(protocol(format!("unrepresentable number: {n}")))
            }
        }
        Value::Array(items) => Ok(Term::List(
            items.iter().map(term_from_json).collect::<Result<_>>()?,
        )),
        Value::Object(obj) => {
            if let Some(number) = obj.get("number") {
                return Ok(Term::Big(bigint_from_value(number)?));
            }

            match (obj.get("numerator"), obj.get("denominator")) {
                (None, None) => {}
                (Some(n), Some(d)) => {
                    let numer = bigint_from_value(n)?;
                    let denom = bigint_from_value(d)?;
                    if denom.sign() == Sign::NoSign {
                        return Err(protocol("rational with zero denominator".into()));
                    }
                    return Ok(Term::Rat(BigRational::new(numer, denom)));
                }
                _ => {
                    return Err(protocol(format!(
                        "rational missing numerator or denominator: {value}"
                    )))
                }
            }

            if let Some(Value::String(name)) = obj.get("var") {
                let attr = match obj.get("attr") {
                    Some(Value::Array(goals)) => {
                        goals.iter().map(term_from_json).collect::<Result<_>>()?
                    }
                    _ => Vec::new(),
                };
                return Ok(Term::Var(Variable {
                    name: name.clone(),
                    attr,
                }));
            }

            if let Some(functor) = obj.get("functor") {
                let functor = match functor {
                    Value::String(name) => Atom::new(name.clone()),
                    // The engine writes the empty atom's functor as `[]`.
                    Value::Array(empty) if empty.is_empty() => Atom::new(""),
                    other => {
                        return Err(protocol(format!("unhandled functor json: {other}")));
                    }
                };
                let args: Vec<Term> = match obj.get("args") {
                    Some(Value::Array(args)) => {
                        args.iter().map(term_from_json).collect::<Result<_>>()?
                    }
                    _ => Vec::new(),
                };
                if args.is_empty() {
                    return Ok(Term::Atom(functor));
                }
                return Ok(Term::Compound(Compound { functor, args }));
            }

            Err(protocol(format!("unhandled term json: {value}")))
        }
        Value::Bool(b) => Ok(Term::atom(if *b { "true" } else { "false" })),
        Value::Null => Err(protocol("unhandled term json: null".into())),
    }
}

/// A big integer is either a plain JSON number or a `{"number": "..."}`
/// object (the engine switches to the object form past i64 range).
fn bigint_from_value(value: &Value) -> Result<BigInt> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(BigInt::from(i))
            } else {
                Err(protocol(format!("non-integer where integer expected: {n}")))
            }
        }
        Value::String(s) => parse_bigint(s),
        Value::Object(obj) => match obj.get("number") {
            Some(Value::String(s)) => parse_bigint(s),
            _ => Err(protocol(format!("malformed big integer: {value}"))),
        },
        other => Err(protocol(format!("malformed big integer: {other}"))),
    }
}

fn parse_bigint(text: &str) -> Result<BigInt> {
    text.parse::<BigInt>()
        .map_err(|_| protocol(format!("failed to decode number: {text}")))
}

fn protocol(message: String) -> Error {
    Error::Protocol { message }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode(v: Value) -> Term {
        term_from_json(&v).unwrap()
    }

    #[test]
    fn scalars() {
        assert_eq!(decode(json!("baz")), Term::Str("baz".into()));
        assert_eq!(decode(json!(1)), Term::Int(1));
        assert_eq!(decode(json!(-3)), Term::Int(-3));
        assert_eq!(decode(json!(4.2)), Term::Float(4.2));
    }

    #[test]
    fn lists() {
        assert_eq!(
            decode(json!([1, "a", [2]])),
            Term::List(vec![
                Term::Int(1),
                Term::Str("a".into()),
                Term::List(vec![Term::Int(2)]),
            ])
        );
        assert_eq!(decode(json!([])), Term::List(vec![]));
    }

    #[test]
    fn atoms_and_compounds() {
        assert_eq!(decode(json!({"functor": "boop"})), Term::atom("boop"));
        assert_eq!(decode(json!({"functor": "boop", "args": []})), Term::atom("boop"));
        assert_eq!(
            decode(json!({"functor": "foo", "args": [{"functor": "bar"}]})),
            Atom::new("foo").of([Term::atom("bar")]).into()
        );
    }

    #[test]
    fn big_integers() {
        let big = "99999999999999999999999999";
        assert_eq!(
            decode(json!({"number": big})),
            Term::Big(big.parse::<BigInt>().unwrap())
        );
    }

    #[test]
    fn rationals_small_and_big() {
        assert_eq!(
            decode(json!({"numerator": 1, "denominator": 3})),
            Term::Rat(BigRational::new(BigInt::from(1), BigInt::from(3)))
        );
        let big = "123456789012345678901234567890";
        assert_eq!(
            decode(json!({"numerator": {"number": big}, "denominator": 7})),
            Term::Rat(BigRational::new(big.parse().unwrap(), BigInt::from(7)))
        );
    }

    #[test]
    fn variables_with_residual_goals() {
        assert_eq!(
            decode(json!({"var": "X"})),
            Term::Var(Variable::new("X"))
        );
        let decoded = decode(json!({
            "var": "X",
            "attr": [{"functor": "dif", "args": [{"var": "X"}, {"var": "Y"}]}]
        }));
        let Term::Var(v) = decoded else { panic!("expected var") };
        assert_eq!(v.name, "X");
        assert_eq!(v.attr.len(), 1);
        assert_eq!(v.attr[0].to_string(), "dif(X, Y)");
    }

    #[test]
    fn malformed_rational_is_a_protocol_error() {
        assert!(term_from_json(&json!({"numerator": 1})).is_err());
        assert!(term_from_json(&json!({"numerator": 1, "denominator": 0})).is_err());
    }

    #[test]
    fn unknown_shapes_are_protocol_errors() {
        assert!(term_from_json(&json!({"wat": 1})).is_err());
        assert!(term_from_json(&Value::Null).is_err());
    }
}
