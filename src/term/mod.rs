//! Prolog term model and canonical text rendering.
//!
//! [`Term`] is the host-side representation of every value that crosses
//! the engine boundary: goals submitted to the engine, continuation
//! terms returned by host predicates, and solutions decoded from answer
//! envelopes. Rendering a term with `Display` produces the canonical
//! text the engine parses back: bare or quoted atoms, escaped strings,
//! `/` and `:` printed infix, lists in bracket notation.

mod ball;
mod decode;

pub use ball::{
    domain_error, existence_error, permission_error, resource_error, system_error, throw_term,
    type_error,
};
pub(crate) use decode::term_from_json;

use std::fmt;

use num_bigint::BigInt;
use num_rational::BigRational;

/// A Prolog term.
#[derive(Debug, Clone, PartialEq)]
pub enum Term {
    /// An atom, possibly requiring quotes when rendered.
    Atom(Atom),
    /// A Prolog string (list of chars on the engine side).
    Str(String),
    /// A fixnum.
    Int(i64),
    /// An integer too large for `i64`.
    Big(BigInt),
    /// A floating-point number.
    Float(f64),
    /// A rational number.
    Rat(BigRational),
    /// A compound term: functor plus arguments.
    Compound(Compound),
    /// An unbound variable, possibly carrying residual goals.
    Var(Variable),
    /// A proper list. The empty list renders as `[]`.
    List(Vec<Term>),
}

impl Term {
    /// Shorthand for an atom term.
    pub fn atom(name: impl Into<String>) -> Term {
        Term::Atom(Atom::new(name))
    }

    /// Shorthand for a string term.
    pub fn string(text: impl Into<String>) -> Term {
        Term::Str(text.into())
    }

    /// The predicate indicator of this term (`foo/2`, `bar/0`), if it is
    /// an atom or compound.
    pub fn indicator(&self) -> Option<String> {
        self.pi().map(|pi| pi.to_string())
    }

    /// The predicate indicator as a `Name/Arity` compound.
    pub(crate) fn pi(&self) -> Option<Compound> {
        match self {
            Term::Atom(a) => Some(pi_term(a.clone(), 0)),
            Term::Compound(c) => Some(c.pi()),
            _ => None,
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Atom(a) => a.fmt(f),
            Term::Str(s) => write!(f, "{}", escape_string(s)),
            Term::Int(n) => write!(f, "{n}"),
            Term::Big(n) => write!(f, "{n}"),
            Term::Float(x) => write!(f, "{x}"),
            Term::Rat(r) => write!(f, "{}r{}", r.numer(), r.denom()),
            Term::Compound(c) => c.fmt(f),
            Term::Var(v) => v.fmt(f),
            Term::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i != 0 {
                        f.write_str(", ")?;
                    }
                    item.fmt(f)?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<Atom> for Term {
    fn from(a: Atom) -> Term {
        Term::Atom(a)
    }
}

impl From<Compound> for Term {
    fn from(c: Compound) -> Term {
        Term::Compound(c)
    }
}

impl From<Variable> for Term {
    fn from(v: Variable) -> Term {
        Term::Var(v)
    }
}

impl From<i64> for Term {
    fn from(n: i64) -> Term {
        Term::Int(n)
    }
}

impl From<f64> for Term {
    fn from(x: f64) -> Term {
        Term::Float(x)
    }
}

impl From<&str> for Term {
    fn from(s: &str) -> Term {
        Term::Str(s.to_owned())
    }
}

impl From<String> for Term {
    fn from(s: String) -> Term {
        Term::Str(s)
    }
}

impl From<BigInt> for Term {
    fn from(n: BigInt) -> Term {
        Term::Big(n)
    }
}

impl From<Vec<Term>> for Term {
    fn from(items: Vec<Term>) -> Term {
        Term::List(items)
    }
}

/// A Prolog atom.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Atom(String);

impl Atom {
    /// Create an atom from its name.
    pub fn new(name: impl Into<String>) -> Atom {
        Atom(name.into())
    }

    /// The raw (unquoted) name of this atom.
    pub fn name(&self) -> &str {
        &self.0
    }

    /// Build a compound with this atom as the principal functor.
    pub fn of(self, args: impl IntoIterator<Item = Term>) -> Compound {
        Compound {
            functor: self,
            args: args.into_iter().collect(),
        }
    }

    /// The `Name/0` predicate indicator for this atom.
    pub fn indicator(&self) -> String {
        pi_term(self.clone(), 0).to_string()
    }

    fn needs_quotes(&self) -> bool {
        let mut chars = self.0.chars();
        let Some(first) = chars.next() else {
            return true;
        };
        if !first.is_lowercase() {
            return true;
        }
        self.0
            .chars()
            .any(|c| !(c == '_' || c.is_alphabetic() || c.is_numeric()))
    }
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.needs_quotes() {
            return f.write_str(&self.0);
        }
        f.write_str("'")?;
        for c in self.0.chars() {
            match c {
                '\\' => f.write_str("\\\\")?,
                '\'' => f.write_str("\\'")?,
                _ => write!(f, "{c}")?,
            }
        }
        f.write_str("'")
    }
}

impl From<&str> for Atom {
    fn from(s: &str) -> Atom {
        Atom::new(s)
    }
}

/// A compound term: a functor applied to one or more arguments.
///
/// A compound with zero arguments renders as its bare functor.
#[derive(Debug, Clone, PartialEq)]
pub struct Compound {
    /// The principal functor. Example: the functor of `foo(bar)` is `foo`.
    pub functor: Atom,
    /// The arguments.
    pub args: Vec<Term>,
}

impl Compound {
    /// The `Name/Arity` predicate indicator of this compound.
    pub fn indicator(&self) -> String {
        self.pi().to_string()
    }

    pub(crate) fn pi(&self) -> Compound {
        pi_term(self.functor.clone(), self.args.len() as i64)
    }
}

impl fmt::Display for Compound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.args.is_empty() {
            return self.functor.fmt(f);
        }

        // `/` and `:` print infix so indicators and module-qualified
        // goals read naturally.
        if self.args.len() == 2 && matches!(self.functor.name(), "/" | ":") {
            write!(f, "{}{}{}", self.args[0], self.functor.name(), self.args[1])?;
            return Ok(());
        }

        self.functor.fmt(f)?;
        f.write_str("(")?;
        for (i, arg) in self.args.iter().enumerate() {
            if i != 0 {
                f.write_str(", ")?;
            }
            arg.fmt(f)?;
        }
        f.write_str(")")
    }
}

/// An unbound Prolog variable.
///
/// Variables returned by the engine may carry residual goals produced by
/// constraint predicates (`dif/2` and friends); those print in place of
/// the variable name.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Variable {
    /// The variable's name.
    pub name: String,
    /// Residual goals attached to this variable, if any.
    pub attr: Vec<Term>,
}

impl Variable {
    /// A fresh variable with the given name and no attributes.
    pub fn new(name: impl Into<String>) -> Variable {
        Variable {
            name: name.into(),
            attr: Vec::new(),
        }
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.attr.is_empty() {
            return f.write_str(&self.name);
        }
        for (i, goal) in self.attr.iter().enumerate() {
            if i != 0 {
                f.write_str(", ")?;
            }
            goal.fmt(f)?;
        }
        Ok(())
    }
}

/// Build a `Name/Arity` predicate-indicator compound.
pub(crate) fn pi_term(functor: Atom, arity: i64) -> Compound {
    Atom::new("/").of([Term::Atom(functor), Term::Int(arity)])
}

/// Fresh variables `A`, `B`, ... `Z`, then `_26`, `_27`, ... for stub
/// clause heads.
pub(crate) fn numbervars(n: usize) -> Vec<Term> {
    (0..n)
        .map(|i| {
            let name = if i < 26 {
                ((b'A' + i as u8) as char).to_string()
            } else {
                format!("_{i}")
            };
            Term::Var(Variable::new(name))
        })
        .collect()
}

/// Escape and double-quote a Prolog string.
pub(crate) fn escape_string(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Escape a goal for embedding in the `wasm:js_ask("...")` wrapper.
///
/// Tabs and newlines become spaces and carriage returns are dropped, so
/// the wrapped goal stays on one line for the engine's reader.
pub(crate) fn escape_query(goal: &str) -> String {
    let mut out = String::with_capacity(goal.len() + 2);
    out.push('"');
    for c in goal.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' | '\t' => out.push(' '),
            '\r' => {}
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atoms_quote_when_needed() {
        assert_eq!(Term::atom("foo").to_string(), "foo");
        assert_eq!(Term::atom("fooBar9_").to_string(), "fooBar9_");
        assert_eq!(Term::atom("Foo").to_string(), "'Foo'");
        assert_eq!(Term::atom("").to_string(), "''");
        assert_eq!(Term::atom("hello world").to_string(), "'hello world'");
        assert_eq!(Term::atom("[]").to_string(), "'[]'");
        assert_eq!(Term::atom("it's").to_string(), "'it\\'s'");
        assert_eq!(Term::atom("\\").to_string(), "'\\\\'");
        // Non-ASCII letters are fine inside, but a non-lowercase first
        // char forces quotes.
        assert_eq!(Term::atom("世界").to_string(), "'世界'");
    }

    #[test]
    fn strings_escape() {
        assert_eq!(Term::string("baz").to_string(), r#""baz""#);
        assert_eq!(Term::string("a\"b").to_string(), r#""a\"b""#);
        assert_eq!(Term::string("a\\b").to_string(), r#""a\\b""#);
        assert_eq!(Term::string("a\nb\tc").to_string(), r#""a\nb\tc""#);
    }

    #[test]
    fn numbers_render_in_decimal() {
        assert_eq!(Term::Int(42).to_string(), "42");
        assert_eq!(Term::Int(-7).to_string(), "-7");
        assert_eq!(Term::Float(4.2).to_string(), "4.2");
        assert_eq!(
            Term::Big("9999999999999999999999".parse::<BigInt>().unwrap()).to_string(),
            "9999999999999999999999"
        );
    }

    #[test]
    fn rationals_use_engine_literal_syntax() {
        let r = BigRational::new(BigInt::from(-1), BigInt::from(3));
        assert_eq!(Term::Rat(r).to_string(), "-1r3");
    }

    #[test]
    fn compounds_render_with_args() {
        let t = Atom::new("foo").of([Term::atom("bar"), Term::Int(1)]);
        assert_eq!(t.to_string(), "foo(bar, 1)");
        let empty = Atom::new("foo").of([]);
        assert_eq!(empty.to_string(), "foo");
    }

    #[test]
    fn slash_and_colon_print_infix() {
        assert_eq!(pi_term(Atom::new("member"), 2).to_string(), "member/2");
        let qualified = Atom::new(":").of([
            Term::atom("user"),
            Atom::new("hello").of([Term::atom("world")]).into(),
        ]);
        assert_eq!(qualified.to_string(), "user:hello(world)");
    }

    #[test]
    fn lists_render_bracketed() {
        let t = Term::List(vec![Term::Int(1), Term::atom("a"), Term::string("s")]);
        assert_eq!(t.to_string(), r#"[1, a, "s"]"#);
        assert_eq!(Term::List(vec![]).to_string(), "[]");
    }

    #[test]
    fn variables_render_by_name_or_residuals() {
        assert_eq!(Term::Var(Variable::new("X")).to_string(), "X");
        let attributed = Variable {
            name: "X".into(),
            attr: vec![Atom::new("dif")
                .of([Term::Var(Variable::new("X")), Term::Var(Variable::new("Y"))])
                .into()],
        };
        assert_eq!(Term::Var(attributed).to_string(), "dif(X, Y)");
    }

    #[test]
    fn numbervars_wrap_past_the_alphabet() {
        let vars = numbervars(28);
        assert_eq!(vars[0].to_string(), "A");
        assert_eq!(vars[25].to_string(), "Z");
        assert_eq!(vars[26].to_string(), "_26");
        assert_eq!(vars[27].to_string(), "_27");
    }

    #[test]
    fn query_escaping_flattens_whitespace() {
        assert_eq!(escape_query("foo(\"a\")"), r#""foo(\"a\")""#);
        assert_eq!(escape_query("a,\n\tb"), r#""a,  b""#);
        assert_eq!(escape_query("a\r\nb"), r#""a b""#);
        assert_eq!(escape_query("back\\slash"), r#""back\\slash""#);
    }

    #[test]
    fn indicators() {
        assert_eq!(Term::atom("foo").indicator().unwrap(), "foo/0");
        let c: Term = Atom::new("foo").of([Term::Int(1), Term::Int(2)]).into();
        assert_eq!(c.indicator().unwrap(), "foo/2");
        assert_eq!(Term::Int(3).indicator(), None);
    }
}
