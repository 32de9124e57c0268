//! Built-in host predicates loaded into every interpreter.
//!
//! These ride the same registration path as user predicates: a stub
//! clause routes the call through `host-call`, and the implementations
//! reply with continuation terms (or standard error balls).

use sha2::{Digest, Sha256, Sha512};

use crate::coroutine::{sys_coro_next, sys_coro_stop};
use crate::error::Result;
use crate::session::{HostFn, Session, Subquery};
use crate::term::{
    domain_error, existence_error, permission_error, pi_term, resource_error, system_error,
    type_error, Atom, Compound, Term, Variable,
};

const USER_AGENT: &str = "trealla-prolog/rust";
const HTTP_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Register every built-in predicate.
pub(crate) fn load_builtins(session: &mut Session<'_>) -> Result<()> {
    let builtins: [(&str, usize, HostFn); 5] = [
        ("$coro_next", 2, std::sync::Arc::new(sys_coro_next)),
        ("$coro_stop", 1, std::sync::Arc::new(sys_coro_stop)),
        ("crypto_data_hash", 3, std::sync::Arc::new(crypto_data_hash_3)),
        ("http_consult", 1, std::sync::Arc::new(http_consult_1)),
        ("http_fetch", 3, std::sync::Arc::new(http_fetch_3)),
    ];
    for (name, arity, proc) in builtins {
        session.register_arc(name, arity, proc)?;
    }
    Ok(())
}

/// Find `name(Value)` in an options list. An unbound option argument is
/// replaced in place with the fallback, so the continuation term binds
/// it when it unifies with the call.
fn find_option(options: &mut Term, name: &str, fallback: &Term) -> Term {
    match options {
        Term::List(items) => {
            for item in items.iter_mut() {
                let Term::Compound(option) = item else {
                    continue;
                };
                if option.functor.name() != name || option.args.len() != 1 {
                    continue;
                }
                if matches!(option.args[0], Term::Var(_)) {
                    option.args[0] = fallback.clone();
                    return fallback.clone();
                }
                return option.args[0].clone();
            }
            fallback.clone()
        }
        _ => fallback.clone(),
    }
}

fn is_list(term: &Term) -> bool {
    matches!(term, Term::List(_)) || matches!(term, Term::Atom(a) if a.name() == "[]")
}

/// `crypto_data_hash(+Data, -Hash, +Options)`: hex digest of Data.
/// Supported algorithms: sha256 (default), sha512.
fn crypto_data_hash_3(_session: &mut Session<'_>, _subquery: Subquery, goal: &Term) -> Term {
    let pi: Term = pi_term(Atom::new("crypto_data_hash"), 3).into();
    let Term::Compound(call) = goal else {
        return type_error("compound", goal.clone(), pi);
    };
    if call.args.len() != 3 {
        return system_error(pi);
    }

    let data = &call.args[0];
    let Term::Str(input) = data else {
        return type_error("chars", data.clone(), pi);
    };
    match &call.args[1] {
        Term::Var(_) | Term::Str(_) => {}
        other => return type_error("chars", other.clone(), pi),
    }
    if !is_list(&call.args[2]) {
        return type_error("list", call.args[2].clone(), pi);
    }

    let mut options = call.args[2].clone();
    let algorithm = find_option(&mut options, "algorithm", &Term::atom("sha256"));
    let digest = match &algorithm {
        Term::Atom(a) if a.name() == "sha256" => hex::encode(Sha256::digest(input.as_bytes())),
        Term::Atom(a) if a.name() == "sha512" => hex::encode(Sha512::digest(input.as_bytes())),
        other => return domain_error("algorithm", other.clone(), pi),
    };

    Atom::new("crypto_data_hash")
        .of([data.clone(), Term::string(digest), options])
        .into()
}

/// `http_consult(+UrlOrModule)`: GET a Prolog source and load it.
/// Accepts either a URL string or `Module:"https://..."`.
fn http_consult_1(_session: &mut Session<'_>, _subquery: Subquery, goal: &Term) -> Term {
    let pi: Term = pi_term(Atom::new("http_consult"), 1).into();
    let Term::Compound(call) = goal else {
        return type_error("compound", goal.clone(), pi);
    };
    if call.args.len() != 1 {
        return system_error(pi);
    }

    let mut module = Atom::new("user");
    let address;
    match &call.args[0] {
        Term::Str(url) => address = url.clone(),
        Term::Compound(qualified)
            if qualified.functor.name() == ":" && qualified.args.len() == 2 =>
        {
            let Term::Atom(name) = &qualified.args[0] else {
                return type_error("atom", qualified.args[0].clone(), pi);
            };
            let Term::Str(url) = &qualified.args[1] else {
                return type_error("chars", qualified.args[1].clone(), pi);
            };
            module = name.clone();
            address = url.clone();
        }
        other => return type_error("chars", other.clone(), pi),
    }

    let body = match fetch(&address, "GET", "", Some("application/x-prolog"), &pi) {
        Ok(Some(body)) => body,
        Ok(None) => return goal.clone(),
        Err(ball) => return ball,
    };

    // call(load_text(Text, [module(Module)])).
    Atom::new("call")
        .of([Atom::new("load_text")
            .of([
                Term::string(body),
                Term::List(vec![Atom::new("module").of([module.into()]).into()]),
            ])
            .into()])
        .into()
}

/// `http_fetch(+Url, -Result, +Options)`: GET/POST a URL.
/// Options: `method(get)`, `as(string)` or `as(json)`, `body(Text)`.
fn http_fetch_3(_session: &mut Session<'_>, _subquery: Subquery, goal: &Term) -> Term {
    let pi: Term = pi_term(Atom::new("http_fetch"), 3).into();
    let Term::Compound(call) = goal else {
        return type_error("compound", goal.clone(), pi);
    };
    if call.args.len() != 3 {
        return system_error(pi);
    }

    let Term::Str(url) = &call.args[0] else {
        return type_error("chars", call.args[0].clone(), pi);
    };
    let result = call.args[1].clone();

    let mut options = call.args[2].clone();
    let method = match find_option(&mut options, "method", &Term::atom("get")) {
        Term::Atom(a) => a.name().to_uppercase(),
        other => return domain_error("method", other, pi),
    };
    let as_kind = find_option(&mut options, "as", &Term::atom("string"));
    let body = match find_option(&mut options, "body", &Term::string("")) {
        Term::Str(text) => text,
        other => return type_error("chars", other, pi),
    };

    let response = match fetch(url, &method, &body, None, &pi) {
        Ok(Some(body)) => body,
        Ok(None) => return goal.clone(),
        Err(ball) => return ball,
    };

    if matches!(&as_kind, Term::Atom(a) if a.name() == "json") {
        // call((Result = _JS, json_chars(_JS, Body))).
        let js: Term = Variable::new("_JS").into();
        return Atom::new("call")
            .of([Atom::new(",")
                .of([
                    Atom::new("=").of([result, js.clone()]).into(),
                    Atom::new("json_chars").of([js, Term::string(response)]).into(),
                ])
                .into()])
            .into();
    }

    Compound {
        functor: call.functor.clone(),
        args: vec![
            call.args[0].clone(),
            Term::string(response),
            Variable::new("_").into(),
        ],
    }
    .into()
}

/// Perform an HTTP request, mapping error statuses to the standard
/// error balls. `Ok(None)` means 204 No Content.
fn fetch(
    url: &str,
    method: &str,
    body: &str,
    accept: Option<&str>,
    pi: &Term,
) -> std::result::Result<Option<String>, Term> {
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(domain_error("url", Term::string(url), pi.clone()));
    }

    let agent = ureq::AgentBuilder::new().timeout(HTTP_TIMEOUT).build();
    let mut request = agent.request(method, url).set("User-Agent", USER_AGENT);
    if let Some(accept) = accept {
        request = request.set("Accept", accept);
    }

    let outcome = if body.is_empty() {
        request.call()
    } else {
        request.send_string(body)
    };

    let response = match outcome {
        Ok(response) => response,
        Err(ureq::Error::Status(404 | 410, _)) => {
            return Err(existence_error("source_sink", Term::string(url), pi.clone()));
        }
        Err(ureq::Error::Status(401 | 403, _)) => {
            return Err(permission_error(
                "open,source_sink",
                Term::string(url),
                pi.clone(),
            ));
        }
        Err(ureq::Error::Status(code, _)) => {
            return Err(system_error(Term::atom(format!(
                "unexpected status code: {code}"
            ))));
        }
        Err(ureq::Error::Transport(transport)) => {
            return Err(system_error(Term::atom(transport.to_string())));
        }
    };

    if response.status() == 204 {
        return Ok(None);
    }
    response
        .into_string()
        .map(Some)
        .map_err(|err| resource_error(Term::atom(err.to_string()), pi.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_option_reads_present_options() {
        let mut options = Term::List(vec![Atom::new("algorithm").of([Term::atom("sha512")]).into()]);
        let value = find_option(&mut options, "algorithm", &Term::atom("sha256"));
        assert_eq!(value, Term::atom("sha512"));
    }

    #[test]
    fn find_option_binds_unbound_options_to_the_default() {
        let mut options = Term::List(vec![Atom::new("algorithm")
            .of([Variable::new("A").into()])
            .into()]);
        let value = find_option(&mut options, "algorithm", &Term::atom("sha256"));
        assert_eq!(value, Term::atom("sha256"));
        // The options list itself now carries the default, so the reply
        // unifies A with it.
        assert_eq!(options.to_string(), "[algorithm(sha256)]");
    }

    #[test]
    fn find_option_falls_back_when_absent() {
        let mut options = Term::List(vec![]);
        let value = find_option(&mut options, "as", &Term::atom("string"));
        assert_eq!(value, Term::atom("string"));
        let mut empty = Term::atom("[]");
        assert_eq!(find_option(&mut empty, "as", &Term::atom("string")), Term::atom("string"));
    }

    #[test]
    fn is_list_accepts_both_list_shapes() {
        assert!(is_list(&Term::List(vec![])));
        assert!(is_list(&Term::atom("[]")));
        assert!(!is_list(&Term::Int(1)));
    }
}
