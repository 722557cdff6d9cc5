// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of concurrent.
//
// concurrent is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// concurrent is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with concurrent.  If not,
// see <http://www.gnu.org/licenses/>.

//! # policies
//!
//! Who may do what is decided by *policies*: JSON documents mapping action names
//! (`timeline.distribute`, say) to boolean expressions over the request. A policy looks like:
//!
//! ```json
//! {
//!   "statements": {
//!     "timeline.distribute": {
//!       "dominant": false,
//!       "defaultOnTrue": false,
//!       "defaultOnFalse": false,
//!       "condition": {"op": "Eq", "args": [{"op": "LoadSelf", "const": "author"},
//!                                          {"op": "RequesterID"}]}
//!     }
//!   },
//!   "defaults": {"timeline.distribute": false}
//! }
//! ```
//!
//! Testing one policy against one action yields an [EvalResult]. `Always` & `Never` are verdicts
//! from "dominant" statements & short-circuit everything else; `Allow` & `Deny` are ordinary
//! verdicts; `Default` means the policy had nothing to say; `Error` means it tried & failed.
//! An error is never an allow.
//!
//! The node carries a *global* policy, pinned at startup, which is consulted on every test; a
//! resource may in addition name a policy by URL, which is fetched & cached.

use std::{collections::HashMap, str::FromStr, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::{Backtrace, ResultExt, Snafu};
use tracing::{debug, warn};
use url::Url;

use concurrent_shared::entities::{is_ccid, is_ckid, is_csid, Domain, Entity, Key};

use crate::{cache::Cache, peer::Peers};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to fetch the policy at {url}: {source}"))]
    Fetch {
        url: String,
        #[snafu(source(from(crate::peer::Error, Box::new)))]
        source: Box<crate::peer::Error>,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to parse a policy: {source}"))]
    Parse {
        source: serde_json::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("{url} is not a legal policy URL: {source}"))]
    Url {
        url: String,
        source: url::ParseError,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failures evaluating an expression
#[derive(Clone, Debug, PartialEq, Snafu)]
pub enum EvalError {
    #[snafu(display("{op} takes {expected} argument(s), not {got}"))]
    Arity {
        op: &'static str,
        expected: usize,
        got: usize,
    },
    #[snafu(display("Nothing at {path} for {op}"))]
    Missing { op: &'static str, path: String },
    #[snafu(display("{op} expected {expected}"))]
    Type {
        op: &'static str,
        expected: &'static str,
    },
    #[snafu(display("Unknown operator {op}"))]
    UnknownOp { op: String },
}

type EvalResultT<T> = std::result::Result<T, EvalError>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        policy documents                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Expr {
    pub op: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Expr>,
    #[serde(default, rename = "const", skip_serializing_if = "Value::is_null")]
    pub constant: Value,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Statement {
    #[serde(default)]
    pub dominant: bool,
    #[serde(default, rename = "defaultOnTrue")]
    pub default_on_true: bool,
    #[serde(default, rename = "defaultOnFalse")]
    pub default_on_false: bool,
    pub condition: Expr,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Policy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub statements: HashMap<String, Statement>,
    #[serde(default)]
    pub defaults: HashMap<String, bool>,
}

impl Policy {
    /// The statement governing `action`: an exact match, else the longest trailing-`*` pattern
    /// matching it
    pub fn statement(&self, action: &str) -> Option<&Statement> {
        self.statements.get(action).or_else(|| {
            self.statements
                .iter()
                .filter_map(|(pattern, stmt)| {
                    pattern
                        .strip_suffix('*')
                        .filter(|prefix| action.starts_with(prefix))
                        .map(|prefix| (prefix.len(), stmt))
                })
                .max_by_key(|(len, _)| *len)
                .map(|(_, stmt)| stmt)
        })
    }
}

impl FromStr for Policy {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        serde_json::from_str(s).context(ParseSnafu)
    }
}

/// The built-in global policy
pub const DEFAULT_GLOBAL_POLICY: &str = include_str!("policies/global.json");

/// The outcome of testing a policy against an action
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EvalResult {
    Always,
    Never,
    Allow,
    Deny,
    Default,
    Error,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          evaluation                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Everything an expression may consult
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    /// None for unauthenticated requests
    pub requester: Option<Entity>,
    pub requester_domain: Option<Domain>,
    pub requester_keychain: Vec<Key>,
    /// The resource being acted upon (the timeline being posted to, e.g.)
    pub this: Value,
    /// The resource being created or affected (the message being posted, e.g.)
    pub resource: Value,
    /// The document driving the request
    pub document: Value,
    pub params: Value,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Op {
    Const,
    And,
    Or,
    Not,
    Eq,
    Contains,
    LoadParam,
    LoadDocument,
    LoadSelf,
    LoadResource,
    IsRequesterLocalUser,
    IsRequesterRemoteUser,
    IsRequesterGuestUser,
    RequesterHasTag,
    RequesterDomainHasTag,
    RequesterID,
    IsCCID,
    IsCSID,
    IsCKID,
    DomainFQDN,
    DomainCSID,
}

impl FromStr for Op {
    type Err = EvalError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "Const" => Op::Const,
            "And" => Op::And,
            "Or" => Op::Or,
            "Not" => Op::Not,
            "Eq" => Op::Eq,
            "Contains" => Op::Contains,
            "LoadParam" => Op::LoadParam,
            "LoadDocument" => Op::LoadDocument,
            "LoadSelf" => Op::LoadSelf,
            "LoadResource" => Op::LoadResource,
            "IsRequesterLocalUser" => Op::IsRequesterLocalUser,
            "IsRequesterRemoteUser" => Op::IsRequesterRemoteUser,
            "IsRequesterGuestUser" => Op::IsRequesterGuestUser,
            "RequesterHasTag" => Op::RequesterHasTag,
            "RequesterDomainHasTag" => Op::RequesterDomainHasTag,
            "RequesterID" => Op::RequesterID,
            "IsCCID" => Op::IsCCID,
            "IsCSID" => Op::IsCSID,
            "IsCKID" => Op::IsCKID,
            "DomainFQDN" => Op::DomainFQDN,
            "DomainCSID" => Op::DomainCSID,
            _ => return UnknownOpSnafu { op: s }.fail(),
        })
    }
}

/// Follow a dotted path (`a.b.c`) into a JSON object
fn resolve_dotted<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |value, key| value.get(key))
}

fn as_bool(op: &'static str, value: Value) -> EvalResultT<bool> {
    value.as_bool().ok_or(EvalError::Type {
        op,
        expected: "a boolean",
    })
}

fn const_str<'a>(op: &'static str, expr: &'a Expr) -> EvalResultT<&'a str> {
    expr.constant.as_str().ok_or(EvalError::Type {
        op,
        expected: "a string constant",
    })
}

fn arity(op: &'static str, expr: &Expr, expected: usize) -> EvalResultT<()> {
    if expr.args.len() == expected {
        Ok(())
    } else {
        AritySnafu {
            op,
            expected,
            got: expr.args.len(),
        }
        .fail()
    }
}

fn load(op: &'static str, root: &Value, expr: &Expr) -> EvalResultT<Value> {
    let path = const_str(op, expr)?;
    resolve_dotted(root, path)
        .cloned()
        .ok_or_else(|| EvalError::Missing {
            op,
            path: path.to_owned(),
        })
}

/// The policy engine
pub struct PolicyEngine {
    global: Policy,
    fqdn: String,
    csid: String,
    cache: Arc<dyn Cache + Send + Sync>,
    peers: Arc<Peers>,
}

/// Fetched policies are cached this long
const POLICY_TTL: Duration = Duration::from_secs(600);

impl PolicyEngine {
    pub fn new(
        global: Policy,
        fqdn: &str,
        csid: &str,
        cache: Arc<dyn Cache + Send + Sync>,
        peers: Arc<Peers>,
    ) -> PolicyEngine {
        PolicyEngine {
            global,
            fqdn: fqdn.to_owned(),
            csid: csid.to_owned(),
            cache,
            peers,
        }
    }

    pub fn global(&self) -> &Policy {
        &self.global
    }

    /// Evaluate `expr` in `ctx`
    pub fn eval(&self, expr: &Expr, ctx: &RequestContext) -> EvalResultT<Value> {
        let op: Op = expr.op.parse()?;
        match op {
            Op::Const => Ok(expr.constant.clone()),
            Op::And => {
                for arg in &expr.args {
                    if !as_bool("And", self.eval(arg, ctx)?)? {
                        return Ok(Value::Bool(false));
                    }
                }
                Ok(Value::Bool(true))
            }
            Op::Or => {
                for arg in &expr.args {
                    if as_bool("Or", self.eval(arg, ctx)?)? {
                        return Ok(Value::Bool(true));
                    }
                }
                Ok(Value::Bool(false))
            }
            Op::Not => {
                arity("Not", expr, 1)?;
                Ok(Value::Bool(!as_bool("Not", self.eval(&expr.args[0], ctx)?)?))
            }
            Op::Eq => {
                arity("Eq", expr, 2)?;
                let lhs = self.eval(&expr.args[0], ctx)?;
                let rhs = self.eval(&expr.args[1], ctx)?;
                Ok(Value::Bool(lhs == rhs))
            }
            Op::Contains => {
                arity("Contains", expr, 2)?;
                let haystack = self.eval(&expr.args[0], ctx)?;
                let needle = self.eval(&expr.args[1], ctx)?;
                match (&haystack, &needle) {
                    (Value::Array(items), _) => Ok(Value::Bool(items.contains(&needle))),
                    (Value::String(text), Value::String(sub)) => {
                        Ok(Value::Bool(text.contains(sub.as_str())))
                    }
                    _ => TypeSnafu {
                        op: "Contains",
                        expected: "a list, or a string & a substring",
                    }
                    .fail(),
                }
            }
            Op::LoadParam => load("LoadParam", &ctx.params, expr),
            Op::LoadDocument => load("LoadDocument", &ctx.document, expr),
            Op::LoadSelf => load("LoadSelf", &ctx.this, expr),
            Op::LoadResource => load("LoadResource", &ctx.resource, expr),
            Op::IsRequesterLocalUser => Ok(Value::Bool(
                ctx.requester
                    .as_ref()
                    .is_some_and(|requester| requester.domain == self.fqdn),
            )),
            Op::IsRequesterRemoteUser => Ok(Value::Bool(
                ctx.requester
                    .as_ref()
                    .is_some_and(|requester| requester.domain != self.fqdn),
            )),
            Op::IsRequesterGuestUser => Ok(Value::Bool(ctx.requester.is_none())),
            Op::RequesterHasTag => {
                let tag = const_str("RequesterHasTag", expr)?;
                Ok(Value::Bool(
                    ctx.requester
                        .as_ref()
                        .is_some_and(|requester| requester.has_tag(tag)),
                ))
            }
            Op::RequesterDomainHasTag => {
                let tag = const_str("RequesterDomainHasTag", expr)?;
                Ok(Value::Bool(
                    ctx.requester_domain
                        .as_ref()
                        .is_some_and(|domain| domain.has_tag(tag)),
                ))
            }
            Op::RequesterID => Ok(Value::String(
                ctx.requester
                    .as_ref()
                    .map(|requester| requester.ccid.clone())
                    .unwrap_or_default(),
            )),
            Op::IsCCID | Op::IsCSID | Op::IsCKID => {
                let (name, pred): (&'static str, fn(&str) -> bool) = match op {
                    Op::IsCCID => ("IsCCID", is_ccid),
                    Op::IsCSID => ("IsCSID", is_csid),
                    _ => ("IsCKID", is_ckid),
                };
                arity(name, expr, 1)?;
                match self.eval(&expr.args[0], ctx)? {
                    Value::String(text) => Ok(Value::Bool(pred(&text))),
                    _ => TypeSnafu {
                        op: name,
                        expected: "a string",
                    }
                    .fail(),
                }
            }
            Op::DomainFQDN => Ok(Value::String(self.fqdn.clone())),
            Op::DomainCSID => Ok(Value::String(self.csid.clone())),
        }
    }

    /// Test `policy` alone against `action`
    pub fn test_single(&self, policy: &Policy, ctx: &RequestContext, action: &str) -> EvalResult {
        let Some(statement) = policy.statement(action) else {
            return EvalResult::Default;
        };
        let verdict = match self.eval(&statement.condition, ctx) {
            Ok(Value::Bool(verdict)) => verdict,
            Ok(other) => {
                debug!("The condition for {action} produced a non-boolean: {other}");
                return EvalResult::Error;
            }
            Err(err) => {
                debug!("Failed to evaluate the condition for {action}: {err}");
                return EvalResult::Error;
            }
        };
        match (verdict, statement) {
            (true, Statement {
                default_on_true: true,
                ..
            }) => EvalResult::Default,
            (false, Statement {
                default_on_false: true,
                ..
            }) => EvalResult::Default,
            (true, Statement { dominant: true, .. }) => EvalResult::Always,
            (false, Statement { dominant: true, .. }) => EvalResult::Never,
            (true, _) => EvalResult::Allow,
            (false, _) => EvalResult::Deny,
        }
    }

    /// Test `policy` in conjunction with the global policy
    ///
    /// A global `Always`, `Never` or `Deny` is final. Otherwise the local verdict stands, unless
    /// the local policy had nothing (useful) to say, in which case the global verdict does.
    pub fn test(&self, policy: &Policy, ctx: &RequestContext, action: &str) -> EvalResult {
        let global = self.test_single(&self.global, ctx, action);
        if matches!(
            global,
            EvalResult::Always | EvalResult::Never | EvalResult::Deny
        ) {
            return global;
        }
        if policy.statements.is_empty() {
            return global;
        }
        match self.test_single(policy, ctx, action) {
            EvalResult::Default | EvalResult::Error => global,
            local => local,
        }
    }

    pub fn test_with_global(&self, ctx: &RequestContext, action: &str) -> EvalResult {
        self.test_single(&self.global, ctx, action)
    }

    /// Retrieve the policy at `url`, from the cache if possible
    pub async fn policy_at(&self, url: &str) -> Result<Policy> {
        let key = format!("policy:{url}");
        match self.cache.get(&key).await {
            Ok(Some(text)) => match text.parse::<Policy>() {
                Ok(policy) => return Ok(policy),
                Err(err) => warn!("Discarding a bad cached policy for {url}: {err}"),
            },
            Ok(None) => (),
            Err(err) => warn!("Failed to consult the cache for {url}: {err}"),
        }
        let parsed = Url::parse(url).context(UrlSnafu { url })?;
        let body = self.peers.fetch(&parsed).await.context(FetchSnafu { url })?;
        let policy: Policy = serde_json::from_slice(&body).context(ParseSnafu)?;
        if let Err(err) = self
            .cache
            .set(&key, &String::from_utf8_lossy(&body), Some(POLICY_TTL))
            .await
        {
            warn!("Failed to cache the policy at {url}: {err}");
        }
        Ok(policy)
    }

    /// Test the policy at `url` (in conjunction with the global policy)
    pub async fn test_with_url(
        &self,
        url: &str,
        ctx: &RequestContext,
        action: &str,
    ) -> Result<EvalResult> {
        let policy = self.policy_at(url).await?;
        Ok(self.test(&policy, ctx, action))
    }

    fn default_for(&self, action: &str, overrides: Option<&HashMap<String, bool>>) -> bool {
        overrides
            .and_then(|overrides| overrides.get(action))
            .or_else(|| self.global.defaults.get(action))
            .copied()
            .unwrap_or(false)
    }

    /// Reduce a sequence of results to a final decision
    pub fn summarise(
        &self,
        results: &[EvalResult],
        action: &str,
        overrides: Option<&HashMap<String, bool>>,
    ) -> bool {
        let default = self.default_for(action, overrides);
        let mut decision = default;
        for result in results {
            match result {
                EvalResult::Always => return true,
                EvalResult::Never => return false,
                EvalResult::Allow => decision = true,
                EvalResult::Deny => decision = false,
                EvalResult::Error => decision = default,
                EvalResult::Default => (),
            }
        }
        decision
    }

    /// Combine results disjunctively; contradictory verdicts of equal strength cancel out
    pub fn accumulate_or(
        &self,
        results: &[EvalResult],
        action: &str,
        overrides: Option<&HashMap<String, bool>>,
    ) -> EvalResult {
        let default = self.default_for(action, overrides);
        let (mut always, mut never, mut allow, mut deny) = (false, false, false, false);
        for result in results {
            match result {
                EvalResult::Always => always = true,
                EvalResult::Never => never = true,
                EvalResult::Allow => allow = true,
                EvalResult::Deny => deny = true,
                EvalResult::Error if default => allow = true,
                EvalResult::Error => deny = true,
                EvalResult::Default => (),
            }
        }
        match (always, never, allow, deny) {
            (true, true, _, _) => EvalResult::Default,
            (true, false, _, _) => EvalResult::Always,
            (false, true, _, _) => EvalResult::Never,
            (_, _, true, true) => EvalResult::Default,
            (_, _, true, false) => EvalResult::Allow,
            (_, _, false, true) => EvalResult::Deny,
            _ => EvalResult::Default,
        }
    }

    /// Decide `action`: test the policy at `url` (or just the global policy, if there is none) &
    /// summarise. A policy URL that can't be fetched or parsed refuses the action outright.
    pub async fn decide(
        &self,
        url: Option<&str>,
        ctx: &RequestContext,
        action: &str,
        overrides: Option<&HashMap<String, bool>>,
    ) -> bool {
        let result = match url {
            Some(url) if !url.is_empty() => match self.test_with_url(url, ctx, action).await {
                Ok(result) => result,
                Err(err) => {
                    warn!("Refusing {action}; the policy at {url} is unavailable: {err}");
                    return false;
                }
            },
            _ => self.test_with_global(ctx, action),
        };
        let decision = self.summarise(&[result], action, overrides);
        debug!("{action}: {result:?} => {decision}");
        decision
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use chrono::Utc;
    use serde_json::json;
    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use crate::{
        cache::MemoryCache, client::make_client, memory::MemoryBackend, metrics::Instruments,
    };

    fn engine_with(global: Policy) -> PolicyEngine {
        let client = make_client(
            "concurrent unit tests",
            Arc::new(Instruments::new("concurrent-test")),
        )
        .unwrap();
        PolicyEngine::new(
            global,
            "ours.example",
            "ccs1ours",
            Arc::new(MemoryCache::new()),
            Arc::new(Peers::new(
                client,
                Arc::new(MemoryBackend::new()),
                "cc-test",
                HashMap::new(),
            )),
        )
    }

    fn engine() -> PolicyEngine {
        engine_with(DEFAULT_GLOBAL_POLICY.parse().unwrap())
    }

    fn requester(ccid: &str, domain: &str, tag: &str) -> Entity {
        Entity {
            ccid: ccid.to_owned(),
            domain: domain.to_owned(),
            tag: tag.to_owned(),
            alias: None,
            cdate: Utc::now(),
        }
    }

    fn expr(value: serde_json::Value) -> Expr {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn operators() {
        let engine = engine();
        let ctx = RequestContext {
            requester: Some(requester("con1alice", "ours.example", "_admin,friend")),
            document: json!({"signer": "con1alice", "body": {"tags": ["a", "b"]}}),
            this: json!({"author": "con1alice", "domainOwned": false}),
            ..Default::default()
        };
        let eval = |v| engine.eval(&expr(v), &ctx);
        assert_eq!(
            eval(json!({"op": "Eq", "args": [{"op": "LoadSelf", "const": "author"},
                                             {"op": "RequesterID"}]})),
            Ok(json!(true))
        );
        assert_eq!(
            eval(json!({"op": "Contains", "args": [{"op": "LoadDocument", "const": "body.tags"},
                                                   {"op": "Const", "const": "b"}]})),
            Ok(json!(true))
        );
        assert_eq!(
            eval(json!({"op": "Contains", "args": [{"op": "Const", "const": "timeline"},
                                                   {"op": "Const", "const": "line"}]})),
            Ok(json!(true))
        );
        assert_eq!(
            eval(json!({"op": "And", "args": [{"op": "IsRequesterLocalUser"},
                                              {"op": "RequesterHasTag", "const": "friend"}]})),
            Ok(json!(true))
        );
        // Or short-circuits before reaching the bad argument
        assert_eq!(
            eval(json!({"op": "Or", "args": [{"op": "Const", "const": true},
                                             {"op": "Bogus"}]})),
            Ok(json!(true))
        );
        assert_eq!(
            eval(json!({"op": "IsCCID", "args": [{"op": "Const", "const": "con1alice"}]})),
            Ok(json!(false))
        );
        assert_eq!(eval(json!({"op": "DomainCSID"})), Ok(json!("ccs1ours")));
        assert!(matches!(
            eval(json!({"op": "LoadSelf", "const": "nope.nada"})),
            Err(EvalError::Missing { .. })
        ));
        assert!(matches!(
            eval(json!({"op": "And", "args": [{"op": "Const", "const": 1}]})),
            Err(EvalError::Type { .. })
        ));
        assert!(matches!(
            eval(json!({"op": "Frobnicate"})),
            Err(EvalError::UnknownOp { .. })
        ));
    }

    #[test]
    fn statements() {
        let engine = engine();
        let policy: Policy = serde_json::from_value(json!({
            "statements": {
                "message.*": {"condition": {"op": "Const", "const": false}},
                "message.read.*": {"condition": {"op": "Const", "const": true}},
                "dom": {"dominant": true, "condition": {"op": "Const", "const": false}},
                "dot": {"defaultOnTrue": true, "condition": {"op": "Const", "const": true}},
                "num": {"condition": {"op": "Const", "const": 3}}
            }
        }))
        .unwrap();
        let ctx = RequestContext::default();
        assert_eq!(
            engine.test_single(&policy, &ctx, "message.read.all"),
            EvalResult::Allow
        );
        assert_eq!(
            engine.test_single(&policy, &ctx, "message.write"),
            EvalResult::Deny
        );
        assert_eq!(engine.test_single(&policy, &ctx, "dom"), EvalResult::Never);
        assert_eq!(engine.test_single(&policy, &ctx, "dot"), EvalResult::Default);
        assert_eq!(engine.test_single(&policy, &ctx, "num"), EvalResult::Error);
        assert_eq!(
            engine.test_single(&policy, &ctx, "other"),
            EvalResult::Default
        );
    }

    #[test]
    fn global_blocks_win() {
        let engine = engine();
        let lenient: Policy = serde_json::from_value(json!({
            "statements": {"global": {"condition": {"op": "Const", "const": true}}}
        }))
        .unwrap();
        let blocked = RequestContext {
            requester: Some(requester("con1bad", "ours.example", "_block")),
            ..Default::default()
        };
        assert_eq!(
            engine.test(&lenient, &blocked, "global"),
            EvalResult::Never
        );
        assert!(!engine.summarise(&[engine.test(&lenient, &blocked, "global")], "global", None));

        let fine = RequestContext {
            requester: Some(requester("con1good", "ours.example", "")),
            ..Default::default()
        };
        assert_eq!(engine.test(&lenient, &fine, "global"), EvalResult::Allow);
        assert_eq!(
            engine.test(&Policy::default(), &fine, "global"),
            EvalResult::Default
        );
    }

    #[test]
    fn summaries() {
        let engine = engine();
        use EvalResult::*;
        assert!(engine.summarise(&[Deny, Always, Deny], "x", None));
        assert!(!engine.summarise(&[Allow, Never], "x", None));
        assert!(!engine.summarise(&[Allow, Deny], "x", None));
        assert!(engine.summarise(&[Deny, Allow, Default], "x", None));
        // association.attach defaults to true in the global policy
        assert!(engine.summarise(&[Allow, Error], "association.attach", None));
        let overrides = HashMap::from([("association.attach".to_owned(), false)]);
        assert!(!engine.summarise(&[Allow, Error], "association.attach", Some(&overrides)));
        assert!(!engine.summarise(&[], "x", None));

        assert_eq!(engine.accumulate_or(&[Always, Never], "x", None), Default);
        assert_eq!(engine.accumulate_or(&[Always, Deny], "x", None), Always);
        assert_eq!(engine.accumulate_or(&[Allow, Deny], "x", None), Default);
        assert_eq!(engine.accumulate_or(&[Error], "x", None), Deny);
        assert_eq!(
            engine.accumulate_or(&[Error], "association.attach", None),
            Allow
        );
        assert_eq!(engine.accumulate_or(&[], "x", None), Default);
    }

    #[tokio::test]
    async fn policies_by_url() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/policies/no-blocked.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "statements": {
                    "timeline.distribute": {
                        "condition": {"op": "Not", "args": [
                            {"op": "RequesterHasTag", "const": "_block"}
                        ]}
                    }
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let engine = engine();
        let url = format!("{}/policies/no-blocked.json", server.uri());
        let this = json!({"author": "con1owner", "domainOwned": true});
        let blocked = RequestContext {
            requester: Some(requester("con1bad", "ours.example", "_block")),
            this: this.clone(),
            ..Default::default()
        };
        let fine = RequestContext {
            requester: Some(requester("con1good", "ours.example", "")),
            this,
            ..Default::default()
        };
        assert!(
            !engine
                .decide(Some(&url), &blocked, "timeline.distribute", None)
                .await
        );
        assert!(
            engine
                .decide(Some(&url), &fine, "timeline.distribute", None)
                .await
        );

        // a timeline policy that can't be had refuses everyone, whatever the global verdict
        let missing = format!("{}/policies/missing.json", server.uri());
        assert!(engine
            .test_with_url(&missing, &blocked, "timeline.distribute")
            .await
            .is_err());
        assert!(
            !engine
                .decide(Some(&missing), &blocked, "timeline.distribute", None)
                .await
        );
        let permissive = HashMap::from([("timeline.distribute".to_owned(), true)]);
        assert!(
            !engine
                .decide(
                    Some(&missing),
                    &blocked,
                    "timeline.distribute",
                    Some(&permissive)
                )
                .await
        );
        assert!(
            !engine
                .decide(Some(&missing), &fine, "timeline.distribute", None)
                .await
        );
    }
}
