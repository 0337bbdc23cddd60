//! Condition DSL: a small prefix expression language deciding whether a
//! recharge strategy applies to a user.
//!
//! Grammar: `Expr := BoolLit | Ident "(" ArgList? ")"` where arguments
//! are string literals, integer literals, or nested expressions. Arity
//! and argument types are checked at parse time; an unknown function is
//! a parse error, which the strategy layer treats as a permanent
//! failure.
//!
//! Evaluation is pure except `quota-le`, which reads the user's gateway
//! quota total through an injected [`QuotaProbe`]; probe failures map to
//! `EvalError` for that user only.
//!
//! # Example
//!
//! ```
//! use tally_strategy::condition::parse_condition;
//!
//! let expr = parse_condition(
//!     r#"or(and(is-vip(2), github-star("zgsm")), belong-to("org001"))"#,
//! ).unwrap();
//! assert!(!expr.needs_quota());
//! ```

use chrono::NaiveDate;
use std::str::FromStr;

use tally_common::{TallyError, TallyResult, UserId, UserProfile};

/// Parsed condition expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    /// Matches every user. Also produced by an empty condition string.
    True,
    /// Matches the listed user ids.
    MatchUser(Vec<UserId>),
    /// Registration strictly before the given day (00:00 UTC).
    RegisterBefore(NaiveDate),
    /// Last access strictly after the given day (00:00 UTC).
    AccessAfter(NaiveDate),
    /// The user starred the repository.
    GithubStar(String),
    /// Gateway quota total at or below the literal.
    QuotaLe(i64),
    /// VIP rank at or above the literal.
    IsVip(u32),
    /// Company / organisation label equality.
    BelongTo(String),
    /// All sub-expressions hold.
    And(Vec<Expr>),
    /// Any sub-expression holds.
    Or(Vec<Expr>),
    /// The sub-expression does not hold.
    Not(Box<Expr>),
}

impl Expr {
    /// Whether evaluating this expression requires the gateway quota
    /// total. Lets the evaluator fetch it once, up front.
    pub fn needs_quota(&self) -> bool {
        match self {
            Expr::QuotaLe(_) => true,
            Expr::And(subs) | Expr::Or(subs) => subs.iter().any(Expr::needs_quota),
            Expr::Not(sub) => sub.needs_quota(),
            _ => false,
        }
    }

    /// Evaluate against a user with the pre-fetched quota total.
    fn eval_with(&self, user: &UserProfile, quota: Option<i64>) -> TallyResult<bool> {
        match self {
            Expr::True => Ok(true),
            Expr::MatchUser(ids) => Ok(ids.contains(&user.id)),
            Expr::RegisterBefore(date) => {
                let cutoff = date.and_hms_opt(0, 0, 0).expect("midnight").and_utc();
                Ok(user.registered_at < cutoff)
            }
            Expr::AccessAfter(date) => {
                let cutoff = date.and_hms_opt(0, 0, 0).expect("midnight").and_utc();
                Ok(user.last_access_at > cutoff)
            }
            Expr::GithubStar(repo) => Ok(user.has_starred(repo)),
            Expr::QuotaLe(limit) => {
                let quota = quota.ok_or_else(|| {
                    TallyError::EvalError("quota total was not fetched".to_string())
                })?;
                Ok(quota <= *limit)
            }
            Expr::IsVip(rank) => Ok(user.vip_level >= *rank),
            Expr::BelongTo(company) => Ok(&user.company == company),
            Expr::And(subs) => {
                for sub in subs {
                    if !sub.eval_with(user, quota)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Expr::Or(subs) => {
                for sub in subs {
                    if sub.eval_with(user, quota)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Expr::Not(sub) => Ok(!sub.eval_with(user, quota)?),
        }
    }
}

/// Capability to read a user's gateway quota total, injected into the
/// evaluator so `quota-le` stays testable.
#[trait_variant::make(QuotaProbe: Send)]
pub trait LocalQuotaProbe {
    /// Current quota total for the user.
    async fn quota_value(&self, user: UserId) -> TallyResult<i64>;
}

/// Evaluate a parsed condition against a user record.
pub async fn evaluate<P: QuotaProbe + Sync>(
    expr: &Expr,
    user: &UserProfile,
    probe: &P,
) -> TallyResult<bool> {
    let quota = if expr.needs_quota() {
        let value = probe
            .quota_value(user.id)
            .await
            .map_err(|e| TallyError::EvalError(format!("quota query failed: {e}")))?;
        Some(value)
    } else {
        None
    };
    expr.eval_with(user, quota)
}

/// Parse a condition string. Empty or blank input matches all users.
pub fn parse_condition(input: &str) -> TallyResult<Expr> {
    let input = input.trim();
    if input.is_empty() {
        return Ok(Expr::True);
    }
    let mut parser = Parser::new(input)?;
    let expr = parser.expr()?;
    parser.expect_end()?;
    Ok(expr)
}

// ─────────────────────────────────────────────────────────────────────────────
// Lexer
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    LParen,
    RParen,
    Comma,
}

fn lex(input: &str) -> TallyResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(pos, ch)) = chars.peek() {
        match ch {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '"' => {
                chars.next();
                let mut value = String::new();
                loop {
                    match chars.next() {
                        Some((_, '"')) => break,
                        Some((_, c)) => value.push(c),
                        None => {
                            return Err(TallyError::InvalidCondition(
                                "unterminated string literal".to_string(),
                            ));
                        }
                    }
                }
                tokens.push(Token::Str(value));
            }
            c if c.is_ascii_digit() => {
                let mut value = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    if c.is_ascii_digit() {
                        value.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let parsed = value.parse().map_err(|_| {
                    TallyError::InvalidCondition(format!("invalid integer literal: {value}"))
                })?;
                tokens.push(Token::Int(parsed));
            }
            c if c.is_ascii_alphabetic() => {
                let mut value = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                        value.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(value));
            }
            other => {
                return Err(TallyError::InvalidCondition(format!(
                    "unexpected character {other:?} at offset {pos}"
                )));
            }
        }
    }

    Ok(tokens)
}

// ─────────────────────────────────────────────────────────────────────────────
// Parser
// ─────────────────────────────────────────────────────────────────────────────

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(input: &str) -> TallyResult<Self> {
        Ok(Self {
            tokens: lex(input)?,
            pos: 0,
        })
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> TallyResult<Token> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| TallyError::InvalidCondition("unexpected end of input".to_string()))?;
        self.pos += 1;
        Ok(token)
    }

    fn expect(&mut self, expected: Token) -> TallyResult<()> {
        let token = self.next()?;
        if token == expected {
            Ok(())
        } else {
            Err(TallyError::InvalidCondition(format!(
                "expected {expected:?}, found {token:?}"
            )))
        }
    }

    fn expect_end(&self) -> TallyResult<()> {
        match self.peek() {
            None => Ok(()),
            Some(token) => Err(TallyError::InvalidCondition(format!(
                "trailing input after expression: {token:?}"
            ))),
        }
    }

    fn expr(&mut self) -> TallyResult<Expr> {
        let token = self.next()?;
        let name = match token {
            Token::Ident(name) => name,
            other => {
                return Err(TallyError::InvalidCondition(format!(
                    "expected function name or boolean, found {other:?}"
                )));
            }
        };

        // Bare boolean literals.
        if self.peek() != Some(&Token::LParen) {
            return match name.as_str() {
                "true" => Ok(Expr::True),
                "false" => Ok(Expr::Not(Box::new(Expr::True))),
                other => Err(TallyError::InvalidCondition(format!(
                    "expected call arguments after {other:?}"
                ))),
            };
        }

        self.expect(Token::LParen)?;
        let args = self.args()?;
        self.expect(Token::RParen)?;
        self.build(&name, args)
    }

    fn args(&mut self) -> TallyResult<Vec<Arg>> {
        let mut args = Vec::new();
        if self.peek() == Some(&Token::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.arg()?);
            match self.peek() {
                Some(Token::Comma) => {
                    self.pos += 1;
                }
                _ => break,
            }
        }
        Ok(args)
    }

    fn arg(&mut self) -> TallyResult<Arg> {
        match self.peek() {
            Some(Token::Str(_)) => match self.next()? {
                Token::Str(s) => Ok(Arg::Str(s)),
                _ => unreachable!(),
            },
            Some(Token::Int(_)) => match self.next()? {
                Token::Int(n) => Ok(Arg::Int(n)),
                _ => unreachable!(),
            },
            _ => Ok(Arg::Expr(self.expr()?)),
        }
    }

    fn build(&self, name: &str, args: Vec<Arg>) -> TallyResult<Expr> {
        match name {
            "true" => {
                arity(name, &args, 0)?;
                Ok(Expr::True)
            }
            "match-user" => {
                if args.is_empty() {
                    return Err(TallyError::InvalidCondition(
                        "match-user requires at least one user id".to_string(),
                    ));
                }
                let ids = args
                    .into_iter()
                    .map(|arg| {
                        let raw = arg.into_str(name)?;
                        UserId::from_str(&raw).map_err(|_| {
                            TallyError::InvalidCondition(format!("invalid user id: {raw}"))
                        })
                    })
                    .collect::<TallyResult<Vec<_>>>()?;
                Ok(Expr::MatchUser(ids))
            }
            "register-before" => Ok(Expr::RegisterBefore(one_date(name, args)?)),
            "access-after" => Ok(Expr::AccessAfter(one_date(name, args)?)),
            "github-star" => {
                arity(name, &args, 1)?;
                let [arg] = take(args);
                Ok(Expr::GithubStar(arg.into_str(name)?))
            }
            "quota-le" => {
                arity(name, &args, 1)?;
                let [arg] = take(args);
                Ok(Expr::QuotaLe(arg.into_int(name)?))
            }
            "is-vip" => {
                arity(name, &args, 1)?;
                let [arg] = take(args);
                let rank = arg.into_int(name)?;
                u32::try_from(rank).map(Expr::IsVip).map_err(|_| {
                    TallyError::InvalidCondition("is-vip rank must be non-negative".to_string())
                })
            }
            "belong-to" => {
                arity(name, &args, 1)?;
                let [arg] = take(args);
                Ok(Expr::BelongTo(arg.into_str(name)?))
            }
            "and" | "or" => {
                if args.len() < 2 {
                    return Err(TallyError::InvalidCondition(format!(
                        "{name} requires at least two arguments"
                    )));
                }
                let subs = args
                    .into_iter()
                    .map(|arg| arg.into_expr(name))
                    .collect::<TallyResult<Vec<_>>>()?;
                if name == "and" {
                    Ok(Expr::And(subs))
                } else {
                    Ok(Expr::Or(subs))
                }
            }
            "not" => {
                arity(name, &args, 1)?;
                let [arg] = take(args);
                Ok(Expr::Not(Box::new(arg.into_expr(name)?)))
            }
            unknown => Err(TallyError::InvalidCondition(format!(
                "unknown function: {unknown}"
            ))),
        }
    }
}

#[derive(Debug)]
enum Arg {
    Str(String),
    Int(i64),
    Expr(Expr),
}

impl Arg {
    fn into_str(self, func: &str) -> TallyResult<String> {
        match self {
            Arg::Str(s) => Ok(s),
            other => Err(TallyError::InvalidCondition(format!(
                "{func} expects a string argument, found {other:?}"
            ))),
        }
    }

    fn into_int(self, func: &str) -> TallyResult<i64> {
        match self {
            Arg::Int(n) => Ok(n),
            other => Err(TallyError::InvalidCondition(format!(
                "{func} expects an integer argument, found {other:?}"
            ))),
        }
    }

    fn into_expr(self, func: &str) -> TallyResult<Expr> {
        match self {
            Arg::Expr(e) => Ok(e),
            other => Err(TallyError::InvalidCondition(format!(
                "{func} expects a nested expression, found {other:?}"
            ))),
        }
    }
}

fn arity(func: &str, args: &[Arg], expected: usize) -> TallyResult<()> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(TallyError::InvalidCondition(format!(
            "{func} expects {expected} argument(s), found {}",
            args.len()
        )))
    }
}

fn take<const N: usize>(args: Vec<Arg>) -> [Arg; N] {
    args.try_into().expect("arity checked")
}

fn one_date(func: &str, args: Vec<Arg>) -> TallyResult<NaiveDate> {
    arity(func, &args, 1)?;
    let [arg] = take::<1>(args);
    let raw = arg.into_str(func)?;
    NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
        .map_err(|_| TallyError::InvalidCondition(format!("{func}: invalid date: {raw}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    struct FixedProbe(i64);

    impl QuotaProbe for FixedProbe {
        async fn quota_value(&self, _user: UserId) -> TallyResult<i64> {
            Ok(self.0)
        }
    }

    struct FailingProbe;

    impl QuotaProbe for FailingProbe {
        async fn quota_value(&self, _user: UserId) -> TallyResult<i64> {
            Err(TallyError::GatewayTransient("down".to_string()))
        }
    }

    fn vip_user() -> UserProfile {
        let mut user = UserProfile::bare(UserId::new());
        user.vip_level = 2;
        user.company = "org001".to_string();
        user.github_stars.insert("zgsm".to_string());
        user
    }

    #[test]
    fn test_empty_condition_matches_all() {
        assert_eq!(parse_condition("").unwrap(), Expr::True);
        assert_eq!(parse_condition("   ").unwrap(), Expr::True);
    }

    #[test]
    fn test_parse_nested_condition() {
        let expr = parse_condition(
            r#"or(and(is-vip(2), github-star("zgsm")), belong-to("org001"))"#,
        )
        .unwrap();
        assert_eq!(
            expr,
            Expr::Or(vec![
                Expr::And(vec![
                    Expr::IsVip(2),
                    Expr::GithubStar("zgsm".to_string())
                ]),
                Expr::BelongTo("org001".to_string()),
            ])
        );
    }

    #[test]
    fn test_unknown_function_is_parse_error() {
        let err = parse_condition("frobnicate(1)").unwrap_err();
        assert!(matches!(err, TallyError::InvalidCondition(_)));
        assert!(err.to_string().contains("unknown function"));
    }

    #[test]
    fn test_arity_checked_at_parse() {
        assert!(parse_condition("is-vip()").is_err());
        assert!(parse_condition(r#"github-star("a", "b")"#).is_err());
        assert!(parse_condition("not(true())").is_ok());
        assert!(parse_condition("and(true())").is_err());
    }

    #[test]
    fn test_argument_types_checked_at_parse() {
        assert!(parse_condition("is-vip(\"two\")").is_err());
        assert!(parse_condition("github-star(3)").is_err());
        assert!(parse_condition(r#"register-before("not-a-date")"#).is_err());
    }

    #[test]
    fn test_trailing_input_rejected() {
        assert!(parse_condition("true() true()").is_err());
    }

    #[tokio::test]
    async fn test_eval_vip_and_star() {
        let expr = parse_condition(
            r#"or(and(is-vip(2), github-star("zgsm")), belong-to("org999"))"#,
        )
        .unwrap();
        assert!(evaluate(&expr, &vip_user(), &FixedProbe(0)).await.unwrap());

        let mut plain = UserProfile::bare(UserId::new());
        plain.vip_level = 1;
        assert!(!evaluate(&expr, &plain, &FixedProbe(0)).await.unwrap());
    }

    #[tokio::test]
    async fn test_eval_match_user() {
        let user = vip_user();
        let expr =
            parse_condition(&format!(r#"match-user("{}")"#, user.id.as_uuid())).unwrap();
        assert!(evaluate(&expr, &user, &FixedProbe(0)).await.unwrap());
        assert!(!evaluate(&expr, &vip_user(), &FixedProbe(0)).await.unwrap());
    }

    #[tokio::test]
    async fn test_eval_dates() {
        let mut user = vip_user();
        user.registered_at = Utc::now() - Duration::days(400);
        user.last_access_at = Utc::now();

        let expr = parse_condition(
            r#"and(register-before("2030-01-01"), access-after("2020-01-01"))"#,
        )
        .unwrap();
        assert!(evaluate(&expr, &user, &FixedProbe(0)).await.unwrap());
    }

    #[tokio::test]
    async fn test_quota_le_uses_probe() {
        let expr = parse_condition("quota-le(100)").unwrap();
        assert!(expr.needs_quota());
        assert!(evaluate(&expr, &vip_user(), &FixedProbe(80)).await.unwrap());
        assert!(!evaluate(&expr, &vip_user(), &FixedProbe(150)).await.unwrap());
    }

    #[tokio::test]
    async fn test_probe_failure_is_eval_error() {
        let expr = parse_condition("quota-le(100)").unwrap();
        let err = evaluate(&expr, &vip_user(), &FailingProbe).await.unwrap_err();
        assert!(matches!(err, TallyError::EvalError(_)));
    }

    #[tokio::test]
    async fn test_pure_expr_skips_probe() {
        // A failing probe must not matter when quota-le is absent.
        let expr = parse_condition("is-vip(1)").unwrap();
        assert!(evaluate(&expr, &vip_user(), &FailingProbe).await.unwrap());
    }
}
