//! Method invocation: CALL construction, dispatch, result parsing.
//!
//! A method call on the wire is:
//!
//! ```text
//! Call, InvokingUID (8 B), MethodUID (8 B),
//! StartList, args..., EndList,
//! EndOfData,
//! StartList, 0, 0, 0, EndList
//! ```
//!
//! and a response mirrors it: an optional `Call SMUID <method>` prefix (the
//! session manager answers with its own method), the result list, then
//! `EndOfData` and a three-integer status list whose first integer is the
//! [`MethodStatus`].

use std::{sync::Arc, thread, time::Duration};

use bytes::Bytes;
use sedframe_proto::{
    MethodStatus, Token, Uid,
    token::{self, TokenWriter},
};

use crate::{
    debug::{FaultPoint, config_key, counter, workaround},
    error::{Result, SedError},
    exchange,
    session::Session,
};

/// Default retry budget for the SP_BUSY workaround.
pub const DEFAULT_MAX_RETRIES: i64 = 3;

/// Initial backoff between SP_BUSY retries.
const RETRY_BACKOFF_INITIAL: Duration = Duration::from_millis(50);

/// Backoff ceiling between SP_BUSY retries.
const RETRY_BACKOFF_MAX: Duration = Duration::from_millis(500);

/// A method invocation under construction.
///
/// Arguments are accumulated as tokens; positional and named arguments may
/// be mixed, named ones encoding as `StartName, name, value, EndName`.
#[derive(Debug, Clone)]
pub struct MethodCall {
    invoking: Uid,
    method: Uid,
    args: Vec<Token>,
}

impl MethodCall {
    /// Start building a call of `method` on `invoking`.
    #[must_use]
    pub fn new(invoking: Uid, method: Uid) -> Self {
        Self { invoking, method, args: Vec::new() }
    }

    /// Invoking object UID.
    #[must_use]
    pub fn invoking(&self) -> Uid {
        self.invoking
    }

    /// Method UID.
    #[must_use]
    pub fn method(&self) -> Uid {
        self.method
    }

    /// Positional unsigned integer argument.
    pub fn uint(&mut self, v: u64) -> &mut Self {
        self.args.push(Token::Uint(v));
        self
    }

    /// Positional boolean argument (encoded as 0/1).
    pub fn boolean(&mut self, v: bool) -> &mut Self {
        self.uint(u64::from(v))
    }

    /// Positional byte-sequence argument.
    pub fn bytes(&mut self, b: &[u8]) -> &mut Self {
        self.args.push(Token::Bytes(b.to_vec()));
        self
    }

    /// Positional UID argument (8-byte byte sequence).
    pub fn uid(&mut self, uid: Uid) -> &mut Self {
        self.bytes(&uid.to_bytes())
    }

    /// Named unsigned integer argument.
    pub fn named_uint(&mut self, name: u64, v: u64) -> &mut Self {
        self.named(name, Token::Uint(v))
    }

    /// Named byte-sequence argument.
    pub fn named_bytes(&mut self, name: u64, b: &[u8]) -> &mut Self {
        self.named(name, Token::Bytes(b.to_vec()))
    }

    /// Named UID argument.
    pub fn named_uid(&mut self, name: u64, uid: Uid) -> &mut Self {
        self.named(name, Token::Bytes(uid.to_bytes().to_vec()))
    }

    /// Named argument with an arbitrary value token.
    pub fn named(&mut self, name: u64, value: Token) -> &mut Self {
        self.args.push(Token::StartName);
        self.args.push(Token::Uint(name));
        self.args.push(value);
        self.args.push(Token::EndName);
        self
    }

    /// Open a nested list argument; pair with [`MethodCall::end_list`].
    pub fn begin_list(&mut self) -> &mut Self {
        self.args.push(Token::StartList);
        self
    }

    /// Close a nested list argument.
    pub fn end_list(&mut self) -> &mut Self {
        self.args.push(Token::EndList);
        self
    }

    /// Open a named group; pair with [`MethodCall::end_name`].
    pub fn begin_name(&mut self, name: u64) -> &mut Self {
        self.args.push(Token::StartName);
        self.args.push(Token::Uint(name));
        self
    }

    /// Close a named group.
    pub fn end_name(&mut self) -> &mut Self {
        self.args.push(Token::EndName);
        self
    }

    /// Push an arbitrary argument token.
    pub fn raw(&mut self, t: Token) -> &mut Self {
        self.args.push(t);
        self
    }

    /// Encode the full invocation token stream.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut w = TokenWriter::new();
        w.call().bytes(&self.invoking.to_bytes()).bytes(&self.method.to_bytes()).start_list();
        for t in &self.args {
            w.token(t);
        }
        w.end_list().end_of_data().start_list().uint(0).uint(0).uint(0).end_list();
        w.finish().map_err(SedError::from)
    }
}

/// Raw bytes and outcome of one request/response round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResult {
    /// ComPacket as sent (after padding and any send-side faults)
    pub sent: Bytes,
    /// ComPacket as received (after any receive-side faults)
    pub received: Bytes,
    /// Method status of the round, when one was parsed
    pub status: Option<MethodStatus>,
    /// Error that ended the round, when it failed past the transport
    pub error: Option<SedError>,
}

impl RawResult {
    /// An empty record for rounds that never reached the wire.
    #[must_use]
    pub fn empty() -> Self {
        Self { sent: Bytes::new(), received: Bytes::new(), status: None, error: None }
    }
}

/// Outcome of a method invocation.
#[derive(Debug, Clone)]
pub struct MethodResult {
    /// Terminal status reported by the TPer
    pub status: MethodStatus,
    /// Tokens of the result list (outer list delimiters stripped)
    pub results: Vec<Token>,
    /// Raw bytes of the round that produced this result
    pub raw: RawResult,
}

impl MethodResult {
    /// Number of top-level items in the result list, where a nested list or
    /// named group counts as one item.
    #[must_use]
    pub fn arg_count(&self) -> usize {
        count_top_level(&self.results)
    }

    /// Enforce an expected out-parameter count.
    pub fn expect_args(&self, expected: usize) -> Result<&Self> {
        let actual = self.arg_count();
        if actual == expected { Ok(self) } else {
            Err(SedError::MethodResultShape { expected, actual })
        }
    }

    /// First token of the `idx`-th top-level item.
    #[must_use]
    pub fn arg(&self, idx: usize) -> Option<&Token> {
        let mut depth = 0usize;
        let mut seen = 0usize;
        for t in &self.results {
            match t {
                Token::StartList | Token::StartName => {
                    if depth == 0 {
                        if seen == idx {
                            return Some(t);
                        }
                        seen += 1;
                    }
                    depth += 1;
                },
                Token::EndList | Token::EndName => depth = depth.saturating_sub(1),
                _ if depth == 0 => {
                    if seen == idx {
                        return Some(t);
                    }
                    seen += 1;
                },
                _ => {},
            }
        }
        None
    }

    /// The `idx`-th item as an unsigned integer.
    pub fn arg_uint(&self, idx: usize) -> Result<u64> {
        self.arg(idx)
            .and_then(Token::as_uint)
            .ok_or(SedError::MethodMalformed { reason: "expected unsigned integer result" })
    }

    /// The `idx`-th item as a byte sequence.
    pub fn arg_bytes(&self, idx: usize) -> Result<&[u8]> {
        self.arg(idx)
            .and_then(Token::as_bytes)
            .ok_or(SedError::MethodMalformed { reason: "expected byte sequence result" })
    }

    /// Interpret the result list as `StartName name value EndName` pairs,
    /// as `Get` responses are shaped. A single enclosing list is stripped.
    pub fn named_values(&self) -> Result<Vec<(u64, Token)>> {
        parse_named_values(&self.results)
    }
}

/// Invoke a method, mapping any non-success status to
/// [`SedError::MethodStatus`].
pub fn invoke(session: &mut Session, call: &MethodCall) -> Result<MethodResult> {
    let result = invoke_any_status(session, call)?;
    if result.status.is_success() {
        Ok(result)
    } else {
        Err(SedError::MethodStatus(result.status))
    }
}

/// Invoke a method and return whatever status the TPer answered.
///
/// Transport, framing and codec failures still error; only the method
/// status is left to the caller. When the `retry_on_sp_busy` workaround is
/// active, SP_BUSY rounds are retried up to `max_retries` times with
/// exponential backoff before the busy status is surfaced.
pub fn invoke_any_status(session: &mut Session, call: &MethodCall) -> Result<MethodResult> {
    session.ensure_usable()?;
    let ctx = Arc::clone(session.context());
    let retry_busy = ctx.workaround_active(workaround::RETRY_ON_SP_BUSY);
    let max_retries = ctx
        .config_i64(config_key::MAX_RETRIES, None)
        .unwrap_or(DEFAULT_MAX_RETRIES)
        .max(0);
    let mut backoff = RETRY_BACKOFF_INITIAL;
    let mut attempt: i64 = 0;

    loop {
        let mut payload = call.encode()?;
        ctx.observe(FaultPoint::BeforeBuildMethod, &mut payload)?;

        let (resp, mut raw) = exchange::round_trip(session, &payload)?;
        let tokens = token::decode(&resp).map_err(SedError::from)?;
        let (status, results) = parse_response(&tokens)?;
        raw.status = Some(status);

        // The AfterRecvMethod observer may overwrite the parsed status
        // (e.g. injecting SP_BUSY), or short-circuit with any other error.
        let mut observed_buf = resp;
        let status = match ctx.observe(FaultPoint::AfterRecvMethod, &mut observed_buf) {
            Ok(()) => status,
            Err(SedError::MethodStatus(injected)) => injected,
            Err(e) => {
                raw.error = Some(e.clone());
                return Err(e);
            },
        };

        if status == MethodStatus::SpBusy && retry_busy && attempt < max_retries {
            attempt += 1;
            ctx.bump(counter::METHOD_RETRY);
            tracing::debug!(attempt, max_retries, "SP busy, retrying method");
            thread::sleep(backoff);
            backoff = (backoff * 2).min(RETRY_BACKOFF_MAX);
            continue;
        }

        raw.status = Some(status);
        return Ok(MethodResult { status, results, raw });
    }
}

/// Split a response token stream into status and result tokens.
fn parse_response(tokens: &[Token]) -> Result<(MethodStatus, Vec<Token>)> {
    // Session-manager responses arrive as a method call of their own:
    // Call SMUID <method> [...]. Skip the prefix.
    let body = if tokens.first() == Some(&Token::Call) {
        if tokens.len() < 3
            || !tokens[1].is_byte_sequence()
            || !tokens[2].is_byte_sequence()
        {
            return Err(SedError::MethodMalformed { reason: "truncated call prefix" });
        }
        &tokens[3..]
    } else {
        &tokens[..]
    };

    let eod = body
        .iter()
        .position(|t| *t == Token::EndOfData)
        .ok_or(SedError::MethodMalformed { reason: "missing end of data" })?;

    let tail = &body[eod + 1..];
    let ok_shape = tail.len() == 5
        && tail[0] == Token::StartList
        && tail[4] == Token::EndList
        && tail[1..4].iter().all(|t| matches!(t, Token::Uint(_)));
    if !ok_shape {
        return Err(SedError::MethodMalformed { reason: "bad status list shape" });
    }
    let status_token = &tail[1];
    let status = status_token
        .as_uint()
        .and_then(|v| u8::try_from(v).ok())
        .and_then(MethodStatus::from_u8)
        .ok_or(SedError::MethodMalformed { reason: "unknown status code" })?;

    let list = &body[..eod];
    let results = strip_outer_list(list)
        .ok_or(SedError::MethodMalformed { reason: "results are not a list" })?;
    Ok((status, results.to_vec()))
}

/// If `tokens` is exactly one balanced list, return its contents.
fn strip_outer_list(tokens: &[Token]) -> Option<&[Token]> {
    if tokens.first() != Some(&Token::StartList) || tokens.last() != Some(&Token::EndList) {
        return None;
    }
    let mut depth = 0usize;
    for (i, t) in tokens.iter().enumerate() {
        match t {
            Token::StartList | Token::StartName => depth += 1,
            Token::EndList | Token::EndName => {
                depth = depth.checked_sub(1)?;
                if depth == 0 && i != tokens.len() - 1 {
                    return None;
                }
            },
            _ => {},
        }
    }
    if depth != 0 {
        return None;
    }
    Some(&tokens[1..tokens.len() - 1])
}

fn count_top_level(tokens: &[Token]) -> usize {
    let mut depth = 0usize;
    let mut items = 0usize;
    for t in tokens {
        match t {
            Token::StartList | Token::StartName => {
                if depth == 0 {
                    items += 1;
                }
                depth += 1;
            },
            Token::EndList | Token::EndName => depth = depth.saturating_sub(1),
            _ => {
                if depth == 0 {
                    items += 1;
                }
            },
        }
    }
    items
}

/// Parse `StartName name value EndName` pairs, stripping one enclosing
/// list if present.
pub(crate) fn parse_named_values(tokens: &[Token]) -> Result<Vec<(u64, Token)>> {
    let body = strip_outer_list(tokens).unwrap_or(tokens);
    let mut out = Vec::new();
    let mut it = body.iter();
    while let Some(t) = it.next() {
        if *t != Token::StartName {
            return Err(SedError::MethodMalformed { reason: "expected named value" });
        }
        let name = it
            .next()
            .and_then(Token::as_uint)
            .ok_or(SedError::MethodMalformed { reason: "named value has no integer name" })?;
        let value = it
            .next()
            .filter(|v| matches!(v, Token::Uint(_) | Token::Int(_) | Token::Bytes(_)))
            .ok_or(SedError::MethodMalformed { reason: "named value has no atom value" })?
            .clone();
        if it.next() != Some(&Token::EndName) {
            return Err(SedError::MethodMalformed { reason: "unterminated named value" });
        }
        out.push((name, value));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use sedframe_proto::uid::{method, sm};

    use super::*;

    #[test]
    fn call_encoding_matches_wire_shape() {
        let mut call = MethodCall::new(sm::SMUID, sm::PROPERTIES);
        call.named_uint(0, 2048);
        let buf = call.encode().unwrap();
        assert_eq!(&buf[0..3], &[0xF8, 0xA8, 0x00]);

        let tokens = token::decode(&buf).unwrap();
        assert_eq!(tokens[0], Token::Call);
        assert_eq!(tokens[3], Token::StartList);
        assert_eq!(*tokens.last().unwrap(), Token::EndList);
        assert!(tokens.contains(&Token::EndOfData));
    }

    fn response(results: &[Token], status: u64) -> Vec<Token> {
        let mut t = vec![Token::StartList];
        t.extend_from_slice(results);
        t.extend_from_slice(&[
            Token::EndList,
            Token::EndOfData,
            Token::StartList,
            Token::Uint(status),
            Token::Uint(0),
            Token::Uint(0),
            Token::EndList,
        ]);
        t
    }

    #[test]
    fn parse_success_response() {
        let tokens = response(&[Token::Uint(7), Token::Uint(0x1000)], 0);
        let (status, results) = parse_response(&tokens).unwrap();
        assert_eq!(status, MethodStatus::Success);
        assert_eq!(results, vec![Token::Uint(7), Token::Uint(0x1000)]);
    }

    #[test]
    fn parse_session_manager_response() {
        let mut tokens = vec![
            Token::Call,
            Token::Bytes(sm::SMUID.to_bytes().to_vec()),
            Token::Bytes(sm::SYNC_SESSION.to_bytes().to_vec()),
        ];
        tokens.extend(response(&[Token::Uint(4097), Token::Uint(4098)], 0));
        let (status, results) = parse_response(&tokens).unwrap();
        assert!(status.is_success());
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn parse_rejects_missing_end_of_data() {
        let tokens = vec![Token::StartList, Token::Uint(0), Token::EndList];
        assert!(matches!(
            parse_response(&tokens),
            Err(SedError::MethodMalformed { reason: "missing end of data" })
        ));
    }

    #[test]
    fn parse_rejects_bad_status_list() {
        let mut tokens = response(&[], 0);
        tokens.pop(); // drop the closing EndList of the status list
        assert!(matches!(
            parse_response(&tokens),
            Err(SedError::MethodMalformed { reason: "bad status list shape" })
        ));
    }

    #[test]
    fn parse_rejects_unknown_status() {
        let tokens = response(&[], 0x2A);
        assert!(matches!(
            parse_response(&tokens),
            Err(SedError::MethodMalformed { reason: "unknown status code" })
        ));
    }

    #[test]
    fn arg_counting_groups_nested_structures() {
        let result = MethodResult {
            status: MethodStatus::Success,
            results: vec![
                Token::Uint(1),
                Token::StartName,
                Token::Uint(3),
                Token::Uint(9),
                Token::EndName,
                Token::StartList,
                Token::Uint(4),
                Token::Uint(5),
                Token::EndList,
            ],
            raw: RawResult::empty(),
        };
        assert_eq!(result.arg_count(), 3);
        assert!(result.expect_args(3).is_ok());
        assert!(matches!(
            result.expect_args(2),
            Err(SedError::MethodResultShape { expected: 2, actual: 3 })
        ));
        assert_eq!(result.arg_uint(0).unwrap(), 1);
        assert_eq!(result.arg(1), Some(&Token::StartName));
    }

    #[test]
    fn named_values_round() {
        let result = MethodResult {
            status: MethodStatus::Success,
            results: vec![
                Token::StartList,
                Token::StartName,
                Token::Uint(3),
                Token::Uint(0),
                Token::EndName,
                Token::StartName,
                Token::Uint(10),
                Token::Bytes(vec![0xAA; 8]),
                Token::EndName,
                Token::EndList,
            ],
            raw: RawResult::empty(),
        };
        let vals = result.named_values().unwrap();
        assert_eq!(vals.len(), 2);
        assert_eq!(vals[0], (3, Token::Uint(0)));
        assert_eq!(vals[1].0, 10);
    }

    #[test]
    fn method_uids_are_distinct() {
        assert_ne!(method::GET, method::SET);
        assert_ne!(method::REVERT, method::ACTIVATE);
    }
}
