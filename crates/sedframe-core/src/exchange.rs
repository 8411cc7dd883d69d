//! Framing driver: one request/response round over a session's transport.
//!
//! Wraps an encoded token payload into a ComPacket, issues IF-SEND, then
//! polls IF-RECV until the TPer hands back a Data payload. The polling loop
//! is a deadline-bounded retry with exponential backoff (25 ms doubling up
//! to 1 s), re-issued whenever the TPer signals outstanding data or a
//! minimum transfer with an empty payload.
//!
//! Fault points `BeforeIfSend` / `AfterIfSend` / `BeforeIfRecv` /
//! `AfterIfRecv` interpose here, immediately around the transport calls.

use std::{sync::Arc, thread, time::{Duration, Instant}};

use bytes::Bytes;
use sedframe_proto::{ProtocolError, compacket};

use crate::{
    debug::{FaultPoint, counter},
    error::{Result, SedError},
    method::RawResult,
    session::Session,
    transport::{PROTOCOL_TCG, TRUSTED_BLOCK_SIZE},
};

/// Initial poll backoff when the TPer reports outstanding data.
const POLL_BACKOFF_INITIAL: Duration = Duration::from_millis(25);

/// Poll backoff ceiling.
const POLL_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Pad a trusted-command buffer to the device block granularity.
fn pad_to_block(buf: &mut Vec<u8>) {
    let len = buf.len().div_ceil(TRUSTED_BLOCK_SIZE) * TRUSTED_BLOCK_SIZE;
    buf.resize(len.max(TRUSTED_BLOCK_SIZE), 0);
}

/// Send `payload` framed for `session` and poll for the response payload.
///
/// A transport failure closes the session. A framing error in the response
/// fails the call but leaves the session open, except when the response
/// carries session numbers that do not match the session's, which indicates
/// a desync and is fatal.
pub(crate) fn round_trip(session: &mut Session, payload: &[u8]) -> Result<(Vec<u8>, RawResult)> {
    let transport = Arc::clone(session.transport());
    let ctx = Arc::clone(session.context());
    let com_id = session.com_id();

    let mut buf = compacket::wrap(&session.frame_params(), payload);
    pad_to_block(&mut buf);

    ctx.observe(FaultPoint::BeforeIfSend, &mut buf)?;
    let sent = Bytes::from(buf.clone());
    if let Err(e) = transport.if_send(PROTOCOL_TCG, com_id, &buf) {
        session.mark_fatal();
        return Err(e);
    }
    ctx.bump(counter::TRANSPORT_SEND);
    ctx.observe(FaultPoint::AfterIfSend, &mut buf)?;

    let started = Instant::now();
    let deadline = started + session.effective_timeout();
    let mut backoff = POLL_BACKOFF_INITIAL;

    loop {
        let mut scratch = Vec::new();
        ctx.observe(FaultPoint::BeforeIfRecv, &mut scratch)?;

        let mut resp = match transport.if_recv(PROTOCOL_TCG, com_id, session.max_compacket_size())
        {
            Ok(r) => r,
            Err(e) => {
                session.mark_fatal();
                return Err(e);
            },
        };
        ctx.bump(counter::TRANSPORT_RECV);
        ctx.observe(FaultPoint::AfterIfRecv, &mut resp)?;

        let unwrapped = compacket::unwrap(&resp)?;
        if unwrapped.needs_repoll() {
            tracing::trace!(
                outstanding = unwrapped.outstanding_data,
                min_transfer = unwrapped.min_transfer,
                backoff_ms = backoff.as_millis() as u64,
                "TPer has no data yet, re-polling"
            );
            if Instant::now() + backoff > deadline {
                return Err(SedError::Timeout {
                    elapsed_ms: started.elapsed().as_millis() as u64,
                });
            }
            thread::sleep(backoff);
            backoff = (backoff * 2).min(POLL_BACKOFF_MAX);
            continue;
        }

        if session.is_open()
            && (unwrapped.tsn != session.tsn() || unwrapped.hsn != session.hsn())
        {
            session.mark_fatal();
            return Err(SedError::Protocol(ProtocolError::ComPacketMalformed {
                reason: "response carries another session's numbers",
            }));
        }

        tracing::trace!(
            sent = sent.len(),
            received = resp.len(),
            payload = unwrapped.payload.len(),
            "exchange complete"
        );
        let raw = RawResult {
            sent,
            received: Bytes::from(resp),
            status: None,
            error: None,
        };
        return Ok((unwrapped.payload, raw));
    }
}

/// Send `payload` framed for `session` without awaiting a response body.
/// Used for the EndOfSession token, which the TPer does not answer with a
/// method response.
pub(crate) fn send_only(session: &mut Session, payload: &[u8]) -> Result<()> {
    let transport = Arc::clone(session.transport());
    let ctx = Arc::clone(session.context());
    let com_id = session.com_id();

    let mut buf = compacket::wrap(&session.frame_params(), payload);
    pad_to_block(&mut buf);

    ctx.observe(FaultPoint::BeforeIfSend, &mut buf)?;
    if let Err(e) = transport.if_send(PROTOCOL_TCG, com_id, &buf) {
        session.mark_fatal();
        return Err(e);
    }
    ctx.bump(counter::TRANSPORT_SEND);
    ctx.observe(FaultPoint::AfterIfSend, &mut buf)?;
    Ok(())
}
