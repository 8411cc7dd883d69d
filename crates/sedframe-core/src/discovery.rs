//! Level 0 Discovery runner.
//!
//! Issues the discovery IF-RECV on protocol 0x01, ComID 0x0001, applies the
//! `AfterDiscovery` fault point to the raw buffer, then parses it. The
//! parsed result honors the `inject_serial` config override so evaluation
//! rigs can pin a serial regardless of what the drive reports.

use std::sync::Arc;

use sedframe_proto::{DiscoveryInfo, discovery};

use crate::{
    debug::{FaultPoint, TestContext, config_key, counter},
    error::Result,
    transport::{DISCOVERY_COM_ID, PROTOCOL_TCG, Transport},
};

/// Buffer size offered for a discovery response.
const DISCOVERY_RECV_LEN: usize = 2048;

/// Raw Level 0 Discovery bytes, after any `AfterDiscovery` fault.
pub fn discovery0_raw(transport: &dyn Transport) -> Result<Vec<u8>> {
    discovery0_raw_with(transport, &TestContext::global())
}

/// [`discovery0_raw`] against an explicit test context.
pub fn discovery0_raw_with(transport: &dyn Transport, ctx: &Arc<TestContext>) -> Result<Vec<u8>> {
    let mut buf = transport.if_recv(PROTOCOL_TCG, DISCOVERY_COM_ID, DISCOVERY_RECV_LEN)?;
    ctx.bump(counter::TRANSPORT_RECV);
    ctx.observe(FaultPoint::AfterDiscovery, &mut buf)?;
    Ok(buf)
}

/// Parsed Level 0 Discovery.
pub fn discovery0(transport: &dyn Transport) -> Result<DiscoveryInfo> {
    discovery0_with(transport, &TestContext::global())
}

/// [`discovery0`] against an explicit test context.
pub fn discovery0_with(
    transport: &dyn Transport,
    ctx: &Arc<TestContext>,
) -> Result<DiscoveryInfo> {
    let raw = discovery0_raw_with(transport, ctx)?;
    let mut info = discovery::parse(&raw)?;
    if ctx.is_enabled()
        && let Some(serial) = ctx.config_str(config_key::INJECT_SERIAL, None)
    {
        info.serial = Some(serial);
    }
    tracing::debug!(
        ssc = ?info.primary_ssc,
        com_id = format!("{:#06x}", info.base_com_id),
        locking = info.locking_present,
        "discovery complete"
    );
    Ok(info)
}

/// Discovery with caller-chosen protocol id and ComID, for negative tests
/// (e.g. the intentionally invalid protocol 0x05). Returns the raw response
/// without parsing.
pub fn discovery0_custom(
    transport: &dyn Transport,
    protocol_id: u8,
    com_id: u16,
) -> Result<Vec<u8>> {
    let buf = transport.if_recv(protocol_id, com_id, DISCOVERY_RECV_LEN)?;
    TestContext::global().bump(counter::TRANSPORT_RECV);
    Ok(buf)
}
