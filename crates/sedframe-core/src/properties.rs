//! Session-manager Properties exchange.
//!
//! Properties is the first method traffic on a ComID: the host announces
//! its limits as named parameters and the TPer answers its own. Only the
//! ComPacket sizing properties matter to the engine; everything else is
//! preserved in [`TperProperties::raw`].

use std::sync::Arc;

use sedframe_proto::uid::sm;

use crate::{
    debug::TestContext,
    error::Result,
    method::{self, MethodCall, RawResult},
    session::{DEFAULT_MAX_COMPACKET, Session},
    transport::SharedTransport,
};

/// Property name: maximum ComPacket size.
pub const PROP_MAX_COMPACKET_SIZE: u64 = 0;
/// Property name: maximum Packet size.
pub const PROP_MAX_PACKET_SIZE: u64 = 1;
/// Property name: maximum indivisible token size.
pub const PROP_MAX_IND_TOKEN_SIZE: u64 = 2;
/// Property name: maximum methods per ComPacket.
pub const PROP_MAX_METHODS: u64 = 3;

/// TPer limits learned from a Properties exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TperProperties {
    /// Largest ComPacket the TPer accepts
    pub max_compacket_size: u64,
    /// Largest Packet the TPer accepts
    pub max_packet_size: u64,
    /// Largest single token the TPer accepts
    pub max_ind_token_size: u64,
    /// Methods the TPer processes per ComPacket
    pub max_methods: u64,
    /// Every property the TPer reported, in response order
    pub raw_properties: Vec<(u64, u64)>,
    /// Raw bytes of the exchange
    pub raw: RawResult,
}

/// Exchange Properties on `com_id`, announcing the engine's default host
/// limits.
pub fn exchange_properties(
    transport: &SharedTransport,
    com_id: u16,
) -> Result<TperProperties> {
    exchange_properties_with(transport, com_id, &TestContext::global())
}

/// [`exchange_properties`] against an explicit test context.
pub fn exchange_properties_with(
    transport: &SharedTransport,
    com_id: u16,
    ctx: &Arc<TestContext>,
) -> Result<TperProperties> {
    let mut session = Session::with_context(Arc::clone(transport), com_id, Arc::clone(ctx));

    let mut call = MethodCall::new(sm::SMUID, sm::PROPERTIES);
    call.named_uint(PROP_MAX_COMPACKET_SIZE, DEFAULT_MAX_COMPACKET as u64);

    let result = method::invoke(&mut session, &call)?;
    let values = result.named_values()?;

    let mut props = TperProperties {
        max_compacket_size: DEFAULT_MAX_COMPACKET as u64,
        max_packet_size: 0,
        max_ind_token_size: 0,
        max_methods: 1,
        raw_properties: Vec::new(),
        raw: result.raw.clone(),
    };
    for (name, value) in values {
        let Some(v) = value.as_uint() else { continue };
        match name {
            PROP_MAX_COMPACKET_SIZE => props.max_compacket_size = v,
            PROP_MAX_PACKET_SIZE => props.max_packet_size = v,
            PROP_MAX_IND_TOKEN_SIZE => props.max_ind_token_size = v,
            PROP_MAX_METHODS => props.max_methods = v,
            _ => {},
        }
        props.raw_properties.push((name, v));
    }
    tracing::debug!(
        max_compacket = props.max_compacket_size,
        max_packet = props.max_packet_size,
        "properties exchanged"
    );
    Ok(props)
}
