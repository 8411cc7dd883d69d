//! Software TPer: an in-memory drive answering the TCG method layer.
//!
//! `FakeTper` implements [`Transport`] and speaks enough of the protocol
//! for end-to-end engine tests without hardware: Level 0 Discovery,
//! Properties, StartSession/SyncSession, Authenticate, Get/Set on the
//! C_PIN, Authority, Locking and LockingInfo tables, Activate, GenKey,
//! Erase and Revert. Every IF-SEND is parsed with the same wire-format
//! crate the engine uses, so a frame the emulator accepts is a frame a
//! drive would parse.
//!
//! State lives behind one mutex; responses are queued per ComID and
//! calling thread, which preserves the strict request/response pairing the
//! engine relies on even when many sessions share one ComID.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Mutex, MutexGuard, PoisonError},
    thread::{self, ThreadId},
};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use sedframe_core::{
    SedError,
    error::Result,
    transport::{DISCOVERY_COM_ID, PROTOCOL_TCG, Transport},
};
use sedframe_proto::{
    MethodStatus, Token, Uid,
    compacket::{self, FrameParams},
    token::{self, TokenWriter},
    uid::{auth, col, cpin, locking, method as method_uid, param, sm, sp},
};

use crate::fixtures::DiscoveryFixture;

/// Knobs for shaping the emulated drive.
#[derive(Debug, Clone)]
pub struct FakeTperConfig {
    /// Discovery response the drive advertises
    pub fixture: DiscoveryFixture,
    /// Factory MSID credential
    pub msid: Vec<u8>,
    /// Drive-printed PSID credential
    pub psid: Vec<u8>,
    /// MaxRanges reported by the LockingInfo table
    pub max_ranges: u64,
    /// Answer SP_BUSY to this many method calls before behaving
    pub busy_method_calls: u32,
    /// Report outstanding data (empty payload) on this many IF-RECVs
    pub stall_recvs: u32,
    /// MaxComPacketSize announced in Properties
    pub max_compacket_size: u64,
    /// Whether the Locking SP starts out activated
    pub locking_activated: bool,
}

impl Default for FakeTperConfig {
    fn default() -> Self {
        Self {
            fixture: DiscoveryFixture::default(),
            msid: b"MSID-FACTORY-0000".to_vec(),
            psid: b"PSID-REC0VERY-KEY".to_vec(),
            max_ranges: 8,
            busy_method_calls: 0,
            stall_recvs: 0,
            max_compacket_size: 2048,
            locking_activated: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct RangeState {
    start: u64,
    length: u64,
    read_lock_enabled: bool,
    write_lock_enabled: bool,
    read_locked: bool,
    write_locked: bool,
    genkey_count: u32,
}

#[derive(Debug)]
struct TperSession {
    sp: Uid,
    write: bool,
    authenticated: HashSet<Uid>,
}

struct State {
    config: FakeTperConfig,
    pins: HashMap<Uid, Vec<u8>>,
    ranges: HashMap<u32, RangeState>,
    users_enabled: HashSet<u32>,
    locking_activated: bool,
    sessions: HashMap<(u32, u32), TperSession>,
    next_tsn: u32,
    // Responses are queued per (ComID, calling thread): the engine issues
    // each trusted send/receive pair from one thread, so this models a
    // transport that serializes the pair per caller and keeps concurrent
    // sessions from stealing each other's responses.
    pending: HashMap<(u16, ThreadId), VecDeque<Vec<u8>>>,
    busy_left: u32,
    stall_left: u32,
}

impl State {
    fn new(config: FakeTperConfig) -> Self {
        let mut pins = HashMap::new();
        pins.insert(cpin::MSID, config.msid.clone());
        pins.insert(cpin::SID, config.msid.clone());
        pins.insert(psid_cpin(), config.psid.clone());
        let locking_activated = config.locking_activated
            || config.fixture.ssc == sedframe_proto::SscKind::Enterprise;
        if locking_activated {
            pins.insert(cpin::ADMIN1, config.msid.clone());
        }
        Self {
            busy_left: config.busy_method_calls,
            stall_left: config.stall_recvs,
            locking_activated,
            config,
            pins,
            ranges: HashMap::new(),
            users_enabled: HashSet::new(),
            sessions: HashMap::new(),
            next_tsn: 0x0001_0000,
            pending: HashMap::new(),
        }
    }

    fn factory_reset(&mut self) {
        let config = self.config.clone();
        *self = Self::new(FakeTperConfig { locking_activated: false, ..config });
    }
}

/// The C_PIN row backing the PSID authority (not externally addressable on
/// a real drive, used here as the credential store key).
fn psid_cpin() -> Uid {
    Uid(0x0000_000B_0001_FF01)
}

fn cpin_for_authority(authority: Uid) -> Option<Uid> {
    if authority == auth::SID {
        return Some(cpin::SID);
    }
    if authority == auth::PSID {
        return Some(psid_cpin());
    }
    let hi = authority.0 >> 16;
    let n = (authority.0 & 0xFFFF) as u32;
    if hi == 0x0000_0009_0001 {
        return Some(cpin::admin(n));
    }
    if hi == 0x0000_0009_0003 {
        return Some(cpin::user(n));
    }
    None
}

fn range_id(object: Uid) -> Option<u32> {
    if object == locking::GLOBAL_RANGE {
        return Some(0);
    }
    if object.0 >> 16 == 0x0000_0802_0003 {
        return Some((object.0 & 0xFFFF) as u32);
    }
    None
}

fn key_uid(range: u32) -> Uid {
    Uid(0x0000_0806_0003_0000 + u64::from(range))
}

fn key_range(object: Uid) -> Option<u32> {
    if object.0 >> 16 == 0x0000_0806_0003 {
        Some((object.0 & 0xFFFF) as u32)
    } else {
        None
    }
}

/// Top-level items of a token stream: each atom, list or named group as
/// one slice.
fn split_items(tokens: &[Token]) -> Vec<&[Token]> {
    let mut items = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, t) in tokens.iter().enumerate() {
        match t {
            Token::StartList | Token::StartName => {
                if depth == 0 {
                    start = i;
                }
                depth += 1;
            },
            Token::EndList | Token::EndName => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    items.push(&tokens[start..=i]);
                }
            },
            _ => {
                if depth == 0 {
                    items.push(&tokens[i..=i]);
                }
            },
        }
    }
    items
}

/// A parsed inbound method call.
struct CallFrame {
    invoking: Uid,
    method: Uid,
    args: Vec<Token>,
}

fn parse_call(tokens: &[Token]) -> Option<CallFrame> {
    let items = split_items(tokens);
    if items.len() < 5 || items[0] != [Token::Call] {
        return None;
    }
    let invoking = Uid::from_token(items[1].first()?)?;
    let method = Uid::from_token(items[2].first()?)?;
    let args_list = items[3];
    if args_list.first() != Some(&Token::StartList) {
        return None;
    }
    let args = args_list[1..args_list.len() - 1].to_vec();
    if items[4] != [Token::EndOfData] {
        return None;
    }
    Some(CallFrame { invoking, method, args })
}

/// A named item's (name, value tokens), if the item is a named group.
fn as_named(item: &[Token]) -> Option<(u64, &[Token])> {
    if item.first() != Some(&Token::StartName) || item.len() < 4 {
        return None;
    }
    let name = item[1].as_uint()?;
    Some((name, &item[2..item.len() - 1]))
}

fn named_lookup<'a>(args: &'a [Token], name: u64) -> Option<&'a [Token]> {
    split_items(args).into_iter().find_map(|item| {
        let (n, v) = as_named(item)?;
        (n == name).then_some(v)
    })
}

fn positional(args: &[Token], idx: usize) -> Option<&Token> {
    split_items(args)
        .into_iter()
        .filter(|item| as_named(item).is_none())
        .nth(idx)
        .and_then(<[Token]>::first)
}

/// In-memory drive implementing [`Transport`].
pub struct FakeTper {
    state: Mutex<State>,
}

impl FakeTper {
    /// Build a drive from explicit config.
    #[must_use]
    pub fn new(config: FakeTperConfig) -> Self {
        Self { state: Mutex::new(State::new(config)) }
    }

    /// An Opal 2.0 drive with default credentials at ComID 0x07FE.
    #[must_use]
    pub fn opal20() -> Self {
        Self::new(FakeTperConfig::default())
    }

    /// A drive with seed-derived MSID and PSID, for deterministic but
    /// distinct fixtures across scenario runs.
    #[must_use]
    pub fn with_seed(seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let msid = (0..16).map(|_| rng.gen_range(b'A'..=b'Z')).collect();
        let psid = (0..16).map(|_| rng.gen_range(b'0'..=b'9')).collect();
        Self::new(FakeTperConfig { msid, psid, ..FakeTperConfig::default() })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The factory MSID credential, as a test convenience.
    #[must_use]
    pub fn msid(&self) -> Vec<u8> {
        self.lock().config.msid.clone()
    }

    /// The drive-printed PSID credential.
    #[must_use]
    pub fn psid(&self) -> Vec<u8> {
        self.lock().config.psid.clone()
    }

    /// Current SID PIN (changes after take-ownership).
    #[must_use]
    pub fn sid_pin(&self) -> Option<Vec<u8>> {
        self.lock().pins.get(&cpin::SID).cloned()
    }

    /// Number of live sessions the drive tracks.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Whether the Locking SP has been activated.
    #[must_use]
    pub fn locking_activated(&self) -> bool {
        self.lock().locking_activated
    }

    /// GenKey invocations observed for a range's media key.
    #[must_use]
    pub fn genkey_count(&self, range: u32) -> u32 {
        self.lock().ranges.get(&range).map_or(0, |r| r.genkey_count)
    }

    /// Whether Locking SP user `n` has been enabled.
    #[must_use]
    pub fn user_enabled(&self, n: u32) -> bool {
        self.lock().users_enabled.contains(&n)
    }

    // ── Response builders ───────────────────────────────────

    fn respond(state: &mut State, com_id: u16, tsn: u32, hsn: u32, payload: &[u8]) {
        let params = FrameParams { com_id, tsn, hsn, seq_number: 0 };
        let frame = compacket::wrap(&params, payload);
        state.pending.entry((com_id, thread::current().id())).or_default().push_back(frame);
    }

    fn method_response(results: &[Token], status: MethodStatus) -> Vec<u8> {
        let mut w = TokenWriter::new();
        w.start_list();
        for t in results {
            w.token(t);
        }
        w.end_list().end_of_data().start_list().uint(status as u64).uint(0).uint(0).end_list();
        w.finish().unwrap_or_default()
    }

    fn sm_response(method: Uid, results: &[Token], status: MethodStatus) -> Vec<u8> {
        let mut w = TokenWriter::new();
        w.call().bytes(&sm::SMUID.to_bytes()).bytes(&method.to_bytes()).start_list();
        for t in results {
            w.token(t);
        }
        w.end_list().end_of_data().start_list().uint(status as u64).uint(0).uint(0).end_list();
        w.finish().unwrap_or_default()
    }

    // ── Method handlers ─────────────────────────────────────

    fn handle_properties(state: &mut State, com_id: u16) {
        let max = state.config.max_compacket_size;
        let results = vec![
            Token::StartName,
            Token::Uint(0),
            Token::Uint(max),
            Token::EndName,
            Token::StartName,
            Token::Uint(1),
            Token::Uint(max.saturating_sub(20)),
            Token::EndName,
            Token::StartName,
            Token::Uint(2),
            Token::Uint(1024),
            Token::EndName,
            Token::StartName,
            Token::Uint(3),
            Token::Uint(1),
            Token::EndName,
        ];
        let payload = Self::sm_response(sm::PROPERTIES, &results, MethodStatus::Success);
        Self::respond(state, com_id, 0, 0, &payload);
    }

    fn handle_start_session(state: &mut State, com_id: u16, call: &CallFrame) {
        let hsn = positional(&call.args, 0).and_then(Token::as_uint);
        let sp_uid = positional(&call.args, 1).and_then(Uid::from_token);
        let write = positional(&call.args, 2).and_then(Token::as_uint).unwrap_or(0) != 0;

        let (Some(hsn), Some(sp_uid)) = (hsn, sp_uid) else {
            let payload =
                Self::sm_response(sm::SYNC_SESSION, &[], MethodStatus::InvalidParameter);
            Self::respond(state, com_id, 0, 0, &payload);
            return;
        };
        let hsn = hsn as u32;

        if sp_uid == sp::LOCKING && !state.locking_activated {
            let payload = Self::sm_response(sm::SYNC_SESSION, &[], MethodStatus::Fail);
            Self::respond(state, com_id, 0, 0, &payload);
            return;
        }

        let mut authenticated = HashSet::new();
        // Credentials may be proven inline via HostChallenge + signing
        // authority, the one-round form some hosts prefer.
        if let Some(authority_tokens) = named_lookup(&call.args, param::HOST_SIGNING_AUTHORITY)
            && let Some(authority) = authority_tokens.first().and_then(Uid::from_token)
        {
            let challenge = named_lookup(&call.args, param::HOST_CHALLENGE)
                .and_then(|v| v.first())
                .and_then(Token::as_bytes);
            let ok = cpin_for_authority(authority)
                .and_then(|c| state.pins.get(&c))
                .is_some_and(|pin| challenge == Some(pin.as_slice()));
            if !ok {
                let payload =
                    Self::sm_response(sm::SYNC_SESSION, &[], MethodStatus::NotAuthorized);
                Self::respond(state, com_id, 0, 0, &payload);
                return;
            }
            authenticated.insert(authority);
        }

        let tsn = state.next_tsn;
        state.next_tsn += 1;
        state
            .sessions
            .insert((tsn, hsn), TperSession { sp: sp_uid, write, authenticated });
        tracing::debug!(hsn, tsn, sp = %sp_uid, "tper: session open");

        let results = vec![Token::Uint(u64::from(hsn)), Token::Uint(u64::from(tsn))];
        let payload = Self::sm_response(sm::SYNC_SESSION, &results, MethodStatus::Success);
        Self::respond(state, com_id, 0, 0, &payload);
    }

    fn handle_authenticate(
        state: &mut State,
        ids: (u32, u32),
        call: &CallFrame,
    ) -> (Vec<Token>, MethodStatus) {
        let authority = positional(&call.args, 0).and_then(Uid::from_token);
        let challenge = named_lookup(&call.args, param::CHALLENGE)
            .and_then(|v| v.first())
            .and_then(Token::as_bytes)
            .map(<[u8]>::to_vec);

        let (Some(authority), Some(challenge)) = (authority, challenge) else {
            return (vec![], MethodStatus::InvalidParameter);
        };

        // User authorities must be enabled before they can authenticate
        if authority.0 >> 16 == 0x0000_0009_0003 {
            let n = (authority.0 & 0xFFFF) as u32;
            if !state.users_enabled.contains(&n) {
                return (vec![], MethodStatus::NotAuthorized);
            }
        }

        let expected =
            cpin_for_authority(authority).and_then(|c| state.pins.get(&c)).cloned();
        let ok = expected.is_some_and(|pin| pin == challenge);
        if !ok {
            return (vec![], MethodStatus::NotAuthorized);
        }
        if let Some(session) = state.sessions.get_mut(&ids) {
            session.authenticated.insert(authority);
        }
        (vec![Token::Uint(1)], MethodStatus::Success)
    }

    fn authorized(state: &State, ids: (u32, u32), any_of: &[Uid]) -> bool {
        state
            .sessions
            .get(&ids)
            .is_some_and(|s| any_of.iter().any(|a| s.authenticated.contains(a)))
    }

    fn session_sp(state: &State, ids: (u32, u32)) -> Option<Uid> {
        state.sessions.get(&ids).map(|s| s.sp)
    }

    fn any_authenticated(state: &State, ids: (u32, u32)) -> bool {
        state.sessions.get(&ids).is_some_and(|s| !s.authenticated.is_empty())
    }

    fn writable(state: &State, ids: (u32, u32)) -> bool {
        state.sessions.get(&ids).is_some_and(|s| s.write)
    }

    fn range_columns(range: &RangeState) -> Vec<(u64, Token)> {
        vec![
            (col::RANGE_START, Token::Uint(range.start)),
            (col::RANGE_LENGTH, Token::Uint(range.length)),
            (col::READ_LOCK_ENABLED, Token::Uint(u64::from(range.read_lock_enabled))),
            (col::WRITE_LOCK_ENABLED, Token::Uint(u64::from(range.write_lock_enabled))),
            (col::READ_LOCKED, Token::Uint(u64::from(range.read_locked))),
            (col::WRITE_LOCKED, Token::Uint(u64::from(range.write_locked))),
        ]
    }

    fn handle_get(
        state: &mut State,
        ids: (u32, u32),
        call: &CallFrame,
    ) -> (Vec<Token>, MethodStatus) {
        let cellblock = split_items(&call.args)
            .into_iter()
            .find(|item| item.first() == Some(&Token::StartList))
            .map(|item| item[1..item.len() - 1].to_vec())
            .unwrap_or_default();
        let first = named_lookup(&cellblock, param::START_COLUMN)
            .and_then(|v| v.first())
            .and_then(Token::as_uint)
            .unwrap_or(0);
        let last = named_lookup(&cellblock, param::END_COLUMN)
            .and_then(|v| v.first())
            .and_then(Token::as_uint)
            .unwrap_or(u64::MAX);

        let object = call.invoking;
        let mut columns: Vec<(u64, Token)> = Vec::new();

        if object == cpin::MSID {
            columns.push((col::CPIN_PIN, Token::Bytes(state.config.msid.clone())));
        } else if object.0 >> 32 == 0x0000_000B {
            if !Self::authorized(state, ids, &[auth::SID, auth::ADMIN1]) {
                return (vec![], MethodStatus::NotAuthorized);
            }
            match state.pins.get(&object) {
                Some(pin) => columns.push((col::CPIN_PIN, Token::Bytes(pin.clone()))),
                None => return (vec![], MethodStatus::InvalidParameter),
            }
        } else if object == locking::INFO {
            columns.push((col::MAX_RANGES, Token::Uint(state.config.max_ranges)));
        } else if let Some(n) = range_id(object) {
            // Range rows live in the Locking SP
            if Self::session_sp(state, ids) != Some(sp::LOCKING) {
                return (vec![], MethodStatus::InvalidParameter);
            }
            if !Self::any_authenticated(state, ids) {
                return (vec![], MethodStatus::NotAuthorized);
            }
            let range = state.ranges.entry(n).or_default();
            columns = Self::range_columns(range);
            columns.push((col::ACTIVE_KEY, Token::Bytes(key_uid(n).to_bytes().to_vec())));
        } else if object == sp::ADMIN || object == sp::LOCKING {
            let lifecycle = if object == sp::ADMIN || state.locking_activated { 9 } else { 8 };
            columns.push((col::SP_LIFECYCLE, Token::Uint(lifecycle)));
        } else {
            return (vec![], MethodStatus::InvalidParameter);
        }

        let mut results = vec![Token::StartList];
        for (c, v) in columns {
            if c >= first && c <= last {
                results.push(Token::StartName);
                results.push(Token::Uint(c));
                results.push(v);
                results.push(Token::EndName);
            }
        }
        results.push(Token::EndList);
        (results, MethodStatus::Success)
    }

    fn handle_set(
        state: &mut State,
        ids: (u32, u32),
        call: &CallFrame,
    ) -> (Vec<Token>, MethodStatus) {
        if !Self::writable(state, ids) {
            return (vec![], MethodStatus::NotAuthorized);
        }
        let Some(values_list) = named_lookup(&call.args, param::VALUES) else {
            return (vec![], MethodStatus::InvalidParameter);
        };
        let inner = if values_list.first() == Some(&Token::StartList) {
            &values_list[1..values_list.len() - 1]
        } else {
            values_list
        };
        let mut values: Vec<(u64, Token)> = Vec::new();
        for item in split_items(inner) {
            let Some((name, v)) = as_named(item) else {
                return (vec![], MethodStatus::InvalidParameter);
            };
            let Some(value) = v.first().cloned() else {
                return (vec![], MethodStatus::InvalidParameter);
            };
            values.push((name, value));
        }

        let object = call.invoking;

        // C_PIN rows
        if object.0 >> 32 == 0x0000_000B {
            let allowed = if object == cpin::SID {
                Self::authorized(state, ids, &[auth::SID])
            } else {
                Self::authorized(state, ids, &[auth::SID, auth::ADMIN1])
            };
            if !allowed {
                return (vec![], MethodStatus::NotAuthorized);
            }
            for (c, v) in values {
                if c == col::CPIN_PIN
                    && let Some(pin) = v.as_bytes()
                {
                    state.pins.insert(object, pin.to_vec());
                }
            }
            return (vec![], MethodStatus::Success);
        }

        // Authority rows (user enablement)
        if object.0 >> 32 == 0x0000_0009 {
            if !Self::authorized(state, ids, &[auth::ADMIN1, auth::SID]) {
                return (vec![], MethodStatus::NotAuthorized);
            }
            let n = (object.0 & 0xFFFF) as u32;
            for (c, v) in values {
                if c == col::AUTHORITY_ENABLED && v.as_uint() == Some(1) {
                    state.users_enabled.insert(n);
                    let msid = state.config.msid.clone();
                    state.pins.entry(cpin::user(n)).or_insert(msid);
                }
            }
            return (vec![], MethodStatus::Success);
        }

        // Locking ranges
        if let Some(n) = range_id(object) {
            if Self::session_sp(state, ids) != Some(sp::LOCKING) {
                return (vec![], MethodStatus::InvalidParameter);
            }
            if !Self::any_authenticated(state, ids) {
                return (vec![], MethodStatus::NotAuthorized);
            }
            if u64::from(n) > state.config.max_ranges {
                return (vec![], MethodStatus::InvalidParameter);
            }
            let range = state.ranges.entry(n).or_default();
            for (c, v) in values {
                let Some(value) = v.as_uint() else {
                    return (vec![], MethodStatus::InvalidParameter);
                };
                match c {
                    col::RANGE_START => range.start = value,
                    col::RANGE_LENGTH => range.length = value,
                    col::READ_LOCK_ENABLED => range.read_lock_enabled = value != 0,
                    col::WRITE_LOCK_ENABLED => range.write_lock_enabled = value != 0,
                    col::READ_LOCKED => range.read_locked = value != 0,
                    col::WRITE_LOCKED => range.write_locked = value != 0,
                    _ => return (vec![], MethodStatus::InvalidParameter),
                }
            }
            return (vec![], MethodStatus::Success);
        }

        (vec![], MethodStatus::InvalidParameter)
    }

    fn handle_method(state: &mut State, ids: (u32, u32), call: &CallFrame) -> Vec<u8> {
        let (results, status) = if call.method == method_uid::AUTHENTICATE {
            Self::handle_authenticate(state, ids, call)
        } else if call.method == method_uid::GET {
            Self::handle_get(state, ids, call)
        } else if call.method == method_uid::SET {
            Self::handle_set(state, ids, call)
        } else if call.method == method_uid::ACTIVATE {
            if !Self::authorized(state, ids, &[auth::SID]) {
                (vec![], MethodStatus::NotAuthorized)
            } else {
                state.locking_activated = true;
                let msid = state.config.msid.clone();
                state.pins.entry(cpin::ADMIN1).or_insert(msid);
                (vec![], MethodStatus::Success)
            }
        } else if call.method == method_uid::GENKEY {
            match key_range(call.invoking) {
                Some(n) if Self::authorized(state, ids, &[auth::ADMIN1]) => {
                    state.ranges.entry(n).or_default().genkey_count += 1;
                    (vec![], MethodStatus::Success)
                },
                Some(_) => (vec![], MethodStatus::NotAuthorized),
                None => (vec![], MethodStatus::InvalidParameter),
            }
        } else if call.method == method_uid::ERASE {
            match range_id(call.invoking) {
                Some(n) if Self::authorized(state, ids, &[auth::ADMIN1]) => {
                    let range = state.ranges.entry(n).or_default();
                    range.read_locked = false;
                    range.write_locked = false;
                    range.genkey_count += 1;
                    (vec![], MethodStatus::Success)
                },
                Some(_) => (vec![], MethodStatus::NotAuthorized),
                None => (vec![], MethodStatus::InvalidParameter),
            }
        } else if call.method == method_uid::REVERT {
            if Self::authorized(state, ids, &[auth::SID, auth::PSID]) {
                state.factory_reset();
                (vec![], MethodStatus::Success)
            } else {
                (vec![], MethodStatus::NotAuthorized)
            }
        } else {
            (vec![], MethodStatus::InvalidParameter)
        };
        Self::method_response(&results, status)
    }
}

impl Transport for FakeTper {
    fn if_send(&self, protocol_id: u8, com_id: u16, payload: &[u8]) -> Result<()> {
        if protocol_id != PROTOCOL_TCG {
            return Err(SedError::Transport {
                reason: format!("unsupported security protocol {protocol_id:#04x}"),
            });
        }

        let mut state = self.lock();
        let unwrapped = compacket::unwrap(payload).map_err(|e| SedError::Transport {
            reason: format!("tper rejected frame: {e}"),
        })?;
        let tokens = token::decode(&unwrapped.payload).map_err(|e| SedError::Transport {
            reason: format!("tper rejected tokens: {e}"),
        })?;

        // EndOfSession is a bare token, not a method call
        if tokens.first() == Some(&Token::EndOfSession) {
            state.sessions.remove(&(unwrapped.tsn, unwrapped.hsn));
            tracing::debug!(tsn = unwrapped.tsn, hsn = unwrapped.hsn, "tper: session closed");
            return Ok(());
        }

        let Some(call) = parse_call(&tokens) else {
            return Err(SedError::Transport { reason: "tper: not a method call".to_string() });
        };

        if state.busy_left > 0 {
            state.busy_left -= 1;
            let payload = if call.invoking == sm::SMUID {
                Self::sm_response(sm::SYNC_SESSION, &[], MethodStatus::SpBusy)
            } else {
                Self::method_response(&[], MethodStatus::SpBusy)
            };
            Self::respond(&mut state, com_id, unwrapped.tsn, unwrapped.hsn, &payload);
            return Ok(());
        }

        if call.invoking == sm::SMUID {
            if call.method == sm::PROPERTIES {
                Self::handle_properties(&mut state, com_id);
            } else if call.method == sm::START_SESSION {
                Self::handle_start_session(&mut state, com_id, &call);
            } else {
                let payload =
                    Self::sm_response(call.method, &[], MethodStatus::InvalidParameter);
                Self::respond(&mut state, com_id, 0, 0, &payload);
            }
            return Ok(());
        }

        let ids = (unwrapped.tsn, unwrapped.hsn);
        if !state.sessions.contains_key(&ids) {
            return Err(SedError::Transport {
                reason: format!("tper: no session {ids:?}"),
            });
        }
        let response = Self::handle_method(&mut state, ids, &call);
        Self::respond(&mut state, com_id, ids.0, ids.1, &response);
        Ok(())
    }

    fn if_recv(&self, protocol_id: u8, com_id: u16, max_len: usize) -> Result<Vec<u8>> {
        let mut state = self.lock();

        if protocol_id != PROTOCOL_TCG {
            return Err(SedError::Transport {
                reason: format!("unsupported security protocol {protocol_id:#04x}"),
            });
        }

        if com_id == DISCOVERY_COM_ID {
            let mut blob = state.config.fixture.build();
            blob.truncate(max_len);
            return Ok(blob);
        }

        if state.stall_left > 0 {
            state.stall_left -= 1;
            // ComPacket header with outstanding-data set and no payload:
            // tells the host to poll again.
            let mut header = vec![0u8; 20];
            header[4..6].copy_from_slice(&com_id.to_be_bytes());
            header[8..12].copy_from_slice(&512u32.to_be_bytes());
            return Ok(header);
        }

        let slot = (com_id, thread::current().id());
        match state.pending.get_mut(&slot).and_then(VecDeque::pop_front) {
            Some(frame) => Ok(frame),
            None => {
                // Nothing queued: an empty ComPacket with no outstanding
                // data, which the engine reports as ComPacketEmpty.
                let mut header = vec![0u8; 20];
                header[4..6].copy_from_slice(&com_id.to_be_bytes());
                Ok(header)
            },
        }
    }

    fn is_open(&self) -> bool {
        true
    }
}

impl std::fmt::Debug for FakeTper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("FakeTper")
            .field("ssc", &state.config.fixture.ssc)
            .field("sessions", &state.sessions.len())
            .field("locking_activated", &state.locking_activated)
            .finish()
    }
}
