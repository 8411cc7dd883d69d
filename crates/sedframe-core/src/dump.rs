//! Token stream diagnostics: indented textual dump with UID annotation.
//!
//! Used by evaluation tooling to render captured method payloads. Eight-
//! byte byte sequences are printed as UIDs and annotated when they match a
//! well-known object.

use std::fmt::Write as _;

use sedframe_proto::{Token, Uid, uid};

/// Well-known label for a UID, if any.
#[must_use]
pub fn annotate_uid(u: Uid) -> Option<&'static str> {
    match u {
        uid::sm::SMUID => Some("SMUID"),
        uid::sp::THIS_SP => Some("THIS_SP"),
        uid::sp::ADMIN => Some("SP_ADMIN"),
        uid::sp::LOCKING => Some("SP_LOCKING"),
        uid::auth::SID => Some("AUTH_SID"),
        uid::auth::PSID => Some("AUTH_PSID"),
        uid::auth::ANYBODY => Some("AUTH_ANYBODY"),
        uid::cpin::MSID => Some("C_PIN_MSID"),
        uid::cpin::SID => Some("C_PIN_SID"),
        uid::locking::GLOBAL_RANGE => Some("LOCKING_GLOBAL_RANGE"),
        uid::sm::PROPERTIES => Some("PROPERTIES"),
        uid::sm::START_SESSION => Some("START_SESSION"),
        uid::sm::SYNC_SESSION => Some("SYNC_SESSION"),
        uid::method::GET => Some("GET"),
        uid::method::SET => Some("SET"),
        uid::method::AUTHENTICATE => Some("AUTHENTICATE"),
        u if u.0 >> 32 == 0x0000_000B => Some("C_PIN"),
        u if u.0 >> 32 == 0x0000_0802 => Some("LOCKING_RANGE"),
        _ => None,
    }
}

fn hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 3);
    for b in bytes {
        let _ = write!(s, "{b:02x} ");
    }
    s.trim_end().to_string()
}

/// Render a token stream as an indented dump, one token per line.
#[must_use]
pub fn format_tokens(tokens: &[Token]) -> String {
    let mut out = String::new();
    let mut depth = 0usize;
    for t in tokens {
        if matches!(t, Token::EndList | Token::EndName) {
            depth = depth.saturating_sub(1);
        }
        let indent = "  ".repeat(depth);
        match t {
            Token::StartList => {
                let _ = writeln!(out, "{indent}[");
            },
            Token::EndList => {
                let _ = writeln!(out, "{indent}]");
            },
            Token::StartName => {
                let _ = writeln!(out, "{indent}{{");
            },
            Token::EndName => {
                let _ = writeln!(out, "{indent}}}");
            },
            Token::Call => {
                let _ = writeln!(out, "{indent}CALL");
            },
            Token::EndOfData => {
                let _ = writeln!(out, "{indent}END_OF_DATA");
            },
            Token::EndOfSession => {
                let _ = writeln!(out, "{indent}END_OF_SESSION");
            },
            Token::StartTransaction => {
                let _ = writeln!(out, "{indent}START_TRANSACTION");
            },
            Token::EndTransaction => {
                let _ = writeln!(out, "{indent}END_TRANSACTION");
            },
            Token::Empty => {
                let _ = writeln!(out, "{indent}EMPTY");
            },
            Token::Uint(v) => {
                let _ = writeln!(out, "{indent}UINT: {v}");
            },
            Token::Int(v) => {
                let _ = writeln!(out, "{indent}INT: {v}");
            },
            Token::Bytes(b) if b.len() == 8 => {
                // Most 8-byte sequences in method traffic are UIDs
                let u = Uid::from_slice(b).unwrap_or(Uid(0));
                match annotate_uid(u) {
                    Some(label) => {
                        let _ = writeln!(out, "{indent}UID: {u} ({label})");
                    },
                    None => {
                        let _ = writeln!(out, "{indent}UID: {u}");
                    },
                }
            },
            Token::Bytes(b) => {
                let _ = writeln!(out, "{indent}BYTES[{}]: {}", b.len(), hex(b));
            },
        }
        if matches!(t, Token::StartList | Token::StartName) {
            depth += 1;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use sedframe_proto::uid::sm;

    use super::*;

    #[test]
    fn dump_indents_and_annotates() {
        let tokens = vec![
            Token::Call,
            Token::Bytes(sm::SMUID.to_bytes().to_vec()),
            Token::Bytes(sm::START_SESSION.to_bytes().to_vec()),
            Token::StartList,
            Token::Uint(4096),
            Token::Bytes(vec![0xDE, 0xAD]),
            Token::EndList,
            Token::EndOfData,
        ];
        let dump = format_tokens(&tokens);
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines[0], "CALL");
        assert!(lines[1].contains("(SMUID)"));
        assert!(lines[2].contains("(START_SESSION)"));
        assert_eq!(lines[3], "[");
        assert_eq!(lines[4], "  UINT: 4096");
        assert_eq!(lines[5], "  BYTES[2]: de ad");
        assert_eq!(lines[6], "]");
        assert_eq!(lines[7], "END_OF_DATA");
    }
}
