//! Application-layer protocol negotiation.
//!
//! rustls's own ALPN resolution walks the *server's* configured list
//! looking for a client match (server preference), not the client's offer
//! order — the opposite of the determinism law this crate implements ("the
//! negotiated protocol is the first `p ∈ C` such that `p ∈ S`"). `tls`
//! calls [`select_alpn_protocol_from_offers`] directly against the raw
//! `ClientHello` (via `rustls::server::Acceptor`) and rebuilds the
//! per-connection `ServerConfig` around the result, rather than delegating
//! to rustls's own (server-preference) selection. These functions are also
//! exposed standalone so the law is unit-testable without a live handshake.

/// Parses an RFC 7301 offer list (`<len:u8><bytes[len]>`*) into protocol
/// identifiers. Returns `None` if a length byte exceeds the remaining bytes
/// — malformed offers fail negotiation silently.
pub fn parse_offer_list(offers: &[u8]) -> Option<Vec<&[u8]>> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < offers.len() {
        let len = offers[i] as usize;
        i += 1;
        if offers.len() - i < len {
            return None;
        }
        out.push(&offers[i..i + len]);
        i += len;
    }
    Some(out)
}

/// Server ALPN callback logic: iterate the client offers in order, and for
/// each do a linear scan of the server's list, returning on the first
/// match. The server list is only scanned for membership (not iterated as
/// the outer loop) because it is short and the check is cheap either way;
/// the outer loop over client offers is what makes the result deterministic
/// and client-preference-respecting per the ALPN determinism law in
/// the rule that the negotiated protocol is the first `p ∈ C` such that
/// `p ∈ S`").
///
/// Returns `None` for "no match" (`NO-ACK`) or a malformed offer list
/// (not a socket error, just a
/// negotiation miss).
pub fn select_alpn_protocol<'a>(server_list: &[&[u8]], client_offers: &'a [u8]) -> Option<&'a [u8]> {
    let offers = parse_offer_list(client_offers)?;
    select_alpn_protocol_from_offers(server_list, offers)
}

/// Same selection law as [`select_alpn_protocol`], over an already-decoded
/// sequence of offers (e.g. `rustls::server::ClientHello::alpn()`) instead
/// of a raw RFC 7301 wire buffer — used directly against the live
/// `ClientHello` so the handshake path negotiates by this rule rather than
/// rustls's own server-preference default.
pub fn select_alpn_protocol_from_offers<'a>(
    server_list: &[&[u8]],
    client_offers: impl IntoIterator<Item = &'a [u8]>,
) -> Option<&'a [u8]> {
    for offer in client_offers {
        for candidate in server_list {
            if offer == *candidate {
                return Some(offer);
            }
        }
    }
    None
}

/// Builds the pre-formatted NPN advertise wire buffer (same
/// length-prefixed shape as the ALPN offer list). NPN has no modern TLS
/// library hook to register this against (rustls, like current OpenSSL,
/// never implements the server side of NPN) — this function exists so the
/// wire format is available and tested, consistent with framing
/// NPN purely as a legacy fallback whose advertise buffer is "served
/// unchanged".
pub fn npn_advertise_buffer(protocols: &[&[u8]]) -> Vec<u8> {
    let mut buf = Vec::new();
    for p in protocols {
        debug_assert!(p.len() <= u8::MAX as usize);
        buf.push(p.len() as u8);
        buf.extend_from_slice(p);
    }
    buf
}
