//! EDNS0 and DNS-message helpers shared by both daemons.
//!
//! These functions manipulate the fiddly EDNS0 Client Subnet, RFC 8467
//! padding and TTL bits of a [`Message`]. Callers are assumed to have
//! checked that the message is a legitimate IN query before mutating it;
//! [`is_signed`] tells them when they must not (RFC 2845: a TSIG message
//! cannot be modified in any way except the ID without invalidating the
//! signature).
//!
//! The EDNS0 options of a message live in a single option map
//! ([`hickory_proto::op::Edns`]), so "at most one OPT is ever emitted" and
//! "removing a sub-option removes every occurrence" hold by construction.
//! Removing the last sub-option drops the whole EDNS section so a
//! downstream reader observes the plain "no OPT" case.

use std::net::IpAddr;

use hickory_proto::op::{Edns, Message};
use hickory_proto::rr::rdata::opt::{ClientSubnet, EdnsCode, EdnsOption};
use hickory_proto::rr::Record;

use crate::constants::MAXIMUM_VIABLE_DNS_MESSAGE;
use crate::error::{DnsError, DnsResult};

/// EDNS0 UDP payload size advertised when this code creates a fresh EDNS
/// section. Some resolvers (notably unbound) dislike a UDP size of zero.
const DEFAULT_EDNS_UDP_SIZE: u16 = 4096;

/// Record type code for TSIG (RFC 2845).
const TSIG_TYPE_CODE: u16 = 250;

/// Record type code for SIG, used by SIG(0) transaction signatures.
const SIG_TYPE_CODE: u16 = 24;

/// Return the ECS option in the message, if any.
pub fn find_ecs(msg: &Message) -> Option<ClientSubnet> {
    match msg.extensions().as_ref()?.option(EdnsCode::Subnet) {
        Some(EdnsOption::Subnet(subnet)) => Some(subnet.clone()),
        _ => None,
    }
}

/// Whether the message carries an ECS option.
pub fn has_ecs(msg: &Message) -> bool {
    find_ecs(msg).is_some()
}

/// Remove the EDNS0 sub-option with `code` from the message.
///
/// If the removal leaves the EDNS section without any sub-options the
/// whole section is dropped. Returns true if a sub-option was removed.
pub fn remove_edns_option(msg: &mut Message, code: EdnsCode) -> bool {
    let Some(edns) = msg.extensions_mut().as_mut() else {
        return false;
    };
    if edns.option(code).is_none() {
        return false;
    }

    edns.options_mut().remove(code);
    if edns.options().as_ref().is_empty() {
        *msg.extensions_mut() = None;
    }

    true
}

/// Append an ECS option for `ip`, masked to `prefix_len` bits, creating an
/// EDNS section if none exists. Pre-existing ECS options are not checked;
/// remove them first if exclusivity matters.
pub fn create_ecs(msg: &mut Message, ip: IpAddr, prefix_len: u8) -> DnsResult<()> {
    let masked = mask_ip(ip, prefix_len);
    let subnet = format!("{masked}/{prefix_len}");
    let subnet: ClientSubnet = subnet
        .parse()
        .map_err(|e| DnsError::internal(format!("bad ECS subnet {subnet}: {e}")))?;

    let edns = msg.extensions_mut().get_or_insert_with(new_edns);
    edns.options_mut().insert(EdnsOption::Subnet(subnet));

    Ok(())
}

/// Return the length of the padding option in the message, if present.
///
/// The presence of padding is the RFC 8467 signal from a DoH client that
/// the server should pad its response.
pub fn find_padding(msg: &Message) -> Option<usize> {
    match msg.extensions().as_ref()?.option(EdnsCode::Padding) {
        Some(EdnsOption::Unknown(_, data)) => Some(data.len()),
        Some(_) => Some(0),
        None => None,
    }
}

/// Pad the message with an RFC 8467 padding option and serialize it so the
/// packed length is a multiple of `modulo`.
///
/// Any existing padding is removed first; padding is hop-by-hop, so
/// whatever arrived has already served its purpose. A padding option is
/// added even when the message is already an exact multiple because the
/// option itself signals the remote end to pad its response.
///
/// The serializer is the ground truth for message length (name compression
/// makes estimates unreliable), so the message is packed once with a
/// zero-length pad to measure, then packed again with the sized pad and
/// the result verified.
pub fn pad_and_pack(msg: &mut Message, modulo: usize) -> DnsResult<Vec<u8>> {
    if modulo < 1 || modulo > MAXIMUM_VIABLE_DNS_MESSAGE {
        return Err(DnsError::serialize(format!(
            "padding modulo {modulo} is not in range 1-{MAXIMUM_VIABLE_DNS_MESSAGE}"
        )));
    }

    remove_edns_option(msg, EdnsCode::Padding);
    let edns = msg.extensions_mut().get_or_insert_with(new_edns);
    edns.options_mut()
        .insert(EdnsOption::Unknown(EdnsCode::Padding.into(), Vec::new()));

    let measured = msg.to_vec().map_err(|e| DnsError::serialize(e.to_string()))?.len();
    let extra = (modulo - (measured % modulo)) % modulo;
    if extra > 0 {
        let edns = msg
            .extensions_mut()
            .as_mut()
            .ok_or_else(|| DnsError::internal("EDNS section vanished while padding"))?;
        edns.options_mut()
            .insert(EdnsOption::Unknown(EdnsCode::Padding.into(), vec![0u8; extra]));
    }

    let packed = msg.to_vec().map_err(|e| DnsError::serialize(e.to_string()))?;
    if packed.len() % modulo != 0 {
        return Err(DnsError::serialize(format!(
            "pad and pack produced unexpected length {} with modulo {modulo}",
            packed.len()
        )));
    }

    Ok(packed)
}

/// Reduce the TTL of every record in the answer, authority and additional
/// sections by `by` seconds, never below `minimum`. Records already at or
/// below the minimum are left alone. Returns how many TTLs changed.
pub fn reduce_ttl(msg: &mut Message, by: u32, minimum: u32) -> usize {
    let mut changed = 0;
    changed += reduce_rrset(msg.answers_mut(), by, minimum);
    changed += reduce_rrset(msg.name_servers_mut(), by, minimum);
    changed += reduce_rrset(msg.additionals_mut(), by, minimum);
    changed
}

fn reduce_rrset(records: &mut [Record], by: u32, minimum: u32) -> usize {
    let mut changed = 0;
    for record in records {
        let ttl = record.ttl();
        if ttl > minimum {
            let reduced = ttl.saturating_sub(by).max(minimum);
            if reduced != ttl {
                record.set_ttl(reduced);
                changed += 1;
            }
        }
    }
    changed
}

/// Whether the message carries a transaction signature (TSIG or SIG(0)).
///
/// A signed message must not have its ECS or padding touched; any byte
/// change other than the ID invalidates the signature.
pub fn is_signed(msg: &Message) -> bool {
    msg.additionals().iter().any(|r| {
        let code = u16::from(r.record_type());
        code == TSIG_TYPE_CODE || code == SIG_TYPE_CODE
    })
}

/// The EDNS0 UDP payload size advertised by the query, if any.
pub fn edns_udp_size(msg: &Message) -> Option<u16> {
    msg.extensions().as_ref().map(|e| e.max_payload())
}

/// A compact single-line rendering of the interesting parts of a message,
/// suited to query logs.
///
/// Format: `ID/op/rcode (flags) class/type/qname answers/authority/extra`
pub fn compact_msg_string(msg: &Message) -> String {
    let mut bits = String::new();
    let header = msg.header();
    if header.message_type() == hickory_proto::op::MessageType::Response {
        bits.push('R');
    }
    if header.authoritative() {
        bits.push('A');
    }
    if header.truncated() {
        bits.push('T');
    }
    if header.recursion_desired() {
        bits.push('d');
    }
    if header.recursion_available() {
        bits.push('a');
    }
    if header.authentic_data() {
        bits.push('s');
    }
    if header.checking_disabled() {
        bits.push('x');
    }

    let (qclass, qtype, qname) = match msg.queries().first() {
        Some(q) => (
            q.query_class().to_string(),
            q.query_type().to_string(),
            q.name().to_string(),
        ),
        None => ("?".to_string(), "?".to_string(), "?".to_string()),
    };

    format!(
        "{}/{:?}/{} ({}) {}/{}/{} {}/{}/{}",
        msg.id(),
        msg.op_code(),
        u16::from(msg.response_code()),
        bits,
        qclass,
        qtype,
        qname,
        msg.answers().len(),
        msg.name_servers().len(),
        msg.additionals().len(),
    )
}

/// Mask `ip` down to its leading `prefix_len` bits.
pub fn mask_ip(ip: IpAddr, prefix_len: u8) -> IpAddr {
    match ip {
        IpAddr::V4(v4) => {
            let bits = u32::from(v4);
            let mask = if prefix_len >= 32 {
                u32::MAX
            } else {
                u32::MAX.checked_shl(32 - u32::from(prefix_len)).unwrap_or(0)
            };
            IpAddr::V4((bits & mask).into())
        }
        IpAddr::V6(v6) => {
            let bits = u128::from(v6);
            let mask = if prefix_len >= 128 {
                u128::MAX
            } else {
                u128::MAX.checked_shl(128 - u32::from(prefix_len)).unwrap_or(0)
            };
            IpAddr::V6((bits & mask).into())
        }
    }
}

fn new_edns() -> Edns {
    let mut edns = Edns::new();
    edns.set_version(0);
    edns.set_max_payload(DEFAULT_EDNS_UDP_SIZE);
    edns
}
