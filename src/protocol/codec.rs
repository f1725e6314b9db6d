//! Versioned binary encode/decode of lease protocol messages.
//!
//! Frame layout (little endian):
//!
//! ```text
//! u8  major version        -- breaking; mismatch is rejected
//! u8  minor version        -- upgradable; higher minors are accepted
//! u32 header size          -- rmp-encoded LeaseHeader follows
//! ..  header bytes
//! u32 list descriptor count (>= 7)
//! per list: u32 element count, u32 byte size   -- descriptor table
//! ..  concatenated list payloads (rmp Vec<LeaseRelationshipId> each)
//! u32 extension size       -- optional trailing section (relay routing)
//! ..  extension bytes
//! ```
//!
//! Forward compatibility rule: descriptors beyond the seven known lists and
//! any bytes past the extension section are skipped, never rejected.

use crate::protocol::message::{
    LeaseMessage, LeaseRelationshipId, RelationshipLists,
    LEASE_PROTOCOL_MAJOR_VERSION, LEASE_PROTOCOL_MINOR_VERSION,
    RELATIONSHIP_LIST_COUNT,
};
use crate::utils::VigilError;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

/// Hard cap on any single length field, to reject corrupt frames before
/// attempting a huge allocation.
const MAX_SECTION_SIZE: u32 = 16 * 1024 * 1024;

/// Encodes one relationship identifier list, returning its descriptor
/// (element count, byte size) and payload bytes.
fn encode_list(
    list: &[LeaseRelationshipId],
) -> Result<(u32, Vec<u8>), VigilError> {
    let payload = encode_to_vec(list)?;
    Ok((list.len() as u32, payload))
}

/// Serializes a lease message into a framed byte buffer.
pub fn encode_message(msg: &LeaseMessage) -> Result<Bytes, VigilError> {
    let header_bytes = encode_to_vec(&msg.header)?;

    let lists = [
        &msg.lists.subject_pending,
        &msg.lists.subject_failed,
        &msg.lists.monitor_failed,
        &msg.lists.subject_accepted,
        &msg.lists.subject_rejected,
        &msg.lists.subject_terminated,
        &msg.lists.monitor_terminated,
    ];
    let mut descriptors = Vec::with_capacity(lists.len());
    let mut payloads = Vec::with_capacity(lists.len());
    for list in lists {
        let (count, payload) = encode_list(list)?;
        descriptors.push((count, payload.len() as u32));
        payloads.push(payload);
    }

    let ext_bytes =
        encode_to_vec(&(&msg.relay_target, &msg.relay_origin))?;

    let mut buf = BytesMut::with_capacity(
        6 + header_bytes.len()
            + 4
            + descriptors.len() * 8
            + payloads.iter().map(|p| p.len()).sum::<usize>()
            + 4
            + ext_bytes.len(),
    );
    buf.put_u8(LEASE_PROTOCOL_MAJOR_VERSION);
    buf.put_u8(LEASE_PROTOCOL_MINOR_VERSION);
    buf.put_u32_le(header_bytes.len() as u32);
    buf.put_slice(&header_bytes);
    buf.put_u32_le(RELATIONSHIP_LIST_COUNT);
    for &(count, size) in &descriptors {
        buf.put_u32_le(count);
        buf.put_u32_le(size);
    }
    for payload in &payloads {
        buf.put_slice(payload);
    }
    buf.put_u32_le(ext_bytes.len() as u32);
    buf.put_slice(&ext_bytes);

    Ok(buf.freeze())
}

/// Checked read of a little-endian u32 length field.
fn take_u32(buf: &mut &[u8], what: &str) -> Result<u32, VigilError> {
    if buf.remaining() < 4 {
        return Err(VigilError::msg(format!(
            "truncated frame reading {}",
            what
        )));
    }
    let v = buf.get_u32_le();
    if v > MAX_SECTION_SIZE {
        return Err(VigilError::msg(format!(
            "{} length {} exceeds cap",
            what, v
        )));
    }
    Ok(v)
}

/// Checked read of a byte section of known size.
fn take_slice<'a>(
    buf: &mut &'a [u8],
    size: usize,
    what: &str,
) -> Result<&'a [u8], VigilError> {
    if buf.remaining() < size {
        return Err(VigilError::msg(format!(
            "truncated frame reading {} ({} bytes wanted, {} left)",
            what,
            size,
            buf.remaining()
        )));
    }
    let (head, tail) = buf.split_at(size);
    *buf = tail;
    Ok(head)
}

/// Deserializes a lease message from a framed byte buffer, validating the
/// version header and the body list descriptors.
pub fn decode_message(frame: &[u8]) -> Result<LeaseMessage, VigilError> {
    let mut buf = frame;

    if buf.remaining() < 2 {
        return Err(VigilError::msg("frame too short for version header"));
    }
    let major = buf.get_u8();
    let minor = buf.get_u8();
    if major != LEASE_PROTOCOL_MAJOR_VERSION {
        return Err(VigilError::msg(format!(
            "protocol major version mismatch: got {}, expected {}",
            major, LEASE_PROTOCOL_MAJOR_VERSION
        )));
    }
    if minor > LEASE_PROTOCOL_MINOR_VERSION {
        // upgradable change; parse the parts we know
        pf_trace!(
            "decoding message of newer minor version {} > {}",
            minor,
            LEASE_PROTOCOL_MINOR_VERSION
        );
    }

    let header_size = take_u32(&mut buf, "header size")? as usize;
    let header_bytes = take_slice(&mut buf, header_size, "header")?;
    let header = decode_from_slice(header_bytes)?;

    let descriptor_cnt = take_u32(&mut buf, "descriptor count")?;
    if descriptor_cnt < RELATIONSHIP_LIST_COUNT {
        return Err(VigilError::msg(format!(
            "descriptor count {} < required {}",
            descriptor_cnt, RELATIONSHIP_LIST_COUNT
        )));
    }
    let mut descriptors = Vec::with_capacity(descriptor_cnt as usize);
    for i in 0..descriptor_cnt {
        let count = take_u32(&mut buf, "descriptor element count")?;
        let size = take_u32(&mut buf, "descriptor byte size")?;
        descriptors.push((i, count, size));
    }

    let mut known_lists: Vec<Vec<LeaseRelationshipId>> = Vec::new();
    for &(idx, count, size) in &descriptors {
        let payload = take_slice(&mut buf, size as usize, "list payload")?;
        if idx >= RELATIONSHIP_LIST_COUNT {
            // list added by a newer minor version; skip its payload
            continue;
        }
        let list: Vec<LeaseRelationshipId> = decode_from_slice(payload)?;
        if list.len() as u32 != count {
            return Err(VigilError::msg(format!(
                "list descriptor count mismatch: declared {}, decoded {}",
                count,
                list.len()
            )));
        }
        known_lists.push(list);
    }

    // extension section is optional (absent from older minor versions)
    let (relay_target, relay_origin) = if buf.remaining() >= 4 {
        let ext_size = take_u32(&mut buf, "extension size")? as usize;
        if buf.remaining() >= ext_size {
            let ext_bytes = take_slice(&mut buf, ext_size, "extension")?;
            decode_from_slice::<(String, String)>(ext_bytes)?
        } else {
            (String::new(), String::new())
        }
    } else {
        (String::new(), String::new())
    };
    // any bytes remaining past here belong to a newer minor version; ignored

    let mut it = known_lists.into_iter();
    let lists = RelationshipLists {
        subject_pending: it.next().unwrap_or_default(),
        subject_failed: it.next().unwrap_or_default(),
        monitor_failed: it.next().unwrap_or_default(),
        subject_accepted: it.next().unwrap_or_default(),
        subject_rejected: it.next().unwrap_or_default(),
        subject_terminated: it.next().unwrap_or_default(),
        monitor_terminated: it.next().unwrap_or_default(),
    };

    Ok(LeaseMessage {
        header,
        lists,
        relay_target,
        relay_origin,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::{LeaseHeader, LeaseMessageType};

    fn test_message() -> LeaseMessage {
        let mut msg = LeaseMessage::new(LeaseHeader {
            msg_type: LeaseMessageType::LeaseRequest,
            message_id: 7,
            sender_endpoint: "10.0.0.1:9001".into(),
            sender_instance: 133_700_001,
            target_instance: 133_700_002,
            lease_instance: 3,
            duration_ms: 30_000,
            expiration_ms: 29_500,
            suspend_duration_ms: 5_000,
            arbitration_duration_ms: 30_000,
            is_two_way_termination: false,
        });
        msg.lists.subject_pending =
            vec![LeaseRelationshipId::new("fed/A", "fed/B")];
        msg.lists.subject_terminated = vec![
            LeaseRelationshipId::new("fed/A", "fed/C"),
            LeaseRelationshipId::new("fed/A", "fed/D"),
        ];
        msg
    }

    #[test]
    fn roundtrip() -> Result<(), VigilError> {
        let msg = test_message();
        let frame = encode_message(&msg)?;
        let decoded = decode_message(&frame)?;
        assert_eq!(decoded, msg);
        Ok(())
    }

    #[test]
    fn roundtrip_relay_routing() -> Result<(), VigilError> {
        let mut msg = test_message();
        msg.header.msg_type = LeaseMessageType::ForwardRequest;
        msg.relay_target = "10.0.0.3:9001".into();
        msg.relay_origin = "10.0.0.1:9001".into();
        let frame = encode_message(&msg)?;
        let decoded = decode_message(&frame)?;
        assert_eq!(decoded.relay_target, "10.0.0.3:9001");
        assert_eq!(decoded.relay_origin, "10.0.0.1:9001");
        Ok(())
    }

    #[test]
    fn major_version_rejected() -> Result<(), VigilError> {
        let frame = encode_message(&test_message())?;
        let mut bad = frame.to_vec();
        bad[0] = LEASE_PROTOCOL_MAJOR_VERSION + 1;
        assert!(decode_message(&bad).is_err());
        Ok(())
    }

    #[test]
    fn higher_minor_accepted() -> Result<(), VigilError> {
        let msg = test_message();
        let frame = encode_message(&msg)?;
        let mut newer = frame.to_vec();
        newer[1] = LEASE_PROTOCOL_MINOR_VERSION + 3;
        // a newer minor may also append trailing bytes we don't understand
        newer.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        let decoded = decode_message(&newer)?;
        assert_eq!(decoded, msg);
        Ok(())
    }

    #[test]
    fn truncated_rejected() -> Result<(), VigilError> {
        let frame = encode_message(&test_message())?;
        for cut in [1usize, 5, 9, frame.len() / 2] {
            assert!(decode_message(&frame[..cut]).is_err());
        }
        Ok(())
    }

    #[test]
    fn descriptor_count_mismatch_rejected() -> Result<(), VigilError> {
        let msg = test_message();
        let frame = encode_message(&msg)?;
        // header: 1 + 1 + 4 + header_size; first descriptor's element count
        // lives right after the descriptor count field
        let header_size = u32::from_le_bytes([
            frame[2], frame[3], frame[4], frame[5],
        ]) as usize;
        let first_desc_at = 6 + header_size + 4;
        let mut bad = frame.to_vec();
        bad[first_desc_at] = bad[first_desc_at].wrapping_add(1);
        assert!(decode_message(&bad).is_err());
        Ok(())
    }
}
