use bytes::{BufMut, Bytes, BytesMut};

use super::{
    Correlation, PayloadKind, Role, WirePayload,
    varint::{decode_varint64, put_varint, varint_len},
};
use crate::error::FramingError;

const FIELD_KIND: u64 = 1;
const FIELD_EXCHANGE: u64 = 2;
const FIELD_ROLE: u64 = 3;
const FIELD_TYPE_KEY: u64 = 4;
const FIELD_BODY: u64 = 5;

const WIRE_VARINT: u64 = 0;
const WIRE_LENGTH: u64 = 2;

fn tag(field: u64, wire_type: u64) -> u64 {
    (field << 3) | wire_type
}

/// 信封编码后的字节数，用于预留缓冲与出站长度校验。
pub fn encoded_len(payload: &WirePayload) -> usize {
    let mut len = 1 + varint_len(payload.kind.wire_value());
    if let Some(correlation) = payload.correlation {
        len += 1 + varint_len(correlation.exchange);
        len += 1 + varint_len(correlation.role.wire_value());
    }
    if !payload.type_key.is_empty() {
        len += 1 + varint_len(payload.type_key.len() as u64) + payload.type_key.len();
    }
    if !payload.body.is_empty() {
        len += 1 + varint_len(payload.body.len() as u64) + payload.body.len();
    }
    len
}

/// 将信封追加写入 `dst`。
pub fn encode_payload(payload: &WirePayload, dst: &mut BytesMut) {
    dst.reserve(encoded_len(payload));
    put_varint(tag(FIELD_KIND, WIRE_VARINT), dst);
    put_varint(payload.kind.wire_value(), dst);
    if let Some(correlation) = payload.correlation {
        put_varint(tag(FIELD_EXCHANGE, WIRE_VARINT), dst);
        put_varint(correlation.exchange, dst);
        put_varint(tag(FIELD_ROLE, WIRE_VARINT), dst);
        put_varint(correlation.role.wire_value(), dst);
    }
    if !payload.type_key.is_empty() {
        put_varint(tag(FIELD_TYPE_KEY, WIRE_LENGTH), dst);
        put_varint(payload.type_key.len() as u64, dst);
        dst.put_slice(payload.type_key.as_bytes());
    }
    if !payload.body.is_empty() {
        put_varint(tag(FIELD_BODY, WIRE_LENGTH), dst);
        put_varint(payload.body.len() as u64, dst);
        dst.put_slice(&payload.body);
    }
}

/// 从一个完整帧解析信封。消息体以切片方式引用帧缓冲，不做复制。
pub fn decode_payload(frame: Bytes) -> Result<WirePayload, FramingError> {
    let mut cursor = 0usize;
    let mut kind = None;
    let mut exchange = None;
    let mut role = None;
    let mut type_key = String::new();
    let mut body = Bytes::new();

    while cursor < frame.len() {
        let (key, width) = decode_varint64(&frame[cursor..])?;
        cursor += width;
        let field = key >> 3;
        match key & 0x7 {
            WIRE_VARINT => {
                let (value, width) = decode_varint64(&frame[cursor..])?;
                cursor += width;
                match field {
                    FIELD_KIND => kind = Some(PayloadKind::from_wire(value)?),
                    FIELD_EXCHANGE => exchange = Some(value),
                    FIELD_ROLE => role = Some(Role::from_wire(value)?),
                    _ => {}
                }
            }
            WIRE_LENGTH => {
                let (len, width) = decode_varint64(&frame[cursor..])?;
                cursor += width;
                let end = usize::try_from(len)
                    .ok()
                    .and_then(|len| cursor.checked_add(len))
                    .filter(|end| *end <= frame.len())
                    .ok_or(FramingError::MalformedPayload(
                        "length-delimited field overruns the frame",
                    ))?;
                let value = frame.slice(cursor..end);
                cursor = end;
                match field {
                    FIELD_TYPE_KEY => {
                        type_key = String::from_utf8(value.to_vec()).map_err(|_| {
                            FramingError::MalformedPayload("type key is not valid utf-8")
                        })?;
                    }
                    FIELD_BODY => body = value,
                    _ => {}
                }
            }
            _ => return Err(FramingError::MalformedPayload("unsupported wire type")),
        }
    }

    let kind = kind.ok_or(FramingError::MalformedPayload("missing payload kind"))?;
    let correlation = exchange.map(|exchange| Correlation {
        exchange,
        role: role.unwrap_or(Role::Initiator),
    });
    Ok(WirePayload {
        kind,
        correlation,
        type_key,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(payload: &WirePayload) -> Bytes {
        let mut buf = BytesMut::new();
        encode_payload(payload, &mut buf);
        assert_eq!(buf.len(), encoded_len(payload));
        buf.freeze()
    }

    #[test]
    fn pull_request_survives_encoding() {
        let payload = WirePayload::new(
            PayloadKind::Pull,
            Some(Correlation::new(7, Role::Initiator)),
        )
        .with_type_key("example.Get")
        .with_body(&b"{\"filename\":\"a.bin\"}"[..]);
        assert_eq!(decode_payload(encode(&payload)).unwrap(), payload);
    }

    #[test]
    fn bare_envelope_has_no_correlation() {
        let payload = WirePayload::new(PayloadKind::Close, None);
        let decoded = decode_payload(encode(&payload)).unwrap();
        assert_eq!(decoded.correlation, None);
        assert!(decoded.type_key.is_empty());
    }

    #[test]
    fn unknown_fields_are_skipped() {
        let payload = WirePayload::chunk(Correlation::new(1, Role::Responder), Bytes::from_static(b"xy"));
        let mut buf = BytesMut::new();
        encode_payload(&payload, &mut buf);
        put_varint(tag(15, WIRE_VARINT), &mut buf);
        put_varint(99, &mut buf);
        put_varint(tag(16, WIRE_LENGTH), &mut buf);
        put_varint(3, &mut buf);
        buf.put_slice(b"abc");
        assert_eq!(decode_payload(buf.freeze()).unwrap(), payload);
    }

    #[test]
    fn rejects_overrunning_length_and_missing_kind() {
        let mut buf = BytesMut::new();
        put_varint(tag(FIELD_KIND, WIRE_VARINT), &mut buf);
        put_varint(3, &mut buf);
        put_varint(tag(FIELD_BODY, WIRE_LENGTH), &mut buf);
        put_varint(100, &mut buf);
        buf.put_slice(b"short");
        assert!(matches!(
            decode_payload(buf.freeze()),
            Err(FramingError::MalformedPayload(_))
        ));

        assert!(matches!(
            decode_payload(Bytes::new()),
            Err(FramingError::MalformedPayload("missing payload kind"))
        ));
    }

    #[test]
    fn credit_carries_a_chunk_count() {
        let credit = WirePayload::credit(Correlation::new(3, Role::Initiator), 300);
        let decoded = decode_payload(encode(&credit)).unwrap();
        assert_eq!(decoded.kind, PayloadKind::Credit);
        assert_eq!(decoded.credit_chunks(), Some(300));

        let garbage = WirePayload::new(PayloadKind::Credit, None).with_body(&b"\x80"[..]);
        assert_eq!(garbage.credit_chunks(), None);
    }

    #[test]
    fn rejects_fixed_width_wire_types() {
        let mut buf = BytesMut::new();
        put_varint(tag(FIELD_KIND, 5), &mut buf);
        buf.put_slice(&[0, 0, 0, 0]);
        assert!(decode_payload(buf.freeze()).is_err());
    }
}
