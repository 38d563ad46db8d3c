//! Semtech packet_forwarder UDP frame codec.
//!
//! ```text
//! | version (1) | token (2, BE) | kind (1) | gateway EUI (8, some kinds) | JSON body |
//! ```

use bytes::{Buf, BufMut, BytesMut};
use serde::Serialize;

use super::structs::{PullRespPayload, PushDataPayload, TxAckPayload};
use crate::eui::Eui64;

const HEADER_LEN: usize = 4;
const EUI_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ProtocolVersion {
    V1 = 0x01,
    V2 = 0x02,
}

impl TryFrom<u8> for ProtocolVersion {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(ProtocolVersion::V1),
            0x02 => Ok(ProtocolVersion::V2),
            v => Err(DecodeError::UnsupportedVersion(v)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    PushData = 0x00,
    PushAck = 0x01,
    PullData = 0x02,
    PullResp = 0x03,
    PullAck = 0x04,
    TxAck = 0x05,
}

impl TryFrom<u8> for FrameKind {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(FrameKind::PushData),
            0x01 => Ok(FrameKind::PushAck),
            0x02 => Ok(FrameKind::PullData),
            0x03 => Ok(FrameKind::PullResp),
            0x04 => Ok(FrameKind::PullAck),
            0x05 => Ok(FrameKind::TxAck),
            k => Err(DecodeError::UnknownKind(k)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed header: {0}")]
    MalformedHeader(&'static str),
    #[error("unknown frame kind 0x{0:02x}")]
    UnknownKind(u8),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("invalid JSON body: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

/// Kind-specific part of a frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    PushData {
        gateway: Eui64,
        body: PushDataPayload,
    },
    PushAck,
    PullData {
        gateway: Eui64,
    },
    PullResp {
        body: PullRespPayload,
    },
    PullAck,
    /// Version 1 forwarders acknowledge without a body.
    TxAck {
        gateway: Eui64,
        body: Option<TxAckPayload>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub version: ProtocolVersion,
    pub token: u16,
    pub payload: Payload,
}

impl Frame {
    pub fn new(version: ProtocolVersion, token: u16, payload: Payload) -> Self {
        Self {
            version,
            token,
            payload,
        }
    }

    pub fn kind(&self) -> FrameKind {
        match self.payload {
            Payload::PushData { .. } => FrameKind::PushData,
            Payload::PushAck => FrameKind::PushAck,
            Payload::PullData { .. } => FrameKind::PullData,
            Payload::PullResp { .. } => FrameKind::PullResp,
            Payload::PullAck => FrameKind::PullAck,
            Payload::TxAck { .. } => FrameKind::TxAck,
        }
    }

    pub fn gateway(&self) -> Option<Eui64> {
        match self.payload {
            Payload::PushData { gateway, .. }
            | Payload::PullData { gateway }
            | Payload::TxAck { gateway, .. } => Some(gateway),
            _ => None,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + EUI_LEN);
        buf.put_u8(self.version as u8);
        buf.put_u16(self.token);
        buf.put_u8(self.kind() as u8);

        match &self.payload {
            Payload::PushData { gateway, body } => {
                buf.put_slice(gateway.as_bytes());
                put_json(&mut buf, body);
            }
            Payload::PullData { gateway } => buf.put_slice(gateway.as_bytes()),
            Payload::PullResp { body } => put_json(&mut buf, body),
            Payload::TxAck { gateway, body } => {
                buf.put_slice(gateway.as_bytes());
                if let Some(body) = body {
                    put_json(&mut buf, body);
                }
            }
            Payload::PushAck | Payload::PullAck => {}
        }
        buf.to_vec()
    }

    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < HEADER_LEN {
            return Err(DecodeError::MalformedHeader("datagram shorter than header"));
        }
        let mut buf = data;
        let version = ProtocolVersion::try_from(buf.get_u8())?;
        let token = buf.get_u16();
        let kind = FrameKind::try_from(buf.get_u8())?;

        let payload = match kind {
            FrameKind::PushData => Payload::PushData {
                gateway: take_eui(&mut buf)?,
                body: serde_json::from_slice(trim_body(buf))?,
            },
            FrameKind::PushAck => Payload::PushAck,
            FrameKind::PullData => Payload::PullData {
                gateway: take_eui(&mut buf)?,
            },
            FrameKind::PullResp => Payload::PullResp {
                body: serde_json::from_slice(trim_body(buf))?,
            },
            FrameKind::PullAck => Payload::PullAck,
            FrameKind::TxAck => {
                let gateway = take_eui(&mut buf)?;
                let body = trim_body(buf);
                Payload::TxAck {
                    gateway,
                    body: if body.is_empty() {
                        None
                    } else {
                        Some(serde_json::from_slice(body)?)
                    },
                }
            }
        };

        Ok(Frame {
            version,
            token,
            payload,
        })
    }
}

fn take_eui(buf: &mut &[u8]) -> Result<Eui64, DecodeError> {
    if buf.remaining() < EUI_LEN {
        return Err(DecodeError::MalformedHeader("missing gateway identifier"));
    }
    let mut eui = [0u8; EUI_LEN];
    buf.copy_to_slice(&mut eui);
    Ok(Eui64::new(eui))
}

// some forwarders NUL-terminate the JSON body
fn trim_body(body: &[u8]) -> &[u8] {
    let end = body.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
    &body[..end]
}

fn put_json<T: Serialize>(buf: &mut BytesMut, body: &T) {
    let json = serde_json::to_vec(body).expect("protocol bodies only contain JSON-representable fields");
    buf.put_slice(&json);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::structs::{DatR, Rxpk, Stat, Txpk, TxpkAck};

    const GW: Eui64 = Eui64::new([0xaa, 0x55, 0x5a, 0x00, 0x00, 0x00, 0x00, 0x01]);

    fn rxpk() -> Rxpk {
        Rxpk {
            time: Some("2017-01-01T12:00:00.000001Z".into()),
            tmms: None,
            tmst: 708016819,
            freq: 868.1,
            chan: 2,
            rfch: 1,
            stat: 1,
            modu: "LORA".into(),
            datr: DatR::Lora("SF7BW125".into()),
            codr: Some("4/5".into()),
            rssi: -51,
            lsnr: Some(7.0),
            size: 4,
            data: "AQIDBA==".into(),
        }
    }

    fn txpk() -> Txpk {
        Txpk {
            imme: true,
            tmst: None,
            freq: 869.525,
            rfch: 0,
            powe: 14,
            modu: "FSK".into(),
            datr: DatR::Fsk(50_000),
            codr: None,
            fdev: Some(25_000),
            ipol: None,
            size: 2,
            data: "AQI=".into(),
            ncrc: Some(false),
        }
    }

    #[test]
    fn decode_push_data() {
        let mut data = vec![0x02, 0x12, 0x34, 0x00];
        data.extend_from_slice(GW.as_bytes());
        data.extend_from_slice(br#"{"rxpk":[{"tmst":1,"freq":868.1,"stat":1,"modu":"LORA","datr":"SF7BW125","codr":"4/5","rssi":-40,"lsnr":9.5,"size":1,"data":"AA=="}]}"#);

        let frame = Frame::decode(&data).unwrap();
        assert_eq!(frame.version, ProtocolVersion::V2);
        assert_eq!(frame.token, 0x1234);
        assert_eq!(frame.kind(), FrameKind::PushData);
        assert_eq!(frame.gateway(), Some(GW));
        let Payload::PushData { body, .. } = frame.payload else {
            panic!("expected push data");
        };
        assert_eq!(body.rxpk.len(), 1);
        assert!(body.stat.is_none());
    }

    #[test]
    fn encode_acks() {
        let ack = Frame::new(ProtocolVersion::V2, 0xbeef, Payload::PushAck).encode();
        assert_eq!(ack, vec![0x02, 0xbe, 0xef, 0x01]);
        let ack = Frame::new(ProtocolVersion::V1, 0x0102, Payload::PullAck).encode();
        assert_eq!(ack, vec![0x01, 0x01, 0x02, 0x04]);
    }

    #[test]
    fn every_kind_survives_encode_decode() {
        let frames = vec![
            Frame::new(
                ProtocolVersion::V2,
                1,
                Payload::PushData {
                    gateway: GW,
                    body: PushDataPayload {
                        rxpk: vec![rxpk(), rxpk()],
                        stat: Some(Stat {
                            time: "2014-01-12 08:59:28 GMT".into(),
                            lati: Some(46.24),
                            long: Some(3.2523),
                            alti: Some(145),
                            rxnb: 2,
                            rxok: 2,
                            rxfw: 2,
                            ackr: Some(100.0),
                            dwnb: 2,
                            txnb: 2,
                        }),
                    },
                },
            ),
            Frame::new(
                ProtocolVersion::V1,
                2,
                Payload::PushData {
                    gateway: GW,
                    body: PushDataPayload::default(),
                },
            ),
            Frame::new(ProtocolVersion::V2, 3, Payload::PushAck),
            Frame::new(ProtocolVersion::V2, 4, Payload::PullData { gateway: GW }),
            Frame::new(ProtocolVersion::V2, 5, Payload::PullResp { body: PullRespPayload { txpk: txpk() } }),
            Frame::new(ProtocolVersion::V2, 6, Payload::PullAck),
            Frame::new(ProtocolVersion::V1, 7, Payload::TxAck { gateway: GW, body: None }),
            Frame::new(
                ProtocolVersion::V2,
                8,
                Payload::TxAck {
                    gateway: GW,
                    body: Some(TxAckPayload {
                        txpk_ack: TxpkAck {
                            error: Some("TOO_LATE".into()),
                            warn: None,
                        },
                    }),
                },
            ),
        ];

        for frame in frames {
            assert_eq!(Frame::decode(&frame.encode()).unwrap(), frame);
        }
    }

    #[test]
    fn tx_ack_with_trailing_nul() {
        let mut data = vec![0x02, 0x00, 0x07, 0x05];
        data.extend_from_slice(GW.as_bytes());
        data.extend_from_slice(b"{\"txpk_ack\":{\"error\":\"NONE\"}}\0");

        let frame = Frame::decode(&data).unwrap();
        let Payload::TxAck { body: Some(body), .. } = frame.payload else {
            panic!("expected tx ack with body");
        };
        assert_eq!(body.error_code(), "NONE");
    }

    #[test]
    fn decode_errors() {
        assert!(matches!(
            Frame::decode(&[0x02, 0x00]),
            Err(DecodeError::MalformedHeader(_))
        ));
        assert!(matches!(
            Frame::decode(&[0x03, 0x00, 0x00, 0x00]),
            Err(DecodeError::UnsupportedVersion(3))
        ));
        assert!(matches!(
            Frame::decode(&[0x02, 0x00, 0x00, 0x09]),
            Err(DecodeError::UnknownKind(9))
        ));
        assert!(matches!(
            Frame::decode(&[0x02, 0x00, 0x00, 0x02, 0xaa]),
            Err(DecodeError::MalformedHeader(_))
        ));

        let mut data = vec![0x02, 0x00, 0x00, 0x00];
        data.extend_from_slice(GW.as_bytes());
        data.extend_from_slice(b"{not json");
        assert!(matches!(Frame::decode(&data), Err(DecodeError::InvalidJson(_))));
    }
}
