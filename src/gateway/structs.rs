//! JSON bodies of the packet_forwarder protocol and their conversion into the
//! bridge's own value objects.

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    eui::Eui64,
    models::{CrcStatus, DataRate, GatewayStats, Modulation, RxInfo, RxPacket, TxPacket},
};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConversionError {
    #[error("invalid data rate {0:?}")]
    InvalidDataRate(String),
    #[error("unsupported modulation {0:?}")]
    UnsupportedModulation(String),
    #[error("invalid base64 payload: {0}")]
    InvalidPayload(String),
    #[error("scheduled downlink without timestamp")]
    MissingTimestamp,
    #[error("phyPayload of {0} bytes exceeds {MAX_PHY_PAYLOAD}")]
    PayloadTooLarge(usize),
}

/// Largest PHYPayload a LoRa radio frame can carry.
pub const MAX_PHY_PAYLOAD: usize = 255;

/// `datr` is a string for LoRa ("SF7BW125") and a bit rate for FSK.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum DatR {
    Lora(String),
    Fsk(u32),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct PushDataPayload {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rxpk: Vec<Rxpk>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stat: Option<Stat>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Rxpk {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tmms: Option<u64>,
    pub tmst: u32,
    /// MHz.
    pub freq: f64,
    #[serde(default)]
    pub chan: u8,
    #[serde(default)]
    pub rfch: u8,
    /// 1 = CRC ok, -1 = CRC failed, 0 = no CRC.
    pub stat: i8,
    pub modu: String,
    pub datr: DatR,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codr: Option<String>,
    pub rssi: i16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lsnr: Option<f64>,
    pub size: u16,
    pub data: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Stat {
    /// "YYYY-MM-DD hh:mm:ss GMT".
    #[serde(default)]
    pub time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lati: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub long: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alti: Option<i32>,
    #[serde(default)]
    pub rxnb: u32,
    #[serde(default)]
    pub rxok: u32,
    #[serde(default)]
    pub rxfw: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ackr: Option<f64>,
    #[serde(default)]
    pub dwnb: u32,
    #[serde(default)]
    pub txnb: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PullRespPayload {
    pub txpk: Txpk,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Txpk {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub imme: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tmst: Option<u32>,
    /// MHz.
    pub freq: f64,
    pub rfch: u8,
    pub powe: u8,
    pub modu: String,
    pub datr: DatR,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fdev: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipol: Option<bool>,
    pub size: u16,
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ncrc: Option<bool>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct TxAckPayload {
    pub txpk_ack: TxpkAck,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct TxpkAck {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warn: Option<String>,
}

impl TxAckPayload {
    pub fn error_code(&self) -> &str {
        self.txpk_ack.error.as_deref().unwrap_or("NONE")
    }
}

fn mhz_to_hz(mhz: f64) -> u32 {
    (mhz * 1_000_000.0).round() as u32
}

fn hz_to_mhz(hz: u32) -> f64 {
    hz as f64 / 1_000_000.0
}

fn parse_datr(modu: &str, datr: &DatR) -> Result<DataRate, ConversionError> {
    match (modu, datr) {
        ("LORA", DatR::Lora(s)) => {
            let invalid = || ConversionError::InvalidDataRate(s.clone());
            let (sf, bw) = s
                .strip_prefix("SF")
                .and_then(|rest| rest.split_once("BW"))
                .ok_or_else(invalid)?;
            Ok(DataRate::lora(
                sf.parse().map_err(|_| invalid())?,
                bw.parse().map_err(|_| invalid())?,
            ))
        }
        ("FSK", DatR::Fsk(bit_rate)) => Ok(DataRate::fsk(*bit_rate)),
        ("LORA" | "FSK", DatR::Lora(s)) => Err(ConversionError::InvalidDataRate(s.clone())),
        ("LORA" | "FSK", DatR::Fsk(n)) => Err(ConversionError::InvalidDataRate(n.to_string())),
        (other, _) => Err(ConversionError::UnsupportedModulation(other.to_string())),
    }
}

impl Rxpk {
    pub fn crc_status(&self) -> CrcStatus {
        match self.stat {
            1 => CrcStatus::Valid,
            -1 => CrcStatus::Invalid,
            _ => CrcStatus::NotApplicable,
        }
    }

    pub fn to_rx_packet(&self, mac: Eui64) -> Result<RxPacket, ConversionError> {
        let phy_payload = STANDARD
            .decode(self.data.as_bytes())
            .map_err(|e| ConversionError::InvalidPayload(e.to_string()))?;

        Ok(RxPacket {
            rx_info: RxInfo {
                mac,
                time: self
                    .time
                    .as_deref()
                    .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                    .map(|t| t.with_timezone(&Utc)),
                timestamp: self.tmst,
                frequency: mhz_to_hz(self.freq),
                channel: self.chan,
                rf_chain: self.rfch,
                crc_status: self.crc_status(),
                code_rate: self.codr.clone().unwrap_or_default(),
                rssi: self.rssi,
                lora_snr: self.lsnr.unwrap_or_default(),
                size: self.size,
                data_rate: parse_datr(&self.modu, &self.datr)?,
            },
            phy_payload,
        })
    }
}

impl Stat {
    pub fn to_gateway_stats(&self, mac: Eui64) -> GatewayStats {
        let time = self
            .time
            .trim_end_matches(" GMT")
            .trim_end_matches(" UTC");
        GatewayStats {
            mac,
            time: NaiveDateTime::parse_from_str(time, "%Y-%m-%d %H:%M:%S")
                .ok()
                .map(|t| Utc.from_utc_datetime(&t)),
            latitude: self.lati,
            longitude: self.long,
            altitude: self.alti.map(f64::from),
            rx_packets_received: self.rxnb,
            rx_packets_received_ok: self.rxok,
            tx_packets_received: self.dwnb,
            tx_packets_emitted: self.txnb,
        }
    }
}

impl Txpk {
    pub fn from_tx_packet(packet: &TxPacket) -> Result<Self, ConversionError> {
        let info = &packet.tx_info;
        let rate = &info.data_rate;

        let (modu, datr, codr, fdev, ipol) = match rate.modulation {
            Modulation::Lora => {
                let (Some(sf), Some(bw)) = (rate.spread_factor, rate.bandwidth) else {
                    return Err(ConversionError::InvalidDataRate(format!("{rate:?}")));
                };
                (
                    "LORA",
                    DatR::Lora(format!("SF{sf}BW{bw}")),
                    Some(info.code_rate.clone()),
                    None,
                    Some(info.ipol.unwrap_or(true)),
                )
            }
            Modulation::Fsk => {
                let Some(bit_rate) = rate.bit_rate else {
                    return Err(ConversionError::InvalidDataRate(format!("{rate:?}")));
                };
                ("FSK", DatR::Fsk(bit_rate), None, Some(bit_rate / 2), info.ipol)
            }
        };

        let size = packet.phy_payload.len();
        if size > MAX_PHY_PAYLOAD {
            return Err(ConversionError::PayloadTooLarge(size));
        }

        let tmst = match (info.immediately, info.timestamp) {
            (true, _) => None,
            (false, Some(ts)) => Some(ts),
            (false, None) => return Err(ConversionError::MissingTimestamp),
        };

        Ok(Txpk {
            imme: info.immediately,
            tmst,
            freq: hz_to_mhz(info.frequency),
            rfch: 0,
            powe: info.power,
            modu: modu.to_string(),
            datr,
            codr,
            fdev,
            ipol,
            size: size as u16,
            data: STANDARD.encode(&packet.phy_payload),
            ncrc: None,
        })
    }
}
