//! Value objects handed between the UDP side and the MQTT side. These are
//! also the JSON documents published on (and consumed from) the broker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::eui::Eui64;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CrcStatus {
    Valid,
    Invalid,
    NotApplicable,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modulation {
    #[serde(rename = "LORA")]
    Lora,
    #[serde(rename = "FSK")]
    Fsk,
}

/// LoRa data rates carry spreading factor and bandwidth (kHz), FSK ones a bit rate.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DataRate {
    pub modulation: Modulation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spread_factor: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bandwidth: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bit_rate: Option<u32>,
}

impl DataRate {
    pub fn lora(spread_factor: u8, bandwidth: u32) -> Self {
        Self {
            modulation: Modulation::Lora,
            spread_factor: Some(spread_factor),
            bandwidth: Some(bandwidth),
            bit_rate: None,
        }
    }

    pub fn fsk(bit_rate: u32) -> Self {
        Self {
            modulation: Modulation::Fsk,
            spread_factor: None,
            bandwidth: None,
            bit_rate: Some(bit_rate),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RxInfo {
    pub mac: Eui64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    /// Concentrator counter value at reception, in microseconds.
    pub timestamp: u32,
    /// Hz.
    pub frequency: u32,
    pub channel: u8,
    pub rf_chain: u8,
    pub crc_status: CrcStatus,
    #[serde(default)]
    pub code_rate: String,
    pub rssi: i16,
    #[serde(rename = "loRaSNR", default)]
    pub lora_snr: f64,
    pub size: u16,
    pub data_rate: DataRate,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RxPacket {
    pub rx_info: RxInfo,
    #[serde(with = "base64_bytes")]
    pub phy_payload: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStats {
    pub mac: Eui64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    pub rx_packets_received: u32,
    #[serde(rename = "rxPacketsReceivedOK")]
    pub rx_packets_received_ok: u32,
    pub tx_packets_received: u32,
    pub tx_packets_emitted: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TxInfo {
    pub mac: Eui64,
    #[serde(default)]
    pub immediately: bool,
    /// Concentrator counter value to transmit at; required unless `immediately`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u32>,
    /// Hz.
    pub frequency: u32,
    /// dBm.
    pub power: u8,
    pub data_rate: DataRate,
    #[serde(default)]
    pub code_rate: String,
    #[serde(rename = "iPol", default, skip_serializing_if = "Option::is_none")]
    pub ipol: Option<bool>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TxPacket {
    pub tx_info: TxInfo,
    #[serde(with = "base64_bytes")]
    pub phy_payload: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    Ok,
    TooLate,
    TooEarly,
    CollisionPacket,
    CollisionBeacon,
    TxFrequency,
    TxPowerUnsupported,
    GpsUnlocked,
    InternalError,
}

impl Outcome {
    /// Maps a `txpk_ack.error` code. `None` means the code is not one we know.
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "" | "NONE" => Some(Outcome::Ok),
            "TOO_LATE" => Some(Outcome::TooLate),
            "TOO_EARLY" => Some(Outcome::TooEarly),
            "COLLISION_PACKET" => Some(Outcome::CollisionPacket),
            "COLLISION_BEACON" => Some(Outcome::CollisionBeacon),
            "TX_FREQ" => Some(Outcome::TxFrequency),
            "TX_POWER" => Some(Outcome::TxPowerUnsupported),
            "GPS_UNLOCKED" => Some(Outcome::GpsUnlocked),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TxAck {
    pub mac: Eui64,
    pub token: u16,
    pub outcome: Outcome,
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s.as_bytes()).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tx_packet_from_broker_json() {
        let json = r#"{
            "txInfo": {
                "mac": "0102030405060708",
                "immediately": false,
                "timestamp": 2000000,
                "frequency": 868100000,
                "power": 14,
                "dataRate": {"modulation": "LORA", "spreadFactor": 12, "bandwidth": 250},
                "codeRate": "4/5"
            },
            "phyPayload": "AQID"
        }"#;
        let packet: TxPacket = serde_json::from_str(json).unwrap();
        assert_eq!(packet.tx_info.mac.to_string(), "0102030405060708");
        assert_eq!(packet.tx_info.timestamp, Some(2_000_000));
        assert_eq!(packet.tx_info.data_rate, DataRate::lora(12, 250));
        assert_eq!(packet.tx_info.ipol, None);
        assert_eq!(packet.phy_payload, vec![1, 2, 3]);
    }

    #[test]
    fn rx_packet_json_field_names() {
        let packet = RxPacket {
            rx_info: RxInfo {
                mac: Eui64::new([1, 2, 3, 4, 5, 6, 7, 8]),
                time: None,
                timestamp: 1,
                frequency: 868_100_000,
                channel: 2,
                rf_chain: 0,
                crc_status: CrcStatus::Valid,
                code_rate: "4/5".into(),
                rssi: -57,
                lora_snr: 7.5,
                size: 2,
                data_rate: DataRate::lora(7, 125),
            },
            phy_payload: vec![0xde, 0xad],
        };
        let value = serde_json::to_value(&packet).unwrap();
        assert_eq!(value["rxInfo"]["loRaSNR"], 7.5);
        assert_eq!(value["rxInfo"]["crcStatus"], "valid");
        assert_eq!(value["rxInfo"]["dataRate"]["spreadFactor"], 7);
        assert_eq!(value["phyPayload"], "3q0=");
    }

    #[test]
    fn outcome_codes() {
        assert_eq!(Outcome::from_code("NONE"), Some(Outcome::Ok));
        assert_eq!(Outcome::from_code("TX_POWER"), Some(Outcome::TxPowerUnsupported));
        assert_eq!(Outcome::from_code("SOMETHING_NEW"), None);
        assert_eq!(
            serde_json::to_string(&Outcome::CollisionBeacon).unwrap(),
            "\"collision-beacon\""
        );
    }
}
