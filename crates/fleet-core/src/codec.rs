//! Wire codec for protocol records.
//!
//! Records are JSON on the wire. Decoding is tolerant: unknown fields are
//! skipped and absent fields take their zero value, so a control plane can
//! roll out new fields before every node understands them. Errors split into
//! two classes:
//!
//! - [`CodecError::MalformedPayload`]: the bytes are not the expected shape
//! - [`CodecError::SchemaViolation`]: the shape parsed but an invariant broke
//!
//! Record types opt in by implementing [`WireCodec`] and overriding
//! [`WireCodec::validate`]; the structural traversal stays derived.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CodecError;

/// Encode and decode a record with invariant checking.
pub trait WireCodec: Serialize + DeserializeOwned {
    /// Check record invariants. The default accepts everything.
    fn validate(&self) -> Result<(), CodecError> {
        Ok(())
    }

    /// Encode to wire bytes. Invalid records are refused.
    fn encode(&self) -> Result<Vec<u8>, CodecError> {
        self.validate()?;
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode from wire bytes and validate.
    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let value: Self = serde_json::from_slice(bytes)?;
        value.validate()?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ConfigRecord, DnsRule, OutboundRule};

    fn full_record() -> ConfigRecord {
        ConfigRecord {
            node_secret: "0f3c9a7e".into(),
            pull_interval: 60,
            push_interval: 60,
            traffic_report_threshold: 1_000_000,
            ip_strategy: "prefer_ipv6".into(),
            dns: vec![
                DnsRule {
                    proto: "udp".into(),
                    address: "8.8.8.8:53".into(),
                    domains: vec!["*.google.com".into()],
                },
                DnsRule {
                    proto: "udp".into(),
                    address: "8.8.8.8:53".into(),
                    domains: vec!["domain:youtube.com".into()],
                },
            ],
            block: vec!["ads.example.com".into(), "198.51.100.0/24".into()],
            outbound: vec![OutboundRule {
                name: "hk-01".into(),
                protocol: "shadowsocks".into(),
                address: "hk.relay.net".into(),
                port: 8388,
                password: "pw".into(),
                rules: vec!["domain:netflix.com".into()],
            }],
        }
    }

    #[test]
    fn test_roundtrip() {
        let record = full_record();
        let bytes = record.encode().unwrap();
        assert_eq!(ConfigRecord::decode(&bytes).unwrap(), record);
    }

    #[test]
    fn test_wire_field_names() {
        let json = String::from_utf8(full_record().encode().unwrap()).unwrap();
        for key in [
            "\"NodeSecret\"",
            "\"NodePullInterval\"",
            "\"NodePushInterval\"",
            "\"TrafficReportThreshold\"",
            "\"IPStrategy\"",
            "\"DNS\"",
            "\"Block\"",
            "\"Outbound\"",
            "\"proto\"",
            "\"domains\"",
            "\"password\"",
        ] {
            assert!(json.contains(key), "missing {key} in {json}");
        }
    }

    #[test]
    fn test_field_order_is_irrelevant() {
        let a = br#"{"NodePushInterval":10,"NodePullInterval":20}"#;
        let b = br#"{"NodePullInterval":20,"NodePushInterval":10}"#;
        assert_eq!(
            ConfigRecord::decode(a).unwrap(),
            ConfigRecord::decode(b).unwrap()
        );
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let json = br#"{
            "NodeSecret": "k",
            "QuicCongestion": "bbr",
            "Outbound": [{"name":"a","protocol":"vless","address":"h","port":443,"flow":"xtls"}]
        }"#;
        let record = ConfigRecord::decode(json).unwrap();
        assert_eq!(record.outbound.len(), 1);
        assert_eq!(record.outbound[0].port(), 443);
    }

    #[test]
    fn test_missing_and_null_fields_decode_to_zero() {
        let record = ConfigRecord::decode(b"{}").unwrap();
        assert_eq!(record, ConfigRecord::default());

        let json = br#"{"NodeSecret":null,"DNS":null,"Block":null,"Outbound":null,"IPStrategy":null}"#;
        let record = ConfigRecord::decode(json).unwrap();
        assert_eq!(record, ConfigRecord::default());
    }

    #[test]
    fn test_malformed_payload() {
        let cases: [&[u8]; 4] = [b"not json", b"[1,2,3]", br#"{"Block":"ads.example.com"}"#, b""];
        for bad in cases {
            assert!(matches!(
                ConfigRecord::decode(bad),
                Err(CodecError::MalformedPayload(_))
            ));
        }

        let wrong_type = br#"{"Outbound":[{"name":"a","port":"443"}]}"#;
        assert!(matches!(
            ConfigRecord::decode(wrong_type),
            Err(CodecError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_schema_violation_duplicate_outbound() {
        let json = br#"{"Outbound":[
            {"name":"a","protocol":"vless","address":"h1","port":443},
            {"name":"a","protocol":"vless","address":"h2","port":443}
        ]}"#;
        assert!(matches!(
            ConfigRecord::decode(json),
            Err(CodecError::SchemaViolation(_))
        ));
    }

    #[test]
    fn test_schema_violation_port_range() {
        let json = br#"{"Outbound":[{"name":"a","protocol":"vless","address":"h","port":70000}]}"#;
        assert!(matches!(
            ConfigRecord::decode(json),
            Err(CodecError::SchemaViolation(_))
        ));
    }

    #[test]
    fn test_encode_refuses_invalid_record() {
        let mut record = full_record();
        record.outbound.push(record.outbound[0].clone());
        assert!(matches!(
            record.encode(),
            Err(CodecError::SchemaViolation(_))
        ));
    }

    #[test]
    fn test_nested_rule_codec() {
        let rule = DnsRule::decode(br#"{"proto":"tcp","address":"9.9.9.9"}"#).unwrap();
        assert!(rule.domains.is_empty());
        assert!(DnsRule::decode(br#"{"address":"9.9.9.9"}"#).is_err());
    }
}
