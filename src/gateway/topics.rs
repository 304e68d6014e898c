//! Pure topic encode/decode, split out from the transport so the table in
//! spec.md §6 is exercised by ordinary unit tests.

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("no decoder registered for topic {0}")]
    UnknownTopic(String),
    #[error("malformed payload {payload:?} on topic {topic}")]
    MalformedPayload { topic: String, payload: String },
}

/// One parsed inbound message, in the core's 0-based module/cell indexing.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    ModuleUptime { module: u32, uptime_ms: u64 },
    ModuleVoltage { module: u32, voltage: f64 },
    ModuleTemps { module: u32, temp1: f64, temp2: f64 },
    ChipTemp { module: u32, temp: f64 },
    CellVoltage { module: u32, cell: u32, voltage: f64 },
    CellAccurateVoltage { module: u32, cell: u32, voltage: f64 },
    CellIsBalancing { module: u32, cell: u32, balancing: bool },
    TotalVoltage(f64),
    TotalCurrent(f64),
    BalancingEnabledSet(bool),
    /// `None` means the source sent the literal string `"none"`.
    BalancingIgnoreSlavesSet(Vec<u32>),
}

fn parse_f64(topic: &str, payload: &str) -> Result<f64, DecodeError> {
    payload
        .trim()
        .parse()
        .map_err(|_| DecodeError::MalformedPayload {
            topic: topic.to_string(),
            payload: payload.to_string(),
        })
}

fn parse_u64(topic: &str, payload: &str) -> Result<u64, DecodeError> {
    payload
        .trim()
        .parse()
        .map_err(|_| DecodeError::MalformedPayload {
            topic: topic.to_string(),
            payload: payload.to_string(),
        })
}

/// 1-based slave id from a topic segment, converted to the core's 0-based
/// module index.
fn parse_module_index(topic: &str, segment: &str) -> Result<u32, DecodeError> {
    let one_based: u32 = segment.parse().map_err(|_| DecodeError::MalformedPayload {
        topic: topic.to_string(),
        payload: segment.to_string(),
    })?;
    one_based
        .checked_sub(1)
        .ok_or_else(|| DecodeError::MalformedPayload {
            topic: topic.to_string(),
            payload: segment.to_string(),
        })
}

/// Decode one inbound message per the table in spec.md §6. Unrecognized
/// topics are reported, never panicked on; malformed payloads likewise.
pub fn decode(topic: &str, payload: &str) -> Result<Inbound, DecodeError> {
    let segments: Vec<&str> = topic.split('/').collect();

    match segments.as_slice() {
        ["esp-module", n, "uptime"] => Ok(Inbound::ModuleUptime {
            module: parse_module_index(topic, n)?,
            uptime_ms: parse_u64(topic, payload)?,
        }),
        ["esp-module", n, "module_voltage"] => Ok(Inbound::ModuleVoltage {
            module: parse_module_index(topic, n)?,
            voltage: parse_f64(topic, payload)?,
        }),
        ["esp-module", n, "module_temps"] => {
            let module = parse_module_index(topic, n)?;
            let (t1, t2) =
                payload
                    .split_once(',')
                    .ok_or_else(|| DecodeError::MalformedPayload {
                        topic: topic.to_string(),
                        payload: payload.to_string(),
                    })?;
            Ok(Inbound::ModuleTemps {
                module,
                temp1: parse_f64(topic, t1)?,
                temp2: parse_f64(topic, t2)?,
            })
        }
        ["esp-module", n, "chip_temp"] => Ok(Inbound::ChipTemp {
            module: parse_module_index(topic, n)?,
            temp: parse_f64(topic, payload)?,
        }),
        ["esp-module", n, "cell", c, "voltage"] => Ok(Inbound::CellVoltage {
            module: parse_module_index(topic, n)?,
            cell: parse_module_index(topic, c)?,
            voltage: parse_f64(topic, payload)?,
        }),
        ["esp-module", n, "accurate", "cell", c, "voltage"] => Ok(Inbound::CellAccurateVoltage {
            module: parse_module_index(topic, n)?,
            cell: parse_module_index(topic, c)?,
            voltage: parse_f64(topic, payload)?,
        }),
        ["esp-module", n, "cell", c, "is_balancing"] => {
            let balancing = match payload.trim() {
                "1" => true,
                "0" => false,
                _ => {
                    return Err(DecodeError::MalformedPayload {
                        topic: topic.to_string(),
                        payload: payload.to_string(),
                    })
                }
            };
            Ok(Inbound::CellIsBalancing {
                module: parse_module_index(topic, n)?,
                cell: parse_module_index(topic, c)?,
                balancing,
            })
        }
        ["esp-total", "total_voltage"] => Ok(Inbound::TotalVoltage(parse_f64(topic, payload)?)),
        ["esp-total", "total_current"] => Ok(Inbound::TotalCurrent(parse_f64(topic, payload)?)),
        ["master", "core", "config", "balancing_enabled", "set"] => {
            match payload.trim() {
                "true" => Ok(Inbound::BalancingEnabledSet(true)),
                "false" => Ok(Inbound::BalancingEnabledSet(false)),
                _ => Err(DecodeError::MalformedPayload {
                    topic: topic.to_string(),
                    payload: payload.to_string(),
                }),
            }
        }
        ["master", "core", "config", "balancing_ignore_slaves", "set"] => {
            if payload.trim() == "none" {
                return Ok(Inbound::BalancingIgnoreSlavesSet(Vec::new()));
            }
            let mut ids = Vec::new();
            for part in payload.split(',') {
                ids.push(parse_module_index(topic, part.trim())?);
            }
            Ok(Inbound::BalancingIgnoreSlavesSet(ids))
        }
        _ => Err(DecodeError::UnknownTopic(topic.to_string())),
    }
}

/// Module topics are addressed by 1-based slave id.
pub fn module_topic(module_index: u32, suffix: &str) -> String {
    format!("esp-module/{}/{}", module_index + 1, suffix)
}

pub fn cell_balance_request_topic(module_index: u32, cell_index: u32) -> String {
    format!(
        "esp-module/{}/cell/{}/balance_request",
        module_index + 1,
        cell_index + 1
    )
}

pub fn read_accurate_topic(module_index: u32) -> String {
    module_topic(module_index, "read_accurate")
}

pub fn set_config_topic(module_index: u32) -> String {
    module_topic(module_index, "set_config")
}

pub fn min_cell_voltage_topic(module_index: u32) -> String {
    module_topic(module_index, "min_cell_voltage")
}

pub fn max_cell_voltage_topic(module_index: u32) -> String {
    module_topic(module_index, "max_cell_voltage")
}

/// `on`/`off` for relay-set topics (`master/relays/.../set`).
pub fn format_relay_state(open: bool) -> &'static str {
    if open {
        "off"
    } else {
        "on"
    }
}

/// `"none"` or a comma-separated id list, per
/// `master/core/config/balancing_ignore_slaves` (1-based on the wire).
pub fn format_ignore_slaves(module_indices: &[u32]) -> String {
    if module_indices.is_empty() {
        return "none".to_string();
    }
    module_indices
        .iter()
        .map(|i| (i + 1).to_string())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_module_uptime_with_one_based_to_zero_based_conversion() {
        let msg = decode("esp-module/1/uptime", "1234").unwrap();
        assert_eq!(
            msg,
            Inbound::ModuleUptime {
                module: 0,
                uptime_ms: 1234
            }
        );
    }

    #[test]
    fn decodes_cell_voltage() {
        let msg = decode("esp-module/3/cell/5/voltage", "3.712").unwrap();
        assert_eq!(
            msg,
            Inbound::CellVoltage {
                module: 2,
                cell: 4,
                voltage: 3.712
            }
        );
    }

    #[test]
    fn decodes_accurate_cell_voltage() {
        let msg = decode("esp-module/1/accurate/cell/1/voltage", "3.812").unwrap();
        assert_eq!(
            msg,
            Inbound::CellAccurateVoltage {
                module: 0,
                cell: 0,
                voltage: 3.812
            }
        );
    }

    #[test]
    fn decodes_is_balancing() {
        assert_eq!(
            decode("esp-module/1/cell/1/is_balancing", "1").unwrap(),
            Inbound::CellIsBalancing {
                module: 0,
                cell: 0,
                balancing: true
            }
        );
        assert_eq!(
            decode("esp-module/1/cell/1/is_balancing", "0").unwrap(),
            Inbound::CellIsBalancing {
                module: 0,
                cell: 0,
                balancing: false
            }
        );
    }

    #[test]
    fn decodes_ignore_slaves_none_and_csv() {
        assert_eq!(
            decode(
                "master/core/config/balancing_ignore_slaves/set",
                "none"
            )
            .unwrap(),
            Inbound::BalancingIgnoreSlavesSet(vec![])
        );
        assert_eq!(
            decode(
                "master/core/config/balancing_ignore_slaves/set",
                "1,3,7"
            )
            .unwrap(),
            Inbound::BalancingIgnoreSlavesSet(vec![0, 2, 6])
        );
    }

    #[test]
    fn malformed_payload_is_reported_not_panicked() {
        let err = decode("esp-total/total_voltage", "not-a-number").unwrap_err();
        assert!(matches!(err, DecodeError::MalformedPayload { .. }));
    }

    #[test]
    fn unknown_topic_is_reported() {
        let err = decode("some/other/topic", "1").unwrap_err();
        assert!(matches!(err, DecodeError::UnknownTopic(_)));
    }

    #[test]
    fn module_topic_uses_one_based_slave_id() {
        assert_eq!(module_topic(0, "module_voltage"), "esp-module/1/module_voltage");
        assert_eq!(cell_balance_request_topic(0, 0), "esp-module/1/cell/1/balance_request");
    }

    #[test]
    fn relay_state_formats_open_as_off() {
        assert_eq!(format_relay_state(true), "off");
        assert_eq!(format_relay_state(false), "on");
    }

    #[test]
    fn ignore_slaves_formats_empty_as_none() {
        assert_eq!(format_ignore_slaves(&[]), "none");
        assert_eq!(format_ignore_slaves(&[0, 2, 6]), "1,3,7");
    }
}
