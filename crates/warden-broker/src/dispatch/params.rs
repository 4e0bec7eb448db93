//! Payload extraction helpers.

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::errors::BrokerError;

/// Deserialize the whole payload into `T`.
pub fn parse<T: DeserializeOwned>(payload: Value) -> Result<T, BrokerError> {
    serde_json::from_value(payload).map_err(|e| BrokerError::invalid_params(format!("invalid payload: {e}")))
}

/// Required field of any type.
pub fn require<'a>(payload: &'a Value, key: &str) -> Result<&'a Value, BrokerError> {
    payload
        .get(key)
        .filter(|v| !v.is_null())
        .ok_or_else(|| BrokerError::invalid_params(format!("missing required field '{key}'")))
}

/// Required non-empty string field.
pub fn require_str<'a>(payload: &'a Value, key: &str) -> Result<&'a str, BrokerError> {
    let value = require(payload, key)?
        .as_str()
        .ok_or_else(|| BrokerError::invalid_params(format!("field '{key}' must be a string")))?;
    if value.is_empty() {
        return Err(BrokerError::invalid_params(format!("field '{key}' must not be empty")));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Sample {
        parent_address: String,
        #[serde(default)]
        create_new: bool,
    }

    #[test]
    fn parse_camel_case() {
        let s: Sample = parse(json!({"parentAddress": "0xab"})).unwrap();
        assert_eq!(s.parent_address, "0xab");
        assert!(!s.create_new);
    }

    #[test]
    fn parse_failure_is_invalid_params() {
        assert_matches!(parse::<Sample>(json!({})), Err(BrokerError::InvalidParams { message }) if message.contains("parentAddress"));
        assert_matches!(parse::<Sample>(Value::Null), Err(BrokerError::InvalidParams { .. }));
    }

    #[test]
    fn require_str_checks() {
        let payload = json!({"chain": "polkadot", "n": 1, "empty": "", "nil": null});
        assert_eq!(require_str(&payload, "chain").unwrap(), "polkadot");
        assert_matches!(require_str(&payload, "n"), Err(BrokerError::InvalidParams { message }) if message.contains("string"));
        assert_matches!(require_str(&payload, "empty"), Err(BrokerError::InvalidParams { .. }));
        assert_matches!(require(&payload, "nil"), Err(BrokerError::InvalidParams { .. }));
        assert_matches!(require(&Value::Null, "chain"), Err(BrokerError::InvalidParams { .. }));
    }
}
