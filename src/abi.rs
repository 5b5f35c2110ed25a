use alloy_dyn_abi::{DynSolType, DynSolValue, EventExt, JsonAbiExt, Specifier};
use alloy_json_abi::JsonAbi;
use serde::Serialize;

use crate::errors::{EngineError, EngineResult};
use crate::storage::Storage;
use crate::types::B256;

/// Solidity's builtin `Error(string)` selector.
const ERROR_STRING_SELECTOR: [u8; 4] = [0x08, 0xc3, 0x79, 0xa0];
/// Solidity's builtin `Panic(uint256)` selector.
const PANIC_SELECTOR: [u8; 4] = [0x4e, 0x48, 0x7b, 0x71];

#[derive(Clone, Debug, Serialize)]
pub struct DecodedCall {
    pub function: String,
    pub signature: String,
    pub args: serde_json::Value,
}

#[derive(Clone, Debug, Serialize)]
pub struct DecodedEvent {
    pub event: String,
    pub signature: String,
    pub args: serde_json::Value,
}

#[derive(Clone, Debug, Serialize)]
pub struct DecodedError {
    pub error: String,
    pub args: serde_json::Value,
}

/// ABI helpers over the stored-ABI table: callers upload ABI documents
/// once, then decode calldata, logs, and revert data against everything
/// stored plus the Solidity builtins.
#[derive(Clone)]
pub struct AbiStore {
    storage: Storage,
}

impl AbiStore {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Validates and stores an ABI document, returning its content hash.
    pub fn store(&self, abi: &serde_json::Value) -> EngineResult<B256> {
        let parsed: JsonAbi = serde_json::from_value(abi.clone())
            .map_err(|err| EngineError::InvalidInput(format!("invalid ABI: {err}")))?;
        if parsed.len() == 0 {
            return Err(EngineError::InvalidInput("empty ABI".into()));
        }
        self.storage.store_abi(abi)
    }

    pub fn get(&self, hash: &B256) -> EngineResult<Option<serde_json::Value>> {
        self.storage.read_abi(hash)
    }

    pub fn query(&self, limit: usize) -> EngineResult<Vec<(B256, serde_json::Value)>> {
        self.storage.query_abis(limit)
    }

    /// Decodes calldata against the stored ABIs by function selector.
    pub fn decode_call(&self, data: &[u8]) -> EngineResult<DecodedCall> {
        if data.len() < 4 {
            return Err(EngineError::InvalidInput(
                "calldata shorter than a selector".into(),
            ));
        }
        for abi in self.parsed_abis()? {
            for function in abi.functions() {
                if function.selector().as_slice() == &data[..4] {
                    let values = function
                        .abi_decode_input(&data[4..], true)
                        .map_err(|err| {
                            EngineError::InvalidInput(format!("calldata decode: {err}"))
                        })?;
                    return Ok(DecodedCall {
                        function: function.name.clone(),
                        signature: function.signature(),
                        args: values_to_json(&values),
                    });
                }
            }
        }
        Err(EngineError::NotFound(format!(
            "no stored ABI matches selector 0x{}",
            hex::encode(&data[..4])
        )))
    }

    /// Decodes an event log against the stored ABIs by topic0.
    pub fn decode_event(&self, topics: &[B256], data: &[u8]) -> EngineResult<DecodedEvent> {
        let Some(topic0) = topics.first() else {
            return Err(EngineError::InvalidInput("log has no topics".into()));
        };
        for abi in self.parsed_abis()? {
            for event in abi.events() {
                if event.selector() == *topic0 {
                    let decoded = event
                        .decode_log_parts(topics.iter().copied(), data, true)
                        .map_err(|err| EngineError::InvalidInput(format!("log decode: {err}")))?;
                    let mut values = decoded.indexed;
                    values.extend(decoded.body);
                    return Ok(DecodedEvent {
                        event: event.name.clone(),
                        signature: event.signature(),
                        args: values_to_json(&values),
                    });
                }
            }
        }
        Err(EngineError::NotFound(format!(
            "no stored ABI matches topic {topic0}"
        )))
    }

    /// Decodes revert data: the Solidity builtins first, then stored
    /// custom errors.
    pub fn decode_error(&self, data: &[u8]) -> EngineResult<DecodedError> {
        if data.len() >= 4 {
            if data[..4] == ERROR_STRING_SELECTOR {
                return decode_single(&data[4..], "string", "Error");
            }
            if data[..4] == PANIC_SELECTOR {
                return decode_single(&data[4..], "uint256", "Panic");
            }
            for abi in self.parsed_abis()? {
                for error in abi.errors() {
                    if error.selector().as_slice() == &data[..4] {
                        let types: Result<Vec<DynSolType>, _> =
                            error.inputs.iter().map(|param| param.resolve()).collect();
                        let tuple = DynSolType::Tuple(types.map_err(|err| {
                            EngineError::InvalidInput(format!("unresolvable error ABI: {err}"))
                        })?);
                        let value = tuple.abi_decode_params(&data[4..]).map_err(|err| {
                            EngineError::InvalidInput(format!("revert decode: {err}"))
                        })?;
                        let args = match value {
                            DynSolValue::Tuple(values) => values_to_json(&values),
                            other => values_to_json(&[other]),
                        };
                        return Ok(DecodedError {
                            error: error.name.clone(),
                            args,
                        });
                    }
                }
            }
        }
        Err(EngineError::NotFound(format!(
            "no known error matches revert data 0x{}",
            hex::encode(data)
        )))
    }

    fn parsed_abis(&self) -> EngineResult<Vec<JsonAbi>> {
        let mut parsed = Vec::new();
        for (_, value) in self.storage.query_abis(usize::MAX)? {
            if let Ok(abi) = serde_json::from_value::<JsonAbi>(value) {
                parsed.push(abi);
            }
        }
        Ok(parsed)
    }
}

fn decode_single(data: &[u8], kind: &str, name: &str) -> EngineResult<DecodedError> {
    let tuple = DynSolType::Tuple(vec![kind.parse().expect("valid builtin type")]);
    let value = tuple
        .abi_decode_params(data)
        .map_err(|err| EngineError::InvalidInput(format!("revert decode: {err}")))?;
    let args = match value {
        DynSolValue::Tuple(values) => values_to_json(&values),
        other => values_to_json(&[other]),
    };
    Ok(DecodedError {
        error: name.into(),
        args,
    })
}

fn values_to_json(values: &[DynSolValue]) -> serde_json::Value {
    serde_json::Value::Array(values.iter().map(value_to_json).collect())
}

fn value_to_json(value: &DynSolValue) -> serde_json::Value {
    use serde_json::Value;
    match value {
        DynSolValue::Bool(b) => Value::Bool(*b),
        DynSolValue::Int(i, _) => Value::String(i.to_string()),
        DynSolValue::Uint(u, _) => Value::String(u.to_string()),
        DynSolValue::FixedBytes(bytes, size) => {
            Value::String(format!("0x{}", hex::encode(&bytes.as_slice()[..*size])))
        }
        DynSolValue::Address(address) => Value::String(address.to_string()),
        DynSolValue::Function(f) => Value::String(f.to_string()),
        DynSolValue::Bytes(bytes) => Value::String(format!("0x{}", hex::encode(bytes))),
        DynSolValue::String(s) => Value::String(s.clone()),
        DynSolValue::Array(values) | DynSolValue::FixedArray(values) => {
            Value::Array(values.iter().map(value_to_json).collect())
        }
        DynSolValue::Tuple(values) => Value::Array(values.iter().map(value_to_json).collect()),
    }
}
